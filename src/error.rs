use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResizeError {
    #[error("Failed to set up loop device for {path}: {source}")]
    LoopSetup {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to tear down loop device {device}: {source}")]
    LoopTeardown {
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("No loop device is bound for this volume")]
    NotBound,

    #[error("{tool} failed (exit status {status:?}): {stderr}")]
    ToolFailed {
        code: u32,
        event: &'static str,
        tool: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Could not find pattern '{pattern}' in tool output")]
    Parse { pattern: String, output: String },

    #[error("Filesystem cannot be resized: {0}")]
    CannotResize(String),

    #[error("Unable to calculate a minimum size after {attempts} attempts")]
    SearchExhausted { attempts: u32 },

    #[error("{operation} is not supported for {filesystem} filesystems")]
    Unsupported {
        filesystem: &'static str,
        operation: &'static str,
    },

    #[error("Unknown filesystem type '{0}'")]
    UnknownFilesystem(String),

    #[error("Snapshot metadata lookup failed: {0}")]
    Metadata(#[source] anyhow::Error),

    #[error("Background job {job} could not be controlled: {source}")]
    JobControl {
        job: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Background job {0} is already running")]
    JobInProgress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResizeError {
    /// Stable numeric code surfaced to callers alongside the message.
    pub fn code(&self) -> u32 {
        match self {
            ResizeError::LoopSetup { .. } => 1001,
            ResizeError::LoopTeardown { .. } => 1002,
            ResizeError::Parse { .. } => 1010,
            ResizeError::CannotResize(_) => 1020,
            ResizeError::SearchExhausted { .. } => 1021,
            ResizeError::Unsupported { .. } => 1030,
            ResizeError::UnknownFilesystem(_) => 1040,
            ResizeError::Metadata(_) => 1050,
            ResizeError::JobControl { .. } => 1060,
            ResizeError::JobInProgress(_) => 1061,
            ResizeError::Io(_) => 1070,
            ResizeError::NotBound => 1080,
            ResizeError::ToolFailed { code, .. } => *code,
        }
    }

    /// Contract violations by the caller, as opposed to runtime faults.
    pub fn is_logic_error(&self) -> bool {
        matches!(self, ResizeError::Unsupported { .. })
    }
}

pub type Result<T> = std::result::Result<T, ResizeError>;
