use colored::*;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warn,
    Error,
    Debug,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Success => "success",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Debug => "debug",
        }
    }
}

/// Where non-error events go. Helper subcommands use `Stderr` because their
/// stdout is parsed by whoever polls the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Split,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct Renderer {
    pub format: OutputFormat,
    pub color: bool,
    pub stream: Stream,
}

impl Renderer {
    const fn new() -> Self {
        Self {
            format: OutputFormat::Text,
            color: true,
            stream: Stream::Split,
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

static RENDERER: RwLock<Renderer> = RwLock::new(Renderer::new());

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);

pub fn set_debug_mode(enabled: bool) {
    DEBUG_MODE.store(enabled, Ordering::Relaxed);
}

pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

pub fn init(format: OutputFormat, color: bool, stream: Stream) {
    if let Ok(mut r) = RENDERER.write() {
        r.format = format;
        r.color = color;
        r.stream = stream;
    }
}

fn current() -> Renderer {
    RENDERER.read().map(|r| r.clone()).unwrap_or_default()
}

#[derive(Serialize)]
pub(crate) struct Event<'a> {
    level: &'a str,
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a serde_json::Value>,
}

fn colorize(level: Level, s: &str, enable: bool) -> String {
    if !enable {
        return s.to_string();
    }
    match level {
        Level::Info => s.normal().to_string(),
        Level::Success => s.green().bold().to_string(),
        Level::Warn => s.yellow().bold().to_string(),
        Level::Error => s.red().bold().to_string(),
        Level::Debug => s.cyan().to_string(),
    }
}

fn render(r: &Renderer, level: Level, code: &str, message: &str, data: Option<&serde_json::Value>) -> String {
    match r.format {
        OutputFormat::Text => colorize(level, message, r.color),
        OutputFormat::Json => {
            let ev = Event {
                level: level.as_str(),
                code,
                message,
                data,
            };
            serde_json::to_string(&ev).unwrap_or_else(|_| message.to_string())
        }
    }
}

/// Emit one event. `code` identifies the call site and is stable across releases.
pub fn emit(level: Level, code: &str, message: &str, data: Option<serde_json::Value>) {
    if level == Level::Debug && !is_debug_enabled() {
        return;
    }

    let r = current();
    let line = render(&r, level, code, message, data.as_ref());
    let to_stderr = matches!(level, Level::Error | Level::Warn) || r.stream == Stream::Stderr;
    let mut out: Box<dyn Write> = if to_stderr {
        Box::new(io::stderr())
    } else {
        Box::new(io::stdout())
    };
    let _ = writeln!(out, "{}", line);

    sink::record(level.as_str(), code, message, data.as_ref());
}

pub fn get_output_format() -> OutputFormat {
    current().format
}

pub mod prelude {
    pub use super::{Level, OutputFormat, emit, get_output_format};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_events_carry_code_and_data() {
        let r = Renderer {
            format: OutputFormat::Json,
            color: false,
            stream: Stream::Split,
        };
        let data = serde_json::json!({ "device": "/dev/loop3" });
        let line = render(&r, Level::Error, "resize.loop.setup_failed", "boom", Some(&data));
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["level"], "error");
        assert_eq!(parsed["code"], "resize.loop.setup_failed");
        assert_eq!(parsed["data"]["device"], "/dev/loop3");
    }

    #[test]
    fn text_without_color_is_the_bare_message() {
        let r = Renderer {
            format: OutputFormat::Text,
            color: false,
            stream: Stream::Stderr,
        };
        assert_eq!(render(&r, Level::Success, "x", "done", None), "done");
    }
}
