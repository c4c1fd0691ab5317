//! Progress snapshots for running jobs, plus the fixed-format text protocol
//! the minimum-size helpers print and the pollers parse back.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const STAGE_COMPLETE: &str = "Complete";

/// Lines printed by the `calcminsize` helpers
pub mod markers {
    pub const SUCCESS: &str = "Successfully calculated minimum filesystem size";
    pub const ESTIMATED: &str = "Estimated minimum filesystem size";
    pub const CANNOT_RESIZE: &str = "cannot be resized";
    pub const CHECKING_ATTEMPT: &str = "Checking attempt";
    pub const SUCCESS_ON_ATTEMPT: &str = "Success on attempt";
    pub const UNABLE_TO_CALCULATE: &str = "Unable to calculate a minimum size after";
}

/// State of a resize-to-size job, rebuilt from its output on every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeProgress {
    running: bool,
    stage: Option<String>,
    percent: Option<f64>,
    std_err: Option<String>,
}

impl ResizeProgress {
    pub fn new(
        running: bool,
        stage: Option<String>,
        percent: Option<f64>,
        std_err: Option<String>,
    ) -> Self {
        Self {
            running,
            stage,
            percent,
            std_err,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    pub fn percent(&self) -> Option<f64> {
        self.percent
    }

    pub fn std_err(&self) -> Option<&str> {
        self.std_err.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.stage.as_deref() == Some(STAGE_COMPLETE)
    }

    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalculationStage {
    NotStarted,
    Running,
    Complete,
    Failed,
}

impl CalculationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            CalculationStage::NotStarted => "NotStarted",
            CalculationStage::Running => "Running",
            CalculationStage::Complete => "Complete",
            CalculationStage::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CalculationStage::Complete | CalculationStage::Failed)
    }
}

impl std::fmt::Display for CalculationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Volume sizes reported by a helper, all in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeReport {
    pub current: u64,
    pub minimum: u64,
    pub cluster: u64,
}

static CURRENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Current volume size: (\d+) bytes").expect("valid regex"));
static MINIMUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Minimum volume size: (\d+) bytes").expect("valid regex"));
static CLUSTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Cluster size: (\d+) bytes").expect("valid regex"));

fn last_capture(re: &Regex, text: &str) -> Option<u64> {
    re.captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

impl SizeReport {
    /// The block printed after `headline` by every helper.
    pub fn render(&self, headline: &str) -> String {
        format!(
            "{headline}\nCurrent volume size: {} bytes\nMinimum volume size: {} bytes\nCluster size: {} bytes\n",
            self.current, self.minimum, self.cluster
        )
    }

    /// All three size lines, or `None` if any is missing.
    pub fn parse(output: &str) -> Option<Self> {
        Some(Self {
            current: last_capture(&CURRENT_RE, output)?,
            minimum: last_capture(&MINIMUM_RE, output)?,
            cluster: last_capture(&CLUSTER_RE, output)?,
        })
    }

    /// Whatever size lines are present, zero for the rest.
    pub fn parse_partial(output: &str) -> Self {
        Self {
            current: last_capture(&CURRENT_RE, output).unwrap_or(0),
            minimum: last_capture(&MINIMUM_RE, output).unwrap_or(0),
            cluster: last_capture(&CLUSTER_RE, output).unwrap_or(0),
        }
    }
}

/// What a poller could tell from helper output alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalculationOutcome {
    pub stage: CalculationStage,
    pub percent: f64,
    pub sizes: SizeReport,
}

impl CalculationOutcome {
    pub fn not_started() -> Self {
        Self::at(CalculationStage::NotStarted, 0.0)
    }

    pub fn at(stage: CalculationStage, percent: f64) -> Self {
        Self {
            stage,
            percent,
            sizes: SizeReport::default(),
        }
    }
}

/// Parse the output of a single-shot helper (ext, xfs). Anything that is
/// neither a failure nor a complete success block counts as still running.
pub fn parse_helper_output(stdout: Option<&str>, running: bool) -> CalculationOutcome {
    let Some(stdout) = stdout else {
        return if running {
            CalculationOutcome::at(CalculationStage::Running, 0.0)
        } else {
            CalculationOutcome::not_started()
        };
    };

    if stdout.contains(markers::CANNOT_RESIZE) {
        return CalculationOutcome::at(CalculationStage::Failed, 0.0);
    }

    if stdout.contains(markers::SUCCESS)
        && let Some(sizes) = SizeReport::parse(stdout)
    {
        return CalculationOutcome {
            stage: CalculationStage::Complete,
            percent: 100.0,
            sizes,
        };
    }

    CalculationOutcome::at(CalculationStage::Running, 0.0)
}

/// State of a minimum-size calculation, rebuilt from its output on every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimumSizeProgress {
    running: bool,
    stage: CalculationStage,
    percent_complete: f64,
    std_err: Option<String>,
    current_volume_size: u64,
    minimum_volume_size: u64,
    cluster_size: u64,
}

impl MinimumSizeProgress {
    pub fn new(running: bool, outcome: CalculationOutcome, std_err: Option<String>) -> Self {
        Self {
            running,
            stage: outcome.stage,
            percent_complete: outcome.percent,
            std_err,
            current_volume_size: outcome.sizes.current,
            minimum_volume_size: outcome.sizes.minimum,
            cluster_size: outcome.sizes.cluster,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn stage(&self) -> CalculationStage {
        self.stage
    }

    pub fn percent_complete(&self) -> f64 {
        self.percent_complete
    }

    pub fn std_err(&self) -> Option<&str> {
        self.std_err.as_deref()
    }

    pub fn current_volume_size(&self) -> u64 {
        self.current_volume_size
    }

    pub fn minimum_volume_size(&self) -> u64 {
        self.minimum_volume_size
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_progress_flattens_every_field() {
        let p = ResizeProgress::new(
            true,
            Some("Scanning inode table".into()),
            Some(50.0),
            Some("warning: something".into()),
        );
        let map = p.to_map();
        assert_eq!(map["running"], true);
        assert_eq!(map["stage"], "Scanning inode table");
        assert_eq!(map["percent"], 50.0);
        assert_eq!(map["stdErr"], "warning: something");

        let back: ResizeProgress = serde_json::from_value(serde_json::Value::Object(map)).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn minimum_size_progress_flattens_every_field() {
        let p = MinimumSizeProgress::new(
            false,
            CalculationOutcome {
                stage: CalculationStage::Complete,
                percent: 100.0,
                sizes: SizeReport {
                    current: 53687091200,
                    minimum: 21474836480,
                    cluster: 4096,
                },
            },
            None,
        );
        let map = p.to_map();
        assert_eq!(map["running"], false);
        assert_eq!(map["stage"], "Complete");
        assert_eq!(map["percentComplete"], 100.0);
        assert_eq!(map["stdErr"], serde_json::Value::Null);
        assert_eq!(map["currentVolumeSize"], 53687091200u64);
        assert_eq!(map["minimumVolumeSize"], 21474836480u64);
        assert_eq!(map["clusterSize"], 4096);

        let back: MinimumSizeProgress =
            serde_json::from_value(serde_json::Value::Object(map)).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn size_report_renders_what_it_parses() {
        let report = SizeReport {
            current: 10737418240,
            minimum: 2147483648,
            cluster: 4096,
        };
        let text = report.render(markers::SUCCESS);
        assert!(text.starts_with(markers::SUCCESS));
        assert!(text.contains("Cluster size: 4096 bytes"));
        assert_eq!(SizeReport::parse(&text), Some(report));
        assert_eq!(SizeReport::parse("Current volume size: 5 bytes"), None);
    }

    #[test]
    fn helper_output_states() {
        assert_eq!(
            parse_helper_output(None, false).stage,
            CalculationStage::NotStarted
        );
        assert_eq!(parse_helper_output(None, true).stage, CalculationStage::Running);
        assert_eq!(
            parse_helper_output(Some("Filesystem cannot be resized\n"), false).stage,
            CalculationStage::Failed
        );

        let running = parse_helper_output(Some("e2fsck 1.47.0\n"), true);
        assert_eq!(running.stage, CalculationStage::Running);
        assert_eq!(running.percent, 0.0);

        let done = SizeReport {
            current: 8589934592,
            minimum: 1073741824,
            cluster: 4096,
        }
        .render(markers::SUCCESS);
        let outcome = parse_helper_output(Some(&done), false);
        assert_eq!(outcome.stage, CalculationStage::Complete);
        assert_eq!(outcome.percent, 100.0);
        assert_eq!(outcome.sizes.minimum, 1073741824);
    }

    #[test]
    fn success_headline_without_sizes_is_still_running() {
        let outcome = parse_helper_output(Some(markers::SUCCESS), true);
        assert_eq!(outcome.stage, CalculationStage::Running);
    }
}
