use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snapresize::common::progress;
use snapresize::config::ResizeConfig;
use snapresize::error::ResizeError;
use snapresize::helper::{Helper, HelperArgs, HelperFilesystem};
use snapresize::loopdev::Losetup;
use snapresize::process::{DuctRunner, ProcessRunner};
use snapresize::resize::{
    FilesystemType, JobIdentity, MinimumSizeProgress, ResizeProgress, Resizer, ResizerFactory,
};
use snapresize::ui::{self, Stream, prelude::*};

/// Shrink snapshot volume images in place
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Activate debug mode
    #[arg(short, long, global = true)]
    debug: bool,

    /// Config file (defaults to /etc/snapresize/config.toml as root)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output format for events and results
    #[arg(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Identifies one volume image of one snapshot
#[derive(Args, Debug, Clone)]
struct VolumeArgs {
    /// Agent the snapshot belongs to
    agent: String,
    /// Snapshot epoch
    epoch: i64,
    /// Volume GUID
    guid: String,
    /// Image file extension, if the image has one
    #[arg(long)]
    extension: Option<String>,
    /// Skip the metadata lookup and use this filesystem type
    #[arg(long, value_enum)]
    filesystem: Option<FilesystemType>,
}

impl VolumeArgs {
    fn identity(&self) -> JobIdentity {
        let identity = JobIdentity::new(&self.agent, self.epoch, &self.guid);
        match &self.extension {
            Some(ext) => identity.with_extension(ext),
            None => identity,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Calculate the minimum size of a volume (blocks until done)
    MinSize(VolumeArgs),
    /// Check whether a volume's filesystem can be shrunk
    CanResize(VolumeArgs),
    /// Dry-run a resize to SIZE bytes
    SafetyRun {
        #[command(flatten)]
        volume: VolumeArgs,
        size: u64,
    },
    /// Background resize jobs
    Resize {
        #[command(subcommand)]
        command: ResizeCommands,
    },
    /// Background minimum-size calculations
    Calc {
        #[command(subcommand)]
        command: CalcCommands,
    },
    /// Verify that every external tool is installed
    CheckTools,

    #[command(
        name = "asset:snapshot:ext:calcminsize",
        aliases = [
            "asset:snapshot:ext2:calcminsize",
            "asset:snapshot:ext3:calcminsize",
            "asset:snapshot:ext4:calcminsize"
        ],
        hide = true
    )]
    ExtCalcMinSize(HelperArgs),
    #[command(name = "asset:snapshot:ntfs:calcminsize", hide = true)]
    NtfsCalcMinSize(HelperArgs),
    #[command(name = "asset:snapshot:xfs:calcminsize", hide = true)]
    XfsCalcMinSize(HelperArgs),
}

#[derive(Subcommand, Debug)]
enum ResizeCommands {
    /// Start shrinking the volume to SIZE bytes
    Start {
        #[command(flatten)]
        volume: VolumeArgs,
        size: u64,
    },
    /// Print the progress of the running resize
    Progress(VolumeArgs),
    /// Kill the running resize
    Stop(VolumeArgs),
    /// Follow the resize until it stops
    Watch {
        #[command(flatten)]
        volume: VolumeArgs,
        /// Seconds between polls
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
}

#[derive(Subcommand, Debug)]
enum CalcCommands {
    /// Start the minimum-size calculation
    Start(VolumeArgs),
    /// Print the state of the calculation
    Progress(VolumeArgs),
    /// Kill the calculation
    Stop(VolumeArgs),
    /// Follow the calculation until it finishes
    Watch {
        #[command(flatten)]
        volume: VolumeArgs,
        /// Seconds between polls
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
}

const REQUIRED_TOOLS: &[&str] = &[
    "losetup",
    "udevadm",
    "blockdev",
    "stat",
    "e2fsck",
    "resize2fs",
    "dumpe2fs",
    "ntfsresize",
];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    ui::set_debug_mode(cli.debug);

    if let Err(e) = run(cli).await {
        let code = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<ResizeError>())
            .map(|r| r.code());
        emit(
            Level::Error,
            "snapresize.failed",
            &format!("Error: {e:#}"),
            code.map(|c| serde_json::json!({ "code": c })),
        );
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let stream = if matches!(cli.command, Commands::CheckTools) {
        Stream::Split
    } else {
        Stream::Stderr
    };
    ui::init(cli.format, std::io::stderr().is_terminal(), stream);

    let config = ResizeConfig::load(cli.config.as_deref())?;
    ui::sink::set_log_file(config.log_file.clone())?;

    match cli.command {
        Commands::ExtCalcMinSize(args) => run_helper(config, HelperFilesystem::Ext, args).await,
        Commands::NtfsCalcMinSize(args) => run_helper(config, HelperFilesystem::Ntfs, args).await,
        Commands::XfsCalcMinSize(args) => run_helper(config, HelperFilesystem::Xfs, args).await,
        Commands::CheckTools => check_tools(),
        Commands::MinSize(volume) => min_size(&open_factory(config)?, &volume).await,
        Commands::CanResize(volume) => {
            let ok = with_resizer(&open_factory(config)?, &volume, |r| r.can_resize()).await?;
            print_value("canResize", ok, if ok { "yes" } else { "no" })
        }
        Commands::SafetyRun { volume, size } => {
            let factory = open_factory(config)?;
            let ok = with_resizer(&factory, &volume, move |r| r.resize_safety_run(size)).await?;
            print_value("safe", ok, if ok { "safe" } else { "not safe" })
        }
        Commands::Resize { command } => handle_resize(open_factory(config)?, command).await,
        Commands::Calc { command } => handle_calc(open_factory(config)?, command).await,
    }
}

/// Loop devices need root, so re-run through sudo first if needed.
fn open_factory(config: ResizeConfig) -> Result<ResizerFactory> {
    sudo::escalate_if_needed().map_err(|e| anyhow!("Failed to escalate privileges: {e}"))?;
    Ok(ResizerFactory::from_config(config))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("worker thread panicked")?
}

fn open(factory: &ResizerFactory, volume: &VolumeArgs) -> Result<Box<dyn Resizer>> {
    let identity = volume.identity();
    let resizer = match volume.filesystem {
        Some(filesystem) => factory.for_type(filesystem, identity),
        None => factory.create(identity)?,
    };
    Ok(resizer)
}

/// Open the volume's resizer on a blocking thread and run `op` on it.
async fn with_resizer<T, F>(factory: &ResizerFactory, volume: &VolumeArgs, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn Resizer) -> snapresize::Result<T> + Send + 'static,
{
    let factory = factory.clone();
    let volume = volume.clone();
    blocking(move || {
        let mut resizer = open(&factory, &volume)?;
        Ok(op(resizer.as_mut())?)
    })
    .await
}

async fn min_size(factory: &ResizerFactory, volume: &VolumeArgs) -> Result<()> {
    let spinner = progress::create_spinner(format!(
        "Calculating minimum size of {}",
        volume.identity()
    ));
    let result = with_resizer(factory, volume, |r| r.calculate_minimum_size()).await;
    spinner.finish_and_clear();
    let minimum = result?;
    print_value("minimumVolumeSize", minimum, &format!("{minimum} bytes"))
}

async fn handle_resize(factory: ResizerFactory, command: ResizeCommands) -> Result<()> {
    match command {
        ResizeCommands::Start { volume, size } => {
            let launched = with_resizer(&factory, &volume, move |r| r.resize_to_size(size)).await?;
            report_start(launched, "Resize", &volume)
        }
        ResizeCommands::Progress(volume) => {
            let p = with_resizer(&factory, &volume, |r| r.generate_progress()).await?;
            print_resize_progress(&p)
        }
        ResizeCommands::Stop(volume) => {
            with_resizer(&factory, &volume, |r| r.stop_resize()).await?;
            emit(
                Level::Success,
                "snapresize.resize.stopped",
                &format!("Resize of {} stopped", volume.identity()),
                None,
            );
            Ok(())
        }
        ResizeCommands::Watch { volume, interval } => {
            watch_resize(factory, volume, Duration::from_secs(interval.max(1))).await
        }
    }
}

async fn handle_calc(factory: ResizerFactory, command: CalcCommands) -> Result<()> {
    match command {
        CalcCommands::Start(volume) => {
            let launched =
                with_resizer(&factory, &volume, |r| r.calculate_minimum_size_start()).await?;
            report_start(launched, "Minimum size calculation", &volume)
        }
        CalcCommands::Progress(volume) => {
            let p = with_resizer(&factory, &volume, |r| r.calculate_minimum_size_progress()).await?;
            print_calc_progress(&p)
        }
        CalcCommands::Stop(volume) => {
            with_resizer(&factory, &volume, |r| r.stop_minimum_size_calculation()).await?;
            emit(
                Level::Success,
                "snapresize.calc.stopped",
                &format!("Minimum size calculation for {} stopped", volume.identity()),
                None,
            );
            Ok(())
        }
        CalcCommands::Watch { volume, interval } => {
            watch_calc(factory, volume, Duration::from_secs(interval.max(1))).await
        }
    }
}

fn report_start(launched: bool, what: &str, volume: &VolumeArgs) -> Result<()> {
    if !launched {
        return Err(anyhow!("{what} for {} could not be started", volume.identity()));
    }
    emit(
        Level::Success,
        "snapresize.job.started",
        &format!("{what} for {} started", volume.identity()),
        None,
    );
    Ok(())
}

/// Poll the resize on a timer until the job stops or the user interrupts.
/// Interrupting only stops watching; the job keeps running.
async fn watch_resize(factory: ResizerFactory, volume: VolumeArgs, interval: Duration) -> Result<()> {
    let bar = progress::create_percent_bar();
    loop {
        let p = with_resizer(&factory, &volume, |r| r.generate_progress()).await?;
        progress::set_stage(&bar, p.stage(), p.percent());
        if !p.running() {
            bar.finish_and_clear();
            return print_resize_progress(&p);
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                bar.abandon();
                emit(Level::Info, "snapresize.watch.detached", "Stopped watching; the resize keeps running", None);
                return Ok(());
            }
        }
    }
}

async fn watch_calc(factory: ResizerFactory, volume: VolumeArgs, interval: Duration) -> Result<()> {
    let bar = progress::create_percent_bar();
    loop {
        let p = with_resizer(&factory, &volume, |r| r.calculate_minimum_size_progress()).await?;
        progress::set_stage(&bar, Some(p.stage().as_str()), Some(p.percent_complete()));
        if !p.running() {
            bar.finish_and_clear();
            return print_calc_progress(&p);
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                bar.abandon();
                emit(Level::Info, "snapresize.watch.detached", "Stopped watching; the calculation keeps running", None);
                return Ok(());
            }
        }
    }
}

fn print_value<T: serde::Serialize>(key: &str, value: T, text: &str) -> Result<()> {
    match get_output_format() {
        OutputFormat::Json => {
            let mut map = serde_json::Map::new();
            map.insert(key.to_string(), serde_json::to_value(value)?);
            println!("{}", serde_json::Value::Object(map));
        }
        OutputFormat::Text => println!("{text}"),
    }
    Ok(())
}

fn print_resize_progress(p: &ResizeProgress) -> Result<()> {
    match get_output_format() {
        OutputFormat::Json => println!("{}", serde_json::to_string(&p.to_map())?),
        OutputFormat::Text => {
            println!("{} {}", "Running:".bold(), p.running());
            println!("{} {}", "Stage:  ".bold(), p.stage().unwrap_or("-"));
            println!(
                "{} {}",
                "Percent:".bold(),
                p.percent().map_or_else(|| "-".to_string(), |v| format!("{v:.2}"))
            );
            if let Some(err) = p.std_err() {
                println!("{}\n{}", "Stderr:".bold(), err.trim_end());
            }
        }
    }
    Ok(())
}

fn print_calc_progress(p: &MinimumSizeProgress) -> Result<()> {
    match get_output_format() {
        OutputFormat::Json => println!("{}", serde_json::to_string(&p.to_map())?),
        OutputFormat::Text => {
            let stage = match p.stage().as_str() {
                "Complete" => p.stage().as_str().green(),
                "Failed" => p.stage().as_str().red(),
                other => other.normal(),
            };
            println!("{} {}", "Running:".bold(), p.running());
            println!("{} {}", "Stage:  ".bold(), stage);
            println!("{} {:.2}", "Percent:".bold(), p.percent_complete());
            println!("{} {} bytes", "Current:".bold(), p.current_volume_size());
            println!("{} {} bytes", "Minimum:".bold(), p.minimum_volume_size());
            println!("{} {} bytes", "Cluster:".bold(), p.cluster_size());
            if let Some(err) = p.std_err() {
                println!("{}\n{}", "Stderr:".bold(), err.trim_end());
            }
        }
    }
    Ok(())
}

async fn run_helper(config: ResizeConfig, filesystem: HelperFilesystem, args: HelperArgs) -> Result<()> {
    let code = blocking(move || {
        let runner: Arc<dyn ProcessRunner> = Arc::new(DuctRunner::new(config.tool_timeout()));
        let loops = Losetup::new(runner.clone());
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        Helper::new(runner.as_ref(), &loops).run(filesystem, &args, &mut out)
    })
    .await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn check_tools() -> Result<()> {
    let mut missing = Vec::new();
    for tool in REQUIRED_TOOLS {
        match which::which(tool) {
            Ok(path) => emit(
                Level::Success,
                "snapresize.tools.found",
                &format!("✓ {tool} ({})", path.display()),
                None,
            ),
            Err(_) => {
                emit(
                    Level::Warn,
                    "snapresize.tools.missing",
                    &format!("✗ {tool} not found on PATH"),
                    None,
                );
                missing.push(*tool);
            }
        }
    }
    if !missing.is_empty() {
        return Err(anyhow!("missing tools: {}", missing.join(", ")));
    }
    Ok(())
}
