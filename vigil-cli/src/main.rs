use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vigil_core::backend::StageBackend;
use vigil_core::config::{
    DEFAULT_PGIE_CONFIG, DEFAULT_SOURCE_COUNT, DEFAULT_TRACKER_CONFIG, PipelineConfig,
};
use vigil_core::error::{Result, VigilError};
use vigil_gst::GstBackend;
use vigil_pipeline::{Pipeline, RunReport, SimBackend, SimScript, SourceScript, StopReason};

/// Frames per source pushed by `--dry-run`.
const DRY_RUN_FRAMES: usize = 10;

#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    version,
    about = "Multi-source object detection and tracking on DeepStream",
    after_help = "Examples:\n  vigil --video-path sample_720p.mp4\n  vigil --video-path sample_720p.mp4 -n 4 --disable-tracker --json\n  vigil --video-path sample_720p.mp4 --dot-dir /tmp/graphs --sync\n  vigil --video-path sample_720p.mp4 --dry-run"
)]
struct Cli {
    /// Source media, reused for every source chain.
    #[arg(long = "video-path")]
    video_path: PathBuf,

    /// Primary inference (nvinfer) config file.
    #[arg(long = "pgie-config", default_value = DEFAULT_PGIE_CONFIG)]
    pgie_config: PathBuf,

    /// Tracker config file; only its [tracker] section is read.
    #[arg(long = "tracker-config", default_value = DEFAULT_TRACKER_CONFIG)]
    tracker_config: PathBuf,

    /// Number of source chains.
    #[arg(short = 'n', long = "n_sources", default_value_t = DEFAULT_SOURCE_COUNT)]
    n_sources: u32,

    /// Leave the tracker out of the batch region.
    #[arg(long = "disable-tracker", default_value_t = false)]
    disable_tracker: bool,

    /// Pace every sink to wall-clock timing.
    #[arg(long = "sync", default_value_t = false)]
    sync: bool,

    /// Directory for topology diagrams written once the pipeline plays.
    #[arg(long = "dot-dir", env = "GST_DEBUG_DUMP_DOT_DIR")]
    dot_dir: Option<PathBuf>,

    /// Print the result as one JSON object on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,

    /// Run the graph on the simulated backend instead of GStreamer.
    #[arg(long = "dry-run", default_value_t = false)]
    dry_run: bool,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            source_count: self.n_sources,
            media_path: self.video_path.clone(),
            pgie_config_path: self.pgie_config.clone(),
            tracker_config_path: self.tracker_config.clone(),
            tracker_enabled: !self.disable_tracker,
            sync_sinks: self.sync,
            dot_dump_dir: self.dot_dir.clone(),
            ..PipelineConfig::default()
        }
    }
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json = cli.json;

    let code = match run(cli) {
        Ok(report) => {
            print_report(&report, json);
            report.exit_code()
        }
        Err(err) => {
            if json {
                println!("{}", error_json(&err));
            } else {
                error!(error = %err, code = err.error_code(), "Pipeline construction failed");
            }
            err.error_code()
        }
    };
    std::process::exit(i32::from(code));
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn make_backend(dry_run: bool, sources: u32) -> Result<Arc<dyn StageBackend>> {
    if dry_run {
        info!(frames = DRY_RUN_FRAMES, sources, "Dry run on the simulated backend");
        let script = SimScript::with_sources(
            (0..sources)
                .map(|_| SourceScript::uniform(DRY_RUN_FRAMES, 1))
                .collect(),
        );
        return Ok(Arc::new(SimBackend::new(script)));
    }
    Ok(Arc::new(GstBackend::new()?))
}

/// Build, then play until end-of-stream, error or Ctrl-C.
fn run(cli: Cli) -> Result<RunReport> {
    let config = cli.pipeline_config();
    config.validate()?;

    let backend = make_backend(cli.dry_run, config.source_count)?;
    let pipeline = Pipeline::build(backend, &config)?;

    let rt = build_runtime()?;
    let report = rt.block_on(async move {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
                on_signal.cancel();
            }
        });
        pipeline.run(cancel).await
    });
    Ok(report)
}

fn print_report(report: &RunReport, json: bool) {
    if json {
        println!("{}", report.to_json());
        return;
    }
    match &report.outcome {
        StopReason::EndOfStream => println!("End-of-stream"),
        StopReason::Interrupted => info!("Run interrupted"),
        StopReason::Error(err) => {
            error!(error = %err, code = err.error_code(), "Pipeline stopped with an error")
        }
    }
    println!("Total count: {}", report.format_counts());
}

fn error_json(err: &VigilError) -> serde_json::Value {
    serde_json::json!({
        "outcome": "error",
        "error": err.to_string(),
        "error_code": err.error_code(),
    })
}
