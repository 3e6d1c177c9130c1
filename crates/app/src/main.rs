use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracefront_core::backend::{self, Address, SimConfig, SimulatedBackend};
use tracefront_core::options::keys;
use tracefront_core::{BackupStore, Frontend, FrontendConfig, FrontendError, Options, ProcessRunner, State};
use tracing_subscriber::EnvFilter;

fn main() -> tracefront_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render(args) => run_render(&args),
        Commands::Inspect { state_file } => run_inspect(&state_file),
    }
}

fn load_config(path: Option<&Path>) -> tracefront_core::Result<FrontendConfig> {
    match path {
        Some(path) => FrontendConfig::load(path),
        None => Ok(FrontendConfig::default()),
    }
}

fn render_options(args: &RenderArgs) -> tracefront_core::Result<Options> {
    let mut opts = match &args.options {
        Some(path) => Options::from_json_str(&std::fs::read_to_string(path)?)?,
        None => Options::new(),
    };
    opts.set(keys::INPUT_FILE, args.input.to_string_lossy().into_owned());
    if let Some(output) = &args.output {
        opts.set(keys::OUTPUT_FILE, output.to_string_lossy().into_owned());
    }
    if let Some(width) = args.width {
        opts.set(keys::WIDTH, width);
    }
    if let Some(height) = args.height {
        opts.set(keys::HEIGHT, height);
    }
    if let Some(frames) = args.frames {
        opts.set(keys::INITIAL_FRAME, 1);
        opts.set(keys::FINAL_FRAME, i64::from(frames.max(1)));
    }
    if args.continue_trace {
        opts.set(keys::CONTINUE_TRACE, true);
    }
    Ok(opts)
}

fn run_render(args: &RenderArgs) -> tracefront_core::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let opts = render_options(args)?;
    let poll = Duration::from_millis(config.poll_interval_ms.max(1));
    tracing::info!(input = %args.input.display(), "starting render session");

    let sim = SimulatedBackend::new(Address(1), SimConfig::default());
    let runner = ProcessRunner::new(config.shellouts.permitted);
    let mut frontend = Frontend::new(Box::new(backend::spawn(sim, poll)), Box::new(runner), config);
    frontend.start(opts)?;

    let mut last_percent = None;
    loop {
        let state = frontend.process();
        let percent = frontend.log().percent_complete();
        if state == State::Rendering && last_percent != Some(percent) {
            tracing::info!(percent, "rendering");
            last_percent = Some(percent);
        }
        if state == State::Ready {
            break;
        }
        thread::sleep(poll);
    }

    let log = frontend.log();
    if !log.output_filename().is_empty() {
        tracing::info!(file = log.output_filename(), "output image");
    }
    if log.failed() || !log.succeeded() {
        let reason = log
            .error_messages()
            .last()
            .cloned()
            .unwrap_or_else(|| "render did not complete".to_owned());
        return Err(FrontendError::msg(reason));
    }
    Ok(())
}

fn run_inspect(state_file: &Path) -> tracefront_core::Result<()> {
    let state = BackupStore::inspect(state_file)?;
    println!("records:            {}", state.records);
    println!("intact bytes:       {}", state.valid_len);
    println!("next block:         {}", state.next_serial);
    match state.highest_contiguous() {
        Some(block) => println!("complete through:   {block}"),
        None => println!("complete through:   -"),
    }
    println!("out-of-order done:  {:?}", state.skip);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Render session front end", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct RenderArgs {
    /// Scene file to render.
    input: PathBuf,
    /// JSON file with render options.
    #[arg(long)]
    options: Option<PathBuf>,
    /// JSON front end configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    width: Option<i64>,
    #[arg(long)]
    height: Option<i64>,
    /// Output image file or directory.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Continue an interrupted render from its state file.
    #[arg(long = "continue")]
    continue_trace: bool,
    /// Render an animation of this many frames.
    #[arg(long)]
    frames: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a render session against the built-in simulated backend.
    Render(RenderArgs),
    /// Summarise a render state file.
    Inspect {
        /// Path to the `.tracefront-state` file.
        state_file: PathBuf,
    },
}
