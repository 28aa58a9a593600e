//! tabtrail captures browser activity to structured JSONL logs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tabtrail::config::{Config, VERSION};
use tabtrail::control::{Controller, DEFAULT_TIMEOUT};
use tabtrail::session::SessionManager;
use tabtrail_store::LogStore;

/// Capture Chrome browser activity to structured JSONL logs.
#[derive(Parser)]
#[command(name = "tabtrail", version = VERSION, about)]
#[command(long_about = "tabtrail connects to Chrome via the DevTools Protocol and captures\n\
browser activity (navigation, network requests, console messages, errors)\n\
to structured JSONL log files organized by site and tab.\n\n\
Example:\n\
  # Connect to existing Chrome (started with --remote-debugging-port=9222)\n\
  tabtrail\n\n\
  # Auto-launch Chrome with debugging enabled\n\
  tabtrail --launch\n\n\
  # Custom port and output directory\n\
  tabtrail --port 9223 --output ./my_logs")]
struct Cli {
    #[command(flatten)]
    observe: ObserveArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args)]
struct ObserveArgs {
    /// Chrome remote debugging port
    #[arg(short, long)]
    port: Option<u16>,

    /// Auto-launch Chrome with debugging enabled
    #[arg(long)]
    launch: bool,

    /// Output directory for log files
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Flush interval for log buffering
    #[arg(long, value_parser = humantime::parse_duration)]
    flush_interval: Option<Duration>,

    /// Buffer size per tab in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Enable header and body redaction
    #[arg(short, long)]
    redact: bool,

    /// Disable redaction
    #[arg(long)]
    no_redact: bool,

    /// Capture response bodies
    #[arg(long)]
    capture_bodies: bool,

    /// Max body size to capture in KB
    #[arg(long)]
    body_size_limit: Option<u64>,

    /// Enable network events
    #[arg(long)]
    network: bool,

    /// Disable network events
    #[arg(long)]
    no_network: bool,

    /// Enable console events
    #[arg(long)]
    console: bool,

    /// Disable console events
    #[arg(long)]
    no_console: bool,

    /// Enable error events
    #[arg(long)]
    errors: bool,

    /// Disable error events
    #[arg(long)]
    no_errors: bool,

    /// Enable page events
    #[arg(long)]
    page: bool,

    /// Disable page events
    #[arg(long)]
    no_page: bool,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Control the browser via CDP commands
    Control(ControlArgs),
}

#[derive(Args)]
struct ControlArgs {
    /// Chrome remote debugging port
    #[arg(short, long, default_value_t = 9222)]
    port: u16,

    /// Command timeout
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "30s")]
    timeout: Duration,

    #[command(subcommand)]
    action: ControlAction,
}

#[derive(Subcommand)]
enum ControlAction {
    /// Navigate to a URL
    Navigate {
        #[arg(long)]
        url: String,
    },
    /// Click an element
    Click {
        /// CSS selector of element to click
        #[arg(long)]
        selector: String,
    },
    /// Type text into an element
    Type {
        #[arg(long)]
        selector: String,
        #[arg(long)]
        text: String,
    },
    /// Evaluate JavaScript
    Eval {
        #[arg(long)]
        js: String,
    },
    /// Capture a screenshot
    Screenshot {
        /// Output file (use - for base64 stdout)
        #[arg(short, long, default_value = "screenshot.png")]
        output: String,
    },
    /// Get page title
    Title,
    /// Get current URL
    Url,
    /// Get text content of an element
    Text {
        #[arg(long)]
        selector: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Some(Command::Control(args)) => run_control(args).await,
        None => run_observer(cli.observe).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn resolve_config(args: &ObserveArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(port) = args.port {
        config.chrome_port = port;
    }
    if args.launch {
        config.auto_launch = true;
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(interval) = args.flush_interval {
        config.flush_interval = interval;
    }
    if let Some(size) = args.buffer_size {
        config.buffer_size = size;
    }
    if args.redact {
        config.redact = true;
    }
    if args.no_redact {
        config.redact = false;
    }
    if args.capture_bodies {
        config.capture_bodies = true;
    }
    if let Some(limit) = args.body_size_limit {
        config.body_size_limit_kb = limit;
    }
    if args.network {
        config.enable_network = true;
    }
    if args.no_network {
        config.enable_network = false;
    }
    if args.console {
        config.enable_console = true;
    }
    if args.no_console {
        config.enable_console = false;
    }
    if args.errors {
        config.enable_errors = true;
    }
    if args.no_errors {
        config.enable_errors = false;
    }
    if args.page {
        config.enable_page = true;
    }
    if args.no_page {
        config.enable_page = false;
    }

    config.validate()?;
    Ok(config)
}

async fn run_observer(args: ObserveArgs) -> Result<()> {
    let config = resolve_config(&args)?;

    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.output_dir.display()
        )
    })?;

    let store = Arc::new(
        LogStore::new(config.output_dir.clone())
            .with_flush_interval(config.flush_interval)
            .with_buffer_size(config.buffer_size),
    );

    info!(
        target: "tabtrail",
        version = VERSION,
        output = %config.output_dir.display(),
        port = config.chrome_port,
        launch = config.auto_launch,
        "starting observer"
    );

    let config = Arc::new(config);
    let manager = SessionManager::new(Arc::clone(&config), store);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "tabtrail", "received shutdown signal");
            signal_cancel.cancel();
        }
    });

    manager.run(cancel).await
}

async fn run_control(args: ControlArgs) -> Result<()> {
    let timeout = if args.timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        args.timeout
    };
    let controller = Controller::connect(args.port, timeout).await?;

    match args.action {
        ControlAction::Navigate { url } => {
            controller.navigate(&url).await?;
            println!("Navigated to: {url}");
        }
        ControlAction::Click { selector } => {
            controller.click(&selector).await?;
            println!("Clicked: {selector}");
        }
        ControlAction::Type { selector, text } => {
            controller.type_text(&selector, &text).await?;
            println!("Typed into {selector}: {text}");
        }
        ControlAction::Eval { js } => {
            println!("{}", controller.eval(&js).await?);
        }
        ControlAction::Screenshot { output } => {
            let data = controller.screenshot().await?;
            if output == "-" {
                use base64::engine::general_purpose::STANDARD;
                use base64::Engine as _;
                println!("{}", STANDARD.encode(&data));
            } else {
                std::fs::write(&output, &data)
                    .with_context(|| format!("failed to write {output}"))?;
                println!("Screenshot saved to: {output}");
            }
        }
        ControlAction::Title => {
            println!("{}", controller.title().await?);
        }
        ControlAction::Url => {
            println!("{}", controller.url().await?);
        }
        ControlAction::Text { selector } => {
            println!("{}", controller.text(&selector).await?);
        }
    }

    Ok(())
}
