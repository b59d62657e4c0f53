use crate::shutdown;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "parapet", about = "A gateway configuration control plane")]
pub struct Args {
    #[clap(long, default_value = "parapet=info,warn", env = "PARAPET_LOG")]
    log_level: String,

    #[clap(long, default_value = "plain")]
    log_format: LogFormat,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the drain sidecar next to a data-plane instance.
    ShutdownManager(shutdown::Settings),
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            command,
        } = self;

        let filter = EnvFilter::try_new(log_level)?;
        match log_format {
            LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init(),
        }

        match command {
            Command::ShutdownManager(settings) => shutdown::run(settings).await,
        }
    }
}
