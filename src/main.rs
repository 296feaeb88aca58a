use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "synth-runner")]
#[command(version, about = "Queue and launch custom tree-of-life synthesis builds")]
pub struct Cli {
    /// Path to the TOML settings file
    #[arg(
        long,
        global = true,
        env = "SYNTH_RUNNER_CONFIG",
        default_value = "synth-runner.toml"
    )]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API and run queued builds
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Print the status of one job
    Status { id: String },
    /// Print every known job
    List,
    /// Queue a build; it launches when `serve` next starts
    Trigger {
        /// Collection as owner/name; repeat for a multi-collection build
        #[arg(short, long = "collection", required = true)]
        collections: Vec<String>,

        /// Root taxon, as 123 or ott123
        #[arg(short, long)]
        root_id: String,

        #[arg(short, long)]
        user: Option<String>,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "synth_runner=debug"
    } else {
        "synth_runner=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    match &cli.command {
        Commands::Serve { host, port } => cmd::cmd_serve(&cli.config, host, *port).await?,
        Commands::Status { id } => cmd::cmd_status(&cli.config, id)?,
        Commands::List => cmd::cmd_list(&cli.config)?,
        Commands::Trigger {
            collections,
            root_id,
            user,
        } => cmd::cmd_trigger(&cli.config, collections, root_id, user.as_deref())?,
    }

    Ok(())
}
