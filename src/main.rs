use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use buildfarm_lite::config::{SchedulerConfig, TokenConfig};
use buildfarm_lite::node::SchedulerNode;
use buildfarm_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "buildfarm-lite")]
#[command(version)]
#[command(about = "Distributed compile farm scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler
    Scheduler(SchedulerArgs),
}

#[derive(Parser, Debug)]
struct SchedulerArgs {
    /// Port the RPC front end listens on
    #[arg(long, default_value = "10005")]
    port: u16,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Tokens accepted from daemons (comma-separated)
    #[arg(long, default_value = "buildfarm")]
    user_tokens: String,

    /// Tokens accepted from servants (comma-separated)
    #[arg(long, default_value = "buildfarm")]
    servant_tokens: String,

    /// Servants with less available memory than this (bytes) take no new tasks
    #[arg(long, default_value_t = 2 << 30)]
    min_memory_for_new_task: u64,

    /// Seconds between daemon token rotations
    #[arg(long, default_value = "3000")]
    token_rollout_secs: u64,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("BUILDFARM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_scheduler(args: SchedulerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let tokens = TokenConfig {
        user_tokens: TokenConfig::parse_list(&args.user_tokens),
        servant_tokens: TokenConfig::parse_list(&args.servant_tokens),
        rollout_interval: std::time::Duration::from_secs(args.token_rollout_secs),
    };
    let mut config = SchedulerConfig::new(listen_addr)
        .with_min_memory(args.min_memory_for_new_task)
        .with_tokens(tokens);
    if let Some(addr) = dashboard_addr {
        config = config.with_dashboard(addr);
    }

    let shutdown = install_shutdown_handler();
    SchedulerNode::new(config).run(shutdown).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();

    match args.command {
        Commands::Scheduler(scheduler_args) => {
            run_scheduler(scheduler_args).await?;
        }
    }

    Ok(())
}
