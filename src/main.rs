use clap::Parser;
use tracing_subscriber::EnvFilter;

use redis_sre_agent::cli::{run, Cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}
