mod bridge;
mod config;
mod container;
mod limits;
mod web;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use bridge::Bridge;
use container::docker::DockerExec;
use limits::redis::RedisRateLimiter;

#[derive(Debug, Parser)]
#[command(name = "termbridge", about = "Web terminal bridge into a sandboxed container")]
struct Cli {
    /// Address to bind the web server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the web server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Path to a termbridge.toml config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("termbridge=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let settings = Arc::new(config::Settings::load(cli.config.as_deref())?);

    let runtime = Arc::new(DockerExec::connect(&settings.container)?);
    let limiter = Arc::new(RedisRateLimiter::connect(&settings.redis.url, &settings.limits).await);

    let bridge = Arc::new(Bridge::new(runtime, limiter, settings.clone()));

    web::server::start_web_server(&cli.host, cli.port, bridge, settings).await
}
