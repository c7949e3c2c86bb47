use clap::Parser;
use tavern_proxy_server::cli::Args;
use tavern_proxy_server::logging::{init_logging, level_to_str, LogConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_config = LogConfig::new(args.log_level.as_deref(), args.debug);
    init_logging(&log_config);
    tracing::debug!("Log level: {}", level_to_str(log_config.level));

    let config = args.load_config()?;
    tavern_proxy_server::run(config).await
}
