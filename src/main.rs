use anyhow::Context;
use routing_gateway::{config::GatewayConfig, init_gateway, init_tracing};
use std::env;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = PathBuf::from(
        env::args()
            .nth(1)
            .unwrap_or_else(|| "config/gateway.yaml".to_string()),
    );

    let config = GatewayConfig::from_file(&config_path).with_context(|| {
        format!(
            "Failed to load configuration from {} (usage: routing-gateway [config_file])",
            config_path.display()
        )
    })?;

    init_tracing(config.logging.format);

    init_gateway(config, Some(config_path))
        .await
        .context("Gateway error")?;

    Ok(())
}
