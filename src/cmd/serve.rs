use anyhow::Result;

use conductor::server::{ServerConfig, start_server};

pub async fn execute(port: Option<u16>) -> Result<i32> {
    let mut config = ServerConfig::default();
    if let Some(port) = port {
        config.port = port;
    }
    start_server(config).await?;
    Ok(0)
}
