use serde_json::Value;

use webcell_core::{Config, Error, Paths};
use webcell_pipe::PipeClient;

/// Run a single host RPC and print the JSON result.
pub async fn run(method: String, params: Option<String>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    let params: Value = match params {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid JSON params: {}", e))?,
        None => Value::Object(Default::default()),
    };

    let client = PipeClient::from_config(&config.pipe);
    match client.call(&method, params).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(Error::ChannelClosed(msg)) => {
            Err(anyhow::anyhow!("{}. Start the host process and retry.", msg))
        }
        Err(e) => Err(e.into()),
    }
}
