//! In-place client configuration rewrite
//!
//! Overwrites the agent's JSON configuration file inside a running
//! container by exec-ing a heredoc. Exec can transiently fail right after
//! container start, so the write goes through the bounded retry helper.
//! The caller owns the read-merge-validate cycle and any restart needed
//! for the new configuration to take effect.

use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::retry::run_with_retry;
use crate::runtime::RuntimeAdapter;

/// Configuration file the agent reads at startup.
pub const CLIENT_CONFIG_FILENAME: &str = "BridgeClientConfiguration.json";

const CONFIG_WRITE_ATTEMPTS: u32 = 2;
const CONFIG_WRITE_DELAY: Duration = Duration::from_secs(2);

/// Result of a configuration rewrite.
#[derive(Debug, Clone)]
pub struct ConfigUpdateOutcome {
    pub success: bool,
    pub output: String,
}

/// The configuration directory sits next to the logs directory recorded in
/// the container labels.
fn config_file_path(logs_path: &str) -> String {
    let config_dir = logs_path.replace("/Logs", "/Configuration");
    format!("{}/{}", config_dir, CLIENT_CONFIG_FILENAME)
}

fn heredoc_command(file: &str, payload: &str) -> Vec<String> {
    let script = format!("cat > {} << \"EOF\"\n{}\nEOF", file, payload);
    vec!["sh".to_string(), "-c".to_string(), script]
}

/// Overwrite the client configuration of a running agent with a full
/// replacement document. Returns the success flag and the captured exec
/// output; does not restart the container.
pub async fn update_client_config(
    runtime: &dyn RuntimeAdapter,
    identity: &str,
    config: &serde_json::Value,
) -> Result<ConfigUpdateOutcome> {
    let container = runtime
        .inspect(identity)
        .await?
        .ok_or_else(|| Error::InvalidArgument(format!("no agent container named '{}'", identity)))?;
    let logs_path = container.logs_path().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "container '{}' carries no logs-path label",
            identity
        ))
    })?;
    let file = config_file_path(logs_path);
    let payload = serde_json::to_string_pretty(config)?;
    let cmd = heredoc_command(&file, &payload);

    info!(container = %identity, file = %file, "rewriting client configuration");
    let output = run_with_retry(CONFIG_WRITE_ATTEMPTS, CONFIG_WRITE_DELAY, || {
        runtime.exec(identity, cmd.clone())
    })
    .await?;

    Ok(ConfigUpdateOutcome {
        success: output.exit_code == 0,
        output: output.output,
    })
}

/// Read the current client configuration out of a running agent. `None`
/// when the file does not exist yet.
pub async fn read_client_config(
    runtime: &dyn RuntimeAdapter,
    identity: &str,
) -> Result<Option<serde_json::Value>> {
    let container = runtime
        .inspect(identity)
        .await?
        .ok_or_else(|| Error::InvalidArgument(format!("no agent container named '{}'", identity)))?;
    let logs_path = container.logs_path().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "container '{}' carries no logs-path label",
            identity
        ))
    })?;
    let file = config_file_path(logs_path);
    let output = runtime
        .exec(identity, vec!["cat".to_string(), file])
        .await?;
    if output.exit_code != 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&output.output)?))
}

/// Structural validation callers run before writing: the connection pool
/// must be able to carry the configured job concurrency.
pub fn validate_client_config(config: &serde_json::Value) -> Result<()> {
    let pool_size = config
        .pointer("/connectionPool/size")
        .and_then(|v| v.as_u64());
    let max_jobs = config.get("maxConcurrentJobs").and_then(|v| v.as_u64());
    if let (Some(pool_size), Some(max_jobs)) = (pool_size, max_jobs) {
        if pool_size < max_jobs {
            return Err(Error::InvalidArgument(format!(
                "connection pool size {} is below max concurrent job count {}",
                pool_size, max_jobs
            )));
        }
    }
    Ok(())
}
