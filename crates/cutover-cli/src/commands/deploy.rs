use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use cutover_core::{Deployment, VersionSpec};

use super::{Exit, OutputFormat, failure, format_deployment, print_json};
use crate::client::ApiClient;

/// Parse a `KEY=VALUE` pair.
pub fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

pub fn request(tag: &str, env: Vec<(String, String)>, config_artifact: Option<String>) -> VersionSpec {
    VersionSpec {
        tag: tag.to_string(),
        env: env.into_iter().collect::<BTreeMap<_, _>>(),
        config_artifact,
    }
}

pub async fn deploy(
    client: &ApiClient,
    service: &str,
    version: &VersionSpec,
    wait: bool,
    format: OutputFormat,
) -> anyhow::Result<Exit> {
    let body: Value = serde_json::to_value(version)?;
    let reply = client
        .post(&format!("/api/v1/services/{service}/deployments"), Some(&body))
        .await?;
    if !reply.status.is_success() {
        return Ok(failure(&reply));
    }

    let deployment: Deployment = reply.data()?;
    if !wait {
        match format {
            OutputFormat::Json => print_json(&reply)?,
            OutputFormat::Text => println!(
                "✓ Started {} ({} -> {})",
                deployment.id, deployment.version, deployment.target_group
            ),
        }
        return Ok(Exit::Ok);
    }

    let path = format!("/api/v1/deployments/{}", deployment.id);
    let mut last_state = deployment.state;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let reply = client.get(&path).await?;
        if !reply.status.is_success() {
            return Ok(failure(&reply));
        }
        let current: Deployment = reply.data()?;
        if format == OutputFormat::Text && current.state != last_state {
            println!("  {} -> {}", current.id, current.state);
            last_state = current.state;
        }
        if current.is_terminal() {
            match format {
                OutputFormat::Json => print_json(&reply)?,
                OutputFormat::Text => print!("{}", format_deployment(&current)),
            }
            return Ok(Exit::Ok);
        }
    }
}
