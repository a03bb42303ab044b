use cutover_core::Deployment;

use super::{Exit, OutputFormat, failure, format_deployment, format_summary, print_json};
use crate::client::ApiClient;

pub async fn status(client: &ApiClient, id: &str, format: OutputFormat) -> anyhow::Result<Exit> {
    let reply = client.get(&format!("/api/v1/deployments/{id}")).await?;
    if !reply.status.is_success() {
        return Ok(failure(&reply));
    }
    match format {
        OutputFormat::Json => print_json(&reply)?,
        OutputFormat::Text => {
            let deployment: Deployment = reply.data()?;
            print!("{}", format_deployment(&deployment));
        }
    }
    Ok(Exit::Ok)
}

pub async fn cancel(client: &ApiClient, id: &str, format: OutputFormat) -> anyhow::Result<Exit> {
    let reply = client
        .post(&format!("/api/v1/deployments/{id}/cancel"), None)
        .await?;
    if !reply.status.is_success() {
        return Ok(failure(&reply));
    }
    match format {
        OutputFormat::Json => print_json(&reply)?,
        OutputFormat::Text => {
            let deployment: Deployment = reply.data()?;
            println!("✓ Cancellation requested for {} (was {})", deployment.id, deployment.state);
        }
    }
    Ok(Exit::Ok)
}

pub async fn history(client: &ApiClient, service: &str, format: OutputFormat) -> anyhow::Result<Exit> {
    let reply = client
        .get(&format!("/api/v1/services/{service}/deployments"))
        .await?;
    if !reply.status.is_success() {
        return Ok(failure(&reply));
    }
    match format {
        OutputFormat::Json => print_json(&reply)?,
        OutputFormat::Text => {
            let deployments: Vec<Deployment> = reply.data()?;
            if deployments.is_empty() {
                println!("no finished deployments for {service}");
            }
            for d in &deployments {
                println!("{}", format_summary(d));
            }
        }
    }
    Ok(Exit::Ok)
}
