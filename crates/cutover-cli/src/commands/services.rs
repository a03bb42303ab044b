use cutover_core::ServiceSpec;

use super::{Exit, OutputFormat, failure, print_json};
use crate::client::ApiClient;

pub async fn list(client: &ApiClient, format: OutputFormat) -> anyhow::Result<Exit> {
    let reply = client.get("/api/v1/services").await?;
    if !reply.status.is_success() {
        return Ok(failure(&reply));
    }
    match format {
        OutputFormat::Json => print_json(&reply)?,
        OutputFormat::Text => {
            let services: Vec<ServiceSpec> = reply.data()?;
            for s in &services {
                let active = s
                    .active
                    .as_ref()
                    .map(|a| format!("{} on {}", a.version, a.color))
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<16} x{:<3} {active}", s.id, s.desired_count);
            }
        }
    }
    Ok(Exit::Ok)
}
