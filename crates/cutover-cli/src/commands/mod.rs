pub mod deploy;
pub mod deployments;
pub mod services;

use std::process::ExitCode;

use clap::ValueEnum;
use http::StatusCode;

use cutover_core::Deployment;

use crate::client::Reply;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Ok = 0,
    Conflict = 1,
    NotFound = 2,
    Internal = 3,
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(exit as u8)
    }
}

pub fn exit_for(status: StatusCode) -> Exit {
    match status {
        s if s.is_success() => Exit::Ok,
        StatusCode::CONFLICT => Exit::Conflict,
        StatusCode::NOT_FOUND => Exit::NotFound,
        _ => Exit::Internal,
    }
}

/// Report a non-success reply on stderr and pick the exit code.
fn failure(reply: &Reply) -> Exit {
    eprintln!("error: {}", reply.error_message());
    exit_for(reply.status)
}

fn print_json(reply: &Reply) -> anyhow::Result<()> {
    let data = reply.body.get("data").unwrap_or(&reply.body);
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

pub fn format_deployment(d: &Deployment) -> String {
    let mut out = String::new();
    out.push_str(&format!("deployment  {}\n", d.id));
    out.push_str(&format!("service     {}\n", d.service_id));
    out.push_str(&format!("version     {}\n", d.version));
    out.push_str(&format!("state       {}\n", d.state));
    let source = d
        .source_group
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    out.push_str(&format!("groups      {source} -> {}\n", d.target_group));
    if let Some(reason) = &d.failure_reason {
        out.push_str(&format!("reason      {reason}\n"));
    }
    for t in &d.transitions {
        out.push_str(&format!("  {:>13}  {}\n", t.at_ms, t.state));
    }
    out
}

pub fn format_summary(d: &Deployment) -> String {
    let reason = d
        .failure_reason
        .as_ref()
        .map(|r| format!("  ({r})"))
        .unwrap_or_default();
    format!("{:<16} {:<10} {:<12}{reason}", d.id, d.version, d.state.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_core::{FailureReason, GroupColor, GroupId};

    #[test]
    fn exit_codes_follow_status() {
        assert_eq!(exit_for(StatusCode::CREATED), Exit::Ok);
        assert_eq!(exit_for(StatusCode::ACCEPTED), Exit::Ok);
        assert_eq!(exit_for(StatusCode::CONFLICT), Exit::Conflict);
        assert_eq!(exit_for(StatusCode::NOT_FOUND), Exit::NotFound);
        assert_eq!(exit_for(StatusCode::BAD_REQUEST), Exit::Internal);
        assert_eq!(exit_for(StatusCode::INTERNAL_SERVER_ERROR), Exit::Internal);
    }

    #[test]
    fn deployment_text_shows_groups_and_reason() {
        let mut d = Deployment::new(
            "orders-2",
            "orders",
            "v2",
            Some(GroupId::new("orders", GroupColor::Blue)),
            GroupId::new("orders", GroupColor::Green),
        );
        d.failure_reason = Some(FailureReason::Cancelled);

        let text = format_deployment(&d);
        assert!(text.contains("orders/blue -> orders/green"));
        assert!(text.contains("reason      cancelled"));
        assert!(format_summary(&d).contains("(cancelled)"));
    }
}
