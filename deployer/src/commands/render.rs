//! Terminal and JSON rendering of plans, results and reports

use colored::{ColoredString, Colorize};
use serde::Serialize;

use crate::deploy::reconciler::{DownReport, StatusReport, UpOutcome, UpReport};
use crate::errors::DeployError;
use crate::health::verifier::HealthReport;
use crate::models::{ActionType, DeploymentPlan, DeploymentState, HealthStatus};
use crate::secrets::REDACTED;

pub fn print_json<T: Serialize>(value: &T) -> Result<(), DeployError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn action_label(action: ActionType) -> ColoredString {
    let label = format!("{:<7}", action.to_string());
    match action {
        ActionType::Create => label.green(),
        ActionType::Update => label.yellow(),
        ActionType::Delete => label.red(),
        ActionType::Noop => label.dimmed(),
    }
}

fn health_label(status: HealthStatus) -> ColoredString {
    match status {
        HealthStatus::Healthy => status.to_string().green(),
        HealthStatus::Degraded => status.to_string().yellow(),
        HealthStatus::Unhealthy => status.to_string().red(),
        HealthStatus::Unknown => status.to_string().dimmed(),
    }
}

pub fn print_plan(plan: &DeploymentPlan) {
    println!(
        "\n{} {} ({}, {}, {})",
        "Plan for".bold(),
        plan.service_name.bold(),
        plan.environment,
        plan.platform,
        plan.region
    );

    println!("\n{:<7}  {:<14} {:<36} {}", "ACTION", "TYPE", "RESOURCE", "DESCRIPTION");
    for action in &plan.actions {
        println!(
            "{}  {:<14} {:<36} {}",
            action_label(action.action),
            action.resource_type.to_string(),
            action.name,
            action.description
        );
    }

    println!("\n{:<16} {}", "Target image:", plan.target_image);
    if let Some(digest) = &plan.target_digest {
        println!("{:<16} {}", "Target digest:", digest);
    }
    if let Some(image) = &plan.current_image {
        println!("{:<16} {}", "Current image:", image);
    }
    if let Some(url) = &plan.current_url {
        println!("{:<16} {}", "Current URL:", url);
    }

    if !plan.env_vars.is_empty() {
        println!("\n{}", "Environment:".bold());
        for (key, value) in &plan.env_vars {
            println!("  {}={}", key, value);
        }
    }
    if !plan.secrets.is_empty() {
        println!("\n{}", "Secrets:".bold());
        for secret in &plan.secrets {
            println!("  {}={}  ({})", secret.env_key, REDACTED, secret.secret_name);
        }
    }

    let summary = plan
        .summary()
        .iter()
        .map(|(action, count)| format!("{} {}", count, action))
        .collect::<Vec<_>>()
        .join(", ");
    println!("\n{} {}", "Summary:".bold(), summary);
    if let Some(cost) = &plan.estimated_cost {
        println!("{} {}", "Estimated cost:".bold(), cost);
    }
    println!();
}

pub fn print_health(report: &HealthReport) {
    println!(
        "{} {} ({}/{} endpoints healthy)",
        "Health:".bold(),
        health_label(report.overall),
        report.healthy_count,
        report.results.len()
    );
    for result in &report.results {
        let code = result
            .status_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<28} {:<10} {:>4}  {} ms  {} attempt(s){}",
            result.endpoint,
            health_label(result.status),
            code,
            result.response_time.as_millis(),
            result.attempts,
            result
                .error
                .as_ref()
                .map(|e| format!("  {}", e.dimmed()))
                .unwrap_or_default()
        );
    }
    if let Some(avg) = report.avg_response_time_ms {
        println!("  average response time {} ms", avg);
    }
}

pub fn print_state(state: &DeploymentState) {
    println!("{:<12} {}", "Service:", state.key().to_string().bold());
    println!("{:<12} {}", "Status:", state.status);
    println!("{:<12} {}", "Health:", health_label(state.health_status));
    println!("{:<12} {}", "Image:", state.image_tag);
    if let Some(digest) = &state.image_digest {
        println!("{:<12} {}", "Digest:", digest);
    }
    if let Some(url) = &state.service_url {
        println!("{:<12} {}", "URL:", url.cyan());
    }
    if let Some(revision) = &state.revision {
        println!("{:<12} {}", "Revision:", revision);
    }
    println!("{:<12} {}", "Region:", state.region);
    println!("{:<12} {}", "Updated:", state.updated_at.to_rfc3339());
}

pub fn print_up_report(report: &UpReport) {
    match report.outcome {
        UpOutcome::UpToDate => println!("{}", "✓ Deployment is up to date, nothing to do".green()),
        UpOutcome::Aborted => println!("{}", "Aborted".yellow()),
        UpOutcome::Deployed => println!("{}", "✓ Deployment succeeded".green()),
        UpOutcome::Rejected => println!("{}", "✗ Provider rejected the deployment".red()),
        UpOutcome::RolledBack => println!("{}", "✗ Deployment unhealthy, rolled back".red()),
        UpOutcome::Removed => println!("{}", "✗ Deployment unhealthy, service removed".red()),
        UpOutcome::Unhealthy => println!("{}", "✗ Deployment unhealthy".red()),
    }
    if let Some(message) = &report.message {
        println!("  {}", message);
    }
    if let Some(rollback) = report.rollback.as_ref().filter(|r| !r.success) {
        println!("  {} {}", "Recovery failed:".red(), rollback.message());
    }
    if let Some(health) = &report.health {
        print_health(health);
    }
    if let Some(state) = &report.state {
        if report.outcome != UpOutcome::Aborted {
            println!();
            print_state(state);
        }
    }
}

pub fn print_status_report(report: &StatusReport) {
    print_state(&report.state);
    if !report.result.success {
        println!("{} {}", "Provider:".red(), report.result.message());
    }
    if let Some(health) = &report.health {
        print_health(health);
    }
}

pub fn print_down_report(report: &DownReport) {
    if report.result.success {
        println!("{}", "✓ Deployment removed".green());
        if !report.had_state {
            println!("  {}", "no local record existed".dimmed());
        }
    } else {
        println!("{} {}", "✗ Teardown failed:".red(), report.result.message());
    }
}
