//! Subcommand implementations.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use secrecy::SecretString;

use bothive_core::{Network, Orchestrator, SpawnError, SpawnRequest, TeardownReport};

/// Spawn one instance, reading the credential from the environment.
pub async fn spawn(
    orchestrator: &Orchestrator,
    identity: &str,
    network: &str,
    secret_env: &str,
    params: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let network: Network = network
        .parse()
        .with_context(|| format!("unknown network {network:?}"))?;

    let secret = std::env::var(secret_env)
        .map(SecretString::from)
        .with_context(|| format!("credential environment variable {secret_env} is not set"))?;

    let mut request = SpawnRequest::new(identity, secret, network);
    request.params = parse_params(params)?;

    match orchestrator.spawn(request).await {
        Ok(instance) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&instance)?);
            } else {
                println!(
                    "spawned {} on port {} ({})",
                    instance.instance_id, instance.api_port, instance.network
                );
            }
            Ok(())
        }
        // A conflict is useful output, not a crash: print the existing
        // instance so "ensure running" callers can proceed.
        Err(SpawnError::Conflict { existing }) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&existing)?);
            } else {
                println!(
                    "already running: {} (port {})",
                    existing.instance_id,
                    existing
                        .api_port
                        .map_or_else(|| "unknown".to_string(), |p| p.to_string())
                );
            }
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// List instances with effective status.
pub fn list(orchestrator: &Orchestrator, identity: Option<&str>, json: bool) -> anyhow::Result<()> {
    let snapshots = orchestrator.list(identity);
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("no instances");
        return Ok(());
    }
    for snapshot in snapshots {
        println!(
            "{:<40} {:<44} {:>5}  {:<8} {}",
            snapshot.instance.instance_id,
            snapshot.instance.identity,
            snapshot.instance.api_port,
            snapshot.effective_status,
            snapshot.instance.network,
        );
    }
    Ok(())
}

/// Stop by instance id or identity.
pub async fn stop(orchestrator: &Orchestrator, target: &str, json: bool) -> anyhow::Result<()> {
    let report = orchestrator.stop(target).await;
    print_report(&report, json)
}

/// Force cleanup for an identity.
pub async fn cleanup(
    orchestrator: &Orchestrator,
    identity: &str,
    deep: bool,
    json: bool,
) -> anyhow::Result<()> {
    let report = orchestrator.force_cleanup(identity, deep).await;
    print_report(&report, json)
}

fn print_report(report: &TeardownReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if report.outcomes.is_empty() {
        println!("{}: nothing to clean up", report.subject);
        return Ok(());
    }
    if report.is_clean() {
        println!("{}: cleaned", report.subject);
    } else {
        println!("{}: cleaned with warnings", report.subject);
        for outcome in report.warnings() {
            println!(
                "  {} {}: {}",
                outcome.instance_id,
                outcome.step.as_str(),
                outcome.warning.as_deref().unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn parse_params(params: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            bail!("parameter {param:?} is not KEY=value");
        };
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}
