//! Status command - ledger statistics and record lookup

use anyhow::{Context, Result, bail};
use crossposter_adapters::state::FsLedgerRepo;
use crossposter_domain::{LedgerRepo, PostRecord, Service, ServiceStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::args::StatusArgs;
use crate::config::AppConfig;

#[derive(Debug, Default, Serialize)]
struct ServiceCounts {
    sent: usize,
    skipped: usize,
    failed: usize,
    terminal: usize,
    duplicate: usize,
    not_attempted: usize,
}

impl ServiceCounts {
    fn add(&mut self, status: &ServiceStatus) {
        match status {
            ServiceStatus::NotAttempted => self.not_attempted += 1,
            ServiceStatus::Skipped => self.skipped += 1,
            ServiceStatus::Sent { .. } => self.sent += 1,
            ServiceStatus::Failed { .. } => self.failed += 1,
            ServiceStatus::FailedTerminal { .. } => self.terminal += 1,
            ServiceStatus::Duplicate => self.duplicate += 1,
        }
    }
}

#[derive(Debug, Serialize)]
struct LedgerStats {
    ledger: PathBuf,
    input: Service,
    records: usize,
    services: BTreeMap<Service, ServiceCounts>,
}

pub async fn execute(args: StatusArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load(config_path.as_deref())?;
    let input = config.input_service()?;

    let repo = FsLedgerRepo::new(&config.paths.ledger, &config.paths.backup).read_only(true);
    let records = repo
        .load(input)
        .await
        .with_context(|| format!("Failed to read ledger {}", config.paths.ledger.display()))?;

    if let Some(id) = args.id {
        let Some(record) = records.get(&id) else {
            bail!("No record for {} in the ledger", id);
        };
        let view = record_json(&id, record);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&view)?);
        } else {
            print_record(&id, record);
        }
        return Ok(());
    }

    let mut services: BTreeMap<Service, ServiceCounts> = BTreeMap::new();
    for record in records.values() {
        for service in Service::ALL {
            services.entry(service).or_default().add(record.status(service));
        }
    }

    let stats = LedgerStats {
        ledger: config.paths.ledger.clone(),
        input,
        records: records.len(),
        services,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&stats);
    }
    Ok(())
}

fn status_label(status: &ServiceStatus) -> String {
    match status {
        ServiceStatus::NotAttempted => "not attempted".to_string(),
        ServiceStatus::Skipped => "skipped".to_string(),
        ServiceStatus::Sent { native_id, .. } => format!("sent as {}", native_id),
        ServiceStatus::Failed { attempts } => format!("failed {} time(s)", attempts),
        ServiceStatus::FailedTerminal { attempts } => {
            format!("gave up after {} attempt(s)", attempts)
        }
        ServiceStatus::Duplicate => "rejected as duplicate".to_string(),
    }
}

fn record_json(id: &str, record: &PostRecord) -> serde_json::Value {
    let services: serde_json::Map<String, serde_json::Value> = record
        .services
        .iter()
        .map(|(service, status)| {
            let value = serde_json::json!({
                "id": status.ledger_id(),
                "failure": status.failures(),
                "uri": status.sent_ref().and_then(|s| s.reference),
                "status": status_label(status),
            });
            (service.as_str().to_string(), value)
        })
        .collect();

    serde_json::json!({
        "id": id,
        "origin": record.origin,
        "services": services,
    })
}

fn print_record(id: &str, record: &PostRecord) {
    println!("Record {} (origin {})", id, record.origin);
    for (service, status) in &record.services {
        println!("  {:<9} {}", service.as_str(), status_label(status));
        if let Some(uri) = status.sent_ref().and_then(|s| s.reference) {
            println!("  {:<9} {}", "", uri);
        }
    }
}

fn print_stats(stats: &LedgerStats) {
    println!("Ledger: {}", stats.ledger.display());
    println!("Input:  {}", stats.input);
    println!("Records: {}", stats.records);
    println!();
    println!(
        "{:<9} {:>6} {:>8} {:>7} {:>9} {:>10} {:>8}",
        "service", "sent", "skipped", "failed", "terminal", "duplicate", "pending"
    );
    for (service, c) in &stats.services {
        println!(
            "{:<9} {:>6} {:>8} {:>7} {:>9} {:>10} {:>8}",
            service.as_str(),
            c.sent,
            c.skipped,
            c.failed,
            c.terminal,
            c.duplicate,
            c.not_attempted
        );
    }
}
