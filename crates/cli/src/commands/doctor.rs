//! Doctor command - validate configuration and show status

use anyhow::Result;
use crossposter_adapters::state::FsLedgerRepo;
use crossposter_domain::{LedgerRepo, Service};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::args::DoctorArgs;
use crate::config::AppConfig;

#[derive(Debug, Serialize)]
struct DoctorReport {
    config: CheckResult,
    paths: CheckResult,
    input: CheckResult,
    destinations: BTreeMap<&'static str, CheckResult>,
    overall: String,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    status: String,
    message: String,
    details: Option<serde_json::Value>,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn warn(message: impl Into<String>) -> Self {
        Self {
            status: "warn".to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    fn is_error(&self) -> bool {
        self.status == "error"
    }
}

pub async fn execute(args: DoctorArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut report = DoctorReport {
        config: CheckResult::error("Not checked"),
        paths: CheckResult::error("Not checked"),
        input: CheckResult::error("Not checked"),
        destinations: BTreeMap::new(),
        overall: "error".to_string(),
    };

    let config = match AppConfig::load(config_path.as_deref()) {
        Ok(c) => match c.run_loop_config(false) {
            Ok(_) => {
                report.config = CheckResult::ok("Configuration loaded successfully");
                Some(c)
            }
            Err(e) => {
                report.config = CheckResult::error(format!("Invalid setting: {:#}", e));
                None
            }
        },
        Err(e) => {
            report.config = CheckResult::error(format!("Failed to load config: {:#}", e));
            None
        }
    };

    if let Some(ref config) = config {
        report.input = check_input(config);
        report.paths = check_paths(config).await;
        report.destinations = check_destinations(config);
    }

    let checks = [&report.config, &report.paths, &report.input]
        .into_iter()
        .chain(report.destinations.values());

    let (has_error, all_ok) = checks.fold((false, true), |(err, ok), c| {
        (err || c.is_error(), ok && c.is_ok())
    });

    report.overall = if has_error {
        "error".to_string()
    } else if all_ok {
        "ok".to_string()
    } else {
        "warn".to_string()
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.overall == "error" {
        std::process::exit(1);
    }

    Ok(())
}

fn check_input(config: &AppConfig) -> CheckResult {
    let input = match config.input_service() {
        Ok(s) => s,
        Err(e) => return CheckResult::error(format!("{:#}", e)),
    };

    let handle = match input {
        Service::Mastodon => &config.mastodon.handle,
        Service::Bluesky => &config.bluesky.handle,
        Service::Twitter => return CheckResult::error("Twitter cannot be used as input"),
    };
    if handle.trim().is_empty() {
        return CheckResult::error(format!("Input {}: no handle configured", input));
    }

    credential_check(
        config.credential_env(input),
        format!("Input {} as {}", input, handle),
    )
}

async fn check_paths(config: &AppConfig) -> CheckResult {
    let paths = &config.paths;
    let details = serde_json::json!({
        "ledger": paths.ledger,
        "backup": paths.backup,
        "activity_cache": paths.activity_cache,
        "rate_limit": paths.rate_limit,
        "media_dir": paths.media_dir,
    });

    if !paths.ledger.exists() {
        return CheckResult::warn(format!(
            "Ledger {} does not exist yet; it will be created on the first run",
            paths.ledger.display()
        ))
        .with_details(details);
    }

    let Ok(input) = config.input_service() else {
        return CheckResult::warn("Ledger not checked without a valid input").with_details(details);
    };

    let repo = FsLedgerRepo::new(&paths.ledger, &paths.backup).read_only(true);
    match repo.load(input).await {
        Ok(records) => {
            let message = format!("Ledger holds {} records", records.len());
            if paths.rate_limit.exists() {
                CheckResult::warn(format!("{}; a rate-limit cooldown file is present", message))
                    .with_details(details)
            } else {
                CheckResult::ok(message).with_details(details)
            }
        }
        Err(e) => CheckResult::error(format!("Failed to read ledger: {}", e)).with_details(details),
    }
}

fn check_destinations(config: &AppConfig) -> BTreeMap<&'static str, CheckResult> {
    let input = config.input_service().ok();
    let mut results = BTreeMap::new();

    for service in Service::ALL {
        let result = if Some(service) == input {
            CheckResult::ok("Used as input")
        } else if !config.is_enabled(service) {
            CheckResult::ok(format!("{} disabled", service))
        } else {
            let target = match service {
                Service::Mastodon => config.mastodon.instance.as_str(),
                Service::Bluesky => config.bluesky.pds.as_str(),
                Service::Twitter => config.twitter.base_url.as_str(),
            };
            credential_check(config.credential_env(service), format!("{} at {}", service, target))
        };
        results.insert(service.as_str(), result);
    }

    let any_output = Service::ALL
        .into_iter()
        .any(|s| Some(s) != input && config.is_enabled(s));
    if !any_output {
        results.insert("outputs", CheckResult::warn("No destinations enabled"));
    }

    results
}

fn credential_check(env_var: &str, label: String) -> CheckResult {
    if env_var.is_empty() {
        return CheckResult::error(format!("{}: no credential env var configured", label));
    }

    // Never reveal the value, only whether it is set
    match std::env::var(env_var) {
        Ok(val) if !val.is_empty() => CheckResult::ok(format!("{}, {} (set)", label, env_var)),
        _ => CheckResult::warn(format!("{}, {} (not set)", label, env_var)),
    }
}

fn print_report(report: &DoctorReport) {
    println!("crossposter Doctor Report");
    println!("=========================");
    println!();

    print_check("Config", &report.config);
    print_check("Paths", &report.paths);
    print_check("Input", &report.input);
    for (name, result) in &report.destinations {
        print_check(&format!("Destination {}", name), result);
    }

    println!();
    println!("{} Overall: {}", symbol(&report.overall), report.overall.to_uppercase());

    if report.overall == "ok" {
        println!();
        println!("Ready to run! Try: crossposter run --dry-run");
    }
}

fn print_check(name: &str, result: &CheckResult) {
    println!("{} {}: {}", symbol(&result.status), name, result.message);
}

fn symbol(status: &str) -> &'static str {
    match status {
        "ok" => "✓",
        "warn" => "⚠",
        _ => "✗",
    }
}
