//! gatekeeper - zero trust access decisions from the command line

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use gatekeeper_core::format::{latency_ms, percent, truncate};
use gatekeeper_core::Paths;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use gatekeeper::{
    audit::{AuditLog, AuditQuery},
    config::EngineConfig,
    context::{AccessRequest, ContextAggregator},
    engine::AccessEngine,
    policy::{Effect, PolicyDocument, PolicySet, PolicyStore},
    sources::FixtureSources,
    threat::{ThreatIndicators, ThreatIntelStore},
};

/// gatekeeper - zero trust access decision engine
#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(version = "0.1.0")]
#[command(about = "Zero trust access decision engine")]
#[command(long_about = "Zero trust access decision engine.\n\n\
    Every request is decided from scratch: identity, device posture, network\n\
    and resource sensitivity are gathered, scored for risk and matched against\n\
    an ordered policy set. Unknown facts count against the request.")]
pub struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one access request
    #[command(about = "Evaluate one access request against fixture sources")]
    Eval {
        /// Principal making the request
        #[arg(long)]
        principal: String,

        /// Resource being accessed
        #[arg(long)]
        resource: String,

        /// Action on the resource
        #[arg(long, default_value = "read")]
        action: String,

        /// Device the request comes from
        #[arg(long)]
        device: Option<String>,

        /// Network origin of the request
        #[arg(long)]
        origin: Option<String>,

        /// Request ID (generated if omitted)
        #[arg(long)]
        request_id: Option<String>,

        /// Fixture file answering for the collaborators
        #[arg(long)]
        fixtures: Option<PathBuf>,

        /// Threat indicator file
        #[arg(long)]
        threats: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Policy set management
    #[command(about = "Validate or show policy sets")]
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Query the audit log
    #[command(about = "Query the decision audit log")]
    Audit {
        /// Filter by principal
        #[arg(long)]
        principal: Option<String>,

        /// Filter by resource
        #[arg(long)]
        resource: Option<String>,

        /// Filter by effect (allow, deny, challenge)
        #[arg(long)]
        effect: Option<String>,

        /// Show entries since (e.g., "1h", "1d", "1w")
        #[arg(long)]
        since: Option<String>,

        /// Limit number of results
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show decision statistics
    #[command(about = "Show decision statistics from the audit log")]
    Stats {
        /// Show stats since (e.g., "1h", "1d", "1w")
        #[arg(long)]
        since: Option<String>,
    },

    /// Show engine status
    #[command(about = "Show active policy set, threat epoch and recent activity")]
    Status {
        /// Threat indicator file
        #[arg(long)]
        threats: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove audit records past the retention window
    #[command(about = "Apply audit log retention")]
    Cleanup,

    /// Initialize default configuration
    #[command(about = "Write the default configuration and baseline policy set")]
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Validate a policy document
    Check {
        /// Policy document (YAML)
        file: PathBuf,
    },

    /// Show the policy set the engine would use
    Show {
        /// Output as YAML
        #[arg(long)]
        yaml: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };

    match cli.command {
        Commands::Eval {
            principal,
            resource,
            action,
            device,
            origin,
            request_id,
            fixtures,
            threats,
            json,
        } => {
            let mut request = AccessRequest::new(
                request_id.unwrap_or_else(generate_request_id),
                principal,
                resource,
                action,
            );
            request.device_id = device;
            request.origin = origin;
            cmd_eval(config, request, fixtures, threats, json).await
        }
        Commands::Policy { command } => match command {
            PolicyCommands::Check { file } => cmd_policy_check(&file),
            PolicyCommands::Show { yaml } => cmd_policy_show(&config, yaml),
        },
        Commands::Audit {
            principal,
            resource,
            effect,
            since,
            limit,
            json,
        } => cmd_audit(&config, principal, resource, effect, since, limit, json),
        Commands::Stats { since } => cmd_stats(&config, since),
        Commands::Status { threats, json } => cmd_status(config, threats, json),
        Commands::Cleanup => cmd_cleanup(&config),
        Commands::Init { force } => cmd_init(cli.config, force),
    }
}

/// Policy set from the configured document, or the built-in baseline
fn load_policies(config: &EngineConfig) -> Result<PolicySet> {
    match config.policy_path() {
        Some(path) => {
            let set = PolicyDocument::load_from(&path)?
                .into_set()
                .with_context(|| format!("Policy document {:?} rejected", path))?;
            Ok(set)
        }
        None => Ok(PolicySet::baseline()),
    }
}

fn load_threats(config: &EngineConfig, path: Option<PathBuf>) -> Result<ThreatIndicators> {
    match path.or_else(|| config.threats.indicator_path()) {
        Some(path) => ThreatIndicators::load_from(&path),
        None => Ok(ThreatIndicators::default()),
    }
}

fn build_engine(
    config: EngineConfig,
    fixtures: Option<PathBuf>,
    threats: Option<PathBuf>,
) -> Result<AccessEngine> {
    let sources = match fixtures {
        Some(path) => FixtureSources::load_from(&path)?,
        None => FixtureSources::new(),
    };
    let policies = Arc::new(PolicyStore::new(load_policies(&config)?));
    let threats = Arc::new(ThreatIntelStore::with_indicators(load_threats(&config, threats)?));
    let audit = Arc::new(AuditLog::with_path(config.audit_path()));

    Ok(AccessEngine::new(
        ContextAggregator::from_shared(Arc::new(sources), config.aggregator.clone()),
        policies,
        threats,
        audit,
        config,
    ))
}

async fn cmd_eval(
    config: EngineConfig,
    request: AccessRequest,
    fixtures: Option<PathBuf>,
    threats: Option<PathBuf>,
    json_output: bool,
) -> Result<()> {
    let engine = build_engine(config, fixtures, threats)?;
    let decision = engine.evaluate_access(&request).await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        let effect_str = match decision.effect {
            Effect::Allow => "ALLOW",
            Effect::Deny => "DENY",
            Effect::Challenge => "CHALLENGE",
        };

        println!(
            "{}: {} {} {}",
            effect_str, request.principal_id, request.action, request.resource_id
        );
        println!("  Reason: {}", decision.reason);
        println!("  Details: {}", decision.details);
        println!("  Risk: {}", decision.risk_score);
        if let Some(policy) = &decision.matched_policy {
            println!("  Policy: {} (set v{})", policy, decision.policy_version);
        }
        if let Some(level) = decision.required_assurance {
            println!("  Required assurance: {}", level);
        }
        if decision.degraded {
            println!("  Context degraded: some facts could not be verified");
        }
    }

    // Exit with appropriate code
    match decision.effect {
        Effect::Allow => std::process::exit(0),
        Effect::Deny => std::process::exit(1),
        Effect::Challenge => std::process::exit(2),
    }
}

fn cmd_policy_check(file: &Path) -> Result<()> {
    let set = PolicyDocument::load_from(file)?
        .into_set()
        .with_context(|| format!("Policy document {:?} rejected", file))?;

    println!("OK: {} policies, version {}", set.len(), set.version());
    for policy in set.policies() {
        println!("  {:>6}  {:<10} {}", policy.priority, policy.effect.as_str(), policy.id);
    }
    Ok(())
}

fn cmd_policy_show(config: &EngineConfig, yaml: bool) -> Result<()> {
    let set = load_policies(config)?;

    if yaml {
        print!("{}", serde_yaml::to_string(&set.to_document())?);
        return Ok(());
    }

    let source = match config.policy_path() {
        Some(path) => path.display().to_string(),
        None => "built-in baseline".to_string(),
    };
    println!("Policy set v{} ({})", set.version(), source);
    println!();
    println!(
        "{:<8} {:<10} {:<28} {}",
        "PRIORITY", "EFFECT", "ID", "DESCRIPTION"
    );
    println!("{}", "-".repeat(80));
    for policy in set.policies() {
        println!(
            "{:<8} {:<10} {:<28} {}",
            policy.priority,
            policy.effect.as_str(),
            truncate(&policy.id, 25),
            truncate(&policy.description, 30)
        );
    }
    Ok(())
}

fn cmd_audit(
    config: &EngineConfig,
    principal: Option<String>,
    resource: Option<String>,
    effect: Option<String>,
    since: Option<String>,
    limit: usize,
    json_output: bool,
) -> Result<()> {
    let audit = AuditLog::with_path(config.audit_path());

    let mut query = AuditQuery::default().limit(limit);

    if let Some(id) = principal {
        query = query.principal(&id);
    }

    if let Some(id) = resource {
        query = query.resource(&id);
    }

    if let Some(name) = effect {
        let effect = Effect::from_str(&name)
            .with_context(|| format!("Unknown effect: {} (use allow, deny, challenge)", name))?;
        query = query.effect(effect);
    }

    if let Some(since_str) = since {
        query = query.since(parse_duration(&since_str)?);
    }

    let records = audit.query(query)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        println!(
            "{:<17} {:<10} {:<14} {:<14} {:>4}  {}",
            "TIMESTAMP", "EFFECT", "PRINCIPAL", "RESOURCE", "RISK", "REASON"
        );
        println!("{}", "-".repeat(80));

        for record in records {
            let time_str = record.recorded_at.format("%Y-%m-%d %H:%M").to_string();
            println!(
                "{:<17} {:<10} {:<14} {:<14} {:>4}  {}",
                time_str,
                record.decision.effect.as_str(),
                truncate(&record.principal_id, 11),
                truncate(&record.resource_id, 11),
                record.decision.risk_score,
                record.decision.reason
            );
        }
    }

    Ok(())
}

fn cmd_stats(config: &EngineConfig, since: Option<String>) -> Result<()> {
    let audit = AuditLog::with_path(config.audit_path());

    let since_time = match since {
        Some(s) => Some(parse_duration(&s)?),
        None => None,
    };

    let stats = audit.stats(since_time)?;
    let total = stats.total as u64;

    println!("Decision Statistics");
    println!("{}", "=".repeat(40));
    println!();
    println!("Total decisions: {}", stats.total);
    println!("  Allowed:    {} ({:.1}%)", stats.allowed, percent(stats.allowed as u64, total));
    println!("  Denied:     {} ({:.1}%)", stats.denied, percent(stats.denied as u64, total));
    println!("  Challenged: {} ({:.1}%)", stats.challenged, percent(stats.challenged as u64, total));
    println!();
    println!("Degraded contexts: {}", stats.degraded);
    println!("Default denies: {}", stats.default_denies);
    println!("Session re-evaluations: {}", stats.reevaluations);

    Ok(())
}

fn cmd_status(config: EngineConfig, threats: Option<PathBuf>, json_output: bool) -> Result<()> {
    let audit_path = config.audit_path();
    let engine = build_engine(config, None, threats)?;
    let status = engine.status();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Gatekeeper Status");
    println!("{}", "=".repeat(50));
    println!();
    println!("Health: {}", status.health);
    println!("Policy set: v{} ({} policies)", status.policy_version, status.policy_count);
    println!(
        "Threat intel: epoch {} ({} indicators)",
        status.threat_epoch, status.threat_indicators
    );
    println!("Audit log: {}", audit_path.display());

    let audit = AuditLog::with_path(audit_path);
    let since = Utc::now() - Duration::hours(24);
    if let Ok(stats) = audit.stats(Some(since)) {
        println!();
        println!("Last 24 hours:");
        println!("  Total decisions: {}", stats.total);
        println!("  Allowed: {} ({:.1}%)", stats.allowed, stats.allow_rate());
        println!("  Denied: {}", stats.denied);
        println!("  Challenged: {}", stats.challenged);
        println!("  Degraded: {}", stats.degraded);
    }

    if status.metrics.total > 0 {
        println!(
            "  Mean evaluation latency: {}",
            latency_ms(status.metrics.mean_latency_ms)
        );
    }

    Ok(())
}

fn cmd_cleanup(config: &EngineConfig) -> Result<()> {
    let audit = AuditLog::with_path(config.audit_path());
    let removed = audit.cleanup(config.audit.retention_days)?;
    println!(
        "Removed {} audit records older than {} days",
        removed, config.audit.retention_days
    );
    Ok(())
}

fn cmd_init(config_path: Option<PathBuf>, force: bool) -> Result<()> {
    let paths = Paths::new();
    let config_path = config_path.unwrap_or_else(|| paths.config_file());

    if config_path.exists() && !force {
        println!("Config already exists at {:?}", config_path);
        println!("Use --force to overwrite");
        return Ok(());
    }

    let policy_path = paths.config.join("policies.yaml");
    PolicySet::baseline().to_document().save_to(&policy_path)?;
    println!("Wrote baseline policy set to {:?}", policy_path);

    let config = EngineConfig {
        policies: Some(policy_path.display().to_string()),
        ..Default::default()
    };
    config.save_to(&config_path)?;
    println!("Created default config at {:?}", config_path);

    Ok(())
}

/// Parse a duration string like "1h", "1d", "1w" into a DateTime
fn parse_duration(s: &str) -> Result<chrono::DateTime<Utc>> {
    let s = s.trim();
    let Some((split, _)) = s.char_indices().last() else {
        anyhow::bail!("Invalid duration: {:?}", s);
    };
    let (num, unit) = s.split_at(split);
    let num: u32 = num
        .parse()
        .with_context(|| format!("Invalid duration: {:?}", s))?;
    let num = i64::from(num);

    let duration = match unit {
        "m" => Duration::try_minutes(num),
        "h" => Duration::try_hours(num),
        "d" => Duration::try_days(num),
        "w" => Duration::try_weeks(num),
        _ => anyhow::bail!("Unknown duration unit: {}", unit),
    };

    duration
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .with_context(|| format!("Duration out of range: {:?}", s))
}

fn generate_request_id() -> String {
    format!("cli-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        let since = parse_duration("2h").unwrap();
        let ago = Utc::now() - since;
        assert!(ago >= Duration::minutes(119) && ago <= Duration::minutes(121));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("5y").is_err());
        assert!(parse_duration("-3d").is_err());
    }

    #[test]
    fn test_parse_duration_multibyte_unit() {
        assert!(parse_duration("5µ").is_err());
        assert!(parse_duration("µ").is_err());
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        assert!(parse_duration("4000000000w").is_err());
        assert!(parse_duration("20000000w").is_err());
    }
}
