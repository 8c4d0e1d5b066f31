//! Gateway CLI.
//!
//! Development harness for the out-of-scope wire transport: reads one
//! request JSON per line from stdin, writes one response JSON per line to
//! stdout, and runs the full request path plus event pipeline in between.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aegis_ai_gateway::backends::{BackendAdapter, RuleEngineAdapter, StaticLlmAdapter};
use aegis_ai_gateway::config::{GatewayConfig, GatewayConfigJson};
use aegis_ai_gateway::pipeline::{
    AnomalyDetector, EventPipeline, EventProcessor, EventStorage, StderrAlertSink,
};
use aegis_ai_gateway::registry::{Backend, BackendRegistry, BackendType, Capability};
use aegis_ai_gateway::request::Sensitivity;
use aegis_ai_gateway::{AuditLog, Gateway, TokenService};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Security-aware gateway for LLM traffic
///
/// Screens requests for PII and prompt injection, routes them to the
/// cheapest capable backend with cascade fallback, and emits security
/// events to an embedded monitoring pipeline.
#[derive(Parser, Debug)]
#[command(name = "aegis-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(long, env = "AEGIS_CONFIG")]
    config: Option<PathBuf>,

    /// Audit log file (NDJSON); stderr when unset
    #[arg(long, env = "AEGIS_AUDIT_LOG")]
    audit_log: Option<PathBuf>,

    /// Event/anomaly database file
    #[arg(long, env = "AEGIS_STORAGE", default_value = "aegis-events.db")]
    storage: PathBuf,

    /// Name of the environment variable holding the token signing secret
    #[arg(long, env = "AEGIS_TOKEN_SECRET_ENV", default_value = "AEGIS_TOKEN_SECRET")]
    token_secret_env: String,

    /// Enable verbose debug logging
    #[arg(long, short, env = "VERBOSE", default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    // Request/response lines own stdout; logs go to stderr
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let secret = std::env::var(&args.token_secret_env).with_context(|| {
        format!(
            "token signing secret not found; set the `{}` environment variable",
            args.token_secret_env
        )
    })?;

    let config_json = match &args.config {
        Some(path) => GatewayConfigJson::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => GatewayConfigJson::default(),
    };
    let backend_entries = if config_json.backends.is_empty() {
        info!("no backends configured; using the built-in demo set");
        default_backend_entries()
    } else {
        config_json.backend_entries()
    };
    let config: GatewayConfig = config_json.into();

    let registry = Arc::new(
        BackendRegistry::new(backend_entries).context("invalid backend configuration")?,
    );
    let audit = Arc::new(match &args.audit_log {
        Some(path) => AuditLog::to_file(path)
            .with_context(|| format!("failed to open audit log {}", path.display()))?,
        None => AuditLog::stderr(),
    });
    let storage = Arc::new(
        EventStorage::open(&args.storage)
            .with_context(|| format!("failed to open event storage {}", args.storage.display()))?,
    );

    let pipeline = EventPipeline::spawn(
        config.pipeline_config(),
        EventProcessor::new(),
        AnomalyDetector::new(config.anomaly.clone()),
        storage,
        Arc::new(StderrAlertSink),
    );
    let shutdown_deadline = Duration::from_secs(config.shutdown_deadline_secs);

    let gateway = Gateway::new(
        config,
        TokenService::new(secret.as_bytes()),
        registry.clone(),
        audit,
        pipeline.clone(),
    )
    .context("invalid PII pattern configuration")?;

    info!("Starting Aegis AI Gateway");
    info!("  Storage: {}", args.storage.display());
    for entry in registry.snapshot().iter() {
        let status = entry.adapter.health().await;
        info!(
            "  Backend {} ({}): {:?}",
            entry.descriptor.id,
            entry.descriptor.backend_type.as_str(),
            status
        );
    }
    info!("  Reading NDJSON requests from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => {
                        let response = gateway.handle(&line).await;
                        let mut out = serde_json::to_string(&response)?;
                        out.push('\n');
                        stdout.write_all(out.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        }
    }

    info!("draining event pipeline");
    if !pipeline.shutdown(shutdown_deadline).await {
        warn!("event pipeline did not drain within the shutdown deadline");
    }
    Ok(())
}

/// Built-in demo registry used when no backends are configured: a free rule
/// engine, a cheap PII-capable local model, and an expensive cloud model.
fn default_backend_entries() -> Vec<(Backend, Arc<dyn BackendAdapter>)> {
    let rules = Backend {
        id: "rules:security-faq".into(),
        backend_type: BackendType::RuleEngine,
        capabilities: [Capability::TextGeneration, Capability::SecurityScan].into(),
        cost_per_1k_tokens: 0.0,
        avg_latency_ms: 5,
        max_tokens: 512,
        confidence_threshold: 0.6,
        pii_allowed: true,
        confidential_allowed: false,
        sensitivity_allowed: sensitivities(&[
            Sensitivity::Public,
            Sensitivity::Internal,
            Sensitivity::Sensitive,
            Sensitivity::Pii,
        ]),
    };
    let local = Backend {
        id: "local:small".into(),
        backend_type: BackendType::LlmSmall,
        capabilities: [
            Capability::TextGeneration,
            Capability::Summarization,
            Capability::Classification,
        ]
        .into(),
        cost_per_1k_tokens: 0.001,
        avg_latency_ms: 400,
        max_tokens: 4096,
        confidence_threshold: 0.7,
        pii_allowed: true,
        confidential_allowed: false,
        sensitivity_allowed: sensitivities(&[
            Sensitivity::Public,
            Sensitivity::Internal,
            Sensitivity::Sensitive,
            Sensitivity::Pii,
        ]),
    };
    let cloud = Backend {
        id: "openai:gpt-4".into(),
        backend_type: BackendType::LlmLarge,
        capabilities: [
            Capability::TextGeneration,
            Capability::Summarization,
            Capability::CodeGeneration,
            Capability::Analysis,
            Capability::Translation,
        ]
        .into(),
        cost_per_1k_tokens: 0.03,
        avg_latency_ms: 1800,
        max_tokens: 8192,
        confidence_threshold: 0.9,
        pii_allowed: false,
        confidential_allowed: false,
        sensitivity_allowed: sensitivities(&[Sensitivity::Public, Sensitivity::Internal]),
    };

    vec![
        (
            rules.clone(),
            Arc::new(RuleEngineAdapter::new(
                rules,
                vec![(
                    "api security".into(),
                    "Use authenticated requests, least-privilege tokens, and rate limits."
                        .into(),
                )],
            )) as Arc<dyn BackendAdapter>,
        ),
        (
            local.clone(),
            Arc::new(StaticLlmAdapter::new(local)) as Arc<dyn BackendAdapter>,
        ),
        (
            cloud.clone(),
            Arc::new(StaticLlmAdapter::new(cloud)) as Arc<dyn BackendAdapter>,
        ),
    ]
}

fn sensitivities(levels: &[Sensitivity]) -> BTreeSet<Sensitivity> {
    levels.iter().copied().collect()
}
