//! AppState construction and background-task spawning extracted from `main.rs`.

use std::sync::Arc;

use anyhow::Context;
use sha2::{Digest, Sha256};

use la_domain::config::{Config, ConfigSeverity};
use la_memory::{MemoryCurator, MemoryStore};
use la_providers::{LlmProvider, OpenAiCompatProvider};
use la_sessions::Ledger;

use crate::runtime::{EgressDeduplicator, GuardedSender, LaneScheduler, LlmAgent, OutboundRouter};
use crate::state::AppState;

/// Interval between egress marker pruning passes.
const EGRESS_PRUNE_INTERVAL_SECS: u64 = 3600;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`].
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── State directories ────────────────────────────────────────────
    let state_cfg = &config.state;
    for dir in [
        state_cfg.sessions_dir(),
        state_cfg.memory_dir(),
        state_cfg.egress_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;
    }
    tracing::info!(path = %state_cfg.path.display(), "state directory ready");

    // ── Ledger + memory store ────────────────────────────────────────
    let ledger = Ledger::new(&state_cfg.sessions_dir());
    let memory = MemoryStore::new(&state_cfg.memory_dir());

    // ── LLM provider ─────────────────────────────────────────────────
    let provider: Arc<dyn LlmProvider> = Arc::new(
        OpenAiCompatProvider::from_config(&config.llm).context("initializing LLM provider")?,
    );
    tracing::info!(
        provider = %config.llm.provider_id,
        model = %config.llm.model,
        "LLM provider ready"
    );

    // ── Memory curator ───────────────────────────────────────────────
    let curator = if config.memory.enabled {
        tracing::info!(
            extract_min_entries = config.memory.extract_min_entries,
            model = %config.llm.summarizer_model(),
            "memory curator ready"
        );
        Some(MemoryCurator::new(
            memory.clone(),
            ledger.clone(),
            provider.clone(),
            Some(config.llm.summarizer_model().to_owned()),
            config.memory.clone(),
            config.ledger.clone(),
        ))
    } else {
        tracing::info!("memory curator disabled");
        None
    };

    // ── Outbound + egress guard ──────────────────────────────────────
    let router =
        Arc::new(OutboundRouter::from_config(&config.outbound).context("building outbound senders")?);
    let dedup = if config.egress.enabled {
        tracing::info!(
            dir = %state_cfg.egress_dir().display(),
            retention_hours = config.egress.retention_hours,
            "egress deduplication enabled"
        );
        Some(EgressDeduplicator::new(&state_cfg.egress_dir()))
    } else {
        tracing::warn!("egress deduplication DISABLED, replayed events may be answered twice");
        None
    };
    let egress = GuardedSender::new(dedup, router);

    // ── Agent + scheduler ────────────────────────────────────────────
    let agent = Arc::new(
        LlmAgent::new(
            provider,
            ledger.clone(),
            memory.clone(),
            config.llm.history_entries,
        )
        .with_model(Some(config.llm.model.clone())),
    );
    let scheduler = LaneScheduler::new(
        config.lanes.clone(),
        agent,
        ledger.clone(),
        egress,
        curator.clone(),
    );
    tracing::info!(
        max_concurrency = config.lanes.max_concurrency,
        correction_max_rounds = config.lanes.correction_max_rounds,
        turn_timeout_secs = ?config.lanes.turn_timeout_secs,
        "lane scheduler ready"
    );

    // ── API token (read once, hash for constant-time comparison) ─────
    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var).ok().filter(|t| !t.is_empty()) {
            Some(t) => {
                tracing::info!(source = %format!("env:{env_var}"), "API bearer-token auth enabled");
                Some(Sha256::digest(t.as_bytes()).to_vec())
            }
            None => {
                tracing::warn!("API bearer-token auth DISABLED, set the {env_var} env var");
                None
            }
        }
    };

    Ok(AppState {
        config,
        ledger,
        memory,
        curator,
        scheduler,
        api_token_hash,
    })
}

/// Spawn periodic maintenance loops.
pub fn spawn_background_tasks(state: &AppState) {
    // ── Egress marker pruning (once at startup, then hourly) ─────────
    if state.config.egress.enabled {
        let dedup = EgressDeduplicator::new(&state.config.state.egress_dir());
        let max_age = chrono::Duration::hours(state.config.egress.retention_hours as i64);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(EGRESS_PRUNE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let dedup = dedup.clone();
                match tokio::task::spawn_blocking(move || dedup.prune_older_than(max_age)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "egress marker pruning failed"),
                    Err(e) => tracing::warn!(error = %e, "egress pruning task failed"),
                }
            }
        });
    }
}
