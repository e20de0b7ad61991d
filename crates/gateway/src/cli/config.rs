use la_domain::config::{Config, ConfigSeverity};

/// Parse and validate the config, printing any issues followed by a short
/// summary of the effective runtime limits.
///
/// Returns `false` when at least one error was found.
pub fn validate(config: &Config, config_path: &str) -> bool {
    let issues = config.validate();

    for issue in &issues {
        println!("{issue}");
    }

    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();
    let warning_count = issues.len() - error_count;

    if issues.is_empty() {
        println!("Config OK ({config_path})");
    } else {
        println!("\n{error_count} error(s), {warning_count} warning(s) in {config_path}");
    }

    println!("{}", summary(config));
    error_count == 0
}

/// Dump the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &Config) -> anyhow::Result<()> {
    let output = toml::to_string_pretty(config)
        .map_err(|e| anyhow::anyhow!("serializing config: {e}"))?;
    print!("{output}");
    Ok(())
}

fn summary(config: &Config) -> String {
    let timeout = match config.lanes.turn_timeout_secs {
        Some(secs) => format!("{secs}s"),
        None => "none".into(),
    };
    let memory = if config.memory.enabled {
        format!("every {} entries", config.memory.extract_min_entries)
    } else {
        "disabled".into()
    };
    format!(
        "state: {} | lanes: {} concurrent, {} merge round(s), timeout {timeout} | memory: {memory} | outbound: {} binding(s)",
        config.state.path.display(),
        config.lanes.max_concurrency,
        config.lanes.correction_max_rounds,
        config.outbound.len(),
    )
}
