use sg_domain::config::{Config, ConfigSeverity};

/// Validate the config, printing any issues and the secondary indexes it
/// declares.  Returns `false` when at least one error was found.
pub fn validate(config: &Config, config_path: &str) -> bool {
    let issues = config.validate();
    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();
    let warning_count = issues.len() - error_count;

    for issue in &issues {
        println!("{issue}");
    }
    if issues.is_empty() {
        println!("Config OK ({config_path})");
    } else {
        println!("\n{error_count} error(s), {warning_count} warning(s) in {config_path}");
    }
    println!("{}", index_summary(config));

    error_count == 0
}

/// One line naming each configured index and the attribute it reads.
fn index_summary(config: &Config) -> String {
    let indexes = &config.sessions.indexes;
    if indexes.is_empty() {
        return "no secondary indexes (find_by_principal_name returns nothing)".into();
    }
    let entries: Vec<String> = indexes
        .iter()
        .map(|i| format!("{} <- {}", i.name, i.attribute))
        .collect();
    format!("{} secondary index(es): {}", indexes.len(), entries.join(", "))
}

/// Dump the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &Config) -> anyhow::Result<()> {
    let output = toml::to_string_pretty(config)
        .map_err(|e| anyhow::anyhow!("serializing config: {e}"))?;
    print!("{output}");
    Ok(())
}
