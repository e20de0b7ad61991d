//! `laneagent egress prune`

use la_domain::config::Config;

use crate::runtime::EgressDeduplicator;

pub fn prune(config: &Config, older_than_hours: Option<u64>, dry_run: bool) -> anyhow::Result<()> {
    let hours = older_than_hours.unwrap_or(config.egress.retention_hours);
    let dir = config.state.egress_dir();
    let dedup = EgressDeduplicator::new(&dir);

    if dry_run {
        let count = dedup.count_older_than(chrono::Duration::hours(hours as i64))?;
        println!("{count} marker(s) older than {hours}h in {}", dir.display());
        return Ok(());
    }

    let removed = dedup.prune_older_than(chrono::Duration::hours(hours as i64))?;
    println!("removed {removed} marker(s) older than {hours}h from {}", dir.display());
    Ok(())
}
