use std::path::Path;

use leasepool::LeasepoolConfig;

pub fn check(config: &str) -> anyhow::Result<()> {
    let loaded = LeasepoolConfig::from_file(Path::new(config))?;
    println!("{}", summary(&loaded)?);
    println!("✓ {config} is valid");
    Ok(())
}

/// Resolve and validate every section, rendering the effective settings.
pub fn summary(config: &LeasepoolConfig) -> anyhow::Result<String> {
    let pool = config.pool_config()?;
    pool.validate()?;
    let transport = config.transport()?;
    let target = config.connect_target();

    let max_lease = match pool.max_lease {
        Some(d) => format!("{d:?}"),
        None => "off".to_string(),
    };

    Ok(format!(
        "target:    {}/{} as {} (tls: {})\n\
         pool:      size {}, reclaim every {:?}\n\
         leases:    max {max_lease}, idle shutdown after {:?}\n\
         timeouts:  connect {:?}, recv {:?}",
        target.address(),
        target.database,
        target.user,
        transport.tls,
        pool.size,
        pool.reclaim_interval,
        pool.max_idle,
        transport.connect_timeout,
        transport.recv_timeout,
    ))
}
