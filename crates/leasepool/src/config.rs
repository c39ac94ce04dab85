//! Pool configuration and the `leasepool.toml` file format.
//!
//! [`PoolConfig`] is the in-memory configuration captured by each pool
//! instance when it is created. [`LeasepoolConfig`] is the TOML
//! representation used by the CLI; it resolves into a `PoolConfig`, a
//! [`ConnectTarget`] and the transport settings for the TCP factory.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Largest pool size accepted by [`PoolConfig::validate`].
pub const MAX_POOL_SIZE: usize = 100;

/// Shortest accepted timing value.
const MIN_TIMING: Duration = Duration::from_millis(1);

/// Longest accepted timing value: the reclaimer keeps timings as `u64` millis.
const MAX_TIMING: Duration = Duration::from_millis(u64::MAX);

/// Configuration captured by a pool instance at creation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of connections held by the pool (default: 10, range 1..=100).
    pub size: usize,
    /// Pause between reclaimer sweeps (default: 1s).
    pub reclaim_interval: Duration,
    /// Longest a lease may be held before the reclaimer takes the
    /// connection back (default: 1s). `None` means leases never expire.
    pub max_lease: Option<Duration>,
    /// How long every connection must sit idle before the pool shuts
    /// itself down (default: 1s).
    pub max_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            reclaim_interval: Duration::from_secs(1),
            max_lease: Some(Duration::from_secs(1)),
            max_idle: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    pub fn with_size(self, size: usize) -> Self {
        Self { size, ..self }
    }

    pub fn with_reclaim_interval(self, reclaim_interval: Duration) -> Self {
        Self {
            reclaim_interval,
            ..self
        }
    }

    /// Set the lease limit; `None` disables lease expiry.
    pub fn with_max_lease(self, max_lease: Option<Duration>) -> Self {
        Self { max_lease, ..self }
    }

    pub fn with_max_idle(self, max_idle: Duration) -> Self {
        Self { max_idle, ..self }
    }

    /// Check the values a pool instance needs before it can be created.
    pub fn validate(&self) -> PoolResult<()> {
        let lease_too_short = self.max_lease.is_some_and(|lease| lease < MIN_TIMING);
        if self.reclaim_interval < MIN_TIMING || self.max_idle < MIN_TIMING || lease_too_short {
            return Err(PoolError::Initialization(
                "reclaimer timings must be at least 1ms".to_string(),
            ));
        }

        let lease_too_long = self.max_lease.is_some_and(|lease| lease > MAX_TIMING);
        if self.reclaim_interval > MAX_TIMING || self.max_idle > MAX_TIMING || lease_too_long {
            return Err(PoolError::Initialization(format!(
                "reclaimer timings must be at most {}ms",
                u64::MAX
            )));
        }

        if self.size < 1 || self.size > MAX_POOL_SIZE {
            return Err(PoolError::Initialization(format!(
                "pool size must be between 1 and {MAX_POOL_SIZE}, got {}",
                self.size
            )));
        }

        Ok(())
    }
}

/// Where new connections are opened.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

impl ConnectTarget {
    pub fn new(host: &str, port: u16, database: &str, user: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            database: database.to_string(),
            user: user.to_string(),
            password: None,
        }
    }

    pub fn with_password(self, password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..self
        }
    }

    /// `host:port`, as handed to the resolver.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Password stays out of logs.
impl std::fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Socket settings for the TCP connection factory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub tls: bool,
    pub connect_timeout: Duration,
    pub recv_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: false,
            connect_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(30),
        }
    }
}

// ── leasepool.toml ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasepoolConfig {
    pub pool: Option<PoolSection>,
    pub target: TargetSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSection {
    pub size: Option<usize>,
    pub reclaim_interval: Option<String>,
    /// Duration string, or `"off"` to disable lease expiry.
    pub max_lease: Option<String>,
    pub max_idle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSection {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub tls: Option<bool>,
    pub connect_timeout: Option<String>,
    pub recv_timeout: Option<String>,
}

impl LeasepoolConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a config pointing at a local Postgres server.
    pub fn scaffold() -> Self {
        LeasepoolConfig {
            pool: Some(PoolSection {
                size: Some(10),
                reclaim_interval: Some("1s".to_string()),
                max_lease: Some("30s".to_string()),
                max_idle: Some("5m".to_string()),
            }),
            target: TargetSection {
                host: "localhost".to_string(),
                port: 5432,
                database: "postgres".to_string(),
                user: "postgres".to_string(),
                password: None,
                tls: Some(false),
                connect_timeout: Some("5s".to_string()),
                recv_timeout: Some("30s".to_string()),
            },
        }
    }

    /// Resolve the `[pool]` table, falling back to defaults for missing keys.
    ///
    /// Only the duration syntax is checked here; range checks happen in
    /// [`PoolConfig::validate`] when the pool instance is created.
    pub fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let defaults = PoolConfig::default();
        let Some(section) = &self.pool else {
            return Ok(defaults);
        };

        let max_lease = match section.max_lease.as_deref() {
            None => defaults.max_lease,
            Some(s) if is_off(s) => None,
            Some(s) => Some(parse_duration(s).context("pool.max_lease")?),
        };

        Ok(PoolConfig {
            size: section.size.unwrap_or(defaults.size),
            reclaim_interval: optional_duration(
                section.reclaim_interval.as_deref(),
                defaults.reclaim_interval,
            )
            .context("pool.reclaim_interval")?,
            max_lease,
            max_idle: optional_duration(section.max_idle.as_deref(), defaults.max_idle)
                .context("pool.max_idle")?,
        })
    }

    pub fn connect_target(&self) -> ConnectTarget {
        let t = &self.target;
        ConnectTarget {
            host: t.host.clone(),
            port: t.port,
            database: t.database.clone(),
            user: t.user.clone(),
            password: t.password.clone(),
        }
    }

    pub fn transport(&self) -> anyhow::Result<TransportConfig> {
        let defaults = TransportConfig::default();
        let t = &self.target;
        Ok(TransportConfig {
            tls: t.tls.unwrap_or(defaults.tls),
            connect_timeout: optional_duration(
                t.connect_timeout.as_deref(),
                defaults.connect_timeout,
            )
            .context("target.connect_timeout")?,
            recv_timeout: optional_duration(t.recv_timeout.as_deref(), defaults.recv_timeout)
                .context("target.recv_timeout")?,
        })
    }
}

fn is_off(s: &str) -> bool {
    matches!(s.trim(), "off" | "none" | "never")
}

fn optional_duration(value: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    value.map(parse_duration).transpose().map(|d| d.unwrap_or(default))
}

/// Parse `"250ms"`, `"2s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (digits, millis_per_unit): (&str, u64) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        anyhow::bail!("invalid duration '{s}': expected a unit of ms, s, m or h");
    };

    let n: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid duration '{s}'"))?;
    let Some(millis) = n.checked_mul(millis_per_unit) else {
        anyhow::bail!("duration '{s}' is too large");
    };
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[pool]
size = 4
reclaim_interval = "50ms"
max_lease = "off"
max_idle = "2m"

[target]
host = "db.internal"
port = 5432
database = "orders"
user = "app"
password = "hunter2"
connect_timeout = "2s"
"#;

    #[test]
    fn default_config_is_valid() {
        let config = PoolConfig::default();
        assert_eq!(config.size, 10);
        assert_eq!(config.max_lease, Some(Duration::from_secs(1)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_size_out_of_range() {
        for size in [0, MAX_POOL_SIZE + 1] {
            let err = PoolConfig::default().with_size(size).validate().unwrap_err();
            assert!(matches!(err, PoolError::Initialization(_)), "size {size}");
        }
        assert!(PoolConfig::default().with_size(MAX_POOL_SIZE).validate().is_ok());
        assert!(PoolConfig::default().with_size(1).validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_timings() {
        let zero = Duration::ZERO;
        let cases = [
            PoolConfig::default().with_reclaim_interval(zero),
            PoolConfig::default().with_max_idle(zero),
            PoolConfig::default().with_max_lease(Some(zero)),
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(PoolError::Initialization(_))));
        }
    }

    #[test]
    fn validate_rejects_timings_beyond_millis_range() {
        let huge = Duration::from_secs(u64::MAX);
        let cases = [
            PoolConfig::default().with_reclaim_interval(huge),
            PoolConfig::default().with_max_idle(huge),
            PoolConfig::default().with_max_lease(Some(huge)),
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(PoolError::Initialization(_))));
        }
        let longest = PoolConfig::default().with_max_idle(MAX_TIMING);
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn disabled_lease_limit_is_valid() {
        let config = PoolConfig::default().with_max_lease(None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn connect_target_debug_hides_password() {
        let target = ConnectTarget::new("db", 5432, "app", "svc").with_password("s3cret");
        let rendered = format!("{target:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("***"));
        assert_eq!(target.address(), "db:5432");
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 10s ").unwrap(), Duration::from_secs(10));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn parse_duration_rejects_overflow() {
        for input in ["307445734561825861m", "5124095576030432h", "18446744073709552s"] {
            let err = parse_duration(input).unwrap_err();
            assert!(err.to_string().contains("too large"), "{input}: {err}");
        }
        assert_eq!(
            parse_duration("18446744073709551615ms").unwrap(),
            Duration::from_millis(u64::MAX)
        );
    }

    #[test]
    fn oversized_duration_in_file_names_the_key() {
        let config = LeasepoolConfig::parse(
            r#"
[pool]
max_idle = "5124095576030432h"

[target]
host = "localhost"
port = 5432
database = "postgres"
user = "postgres"
"#,
        )
        .unwrap();
        let err = config.pool_config().unwrap_err();
        assert!(format!("{err:#}").contains("pool.max_idle"), "{err:#}");
    }

    #[test]
    fn file_config_resolves_sections() {
        let config = LeasepoolConfig::parse(SAMPLE).unwrap();

        let pool = config.pool_config().unwrap();
        assert_eq!(pool.size, 4);
        assert_eq!(pool.reclaim_interval, Duration::from_millis(50));
        assert_eq!(pool.max_lease, None);
        assert_eq!(pool.max_idle, Duration::from_secs(120));

        let target = config.connect_target();
        assert_eq!(target.host, "db.internal");
        assert_eq!(target.password.as_deref(), Some("hunter2"));

        let transport = config.transport().unwrap();
        assert!(!transport.tls);
        assert_eq!(transport.connect_timeout, Duration::from_secs(2));
        assert_eq!(transport.recv_timeout, Duration::from_secs(30));
    }

    #[test]
    fn missing_pool_section_uses_defaults() {
        let config = LeasepoolConfig::parse(
            "[target]\nhost = \"h\"\nport = 1\ndatabase = \"d\"\nuser = \"u\"\n",
        )
        .unwrap();
        assert_eq!(config.pool_config().unwrap(), PoolConfig::default());
    }

    #[test]
    fn bad_duration_names_the_key() {
        let mut config = LeasepoolConfig::scaffold();
        if let Some(pool) = config.pool.as_mut() {
            pool.max_idle = Some("soon".to_string());
        }
        let err = config.pool_config().unwrap_err();
        assert!(format!("{err:#}").contains("pool.max_idle"));
    }

    #[test]
    fn scaffold_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leasepool.toml");
        let scaffold = LeasepoolConfig::scaffold();
        std::fs::write(&path, scaffold.to_toml_string().unwrap()).unwrap();

        let loaded = LeasepoolConfig::from_file(&path).unwrap();
        assert_eq!(loaded.connect_target(), scaffold.connect_target());
        assert_eq!(loaded.pool_config().unwrap(), scaffold.pool_config().unwrap());
        assert!(loaded.pool_config().unwrap().validate().is_ok());
    }
}
