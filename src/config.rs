//! Tenant configuration
//!
//! One engine instance serves exactly one tenant. The only required item is
//! the tenant id; everything else carries a production default and can be
//! overridden from `ACS_*` environment variables or a JSON file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AcsError, AcsResult};

/// Engine configuration for a single tenant process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcsConfig {
    /// Tenant identifier (required)
    pub tenant_id: String,

    /// Database URL (e.g., "sqlite://acs.db")
    pub database_url: String,

    /// Data directory for the DLQ file and other tenant-local state
    pub data_dir: PathBuf,

    /// Command channel capacity; a full channel blocks submitters
    pub channel_capacity: usize,

    /// Seconds the executor keeps draining after shutdown is signalled
    pub drain_deadline_secs: u64,

    /// Maximum persistence attempts per command
    pub retry_max_attempts: u32,

    /// Base backoff in seconds, doubled per attempt
    pub retry_base_backoff_secs: u64,

    /// Per-call persistence deadline in seconds
    pub persistence_timeout_secs: u64,

    /// Entity cache time-to-live in seconds
    pub cache_ttl_secs: u64,

    /// Entity cache capacity (entries per cache)
    pub cache_capacity: u64,

    /// DLQ drain interval in seconds
    pub dlq_drain_interval_secs: u64,

    /// Re-drive failures before a DLQ entry is abandoned
    pub dlq_abandon_threshold: u32,

    /// Root directory for archive files
    pub archive_root: Option<PathBuf>,

    /// Enable the health snapshot consumer (console dashboard)
    pub dashboard_enabled: bool,

    /// Dashboard / health sampler refresh interval in seconds
    pub dashboard_refresh_secs: u64,
}

impl Default for AcsConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            database_url: "sqlite://acs.db".to_string(),
            data_dir: PathBuf::from("./acs-data"),
            channel_capacity: 1000,
            drain_deadline_secs: 10,
            retry_max_attempts: 3,
            retry_base_backoff_secs: 2,
            persistence_timeout_secs: 30,
            cache_ttl_secs: 300,
            cache_capacity: 10_000,
            dlq_drain_interval_secs: 60,
            dlq_abandon_threshold: 5,
            archive_root: None,
            dashboard_enabled: false,
            dashboard_refresh_secs: 5,
        }
    }
}

impl AcsConfig {
    /// Build a configuration for the given tenant with defaults elsewhere
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    /// Load configuration from the process environment
    ///
    /// `ACS_TENANT_ID` is required; the remaining variables fall back to
    /// defaults. Durations are plain integer seconds.
    pub fn from_env() -> AcsResult<Self> {
        let tenant_id = std::env::var("ACS_TENANT_ID")
            .map_err(|_| AcsError::InvalidArgument("ACS_TENANT_ID is not set".into()))?;

        let mut config = Self::for_tenant(tenant_id);

        if let Ok(url) = std::env::var("ACS_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(dir) = std::env::var("ACS_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(root) = std::env::var("ACS_ARCHIVE_ROOT") {
            config.archive_root = Some(PathBuf::from(root));
        }
        if let Ok(v) = std::env::var("ACS_CHANNEL_CAPACITY") {
            config.channel_capacity = parse_var("ACS_CHANNEL_CAPACITY", &v)?;
        }
        if let Ok(v) = std::env::var("ACS_RETRY_MAX_ATTEMPTS") {
            config.retry_max_attempts = parse_var("ACS_RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Ok(v) = std::env::var("ACS_RETRY_BASE_BACKOFF_SECS") {
            config.retry_base_backoff_secs = parse_var("ACS_RETRY_BASE_BACKOFF_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("ACS_DASHBOARD_ENABLED") {
            config.dashboard_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("ACS_DASHBOARD_REFRESH_SECS") {
            config.dashboard_refresh_secs = parse_var("ACS_DASHBOARD_REFRESH_SECS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &std::path::Path) -> AcsResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AcsError::InvalidArgument(format!("cannot read {}: {e}", path.display())))?;
        let config: AcsConfig = serde_json::from_str(&contents)
            .map_err(|e| AcsError::InvalidArgument(format!("invalid config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that defaults cannot guarantee
    pub fn validate(&self) -> AcsResult<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(AcsError::InvalidArgument("tenant id must not be empty".into()));
        }
        if self.channel_capacity == 0 {
            return Err(AcsError::InvalidArgument(
                "channel capacity must be positive".into(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(AcsError::InvalidArgument(
                "retry attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Drain deadline as a [`Duration`]
    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.drain_deadline_secs)
    }

    /// Base retry backoff as a [`Duration`]
    pub fn retry_base_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_base_backoff_secs)
    }

    /// Per-call persistence deadline as a [`Duration`]
    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_secs(self.persistence_timeout_secs)
    }

    /// Path of the tenant's DLQ file
    pub fn dlq_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}-dlq.jsonl", self.tenant_id))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> AcsResult<T> {
    value
        .parse()
        .map_err(|_| AcsError::InvalidArgument(format!("{name} has invalid value {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AcsConfig::for_tenant("tenant-a");
        assert_eq!(config.tenant_id, "tenant-a");
        assert_eq!(config.channel_capacity, 1000);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_base_backoff_secs, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_tenant_rejected() {
        let config = AcsConfig::default();
        assert!(matches!(
            config.validate(),
            Err(AcsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_dlq_path_is_per_tenant() {
        let a = AcsConfig::for_tenant("a");
        let b = AcsConfig::for_tenant("b");
        assert_ne!(a.dlq_path(), b.dlq_path());
    }
}
