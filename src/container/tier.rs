//! Service tier resource classes.
//!
//! The table below is contractual; unknown tier strings are rejected rather
//! than defaulted.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::container::ProvisionError;

/// CPU quota period in microseconds; quota = cores * period.
const CPU_PERIOD_US: i64 = 100_000;

const GIB: i64 = 1024 * 1024 * 1024;

/// Service tier of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

/// Resource class applied to every sandbox of a tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierLimits {
    /// CPU cores (fractional allowed)
    pub cpu_cores: f64,
    /// Memory ceiling in bytes
    pub memory_bytes: i64,
    /// Disk quota in bytes
    pub disk_bytes: i64,
    /// PID limit
    pub pids_limit: i64,
    /// Idle time before eviction
    pub idle_timeout: Duration,
    /// Containers a user may hold across the fleet
    pub max_containers: u32,
}

impl Tier {
    /// Parse a stored or client-supplied tier string.
    pub fn parse(s: &str) -> Result<Self, ProvisionError> {
        match s {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(ProvisionError::UnknownTier(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn limits(&self) -> TierLimits {
        match self {
            Tier::Free => TierLimits {
                cpu_cores: 0.5,
                memory_bytes: GIB,
                disk_bytes: 5 * GIB,
                pids_limit: 100,
                idle_timeout: Duration::from_secs(30 * 60),
                max_containers: 1,
            },
            Tier::Pro => TierLimits {
                cpu_cores: 2.0,
                memory_bytes: 4 * GIB,
                disk_bytes: 20 * GIB,
                pids_limit: 500,
                idle_timeout: Duration::from_secs(60 * 60),
                max_containers: 3,
            },
            Tier::Enterprise => TierLimits {
                cpu_cores: 4.0,
                memory_bytes: 8 * GIB,
                disk_bytes: 50 * GIB,
                pids_limit: 1000,
                idle_timeout: Duration::from_secs(120 * 60),
                max_containers: 10,
            },
        }
    }

    /// CPU quota in microseconds per scheduling period.
    pub fn cpu_quota(&self) -> i64 {
        (self.limits().cpu_cores * CPU_PERIOD_US as f64) as i64
    }

    /// Scheduling period matching [`Tier::cpu_quota`].
    pub fn cpu_period(&self) -> i64 {
        CPU_PERIOD_US
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parse_roundtrip() {
        for tier in [Tier::Free, Tier::Pro, Tier::Enterprise] {
            assert_eq!(Tier::parse(tier.as_str()).unwrap(), tier);
        }
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let err = Tier::parse("platinum").unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownTier(_)));
        assert_eq!(err.kind(), "UnknownTier");
    }

    #[test]
    fn test_contract_table() {
        let free = Tier::Free.limits();
        assert_eq!(free.memory_bytes, GIB);
        assert_eq!(free.pids_limit, 100);
        assert_eq!(free.idle_timeout, Duration::from_secs(1800));
        assert_eq!(free.max_containers, 1);

        let pro = Tier::Pro.limits();
        assert_eq!(pro.memory_bytes, 4 * GIB);
        assert_eq!(pro.disk_bytes, 20 * GIB);
        assert_eq!(pro.max_containers, 3);

        let ent = Tier::Enterprise.limits();
        assert_eq!(ent.pids_limit, 1000);
        assert_eq!(ent.idle_timeout, Duration::from_secs(7200));
    }

    #[test]
    fn test_cpu_quota_math() {
        assert_eq!(Tier::Free.cpu_quota(), 50_000);
        assert_eq!(Tier::Pro.cpu_quota(), 200_000);
        assert_eq!(Tier::Enterprise.cpu_quota(), 400_000);
    }
}
