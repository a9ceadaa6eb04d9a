use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default polling interval for all control-plane waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Immutable per-invocation deployment context.
///
/// The namespace is prepended to every resource name (`absolute_name`) and is
/// the sole mechanism by which instances, volumes and images are discovered:
/// no state is kept between invocations beyond provider-side tags.
#[derive(Debug, Clone, Deserialize)]
pub struct Environment {
    pub region: String,
    pub availability_zone: String,
    pub namespace: String,
}

impl Environment {
    pub fn new(region: &str, availability_zone: &str, namespace: &str) -> Result<Self> {
        // Zones are region-scoped: "us-west-2a" lives in "us-west-2". A zone
        // that does not extend the region is a misconfiguration, not
        // something to patch up at runtime.
        if !availability_zone.starts_with(region) || availability_zone == region {
            return Err(Error::Precondition(format!(
                "availability zone '{availability_zone}' is not in region '{region}'"
            )));
        }
        if namespace.is_empty() {
            return Err(Error::Precondition("namespace must not be empty".into()));
        }
        Ok(Self {
            region: region.to_string(),
            availability_zone: availability_zone.to_string(),
            namespace: namespace.to_string(),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_raw_values(
            std::env::var("CLOUDBOX_REGION").ok().as_deref(),
            std::env::var("CLOUDBOX_ZONE").ok().as_deref(),
            std::env::var("CLOUDBOX_NAMESPACE").ok().as_deref(),
        )
    }

    /// Build an Environment from raw string values (as they would come from
    /// env vars). Used directly in tests to avoid mutating process-global
    /// environment.
    pub fn from_raw_values(
        region: Option<&str>,
        zone: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<Self> {
        let region = region
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Precondition("CLOUDBOX_REGION is not set".into()))?;
        let zone = zone
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| format!("{region}a"));
        let namespace = namespace.filter(|s| !s.is_empty()).unwrap_or("dev");
        Self::new(region, &zone, namespace)
    }

    /// Load from a YAML file with `region`, `availability_zone` and
    /// `namespace` keys.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let env: Environment =
            serde_yaml::from_str(&raw).map_err(|e| Error::Serde(e.to_string()))?;
        Self::new(&env.region, &env.availability_zone, &env.namespace)
    }

    /// The globally unique name for a resource in this namespace:
    /// `"{namespace}-{name}"`. Used uniformly for instance tags, volume tags
    /// and image name prefixes.
    pub fn absolute_name(&self, name: &str) -> String {
        format!("{}-{}", self.namespace, name)
    }
}

/// Knobs for the polling loops.
///
/// One interval drives everything: the transition waiter's sleep, the TCP
/// connect timeout and the remote-command retry delay. Tests run with
/// millisecond intervals; real backends keep the 5s default.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Sleep between state observations, and the connect timeout for the
    /// reachability probe.
    pub interval: Duration,
    /// How many times a freshly created image may be invisible to describe
    /// calls before the propagation delay is treated as a real failure.
    pub visibility_attempts: u32,
    /// Bound on remote-liveness attempts. `None` retries forever, which is
    /// the default: provisioning is allowed to wait arbitrarily long and
    /// operators cancel externally.
    pub remote_attempt_limit: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            visibility_attempts: 10,
            remote_attempt_limit: None,
        }
    }
}

impl PollPolicy {
    /// A fast policy for tests and dry runs.
    pub fn fast() -> Self {
        Self {
            interval: Duration::from_millis(10),
            visibility_attempts: 3,
            remote_attempt_limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_name_prepends_namespace() {
        let env = Environment::new("us-west-2", "us-west-2a", "dev").unwrap();
        assert_eq!(env.absolute_name("cluster-leader"), "dev-cluster-leader");
    }

    #[test]
    fn zone_must_extend_region() {
        let err = Environment::new("us-west-2", "eu-west-1a", "dev").unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        // The bare region is not a zone either.
        assert!(Environment::new("us-west-2", "us-west-2", "dev").is_err());
    }

    #[test]
    fn empty_namespace_rejected() {
        assert!(Environment::new("us-west-2", "us-west-2a", "").is_err());
    }

    #[test]
    fn from_raw_values_defaults_zone_and_namespace() {
        let env = Environment::from_raw_values(Some("us-east-1"), None, None).unwrap();
        assert_eq!(env.availability_zone, "us-east-1a");
        assert_eq!(env.namespace, "dev");
    }

    #[test]
    fn from_raw_values_requires_region() {
        assert!(Environment::from_raw_values(None, None, None).is_err());
        assert!(Environment::from_raw_values(Some(""), None, None).is_err());
    }

    #[test]
    fn from_file_parses_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.yaml");
        std::fs::write(
            &path,
            "region: us-west-2\navailability_zone: us-west-2b\nnamespace: staging\n",
        )
        .unwrap();
        let env = Environment::from_file(&path).unwrap();
        assert_eq!(env.availability_zone, "us-west-2b");
        assert_eq!(env.absolute_name("data"), "staging-data");
    }

    #[test]
    fn default_policy_uses_five_second_interval() {
        let policy = PollPolicy::default();
        assert_eq!(policy.interval, Duration::from_secs(5));
        assert!(policy.remote_attempt_limit.is_none());
    }
}
