//! Configuration for the controller binary.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use autopilot_reconcile::{DynamicObject, RateLimiterConfig};

use crate::controller::ControllerConfig;
use crate::watch::DEFAULT_RESYNC_INTERVAL;

/// Controller binary configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Worker pool, drain and retry settings.
    pub controller: ControllerConfig,

    /// Period between full resyncs of the mirror. Zero disables resync.
    pub resync_interval: Duration,

    /// JSON file holding the initial object list.
    pub seed_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            seed_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// Unset variables take their defaults; set but unparsable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let limiter_defaults = RateLimiterConfig::default();

        let workers: usize = parse(&lookup, "AUTOPILOT_WORKERS")?
            .unwrap_or(defaults.controller.workers);
        if workers == 0 {
            bail!("AUTOPILOT_WORKERS must be at least 1");
        }

        let base_delay = parse(&lookup, "AUTOPILOT_BASE_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(limiter_defaults.base_delay);

        let backoff_factor: u32 = parse(&lookup, "AUTOPILOT_BACKOFF_FACTOR")?
            .unwrap_or(limiter_defaults.backoff_factor);
        if backoff_factor == 0 {
            bail!("AUTOPILOT_BACKOFF_FACTOR must be at least 1");
        }

        let max_delay = parse(&lookup, "AUTOPILOT_MAX_DELAY_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(limiter_defaults.max_delay);

        let qps: f64 = parse(&lookup, "AUTOPILOT_RETRY_QPS")?
            .unwrap_or(limiter_defaults.qps);
        if !qps.is_finite() {
            bail!("AUTOPILOT_RETRY_QPS must be a finite number");
        }

        let burst: u32 = parse(&lookup, "AUTOPILOT_RETRY_BURST")?
            .unwrap_or(limiter_defaults.burst);

        let resync_interval = parse(&lookup, "AUTOPILOT_RESYNC_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.resync_interval);

        let sync_poll_interval = parse(&lookup, "AUTOPILOT_SYNC_POLL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.controller.sync_poll_interval);
        if sync_poll_interval.is_zero() {
            bail!("AUTOPILOT_SYNC_POLL_MS must be at least 1");
        }

        // 0 waits for every delayed key.
        let drain_timeout = match parse::<u64>(&lookup, "AUTOPILOT_DRAIN_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.controller.drain_timeout,
        };

        let seed_file = lookup("AUTOPILOT_SEED_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let log_level = lookup("AUTOPILOT_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            controller: ControllerConfig {
                workers,
                sync_poll_interval,
                drain_timeout,
                rate_limiter: RateLimiterConfig {
                    base_delay,
                    backoff_factor,
                    max_delay,
                    qps,
                    burst,
                },
            },
            resync_interval,
            seed_file,
            log_level,
        })
    }
}

/// Read the initial object list from a JSON array of objects.
pub fn load_seed(path: &Path) -> Result<Vec<DynamicObject>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    let objects = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse seed file {}", path.display()))?;
    Ok(objects)
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {name}: {raw:?}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use autopilot_reconcile::Key;
    use rstest::rstest;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.resync_interval, Duration::from_secs(600));
        assert_eq!(
            config.controller.rate_limiter.base_delay,
            Duration::from_millis(5)
        );
        assert_eq!(config.controller.rate_limiter.burst, 100);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("AUTOPILOT_WORKERS", "8"),
            ("AUTOPILOT_BASE_DELAY_MS", "50"),
            ("AUTOPILOT_BACKOFF_FACTOR", "3"),
            ("AUTOPILOT_MAX_DELAY_SECS", "60"),
            ("AUTOPILOT_RETRY_QPS", "2.5"),
            ("AUTOPILOT_RETRY_BURST", "5"),
            ("AUTOPILOT_RESYNC_SECS", "0"),
            ("AUTOPILOT_SYNC_POLL_MS", "10"),
            ("AUTOPILOT_DRAIN_TIMEOUT_SECS", "0"),
            ("AUTOPILOT_SEED_FILE", "/etc/autopilot/seed.json"),
            ("AUTOPILOT_LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.controller.workers, 8);
        assert_eq!(
            config.controller.rate_limiter,
            RateLimiterConfig {
                base_delay: Duration::from_millis(50),
                backoff_factor: 3,
                max_delay: Duration::from_secs(60),
                qps: 2.5,
                burst: 5,
            }
        );
        assert!(config.resync_interval.is_zero());
        assert_eq!(
            config.controller.sync_poll_interval,
            Duration::from_millis(10)
        );
        assert_eq!(config.controller.drain_timeout, None);
        assert_eq!(
            config.seed_file,
            Some(PathBuf::from("/etc/autopilot/seed.json"))
        );
        assert_eq!(config.log_level, "debug");
    }

    #[rstest]
    #[case("AUTOPILOT_WORKERS", "many")]
    #[case("AUTOPILOT_WORKERS", "0")]
    #[case("AUTOPILOT_BACKOFF_FACTOR", "0")]
    #[case("AUTOPILOT_RETRY_QPS", "NaN")]
    #[case("AUTOPILOT_SYNC_POLL_MS", "0")]
    #[case("AUTOPILOT_DRAIN_TIMEOUT_SECS", "-1")]
    fn test_invalid_values_rejected(#[case] name: &str, #[case] value: &str) {
        let err = Config::from_lookup(lookup_from(&[(name, value)])).unwrap_err();
        assert!(err.to_string().contains(name), "{err}");
    }

    #[test]
    fn test_load_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        std::fs::write(
            &path,
            r#"[
                {"kind": "Pod",
                 "metadata": {"name": "web", "namespace": "default", "resourceVersion": "3"}},
                {"kind": "Node", "metadata": {"name": "n1"}, "spec": {"unschedulable": true}}
            ]"#,
        )
        .unwrap();

        let objects = load_seed(&path).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].metadata.resource_version.as_deref(), Some("3"));
        assert_eq!(objects[1].spec["unschedulable"], true);
    }

    #[test]
    fn test_load_seed_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_seed(&path).unwrap_err();
        assert!(err.to_string().contains("seed.json"), "{err}");
        assert!(load_seed(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_tiny_retry_qps_yields_bounded_limiter() {
        let config = Config::from_lookup(lookup_from(&[
            ("AUTOPILOT_RETRY_QPS", "1e-20"),
            ("AUTOPILOT_RETRY_BURST", "0"),
        ]))
        .unwrap();

        let mut limiter = config.controller.rate_limiter.build();
        let key = Key::new("Pod", Some("default"), "web").unwrap();
        assert_eq!(limiter.when(&key), Duration::MAX);
        assert_eq!(limiter.num_requeues(&key), 1);
    }

    #[test]
    fn test_empty_seed_file_means_none() {
        let config = Config::from_lookup(lookup_from(&[("AUTOPILOT_SEED_FILE", "")])).unwrap();
        assert_eq!(config.seed_file, None);
    }
}
