//! Default schedule and environment overrides applied at first startup.

use tracing::warn;

use super::config::{ProviderSelection, ScheduleConfig, MAX_SCHEDULE_SECS};

pub const ENV_ENABLED: &str = "AUTO_TEST_ENABLED";
pub const ENV_INTERVAL: &str = "AUTO_TEST_INTERVAL";
pub const ENV_PROVIDER: &str = "AUTO_TEST_PROVIDER";
pub const ENV_DELAY: &str = "DELAY_BETWEEN_TESTS";

/// Out-of-box schedule: both providers daily, five minutes apart.
pub fn defaults() -> ScheduleConfig {
    ScheduleConfig::default()
}

/// Overlay `AUTO_TEST_*` / `DELAY_BETWEEN_TESTS` values onto `base`.
///
/// `lookup` abstracts the environment so tests need not mutate it.
/// Unparsable values are logged and ignored.
pub fn apply_env<F>(base: ScheduleConfig, lookup: F) -> ScheduleConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = base;

    if let Some(v) = lookup(ENV_ENABLED) {
        match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => cfg.enabled = true,
            "false" | "0" | "no" | "off" => cfg.enabled = false,
            _ => warn!(var = ENV_ENABLED, value = %v, "ignoring unparsable boolean"),
        }
    }

    if let Some(v) = lookup(ENV_INTERVAL) {
        match v.trim().parse::<u64>() {
            Ok(secs) if secs > 0 && secs <= MAX_SCHEDULE_SECS => cfg.interval_secs = secs,
            _ => warn!(var = ENV_INTERVAL, value = %v, "ignoring invalid interval"),
        }
    }

    if let Some(v) = lookup(ENV_PROVIDER) {
        match v.parse::<ProviderSelection>() {
            Ok(p) => cfg.provider = p,
            Err(e) => warn!(var = ENV_PROVIDER, value = %v, error = %e, "ignoring provider"),
        }
    }

    if let Some(v) = lookup(ENV_DELAY) {
        match v.trim().parse::<u64>() {
            Ok(secs) if secs <= MAX_SCHEDULE_SECS => cfg.delay_secs = secs,
            _ => warn!(var = ENV_DELAY, value = %v, "ignoring invalid delay"),
        }
    }

    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_run_both_daily() {
        let d = defaults();
        assert!(d.enabled);
        assert_eq!(d.interval_secs, 86_400);
        assert_eq!(d.provider, ProviderSelection::Both);
        assert_eq!(d.delay_secs, 300);
    }

    #[test]
    fn test_env_overrides() {
        let cfg = apply_env(
            defaults(),
            env(&[
                (ENV_ENABLED, "False"),
                (ENV_INTERVAL, "3600"),
                (ENV_PROVIDER, "speedsmart"),
                (ENV_DELAY, "0"),
            ]),
        );
        assert_eq!(
            cfg,
            ScheduleConfig {
                enabled: false,
                interval_secs: 3600,
                provider: ProviderSelection::SpeedSmart,
                delay_secs: 0,
            }
        );
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let cfg = apply_env(
            defaults(),
            env(&[(ENV_INTERVAL, "0"), (ENV_PROVIDER, "ookla"), (ENV_DELAY, "-5")]),
        );
        assert_eq!(cfg, defaults());

        let cfg = apply_env(
            defaults(),
            env(&[(ENV_INTERVAL, "18446744073709551615"), (ENV_DELAY, "999999999999")]),
        );
        assert_eq!(cfg, defaults());
    }
}
