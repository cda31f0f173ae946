use anyhow::{bail, Context, Result};
use rollcall_core::onnx::{self, DEFAULT_VERIFY_THRESHOLD};
use rollcall_core::{default_data_dir, AttendanceLedger, DistanceMetric, MatchStrategy, SessionConfig};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Config file looked up inside the data directory when `ROLLCALL_CONFIG`
/// is unset.
const CONFIG_FILE: &str = "rollcall.toml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Distance,
    Verification,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "distance" => Ok(StrategyKind::Distance),
            "verification" => Ok(StrategyKind::Verification),
            other => Err(format!("unknown match strategy {other:?}")),
        }
    }
}

/// CLI configuration: defaults, then `rollcall.toml`, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root for the gallery, ledger and config file.
    pub data_dir: PathBuf,
    /// Gallery directory (default: `<data_dir>/faces_db`).
    pub gallery_dir: Option<PathBuf>,
    /// Attendance CSV (default: `<data_dir>/attendance.csv`).
    pub ledger_path: Option<PathBuf>,
    /// Directory containing the ONNX model files.
    pub model_dir: Option<PathBuf>,
    pub strategy: StrategyKind,
    /// Distance metric for the distance strategy.
    pub metric: DistanceMetric,
    /// Largest distance (exclusive) still accepted as a match. Unset uses
    /// the ArcFace default for `metric`.
    pub threshold: Option<f32>,
    /// Cosine distance at or below which the provider verifies two faces.
    pub verify_threshold: f32,
    /// Suppress repeat attendance for the same name within this many
    /// seconds. Unset or 0 records every identification.
    pub dedup_window_secs: Option<u64>,
    /// Write a ledger row for unmatched faces.
    pub record_unknown: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            gallery_dir: None,
            ledger_path: None,
            model_dir: None,
            strategy: StrategyKind::default(),
            metric: DistanceMetric::default(),
            threshold: None,
            verify_threshold: DEFAULT_VERIFY_THRESHOLD,
            dedup_window_secs: None,
            record_unknown: true,
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let explicit = lookup("ROLLCALL_CONFIG").map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| data_dir.join(CONFIG_FILE));

        let mut config = if explicit.is_some() || path.exists() {
            let config = Self::from_file(&path)?;
            tracing::debug!(path = %path.display(), "loaded config file");
            config
        } else {
            Self {
                data_dir,
                ..Self::default()
            }
        };

        config.apply_env(&lookup);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Environment overrides. Unparseable values are logged and ignored.
    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_GALLERY_DIR") {
            self.gallery_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ROLLCALL_LEDGER_PATH") {
            self.ledger_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse(lookup, "ROLLCALL_STRATEGY") {
            self.strategy = v;
        }
        if let Some(v) = env_parse(lookup, "ROLLCALL_METRIC") {
            self.metric = v;
        }
        if let Some(v) = env_parse(lookup, "ROLLCALL_THRESHOLD") {
            self.threshold = Some(v);
        }
        if let Some(v) = env_parse(lookup, "ROLLCALL_VERIFY_THRESHOLD") {
            self.verify_threshold = v;
        }
        if let Some(secs) = env_parse::<u64>(lookup, "ROLLCALL_DEDUP_WINDOW_SECS") {
            self.dedup_window_secs = (secs > 0).then_some(secs);
        }
        if let Some(v) = lookup("ROLLCALL_RECORD_UNKNOWN") {
            self.record_unknown = v.trim() != "0";
        }
    }

    fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("threshold", self.distance_threshold()),
            ("verify_threshold", self.verify_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 {
                bail!("{key} must be a positive number, got {value}");
            }
        }
        Ok(())
    }

    pub fn gallery_dir(&self) -> PathBuf {
        self.gallery_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("faces_db"))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("attendance.csv"))
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir.clone().unwrap_or_else(onnx::default_model_dir)
    }

    /// Configured threshold, or the one matching the bundled ArcFace model.
    pub fn distance_threshold(&self) -> f32 {
        self.threshold
            .unwrap_or_else(|| onnx::default_distance_threshold(self.metric))
    }

    pub fn match_strategy(&self) -> MatchStrategy {
        match self.strategy {
            StrategyKind::Distance => MatchStrategy::Distance {
                metric: self.metric,
                threshold: self.distance_threshold(),
            },
            StrategyKind::Verification => MatchStrategy::Verification,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            strategy: self.match_strategy(),
            record_unknown: self.record_unknown,
        }
    }

    pub fn ledger(&self) -> AttendanceLedger {
        let ledger = AttendanceLedger::new(self.ledger_path());
        let window = self
            .dedup_window_secs
            .filter(|&secs| secs > 0)
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds);
        match window {
            Some(window) => ledger.with_dedup_window(window),
            None => ledger,
        }
    }
}

fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment override");
            None
        }
    }
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
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_derive_paths_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().to_str().unwrap();
        let config = Config::load_with(env(&[("ROLLCALL_DATA_DIR", data)])).unwrap();

        assert_eq!(config.gallery_dir(), dir.path().join("faces_db"));
        assert_eq!(config.ledger_path(), dir.path().join("attendance.csv"));
        assert_eq!(
            config.match_strategy(),
            MatchStrategy::Distance {
                metric: DistanceMetric::EuclideanL2,
                threshold: 1.10,
            }
        );
        assert!(config.record_unknown);
        assert!(config.dedup_window_secs.is_none());
    }

    #[test]
    fn test_config_file_in_data_dir_is_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "strategy = \"verification\"\nrecord_unknown = false\ndedup_window_secs = 300\n",
        )
        .unwrap();

        let data = dir.path().to_str().unwrap();
        let config = Config::load_with(env(&[("ROLLCALL_DATA_DIR", data)])).unwrap();
        assert_eq!(config.match_strategy(), MatchStrategy::Verification);
        assert!(!config.record_unknown);
        assert_eq!(config.dedup_window_secs, Some(300));
        // data_dir wins from the environment even when the file omits it.
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn test_explicit_config_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let result = Config::load_with(env(&[("ROLLCALL_CONFIG", missing.to_str().unwrap())]));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<Config>("treshold = 0.5\n").is_err());
    }

    #[test]
    fn test_toml_metric_and_threshold() {
        let config: Config = toml::from_str("metric = \"cosine\"\nthreshold = 0.4\n").unwrap();
        assert_eq!(
            config.match_strategy(),
            MatchStrategy::Distance {
                metric: DistanceMetric::Cosine,
                threshold: 0.4,
            }
        );
    }

    #[test]
    fn test_default_threshold_follows_metric() {
        let cosine: Config = toml::from_str("metric = \"cosine\"\n").unwrap();
        assert!((cosine.distance_threshold() - 0.60).abs() < 1e-6);

        let l2 = Config::default();
        assert!((l2.distance_threshold() - 1.10).abs() < 1e-6);
        assert!(l2.distance_threshold() > rollcall_core::matcher::DEFAULT_THRESHOLD);

        let explicit: Config = toml::from_str("threshold = 0.9\n").unwrap();
        assert!((explicit.distance_threshold() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, "metric = \"cosine\"\nthreshold = 0.4\n").unwrap();

        let config = Config::load_with(env(&[
            ("ROLLCALL_CONFIG", file.to_str().unwrap()),
            ("ROLLCALL_METRIC", "euclidean"),
            ("ROLLCALL_THRESHOLD", "10"),
            ("ROLLCALL_LEDGER_PATH", "/srv/roll/log.csv"),
        ]))
        .unwrap();

        assert_eq!(config.metric, DistanceMetric::Euclidean);
        assert!((config.distance_threshold() - 10.0).abs() < 1e-6);
        assert_eq!(config.ledger_path(), PathBuf::from("/srv/roll/log.csv"));
    }

    #[test]
    fn test_invalid_env_value_keeps_previous() {
        let mut config = Config::default();
        config.apply_env(&env(&[
            ("ROLLCALL_THRESHOLD", "lots"),
            ("ROLLCALL_STRATEGY", "guess"),
        ]));
        assert!(config.threshold.is_none());
        assert_eq!(config.strategy, StrategyKind::Distance);
    }

    #[test]
    fn test_dedup_zero_disables() {
        let mut config = Config {
            dedup_window_secs: Some(60),
            ..Config::default()
        };
        config.apply_env(&env(&[("ROLLCALL_DEDUP_WINDOW_SECS", "0")]));
        assert!(config.dedup_window_secs.is_none());
    }

    #[test]
    fn test_record_unknown_env() {
        let mut config = Config::default();
        config.apply_env(&env(&[("ROLLCALL_RECORD_UNKNOWN", "0")]));
        assert!(!config.record_unknown);
        config.apply_env(&env(&[("ROLLCALL_RECORD_UNKNOWN", "1")]));
        assert!(config.record_unknown);
    }

    #[test]
    fn test_non_positive_threshold_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().to_str().unwrap();
        let result = Config::load_with(env(&[
            ("ROLLCALL_DATA_DIR", data),
            ("ROLLCALL_THRESHOLD", "-1"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_session_config_carries_switches() {
        let config = Config {
            strategy: StrategyKind::Verification,
            record_unknown: false,
            ..Config::default()
        };
        let session = config.session_config();
        assert_eq!(session.strategy, MatchStrategy::Verification);
        assert!(!session.record_unknown);
    }
}
