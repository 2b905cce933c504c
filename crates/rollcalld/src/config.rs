use chrono::FixedOffset;
use rollcall_core::liveness::{DEFAULT_BLUR_THRESHOLD, DEFAULT_MIN_SCORE};
use rollcall_core::{
    LivenessPolicy, MatchPolicy, MatchPolicyError, PhotoLimits, DEFAULT_MAX_IMAGE_BYTES,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid match policy: {0}")]
    Policy(#[from] MatchPolicyError),
    #[error("reporting UTC offset out of range: {0} minutes")]
    Offset(i32),
    #[error("liveness_min_score must be in [0, 1], got {0}")]
    LivenessScore(f32),
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl std::str::FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(BusKind::System),
            "session" => Ok(BusKind::Session),
            other => Err(format!("unknown bus: {other}")),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// 32-byte AES key sealing templates at rest (created on first start).
    pub template_key_path: PathBuf,
    /// Unix socket of the external embedding service.
    pub extractor_socket: PathBuf,
    /// Upper bound on one extraction.
    pub extractor_timeout_ms: u64,
    /// Expected embedding length.
    pub embedding_dim: usize,
    pub match_threshold: f32,
    pub match_margin: f32,
    pub distance_max: f32,
    /// Fixed offset used to derive the attendance day (no DST).
    pub report_utc_offset_minutes: i32,
    pub max_image_bytes: usize,
    /// Liveness score a photo needs; 0 records the score without rejecting.
    pub liveness_min_score: f32,
    pub liveness_blur_threshold: f64,
    /// Policy version stamped on consent events.
    pub consent_version: String,
    pub bus: BusKind,
}

/// Optional TOML layer. Keys mirror the environment variables without
/// the `ROLLCALL_` prefix, lower-cased.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    template_key_path: Option<PathBuf>,
    extractor_socket: Option<PathBuf>,
    extractor_timeout_ms: Option<u64>,
    embedding_dim: Option<usize>,
    match_threshold: Option<f32>,
    match_margin: Option<f32>,
    distance_max: Option<f32>,
    report_utc_offset_minutes: Option<i32>,
    max_image_bytes: Option<usize>,
    liveness_min_score: Option<f32>,
    liveness_blur_threshold: Option<f64>,
    consent_version: Option<String>,
    bus: Option<BusKind>,
}

impl Config {
    /// Load configuration from the file named by `ROLLCALL_CONFIG` (if any),
    /// then `ROLLCALL_*` environment variables, then defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file = match env("ROLLCALL_CONFIG") {
            Some(path) => load_file(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = env("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("rollcall.db"));

        let template_key_path = env("ROLLCALL_TEMPLATE_KEY_PATH")
            .map(PathBuf::from)
            .or(file.template_key_path)
            .unwrap_or_else(|| {
                db_path
                    .parent()
                    .map(|p| p.join("template.key"))
                    .unwrap_or_else(|| data_dir.join("template.key"))
            });

        Ok(Self {
            db_path,
            template_key_path,
            extractor_socket: env("ROLLCALL_EXTRACTOR_SOCKET")
                .map(PathBuf::from)
                .or(file.extractor_socket)
                .unwrap_or_else(|| PathBuf::from("/run/rollcall/embedder.sock")),
            extractor_timeout_ms: parsed(&env, "ROLLCALL_EXTRACTOR_TIMEOUT_MS")
                .or(file.extractor_timeout_ms)
                .unwrap_or(5_000),
            embedding_dim: parsed(&env, "ROLLCALL_EMBEDDING_DIM")
                .or(file.embedding_dim)
                .unwrap_or(128),
            match_threshold: parsed(&env, "ROLLCALL_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(0.6),
            match_margin: parsed(&env, "ROLLCALL_MATCH_MARGIN")
                .or(file.match_margin)
                .unwrap_or(0.1),
            distance_max: parsed(&env, "ROLLCALL_DISTANCE_MAX")
                .or(file.distance_max)
                .unwrap_or(1.0),
            report_utc_offset_minutes: parsed(&env, "ROLLCALL_REPORT_UTC_OFFSET_MINUTES")
                .or(file.report_utc_offset_minutes)
                .unwrap_or(180),
            max_image_bytes: parsed(&env, "ROLLCALL_MAX_IMAGE_BYTES")
                .or(file.max_image_bytes)
                .unwrap_or(DEFAULT_MAX_IMAGE_BYTES),
            liveness_min_score: parsed(&env, "ROLLCALL_LIVENESS_MIN_SCORE")
                .or(file.liveness_min_score)
                .unwrap_or(DEFAULT_MIN_SCORE),
            liveness_blur_threshold: parsed(&env, "ROLLCALL_LIVENESS_BLUR_THRESHOLD")
                .or(file.liveness_blur_threshold)
                .unwrap_or(DEFAULT_BLUR_THRESHOLD),
            consent_version: env("ROLLCALL_CONSENT_VERSION")
                .or(file.consent_version)
                .unwrap_or_else(|| "1.0".to_string()),
            bus: parsed(&env, "ROLLCALL_BUS")
                .or(file.bus)
                .unwrap_or(BusKind::System),
        })
    }

    /// Validated match policy. An invalid policy must abort startup.
    pub fn match_policy(&self) -> Result<MatchPolicy, ConfigError> {
        Ok(MatchPolicy::new(
            self.match_threshold,
            self.match_margin,
            self.distance_max,
        )?)
    }

    pub fn report_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.report_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(ConfigError::Offset(self.report_utc_offset_minutes))
    }

    pub fn photo_limits(&self) -> PhotoLimits {
        PhotoLimits {
            max_bytes: self.max_image_bytes,
        }
    }

    pub fn liveness_policy(&self) -> Result<LivenessPolicy, ConfigError> {
        if !(0.0..=1.0).contains(&self.liveness_min_score) {
            return Err(ConfigError::LivenessScore(self.liveness_min_score));
        }
        Ok(LivenessPolicy {
            min_score: self.liveness_min_score,
            blur_threshold: self.liveness_blur_threshold,
        })
    }

    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_millis(self.extractor_timeout_ms)
    }
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Parsed env value; unparseable values are ignored with a warning.
fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}
