//! Engine configuration.
//!
//! Configuration is read from TOML in layers, later layers overriding earlier
//! ones field by field:
//!
//! 1. user config: `<config dir>/acc-ratings/config.toml`
//! 2. project config: `.acc/config.toml`, or `$ACC_PROJECT_CONFIG_DIR/config.toml`
//! 3. `ACC_API_BASE_URL` environment variable
//!
//! ```toml
//! [api]
//! base_url = "https://acc.example.org/api"
//! request_timeout = "15s"
//!
//! [batch]
//! max_in_flight = 8
//! submission_timeout = "20s"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Environment variable overriding `api.base_url`.
pub const BASE_URL_ENV: &str = "ACC_API_BASE_URL";

/// Environment variable overriding the project config directory.
pub const PROJECT_CONFIG_DIR_ENV: &str = "ACC_PROJECT_CONFIG_DIR";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CELLS_PER_CALL: usize = 500;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;
pub const DEFAULT_SUBMISSION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SERVICE_NAME: &str = "acc-ratings";
pub const DEFAULT_LOG_FILTER: &str = "info";

// ────────────────────────────────────────────────────────────────────────────
// Final configuration
// ────────────────────────────────────────────────────────────────────────────

/// Final configuration with defaults applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the ratings API lives and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Upper bound on cells requested by one bulk resolve call.
    pub max_cells_per_call: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_cells_per_call: DEFAULT_MAX_CELLS_PER_CALL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Submissions running at the same time.
    pub max_in_flight: usize,
    /// Deadline for one cell's submission, comment update included.
    #[serde(with = "humantime_serde")]
    pub submission_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            submission_timeout: DEFAULT_SUBMISSION_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Keyring service the refresh token is stored under.
    pub service_name: String,
    /// Keep the refresh token in the keyring between runs.
    pub persist_refresh_token: bool,
    #[serde(with = "humantime_serde")]
    pub auth_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            persist_refresh_token: false,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `"acc_ratings=debug,info"`.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Raw configuration (as stored in TOML)
// ────────────────────────────────────────────────────────────────────────────

/// Configuration as stored in TOML files, with optional fields for merging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEngineConfig {
    #[serde(default)]
    pub api: RawApiConfig,
    #[serde(default)]
    pub resolver: RawResolverConfig,
    #[serde(default)]
    pub batch: RawBatchConfig,
    #[serde(default)]
    pub session: RawSessionConfig,
    #[serde(default)]
    pub logging: RawLoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawApiConfig {
    pub base_url: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawResolverConfig {
    pub max_cells_per_call: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBatchConfig {
    pub max_in_flight: Option<usize>,
    #[serde(default, with = "humantime_serde")]
    pub submission_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSessionConfig {
    pub service_name: Option<String>,
    pub persist_refresh_token: Option<bool>,
    #[serde(default, with = "humantime_serde")]
    pub auth_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLoggingConfig {
    pub filter: Option<String>,
    pub json: Option<bool>,
}

// ────────────────────────────────────────────────────────────────────────────
// Loader
// ────────────────────────────────────────────────────────────────────────────

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user, project, environment).
    pub fn load() -> Result<EngineConfig> {
        let mut layers = Vec::new();
        if let Some(user_path) = Self::user_config_path() {
            layers.push(user_path);
        }
        layers.push(Self::project_config_path());

        let mut raw = Self::load_layers(&layers)?;
        if let Ok(base_url) = std::env::var(BASE_URL_ENV)
            && !base_url.is_empty()
        {
            debug!(%base_url, "api base url overridden from environment");
            raw.api.base_url = Some(base_url);
        }
        Self::finalize(raw)
    }

    /// Merge the given files in order; missing files are skipped.
    pub fn load_layers(paths: &[PathBuf]) -> Result<RawEngineConfig> {
        let mut raw = RawEngineConfig::default();
        for path in paths {
            if let Some(layer) = Self::read_layer(path)? {
                raw = Self::merge_raw(raw, layer);
            }
        }
        Ok(raw)
    }

    /// Parse a single TOML document into final configuration.
    pub fn from_toml(contents: &str) -> Result<EngineConfig> {
        let raw: RawEngineConfig = toml::from_str(contents)?;
        Self::finalize(raw)
    }

    /// Get user config path (platform-specific).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("acc-ratings").join("config.toml"))
    }

    /// Get project config path.
    ///
    /// Can be overridden with `ACC_PROJECT_CONFIG_DIR` (useful for isolated tests).
    pub fn project_config_path() -> PathBuf {
        match std::env::var(PROJECT_CONFIG_DIR_ENV) {
            Ok(dir) => PathBuf::from(dir).join("config.toml"),
            Err(_) => PathBuf::from(".acc/config.toml"),
        }
    }

    fn read_layer(path: &Path) -> Result<Option<RawEngineConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let layer = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded config layer");
        Ok(Some(layer))
    }

    /// Merge two raw configs (overlay values override base only if set).
    fn merge_raw(base: RawEngineConfig, overlay: RawEngineConfig) -> RawEngineConfig {
        RawEngineConfig {
            api: RawApiConfig {
                base_url: overlay.api.base_url.or(base.api.base_url),
                request_timeout: overlay.api.request_timeout.or(base.api.request_timeout),
            },
            resolver: RawResolverConfig {
                max_cells_per_call: overlay
                    .resolver
                    .max_cells_per_call
                    .or(base.resolver.max_cells_per_call),
            },
            batch: RawBatchConfig {
                max_in_flight: overlay.batch.max_in_flight.or(base.batch.max_in_flight),
                submission_timeout: overlay
                    .batch
                    .submission_timeout
                    .or(base.batch.submission_timeout),
            },
            session: RawSessionConfig {
                service_name: overlay.session.service_name.or(base.session.service_name),
                persist_refresh_token: overlay
                    .session
                    .persist_refresh_token
                    .or(base.session.persist_refresh_token),
                auth_timeout: overlay.session.auth_timeout.or(base.session.auth_timeout),
            },
            logging: RawLoggingConfig {
                filter: overlay.logging.filter.or(base.logging.filter),
                json: overlay.logging.json.or(base.logging.json),
            },
        }
    }

    /// Convert raw config to final config with defaults applied.
    pub fn finalize(raw: RawEngineConfig) -> Result<EngineConfig> {
        let config = EngineConfig {
            api: ApiConfig {
                base_url: raw
                    .api
                    .base_url
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                request_timeout: raw.api.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            },
            resolver: ResolverConfig {
                max_cells_per_call: raw
                    .resolver
                    .max_cells_per_call
                    .unwrap_or(DEFAULT_MAX_CELLS_PER_CALL),
            },
            batch: BatchConfig {
                max_in_flight: raw.batch.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT),
                submission_timeout: raw
                    .batch
                    .submission_timeout
                    .unwrap_or(DEFAULT_SUBMISSION_TIMEOUT),
            },
            session: SessionConfig {
                service_name: raw
                    .session
                    .service_name
                    .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
                persist_refresh_token: raw.session.persist_refresh_token.unwrap_or(false),
                auth_timeout: raw.session.auth_timeout.unwrap_or(DEFAULT_AUTH_TIMEOUT),
            },
            logging: LoggingConfig {
                filter: raw
                    .logging
                    .filter
                    .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
                json: raw.logging.json.unwrap_or(false),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.resolver.max_cells_per_call == 0 {
            return Err(Error::Config(
                "resolver.max_cells_per_call must be at least 1".to_string(),
            ));
        }
        if self.batch.max_in_flight == 0 {
            return Err(Error::Config("batch.max_in_flight must be at least 1".to_string()));
        }
        if self.api.base_url.is_empty() {
            return Err(Error::Config("api.base_url must not be empty".to_string()));
        }
        Ok(())
    }
}
