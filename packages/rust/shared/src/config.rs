//! Application configuration for chatlake.
//!
//! User config lives at `~/.chatlake/chatlake.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ChatlakeError, Result};
use crate::types::LaneKind;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "chatlake.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".chatlake";

/// Model billed by default; its tariff ships in the default table.
const DEFAULT_MODEL: &str = "anthropic.claude-3-5-sonnet-20240620-v1:0";

// ---------------------------------------------------------------------------
// Config structs (matching chatlake.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Key-value source settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// Object-store destination.
    #[serde(default)]
    pub destination: DestinationConfig,

    /// Per-lane settings.
    #[serde(default)]
    pub lanes: LanesConfig,

    /// Token & cost estimator settings.
    #[serde(default)]
    pub estimator: EstimatorConfig,

    /// Columnar transform job.
    #[serde(default)]
    pub transform: TransformConfig,

    /// Schema catalog refresh.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Durable orchestrator state.
    #[serde(default)]
    pub state: StateConfig,
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory holding one `<table>.jsonl` dump per source table.
    #[serde(default = "default_source_dir")]
    pub dir: String,

    /// Items returned per scan page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Records created before this date are skipped by both lanes.
    #[serde(default)]
    pub since: Option<chrono::NaiveDate>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            dir: default_source_dir(),
            page_size: default_page_size(),
            since: None,
        }
    }
}

fn default_source_dir() -> String {
    "var/tables".into()
}
fn default_page_size() -> usize {
    100
}

/// `[destination]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Root directory of the local object store.
    #[serde(default = "default_destination_root")]
    pub root: String,

    /// Prefix the columnar transform writes under (one sub-prefix per lane).
    #[serde(default = "default_columnar_prefix")]
    pub columnar_prefix: String,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            root: default_destination_root(),
            columnar_prefix: default_columnar_prefix(),
        }
    }
}

fn default_destination_root() -> String {
    "var/lake".into()
}
fn default_columnar_prefix() -> String {
    "reports/columnar/".into()
}

/// `[lanes]` section: one entry per lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanesConfig {
    #[serde(default = "default_normalization_lane")]
    pub normalization: LaneConfig,

    #[serde(default = "default_tokens_lane")]
    pub tokens: LaneConfig,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            normalization: default_normalization_lane(),
            tokens: default_tokens_lane(),
        }
    }
}

impl LanesConfig {
    pub fn get(&self, lane: LaneKind) -> &LaneConfig {
        match lane {
            LaneKind::Normalization => &self.normalization,
            LaneKind::Tokens => &self.tokens,
        }
    }
}

/// `[lanes.<name>]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Source table identifier.
    pub table: String,
    /// Prefix the lane's row-oriented exports are written under.
    pub export_prefix: String,
    /// Daily schedule expression, `cron(...)` or `rate(...)`.
    pub schedule: String,
    /// Catalog target refreshed once the columnar artifact is written.
    pub catalog_target: String,
}

fn default_normalization_lane() -> LaneConfig {
    LaneConfig {
        table: "conversations".into(),
        export_prefix: "reports/normalized/".into(),
        schedule: "cron(0 5 * * ? *)".into(),
        catalog_target: "chatlake_normalized".into(),
    }
}

fn default_tokens_lane() -> LaneConfig {
    LaneConfig {
        table: "chat-messages".into(),
        export_prefix: "reports/tokens/".into(),
        schedule: "cron(30 5 * * ? *)".into(),
        catalog_target: "chatlake_tokens".into(),
    }
}

/// `[estimator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Model identifier written to every token row.
    #[serde(default = "default_model")]
    pub model: String,

    /// Region identifier written to every token row.
    #[serde(default = "default_region")]
    pub region: String,

    /// Per-model USD rates.
    #[serde(default = "default_tariffs")]
    pub tariffs: BTreeMap<String, TariffRate>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            region: default_region(),
            tariffs: default_tariffs(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.into()
}
fn default_region() -> String {
    "us-east-1".into()
}
fn default_tariffs() -> BTreeMap<String, TariffRate> {
    let mut tariffs = BTreeMap::new();
    tariffs.insert(
        DEFAULT_MODEL.to_string(),
        TariffRate {
            input_per_token: 0.000003,
            output_per_token: 0.000015,
        },
    );
    tariffs
}

/// USD cost per input and per output token for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TariffRate {
    pub input_per_token: f64,
    pub output_per_token: f64,
}

/// `[transform]` section: the black-box columnar job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Executable started for each transform job.
    #[serde(default = "default_transform_command")]
    pub command: String,

    /// Extra arguments placed before the generated `--input/--output/--job-id`.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            command: default_transform_command(),
            args: Vec::new(),
        }
    }
}

fn default_transform_command() -> String {
    "scripts/columnar-transform".into()
}

/// `[catalog]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// HTTP endpoint of the schema discovery service. Unset: refreshes are only logged.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// `[state]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "var/state/chatlake.db".into()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn schedule_re() -> &'static Regex {
    static SCHEDULE_RE: OnceLock<Regex> = OnceLock::new();
    SCHEDULE_RE.get_or_init(|| {
        Regex::new(r"^(cron\(\S+( \S+){5}\)|rate\(\d+ (minute|minutes|hour|hours|day|days)\))$")
            .expect("valid schedule regex")
    })
}

impl AppConfig {
    /// Reject configurations the lanes cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.source.page_size == 0 {
            return Err(ChatlakeError::config("source.page_size must be at least 1"));
        }

        for lane in LaneKind::ALL {
            let cfg = self.lanes.get(lane);
            if cfg.table.trim().is_empty() {
                return Err(ChatlakeError::config(format!("lanes.{lane}.table is empty")));
            }
            check_prefix(&format!("lanes.{lane}.export_prefix"), &cfg.export_prefix)?;
            if !schedule_re().is_match(cfg.schedule.trim()) {
                return Err(ChatlakeError::config(format!(
                    "lanes.{lane}.schedule '{}' is not a cron(...) or rate(...) expression",
                    cfg.schedule
                )));
            }
        }
        check_prefix("destination.columnar_prefix", &self.destination.columnar_prefix)?;

        let norm = &self.lanes.normalization.export_prefix;
        let tokens = &self.lanes.tokens.export_prefix;
        if norm.starts_with(tokens.as_str()) || tokens.starts_with(norm.as_str()) {
            return Err(ChatlakeError::config(format!(
                "lane export prefixes overlap: '{norm}' and '{tokens}'"
            )));
        }

        let rate = self.estimator.tariffs.get(&self.estimator.model).ok_or_else(|| {
            ChatlakeError::config(format!(
                "no tariff configured for estimator model '{}'",
                self.estimator.model
            ))
        })?;
        if rate.input_per_token < 0.0 || rate.output_per_token < 0.0 {
            return Err(ChatlakeError::config(format!(
                "tariff for '{}' has a negative rate",
                self.estimator.model
            )));
        }

        Ok(())
    }
}

fn check_prefix(name: &str, prefix: &str) -> Result<()> {
    if prefix.is_empty() || !prefix.ends_with('/') || prefix.starts_with('/') {
        return Err(ChatlakeError::config(format!(
            "{name} '{prefix}' must be a relative prefix ending in '/'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.chatlake/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ChatlakeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.chatlake/chatlake.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ChatlakeError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ChatlakeError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ChatlakeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ChatlakeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ChatlakeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
