use anyhow::{Result, anyhow, bail};
use clap::Parser;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::cli::Command;
use crate::devices;

pub const TOKEN_ENV_VAR: &str = "READWISE_API_TOKEN";
pub const CLIPPINGS_FILE_NAME: &str = "My Clippings.txt";

/// Keys `config set` accepts, as `section.field`.
pub const SETTABLE_KEYS: &[&str] = &[
    "app.database",
    "app.log_level",
    "app.clippings_path",
    "readwise.token",
    "readwise.api_url",
    "readwise.batch_size",
    "readwise.request_delay_ms",
];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

// ${VAR} or ${VAR:-default}
static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var regex"));

#[derive(Parser, Debug)]
#[command(name = "kindlewise")]
#[command(about = "Exports Kindle highlights to Readwise, each one exactly once", long_about = None)]
pub struct Cli {
    #[arg(short = 'c', long = "config", global = true)]
    pub config_path: Option<String>,

    /// Log at debug level regardless of configuration
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long = "json-logs", global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kindlewise")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

/// `My Clippings.txt` in the current directory, else the one on the first detected Kindle.
pub fn default_clippings_path() -> Option<PathBuf> {
    env::current_dir()
        .ok()
        .map(|dir| dir.join(CLIPPINGS_FILE_NAME))
        .filter(|path| path.is_file())
        .or_else(|| devices::detect().into_iter().next().map(|device| device.clippings))
}

/// Renders a credential for display: `abcd...wxyz`, or `****` when too short to reveal anything.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct App {
    pub database: String,
    pub log_level: String,
    pub clippings_path: Option<String>,
}

impl Default for App {
    fn default() -> Self {
        Self {
            database: "kindlewise.db".to_string(),
            log_level: "info".to_string(),
            clippings_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Readwise {
    pub token: Option<String>,
    pub api_url: String,
    pub batch_size: usize,
    pub request_delay_ms: u64,
}

impl Default for Readwise {
    fn default() -> Self {
        Self {
            token: None,
            api_url: "https://readwise.io/api/v2".to_string(),
            batch_size: 100,
            request_delay_ms: 250,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub app: App,
    pub readwise: Readwise,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    base_dir: PathBuf,
    /// `${VAR}` references without a default whose variable was not set.
    #[serde(skip)]
    unset_env_vars: Vec<String>,
}

impl Config {
    /// Loads the YAML file at `path`. A missing file yields the defaults.
    pub fn new(path: &Path) -> Result<Self> {
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_dir);

        let mut cfg = if path.exists() {
            Config::load_config(path)?
        } else {
            Config::default()
        };
        cfg.base_dir = base_dir;
        Ok(cfg)
    }

    /// Loads from `--config` if given, otherwise from the default location.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let path = cli
            .config_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path);
        Config::new(&path)
    }

    fn load_config(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config {}: {e}", path.display()))?;
        let (yaml, unset) = expand_env_vars(&raw);
        let mut config: Config = if yaml.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(&yaml)?
        };
        config.unset_env_vars = unset;
        Ok(config)
    }

    /// Variables the config file referenced but the environment lacks.
    /// Reported once logging is up.
    pub fn unset_env_vars(&self) -> &[String] {
        &self.unset_env_vars
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Ledger location: `--db-path` if given, else `app.database` resolved
    /// against the config directory.
    pub fn database_path(&self, flag: Option<&str>) -> PathBuf {
        let raw = flag.unwrap_or(&self.app.database);
        let path = expand_home(raw);
        if path.is_absolute() || flag.is_some() {
            path
        } else {
            self.base_dir.join(path)
        }
    }

    /// `--api-token`, then `READWISE_API_TOKEN`, then `readwise.token`.
    pub fn resolve_token(&self, flag: Option<&str>) -> Option<String> {
        let from_env = env::var(TOKEN_ENV_VAR).ok();
        pick_token(flag, from_env.as_deref(), self.readwise.token.as_deref())
    }

    /// `--file`, then `app.clippings_path`, then auto-detection.
    pub fn resolve_clippings_path(&self, flag: Option<&str>) -> Option<PathBuf> {
        flag.map(expand_home)
            .or_else(|| self.app.clippings_path.as_deref().map(expand_home))
            .or_else(default_clippings_path)
    }
}

fn pick_token(flag: Option<&str>, env: Option<&str>, config: Option<&str>) -> Option<String> {
    [flag, env, config]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|t| !t.is_empty())
        .map(str::to_string)
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

/// Expands `${VAR}` and `${VAR:-default}`. A variable that is unset and has
/// no default expands to nothing and is returned in the second list.
fn expand_env_vars(yaml: &str) -> (String, Vec<String>) {
    let mut unset = Vec::new();
    let expanded = ENV_VAR_RE.replace_all(yaml, |caps: &regex::Captures| {
        let name = &caps[1];
        match (env::var(name), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                unset.push(name.to_string());
                String::new()
            }
        }
    });
    (expanded.into_owned(), unset)
}

/// Converts the text given to `config set` into the YAML value stored for `key`.
/// An empty value clears the optional keys.
fn setting_value(key: &str, raw: &str) -> Result<Value> {
    let raw = raw.trim();
    match key {
        "readwise.batch_size" => match raw.parse::<u64>() {
            Ok(n) if n > 0 => Ok(Value::Number(n.into())),
            _ => bail!("{key} must be a positive whole number, got '{raw}'"),
        },
        "readwise.request_delay_ms" => raw
            .parse::<u64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| anyhow!("{key} must be a whole number of milliseconds, got '{raw}'")),
        "app.log_level" => {
            let level = raw.to_lowercase();
            if !LOG_LEVELS.contains(&level.as_str()) {
                bail!("{key} must be one of {}, got '{raw}'", LOG_LEVELS.join(", "));
            }
            Ok(Value::String(level))
        }
        "app.clippings_path" | "readwise.token" if raw.is_empty() => Ok(Value::Null),
        "app.database" | "readwise.api_url" if raw.is_empty() => bail!("{key} cannot be empty"),
        _ if SETTABLE_KEYS.contains(&key) => Ok(Value::String(raw.to_string())),
        _ => bail!(
            "unknown configuration key '{key}'; valid keys are {}",
            SETTABLE_KEYS.join(", ")
        ),
    }
}

/// Stores `key = value` in the config file at `path`, creating the file if
/// needed. Every other entry, `${VAR}` references included, is written back
/// as it was.
pub fn set_value(path: &Path, key: &str, value: &str) -> Result<()> {
    let value = setting_value(key, value)?;
    let (section, field) = key
        .split_once('.')
        .ok_or_else(|| anyhow!("configuration key '{key}' has no section"))?;

    let raw = if path.exists() {
        fs::read_to_string(path).map_err(|e| anyhow!("failed to read config {}: {e}", path.display()))?
    } else {
        String::new()
    };
    let mut doc: Value = if raw.trim().is_empty() {
        Value::Mapping(Mapping::new())
    } else {
        serde_yaml::from_str(&raw)?
    };

    let Value::Mapping(root) = &mut doc else {
        bail!("config {} is not a YAML mapping", path.display());
    };
    let table = root
        .entry(Value::from(section))
        .or_insert(Value::Mapping(Mapping::new()));
    if table.is_null() {
        *table = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(table) = table else {
        bail!("'{section}' in {} is not a YAML mapping", path.display());
    };
    table.insert(Value::from(field), value);

    let yaml = serde_yaml::to_string(&doc)?;
    serde_yaml::from_str::<Config>(&expand_env_vars(&yaml).0)
        .map_err(|e| anyhow!("refusing to write an unreadable config: {e}"))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| anyhow!("failed to create config directory {}: {e}", parent.display()))?;
    }
    fs::write(path, yaml).map_err(|e| anyhow!("failed to write config {}: {e}", path.display()))?;

    tracing::info!(path = ?path, key, "configuration updated");
    Ok(())
}
