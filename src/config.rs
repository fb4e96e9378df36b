use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::preflight::Toolchain;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tubegrab-env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_LEDGER_CAPACITY: usize = 1024;
const TEMP_SUBDIR: &str = "video_downloader";

/// Every key recognised in the env file and the process environment.
const KEYS: &[&str] = &[
    "TUBEGRAB_HOST",
    "TUBEGRAB_PORT",
    "YTDLP_PATH",
    "FFMPEG_PATH",
    "TEMP_DIR",
    "MAX_BYTES",
    "METADATA_TIMEOUT_SECS",
    "TRANSFER_TIMEOUT_SECS",
    "LEDGER_CAPACITY",
];

/// Values as written, before defaults are applied.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub max_bytes: Option<u64>,
    pub metadata_timeout_secs: Option<u64>,
    pub transfer_timeout_secs: Option<u64>,
    pub ledger_capacity: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub toolchain: Toolchain,
    pub temp_dir: PathBuf,
    pub max_bytes: u64,
    pub metadata_timeout: Duration,
    pub transfer_timeout: Duration,
    pub ledger_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        EnvConfig::default().resolve()
    }
}

impl EnvConfig {
    /// Applies one `KEY=value` pair. Unknown keys are ignored.
    fn apply(&mut self, key: &str, value: &str, origin: &str) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        match key {
            "TUBEGRAB_HOST" => self.host = Some(value.to_string()),
            "TUBEGRAB_PORT" => self.port = Some(parse(key, value, origin)?),
            "YTDLP_PATH" => self.ytdlp_path = Some(PathBuf::from(value)),
            "FFMPEG_PATH" => self.ffmpeg_path = Some(PathBuf::from(value)),
            "TEMP_DIR" => self.temp_dir = Some(PathBuf::from(value)),
            "MAX_BYTES" => self.max_bytes = Some(parse(key, value, origin)?),
            "METADATA_TIMEOUT_SECS" => self.metadata_timeout_secs = Some(parse(key, value, origin)?),
            "TRANSFER_TIMEOUT_SECS" => self.transfer_timeout_secs = Some(parse(key, value, origin)?),
            "LEDGER_CAPACITY" => self.ledger_capacity = Some(parse(key, value, origin)?),
            _ => {}
        }
        Ok(())
    }

    /// Overlays values from the process environment.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        for key in KEYS {
            if let Some(value) = vars.get(*key) {
                self.apply(key, value.trim(), "the environment")?;
            }
        }
        Ok(())
    }

    pub fn resolve(self) -> Settings {
        Settings {
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            toolchain: Toolchain {
                ytdlp: self.ytdlp_path.unwrap_or_else(|| PathBuf::from("yt-dlp")),
                ffmpeg: self.ffmpeg_path.unwrap_or_else(|| PathBuf::from("ffmpeg")),
            },
            temp_dir: self
                .temp_dir
                .unwrap_or_else(|| env::temp_dir().join(TEMP_SUBDIR)),
            max_bytes: self.max_bytes.unwrap_or(DEFAULT_MAX_BYTES),
            metadata_timeout: Duration::from_secs(
                self.metadata_timeout_secs
                    .unwrap_or(DEFAULT_METADATA_TIMEOUT_SECS),
            ),
            transfer_timeout: Duration::from_secs(
                self.transfer_timeout_secs
                    .unwrap_or(DEFAULT_TRANSFER_TIMEOUT_SECS),
            ),
            ledger_capacity: self.ledger_capacity.unwrap_or(DEFAULT_LEDGER_CAPACITY),
        }
    }
}

fn parse<T>(key: &str, value: &str, origin: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Parsing {key} from {origin}"))
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let origin = path.display().to_string();
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            cfg.apply(key.trim(), value, &origin)?;
        }
    }
    Ok(Some(cfg))
}

/// Defaults, then the env file if present, then the process environment.
/// Only an explicitly requested file must exist.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    let mut cfg = match read_env_config(file)? {
        Some(cfg) => cfg,
        None if path.is_some() => {
            return Err(anyhow!("Missing config file at {}", file.display()));
        }
        None => EnvConfig::default(),
    };
    cfg.apply_env(env::vars())?;
    Ok(cfg.resolve())
}
