use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/tracery/tracery.toml";
const ENV_CONFIG_PATH: &str = "TRACERY_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `TRACERY_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_signal_port")]
    pub signal_port: u16,
    /// Serialize listener delivery across receive threads. Needed when the
    /// subject is itself a dispatcher and two streams interleave.
    #[serde(default)]
    pub synchronized: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            signal_port: default_signal_port(),
            synchronized: false,
        }
    }
}

fn default_port() -> u16 {
    9285
}
fn default_signal_port() -> u16 {
    9286
}

#[derive(Debug, Deserialize, Clone)]
pub struct TraceConfig {
    #[serde(default = "default_trace_dir")]
    pub directory: String,
    #[serde(default = "default_trace_name")]
    pub base_name: String,
    /// Merge this run into an existing trace instead of replacing it.
    #[serde(default)]
    pub append: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            directory: default_trace_dir(),
            base_name: default_trace_name(),
            append: false,
        }
    }
}

fn default_trace_dir() -> String {
    ".".to_string()
}
fn default_trace_name() -> String {
    "subject".to_string()
}

impl TraceConfig {
    pub fn trace_path(&self) -> PathBuf {
        PathBuf::from(&self.directory).join(format!("{}.tr", self.base_name))
    }

    pub fn sequence_path(&self) -> PathBuf {
        PathBuf::from(&self.directory).join(format!("{}.seq", self.base_name))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SequenceConfig {
    /// Literal data written before the first record.
    #[serde(default)]
    pub pre: Option<String>,
    /// Literal data written after the last record.
    #[serde(default)]
    pub post: Option<String>,
    /// Send sequence text to the relay socket instead of a file.
    #[serde(default)]
    pub relay: bool,
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            pre: None,
            post: None,
            relay: false,
            relay_port: default_relay_port(),
        }
    }
}

fn default_relay_port() -> u16 {
    9288
}
