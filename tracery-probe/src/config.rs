//! Probe configuration.
//!
//! The instrumented subject knows nothing about ports or modes; the launcher
//! passes everything through the environment. Missing or malformed variables
//! fall back to defaults, because the probe must never keep a subject from
//! starting.

use tracery_wire::{InstMode, ObjectType};

pub const DEFAULT_PORT: u16 = 9285;

/// Default staging-buffer capacity advertised to the host.
pub const DEFAULT_SEND_CAPACITY: usize = 64 * 1024;

const ENV_PORT: &str = "TRACERY_PORT";
const ENV_MODE: &str = "TRACERY_MODE";
const ENV_OBJECT_TYPE: &str = "TRACERY_OBJECT_TYPE";
const ENV_SIGNAL: &str = "TRACERY_SIGNAL";
const ENV_SEND_CAPACITY: &str = "TRACERY_SEND_CAPACITY";

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub port: u16,
    pub object_type: ObjectType,
    pub mode: InstMode,
    /// Set when the subject is itself a dispatcher: asks the host for the
    /// signal side channel and enables trace-message timestamps.
    pub wants_signal: bool,
    /// Defers the connection until the test harness drives the subject.
    pub target_junit: bool,
    pub send_capacity: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            port: DEFAULT_PORT,
            object_type: ObjectType::Block,
            mode: InstMode::OptNormal,
            wants_signal: false,
            target_junit: false,
            send_capacity: DEFAULT_SEND_CAPACITY,
        }
    }
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        let mut config = ProbeConfig::default();
        if let Some(port) = env_parse::<u16>(ENV_PORT) {
            config.port = port;
        }
        if let Some(code) = env_parse::<i32>(ENV_MODE) {
            if let Ok(mode) = InstMode::from_code(code) {
                config.mode = mode;
            }
        }
        if let Some(code) = env_parse::<i32>(ENV_OBJECT_TYPE) {
            if let Ok(object_type) = ObjectType::from_code(code) {
                config.object_type = object_type;
            }
        }
        config.wants_signal = env_parse::<i32>(ENV_SIGNAL).is_some_and(|v| v != 0);
        if let Some(capacity) = env_parse::<usize>(ENV_SEND_CAPACITY) {
            config.send_capacity = capacity.max(1024);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ProbeConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.mode, InstMode::OptNormal);
        assert!(!config.wants_signal);
        assert!(config.send_capacity >= 1024);
    }
}
