// Startup configuration file
//
// {
//   "/dev/ttyACM0": { "1": {"SetPoint": 100, "kp": 2.0}, "2": {"kd": 0.1} },
//   "/dev/ttyACM1": { "baud": 115200, "1": {"ki": 0.5} }
// }
//
// Links are registered in file order. "1"/"2" name the slot within the link.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};

use crate::config::DEFAULT_BAUDRATE;
use crate::messages::ParamsUpdate;
use crate::registry::LinkHandle;

/// Per-link key that overrides the baud rate
const BAUD_KEY: &str = "baud";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unexpected shape at {path}: {reason}")]
    Shape { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEntry {
    pub port: String,
    /// Falls back to `ControllerConfig::default_baud`
    pub baud_rate: Option<u32>,
    /// Slot key ("1"/"2") to the declared fields
    pub motors: BTreeMap<String, ParamsUpdate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub default_baud: u32,
    pub links: Vec<LinkEntry>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_baud: DEFAULT_BAUDRATE,
            links: Vec::new(),
        }
    }
}

/// Something that went wrong while applying a config; loading carries on
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadIssue {
    #[error("link {port}: {reason}")]
    Link { port: String, reason: String },

    #[error("motor {key} on {port}: {reason}")]
    Motor {
        port: String,
        key: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub links: Vec<LinkHandle>,
    pub issues: Vec<LoadIssue>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

fn shape(path: &str, reason: &str) -> ConfigError {
    ConfigError::Shape {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse config text
pub fn parse(text: &str) -> Result<ControllerConfig> {
    let root: Map<String, Value> = serde_json::from_str(text)?;
    let mut config = ControllerConfig::default();

    for (port, body) in root {
        let body = body
            .as_object()
            .ok_or_else(|| shape(&port, "expected an object of motors"))?;

        let mut entry = LinkEntry {
            port: port.clone(),
            baud_rate: None,
            motors: BTreeMap::new(),
        };
        for (key, value) in body {
            if key == BAUD_KEY {
                let baud = value
                    .as_u64()
                    .and_then(|b| u32::try_from(b).ok())
                    .ok_or_else(|| shape(&format!("{}.{}", port, key), "expected a baud rate"))?;
                entry.baud_rate = Some(baud);
                continue;
            }
            if !value.is_object() {
                return Err(shape(
                    &format!("{}.{}", port, key),
                    "expected an object of parameters",
                ));
            }
            let update: ParamsUpdate = serde_json::from_value(value.clone())?;
            entry.motors.insert(key.clone(), update);
        }
        config.links.push(entry);
    }

    Ok(config)
}

/// Read and parse a config file
pub fn load(path: impl AsRef<Path>) -> Result<ControllerConfig> {
    let text = std::fs::read_to_string(path)?;
    parse(&text)
}
