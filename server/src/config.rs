//! Startup configuration parsed from a JSON file.
//!
//! DESIGN
//! ======
//! The raw document is deserialized into permissive option-typed structs and
//! then validated into `ControlServerConfig`. Relay URIs are parsed here so a
//! bad endpoint fails the process at startup instead of at first connect.
//! Cube-to-relay routing is static: the validated config is the single source
//! of truth for which relay owns which cube.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/control_server.json";
pub const FALLBACK_CONFIG_PATH: &str = "config/control_server.example.json";

const DEFAULT_UI_HOST: &str = "0.0.0.0";
const DEFAULT_RELAY_RECONNECT_MS: u64 = 2000;

/// Cube ids are fixed-width short strings.
const CUBE_ID_LEN: usize = 3;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing ui settings")]
    MissingUi,
    #[error("ui.port must be > 0")]
    InvalidUiPort,
    #[error("relays must be a non-empty array")]
    NoRelays,
    #[error("relay entry missing id")]
    MissingRelayId,
    #[error("duplicate relay id {0}")]
    DuplicateRelayId(String),
    #[error("relay {0} missing uri")]
    MissingRelayUri(String),
    #[error("relay {relay_id} uri is invalid: {reason}")]
    InvalidRelayUri { relay_id: String, reason: String },
    #[error("relay {0} must define at least one cube")]
    NoCubes(String),
    #[error("cube id {0} must be {CUBE_ID_LEN} characters")]
    BadCubeId(String),
    #[error("cube id {0} assigned to multiple relays")]
    DuplicateCubeId(String),
    #[error("field.bottom_right must be greater than top_left")]
    InvalidField,
}

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub host: String,
    pub port: u16,
}

/// A relay endpoint split into the parts the WebSocket client needs.
/// Only plaintext `ws://` is supported; relays are trusted on a LAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayUri {
    pub host: String,
    pub port: u16,
    pub target: String,
}

impl RelayUri {
    /// Parse `ws://host[:port][/target]`. Default port 80, default target "/".
    pub fn parse(uri: &str) -> Result<Self, String> {
        if uri.starts_with("wss://") {
            return Err("wss:// relays are not supported".into());
        }
        let Some(remainder) = uri.strip_prefix("ws://") else {
            return Err("relay uri must start with ws://".into());
        };

        let (host_port, target) = match remainder.find('/') {
            Some(slash) => (&remainder[..slash], remainder[slash..].to_string()),
            None => (remainder, "/".to_string()),
        };

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port {port}"))?;
                (host, port)
            }
            None => (host_port, 80),
        };
        if host.is_empty() {
            return Err("relay uri missing host".into());
        }

        Ok(Self { host: host.to_string(), port, target })
    }

    /// Rebuild the normalized URL handed to the WebSocket connector.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.target)
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub id: String,
    pub uri: RelayUri,
    pub cubes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldPoint {
    pub x: f64,
    pub y: f64,
}

/// Axis-aligned mat rectangle broadcast to clients for pose mapping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub top_left: FieldPoint,
    pub bottom_right: FieldPoint,
}

impl Default for FieldConfig {
    fn default() -> Self {
        // Standard toio mat play area.
        Self {
            top_left: FieldPoint { x: 45.0, y: 45.0 },
            bottom_right: FieldPoint { x: 455.0, y: 455.0 },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlServerConfig {
    pub ui: UiConfig,
    pub relays: Vec<RelayConfig>,
    pub field: FieldConfig,
    pub relay_reconnect: Duration,
}

// =============================================================================
// RAW DOCUMENT
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawConfig {
    ui: Option<RawUi>,
    relays: Option<Vec<RawRelay>>,
    field: Option<FieldConfig>,
    relay_reconnect_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawUi {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawRelay {
    id: Option<String>,
    uri: Option<String>,
    cubes: Option<Vec<String>>,
}

// =============================================================================
// LOADING
// =============================================================================

/// Load and validate the config file at `path`.
pub fn load_config(path: &Path) -> Result<ControlServerConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let doc: RawConfig = serde_json::from_str(&raw)
        .map_err(|source| ConfigError::Json { path: path.to_path_buf(), source })?;
    validate(doc)
}

/// Resolve the config path from an optional CLI argument.
/// Falls back to the shipped example when the primary file is absent.
#[must_use]
pub fn resolve_config_path(arg: Option<PathBuf>) -> PathBuf {
    if let Some(path) = arg {
        return path;
    }
    let primary = PathBuf::from(DEFAULT_CONFIG_PATH);
    if primary.exists() {
        primary
    } else {
        PathBuf::from(FALLBACK_CONFIG_PATH)
    }
}

fn validate(doc: RawConfig) -> Result<ControlServerConfig, ConfigError> {
    let ui = doc.ui.ok_or(ConfigError::MissingUi)?;
    let port = ui.port.ok_or(ConfigError::InvalidUiPort)?;
    if port == 0 {
        return Err(ConfigError::InvalidUiPort);
    }
    let ui = UiConfig {
        host: ui.host.unwrap_or_else(|| DEFAULT_UI_HOST.to_string()),
        port,
    };

    let raw_relays = doc.relays.unwrap_or_default();
    if raw_relays.is_empty() {
        return Err(ConfigError::NoRelays);
    }

    let mut relay_ids = HashSet::new();
    let mut cube_ids = HashSet::new();
    let mut relays = Vec::with_capacity(raw_relays.len());

    for raw in raw_relays {
        let id = raw.id.filter(|id| !id.is_empty()).ok_or(ConfigError::MissingRelayId)?;
        if !relay_ids.insert(id.clone()) {
            return Err(ConfigError::DuplicateRelayId(id));
        }

        let uri = raw
            .uri
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| ConfigError::MissingRelayUri(id.clone()))?;
        let uri = RelayUri::parse(&uri)
            .map_err(|reason| ConfigError::InvalidRelayUri { relay_id: id.clone(), reason })?;

        let cubes = raw.cubes.unwrap_or_default();
        if cubes.is_empty() {
            return Err(ConfigError::NoCubes(id));
        }
        for cube in &cubes {
            if cube.chars().count() != CUBE_ID_LEN {
                return Err(ConfigError::BadCubeId(cube.clone()));
            }
            if !cube_ids.insert(cube.clone()) {
                return Err(ConfigError::DuplicateCubeId(cube.clone()));
            }
        }

        relays.push(RelayConfig { id, uri, cubes });
    }

    let field = doc.field.unwrap_or_default();
    if field.bottom_right.x <= field.top_left.x || field.bottom_right.y <= field.top_left.y {
        return Err(ConfigError::InvalidField);
    }

    Ok(ControlServerConfig {
        ui,
        relays,
        field,
        relay_reconnect: Duration::from_millis(
            doc.relay_reconnect_ms.unwrap_or(DEFAULT_RELAY_RECONNECT_MS),
        ),
    })
}

#[cfg(test)]
pub(crate) fn config_from_str(raw: &str) -> Result<ControlServerConfig, ConfigError> {
    let doc: RawConfig = serde_json::from_str(raw)
        .map_err(|source| ConfigError::Json { path: PathBuf::from("<inline>"), source })?;
    validate(doc)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
