//! Repository configuration (`.jvs/config.toml`).
//!
//! Every field has a default; a missing file means all defaults (no error).
//! Unknown fields are rejected so typos fail loudly instead of silently
//! using a default.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::engine::EngineKind;
use crate::error::{JvsError, Result};

/// Config file name under the control plane.
pub const CONFIG_FILE: &str = "config.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Typed view of `.jvs/config.toml`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JvsConfig {
    /// Clone engine selection.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Lock lease behaviour.
    #[serde(default)]
    pub lock: LockConfig,

    /// Garbage collection policy.
    #[serde(default)]
    pub gc: GcConfig,
}

impl JvsConfig {
    /// Load the config from a control-plane directory.
    ///
    /// # Errors
    /// `E_CONFIG_INVALID` on a parse error; a missing file yields defaults.
    pub fn load(control_dir: &Path) -> Result<Self> {
        let path = control_dir.join(CONFIG_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(JvsError::Io(e)),
        };
        toml::from_str(&raw).map_err(|e| JvsError::Config {
            path,
            detail: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Clone engine selection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// The default engine for snapshot, restore, and fork. `auto` probes
    /// juicefs-clone → reflink-copy → copy.
    #[serde(default)]
    pub default: EngineChoice,
}

/// An engine name as configured — either auto-detect or a concrete engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineChoice {
    /// Probe and pick the best non-degraded engine.
    #[default]
    Auto,
    Copy,
    ReflinkCopy,
    JuicefsClone,
}

impl EngineChoice {
    /// The concrete engine this choice forces, or `None` for auto.
    #[must_use]
    pub const fn forced(self) -> Option<EngineKind> {
        match self {
            Self::Auto => None,
            Self::Copy => Some(EngineKind::Copy),
            Self::ReflinkCopy => Some(EngineKind::ReflinkCopy),
            Self::JuicefsClone => Some(EngineKind::JuicefsClone),
        }
    }
}

impl fmt::Display for EngineChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Copy => f.write_str("copy"),
            Self::ReflinkCopy => f.write_str("reflink-copy"),
            Self::JuicefsClone => f.write_str("juicefs-clone"),
        }
    }
}

// ---------------------------------------------------------------------------
// LockConfig
// ---------------------------------------------------------------------------

/// Lock lease behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// Lease duration in seconds (default: 600).
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Maximum tolerated clock skew in milliseconds (default: 30 000).
    #[serde(default = "default_clock_skew_ms")]
    pub clock_skew_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_secs: default_lease_secs(),
            clock_skew_ms: default_clock_skew_ms(),
        }
    }
}

const fn default_lease_secs() -> u64 {
    600
}

const fn default_clock_skew_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// GcConfig
// ---------------------------------------------------------------------------

/// Garbage collection policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcConfig {
    /// Snapshots carrying any of these tags are never collected.
    #[serde(default)]
    pub retain_tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
