//! Global configuration parsing and validation.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::kernel::Address;
use crate::models::report::CheckpointMode;
use crate::models::session::SessionKind;
use crate::{AppError, Result};

/// Worker unit name of the capability mapper.
pub const CAP_MAPPER_UNIT: &str = "cap_mapper";

/// Layout of the kernel's capability table inside a child's address space.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CapTableConfig {
    /// Virtual address of the table in the child's address space.
    #[serde(default = "default_cap_base")]
    pub base_address: Address,
    /// Number of slots in the table.
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,
    /// Bytes per slot.
    #[serde(default = "default_slot_size")]
    pub slot_size: usize,
    /// Offset of the 16-bit little-endian badge inside a slot.
    #[serde(default = "default_badge_offset")]
    pub badge_offset: usize,
    /// Shift turning a slot index into a kcap.
    #[serde(default = "default_kcap_shift")]
    pub kcap_shift: u32,
}

impl CapTableConfig {
    /// Size of the whole table in bytes.
    #[must_use]
    pub fn table_size(&self) -> usize {
        self.slot_count * self.slot_size
    }
}

impl Default for CapTableConfig {
    fn default() -> Self {
        Self {
            base_address: default_cap_base(),
            slot_count: default_slot_count(),
            slot_size: default_slot_size(),
            badge_offset: default_badge_offset(),
            kcap_shift: default_kcap_shift(),
        }
    }
}

fn default_cap_base() -> Address {
    0x3080_0000
}

fn default_slot_count() -> usize {
    512
}

fn default_slot_size() -> usize {
    8
}

fn default_badge_offset() -> usize {
    2
}

fn default_kcap_shift() -> u32 {
    12
}

/// A child launched by the binary against the simulated kernel.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChildConfig {
    /// Child name; the first component of its session labels.
    pub name: String,
    /// Threads created at launch.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Sizes of the dataspaces allocated and attached at launch.
    #[serde(default)]
    pub dataspaces: Vec<usize>,
    /// Quota donated to the child's RAM session.
    #[serde(default = "default_ram_quota")]
    pub ram_quota: usize,
    /// ROM module the child opens, if any.
    #[serde(default)]
    pub rom: Option<String>,
}

impl ChildConfig {
    /// A child with one thread, no extra dataspaces and the default quota.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threads: default_threads(),
            dataspaces: Vec::new(),
            ram_quota: default_ram_quota(),
            rom: None,
        }
    }
}

fn default_threads() -> usize {
    1
}

fn default_ram_quota() -> usize {
    8 << 20
}

fn default_ipc_name() -> String {
    "rtcr".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Start all checkpoint jobs before joining any.
    #[serde(default)]
    pub parallel: bool,
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Period of automatic checkpoint cycles; 0 disables them.
    #[serde(default)]
    pub interval_ms: u64,
    /// CPU placement hints per worker unit.
    #[serde(default)]
    pub affinity: HashMap<String, usize>,
    /// Capability table layout.
    #[serde(default)]
    pub cap_table: CapTableConfig,
    /// Children launched at start-up.
    #[serde(default)]
    pub children: Vec<ChildConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            ipc_name: default_ipc_name(),
            interval_ms: 0,
            affinity: HashMap::new(),
            cap_table: CapTableConfig::default(),
            children: Vec::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Scheduling mode of checkpoint jobs.
    #[must_use]
    pub fn mode(&self) -> CheckpointMode {
        if self.parallel {
            CheckpointMode::Parallel
        } else {
            CheckpointMode::Sequential
        }
    }

    /// Placement hint for a worker unit.
    #[must_use]
    pub fn affinity_for(&self, unit: &str) -> Option<usize> {
        self.affinity.get(unit).copied()
    }

    fn validate(&self) -> Result<()> {
        let table = &self.cap_table;
        if table.slot_count == 0 {
            return Err(AppError::Config(
                "cap_table.slot_count must be greater than zero".into(),
            ));
        }
        if table.slot_size < table.badge_offset + 2 {
            return Err(AppError::Config(format!(
                "cap_table.slot_size {} does not cover the badge at offset {}",
                table.slot_size, table.badge_offset
            )));
        }
        if table.kcap_shift >= 64 {
            return Err(AppError::Config(
                "cap_table.kcap_shift must be below 64".into(),
            ));
        }

        for unit in self.affinity.keys() {
            let known = unit == CAP_MAPPER_UNIT
                || SessionKind::ALL.iter().any(|kind| kind.unit_name() == unit);
            if !known {
                return Err(AppError::Config(format!("unknown affinity unit '{unit}'")));
            }
        }

        let mut names = BTreeSet::new();
        for child in &self.children {
            if child.name.trim().is_empty() {
                return Err(AppError::Config("child name must not be empty".into()));
            }
            if !names.insert(child.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate child name '{}'",
                    child.name
                )));
            }
        }

        Ok(())
    }
}
