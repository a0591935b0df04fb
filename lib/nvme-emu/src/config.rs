// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::common::PAGE_SIZE;
use crate::ns::NSID_BROADCAST;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The max number of I/O completion or submission queues supported by
/// default. The admin pair comes on top of this.
pub const DEFAULT_MAX_IO_QUEUES: u16 = 15;

/// Errors in a controller configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("serial number longer than 20 bytes")]
    SerialTooLong,

    #[error("model number longer than 40 bytes")]
    ModelTooLong,

    #[error("firmware revision longer than 8 bytes")]
    FirmwareRevisionTooLong,

    #[error("host memory of {0} bytes is too small")]
    MemoryTooSmall(usize),

    #[error("at least one I/O queue pair is required")]
    NoIoQueues,

    #[error("namespace ID {0} is reserved")]
    ReservedNamespaceId(u32),

    #[error("namespace ID {0} is configured twice")]
    DuplicateNamespaceId(u32),

    #[error("namespace {0} has an unsupported block size of {1}")]
    UnsupportedBlockSize(u32, u32),

    #[error("namespace {0} has no blocks")]
    EmptyNamespace(u32),
}

/// Controller construction parameters.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CtrlConfig {
    /// Serial Number (SN) reported by Identify Controller.
    pub serial: String,

    /// Model Number (MN) reported by Identify Controller.
    pub model: String,

    /// Revision of the firmware running at power on, loaded into slot 1.
    pub firmware_revision: String,

    /// Bytes of host memory backing queues and data buffers.
    pub mem_size: usize,

    /// I/O Submission and Completion Queues supported, each.
    pub max_io_queues: u16,

    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,

    /// File of command-response rules consulted before built-in handling.
    #[serde(default)]
    pub command_response_file: Option<PathBuf>,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            serial: "NVME-EMU-0001".to_string(),
            model: "nvme-emu".to_string(),
            firmware_revision: "1.0".to_string(),
            mem_size: 4 << 20,
            max_io_queues: DEFAULT_MAX_IO_QUEUES,
            namespaces: vec![NamespaceConfig::default()],
            command_response_file: None,
        }
    }
}

impl CtrlConfig {
    /// Check the configuration for settings the controller cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.len() > 20 {
            return Err(ConfigError::SerialTooLong);
        }
        if self.model.len() > 40 {
            return Err(ConfigError::ModelTooLong);
        }
        if self.firmware_revision.len() > 8 {
            return Err(ConfigError::FirmwareRevisionTooLong);
        }
        // Room for at least the reserved first page plus an admin pair
        if self.mem_size < 4 * PAGE_SIZE {
            return Err(ConfigError::MemoryTooSmall(self.mem_size));
        }
        if self.max_io_queues == 0 {
            return Err(ConfigError::NoIoQueues);
        }

        let mut seen = BTreeSet::new();
        for ns in &self.namespaces {
            if ns.nsid == 0 || ns.nsid >= NSID_BROADCAST - 1 {
                return Err(ConfigError::ReservedNamespaceId(ns.nsid));
            }
            if !seen.insert(ns.nsid) {
                return Err(ConfigError::DuplicateNamespaceId(ns.nsid));
            }
            if !ns.block_size.is_power_of_two()
                || !(512..=4096).contains(&ns.block_size)
            {
                return Err(ConfigError::UnsupportedBlockSize(
                    ns.nsid,
                    ns.block_size,
                ));
            }
            if ns.blocks == 0 {
                return Err(ConfigError::EmptyNamespace(ns.nsid));
            }
        }
        Ok(())
    }
}

/// A namespace as attached at power on.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NamespaceConfig {
    pub nsid: u32,

    /// Logical block size in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Capacity in logical blocks.
    pub blocks: u64,

    /// Whether the namespace starts attached (active) or merely allocated.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_block_size() -> u32 {
    512
}

fn default_active() -> bool {
    true
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self { nsid: 1, block_size: 512, blocks: 2048, active: true }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        CtrlConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_namespaces() {
        let mut cfg = CtrlConfig::default();
        cfg.namespaces.push(NamespaceConfig::default());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateNamespaceId(1))
        ));

        cfg.namespaces[1] =
            NamespaceConfig { nsid: 0, ..NamespaceConfig::default() };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ReservedNamespaceId(0))
        ));

        cfg.namespaces[1] = NamespaceConfig {
            nsid: 2,
            block_size: 1000,
            ..NamespaceConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnsupportedBlockSize(2, 1000))
        ));
    }

    #[test]
    fn rejects_bad_controller_settings() {
        let cfg = CtrlConfig { max_io_queues: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::NoIoQueues)));

        let cfg = CtrlConfig { serial: "x".repeat(21), ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::SerialTooLong)));

        let cfg = CtrlConfig { mem_size: PAGE_SIZE, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::MemoryTooSmall(_))));
    }

    #[test]
    fn config_can_be_serialized_as_toml() {
        let cfg = CtrlConfig::default();
        let serialized = toml::ser::to_string(&cfg).unwrap();
        let deserialized: CtrlConfig = toml::de::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn namespace_defaults() {
        let raw = r#"
serial = "SN1"
model = "M1"
firmware_revision = "2.0"
mem_size = 1048576
max_io_queues = 4

[[namespaces]]
nsid = 3
blocks = 64
"#;
        let cfg: CtrlConfig = toml::de::from_str(raw).unwrap();
        assert_eq!(
            cfg.namespaces,
            vec![NamespaceConfig {
                nsid: 3,
                block_size: 512,
                blocks: 64,
                active: true
            }]
        );
        assert_eq!(cfg.command_response_file, None);
        cfg.validate().unwrap();
    }
}
