// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use nvme_emu::{CtrlConfig, NamespaceConfig};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub main: Main,

    #[serde(default, rename = "namespace")]
    pub namespaces: BTreeMap<String, Namespace>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Main {
    pub serial: Option<String>,
    pub model: Option<String>,
    pub firmware_revision: Option<String>,
    /// Host memory, in MiB
    pub memory: Option<usize>,
    pub max_io_queues: Option<u16>,
    /// Command-response file consulted ahead of the built-in handlers
    pub hook: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Namespace {
    pub nsid: u32,
    pub block_size: Option<u32>,
    pub blocks: u64,

    /// Attached but not active when false
    ///
    /// Default: true
    pub active: Option<bool>,
}

impl Config {
    /// Controller settings, with anything left out taking its default.
    pub fn ctrl_config(&self) -> CtrlConfig {
        let defaults = CtrlConfig::default();
        let main = &self.main;
        let namespaces = match self.namespaces.is_empty() {
            true => defaults.namespaces,
            false => self
                .namespaces
                .values()
                .map(|ns| NamespaceConfig {
                    nsid: ns.nsid,
                    block_size: ns.block_size.unwrap_or(512),
                    blocks: ns.blocks,
                    active: ns.active.unwrap_or(true),
                })
                .collect(),
        };
        CtrlConfig {
            serial: main.serial.clone().unwrap_or(defaults.serial),
            model: main.model.clone().unwrap_or(defaults.model),
            firmware_revision: main
                .firmware_revision
                .clone()
                .unwrap_or(defaults.firmware_revision),
            mem_size: main.memory.map_or(defaults.mem_size, |mb| mb << 20),
            max_io_queues: main.max_io_queues.unwrap_or(defaults.max_io_queues),
            namespaces,
            command_response_file: main.hook.clone(),
        }
    }
}

pub fn parse(path: &str) -> anyhow::Result<Config> {
    let file_data =
        std::fs::read(path).context("Failed to read given config.toml")?;
    Ok(toml::from_str::<Config>(
        std::str::from_utf8(&file_data)
            .context("config should be valid utf-8")?,
    )?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn namespace_tables() {
        let cfg: Config = toml::from_str(
            r#"
[main]
serial = "SN-42"
memory = 16

[namespace.boot]
nsid = 1
blocks = 4096

[namespace.spare]
nsid = 2
block_size = 4096
blocks = 128
active = false
"#,
        )
        .unwrap();

        let ctrl = cfg.ctrl_config();
        assert_eq!(ctrl.serial, "SN-42");
        assert_eq!(ctrl.model, CtrlConfig::default().model);
        assert_eq!(ctrl.mem_size, 16 << 20);
        assert_eq!(ctrl.namespaces.len(), 2);
        assert_eq!(ctrl.namespaces[0].block_size, 512);
        assert!(!ctrl.namespaces[1].active);
        assert!(ctrl.validate().is_ok());
    }

    #[test]
    fn defaults_without_namespaces() {
        let cfg: Config = toml::from_str("[main]\n").unwrap();
        let ctrl = cfg.ctrl_config();
        assert_eq!(ctrl.namespaces, CtrlConfig::default().namespaces);
        assert!(ctrl.command_response_file.is_none());
    }
}
