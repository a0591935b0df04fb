// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-response overrides read from a file.
//!
//! The file holds a list of `[[response]]` tables. Each names the commands it
//! applies to (any field left out matches everything) and the completion to
//! post in place of the controller's own handling:
//!
//! ```toml
//! [[response]]
//! opcode = 0x06
//! command_set = "admin"
//! cdw10 = 1
//!
//! [response.completion]
//! sct = 0
//! sc = 0x02
//! dnr = true
//! ```
//!
//! The file is re-read for every command, so it may be edited while the
//! controller runs.

use std::path::{Path, PathBuf};

use crate::bits::{self, SubmissionQueueEntry};
use crate::cmds::{Completion, PrpIter};
use crate::mem::HostMem;
use crate::queue::{QueueId, ADMIN_QUEUE_ID};

use serde::{Deserialize, Serialize};
use slog::Logger;
use thiserror::Error;

/// Errors which may be returned when reading a command-response file.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandSet {
    Admin,
    Nvm,
}

/// One override: which commands it covers and what to answer.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ResponseRule {
    pub opcode: Option<u8>,
    pub command_set: Option<CommandSet>,
    pub sqid: Option<QueueId>,
    pub nsid: Option<u32>,
    pub cdw10: Option<u32>,
    pub completion: RuleCompletion,
}

/// The completion posted for a matched command.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RuleCompletion {
    #[serde(default)]
    pub sct: u8,
    #[serde(default)]
    pub sc: u8,
    #[serde(default)]
    pub dnr: bool,
    #[serde(default)]
    pub dw0: u32,

    /// Data returned through the command's data pointer.
    #[serde(default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ResponseFile {
    #[serde(default, rename = "response")]
    responses: Vec<ResponseRule>,
}

impl ResponseRule {
    fn matches(&self, sqid: QueueId, sqe: &SubmissionQueueEntry) -> bool {
        let set = match sqid {
            ADMIN_QUEUE_ID => CommandSet::Admin,
            _ => CommandSet::Nvm,
        };
        self.opcode.map_or(true, |op| op == sqe.opcode())
            && self.command_set.map_or(true, |cs| cs == set)
            && self.sqid.map_or(true, |id| id == sqid)
            && self.nsid.map_or(true, |nsid| nsid == sqe.nsid)
            && self.cdw10.map_or(true, |dw| dw == sqe.cdw10)
    }
}

/// Parses a command-response file into its list of rules.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Vec<ResponseRule>, HookError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let file = toml::from_str::<ResponseFile>(&contents)?;
    Ok(file.responses)
}

/// The command-response file consulted ahead of built-in dispatch.
pub struct CommandResponseHook {
    path: PathBuf,
    log: Logger,
}

impl CommandResponseHook {
    pub fn new(path: PathBuf, log: Logger) -> Self {
        Self { path, log }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Answer the command from the first matching rule, writing any payload
    /// to host memory. Returns [`None`] if no rule applies, in which case the
    /// controller handles the command itself.
    pub fn respond(
        &self,
        sqid: QueueId,
        sqe: &SubmissionQueueEntry,
        mem: &HostMem,
    ) -> Option<Completion> {
        let rules = match parse(&self.path) {
            Ok(rules) => rules,
            Err(err) => {
                slog::warn!(self.log, "unusable command-response file";
                    "path" => %self.path.display(),
                    "error" => %err
                );
                return None;
            }
        };
        let (idx, rule) =
            rules.iter().enumerate().find(|(_, r)| r.matches(sqid, sqe))?;
        slog::debug!(self.log, "command answered by response file";
            "rule" => idx,
            "sqid" => sqid,
            "cid" => sqe.cid(),
            "opcode" => sqe.opcode()
        );

        let comp = &rule.completion;
        if !comp.payload.is_empty() {
            let prps = PrpIter::new(
                comp.payload.len() as u64,
                sqe.prp1,
                sqe.prp2,
                mem,
            );
            if let Err(err) = prps.write_all(&comp.payload) {
                slog::warn!(self.log, "response payload not written";
                    "error" => err
                );
                return Some(Completion::generic_err(bits::STS_DATA_XFER_ERR));
            }
        }
        Some(Completion::raw(comp.sct, comp.sc, comp.dnr, comp.dw0))
    }
}

impl std::fmt::Debug for CommandResponseHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandResponseHook")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::*;
    use std::io::Write;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn hook_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn parse_rules() {
        let file = hook_file(
            r#"
[[response]]
opcode = 6
command_set = "admin"
cdw10 = 1
[response.completion]
sc = 2
dnr = true

[[response]]
[response.completion]
dw0 = 7
"#,
        );
        let rules = parse(file.path()).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].opcode, Some(bits::ADMIN_OPC_IDENTIFY));
        assert_eq!(rules[0].command_set, Some(CommandSet::Admin));
        assert_eq!(rules[0].sqid, None);
        assert_eq!(rules[1].completion.dw0, 7);
        assert!(rules[1].completion.payload.is_empty());
    }

    #[test]
    fn first_match_wins() {
        let file = hook_file(
            r#"
[[response]]
opcode = 0x18
command_set = "nvm"
[response.completion]
sc = 1

[[response]]
opcode = 0x18
[response.completion]
dw0 = 0xabcd

[[response]]
opcode = 0x18
[response.completion]
sc = 6
"#,
        );
        let hook = CommandResponseHook::new(file.path().to_path_buf(), log());
        let mem = HostMem::new(4 * PAGE_SIZE);
        let sqe = SubmissionQueueEntry::new(bits::ADMIN_OPC_KEEP_ALIVE, 3);

        let comp = hook.respond(ADMIN_QUEUE_ID, &sqe, &mem).unwrap();
        assert_eq!(comp, Completion::success_val(0xabcd));

        let other = SubmissionQueueEntry::new(bits::ADMIN_OPC_IDENTIFY, 3);
        assert!(hook.respond(ADMIN_QUEUE_ID, &other, &mem).is_none());
    }

    #[test]
    fn payload_written_to_data_pointer() {
        let file = hook_file(
            r#"
[[response]]
nsid = 9
[response.completion]
payload = [1, 2, 3, 4]
"#,
        );
        let hook = CommandResponseHook::new(file.path().to_path_buf(), log());
        let mem = HostMem::new(4 * PAGE_SIZE);
        let buf = mem.alloc(PAGE_SIZE).unwrap();

        let mut sqe = SubmissionQueueEntry::new(bits::NVM_OPC_READ, 1);
        sqe.nsid = 9;
        sqe.prp1 = buf.0;
        let comp = hook.respond(1, &sqe, &mem).unwrap();
        assert!(comp.is_success());

        let mut back = [0u8; 4];
        assert!(mem.read_bytes(buf, &mut back));
        assert_eq!(back, [1, 2, 3, 4]);
    }

    #[test]
    fn missing_file_falls_through() {
        let hook = CommandResponseHook::new(
            PathBuf::from("/nonexistent/nvme-emu-responses.toml"),
            log(),
        );
        let mem = HostMem::new(4 * PAGE_SIZE);
        let sqe = SubmissionQueueEntry::new(bits::ADMIN_OPC_KEEP_ALIVE, 0);
        assert!(hook.respond(ADMIN_QUEUE_ID, &sqe, &mem).is_none());
        assert!(matches!(parse(hook.path()), Err(HookError::Io(_))));
    }
}
