// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Opcode dispatch tables for the Admin and NVM command sets.

use std::collections::BTreeMap;

use crate::bits::*;
use crate::cmds::{self, Completion, ParseErr};
use crate::ctrl::NvmeCtrl;
use crate::mem::HostMem;

use lazy_static::lazy_static;

/// Executes one parsed-from-raw command against the controller.
pub(crate) type Handler =
    fn(&mut NvmeCtrl, &SubmissionQueueEntry, &HostMem) -> Completion;

lazy_static! {
    /// Admin command handlers, keyed by opcode.
    pub(crate) static ref ADMIN_COMMANDS: BTreeMap<u8, Handler> = {
        let mut m: BTreeMap<u8, Handler> = BTreeMap::new();
        m.insert(ADMIN_OPC_DELETE_IO_SQ, admin_delete_io_sq);
        m.insert(ADMIN_OPC_CREATE_IO_SQ, admin_create_io_sq);
        m.insert(ADMIN_OPC_GET_LOG_PAGE, admin_get_log_page);
        m.insert(ADMIN_OPC_DELETE_IO_CQ, admin_delete_io_cq);
        m.insert(ADMIN_OPC_CREATE_IO_CQ, admin_create_io_cq);
        m.insert(ADMIN_OPC_IDENTIFY, admin_identify);
        m.insert(ADMIN_OPC_ABORT, admin_abort);
        m.insert(ADMIN_OPC_SET_FEATURES, admin_set_features);
        m.insert(ADMIN_OPC_GET_FEATURES, admin_get_features);
        m.insert(ADMIN_OPC_ASYNC_EVENT_REQ, admin_async_event_req);
        m.insert(ADMIN_OPC_FW_COMMIT, admin_fw_commit);
        m.insert(ADMIN_OPC_FW_IMAGE_DOWNLOAD, admin_fw_image_download);
        m.insert(ADMIN_OPC_KEEP_ALIVE, admin_keep_alive);
        m.insert(ADMIN_OPC_FORMAT_NVM, admin_format_nvm);
        m
    };

    /// NVM command handlers, keyed by opcode.
    pub(crate) static ref NVM_COMMANDS: BTreeMap<u8, Handler> = {
        let mut m: BTreeMap<u8, Handler> = BTreeMap::new();
        m.insert(NVM_OPC_FLUSH, nvm_flush);
        m.insert(NVM_OPC_WRITE, nvm_write);
        m.insert(NVM_OPC_READ, nvm_read);
        m
    };
}

/// Run `f` on a successfully parsed command, or report the parse failure.
fn with_cmd<C>(
    res: Result<C, ParseErr>,
    f: impl FnOnce(C) -> Completion,
) -> Completion {
    match res {
        Ok(cmd) => f(cmd),
        Err(err) => err.into(),
    }
}

fn admin_delete_io_sq(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    ctrl.acmd_delete_io_sq(cmds::parse_delete_qid(sqe))
}

fn admin_create_io_sq(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    with_cmd(cmds::CreateIOSQCmd::parse(sqe), |cmd| {
        ctrl.acmd_create_io_sq(&cmd)
    })
}

fn admin_get_log_page(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    mem: &HostMem,
) -> Completion {
    with_cmd(cmds::GetLogPageCmd::parse(sqe), |cmd| {
        ctrl.acmd_get_log_page(&cmd, mem)
    })
}

fn admin_delete_io_cq(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    ctrl.acmd_delete_io_cq(cmds::parse_delete_qid(sqe))
}

fn admin_create_io_cq(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    with_cmd(cmds::CreateIOCQCmd::parse(sqe), |cmd| {
        ctrl.acmd_create_io_cq(&cmd)
    })
}

fn admin_identify(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    mem: &HostMem,
) -> Completion {
    with_cmd(cmds::IdentifyCmd::parse(sqe), |cmd| {
        ctrl.acmd_identify(&cmd, mem)
    })
}

fn admin_abort(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    with_cmd(cmds::AbortCmd::parse(sqe), |cmd| ctrl.acmd_abort(&cmd))
}

fn admin_set_features(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    with_cmd(cmds::SetFeaturesCmd::parse(sqe), |cmd| {
        ctrl.acmd_set_features(&cmd)
    })
}

fn admin_get_features(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    with_cmd(cmds::GetFeaturesCmd::parse(sqe), |cmd| {
        ctrl.acmd_get_features(&cmd)
    })
}

// Asynchronous events are never raised
fn admin_async_event_req(
    _ctrl: &mut NvmeCtrl,
    _sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    Completion::generic_err(STS_INVAL_OPC).dnr()
}

fn admin_fw_commit(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    with_cmd(cmds::FwCommitCmd::parse(sqe), |cmd| ctrl.acmd_fw_commit(&cmd))
}

fn admin_fw_image_download(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    mem: &HostMem,
) -> Completion {
    with_cmd(cmds::FwImageDownloadCmd::parse(sqe), |cmd| {
        ctrl.acmd_fw_image_download(&cmd, mem)
    })
}

fn admin_keep_alive(
    ctrl: &mut NvmeCtrl,
    _sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    ctrl.acmd_keep_alive()
}

fn admin_format_nvm(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    with_cmd(cmds::FormatNvmCmd::parse(sqe), |cmd| {
        ctrl.acmd_format_nvm(&cmd)
    })
}

fn nvm_flush(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    _mem: &HostMem,
) -> Completion {
    ctrl.cmd_flush(sqe.nsid)
}

fn nvm_write(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    mem: &HostMem,
) -> Completion {
    with_cmd(cmds::RwCmd::parse(sqe), |cmd| ctrl.cmd_write(&cmd, mem))
}

fn nvm_read(
    ctrl: &mut NvmeCtrl,
    sqe: &SubmissionQueueEntry,
    mem: &HostMem,
) -> Completion {
    with_cmd(cmds::RwCmd::parse(sqe), |cmd| ctrl.cmd_read(&cmd, mem))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn admin_table_covers_command_set() {
        let expected = [
            ADMIN_OPC_DELETE_IO_SQ,
            ADMIN_OPC_CREATE_IO_SQ,
            ADMIN_OPC_GET_LOG_PAGE,
            ADMIN_OPC_DELETE_IO_CQ,
            ADMIN_OPC_CREATE_IO_CQ,
            ADMIN_OPC_IDENTIFY,
            ADMIN_OPC_ABORT,
            ADMIN_OPC_SET_FEATURES,
            ADMIN_OPC_GET_FEATURES,
            ADMIN_OPC_ASYNC_EVENT_REQ,
            ADMIN_OPC_FW_COMMIT,
            ADMIN_OPC_FW_IMAGE_DOWNLOAD,
            ADMIN_OPC_KEEP_ALIVE,
            ADMIN_OPC_FORMAT_NVM,
        ];
        let keys: Vec<u8> = ADMIN_COMMANDS.keys().copied().collect();
        let mut expected = expected.to_vec();
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn nvm_table_covers_command_set() {
        let keys: Vec<u8> = NVM_COMMANDS.keys().copied().collect();
        assert_eq!(keys, vec![NVM_OPC_FLUSH, NVM_OPC_WRITE, NVM_OPC_READ]);
        assert!(!NVM_COMMANDS.contains_key(&0x7f));
    }
}
