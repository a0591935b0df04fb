// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::bits::*;
use crate::cmds::{self, Completion};
use crate::ctrl::NvmeCtrl;
use crate::mem::HostMem;
use crate::NvmeError;

#[usdt::provider(provider = "nvme_emu")]
mod probes {
    fn nvme_read(nsid: u32, off: u64, sz: u64) {}
    fn nvme_write(nsid: u32, off: u64, sz: u64) {}
    fn nvme_flush(nsid: u32) {}
}

impl NvmeCtrl {
    /// Service Flush command.
    ///
    /// Storage lives in memory, so there is never anything to flush.
    pub(crate) fn cmd_flush(&self, nsid: u32) -> Completion {
        if self.namespaces.active(nsid).is_none() {
            return Completion::generic_err(STS_INVALID_NS);
        }
        probes::nvme_flush!(|| nsid);
        Completion::success()
    }

    /// Service Write command: copy the host buffer into the namespace.
    pub(crate) fn cmd_write(
        &mut self,
        cmd: &cmds::RwCmd,
        mem: &HostMem,
    ) -> Completion {
        let Some(ns) = self.namespaces.active_mut(cmd.nsid) else {
            return Completion::generic_err(STS_INVALID_NS);
        };
        let Some(size) = range_size(ns.block_size(), ns.capacity(), cmd)
        else {
            return Completion::generic_err(STS_INVAL_FIELD);
        };
        probes::nvme_write!(|| (cmd.nsid, cmd.slba * ns.block_size(), size));

        let mut buf = vec![0u8; size as usize];
        if cmd.data(size, mem).read_all(&mut buf).is_err() {
            return Completion::generic_err(STS_DATA_XFER_ERR);
        }
        match ns.write_blocks(cmd.slba, &buf) {
            Ok(()) => Completion::success(),
            Err(err) => err.into(),
        }
    }

    /// Service Read command: copy namespace blocks out to the host buffer.
    pub(crate) fn cmd_read(
        &self,
        cmd: &cmds::RwCmd,
        mem: &HostMem,
    ) -> Completion {
        let Some(ns) = self.namespaces.active(cmd.nsid) else {
            return Completion::generic_err(STS_INVALID_NS);
        };
        let Some(size) = range_size(ns.block_size(), ns.capacity(), cmd)
        else {
            return Completion::generic_err(STS_INVAL_FIELD);
        };
        probes::nvme_read!(|| (cmd.nsid, cmd.slba * ns.block_size(), size));

        let mut buf = vec![0u8; size as usize];
        if let Err(err) = ns.read_blocks(cmd.slba, &mut buf) {
            return err.into();
        }
        match cmd.data(size, mem).write_all(&buf) {
            Ok(()) => Completion::success(),
            Err(_) => Completion::generic_err(STS_DATA_XFER_ERR),
        }
    }
}

/// Size in bytes of the transfer `cmd` describes, or [`None`] if its blocks
/// do not all lie within a namespace of `capacity` blocks.
fn range_size(
    block_size: u64,
    capacity: u64,
    cmd: &cmds::RwCmd,
) -> Option<u64> {
    let end = cmd.slba.checked_add(cmd.nlb as u64)?;
    (end <= capacity).then_some(cmd.nlb as u64 * block_size)
}

impl From<NvmeError> for Completion {
    fn from(e: NvmeError) -> Self {
        match e {
            NvmeError::InvalidNamespace(_) => {
                Completion::generic_err(STS_INVALID_NS)
            }
            NvmeError::LbaOutOfRange { .. } => {
                Completion::generic_err(STS_INVAL_FIELD)
            }
            NvmeError::MemoryInaccessible => {
                Completion::generic_err(STS_DATA_XFER_ERR)
            }
            _ => Completion::generic_err(STS_INTERNAL_ERR),
        }
    }
}
