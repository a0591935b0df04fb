// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp::min;
use std::mem::size_of;

use crate::bits::*;
use crate::cmds::{self, Completion};
use crate::common::*;
use crate::ctrl::NvmeCtrl;
use crate::mem::HostMem;
use crate::ns::{self, NSID_BROADCAST};
use crate::queue::{QueueId, ADMIN_QUEUE_ID};
use crate::NvmeError;

use zerocopy::IntoBytes;

impl NvmeCtrl {
    /// Service Create I/O Completion Queue command.
    ///
    /// See NVMe 1.0e Section 5.3 Create I/O Completion Queue command
    pub(crate) fn acmd_create_io_cq(
        &mut self,
        cmd: &cmds::CreateIOCQCmd,
    ) -> Completion {
        // The host must have configured the standard entry size
        if self.regs().cc().iocqes() != CQES_LOG2 {
            return Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_CREATE_IO_Q_INVAL_QSIZE,
            );
        }

        // We only support physical contiguous queues
        if !cmd.phys_contig {
            return Completion::generic_err(STS_INVAL_FIELD);
        }

        if cmd.qid == ADMIN_QUEUE_ID {
            return Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_CREATE_IO_Q_INVAL_QID,
            );
        }

        // Finally, create the Completion Queue
        match self.create_cq(cmd.qid, HostAddr(cmd.prp), cmd.qsize) {
            Ok(()) => Completion::success(),
            Err(
                NvmeError::InvalidCompQueue(_)
                | NvmeError::CompQueueAlreadyExists(_),
            ) => Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_CREATE_IO_Q_INVAL_QID,
            ),
            Err(NvmeError::QueueCreateErr(err)) => err.into(),
            Err(_) => Completion::generic_err(STS_INTERNAL_ERR),
        }
    }

    /// Service I/O Create Submission Queue command.
    ///
    /// See NVMe 1.0e Section 5.4 Create I/O Submission Queue command
    pub(crate) fn acmd_create_io_sq(
        &mut self,
        cmd: &cmds::CreateIOSQCmd,
    ) -> Completion {
        // The host must have configured the standard entry size
        if self.regs().cc().iosqes() != SQES_LOG2 {
            return Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_CREATE_IO_Q_INVAL_QSIZE,
            );
        }

        // We only support physical contiguous queues
        if !cmd.phys_contig {
            return Completion::generic_err(STS_INVAL_FIELD);
        }

        if cmd.qid == ADMIN_QUEUE_ID {
            return Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_CREATE_IO_Q_INVAL_QID,
            );
        }

        // I/O submissions may not be routed to the Admin Completion Queue
        if cmd.cqid == ADMIN_QUEUE_ID {
            return Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_CREATE_IO_Q_INVAL_CQ,
            );
        }

        // Finally, create the Submission Queue
        match self.create_sq(cmd.qid, cmd.cqid, HostAddr(cmd.prp), cmd.qsize)
        {
            Ok(()) => Completion::success(),
            // A missing Completion Queue is reported against the queue
            // identifiers, the same as a clashing SQ ID.
            Err(
                NvmeError::InvalidCompQueue(_)
                | NvmeError::InvalidSubQueue(_)
                | NvmeError::SubQueueAlreadyExists(_),
            ) => Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_CREATE_IO_Q_INVAL_QID,
            ),
            Err(NvmeError::QueueCreateErr(err)) => err.into(),
            Err(_) => Completion::generic_err(STS_INTERNAL_ERR),
        }
    }

    /// Service I/O Delete Completion Queue command.
    ///
    /// See NVMe 1.0e Section 5.5 Delete I/O Submission Queue command
    pub(crate) fn acmd_delete_io_cq(&mut self, cqid: QueueId) -> Completion {
        // Not allowed to delete the Admin Completion Queue
        if cqid == ADMIN_QUEUE_ID {
            return Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_DELETE_IO_Q_INVAL_QID,
            );
        }

        // Remove the CQ from our list of active CQs.
        // At this point, all associated SQs should've been deleted
        // otherwise we'll return an error.
        match self.delete_cq(cqid) {
            Ok(()) => Completion::success(),
            Err(NvmeError::InvalidCompQueue(_)) => Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_DELETE_IO_Q_INVAL_QID,
            ),
            Err(NvmeError::AssociatedSubQueuesStillExist(_, _)) => {
                Completion::specific_err(
                    StatusCodeType::CmdSpecific,
                    STS_DELETE_IO_Q_INVAL_Q_DELETION,
                )
            }
            _ => Completion::generic_err(STS_INTERNAL_ERR),
        }
    }

    /// Service I/O Delete Submission Queue command.
    ///
    /// See NVMe 1.0e Section 5.6 Delete I/O Submission Queue command
    pub(crate) fn acmd_delete_io_sq(&mut self, sqid: QueueId) -> Completion {
        // Not allowed to delete the Admin Submission Queue
        if sqid == ADMIN_QUEUE_ID {
            return Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_DELETE_IO_Q_INVAL_QID,
            );
        }

        // Execution is instantaneous, so nothing can still be in progress
        // on the queue once its doorbell stops being serviced.
        match self.delete_sq(sqid) {
            Ok(()) => Completion::success(),
            Err(NvmeError::InvalidSubQueue(_)) => Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_DELETE_IO_Q_INVAL_QID,
            ),
            _ => Completion::generic_err(STS_INTERNAL_ERR),
        }
    }

    /// Service Get Log Page command.
    ///
    /// See NVMe 1.2 Section 5.14 Get Log Page command
    pub(crate) fn acmd_get_log_page(
        &self,
        cmd: &cmds::GetLogPageCmd,
        mem: &HostMem,
    ) -> Completion {
        let len = min(cmd.len as usize, PAGE_SIZE);
        let mut page = vec![0u8; len];
        match cmd.log_page_ident {
            cmds::LogPageIdent::Firmware => {
                let info = self.firmware.slot_info().as_bytes();
                let n = min(len, info.len());
                page[..n].copy_from_slice(&info[..n]);
            }
            // No errors or health data are ever recorded
            cmds::LogPageIdent::Error | cmds::LogPageIdent::Smart => {}
            _ => return Completion::generic_err(STS_INVAL_FIELD),
        }
        match cmd.data(mem).write_all(&page) {
            Ok(()) => Completion::success(),
            Err(_) => Completion::generic_err(STS_DATA_XFER_ERR),
        }
    }

    /// Service Identify command.
    ///
    /// See NVMe 1.2 Section 5.15 Identify command
    pub(crate) fn acmd_identify(
        &self,
        cmd: &cmds::IdentifyCmd,
        mem: &HostMem,
    ) -> Completion {
        let mut page = vec![0u8; PAGE_SIZE];
        match cmd.cns {
            IDENT_CNS_NAMESPACE => {
                if let Some(ns) = self.namespaces.active(cmd.nsid) {
                    assert!(size_of::<IdentifyNamespace>() <= PAGE_SIZE);
                    page.copy_from_slice(ns.identify().as_bytes());
                } else if !self.namespaces.is_inactive(cmd.nsid) {
                    // Allocated but inactive namespaces read as zeroes
                    return Completion::generic_err(STS_INVALID_NS);
                }
            }
            IDENT_CNS_CONTROLLER => {
                assert!(size_of::<IdentifyController>() <= PAGE_SIZE);
                page.copy_from_slice(self.ctrl_ident.as_bytes());
            }
            IDENT_CNS_ACTIVE_NS_LIST => {
                match ns::get_namespace_list_from_map(
                    self.namespaces.active_nsids(),
                    cmd.nsid,
                ) {
                    Ok(list) => page.copy_from_slice(list.as_bytes()),
                    Err(_) => return Completion::generic_err(STS_INVALID_NS),
                }
            }
            IDENT_CNS_ALLOCATED_NS_LIST => {
                let allocated = self.namespaces.get_allocated_namespace_map();
                match ns::get_namespace_list_from_map(
                    allocated.keys().copied(),
                    cmd.nsid,
                ) {
                    Ok(list) => page.copy_from_slice(list.as_bytes()),
                    Err(_) => return Completion::generic_err(STS_INVALID_NS),
                }
            }
            IDENT_CNS_ALLOCATED_NAMESPACE => {
                let allocated = self.namespaces.get_allocated_namespace_map();
                match allocated.get(&cmd.nsid) {
                    Some(ns) => page.copy_from_slice(ns.identify().as_bytes()),
                    None => return Completion::generic_err(STS_INVALID_NS),
                }
            }
            _ => return Completion::generic_err(STS_INVAL_FIELD),
        }
        match cmd.data(mem).write_all(&page) {
            Ok(()) => Completion::success(),
            Err(_) => Completion::generic_err(STS_DATA_XFER_ERR),
        }
    }

    /// Service Abort command.
    ///
    /// Commands complete as soon as they are fetched, so there is never
    /// anything left to abort.
    pub(crate) fn acmd_abort(&self, cmd: &cmds::AbortCmd) -> Completion {
        slog::debug!(self.log, "abort requested";
            "sqid" => cmd.sqid,
            "cid" => cmd.cid
        );
        // Bit 0 of DW0 set: command not aborted
        Completion::success_val(1)
    }

    /// Service Set Features command.
    ///
    /// See NVMe 1.0e Section 5.12 Set Features command
    pub(crate) fn acmd_set_features(
        &mut self,
        cmd: &cmds::SetFeaturesCmd,
    ) -> Completion {
        match cmd.fid {
            cmds::FeatureIdent::NumberOfQueues { ncqr, nsqr } => {
                if ncqr == 0 || nsqr == 0 {
                    return Completion::generic_err(STS_INVAL_FIELD);
                }

                // If they ask for too many queues, just return our max
                // possible
                let max = self.max_io_queues as u32;
                let ncqa = min(ncqr, max);
                let nsqa = min(nsqr, max);
                self.queues_granted = min(ncqa, nsqa) as u16;

                // `ncqa`/`nsqa` are 0-based values so subtract 1
                Completion::success_val((ncqa - 1) << 16 | (nsqa - 1))
            }
            cmds::FeatureIdent::VolatileWriteCache { wce } => {
                self.write_cache = wce;
                Completion::success()
            }
            cmds::FeatureIdent::Other(_) => {
                Completion::generic_err(STS_INVAL_FIELD)
            }
        }
    }

    /// Service Get Features command.
    ///
    /// See NVMe 1.0e Section 5.9 Get Features command
    pub(crate) fn acmd_get_features(
        &self,
        cmd: &cmds::GetFeaturesCmd,
    ) -> Completion {
        match cmd.fid {
            FEAT_ID_NUM_QUEUES => {
                let n = self.queues_granted as u32 - 1;
                Completion::success_val(n << 16 | n)
            }
            FEAT_ID_VOLATILE_WRITE_CACHE => {
                Completion::success_val(self.write_cache as u32)
            }
            _ => Completion::generic_err(STS_INVAL_FIELD),
        }
    }

    /// Service Firmware Image Download command.
    ///
    /// See NVMe 1.2 Section 5.13 Firmware Image Download command
    pub(crate) fn acmd_fw_image_download(
        &mut self,
        cmd: &cmds::FwImageDownloadCmd,
        mem: &HostMem,
    ) -> Completion {
        // No transfer can be larger than host memory itself
        if cmd.len() > mem.len() as u64 {
            return Completion::generic_err(STS_INVAL_FIELD);
        }
        let mut chunk = vec![0u8; cmd.len() as usize];
        if cmd.data(mem).read_all(&mut chunk).is_err() {
            return Completion::generic_err(STS_DATA_XFER_ERR);
        }
        match self.firmware.download(cmd.ofst, chunk) {
            Ok(()) => Completion::success(),
            Err(err) => {
                slog::warn!(self.log, "firmware download refused";
                    "error" => %err
                );
                err.into()
            }
        }
    }

    /// Service Firmware Commit command.
    ///
    /// See NVMe 1.2 Section 5.12 Firmware Commit command
    pub(crate) fn acmd_fw_commit(
        &mut self,
        cmd: &cmds::FwCommitCmd,
    ) -> Completion {
        match self.firmware.commit(cmd.fs, cmd.ca) {
            Ok(()) => {
                self.ctrl_ident.fr = self.firmware.running_revision();
                slog::info!(self.log, "firmware committed";
                    "slot" => cmd.fs,
                    "action" => cmd.ca,
                    "active" => self.firmware.active_slot()
                );
                Completion::success()
            }
            Err(err) => {
                slog::warn!(self.log, "firmware commit failed";
                    "error" => %err
                );
                err.into()
            }
        }
    }

    /// Service Format NVM command.
    ///
    /// See NVMe 1.2 Section 5.23 Format NVM command
    pub(crate) fn acmd_format_nvm(
        &mut self,
        cmd: &cmds::FormatNvmCmd,
    ) -> Completion {
        let targets: Vec<u32> = if cmd.nsid == NSID_BROADCAST {
            self.namespaces.active_nsids().collect()
        } else if self.namespaces.active(cmd.nsid).is_some() {
            vec![cmd.nsid]
        } else {
            return Completion::generic_err(STS_INVAL_FIELD);
        };
        let supported = targets.iter().all(|&nsid| {
            self.namespaces
                .active(nsid)
                .is_some_and(|ns| ns.supports_format(cmd.lbaf))
        });
        if !supported {
            return Completion::specific_err(
                StatusCodeType::CmdSpecific,
                STS_FORMAT_INVAL_FORMAT,
            );
        }
        for nsid in targets {
            if let Some(ns) = self.namespaces.active_mut(nsid) {
                ns.format(cmd.lbaf);
            }
        }
        slog::info!(self.log, "formatted namespace";
            "nsid" => cmd.nsid,
            "lbaf" => cmd.lbaf,
            "ses" => cmd.ses
        );
        Completion::success()
    }

    /// Service Keep Alive command.
    pub(crate) fn acmd_keep_alive(&self) -> Completion {
        Completion::success()
    }
}
