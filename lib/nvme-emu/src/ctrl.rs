// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::Arc;

use crate::bits::*;
use crate::cmds::{self, Completion};
use crate::common::*;
use crate::config::CtrlConfig;
use crate::dispatch;
use crate::firmware::Firmware;
use crate::hook::CommandResponseHook;
use crate::mem::HostMem;
use crate::ns::NamespaceStore;
use crate::queue::{self, CompQueue, QueueId, SubQueue, ADMIN_QUEUE_ID};
use crate::regs::RegisterBlock;
use crate::tracker::CidTracker;
use crate::NvmeError;

use slog::Logger;

#[usdt::provider(provider = "nvme_emu")]
mod probes {
    fn nvme_admin_cmd(opcode: u8, prp1: u64, prp2: u64) {}
    fn nvme_raw_cmd(sqid: u16, cdw0nsid: u64, prp1: u64, cdw10cdw11: u64) {}
    fn nvme_cmd_complete(sqid: u16, cid: u16, status: u16) {}
}

/// IEEE OUI reported in Identify Controller.
const IEEE_OUI: [u8; 3] = [0x00, 0x00, 0x00];

/// The controller engine.
///
/// Owns the queues, namespaces, firmware state and in-flight command
/// tracking. Only ever driven from the doorbell worker.
pub(crate) struct NvmeCtrl {
    regs: Arc<RegisterBlock>,
    mem: Arc<HostMem>,

    /// I/O queues supported, of each kind.
    pub(crate) max_io_queues: u16,

    /// The Completion Queues handled by the controller
    pub(crate) cqs: BTreeMap<QueueId, CompQueue>,

    /// The Submission Queues handled by the controller
    pub(crate) sqs: BTreeMap<QueueId, SubQueue>,

    pub(crate) tracker: CidTracker,

    /// The Identify structure returned for Identify controller commands
    pub(crate) ctrl_ident: IdentifyController,

    /// Identify Controller as it stands before any firmware changes.
    base_ident: IdentifyController,

    pub(crate) namespaces: NamespaceStore,

    pub(crate) firmware: Firmware,

    /// Number of I/O queues granted through Set Features, of each kind.
    pub(crate) queues_granted: u16,

    /// Volatile Write Cache Enable (WCE)
    pub(crate) write_cache: bool,

    hook: Option<CommandResponseHook>,

    pub(crate) log: Logger,
}

impl NvmeCtrl {
    pub(crate) fn new(
        cfg: &CtrlConfig,
        regs: Arc<RegisterBlock>,
        mem: Arc<HostMem>,
        log: Logger,
    ) -> Self {
        // We have unit tests that these are 16 and 64 bytes, respectively
        // But just make sure as we specify these as powers of 2 in places
        debug_assert!(size_of::<CompletionQueueEntry>().is_power_of_two());
        debug_assert!(size_of::<SubmissionQueueEntry>().is_power_of_two());

        let namespaces = NamespaceStore::new(&cfg.namespaces);
        let firmware = Firmware::new(&cfg.firmware_revision);

        // Initialize the Identify structure returned when the host issues
        // an Identify Controller command.
        let base_ident = IdentifyController {
            sn: ascii_pad(&cfg.serial),
            mn: ascii_pad(&cfg.model),
            ieee: IEEE_OUI,
            // Format NVM and Firmware Commit/Image Download
            oacs: 1 << 1 | 1 << 2,
            // Abort Command Limit, 0's based
            acl: 3,
            // Seven firmware slots, none read-only
            frmw: FW_SLOT_COUNT << 1,
            // We use standard Completion/Submission Queue Entry structures
            // with no extra data, so required (minimum) == maximum
            sqes: NvmQueueEntrySize(0)
                .with_maximum(SQES_LOG2)
                .with_required(SQES_LOG2)
                .0,
            cqes: NvmQueueEntrySize(0)
                .with_maximum(CQES_LOG2)
                .with_required(CQES_LOG2)
                .0,
            nn: namespaces.max_nsid(),
            // bit 0 indicates volatile write cache is present
            vwc: 1,
            ..Default::default()
        };

        let hook = cfg.command_response_file.clone().map(|path| {
            CommandResponseHook::new(path, log.new(slog::o!("unit" => "hook")))
        });

        let mut ctrl = Self {
            regs,
            mem,
            max_io_queues: cfg.max_io_queues,
            cqs: BTreeMap::new(),
            sqs: BTreeMap::new(),
            tracker: CidTracker::new(),
            ctrl_ident: base_ident,
            base_ident,
            namespaces,
            firmware,
            queues_granted: cfg.max_io_queues,
            write_cache: false,
            hook,
            log,
        };
        ctrl.reset_identify_controller();
        ctrl
    }

    /// Rebuild the Identify Controller structure, reporting the running
    /// firmware revision.
    pub(crate) fn reset_identify_controller(&mut self) {
        self.ctrl_ident = self.base_ident;
        self.ctrl_ident.fr = self.firmware.running_revision();
    }

    pub(crate) fn set_command_response_hook(
        &mut self,
        hook: Option<CommandResponseHook>,
    ) {
        self.hook = hook;
    }

    pub(crate) fn regs(&self) -> &RegisterBlock {
        &self.regs
    }

    /// Creates the admin completion and submission queues.
    ///
    /// Admin queues are always created with `cqid`/`sqid` `0`.
    fn create_admin_queues(&mut self) -> Result<(), NvmeError> {
        let aqa = self.regs.aqa();
        self.create_cq(
            ADMIN_QUEUE_ID,
            HostAddr(self.regs.acq()),
            // Convert from 0's based
            aqa.acqs() as u32 + 1,
        )?;
        self.create_sq(
            ADMIN_QUEUE_ID,
            ADMIN_QUEUE_ID,
            HostAddr(self.regs.asq()),
            // Convert from 0's based
            aqa.asqs() as u32 + 1,
        )?;
        Ok(())
    }

    /// Largest number of entries a queue `qid` may hold.
    fn max_entries(&self, qid: QueueId) -> u32 {
        match qid {
            ADMIN_QUEUE_ID => queue::MAX_ADMIN_QUEUE_SIZE,
            _ => self.regs.cap().max_queue_entries(),
        }
    }

    /// Creates and stores a new completion queue ([`CompQueue`]) for the
    /// controller.
    ///
    /// The specified `cqid` must not already be in use by another completion
    /// queue.
    pub(crate) fn create_cq(
        &mut self,
        cqid: QueueId,
        base: HostAddr,
        size: u32,
    ) -> Result<(), NvmeError> {
        if cqid > self.max_io_queues {
            return Err(NvmeError::InvalidCompQueue(cqid));
        }
        if self.cqs.contains_key(&cqid) {
            return Err(NvmeError::CompQueueAlreadyExists(cqid));
        }
        let max = self.max_entries(cqid);
        let cq = CompQueue::new(cqid, size, max, base, &self.mem)?;
        self.cqs.insert(cqid, cq);
        self.regs.set_cq_head(cqid, 0);
        Ok(())
    }

    /// Creates and stores a new submission queue ([`SubQueue`]) for the
    /// controller.
    ///
    /// The specified `sqid` must not already be in use by another submission
    /// queue. The corresponding completion queue specified (`cqid`) must
    /// already exist.
    pub(crate) fn create_sq(
        &mut self,
        sqid: QueueId,
        cqid: QueueId,
        base: HostAddr,
        size: u32,
    ) -> Result<(), NvmeError> {
        if sqid > self.max_io_queues {
            return Err(NvmeError::InvalidSubQueue(sqid));
        }
        if self.sqs.contains_key(&sqid) {
            return Err(NvmeError::SubQueueAlreadyExists(sqid));
        }
        let max = self.max_entries(sqid);
        let cq = self
            .cqs
            .get_mut(&cqid)
            .ok_or(NvmeError::InvalidCompQueue(cqid))?;
        let sq = SubQueue::new(sqid, cqid, size, max, base, &self.mem)?;
        cq.add_sq(sqid)?;
        self.sqs.insert(sqid, sq);
        self.tracker.add_queue(sqid);
        // The admin tail may already have been rung by the time the queue
        // is built; I/O queues start from an empty ring.
        if sqid != ADMIN_QUEUE_ID {
            self.regs.reset_sq_tail(sqid);
        }
        Ok(())
    }

    /// Removes the [`CompQueue`] which corresponds to the given completion
    /// queue id (`cqid`).
    pub(crate) fn delete_cq(&mut self, cqid: QueueId) -> Result<(), NvmeError> {
        let cq = self.cqs.get(&cqid).ok_or(NvmeError::InvalidCompQueue(cqid))?;

        // Make sure this CQ has no more associated SQs
        let sqs = cq.associated_sqs();
        if sqs > 0 {
            return Err(NvmeError::AssociatedSubQueuesStillExist(cqid, sqs));
        }

        // Remove it from the authoritative list of CQs
        self.cqs.remove(&cqid);
        self.regs.set_cq_head(cqid, 0);
        Ok(())
    }

    /// Removes the [`SubQueue`] which corresponds to the given submission
    /// queue id (`sqid`), forgetting any commands in flight on it.
    pub(crate) fn delete_sq(&mut self, sqid: QueueId) -> Result<(), NvmeError> {
        let sq =
            self.sqs.remove(&sqid).ok_or(NvmeError::InvalidSubQueue(sqid))?;
        if let Some(cq) = self.cqs.get_mut(&sq.cqid()) {
            cq.remove_sq(sqid);
        }
        self.tracker.remove_queue(sqid);
        self.regs.reset_sq_tail(sqid);
        Ok(())
    }

    /// Drop every queue, admin pair included.
    fn teardown_queues(&mut self) {
        self.sqs.clear();
        self.cqs.clear();
        self.tracker.clear();
        self.regs.clear_cq_heads();
    }

    /// Performs a Controller Reset.
    ///
    /// All queues are deleted, with the admin pair rebuilt from AQA, ASQ
    /// and ACQ once the controller is enabled again. Namespaces return to
    /// their state at attach time and any staged firmware is dropped. The
    /// firmware slots and the running image survive.
    pub(crate) fn controller_reset(&mut self) {
        slog::info!(self.log, "controller reset";
            "sqs" => self.sqs.len(),
            "cqs" => self.cqs.len()
        );
        self.teardown_queues();
        self.reset_identify_controller();
        self.namespaces.reset();
        self.firmware.clear_staging();
        self.queues_granted = self.max_io_queues;
        self.write_cache = false;
        self.regs.set_ready(false);
        self.regs.set_fatal(false);
    }

    /// One pass of the doorbell watch loop.
    pub(crate) fn service(&mut self) {
        if self.regs.take_reset() {
            self.controller_reset();
        }

        if !self.regs.cc().enabled() {
            if !self.sqs.is_empty() || !self.cqs.is_empty() {
                self.teardown_queues();
            }
            self.regs.set_ready(false);
            return;
        }

        if !self.cqs.contains_key(&ADMIN_QUEUE_ID) {
            // A failed enable stays failed until the host resets us
            if self.regs.csts().cfs() {
                return;
            }
            match self.create_admin_queues() {
                Ok(()) => {
                    slog::info!(self.log, "admin queues created";
                        "asq" => self.regs.asq(),
                        "acq" => self.regs.acq(),
                        "aqa" => self.regs.aqa().0
                    );
                    self.regs.set_ready(true);
                }
                Err(err) => {
                    slog::error!(self.log, "failed to create admin queues";
                        "error" => %err
                    );
                    self.teardown_queues();
                    self.regs.set_fatal(true);
                    return;
                }
            }
        }

        let sqids: Vec<QueueId> = self.sqs.keys().copied().collect();
        for sqid in sqids {
            self.service_sq(sqid);
        }
    }

    /// Fetch everything newly rung up on `sqid` and run it to completion.
    fn service_sq(&mut self, sqid: QueueId) {
        let Some(tail) = self.regs.sq_tail(sqid) else {
            return;
        };
        let mem = self.mem.clone();
        let Some(sq) = self.sqs.get_mut(&sqid) else {
            return;
        };
        if let Err(err) = sq.notify_tail(tail) {
            slog::warn!(self.log, "bad submission queue doorbell";
                "sqid" => sqid,
                "tail" => tail,
                "error" => %err
            );
            return;
        }

        // Fetch the whole batch first: everything in it is in flight at
        // once, which is what command identifiers are unique across.
        let mut batch = Vec::with_capacity(sq.pending() as usize);
        while let Some(sqe) = sq.fetch_next(&mem) {
            batch.push(sqe);
        }
        let batch: Vec<_> = batch
            .into_iter()
            .map(|sqe| {
                let valid = self.is_valid_command_identifier(sqid, sqe.cid());
                (sqe, valid)
            })
            .collect();

        for (sqe, valid) in batch {
            if let Err(err) =
                self.process_command_and_post_completion(sqid, &sqe, valid)
            {
                slog::error!(self.log, "failed to complete command";
                    "sqid" => sqid,
                    "cid" => sqe.cid(),
                    "error" => %err
                );
            }
        }
    }

    /// Mark `cid` as in flight on `sqid`, returning false if another command
    /// with that identifier already is.
    pub(crate) fn is_valid_command_identifier(
        &mut self,
        sqid: QueueId,
        cid: u16,
    ) -> bool {
        self.tracker.track(sqid, cid)
    }

    /// Execute a fetched command and post its completion.
    ///
    /// A command whose identifier was already in flight (`valid` is false)
    /// is not executed; it completes with a Command Sequence Error.
    pub(crate) fn process_command_and_post_completion(
        &mut self,
        sqid: QueueId,
        sqe: &SubmissionQueueEntry,
        valid: bool,
    ) -> Result<(), NvmeError> {
        let comp = if valid {
            self.execute(sqid, sqe)
        } else {
            slog::warn!(self.log, "command identifier already in flight";
                "sqid" => sqid,
                "cid" => sqe.cid()
            );
            Completion::generic_err(STS_COMMAND_SEQ_ERR)
        };
        self.post_completion(sqid, sqe, comp, valid)
    }

    /// Run a command through the response file, then the dispatch tables.
    fn execute(
        &mut self,
        sqid: QueueId,
        sqe: &SubmissionQueueEntry,
    ) -> Completion {
        let mem = self.mem.clone();
        probes::nvme_raw_cmd!(|| (
            sqid,
            u64::from(sqe.cdw0) | (u64::from(sqe.nsid) << 32),
            sqe.prp1,
            u64::from(sqe.cdw10) | (u64::from(sqe.cdw11) << 32)
        ));
        if sqid == ADMIN_QUEUE_ID {
            probes::nvme_admin_cmd!(|| (sqe.opcode(), sqe.prp1, sqe.prp2));
        }

        if let Some(hook) = &self.hook {
            if let Some(comp) = hook.respond(sqid, sqe, &mem) {
                return comp;
            }
        }

        if let Err(err) = cmds::check_fuse(sqe) {
            return err.into();
        }

        let table = match sqid {
            ADMIN_QUEUE_ID => &*dispatch::ADMIN_COMMANDS,
            _ => &*dispatch::NVM_COMMANDS,
        };
        match table.get(&sqe.opcode()) {
            Some(handler) => handler(self, sqe, &mem),
            None => {
                slog::warn!(self.log, "unknown opcode";
                    "sqid" => sqid,
                    "opcode" => sqe.opcode()
                );
                Completion::generic_err(STS_INVAL_OPC)
            }
        }
    }

    /// Post the completion of `sqe` to the completion queue of `sqid`.
    ///
    /// Fills in the SQ ID, SQ head pointer and command identifier, then
    /// publishes the new tail through the CQ head doorbell.
    pub(crate) fn post_completion(
        &mut self,
        sqid: QueueId,
        sqe: &SubmissionQueueEntry,
        comp: Completion,
        tracked: bool,
    ) -> Result<(), NvmeError> {
        let cid = sqe.cid();
        let sq = self.sqs.get(&sqid).ok_or(NvmeError::InvalidSubQueue(sqid))?;
        let cqid = sq.cqid();

        let mut entry = CompletionQueueEntry::new(comp, cid);
        entry.sqid = sqid;
        entry.sqhd = sq.current_head();

        if !self.cqs.contains_key(&cqid) {
            return Err(NvmeError::InvalidCompQueue(cqid));
        }
        // A completion for a command not in flight is never posted
        if tracked {
            self.tracker.untrack(sqid, cid)?;
        }

        let cq = self
            .cqs
            .get_mut(&cqid)
            .ok_or(NvmeError::InvalidCompQueue(cqid))?;
        let tail = cq
            .post_entry(entry, &self.mem)
            .ok_or(NvmeError::MemoryInaccessible)?;
        probes::nvme_cmd_complete!(|| (sqid, cid, comp.status));

        // The host consumes entries as soon as they are visible, so the
        // head is published as the new tail.
        cq.publish_head(tail);
        self.regs.set_cq_head(cqid, tail);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::tracker::TrackerError;

    fn test_ctrl() -> NvmeCtrl {
        let cfg = CtrlConfig { mem_size: 1 << 20, ..Default::default() };
        let cap = Capabilities(0).with_mqes(0xff).with_css_nvm(true);
        let log = Logger::root(slog::Discard, slog::o!());
        let regs = Arc::new(RegisterBlock::new(
            cap,
            cfg.max_io_queues,
            log.clone(),
        ));
        let mem = Arc::new(HostMem::new(cfg.mem_size));
        NvmeCtrl::new(&cfg, regs, mem, log)
    }

    #[test]
    fn untracked_completion_not_posted() {
        let mut ctrl = test_ctrl();
        let acq = ctrl.mem.alloc(PAGE_SIZE).unwrap();
        let asq = ctrl.mem.alloc(PAGE_SIZE).unwrap();
        ctrl.create_cq(ADMIN_QUEUE_ID, acq, 4).unwrap();
        ctrl.create_sq(ADMIN_QUEUE_ID, ADMIN_QUEUE_ID, asq, 4).unwrap();

        let sqe = SubmissionQueueEntry::new(ADMIN_OPC_KEEP_ALIVE, 9);
        let res = ctrl.post_completion(
            ADMIN_QUEUE_ID,
            &sqe,
            Completion::success(),
            true,
        );
        assert!(matches!(
            res,
            Err(NvmeError::Tracker(TrackerError::NotInFlight {
                sqid: ADMIN_QUEUE_ID,
                cid: 9
            }))
        ));
        assert_eq!(ctrl.cqs[&ADMIN_QUEUE_ID].current_tail(), 0);
        assert_eq!(ctrl.regs().cq_head(ADMIN_QUEUE_ID), Some(0));

        // Once in flight, the same completion goes through
        assert!(ctrl.is_valid_command_identifier(ADMIN_QUEUE_ID, 9));
        ctrl.post_completion(
            ADMIN_QUEUE_ID,
            &sqe,
            Completion::success(),
            true,
        )
        .unwrap();
        assert_eq!(ctrl.cqs[&ADMIN_QUEUE_ID].current_tail(), 1);
        assert_eq!(ctrl.regs().cq_head(ADMIN_QUEUE_ID), Some(1));
        assert!(!ctrl.tracker.is_tracked(ADMIN_QUEUE_ID, 9));
    }
}
