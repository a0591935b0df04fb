// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller register state shared between the host and the controller.
//!
//! Every register is an atomic so the host may poke at it from any thread
//! without tearing. Writes which the controller needs to react to (CC, the
//! doorbells) invoke a notify hook which wakes the doorbell worker.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::bits::*;
use crate::common::*;
use crate::queue::QueueId;
use crate::NvmeError;

use byteorder::{ByteOrder, LE};
use lazy_static::lazy_static;
use slog::Logger;

#[usdt::provider(provider = "nvme_emu")]
mod probes {
    fn nvme_doorbell(off: u64, qid: u16, is_cq: u8, val: u16) {}
    fn nvme_reg_write(off: u64, val: u64) {}
}

/// Hook invoked after a host write the controller must observe.
pub type NotifyFn = dyn Fn() + Send + Sync + 'static;

/// Offset of the first doorbell register.
pub const DOORBELL_BASE: usize = 0x1000;

/// NVMe Controller Registers
///
/// See NVMe 1.0e Section 3.1 Register Definition
#[derive(Copy, Clone, Eq, PartialEq, Debug, strum::IntoStaticStr)]
pub enum CtrlrReg {
    Reserved,
    /// Controller Capabilities (CAP)
    CtrlrCaps,
    /// Version (VS)
    Version,
    /// Interrupt Mask Set (INTMS)
    IntrMaskSet,
    /// Interrupt Mask Clear (INTMC)
    IntrMaskClear,
    /// Controller Configuration (CC)
    CtrlrCfg,
    /// Controller Status (CSTS)
    CtrlrStatus,
    /// Admin Queue Attributes (AQA)
    AdminQueueAttr,
    /// Admin Submission Queue Base Address (ASQ)
    AdminSubQAddr,
    /// Admin Completion Queue Base Address (ACQ)
    AdminCompQAddr,
    /// Submission Queue y Tail Doorbell
    SubQTailDoorbell(QueueId),
    /// Completion Queue y Head Doorbell
    CompQHeadDoorbell(QueueId),
}

lazy_static! {
    /// Offsets and sizes of the registers below the doorbells.
    static ref CONTROLLER_REGS: Vec<(CtrlrReg, usize, usize)> = {
        let layout = [
            (CtrlrReg::CtrlrCaps, 8),
            (CtrlrReg::Version, 4),
            (CtrlrReg::IntrMaskSet, 4),
            (CtrlrReg::IntrMaskClear, 4),
            (CtrlrReg::CtrlrCfg, 4),
            (CtrlrReg::Reserved, 4),
            (CtrlrReg::CtrlrStatus, 4),
            (CtrlrReg::Reserved, 4),
            (CtrlrReg::AdminQueueAttr, 4),
            (CtrlrReg::AdminSubQAddr, 8),
            (CtrlrReg::AdminCompQAddr, 8),
        ];
        let mut off = 0;
        let regs = layout
            .iter()
            .map(|&(id, sz)| {
                let ent = (id, off, sz);
                off += sz;
                ent
            })
            .collect();
        assert!(off <= DOORBELL_BASE);
        regs
    };
}

/// Submission Queue y Tail and Completion Queue y Head doorbells.
///
/// CAP.DSTRD is 0, so they sit 4 bytes apart.
#[derive(Debug, Default)]
struct DoorbellPair {
    sq_tail: AtomicU32,
    cq_head: AtomicU32,
}

/// The controller's register file.
pub struct RegisterBlock {
    cap: Capabilities,
    cc: AtomicU32,
    csts: AtomicU32,
    aqa: AtomicU32,
    asq: AtomicU64,
    acq: AtomicU64,
    intms: AtomicU32,

    /// Indexed by queue ID; entry 0 is the admin pair.
    doorbells: Box<[DoorbellPair]>,

    /// Set on every CC.EN transition, consumed by the worker.
    reset_pending: AtomicBool,

    notify: Mutex<Option<Box<NotifyFn>>>,

    log: Logger,
}

impl RegisterBlock {
    /// Create a register block with doorbells for the admin queue pair and
    /// `max_io_queues` I/O queue pairs.
    pub fn new(cap: Capabilities, max_io_queues: u16, log: Logger) -> Self {
        let doorbells =
            (0..=max_io_queues as usize).map(|_| Default::default()).collect();
        Self {
            cap,
            cc: AtomicU32::new(0),
            csts: AtomicU32::new(0),
            aqa: AtomicU32::new(0),
            asq: AtomicU64::new(0),
            acq: AtomicU64::new(0),
            intms: AtomicU32::new(0),
            doorbells,
            reset_pending: AtomicBool::new(false),
            notify: Mutex::new(None),
            log,
        }
    }

    /// Install the hook run after host writes that need servicing.
    pub(crate) fn set_notify(&self, f: Option<Box<NotifyFn>>) {
        *self.notify.lock().unwrap() = f;
    }

    fn kick(&self) {
        if let Some(f) = self.notify.lock().unwrap().as_ref() {
            f();
        }
    }

    pub fn cap(&self) -> Capabilities {
        self.cap
    }

    pub fn version(&self) -> u32 {
        NVME_VER_1_2
    }

    pub fn cc(&self) -> Configuration {
        Configuration(self.cc.load(Ordering::Acquire))
    }

    /// Service a write to the Controller Configuration from the host.
    ///
    /// An EN transition in either direction schedules a controller reset,
    /// carried out by the worker on its next pass.
    pub fn set_cc(&self, new: Configuration) {
        let cur = Configuration(self.cc.swap(new.0, Ordering::AcqRel));
        if new.enabled() != cur.enabled() {
            if new.enabled() {
                slog::info!(self.log, "Enabling controller");
            } else {
                slog::info!(self.log, "Disabling controller");
            }
            self.clear_doorbells();
            self.reset_pending.store(true, Ordering::Release);
        }

        let shutdown = new.shn() != ShutdownNotification::None;
        self.update_csts(|csts| {
            if shutdown && csts.shst() == ShutdownStatus::Normal {
                // Execution is instantaneous, so there is nothing to drain
                csts.with_shst(ShutdownStatus::Complete)
            } else if !shutdown && csts.shst() != ShutdownStatus::Normal {
                csts.with_shst(ShutdownStatus::Normal)
            } else {
                csts
            }
        });

        self.kick();
    }

    pub fn csts(&self) -> Status {
        Status(self.csts.load(Ordering::Acquire))
    }

    fn update_csts(&self, f: impl Fn(Status) -> Status) {
        // The closure is pure, so a failed exchange simply retries
        let _ = self.csts.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |raw| Some(f(Status(raw)).0),
        );
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.update_csts(|csts| csts.with_ready(ready));
    }

    pub(crate) fn set_fatal(&self, cfs: bool) {
        self.update_csts(|csts| csts.with_cfs(cfs));
    }

    pub fn aqa(&self) -> AdminQueueAttrs {
        AdminQueueAttrs(self.aqa.load(Ordering::Acquire))
    }

    /// AQA, ASQ and ACQ may only be changed while the controller is
    /// disabled; writes while enabled are dropped.
    pub fn set_aqa(&self, aqa: AdminQueueAttrs) {
        if !self.cc().enabled() {
            self.aqa.store(aqa.0, Ordering::Release);
        }
    }

    pub fn asq(&self) -> u64 {
        self.asq.load(Ordering::Acquire)
    }

    pub fn set_asq(&self, base: u64) {
        if !self.cc().enabled() {
            self.asq.store(base & PAGE_MASK as u64, Ordering::Release);
        }
    }

    pub fn acq(&self) -> u64 {
        self.acq.load(Ordering::Acquire)
    }

    pub fn set_acq(&self, base: u64) {
        if !self.cc().enabled() {
            self.acq.store(base & PAGE_MASK as u64, Ordering::Release);
        }
    }

    fn doorbell(&self, qid: QueueId) -> Result<&DoorbellPair, NvmeError> {
        self.doorbells
            .get(qid as usize)
            .ok_or(NvmeError::InvalidDoorbell(qid))
    }

    /// Ring the Submission Queue `qid` Tail Doorbell.
    pub fn ring_sq_tail(
        &self,
        qid: QueueId,
        tail: u16,
    ) -> Result<(), NvmeError> {
        let db = self.doorbell(qid)?;
        probes::nvme_doorbell!(|| (
            Self::doorbell_offset(qid, false) as u64,
            qid,
            0u8,
            tail
        ));
        db.sq_tail.store(tail as u32, Ordering::Release);
        self.kick();
        Ok(())
    }

    /// Current value of the Submission Queue `qid` Tail Doorbell.
    pub fn sq_tail(&self, qid: QueueId) -> Option<u16> {
        let db = self.doorbells.get(qid as usize)?;
        Some(db.sq_tail.load(Ordering::Acquire) as u16)
    }

    /// Current value of the Completion Queue `qid` Head Doorbell.
    pub fn cq_head(&self, qid: QueueId) -> Option<u16> {
        let db = self.doorbells.get(qid as usize)?;
        Some(db.cq_head.load(Ordering::Acquire) as u16)
    }

    /// Publish a new Completion Queue position to the host.
    pub(crate) fn set_cq_head(&self, qid: QueueId, head: u16) {
        if let Some(db) = self.doorbells.get(qid as usize) {
            probes::nvme_doorbell!(|| (
                Self::doorbell_offset(qid, true) as u64,
                qid,
                1u8,
                head
            ));
            db.cq_head.store(head as u32, Ordering::Release);
        }
    }

    /// Zero every doorbell, as on controller reset.
    fn clear_doorbells(&self) {
        for db in self.doorbells.iter() {
            db.sq_tail.store(0, Ordering::Release);
            db.cq_head.store(0, Ordering::Release);
        }
    }

    /// Zero the Submission Queue `qid` Tail Doorbell, as on queue creation
    /// or deletion.
    pub(crate) fn reset_sq_tail(&self, qid: QueueId) {
        if let Some(db) = self.doorbells.get(qid as usize) {
            db.sq_tail.store(0, Ordering::Release);
        }
    }

    /// Zero every CQ head doorbell, as when all queues are torn down.
    pub(crate) fn clear_cq_heads(&self) {
        for db in self.doorbells.iter() {
            db.cq_head.store(0, Ordering::Release);
        }
    }

    /// Consume a pending EN transition, if there is one.
    pub(crate) fn take_reset(&self) -> bool {
        self.reset_pending.swap(false, Ordering::AcqRel)
    }

    /// Number of queue pairs (admin included) with doorbells.
    pub fn queue_pairs(&self) -> usize {
        self.doorbells.len()
    }

    fn doorbell_offset(qid: QueueId, is_cq: bool) -> usize {
        // SQ y Tail Doorbell = 0x1000 + (2y * (4 << CAP.DSTRD))
        // CQ y Head Doorbell = 0x1000 + ((2y + 1) * (4 << CAP.DSTRD))
        DOORBELL_BASE + (2 * qid as usize + is_cq as usize) * 4
    }

    /// Identify the register at `offset`, returning it with its own offset
    /// and size.
    pub fn lookup(&self, offset: usize) -> Option<(CtrlrReg, usize, usize)> {
        if offset >= DOORBELL_BASE {
            let idx = (offset - DOORBELL_BASE) / 4;
            let qid = QueueId::try_from(idx / 2).ok()?;
            if qid as usize >= self.doorbells.len() {
                return None;
            }
            let id = match idx & 1 {
                0 => CtrlrReg::SubQTailDoorbell(qid),
                _ => CtrlrReg::CompQHeadDoorbell(qid),
            };
            return Some((id, DOORBELL_BASE + idx * 4, 4));
        }
        match CONTROLLER_REGS
            .iter()
            .find(|(_, off, sz)| (*off..off + sz).contains(&offset))
        {
            Some(&ent) => Some(ent),
            None => Some((CtrlrReg::Reserved, offset & !0b11, 4)),
        }
    }

    fn read_reg(&self, id: CtrlrReg) -> u64 {
        match id {
            CtrlrReg::CtrlrCaps => self.cap.0,
            CtrlrReg::Version => self.version() as u64,
            CtrlrReg::IntrMaskSet | CtrlrReg::IntrMaskClear => {
                self.intms.load(Ordering::Acquire) as u64
            }
            CtrlrReg::CtrlrCfg => self.cc().0 as u64,
            CtrlrReg::CtrlrStatus => self.csts().0 as u64,
            CtrlrReg::AdminQueueAttr => self.aqa().0 as u64,
            CtrlrReg::AdminSubQAddr => self.asq(),
            CtrlrReg::AdminCompQAddr => self.acq(),
            CtrlrReg::SubQTailDoorbell(qid) => {
                self.sq_tail(qid).unwrap_or(0) as u64
            }
            CtrlrReg::CompQHeadDoorbell(qid) => {
                self.cq_head(qid).unwrap_or(0) as u64
            }
            CtrlrReg::Reserved => 0,
        }
    }

    fn write_reg(&self, id: CtrlrReg, val: u64) -> Result<(), NvmeError> {
        match id {
            CtrlrReg::CtrlrCaps
            | CtrlrReg::Version
            | CtrlrReg::CtrlrStatus
            | CtrlrReg::Reserved => {
                // Read-only registers
            }
            CtrlrReg::IntrMaskSet => {
                self.intms.fetch_or(val as u32, Ordering::AcqRel);
            }
            CtrlrReg::IntrMaskClear => {
                self.intms.fetch_and(!(val as u32), Ordering::AcqRel);
            }
            CtrlrReg::CtrlrCfg => self.set_cc(Configuration(val as u32)),
            CtrlrReg::AdminQueueAttr => {
                self.set_aqa(AdminQueueAttrs(val as u32))
            }
            CtrlrReg::AdminSubQAddr => self.set_asq(val),
            CtrlrReg::AdminCompQAddr => self.set_acq(val),
            CtrlrReg::SubQTailDoorbell(qid) => {
                // 32-bit register but ignore reserved top 16-bits
                self.ring_sq_tail(qid, val as u16)?;
            }
            CtrlrReg::CompQHeadDoorbell(_) => {
                // The controller owns CQ head positions in this model
            }
        }
        Ok(())
    }

    /// Read `buf.len()` bytes of register space at `offset`.
    ///
    /// Accesses must be 4 or 8 bytes wide and fall within one register.
    pub fn reg_read(
        &self,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), NvmeError> {
        let res = self.check_access(offset, buf.len()).map(|(id, base, _)| {
            let mut raw = [0u8; 8];
            LE::write_u64(&mut raw, self.read_reg(id));
            let start = offset - base;
            buf.copy_from_slice(&raw[start..start + buf.len()]);
        });
        if let Err(err) = &res {
            self.log_failure(offset, err);
        }
        res
    }

    /// Write `buf` into register space at `offset`.
    ///
    /// A 4 byte write to half of an 8 byte register leaves the other half
    /// unchanged.
    pub fn reg_write(
        &self,
        offset: usize,
        buf: &[u8],
    ) -> Result<(), NvmeError> {
        let res = self.check_access(offset, buf.len()).and_then(
            |(id, base, _)| {
                let mut raw = [0u8; 8];
                LE::write_u64(&mut raw, self.read_reg(id));
                let start = offset - base;
                raw[start..start + buf.len()].copy_from_slice(buf);
                let val = LE::read_u64(&raw);
                probes::nvme_reg_write!(|| (offset as u64, val));
                self.write_reg(id, val)
            },
        );
        if let Err(err) = &res {
            self.log_failure(offset, err);
        }
        res
    }

    fn log_failure(&self, offset: usize, err: &NvmeError) {
        let reg = self.lookup(offset).map(|(id, _, _)| id);
        slog::error!(self.log, "nvme reg r/w failure";
            "offset" => offset,
            "register" => ?reg,
            "error" => %err
        );
    }

    fn check_access(
        &self,
        offset: usize,
        len: usize,
    ) -> Result<(CtrlrReg, usize, usize), NvmeError> {
        let bad = NvmeError::InvalidRegisterAccess { offset, len };
        if !matches!(len, 4 | 8) || offset % 4 != 0 {
            return Err(bad);
        }
        let (id, base, sz) = self.lookup(offset).ok_or(bad)?;
        if offset + len > base + sz {
            return Err(NvmeError::InvalidRegisterAccess { offset, len });
        }
        Ok((id, base, sz))
    }
}

impl std::fmt::Debug for RegisterBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterBlock")
            .field("cc", &self.cc())
            .field("csts", &self.csts())
            .field("aqa", &self.aqa())
            .field("asq", &self.asq())
            .field("acq", &self.acq())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn regs() -> RegisterBlock {
        let cap = Capabilities(0).with_mqes(1023).with_css_nvm(true);
        RegisterBlock::new(cap, 4, Logger::root(slog::Discard, slog::o!()))
    }

    #[test]
    fn layout() {
        let regs = regs();
        assert_eq!(regs.lookup(0x00), Some((CtrlrReg::CtrlrCaps, 0x00, 8)));
        assert_eq!(regs.lookup(0x04), Some((CtrlrReg::CtrlrCaps, 0x00, 8)));
        assert_eq!(regs.lookup(0x08), Some((CtrlrReg::Version, 0x08, 4)));
        assert_eq!(regs.lookup(0x14), Some((CtrlrReg::CtrlrCfg, 0x14, 4)));
        assert_eq!(regs.lookup(0x1c), Some((CtrlrReg::CtrlrStatus, 0x1c, 4)));
        assert_eq!(
            regs.lookup(0x24),
            Some((CtrlrReg::AdminQueueAttr, 0x24, 4))
        );
        assert_eq!(
            regs.lookup(0x28),
            Some((CtrlrReg::AdminSubQAddr, 0x28, 8))
        );
        assert_eq!(
            regs.lookup(0x30),
            Some((CtrlrReg::AdminCompQAddr, 0x30, 8))
        );
        assert_eq!(regs.lookup(0x40), Some((CtrlrReg::Reserved, 0x40, 4)));
        assert_eq!(
            regs.lookup(0x1000),
            Some((CtrlrReg::SubQTailDoorbell(0), 0x1000, 4))
        );
        assert_eq!(
            regs.lookup(0x1004),
            Some((CtrlrReg::CompQHeadDoorbell(0), 0x1004, 4))
        );
        assert_eq!(
            regs.lookup(0x1000 + 8 * 4),
            Some((CtrlrReg::SubQTailDoorbell(4), 0x1020, 4))
        );
        // Only 4 I/O queue pairs were configured
        assert_eq!(regs.lookup(0x1000 + 8 * 5), None);
    }

    #[test]
    fn mmio_access() {
        let regs = regs();
        let mut buf = [0u8; 8];
        regs.reg_read(0x00, &mut buf).unwrap();
        assert_eq!(LE::read_u64(&buf), regs.cap().0);

        let mut vs = [0u8; 4];
        regs.reg_read(0x08, &mut vs).unwrap();
        assert_eq!(LE::read_u32(&vs), NVME_VER_1_2);

        // Split 32-bit writes to ASQ
        regs.reg_write(0x28, &0x0000_2000u32.to_le_bytes()).unwrap();
        regs.reg_write(0x2c, &0x1u32.to_le_bytes()).unwrap();
        assert_eq!(regs.asq(), 0x1_0000_2000);

        // CAP is read-only
        regs.reg_write(0x00, &[0xff; 8]).unwrap();
        assert_eq!(regs.cap().mqes(), 1023);

        // Odd sizes and straddling accesses are refused
        assert!(regs.reg_write(0x14, &[1, 0]).is_err());
        assert!(regs.reg_read(0x10, &mut buf).is_err());
        assert!(regs.reg_write(0x1000 + 8 * 5, &[0; 4]).is_err());
    }

    #[test]
    fn admin_regs_locked_while_enabled() {
        let regs = regs();
        regs.set_aqa(AdminQueueAttrs(0).with_asqs(1).with_acqs(1));
        regs.set_asq(0x2000);
        regs.set_cc(Configuration(0).with_enabled(true));
        regs.set_aqa(AdminQueueAttrs(0));
        regs.set_asq(0x8000);
        assert_eq!(regs.aqa().asqs(), 1);
        assert_eq!(regs.asq(), 0x2000);
    }

    #[test]
    fn enable_transitions_flag_reset() {
        let regs = regs();
        let kicks = Arc::new(AtomicUsize::new(0));
        let counter = kicks.clone();
        regs.set_notify(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(!regs.take_reset());
        regs.set_cc(Configuration(0).with_enabled(true));
        assert!(regs.take_reset());
        assert!(!regs.take_reset());

        // Rewriting the same EN value is not a transition
        regs.set_cc(Configuration(0).with_enabled(true).with_iosqes(6));
        assert!(!regs.take_reset());
        regs.set_cc(Configuration(0));
        assert!(regs.take_reset());

        regs.ring_sq_tail(0, 1).unwrap();
        assert_eq!(kicks.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn shutdown_notification() {
        let regs = regs();
        regs.set_cc(
            Configuration(0)
                .with_enabled(true)
                .with_shn(ShutdownNotification::Normal),
        );
        assert_eq!(regs.csts().shst(), ShutdownStatus::Complete);
        regs.set_cc(Configuration(0).with_enabled(true));
        assert_eq!(regs.csts().shst(), ShutdownStatus::Normal);
    }

    #[test]
    fn doorbells() {
        let regs = regs();
        regs.ring_sq_tail(2, 7).unwrap();
        assert_eq!(regs.sq_tail(2), Some(7));
        assert!(matches!(
            regs.ring_sq_tail(9, 1),
            Err(NvmeError::InvalidDoorbell(9))
        ));

        regs.set_cq_head(2, 3);
        let mut buf = [0u8; 4];
        regs.reg_read(0x1000 + 8 * 2 + 4, &mut buf).unwrap();
        assert_eq!(LE::read_u32(&buf), 3);

        // Host writes to CQ head doorbells are ignored
        regs.reg_write(0x1000 + 8 * 2 + 4, &9u32.to_le_bytes()).unwrap();
        assert_eq!(regs.cq_head(2), Some(3));

        regs.clear_cq_heads();
        assert_eq!(regs.sq_tail(2), Some(7));
        assert_eq!(regs.cq_head(2), Some(0));

        regs.reset_sq_tail(2);
        assert_eq!(regs.sq_tail(2), Some(0));

        // Any EN transition starts every queue afresh
        regs.ring_sq_tail(1, 4).unwrap();
        regs.set_cc(Configuration(0).with_enabled(true));
        assert_eq!(regs.sq_tail(1), Some(0));
    }
}
