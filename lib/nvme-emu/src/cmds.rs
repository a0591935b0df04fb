// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::bits::{self, StatusCodeType, SubmissionQueueEntry};
use crate::common::*;
use crate::mem::HostMem;
use crate::queue::{QueueCreateErr, QueueId};

use thiserror::Error;

/// Errors that may be encounted during command parsing.
#[derive(Debug, Error)]
pub enum ParseErr {
    /// Encounted a fused operation which we don't currently support.
    #[error("Fused ops not supported")]
    Fused,

    /// An invalid value was specified in the FUSE bits of `CDW0`.
    #[error("reserved FUSE value specified")]
    ReservedFuse,

    /// A PRP entry was not dword aligned.
    #[error("misaligned PRP entry {0:#x}")]
    MisalignedPrp(u64),
}

/// Reject fused operations, which this controller does not implement.
pub fn check_fuse(sqe: &SubmissionQueueEntry) -> Result<(), ParseErr> {
    match sqe.fuse() {
        0b00 => Ok(()),               // Normal (non-fused) operation
        0b01 => Err(ParseErr::Fused), // First fused op
        0b10 => Err(ParseErr::Fused), // Second fused op
        _ => Err(ParseErr::ReservedFuse),
    }
}

/// Both data pointers of an entry, checked for the required alignment.
fn prps(sqe: &SubmissionQueueEntry) -> Result<(u64, u64), ParseErr> {
    let (prp1, prp2) = (sqe.prp1, sqe.prp2);
    if prp1 & 0b11 != 0 {
        return Err(ParseErr::MisalignedPrp(prp1));
    }
    if prp2 & 0b11 != 0 {
        return Err(ParseErr::MisalignedPrp(prp2));
    }
    Ok((prp1, prp2))
}

/// Create I/O Completion Queue Command Parameters
#[derive(Debug)]
pub struct CreateIOCQCmd {
    /// PRP Entry 1 (PRP1)
    ///
    /// Base address of the physically contiguous Completion Queue.
    pub prp: u64,

    /// Queue Size (QSIZE)
    ///
    /// NOTE: This has already been converted from a 0's based value.
    pub qsize: u32,

    /// Queue Identifier (QID)
    pub qid: QueueId,

    /// Interrupt Vector (IV)
    pub intr_vector: u16,

    /// Interrupts Enabled (IEN)
    pub intr_enable: bool,

    /// Physically Contiguous (PC)
    pub phys_contig: bool,
}

impl CreateIOCQCmd {
    pub fn parse(sqe: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        Ok(Self {
            prp: sqe.prp1,
            qsize: (sqe.cdw10 >> 16) + 1, // Convert from 0's based
            qid: sqe.cdw10 as u16,
            intr_vector: (sqe.cdw11 >> 16) as u16,
            intr_enable: (sqe.cdw11 & 0b10) != 0,
            phys_contig: (sqe.cdw11 & 0b1) != 0,
        })
    }
}

/// Create I/O Submission Queue Command Parameters
#[derive(Debug)]
pub struct CreateIOSQCmd {
    /// PRP Entry 1 (PRP1)
    ///
    /// Base address of the physically contiguous Submission Queue.
    pub prp: u64,

    /// Queue Size (QSIZE)
    ///
    /// NOTE: This has already been converted from a 0's based value.
    pub qsize: u32,

    /// Queue Identifier (QID)
    pub qid: QueueId,

    /// Completion Queue Identifier (CQID)
    ///
    /// The ID of the corresponding Completion Queue for this Submission Queue.
    pub cqid: QueueId,

    /// Queue Priority (QPRIO)
    ///
    /// Only meaningful under weighted round robin arbitration, which is not
    /// offered, so it is recorded and otherwise ignored.
    pub queue_prio: QueuePriority,

    /// Physically Contiguous (PC)
    pub phys_contig: bool,
}

impl CreateIOSQCmd {
    pub fn parse(sqe: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        let queue_prio = match (sqe.cdw11 & 0b110) >> 1 {
            0b00 => QueuePriority::Urgent,
            0b01 => QueuePriority::High,
            0b10 => QueuePriority::Medium,
            0b11 => QueuePriority::Low,
            _ => unreachable!(),
        };
        Ok(Self {
            prp: sqe.prp1,
            qsize: (sqe.cdw10 >> 16) + 1, // Convert from 0's based
            qid: sqe.cdw10 as u16,
            cqid: (sqe.cdw11 >> 16) as u16,
            queue_prio,
            phys_contig: (sqe.cdw11 & 1) != 0,
        })
    }
}

/// Priority Levels
#[derive(Debug)]
pub enum QueuePriority {
    Urgent,
    High,
    Medium,
    Low,
}

/// Queue Identifier of a Delete I/O Completion/Submission Queue command.
pub fn parse_delete_qid(sqe: &SubmissionQueueEntry) -> QueueId {
    sqe.cdw10 as u16
}

/// Get Log Page Command Parameters
#[derive(Debug)]
pub struct GetLogPageCmd {
    /// Namespace Identifier (NSID)
    pub nsid: u32,

    /// The number of bytes to return.
    pub len: u32,

    /// Log Page Identifier (LID)
    pub log_page_ident: LogPageIdent,

    prp1: u64,
    prp2: u64,
}

impl GetLogPageCmd {
    pub fn parse(sqe: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        let (prp1, prp2) = prps(sqe)?;
        // NUMDL in CDW10 31:16, NUMDU in CDW11 15:0
        let numd = (sqe.cdw11 & 0xffff) << 16 | sqe.cdw10 >> 16;
        Ok(Self {
            nsid: sqe.nsid,
            // Convert from 0's based dword count
            len: numd.saturating_add(1).saturating_mul(4),
            log_page_ident: LogPageIdent::from(sqe.cdw10 as u8),
            prp1,
            prp2,
        })
    }

    /// Returns an Iterator that yields [`HostRegion`]'s to write the log
    /// page data to.
    pub fn data<'a>(&self, mem: &'a HostMem) -> PrpIter<'a> {
        PrpIter::new(self.len as u64, self.prp1, self.prp2, mem)
    }
}

/// The type of Log pages that may be retrieved with the Get Log Page command.
///
/// See NVMe 1.0e Section 5.10.1, Figure 58 Get Log Page - Log Page Identifiers
#[derive(Debug, PartialEq, Eq)]
pub enum LogPageIdent {
    Reserved(u8),
    /// Error Information Log Page
    Error,
    /// SMART / Health Information Log Page
    Smart,
    /// Firmware Slot Information Log Page
    Firmware,
    /// I/O Command Set Specific Log Page
    IOSpecific(u8),
    /// Vendor Specific Log Page
    Vendor(u8),
}

impl From<u8> for LogPageIdent {
    fn from(ident: u8) -> Self {
        match ident {
            bits::LOG_ID_ERROR => LogPageIdent::Error,
            bits::LOG_ID_SMART => LogPageIdent::Smart,
            bits::LOG_ID_FIRMWARE_SLOT => LogPageIdent::Firmware,
            0x80..=0xBF => LogPageIdent::IOSpecific(ident),
            0xC0..=0xFF => LogPageIdent::Vendor(ident),
            _ => LogPageIdent::Reserved(ident),
        }
    }
}

/// Identify Command Parameters
#[derive(Debug)]
pub struct IdentifyCmd {
    /// Controller or Namespace Structure (CNS)
    pub cns: u8,

    /// Namespace Identifier (NSID)
    pub nsid: u32,

    prp1: u64,
    prp2: u64,
}

impl IdentifyCmd {
    pub fn parse(sqe: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        let (prp1, prp2) = prps(sqe)?;
        Ok(Self { cns: sqe.cdw10 as u8, nsid: sqe.nsid, prp1, prp2 })
    }

    /// Returns an Iterator that yields [`HostRegion`]'s to write the
    /// identify structure data to.
    pub fn data<'a>(&self, mem: &'a HostMem) -> PrpIter<'a> {
        PrpIter::new(PAGE_SIZE as u64, self.prp1, self.prp2, mem)
    }
}

/// Abort Command Parameters
#[derive(Debug)]
pub struct AbortCmd {
    /// Submission Queue Identifier (SQID)
    pub sqid: QueueId,
    /// Command Identifier (CID) of the command to abort
    pub cid: u16,
}

impl AbortCmd {
    pub fn parse(sqe: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        Ok(Self { sqid: sqe.cdw10 as u16, cid: (sqe.cdw10 >> 16) as u16 })
    }
}

/// Set Features Command Parameters
#[derive(Debug)]
pub struct SetFeaturesCmd {
    /// Feature Identifier (FID)
    pub fid: FeatureIdent,
}

impl SetFeaturesCmd {
    pub fn parse(sqe: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        Ok(Self { fid: FeatureIdent::from((sqe.cdw10 as u8, sqe.cdw11)) })
    }
}

/// Get Features Command Parameters
#[derive(Debug)]
pub struct GetFeaturesCmd {
    /// Feature Identifier (FID)
    pub fid: u8,
}

impl GetFeaturesCmd {
    pub fn parse(sqe: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        Ok(Self { fid: sqe.cdw10 as u8 })
    }
}

/// Feature Identifiers
///
/// Only the features the controller implements carry their parameters.
#[derive(Debug)]
pub enum FeatureIdent {
    /// Volatile Write Cache
    VolatileWriteCache {
        /// Volatile Write Cache Enable (WCE)
        wce: bool,
    },
    /// Number of Queues
    NumberOfQueues {
        /// Number of I/O Completion Queues Requested (NCQR)
        ncqr: u32,
        /// Number of I/O Submission Queues Requested (NSQR)
        nsqr: u32,
    },
    /// Any other feature, by identifier.
    Other(u8),
}

impl From<(u8, u32)> for FeatureIdent {
    fn from((id, cdw11): (u8, u32)) -> Self {
        match id {
            bits::FEAT_ID_VOLATILE_WRITE_CACHE => {
                FeatureIdent::VolatileWriteCache { wce: cdw11 & 1 != 0 }
            }
            bits::FEAT_ID_NUM_QUEUES => FeatureIdent::NumberOfQueues {
                // Convert from 0's based values
                ncqr: (cdw11 >> 16) + 1,
                nsqr: (cdw11 & 0xffff) + 1,
            },
            _ => FeatureIdent::Other(id),
        }
    }
}

/// Firmware Image Download Command Parameters
#[derive(Debug)]
pub struct FwImageDownloadCmd {
    /// Number of Dwords (NUMD), already converted from a 0's based value.
    pub numd: u32,

    /// Offset (OFST) into the image, in dwords.
    pub ofst: u32,

    prp1: u64,
    prp2: u64,
}

impl FwImageDownloadCmd {
    pub fn parse(sqe: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        let (prp1, prp2) = prps(sqe)?;
        Ok(Self {
            numd: sqe.cdw10.saturating_add(1),
            ofst: sqe.cdw11,
            prp1,
            prp2,
        })
    }

    /// Size of the transferred chunk, in bytes.
    pub fn len(&self) -> u64 {
        self.numd as u64 * 4
    }

    /// Returns an Iterator that yields [`HostRegion`]'s holding the image
    /// chunk.
    pub fn data<'a>(&self, mem: &'a HostMem) -> PrpIter<'a> {
        PrpIter::new(self.len(), self.prp1, self.prp2, mem)
    }
}

/// Firmware Commit Command Parameters
#[derive(Debug)]
pub struct FwCommitCmd {
    /// Firmware Slot (FS). 0 lets the controller choose.
    pub fs: u8,
    /// Commit Action (CA)
    pub ca: u8,
}

impl FwCommitCmd {
    pub fn parse(sqe: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        Ok(Self {
            fs: (sqe.cdw10 & 0b111) as u8,
            ca: ((sqe.cdw10 >> 3) & 0b111) as u8,
        })
    }
}

/// Format NVM Command Parameters
#[derive(Debug)]
pub struct FormatNvmCmd {
    pub nsid: u32,
    /// LBA Format (LBAF) index to format with.
    pub lbaf: u8,
    /// Secure Erase Settings (SES)
    pub ses: u8,
}

impl FormatNvmCmd {
    pub fn parse(sqe: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        Ok(Self {
            nsid: sqe.nsid,
            lbaf: (sqe.cdw10 & 0xf) as u8,
            ses: ((sqe.cdw10 >> 9) & 0b111) as u8,
        })
    }
}

/// Read or Write Command Parameters
///
/// Both commands share a layout: SLBA in CDW10/11 and NLB in CDW12.
#[derive(Debug)]
pub struct RwCmd {
    pub nsid: u32,

    /// Starting LBA (SLBA)
    pub slba: u64,

    /// Number of Logical Blocks (NLB), already converted from 0's based.
    pub nlb: u32,

    prp1: u64,
    prp2: u64,
}

impl RwCmd {
    pub fn parse(sqe: &SubmissionQueueEntry) -> Result<Self, ParseErr> {
        let (prp1, prp2) = prps(sqe)?;
        Ok(Self {
            nsid: sqe.nsid,
            slba: (sqe.cdw11 as u64) << 32 | sqe.cdw10 as u64,
            // Convert from 0's based value
            nlb: (sqe.cdw12 & 0xffff) + 1,
            prp1,
            prp2,
        })
    }

    /// Returns an Iterator over the host buffer of `sz` bytes.
    pub fn data<'a>(&self, sz: u64, mem: &'a HostMem) -> PrpIter<'a> {
        PrpIter::new(sz, self.prp1, self.prp2, mem)
    }
}

/// Indicates the possible states of a [`PrpIter`].
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum PrpNext {
    Prp1,
    Prp2,
    List(u64, u16),
    Done,
}

/// The last valid PRP list entry index in a single Physical Region Page (PRP)
/// List, given 512 64-bit entries in a 4k page.
///
/// See NVMe 1.0e Section 4.3 Physical Region Page Entry and List
const PRP_LIST_MAX: u16 = 511;

/// A helper object for iterating over a single, 2 or a list of PRPs.
pub struct PrpIter<'a> {
    prp1: u64,
    prp2: u64,
    mem: &'a HostMem,

    /// How many bytes remaining to be read/written
    remain: u64,

    next: PrpNext,

    /// Any error we might've encountered
    error: Option<&'static str>,
}

impl<'a> PrpIter<'a> {
    pub fn new(size: u64, prp1: u64, prp2: u64, mem: &'a HostMem) -> Self {
        Self { prp1, prp2, mem, remain: size, next: PrpNext::Prp1, error: None }
    }

    /// The error which terminated iteration early, if any.
    pub fn error(&self) -> Option<&'static str> {
        self.error
    }

    /// Copy `data` out to the host buffer described by the PRPs.
    ///
    /// Fails if the PRPs do not describe at least `data.len()` bytes of
    /// valid host memory.
    pub fn write_all(mut self, data: &[u8]) -> Result<(), &'static str> {
        let mut done = 0;
        while done < data.len() {
            let region = self.next().ok_or(self.error.unwrap_or("short PRP"))?;
            let end = (done + region.1).min(data.len());
            if !self.mem.write_bytes(region.0, &data[done..end]) {
                return Err("PRP region outside host memory");
            }
            done = end;
        }
        Ok(())
    }

    /// Fill `data` from the host buffer described by the PRPs.
    pub fn read_all(mut self, data: &mut [u8]) -> Result<(), &'static str> {
        let mut done = 0;
        while done < data.len() {
            let region = self.next().ok_or(self.error.unwrap_or("short PRP"))?;
            let end = (done + region.1).min(data.len());
            if !self.mem.read_bytes(region.0, &mut data[done..end]) {
                return Err("PRP region outside host memory");
            }
            done = end;
        }
        Ok(())
    }

    /// Grab the next memory region to read/write
    fn get_next(&mut self) -> Result<HostRegion, &'static str> {
        assert!(self.remain > 0);
        assert!(self.error.is_none());

        // PRP Entry Layout
        // | 63 . . . . . . . . . . . . . . . n + 1 | n . . . . . . 2 | 1 0 |
        // |         page base address              |      offset     | 0 0 |
        let (addr, size, next) = match self.next {
            PrpNext::Prp1 => {
                // Only the first entry may carry a non-zero page offset
                let offset = self.prp1 & PAGE_OFFSET as u64;
                let size = u64::min(PAGE_SIZE as u64 - offset, self.remain);
                let after = self.remain - size;
                let next = if after == 0 {
                    PrpNext::Done
                } else if after <= PAGE_SIZE as u64 {
                    PrpNext::Prp2
                } else {
                    // PRP2 points to a list, which must be Qword aligned and
                    // may start part way into its page.
                    if (self.prp2 % 8) != 0 {
                        return Err("PRP2 not Qword aligned!");
                    }
                    let base = self.prp2 & (PAGE_MASK as u64);
                    let idx = (self.prp2 & PAGE_OFFSET as u64) / 8;
                    PrpNext::List(base, idx as u16)
                };
                (self.prp1, size, next)
            }
            PrpNext::Prp2 => {
                if self.prp2 & PAGE_OFFSET as u64 != 0 {
                    return Err("Inappropriate PRP2 offset");
                }
                (self.prp2, self.remain, PrpNext::Done)
            }
            PrpNext::List(base, idx) => {
                let entry = self.list_entry(base + (idx as u64) * 8)?;

                if self.remain <= PAGE_SIZE as u64 {
                    (entry, self.remain, PrpNext::Done)
                } else if idx != PRP_LIST_MAX {
                    (entry, PAGE_SIZE as u64, PrpNext::List(base, idx + 1))
                } else {
                    // The last slot of a full list chains to the next list
                    let next_entry = self.list_entry(entry)?;
                    (next_entry, PAGE_SIZE as u64, PrpNext::List(entry, 1))
                }
            }
            PrpNext::Done => return Err("PRP iteration past end"),
        };

        self.remain -= size;
        self.next = next;

        Ok(HostRegion(HostAddr(addr), size as usize))
    }

    fn list_entry(&self, addr: u64) -> Result<u64, &'static str> {
        let entry: u64 = self
            .mem
            .read(HostAddr(addr))
            .ok_or("Unable to read PRP list entry")?;
        if entry & PAGE_OFFSET as u64 != 0 {
            return Err("Inappropriate PRP list entry offset");
        }
        Ok(entry)
    }
}

impl Iterator for PrpIter<'_> {
    type Item = HostRegion;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remain == 0 || self.error.is_some() {
            return None;
        }
        match self.get_next() {
            Ok(res) => Some(res),
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }
}

/// A Command Completion result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Status Code Type and Status Code
    pub status: u16,
    /// Command Specific Result (DW0)
    pub dw0: u32,
}

impl Completion {
    /// Create a successful Completion result
    pub fn success() -> Self {
        Self::success_val(0)
    }

    /// Create a successful Completion result with a specific value
    pub fn success_val(dw0: u32) -> Self {
        Self {
            dw0,
            status: Self::status_field(
                StatusCodeType::Generic as u8,
                bits::STS_SUCCESS,
                false,
            ),
        }
    }

    /// Create an error Completion result with a specific type and status
    pub fn specific_err(sct: StatusCodeType, status: u8) -> Self {
        // Generic success doesn't belong in an error. Command specific
        // codes may legitimately be zero.
        assert!(
            !(sct == StatusCodeType::Generic && status == bits::STS_SUCCESS)
        );

        Self { dw0: 0, status: Self::status_field(sct as u8, status, false) }
    }

    /// Create a generic error Completion result with a specific status
    pub fn generic_err(status: u8) -> Self {
        Self::specific_err(StatusCodeType::Generic, status)
    }

    /// A completion with arbitrary raw fields, as supplied by a
    /// command-response rule.
    pub fn raw(sct: u8, sc: u8, dnr: bool, dw0: u32) -> Self {
        Self { dw0, status: Self::status_field(sct, sc, dnr) }
    }

    /// Set the Do Not Retry bit.
    pub fn dnr(self) -> Self {
        Self { status: self.status | 1 << 15, ..self }
    }

    pub fn is_success(&self) -> bool {
        (self.status >> 1) & 0x7ff == 0
    }

    /// Helper method to combine StatusCodeType and status code
    fn status_field(sct: u8, sc: u8, dnr: bool) -> u16 {
        (sc as u16) << 1 | ((sct & 0b111) as u16) << 9 | (dnr as u16) << 15
    }
}

impl From<QueueCreateErr> for Completion {
    fn from(e: QueueCreateErr) -> Self {
        match e {
            QueueCreateErr::InvalidBaseAddr => {
                Completion::generic_err(bits::STS_INVAL_FIELD)
            }
            QueueCreateErr::InvalidSize => Completion::specific_err(
                StatusCodeType::CmdSpecific,
                bits::STS_CREATE_IO_Q_INVAL_QSIZE,
            ),
            QueueCreateErr::QueueIdAlreadyExists(_) => {
                Completion::specific_err(
                    StatusCodeType::CmdSpecific,
                    bits::STS_CREATE_IO_Q_INVAL_QID,
                )
            }
        }
    }
}

impl From<ParseErr> for Completion {
    fn from(_e: ParseErr) -> Self {
        Completion::generic_err(bits::STS_INVAL_FIELD)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bits::*;

    fn mem() -> HostMem {
        HostMem::new(8 * PAGE_SIZE)
    }

    #[test]
    fn fused_rejected() {
        let mut sqe = SubmissionQueueEntry::new(ADMIN_OPC_IDENTIFY, 1);
        assert!(check_fuse(&sqe).is_ok());
        sqe.cdw0 |= 0b01 << 8;
        assert!(matches!(check_fuse(&sqe), Err(ParseErr::Fused)));
        sqe.cdw0 |= 0b11 << 8;
        assert!(matches!(check_fuse(&sqe), Err(ParseErr::ReservedFuse)));
    }

    #[test]
    fn queue_create_fields() {
        let mut sqe = SubmissionQueueEntry::new(ADMIN_OPC_CREATE_IO_SQ, 4);
        sqe.prp1 = 0x3000;
        sqe.cdw10 = (63 << 16) | 2;
        sqe.cdw11 = (1 << 16) | 0b101;
        let cmd = CreateIOSQCmd::parse(&sqe).unwrap();
        assert_eq!(cmd.qsize, 64);
        assert_eq!(cmd.qid, 2);
        assert_eq!(cmd.cqid, 1);
        assert!(cmd.phys_contig);
        assert!(matches!(cmd.queue_prio, QueuePriority::Medium));

        sqe.cdw11 = (3 << 16) | 0b11;
        let cmd = CreateIOCQCmd::parse(&sqe).unwrap();
        assert_eq!(cmd.qsize, 64);
        assert_eq!(cmd.intr_vector, 3);
        assert!(cmd.intr_enable && cmd.phys_contig);
    }

    #[test]
    fn rw_fields() {
        let mut sqe = SubmissionQueueEntry::new(NVM_OPC_READ, 9);
        sqe.nsid = 1;
        sqe.cdw10 = 0x10;
        sqe.cdw11 = 0x1;
        sqe.cdw12 = 7;
        let cmd = RwCmd::parse(&sqe).unwrap();
        assert_eq!(cmd.slba, 0x1_0000_0010);
        assert_eq!(cmd.nlb, 8);

        sqe.prp1 = 0x1002;
        assert!(matches!(RwCmd::parse(&sqe), Err(ParseErr::MisalignedPrp(_))));
    }

    #[test]
    fn log_page_len() {
        let mut sqe = SubmissionQueueEntry::new(ADMIN_OPC_GET_LOG_PAGE, 0);
        // 128 dwords (0's based) of firmware slot info
        sqe.cdw10 = (127 << 16) | LOG_ID_FIRMWARE_SLOT as u32;
        let cmd = GetLogPageCmd::parse(&sqe).unwrap();
        assert_eq!(cmd.len, 512);
        assert_eq!(cmd.log_page_ident, LogPageIdent::Firmware);
        assert_eq!(LogPageIdent::from(0x40), LogPageIdent::Reserved(0x40));
    }

    #[test]
    fn fw_fields() {
        let mut sqe = SubmissionQueueEntry::new(ADMIN_OPC_FW_COMMIT, 0);
        sqe.cdw10 = (1 << 3) | 2;
        let cmd = FwCommitCmd::parse(&sqe).unwrap();
        assert_eq!((cmd.fs, cmd.ca), (2, 1));

        sqe.cdw10 = 1023;
        sqe.cdw11 = 1024;
        let cmd = FwImageDownloadCmd::parse(&sqe).unwrap();
        assert_eq!(cmd.len(), 4096);
        assert_eq!(cmd.ofst, 1024);
    }

    #[test]
    fn number_of_queues_feature() {
        match FeatureIdent::from((FEAT_ID_NUM_QUEUES, 0x0003_0001)) {
            FeatureIdent::NumberOfQueues { ncqr, nsqr } => {
                assert_eq!((ncqr, nsqr), (4, 2));
            }
            other => panic!("unexpected feature {other:?}"),
        }
        assert!(matches!(
            FeatureIdent::from((0x42, 0)),
            FeatureIdent::Other(0x42)
        ));
    }

    #[test]
    fn prp_single_and_pair() {
        let mem = mem();
        let regions: Vec<_> =
            PrpIter::new(512, 0x1000, 0, &mem).collect();
        assert_eq!(regions, vec![HostRegion(HostAddr(0x1000), 512)]);

        // Starting mid-page spills into PRP2
        let regions: Vec<_> =
            PrpIter::new(PAGE_SIZE as u64, 0x1800, 0x3000, &mem).collect();
        assert_eq!(
            regions,
            vec![
                HostRegion(HostAddr(0x1800), 0x800),
                HostRegion(HostAddr(0x3000), 0x800)
            ]
        );

        let mut iter = PrpIter::new(PAGE_SIZE as u64, 0x1800, 0x3004, &mem);
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
        assert_eq!(iter.error(), Some("Inappropriate PRP2 offset"));
    }

    #[test]
    fn prp_list() {
        let mem = mem();
        let list = HostAddr(0x2000);
        assert!(mem.write(list, &0x4000u64));
        assert!(mem.write(list.offset::<u64>(1), &0x6000u64));

        let regions: Vec<_> =
            PrpIter::new(3 * PAGE_SIZE as u64, 0x1000, 0x2000, &mem)
                .collect();
        assert_eq!(
            regions,
            vec![
                HostRegion(HostAddr(0x1000), PAGE_SIZE),
                HostRegion(HostAddr(0x4000), PAGE_SIZE),
                HostRegion(HostAddr(0x6000), PAGE_SIZE),
            ]
        );
    }

    #[test]
    fn copy_through_prps() {
        let mem = mem();
        let data: Vec<u8> =
            (0..PAGE_SIZE as u32 + 16).map(|v| v as u8).collect();
        PrpIter::new(data.len() as u64, 0x1000, 0x3000, &mem)
            .write_all(&data)
            .unwrap();
        assert_eq!(mem.read::<u8>(HostAddr(0x3000 + 15)), Some(data[0x100f]));

        let mut back = vec![0u8; data.len()];
        PrpIter::new(data.len() as u64, 0x1000, 0x3000, &mem)
            .read_all(&mut back)
            .unwrap();
        assert_eq!(back, data);

        // Beyond the end of host memory
        let res = PrpIter::new(16, 0x10_0000, 0, &mem).write_all(&[0; 16]);
        assert!(res.is_err());
    }

    #[test]
    fn completion_status() {
        let ok = Completion::success_val(5);
        assert!(ok.is_success());
        assert_eq!(ok.dw0, 5);

        let err = Completion::generic_err(STS_INVALID_NS).dnr();
        assert!(!err.is_success());
        assert_eq!(err.status, (STS_INVALID_NS as u16) << 1 | 1 << 15);

        let raw = Completion::raw(1, 6, false, 0);
        assert_eq!(raw.status, 6 << 1 | 1 << 9);

        // Command specific status code 0 is still an error
        let inval_cq = Completion::specific_err(
            StatusCodeType::CmdSpecific,
            STS_CREATE_IO_Q_INVAL_CQ,
        );
        assert!(!inval_cq.is_success());
        assert_eq!(inval_cq.status, 1 << 9);
    }

    #[test]
    #[should_panic]
    fn generic_success_is_not_an_error() {
        let _ = Completion::generic_err(STS_SUCCESS);
    }
}
