// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory and register layouts defined by the NVMe base specification.

use bitstruct::bitstruct;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

/// A Submission Queue Entry as represented in memory.
///
/// See NVMe 1.0e Section 4.2 Submission Queue Entry - Command Format
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct SubmissionQueueEntry {
    /// Command Dword 0 (CDW0)
    ///
    /// Bits
    /// 31:16 - Command Identifier (CID)
    /// 09:08 - Fused Operation (FUSE)
    /// 07:00 - Opcode (OPC)
    pub cdw0: u32,

    /// Namespace Identifier (NSID)
    pub nsid: u32,

    /// Reserved - Bytes 15:08
    pub rsvd: u64,

    /// Metadata Pointer (MPTR)
    pub mptr: u64,

    /// The first Physical Region Page (PRP) entry for the command.
    pub prp1: u64,

    /// Either reserved, the second PRP entry or a PRP List pointer.
    ///
    /// See NVMe 1.0e Section 4.3 Physical Region Page Entry and List
    pub prp2: u64,

    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl SubmissionQueueEntry {
    /// Build an entry carrying `opcode` and `cid` in CDW0.
    pub fn new(opcode: u8, cid: u16) -> Self {
        Self {
            cdw0: (cid as u32) << 16 | opcode as u32,
            ..Default::default()
        }
    }

    /// Returns the Identifier (CID) of this Submission Queue Entry.
    ///
    /// The command identifier along with the Submission Queue ID
    /// specify a unique identifier for the command.
    pub fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    /// Returns the Opcode (OPC) of this Submission Queue Entry.
    pub fn opcode(&self) -> u8 {
        self.cdw0 as u8
    }

    /// Fused Operation (FUSE) bits.
    pub fn fuse(&self) -> u8 {
        ((self.cdw0 >> 8) & 0b11) as u8
    }
}

/// A Completion Queue Entry as represented in memory.
///
/// See NVMe 1.0e Section 4.5 Completion Queue Entry
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct CompletionQueueEntry {
    /// Dword 0 (DW0), a command specific value.
    pub dw0: u32,

    /// Reserved (DW1) - Bytes 07:04
    pub rsvd: u32,

    /// Submission Queue Head Pointer (SQHD)
    ///
    /// The head of the submission queue identified by `sqid` at the time
    /// this entry was posted.
    pub sqhd: u16,

    /// Submission Queue Identifier (SQID)
    pub sqid: u16,

    /// Command Identifier (CID)
    pub cid: u16,

    /// The status of the command that's being completed along with
    /// the current phase tag.
    ///
    /// Bit      0 Phase Tag (P)      ===  Bit 16 of Dword 3 (DW3)
    /// Bits 15:01 Status Field (SF)  ===  Bits 31:17 of Dword 3 (DW3)
    ///
    /// See NVMe 1.0e Section 4.5.1 Status Field Definition
    pub status_phase: u16,
}

impl CompletionQueueEntry {
    pub fn new(comp: crate::cmds::Completion, cid: u16) -> Self {
        Self {
            dw0: comp.dw0,
            cid,
            status_phase: comp.status,
            ..Default::default()
        }
    }

    pub fn set_phase(&mut self, phase: bool) {
        match phase {
            true => self.status_phase |= 0b1,
            false => self.status_phase &= !0b1,
        }
    }

    pub fn phase(&self) -> bool {
        self.status_phase & 0b1 != 0
    }

    /// Status Field with the phase tag stripped.
    pub fn status(&self) -> u16 {
        self.status_phase >> 1
    }

    /// Status Code (SC)
    pub fn sc(&self) -> u8 {
        (self.status() & 0xff) as u8
    }

    /// Status Code Type (SCT)
    pub fn sct(&self) -> u8 {
        ((self.status() >> 8) & 0b111) as u8
    }

    /// Do Not Retry (DNR)
    pub fn dnr(&self) -> bool {
        self.status() & (1 << 14) != 0
    }
}

// Register bits

bitstruct! {
    /// Representation of the Controller Capabilities (CAP) register.
    ///
    /// See NVMe 1.0e Section 3.1.1 Offset 00h: CAP - Controller Capabilities
    #[derive(Clone, Copy, Debug, Default)]
    pub struct Capabilities(pub u64) {
        /// Maximum Queue Entries Supported (MQES)
        ///
        /// 0's based, so a value of 1 indicates a maximum size of 2.
        pub mqes: u16 = 0..16;

        /// Contiguous Queues Required (CQR)
        pub cqr: bool = 16;

        reserved1: u8 = 17..24;

        /// Timeout (TO), in 500ms units.
        pub to: u8 = 24..32;

        /// Doorbell Stride (DSTRD)
        ///
        /// Size between each doorbell, specified as 2^(2 + DSTRD) bytes.
        pub dstrd: u8 = 32..36;

        /// NVM Subsystem Reset Supported (NSSRS)
        pub nssrs: bool = 36;

        /// Command Sets Supported (CSS): NVM command set.
        pub css_nvm: bool = 37;

        reserved2: u16 = 38..48;

        /// Memory Page Size Minimum (MPSMIN), as 2^(12 + MPSMIN) bytes.
        pub mpsmin: u8 = 48..52;

        /// Memory Page Size Maximum (MPSMAX), as 2^(12 + MPSMAX) bytes.
        pub mpsmax: u8 = 52..56;

        reserved3: u8 = 56..64;
    }
}

impl Capabilities {
    /// Largest I/O queue depth the controller accepts.
    pub fn max_queue_entries(&self) -> u32 {
        self.mqes() as u32 + 1
    }
}

bitstruct! {
    /// Representation of the Controller Configuration (CC) register.
    ///
    /// See NVMe 1.0e Section 3.1.5 Offset 14h: CC - Controller Configuration
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Configuration(pub u32) {
        /// Enable (EN)
        ///
        /// Transitioning from 1 to 0 indicates a Controller Reset.
        pub enabled: bool = 0;

        reserved1: u8 = 1..4;

        /// I/O Command Set Selected (CSS), 0 being the NVM command set.
        pub css: u8 = 4..7;

        /// Memory Page Size (MPS), as 2^(12 + MPS) bytes.
        pub mps: u8 = 7..11;

        /// Arbitration Mechanism Selected (AMS)
        pub ams: u8 = 11..14;

        /// Shutdown Notification (SHN)
        pub shn: ShutdownNotification = 14..16;

        /// I/O Submission Queue Entry Size (IOSQES), as 2^IOSQES bytes.
        pub iosqes: u8 = 16..20;

        /// I/O Completion Queue Entry Size (IOCQES), as 2^IOCQES bytes.
        pub iocqes: u8 = 20..24;

        reserved2: u8 = 24..32;
    }
}

/// Shutdown Notification Values
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownNotification {
    None,
    Normal,
    Abrupt,
    Reserved,
}

impl bitstruct::FromRaw<u8, ShutdownNotification> for Configuration {
    fn from_raw(raw: u8) -> ShutdownNotification {
        match raw {
            0b00 => ShutdownNotification::None,
            0b01 => ShutdownNotification::Normal,
            0b10 => ShutdownNotification::Abrupt,
            0b11 => ShutdownNotification::Reserved,
            _ => unreachable!(),
        }
    }
}

impl bitstruct::IntoRaw<u8, ShutdownNotification> for Configuration {
    fn into_raw(target: ShutdownNotification) -> u8 {
        match target {
            ShutdownNotification::None => 0b00,
            ShutdownNotification::Normal => 0b01,
            ShutdownNotification::Abrupt => 0b10,
            ShutdownNotification::Reserved => 0b11,
        }
    }
}

bitstruct! {
    /// Representation of the Controller Status (CSTS) register.
    ///
    /// See NVMe 1.0e Section 3.1.6 Offset 1Ch: CSTS - Controller Status
    #[derive(Clone, Copy, Debug, Default)]
    pub struct Status(pub u32) {
        /// Ready (RDY)
        ///
        /// Set once the controller accepts Submission Queue Tail Doorbell
        /// writes.
        pub ready: bool = 0;

        /// Controller Fatal Status (CFS)
        pub cfs: bool = 1;

        /// Shutdown Status (SHST)
        pub shst: ShutdownStatus = 2..4;

        reserved: u32 = 4..32;
    }
}

/// Shutdown Status
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownStatus {
    Normal,
    Processing,
    Complete,
    Reserved,
}

impl bitstruct::FromRaw<u8, ShutdownStatus> for Status {
    fn from_raw(raw: u8) -> ShutdownStatus {
        match raw {
            0b00 => ShutdownStatus::Normal,
            0b01 => ShutdownStatus::Processing,
            0b10 => ShutdownStatus::Complete,
            0b11 => ShutdownStatus::Reserved,
            _ => unreachable!(),
        }
    }
}

impl bitstruct::IntoRaw<u8, ShutdownStatus> for Status {
    fn into_raw(target: ShutdownStatus) -> u8 {
        match target {
            ShutdownStatus::Normal => 0b00,
            ShutdownStatus::Processing => 0b01,
            ShutdownStatus::Complete => 0b10,
            ShutdownStatus::Reserved => 0b11,
        }
    }
}

bitstruct! {
    /// Representation of the Admin Queue Attributes (AQA) register.
    ///
    /// Both sizes are 0's based values.
    ///
    /// See NVMe 1.0e Section 3.1.7 Offset 24h: AQA - Admin Queue Attributes
    #[derive(Clone, Copy, Debug, Default)]
    pub struct AdminQueueAttrs(pub u32) {
        /// Admin Submission Queue Size (ASQS)
        pub asqs: u16 = 0..12;

        reserved1: u8 = 12..16;

        /// Admin Completion Queue Size (ACQS)
        pub acqs: u16 = 16..28;

        reserved2: u8 = 28..32;
    }
}

bitstruct! {
    /// Queue Entry Size Required & Maximum, as reported in Identify
    /// Controller SQES/CQES.
    #[derive(Copy, Clone, Debug)]
    pub struct NvmQueueEntrySize(pub u8) {
        /// The required (minimum) Queue Entry Size, as 2^required bytes.
        pub required: u8 = 0..4;

        /// The maximum Queue Entry Size, as 2^maximum bytes.
        pub maximum: u8 = 4..8;
    }
}

/// Controller Version NVM Express 1.2
///
/// See NVMe 1.2 Section 3.1.2 Offset 08h: VS - Version
pub const NVME_VER_1_2: u32 = 0x00010200;

/// log2 of the only supported submission queue entry size (64 bytes).
pub const SQES_LOG2: u8 = 6;
/// log2 of the only supported completion queue entry size (16 bytes).
pub const CQES_LOG2: u8 = 4;

// Admin Command Opcodes

/// Delete I/O Submission Queue Command Opcode
pub const ADMIN_OPC_DELETE_IO_SQ: u8 = 0x00;
/// Create I/O Submission Queue Command Opcode
pub const ADMIN_OPC_CREATE_IO_SQ: u8 = 0x01;
/// Get Log Page Command Opcode
pub const ADMIN_OPC_GET_LOG_PAGE: u8 = 0x02;
/// Delete I/O Completion Queue Command Opcode
pub const ADMIN_OPC_DELETE_IO_CQ: u8 = 0x04;
/// Create I/O Completion Queue Command Opcode
pub const ADMIN_OPC_CREATE_IO_CQ: u8 = 0x05;
/// Identify Command Opcode
pub const ADMIN_OPC_IDENTIFY: u8 = 0x06;
/// Abort Command Opcode
pub const ADMIN_OPC_ABORT: u8 = 0x08;
/// Set Feature Command Opcode
pub const ADMIN_OPC_SET_FEATURES: u8 = 0x09;
/// Get Feature Command Opcode
pub const ADMIN_OPC_GET_FEATURES: u8 = 0x0A;
/// Asynchronous Event Request Command Opcode
pub const ADMIN_OPC_ASYNC_EVENT_REQ: u8 = 0x0C;
/// Firmware Commit Command Opcode
pub const ADMIN_OPC_FW_COMMIT: u8 = 0x10;
/// Firmware Image Download Command Opcode
pub const ADMIN_OPC_FW_IMAGE_DOWNLOAD: u8 = 0x11;
/// Keep Alive Command Opcode
pub const ADMIN_OPC_KEEP_ALIVE: u8 = 0x18;
/// Format NVM Command Opcode
pub const ADMIN_OPC_FORMAT_NVM: u8 = 0x80;

// NVM Command Opcodes

/// Flush Command Opcode
pub const NVM_OPC_FLUSH: u8 = 0x00;
/// Write Command Opcode
pub const NVM_OPC_WRITE: u8 = 0x01;
/// Read Command Opcode
pub const NVM_OPC_READ: u8 = 0x02;

// Generic Command Status values
// See NVMe 1.0e Section 4.5.1.2.1, Figure 17

/// Successful Completion
pub const STS_SUCCESS: u8 = 0x0;

/// Invalid Command Opcode
pub const STS_INVAL_OPC: u8 = 0x1;

/// Invalid Field in Command
pub const STS_INVAL_FIELD: u8 = 0x2;

/// Command ID Conflict
pub const STS_CID_CONFLICT: u8 = 0x3;

/// Data Transfer Error
///
/// Transferring the data or metadata associated with a command had an error.
pub const STS_DATA_XFER_ERR: u8 = 0x4;

/// Internal Device Error
pub const STS_INTERNAL_ERR: u8 = 0x6;

/// Invalid Namespace or Format
pub const STS_INVALID_NS: u8 = 0xB;

/// Command Sequence Error
///
/// The command was aborted due to a protocol violation in a multi-command
/// sequence, which includes reuse of an in-flight command identifier.
pub const STS_COMMAND_SEQ_ERR: u8 = 0xC;

/// LBA Out of Range
pub const STS_LBA_OUT_OF_RANGE: u8 = 0x80;

// Command Specific Status values
// See NVMe 1.0e Section 4.5.1.2.2, Figure 19

/// Completion Queue Invalid
pub const STS_CREATE_IO_Q_INVAL_CQ: u8 = 0x0;

/// Invalid Queue Identifier (Queue Creation)
pub const STS_CREATE_IO_Q_INVAL_QID: u8 = 0x1;

/// Invalid Queue Size (Queue Creation)
pub const STS_CREATE_IO_Q_INVAL_QSIZE: u8 = 0x2;

/// Invalid Queue Identifier (Queue Deletion)
pub const STS_DELETE_IO_Q_INVAL_QID: u8 = 0x1;

/// Invalid Queue Deletion
pub const STS_DELETE_IO_Q_INVAL_Q_DELETION: u8 = 0xC;

/// Invalid Firmware Slot
pub const STS_FW_INVAL_SLOT: u8 = 0x6;

/// Invalid Firmware Image
pub const STS_FW_INVAL_IMAGE: u8 = 0x7;

/// Invalid Log Page
pub const STS_INVAL_LOG_PAGE: u8 = 0x9;

/// Invalid Format
pub const STS_FORMAT_INVAL_FORMAT: u8 = 0xA;

// Feature identifiers

/// Volatile Write Cache
pub const FEAT_ID_VOLATILE_WRITE_CACHE: u8 = 0x06;

/// Number of Queues
pub const FEAT_ID_NUM_QUEUES: u8 = 0x07;

// Identify CNS values

/// Identify - Namespace Structure for an active NSID
pub const IDENT_CNS_NAMESPACE: u8 = 0x0;

/// Identify - Controller Structure
pub const IDENT_CNS_CONTROLLER: u8 = 0x1;

/// Identify - Active Namespace ID list
pub const IDENT_CNS_ACTIVE_NS_LIST: u8 = 0x2;

/// Identify - Allocated Namespace ID list
pub const IDENT_CNS_ALLOCATED_NS_LIST: u8 = 0x10;

/// Identify - Namespace Structure for an allocated NSID
pub const IDENT_CNS_ALLOCATED_NAMESPACE: u8 = 0x11;

// Log page identifiers

/// Error Information
pub const LOG_ID_ERROR: u8 = 0x01;
/// SMART / Health Information
pub const LOG_ID_SMART: u8 = 0x02;
/// Firmware Slot Information
pub const LOG_ID_FIRMWARE_SLOT: u8 = 0x03;

/// Number of firmware slots the controller exposes.
pub const FW_SLOT_COUNT: u8 = 7;

/// The type of value specified in the Status Field (SF) of a command
/// completion.
///
/// See NVMe 1.0e Section 4.5.1.1 Status Code Type (SCT)
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum StatusCodeType {
    Generic = 0,
    CmdSpecific = 1,
    MediaDataIntegrity = 2,
    VendorSpecific = 7,
}

/// Power State Descriptor (PSD) Data Structure
///
/// See NVMe 1.0e Section 5.11, Figure 67
#[derive(Default, Copy, Clone, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct PowerStateDescriptor {
    /// Maximum Power, in units of 0.01W.
    pub mp: u16,
    pub _resv1: u16,
    /// Entry Latency (ENLAT), in microseconds.
    pub enlat: u32,
    /// Exit Latency (EXLAT), in microseconds.
    pub exlat: u32,
    pub rrt: u8,
    pub rrl: u8,
    pub rwt: u8,
    pub rwl: u8,
    pub _resv: [u8; 16],
}

/// Identify Controller Data Structure
///
/// Describes the characteristics of the controller.
///
/// See NVMe 1.0e Section 5.11, Figure 66 Identify - Identify Controller Data Structure
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct IdentifyController {
    // bytes 0-255 - Controller Capabilities and Features
    /// PCI Vendor ID (VID)
    pub vid: u16,
    /// PCI Subsystem Vendor ID (SSVID)
    pub ssvid: u16,
    /// Serial Number (SN), space padded ASCII.
    pub sn: [u8; 20],
    /// Model Number (MN), space padded ASCII.
    pub mn: [u8; 40],
    /// Firmware Revision (FR)
    ///
    /// Revision of the image in the active firmware slot, as also reported
    /// through the Firmware Slot Information log page.
    pub fr: [u8; 8],
    /// Recommended Arbitration Burst (RAB)
    pub rab: u8,
    /// IEEE OUI Identifier (IEEE)
    pub ieee: [u8; 3],
    /// Multi-Interface Capabilities (CMIC)
    pub cmic: u8,
    /// Maximum Data Transfer Size (MDTS)
    ///
    /// In units of CAP.MPSMIN, as a power of two. 0 means unlimited.
    pub mdts: u8,
    /// Reserved - Bytes 255:78
    pub _resv1: [u8; 178],

    // bytes 256-511 - Admin Command Set Attributes
    /// Optional Admin Command Support (OACS)
    ///
    /// Bit 2 indicates Firmware Activate & Download command support.
    /// Bit 1 indicates Format NVM command support.
    pub oacs: u16,
    /// Abort Command Limit (ACL), 0's based.
    pub acl: u8,
    /// Asynchronous Event Request Limit (AERL), 0's based.
    pub aerl: u8,
    /// Firmware Updates (FRMW)
    ///
    /// Bits 3:1 indicate the number of firmware slots.
    /// Bit 0 indicates that slot 1 is read-only.
    pub frmw: u8,
    /// Log Page Attributes (LPA)
    pub lpa: u8,
    /// Error Log Page Entries (ELPE), 0's based.
    pub elpe: u8,
    /// Number of Power States Support (NPSS), 0's based.
    pub npss: u8,
    /// Admin Vendor Specific Command Configuration (AVSCC)
    pub avscc: u8,
    /// Reserved
    pub _resv2: [u8; 247],

    // bytes 512-2047 - NVM Command Set Attributes
    /// Submission Queue Entry Size (SQES), see [`NvmQueueEntrySize`].
    pub sqes: u8,
    /// Completion Queue Entry Size (CQES), see [`NvmQueueEntrySize`].
    pub cqes: u8,
    /// Reserved - Bytes 515:514
    pub _resv3: [u8; 2],
    /// Number of Namespaces (NN)
    pub nn: u32,
    /// Optional NVM Command Support (ONCS)
    pub oncs: u16,
    /// Fused Operation Support (FUSES)
    pub fuses: u16,
    /// Format NVM Attributes (FNA)
    pub fna: u8,
    /// Volatile Write Cache (VWC)
    pub vwc: u8,
    /// Atomic Write Unit Normal (AWUN)
    pub awun: u16,
    /// Atomic Write Unit Power Fail (AWUPF)
    pub awupf: u16,
    /// NVM Vendor Specific Command Configuration (NVSCC)
    pub nvscc: u8,
    /// Reserved - Bytes 703:531
    pub _resv4: [u8; 173],
    /// Reserved (I/O Command Set Attributes) - Bytes 2047:704
    pub _resv5: [u8; 1344],

    // bytes 2048-3071 - Power State Descriptors
    pub psd: [PowerStateDescriptor; 32],

    // bytes 3072-4095 - Vendor Specific
    pub vs: [u8; 1024],
}

// Default isn't derived for arrays longer than 32 elements
impl Default for IdentifyController {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

/// LBA Format Data Structure
///
/// See NVMe 1.0e Section 5.11, Figure 69
#[derive(Default, Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct LbaFormat {
    /// Metadata Size (MS)
    pub ms: u16,
    /// LBA Data Size (LBADS), as 2^n. 0 means the format is unsupported.
    pub lbads: u8,
    /// Relative Performance (RP)
    pub rp: u8,
}

/// Identify Namespace Data Structure
///
/// Describes the characteristics of a namespace.
///
/// See NVMe 1.0e Section 5.11, Figure 68
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct IdentifyNamespace {
    /// Namespace Size (NSZE), in logical blocks.
    pub nsze: u64,
    /// Namespace Capacity (NCAP)
    pub ncap: u64,
    /// Namespace Utilization (NUSE)
    pub nuse: u64,
    /// Namespace Features (NSFEAT)
    pub nsfeat: u8,
    /// Number of LBA Formats (NLBAF), 0's based.
    pub nlbaf: u8,
    /// Formatted LBA Size (FLBAS)
    ///
    /// Bits 3:0 select one of the 16 entries in `lbaf`.
    pub flbas: u8,
    /// Metadata Capabilities (MC)
    pub mc: u8,
    /// End-to-end Data Protection Capabilities (DPC)
    pub dpc: u8,
    /// End-to-end Data Protection Type Settings (DPS)
    pub dps: u8,
    /// Reserved - Bytes 127:30
    pub _resv1: [u8; 98],
    /// LBA Formats (LBAF0-LBAF15)
    pub lbaf: [LbaFormat; 16],
    /// Reserved - Bytes 383:192
    pub _resv2: [u8; 192],
    /// Vendor Specific (VS)
    pub vs: [u8; 3712],
}

impl Default for IdentifyNamespace {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

/// Firmware Slot Information Log (Log Identifier 03h)
///
/// See NVMe 1.2 Section 5.10.1.3, Figure 82
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct FirmwareSlotInfo {
    /// Active Firmware Info (AFI)
    ///
    /// Bits 6:4 name the slot to be activated at the next reset, 0 if none.
    /// Bits 2:0 name the slot of the currently running image.
    pub afi: u8,
    pub _resv1: [u8; 7],
    /// Firmware Revision for Slot 1-7 (FRS1-FRS7)
    ///
    /// All zeroes for an empty slot.
    pub frs: [[u8; 8]; 7],
    pub _resv2: [u8; 448],
}

impl FirmwareSlotInfo {
    /// The slot holding the running image.
    pub fn active_slot(&self) -> u8 {
        self.afi & 0b111
    }

    pub fn set_active_slot(&mut self, slot: u8) {
        self.afi = (self.afi & !0b111) | (slot & 0b111);
    }

    /// Revision recorded for `slot` (1 based), if the slot is populated.
    pub fn revision(&self, slot: u8) -> Option<[u8; 8]> {
        let rev = *self.frs.get(slot.checked_sub(1)? as usize)?;
        (rev != [0; 8]).then_some(rev)
    }
}

impl Default for FirmwareSlotInfo {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

/// Copy `src` into a fixed ASCII field, padding with spaces.
pub fn ascii_pad<const N: usize>(src: &str) -> [u8; N] {
    let mut out = [b' '; N];
    let bytes = src.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmds::Completion;
    use std::mem::size_of;

    #[test]
    fn entry_sizing() {
        assert_eq!(size_of::<SubmissionQueueEntry>(), 64);
        assert_eq!(size_of::<CompletionQueueEntry>(), 16);
        assert_eq!(size_of::<PowerStateDescriptor>(), 32);
        assert_eq!(size_of::<IdentifyController>(), 4096);
        assert_eq!(size_of::<LbaFormat>(), 4);
        assert_eq!(size_of::<IdentifyNamespace>(), 4096);
        assert_eq!(size_of::<FirmwareSlotInfo>(), 512);
    }

    #[test]
    fn sqe_fields() {
        let sqe = SubmissionQueueEntry::new(ADMIN_OPC_KEEP_ALIVE, 0xbeef);
        assert_eq!(sqe.opcode(), 0x18);
        assert_eq!(sqe.cid(), 0xbeef);
        assert_eq!(sqe.fuse(), 0);

        let fused = SubmissionQueueEntry { cdw0: 0x100, ..sqe };
        assert_eq!(fused.fuse(), 1);
    }

    #[test]
    fn cqe_status_decode() {
        let comp = Completion::specific_err(
            StatusCodeType::CmdSpecific,
            STS_CREATE_IO_Q_INVAL_QID,
        )
        .dnr();
        let mut cqe = CompletionQueueEntry::new(comp, 7);
        cqe.set_phase(true);
        assert!(cqe.phase());
        assert_eq!(cqe.sct(), StatusCodeType::CmdSpecific as u8);
        assert_eq!(cqe.sc(), STS_CREATE_IO_Q_INVAL_QID);
        assert!(cqe.dnr());
        cqe.set_phase(false);
        assert!(!cqe.phase());
        assert_eq!({ cqe.cid }, 7);
    }

    #[test]
    fn slot_info() {
        let mut info = FirmwareSlotInfo::default();
        assert_eq!(info.revision(1), None);
        info.frs[0] = ascii_pad("1.0");
        info.set_active_slot(1);
        assert_eq!(info.active_slot(), 1);
        assert_eq!(info.revision(1), Some(*b"1.0     "));
        assert_eq!(info.revision(0), None);
        assert_eq!(info.revision(8), None);
    }

    #[test]
    fn entry_size_field() {
        let sz = NvmQueueEntrySize(0)
            .with_required(SQES_LOG2)
            .with_maximum(SQES_LOG2);
        assert_eq!(sz.0, 0x66);
    }
}
