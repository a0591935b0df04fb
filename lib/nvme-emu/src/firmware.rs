// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware image staging and slots.

use std::collections::BTreeMap;

use crate::bits::{self, ascii_pad, FirmwareSlotInfo, StatusCodeType};
use crate::cmds::Completion;

use thiserror::Error;

/// Largest firmware image accepted, in bytes.
pub const MAX_IMAGE_SIZE: u64 = 16 << 20;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("firmware slot {0} does not exist")]
    InvalidSlot(u8),

    #[error("commit action {0} is not supported")]
    InvalidCommitAction(u8),

    #[error("no firmware image has been downloaded")]
    NoImage,

    #[error("firmware slot {0} holds no image")]
    EmptySlot(u8),

    #[error("{len} bytes at dword offset {ofst} exceed the image size limit")]
    ImageTooLarge { ofst: u32, len: usize },
}

impl From<FirmwareError> for Completion {
    fn from(e: FirmwareError) -> Self {
        match e {
            FirmwareError::InvalidSlot(_)
            | FirmwareError::InvalidCommitAction(_)
            | FirmwareError::ImageTooLarge { .. } => {
                Completion::generic_err(bits::STS_INVAL_FIELD)
            }
            FirmwareError::NoImage => Completion::specific_err(
                StatusCodeType::CmdSpecific,
                bits::STS_FW_INVAL_IMAGE,
            ),
            FirmwareError::EmptySlot(_) => Completion::specific_err(
                StatusCodeType::CmdSpecific,
                bits::STS_FW_INVAL_SLOT,
            ),
        }
    }
}

/// Firmware Commit actions.
///
/// See NVMe 1.2 Figure 77 Firmware Commit - Command Dword 10
#[derive(Debug, Copy, Clone, Eq, PartialEq, strum::FromRepr)]
#[repr(u8)]
pub enum CommitAction {
    /// Replace the image in the slot, without activating it.
    Replace = 0,
    /// Replace the image in the slot and activate it.
    ReplaceAndActivate = 1,
    /// Activate the image already in the slot.
    Activate = 2,
    /// Replace and activate without waiting for a reset.
    ReplaceAndActivateNow = 3,
}

/// Downloaded firmware chunks plus the contents of each slot.
#[derive(Debug)]
pub struct Firmware {
    /// Chunks by dword offset, as handed over by Firmware Image Download.
    staging: BTreeMap<u32, Vec<u8>>,

    /// Committed images by slot number.
    images: BTreeMap<u8, Vec<u8>>,

    slot_info: FirmwareSlotInfo,
}

impl Firmware {
    /// Start out running `revision` from slot 1.
    pub fn new(revision: &str) -> Self {
        let mut slot_info = FirmwareSlotInfo::default();
        slot_info.frs[0] = ascii_pad(revision);
        slot_info.set_active_slot(1);

        let mut images = BTreeMap::new();
        images.insert(1, revision.as_bytes().to_vec());

        Self { staging: BTreeMap::new(), images, slot_info }
    }

    /// Stage a chunk at dword offset `ofst`, replacing whatever was staged
    /// at the same offset.
    ///
    /// The chunk is refused if it would reach past [`MAX_IMAGE_SIZE`].
    pub fn download(
        &mut self,
        ofst: u32,
        data: Vec<u8>,
    ) -> Result<(), FirmwareError> {
        if ofst as u64 * 4 + data.len() as u64 > MAX_IMAGE_SIZE {
            return Err(FirmwareError::ImageTooLarge { ofst, len: data.len() });
        }
        self.staging.insert(ofst, data);
        Ok(())
    }

    /// Number of chunks currently staged.
    pub fn staging_len(&self) -> usize {
        self.staging.len()
    }

    pub fn clear_staging(&mut self) {
        self.staging.clear();
    }

    pub fn slot_info(&self) -> &FirmwareSlotInfo {
        &self.slot_info
    }

    pub fn active_slot(&self) -> u8 {
        self.slot_info.active_slot()
    }

    /// The staged chunks laid out at their offsets, gaps zero filled.
    fn staged_image(&self) -> Vec<u8> {
        let len = self
            .staging
            .iter()
            .map(|(&ofst, data)| ofst as usize * 4 + data.len())
            .max()
            .unwrap_or(0);
        let mut image = vec![0u8; len];
        for (&ofst, data) in &self.staging {
            let start = ofst as usize * 4;
            image[start..start + data.len()].copy_from_slice(data);
        }
        image
    }

    /// Carry out a Firmware Commit of `slot` with the raw commit action.
    pub fn commit(
        &mut self,
        slot: u8,
        action: u8,
    ) -> Result<(), FirmwareError> {
        if slot == 0 || slot > bits::FW_SLOT_COUNT {
            return Err(FirmwareError::InvalidSlot(slot));
        }
        let action = CommitAction::from_repr(action)
            .ok_or(FirmwareError::InvalidCommitAction(action))?;

        match action {
            CommitAction::Replace => self.replace_slot(slot),
            CommitAction::ReplaceAndActivate
            | CommitAction::ReplaceAndActivateNow => {
                self.replace_slot(slot)?;
                self.replace_running_firmware_with_one_in_slot(slot)
            }
            CommitAction::Activate => {
                self.replace_running_firmware_with_one_in_slot(slot)
            }
        }
    }

    /// Move the staged image into `slot`.
    fn replace_slot(&mut self, slot: u8) -> Result<(), FirmwareError> {
        if self.staging.is_empty() {
            return Err(FirmwareError::NoImage);
        }
        let image = self.staged_image();
        self.slot_info.frs[slot as usize - 1] = revision_of(&image);
        self.images.insert(slot, image);
        self.staging.clear();
        Ok(())
    }

    /// Make `slot` the running firmware.
    pub fn replace_running_firmware_with_one_in_slot(
        &mut self,
        slot: u8,
    ) -> Result<(), FirmwareError> {
        if !self.images.contains_key(&slot) {
            return Err(FirmwareError::EmptySlot(slot));
        }
        self.slot_info.set_active_slot(slot);
        self.staging.clear();
        Ok(())
    }

    /// Revision of the running firmware, as reported in Identify Controller.
    pub fn running_revision(&self) -> [u8; 8] {
        self.slot_info.revision(self.active_slot()).unwrap_or([b' '; 8])
    }
}

/// Firmware revision of an image: its first 8 bytes, with NULs and other
/// unprintable bytes as spaces.
fn revision_of(image: &[u8]) -> [u8; 8] {
    let mut rev = [b' '; 8];
    for (dst, &src) in rev.iter_mut().zip(image) {
        if src.is_ascii_graphic() {
            *dst = src;
        }
    }
    rev
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn initial_slot() {
        let fw = Firmware::new("1.0");
        assert_eq!(fw.active_slot(), 1);
        assert_eq!(&fw.running_revision(), b"1.0     ");
        assert_eq!(fw.staging_len(), 0);
    }

    #[test]
    fn download_overwrites_offset() {
        let mut fw = Firmware::new("1.0");
        fw.download(0, vec![1; 8]).unwrap();
        fw.download(0, vec![2; 4]).unwrap();
        fw.download(4, vec![3; 4]).unwrap();
        assert_eq!(fw.staging_len(), 2);
        let image = fw.staged_image();
        assert_eq!(image.len(), 20);
        assert_eq!(&image[..4], &[2; 4]);
        assert_eq!(&image[4..16], &[0; 12]);
        assert_eq!(&image[16..], &[3; 4]);
    }

    #[test]
    fn commit_and_activate() {
        let mut fw = Firmware::new("1.0");
        fw.download(0, b"2.0.1-rc".to_vec()).unwrap();
        fw.download(1024, vec![0xff; 4096]).unwrap();
        fw.commit(2, CommitAction::ReplaceAndActivate as u8).unwrap();

        assert_eq!(fw.active_slot(), 2);
        assert_eq!(fw.staging_len(), 0);
        assert_eq!(fw.slot_info().revision(2), Some(*b"2.0.1-rc"));
        // Slot 1 still holds the original image
        assert_eq!(fw.slot_info().revision(1), Some(*b"1.0     "));

        fw.commit(1, CommitAction::Activate as u8).unwrap();
        assert_eq!(fw.active_slot(), 1);
    }

    #[test]
    fn replace_without_activation() {
        let mut fw = Firmware::new("1.0");
        fw.download(0, b"3.0".to_vec()).unwrap();
        fw.commit(3, CommitAction::Replace as u8).unwrap();
        assert_eq!(fw.active_slot(), 1);
        assert_eq!(fw.slot_info().revision(3), Some(*b"3.0     "));
    }

    #[test]
    fn commit_errors() {
        let mut fw = Firmware::new("1.0");
        assert_eq!(fw.commit(0, 1), Err(FirmwareError::InvalidSlot(0)));
        assert_eq!(fw.commit(8, 1), Err(FirmwareError::InvalidSlot(8)));
        assert_eq!(fw.commit(1, 1), Err(FirmwareError::NoImage));
        assert_eq!(fw.commit(4, 2), Err(FirmwareError::EmptySlot(4)));

        fw.download(0, vec![0; 4]).unwrap();
        assert_eq!(
            fw.commit(1, 5),
            Err(FirmwareError::InvalidCommitAction(5))
        );
        // A failed commit leaves the staged image in place
        assert_eq!(fw.staging_len(), 1);

        assert_eq!(
            Completion::from(FirmwareError::EmptySlot(4)).status >> 1 & 0xff,
            bits::STS_FW_INVAL_SLOT as u16
        );
    }

    #[test]
    fn oversized_image_refused() {
        let mut fw = Firmware::new("1.0");
        let last = (MAX_IMAGE_SIZE / 4) as u32 - 1;
        fw.download(last, vec![0; 4]).unwrap();
        assert_eq!(
            fw.download(last, vec![0; 8]),
            Err(FirmwareError::ImageTooLarge { ofst: last, len: 8 })
        );
        assert_eq!(
            fw.download(0x4000_0000, vec![0; 4]),
            Err(FirmwareError::ImageTooLarge { ofst: 0x4000_0000, len: 4 })
        );
        assert_eq!(fw.staging_len(), 1);
    }
}
