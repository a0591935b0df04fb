// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Namespaces and their backing storage.

use std::collections::BTreeMap;

use crate::bits::{IdentifyNamespace, LbaFormat};
use crate::config::NamespaceConfig;
use crate::NvmeError;

/// The broadcast NSID, naming every namespace at once.
pub const NSID_BROADCAST: u32 = 0xffff_ffff;

/// Number of entries in an Identify namespace list.
///
/// See NVMe 1.2 Figure 111 Namespace List
pub const NS_LIST_ENTRIES: usize = 1024;

/// LBA data sizes (as a power of two) every namespace can be formatted with.
const SUPPORTED_LBADS: [u8; 2] = [9, 12];

/// A single namespace: its formatted state and backing storage.
#[derive(Debug)]
pub struct Namespace {
    nsid: u32,

    /// LBA formats, the first being the one the namespace attached with.
    formats: Vec<u8>,

    /// Index into `formats` currently in use.
    flbas: u8,

    storage: Vec<u8>,
}

impl Namespace {
    /// Attach a namespace as described by `cfg`.
    pub fn new(cfg: &NamespaceConfig) -> Self {
        let lbads = cfg.block_size.trailing_zeros() as u8;
        let mut formats = vec![lbads];
        formats.extend(SUPPORTED_LBADS.iter().filter(|&&f| f != lbads));
        let len = cfg.block_size as usize * cfg.blocks as usize;
        Self { nsid: cfg.nsid, formats, flbas: 0, storage: vec![0; len] }
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    /// Size of a logical block in bytes, for the current format.
    pub fn block_size(&self) -> u64 {
        1 << self.formats[self.flbas as usize]
    }

    /// Capacity in logical blocks.
    pub fn capacity(&self) -> u64 {
        self.storage.len() as u64 / self.block_size()
    }

    /// Index of the active LBA format.
    pub fn format_index(&self) -> u8 {
        self.flbas
    }

    pub fn supports_format(&self, lbaf: u8) -> bool {
        (lbaf as usize) < self.formats.len()
    }

    /// Re-initialise the namespace with LBA format `lbaf`, discarding its
    /// contents.
    ///
    /// Returns false if no such format exists.
    pub fn format(&mut self, lbaf: u8) -> bool {
        if !self.supports_format(lbaf) {
            return false;
        }
        self.flbas = lbaf;
        self.storage.fill(0);
        true
    }

    /// Byte range of `nlb` blocks starting at `slba`, if it lies within the
    /// namespace.
    fn byte_range(
        &self,
        slba: u64,
        nlb: u64,
    ) -> Result<std::ops::Range<usize>, NvmeError> {
        let out = NvmeError::LbaOutOfRange { slba, nlb };
        let end = slba.checked_add(nlb).ok_or(out)?;
        if end > self.capacity() {
            return Err(NvmeError::LbaOutOfRange { slba, nlb });
        }
        let bs = self.block_size();
        Ok((slba * bs) as usize..(end * bs) as usize)
    }

    /// Copy blocks starting at `slba` into `buf`, which must be a whole
    /// number of blocks long.
    pub fn read_blocks(
        &self,
        slba: u64,
        buf: &mut [u8],
    ) -> Result<(), NvmeError> {
        let nlb = buf.len() as u64 / self.block_size();
        let range = self.byte_range(slba, nlb)?;
        buf.copy_from_slice(&self.storage[range]);
        Ok(())
    }

    /// Copy `buf` into the blocks starting at `slba`.
    pub fn write_blocks(
        &mut self,
        slba: u64,
        buf: &[u8],
    ) -> Result<(), NvmeError> {
        let nlb = buf.len() as u64 / self.block_size();
        let range = self.byte_range(slba, nlb)?;
        self.storage[range].copy_from_slice(buf);
        Ok(())
    }

    /// The Identify Namespace structure describing this namespace.
    pub fn identify(&self) -> IdentifyNamespace {
        let nsze = self.capacity();
        let mut ident = IdentifyNamespace {
            // No thin provisioning so nsze == ncap == nuse
            nsze,
            ncap: nsze,
            nuse: nsze,
            // 0's based
            nlbaf: self.formats.len() as u8 - 1,
            flbas: self.flbas,
            ..Default::default()
        };
        for (i, &lbads) in self.formats.iter().enumerate() {
            ident.lbaf[i] = LbaFormat { ms: 0, lbads, rp: 0 };
        }
        ident
    }
}

/// NSID to namespace mappings, split into the active and inactive (allocated
/// but not attached) sets.
#[derive(Debug)]
pub struct NamespaceStore {
    active: BTreeMap<u32, Namespace>,
    inactive: BTreeMap<u32, Namespace>,

    /// What each namespace looked like when first attached.
    defaults: Vec<NamespaceConfig>,
}

impl NamespaceStore {
    pub fn new(cfgs: &[NamespaceConfig]) -> Self {
        let mut store = Self {
            active: BTreeMap::new(),
            inactive: BTreeMap::new(),
            defaults: cfgs.to_vec(),
        };
        store.reset();
        store
    }

    /// Restore every namespace to its freshly attached state.
    pub fn reset(&mut self) {
        self.active.clear();
        self.inactive.clear();
        for cfg in &self.defaults {
            let set = match cfg.active {
                true => &mut self.active,
                false => &mut self.inactive,
            };
            set.insert(cfg.nsid, Namespace::new(cfg));
        }
    }

    pub fn active(&self, nsid: u32) -> Option<&Namespace> {
        self.active.get(&nsid)
    }

    pub fn active_mut(&mut self, nsid: u32) -> Option<&mut Namespace> {
        self.active.get_mut(&nsid)
    }

    pub fn active_nsids(&self) -> impl Iterator<Item = u32> + '_ {
        self.active.keys().copied()
    }

    pub fn is_inactive(&self, nsid: u32) -> bool {
        self.inactive.contains_key(&nsid)
    }

    /// Every allocated namespace, active or inactive.
    pub fn get_allocated_namespace_map(&self) -> BTreeMap<u32, &Namespace> {
        self.active
            .iter()
            .chain(self.inactive.iter())
            .map(|(&nsid, ns)| (nsid, ns))
            .collect()
    }

    /// Highest NSID the controller may hand out.
    pub fn max_nsid(&self) -> u32 {
        self.defaults.iter().map(|ns| ns.nsid).max().unwrap_or(0)
    }
}

/// Build a namespace list: the NSIDs in `nsids` greater than `start`, in
/// ascending order, zero terminated unless all 1024 entries are used.
///
/// NSIDs 0xFFFFFFFE and 0xFFFFFFFF may not be used as the starting point.
pub fn get_namespace_list_from_map<I>(
    nsids: I,
    start: u32,
) -> Result<Vec<u32>, NvmeError>
where
    I: IntoIterator<Item = u32>,
{
    if start >= NSID_BROADCAST - 1 {
        return Err(NvmeError::InvalidNamespace(start));
    }
    let mut list = vec![0u32; NS_LIST_ENTRIES];
    let mut ids: Vec<u32> =
        nsids.into_iter().filter(|&nsid| nsid > start).collect();
    ids.sort_unstable();
    for (slot, nsid) in list.iter_mut().zip(ids) {
        *slot = nsid;
    }
    Ok(list)
}

#[cfg(test)]
mod test {
    use super::*;

    fn cfg(nsid: u32, active: bool) -> NamespaceConfig {
        NamespaceConfig { nsid, block_size: 512, blocks: 16, active }
    }

    #[test]
    fn active_and_inactive_sets() {
        let store =
            NamespaceStore::new(&[cfg(1, true), cfg(2, false), cfg(5, true)]);
        assert!(store.active(1).is_some());
        assert!(store.active(2).is_none());
        assert!(store.is_inactive(2));
        assert_eq!(store.active_nsids().collect::<Vec<_>>(), vec![1, 5]);

        let all = store.get_allocated_namespace_map();
        assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![1, 2, 5]);
        assert_eq!(store.max_nsid(), 5);
    }

    #[test]
    fn namespace_list() {
        let list = get_namespace_list_from_map([7, 1, 3], 0).unwrap();
        assert_eq!(list.len(), NS_LIST_ENTRIES);
        assert_eq!(&list[..4], &[1, 3, 7, 0]);

        let list = get_namespace_list_from_map([7, 1, 3], 3).unwrap();
        assert_eq!(&list[..2], &[7, 0]);

        assert!(matches!(
            get_namespace_list_from_map([1], NSID_BROADCAST),
            Err(NvmeError::InvalidNamespace(_))
        ));
        assert!(get_namespace_list_from_map([1], NSID_BROADCAST - 1).is_err());

        // A full list carries no terminator
        let list = get_namespace_list_from_map(1..=2000, 0).unwrap();
        assert_eq!(list[NS_LIST_ENTRIES - 1], 1024);
    }

    #[test]
    fn block_io_bounds() {
        let mut ns = Namespace::new(&cfg(1, true));
        assert_eq!(ns.capacity(), 16);
        let data = [0xa5u8; 1024];
        ns.write_blocks(14, &data).unwrap();

        let mut back = [0u8; 1024];
        ns.read_blocks(14, &mut back).unwrap();
        assert_eq!(back, data);

        assert!(matches!(
            ns.write_blocks(15, &data),
            Err(NvmeError::LbaOutOfRange { slba: 15, nlb: 2 })
        ));
        assert!(ns.read_blocks(u64::MAX, &mut back).is_err());
    }

    #[test]
    fn format_changes_block_size() {
        let mut ns = Namespace::new(&cfg(1, true));
        ns.write_blocks(0, &[1u8; 512]).unwrap();

        let ident = ns.identify();
        assert_eq!(ident.nlbaf, 1);
        assert_eq!(ident.lbaf[0].lbads, 9);
        assert_eq!(ident.lbaf[1].lbads, 12);

        assert!(ns.format(1));
        assert_eq!(ns.block_size(), 4096);
        assert_eq!(ns.capacity(), 2);
        let mut buf = [0xffu8; 4096];
        ns.read_blocks(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        assert!(!ns.format(2));
        assert_eq!(ns.format_index(), 1);
    }

    #[test]
    fn reset_restores_defaults() {
        let mut store = NamespaceStore::new(&[cfg(1, true)]);
        let ns = store.active_mut(1).unwrap();
        ns.write_blocks(0, &[7u8; 512]).unwrap();
        assert!(ns.format(1));

        store.reset();
        let ns = store.active(1).unwrap();
        assert_eq!(ns.format_index(), 0);
        let mut buf = [0xffu8; 512];
        ns.read_blocks(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
