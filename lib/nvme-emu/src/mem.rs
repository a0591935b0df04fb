// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emulated host memory.
//!
//! Both sides of the emulated link share one flat, zero-initialized arena:
//! the host places queues, commands and data buffers in it, and the
//! controller reads commands and writes completions and payloads back.
//! Addresses are offsets into the arena.

use std::mem::size_of;
use std::ops::Range;
use std::sync::Mutex;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::common::*;

/// Flat byte-addressed memory shared between the host and the controller.
pub struct HostMem {
    bytes: Mutex<Box<[u8]>>,
    /// Next free address handed out by [`HostMem::alloc`].
    next_free: Mutex<u64>,
}

impl HostMem {
    /// Create an arena of at least `size` bytes (rounded up to a page).
    ///
    /// The first page is never handed out by [`HostMem::alloc`] so that a
    /// zeroed pointer field never aliases a live buffer.
    pub fn new(size: usize) -> Self {
        let size = round_up_p2(size.max(PAGE_SIZE), PAGE_SIZE);
        Self {
            bytes: Mutex::new(vec![0u8; size].into_boxed_slice()),
            next_free: Mutex::new(PAGE_SIZE as u64),
        }
    }

    /// Size of the arena in bytes.
    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Carve out `len` bytes of page-aligned memory.
    ///
    /// Allocations are never freed; the arena is sized for one test run.
    pub fn alloc(&self, len: usize) -> Option<HostAddr> {
        let len = round_up_p2(len.max(1), PAGE_SIZE) as u64;
        let mut next = self.next_free.lock().unwrap();
        let end = next.checked_add(len)?;
        if end > self.len() as u64 {
            return None;
        }
        let addr = HostAddr(*next);
        *next = end;
        Some(addr)
    }

    /// Whether the whole of `region` lies within the arena.
    pub fn covers(&self, region: &HostRegion) -> bool {
        self.span(region.0, region.1).is_some()
    }

    fn span(&self, addr: HostAddr, len: usize) -> Option<Range<usize>> {
        let end = HostRegion(addr, len).end()?;
        if end > self.len() as u64 {
            return None;
        }
        Some(addr.0 as usize..end as usize)
    }

    /// Reads a generic value from the specified address.
    pub fn read<T: FromBytes>(&self, addr: HostAddr) -> Option<T> {
        let span = self.span(addr, size_of::<T>())?;
        let bytes = self.bytes.lock().unwrap();
        T::read_from_bytes(&bytes[span]).ok()
    }

    /// Fill `buf` from memory starting at `addr`.
    pub fn read_bytes(&self, addr: HostAddr, buf: &mut [u8]) -> bool {
        match self.span(addr, buf.len()) {
            Some(span) => {
                buf.copy_from_slice(&self.bytes.lock().unwrap()[span]);
                true
            }
            None => false,
        }
    }

    /// Writes a value to memory.
    pub fn write<T: IntoBytes + Immutable>(
        &self,
        addr: HostAddr,
        val: &T,
    ) -> bool {
        self.write_bytes(addr, val.as_bytes())
    }

    /// Writes the contents of `buf` to memory starting at `addr`.
    pub fn write_bytes(&self, addr: HostAddr, buf: &[u8]) -> bool {
        match self.span(addr, buf.len()) {
            Some(span) => {
                self.bytes.lock().unwrap()[span].copy_from_slice(buf);
                true
            }
            None => false,
        }
    }

    /// Writes `count` copies of `val` starting at `addr`.
    pub fn write_byte(&self, addr: HostAddr, val: u8, count: usize) -> bool {
        match self.span(addr, count) {
            Some(span) => {
                self.bytes.lock().unwrap()[span].fill(val);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for HostMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMem").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_is_page_aligned_and_bounded() {
        let mem = HostMem::new(4 * PAGE_SIZE);
        let a = mem.alloc(1).unwrap();
        let b = mem.alloc(PAGE_SIZE + 1).unwrap();
        assert_eq!(a, HostAddr(PAGE_SIZE as u64));
        assert_eq!(b, HostAddr(2 * PAGE_SIZE as u64));
        assert!(a.is_page_aligned() && b.is_page_aligned());

        // Only the page at address 0 remains, and it is never handed out
        assert!(mem.alloc(1).is_none());
    }

    #[test]
    fn typed_access() {
        let mem = HostMem::new(2 * PAGE_SIZE);
        let addr = HostAddr(0x10);
        assert!(mem.write(addr, &0x1122_3344_5566_7788u64));
        assert_eq!(mem.read::<u64>(addr), Some(0x1122_3344_5566_7788));
        assert_eq!(mem.read::<u16>(addr), Some(0x7788));

        let mut buf = [0u8; 2];
        assert!(mem.read_bytes(addr + 6, &mut buf));
        assert_eq!(buf, [0x22, 0x11]);
    }

    #[test]
    fn out_of_bounds() {
        let mem = HostMem::new(PAGE_SIZE);
        let last = HostAddr(PAGE_SIZE as u64 - 4);
        assert!(mem.write(last, &1u32));
        assert!(!mem.write(last, &1u64));
        assert!(mem.read::<u64>(last).is_none());
        assert!(!mem.write_byte(HostAddr(u64::MAX), 0, 2));
        assert!(!mem.covers(&HostRegion(HostAddr(0), PAGE_SIZE + 1)));
        assert!(mem.covers(&HostRegion(HostAddr(0), PAGE_SIZE)));
    }
}
