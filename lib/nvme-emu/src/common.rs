// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ops::{Add, BitAnd};

/// An address within the emulated host's memory.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct HostAddr(pub u64);

impl HostAddr {
    /// Address of the `count`-th `T` past this one.
    pub fn offset<T: Sized>(&self, count: usize) -> Self {
        Self(self.0 + (count * std::mem::size_of::<T>()) as u64)
    }

    pub fn is_page_aligned(&self) -> bool {
        self.0 & PAGE_OFFSET as u64 == 0
    }
}

/// A region of host memory: base address and length in bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HostRegion(pub HostAddr, pub usize);

impl HostRegion {
    /// One past the last byte of the region, if that is representable.
    pub fn end(&self) -> Option<u64> {
        self.0 .0.checked_add(self.1 as u64)
    }
}

impl Add<usize> for HostAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs as u64)
    }
}
impl BitAnd<usize> for HostAddr {
    type Output = Self;

    fn bitand(self, rhs: usize) -> Self::Output {
        Self(self.0 & rhs as u64)
    }
}

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_OFFSET: usize = 0xfff;
pub const PAGE_MASK: usize = usize::MAX - PAGE_OFFSET;
pub const PAGE_SHIFT: usize = 12;

pub fn round_up_p2(val: usize, to: usize) -> usize {
    assert!(to.is_power_of_two());
    assert!(to != 0);

    val.checked_add(to - 1).unwrap() & !(to - 1)
}
