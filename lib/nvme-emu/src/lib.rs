// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A software NVMe controller.
//!
//! The [`Controller`] exposes NVMe register state to a host sharing its
//! [`mem::HostMem`], watches the doorbells from a worker thread, and
//! executes admin and NVM commands placed in the host's submission queues.

#![allow(clippy::style)]

pub extern crate usdt;

pub mod bits;
pub mod cmds;
pub mod common;
pub mod config;
pub mod firmware;
pub mod hook;
pub mod mem;
pub mod ns;
pub mod queue;
pub mod regs;
pub mod tracker;

mod admin;
mod controller;
mod ctrl;
mod dispatch;
mod nvm;


pub use config::{CtrlConfig, NamespaceConfig};
pub use controller::Controller;

use queue::QueueId;
use thiserror::Error;

/// NVMe errors
#[derive(Debug, Error)]
pub enum NvmeError {
    /// The specified Completion Queue ID did not correspond to a valid
    /// Completion Queue
    #[error("the completion queue specified ({0}) is invalid")]
    InvalidCompQueue(QueueId),

    /// The specified Submission Queue ID did not correspond to a valid
    /// Submission Queue
    #[error("the submission queue specified ({0}) is invalid")]
    InvalidSubQueue(QueueId),

    /// The specified Completion Queue ID already exists
    #[error("the completion queue specified ({0}) already exists")]
    CompQueueAlreadyExists(QueueId),

    /// The specified Submission Queue ID already exists
    #[error("the submission queue specified ({0}) already exists")]
    SubQueueAlreadyExists(QueueId),

    /// Can't delete a CQ with associated SQs
    #[error(
        "the completion queue specified ({0}) still has ({1}) associated \
        submission queue(s)"
    )]
    AssociatedSubQueuesStillExist(QueueId, usize),

    /// Failed to create Queue
    #[error("failed to create queue: {0}")]
    QueueCreateErr(#[from] queue::QueueCreateErr),

    #[error("failed to update queue: {0}")]
    QueueUpdateError(#[from] queue::QueueUpdateError),

    #[error(transparent)]
    Tracker(#[from] tracker::TrackerError),

    /// The specified Namespace ID did not correspond to a valid Namespace
    #[error("the namespace specified ({0}) is invalid")]
    InvalidNamespace(u32),

    #[error("{nlb} blocks at LBA {slba} exceed the namespace")]
    LbaOutOfRange { slba: u64, nlb: u64 },

    #[error("unsupported register access of {len} bytes at {offset:#x}")]
    InvalidRegisterAccess { offset: usize, len: usize },

    #[error("no doorbells exist for queue {0}")]
    InvalidDoorbell(QueueId),

    /// Controller cannot access host memory
    #[error("memory access inaccessible")]
    MemoryInaccessible,

    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("failed to start doorbell worker: {0}")]
    Spawn(#[source] std::io::Error),
}
