// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! A secure partition manager: dispatch of calls into isolated secure partitions, the secure
//! domain lock and context switch which go with them, validation of buffers crossing the trust
//! boundary, and the PSA IPC primitives.

#![cfg_attr(not(test), no_std)]

pub mod boot_data;
pub mod context;
mod debug;
pub mod ipc;
pub mod lock;
pub mod logger;
pub mod memory;
pub mod partition;
pub mod platform;
pub mod queue;
pub mod spm;
pub mod status;
pub mod svc;

pub use crate::{
    spm::{Spm, SpmConfig},
    svc::spm_svc_handler,
};
