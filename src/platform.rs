// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

mod sim;

pub use sim::SimPlatform as PlatformImpl;

use crate::{
    context::ContextSwitcher,
    logger::LogSink,
    partition::{BufferShare, IsolationLevel, PartitionStaticData},
    spm::SpmConfig,
    status::Error,
};

/// Type alias for convenience, to avoid having to use the complicated type name everywhere.
pub type LogSinkImpl = <PlatformImpl as Platform>::LogSinkImpl;

pub type ContextSwitcherImpl = <PlatformImpl as Platform>::ContextSwitcherImpl;
pub type SandboxImpl = <PlatformImpl as Platform>::SandboxImpl;

/// Programs the hardware which confines a running partition to its own memory.
pub trait Sandbox {
    /// Opens the memory of the given partition to code running unprivileged.
    fn configure(&mut self, partition: &PartitionStaticData);

    /// Closes the memory of the given partition again.
    fn deconfigure(&mut self, partition: &PartitionStaticData);

    /// Makes the given buffer share region accessible to the running partition.
    fn set_share_region(&mut self, share: BufferShare) -> Result<(), Error>;
}

/// The hooks implemented by all platforms.
pub trait Platform {
    /// How strictly partitions are isolated from each other.
    const ISOLATION_LEVEL: IsolationLevel;

    /// Platform dependent LogSink implementation type for Logger.
    type LogSinkImpl: LogSink;

    /// Platform dependent switch between partition stacks.
    type ContextSwitcherImpl: ContextSwitcher;

    /// Platform dependent partition sandbox.
    type SandboxImpl: Sandbox;

    /// Initialises the logger and anything else the platform needs.
    ///
    /// Any logs sent before this is called will be ignored.
    fn init();

    /// Creates the context switcher, with the currently active stack.
    fn create_context_switcher() -> Self::ContextSwitcherImpl;

    /// Creates the driver for the isolation hardware.
    fn create_sandbox() -> Self::SandboxImpl;

    /// Returns the partition manifest and memory map of the platform.
    fn spm_config() -> SpmConfig;

    /// Stops all execution. Used when the state of the partition manager can no longer be trusted.
    fn halt() -> !;

    /// Gives up the CPU to whatever else is runnable while a partition waits for a signal.
    fn yield_now();
}
