// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Execution contexts of partitions and the hardware switch between them.

use core::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Value of xPSR in the initial frame of a service: Thumb state, nothing else.
pub const INITIAL_XPSR: usize = 0x0100_0000;

/// The size in bytes of the frame stacked by the hardware on exception entry.
///
/// This doesn't account for floating point state.
pub const TRAP_FRAME_SIZE: usize = size_of::<TrapFrame>();

/// The register frame stacked by the hardware when a trap is taken.
///
/// The layout matches the exception stack frame, so a `TrapFrame` can be read from and written to
/// the stack of the trapped context directly.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct TrapFrame {
    pub r0: usize,
    pub r1: usize,
    pub r2: usize,
    pub r3: usize,
    pub r12: usize,
    pub lr: usize,
    pub return_address: usize,
    pub xpsr: usize,
}

impl TrapFrame {
    /// Builds the frame from which a service function starts executing.
    ///
    /// The arguments are passed in R0-R3, and returning from the function branches to `exit`.
    pub fn service_entry(entry: usize, args: [usize; 4], exit: usize) -> Self {
        Self {
            r0: args[0],
            r1: args[1],
            r2: args[2],
            r3: args[3],
            r12: 0,
            lr: exit,
            return_address: entry,
            xpsr: INITIAL_XPSR,
        }
    }

    /// Returns the four argument registers.
    pub fn args(&self) -> [usize; 4] {
        [self.r0, self.r1, self.r2, self.r3]
    }

    /// Stores a status into R0, where the trapped caller expects the result.
    pub fn set_status(&mut self, status: i32) {
        // Sign extension keeps negative statuses negative when registers are wider than 32 bits.
        self.r0 = status as isize as usize;
    }

    /// Returns the status stored in R0.
    pub fn status(&self) -> i32 {
        self.r0 as i32
    }

    /// Reads the immediate operand of the Thumb `SVC` instruction which caused this trap.
    ///
    /// # Safety
    ///
    /// `return_address` must point just past a 16-bit `SVC` instruction in readable memory.
    pub unsafe fn thumb_svc_number(&self) -> u8 {
        let instruction = self.return_address - 2;
        // SAFETY: The caller guarantees that the halfword before the return address is the trapping
        // instruction, whose low byte (little-endian) is the immediate.
        unsafe { (instruction as *const u8).read_volatile() }
    }
}

/// The span of a stack, growing down from `top` towards `bottom`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StackRegion {
    pub bottom: usize,
    pub top: usize,
}

impl StackRegion {
    pub const fn new(bottom: usize, top: usize) -> Self {
        Self { bottom, top }
    }
}

/// The context of the caller of a partition, captured when the partition is entered and restored
/// when it returns.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SavedContext {
    pub psp: usize,
    pub psplim: usize,
    /// Where execution continues once the caller's context is restored.
    pub lr: usize,
}

/// Switches the active process stack between partitions.
pub trait ContextSwitcher {
    /// Address of the routine which a service function returns to. It raises the service-return
    /// trap.
    const SERVICE_EXIT: usize;

    /// Address in the dispatcher at which execution resumes after a service has returned.
    const RESUME_POINT: usize;

    /// Returns the current process stack pointer.
    fn psp(&self) -> usize;

    /// Returns the current process stack limit.
    fn psplim(&self) -> usize;

    /// Makes the given stack active.
    fn set_stack(&mut self, psp: usize, psplim: usize);

    /// Pushes `frame` below `stack.top` and makes the result the active process stack, so that the
    /// next exception return starts executing from the frame.
    ///
    /// Returns the new process stack pointer.
    fn push_frame(&mut self, stack: StackRegion, frame: &TrapFrame) -> usize;

    /// Clears any register which could leak secure state into the code about to run.
    fn scrub_registers(&mut self) {}
}
