// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! A user-mode simulation of the secure processor, for running the partition manager on a host.

use super::{Platform, Sandbox};
use crate::{
    context::{ContextSwitcher, StackRegion, TRAP_FRAME_SIZE, TrapFrame},
    logger::{self, LockedWriter},
    memory::{AccessPermissions, AddressWindow, MemoryMap, MemoryRegion, TrustDomain},
    partition::{
        BufferShare, IsolationLevel, PartitionFlags, PartitionId, PartitionStaticData, ServiceDesc,
    },
    queue::Signals,
    spm::SpmConfig,
    status::Error,
};
use arrayvec::ArrayString;
use core::fmt::{self, Write};
use log::error;

const CONSOLE_SIZE: usize = 4096;

/// Where the non-secure world's stack is when the partition manager starts.
const NS_STACK: StackRegion = StackRegion::new(0x2803_0000, 0x2803_8000);

const SHARED_STACK: StackRegion = StackRegion::new(0x3003_0000, 0x3003_8000);

const REGIONS: [MemoryRegion; 3] = [
    MemoryRegion::new(
        0x0020_0000,
        0x003f_ffff,
        AccessPermissions::READ_ONLY,
        TrustDomain::NonSecureCode,
    ),
    MemoryRegion::new(
        0x2800_0000,
        0x2803_ffff,
        AccessPermissions::READ_WRITE,
        TrustDomain::NonSecureData,
    ),
    MemoryRegion::new(
        0x3000_0000,
        0x3003_ffff,
        AccessPermissions::READ_WRITE,
        TrustDomain::Secure,
    ),
];

const SECURE_DATA: AddressWindow = AddressWindow::new(0x3000_0000, 0x3003_ffff);
const SCRATCH: AddressWindow = AddressWindow::new(0x3002_0000, 0x3002_0fff);

const STORAGE_ID: PartitionId = PartitionId(0x100);
const CRYPTO_ID: PartitionId = PartitionId(0x101);

static MANIFEST: [PartitionStaticData; 2] = [
    PartitionStaticData {
        id: STORAGE_ID,
        name: "storage",
        flags: PartitionFlags::APP_ROT,
        stack: StackRegion::new(0x3001_0000, 0x3001_0800),
        sandbox: &[MemoryRegion::new(
            0x3001_0000,
            0x3001_07ff,
            AccessPermissions::READ_WRITE,
            TrustDomain::Secure,
        )],
        init: None,
        services: &[],
        irq_signals: Signals::empty(),
    },
    PartitionStaticData {
        id: CRYPTO_ID,
        name: "crypto",
        flags: PartitionFlags::PSA_ROT.union(PartitionFlags::IPC),
        stack: StackRegion::new(0x3001_0800, 0x3001_1000),
        sandbox: &[MemoryRegion::new(
            0x3001_0800,
            0x3001_0fff,
            AccessPermissions::READ_WRITE,
            TrustDomain::Secure,
        )],
        init: None,
        services: &[ServiceDesc {
            sid: 0x80,
            signal: Signals::from_bits_retain(1 << 4),
            version: 1,
            non_secure_clients: true,
        }],
        irq_signals: Signals::empty(),
    },
];

/// The simulated platform.
pub struct SimPlatform;

impl SimPlatform {
    // Halting normally never returns, which would make it impossible to test. The simulation panics
    // with this magic string instead, which tests can catch with `catch_unwind`.
    pub const HALT_MAGIC: &str = "HALT_MAGIC";
}

impl Platform for SimPlatform {
    const ISOLATION_LEVEL: IsolationLevel = IsolationLevel::Level3;

    type LogSinkImpl = LockedWriter<SimConsole>;
    type ContextSwitcherImpl = SimCpu;
    type SandboxImpl = SimSandbox;

    fn init() {
        // The logger may already have been set by an earlier call, which is fine.
        let _ = logger::init(LockedWriter::new(SimConsole::new()));
    }

    fn create_context_switcher() -> SimCpu {
        SimCpu::new(NS_STACK)
    }

    fn create_sandbox() -> SimSandbox {
        SimSandbox::default()
    }

    fn spm_config() -> SpmConfig {
        let memory_map = match MemoryMap::new(&REGIONS, SECURE_DATA, SCRATCH) {
            Ok(memory_map) => memory_map,
            Err(e) => {
                error!("Invalid memory map: {e}");
                Self::halt();
            }
        };
        SpmConfig {
            isolation: Self::ISOLATION_LEVEL,
            memory_map,
            partitions: &MANIFEST,
            shared_stack: SHARED_STACK,
        }
    }

    fn halt() -> ! {
        panic!("{}", Self::HALT_MAGIC);
    }

    fn yield_now() {
        #[cfg(test)]
        std::thread::yield_now();
        #[cfg(not(test))]
        core::hint::spin_loop();
    }
}

/// The console of the simulation. Keeps the most recent output in memory.
pub struct SimConsole {
    text: ArrayString<CONSOLE_SIZE>,
}

impl SimConsole {
    pub const fn new() -> Self {
        Self {
            text: ArrayString::new_const(),
        }
    }

    /// Returns what has been written since the console was last cleared.
    #[allow(unused)]
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl Write for SimConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        #[cfg(test)]
        std::print!("{s}");
        for c in s.chars() {
            if self.text.try_push(c).is_err() {
                self.text.clear();
                // A single character always fits in an empty buffer.
                let _ = self.text.try_push(c);
            }
        }
        Ok(())
    }
}

/// The simulated process stack pointer and stack limit registers.
#[derive(Debug)]
pub struct SimCpu {
    psp: usize,
    psplim: usize,
    /// The frame most recently pushed for a service to start from.
    entry_frame: Option<TrapFrame>,
    scrub_count: usize,
}

impl SimCpu {
    fn new(stack: StackRegion) -> Self {
        Self {
            psp: stack.top,
            psplim: stack.bottom,
            entry_frame: None,
            scrub_count: 0,
        }
    }

    #[cfg(test)]
    pub fn entry_frame(&self) -> Option<TrapFrame> {
        self.entry_frame
    }

    #[cfg(test)]
    pub fn scrub_count(&self) -> usize {
        self.scrub_count
    }
}

impl ContextSwitcher for SimCpu {
    const SERVICE_EXIT: usize = 0x0010_0101;
    const RESUME_POINT: usize = 0x0010_0201;

    fn psp(&self) -> usize {
        self.psp
    }

    fn psplim(&self) -> usize {
        self.psplim
    }

    fn set_stack(&mut self, psp: usize, psplim: usize) {
        self.psp = psp;
        self.psplim = psplim;
    }

    fn push_frame(&mut self, stack: StackRegion, frame: &TrapFrame) -> usize {
        self.entry_frame = Some(*frame);
        self.set_stack(stack.top - TRAP_FRAME_SIZE, stack.bottom);
        self.psp
    }

    fn scrub_registers(&mut self) {
        self.scrub_count += 1;
    }
}

/// A sandbox which records how it has been programmed.
#[derive(Debug, Default)]
pub struct SimSandbox {
    /// The partition whose memory is currently open.
    configured: Option<PartitionId>,
    /// The regions open to it.
    regions: &'static [MemoryRegion],
    configure_count: usize,
    deconfigure_count: usize,
    share: BufferShare,
}

#[cfg(test)]
impl SimSandbox {
    pub fn configured(&self) -> Option<PartitionId> {
        self.configured
    }

    pub fn regions(&self) -> &'static [MemoryRegion] {
        self.regions
    }

    pub fn configure_count(&self) -> usize {
        self.configure_count
    }

    pub fn deconfigure_count(&self) -> usize {
        self.deconfigure_count
    }

    pub fn share(&self) -> BufferShare {
        self.share
    }
}

impl Sandbox for SimSandbox {
    fn configure(&mut self, partition: &PartitionStaticData) {
        self.configured = Some(partition.id);
        self.regions = partition.sandbox;
        self.configure_count += 1;
    }

    fn deconfigure(&mut self, partition: &PartitionStaticData) {
        assert_eq!(
            self.configured,
            Some(partition.id),
            "Deconfiguring a sandbox which isn't configured"
        );
        self.configured = None;
        self.regions = &[];
        self.deconfigure_count += 1;
    }

    fn set_share_region(&mut self, share: BufferShare) -> Result<(), Error> {
        match share {
            BufferShare::Disabled | BufferShare::NsCode | BufferShare::Scratch => {
                self.share = share;
                Ok(())
            }
            BufferShare::Privileged | BufferShare::Default => Err(Error::InvalidParameter),
        }
    }
}
