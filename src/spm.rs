// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The secure partition manager: the dispatcher state and the interface it offers to services.

use crate::{
    boot_data::BootData,
    context::{ContextSwitcher, StackRegion},
    ipc::ConnectionTable,
    lock::{self, PopOutcome, SfnRequest},
    memory::{MemoryAccess, MemoryMap},
    partition::{
        BufferShare, IsolationLevel, MAX_PARTITIONS, NON_SECURE_ID, PartitionDb, PartitionId,
        PartitionState, PartitionStaticData,
    },
    platform::{ContextSwitcherImpl, Platform, PlatformImpl, Sandbox, SandboxImpl},
    status::{Error, ServiceReturn, check_service_return},
};
use arrayvec::ArrayVec;
use log::{debug, error, info, warn};
use spin::{Lazy, mutex::SpinMutex};

static SPM: Lazy<Spm> = Lazy::new(|| {
    PlatformImpl::init();
    let spm = Spm::new(PlatformImpl::spm_config()).unwrap_or_else(|e| fatal(e));
    if let Err(e) = spm.init_partitions() {
        // Keep going with the partitions which did initialise.
        error!("Partition initialisation failed: {e}");
    }
    spm
});

/// Stops everything after the dispatcher state was found inconsistent.
pub(crate) fn fatal(reason: Error) -> ! {
    error!("Fatal error in partition manager: {reason}");
    PlatformImpl::halt();
}

/// Everything the partition manager needs to know about the platform at boot.
#[derive(Clone, Debug)]
pub struct SpmConfig {
    pub isolation: IsolationLevel,
    pub memory_map: MemoryMap,
    pub partitions: &'static [PartitionStaticData],
    /// The stack all partitions share at isolation level 1.
    pub shared_stack: StackRegion,
}

/// All mutable state of the partition manager.
#[derive(Debug)]
pub struct DispatcherState {
    pub(crate) db: PartitionDb,
    /// The number of service calls currently nested.
    pub(crate) lock_count: usize,
    pub(crate) memory: MemoryMap,
    pub(crate) cpu: ContextSwitcherImpl,
    pub(crate) sandbox: SandboxImpl,
    pub(crate) connections: ConnectionTable,
}

impl DispatcherState {
    pub fn new(config: SpmConfig) -> Result<Self, Error> {
        Ok(Self {
            db: PartitionDb::new(config.isolation, config.shared_stack, config.partitions)?,
            lock_count: 0,
            memory: config.memory_map,
            cpu: PlatformImpl::create_context_switcher(),
            sandbox: PlatformImpl::create_sandbox(),
            connections: ConnectionTable::new(),
        })
    }

    /// Returns the secure partition which is currently running.
    fn running_secure_partition(&self) -> Option<PartitionId> {
        self.db
            .running_partition()
            .filter(|id| !id.is_non_secure())
    }
}

/// The secure partition manager.
pub struct Spm {
    pub(crate) state: SpinMutex<DispatcherState>,
    pub(crate) boot_data: SpinMutex<BootData>,
}

impl Spm {
    /// Returns a reference to the global partition manager, booting it on first use.
    pub fn get() -> &'static Self {
        &SPM
    }

    pub fn new(config: SpmConfig) -> Result<Self, Error> {
        Ok(Self {
            state: SpinMutex::new(DispatcherState::new(config)?),
            boot_data: SpinMutex::new(BootData::new()),
        })
    }

    /// Runs the init function of each partition, then lets the non-secure world run.
    ///
    /// A partition whose init function fails is closed, and never accepts calls.
    pub fn init_partitions(&self) -> Result<(), Error> {
        let partitions: ArrayVec<_, MAX_PARTITIONS> = self
            .state
            .lock()
            .db
            .secure_partitions()
            .filter(|partition| partition.runtime.state == PartitionState::Uninit)
            .map(|partition| partition.static_data)
            .collect();

        let mut failed = 0;
        for partition in &partitions {
            // The init function may call back into the partition manager, so the lock isn't held.
            let status = partition.init.map_or(0, |init| init());
            let new_state = if status == 0 {
                PartitionState::Idle
            } else {
                warn!(
                    "Partition {} ({}) failed to initialise: {status}",
                    partition.name, partition.id
                );
                failed += 1;
                PartitionState::Closed
            };
            self.state.lock().db.set_state(partition.id, new_state);
        }

        self.state
            .lock()
            .db
            .set_state(NON_SECURE_ID, PartitionState::Running);
        info!("Initialised {} partitions", partitions.len() - failed);
        if failed == 0 { Ok(()) } else { Err(Error::Generic) }
    }

    /// Calls a service function synchronously.
    ///
    /// Returns the status for the caller: whatever the service returned, or the reason the call
    /// was refused.
    pub fn request_service(&self, request: &SfnRequest) -> i32 {
        let sfn = match lock::push_lock(&mut self.state.lock(), request) {
            Ok(sfn) => sfn,
            Err(e) => {
                warn!("Call to partition {} refused: {e}", request.target);
                return e.into();
            }
        };
        debug!("Running service of partition {}", request.target);
        let value = sfn(self, request.args);
        self.service_return(value)
    }

    /// Completes the call of the running service, which returned `value`.
    ///
    /// Halts if the service returned a reserved value, or if the dispatcher state shows that no
    /// call was in progress.
    pub fn service_return(&self, value: i32) -> i32 {
        if let ServiceReturn::Reserved(value) = check_service_return(value) {
            error!("Service returned reserved value {value}");
            fatal(Error::ProgrammerError);
        }
        let outcome = lock::pop_lock(&mut self.state.lock());
        match outcome {
            Err(e) => fatal(e),
            Ok(PopOutcome {
                restored_lr: Some(lr),
                ..
            }) if lr != ContextSwitcherImpl::RESUME_POINT => fatal(Error::ContextCorrupted),
            Ok(_) => value,
        }
    }

    /// Checks whether the running service may access the `size` bytes at `ptr`.
    ///
    /// Halts if no service is running, as there is then nobody to check the access for.
    pub fn memory_check(
        &self,
        ptr: usize,
        size: usize,
        access: MemoryAccess,
    ) -> Result<(), Error> {
        let state = self.state.lock();
        let Some(running) = state.running_secure_partition() else {
            drop(state);
            fatal(Error::NoActivePartition);
        };
        let isolation = state.db.isolation();
        // Services run privileged at level 1.
        let privileged = isolation == IsolationLevel::Level1
            || state.db.share(running) == BufferShare::Privileged;
        state
            .memory
            .check_access(ptr, size, access, privileged, isolation)
    }

    /// Returns the client id of whoever called the running service.
    pub fn caller_client_id(&self) -> Result<i32, Error> {
        let state = self.state.lock();
        let running = state
            .running_secure_partition()
            .ok_or(Error::NoActivePartition)?;
        Ok(state.db.caller(running).client_id())
    }

    /// Changes which memory the running service treats as its shared buffer.
    pub fn set_buffer_share(&self, mode: u32) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.lock_count == 0 {
            return Err(Error::InvalidParameter);
        }
        let running = state
            .running_secure_partition()
            .ok_or(Error::NoActivePartition)?;
        let share = match BufferShare::try_from(mode).map_err(|_| Error::InvalidParameter)? {
            BufferShare::Default => BufferShare::for_caller(state.db.runtime(running).ns_caller),
            share @ (BufferShare::Scratch | BufferShare::NsCode) => share,
            BufferShare::Disabled | BufferShare::Privileged => return Err(Error::InvalidParameter),
        };
        if state.db.isolation().per_partition_stacks() {
            state.sandbox.set_share_region(share)?;
        }
        state.db.set_share(running, share.into())
    }

    /// Checks that the running service was called by another secure partition.
    pub fn validate_secure_caller(&self) -> Result<(), Error> {
        let state = self.state.lock();
        if state.lock_count == 0 {
            return Err(Error::InvalidParameter);
        }
        let running = state
            .running_secure_partition()
            .ok_or(Error::NoActivePartition)?;
        if state.db.runtime(running).ns_caller {
            Err(Error::Generic)
        } else {
            Ok(())
        }
    }

    /// Removes all write permissions from the region of the memory map with the given index, once
    /// whatever was loaded into it at boot must no longer change.
    pub fn lock_region(&self, index: usize) -> Result<(), Error> {
        self.state.lock().memory.make_read_only(index)?;
        info!("Memory region {index} is now read-only");
        Ok(())
    }

    /// Copies the boot data entries with the given major type to `out`.
    pub fn boot_data(&self, major: u8, out: &mut [u8]) -> Result<usize, Error> {
        self.boot_data.lock().get(major, out)
    }

    /// Stores the boot data passed on by the bootloader.
    pub fn set_boot_data(&self, blob: &[u8]) -> Result<(), Error> {
        self.boot_data.lock().set(blob)
    }
}
