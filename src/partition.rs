// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The partition database: what is known about each secure partition, both from the build-time
//! manifest and at runtime.

use crate::{
    context::{SavedContext, StackRegion},
    memory::{CallerMode, MemoryRegion},
    queue::{MessageQueue, Signals},
    status::Error,
};
use arrayvec::ArrayVec;
use bitflags::bitflags;
use core::fmt::{self, Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The maximum number of secure partitions in the database.
pub const MAX_PARTITIONS: usize = 7;

/// Capacity of the database: the secure partitions plus the entry standing for the non-secure
/// world.
const DB_CAPACITY: usize = MAX_PARTITIONS + 1;

/// The identity of a partition.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct PartitionId(pub u32);

/// The identity under which the non-secure world is recorded as a caller.
pub const NON_SECURE_ID: PartitionId = PartitionId(0);

impl PartitionId {
    /// Returns whether this is the non-secure sentinel.
    pub fn is_non_secure(self) -> bool {
        self == NON_SECURE_ID
    }

    /// Returns the client id reported to a service for calls from this partition. Non-secure
    /// clients are reported with a negative id.
    pub fn client_id(self) -> i32 {
        if self.is_non_secure() {
            -1
        } else {
            self.0 as i32
        }
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The lifecycle state of a partition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum PartitionState {
    #[default]
    Uninit = 0,
    Idle = 1,
    Running = 2,
    Suspended = 3,
    Blocked = 4,
    Closed = 5,
}

impl PartitionState {
    /// Returns whether a partition in this state already has a context on the call chain.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Suspended | Self::Blocked)
    }
}

/// Which memory window a running partition may currently treat as its shared buffer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum BufferShare {
    #[default]
    Disabled = 0,
    NsCode = 1,
    Scratch = 2,
    Privileged = 3,
    /// Requests the mode derived from the identity of the caller.
    Default = 4,
}

impl BufferShare {
    /// Returns the share mode a partition gets by default for a call from the given kind of
    /// caller.
    pub fn for_caller(ns_caller: bool) -> Self {
        if ns_caller { Self::NsCode } else { Self::Scratch }
    }
}

/// How strictly partitions are separated from each other.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum IsolationLevel {
    /// All partitions share one privileged stack and sandbox.
    Level1 = 1,
    /// Each partition has its own stack; the secure world is split in two sandboxes.
    Level2 = 2,
    /// Each partition has its own stack and sandbox, reprogrammed on every switch.
    Level3 = 3,
}

impl IsolationLevel {
    /// Returns whether each partition runs on its own stack.
    pub fn per_partition_stacks(self) -> bool {
        self >= Self::Level2
    }

    /// Returns whether the sandbox is reprogrammed on every partition switch.
    pub fn dynamic_sandbox(self) -> bool {
        self == Self::Level3
    }
}

bitflags! {
    /// Properties of a partition declared in its manifest.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PartitionFlags: u32 {
        /// Part of the PSA root of trust.
        const PSA_ROT = 1 << 0;
        /// Part of the application root of trust.
        const APP_ROT = 1 << 1;
        /// Serves requests through its message queue rather than by direct function calls.
        const IPC = 1 << 2;
    }
}

/// Runs once at boot to initialise a partition, returning a status.
pub type InitFn = fn() -> i32;

/// A root of trust service offered by an IPC partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServiceDesc {
    pub sid: u32,
    /// The signal raised in the partition when a message for this service arrives.
    pub signal: Signals,
    pub version: u32,
    pub non_secure_clients: bool,
}

/// The build-time manifest entry of a partition.
#[derive(Clone, Copy, Debug)]
pub struct PartitionStaticData {
    pub id: PartitionId,
    pub name: &'static str,
    pub flags: PartitionFlags,
    pub stack: StackRegion,
    /// The memory the partition may use while its sandbox is configured.
    pub sandbox: &'static [MemoryRegion],
    pub init: Option<InitFn>,
    pub services: &'static [ServiceDesc],
    /// Signals which are raised by interrupts.
    pub irq_signals: Signals,
}

impl PartitionStaticData {
    const NON_SECURE: Self = Self {
        id: NON_SECURE_ID,
        name: "non-secure",
        flags: PartitionFlags::empty(),
        stack: StackRegion::new(0, 0),
        sandbox: &[],
        init: None,
        services: &[],
        irq_signals: Signals::empty(),
    };

    /// Returns the service with the given SID, if this partition offers it.
    pub fn service(&self, sid: u32) -> Option<&ServiceDesc> {
        self.services.iter().find(|service| service.sid == sid)
    }
}

/// What changes about a partition while the system runs.
#[derive(Debug, Default)]
pub struct PartitionRuntimeData {
    pub state: PartitionState,
    /// Who invoked the partition, and so where control returns to.
    pub caller: PartitionId,
    pub ctx: SavedContext,
    /// The stack pointer to use on the next entry.
    pub stack_ptr: usize,
    pub share: BufferShare,
    /// Whether the current call was made directly by the non-secure world.
    pub ns_caller: bool,
    /// Asserted signals other than those of queued messages.
    pub signals: Signals,
    pub queue: MessageQueue,
}

/// One entry of the database.
#[derive(Debug)]
pub struct Partition {
    pub static_data: PartitionStaticData,
    pub runtime: PartitionRuntimeData,
}

impl Partition {
    fn new(static_data: PartitionStaticData) -> Self {
        Self {
            runtime: PartitionRuntimeData {
                stack_ptr: static_data.stack.top,
                ..Default::default()
            },
            static_data,
        }
    }

    /// Returns the signals the partition may wait for: those of its services and interrupts, and
    /// the doorbell.
    pub fn allowed_signals(&self) -> Signals {
        self.static_data
            .services
            .iter()
            .fold(self.static_data.irq_signals, |signals, service| {
                signals | service.signal
            })
            | Signals::DOORBELL
    }

    /// Returns all signals currently asserted for the partition.
    pub fn asserted_signals(&self) -> Signals {
        self.runtime.signals | self.runtime.queue.signal()
    }
}

/// The table of all partitions, including the entry standing for the non-secure world.
///
/// Accessors which take a [`PartitionId`] expect it to name a partition in the table; the ids come
/// from the manifest and are checked by callers before they reach here.
#[derive(Debug)]
pub struct PartitionDb {
    isolation: IsolationLevel,
    shared_stack: StackRegion,
    partitions: ArrayVec<Partition, DB_CAPACITY>,
}

impl PartitionDb {
    /// Builds the database from the manifest.
    ///
    /// Every partition starts in the `Uninit` state.
    pub fn new(
        isolation: IsolationLevel,
        shared_stack: StackRegion,
        manifest: &[PartitionStaticData],
    ) -> Result<Self, Error> {
        if manifest.len() > MAX_PARTITIONS {
            return Err(Error::InvalidParameter);
        }
        let mut partitions = ArrayVec::new();
        partitions.push(Partition::new(PartitionStaticData::NON_SECURE));
        for entry in manifest {
            if entry.id.is_non_secure()
                || partitions
                    .iter()
                    .any(|partition: &Partition| partition.static_data.id == entry.id)
            {
                return Err(Error::InvalidParameter);
            }
            partitions.push(Partition::new(*entry));
        }
        Ok(Self {
            isolation,
            shared_stack,
            partitions,
        })
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Returns whether the database has an entry with the given id.
    pub fn contains(&self, id: PartitionId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|partition| partition.static_data.id == id)
    }

    pub fn get_mut(&mut self, id: PartitionId) -> Option<&mut Partition> {
        self.partitions
            .iter_mut()
            .find(|partition| partition.static_data.id == id)
    }

    /// Returns the entry for the given partition.
    ///
    /// # Panics
    ///
    /// Panics if there is no such partition.
    pub fn partition(&self, id: PartitionId) -> &Partition {
        self.get(id)
            .unwrap_or_else(|| panic!("Unknown partition {id}"))
    }

    /// Returns the entry for the given partition mutably.
    ///
    /// # Panics
    ///
    /// Panics if there is no such partition.
    pub fn partition_mut(&mut self, id: PartitionId) -> &mut Partition {
        self.get_mut(id)
            .unwrap_or_else(|| panic!("Unknown partition {id}"))
    }

    pub fn runtime(&self, id: PartitionId) -> &PartitionRuntimeData {
        &self.partition(id).runtime
    }

    pub fn runtime_mut(&mut self, id: PartitionId) -> &mut PartitionRuntimeData {
        &mut self.partition_mut(id).runtime
    }

    /// Iterates over all secure partitions, in manifest order.
    pub fn secure_partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter().skip(1)
    }

    pub fn state(&self, id: PartitionId) -> PartitionState {
        self.runtime(id).state
    }

    pub fn set_state(&mut self, id: PartitionId, state: PartitionState) {
        self.runtime_mut(id).state = state;
    }

    pub fn caller(&self, id: PartitionId) -> PartitionId {
        self.runtime(id).caller
    }

    pub fn set_caller(&mut self, id: PartitionId, caller: PartitionId) {
        self.runtime_mut(id).caller = caller;
    }

    /// Returns the stack pointer the partition will be entered with.
    pub fn stack(&self, id: PartitionId) -> usize {
        if self.isolation.per_partition_stacks() {
            self.runtime(id).stack_ptr
        } else {
            self.shared_stack.top
        }
    }

    /// Records the stack pointer to enter the partition with. With a shared stack there is nothing
    /// to record.
    pub fn set_stack(&mut self, id: PartitionId, stack_ptr: usize) {
        if self.isolation.per_partition_stacks() {
            self.runtime_mut(id).stack_ptr = stack_ptr;
        }
    }

    pub fn stack_bottom(&self, id: PartitionId) -> usize {
        self.stack_region(id).bottom
    }

    pub fn stack_top(&self, id: PartitionId) -> usize {
        self.stack_region(id).top
    }

    /// Returns the bounds of the stack the partition runs on.
    pub fn stack_region(&self, id: PartitionId) -> StackRegion {
        if self.isolation.per_partition_stacks() {
            self.partition(id).static_data.stack
        } else {
            self.shared_stack
        }
    }

    pub fn share(&self, id: PartitionId) -> BufferShare {
        self.runtime(id).share
    }

    /// Sets the buffer share mode of the partition from a raw value, which must name one of the
    /// defined modes.
    pub fn set_share(&mut self, id: PartitionId, mode: u32) -> Result<(), Error> {
        let share = BufferShare::try_from(mode).map_err(|_| Error::InvalidParameter)?;
        self.runtime_mut(id).share = share;
        Ok(())
    }

    /// Returns how buffers named by the given partition are checked.
    ///
    /// Every partition runs privileged at level 1. Above it, only the PSA root of trust does.
    pub fn caller_mode(&self, id: PartitionId) -> CallerMode {
        if id.is_non_secure() {
            CallerMode::NonSecure
        } else if self.isolation == IsolationLevel::Level1
            || self.get(id).is_some_and(|partition| {
                partition.static_data.flags.contains(PartitionFlags::PSA_ROT)
            })
        {
            CallerMode::Privileged
        } else {
            CallerMode::Unprivileged
        }
    }

    /// Returns the partition which is currently running, if any.
    pub fn running_partition(&self) -> Option<PartitionId> {
        self.partitions
            .iter()
            .find(|partition| partition.runtime.state == PartitionState::Running)
            .map(|partition| partition.static_data.id)
    }

    /// Returns the partition which offers the service with the given SID.
    pub fn find_service(&self, sid: u32) -> Option<(PartitionId, &ServiceDesc)> {
        self.secure_partitions().find_map(|partition| {
            partition
                .static_data
                .service(sid)
                .map(|service| (partition.static_data.id, service))
        })
    }
}
