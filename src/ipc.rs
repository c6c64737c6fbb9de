// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The PSA IPC primitives: the client side (connect, call, close) and the service side (wait, get,
//! read, skip, write, reply, notify, clear, eoi), built on the message queue of each partition.

use crate::{
    debug,
    memory::MemoryAccess,
    partition::{PartitionFlags, PartitionId, PartitionState, ServiceDesc},
    platform::{Platform, PlatformImpl},
    queue::{
        IoVecArray, Message, MessageHandle, MessageOrigin, MessageType, PSA_MAX_IOVEC, Signals,
    },
    spm::{DispatcherState, Spm},
    status::{
        Error, PSA_FRAMEWORK_VERSION, PSA_VERSION_NONE, SUCCESS, ServiceReturn,
        check_service_return,
    },
};
use core::num::{NonZeroU8, NonZeroU32};
use log::{debug, trace, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The number of connections which may be open at once, across all services.
pub const MAX_CONNECTIONS: usize = 8;

/// Timeout for `wait` which blocks until a signal is asserted.
pub const PSA_BLOCK: u32 = 0x8000_0000;
/// Timeout for `wait` which returns at once.
pub const PSA_POLL: u32 = 0x0;

// Keeps raw handles positive, as they are returned in the same register as negative errors.
const GENERATION_MASK: u32 = 0x007f_ffff;

/// An opaque token naming an open connection. Never zero.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct ConnectionHandle(NonZeroU32);

impl ConnectionHandle {
    fn new(slot: usize, generation: u32) -> Self {
        let slot = NonZeroU8::MIN.saturating_add(slot as u8);
        Self(NonZeroU32::from(slot) | (generation << 8))
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }

    fn slot(self) -> usize {
        usize::from(self.0.get() as u8).wrapping_sub(1)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConnectionStatus {
    /// Waiting for the service to accept the connection.
    Connecting,
    Connected,
    /// The service refused the connection, and the client hasn't seen it yet.
    Refused,
    /// Waiting for the service to handle the disconnect.
    Closing,
}

/// What a service replied to a message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Reply {
    pub status: i32,
    /// How many bytes the service wrote to each output vector.
    pub written: [usize; PSA_MAX_IOVEC],
}

#[derive(Clone, Copy, Debug)]
struct Connection {
    handle: ConnectionHandle,
    client: PartitionId,
    partition: PartitionId,
    signal: Signals,
    /// A value the service associates with the connection.
    rhandle: usize,
    status: ConnectionStatus,
    /// The reply to the last message, until the client collects it.
    reply: Option<Reply>,
    /// The message the service hasn't replied to yet.
    pending: Option<MessageHandle>,
}

/// All open connections.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: [Option<Connection>; MAX_CONNECTIONS],
    generation: u32,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(
        &mut self,
        client: PartitionId,
        partition: PartitionId,
        signal: Signals,
    ) -> Result<ConnectionHandle, Error> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ConnectionRefused)?;
        self.generation = self.generation.wrapping_add(1) & GENERATION_MASK;
        let handle = ConnectionHandle::new(index, self.generation);
        self.slots[index] = Some(Connection {
            handle,
            client,
            partition,
            signal,
            rhandle: 0,
            status: ConnectionStatus::Connecting,
            reply: None,
            pending: None,
        });
        Ok(handle)
    }

    fn get(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.slots
            .get(handle.slot())?
            .as_ref()
            .filter(|connection| connection.handle == handle)
    }

    fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        self.slots
            .get_mut(handle.slot())?
            .as_mut()
            .filter(|connection| connection.handle == handle)
    }

    /// Returns the connection if it belongs to the given client.
    fn owned_by(
        &mut self,
        handle: ConnectionHandle,
        client: PartitionId,
    ) -> Result<&mut Connection, Error> {
        self.get_mut(handle)
            .filter(|connection| connection.client == client)
            .ok_or(Error::ProgrammerError)
    }

    fn free(&mut self, handle: ConnectionHandle) {
        if let Some(slot) = self.slots.get_mut(handle.slot())
            && slot.is_some_and(|connection| connection.handle == handle)
        {
            *slot = None;
        }
    }

    /// Returns the number of open connections.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// A message as it is presented to the service which got it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct PsaMsg {
    /// One of the [`MessageType`] values.
    pub kind: i32,
    /// The raw [`MessageHandle`].
    pub handle: u32,
    pub client_id: i32,
    reserved: u32,
    pub rhandle: usize,
    pub in_size: [usize; PSA_MAX_IOVEC],
    pub out_size: [usize; PSA_MAX_IOVEC],
}

impl PsaMsg {
    fn new(handle: MessageHandle, message: &Message, rhandle: usize) -> Self {
        Self {
            kind: message.kind.into(),
            handle: handle.raw(),
            client_id: message.origin.client.client_id(),
            reserved: 0,
            rhandle,
            in_size: message.in_sizes(),
            out_size: message.out_sizes(),
        }
    }
}

/// Returns whether the client may connect to the service.
fn may_connect(client: PartitionId, service: &ServiceDesc) -> bool {
    !client.is_non_secure() || service.non_secure_clients
}

/// Makes `partition` the one whose thread is executing, taking whichever partition was running
/// before off the CPU.
fn switch_thread(state: &mut DispatcherState, partition: PartitionId) {
    if let Some(previous) = state.db.running_partition()
        && previous != partition
    {
        state.db.set_state(previous, PartitionState::Idle);
    }
    state.db.set_state(partition, PartitionState::Running);
    trace!("Switched to thread of {partition}");
    debug::check_dispatcher(state);
}

/// Returns the message with the given handle from the queue of the partition.
fn message_mut(
    state: &mut DispatcherState,
    partition: PartitionId,
    handle: MessageHandle,
) -> Result<&mut Message, Error> {
    state
        .db
        .get_mut(partition)
        .and_then(|partition| partition.runtime.queue.find_mut(handle))
        .ok_or(Error::ProgrammerError)
}

/// Returns the call message with the given handle, for access to its vectors.
fn call_message_mut(
    state: &mut DispatcherState,
    partition: PartitionId,
    handle: MessageHandle,
    index: usize,
) -> Result<&mut Message, Error> {
    if index >= PSA_MAX_IOVEC {
        return Err(Error::ProgrammerError);
    }
    let message = message_mut(state, partition, handle)?;
    if message.kind != MessageType::Call {
        return Err(Error::ProgrammerError);
    }
    Ok(message)
}

impl Spm {
    pub fn framework_version(&self) -> u32 {
        PSA_FRAMEWORK_VERSION
    }

    /// Returns the version of the service with the given SID, or `PSA_VERSION_NONE` if the client
    /// can't use it.
    pub fn version(&self, client: PartitionId, sid: u32) -> u32 {
        match self.state.lock().db.find_service(sid) {
            Some((_, service)) if may_connect(client, service) => service.version,
            _ => PSA_VERSION_NONE,
        }
    }

    /// Opens a connection to a service, queueing a connect message for it.
    ///
    /// The connection can be used once the service has accepted it, which the client learns with
    /// [`Self::take_reply`].
    pub fn connect(
        &self,
        client: PartitionId,
        sid: u32,
        version: u32,
    ) -> Result<ConnectionHandle, Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (partition, service) = state
            .db
            .find_service(sid)
            .map(|(partition, service)| (partition, *service))
            .ok_or(Error::ConnectionRefused)?;
        if !may_connect(client, &service)
            || version > service.version
            || matches!(
                state.db.state(partition),
                PartitionState::Uninit | PartitionState::Closed
            )
        {
            warn!("Connection from {client} to service {sid:#x} refused");
            return Err(Error::ConnectionRefused);
        }

        let handle = state.connections.allocate(client, partition, service.signal)?;
        let origin = MessageOrigin {
            client,
            connection: Some(handle),
        };
        let queued = state.db.runtime_mut(partition).queue.put(
            service.signal,
            MessageType::Connect,
            origin,
            IoVecArray::EMPTY,
            IoVecArray::EMPTY,
        );
        match queued {
            Ok(message) => {
                if let Some(connection) = state.connections.get_mut(handle) {
                    connection.pending = Some(message);
                }
                debug!("{client} connecting to service {sid:#x} in {partition}");
                Ok(handle)
            }
            Err(e) => {
                state.connections.free(handle);
                Err(e)
            }
        }
    }

    /// Sends a request over an open connection.
    ///
    /// Every buffer named by the vectors must be accessible to the client.
    pub fn call(
        &self,
        client: PartitionId,
        handle: ConnectionHandle,
        invec: IoVecArray,
        outvec: IoVecArray,
    ) -> Result<(), Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let connection = *state.connections.owned_by(handle, client)?;
        if connection.status != ConnectionStatus::Connected || connection.pending.is_some() {
            return Err(Error::ProgrammerError);
        }
        for (vecs, access) in [
            (invec, MemoryAccess::ReadOnly),
            (outvec, MemoryAccess::ReadWrite),
        ] {
            for vec in vecs.vecs.unwrap_or_default().iter().take(vecs.len) {
                let mode = state.db.caller_mode(client);
                state
                    .memory
                    .check_client_buffer(vec.base, vec.len, mode, access)?;
            }
        }

        let origin = MessageOrigin {
            client,
            connection: Some(handle),
        };
        let message = state.db.runtime_mut(connection.partition).queue.put(
            connection.signal,
            MessageType::Call,
            origin,
            invec,
            outvec,
        )?;
        let connection = state.connections.owned_by(handle, client)?;
        connection.pending = Some(message);
        connection.reply = None;
        Ok(())
    }

    /// Closes a connection, queueing a disconnect message for the service.
    pub fn close(&self, client: PartitionId, handle: ConnectionHandle) -> Result<(), Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let connection = *state.connections.owned_by(handle, client)?;
        match connection.status {
            ConnectionStatus::Refused => {
                state.connections.free(handle);
                return Ok(());
            }
            ConnectionStatus::Connected if connection.pending.is_none() => {}
            _ => return Err(Error::ProgrammerError),
        }

        let origin = MessageOrigin {
            client,
            connection: Some(handle),
        };
        let message = state.db.runtime_mut(connection.partition).queue.put(
            connection.signal,
            MessageType::Disconnect,
            origin,
            IoVecArray::EMPTY,
            IoVecArray::EMPTY,
        )?;
        let connection = state.connections.owned_by(handle, client)?;
        connection.status = ConnectionStatus::Closing;
        connection.pending = Some(message);
        Ok(())
    }

    /// Collects the reply to the last message sent over the connection, if there is one yet.
    ///
    /// A refused connection is freed once its reply has been collected.
    pub fn take_reply(
        &self,
        client: PartitionId,
        handle: ConnectionHandle,
    ) -> Result<Option<Reply>, Error> {
        let mut state = self.state.lock();
        let connection = state.connections.owned_by(handle, client)?;
        let reply = connection.reply.take();
        if reply.is_some() && connection.status == ConnectionStatus::Refused {
            state.connections.free(handle);
        }
        Ok(reply)
    }

    /// Waits for the reply to the last message sent over the connection.
    pub fn await_reply(
        &self,
        client: PartitionId,
        handle: ConnectionHandle,
    ) -> Result<Reply, Error> {
        loop {
            if let Some(reply) = self.take_reply(client, handle)? {
                return Ok(reply);
            }
            PlatformImpl::yield_now();
        }
    }

    /// Switches the CPU to the thread of `partition`, which is either the non-secure world or an
    /// IPC partition ready to run. Called by the scheduler of the platform, so that traps are
    /// attributed to the partition whose code raised them.
    ///
    /// Refused while a synchronous service call is in progress, as its call chain owns the CPU.
    pub fn schedule(&self, partition: PartitionId) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.lock_count != 0 {
            return Err(Error::SecureDomainLocked);
        }
        let runnable = state.db.get(partition).is_some_and(|entry| {
            (partition.is_non_secure() || entry.static_data.flags.contains(PartitionFlags::IPC))
                && matches!(
                    entry.runtime.state,
                    PartitionState::Idle | PartitionState::Running
                )
        });
        if !runnable {
            return Err(Error::InvalidParameter);
        }
        switch_thread(&mut state, partition);
        Ok(())
    }

    /// Returns which of the signals in `mask` are asserted for the partition.
    ///
    /// With a `timeout` of [`PSA_BLOCK`], the partition is blocked until one of them is. A
    /// partition which was running when it blocked is running again when this returns.
    ///
    /// The mask must include at least one signal the partition may wait for.
    pub fn wait(
        &self,
        partition: PartitionId,
        mask: Signals,
        timeout: u32,
    ) -> Result<Signals, Error> {
        let mut blocked_from = None;
        loop {
            {
                let mut state = self.state.lock();
                // A running partition can't get the CPU back from a synchronous call chain.
                let resumable =
                    blocked_from != Some(PartitionState::Running) || state.lock_count == 0;
                let entry = state
                    .db
                    .get_mut(partition)
                    .filter(|entry| entry.static_data.flags.contains(PartitionFlags::IPC))
                    .ok_or(Error::ProgrammerError)?;
                if !mask.intersects(entry.allowed_signals()) {
                    return Err(Error::ProgrammerError);
                }
                let asserted = entry.asserted_signals() & mask;
                if (!asserted.is_empty() && resumable) || timeout != PSA_BLOCK {
                    match blocked_from {
                        Some(PartitionState::Running) => switch_thread(&mut state, partition),
                        Some(previous) => state.db.set_state(partition, previous),
                        None => {}
                    }
                    return Ok(asserted);
                }
                if blocked_from.is_none() {
                    blocked_from = Some(entry.runtime.state);
                    entry.runtime.state = PartitionState::Blocked;
                }
            }
            PlatformImpl::yield_now();
        }
    }

    /// Takes the oldest message for the service with the given signal.
    pub fn get_message(
        &self,
        partition: PartitionId,
        signal: Signals,
    ) -> Result<(MessageHandle, PsaMsg), Error> {
        if !signal.is_single() {
            return Err(Error::ProgrammerError);
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state
            .db
            .get_mut(partition)
            .ok_or(Error::ProgrammerError)?;
        if !entry
            .static_data
            .services
            .iter()
            .any(|service| service.signal == signal)
            || !entry.runtime.queue.signal().contains(signal)
        {
            return Err(Error::ProgrammerError);
        }
        let (handle, message) = entry
            .runtime
            .queue
            .pop_message()
            .ok_or(Error::ProgrammerError)?;
        let rhandle = message
            .origin
            .connection
            .and_then(|connection| state.connections.get(connection))
            .map_or(0, |connection| connection.rhandle);
        Ok((handle, PsaMsg::new(handle, &message, rhandle)))
    }

    /// Associates a value with the connection the message came over.
    pub fn set_rhandle(
        &self,
        partition: PartitionId,
        handle: MessageHandle,
        rhandle: usize,
    ) -> Result<(), Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let connection = message_mut(state, partition, handle)?
            .origin
            .connection
            .ok_or(Error::ProgrammerError)?;
        state
            .connections
            .get_mut(connection)
            .ok_or(Error::ProgrammerError)?
            .rhandle = rhandle;
        Ok(())
    }

    /// Reads from an input vector of a call, continuing where the last read or skip stopped.
    ///
    /// Returns the number of bytes read, which is less than `buffer.len()` once the end of the
    /// vector is reached.
    pub fn read(
        &self,
        partition: PartitionId,
        handle: MessageHandle,
        index: usize,
        buffer: &mut [u8],
    ) -> Result<usize, Error> {
        let mut state = self.state.lock();
        let message = call_message_mut(&mut state, partition, handle, index)?;
        let Some(vec) = message.invec.get(index).copied() else {
            return Ok(0);
        };
        let consumed = message.in_consumed[index];
        let count = buffer.len().min(vec.len - consumed);
        if count == 0 {
            return Ok(0);
        }
        // SAFETY: The vector was checked to name memory the client can read when the call was
        // made, and it stays valid until the service replies.
        let source =
            unsafe { core::slice::from_raw_parts((vec.base + consumed) as *const u8, count) };
        buffer[..count].copy_from_slice(source);
        message.in_consumed[index] += count;
        Ok(count)
    }

    /// Skips over up to `count` bytes of an input vector of a call.
    ///
    /// Returns the number of bytes skipped.
    pub fn skip(
        &self,
        partition: PartitionId,
        handle: MessageHandle,
        index: usize,
        count: usize,
    ) -> Result<usize, Error> {
        let mut state = self.state.lock();
        let message = call_message_mut(&mut state, partition, handle, index)?;
        let remaining = message
            .invec
            .get(index)
            .map_or(0, |vec| vec.len - message.in_consumed[index]);
        let count = count.min(remaining);
        message.in_consumed[index] += count;
        Ok(count)
    }

    /// Appends `data` to an output vector of a call.
    ///
    /// Writing past the end of the vector is refused, and nothing is written.
    pub fn write(
        &self,
        partition: PartitionId,
        handle: MessageHandle,
        index: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        let message = call_message_mut(&mut state, partition, handle, index)?;
        if data.is_empty() {
            return Ok(());
        }
        let vec = message
            .outvec
            .get(index)
            .copied()
            .ok_or(Error::ProgrammerError)?;
        let written = message.out_written[index];
        if data.len() > vec.len - written {
            return Err(Error::ProgrammerError);
        }
        // SAFETY: The vector was checked to name memory the client can write when the call was
        // made, it stays valid until the service replies, and the range is within it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (vec.base + written) as *mut u8,
                data.len(),
            );
        }
        message.out_written[index] += data.len();
        Ok(())
    }

    /// Completes a message, passing `status` back to the client.
    pub fn reply(
        &self,
        partition: PartitionId,
        handle: MessageHandle,
        status: i32,
    ) -> Result<(), Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let message = message_mut(state, partition, handle)?;
        let kind = message.kind;
        let connection = message.origin.connection;
        let written = message.out_written;
        let accepted = match kind {
            MessageType::Connect => {
                status == SUCCESS || status == i32::from(Error::ConnectionRefused)
            }
            MessageType::Call => {
                !matches!(check_service_return(status), ServiceReturn::Reserved(_))
            }
            MessageType::Disconnect => true,
        };
        if !accepted {
            return Err(Error::ProgrammerError);
        }
        state.db.runtime_mut(partition).queue.end_of_message(handle)?;

        let Some(connection) = connection else {
            return Ok(());
        };
        if kind == MessageType::Disconnect {
            state.connections.free(connection);
            return Ok(());
        }
        if let Some(connection) = state.connections.get_mut(connection) {
            if kind == MessageType::Connect {
                connection.status = if status == SUCCESS {
                    ConnectionStatus::Connected
                } else {
                    ConnectionStatus::Refused
                };
            }
            connection.pending = None;
            connection.reply = Some(Reply { status, written });
        }
        Ok(())
    }

    /// Raises the doorbell signal of the target partition.
    pub fn notify(&self, target: PartitionId) -> Result<(), Error> {
        let mut state = self.state.lock();
        let partition = state
            .db
            .get_mut(target)
            .filter(|partition| !partition.static_data.id.is_non_secure())
            .ok_or(Error::ProgrammerError)?;
        partition.runtime.signals |= Signals::DOORBELL;
        Ok(())
    }

    /// Clears the doorbell signal of the partition, which must be raised.
    pub fn clear(&self, partition: PartitionId) -> Result<(), Error> {
        let mut state = self.state.lock();
        let runtime = &mut state
            .db
            .get_mut(partition)
            .ok_or(Error::ProgrammerError)?
            .runtime;
        if !runtime.signals.contains(Signals::DOORBELL) {
            return Err(Error::ProgrammerError);
        }
        runtime.signals.remove(Signals::DOORBELL);
        Ok(())
    }

    /// Raises an interrupt signal of the partition. Called by the platform when the interrupt
    /// fires.
    pub fn assert_irq(&self, partition: PartitionId, signal: Signals) -> Result<(), Error> {
        let mut state = self.state.lock();
        let partition = state
            .db
            .get_mut(partition)
            .filter(|partition| {
                signal.is_single() && partition.static_data.irq_signals.contains(signal)
            })
            .ok_or(Error::InvalidParameter)?;
        partition.runtime.signals |= signal;
        Ok(())
    }

    /// Acknowledges the handling of an interrupt signal, which must be raised.
    pub fn eoi(&self, partition: PartitionId, signal: Signals) -> Result<(), Error> {
        let mut state = self.state.lock();
        let partition = state
            .db
            .get_mut(partition)
            .filter(|partition| {
                signal.is_single()
                    && partition.static_data.irq_signals.contains(signal)
                    && partition.runtime.signals.contains(signal)
            })
            .ok_or(Error::ProgrammerError)?;
        partition.runtime.signals.remove(signal);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{
            AccessPermissions, MemoryMap, MemoryRegion, TrustDomain,
            tests::{S_DATA, SCRATCH, SECURE_DATA},
        },
        partition::{
            IsolationLevel, NON_SECURE_ID, PartitionStaticData,
            tests::{CRYPTO, STORAGE, partition},
        },
        queue::{IoVec, QUEUE_CAPACITY},
        spm::{
            SpmConfig,
            tests::{booted_spm, test_config},
        },
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    const SIGNAL_HASH: Signals = Signals::from_bits_retain(1 << 4);
    const SIGNAL_KEYS: Signals = Signals::from_bits_retain(1 << 5);
    const SIGNAL_TIMER: Signals = Signals::from_bits_retain(1 << 8);

    const SID_HASH: u32 = 0x80;
    const SID_KEYS: u32 = 0x81;

    static SERVICES: [ServiceDesc; 2] = [
        ServiceDesc {
            sid: SID_HASH,
            signal: SIGNAL_HASH,
            version: 2,
            non_secure_clients: true,
        },
        ServiceDesc {
            sid: SID_KEYS,
            signal: SIGNAL_KEYS,
            version: 1,
            non_secure_clients: false,
        },
    ];

    static MANIFEST: [PartitionStaticData; 2] = [
        PartitionStaticData {
            flags: PartitionFlags::PSA_ROT.union(PartitionFlags::IPC),
            services: &SERVICES,
            irq_signals: SIGNAL_TIMER,
            ..partition(CRYPTO, "crypto", 0x3000_1000)
        },
        partition(STORAGE, "storage", 0x3000_2000),
    ];

    /// Memory owned by the test, mapped as non-secure data.
    struct Arena(Vec<u8>);

    impl Arena {
        fn new() -> Self {
            Self(vec![0; 256])
        }

        fn base(&mut self) -> usize {
            self.0.as_mut_ptr() as usize
        }

        fn config(&mut self) -> SpmConfig {
            let base = self.base();
            let regions = [
                MemoryRegion::new(
                    base,
                    base + self.0.len() - 1,
                    AccessPermissions::READ_WRITE,
                    TrustDomain::NonSecureData,
                ),
                S_DATA,
            ];
            SpmConfig {
                memory_map: MemoryMap::new(&regions, SECURE_DATA, SCRATCH).unwrap(),
                partitions: &MANIFEST,
                ..test_config(IsolationLevel::Level3)
            }
        }
    }

    fn ipc_spm() -> Spm {
        booted_spm(SpmConfig {
            partitions: &MANIFEST,
            ..test_config(IsolationLevel::Level3)
        })
    }

    /// Accepts the oldest message, which must be a connect.
    fn accept(spm: &Spm, signal: Signals) -> PsaMsg {
        let (handle, msg) = spm.get_message(CRYPTO, signal).unwrap();
        assert_eq!(msg.kind, i32::from(MessageType::Connect));
        spm.reply(CRYPTO, handle, SUCCESS).unwrap();
        msg
    }

    fn connected(spm: &Spm, client: PartitionId, sid: u32, signal: Signals) -> ConnectionHandle {
        let connection = spm.connect(client, sid, 1).unwrap();
        accept(spm, signal);
        assert_eq!(
            spm.take_reply(client, connection),
            Ok(Some(Reply::default()))
        );
        connection
    }

    #[test]
    fn versions() {
        let spm = ipc_spm();
        assert_eq!(spm.framework_version(), PSA_FRAMEWORK_VERSION);
        assert_eq!(spm.version(NON_SECURE_ID, SID_HASH), 2);
        assert_eq!(spm.version(NON_SECURE_ID, SID_KEYS), PSA_VERSION_NONE);
        assert_eq!(spm.version(STORAGE, SID_KEYS), 1);
        assert_eq!(spm.version(STORAGE, 0x99), PSA_VERSION_NONE);
    }

    #[test]
    fn call_with_buffers() {
        let mut arena = Arena::new();
        arena.0[..5].copy_from_slice(b"hello");
        let spm = booted_spm(arena.config());
        let base = arena.base();

        let connection = spm.connect(NON_SECURE_ID, SID_HASH, 2).unwrap();
        assert_eq!(spm.wait(CRYPTO, SIGNAL_HASH, PSA_POLL), Ok(SIGNAL_HASH));
        let msg = accept(&spm, SIGNAL_HASH);
        assert_eq!(msg.client_id, -1);
        assert_eq!(
            spm.take_reply(NON_SECURE_ID, connection),
            Ok(Some(Reply::default()))
        );
        assert_eq!(spm.wait(CRYPTO, SIGNAL_HASH, PSA_POLL), Ok(Signals::empty()));

        let invec = [IoVec { base, len: 5 }];
        let outvec = [IoVec {
            base: base + 64,
            len: 16,
        }];
        spm.call(
            NON_SECURE_ID,
            connection,
            IoVecArray::new(&invec),
            IoVecArray::new(&outvec),
        )
        .unwrap();
        assert_eq!(spm.take_reply(NON_SECURE_ID, connection), Ok(None));

        let (handle, msg) = spm.get_message(CRYPTO, SIGNAL_HASH).unwrap();
        assert_eq!(msg.kind, i32::from(MessageType::Call));
        assert_eq!(msg.in_size, [5, 0, 0, 0]);
        assert_eq!(msg.out_size, [16, 0, 0, 0]);

        let mut buffer = [0; 3];
        assert_eq!(spm.read(CRYPTO, handle, 0, &mut buffer), Ok(3));
        assert_eq!(&buffer, b"hel");
        let mut buffer = [0; 10];
        assert_eq!(spm.read(CRYPTO, handle, 0, &mut buffer), Ok(2));
        assert_eq!(&buffer[..2], b"lo");
        assert_eq!(spm.read(CRYPTO, handle, 0, &mut buffer), Ok(0));
        assert_eq!(spm.read(CRYPTO, handle, 1, &mut buffer), Ok(0));
        assert_eq!(
            spm.read(CRYPTO, handle, PSA_MAX_IOVEC, &mut buffer),
            Err(Error::ProgrammerError)
        );

        assert_eq!(spm.write(CRYPTO, handle, 0, b"WORLD"), Ok(()));
        assert_eq!(
            spm.write(CRYPTO, handle, 0, &[0xff; 12]),
            Err(Error::ProgrammerError)
        );
        assert_eq!(spm.write(CRYPTO, handle, 1, b"x"), Err(Error::ProgrammerError));

        spm.reply(CRYPTO, handle, 0x1234).unwrap();
        assert_eq!(
            spm.take_reply(NON_SECURE_ID, connection),
            Ok(Some(Reply {
                status: 0x1234,
                written: [5, 0, 0, 0],
            }))
        );
        assert_eq!(&arena.0[64..70], b"WORLD\0");
        assert!(spm.state.lock().db.runtime(CRYPTO).queue.is_empty());
    }

    #[test]
    fn skip_input() {
        let mut arena = Arena::new();
        arena.0[..4].copy_from_slice(b"abcd");
        let spm = booted_spm(arena.config());
        let base = arena.base();
        let connection = connected(&spm, NON_SECURE_ID, SID_HASH, SIGNAL_HASH);

        let invec = [IoVec { base, len: 4 }];
        spm.call(
            NON_SECURE_ID,
            connection,
            IoVecArray::new(&invec),
            IoVecArray::EMPTY,
        )
        .unwrap();
        let (handle, _) = spm.get_message(CRYPTO, SIGNAL_HASH).unwrap();
        assert_eq!(spm.skip(CRYPTO, handle, 0, 3), Ok(3));
        let mut buffer = [0; 4];
        assert_eq!(spm.read(CRYPTO, handle, 0, &mut buffer), Ok(1));
        assert_eq!(buffer[0], b'd');
        assert_eq!(spm.skip(CRYPTO, handle, 0, 3), Ok(0));
    }

    #[test]
    fn client_buffers_are_checked() {
        let mut arena = Arena::new();
        let spm = booted_spm(arena.config());
        let connection = connected(&spm, NON_SECURE_ID, SID_HASH, SIGNAL_HASH);

        let secure = [IoVec {
            base: S_DATA.base,
            len: 16,
        }];
        assert_eq!(
            spm.call(
                NON_SECURE_ID,
                connection,
                IoVecArray::new(&secure),
                IoVecArray::EMPTY,
            ),
            Err(Error::InvalidParameter)
        );
        assert!(spm.state.lock().db.runtime(CRYPTO).queue.is_empty());

        let null = [IoVec { base: 0, len: 4 }];
        assert_eq!(
            spm.call(
                NON_SECURE_ID,
                connection,
                IoVecArray::EMPTY,
                IoVecArray::new(&null),
            ),
            Err(Error::InvalidParameter)
        );
        assert!(spm.state.lock().db.runtime(CRYPTO).queue.is_empty());
    }

    #[test]
    fn refused_connections() {
        let spm = ipc_spm();
        assert_eq!(
            spm.connect(NON_SECURE_ID, SID_KEYS, 1),
            Err(Error::ConnectionRefused)
        );
        assert_eq!(
            spm.connect(NON_SECURE_ID, SID_HASH, 3),
            Err(Error::ConnectionRefused)
        );
        assert_eq!(
            spm.connect(NON_SECURE_ID, 0x99, 1),
            Err(Error::ConnectionRefused)
        );

        let connection = spm.connect(STORAGE, SID_KEYS, 1).unwrap();
        let (handle, _) = spm.get_message(CRYPTO, SIGNAL_KEYS).unwrap();
        assert_eq!(spm.reply(CRYPTO, handle, 7), Err(Error::ProgrammerError));
        spm.reply(CRYPTO, handle, Error::ConnectionRefused.into())
            .unwrap();
        assert_eq!(
            spm.take_reply(STORAGE, connection),
            Ok(Some(Reply {
                status: Error::ConnectionRefused.into(),
                written: [0; PSA_MAX_IOVEC],
            }))
        );
        assert_eq!(spm.state.lock().connections.len(), 0);
        assert_eq!(
            spm.call(STORAGE, connection, IoVecArray::EMPTY, IoVecArray::EMPTY),
            Err(Error::ProgrammerError)
        );
    }

    #[test]
    fn connections_belong_to_their_client() {
        let spm = ipc_spm();
        let connection = connected(&spm, STORAGE, SID_KEYS, SIGNAL_KEYS);
        assert_eq!(
            spm.call(NON_SECURE_ID, connection, IoVecArray::EMPTY, IoVecArray::EMPTY),
            Err(Error::ProgrammerError)
        );
        assert_eq!(
            spm.close(NON_SECURE_ID, connection),
            Err(Error::ProgrammerError)
        );
    }

    #[test]
    fn close_connection() {
        let spm = ipc_spm();
        let connection = connected(&spm, STORAGE, SID_KEYS, SIGNAL_KEYS);
        spm.set_rhandle_for_test(connection, 0x55);

        spm.close(STORAGE, connection).unwrap();
        assert_eq!(
            spm.call(STORAGE, connection, IoVecArray::EMPTY, IoVecArray::EMPTY),
            Err(Error::ProgrammerError)
        );
        let (handle, msg) = spm.get_message(CRYPTO, SIGNAL_KEYS).unwrap();
        assert_eq!(msg.kind, i32::from(MessageType::Disconnect));
        assert_eq!(msg.rhandle, 0x55);
        assert_eq!(msg.client_id, STORAGE.client_id());
        spm.reply(CRYPTO, handle, SUCCESS).unwrap();
        assert_eq!(spm.state.lock().connections.len(), 0);
    }

    #[test]
    fn rhandle_follows_connection() {
        let spm = ipc_spm();
        let connection = spm.connect(STORAGE, SID_KEYS, 1).unwrap();
        let (handle, _) = spm.get_message(CRYPTO, SIGNAL_KEYS).unwrap();
        spm.set_rhandle(CRYPTO, handle, 0xabcd).unwrap();
        spm.reply(CRYPTO, handle, SUCCESS).unwrap();
        spm.take_reply(STORAGE, connection).unwrap();

        spm.call(STORAGE, connection, IoVecArray::EMPTY, IoVecArray::EMPTY)
            .unwrap();
        let (handle, msg) = spm.get_message(CRYPTO, SIGNAL_KEYS).unwrap();
        assert_eq!(msg.rhandle, 0xabcd);
        assert_eq!(spm.set_rhandle(STORAGE, handle, 1), Err(Error::ProgrammerError));
    }

    #[test]
    fn get_needs_single_asserted_signal() {
        let spm = ipc_spm();
        spm.connect(NON_SECURE_ID, SID_HASH, 1).unwrap();
        assert_eq!(
            spm.get_message(CRYPTO, SIGNAL_HASH | SIGNAL_KEYS).err(),
            Some(Error::ProgrammerError)
        );
        assert_eq!(
            spm.get_message(CRYPTO, SIGNAL_KEYS).err(),
            Some(Error::ProgrammerError)
        );
        assert_eq!(
            spm.get_message(CRYPTO, SIGNAL_TIMER).err(),
            Some(Error::ProgrammerError)
        );
        assert!(spm.get_message(CRYPTO, SIGNAL_HASH).is_ok());
        assert_eq!(
            spm.get_message(CRYPTO, SIGNAL_HASH).err(),
            Some(Error::ProgrammerError)
        );
    }

    #[test]
    fn full_queue_refuses_connection() {
        let spm = ipc_spm();
        for _ in 0..QUEUE_CAPACITY {
            spm.connect(NON_SECURE_ID, SID_HASH, 1).unwrap();
        }
        assert_eq!(
            spm.connect(NON_SECURE_ID, SID_HASH, 1),
            Err(Error::QueueFull)
        );
        assert_eq!(spm.state.lock().connections.len(), QUEUE_CAPACITY);
    }

    #[test]
    fn doorbell() {
        let spm = ipc_spm();
        assert_eq!(spm.clear(CRYPTO), Err(Error::ProgrammerError));
        assert_eq!(spm.notify(NON_SECURE_ID), Err(Error::ProgrammerError));
        spm.notify(CRYPTO).unwrap();
        assert_eq!(
            spm.wait(CRYPTO, Signals::DOORBELL, PSA_POLL),
            Ok(Signals::DOORBELL)
        );
        spm.clear(CRYPTO).unwrap();
        assert_eq!(
            spm.wait(CRYPTO, Signals::all(), PSA_POLL),
            Ok(Signals::empty())
        );
    }

    #[test]
    fn interrupts() {
        let spm = ipc_spm();
        assert_eq!(spm.eoi(CRYPTO, SIGNAL_TIMER), Err(Error::ProgrammerError));
        assert_eq!(
            spm.assert_irq(CRYPTO, SIGNAL_HASH),
            Err(Error::InvalidParameter)
        );
        spm.assert_irq(CRYPTO, SIGNAL_TIMER).unwrap();
        assert_eq!(spm.wait(CRYPTO, Signals::all(), PSA_POLL), Ok(SIGNAL_TIMER));
        assert_eq!(spm.eoi(CRYPTO, SIGNAL_HASH), Err(Error::ProgrammerError));
        spm.eoi(CRYPTO, SIGNAL_TIMER).unwrap();
        assert_eq!(spm.wait(CRYPTO, Signals::all(), PSA_POLL), Ok(Signals::empty()));
    }

    #[test]
    fn wait_needs_ipc_partition() {
        let spm = ipc_spm();
        assert_eq!(
            spm.wait(STORAGE, Signals::all(), PSA_POLL),
            Err(Error::ProgrammerError)
        );
    }

    #[test]
    fn wait_mask_must_name_allowed_signals() {
        let spm = ipc_spm();
        for mask in [Signals::empty(), Signals::from_bits_retain(1 << 20)] {
            for timeout in [PSA_POLL, PSA_BLOCK] {
                assert_eq!(spm.wait(CRYPTO, mask, timeout), Err(Error::ProgrammerError));
            }
        }
        assert_eq!(spm.state.lock().db.state(CRYPTO), PartitionState::Idle);
        // Signals outside the partition's set are ignored next to one inside it.
        spm.notify(CRYPTO).unwrap();
        assert_eq!(
            spm.wait(CRYPTO, Signals::DOORBELL | Signals::from_bits_retain(1 << 20), PSA_BLOCK),
            Ok(Signals::DOORBELL)
        );
    }

    #[test]
    fn messages_must_be_fetched_first() {
        let spm = ipc_spm();
        let first = spm.connect(NON_SECURE_ID, SID_HASH, 1).unwrap();
        let second = spm.connect(NON_SECURE_ID, SID_HASH, 1).unwrap();
        let pending = |connection: ConnectionHandle| {
            spm.state
                .lock()
                .connections
                .get(connection)
                .and_then(|connection| connection.pending)
                .unwrap()
        };

        let unfetched = pending(second);
        assert_eq!(spm.reply(CRYPTO, unfetched, SUCCESS), Err(Error::ProgrammerError));
        assert_eq!(spm.set_rhandle(CRYPTO, unfetched, 1), Err(Error::ProgrammerError));
        assert_eq!(spm.take_reply(NON_SECURE_ID, second), Ok(None));
        assert_eq!(spm.state.lock().db.runtime(CRYPTO).queue.len(), 2);

        let (handle, _) = spm.get_message(CRYPTO, SIGNAL_HASH).unwrap();
        assert_eq!(handle, pending(first));
        spm.reply(CRYPTO, handle, SUCCESS).unwrap();
        assert_eq!(spm.wait(CRYPTO, SIGNAL_HASH, PSA_POLL), Ok(SIGNAL_HASH));
        let (handle, _) = spm.get_message(CRYPTO, SIGNAL_HASH).unwrap();
        assert_eq!(handle, unfetched);
    }

    #[test]
    fn scheduling() {
        let spm = ipc_spm();
        let running = || spm.state.lock().db.running_partition();
        assert_eq!(running(), Some(NON_SECURE_ID));

        spm.schedule(CRYPTO).unwrap();
        assert_eq!(running(), Some(CRYPTO));
        assert_eq!(spm.state.lock().db.state(NON_SECURE_ID), PartitionState::Idle);
        // Scheduling the running thread again changes nothing.
        spm.schedule(CRYPTO).unwrap();
        assert_eq!(running(), Some(CRYPTO));

        // Only IPC partitions have threads of their own.
        assert_eq!(spm.schedule(STORAGE), Err(Error::InvalidParameter));
        assert_eq!(spm.schedule(PartitionId(0x555)), Err(Error::InvalidParameter));
        assert_eq!(running(), Some(CRYPTO));

        spm.schedule(NON_SECURE_ID).unwrap();
        assert_eq!(running(), Some(NON_SECURE_ID));
        assert_eq!(spm.state.lock().db.state(CRYPTO), PartitionState::Idle);
    }

    #[test]
    fn no_scheduling_during_service_call() {
        let spm = ipc_spm();
        spm.state.lock().lock_count = 1;
        assert_eq!(spm.schedule(CRYPTO), Err(Error::SecureDomainLocked));
        assert_eq!(spm.state.lock().db.state(CRYPTO), PartitionState::Idle);
    }

    #[test]
    fn blocking_wait() {
        let spm = ipc_spm();
        spm.schedule(CRYPTO).unwrap();
        let blocked = AtomicBool::new(false);
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| spm.wait(CRYPTO, SIGNAL_HASH, PSA_BLOCK));
            while spm.state.lock().db.state(CRYPTO) != PartitionState::Blocked {
                std::thread::yield_now();
            }
            blocked.store(true, Ordering::SeqCst);
            // Nothing runs while the service is blocked, until the non-secure thread is picked.
            assert_eq!(spm.state.lock().db.running_partition(), None);
            spm.schedule(NON_SECURE_ID).unwrap();
            spm.connect(NON_SECURE_ID, SID_HASH, 1).unwrap();
            assert_eq!(waiter.join().unwrap(), Ok(SIGNAL_HASH));
        });
        assert!(blocked.load(Ordering::SeqCst));
        let state = spm.state.lock();
        assert_eq!(state.db.state(CRYPTO), PartitionState::Running);
        assert_eq!(state.db.state(NON_SECURE_ID), PartitionState::Idle);
    }

    #[test]
    fn blocking_wait_of_unscheduled_partition() {
        let spm = ipc_spm();
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| spm.wait(CRYPTO, SIGNAL_HASH, PSA_BLOCK));
            while spm.state.lock().db.state(CRYPTO) != PartitionState::Blocked {
                std::thread::yield_now();
            }
            spm.connect(NON_SECURE_ID, SID_HASH, 1).unwrap();
            assert_eq!(waiter.join().unwrap(), Ok(SIGNAL_HASH));
        });
        assert_eq!(spm.state.lock().db.state(CRYPTO), PartitionState::Idle);
        assert_eq!(
            spm.state.lock().db.running_partition(),
            Some(NON_SECURE_ID)
        );
    }

    #[test]
    fn await_reply_from_service_thread() {
        let spm = ipc_spm();
        let connection = spm.connect(NON_SECURE_ID, SID_HASH, 1).unwrap();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                spm.wait(CRYPTO, SIGNAL_HASH, PSA_BLOCK).unwrap();
                accept(&spm, SIGNAL_HASH);
            });
            assert_eq!(
                spm.await_reply(NON_SECURE_ID, connection),
                Ok(Reply::default())
            );
        });
    }

    impl Spm {
        fn set_rhandle_for_test(&self, connection: ConnectionHandle, rhandle: usize) {
            self.state
                .lock()
                .connections
                .get_mut(connection)
                .unwrap()
                .rhandle = rhandle;
        }
    }
}
