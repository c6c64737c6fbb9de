// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The bounded FIFO of pending IPC messages of a partition.

use crate::{ipc::ConnectionHandle, partition::PartitionId, status::Error};
use arrayvec::ArrayVec;
use bitflags::bitflags;
use core::num::{NonZeroU8, NonZeroU32};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The number of messages a partition can have in flight.
pub const QUEUE_CAPACITY: usize = 5;

/// The maximum number of input or output vectors of a message.
pub const PSA_MAX_IOVEC: usize = 4;

const GENERATION_MASK: u32 = 0x00ff_ffff;

bitflags! {
    /// A set of signals of a partition.
    ///
    /// Apart from the few signals defined by the framework, the meaning of each bit is given by the
    /// partition's manifest.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct Signals: u32 {
        /// Raised by `notify` from another partition.
        const DOORBELL = 1 << 3;

        const _ = !0;
    }
}

impl Signals {
    /// Returns whether exactly one signal is in the set.
    pub fn is_single(self) -> bool {
        self.bits().count_ones() == 1
    }
}

/// A buffer descriptor passed by a client, as laid out in client memory.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct IoVec {
    pub base: usize,
    pub len: usize,
}

/// An array of buffer descriptors together with the length the client claims for it.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoVecArray<'a> {
    pub vecs: Option<&'a [IoVec]>,
    pub len: usize,
}

impl<'a> IoVecArray<'a> {
    pub const EMPTY: Self = Self { vecs: None, len: 0 };

    /// Wraps a whole slice of descriptors.
    pub fn new(vecs: &'a [IoVec]) -> Self {
        if vecs.is_empty() {
            Self::EMPTY
        } else {
            Self {
                vecs: Some(vecs),
                len: vecs.len(),
            }
        }
    }

    /// Checks the array and copies its descriptors.
    fn collect(self) -> Result<ArrayVec<IoVec, PSA_MAX_IOVEC>, Error> {
        match (self.vecs, self.len) {
            (None, 0) => Ok(ArrayVec::new()),
            (None, _) | (Some(_), 0) => Err(Error::InvalidParameter),
            (Some(vecs), len) => {
                if len > PSA_MAX_IOVEC {
                    return Err(Error::InvalidParameter);
                }
                let vecs = vecs.get(..len).ok_or(Error::InvalidParameter)?;
                if vecs.iter().any(|vec| vec.base == 0 && vec.len != 0) {
                    return Err(Error::InvalidParameter);
                }
                Ok(vecs.iter().copied().collect())
            }
        }
    }
}

/// The kind of a message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum MessageType {
    Connect = -1,
    #[default]
    Call = 0,
    Disconnect = -2,
}

/// An opaque token naming a queued message. Never zero.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct MessageHandle(NonZeroU32);

impl MessageHandle {
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

/// Who a message comes from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MessageOrigin {
    pub client: PartitionId,
    pub connection: Option<ConnectionHandle>,
}

/// The body of a message. The buffers named by the vectors stay owned by the client.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Message {
    pub signal: Signals,
    pub kind: MessageType,
    pub origin: MessageOrigin,
    pub invec: ArrayVec<IoVec, PSA_MAX_IOVEC>,
    pub outvec: ArrayVec<IoVec, PSA_MAX_IOVEC>,
    /// How many bytes of each input vector the service has read or skipped.
    pub in_consumed: [usize; PSA_MAX_IOVEC],
    /// How many bytes the service has written to each output vector.
    pub out_written: [usize; PSA_MAX_IOVEC],
}

impl Message {
    /// Returns the sizes of the input vectors.
    pub fn in_sizes(&self) -> [usize; PSA_MAX_IOVEC] {
        sizes(&self.invec)
    }

    /// Returns the sizes of the output vectors.
    pub fn out_sizes(&self) -> [usize; PSA_MAX_IOVEC] {
        sizes(&self.outvec)
    }
}

fn sizes(vecs: &[IoVec]) -> [usize; PSA_MAX_IOVEC] {
    let mut sizes = [0; PSA_MAX_IOVEC];
    for (size, vec) in sizes.iter_mut().zip(vecs) {
        *size = vec.len;
    }
    sizes
}

#[derive(Debug, Default)]
struct Slot {
    handle: Option<MessageHandle>,
    /// Whether the message has been popped by the service.
    delivered: bool,
    message: Message,
}

/// A ring of message slots, consumed in the order they were filled.
///
/// A slot stays allocated after its message is popped, until the service ends the message.
#[derive(Debug, Default)]
pub struct MessageQueue {
    slots: [Slot; QUEUE_CAPACITY],
    producer: usize,
    consumer: usize,
    generation: u32,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frees all slots and rewinds both cursors.
    pub fn init(&mut self) {
        *self = Self::new();
    }

    /// Queues a message, copying the vector descriptors but not the data they describe.
    pub fn put(
        &mut self,
        signal: Signals,
        kind: MessageType,
        origin: MessageOrigin,
        invec: IoVecArray,
        outvec: IoVecArray,
    ) -> Result<MessageHandle, Error> {
        if self.slots[self.producer].handle.is_some() {
            return Err(Error::QueueFull);
        }
        let invec = invec.collect()?;
        let outvec = outvec.collect()?;

        self.generation = self.generation.wrapping_add(1) & GENERATION_MASK;
        let handle = MessageHandle::new(self.producer, self.generation);
        self.slots[self.producer] = Slot {
            handle: Some(handle),
            delivered: false,
            message: Message {
                signal,
                kind,
                origin,
                invec,
                outvec,
                ..Default::default()
            },
        };
        self.producer = (self.producer + 1) % QUEUE_CAPACITY;
        Ok(handle)
    }

    /// Returns the signal of the oldest message not yet popped, or no signal if there is none.
    pub fn signal(&self) -> Signals {
        let slot = &self.slots[self.consumer];
        if slot.handle.is_some() && !slot.delivered {
            slot.message.signal
        } else {
            Signals::empty()
        }
    }

    /// Takes a copy of the oldest message not yet popped.
    ///
    /// The slot stays allocated until [`Self::end_of_message`] is called for it.
    pub fn pop_message(&mut self) -> Option<(MessageHandle, Message)> {
        let slot = &mut self.slots[self.consumer];
        let handle = slot.handle?;
        if slot.delivered {
            return None;
        }
        slot.delivered = true;
        let message = slot.message.clone();
        self.consumer = (self.consumer + 1) % QUEUE_CAPACITY;
        Some((handle, message))
    }

    /// Returns the slot holding the message with the given handle, once the service has popped it.
    fn delivered_slot(&mut self, handle: MessageHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.slot())
            .filter(|slot| slot.delivered && slot.handle == Some(handle))
    }

    /// Returns the message with the given handle, if the service has popped it and not yet ended
    /// it.
    pub fn find(&self, handle: MessageHandle) -> Option<&Message> {
        let slot = self.slots.get(handle.slot())?;
        (slot.delivered && slot.handle == Some(handle)).then_some(&slot.message)
    }

    pub fn find_mut(&mut self, handle: MessageHandle) -> Option<&mut Message> {
        self.delivered_slot(handle).map(|slot| &mut slot.message)
    }

    /// Frees the slot of the given popped message, returning its body.
    pub fn end_of_message(&mut self, handle: MessageHandle) -> Result<Message, Error> {
        let slot = self
            .delivered_slot(handle)
            .ok_or(Error::InvalidParameter)?;
        let message = core::mem::take(&mut slot.message);
        slot.handle = None;
        slot.delivered = false;
        Ok(message)
    }

    /// Returns the number of allocated slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.handle.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
