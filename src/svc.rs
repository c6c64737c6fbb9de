// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Decoding of supervisor call traps, and their routing to the core operations.

use crate::{
    context::TrapFrame,
    ipc::{ConnectionHandle, PsaMsg},
    lock::RawSfnRequest,
    memory::{CallerMode, MemoryAccess},
    partition::{NON_SECURE_ID, PartitionId},
    queue::{IoVec, IoVecArray, MessageHandle, PSA_MAX_IOVEC, Signals},
    spm::{Spm, fatal},
    status::{Error, SUCCESS},
};
use arrayvec::ArrayVec;
use core::{mem::size_of, slice};
use log::{info, trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::FromBytes;

/// The request codes, carried as the immediate of the `SVC` instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RequestCode {
    ServiceRequest = 0x00,
    ServiceReturn = 0x01,
    ValidateSecureCaller = 0x02,
    MemoryCheck = 0x03,
    SetShareArea = 0x04,
    GetCallerClientId = 0x05,
    GetBootData = 0x06,
    Log = 0x07,

    FrameworkVersion = 0x40,
    Version = 0x41,
    Connect = 0x42,
    Call = 0x43,
    Close = 0x44,

    Wait = 0x50,
    Get = 0x51,
    SetRhandle = 0x52,
    Read = 0x53,
    Skip = 0x54,
    Write = 0x55,
    Reply = 0x56,
    Notify = 0x57,
    Clear = 0x58,
    Eoi = 0x59,
}

/// A trap to be handled.
#[derive(Debug)]
pub struct Trap<'a> {
    pub code: u8,
    /// The registers stacked when the trap was taken. The result is written back to R0.
    pub frame: &'a mut TrapFrame,
    /// The partition which raised the trap.
    pub origin: PartitionId,
}

/// Returns the `len` bytes at `ptr`.
///
/// # Safety
///
/// Unless `len` is 0, the range must have been checked against the memory map, and nothing else may
/// write to it while the slice is alive.
unsafe fn caller_bytes<'a>(ptr: usize, len: usize) -> &'a [u8] {
    if len == 0 {
        return &[];
    }
    // SAFETY: Our caller guarantees that the range is readable memory which doesn't change.
    unsafe { slice::from_raw_parts(ptr as *const u8, len) }
}

/// Returns the `len` bytes at `ptr` mutably.
///
/// # Safety
///
/// Unless `len` is 0, the range must have been checked against the memory map, and nothing else may
/// access it while the slice is alive.
unsafe fn caller_bytes_mut<'a>(ptr: usize, len: usize) -> &'a mut [u8] {
    if len == 0 {
        return &mut [];
    }
    // SAFETY: Our caller guarantees that the range is writable memory which nothing else accesses.
    unsafe { slice::from_raw_parts_mut(ptr as *mut u8, len) }
}

fn message_handle(raw: usize) -> Result<MessageHandle, Error> {
    MessageHandle::from_raw(raw as u32).ok_or(Error::ProgrammerError)
}

impl Spm {
    /// Handles the trap, writing its result to R0 of the frame.
    ///
    /// # Safety
    ///
    /// The memory map of the partition manager must describe memory which is actually mapped, as
    /// addresses taken from the frame are dereferenced once they are found in it. The partition
    /// which raised the trap must not run until this returns.
    pub unsafe fn handle_trap(&self, trap: Trap) {
        let Ok(code) = RequestCode::try_from(trap.code) else {
            warn!("Unknown request {:#04x} from {}", trap.code, trap.origin);
            trap.frame.set_status(Error::NotSupported.into());
            return;
        };
        trace!("{code:?} from {}", trap.origin);
        // SAFETY: Our caller's guarantees are passed on.
        let status = match unsafe { self.dispatch(code, trap.frame.args(), trap.origin) } {
            Ok(value) => value,
            Err(e) if e.is_fatal() => fatal(e),
            Err(e) => e.into(),
        };
        trap.frame.set_status(status);
    }

    /// Handles the trap whose stacked frame is given, on behalf of the partition which is
    /// currently executing.
    ///
    /// # Safety
    ///
    /// As for [`Self::handle_trap`]. In addition, the return address in the frame must follow the
    /// `SVC` instruction which raised the trap.
    pub unsafe fn handle_svc(&self, frame: &mut TrapFrame) {
        // SAFETY: Our caller guarantees that the return address follows the SVC instruction.
        let code = unsafe { frame.thumb_svc_number() };
        let origin = self.trap_origin();
        // SAFETY: Our caller's guarantees are passed on.
        unsafe { self.handle_trap(Trap { code, frame, origin }) };
    }

    /// # Safety
    ///
    /// As for [`Self::handle_trap`].
    unsafe fn dispatch(
        &self,
        code: RequestCode,
        [r0, r1, r2, r3]: [usize; 4],
        origin: PartitionId,
    ) -> Result<i32, Error> {
        match code {
            RequestCode::ServiceRequest => {
                let size = size_of::<RawSfnRequest>();
                {
                    // The request descriptor is built by the secure veneer, whoever the caller is.
                    let state = self.state.lock();
                    state.memory.check_client_buffer(
                        r0,
                        size,
                        CallerMode::Privileged,
                        MemoryAccess::ReadOnly,
                    )?;
                    if !state.memory.is_secure(r0, size) {
                        return Err(Error::InvalidParameter);
                    }
                }
                // SAFETY: The descriptor is in mapped secure memory, as just checked.
                let bytes = unsafe { caller_bytes(r0, size) };
                let raw =
                    RawSfnRequest::read_from_bytes(bytes).map_err(|_| Error::InvalidParameter)?;
                // SAFETY: Only the secure veneer can write secure memory, and it stores the address
                // of a service function in the descriptor.
                let request = unsafe { raw.to_request()? };
                Ok(self.request_service(&request))
            }
            RequestCode::ServiceReturn => Ok(self.service_return(r0 as i32)),
            RequestCode::ValidateSecureCaller => self.validate_secure_caller().map(|()| SUCCESS),
            RequestCode::MemoryCheck => {
                let access =
                    MemoryAccess::try_from(r2 as u32).map_err(|_| Error::InvalidParameter)?;
                self.memory_check(r0, r1, access).map(|()| SUCCESS)
            }
            RequestCode::SetShareArea => self.set_buffer_share(r0 as u32).map(|()| SUCCESS),
            RequestCode::GetCallerClientId => {
                let client_id = self.caller_client_id()?;
                self.memory_check(r0, size_of::<i32>(), MemoryAccess::ReadWrite)?;
                // SAFETY: The running service may write to the location, as just checked.
                unsafe { (r0 as *mut i32).write_unaligned(client_id) };
                Ok(SUCCESS)
            }
            RequestCode::GetBootData => {
                let major = u8::try_from(r0).map_err(|_| Error::InvalidParameter)?;
                self.memory_check(r1, r2, MemoryAccess::ReadWrite)?;
                // SAFETY: The running service may write to the buffer, as just checked, and it is
                // blocked in this trap.
                let out = unsafe { caller_bytes_mut(r1, r2) };
                self.boot_data(major, out).map(|_| SUCCESS)
            }
            RequestCode::Log => {
                self.check_caller_buffer(origin, r0, r1, MemoryAccess::ReadOnly)?;
                // SAFETY: The caller may read the buffer, as just checked, and it is blocked in
                // this trap.
                let bytes = unsafe { caller_bytes(r0, r1) };
                let text = core::str::from_utf8(bytes).map_err(|_| Error::InvalidParameter)?;
                info!("[Sec Thread] {}", text.trim_end());
                Ok(SUCCESS)
            }

            RequestCode::FrameworkVersion => Ok(self.framework_version() as i32),
            RequestCode::Version => Ok(self.version(origin, r0 as u32) as i32),
            RequestCode::Connect => {
                let connection = self.connect(origin, r0 as u32, r1 as u32)?;
                let reply = self.await_reply(origin, connection)?;
                if reply.status == SUCCESS {
                    Ok(connection.raw() as i32)
                } else {
                    Ok(reply.status)
                }
            }
            RequestCode::Call => {
                let connection =
                    ConnectionHandle::from_raw(r0 as u32).ok_or(Error::ProgrammerError)?;
                let in_len = r3 & 0xff;
                let out_len = (r3 >> 8) & 0xff;
                // SAFETY: Our caller's guarantees are passed on.
                let invec =
                    unsafe { self.caller_vecs(origin, r1, in_len, MemoryAccess::ReadOnly)? };
                // SAFETY: Our caller's guarantees are passed on.
                let outvec =
                    unsafe { self.caller_vecs(origin, r2, out_len, MemoryAccess::ReadWrite)? };
                self.call(
                    origin,
                    connection,
                    IoVecArray {
                        vecs: (r1 != 0).then_some(&invec[..]),
                        len: in_len,
                    },
                    IoVecArray {
                        vecs: (r2 != 0).then_some(&outvec[..]),
                        len: out_len,
                    },
                )?;
                let reply = self.await_reply(origin, connection)?;
                for (index, (vec, written)) in outvec.iter().zip(reply.written).enumerate() {
                    let updated = IoVec { len: written, ..*vec };
                    // SAFETY: The caller may write to the array, as checked before the call.
                    unsafe { (r2 as *mut IoVec).add(index).write_unaligned(updated) };
                }
                Ok(reply.status)
            }
            RequestCode::Close => {
                let connection =
                    ConnectionHandle::from_raw(r0 as u32).ok_or(Error::ProgrammerError)?;
                self.close(origin, connection).map(|()| SUCCESS)
            }

            RequestCode::Wait => self
                .wait(origin, Signals::from_bits_retain(r0 as u32), r1 as u32)
                .map(|signals| signals.bits() as i32),
            RequestCode::Get => {
                let size = size_of::<PsaMsg>();
                self.check_caller_buffer(origin, r1, size, MemoryAccess::ReadWrite)?;
                let (_, msg) = self.get_message(origin, Signals::from_bits_retain(r0 as u32))?;
                // SAFETY: The partition may write to the location, as just checked.
                unsafe { (r1 as *mut PsaMsg).write_unaligned(msg) };
                Ok(SUCCESS)
            }
            RequestCode::SetRhandle => self
                .set_rhandle(origin, message_handle(r0)?, r1)
                .map(|()| SUCCESS),
            RequestCode::Read => {
                let handle = message_handle(r0)?;
                self.check_caller_buffer(origin, r2, r3, MemoryAccess::ReadWrite)?;
                // SAFETY: The partition may write to the buffer, as just checked, and it is
                // blocked in this trap.
                let buffer = unsafe { caller_bytes_mut(r2, r3) };
                self.read(origin, handle, r1, buffer).map(|count| count as i32)
            }
            RequestCode::Skip => self
                .skip(origin, message_handle(r0)?, r1, r2)
                .map(|count| count as i32),
            RequestCode::Write => {
                let handle = message_handle(r0)?;
                self.check_caller_buffer(origin, r2, r3, MemoryAccess::ReadOnly)?;
                // SAFETY: The partition may read the buffer, as just checked, and it is blocked in
                // this trap.
                let data = unsafe { caller_bytes(r2, r3) };
                self.write(origin, handle, r1, data).map(|()| SUCCESS)
            }
            RequestCode::Reply => self
                .reply(origin, message_handle(r0)?, r1 as i32)
                .map(|()| SUCCESS),
            RequestCode::Notify => self.notify(PartitionId(r0 as u32)).map(|()| SUCCESS),
            RequestCode::Clear => self.clear(origin).map(|()| SUCCESS),
            RequestCode::Eoi => self
                .eoi(origin, Signals::from_bits_retain(r0 as u32))
                .map(|()| SUCCESS),
        }
    }

    /// Checks that the partition which raised a trap may access a buffer it passed in it.
    fn check_caller_buffer(
        &self,
        origin: PartitionId,
        ptr: usize,
        size: usize,
        access: MemoryAccess,
    ) -> Result<(), Error> {
        let state = self.state.lock();
        let mode = state.db.caller_mode(origin);
        state.memory.check_client_buffer(ptr, size, mode, access)
    }

    /// Copies an array of `len` vector descriptors from caller memory.
    ///
    /// # Safety
    ///
    /// As for [`Self::handle_trap`].
    unsafe fn caller_vecs(
        &self,
        origin: PartitionId,
        ptr: usize,
        len: usize,
        access: MemoryAccess,
    ) -> Result<ArrayVec<IoVec, PSA_MAX_IOVEC>, Error> {
        if ptr == 0 {
            return Ok(ArrayVec::new());
        }
        if len > PSA_MAX_IOVEC {
            return Err(Error::InvalidParameter);
        }
        let size = len * size_of::<IoVec>();
        self.check_caller_buffer(origin, ptr, size, access)?;
        Ok((0..len)
            // SAFETY: The caller may access the whole array, as just checked.
            .map(|index| unsafe { (ptr as *const IoVec).add(index).read_unaligned() })
            .collect())
    }

    /// Returns the partition whose code raised the current trap.
    fn trap_origin(&self) -> PartitionId {
        self.state
            .lock()
            .db
            .running_partition()
            .unwrap_or(NON_SECURE_ID)
    }
}

/// Handles a supervisor call. Called from the exception vector.
///
/// # Safety
///
/// `frame` must point to the frame stacked by the hardware for the trap, and its return address
/// must follow the `SVC` instruction which raised it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn spm_svc_handler(frame: *mut TrapFrame) {
    // SAFETY: Our caller guarantees that the frame is valid, and nothing else accesses it while
    // the trap is handled.
    let frame = unsafe { &mut *frame };
    // SAFETY: The memory map comes from the platform, which describes the real memory, and our
    // caller guarantees that the return address follows the SVC instruction.
    unsafe { Spm::get().handle_svc(frame) };
}
