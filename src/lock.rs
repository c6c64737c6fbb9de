// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The secure domain lock: the paired entry and exit of a synchronous service call, and the
//! context switch between caller and service which goes with them.

use crate::{
    context::{ContextSwitcher, SavedContext, StackRegion, TRAP_FRAME_SIZE, TrapFrame},
    debug,
    partition::{BufferShare, PartitionId, PartitionState},
    platform::{ContextSwitcherImpl, Sandbox},
    spm::{DispatcherState, Spm},
    status::Error,
};
use log::{trace, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// How many service calls may be nested.
pub const SECURE_LOCK_STACK_LIMIT: usize = 5;

/// The exception number of the context a request was trapped from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct ExcMode(pub u32);

impl ExcMode {
    pub const THREAD: Self = Self(0);
    pub const SVCALL: Self = Self(11);
}

/// The entry point of a service function. It gets the four argument words of the request.
pub type ServiceFn = fn(&Spm, [usize; 4]) -> i32;

/// A request for a synchronous call to a service function.
#[derive(Clone, Copy, Debug)]
pub struct SfnRequest {
    pub target: PartitionId,
    pub sfn: Option<ServiceFn>,
    pub args: [usize; 4],
    /// Whether the request comes straight from the non-secure world.
    pub ns_caller: bool,
    pub exc_mode: ExcMode,
}

/// A request descriptor as the secure veneer lays it out in memory.
///
/// Only integers, so that any bytes found in memory decode to some value. It must be checked with
/// [`Self::to_request`] before use.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct RawSfnRequest {
    pub target: u32,
    /// 0 or 1.
    pub ns_caller: u32,
    /// The address of the service function, or 0 for none.
    pub sfn: usize,
    pub args: [usize; 4],
    pub exc_mode: u32,
    pub reserved: u32,
}

impl RawSfnRequest {
    /// Checks the fields which have a restricted range, and converts the descriptor.
    ///
    /// # Safety
    ///
    /// A non-zero `sfn` must be the address of a function with the signature of [`ServiceFn`].
    pub unsafe fn to_request(&self) -> Result<SfnRequest, Error> {
        let ns_caller = match self.ns_caller {
            0 => false,
            1 => true,
            _ => return Err(Error::InvalidParameter),
        };
        let exc_mode = ExcMode(self.exc_mode);
        if exc_mode != ExcMode::THREAD && exc_mode != ExcMode::SVCALL {
            return Err(Error::InvalidExcMode);
        }
        let sfn = (self.sfn != 0).then(|| {
            // SAFETY: Our caller guarantees that the non-zero address is a service function.
            unsafe { core::mem::transmute::<usize, ServiceFn>(self.sfn) }
        });
        Ok(SfnRequest {
            target: PartitionId(self.target),
            sfn,
            args: self.args,
            ns_caller,
            exc_mode,
        })
    }
}

impl From<&SfnRequest> for RawSfnRequest {
    fn from(request: &SfnRequest) -> Self {
        Self {
            target: request.target.0,
            ns_caller: request.ns_caller.into(),
            sfn: request.sfn.map_or(0, |sfn| sfn as usize),
            args: request.args,
            exc_mode: request.exc_mode.0,
            reserved: 0,
        }
    }
}

/// What happened when a service call was unwound.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PopOutcome {
    /// The partition whose call completed.
    pub completed: PartitionId,
    /// The partition which is running again.
    pub return_to: PartitionId,
    /// The return address restored from the saved context, if the context was restored.
    pub restored_lr: Option<usize>,
}

/// Checks that the request was trapped from a context which may make it.
fn check_trap_context(request: &SfnRequest, lock_count: usize) -> Result<(), Error> {
    if request.exc_mode != ExcMode::THREAD && request.exc_mode != ExcMode::SVCALL {
        return Err(Error::InvalidExcMode);
    }
    if request.ns_caller {
        if request.exc_mode == ExcMode::THREAD {
            return Err(Error::NsThreadModeCall);
        }
        if lock_count != 0 {
            return Err(Error::SecureDomainLocked);
        }
    } else if request.exc_mode != ExcMode::THREAD {
        return Err(Error::InvalidExcMode);
    }
    Ok(())
}

/// Takes the secure domain lock for a call to the service named by `request`, and switches to the
/// service's context.
///
/// All checks happen before anything is changed, so on error the state is exactly as it was.
/// Returns the service function to run.
pub fn push_lock(state: &mut DispatcherState, request: &SfnRequest) -> Result<ServiceFn, Error> {
    let target = request.target;
    let sfn = match request.sfn {
        Some(sfn) if !target.is_non_secure() && state.db.contains(target) => sfn,
        _ => return Err(Error::InvalidParameter),
    };
    check_trap_context(request, state.lock_count)?;

    let caller = state
        .db
        .running_partition()
        .ok_or(Error::NotInitialized)?;
    if caller.is_non_secure() != request.ns_caller {
        return Err(Error::SecureLockFailed);
    }
    if state.lock_count >= SECURE_LOCK_STACK_LIMIT {
        return Err(Error::SecureLockFailed);
    }
    match state.db.state(target) {
        PartitionState::Idle => {}
        target_state if target_state.is_active() => return Err(Error::ServiceNonReentrant),
        _ => return Err(Error::SecureLockFailed),
    }
    let isolation = state.db.isolation();
    if isolation.per_partition_stacks() && state.db.stack(target) != state.db.stack_top(target) {
        return Err(Error::ServiceNonReentrant);
    }

    trace!("Locking secure domain for call from {caller} to {target}");
    if !caller.is_non_secure() {
        state.db.set_stack(caller, state.cpu.psp());
    }
    let ctx = SavedContext {
        psp: state.cpu.psp(),
        psplim: state.cpu.psplim(),
        lr: ContextSwitcherImpl::RESUME_POINT,
    };
    let share = BufferShare::for_caller(request.ns_caller);
    let runtime = state.db.runtime_mut(target);
    runtime.ctx = ctx;
    runtime.caller = caller;
    runtime.ns_caller = request.ns_caller;
    runtime.share = share;

    if isolation.dynamic_sandbox() {
        if !caller.is_non_secure() {
            state
                .sandbox
                .deconfigure(&state.db.partition(caller).static_data);
        }
        state
            .sandbox
            .configure(&state.db.partition(target).static_data);
    }
    if isolation.per_partition_stacks() {
        if let Err(e) = state.sandbox.set_share_region(share) {
            warn!("Failed to open share region {share:?} for {target}: {e}");
        }
    }

    if isolation.per_partition_stacks() || request.exc_mode != ExcMode::THREAD {
        let frame = TrapFrame::service_entry(
            sfn as usize,
            request.args,
            ContextSwitcherImpl::SERVICE_EXIT,
        );
        let stack = StackRegion {
            top: state.db.stack(target),
            bottom: state.db.stack_bottom(target),
        };
        state.cpu.push_frame(stack, &frame);
    }
    state.cpu.scrub_registers();

    state.db.set_state(caller, PartitionState::Blocked);
    state.db.set_state(target, PartitionState::Running);
    state.lock_count += 1;
    debug::check_dispatcher(state);
    Ok(sfn)
}

/// Releases the secure domain lock when the running service has returned, switching back to the
/// context of its caller.
///
/// Errors from this are never recoverable: they mean the dispatcher state is corrupted.
pub fn pop_lock(state: &mut DispatcherState) -> Result<PopOutcome, Error> {
    let current = state
        .db
        .running_partition()
        .filter(|id| !id.is_non_secure())
        .ok_or(Error::SecureUnlockFailed)?;
    if state.lock_count == 0 {
        return Err(Error::SecureUnlockFailed);
    }
    let return_to = state.db.caller(current);
    if state.db.state(return_to) != PartitionState::Blocked {
        return Err(Error::ContextCorrupted);
    }

    trace!("Unlocking secure domain on return from {current} to {return_to}");
    state.lock_count -= 1;
    let isolation = state.db.isolation();
    if isolation.dynamic_sandbox() {
        state
            .sandbox
            .deconfigure(&state.db.partition(current).static_data);
        if !return_to.is_non_secure() {
            state
                .sandbox
                .configure(&state.db.partition(return_to).static_data);
            let share = state.db.share(return_to);
            if let Err(e) = state.sandbox.set_share_region(share) {
                warn!("Failed to restore share region {share:?} for {return_to}: {e}");
            }
        }
    }

    let runtime = state.db.runtime(current);
    let ctx = runtime.ctx;
    let restore = isolation.per_partition_stacks() || runtime.ns_caller;
    if isolation.per_partition_stacks() {
        // Discard the frame of the return trap along with everything the service left below it.
        let psp = state.cpu.psp() + TRAP_FRAME_SIZE;
        state.db.set_stack(current, psp);
    }
    let restored_lr = if restore {
        state.cpu.set_stack(ctx.psp, ctx.psplim);
        Some(ctx.lr)
    } else {
        None
    };

    let runtime = state.db.runtime_mut(current);
    runtime.ctx = SavedContext::default();
    runtime.ns_caller = false;
    state.db.set_state(current, PartitionState::Idle);
    state.db.set_state(return_to, PartitionState::Running);
    debug::check_dispatcher(state);
    Ok(PopOutcome {
        completed: current,
        return_to,
        restored_lr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        partition::{
            IsolationLevel, NON_SECURE_ID,
            tests::{CRYPTO, STORAGE},
        },
        spm::tests::booted_state,
    };

    fn service(_spm: &Spm, _args: [usize; 4]) -> i32 {
        0
    }

    fn ns_request(target: PartitionId) -> SfnRequest {
        SfnRequest {
            target,
            sfn: Some(service),
            args: [1, 2, 3, 4],
            ns_caller: true,
            exc_mode: ExcMode::SVCALL,
        }
    }

    fn secure_request(target: PartitionId) -> SfnRequest {
        SfnRequest {
            ns_caller: false,
            exc_mode: ExcMode::THREAD,
            ..ns_request(target)
        }
    }

    fn states(state: &DispatcherState) -> [PartitionState; 3] {
        [
            state.db.state(NON_SECURE_ID),
            state.db.state(CRYPTO),
            state.db.state(STORAGE),
        ]
    }

    fn running_count(state: &DispatcherState) -> usize {
        states(state)
            .iter()
            .filter(|&&partition_state| partition_state == PartitionState::Running)
            .count()
    }

    #[test]
    fn raw_descriptors() {
        let request = ns_request(CRYPTO);
        let raw = RawSfnRequest::from(&request);
        assert_eq!(raw.target, CRYPTO.0);
        assert_eq!(raw.ns_caller, 1);
        // SAFETY: The descriptor was built from a real service function.
        let decoded = unsafe { raw.to_request() }.unwrap();
        assert_eq!(decoded.target, CRYPTO);
        assert_eq!(decoded.args, [1, 2, 3, 4]);
        assert!(decoded.ns_caller);
        assert_eq!(decoded.exc_mode, ExcMode::SVCALL);
        assert_eq!(decoded.sfn.map(|sfn| sfn as usize), Some(service as usize));

        let no_function = RawSfnRequest { sfn: 0, ..raw };
        // SAFETY: There is no function to call.
        assert!(unsafe { no_function.to_request() }.unwrap().sfn.is_none());

        let bad_flag = RawSfnRequest {
            ns_caller: 2,
            ..raw
        };
        // SAFETY: The function address is that of a real service function.
        assert_eq!(
            unsafe { bad_flag.to_request() }.err(),
            Some(Error::InvalidParameter)
        );
        let bad_mode = RawSfnRequest {
            exc_mode: 3,
            ..raw
        };
        // SAFETY: The function address is that of a real service function.
        assert_eq!(
            unsafe { bad_mode.to_request() }.err(),
            Some(Error::InvalidExcMode)
        );
    }

    #[test]
    fn malformed_requests() {
        let mut state = booted_state(IsolationLevel::Level3);
        let before = states(&state);

        let no_function = SfnRequest {
            sfn: None,
            ..ns_request(CRYPTO)
        };
        assert_eq!(
            push_lock(&mut state, &no_function).err(),
            Some(Error::InvalidParameter)
        );
        assert_eq!(
            push_lock(&mut state, &ns_request(NON_SECURE_ID)).err(),
            Some(Error::InvalidParameter)
        );
        assert_eq!(
            push_lock(&mut state, &ns_request(PartitionId(0x555))).err(),
            Some(Error::InvalidParameter)
        );
        assert_eq!(states(&state), before);
        assert_eq!(state.lock_count, 0);
    }

    #[test]
    fn trap_context_rules() {
        let mut state = booted_state(IsolationLevel::Level3);

        let bad_mode = SfnRequest {
            exc_mode: ExcMode(3),
            ..ns_request(CRYPTO)
        };
        assert_eq!(
            push_lock(&mut state, &bad_mode).err(),
            Some(Error::InvalidExcMode)
        );

        let thread_mode = SfnRequest {
            exc_mode: ExcMode::THREAD,
            ..ns_request(CRYPTO)
        };
        assert_eq!(
            push_lock(&mut state, &thread_mode).err(),
            Some(Error::NsThreadModeCall)
        );

        let secure_handler = SfnRequest {
            exc_mode: ExcMode::SVCALL,
            ..secure_request(CRYPTO)
        };
        assert_eq!(
            push_lock(&mut state, &secure_handler).err(),
            Some(Error::InvalidExcMode)
        );

        // The non-secure world is running, so a request claiming a secure caller is inconsistent.
        assert_eq!(
            push_lock(&mut state, &secure_request(CRYPTO)).err(),
            Some(Error::SecureLockFailed)
        );
        assert_eq!(state.lock_count, 0);
        assert_eq!(state.db.running_partition(), Some(NON_SECURE_ID));
    }

    #[test]
    fn call_from_non_secure() {
        let mut state = booted_state(IsolationLevel::Level3);
        let ns_psp = state.cpu.psp();

        assert!(push_lock(&mut state, &ns_request(CRYPTO)).is_ok());
        assert_eq!(state.lock_count, 1);
        assert_eq!(state.db.state(NON_SECURE_ID), PartitionState::Blocked);
        assert_eq!(state.db.state(CRYPTO), PartitionState::Running);
        assert_eq!(state.db.caller(CRYPTO), NON_SECURE_ID);
        assert_eq!(state.db.share(CRYPTO), BufferShare::NsCode);
        assert_eq!(state.sandbox.configured(), Some(CRYPTO));
        assert_eq!(state.sandbox.share(), BufferShare::NsCode);
        assert_eq!(state.db.runtime(CRYPTO).ctx.psp, ns_psp);
        assert_eq!(state.cpu.psp(), state.db.stack_top(CRYPTO) - TRAP_FRAME_SIZE);
        assert_eq!(state.cpu.scrub_count(), 1);
        let frame = state.cpu.entry_frame().unwrap();
        assert_eq!(frame.args(), [1, 2, 3, 4]);
        assert_eq!(frame.lr, ContextSwitcherImpl::SERVICE_EXIT);

        let outcome = pop_lock(&mut state).unwrap();
        assert_eq!(
            outcome,
            PopOutcome {
                completed: CRYPTO,
                return_to: NON_SECURE_ID,
                restored_lr: Some(ContextSwitcherImpl::RESUME_POINT),
            }
        );
        assert_eq!(state.lock_count, 0);
        assert_eq!(state.cpu.psp(), ns_psp);
        assert_eq!(state.db.stack(CRYPTO), state.db.stack_top(CRYPTO));
        assert_eq!(state.db.runtime(CRYPTO).ctx, SavedContext::default());
        assert_eq!(state.sandbox.configured(), None);
        assert_eq!(state.db.state(CRYPTO), PartitionState::Idle);
        assert_eq!(state.db.state(NON_SECURE_ID), PartitionState::Running);
    }

    #[test]
    fn nested_calls_unwind_in_order() {
        let mut state = booted_state(IsolationLevel::Level3);
        let initial = states(&state);

        push_lock(&mut state, &ns_request(CRYPTO)).unwrap();
        assert_eq!(running_count(&state), 1);
        let crypto_psp = state.cpu.psp();

        push_lock(&mut state, &secure_request(STORAGE)).unwrap();
        assert_eq!(running_count(&state), 1);
        assert_eq!(state.lock_count, 2);
        assert_eq!(state.db.state(CRYPTO), PartitionState::Blocked);
        assert_eq!(state.db.stack(CRYPTO), crypto_psp);
        assert_eq!(state.db.share(STORAGE), BufferShare::Scratch);
        assert_eq!(state.sandbox.configured(), Some(STORAGE));

        let outcome = pop_lock(&mut state).unwrap();
        assert_eq!(outcome.completed, STORAGE);
        assert_eq!(outcome.return_to, CRYPTO);
        assert_eq!(running_count(&state), 1);
        assert_eq!(state.cpu.psp(), crypto_psp);
        assert_eq!(state.sandbox.configured(), Some(CRYPTO));
        assert_eq!(state.sandbox.share(), BufferShare::NsCode);

        let outcome = pop_lock(&mut state).unwrap();
        assert_eq!(outcome.return_to, NON_SECURE_ID);
        assert_eq!(states(&state), initial);
        assert_eq!(state.lock_count, 0);
        assert_eq!(state.sandbox.configure_count(), 3);
        assert_eq!(state.sandbox.deconfigure_count(), 3);
    }

    #[test]
    fn recursion_is_rejected() {
        let mut state = booted_state(IsolationLevel::Level3);
        push_lock(&mut state, &ns_request(CRYPTO)).unwrap();
        let before = states(&state);

        // A running service calling itself.
        assert_eq!(
            push_lock(&mut state, &secure_request(CRYPTO)).err(),
            Some(Error::ServiceNonReentrant)
        );
        assert_eq!(state.db.state(CRYPTO), PartitionState::Running);
        assert_eq!(state.lock_count, 1);

        // A blocked service further up the chain.
        push_lock(&mut state, &secure_request(STORAGE)).unwrap();
        assert_eq!(
            push_lock(&mut state, &secure_request(CRYPTO)).err(),
            Some(Error::ServiceNonReentrant)
        );
        assert_eq!(state.lock_count, 2);
        pop_lock(&mut state).unwrap();
        assert_eq!(states(&state), before);

        // A suspended service.
        state.db.set_state(STORAGE, PartitionState::Suspended);
        assert_eq!(
            push_lock(&mut state, &secure_request(STORAGE)).err(),
            Some(Error::ServiceNonReentrant)
        );
        assert_eq!(state.db.state(STORAGE), PartitionState::Suspended);
        assert_eq!(state.lock_count, 1);
    }

    #[test]
    fn target_must_be_idle() {
        let mut state = booted_state(IsolationLevel::Level3);
        state.db.set_state(STORAGE, PartitionState::Closed);
        assert_eq!(
            push_lock(&mut state, &ns_request(STORAGE)).err(),
            Some(Error::SecureLockFailed)
        );
        state.db.set_state(STORAGE, PartitionState::Uninit);
        assert_eq!(
            push_lock(&mut state, &ns_request(STORAGE)).err(),
            Some(Error::SecureLockFailed)
        );
    }

    #[test]
    fn stale_stack_is_rejected() {
        let mut state = booted_state(IsolationLevel::Level2);
        let top = state.db.stack_top(STORAGE);
        state.db.set_stack(STORAGE, top - 0x40);
        assert_eq!(
            push_lock(&mut state, &ns_request(STORAGE)).err(),
            Some(Error::ServiceNonReentrant)
        );
        assert_eq!(state.db.state(STORAGE), PartitionState::Idle);
    }

    #[test]
    fn non_secure_call_while_locked() {
        let mut state = booted_state(IsolationLevel::Level3);
        push_lock(&mut state, &ns_request(CRYPTO)).unwrap();
        let before = states(&state);
        let psp = state.cpu.psp();

        assert_eq!(
            push_lock(&mut state, &ns_request(STORAGE)).err(),
            Some(Error::SecureDomainLocked)
        );
        assert_eq!(states(&state), before);
        assert_eq!(state.lock_count, 1);
        assert_eq!(state.cpu.psp(), psp);
        assert_eq!(state.sandbox.configured(), Some(CRYPTO));
    }

    #[test]
    fn nesting_is_bounded() {
        let mut state = booted_state(IsolationLevel::Level3);
        push_lock(&mut state, &ns_request(CRYPTO)).unwrap();
        state.lock_count = SECURE_LOCK_STACK_LIMIT;
        assert_eq!(
            push_lock(&mut state, &secure_request(STORAGE)).err(),
            Some(Error::SecureLockFailed)
        );
        assert_eq!(state.db.state(STORAGE), PartitionState::Idle);
    }

    #[test]
    fn shared_stack_restores_only_for_non_secure() {
        let mut state = booted_state(IsolationLevel::Level1);
        let ns_psp = state.cpu.psp();

        push_lock(&mut state, &ns_request(CRYPTO)).unwrap();
        // Handler mode entry gets a frame on the shared stack.
        assert_eq!(state.cpu.entry_frame().unwrap().args(), [1, 2, 3, 4]);
        let shared_psp = state.cpu.psp();
        assert_eq!(shared_psp, state.db.stack_top(CRYPTO) - TRAP_FRAME_SIZE);
        assert_eq!(state.sandbox.configure_count(), 0);

        // Thread mode calls between services run on the same stack.
        push_lock(&mut state, &secure_request(STORAGE)).unwrap();
        assert_eq!(state.cpu.psp(), shared_psp);
        let outcome = pop_lock(&mut state).unwrap();
        assert_eq!(outcome.restored_lr, None);
        assert_eq!(state.cpu.psp(), shared_psp);

        let outcome = pop_lock(&mut state).unwrap();
        assert_eq!(outcome.restored_lr, Some(ContextSwitcherImpl::RESUME_POINT));
        assert_eq!(state.cpu.psp(), ns_psp);
        assert_eq!(state.lock_count, 0);
    }

    #[test]
    fn pop_without_lock() {
        let mut state = booted_state(IsolationLevel::Level3);
        assert_eq!(pop_lock(&mut state).err(), Some(Error::SecureUnlockFailed));

        state.db.set_state(NON_SECURE_ID, PartitionState::Idle);
        assert_eq!(pop_lock(&mut state).err(), Some(Error::SecureUnlockFailed));
    }

    #[test]
    fn pop_to_caller_which_is_not_blocked() {
        let mut state = booted_state(IsolationLevel::Level3);
        push_lock(&mut state, &ns_request(CRYPTO)).unwrap();
        state.db.set_state(NON_SECURE_ID, PartitionState::Idle);
        assert_eq!(pop_lock(&mut state).err(), Some(Error::ContextCorrupted));
    }
}
