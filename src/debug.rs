// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use crate::{
    lock::SECURE_LOCK_STACK_LIMIT,
    partition::{NON_SECURE_ID, PartitionState},
    spm::DispatcherState,
};

/// True if the build is configured with debug assertions on.
pub const DEBUG: bool = cfg!(debug_assertions);

/// Checks invariants of the dispatcher which only a bug in the partition manager could break.
///
/// Does nothing unless [`DEBUG`] is set.
pub fn check_dispatcher(state: &DispatcherState) {
    if !DEBUG {
        return;
    }
    let running = state
        .db
        .secure_partitions()
        .filter(|partition| partition.runtime.state == PartitionState::Running)
        .count()
        + usize::from(state.db.state(NON_SECURE_ID) == PartitionState::Running);
    assert!(running <= 1, "{running} partitions running at once");
    assert!(
        state.lock_count <= SECURE_LOCK_STACK_LIMIT,
        "Secure lock count {} over the limit",
        state.lock_count
    );
}
