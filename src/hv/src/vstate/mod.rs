// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod interrupt;
pub mod memory;
pub mod vcpu;
pub mod vm;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks VM bookkeeping. The guarded data stays consistent across panics,
/// so a poisoned lock is taken over as is.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
