// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub use utils::errno;

pub fn get_page_size() -> Result<usize, errno::Error> {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        -1 => Err(errno::Error::last()),
        ps => Ok(ps as usize),
    }
}

/// Returns true if `value` is a multiple of `align`, which must be a power of two.
pub fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}
