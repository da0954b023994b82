// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Translation of platform status codes into structured errors.

use std::fmt;

/// Raw status code returned by every platform call.
pub type HvReturn = i32;

pub const HV_SUCCESS: HvReturn = 0;
pub const HV_ERROR: HvReturn = 0xfae9_4001_u32 as HvReturn;
pub const HV_BUSY: HvReturn = 0xfae9_4002_u32 as HvReturn;
pub const HV_BAD_ARGUMENT: HvReturn = 0xfae9_4003_u32 as HvReturn;
pub const HV_NO_RESOURCES: HvReturn = 0xfae9_4005_u32 as HvReturn;
pub const HV_NO_DEVICE: HvReturn = 0xfae9_4006_u32 as HvReturn;
pub const HV_DENIED: HvReturn = 0xfae9_4007_u32 as HvReturn;
pub const HV_UNSUPPORTED: HvReturn = 0xfae9_400f_u32 as HvReturn;

/// Classification of every failure this crate reports.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// A supplied parameter violates a precondition.
    BadArgument,
    /// The platform cannot allocate the requested resource.
    Resource,
    /// The platform is transiently unable to service the call.
    Busy,
    /// The virtualization device or driver is absent.
    NoDevice,
    /// The requested capability is not present on this host.
    Unsupported,
    /// Any other native failure.
    Platform,
    /// The caller violated the VM/VCPU lifecycle contract.
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::BadArgument => "bad argument",
            ErrorKind::Resource => "resource",
            ErrorKind::Busy => "busy",
            ErrorKind::NoDevice => "no device",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Platform => "platform",
            ErrorKind::InvalidState => "invalid state",
        };
        f.write_str(name)
    }
}

/// Error value returned by every operation: kind, raw code and message.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("{} ({:#010x})", .message, .code)]
pub struct HvError {
    kind: ErrorKind,
    code: HvReturn,
    message: String,
}

pub type Result<T> = std::result::Result<T, HvError>;

impl HvError {
    /// Translates a non-success platform status code.
    pub fn from_code(code: HvReturn) -> Self {
        HvError {
            kind: kind_of(code),
            code,
            message: message_of(code).to_string(),
        }
    }

    /// Builds an error detected by this layer before reaching the platform.
    pub(crate) fn new(kind: ErrorKind, code: HvReturn, message: impl Into<String>) -> Self {
        HvError {
            kind,
            code,
            message: message.into(),
        }
    }

    pub(crate) fn bad_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadArgument, HV_BAD_ARGUMENT, message)
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, HV_ERROR, message)
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, HV_UNSUPPORTED, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> HvReturn {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Maps a platform status code to `Ok(())` or the translated error.
pub fn check(code: HvReturn) -> Result<()> {
    if code == HV_SUCCESS {
        Ok(())
    } else {
        Err(HvError::from_code(code))
    }
}

fn kind_of(code: HvReturn) -> ErrorKind {
    match code {
        HV_BUSY => ErrorKind::Busy,
        HV_BAD_ARGUMENT => ErrorKind::BadArgument,
        HV_NO_RESOURCES => ErrorKind::Resource,
        HV_NO_DEVICE => ErrorKind::NoDevice,
        HV_UNSUPPORTED => ErrorKind::Unsupported,
        _ => ErrorKind::Platform,
    }
}

fn message_of(code: HvReturn) -> &'static str {
    match code {
        HV_SUCCESS => "Success",
        HV_ERROR => "Error",
        HV_BUSY => "Busy",
        HV_BAD_ARGUMENT => "Bad argument",
        HV_NO_RESOURCES => "No resources",
        HV_NO_DEVICE => "No device",
        HV_DENIED => "Denied",
        HV_UNSUPPORTED => "Unsupported",
        _ => "Unknown",
    }
}
