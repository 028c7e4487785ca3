//! Guest-visible error codes.

use axerrno::{AxError, AxResult, LinuxError};

/// Translates an engine error into the errno returned to the guest.
pub fn guest_errno(err: AxError) -> LinuxError {
    match err {
        AxError::InvalidInput | AxError::BadState | AxError::ConnectionRefused => {
            LinuxError::EINVAL
        }
        AxError::NoMemory => LinuxError::ENOSPC,
        AxError::NotFound => LinuxError::ESRCH,
        AxError::AlreadyExists => LinuxError::EEXIST,
        AxError::PermissionDenied => LinuxError::EPERM,
        AxError::Unsupported => LinuxError::ENOSYS,
        other => {
            error!("evtchn: unexpected error {:?} returned to guest", other);
            LinuxError::EINVAL
        }
    }
}

/// Hypercall return value: 0 on success, `-errno` on failure.
pub fn hypercall_status(result: AxResult) -> i64 {
    match result {
        Ok(()) => 0,
        Err(err) => -(guest_errno(err).code() as i64),
    }
}
