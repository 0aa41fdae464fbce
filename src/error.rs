//! The recorder's error taxonomy: transient, recoverable, and fatal.
//!
//! A tick never propagates a raw `windows::core::Error`; it is classified
//! first against the closed sets of HRESULTs this module defines, matching
//! the duplication/acquire-frame failure modes a capture session actually
//! produces.

use windows::Win32::Foundation::{
    E_ACCESSDENIED, E_INVALIDARG, E_OUTOFMEMORY, WAIT_ABANDONED, WAIT_TIMEOUT,
};
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_ACCESS_DENIED, DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_DEVICE_REMOVED,
    DXGI_ERROR_DEVICE_RESET, DXGI_ERROR_INVALID_CALL, DXGI_ERROR_SESSION_DISCONNECTED,
    DXGI_ERROR_UNSUPPORTED, DXGI_ERROR_WAIT_TIMEOUT, DXGI_STATUS_OCCLUDED,
};
use windows::core::{Error as WinError, HRESULT};

/// Top-level result alias used by every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, RecorderError>;

/// The recorder's error taxonomy, per the capture-pipeline's recovery policy.
///
/// `Transient` and `Recoverable` both preserve the tick loop: a transient
/// error means "try again next tick", a recoverable error means "rebuild the
/// duplication pipeline, then try again". Only `Fatal` stops the recorder
/// thread.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("transient capture condition: {0:?}")]
    Transient(HRESULT),

    #[error("recoverable GPU condition ({kind:?})")]
    Recoverable {
        kind: RecoverableKind,
        #[source]
        source: WinError,
    },

    #[error("fatal error: {0}")]
    Fatal(#[from] FatalError),
}

/// The canonical recoverable conditions named in the capture-pipeline's
/// error-handling design: a device-removed reason always collapses to
/// `DeviceRemoved`, regardless of which raw HRESULT produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverableKind {
    DeviceRemoved,
    AccessLost,
    AccessDenied,
    Unsupported,
    SessionDisconnected,
    InvalidCall,
}

#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("no hardware GPU adapters found")]
    NoAdapters,
    #[error("device construction failed")]
    DeviceCreation(#[source] WinError),
    #[error("sink writer construction failed")]
    SinkWriterCreation(#[source] WinError),
    #[error("unrecoverable sink writer error")]
    SinkWriterIo(#[source] WinError),
    #[error("could not attach to the interactive input desktop within the retry window")]
    DesktopAttachTimeout,
    #[error("invalid monitor index {0}")]
    InvalidMonitorIndex(usize),
    #[error(transparent)]
    Other(#[from] WinError),
}

/// Which classification call site is asking — the recoverable HRESULT
/// sets differ slightly between `DuplicateOutput` and
/// `AcquireNextFrame`/metadata reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorContext {
    CreateDuplication,
    FrameAcquisition,
}

/// Outcome of classifying a raw error against the recoverable/transient/fatal
/// taxonomy, before a device-removed-reason lookup (if any) is folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Transient,
    Recoverable(RecoverableKind),
    Fatal,
}

/// Pure classification of an HRESULT against the context's expected-error
/// set. No device lookup here — `classify_with_device` layers that on top
/// for the device-removed-reason remap.
pub fn classify(hr: HRESULT, context: ErrorContext) -> Classification {
    if hr == DXGI_ERROR_WAIT_TIMEOUT.into() || hr == WAIT_TIMEOUT.to_hresult() || hr == DXGI_STATUS_OCCLUDED {
        return Classification::Transient;
    }

    let recoverable = match context {
        ErrorContext::CreateDuplication => match hr {
            h if h == DXGI_ERROR_DEVICE_REMOVED => Some(RecoverableKind::DeviceRemoved),
            h if h == E_ACCESSDENIED || h == DXGI_ERROR_ACCESS_DENIED => {
                Some(RecoverableKind::AccessDenied)
            }
            h if h == DXGI_ERROR_UNSUPPORTED => Some(RecoverableKind::Unsupported),
            h if h == DXGI_ERROR_SESSION_DISCONNECTED => {
                Some(RecoverableKind::SessionDisconnected)
            }
            _ => None,
        },
        ErrorContext::FrameAcquisition => match hr {
            h if h == DXGI_ERROR_DEVICE_REMOVED => Some(RecoverableKind::DeviceRemoved),
            h if h == DXGI_ERROR_ACCESS_LOST || h == WAIT_ABANDONED.to_hresult() => {
                Some(RecoverableKind::AccessLost)
            }
            h if h == DXGI_ERROR_INVALID_CALL || h == E_INVALIDARG => {
                Some(RecoverableKind::InvalidCall)
            }
            _ => None,
        },
    };

    match recoverable {
        Some(kind) => Classification::Recoverable(kind),
        None => Classification::Fatal,
    }
}

/// Remap a device-removed-reason HRESULT the way the canonical recovery
/// policy does: device-removed, device-reset and out-of-memory all present
/// to the caller as plain `DeviceRemoved`; anything else that is not `S_OK`
/// is surfaced unchanged as the "real" failure behind the original error.
pub fn remap_device_removed_reason(reason: HRESULT) -> Option<HRESULT> {
    if reason.is_ok() {
        return None;
    }
    if reason == DXGI_ERROR_DEVICE_REMOVED
        || reason == DXGI_ERROR_DEVICE_RESET
        || reason == E_OUTOFMEMORY
    {
        Some(DXGI_ERROR_DEVICE_REMOVED)
    } else {
        Some(reason)
    }
}

/// Classify a raw Win32 error into the recorder's taxonomy, consulting the
/// device's removed-reason when the device itself appears to be the cause.
pub fn classify_error(
    err: &WinError,
    context: ErrorContext,
    device_removed_reason: Option<HRESULT>,
) -> RecorderError {
    let effective_hr = device_removed_reason
        .and_then(remap_device_removed_reason)
        .unwrap_or_else(|| err.code());

    match classify(effective_hr, context) {
        Classification::Transient => RecorderError::Transient(effective_hr),
        Classification::Recoverable(kind) => RecorderError::Recoverable {
            kind,
            source: err.clone(),
        },
        Classification::Fatal => RecorderError::Fatal(FatalError::Other(err.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_on_wait_timeout() {
        assert_eq!(
            classify(DXGI_ERROR_WAIT_TIMEOUT.into(), ErrorContext::FrameAcquisition),
            Classification::Transient
        );
        assert_eq!(
            classify(DXGI_STATUS_OCCLUDED, ErrorContext::FrameAcquisition),
            Classification::Transient
        );
    }

    #[test]
    fn duplication_recoverable_set() {
        assert_eq!(
            classify(DXGI_ERROR_DEVICE_REMOVED, ErrorContext::CreateDuplication),
            Classification::Recoverable(RecoverableKind::DeviceRemoved)
        );
        assert_eq!(
            classify(E_ACCESSDENIED, ErrorContext::CreateDuplication),
            Classification::Recoverable(RecoverableKind::AccessDenied)
        );
        assert_eq!(
            classify(DXGI_ERROR_UNSUPPORTED, ErrorContext::CreateDuplication),
            Classification::Recoverable(RecoverableKind::Unsupported)
        );
        assert_eq!(
            classify(DXGI_ERROR_SESSION_DISCONNECTED, ErrorContext::CreateDuplication),
            Classification::Recoverable(RecoverableKind::SessionDisconnected)
        );
    }

    #[test]
    fn frame_acquisition_recoverable_set() {
        assert_eq!(
            classify(DXGI_ERROR_DEVICE_REMOVED, ErrorContext::FrameAcquisition),
            Classification::Recoverable(RecoverableKind::DeviceRemoved)
        );
        assert_eq!(
            classify(DXGI_ERROR_ACCESS_LOST, ErrorContext::FrameAcquisition),
            Classification::Recoverable(RecoverableKind::AccessLost)
        );
        assert_eq!(
            classify(DXGI_ERROR_INVALID_CALL, ErrorContext::FrameAcquisition),
            Classification::Recoverable(RecoverableKind::InvalidCall)
        );
    }

    #[test]
    fn unrecognized_hresult_is_fatal() {
        assert_eq!(
            classify(E_OUTOFMEMORY, ErrorContext::FrameAcquisition),
            Classification::Fatal
        );
    }

    #[test]
    fn device_removed_reason_remap() {
        assert_eq!(
            remap_device_removed_reason(DXGI_ERROR_DEVICE_REMOVED),
            Some(DXGI_ERROR_DEVICE_REMOVED)
        );
        assert_eq!(
            remap_device_removed_reason(DXGI_ERROR_DEVICE_RESET),
            Some(DXGI_ERROR_DEVICE_REMOVED)
        );
        assert_eq!(
            remap_device_removed_reason(E_OUTOFMEMORY),
            Some(DXGI_ERROR_DEVICE_REMOVED)
        );
        assert_eq!(remap_device_removed_reason(windows::Win32::Foundation::S_OK), None);
    }
}
