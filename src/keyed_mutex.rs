//! The rotating-keys protocol that turns a DXGI keyed mutex into an
//! ordinary mutual-exclusion lock usable across D3D11 devices.
//!
//! A keyed mutex release with key `K` means "the next acquirer must present
//! key `K`". `RotatingKeys` keeps exactly one of its two keys "at rest" on
//! the surface; each successful lock/unlock cycle swaps them, so neither
//! side needs to hardcode or exchange a key value out of band.

use windows::Win32::Foundation::{WAIT_ABANDONED, WAIT_TIMEOUT};
use windows::Win32::Graphics::Dxgi::IDXGIKeyedMutex;

use crate::error::{self, ErrorContext, RecorderError};

/// How long [`SharedSurfaceLock::acquire`] waits before giving up and
/// reporting the tick as skippable rather than blocking indefinitely.
pub const LOCK_TIMEOUT_MS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotatingKeys {
    acquire_key: u64,
    release_key: u64,
}

impl Default for RotatingKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl RotatingKeys {
    pub fn new() -> Self {
        Self { acquire_key: 0, release_key: 1 }
    }

    pub fn acquire_key(&self) -> u64 {
        self.acquire_key
    }

    pub fn release_key(&self) -> u64 {
        self.release_key
    }

    /// Swap the two keys. Called exactly once per lock/unlock cycle, after
    /// the release call to the keyed mutex has completed.
    pub fn rotate(&mut self) {
        std::mem::swap(&mut self.acquire_key, &mut self.release_key);
    }
}

/// RAII guard returned by [`lock`]. On drop, if the lock was actually held,
/// releases the keyed mutex with `rotating_keys.release_key()` and rotates
/// the keys. A guard that came back unlocked (acquire timed out) releases
/// nothing and leaves the keys untouched — there is nothing to roll over to
/// the next attempt, and rotating anyway would desynchronize the keys from
/// whichever one is actually at rest on the surface.
pub struct SharedSurfaceLock<'a> {
    mutex: &'a IDXGIKeyedMutex,
    keys: &'a mut RotatingKeys,
    locked: bool,
}

impl<'a> SharedSurfaceLock<'a> {
    /// Attempt to acquire `mutex` using the current acquire key, waiting up
    /// to [`LOCK_TIMEOUT_MS`]. A timeout is not an error: the guard comes
    /// back with `locked() == false` and the caller skips the tick.
    pub fn acquire(
        mutex: &'a IDXGIKeyedMutex,
        keys: &'a mut RotatingKeys,
    ) -> error::Result<Self> {
        let key = keys.acquire_key();
        let hr = unsafe { mutex.AcquireSync(key, LOCK_TIMEOUT_MS) };
        match hr {
            Ok(()) => Ok(Self { mutex, keys, locked: true }),
            Err(e) if e.code() == WAIT_TIMEOUT.to_hresult() || e.code() == WAIT_ABANDONED.to_hresult() => {
                Ok(Self { mutex, keys, locked: false })
            }
            Err(e) => Err(RecorderError::Fatal(crate::error::FatalError::Other(e))),
        }
    }

    pub fn locked(&self) -> bool {
        self.locked
    }
}

impl Drop for SharedSurfaceLock<'_> {
    fn drop(&mut self) {
        if self.locked {
            let release_key = self.keys.release_key();
            let _ = unsafe { self.mutex.ReleaseSync(release_key) };
            self.keys.rotate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotating_keys_round_trip() {
        let mut keys = RotatingKeys::new();
        let key0 = keys.acquire_key();
        let key1 = keys.release_key();
        for n in 0..10 {
            if n % 2 == 0 {
                assert_eq!(keys.acquire_key(), key0);
            } else {
                assert_eq!(keys.acquire_key(), key1);
            }
            keys.rotate();
        }
    }

    #[test]
    fn rotate_swaps_both_fields() {
        let mut keys = RotatingKeys::new();
        let (a0, r0) = (keys.acquire_key(), keys.release_key());
        keys.rotate();
        assert_eq!(keys.acquire_key(), r0);
        assert_eq!(keys.release_key(), a0);
    }
}
