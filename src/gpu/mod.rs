//! Adapter/device enumeration and the cross-device shared-handle primitive
//! for handing a texture from one adapter's device to another's.

pub mod adapter;
pub mod monitor;

pub use adapter::{GpuAdapter, GpuContext};
pub use monitor::{calculate_virtual_desktop_bounds, enumerate_monitors, DesktopMonitor, Rotation};

use windows::Win32::Foundation::HANDLE;
use windows::Win32::Graphics::Direct3D11::ID3D11Device;
use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::Graphics::Dxgi::IDXGIResource;
use windows::core::Interface;

use crate::error::{FatalError, Result};

/// Export `texture`'s NT handle so another device can open it via
/// [`open_from_handle`]. The handle is process-local and must be closed by
/// the platform once the last device referencing the surface is done,
/// mirroring `GpuContext::open_shared`.
pub fn open_shared(texture: &ID3D11Texture2D) -> Result<HANDLE> {
    let resource: IDXGIResource = texture.cast().map_err(FatalError::Other)?;
    unsafe { resource.GetSharedHandle() }.map_err(FatalError::Other)
}

/// Open a texture previously shared via [`open_shared`] on `device`.
pub fn open_from_handle(device: &ID3D11Device, handle: HANDLE) -> Result<ID3D11Texture2D> {
    unsafe { device.OpenSharedResource(handle) }.map_err(FatalError::Other)
}
