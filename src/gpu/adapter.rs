//! GPU adapter identity and video-enabled device creation.

use log::{debug, warn};
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_UNKNOWN;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D10Multithread, ID3D11Device, D3D11_CREATE_DEVICE_BGRA_SUPPORT,
    D3D11_CREATE_DEVICE_VIDEO_SUPPORT, D3D11_SDK_VERSION,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, IDXGIAdapter1, IDXGIFactory1, DXGI_ADAPTER_FLAG_SOFTWARE,
};
use windows::core::Interface;

use crate::error::{FatalError, Result};

/// Immutable identity plus a video-enabled, multithread-protected device for
/// one hardware adapter.
pub struct GpuAdapter {
    pub description: String,
    pub device: ID3D11Device,
    adapter: IDXGIAdapter1,
}

impl GpuAdapter {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    pub fn dxgi_adapter(&self) -> &IDXGIAdapter1 {
        &self.adapter
    }
}

/// Factory/device construction, mirroring `DxResource::MakeDxgiFactory` /
/// `MakeVideoEnabledDevice` from the original library: BGRA + video support
/// and multithread protection are mandatory for every device this crate
/// creates, since the compositor shares textures across adapters.
pub struct GpuContext {
    factory: IDXGIFactory1,
}

impl GpuContext {
    pub fn new() -> Result<Self> {
        let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }
            .map_err(FatalError::DeviceCreation)?;
        Ok(Self { factory })
    }

    /// Enumerate every hardware (non-software) adapter and build a
    /// video-enabled, BGRA-capable, multithread-protected device for each.
    /// Returns `NoAdapters` if the enumeration yields nothing usable.
    pub fn enumerate_adapters(&self) -> Result<Vec<GpuAdapter>> {
        let mut adapters = Vec::new();
        let mut index = 0u32;
        loop {
            let adapter: IDXGIAdapter1 = match unsafe { self.factory.EnumAdapters1(index) } {
                Ok(a) => a,
                Err(_) => break,
            };
            index += 1;

            let desc = match unsafe { adapter.GetDesc1() } {
                Ok(d) => d,
                Err(e) => {
                    warn!("failed to get adapter description: {e:?}");
                    continue;
                }
            };
            if (desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32) != 0 {
                debug!("skipping software adapter at index {index}");
                continue;
            }

            match make_video_enabled_device(&adapter) {
                Ok(device) => {
                    let name = String::from_utf16_lossy(
                        &desc.Description[..desc
                            .Description
                            .iter()
                            .position(|&c| c == 0)
                            .unwrap_or(desc.Description.len())],
                    );
                    adapters.push(GpuAdapter { description: name, device, adapter });
                }
                Err(e) => warn!("device creation failed for adapter {index}: {e:?}"),
            }
        }

        if adapters.is_empty() {
            return Err(FatalError::NoAdapters.into());
        }
        Ok(adapters)
    }
}

fn make_video_enabled_device(adapter: &IDXGIAdapter1) -> Result<ID3D11Device> {
    let flags = D3D11_CREATE_DEVICE_BGRA_SUPPORT | D3D11_CREATE_DEVICE_VIDEO_SUPPORT;
    let mut device: Option<ID3D11Device> = None;
    let adapter_iunknown: windows::Win32::Graphics::Dxgi::IDXGIAdapter =
        adapter.cast().map_err(FatalError::DeviceCreation)?;
    unsafe {
        D3D11CreateDevice(
            &adapter_iunknown,
            D3D_DRIVER_TYPE_UNKNOWN,
            None,
            flags,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            None,
        )
    }
    .map_err(FatalError::DeviceCreation)?;
    let device = device.ok_or(FatalError::DeviceCreation(windows::core::Error::empty()))?;

    let multithread: ID3D10Multithread = device
        .cast()
        .map_err(FatalError::DeviceCreation)?;
    unsafe {
        multithread.SetMultithreadProtected(true);
    }

    Ok(device)
}
