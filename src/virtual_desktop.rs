//! The persistent cross-adapter shared surface every Pipeline composites
//! into.

use std::collections::HashMap;

use log::info;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Device, ID3D11Texture2D, D3D11_BIND_RENDER_TARGET, D3D11_BIND_SHADER_RESOURCE,
    D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::IDXGIKeyedMutex;
use windows::core::Interface;

use crate::error::{FatalError, Result};
use crate::geometry::Rect;
use crate::gpu;
use crate::keyed_mutex::{RotatingKeys, SharedSurfaceLock};

/// The standalone value the compositor reads/writes each tick: a shared
/// BGRA texture plus the keyed mutex and rotating-keys state guarding it,
/// independent of any particular device — callers reach it directly rather
/// than always going through `VirtualDesktop`.
pub struct SharedSurface {
    texture: ID3D11Texture2D,
    mutex: IDXGIKeyedMutex,
    device: ID3D11Device,
    desc: D3D11_TEXTURE2D_DESC,
    keys: RotatingKeys,
}

impl SharedSurface {
    fn create(device: &ID3D11Device, width: u32, height: u32) -> Result<Self> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX.0 as u32,
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .map_err(FatalError::Other)?;
        let texture = texture.ok_or(FatalError::Other(windows::core::Error::empty()))?;
        let mutex: IDXGIKeyedMutex = texture.cast().map_err(FatalError::Other)?;

        Ok(Self {
            texture,
            mutex,
            device: device.clone(),
            desc,
            keys: RotatingKeys::new(),
        })
    }

    pub fn texture(&self) -> &ID3D11Texture2D {
        &self.texture
    }

    pub fn desc(&self) -> &D3D11_TEXTURE2D_DESC {
        &self.desc
    }

    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    /// Acquire the keyed mutex, 10 ms timeout, never blocking indefinitely
    /// On timeout the guard reports `locked() == false`.
    pub fn lock(&mut self) -> Result<SharedSurfaceLock<'_>> {
        SharedSurfaceLock::acquire(&self.mutex, &mut self.keys)
    }
}

/// Owns the per-recording shared surface and a per-device cache of opened
/// handles, so repeated `open_for(same_device)` calls are free after the
/// first.
pub struct VirtualDesktop {
    bounds: Rect,
    surface: SharedSurface,
    opened: HashMap<usize, ID3D11Texture2D>,
}

impl VirtualDesktop {
    /// Create the shared surface sized to `bounds` on `owner_device`.
    /// `owner_device` is whichever adapter's device constructed the
    /// surface; other devices access it via [`VirtualDesktop::open_for`].
    pub fn new(owner_device: &ID3D11Device, bounds: Rect) -> Result<Self> {
        info!(
            "creating virtual desktop surface {}x{} at ({}, {})",
            bounds.width(),
            bounds.height(),
            bounds.left,
            bounds.top
        );
        let surface = SharedSurface::create(owner_device, bounds.width() as u32, bounds.height() as u32)?;
        Ok(Self { bounds, surface, opened: HashMap::new() })
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn surface(&mut self) -> &mut SharedSurface {
        &mut self.surface
    }

    pub fn lock(&mut self) -> Result<SharedSurfaceLock<'_>> {
        self.surface.lock()
    }

    /// Open this surface on `device`, caching the opened texture by the
    /// device's pointer identity so repeated calls for the same device are
    /// free.
    pub fn open_for(&mut self, device: &ID3D11Device) -> Result<ID3D11Texture2D> {
        let key = device.as_raw() as usize;
        if let Some(t) = self.opened.get(&key) {
            return Ok(t.clone());
        }
        let handle: HANDLE = gpu::open_shared(&self.surface.texture)?;
        let opened = gpu::open_from_handle(device, handle)?;
        self.opened.insert(key, opened.clone());
        Ok(opened)
    }

    /// Recreate the shared surface if `new_bounds` differs from the current
    /// bounds (topology change), resetting the rotating-keys state and
    /// dropping all cached per-device handles.
    pub fn reset_if_bounds_changed(&mut self, owner_device: &ID3D11Device, new_bounds: Rect) -> Result<()> {
        if new_bounds == self.bounds {
            return Ok(());
        }
        self.surface = SharedSurface::create(
            owner_device,
            new_bounds.width() as u32,
            new_bounds.height() as u32,
        )?;
        self.bounds = new_bounds;
        self.opened.clear();
        Ok(())
    }
}
