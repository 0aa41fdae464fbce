//! Recycles composited textures and serves as the encoder's sample-release
//! callback.

use std::sync::{Arc, Mutex};

use windows::Win32::Graphics::Direct3D11::{
    ID3D11Device, ID3D11Texture2D, D3D11_BIND_RENDER_TARGET, D3D11_BIND_SHADER_RESOURCE,
    D3D11_RESOURCE_MISC_SHARED, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
};

/// A generic free-list pool, kept free of any GPU type so its discipline
/// (acquire never blocks, release always returns to the free end) is
/// unit-testable without a device.
pub struct Pool<T> {
    free: Vec<T>,
    make: Box<dyn Fn() -> T + Send>,
    allocated: usize,
}

impl<T> Pool<T> {
    pub fn new(make: impl Fn() -> T + Send + 'static) -> Self {
        Self { free: Vec::new(), make: Box::new(make), allocated: 0 }
    }

    pub fn acquire(&mut self) -> T {
        match self.free.pop() {
            Some(item) => item,
            None => {
                self.allocated += 1;
                (self.make)()
            }
        }
    }

    pub fn release(&mut self, item: T) {
        self.free.push(item);
    }

    /// Number of extant items ever allocated (free + in flight). Used to
    /// check the pool-size invariant against the count of
    /// samples currently in flight to the encoder.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// Fixed descriptor for every texture the pool manages: render-target +
/// shader-resource, shared-handle enabled.
fn pool_texture_desc(width: u32, height: u32, format: windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT) -> D3D11_TEXTURE2D_DESC {
    D3D11_TEXTURE2D_DESC {
        Width: width,
        Height: height,
        MipLevels: 1,
        ArraySize: 1,
        Format: format,
        SampleDesc: windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Usage: D3D11_USAGE_DEFAULT,
        BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
        CPUAccessFlags: 0,
        MiscFlags: D3D11_RESOURCE_MISC_SHARED.0 as u32,
    }
}

/// Thread-safe wrapper around [`Pool`] for GPU textures: `acquire` and
/// `release` both briefly hold the internal mutex (shared-resource
/// table). Cloning shares the same underlying pool — this is what lets the
/// Pipeline hand a clone to the SinkWriter as a release callback.
#[derive(Clone)]
pub struct TexturePool {
    inner: Arc<Mutex<Pool<ID3D11Texture2D>>>,
}

impl TexturePool {
    pub fn new(device: ID3D11Device, desc: D3D11_TEXTURE2D_DESC) -> Self {
        let pool = Pool::new(move || {
            let mut texture: Option<ID3D11Texture2D> = None;
            unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }
                .expect("pool texture allocation failed");
            texture.expect("CreateTexture2D succeeded without a texture")
        });
        Self { inner: Arc::new(Mutex::new(pool)) }
    }

    pub fn for_frame(device: ID3D11Device, frame_desc: &D3D11_TEXTURE2D_DESC) -> Self {
        let desc = pool_texture_desc(frame_desc.Width, frame_desc.Height, frame_desc.Format);
        Self::new(device, desc)
    }

    pub fn acquire(&self) -> ID3D11Texture2D {
        self.inner.lock().expect("texture pool mutex poisoned").acquire()
    }

    /// The release callback the SinkWriter invokes once it is done with a
    /// sample. Extracting the texture from the sample itself is the
    /// caller's responsibility (it depends on the concrete sample/buffer
    /// types); this just returns an already-extracted texture to the pool.
    pub fn release(&self, texture: ID3D11Texture2D) {
        self.inner.lock().expect("texture pool mutex poisoned").release(texture);
    }

    pub fn allocated(&self) -> usize {
        self.inner.lock().expect("texture pool mutex poisoned").allocated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn reuses_released_items_before_allocating() {
        let allocations = Arc::new(AtomicUsize::new(0));
        let counter = allocations.clone();
        let mut pool = Pool::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            counter.load(Ordering::SeqCst)
        });

        let a = pool.acquire();
        pool.release(a);
        let b = pool.acquire();
        assert_eq!(allocations.load(Ordering::SeqCst), 1);
        assert_eq!(b, 1);
    }

    #[test]
    fn allocated_count_bounded_by_in_flight_plus_one() {
        // Acquire 3 without releasing (simulating 2 in-flight samples plus
        // the currently-composing tick), then release all: allocated()
        // should equal the high-water mark, never exceed it afterward.
        let mut pool = Pool::new(|| ());
        let items: Vec<()> = (0..3).map(|_| pool.acquire()).collect();
        assert_eq!(pool.allocated(), 3);
        for item in items {
            pool.release(item);
        }
        let _ = pool.acquire();
        assert_eq!(pool.allocated(), 3);
    }
}
