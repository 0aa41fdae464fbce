//! Wraps a composited GPU texture as an `IMFSample` for the sink writer,
//! and builds the BGRA video input media type the duplication pipeline
//! presents to it.
//!
//! The release path uses the standard Media Foundation tracked-sample
//! idiom: a sample created over a DXGI surface buffer supports
//! `IMFTrackedSample`, whose `SetAllocator` schedules an `IMFAsyncCallback`
//! to run once the sample's last reference drops. That callback is this
//! module's [`TextureReleaseCallback`], which returns the texture to the
//! `TexturePool` it came from — the encoder never has to know textures are
//! pooled at all.

use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::Media::MediaFoundation::{
    IMFAsyncCallback, IMFAsyncCallback_Impl, IMFAsyncResult, IMFMediaType, IMFSample,
    IMFTrackedSample, MFCreateDXGISurfaceBuffer, MFCreateMediaType, MFCreateSample,
    MFSetAttributeRatio, MFSetAttributeSize, MFVideoFormat_ARGB32, MFVideoInterlace_Progressive,
    MF_MT_ALL_SAMPLES_INDEPENDENT, MF_MT_FRAME_RATE, MF_MT_FRAME_SIZE, MF_MT_INTERLACE_MODE,
    MF_MT_MAJOR_TYPE, MF_MT_SUBTYPE, MFMediaType_Video,
};
use windows::core::Interface;

use crate::error::{FatalError, Result};
use crate::texture_pool::TexturePool;

/// Build the video input media type the sink writer's `SetInputMediaType`
/// expects: BGRA (`MFVideoFormat_ARGB32`, the same memory layout as
/// `DXGI_FORMAT_B8G8R8A8_UNORM`), sized to the virtual desktop bounds, at
/// the configured frame rate.
pub fn video_input_media_type(width: u32, height: u32, framerate: u32) -> Result<IMFMediaType> {
    let mut media_type: Option<IMFMediaType> = None;
    unsafe { MFCreateMediaType(&mut media_type) }.map_err(FatalError::Other)?;
    let media_type = media_type.expect("MFCreateMediaType succeeded without a media type");

    unsafe {
        media_type.SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Video).map_err(FatalError::Other)?;
        media_type.SetGUID(&MF_MT_SUBTYPE, &MFVideoFormat_ARGB32).map_err(FatalError::Other)?;
        media_type
            .SetUINT32(&MF_MT_INTERLACE_MODE, MFVideoInterlace_Progressive.0 as u32)
            .map_err(FatalError::Other)?;
        media_type.SetUINT32(&MF_MT_ALL_SAMPLES_INDEPENDENT, 1).map_err(FatalError::Other)?;
        MFSetAttributeSize(&media_type, &MF_MT_FRAME_SIZE, width, height).map_err(FatalError::Other)?;
        MFSetAttributeRatio(&media_type, &MF_MT_FRAME_RATE, framerate.max(1), 1)
            .map_err(FatalError::Other)?;
    }

    Ok(media_type)
}

/// COM object implementing the tracked-sample release callback: when
/// Media Foundation invokes it, the texture goes back to the pool it was
/// acquired from.
#[windows::core::implement(IMFAsyncCallback)]
struct TextureReleaseCallback {
    texture: ID3D11Texture2D,
    pool: TexturePool,
}

impl IMFAsyncCallback_Impl for TextureReleaseCallback_Impl {
    fn GetParameters(&self, _flags: *mut u32, _queue: *mut u32) -> windows::core::Result<()> {
        Err(windows::Win32::Foundation::E_NOTIMPL.into())
    }

    fn Invoke(&self, _result: Option<&IMFAsyncResult>) -> windows::core::Result<()> {
        self.pool.release(self.texture.clone());
        Ok(())
    }
}

/// Wrap `texture` as an `IMFSample` carrying a single DXGI surface buffer,
/// registering `pool` so the texture is returned once the sample's last
/// reference (held by the sink writer / encoder) drops.
///
/// If the sample does not support `IMFTrackedSample` (unexpected for a
/// sample built over `MFCreateDXGISurfaceBuffer`, but not guaranteed by the
/// API), the texture is not tracked for pool return; the caller still gets
/// a valid sample, it is just not recycled, matching the degrade-gracefully
/// posture the rest of this crate takes on unexpected platform behavior.
pub fn wrap_texture_as_sample(texture: &ID3D11Texture2D, pool: TexturePool) -> Result<IMFSample> {
    let mut buffer = None;
    unsafe {
        MFCreateDXGISurfaceBuffer(&ID3D11Texture2D::IID, texture, 0, false, &mut buffer)
    }
    .map_err(FatalError::Other)?;
    let buffer = buffer.expect("MFCreateDXGISurfaceBuffer succeeded without a buffer");

    let mut sample: Option<IMFSample> = None;
    unsafe { MFCreateSample(&mut sample) }.map_err(FatalError::Other)?;
    let sample = sample.expect("MFCreateSample succeeded without a sample");
    unsafe {
        sample.AddBuffer(&buffer).map_err(FatalError::Other)?;
        // Tags the sample so `SinkWriter::write_sample` can dispatch on
        // major type without threading a separate `kind` parameter through
        // every caller.
        sample.SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Video).map_err(FatalError::Other)?;
    }

    if let Ok(tracked) = sample.cast::<IMFTrackedSample>() {
        let callback: IMFAsyncCallback =
            TextureReleaseCallback { texture: texture.clone(), pool }.into();
        if let Err(e) = unsafe { tracked.SetAllocator(&callback, None) } {
            log::warn!("sample did not accept a release allocator, texture will not be pooled: {e:?}");
        }
    } else {
        log::warn!("sample does not implement IMFTrackedSample, texture will not be pooled");
    }

    Ok(sample)
}
