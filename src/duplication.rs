//! The per-output duplication interface: the "frame source" state machine
//! plus the `Frame` snapshot it produces.

use log::{debug, trace, warn};
use windows::Win32::Graphics::Direct3D11::{ID3D11Device, ID3D11Texture2D};
use windows::Win32::Graphics::Dxgi::{
    IDXGIOutput, IDXGIOutputDuplication, IDXGIResource, DXGI_OUTDUPL_FRAME_INFO,
    DXGI_OUTDUPL_MOVE_RECT, DXGI_STATUS_OCCLUDED,
};
use windows::Win32::Foundation::{RECT, WAIT_TIMEOUT};
use windows::core::Interface;

use crate::cursor::{CursorPosition, CursorState, ShapeInfo, ShapeKind};
use crate::error::{classify_error, ErrorContext, FatalError, RecorderError, Result};
use crate::geometry::{MoveRect, Rect, Rotation};
use crate::gpu::DesktopMonitor;

/// The duplicator's lifecycle state. `Ready`/`FrameHeld` are implicit in
/// whether a frame is currently on loan; this enum only needs to track the
/// terminal/recovering states explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DuplicatorState {
    Ready,
    Recovering,
    Failed,
}

/// Outcome of one `acquire_frame` call.
pub enum AcquireOutcome {
    Frame(Frame),
    SkipTick,
}

/// Snapshot of one acquired frame. Never stored past the tick that produced
/// it.
pub struct Frame {
    pub captured: bool,
    pub desktop_texture: Option<ID3D11Texture2D>,
    pub monitor_bounds: Rect,
    pub rotation: Rotation,
    pub move_rects: Vec<MoveRect>,
    pub dirty_rects: Vec<Rect>,
}

impl Frame {
    fn uncaptured(monitor_bounds: Rect, rotation: Rotation) -> Self {
        Self {
            captured: false,
            desktop_texture: None,
            monitor_bounds,
            rotation,
            move_rects: Vec::new(),
            dirty_rects: Vec::new(),
        }
    }
}

/// Wraps one output's `IDXGIOutputDuplication`. Acquires frames, classifies
/// errors, and knows how to rebuild itself after a recoverable error.
pub struct ScreenDuplicator {
    device: ID3D11Device,
    output: IDXGIOutput,
    duplication: Option<IDXGIOutputDuplication>,
    state: DuplicatorState,
    metadata_buffer: Vec<u8>,
    monitor_bounds: Rect,
    rotation: Rotation,
    output_index: usize,
}

impl ScreenDuplicator {
    pub fn new(device: ID3D11Device, monitor: &DesktopMonitor, output_index: usize) -> Result<Self> {
        let mut duplicator = Self {
            device,
            output: monitor.output.clone(),
            duplication: None,
            state: DuplicatorState::Ready,
            metadata_buffer: Vec::new(),
            monitor_bounds: monitor.bounds,
            rotation: monitor.rotation,
            output_index,
        };
        duplicator.build_duplication()?;
        Ok(duplicator)
    }

    fn build_duplication(&mut self) -> Result<()> {
        let dxgi_device: windows::Win32::Graphics::Dxgi::IDXGIDevice =
            match self.device.cast() {
                Ok(d) => d,
                Err(e) => return Err(FatalError::Other(e).into()),
            };
        match unsafe { self.output.DuplicateOutput(&dxgi_device) } {
            Ok(dupl) => {
                self.duplication = Some(dupl);
                self.state = DuplicatorState::Ready;
                Ok(())
            }
            Err(e) => {
                let removed_reason = device_removed_reason(&self.device);
                let err = classify_error(&e, ErrorContext::CreateDuplication, removed_reason);
                self.state = match &err {
                    RecorderError::Recoverable { .. } => DuplicatorState::Recovering,
                    _ => DuplicatorState::Failed,
                };
                Err(err)
            }
        }
    }

    /// Tear down and rebuild the duplication interface, used after a
    /// recoverable error.
    pub fn reset(&mut self) -> Result<()> {
        self.duplication = None;
        self.build_duplication()
    }

    pub fn is_failed(&self) -> bool {
        self.state == DuplicatorState::Failed
    }

    /// Acquire the next frame with a 1 ms timeout. TIMEOUT/OCCLUDED yields
    /// `SkipTick` without mutating any state.
    pub fn acquire_frame(&mut self, cursor: &mut CursorState) -> Result<AcquireOutcome> {
        let dupl = self
            .duplication
            .as_ref()
            .expect("acquire_frame called without a live duplication interface");

        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        let hr = unsafe { dupl.AcquireNextFrame(1, &mut frame_info, &mut resource) };

        let resource = match hr {
            Ok(()) => resource.expect("AcquireNextFrame succeeded without a resource"),
            Err(e) if e.code() == WAIT_TIMEOUT.to_hresult() || e.code() == DXGI_STATUS_OCCLUDED => {
                trace!("acquire_frame: timeout/occluded, skipping tick");
                return Ok(AcquireOutcome::SkipTick);
            }
            Err(e) => {
                let removed_reason = device_removed_reason(&self.device);
                let classified = classify_error(&e, ErrorContext::FrameAcquisition, removed_reason);
                if let RecorderError::Recoverable { .. } = &classified {
                    self.state = DuplicatorState::Recovering;
                } else {
                    self.state = DuplicatorState::Failed;
                }
                return Err(classified);
            }
        };

        let result = self.bind_frame(dupl, &resource, &frame_info, cursor);
        let _ = unsafe { dupl.ReleaseFrame() };
        result
    }

    fn bind_frame(
        &mut self,
        dupl: &IDXGIOutputDuplication,
        resource: &IDXGIResource,
        frame_info: &DXGI_OUTDUPL_FRAME_INFO,
        cursor: &mut CursorState,
    ) -> Result<AcquireOutcome> {
        let texture: ID3D11Texture2D = resource.cast().map_err(FatalError::Other)?;

        if frame_info.LastMouseUpdateTime != 0 {
            if frame_info.PointerShapeBufferSize != 0 {
                self.read_pointer_shape(dupl, frame_info, cursor);
            }
            let position = CursorPosition {
                x: frame_info.PointerPosition.Position.x,
                y: frame_info.PointerPosition.Position.y,
                visible: frame_info.PointerPosition.Visible.as_bool(),
            };
            cursor.update_position(position, frame_info.LastMouseUpdateTime, self.output_index);
        }

        let (move_rects, dirty_rects) = if frame_info.TotalMetadataBufferSize != 0 {
            self.read_metadata(dupl, frame_info.TotalMetadataBufferSize)?
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(AcquireOutcome::Frame(Frame {
            captured: true,
            desktop_texture: Some(texture),
            monitor_bounds: self.monitor_bounds,
            rotation: self.rotation,
            move_rects,
            dirty_rects,
        }))
    }

    fn read_pointer_shape(
        &mut self,
        dupl: &IDXGIOutputDuplication,
        frame_info: &DXGI_OUTDUPL_FRAME_INFO,
        cursor: &mut CursorState,
    ) {
        let required = frame_info.PointerShapeBufferSize as usize;
        let mut buffer = vec![0u8; required];
        let mut shape_info = windows::Win32::Graphics::Dxgi::DXGI_OUTDUPL_POINTER_SHAPE_INFO::default();
        let mut size_needed = 0u32;
        let result = unsafe {
            dupl.GetFramePointerShape(
                required as u32,
                buffer.as_mut_ptr() as *mut _,
                &mut size_needed,
                &mut shape_info,
            )
        };
        if let Err(e) = result {
            warn!("GetFramePointerShape failed: {e:?}");
            return;
        }

        let kind = match shape_info.Type {
            1 => ShapeKind::Monochrome,
            2 => ShapeKind::Color,
            4 => ShapeKind::MaskedColor,
            other => {
                warn!("unknown pointer shape type {other}, treating as color");
                ShapeKind::Color
            }
        };

        cursor.set_shape(
            ShapeInfo {
                kind,
                width: shape_info.Width,
                height: shape_info.Height,
                pitch: shape_info.Pitch,
                hotspot: (shape_info.HotSpot.x, shape_info.HotSpot.y),
            },
            &buffer,
        );
    }

    fn read_metadata(
        &mut self,
        dupl: &IDXGIOutputDuplication,
        total_size: u32,
    ) -> Result<(Vec<MoveRect>, Vec<Rect>)> {
        self.metadata_buffer.clear();
        self.metadata_buffer.resize(total_size as usize, 0);

        let mut move_rects_size = 0u32;
        let move_rect_stride = std::mem::size_of::<DXGI_OUTDUPL_MOVE_RECT>();
        let move_capacity = self.metadata_buffer.len();
        unsafe {
            dupl.GetFrameMoveRects(
                move_capacity as u32,
                self.metadata_buffer.as_mut_ptr() as *mut DXGI_OUTDUPL_MOVE_RECT,
                &mut move_rects_size,
            )
        }
        .map_err(FatalError::Other)?;

        let num_move_rects = move_rects_size as usize / move_rect_stride;
        let move_rects: Vec<MoveRect> = (0..num_move_rects)
            .map(|i| {
                let raw = unsafe {
                    &*(self.metadata_buffer.as_ptr().add(i * move_rect_stride) as *const DXGI_OUTDUPL_MOVE_RECT)
                };
                MoveRect {
                    source_point: (raw.SourcePoint.x, raw.SourcePoint.y),
                    dest_rect: rect_from_win32(raw.DestinationRect),
                }
            })
            .collect();

        let remaining = &mut self.metadata_buffer[move_rects_size as usize..];
        let mut dirty_rects_size = 0u32;
        let dirty_capacity = remaining.len();
        unsafe {
            dupl.GetFrameDirtyRects(
                dirty_capacity as u32,
                remaining.as_mut_ptr() as *mut RECT,
                &mut dirty_rects_size,
            )
        }
        .map_err(FatalError::Other)?;

        let rect_stride = std::mem::size_of::<RECT>();
        let num_dirty_rects = dirty_rects_size as usize / rect_stride;
        let dirty_rects: Vec<Rect> = (0..num_dirty_rects)
            .map(|i| {
                let raw = unsafe { &*(remaining.as_ptr().add(i * rect_stride) as *const RECT) };
                rect_from_win32(*raw)
            })
            .collect();

        debug!("metadata: {num_move_rects} move rects, {num_dirty_rects} dirty rects");
        Ok((move_rects, dirty_rects))
    }
}

impl Drop for ScreenDuplicator {
    fn drop(&mut self) {
        if let Some(dupl) = &self.duplication {
            let _ = unsafe { dupl.ReleaseFrame() };
        }
    }
}

fn rect_from_win32(r: RECT) -> Rect {
    Rect::new(r.left, r.top, r.right, r.bottom)
}

fn device_removed_reason(device: &ID3D11Device) -> Option<windows::core::HRESULT> {
    let hr = unsafe { device.GetDeviceRemovedReason() };
    match hr {
        Ok(()) => None,
        Err(e) => Some(e.code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncaptured_frame_has_no_rects() {
        let frame = Frame::uncaptured(Rect::new(0, 0, 1920, 1080), Rotation::Identity);
        assert!(!frame.captured);
        assert!(frame.move_rects.is_empty());
        assert!(frame.dirty_rects.is_empty());
        assert!(frame.desktop_texture.is_none());
    }
}
