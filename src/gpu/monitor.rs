//! Per-output monitor enumeration and the virtual-desktop bounding box.

use log::debug;
use windows::Win32::Graphics::Dxgi::{IDXGIAdapter1, IDXGIOutput, DXGI_OUTPUT_DESC};

use crate::error::Result;
use crate::geometry::Rect;
use crate::gpu::adapter::GpuAdapter;

/// A rotation as reported by `DXGI_OUTPUT_DESC::Rotation`.
pub use crate::geometry::Rotation;

/// Immutable snapshot of one attached output. Re-enumerated whenever the
/// desktop topology changes (monitor plugged/unplugged, resolution change).
#[derive(Debug, Clone)]
pub struct DesktopMonitor {
    pub adapter_name: String,
    /// Index into the `[GpuAdapter]` slice this monitor's output was
    /// enumerated from — lets the recorder thread pick the device that
    /// owns this monitor without re-matching on `adapter_name`.
    pub adapter_index: usize,
    pub output_index: u32,
    pub name: String,
    pub rotation: Rotation,
    pub bounds: Rect,
    pub(crate) output: IDXGIOutput,
}

impl DesktopMonitor {
    /// The identity tuple the recovery path matches outputs by:
    /// rotated monitors are excluded from recovery matching.
    pub fn recovery_key(&self) -> Option<(String, u32, String)> {
        if self.rotation.is_recovery_eligible() {
            Some((self.name.clone(), self.output_index, self.adapter_name.clone()))
        } else {
            None
        }
    }
}

fn decode_rotation(raw: windows::Win32::Graphics::Dxgi::Common::DXGI_MODE_ROTATION) -> Rotation {
    use windows::Win32::Graphics::Dxgi::Common::{
        DXGI_MODE_ROTATION_IDENTITY, DXGI_MODE_ROTATION_ROTATE90, DXGI_MODE_ROTATION_ROTATE180,
        DXGI_MODE_ROTATION_ROTATE270, DXGI_MODE_ROTATION_UNSPECIFIED,
    };
    match raw {
        DXGI_MODE_ROTATION_IDENTITY => Rotation::Identity,
        DXGI_MODE_ROTATION_ROTATE90 => Rotation::Rotate90,
        DXGI_MODE_ROTATION_ROTATE180 => Rotation::Rotate180,
        DXGI_MODE_ROTATION_ROTATE270 => Rotation::Rotate270,
        _ => Rotation::Unspecified,
    }
}

fn monitor_from_desc(
    adapter: &GpuAdapter,
    adapter_index: usize,
    output: IDXGIOutput,
    desc: &DXGI_OUTPUT_DESC,
    output_index: u32,
) -> DesktopMonitor {
    let name = String::from_utf16_lossy(
        &desc.DeviceName[..desc.DeviceName.iter().position(|&c| c == 0).unwrap_or(desc.DeviceName.len())],
    );
    DesktopMonitor {
        adapter_name: adapter.description().to_string(),
        adapter_index,
        output_index,
        name,
        rotation: decode_rotation(desc.Rotation),
        bounds: Rect::new(
            desc.DesktopCoordinates.left,
            desc.DesktopCoordinates.top,
            desc.DesktopCoordinates.right,
            desc.DesktopCoordinates.bottom,
        ),
        output,
    }
}

/// For each adapter, iterate its outputs and yield those attached to the
/// desktop. Outputs not attached (e.g. disabled/disconnected)
/// are skipped.
pub fn enumerate_monitors(adapters: &[GpuAdapter]) -> Result<Vec<DesktopMonitor>> {
    let mut monitors = Vec::new();
    for (adapter_index, adapter) in adapters.iter().enumerate() {
        let dxgi_adapter: &IDXGIAdapter1 = adapter.dxgi_adapter();
        let mut index = 0u32;
        loop {
            let output = match unsafe { dxgi_adapter.EnumOutputs(index) } {
                Ok(o) => o,
                Err(_) => break,
            };
            index += 1;

            let desc = match unsafe { output.GetDesc() } {
                Ok(d) => d,
                Err(_) => continue,
            };
            if !desc.AttachedToDesktop.as_bool() {
                debug!("output {index} on {} not attached to desktop", adapter.description());
                continue;
            }

            monitors.push(monitor_from_desc(adapter, adapter_index, output, &desc, index - 1));
        }
    }
    Ok(monitors)
}

/// The bounding box of every monitor's bounds, in virtual-desktop
/// coordinates.
pub fn calculate_virtual_desktop_bounds(monitors: &[DesktopMonitor]) -> Rect {
    monitors
        .iter()
        .map(|m| m.bounds)
        .fold(None, |acc: Option<Rect>, b| Some(acc.map_or(b, |a| a.union(&b))))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_monitor(bounds: Rect) -> Rect {
        bounds
    }

    #[test]
    fn bounds_union_of_two_side_by_side_monitors() {
        let a = rect_monitor(Rect::new(0, 0, 1920, 1080));
        let b = rect_monitor(Rect::new(1920, 0, 3840, 1080));
        let union = a.union(&b);
        assert_eq!(union, Rect::new(0, 0, 3840, 1080));
    }
}
