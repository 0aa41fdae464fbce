//! The typed configuration surface consumed by [`crate::recorder::RecorderThread`]
//! and produced by the shell: CLI flags via `clap`, or a JSON file/pipe via
//! `serde`, exactly as the original app took a JSON blob on stdin.

use serde::{Deserialize, Serialize};

use crate::gpu::DesktopMonitor;

/// Mirrors `winrt::Windows::Media::MediaProperties::VideoEncodingQuality`:
/// `Auto` takes its frame size from the video input media type rather than
/// a fixed preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionOption {
    Auto,
    Low,
    Medium,
    High,
    #[value(name = "720p")]
    #[serde(rename = "720p")]
    Hd720p,
    #[value(name = "1080p")]
    #[serde(rename = "1080p")]
    Hd1080p,
    #[value(name = "2160p")]
    #[serde(rename = "2160p")]
    Uhd2160p,
}

impl ResolutionOption {
    /// The `VideoEncodingQuality` variant this preset maps to, used when
    /// building the encoding profile. `Auto` has no WinRT counterpart; the
    /// sink writer special-cases it to read the frame size from the video
    /// input media type instead of a profile lookup.
    pub fn as_winrt(self) -> Option<windows::Media::MediaProperties::VideoEncodingQuality> {
        use windows::Media::MediaProperties::VideoEncodingQuality as Q;
        match self {
            ResolutionOption::Auto => None,
            ResolutionOption::Low => Some(Q::Low),
            ResolutionOption::Medium => Some(Q::Standard),
            ResolutionOption::High => Some(Q::HD1080p), // see DESIGN.md: no dedicated "High" in WinRT
            ResolutionOption::Hd720p => Some(Q::HD720p),
            ResolutionOption::Hd1080p => Some(Q::HD1080p),
            ResolutionOption::Uhd2160p => Some(Q::Uhd2160p),
        }
    }
}

/// Mirrors `winrt::Windows::Media::MediaProperties::AudioEncodingQuality`.
/// `Auto` resolves to `Medium` per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    Auto,
    Low,
    Medium,
    High,
}

impl AudioQuality {
    pub fn resolved(self) -> AudioQuality {
        match self {
            AudioQuality::Auto => AudioQuality::Medium,
            other => other,
        }
    }

    pub fn as_winrt(self) -> windows::Media::MediaProperties::AudioEncodingQuality {
        use windows::Media::MediaProperties::AudioEncodingQuality as Q;
        match self.resolved() {
            AudioQuality::Low => Q::Low,
            AudioQuality::Medium => Q::Medium,
            AudioQuality::High => Q::High,
            AudioQuality::Auto => unreachable!("resolved() never returns Auto"),
        }
    }
}

/// The configuration object the shell hands the recorder, §6. Settable
/// either as CLI flags or deserialized from a JSON file/pipe — the same
/// fields either way, matching how the original app accepted a JSON blob on
/// stdin while this crate also exposes it as a normal CLI surface.
#[derive(Debug, Clone, Serialize, Deserialize, clap::Parser)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Target MP4 path.
    #[arg(long)]
    pub filename: String,

    /// Index into `enumerate_monitors()`.
    #[arg(long)]
    pub monitor: usize,

    /// Platform audio endpoint id; empty string means "no audio".
    #[arg(long, default_value = "")]
    pub audio_endpoint: String,

    #[arg(long, value_enum, default_value = "auto")]
    pub resolution_option: ResolutionOption,

    #[arg(long, value_enum, default_value = "auto")]
    pub audio_quality: AudioQuality,

    #[arg(long, default_value_t = 30)]
    pub framerate: u32,

    #[arg(long, default_value_t = 9_000_000)]
    pub bitrate: u32,
}

impl Configuration {
    pub fn wants_audio(&self) -> bool {
        !self.audio_endpoint.is_empty()
    }

    /// Validate `monitor` against a live enumeration. Called before any GPU
    /// object is constructed so an invalid index is a configuration error,
    /// not a GPU-construction failure.
    pub fn validate_monitor<'a>(
        &self,
        monitors: &'a [DesktopMonitor],
    ) -> crate::error::Result<&'a DesktopMonitor> {
        monitors
            .get(self.monitor)
            .ok_or_else(|| crate::error::FatalError::InvalidMonitorIndex(self.monitor).into())
    }
}

/// One entry of the `"monitors"` array in the device-enumeration JSON (§6).
/// Coordinates are relative to the virtual-desktop origin.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorInfo {
    pub name: String,
    pub adapter: String,
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
    pub rotation: u32,
    pub index: usize,
}

/// One entry of the `"microphones"` array.
#[derive(Debug, Clone, Serialize)]
pub struct MicrophoneInfo {
    pub name: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DeviceEnumeration {
    pub monitors: Vec<MonitorInfo>,
    pub microphones: Vec<MicrophoneInfo>,
}

fn rotation_code(rotation: crate::geometry::Rotation) -> u32 {
    use crate::geometry::Rotation as R;
    match rotation {
        R::Identity => 1,
        R::Rotate90 => 2,
        R::Rotate180 => 3,
        R::Rotate270 => 4,
        R::Unspecified => 0,
    }
}

/// Build the device-enumeration JSON payload (§6): monitor bounds are
/// re-expressed relative to the virtual-desktop origin, matching
/// `PrintDevices` in the original sample app.
pub fn device_enumeration(
    monitors: &[DesktopMonitor],
    microphones: &[crate::audio::AudioDevice],
) -> DeviceEnumeration {
    let vd_bounds = crate::gpu::calculate_virtual_desktop_bounds(monitors);
    let monitor_infos = monitors
        .iter()
        .enumerate()
        .map(|(index, m)| MonitorInfo {
            name: m.name.clone(),
            adapter: m.adapter_name.clone(),
            top: m.bounds.top - vd_bounds.top,
            left: m.bounds.left - vd_bounds.left,
            bottom: m.bounds.bottom - vd_bounds.top,
            right: m.bounds.right - vd_bounds.left,
            rotation: rotation_code(m.rotation),
            index,
        })
        .collect();

    let microphone_infos = microphones
        .iter()
        .map(|d| MicrophoneInfo { name: d.friendly_name.clone(), endpoint: d.endpoint.clone() })
        .collect();

    DeviceEnumeration { monitors: monitor_infos, microphones: microphone_infos }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rotation;

    #[test]
    fn audio_quality_auto_resolves_to_medium() {
        assert_eq!(AudioQuality::Auto.resolved(), AudioQuality::Medium);
        assert_eq!(AudioQuality::High.resolved(), AudioQuality::High);
    }

    #[test]
    fn rotation_codes_match_dxgi_mode_rotation_ordinals() {
        assert_eq!(rotation_code(Rotation::Unspecified), 0);
        assert_eq!(rotation_code(Rotation::Identity), 1);
        assert_eq!(rotation_code(Rotation::Rotate90), 2);
        assert_eq!(rotation_code(Rotation::Rotate180), 3);
        assert_eq!(rotation_code(Rotation::Rotate270), 4);
    }

    #[test]
    fn monitor_info_rebases_to_virtual_desktop_origin() {
        // Mirrors what `device_enumeration` computes internally, without
        // constructing a real `DesktopMonitor` (whose `output` field is a
        // live COM handle that unit tests cannot fabricate safely).
        let vd_left = -1920;
        let vd_top = 0;
        let bounds = crate::geometry::Rect::new(0, 0, 1920, 1080);
        let info = MonitorInfo {
            name: "DISPLAY2".into(),
            adapter: "A".into(),
            top: bounds.top - vd_top,
            left: bounds.left - vd_left,
            bottom: bounds.bottom - vd_top,
            right: bounds.right - vd_left,
            rotation: rotation_code(Rotation::Identity),
            index: 1,
        };
        assert_eq!(info.left, 1920);
        assert_eq!(info.top, 0);
    }
}
