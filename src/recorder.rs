//! `RecorderThread`: orchestrates GPU/desktop setup, runs the per-tick
//! capture loop, and implements the stop/restart/error-recovery state
//! machine described in §4.8.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, trace, warn};
use windows::Win32::Graphics::Direct3D11::ID3D11Device;
use windows::Win32::Media::MediaFoundation::MF_MT_MAJOR_TYPE;
use windows::Win32::System::Power::{
    SetThreadExecutionState, ES_AWAYMODE_REQUIRED, ES_CONTINUOUS, ES_DISPLAY_REQUIRED,
    ES_SYSTEM_REQUIRED,
};
use windows::Win32::System::StationsAndDesktops::{
    CloseDesktop, OpenInputDesktop, SetThreadDesktop, DESKTOP_SWITCHDESKTOP,
};

use crate::audio::{AsyncAudioReader, AudioMedia};
use crate::config::Configuration;
use crate::cursor::CursorState;
use crate::duplication::ScreenDuplicator;
use crate::error::{FatalError, RecorderError, Result};
use crate::gpu::{self, enumerate_monitors, GpuContext};
use crate::media_sample;
use crate::pipeline::{CompositedSample, Pipeline};
use crate::sink::{EncodingContext, SinkWriter};
use crate::virtual_desktop::VirtualDesktop;

/// How long the desktop-attach retry loop waits before declaring the
/// attempt failed. `now - start >= DESKTOP_ATTACH_TIMEOUT` is the corrected
/// comparison (§9 note 1); the source's `start - now` version can never
/// time out since that difference is never positive.
const DESKTOP_ATTACH_TIMEOUT: Duration = Duration::from_secs(3);
const DESKTOP_ATTACH_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A second recoverable failure within this window of the first escalates
/// to fatal (§7 propagation rule).
const RECOVERY_ESCALATION_WINDOW: Duration = Duration::from_secs(1);

/// Shared control surface between the recorder thread and whatever owns
/// it (a CLI main loop, a Ctrl+C handler, a UI shell). Cloning shares the
/// same underlying flags.
#[derive(Clone)]
pub struct RecorderHandle {
    stop: Arc<AtomicBool>,
    last_error: Arc<AtomicI32>,
}

impl Default for RecorderHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RecorderHandle {
    pub fn new() -> Self {
        Self { stop: Arc::new(AtomicBool::new(false)), last_error: Arc::new(AtomicI32::new(0)) }
    }

    /// Request a user-initiated stop. Polled between ticks, inside the
    /// acquire-frame retry loop, and by the audio callback.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// The last fatal error's HRESULT value, or 0 if the recording has not
    /// (yet) failed fatally. Read by the shell after the thread exits.
    pub fn last_fatal_error(&self) -> i32 {
        self.last_error.load(Ordering::SeqCst)
    }

    fn record_fatal(&self, hr: i32) {
        self.last_error.store(hr, Ordering::SeqCst);
    }
}

/// Outcome of one `RecorderThread::run` call, handed back to whatever
/// spawned it so it can decide whether to auto-restart with an
/// incremented filename.
pub enum RecordingOutcome {
    /// The user requested the stop; do not auto-restart.
    StoppedByUser,
    /// The thread exited after a fatal error; the shell may restart with a
    /// fresh filename.
    Fatal(RecorderError),
}

/// Attach the calling thread to the interactive input desktop, retrying
/// every 100 ms for up to 3 s.
fn attach_interactive_desktop() -> Result<()> {
    let start = Instant::now();
    loop {
        match unsafe { OpenInputDesktop(0, false, DESKTOP_SWITCHDESKTOP) } {
            Ok(desktop) => {
                let attached = unsafe { SetThreadDesktop(desktop) };
                let _ = unsafe { CloseDesktop(desktop) };
                if attached.is_ok() {
                    return Ok(());
                }
            }
            Err(_) => {}
        }

        if start.elapsed() >= DESKTOP_ATTACH_TIMEOUT {
            return Err(FatalError::DesktopAttachTimeout.into());
        }
        std::thread::sleep(DESKTOP_ATTACH_RETRY_INTERVAL);
    }
}

/// RAII guard: prevents display/system idle timeout and enables "away
/// mode" for its lifetime, restoring normal execution-state behavior on
/// drop.
struct StayAwakeGuard;

impl StayAwakeGuard {
    fn engage() -> Self {
        unsafe {
            SetThreadExecutionState(
                ES_CONTINUOUS | ES_SYSTEM_REQUIRED | ES_DISPLAY_REQUIRED | ES_AWAYMODE_REQUIRED,
            );
        }
        Self
    }
}

impl Drop for StayAwakeGuard {
    fn drop(&mut self) {
        unsafe {
            SetThreadExecutionState(ES_CONTINUOUS);
        }
    }
}

/// Everything one `RecorderThread::run` invocation needs, built once from
/// a validated [`Configuration`].
struct Session {
    device: ID3D11Device,
    virtual_desktop: VirtualDesktop,
    pipeline: Pipeline,
    cursor: CursorState,
    sink: Arc<SinkWriter>,
    audio: Option<AsyncAudioReader>,
    framerate: u32,
}

impl Session {
    fn build(config: &Configuration) -> Result<Self> {
        let gpu = GpuContext::new()?;
        let adapters = gpu.enumerate_adapters()?;
        let monitors = enumerate_monitors(&adapters)?;
        let monitor = config.validate_monitor(&monitors)?;
        let vd_bounds = gpu::calculate_virtual_desktop_bounds(&monitors);

        let device = adapters[monitor.adapter_index].device().clone();
        let duplicator =
            ScreenDuplicator::new(device.clone(), monitor, monitor.output_index as usize)?;
        let virtual_desktop = VirtualDesktop::new(&device, vd_bounds)?;
        let pipeline = Pipeline::new(device.clone(), duplicator, vd_bounds)?;

        let video_input_media_type = media_sample::video_input_media_type(
            vd_bounds.width() as u32,
            vd_bounds.height() as u32,
            config.framerate,
        )?;

        // Audio needs its native format resolved up front: the sink
        // writer's AAC output stream is built once, at construction, from
        // whatever input type the source actually negotiates.
        let audio_source = if config.wants_audio() {
            if !AudioMedia::is_audio_recording_device_available(&config.audio_endpoint)? {
                warn!(
                    "configured audio endpoint {} is not available, recording video only",
                    config.audio_endpoint
                );
                None
            } else {
                Some(AudioMedia::get_audio_media_source_from_endpoint(&config.audio_endpoint)?)
            }
        } else {
            None
        };

        let audio_input_media_type = match &audio_source {
            Some(source) => Some(AudioMedia::get_native_audio_media_type(source)?),
            None => None,
        };

        let sink = Arc::new(SinkWriter::new(EncodingContext {
            filename: config.filename.clone(),
            resolution_option: config.resolution_option,
            audio_quality: config.audio_quality,
            framerate: config.framerate,
            bitrate: config.bitrate,
            video_input_media_type,
            audio_input_media_type,
            device: device.clone(),
        })?);

        let audio = match audio_source {
            Some(source) => Some(start_audio_pump(source, sink.clone())?),
            None => None,
        };

        Ok(Self {
            device,
            virtual_desktop,
            pipeline,
            cursor: CursorState::new(),
            sink,
            audio,
            framerate: config.framerate.max(1),
        })
    }
}

/// Build and start the async audio pump, writing each delivered sample
/// straight to `sink` from the audio source's own callback thread — the
/// sink writer's internal mutex is what makes this safe to interleave with
/// the recorder thread's video writes.
fn start_audio_pump(
    source: windows::Win32::Media::MediaFoundation::IMFMediaSource,
    sink: Arc<SinkWriter>,
) -> Result<AsyncAudioReader> {
    let stream_index = windows::Win32::Media::MediaFoundation::MF_SOURCE_READER_FIRST_AUDIO_STREAM.0 as u32;
    let reader = AsyncAudioReader::new(stream_index, 0, move |sample, status| {
        if status.is_err() {
            warn!("audio sample delivery failed: {status:?}");
            return;
        }
        let Some(sample) = sample else { return };
        if let Err(e) = unsafe {
            sample.SetGUID(&MF_MT_MAJOR_TYPE, &windows::Win32::Media::MediaFoundation::MFMediaType_Audio)
        } {
            warn!("failed to tag audio sample major type: {e:?}");
            return;
        }
        if let Err(e) = sink.write_sample(&sample) {
            warn!("audio write_sample failed: {e:?}");
        }
    });
    reader.start(&source)?;
    Ok(reader)
}

/// Orchestrates one recording end to end: desktop attach, away-mode,
/// session construction, the tick loop, and teardown.
pub struct RecorderThread;

impl RecorderThread {
    /// Run one recording to completion. Returns once the user stops it or
    /// a fatal error terminates the loop; never auto-restarts itself —
    /// the caller (shell/CLI) decides whether to call this again with an
    /// incremented filename per the auto-restart policy in §4.8.
    pub fn run(config: Configuration, handle: RecorderHandle) -> RecordingOutcome {
        if let Err(e) = attach_interactive_desktop() {
            error!("failed to attach to the interactive input desktop: {e}");
            return fatal_outcome(&handle, e);
        }

        let _stay_awake = StayAwakeGuard::engage();

        let mut session = match Session::build(&config) {
            Ok(s) => s,
            Err(e) => {
                error!("session construction failed: {e}");
                return fatal_outcome(&handle, e);
            }
        };

        if let Err(e) = session.sink.begin() {
            error!("sink writer begin() failed: {e}");
            return fatal_outcome(&handle, e);
        }

        let outcome = Self::tick_loop(&mut session, &handle, &config);
        Self::teardown(&session, outcome, &handle)
    }

    fn tick_loop(
        session: &mut Session,
        handle: &RecorderHandle,
        config: &Configuration,
    ) -> RecordingOutcome {
        let tick_interval = Duration::from_millis(1000 / session.framerate as u64);
        let mut last_recovery: Option<Instant> = None;

        while !handle.stop_requested() {
            let tick_start = Instant::now();

            match session.pipeline.tick(&mut session.virtual_desktop, &mut session.cursor) {
                Ok(Some(composited)) => {
                    if let Err(e) = Self::emit_sample(session, composited) {
                        warn!("failed to emit composited sample: {e}");
                    }
                }
                Ok(None) => {
                    if let Err(e) = session.sink.signal_gap() {
                        warn!("signal_gap failed: {e}");
                    }
                }
                Err(RecorderError::Transient(hr)) => {
                    trace!("transient capture condition {hr:?}, skipping tick");
                }
                Err(RecorderError::Recoverable { kind, source }) => {
                    warn!("recoverable GPU condition ({kind:?}): {source:?}, rebuilding pipeline");
                    if let Err(escalated) = Self::handle_recoverable(session, config, &mut last_recovery) {
                        error!("recovery escalated to fatal: {escalated}");
                        return RecordingOutcome::Fatal(escalated);
                    }
                }
                Err(RecorderError::Fatal(e)) => {
                    return RecordingOutcome::Fatal(RecorderError::Fatal(e));
                }
            }

            let elapsed = tick_start.elapsed();
            if elapsed < tick_interval {
                std::thread::sleep(tick_interval - elapsed);
            }
        }

        RecordingOutcome::StoppedByUser
    }

    fn emit_sample(session: &mut Session, composited: CompositedSample) -> Result<()> {
        let pool = session
            .pipeline
            .texture_pool_handle()
            .expect("a composited sample implies the pool was initialized");
        let sample = media_sample::wrap_texture_as_sample(composited.texture(), pool)?;
        session.sink.write_sample(&sample)?;
        // The sample's tracked-sample release callback now owns the path
        // back to the pool; detach so our copy doesn't also release it.
        composited.detach();
        Ok(())
    }

    /// Rebuild the duplicator and invalidate the pipeline's cached surface
    /// views after a recoverable GPU error. A second recoverable failure
    /// within [`RECOVERY_ESCALATION_WINDOW`] of the first escalates to
    /// fatal.
    fn handle_recoverable(
        session: &mut Session,
        config: &Configuration,
        last_recovery: &mut Option<Instant>,
    ) -> Result<()> {
        let now = Instant::now();
        if let Some(previous) = *last_recovery {
            if now.duration_since(previous) < RECOVERY_ESCALATION_WINDOW {
                return Err(FatalError::Other(windows::core::Error::empty()).into());
            }
        }
        *last_recovery = Some(now);

        let gpu = GpuContext::new()?;
        let adapters = gpu.enumerate_adapters()?;
        let monitors = enumerate_monitors(&adapters)?;

        let current = config.validate_monitor(&monitors)?;
        let recovery_key = current.recovery_key();
        let rematched = recovery_key
            .as_ref()
            .and_then(|key| monitors.iter().find(|m| m.recovery_key().as_ref() == Some(key)));
        let monitor = rematched.unwrap_or(current);

        let device = adapters[monitor.adapter_index].device().clone();
        let vd_bounds = gpu::calculate_virtual_desktop_bounds(&monitors);
        session.virtual_desktop.reset_if_bounds_changed(&device, vd_bounds)?;
        session.pipeline.invalidate_surface_views();

        let duplicator =
            ScreenDuplicator::new(device.clone(), monitor, monitor.output_index as usize)?;
        session.pipeline = Pipeline::new(device.clone(), duplicator, vd_bounds)?;
        session.device = device;
        Ok(())
    }

    fn teardown(session: &Session, outcome: RecordingOutcome, handle: &RecorderHandle) -> RecordingOutcome {
        if let Some(audio) = &session.audio {
            audio.stop();
        }

        if session.sink.is_writing() {
            if let Err(e) = session.sink.end() {
                warn!("sink writer end() during teardown failed: {e}");
            }
        }

        if let Ok(context) = unsafe { session.device.GetImmediateContext() } {
            unsafe {
                context.ClearState();
                context.Flush();
            }
        }

        if let RecordingOutcome::Fatal(e) = &outcome {
            handle.record_fatal(error_hresult(e));
        }

        info!("recorder thread exiting");
        outcome
    }
}

fn fatal_outcome(handle: &RecorderHandle, e: RecorderError) -> RecordingOutcome {
    handle.record_fatal(error_hresult(&e));
    RecordingOutcome::Fatal(e)
}

fn error_hresult(e: &RecorderError) -> i32 {
    match e {
        RecorderError::Transient(hr) => hr.0,
        RecorderError::Recoverable { source, .. } => source.code().0,
        RecorderError::Fatal(FatalError::Other(err)) => err.code().0,
        RecorderError::Fatal(FatalError::DeviceCreation(err)) => err.code().0,
        RecorderError::Fatal(FatalError::SinkWriterCreation(err)) => err.code().0,
        RecorderError::Fatal(FatalError::SinkWriterIo(err)) => err.code().0,
        RecorderError::Fatal(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_defaults_to_not_stopped() {
        let handle = RecorderHandle::new();
        assert!(!handle.stop_requested());
        assert_eq!(handle.last_fatal_error(), 0);
    }

    #[test]
    fn request_stop_is_observed() {
        let handle = RecorderHandle::new();
        handle.request_stop();
        assert!(handle.stop_requested());
    }

    #[test]
    fn fatal_error_recorded_is_read_back() {
        let handle = RecorderHandle::new();
        handle.record_fatal(-2005270490);
        assert_eq!(handle.last_fatal_error(), -2005270490);
    }
}
