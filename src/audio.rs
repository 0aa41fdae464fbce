//! Audio device enumeration and the async sample-pump reader.
//!
//! `AudioMedia` mirrors the original app's device-discovery surface;
//! `AsyncAudioReader` replaces its manually ref-counted `IMFSourceReaderCallback`
//! implementation with the `#[windows::core::implement]` generated wrapper,
//! continuously re-arming `ReadSample` from the callback itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;
use windows::core::{Interface, PWSTR};
use windows::Win32::Foundation::HRESULT;
use windows::Win32::Media::MediaFoundation::{
    IMFActivate, IMFAttributes, IMFMediaEvent, IMFMediaSource, IMFMediaType, IMFSample,
    IMFSourceReader, IMFSourceReaderCallback, IMFSourceReaderCallback_Impl, MFCreateAttributes,
    MFCreateDeviceSource, MFCreateSourceReaderFromMediaSource, MFEnumDeviceSources,
    MF_DEVSOURCE_ATTRIBUTE_FRIENDLY_NAME, MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE,
    MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_AUDCAP_ENDPOINT_ID,
    MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_AUDCAP_GUID, MF_SOURCE_READER_ALL_STREAMS,
    MF_SOURCE_READER_ASYNC_CALLBACK, MF_SOURCE_READER_FIRST_AUDIO_STREAM,
};
use windows::Win32::System::Com::CoTaskMemFree;

use crate::error::{FatalError, Result};

/// One recording-capable endpoint, as reported by `MFEnumDeviceSources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    pub friendly_name: String,
    pub endpoint: String,
}

/// Static helpers over the audio-capture device-source category, grounded in
/// `AudioMedia`.
pub struct AudioMedia;

impl AudioMedia {
    pub fn get_audio_recording_devices() -> Result<Vec<AudioDevice>> {
        unsafe {
            let mut attributes: Option<IMFAttributes> = None;
            MFCreateAttributes(&mut attributes, 1).map_err(FatalError::Other)?;
            let attributes = attributes.expect("MFCreateAttributes succeeded without attributes");
            attributes
                .SetGUID(
                    &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE,
                    &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_AUDCAP_GUID,
                )
                .map_err(FatalError::Other)?;

            let mut activates: *mut Option<IMFActivate> = std::ptr::null_mut();
            let mut count: u32 = 0;
            MFEnumDeviceSources(&attributes, &mut activates, &mut count)
                .map_err(FatalError::Other)?;

            let slice = std::slice::from_raw_parts(activates, count as usize);
            let mut result = Vec::with_capacity(count as usize);
            for activate in slice.iter().flatten() {
                if let Some(device) = device_from_activator(activate) {
                    if !device.endpoint.is_empty() {
                        result.push(device);
                    }
                }
            }
            let _ = CoTaskMemFree(Some(activates as *const _));
            Ok(result)
        }
    }

    pub fn get_audio_media_source_from_endpoint(endpoint: &str) -> Result<IMFMediaSource> {
        unsafe {
            let mut attributes: Option<IMFAttributes> = None;
            MFCreateAttributes(&mut attributes, 2).map_err(FatalError::Other)?;
            let attributes = attributes.expect("MFCreateAttributes succeeded without attributes");
            attributes
                .SetGUID(
                    &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE,
                    &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_AUDCAP_GUID,
                )
                .map_err(FatalError::Other)?;
            attributes
                .SetString(
                    &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_AUDCAP_ENDPOINT_ID,
                    &windows::core::HSTRING::from(endpoint),
                )
                .map_err(FatalError::Other)?;

            let mut source: Option<IMFMediaSource> = None;
            MFCreateDeviceSource(&attributes, &mut source).map_err(FatalError::Other)?;
            source.ok_or_else(|| FatalError::Other(windows::core::Error::empty()).into())
        }
    }

    pub fn is_audio_recording_device_available(endpoint: &str) -> Result<bool> {
        let devices = Self::get_audio_recording_devices()?;
        Ok(devices.iter().any(|d| d.endpoint == endpoint))
    }

    /// Query `media_source`'s native audio format via a throwaway
    /// synchronous source reader, so the recorder thread can build the
    /// sink writer's AAC output stream from a real input type before the
    /// async pump ([`AsyncAudioReader`]) is ever started against the same
    /// source.
    pub fn get_native_audio_media_type(media_source: &IMFMediaSource) -> Result<IMFMediaType> {
        let mut reader: Option<IMFSourceReader> = None;
        unsafe { MFCreateSourceReaderFromMediaSource(media_source, None, &mut reader) }
            .map_err(FatalError::Other)?;
        let reader = reader.expect("MFCreateSourceReaderFromMediaSource succeeded without a reader");
        unsafe { reader.GetCurrentMediaType(MF_SOURCE_READER_FIRST_AUDIO_STREAM.0 as u32) }
            .map_err(FatalError::Other)
    }
}

fn device_from_activator(activate: &IMFActivate) -> Option<AudioDevice> {
    unsafe {
        let friendly_name = get_activate_string(activate, &MF_DEVSOURCE_ATTRIBUTE_FRIENDLY_NAME)?;
        let endpoint = get_activate_string(
            activate,
            &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_AUDCAP_ENDPOINT_ID,
        )?;
        Some(AudioDevice { friendly_name, endpoint })
    }
}

unsafe fn get_activate_string(
    activate: &IMFActivate,
    key: &windows::core::GUID,
) -> Option<String> {
    let mut len: u32 = 0;
    activate.GetStringLength(key, &mut len).ok()?;
    let mut buffer = vec![0u16; len as usize + 1];
    let mut written: u32 = 0;
    activate
        .GetString(key, PWSTR(buffer.as_mut_ptr()), buffer.len() as u32, Some(&mut written))
        .ok()?;
    Some(String::from_utf16_lossy(&buffer[..len as usize]))
}

/// The COM object backing the async pump: holds the reader (set once
/// `start()` has created it), the stream it pulls from, and the
/// caller-supplied sample sink.
///
/// `on_sample` is invoked with `Ok` for each successfully delivered sample
/// and with `Err` for a stream failure; it never panics across the COM
/// boundary (the callback methods are `noexcept` on the Win32 side).
#[windows::core::implement(IMFSourceReaderCallback)]
struct ReaderCallback {
    reader_slot: Arc<Mutex<Option<IMFSourceReader>>>,
    stream_index: u32,
    sampling_delay_ms: u32,
    stopping: Arc<AtomicBool>,
    on_sample: Box<dyn Fn(Option<IMFSample>, HRESULT) + Send + Sync>,
}

impl IMFSourceReaderCallback_Impl for ReaderCallback_Impl {
    fn OnReadSample(
        &self,
        hrstatus: HRESULT,
        _dwstreamindex: u32,
        _dwstreamflags: u32,
        _lltimestamp: i64,
        psample: Option<&IMFSample>,
    ) -> windows::core::Result<()> {
        if hrstatus.is_err() {
            (self.on_sample)(None, hrstatus);
        }

        if self.stopping.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(sample) = psample {
            (self.on_sample)(Some(sample.clone()), windows::Win32::Foundation::S_OK);
        }

        std::thread::sleep(std::time::Duration::from_millis(self.sampling_delay_ms as u64));

        if !self.stopping.load(Ordering::SeqCst) {
            if let Err(e) = request_sample(&self.reader_slot, self.stream_index) {
                warn!("async audio reader: re-arm ReadSample failed: {e:?}");
            }
        }

        Ok(())
    }

    fn OnFlush(&self, _dwstreamindex: u32) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnEvent(
        &self,
        _dwstreamindex: u32,
        _pevent: Option<&IMFMediaEvent>,
    ) -> windows::core::Result<()> {
        Ok(())
    }
}

fn request_sample(
    reader_slot: &Arc<Mutex<Option<IMFSourceReader>>>,
    stream_index: u32,
) -> Result<()> {
    let guard = reader_slot.lock().expect("reader slot mutex poisoned");
    let reader = guard
        .as_ref()
        .expect("request_sample called before the source reader is attached");
    unsafe { reader.ReadSample(stream_index, 0, None, None, None, None) }
        .map_err(FatalError::Other)?;
    Ok(())
}

/// A continuously self-re-arming audio sample pump over one media source
/// stream, grounded in `AsyncMediaSourceReader`.
///
/// `stop()` only flags the pump; a read already in flight still delivers its
/// sample and its one re-arm check observes the flag and stops re-arming.
pub struct AsyncAudioReader {
    reader_slot: Arc<Mutex<Option<IMFSourceReader>>>,
    stream_index: u32,
    stopping: Arc<AtomicBool>,
    callback: IMFSourceReaderCallback,
}

impl AsyncAudioReader {
    pub fn new(
        stream_index: u32,
        sampling_delay_ms: u32,
        on_sample: impl Fn(Option<IMFSample>, HRESULT) + Send + Sync + 'static,
    ) -> Self {
        let reader_slot = Arc::new(Mutex::new(None));
        let stopping = Arc::new(AtomicBool::new(false));
        let inner = ReaderCallback {
            reader_slot: reader_slot.clone(),
            stream_index,
            sampling_delay_ms,
            stopping: stopping.clone(),
            on_sample: Box::new(on_sample),
        };
        let callback: IMFSourceReaderCallback = inner.into();
        Self { reader_slot, stream_index, stopping, callback }
    }

    /// Build the source reader against `media_source` with this reader
    /// registered as its async callback, select only `stream_index`, and
    /// issue the first `ReadSample`.
    pub fn start(&self, media_source: &IMFMediaSource) -> Result<()> {
        unsafe {
            let mut attributes: Option<IMFAttributes> = None;
            MFCreateAttributes(&mut attributes, 1).map_err(FatalError::Other)?;
            let attributes = attributes.expect("MFCreateAttributes succeeded without attributes");

            let callback_unknown: windows::core::IUnknown =
                self.callback.cast().map_err(FatalError::Other)?;
            attributes
                .SetUnknown(&MF_SOURCE_READER_ASYNC_CALLBACK, &callback_unknown)
                .map_err(FatalError::Other)?;

            let mut reader: Option<IMFSourceReader> = None;
            MFCreateSourceReaderFromMediaSource(media_source, &attributes, &mut reader)
                .map_err(FatalError::Other)?;
            let reader =
                reader.expect("MFCreateSourceReaderFromMediaSource succeeded without a reader");

            reader
                .SetStreamSelection(MF_SOURCE_READER_ALL_STREAMS.0 as u32, false)
                .map_err(FatalError::Other)?;
            reader
                .SetStreamSelection(self.stream_index, true)
                .map_err(FatalError::Other)?;

            *self.reader_slot.lock().expect("reader slot mutex poisoned") = Some(reader);
        }

        request_sample(&self.reader_slot, self.stream_index)
    }

    /// Flag the pump to stop re-arming. Any read already in flight still
    /// completes and delivers its sample.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_device_equality_is_by_value() {
        let a = AudioDevice { friendly_name: "Mic".into(), endpoint: "{abc}".into() };
        let b = AudioDevice { friendly_name: "Mic".into(), endpoint: "{abc}".into() };
        assert_eq!(a, b);
    }

    #[test]
    fn stop_before_start_is_observed_by_the_reader() {
        let reader = AsyncAudioReader::new(1, 20, |_sample, _status| {});
        assert!(!reader.is_stopping());
        reader.stop();
        assert!(reader.is_stopping());
    }
}
