//! The concrete Media Foundation Sink Writer: builds the MP4 (H.264 + AAC)
//! output media types from a [`EncodingContext`] and serializes writes under
//! one mutex, grounded in `ScreenMediaSinkWriter`.

use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use windows::core::HSTRING;
use windows::Media::MediaProperties::{AudioEncodingQuality, MediaEncodingProfile, VideoEncodingQuality};
use windows::Win32::Graphics::Direct3D11::ID3D11Device;
use windows::Win32::Media::MediaFoundation::{
    IMFAttributes, IMFDXGIDeviceManager, IMFMediaType, IMFSample, IMFSinkWriter,
    MFCreateAttributes, MFCreateDXGIDeviceManager, MFCreateMediaType, MFCreateSinkWriterFromURL,
    MFGetAttributeSize, MFSetAttributeRatio, MFSetAttributeSize, MFAudioFormat_AAC,
    MFMediaType_Audio, MFMediaType_Video, MFVideoFormat_H264, MFVideoInterlace_Progressive,
    MF_LOW_LATENCY, MF_MT_AAC_AUDIO_PROFILE_LEVEL_INDICATION, MF_MT_AAC_PAYLOAD_TYPE,
    MF_MT_AUDIO_AVG_BYTES_PER_SECOND, MF_MT_AUDIO_BITS_PER_SAMPLE, MF_MT_AUDIO_NUM_CHANNELS,
    MF_MT_AUDIO_SAMPLES_PER_SECOND, MF_MT_AVG_BITRATE, MF_MT_FRAME_RATE, MF_MT_FRAME_SIZE,
    MF_MT_INTERLACE_MODE, MF_MT_MAJOR_TYPE, MF_MT_MPEG2_PROFILE, MF_MT_SUBTYPE,
    MF_READWRITE_ENABLE_HARDWARE_TRANSFORMS, MF_SINK_WRITER_D3D_MANAGER,
    MF_SINK_WRITER_DISABLE_THROTTLING,
};

use crate::config::{AudioQuality, ResolutionOption};
use crate::error::{FatalError, Result};

/// Everything the sink writer needs to construct its media types, grounded
/// in `EncodingContext`. Built by the recorder thread once the duplicator's
/// video input media type (and, if recording audio, the device's audio
/// input media type) are known.
pub struct EncodingContext {
    pub filename: String,
    pub resolution_option: ResolutionOption,
    pub audio_quality: AudioQuality,
    pub framerate: u32,
    pub bitrate: u32,
    pub video_input_media_type: IMFMediaType,
    pub audio_input_media_type: Option<IMFMediaType>,
    pub device: ID3D11Device,
}

struct WritingState {
    is_writing: bool,
    write_start: Option<(Instant, SystemTime)>,
    device_manager: IMFDXGIDeviceManager,
    device: ID3D11Device,
}

/// Owns the `IMFSinkWriter` and the two stream indices it was configured
/// with. `begin()`/`write_sample()`/`end()` all serialize through one
/// mutex, matching the original's single `std::mutex` guarding every call.
pub struct SinkWriter {
    sink_writer: IMFSinkWriter,
    manager_reset_token: u32,
    video_stream_index: u32,
    audio_stream_index: Option<u32>,
    video_frame_duration: u32,
    state: Mutex<WritingState>,
}

impl SinkWriter {
    pub fn new(ctx: EncodingContext) -> Result<Self> {
        let quality = ctx.resolution_option.as_winrt().unwrap_or(VideoEncodingQuality::Auto);
        let profile = MediaEncodingProfile::CreateMp4(quality).map_err(FatalError::Other)?;
        let video_props = profile.Video().map_err(FatalError::Other)?;

        let mut bit_rate = video_props.Bitrate().map_err(FatalError::Other)?;
        let frame_rate = video_props.FrameRate().map_err(FatalError::Other)?;
        let mut width = video_props.Width().map_err(FatalError::Other)?;
        let mut height = video_props.Height().map_err(FatalError::Other)?;
        let profile_id = video_props.ProfileId().map_err(FatalError::Other)?;

        if ctx.resolution_option == ResolutionOption::Auto {
            unsafe {
                MFGetAttributeSize(&ctx.video_input_media_type, &MF_MT_FRAME_SIZE, &mut width, &mut height)
            }
            .map_err(FatalError::Other)?;
        }

        if ctx.framerate != 0 {
            frame_rate.SetNumerator(ctx.framerate).map_err(FatalError::Other)?;
            frame_rate.SetDenominator(1).map_err(FatalError::Other)?;
        }
        if ctx.bitrate != 0 {
            bit_rate = ctx.bitrate;
        }

        let numerator = frame_rate.Numerator().map_err(FatalError::Other)?;
        let denominator = frame_rate.Denominator().map_err(FatalError::Other)?;
        let video_frame_duration = (10 * 1000 * 1000) / (numerator / denominator).max(1);

        let mut manager_reset_token = 0u32;
        let mut device_manager: Option<IMFDXGIDeviceManager> = None;
        unsafe { MFCreateDXGIDeviceManager(&mut manager_reset_token, &mut device_manager) }
            .map_err(FatalError::Other)?;
        let device_manager =
            device_manager.expect("MFCreateDXGIDeviceManager succeeded without a manager");
        unsafe { device_manager.ResetDevice(&ctx.device, manager_reset_token) }
            .map_err(FatalError::Other)?;

        let mut attributes: Option<IMFAttributes> = None;
        unsafe { MFCreateAttributes(&mut attributes, 4) }.map_err(FatalError::Other)?;
        let attributes = attributes.expect("MFCreateAttributes succeeded without attributes");
        unsafe {
            attributes.SetUINT32(&MF_READWRITE_ENABLE_HARDWARE_TRANSFORMS, 1).map_err(FatalError::Other)?;
            attributes.SetUINT32(&MF_LOW_LATENCY, 1).map_err(FatalError::Other)?;
            attributes.SetUINT32(&MF_SINK_WRITER_DISABLE_THROTTLING, 1).map_err(FatalError::Other)?;
            attributes
                .SetUnknown(&MF_SINK_WRITER_D3D_MANAGER, &device_manager)
                .map_err(FatalError::Other)?;
        }

        let mut sink_writer: Option<IMFSinkWriter> = None;
        unsafe {
            MFCreateSinkWriterFromURL(
                &HSTRING::from(&ctx.filename),
                None,
                &attributes,
                &mut sink_writer,
            )
        }
        .map_err(FatalError::SinkWriterCreation)?;
        let sink_writer =
            sink_writer.expect("MFCreateSinkWriterFromURL succeeded without a sink writer");

        let mut video_output_type: Option<IMFMediaType> = None;
        unsafe { MFCreateMediaType(&mut video_output_type) }.map_err(FatalError::Other)?;
        let video_output_type =
            video_output_type.expect("MFCreateMediaType succeeded without a media type");
        unsafe {
            video_output_type.SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Video).map_err(FatalError::Other)?;
            video_output_type.SetUINT32(&MF_MT_MPEG2_PROFILE, profile_id).map_err(FatalError::Other)?;
            video_output_type.SetGUID(&MF_MT_SUBTYPE, &MFVideoFormat_H264).map_err(FatalError::Other)?;
            video_output_type.SetUINT32(&MF_MT_AVG_BITRATE, bit_rate).map_err(FatalError::Other)?;
            video_output_type
                .SetUINT32(&MF_MT_INTERLACE_MODE, MFVideoInterlace_Progressive.0 as u32)
                .map_err(FatalError::Other)?;
            MFSetAttributeSize(&video_output_type, &MF_MT_FRAME_SIZE, width, height)
                .map_err(FatalError::Other)?;
            MFSetAttributeRatio(&video_output_type, &MF_MT_FRAME_RATE, numerator, denominator)
                .map_err(FatalError::Other)?;
        }

        let mut video_stream_index = 0u32;
        unsafe { sink_writer.AddStream(&video_output_type, &mut video_stream_index) }
            .map_err(FatalError::SinkWriterCreation)?;
        unsafe {
            sink_writer.SetInputMediaType(video_stream_index, &ctx.video_input_media_type, None)
        }
        .map_err(FatalError::SinkWriterCreation)?;

        let audio_stream_index = match &ctx.audio_input_media_type {
            None => None,
            Some(audio_input_type) => {
                let audio_profile = MediaEncodingProfile::CreateM4a(ctx.audio_quality.as_winrt())
                    .map_err(FatalError::Other)?;
                let audio_props = audio_profile.Audio().map_err(FatalError::Other)?;

                let bits_per_sample = audio_props.BitsPerSample().map_err(FatalError::Other)?;
                let sample_rate = audio_props.SampleRate().map_err(FatalError::Other)?;
                let channel_count = audio_props.ChannelCount().map_err(FatalError::Other)?;
                let bitrate = audio_props.Bitrate().map_err(FatalError::Other)? / 8;

                let mut audio_output_type: Option<IMFMediaType> = None;
                unsafe { MFCreateMediaType(&mut audio_output_type) }.map_err(FatalError::Other)?;
                let audio_output_type =
                    audio_output_type.expect("MFCreateMediaType succeeded without a media type");

                const AAC_PAYLOAD_TYPE: u32 = 0;
                const AAC_PROFILE_LEVEL_INDICATION: u32 = 0x29;
                unsafe {
                    audio_output_type.SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Audio).map_err(FatalError::Other)?;
                    audio_output_type.SetGUID(&MF_MT_SUBTYPE, &MFAudioFormat_AAC).map_err(FatalError::Other)?;
                    audio_output_type
                        .SetUINT32(&MF_MT_AUDIO_BITS_PER_SAMPLE, bits_per_sample)
                        .map_err(FatalError::Other)?;
                    audio_output_type
                        .SetUINT32(&MF_MT_AUDIO_SAMPLES_PER_SECOND, sample_rate)
                        .map_err(FatalError::Other)?;
                    audio_output_type
                        .SetUINT32(&MF_MT_AUDIO_NUM_CHANNELS, channel_count)
                        .map_err(FatalError::Other)?;
                    audio_output_type
                        .SetUINT32(&MF_MT_AUDIO_AVG_BYTES_PER_SECOND, bitrate)
                        .map_err(FatalError::Other)?;
                    audio_output_type
                        .SetUINT32(&MF_MT_AAC_PAYLOAD_TYPE, AAC_PAYLOAD_TYPE)
                        .map_err(FatalError::Other)?;
                    audio_output_type
                        .SetUINT32(&MF_MT_AAC_AUDIO_PROFILE_LEVEL_INDICATION, AAC_PROFILE_LEVEL_INDICATION)
                        .map_err(FatalError::Other)?;
                }

                let mut audio_stream_index = 0u32;
                unsafe { sink_writer.AddStream(&audio_output_type, &mut audio_stream_index) }
                    .map_err(FatalError::SinkWriterCreation)?;
                unsafe { sink_writer.SetInputMediaType(audio_stream_index, audio_input_type, None) }
                    .map_err(FatalError::SinkWriterCreation)?;
                Some(audio_stream_index)
            }
        };

        Ok(Self {
            sink_writer,
            manager_reset_token,
            video_stream_index,
            audio_stream_index,
            video_frame_duration,
            state: Mutex::new(WritingState {
                is_writing: false,
                write_start: None,
                device_manager,
                device: ctx.device,
            }),
        })
    }

    /// Start writing. On failure the writer reverts to not-writing so a
    /// caller can retry.
    pub fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().expect("sink writer mutex poisoned");
        state.is_writing = true;
        match unsafe { self.sink_writer.BeginWriting() } {
            Ok(()) => {
                state.write_start = Some((Instant::now(), SystemTime::now()));
                Ok(())
            }
            Err(e) => {
                state.is_writing = false;
                Err(FatalError::SinkWriterIo(e).into())
            }
        }
    }

    /// Notify the writer of a skipped tick (no new frame to encode) so the
    /// encoder's internal clock does not fall behind real time.
    pub fn signal_gap(&self) -> Result<()> {
        let state = self.state.lock().expect("sink writer mutex poisoned");
        let (start, _) = state
            .write_start
            .expect("signal_gap called before begin()");
        let frame_time = (start.elapsed().as_nanos() / 100) as i64;
        unsafe { self.sink_writer.SendStreamTick(self.video_stream_index, frame_time) }
            .map_err(FatalError::SinkWriterIo)?;
        Ok(())
    }

    /// Rebind the sink writer's device manager to a freshly recreated
    /// device, used when the pipeline recovers from a device-removed
    /// condition mid-recording.
    pub fn reset_device(&self, device: ID3D11Device) -> Result<()> {
        let mut state = self.state.lock().expect("sink writer mutex poisoned");
        if !state.is_writing {
            panic!("reset_device called before begin()");
        }
        unsafe { state.device_manager.ResetDevice(&device, self.manager_reset_token) }
            .map_err(FatalError::SinkWriterIo)?;
        state.device = device;
        Ok(())
    }

    /// Write one sample, video or audio, distinguished by `MF_MT_MAJOR_TYPE`
    /// on the sample's current media type.
    pub fn write_sample(&self, sample: &IMFSample) -> Result<()> {
        let state = self.state.lock().expect("sink writer mutex poisoned");
        let (start, wall_start) = state
            .write_start
            .expect("write_sample called before begin()");

        let sample_type = unsafe { sample.GetGUID(&MF_MT_MAJOR_TYPE) }.map_err(FatalError::Other)?;

        if sample_type == MFMediaType_Video {
            let frame_time = (start.elapsed().as_nanos() / 100) as i64;
            unsafe {
                sample.SetSampleTime(frame_time).map_err(FatalError::Other)?;
                sample.SetSampleDuration(self.video_frame_duration as i64).map_err(FatalError::Other)?;
                self.sink_writer.WriteSample(self.video_stream_index, sample)
            }
            .map_err(FatalError::SinkWriterIo)?;
        } else if sample_type == MFMediaType_Audio {
            let audio_stream_index = self
                .audio_stream_index
                .expect("audio sample written without an audio stream configured");
            let sample_time = unsafe { sample.GetSampleTime() }.map_err(FatalError::Other)?;
            let start_time_100ns = (wall_start
                .duration_since(UNIX_EPOCH)
                .expect("system clock before the unix epoch")
                .as_nanos()
                / 100) as i64;
            unsafe {
                sample.SetSampleTime(sample_time - start_time_100ns).map_err(FatalError::Other)?;
                self.sink_writer.WriteSample(audio_stream_index, sample)
            }
            .map_err(FatalError::SinkWriterIo)?;
        }

        Ok(())
    }

    /// Flush and finalize. Idempotent only in the sense that a second call
    /// after a successful `end()` panics, mirroring the original's
    /// not-writing guard.
    pub fn end(&self) -> Result<()> {
        let mut state = self.state.lock().expect("sink writer mutex poisoned");
        if !state.is_writing {
            panic!("end called when the sink writer was not writing");
        }
        unsafe { self.sink_writer.Flush(self.video_stream_index) }.map_err(FatalError::SinkWriterIo)?;
        if let Some(audio_stream_index) = self.audio_stream_index {
            unsafe { self.sink_writer.Flush(audio_stream_index) }.map_err(FatalError::SinkWriterIo)?;
        }
        unsafe { self.sink_writer.Finalize() }.map_err(FatalError::SinkWriterIo)?;
        state.is_writing = false;
        Ok(())
    }

    pub fn is_writing(&self) -> bool {
        self.state.lock().expect("sink writer mutex poisoned").is_writing
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        if self.is_writing() {
            if let Err(e) = self.end() {
                log::warn!("sink writer: end() during drop failed: {e:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_frame_duration_matches_30fps() {
        let duration = (10 * 1000 * 1000) / (30u32 / 1u32).max(1);
        assert_eq!(duration, 333_333);
    }
}
