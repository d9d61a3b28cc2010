//! CPAL output stream driving the loop engine
//!
//! ```text
//! ┌──────────────────┐   commands (rtrb)    ┌─────────────────────┐
//! │  Control thread  │─────────────────────►│  CPAL audio thread  │
//! │   (scheduler)    │   automation lanes   │  (owns LoopEngine)  │
//! └──────────────────┘─────────────────────►└─────────────────────┘
//! ```
//!
//! The callback renders into a scratch buffer allocated up front and
//! interleaves it into the device buffer. Requests larger than the scratch
//! are rendered in several passes.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};

use super::error::{AudioError, AudioResult};
use crate::config::LooperConfig;
use crate::engine::LoopEngine;
use crate::types::{StereoBuffer, StereoSample};

/// Frames rendered per pass inside the device callback
pub const MAX_CALLBACK_FRAMES: usize = 8192;

/// Keeps the output stream alive. Drop this to stop audio.
pub struct AudioOutputHandle {
    _stream: Stream,
    device_name: String,
    sample_rate: u32,
    channels: u16,
}

impl AudioOutputHandle {
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

/// Open the default output device and start rendering `engine` into it
///
/// The device must offer f32 output at the configured sample rate; the
/// engine's timing is built around that rate and is never resampled.
pub fn start_audio_output(
    config: &LooperConfig,
    engine: LoopEngine,
) -> AudioResult<AudioOutputHandle> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoDefaultDevice)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Using audio device: {}", device_name);

    let ranges: Vec<SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .collect();
    let range = select_output_config(&ranges, config.sample_rate)?;

    let stream_config = StreamConfig {
        channels: range.channels(),
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    log::info!(
        "Audio config: {} channels, {}Hz, engine blocks of {} frames",
        stream_config.channels,
        config.sample_rate,
        config.block_size
    );

    let stream = build_output_stream(&device, &stream_config, engine)?;
    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
    log::info!("Audio stream started");

    Ok(AudioOutputHandle {
        _stream: stream,
        device_name,
        sample_rate: config.sample_rate,
        channels: stream_config.channels,
    })
}

/// Pick an f32, at-least-stereo configuration that covers `sample_rate`
fn select_output_config(
    ranges: &[SupportedStreamConfigRange],
    sample_rate: u32,
) -> AudioResult<&SupportedStreamConfigRange> {
    let stereo_f32: Vec<&SupportedStreamConfigRange> = ranges
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32 && c.channels() >= 2)
        .collect();

    if stereo_f32.is_empty() {
        return Err(AudioError::UnsupportedFormat(
            "device has no f32 stereo output".to_string(),
        ));
    }

    stereo_f32
        .iter()
        .copied()
        .find(|c| (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&sample_rate))
        .ok_or_else(|| AudioError::SampleRateMismatch {
            engine: sample_rate,
            min: stereo_f32
                .iter()
                .map(|c| c.min_sample_rate().0)
                .min()
                .unwrap_or(0),
            max: stereo_f32
                .iter()
                .map(|c| c.max_sample_rate().0)
                .max()
                .unwrap_or(0),
        })
}

fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    mut engine: LoopEngine,
) -> AudioResult<Stream> {
    let channels = config.channels as usize;
    let mut scratch = StereoBuffer::silence(MAX_CALLBACK_FRAMES);

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                for chunk in data.chunks_mut(MAX_CALLBACK_FRAMES * channels) {
                    let frames = chunk.len() / channels;
                    let block = &mut scratch.as_mut_slice()[..frames];
                    engine.process_slice(block);
                    write_interleaved(chunk, block, channels);
                }
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}

/// Copy stereo frames into an interleaved device buffer
///
/// Channels beyond the first two are silenced.
fn write_interleaved(out: &mut [f32], block: &[StereoSample], channels: usize) {
    for (frame, sample) in out.chunks_mut(channels).zip(block.iter()) {
        frame[0] = sample.left;
        if channels > 1 {
            frame[1] = sample.right;
        }
        for extra in frame.iter_mut().skip(2) {
            *extra = 0.0;
        }
    }
}
