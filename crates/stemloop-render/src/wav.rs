//! WAV decoding into stems and encoding of the rendered mix

use std::path::Path;

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use stemloop_core::{Stem, StemKind, StereoBuffer, StereoSample};

/// Decode a WAV file into a stem
///
/// Mono files are duplicated to both sides; channels past the second are
/// ignored.
pub fn read_stem(path: &Path, name: &str, kind: StemKind, bpm: f64) -> Result<Stem> {
    let mut reader =
        WavReader::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        bail!("{:?} has no channels", path);
    }

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .with_context(|| format!("Failed to decode {:?}", path))?,
        SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .with_context(|| format!("Failed to decode {:?}", path))?
        }
    };

    let frames: Vec<StereoSample> = samples
        .chunks_exact(channels)
        .map(|frame| match frame {
            [mono] => StereoSample::mono(*mono),
            [left, right, ..] => StereoSample::new(*left, *right),
            [] => StereoSample::silence(),
        })
        .collect();

    log::info!(
        "Loaded stem '{}': {} frames at {}Hz from {:?}",
        name,
        frames.len(),
        spec.sample_rate,
        path
    );
    Ok(Stem::new(
        name,
        kind,
        bpm,
        spec.sample_rate,
        StereoBuffer::from_vec(frames),
    ))
}

/// Write stereo frames as a 32-bit float WAV
pub fn write_wav(path: &Path, frames: &[StereoSample], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer =
        WavWriter::create(path, spec).with_context(|| format!("Failed to create {:?}", path))?;
    for frame in frames {
        writer.write_sample(frame.left)?;
        writer.write_sample(frame.right)?;
    }
    writer
        .finalize()
        .with_context(|| format!("Failed to finish {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_int_wav_becomes_stereo_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for value in [0_i16, 16_384, -32_768] {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();

        let stem = read_stem(&path, "mono", StemKind::Bass, 90.0).unwrap();
        assert_eq!(stem.sample_rate, 44_100);
        assert_eq!(stem.len_frames(), 3);
        assert_eq!(stem.audio.as_slice()[1], StereoSample::mono(0.5));
        assert_eq!(stem.audio.as_slice()[2], StereoSample::mono(-1.0));
    }

    #[test]
    fn test_written_mix_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mix.wav");
        let frames = [StereoSample::new(0.25, -0.25), StereoSample::new(1.0, 0.0)];
        write_wav(&path, &frames, 48_000).unwrap();

        let stem = read_stem(&path, "mix", StemKind::Other, 120.0).unwrap();
        assert_eq!(stem.audio.as_slice(), &frames);
    }
}
