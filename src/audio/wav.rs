use crate::{MadskiError, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;
use tracing::{debug, info};

/// Decoded audio, always mono
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Channel count of the source before downmixing
    pub source_channels: u16,
}

impl AudioClip {
    pub fn duration_seconds(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

fn read_error(e: hound::Error) -> MadskiError {
    MadskiError::Audio(format!("Failed to read sample: {}", e))
}

/// Read a WAV file into a mono clip
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<AudioClip> {
    let mut reader = WavReader::open(path.as_ref())
        .map_err(|e| MadskiError::Io(format!("Failed to open WAV file: {}", e)))?;

    let spec = reader.spec();
    debug!(
        "Reading WAV file: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, _) => reader
            .samples::<f32>()
            .map(|s| s.map_err(read_error))
            .collect::<Result<_>>()?,
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32).map_err(read_error))
            .collect::<Result<_>>()?,
        (SampleFormat::Int, 24) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8_388_608.0).map_err(read_error))
            .collect::<Result<_>>()?,
        (SampleFormat::Int, 32) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / i32::MAX as f32).map_err(read_error))
            .collect::<Result<_>>()?,
        (_, bits) => {
            return Err(MadskiError::Audio(format!("Unsupported bit depth: {}", bits)));
        }
    };

    let samples = downmix(&samples, spec.channels);
    info!("Read {} samples from {:?}", samples.len(), path.as_ref());

    Ok(AudioClip {
        samples,
        sample_rate: spec.sample_rate,
        source_channels: spec.channels,
    })
}

/// Write mono 16-bit PCM
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path.as_ref(), spec)
        .map_err(|e| MadskiError::Io(format!("Failed to create WAV writer: {}", e)))?;

    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(value)
            .map_err(|e| MadskiError::Io(format!("Failed to write sample: {}", e)))?;
    }

    writer
        .finalize()
        .map_err(|e| MadskiError::Io(format!("Failed to finalize WAV file: {}", e)))
}

/// Average interleaved channels into one
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
