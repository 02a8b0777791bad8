//! PCM helpers: wire decoding, WAV encoding for STT uploads and resampling of
//! synthesized speech.

use crate::{ParleyError, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::io::Cursor;
use tracing::debug;

/// Decode little-endian 16-bit PCM. A trailing odd byte is dropped.
pub fn pcm16le_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn i16_to_pcm16le(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / i16::MAX as f32).collect()
}

pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

/// Root-mean-square level normalized to 0.0..=1.0
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

pub fn duration_ms(sample_count: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    sample_count as u64 * 1000 / sample_rate as u64
}

/// Encode mono samples as an in-memory 16-bit WAV file
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| audio_error("Failed to create WAV writer", e))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| audio_error("Failed to write sample", e))?;
        }
        writer
            .finalize()
            .map_err(|e| audio_error("Failed to finalize WAV", e))?;
    }

    Ok(cursor.into_inner())
}

/// Mono sinc resampler for converting synthesized speech to the output rate
pub struct AudioResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
}

impl AudioResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(ParleyError::ConfigError(
                "Sample rates must be greater than 0".into(),
            ));
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            2.0,
            params,
            1024,
            1,
        )
        .map_err(|e| audio_error("Failed to create resampler", e))?;

        debug!("Created resampler: {} Hz -> {} Hz", input_rate, output_rate);

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
        })
    }

    /// Resample one complete clip. The filter delay is trimmed from the
    /// start and flushed from the end, so the output lines up with the input
    /// and is `ceil(len * ratio)` frames long.
    pub fn resample(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        self.resampler.reset();

        let (input_rate, output_rate) = (self.input_rate as u64, self.output_rate as u64);
        let expected = (input.len() as u64 * output_rate).div_ceil(input_rate) as usize;
        let delay = self.resampler.output_delay();
        let chunk_size = self.resampler.input_frames_next();
        let mut output = Vec::with_capacity(delay + expected + chunk_size);

        // Past the end of the clip the input is silence, which pushes the tail out
        let mut offset = 0;
        while output.len() < delay + expected {
            let mut chunk = vec![0.0f32; chunk_size];
            if offset < input.len() {
                let take = (input.len() - offset).min(chunk_size);
                chunk[..take].copy_from_slice(&input[offset..offset + take]);
                offset += take;
            }

            let processed = self
                .resampler
                .process(&[chunk], None)
                .map_err(|e| audio_error("Resampling failed", e))?;
            if processed[0].is_empty() {
                break;
            }
            output.extend_from_slice(&processed[0]);
        }

        output.drain(..delay.min(output.len()));
        output.truncate(expected);
        Ok(output)
    }
}

/// Resample 16-bit speech in one step; a no-op when the rates match
pub fn resample_i16(samples: &[i16], input_rate: u32, output_rate: u32) -> Result<Vec<i16>> {
    if input_rate == output_rate {
        return Ok(samples.to_vec());
    }
    let mut resampler = AudioResampler::new(input_rate, output_rate)?;
    let resampled = resampler.resample(&i16_to_f32(samples))?;
    Ok(f32_to_i16(&resampled))
}

fn audio_error(context: &str, e: impl std::fmt::Display) -> ParleyError {
    ParleyError::AudioProcessingError(format!("{}: {}", context, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_decoding() {
        let bytes = [0x01, 0x00, 0xff, 0x7f, 0x00, 0x80, 0x42];
        assert_eq!(pcm16le_to_i16(&bytes), vec![1, i16::MAX, i16::MIN]);
        assert_eq!(i16_to_pcm16le(&[1, i16::MAX, i16::MIN]), bytes[..6].to_vec());
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0; 160]), 0.0);
        let loud = rms(&[i16::MAX; 160]);
        assert!((loud - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_duration() {
        assert_eq!(duration_ms(16000, 16000), 1000);
        assert_eq!(duration_ms(1600, 16000), 100);
        assert_eq!(duration_ms(10, 0), 0);
    }

    #[test]
    fn test_encode_wav_header() {
        let wav = encode_wav(&[0, 1, -1, 100], 16000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 8);

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
    }

    fn tone(len: usize) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * 0.05).sin() * 0.25).collect()
    }

    fn energy(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_resample_lengths() {
        let input: Vec<i16> = tone(2205).iter().map(|s| (s * 32000.0) as i16).collect();
        let same = resample_i16(&input, 22050, 22050).unwrap();
        assert_eq!(same.len(), input.len());

        let down = resample_i16(&input, 22050, 16000).unwrap();
        assert_eq!(down.len(), 1600);
        let up = resample_i16(&input[..100], 22050, 24000).unwrap();
        assert_eq!(up.len(), 109);
    }

    #[test]
    fn test_resample_keeps_the_tail() {
        let input = tone(2205);
        let mut resampler = AudioResampler::new(22050, 16000).unwrap();
        let output = resampler.resample(&input).unwrap();

        let tail = &output[output.len() - 400..];
        let level = energy(&input);
        assert!(energy(tail) > level * 0.7, "{} vs {}", energy(tail), level);

        // Clips are independent of one another
        let again = resampler.resample(&input).unwrap();
        assert_eq!(again.len(), output.len());
        assert!(energy(&again[..100]) > level * 0.7);
    }

    #[test]
    fn test_resample_is_not_delayed() {
        let mut input = vec![0.0f32; 2000];
        input.extend(tone(2000));
        let mut resampler = AudioResampler::new(16000, 24000).unwrap();
        let output = resampler.resample(&input).unwrap();

        let onset = output.iter().position(|s| s.abs() > 0.05).unwrap();
        assert!((2990..3020).contains(&onset), "onset at {}", onset);
    }

    #[test]
    fn test_invalid_rates() {
        assert!(AudioResampler::new(0, 16000).is_err());
        assert!(AudioResampler::new(16000, 0).is_err());
    }
}
