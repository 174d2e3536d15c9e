//! Gain and peak metering for 16-bit little-endian PCM

/// Scale samples in place by `gain_db` and return the peak after gain (0.0 - 1.0).
///
/// Samples are clamped to the i16 range; a trailing odd byte is ignored.
pub fn apply_gain(gain_db: f32, pcm: &mut [u8]) -> f32 {
    scale_samples(db_to_linear(gain_db), pcm)
}

/// Scale samples in place by a linear factor, returning the peak after scaling
pub fn scale_samples(factor: f32, pcm: &mut [u8]) -> f32 {
    let unity = (factor - 1.0).abs() < f32::EPSILON;
    let mut peak: i32 = 0;

    for chunk in pcm.chunks_exact_mut(2) {
        let mut sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        if !unity {
            let scaled = (sample as f32 * factor).round();
            sample = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            chunk.copy_from_slice(&sample.to_le_bytes());
        }
        peak = peak.max((sample as i32).abs());
    }

    (peak as f32 / i16::MAX as f32).min(1.0)
}

pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn samples(pcm: &[u8]) -> Vec<i16> {
        pcm.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect()
    }

    #[test]
    fn test_unity_gain_leaves_samples() {
        let mut data = pcm(&[100, -200, 16384]);
        let peak = apply_gain(0.0, &mut data);
        assert_eq!(samples(&data), vec![100, -200, 16384]);
        assert!((peak - 16384.0 / 32767.0).abs() < 1e-4);
    }

    #[test]
    fn test_gain_doubles_and_clamps() {
        let mut data = pcm(&[1000, -1000, 30000, -30000]);
        let peak = apply_gain(20.0 * 2f32.log10(), &mut data);
        assert_eq!(samples(&data), vec![2000, -2000, i16::MAX, i16::MIN]);
        assert_eq!(peak, 1.0);
    }

    #[test]
    fn test_linear_volume() {
        let mut data = pcm(&[1000, -3000]);
        scale_samples(0.5, &mut data);
        assert_eq!(samples(&data), vec![500, -1500]);

        scale_samples(0.0, &mut data);
        assert_eq!(samples(&data), vec![0, 0]);
    }

    #[test]
    fn test_silence_has_zero_peak() {
        let mut data = vec![0u8; 64];
        assert_eq!(apply_gain(6.0, &mut data), 0.0);
        assert!(data.iter().all(|b| *b == 0));
    }
}
