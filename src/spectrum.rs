use realfft::num_complex::Complex32;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ring::RingBuffer;
use crate::types::{MAX_LEVEL, NUM_BANDS, SpectrumBands};

/// Stereo frames per analysis window.
pub const FFT_SIZE: usize = 256;
/// Bytes of 16-bit stereo PCM needed for one window.
pub const WINDOW_BYTES: usize = FFT_SIZE * 4;

const BINS_PER_BAND: usize = (FFT_SIZE / 2) / NUM_BANDS;
const LAST_BIN: usize = FFT_SIZE / 2 - 1;
const REFERENCE_MAGNITUDE: f32 = FFT_SIZE as f32 / 2.0;
const EPSILON: f32 = 1e-10;
// levels start at -65 dB and climb one step per 5 dB
const DB_FLOOR: f32 = -65.0;
const DB_PER_LEVEL: f32 = 5.0;

pub struct SpectrumAnalyzer {
    r2c: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    snapshot: Box<[u8]>,
    bands: SpectrumBands,
    interval: Duration,
    last_run: Option<Instant>,
}

impl SpectrumAnalyzer {
    pub fn new(interval: Duration) -> SpectrumAnalyzer {
        let mut planner = RealFftPlanner::<f32>::new();
        let r2c = planner.plan_fft_forward(FFT_SIZE);

        let input = r2c.make_input_vec();
        let spectrum = r2c.make_output_vec();
        let scratch = r2c.make_scratch_vec();

        // symmetric Hamming
        let window: Vec<f32> = (0..FFT_SIZE)
            .map(|i| {
                let n = i as f32;
                0.54 - 0.46 * ((2.0 * std::f32::consts::PI * n) / (FFT_SIZE - 1) as f32).cos()
            })
            .collect();

        SpectrumAnalyzer {
            r2c,
            window,
            input,
            spectrum,
            scratch,
            snapshot: vec![0u8; WINDOW_BYTES].into_boxed_slice(),
            bands: SpectrumBands::default(),
            interval,
            last_run: None,
        }
    }

    pub fn bands(&self) -> SpectrumBands {
        self.bands
    }

    /// Refreshes the bands from the oldest window in `ring` without removing
    /// anything. Calls closer together than the configured interval, or made
    /// while less than one window is buffered, leave the bands as they were.
    /// Returns whether the bands were recomputed.
    pub fn update(&mut self, ring: &RingBuffer, now: Instant) -> bool {
        if let Some(last) = self.last_run {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_run = Some(now);

        if ring.available_to_read() < WINDOW_BYTES {
            return false;
        }
        // playback may have drained some bytes since the check
        if ring.peek(0, &mut self.snapshot) < WINDOW_BYTES {
            return false;
        }

        let snapshot = std::mem::take(&mut self.snapshot);
        let done = self.analyze(&snapshot);
        self.snapshot = snapshot;
        done
    }

    /// Computes the bands for one window of interleaved 16-bit little-endian
    /// stereo PCM.
    pub fn analyze(&mut self, pcm: &[u8]) -> bool {
        if pcm.len() < WINDOW_BYTES {
            return false;
        }

        for (i, frame) in pcm.chunks_exact(4).take(FFT_SIZE).enumerate() {
            let left = i16::from_le_bytes([frame[0], frame[1]]) as f32;
            let right = i16::from_le_bytes([frame[2], frame[3]]) as f32;
            let mono = (left + right) / 2.0 / 32768.0;
            self.input[i] = mono * self.window[i];
        }

        if let Err(e) =
            self.r2c
                .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
        {
            log::error!("spectrum transform failed: {}", e);
            return false;
        }

        let mut levels = [0u8; NUM_BANDS];
        for (b, level) in levels.iter_mut().enumerate() {
            let start = 1 + b * BINS_PER_BAND;
            let end = (start + BINS_PER_BAND - 1).min(LAST_BIN);

            let peak = self.spectrum[start..=end]
                .iter()
                .map(|c| c.norm())
                .fold(0.0f32, f32::max);

            *level = magnitude_to_level(peak);
        }

        self.bands = SpectrumBands::from_levels(levels);
        true
    }
}

fn magnitude_to_level(magnitude: f32) -> u8 {
    let db = 20.0 * (magnitude / REFERENCE_MAGNITUDE + EPSILON).log10();
    let height = ((db - DB_FLOOR) / DB_PER_LEVEL) as i32;
    height.clamp(0, MAX_LEVEL as i32) as u8
}
