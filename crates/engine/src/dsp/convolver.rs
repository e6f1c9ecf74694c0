//! Uniformly partitioned overlap-save convolution.
//!
//! The impulse response is cut into render-quantum sized partitions, each
//! transformed once up front. Every block then costs one forward FFT, one
//! inverse FFT and a multiply-accumulate across the partitions.

use std::sync::Arc;

use beatlayer_transport::AudioArc;
use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::node::{Block, CHANNELS, Processor, RENDER_QUANTUM, RenderInfo};

const FFT_SIZE: usize = RENDER_QUANTUM * 2;
const BINS: usize = FFT_SIZE / 2 + 1;

/// Loudness calibration applied to normalised impulse responses.
const GAIN_CALIBRATION: f32 = 0.00125;
const MIN_POWER: f32 = 0.000125;

struct ChannelState {
    /// Spectra of the IR partitions.
    partitions: Vec<Vec<Complex<f32>>>,
    /// Ring of past input spectra, newest at `head`.
    history: Vec<Vec<Complex<f32>>>,
    /// Previous and current input block, time domain.
    window: Vec<f32>,
}

pub struct Convolver {
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    channels: Vec<ChannelState>,
    head: usize,
    time_scratch: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    accum: Vec<Complex<f32>>,
    forward_scratch: Vec<Complex<f32>>,
    inverse_scratch: Vec<Complex<f32>>,
    scale: f32,
}

impl Convolver {
    /// Prepare the partitioned response. Runs on the control thread.
    pub fn new(impulse: &AudioArc) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(FFT_SIZE);
        let inverse = planner.plan_fft_inverse(FFT_SIZE);

        let frames = impulse.frames();
        let partition_count = frames.div_ceil(RENDER_QUANTUM).max(1);
        let mut forward_scratch = forward.make_scratch_vec();

        let channels = (0..CHANNELS)
            .map(|ch| {
                let partitions = (0..partition_count)
                    .map(|p| {
                        let mut padded = vec![0.0f32; FFT_SIZE];
                        for i in 0..RENDER_QUANTUM {
                            let frame = p * RENDER_QUANTUM + i;
                            if frame < frames {
                                padded[i] = impulse.sample(frame, ch);
                            }
                        }
                        let mut spectrum = forward.make_output_vec();
                        let _ = forward.process_with_scratch(
                            &mut padded,
                            &mut spectrum,
                            &mut forward_scratch,
                        );
                        spectrum
                    })
                    .collect();
                ChannelState {
                    partitions,
                    history: vec![vec![Complex::new(0.0, 0.0); BINS]; partition_count],
                    window: vec![0.0; FFT_SIZE],
                }
            })
            .collect();

        let inverse_scratch = inverse.make_scratch_vec();

        Self {
            forward,
            inverse,
            channels,
            head: 0,
            time_scratch: vec![0.0; FFT_SIZE],
            spectrum: vec![Complex::new(0.0, 0.0); BINS],
            accum: vec![Complex::new(0.0, 0.0); BINS],
            forward_scratch,
            inverse_scratch,
            scale: normalization(impulse) / FFT_SIZE as f32,
        }
    }
}

/// Scale that brings an arbitrary impulse response to a consistent loudness.
fn normalization(impulse: &AudioArc) -> f32 {
    let samples = impulse.samples();
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum();
    let power = (energy / samples.len() as f32).sqrt().max(MIN_POWER);
    let rate_correction = impulse.sample_rate() as f32 / 44100.0;
    GAIN_CALIBRATION / power / rate_correction.max(f32::EPSILON)
}

impl Processor for Convolver {
    fn process(&mut self, input: &Block, output: &mut Block, _info: &RenderInfo) {
        let partition_count = self.channels[0].partitions.len();
        let head = self.head;

        for (ch, state) in self.channels.iter_mut().enumerate() {
            // slide the overlap window and append the new block
            state.window.copy_within(RENDER_QUANTUM.., 0);
            state.window[RENDER_QUANTUM..].copy_from_slice(&input[ch]);

            self.time_scratch.copy_from_slice(&state.window);
            let _ = self.forward.process_with_scratch(
                &mut self.time_scratch,
                &mut self.spectrum,
                &mut self.forward_scratch,
            );
            state.history[head].copy_from_slice(&self.spectrum);

            self.accum.fill(Complex::new(0.0, 0.0));
            for p in 0..partition_count {
                let past = &state.history[(head + partition_count - p) % partition_count];
                let response = &state.partitions[p];
                for ((acc, x), h) in self.accum.iter_mut().zip(past).zip(response) {
                    *acc += x * h;
                }
            }

            // real input spectra keep these bins real
            self.accum[0].im = 0.0;
            self.accum[BINS - 1].im = 0.0;
            let _ = self.inverse.process_with_scratch(
                &mut self.accum,
                &mut self.time_scratch,
                &mut self.inverse_scratch,
            );

            for i in 0..RENDER_QUANTUM {
                output[ch][i] = self.time_scratch[RENDER_QUANTUM + i] * self.scale;
            }
        }

        self.head = (head + 1) % partition_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::SILENT_BLOCK;

    fn run(convolver: &mut Convolver, input: &Block) -> Block {
        let mut out = SILENT_BLOCK;
        convolver.process(
            input,
            &mut out,
            &RenderInfo {
                frame: 0,
                sample_rate: 44100.0,
            },
        );
        out
    }

    #[test]
    fn test_single_tap_impulse_delays_signal() {
        // a unit tap 200 frames in, spanning two partitions
        let mut ir = vec![0.0f32; 300];
        ir[200] = 1.0;
        let impulse = AudioArc::new(ir, 44100, 1);
        let mut convolver = Convolver::new(&impulse);
        let scale = normalization(&impulse);

        let mut input = SILENT_BLOCK;
        input[0][5] = 1.0;
        input[1][5] = 1.0;

        let first = run(&mut convolver, &input);
        assert!(first[0].iter().all(|v| v.abs() < 1.0e-4));

        let second = run(&mut convolver, &SILENT_BLOCK);
        // 5 + 200 = 205 -> block 1, offset 77
        let expected = scale;
        assert!((second[0][77] - expected).abs() < expected * 1.0e-3);
        assert!((second[1][77] - expected).abs() < expected * 1.0e-3);
        assert!(second[0][76].abs() < expected * 1.0e-3);
    }

    #[test]
    fn test_empty_impulse_is_silent() {
        let impulse = AudioArc::new(Vec::new(), 44100, 2);
        let mut convolver = Convolver::new(&impulse);
        let out = run(&mut convolver, &[[1.0; RENDER_QUANTUM]; 2]);
        assert_eq!(out, SILENT_BLOCK);
    }
}
