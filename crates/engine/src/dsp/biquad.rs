//! RBJ cookbook second-order filters.

use beatlayer_transport::FilterType;

use crate::node::{Block, CHANNELS, ParamKind, Processor, RENDER_QUANTUM, RenderInfo};
use crate::param::AudioParam;

#[derive(Debug, Clone, Copy, Default)]
struct Coeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Coeffs {
    fn design(kind: FilterType, frequency: f32, q: f32, sample_rate: f32) -> Self {
        let nyquist = sample_rate * 0.5;
        let frequency = frequency.clamp(10.0, nyquist * 0.98);
        let q = q.max(1.0e-4);

        let w0 = 2.0 * std::f32::consts::PI * frequency / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        let a0 = 1.0 + alpha;

        let (b0, b1, b2) = match kind {
            FilterType::Lowpass => {
                let b1 = 1.0 - cos_w0;
                (b1 / 2.0, b1, b1 / 2.0)
            }
            FilterType::Highpass => {
                let b1 = -(1.0 + cos_w0);
                (-b1 / 2.0, b1, -b1 / 2.0)
            }
            // constant 0 dB peak gain
            FilterType::Bandpass => (alpha, 0.0, -alpha),
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct State {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl State {
    #[inline]
    fn process(&mut self, x: f32, c: &Coeffs) -> f32 {
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

pub struct Biquad {
    kind: FilterType,
    frequency: AudioParam,
    q: AudioParam,
    states: [State; CHANNELS],
}

impl Biquad {
    pub fn new(kind: FilterType, frequency: f32, q: f32, sample_rate: f32) -> Self {
        Self {
            kind,
            frequency: AudioParam::new(frequency, 10.0, sample_rate * 0.5, sample_rate),
            q: AudioParam::new(q, 1.0e-4, 1000.0, sample_rate),
            states: [State::default(); CHANNELS],
        }
    }
}

impl Processor for Biquad {
    fn process(&mut self, input: &Block, output: &mut Block, info: &RenderInfo) {
        // coefficients are recomputed per block from the smoothed params
        let frequency = self.frequency.block_value(info.frame, RENDER_QUANTUM);
        let q = self.q.block_value(info.frame, RENDER_QUANTUM);
        let coeffs = Coeffs::design(self.kind, frequency, q, info.sample_rate);

        for ch in 0..CHANNELS {
            let state = &mut self.states[ch];
            for i in 0..RENDER_QUANTUM {
                output[ch][i] = state.process(input[ch][i], &coeffs);
            }
        }
    }

    fn param_mut(&mut self, param: ParamKind) -> Option<&mut AudioParam> {
        match param {
            ParamKind::Frequency => Some(&mut self.frequency),
            ParamKind::Q => Some(&mut self.q),
            _ => None,
        }
    }
}
