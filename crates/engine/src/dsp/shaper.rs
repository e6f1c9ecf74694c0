use std::sync::Arc;

use crate::node::{Block, CHANNELS, Oversample, Processor, RENDER_QUANTUM, RenderInfo};

/// Curve-lookup waveshaper.
///
/// Input in `[-1, 1]` indexes the curve linearly; anything outside is pinned
/// to the curve ends. With oversampling each input step is split into
/// `factor` interpolated points that are shaped and averaged back down.
pub struct WaveShaper {
    curve: Arc<[f32]>,
    factor: usize,
    last: [f32; CHANNELS],
}

impl WaveShaper {
    pub fn new(curve: Arc<[f32]>, oversample: Oversample) -> Self {
        Self {
            curve,
            factor: oversample.factor(),
            last: [0.0; CHANNELS],
        }
    }

    #[inline]
    fn shape(&self, x: f32) -> f32 {
        let n = self.curve.len();
        match n {
            0 => x,
            1 => self.curve[0],
            _ => {
                let pos = ((x.clamp(-1.0, 1.0) + 1.0) * 0.5) * (n - 1) as f32;
                let idx = (pos.floor() as usize).min(n - 2);
                let frac = pos - idx as f32;
                self.curve[idx] + (self.curve[idx + 1] - self.curve[idx]) * frac
            }
        }
    }
}

impl Processor for WaveShaper {
    fn process(&mut self, input: &Block, output: &mut Block, _info: &RenderInfo) {
        let factor = self.factor;
        for ch in 0..CHANNELS {
            let mut prev = self.last[ch];
            for i in 0..RENDER_QUANTUM {
                let x = input[ch][i];
                output[ch][i] = if factor == 1 {
                    self.shape(x)
                } else {
                    let mut acc = 0.0;
                    for k in 1..=factor {
                        let t = k as f32 / factor as f32;
                        acc += self.shape(prev + (x - prev) * t);
                    }
                    acc / factor as f32
                };
                prev = x;
            }
            self.last[ch] = prev;
        }
    }
}
