use crate::node::{Block, ParamKind, Processor, RENDER_QUANTUM, RenderInfo};
use crate::param::AudioParam;

/// Gains are not capped at unity; makeup and wet stages may boost.
const MAX_GAIN: f32 = 16.0;

pub struct Gain {
    gain: AudioParam,
    values: [f32; RENDER_QUANTUM],
}

impl Gain {
    pub fn new(gain: f32, sample_rate: f32) -> Self {
        Self {
            gain: AudioParam::new(gain, 0.0, MAX_GAIN, sample_rate),
            values: [0.0; RENDER_QUANTUM],
        }
    }
}

impl Processor for Gain {
    fn process(&mut self, input: &Block, output: &mut Block, info: &RenderInfo) {
        self.gain.fill(info.frame, &mut self.values);
        for (inp, out) in input.iter().zip(output.iter_mut()) {
            for i in 0..RENDER_QUANTUM {
                out[i] = inp[i] * self.values[i];
            }
        }
    }

    fn param_mut(&mut self, param: ParamKind) -> Option<&mut AudioParam> {
        match param {
            ParamKind::Gain => Some(&mut self.gain),
            _ => None,
        }
    }
}

/// The context's output: passes the summed input through untouched.
pub struct Destination;

impl Processor for Destination {
    fn process(&mut self, input: &Block, output: &mut Block, _info: &RenderInfo) {
        *output = *input;
    }
}
