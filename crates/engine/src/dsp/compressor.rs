//! Feed-forward peak compressor with a soft knee and automatic makeup gain.

use crate::node::{Block, CHANNELS, ParamKind, Processor, RENDER_QUANTUM, RenderInfo};
use crate::param::AudioParam;

const MAKEUP_EXPONENT: f32 = 0.6;

pub struct Compressor {
    threshold: AudioParam,
    knee: AudioParam,
    ratio: AudioParam,
    attack: AudioParam,
    release: AudioParam,
    /// Current gain reduction in dB (<= 0).
    envelope: f32,
}

impl Compressor {
    pub fn new(
        threshold: f32,
        knee: f32,
        ratio: f32,
        attack: f32,
        release: f32,
        sample_rate: f32,
    ) -> Self {
        Self {
            threshold: AudioParam::new(threshold, -100.0, 0.0, sample_rate),
            knee: AudioParam::new(knee, 0.0, 40.0, sample_rate),
            ratio: AudioParam::new(ratio, 1.0, 20.0, sample_rate),
            attack: AudioParam::new(attack, 0.0, 1.0, sample_rate),
            release: AudioParam::new(release, 0.0, 1.0, sample_rate),
            envelope: 0.0,
        }
    }
}

/// Static gain curve: output level in dB for an input level in dB.
pub(crate) fn gain_computer(input_db: f32, threshold: f32, knee: f32, ratio: f32) -> f32 {
    let over = input_db - threshold;
    if 2.0 * over < -knee {
        input_db
    } else if knee > 0.0 && 2.0 * over.abs() <= knee {
        let x = over + knee / 2.0;
        input_db + (1.0 / ratio - 1.0) * x * x / (2.0 * knee)
    } else {
        threshold + over / ratio
    }
}

fn coefficient(time: f32, sample_rate: f32) -> f32 {
    if time <= 0.0 {
        0.0
    } else {
        (-1.0 / (time * sample_rate)).exp()
    }
}

impl Processor for Compressor {
    fn process(&mut self, input: &Block, output: &mut Block, info: &RenderInfo) {
        let threshold = self.threshold.block_value(info.frame, RENDER_QUANTUM);
        let knee = self.knee.block_value(info.frame, RENDER_QUANTUM);
        let ratio = self.ratio.block_value(info.frame, RENDER_QUANTUM);
        let attack = coefficient(
            self.attack.block_value(info.frame, RENDER_QUANTUM),
            info.sample_rate,
        );
        let release = coefficient(
            self.release.block_value(info.frame, RENDER_QUANTUM),
            info.sample_rate,
        );
        let makeup_db = -MAKEUP_EXPONENT * (gain_computer(0.0, threshold, knee, ratio) - 0.0);

        for i in 0..RENDER_QUANTUM {
            let peak = (0..CHANNELS).fold(0.0f32, |m, ch| m.max(input[ch][i].abs()));
            let level_db = if peak > 1.0e-6 {
                20.0 * peak.log10()
            } else {
                -120.0
            };
            let reduction = gain_computer(level_db, threshold, knee, ratio) - level_db;

            let coeff = if reduction < self.envelope {
                attack
            } else {
                release
            };
            self.envelope = reduction + (self.envelope - reduction) * coeff;

            let gain = 10.0f32.powf((self.envelope + makeup_db) / 20.0);
            for ch in 0..CHANNELS {
                output[ch][i] = input[ch][i] * gain;
            }
        }
    }

    fn param_mut(&mut self, param: ParamKind) -> Option<&mut AudioParam> {
        match param {
            ParamKind::Threshold => Some(&mut self.threshold),
            ParamKind::Knee => Some(&mut self.knee),
            ParamKind::Ratio => Some(&mut self.ratio),
            ParamKind::Attack => Some(&mut self.attack),
            ParamKind::Release => Some(&mut self.release),
            _ => None,
        }
    }
}
