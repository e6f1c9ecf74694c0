pub mod biquad;
pub mod compressor;
pub mod convolver;
pub mod delay;
pub mod gain;
pub mod shaper;
pub mod source;

use crate::node::{NodeSpec, Processor};

/// Turn a node description into its render-side processor. Runs on the
/// control thread, so FFT planning and table setup never hit the callback.
pub fn build_processor(spec: &NodeSpec, sample_rate: f32) -> Box<dyn Processor> {
    match spec {
        NodeSpec::Gain { gain } => Box::new(gain::Gain::new(*gain, sample_rate)),
        NodeSpec::BufferSource { buffer } => Box::new(source::BufferSource::new(buffer.clone())),
        NodeSpec::MediaElement { buffer, volume, .. } => {
            Box::new(source::MediaElement::new(buffer.clone(), *volume))
        }
        NodeSpec::Convolver { impulse } => Box::new(convolver::Convolver::new(impulse)),
        NodeSpec::Biquad { kind, frequency, q } => {
            Box::new(biquad::Biquad::new(*kind, *frequency, *q, sample_rate))
        }
        NodeSpec::WaveShaper { curve, oversample } => {
            Box::new(shaper::WaveShaper::new(curve.clone(), *oversample))
        }
        NodeSpec::Delay {
            max_delay_secs,
            delay_time,
            feedback,
        } => Box::new(delay::FeedbackDelay::new(
            *max_delay_secs,
            *delay_time,
            *feedback,
            sample_rate,
        )),
        NodeSpec::Compressor {
            threshold,
            knee,
            ratio,
            attack,
            release,
        } => Box::new(compressor::Compressor::new(
            *threshold,
            *knee,
            *ratio,
            *attack,
            *release,
            sample_rate,
        )),
    }
}
