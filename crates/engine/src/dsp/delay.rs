use crate::node::{Block, CHANNELS, ParamKind, Processor, RENDER_QUANTUM, RenderInfo};
use crate::param::AudioParam;

/// Delay line with an internal feedback path. Outputs only the delayed
/// (wet) signal; the caller mixes it with the dry path.
pub struct FeedbackDelay {
    lines: [Vec<f32>; CHANNELS],
    write: usize,
    delay_time: AudioParam,
    feedback: AudioParam,
    times: [f32; RENDER_QUANTUM],
    feedbacks: [f32; RENDER_QUANTUM],
}

impl FeedbackDelay {
    pub fn new(max_delay_secs: f32, delay_time: f32, feedback: f32, sample_rate: f32) -> Self {
        let max_delay_secs = max_delay_secs.max(1.0 / sample_rate);
        let len = (max_delay_secs * sample_rate).ceil() as usize + 2;
        Self {
            lines: [vec![0.0; len], vec![0.0; len]],
            write: 0,
            delay_time: AudioParam::new(delay_time, 0.0, max_delay_secs, sample_rate),
            feedback: AudioParam::new(feedback, 0.0, 1.0, sample_rate),
            times: [0.0; RENDER_QUANTUM],
            feedbacks: [0.0; RENDER_QUANTUM],
        }
    }
}

impl Processor for FeedbackDelay {
    fn process(&mut self, input: &Block, output: &mut Block, info: &RenderInfo) {
        self.delay_time.fill(info.frame, &mut self.times);
        self.feedback.fill(info.frame, &mut self.feedbacks);
        let len = self.lines[0].len();

        for i in 0..RENDER_QUANTUM {
            let delay_frames = (self.times[i] * info.sample_rate).clamp(1.0, (len - 2) as f32);
            let read_pos = self.write as f32 + len as f32 - delay_frames;
            let idx = read_pos.floor() as usize;
            let frac = read_pos - read_pos.floor();

            for ch in 0..CHANNELS {
                let line = &mut self.lines[ch];
                let a = line[idx % len];
                let b = line[(idx + 1) % len];
                let delayed = a + (b - a) * frac;
                line[self.write] = input[ch][i] + delayed * self.feedbacks[i];
                output[ch][i] = delayed;
            }
            self.write = (self.write + 1) % len;
        }
    }

    fn param_mut(&mut self, param: ParamKind) -> Option<&mut AudioParam> {
        match param {
            ParamKind::DelayTime => Some(&mut self.delay_time),
            ParamKind::Feedback => Some(&mut self.feedback),
            _ => None,
        }
    }
}
