use beatlayer_transport::AudioArc;

use crate::node::{Block, Processor, RENDER_QUANTUM, RenderInfo, SourceCommand};

const MIN_RATE: f32 = 0.0625;
const MAX_RATE: f32 = 16.0;

/// Linearly interpolated read at a fractional frame.
#[inline]
fn read(buffer: &AudioArc, position: f64, channel: usize) -> f32 {
    let idx = position.floor() as usize;
    let frac = (position - idx as f64) as f32;
    let a = buffer.sample(idx, channel);
    if frac == 0.0 {
        return a;
    }
    let b = buffer.sample(idx + 1, channel);
    a + (b - a) * frac
}

/// One-shot player scheduled against the render clock.
pub struct BufferSource {
    buffer: AudioArc,
    start_frame: Option<u64>,
    position: f64,
    ended: bool,
}

impl BufferSource {
    pub fn new(buffer: AudioArc) -> Self {
        Self {
            buffer,
            start_frame: None,
            position: 0.0,
            ended: false,
        }
    }
}

impl Processor for BufferSource {
    fn process(&mut self, _input: &Block, output: &mut Block, info: &RenderInfo) {
        let Some(start) = self.start_frame else {
            return;
        };
        if self.ended {
            return;
        }
        let frames = self.buffer.frames() as f64;
        for i in 0..RENDER_QUANTUM {
            if info.frame + (i as u64) < start {
                continue;
            }
            if self.position >= frames {
                self.ended = true;
                break;
            }
            for (ch, out) in output.iter_mut().enumerate() {
                out[i] = read(&self.buffer, self.position, ch);
            }
            self.position += 1.0;
        }
        if self.position >= frames {
            self.ended = true;
        }
    }

    fn command(&mut self, command: SourceCommand) {
        match command {
            // a buffer source can only be started once
            SourceCommand::StartAt(frame) if self.start_frame.is_none() => {
                self.start_frame = Some(frame);
            }
            SourceCommand::Stop => self.ended = true,
            _ => {}
        }
    }

    fn position(&self) -> Option<f64> {
        Some(self.position)
    }

    fn finished(&self) -> bool {
        self.ended
    }

    fn is_active(&self) -> bool {
        self.start_frame.is_some() && !self.ended
    }
}

/// Pausable clip player with element-level volume and varispeed.
pub struct MediaElement {
    buffer: AudioArc,
    playing: bool,
    looping: bool,
    position: f64,
    rate: f32,
    volume: f32,
    ended: bool,
}

impl MediaElement {
    pub fn new(buffer: AudioArc, volume: f32) -> Self {
        Self {
            buffer,
            playing: false,
            looping: false,
            position: 0.0,
            rate: 1.0,
            volume: volume.clamp(0.0, 1.0),
            ended: false,
        }
    }
}

impl Processor for MediaElement {
    fn process(&mut self, _input: &Block, output: &mut Block, _info: &RenderInfo) {
        if !self.playing {
            return;
        }
        let frames = self.buffer.frames() as f64;
        if frames == 0.0 {
            self.playing = false;
            self.ended = true;
            return;
        }
        for i in 0..RENDER_QUANTUM {
            for (ch, out) in output.iter_mut().enumerate() {
                out[i] = read(&self.buffer, self.position, ch) * self.volume;
            }
            self.position += self.rate as f64;
            if self.position >= frames {
                if self.looping {
                    self.position %= frames;
                } else {
                    self.position = frames;
                    self.playing = false;
                    self.ended = true;
                    break;
                }
            }
        }
    }

    fn command(&mut self, command: SourceCommand) {
        let frames = self.buffer.frames() as f64;
        match command {
            SourceCommand::Play => {
                if self.position >= frames {
                    self.position = 0.0;
                }
                self.playing = true;
                self.ended = false;
            }
            SourceCommand::Pause | SourceCommand::Stop => self.playing = false,
            SourceCommand::Seek(frame) => {
                self.position = frame.clamp(0.0, frames);
                self.ended = false;
            }
            SourceCommand::SetLoop(looping) => self.looping = looping,
            SourceCommand::SetRate(rate) => {
                if rate.is_finite() {
                    self.rate = rate.clamp(MIN_RATE, MAX_RATE);
                }
            }
            SourceCommand::SetElementVolume(volume) => self.volume = volume.clamp(0.0, 1.0),
            SourceCommand::StartAt(_) => {}
        }
    }

    fn position(&self) -> Option<f64> {
        Some(self.position)
    }

    fn finished(&self) -> bool {
        self.ended
    }

    fn is_active(&self) -> bool {
        self.playing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::SILENT_BLOCK;

    fn info(frame: u64) -> RenderInfo {
        RenderInfo {
            frame,
            sample_rate: 1000.0,
        }
    }

    fn ramp(frames: usize) -> AudioArc {
        AudioArc::new((0..frames).map(|i| i as f32).collect(), 1000, 1)
    }

    #[test]
    fn test_buffer_source_waits_for_start_frame() {
        let mut source = BufferSource::new(ramp(400));
        source.command(SourceCommand::StartAt(10));

        let mut out = SILENT_BLOCK;
        source.process(&SILENT_BLOCK, &mut out, &info(0));
        assert_eq!(out[0][9], 0.0);
        assert_eq!(out[0][10], 0.0);
        assert_eq!(out[0][11], 1.0);
        assert_eq!(out[1][11], 1.0);
    }

    #[test]
    fn test_buffer_source_ends_and_ignores_restart() {
        let mut source = BufferSource::new(ramp(50));
        source.command(SourceCommand::StartAt(0));
        let mut out = SILENT_BLOCK;
        source.process(&SILENT_BLOCK, &mut out, &info(0));
        assert!(source.finished());
        assert_eq!(out[0][60], 0.0);

        source.command(SourceCommand::StartAt(500));
        assert!(source.finished());
    }

    #[test]
    fn test_media_element_pause_keeps_position() {
        let mut element = MediaElement::new(ramp(1000), 1.0);
        element.command(SourceCommand::Play);
        let mut out = SILENT_BLOCK;
        element.process(&SILENT_BLOCK, &mut out, &info(0));
        element.command(SourceCommand::Pause);

        let mut silent = SILENT_BLOCK;
        element.process(&SILENT_BLOCK, &mut silent, &info(128));
        assert_eq!(silent, SILENT_BLOCK);
        assert_eq!(element.position(), Some(128.0));

        element.command(SourceCommand::Play);
        let mut resumed = SILENT_BLOCK;
        element.process(&SILENT_BLOCK, &mut resumed, &info(256));
        assert_eq!(resumed[0][0], 128.0);
    }

    #[test]
    fn test_media_element_loops_and_scales() {
        let mut element = MediaElement::new(ramp(100), 0.5);
        element.command(SourceCommand::SetLoop(true));
        element.command(SourceCommand::Play);
        let mut out = SILENT_BLOCK;
        element.process(&SILENT_BLOCK, &mut out, &info(0));
        assert_eq!(out[0][99], 49.5);
        assert_eq!(out[0][100], 0.0);
        assert_eq!(out[0][101], 0.5);
        assert!(!element.finished());
    }

    #[test]
    fn test_media_element_rate_interpolates() {
        let mut element = MediaElement::new(ramp(1000), 1.0);
        element.command(SourceCommand::SetRate(0.5));
        element.command(SourceCommand::Play);
        let mut out = SILENT_BLOCK;
        element.process(&SILENT_BLOCK, &mut out, &info(0));
        assert_eq!(out[0][1], 0.5);
        assert_eq!(out[0][4], 2.0);
        assert_eq!(element.position(), Some(64.0));
    }

    #[test]
    fn test_media_element_keeps_rate_on_nan() {
        let mut element = MediaElement::new(ramp(1000), 1.0);
        element.command(SourceCommand::SetRate(2.0));
        element.command(SourceCommand::SetRate(f32::NAN));
        element.command(SourceCommand::Play);
        let mut out = SILENT_BLOCK;
        element.process(&SILENT_BLOCK, &mut out, &info(0));
        assert_eq!(element.position(), Some(256.0));
    }

    #[test]
    fn test_media_element_replay_after_end_rewinds() {
        let mut element = MediaElement::new(ramp(10), 1.0);
        element.command(SourceCommand::Play);
        let mut out = SILENT_BLOCK;
        element.process(&SILENT_BLOCK, &mut out, &info(0));
        assert!(element.finished());
        assert!(!element.is_active());

        element.command(SourceCommand::Play);
        assert!(!element.finished());
        assert_eq!(element.position(), Some(0.0));
    }
}
