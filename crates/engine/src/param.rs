//! Automatable node parameters.
//!
//! A parameter either holds a fixed value or approaches a target
//! exponentially once the render clock passes the ramp's start frame. The
//! approach runs per sample, so two writers retargeting the same parameter in
//! quick succession never produce a step.

/// Pending change to a parameter, as sent from the control side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamChange {
    /// Jump immediately.
    Set(f32),
    /// Approach `target` from `start_frame` on with the given time constant.
    Target {
        target: f32,
        start_frame: u64,
        time_constant: f32,
    },
}

#[derive(Debug, Clone)]
pub struct AudioParam {
    value: f32,
    target: f32,
    start_frame: u64,
    /// Per-sample decay factor; 0 means the target is reached in one sample.
    coeff: f32,
    min: f32,
    max: f32,
    sample_rate: f32,
}

/// Below this distance a ramp snaps onto its target.
const SNAP_EPSILON: f32 = 1.0e-6;

impl AudioParam {
    pub fn new(value: f32, min: f32, max: f32, sample_rate: f32) -> Self {
        let value = value.clamp(min, max);
        Self {
            value,
            target: value,
            start_frame: 0,
            coeff: 0.0,
            min,
            max,
            sample_rate,
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn apply(&mut self, change: ParamChange) {
        match change {
            ParamChange::Set(value) => self.set_value(value),
            ParamChange::Target {
                target,
                start_frame,
                time_constant,
            } => self.set_target_at(target, start_frame, time_constant),
        }
    }

    pub fn set_value(&mut self, value: f32) {
        let value = value.clamp(self.min, self.max);
        self.value = value;
        self.target = value;
        self.coeff = 0.0;
    }

    pub fn set_target_at(&mut self, target: f32, start_frame: u64, time_constant: f32) {
        self.target = target.clamp(self.min, self.max);
        self.start_frame = start_frame;
        self.coeff = if time_constant > 0.0 && self.sample_rate > 0.0 {
            (-1.0 / (time_constant * self.sample_rate)).exp()
        } else {
            0.0
        };
    }

    /// Value for the sample at absolute frame `frame`, advancing any ramp.
    #[inline]
    pub fn tick(&mut self, frame: u64) -> f32 {
        if self.value != self.target && frame >= self.start_frame {
            self.value = self.target + (self.value - self.target) * self.coeff;
            if (self.value - self.target).abs() < SNAP_EPSILON {
                self.value = self.target;
            }
        }
        self.value
    }

    /// Advance a whole block, writing per-sample values into `out`.
    pub fn fill(&mut self, start_frame: u64, out: &mut [f32]) {
        if self.value == self.target {
            out.fill(self.value);
            return;
        }
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.tick(start_frame + i as u64);
        }
    }

    /// Block-rate read: advance the ramp by `frames` and return the value at
    /// the block start.
    pub fn block_value(&mut self, start_frame: u64, frames: usize) -> f32 {
        let first = self.value;
        if self.value != self.target {
            for i in 0..frames {
                self.tick(start_frame + i as u64);
            }
        }
        first
    }
}
