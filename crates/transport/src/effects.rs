//! Per-clip effects configuration.
//!
//! Five fixed slots, each independently toggleable. Toggling a slot off never
//! touches its parameters, so re-enabling it restores the previous settings.
//! Every setter clamps to the slot's declared range.

use serde::{Deserialize, Serialize};

use crate::clamp_unit;

pub const DELAY_TIME_MS_RANGE: (f32, f32) = (1.0, 1000.0);
pub const FILTER_FREQUENCY_RANGE: (f32, f32) = (20.0, 20_000.0);
pub const COMPRESSION_THRESHOLD_RANGE: (f32, f32) = (-100.0, 0.0);
pub const COMPRESSION_RATIO_RANGE: (f32, f32) = (1.0, 20.0);

fn clamp_range(value: f32, (lo, hi): (f32, f32)) -> f32 {
    if value.is_nan() {
        return lo;
    }
    value.clamp(lo, hi)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReverbSettings {
    pub enabled: bool,
    /// Wet level, 0-1.
    pub amount: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelaySettings {
    pub enabled: bool,
    /// Milliseconds.
    pub time: f32,
    /// 0-1.
    pub feedback: f32,
}

impl DelaySettings {
    pub fn time_secs(&self) -> f64 {
        self.time as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    Lowpass,
    Highpass,
    Bandpass,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    pub enabled: bool,
    /// Hz.
    pub frequency: f32,
    #[serde(rename = "type")]
    pub kind: FilterType,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistortionSettings {
    pub enabled: bool,
    /// 0-1.
    pub amount: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub enabled: bool,
    /// dB.
    pub threshold: f32,
    pub ratio: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectsConfig {
    pub reverb: ReverbSettings,
    pub delay: DelaySettings,
    pub filter: FilterSettings,
    pub distortion: DistortionSettings,
    pub compression: CompressionSettings,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            reverb: ReverbSettings {
                enabled: false,
                amount: 0.5,
            },
            delay: DelaySettings {
                enabled: false,
                time: 250.0,
                feedback: 0.3,
            },
            filter: FilterSettings {
                enabled: false,
                frequency: 1000.0,
                kind: FilterType::Lowpass,
            },
            distortion: DistortionSettings {
                enabled: false,
                amount: 0.5,
            },
            compression: CompressionSettings {
                enabled: false,
                threshold: -24.0,
                ratio: 4.0,
            },
        }
    }
}

impl EffectsConfig {
    /// Copy with every parameter pulled into its declared range.
    ///
    /// Configurations arriving from storage may predate the clamping setters.
    pub fn clamped(&self) -> Self {
        let mut out = *self;
        out.reverb.amount = clamp_unit(out.reverb.amount);
        out.delay.time = clamp_range(out.delay.time, DELAY_TIME_MS_RANGE);
        out.delay.feedback = clamp_unit(out.delay.feedback);
        out.filter.frequency = clamp_range(out.filter.frequency, FILTER_FREQUENCY_RANGE);
        out.distortion.amount = clamp_unit(out.distortion.amount);
        out.compression.threshold =
            clamp_range(out.compression.threshold, COMPRESSION_THRESHOLD_RANGE);
        out.compression.ratio = clamp_range(out.compression.ratio, COMPRESSION_RATIO_RANGE);
        out
    }

    pub fn any_enabled(&self) -> bool {
        self.reverb.enabled
            || self.delay.enabled
            || self.filter.enabled
            || self.distortion.enabled
            || self.compression.enabled
    }

    pub fn set_reverb_amount(&mut self, amount: f32) {
        self.reverb.amount = clamp_unit(amount);
    }

    pub fn set_delay(&mut self, time_ms: f32, feedback: f32) {
        self.delay.time = clamp_range(time_ms, DELAY_TIME_MS_RANGE);
        self.delay.feedback = clamp_unit(feedback);
    }

    pub fn set_filter(&mut self, frequency: f32, kind: FilterType) {
        self.filter.frequency = clamp_range(frequency, FILTER_FREQUENCY_RANGE);
        self.filter.kind = kind;
    }

    pub fn set_distortion_amount(&mut self, amount: f32) {
        self.distortion.amount = clamp_unit(amount);
    }

    pub fn set_compression(&mut self, threshold_db: f32, ratio: f32) {
        self.compression.threshold = clamp_range(threshold_db, COMPRESSION_THRESHOLD_RANGE);
        self.compression.ratio = clamp_range(ratio, COMPRESSION_RATIO_RANGE);
    }
}
