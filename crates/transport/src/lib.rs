mod clip;
mod effects;
mod layout;

use std::sync::Arc;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

pub use clip::{AudioChop, AudioClip, ClipId};
pub use effects::{
    CompressionSettings, DelaySettings, DistortionSettings, EffectsConfig, FilterSettings,
    FilterType, ReverbSettings,
};
pub use layout::{LayerGroup, LayerKey, SongPart};

/// Lowest tempo a clip can be pushed to.
pub const MIN_BPM: f64 = 60.0;
/// Highest tempo a clip can be pushed to.
pub const MAX_BPM: f64 = 200.0;
/// Tempo assumed when a clip does not declare one.
pub const DEFAULT_BPM: f64 = 120.0;
/// Bounds of the playback-rate multiplier derived from a tempo change.
pub const MIN_PLAYBACK_RATE: f64 = 0.5;
pub const MAX_PLAYBACK_RATE: f64 = 1.5;
/// Transpose range, in semitones either way.
pub const MAX_TRANSPOSE: i32 = 12;

/// Clamp a volume fraction into `[0, 1]`. NaN maps to silence.
pub fn clamp_volume(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Clamp a fraction (crossfade position, effect amount) into `[0, 1]`.
pub fn clamp_unit(value: f32) -> f32 {
    clamp_volume(value)
}

/// Playback rate needed to move a clip from `base_bpm` to `target_bpm`.
pub fn tempo_ratio(target_bpm: f64, base_bpm: f64) -> f64 {
    if base_bpm <= 0.0 || !base_bpm.is_finite() || !target_bpm.is_finite() {
        return 1.0;
    }
    (target_bpm / base_bpm).clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE)
}

/// Pitch ratio for a shift of `semitones`, limited to an octave each way.
pub fn semitone_ratio(semitones: i32) -> f64 {
    2f64.powf(semitones.clamp(-MAX_TRANSPOSE, MAX_TRANSPOSE) as f64 / 12.0)
}

/// Owned, interleaved decoder output.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn into_arc(self) -> AudioArc {
        AudioArc::new(self.samples, self.sample_rate, self.channels)
    }
}

/// Shared, immutable audio sample data.
///
/// Cloning only bumps a reference count, so the same decoded clip can back
/// any number of playback nodes, chops and cache entries at once.
///
/// # Examples
///
/// ```
/// use beatlayer_transport::AudioArc;
///
/// let audio = AudioArc::new(vec![0.0, 0.5, 1.0, 0.5], 44100, 2);
/// let shared = audio.clone();
/// assert_eq!(shared.frames(), 2);
/// ```
#[derive(Clone)]
pub struct AudioArc {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioArc {
    /// # Panics
    ///
    /// Panics if `channels` is 0 or if `samples.len()` is not divisible by `channels`.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self::from_arc(Arc::from(samples), sample_rate, channels)
    }

    /// # Panics
    ///
    /// Same conditions as [`AudioArc::new`].
    pub fn from_arc(samples: Arc<[f32]>, sample_rate: u32, channels: u16) -> Self {
        assert!(channels > 0, "channels must be greater than 0");
        assert_eq!(
            samples.len() % channels as usize,
            0,
            "samples.len() must be divisible by channels"
        );
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Silent buffer of the given length.
    pub fn silence(frames: usize, sample_rate: u32, channels: u16) -> Self {
        Self::new(vec![0.0; frames * channels as usize], sample_rate, channels)
    }

    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_arc(&self) -> &Arc<[f32]> {
        &self.samples
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Sample at `frame` on output channel `channel`, folding extra output
    /// channels onto the buffer's own (mono plays on both sides).
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        let channels = (self.channels as usize).max(1);
        self.samples
            .get(frame * channels + channel % channels)
            .copied()
            .unwrap_or(0.0)
    }

    /// Copy the frames between two timestamps into a new buffer.
    ///
    /// Bounds are clamped to the buffer; an inverted range yields an empty buffer.
    pub fn slice_secs(&self, start_secs: f64, end_secs: f64) -> Self {
        let rate = self.sample_rate as f64;
        let frames = self.frames();
        let start = ((start_secs.max(0.0) * rate).floor() as usize).min(frames);
        let end = ((end_secs.max(0.0) * rate).floor() as usize).clamp(start, frames);
        let channels = self.channels as usize;
        let samples = self.samples[start * channels..end * channels].to_vec();
        Self::new(samples, self.sample_rate, self.channels)
    }

    /// Render a copy pitched up or down by `semitones`. Length scales by
    /// the inverse ratio; samples are read with linear interpolation.
    pub fn transposed(&self, semitones: i32) -> Self {
        if semitones == 0 {
            return self.clone();
        }
        let ratio = semitone_ratio(semitones);
        let channels = self.channels as usize;
        let frames = self.frames();
        let out_frames = (frames as f64 / ratio).round() as usize;
        let mut samples = vec![0.0f32; out_frames * channels];
        for (i, frame) in samples.chunks_mut(channels).enumerate() {
            let position = i as f64 * ratio;
            let index = position.floor() as usize;
            if index + 1 >= frames {
                break;
            }
            let fraction = (position - index as f64) as f32;
            for (channel, sample) in frame.iter_mut().enumerate() {
                let a = self.samples[index * channels + channel];
                let b = self.samples[(index + 1) * channels + channel];
                *sample = a + (b - a) * fraction;
            }
        }
        Self::new(samples, self.sample_rate, self.channels)
    }

    /// Resample to `target_sample_rate`, returning a cheap clone when the
    /// rate already matches.
    pub fn resample(&self, target_sample_rate: u32) -> anyhow::Result<Self> {
        if self.sample_rate == target_sample_rate {
            return Ok(self.clone());
        }
        resample_audio_arc(self, target_sample_rate)
    }
}

impl std::fmt::Debug for AudioArc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioArc")
            .field("frames", &self.frames())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("duration_secs", &self.duration_secs())
            .finish()
    }
}

/// Sinc-resample an [`AudioArc`] so it plays at the right pitch on a
/// context running at `target_sample_rate`.
pub fn resample_audio_arc(audio: &AudioArc, target_sample_rate: u32) -> anyhow::Result<AudioArc> {
    if audio.sample_rate == target_sample_rate {
        return Ok(audio.clone());
    }
    if audio.sample_rate == 0 || target_sample_rate == 0 {
        anyhow::bail!(
            "cannot resample between {} Hz and {} Hz",
            audio.sample_rate,
            target_sample_rate
        );
    }

    let channels = audio.channels as usize;
    let input_frames = audio.frames();
    if input_frames == 0 {
        return Ok(AudioArc::new(Vec::new(), target_sample_rate, audio.channels));
    }

    let ratio = target_sample_rate as f64 / audio.sample_rate as f64;

    // rubato wants planar input
    let mut planar = vec![Vec::with_capacity(input_frames); channels];
    for frame in audio.samples().chunks_exact(channels) {
        for (ch, &sample) in frame.iter().enumerate() {
            planar[ch].push(sample);
        }
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, input_frames, channels)?;
    let output = resampler.process(&planar, None)?;

    let out_frames = output.first().map_or(0, Vec::len);
    let mut interleaved = Vec::with_capacity(out_frames * channels);
    for frame_idx in 0..out_frames {
        for channel in &output {
            interleaved.push(channel[frame_idx]);
        }
    }

    Ok(AudioArc::new(interleaved, target_sample_rate, audio.channels))
}
