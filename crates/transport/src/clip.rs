use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BPM, EffectsConfig, LayerKey, SongPart};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClipId(pub String);

impl ClipId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClipId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A sub-segment of a clip, in seconds from the clip start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChop {
    pub id: String,
    pub start_time: f64,
    pub end_time: f64,
    #[serde(default)]
    pub name: String,
}

impl AudioChop {
    pub fn duration(&self) -> f64 {
        (self.end_time - self.start_time).max(0.0)
    }
}

/// Clip metadata as the hosting page stores it.
///
/// The audio engine only reads this for initialisation and writes back the
/// fields its mutators touch (`volume`, `bpm`, `transpose`, `is_looping`,
/// `is_playing`);
/// it never keeps a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioClip {
    pub id: ClipId,
    pub song_part: SongPart,
    pub element: LayerKey,
    #[serde(default)]
    pub genre: String,
    pub audio_url: String,
    /// Display amplitudes, precomputed by whoever produced the clip.
    #[serde(default)]
    pub waveform: Vec<f32>,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub is_looping: bool,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "default_bpm")]
    pub bpm: f64,
    /// Pitch shift in semitones, within an octave either way.
    #[serde(default, skip_serializing_if = "is_untransposed")]
    pub transpose: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chops: Option<Vec<AudioChop>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effects: Option<EffectsConfig>,
}

fn default_volume() -> f32 {
    1.0
}

fn default_bpm() -> f64 {
    DEFAULT_BPM
}

fn is_untransposed(semitones: &i32) -> bool {
    *semitones == 0
}

impl AudioClip {
    pub fn new(
        id: impl Into<ClipId>,
        song_part: SongPart,
        element: LayerKey,
        audio_url: impl Into<String>,
        duration: f64,
    ) -> Self {
        Self {
            id: id.into(),
            song_part,
            element,
            genre: String::new(),
            audio_url: audio_url.into(),
            waveform: Vec::new(),
            duration,
            is_playing: false,
            is_looping: false,
            volume: default_volume(),
            bpm: DEFAULT_BPM,
            transpose: 0,
            key: None,
            chops: None,
            effects: None,
        }
    }
}

impl From<String> for ClipId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
