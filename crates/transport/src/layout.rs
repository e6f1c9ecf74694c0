use serde::{Deserialize, Serialize};

/// A structural section of a song.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SongPart {
    Intro,
    Hook,
    Verse,
    Build,
    Drop,
    Bridge,
    LastVerse,
    Outro,
}

impl SongPart {
    /// Canonical playback order.
    pub const ORDER: [SongPart; 8] = [
        SongPart::Intro,
        SongPart::Hook,
        SongPart::Verse,
        SongPart::Build,
        SongPart::Drop,
        SongPart::Bridge,
        SongPart::LastVerse,
        SongPart::Outro,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SongPart::Intro => "intro",
            SongPart::Hook => "hook",
            SongPart::Verse => "verse",
            SongPart::Build => "build",
            SongPart::Drop => "drop",
            SongPart::Bridge => "bridge",
            SongPart::LastVerse => "last-verse",
            SongPart::Outro => "outro",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SongPart::LastVerse => "last verse",
            other => other.name(),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|part| part.name() == name)
    }

    /// The part after this one; the outro is its own successor.
    pub fn next(&self) -> SongPart {
        let idx = Self::ORDER.iter().position(|p| p == self).unwrap_or(0);
        Self::ORDER[(idx + 1).min(Self::ORDER.len() - 1)]
    }
}

impl std::fmt::Display for SongPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Crossfader side a layer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerGroup {
    /// Heard at crossfade position 0.
    A,
    /// Heard at crossfade position 1.
    B,
}

/// One of the four fixed instrument roles of the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKey {
    Beats,
    Bass,
    Melody,
    Vocals,
}

impl LayerKey {
    pub const ALL: [LayerKey; 4] = [
        LayerKey::Beats,
        LayerKey::Bass,
        LayerKey::Melody,
        LayerKey::Vocals,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LayerKey::Beats => "beats",
            LayerKey::Bass => "bass",
            LayerKey::Melody => "melody",
            LayerKey::Vocals => "vocals",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.name() == name)
    }

    pub fn group(&self) -> LayerGroup {
        match self {
            LayerKey::Beats | LayerKey::Bass => LayerGroup::A,
            LayerKey::Melody | LayerKey::Vocals => LayerGroup::B,
        }
    }

    /// Position of this key in [`LayerKey::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for LayerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_song_part_names_round_trip() {
        for part in SongPart::ORDER {
            assert_eq!(SongPart::from_name(part.name()), Some(part));
        }
        assert_eq!(SongPart::from_name("chorus"), None);
    }

    #[test]
    fn test_song_part_next_saturates_at_outro() {
        assert_eq!(SongPart::Intro.next(), SongPart::Hook);
        assert_eq!(SongPart::LastVerse.next(), SongPart::Outro);
        assert_eq!(SongPart::Outro.next(), SongPart::Outro);
    }

    #[test]
    fn test_layer_groups() {
        assert_eq!(LayerKey::Beats.group(), LayerGroup::A);
        assert_eq!(LayerKey::Bass.group(), LayerGroup::A);
        assert_eq!(LayerKey::Melody.group(), LayerGroup::B);
        assert_eq!(LayerKey::Vocals.group(), LayerGroup::B);
    }

    #[test]
    fn test_layer_index_matches_all() {
        for (idx, key) in LayerKey::ALL.iter().enumerate() {
            assert_eq!(key.index(), idx);
        }
    }
}
