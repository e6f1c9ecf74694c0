use beatlayer_transport::{AudioArc, AudioChop};

/// Segments shorter than this are dropped.
pub const MIN_CHOP_SECS: f64 = 0.1;

/// A chop with its own copy of the audio.
#[derive(Debug, Clone)]
pub struct Chop {
    pub info: AudioChop,
    pub audio: AudioArc,
}

/// Cut `audio` at `points` (seconds). The points are sorted and bracketed by
/// the start and end of the audio; points outside it are pinned to the edges.
pub fn create_chops(audio: &AudioArc, points: &[f64]) -> Vec<Chop> {
    let duration = audio.duration_secs();
    let mut cuts: Vec<f64> = points
        .iter()
        .filter(|p| p.is_finite())
        .map(|p| p.clamp(0.0, duration))
        .collect();
    cuts.sort_by(f64::total_cmp);

    let mut bounds = Vec::with_capacity(cuts.len() + 2);
    bounds.push(0.0);
    bounds.extend(cuts);
    bounds.push(duration);

    bounds
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[1] - pair[0] >= MIN_CHOP_SECS)
        .map(|(i, pair)| Chop {
            info: AudioChop {
                id: format!("chop-{i}"),
                start_time: pair[0],
                end_time: pair[1],
                name: format!("Chop {}", i + 1),
            },
            audio: audio.slice_secs(pair[0], pair[1]),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn second_of_audio() -> AudioArc {
        AudioArc::new((0..1000).map(|i| i as f32).collect(), 1000, 1)
    }

    #[test]
    fn test_points_are_sorted_and_bracketed() {
        let chops = create_chops(&second_of_audio(), &[0.6, 0.25]);
        let spans: Vec<_> = chops
            .iter()
            .map(|c| (c.info.start_time, c.info.end_time))
            .collect();
        assert_eq!(spans, vec![(0.0, 0.25), (0.25, 0.6), (0.6, 1.0)]);
        assert_eq!(chops[1].audio.frames(), 350);
        assert_eq!(chops[1].audio.samples()[0], 250.0);
    }

    #[test]
    fn test_short_segments_are_skipped_keeping_numbering() {
        let chops = create_chops(&second_of_audio(), &[0.5, 0.55]);
        let names: Vec<_> = chops.iter().map(|c| c.info.name.as_str()).collect();
        assert_eq!(names, ["Chop 1", "Chop 3"]);
    }

    #[test]
    fn test_no_points_gives_whole_clip() {
        let chops = create_chops(&second_of_audio(), &[]);
        assert_eq!(chops.len(), 1);
        assert_eq!(chops[0].audio.frames(), 1000);
        assert_eq!(chops[0].info.duration(), 1.0);
    }
}
