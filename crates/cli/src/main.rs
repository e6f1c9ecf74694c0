use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use beatlayer_core::{AudioClip, EngineConfig, LayerKey, Session, SongPart};

const USAGE: &str = "\
usage:
  beatlayer layers <key>=<file> ... [--crossfade <0-1>] [--master <0-1>]
      keys: beats, bass, melody, vocals
  beatlayer sequence <part>=<file> ...
      parts: intro, hook, verse, build, drop, bridge, last-verse, outro";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((mode, rest)) = args.split_first() else {
        bail!("{USAGE}");
    };

    let config = EngineConfig::load();
    match mode.as_str() {
        "layers" => play_layers(config, rest),
        "sequence" => play_sequence(config, rest),
        other => bail!("unknown mode '{other}'\n{USAGE}"),
    }
}

fn split_assignment(arg: &str) -> anyhow::Result<(&str, &str)> {
    arg.split_once('=')
        .filter(|(name, path)| !name.is_empty() && !path.is_empty())
        .with_context(|| format!("expected <name>=<file>, got '{arg}'"))
}

fn parse_level(value: Option<&String>, flag: &str) -> anyhow::Result<f32> {
    let value = value.with_context(|| format!("{flag} needs a value"))?;
    value
        .parse()
        .with_context(|| format!("invalid value '{value}' for {flag}"))
}

fn play_layers(config: EngineConfig, args: &[String]) -> anyhow::Result<()> {
    let mut session = Session::new(config);
    let mut crossfade = None;
    let mut master = None;
    let mut assigned = 0;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--crossfade" => crossfade = Some(parse_level(iter.next(), "--crossfade")?),
            "--master" => master = Some(parse_level(iter.next(), "--master")?),
            _ => {
                let (name, path) = split_assignment(arg)?;
                let key = LayerKey::from_name(name)
                    .with_context(|| format!("unknown layer '{name}'"))?;
                session.load_layer(key, path);
                assigned += 1;
            }
        }
    }
    if assigned == 0 {
        bail!("no layers given\n{USAGE}");
    }

    let timeout = session.config().fetch_timeout();
    if !session.wait_for_layers(timeout) {
        bail!("layers did not finish loading within {timeout:?}");
    }
    if let Some(t) = crossfade {
        session.set_crossfade(t);
    }
    if let Some(volume) = master {
        session.set_master_volume(volume);
    }

    let started = session.play_layers();
    if started == 0 {
        bail!("none of the layers could be loaded");
    }
    log::info!("playing {started} layers");

    let mut clips: Vec<AudioClip> = Vec::new();
    // let the scheduled start pass before watching for the end
    thread::sleep(Duration::from_secs_f64(session.config().lookahead_secs));
    while session.mixer().is_playing() {
        session.poll(&mut clips);
        thread::sleep(POLL_INTERVAL);
    }
    session.dispose();
    Ok(())
}

fn play_sequence(config: EngineConfig, args: &[String]) -> anyhow::Result<()> {
    let mut session = Session::new(config);
    let mut clips = Vec::new();

    for (index, arg) in args.iter().enumerate() {
        let (name, path) = split_assignment(arg)?;
        let part =
            SongPart::from_name(name).with_context(|| format!("unknown song part '{name}'"))?;
        let duration = session
            .probe_duration(path)
            .with_context(|| format!("failed to load {path}"))?;
        clips.push(AudioClip::new(
            format!("clip-{index}"),
            part,
            LayerKey::Melody,
            path,
            duration,
        ));
    }
    if clips.is_empty() {
        bail!("no clips given\n{USAGE}");
    }

    if !session.start_sequence(&mut clips) {
        bail!("nothing to play");
    }
    while session.sequencer().is_playing() {
        for id in session.poll(&mut clips) {
            log::debug!("clip {id} ended");
        }
        thread::sleep(POLL_INTERVAL);
    }
    session.dispose();
    Ok(())
}
