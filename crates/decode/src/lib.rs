use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use beatlayer_transport::AudioBuffer;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Where an audio URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    File(PathBuf),
    Http(String),
}

/// Classify a clip/layer URL. Accepts `http(s)://`, `file://` and bare paths.
pub fn resolve_source(url: &str) -> anyhow::Result<AudioSource> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        anyhow::bail!("empty audio url");
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(AudioSource::Http(trimmed.to_string()));
    }
    if let Some(path) = trimmed.strip_prefix("file://") {
        return Ok(AudioSource::File(PathBuf::from(path)));
    }
    if let Some((scheme, _)) = trimmed.split_once("://") {
        anyhow::bail!("unsupported url scheme '{scheme}'");
    }
    Ok(AudioSource::File(PathBuf::from(trimmed)))
}

/// Fetch and decode whatever `url` points at.
pub fn load_url(url: &str, timeout: Duration) -> anyhow::Result<AudioBuffer> {
    match resolve_source(url)? {
        AudioSource::File(path) => decode_file(&path),
        AudioSource::Http(url) => {
            let bytes = fetch_bytes(&url, timeout)?;
            decode_bytes(bytes, extension_hint(&url))
        }
    }
}

pub fn fetch_bytes(url: &str, timeout: Duration) -> anyhow::Result<Vec<u8>> {
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    let response = agent
        .get(url)
        .call()
        .map_err(|e| anyhow::anyhow!("fetch failed for {url}: {e}"))?;

    let mut bytes = Vec::new();
    response.into_reader().read_to_end(&mut bytes)?;
    log::debug!("fetched {} bytes from {url}", bytes.len());
    Ok(bytes)
}

fn extension_hint(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    (!ext.is_empty()).then_some(ext)
}

pub fn decode_file(path: &Path) -> anyhow::Result<AudioBuffer> {
    if !path.exists() {
        anyhow::bail!("audio file not found: {}", path.display());
    }
    let file = File::open(path)?;
    let ext = path.extension().and_then(|e| e.to_str());
    decode_source(Box::new(file), ext)
}

pub fn decode_bytes(bytes: Vec<u8>, extension: Option<&str>) -> anyhow::Result<AudioBuffer> {
    decode_source(Box::new(Cursor::new(bytes)), extension)
}

fn decode_source(source: Box<dyn MediaSource>, extension: Option<&str>) -> anyhow::Result<AudioBuffer> {
    let mss = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("no default track"))?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow::anyhow!("track has no sample rate"))?;
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0) as u16;
    let track_id = track.id;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(symphonia::core::errors::Error::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // a corrupt packet is skipped, not fatal
            Err(symphonia::core::errors::Error::DecodeError(msg)) => {
                log::warn!("skipping undecodable packet: {msg}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let spec = *decoded.spec();
        if channels == 0 {
            channels = spec.channels.count() as u16;
        }
        let duration = decoded.capacity() as u64;

        let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    if channels == 0 || samples.is_empty() {
        anyhow::bail!("no audio decoded");
    }

    let remainder = samples.len() % channels as usize;
    samples.truncate(samples.len() - remainder);

    Ok(AudioBuffer {
        samples,
        sample_rate,
        channels,
    })
}
