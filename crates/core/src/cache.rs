use std::collections::HashMap;
use std::time::Duration;

use beatlayer_transport::AudioArc;

/// Fetch, decode and bring a clip to the context's sample rate.
pub fn load_resampled(url: &str, timeout: Duration, sample_rate: u32) -> anyhow::Result<AudioArc> {
    let buffer = beatlayer_decode::load_url(url, timeout)?.into_arc();
    if buffer.sample_rate() == sample_rate {
        return Ok(buffer);
    }
    log::debug!(
        "resampling {url} from {} Hz to {sample_rate} Hz",
        buffer.sample_rate()
    );
    buffer.resample(sample_rate)
}

/// Decoded buffers for the lifetime of a session, keyed by URL and rate.
#[derive(Debug)]
pub struct BufferCache {
    entries: HashMap<(String, u32), AudioArc>,
    timeout: Duration,
}

impl BufferCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get(&self, url: &str, sample_rate: u32) -> Option<AudioArc> {
        self.entries.get(&(url.to_string(), sample_rate)).cloned()
    }

    pub fn insert(&mut self, url: &str, buffer: AudioArc) {
        self.entries
            .insert((url.to_string(), buffer.sample_rate()), buffer);
    }

    pub fn load(&mut self, url: &str, sample_rate: u32) -> anyhow::Result<AudioArc> {
        if let Some(buffer) = self.get(url, sample_rate) {
            return Ok(buffer);
        }
        let buffer = load_resampled(url, self.timeout, sample_rate)?;
        self.insert(url, buffer.clone());
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
