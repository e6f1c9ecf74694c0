use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::error::GraphError;
use crate::graph::Graph;

/// Output stream driving a render graph from the cpal callback.
pub struct DeviceOutput {
    stream: cpal::Stream,
    sample_rate: u32,
}

/// Sample rate the default output device will run at.
pub fn default_sample_rate(requested: Option<u32>) -> Result<u32, GraphError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(GraphError::NoOutputDevice)?;
    let config = device
        .default_output_config()
        .map_err(|e| GraphError::Stream(e.to_string()))?;
    Ok(requested.unwrap_or(config.sample_rate().0))
}

impl DeviceOutput {
    /// Open the default device and hand `graph` to its callback. The stream
    /// is left paused; call [`DeviceOutput::play`] to start it.
    pub fn open(graph: Graph, sample_rate: u32) -> Result<Self, GraphError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(GraphError::NoOutputDevice)?;

        let supported = device
            .default_output_config()
            .map_err(|e| GraphError::Stream(e.to_string()))?;

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                let mut config: cpal::StreamConfig = supported.into();
                config.sample_rate = cpal::SampleRate(sample_rate);
                build_stream(&device, &config, graph)?
            }
            sample_format => {
                return Err(GraphError::UnsupportedSampleFormat(sample_format.to_string()));
            }
        };

        // some hosts start streams on creation
        let _ = stream.pause();

        log::info!(
            "opened output device '{}' at {sample_rate} Hz",
            device.name().unwrap_or_else(|_| "unknown".into())
        );

        Ok(Self {
            stream,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn play(&self) -> Result<(), GraphError> {
        self.stream
            .play()
            .map_err(|e| GraphError::Stream(e.to_string()))
    }

    pub fn pause(&self) -> Result<(), GraphError> {
        self.stream
            .pause()
            .map_err(|e| GraphError::Stream(e.to_string()))
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut graph: Graph,
) -> Result<cpal::Stream, GraphError> {
    let output_channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                graph.fill(data, output_channels);
            },
            |err| log::error!("stream error: {err}"),
            None,
        )
        .map_err(|e| GraphError::Stream(e.to_string()))
}
