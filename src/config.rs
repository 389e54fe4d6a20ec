// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Static relay configuration
//!
//! Runtime knobs come from environment variables, the stream list from an
//! optional JSON file (`STREAMS_FILE`). Without a file the built-in camera
//! set is used.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// ffmpeg output parameters for one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeParams {
    /// Output frame rate (`-r`)
    pub frame_rate: u32,

    /// Video codec (`-codec:v`), mpeg1video for JSMpeg players
    pub video_codec: String,

    /// Video bitrate (`-b:v`, e.g. "800k")
    pub video_bitrate: String,

    /// Max B-frames (`-bf`); 0 keeps latency down
    pub b_frames: u32,

    /// Quantizer scale (`-q:v`, 1-31, lower is better)
    pub quality: u32,

    /// Encoder tuning (`-tune`)
    pub tune: Option<String>,

    /// RTSP transport (`-rtsp_transport`, e.g. "tcp")
    pub rtsp_transport: Option<String>,
}

impl Default for TranscodeParams {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            video_codec: "mpeg1video".to_string(),
            video_bitrate: "800k".to_string(),
            b_frames: 0,
            quality: 5,
            tune: Some("zerolatency".to_string()),
            rtsp_transport: None,
        }
    }
}

/// One camera feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDefinition {
    pub id: String,
    pub name: String,
    pub url: String,
    pub channel: String,

    /// Dedicated viewer port; clients connecting here need no channel parameter
    #[serde(default)]
    pub ws_port: Option<u16>,

    #[serde(default)]
    pub params: TranscodeParams,
}

/// Process-wide settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Control HTTP port
    pub control_port: u16,

    /// Shared viewer WebSocket port (channel via query parameter)
    pub viewer_port: u16,

    /// FFmpeg path
    pub ffmpeg_path: String,

    /// FFmpeg `-loglevel`
    pub ffmpeg_loglevel: String,

    /// Fixed delay before a failed stream is started again
    pub retry_delay: Duration,

    /// How long `stop` waits for a killed process to exit
    pub stop_timeout: Duration,

    /// Per-viewer queue length in chunks
    pub subscriber_buffer: usize,

    /// Bytes per stdout read
    pub chunk_size: usize,

    pub streams: Vec<StreamDefinition>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            control_port: 8080,
            viewer_port: 9990,
            ffmpeg_path: "ffmpeg".to_string(),
            ffmpeg_loglevel: "error".to_string(),
            retry_delay: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            subscriber_buffer: 64,
            chunk_size: 8192,
            streams: default_streams(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let streams = match std::env::var("STREAMS_FILE") {
            Ok(path) => load_streams(&path)?,
            Err(_) => defaults.streams,
        };
        validate_streams(&streams)?;

        Ok(Self {
            control_port: env_parse("CONTROL_PORT").unwrap_or(defaults.control_port),
            viewer_port: env_parse("VIEWER_PORT").unwrap_or(defaults.viewer_port),
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
            ffmpeg_loglevel: std::env::var("FFMPEG_LOGLEVEL")
                .unwrap_or(defaults.ffmpeg_loglevel),
            retry_delay: env_parse("RETRY_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
            stop_timeout: env_parse("STOP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_timeout),
            subscriber_buffer: env_parse("SUBSCRIBER_BUFFER")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.subscriber_buffer),
            chunk_size: env_parse("CHUNK_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.chunk_size),
            streams,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Read a JSON array of stream definitions
pub fn load_streams(path: impl AsRef<Path>) -> Result<Vec<StreamDefinition>, ConfigError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}

/// Ids, channels and dedicated ports must be unique; two transcoders on one
/// channel would interleave their transport streams.
pub fn validate_streams(streams: &[StreamDefinition]) -> Result<(), ConfigError> {
    if streams.is_empty() {
        return Err(ConfigError::Empty);
    }

    let mut ids = HashSet::new();
    let mut channels = HashSet::new();
    let mut ports = HashSet::new();

    for (index, def) in streams.iter().enumerate() {
        for (field, value) in [("id", &def.id), ("channel", &def.channel), ("url", &def.url)] {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyField { index, field });
            }
        }
        if !ids.insert(def.id.as_str()) {
            return Err(ConfigError::DuplicateId(def.id.clone()));
        }
        if !channels.insert(def.channel.as_str()) {
            return Err(ConfigError::DuplicateChannel(def.channel.clone()));
        }
        if let Some(port) = def.ws_port {
            if !ports.insert(port) {
                return Err(ConfigError::DuplicatePort(port));
            }
        }
    }

    Ok(())
}

/// The nine public test cameras the relay ships with
pub fn default_streams() -> Vec<StreamDefinition> {
    (1..=9u16)
        .map(|n| StreamDefinition {
            id: format!("stream{n}"),
            name: format!("cctv{n}"),
            url: format!("rtsp://210.99.70.120:1935/live/cctv{n:03}.stream"),
            channel: format!("channel{n}"),
            ws_port: Some(9990 + n),
            params: TranscodeParams::default(),
        })
        .collect()
}
