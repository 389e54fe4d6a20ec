// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Error types shared across the relay.

use std::time::Duration;

/// Failures of a single transcoder process.
#[derive(Debug, thiserror::Error)]
pub enum TranscoderError {
    #[error("failed to spawn transcoder for {stream}: {source}")]
    Spawn {
        stream: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder for {stream} has no {pipe} pipe")]
    MissingPipe { stream: String, pipe: &'static str },

    #[error("transcoder for {stream} did not exit within {timeout:?} after kill")]
    StopTimeout { stream: String, timeout: Duration },
}

/// Errors returned by supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("stream not found: {0}")]
    UnknownStream(String),
}

/// Invalid static configuration; fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read streams file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse streams file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no streams configured")]
    Empty,

    #[error("stream definition #{index} has an empty {field}")]
    EmptyField { index: usize, field: &'static str },

    #[error("duplicate stream id: {0}")]
    DuplicateId(String),

    #[error("duplicate channel: {0}")]
    DuplicateChannel(String),

    #[error("viewer port {0} is used more than once")]
    DuplicatePort(u16),
}
