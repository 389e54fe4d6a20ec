// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! cctv-relay library
//!
//! Relays RTSP camera feeds to browser viewers: one supervised ffmpeg process
//! per camera writes MPEG-TS to stdout, and every chunk is fanned out to the
//! WebSocket viewers subscribed to that camera's channel.

pub mod acceptor;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod supervisor;
pub mod transcoder;

// Re-export main types for convenience
pub use config::{RelayConfig, StreamDefinition, TranscodeParams};
pub use error::{ConfigError, SupervisorError, TranscoderError};
pub use registry::ChannelRegistry;
pub use router::BroadcastRouter;
pub use supervisor::{StreamStatus, StreamSupervisor, SupervisorOptions};
pub use transcoder::{FfmpegCommand, LaunchCommand, TranscoderState};
