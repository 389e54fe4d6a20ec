// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Broadcast router
//!
//! Resolves the channel for a stream and hands every transcoder chunk to the
//! registry in the order it was read. There is no buffering here; each viewer
//! has its own bounded queue and a full queue only costs that viewer the chunk.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::config::StreamDefinition;
use crate::metrics::record_chunk;
use crate::registry::{BroadcastReport, ChannelRegistry};

#[derive(Clone)]
pub struct BroadcastRouter {
    registry: Arc<ChannelRegistry>,
    channels: Arc<HashMap<String, String>>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ChannelRegistry>, streams: &[StreamDefinition]) -> Self {
        let channels = streams
            .iter()
            .map(|def| (def.id.clone(), def.channel.clone()))
            .collect();
        Self {
            registry,
            channels: Arc::new(channels),
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn channel_for(&self, stream_id: &str) -> Option<&str> {
        self.channels.get(stream_id).map(String::as_str)
    }

    /// Forward one chunk produced by `stream_id`'s transcoder
    pub async fn route(&self, stream_id: &str, chunk: Bytes) -> BroadcastReport {
        let Some(channel) = self.channel_for(stream_id) else {
            warn!(stream = %stream_id, "Chunk from unconfigured stream dropped");
            return BroadcastReport::default();
        };

        let len = chunk.len();
        let report = self.registry.broadcast(channel, chunk).await;
        record_chunk(channel, len, report.delivered, report.dropped);
        trace!(
            stream = %stream_id,
            channel = %channel,
            bytes = len,
            delivered = report.delivered,
            dropped = report.dropped,
            "Chunk routed"
        );
        report
    }
}
