// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Initialize Prometheus metrics exporter and return handle
pub fn init_metrics() -> anyhow::Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record a transcoder spawn attempt and its outcome
pub fn record_transcoder_start(stream: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!("cctv_relay_transcoder_starts_total", "stream" => stream.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Record an unexpected transcoder exit
pub fn record_transcoder_crash(stream: &str) {
    counter!("cctv_relay_transcoder_crashes_total", "stream" => stream.to_string()).increment(1);
}

/// Record how long a transcoder ran before exiting
pub fn record_transcoder_uptime(stream: &str, uptime: Duration) {
    histogram!("cctv_relay_transcoder_uptime_seconds", "stream" => stream.to_string())
        .record(uptime.as_secs_f64());
}

/// Record an operator-requested restart
pub fn record_restart(stream: &str) {
    counter!("cctv_relay_restarts_total", "stream" => stream.to_string()).increment(1);
}

/// Number of live transcoder processes
pub fn set_active_transcoders(count: usize) {
    gauge!("cctv_relay_active_transcoders").set(count as f64);
}

/// Record one broadcast chunk
pub fn record_chunk(channel: &str, bytes: usize, delivered: usize, dropped: usize) {
    let channel = channel.to_string();
    counter!("cctv_relay_chunks_total", "channel" => channel.clone()).increment(1);
    counter!("cctv_relay_bytes_total", "channel" => channel.clone()).increment(bytes as u64);
    if delivered > 0 {
        counter!("cctv_relay_deliveries_total", "channel" => channel.clone())
            .increment(delivered as u64);
    }
    if dropped > 0 {
        counter!("cctv_relay_dropped_chunks_total", "channel" => channel).increment(dropped as u64);
    }
}

/// Number of connected viewers on a channel
pub fn set_subscribers(channel: &str, count: usize) {
    gauge!("cctv_relay_subscribers", "channel" => channel.to_string()).set(count as f64);
}

/// Record a rejected viewer handshake
pub fn record_rejected_connection() {
    counter!("cctv_relay_rejected_connections_total").increment(1);
}
