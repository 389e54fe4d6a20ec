// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Stream supervisor
//!
//! Owns one slot per configured stream. A slot holds the live transcoder
//! handle (if any), the pending retry (if any) and a generation counter that
//! is bumped on every start. All operations on a stream lock its slot, so a
//! manual restart and a crash-triggered retry for the same id are serialized.
//!
//! Exit notifications and due retries arrive on channels and are handled by
//! a background event loop. Anything tagged with an older generation than the
//! slot's current one is stale and ignored.
//!
//! Every slot transition publishes a snapshot; status reads those and never
//! waits behind a stop in progress.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{RelayConfig, StreamDefinition};
use crate::error::{SupervisorError, TranscoderError};
use crate::metrics::{
    record_restart, record_transcoder_crash, record_transcoder_start, set_active_transcoders,
};
use crate::registry::ChannelRegistry;
use crate::router::BroadcastRouter;
use crate::transcoder::{
    LaunchCommand, Transcoder, TranscoderExit, TranscoderHandle, TranscoderState,
};

/// Supervisor tuning
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Fixed delay between a failure and the next start attempt; retries are unbounded
    pub retry_delay: Duration,
    pub stop_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            chunk_size: 8192,
        }
    }
}

impl SupervisorOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            retry_delay: config.retry_delay,
            stop_timeout: config.stop_timeout,
            chunk_size: config.chunk_size,
        }
    }
}

/// One row of the status report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub id: String,
    pub name: String,
    pub channel: String,
    pub ws_port: Option<u16>,
    pub is_active: bool,
    pub state: TranscoderState,
    pub pid: Option<u32>,
    pub generation: u64,
    pub uptime_secs: Option<u64>,
    pub subscribers: usize,
}

struct Slot {
    handle: Option<TranscoderHandle>,
    /// Used only while there is no handle
    state: TranscoderState,
    generation: u64,
    retry: Option<CancellationToken>,
}

impl Slot {
    fn new() -> Self {
        Self {
            handle: None,
            state: TranscoderState::Stopped,
            generation: 0,
            retry: None,
        }
    }

    fn state(&self) -> TranscoderState {
        self.handle.as_ref().map_or(self.state, TranscoderHandle::state)
    }

    fn cancel_retry(&mut self) {
        if let Some(token) = self.retry.take() {
            token.cancel();
        }
    }

    fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            state: self.state(),
            active: self.handle.is_some(),
            pid: self.handle.as_ref().and_then(TranscoderHandle::pid),
            generation: self.generation,
            started_at: self.handle.as_ref().map(TranscoderHandle::started_at),
        }
    }
}

/// Last published view of a slot
#[derive(Debug, Clone)]
struct SlotSnapshot {
    state: TranscoderState,
    active: bool,
    pid: Option<u32>,
    generation: u64,
    started_at: Option<Instant>,
}

struct StreamEntry {
    definition: StreamDefinition,
    slot: Mutex<Slot>,
    snapshot: watch::Sender<SlotSnapshot>,
}

impl StreamEntry {
    fn new(definition: StreamDefinition) -> Self {
        let slot = Slot::new();
        let (snapshot, _) = watch::channel(slot.snapshot());
        Self {
            definition,
            slot: Mutex::new(slot),
            snapshot,
        }
    }

    fn publish(&self, slot: &Slot) {
        self.snapshot.send_replace(slot.snapshot());
    }
}

struct RetryDue {
    stream_id: String,
    generation: u64,
}

pub struct StreamSupervisor {
    order: Vec<String>,
    streams: HashMap<String, StreamEntry>,
    transcoder: Transcoder,
    registry: Arc<ChannelRegistry>,
    retry_delay: Duration,
    retries: mpsc::UnboundedSender<RetryDue>,
    shutdown: CancellationToken,
}

impl StreamSupervisor {
    pub fn new(
        definitions: Vec<StreamDefinition>,
        launcher: Arc<dyn LaunchCommand>,
        router: BroadcastRouter,
        options: SupervisorOptions,
    ) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let registry = Arc::clone(router.registry());

        let transcoder = Transcoder::new(launcher, router, exit_tx)
            .with_chunk_size(options.chunk_size)
            .with_stop_timeout(options.stop_timeout);

        let order = definitions.iter().map(|d| d.id.clone()).collect();
        let streams = definitions
            .into_iter()
            .map(|d| (d.id.clone(), StreamEntry::new(d)))
            .collect();

        let supervisor = Arc::new(Self {
            order,
            streams,
            transcoder,
            registry,
            retry_delay: options.retry_delay,
            retries: retry_tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_events(
            Arc::downgrade(&supervisor),
            exit_rx,
            retry_rx,
            supervisor.shutdown.clone(),
        ));

        supervisor
    }

    pub fn contains(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    fn entry(&self, id: &str) -> Result<&StreamEntry, SupervisorError> {
        self.streams
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownStream(id.to_string()))
    }

    /// Start every configured stream; a failing stream only schedules its own retry
    pub async fn start_all(&self) {
        for id in &self.order {
            if let Err(e) = self.start(id).await {
                error!(stream = %id, "Failed to start stream: {}", e);
            }
        }
        info!(streams = self.order.len(), "All streams started");
    }

    /// Start a stream, retiring whatever process it had first
    pub async fn start(&self, id: &str) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        let mut slot = entry.slot.lock().await;
        self.retire(entry, &mut slot).await;
        self.launch(entry, &mut slot);
        drop(slot);
        self.update_active_gauge();
        Ok(())
    }

    /// Stop the current process (best effort) and start the stream again
    pub async fn restart(&self, id: &str) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        let mut slot = entry.slot.lock().await;
        info!(stream = %id, "Restarting stream");
        record_restart(id);
        self.retire(entry, &mut slot).await;
        self.launch(entry, &mut slot);
        drop(slot);
        self.update_active_gauge();
        Ok(())
    }

    /// Stop a stream and cancel any pending retry; it stays down until started again
    pub async fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        let mut slot = entry.slot.lock().await;
        self.retire(entry, &mut slot).await;
        slot.state = TranscoderState::Stopped;
        entry.publish(&slot);
        drop(slot);
        self.update_active_gauge();
        Ok(())
    }

    /// Stop everything concurrently. Errors are logged and returned; they never abort the sequence.
    pub async fn shutdown(&self) -> Vec<TranscoderError> {
        info!("Stopping all streams...");
        self.shutdown.cancel();

        let stops = self
            .order
            .iter()
            .filter_map(|id| self.streams.get(id))
            .map(|entry| async move {
                let mut slot = entry.slot.lock().await;
                slot.cancel_retry();
                let handle = slot.handle.take();
                slot.state = TranscoderState::Stopped;
                entry.publish(&slot);
                drop(slot);

                let mut handle = handle?;
                match handle.stop().await {
                    Ok(()) => None,
                    Err(e) => {
                        error!(stream = %entry.definition.id, "Error stopping stream during shutdown: {}", e);
                        Some(e)
                    }
                }
            });
        let errors: Vec<_> = join_all(stops).await.into_iter().flatten().collect();

        set_active_transcoders(0);
        info!(errors = errors.len(), "All streams stopped");
        errors
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// One entry per configured stream, in configuration order
    pub async fn status(&self) -> Vec<StreamStatus> {
        let mut out = Vec::with_capacity(self.order.len());
        for id in &self.order {
            let Some(entry) = self.streams.get(id) else {
                continue;
            };
            let snapshot = entry.snapshot.borrow().clone();
            let def = &entry.definition;
            out.push(StreamStatus {
                id: def.id.clone(),
                name: def.name.clone(),
                channel: def.channel.clone(),
                ws_port: def.ws_port,
                is_active: snapshot.active,
                state: snapshot.state,
                pid: snapshot.pid,
                generation: snapshot.generation,
                uptime_secs: snapshot.started_at.map(|t| t.elapsed().as_secs()),
                subscribers: self.registry.subscriber_count(&def.channel).await,
            });
        }
        out
    }

    /// Kill the slot's process (if any) and cancel its pending retry
    async fn retire(&self, entry: &StreamEntry, slot: &mut Slot) {
        slot.cancel_retry();
        if let Some(mut handle) = slot.handle.take() {
            slot.state = TranscoderState::Stopped;
            entry.publish(slot);
            if let Err(e) = handle.stop().await {
                warn!(stream = %entry.definition.id, "Error stopping stream: {}", e);
            }
        }
    }

    /// Spawn a fresh process for an empty slot; on failure schedule a retry
    fn launch(&self, entry: &StreamEntry, slot: &mut Slot) {
        let definition = &entry.definition;
        if self.is_shutting_down() {
            debug!(stream = %definition.id, "Not starting stream during shutdown");
            slot.state = TranscoderState::Stopped;
            entry.publish(slot);
            return;
        }

        slot.cancel_retry();
        slot.generation += 1;
        slot.state = TranscoderState::Starting;

        match self.transcoder.start(definition, slot.generation) {
            Ok(handle) => {
                record_transcoder_start(&definition.id, true);
                info!(stream = %definition.id, name = %definition.name, "Stream started successfully");
                slot.handle = Some(handle);
                slot.state = TranscoderState::Running;
            }
            Err(e) => {
                record_transcoder_start(&definition.id, false);
                error!(stream = %definition.id, "Failed to start stream: {}", e);
                slot.state = TranscoderState::Failed;
                self.schedule_retry(&definition.id, slot);
            }
        }
        entry.publish(slot);
    }

    fn schedule_retry(&self, stream_id: &str, slot: &mut Slot) {
        let token = self.shutdown.child_token();
        slot.cancel_retry();
        slot.retry = Some(token.clone());

        let due = RetryDue {
            stream_id: stream_id.to_string(),
            generation: slot.generation,
        };
        let delay = self.retry_delay;
        let retries = self.retries.clone();

        info!(stream = %due.stream_id, delay_ms = delay.as_millis() as u64, "Retry scheduled");

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = retries.send(due);
                }
            }
        });
    }

    async fn handle_exit(&self, exit: TranscoderExit) {
        let Some(entry) = self.streams.get(&exit.stream_id) else {
            return;
        };
        let mut slot = entry.slot.lock().await;

        let current = slot.handle.as_ref().map(TranscoderHandle::generation);
        if exit.requested || current != Some(exit.generation) {
            debug!(
                stream = %exit.stream_id,
                generation = exit.generation,
                requested = exit.requested,
                "Ignoring exit of retired transcoder"
            );
            return;
        }

        warn!(
            stream = %exit.stream_id,
            code = ?exit.code,
            uptime_secs = exit.uptime.as_secs(),
            "Transcoder exited unexpectedly"
        );
        record_transcoder_crash(&exit.stream_id);

        slot.handle = None;
        slot.state = TranscoderState::Failed;
        if !self.is_shutting_down() {
            self.schedule_retry(&exit.stream_id, &mut slot);
        }
        entry.publish(&slot);
        drop(slot);
        self.update_active_gauge();
    }

    async fn handle_retry(&self, due: RetryDue) {
        let Some(entry) = self.streams.get(&due.stream_id) else {
            return;
        };
        let mut slot = entry.slot.lock().await;

        let pending = slot.retry.as_ref().is_some_and(|t| !t.is_cancelled());
        if !pending || slot.generation != due.generation || slot.handle.is_some() {
            debug!(stream = %due.stream_id, generation = due.generation, "Dropping stale retry");
            return;
        }

        slot.retry = None;
        info!(stream = %due.stream_id, "Retrying stream start");
        self.launch(entry, &mut slot);
        drop(slot);
        self.update_active_gauge();
    }

    fn update_active_gauge(&self) {
        let active = self
            .streams
            .values()
            .filter(|entry| entry.snapshot.borrow().active)
            .count();
        set_active_transcoders(active);
    }
}

/// Dispatch exit notifications and due retries until shutdown
async fn run_events(
    supervisor: Weak<StreamSupervisor>,
    mut exits: mpsc::UnboundedReceiver<TranscoderExit>,
    mut retries: mpsc::UnboundedReceiver<RetryDue>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(exit) = exits.recv() => {
                let Some(supervisor) = supervisor.upgrade() else { break };
                tokio::spawn(async move { supervisor.handle_exit(exit).await });
            }
            Some(due) = retries.recv() => {
                let Some(supervisor) = supervisor.upgrade() else { break };
                tokio::spawn(async move { supervisor.handle_retry(due).await });
            }
            else => break,
        }
    }
    debug!("Supervisor event loop finished");
}
