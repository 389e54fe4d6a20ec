// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

use futures::StreamExt;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{RelayConfig, StreamDefinition};
use crate::error::TranscoderError;
use crate::metrics::record_transcoder_uptime;
use crate::router::BroadcastRouter;

/// How long a crashed process's stdout may keep draining before the reader is cut off
const READER_DRAIN: Duration = Duration::from_secs(1);

/// Last known state of a stream's transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscoderState {
    Starting,
    Running,
    Failed,
    Stopped,
}

/// Builds the command line for a stream's transcoder process
pub trait LaunchCommand: Send + Sync {
    fn command(&self, definition: &StreamDefinition) -> Command;
}

/// ffmpeg RTSP -> MPEG-TS on stdout
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    ffmpeg_path: String,
    loglevel: String,
}

impl FfmpegCommand {
    pub fn new(ffmpeg_path: impl Into<String>, loglevel: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            loglevel: loglevel.into(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(&config.ffmpeg_path, &config.ffmpeg_loglevel)
    }

    /// Build FFmpeg command line arguments for one stream
    pub fn build_ffmpeg_args(&self, definition: &StreamDefinition) -> Vec<String> {
        let params = &definition.params;
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.loglevel.clone(),
        ];

        if let Some(transport) = &params.rtsp_transport {
            args.push("-rtsp_transport".to_string());
            args.push(transport.clone());
        }

        args.extend([
            "-i".to_string(),
            definition.url.clone(),
            // Output format
            "-f".to_string(),
            "mpegts".to_string(),
            "-codec:v".to_string(),
            params.video_codec.clone(),
            "-b:v".to_string(),
            params.video_bitrate.clone(),
            "-r".to_string(),
            params.frame_rate.to_string(),
            // No B-frames: they add a frame of reorder delay
            "-bf".to_string(),
            params.b_frames.to_string(),
            "-q:v".to_string(),
            params.quality.to_string(),
        ]);

        if let Some(tune) = &params.tune {
            args.push("-tune".to_string());
            args.push(tune.clone());
        }

        args.push("pipe:1".to_string());
        args
    }
}

impl LaunchCommand for FfmpegCommand {
    fn command(&self, definition: &StreamDefinition) -> Command {
        let args = self.build_ffmpeg_args(definition);
        debug!(stream = %definition.id, "FFmpeg command: {} {}", self.ffmpeg_path, args.join(" "));

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(&args);
        cmd
    }
}

/// Sent to the owner whenever a transcoder process is gone
#[derive(Debug, Clone)]
pub struct TranscoderExit {
    pub stream_id: String,
    pub generation: u64,
    /// `None` when killed by a signal or the wait failed
    pub code: Option<i32>,
    /// True if the exit followed a `stop`
    pub requested: bool,
    pub uptime: Duration,
}

/// A running transcoder process owned by the supervisor
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct TranscoderHandle {
    stream_id: String,
    generation: u64,
    pid: Option<u32>,
    state: TranscoderState,
    started_at: Instant,
    cancel: CancellationToken,
    exited: Option<oneshot::Receiver<()>>,
    stop_timeout: Duration,
}

impl TranscoderHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> TranscoderState {
        self.state
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Kill the process and wait (bounded) for it to go away
    ///
    /// Forwarding stops before this returns. Stopping twice is a no-op.
    pub async fn stop(&mut self) -> Result<(), TranscoderError> {
        let Some(exited) = self.exited.take() else {
            return Ok(());
        };

        self.cancel.cancel();
        self.state = TranscoderState::Stopped;

        match tokio::time::timeout(self.stop_timeout, exited).await {
            Ok(_) => {
                debug!(stream = %self.stream_id, generation = self.generation, "Transcoder stopped");
                Ok(())
            }
            Err(_) => Err(TranscoderError::StopTimeout {
                stream: self.stream_id.clone(),
                timeout: self.stop_timeout,
            }),
        }
    }
}

impl Drop for TranscoderHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawns transcoder processes and wires their output into the router
pub struct Transcoder {
    launcher: Arc<dyn LaunchCommand>,
    router: BroadcastRouter,
    exits: mpsc::UnboundedSender<TranscoderExit>,
    chunk_size: usize,
    stop_timeout: Duration,
}

impl Transcoder {
    pub fn new(
        launcher: Arc<dyn LaunchCommand>,
        router: BroadcastRouter,
        exits: mpsc::UnboundedSender<TranscoderExit>,
    ) -> Self {
        Self {
            launcher,
            router,
            exits,
            chunk_size: 8192,
            stop_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Spawn the process for `definition` and start forwarding its stdout
    pub fn start(
        &self,
        definition: &StreamDefinition,
        generation: u64,
    ) -> Result<TranscoderHandle, TranscoderError> {
        let stream_id = definition.id.clone();

        let mut child = self
            .launcher
            .command(definition)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscoderError::Spawn {
                stream: stream_id.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| TranscoderError::MissingPipe {
            stream: stream_id.clone(),
            pipe: "stdout",
        })?;
        let stderr = child.stderr.take().ok_or_else(|| TranscoderError::MissingPipe {
            stream: stream_id.clone(),
            pipe: "stderr",
        })?;

        let pid = child.id();
        let started_at = Instant::now();
        let cancel = CancellationToken::new();
        let (exited_tx, exited_rx) = oneshot::channel();

        // Log FFmpeg stderr in background
        tokio::spawn(log_stderr(stream_id.clone(), stderr));

        let reader_cancel = cancel.child_token();
        let reader = tokio::spawn(forward_output(
            stream_id.clone(),
            stdout,
            self.chunk_size,
            self.router.clone(),
            reader_cancel.clone(),
        ));

        tokio::spawn(wait_for_exit(ExitWatch {
            stream_id: stream_id.clone(),
            generation,
            child,
            cancel: cancel.clone(),
            reader,
            reader_cancel,
            started_at,
            exits: self.exits.clone(),
            exited: exited_tx,
        }));

        info!(stream = %stream_id, channel = %definition.channel, pid = ?pid, generation, "Transcoder started");

        Ok(TranscoderHandle {
            stream_id,
            generation,
            pid,
            state: TranscoderState::Running,
            started_at,
            cancel,
            exited: Some(exited_rx),
            stop_timeout: self.stop_timeout,
        })
    }
}

/// Log stderr line by line until EOF
///
/// Lines are raw bytes (camera metadata is not always UTF-8). The pipe is
/// drained to the end even after a read error so the process never hits a
/// closed stderr.
async fn log_stderr(stream_id: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                debug!(stream = %stream_id, "FFmpeg: {}", text.trim_end());
            }
            Err(e) => {
                warn!(stream = %stream_id, "Error reading FFmpeg stderr: {}", e);
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    warn!(stream = %stream_id, "FFmpeg stderr closed: {}", e);
                }
                break;
            }
        }
    }
}

/// Read stdout chunk by chunk and route each one as soon as it arrives
async fn forward_output(
    stream_id: String,
    stdout: ChildStdout,
    chunk_size: usize,
    router: BroadcastRouter,
    cancel: CancellationToken,
) {
    let mut chunks = ReaderStream::with_capacity(stdout, chunk_size);
    let mut total: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = chunks.next() => match next {
                Some(Ok(chunk)) => {
                    total += chunk.len() as u64;
                    router.route(&stream_id, chunk).await;
                }
                Some(Err(e)) => {
                    warn!(stream = %stream_id, "Error reading transcoder output: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    debug!(stream = %stream_id, bytes = total, "Transcoder output closed");
}

struct ExitWatch {
    stream_id: String,
    generation: u64,
    child: Child,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    reader_cancel: CancellationToken,
    started_at: Instant,
    exits: mpsc::UnboundedSender<TranscoderExit>,
    exited: oneshot::Sender<()>,
}

/// Wait for the process to exit or be stopped, then report it
async fn wait_for_exit(watch: ExitWatch) {
    let ExitWatch {
        stream_id,
        generation,
        mut child,
        cancel,
        mut reader,
        reader_cancel,
        started_at,
        exits,
        exited,
    } = watch;

    let (status, requested) = tokio::select! {
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(stream = %stream_id, "Failed to kill FFmpeg process: {}", e);
            }
            (child.wait().await, true)
        }
        status = child.wait() => (status, cancel.is_cancelled()),
    };

    let code = match &status {
        Ok(status) if status.success() => {
            debug!(stream = %stream_id, "FFmpeg process exited successfully");
            status.code()
        }
        Ok(status) => {
            if !requested {
                warn!(stream = %stream_id, "FFmpeg process exited with status: {}", status);
            }
            status.code()
        }
        Err(e) => {
            error!(stream = %stream_id, "Failed to wait for FFmpeg process: {}", e);
            None
        }
    };

    // Let whatever is still in the pipe reach viewers, unless we were told to stop
    if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
        reader_cancel.cancel();
        let _ = reader.await;
    }

    let uptime = started_at.elapsed();
    record_transcoder_uptime(&stream_id, uptime);

    let _ = exits.send(TranscoderExit {
        stream_id,
        generation,
        code,
        requested,
        uptime,
    });
    let _ = exited.send(());
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Runs a shell script in place of ffmpeg; `$STREAM_ID` is set per stream
    pub struct ShellCommand(pub String);

    impl LaunchCommand for ShellCommand {
        fn command(&self, definition: &StreamDefinition) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.0).env("STREAM_ID", &definition.id);
            cmd
        }
    }
}
