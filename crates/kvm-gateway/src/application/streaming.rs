//! Supervised stream loops, one per (device, stream type).
//!
//! # Lifecycle
//!
//! ```text
//! absent ──start_stream──▶ starting ──loop spawned──▶ active
//!   ▲                                                   │
//!   └──────── removed ◀── task awaited ◀── stopping ◀───┘ stop_stream
//! ```
//!
//! Each active stream owns exactly one tokio task:
//!
//! - **mjpeg** polls a snapshot every `1/fps` and broadcasts `mjpeg_frame`
//!   (or `stream_error` when the poll fails; polling continues).
//! - **webrtc** broadcasts a `webrtc_status` heartbeat.
//! - **h264** broadcasts an `h264_status` heartbeat.
//!
//! All events go to the device's topic on the video fanout.  The live
//! config sits in a `tokio::sync::watch` channel so a quality change is
//! picked up by the running loop without restarting it.
//!
//! The stream map lock is never held while awaiting a task or a device.
//!
//! A key in `stopping` belongs to the `stop_stream` call that cancelled its
//! task: later stops skip it, and a `start_stream` for it waits until the
//! entry is gone and then starts a fresh loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use kvm_core::{
    GatewayError, GatewayEvent, StreamConfig, StreamDescriptor, StreamKey, StreamQuality,
    StreamState, StreamType,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::fanout::{ConnectionFanout, Subscriber};
use super::session::HardwareSessionManager;
use crate::domain::config::StreamingSettings;

/// Heartbeat periods of the non-polling loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTimings {
    pub webrtc_heartbeat: Duration,
    pub h264_heartbeat: Duration,
}

impl Default for StreamTimings {
    fn default() -> Self {
        Self::from(&StreamingSettings::default())
    }
}

impl From<&StreamingSettings> for StreamTimings {
    fn from(s: &StreamingSettings) -> Self {
        Self {
            webrtc_heartbeat: s.webrtc_heartbeat(),
            h264_heartbeat: s.h264_heartbeat(),
        }
    }
}

struct ActiveStream {
    config: watch::Sender<StreamConfig>,
    state: StreamState,
    task: Option<JoinHandle<()>>,
}

/// Everything a stream loop needs, moved into its task.
struct LoopContext {
    key: StreamKey,
    sessions: Arc<HardwareSessionManager>,
    video: Arc<ConnectionFanout>,
    config: watch::Receiver<StreamConfig>,
    timings: StreamTimings,
}

/// Starts, retunes and stops device streams.
pub struct StreamOrchestrator {
    sessions: Arc<HardwareSessionManager>,
    video: Arc<ConnectionFanout>,
    streams: Mutex<HashMap<StreamKey, ActiveStream>>,
    timings: StreamTimings,
}

impl StreamOrchestrator {
    pub fn new(
        sessions: Arc<HardwareSessionManager>,
        video: Arc<ConnectionFanout>,
        timings: StreamTimings,
    ) -> Self {
        Self {
            sessions,
            video,
            streams: Mutex::new(HashMap::new()),
            timings,
        }
    }

    /// Starts a stream, or describes the running one when the key is taken.
    ///
    /// A key that is being stopped is waited out, then started fresh.
    pub async fn start_stream(&self, config: StreamConfig) -> StreamDescriptor {
        let key = config.key();
        let mut streams = loop {
            let streams = self.streams.lock().await;
            match streams.get(&key) {
                Some(existing) if existing.state == StreamState::Stopping => {
                    // Removing the entry drops its config sender, which ends the wait.
                    let mut gone = existing.config.subscribe();
                    drop(streams);
                    debug!("stream {key} is stopping; restarting once it is gone");
                    while gone.changed().await.is_ok() {}
                }
                Some(existing) => {
                    let current = existing.config.borrow().clone();
                    let state = existing.state;
                    drop(streams);
                    let viewers = self.video.subscriber_count(&key.device_id).await;
                    let mut descriptor = StreamDescriptor::from_config(&current, state, viewers);
                    descriptor.already_active = true;
                    debug!("stream {key} already active");
                    return descriptor;
                }
                None => break streams,
            }
        };

        let (tx, rx) = watch::channel(config.clone());
        streams.insert(
            key.clone(),
            ActiveStream {
                config: tx,
                state: StreamState::Starting,
                task: None,
            },
        );

        let context = LoopContext {
            key: key.clone(),
            sessions: Arc::clone(&self.sessions),
            video: Arc::clone(&self.video),
            config: rx,
            timings: self.timings,
        };
        let task = tokio::spawn(run_loop(context));

        if let Some(entry) = streams.get_mut(&key) {
            entry.task = Some(task);
            entry.state = StreamState::Active;
        }
        drop(streams);

        info!(
            "stream {key} started ({}, {} fps, {} kbps)",
            config.quality, config.fps, config.bitrate
        );
        let viewers = self.video.subscriber_count(&key.device_id).await;
        StreamDescriptor::from_config(&config, StreamState::Active, viewers)
    }

    /// Stops one stream type of a device, or all of them when `stream_type`
    /// is `None`, and returns what was stopped.
    ///
    /// Viewers of the device are sent `stream_stopped` and then closed.
    /// Stopping nothing is a no-op returning an empty list; so is stopping
    /// keys another call is already stopping.  Only the call that cancels a
    /// task reports that key, after the task has finished.
    pub async fn stop_stream(
        &self,
        device_id: &str,
        stream_type: Option<StreamType>,
    ) -> Vec<StreamType> {
        let targets: Vec<(StreamKey, Option<JoinHandle<()>>)> = {
            let mut streams = self.streams.lock().await;
            streams
                .iter_mut()
                .filter(|(key, active)| {
                    key.device_id == device_id
                        && stream_type.map_or(true, |t| key.stream_type == t)
                        && active.state != StreamState::Stopping
                })
                .map(|(key, active)| {
                    active.state = StreamState::Stopping;
                    (key.clone(), active.task.take())
                })
                .collect()
        };

        let mut stopped = Vec::with_capacity(targets.len());
        for (key, task) in targets {
            if let Some(task) = task {
                task.abort();
                // A cancelled JoinError is the expected outcome.
                let _ = task.await;
            }
            self.streams.lock().await.remove(&key);
            info!("stream {key} stopped");
            stopped.push(key.stream_type);
        }

        if !stopped.is_empty() {
            stopped.sort();
            let event = GatewayEvent::StreamStopped {
                device_id: device_id.to_string(),
                stopped_streams: stopped.clone(),
            };
            self.video.broadcast(device_id, &event).await;
            self.video.close_topic(device_id).await;
        }
        stopped
    }

    /// Retunes the device's WebRTC stream in place and broadcasts
    /// `quality_changed`.
    ///
    /// # Errors
    ///
    /// [`GatewayError::State`] when the device has no WebRTC stream.
    pub async fn change_stream_quality(
        &self,
        device_id: &str,
        quality: StreamQuality,
    ) -> Result<StreamQuality, GatewayError> {
        let key = StreamKey::new(device_id, StreamType::Webrtc);
        let old = {
            let streams = self.streams.lock().await;
            let active = streams
                .get(&key)
                .ok_or_else(|| GatewayError::State(format!("no webrtc stream for {device_id}")))?;
            let mut old = quality;
            active.config.send_modify(|c| {
                old = c.quality;
                c.quality = quality;
            });
            old
        };

        info!("stream {key}: quality {old} -> {quality}");
        let event = GatewayEvent::QualityChanged {
            device_id: device_id.to_string(),
            old_quality: old,
            new_quality: quality,
            timestamp: Utc::now(),
        };
        self.video.broadcast(device_id, &event).await;
        Ok(old)
    }

    /// Descriptors of every registered stream, sorted by stream id.
    pub async fn get_active_streams(&self) -> Vec<StreamDescriptor> {
        let configs: Vec<(StreamConfig, StreamState)> = {
            let streams = self.streams.lock().await;
            streams
                .values()
                .map(|a| (a.config.borrow().clone(), a.state))
                .collect()
        };

        let mut out = Vec::with_capacity(configs.len());
        for (config, state) in configs {
            let viewers = self.video.subscriber_count(&config.device_id).await;
            out.push(StreamDescriptor::from_config(&config, state, viewers));
        }
        out.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        out
    }

    /// Current state of one key; `None` means absent.
    pub async fn stream_state(&self, key: &StreamKey) -> Option<StreamState> {
        self.streams.lock().await.get(key).map(|a| a.state)
    }

    /// Number of stream tasks that have not finished.
    pub async fn running_tasks(&self) -> usize {
        self.streams
            .lock()
            .await
            .values()
            .filter(|a| a.task.as_ref().is_some_and(|t| !t.is_finished()))
            .count()
    }

    /// Joins a socket to the device's video topic.
    pub async fn add_viewer(&self, device_id: &str, viewer: Arc<dyn Subscriber>) -> usize {
        self.video.add_subscriber(device_id, viewer).await
    }

    pub async fn remove_viewer(&self, device_id: &str, viewer_id: Uuid) -> bool {
        self.video.remove_subscriber(device_id, viewer_id).await
    }

    /// Stops every stream and closes every viewer.  Idempotent.
    pub async fn cleanup(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut streams = self.streams.lock().await;
            streams
                .values_mut()
                .filter_map(|a| {
                    a.state = StreamState::Stopping;
                    a.task.take()
                })
                .collect()
        };
        for task in &tasks {
            task.abort();
        }
        let count = tasks.len();
        join_all(tasks).await;

        self.streams.lock().await.clear();
        let closed = self.video.close_all().await;
        if count > 0 || closed > 0 {
            info!("stopped {count} stream(s), closed {closed} viewer(s)");
        }
    }
}

// ── Stream loops ──────────────────────────────────────────────────────────────

async fn run_loop(ctx: LoopContext) {
    debug!("stream {} loop running", ctx.key);
    match ctx.key.stream_type {
        StreamType::Mjpeg => mjpeg_loop(ctx).await,
        StreamType::Webrtc => heartbeat_loop(ctx, webrtc_status).await,
        StreamType::H264 => heartbeat_loop(ctx, h264_status).await,
    }
}

async fn mjpeg_loop(ctx: LoopContext) {
    let device_id = ctx.key.device_id.as_str();
    let stream_id = ctx.key.stream_id();
    let mut ticker = interval(ctx.config.borrow().frame_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let result = ctx.sessions.get_video_snapshot(device_id).await;
        let event = match (result.data, result.error) {
            (Some(snapshot), _) => GatewayEvent::MjpegFrame {
                device_id: device_id.to_string(),
                stream_id: stream_id.clone(),
                image_data: snapshot.image_data,
                content_type: snapshot.content_type,
                timestamp: Utc::now(),
            },
            (None, error) => {
                let message = error.map_or_else(|| "snapshot failed".to_string(), |e| e.message);
                warn!("stream {stream_id}: {message}");
                GatewayEvent::StreamError {
                    device_id: device_id.to_string(),
                    stream_id: stream_id.clone(),
                    error: message,
                    timestamp: Utc::now(),
                }
            }
        };
        ctx.video.broadcast(device_id, &event).await;
    }
}

async fn heartbeat_loop(ctx: LoopContext, status: fn(&StreamKey, &StreamConfig) -> GatewayEvent) {
    let period = match ctx.key.stream_type {
        StreamType::H264 => ctx.timings.h264_heartbeat,
        _ => ctx.timings.webrtc_heartbeat,
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let event = status(&ctx.key, &ctx.config.borrow());
        ctx.video.broadcast(&ctx.key.device_id, &event).await;
    }
}

fn webrtc_status(key: &StreamKey, config: &StreamConfig) -> GatewayEvent {
    GatewayEvent::WebrtcStatus {
        device_id: key.device_id.clone(),
        stream_id: key.stream_id(),
        status: "active".to_string(),
        quality: config.quality,
        timestamp: Utc::now(),
    }
}

fn h264_status(key: &StreamKey, config: &StreamConfig) -> GatewayEvent {
    GatewayEvent::H264Status {
        device_id: key.device_id.clone(),
        stream_id: key.stream_id(),
        status: "active".to_string(),
        bitrate: config.bitrate,
        resolution: config.resolution(),
        fps: config.fps,
        timestamp: Utc::now(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
