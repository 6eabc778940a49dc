//! Recording controller.
//!
//! A two-state machine (`Idle`/`Recording`) that appends request logs to a
//! bounded in-memory queue while active, and broadcasts the accumulated
//! queue to offline reporters when recording stops. The interactive stdin
//! toggles (`r`/`s`) live in `devproxy-cli`, which owns the terminal; this
//! plugin only exposes the state transitions they drive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devproxy_core::{HookContext, Plugin, PluginError, Request, Response};
use parking_lot::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct RequestLog {
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub timestamp: DateTime<Utc>,
}

pub struct RecordingController {
    name: String,
    recording: AtomicBool,
    queue: Mutex<VecDeque<RequestLog>>,
    capacity: usize,
    stopped_tx: broadcast::Sender<Vec<RequestLog>>,
}

impl RecordingController {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (stopped_tx, _) = broadcast::channel(4);
        Self {
            name: name.into(),
            recording: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            stopped_tx,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn start_recording(&self) {
        self.recording.store(true, Ordering::SeqCst);
        tracing::info!("recording started");
    }

    /// Stops recording and broadcasts whatever accumulated to any reporter
    /// listening. Returns the flushed entries to the caller too, so a CLI
    /// that prints a summary doesn't need its own subscription.
    pub fn stop_recording(&self) -> Vec<RequestLog> {
        self.recording.store(false, Ordering::SeqCst);
        let entries: Vec<_> = self.queue.lock().drain(..).collect();
        let _ = self.stopped_tx.send(entries.clone());
        tracing::info!(count = entries.len(), "recording stopped");
        entries
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<RequestLog>> {
        self.stopped_tx.subscribe()
    }

    fn push(&self, entry: RequestLog) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(entry);
    }
}

#[async_trait]
impl Plugin for RecordingController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_response_log(
        &self,
        request: &Request,
        response: &Response,
        ctx: &HookContext<'_>,
    ) -> Result<(), PluginError> {
        if !self.is_recording() {
            return Ok(());
        }
        self.push(RequestLog {
            request_id: ctx.request_id.to_string(),
            method: request.method.to_string(),
            url: request.url(),
            status: response.status.as_u16(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}
