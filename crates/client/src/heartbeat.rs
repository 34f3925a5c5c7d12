//! Run heartbeat emitter
//!
//! An isolated task that POSTs to the run's liveness endpoint every period.
//! Beats are fire-and-forget: a dropped beat is never retried.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::http::{send_expecting_ok, HttpMethod, HttpRequest, HttpSend};

/// Start message of the emitter: `[runId, periodMs?]` plus the endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatStart {
    pub run_id: String,
    pub url: String,
    pub period: Option<Duration>,
}

/// Handle to a running heartbeat task. Dropping it stops the beats.
pub struct HeartbeatEmitter {
    task: JoinHandle<()>,
}

impl HeartbeatEmitter {
    pub fn spawn(sender: Arc<dyn HttpSend>, start: HeartbeatStart, default_period: Duration) -> Self {
        let period = start.period.unwrap_or(default_period);
        info!(
            component = "heartbeat",
            event = "heartbeat.started",
            run_id = %start.run_id,
            period_ms = period.as_millis() as u64,
            "Run heartbeat started"
        );
        let task = tokio::spawn(beat_loop(sender, start, period));
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn beat_loop(sender: Arc<dyn HttpSend>, start: HeartbeatStart, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let request = HttpRequest::new(HttpMethod::Post, start.url.clone(), period);
        let sender = sender.clone();
        let run_id = start.run_id.clone();
        tokio::spawn(async move {
            if let Err(err) = send_expecting_ok(sender.as_ref(), request).await {
                debug!(
                    component = "heartbeat",
                    event = "heartbeat.beat.dropped",
                    run_id = %run_id,
                    error = %err,
                    "Heartbeat dropped"
                );
            }
        });
    }
}
