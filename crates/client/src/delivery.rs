//! Background HTTP delivery queue
//!
//! A worker task owns a strict FIFO of requests and sends exactly one at a
//! time. Failed attempts are retried after a fixed wait until the request's
//! retry budget is spent; HTTP 400 is never retried. The worker reports every
//! outcome over a channel and a router task settles the caller's ticket, so
//! the worker never shares state with the session.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::http::{send_expecting_ok, HttpError, HttpMethod, HttpRequest, HttpSend};

/// A request plus its retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub request: HttpRequest,
    pub retries: u32,
    pub retry_wait: Duration,
}

impl DeliveryRequest {
    pub fn new(request: HttpRequest, config: &HttpConfig) -> Self {
        Self {
            request,
            retries: config.retries,
            retry_wait: config.retry_wait,
        }
    }
}

/// Terminal failure of a queued request
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{method} {url} failed: {error}")]
pub struct DeliveryError {
    pub request_id: u64,
    pub url: String,
    pub method: HttpMethod,
    pub error: String,
    pub status: Option<u16>,
    pub status_text: Option<String>,
}

/// Message posted by the worker for every settled request
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryReport {
    Delivered { request_id: u64, status: u16 },
    Failed(DeliveryError),
}

impl DeliveryReport {
    pub fn request_id(&self) -> u64 {
        match self {
            DeliveryReport::Delivered { request_id, .. } => *request_id,
            DeliveryReport::Failed(err) => err.request_id,
        }
    }
}

struct QueuedRequest {
    id: u64,
    request: DeliveryRequest,
}

type Completion = oneshot::Sender<Result<u16, DeliveryError>>;

/// Handle to the delivery worker (cheap to Clone).
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    completions: Arc<Mutex<HashMap<u64, Completion>>>,
    outstanding: Arc<watch::Sender<usize>>,
    next_id: Arc<AtomicU64>,
}

impl DeliveryQueue {
    /// Spawn the worker and its report router.
    pub fn spawn(sender: Arc<dyn HttpSend>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let completions: Arc<Mutex<HashMap<u64, Completion>>> = Arc::default();
        let (outstanding, _) = watch::channel(0usize);
        let outstanding = Arc::new(outstanding);

        tokio::spawn(worker_loop(sender, rx, report_tx));
        tokio::spawn(route_reports(
            report_rx,
            completions.clone(),
            outstanding.clone(),
        ));

        Self {
            tx,
            completions,
            outstanding,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append a request to the queue. The returned ticket resolves once the
    /// request succeeded or exhausted its retries; dropping it does not
    /// cancel delivery.
    pub fn enqueue(&self, request: DeliveryRequest) -> DeliveryTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        let url = request.request.url.clone();
        let method = request.request.method;

        self.completions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, done_tx);
        self.outstanding.send_modify(|n| *n += 1);

        if self.tx.send(QueuedRequest { id, request }).is_err() {
            warn!(
                component = "delivery",
                event = "delivery.enqueue.worker_gone",
                request_id = id,
                "Delivery worker stopped, request dropped"
            );
            self.completions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&id);
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        }

        DeliveryTicket {
            request_id: id,
            url,
            method,
            rx: done_rx,
        }
    }

    /// Number of requests enqueued but not yet settled
    pub fn pending(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Resolves once every request enqueued so far has settled.
    pub async fn idle(&self) {
        let mut rx = self.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Completion future of one queued request
pub struct DeliveryTicket {
    request_id: u64,
    url: String,
    method: HttpMethod,
    rx: oneshot::Receiver<Result<u16, DeliveryError>>,
}

impl DeliveryTicket {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl Future for DeliveryTicket {
    type Output = Result<u16, DeliveryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DeliveryError {
                request_id: self.request_id,
                url: self.url.clone(),
                method: self.method,
                error: "delivery queue stopped".to_string(),
                status: None,
                status_text: None,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

async fn worker_loop(
    sender: Arc<dyn HttpSend>,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    reports: mpsc::UnboundedSender<DeliveryReport>,
) {
    while let Some(queued) = rx.recv().await {
        let report = deliver(sender.as_ref(), queued).await;
        if reports.send(report).is_err() {
            break;
        }
    }
}

async fn deliver(sender: &dyn HttpSend, queued: QueuedRequest) -> DeliveryReport {
    let QueuedRequest { id, request } = queued;
    let mut remaining = request.retries;

    loop {
        let attempt = tokio::time::timeout(
            request.request.timeout,
            send_expecting_ok(sender, request.request.clone()),
        )
        .await
        .unwrap_or(Err(HttpError::Timeout));

        let err = match attempt {
            Ok(response) => {
                debug!(
                    component = "delivery",
                    event = "delivery.request.delivered",
                    request_id = id,
                    method = %request.request.method,
                    url = %request.request.url,
                    "Request delivered"
                );
                return DeliveryReport::Delivered {
                    request_id: id,
                    status: response.status,
                };
            }
            Err(err) => err,
        };

        let bad_request = err.status() == Some(400);
        if remaining == 0 || bad_request {
            warn!(
                component = "delivery",
                event = "delivery.request.failed",
                request_id = id,
                method = %request.request.method,
                url = %request.request.url,
                error = %err,
                "Request failed, giving up"
            );
            let status_text = match &err {
                HttpError::Status { status_text, .. } => Some(status_text.clone()),
                _ => None,
            };
            return DeliveryReport::Failed(DeliveryError {
                request_id: id,
                url: request.request.url.clone(),
                method: request.request.method,
                error: err.to_string(),
                status: err.status(),
                status_text,
            });
        }

        remaining -= 1;
        debug!(
            component = "delivery",
            event = "delivery.request.retry",
            request_id = id,
            remaining,
            error = %err,
            "Retrying request"
        );
        tokio::time::sleep(request.retry_wait).await;
    }
}

async fn route_reports(
    mut reports: mpsc::UnboundedReceiver<DeliveryReport>,
    completions: Arc<Mutex<HashMap<u64, Completion>>>,
    outstanding: Arc<watch::Sender<usize>>,
) {
    while let Some(report) = reports.recv().await {
        let request_id = report.request_id();
        let completion = completions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&request_id);
        if let Some(completion) = completion {
            let result = match report {
                DeliveryReport::Delivered { status, .. } => Ok(status),
                DeliveryReport::Failed(err) => Err(err),
            };
            let _ = completion.send(result);
        }
        outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
}
