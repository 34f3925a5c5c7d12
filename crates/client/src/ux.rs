//! UX signalling seam
//!
//! The session engine never renders anything itself. Whatever hosts the run
//! (a page, a headless runner, a test) decides how overlays, the leave-page
//! warning, the invalid-run notice and navigation look.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

pub trait Ux: Send + Sync + 'static {
    /// Show the "please wait" overlay while data is still being sent
    fn show_overlay(&self, text: &str);
    fn hide_overlay(&self);
    fn set_before_unload_warning(&self, enabled: bool);
    /// The server no longer knows this run
    fn show_invalid_run(&self);
    /// Leave the component page for `url`
    fn navigate(&self, url: &str);
}

/// Headless host: every signal becomes a log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogUx;

impl Ux for LogUx {
    fn show_overlay(&self, text: &str) {
        info!(component = "ux", event = "ux.overlay.shown", text, "Overlay shown");
    }

    fn hide_overlay(&self) {
        info!(component = "ux", event = "ux.overlay.hidden", "Overlay hidden");
    }

    fn set_before_unload_warning(&self, enabled: bool) {
        info!(
            component = "ux",
            event = "ux.before_unload",
            enabled,
            "Leave-page warning toggled"
        );
    }

    fn show_invalid_run(&self) {
        warn!(
            component = "ux",
            event = "ux.invalid_run",
            "This study run is invalid"
        );
    }

    fn navigate(&self, url: &str) {
        info!(component = "ux", event = "ux.navigate", url, "Navigating");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UxSignal {
    OverlayShown(String),
    OverlayHidden,
    BeforeUnloadWarning(bool),
    InvalidRun,
    Navigated(String),
}

/// Keeps every signal in order, for hosts that poll and for tests
#[derive(Debug, Clone, Default)]
pub struct RecordingUx {
    signals: Arc<Mutex<Vec<UxSignal>>>,
}

impl RecordingUx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<UxSignal> {
        self.signals
            .lock()
            .map(|signals| signals.clone())
            .unwrap_or_default()
    }

    pub fn navigated_to(&self) -> Option<String> {
        self.signals().into_iter().rev().find_map(|s| match s {
            UxSignal::Navigated(url) => Some(url),
            _ => None,
        })
    }

    fn record(&self, signal: UxSignal) {
        if let Ok(mut signals) = self.signals.lock() {
            signals.push(signal);
        }
    }
}

impl Ux for RecordingUx {
    fn show_overlay(&self, text: &str) {
        self.record(UxSignal::OverlayShown(text.to_string()));
    }

    fn hide_overlay(&self) {
        self.record(UxSignal::OverlayHidden);
    }

    fn set_before_unload_warning(&self, enabled: bool) {
        self.record(UxSignal::BeforeUnloadWarning(enabled));
    }

    fn show_invalid_run(&self) {
        self.record(UxSignal::InvalidRun);
    }

    fn navigate(&self, url: &str) {
        self.record(UxSignal::Navigated(url.to_string()));
    }
}
