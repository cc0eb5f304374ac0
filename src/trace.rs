//! State-transition tracing.
//!
//! A bounded ring buffer of recent lifecycle transitions. When a handler
//! trips an invariant breach the manager dumps the recent entries as JSON
//! lines, which is usually enough to reconstruct how the registry and a tree
//! drifted apart.

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Maximum number of entries kept in the ring
const DEFAULT_MAX_ENTRIES: usize = 256;

/// Lifecycle transitions worth remembering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    /// A client was wrapped in a fresh frame
    WindowFramed { window: u32, frame: u32 },
    /// A client joined an existing frame's tree
    WindowAdded { window: u32, frame: u32 },
    /// A client left management; its frame may have been destroyed with it
    WindowUnframed {
        window: u32,
        frame: u32,
        frame_destroyed: bool,
    },
    /// A drag gesture began on a managed window
    DragStarted { window: u32, frame: u32 },
    /// The pointer button was released, ending any gesture
    DragEnded,
    /// Input focus moved between managed clients
    FocusChanged { from: Option<u32>, to: Option<u32> },
}

/// One recorded entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub kind: String,
    pub window: Option<u32>,
    pub details: String,
}

pub struct EventTracer {
    entries: VecDeque<TraceEntry>,
    max_entries: usize,
    sequence: u64,
    start_time: Instant,
}

impl EventTracer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries),
            max_entries,
            sequence: 0,
            start_time: Instant::now(),
        }
    }

    /// Record a raw protocol event
    pub fn trace_event(&mut self, kind: &str, window: Option<u32>, details: &str) {
        self.push(kind.to_string(), window, details.to_string());
    }

    /// Record a state transition
    pub fn trace_transition(&mut self, transition: &Transition) {
        let (kind, window) = match transition {
            Transition::WindowFramed { window, .. } => ("window_framed", Some(*window)),
            Transition::WindowAdded { window, .. } => ("window_added", Some(*window)),
            Transition::WindowUnframed { window, .. } => ("window_unframed", Some(*window)),
            Transition::DragStarted { window, .. } => ("drag_started", Some(*window)),
            Transition::DragEnded => ("drag_ended", None),
            Transition::FocusChanged { to, .. } => ("focus_changed", *to),
        };
        let details = serde_json::to_string(transition).unwrap_or_default();
        self.push(kind.to_string(), window, details);
    }

    fn push(&mut self, kind: String, window: Option<u32>, details: String) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.sequence += 1;
        self.entries.push_back(TraceEntry {
            sequence: self.sequence,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
            window,
            details,
        });
    }

    /// Last `n` entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<TraceEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Dump the last `n` entries to the error log as JSON lines
    pub fn dump_recent(&self, n: usize) {
        for entry in self.recent(n) {
            match serde_json::to_string(&entry) {
                Ok(line) => log::error!("  trace: {line}"),
                Err(e) => log::error!("  trace: <unserializable entry: {e}>"),
            }
        }
    }
}

impl Default for EventTracer {
    fn default() -> Self {
        Self::new()
    }
}
