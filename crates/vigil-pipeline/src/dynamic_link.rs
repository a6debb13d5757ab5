//! Deferred links from container demuxers to their parsers.
//!
//! A container demuxer only exposes its elementary-stream pads once it has
//! read the container header, so the link to the parser cannot be made at
//! build time.  Each per-source demuxer gets one [`DynamicLinkRequest`]:
//!
//! ```text
//! AwaitingPort ──(matching pad, link ok)──────► Linked   (terminal)
//!      │
//!      └──────(matching pad, link refused)────► Failed   (terminal, fatal)
//! ```
//!
//! Non-matching pads (audio, subtitles, metadata tracks) are ignored and may
//! arrive any number of times.  A matching pad after a terminal state is
//! ignored too, so at most one transition ever happens.
//!
//! A failed link is reported as [`PipelineEvent::DynamicLinkFailed`] on the
//! run's event channel; the event loop turns it into `Stopped(Error)`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use vigil_core::backend::{EventSender, PadAddedHandler, PadRef, PipelineEvent, StageBackend};

/// Name of the demuxer pad carrying the primary video track.
pub const PRIMARY_VIDEO_PAD: &str = "video_0";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    AwaitingPort,
    Linked,
    Failed,
}

/// Which newly exposed pad a request reacts to: an exact pad name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PadMatch {
    name: String,
}

impl PadMatch {
    pub fn exact(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn matches(&self, pad: &str) -> bool {
        pad == self.name
    }
}

/// Counts linked demuxers so readiness can be reported exactly once.
#[derive(Debug)]
struct Readiness {
    expected: usize,
    linked: AtomicUsize,
}

impl Readiness {
    fn mark_linked(&self) {
        let linked = self.linked.fetch_add(1, Ordering::AcqRel) + 1;
        if linked == self.expected {
            info!(sources = self.expected, "All sources linked, graph ready");
        }
    }
}

/// One-shot registration against a demuxer's pad-added notifications.
pub struct DynamicLinkRequest {
    demuxer: String,
    target: PadRef,
    predicate: PadMatch,
    state: Mutex<LinkState>,
    backend: Weak<dyn StageBackend>,
    events: EventSender,
    readiness: Arc<Readiness>,
}

impl DynamicLinkRequest {
    pub fn demuxer(&self) -> &str {
        &self.demuxer
    }

    pub fn target(&self) -> &PadRef {
        &self.target
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// React to a pad the demuxer just exposed.
    pub fn on_pad_added(&self, pad: &str) {
        if !self.predicate.matches(pad) {
            debug!(demuxer = %self.demuxer, pad, "Ignoring non-primary demux pad");
            return;
        }

        let mut state = self.state.lock();
        if *state != LinkState::AwaitingPort {
            debug!(demuxer = %self.demuxer, pad, state = ?*state, "Demux pad already resolved");
            return;
        }

        let from = PadRef::new(self.demuxer.as_str(), pad);
        let result = match self.backend.upgrade() {
            Some(backend) => backend.link(&from, &self.target),
            None => Err(vigil_core::VigilError::Backend(
                "backend dropped before pad negotiation".into(),
            )),
        };

        match result {
            Ok(()) => {
                *state = LinkState::Linked;
                info!(from = %from, to = %self.target, "Linked new demux pad");
                self.readiness.mark_linked();
            }
            Err(e) => {
                *state = LinkState::Failed;
                error!(from = %from, to = %self.target, %e, "Create new demux pad error");
                let _ = self.events.send(PipelineEvent::DynamicLinkFailed {
                    demuxer: self.demuxer.clone(),
                    pad: pad.to_string(),
                    target: self.target.clone(),
                });
            }
        }
    }

    /// Wrap this request as a backend pad-added handler.
    pub fn handler(self: &Arc<Self>) -> PadAddedHandler {
        let this = Arc::clone(self);
        Arc::new(move |pad: &str| this.on_pad_added(pad))
    }
}

/// All dynamic-link requests of one graph.
pub struct LinkTracker {
    requests: Vec<Arc<DynamicLinkRequest>>,
    readiness: Arc<Readiness>,
    backend: Weak<dyn StageBackend>,
    events: EventSender,
}

impl LinkTracker {
    pub fn new(expected: usize, backend: &Arc<dyn StageBackend>, events: EventSender) -> Self {
        Self {
            requests: Vec::with_capacity(expected),
            readiness: Arc::new(Readiness {
                expected,
                linked: AtomicUsize::new(0),
            }),
            backend: Arc::downgrade(backend),
            events,
        }
    }

    /// Create and remember a request linking `demuxer`'s matching pad to `target`.
    pub fn request(
        &mut self,
        demuxer: &str,
        predicate: PadMatch,
        target: PadRef,
    ) -> Arc<DynamicLinkRequest> {
        let request = Arc::new(DynamicLinkRequest {
            demuxer: demuxer.to_string(),
            target,
            predicate,
            state: Mutex::new(LinkState::AwaitingPort),
            backend: self.backend.clone(),
            events: self.events.clone(),
            readiness: Arc::clone(&self.readiness),
        });
        self.requests.push(Arc::clone(&request));
        request
    }

    pub fn state_of(&self, demuxer: &str) -> Option<LinkState> {
        self.requests
            .iter()
            .find(|r| r.demuxer == demuxer)
            .map(|r| r.state())
    }

    /// True once every registered demuxer reached `Linked`.
    pub fn is_ready(&self) -> bool {
        !self.requests.is_empty()
            && self
                .requests
                .iter()
                .all(|r| r.state() == LinkState::Linked)
    }
}
