//! Lifecycle driver of a built graph.
//!
//! ```text
//! Built ──play()──► Playing ──EOS──────────────► Stopped(Normal)
//!                      │ ──error / link failure─► Stopped(Error)
//!                      │ ──cancellation─────────► Stopped(Interrupted)
//!                      └─ warning: log, stay Playing
//! ```
//!
//! The loop blocks only on the next event or on cancellation; it never
//! polls.  [`EventLoop::teardown`] drives the backend back to idle exactly
//! once no matter how the loop ended, and also runs from `Drop`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vigil_core::backend::{BusMessage, EventReceiver, EventSender, PipelineEvent, StageBackend};
use vigil_core::error::{Result, VigilError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopKind {
    Normal,
    Error,
    Interrupted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Built,
    Playing,
    Stopped(StopKind),
}

/// Why a run ended.
#[derive(Debug)]
pub enum StopReason {
    EndOfStream,
    Error(VigilError),
    Interrupted,
}

impl StopReason {
    pub fn kind(&self) -> StopKind {
        match self {
            Self::EndOfStream => StopKind::Normal,
            Self::Error(_) => StopKind::Error,
            Self::Interrupted => StopKind::Interrupted,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::EndOfStream => "end_of_stream",
            Self::Error(_) => "error",
            Self::Interrupted => "interrupted",
        }
    }
}

pub struct EventLoop {
    backend: Arc<dyn StageBackend>,
    sender: Option<EventSender>,
    events: EventReceiver,
    state: LifecycleState,
    torn_down: bool,
}

impl EventLoop {
    pub fn new(backend: Arc<dyn StageBackend>, sender: EventSender, events: EventReceiver) -> Self {
        Self {
            backend,
            sender: Some(sender),
            events,
            state: LifecycleState::Built,
            torn_down: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn backend(&self) -> &Arc<dyn StageBackend> {
        &self.backend
    }

    /// `Built → Playing`.
    ///
    /// A backend that refuses to start has usually already posted the cause
    /// (an unreadable source, a missing plugin) as a bus error.  That error
    /// is returned in place of the backend's own start failure.
    pub fn play(&mut self) -> Result<()> {
        let Some(sender) = self.sender.take() else {
            return Err(VigilError::Backend(format!(
                "cannot start pipeline in state {:?}",
                self.state
            )));
        };
        info!("Starting pipeline");
        if let Err(e) = self.backend.start(sender) {
            self.state = LifecycleState::Stopped(StopKind::Error);
            return Err(match self.pending_error() {
                Some(cause) => {
                    warn!(%e, "Pipeline failed to start");
                    cause
                }
                None => e,
            });
        }
        self.state = LifecycleState::Playing;
        Ok(())
    }

    /// First fatal event already queued, without waiting for more.
    fn pending_error(&mut self) -> Option<VigilError> {
        while let Ok(event) = self.events.try_recv() {
            match event {
                PipelineEvent::Bus(BusMessage::Warning {
                    stage,
                    message,
                    debug: detail,
                }) => log_warning(&stage, &message, detail.as_deref()),
                event => {
                    if let Some(err) = event.into_error() {
                        log_fatal(&err);
                        return Some(err);
                    }
                }
            }
        }
        None
    }

    /// Block until the run reaches a terminal state.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> StopReason {
        if self.state != LifecycleState::Playing {
            return StopReason::Error(VigilError::Backend(format!(
                "event loop waited in state {:?}",
                self.state
            )));
        }

        let reason = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Interrupted, stopping pipeline");
                    break StopReason::Interrupted;
                }
                event = self.events.recv() => event,
            };

            match event {
                None => {
                    error!("Event channel closed while playing");
                    break StopReason::Error(VigilError::ChannelClosed);
                }
                Some(PipelineEvent::Bus(BusMessage::EndOfStream)) => {
                    info!("End-of-stream");
                    break StopReason::EndOfStream;
                }
                Some(PipelineEvent::Bus(BusMessage::Warning {
                    stage,
                    message,
                    debug: detail,
                })) => log_warning(&stage, &message, detail.as_deref()),
                Some(terminal) => {
                    let Some(err) = terminal.into_error() else {
                        continue;
                    };
                    log_fatal(&err);
                    break StopReason::Error(err);
                }
            }
        };

        self.state = LifecycleState::Stopped(reason.kind());
        reason
    }

    /// Drive the graph back to idle.  Safe to call any number of times.
    pub fn teardown(&mut self) {
        if self.torn_down {
            debug!("Teardown already complete");
            return;
        }
        self.torn_down = true;
        if self.state == LifecycleState::Playing {
            self.state = LifecycleState::Stopped(StopKind::Interrupted);
        }
        info!("Stopping pipeline");
        if let Err(e) = self.backend.stop() {
            warn!(%e, "Backend reported an error while stopping");
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn log_warning(stage: &str, message: &str, detail: Option<&str>) {
    warn!(stage, debug = ?detail, "Warning: {message}");
}

fn log_fatal(err: &VigilError) {
    match err {
        VigilError::Runtime {
            stage,
            debug: detail,
            ..
        } => error!(stage = %stage, debug = ?detail, "{err}"),
        _ => error!("{err}"),
    }
}
