//! Stage backend trait: the contract between graph orchestration and the
//! media framework that actually runs the stages.
//!
//! The orchestration layer never decodes, infers or renders anything itself.
//! It asks a [`StageBackend`] to:
//!
//! 1. create named stages of a given [`StageKind`],
//! 2. set configuration properties on them,
//! 3. link output pads to input pads (static or request pads),
//! 4. notify it when a stage exposes a new pad at runtime,
//! 5. let it observe buffers crossing a pad,
//! 6. start and stop the whole graph, delivering lifecycle messages into
//!    a single [`PipelineEvent`] channel.
//!
//! Stages are addressed by their graph-unique name.  Implementations must be
//! `Send + Sync`: pad-added handlers and buffer probes are invoked from the
//! backend's own streaming threads.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Result, VigilError};
use crate::metadata::BatchBuffer;

// ─── Stage catalogue ────────────────────────────────────────────────────────

/// Every kind of stage the pipeline instantiates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    FileSource,
    ContainerDemux,
    StreamParser,
    Decoder,
    Queue,
    Converter,
    Overlay,
    Sink,
    StreamMux,
    Inference,
    Tracker,
    StreamDemux,
}

impl StageKind {
    /// Element factory name in the GStreamer/DeepStream plugin registry.
    pub fn factory_name(self) -> &'static str {
        match self {
            Self::FileSource => "filesrc",
            Self::ContainerDemux => "qtdemux",
            Self::StreamParser => "h264parse",
            Self::Decoder => "nvv4l2decoder",
            Self::Queue => "queue",
            Self::Converter => "nvvideoconvert",
            Self::Overlay => "nvdsosd",
            Self::Sink => "fakesink",
            Self::StreamMux => "nvstreammux",
            Self::Inference => "nvinfer",
            Self::Tracker => "nvtracker",
            Self::StreamDemux => "nvstreamdemux",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.factory_name())
    }
}

// ─── Properties and pads ────────────────────────────────────────────────────

/// A configuration value handed to [`StageBackend::set_property`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        Self::UInt(u64::from(v))
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// A named pad on a named stage.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PadRef {
    pub stage: String,
    pub pad: String,
}

impl PadRef {
    pub fn new(stage: impl Into<String>, pad: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            pad: pad.into(),
        }
    }

    /// The always-present output pad of a stage.
    pub fn src(stage: impl Into<String>) -> Self {
        Self::new(stage, "src")
    }

    /// The always-present input pad of a stage.
    pub fn sink(stage: impl Into<String>) -> Self {
        Self::new(stage, "sink")
    }
}

impl fmt::Display for PadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.pad)
    }
}

// ─── Lifecycle messages ─────────────────────────────────────────────────────

/// Lifecycle notification posted by a running graph.
#[derive(Clone, Debug, PartialEq)]
pub enum BusMessage {
    EndOfStream,
    Warning {
        stage: String,
        message: String,
        debug: Option<String>,
    },
    Error {
        stage: String,
        message: String,
        debug: Option<String>,
    },
}

/// Everything the event loop can be woken by.
///
/// Dynamic-link failures happen inside backend callbacks, so they travel
/// through the same channel as bus messages instead of unwinding the
/// streaming thread.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    Bus(BusMessage),
    DynamicLinkFailed {
        demuxer: String,
        pad: String,
        target: PadRef,
    },
}

impl PipelineEvent {
    /// Map a terminal event to the error it represents, if any.
    pub fn into_error(self) -> Option<VigilError> {
        match self {
            Self::Bus(BusMessage::Error {
                stage,
                message,
                debug,
            }) => Some(VigilError::Runtime {
                stage,
                message,
                debug,
            }),
            Self::DynamicLinkFailed {
                demuxer,
                pad,
                target,
            } => Some(VigilError::DynamicLink {
                demuxer,
                pad,
                target: target.to_string(),
            }),
            Self::Bus(_) => None,
        }
    }
}

/// Sending half of the event channel; usable from any thread.
pub type EventSender = mpsc::UnboundedSender<PipelineEvent>;
/// Receiving half of the event channel, owned by the event loop.
pub type EventReceiver = mpsc::UnboundedReceiver<PipelineEvent>;

/// Create the single notification channel of a run.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

// ─── Callbacks ──────────────────────────────────────────────────────────────

/// What a buffer probe wants done with the buffer it observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeReturn {
    /// Let the buffer continue downstream untouched.
    Pass,
}

/// Invoked with the name of every pad a stage exposes at runtime.
pub type PadAddedHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked once per buffer crossing the probed pad.
pub type BufferProbe = Arc<dyn Fn(&dyn BatchBuffer) -> ProbeReturn + Send + Sync>;

// ─── Backend trait ──────────────────────────────────────────────────────────

/// The media framework the pipeline is composed on.
///
/// See module-level documentation for the full contract.
pub trait StageBackend: Send + Sync + 'static {
    /// Instantiate a stage and add it to the graph under `name`.
    fn create_stage(&self, kind: StageKind, name: &str) -> Result<()>;

    /// Set a configuration property on an existing stage.
    fn set_property(&self, stage: &str, key: &str, value: &PropertyValue) -> Result<()>;

    /// Request a pad from a stage's request-pad template (e.g. `sink_0`).
    fn request_pad(&self, stage: &str, name: &str) -> Result<PadRef>;

    /// Link an output pad to an input pad.
    fn link(&self, from: &PadRef, to: &PadRef) -> Result<()>;

    /// Register a handler for pads the stage exposes once it negotiates.
    fn on_pad_added(&self, stage: &str, handler: PadAddedHandler) -> Result<()>;

    /// Attach a read-only observer to a pad.
    fn add_buffer_probe(&self, pad: &PadRef, probe: BufferProbe) -> Result<()>;

    /// Start processing; lifecycle messages are delivered into `events`.
    fn start(&self, events: EventSender) -> Result<()>;

    /// Drive the graph back to its idle state.
    ///
    /// Must succeed on a graph that was never started or is already stopped.
    fn stop(&self) -> Result<()>;

    /// Write the backend's own view of the live topology, if it has one.
    fn dump_topology(&self, _file_stem: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_refs_render_as_stage_dot_pad() {
        assert_eq!(PadRef::src("decoder-0").to_string(), "decoder-0.src");
        assert_eq!(
            PadRef::new("nvstreammux", "sink_3").to_string(),
            "nvstreammux.sink_3"
        );
    }

    #[test]
    fn property_values_render_plainly() {
        assert_eq!(PropertyValue::from(true).to_string(), "true");
        assert_eq!(PropertyValue::from(4_000_000u32).to_string(), "4000000");
        assert_eq!(PropertyValue::from("/tmp/a.mp4").to_string(), "/tmp/a.mp4");
    }

    #[test]
    fn only_terminal_events_map_to_errors() {
        let warning = PipelineEvent::Bus(BusMessage::Warning {
            stage: "sink-0".into(),
            message: "late buffer".into(),
            debug: None,
        });
        assert!(warning.into_error().is_none());
        assert!(PipelineEvent::Bus(BusMessage::EndOfStream)
            .into_error()
            .is_none());

        let failed = PipelineEvent::DynamicLinkFailed {
            demuxer: "qtdemux-0".into(),
            pad: "video_0".into(),
            target: PadRef::sink("h264-parser-0"),
        };
        match failed.into_error() {
            Some(VigilError::DynamicLink { target, .. }) => {
                assert_eq!(target, "h264-parser-0.sink")
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
