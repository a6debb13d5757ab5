#![doc = include_str!("../README.md")]

pub mod backend;
pub mod config;
pub mod error;
pub mod metadata;

pub use backend::{
    BufferProbe, BusMessage, EventReceiver, EventSender, PadAddedHandler, PadRef, PipelineEvent,
    ProbeReturn, PropertyValue, StageBackend, StageKind, event_channel,
};
pub use config::{MuxConfig, PipelineConfig, TrackerConfig, TrackerKey};
pub use error::{Result, VigilError};
pub use metadata::{BatchBuffer, BatchFrames, FrameMeta, ObjectMeta};
