#![doc = include_str!("../README.md")]

pub mod collector;
pub mod dynamic_link;
pub mod event_loop;
pub mod graph;
pub mod pipeline;
pub mod sim;

pub use collector::{CountTable, MetadataCollector};
pub use dynamic_link::{DynamicLinkRequest, LinkState, LinkTracker, PadMatch};
pub use event_loop::{EventLoop, LifecycleState, StopKind, StopReason};
pub use graph::{ChainNames, Graph, GraphBuilder, LinkMode};
pub use pipeline::{DOT_FILE_STEM, MODEL_DOT_FILE, Pipeline, RunReport};
pub use sim::{SimBackend, SimFrame, SimScript, SourceScript};
