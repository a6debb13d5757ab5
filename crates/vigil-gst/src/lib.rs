#![doc = include_str!("../README.md")]

#[cfg(feature = "gstreamer-runtime")]
mod nvds_sys;

#[cfg(feature = "gstreamer-runtime")]
pub mod gst_backend;
#[cfg(not(feature = "gstreamer-runtime"))]
#[path = "gst_backend_stub.rs"]
pub mod gst_backend;

pub use gst_backend::GstBackend;

/// Whether this build can run real pipelines.
pub const RUNTIME_AVAILABLE: bool = cfg!(feature = "gstreamer-runtime");
