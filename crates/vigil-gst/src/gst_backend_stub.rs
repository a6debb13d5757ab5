//! Stand-in for builds without the `gstreamer-runtime` feature.

use vigil_core::backend::{
    BufferProbe, EventSender, PadAddedHandler, PadRef, PropertyValue, StageBackend, StageKind,
};
use vigil_core::error::{Result, VigilError};

const UNAVAILABLE: &str =
    "vigil built without gstreamer-runtime: rebuild with `--features gstreamer-runtime`";

fn unavailable<T>() -> Result<T> {
    Err(VigilError::Backend(UNAVAILABLE.into()))
}

/// Stub backend; [`GstBackend::new`] always fails.
pub struct GstBackend {
    _private: (),
}

impl GstBackend {
    pub fn new() -> Result<Self> {
        unavailable()
    }
}

impl StageBackend for GstBackend {
    fn create_stage(&self, _kind: StageKind, _name: &str) -> Result<()> {
        unavailable()
    }

    fn set_property(&self, _stage: &str, _key: &str, _value: &PropertyValue) -> Result<()> {
        unavailable()
    }

    fn request_pad(&self, _stage: &str, _name: &str) -> Result<PadRef> {
        unavailable()
    }

    fn link(&self, _from: &PadRef, _to: &PadRef) -> Result<()> {
        unavailable()
    }

    fn on_pad_added(&self, _stage: &str, _handler: PadAddedHandler) -> Result<()> {
        unavailable()
    }

    fn add_buffer_probe(&self, _pad: &PadRef, _probe: BufferProbe) -> Result<()> {
        unavailable()
    }

    fn start(&self, _events: EventSender) -> Result<()> {
        unavailable()
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}
