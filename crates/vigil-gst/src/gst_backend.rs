//! [`StageBackend`] on a live GStreamer pipeline with DeepStream plugins.
//!
//! Stages are GStreamer elements made from the factory named by
//! [`StageKind::factory_name`] and added to one `gst::Pipeline`.  Bus
//! messages are forwarded from a sync handler straight into the run's event
//! channel, so no GLib main loop is needed.

use std::collections::BTreeMap;
use std::ffi::c_void;

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use vigil_core::backend::{
    BufferProbe, BusMessage, EventSender, PadAddedHandler, PadRef, PipelineEvent, ProbeReturn,
    PropertyValue, StageBackend, StageKind,
};
use vigil_core::error::{Result, VigilError};
use vigil_core::metadata::{BatchBuffer, BatchFrames, FrameMeta, ObjectMeta};

use crate::nvds_sys::{self, GListIter, NvDsBatchMeta, NvDsFrameMeta, NvDsObjectMeta};

pub struct GstBackend {
    pipeline: gst::Pipeline,
    elements: Mutex<BTreeMap<String, gst::Element>>,
}

impl GstBackend {
    /// Initialize GStreamer and create an empty pipeline.
    pub fn new() -> Result<Self> {
        gst::init().map_err(|e| VigilError::Backend(format!("gstreamer init: {e}")))?;
        info!(version = %gst::version_string(), "GStreamer initialized");
        Ok(Self {
            pipeline: gst::Pipeline::with_name("vigil-pipeline"),
            elements: Mutex::new(BTreeMap::new()),
        })
    }

    fn element(&self, name: &str) -> Result<gst::Element> {
        self.elements
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| VigilError::Backend(format!("no element named {name}")))
    }

    fn pad(&self, pad: &PadRef) -> Result<gst::Pad> {
        self.element(&pad.stage)?
            .static_pad(&pad.pad)
            .ok_or_else(|| VigilError::Backend(format!("{} has no pad {}", pad.stage, pad.pad)))
    }
}

/// Build a `glib::Value` of the property's declared type.
fn to_gvalue(value: &PropertyValue, pspec: &glib::ParamSpec) -> Result<glib::Value> {
    let ty = pspec.value_type();
    if ty == glib::Type::STRING {
        return Ok(value.to_string().to_value());
    }
    if let (PropertyValue::Bool(b), true) = (value, ty == glib::Type::BOOL) {
        return Ok(b.to_value());
    }
    glib::Value::deserialize(&value.to_string(), ty).map_err(|e| {
        VigilError::Backend(format!(
            "cannot convert '{value}' to {}: {e}",
            ty.name()
        ))
    })
}

impl StageBackend for GstBackend {
    fn create_stage(&self, kind: StageKind, name: &str) -> Result<()> {
        let element = gst::ElementFactory::make(kind.factory_name())
            .name(name)
            .build()
            .map_err(|e| VigilError::Backend(e.to_string()))?;
        self.pipeline
            .add(&element)
            .map_err(|e| VigilError::Backend(e.to_string()))?;
        self.elements.lock().insert(name.to_string(), element);
        Ok(())
    }

    fn set_property(&self, stage: &str, key: &str, value: &PropertyValue) -> Result<()> {
        let element = self.element(stage)?;
        let pspec = element
            .find_property(key)
            .ok_or_else(|| VigilError::Backend(format!("{stage} has no property {key}")))?;
        if !pspec.flags().contains(glib::ParamFlags::WRITABLE) {
            return Err(VigilError::Backend(format!("{stage}.{key} is read-only")));
        }
        let gvalue = to_gvalue(value, &pspec)?;
        element.set_property_from_value(key, &gvalue);
        debug!(stage, key, %value, "Set property");
        Ok(())
    }

    fn request_pad(&self, stage: &str, name: &str) -> Result<PadRef> {
        let pad = self
            .element(stage)?
            .request_pad_simple(name)
            .ok_or_else(|| VigilError::Backend(format!("{stage} refused request pad {name}")))?;
        Ok(PadRef::new(stage, pad.name().as_str()))
    }

    fn link(&self, from: &PadRef, to: &PadRef) -> Result<()> {
        let src = self.pad(from)?;
        let sink = self.pad(to)?;
        src.link(&sink)
            .map_err(|e| VigilError::Backend(format!("{e:?}")))?;
        Ok(())
    }

    fn on_pad_added(&self, stage: &str, handler: PadAddedHandler) -> Result<()> {
        self.element(stage)?
            .connect_pad_added(move |_element, pad| handler(pad.name().as_str()));
        Ok(())
    }

    fn add_buffer_probe(&self, pad: &PadRef, probe: BufferProbe) -> Result<()> {
        let gst_pad = self.pad(pad)?;
        gst_pad
            .add_probe(gst::PadProbeType::BUFFER, move |_pad, info| {
                let Some(buffer) = info.buffer() else {
                    return gst::PadProbeReturn::Ok;
                };
                match probe(&GstBatchBuffer { buffer }) {
                    ProbeReturn::Pass => gst::PadProbeReturn::Ok,
                }
            })
            .ok_or_else(|| VigilError::Backend(format!("cannot probe {pad}")))?;
        Ok(())
    }

    fn start(&self, events: EventSender) -> Result<()> {
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| VigilError::Backend("pipeline has no bus".into()))?;
        bus.set_sync_handler(move |_bus, msg| {
            if let Some(message) = bus_message(msg) {
                let _ = events.send(PipelineEvent::Bus(message));
            }
            gst::BusSyncReply::Drop
        });

        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| VigilError::Backend(format!("set state PLAYING: {e}")))?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| VigilError::Backend(format!("set state NULL: {e}")))?;
        if let Some(bus) = self.pipeline.bus() {
            bus.unset_sync_handler();
        }
        Ok(())
    }

    fn dump_topology(&self, file_stem: &str) -> Result<()> {
        // Writes nothing unless GST_DEBUG_DUMP_DOT_DIR is set.
        self.pipeline
            .debug_to_dot_file(gst::DebugGraphDetails::ALL, file_stem);
        Ok(())
    }
}

fn bus_message(msg: &gst::Message) -> Option<BusMessage> {
    let stage = || {
        msg.src()
            .map(|s| s.name().to_string())
            .unwrap_or_default()
    };
    match msg.view() {
        gst::MessageView::Eos(..) => Some(BusMessage::EndOfStream),
        gst::MessageView::Warning(w) => Some(BusMessage::Warning {
            stage: stage(),
            message: w.error().to_string(),
            debug: w.debug().map(|d| d.to_string()),
        }),
        gst::MessageView::Error(e) => Some(BusMessage::Error {
            stage: stage(),
            message: e.error().to_string(),
            debug: e.debug().map(|d| d.to_string()),
        }),
        _ => None,
    }
}

/// A probed buffer read through its DeepStream batch metadata.
struct GstBatchBuffer<'a> {
    buffer: &'a gst::BufferRef,
}

impl BatchBuffer for GstBatchBuffer<'_> {
    fn batch_meta(&self) -> Option<BatchFrames<'_>> {
        // SAFETY: the buffer is alive for the duration of the probe callback
        // and the lookup only reads its meta list.
        let batch = unsafe {
            nvds_sys::gst_buffer_get_nvds_batch_meta(self.buffer.as_ptr() as *mut c_void)
        };
        if batch.is_null() {
            trace!("Buffer carries no NvDsBatchMeta");
            return None;
        }
        // SAFETY: non-null batch meta is owned by the buffer, which outlives
        // this borrow, and is not mutated while the probe runs.
        let batch: &NvDsBatchMeta = unsafe { &*batch };
        let frames = unsafe { GListIter::<NvDsFrameMeta>::new(batch.frame_meta_list) };
        Some(BatchFrames::new(frames.map(|frame| {
            // SAFETY: as above; object lists belong to the same batch meta.
            let objects = unsafe { GListIter::<NvDsObjectMeta>::new(frame.obj_meta_list) };
            FrameMeta::new(
                frame.pad_index,
                frame.source_id,
                frame.frame_num,
                objects.map(|obj| ObjectMeta {
                    class_id: obj.class_id,
                    object_id: obj.object_id,
                    confidence: obj.confidence,
                }),
            )
        })))
    }
}
