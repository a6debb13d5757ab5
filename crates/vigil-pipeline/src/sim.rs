//! In-process scripted backend.
//!
//! [`SimBackend`] records every construction request and, once started,
//! plays a [`SimScript`] on one worker thread per source chain.  Each worker
//! behaves like a container demuxer followed by the rest of its chain:
//!
//! 1. announce the script's auxiliary pads, then (optionally) `video_0`,
//!    to the handlers registered on `qtdemux-i`;
//! 2. if the demuxer ended up linked to its parser, push the scripted frames
//!    through the probes on `osd-i.sink`, counting those that reach the sink;
//! 3. report itself drained.
//!
//! End-of-stream is posted once every chain has drained.  Scripted warnings
//! and errors are posted after a given number of frames of one source; an
//! error stops that worker without draining it.
//!
//! Construction failures can be injected per stage kind (`unsupported`) and
//! per link target (`fail_link_into`).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use vigil_core::backend::{
    BufferProbe, BusMessage, EventSender, PadAddedHandler, PadRef, PipelineEvent, ProbeReturn,
    PropertyValue, StageBackend, StageKind,
};
use vigil_core::error::{Result, VigilError};
use vigil_core::metadata::{BatchBuffer, BatchFrames, FrameMeta, ObjectMeta};

use crate::dynamic_link::PRIMARY_VIDEO_PAD;
use crate::graph::ChainNames;

// ─── Script ─────────────────────────────────────────────────────────────────

/// One buffer as it reaches the overlay stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimFrame {
    /// A frame carrying this many detected objects.
    Objects(u32),
    /// A buffer without batch metadata attached.
    NoMeta,
}

#[derive(Clone, Debug)]
pub struct SourceScript {
    pub frames: Vec<SimFrame>,
    /// Pads announced before the primary video pad, e.g. `audio_0`.
    pub extra_pads: Vec<String>,
    /// Whether the demuxer ever exposes `video_0`.
    pub announce_video: bool,
    /// Pause between frames.
    pub frame_interval: Duration,
}

impl Default for SourceScript {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            extra_pads: Vec::new(),
            announce_video: true,
            frame_interval: Duration::ZERO,
        }
    }
}

impl SourceScript {
    /// `frames` frames with `objects` objects each.
    pub fn uniform(frames: usize, objects: u32) -> Self {
        Self {
            frames: vec![SimFrame::Objects(objects); frames],
            ..Self::default()
        }
    }

    /// A container whose video track never shows up.
    pub fn without_video() -> Self {
        Self {
            announce_video: false,
            ..Self::default()
        }
    }

    pub fn with_extra_pad(mut self, pad: &str) -> Self {
        self.extra_pads.push(pad.to_string());
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }
}

/// Scripted behaviour of a whole run.
///
/// Chains beyond `sources.len()` use [`SourceScript::default`]: the video
/// pad appears and no frames follow.
#[derive(Clone, Debug, Default)]
pub struct SimScript {
    pub sources: Vec<SourceScript>,
    /// Stage kinds whose creation fails as if the plugin were missing.
    pub unsupported: Vec<StageKind>,
    /// Stage names that refuse every incoming link.
    pub fail_link_into: Vec<String>,
    /// `(source, frames)`: post a warning after that source's n-th frame.
    pub warning_after: Option<(u32, usize)>,
    /// `(source, frames)`: post an error after that source's n-th frame.
    pub error_after: Option<(u32, usize)>,
}

impl SimScript {
    pub fn with_sources(sources: Vec<SourceScript>) -> Self {
        Self {
            sources,
            ..Self::default()
        }
    }
}

// ─── Backend ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimStage {
    kind: StageKind,
    properties: BTreeMap<String, PropertyValue>,
    pads: BTreeSet<String>,
}

#[derive(Default)]
struct SimState {
    stages: BTreeMap<String, SimStage>,
    links: Vec<(PadRef, PadRef)>,
    pad_handlers: BTreeMap<String, Vec<PadAddedHandler>>,
    probes: BTreeMap<PadRef, Vec<BufferProbe>>,
}

impl SimState {
    fn stage(&self, name: &str) -> Result<&SimStage> {
        self.stages
            .get(name)
            .ok_or_else(|| VigilError::Backend(format!("no stage named {name}")))
    }

    fn stage_mut(&mut self, name: &str) -> Result<&mut SimStage> {
        self.stages
            .get_mut(name)
            .ok_or_else(|| VigilError::Backend(format!("no stage named {name}")))
    }

    fn is_linked(&self, from_stage: &str, to: &PadRef) -> bool {
        self.links
            .iter()
            .any(|(from, target)| from.stage == from_stage && target == to)
    }
}

pub struct SimBackend {
    script: SimScript,
    state: Arc<Mutex<SimState>>,
    delivered: Arc<Mutex<BTreeMap<u32, u64>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
    started: AtomicBool,
    stop_calls: AtomicUsize,
    topology_dumps: Mutex<Vec<String>>,
}

impl SimBackend {
    pub fn new(script: SimScript) -> Self {
        Self {
            script,
            state: Arc::new(Mutex::new(SimState::default())),
            delivered: Arc::new(Mutex::new(BTreeMap::new())),
            workers: Mutex::new(Vec::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
            topology_dumps: Mutex::new(Vec::new()),
        }
    }

    // ── Inspection ──

    pub fn stage_kind(&self, name: &str) -> Option<StageKind> {
        self.state.lock().stages.get(name).map(|s| s.kind)
    }

    pub fn stage_count(&self) -> usize {
        self.state.lock().stages.len()
    }

    pub fn stages_of_kind(&self, kind: StageKind) -> Vec<String> {
        self.state
            .lock()
            .stages
            .iter()
            .filter(|(_, s)| s.kind == kind)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn property(&self, stage: &str, key: &str) -> Option<PropertyValue> {
        self.state
            .lock()
            .stages
            .get(stage)
            .and_then(|s| s.properties.get(key).cloned())
    }

    pub fn pads(&self, stage: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .stages
            .get(stage)
            .map(|s| s.pads.clone())
            .unwrap_or_default()
    }

    pub fn is_linked(&self, from: &PadRef, to: &PadRef) -> bool {
        self.state
            .lock()
            .links
            .iter()
            .any(|(f, t)| f == from && t == to)
    }

    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Buffers of `source` that got past every probe and reached its sink.
    pub fn delivered(&self, source: u32) -> u64 {
        self.delivered.lock().get(&source).copied().unwrap_or(0)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::Acquire)
    }

    pub fn topology_dumps(&self) -> Vec<String> {
        self.topology_dumps.lock().clone()
    }

    fn source_script(&self, index: u32) -> SourceScript {
        self.script
            .sources
            .get(index as usize)
            .cloned()
            .unwrap_or_default()
    }
}

impl StageBackend for SimBackend {
    fn create_stage(&self, kind: StageKind, name: &str) -> Result<()> {
        if self.script.unsupported.contains(&kind) {
            return Err(VigilError::Backend(format!(
                "no element factory named {}",
                kind.factory_name()
            )));
        }
        let mut state = self.state.lock();
        if state.stages.contains_key(name) {
            return Err(VigilError::Backend(format!("stage {name} already exists")));
        }
        state.stages.insert(
            name.to_string(),
            SimStage {
                kind,
                properties: BTreeMap::new(),
                pads: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn set_property(&self, stage: &str, key: &str, value: &PropertyValue) -> Result<()> {
        let mut state = self.state.lock();
        state
            .stage_mut(stage)?
            .properties
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn request_pad(&self, stage: &str, name: &str) -> Result<PadRef> {
        let mut state = self.state.lock();
        let node = state.stage_mut(stage)?;
        if !matches!(node.kind, StageKind::StreamMux | StageKind::StreamDemux) {
            return Err(VigilError::Backend(format!(
                "{stage} has no request pad templates"
            )));
        }
        if !node.pads.insert(name.to_string()) {
            return Err(VigilError::Backend(format!(
                "pad {name} already requested on {stage}"
            )));
        }
        Ok(PadRef::new(stage, name))
    }

    fn link(&self, from: &PadRef, to: &PadRef) -> Result<()> {
        if self.script.fail_link_into.iter().any(|s| *s == to.stage) {
            return Err(VigilError::Backend(format!(
                "{to} refused link from {from}"
            )));
        }
        let mut state = self.state.lock();
        state.stage(&from.stage)?;
        state.stage(&to.stage)?;
        if state.links.iter().any(|(_, t)| t == to) {
            return Err(VigilError::Backend(format!("{to} is already linked")));
        }
        state.links.push((from.clone(), to.clone()));
        Ok(())
    }

    fn on_pad_added(&self, stage: &str, handler: PadAddedHandler) -> Result<()> {
        let mut state = self.state.lock();
        state.stage(stage)?;
        state
            .pad_handlers
            .entry(stage.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    fn add_buffer_probe(&self, pad: &PadRef, probe: BufferProbe) -> Result<()> {
        let mut state = self.state.lock();
        state.stage(&pad.stage)?;
        state.probes.entry(pad.clone()).or_default().push(probe);
        Ok(())
    }

    fn start(&self, events: EventSender) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(VigilError::Backend("already started".into()));
        }
        let chains: Vec<u32> = (0..self.stages_of_kind(StageKind::FileSource).len() as u32)
            .collect();
        info!(sources = chains.len(), "Sim backend playing");

        let remaining = Arc::new(AtomicUsize::new(chains.len()));
        if chains.is_empty() {
            let _ = events.send(PipelineEvent::Bus(BusMessage::EndOfStream));
            return Ok(());
        }

        let mut workers = self.workers.lock();
        for index in chains {
            let worker = SourceWorker {
                names: ChainNames::for_index(index),
                script: self.source_script(index),
                warning_after: self
                    .script
                    .warning_after
                    .and_then(|(s, n)| (s == index).then_some(n)),
                error_after: self
                    .script
                    .error_after
                    .and_then(|(s, n)| (s == index).then_some(n)),
                state: Arc::clone(&self.state),
                delivered: Arc::clone(&self.delivered),
                stopping: Arc::clone(&self.stopping),
                remaining: Arc::clone(&remaining),
                events: events.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("sim-source-{index}"))
                .spawn(move || worker.run())
                .map_err(|e| VigilError::Backend(format!("spawn source worker: {e}")))?;
            workers.push(handle);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::AcqRel);
        self.stopping.store(true, Ordering::Release);
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("Sim source worker panicked");
            }
        }
        Ok(())
    }

    fn dump_topology(&self, file_stem: &str) -> Result<()> {
        self.topology_dumps.lock().push(file_stem.to_string());
        Ok(())
    }
}

impl Drop for SimBackend {
    fn drop(&mut self) {
        // Workers may hold the last strong reference transiently; never join here.
        self.stopping.store(true, Ordering::Release);
    }
}

// ─── Workers ────────────────────────────────────────────────────────────────

struct SourceWorker {
    names: ChainNames,
    script: SourceScript,
    warning_after: Option<usize>,
    error_after: Option<usize>,
    state: Arc<Mutex<SimState>>,
    delivered: Arc<Mutex<BTreeMap<u32, u64>>>,
    stopping: Arc<AtomicBool>,
    remaining: Arc<AtomicUsize>,
    events: EventSender,
}

impl SourceWorker {
    fn run(self) {
        let index = self.names.index;

        // Handlers link through the backend and take the state lock themselves.
        let handlers = self
            .state
            .lock()
            .pad_handlers
            .get(&self.names.demux)
            .cloned()
            .unwrap_or_default();
        for pad in &self.script.extra_pads {
            handlers.iter().for_each(|h| h(pad));
        }
        if self.script.announce_video {
            handlers.iter().for_each(|h| h(PRIMARY_VIDEO_PAD));
        }

        let (linked, probes) = {
            let state = self.state.lock();
            let linked = state.is_linked(&self.names.demux, &PadRef::sink(&self.names.parser));
            let probes = state
                .probes
                .get(&PadRef::sink(&self.names.overlay))
                .cloned()
                .unwrap_or_default();
            (linked, probes)
        };

        if linked {
            for (n, frame) in self.script.frames.iter().enumerate() {
                if self.stopping.load(Ordering::Acquire) {
                    debug!(source = index, "Source worker stopped early");
                    return;
                }
                let buffer = SimBuffer {
                    source: index,
                    frame_num: n as i32,
                    frame: *frame,
                };
                if probes.iter().all(|p| p(&buffer) == ProbeReturn::Pass) {
                    *self.delivered.lock().entry(index).or_default() += 1;
                }

                let pushed = n + 1;
                if self.warning_after == Some(pushed) {
                    let _ = self.events.send(PipelineEvent::Bus(BusMessage::Warning {
                        stage: self.names.sink.clone(),
                        message: "scripted warning".into(),
                        debug: None,
                    }));
                }
                if self.error_after == Some(pushed) {
                    let _ = self.events.send(PipelineEvent::Bus(BusMessage::Error {
                        stage: self.names.decoder.clone(),
                        message: "scripted decode failure".into(),
                        debug: Some(format!("after {pushed} frames")),
                    }));
                    return;
                }
                if !self.script.frame_interval.is_zero() {
                    std::thread::sleep(self.script.frame_interval);
                }
            }
        } else {
            debug!(source = index, "Chain never linked, producing no data");
        }

        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self
                .events
                .send(PipelineEvent::Bus(BusMessage::EndOfStream));
        }
    }
}

/// A single-frame batch as seen at one overlay input.
struct SimBuffer {
    source: u32,
    frame_num: i32,
    frame: SimFrame,
}

impl BatchBuffer for SimBuffer {
    fn batch_meta(&self) -> Option<BatchFrames<'_>> {
        let SimFrame::Objects(count) = self.frame else {
            return None;
        };
        let frame = FrameMeta::new(
            self.source,
            self.source,
            self.frame_num,
            (0..u64::from(count)).map(|object_id| ObjectMeta {
                class_id: 0,
                object_id,
                confidence: 1.0,
            }),
        );
        Some(BatchFrames::new(std::iter::once(frame)))
    }
}
