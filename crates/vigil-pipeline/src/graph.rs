//! Graph model and builder.
//!
//! # Topology
//!
//! For `N` sources the builder creates `N` per-source chains around one
//! shared batch region:
//!
//! ```text
//! file-source-i → qtdemux-i ⇢ h264-parser-i → decoder-i ─┐
//!                                                        │ sink_i
//!                                              ┌─────────▼─────────┐
//!                                              │    nvstreammux    │
//!                                              │ primary-inference │
//!                                              │     [tracker]     │
//!                                              │    streamdemux    │
//!                                              └─────────┬─────────┘
//!                                                        │ src_i
//! sink-i ← osd-i ← nvvideoconvert-i ← queue-i ←──────────┘
//! ```
//!
//! `⇢` is the dynamic link made once the demuxer exposes `video_0`.  A
//! [`MetadataCollector`] observes `osd-i.sink`.
//!
//! Every request to the backend is mirrored into the [`Graph`] model, which
//! enforces that link endpoints exist and renders the topology as DOT.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{info, instrument};

use vigil_core::backend::{EventSender, PadRef, PropertyValue, StageBackend, StageKind};
use vigil_core::config::{PipelineConfig, TrackerConfig};
use vigil_core::error::{Result, VigilError};

use crate::collector::{CountTable, MetadataCollector};
use crate::dynamic_link::{LinkTracker, PRIMARY_VIDEO_PAD, PadMatch};

pub const STREAM_MUX: &str = "nvstreammux";
pub const PRIMARY_INFERENCE: &str = "primary-inference";
pub const TRACKER: &str = "tracker";
pub const STREAM_DEMUX: &str = "streamdemux";

/// Stage names of one per-source chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainNames {
    pub index: u32,
    pub source: String,
    pub demux: String,
    pub parser: String,
    pub decoder: String,
    pub queue: String,
    pub converter: String,
    pub overlay: String,
    pub sink: String,
}

impl ChainNames {
    pub fn for_index(index: u32) -> Self {
        Self {
            index,
            source: format!("file-source-{index}"),
            demux: format!("qtdemux-{index}"),
            parser: format!("h264-parser-{index}"),
            decoder: format!("decoder-{index}"),
            queue: format!("queue-{index}"),
            converter: format!("nvvideoconvert-{index}"),
            overlay: format!("osd-{index}"),
            sink: format!("sink-{index}"),
        }
    }

    /// `(kind, name)` of every stage in chain order.
    pub fn stages(&self) -> [(StageKind, &str); 8] {
        [
            (StageKind::FileSource, self.source.as_str()),
            (StageKind::ContainerDemux, self.demux.as_str()),
            (StageKind::StreamParser, self.parser.as_str()),
            (StageKind::Decoder, self.decoder.as_str()),
            (StageKind::Queue, self.queue.as_str()),
            (StageKind::Converter, self.converter.as_str()),
            (StageKind::Overlay, self.overlay.as_str()),
            (StageKind::Sink, self.sink.as_str()),
        ]
    }
}

// ─── Model ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub kind: StageKind,
    pub name: String,
    pub properties: BTreeMap<String, PropertyValue>,
    pub ports: BTreeSet<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkMode {
    Static,
    Dynamic,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub from: PadRef,
    pub to: PadRef,
    pub mode: LinkMode,
}

/// Nodes and links of one pipeline, in creation order.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    links: Vec<Link>,
}

impl Graph {
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn nodes_of_kind(&self, kind: StageKind) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.kind == kind)
    }

    /// Number of per-source chains (one file source each).
    pub fn chain_count(&self) -> usize {
        self.nodes_of_kind(StageKind::FileSource).count()
    }

    pub fn property(&self, stage: &str, key: &str) -> Option<&PropertyValue> {
        self.node(stage).and_then(|n| n.properties.get(key))
    }

    pub fn has_link(&self, from: &PadRef, to: &PadRef) -> bool {
        self.links.iter().any(|l| &l.from == from && &l.to == to)
    }

    fn insert_node(&mut self, kind: StageKind, name: &str) -> Result<()> {
        if self.node(name).is_some() {
            return Err(VigilError::StageCreation {
                kind,
                name: name.to_string(),
                reason: "duplicate stage name".into(),
            });
        }
        self.nodes.push(Node {
            kind,
            name: name.to_string(),
            properties: BTreeMap::new(),
            ports: BTreeSet::new(),
        });
        Ok(())
    }

    fn record_port(&mut self, pad: &PadRef) {
        if let Some(node) = self.node_mut(&pad.stage) {
            node.ports.insert(pad.pad.clone());
        }
    }

    fn check_endpoints(&self, from: &PadRef, to: &PadRef) -> Result<()> {
        for end in [from, to] {
            if self.node(&end.stage).is_none() {
                return Err(VigilError::StaticLink {
                    from: from.to_string(),
                    to: to.to_string(),
                    reason: format!("unknown stage {}", end.stage),
                });
            }
        }
        Ok(())
    }

    fn insert_link(&mut self, from: PadRef, to: PadRef, mode: LinkMode) {
        self.record_port(&from);
        self.record_port(&to);
        self.links.push(Link { from, to, mode });
    }

    /// Render the model as Graphviz DOT; dynamic links are dashed.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n  rankdir=LR;\n  node [shape=box];\n");
        for node in &self.nodes {
            let _ = writeln!(
                out,
                "  \"{}\" [label=\"{}\\n{}\"];",
                node.name, node.name, node.kind
            );
        }
        for link in &self.links {
            let style = match link.mode {
                LinkMode::Static => "solid",
                LinkMode::Dynamic => "dashed",
            };
            let _ = writeln!(
                out,
                "  \"{}\" -> \"{}\" [taillabel=\"{}\", headlabel=\"{}\", style={}];",
                link.from.stage, link.to.stage, link.from.pad, link.to.pad, style
            );
        }
        out.push_str("}\n");
        out
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

/// Result of a successful build.
pub struct BuiltGraph {
    pub graph: Graph,
    pub links: LinkTracker,
    pub collectors: Vec<Arc<MetadataCollector>>,
}

/// Constructs and wires every stage of the pipeline on a backend.
///
/// Any creation, property or static-link failure aborts the build before the
/// graph starts.
pub struct GraphBuilder<'a> {
    backend: &'a Arc<dyn StageBackend>,
    config: &'a PipelineConfig,
    counts: CountTable,
    events: EventSender,
    graph: Graph,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        backend: &'a Arc<dyn StageBackend>,
        config: &'a PipelineConfig,
        counts: CountTable,
        events: EventSender,
    ) -> Self {
        Self {
            backend,
            config,
            counts,
            events,
            graph: Graph::default(),
        }
    }

    #[instrument(skip_all, name = "graph_build", fields(sources = self.config.source_count))]
    pub fn build(mut self) -> Result<BuiltGraph> {
        let config = self.config;
        config.validate()?;
        let tracker_config = if config.tracker_enabled {
            Some(TrackerConfig::from_file(&config.tracker_config_path)?)
        } else {
            None
        };
        let chains: Vec<ChainNames> = (0..config.source_count)
            .map(ChainNames::for_index)
            .collect();

        // ── 1. Per-source chains ──
        for chain in &chains {
            for (kind, name) in chain.stages() {
                self.add_stage(kind, name)?;
            }
        }

        // ── 2. Batch region ──
        self.add_stage(StageKind::StreamMux, STREAM_MUX)?;
        self.add_stage(StageKind::Inference, PRIMARY_INFERENCE)?;
        if tracker_config.is_some() {
            self.add_stage(StageKind::Tracker, TRACKER)?;
        }
        self.add_stage(StageKind::StreamDemux, STREAM_DEMUX)?;

        // ── 3. Configuration ──
        info!(path = %config.media_path.display(), "Playing file");
        let location = config.media_path.display().to_string();
        for chain in &chains {
            self.set(&chain.source, "location", location.as_str().into())?;
        }
        let mux = &config.mux;
        self.set(STREAM_MUX, "width", mux.width.into())?;
        self.set(STREAM_MUX, "height", mux.height.into())?;
        self.set(STREAM_MUX, "batch-size", config.source_count.into())?;
        self.set(
            STREAM_MUX,
            "batched-push-timeout",
            mux.batched_push_timeout_us.into(),
        )?;
        let pgie = config.pgie_config_path.display().to_string();
        self.set(PRIMARY_INFERENCE, "config-file-path", pgie.into())?;
        if config.sync_sinks {
            info!("Setting sync to true");
            for chain in &chains {
                self.set(&chain.sink, "sync", true.into())?;
            }
        }
        if let Some(tracker_config) = &tracker_config {
            for (key, value) in tracker_config.properties() {
                self.set(TRACKER, key, value.clone())?;
            }
        }

        // ── 4. Static links within each chain ──
        info!("Linking elements in the Pipeline");
        for chain in &chains {
            self.link_static(PadRef::src(&chain.source), PadRef::sink(&chain.demux))?;
            self.link_static(PadRef::src(&chain.parser), PadRef::sink(&chain.decoder))?;
            let mux_sink = self.request(STREAM_MUX, &format!("sink_{}", chain.index))?;
            self.link_static(PadRef::src(&chain.decoder), mux_sink)?;
            self.link_static(PadRef::src(&chain.queue), PadRef::sink(&chain.converter))?;
            self.link_static(PadRef::src(&chain.converter), PadRef::sink(&chain.overlay))?;
            self.link_static(PadRef::src(&chain.overlay), PadRef::sink(&chain.sink))?;
        }

        // ── 5. Deferred demux → parser links ──
        let mut links = LinkTracker::new(chains.len(), self.backend, self.events.clone());
        for chain in &chains {
            let request = links.request(
                &chain.demux,
                PadMatch::exact(PRIMARY_VIDEO_PAD),
                PadRef::sink(&chain.parser),
            );
            self.backend
                .on_pad_added(&chain.demux, request.handler())
                .map_err(|e| VigilError::StaticLink {
                    from: format!("{}.{PRIMARY_VIDEO_PAD}", chain.demux),
                    to: PadRef::sink(&chain.parser).to_string(),
                    reason: format!("pad-added registration refused: {e}"),
                })?;
            self.graph.insert_link(
                PadRef::new(chain.demux.as_str(), PRIMARY_VIDEO_PAD),
                PadRef::sink(&chain.parser),
                LinkMode::Dynamic,
            );
        }

        // ── 6. Batch region ──
        self.link_static(PadRef::src(STREAM_MUX), PadRef::sink(PRIMARY_INFERENCE))?;
        if tracker_config.is_some() {
            self.link_static(PadRef::src(PRIMARY_INFERENCE), PadRef::sink(TRACKER))?;
            self.link_static(PadRef::src(TRACKER), PadRef::sink(STREAM_DEMUX))?;
        } else {
            self.link_static(PadRef::src(PRIMARY_INFERENCE), PadRef::sink(STREAM_DEMUX))?;
        }

        // ── 7. De-batched outputs ──
        for chain in &chains {
            let demux_src = self.request(STREAM_DEMUX, &format!("src_{}", chain.index))?;
            self.link_static(demux_src, PadRef::sink(&chain.queue))?;
        }

        // ── 8. Metadata collectors on overlay inputs ──
        let mut collectors = Vec::with_capacity(chains.len());
        for chain in &chains {
            let collector = Arc::new(MetadataCollector::new(chain.index, self.counts.clone()));
            let pad = PadRef::sink(&chain.overlay);
            self.backend
                .add_buffer_probe(&pad, collector.probe())
                .map_err(|_| VigilError::PadRequest {
                    stage: chain.overlay.clone(),
                    pad: pad.pad.clone(),
                })?;
            self.graph.record_port(&pad);
            collectors.push(collector);
        }

        info!(
            nodes = self.graph.nodes.len(),
            links = self.graph.links.len(),
            "Graph built"
        );

        Ok(BuiltGraph {
            graph: self.graph,
            links,
            collectors,
        })
    }

    fn add_stage(&mut self, kind: StageKind, name: &str) -> Result<()> {
        info!("Creating {name}");
        self.backend
            .create_stage(kind, name)
            .map_err(|e| VigilError::StageCreation {
                kind,
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        self.graph.insert_node(kind, name)
    }

    fn set(&mut self, stage: &str, key: &str, value: PropertyValue) -> Result<()> {
        self.backend
            .set_property(stage, key, &value)
            .map_err(|e| VigilError::Property {
                stage: stage.to_string(),
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        if let Some(node) = self.graph.node_mut(stage) {
            node.properties.insert(key.to_string(), value);
        }
        Ok(())
    }

    fn request(&mut self, stage: &str, pad: &str) -> Result<PadRef> {
        let granted = self
            .backend
            .request_pad(stage, pad)
            .map_err(|_| VigilError::PadRequest {
                stage: stage.to_string(),
                pad: pad.to_string(),
            })?;
        self.graph.record_port(&granted);
        Ok(granted)
    }

    fn link_static(&mut self, from: PadRef, to: PadRef) -> Result<()> {
        self.graph.check_endpoints(&from, &to)?;
        self.backend
            .link(&from, &to)
            .map_err(|e| VigilError::StaticLink {
                from: from.to_string(),
                to: to.to_string(),
                reason: e.to_string(),
            })?;
        self.graph.insert_link(from, to, LinkMode::Static);
        Ok(())
    }
}
