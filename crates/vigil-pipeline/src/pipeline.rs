//! Top-level run: build, play, wait, tear down, report.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use vigil_core::backend::{StageBackend, event_channel};
use vigil_core::config::PipelineConfig;
use vigil_core::error::Result;

use crate::collector::{CountTable, MetadataCollector};
use crate::dynamic_link::LinkTracker;
use crate::event_loop::{EventLoop, LifecycleState, StopReason};
use crate::graph::{Graph, GraphBuilder};

/// File stem of the backend's own topology dump.
pub const DOT_FILE_STEM: &str = "debug_graph";

/// File name of the graph-model diagram, next to the backend's dump.
pub const MODEL_DOT_FILE: &str = "debug_graph.model.dot";

/// Exit status of an interrupted run, as for SIGINT.
pub const INTERRUPTED_EXIT_CODE: u8 = 130;

/// A fully constructed pipeline that has not run yet.
pub struct Pipeline {
    graph: Graph,
    links: LinkTracker,
    collectors: Vec<Arc<MetadataCollector>>,
    counts: CountTable,
    event_loop: EventLoop,
    dot_dump_dir: Option<PathBuf>,
}

impl Pipeline {
    /// Construct the whole graph on `backend`.
    ///
    /// Nothing is started; any construction error is returned before a single
    /// buffer flows.
    pub fn build(backend: Arc<dyn StageBackend>, config: &PipelineConfig) -> Result<Self> {
        let (tx, rx) = event_channel();
        let counts = CountTable::new();
        let built = GraphBuilder::new(&backend, config, counts.clone(), tx.clone()).build()?;

        Ok(Self {
            graph: built.graph,
            links: built.links,
            collectors: built.collectors,
            counts,
            event_loop: EventLoop::new(backend, tx, rx),
            dot_dump_dir: config.dot_dump_dir.clone(),
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn links(&self) -> &LinkTracker {
        &self.links
    }

    pub fn collectors(&self) -> &[Arc<MetadataCollector>] {
        &self.collectors
    }

    pub fn counts(&self) -> &CountTable {
        &self.counts
    }

    pub fn state(&self) -> LifecycleState {
        self.event_loop.state()
    }

    /// Play until end-of-stream, a fatal error or `cancel`, then tear down.
    ///
    /// Teardown happens before the report is assembled, on every path.
    #[instrument(skip_all, name = "pipeline_run")]
    pub async fn run(mut self, cancel: CancellationToken) -> RunReport {
        let outcome = match self.event_loop.play() {
            Ok(()) => {
                self.dump_topology();
                self.event_loop.wait(&cancel).await
            }
            Err(e) => StopReason::Error(e),
        };
        self.event_loop.teardown();

        let report = RunReport {
            outcome,
            counts: self.counts.snapshot(),
            frames: self.counts.frame_snapshot(),
        };
        info!(
            outcome = report.outcome.label(),
            sources = report.counts.len(),
            "Run finished"
        );
        report
    }

    /// Best effort: a failed dump is logged and the run continues.
    fn dump_topology(&self) {
        if let Some(dir) = &self.dot_dump_dir {
            match write_dot(dir, &self.graph) {
                Ok(path) => info!(path = %path.display(), "Wrote pipeline topology"),
                Err(e) => warn!(dir = %dir.display(), %e, "Could not write pipeline topology"),
            }
        }
        if let Err(e) = self.event_loop.backend().dump_topology(DOT_FILE_STEM) {
            warn!(%e, "Backend topology dump failed");
        }
    }
}

fn write_dot(dir: &Path, graph: &Graph) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(MODEL_DOT_FILE);
    fs::write(&path, graph.to_dot())?;
    Ok(path)
}

// ─── Report ─────────────────────────────────────────────────────────────────

/// What a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: StopReason,
    /// Objects counted per source index.
    pub counts: BTreeMap<u32, u64>,
    /// Frames observed per source index.
    pub frames: BTreeMap<u32, u64>,
}

#[derive(Serialize)]
struct ReportJson<'a> {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<u8>,
    counts: &'a BTreeMap<u32, u64>,
    frames: &'a BTreeMap<u32, u64>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StopReason::EndOfStream)
    }

    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> u8 {
        match &self.outcome {
            StopReason::EndOfStream => 0,
            StopReason::Interrupted => INTERRUPTED_EXIT_CODE,
            StopReason::Error(e) => e.error_code(),
        }
    }

    /// Counts as `{0: 10, 1: 0}`.
    pub fn format_counts(&self) -> String {
        let body = self
            .counts
            .iter()
            .map(|(source, count)| format!("{source}: {count}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{body}}}")
    }

    pub fn to_json(&self) -> serde_json::Value {
        let (error, error_code) = match &self.outcome {
            StopReason::Error(e) => (Some(e.to_string()), Some(e.error_code())),
            _ => (None, None),
        };
        let doc = ReportJson {
            outcome: self.outcome.label(),
            error,
            error_code,
            counts: &self.counts,
            frames: &self.frames,
        };
        serde_json::to_value(doc).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::error::VigilError;

    fn report(outcome: StopReason, counts: &[(u32, u64)]) -> RunReport {
        RunReport {
            outcome,
            counts: counts.iter().copied().collect(),
            frames: BTreeMap::new(),
        }
    }

    #[test]
    fn counts_render_like_a_map_literal() {
        assert_eq!(
            report(StopReason::EndOfStream, &[(0, 10), (1, 0)]).format_counts(),
            "{0: 10, 1: 0}"
        );
        assert_eq!(report(StopReason::EndOfStream, &[]).format_counts(), "{}");
    }

    #[test]
    fn exit_codes_follow_outcome() {
        assert_eq!(report(StopReason::EndOfStream, &[]).exit_code(), 0);
        assert_eq!(report(StopReason::Interrupted, &[]).exit_code(), 130);
        let failed = report(StopReason::Error(VigilError::ChannelClosed), &[]);
        assert_eq!(failed.exit_code(), VigilError::ChannelClosed.error_code());
        assert!(!failed.is_success());
    }

    #[test]
    fn json_report_carries_outcome_and_counts() {
        let json = report(StopReason::EndOfStream, &[(0, 10), (1, 0)]).to_json();
        assert_eq!(json["outcome"], "end_of_stream");
        assert_eq!(json["counts"]["0"], 10);
        assert_eq!(json["counts"]["1"], 0);
        assert!(json.get("error").is_none());

        let json = report(
            StopReason::Error(VigilError::Backend("boom".into())),
            &[(0, 3)],
        )
        .to_json();
        assert_eq!(json["outcome"], "error");
        assert!(json["error"].as_str().is_some_and(|e| e.contains("boom")));
        assert_eq!(json["error_code"], 40);
    }
}
