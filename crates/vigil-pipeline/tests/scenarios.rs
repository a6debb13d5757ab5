use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use vigil_core::backend::{PadRef, PropertyValue, StageBackend, StageKind};
use vigil_core::config::PipelineConfig;
use vigil_core::error::VigilError;
use vigil_pipeline::{
    DOT_FILE_STEM, LinkMode, MODEL_DOT_FILE, Pipeline, SimBackend, SimFrame, SimScript,
    SourceScript, StopReason,
};

const TRACKER_INI: &str = "\
[tracker]
tracker-width=640
tracker-height=384
gpu-id=0
ll-lib-file=/opt/nvidia/deepstream/lib/libnvds_nvmultiobjecttracker.so
ll-config-file=config_tracker_NvDCF_perf.yml
enable-batch-process=1
";

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "vigil_pipeline_{label}_{}_{}",
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn config_with_tracker(label: &str, sources: u32, tracker_ini: &str) -> PipelineConfig {
    let dir = unique_temp_dir(label);
    let tracker = dir.join("tracker.txt");
    fs::write(&tracker, tracker_ini).expect("write tracker config");
    PipelineConfig {
        source_count: sources,
        media_path: PathBuf::from("/data/sample_720p.mp4"),
        tracker_config_path: tracker,
        ..PipelineConfig::default()
    }
}

fn config(label: &str, sources: u32) -> PipelineConfig {
    config_with_tracker(label, sources, TRACKER_INI)
}

fn backend(script: SimScript) -> (Arc<SimBackend>, Arc<dyn StageBackend>) {
    let sim = Arc::new(SimBackend::new(script));
    let backend: Arc<dyn StageBackend> = sim.clone();
    (sim, backend)
}

// ─── Construction ───────────────────────────────────────────────────────────

#[test]
fn builds_one_chain_per_source_around_one_batch_region() {
    for n in [1u32, 2, 4] {
        let (sim, backend) = backend(SimScript::default());
        let pipeline = Pipeline::build(backend, &config("topology", n)).expect("build");
        let graph = pipeline.graph();

        assert_eq!(graph.chain_count(), n as usize);
        for kind in [
            StageKind::ContainerDemux,
            StageKind::StreamParser,
            StageKind::Decoder,
            StageKind::Queue,
            StageKind::Converter,
            StageKind::Overlay,
            StageKind::Sink,
        ] {
            assert_eq!(graph.nodes_of_kind(kind).count(), n as usize, "{kind}");
        }
        for kind in [
            StageKind::StreamMux,
            StageKind::Inference,
            StageKind::Tracker,
            StageKind::StreamDemux,
        ] {
            assert_eq!(graph.nodes_of_kind(kind).count(), 1, "{kind}");
        }

        for i in 0..n {
            let mux_in = PadRef::new("nvstreammux", format!("sink_{i}"));
            let demux_out = PadRef::new("streamdemux", format!("src_{i}"));
            assert!(sim.is_linked(&PadRef::src(format!("decoder-{i}")), &mux_in));
            assert!(sim.is_linked(&demux_out, &PadRef::sink(format!("queue-{i}"))));
            assert!(graph.has_link(
                &PadRef::new(format!("qtdemux-{i}"), "video_0"),
                &PadRef::sink(format!("h264-parser-{i}"))
            ));
        }
        let dynamic = graph
            .links()
            .iter()
            .filter(|l| l.mode == LinkMode::Dynamic)
            .count();
        assert_eq!(dynamic, n as usize);
        assert_eq!(
            sim.property("nvstreammux", "batch-size"),
            Some(PropertyValue::UInt(u64::from(n)))
        );
        assert_eq!(pipeline.collectors().len(), n as usize);
    }
}

#[test]
fn batch_region_is_configured_from_config() {
    let (sim, backend) = backend(SimScript::default());
    let cfg = config("props", 2);
    let _pipeline = Pipeline::build(backend, &cfg).expect("build");

    assert_eq!(
        sim.property("nvstreammux", "width"),
        Some(PropertyValue::UInt(1920))
    );
    assert_eq!(
        sim.property("nvstreammux", "height"),
        Some(PropertyValue::UInt(1080))
    );
    assert_eq!(
        sim.property("nvstreammux", "batched-push-timeout"),
        Some(PropertyValue::UInt(4_000_000))
    );
    assert_eq!(
        sim.property("primary-inference", "config-file-path"),
        Some(PropertyValue::Str("./models/pgie/pgie.txt".into()))
    );
    for i in 0..2 {
        assert_eq!(
            sim.property(&format!("file-source-{i}"), "location"),
            Some(PropertyValue::Str("/data/sample_720p.mp4".into()))
        );
        assert_eq!(sim.property(&format!("sink-{i}"), "sync"), None);
    }
}

#[test]
fn sync_flag_sets_sync_on_every_sink() {
    let (sim, backend) = backend(SimScript::default());
    let cfg = PipelineConfig {
        sync_sinks: true,
        ..config("sync", 3)
    };
    Pipeline::build(backend, &cfg).expect("build");
    for i in 0..3 {
        assert_eq!(
            sim.property(&format!("sink-{i}"), "sync"),
            Some(PropertyValue::Bool(true))
        );
    }
}

#[test]
fn tracker_properties_only_for_keys_present_in_file() {
    let ini = "[tracker]\ntracker-width=640\nll-lib-file=libtracker.so\n";
    let (sim, backend) = backend(SimScript::default());
    Pipeline::build(backend, &config_with_tracker("tracker_subset", 1, ini)).expect("build");

    assert_eq!(
        sim.property("tracker", "tracker-width"),
        Some(PropertyValue::Int(640))
    );
    assert_eq!(
        sim.property("tracker", "ll-lib-file"),
        Some(PropertyValue::Str("libtracker.so".into()))
    );
    assert_eq!(sim.property("tracker", "gpu_id"), None);
    assert_eq!(sim.property("tracker", "tracker-height"), None);
}

#[test]
fn disabled_tracker_links_inference_straight_to_demux() {
    let (sim, backend) = backend(SimScript::default());
    let cfg = PipelineConfig {
        tracker_enabled: false,
        tracker_config_path: PathBuf::from("/nonexistent/tracker.txt"),
        ..config("no_tracker", 2)
    };
    let pipeline = Pipeline::build(backend, &cfg).expect("build without tracker file");

    assert!(sim.stages_of_kind(StageKind::Tracker).is_empty());
    assert!(pipeline.graph().node("tracker").is_none());
    assert!(sim.is_linked(
        &PadRef::src("primary-inference"),
        &PadRef::sink("streamdemux")
    ));
}

#[test]
fn unsupported_stage_kind_fails_before_anything_runs() {
    let (sim, backend) = backend(SimScript {
        unsupported: vec![StageKind::Decoder],
        ..SimScript::default()
    });
    let err = match Pipeline::build(backend, &config("unsupported", 2)) {
        Ok(_) => panic!("build must fail without a decoder"),
        Err(e) => e,
    };
    match &err {
        VigilError::StageCreation { kind, name, .. } => {
            assert_eq!(*kind, StageKind::Decoder);
            assert_eq!(name, "decoder-0");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.error_code(), 10);
    assert_eq!(sim.stop_calls(), 0);
    assert_eq!(sim.delivered(0), 0);
}

#[test]
fn refused_static_link_names_the_link() {
    let (sim, backend) = backend(SimScript {
        fail_link_into: vec!["osd-1".into()],
        ..SimScript::default()
    });
    let err = Pipeline::build(backend, &config("static_refused", 2))
        .err()
        .expect("must fail");
    match &err {
        VigilError::StaticLink { from, to, .. } => {
            assert_eq!(from, "nvvideoconvert-1.src");
            assert_eq!(to, "osd-1.sink");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_construction());
    assert_eq!(sim.stop_calls(), 0);
}

#[test]
fn missing_tracker_file_is_a_construction_error() {
    let (_sim, backend) = backend(SimScript::default());
    let cfg = PipelineConfig {
        tracker_config_path: PathBuf::from("/nonexistent/vigil/tracker.txt"),
        ..config("missing_tracker", 1)
    };
    let err = Pipeline::build(backend, &cfg).err().expect("must fail");
    assert_eq!(err.error_code(), 21);
}

#[test]
fn zero_sources_is_rejected() {
    let (sim, backend) = backend(SimScript::default());
    let err = Pipeline::build(backend, &config("zero", 0))
        .err()
        .expect("must fail");
    assert!(matches!(err, VigilError::InvalidConfig(_)));
    assert_eq!(sim.stage_count(), 0);
}

// ─── Runs ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_source_counts_every_object() {
    let (sim, backend) = backend(SimScript::with_sources(vec![SourceScript::uniform(10, 1)]));
    let pipeline = Pipeline::build(backend, &config("single", 1)).expect("build");
    let report = pipeline.run(CancellationToken::new()).await;

    assert!(matches!(report.outcome, StopReason::EndOfStream));
    assert_eq!(report.counts, BTreeMap::from([(0, 10)]));
    assert_eq!(report.frames, BTreeMap::from([(0, 10)]));
    assert_eq!(report.format_counts(), "{0: 10}");
    assert_eq!(report.exit_code(), 0);
    assert_eq!(sim.stop_calls(), 1);
}

#[tokio::test]
async fn source_without_detections_reports_zero() {
    let (_sim, backend) = backend(SimScript::with_sources(vec![
        SourceScript::uniform(5, 2),
        SourceScript::uniform(5, 0),
    ]));
    let pipeline = Pipeline::build(backend, &config("two", 2)).expect("build");
    let report = pipeline.run(CancellationToken::new()).await;

    assert!(report.is_success());
    assert_eq!(report.format_counts(), "{0: 10, 1: 0}");
}

#[tokio::test]
async fn many_sources_count_independently() {
    let scripts: Vec<_> = (0..4u32)
        .map(|i| SourceScript::uniform(25, i).with_interval(Duration::from_millis(1)))
        .collect();
    let (_sim, backend) = backend(SimScript::with_sources(scripts));
    let report = Pipeline::build(backend, &config("four", 4))
        .expect("build")
        .run(CancellationToken::new())
        .await;

    assert!(report.is_success());
    assert_eq!(
        report.counts,
        BTreeMap::from([(0, 0), (1, 25), (2, 50), (3, 75)])
    );
}

#[tokio::test]
async fn auxiliary_pads_do_not_disturb_linking() {
    let (_sim, backend) = backend(SimScript::with_sources(vec![SourceScript::uniform(5, 2)
        .with_extra_pad("audio_0")
        .with_extra_pad("subtitle_0")]));
    let report = Pipeline::build(backend, &config("aux", 1))
        .expect("build")
        .run(CancellationToken::new())
        .await;
    assert!(report.is_success());
    assert_eq!(report.counts, BTreeMap::from([(0, 10)]));
}

#[tokio::test]
async fn collectors_pass_every_buffer_and_skip_missing_metadata() {
    let (sim, backend) = backend(SimScript::with_sources(vec![SourceScript {
        frames: vec![SimFrame::Objects(2), SimFrame::NoMeta, SimFrame::Objects(1)],
        ..SourceScript::default()
    }]));
    let report = Pipeline::build(backend, &config("nometa", 1))
        .expect("build")
        .run(CancellationToken::new())
        .await;

    assert_eq!(report.counts, BTreeMap::from([(0, 3)]));
    assert_eq!(report.frames, BTreeMap::from([(0, 2)]));
    assert_eq!(sim.delivered(0), 3);
}

#[tokio::test]
async fn warnings_do_not_stop_the_run() {
    let (_sim, backend) = backend(SimScript {
        warning_after: Some((0, 2)),
        ..SimScript::with_sources(vec![SourceScript::uniform(4, 1)])
    });
    let report = Pipeline::build(backend, &config("warning", 1))
        .expect("build")
        .run(CancellationToken::new())
        .await;
    assert!(report.is_success());
    assert_eq!(report.counts, BTreeMap::from([(0, 4)]));
}

#[tokio::test]
async fn runtime_error_keeps_partial_counts() {
    let (sim, backend) = backend(SimScript {
        error_after: Some((0, 4)),
        ..SimScript::with_sources(vec![SourceScript::uniform(10, 2)])
    });
    let report = Pipeline::build(backend, &config("runtime_error", 1))
        .expect("build")
        .run(CancellationToken::new())
        .await;

    match &report.outcome {
        StopReason::Error(VigilError::Runtime { stage, .. }) => assert_eq!(stage, "decoder-0"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(report.counts, BTreeMap::from([(0, 8)]));
    assert_eq!(report.exit_code(), 31);
    assert_eq!(sim.stop_calls(), 1);
}

#[tokio::test]
async fn refused_dynamic_link_stops_with_error() {
    let (_sim, backend) = backend(SimScript {
        fail_link_into: vec!["h264-parser-1".into()],
        ..SimScript::with_sources(vec![
            SourceScript::uniform(3, 1),
            SourceScript::uniform(3, 1),
        ])
    });
    let report = Pipeline::build(backend, &config("link_refused", 2))
        .expect("build")
        .run(CancellationToken::new())
        .await;

    match &report.outcome {
        StopReason::Error(VigilError::DynamicLink { demuxer, .. }) => {
            assert_eq!(demuxer, "qtdemux-1")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(report.exit_code(), 30);
    assert!(!report.counts.contains_key(&1));
}

#[tokio::test]
async fn never_announced_video_pad_does_not_block_eos() {
    let (_sim, backend) = backend(SimScript::with_sources(vec![
        SourceScript::uniform(6, 1),
        SourceScript::without_video().with_extra_pad("audio_0"),
    ]));
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        Pipeline::build(backend, &config("no_video", 2))
            .expect("build")
            .run(CancellationToken::new()),
    )
    .await
    .expect("run must finish");

    assert!(report.is_success());
    assert_eq!(report.counts, BTreeMap::from([(0, 6)]));
}

#[tokio::test]
async fn cancellation_interrupts_and_still_reports() {
    let (sim, backend) = backend(SimScript::with_sources(vec![SourceScript::uniform(
        10_000, 1,
    )
    .with_interval(Duration::from_millis(5))]));
    let pipeline = Pipeline::build(backend, &config("interrupt", 1)).expect("build");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = pipeline.run(cancel).await;
    assert!(matches!(report.outcome, StopReason::Interrupted));
    assert_eq!(report.exit_code(), 130);
    assert!(report.counts.get(&0).copied().unwrap_or(0) < 10_000);
    assert_eq!(sim.stop_calls(), 1);
}

#[tokio::test]
async fn topology_is_dumped_once_playing() {
    let dir = unique_temp_dir("dot");
    let (sim, backend) = backend(SimScript::with_sources(vec![SourceScript::uniform(1, 1)]));
    let cfg = PipelineConfig {
        dot_dump_dir: Some(dir.clone()),
        ..config("dot_cfg", 1)
    };
    let report = Pipeline::build(backend, &cfg)
        .expect("build")
        .run(CancellationToken::new())
        .await;
    assert!(report.is_success());

    let dot = fs::read_to_string(dir.join(MODEL_DOT_FILE)).expect("dot file");
    assert!(dot.contains("\"nvstreammux\" -> \"primary-inference\""));
    assert!(dot.contains("style=dashed"));
    assert_eq!(sim.topology_dumps(), vec![DOT_FILE_STEM.to_string()]);
}
