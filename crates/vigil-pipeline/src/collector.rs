//! Per-source object counting from overlay-input buffer probes.
//!
//! One [`MetadataCollector`] is attached to the input pad of every per-source
//! overlay stage.  By that point a buffer has passed inference and tracking,
//! so its batch metadata is complete.  The collector only reads: it always
//! returns [`ProbeReturn::Pass`].
//!
//! # Concurrency
//!
//! Collectors run on the backend's streaming threads, one chain each.  The
//! [`CountTable`] map is only write-locked to insert a source's counters the
//! first time that source is observed; every later update is a relaxed
//! atomic add on counters the collector has cached, so concurrent sources
//! never contend and no update is lost.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::trace;

use vigil_core::backend::{BufferProbe, ProbeReturn};
use vigil_core::metadata::BatchBuffer;

/// Counters for one source index.
#[derive(Debug, Default)]
pub struct SourceCounters {
    objects: AtomicU64,
    frames: AtomicU64,
}

impl SourceCounters {
    pub fn objects(&self) -> u64 {
        self.objects.load(Ordering::Acquire)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }
}

/// Aggregate object counts keyed by source index.
///
/// Keys appear lazily on first observation and are never reset during a run.
#[derive(Clone, Debug, Default)]
pub struct CountTable {
    inner: Arc<RwLock<BTreeMap<u32, Arc<SourceCounters>>>>,
}

impl CountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `source`, inserting zeroed ones if absent.
    pub fn entry(&self, source: u32) -> Arc<SourceCounters> {
        if let Some(counters) = self.inner.read().get(&source) {
            return Arc::clone(counters);
        }
        Arc::clone(self.inner.write().entry(source).or_default())
    }

    pub fn get(&self, source: u32) -> Option<u64> {
        self.inner.read().get(&source).map(|c| c.objects())
    }

    pub fn contains(&self, source: u32) -> bool {
        self.inner.read().contains_key(&source)
    }

    /// Object counts per observed source.
    pub fn snapshot(&self) -> BTreeMap<u32, u64> {
        self.inner
            .read()
            .iter()
            .map(|(source, c)| (*source, c.objects()))
            .collect()
    }

    /// Frames observed per source.
    pub fn frame_snapshot(&self) -> BTreeMap<u32, u64> {
        self.inner
            .read()
            .iter()
            .map(|(source, c)| (*source, c.frames()))
            .collect()
    }
}

/// Read-only buffer observer for one per-source chain.
#[derive(Debug)]
pub struct MetadataCollector {
    source: u32,
    table: CountTable,
    counters: OnceLock<Arc<SourceCounters>>,
}

impl MetadataCollector {
    pub fn new(source: u32, table: CountTable) -> Self {
        Self {
            source,
            table,
            counters: OnceLock::new(),
        }
    }

    pub fn source(&self) -> u32 {
        self.source
    }

    /// Count the objects of every frame in `buffer`.
    pub fn observe(&self, buffer: &dyn BatchBuffer) -> ProbeReturn {
        let Some(frames) = buffer.batch_meta() else {
            trace!(source = self.source, "Buffer without batch metadata");
            return ProbeReturn::Pass;
        };

        for frame in frames {
            let counters = self
                .counters
                .get_or_init(|| self.table.entry(self.source));
            let objects = frame.into_objects().count() as u64;
            counters.frames.fetch_add(1, Ordering::Relaxed);
            counters.objects.fetch_add(objects, Ordering::Release);
        }
        ProbeReturn::Pass
    }

    /// Wrap this collector as a backend buffer probe.
    pub fn probe(self: &Arc<Self>) -> BufferProbe {
        let this = Arc::clone(self);
        Arc::new(move |buffer: &dyn BatchBuffer| this.observe(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::metadata::{BatchFrames, FrameMeta, ObjectMeta};

    /// Buffer whose batch holds one frame per entry of `objects`.
    struct TestBuffer {
        objects: Option<Vec<u64>>,
    }

    impl BatchBuffer for TestBuffer {
        fn batch_meta(&self) -> Option<BatchFrames<'_>> {
            let objects = self.objects.as_ref()?;
            Some(BatchFrames::new(objects.iter().enumerate().map(
                |(i, &n)| {
                    FrameMeta::new(
                        0,
                        0,
                        i as i32,
                        (0..n).map(|object_id| ObjectMeta {
                            class_id: 2,
                            object_id,
                            confidence: 0.9,
                        }),
                    )
                },
            )))
        }
    }

    #[test]
    fn counts_every_object_of_every_frame() {
        let table = CountTable::new();
        let collector = MetadataCollector::new(0, table.clone());
        let buffer = TestBuffer {
            objects: Some(vec![2, 0, 3]),
        };
        assert_eq!(collector.observe(&buffer), ProbeReturn::Pass);
        assert_eq!(table.get(0), Some(5));
        assert_eq!(table.frame_snapshot().get(&0), Some(&3));
    }

    #[test]
    fn missing_metadata_is_skipped_without_creating_key() {
        let table = CountTable::new();
        let collector = MetadataCollector::new(4, table.clone());
        assert_eq!(
            collector.observe(&TestBuffer { objects: None }),
            ProbeReturn::Pass
        );
        assert!(!table.contains(4));
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn empty_frames_create_zero_entry() {
        let table = CountTable::new();
        let collector = MetadataCollector::new(1, table.clone());
        collector.observe(&TestBuffer {
            objects: Some(vec![0, 0]),
        });
        assert_eq!(table.snapshot(), BTreeMap::from([(1, 0)]));
    }

    #[test]
    fn concurrent_sources_lose_no_updates() {
        let table = CountTable::new();
        let handles: Vec<_> = (0..4u32)
            .map(|source| {
                let probe = Arc::new(MetadataCollector::new(source, table.clone())).probe();
                std::thread::spawn(move || {
                    let buffer = TestBuffer {
                        objects: Some(vec![1; 10]),
                    };
                    for _ in 0..250 {
                        assert_eq!(probe(&buffer), ProbeReturn::Pass);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("collector thread");
        }
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 4);
        assert!(snapshot.values().all(|&count| count == 2_500));
    }

    #[test]
    fn shared_key_accumulates_monotonically() {
        let table = CountTable::new();
        let a = MetadataCollector::new(0, table.clone());
        let buffer = TestBuffer {
            objects: Some(vec![1]),
        };
        let mut last = 0;
        for _ in 0..5 {
            a.observe(&buffer);
            let now = table.get(0).expect("key present");
            assert!(now > last);
            last = now;
        }
    }
}
