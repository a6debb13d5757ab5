//! Per-buffer inference metadata as seen by buffer probes.
//!
//! A batched buffer carries one [`FrameMeta`] per frame in the batch and each
//! frame carries the objects detected (and possibly tracked) in it.  Both
//! levels are exposed as consuming iterators: a traversal is lazy, finite and
//! single-pass, and cannot be restarted once drained.

use std::fmt;

/// One detected or tracked entity within a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObjectMeta {
    pub class_id: i32,
    pub object_id: u64,
    pub confidence: f32,
}

/// One frame of a batch, with a lazy traversal over its objects.
pub struct FrameMeta<'a> {
    /// Batch-region input pad the frame entered through.
    pub pad_index: u32,
    pub source_id: u32,
    pub frame_num: i32,
    objects: Box<dyn Iterator<Item = ObjectMeta> + 'a>,
}

impl<'a> FrameMeta<'a> {
    pub fn new(
        pad_index: u32,
        source_id: u32,
        frame_num: i32,
        objects: impl Iterator<Item = ObjectMeta> + 'a,
    ) -> Self {
        Self {
            pad_index,
            source_id,
            frame_num,
            objects: Box::new(objects),
        }
    }

    /// Consume the frame, yielding its objects once.
    pub fn into_objects(self) -> impl Iterator<Item = ObjectMeta> + 'a {
        self.objects
    }
}

impl fmt::Debug for FrameMeta<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameMeta")
            .field("pad_index", &self.pad_index)
            .field("source_id", &self.source_id)
            .field("frame_num", &self.frame_num)
            .finish_non_exhaustive()
    }
}

/// Lazy traversal over the frames of one batched buffer.
pub struct BatchFrames<'a> {
    inner: Box<dyn Iterator<Item = FrameMeta<'a>> + 'a>,
}

impl<'a> BatchFrames<'a> {
    pub fn new(frames: impl Iterator<Item = FrameMeta<'a>> + 'a) -> Self {
        Self {
            inner: Box::new(frames),
        }
    }
}

impl<'a> Iterator for BatchFrames<'a> {
    type Item = FrameMeta<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// A buffer observed by a probe.
pub trait BatchBuffer {
    /// Batch-level metadata attached upstream, or `None` if the buffer
    /// carries none.
    fn batch_meta(&self) -> Option<BatchFrames<'_>>;
}
