//! Raw FFI mirrors of the DeepStream batch metadata (`nvdsmeta.h`).
//!
//! Only the leading fields that the collector reads are mirrored.  These
//! structs are never constructed or sized on the Rust side; they are only
//! read through pointers handed out by `libnvdsgst_meta`, so a truncated
//! layout is sound as long as the mirrored prefix matches the headers.
//!
//! # Linking
//!
//! `build.rs` adds the DeepStream library directory to the search path.

#![allow(non_camel_case_types, non_snake_case, dead_code)]

use std::ffi::c_void;
use std::marker::PhantomData;
use std::os::raw::{c_float, c_int, c_uint};

use gstreamer::glib::ffi::GList;

pub type NvDsMetaType = c_int;

#[repr(C)]
pub struct NvDsBaseMeta {
    pub batch_meta: *mut NvDsBatchMeta,
    pub meta_type: NvDsMetaType,
    pub uContext: *mut c_void,
    pub copy_func: *mut c_void,
    pub release_func: *mut c_void,
}

#[repr(C)]
pub struct NvDsBatchMeta {
    pub base_meta: NvDsBaseMeta,
    pub max_frames_in_batch: c_uint,
    pub num_frames_in_batch: c_uint,
    pub frame_meta_pool: *mut c_void,
    pub obj_meta_pool: *mut c_void,
    pub classifier_meta_pool: *mut c_void,
    pub display_meta_pool: *mut c_void,
    pub user_meta_pool: *mut c_void,
    pub label_info_meta_pool: *mut c_void,
    pub frame_meta_list: *mut GList,
    pub batch_user_meta_list: *mut GList,
    // GRecMutex and reserved fields follow.
}

#[repr(C)]
pub struct NvDsFrameMeta {
    pub base_meta: NvDsBaseMeta,
    pub pad_index: c_uint,
    pub batch_id: c_uint,
    pub frame_num: c_int,
    pub buf_pts: u64,
    pub ntp_timestamp: u64,
    pub source_id: c_uint,
    pub num_surfaces_per_frame: c_int,
    pub source_frame_width: c_uint,
    pub source_frame_height: c_uint,
    pub surface_type: c_uint,
    pub surface_index: c_uint,
    pub num_obj_meta: c_uint,
    pub bInferDone: c_int,
    pub obj_meta_list: *mut GList,
    // display, classifier and user meta lists follow.
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NvBbox_Coords {
    pub left: c_float,
    pub top: c_float,
    pub width: c_float,
    pub height: c_float,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NvDsComp_BboxInfo {
    pub org_bbox_coords: NvBbox_Coords,
}

#[repr(C)]
pub struct NvDsObjectMeta {
    pub base_meta: NvDsBaseMeta,
    pub parent: *mut NvDsObjectMeta,
    pub unique_component_id: c_int,
    pub class_id: c_int,
    pub object_id: u64,
    pub detector_bbox_info: NvDsComp_BboxInfo,
    pub tracker_bbox_info: NvDsComp_BboxInfo,
    pub confidence: c_float,
    pub tracker_confidence: c_float,
    // rect/text params and the remaining lists follow.
}

#[link(name = "nvdsgst_meta")]
#[link(name = "nvds_meta")]
extern "C" {
    /// Batch metadata attached to a `GstBuffer`, or null.
    pub fn gst_buffer_get_nvds_batch_meta(buffer: *mut c_void) -> *mut NvDsBatchMeta;
}

/// Borrowing iterator over a `GList` whose `data` pointers are `T`.
///
/// Null `data` entries are skipped.
pub struct GListIter<'a, T> {
    node: *const GList,
    _marker: PhantomData<&'a T>,
}

impl<'a, T> GListIter<'a, T> {
    /// # Safety
    ///
    /// `head` must be null or the head of a well-formed list whose nodes and
    /// `T` payloads stay valid and unmodified for `'a`.
    pub unsafe fn new(head: *const GList) -> Self {
        Self {
            node: head,
            _marker: PhantomData,
        }
    }
}

impl<'a, T> Iterator for GListIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        while !self.node.is_null() {
            // SAFETY: non-null nodes are valid for 'a per `new`'s contract.
            let node = unsafe { &*self.node };
            self.node = node.next;
            if !node.data.is_null() {
                // SAFETY: payloads are `T` and valid for 'a per `new`'s contract.
                return Some(unsafe { &*(node.data as *const T) });
            }
        }
        None
    }
}
