// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Descriptions of the frames exchanged between the allocators, the decode engine and the
//! decoder.

use std::fmt;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitflags::bitflags;

use crate::DecodedFormat;
use crate::Fourcc;
use crate::Resolution;

pub const Y_PLANE: usize = 0;
pub const UV_PLANE: usize = 1;

/// Opaque identifier of a frame owned by a frame allocator.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemId(u64);

impl MemId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for MemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemId({:#x})", self.0)
    }
}

/// Geometry and identity of a frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub fourcc: Fourcc,
    /// Allocated (coded) width.
    pub width: u32,
    /// Allocated (coded) height.
    pub height: u32,
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_w: u32,
    pub crop_h: u32,
    /// Sample aspect ratio. Zero when unknown.
    pub aspect_ratio_w: u16,
    pub aspect_ratio_h: u16,
    pub frame_rate_n: u32,
    pub frame_rate_d: u32,
    /// 0 for the base view, anything else for a non-base view.
    pub view_id: u16,
}

impl FrameInfo {
    pub fn new(format: DecodedFormat, coded: Resolution, visible: Resolution) -> Self {
        Self {
            fourcc: format.fourcc(),
            width: coded.width,
            height: coded.height,
            crop_w: visible.width,
            crop_h: visible.height,
            ..Default::default()
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct FrameDataFlags: u16 {
        /// The timestamp was copied from the bitstream rather than interpolated.
        const ORIGINAL_TIMESTAMP = 0x0001;
    }
}

/// Per-picture data written by the engine when a frame is decoded.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    pub frame_order: u32,
    pub timestamp: Option<u64>,
    pub flags: FrameDataFlags,
}

impl FrameMetadata {
    /// Timestamp of the frame, if it came from the bitstream.
    pub fn original_timestamp(&self) -> Option<u64> {
        if self.flags.contains(FrameDataFlags::ORIGINAL_TIMESTAMP) {
            self.timestamp
        } else {
            None
        }
    }
}

/// Lock counter of a surface, shared between the decoder and the engine.
///
/// The engine holds a lock while it still references the surface, e.g. as a reference frame.
#[derive(Clone, Debug, Default)]
pub struct SurfaceLock(Arc<AtomicU16>);

impl SurfaceLock {
    pub fn lock(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock(&self) {
        // Saturate so that a spurious unlock cannot wrap the counter around.
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }
}

/// A decode target handed to the engine.
#[derive(Clone, Debug)]
pub struct WorkSurface {
    pub mem_id: MemId,
    pub info: FrameInfo,
    pub lock: SurfaceLock,
}

/// A surface returned by the engine once decoding has been scheduled into it.
#[derive(Clone, Debug)]
pub struct DecodedSurface {
    pub mem_id: MemId,
    pub info: FrameInfo,
    pub meta: FrameMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_lock_is_shared() {
        let lock = SurfaceLock::default();
        let engine_side = lock.clone();
        engine_side.lock();
        assert!(lock.is_locked());
        engine_side.unlock();
        assert!(!lock.is_locked());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn timestamp_needs_original_flag() {
        let mut meta = FrameMetadata {
            frame_order: 3,
            timestamp: Some(40),
            flags: FrameDataFlags::empty(),
        };
        assert_eq!(meta.original_timestamp(), None);
        meta.flags |= FrameDataFlags::ORIGINAL_TIMESTAMP;
        assert_eq!(meta.original_timestamp(), Some(40));
    }
}
