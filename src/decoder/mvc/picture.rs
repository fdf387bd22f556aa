// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use crate::decoder::mvc::MvcContext;
use crate::decoder::mvc::SurfaceInfo;
use crate::decoder::PictureMemory;
use crate::decoder::ViewHandle;

/// A base view surface and the extra view surface of the same frame order.
///
/// Shared between the decoder's output queue and the client through an `Arc`; both surfaces go
/// back to the pool when the last reference is dropped.
#[derive(Debug)]
pub struct MvcPicture {
    base: SurfaceInfo,
    extra: SurfaceInfo,
    context: Arc<MvcContext>,
}

impl MvcPicture {
    pub(super) fn new(base: SurfaceInfo, extra: SurfaceInfo, context: Arc<MvcContext>) -> Self {
        debug_assert_eq!(base.info.view_id, 0);
        debug_assert_ne!(extra.info.view_id, 0);
        debug_assert_eq!(base.meta.frame_order, extra.meta.frame_order);

        Self {
            base,
            extra,
            context,
        }
    }

    pub fn base_view(&self) -> &SurfaceInfo {
        &self.base
    }

    pub fn extra_view(&self) -> &SurfaceInfo {
        &self.extra
    }

    pub fn frame_order(&self) -> u32 {
        self.base.meta.frame_order
    }

    /// Where the frames of both views live.
    pub fn memory(&self) -> PictureMemory {
        self.context.memory()
    }

    /// Gives access to the frames of both views, through the pool they were decoded in.
    pub fn map_views(&self) -> (Option<ViewHandle>, Option<ViewHandle>) {
        (
            self.context.map_view(self.base.mem_id),
            self.context.map_view(self.extra.mem_id),
        )
    }

    pub fn unmap_views(&self, base: Option<ViewHandle>, extra: Option<ViewHandle>) {
        if let Some(view) = base {
            self.context.unmap_view(self.base.mem_id, view);
        }
        if let Some(view) = extra {
            self.context.unmap_view(self.extra.mem_id, view);
        }
    }

    /// Signals that both views are being displayed.
    pub fn mark_render(&self) {
        self.context.mark_render(self.base.id);
        self.context.mark_render(self.extra.id);
    }
}

impl Drop for MvcPicture {
    fn drop(&mut self) {
        self.context.release_buffer(self.base.id);
        self.context.release_buffer(self.extra.id);
    }
}
