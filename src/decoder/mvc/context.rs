// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pool of decode surfaces shared by the decoder and the pictures it hands out.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;

use crate::allocator::general::GeneralAllocator;
use crate::allocator::FrameAllocResponse;
use crate::allocator::FrameAllocator;
use crate::backend::SyncPoint;
use crate::decoder::mvc::MvcPicture;
use crate::decoder::PictureMemory;
use crate::decoder::ViewHandle;
use crate::video_frame::DecodedSurface;
use crate::video_frame::FrameInfo;
use crate::video_frame::FrameMetadata;
use crate::video_frame::MemId;
use crate::video_frame::SurfaceLock;
use crate::video_frame::WorkSurface;

/// Index of a surface within its [`MvcContext`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceId(usize);

/// Copy of the state of a surface at the time it was queued.
#[derive(Clone, Debug)]
pub struct SurfaceInfo {
    pub id: SurfaceId,
    pub mem_id: MemId,
    pub info: FrameInfo,
    pub meta: FrameMetadata,
}

#[derive(Debug)]
struct MvcBuffer {
    mem_id: MemId,
    info: FrameInfo,
    meta: FrameMetadata,
    /// Held by the engine while it still needs the surface.
    lock: SurfaceLock,
    /// Returned by the engine and waiting for pairing, or part of a picture.
    queued: bool,
    /// Being displayed.
    render: bool,
    sync: Option<SyncPoint>,
}

impl MvcBuffer {
    fn is_free(&self) -> bool {
        !self.lock.is_locked() && !self.queued && !self.render
    }

    fn snapshot(&self, id: SurfaceId) -> SurfaceInfo {
        SurfaceInfo {
            id,
            mem_id: self.mem_id,
            info: self.info,
            meta: self.meta,
        }
    }
}

/// Frames backing the surfaces, and the allocator they came from.
#[derive(Debug)]
struct PoolFrames {
    allocator: Arc<Mutex<GeneralAllocator>>,
    response: FrameAllocResponse,
    sysmem: bool,
}

/// Owns the decode surfaces and tracks which of them are free.
///
/// Surfaces are never destroyed while the context lives: released surfaces return to the free
/// set. The frames behind them are freed when the context is dropped, that is once the decoder and
/// every picture handed out from this pool have let go of it. All operations take the pool lock for
/// their own duration only.
#[derive(Debug, Default)]
pub struct MvcContext {
    buffers: Mutex<Vec<MvcBuffer>>,
    frames: OnceLock<PoolFrames>,
}

impl MvcContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    fn buffers(&self) -> MutexGuard<'_, Vec<MvcBuffer>> {
        // The pool only holds plain flags, which remain consistent even if a holder panicked.
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds one surface per memory id to the pool.
    pub fn allocate_buffers(&self, info: &FrameInfo, mids: &[MemId]) {
        let mut buffers = self.buffers();
        buffers.extend(mids.iter().map(|&mem_id| MvcBuffer {
            mem_id,
            info: *info,
            meta: Default::default(),
            lock: Default::default(),
            queued: false,
            render: false,
            sync: None,
        }));
        log::debug!("surface pool now holds {} buffers", buffers.len());
    }

    /// Hands the frames of `response` over to the context. They are freed, and `allocator` closed,
    /// when the context is dropped.
    pub fn set_frames(
        &self,
        allocator: Arc<Mutex<GeneralAllocator>>,
        response: FrameAllocResponse,
        sysmem: bool,
    ) {
        let frames = PoolFrames {
            allocator,
            response,
            sysmem,
        };
        if self.frames.set(frames).is_err() {
            log::warn!("surface pool already owns its frames, ignoring new ones");
        }
    }

    pub fn has_frames(&self) -> bool {
        self.frames.get().is_some()
    }

    pub fn memory(&self) -> PictureMemory {
        match self.frames.get() {
            Some(frames) if !frames.sysmem => PictureMemory::Video,
            _ => PictureMemory::System,
        }
    }

    /// Gives the client access to the frame `mem_id`.
    ///
    /// System memory frames are mapped and must be given back with [`MvcContext::unmap_view`].
    pub fn map_view(&self, mem_id: MemId) -> Option<ViewHandle> {
        let frames = self.frames.get()?;
        let mut allocator = frames
            .allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if frames.sysmem {
            match allocator.lock_frame(mem_id) {
                Ok(data) => Some(ViewHandle::System(data)),
                Err(e) => {
                    log::error!("failed to map frame {:?}: {}", mem_id, e);
                    None
                }
            }
        } else {
            match allocator.get_frame_hdl(mem_id) {
                Ok(handle) => Some(ViewHandle::Native(handle)),
                Err(e) => {
                    log::error!("failed to get handle of frame {:?}: {}", mem_id, e);
                    None
                }
            }
        }
    }

    pub fn unmap_view(&self, mem_id: MemId, view: ViewHandle) {
        let ViewHandle::System(data) = view else {
            return;
        };
        let Some(frames) = self.frames.get() else {
            return;
        };

        let mut allocator = frames
            .allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = allocator.unlock_frame(mem_id, data) {
            log::warn!("failed to unlock frame {:?}: {}", mem_id, e);
        }
    }

    /// Returns a surface the engine can decode into, if any.
    pub fn get_free(&self) -> Option<(SurfaceId, WorkSurface)> {
        let buffers = self.buffers();
        let free = buffers
            .iter()
            .enumerate()
            .find(|(_, buffer)| buffer.is_free())
            .map(|(index, buffer)| {
                (
                    SurfaceId(index),
                    WorkSurface {
                        mem_id: buffer.mem_id,
                        info: buffer.info,
                        lock: buffer.lock.clone(),
                    },
                )
            });

        if free.is_none() {
            log::error!("no free surface among {} buffers", buffers.len());
        }

        free
    }

    /// Looks up the surface backed by `mem_id`.
    pub fn find_buffer(&self, mem_id: MemId) -> Option<SurfaceId> {
        self.buffers()
            .iter()
            .position(|buffer| buffer.mem_id == mem_id)
            .map(SurfaceId)
    }

    /// Records that the engine returned `surface`, to be completed by `sync`.
    pub fn mark_queued(&self, surface: &DecodedSurface, sync: SyncPoint) -> Option<SurfaceInfo> {
        let mut buffers = self.buffers();
        let index = buffers
            .iter()
            .position(|buffer| buffer.mem_id == surface.mem_id)?;

        let buffer = &mut buffers[index];
        buffer.queued = true;
        buffer.render = false;
        buffer.sync = Some(sync);
        buffer.info = surface.info;
        buffer.meta = surface.meta;

        Some(buffer.snapshot(SurfaceId(index)))
    }

    pub fn mark_render(&self, id: SurfaceId) {
        if let Some(buffer) = self.buffers().get_mut(id.0) {
            buffer.queued = false;
            buffer.render = true;
        }
    }

    /// Returns a surface to the free set. Releasing a free surface does nothing.
    pub fn release_buffer(&self, id: SurfaceId) {
        if let Some(buffer) = self.buffers().get_mut(id.0) {
            buffer.queued = false;
            buffer.render = false;
            buffer.sync = None;
        }
    }

    /// Detaches the pending sync point of a surface.
    pub fn take_sync(&self, id: SurfaceId) -> Option<SyncPoint> {
        self.buffers().get_mut(id.0)?.sync.take()
    }

    /// Combines two queued surfaces into a picture owning them.
    pub fn get_picture(self: &Arc<Self>, base: SurfaceInfo, extra: SurfaceInfo) -> Arc<MvcPicture> {
        Arc::new(MvcPicture::new(base, extra, Arc::clone(self)))
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers().len()
    }

    pub fn num_free(&self) -> usize {
        self.buffers().iter().filter(|buffer| buffer.is_free()).count()
    }

    pub fn is_queued(&self, id: SurfaceId) -> bool {
        self.buffers().get(id.0).is_some_and(|buffer| buffer.queued)
    }

    pub fn is_render(&self, id: SurfaceId) -> bool {
        self.buffers().get(id.0).is_some_and(|buffer| buffer.render)
    }
}

impl Drop for MvcContext {
    fn drop(&mut self) {
        let Some(frames) = self.frames.take() else {
            return;
        };

        let mut allocator = frames
            .allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = allocator.free_frames(&frames.response) {
            log::warn!("failed to free frames: {}", e);
        }
        if let Err(e) = allocator.close() {
            log::warn!("failed to close allocator: {}", e);
        }
        log::debug!("freed {} frames", frames.response.mids.len());
    }
}
