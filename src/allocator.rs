// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame allocators providing decode targets to the engine.
//!
//! A [`FrameAllocator`] hands out frames as opaque [`MemId`]s. Concrete allocators only implement
//! the [`AllocatorBackend`] hooks and are wrapped into a [`BaseFrameAllocator`], which carries
//! the bookkeeping shared by all of them: caching of external responses per allocation id and
//! matching of freed responses.

pub mod general;
pub mod sysmem;
#[cfg(feature = "texture")]
pub mod texture;

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;

use bitflags::bitflags;
use thiserror::Error;

pub use crate::allocator::sysmem::AlignedBuffer;
use crate::video_frame::FrameInfo;
use crate::video_frame::MemId;
use crate::video_frame::UV_PLANE;
use crate::video_frame::Y_PLANE;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemType: u16 {
        const INTERNAL_FRAME = 0x0001;
        const EXTERNAL_FRAME = 0x0002;
        const VIDEO_MEMORY_DECODER_TARGET = 0x0010;
        const VIDEO_MEMORY_PROCESSOR_TARGET = 0x0020;
        const SYSTEM_MEMORY = 0x0040;
        const FROM_ENCODE = 0x0100;
        const FROM_DECODE = 0x0200;
        const FROM_VPPIN = 0x0400;
        const FROM_VPPOUT = 0x0800;
    }
}

impl MemType {
    /// Memory kinds backed by GPU textures.
    pub const VIDEO_MEMORY: Self = Self::VIDEO_MEMORY_DECODER_TARGET
        .union(Self::VIDEO_MEMORY_PROCESSOR_TARGET);
}

/// Description of the frames a component needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameAllocRequest {
    /// Identifies the requester, used to hand back the same frames on repeated requests.
    pub alloc_id: u32,
    pub info: FrameInfo,
    pub mem_type: MemType,
    pub num_frame_min: u16,
    pub num_frame_suggested: u16,
}

/// Frames allocated for a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameAllocResponse {
    pub alloc_id: u32,
    pub mids: Vec<MemId>,
}

impl FrameAllocResponse {
    pub fn num_frame_actual(&self) -> usize {
        self.mids.len()
    }

    /// Whether `self` and `other` describe the same allocation.
    fn is_same(&self, other: &Self) -> bool {
        !self.mids.is_empty()
            && self.mids.first() == other.mids.first()
            && self.mids.len() == other.mids.len()
    }
}

/// Host memory shared between whoever has a frame locked.
pub type SysMemBuffer = Arc<Mutex<AlignedBuffer>>;

/// CPU mapping of a locked system memory frame.
#[derive(Clone, Debug)]
pub struct FrameData {
    /// Bytes per line of both planes.
    pub pitch: usize,
    /// Offsets of the Y and interleaved UV planes in `buffer`.
    pub offsets: [usize; 2],
    pub buffer: SysMemBuffer,
}

impl FrameData {
    pub fn y_offset(&self) -> usize {
        self.offsets[Y_PLANE]
    }

    pub fn uv_offset(&self) -> usize {
        self.offsets[UV_PLANE]
    }

    /// Offsets of the first visible sample of each plane, as cropped by `info`.
    pub fn crop_offsets(&self, info: &FrameInfo) -> [usize; 2] {
        let (x, y) = (info.crop_x as usize, info.crop_y as usize);
        [
            self.y_offset() + y * self.pitch + x,
            self.uv_offset() + y / 2 * self.pitch + (x & !1),
        ]
    }
}

/// Native texture object, as understood by the [`texture::TextureDevice`] that created it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// GPU-side identity of a frame: a texture and the array slice within it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NativeHandle {
    pub texture: TextureHandle,
    pub subresource: u32,
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("operation not supported by this allocator")]
    Unsupported,
    #[error("frame memory allocation failed")]
    MemoryAlloc,
    #[error("unknown memory id {0:?}")]
    InvalidHandle(MemId),
    #[error("response does not belong to this allocator")]
    UnknownResponse,
    #[error("allocator is not initialized")]
    NotInitialized,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type AllocatorResult<T> = Result<T, AllocatorError>;

/// Parameters given to [`FrameAllocator::init`].
#[derive(Clone, Debug, Default)]
pub struct AllocatorParams {
    /// Enables texture allocations when set.
    #[cfg(feature = "texture")]
    pub texture: Option<texture::TextureAllocatorParams>,
}

/// Interface through which decode targets are allocated, mapped and released.
pub trait FrameAllocator: Send + Debug {
    fn init(&mut self, params: &AllocatorParams) -> AllocatorResult<()>;
    /// Releases every outstanding allocation.
    fn close(&mut self) -> AllocatorResult<()>;
    fn alloc_frames(&mut self, request: &FrameAllocRequest) -> AllocatorResult<FrameAllocResponse>;
    /// Maps a frame into CPU memory.
    fn lock_frame(&mut self, mid: MemId) -> AllocatorResult<FrameData>;
    /// Ends a mapping obtained from [`FrameAllocator::lock_frame`].
    fn unlock_frame(&mut self, mid: MemId, data: FrameData) -> AllocatorResult<()>;
    fn get_frame_hdl(&self, mid: MemId) -> AllocatorResult<NativeHandle>;
    fn free_frames(&mut self, response: &FrameAllocResponse) -> AllocatorResult<()>;
}

/// Allocator shared between the decoder and the engine.
pub type SharedAllocator = Arc<Mutex<dyn FrameAllocator>>;

/// Memory-specific part of an allocator.
pub trait AllocatorBackend: Send + Debug {
    fn init(&mut self, params: &AllocatorParams) -> AllocatorResult<()>;

    /// Rejects requests this backend cannot serve.
    fn check_request_type(&self, request: &FrameAllocRequest) -> AllocatorResult<()> {
        if request.mem_type.contains(MemType::FROM_DECODE) {
            Ok(())
        } else {
            Err(AllocatorError::Unsupported)
        }
    }

    fn alloc_impl(&mut self, request: &FrameAllocRequest) -> AllocatorResult<FrameAllocResponse>;
    fn release_response(&mut self, response: &FrameAllocResponse) -> AllocatorResult<()>;
    fn lock_frame(&mut self, mid: MemId) -> AllocatorResult<FrameData>;
    fn unlock_frame(&mut self, mid: MemId, data: FrameData) -> AllocatorResult<()>;
    fn get_frame_hdl(&self, mid: MemId) -> AllocatorResult<NativeHandle>;

    /// Called after every response has been released.
    fn close(&mut self) -> AllocatorResult<()> {
        Ok(())
    }
}

/// Response bookkeeping on top of an [`AllocatorBackend`].
#[derive(Debug, Default)]
pub struct BaseFrameAllocator<B> {
    backend: B,
    /// One-shot allocations.
    responses: Vec<FrameAllocResponse>,
    /// Allocations of external frames, reused for requests with the same `alloc_id`.
    ext_responses: Vec<FrameAllocResponse>,
}

impl<B: AllocatorBackend> BaseFrameAllocator<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            responses: Vec::new(),
            ext_responses: Vec::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of responses currently held.
    pub fn num_responses(&self) -> usize {
        self.responses.len() + self.ext_responses.len()
    }
}

impl<B: AllocatorBackend> FrameAllocator for BaseFrameAllocator<B> {
    fn init(&mut self, params: &AllocatorParams) -> AllocatorResult<()> {
        self.backend.init(params)
    }

    fn close(&mut self) -> AllocatorResult<()> {
        let mut result = Ok(());

        let responses = std::mem::take(&mut self.ext_responses)
            .into_iter()
            .chain(std::mem::take(&mut self.responses));
        for response in responses {
            if let Err(e) = self.backend.release_response(&response) {
                log::error!("failed to release frames {:?}: {}", response.mids, e);
                result = Err(e);
            }
        }

        self.backend.close()?;
        result
    }

    fn alloc_frames(&mut self, request: &FrameAllocRequest) -> AllocatorResult<FrameAllocResponse> {
        if request.num_frame_suggested == 0 {
            return Err(AllocatorError::MemoryAlloc);
        }

        self.backend.check_request_type(request)?;

        if !request
            .mem_type
            .contains(MemType::EXTERNAL_FRAME | MemType::FROM_DECODE)
        {
            let response = self.backend.alloc_impl(request)?;
            self.responses.push(response.clone());
            return Ok(response);
        }

        if let Some(cached) = self
            .ext_responses
            .iter()
            .find(|response| response.alloc_id == request.alloc_id)
        {
            if usize::from(request.num_frame_suggested) > cached.num_frame_actual() {
                log::error!(
                    "allocation {} already holds {} frames, {} requested",
                    request.alloc_id,
                    cached.num_frame_actual(),
                    request.num_frame_suggested
                );
                return Err(AllocatorError::MemoryAlloc);
            }

            return Ok(cached.clone());
        }

        let mut response = self.backend.alloc_impl(request)?;
        response.alloc_id = request.alloc_id;
        self.ext_responses.push(response.clone());
        Ok(response)
    }

    fn lock_frame(&mut self, mid: MemId) -> AllocatorResult<FrameData> {
        self.backend.lock_frame(mid)
    }

    fn unlock_frame(&mut self, mid: MemId, data: FrameData) -> AllocatorResult<()> {
        self.backend.unlock_frame(mid, data)
    }

    fn get_frame_hdl(&self, mid: MemId) -> AllocatorResult<NativeHandle> {
        self.backend.get_frame_hdl(mid)
    }

    fn free_frames(&mut self, response: &FrameAllocResponse) -> AllocatorResult<()> {
        let cached = if let Some(pos) = self.ext_responses.iter().position(|r| r.is_same(response))
        {
            self.ext_responses.remove(pos)
        } else if let Some(pos) = self.responses.iter().position(|r| r.is_same(response)) {
            self.responses.remove(pos)
        } else {
            return Err(AllocatorError::UnknownResponse);
        };

        self.backend.release_response(&cached)
    }
}
