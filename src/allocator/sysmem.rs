// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Allocator of NV12 frames in host memory.

use std::alloc::Layout;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::Mutex;

use crate::allocator::AllocatorBackend;
use crate::allocator::AllocatorError;
use crate::allocator::AllocatorParams;
use crate::allocator::AllocatorResult;
use crate::allocator::BaseFrameAllocator;
use crate::allocator::FrameAllocRequest;
use crate::allocator::FrameAllocResponse;
use crate::allocator::FrameData;
use crate::allocator::MemType;
use crate::allocator::NativeHandle;
use crate::allocator::SysMemBuffer;
use crate::utils::align_up;
use crate::video_frame::FrameInfo;
use crate::video_frame::MemId;
use crate::DecodedFormat;

/// Alignment of the frame dimensions and of the buffers.
pub const SYSMEM_ALIGNMENT: usize = 32;

/// Memory ids of system memory frames have this bit set, so they never collide with texture ids.
const SYSMEM_ID_BASE: u64 = 1 << 63;

/// Zero-initialized heap buffer with [`SYSMEM_ALIGNMENT`] alignment.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Safe because `AlignedBuffer` owns its allocation exclusively, like a `Box<[u8]>`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    pub fn new(size: usize) -> AllocatorResult<Self> {
        let layout = Layout::from_size_align(size.max(1), SYSMEM_ALIGNMENT)
            .map_err(|_| AllocatorError::MemoryAlloc)?;
        // Safe because `layout` has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };

        Ok(Self {
            ptr: NonNull::new(ptr).ok_or(AllocatorError::MemoryAlloc)?,
            layout,
        })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safe because `ptr` points to `len()` initialized bytes owned by `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safe because `ptr` points to `len()` initialized bytes exclusively borrowed through `self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // Safe because we allocated the memory using `std::alloc::alloc_zeroed` with this layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len())
            .finish()
    }
}

#[derive(Debug)]
struct SysMemFrame {
    info: FrameInfo,
    buffer: SysMemBuffer,
}

/// Backend placing NV12 frames in aligned host buffers.
#[derive(Debug, Default)]
pub struct SysMemBackend {
    frames: HashMap<MemId, SysMemFrame>,
    next_id: u64,
}

impl SysMemBackend {
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Aligned width and height of a frame.
    fn aligned_size(info: &FrameInfo) -> (usize, usize) {
        (
            align_up(info.width as usize, SYSMEM_ALIGNMENT),
            align_up(info.height as usize, SYSMEM_ALIGNMENT),
        )
    }
}

impl AllocatorBackend for SysMemBackend {
    fn init(&mut self, _: &AllocatorParams) -> AllocatorResult<()> {
        Ok(())
    }

    fn check_request_type(&self, request: &FrameAllocRequest) -> AllocatorResult<()> {
        if request.mem_type.contains(MemType::FROM_DECODE)
            && request.mem_type.contains(MemType::SYSTEM_MEMORY)
        {
            Ok(())
        } else {
            Err(AllocatorError::Unsupported)
        }
    }

    fn alloc_impl(&mut self, request: &FrameAllocRequest) -> AllocatorResult<FrameAllocResponse> {
        if request.info.fourcc != DecodedFormat::NV12.fourcc() {
            log::error!("unsupported system memory format {:?}", request.info.fourcc);
            return Err(AllocatorError::Unsupported);
        }

        let (width, height) = Self::aligned_size(&request.info);
        let nbytes = width * height + 2 * (width / 2) * (height / 2);

        let mut mids = Vec::with_capacity(usize::from(request.num_frame_suggested));
        for _ in 0..request.num_frame_suggested {
            let buffer = match AlignedBuffer::new(nbytes) {
                Ok(buffer) => buffer,
                Err(e) => {
                    for mid in mids.drain(..) {
                        self.frames.remove(&mid);
                    }
                    return Err(e);
                }
            };

            self.next_id += 1;
            let mid = MemId::new(SYSMEM_ID_BASE | self.next_id);
            self.frames.insert(
                mid,
                SysMemFrame {
                    info: request.info,
                    buffer: Arc::new(Mutex::new(buffer)),
                },
            );
            mids.push(mid);
        }

        log::debug!(
            "allocated {} system memory frames of {} bytes",
            mids.len(),
            nbytes
        );

        Ok(FrameAllocResponse { alloc_id: 0, mids })
    }

    fn release_response(&mut self, response: &FrameAllocResponse) -> AllocatorResult<()> {
        for mid in &response.mids {
            self.frames.remove(mid);
        }
        Ok(())
    }

    fn lock_frame(&mut self, mid: MemId) -> AllocatorResult<FrameData> {
        let frame = self
            .frames
            .get(&mid)
            .ok_or(AllocatorError::InvalidHandle(mid))?;
        if frame.info.fourcc != DecodedFormat::NV12.fourcc() {
            return Err(AllocatorError::Unsupported);
        }

        let (width, height) = Self::aligned_size(&frame.info);
        Ok(FrameData {
            pitch: width,
            offsets: [0, width * height],
            buffer: Arc::clone(&frame.buffer),
        })
    }

    fn unlock_frame(&mut self, _: MemId, _: FrameData) -> AllocatorResult<()> {
        Ok(())
    }

    fn get_frame_hdl(&self, _: MemId) -> AllocatorResult<NativeHandle> {
        Err(AllocatorError::Unsupported)
    }
}

pub type SysMemFrameAllocator = BaseFrameAllocator<SysMemBackend>;
