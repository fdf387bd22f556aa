// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Allocator dispatching between system memory and textures.

use std::collections::HashMap;

use crate::allocator::sysmem::SysMemFrameAllocator;
#[cfg(feature = "texture")]
use crate::allocator::texture::TextureFrameAllocator;
use crate::allocator::AllocatorBackend;
use crate::allocator::AllocatorError;
use crate::allocator::AllocatorParams;
use crate::allocator::AllocatorResult;
use crate::allocator::BaseFrameAllocator;
use crate::allocator::FrameAllocRequest;
use crate::allocator::FrameAllocResponse;
use crate::allocator::FrameAllocator;
use crate::allocator::FrameData;
use crate::allocator::MemType;
use crate::allocator::NativeHandle;
use crate::video_frame::MemId;

/// Routes every request to the allocator that owns the frame.
///
/// Video memory requests go to the texture allocator when one was configured, everything else to
/// system memory. The origin of each handed out id is remembered for later lock, unlock, handle
/// and free calls.
#[derive(Debug, Default)]
pub struct GeneralBackend {
    #[cfg(feature = "texture")]
    hw: Option<TextureFrameAllocator>,
    sys: Option<SysMemFrameAllocator>,
    /// Whether each id belongs to the texture allocator.
    mids: HashMap<MemId, bool>,
}

impl GeneralBackend {
    pub fn has_texture_allocator(&self) -> bool {
        self.hw_ref().is_some()
    }

    fn is_hw_mid(&self, mid: MemId) -> bool {
        self.mids.get(&mid).copied().unwrap_or(false)
    }

    #[cfg(feature = "texture")]
    fn init_hw(&mut self, params: &AllocatorParams) -> AllocatorResult<()> {
        if params.texture.is_some() {
            let mut hw = TextureFrameAllocator::default();
            hw.init(params)?;
            self.hw = Some(hw);
        }
        Ok(())
    }

    #[cfg(not(feature = "texture"))]
    fn init_hw(&mut self, _: &AllocatorParams) -> AllocatorResult<()> {
        Ok(())
    }

    fn hw_ref(&self) -> Option<&dyn FrameAllocator> {
        #[cfg(feature = "texture")]
        return self.hw.as_ref().map(|hw| hw as &dyn FrameAllocator);
        #[cfg(not(feature = "texture"))]
        return None;
    }

    fn hw_mut(&mut self) -> Option<&mut dyn FrameAllocator> {
        #[cfg(feature = "texture")]
        return self.hw.as_mut().map(|hw| hw as &mut dyn FrameAllocator);
        #[cfg(not(feature = "texture"))]
        return None;
    }

    /// The allocator that handed out `mid`.
    fn owner(&mut self, mid: MemId) -> AllocatorResult<&mut dyn FrameAllocator> {
        if self.is_hw_mid(mid) {
            self.hw_mut().ok_or(AllocatorError::NotInitialized)
        } else {
            self.sys
                .as_mut()
                .map(|sys| sys as &mut dyn FrameAllocator)
                .ok_or(AllocatorError::NotInitialized)
        }
    }
}

impl AllocatorBackend for GeneralBackend {
    fn init(&mut self, params: &AllocatorParams) -> AllocatorResult<()> {
        self.init_hw(params)?;

        let mut sys = SysMemFrameAllocator::default();
        sys.init(params)?;
        self.sys = Some(sys);

        Ok(())
    }

    fn alloc_impl(&mut self, request: &FrameAllocRequest) -> AllocatorResult<FrameAllocResponse> {
        let use_hw = request.mem_type.intersects(MemType::VIDEO_MEMORY) && self.hw_ref().is_some();
        let allocator = if use_hw {
            self.hw_mut().ok_or(AllocatorError::NotInitialized)?
        } else {
            self.sys
                .as_mut()
                .map(|sys| sys as &mut dyn FrameAllocator)
                .ok_or(AllocatorError::NotInitialized)?
        };

        let response = allocator.alloc_frames(request)?;
        self.mids
            .extend(response.mids.iter().map(|&mid| (mid, use_hw)));
        Ok(response)
    }

    fn release_response(&mut self, response: &FrameAllocResponse) -> AllocatorResult<()> {
        let first = *response
            .mids
            .first()
            .ok_or(AllocatorError::UnknownResponse)?;
        self.owner(first)?.free_frames(response)?;
        for mid in &response.mids {
            self.mids.remove(mid);
        }
        Ok(())
    }

    fn lock_frame(&mut self, mid: MemId) -> AllocatorResult<FrameData> {
        self.owner(mid)?.lock_frame(mid)
    }

    fn unlock_frame(&mut self, mid: MemId, data: FrameData) -> AllocatorResult<()> {
        self.owner(mid)?.unlock_frame(mid, data)
    }

    fn get_frame_hdl(&self, mid: MemId) -> AllocatorResult<NativeHandle> {
        let owner = if self.is_hw_mid(mid) {
            self.hw_ref()
        } else {
            self.sys.as_ref().map(|sys| sys as &dyn FrameAllocator)
        };

        owner
            .ok_or(AllocatorError::NotInitialized)?
            .get_frame_hdl(mid)
    }

    fn close(&mut self) -> AllocatorResult<()> {
        if let Some(hw) = self.hw_mut() {
            hw.close()?;
        }
        if let Some(sys) = self.sys.as_mut() {
            sys.close()?;
        }
        self.mids.clear();
        Ok(())
    }
}

pub type GeneralAllocator = BaseFrameAllocator<GeneralBackend>;
