// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Allocator of decode targets backed by GPU textures.
//!
//! Textures are created through a [`TextureDevice`] supplied by the platform. Every allocation
//! becomes a resource record owning one texture array (single-texture mode) or one texture per
//! frame. Memory ids are handed out sequentially from 1 so that `mid - 1` indexes the map from
//! ids to resource records.

use std::fmt::Debug;
use std::sync::Arc;

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
use crate::allocator::TextureHandle;
use crate::video_frame::MemId;
use crate::DecodedFormat;

/// Creation parameters of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: DecodedFormat,
    /// Number of slices of the texture array.
    pub array_size: u32,
    pub bind_decoder: bool,
    pub bind_render_target: bool,
}

/// Platform device able to create textures.
pub trait TextureDevice: Send + Sync + Debug {
    fn create_texture(&self, desc: &TextureDesc) -> anyhow::Result<TextureHandle>;
    fn release_texture(&self, texture: TextureHandle);
}

#[derive(Clone, Debug)]
pub struct TextureAllocatorParams {
    pub device: Arc<dyn TextureDevice>,
    /// Allocate all frames of a request as slices of a single texture array.
    pub single_texture: bool,
}

#[derive(Debug)]
struct TextureResource {
    outer_mids: Vec<MemId>,
    textures: Vec<TextureHandle>,
    allocated: bool,
}

impl TextureResource {
    fn handle(&self, mid: MemId) -> Option<NativeHandle> {
        let front = self.outer_mids.first()?.get();
        let offset = mid.get().checked_sub(front)?;
        let num_textures = self.textures.len() as u64;
        if num_textures == 0 || offset >= self.outer_mids.len() as u64 {
            return None;
        }

        Some(NativeHandle {
            texture: self.textures[(offset % num_textures) as usize],
            subresource: (offset / num_textures) as u32,
        })
    }
}

#[derive(Debug, Default)]
pub struct TextureBackend {
    params: Option<TextureAllocatorParams>,
    resources: Vec<TextureResource>,
    /// Index of the owning resource, for each memory id minus one.
    mem_id_map: Vec<usize>,
}

impl TextureBackend {
    fn device(&self) -> AllocatorResult<&Arc<dyn TextureDevice>> {
        self.params
            .as_ref()
            .map(|params| &params.device)
            .ok_or(AllocatorError::NotInitialized)
    }

    fn resource_index(&self, mid: MemId) -> Option<usize> {
        let index = usize::try_from(mid.get().checked_sub(1)?).ok()?;
        let resource = *self.mem_id_map.get(index)?;
        self.resources[resource].allocated.then_some(resource)
    }

    fn release_resource(&mut self, index: usize) -> AllocatorResult<()> {
        let device = Arc::clone(self.device()?);
        let resource = &mut self.resources[index];
        for texture in resource.textures.drain(..) {
            device.release_texture(texture);
        }
        resource.allocated = false;
        Ok(())
    }
}

impl AllocatorBackend for TextureBackend {
    fn init(&mut self, params: &AllocatorParams) -> AllocatorResult<()> {
        self.params = Some(params.texture.clone().ok_or(AllocatorError::NotInitialized)?);
        Ok(())
    }

    fn check_request_type(&self, request: &FrameAllocRequest) -> AllocatorResult<()> {
        if request.mem_type.contains(MemType::FROM_DECODE)
            && request.mem_type.intersects(MemType::VIDEO_MEMORY)
        {
            Ok(())
        } else {
            Err(AllocatorError::Unsupported)
        }
    }

    fn alloc_impl(&mut self, request: &FrameAllocRequest) -> AllocatorResult<FrameAllocResponse> {
        let params = self
            .params
            .as_ref()
            .ok_or(AllocatorError::NotInitialized)?;

        if request.info.fourcc != DecodedFormat::NV12.fourcc() {
            log::error!("unsupported texture format {:?}", request.info.fourcc);
            return Err(AllocatorError::Unsupported);
        }

        let num_frames = u32::from(request.num_frame_suggested);
        let array_size = if params.single_texture {
            num_frames.max(1)
        } else {
            1
        };
        let desc = TextureDesc {
            width: request.info.width,
            height: request.info.height,
            format: DecodedFormat::NV12,
            array_size,
            bind_decoder: request
                .mem_type
                .contains(MemType::VIDEO_MEMORY_DECODER_TARGET),
            bind_render_target: request
                .mem_type
                .contains(MemType::VIDEO_MEMORY_PROCESSOR_TARGET),
        };

        let mut textures = Vec::new();
        for _ in 0..num_frames / array_size {
            match params.device.create_texture(&desc) {
                Ok(texture) => textures.push(texture),
                Err(e) => {
                    log::error!("failed to create texture {:?}: {:#}", desc, e);
                    for texture in textures {
                        params.device.release_texture(texture);
                    }
                    return Err(AllocatorError::MemoryAlloc);
                }
            }
        }

        let last_mid = self
            .resources
            .last()
            .and_then(|resource| resource.outer_mids.last())
            .map_or(0, |mid| mid.get());
        let mids = (1..=u64::from(num_frames))
            .map(|i| MemId::new(last_mid + i))
            .collect::<Vec<_>>();

        let index = self.resources.len();
        self.resources.push(TextureResource {
            outer_mids: mids.clone(),
            textures,
            allocated: true,
        });
        self.mem_id_map
            .extend(std::iter::repeat(index).take(mids.len()));

        log::debug!(
            "allocated {} texture frames {:?}..={:?}",
            mids.len(),
            mids.first(),
            mids.last()
        );

        Ok(FrameAllocResponse { alloc_id: 0, mids })
    }

    fn release_response(&mut self, response: &FrameAllocResponse) -> AllocatorResult<()> {
        let first = *response
            .mids
            .first()
            .ok_or(AllocatorError::UnknownResponse)?;
        let index = self
            .resource_index(first)
            .ok_or(AllocatorError::InvalidHandle(first))?;

        self.release_resource(index)?;

        if !self.resources.iter().any(|resource| resource.allocated) {
            self.resources.clear();
            self.mem_id_map.clear();
        }

        Ok(())
    }

    fn lock_frame(&mut self, _: MemId) -> AllocatorResult<FrameData> {
        Err(AllocatorError::Unsupported)
    }

    fn unlock_frame(&mut self, _: MemId, _: FrameData) -> AllocatorResult<()> {
        Err(AllocatorError::Unsupported)
    }

    fn get_frame_hdl(&self, mid: MemId) -> AllocatorResult<NativeHandle> {
        self.resource_index(mid)
            .and_then(|index| self.resources[index].handle(mid))
            .ok_or(AllocatorError::InvalidHandle(mid))
    }

    fn close(&mut self) -> AllocatorResult<()> {
        for index in 0..self.resources.len() {
            if self.resources[index].allocated {
                self.release_resource(index)?;
            }
        }
        self.resources.clear();
        self.mem_id_map.clear();
        Ok(())
    }
}

pub type TextureFrameAllocator = BaseFrameAllocator<TextureBackend>;

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use super::*;
    use crate::allocator::FrameAllocator;
    use crate::video_frame::FrameInfo;
    use crate::Resolution;

    /// Texture device keeping track of the textures alive.
    #[derive(Debug, Default)]
    pub(crate) struct FakeTextureDevice {
        next_handle: AtomicU64,
        pub(crate) live: Mutex<Vec<TextureHandle>>,
        pub(crate) descs: Mutex<Vec<TextureDesc>>,
        /// Number of textures that can be created before failing.
        pub(crate) capacity: Option<usize>,
    }

    impl FakeTextureDevice {
        pub(crate) fn num_live(&self) -> usize {
            self.live.lock().unwrap().len()
        }
    }

    impl TextureDevice for FakeTextureDevice {
        fn create_texture(&self, desc: &TextureDesc) -> anyhow::Result<TextureHandle> {
            let mut live = self.live.lock().unwrap();
            if self.capacity.is_some_and(|capacity| live.len() >= capacity) {
                anyhow::bail!("out of video memory");
            }

            let handle = TextureHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 100);
            live.push(handle);
            self.descs.lock().unwrap().push(*desc);
            Ok(handle)
        }

        fn release_texture(&self, texture: TextureHandle) {
            self.live.lock().unwrap().retain(|&t| t != texture);
        }
    }

    pub(crate) fn texture_params(
        device: &Arc<FakeTextureDevice>,
        single_texture: bool,
    ) -> AllocatorParams {
        AllocatorParams {
            texture: Some(TextureAllocatorParams {
                device: Arc::clone(device) as Arc<dyn TextureDevice>,
                single_texture,
            }),
        }
    }

    fn request(num: u16) -> FrameAllocRequest {
        FrameAllocRequest {
            alloc_id: 0,
            info: FrameInfo::new(
                DecodedFormat::NV12,
                Resolution::from((1920, 1088)),
                Resolution::from((1920, 1080)),
            ),
            mem_type: MemType::VIDEO_MEMORY_DECODER_TARGET | MemType::FROM_DECODE,
            num_frame_min: num,
            num_frame_suggested: num,
        }
    }

    #[test]
    fn single_texture_array() {
        let device = Arc::new(FakeTextureDevice::default());
        let mut allocator = TextureFrameAllocator::default();
        allocator.init(&texture_params(&device, true)).unwrap();

        let response = allocator.alloc_frames(&request(4)).unwrap();
        assert_eq!(
            response.mids,
            (1..=4).map(MemId::new).collect::<Vec<_>>()
        );
        assert_eq!(device.num_live(), 1);
        assert_eq!(device.descs.lock().unwrap()[0].array_size, 4);
        assert!(device.descs.lock().unwrap()[0].bind_decoder);

        let handle = allocator.get_frame_hdl(MemId::new(3)).unwrap();
        assert_eq!(handle.texture, device.live.lock().unwrap()[0]);
        assert_eq!(handle.subresource, 2);

        assert!(matches!(
            allocator.lock_frame(MemId::new(1)),
            Err(AllocatorError::Unsupported)
        ));
    }

    #[test]
    fn texture_per_frame() {
        let device = Arc::new(FakeTextureDevice::default());
        let mut allocator = TextureFrameAllocator::default();
        allocator.init(&texture_params(&device, false)).unwrap();

        allocator.alloc_frames(&request(3)).unwrap();
        assert_eq!(device.num_live(), 3);

        let handle = allocator.get_frame_hdl(MemId::new(2)).unwrap();
        assert_eq!(handle.texture, device.live.lock().unwrap()[1]);
        assert_eq!(handle.subresource, 0);
    }

    #[test]
    fn ids_continue_and_reset_when_empty() {
        let device = Arc::new(FakeTextureDevice::default());
        let mut allocator = TextureFrameAllocator::default();
        allocator.init(&texture_params(&device, true)).unwrap();

        let first = allocator.alloc_frames(&request(2)).unwrap();
        let second = allocator.alloc_frames(&request(3)).unwrap();
        assert_eq!(second.mids[0], MemId::new(3));

        allocator.free_frames(&first).unwrap();
        assert!(matches!(
            allocator.get_frame_hdl(MemId::new(1)),
            Err(AllocatorError::InvalidHandle(_))
        ));
        assert_eq!(
            allocator.get_frame_hdl(MemId::new(5)).unwrap().subresource,
            2
        );

        allocator.free_frames(&second).unwrap();
        assert_eq!(device.num_live(), 0);

        let third = allocator.alloc_frames(&request(1)).unwrap();
        assert_eq!(third.mids, vec![MemId::new(1)]);
    }

    #[test]
    fn failed_creation_releases_partial_textures() {
        let device = Arc::new(FakeTextureDevice {
            capacity: Some(2),
            ..Default::default()
        });
        let mut allocator = TextureFrameAllocator::default();
        allocator.init(&texture_params(&device, false)).unwrap();

        assert!(matches!(
            allocator.alloc_frames(&request(3)),
            Err(AllocatorError::MemoryAlloc)
        ));
        assert_eq!(device.num_live(), 0);
    }

    #[test]
    fn requires_device_and_video_memory() {
        let mut allocator = TextureFrameAllocator::default();
        assert!(matches!(
            allocator.init(&Default::default()),
            Err(AllocatorError::NotInitialized)
        ));

        let device = Arc::new(FakeTextureDevice::default());
        allocator.init(&texture_params(&device, true)).unwrap();
        let mut sysmem = request(2);
        sysmem.mem_type = MemType::SYSTEM_MEMORY | MemType::FROM_DECODE;
        assert!(matches!(
            allocator.alloc_frames(&sysmem),
            Err(AllocatorError::Unsupported)
        ));
    }

    #[test]
    fn close_releases_textures() {
        let device = Arc::new(FakeTextureDevice::default());
        let mut allocator = TextureFrameAllocator::default();
        allocator.init(&texture_params(&device, false)).unwrap();
        allocator.alloc_frames(&request(4)).unwrap();

        allocator.close().unwrap();
        assert_eq!(device.num_live(), 0);
    }
}
