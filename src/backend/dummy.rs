// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy engine whose only purpose is to let the decoder
//! run so we can test it in isolation.
//!
//! The engine does not decode anything: it recognizes parameter sets and slices with the NAL
//! scanner, emits one surface per slice (base view for AVC slices, view 1 for MVC extension
//! slices) and fills the luma plane of system memory frames with a recognizable pattern. Busy
//! periods, injected statuses and slow syncs can be scripted through a [`DummyEngineHandle`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::allocator::FrameAllocRequest;
use crate::allocator::MemType;
use crate::allocator::SharedAllocator;
use crate::backend::Bitstream;
use crate::backend::DecodeEngine;
use crate::backend::DecodeOutput;
use crate::backend::EngineStatus;
use crate::backend::FrameDecodeResult;
use crate::backend::Implementation;
use crate::backend::IoPattern;
use crate::backend::MvcOperationPoint;
use crate::backend::MvcViewDependency;
use crate::backend::SyncPoint;
use crate::backend::VideoParams;
use crate::codec::h264::nalu::NalScanner;
use crate::codec::h264::nalu::NaluType;
use crate::video_frame::DecodedSurface;
use crate::video_frame::FrameDataFlags;
use crate::video_frame::FrameInfo;
use crate::video_frame::FrameMetadata;
use crate::video_frame::MemId;
use crate::video_frame::SurfaceLock;
use crate::video_frame::WorkSurface;
use crate::DecodedFormat;
use crate::Resolution;

/// Static behavior of a [`DummyEngine`].
#[derive(Clone, Debug)]
pub struct DummyConfig {
    pub implementation: Implementation,
    pub display_resolution: Resolution,
    pub num_frame_suggested: u16,
    /// Report partial acceleration when asked to decode into video memory.
    pub partial_acceleration: bool,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            implementation: Implementation::Hardware,
            display_resolution: Resolution::from((1920, 1080)),
            num_frame_suggested: 10,
            partial_acceleration: false,
        }
    }
}

impl DummyConfig {
    pub fn coded_resolution(&self) -> Resolution {
        self.display_resolution.round(16)
    }
}

#[derive(Debug, Default)]
struct DummyState {
    config: DummyConfig,

    busy_calls: usize,
    injected: VecDeque<EngineStatus>,
    in_execution_polls: u32,

    header_probes: usize,
    inits: usize,
    resets: usize,
    submissions: usize,
    syncs: usize,
    decoder_closes: usize,
    closed: bool,

    params: Option<VideoParams>,
    allocator: Option<SharedAllocator>,
    next_sync: u64,
    next_frame_order: u32,
    last_base_order: u32,
    in_flight: Vec<(SyncPoint, SurfaceLock)>,
}

impl DummyState {
    /// Completes every pending operation, releasing the surfaces held by the engine.
    fn complete_all(&mut self) {
        for (_, lock) in self.in_flight.drain(..) {
            lock.unlock();
        }
    }

    fn fill_frame(&self, mem_id: MemId, value: u8) {
        let Some(allocator) = &self.allocator else {
            return;
        };
        let mut allocator = allocator.lock().unwrap_or_else(PoisonError::into_inner);

        let data = match allocator.lock_frame(mem_id) {
            Ok(data) => data,
            Err(e) => {
                log::debug!("not filling frame {:?}: {}", mem_id, e);
                return;
            }
        };

        {
            let mut buffer = data.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let luma = data.y_offset()..data.uv_offset().min(buffer.len());
            buffer.as_mut_slice()[luma].fill(value);
        }

        if let Err(e) = allocator.unlock_frame(mem_id, data) {
            log::warn!("failed to unlock frame {:?}: {}", mem_id, e);
        }
    }
}

/// Luma value written by the dummy engine into a system memory frame.
pub fn luma_pattern(view_id: u16, frame_order: u32) -> u8 {
    (frame_order as u8 & 0x7f) | if view_id == 0 { 0 } else { 0x80 }
}

pub struct DummyEngine {
    state: Arc<Mutex<DummyState>>,
}

impl DummyEngine {
    pub fn new(config: DummyConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(DummyState {
                config,
                ..Default::default()
            })),
        }
    }

    pub fn handle(&self) -> DummyEngineHandle {
        DummyEngineHandle(Arc::clone(&self.state))
    }

    fn state(&self) -> MutexGuard<'_, DummyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DummyEngine {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl DecodeEngine for DummyEngine {
    fn implementation(&self) -> Implementation {
        self.state().config.implementation
    }

    fn version(&self) -> (u16, u16) {
        (1, 19)
    }

    fn set_frame_allocator(&mut self, allocator: SharedAllocator) -> EngineStatus {
        self.state().allocator = Some(allocator);
        EngineStatus::Ok
    }

    fn decode_header(&mut self, bs: &mut Bitstream, params: &mut VideoParams) -> EngineStatus {
        let mut state = self.state();
        state.header_probes += 1;

        let (mut has_sps, mut has_subset_sps, mut has_pps) = (false, false, false);
        for nalu in NalScanner::new(bs.remaining(), 0) {
            match nalu.header.type_ {
                NaluType::Sps => has_sps = true,
                NaluType::SubsetSps => has_subset_sps = true,
                NaluType::Pps => has_pps = true,
                _ => (),
            }
        }

        if !(has_sps || has_subset_sps) || !has_pps {
            return EngineStatus::MoreData;
        }

        let num_view = if has_subset_sps { 2 } else { 1 };
        let mvc = &mut params.mvc;
        mvc.num_view = num_view;
        mvc.num_view_id = num_view;
        mvc.num_op = 1;
        if !mvc.has_room() {
            return EngineStatus::NotEnoughBuffer;
        }

        for view_id in 0..num_view {
            mvc.views[usize::from(view_id)] = MvcViewDependency {
                view_id,
                anchor_refs: Vec::new(),
                non_anchor_refs: Vec::new(),
            };
            mvc.view_ids[usize::from(view_id)] = view_id;
        }
        mvc.ops[0] = MvcOperationPoint {
            temporal_id: 0,
            level_idc: 41,
            target_view_ids: (0..num_view).collect(),
        };

        let config = &state.config;
        params.frame_info = FrameInfo {
            aspect_ratio_w: 1,
            aspect_ratio_h: 1,
            frame_rate_n: 24000,
            frame_rate_d: 1001,
            ..FrameInfo::new(
                DecodedFormat::NV12,
                config.coded_resolution(),
                config.display_resolution,
            )
        };

        EngineStatus::Ok
    }

    fn query(&mut self, params: &mut VideoParams) -> EngineStatus {
        if self.state().config.partial_acceleration && params.io_pattern == IoPattern::VideoMemory
        {
            params.io_pattern = IoPattern::SystemMemory;
            return EngineStatus::PartialAcceleration;
        }

        EngineStatus::Ok
    }

    fn query_io_surf(&mut self, params: &VideoParams) -> Result<FrameAllocRequest, EngineStatus> {
        let num_frames = self.state().config.num_frame_suggested;
        let memory = match params.io_pattern {
            IoPattern::SystemMemory => MemType::SYSTEM_MEMORY,
            IoPattern::VideoMemory => MemType::VIDEO_MEMORY_DECODER_TARGET,
        };

        Ok(FrameAllocRequest {
            alloc_id: 0,
            info: params.frame_info,
            mem_type: memory | MemType::EXTERNAL_FRAME | MemType::FROM_DECODE,
            num_frame_min: num_frames,
            num_frame_suggested: num_frames,
        })
    }

    fn init(&mut self, params: &VideoParams) -> EngineStatus {
        let mut state = self.state();
        if params.mvc.num_view == 0 {
            return EngineStatus::Fatal;
        }

        state.inits += 1;
        state.params = Some(params.clone());
        EngineStatus::Ok
    }

    fn decode_frame_async(
        &mut self,
        bs: Option<&mut Bitstream>,
        work: &WorkSurface,
    ) -> FrameDecodeResult {
        let mut state = self.state();

        if state.busy_calls > 0 {
            if state.busy_calls != usize::MAX {
                state.busy_calls -= 1;
            }
            return FrameDecodeResult::status(EngineStatus::DeviceBusy);
        }

        if let Some(status) = state.injected.pop_front() {
            return FrameDecodeResult::status(status);
        }

        state.submissions += 1;
        state.complete_all();

        let Some(frame_info) = state.params.as_ref().map(|params| params.frame_info) else {
            return FrameDecodeResult::status(EngineStatus::Fatal);
        };

        let Some(bs) = bs else {
            // Frames are emitted as soon as their slice is seen, so nothing is left to drain.
            return FrameDecodeResult::status(EngineStatus::MoreData);
        };

        let remaining = bs.remaining();
        let slice = NalScanner::new(remaining, 0).find(|nalu| {
            nalu.header.type_.is_base_view_slice() || nalu.header.type_.is_extension_slice()
        });
        let Some(slice) = slice else {
            bs.consume(remaining.len());
            return FrameDecodeResult::status(EngineStatus::MoreData);
        };
        bs.consume(slice.end_pos());

        let (view_id, frame_order) = if slice.header.type_.is_base_view_slice() {
            let order = state.next_frame_order;
            state.next_frame_order += 1;
            state.last_base_order = order;
            (0, order)
        } else {
            (1, state.last_base_order)
        };

        state.next_sync += 1;
        let sync = SyncPoint(state.next_sync);
        work.lock.lock();
        state.in_flight.push((sync, work.lock.clone()));
        state.fill_frame(work.mem_id, luma_pattern(view_id, frame_order));

        let flags = if bs.timestamp.is_some() {
            FrameDataFlags::ORIGINAL_TIMESTAMP
        } else {
            FrameDataFlags::empty()
        };

        FrameDecodeResult {
            status: EngineStatus::Ok,
            output: Some(DecodeOutput {
                surface: DecodedSurface {
                    mem_id: work.mem_id,
                    info: FrameInfo {
                        view_id,
                        ..frame_info
                    },
                    meta: FrameMetadata {
                        frame_order,
                        timestamp: bs.timestamp,
                        flags,
                    },
                },
                sync,
            }),
        }
    }

    fn sync_operation(&mut self, sync: SyncPoint, _wait_ms: u32) -> EngineStatus {
        let mut state = self.state();
        state.syncs += 1;

        if state.in_execution_polls > 0 {
            state.in_execution_polls -= 1;
            return EngineStatus::InExecution;
        }

        if let Some(pos) = state.in_flight.iter().position(|(s, _)| *s == sync) {
            let (_, lock) = state.in_flight.remove(pos);
            lock.unlock();
        }
        EngineStatus::Ok
    }

    fn reset(&mut self, params: &VideoParams) -> EngineStatus {
        let mut state = self.state();
        state.resets += 1;
        state.complete_all();
        state.params = Some(params.clone());
        EngineStatus::Ok
    }

    fn close_decoder(&mut self) -> EngineStatus {
        let mut state = self.state();
        state.decoder_closes += 1;
        state.complete_all();
        state.params = None;
        state.allocator = None;
        EngineStatus::Ok
    }

    fn close(&mut self) {
        self.state().closed = true;
    }
}

/// Scripts and inspects a [`DummyEngine`] after it has been handed to a decoder.
#[derive(Clone)]
pub struct DummyEngineHandle(Arc<Mutex<DummyState>>);

impl DummyEngineHandle {
    fn state(&self) -> MutexGuard<'_, DummyState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reports the device as busy for the next `calls` submissions. `usize::MAX` never ends.
    pub fn set_busy(&self, calls: usize) {
        self.state().busy_calls = calls;
    }

    /// Answers the next submission with `status`.
    pub fn inject_status(&self, status: EngineStatus) {
        self.state().injected.push_back(status);
    }

    /// Reports the next `polls` sync waits as still in execution.
    pub fn set_in_execution_polls(&self, polls: u32) {
        self.state().in_execution_polls = polls;
    }

    pub fn num_header_probes(&self) -> usize {
        self.state().header_probes
    }

    pub fn num_inits(&self) -> usize {
        self.state().inits
    }

    pub fn num_resets(&self) -> usize {
        self.state().resets
    }

    pub fn num_submissions(&self) -> usize {
        self.state().submissions
    }

    pub fn num_syncs(&self) -> usize {
        self.state().syncs
    }

    pub fn num_decoder_closes(&self) -> usize {
        self.state().decoder_closes
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Surfaces currently held by the engine.
    pub fn num_in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    pub fn has_allocator(&self) -> bool {
        self.state().allocator.is_some()
    }
}
