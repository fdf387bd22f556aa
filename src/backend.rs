// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contract between the decoder and the hardware decode engine.
//!
//! The engine performs the actual decoding asynchronously: the decoder submits bitstream and a
//! free surface, the engine answers with a status and possibly a decoded surface and a sync
//! point to wait on before the surface content can be used.

pub mod dummy;

use thiserror::Error;

use crate::allocator::FrameAllocRequest;
use crate::allocator::SharedAllocator;
use crate::video_frame::DecodedSurface;
use crate::video_frame::FrameInfo;
use crate::video_frame::WorkSurface;

/// Status vocabulary of the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// More bitstream is needed to produce output.
    MoreData,
    /// Another work surface is needed to produce output.
    MoreSurface,
    /// The device cannot take work right now, retry later.
    DeviceBusy,
    /// The stream changed in a way that needs the decoder to be reinitialized.
    IncompatibleParams,
    /// An output structure is too small for what the engine wants to report.
    NotEnoughBuffer,
    /// Warning: only part of the decoding runs on the hardware.
    PartialAcceleration,
    /// Warning: the operation is still running.
    InExecution,
    Unsupported,
    Fatal,
}

impl EngineStatus {
    /// Whether the status reports a failure rather than success or a warning.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            EngineStatus::Ok | EngineStatus::PartialAcceleration | EngineStatus::InExecution
        )
    }

    /// Turns failures into an [`EngineError`] tagged with `op`.
    pub fn check(self, op: &'static str) -> Result<Self, EngineError> {
        if self.is_error() {
            Err(EngineError { op, status: self })
        } else {
            Ok(self)
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("engine {op} failed: {status:?}")]
pub struct EngineError {
    pub op: &'static str,
    pub status: EngineStatus,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Implementation {
    Software,
    Hardware,
}

/// Where the engine writes decoded frames.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IoPattern {
    #[default]
    SystemMemory,
    VideoMemory,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MvcViewDependency {
    pub view_id: u16,
    pub anchor_refs: Vec<u16>,
    pub non_anchor_refs: Vec<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MvcOperationPoint {
    pub temporal_id: u16,
    pub level_idc: u16,
    pub target_view_ids: Vec<u16>,
}

/// Multiview sequence description filled in by the header probe.
///
/// The engine reports the counts; the arrays must be sized by the caller before the engine can
/// fill them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MvcSeqDesc {
    pub num_view: u16,
    pub num_view_id: u16,
    pub num_op: u16,
    pub views: Vec<MvcViewDependency>,
    pub view_ids: Vec<u16>,
    pub ops: Vec<MvcOperationPoint>,
}

impl MvcSeqDesc {
    /// Whether the arrays can hold the reported counts.
    pub fn has_room(&self) -> bool {
        self.views.len() >= usize::from(self.num_view)
            && self.view_ids.len() >= usize::from(self.num_view_id)
            && self.ops.len() >= usize::from(self.num_op)
    }

    /// Sizes the arrays after the counts reported by the engine.
    pub fn allocate(&mut self) {
        self.views
            .resize_with(usize::from(self.num_view), Default::default);
        self.view_ids.resize(usize::from(self.num_view_id), 0);
        self.ops.resize_with(usize::from(self.num_op), Default::default);
    }
}

/// Decoding parameters negotiated with the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoParams {
    pub frame_info: FrameInfo,
    pub io_pattern: IoPattern,
    /// Number of operations the engine may have in flight.
    pub async_depth: u16,
    pub mvc: MvcSeqDesc,
}

/// Bitstream handed to the engine. The engine advances `data_offset` past what it consumed.
#[derive(Debug)]
pub struct Bitstream<'a> {
    pub data: &'a [u8],
    pub data_offset: usize,
    pub timestamp: Option<u64>,
    pub decode_timestamp: Option<u64>,
}

impl<'a> Bitstream<'a> {
    pub fn new(data: &'a [u8], decode_timestamp: Option<u64>, timestamp: Option<u64>) -> Self {
        Self {
            data,
            data_offset: 0,
            timestamp,
            decode_timestamp,
        }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.data_offset.min(self.data.len())..]
    }

    pub fn consume(&mut self, len: usize) {
        self.data_offset = (self.data_offset + len).min(self.data.len());
    }
}

/// Completion token of an asynchronous decode operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncPoint(pub u64);

#[derive(Clone, Debug)]
pub struct DecodeOutput {
    pub surface: DecodedSurface,
    pub sync: SyncPoint,
}

#[derive(Clone, Debug)]
pub struct FrameDecodeResult {
    pub status: EngineStatus,
    pub output: Option<DecodeOutput>,
}

impl FrameDecodeResult {
    pub fn status(status: EngineStatus) -> Self {
        Self {
            status,
            output: None,
        }
    }
}

/// A decode session on the engine.
pub trait DecodeEngine: Send {
    fn implementation(&self) -> Implementation;
    /// API version as (major, minor).
    fn version(&self) -> (u16, u16);
    /// Registers the allocator providing the frames referenced by memory id.
    fn set_frame_allocator(&mut self, allocator: SharedAllocator) -> EngineStatus;
    /// Probes the stream parameters, without consuming the bitstream.
    fn decode_header(&mut self, bs: &mut Bitstream, params: &mut VideoParams) -> EngineStatus;
    /// Validates `params`, possibly correcting them.
    fn query(&mut self, params: &mut VideoParams) -> EngineStatus;
    /// Returns what the engine needs in terms of frames for `params`.
    fn query_io_surf(&mut self, params: &VideoParams) -> Result<FrameAllocRequest, EngineStatus>;
    fn init(&mut self, params: &VideoParams) -> EngineStatus;
    /// Submits `bs` (or drains the engine when `None`) and a free surface to decode into.
    fn decode_frame_async(
        &mut self,
        bs: Option<&mut Bitstream>,
        work: &WorkSurface,
    ) -> FrameDecodeResult;
    /// Waits up to `wait_ms` for the operation behind `sync` to complete.
    fn sync_operation(&mut self, sync: SyncPoint, wait_ms: u32) -> EngineStatus;
    /// Drops all pending work and restarts with `params`.
    fn reset(&mut self, params: &VideoParams) -> EngineStatus;
    /// Tears down the decoder, keeping the session.
    fn close_decoder(&mut self) -> EngineStatus;
    /// Closes the session.
    fn close(&mut self);
}
