// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stereo H.264 MVC decoder driving an asynchronous decode engine.
//!
//! The engine returns base view and extra view surfaces independently. They are queued per view
//! and paired by frame order into [`MvcPicture`]s, which the client pulls with
//! [`MvcDecoder::get_picture`].

mod context;
mod picture;

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

pub use context::MvcContext;
pub use context::SurfaceId;
pub use context::SurfaceInfo;
pub use picture::MvcPicture;

use crate::allocator::general::GeneralAllocator;
use crate::allocator::AllocatorParams;
use crate::allocator::FrameAllocRequest;
use crate::allocator::FrameAllocator;
#[cfg(feature = "texture")]
use crate::allocator::texture::TextureAllocatorParams;
#[cfg(feature = "texture")]
use crate::allocator::texture::TextureDevice;
use crate::backend::Bitstream;
use crate::backend::DecodeEngine;
use crate::backend::EngineError;
use crate::backend::EngineStatus;
use crate::backend::Implementation;
use crate::backend::IoPattern;
use crate::backend::VideoParams;
use crate::codec::h264::annexb::AnnexBConverter;
use crate::codec::h264::extradata::extract_parameter_sets;
use crate::codec::h264::extradata::find_mvc_config;
use crate::codec::h264::extradata::SequenceHeader;
use crate::codec::h264::nalu::NalScanner;
use crate::codec::h264::nalu::NaluType;
use crate::decoder::CodecControl;
use crate::decoder::CodecId;
use crate::decoder::CodecOptions;
use crate::decoder::DecodeError;
use crate::decoder::DecodeStatus;
use crate::decoder::DecodedPicture;
use crate::decoder::OpenError;
use crate::decoder::StereoMode;
use crate::decoder::StreamHints;
use crate::decoder::ViewHandle;
use crate::decoder::TAG_AMVC;
use crate::decoder::TAG_MVC1;
use crate::video_frame::FrameInfo;
use crate::DecodedFormat;

/// Tunables of [`MvcDecoder`].
#[derive(Clone, Debug)]
pub struct MvcDecoderConfig {
    /// Number of operations the engine may keep in flight.
    pub async_depth: u16,
    /// How long the device may stay busy before it gets reset.
    pub busy_timeout: Duration,
    /// Sleep between two submissions to a busy device.
    pub busy_poll_interval: Duration,
    /// Resets attempted before giving up on a busy device.
    pub max_busy_resets: u32,
    /// Wait passed to each sync operation, in milliseconds.
    pub sync_timeout_ms: u32,
    /// Sync operations attempted on a surface still in execution.
    pub max_sync_attempts: u32,
    /// Initial capacity of the bitstream accumulation buffer.
    pub buffer_capacity: usize,
    /// Place all texture frames in a single texture array.
    pub single_texture: bool,
}

impl Default for MvcDecoderConfig {
    fn default() -> Self {
        Self {
            async_depth: 8,
            busy_timeout: Duration::from_millis(25),
            busy_poll_interval: Duration::from_millis(5),
            max_busy_resets: 1,
            sync_timeout_ms: 1000,
            max_sync_attempts: 16,
            buffer_capacity: 2 * 1024 * 1024,
            single_texture: true,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecoderState {
    /// Not opened, or the last `open` failed.
    Uninitialized,
    /// Opened, waiting for a sequence header to initialize the engine.
    Opened,
    /// The engine is initialized and the surface pool allocated.
    DecodeReady,
    /// A fatal error occurred. `open` must be called again.
    Error,
    Closed,
}

/// What happened during one pass of the submission loop.
#[derive(Debug)]
struct Submission {
    /// Last status returned by the engine.
    status: EngineStatus,
    /// Whether the engine was drained instead of fed.
    flushing: bool,
    /// The engine returned at least one surface.
    produced: bool,
    /// No free surface was left to submit.
    starved: bool,
    /// The stream changed: accumulated input must be dropped.
    discard: bool,
    /// The device remained busy despite resets.
    stuck: bool,
}

pub struct MvcDecoder {
    engine: Box<dyn DecodeEngine>,
    config: MvcDecoderConfig,
    #[cfg(feature = "texture")]
    texture_device: Option<Arc<dyn TextureDevice>>,
    state: DecoderState,
    /// Whether the engine holds an initialized decoder, which outlives `DecodeReady` when the
    /// stream parameters change.
    engine_initialized: bool,
    params: VideoParams,
    /// Set for streams whose samples are length-prefixed.
    converter: Option<AnnexBConverter>,
    /// Annex-B input not consumed by the engine yet.
    buffer: Vec<u8>,
    /// Current surface pool, owning its frames. Pictures still out keep older pools alive.
    context: Option<Arc<MvcContext>>,
    base_queue: VecDeque<SurfaceInfo>,
    extra_queue: VecDeque<SurfaceInfo>,
    render_queue: VecDeque<Arc<MvcPicture>>,
    stereo_mode: StereoMode,
    codec_control: CodecControl,
    /// Pictures the client keeps for itself, from the `surfaces` option.
    client_surfaces: u16,
    sysmem: bool,
}

impl MvcDecoder {
    pub fn new(engine: Box<dyn DecodeEngine>, config: MvcDecoderConfig) -> Self {
        let (major, minor) = engine.version();
        log::debug!(
            "{:?} decode engine, version {}.{}",
            engine.implementation(),
            major,
            minor
        );

        Self {
            engine,
            config,
            #[cfg(feature = "texture")]
            texture_device: None,
            state: DecoderState::Uninitialized,
            engine_initialized: false,
            params: Default::default(),
            converter: None,
            buffer: Vec::new(),
            context: None,
            base_queue: Default::default(),
            extra_queue: Default::default(),
            render_queue: Default::default(),
            stereo_mode: Default::default(),
            codec_control: Default::default(),
            client_surfaces: 0,
            sysmem: true,
        }
    }

    /// Lets a hardware engine decode into textures created by `device`.
    #[cfg(feature = "texture")]
    pub fn with_texture_device(mut self, device: Arc<dyn TextureDevice>) -> Self {
        self.texture_device = Some(device);
        self
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn name(&self) -> &'static str {
        "h264-mvc"
    }

    /// Format of the decoded views.
    pub fn pixel_format(&self) -> &'static str {
        if self.sysmem {
            "nv12"
        } else {
            "texture_nv12"
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.engine.implementation() == Implementation::Hardware
    }

    pub fn stereo_mode(&self) -> StereoMode {
        self.stereo_mode
    }

    pub fn set_codec_control(&mut self, flags: CodecControl) {
        self.codec_control = flags;
    }

    pub fn codec_control(&self) -> CodecControl {
        self.codec_control
    }

    /// Prepares decoding of the stream described by `hints`.
    ///
    /// On success `hints.stereo_mode` holds the layout pictures will use. On failure it is set to
    /// `mono` and the decoder is left uninitialized.
    pub fn open(&mut self, hints: &mut StreamHints, options: &CodecOptions) -> Result<(), OpenError> {
        match self.try_open(hints, options) {
            Ok(()) => {
                log::debug!(
                    "opened {}x{} stream (aspect {:.3}), stereo mode {}",
                    hints.width,
                    hints.height,
                    hints.aspect,
                    self.stereo_mode
                );
                Ok(())
            }
            Err(e) => {
                log::error!("failed to open decoder: {}", e);
                hints.stereo_mode = String::from("mono");
                if self.state != DecoderState::Closed {
                    self.destroy_decoder(false);
                    self.state = DecoderState::Uninitialized;
                }
                Err(e)
            }
        }
    }

    fn try_open(&mut self, hints: &mut StreamHints, options: &CodecOptions) -> Result<(), OpenError> {
        if self.state == DecoderState::Closed {
            return Err(OpenError::Closed);
        }
        if !matches!(hints.codec, CodecId::H264 | CodecId::H264Mvc) {
            return Err(OpenError::UnsupportedCodec(hints.codec));
        }
        if hints.codec_tag != TAG_MVC1 && hints.codec_tag != TAG_AMVC {
            return Err(OpenError::UnsupportedTag(hints.codec_tag));
        }

        // Extract everything from the extradata before touching the current session.
        let sequence_header = if hints.codec_tag == TAG_MVC1 {
            let record = find_mvc_config(&hints.extradata)?;
            Some(extract_parameter_sets(record)?)
        } else {
            None
        };

        self.destroy_decoder(false);
        self.params = VideoParams {
            frame_info: FrameInfo {
                fourcc: DecodedFormat::NV12.fourcc(),
                ..Default::default()
            },
            ..Default::default()
        };
        self.buffer = Vec::with_capacity(self.config.buffer_capacity);
        self.client_surfaces = options.surfaces().unwrap_or(0);
        self.context = Some(MvcContext::new());
        self.state = DecoderState::Opened;

        match sequence_header {
            Some(header) => {
                log::debug!(
                    "MVC1 sequence header with {} SPS and {} PPS, NAL length size {}",
                    header.num_sps,
                    header.num_pps,
                    header.nal_length_size
                );
                self.converter = Some(AnnexBConverter::new(
                    SequenceHeader::DATA_NAL_LENGTH_SIZE,
                )?);
                self.bootstrap(&header.data)?;
                if let Some(converter) = self.converter.as_mut() {
                    converter.set_nal_length_size(header.nal_length_size)?;
                }
            }
            None if !hints.extradata.is_empty() => self.bootstrap(&hints.extradata)?,
            None => (),
        }

        self.stereo_mode = StereoMode::from_hint(&hints.stereo_mode);
        hints.stereo_mode = self.stereo_mode.as_str().to_string();

        Ok(())
    }

    /// Feeds the sequence header so the engine can be initialized right away.
    fn bootstrap(&mut self, data: &[u8]) -> Result<(), OpenError> {
        self.try_decode(Some(data), None, None)
            .map_err(OpenError::Bootstrap)?;

        Ok(())
    }

    /// Decodes `data`, or drains the engine if `None`.
    ///
    /// Pictures that became ready are signaled with [`DecodeStatus::PICTURE_READY`] and must be
    /// retrieved with [`MvcDecoder::get_picture`].
    pub fn decode(&mut self, data: Option<&[u8]>, dts: Option<u64>, pts: Option<u64>) -> DecodeStatus {
        match self.try_decode(data, dts, pts) {
            Ok(status) => status,
            Err(e) => {
                log::error!("decode failed: {}", e);
                if e.is_fatal() {
                    self.state = DecoderState::Error;
                }
                DecodeStatus::ERROR
            }
        }
    }

    /// Decodes with the drain flag set, so everything still queued gets paired or dropped.
    ///
    /// The flag stays set until changed with [`MvcDecoder::set_codec_control`].
    pub fn drain(&mut self) -> DecodeStatus {
        self.codec_control |= CodecControl::DRAIN;
        self.decode(None, None, None)
    }

    fn try_decode(
        &mut self,
        data: Option<&[u8]>,
        dts: Option<u64>,
        pts: Option<u64>,
    ) -> Result<DecodeStatus, DecodeError> {
        match self.state {
            DecoderState::Uninitialized | DecoderState::Closed => {
                return Err(DecodeError::NotOpened)
            }
            DecoderState::Error => return Err(DecodeError::Stopped),
            DecoderState::Opened | DecoderState::DecodeReady => (),
        }

        let flushing = data.is_none();
        if let Some(data) = data {
            self.append_input(data)?;
        }

        if self.state != DecoderState::DecodeReady {
            if flushing || !self.init_decoder()? {
                return Ok(DecodeStatus::NEED_MORE_INPUT);
            }
        }

        let mut buffer = std::mem::take(&mut self.buffer);
        let mut bs = Bitstream::new(&buffer, dts, pts);
        let submission = self.submit(&mut bs, flushing)?;
        let consumed = bs.data_offset;

        if submission.stuck {
            self.buffer = buffer;
            return Ok(DecodeStatus::FLUSHED);
        }

        if submission.discard {
            buffer.clear();
        } else {
            let mut consumed = consumed;
            if consumed == 0
                && !submission.produced
                && !submission.flushing
                && !submission.starved
                && !buffer.is_empty()
            {
                log::error!(
                    "decoder did not consume any data, discarding {} bytes",
                    buffer.len()
                );
                consumed = buffer.len();
            }
            buffer.drain(..consumed);
        }
        self.buffer = buffer;

        let status = submission.status;
        if !matches!(status, EngineStatus::MoreData | EngineStatus::MoreSurface) {
            status
                .check("decode_frame_async")
                .map_err(DecodeError::Decode)?;
        }

        let mut result = DecodeStatus::empty();

        let draining = self.codec_control.contains(CodecControl::DRAIN);
        if draining {
            self.flush_queue(submission.flushing && status == EngineStatus::MoreData);
        }
        if !self.render_queue.is_empty() {
            result |= DecodeStatus::PICTURE_READY;
        }

        if status == EngineStatus::MoreData && !draining {
            result |= DecodeStatus::NEED_MORE_INPUT;
        } else if draining && result.is_empty() {
            result |= DecodeStatus::NEED_MORE_INPUT;
        } else if submission.starved && !result.contains(DecodeStatus::PICTURE_READY) {
            result |= DecodeStatus::NEED_MORE_INPUT;
        }

        Ok(result)
    }

    /// Appends `data` to the accumulation buffer in Annex-B form.
    fn append_input(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        match &self.converter {
            Some(converter) => {
                let converted = converter.convert(data)?;
                self.buffer.extend_from_slice(&converted);
            }
            None => self.buffer.extend_from_slice(data),
        }

        self.zero_end_of_sequence();
        Ok(())
    }

    /// Overwrites end of sequence units, which would make the engine stop decoding.
    fn zero_end_of_sequence(&mut self) {
        let positions = NalScanner::new(&self.buffer, 0)
            .filter(|nalu| nalu.header.type_ == NaluType::SeqEnd)
            .map(|nalu| nalu.start_pos)
            .collect::<Vec<_>>();

        for pos in positions {
            let end = (pos + 4).min(self.buffer.len());
            self.buffer[pos..end].fill(0);
        }
    }

    /// Probes the stream header and initializes the engine.
    ///
    /// Returns `false` if more data is needed.
    fn init_decoder(&mut self) -> Result<bool, DecodeError> {
        let has_frames = self
            .context
            .as_ref()
            .is_some_and(|context| context.has_frames());
        if self.engine_initialized || has_frames {
            log::debug!("reinitializing the engine for new stream parameters");
            self.close_engine_decoder();
            self.release_pool();
            self.context = Some(MvcContext::new());
        }
        let context = self.context.clone().ok_or(DecodeError::NotOpened)?;

        let mut bs = Bitstream::new(&self.buffer, None, None);
        let mut status = self.engine.decode_header(&mut bs, &mut self.params);
        if status == EngineStatus::NotEnoughBuffer {
            self.params.mvc.allocate();
            status = self.engine.decode_header(&mut bs, &mut self.params);
        }

        if status == EngineStatus::MoreData {
            log::debug!("not enough data to initialize the decoder");
            self.buffer.clear();
            return Ok(false);
        }
        if let Err(e) = status.check("decode_header") {
            self.buffer.clear();
            return Err(DecodeError::Header(e));
        }

        self.allocate_frames(&context)?;

        let status = self
            .engine
            .init(&self.params)
            .check("init")
            .map_err(DecodeError::Init)?;
        self.engine_initialized = true;
        if status == EngineStatus::PartialAcceleration {
            log::warn!("software decoding will be used instead of the hardware");
        }

        if self.params.mvc.num_view != 2 {
            return Err(DecodeError::WrongViewCount(self.params.mvc.num_view));
        }

        log::debug!(
            "initialized MVC with view ids {:?}",
            self.params
                .mvc
                .views
                .iter()
                .map(|view| view.view_id)
                .collect::<Vec<_>>()
        );
        self.state = DecoderState::DecodeReady;

        Ok(true)
    }

    #[cfg(feature = "texture")]
    fn has_texture_device(&self) -> bool {
        self.texture_device.is_some()
    }

    #[cfg(not(feature = "texture"))]
    fn has_texture_device(&self) -> bool {
        false
    }

    #[cfg(feature = "texture")]
    fn allocator_params(&self, sysmem: bool) -> AllocatorParams {
        let texture = match (&self.texture_device, sysmem) {
            (Some(device), false) => Some(TextureAllocatorParams {
                device: Arc::clone(device),
                single_texture: self.config.single_texture,
            }),
            _ => None,
        };

        AllocatorParams { texture }
    }

    #[cfg(not(feature = "texture"))]
    fn allocator_params(&self, _: bool) -> AllocatorParams {
        Default::default()
    }

    /// Negotiates the output memory with the engine, then allocates the surface pool.
    fn allocate_frames(&mut self, context: &MvcContext) -> Result<(), DecodeError> {
        let hardware = self.engine.implementation() == Implementation::Hardware;
        let mut sysmem = !hardware || !self.has_texture_device();

        self.params.io_pattern = if sysmem {
            IoPattern::SystemMemory
        } else {
            IoPattern::VideoMemory
        };
        self.params.async_depth = self.config.async_depth;

        let status = self
            .engine
            .query(&mut self.params)
            .check("query")
            .map_err(DecodeError::Init)?;
        if status == EngineStatus::PartialAcceleration {
            log::warn!("partial acceleration, decoding to system memory");
            self.params.io_pattern = IoPattern::SystemMemory;
            sysmem = true;
        }

        let request = match self.engine.query_io_surf(&self.params) {
            Err(EngineStatus::Unsupported) if hardware && !sysmem => {
                log::warn!("engine cannot use the texture device, decoding to system memory");
                self.params.io_pattern = IoPattern::SystemMemory;
                sysmem = true;
                self.engine
                    .query(&mut self.params)
                    .check("query")
                    .map_err(DecodeError::Init)?;
                self.engine.query_io_surf(&self.params)
            }
            request => request,
        }
        .map_err(|status| {
            DecodeError::Init(EngineError {
                op: "query_io_surf",
                status,
            })
        })?;

        if hardware && request.num_frame_suggested < self.params.async_depth {
            return Err(DecodeError::NotEnoughSurfaces {
                suggested: request.num_frame_suggested,
                required: self.params.async_depth,
            });
        }

        let mut allocator = GeneralAllocator::default();
        allocator.init(&self.allocator_params(sysmem))?;

        // Queue plus two extra pairs of frames for safety.
        let mut shared = self.params.async_depth.saturating_add(4);
        if !sysmem {
            shared = shared.saturating_add(self.client_surfaces.saturating_mul(2));
        }
        let to_allocate = request.num_frame_suggested.saturating_add(shared);
        log::debug!(
            "engine suggested {} frames, creating {} buffers",
            request.num_frame_suggested,
            to_allocate
        );

        let request = FrameAllocRequest {
            num_frame_suggested: to_allocate,
            ..request
        };
        let response = allocator.alloc_frames(&request)?;
        context.allocate_buffers(&self.params.frame_info, &response.mids);

        let allocator = Arc::new(Mutex::new(allocator));
        context.set_frames(Arc::clone(&allocator), response, sysmem);
        self.sysmem = sysmem;

        self.engine
            .set_frame_allocator(allocator)
            .check("set_frame_allocator")
            .map_err(DecodeError::Init)?;

        Ok(())
    }

    /// Submits `bs` until the engine needs more data or fails.
    fn submit(&mut self, bs: &mut Bitstream, flushing: bool) -> Result<Submission, DecodeError> {
        let context = self.context.clone().ok_or(DecodeError::NotOpened)?;
        let mut submission = Submission {
            status: EngineStatus::MoreData,
            flushing,
            produced: false,
            starved: false,
            discard: false,
            stuck: false,
        };

        let mut resets = 0;
        let mut deadline = Instant::now() + self.config.busy_timeout;
        loop {
            let Some((_, work)) = context.get_free() else {
                submission.starved = true;
                break;
            };

            let input = if submission.flushing {
                None
            } else {
                Some(&mut *bs)
            };
            let result = self.engine.decode_frame_async(input, &work);

            if result.status == EngineStatus::DeviceBusy {
                if Instant::now() >= deadline {
                    if resets >= self.config.max_busy_resets {
                        log::error!("decoder did not respond after reset, flushing");
                        submission.stuck = true;
                        break;
                    }

                    log::warn!(
                        "decoder did not respond within {:?}, resetting",
                        self.config.busy_timeout
                    );
                    if let Err(e) = self.engine.reset(&self.params).check("reset") {
                        log::warn!("{}", e);
                    }
                    resets += 1;
                    deadline = Instant::now() + self.config.busy_timeout;
                }

                std::thread::sleep(self.config.busy_poll_interval);
                continue;
            }
            deadline = Instant::now() + self.config.busy_timeout;
            submission.status = result.status;

            if result.status == EngineStatus::IncompatibleParams {
                log::debug!("stream parameters changed, flushing the engine");
                submission.discard = true;
                submission.flushing = true;
                self.state = DecoderState::Opened;
                continue;
            }

            if let Some(output) = result.output {
                submission.produced = true;
                match context.mark_queued(&output.surface, output.sync) {
                    Some(surface) => self.handle_output(surface),
                    None => log::error!(
                        "engine returned unknown surface {:?}",
                        output.surface.mem_id
                    ),
                }
                continue;
            }

            if result.status != EngineStatus::MoreSurface && result.status.is_error() {
                break;
            }
        }

        Ok(submission)
    }

    fn handle_output(&mut self, surface: SurfaceInfo) {
        if surface.info.view_id == 0 {
            self.base_queue.push_back(surface);
        } else {
            self.extra_queue.push_back(surface);
        }

        let max = usize::from(self.config.async_depth >> 1) + 1;
        while self.base_queue.len() >= max && self.extra_queue.len() >= max {
            if !self.process_output() {
                break;
            }
        }
    }

    /// Pairs or drops the surfaces at the front of the view queues.
    ///
    /// Returns `false` if nothing could be done.
    fn process_output(&mut self) -> bool {
        let Some(context) = self.context.clone() else {
            return false;
        };
        let order = match (self.base_queue.front(), self.extra_queue.front()) {
            (Some(base), Some(extra)) => base.meta.frame_order.cmp(&extra.meta.frame_order),
            _ => return false,
        };

        match order {
            Ordering::Equal => {
                if let (Some(base), Some(extra)) =
                    (self.base_queue.pop_front(), self.extra_queue.pop_front())
                {
                    self.sync_output(&context, base, extra);
                }
            }
            Ordering::Less => {
                if let Some(base) = self.base_queue.pop_front() {
                    log::debug!("dropping base view {} without extra view", base.meta.frame_order);
                    context.release_buffer(base.id);
                }
            }
            Ordering::Greater => {
                if let Some(extra) = self.extra_queue.pop_front() {
                    log::debug!("dropping extra view {} without base view", extra.meta.frame_order);
                    context.release_buffer(extra.id);
                }
            }
        }

        true
    }

    fn sync_output(&mut self, context: &Arc<MvcContext>, base: SurfaceInfo, extra: SurfaceInfo) {
        self.sync_surface(context, &base);
        self.sync_surface(context, &extra);
        self.render_queue.push_back(context.get_picture(base, extra));
    }

    /// Waits for the engine to finish writing `surface`.
    fn sync_surface(&mut self, context: &MvcContext, surface: &SurfaceInfo) {
        let Some(sync) = context.take_sync(surface.id) else {
            return;
        };

        for _ in 0..self.config.max_sync_attempts.max(1) {
            match self.engine.sync_operation(sync, self.config.sync_timeout_ms) {
                EngineStatus::InExecution => continue,
                EngineStatus::Ok => return,
                status => {
                    log::warn!("sync of surface {:?} failed: {:?}", surface.mem_id, status);
                    return;
                }
            }
        }

        log::warn!(
            "surface {:?} still in execution after {} sync attempts",
            surface.mem_id,
            self.config.max_sync_attempts
        );
    }

    /// Pairs everything that can be paired, and drops what is left once the engine is empty.
    fn flush_queue(&mut self, engine_empty: bool) {
        if self.state != DecoderState::DecodeReady {
            return;
        }

        while !self.base_queue.is_empty() && !self.extra_queue.is_empty() {
            if !self.process_output() {
                break;
            }
        }

        if engine_empty && (!self.base_queue.is_empty() || !self.extra_queue.is_empty()) {
            log::debug!(
                "dropping {} unpaired surfaces",
                self.base_queue.len() + self.extra_queue.len()
            );
            self.release_queued();
        }
    }

    /// Returns the next stereo picture, if one is ready.
    ///
    /// System memory views come back mapped; [`MvcDecoder::clear_picture`] unmaps them.
    pub fn get_picture(&mut self) -> Option<DecodedPicture> {
        let picture = self.render_queue.pop_front()?;
        let (base_view, extra_view) = picture.map_views();
        let info = picture.base_view().info;
        let (display_width, display_height) = display_size(&info);

        Some(DecodedPicture {
            width: info.width,
            height: info.height,
            display_width,
            display_height,
            memory: picture.memory(),
            stereo_mode: self.stereo_mode,
            color_range: 0,
            flags: self.codec_control,
            dts: None,
            pts: picture.base_view().meta.original_timestamp(),
            base_view,
            extra_view,
            mvc: Some(picture),
        })
    }

    /// Unmaps the views of `picture` and drops its reference to the surfaces.
    pub fn clear_picture(&mut self, picture: &mut DecodedPicture) {
        let base_view = picture.base_view.take();
        let extra_view = picture.extra_view.take();
        if let Some(mvc) = picture.mvc.take() {
            mvc.unmap_views(base_view, extra_view);
        }
    }

    /// Drops all pending input, queued surfaces and pictures, and resets the engine.
    pub fn flush(&mut self) {
        self.buffer.clear();

        if self.state == DecoderState::DecodeReady {
            if let Err(e) = self.engine.reset(&self.params).check("reset") {
                log::warn!("{}", e);
            }
        }

        self.render_queue.clear();
        self.release_queued();
    }

    /// Releases everything. The decoder cannot be used anymore afterwards.
    pub fn close(&mut self) {
        if self.state == DecoderState::Closed {
            return;
        }

        self.destroy_decoder(true);
        self.state = DecoderState::Closed;
        log::debug!("decoder closed");
    }

    fn release_queued(&mut self) {
        match &self.context {
            Some(context) => {
                for surface in self.base_queue.drain(..).chain(self.extra_queue.drain(..)) {
                    context.release_buffer(surface.id);
                }
            }
            None => {
                self.base_queue.clear();
                self.extra_queue.clear();
            }
        }
    }

    fn close_engine_decoder(&mut self) {
        if !self.engine_initialized {
            return;
        }

        if let Err(e) = self.engine.close_decoder().check("close_decoder") {
            log::warn!("{}", e);
        }
        self.engine_initialized = false;
    }

    /// Lets go of the surface pool. Its frames are freed once no picture references it anymore.
    fn release_pool(&mut self) {
        self.render_queue.clear();
        self.release_queued();
        self.context = None;
    }

    fn destroy_decoder(&mut self, full: bool) {
        self.close_engine_decoder();
        self.release_pool();
        self.params.mvc = Default::default();
        self.converter = None;
        self.buffer = Vec::new();

        if full {
            self.engine.close();
        }
    }
}

impl Drop for MvcDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

/// Display size of a frame: crop height and the width matching its aspect ratio, rescaled to fit
/// the coded width. Both are multiples of 4 when derived from the aspect ratio.
fn display_size(info: &FrameInfo) -> (u32, u32) {
    if info.crop_w == 0 || info.crop_h == 0 {
        return (info.crop_w, info.crop_h);
    }

    let crop_ratio = f64::from(info.crop_w) / f64::from(info.crop_h);
    let aspect = if info.aspect_ratio_w == 0 || info.aspect_ratio_h == 0 {
        crop_ratio
    } else {
        f64::from(info.aspect_ratio_w) / f64::from(info.aspect_ratio_h) * crop_ratio
    };

    let mut display_height = info.crop_h;
    let mut display_width = (f64::from(info.crop_h) * aspect).round() as u32 & !3;
    if display_width > info.width {
        display_width = info.width;
        display_height = (f64::from(info.width) / aspect).round() as u32 & !3;
    }

    (display_width, display_height)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::backend::dummy::luma_pattern;
    use crate::backend::dummy::DummyConfig;
    use crate::backend::dummy::DummyEngine;
    use crate::backend::dummy::DummyEngineHandle;
    use crate::codec::h264::extradata::tests::config_record;
    use crate::codec::h264::extradata::tests::mvc1_extradata;
    use crate::codec::h264::extradata::tests::PPS;
    use crate::codec::h264::extradata::tests::SUBSET_SPS;
    use crate::codec::h264::extradata::ExtradataError;
    use crate::decoder::PictureMemory;
    use crate::Fourcc;

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x28, 0xac];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x21];
    const P_SLICE: &[u8] = &[0x41, 0x9a, 0x02, 0x11];
    const EXT_SLICE: &[u8] = &[0x74, 0x81, 0x9a, 0x33];
    const EOS: &[u8] = &[0x0a];

    /// Pool size for the dummy engine defaults: suggested + async depth + 4.
    const POOL_SIZE: usize = 10 + 8 + 4;

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut data = Vec::new();
        for nal in nals {
            data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
            data.extend_from_slice(nal);
        }
        data
    }

    fn avcc(nals: &[&[u8]]) -> Vec<u8> {
        let mut data = Vec::new();
        for nal in nals {
            data.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            data.extend_from_slice(nal);
        }
        data
    }

    fn access_unit(index: usize) -> [&'static [u8]; 2] {
        [if index == 0 { IDR } else { P_SLICE }, EXT_SLICE]
    }

    fn test_config() -> MvcDecoderConfig {
        MvcDecoderConfig {
            busy_timeout: Duration::from_millis(50),
            busy_poll_interval: Duration::from_millis(1),
            buffer_capacity: 4096,
            ..Default::default()
        }
    }

    fn amvc_hints() -> StreamHints {
        StreamHints {
            codec: CodecId::H264Mvc,
            codec_tag: TAG_AMVC,
            extradata: annexb(&[SPS, SUBSET_SPS, PPS]),
            width: 1920,
            height: 1080,
            ..Default::default()
        }
    }

    fn decoder_with(config: DummyConfig) -> (MvcDecoder, DummyEngineHandle) {
        let engine = DummyEngine::new(config);
        let handle = engine.handle();
        (MvcDecoder::new(Box::new(engine), test_config()), handle)
    }

    fn open_amvc() -> (MvcDecoder, DummyEngineHandle) {
        let (mut decoder, handle) = decoder_with(Default::default());
        decoder
            .open(&mut amvc_hints(), &Default::default())
            .unwrap();
        (decoder, handle)
    }

    fn num_free(decoder: &MvcDecoder) -> usize {
        decoder.context.as_ref().unwrap().num_free()
    }

    /// Decodes `units`, then drains. Pictures are not cleared.
    fn decode_all(decoder: &mut MvcDecoder, units: &[Vec<u8>]) -> Vec<DecodedPicture> {
        let mut pictures = Vec::new();
        for (i, unit) in units.iter().enumerate() {
            let status = decoder.decode(Some(unit), None, Some(i as u64 * 40));
            assert!(!status.contains(DecodeStatus::ERROR));
            assert!(status.contains(DecodeStatus::NEED_MORE_INPUT));
            pictures.extend(std::iter::from_fn(|| decoder.get_picture()));
        }

        let status = decoder.drain();
        assert!(!status.contains(DecodeStatus::ERROR));
        pictures.extend(std::iter::from_fn(|| decoder.get_picture()));
        pictures
    }

    /// Checks that every picture pairs both views of one frame order, and that no surface backs
    /// more than one view of the pictures held.
    fn check_pairs(pictures: &[DecodedPicture]) -> Vec<u32> {
        let mut surfaces = HashSet::new();
        pictures
            .iter()
            .map(|picture| {
                let mvc = picture.mvc.as_ref().unwrap();
                assert_eq!(mvc.base_view().info.view_id, 0);
                assert_eq!(mvc.extra_view().info.view_id, 1);
                assert_eq!(
                    mvc.base_view().meta.frame_order,
                    mvc.extra_view().meta.frame_order
                );
                assert!(surfaces.insert(mvc.base_view().id), "{:?}", mvc.base_view());
                assert!(surfaces.insert(mvc.extra_view().id), "{:?}", mvc.extra_view());
                mvc.frame_order()
            })
            .collect()
    }

    fn luma(view: &Option<ViewHandle>) -> u8 {
        match view {
            Some(ViewHandle::System(data)) => data.buffer.lock().unwrap().as_slice()[data.y_offset()],
            other => panic!("expected a mapped view, got {:?}", other),
        }
    }

    #[test]
    fn amvc_happy_path() {
        let (mut decoder, handle) = open_amvc();
        assert_eq!(decoder.state(), DecoderState::DecodeReady);
        assert_eq!(handle.num_inits(), 1);
        assert!(handle.has_allocator());
        assert_eq!(decoder.context.as_ref().unwrap().num_buffers(), POOL_SIZE);
        assert_eq!(decoder.stereo_mode(), StereoMode::BlockLr);
        assert_eq!(decoder.pixel_format(), "nv12");
        assert!(decoder.is_hardware());

        let units = (0..8).map(|i| annexb(&access_unit(i))).collect::<Vec<_>>();
        let mut pictures = decode_all(&mut decoder, &units);

        assert_eq!(check_pairs(&pictures), (0..8).collect::<Vec<_>>());
        for (i, picture) in pictures.iter().enumerate() {
            assert_eq!((picture.width, picture.height), (1920, 1088));
            assert_eq!((picture.display_width, picture.display_height), (1920, 1080));
            let info = picture.mvc.as_ref().unwrap().extra_view().info;
            assert_eq!((info.crop_w, info.crop_h), (1920, 1080));
            assert_eq!(picture.stereo_mode, StereoMode::BlockLr);
            assert_eq!(picture.memory, PictureMemory::System);
            assert_eq!(picture.pts, Some(i as u64 * 40));
            assert_eq!(picture.dts, None);
            assert_eq!(luma(&picture.base_view), luma_pattern(0, i as u32));
            assert_eq!(luma(&picture.extra_view), luma_pattern(1, i as u32));
        }

        for picture in pictures.iter_mut() {
            decoder.clear_picture(picture);
            assert!(picture.mvc.is_none());
        }
        assert_eq!(num_free(&decoder), POOL_SIZE);
    }

    #[test]
    fn mvc1_happy_path() {
        let (mut decoder, handle) = decoder_with(Default::default());
        let mut hints = StreamHints {
            codec: CodecId::H264,
            codec_tag: TAG_MVC1,
            extradata: mvc1_extradata(&config_record(4, &[SUBSET_SPS], &[PPS])),
            stereo_mode: String::from("block_rl"),
            ..Default::default()
        };
        decoder.open(&mut hints, &Default::default()).unwrap();
        assert_eq!(hints.stereo_mode, "block_rl");
        assert_eq!(decoder.state(), DecoderState::DecodeReady);
        assert_eq!(handle.num_inits(), 1);
        assert_eq!(decoder.converter.as_ref().unwrap().nal_length_size(), 4);

        let units = (0..6).map(|i| avcc(&access_unit(i))).collect::<Vec<_>>();
        let pictures = decode_all(&mut decoder, &units);
        assert_eq!(check_pairs(&pictures), (0..6).collect::<Vec<_>>());
        assert!(pictures
            .iter()
            .all(|picture| picture.stereo_mode == StereoMode::BlockRl));
    }

    #[test]
    fn amvc_without_extradata_initializes_on_first_input() {
        let (mut decoder, handle) = decoder_with(Default::default());
        let mut hints = StreamHints {
            extradata: Vec::new(),
            stereo_mode: String::from("mono"),
            ..amvc_hints()
        };
        decoder.open(&mut hints, &Default::default()).unwrap();
        assert_eq!(hints.stereo_mode, "block_lr");
        assert_eq!(decoder.state(), DecoderState::Opened);

        // Slices without parameter sets cannot initialize the engine.
        let status = decoder.decode(Some(&annexb(&access_unit(1))), None, None);
        assert_eq!(status, DecodeStatus::NEED_MORE_INPUT);
        assert!(decoder.buffer.is_empty());
        assert_eq!(handle.num_inits(), 0);

        let mut unit = annexb(&[SPS, SUBSET_SPS, PPS]);
        unit.extend(annexb(&access_unit(0)));
        let status = decoder.decode(Some(&unit), None, None);
        assert_eq!(status, DecodeStatus::NEED_MORE_INPUT);
        assert_eq!(decoder.state(), DecoderState::DecodeReady);
        assert_eq!((decoder.base_queue.len(), decoder.extra_queue.len()), (1, 1));
    }

    #[test]
    fn busy_device_is_reset_once_then_flushed() {
        let (mut decoder, handle) = open_amvc();
        handle.set_busy(usize::MAX);

        let status = decoder.decode(Some(&annexb(&access_unit(0))), None, None);
        assert_eq!(status, DecodeStatus::FLUSHED);
        assert_eq!(handle.num_resets(), 1);
        assert_eq!(decoder.state(), DecoderState::DecodeReady);

        decoder.flush();
        assert_eq!(handle.num_resets(), 2);
        assert!(decoder.buffer.is_empty());
    }

    #[test]
    fn transient_busy_is_retried() {
        let (mut decoder, handle) = open_amvc();
        handle.set_busy(3);

        let status = decoder.decode(Some(&annexb(&access_unit(0))), None, None);
        assert_eq!(status, DecodeStatus::NEED_MORE_INPUT);
        assert_eq!(handle.num_resets(), 0);
        assert_eq!((decoder.base_queue.len(), decoder.extra_queue.len()), (1, 1));
    }

    #[test]
    fn malformed_extradata_leaves_decoder_uninitialized() {
        let record = config_record(4, &[SUBSET_SPS], &[PPS]);
        let cases = [
            (record.clone(), "missing mvcC"),
            (mvc1_extradata(&record[..record.len() - 2]), "truncated PPS"),
        ];

        for (extradata, case) in cases {
            let (mut decoder, handle) = decoder_with(Default::default());
            let mut hints = StreamHints {
                codec: CodecId::H264Mvc,
                codec_tag: TAG_MVC1,
                extradata,
                stereo_mode: String::from("block_lr"),
                ..Default::default()
            };

            let err = decoder.open(&mut hints, &Default::default()).unwrap_err();
            assert!(matches!(err, OpenError::Extradata(_)), "{}: {:?}", case, err);
            assert_eq!(decoder.state(), DecoderState::Uninitialized, "{}", case);
            assert_eq!(hints.stereo_mode, "mono", "{}", case);
            assert_eq!(handle.num_header_probes(), 0, "{}", case);
            assert_eq!(handle.num_inits(), 0, "{}", case);
            assert!(decoder.context.is_none(), "{}", case);

            assert_eq!(decoder.decode(Some(&[0, 0, 1, 0x65]), None, None), DecodeStatus::ERROR);
        }

        assert!(matches!(
            find_mvc_config(&record),
            Err(ExtradataError::MissingMvcc)
        ));
    }

    #[test]
    fn unsupported_streams_fail_fast() {
        let (mut decoder, handle) = decoder_with(Default::default());

        let mut hints = StreamHints {
            codec: CodecId::Hevc,
            ..amvc_hints()
        };
        assert!(matches!(
            decoder.open(&mut hints, &Default::default()),
            Err(OpenError::UnsupportedCodec(CodecId::Hevc))
        ));
        assert_eq!(hints.stereo_mode, "mono");

        let mut hints = StreamHints {
            codec_tag: Fourcc::from(b"avc1"),
            ..amvc_hints()
        };
        assert!(matches!(
            decoder.open(&mut hints, &Default::default()),
            Err(OpenError::UnsupportedTag(_))
        ));
        assert_eq!(handle.num_header_probes(), 0);
        assert_eq!(decoder.state(), DecoderState::Uninitialized);
    }

    #[test]
    fn unpaired_views_are_dropped() {
        let (mut decoder, _handle) = open_amvc();

        let units = (0..8)
            .map(|i| match i {
                // Extra view missing.
                2 => annexb(&[P_SLICE]),
                _ => annexb(&access_unit(i)),
            })
            .collect::<Vec<_>>();
        let mut pictures = decode_all(&mut decoder, &units);

        assert_eq!(check_pairs(&pictures), vec![0, 1, 3, 4, 5, 6, 7]);
        for picture in pictures.iter_mut() {
            decoder.clear_picture(picture);
        }
        assert_eq!(num_free(&decoder), POOL_SIZE);
    }

    #[test]
    fn stale_extra_view_is_dropped() {
        let (mut decoder, _handle) = open_amvc();

        let units = (0..8)
            .map(|i| match i {
                // A second extra view for the previous frame order, without a base view.
                3 => annexb(&[EXT_SLICE]),
                _ => annexb(&access_unit(i)),
            })
            .collect::<Vec<_>>();
        let mut pictures = decode_all(&mut decoder, &units);

        assert_eq!(check_pairs(&pictures), (0..7).collect::<Vec<_>>());
        for picture in pictures.iter_mut() {
            decoder.clear_picture(picture);
        }
        assert!(decoder.base_queue.is_empty() && decoder.extra_queue.is_empty());
        assert_eq!(num_free(&decoder), POOL_SIZE);
    }

    #[test]
    fn pictures_hold_surfaces_until_cleared() {
        let (mut decoder, _handle) = open_amvc();
        assert_eq!(num_free(&decoder), POOL_SIZE);

        let units = (0..8).map(|i| annexb(&access_unit(i))).collect::<Vec<_>>();
        let mut pictures = decode_all(&mut decoder, &units);
        assert_eq!(pictures.len(), 8);
        assert_eq!(num_free(&decoder), POOL_SIZE - 16);

        // A picture shared with the renderer keeps its surfaces.
        let shared = pictures[0].mvc.clone().unwrap();
        shared.mark_render();
        for picture in pictures.iter_mut() {
            decoder.clear_picture(picture);
        }
        assert_eq!(num_free(&decoder), POOL_SIZE - 2);
        drop(shared);
        assert_eq!(num_free(&decoder), POOL_SIZE);
    }

    #[test]
    fn slow_sync_is_waited_for() {
        let (mut decoder, handle) = open_amvc();
        handle.set_in_execution_polls(3);

        for i in 0..5 {
            decoder.decode(Some(&annexb(&access_unit(i))), None, None);
        }
        assert_eq!(decoder.render_queue.len(), 1);
        assert_eq!(handle.num_syncs(), 5);
    }

    #[test]
    fn incompatible_params_reinitialize() {
        let (mut decoder, handle) = open_amvc();
        decoder.decode(Some(&annexb(&access_unit(0))), None, None);
        handle.inject_status(EngineStatus::IncompatibleParams);

        let status = decoder.decode(Some(&annexb(&access_unit(1))), None, None);
        assert_eq!(status, DecodeStatus::NEED_MORE_INPUT);
        assert_eq!(decoder.state(), DecoderState::Opened);
        assert!(decoder.buffer.is_empty());

        let mut unit = annexb(&[SPS, SUBSET_SPS, PPS]);
        unit.extend(annexb(&access_unit(0)));
        let status = decoder.decode(Some(&unit), None, None);
        assert_eq!(status, DecodeStatus::NEED_MORE_INPUT);
        assert_eq!(decoder.state(), DecoderState::DecodeReady);
        assert_eq!(handle.num_inits(), 2);
        assert_eq!(handle.num_decoder_closes(), 1);
        assert_eq!(decoder.context.as_ref().unwrap().num_buffers(), POOL_SIZE);
        assert_eq!((decoder.base_queue.len(), decoder.extra_queue.len()), (1, 1));
    }

    #[test]
    fn fatal_engine_status_stops_decoder() {
        let (mut decoder, handle) = open_amvc();
        let status = decoder.decode(Some(&annexb(&access_unit(0))), None, None);
        assert!(!status.contains(DecodeStatus::ERROR));

        handle.inject_status(EngineStatus::Fatal);
        let status = decoder.decode(Some(&annexb(&access_unit(1))), None, None);
        assert_eq!(status, DecodeStatus::ERROR);
        assert_eq!(decoder.state(), DecoderState::Error);

        let submissions = handle.num_submissions();
        assert_eq!(
            decoder.decode(Some(&annexb(&access_unit(2))), None, None),
            DecodeStatus::ERROR
        );
        assert_eq!(decoder.drain(), DecodeStatus::ERROR);
        assert_eq!(handle.num_submissions(), submissions);

        // A new stream starts over.
        decoder.open(&mut amvc_hints(), &Default::default()).unwrap();
        assert_eq!(decoder.state(), DecoderState::DecodeReady);
    }

    #[test]
    fn end_of_sequence_is_zeroed() {
        let (mut decoder, _handle) = decoder_with(Default::default());
        decoder.append_input(&annexb(&[P_SLICE, EOS, EXT_SLICE])).unwrap();

        let types = NalScanner::new(&decoder.buffer, 0)
            .map(|nalu| nalu.header.type_)
            .collect::<Vec<_>>();
        assert_eq!(types, vec![NaluType::Slice, NaluType::SliceExt]);
        let eos_pos = 4 + P_SLICE.len();
        assert_eq!(decoder.buffer[eos_pos..eos_pos + 5], [0, 0, 0, 0, 0]);
    }

    #[test]
    fn flush_returns_everything() {
        let (mut decoder, handle) = open_amvc();
        for i in 0..6 {
            decoder.decode(Some(&annexb(&access_unit(i))), None, None);
        }
        assert_eq!(decoder.render_queue.len(), 2);

        decoder.flush();
        assert_eq!(handle.num_resets(), 1);
        assert!(decoder.get_picture().is_none());
        assert!(decoder.base_queue.is_empty() && decoder.extra_queue.is_empty());
        assert_eq!(num_free(&decoder), POOL_SIZE);
    }

    #[test]
    fn hardware_needs_enough_surfaces() {
        let (mut decoder, handle) = decoder_with(DummyConfig {
            num_frame_suggested: 4,
            ..Default::default()
        });

        let err = decoder
            .open(&mut amvc_hints(), &Default::default())
            .unwrap_err();
        assert!(matches!(
            err,
            OpenError::Bootstrap(DecodeError::NotEnoughSurfaces {
                suggested: 4,
                required: 8
            })
        ));
        assert_eq!(decoder.state(), DecoderState::Uninitialized);
        assert_eq!(handle.num_inits(), 0);
    }

    #[test]
    fn software_engine_accepts_few_surfaces() {
        let (mut decoder, _handle) = decoder_with(DummyConfig {
            implementation: Implementation::Software,
            num_frame_suggested: 2,
            ..Default::default()
        });

        decoder
            .open(&mut amvc_hints(), &Default::default())
            .unwrap();
        assert!(!decoder.is_hardware());
        assert_eq!(decoder.context.as_ref().unwrap().num_buffers(), 2 + 8 + 4);
    }

    #[test]
    fn close_is_idempotent() {
        let (mut decoder, handle) = open_amvc();
        decoder.close();
        decoder.close();
        assert!(handle.is_closed());
        assert_eq!(handle.num_decoder_closes(), 1);
        assert_eq!(decoder.state(), DecoderState::Closed);

        assert_eq!(decoder.decode(Some(&[0, 0, 1, 0x65]), None, None), DecodeStatus::ERROR);
        assert!(matches!(
            decoder.open(&mut amvc_hints(), &Default::default()),
            Err(OpenError::Closed)
        ));
    }

    #[test]
    fn display_geometry() {
        let hd = FrameInfo {
            aspect_ratio_w: 1,
            aspect_ratio_h: 1,
            ..FrameInfo::new(
                DecodedFormat::NV12,
                (1920, 1088).into(),
                (1920, 1080).into(),
            )
        };
        assert_eq!(display_size(&hd), (1920, 1080));

        // Anamorphic 1440x1080 with 4:3 samples is wider than the coded width.
        let hdv = FrameInfo {
            aspect_ratio_w: 4,
            aspect_ratio_h: 3,
            ..FrameInfo::new(
                DecodedFormat::NV12,
                (1440, 1088).into(),
                (1440, 1080).into(),
            )
        };
        assert_eq!(display_size(&hdv), (1440, 808));

        let unknown_sar = FrameInfo::new(
            DecodedFormat::NV12,
            (736, 576).into(),
            (720, 576).into(),
        );
        assert_eq!(display_size(&unknown_sar), (720, 576));
    }

    #[cfg(feature = "texture")]
    mod texture {
        use super::*;
        use crate::allocator::texture::tests::FakeTextureDevice;

        fn texture_decoder(
            config: DummyConfig,
        ) -> (MvcDecoder, DummyEngineHandle, Arc<FakeTextureDevice>) {
            let device = Arc::new(FakeTextureDevice::default());
            let (decoder, handle) = decoder_with(config);
            let decoder = decoder.with_texture_device(Arc::clone(&device) as Arc<dyn TextureDevice>);
            (decoder, handle, device)
        }

        #[test]
        fn pictures_carry_native_handles() {
            let (mut decoder, _handle, device) = texture_decoder(Default::default());
            let options = CodecOptions {
                keys: vec![("surfaces".into(), "2".into())],
            };
            decoder.open(&mut amvc_hints(), &options).unwrap();
            assert_eq!(decoder.pixel_format(), "texture_nv12");
            assert_eq!(device.num_live(), 1);
            let pool_size = POOL_SIZE + 4;
            assert_eq!(decoder.context.as_ref().unwrap().num_buffers(), pool_size);

            let units = (0..8).map(|i| annexb(&access_unit(i))).collect::<Vec<_>>();
            let mut pictures = decode_all(&mut decoder, &units);
            assert_eq!(check_pairs(&pictures).len(), 8);

            for picture in pictures.iter_mut() {
                assert_eq!(picture.memory, PictureMemory::Video);
                let (Some(ViewHandle::Native(base)), Some(ViewHandle::Native(extra))) =
                    (&picture.base_view, &picture.extra_view)
                else {
                    panic!("expected native handles");
                };
                assert_eq!(base.texture, extra.texture);
                assert_ne!(base.subresource, extra.subresource);
                assert!((base.subresource as usize) < pool_size);
                decoder.clear_picture(picture);
            }

            decoder.close();
            assert_eq!(device.num_live(), 0);
        }

        #[test]
        fn reinitialization_keeps_frames_of_held_pictures() {
            let (mut decoder, handle, device) = texture_decoder(Default::default());
            decoder.open(&mut amvc_hints(), &Default::default()).unwrap();
            for i in 0..6 {
                decoder.decode(Some(&annexb(&access_unit(i))), None, None);
            }
            let mut held = decoder.get_picture().unwrap();
            let Some(ViewHandle::Native(texture)) = held.base_view.clone() else {
                panic!("expected a native handle");
            };

            handle.inject_status(EngineStatus::IncompatibleParams);
            decoder.decode(Some(&annexb(&access_unit(6))), None, None);
            assert_eq!(decoder.state(), DecoderState::Opened);

            let mut unit = annexb(&[SPS, SUBSET_SPS, PPS]);
            unit.extend(annexb(&access_unit(0)));
            decoder.decode(Some(&unit), None, None);
            assert_eq!(decoder.state(), DecoderState::DecodeReady);
            assert_eq!(handle.num_inits(), 2);

            // The old pool lives on in the held picture, next to the new one.
            assert_eq!(device.num_live(), 2);
            assert!(device.live.lock().unwrap().contains(&texture.texture));
            assert_eq!(held.memory, PictureMemory::Video);

            decoder.clear_picture(&mut held);
            assert_eq!(device.num_live(), 1);
            assert!(!device.live.lock().unwrap().contains(&texture.texture));

            decoder.close();
            assert_eq!(device.num_live(), 0);
        }

        #[test]
        fn partial_acceleration_falls_back_to_system_memory() {
            let (mut decoder, _handle, device) = texture_decoder(DummyConfig {
                partial_acceleration: true,
                ..Default::default()
            });
            decoder
                .open(&mut amvc_hints(), &Default::default())
                .unwrap();

            assert_eq!(decoder.pixel_format(), "nv12");
            assert_eq!(device.num_live(), 0);
            assert_eq!(decoder.params.io_pattern, IoPattern::SystemMemory);
        }
    }
}
