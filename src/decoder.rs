// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Types shared between the decoder and its clients.

pub mod mvc;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use crate::allocator::AllocatorError;
use crate::allocator::FrameData;
use crate::allocator::NativeHandle;
use crate::backend::EngineError;
use crate::codec::h264::annexb::ConvertError;
use crate::codec::h264::extradata::ExtradataError;
use crate::decoder::mvc::MvcPicture;
use crate::Fourcc;

bitflags! {
    /// Result of a call to [`mvc::MvcDecoder::decode`].
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct DecodeStatus: u32 {
        const ERROR = 0x01;
        /// The decoder can take more input.
        const NEED_MORE_INPUT = 0x02;
        /// At least one picture can be retrieved with `get_picture`.
        const PICTURE_READY = 0x04;
        /// The decoder gave up on a stuck device; the client should flush.
        const FLUSHED = 0x10;
    }
}

bitflags! {
    /// Control flags set by the client.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct CodecControl: u32 {
        /// End of stream: pair and return everything that is still queued.
        const DRAIN = 0x01;
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CodecId {
    #[default]
    H264,
    H264Mvc,
    Hevc,
    Other,
}

/// Codec tag of MVC streams carrying an `mvcC` atom in their extradata.
pub const TAG_MVC1: Fourcc = Fourcc::from_bytes(b"MVC1");
/// Codec tag of Annex-B MVC streams.
pub const TAG_AMVC: Fourcc = Fourcc::from_bytes(b"AMVC");

/// Stream properties provided by the demuxer.
#[derive(Clone, Debug, Default)]
pub struct StreamHints {
    pub codec: CodecId,
    pub codec_tag: Fourcc,
    pub extradata: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Display aspect ratio, 0 when unknown.
    pub aspect: f64,
    /// Stereo layout hint. Rewritten by `open` with the layout actually used.
    pub stereo_mode: String,
}

/// Free-form key/value options.
#[derive(Clone, Debug, Default)]
pub struct CodecOptions {
    pub keys: Vec<(String, String)>,
}

impl CodecOptions {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Number of pictures the client keeps for itself.
    pub fn surfaces(&self) -> Option<u16> {
        let value = self.get("surfaces")?;
        match value.trim().parse() {
            Ok(surfaces) => Some(surfaces),
            Err(_) => {
                log::warn!("ignoring invalid surfaces option {:?}", value);
                None
            }
        }
    }
}

/// How both views are laid out for presentation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum StereoMode {
    /// Base view on the left.
    #[default]
    BlockLr,
    /// Base view on the right.
    BlockRl,
}

impl StereoMode {
    /// Parses a player hint. Anything but `block_rl` selects `block_lr`.
    pub fn from_hint(hint: &str) -> Self {
        match hint {
            "block_rl" => StereoMode::BlockRl,
            _ => StereoMode::BlockLr,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StereoMode::BlockLr => "block_lr",
            StereoMode::BlockRl => "block_rl",
        }
    }
}

impl fmt::Display for StereoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the views of a picture live.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PictureMemory {
    #[default]
    System,
    Video,
}

/// Access to the content of one view.
#[derive(Clone, Debug)]
pub enum ViewHandle {
    /// Mapped system memory frame, unmapped by `clear_picture`.
    System(FrameData),
    Native(NativeHandle),
}

/// A stereo picture as handed to the client.
#[derive(Clone, Debug, Default)]
pub struct DecodedPicture {
    /// Coded width.
    pub width: u32,
    /// Coded height.
    pub height: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub memory: PictureMemory,
    pub stereo_mode: StereoMode,
    pub color_range: u8,
    pub flags: CodecControl,
    pub dts: Option<u64>,
    pub pts: Option<u64>,
    pub base_view: Option<ViewHandle>,
    pub extra_view: Option<ViewHandle>,
    /// Keeps both surfaces out of the pool until the picture is cleared.
    pub mvc: Option<Arc<MvcPicture>>,
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("unsupported codec {0:?}")]
    UnsupportedCodec(CodecId),
    #[error("unsupported codec tag {0:?}")]
    UnsupportedTag(Fourcc),
    #[error("invalid MVC extradata: {0}")]
    Extradata(#[from] ExtradataError),
    #[error("invalid sequence header: {0}")]
    Convert(#[from] ConvertError),
    #[error("failed to decode the sequence header: {0}")]
    Bootstrap(#[source] DecodeError),
    #[error("decoder is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed input: {0}")]
    Convert(#[from] ConvertError),
    #[error("failed to parse the stream header: {0}")]
    Header(#[source] EngineError),
    #[error("failed to initialize the engine: {0}")]
    Init(#[source] EngineError),
    #[error("the engine failed to decode: {0}")]
    Decode(#[source] EngineError),
    #[error("frame allocation failed: {0}")]
    Allocator(#[from] AllocatorError),
    #[error("only MVC with two views is supported, stream has {0}")]
    WrongViewCount(u16),
    #[error("engine suggested {suggested} surfaces, at least {required} are needed")]
    NotEnoughSurfaces { suggested: u16, required: u16 },
    #[error("decoder is not opened")]
    NotOpened,
    #[error("decoder stopped after a fatal error")]
    Stopped,
}

impl DecodeError {
    /// Whether the decoder cannot continue with this stream.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::Init(_)
                | DecodeError::Decode(_)
                | DecodeError::Allocator(_)
                | DecodeError::WrongViewCount(_)
                | DecodeError::NotEnoughSurfaces { .. }
        )
    }
}
