// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-accelerated H.264 MVC (stereoscopic) decoding pipeline.
//!
//! The crate splits into four layers:
//!
//! * [`codec::h264`]: bitstream framing (NAL scanning, AVCC to Annex-B conversion, MVC extradata).
//! * [`allocator`]: frame allocators handing decode targets to the engine.
//! * [`backend`]: the contract with the external decode engine, plus a dummy engine.
//! * [`decoder::mvc`]: the decode driver pairing base and extra views into stereo pictures.

pub mod allocator;
pub mod backend;
pub mod codec;
pub mod decoder;
pub mod utils;
pub mod video_frame;

use std::fmt;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Returns a copy of `self` with both dimensions rounded up to `alignment`.
    pub fn round(mut self, alignment: u32) -> Self {
        self.width = utils::align_up(self.width, alignment);
        self.height = utils::align_up(self.height, alignment);
        self
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// A four-character code, stored little-endian like the container tags it comes from.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fourcc(u32);

impl Fourcc {
    pub const fn from_bytes(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_bytes(n)
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.to_bytes() {
            let c = if c.is_ascii_graphic() || c == b' ' { c as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fourcc({}, 0x{:08x})", self, self.0)
    }
}

/// Pixel format of the decoded surfaces.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
}

impl DecodedFormat {
    pub fn fourcc(self) -> Fourcc {
        match self {
            DecodedFormat::NV12 => Fourcc::from(b"NV12"),
        }
    }
}

/// Copies `src` into `dst` as NV12, removing any extra padding.
pub fn nv12_copy(
    src: &[u8],
    mut dst: &mut [u8],
    width: usize,
    height: usize,
    strides: [usize; 2],
    offsets: [usize; 2],
) {
    let mut src_plane = &src[offsets[0]..];

    // Copy luma
    for _ in 0..height {
        dst[..width].copy_from_slice(&src_plane[..width]);
        dst = &mut dst[width..];
        src_plane = &src_plane[strides[0].min(src_plane.len())..];
    }

    // Align width and height to 2 for the interleaved UV plane.
    let width = width + (width % 2);
    let height = (height + (height % 2)) / 2;

    let mut src_plane = &src[offsets[1]..];

    // Copy chroma
    for _ in 0..height {
        dst[..width].copy_from_slice(&src_plane[..width]);
        dst = &mut dst[width..];
        src_plane = &src_plane[strides[1].min(src_plane.len())..];
    }
}
