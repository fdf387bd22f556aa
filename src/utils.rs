// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use std::ops::Add;
use std::ops::Div;
use std::ops::Mul;
use std::ops::Sub;

use crate::codec::h264::nalu::NalScanner;
use crate::decoder::mvc::MvcDecoder;
use crate::decoder::CodecControl;
use crate::decoder::DecodeStatus;
use crate::decoder::DecodedPicture;

/// Rounds `value` up to the next multiple of `alignment`.
pub fn align_up<T>(value: T, alignment: T) -> T
where
    T: Copy + Add<Output = T> + Sub<Output = T> + Div<Output = T> + Mul<Output = T> + From<u8>,
{
    (value + alignment - T::from(1)) / alignment * alignment
}

/// Iterator over the NAL units of an Annex-B stream, start codes included.
pub struct AnnexBNalIterator<'a> {
    stream: &'a [u8],
    scanner: NalScanner<'a>,
}

impl<'a> AnnexBNalIterator<'a> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self {
            stream,
            scanner: NalScanner::new(stream, 0),
        }
    }
}

impl<'a> Iterator for AnnexBNalIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        self.scanner
            .next()
            .map(|nalu| &self.stream[nalu.start_pos..nalu.end_pos()])
    }
}

/// Iterator over groups of NAL units holding one access unit of both views.
///
/// A new group starts at the first unit following a slice that is not an extension slice, so
/// parameter sets and prefix units are attached to the access unit they precede.
pub struct AccessUnitIterator<'a> {
    stream: &'a [u8],
    scanner: std::iter::Peekable<NalScanner<'a>>,
}

impl<'a> AccessUnitIterator<'a> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self {
            stream,
            scanner: NalScanner::new(stream, 0).peekable(),
        }
    }
}

impl<'a> Iterator for AccessUnitIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.scanner.next()?;
        let start = first.start_pos;
        let mut end = first.end_pos();
        let mut has_slice =
            first.header.type_.is_base_view_slice() || first.header.type_.is_extension_slice();

        while let Some(nalu) = self.scanner.peek() {
            let type_ = nalu.header.type_;
            if has_slice && !type_.is_extension_slice() {
                break;
            }

            has_slice |= type_.is_base_view_slice() || type_.is_extension_slice();
            end = nalu.end_pos();
            self.scanner.next();
        }

        Some(&self.stream[start..end])
    }
}

/// Simple decoding loop that plays the stream once from start to finish.
///
/// Every picture is passed to `on_picture`, then cleared.
pub fn simple_playback_loop<R, I>(
    decoder: &mut MvcDecoder,
    stream_iter: I,
    on_picture: &mut dyn FnMut(&DecodedPicture),
) -> anyhow::Result<()>
where
    R: AsRef<[u8]>,
    I: Iterator<Item = R>,
{
    // Pulls all ready pictures, returning how many there were.
    let mut check_pictures = |decoder: &mut MvcDecoder| -> usize {
        let mut num_pictures = 0;
        while let Some(mut picture) = decoder.get_picture() {
            on_picture(&picture);
            decoder.clear_picture(&mut picture);
            num_pictures += 1;
        }
        num_pictures
    };

    for (frame_num, packet) in stream_iter.enumerate() {
        let mut data = Some(packet.as_ref());
        // Input is accumulated on the first call, so later calls only collect pictures.
        for _ in 0..16 {
            let status = decoder.decode(
                Some(data.take().unwrap_or_default()),
                None,
                Some(frame_num as u64),
            );
            if status.contains(DecodeStatus::ERROR) {
                anyhow::bail!("decoding of packet {} failed", frame_num);
            }
            if status.contains(DecodeStatus::FLUSHED) {
                log::warn!("decoder flushed at packet {}", frame_num);
                decoder.flush();
                break;
            }

            check_pictures(decoder);
            if status.contains(DecodeStatus::NEED_MORE_INPUT)
                || !status.contains(DecodeStatus::PICTURE_READY)
            {
                break;
            }
        }
    }

    loop {
        let status = decoder.drain();
        if status.contains(DecodeStatus::ERROR) {
            anyhow::bail!("draining failed");
        }
        if check_pictures(decoder) == 0 {
            break;
        }
    }
    decoder.set_codec_control(CodecControl::empty());

    Ok(())
}
