// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NAL unit scanning over Annex-B or length-prefixed buffers.

use byteorder::BigEndian;
use byteorder::ByteOrder;
use enumn::N;

const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    /// Whether this unit carries coded slice data of the base view.
    pub fn is_base_view_slice(self) -> bool {
        matches!(
            self,
            NaluType::Slice
                | NaluType::SliceDpa
                | NaluType::SliceDpb
                | NaluType::SliceDpc
                | NaluType::SliceIdr
        )
    }

    /// Whether this unit carries coded slice data of a non-base view.
    pub fn is_extension_slice(self) -> bool {
        matches!(self, NaluType::SliceExt | NaluType::SliceDepth)
    }
}

/// The one-byte NAL unit header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NaluHeader {
    pub forbidden_zero_bit: bool,
    pub ref_idc: u8,
    pub type_: NaluType,
}

impl NaluHeader {
    pub fn parse(byte: u8) -> Self {
        Self {
            forbidden_zero_bit: (byte >> 7) & 1 != 0,
            ref_idc: (byte >> 5) & 0x3,
            // Reserved and unspecified types are all reported as `Unknown`.
            type_: NaluType::n(byte & 0x1f).unwrap_or(NaluType::Unknown),
        }
    }
}

/// A NAL unit located by [`NalScanner`]. Borrows the scanned buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NalUnit<'a> {
    pub header: NaluHeader,
    /// Offset of the start code (Annex-B) or of the length field (length-prefixed).
    pub start_pos: usize,
    /// Offset of the NAL header byte.
    pub data_pos: usize,
    data: &'a [u8],
}

impl<'a> NalUnit<'a> {
    /// The unit's bytes, header included, without any framing.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte of the unit.
    pub fn end_pos(&self) -> usize {
        self.data_pos + self.data.len()
    }
}

impl AsRef<[u8]> for NalUnit<'_> {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

/// Splits a buffer into NAL units.
///
/// `nal_length_size` selects the framing: 0 for Annex-B start codes, 1 to 4 for big-endian length
/// fields of that many bytes. Scanning never fails: malformed input simply ends the iteration.
#[derive(Debug)]
pub struct NalScanner<'a> {
    data: &'a [u8],
    nal_length_size: usize,
    cur_pos: usize,
}

impl<'a> NalScanner<'a> {
    pub fn new(data: &'a [u8], nal_length_size: usize) -> Self {
        let mut scanner = Self {
            data: &[],
            nal_length_size: 0,
            cur_pos: 0,
        };
        scanner.set_buffer(data, nal_length_size);
        scanner
    }

    /// Restarts scanning over `data`.
    pub fn set_buffer(&mut self, data: &'a [u8], nal_length_size: usize) {
        self.data = data;
        self.nal_length_size = nal_length_size;
        self.cur_pos = 0;

        // An Annex-B buffer does not necessarily start on a NAL boundary.
        if nal_length_size == 0 {
            self.cur_pos = self.find_start_code(0).unwrap_or(data.len());
        }
    }

    pub fn nal_length_size(&self) -> usize {
        self.nal_length_size
    }

    fn is_start_code_at(&self, pos: usize) -> bool {
        self.data.get(pos..pos + 3) == Some(&START_CODE[..])
    }

    /// Offset of the next start code at or after `from`. A start code must be followed by at
    /// least one byte to count.
    fn find_start_code(&self, from: usize) -> Option<usize> {
        let end = self.data.len().checked_sub(1)?;
        self.data
            .get(from..end)?
            .windows(3)
            .position(|window| window == START_CODE)
            .map(|pos| pos + from)
    }

    /// Advances to the next unit, returning `None` at the end of the buffer or on malformed
    /// framing.
    pub fn read_next(&mut self) -> Option<NalUnit<'a>> {
        let size = self.data.len();
        if self.cur_pos >= size {
            return None;
        }

        let (start_pos, data_pos, end_pos) = if self.nal_length_size != 0 {
            let start_pos = self.cur_pos;
            let data_pos = start_pos + self.nal_length_size;
            if data_pos >= size {
                self.cur_pos = size;
                return None;
            }

            let nal_size =
                BigEndian::read_uint(&self.data[start_pos..data_pos], self.nal_length_size);
            let end_pos = match usize::try_from(nal_size)
                .ok()
                .and_then(|nal_size| data_pos.checked_add(nal_size))
            {
                Some(end_pos) if end_pos <= size && end_pos > data_pos => end_pos,
                _ => {
                    log::debug!(
                        "NAL at {} declares {} bytes, {} available",
                        start_pos,
                        nal_size,
                        size - data_pos
                    );
                    self.cur_pos = size;
                    return None;
                }
            };

            self.cur_pos = end_pos;
            (start_pos, data_pos, end_pos)
        } else {
            // Skip zero bytes that are not part of a start code.
            while self.data[self.cur_pos] == 0x00 && !self.is_start_code_at(self.cur_pos) {
                self.cur_pos += 1;
                if self.cur_pos >= size {
                    return None;
                }
            }

            let start_pos = self.cur_pos;
            let data_pos = start_pos + START_CODE.len();
            if data_pos >= size {
                self.cur_pos = size;
                return None;
            }

            self.cur_pos = self.find_start_code(data_pos).unwrap_or(size);

            // Discard trailing_zero_8bits, keeping at least the header byte.
            let mut end_pos = self.cur_pos;
            while end_pos > data_pos + 1 && self.data[end_pos - 1] == 0x00 {
                end_pos -= 1;
            }

            (start_pos, data_pos, end_pos)
        };

        Some(NalUnit {
            header: NaluHeader::parse(self.data[data_pos]),
            start_pos,
            data_pos,
            data: &self.data[data_pos..end_pos],
        })
    }
}

impl<'a> Iterator for NalScanner<'a> {
    type Item = NalUnit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next()
    }
}
