// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conversion of length-prefixed ("AVCC") NAL records into Annex-B byte streams.

use byteorder::BigEndian;
use byteorder::ByteOrder;
use thiserror::Error;

/// Start code emitted before the first NAL unit of a converted buffer.
const LONG_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
/// Start code emitted before every following NAL unit.
const SHORT_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("unsupported NAL length size {0}")]
    InvalidNalLengthSize(usize),
    #[error("length field at offset {offset} runs past the end of the buffer")]
    TruncatedLength { offset: usize },
    #[error("NAL at offset {offset} declares {declared} bytes but only {available} remain")]
    NalOutOfBounds {
        offset: usize,
        declared: u64,
        available: usize,
    },
}

/// Rewrites length-prefixed NAL units with start codes.
#[derive(Clone, Debug)]
pub struct AnnexBConverter {
    nal_length_size: usize,
}

impl AnnexBConverter {
    pub fn new(nal_length_size: usize) -> Result<Self, ConvertError> {
        let mut converter = Self { nal_length_size: 4 };
        converter.set_nal_length_size(nal_length_size)?;
        Ok(converter)
    }

    pub fn nal_length_size(&self) -> usize {
        self.nal_length_size
    }

    pub fn set_nal_length_size(&mut self, nal_length_size: usize) -> Result<(), ConvertError> {
        if !(1..=4).contains(&nal_length_size) {
            return Err(ConvertError::InvalidNalLengthSize(nal_length_size));
        }

        self.nal_length_size = nal_length_size;
        Ok(())
    }

    /// Converts `src` into a new Annex-B buffer. Nothing is returned if any record is malformed.
    pub fn convert(&self, src: &[u8]) -> Result<Vec<u8>, ConvertError> {
        let mut dst = Vec::with_capacity(src.len() + src.len() / 2 + LONG_START_CODE.len());
        let mut offset = 0;

        while offset < src.len() {
            let data_offset = offset + self.nal_length_size;
            if data_offset > src.len() {
                return Err(ConvertError::TruncatedLength { offset });
            }

            let declared = BigEndian::read_uint(&src[offset..data_offset], self.nal_length_size);
            let available = src.len() - data_offset;
            let nal_size = match usize::try_from(declared) {
                Ok(nal_size) if nal_size <= available => nal_size,
                _ => {
                    return Err(ConvertError::NalOutOfBounds {
                        offset,
                        declared,
                        available,
                    })
                }
            };

            if dst.is_empty() {
                dst.extend_from_slice(&LONG_START_CODE);
            } else {
                dst.extend_from_slice(&SHORT_START_CODE);
            }
            dst.extend_from_slice(&src[data_offset..data_offset + nal_size]);

            offset = data_offset + nal_size;
        }

        Ok(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::nalu::NalScanner;
    use crate::codec::h264::nalu::NaluType;

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x28, 0xac, 0xd9];
    const PPS: &[u8] = &[0x68, 0xeb, 0xe3, 0xcb];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00, 0x21];
    const EXT_SLICE: &[u8] = &[0x74, 0x81, 0x9a, 0x1f];

    fn avcc(nalus: &[&[u8]], n: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for nalu in nalus {
            out.extend_from_slice(&(nalu.len() as u32).to_be_bytes()[4 - n..]);
            out.extend_from_slice(nalu);
        }
        out
    }

    #[test]
    fn start_codes() {
        let converter = AnnexBConverter::new(4).unwrap();
        let out = converter.convert(&avcc(&[SPS, PPS], 4)).unwrap();

        let mut expected = vec![0x00, 0x00, 0x00, 0x01];
        expected.extend_from_slice(SPS);
        expected.extend_from_slice(&[0x00, 0x00, 0x01]);
        expected.extend_from_slice(PPS);
        assert_eq!(out, expected);
    }

    #[test]
    fn rescan_yields_same_units() {
        let nalus = [SPS, PPS, IDR, EXT_SLICE];
        for n in 1..=4 {
            let converter = AnnexBConverter::new(n).unwrap();
            let out = converter.convert(&avcc(&nalus, n)).unwrap();

            let scanned = NalScanner::new(&out, 0).collect::<Vec<_>>();
            assert_eq!(scanned.len(), nalus.len());
            for (unit, expected) in scanned.iter().zip(nalus) {
                assert_eq!(unit.data(), expected);
            }
            assert_eq!(scanned[3].header.type_, NaluType::SliceExt);
        }
    }

    #[test]
    fn overlong_nal_fails() {
        let mut src = avcc(&[SPS], 2);
        src.extend_from_slice(&[0x00, 0x10, 0x65, 0x88]);

        let converter = AnnexBConverter::new(2).unwrap();
        assert_eq!(
            converter.convert(&src),
            Err(ConvertError::NalOutOfBounds {
                offset: 8,
                declared: 16,
                available: 2
            })
        );
    }

    #[test]
    fn truncated_length_field_fails() {
        let mut src = avcc(&[IDR], 4);
        src.extend_from_slice(&[0x00, 0x00]);

        let converter = AnnexBConverter::new(4).unwrap();
        assert_eq!(
            converter.convert(&src),
            Err(ConvertError::TruncatedLength { offset: 9 })
        );
    }

    #[test]
    fn invalid_length_size() {
        assert_eq!(
            AnnexBConverter::new(0).unwrap_err(),
            ConvertError::InvalidNalLengthSize(0)
        );
        let mut converter = AnnexBConverter::new(3).unwrap();
        assert!(converter.set_nal_length_size(5).is_err());
        assert_eq!(converter.nal_length_size(), 3);
    }

    #[test]
    fn empty_input() {
        let converter = AnnexBConverter::new(4).unwrap();
        assert!(converter.convert(&[]).unwrap().is_empty());
    }
}
