// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder configuration records carried as container extradata.
//!
//! `MVC1` streams store an `avcC` record for the base view followed by an `mvcC` atom holding the
//! configuration of the non-base view. Both records share the AVC decoder configuration layout:
//!
//! ```text
//! version(1) profile(1) compat(1) level(1) 0b111111xx(lengthSizeMinusOne)
//! 0b111xxxxx(numSPS) { u16 length, SPS } ...
//! numPPS { u16 length, PPS } ...
//! ```

use bytes::Buf;
use thiserror::Error;

const MVCC_TAG: [u8; 4] = *b"mvcC";
/// Size of the atom header: a 32-bit big-endian size followed by the tag.
const ATOM_HEADER_SIZE: usize = 8;
/// Smallest atom holding a configuration record with empty parameter set runs.
const MIN_ATOM_SIZE: usize = 14;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtradataError {
    #[error("extradata is not an AVC decoder configuration record")]
    NotAvcc,
    #[error("no mvcC atom found in extradata")]
    MissingMvcc,
    #[error("mvcC atom is truncated")]
    TruncatedAtom,
    #[error("decoder configuration record is truncated")]
    TruncatedRecord,
    #[error("parameter set {index} declares {declared} bytes but only {available} remain")]
    ParameterSetOutOfBounds {
        index: usize,
        declared: usize,
        available: usize,
    },
}

/// Parameter sets pulled out of a decoder configuration record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceHeader {
    /// NAL length field size used by the samples of this stream.
    pub nal_length_size: usize,
    /// SPS then PPS units, each preceded by a 16-bit big-endian length.
    pub data: Vec<u8>,
    pub num_sps: usize,
    pub num_pps: usize,
}

impl SequenceHeader {
    /// Length field size of the records in `data`.
    pub const DATA_NAL_LENGTH_SIZE: usize = 2;
}

/// Locates the configuration record stored in the `mvcC` atom of `MVC1` extradata.
pub fn find_mvc_config(extradata: &[u8]) -> Result<&[u8], ExtradataError> {
    if extradata.len() <= 4 || extradata[0] != 1 {
        return Err(ExtradataError::NotAvcc);
    }

    let tag_pos = extradata
        .windows(MVCC_TAG.len())
        .position(|window| window == MVCC_TAG)
        .ok_or(ExtradataError::MissingMvcc)?;

    // The tag is preceded by the atom size and at least one byte of the avcC record.
    let atom_start = match tag_pos.checked_sub(4) {
        Some(atom_start) if atom_start > 0 => atom_start,
        _ => return Err(ExtradataError::MissingMvcc),
    };

    let mut atom = &extradata[atom_start..];
    if atom.len() < MIN_ATOM_SIZE {
        return Err(ExtradataError::TruncatedAtom);
    }

    let atom_size = atom.get_u32() as usize;
    if atom_size < MIN_ATOM_SIZE || atom_size > extradata.len() - atom_start {
        return Err(ExtradataError::TruncatedAtom);
    }

    let record = &extradata[atom_start + ATOM_HEADER_SIZE..atom_start + atom_size];
    if record[0] != 1 {
        return Err(ExtradataError::NotAvcc);
    }

    Ok(record)
}

/// Extracts the SPS and PPS runs of a configuration record.
pub fn extract_parameter_sets(record: &[u8]) -> Result<SequenceHeader, ExtradataError> {
    let mut buf = record;
    if buf.remaining() < 6 {
        return Err(ExtradataError::TruncatedRecord);
    }

    if buf.get_u8() != 1 {
        return Err(ExtradataError::NotAvcc);
    }
    // profile, profile compatibility, level
    buf.advance(3);
    let nal_length_size = usize::from(buf.get_u8() & 0x3) + 1;

    let mut header = SequenceHeader {
        nal_length_size,
        ..Default::default()
    };

    let mut index = 0;
    for run in 0..2 {
        if !buf.has_remaining() {
            return Err(ExtradataError::TruncatedRecord);
        }

        let count = usize::from(buf.get_u8() & 0x1f);
        for _ in 0..count {
            if buf.remaining() < 2 {
                return Err(ExtradataError::TruncatedRecord);
            }

            let declared = usize::from(buf.get_u16());
            if declared > buf.remaining() {
                return Err(ExtradataError::ParameterSetOutOfBounds {
                    index,
                    declared,
                    available: buf.remaining(),
                });
            }

            header.data.extend_from_slice(&(declared as u16).to_be_bytes());
            header.data.extend_from_slice(&buf[..declared]);
            buf.advance(declared);
            index += 1;
        }

        if run == 0 {
            header.num_sps = count;
        } else {
            header.num_pps = count;
        }
    }

    Ok(header)
}
