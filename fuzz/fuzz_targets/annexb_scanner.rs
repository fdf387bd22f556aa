// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mvc_codecs::codec::h264::annexb::AnnexBConverter;
use mvc_codecs::codec::h264::extradata::extract_parameter_sets;
use mvc_codecs::codec::h264::extradata::find_mvc_config;
use mvc_codecs::codec::h264::nalu::NalScanner;

fuzz_target!(|data: &[u8]| {
    for nal_length_size in 0..=4 {
        for nalu in NalScanner::new(data, nal_length_size) {
            assert!(nalu.end_pos() <= data.len());
        }
    }

    for nal_length_size in 1..=4 {
        if let Ok(converter) = AnnexBConverter::new(nal_length_size) {
            let _ = converter.convert(data);
        }
    }

    if let Ok(record) = find_mvc_config(data) {
        let _ = extract_parameter_sets(record);
    }
});
