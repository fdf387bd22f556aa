// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mvc_codecs::backend::dummy::DummyEngine;
use mvc_codecs::decoder::mvc::MvcDecoder;
use mvc_codecs::decoder::CodecId;
use mvc_codecs::decoder::StreamHints;
use mvc_codecs::decoder::TAG_AMVC;
use mvc_codecs::utils::simple_playback_loop;
use mvc_codecs::utils::AccessUnitIterator;

fuzz_target!(|data: &[u8]| {
    let mut decoder = MvcDecoder::new(Box::new(DummyEngine::default()), Default::default());
    let mut hints = StreamHints {
        codec: CodecId::H264Mvc,
        codec_tag: TAG_AMVC,
        ..Default::default()
    };
    if decoder.open(&mut hints, &Default::default()).is_err() {
        return;
    }

    let _ = simple_playback_loop(&mut decoder, AccessUnitIterator::new(data), &mut |_| ());
});
