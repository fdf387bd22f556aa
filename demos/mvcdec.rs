// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decodes an Annex-B H.264 MVC stream with the dummy engine and prints a checksum of each
//! stereo picture.
//!
//! Useful to exercise the decode driver on real streams without decoding hardware.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use argh::FromArgs;
use mvc_codecs::backend::dummy::DummyEngine;
use mvc_codecs::decoder::mvc::MvcDecoder;
use mvc_codecs::decoder::mvc::MvcDecoderConfig;
use mvc_codecs::decoder::CodecId;
use mvc_codecs::decoder::CodecOptions;
use mvc_codecs::decoder::DecodedPicture;
use mvc_codecs::decoder::StreamHints;
use mvc_codecs::decoder::ViewHandle;
use mvc_codecs::decoder::TAG_AMVC;
use mvc_codecs::nv12_copy;
use mvc_codecs::utils::simple_playback_loop;
use mvc_codecs::utils::AccessUnitIterator;
use mvc_codecs::video_frame::FrameInfo;

/// Stereo H.264 decoder using mvc-codecs
#[derive(Debug, FromArgs)]
struct Args {
    /// input file
    #[argh(positional)]
    input: PathBuf,

    /// stop after this many access units
    #[argh(option)]
    limit: Option<usize>,

    /// stereo layout hint, block_lr or block_rl. Default: block_lr
    #[argh(option, default = "String::from(\"block_lr\")")]
    stereo_mode: String,

    /// number of pictures kept by the client
    #[argh(option)]
    surfaces: Option<u16>,
}

/// CRC32 of the NV12 content of a mapped view within the crop rectangle of `info`.
fn view_crc(view: &Option<ViewHandle>, info: &FrameInfo) -> Option<u32> {
    let Some(ViewHandle::System(data)) = view else {
        return None;
    };
    let buffer = data.buffer.lock().ok()?;
    let (width, height) = (info.crop_w as usize, info.crop_h as usize);

    let mut frame = vec![0u8; width * height + (width + width % 2) * ((height + height % 2) / 2)];
    nv12_copy(
        buffer.as_slice(),
        &mut frame,
        width,
        height,
        [data.pitch, data.pitch],
        data.crop_offsets(info),
    );
    Some(crc32fast::hash(&frame))
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let input = {
        let mut buf = Vec::new();
        File::open(&args.input)
            .expect("error opening input file")
            .read_to_end(&mut buf)
            .expect("error reading input file");
        buf
    };

    let mut decoder = MvcDecoder::new(
        Box::new(DummyEngine::default()),
        MvcDecoderConfig::default(),
    );

    let mut hints = StreamHints {
        codec: CodecId::H264Mvc,
        codec_tag: TAG_AMVC,
        stereo_mode: args.stereo_mode,
        ..Default::default()
    };
    let options = CodecOptions {
        keys: args
            .surfaces
            .map(|surfaces| vec![("surfaces".to_string(), surfaces.to_string())])
            .unwrap_or_default(),
    };
    decoder
        .open(&mut hints, &options)
        .expect("failed to open decoder");
    println!(
        "{}: {} output, stereo mode {}",
        decoder.name(),
        decoder.pixel_format(),
        hints.stereo_mode
    );

    let units = AccessUnitIterator::new(&input).take(args.limit.unwrap_or(usize::MAX));

    let mut num_pictures = 0;
    let mut on_picture = |picture: &DecodedPicture| {
        let Some(mvc) = picture.mvc.as_ref() else {
            return;
        };
        println!(
            "picture {} (order {}, pts {:?}): {}x{} base {:08x?} extra {:08x?}",
            num_pictures,
            mvc.frame_order(),
            picture.pts,
            picture.display_width,
            picture.display_height,
            view_crc(&picture.base_view, &mvc.base_view().info),
            view_crc(&picture.extra_view, &mvc.extra_view().info),
        );
        num_pictures += 1;
    };

    simple_playback_loop(&mut decoder, units, &mut on_picture).expect("error during playback");
    decoder.close();

    println!("decoded {} stereo pictures", num_pictures);
}
