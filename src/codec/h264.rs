// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 bitstream framing helpers.

pub mod annexb;
pub mod extradata;
pub mod nalu;
