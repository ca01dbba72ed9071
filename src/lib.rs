// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of H.265 (HEVC) elementary streams: NAL units, parameter sets,
//! SEI messages and slice segment headers, along with the picture order
//! count and reference picture list derivations a decoder needs to program
//! its hardware.
//!
//! The entry point is [`codec::h265::parser::Parser`], fed with the NAL units
//! produced by [`bitstream_utils::NalIterator`].

pub mod bitstream_utils;
pub mod codec;
