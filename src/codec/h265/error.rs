// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

/// Errors raised while parsing H.265 headers.
///
/// `NotEnoughData` and `InvalidStream` only invalidate the NAL unit being
/// parsed: the caller is expected to drop it and continue with the next one.
/// `NullPointer` and `Alloc` come from the object pool and are fatal to the
/// whole parsing session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("not enough data left in the bitstream")]
    NotEnoughData,
    #[error("invalid stream: {0}")]
    InvalidStream(String),
    #[error("null pointer: {0}")]
    NullPointer(&'static str),
    #[error("allocation failure: {0}")]
    Alloc(String),
}

impl ParseError {
    /// Whether the error invalidates the whole session instead of a single
    /// NAL unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ParseError::NullPointer(_) | ParseError::Alloc(_))
    }
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Shorthand for building an `InvalidStream` error out of a format string.
macro_rules! invalid_stream {
    ($($arg:tt)*) => {
        $crate::codec::h265::error::ParseError::InvalidStream(format!($($arg)*))
    };
}

pub(crate) use invalid_stream;
