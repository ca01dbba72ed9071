// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod bit_cursor;
pub mod dpb;
pub mod error;
pub mod header_set;
pub mod parser;
pub mod picture;
pub mod pool;
pub mod rps;
pub mod sei;
pub mod slice;
