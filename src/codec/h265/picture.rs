// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h265::parser::NaluType;
use crate::codec::h265::slice::Slice;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// The picture order count state carried from one picture to the next, i.e.
/// the POC of prevTid0Pic. See 8.3.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PocDecoding {
    pub prev_pic_order_cnt_lsb: i32,
    pub prev_pic_order_cnt_msb: i32,
}

impl PocDecoding {
    /// Computes PicOrderCntMsb for a picture with `slice_pic_order_cnt_lsb`.
    /// Equation (8-1).
    pub fn derive_msb(&self, slice_pic_order_cnt_lsb: i32, max_pic_order_cnt_lsb: i32) -> i32 {
        let prev_lsb = self.prev_pic_order_cnt_lsb;
        let prev_msb = self.prev_pic_order_cnt_msb;

        if slice_pic_order_cnt_lsb < prev_lsb
            && (prev_lsb - slice_pic_order_cnt_lsb) >= (max_pic_order_cnt_lsb / 2)
        {
            prev_msb + max_pic_order_cnt_lsb
        } else if slice_pic_order_cnt_lsb > prev_lsb
            && (slice_pic_order_cnt_lsb - prev_lsb) > (max_pic_order_cnt_lsb / 2)
        {
            prev_msb - max_pic_order_cnt_lsb
        } else {
            prev_msb
        }
    }

    /// Whether a picture can be prevTid0Pic: TemporalId 0 and not a RASL,
    /// RADL or SLNR picture.
    fn is_valid_prev_tid0_pic(nalu_type: NaluType, temporal_id: u8) -> bool {
        temporal_id == 0
            && nalu_type != NaluType::RadlR
            && nalu_type != NaluType::RaslR
            && !nalu_type.is_slnr()
    }

    /// Records the POC of an independent slice segment that was just parsed.
    pub fn update(&mut self, slice: &Slice) {
        let nalu_type = slice.nalu_header.type_;
        let temporal_id = slice.nalu_header.temporal_id();

        if nalu_type.is_idr() {
            if temporal_id == 0 {
                *self = Default::default();
            }
        } else if Self::is_valid_prev_tid0_pic(nalu_type, temporal_id) {
            self.prev_pic_order_cnt_msb = slice.shared.pic_order_cnt_msb;
            self.prev_pic_order_cnt_lsb = slice.shared.slice_pic_order_cnt_lsb;
        }
    }
}

/// Data associated with a decoded h.265 picture, as far as reference
/// resolution is concerned.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct PictureData {
    pub nalu_type: NaluType,
    pub pic_order_cnt_val: i32,
    /// Position of the picture in decoding order.
    pub decode_order: u64,
    reference: Reference,
}

impl PictureData {
    pub fn new(nalu_type: NaluType, pic_order_cnt_val: i32, decode_order: u64) -> Self {
        Self {
            nalu_type,
            pic_order_cnt_val,
            decode_order,
            reference: Reference::ShortTerm,
        }
    }

    /// Instantiates a new `PictureData` from the first slice of a picture.
    pub fn new_from_slice(slice: &Slice, decode_order: u64) -> Self {
        Self::new(
            slice.nalu_header.type_,
            slice.shared.pic_order_cnt,
            decode_order,
        )
    }

    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn set_reference(&mut self, reference: Reference) {
        log::debug!(
            "Set reference of POC {} to {:?}",
            self.pic_order_cnt_val,
            reference
        );

        self.reference = reference;
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }
}
