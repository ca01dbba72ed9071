// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Slice segment header parsing, 7.3.6.
//!
//! A slice is made of one independent slice segment followed by any number of
//! dependent ones. The fields only signalled in the independent segment live
//! in [`SliceShared`], which dependent segments reference instead of copying.

use std::sync::Arc;

use enumn::N;

use crate::codec::h265::bit_cursor::BitCursor;
use crate::codec::h265::error::invalid_stream;
use crate::codec::h265::error::Result;
use crate::codec::h265::header_set::SharedHeader;
use crate::codec::h265::parser::NaluHeader;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::MAX_NUM_REF_PICS;
use crate::codec::h265::parser::MAX_PPS_ID;
use crate::codec::h265::picture::PocDecoding;
use crate::codec::h265::rps::derive_long_term_pocs;
use crate::codec::h265::rps::parse_long_term_ref_pics;
use crate::codec::h265::rps::parse_short_term_ref_pic_set;
use crate::codec::h265::rps::ref_poc_lists;
use crate::codec::h265::rps::ReferencePictureSet;

/// Most entry points a slice segment header may declare.
pub const MAX_ENTRY_POINT_OFFSETS: u32 = 440;
/// Most active entries of a reference picture list.
const MAX_REF_IDX_ACTIVE: u32 = 15;
/// Bound on NumPicTotalCurr.
const MAX_NUM_PIC_TOTAL_CURR: usize = 8;
/// Bound on the weight flags signalled by a prediction weight table.
const MAX_SUM_WEIGHT_FLAGS: u32 = 24;

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// See table 7-7.
pub enum SliceType {
    B = 0,
    #[default]
    P = 1,
    I = 2,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

/// `ref_pic_lists_modification()`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub ref_pic_list_modification_flag_l0: bool,
    /// Index in RefPicListTemp0 of each entry of RefPicList0.
    pub list_entry_l0: [u32; MAX_NUM_REF_PICS],
    pub ref_pic_list_modification_flag_l1: bool,
    pub list_entry_l1: [u32; MAX_NUM_REF_PICS],
}

/// Weighting factors of one reference picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WeightFactors {
    pub luma_weight_flag: bool,
    pub chroma_weight_flag: bool,
    /// LumaWeightLX.
    pub luma_weight: i32,
    /// `luma_offset_lX`.
    pub luma_offset: i32,
    /// ChromaWeightLX, for Cb and Cr.
    pub chroma_weight: [i32; 2],
    /// ChromaOffsetLX, for Cb and Cr.
    pub chroma_offset: [i32; 2],
}

/// `pred_weight_table()`, with the weights and offsets derived per 7.4.7.3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u32,
    /// ChromaLog2WeightDenom.
    pub chroma_log2_weight_denom: u32,
    /// Indexed by list, then reference index.
    pub factors: [[WeightFactors; MAX_NUM_REF_PICS]; 2],
}

impl PredWeightTable {
    /// A table where every reference uses the default weights for the given
    /// denominators.
    pub fn with_defaults(luma_log2_weight_denom: u32, chroma_log2_weight_denom: u32) -> Self {
        let factors = WeightFactors {
            luma_weight: 1 << luma_log2_weight_denom,
            chroma_weight: [1 << chroma_log2_weight_denom; 2],
            ..Default::default()
        };

        Self {
            luma_log2_weight_denom,
            chroma_log2_weight_denom,
            factors: [[factors; MAX_NUM_REF_PICS]; 2],
        }
    }
}

/// The part of the slice segment header that can be parsed without knowing
/// the active parameter sets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SliceHeaderPart1 {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub pic_parameter_set_id: u8,
}

/// Parses the slice segment header up to `slice_pic_parameter_set_id`.
pub fn parse_slice_header_part1(
    c: &mut BitCursor,
    nalu_header: &NaluHeader,
) -> Result<SliceHeaderPart1> {
    let mut part1 = SliceHeaderPart1 {
        first_slice_segment_in_pic_flag: c.read_flag()?,
        ..Default::default()
    };

    if nalu_header.type_.is_irap() {
        part1.no_output_of_prior_pics_flag = c.read_flag()?;
    }

    part1.pic_parameter_set_id = c.read_ue_max(MAX_PPS_ID)? as u8;

    Ok(part1)
}

/// The fields of a slice segment header that are specific to each segment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub pic_parameter_set_id: u8,
    pub dependent_slice_segment_flag: bool,
    /// `slice_segment_address`, in CTBs.
    pub segment_address: u32,
    pub num_entry_point_offsets: u32,
    pub offset_len_minus1: u32,
    pub entry_point_offset_minus1: Vec<u32>,
    /// Byte offset of each substream in the slice data, starting with 0.
    pub tile_locations: Vec<u32>,
    pub slice_segment_header_extension_length: u32,
    /// Offset of the slice data in the RBSP, the NAL header included.
    pub slice_data_byte_offset: usize,
}

/// The fields of a slice segment header signalled by the independent slice
/// segment and shared by the dependent ones that follow it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceShared {
    /// SliceAddrRs, the address of the independent slice segment.
    pub slice_address: u32,
    pub slice_type: SliceType,
    pub pic_output_flag: bool,
    pub colour_plane_id: u8,
    pub slice_pic_order_cnt_lsb: i32,
    /// PicOrderCntMsb.
    pub pic_order_cnt_msb: i32,
    /// PicOrderCntVal.
    pub pic_order_cnt: i32,
    pub short_term_ref_pic_set_sps_flag: bool,
    pub short_term_ref_pic_set_idx: u32,
    /// Size in bits of the short-term RPS coded in the slice header, if any.
    pub st_rps_bits: usize,
    pub rps: ReferencePictureSet,
    /// Set when the RPS was unusable and got zeroed.
    pub rps_error: bool,
    pub slice_temporal_mvp_enabled_flag: bool,
    pub slice_sao_luma_flag: bool,
    pub slice_sao_chroma_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    /// Active entries of RefPicList0 and RefPicList1.
    pub num_ref_idx: [u32; 2],
    /// NumPicTotalCurr.
    pub num_pic_total_curr: u32,
    pub ref_pic_list_modification: RefPicListModification,
    pub mvd_l1_zero_flag: bool,
    pub cabac_init_flag: bool,
    pub collocated_from_l0_flag: bool,
    pub collocated_ref_idx: u32,
    /// POC of each entry of RefPicList0 and RefPicList1.
    pub ref_poc_lists: [Vec<i32>; 2],
    pub pred_weight_table: PredWeightTable,
    /// MaxNumMergeCand.
    pub max_num_merge_cand: u32,
    pub use_integer_mv_flag: bool,
    pub slice_qp_delta: i32,
    /// SliceQpY.
    pub slice_qp: i32,
    pub slice_cb_qp_offset: i32,
    pub slice_cr_qp_offset: i32,
    pub slice_act_y_qp_offset: i32,
    pub slice_act_cb_qp_offset: i32,
    pub slice_act_cr_qp_offset: i32,
    pub cu_chroma_qp_offset_enabled_flag: bool,
    pub deblocking_filter_override_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    /// `slice_beta_offset_div2 * 2`.
    pub beta_offset: i32,
    /// `slice_tc_offset_div2 * 2`.
    pub tc_offset: i32,
    pub loop_filter_across_slices_enabled_flag: bool,
}

/// A parsed slice segment and the parameter sets it was parsed against.
#[derive(Debug)]
pub struct Slice {
    pub nalu_header: NaluHeader,
    pub header: SliceHeader,
    /// Shared with the other segments of the slice.
    pub shared: Arc<SliceShared>,
    pub sps: SharedHeader<Sps>,
    pub pps: SharedHeader<Pps>,
}

impl Slice {
    /// Whether this segment starts a new picture.
    pub fn is_first_in_pic(&self) -> bool {
        self.header.first_slice_segment_in_pic_flag
    }
}

/// Ceil(Log2(value)), with 0 for values up to 1.
pub(crate) fn ceil_log2(value: usize) -> u32 {
    if value <= 1 {
        0
    } else {
        usize::BITS - (value - 1).leading_zeros()
    }
}

/// Parses the rest of a slice segment header, after `part1`.
///
/// `poc` carries the POC of prevTid0Pic. `last_independent` holds the shared
/// fields of the latest independent slice segment, which a dependent segment
/// inherits.
pub fn decode_slice(
    c: &mut BitCursor,
    nalu_header: NaluHeader,
    part1: SliceHeaderPart1,
    sps: SharedHeader<Sps>,
    pps: SharedHeader<Pps>,
    poc: &PocDecoding,
    last_independent: Option<&Arc<SliceShared>>,
) -> Result<Slice> {
    let mut header = SliceHeader {
        first_slice_segment_in_pic_flag: part1.first_slice_segment_in_pic_flag,
        no_output_of_prior_pics_flag: part1.no_output_of_prior_pics_flag,
        pic_parameter_set_id: part1.pic_parameter_set_id,
        ..Default::default()
    };

    if !header.first_slice_segment_in_pic_flag {
        if pps.dependent_slice_segments_enabled_flag {
            header.dependent_slice_segment_flag = c.read_flag()?;
        }

        let pic_size_in_ctbs = sps.pic_size_in_ctbs();
        header.segment_address = c.read_bits(ceil_log2(pic_size_in_ctbs as usize))?;
        if header.segment_address >= pic_size_in_ctbs {
            return Err(invalid_stream!(
                "Invalid slice_segment_address {}",
                header.segment_address
            ));
        }
    }

    let shared = if header.dependent_slice_segment_flag {
        let shared = last_independent.ok_or_else(|| {
            invalid_stream!("Dependent slice segment without an independent one")
        })?;
        Arc::clone(shared)
    } else {
        Arc::new(parse_independent_fields(c, &nalu_header, &header, &sps, &pps, poc)?)
    };

    parse_entry_points(c, &mut header, &sps, &pps)?;

    if pps.slice_segment_header_extension_present_flag {
        header.slice_segment_header_extension_length = c.read_ue_max(256)?;
        c.skip_bits(header.slice_segment_header_extension_length as usize * 8)?;
    }

    c.read_trailing_bits()?;
    header.slice_data_byte_offset = c.bytes_decoded();

    Ok(Slice {
        nalu_header,
        header,
        shared,
        sps,
        pps,
    })
}

/// Handles an RPS that cannot be used: fatal to P and B slices, zeroed and
/// flagged otherwise.
fn reject_rps(shared: &mut SliceShared, reason: std::fmt::Arguments) -> Result<()> {
    if !shared.slice_type.is_i() {
        return Err(invalid_stream!("{}", reason));
    }

    log::warn!("Zeroing the RPS of an I slice: {}", reason);
    shared.rps.clear();
    shared.rps_error = true;
    Ok(())
}

fn parse_rps(
    c: &mut BitCursor,
    shared: &mut SliceShared,
    nalu_header: &NaluHeader,
    sps: &Sps,
) -> Result<()> {
    let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();
    let num_sets = sps.num_short_term_ref_pic_sets();
    let max_dec_pic_buffering = sps.max_dec_pic_buffering();

    shared.short_term_ref_pic_set_sps_flag = c.read_flag()?;
    if !shared.short_term_ref_pic_set_sps_flag {
        let start = c.bits_decoded();
        let rps = parse_short_term_ref_pic_set(c, &sps.short_term_ref_pic_sets, num_sets, num_sets)?;
        shared.st_rps_bits = c.bits_decoded() - start;
        shared.short_term_ref_pic_set_idx = num_sets as u32;

        if rps.num_negative_pics > max_dec_pic_buffering
            || rps.num_positive_pics > max_dec_pic_buffering - rps.num_negative_pics
        {
            reject_rps(
                shared,
                format_args!(
                    "RPS with {} pictures does not fit a DPB of {}",
                    rps.num_pics(),
                    max_dec_pic_buffering
                ),
            )?;
        } else {
            shared.rps.short_term = rps;
        }
    } else {
        let idx = c.read_bits(ceil_log2(num_sets))?;
        shared.short_term_ref_pic_set_idx = idx;
        match sps.short_term_ref_pic_sets.get(idx as usize) {
            Some(rps) => shared.rps.short_term = rps.clone(),
            None => reject_rps(
                shared,
                format_args!("Invalid short_term_ref_pic_set_idx {}", idx),
            )?,
        }
    }

    if sps.long_term_ref_pics_present_flag {
        parse_long_term_ref_pics(c, &mut shared.rps, sps)?;
        derive_long_term_pocs(
            &mut shared.rps,
            shared.pic_order_cnt,
            shared.slice_pic_order_cnt_lsb,
            max_pic_order_cnt_lsb,
        );
    }

    // A BLA picture starts a new coded video sequence.
    if nalu_header.type_.is_bla() {
        shared.rps.clear();
    }

    Ok(())
}

fn parse_list_entries(
    c: &mut BitCursor,
    entries: &mut [u32; MAX_NUM_REF_PICS],
    num_ref_idx: u32,
    num_pic_total_curr: u32,
) -> Result<()> {
    let num_bits = ceil_log2(num_pic_total_curr as usize);
    for entry in entries.iter_mut().take(num_ref_idx as usize) {
        *entry = c.read_bits(num_bits)?;
        if *entry >= num_pic_total_curr {
            return Err(invalid_stream!(
                "Invalid list_entry {}, NumPicTotalCurr is {}",
                entry,
                num_pic_total_curr
            ));
        }
    }

    Ok(())
}

fn parse_ref_pic_lists_modification(c: &mut BitCursor, shared: &mut SliceShared) -> Result<()> {
    let total = shared.num_pic_total_curr;
    let rplm = &mut shared.ref_pic_list_modification;

    rplm.ref_pic_list_modification_flag_l0 = c.read_flag()?;
    if rplm.ref_pic_list_modification_flag_l0 {
        parse_list_entries(c, &mut rplm.list_entry_l0, shared.num_ref_idx[0], total)?;
    }

    if shared.slice_type.is_b() {
        rplm.ref_pic_list_modification_flag_l1 = c.read_flag()?;
        if rplm.ref_pic_list_modification_flag_l1 {
            parse_list_entries(c, &mut rplm.list_entry_l1, shared.num_ref_idx[1], total)?;
        }
    }

    Ok(())
}

/// Parses `pred_weight_table()` for a slice whose reference POC lists are
/// already known.
pub fn parse_pred_weight_table(
    c: &mut BitCursor,
    shared: &SliceShared,
    sps: &Sps,
) -> Result<PredWeightTable> {
    let has_chroma = sps.chroma_array_type != 0;

    let luma_log2_weight_denom = c.read_ue_max(7)?;
    let chroma_log2_weight_denom = if has_chroma {
        let delta = c.read_se()?;
        let denom = i64::from(luma_log2_weight_denom) + i64::from(delta);
        if !(0..=7).contains(&denom) {
            return Err(invalid_stream!("Invalid ChromaLog2WeightDenom {}", denom));
        }
        denom as u32
    } else {
        0
    };

    let mut pwt = PredWeightTable::with_defaults(luma_log2_weight_denom, chroma_log2_weight_denom);

    let high_precision = sps.range_extension.high_precision_offsets_enabled_flag;
    // WpOffsetHalfRangeY and WpOffsetHalfRangeC.
    let (half_range_y, half_range_c) = if high_precision {
        (
            1i32 << (sps.bit_depth_luma - 1),
            1i32 << (sps.bit_depth_chroma - 1),
        )
    } else {
        (128, 128)
    };

    let num_lists = if shared.slice_type.is_b() { 2 } else { 1 };
    let mut sum_weight_flags = 0;

    for list in 0..num_lists {
        let num_ref_idx = shared.num_ref_idx[list] as usize;
        let factors = &mut pwt.factors[list];

        // No weights are signalled for the current picture used as its own
        // reference.
        let is_current = |i: usize| shared.ref_poc_lists[list].get(i) == Some(&shared.pic_order_cnt);

        for (i, factor) in factors.iter_mut().enumerate().take(num_ref_idx) {
            if !is_current(i) {
                factor.luma_weight_flag = c.read_flag()?;
            }
        }

        if has_chroma {
            for (i, factor) in factors.iter_mut().enumerate().take(num_ref_idx) {
                if !is_current(i) {
                    factor.chroma_weight_flag = c.read_flag()?;
                }
            }
        }

        for factor in factors.iter().take(num_ref_idx) {
            sum_weight_flags +=
                u32::from(factor.luma_weight_flag) + 2 * u32::from(factor.chroma_weight_flag);
        }

        if sum_weight_flags > MAX_SUM_WEIGHT_FLAGS {
            return Err(invalid_stream!(
                "{} weight flags signalled, at most {} allowed",
                sum_weight_flags,
                MAX_SUM_WEIGHT_FLAGS
            ));
        }

        for factor in factors.iter_mut().take(num_ref_idx) {
            if factor.luma_weight_flag {
                let delta_luma_weight = c.read_se_bounded(-128, 127)?;
                factor.luma_weight = (1 << luma_log2_weight_denom) + delta_luma_weight;
                factor.luma_offset = c.read_se_bounded(-half_range_y, half_range_y - 1)?;
            }

            if factor.chroma_weight_flag {
                for j in 0..2 {
                    let delta_chroma_weight = c.read_se_bounded(-128, 127)?;
                    let weight = (1 << chroma_log2_weight_denom) + delta_chroma_weight;
                    let delta_chroma_offset =
                        c.read_se_bounded(-4 * half_range_c, 4 * half_range_c - 1)?;

                    // (7-56)
                    let pred = half_range_c - ((half_range_c * weight) >> chroma_log2_weight_denom);
                    factor.chroma_weight[j] = weight;
                    factor.chroma_offset[j] =
                        (delta_chroma_offset + pred).clamp(-half_range_c, half_range_c - 1);
                }
            }
        }
    }

    Ok(pwt)
}

/// Reads a slice level QP offset and checks that it stays within +/-12 both on
/// its own and added to the matching PPS offset.
fn read_qp_offset(c: &mut BitCursor, pps_offset: i32, name: &str) -> Result<i32> {
    let offset = c.read_se_bounded(-12, 12)?;
    if !(-12..=12).contains(&(offset + pps_offset)) {
        return Err(invalid_stream!(
            "Invalid {} {} with a PPS offset of {}",
            name,
            offset,
            pps_offset
        ));
    }

    Ok(offset)
}

fn parse_independent_fields(
    c: &mut BitCursor,
    nalu_header: &NaluHeader,
    header: &SliceHeader,
    sps: &Sps,
    pps: &Pps,
    poc: &PocDecoding,
) -> Result<SliceShared> {
    let mut shared = SliceShared {
        slice_address: header.segment_address,
        pic_output_flag: true,
        collocated_from_l0_flag: true,
        ..Default::default()
    };

    c.skip_bits(usize::from(pps.num_extra_slice_header_bits))?;

    let slice_type = c.read_ue_max(2)?;
    shared.slice_type =
        SliceType::n(slice_type).ok_or_else(|| invalid_stream!("Invalid slice_type {}", slice_type))?;

    if pps.output_flag_present_flag {
        shared.pic_output_flag = c.read_flag()?;
    }

    if sps.separate_colour_plane_flag {
        shared.colour_plane_id = c.read_bits(2)? as u8;
        if shared.colour_plane_id > 2 {
            return Err(invalid_stream!("Invalid colour_plane_id {}", shared.colour_plane_id));
        }
    }

    if !nalu_header.type_.is_idr() {
        shared.slice_pic_order_cnt_lsb =
            c.read_bits(u32::from(sps.log2_max_pic_order_cnt_lsb))? as i32;

        shared.pic_order_cnt_msb = if nalu_header.type_.is_bla() {
            0
        } else {
            poc.derive_msb(shared.slice_pic_order_cnt_lsb, sps.max_pic_order_cnt_lsb())
        };
        shared.pic_order_cnt = shared.pic_order_cnt_msb + shared.slice_pic_order_cnt_lsb;

        parse_rps(c, &mut shared, nalu_header, sps)?;

        if sps.temporal_mvp_enabled_flag {
            shared.slice_temporal_mvp_enabled_flag = c.read_flag()?;
        }
    }

    if sps.sample_adaptive_offset_enabled_flag {
        shared.slice_sao_luma_flag = c.read_flag()?;
        if sps.chroma_array_type != 0 {
            shared.slice_sao_chroma_flag = c.read_flag()?;
        }
    }

    let slice_type = shared.slice_type;
    if !slice_type.is_i() {
        shared.num_ref_idx_active_override_flag = c.read_flag()?;
        if shared.num_ref_idx_active_override_flag {
            shared.num_ref_idx[0] = c.read_ue_max(MAX_REF_IDX_ACTIVE - 1)? + 1;
            if slice_type.is_b() {
                shared.num_ref_idx[1] = c.read_ue_max(MAX_REF_IDX_ACTIVE - 1)? + 1;
            }
        } else {
            shared.num_ref_idx[0] = pps.num_ref_idx_l0_default_active;
            if slice_type.is_b() {
                shared.num_ref_idx[1] = pps.num_ref_idx_l1_default_active;
            }
        }
    }

    // (7-55)
    let curr_pic_ref = pps.scc_extension.curr_pic_ref_enabled_flag;
    let num_pic_total_curr = shared.rps.num_used() + usize::from(curr_pic_ref);
    if num_pic_total_curr > MAX_NUM_PIC_TOTAL_CURR {
        return Err(invalid_stream!(
            "NumPicTotalCurr {} is above {}",
            num_pic_total_curr,
            MAX_NUM_PIC_TOTAL_CURR
        ));
    }
    shared.num_pic_total_curr = num_pic_total_curr as u32;

    if !slice_type.is_i() {
        if pps.lists_modification_present_flag && shared.num_pic_total_curr > 1 {
            parse_ref_pic_lists_modification(c, &mut shared)?;
        }

        if slice_type.is_b() {
            shared.mvd_l1_zero_flag = c.read_flag()?;
        }

        if pps.cabac_init_present_flag {
            shared.cabac_init_flag = c.read_flag()?;
        }

        if shared.slice_temporal_mvp_enabled_flag {
            if slice_type.is_b() {
                shared.collocated_from_l0_flag = c.read_flag()?;
            }

            let collocated_list = if shared.collocated_from_l0_flag { 0 } else { 1 };
            let num_ref_idx = shared.num_ref_idx[collocated_list];
            if num_ref_idx > 1 {
                shared.collocated_ref_idx = c.read_ue_max(num_ref_idx - 1)?;
            }
        }

        shared.ref_poc_lists = ref_poc_lists(
            &shared.rps,
            shared.pic_order_cnt,
            slice_type,
            shared.num_ref_idx,
            &shared.ref_pic_list_modification,
            curr_pic_ref,
        );

        shared.pred_weight_table = if (pps.weighted_pred_flag && slice_type.is_p())
            || (pps.weighted_bipred_flag && slice_type.is_b())
        {
            parse_pred_weight_table(c, &shared, sps)?
        } else {
            PredWeightTable::with_defaults(0, 0)
        };

        let five_minus_max_num_merge_cand = c.read_ue_max(4)?;
        shared.max_num_merge_cand = 5 - five_minus_max_num_merge_cand;

        let mv_resolution = sps.scc_extension.motion_vector_resolution_control_idc;
        shared.use_integer_mv_flag = if mv_resolution == 2 {
            c.read_flag()?
        } else {
            mv_resolution != 0
        };
    } else {
        shared.pred_weight_table = PredWeightTable::with_defaults(0, 0);
    }

    shared.slice_qp_delta = c.read_se()?;
    let slice_qp = i64::from(pps.init_qp) + i64::from(shared.slice_qp_delta);
    if !(-i64::from(sps.qp_bd_offset_y)..=51).contains(&slice_qp) {
        return Err(invalid_stream!("Invalid SliceQpY {}", slice_qp));
    }
    shared.slice_qp = slice_qp as i32;

    if pps.slice_chroma_qp_offsets_present_flag {
        shared.slice_cb_qp_offset = read_qp_offset(c, pps.cb_qp_offset, "slice_cb_qp_offset")?;
        shared.slice_cr_qp_offset = read_qp_offset(c, pps.cr_qp_offset, "slice_cr_qp_offset")?;
    }

    let scc = &pps.scc_extension;
    if scc.slice_act_qp_offsets_present_flag {
        shared.slice_act_y_qp_offset =
            read_qp_offset(c, scc.act_y_qp_offset, "slice_act_y_qp_offset")?;
        shared.slice_act_cb_qp_offset =
            read_qp_offset(c, scc.act_cb_qp_offset, "slice_act_cb_qp_offset")?;
        shared.slice_act_cr_qp_offset =
            read_qp_offset(c, scc.act_cr_qp_offset, "slice_act_cr_qp_offset")?;
    }

    if pps.range_extension.chroma_qp_offset_list_enabled_flag {
        shared.cu_chroma_qp_offset_enabled_flag = c.read_flag()?;
    }

    if pps.deblocking_filter_override_enabled_flag {
        shared.deblocking_filter_override_flag = c.read_flag()?;
    }

    shared.deblocking_filter_disabled_flag = pps.pps_deblocking_filter_disabled_flag;
    shared.beta_offset = pps.beta_offset;
    shared.tc_offset = pps.tc_offset;
    if shared.deblocking_filter_override_flag {
        shared.deblocking_filter_disabled_flag = c.read_flag()?;
        if !shared.deblocking_filter_disabled_flag {
            shared.beta_offset = c.read_se_bounded(-6, 6)? * 2;
            shared.tc_offset = c.read_se_bounded(-6, 6)? * 2;
        }
    }

    shared.loop_filter_across_slices_enabled_flag = pps.loop_filter_across_slices_enabled_flag;
    if pps.loop_filter_across_slices_enabled_flag
        && (shared.slice_sao_luma_flag
            || shared.slice_sao_chroma_flag
            || !shared.deblocking_filter_disabled_flag)
    {
        shared.loop_filter_across_slices_enabled_flag = c.read_flag()?;
    }

    Ok(shared)
}

fn parse_entry_points(
    c: &mut BitCursor,
    header: &mut SliceHeader,
    sps: &Sps,
    pps: &Pps,
) -> Result<()> {
    let tiles = pps.tiles_enabled_flag;
    let wpp = pps.entropy_coding_sync_enabled_flag;

    header.tile_locations = vec![0];
    if !tiles && !wpp {
        return Ok(());
    }

    header.num_entry_point_offsets = c.read_ue()?;
    if header.num_entry_point_offsets > MAX_ENTRY_POINT_OFFSETS {
        return Err(invalid_stream!(
            "num_entry_point_offsets {} is above {}",
            header.num_entry_point_offsets,
            MAX_ENTRY_POINT_OFFSETS
        ));
    }

    // (7.4.7.1)
    let max_substreams = match (tiles, wpp) {
        (false, _) => sps.pic_height_in_ctbs,
        (true, false) => pps.num_tile_columns.saturating_mul(pps.num_tile_rows),
        (true, true) => pps.num_tile_columns.saturating_mul(sps.pic_height_in_ctbs),
    };
    if header.num_entry_point_offsets >= max_substreams {
        return Err(invalid_stream!(
            "num_entry_point_offsets {} for at most {} substreams",
            header.num_entry_point_offsets,
            max_substreams
        ));
    }

    if header.num_entry_point_offsets == 0 {
        return Ok(());
    }

    header.offset_len_minus1 = c.read_ue_max(31)?;
    let num_bits = header.offset_len_minus1 + 1;

    let num = header.num_entry_point_offsets as usize;
    header.entry_point_offset_minus1.reserve(num);
    header.tile_locations.reserve(num);

    let mut location = 0u32;
    for _ in 0..num {
        let offset_minus1 = c.read_bits(num_bits)?;
        location = offset_minus1
            .checked_add(1)
            .and_then(|offset| location.checked_add(offset))
            .ok_or_else(|| invalid_stream!("Entry point past the end of the slice data"))?;

        header.entry_point_offset_minus1.push(offset_minus1);
        header.tile_locations.push(location);
    }

    Ok(())
}
