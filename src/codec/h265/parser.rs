// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An H.265 header parser.
//!
//! Parses VPSs, SPSs, PPSs, SEI messages and slice headers out of NAL units,
//! and keeps the parameter sets around in pooled, reference counted stores.

use std::borrow::Cow;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Buf;
use enumn::N;

use crate::bitstream_utils::remove_emulation_prevention;
use crate::codec::h265::bit_cursor::BitCursor;
use crate::codec::h265::error::invalid_stream;
use crate::codec::h265::error::ParseError;
use crate::codec::h265::error::Result;
use crate::codec::h265::header_set::Headers;
use crate::codec::h265::header_set::SharedHeader;
use crate::codec::h265::picture::PocDecoding;
use crate::codec::h265::pool::ObjectPool;
use crate::codec::h265::rps::parse_short_term_ref_pic_set;
use crate::codec::h265::rps::ShortTermRefPicSet;
use crate::codec::h265::sei::parse_sei_rbsp;
use crate::codec::h265::sei::SeiPayload;
use crate::codec::h265::slice::decode_slice;
use crate::codec::h265::slice::parse_slice_header_part1;
use crate::codec::h265::slice::Slice;
use crate::codec::h265::slice::SliceShared;

/// Largest `vps_video_parameter_set_id`.
pub const MAX_VPS_ID: u32 = 15;
/// Largest `sps_seq_parameter_set_id`.
pub const MAX_SPS_ID: u32 = 15;
/// Largest `pps_pic_parameter_set_id`.
pub const MAX_PPS_ID: u32 = 63;

pub const MAX_SUB_LAYERS: usize = 7;
/// Size of the DPB, and the most pictures an RPS can hold.
pub const MAX_NUM_REF_PICS: usize = 16;
pub const MAX_SHORT_TERM_REF_PIC_SETS: u32 = 64;
pub const MAX_LONG_TERM_REF_PICS_SPS: usize = 32;
pub const MAX_CPB_CNT: usize = 32;
/// Largest picture width or height in luma samples, for level 6.2.
pub const MAX_PIC_DIMENSION: u32 = 16888;

const NALU_HEADER_LEN: usize = 2;

// Number of scaling lists per sizeId. The 32x32 lists only exist for luma.
const SCALING_LIST_NUM: [usize; 4] = [6, 6, 6, 2];

// From Table 7-6, in up-right diagonal order.
const DEFAULT_SCALING_LIST_INTRA: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 16, 17, 16, 17, 18, 17, 18, 18, 17, 18, 21, 19, 20,
    21, 20, 19, 21, 24, 22, 22, 24, 24, 22, 22, 24, 25, 25, 27, 30, 27, 25, 25, 29, 31, 35, 35, 31,
    29, 36, 41, 44, 41, 36, 47, 54, 54, 47, 65, 70, 65, 88, 88, 115,
];

// From Table 7-6, in up-right diagonal order.
const DEFAULT_SCALING_LIST_INTER: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 17, 17, 17, 17, 18, 18, 18, 18, 18, 18, 20, 20, 20,
    20, 20, 20, 20, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 28, 28, 28, 28, 28,
    28, 33, 33, 33, 33, 33, 41, 41, 41, 41, 54, 54, 54, 71, 71, 91,
];

/// Up-right diagonal scan of a `blk`x`blk` block (6.5.3), mapping scan
/// position to raster position.
const fn diagonal_scan(blk: usize) -> [usize; 64] {
    let mut scan = [0usize; 64];
    let blk = blk as i32;
    let mut i = 0;
    let mut x = 0i32;
    let mut y = 0i32;

    while i < (blk * blk) as usize {
        while y >= 0 {
            if x < blk && y < blk {
                scan[i] = (y * blk + x) as usize;
                i += 1;
            }
            y -= 1;
            x += 1;
        }
        y = x;
        x = 0;
    }

    scan
}

const DIAGONAL_SCAN_4X4: [usize; 64] = diagonal_scan(4);
const DIAGONAL_SCAN_8X8: [usize; 64] = diagonal_scan(8);

// Table E.1, indexed by aspect_ratio_idc.
const SAR_TABLE: [(u16, u16); 17] = [
    (0, 0),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];
const EXTENDED_SAR: u32 = 255;

// SubWidthC and SubHeightC from Table 6-1, indexed by chroma_format_idc.
const SUB_WIDTH_C: [u32; 4] = [1, 2, 2, 1];
const SUB_HEIGHT_C: [u32; 4] = [1, 2, 1, 1];

/// Table 7-1 – NAL unit type codes and NAL unit type classes
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    #[default]
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    RsvVclN10 = 10,
    RsvVclR11 = 11,
    RsvVclN12 = 12,
    RsvVclR13 = 13,
    RsvVclN14 = 14,
    RsvVclR15 = 15,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    RsvVcl24 = 24,
    RsvVcl25 = 25,
    RsvVcl26 = 26,
    RsvVcl27 = 27,
    RsvVcl28 = 28,
    RsvVcl29 = 29,
    RsvVcl30 = 30,
    RsvVcl31 = 31,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
    EosNut = 36,
    EobNut = 37,
    FdNut = 38,
    PrefixSeiNut = 39,
    SuffixSeiNut = 40,
    RsvNvcl41 = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    RsvNvcl45 = 45,
    RsvNvcl46 = 46,
    RsvNvcl47 = 47,
    Unspec48 = 48,
    Unspec49 = 49,
    Unspec50 = 50,
    Unspec51 = 51,
    Unspec52 = 52,
    Unspec53 = 53,
    Unspec54 = 54,
    Unspec55 = 55,
    Unspec56 = 56,
    Unspec57 = 57,
    Unspec58 = 58,
    Unspec59 = 59,
    Unspec60 = 60,
    Unspec61 = 61,
    Unspec62 = 62,
    Unspec63 = 63,
}

impl NaluType {
    /// Whether this is an IDR NALU.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// Whether this is an IRAP NALU.
    pub fn is_irap(&self) -> bool {
        let type_ = *self as u32;
        type_ >= Self::BlaWLp as u32 && type_ <= Self::RsvIrapVcl23 as u32
    }

    /// Whether this is a BLA NALU.
    pub fn is_bla(&self) -> bool {
        matches!(self, Self::BlaWLp | Self::BlaWRadl | Self::BlaNLp)
    }

    /// Whether this is a CRA NALU.
    pub fn is_cra(&self) -> bool {
        matches!(self, Self::CraNut)
    }

    /// Whether this is a RADL NALU.
    pub fn is_radl(&self) -> bool {
        matches!(self, Self::RadlN | Self::RadlR)
    }

    /// Whether this is a RASL NALU.
    pub fn is_rasl(&self) -> bool {
        matches!(self, Self::RaslN | Self::RaslR)
    }

    /// Whether this is a sub-layer non-reference picture.
    pub fn is_slnr(&self) -> bool {
        matches!(
            self,
            Self::TrailN
                | Self::TsaN
                | Self::StsaN
                | Self::RadlN
                | Self::RaslN
                | Self::RsvVclN10
                | Self::RsvVclN12
                | Self::RsvVclN14
        )
    }

    /// Whether the NALU carries a coded slice segment this parser knows.
    pub fn is_slice(&self) -> bool {
        let type_ = *self as u32;
        type_ <= Self::RaslR as u32 || (Self::BlaWLp as u32..=Self::CraNut as u32).contains(&type_)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    /// The NALU type.
    pub type_: NaluType,
    /// Identifier of the layer. Only the base layer (0) is supported.
    pub nuh_layer_id: u8,
    /// Minus 1 specifies a temporal identifier for the NAL unit. The value of
    /// nuh_temporal_id_plus1 shall not be equal to 0.
    pub nuh_temporal_id_plus1: u8,
}

impl NaluHeader {
    pub fn temporal_id(&self) -> u8 {
        self.nuh_temporal_id_plus1.saturating_sub(1)
    }

    /// Whether this header type indicates EOS or EOB.
    pub fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::EosNut | NaluType::EobNut)
    }

    /// Decodes the two header bytes without validating them.
    fn from_bytes(data: &[u8]) -> Option<Self> {
        let (first, second) = match data.get(..NALU_HEADER_LEN) {
            Some([first, second]) => (*first, *second),
            _ => return None,
        };

        Some(Self {
            type_: NaluType::n((first >> 1) & 0x3f)?,
            nuh_layer_id: ((first & 1) << 5) | (second >> 3),
            nuh_temporal_id_plus1: second & 0x7,
        })
    }
}

/// Reads and validates `nal_unit_header()`.
pub fn parse_nal_unit_header(c: &mut BitCursor) -> Result<NaluHeader> {
    if c.read_bit()? != 0 {
        return Err(invalid_stream!("forbidden_zero_bit is set"));
    }

    let type_ = c.read_bits(6)?;
    let type_ = NaluType::n(type_).ok_or_else(|| invalid_stream!("Invalid NALU type {}", type_))?;

    let nuh_layer_id = c.read_bits(6)? as u8;
    if nuh_layer_id != 0 {
        return Err(invalid_stream!(
            "Unsupported nuh_layer_id {}, only the base layer is decoded",
            nuh_layer_id
        ));
    }

    let nuh_temporal_id_plus1 = c.read_bits(3)? as u8;
    if nuh_temporal_id_plus1 == 0 {
        return Err(invalid_stream!("nuh_temporal_id_plus1 is 0"));
    }

    Ok(NaluHeader {
        type_,
        nuh_layer_id,
        nuh_temporal_id_plus1,
    })
}

/// A NAL unit found in an Annex B byte stream.
#[derive(Debug)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    /// The NAL unit, header included, with its emulation prevention bytes.
    pub data: Cow<'a, [u8]>,
    /// Size of the NAL unit in bytes.
    pub size: usize,
    /// Offset of the NAL unit in the stream.
    pub offset: usize,
    /// Offset of the start code that precedes the NAL unit.
    pub sc_offset: usize,
}

impl<'a> Nalu<'a> {
    fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
        // discard all zeroes until the start code pattern is found
        data.get(offset..)?
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])
    }

    /// Find the next Annex B encoded NAL unit.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> anyhow::Result<Nalu<'a>> {
        let bitstream: &'a [u8] = cursor.get_ref();
        let pos = usize::try_from(cursor.position())?;

        // Find the start code for this NALU
        let current_nalu_offset =
            Self::find_start_code(bitstream, pos).ok_or(anyhow!("No NAL found"))?;

        let mut start_code_offset = pos + current_nalu_offset;

        // If the preceding byte is 00, then we actually have a four byte SC,
        // i.e. 00 00 00 01 Where the first 00 is the "zero_byte()"
        if start_code_offset > 0 && bitstream[start_code_offset - 1] == 00 {
            start_code_offset -= 1;
        }

        // The NALU offset is its offset + 3 bytes to skip the start code.
        let nalu_offset = pos + current_nalu_offset + 3;

        // Set the bitstream position to the start of the current NALU
        cursor.set_position(u64::try_from(nalu_offset)?);

        let header = NaluHeader::from_bytes(cursor.chunk()).ok_or(anyhow!("NALU too short"))?;

        // Find the start of the subsequent NALU.
        let mut next_nalu_offset = match Self::find_start_code(bitstream, nalu_offset) {
            Some(offset) => offset,
            None => cursor.chunk().len(), // Whatever data is left must be part of the current NALU
        };

        while next_nalu_offset > 0 && bitstream[nalu_offset + next_nalu_offset - 1] == 00 {
            // Discard trailing_zero_8bits
            next_nalu_offset -= 1;
        }

        let size = next_nalu_offset;
        cursor.set_position(u64::try_from(nalu_offset + size)?);

        Ok(Nalu {
            header,
            data: Cow::Borrowed(&bitstream[nalu_offset..nalu_offset + size]),
            size,
            offset: nalu_offset,
            sc_offset: start_code_offset,
        })
    }
}

impl<'a> AsRef<[u8]> for Nalu<'a> {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Profiles of Annex A, by general_profile_idc.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Profile {
    Main = 1,
    Main10 = 2,
    MainStillPicture = 3,
    RangeExtensions = 4,
    HighThroughput = 5,
    MultiviewMain = 6,
    ScalableMain = 7,
    ThreeDMain = 8,
    ScreenContentCoding = 9,
    ScalableRangeExtensions = 10,
    HighThroughputScreenContentCoding = 11,
}

/// The profile and level part of `profile_tier_level()`, shared by the general
/// and sub-layer entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTier {
    pub profile_space: u8,
    pub tier_flag: bool,
    /// The profile. A zero in the bitstream is replaced by the inferred one.
    pub profile_idc: u8,
    pub profile_compatibility_flag: [bool; 32],
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub non_packed_constraint_flag: bool,
    pub frame_only_constraint_flag: bool,
    pub max_12bit_constraint_flag: bool,
    pub max_10bit_constraint_flag: bool,
    pub max_8bit_constraint_flag: bool,
    pub max_422chroma_constraint_flag: bool,
    pub max_420chroma_constraint_flag: bool,
    pub max_monochrome_constraint_flag: bool,
    pub intra_constraint_flag: bool,
    pub one_picture_only_constraint_flag: bool,
    pub lower_bit_rate_constraint_flag: bool,
    pub max_14bit_constraint_flag: bool,
    /// Level number times ten, e.g. 41 for level 4.1. The bitstream carries
    /// thirty times the level number.
    pub level: u8,
}

impl ProfileTier {
    pub fn profile(&self) -> Option<Profile> {
        Profile::n(self.profile_idc)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub general: ProfileTier,
    pub sub_layer_profile_present_flag: [bool; 6],
    pub sub_layer_level_present_flag: [bool; 6],
    pub sub_layers: [ProfileTier; 6],
}

fn parse_profile_tier(c: &mut BitCursor, pt: &mut ProfileTier) -> Result<()> {
    pt.profile_space = c.read_bits(2)? as u8;
    if pt.profile_space != 0 {
        return Err(invalid_stream!(
            "Unsupported profile_space {}",
            pt.profile_space
        ));
    }

    pt.tier_flag = c.read_flag()?;
    pt.profile_idc = c.read_bits(5)? as u8;

    for flag in pt.profile_compatibility_flag.iter_mut() {
        *flag = c.read_flag()?;
    }

    if pt.profile_idc == 0 {
        pt.profile_idc = pt
            .profile_compatibility_flag
            .iter()
            .skip(1)
            .position(|&flag| flag)
            .map_or(Profile::Main as u8, |j| j as u8 + 1);
    }

    if pt.profile_idc > Profile::RangeExtensions as u8
        && pt.profile_idc != Profile::ScreenContentCoding as u8
    {
        return Err(invalid_stream!("Unsupported profile_idc {}", pt.profile_idc));
    }

    pt.progressive_source_flag = c.read_flag()?;
    pt.interlaced_source_flag = c.read_flag()?;
    pt.non_packed_constraint_flag = c.read_flag()?;
    pt.frame_only_constraint_flag = c.read_flag()?;

    let is_scc = pt.profile_idc == 9 || pt.profile_compatibility_flag[9];
    // The reserved bits are not checked for zero.
    let reserved_bits = if pt.profile_idc == 4 || pt.profile_compatibility_flag[4] || is_scc {
        pt.max_12bit_constraint_flag = c.read_flag()?;
        pt.max_10bit_constraint_flag = c.read_flag()?;
        pt.max_8bit_constraint_flag = c.read_flag()?;
        pt.max_422chroma_constraint_flag = c.read_flag()?;
        pt.max_420chroma_constraint_flag = c.read_flag()?;
        pt.max_monochrome_constraint_flag = c.read_flag()?;
        pt.intra_constraint_flag = c.read_flag()?;
        pt.one_picture_only_constraint_flag = c.read_flag()?;
        pt.lower_bit_rate_constraint_flag = c.read_flag()?;

        if is_scc {
            pt.max_14bit_constraint_flag = c.read_flag()?;
            34
        } else {
            35
        }
    } else {
        44
    };

    c.skip_bits(reserved_bits)
}

fn read_level(c: &mut BitCursor) -> Result<u8> {
    Ok((c.read_bits(8)? * 10 / 30) as u8)
}

/// Parses `profile_tier_level(1, max_sub_layers_minus1)`.
pub fn parse_profile_tier_level(
    c: &mut BitCursor,
    max_sub_layers_minus1: u8,
) -> Result<ProfileTierLevel> {
    let mut ptl = ProfileTierLevel::default();
    let max_sub_layers_minus1 = usize::from(max_sub_layers_minus1);

    parse_profile_tier(c, &mut ptl.general)?;
    ptl.general.level = read_level(c)?;

    for i in 0..max_sub_layers_minus1 {
        ptl.sub_layer_profile_present_flag[i] = c.read_flag()?;
        ptl.sub_layer_level_present_flag[i] = c.read_flag()?;
    }

    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            if c.read_bits(2)? != 0 {
                return Err(invalid_stream!("reserved_zero_2bits is not zero"));
            }
        }
    }

    for i in 0..max_sub_layers_minus1 {
        if ptl.sub_layer_profile_present_flag[i] {
            parse_profile_tier(c, &mut ptl.sub_layers[i])?;
        }

        if ptl.sub_layer_level_present_flag[i] {
            ptl.sub_layers[i].level = read_level(c)?;
        }
    }

    Ok(ptl)
}

/// `sub_layer_hrd_parameters()` for one sub-layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubLayerHrdParams {
    pub bit_rate_value_minus1: [u32; MAX_CPB_CNT],
    pub cpb_size_value_minus1: [u32; MAX_CPB_CNT],
    pub cpb_size_du_value_minus1: [u32; MAX_CPB_CNT],
    pub bit_rate_du_value_minus1: [u32; MAX_CPB_CNT],
    pub cbr_flag: [bool; MAX_CPB_CNT],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HrdParams {
    pub nal_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters_present_flag: bool,
    pub sub_pic_hrd_params_present_flag: bool,
    pub tick_divisor_minus2: u8,
    pub du_cpb_removal_delay_increment_length_minus1: u8,
    pub sub_pic_cpb_params_in_pic_timing_sei_flag: bool,
    pub dpb_output_delay_du_length_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub cpb_size_du_scale: u8,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub au_cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub fixed_pic_rate_general_flag: [bool; MAX_SUB_LAYERS],
    pub fixed_pic_rate_within_cvs_flag: [bool; MAX_SUB_LAYERS],
    pub elemental_duration_in_tc_minus1: [u32; MAX_SUB_LAYERS],
    pub low_delay_hrd_flag: [bool; MAX_SUB_LAYERS],
    pub cpb_cnt_minus1: [u32; MAX_SUB_LAYERS],
    pub nal_hrd: [SubLayerHrdParams; MAX_SUB_LAYERS],
    pub vcl_hrd: [SubLayerHrdParams; MAX_SUB_LAYERS],
}

impl Default for HrdParams {
    fn default() -> Self {
        Self {
            nal_hrd_parameters_present_flag: false,
            vcl_hrd_parameters_present_flag: false,
            sub_pic_hrd_params_present_flag: false,
            tick_divisor_minus2: 0,
            du_cpb_removal_delay_increment_length_minus1: 0,
            sub_pic_cpb_params_in_pic_timing_sei_flag: false,
            dpb_output_delay_du_length_minus1: 0,
            bit_rate_scale: 0,
            cpb_size_scale: 0,
            cpb_size_du_scale: 0,
            // Inferred to be 23 when absent.
            initial_cpb_removal_delay_length_minus1: 23,
            au_cpb_removal_delay_length_minus1: 23,
            dpb_output_delay_length_minus1: 23,
            fixed_pic_rate_general_flag: Default::default(),
            fixed_pic_rate_within_cvs_flag: Default::default(),
            elemental_duration_in_tc_minus1: Default::default(),
            low_delay_hrd_flag: Default::default(),
            cpb_cnt_minus1: Default::default(),
            nal_hrd: Default::default(),
            vcl_hrd: Default::default(),
        }
    }
}

impl HrdParams {
    /// CpbDpbDelaysPresentFlag.
    pub fn cpb_dpb_delays_present(&self) -> bool {
        self.nal_hrd_parameters_present_flag || self.vcl_hrd_parameters_present_flag
    }
}

fn parse_sub_layer_hrd_parameters(
    c: &mut BitCursor,
    h: &mut SubLayerHrdParams,
    cpb_cnt: usize,
    sub_pic_hrd_params_present_flag: bool,
) -> Result<()> {
    for i in 0..cpb_cnt {
        h.bit_rate_value_minus1[i] = c.read_ue()?;
        h.cpb_size_value_minus1[i] = c.read_ue()?;
        if sub_pic_hrd_params_present_flag {
            h.cpb_size_du_value_minus1[i] = c.read_ue()?;
            h.bit_rate_du_value_minus1[i] = c.read_ue()?;
        }

        h.cbr_flag[i] = c.read_flag()?;
    }

    Ok(())
}

/// Parses `hrd_parameters(common_inf_present_flag, max_sub_layers_minus1)`.
pub fn parse_hrd_parameters(
    c: &mut BitCursor,
    common_inf_present_flag: bool,
    max_sub_layers_minus1: u8,
) -> Result<HrdParams> {
    let mut hrd = HrdParams::default();

    if common_inf_present_flag {
        hrd.nal_hrd_parameters_present_flag = c.read_flag()?;
        hrd.vcl_hrd_parameters_present_flag = c.read_flag()?;
        if hrd.cpb_dpb_delays_present() {
            hrd.sub_pic_hrd_params_present_flag = c.read_flag()?;
            if hrd.sub_pic_hrd_params_present_flag {
                hrd.tick_divisor_minus2 = c.read_bits(8)? as u8;
                hrd.du_cpb_removal_delay_increment_length_minus1 = c.read_bits(5)? as u8;
                hrd.sub_pic_cpb_params_in_pic_timing_sei_flag = c.read_flag()?;
                hrd.dpb_output_delay_du_length_minus1 = c.read_bits(5)? as u8;
            }

            hrd.bit_rate_scale = c.read_bits(4)? as u8;
            hrd.cpb_size_scale = c.read_bits(4)? as u8;
            if hrd.sub_pic_hrd_params_present_flag {
                hrd.cpb_size_du_scale = c.read_bits(4)? as u8;
            }

            hrd.initial_cpb_removal_delay_length_minus1 = c.read_bits(5)? as u8;
            hrd.au_cpb_removal_delay_length_minus1 = c.read_bits(5)? as u8;
            hrd.dpb_output_delay_length_minus1 = c.read_bits(5)? as u8;
        }
    }

    for i in 0..=usize::from(max_sub_layers_minus1) {
        hrd.fixed_pic_rate_general_flag[i] = c.read_flag()?;
        hrd.fixed_pic_rate_within_cvs_flag[i] = if !hrd.fixed_pic_rate_general_flag[i] {
            c.read_flag()?
        } else {
            true
        };

        if hrd.fixed_pic_rate_within_cvs_flag[i] {
            hrd.elemental_duration_in_tc_minus1[i] = c.read_ue_max(2047)?;
        } else {
            hrd.low_delay_hrd_flag[i] = c.read_flag()?;
        }

        if !hrd.low_delay_hrd_flag[i] {
            hrd.cpb_cnt_minus1[i] = c.read_ue_max(MAX_CPB_CNT as u32 - 1)?;
        }

        let cpb_cnt = hrd.cpb_cnt_minus1[i] as usize + 1;
        if hrd.nal_hrd_parameters_present_flag {
            parse_sub_layer_hrd_parameters(
                c,
                &mut hrd.nal_hrd[i],
                cpb_cnt,
                hrd.sub_pic_hrd_params_present_flag,
            )?;
        }

        if hrd.vcl_hrd_parameters_present_flag {
            parse_sub_layer_hrd_parameters(
                c,
                &mut hrd.vcl_hrd[i],
                cpb_cnt,
                hrd.sub_pic_hrd_params_present_flag,
            )?;
        }
    }

    Ok(hrd)
}

/// DPB sizing for each temporal sub-layer, as carried by both the VPS and the
/// SPS.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubLayerOrderingInfo {
    /// Required DPB size in pictures (`max_dec_pic_buffering_minus1 + 1`).
    pub max_dec_pic_buffering: [u32; MAX_SUB_LAYERS],
    pub max_num_reorder_pics: [u32; MAX_SUB_LAYERS],
    pub max_latency_increase_plus1: [u32; MAX_SUB_LAYERS],
}

fn parse_sub_layer_ordering_info(
    c: &mut BitCursor,
    info_present_flag: bool,
    max_sub_layers: usize,
) -> Result<SubLayerOrderingInfo> {
    let mut info = SubLayerOrderingInfo::default();

    for i in 0..max_sub_layers {
        let max_dec_pic_buffering = c.read_ue_max(MAX_NUM_REF_PICS as u32 - 1)? + 1;
        let max_num_reorder_pics = c.read_ue_max(max_dec_pic_buffering)?;
        let max_latency_increase_plus1 = c.read_ue()?;

        if i > 0
            && (max_dec_pic_buffering < info.max_dec_pic_buffering[i - 1]
                || max_num_reorder_pics < info.max_num_reorder_pics[i - 1])
        {
            return Err(invalid_stream!(
                "DPB sizing of sub-layer {} is smaller than the previous one",
                i
            ));
        }

        info.max_dec_pic_buffering[i] = max_dec_pic_buffering;
        info.max_num_reorder_pics[i] = max_num_reorder_pics;
        info.max_latency_increase_plus1[i] = max_latency_increase_plus1;

        // The values signalled once apply to all sub-layers.
        if !info_present_flag {
            for j in i + 1..max_sub_layers {
                info.max_dec_pic_buffering[j] = max_dec_pic_buffering;
                info.max_num_reorder_pics[j] = max_num_reorder_pics;
                info.max_latency_increase_plus1[j] = max_latency_increase_plus1;
            }
            break;
        }
    }

    Ok(info)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    pub video_parameter_set_id: u8,
    pub base_layer_internal_flag: bool,
    pub base_layer_available_flag: bool,
    pub max_layers_minus1: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub sub_layer_ordering_info_present_flag: bool,
    pub ordering: SubLayerOrderingInfo,
    pub max_layer_id: u8,
    pub num_layer_sets_minus1: u32,
    /// layer_id_included_flag[i] for layer sets 1.., as a bit mask over the
    /// layer ids.
    pub layer_id_included: Vec<u64>,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
    pub num_hrd_parameters: u32,
    pub hrd_layer_set_idx: Vec<u32>,
    pub cprms_present_flag: Vec<bool>,
    pub hrd_parameters: Vec<HrdParams>,
    pub extension_flag: bool,
}

/// Parses a `video_parameter_set_rbsp()`, the NAL header already consumed.
pub fn parse_vps(c: &mut BitCursor) -> Result<Vps> {
    let mut vps = Vps {
        video_parameter_set_id: c.read_bits(4)? as u8,
        base_layer_internal_flag: c.read_flag()?,
        base_layer_available_flag: c.read_flag()?,
        max_layers_minus1: c.read_bits(6)? as u8,
        max_sub_layers_minus1: c.read_bits(3)? as u8,
        temporal_id_nesting_flag: c.read_flag()?,
        ..Default::default()
    };

    // vps_reserved_three_2bits is read as the two base layer flags above.
    if !vps.base_layer_internal_flag || !vps.base_layer_available_flag {
        return Err(invalid_stream!("vps_reserved_three_2bits is not 3"));
    }

    if usize::from(vps.max_sub_layers_minus1) >= MAX_SUB_LAYERS {
        return Err(invalid_stream!(
            "Invalid vps_max_sub_layers_minus1 {}",
            vps.max_sub_layers_minus1
        ));
    }

    if vps.max_sub_layers_minus1 == 0 && !vps.temporal_id_nesting_flag {
        return Err(invalid_stream!(
            "vps_temporal_id_nesting_flag must be set with a single sub-layer"
        ));
    }

    if c.read_bits(16)? != 0xffff {
        return Err(invalid_stream!("vps_reserved_0xffff_16bits is not 0xffff"));
    }

    vps.profile_tier_level = parse_profile_tier_level(c, vps.max_sub_layers_minus1)?;

    vps.sub_layer_ordering_info_present_flag = c.read_flag()?;
    vps.ordering = parse_sub_layer_ordering_info(
        c,
        vps.sub_layer_ordering_info_present_flag,
        usize::from(vps.max_sub_layers_minus1) + 1,
    )?;

    vps.max_layer_id = c.read_bits(6)? as u8;
    if vps.max_layer_id > 62 {
        return Err(invalid_stream!("Invalid vps_max_layer_id {}", vps.max_layer_id));
    }

    vps.num_layer_sets_minus1 = c.read_ue_max(1023)?;
    for _ in 1..=vps.num_layer_sets_minus1 {
        let mut included = 0u64;
        for j in 0..=vps.max_layer_id {
            if c.read_flag()? {
                included |= 1 << j;
            }
        }
        vps.layer_id_included.push(included);
    }

    vps.timing_info_present_flag = c.read_flag()?;
    if vps.timing_info_present_flag {
        vps.num_units_in_tick = c.read_bits(32)?;
        vps.time_scale = c.read_bits(32)?;
        vps.poc_proportional_to_timing_flag = c.read_flag()?;
        if vps.poc_proportional_to_timing_flag {
            vps.num_ticks_poc_diff_one_minus1 = c.read_ue()?;
        }

        vps.num_hrd_parameters = c.read_ue_max(1024)?;
        for i in 0..vps.num_hrd_parameters {
            vps.hrd_layer_set_idx.push(c.read_ue()?);
            let cprms_present_flag = i == 0 || c.read_flag()?;
            vps.cprms_present_flag.push(cprms_present_flag);
            vps.hrd_parameters.push(parse_hrd_parameters(
                c,
                cprms_present_flag,
                vps.max_sub_layers_minus1,
            )?);
        }
    }

    vps.extension_flag = c.read_flag()?;
    if vps.extension_flag {
        skip_extension_data(c)?;
    }

    log::debug!(
        "Parsed VPS {} ({} sub-layers)",
        vps.video_parameter_set_id,
        vps.max_sub_layers_minus1 + 1
    );

    Ok(vps)
}

/// Consumes `*_extension_data_flag` bits up to the RBSP trailing bits.
fn skip_extension_data(c: &mut BitCursor) -> Result<()> {
    while c.more_rbsp_data() {
        c.read_bit()?;
    }

    Ok(())
}

/// Quantization matrices, stored in raster order. The 16x16 and 32x32 lists
/// are kept as the 8x8 matrices they are upsampled from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingList {
    /// Indexed by sizeId, then matrixId. 4x4 lists only use 16 entries.
    pub lists: [[[u8; 64]; 6]; 4],
    /// DC coefficients of the 16x16 (sizeId 2) and 32x32 (sizeId 3) lists.
    pub dc_coef: [[u8; 6]; 4],
}

impl Default for ScalingList {
    /// The default lists of Tables 7-5 and 7-6.
    fn default() -> Self {
        let mut sl = Self {
            lists: [[[0; 64]; 6]; 4],
            dc_coef: [[16; 6]; 4],
        };

        for (size_id, &num_lists) in SCALING_LIST_NUM.iter().enumerate() {
            for list_id in 0..num_lists {
                sl.set_default(size_id, list_id);
            }
        }

        sl
    }
}

impl ScalingList {
    fn set_default(&mut self, size_id: usize, list_id: usize) {
        self.dc_coef[size_id][list_id] = 16;

        if size_id == 0 {
            self.lists[0][list_id][..16].fill(16);
            return;
        }

        let is_intra = if size_id == 3 { list_id == 0 } else { list_id < 3 };
        let src = if is_intra {
            &DEFAULT_SCALING_LIST_INTRA
        } else {
            &DEFAULT_SCALING_LIST_INTER
        };

        for (&pos, &coef) in DIAGONAL_SCAN_8X8.iter().zip(src.iter()) {
            self.lists[size_id][list_id][pos] = coef;
        }
    }
}

/// Parses `scaling_list_data()`.
pub fn parse_scaling_list_data(c: &mut BitCursor) -> Result<ScalingList> {
    let mut sl = ScalingList::default();

    for (size_id, &num_lists) in SCALING_LIST_NUM.iter().enumerate() {
        let coef_num = std::cmp::min(64, 16 << (2 * size_id));
        let scan = if size_id == 0 {
            &DIAGONAL_SCAN_4X4
        } else {
            &DIAGONAL_SCAN_8X8
        };

        for list_id in 0..num_lists {
            let scaling_list_pred_mode_flag = c.read_flag()?;
            if !scaling_list_pred_mode_flag {
                let delta = c.read_ue_max(list_id as u32)? as usize;
                let ref_list_id = list_id - delta;

                if ref_list_id == list_id {
                    sl.set_default(size_id, list_id);
                } else {
                    sl.lists[size_id][list_id] = sl.lists[size_id][ref_list_id];
                    sl.dc_coef[size_id][list_id] = sl.dc_coef[size_id][ref_list_id];
                }
            } else {
                let mut next_coef = 8;
                if size_id > 1 {
                    next_coef = c.read_se_bounded(-7, 247)? + 8;
                    sl.dc_coef[size_id][list_id] = next_coef as u8;
                }

                for &pos in scan.iter().take(coef_num) {
                    let delta = c.read_se_bounded(-128, 127)?;
                    next_coef = (next_coef + delta + 256) % 256;
                    sl.lists[size_id][list_id][pos] = next_coef as u8;
                }
            }
        }
    }

    Ok(sl)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    /// Sample aspect ratio, either signalled or looked up from Table E.1.
    pub sar_width: u16,
    pub sar_height: u16,
    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,
    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coeffs: u8,
    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u32,
    pub chroma_sample_loc_type_bottom_field: u32,
    pub neutral_chroma_indication_flag: bool,
    pub field_seq_flag: bool,
    pub frame_field_info_present_flag: bool,
    pub default_display_window_flag: bool,
    /// Display window offsets, in luma samples.
    pub def_disp_win_left_offset: u32,
    pub def_disp_win_right_offset: u32,
    pub def_disp_win_top_offset: u32,
    pub def_disp_win_bottom_offset: u32,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
    pub hrd_parameters_present_flag: bool,
    pub hrd: HrdParams,
    pub bitstream_restriction_flag: bool,
    pub tiles_fixed_structure_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub restricted_ref_pic_lists_flag: bool,
    pub min_spatial_segmentation_idc: u32,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_min_cu_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: false,
            aspect_ratio_idc: 0,
            sar_width: 0,
            sar_height: 0,
            overscan_info_present_flag: false,
            overscan_appropriate_flag: false,
            video_signal_type_present_flag: false,
            // Unspecified video format, colour primaries, transfer
            // characteristics and matrix coefficients.
            video_format: 5,
            video_full_range_flag: false,
            colour_description_present_flag: false,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coeffs: 2,
            chroma_loc_info_present_flag: false,
            chroma_sample_loc_type_top_field: 0,
            chroma_sample_loc_type_bottom_field: 0,
            neutral_chroma_indication_flag: false,
            field_seq_flag: false,
            frame_field_info_present_flag: false,
            default_display_window_flag: false,
            def_disp_win_left_offset: 0,
            def_disp_win_right_offset: 0,
            def_disp_win_top_offset: 0,
            def_disp_win_bottom_offset: 0,
            timing_info_present_flag: false,
            num_units_in_tick: 0,
            time_scale: 0,
            poc_proportional_to_timing_flag: false,
            num_ticks_poc_diff_one_minus1: 0,
            hrd_parameters_present_flag: false,
            hrd: Default::default(),
            bitstream_restriction_flag: false,
            tiles_fixed_structure_flag: false,
            motion_vectors_over_pic_boundaries_flag: true,
            restricted_ref_pic_lists_flag: false,
            min_spatial_segmentation_idc: 0,
            max_bytes_per_pic_denom: 2,
            max_bits_per_min_cu_denom: 1,
            log2_max_mv_length_horizontal: 15,
            log2_max_mv_length_vertical: 15,
        }
    }
}

/// A cropping window as signalled: offsets in chroma units, to be scaled to
/// luma samples.
struct Window {
    left: u32,
    right: u32,
    top: u32,
    bottom: u32,
}

impl Window {
    fn parse(c: &mut BitCursor) -> Result<Self> {
        Ok(Self {
            left: c.read_ue()?,
            right: c.read_ue()?,
            top: c.read_ue()?,
            bottom: c.read_ue()?,
        })
    }

    /// Scales the window to luma samples and checks it fits the picture.
    fn scale(&self, chroma_format_idc: u8, width: u32, height: u32) -> Result<[u32; 4]> {
        let sub_width = u64::from(SUB_WIDTH_C[usize::from(chroma_format_idc & 3)]);
        let sub_height = u64::from(SUB_HEIGHT_C[usize::from(chroma_format_idc & 3)]);

        let left = u64::from(self.left) * sub_width;
        let right = u64::from(self.right) * sub_width;
        let top = u64::from(self.top) * sub_height;
        let bottom = u64::from(self.bottom) * sub_height;

        if left + right >= u64::from(width) || top + bottom >= u64::from(height) {
            return Err(invalid_stream!(
                "Window ({}, {}, {}, {}) does not fit a {}x{} picture",
                left,
                right,
                top,
                bottom,
                width,
                height
            ));
        }

        Ok([left as u32, right as u32, top as u32, bottom as u32])
    }
}

/// Parses `vui_parameters()` for `sps`.
pub fn parse_vui_parameters(c: &mut BitCursor, sps: &Sps) -> Result<VuiParams> {
    let mut vui = VuiParams {
        aspect_ratio_info_present_flag: c.read_flag()?,
        ..Default::default()
    };

    if vui.aspect_ratio_info_present_flag {
        let aspect_ratio_idc = c.read_bits(8)?;
        if aspect_ratio_idc == EXTENDED_SAR {
            vui.aspect_ratio_idc = aspect_ratio_idc as u8;
            vui.sar_width = c.read_bits(16)? as u16;
            vui.sar_height = c.read_bits(16)? as u16;
        } else if aspect_ratio_idc == 0 || aspect_ratio_idc as usize >= SAR_TABLE.len() {
            log::debug!("Ignoring reserved aspect_ratio_idc {}", aspect_ratio_idc);
            vui.aspect_ratio_info_present_flag = false;
        } else {
            vui.aspect_ratio_idc = aspect_ratio_idc as u8;
            (vui.sar_width, vui.sar_height) = SAR_TABLE[aspect_ratio_idc as usize];
        }
    }

    vui.overscan_info_present_flag = c.read_flag()?;
    if vui.overscan_info_present_flag {
        vui.overscan_appropriate_flag = c.read_flag()?;
    }

    vui.video_signal_type_present_flag = c.read_flag()?;
    if vui.video_signal_type_present_flag {
        vui.video_format = c.read_bits(3)? as u8;
        vui.video_full_range_flag = c.read_flag()?;
        vui.colour_description_present_flag = c.read_flag()?;
        if vui.colour_description_present_flag {
            vui.colour_primaries = c.read_bits(8)? as u8;
            vui.transfer_characteristics = c.read_bits(8)? as u8;
            vui.matrix_coeffs = c.read_bits(8)? as u8;
        }
    }

    vui.chroma_loc_info_present_flag = c.read_flag()?;
    if vui.chroma_loc_info_present_flag {
        vui.chroma_sample_loc_type_top_field = c.read_ue_max(5)?;
        vui.chroma_sample_loc_type_bottom_field = c.read_ue_max(5)?;
    }

    vui.neutral_chroma_indication_flag = c.read_flag()?;
    vui.field_seq_flag = c.read_flag()?;
    vui.frame_field_info_present_flag = c.read_flag()?;

    vui.default_display_window_flag = c.read_flag()?;
    if vui.default_display_window_flag {
        let [left, right, top, bottom] = Window::parse(c)?.scale(
            sps.chroma_format_idc,
            sps.pic_width_in_luma_samples,
            sps.pic_height_in_luma_samples,
        )?;
        vui.def_disp_win_left_offset = left;
        vui.def_disp_win_right_offset = right;
        vui.def_disp_win_top_offset = top;
        vui.def_disp_win_bottom_offset = bottom;
    }

    vui.timing_info_present_flag = c.read_flag()?;
    if vui.timing_info_present_flag {
        vui.num_units_in_tick = c.read_bits(32)?;
        vui.time_scale = c.read_bits(32)?;
        vui.poc_proportional_to_timing_flag = c.read_flag()?;
        if vui.poc_proportional_to_timing_flag {
            vui.num_ticks_poc_diff_one_minus1 = c.read_ue()?;
        }

        vui.hrd_parameters_present_flag = c.read_flag()?;
        if vui.hrd_parameters_present_flag {
            vui.hrd = parse_hrd_parameters(c, true, sps.max_sub_layers_minus1)?;
        }
    }

    vui.bitstream_restriction_flag = c.read_flag()?;
    if vui.bitstream_restriction_flag {
        vui.tiles_fixed_structure_flag = c.read_flag()?;
        vui.motion_vectors_over_pic_boundaries_flag = c.read_flag()?;
        vui.restricted_ref_pic_lists_flag = c.read_flag()?;
        vui.min_spatial_segmentation_idc = c.read_ue_max(4095)?;
        vui.max_bytes_per_pic_denom = c.read_ue_max(16)?;
        vui.max_bits_per_min_cu_denom = c.read_ue_max(16)?;
        vui.log2_max_mv_length_horizontal = c.read_ue_max(15)?;
        vui.log2_max_mv_length_vertical = c.read_ue_max(15)?;
    }

    Ok(vui)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpsRangeExtension {
    pub transform_skip_rotation_enabled_flag: bool,
    pub transform_skip_context_enabled_flag: bool,
    pub implicit_rdpcm_enabled_flag: bool,
    pub explicit_rdpcm_enabled_flag: bool,
    pub extended_precision_processing_flag: bool,
    pub intra_smoothing_disabled_flag: bool,
    pub high_precision_offsets_enabled_flag: bool,
    pub persistent_rice_adaptation_enabled_flag: bool,
    pub cabac_bypass_alignment_enabled_flag: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpsSccExtension {
    pub curr_pic_ref_enabled_flag: bool,
    pub palette_mode_enabled_flag: bool,
    pub palette_max_size: u32,
    pub delta_palette_max_predictor_size: u32,
    pub palette_predictor_initializers_present_flag: bool,
    pub num_palette_predictor_initializer_minus1: u32,
    /// Indexed by component, then entry.
    pub palette_predictor_initializer: [Vec<u32>; 3],
    pub motion_vector_resolution_control_idc: u8,
    pub intra_boundary_filtering_disabled_flag: bool,
}

fn parse_sps_range_extension(c: &mut BitCursor) -> Result<SpsRangeExtension> {
    Ok(SpsRangeExtension {
        transform_skip_rotation_enabled_flag: c.read_flag()?,
        transform_skip_context_enabled_flag: c.read_flag()?,
        implicit_rdpcm_enabled_flag: c.read_flag()?,
        explicit_rdpcm_enabled_flag: c.read_flag()?,
        extended_precision_processing_flag: c.read_flag()?,
        intra_smoothing_disabled_flag: c.read_flag()?,
        high_precision_offsets_enabled_flag: c.read_flag()?,
        persistent_rice_adaptation_enabled_flag: c.read_flag()?,
        cabac_bypass_alignment_enabled_flag: c.read_flag()?,
    })
}

fn parse_sps_scc_extension(c: &mut BitCursor, sps: &Sps) -> Result<SpsSccExtension> {
    let mut scc = SpsSccExtension {
        curr_pic_ref_enabled_flag: c.read_flag()?,
        palette_mode_enabled_flag: c.read_flag()?,
        ..Default::default()
    };

    if scc.palette_mode_enabled_flag {
        scc.palette_max_size = c.read_ue_max(64)?;
        scc.delta_palette_max_predictor_size = c.read_ue()?;
        if scc.palette_max_size == 0 && scc.delta_palette_max_predictor_size != 0 {
            return Err(invalid_stream!(
                "delta_palette_max_predictor_size must be 0 without a palette"
            ));
        }
        if scc.delta_palette_max_predictor_size > 128 - scc.palette_max_size {
            return Err(invalid_stream!(
                "Invalid delta_palette_max_predictor_size {}",
                scc.delta_palette_max_predictor_size
            ));
        }

        scc.palette_predictor_initializers_present_flag = c.read_flag()?;
        if scc.palette_predictor_initializers_present_flag {
            if scc.palette_max_size == 0 {
                return Err(invalid_stream!(
                    "Palette predictor initializers without a palette"
                ));
            }

            let max = scc.palette_max_size + scc.delta_palette_max_predictor_size - 1;
            scc.num_palette_predictor_initializer_minus1 = c.read_ue_max(max)?;

            let num_comps = if sps.chroma_format_idc == 0 { 1 } else { 3 };
            let num_entries = scc.num_palette_predictor_initializer_minus1 as usize + 1;
            for comp in 0..num_comps {
                let bit_depth = if comp == 0 {
                    sps.bit_depth_luma
                } else {
                    sps.bit_depth_chroma
                };

                let entries = &mut scc.palette_predictor_initializer[comp];
                for _ in 0..num_entries {
                    entries.push(c.read_bits(u32::from(bit_depth))?);
                }
            }
        }
    }

    scc.motion_vector_resolution_control_idc = c.read_bits(2)? as u8;
    if scc.motion_vector_resolution_control_idc == 3 {
        return Err(invalid_stream!("motion_vector_resolution_control_idc is 3"));
    }

    scc.intra_boundary_filtering_disabled_flag = c.read_flag()?;

    Ok(scc)
}

/// A Sequence Parameter Set.
///
/// Sizes are stored as their derived values rather than the `_minus` syntax
/// elements, e.g. `bit_depth_luma` holds `bit_depth_luma_minus8 + 8`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub video_parameter_set_id: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    /// ChromaArrayType.
    pub chroma_array_type: u8,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub conformance_window_flag: bool,
    /// Conformance window offsets, in luma samples.
    pub conf_win_left_offset: u32,
    pub conf_win_right_offset: u32,
    pub conf_win_top_offset: u32,
    pub conf_win_bottom_offset: u32,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    /// QpBdOffsetY.
    pub qp_bd_offset_y: i32,
    /// QpBdOffsetC.
    pub qp_bd_offset_c: i32,
    pub log2_max_pic_order_cnt_lsb: u8,
    pub sub_layer_ordering_info_present_flag: bool,
    pub ordering: SubLayerOrderingInfo,
    pub log2_min_luma_coding_block_size: u32,
    pub log2_diff_max_min_luma_coding_block_size: u32,
    pub log2_min_transform_block_size: u32,
    pub log2_max_transform_block_size: u32,
    pub max_transform_hierarchy_depth_inter: u32,
    pub max_transform_hierarchy_depth_intra: u32,
    pub scaling_list_enabled_flag: bool,
    pub scaling_list_data_present_flag: bool,
    pub scaling_list: ScalingList,
    pub amp_enabled_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub pcm_enabled_flag: bool,
    pub pcm_sample_bit_depth_luma: u8,
    pub pcm_sample_bit_depth_chroma: u8,
    pub log2_min_pcm_luma_coding_block_size: u32,
    pub log2_max_pcm_luma_coding_block_size: u32,
    pub pcm_loop_filter_disabled_flag: bool,
    pub short_term_ref_pic_sets: Vec<ShortTermRefPicSet>,
    pub long_term_ref_pics_present_flag: bool,
    pub num_long_term_ref_pics_sps: u32,
    pub lt_ref_pic_poc_lsb_sps: [u32; MAX_LONG_TERM_REF_PICS_SPS],
    pub used_by_curr_pic_lt_sps_flag: [bool; MAX_LONG_TERM_REF_PICS_SPS],
    pub temporal_mvp_enabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,
    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
    pub extension_present_flag: bool,
    pub range_extension_flag: bool,
    pub multilayer_extension_flag: bool,
    pub three_d_extension_flag: bool,
    pub scc_extension_flag: bool,
    pub extension_4bits: u8,
    pub range_extension: SpsRangeExtension,
    pub scc_extension: SpsSccExtension,

    // Derived values.
    /// CtbLog2SizeY.
    pub ctb_log2_size_y: u32,
    /// Size of a coding tree block in luma samples.
    pub max_cu_size: u32,
    /// Depth of the coding quadtree, transform splits below the minimum CU
    /// included.
    pub max_cu_depth: u32,
    pub add_cu_depth: u32,
    pub min_cu_size: u32,
    /// PicWidthInCtbsY.
    pub pic_width_in_ctbs: u32,
    /// PicHeightInCtbsY.
    pub pic_height_in_ctbs: u32,
}

impl Sps {
    /// Number of short-term RPSs signalled in the SPS.
    pub fn num_short_term_ref_pic_sets(&self) -> usize {
        self.short_term_ref_pic_sets.len()
    }

    /// PicSizeInCtbsY.
    pub fn pic_size_in_ctbs(&self) -> u32 {
        self.pic_width_in_ctbs
            .saturating_mul(self.pic_height_in_ctbs)
    }

    /// DPB size of the highest sub-layer.
    pub fn max_dec_pic_buffering(&self) -> u32 {
        self.ordering.max_dec_pic_buffering[usize::from(self.max_sub_layers_minus1)]
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << self.log2_max_pic_order_cnt_lsb
    }

    pub fn profile(&self) -> Option<Profile> {
        self.profile_tier_level.general.profile()
    }

    /// Whether the SCC tools may be used, which requires the SCC profile.
    pub fn is_scc_profile(&self) -> bool {
        self.profile_tier_level.general.profile_idc == Profile::ScreenContentCoding as u8
    }
}

/// Parses a `seq_parameter_set_rbsp()`, the NAL header already consumed.
pub fn parse_sps(c: &mut BitCursor) -> Result<Sps> {
    let mut sps = Sps {
        video_parameter_set_id: c.read_bits(4)? as u8,
        max_sub_layers_minus1: c.read_bits(3)? as u8,
        temporal_id_nesting_flag: c.read_flag()?,
        ..Default::default()
    };

    if usize::from(sps.max_sub_layers_minus1) >= MAX_SUB_LAYERS {
        return Err(invalid_stream!(
            "Invalid sps_max_sub_layers_minus1 {}",
            sps.max_sub_layers_minus1
        ));
    }

    if sps.max_sub_layers_minus1 == 0 && !sps.temporal_id_nesting_flag {
        return Err(invalid_stream!(
            "sps_temporal_id_nesting_flag must be set with a single sub-layer"
        ));
    }

    sps.profile_tier_level = parse_profile_tier_level(c, sps.max_sub_layers_minus1)?;

    sps.seq_parameter_set_id = c.read_ue_max(MAX_SPS_ID)? as u8;
    sps.chroma_format_idc = c.read_ue_max(3)? as u8;
    if sps.chroma_format_idc == 3 {
        sps.separate_colour_plane_flag = c.read_flag()?;
    }

    sps.chroma_array_type = if sps.separate_colour_plane_flag {
        0
    } else {
        sps.chroma_format_idc
    };

    sps.pic_width_in_luma_samples = c.read_ue_max(MAX_PIC_DIMENSION)?;
    sps.pic_height_in_luma_samples = c.read_ue_max(MAX_PIC_DIMENSION)?;
    if sps.pic_width_in_luma_samples == 0 || sps.pic_height_in_luma_samples == 0 {
        return Err(invalid_stream!(
            "Invalid picture size {}x{}",
            sps.pic_width_in_luma_samples,
            sps.pic_height_in_luma_samples
        ));
    }

    sps.conformance_window_flag = c.read_flag()?;
    if sps.conformance_window_flag {
        let [left, right, top, bottom] = Window::parse(c)?.scale(
            sps.chroma_format_idc,
            sps.pic_width_in_luma_samples,
            sps.pic_height_in_luma_samples,
        )?;
        sps.conf_win_left_offset = left;
        sps.conf_win_right_offset = right;
        sps.conf_win_top_offset = top;
        sps.conf_win_bottom_offset = bottom;
    }

    sps.bit_depth_luma = c.read_ue_max(6)? as u8 + 8;
    sps.qp_bd_offset_y = 6 * (i32::from(sps.bit_depth_luma) - 8);
    sps.bit_depth_chroma = c.read_ue_max(6)? as u8 + 8;
    sps.qp_bd_offset_c = 6 * (i32::from(sps.bit_depth_chroma) - 8);

    // High bit depth streams signalled as Main are decoded as Main 10.
    let general = &mut sps.profile_tier_level.general;
    if (sps.bit_depth_luma > 8 || sps.bit_depth_chroma > 8)
        && general.profile_idc < Profile::Main10 as u8
    {
        general.profile_idc = Profile::Main10 as u8;
    }

    sps.log2_max_pic_order_cnt_lsb = c.read_ue_max(12)? as u8 + 4;

    sps.sub_layer_ordering_info_present_flag = c.read_flag()?;
    sps.ordering = parse_sub_layer_ordering_info(
        c,
        sps.sub_layer_ordering_info_present_flag,
        usize::from(sps.max_sub_layers_minus1) + 1,
    )?;

    parse_sps_block_sizes(c, &mut sps)?;

    sps.scaling_list_enabled_flag = c.read_flag()?;
    if sps.scaling_list_enabled_flag {
        sps.scaling_list_data_present_flag = c.read_flag()?;
        if sps.scaling_list_data_present_flag {
            sps.scaling_list = parse_scaling_list_data(c)?;
        }
    }

    sps.amp_enabled_flag = c.read_flag()?;
    sps.sample_adaptive_offset_enabled_flag = c.read_flag()?;

    sps.pcm_enabled_flag = c.read_flag()?;
    if sps.pcm_enabled_flag {
        parse_sps_pcm(c, &mut sps)?;
    }

    let num_short_term_ref_pic_sets = c.read_ue_max(MAX_SHORT_TERM_REF_PIC_SETS)? as usize;
    let max_dec_pic_buffering = sps.max_dec_pic_buffering();
    for i in 0..num_short_term_ref_pic_sets {
        let rps = parse_short_term_ref_pic_set(
            c,
            &sps.short_term_ref_pic_sets,
            i,
            num_short_term_ref_pic_sets,
        )?;

        if rps.num_negative_pics > max_dec_pic_buffering
            || rps.num_positive_pics > max_dec_pic_buffering - rps.num_negative_pics
        {
            return Err(invalid_stream!(
                "Short-term RPS {} does not fit a DPB of {} pictures",
                i,
                max_dec_pic_buffering
            ));
        }

        sps.short_term_ref_pic_sets.push(rps);
    }

    sps.long_term_ref_pics_present_flag = c.read_flag()?;
    if sps.long_term_ref_pics_present_flag {
        sps.num_long_term_ref_pics_sps = c.read_ue_max(MAX_LONG_TERM_REF_PICS_SPS as u32)?;
        for i in 0..sps.num_long_term_ref_pics_sps as usize {
            sps.lt_ref_pic_poc_lsb_sps[i] =
                c.read_bits(u32::from(sps.log2_max_pic_order_cnt_lsb))?;
            sps.used_by_curr_pic_lt_sps_flag[i] = c.read_flag()?;
        }
    }

    sps.temporal_mvp_enabled_flag = c.read_flag()?;
    sps.strong_intra_smoothing_enabled_flag = c.read_flag()?;

    sps.vui_parameters_present_flag = c.read_flag()?;
    if sps.vui_parameters_present_flag {
        sps.vui_parameters = parse_vui_parameters(c, &sps)?;
    }

    sps.extension_present_flag = c.read_flag()?;
    if sps.extension_present_flag {
        parse_sps_extensions(c, &mut sps)?;
    }

    log::debug!(
        "Parsed SPS {}: {}x{}, {} bit, CTB {}, {} short-term RPSs",
        sps.seq_parameter_set_id,
        sps.pic_width_in_luma_samples,
        sps.pic_height_in_luma_samples,
        sps.bit_depth_luma,
        sps.max_cu_size,
        sps.short_term_ref_pic_sets.len()
    );

    Ok(sps)
}

/// Coding and transform block size ladder, and the values derived from it.
fn parse_sps_block_sizes(c: &mut BitCursor, sps: &mut Sps) -> Result<()> {
    sps.log2_min_luma_coding_block_size = c.read_ue_max(3)? + 3;
    let min_cb_size = 1 << sps.log2_min_luma_coding_block_size;
    if sps.pic_width_in_luma_samples % min_cb_size != 0
        || sps.pic_height_in_luma_samples % min_cb_size != 0
    {
        return Err(invalid_stream!(
            "Picture size {}x{} is not a multiple of the minimum CB size {}",
            sps.pic_width_in_luma_samples,
            sps.pic_height_in_luma_samples,
            min_cb_size
        ));
    }

    sps.log2_diff_max_min_luma_coding_block_size = c.read_ue_max(3)?;
    sps.ctb_log2_size_y =
        sps.log2_min_luma_coding_block_size + sps.log2_diff_max_min_luma_coding_block_size;
    if !(4..=6).contains(&sps.ctb_log2_size_y) {
        return Err(invalid_stream!(
            "Invalid CtbLog2SizeY {}",
            sps.ctb_log2_size_y
        ));
    }
    sps.max_cu_size = 1 << sps.ctb_log2_size_y;

    sps.log2_min_transform_block_size = c.read_ue_max(3)? + 2;
    if sps.log2_min_transform_block_size >= sps.log2_min_luma_coding_block_size {
        return Err(invalid_stream!(
            "Invalid log2_min_luma_transform_block_size {}",
            sps.log2_min_transform_block_size
        ));
    }

    sps.log2_max_transform_block_size = c.read_ue_max(3)? + sps.log2_min_transform_block_size;
    if sps.log2_max_transform_block_size > std::cmp::min(5, sps.ctb_log2_size_y) {
        return Err(invalid_stream!(
            "Invalid MaxTbLog2SizeY {}",
            sps.log2_max_transform_block_size
        ));
    }

    let max_depth = sps.ctb_log2_size_y - sps.log2_min_transform_block_size;
    sps.max_transform_hierarchy_depth_inter = c.read_ue_max(max_depth)?;
    sps.max_transform_hierarchy_depth_intra = c.read_ue_max(max_depth)?;

    let diff = sps.log2_diff_max_min_luma_coding_block_size;
    let mut add_cu_depth = 0;
    while (sps.max_cu_size >> diff) > (1 << (sps.log2_min_transform_block_size + add_cu_depth)) {
        add_cu_depth += 1;
    }

    sps.add_cu_depth = add_cu_depth;
    sps.max_cu_depth = diff + add_cu_depth;
    sps.min_cu_size = sps.max_cu_size >> sps.max_cu_depth;

    sps.pic_width_in_ctbs = sps.pic_width_in_luma_samples.div_ceil(sps.max_cu_size);
    sps.pic_height_in_ctbs = sps.pic_height_in_luma_samples.div_ceil(sps.max_cu_size);

    Ok(())
}

fn parse_sps_pcm(c: &mut BitCursor, sps: &mut Sps) -> Result<()> {
    sps.pcm_sample_bit_depth_luma = c.read_bits(4)? as u8 + 1;
    sps.pcm_sample_bit_depth_chroma = c.read_bits(4)? as u8 + 1;
    if sps.pcm_sample_bit_depth_luma > sps.bit_depth_luma
        || sps.pcm_sample_bit_depth_chroma > sps.bit_depth_chroma
    {
        return Err(invalid_stream!("PCM bit depth exceeds the sample bit depth"));
    }

    let max = std::cmp::min(sps.ctb_log2_size_y, 5);
    let min = std::cmp::min(sps.log2_min_luma_coding_block_size, 5);

    sps.log2_min_pcm_luma_coding_block_size = c.read_ue_max(max - 3)? + 3;
    if sps.log2_min_pcm_luma_coding_block_size < min {
        return Err(invalid_stream!(
            "Invalid Log2MinIpcmCbSizeY {}",
            sps.log2_min_pcm_luma_coding_block_size
        ));
    }

    sps.log2_max_pcm_luma_coding_block_size =
        c.read_ue_max(max - sps.log2_min_pcm_luma_coding_block_size)?
            + sps.log2_min_pcm_luma_coding_block_size;

    sps.pcm_loop_filter_disabled_flag = c.read_flag()?;

    Ok(())
}

fn parse_sps_extensions(c: &mut BitCursor, sps: &mut Sps) -> Result<()> {
    sps.range_extension_flag = c.read_flag()?;
    sps.multilayer_extension_flag = c.read_flag()?;
    sps.three_d_extension_flag = c.read_flag()?;
    sps.scc_extension_flag = c.read_flag()?;
    sps.extension_4bits = c.read_bits(4)? as u8;

    if sps.range_extension_flag {
        sps.range_extension = parse_sps_range_extension(c)?;
    }

    // Multi-layer and 3D extensions are not parsed, and precede the SCC one.
    let mut skip = sps.multilayer_extension_flag || sps.three_d_extension_flag;

    if sps.scc_extension_flag && !skip {
        if sps.is_scc_profile() {
            sps.scc_extension = parse_sps_scc_extension(c, sps)?;
        } else {
            log::debug!("Skipping SCC extension of a non SCC profile");
            skip = true;
        }
    }

    if skip || sps.extension_4bits != 0 {
        skip_extension_data(c)?;
    }

    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PpsRangeExtension {
    pub log2_max_transform_skip_block_size: u32,
    pub cross_component_prediction_enabled_flag: bool,
    pub chroma_qp_offset_list_enabled_flag: bool,
    pub diff_cu_chroma_qp_offset_depth: u32,
    pub chroma_qp_offset_list_len: u32,
    pub cb_qp_offset_list: [i32; 6],
    pub cr_qp_offset_list: [i32; 6],
    pub log2_sao_offset_scale_luma: u32,
    pub log2_sao_offset_scale_chroma: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PpsSccExtension {
    pub curr_pic_ref_enabled_flag: bool,
    pub residual_adaptive_colour_transform_enabled_flag: bool,
    pub slice_act_qp_offsets_present_flag: bool,
    /// PpsActQpOffsetY, with the `plus5` removed.
    pub act_y_qp_offset: i32,
    /// PpsActQpOffsetCb, with the `plus5` removed.
    pub act_cb_qp_offset: i32,
    /// PpsActQpOffsetCr, with the `plus3` removed.
    pub act_cr_qp_offset: i32,
    pub palette_predictor_initializers_present_flag: bool,
    pub num_palette_predictor_initializers: u32,
    pub monochrome_palette_flag: bool,
    pub luma_bit_depth_entry: u8,
    pub chroma_bit_depth_entry: u8,
    /// Indexed by component, then entry.
    pub palette_predictor_initializer: [Vec<u32>; 3],
}

/// A Picture Parameter Set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
    pub sign_data_hiding_enabled_flag: bool,
    pub cabac_init_present_flag: bool,
    pub num_ref_idx_l0_default_active: u32,
    pub num_ref_idx_l1_default_active: u32,
    /// `init_qp_minus26 + 26`.
    pub init_qp: i32,
    pub constrained_intra_pred_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub diff_cu_qp_delta_depth: u32,
    pub cb_qp_offset: i32,
    pub cr_qp_offset: i32,
    pub slice_chroma_qp_offsets_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub transquant_bypass_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub num_tile_columns: u32,
    pub num_tile_rows: u32,
    pub uniform_spacing_flag: bool,
    /// Width of each tile column in CTBs, signalled or derived.
    pub column_widths: Vec<u32>,
    /// Height of each tile row in CTBs, signalled or derived.
    pub row_heights: Vec<u32>,
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub pps_deblocking_filter_disabled_flag: bool,
    /// `pps_beta_offset_div2 * 2`.
    pub beta_offset: i32,
    /// `pps_tc_offset_div2 * 2`.
    pub tc_offset: i32,
    pub scaling_list_data_present_flag: bool,
    pub scaling_list: ScalingList,
    pub lists_modification_present_flag: bool,
    pub log2_parallel_merge_level: u32,
    pub slice_segment_header_extension_present_flag: bool,
    pub extension_present_flag: bool,
    pub range_extension_flag: bool,
    pub multilayer_extension_flag: bool,
    pub three_d_extension_flag: bool,
    pub scc_extension_flag: bool,
    pub extension_4bits: u8,
    pub range_extension: PpsRangeExtension,
    pub scc_extension: PpsSccExtension,
}

/// Reads the PPS and SPS ids, which is all that can be parsed before the SPS
/// the PPS refers to is known.
pub fn parse_pps_part1(c: &mut BitCursor) -> Result<Pps> {
    Ok(Pps {
        pic_parameter_set_id: c.read_ue_max(MAX_PPS_ID)? as u8,
        seq_parameter_set_id: c.read_ue_max(MAX_SPS_ID)? as u8,
        ..Default::default()
    })
}

/// Parses the rest of the PPS against the SPS it refers to.
pub fn parse_pps_part2(c: &mut BitCursor, pps: &mut Pps, sps: &Sps) -> Result<()> {
    pps.dependent_slice_segments_enabled_flag = c.read_flag()?;
    pps.output_flag_present_flag = c.read_flag()?;
    pps.num_extra_slice_header_bits = c.read_bits(3)? as u8;
    pps.sign_data_hiding_enabled_flag = c.read_flag()?;
    pps.cabac_init_present_flag = c.read_flag()?;
    pps.num_ref_idx_l0_default_active = c.read_ue_max(14)? + 1;
    pps.num_ref_idx_l1_default_active = c.read_ue_max(14)? + 1;
    pps.init_qp = c.read_se_bounded(-(26 + sps.qp_bd_offset_y), 25)? + 26;
    pps.constrained_intra_pred_flag = c.read_flag()?;
    pps.transform_skip_enabled_flag = c.read_flag()?;

    pps.cu_qp_delta_enabled_flag = c.read_flag()?;
    if pps.cu_qp_delta_enabled_flag {
        pps.diff_cu_qp_delta_depth = c.read_ue_max(sps.log2_diff_max_min_luma_coding_block_size)?;
    }

    pps.cb_qp_offset = c.read_se_bounded(-12, 12)?;
    pps.cr_qp_offset = c.read_se_bounded(-12, 12)?;
    pps.slice_chroma_qp_offsets_present_flag = c.read_flag()?;
    pps.weighted_pred_flag = c.read_flag()?;
    pps.weighted_bipred_flag = c.read_flag()?;
    pps.transquant_bypass_enabled_flag = c.read_flag()?;
    pps.tiles_enabled_flag = c.read_flag()?;
    pps.entropy_coding_sync_enabled_flag = c.read_flag()?;

    parse_pps_tiles(c, pps, sps)?;

    pps.loop_filter_across_slices_enabled_flag = c.read_flag()?;

    pps.deblocking_filter_control_present_flag = c.read_flag()?;
    if pps.deblocking_filter_control_present_flag {
        pps.deblocking_filter_override_enabled_flag = c.read_flag()?;
        pps.pps_deblocking_filter_disabled_flag = c.read_flag()?;
        if !pps.pps_deblocking_filter_disabled_flag {
            pps.beta_offset = c.read_se_bounded(-6, 6)? * 2;
            pps.tc_offset = c.read_se_bounded(-6, 6)? * 2;
        }
    }

    pps.scaling_list_data_present_flag = c.read_flag()?;
    if pps.scaling_list_data_present_flag {
        pps.scaling_list = parse_scaling_list_data(c)?;
    }

    pps.lists_modification_present_flag = c.read_flag()?;
    pps.log2_parallel_merge_level = c.read_ue_max(sps.ctb_log2_size_y - 2)? + 2;
    pps.slice_segment_header_extension_present_flag = c.read_flag()?;

    pps.extension_present_flag = c.read_flag()?;
    if pps.extension_present_flag {
        parse_pps_extensions(c, pps, sps)?;
    }

    log::debug!(
        "Parsed PPS {} (SPS {}), {}x{} tiles",
        pps.pic_parameter_set_id,
        pps.seq_parameter_set_id,
        pps.num_tile_columns,
        pps.num_tile_rows
    );

    Ok(())
}

/// Splits `size` CTBs in `num` uniformly spaced tiles (6-3, 6-4).
fn uniform_tile_sizes(size: u32, num: u32) -> Vec<u32> {
    (0..num)
        .map(|i| {
            let (i, size, num) = (u64::from(i), u64::from(size), u64::from(num));
            (((i + 1) * size) / num - (i * size) / num) as u32
        })
        .collect()
}

/// Reads `num - 1` explicit tile sizes and derives the last one.
fn explicit_tile_sizes(c: &mut BitCursor, size: u32, num: u32) -> Result<Vec<u32>> {
    let mut sizes = Vec::with_capacity(num as usize);
    let mut total: u64 = 0;

    for _ in 0..num - 1 {
        let tile_size = c.read_ue_max(size - 1)? + 1;
        total += u64::from(tile_size);
        sizes.push(tile_size);
    }

    if total >= u64::from(size) {
        return Err(invalid_stream!(
            "Tiles span {} CTBs, the picture has {}",
            total,
            size
        ));
    }

    sizes.push(size - total as u32);
    Ok(sizes)
}

fn parse_pps_tiles(c: &mut BitCursor, pps: &mut Pps, sps: &Sps) -> Result<()> {
    let width = sps.pic_width_in_ctbs;
    let height = sps.pic_height_in_ctbs;

    if !pps.tiles_enabled_flag {
        pps.num_tile_columns = 1;
        pps.num_tile_rows = 1;
        pps.uniform_spacing_flag = true;
        pps.column_widths = vec![width];
        pps.row_heights = vec![height];
        return Ok(());
    }

    pps.num_tile_columns = c.read_ue_max(width.saturating_sub(1))? + 1;
    pps.num_tile_rows = c.read_ue_max(height.saturating_sub(1))? + 1;
    if pps.num_tile_columns == 1 && pps.num_tile_rows == 1 {
        return Err(invalid_stream!("Tiles enabled with a single tile"));
    }

    pps.uniform_spacing_flag = c.read_flag()?;
    if pps.uniform_spacing_flag {
        pps.column_widths = uniform_tile_sizes(width, pps.num_tile_columns);
        pps.row_heights = uniform_tile_sizes(height, pps.num_tile_rows);
    } else {
        pps.column_widths = explicit_tile_sizes(c, width, pps.num_tile_columns)?;
        pps.row_heights = explicit_tile_sizes(c, height, pps.num_tile_rows)?;
    }

    pps.loop_filter_across_tiles_enabled_flag = c.read_flag()?;

    Ok(())
}

fn parse_pps_range_extension(c: &mut BitCursor, pps: &Pps, sps: &Sps) -> Result<PpsRangeExtension> {
    let mut ext = PpsRangeExtension::default();

    if pps.transform_skip_enabled_flag {
        ext.log2_max_transform_skip_block_size =
            c.read_ue_max(sps.log2_max_transform_block_size - 2)? + 2;
    }

    ext.cross_component_prediction_enabled_flag = c.read_flag()?;

    ext.chroma_qp_offset_list_enabled_flag = c.read_flag()?;
    if ext.chroma_qp_offset_list_enabled_flag {
        ext.diff_cu_chroma_qp_offset_depth =
            c.read_ue_max(sps.log2_diff_max_min_luma_coding_block_size)?;
        ext.chroma_qp_offset_list_len = c.read_ue_max(5)? + 1;
        for i in 0..ext.chroma_qp_offset_list_len as usize {
            ext.cb_qp_offset_list[i] = c.read_se_bounded(-12, 12)?;
            ext.cr_qp_offset_list[i] = c.read_se_bounded(-12, 12)?;
        }
    }

    let max_scale = |bit_depth: u8| u32::from(bit_depth.saturating_sub(10));
    ext.log2_sao_offset_scale_luma = c.read_ue_max(max_scale(sps.bit_depth_luma))?;
    ext.log2_sao_offset_scale_chroma = c.read_ue_max(max_scale(sps.bit_depth_chroma))?;

    Ok(ext)
}

fn parse_pps_scc_extension(c: &mut BitCursor, sps: &Sps) -> Result<PpsSccExtension> {
    let mut scc = PpsSccExtension {
        curr_pic_ref_enabled_flag: c.read_flag()?,
        residual_adaptive_colour_transform_enabled_flag: c.read_flag()?,
        ..Default::default()
    };

    if scc.residual_adaptive_colour_transform_enabled_flag {
        scc.slice_act_qp_offsets_present_flag = c.read_flag()?;
        scc.act_y_qp_offset = c.read_se_bounded(-7, 17)? - 5;
        scc.act_cb_qp_offset = c.read_se_bounded(-7, 17)? - 5;
        scc.act_cr_qp_offset = c.read_se_bounded(-9, 15)? - 3;
    }

    scc.palette_predictor_initializers_present_flag = c.read_flag()?;
    if scc.palette_predictor_initializers_present_flag {
        let sps_scc = &sps.scc_extension;
        if !sps_scc.palette_mode_enabled_flag || sps_scc.palette_max_size == 0 {
            return Err(invalid_stream!(
                "PPS palette predictor initializers without an SPS palette"
            ));
        }

        scc.num_palette_predictor_initializers = c.read_ue_max(128)?;
        if scc.num_palette_predictor_initializers > 0 {
            scc.monochrome_palette_flag = c.read_flag()?;
            scc.luma_bit_depth_entry = c.read_ue_max(6)? as u8 + 8;
            if !scc.monochrome_palette_flag {
                scc.chroma_bit_depth_entry = c.read_ue_max(6)? as u8 + 8;
            }

            let num_comps = if scc.monochrome_palette_flag { 1 } else { 3 };
            for comp in 0..num_comps {
                let bit_depth = if comp == 0 {
                    scc.luma_bit_depth_entry
                } else {
                    scc.chroma_bit_depth_entry
                };

                for _ in 0..scc.num_palette_predictor_initializers {
                    let entry = c.read_bits(u32::from(bit_depth))?;
                    scc.palette_predictor_initializer[comp].push(entry);
                }
            }
        }
    }

    Ok(scc)
}

fn parse_pps_extensions(c: &mut BitCursor, pps: &mut Pps, sps: &Sps) -> Result<()> {
    pps.range_extension_flag = c.read_flag()?;
    pps.multilayer_extension_flag = c.read_flag()?;
    pps.three_d_extension_flag = c.read_flag()?;
    pps.scc_extension_flag = c.read_flag()?;
    pps.extension_4bits = c.read_bits(4)? as u8;

    if pps.range_extension_flag {
        pps.range_extension = parse_pps_range_extension(c, pps, sps)?;
    }

    let mut skip = pps.multilayer_extension_flag || pps.three_d_extension_flag;

    if pps.scc_extension_flag && !skip {
        if sps.is_scc_profile() {
            pps.scc_extension = parse_pps_scc_extension(c, sps)?;
        } else {
            log::debug!("Skipping SCC extension of a non SCC profile");
            skip = true;
        }
    }

    if skip || pps.extension_4bits != 0 {
        skip_extension_data(c)?;
    }

    Ok(())
}

/// Knobs of the [`Parser`] front end.
#[derive(Clone, Debug)]
pub struct ParserOptions {
    /// Bytes of zero padding the bit cursor may read past each payload.
    pub tail_padding: usize,
    /// Upper bound on the slots of the object pool, `None` for unbounded.
    pub pool_capacity: Option<usize>,
    /// Whether reference list construction fills in missing references with
    /// the first available one.
    pub substitute_missing_references: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            tail_padding: 0,
            pool_capacity: None,
            substitute_missing_references: true,
        }
    }
}

/// What [`Parser::parse_nalu`] made of a NAL unit.
#[derive(Debug)]
pub enum ParsedNalu {
    Vps(SharedHeader<Vps>),
    Sps(SharedHeader<Sps>),
    Pps(SharedHeader<Pps>),
    /// The payloads of an SEI NAL, in bitstream order.
    Sei(Vec<SharedHeader<SeiPayload>>),
    Slice(Box<Slice>),
    /// A NAL unit that carries nothing this parser keeps.
    Other(NaluHeader),
}

/// Parsing session: owns the parameter set stores and the state carried from
/// one slice to the next.
#[derive(Debug)]
pub struct Parser {
    options: ParserOptions,
    pool: ObjectPool,
    headers: Headers,
    poc: PocDecoding,
    /// Shared part of the last independent slice segment, inherited by the
    /// dependent segments that follow it.
    last_independent: Option<Arc<SliceShared>>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl Parser {
    pub fn new(options: ParserOptions) -> Self {
        let pool = ObjectPool::new(options.pool_capacity);

        Self {
            headers: Headers::new(pool.clone()),
            pool,
            options,
            poc: Default::default(),
            last_independent: None,
        }
    }

    pub fn options(&self) -> &ParserOptions {
        &self.options
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    pub fn poc_state(&self) -> &PocDecoding {
        &self.poc
    }

    /// Forgets the slice state. A full reset also drops every stored header.
    pub fn reset(&mut self, partial: bool) {
        self.headers.reset(partial);
        self.poc = Default::default();
        self.last_independent = None;
    }

    /// Parses one NAL unit, header included, still carrying its emulation
    /// prevention bytes.
    ///
    /// Errors other than [`ParseError::is_fatal`] ones only concern this NAL
    /// unit, which the caller should drop before moving on to the next.
    pub fn parse_nalu(&mut self, nalu: &[u8]) -> Result<ParsedNalu> {
        let header = NaluHeader::from_bytes(nalu).ok_or(ParseError::NotEnoughData)?;

        let parsed = match header.type_ {
            NaluType::VpsNut
            | NaluType::SpsNut
            | NaluType::PpsNut
            | NaluType::PrefixSeiNut
            | NaluType::SuffixSeiNut => true,
            type_ => type_.is_slice(),
        };

        if !parsed {
            let mut c = BitCursor::new(nalu);
            let header = parse_nal_unit_header(&mut c)?;
            if header.is_end() {
                log::debug!("End of sequence, resetting POC state");
                self.poc = Default::default();
                self.last_independent = None;
            }

            return Ok(ParsedNalu::Other(header));
        }

        // The RBSP lives in a pooled scratch buffer for the time of the parse.
        let rbsp = remove_emulation_prevention(nalu);
        let mut buffer = self.pool.allocate_raw(rbsp.len())?;
        buffer.copy_from_slice(&rbsp);

        let mut c = BitCursor::with_tail_padding(&buffer, self.options.tail_padding);
        let header = parse_nal_unit_header(&mut c)?;

        match header.type_ {
            NaluType::VpsNut => {
                let vps = parse_vps(&mut c)?;
                let id = u32::from(vps.video_parameter_set_id);
                Ok(ParsedNalu::Vps(self.headers.vps.add(id, vps)?))
            }
            NaluType::SpsNut => {
                let sps = parse_sps(&mut c)?;
                let id = u32::from(sps.seq_parameter_set_id);
                Ok(ParsedNalu::Sps(self.headers.sps.add(id, sps)?))
            }
            NaluType::PpsNut => {
                let mut pps = parse_pps_part1(&mut c)?;
                let sps_id = u32::from(pps.seq_parameter_set_id);
                let sps = self.headers.sps.get_shared(sps_id).ok_or_else(|| {
                    invalid_stream!("PPS {} refers to unknown SPS {}", pps.pic_parameter_set_id, sps_id)
                })?;

                parse_pps_part2(&mut c, &mut pps, &sps)?;
                let id = u32::from(pps.pic_parameter_set_id);
                Ok(ParsedNalu::Pps(self.headers.pps.add(id, pps)?))
            }
            NaluType::PrefixSeiNut | NaluType::SuffixSeiNut => {
                let payloads = parse_sei_rbsp(&mut c, self.headers.sps.get_current())?;
                let mut stored = Vec::with_capacity(payloads.len());
                for payload in payloads {
                    stored.push(self.headers.sei.add(payload.payload_type, payload)?);
                }

                Ok(ParsedNalu::Sei(stored))
            }
            _ => self.parse_slice(&mut c, header).map(ParsedNalu::Slice),
        }
    }

    fn parse_slice(&mut self, c: &mut BitCursor, header: NaluHeader) -> Result<Box<Slice>> {
        let part1 = parse_slice_header_part1(c, &header)?;

        let pps_id = u32::from(part1.pic_parameter_set_id);
        let pps = self
            .headers
            .pps
            .get_shared(pps_id)
            .ok_or_else(|| invalid_stream!("Slice refers to unknown PPS {}", pps_id))?;

        let sps_id = u32::from(pps.seq_parameter_set_id);
        let sps = self
            .headers
            .sps
            .get_shared(sps_id)
            .ok_or_else(|| invalid_stream!("PPS {} refers to unknown SPS {}", pps_id, sps_id))?;

        self.headers.pps.set_current(pps_id)?;
        self.headers.sps.set_current(sps_id)?;

        let slice = decode_slice(
            c,
            header,
            part1,
            sps,
            pps,
            &self.poc,
            self.last_independent.as_ref(),
        )?;
        c.check_bs_left()?;

        if !slice.header.dependent_slice_segment_flag {
            self.poc.update(&slice);
            self.last_independent = Some(Arc::clone(&slice.shared));
        }

        log::debug!(
            "Parsed {:?} slice segment at {} of POC {}",
            slice.shared.slice_type,
            slice.header.segment_address,
            slice.shared.pic_order_cnt
        );

        Ok(Box::new(slice))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bitstream_utils::BitWriter;

    /// Inserts emulation prevention bytes into an RBSP.
    pub(crate) fn escape(rbsp: &[u8]) -> Vec<u8> {
        let mut escaped = Vec::new();
        let mut zeros = 0;
        for &b in rbsp {
            if zeros >= 2 && b <= 3 {
                escaped.push(3);
                zeros = 0;
            }
            zeros = if b == 0 { zeros + 1 } else { 0 };
            escaped.push(b);
        }
        escaped
    }

    /// Writes the NAL header of a `type_` NAL, temporal id 0.
    pub(crate) fn write_nalu_header(w: &mut BitWriter<&mut Vec<u8>>, type_: NaluType) {
        w.write_f(1, 0u32).unwrap();
        w.write_f(6, type_ as u32).unwrap();
        w.write_f(6, 0u32).unwrap();
        w.write_f(3, 1u32).unwrap();
    }

    /// A Main profile, level 4.1 `profile_tier_level()` for a single sub-layer.
    pub(crate) fn write_ptl(w: &mut BitWriter<&mut Vec<u8>>) {
        w.write_f(2, 0u32).unwrap(); // profile_space
        w.write_f(1, 0u32).unwrap(); // tier
        w.write_f(5, 1u32).unwrap(); // profile_idc
        w.write_f(32, 0x6000_0000u32).unwrap(); // compatibility flags 1 and 2
        w.write_f(4, 0b1001u32).unwrap(); // progressive, frame only
        w.write_f(32, 0u32).unwrap();
        w.write_f(12, 0u32).unwrap();
        w.write_f(8, 123u32).unwrap(); // level 4.1
    }

    #[derive(Clone)]
    pub(crate) struct SpsSyntax {
        pub id: u32,
        pub width: u32,
        pub height: u32,
        pub log2_max_poc_lsb_minus4: u32,
        pub max_dec_pic_buffering_minus1: u32,
        pub short_term_rps: Vec<Vec<(i32, bool)>>,
        pub long_term_lsbs: Vec<(u32, bool)>,
        pub temporal_mvp: bool,
        pub sao: bool,
    }

    impl Default for SpsSyntax {
        fn default() -> Self {
            Self {
                id: 0,
                width: 416,
                height: 240,
                log2_max_poc_lsb_minus4: 4,
                max_dec_pic_buffering_minus1: 4,
                short_term_rps: vec![vec![(-1, true), (-2, true)]],
                long_term_lsbs: vec![],
                temporal_mvp: false,
                sao: false,
            }
        }
    }

    /// Writes an explicitly coded `st_ref_pic_set()`. Negative entries must
    /// come closest first.
    pub(crate) fn write_st_rps(
        w: &mut BitWriter<&mut Vec<u8>>,
        idx: usize,
        entries: &[(i32, bool)],
    ) {
        if idx != 0 {
            w.write_f(1, 0u32).unwrap(); // inter_ref_pic_set_prediction_flag
        }

        let negatives: Vec<_> = entries.iter().filter(|(d, _)| *d < 0).collect();
        let positives: Vec<_> = entries.iter().filter(|(d, _)| *d > 0).collect();
        w.write_ue(negatives.len() as u32).unwrap();
        w.write_ue(positives.len() as u32).unwrap();

        let mut prev = 0;
        for (delta, used) in negatives {
            w.write_ue((prev - delta - 1) as u32).unwrap();
            w.write_f(1, *used).unwrap();
            prev = *delta;
        }

        let mut prev = 0;
        for (delta, used) in positives {
            w.write_ue((delta - prev - 1) as u32).unwrap();
            w.write_f(1, *used).unwrap();
            prev = *delta;
        }
    }

    /// 4:2:0 8 bit SPS with 64x64 CTBs.
    pub(crate) fn write_sps(syntax: &SpsSyntax) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            write_nalu_header(&mut w, NaluType::SpsNut);
            w.write_f(4, 0u32).unwrap(); // vps id
            w.write_f(3, 0u32).unwrap(); // max_sub_layers_minus1
            w.write_f(1, 1u32).unwrap(); // temporal_id_nesting
            write_ptl(&mut w);
            w.write_ue(syntax.id).unwrap();
            w.write_ue(1).unwrap(); // chroma_format_idc
            w.write_ue(syntax.width).unwrap();
            w.write_ue(syntax.height).unwrap();
            w.write_f(1, 0u32).unwrap(); // conformance_window_flag
            w.write_ue(0).unwrap(); // bit_depth_luma_minus8
            w.write_ue(0).unwrap(); // bit_depth_chroma_minus8
            w.write_ue(syntax.log2_max_poc_lsb_minus4).unwrap();
            w.write_f(1, 1u32).unwrap(); // sub_layer_ordering_info_present
            w.write_ue(syntax.max_dec_pic_buffering_minus1).unwrap();
            w.write_ue(0).unwrap(); // max_num_reorder_pics
            w.write_ue(0).unwrap(); // max_latency_increase_plus1
            w.write_ue(0).unwrap(); // log2_min_luma_coding_block_size_minus3
            w.write_ue(3).unwrap(); // log2_diff_max_min_luma_coding_block_size
            w.write_ue(0).unwrap(); // log2_min_luma_transform_block_size_minus2
            w.write_ue(3).unwrap(); // log2_diff_max_min_luma_transform_block_size
            w.write_ue(1).unwrap(); // max_transform_hierarchy_depth_inter
            w.write_ue(1).unwrap(); // max_transform_hierarchy_depth_intra
            w.write_f(1, 0u32).unwrap(); // scaling_list_enabled_flag
            w.write_f(1, 1u32).unwrap(); // amp_enabled_flag
            w.write_f(1, syntax.sao).unwrap();
            w.write_f(1, 0u32).unwrap(); // pcm_enabled_flag
            w.write_ue(syntax.short_term_rps.len() as u32).unwrap();
            for (i, entries) in syntax.short_term_rps.iter().enumerate() {
                write_st_rps(&mut w, i, entries);
            }
            w.write_f(1, !syntax.long_term_lsbs.is_empty()).unwrap();
            if !syntax.long_term_lsbs.is_empty() {
                w.write_ue(syntax.long_term_lsbs.len() as u32).unwrap();
                for (lsb, used) in &syntax.long_term_lsbs {
                    w.write_f(syntax.log2_max_poc_lsb_minus4 as usize + 4, *lsb)
                        .unwrap();
                    w.write_f(1, *used).unwrap();
                }
            }
            w.write_f(1, syntax.temporal_mvp).unwrap();
            w.write_f(1, 1u32).unwrap(); // strong_intra_smoothing
            w.write_f(1, 0u32).unwrap(); // vui_parameters_present_flag
            w.write_f(1, 0u32).unwrap(); // sps_extension_present_flag
            w.write_trailing_bits().unwrap();
        }
        buf
    }

    #[derive(Clone)]
    pub(crate) struct PpsSyntax {
        pub id: u32,
        pub sps_id: u32,
        pub dependent_slices: bool,
        pub output_flag_present: bool,
        pub num_extra_bits: u32,
        pub cabac_init_present: bool,
        pub weighted_pred: bool,
        pub tiles: Option<(u32, u32)>,
        pub entropy_sync: bool,
        pub lists_modification: bool,
        pub deblocking_override: bool,
    }

    impl Default for PpsSyntax {
        fn default() -> Self {
            Self {
                id: 0,
                sps_id: 0,
                dependent_slices: false,
                output_flag_present: false,
                num_extra_bits: 0,
                cabac_init_present: false,
                weighted_pred: false,
                tiles: None,
                entropy_sync: false,
                lists_modification: false,
                deblocking_override: false,
            }
        }
    }

    pub(crate) fn write_pps(syntax: &PpsSyntax) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            write_nalu_header(&mut w, NaluType::PpsNut);
            w.write_ue(syntax.id).unwrap();
            w.write_ue(syntax.sps_id).unwrap();
            w.write_f(1, syntax.dependent_slices).unwrap();
            w.write_f(1, syntax.output_flag_present).unwrap();
            w.write_f(3, syntax.num_extra_bits).unwrap();
            w.write_f(1, 0u32).unwrap(); // sign_data_hiding
            w.write_f(1, syntax.cabac_init_present).unwrap();
            w.write_ue(0).unwrap(); // num_ref_idx_l0_default_active_minus1
            w.write_ue(0).unwrap(); // num_ref_idx_l1_default_active_minus1
            w.write_se(0).unwrap(); // init_qp_minus26
            w.write_f(1, 0u32).unwrap(); // constrained_intra_pred
            w.write_f(1, 0u32).unwrap(); // transform_skip
            w.write_f(1, 0u32).unwrap(); // cu_qp_delta_enabled
            w.write_se(0).unwrap(); // cb_qp_offset
            w.write_se(0).unwrap(); // cr_qp_offset
            w.write_f(1, 0u32).unwrap(); // slice_chroma_qp_offsets_present
            w.write_f(1, syntax.weighted_pred).unwrap();
            w.write_f(1, 0u32).unwrap(); // weighted_bipred
            w.write_f(1, 0u32).unwrap(); // transquant_bypass
            w.write_f(1, syntax.tiles.is_some()).unwrap();
            w.write_f(1, syntax.entropy_sync).unwrap();
            if let Some((cols, rows)) = syntax.tiles {
                w.write_ue(cols - 1).unwrap();
                w.write_ue(rows - 1).unwrap();
                w.write_f(1, 1u32).unwrap(); // uniform_spacing
                w.write_f(1, 1u32).unwrap(); // loop_filter_across_tiles
            }
            w.write_f(1, 1u32).unwrap(); // loop_filter_across_slices
            w.write_f(1, syntax.deblocking_override).unwrap(); // deblocking_control_present
            if syntax.deblocking_override {
                w.write_f(1, 1u32).unwrap(); // override_enabled
                w.write_f(1, 0u32).unwrap(); // pps_deblocking_filter_disabled
                w.write_se(1).unwrap(); // beta_offset_div2
                w.write_se(-1).unwrap(); // tc_offset_div2
            }
            w.write_f(1, 0u32).unwrap(); // scaling_list_data_present
            w.write_f(1, syntax.lists_modification).unwrap();
            w.write_ue(0).unwrap(); // log2_parallel_merge_level_minus2
            w.write_f(1, 0u32).unwrap(); // slice_segment_header_extension_present
            w.write_f(1, 0u32).unwrap(); // pps_extension_present
            w.write_trailing_bits().unwrap();
        }
        buf
    }

    fn write_vps() -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            write_nalu_header(&mut w, NaluType::VpsNut);
            w.write_f(4, 2u32).unwrap(); // vps id
            w.write_f(2, 3u32).unwrap(); // base layer flags
            w.write_f(6, 0u32).unwrap(); // max_layers_minus1
            w.write_f(3, 1u32).unwrap(); // max_sub_layers_minus1
            w.write_f(1, 0u32).unwrap(); // temporal_id_nesting
            w.write_f(16, 0xffffu32).unwrap();
            write_ptl_two_sub_layers(&mut w);
            w.write_f(1, 1u32).unwrap(); // sub_layer_ordering_info_present
            for (dec, reorder) in [(2, 1), (4, 2)] {
                w.write_ue(dec).unwrap();
                w.write_ue(reorder).unwrap();
                w.write_ue(0).unwrap();
            }
            w.write_f(6, 0u32).unwrap(); // max_layer_id
            w.write_ue(0).unwrap(); // num_layer_sets_minus1
            w.write_f(1, 1u32).unwrap(); // timing_info_present
            w.write_f(32, 1001u32).unwrap();
            w.write_f(32, 60000u32).unwrap();
            w.write_f(1, 0u32).unwrap(); // poc_proportional_to_timing
            w.write_ue(1).unwrap(); // num_hrd_parameters
            w.write_ue(0).unwrap(); // hrd_layer_set_idx
            // hrd_parameters(1, 1)
            w.write_f(1, 1u32).unwrap(); // nal_hrd
            w.write_f(1, 0u32).unwrap(); // vcl_hrd
            w.write_f(1, 0u32).unwrap(); // sub_pic_hrd_params_present
            w.write_f(4, 2u32).unwrap(); // bit_rate_scale
            w.write_f(4, 3u32).unwrap(); // cpb_size_scale
            w.write_f(5, 20u32).unwrap();
            w.write_f(5, 21u32).unwrap();
            w.write_f(5, 22u32).unwrap();
            for _ in 0..2 {
                w.write_f(1, 1u32).unwrap(); // fixed_pic_rate_general
                w.write_ue(0).unwrap(); // elemental_duration_in_tc_minus1
                w.write_ue(1).unwrap(); // cpb_cnt_minus1
                for cpb in 0..2 {
                    w.write_ue(1000 + cpb).unwrap();
                    w.write_ue(2000 + cpb).unwrap();
                    w.write_f(1, cpb == 1).unwrap();
                }
            }
            w.write_f(1, 0u32).unwrap(); // vps_extension_flag
            w.write_trailing_bits().unwrap();
        }
        buf
    }

    fn write_ptl_two_sub_layers(w: &mut BitWriter<&mut Vec<u8>>) {
        w.write_f(2, 0u32).unwrap();
        w.write_f(1, 1u32).unwrap(); // high tier
        w.write_f(5, 2u32).unwrap(); // Main 10
        w.write_f(32, 0x2000_0000u32).unwrap();
        w.write_f(4, 0u32).unwrap();
        w.write_f(32, 0u32).unwrap();
        w.write_f(12, 0u32).unwrap();
        w.write_f(8, 150u32).unwrap(); // level 5
        w.write_f(1, 0u32).unwrap(); // sub_layer_profile_present[0]
        w.write_f(1, 1u32).unwrap(); // sub_layer_level_present[0]
        for _ in 1..8 {
            w.write_f(2, 0u32).unwrap();
        }
        w.write_f(8, 120u32).unwrap(); // sub-layer level 4
    }

    #[test]
    fn nal_unit_header() {
        let mut c = BitCursor::new(&[0x40, 0x01]);
        let header = parse_nal_unit_header(&mut c).unwrap();
        assert_eq!(header.type_, NaluType::VpsNut);
        assert_eq!(header.temporal_id(), 0);

        // forbidden_zero_bit
        let mut c = BitCursor::new(&[0xc0, 0x01]);
        assert!(matches!(
            parse_nal_unit_header(&mut c),
            Err(ParseError::InvalidStream(_))
        ));

        // nuh_layer_id 1
        let mut c = BitCursor::new(&[0x40, 0x09]);
        assert!(parse_nal_unit_header(&mut c).is_err());

        // nuh_temporal_id_plus1 0
        let mut c = BitCursor::new(&[0x40, 0x00]);
        assert!(parse_nal_unit_header(&mut c).is_err());

        let mut c = BitCursor::new(&[0x26]);
        assert_eq!(
            parse_nal_unit_header(&mut c),
            Err(ParseError::NotEnoughData)
        );
    }

    #[test]
    fn nalu_type_classes() {
        assert!(NaluType::IdrNLp.is_idr());
        assert!(NaluType::CraNut.is_irap());
        assert!(NaluType::RsvIrapVcl23.is_irap());
        assert!(!NaluType::RsvVcl24.is_irap());
        assert!(NaluType::BlaWRadl.is_bla());
        assert!(NaluType::TrailN.is_slnr());
        assert!(!NaluType::TrailR.is_slnr());
        assert!(NaluType::RaslR.is_slice());
        assert!(!NaluType::RsvVclN10.is_slice());
        assert!(!NaluType::SpsNut.is_slice());
        assert_eq!(NaluType::n(63u32), Some(NaluType::Unspec63));
    }

    #[test]
    fn diagonal_scans() {
        assert_eq!(
            &DIAGONAL_SCAN_4X4[..16],
            &[0, 4, 1, 8, 5, 2, 12, 9, 6, 3, 13, 10, 7, 14, 11, 15]
        );
        assert_eq!(&DIAGONAL_SCAN_8X8[..6], &[0, 8, 1, 16, 9, 2]);
        assert_eq!(DIAGONAL_SCAN_8X8[63], 63);
    }

    #[test]
    fn parse_minimal_sps() {
        let _ = env_logger::builder().is_test(true).try_init();

        let data = write_sps(&SpsSyntax::default());
        let mut c = BitCursor::new(&data);
        parse_nal_unit_header(&mut c).unwrap();
        let sps = parse_sps(&mut c).unwrap();

        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!(sps.chroma_array_type, 1);
        assert_eq!(sps.pic_width_in_luma_samples, 416);
        assert_eq!(sps.pic_height_in_luma_samples, 240);
        assert_eq!(sps.bit_depth_luma, 8);
        assert_eq!(sps.qp_bd_offset_y, 0);
        assert_eq!(sps.log2_max_pic_order_cnt_lsb, 8);
        assert_eq!(sps.max_dec_pic_buffering(), 5);
        assert_eq!(sps.profile(), Some(Profile::Main));
        assert_eq!(sps.profile_tier_level.general.level, 41);

        assert_eq!(sps.max_cu_size, 64);
        assert_eq!(sps.ctb_log2_size_y, 6);
        assert_eq!(sps.add_cu_depth, 1);
        assert_eq!(sps.max_cu_depth, 4);
        assert_eq!(sps.min_cu_size, 4);
        assert_eq!(sps.pic_width_in_ctbs, 7);
        assert_eq!(sps.pic_height_in_ctbs, 4);

        assert_eq!(sps.num_short_term_ref_pic_sets(), 1);
        let rps = &sps.short_term_ref_pic_sets[0];
        assert_eq!(rps.num_negative_pics, 2);
        assert_eq!(rps.num_positive_pics, 0);
        assert_eq!(&rps.delta_poc[..2], &[-1, -2]);
        assert_eq!(&rps.used_by_curr_pic[..2], &[true, true]);

        assert!(!sps.vui_parameters_present_flag);
        assert_eq!(sps.vui_parameters.video_format, 5);
        assert!(sps.vui_parameters.motion_vectors_over_pic_boundaries_flag);
        assert!(!c.more_rbsp_data());
    }

    #[test]
    fn sps_rps_bigger_than_dpb() {
        let data = write_sps(&SpsSyntax {
            max_dec_pic_buffering_minus1: 0,
            ..Default::default()
        });
        let mut c = BitCursor::new(&data);
        parse_nal_unit_header(&mut c).unwrap();
        assert!(matches!(
            parse_sps(&mut c),
            Err(ParseError::InvalidStream(_))
        ));
    }

    #[test]
    fn sps_size_not_multiple_of_min_cb() {
        let data = write_sps(&SpsSyntax {
            width: 418,
            ..Default::default()
        });
        let mut c = BitCursor::new(&data);
        parse_nal_unit_header(&mut c).unwrap();
        assert!(parse_sps(&mut c).is_err());
    }

    #[test]
    fn sps_size_is_bounded() {
        let data = write_sps(&SpsSyntax {
            width: 1 << 22,
            height: 1 << 22,
            ..Default::default()
        });
        let mut c = BitCursor::new(&data);
        parse_nal_unit_header(&mut c).unwrap();
        assert!(matches!(parse_sps(&mut c), Err(ParseError::InvalidStream(_))));

        let data = write_sps(&SpsSyntax {
            width: MAX_PIC_DIMENSION,
            height: MAX_PIC_DIMENSION,
            ..Default::default()
        });
        let mut c = BitCursor::new(&data);
        parse_nal_unit_header(&mut c).unwrap();
        let sps = parse_sps(&mut c).unwrap();
        // 16888 luma samples make 264 CTBs of 64.
        assert_eq!(sps.pic_size_in_ctbs(), 264 * 264);
    }

    #[test]
    fn ctb_counts_saturate() {
        let sps = Sps {
            pic_width_in_ctbs: 1 << 20,
            pic_height_in_ctbs: 1 << 20,
            ..Default::default()
        };
        assert_eq!(sps.pic_size_in_ctbs(), u32::MAX);

        let sizes = uniform_tile_sizes(u32::MAX, 3);
        let total: u64 = sizes.iter().map(|&size| u64::from(size)).sum();
        assert_eq!(total, u64::from(u32::MAX));
    }

    #[test]
    fn truncated_sps() {
        let data = write_sps(&SpsSyntax::default());
        let mut c = BitCursor::new(&data[..12]);
        parse_nal_unit_header(&mut c).unwrap();
        assert_eq!(parse_sps(&mut c), Err(ParseError::NotEnoughData));
    }

    #[test]
    fn parse_vps_with_hrd() {
        let data = write_vps();
        let mut c = BitCursor::new(&data);
        parse_nal_unit_header(&mut c).unwrap();
        let vps = parse_vps(&mut c).unwrap();

        assert_eq!(vps.video_parameter_set_id, 2);
        assert_eq!(vps.max_sub_layers_minus1, 1);
        let ptl = &vps.profile_tier_level;
        assert!(ptl.general.tier_flag);
        assert_eq!(ptl.general.profile(), Some(Profile::Main10));
        assert_eq!(ptl.general.level, 50);
        assert!(ptl.sub_layer_level_present_flag[0]);
        assert_eq!(ptl.sub_layers[0].level, 40);

        assert_eq!(&vps.ordering.max_dec_pic_buffering[..2], &[3, 5]);
        assert_eq!(&vps.ordering.max_num_reorder_pics[..2], &[1, 2]);

        assert_eq!(vps.num_units_in_tick, 1001);
        assert_eq!(vps.time_scale, 60000);
        assert_eq!(vps.num_hrd_parameters, 1);
        assert_eq!(vps.cprms_present_flag, vec![true]);

        let hrd = &vps.hrd_parameters[0];
        assert!(hrd.nal_hrd_parameters_present_flag);
        assert_eq!(hrd.initial_cpb_removal_delay_length_minus1, 20);
        assert_eq!(hrd.dpb_output_delay_length_minus1, 22);
        assert!(hrd.fixed_pic_rate_within_cvs_flag[1]);
        assert_eq!(hrd.cpb_cnt_minus1[1], 1);
        assert_eq!(hrd.nal_hrd[1].bit_rate_value_minus1[..2], [1000, 1001]);
        assert_eq!(hrd.nal_hrd[1].cpb_size_value_minus1[..2], [2000, 2001]);
        assert_eq!(hrd.nal_hrd[1].cbr_flag[..2], [false, true]);
        assert!(!vps.extension_flag);
    }

    #[test]
    fn hrd_defaults() {
        let hrd = HrdParams::default();
        assert_eq!(hrd.initial_cpb_removal_delay_length_minus1 + 1, 24);
        assert_eq!(hrd.au_cpb_removal_delay_length_minus1 + 1, 24);
        assert_eq!(hrd.dpb_output_delay_length_minus1 + 1, 24);
    }

    #[test]
    fn profile_inference() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(2, 0u32).unwrap();
            w.write_f(1, 0u32).unwrap();
            w.write_f(5, 0u32).unwrap(); // profile_idc 0
            w.write_f(32, 0x1000_0000u32).unwrap(); // compatible with 3
            w.write_f(4, 0u32).unwrap();
            w.write_f(32, 0u32).unwrap();
            w.write_f(12, 0u32).unwrap();
            w.write_f(8, 93u32).unwrap();
        }

        let mut c = BitCursor::new(&buf);
        let ptl = parse_profile_tier_level(&mut c, 0).unwrap();
        assert_eq!(ptl.general.profile(), Some(Profile::MainStillPicture));
        assert_eq!(ptl.general.level, 31);

        buf.clear();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(2, 0u32).unwrap();
            w.write_f(1, 0u32).unwrap();
            w.write_f(5, 7u32).unwrap(); // Scalable Main
            w.write_f(32, 0u32).unwrap();
            w.write_f(32, 0u32).unwrap();
            w.write_f(24, 0u32).unwrap();
        }
        let mut c = BitCursor::new(&buf);
        assert!(parse_profile_tier_level(&mut c, 0).is_err());
    }

    #[test]
    fn scaling_list_defaults_and_prediction() {
        let defaults = ScalingList::default();
        assert!(defaults.lists[0][0][..16].iter().all(|&c| c == 16));
        // Last coefficient of the intra and inter 8x8 tables.
        assert_eq!(defaults.lists[1][0][63], 115);
        assert_eq!(defaults.lists[1][3][63], 91);
        assert_eq!(defaults.lists[3][0][63], 115);
        assert_eq!(defaults.lists[3][1][63], 91);
        // Second scan position lands on the second row.
        assert_eq!(defaults.lists[1][0][8], 16);

        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            for size_id in 0..4 {
                for list_id in 0..SCALING_LIST_NUM[size_id] {
                    if size_id == 0 && list_id == 0 {
                        // Explicit flat 4x4 list of 20.
                        w.write_f(1, 1u32).unwrap();
                        w.write_se(12).unwrap();
                        for _ in 1..16 {
                            w.write_se(0).unwrap();
                        }
                    } else if size_id == 0 && list_id == 1 {
                        // Copy of list 0.
                        w.write_f(1, 0u32).unwrap();
                        w.write_ue(1).unwrap();
                    } else if size_id == 2 && list_id == 0 {
                        // Explicit list with a DC of 30, then 10s.
                        w.write_f(1, 1u32).unwrap();
                        w.write_se(22).unwrap();
                        w.write_se(-20).unwrap();
                        for _ in 1..64 {
                            w.write_se(0).unwrap();
                        }
                    } else {
                        w.write_f(1, 0u32).unwrap();
                        w.write_ue(0).unwrap();
                    }
                }
            }
            w.write_trailing_bits().unwrap();
        }

        let mut c = BitCursor::new(&buf);
        let sl = parse_scaling_list_data(&mut c).unwrap();
        assert!(sl.lists[0][0][..16].iter().all(|&c| c == 20));
        assert_eq!(sl.lists[0][1], sl.lists[0][0]);
        assert!(sl.lists[0][2][..16].iter().all(|&c| c == 16));
        assert_eq!(sl.dc_coef[2][0], 30);
        assert!(sl.lists[2][0].iter().all(|&c| c == 10));
        assert_eq!(sl.dc_coef[2][1], 16);
        assert_eq!(sl.lists[2][1], defaults.lists[2][1]);
    }

    #[test]
    fn parse_pps_with_tiles() {
        let sps_data = write_sps(&SpsSyntax::default());
        let mut c = BitCursor::new(&sps_data);
        parse_nal_unit_header(&mut c).unwrap();
        let sps = parse_sps(&mut c).unwrap();

        let pps_data = write_pps(&PpsSyntax {
            id: 3,
            tiles: Some((3, 2)),
            deblocking_override: true,
            ..Default::default()
        });
        let mut c = BitCursor::new(&pps_data);
        parse_nal_unit_header(&mut c).unwrap();
        let mut pps = parse_pps_part1(&mut c).unwrap();
        assert_eq!(pps.pic_parameter_set_id, 3);
        assert_eq!(pps.seq_parameter_set_id, 0);

        parse_pps_part2(&mut c, &mut pps, &sps).unwrap();
        assert_eq!(pps.init_qp, 26);
        assert_eq!(pps.num_ref_idx_l0_default_active, 1);
        assert_eq!(pps.num_tile_columns, 3);
        assert_eq!(pps.num_tile_rows, 2);
        // 7x4 CTBs.
        assert_eq!(pps.column_widths, vec![2, 2, 3]);
        assert_eq!(pps.row_heights, vec![2, 2]);
        assert!(pps.deblocking_filter_override_enabled_flag);
        assert_eq!(pps.beta_offset, 2);
        assert_eq!(pps.tc_offset, -2);
        assert_eq!(pps.log2_parallel_merge_level, 2);
    }

    #[test]
    fn pps_with_single_tile_is_rejected() {
        let sps_data = write_sps(&SpsSyntax::default());
        let mut c = BitCursor::new(&sps_data);
        parse_nal_unit_header(&mut c).unwrap();
        let sps = parse_sps(&mut c).unwrap();

        let pps_data = write_pps(&PpsSyntax {
            tiles: Some((1, 1)),
            ..Default::default()
        });
        let mut c = BitCursor::new(&pps_data);
        parse_nal_unit_header(&mut c).unwrap();
        let mut pps = parse_pps_part1(&mut c).unwrap();
        assert!(parse_pps_part2(&mut c, &mut pps, &sps).is_err());
    }

    #[test]
    fn explicit_tile_sizes_must_fit() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_ue(3).unwrap(); // 4 CTBs
            w.write_ue(2).unwrap(); // 3 CTBs
            w.write_trailing_bits().unwrap();
        }

        let mut c = BitCursor::new(&buf);
        assert!(explicit_tile_sizes(&mut c, 7, 3).is_err());

        let mut c = BitCursor::new(&buf);
        assert!(explicit_tile_sizes(&mut c, 8, 3).is_ok_and(|sizes| sizes == [4, 3, 1]));
    }

    #[test]
    fn parser_front_end() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut parser = Parser::default();
        assert!(matches!(
            parser.parse_nalu(&write_vps()),
            Ok(ParsedNalu::Vps(_))
        ));

        // A PPS cannot be parsed before its SPS.
        let pps = write_pps(&PpsSyntax::default());
        assert!(matches!(
            parser.parse_nalu(&pps),
            Err(ParseError::InvalidStream(_))
        ));

        let sps = match parser.parse_nalu(&write_sps(&SpsSyntax::default())) {
            Ok(ParsedNalu::Sps(sps)) => sps,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(sps.max_cu_size, 64);
        assert!(matches!(parser.parse_nalu(&pps), Ok(ParsedNalu::Pps(_))));

        assert_eq!(parser.headers().vps.current_id(), Some(2));
        assert_eq!(parser.headers().sps.len(), 1);
        assert_eq!(parser.headers().pps.len(), 1);

        // Access unit delimiter.
        assert!(matches!(
            parser.parse_nalu(&[0x46, 0x01, 0x50]),
            Ok(ParsedNalu::Other(NaluHeader {
                type_: NaluType::AudNut,
                ..
            }))
        ));

        // The scratch RBSP buffers went back to the pool.
        assert!(parser.pool().free_len() > 0);

        parser.reset(false);
        assert!(parser.headers().sps.is_empty());
    }

    #[test]
    fn parser_strips_emulation_prevention() {
        let mut parser = Parser::default();
        let nalu = write_sps(&SpsSyntax {
            width: 64,
            height: 64,
            short_term_rps: vec![vec![(-1, false)], vec![(-1, false), (-2, false)]],
            ..Default::default()
        });

        match parser.parse_nalu(&escape(&nalu)) {
            Ok(ParsedNalu::Sps(sps)) => {
                assert_eq!(sps.pic_width_in_luma_samples, 64);
                assert_eq!(sps.short_term_ref_pic_sets[1].num_negative_pics, 2);
                assert!(!sps.short_term_ref_pic_sets[1].used_by_curr_pic[1]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
