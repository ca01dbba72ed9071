// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture sets: parsing (7.3.7, 7.4.8), long-term POC derivation
//! and reference picture list construction (8.3.2, 8.3.4).

use crate::codec::h265::bit_cursor::BitCursor;
use crate::codec::h265::dpb::FrameError;
use crate::codec::h265::dpb::FrameErrorSink;
use crate::codec::h265::dpb::ReferenceLookup;
use crate::codec::h265::error::invalid_stream;
use crate::codec::h265::error::Result;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::MAX_NUM_REF_PICS;
use crate::codec::h265::slice::ceil_log2;
use crate::codec::h265::slice::RefPicListModification;
use crate::codec::h265::slice::Slice;
use crate::codec::h265::slice::SliceType;

/// A short-term reference picture set, `st_ref_pic_set()`.
///
/// Entries `0..num_negative_pics` hold the pictures preceding the current one,
/// closest first, followed by `num_positive_pics` following pictures, closest
/// first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    pub inter_ref_pic_set_prediction_flag: bool,
    pub num_negative_pics: u32,
    pub num_positive_pics: u32,
    pub delta_poc: [i32; MAX_NUM_REF_PICS],
    pub used_by_curr_pic: [bool; MAX_NUM_REF_PICS],
}

impl ShortTermRefPicSet {
    pub fn num_pics(&self) -> usize {
        (self.num_negative_pics + self.num_positive_pics) as usize
    }

    /// Number of entries used by the current picture.
    pub fn num_used(&self) -> usize {
        self.used_by_curr_pic[..self.num_pics()]
            .iter()
            .filter(|&&used| used)
            .count()
    }

    /// The `(delta_poc, used)` pairs of the pictures preceding the current
    /// one.
    pub fn negatives(&self) -> impl Iterator<Item = (i32, bool)> + '_ {
        let n = self.num_negative_pics as usize;
        self.delta_poc[..n]
            .iter()
            .copied()
            .zip(self.used_by_curr_pic[..n].iter().copied())
    }

    /// The `(delta_poc, used)` pairs of the pictures following the current
    /// one.
    pub fn positives(&self) -> impl Iterator<Item = (i32, bool)> + '_ {
        let range = self.num_negative_pics as usize..self.num_pics();
        self.delta_poc[range.clone()]
            .iter()
            .copied()
            .zip(self.used_by_curr_pic[range].iter().copied())
    }
}

/// Orders the entries of a predicted RPS: ascending delta POC, then the
/// negative half reversed so that both halves start with the picture closest
/// to the current one.
pub fn sort_delta_poc(rps: &mut ShortTermRefPicSet) {
    let num_pics = rps.num_pics();
    let num_negative = rps.num_negative_pics as usize;

    let mut entries = [(0i32, false); MAX_NUM_REF_PICS];
    for (entry, (&delta, &used)) in entries
        .iter_mut()
        .zip(rps.delta_poc.iter().zip(rps.used_by_curr_pic.iter()))
        .take(num_pics)
    {
        *entry = (delta, used);
    }

    // Stable, so equal deltas keep their signalled order.
    entries[..num_pics].sort_by_key(|&(delta, _)| delta);
    entries[..num_negative].reverse();

    for (i, (delta, used)) in entries[..num_pics].iter().copied().enumerate() {
        rps.delta_poc[i] = delta;
        rps.used_by_curr_pic[i] = used;
    }
}

/// Parses `st_ref_pic_set(idx)`. `sets` holds the sets already parsed from
/// the SPS, of which there are `num_sets` in total. `idx == num_sets` for the
/// set coded in a slice header.
pub fn parse_short_term_ref_pic_set(
    c: &mut BitCursor,
    sets: &[ShortTermRefPicSet],
    idx: usize,
    num_sets: usize,
) -> Result<ShortTermRefPicSet> {
    let mut rps = ShortTermRefPicSet::default();

    if idx != 0 {
        rps.inter_ref_pic_set_prediction_flag = c.read_flag()?;
    }

    if rps.inter_ref_pic_set_prediction_flag {
        let delta_idx_minus1 = if idx == num_sets {
            c.read_ue_max(idx as u32 - 1)? as usize
        } else {
            0
        };

        let ref_rps = sets
            .get(idx - 1 - delta_idx_minus1)
            .ok_or_else(|| invalid_stream!("Missing reference RPS for RPS {}", idx))?;

        let delta_rps_sign = c.read_flag()?;
        let abs_delta_rps_minus1 = c.read_ue_max((1 << 15) - 1)?;
        let magnitude = abs_delta_rps_minus1 as i32 + 1;
        let delta_rps = if delta_rps_sign { -magnitude } else { magnitude };

        let mut k = 0;
        for j in 0..=ref_rps.num_pics() {
            let used_by_curr_pic_flag = c.read_flag()?;
            let use_delta_flag = if !used_by_curr_pic_flag {
                c.read_flag()?
            } else {
                true
            };

            if !use_delta_flag {
                continue;
            }

            if k >= MAX_NUM_REF_PICS {
                return Err(invalid_stream!("Predicted RPS {} has too many pictures", idx));
            }

            // The extra iteration stands for the reference picture itself.
            let ref_delta = if j < ref_rps.num_pics() {
                ref_rps.delta_poc[j]
            } else {
                0
            };

            let delta_poc = delta_rps + ref_delta;
            rps.delta_poc[k] = delta_poc;
            rps.used_by_curr_pic[k] = used_by_curr_pic_flag;
            if delta_poc < 0 {
                rps.num_negative_pics += 1;
            } else {
                rps.num_positive_pics += 1;
            }
            k += 1;
        }

        sort_delta_poc(&mut rps);
    } else {
        let max = MAX_NUM_REF_PICS as u32 - 1;
        rps.num_negative_pics = c.read_ue_max(max)?;
        rps.num_positive_pics = c.read_ue_max(max)?;
        if rps.num_pics() > max as usize {
            return Err(invalid_stream!(
                "RPS {} has {} pictures",
                idx,
                rps.num_pics()
            ));
        }

        let mut prev = 0i32;
        for i in 0..rps.num_negative_pics as usize {
            let delta_poc_s0_minus1 = c.read_ue_max(1 << 15)? as i32;
            prev -= delta_poc_s0_minus1 + 1;
            rps.delta_poc[i] = prev;
            rps.used_by_curr_pic[i] = c.read_flag()?;
        }

        prev = 0;
        for i in rps.num_negative_pics as usize..rps.num_pics() {
            let delta_poc_s1_minus1 = c.read_ue_max(1 << 15)? as i32;
            prev += delta_poc_s1_minus1 + 1;
            rps.delta_poc[i] = prev;
            rps.used_by_curr_pic[i] = c.read_flag()?;
        }
    }

    Ok(rps)
}

/// A long-term reference picture signalled in a slice header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LongTermRefPic {
    /// PocLsbLt.
    pub poc_lsb_lt: i32,
    /// UsedByCurrPicLt.
    pub used_by_curr_pic: bool,
    pub delta_poc_msb_present_flag: bool,
    pub delta_poc_msb_cycle_lt: u32,
    /// The POC of the picture, or only its LSBs when no MSB cycle was
    /// signalled.
    pub poc: i32,
    /// `poc` relative to the current picture.
    pub delta_poc: i32,
}

/// The reference picture set of a slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferencePictureSet {
    pub short_term: ShortTermRefPicSet,
    /// Number of long-term pictures taken from the SPS candidates.
    pub num_long_term_sps: u32,
    /// Number of long-term pictures signalled in the slice header.
    pub num_long_term_pics: u32,
    pub long_term: [LongTermRefPic; MAX_NUM_REF_PICS],
}

impl ReferencePictureSet {
    pub fn num_long_term(&self) -> usize {
        (self.num_long_term_sps + self.num_long_term_pics) as usize
    }

    pub fn long_terms(&self) -> &[LongTermRefPic] {
        &self.long_term[..self.num_long_term()]
    }

    pub fn num_pics(&self) -> usize {
        self.short_term.num_pics() + self.num_long_term()
    }

    /// Number of pictures, short and long-term, used by the current picture.
    pub fn num_used(&self) -> usize {
        self.short_term.num_used() + self.long_terms().iter().filter(|lt| lt.used_by_curr_pic).count()
    }

    pub fn clear(&mut self) {
        *self = Default::default();
    }
}

/// Parses the long-term part of a slice header RPS into `rps`, whose
/// short-term part is already known.
pub fn parse_long_term_ref_pics(
    c: &mut BitCursor,
    rps: &mut ReferencePictureSet,
    sps: &Sps,
) -> Result<()> {
    let max_dec_pic_buffering = sps.max_dec_pic_buffering() as usize;

    if sps.num_long_term_ref_pics_sps > 0 {
        rps.num_long_term_sps = c.read_ue_max(sps.num_long_term_ref_pics_sps)?;
    }

    rps.num_long_term_pics = c.read_ue_max(max_dec_pic_buffering as u32)?;
    if rps.short_term.num_pics() + rps.num_long_term() > max_dec_pic_buffering {
        return Err(invalid_stream!(
            "RPS with {} pictures does not fit a DPB of {}",
            rps.short_term.num_pics() + rps.num_long_term(),
            max_dec_pic_buffering
        ));
    }

    let lt_idx_sps_bits = ceil_log2(sps.num_long_term_ref_pics_sps as usize);

    for i in 0..rps.num_long_term() {
        let lt = &mut rps.long_term[i];

        if i < rps.num_long_term_sps as usize {
            let lt_idx_sps = if sps.num_long_term_ref_pics_sps > 1 {
                c.read_bits(lt_idx_sps_bits)? as usize
            } else {
                0
            };

            if lt_idx_sps >= sps.num_long_term_ref_pics_sps as usize {
                return Err(invalid_stream!("Invalid lt_idx_sps {}", lt_idx_sps));
            }

            lt.poc_lsb_lt = sps.lt_ref_pic_poc_lsb_sps[lt_idx_sps] as i32;
            lt.used_by_curr_pic = sps.used_by_curr_pic_lt_sps_flag[lt_idx_sps];
        } else {
            lt.poc_lsb_lt = c.read_bits(u32::from(sps.log2_max_pic_order_cnt_lsb))? as i32;
            lt.used_by_curr_pic = c.read_flag()?;
        }

        lt.delta_poc_msb_present_flag = c.read_flag()?;
        if lt.delta_poc_msb_present_flag {
            lt.delta_poc_msb_cycle_lt = c.read_ue()?;
        }
    }

    Ok(())
}

/// Computes the POC of the long-term entries of `rps` for a picture with
/// `pic_order_cnt`, following (7-52) and (8-5).
///
/// DeltaPocMsbCycleLt accumulates over the entries, restarting at the first
/// SPS candidate and at the first explicitly signalled picture.
pub fn derive_long_term_pocs(
    rps: &mut ReferencePictureSet,
    pic_order_cnt: i32,
    slice_pic_order_cnt_lsb: i32,
    max_pic_order_cnt_lsb: i32,
) {
    let num_long_term_sps = rps.num_long_term_sps as usize;
    let mut prev_cycle: i64 = 0;

    for i in 0..rps.num_long_term() {
        let lt = &mut rps.long_term[i];
        let mut cycle = prev_cycle;

        if lt.delta_poc_msb_present_flag {
            cycle = if i == 0 || i == num_long_term_sps {
                i64::from(lt.delta_poc_msb_cycle_lt)
            } else {
                i64::from(lt.delta_poc_msb_cycle_lt) + prev_cycle
            };

            let poc = i64::from(pic_order_cnt) - cycle * i64::from(max_pic_order_cnt_lsb)
                - i64::from(slice_pic_order_cnt_lsb)
                + i64::from(lt.poc_lsb_lt);
            lt.poc = poc as i32;
        } else {
            lt.poc = lt.poc_lsb_lt;
            if i == num_long_term_sps {
                cycle = 0;
            }
        }

        lt.delta_poc = lt.poc.wrapping_sub(pic_order_cnt);
        prev_cycle = cycle;
    }
}

/// Candidate POCs for the reference picture lists of a picture, 8.3.4.
struct RefPocSets {
    st_curr_before: Vec<i32>,
    st_curr_after: Vec<i32>,
    lt_curr: Vec<i32>,
}

fn used_pocs(entries: impl Iterator<Item = (i32, bool)>, pic_order_cnt: i32) -> Vec<i32> {
    entries
        .filter(|&(_, used)| used)
        .map(|(delta, _)| pic_order_cnt + delta)
        .collect()
}

impl RefPocSets {
    fn new(rps: &ReferencePictureSet, pic_order_cnt: i32) -> Self {
        Self {
            st_curr_before: used_pocs(rps.short_term.negatives(), pic_order_cnt),
            st_curr_after: used_pocs(rps.short_term.positives(), pic_order_cnt),
            lt_curr: rps
                .long_terms()
                .iter()
                .filter(|lt| lt.used_by_curr_pic)
                .map(|lt| lt.poc)
                .collect(),
        }
    }
}

/// Builds the POC of each entry of RefPicList0 and RefPicList1. The current
/// picture appears in the lists when it can reference itself.
pub fn ref_poc_lists(
    rps: &ReferencePictureSet,
    pic_order_cnt: i32,
    slice_type: SliceType,
    num_ref_idx: [u32; 2],
    modification: &RefPicListModification,
    curr_pic_ref: bool,
) -> [Vec<i32>; 2] {
    if slice_type.is_i() {
        return Default::default();
    }

    let sets = RefPocSets::new(rps, pic_order_cnt);
    let curr: &[i32] = if curr_pic_ref { &[pic_order_cnt] } else { &[] };

    let temp0: Vec<i32> = [&sets.st_curr_before, &sets.st_curr_after, &sets.lt_curr]
        .into_iter()
        .flatten()
        .chain(curr)
        .copied()
        .collect();
    let temp1: Vec<i32> = [&sets.st_curr_after, &sets.st_curr_before, &sets.lt_curr]
        .into_iter()
        .flatten()
        .chain(curr)
        .copied()
        .collect();

    if temp0.is_empty() {
        return Default::default();
    }

    let build = |temp: &[i32], num: u32, flag: bool, entries: &[u32; MAX_NUM_REF_PICS]| {
        (0..num as usize)
            .map(|i| {
                let idx = if flag {
                    entries[i] as usize
                } else {
                    i % temp.len()
                };
                temp.get(idx).copied().unwrap_or(pic_order_cnt)
            })
            .collect::<Vec<_>>()
    };

    let list0 = build(
        &temp0,
        num_ref_idx[0],
        modification.ref_pic_list_modification_flag_l0,
        &modification.list_entry_l0,
    );

    let list1 = if slice_type.is_b() {
        build(
            &temp1,
            num_ref_idx[1],
            modification.ref_pic_list_modification_flag_l1,
            &modification.list_entry_l1,
        )
    } else {
        vec![]
    };

    [list0, list1]
}

/// One entry of a reference picture list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefPicEntry<F> {
    /// The reference picture, `None` if it could not be found.
    pub frame: Option<F>,
    pub is_long_term: bool,
}

/// The reference picture lists of a slice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefPicLists<F> {
    pub list0: Vec<RefPicEntry<F>>,
    pub list1: Vec<RefPicEntry<F>>,
    /// Number of active entries of each list.
    pub num_ref_idx: [u32; 2],
    /// Whether no reference follows the current picture in output order.
    pub low_delay: bool,
}

impl<F> Default for RefPicLists<F> {
    fn default() -> Self {
        Self {
            list0: vec![],
            list1: vec![],
            num_ref_idx: [0; 2],
            low_delay: false,
        }
    }
}

/// Resolves the reference picture lists of `slice` against the decoded
/// pictures known to `lookup` (8.3.2, 8.3.4).
///
/// Missing references do not fail the slice: they raise
/// [`FrameError::ReferenceMissing`] and [`FrameError::Major`] on `errors`, and
/// when `substitute_missing` is set their entries are filled with the first
/// reference that could be found.
pub fn update_reference_list<L: ReferenceLookup>(
    slice: &Slice,
    lookup: &L,
    current: Option<&L::Frame>,
    errors: &mut dyn FrameErrorSink,
    substitute_missing: bool,
) -> RefPicLists<L::Frame> {
    let shared = &slice.shared;
    let slice_type = shared.slice_type;

    if slice_type.is_i() {
        return Default::default();
    }

    let rps = &shared.rps;
    let pic_order_cnt = shared.pic_order_cnt;

    let mut report_missing = |poc: i32| {
        log::warn!("Missing reference picture with POC {}", poc);
        errors.mark_error(FrameError::ReferenceMissing);
        errors.mark_error(FrameError::Major);
    };

    let pocs = RefPocSets::new(rps, pic_order_cnt);
    let mut find_short_term = |pocs: &[i32]| -> Vec<Option<L::Frame>> {
        pocs.iter()
            .map(|&poc| {
                let frame = lookup.find_short_term_reference(poc);
                if frame.is_none() {
                    report_missing(poc);
                }
                frame
            })
            .collect()
    };

    let st_curr_before = find_short_term(&pocs.st_curr_before);
    let st_curr_after = find_short_term(&pocs.st_curr_after);

    let mut lt_curr = vec![];
    let lsb_bits = u32::from(slice.sps.log2_max_pic_order_cnt_lsb);
    for lt in rps.long_terms().iter().filter(|lt| lt.used_by_curr_pic) {
        let frame = lookup.find_long_term_reference(
            current,
            lt.poc,
            lsb_bits,
            !lt.delta_poc_msb_present_flag,
        );
        if frame.is_none() {
            report_missing(lt.poc);
        }
        lt_curr.push(frame);
    }

    let curr_pic_ref = slice.pps.scc_extension.curr_pic_ref_enabled_flag;
    let curr: Vec<Option<L::Frame>> = if curr_pic_ref {
        vec![current.cloned()]
    } else {
        vec![]
    };

    let num_short_term = st_curr_before.len() + st_curr_after.len();
    let num_pic_total_curr = num_short_term + lt_curr.len() + curr.len();

    if num_pic_total_curr == 0 {
        log::warn!("P/B slice of POC {} without references", pic_order_cnt);
        errors.mark_error(FrameError::ReferenceMissing);
        return Default::default();
    }

    let nalu_type = slice.nalu_header.type_;
    if (nalu_type.is_bla() || nalu_type.is_cra()) && num_pic_total_curr != curr.len() {
        log::warn!(
            "{:?} picture with {} references",
            nalu_type,
            num_pic_total_curr
        );
        errors.mark_error(FrameError::ReferenceMissing);
    }

    let temp0: Vec<Option<L::Frame>> = st_curr_before
        .iter()
        .chain(&st_curr_after)
        .chain(&lt_curr)
        .chain(&curr)
        .cloned()
        .collect();
    let temp1: Vec<Option<L::Frame>> = st_curr_after
        .iter()
        .chain(&st_curr_before)
        .chain(&lt_curr)
        .chain(&curr)
        .cloned()
        .collect();

    let modification = &shared.ref_pic_list_modification;
    let build = |temp: &[Option<L::Frame>], num: u32, flag: bool, entries: &[u32; MAX_NUM_REF_PICS]| {
        (0..num as usize)
            .map(|i| {
                let idx = if flag {
                    entries[i] as usize
                } else {
                    i % num_pic_total_curr
                };

                RefPicEntry {
                    frame: temp.get(idx).cloned().flatten(),
                    is_long_term: idx >= num_short_term,
                }
            })
            .collect::<Vec<_>>()
    };

    let mut num_ref_idx = shared.num_ref_idx;
    let mut list0 = build(
        &temp0,
        num_ref_idx[0],
        modification.ref_pic_list_modification_flag_l0,
        &modification.list_entry_l0,
    );

    let mut list1 = if slice_type.is_p() {
        num_ref_idx[1] = 0;
        vec![]
    } else {
        build(
            &temp1,
            num_ref_idx[1],
            modification.ref_pic_list_modification_flag_l1,
            &modification.list_entry_l1,
        )
    };

    if slice_type.is_b() && num_ref_idx[1] == 0 {
        num_ref_idx[1] = num_ref_idx[0];
        list1 = list0.clone();
    }

    if substitute_missing {
        if let Some(substitute) = temp0.iter().flatten().next() {
            for entry in list0.iter_mut().chain(list1.iter_mut()) {
                if entry.frame.is_none() {
                    log::warn!("Substituting a missing reference");
                    entry.frame = Some(substitute.clone());
                }
            }
        }
    }

    let low_delay = !list0
        .iter()
        .chain(list1.iter())
        .filter_map(|entry| entry.frame.as_ref())
        .any(|frame| lookup.poc_of(frame) > pic_order_cnt);

    log::debug!(
        "Reference lists of POC {}: {} + {} entries, low delay {}",
        pic_order_cnt,
        list0.len(),
        list1.len(),
        low_delay
    );

    RefPicLists {
        list0,
        list1,
        num_ref_idx,
        low_delay,
    }
}
