// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! hevcdump, a small program that parses an Annex B H.265 stream and prints
//! its headers, along with the reference picture lists of every slice as a
//! decoder would build them.

use std::cell::RefCell;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::rc::Rc;

use argh::FromArgs;
use cros_hevc_parser::bitstream_utils::NalIterator;
use cros_hevc_parser::codec::h265::dpb::Dpb;
use cros_hevc_parser::codec::h265::dpb::DpbEntry;
use cros_hevc_parser::codec::h265::dpb::FrameErrors;
use cros_hevc_parser::codec::h265::parser::ParsedNalu;
use cros_hevc_parser::codec::h265::parser::Parser;
use cros_hevc_parser::codec::h265::parser::ParserOptions;
use cros_hevc_parser::codec::h265::picture::PictureData;
use cros_hevc_parser::codec::h265::picture::Reference;
use cros_hevc_parser::codec::h265::rps::update_reference_list;
use cros_hevc_parser::codec::h265::rps::RefPicEntry;
use cros_hevc_parser::codec::h265::slice::Slice;

/// Parses an H.265 stream and dumps its headers.
#[derive(Debug, FromArgs)]
struct Args {
    /// input file
    #[argh(positional)]
    input: PathBuf,

    /// bytes of zero padding the parser may read past each payload
    #[argh(option, default = "0")]
    tail_padding: usize,

    /// maximum number of slots of the header pool
    #[argh(option)]
    pool_capacity: Option<usize>,

    /// leave missing references empty instead of substituting them
    #[argh(switch)]
    no_substitute: bool,

    /// only print errors and the final summary
    #[argh(switch, short = 'q')]
    quiet: bool,
}

// Handle on a decoded picture: its position in decoding order.
type Handle = u64;

#[derive(Default)]
struct Summary {
    nalus: usize,
    pictures: u64,
    slices: usize,
    errors: usize,
    pictures_with_missing_refs: usize,
}

fn format_list(list: &[RefPicEntry<DpbEntry<Handle>>]) -> String {
    let pocs: Vec<String> = list
        .iter()
        .map(|entry| match &entry.frame {
            Some(frame) => {
                let poc = frame.0.borrow().pic_order_cnt_val;
                if entry.is_long_term {
                    format!("{}L", poc)
                } else {
                    poc.to_string()
                }
            }
            None => "-".into(),
        })
        .collect();

    format!("[{}]", pocs.join(", "))
}

/// Marks the pictures of the DPB according to the RPS of `slice`, and drops
/// those that are no longer referenced.
fn mark_references(dpb: &mut Dpb<Handle>, slice: &Slice) {
    if slice.nalu_header.type_.is_idr() {
        dpb.clear();
        return;
    }

    let shared = &slice.shared;
    let rps = &shared.rps;
    let max_lsb = slice.sps.max_pic_order_cnt_lsb();

    for mut pic in dpb.pictures_mut() {
        let poc = pic.pic_order_cnt_val;

        let long_term = rps.long_terms().iter().any(|lt| {
            if lt.delta_poc_msb_present_flag {
                lt.poc == poc
            } else {
                lt.poc == poc & (max_lsb - 1)
            }
        });

        let short_term = rps
            .short_term
            .negatives()
            .chain(rps.short_term.positives())
            .any(|(delta, _)| shared.pic_order_cnt + delta == poc);

        let reference = if long_term {
            Reference::LongTerm
        } else if short_term && !matches!(pic.reference(), Reference::LongTerm) {
            Reference::ShortTerm
        } else {
            Reference::None
        };

        pic.set_reference(reference);
    }

    dpb.remove_unused();
}

fn handle_slice(
    args: &Args,
    dpb: &mut Dpb<Handle>,
    current: &mut Option<DpbEntry<Handle>>,
    summary: &mut Summary,
    slice: &Slice,
) {
    summary.slices += 1;

    if slice.is_first_in_pic() {
        mark_references(dpb, slice);

        if dpb.max_num_pics() != slice.sps.max_dec_pic_buffering() as usize + 1 {
            let mut resized = Dpb::new(slice.sps.max_dec_pic_buffering() as usize + 1);
            for pic in dpb.pictures() {
                let pic = PictureData::clone(&pic);
                let order = pic.decode_order;
                if let Err(e) = resized.store_picture(Rc::new(RefCell::new(pic)), order) {
                    log::warn!("Dropping reference picture: {:#}", e);
                }
            }
            *dpb = resized;
        }

        let picture = PictureData::new_from_slice(slice, summary.pictures);
        match dpb.store_picture(Rc::new(RefCell::new(picture)), summary.pictures) {
            Ok(entry) => *current = Some(entry),
            Err(e) => {
                log::warn!("{:#}", e);
                *current = None;
            }
        }
        summary.pictures += 1;
    }

    // The current picture is in the DPB, but not a reference of itself.
    if let Some(current) = current.as_ref() {
        current.0.borrow_mut().set_reference(Reference::None);
    }

    let mut errors = FrameErrors::default();
    let lists = update_reference_list(
        slice,
        &*dpb,
        current.as_ref(),
        &mut errors,
        !args.no_substitute,
    );

    if let Some(current) = current.as_ref() {
        current.0.borrow_mut().set_reference(Reference::ShortTerm);
    }

    if errors.any() && slice.is_first_in_pic() {
        summary.pictures_with_missing_refs += 1;
    }

    if !args.quiet {
        println!(
            "  slice: {:?} {} addr {} POC {} L0 {} L1 {}{}",
            slice.nalu_header.type_,
            if slice.header.dependent_slice_segment_flag {
                "dependent"
            } else {
                "independent"
            },
            slice.header.segment_address,
            slice.shared.pic_order_cnt,
            format_list(&lists.list0[..lists.num_ref_idx[0] as usize]),
            format_list(&lists.list1[..lists.num_ref_idx[1] as usize]),
            if errors.any() { " (missing references)" } else { "" },
        );
    }
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let mut input = match File::open(&args.input) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("error opening {}: {}", args.input.display(), e);
            std::process::exit(1);
        }
    };
    let mut stream = Vec::new();
    if let Err(e) = input.read_to_end(&mut stream) {
        eprintln!("error reading input file: {}", e);
        std::process::exit(1);
    }

    let mut parser = Parser::new(ParserOptions {
        tail_padding: args.tail_padding,
        pool_capacity: args.pool_capacity,
        substitute_missing_references: !args.no_substitute,
    });

    let mut dpb = Dpb::new(1);
    let mut current = None;
    let mut summary = Summary::default();

    for nalu in NalIterator::new(&stream) {
        summary.nalus += 1;

        let parsed = match parser.parse_nalu(&nalu) {
            Ok(parsed) => parsed,
            Err(e) if e.is_fatal() => {
                eprintln!("fatal error on NAL unit {}: {}", summary.nalus, e);
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("dropping NAL unit {}: {}", summary.nalus, e);
                summary.errors += 1;
                continue;
            }
        };

        match parsed {
            ParsedNalu::Vps(vps) if !args.quiet => {
                println!(
                    "VPS {}: {} sub-layers",
                    vps.video_parameter_set_id,
                    vps.max_sub_layers_minus1 + 1
                );
            }
            ParsedNalu::Sps(sps) if !args.quiet => {
                println!(
                    "SPS {}: {}x{}, chroma {}, {} bits, profile {:?}",
                    sps.seq_parameter_set_id,
                    sps.pic_width_in_luma_samples,
                    sps.pic_height_in_luma_samples,
                    sps.chroma_format_idc,
                    sps.bit_depth_luma,
                    sps.profile()
                );
            }
            ParsedNalu::Pps(pps) if !args.quiet => {
                println!(
                    "PPS {}: SPS {}, {}x{} tiles",
                    pps.pic_parameter_set_id,
                    pps.seq_parameter_set_id,
                    pps.num_tile_columns,
                    pps.num_tile_rows
                );
            }
            ParsedNalu::Sei(payloads) if !args.quiet => {
                for payload in payloads {
                    println!(
                        "SEI type {} ({} bytes): {:?}",
                        payload.payload_type, payload.payload_size, payload.message
                    );
                }
            }
            ParsedNalu::Slice(slice) => {
                if slice.is_first_in_pic() && !args.quiet {
                    println!("picture {}:", summary.pictures);
                }
                handle_slice(&args, &mut dpb, &mut current, &mut summary, &slice);
            }
            ParsedNalu::Other(header) => {
                log::debug!("Skipping NAL unit of type {:?}", header.type_);
            }
            _ => (),
        }
    }

    println!(
        "{} NAL units, {} pictures, {} slice segments, {} dropped NAL units, {} pictures with missing references",
        summary.nalus,
        summary.pictures,
        summary.slices,
        summary.errors,
        summary.pictures_with_missing_refs
    );
}
