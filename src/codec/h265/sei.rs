// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SEI message parsing, 7.3.5 and Annex D.

use crate::codec::h265::bit_cursor::BitCursor;
use crate::codec::h265::error::invalid_stream;
use crate::codec::h265::error::ParseError;
use crate::codec::h265::error::Result;
use crate::codec::h265::parser::Sps;

/// Largest payload type that gets stored.
pub const MAX_SEI_PAYLOAD_TYPE: u32 = 255;

const SEI_PIC_TIMING: u32 = 1;
const SEI_USER_DATA_REGISTERED_ITU_T_T35: u32 = 4;
const SEI_USER_DATA_UNREGISTERED: u32 = 5;
const SEI_RECOVERY_POINT: u32 = 6;
const SEI_MASTERING_DISPLAY_COLOUR_VOLUME: u32 = 137;
const SEI_CONTENT_LIGHT_LEVEL_INFO: u32 = 144;

/// `pic_timing()`, D.2.3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PicTiming {
    pub pic_struct: u8,
    pub source_scan_type: u8,
    pub duplicate_flag: bool,
    pub au_cpb_removal_delay_minus1: u32,
    pub pic_dpb_output_delay: u32,
    pub pic_dpb_output_du_delay: u32,
    pub num_decoding_units_minus1: u32,
    pub du_common_cpb_removal_delay_flag: bool,
    pub du_common_cpb_removal_delay_increment_minus1: u32,
    pub num_nalus_in_du_minus1: Vec<u32>,
    pub du_cpb_removal_delay_increment_minus1: Vec<u32>,
}

/// `recovery_point()`, D.2.8.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryPoint {
    pub recovery_poc_cnt: i32,
    pub exact_match_flag: bool,
    pub broken_link_flag: bool,
}

/// `mastering_display_colour_volume()`, D.2.28.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MasteringDisplayColourVolume {
    /// In increments of 0.00002, for the G, B and R primaries in that order.
    pub display_primaries_x: [u16; 3],
    pub display_primaries_y: [u16; 3],
    pub white_point_x: u16,
    pub white_point_y: u16,
    /// In units of 0.0001 candelas per square metre.
    pub max_display_mastering_luminance: u32,
    pub min_display_mastering_luminance: u32,
}

/// `content_light_level_info()`, D.2.35.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContentLightLevelInfo {
    pub max_content_light_level: u16,
    pub max_pic_average_light_level: u16,
}

/// `user_data_registered_itu_t_t35()`, D.2.6.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserDataRegistered {
    pub itu_t_t35_country_code: u8,
    /// Only meaningful when `itu_t_t35_country_code` is 0xff.
    pub itu_t_t35_country_code_extension_byte: u8,
    pub payload: Vec<u8>,
}

/// `user_data_unregistered()`, D.2.7.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserDataUnregistered {
    pub uuid_iso_iec_11578: [u8; 16],
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeiMessage {
    PicTiming(PicTiming),
    RecoveryPoint(RecoveryPoint),
    MasteringDisplayColourVolume(MasteringDisplayColourVolume),
    ContentLightLevelInfo(ContentLightLevelInfo),
    UserDataRegistered(UserDataRegistered),
    UserDataUnregistered(UserDataUnregistered),
    /// A payload that is not interpreted, kept as raw bytes.
    Reserved(Vec<u8>),
}

impl Default for SeiMessage {
    fn default() -> Self {
        Self::Reserved(vec![])
    }
}

/// One `sei_message()`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeiPayload {
    pub payload_type: u32,
    /// In bytes.
    pub payload_size: u32,
    pub message: SeiMessage,
}

/// Reads a value coded as a run of 0xff bytes followed by a last byte.
fn read_ff_coded(c: &mut BitCursor) -> Result<u32> {
    let mut value = 0u32;
    loop {
        let byte = c.read_bits(8)?;
        value = value
            .checked_add(byte)
            .ok_or_else(|| invalid_stream!("SEI value overflow"))?;
        if byte != 0xff {
            return Ok(value);
        }
    }
}

fn read_bytes(c: &mut BitCursor, len: usize) -> Result<Vec<u8>> {
    (0..len).map(|_| Ok(c.read_bits(8)? as u8)).collect()
}

fn parse_pic_timing(c: &mut BitCursor, sps: &Sps) -> Result<PicTiming> {
    let mut pt = PicTiming::default();
    let vui = &sps.vui_parameters;

    if vui.frame_field_info_present_flag {
        pt.pic_struct = c.read_bits(4)? as u8;
        pt.source_scan_type = c.read_bits(2)? as u8;
        pt.duplicate_flag = c.read_flag()?;
    }

    let hrd = &vui.hrd;
    if !vui.hrd_parameters_present_flag || !hrd.cpb_dpb_delays_present() {
        return Ok(pt);
    }

    pt.au_cpb_removal_delay_minus1 =
        c.read_bits(u32::from(hrd.au_cpb_removal_delay_length_minus1) + 1)?;
    pt.pic_dpb_output_delay = c.read_bits(u32::from(hrd.dpb_output_delay_length_minus1) + 1)?;

    if hrd.sub_pic_hrd_params_present_flag {
        pt.pic_dpb_output_du_delay =
            c.read_bits(u32::from(hrd.dpb_output_delay_du_length_minus1) + 1)?;

        if hrd.sub_pic_cpb_params_in_pic_timing_sei_flag {
            let increment_bits = u32::from(hrd.du_cpb_removal_delay_increment_length_minus1) + 1;

            pt.num_decoding_units_minus1 = c.read_ue_max(sps.pic_size_in_ctbs().saturating_sub(1))?;
            pt.du_common_cpb_removal_delay_flag = c.read_flag()?;
            if pt.du_common_cpb_removal_delay_flag {
                pt.du_common_cpb_removal_delay_increment_minus1 = c.read_bits(increment_bits)?;
            }

            for i in 0..=pt.num_decoding_units_minus1 {
                pt.num_nalus_in_du_minus1
                    .push(c.read_ue_max(sps.pic_size_in_ctbs().saturating_sub(1))?);
                if !pt.du_common_cpb_removal_delay_flag && i < pt.num_decoding_units_minus1 {
                    pt.du_cpb_removal_delay_increment_minus1
                        .push(c.read_bits(increment_bits)?);
                }
            }
        }
    }

    Ok(pt)
}

fn parse_mastering_display_colour_volume(
    c: &mut BitCursor,
) -> Result<MasteringDisplayColourVolume> {
    let mut mdcv = MasteringDisplayColourVolume::default();
    for i in 0..3 {
        mdcv.display_primaries_x[i] = c.read_bits(16)? as u16;
        mdcv.display_primaries_y[i] = c.read_bits(16)? as u16;
    }

    mdcv.white_point_x = c.read_bits(16)? as u16;
    mdcv.white_point_y = c.read_bits(16)? as u16;
    mdcv.max_display_mastering_luminance = c.read_bits(32)?;
    mdcv.min_display_mastering_luminance = c.read_bits(32)?;

    Ok(mdcv)
}

fn parse_message(
    c: &mut BitCursor,
    payload_type: u32,
    payload_size: usize,
    sps: Option<&Sps>,
) -> Result<SeiMessage> {
    let message = match payload_type {
        SEI_PIC_TIMING => match sps {
            Some(sps) => SeiMessage::PicTiming(parse_pic_timing(c, sps)?),
            None => {
                log::warn!("pic_timing SEI without an active SPS, keeping it raw");
                SeiMessage::Reserved(read_bytes(c, payload_size)?)
            }
        },
        SEI_RECOVERY_POINT => SeiMessage::RecoveryPoint(RecoveryPoint {
            recovery_poc_cnt: c.read_se()?,
            exact_match_flag: c.read_flag()?,
            broken_link_flag: c.read_flag()?,
        }),
        SEI_MASTERING_DISPLAY_COLOUR_VOLUME => {
            SeiMessage::MasteringDisplayColourVolume(parse_mastering_display_colour_volume(c)?)
        }
        SEI_CONTENT_LIGHT_LEVEL_INFO => SeiMessage::ContentLightLevelInfo(ContentLightLevelInfo {
            max_content_light_level: c.read_bits(16)? as u16,
            max_pic_average_light_level: c.read_bits(16)? as u16,
        }),
        SEI_USER_DATA_REGISTERED_ITU_T_T35 => {
            if payload_size == 0 {
                return Err(invalid_stream!("Empty user_data_registered_itu_t_t35"));
            }

            let mut data = UserDataRegistered {
                itu_t_t35_country_code: c.read_bits(8)? as u8,
                ..Default::default()
            };

            let mut header_len = 1;
            if data.itu_t_t35_country_code == 0xff {
                data.itu_t_t35_country_code_extension_byte = c.read_bits(8)? as u8;
                header_len += 1;
            }

            data.payload = read_bytes(c, payload_size.saturating_sub(header_len))?;
            SeiMessage::UserDataRegistered(data)
        }
        SEI_USER_DATA_UNREGISTERED => {
            if payload_size < 16 {
                return Err(invalid_stream!(
                    "user_data_unregistered of {} bytes",
                    payload_size
                ));
            }

            let mut data = UserDataUnregistered::default();
            for byte in data.uuid_iso_iec_11578.iter_mut() {
                *byte = c.read_bits(8)? as u8;
            }
            data.payload = read_bytes(c, payload_size - 16)?;
            SeiMessage::UserDataUnregistered(data)
        }
        _ => SeiMessage::Reserved(read_bytes(c, payload_size)?),
    };

    Ok(message)
}

/// Parses the `sei_message()`s of a `sei_rbsp()`. `sps` is the active SPS,
/// needed to interpret picture timing messages.
///
/// Payload types above [`MAX_SEI_PAYLOAD_TYPE`] are skipped.
pub fn parse_sei_rbsp(c: &mut BitCursor, sps: Option<&Sps>) -> Result<Vec<SeiPayload>> {
    let mut payloads = vec![];

    loop {
        let payload_type = read_ff_coded(c)?;
        let payload_size = read_ff_coded(c)?;
        let size = payload_size as usize;

        if c.bytes_left() < size {
            return Err(ParseError::NotEnoughData);
        }

        // Payloads are byte aligned, so whatever the message parser consumed
        // the next one starts `size` bytes further.
        let start = c.state();
        if payload_type <= MAX_SEI_PAYLOAD_TYPE {
            let message = parse_message(c, payload_type, size, sps)?;
            log::debug!("Parsed SEI type {}, {} bytes", payload_type, payload_size);

            payloads.push(SeiPayload {
                payload_type,
                payload_size,
                message,
            });
        } else {
            log::warn!("Skipping SEI with unknown type {}", payload_type);
        }

        c.set_state(start);
        c.skip_bits(size * 8)?;

        if !c.more_rbsp_data() {
            break;
        }
    }

    Ok(payloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::BitWriter;
    use crate::codec::h265::parser::HrdParams;
    use crate::codec::h265::parser::VuiParams;

    fn write_message(w: &mut BitWriter<&mut Vec<u8>>, payload_type: u32, payload: &[u8]) {
        let mut value = payload_type;
        while value >= 0xff {
            w.write_f(8, 0xffu32).unwrap();
            value -= 0xff;
        }
        w.write_f(8, value).unwrap();
        w.write_f(8, payload.len() as u32).unwrap();
        for &byte in payload {
            w.write_f(8, byte).unwrap();
        }
    }

    fn sei_rbsp(messages: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            for (payload_type, payload) in messages {
                write_message(&mut w, *payload_type, payload);
            }
            w.write_trailing_bits().unwrap();
        }
        buf
    }

    #[test]
    fn hdr_metadata() {
        let mut mdcv = vec![];
        for value in [13250u16, 34500, 7500, 3000, 34000, 16000, 15635, 16450] {
            mdcv.extend_from_slice(&value.to_be_bytes());
        }
        mdcv.extend_from_slice(&10_000_000u32.to_be_bytes());
        mdcv.extend_from_slice(&50u32.to_be_bytes());

        let buf = sei_rbsp(&[
            (SEI_MASTERING_DISPLAY_COLOUR_VOLUME, mdcv),
            (SEI_CONTENT_LIGHT_LEVEL_INFO, vec![0x03, 0xe8, 0x01, 0x90]),
        ]);

        let mut c = BitCursor::new(&buf);
        let payloads = parse_sei_rbsp(&mut c, None).unwrap();
        assert_eq!(payloads.len(), 2);

        match &payloads[0].message {
            SeiMessage::MasteringDisplayColourVolume(mdcv) => {
                assert_eq!(mdcv.display_primaries_x, [13250, 7500, 34000]);
                assert_eq!(mdcv.display_primaries_y, [34500, 3000, 16000]);
                assert_eq!(mdcv.white_point_x, 15635);
                assert_eq!(mdcv.max_display_mastering_luminance, 10_000_000);
                assert_eq!(mdcv.min_display_mastering_luminance, 50);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            payloads[1].message,
            SeiMessage::ContentLightLevelInfo(ContentLightLevelInfo {
                max_content_light_level: 1000,
                max_pic_average_light_level: 400,
            })
        );
    }

    #[test]
    fn next_message_starts_after_the_declared_size() {
        let buf = sei_rbsp(&[
            // Two trailing bytes the message parser does not read.
            (
                SEI_CONTENT_LIGHT_LEVEL_INFO,
                vec![0x03, 0xe8, 0x01, 0x90, 0xde, 0xad],
            ),
            // recovery_poc_cnt -1, exact_match_flag set.
            (SEI_RECOVERY_POINT, vec![0x70]),
        ]);

        let mut c = BitCursor::new(&buf);
        let payloads = parse_sei_rbsp(&mut c, None).unwrap();
        assert_eq!(payloads.len(), 2);

        assert_eq!(payloads[0].payload_size, 6);
        assert_eq!(
            payloads[0].message,
            SeiMessage::ContentLightLevelInfo(ContentLightLevelInfo {
                max_content_light_level: 1000,
                max_pic_average_light_level: 400,
            })
        );

        assert_eq!(payloads[1].payload_type, SEI_RECOVERY_POINT);
        assert_eq!(
            payloads[1].message,
            SeiMessage::RecoveryPoint(RecoveryPoint {
                recovery_poc_cnt: -1,
                exact_match_flag: true,
                broken_link_flag: false,
            })
        );
    }

    #[test]
    fn user_data_and_unknown_types() {
        let mut unregistered = (0u8..16).collect::<Vec<_>>();
        unregistered.extend_from_slice(b"x264");

        let buf = sei_rbsp(&[
            (SEI_USER_DATA_UNREGISTERED, unregistered),
            (SEI_USER_DATA_REGISTERED_ITU_T_T35, vec![0xb5, 0x00, 0x31]),
            // Too big to be stored.
            (300, vec![1, 2, 3]),
            (200, vec![4, 5]),
        ]);

        let mut c = BitCursor::new(&buf);
        let payloads = parse_sei_rbsp(&mut c, None).unwrap();
        assert_eq!(payloads.len(), 3);

        match &payloads[0].message {
            SeiMessage::UserDataUnregistered(data) => {
                assert_eq!(data.uuid_iso_iec_11578[15], 15);
                assert_eq!(data.payload, b"x264");
            }
            other => panic!("unexpected {:?}", other),
        }

        match &payloads[1].message {
            SeiMessage::UserDataRegistered(data) => {
                assert_eq!(data.itu_t_t35_country_code, 0xb5);
                assert_eq!(data.payload, vec![0x00, 0x31]);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(payloads[2].payload_type, 200);
        assert_eq!(payloads[2].message, SeiMessage::Reserved(vec![4, 5]));
    }

    #[test]
    fn recovery_point_and_truncated_payload() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(8, SEI_RECOVERY_POINT).unwrap();
            w.write_f(8, 1u32).unwrap();
            w.write_se(-1).unwrap(); // recovery_poc_cnt
            w.write_f(1, 1u32).unwrap(); // exact_match_flag
            w.write_f(1, 0u32).unwrap(); // broken_link_flag
            w.write_f(3, 0u32).unwrap(); // payload alignment
            w.write_trailing_bits().unwrap();
        }

        let mut c = BitCursor::new(&buf);
        let payloads = parse_sei_rbsp(&mut c, None).unwrap();
        assert_eq!(
            payloads[0].message,
            SeiMessage::RecoveryPoint(RecoveryPoint {
                recovery_poc_cnt: -1,
                exact_match_flag: true,
                broken_link_flag: false,
            })
        );

        // Declares 10 bytes but carries 2.
        let buf = [SEI_USER_DATA_UNREGISTERED as u8, 10, 0xaa, 0x80];
        let mut c = BitCursor::new(&buf);
        assert_eq!(parse_sei_rbsp(&mut c, None), Err(ParseError::NotEnoughData));
    }

    #[test]
    fn pic_timing_uses_the_active_sps() {
        let sps = Sps {
            vui_parameters: VuiParams {
                frame_field_info_present_flag: true,
                hrd_parameters_present_flag: true,
                hrd: HrdParams {
                    nal_hrd_parameters_present_flag: true,
                    au_cpb_removal_delay_length_minus1: 7,
                    dpb_output_delay_length_minus1: 3,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        };

        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(8, SEI_PIC_TIMING).unwrap();
            w.write_f(8, 3u32).unwrap();
            w.write_f(4, 1u32).unwrap(); // pic_struct
            w.write_f(2, 2u32).unwrap(); // source_scan_type
            w.write_f(1, 0u32).unwrap(); // duplicate_flag
            w.write_f(8, 42u32).unwrap(); // au_cpb_removal_delay_minus1
            w.write_f(4, 5u32).unwrap(); // pic_dpb_output_delay
            w.write_f(5, 0u32).unwrap(); // payload alignment
            w.write_trailing_bits().unwrap();
        }

        let mut c = BitCursor::new(&buf);
        let payloads = parse_sei_rbsp(&mut c, Some(&sps)).unwrap();
        match &payloads[0].message {
            SeiMessage::PicTiming(pt) => {
                assert_eq!(pt.pic_struct, 1);
                assert_eq!(pt.source_scan_type, 2);
                assert_eq!(pt.au_cpb_removal_delay_minus1, 42);
                assert_eq!(pt.pic_dpb_output_delay, 5);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Without an SPS the payload is kept as is.
        let mut c = BitCursor::new(&buf);
        let payloads = parse_sei_rbsp(&mut c, None).unwrap();
        assert!(matches!(payloads[0].message, SeiMessage::Reserved(ref raw) if raw.len() == 3));
    }
}
