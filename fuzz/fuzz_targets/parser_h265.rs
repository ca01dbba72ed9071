#![no_main]

use cros_hevc_parser::bitstream_utils::NalIterator;
use cros_hevc_parser::codec::h265::parser::Parser;
use cros_hevc_parser::codec::h265::parser::ParserOptions;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = Parser::new(ParserOptions {
        pool_capacity: Some(64),
        ..Default::default()
    });

    for nalu in NalIterator::new(data) {
        if let Err(e) = parser.parse_nalu(&nalu) {
            if e.is_fatal() {
                break;
            }
        }
    }
});
