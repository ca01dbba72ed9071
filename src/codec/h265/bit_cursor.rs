// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A bit reader over an H.265 RBSP.
//!
//! The buffer is consumed as a sequence of big-endian 32-bit words. The
//! position is kept as the index of the current word plus a bit offset inside
//! it that counts down from 31 (most significant bit) to 0. Reads past the end
//! of the buffer see zero bytes, which lets Exp-Golomb codes near the end of a
//! truncated NAL unit be decoded against the configured tail padding.

use byteorder::BigEndian;
use byteorder::ByteOrder;

use crate::codec::h265::error::invalid_stream;
use crate::codec::h265::error::ParseError;
use crate::codec::h265::error::Result;

/// A saved cursor position, as returned by [`BitCursor::state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorState {
    word: usize,
    bit_offset: u32,
}

#[derive(Clone, Debug)]
pub struct BitCursor<'a> {
    /// The RBSP being read. Never owned by the cursor.
    data: &'a [u8],
    /// Declared size of the payload, in bytes.
    max_size: usize,
    /// Number of zero bytes that may be read past `max_size`.
    tail_padding: usize,
    /// Index of the current 32-bit word.
    word: usize,
    /// Next bit to read in the current word, 31 being the MSB.
    bit_offset: u32,
}

impl<'a> BitCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_tail_padding(data, 0)
    }

    pub fn with_tail_padding(data: &'a [u8], tail_padding: usize) -> Self {
        Self {
            data,
            max_size: data.len(),
            tail_padding,
            word: 0,
            bit_offset: 31,
        }
    }

    /// Points the cursor at a new buffer, rewinding it to the first bit.
    pub fn reset(&mut self, data: &'a [u8], tail_padding: usize) {
        *self = Self::with_tail_padding(data, tail_padding);
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn tail_padding(&self) -> usize {
        self.tail_padding
    }

    fn position(&self) -> u64 {
        self.word as u64 * 32 + u64::from(31 - self.bit_offset)
    }

    fn set_position(&mut self, position: u64) {
        self.word = (position / 32) as usize;
        self.bit_offset = 31 - (position % 32) as u32;
    }

    fn move_by(&mut self, num_bits: i64) {
        let position = (self.position() as i64).saturating_add(num_bits).max(0);
        self.set_position(position as u64);
    }

    fn word_at(&self, index: usize) -> u32 {
        let mut bytes = [0u8; 4];
        let start = index.saturating_mul(4);
        if start < self.data.len() {
            let end = std::cmp::min(start + 4, self.data.len());
            bytes[..end - start].copy_from_slice(&self.data[start..end]);
        }

        BigEndian::read_u32(&bytes)
    }

    /// Bits that can still be read before hitting `max_size + tail_padding`.
    fn bits_available(&self) -> i64 {
        ((self.max_size + self.tail_padding) as i64 * 8) - self.position() as i64
    }

    fn check_bits_left(&self, num_bits: u32) -> Result<()> {
        if self.bits_available() < i64::from(num_bits) {
            Err(ParseError::NotEnoughData)
        } else {
            Ok(())
        }
    }

    /// Unchecked read of 1 to 32 bits.
    fn get_bits(&mut self, num_bits: u32) -> u32 {
        let mask = |n: u32| if n == 32 { u32::MAX } else { (1u32 << n) - 1 };
        let current = self.word_at(self.word);
        let in_word = self.bit_offset + 1;

        if num_bits < in_word {
            self.bit_offset -= num_bits;
            (current >> (in_word - num_bits)) & mask(num_bits)
        } else if num_bits == in_word {
            self.word += 1;
            self.bit_offset = 31;
            current & mask(num_bits)
        } else {
            let rest = num_bits - in_word;
            let high = current & mask(in_word);
            let next = self.word_at(self.word + 1);
            self.word += 1;
            self.bit_offset = 31 - rest;
            (high << rest) | (next >> (32 - rest))
        }
    }

    /// Reads `num_bits` (up to 32) bits.
    pub fn read_bits(&mut self, num_bits: u32) -> Result<u32> {
        if num_bits == 0 {
            return Ok(0);
        }

        if num_bits > 32 {
            return Err(invalid_stream!("cannot read {} bits at once", num_bits));
        }

        self.check_bits_left(num_bits)?;
        Ok(self.get_bits(num_bits))
    }

    pub fn read_bit(&mut self) -> Result<u8> {
        Ok(self.read_bits(1)? as u8)
    }

    pub fn read_flag(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    /// Returns the next `num_bits` bits without consuming them.
    pub fn peek_bits(&self, num_bits: u32) -> Result<u32> {
        let mut probe = self.clone();
        probe.read_bits(num_bits)
    }

    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<()> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 32);
            self.read_bits(n as u32)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Moves the cursor `num_bits` back. Rewinding past the start of the
    /// buffer stops at the first bit.
    pub fn unget_bits(&mut self, num_bits: u32) {
        self.move_by(-i64::from(num_bits));
    }

    /// Reads an unsigned Exp-Golomb code, `ue(v)`.
    ///
    /// Codes longer than 32 bits can only come from a corrupted stream. In that
    /// case the cursor skips past the codeword length implied by the leading
    /// zeros so that parsing does not spin on the same bits, and
    /// `InvalidStream` is returned.
    pub fn read_ue(&mut self) -> Result<u32> {
        self.check_bits_left(1)?;
        if self.get_bits(1) == 1 {
            return Ok(0);
        }

        self.check_bits_left(8)?;
        let mut code = self.get_bits(8);
        let mut length: i64 = 9;

        while code == 0 && length < 32 {
            self.check_bits_left(8)?;
            code = self.get_bits(8);
            length += 8;
        }

        let mut leading_zeros: i64 = 0;
        while code & 0x80 == 0 && leading_zeros < 32 {
            code <<= 1;
            leading_zeros += 1;
        }

        length -= 8 - leading_zeros;
        // Give back what was read past the marker bit.
        self.move_by(-(8 - (leading_zeros + 1)));

        if length >= 32 || leading_zeros >= 32 {
            self.move_by(length);
            log::debug!(
                "Corrupted Exp-Golomb code, resuming at bit {}",
                self.bits_decoded()
            );
            return Err(invalid_stream!("corrupted Exp-Golomb code"));
        }

        self.check_bits_left(length as u32)?;
        let info = self.get_bits(length as u32);

        Ok((1u32 << length).wrapping_add(info).wrapping_sub(1))
    }

    /// Reads a signed Exp-Golomb code, `se(v)`.
    pub fn read_se(&mut self) -> Result<i32> {
        let code = u64::from(self.read_ue()?);

        if code & 1 == 1 {
            Ok(((code + 1) >> 1) as i32)
        } else {
            Ok(-((code >> 1) as i64) as i32)
        }
    }

    pub fn read_ue_max(&mut self, max: u32) -> Result<u32> {
        let value = self.read_ue()?;
        if value > max {
            Err(invalid_stream!(
                "Value out of bounds: expected 0 - {}, got {}",
                max,
                value
            ))
        } else {
            Ok(value)
        }
    }

    pub fn read_se_bounded(&mut self, min: i32, max: i32) -> Result<i32> {
        let value = self.read_se()?;
        if value < min || value > max {
            Err(invalid_stream!(
                "Value out of bounds: expected {} - {}, got {}",
                min,
                max,
                value
            ))
        } else {
            Ok(value)
        }
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.bit_offset & 7 == 7
    }

    /// Moves the cursor up to the next byte boundary, if not already there.
    pub fn align_to_byte(&mut self) {
        if !self.is_byte_aligned() {
            let position = self.position();
            self.set_position((position + 7) & !7);
        }
    }

    /// Consumes `rbsp_trailing_bits()`: the stop bit and the zero bits up to
    /// the next byte boundary.
    pub fn read_trailing_bits(&mut self) -> Result<()> {
        if self.read_bit()? != 1 {
            log::debug!("rbsp_stop_one_bit is not set");
        }

        let pending = (self.bit_offset + 1) % 8;
        self.read_bits(pending)?;
        Ok(())
    }

    /// Implements `more_rbsp_data()`: whether the cursor is before the RBSP
    /// stop bit.
    pub fn more_rbsp_data(&self) -> bool {
        let end = std::cmp::min(self.max_size, self.data.len());
        let data = &self.data[..end];

        let last = match data.iter().rposition(|&b| b != 0) {
            Some(last) => last,
            None => return false,
        };

        let stop_bit = last as u64 * 8 + u64::from(7 - data[last].trailing_zeros());
        self.position() < stop_bit
    }

    pub fn bits_decoded(&self) -> usize {
        self.position() as usize
    }

    pub fn bytes_decoded(&self) -> usize {
        self.word * 4 + ((31 - self.bit_offset) >> 3) as usize
    }

    pub fn bytes_left(&self) -> usize {
        self.max_size.saturating_sub(self.bytes_decoded())
    }

    pub fn state(&self) -> CursorState {
        CursorState {
            word: self.word,
            bit_offset: self.bit_offset,
        }
    }

    pub fn set_state(&mut self, state: CursorState) {
        self.word = state.word;
        self.bit_offset = state.bit_offset;
    }

    /// Positions the cursor at byte `num_bytes` of the buffer.
    pub fn set_decoded_bytes(&mut self, num_bytes: usize) {
        self.word = num_bytes / 4;
        self.bit_offset = 31 - ((num_bytes % 4) * 8) as u32;
    }

    /// Fails if the cursor went past the declared payload size.
    pub fn check_bs_left(&self) -> Result<()> {
        if self.position() > self.max_size as u64 * 8 {
            Err(invalid_stream!(
                "read {} bits past a {} bytes payload",
                self.position(),
                self.max_size
            ))
        } else {
            Ok(())
        }
    }
}
