// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::borrow::Cow;
use std::fmt;
use std::io::Cursor;
use std::io::Write;

use crate::codec::h265::parser::Nalu;

/// Iterator over the NAL units of an Annex B H.265 byte stream. Each item is
/// the NAL unit including its two-byte header, still carrying its emulation
/// prevention bytes.
pub struct NalIterator<'a>(Cursor<&'a [u8]>);

impl<'a> NalIterator<'a> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self(Cursor::new(stream))
    }
}

impl<'a> Iterator for NalIterator<'a> {
    type Item = Cow<'a, [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        Nalu::next(&mut self.0).map(|n| n.data).ok()
    }
}

/// Strips the emulation prevention bytes (the `0x03` in `00 00 03`) out of a
/// NAL unit payload. Borrows the input when there is nothing to remove.
pub fn remove_emulation_prevention(data: &[u8]) -> Cow<[u8]> {
    let has_epb = data
        .windows(3)
        .any(|window| window == [0x00, 0x00, 0x03]);
    if !has_epb {
        return Cow::Borrowed(data);
    }

    let mut rbsp = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }

        zeros = if byte == 0 { zeros + 1 } else { 0 };
        rbsp.push(byte);
    }

    Cow::Owned(rbsp)
}

#[derive(Debug)]
pub enum BitWriterError {
    InvalidBitCount,
    Io(std::io::Error),
}

impl fmt::Display for BitWriterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BitWriterError::InvalidBitCount => write!(f, "invalid bit count"),
            BitWriterError::Io(x) => write!(f, "{}", x),
        }
    }
}

impl From<std::io::Error> for BitWriterError {
    fn from(err: std::io::Error) -> Self {
        BitWriterError::Io(err)
    }
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// MSB-first bit writer, the inverse of the H.265 bit cursor. Used to
/// synthesise RBSPs.
pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit)
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        for bit in (0..bits).rev() {
            self.write_bit((value >> bit) & 1 == 1)?;
        }

        Ok(bits)
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Writes an unsigned Exp-Golomb code, `ue(v)`.
    pub fn write_ue(&mut self, value: u32) -> BitWriterResult<usize> {
        let value = u64::from(value) + 1;
        let bits = (64 - value.leading_zeros()) as usize;

        let mut written = self.write_f(bits - 1, 0u32)?;
        // The code number plus one can take 33 bits for u32::MAX.
        if bits > 32 {
            written += self.write_f(bits - 32, (value >> 32) as u32)?;
            written += self.write_f(32, value as u32)?;
        } else {
            written += self.write_f(bits, value as u32)?;
        }

        Ok(written)
    }

    /// Writes a signed Exp-Golomb code, `se(v)`.
    pub fn write_se(&mut self, value: i32) -> BitWriterResult<usize> {
        let abs = u64::from(value.unsigned_abs());
        let code = if value <= 0 { 2 * abs } else { 2 * abs - 1 };

        // i32::MIN maps to 2^32, one past what ue(v) carries here.
        let code = u32::try_from(code).map_err(|_| BitWriterError::InvalidBitCount)?;
        self.write_ue(code)
    }

    /// Writes `rbsp_trailing_bits()`.
    pub fn write_trailing_bits(&mut self) -> BitWriterResult<()> {
        self.write_bit(true)?;
        while self.nth_bit != 0 {
            self.write_bit(false)?;
        }

        Ok(())
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitwriter_f1() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(1, true).unwrap();
            writer.write_f(1, false).unwrap();
            writer.write_f(1, false).unwrap();
            writer.write_f(1, false).unwrap();
            writer.write_f(1, true).unwrap();
            writer.write_f(1, true).unwrap();
            writer.write_f(1, true).unwrap();
            writer.write_f(1, true).unwrap();
        }
        assert_eq!(buf, vec![0b10001111u8]);
    }

    #[test]
    fn test_bitwriter_f3() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(3, 0b100u8).unwrap();
            writer.write_f(3, 0b101u8).unwrap();
            writer.write_f(3, 0b011u8).unwrap();
        }
        assert_eq!(buf, vec![0b10010101u8, 0b10000000u8]);
    }

    #[test]
    fn test_bitwriter_exp_golomb() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            // 1, 010, 011, 00100
            writer.write_ue(0).unwrap();
            writer.write_ue(1).unwrap();
            writer.write_ue(2).unwrap();
            writer.write_ue(3).unwrap();
        }
        assert_eq!(buf, vec![0b1010_0110, 0b0100_0000]);

        buf.clear();
        {
            let mut writer = BitWriter::new(&mut buf);
            // se: 1 -> 010, -1 -> 011, 0 -> 1
            writer.write_se(1).unwrap();
            writer.write_se(-1).unwrap();
            writer.write_se(0).unwrap();
            writer.write_trailing_bits().unwrap();
        }
        assert_eq!(buf, vec![0b0100_1111]);
    }

    #[test]
    fn test_bitwriter_too_many_bits() {
        let mut buf = Vec::<u8>::new();
        let mut writer = BitWriter::new(&mut buf);
        assert!(matches!(
            writer.write_f(33, 0u32),
            Err(BitWriterError::InvalidBitCount)
        ));
    }

    #[test]
    fn strip_emulation_prevention() {
        let data = [0x42, 0x01, 0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x03];
        assert_eq!(
            remove_emulation_prevention(&data).as_ref(),
            &[0x42, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x03]
        );

        let clean = [0x40, 0x01, 0x0c];
        assert!(matches!(
            remove_emulation_prevention(&clean),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn iterate_annex_b_stream() {
        let stream = [
            0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0x0c, 0x00, 0x00, 0x01, 0x42, 0x01, 0x01, 0x00,
            0x00, 0x00, 0x01, 0x44, 0x01, 0xc0,
        ];

        let nalus: Vec<_> = NalIterator::new(&stream).collect();
        assert_eq!(nalus.len(), 3);
        assert_eq!(nalus[0].as_ref(), &[0x40, 0x01, 0x0c]);
        // The zero byte of the four-byte start code is not part of the NAL.
        assert_eq!(nalus[1].as_ref(), &[0x42, 0x01, 0x01]);
        assert_eq!(nalus[2].as_ref(), &[0x44, 0x01, 0xc0]);
    }
}
