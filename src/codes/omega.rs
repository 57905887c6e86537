/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! # Elias ω
//!
//! Recursively prefixes `v + 1` with the binary representation of its
//! length minus one, until a length of zero is reached, and terminates with
//! a single 0 bit. For 64-bit inputs at most four header levels occur, so
//! the recursion is unrolled and each range packs its headers into a single
//! word.

use super::{check_not_sentinel, floor_log2, narrow, CodeWord, Coding};
use crate::bits::{BitReader, BitStorage, BitStream};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default)]
pub struct EliasOmega;

impl Coding for EliasOmega {
    fn encode<W: CodeWord, S: BitStorage>(&self, bs: &mut BitStream<S>, value: W) -> Result<()> {
        check_not_sentinel(value)?;
        let value0 = value.to_u64() + 1;

        // Groups are emitted outermost header first:
        // value3 value2 value1 value0, then the closing 0 bit, where
        // value[k] = floor(log2(value[k - 1])).
        if W::BITS > 16 && value0 > 0xFFFF {
            let value1 = floor_log2(value0);
            let value2 = floor_log2(value1);
            let value3 = floor_log2(value2);

            let mut header = value3;
            header = (header << (value3 + 1)) | value2;
            header = (header << (value2 + 1)) | value1;

            bs.write_bits(header, (value2 + value3 + 4) as usize);
            bs.write_bits(value0, (value1 + 1) as usize);
        } else if value0 > 15 {
            let value1 = floor_log2(value0);
            let value2 = floor_log2(value1);

            let mut header = value2;
            header = (header << (value2 + 1)) | value1;
            header = (header << (value1 + 1)) | value0;

            bs.write_bits(header, (value1 + value2 + 4) as usize);
        } else if value0 > 3 {
            let value1 = floor_log2(value0);
            let header = (value1 << (value1 + 1)) | value0;

            bs.write_bits(header, (value1 + 3) as usize);
        } else if value0 > 1 {
            bs.write_bits(value0, 2);
        }

        bs.write_bit(false);
        Ok(())
    }

    fn decode<W: CodeWord, S: BitStorage>(&self, reader: &mut BitReader<'_, S>) -> Result<W> {
        let max_levels = if W::BITS > 16 { 4 } else { 3 };

        let mut value: u64 = 1;
        for _ in 0..max_levels {
            if !reader.peek_bit()? {
                break;
            }
            if value >= 64 {
                return Err(Error::MalformedCode("omega code exceeds the target width"));
            }
            value = reader.read_bits(value as usize + 1)?;
        }
        if reader.peek_bit()? {
            return Err(Error::MalformedCode("omega code has too many levels"));
        }
        reader.skip(1);

        narrow(value - 1)
    }

    fn max_encoded_bits(&self, width: u32) -> usize {
        // No closed formula; these are exact for the widths we support.
        match width {
            8 => 14,
            16 => 23,
            32 => 43,
            64 => 76,
            _ => usize::MAX,
        }
    }
}
