/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! # Elias γ
//!
//! `v + 1` is written in binary, preceded by a unary representation of its
//! length minus one: `N` zeros, then `v + 1` in `N + 1` bits, with
//! `N = floor(log2(v + 1))`. Takes `2N + 1` bits; optimal for Zipf
//! distributions of exponent 2.

use super::{check_not_sentinel, floor_log2, narrow, CodeWord, Coding};
use crate::bits::{BitReader, BitStorage, BitStream};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default)]
pub struct EliasGamma;

impl Coding for EliasGamma {
    fn encode<W: CodeWord, S: BitStorage>(&self, bs: &mut BitStream<S>, value: W) -> Result<()> {
        check_not_sentinel(value)?;
        let value = value.to_u64() + 1;

        let n = floor_log2(value) as usize;
        bs.write_bit_repeated(false, n);
        bs.write_bits(value, n + 1);
        Ok(())
    }

    fn decode<W: CodeWord, S: BitStorage>(&self, reader: &mut BitReader<'_, S>) -> Result<W> {
        let n = reader.skip_while_equal(false);
        if n >= W::BITS as usize {
            return Err(Error::MalformedCode("gamma code exceeds the target width"));
        }
        let value = reader.read_bits(n + 1)?;
        narrow(value - 1)
    }

    fn max_encoded_bits(&self, width: u32) -> usize {
        2 * (width as usize - 1) + 1
    }
}
