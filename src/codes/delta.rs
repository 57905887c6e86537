/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! # Elias δ
//!
//! `v + 1` is written in binary preceded by a γ code of its length. With
//! `N = floor(log2(v + 1))` and `L = floor(log2(N + 1))` the header is the γ
//! code of `N + 1`, which fits in `2L + 1` bits, followed by the low `N`
//! bits of `v + 1` (its leading one is implied by the header).

use super::{check_not_sentinel, floor_log2, narrow, CodeWord, Coding};
use crate::bits::{BitReader, BitStorage, BitStream};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default)]
pub struct EliasDelta;

impl Coding for EliasDelta {
    fn encode<W: CodeWord, S: BitStorage>(&self, bs: &mut BitStream<S>, value: W) -> Result<()> {
        check_not_sentinel(value)?;
        let value = value.to_u64() + 1;

        let n = floor_log2(value);
        let l = floor_log2(n + 1) as usize;

        // The header is conceptually three writes (L zeros, N + 1 in L + 1
        // bits, then the payload), but the bits of N + 1 above L are already
        // zero, so the whole γ header goes out in one call.
        bs.write_bits(n + 1, 2 * l + 1);
        bs.write_bits(value, n as usize);
        Ok(())
    }

    fn decode<W: CodeWord, S: BitStorage>(&self, reader: &mut BitReader<'_, S>) -> Result<W> {
        let l = reader.skip_while_equal(false);
        if l > 6 {
            return Err(Error::MalformedCode("delta code exceeds the target width"));
        }
        let n = reader
            .read_bits(l + 1)?
            .checked_sub(1)
            .ok_or(Error::MalformedCode("zero length in a delta header"))?;
        if n >= W::BITS as u64 {
            return Err(Error::MalformedCode("delta code exceeds the target width"));
        }
        let value = (1 << n) | reader.read_bits(n as usize)?;
        narrow(value - 1)
    }

    fn max_encoded_bits(&self, width: u32) -> usize {
        let width = width as usize;
        (width - 1) + 2 * floor_log2(width as u64) as usize + 1
    }
}
