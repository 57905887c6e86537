/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Instantaneous integer codes over [bit streams](crate::bits).
//!
//! Every coding maps an unsigned value `v` strictly below the type maximum
//! (the maximum is reserved as a sentinel) to a self-delimiting bit string;
//! most codings do so by coding `v + 1` so that zero is representable. Each
//! coding knows its exact worst-case output size for a given input width,
//! which the [`compress`] helpers use to pick a bounded stream over a
//! heap-grown one.

use crate::bits::{BitReader, BitStorage, BitStream, BoundedBitStream, DynBitStream, WORD_BITS};
use crate::error::{Error, Result};

mod gamma;
pub use gamma::*;

mod delta;
pub use delta::*;

mod omega;
pub use omega::*;

mod fibonacci;
pub use fibonacci::*;

mod exp_golomb;
pub use exp_golomb::*;

mod vlq;
pub use vlq::*;

/// An unsigned integer type codings can work on.
pub trait CodeWord: Copy + Eq + Ord + std::fmt::Debug {
    const BITS: u32;
    const MAX: Self;

    fn to_u64(self) -> u64;
    /// Truncating; callers check the range first.
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_code_word {
    ($($ty:ty),*) => {$(
        impl CodeWord for $ty {
            const BITS: u32 = <$ty>::BITS;
            const MAX: Self = <$ty>::MAX;

            fn to_u64(self) -> u64 {
                self as u64
            }

            fn from_u64(value: u64) -> Self {
                value as $ty
            }
        }
    )*};
}

impl_code_word!(u8, u16, u32, u64);

#[inline]
pub(crate) fn floor_log2(value: u64) -> u64 {
    debug_assert!(value != 0);
    63 - value.leading_zeros() as u64
}

#[inline]
pub(crate) fn check_not_sentinel<W: CodeWord>(value: W) -> Result<()> {
    if value == W::MAX {
        return Err(Error::MalformedCode(
            "the type maximum is reserved as a sentinel and cannot be coded",
        ));
    }
    Ok(())
}

#[inline]
pub(crate) fn narrow<W: CodeWord>(value: u64) -> Result<W> {
    if value > W::MAX.to_u64() {
        return Err(Error::MalformedCode("decoded value exceeds the target width"));
    }
    Ok(W::from_u64(value))
}

/// An integer coding over bit streams.
///
/// Codings are plain values: parameterized ones (Exp-Golomb, VLQ) carry
/// their parameter as a field, so a call site picks the coding once and the
/// rest of the pipeline stays generic.
pub trait Coding {
    /// Appends the code of `value` to `bs`. Fails on the sentinel
    /// (`W::MAX`).
    fn encode<W: CodeWord, S: BitStorage>(&self, bs: &mut BitStream<S>, value: W) -> Result<()>;

    /// Decodes one value, failing with [`Error::MalformedCode`] on an
    /// exhausted stream or an invalid terminator.
    fn decode<W: CodeWord, S: BitStorage>(&self, reader: &mut BitReader<'_, S>) -> Result<W>;

    /// Exact worst-case code length in bits for a `width`-bit input.
    fn max_encoded_bits(&self, width: u32) -> usize;

    /// Fixed-size sequence form: plain concatenation of the element codes.
    fn encode_all<W: CodeWord, S: BitStorage>(
        &self,
        bs: &mut BitStream<S>,
        values: &[W],
    ) -> Result<()> {
        for &value in values {
            self.encode(bs, value)?;
        }
        Ok(())
    }

    fn decode_exact<W: CodeWord, S: BitStorage>(
        &self,
        reader: &mut BitReader<'_, S>,
        count: usize,
    ) -> Result<Vec<W>> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.decode(reader)?);
        }
        Ok(values)
    }

    /// Dynamic sequence form: the length, in the same coding, then the
    /// elements.
    fn encode_seq<W: CodeWord, S: BitStorage>(
        &self,
        bs: &mut BitStream<S>,
        values: &[W],
    ) -> Result<()> {
        self.encode(bs, values.len() as u64)?;
        self.encode_all(bs, values)
    }

    fn decode_seq<W: CodeWord, S: BitStorage>(
        &self,
        reader: &mut BitReader<'_, S>,
    ) -> Result<Vec<W>> {
        let len: u64 = self.decode(reader)?;
        self.decode_exact(reader, len as usize)
    }
}

/// Above this worst-case size the [`compress`] helpers switch from a
/// bounded, inline-allocated bit stream to a heap-grown one.
pub const MAX_BOUNDED_BITS: usize = 8192;

const BOUNDED_WORDS: usize = MAX_BOUNDED_BITS / WORD_BITS;

/// A coded value detached from its stream: the exact bit count plus the
/// serialized bytes (the last byte zero-padded in its low bits).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodedValue {
    pub num_bits: usize,
    pub bytes: Vec<u8>,
}

impl CodedValue {
    fn from_stream<S: BitStorage>(bs: &BitStream<S>) -> Self {
        CodedValue {
            num_bits: bs.num_bits(),
            bytes: bs.to_bytes(),
        }
    }

    fn to_stream(&self) -> DynBitStream {
        let mut bs = DynBitStream::new();
        bs.set_bits_from_bytes(&self.bytes, self.num_bits);
        bs
    }
}

/// Compresses a single value, sizing the stream from the coding's worst
/// case.
pub fn compress<C: Coding, W: CodeWord>(coding: &C, value: W) -> Result<CodedValue> {
    if coding.max_encoded_bits(W::BITS) <= MAX_BOUNDED_BITS {
        let mut bs: BoundedBitStream<BOUNDED_WORDS> = BitStream::new();
        coding.encode(&mut bs, value)?;
        Ok(CodedValue::from_stream(&bs))
    } else {
        let mut bs = DynBitStream::new();
        coding.encode(&mut bs, value)?;
        Ok(CodedValue::from_stream(&bs))
    }
}

/// Compresses a fixed-size sequence (no length prefix).
pub fn compress_all<C: Coding, W: CodeWord>(coding: &C, values: &[W]) -> Result<CodedValue> {
    let worst = coding
        .max_encoded_bits(W::BITS)
        .saturating_mul(values.len());
    if worst <= MAX_BOUNDED_BITS {
        let mut bs: BoundedBitStream<BOUNDED_WORDS> = BitStream::new();
        coding.encode_all(&mut bs, values)?;
        Ok(CodedValue::from_stream(&bs))
    } else {
        let mut bs = DynBitStream::new();
        coding.encode_all(&mut bs, values)?;
        Ok(CodedValue::from_stream(&bs))
    }
}

/// Compresses a length-prefixed sequence.
pub fn compress_seq<C: Coding, W: CodeWord>(coding: &C, values: &[W]) -> Result<CodedValue> {
    let worst = coding
        .max_encoded_bits(W::BITS)
        .saturating_mul(values.len())
        .saturating_add(coding.max_encoded_bits(u64::BITS));
    if worst <= MAX_BOUNDED_BITS {
        let mut bs: BoundedBitStream<BOUNDED_WORDS> = BitStream::new();
        coding.encode_seq(&mut bs, values)?;
        Ok(CodedValue::from_stream(&bs))
    } else {
        let mut bs = DynBitStream::new();
        coding.encode_seq(&mut bs, values)?;
        Ok(CodedValue::from_stream(&bs))
    }
}

pub fn decompress<C: Coding, W: CodeWord>(coding: &C, coded: &CodedValue) -> Result<W> {
    let bs = coded.to_stream();
    coding.decode(&mut BitReader::new(&bs))
}

pub fn decompress_all<C: Coding, W: CodeWord>(
    coding: &C,
    coded: &CodedValue,
    count: usize,
) -> Result<Vec<W>> {
    let bs = coded.to_stream();
    coding.decode_exact(&mut BitReader::new(&bs), count)
}

pub fn decompress_seq<C: Coding, W: CodeWord>(coding: &C, coded: &CodedValue) -> Result<Vec<W>> {
    let bs = coded.to_stream();
    coding.decode_seq(&mut BitReader::new(&bs))
}
