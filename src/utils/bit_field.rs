/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Compile-time bit-field descriptors over a backing word.
//!
//! A field is described by its mask; the shift and width are derived from
//! it. Fields compose into a whole packed record with [`packed_fields!`],
//! which rejects overlapping masks at compile time. Higher layers use these
//! to pack small signed and unsigned components (counts, rating
//! differences) into one fixed-size record word.

use super::sign_extend;

/// A contiguous bit field selected by `MASK` inside a `u64` word.
///
/// ```
/// # use extstore::utils::BitField;
/// type Count = BitField<0x0000_0000_0000_FFFF>;
///
/// let mut word = 0u64;
/// Count::set(&mut word, 40_000);
/// assert_eq!(Count::load(word), 40_000);
/// Count::set(&mut word, (-3i64) as u64);
/// assert_eq!(Count::load_signed(word), -3);
/// ```
pub struct BitField<const MASK: u64>;

impl<const MASK: u64> BitField<MASK> {
    pub const MASK: u64 = {
        assert!(MASK != 0, "a bit field must consist of at least one bit");
        let normalized = MASK >> MASK.trailing_zeros();
        assert!(
            normalized & normalized.wrapping_add(1) == 0,
            "all set bits of a bit field mask must be contiguous"
        );
        MASK
    };
    pub const SHIFT: u32 = Self::MASK.trailing_zeros();
    pub const WIDTH: u32 = Self::MASK.count_ones();

    /// Returns `value` positioned in the field, with bits outside it cleared.
    pub const fn store(value: u64) -> u64 {
        (value << Self::SHIFT) & Self::MASK
    }

    /// Replaces the field inside `word` with `value`.
    pub fn set(word: &mut u64, value: u64) {
        *word = (*word & !Self::MASK) | Self::store(value);
    }

    pub const fn load(word: u64) -> u64 {
        (word & Self::MASK) >> Self::SHIFT
    }

    /// Loads the field and sign-extends its most significant bit.
    pub const fn load_signed(word: u64) -> i64 {
        sign_extend(Self::load(word), Self::WIDTH)
    }
}

/// Whether no two of the given masks share a bit: the popcount of the union
/// equals the sum of the individual popcounts exactly when the masks are
/// pairwise disjoint.
pub const fn masks_disjoint(masks: &[u64]) -> bool {
    let mut combined: u64 = 0;
    let mut total: u32 = 0;
    let mut i = 0;
    while i < masks.len() {
        combined |= masks[i];
        total += masks[i].count_ones();
        i += 1;
    }
    combined.count_ones() == total
}

/// Declares a packed record: a wrapper around one `u64` word built from
/// `mask => getter, setter` field descriptors.
///
/// Overlapping masks are rejected at compile time whenever fields are
/// combined into one record, so the non-overlap invariant never depends on
/// a call-site assertion. Signed fields are read back through
/// [`BitField::load_signed`] (the getters return the raw unsigned bits).
///
/// ```
/// extstore::packed_fields! {
///     /// A game outcome: its occurrence count and packed win/loss tallies.
///     pub struct Tally: u64 {
///         0x0000_0000_FFFF_FFFF => count, set_count;
///         0x0000_FFFF_0000_0000 => wins, set_wins;
///         0xFFFF_0000_0000_0000 => losses, set_losses;
///     }
/// }
///
/// let mut tally = Tally::default();
/// tally.set_count(123_456);
/// tally.set_wins(40_000);
/// tally.set_losses(1);
/// assert_eq!(tally.count(), 123_456);
/// assert_eq!(tally.wins(), 40_000);
/// assert_eq!(Tally::from_word(tally.word()), tally);
/// ```
#[macro_export]
macro_rules! packed_fields {
    (
        $(#[$attr:meta])*
        $vis:vis struct $name:ident: u64 {
            $(
                $(#[$field_attr:meta])*
                $mask:literal => $get:ident, $set:ident;
            )+
        }
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        $vis struct $name(u64);

        const _: () = assert!(
            $crate::utils::masks_disjoint(&[$( $mask as u64 ),+]),
            "packed fields have overlapping masks"
        );

        impl $name {
            /// The union of all field masks; the remaining bits are unused.
            $vis const MASK: u64 = $( ($mask as u64) )|+;

            $vis const fn from_word(word: u64) -> Self {
                Self(word)
            }

            $vis const fn word(self) -> u64 {
                self.0
            }

            $(
                $(#[$field_attr])*
                $vis const fn $get(self) -> u64 {
                    $crate::utils::BitField::<{ $mask }>::load(self.0)
                }

                $vis fn $set(&mut self, value: u64) {
                    $crate::utils::BitField::<{ $mask }>::set(&mut self.0, value)
                }
            )+
        }
    };
}
