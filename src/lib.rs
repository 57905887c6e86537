/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

#![doc = include_str!("../README.md")]
// No warnings
//#![deny(warnings)]
#![deny(unstable_features)]
// no dead code
//#![deny(dead_code)]
#![deny(trivial_casts)]
#![deny(unconditional_recursion)]
#![deny(clippy::empty_loop)]
#![deny(unreachable_code)]
#![deny(unreachable_pub)]
#![deny(unreachable_patterns)]
#![deny(unused_macro_rules)]
#![deny(unused_doc_comments)]

pub mod bits;
pub mod codes;
pub mod config;
pub mod error;
pub mod index;
pub mod merge;
pub mod record;
pub mod search;
pub mod store;
pub mod utils;

pub use error::{Error, Result};

/// Prelude module to import everything from this crate
pub mod prelude {
    pub use crate::bits::*;
    pub use crate::codes::*;
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::index::*;
    pub use crate::merge::*;
    pub use crate::record::*;
    pub use crate::search::*;
    pub use crate::store::*;
    pub use crate::utils::*;
}
