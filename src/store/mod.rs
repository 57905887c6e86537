/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Files, handle pooling, asynchronous I/O and typed on-disk views.
//!
//! One *physical* file must never be reached through more than one logical
//! writer at a time, and must not change under an open reader; the engine
//! assumes its callers enforce both.

mod file;
pub use file::*;

mod pool;
pub(crate) use pool::*;

mod workers;
pub use workers::*;

mod files;
pub use files::*;

mod span;
pub use span::*;

mod writer;
pub use writer::*;

mod temp;
pub use temp::*;
