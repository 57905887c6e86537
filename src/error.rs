/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Error kinds raised by the storage engine.
//!
//! Worker threads never raise: asynchronous operations always resolve their
//! future with the number of elements actually transferred, and the caller
//! synthesizes [`Error::ShortRead`] or [`Error::ShortAppend`] by comparing it
//! with the requested count.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::OpenMode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open {} with mode {mode}", path.display())]
    Open {
        path: PathBuf,
        mode: OpenMode,
        #[source]
        source: std::io::Error,
    },

    /// The soft cap on simultaneously open unpooled files was reached.
    #[error("open file limit of {limit} reached while opening {}", path.display())]
    OpenExhausted { path: PathBuf, limit: usize },

    #[error("i/o error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read {actual} of {requested} elements from {} at offset {offset}", path.display())]
    ShortRead {
        path: PathBuf,
        offset: u64,
        requested: usize,
        actual: usize,
    },

    #[error("appended {actual} of {requested} elements to {}", path.display())]
    ShortAppend {
        path: PathBuf,
        requested: usize,
        actual: usize,
    },

    /// The byte length of a record file is not a multiple of the record size.
    #[error(
        "size of {} ({size} bytes) is not a multiple of the {record_size}-byte record",
        path.display()
    )]
    MalformedFile {
        path: PathBuf,
        size: u64,
        record_size: usize,
    },

    /// A bit stream ended prematurely or a code had an invalid terminator.
    #[error("malformed code: {0}")]
    MalformedCode(&'static str),

    #[error("index {index} out of range for {len} elements")]
    OutOfRange { index: u64, len: u64 },
}
