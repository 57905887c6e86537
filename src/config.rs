/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Engine configuration.
//!
//! All knobs the engine consumes, grouped by subsystem. Loading these from a
//! configuration file is the caller's business; the engine only sees the
//! resolved values.

use std::path::PathBuf;

/// Top-level configuration, passed to [`Storage::new`](crate::store::Storage::new).
#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    pub pool: PoolConfig,
    pub io: IoConfig,
    pub merge: MergeConfig,
    pub search: SearchConfig,
    pub index: IndexConfig,
}

/// Limits on simultaneously open file handles.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Capacity of the LRU pool of pooled file handles.
    pub max_open_pooled_files: usize,
    /// Soft cap on simultaneously open unpooled files. Advisory: the counter
    /// uses relaxed atomics and may transiently overshoot under contention.
    pub max_open_unpooled_files: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_open_pooled_files: 256,
            max_open_unpooled_files: 128,
        }
    }
}

/// Worker pool layout. A file whose canonical path lies under one of a
/// spec's prefixes binds to that pool; all other files bind to the default
/// pool.
#[derive(Clone, Debug)]
pub struct IoConfig {
    pub default_pool_threads: usize,
    pub pools: Vec<IoPoolSpec>,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            default_pool_threads: 8,
            pools: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IoPoolSpec {
    pub threads: usize,
    pub paths: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct MergeConfig {
    /// Fan-in cap: at most this many runs are merged into one output.
    pub max_batch_size: usize,
    /// Back-inserter buffer, in bytes (split over the two halves).
    pub output_buffer_size: usize,
    /// Per-input merge buffer, in bytes (split over the two halves).
    pub input_buffer_size: usize,
    /// Above this many active inputs the merge goes through a priority
    /// queue; at or below it, a linear scan of the front values wins.
    pub priority_queue_threshold: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            max_batch_size: 32,
            output_buffer_size: 4 << 20,
            input_buffer_size: 1 << 20,
            priority_queue_threshold: 24,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Size of one sequential read window around a search pivot, in bytes.
    /// About as much as a spinning disk reads in 'constant' time.
    pub max_seq_read_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            max_seq_read_size: 32 << 10,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// Scan buffer of the streaming index builder, in bytes.
    pub builder_buffer_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            builder_buffer_size: 8 << 20,
        }
    }
}
