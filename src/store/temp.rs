/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Temporary file names and self-cleaning path scopes.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use log::warn;
use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const UNIQUE_NAME_LEN: usize = 16;

thread_local! {
    static NAME_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_os_rng());
}

/// A fresh 16-character alphanumeric file name.
pub fn unique_name() -> String {
    NAME_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        (0..UNIQUE_NAME_LEN)
            .map(|_| rng.sample(Alphanumeric) as char)
            .collect()
    })
}

pub fn unique_path(dir: &Path) -> PathBuf {
    dir.join(unique_name())
}

/// A scope of temporary files under one directory.
///
/// Files handed out by [`next`](TempPaths::next) are unlinked when the
/// scope drops; the directory itself stays, since the scope cannot know
/// when it becomes safe to remove.
pub struct TempPaths {
    dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl TempPaths {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(TempPaths {
            dir,
            paths: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserves and returns the next temporary path.
    pub fn next(&mut self) -> PathBuf {
        let path = unique_path(&self.dir);
        self.paths.push(path.clone());
        path
    }

    /// Unlinks every path handed out so far.
    pub fn clear(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not remove temporary file {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl Drop for TempPaths {
    fn drop(&mut self) {
        self.clear();
    }
}
