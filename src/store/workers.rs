/*
 * SPDX-FileCopyrightText: 2024 The extstore developers
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Path-bound I/O worker pools and one-shot futures.
//!
//! Each pool owns a FIFO queue of boxed jobs behind a mutex and condition
//! variable. A job performs exactly one read or append and resolves exactly
//! one future with the element count actually transferred, handing the
//! caller's buffer back with it. Shutdown is cooperative: the queue drains
//! before the workers exit, so every scheduled future still resolves.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use super::file::RawFile;
use crate::config::IoConfig;
use crate::record::Record;

/// The consumer side of a one-shot promise/future pair.
pub struct IoFuture<T> {
    inner: Arc<FutureInner<T>>,
}

pub(crate) struct IoPromise<T> {
    inner: Arc<FutureInner<T>>,
}

struct FutureInner<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

pub(crate) fn oneshot<T>() -> (IoPromise<T>, IoFuture<T>) {
    let inner = Arc::new(FutureInner {
        slot: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        IoPromise {
            inner: inner.clone(),
        },
        IoFuture { inner },
    )
}

impl<T> IoPromise<T> {
    pub(crate) fn fulfill(self, value: T) {
        let mut slot = self.inner.slot.lock();
        debug_assert!(slot.is_none());
        *slot = Some(value);
        self.inner.ready.notify_all();
    }
}

impl<T> IoFuture<T> {
    /// Blocks until the worker resolves the job.
    pub fn wait(self) -> T {
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.inner.ready.wait(&mut slot);
        }
    }
}

/// A completed transfer: the buffer travels back to the caller for reuse,
/// together with the number of *elements* moved.
pub struct Transfer<T> {
    pub buffer: Vec<T>,
    pub elements: usize,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    not_empty: Condvar,
    done: AtomicBool,
}

pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(name: &str, num_threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            done: AtomicBool::new(false),
        });
        let threads = (0..num_threads.max(1))
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("extstore-{}-{}", name, i))
                    .spawn(move || worker(shared))
                    .expect("spawning an i/o worker thread")
            })
            .collect();
        WorkerPool { shared, threads }
    }

    fn submit(&self, job: Job) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(job);
        if queue.len() == 1 {
            drop(queue);
            self.shared.not_empty.notify_one();
        }
    }

    pub(crate) fn schedule_read<T: Record>(
        &self,
        file: Arc<dyn RawFile>,
        mut buffer: Vec<T>,
        offset: u64,
        count: usize,
    ) -> IoFuture<Transfer<T>> {
        debug_assert!(count <= buffer.len());
        let (promise, future) = oneshot();
        self.submit(Box::new(move || {
            let elem_size = std::mem::size_of::<T>();
            let bytes = file.read_at(
                bytemuck::cast_slice_mut(&mut buffer[..count]),
                offset,
            );
            promise.fulfill(Transfer {
                buffer,
                elements: bytes / elem_size,
            });
        }));
        future
    }

    pub(crate) fn schedule_append<T: Record>(
        &self,
        file: Arc<dyn RawFile>,
        buffer: Vec<T>,
    ) -> IoFuture<Transfer<T>> {
        let (promise, future) = oneshot();
        self.submit(Box::new(move || {
            let elem_size = std::mem::size_of::<T>();
            let bytes = file.append(bytemuck::cast_slice(&buffer[..]));
            promise.fulfill(Transfer {
                buffer,
                elements: bytes / elem_size,
            });
        }));
        future
    }
}

fn worker(shared: Arc<PoolShared>) {
    loop {
        let mut queue = shared.queue.lock();
        while queue.is_empty() && !shared.done.load(Ordering::Acquire) {
            shared.not_empty.wait(&mut queue);
        }
        match queue.pop_front() {
            Some(job) => {
                drop(queue);
                job();
            }
            None => {
                // done and drained; pass the shutdown along
                drop(queue);
                shared.not_empty.notify_one();
                return;
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.done.store(true, Ordering::Release);
        self.shared.not_empty.notify_one();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

/// The default worker pool plus any path-bound pools from configuration.
pub(crate) struct IoWorkers {
    default_pool: WorkerPool,
    pools: Vec<(Vec<PathBuf>, WorkerPool)>,
}

impl IoWorkers {
    pub(crate) fn new(config: &IoConfig) -> Self {
        let default_pool = WorkerPool::new("io", config.default_pool_threads);
        let pools = config
            .pools
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let prefixes = spec
                    .paths
                    .iter()
                    .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
                    .collect();
                (prefixes, WorkerPool::new(&format!("io{}", i), spec.threads))
            })
            .collect();
        IoWorkers {
            default_pool,
            pools,
        }
    }

    /// The pool a file binds to: the first spec one of whose prefixes
    /// contains the file's canonical path, else the default pool.
    pub(crate) fn pool_for(&self, path: &Path) -> &WorkerPool {
        if self.pools.is_empty() {
            return &self.default_pool;
        }
        let canonical = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        for (prefixes, pool) in &self.pools {
            for prefix in prefixes {
                if canonical.ancestors().any(|a| a == prefix) {
                    return pool;
                }
            }
        }
        &self.default_pool
    }
}
