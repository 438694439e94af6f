/*
* Copyright 2022-2025 Crown Copyright
*
* Licensed under the Apache License, Version 2.0 (the "License");
* you may not use this file except in compliance with the License.
* You may obtain a copy of the License at
*
*     http://www.apache.org/licenses/LICENSE-2.0
*
* Unless required by applicable law or agreed to in writing, software
* distributed under the License is distributed on an "AS IS" BASIS,
* WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
* See the License for the specific language governing permissions and
* limitations under the License.
*/
use crate::error::{GroupbyError, Result};
use log::debug;
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};

/// Default number of neighbours merged by one combine task.
pub const DEFAULT_SPLIT_EVERY: usize = 4;

/// Runs pure tasks over blocks.
///
/// Implementations may run tasks in any order or in parallel but must return results in
/// task order, so every scheduler produces identical output for identical input.
pub trait Scheduler: Send + Sync {
    /// Number of neighbouring results merged by one combine task, at least 2.
    fn split_every(&self) -> usize;

    /// Apply `f` to every task.
    ///
    /// # Errors
    /// The first error returned by `f`.
    fn map_blocks<T, R, F>(&self, tasks: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> Result<R> + Send + Sync;

    /// Merge `leaves` with `combine`, `split_every` neighbours at a time, until no more than
    /// `split_every` remain, then produce the answer from those with `aggregate`.
    ///
    /// # Errors
    /// If there are no leaves, or `combine` or `aggregate` fails.
    fn tree_reduce<T, R, C, A>(&self, leaves: Vec<T>, combine: C, aggregate: A) -> Result<R>
    where
        T: Send,
        C: Fn(Vec<T>) -> Result<T> + Send + Sync,
        A: FnOnce(Vec<T>) -> Result<R>,
    {
        if leaves.is_empty() {
            return Err(GroupbyError::unsupported("cannot reduce zero blocks"));
        }
        let split_every = self.split_every().max(2);
        let mut level = leaves;
        let mut depth = 0;
        while level.len() > split_every {
            let mut groups = Vec::with_capacity(level.len().div_ceil(split_every));
            let mut remaining = level.into_iter().peekable();
            while remaining.peek().is_some() {
                groups.push(remaining.by_ref().take(split_every).collect::<Vec<_>>());
            }
            level = self.map_blocks(groups, &combine)?;
            depth += 1;
        }
        debug!("Tree reduction used {depth} combine levels");
        aggregate(level)
    }
}

/// Runs every task on the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalScheduler {
    split_every: usize,
}

impl LocalScheduler {
    #[must_use]
    pub fn new(split_every: usize) -> Self {
        Self {
            split_every: split_every.max(2),
        }
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SPLIT_EVERY)
    }
}

impl Scheduler for LocalScheduler {
    fn split_every(&self) -> usize {
        self.split_every
    }

    fn map_blocks<T, R, F>(&self, tasks: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> Result<R> + Send + Sync,
    {
        tasks.into_iter().map(f).collect()
    }
}

/// Runs tasks on a dedicated rayon thread pool.
#[derive(Debug)]
pub struct ThreadedScheduler {
    pool: ThreadPool,
    split_every: usize,
}

impl ThreadedScheduler {
    /// A scheduler with `threads` workers, or one per CPU when `None`.
    ///
    /// # Errors
    /// If the thread pool cannot be created.
    pub fn new(threads: Option<usize>, split_every: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.unwrap_or(0))
            .thread_name(|index| format!("groupby-{index}"))
            .build()?;
        debug!("Created thread pool with {} threads", pool.current_num_threads());
        Ok(Self {
            pool,
            split_every: split_every.max(2),
        })
    }
}

impl Scheduler for ThreadedScheduler {
    fn split_every(&self) -> usize {
        self.split_every
    }

    fn map_blocks<T, R, F>(&self, tasks: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> Result<R> + Send + Sync,
    {
        self.pool
            .install(|| tasks.into_par_iter().map(&f).collect::<Result<Vec<_>>>())
    }
}
