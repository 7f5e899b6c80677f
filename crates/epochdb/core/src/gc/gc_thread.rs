// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// Background collection
// Drives periodic garbage collection passes from a dedicated thread.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use crate::gc::garbage_collector::{GarbageCollector, GcPassStats};

const THREAD_NAME: &str = "gc-driver";

#[derive(Debug, Default)]
struct Control {
    shutdown: AtomicBool,
    paused: AtomicBool,
    passes: AtomicU64,
}

/// Owns the `gc-driver` thread
pub struct GarbageCollectorThread {
    gc: Arc<GarbageCollector>,
    control: Arc<Control>,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl GarbageCollectorThread {
    /// Starts a thread that runs a collection pass every `interval`.
    ///
    /// Steps:
    /// 1. Spawns a named thread that parks for the interval between passes.
    /// 2. On each wakeup, checks for shutdown, then runs a pass unless paused.
    pub fn start(gc: Arc<GarbageCollector>, interval: Duration) -> io::Result<Self> {
        let control = Arc::new(Control::default());
        let thread_gc = gc.clone();
        let thread_control = control.clone();

        let handle = thread::Builder::new().name(THREAD_NAME.into()).spawn(move || {
            loop {
                thread::park_timeout(interval);
                if thread_control.shutdown.load(Ordering::Acquire) {
                    break;
                }
                if thread_control.paused.load(Ordering::Acquire) {
                    continue;
                }
                thread_gc.perform_gc();
                thread_control.passes.fetch_add(1, Ordering::Relaxed);
            }
        })?;

        info!(interval_ms = interval.as_millis() as u64, "gc driver started");
        Ok(Self {
            gc,
            control,
            interval,
            handle: Some(handle),
        })
    }

    /// Skip passes until [`GarbageCollectorThread::resume`]
    pub fn pause(&self) {
        self.control.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.control.paused.store(false, Ordering::Release);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Passes run by the thread so far
    pub fn passes(&self) -> u64 {
        self.control.passes.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop the thread, wait for it, then drain everything the watermark allows.
    /// Returns the counts of the final drain.
    pub fn stop(&mut self) -> GcPassStats {
        if let Some(handle) = self.handle.take() {
            self.control.shutdown.store(true, Ordering::Release);
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("gc driver thread panicked");
            }
            info!(passes = self.passes(), "gc driver stopped");
        }
        self.gc.fully_perform_gc()
    }
}

impl Drop for GarbageCollectorThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}
