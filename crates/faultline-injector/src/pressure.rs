//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Memory and CPU pressure generators for resource exhaustion faults."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::TryReserveError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{FaultError, Result};

/// Size of one allocated block.
pub const BLOCK_BYTES: usize = 1024 * 1024;

const PAGE_BYTES: usize = 4096;

static LIVE_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Bytes currently held by every [`MemoryPressure`] in the process.
pub fn live_bytes() -> usize {
    LIVE_BYTES.load(Ordering::SeqCst)
}

/// Live memory held on behalf of a fault until released or dropped.
#[derive(Debug, Default)]
pub struct MemoryPressure {
    blocks: Vec<Vec<u8>>,
}

impl MemoryPressure {
    /// Allocate `megabytes` one-megabyte blocks, touching every page so they are resident.
    ///
    /// Allocation failure is reported as [`FaultError::Resource`]; blocks obtained
    /// before the failure are freed on return.
    pub fn allocate(megabytes: u64) -> Result<Self> {
        let too_large =
            |err: TryReserveError| FaultError::Resource(format!("cannot hold {megabytes} MB: {err}"));
        let count = usize::try_from(megabytes)
            .map_err(|_| FaultError::Resource(format!("cannot hold {megabytes} MB")))?;
        let mut pressure = Self::default();
        pressure.blocks.try_reserve_exact(count).map_err(too_large)?;
        for index in 0..count {
            let mut block = Vec::new();
            block.try_reserve_exact(BLOCK_BYTES).map_err(too_large)?;
            block.resize(BLOCK_BYTES, 0u8);
            let fill = (index % 251) as u8 + 1;
            for offset in (0..BLOCK_BYTES).step_by(PAGE_BYTES) {
                block[offset] = fill;
            }
            pressure.blocks.push(block);
            LIVE_BYTES.fetch_add(BLOCK_BYTES, Ordering::SeqCst);
        }
        debug!(megabytes, "memory pressure allocated");
        Ok(pressure)
    }

    pub fn allocated_mb(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn allocated_bytes(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// Drop every block, returning how many megabytes were released.
    pub fn release(&mut self) -> u64 {
        let released = self.allocated_mb();
        LIVE_BYTES.fetch_sub(self.allocated_bytes(), Ordering::SeqCst);
        self.blocks = Vec::new();
        released
    }
}

impl Drop for MemoryPressure {
    fn drop(&mut self) {
        self.release();
    }
}

/// Busy-loop workers that occupy a CPU for `busy` out of every `tick`.
#[derive(Debug)]
pub struct CpuPressure {
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl CpuPressure {
    pub fn spawn(workers: u32, busy: Duration, tick: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handles = (0..workers)
            .filter_map(|index| {
                let stop = stop.clone();
                thread::Builder::new()
                    .name(format!("faultline-cpu-{index}"))
                    .spawn(move || burn(stop, busy, tick))
                    .map_err(|err| warn!(worker = index, error = %err, "failed to spawn cpu worker"))
                    .ok()
            })
            .collect::<Vec<_>>();
        debug!(
            workers = handles.len(),
            busy_ms = busy.as_millis() as u64,
            tick_ms = tick.as_millis() as u64,
            "cpu pressure started"
        );
        Self {
            stop,
            workers: handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker and wait for them to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("cpu pressure worker panicked");
            }
        }
    }
}

impl Drop for CpuPressure {
    fn drop(&mut self) {
        self.stop();
    }
}

fn burn(stop: Arc<AtomicBool>, busy: Duration, tick: Duration) {
    let idle = tick.saturating_sub(busy);
    while !stop.load(Ordering::Relaxed) {
        let started = Instant::now();
        let mut spin: u64 = 0;
        while started.elapsed() < busy {
            spin = std::hint::black_box(spin.wrapping_add(1));
            if stop.load(Ordering::Relaxed) {
                return;
            }
        }
        if !idle.is_zero() {
            thread::sleep(idle);
        }
    }
}
