//! Host reference backend for [`DeviceRuntime`].
//!
//! `HostDevice` models an accelerator as a bounded memory arena plus one
//! worker thread that drains submitted command batches and fires completion
//! callbacks from its own execution context -- the same "notification on a
//! foreign thread" contract a real driver gives you. Kernels are looked up
//! in a registry keyed by symbol name, so the pipeline stays decoupled from
//! the routines it launches.
//!
//! Reservations beyond the arena cap fail with `DeviceResourceExhausted`,
//! which lets tests drive the retry-later path without a real device under
//! memory pressure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Result, ScanError};

use super::kernels;
use super::protocol::{self, FAULT_BAD_BATCH, FAULT_BAD_KERNEL, STATUS_SUCCESS};
use super::{
    CommandBatch, CompletionFn, CompletionNotice, DeviceReservation, DeviceRuntime, KernelCtx,
    KernelFn, Regions, RuntimeStatus, StageTimings, UploadData,
};

/// Tuning knobs for the host backend.
#[derive(Debug, Clone)]
pub struct HostDeviceConfig {
    /// Arena capacity in bytes; reservations beyond it are refused with
    /// `DeviceResourceExhausted`.
    pub memory_capacity: usize,
    /// Upper bound on the threadgroup width the occupancy heuristic picks.
    pub max_threadgroup: u32,
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 256 << 20,
            max_threadgroup: 256,
        }
    }
}

/// One reserved arena block. The bytes are taken out while a batch executes
/// against them, so `free` racing an in-flight batch just drops the block
/// without waiting for the worker.
struct Slot {
    len: usize,
    bytes: Vec<u8>,
}

struct Arena {
    next_id: u64,
    in_use: usize,
    slots: HashMap<u64, Slot>,
}

struct Shared {
    config: HostDeviceConfig,
    kernels: Mutex<HashMap<String, KernelFn>>,
    arena: Mutex<Arena>,
}

struct Job {
    batch: CommandBatch,
    on_complete: CompletionFn,
}

/// In-process reference accelerator.
pub struct HostDevice {
    shared: Arc<Shared>,
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl HostDevice {
    /// Start the backend with an empty kernel registry.
    pub fn new(config: HostDeviceConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            kernels: Mutex::new(HashMap::new()),
            arena: Mutex::new(Arena { next_id: 1, in_use: 0, slots: HashMap::new() }),
        });
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("host-device".into())
            .spawn(move || worker_loop(worker_shared, rx))
            .expect("spawn host device worker");
        Self { shared, tx: Some(tx), worker: Some(worker) }
    }

    /// Start the backend with the reference scan kernels registered under
    /// their [`protocol`] symbol names.
    pub fn with_default_kernels(config: HostDeviceConfig) -> Self {
        let device = Self::new(config);
        device.register_kernel(protocol::KERNEL_FILTER, Arc::new(kernels::scan_filter));
        device.register_kernel(protocol::KERNEL_PROJECT_ROW, Arc::new(kernels::scan_project_row));
        device.register_kernel(protocol::KERNEL_PROJECT_SLOT, Arc::new(kernels::scan_project_slot));
        device
    }

    /// Register (or replace) a kernel under `symbol`.
    pub fn register_kernel(&self, symbol: &str, kernel: KernelFn) {
        self.shared
            .kernels
            .lock()
            .expect("kernel registry lock")
            .insert(symbol.to_string(), kernel);
    }

    /// Peak-independent snapshot of the arena cap.
    pub fn memory_capacity(&self) -> usize {
        self.shared.config.memory_capacity
    }
}

impl DeviceRuntime for HostDevice {
    fn reserve(&self, len: usize) -> Result<DeviceReservation> {
        let mut arena = self.shared.arena.lock().expect("arena lock");
        if arena.in_use + len > self.shared.config.memory_capacity {
            return Err(ScanError::DeviceResourceExhausted {
                requested: len,
                in_use: arena.in_use,
                capacity: self.shared.config.memory_capacity,
            });
        }
        let id = arena.next_id;
        arena.next_id += 1;
        arena.in_use += len;
        arena.slots.insert(id, Slot { len, bytes: vec![0u8; len] });
        Ok(DeviceReservation::new(id, len))
    }

    fn free(&self, reservation: DeviceReservation) {
        let mut arena = self.shared.arena.lock().expect("arena lock");
        if let Some(slot) = arena.slots.remove(&reservation.id()) {
            arena.in_use -= slot.len;
        }
    }

    fn submit(&self, batch: CommandBatch, on_complete: CompletionFn) -> Result<()> {
        let tx = self.tx.as_ref().expect("worker alive while device alive");
        tx.send(Job { batch, on_complete })
            .expect("host device worker receiver alive");
        Ok(())
    }

    fn mem_in_use(&self) -> usize {
        self.shared.arena.lock().expect("arena lock").in_use
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        // Disconnect the channel first so the worker loop drains and exits.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<Job>) {
    for job in rx.iter() {
        let Job { batch, on_complete } = job;
        let notice = execute(&shared, &batch);
        // Release the batch (and its chunk references) before notifying, so
        // completion observers see the device's borrows already gone.
        drop(batch);
        on_complete(notice);
    }
}

/// Threadgroup width for `threads` total threads: the occupancy heuristic.
/// Results never depend on this choice.
fn threadgroup_for(threads: u32, cap: u32) -> u32 {
    threads.max(1).next_power_of_two().min(cap.max(1))
}

/// Run one batch to completion: uploads, launches, downloads, all timed.
fn execute(shared: &Shared, batch: &CommandBatch) -> CompletionNotice {
    // Take the reservation's bytes out of the arena for the duration of the
    // batch; a racing free() removes the slot and the bytes are dropped when
    // we try to put them back.
    let mut buf = {
        let mut arena = shared.arena.lock().expect("arena lock");
        match arena.slots.get_mut(&batch.reservation) {
            Some(slot) => std::mem::take(&mut slot.bytes),
            None => return fault_notice(FAULT_BAD_BATCH),
        }
    };

    let notice = run_commands(shared, batch, &mut buf);

    let mut arena = shared.arena.lock().expect("arena lock");
    if let Some(slot) = arena.slots.get_mut(&batch.reservation) {
        slot.bytes = buf;
    }
    notice
}

fn run_commands(shared: &Shared, batch: &CommandBatch, buf: &mut [u8]) -> CompletionNotice {
    let mut timings = StageTimings::default();
    if !regions_valid(&batch.regions, buf.len()) {
        return fault_notice(FAULT_BAD_BATCH);
    }

    let started = Instant::now();
    for upload in &batch.uploads {
        let data = match &upload.data {
            UploadData::Bytes(b) => b.as_slice(),
            UploadData::Chunk(c) => c.as_bytes(),
        };
        let end = upload.offset + data.len();
        if end > buf.len() {
            return fault_notice(FAULT_BAD_BATCH);
        }
        buf[upload.offset..end].copy_from_slice(data);
    }
    timings.upload = started.elapsed();

    let started = Instant::now();
    for launch in &batch.launches {
        let kernel = {
            let registry = shared.kernels.lock().expect("kernel registry lock");
            match registry.get(&launch.kernel) {
                Some(k) => Arc::clone(k),
                None => return fault_notice(FAULT_BAD_KERNEL),
            }
        };
        let (meta, src, dst) = split_regions(buf, &batch.regions);
        let mut ctx = KernelCtx {
            meta,
            src,
            dst,
            threads: launch.threads,
            threadgroup: threadgroup_for(launch.threads, shared.config.max_threadgroup),
        };
        let status = kernel(&mut ctx);
        protocol::merge_status(ctx.meta, status);
        if status != STATUS_SUCCESS {
            // First failure wins; later launches would read poisoned state.
            break;
        }
    }
    timings.execute = started.elapsed();

    let started = Instant::now();
    let mut downloads = Vec::with_capacity(batch.downloads.len());
    for download in &batch.downloads {
        let end = download.offset + download.len;
        if end > buf.len() {
            return fault_notice(FAULT_BAD_BATCH);
        }
        downloads.push((download.tag, buf[download.offset..end].to_vec()));
    }
    timings.download = started.elapsed();

    CompletionNotice { status: RuntimeStatus::Success, downloads, timings }
}

/// Regions must be in ascending meta < src < dst order, disjoint, in bounds.
fn regions_valid(regions: &Regions, len: usize) -> bool {
    let (m_off, m_len) = regions.meta;
    let (s_off, s_len) = regions.src;
    let src_ok = m_off + m_len <= s_off && s_off + s_len <= len;
    match regions.dst {
        Some((d_off, d_len)) => src_ok && s_off + s_len <= d_off && d_off + d_len <= len,
        None => src_ok,
    }
}

/// Split the reservation into the three disjoint task regions. Relies on
/// the ascending layout `regions_valid` checked.
fn split_regions<'a>(
    buf: &'a mut [u8],
    regions: &Regions,
) -> (&'a mut [u8], &'a [u8], Option<&'a mut [u8]>) {
    let (m_off, m_len) = regions.meta;
    let (s_off, s_len) = regions.src;
    let (head, tail) = buf.split_at_mut(s_off);
    let meta = &mut head[m_off..m_off + m_len];
    let (src_part, rest) = tail.split_at_mut(s_len);
    let dst = match regions.dst {
        Some((d_off, d_len)) => Some(&mut rest[d_off - s_off - s_len..][..d_len]),
        None => None,
    };
    (meta, &src_part[..], dst)
}

fn fault_notice(code: u32) -> CompletionNotice {
    CompletionNotice {
        status: RuntimeStatus::Fault(code),
        downloads: Vec::new(),
        timings: StageTimings::default(),
    }
}

// ============================================================================
// Tests
// ============================================================================
