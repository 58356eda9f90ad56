//! The per-worker hot loop: receive a burst, classify
//! and reflect each packet in place, send the burst back out, return
//! ownership, flush batched stats, repeat until told to stop.
//!
//! No allocation and no logging inside the loop body — only at entry,
//! exit, and on the rare backend-level error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{Backend, Descriptor};
use crate::config::Config;
use crate::packet::{self, Verdict};
use crate::sleepyinstant::Instant;
use crate::stats::{StatsBatcher, WorkerStats};

/// Shared by the supervisor and every worker; `Running` is downgraded to
/// `false` exactly once, by `stop`.
pub type StopFlag = Arc<AtomicBool>;

/// Runs until `stop_flag` is set, then performs one final drain and stats
/// flush before returning. Intended to be the body of a pinned OS thread
/// spawned by the supervisor; takes ownership of its backend.
pub fn run(
    worker_index: usize,
    cfg: Arc<Config>,
    mut backend: Box<dyn Backend>,
    stats: Arc<WorkerStats>,
    stop_flag: StopFlag,
) {
    if let Some(core) = cfg.cpu_pin.get(worker_index).copied().flatten() {
        pin_to_core(core, worker_index);
    }

    tracing::info!(worker = worker_index, backend = ?backend.kind(), "worker started");

    let mut batcher = StatsBatcher::new();
    let mut rx_batch: Vec<Descriptor> = Vec::with_capacity(cfg.batch_size);
    let mut tx_batch: Vec<Descriptor> = Vec::with_capacity(cfg.batch_size);
    let mut release_batch: Vec<Descriptor> = Vec::with_capacity(cfg.batch_size);

    while !stop_flag.load(Ordering::Acquire) {
        run_one_burst(
            &cfg,
            backend.as_mut(),
            &mut batcher,
            &stats,
            &mut rx_batch,
            &mut tx_batch,
            &mut release_batch,
        );
    }

    // Drain whatever the backend still has queued so a stop doesn't
    // silently drop in-flight packets, then flush the partial batch.
    run_one_burst(
        &cfg,
        backend.as_mut(),
        &mut batcher,
        &stats,
        &mut rx_batch,
        &mut tx_batch,
        &mut release_batch,
    );
    batcher.flush(&stats);
    backend.cleanup();

    tracing::info!(worker = worker_index, "worker stopped");
}

#[allow(clippy::too_many_arguments)]
fn run_one_burst(
    cfg: &Config,
    backend: &mut dyn Backend,
    batcher: &mut StatsBatcher,
    stats: &WorkerStats,
    rx_batch: &mut Vec<Descriptor>,
    tx_batch: &mut Vec<Descriptor>,
    release_batch: &mut Vec<Descriptor>,
) {
    rx_batch.clear();
    let n = backend.recv_batch(rx_batch, cfg.batch_size);

    let mut burst_bytes = 0u64;
    for mut desc in rx_batch.drain(..) {
        burst_bytes += desc.len() as u64;
        let recv_ts = desc.timestamp_ns;

        match packet::is_acceptable(desc.bytes(), cfg) {
            Verdict::Accept(sig, layout) => {
                packet::reflect(desc.bytes_mut(), layout, cfg.mode, cfg.software_checksum);
                batcher.record_accept(sig, desc.len());
                if cfg.measure_latency {
                    if let Some(ts) = recv_ts {
                        let now_ns = Instant::now_since_epoch_ns();
                        batcher.record_latency_ns(now_ns.saturating_sub(ts));
                    }
                }
                tx_batch.push(desc);
            }
            Verdict::Reject(reason) => {
                batcher.record_reject(reason);
                release_batch.push(desc);
            }
        }
    }
    batcher.record_receive_burst(n, burst_bytes);

    if !release_batch.is_empty() {
        backend.release_batch(std::mem::take(release_batch));
    }

    if !tx_batch.is_empty() {
        backend.send_batch(tx_batch);
        if !tx_batch.is_empty() {
            // Whatever `send_batch` didn't accept (a full ring) is
            // returned to the backend rather than leaked.
            stats.record_tx_failed(tx_batch.len() as u64);
            backend.release_batch(std::mem::take(tx_batch));
        }
    }

    batcher.tick_burst();
    if batcher.should_flush() {
        batcher.flush(stats);
    }
}

fn pin_to_core(core_id: usize, worker_index: usize) {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        tracing::debug!(worker = worker_index, "unable to retrieve core IDs for pinning");
        return;
    };
    let Some(core) = core_ids.get(core_id) else {
        tracing::debug!(worker = worker_index, core_id, "requested core index out of range");
        return;
    };
    if !core_affinity::set_for_current(*core) {
        tracing::info!(worker = worker_index, core_id, "failed to set core affinity");
        return;
    }
    tracing::debug!(worker = worker_index, core_id, "pinned to core");
}
