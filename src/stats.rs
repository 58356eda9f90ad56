//! Per-worker statistics: a single-writer, many-relaxed-reader block plus
//! a thread-local batcher that coalesces updates before touching it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::packet::RejectReason;

/// Flush the thread-local batcher to the shared block after this many
/// receive bursts (glossary: "batch flush threshold").
pub const STATS_FLUSH_BATCHES: u32 = 8;

/// A min/max/sum/count aggregate for one-way latency, in nanoseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyAggregate {
    pub count: u64,
    pub sum_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl LatencyAggregate {
    fn merge(&mut self, sample_ns: u64) {
        if self.count == 0 {
            self.min_ns = sample_ns;
            self.max_ns = sample_ns;
        } else {
            self.min_ns = self.min_ns.min(sample_ns);
            self.max_ns = self.max_ns.max(sample_ns);
        }
        self.count += 1;
        self.sum_ns += sample_ns;
    }

    fn combine(&mut self, other: &LatencyAggregate) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min_ns = self.min_ns.min(other.min_ns);
        self.max_ns = self.max_ns.max(other.max_ns);
        self.count += other.count;
        self.sum_ns += other.sum_ns;
    }

    pub fn average_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum_ns / self.count
        }
    }
}

/// Per-error-category counters, one slot per [`RejectReason`] variant.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorCounters {
    pub err_too_short: u64,
    pub err_invalid_mac: u64,
    pub err_invalid_ethertype: u64,
    pub err_invalid_protocol: u64,
    pub err_invalid_signature: u64,
    pub err_tx_failed: u64,
}

impl ErrorCounters {
    fn record(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::TooShort => self.err_too_short += 1,
            RejectReason::InvalidMac => self.err_invalid_mac += 1,
            RejectReason::InvalidEtherType => self.err_invalid_ethertype += 1,
            RejectReason::InvalidProtocol => self.err_invalid_protocol += 1,
            RejectReason::InvalidSignature => self.err_invalid_signature += 1,
        }
    }

    fn total(&self) -> u64 {
        self.err_too_short
            + self.err_invalid_mac
            + self.err_invalid_ethertype
            + self.err_invalid_protocol
            + self.err_invalid_signature
            + self.err_tx_failed
    }

    fn add(&mut self, other: &ErrorCounters) {
        self.err_too_short += other.err_too_short;
        self.err_invalid_mac += other.err_invalid_mac;
        self.err_invalid_ethertype += other.err_invalid_ethertype;
        self.err_invalid_protocol += other.err_invalid_protocol;
        self.err_invalid_signature += other.err_invalid_signature;
        self.err_tx_failed += other.err_tx_failed;
    }
}

/// Per-signature counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureCounters {
    pub probe_ot: u64,
    pub data_ot: u64,
    pub latency: u64,
    pub rfc2544: u64,
    pub y1564: u64,
}

impl SignatureCounters {
    fn record(&mut self, sig: crate::config::SignatureKind) {
        use crate::config::SignatureKind::*;
        match sig {
            ProbeOt => self.probe_ot += 1,
            DataOt => self.data_ot += 1,
            Latency => self.latency += 1,
            Rfc2544 => self.rfc2544 += 1,
            Y1564 => self.y1564 += 1,
        }
    }

    fn add(&mut self, other: &SignatureCounters) {
        self.probe_ot += other.probe_ot;
        self.data_ot += other.data_ot;
        self.latency += other.latency;
        self.rfc2544 += other.rfc2544;
        self.y1564 += other.y1564;
    }
}

/// Cache-line-aligned, single-writer statistics block owned by one
/// worker. Read cross-thread by the supervisor via relaxed loads; torn
/// reads of individual counters are acceptable.
#[repr(align(64))]
pub struct WorkerStats {
    packets_received: AtomicU64,
    packets_reflected: AtomicU64,
    bytes_received: AtomicU64,
    bytes_reflected: AtomicU64,
    probe_ot: AtomicU64,
    data_ot: AtomicU64,
    latency_sig: AtomicU64,
    rfc2544: AtomicU64,
    y1564: AtomicU64,
    err_too_short: AtomicU64,
    err_invalid_mac: AtomicU64,
    err_invalid_ethertype: AtomicU64,
    err_invalid_protocol: AtomicU64,
    err_invalid_signature: AtomicU64,
    err_tx_failed: AtomicU64,
    lat_count: AtomicU64,
    lat_sum_ns: AtomicU64,
    lat_min_ns: AtomicU64,
    lat_max_ns: AtomicU64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        WorkerStats {
            packets_received: AtomicU64::new(0),
            packets_reflected: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_reflected: AtomicU64::new(0),
            probe_ot: AtomicU64::new(0),
            data_ot: AtomicU64::new(0),
            latency_sig: AtomicU64::new(0),
            rfc2544: AtomicU64::new(0),
            y1564: AtomicU64::new(0),
            err_too_short: AtomicU64::new(0),
            err_invalid_mac: AtomicU64::new(0),
            err_invalid_ethertype: AtomicU64::new(0),
            err_invalid_protocol: AtomicU64::new(0),
            err_invalid_signature: AtomicU64::new(0),
            err_tx_failed: AtomicU64::new(0),
            lat_count: AtomicU64::new(0),
            lat_sum_ns: AtomicU64::new(0),
            // No sample has ever been folded in yet; `u64::MAX` is the
            // identity element for `fetch_min`, so the first real sample
            // always wins the reduction instead of being clamped to 0.
            lat_min_ns: AtomicU64::new(u64::MAX),
            lat_max_ns: AtomicU64::new(0),
        }
    }
}

impl WorkerStats {
    /// Called only by the owning worker, as part of a batch flush.
    fn apply_batch(&self, batch: &StatsBatcher) {
        self.packets_received
            .fetch_add(batch.packets_received, Ordering::Relaxed);
        self.packets_reflected
            .fetch_add(batch.packets_reflected, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(batch.bytes_received, Ordering::Relaxed);
        self.bytes_reflected
            .fetch_add(batch.bytes_reflected, Ordering::Relaxed);
        self.probe_ot
            .fetch_add(batch.sig_counters.probe_ot, Ordering::Relaxed);
        self.data_ot
            .fetch_add(batch.sig_counters.data_ot, Ordering::Relaxed);
        self.latency_sig
            .fetch_add(batch.sig_counters.latency, Ordering::Relaxed);
        self.rfc2544
            .fetch_add(batch.sig_counters.rfc2544, Ordering::Relaxed);
        self.y1564
            .fetch_add(batch.sig_counters.y1564, Ordering::Relaxed);
        self.err_too_short
            .fetch_add(batch.err_counters.err_too_short, Ordering::Relaxed);
        self.err_invalid_mac
            .fetch_add(batch.err_counters.err_invalid_mac, Ordering::Relaxed);
        self.err_invalid_ethertype.fetch_add(
            batch.err_counters.err_invalid_ethertype,
            Ordering::Relaxed,
        );
        self.err_invalid_protocol
            .fetch_add(batch.err_counters.err_invalid_protocol, Ordering::Relaxed);
        self.err_invalid_signature.fetch_add(
            batch.err_counters.err_invalid_signature,
            Ordering::Relaxed,
        );
        self.err_tx_failed
            .fetch_add(batch.err_counters.err_tx_failed, Ordering::Relaxed);

        if batch.latency.count > 0 {
            self.lat_count
                .fetch_add(batch.latency.count, Ordering::Relaxed);
            self.lat_sum_ns
                .fetch_add(batch.latency.sum_ns, Ordering::Relaxed);
            // min/max need a read-modify-write reduction, not a plain add.
            self.lat_min_ns
                .fetch_min(batch.latency.min_ns, Ordering::Relaxed);
            self.lat_max_ns
                .fetch_max(batch.latency.max_ns, Ordering::Relaxed);
        }
    }

    /// Relaxed snapshot, safe to call cross-thread.
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_reflected: self.packets_reflected.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_reflected: self.bytes_reflected.load(Ordering::Relaxed),
            sig_counters: SignatureCounters {
                probe_ot: self.probe_ot.load(Ordering::Relaxed),
                data_ot: self.data_ot.load(Ordering::Relaxed),
                latency: self.latency_sig.load(Ordering::Relaxed),
                rfc2544: self.rfc2544.load(Ordering::Relaxed),
                y1564: self.y1564.load(Ordering::Relaxed),
            },
            err_counters: ErrorCounters {
                err_too_short: self.err_too_short.load(Ordering::Relaxed),
                err_invalid_mac: self.err_invalid_mac.load(Ordering::Relaxed),
                err_invalid_ethertype: self.err_invalid_ethertype.load(Ordering::Relaxed),
                err_invalid_protocol: self.err_invalid_protocol.load(Ordering::Relaxed),
                err_invalid_signature: self.err_invalid_signature.load(Ordering::Relaxed),
                err_tx_failed: self.err_tx_failed.load(Ordering::Relaxed),
            },
            latency: {
                let count = self.lat_count.load(Ordering::Relaxed);
                if count == 0 {
                    // `lat_min_ns` sits at its `u64::MAX` identity value
                    // when no sample has ever been folded in; don't leak
                    // that sentinel out as an observed minimum.
                    LatencyAggregate::default()
                } else {
                    LatencyAggregate {
                        count,
                        sum_ns: self.lat_sum_ns.load(Ordering::Relaxed),
                        min_ns: self.lat_min_ns.load(Ordering::Relaxed),
                        max_ns: self.lat_max_ns.load(Ordering::Relaxed),
                    }
                }
            },
        }
    }

    /// Zeroes every counter in place. Legal in both Ready and Running,
    /// since it touches only counters, never backend state.
    pub fn reset(&self) {
        for f in [
            &self.packets_received,
            &self.packets_reflected,
            &self.bytes_received,
            &self.bytes_reflected,
            &self.probe_ot,
            &self.data_ot,
            &self.latency_sig,
            &self.rfc2544,
            &self.y1564,
            &self.err_too_short,
            &self.err_invalid_mac,
            &self.err_invalid_ethertype,
            &self.err_invalid_protocol,
            &self.err_invalid_signature,
            &self.err_tx_failed,
            &self.lat_count,
            &self.lat_sum_ns,
            &self.lat_max_ns,
        ] {
            f.store(0, Ordering::Relaxed);
        }
        // Restore `fetch_min`'s identity value rather than 0, or every
        // post-reset minimum would be clamped to zero forever.
        self.lat_min_ns.store(u64::MAX, Ordering::Relaxed);
    }

    /// Records a transmit drop directly; `send_batch` rejects happen
    /// outside the per-packet classify/reflect loop so they bypass the
    /// batcher and are applied immediately (they are rare by design).
    pub fn record_tx_failed(&self, n: u64) {
        self.err_tx_failed.fetch_add(n, Ordering::Relaxed);
    }
}

/// A plain-data copy of a [`WorkerStats`] block, taken via relaxed loads.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStatsSnapshot {
    pub packets_received: u64,
    pub packets_reflected: u64,
    pub bytes_received: u64,
    pub bytes_reflected: u64,
    pub sig_counters: SignatureCounters,
    pub err_counters: ErrorCounters,
    pub latency: LatencyAggregate,
}

impl WorkerStatsSnapshot {
    fn add(&mut self, other: &WorkerStatsSnapshot) {
        self.packets_received += other.packets_received;
        self.packets_reflected += other.packets_reflected;
        self.bytes_received += other.bytes_received;
        self.bytes_reflected += other.bytes_reflected;
        self.sig_counters.add(&other.sig_counters);
        self.err_counters.add(&other.err_counters);
        self.latency.combine(&other.latency);
    }
}

/// Thread-local accumulator. Lives on a worker's stack; never shared
/// across workers.
#[derive(Default)]
pub struct StatsBatcher {
    packets_received: u64,
    packets_reflected: u64,
    bytes_received: u64,
    bytes_reflected: u64,
    sig_counters: SignatureCounters,
    err_counters: ErrorCounters,
    latency: LatencyAggregate,
    batch_counter: u32,
}

impl StatsBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_receive_burst(&mut self, packets: usize, bytes: u64) {
        self.packets_received += packets as u64;
        self.bytes_received += bytes;
    }

    pub fn record_accept(&mut self, sig: crate::config::SignatureKind, bytes: usize) {
        self.packets_reflected += 1;
        self.bytes_reflected += bytes as u64;
        self.sig_counters.record(sig);
    }

    pub fn record_reject(&mut self, reason: RejectReason) {
        self.err_counters.record(reason);
    }

    pub fn record_latency_ns(&mut self, sample_ns: u64) {
        self.latency.merge(sample_ns);
    }

    /// Counts the burst for flush-cadence purposes. Called once per
    /// `recv_batch` regardless of how many packets it returned.
    pub fn tick_burst(&mut self) {
        self.batch_counter += 1;
    }

    pub fn should_flush(&self) -> bool {
        self.batch_counter >= STATS_FLUSH_BATCHES
    }

    /// Copies accumulated counters into the shared block and resets.
    /// Must be called once more on clean worker exit even if
    /// `should_flush` is false, so no packet goes uncounted.
    pub fn flush(&mut self, shared: &WorkerStats) {
        shared.apply_batch(self);
        *self = StatsBatcher::default();
    }

    #[cfg(test)]
    pub(crate) fn err_total_for_test(&self) -> u64 {
        self.err_counters.total()
    }
}

/// Aggregate statistics across all workers, returned by `get_stats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AggregateStats {
    pub packets_received: u64,
    pub packets_reflected: u64,
    pub bytes_received: u64,
    pub bytes_reflected: u64,
    pub sig_counters: SignatureCounters,
    pub err_counters: ErrorCounters,
    pub latency: LatencyAggregate,
}

impl AggregateStats {
    /// Zeroes `self`, then folds in every worker's current snapshot,
    /// recomputing the latency average at the end. Accepts anything that
    /// yields `&WorkerStats` so callers holding `Vec<WorkerStats>` and
    /// callers holding `Vec<Arc<WorkerStats>>` can share this one
    /// implementation rather than each hand-rolling the fold.
    pub fn collect<'a>(workers: impl IntoIterator<Item = &'a WorkerStats>) -> AggregateStats {
        let mut out = AggregateStats::default();
        for w in workers {
            let snap = w.snapshot();
            out.packets_received += snap.packets_received;
            out.packets_reflected += snap.packets_reflected;
            out.bytes_received += snap.bytes_received;
            out.bytes_reflected += snap.bytes_reflected;
            out.sig_counters.add(&snap.sig_counters);
            out.err_counters.add(&snap.err_counters);
            out.latency.combine(&snap.latency);
        }
        out
    }

    pub fn latency_average_ns(&self) -> u64 {
        self.latency.average_ns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignatureKind;

    #[test]
    fn batcher_flushes_at_threshold_and_stays_off_shared_cache_line_otherwise() {
        let shared = WorkerStats::default();
        let mut batcher = StatsBatcher::new();

        for _ in 0..STATS_FLUSH_BATCHES - 1 {
            batcher.record_receive_burst(1, 64);
            batcher.tick_burst();
            assert!(!batcher.should_flush());
        }
        assert_eq!(shared.snapshot().packets_received, 0);

        batcher.record_receive_burst(1, 64);
        batcher.tick_burst();
        assert!(batcher.should_flush());
        batcher.flush(&shared);

        assert_eq!(shared.snapshot().packets_received, STATS_FLUSH_BATCHES as u64);
        assert_eq!(batcher.batch_counter, 0);
    }

    #[test]
    fn final_flush_on_exit_counts_partial_batch() {
        let shared = WorkerStats::default();
        let mut batcher = StatsBatcher::new();
        batcher.record_receive_burst(3, 192);
        batcher.tick_burst();
        assert!(!batcher.should_flush());
        batcher.flush(&shared); // simulates the forced final flush on exit
        assert_eq!(shared.snapshot().packets_received, 3);
    }

    #[test]
    fn counters_conserve_packets() {
        let shared = WorkerStats::default();
        let mut batcher = StatsBatcher::new();
        batcher.record_receive_burst(10, 640);
        batcher.record_accept(SignatureKind::ProbeOt, 64);
        batcher.record_accept(SignatureKind::Latency, 64);
        batcher.record_reject(RejectReason::InvalidMac);
        batcher.tick_burst();
        batcher.flush(&shared);

        let snap = shared.snapshot();
        assert!(snap.packets_received >= snap.packets_reflected + snap.err_counters.total());
    }

    #[test]
    fn reset_zeroes_every_counter() {
        let shared = WorkerStats::default();
        let mut batcher = StatsBatcher::new();
        batcher.record_receive_burst(5, 320);
        batcher.record_latency_ns(1000);
        batcher.tick_burst();
        batcher.flush(&shared);
        assert!(shared.snapshot().packets_received > 0);

        shared.reset();
        let snap = shared.snapshot();
        assert_eq!(snap.packets_received, 0);
        assert_eq!(snap.latency.count, 0);
    }

    #[test]
    fn aggregate_collects_across_workers() {
        let workers = vec![WorkerStats::default(), WorkerStats::default()];
        let mut b0 = StatsBatcher::new();
        b0.record_receive_burst(4, 256);
        b0.tick_burst();
        b0.flush(&workers[0]);

        let mut b1 = StatsBatcher::new();
        b1.record_receive_burst(6, 384);
        b1.tick_burst();
        b1.flush(&workers[1]);

        let agg = AggregateStats::collect(&workers);
        assert_eq!(agg.packets_received, 10);
        assert_eq!(agg.bytes_received, 640);
    }

    #[test]
    fn untouched_worker_does_not_zero_the_aggregated_minimum() {
        // A worker that never measured latency must not drag the
        // cross-worker minimum down to 0 via `fetch_min`'s identity value.
        let measured = WorkerStats::default();
        let mut batcher = StatsBatcher::new();
        batcher.record_latency_ns(5_000);
        batcher.record_latency_ns(9_000);
        batcher.tick_burst();
        batcher.flush(&measured);

        let untouched = WorkerStats::default();

        let workers = [measured, untouched];
        let agg = AggregateStats::collect(&workers);
        assert_eq!(agg.latency.count, 2);
        assert_eq!(agg.latency.min_ns, 5_000);
        assert_eq!(agg.latency.max_ns, 9_000);
        assert_eq!(agg.latency_average_ns(), 7_000);
    }

    #[test]
    fn single_worker_snapshot_reports_nonzero_min_and_average() {
        let shared = WorkerStats::default();
        let mut batcher = StatsBatcher::new();
        batcher.record_latency_ns(1_500);
        batcher.tick_burst();
        batcher.flush(&shared);

        let snap = shared.snapshot();
        assert_eq!(snap.latency.count, 1);
        assert_eq!(snap.latency.min_ns, 1_500);
        assert_eq!(snap.latency.average_ns(), 1_500);

        // A never-measuring worker reports a zero-sample block, not the
        // `u64::MAX` sentinel `fetch_min` uses internally.
        let idle = WorkerStats::default();
        let idle_snap = idle.snapshot();
        assert_eq!(idle_snap.latency.count, 0);
        assert_eq!(idle_snap.latency.min_ns, 0);
    }
}
