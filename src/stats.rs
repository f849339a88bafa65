//! Transport-wide statistics counters.
//!
//! A single process-global set of 64-bit counters updated with relaxed
//! atomics from every layer of the transport. Callers take consistent-enough
//! snapshots with [`TransportStats::snapshot`] and may zero the surface with
//! [`TransportStats::reset`].

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Atomic counter surface.
        #[derive(Debug, Default)]
        pub struct TransportStats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of every counter.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl TransportStats {
            const fn new() -> Self {
                Self { $($name: AtomicU64::new(0),)* }
            }

            /// Copy every counter with relaxed loads.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            /// Zero every counter.
            pub fn reset(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

counters! {
    /// Bytes handed to `write` by callers.
    bytes_sent,
    /// Bytes handed back from `read` to callers.
    bytes_received,
    /// High-water mark of concurrently established sessions.
    max_conn,
    /// Sessions opened by dialing out.
    active_open,
    /// Sessions opened by accepting a peer.
    passive_open,
    /// Sessions currently established.
    now_established,
    /// Datagrams rejected before protocol input (unrecognised shard type).
    pre_input_errors,
    /// Checksum failures reported by a packet filter.
    checksum_failures,
    /// Datagrams rejected by protocol input.
    input_errors,
    /// Datagrams received from the socket.
    input_packets,
    /// Datagrams written to the socket.
    output_packets,
    /// Segments parsed from inbound datagrams.
    input_segments,
    /// Segments serialized into outbound datagrams.
    output_segments,
    /// Bytes received from the socket.
    input_bytes,
    /// Bytes written to the socket.
    output_bytes,
    /// Segments retransmitted for any reason.
    retransmitted_segments,
    /// Segments retransmitted on duplicate-ack evidence.
    fast_retransmitted_segments,
    /// Segments retransmitted early, ahead of their timer.
    early_retransmitted_segments,
    /// Segments inferred lost by timer expiry.
    lost_segments,
    /// Duplicate segments received.
    dup_segments,
    /// Frames recovered by the FEC decoder.
    fec_recovered,
    /// Frames the FEC decoder recovered but could not frame.
    fec_failures,
    /// Parity shards received.
    fec_parity_shards,
    /// Data shards evicted from the FEC window before their block completed.
    fec_runt_shards,
}

static STATS: TransportStats = TransportStats::new();

/// The process-global counter surface.
pub fn stats() -> &'static TransportStats {
    &STATS
}

/// Record a newly established session, maintaining the high-water mark.
pub(crate) fn session_established(active: bool) {
    let s = stats();
    if active {
        s.active_open.fetch_add(1, Ordering::Relaxed);
    } else {
        s.passive_open.fetch_add(1, Ordering::Relaxed);
    }
    let current = s.now_established.fetch_add(1, Ordering::Relaxed) + 1;
    let mut seen = s.max_conn.load(Ordering::Relaxed);
    while current > seen {
        match s.max_conn.compare_exchange_weak(
            seen,
            current,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => seen = actual,
        }
    }
}

/// Record a session teardown.
pub(crate) fn session_closed() {
    stats().now_established.fetch_sub(1, Ordering::Relaxed);
}
