#![forbid(unsafe_code)]

// Server metrics - lock-free AtomicU64 counters rendered in Prometheus text
// exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    // Monotonic counters
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    negotiations_total: AtomicU64,
    candidates_relayed_total: AtomicU64,
    chat_messages_total: AtomicU64,
    filters_started_total: AtomicU64,

    // Gauge
    connections_active: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                negotiations_total: AtomicU64::new(0),
                candidates_relayed_total: AtomicU64::new(0),
                chat_messages_total: AtomicU64::new(0),
                filters_started_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_negotiations(&self) {
        self.inner.negotiations_total.fetch_add(1, Relaxed);
    }

    pub fn inc_candidates_relayed(&self) {
        self.inner.candidates_relayed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_chat_messages(&self) {
        self.inner.chat_messages_total.fetch_add(1, Relaxed);
    }

    pub fn inc_filters_started(&self) {
        self.inner.filters_started_total.fetch_add(1, Relaxed);
    }

    // --- Gauge ---

    /// Increments connections_active and returns an RAII guard that decrements
    /// on drop, so the gauge stays accurate even if a handler panics.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    // --- Prometheus rendering ---

    /// Render all metrics in Prometheus text exposition format.
    /// `rooms_active` and `participants_active` are sampled on demand from the
    /// room registry.
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(2048);

        let i = &self.inner;

        render_counter(&mut out, "meshcall_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "meshcall_messages_received_total", "Total signaling messages received from clients", i.messages_received_total.load(Relaxed));
        render_counter(&mut out, "meshcall_messages_sent_total", "Total signaling messages sent to clients", i.messages_sent_total.load(Relaxed));
        render_counter(&mut out, "meshcall_errors_total", "Total errors", i.errors_total.load(Relaxed));
        render_counter(&mut out, "meshcall_rooms_created_total", "Total rooms created", i.rooms_created_total.load(Relaxed));
        render_counter(&mut out, "meshcall_joins_total", "Total room joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "meshcall_leaves_total", "Total room leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "meshcall_negotiations_total", "Total SDP offers answered", i.negotiations_total.load(Relaxed));
        render_counter(&mut out, "meshcall_candidates_relayed_total", "Total ICE candidates relayed from clients", i.candidates_relayed_total.load(Relaxed));
        render_counter(&mut out, "meshcall_chat_messages_total", "Total chat messages broadcast", i.chat_messages_total.load(Relaxed));
        render_counter(&mut out, "meshcall_filters_started_total", "Total filter activations", i.filters_started_total.load(Relaxed));

        render_gauge(&mut out, "meshcall_connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "meshcall_rooms_active", "Currently active rooms", rooms_active as u64);
        render_gauge(&mut out, "meshcall_participants_active", "Currently active participants", participants_active as u64);

        out
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements `connections_active` on drop.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
