#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    // Throughput (cumulative)
    static RX_FRAMES: AtomicU64 = AtomicU64::new(0);
    static TX_FRAMES: AtomicU64 = AtomicU64::new(0);
    static RX_BYTES: AtomicU64 = AtomicU64::new(0);
    static TX_BYTES: AtomicU64 = AtomicU64::new(0);
    // Degradation / backpressure (cumulative counts)
    static CRC_DROPPED: AtomicU64 = AtomicU64::new(0);
    static RECV_STALLS: AtomicU64 = AtomicU64::new(0);
    static PARTIAL_SENDS: AtomicU64 = AtomicU64::new(0);
    static RECONNECTS: AtomicU64 = AtomicU64::new(0);

    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub rx_frames: u64,
        pub tx_frames: u64,
        pub rx_bytes: u64,
        pub tx_bytes: u64,
        pub crc_dropped: u64,
        pub recv_stalls: u64,
        pub partial_sends: u64,
        pub reconnects: u64,
    }

    pub fn inc_rx_frame(bytes: u64) {
        RX_FRAMES.fetch_add(1, Ordering::Relaxed);
        RX_BYTES.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_tx_frame(bytes: u64) {
        TX_FRAMES.fetch_add(1, Ordering::Relaxed);
        TX_BYTES.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_crc_dropped() {
        CRC_DROPPED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_recv_stall() {
        RECV_STALLS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_partial_send() {
        PARTIAL_SENDS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnect() {
        RECONNECTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            rx_frames: RX_FRAMES.load(Ordering::Relaxed),
            tx_frames: TX_FRAMES.load(Ordering::Relaxed),
            rx_bytes: RX_BYTES.load(Ordering::Relaxed),
            tx_bytes: TX_BYTES.load(Ordering::Relaxed),
            crc_dropped: CRC_DROPPED.load(Ordering::Relaxed),
            recv_stalls: RECV_STALLS.load(Ordering::Relaxed),
            partial_sends: PARTIAL_SENDS.load(Ordering::Relaxed),
            reconnects: RECONNECTS.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        std::thread::spawn(|| {
            let mut last = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                println!(
                    "metrics delta {}s: rx_frames={} rx_bytes={} tx_frames={} tx_bytes={} | drops: crc={} | stalls: recv={} partial_send={} | reconnects={}",
                    INTERVAL_SECS,
                    snap.rx_frames.saturating_sub(last.rx_frames),
                    snap.rx_bytes.saturating_sub(last.rx_bytes),
                    snap.tx_frames.saturating_sub(last.tx_frames),
                    snap.tx_bytes.saturating_sub(last.tx_bytes),
                    snap.crc_dropped.saturating_sub(last.crc_dropped),
                    snap.recv_stalls.saturating_sub(last.recv_stalls),
                    snap.partial_sends.saturating_sub(last.partial_sends),
                    snap.reconnects.saturating_sub(last.reconnects),
                );
                last = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub rx_frames: u64,
        pub tx_frames: u64,
        pub rx_bytes: u64,
        pub tx_bytes: u64,
        pub crc_dropped: u64,
        pub recv_stalls: u64,
        pub partial_sends: u64,
        pub reconnects: u64,
    }

    pub fn inc_rx_frame(_: u64) {}
    pub fn inc_tx_frame(_: u64) {}
    pub fn inc_crc_dropped() {}
    pub fn inc_recv_stall() {}
    pub fn inc_partial_send() {}
    pub fn inc_reconnect() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            rx_frames: 0,
            tx_frames: 0,
            rx_bytes: 0,
            tx_bytes: 0,
            crc_dropped: 0,
            recv_stalls: 0,
            partial_sends: 0,
            reconnects: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
