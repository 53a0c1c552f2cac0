use std::sync::atomic::{AtomicU64, Ordering};

use spcore::SpError;

/// Message and byte counters for one pipe.
#[derive(Default)]
pub struct PipeStats {
    pub tx_msgs: AtomicU64,
    pub rx_msgs: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_bytes: AtomicU64,
}

impl PipeStats {
    pub fn bump_tx(&self, bytes: usize) {
        self.tx_msgs.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bump_rx(&self, bytes: usize) {
        self.rx_msgs.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Error accounting for a dialer or listener, bucketed the way operators read it.
#[derive(Default)]
pub struct EndpointStats {
    /// connections established (accepted or connected)
    pub established: AtomicU64,
    pub disconnect: AtomicU64,
    pub canceled: AtomicU64,
    pub timeout: AtomicU64,
    pub proto_err: AtomicU64,
    pub auth: AtomicU64,
    pub oom: AtomicU64,
    pub reject: AtomicU64,
    pub other: AtomicU64,
}

impl EndpointStats {
    pub fn bump_error(&self, err: SpError) {
        let counter = match err {
            SpError::ConnShutdown | SpError::ConnRefused => &self.disconnect,
            SpError::Canceled => &self.canceled,
            SpError::TimedOut => &self.timeout,
            SpError::ProtocolError => &self.proto_err,
            SpError::PermissionDenied => &self.auth,
            SpError::NoMemory | SpError::NoFiles => &self.oom,
            _ => &self.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Socket-wide counters.
#[derive(Default)]
pub struct SocketStats {
    /// pipes turned away (peer protocol mismatch or attach refusal)
    pub rejects: AtomicU64,
}
