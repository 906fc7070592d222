//! Clock port and adapters.

/// Port for getting the current time.
pub trait Clock: Send + Sync {
    /// Get the current Unix timestamp in seconds.
    fn now(&self) -> u64;
}

/// System clock using the OS time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        // Pre-epoch clocks are clamped rather than trusted.
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
    }
}

#[cfg(test)]
pub struct FixedClock {
    timestamp: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl FixedClock {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp: std::sync::atomic::AtomicU64::new(timestamp),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, seconds: u64) {
        self.timestamp
            .fetch_add(seconds, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.timestamp.load(std::sync::atomic::Ordering::SeqCst)
    }
}
