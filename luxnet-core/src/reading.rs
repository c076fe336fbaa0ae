//! Hand-off cell for the latest filtered sensor value: the sampling loop writes, the
//! coordination loop reads. Lock-free so the two never share anything else.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct LatestReading {
    bits: Arc<AtomicU32>,
}

impl LatestReading {
    pub fn new(initial: f32) -> Self {
        Self {
            bits: Arc::new(AtomicU32::new(initial.to_bits())),
        }
    }

    pub fn publish(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    pub fn latest(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_and_reader_share_value() {
        let writer = LatestReading::new(0.0);
        let reader = writer.clone();
        writer.publish(42.5);
        assert_eq!(reader.latest(), 42.5);
    }

    #[test]
    fn crosses_threads() {
        let cell = LatestReading::default();
        let w = cell.clone();
        std::thread::spawn(move || w.publish(7.25)).join().unwrap();
        assert_eq!(cell.latest(), 7.25);
    }
}
