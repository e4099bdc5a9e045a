use std::collections::VecDeque;

use crate::core::Candle;

/// Bounded candle series, newest at the back. Holds the last `capacity`
/// bars and drops the oldest on overflow.
#[derive(Debug, Clone)]
pub struct CandleBuffer {
    bars: VecDeque<Candle>,
    capacity: usize,
}

impl CandleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a bar. A bar with the same open timestamp as the newest one
    /// replaces it (an in-progress bar being updated); otherwise it is a
    /// new bar and the oldest is evicted at capacity. Returns true when a
    /// genuinely new bar was added.
    pub fn push(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.bars.back_mut() {
            if last.open_time == candle.open_time {
                *last = candle;
                return false;
            }
        }
        if self.bars.len() == self.capacity {
            self.bars.pop_front();
        }
        self.bars.push_back(candle);
        true
    }

    pub fn replace(&mut self, bars: Vec<Candle>) {
        self.bars.clear();
        for bar in bars.into_iter().rev().take(self.capacity).rev() {
            self.bars.push_back(bar);
        }
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.bars.back()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Candle> {
        self.bars.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(minute: u32, close: f64) -> Candle {
        Candle {
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut buffer = CandleBuffer::new(3);
        for minute in 0..5 {
            assert!(buffer.push(bar(minute, 100.0 + minute as f64)));
        }
        assert_eq!(buffer.len(), 3);
        let bars = buffer.to_vec();
        assert_eq!(bars[0].close, 102.0);
        assert_eq!(bars[2].close, 104.0);
    }

    #[test]
    fn same_timestamp_updates_in_place() {
        let mut buffer = CandleBuffer::new(8);
        assert!(buffer.push(bar(0, 100.0)));
        assert!(!buffer.push(bar(0, 101.0)));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.latest().unwrap().close, 101.0);
    }
}
