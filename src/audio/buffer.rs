use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;

/// Thread-safe sliding window of the most recent samples
///
/// The capture side writes every fragment here and the voice activity
/// monitor drains it on each poll, so the monitor always classifies the
/// newest audio. When full, the oldest samples are overwritten.
pub struct AudioRingBuffer {
    buffer: Arc<Mutex<HeapRb<f32>>>,
}

impl AudioRingBuffer {
    /// Create a new ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(HeapRb::new(capacity.max(1)))),
        }
    }

    /// Create a buffer sized to hold `window` worth of mono audio
    pub fn for_window(sample_rate: u32, window: Duration) -> Self {
        let capacity = (sample_rate as f64 * window.as_secs_f64()).ceil() as usize;
        Self::new(capacity)
    }

    /// Write samples, overwriting the oldest ones if the window is full
    ///
    /// Returns the number of samples that were overwritten.
    pub fn write(&self, samples: &[f32]) -> usize {
        let mut buffer = self.buffer.lock();
        samples
            .iter()
            .filter(|&&sample| buffer.push_overwrite(sample).is_some())
            .count()
    }

    /// Take everything currently in the window, oldest first
    pub fn drain(&self) -> Vec<f32> {
        let mut buffer = self.buffer.lock();
        buffer.pop_iter().collect()
    }

    /// Get the number of samples available to read
    pub fn len(&self) -> usize {
        self.buffer.lock().occupied_len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Clear the buffer
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    /// Get the capacity of the buffer
    pub fn capacity(&self) -> usize {
        self.buffer.lock().capacity().get()
    }
}

impl Clone for AudioRingBuffer {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_drain() {
        let buffer = AudioRingBuffer::new(1024);
        let data: Vec<f32> = (0..100).map(|i| i as f32).collect();

        assert_eq!(buffer.write(&data), 0);
        assert_eq!(buffer.len(), 100);

        assert_eq!(buffer.drain(), data);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let buffer = AudioRingBuffer::new(10);
        let data: Vec<f32> = (0..20).map(|i| i as f32).collect();

        assert_eq!(buffer.write(&data), 10);

        let window = buffer.drain();
        assert_eq!(window.len(), 10);
        assert_eq!(window[0], 10.0);
        assert_eq!(window[9], 19.0);
    }

    #[test]
    fn test_window_capacity() {
        let buffer = AudioRingBuffer::for_window(16000, Duration::from_millis(100));
        assert_eq!(buffer.capacity(), 1600);
    }

    #[test]
    fn test_clones_share_storage() {
        let writer = AudioRingBuffer::new(8);
        let reader = writer.clone();
        writer.write(&[0.25, 0.5]);
        assert_eq!(reader.drain(), vec![0.25, 0.5]);
        assert!(writer.is_empty());
    }
}
