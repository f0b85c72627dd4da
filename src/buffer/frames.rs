use opencv::core::Mat;

/// Fixed-capacity sliding window of the most recent cropped frames.
///
/// Backed by a slot arena and a write index; once full, each push overwrites
/// the oldest slot. Iteration runs oldest to newest.
pub struct FrameBuffer {
    slots: Vec<Option<Mat>>,
    next: usize,
    len: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            next: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, frame: Mat) {
        let evicting = self.is_full();
        self.slots[self.next] = Some(frame);
        self.next = (self.next + 1) % self.capacity();
        if !evicting {
            self.len += 1;
        }

        tracing::trace!(
            len = self.len,
            capacity = self.capacity(),
            evicted = evicting,
            "frame buffered"
        );
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mat> + '_ {
        let start = if self.is_full() { self.next } else { 0 };
        (0..self.len).filter_map(move |i| self.slots[(start + i) % self.capacity()].as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC1};
    use opencv::prelude::*;

    fn tagged(value: u8) -> Mat {
        Mat::new_rows_cols_with_default(2, 2, CV_8UC1, Scalar::all(value as f64)).unwrap()
    }

    fn tags(buffer: &FrameBuffer) -> Vec<u8> {
        buffer.iter().map(|m| *m.at_2d::<u8>(0, 0).unwrap()).collect()
    }

    #[test]
    fn test_fills_in_insertion_order() {
        let mut buffer = FrameBuffer::new(3);
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.iter().count(), 0);

        buffer.push(tagged(1));
        buffer.push(tagged(2));
        assert_eq!(buffer.len(), 2);
        assert!(!buffer.is_full());
        assert_eq!(tags(&buffer), vec![1, 2]);
    }

    #[test]
    fn test_never_exceeds_capacity_and_evicts_oldest() {
        let mut buffer = FrameBuffer::new(3);
        for v in 1..=4 {
            buffer.push(tagged(v));
            assert!(buffer.len() <= buffer.capacity());
        }

        assert!(buffer.is_full());
        assert_eq!(tags(&buffer), vec![2, 3, 4]);
        assert!(!tags(&buffer).contains(&1));
    }

    #[test]
    fn test_wraps_repeatedly() {
        let mut buffer = FrameBuffer::new(4);
        for v in 1..=11 {
            buffer.push(tagged(v));
        }
        assert_eq!(tags(&buffer), vec![8, 9, 10, 11]);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buffer = FrameBuffer::new(0);
        buffer.push(tagged(5));
        buffer.push(tagged(6));
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(tags(&buffer), vec![6]);
    }
}
