//! Bounded-segment FIFO used by per-key wait queues and timer-wheel slots.
//!
//! Grows by appending segments of doubling size up to a ceiling, never
//! reallocating or moving existing entries. [`LockQueue::reset`] empties the
//! queue while keeping every segment's allocation, which is what makes
//! wheel-slot reuse cheap: a slot is drained once per wheel revolution and
//! refilled with the same capacity it had before.

pub(crate) struct LockQueue<T: Copy> {
    segments: Vec<Vec<T>>,
    head_seg: usize,
    head_pos: usize,
    tail_seg: usize,
    segment_ceiling: usize,
    len: usize,
}

impl<T: Copy> LockQueue<T> {
    pub(crate) fn new(init_capacity: usize, segment_ceiling: usize) -> Self {
        Self {
            segments: vec![Vec::with_capacity(init_capacity.max(1))],
            head_seg: 0,
            head_pos: 0,
            tail_seg: 0,
            segment_ceiling: segment_ceiling.max(init_capacity.max(1)),
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, value: T) {
        if self.segments[self.tail_seg].len() == self.segments[self.tail_seg].capacity() {
            if self.tail_seg + 1 == self.segments.len() {
                let capacity =
                    (self.segments[self.tail_seg].capacity() * 2).min(self.segment_ceiling);
                self.segments.push(Vec::with_capacity(capacity));
            }
            self.tail_seg += 1;
        }
        self.segments[self.tail_seg].push(value);
        self.len += 1;
    }

    pub(crate) fn peek_left(&self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let mut seg = self.head_seg;
        let mut pos = self.head_pos;
        while pos == self.segments[seg].len() {
            seg += 1;
            pos = 0;
        }
        Some(self.segments[seg][pos])
    }

    pub(crate) fn pop_left(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        while self.head_pos == self.segments[self.head_seg].len() {
            self.head_seg += 1;
            self.head_pos = 0;
        }
        let value = self.segments[self.head_seg][self.head_pos];
        self.head_pos += 1;
        self.len -= 1;
        if self.len == 0 {
            // drained: rewind in place so pushed entries reuse segment zero
            self.reset();
        }
        Some(value)
    }

    /// Empties the queue without freeing any segment.
    pub(crate) fn reset(&mut self) {
        for segment in &mut self.segments {
            segment.clear();
        }
        self.head_seg = 0;
        self.head_pos = 0;
        self.tail_seg = 0;
        self.len = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_fifo() {
        let mut queue = LockQueue::new(4, 64);
        for i in 0..100u32 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 100);
        for i in 0..100u32 {
            assert_eq!(queue.peek_left(), Some(i));
            assert_eq!(queue.pop_left(), Some(i));
        }
        assert_eq!(queue.pop_left(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_segments_double_up_to_ceiling() {
        let mut queue = LockQueue::new(2, 8);
        for i in 0..64u32 {
            queue.push(i);
        }
        // 2, 4, 8, 8, ... never beyond the ceiling
        assert!(queue.segments.iter().all(|s| s.capacity() <= 8));
        for i in 0..64u32 {
            assert_eq!(queue.pop_left(), Some(i));
        }
    }

    #[test]
    fn test_reset_keeps_allocations() {
        let mut queue = LockQueue::new(2, 8);
        for i in 0..20u32 {
            queue.push(i);
        }
        let segments_before = queue.segments.len();
        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.segments.len(), segments_before);
        queue.push(7);
        assert_eq!(queue.pop_left(), Some(7));
    }

    #[test]
    fn test_interleaved_push_pop() {
        let mut queue = LockQueue::new(2, 4);
        let mut expected = 0u32;
        let mut next = 0u32;
        for round in 0..50 {
            for _ in 0..(round % 5) + 1 {
                queue.push(next);
                next += 1;
            }
            for _ in 0..(round % 3) + 1 {
                if let Some(got) = queue.pop_left() {
                    assert_eq!(got, expected);
                    expected += 1;
                }
            }
        }
        while let Some(got) = queue.pop_left() {
            assert_eq!(got, expected);
            expected += 1;
        }
        assert_eq!(expected, next);
    }
}
