// Copyright (C) 2023 Fred Clausen

// This program is free software; you can redistribute it and/or
// modify it under the terms of the GNU General Public License
// as published by the Free Software Foundation; either version 2
// of the License, or (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA  02110-1301, USA

use spectran_decoders::{IqSample, SampleBlock};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Fewest blocks an automatically sized queue will hold.
pub const MIN_CAPACITY_BLOCKS: usize = 4;

/// How many blocks the queue holds before it starts discarding the oldest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueueCapacity {
    Blocks(usize),
    /// Enough blocks for `seconds` of samples at `sample_rate_hz`. Resolved once the block
    /// length is known from the first push, and again whenever the sample rate changes.
    Duration { seconds: f64, sample_rate_hz: f64 },
}

impl Default for QueueCapacity {
    fn default() -> Self {
        QueueCapacity::Duration {
            seconds: 1.0,
            sample_rate_hz: 2_000_000.0,
        }
    }
}

impl QueueCapacity {
    fn resolve(&self, block_len: usize) -> usize {
        match *self {
            QueueCapacity::Blocks(blocks) => blocks.max(1),
            QueueCapacity::Duration {
                seconds,
                sample_rate_hz,
            } => {
                let samples = (seconds * sample_rate_hz).max(0.0);
                let blocks = (samples / block_len.max(1) as f64).ceil() as usize;
                blocks.max(MIN_CAPACITY_BLOCKS)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed_blocks: u64,
    pub overruns: u64,
    pub underruns: u64,
    pub buffered_blocks: usize,
    pub buffered_samples: usize,
    pub capacity_blocks: usize,
}

/// Result of one pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulled {
    pub written: usize,
    pub underrun: bool,
}

struct QueueInner {
    blocks: VecDeque<SampleBlock>,
    // samples of the front block already handed out
    head_offset: usize,
    buffered: usize,
    capacity: QueueCapacity,
    capacity_blocks: Option<usize>,
    block_len: usize,
    closed: bool,
    stats: QueueStats,
}

impl QueueInner {
    fn evict_front(&mut self) {
        if let Some(block) = self.blocks.pop_front() {
            self.buffered -= block.len() - self.head_offset;
            self.head_offset = 0;
        }
    }

    fn trim_to_capacity(&mut self, capacity: usize) {
        while self.blocks.len() > capacity {
            self.evict_front();
            self.stats.overruns += 1;
        }
    }

    fn copy_into<S: IqSample>(&mut self, dest: &mut [S]) -> usize {
        let mut written = 0;

        while written < dest.len() {
            let Some(front) = self.blocks.front() else {
                break;
            };

            let copied = match S::view(&front.samples) {
                Some(view) => {
                    let available = &view[self.head_offset..];
                    let n = available.len().min(dest.len() - written);
                    dest[written..written + n].copy_from_slice(&available[..n]);
                    Some((n, view.len()))
                }
                None => None,
            };

            match copied {
                Some((n, block_len)) => {
                    written += n;
                    self.buffered -= n;
                    self.head_offset += n;
                    if self.head_offset == block_len {
                        self.blocks.pop_front();
                        self.head_offset = 0;
                    }
                }
                None => {
                    error!("Dropping a queued block in an unexpected sample format");
                    self.evict_front();
                }
            }
        }

        written
    }
}

/// Bounded FIFO of decoded blocks between the ingest worker and the consumer.
///
/// A full queue discards its oldest block on push. Pulls may be served from part of a block;
/// the remainder stays at the head.
pub struct SampleQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl SampleQueue {
    pub fn new(capacity: QueueCapacity) -> SampleQueue {
        let capacity_blocks = match capacity {
            QueueCapacity::Blocks(blocks) => Some(blocks.max(1)),
            QueueCapacity::Duration { .. } => None,
        };

        SampleQueue {
            inner: Mutex::new(QueueInner {
                blocks: VecDeque::new(),
                head_offset: 0,
                buffered: 0,
                capacity,
                capacity_blocks,
                block_len: 0,
                closed: false,
                stats: QueueStats::default(),
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a block. Returns true when the oldest block had to be discarded to make room.
    pub fn push(&self, block: SampleBlock) -> bool {
        if block.is_empty() {
            return false;
        }

        let mut inner = self.lock();
        if inner.closed {
            return false;
        }

        let capacity = match inner.capacity_blocks {
            Some(capacity) => capacity,
            None => {
                inner.block_len = block.len();
                let capacity = inner.capacity.resolve(block.len());
                debug!(
                    "Sample queue sized to {} blocks of {} samples",
                    capacity,
                    block.len()
                );
                inner.capacity_blocks = Some(capacity);
                capacity
            }
        };

        let mut overrun = false;
        if inner.blocks.len() >= capacity {
            inner.evict_front();
            inner.stats.overruns += 1;
            overrun = true;
        }

        inner.buffered += block.len();
        inner.blocks.push_back(block);
        inner.stats.pushed_blocks += 1;
        drop(inner);

        self.available.notify_one();
        overrun
    }

    /// Fill `dest` from the head of the queue, waiting up to `timeout` for samples to arrive.
    ///
    /// Returns early only once `dest` is full or the queue is closed. A short fill is reported
    /// as an underrun, never as an error.
    pub fn pull_into<S: IqSample>(&self, dest: &mut [S], timeout: Duration) -> Pulled {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        let mut written = inner.copy_into(dest);

        while written < dest.len() && !inner.closed {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let (guard, _) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
            written += inner.copy_into(&mut dest[written..]);
        }

        let underrun = written < dest.len();
        if underrun {
            inner.stats.underruns += 1;
        }

        Pulled { written, underrun }
    }

    /// Re-size an automatically sized queue for a new sample rate.
    pub fn set_sample_rate(&self, sample_rate_hz: f64) {
        let mut inner = self.lock();
        let QueueCapacity::Duration { seconds, .. } = inner.capacity else {
            return;
        };

        inner.capacity = QueueCapacity::Duration {
            seconds,
            sample_rate_hz,
        };

        if inner.block_len > 0 {
            let capacity = inner.capacity.resolve(inner.block_len);
            inner.capacity_blocks = Some(capacity);
            inner.trim_to_capacity(capacity);
        }
    }

    /// Wake every waiting consumer and refuse further pushes.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    /// Discard everything buffered. Returns the number of samples dropped.
    pub fn drain(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.buffered;
        inner.blocks.clear();
        inner.head_offset = 0;
        inner.buffered = 0;
        dropped
    }

    pub fn buffered_samples(&self) -> usize {
        self.lock().buffered
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            buffered_blocks: inner.blocks.len(),
            buffered_samples: inner.buffered,
            capacity_blocks: inner.capacity_blocks.unwrap_or(0),
            ..inner.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num::Complex;
    use spectran_decoders::Samples;
    use std::sync::Arc;
    use std::thread;

    fn block(sequence: u64, len: usize) -> SampleBlock {
        let samples = (0..len)
            .map(|i| Complex::new(sequence as i16, i as i16))
            .collect();
        let mut block = SampleBlock::new(Samples::Int16(samples));
        block.sequence = sequence;
        block
    }

    #[test]
    fn test_overrun_evicts_oldest() {
        let queue = SampleQueue::new(QueueCapacity::Blocks(3));
        for sequence in 0..3 {
            assert!(!queue.push(block(sequence, 4)));
        }

        assert!(queue.push(block(3, 4)));
        let stats = queue.stats();
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.buffered_blocks, 3);
        assert_eq!(stats.buffered_samples, 12);

        let mut out = [Complex::<i16>::default(); 12];
        let pulled = queue.pull_into(&mut out, Duration::ZERO);
        assert_eq!(pulled.written, 12);
        assert!(!pulled.underrun);
        let sequences: Vec<i16> = out.iter().step_by(4).map(|s| s.re).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn test_partial_block_stays_at_head() {
        let queue = SampleQueue::new(QueueCapacity::Blocks(4));
        queue.push(block(0, 5));
        queue.push(block(1, 5));

        let mut out = [Complex::<i16>::default(); 3];
        assert_eq!(queue.pull_into(&mut out, Duration::ZERO).written, 3);
        assert_eq!(out[2], Complex::new(0, 2));

        let mut out = [Complex::<i16>::default(); 4];
        assert_eq!(queue.pull_into(&mut out, Duration::ZERO).written, 4);
        assert_eq!(out, [Complex::new(0, 3), Complex::new(0, 4), Complex::new(1, 0), Complex::new(1, 1)]);
        assert_eq!(queue.buffered_samples(), 3);

        // evicting a partly consumed head only removes what was left of it
        let queue = SampleQueue::new(QueueCapacity::Blocks(1));
        queue.push(block(0, 5));
        let mut out = [Complex::<i16>::default(); 2];
        queue.pull_into(&mut out, Duration::ZERO);
        assert!(queue.push(block(1, 5)));
        assert_eq!(queue.buffered_samples(), 5);
    }

    #[test]
    fn test_underrun_returns_short_after_timeout() {
        let queue = SampleQueue::new(QueueCapacity::Blocks(4));
        queue.push(block(0, 10));

        let mut out = [Complex::<i16>::default(); 100];
        let started = Instant::now();
        let pulled = queue.pull_into(&mut out, Duration::from_millis(50));
        let elapsed = started.elapsed();

        assert_eq!(pulled.written, 10);
        assert!(pulled.underrun);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500));
        assert_eq!(queue.stats().underruns, 1);
    }

    #[test]
    fn test_close_wakes_waiting_consumer() {
        let queue = Arc::new(SampleQueue::new(QueueCapacity::Blocks(4)));
        let closer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });

        let mut out = [Complex::<i16>::default(); 10];
        let started = Instant::now();
        let pulled = queue.pull_into(&mut out, Duration::from_secs(5));
        assert_eq!(pulled.written, 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(handle.join().is_ok());

        assert!(!queue.push(block(0, 4)));
        assert_eq!(queue.buffered_samples(), 0);
    }

    #[test]
    fn test_fifo_across_threads() {
        let queue = Arc::new(SampleQueue::new(QueueCapacity::Blocks(10_000)));
        let producer_queue = queue.clone();
        let producer = thread::spawn(move || {
            for sequence in 0..500 {
                producer_queue.push(block(sequence, 7));
                if sequence % 50 == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        });

        let mut received = Vec::new();
        let mut out = [Complex::<i16>::default(); 33];
        while received.len() < 500 * 7 {
            let pulled = queue.pull_into(&mut out, Duration::from_millis(500));
            assert!(pulled.written > 0, "producer stalled");
            received.extend_from_slice(&out[..pulled.written]);
        }
        assert!(producer.join().is_ok());

        let expected: Vec<Complex<i16>> = (0..500)
            .flat_map(|sequence| (0..7).map(move |i| Complex::new(sequence as i16, i as i16)))
            .collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_duration_capacity_follows_sample_rate() {
        let queue = SampleQueue::new(QueueCapacity::Duration {
            seconds: 1.0,
            sample_rate_hz: 1000.0,
        });
        assert_eq!(queue.stats().capacity_blocks, 0);

        queue.push(block(0, 100));
        assert_eq!(queue.stats().capacity_blocks, 10);

        for sequence in 1..10 {
            queue.push(block(sequence, 100));
        }
        queue.set_sample_rate(500.0);
        let stats = queue.stats();
        assert_eq!(stats.capacity_blocks, 5);
        assert_eq!(stats.buffered_blocks, 5);
        assert_eq!(stats.overruns, 5);

        queue.set_sample_rate(10.0);
        assert_eq!(queue.stats().capacity_blocks, MIN_CAPACITY_BLOCKS);
        assert_eq!(queue.drain(), MIN_CAPACITY_BLOCKS * 100);
    }
}
