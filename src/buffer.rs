//! Byte staging buffer shared by the transport
//!
//! All bulk data moves through one of these: CBW bytes on their way in,
//! response data and CSWs on their way out. The buffer is linear rather
//! than circular; the read region is shifted down to offset zero whenever
//! an incoming write would not fit behind it.

use core::borrow::BorrowMut;
use core::cmp::min;

pub struct Buffer<T: BorrowMut<[u8]>> {
    mem: T,
    /// Offset of the first queued byte
    start: usize,
    /// Offset one past the last queued byte
    end: usize,
}

impl<T: BorrowMut<[u8]>> Buffer<T> {
    pub fn new(mem: T) -> Buffer<T> {
        Buffer {
            mem,
            start: 0,
            end: 0,
        }
    }

    /// Number of queued bytes waiting to be consumed
    pub fn queued(&self) -> usize {
        self.end - self.start
    }

    /// Free space behind the queued region
    pub fn room(&self) -> usize {
        self.mem.borrow().len() - self.end
    }

    /// Appends bytes, compacting first if needed. Returns the number of
    /// bytes actually stored.
    pub fn push(&mut self, data: &[u8]) -> usize {
        if self.room() < data.len() {
            self.compact();
        }
        let count = min(self.room(), data.len());
        let mem = self.mem.borrow_mut();
        mem[self.end..(self.end + count)].copy_from_slice(&data[..count]);
        self.end += count;
        debug_assert!(self.end <= mem.len());
        count
    }

    /// Lets `f` produce up to `max_count` bytes directly into free space.
    ///
    /// Fails with `overflow_err` if `max_count` bytes cannot be made
    /// available even after compaction. `f` returns how many bytes it
    /// actually produced.
    pub fn fill_with<E>(
        &mut self,
        max_count: usize,
        overflow_err: E,
        f: impl FnOnce(&mut [u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        if self.room() < max_count {
            self.compact();
            if self.room() < max_count {
                return Err(overflow_err);
            }
        }

        let end = self.end;
        let mem = self.mem.borrow_mut();
        let produced = f(&mut mem[end..(end + max_count)])?;
        self.end += min(produced, max_count);
        debug_assert!(self.end <= mem.len());
        Ok(min(produced, max_count))
    }

    /// Lets `f` consume from the queued region. `f` returns how many bytes
    /// it consumed; those are dequeued.
    pub fn pop_with<E>(&mut self, f: impl FnOnce(&mut [u8]) -> Result<usize, E>) -> Result<usize, E> {
        let (start, end) = (self.start, self.end);
        let mem = self.mem.borrow_mut();
        let consumed = f(&mut mem[start..end])?;
        let consumed = min(consumed, end - start);
        self.start += consumed;
        debug_assert!(self.start <= self.end);
        Ok(consumed)
    }

    /// Drops all queued bytes.
    pub fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn compact(&mut self) {
        if self.start == self.end {
            self.reset();
            return;
        }
        let (start, len) = (self.start, self.queued());
        self.mem.borrow_mut().copy_within(start..(start + len), 0);
        self.start = 0;
        self.end = len;
    }
}
