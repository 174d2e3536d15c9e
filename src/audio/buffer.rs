//! Byte FIFO shared between audio threads
//!
//! Carries raw PCM between a producer (device callback, decoder) and a
//! consumer (engine loop, device callback). Reads can block until data
//! arrives or the FIFO is closed.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct FifoInner {
    data: VecDeque<u8>,
    closed: bool,
}

/// Thread-safe byte queue
pub struct FifoBuffer {
    inner: Mutex<FifoInner>,
    readable: Condvar,
    /// Maximum queued bytes, `None` for unbounded
    capacity: Option<usize>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl FifoBuffer {
    /// Create an unbounded FIFO
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Create a FIFO holding at most `capacity` bytes; excess writes are dropped
    pub fn bounded(capacity: usize) -> Self {
        Self::with_limit(Some(capacity))
    }

    fn with_limit(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(FifoInner {
                data: VecDeque::with_capacity(capacity.unwrap_or(8192)),
                closed: false,
            }),
            readable: Condvar::new(),
            capacity,
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Append bytes, returning how many were accepted.
    ///
    /// Writes after `close` are discarded.
    pub fn write(&self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return 0;
        }

        let accepted = match self.capacity {
            Some(capacity) => bytes.len().min(capacity.saturating_sub(inner.data.len())),
            None => bytes.len(),
        };
        if accepted < bytes.len() {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }

        inner.data.extend(&bytes[..accepted]);
        drop(inner);

        if accepted > 0 {
            self.readable.notify_all();
        }
        accepted
    }

    /// Block until data is queued or the FIFO is closed, then read what is available.
    ///
    /// Returns 0 only once the FIFO is closed and drained.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let mut inner = self.inner.lock();
        while inner.data.is_empty() && !inner.closed {
            self.readable.wait(&mut inner);
        }
        Self::drain_into(&mut inner.data, buf)
    }

    /// Read whatever is queued without blocking
    pub fn read_available(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let read = Self::drain_into(&mut inner.data, buf);
        if read < buf.len() {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        read
    }

    fn drain_into(data: &mut VecDeque<u8>, buf: &mut [u8]) -> usize {
        let count = buf.len().min(data.len());
        for (dst, src) in buf.iter_mut().zip(data.drain(..count)) {
            *dst = src;
        }
        count
    }

    /// Close the FIFO, waking any blocked reader
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.readable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Discard queued data
    pub fn clear(&self) {
        self.inner.lock().data.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().data.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of writes that were truncated because the FIFO was full
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Number of non-blocking reads that could not be fully satisfied
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

impl Default for FifoBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to a FIFO
pub type SharedFifo = Arc<FifoBuffer>;

/// Blocking reader over a FIFO; reports end of stream after close.
///
/// Reads fill the whole buffer unless the FIFO is closed and drained first,
/// so a short read always means end of stream.
pub struct FifoReader(pub SharedFifo);

impl Read for FifoReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let read = self.0.read(&mut buf[filled..]);
            if read == 0 {
                break;
            }
            filled += read;
        }
        Ok(filled)
    }
}

/// Writer appending to a FIFO
pub struct FifoWriter(pub SharedFifo);

impl Write for FifoWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.0.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "fifo closed"));
        }
        // Overflow is dropped silently and counted on the FIFO
        self.0.write(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Render source that never runs short.
///
/// Missing audio is replaced by silence so the render loop keeps going while
/// peers are quiet; end of stream is reported only after the FIFO is closed.
pub struct PlayoutReader(pub SharedFifo);

impl Read for PlayoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.0.is_closed() && self.0.is_empty() {
            return Ok(0);
        }
        let read = self.0.read_available(buf);
        buf[read..].fill(0);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_basic() {
        let fifo = FifoBuffer::new();
        assert_eq!(fifo.write(&[1, 2, 3, 4]), 4);
        assert_eq!(fifo.len(), 4);

        let mut buf = [0u8; 3];
        assert_eq!(fifo.read(&mut buf), 3);
        assert_eq!(buf, [1, 2, 3]);

        let mut buf = [0u8; 8];
        assert_eq!(fifo.read_available(&mut buf), 1);
        assert_eq!(buf[0], 4);
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_bounded_overflow() {
        let fifo = FifoBuffer::bounded(4);
        assert_eq!(fifo.write(&[0; 3]), 3);
        assert_eq!(fifo.write(&[0; 3]), 1);
        assert_eq!(fifo.len(), 4);
        assert_eq!(fifo.overflow_count(), 1);
    }

    #[test]
    fn test_blocking_read_wakes_on_write() {
        let fifo = Arc::new(FifoBuffer::new());
        let producer = fifo.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.write(&[9, 9]);
        });

        let mut buf = [0u8; 4];
        assert_eq!(fifo.read(&mut buf), 2);
        handle.join().unwrap();
    }

    #[test]
    fn test_close_ends_blocking_read() {
        let fifo = Arc::new(FifoBuffer::new());
        let closer = fifo.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });

        let mut reader = FifoReader(fifo.clone());
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        handle.join().unwrap();

        assert_eq!(fifo.write(&[1]), 0);
    }

    #[test]
    fn test_reader_fills_across_writes() {
        let fifo = Arc::new(FifoBuffer::new());
        let producer = fifo.clone();

        let handle = thread::spawn(move || {
            producer.write(&[1, 2]);
            thread::sleep(Duration::from_millis(20));
            producer.write(&[3, 4, 5]);
            thread::sleep(Duration::from_millis(20));
            producer.close();
        });

        let mut reader = FifoReader(fifo);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);

        // Only a closed FIFO produces a short read
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 5);
        handle.join().unwrap();
    }

    #[test]
    fn test_playout_pads_with_silence() {
        let fifo = Arc::new(FifoBuffer::new());
        fifo.write(&[7, 7]);

        let mut reader = PlayoutReader(fifo.clone());
        let mut buf = [1u8; 6];
        assert_eq!(reader.read(&mut buf).unwrap(), 6);
        assert_eq!(buf, [7, 7, 0, 0, 0, 0]);

        fifo.close();
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_writer_fails_after_close() {
        let fifo = Arc::new(FifoBuffer::new());
        let mut writer = FifoWriter(fifo.clone());
        writer.write_all(&[1, 2]).unwrap();
        fifo.close();
        assert!(writer.write(&[3]).is_err());
    }
}
