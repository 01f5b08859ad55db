use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Counters describing how a [`WriteBuffer`] reached the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Flushes triggered because an append would exceed the ceiling.
    pub forced: u64,
    /// Keyframe flushes after the minimum interval elapsed.
    pub scheduled: u64,
    /// Explicit flushes (finalize, periodic sync).
    pub explicit: u64,
    /// Total bytes handed to the writer.
    pub bytes_written: u64,
}

/// In-process write accumulator in front of the MP4 file.
///
/// Never holds more than `max_size` bytes: an append that would cross the
/// ceiling flushes first, and an append larger than the ceiling on its own
/// goes straight to the writer.
#[derive(Debug)]
pub struct WriteBuffer {
    data: Vec<u8>,
    max_size: usize,
    min_flush_interval: Duration,
    last_flush: Instant,
    stats: FlushStats,
}

impl WriteBuffer {
    pub fn new(max_size: usize, min_flush_interval: Duration) -> Self {
        Self {
            data: Vec::with_capacity(max_size),
            max_size,
            min_flush_interval,
            last_flush: Instant::now(),
            stats: FlushStats::default(),
        }
    }

    /// Buffer `bytes`, flushing to `out` first if the ceiling would be crossed.
    pub fn append<W: Write>(&mut self, out: &mut W, bytes: &[u8]) -> io::Result<()> {
        if self.data.len() + bytes.len() > self.max_size {
            self.stats.forced += 1;
            self.write_pending(out)?;
            if bytes.len() > self.max_size {
                out.write_all(bytes)?;
                self.stats.bytes_written += bytes.len() as u64;
                return Ok(());
            }
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Flush if the minimum interval has elapsed since the last flush.
    ///
    /// Called on keyframe boundaries. Returns whether anything was written.
    pub fn flush_if_due<W: Write>(&mut self, out: &mut W) -> io::Result<bool> {
        if self.data.is_empty() || self.last_flush.elapsed() < self.min_flush_interval {
            return Ok(false);
        }
        self.stats.scheduled += 1;
        self.write_pending(out)?;
        Ok(true)
    }

    /// Write everything pending and flush `out`.
    pub fn flush<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        self.stats.explicit += 1;
        self.write_pending(out)?;
        out.flush()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> FlushStats {
        self.stats
    }

    fn write_pending<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        if !self.data.is_empty() {
            out.write_all(&self.data)?;
            self.stats.bytes_written += self.data.len() as u64;
            tracing::trace!(bytes = self.data.len(), "write buffer flushed");
            self.data.clear();
        }
        self.last_flush = Instant::now();
        Ok(())
    }
}
