//! Growable byte queue with read/write cursors and a prependable region.
//!
//! Mirrors the classic `Buffer` used by small reactor-style HTTP servers:
//! appending either fits the current writable tail, compacts by shifting
//! the readable region to offset 0, or grows the backing store.

use std::io::{self, IoSliceMut, Read, Write};

/// Scratch space used as the second scatter-read segment so one syscall can
/// drain a socket that has more queued data than the buffer's writable tail.
const SPILL_LEN: usize = 65_535;

pub struct ByteBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(init: usize) -> Self {
        ByteBuffer {
            buf: vec![0u8; init],
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    pub fn prependable(&self) -> usize {
        self.read_pos
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_pos..]
    }

    pub fn has_written(&mut self, len: usize) {
        self.write_pos += len;
    }

    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable());
        self.read_pos += len;
    }

    /// Retrieve bytes up to (but not including) `offset` within the
    /// readable region, e.g. the position of a CRLF found by the parser.
    pub fn retrieve_until(&mut self, offset: usize) {
        self.retrieve(offset - self.read_pos);
    }

    pub fn retrieve_all(&mut self) {
        self.buf.iter_mut().for_each(|b| *b = 0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write_pos;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable() + self.prependable() < len {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Scatter-read from `src`: the buffer's writable tail plus a stack
    /// spill buffer in a single syscall. Any bytes landing in the spill are
    /// appended (triggering a grow/compact if needed).
    pub fn read_fd(&mut self, src: &mut impl Read) -> io::Result<usize> {
        let mut spill = [0u8; SPILL_LEN];
        let writable = self.writable();
        let n = {
            let mut slices = [
                IoSliceMut::new(&mut self.buf[self.write_pos..]),
                IoSliceMut::new(&mut spill),
            ];
            src.read_vectored(&mut slices)?
        };
        if n <= writable {
            self.has_written(n);
        } else {
            self.write_pos = self.buf.len();
            self.append(&spill[..n - writable]);
        }
        Ok(n)
    }

    /// Scatter-write the readable region to `dst`; returns bytes written
    /// and retires them from the buffer.
    pub fn write_fd(&mut self, dst: &mut impl Write) -> io::Result<usize> {
        let n = dst.write(self.peek())?;
        self.retrieve(n);
        Ok(n)
    }

}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
