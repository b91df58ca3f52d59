//! Cursor byte buffer used for staged socket I/O.
//!
//! A `Buffer` is one contiguous allocation with separate read and write
//! cursors. The readable region is `[read_ptr, write_ptr)`, the writable
//! region `[write_ptr, capacity)`. Whenever a mutation leaves the readable
//! region empty both cursors rewind to zero so the head of the allocation
//! is reusable without shifting bytes.

/// Growable or fixed-capacity byte buffer with distinct read/write cursors.
pub struct Buffer {
    mem: Vec<u8>,
    read_ptr: usize,
    write_ptr: usize,
    fixed: bool,
}

impl Buffer {
    /// Create a growable buffer with `capacity` bytes preallocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            mem: vec![0u8; capacity],
            read_ptr: 0,
            write_ptr: 0,
            fixed: false,
        }
    }

    /// Create a fixed-capacity buffer. Writes that would overflow fail
    /// instead of growing.
    pub fn fixed(capacity: usize) -> Self {
        Buffer {
            mem: vec![0u8; capacity],
            read_ptr: 0,
            write_ptr: 0,
            fixed: true,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mem.len()
    }

    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Bytes available to read: `write_ptr - read_ptr`.
    #[inline]
    pub fn readable_size(&self) -> usize {
        self.write_ptr - self.read_ptr
    }

    /// Bytes available to write without growing: `capacity - write_ptr`.
    #[inline]
    pub fn writable_size(&self) -> usize {
        self.mem.len() - self.write_ptr
    }

    /// Yield up to `size` readable bytes and advance the read cursor.
    ///
    /// The returned slice stays valid until the next mutation even though
    /// the cursors may have rewound, since rewinding moves no bytes.
    pub fn read(&mut self, size: usize) -> &[u8] {
        let n = size.min(self.readable_size());
        let start = self.read_ptr;
        self.read_ptr += n;
        self.rewind_if_empty();
        &self.mem[start..start + n]
    }

    /// Append `data`, growing a non-fixed buffer as needed. Returns false
    /// (and writes nothing) only when a fixed buffer would overflow.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if self.writable_size() < data.len() {
            if self.fixed {
                return false;
            }
            let ncap = data.len().max(self.capacity()) * 2;
            self.grow(ncap);
        }
        self.mem[self.write_ptr..self.write_ptr + data.len()].copy_from_slice(data);
        self.write_ptr += data.len();
        true
    }

    /// Append up to `writable_size()` bytes of `data` without growing.
    /// Returns the number of bytes actually written.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = self.writable_size().min(data.len());
        if n == 0 {
            return 0;
        }
        self.mem[self.write_ptr..self.write_ptr + n].copy_from_slice(&data[..n]);
        self.write_ptr += n;
        n
    }

    /// Append `data`, growing to exactly the needed size so that afterwards
    /// `write_ptr == capacity`. Used to absorb overflow bytes already read
    /// into a scratch region. Fails only on a fixed buffer.
    pub fn inject(&mut self, data: &[u8]) -> bool {
        if self.writable_size() < data.len() {
            if self.fixed {
                return false;
            }
            self.grow(data.len());
        }
        self.mem[self.write_ptr..self.write_ptr + data.len()].copy_from_slice(data);
        self.write_ptr += data.len();
        debug_assert_eq!(self.write_ptr, self.mem.len());
        true
    }

    /// Grow the writable region by at least `additional` bytes.
    ///
    /// Only the readable portion is carried over; the read cursor resets
    /// to zero.
    pub fn reserve(&mut self, additional: usize) {
        if additional == 0 {
            return;
        }
        self.grow(additional);
    }

    fn grow(&mut self, extra: usize) {
        let readable = self.readable_size();
        let mut mem = vec![0u8; readable + extra];
        mem[..readable].copy_from_slice(&self.mem[self.read_ptr..self.write_ptr]);
        self.mem = mem;
        self.read_ptr = 0;
        self.write_ptr = readable;
    }

    #[inline]
    fn rewind_if_empty(&mut self) {
        if self.read_ptr == self.write_ptr {
            self.read_ptr = 0;
            self.write_ptr = 0;
        }
    }

    /// Borrow the contiguous writable region for direct (scatter/gather)
    /// I/O. Dropping the accessor commits the bytes set via
    /// [`WriteAccessor::set_committed`].
    pub fn write_accessor(&mut self) -> WriteAccessor<'_> {
        WriteAccessor {
            buf: self,
            committed: 0,
        }
    }

    /// Borrow the contiguous readable region for direct I/O. Dropping the
    /// accessor consumes the bytes set via [`ReadAccessor::set_committed`].
    pub fn read_accessor(&mut self) -> ReadAccessor<'_> {
        ReadAccessor {
            buf: self,
            committed: 0,
        }
    }
}

/// Transient borrow of a buffer's writable region.
pub struct WriteAccessor<'a> {
    buf: &'a mut Buffer,
    committed: usize,
}

impl WriteAccessor<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.writable_size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw pointer to the start of the writable region.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        unsafe { self.buf.mem.as_mut_ptr().add(self.buf.write_ptr) }
    }

    /// Record how many bytes were written into the region; applied to the
    /// write cursor when the accessor drops.
    #[inline]
    pub fn set_committed(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.committed = n;
    }
}

impl Drop for WriteAccessor<'_> {
    fn drop(&mut self) {
        self.buf.write_ptr += self.committed.min(self.buf.writable_size());
    }
}

/// Transient borrow of a buffer's readable region.
pub struct ReadAccessor<'a> {
    buf: &'a mut Buffer,
    committed: usize,
}

impl ReadAccessor<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.readable_size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw pointer to the start of the readable region.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        unsafe { self.buf.mem.as_ptr().add(self.buf.read_ptr) }
    }

    /// Record how many bytes were consumed from the region; applied to the
    /// read cursor when the accessor drops.
    #[inline]
    pub fn set_committed(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.committed = n;
    }
}

impl Drop for ReadAccessor<'_> {
    fn drop(&mut self) {
        self.buf.read_ptr += self.committed.min(self.buf.readable_size());
        self.buf.rewind_if_empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let mut buf = Buffer::with_capacity(8);
        assert!(buf.write(b"hello "));
        assert!(buf.write(b"world"));
        assert_eq!(buf.read(6), b"hello ");
        assert_eq!(buf.read(16), b"world");
        assert_eq!(buf.readable_size(), 0);
    }

    #[test]
    fn cursors_rewind_when_drained() {
        let mut buf = Buffer::with_capacity(16);
        buf.write(b"abcd");
        buf.read(4);
        // Empty readable region means both cursors are back at the head.
        assert_eq!(buf.writable_size(), buf.capacity());
        buf.write(b"efgh");
        assert_eq!(buf.read(4), b"efgh");
    }

    #[test]
    fn interleaved_fifo_order() {
        let mut buf = Buffer::with_capacity(4);
        buf.write(b"ab");
        assert_eq!(buf.read(1), b"a");
        buf.write(b"cd");
        assert_eq!(buf.read(3), b"bcd");
    }

    #[test]
    fn growth_preserves_readable_bytes() {
        let mut buf = Buffer::with_capacity(4);
        buf.write(b"abc");
        buf.read(1);
        assert!(buf.write(&[b'x'; 64]));
        assert!(buf.capacity() >= 66);
        assert_eq!(&buf.read(2)[..], b"bc");
        assert_eq!(buf.read(64), &[b'x'; 64][..]);
    }

    #[test]
    fn fixed_overflow_is_a_no_op() {
        let mut buf = Buffer::fixed(4);
        assert!(buf.write(b"abcd"));
        assert!(!buf.write(b"e"));
        assert_eq!(buf.capacity(), 4);
        assert_eq!(buf.read(4), b"abcd");
    }

    #[test]
    fn fill_writes_at_most_the_writable_span() {
        let mut buf = Buffer::fixed(4);
        assert_eq!(buf.fill(b"abcdef"), 4);
        assert_eq!(buf.fill(b"gh"), 0);
        assert_eq!(buf.read(4), b"abcd");
    }

    #[test]
    fn inject_grows_to_exact_capacity() {
        let mut buf = Buffer::with_capacity(0);
        assert!(buf.inject(b"abcdef"));
        assert_eq!(buf.capacity(), 6);
        assert_eq!(buf.writable_size(), 0);
        assert_eq!(buf.read(6), b"abcdef");
    }

    #[test]
    fn inject_fails_on_fixed_overflow() {
        let mut buf = Buffer::fixed(2);
        buf.write(b"ab");
        assert!(!buf.inject(b"c"));
        assert_eq!(buf.read(2), b"ab");
    }

    #[test]
    fn write_accessor_commits_on_drop() {
        let mut buf = Buffer::with_capacity(8);
        {
            let mut acc = buf.write_accessor();
            assert_eq!(acc.len(), 8);
            unsafe {
                std::ptr::copy_nonoverlapping(b"abc".as_ptr(), acc.as_mut_ptr(), 3);
            }
            acc.set_committed(3);
        }
        assert_eq!(buf.readable_size(), 3);
        assert_eq!(buf.read(3), b"abc");
    }

    #[test]
    fn read_accessor_consumes_and_rewinds() {
        let mut buf = Buffer::with_capacity(8);
        buf.write(b"abcd");
        {
            let mut acc = buf.read_accessor();
            assert_eq!(acc.len(), 4);
            acc.set_committed(4);
        }
        assert_eq!(buf.readable_size(), 0);
        assert_eq!(buf.writable_size(), buf.capacity());
    }

    #[test]
    fn partial_accessor_commit_keeps_remainder() {
        let mut buf = Buffer::with_capacity(8);
        buf.write(b"abcd");
        {
            let mut acc = buf.read_accessor();
            acc.set_committed(2);
        }
        assert_eq!(buf.read(4), b"cd");
    }
}
