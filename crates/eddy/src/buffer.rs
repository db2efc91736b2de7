const DEFAULT_CAPACITY: usize = 1024;

/// Growable byte buffer with separate read and write cursors.
///
/// Readable bytes live in `[r, w)`, free space behind the writer in
/// `[w, cap)`, and reclaimable space in front of the reader in `[0, r)`.
/// A write that does not fit behind the writer first compacts the
/// readable region to offset 0 if that frees enough room, and only
/// otherwise grows the backing storage. The buffer never shrinks.
pub struct Buffer {
    storage: Vec<u8>,
    r: usize,
    w: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self { storage: vec![0; DEFAULT_CAPACITY], r: 0, w: 0 }
    }
}

impl Buffer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { storage: vec![0; cap.max(1)], r: 0, w: 0 }
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable_len(&self) -> usize {
        self.w - self.r
    }

    /// The readable bytes, without consuming them.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.storage[self.r..self.w]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.r == self.w
    }

    #[inline]
    fn back_free(&self) -> usize {
        self.storage.len() - self.w
    }

    #[inline]
    fn front_free(&self) -> usize {
        self.r
    }

    /// Makes room for `len` more bytes behind the write cursor,
    /// compacting the readable region to the front when that suffices
    /// and growing the storage otherwise.
    fn ensure_writable(&mut self, len: usize) {
        if self.back_free() >= len {
            return;
        }
        if self.front_free() + self.back_free() >= len {
            let readable = self.readable_len();
            self.storage.copy_within(self.r..self.w, 0);
            self.r = 0;
            self.w = readable;
        } else {
            let new_len = self.w + len;
            tracing::debug!(new_len, "buffer resized");
            self.storage.resize(new_len, 0);
        }
    }

    /// Appends `data` at the write cursor.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.ensure_writable(data.len());
        self.storage[self.w..self.w + data.len()].copy_from_slice(data);
        self.w += data.len();
    }

    /// Appends the readable bytes of `other` without consuming them there.
    pub fn write_buffer(&mut self, other: &Buffer) {
        self.write(other.readable());
    }

    /// Copies the first `dst.len()` readable bytes into `dst` without
    /// consuming them.
    ///
    /// # Panics
    /// Panics if fewer than `dst.len()` bytes are readable.
    pub fn read_into(&self, dst: &mut [u8]) {
        assert!(dst.len() <= self.readable_len(), "buffer underflow");
        dst.copy_from_slice(&self.storage[self.r..self.r + dst.len()]);
    }

    /// Advances the read cursor past `n` bytes.
    ///
    /// # Panics
    /// Panics if `n` exceeds the readable size.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.readable_len(), "buffer underflow");
        self.r += n;
    }

    /// The first `n` readable bytes, without consuming them.
    ///
    /// # Panics
    /// Panics if fewer than `n` bytes are readable.
    pub fn peek(&self, n: usize) -> &[u8] {
        assert!(n <= self.readable_len(), "buffer underflow");
        &self.storage[self.r..self.r + n]
    }

    /// Consumes and returns `n` bytes as a lossily-decoded string.
    ///
    /// # Panics
    /// Panics if fewer than `n` bytes are readable.
    pub fn read_string(&mut self, n: usize) -> String {
        let s = String::from_utf8_lossy(self.peek(n)).into_owned();
        self.consume(n);
        s
    }

    /// The first line, up to and including the `\n` delimiter, without
    /// consuming it. `None` if no delimiter is buffered yet.
    pub fn peek_line(&self) -> Option<&[u8]> {
        let pos = self.readable().iter().position(|&b| b == b'\n')?;
        Some(&self.storage[self.r..=self.r + pos])
    }

    /// Consumes and returns the first line, delimiter included.
    pub fn read_line(&mut self) -> Option<Vec<u8>> {
        let line = self.peek_line()?.to_vec();
        self.consume(line.len());
        Some(line)
    }

    /// Resets both cursors. Capacity is kept.
    pub fn clear(&mut self) {
        self.r = 0;
        self.w = 0;
    }
}
