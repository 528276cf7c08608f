/// Fixed-capacity byte buffer that overwrites its oldest bytes once full.
#[derive(Debug)]
pub(crate) struct RingBuffer {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
}

impl RingBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        RingBuffer {
            buf: vec![0; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Appends `data`, evicting the oldest bytes when it would overflow.
    pub(crate) fn write_evicting(&mut self, data: &[u8]) {
        let cap = self.capacity();
        if data.len() >= cap {
            self.buf.copy_from_slice(&data[data.len() - cap..]);
            self.start = 0;
            self.len = cap;
            return;
        }

        let pos = (self.start + self.len) % cap;
        let first = data.len().min(cap - pos);
        self.buf[pos..pos + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);

        let new_len = self.len + data.len();
        if new_len > cap {
            self.start = (self.start + new_len - cap) % cap;
            self.len = cap;
        } else {
            self.len = new_len;
        }
    }

    /// Rotates the retained bytes into one oldest-first slice.
    pub(crate) fn make_contiguous(&mut self) -> &[u8] {
        self.buf.rotate_left(self.start);
        self.start = 0;
        &self.buf[..self.len]
    }
}
