/// Owns the variable-length buffers staged while encoding one stored object.
///
/// Encoders write the index of a staged buffer into their slot. The buffers become the object's
/// heap when the container writes the object, so they live exactly as long as the record which
/// refers to them.
#[derive(Debug, Default)]
pub struct WriteSession {
    staged: Vec<Vec<u8>>,
}

impl WriteSession {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `buf` and return its heap index.
    pub fn stage(&mut self, buf: Vec<u8>) -> u64 {
        self.staged.push(buf);
        (self.staged.len() - 1) as u64
    }

    /// Number of staged buffers.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Has nothing been staged?
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Release the staged buffers as an object heap.
    pub fn into_heap(self) -> Vec<Vec<u8>> {
        self.staged
    }
}
