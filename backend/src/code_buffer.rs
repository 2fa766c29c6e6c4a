/// Growable emission buffer for one region's machine code.
///
/// All extra-region references are emitted in absolute or
/// state-relative form, so the finished bytes are copied verbatim
/// into their final home in the code cache.
#[derive(Default)]
pub struct CodeBuffer {
    buf: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
        }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        self.buf.push(val);
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Patch a rel32 at `offset` (for label back-patching).
    #[inline]
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.buf[offset..offset + 4].try_into().unwrap())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}
