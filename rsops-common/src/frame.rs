/// Read-only view of one packet.
///
/// Every accessor is bounds checked and returns `None` instead of reading
/// past the end of the packet. Multi-byte fields are decoded big-endian.
pub trait Frame {
    /// Total number of bytes in the packet
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the byte at `offset`
    fn load_u8(&self, offset: usize) -> Option<u8>;

    /// Read the network order half-word at `offset`
    fn load_be_u16(&self, offset: usize) -> Option<u16>;

    /// Read the network order word at `offset`
    fn load_be_u32(&self, offset: usize) -> Option<u32>;
}

impl Frame for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn load_u8(&self, offset: usize) -> Option<u8> {
        self.get(offset).copied()
    }

    fn load_be_u16(&self, offset: usize) -> Option<u16> {
        let end = offset.checked_add(2)?;
        let bytes = self.get(offset..end)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn load_be_u32(&self, offset: usize) -> Option<u32> {
        let end = offset.checked_add(4)?;
        let bytes = self.get(offset..end)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
