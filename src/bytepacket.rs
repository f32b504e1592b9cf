//! Flat little-endian byte packets used for plan-cache persistence and for
//! shipping graph views between processes.

/// An append-only buffer of little-endian `u64` words with a read cursor.
///
/// # Examples
/// ```
/// # use tne::bytepacket::BytePacket;
/// let mut packet = BytePacket::new();
/// packet.append_u64(17);
/// packet.append_slice(&[1, 2, 3]);
/// let mut packet = BytePacket::from_bytes(packet.into_bytes());
/// assert_eq!(packet.extract_u64(), Some(17));
/// assert_eq!(packet.extract_vec(), Some(vec![1, 2, 3]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytePacket {
    buffer: Vec<u8>,
    cursor: usize,
}

impl BytePacket {
    /// Creates an empty packet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing byte buffer, placing the read cursor at the start.
    #[must_use]
    pub fn from_bytes(buffer: Vec<u8>) -> Self {
        Self { buffer, cursor: 0 }
    }

    /// Consumes the packet, returning the raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Raw byte view of the packet.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// Appends a single word.
    pub fn append_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends an `f64` as its raw bit pattern.
    pub fn append_f64(&mut self, value: f64) {
        self.append_u64(value.to_bits());
    }

    /// Appends a length-prefixed vector of words.
    pub fn append_slice(&mut self, values: &[u64]) {
        self.append_u64(values.len() as u64);
        for &value in values {
            self.append_u64(value);
        }
    }

    /// Reads the next word, advancing the cursor. Returns `None` when the
    /// packet is exhausted.
    pub fn extract_u64(&mut self) -> Option<u64> {
        let bytes = self.buffer.get(self.cursor..self.cursor + 8)?;
        self.cursor += 8;
        Some(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Reads the next word as an `f64` bit pattern.
    pub fn extract_f64(&mut self) -> Option<f64> {
        self.extract_u64().map(f64::from_bits)
    }

    /// Reads a length-prefixed vector of words.
    pub fn extract_vec(&mut self) -> Option<Vec<u64>> {
        let length = self.extract_u64()? as usize;
        if self.remaining() < length * 8 {
            return None;
        }
        Some((0..length).map(|_| self.extract_u64().unwrap()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut packet = BytePacket::new();
        packet.append_u64(42);
        packet.append_slice(&[]);
        packet.append_slice(&[u64::MAX, 0, 7]);
        packet.append_f64(-1.5);

        let mut unpacked = BytePacket::from_bytes(packet.into_bytes());
        assert_eq!(unpacked.extract_u64(), Some(42));
        assert_eq!(unpacked.extract_vec(), Some(vec![]));
        assert_eq!(unpacked.extract_vec(), Some(vec![u64::MAX, 0, 7]));
        assert_eq!(unpacked.extract_f64(), Some(-1.5));
        assert_eq!(unpacked.extract_u64(), None);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut packet = BytePacket::new();
        packet.append_u64(0x0102_0304_0506_0708);
        assert_eq!(
            packet.as_bytes(),
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_truncated_vector() {
        let mut packet = BytePacket::new();
        packet.append_u64(5);
        packet.append_u64(1);
        let mut unpacked = BytePacket::from_bytes(packet.into_bytes());
        assert_eq!(unpacked.extract_vec(), None);
    }
}
