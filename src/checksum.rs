/// Additive frame checksum.
///
/// The scalar fields (length, message type, status, loop count) are summed as
/// integer values, while the timestamp and parameters are summed byte by byte
/// over their little-endian encodings. Everything is reduced mod 256.
#[derive(Debug, Clone, Copy)]
pub struct Checksum {
    sum: u8,
}

impl Checksum {
    /// Start a digest seeded with the scalar fields of a frame.
    pub fn new(length: u16, message_type: u8, status: u8, loop_count: u8) -> Checksum {
        // Only the low byte of length survives the final mod 256
        let sum = (length as u8)
            .wrapping_add(message_type)
            .wrapping_add(status)
            .wrapping_add(loop_count);
        Checksum { sum }
    }

    /// Fold raw payload bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.sum = data.iter().fold(self.sum, |acc, b| acc.wrapping_add(*b));
    }

    pub fn finalize(self) -> u8 {
        self.sum
    }
}

/// One-shot checksum over already encoded timestamp and parameter bytes.
pub fn checksum(
    length: u16,
    message_type: u8,
    status: u8,
    loop_count: u8,
    timestamp_bytes: &[u8],
    parameter_bytes: &[u8],
) -> u8 {
    let mut d = Checksum::new(length, message_type, status, loop_count);
    d.update(parameter_bytes);
    d.update(timestamp_bytes);
    d.finalize()
}
