use std::fmt;

/// Unique id and build stamp a bootloader reports when greeted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub uid: [u8; 12],
    pub build: String,
}

impl DeviceIdentity {
    pub fn new(uid: [u8; 12], build: impl Into<String>) -> Self {
        DeviceIdentity {
            uid,
            build: build.into(),
        }
    }

    /// 16-bit djb2 hash of the unique id
    pub fn network_id(&self) -> u16 {
        self.uid.iter().fold(5381u16, |hash, byte| {
            hash.wrapping_mul(33).wrapping_add(u16::from(*byte))
        })
    }

    /// The unique id as the three words the CPU exposes
    pub fn uid_words(&self) -> [u32; 3] {
        let mut words = [0u32; 3];
        for (word, bytes) in words.iter_mut().zip(self.uid.chunks_exact(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        words
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.uid_words();
        write!(f, "0x{a:08X}{b:08X}{c:08X}")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn network_id_is_djb2_folded_to_16_bits() {
        let zero = DeviceIdentity::new([0; 12], "");
        // 5381 * 33^12 mod 2^16
        let expected = (0..12).fold(5381u16, |h, _| h.wrapping_mul(33));
        assert_eq!(zero.network_id(), expected);

        let one = DeviceIdentity::new([1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], "");
        assert_eq!(
            one.network_id(),
            expected.wrapping_add(33u16.wrapping_pow(11))
        );
    }

    #[test]
    fn uid_displays_as_three_words() {
        let mut uid = [0u8; 12];
        uid[0] = 0x78;
        uid[3] = 0x12;
        uid[11] = 0xAB;

        let identity = DeviceIdentity::new(uid, "test");
        assert_eq!(identity.uid_words(), [0x1200_0078, 0, 0xAB00_0000]);
        assert_eq!(identity.to_string(), "0x1200007800000000AB000000");
    }
}
