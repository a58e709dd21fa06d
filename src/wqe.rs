//! Work queue entries.
//!
//! The engine consumes fixed 64-byte entries laid out as sixteen
//! little-endian 32-bit words. Local addresses are pre-masked to the
//! translation window before they are stored here; the entry itself is
//! written into the send queue verbatim.

use num_enum::TryFromPrimitive;

/// Size of one work queue entry in bytes.
pub const WQE_SIZE: usize = 64;

/// Operation codes understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum WqeOpcode {
    Write = 0,
    WriteImmdt = 1,
    Send = 2,
    SendImmdt = 3,
    Read = 4,
    SendInv = 12,
}

/// One fully populated work queue entry.
///
/// `laddr_lo`/`laddr_hi` are the window-masked local address;
/// `small_payload` carries up to sixteen bytes inline for short sends.
#[derive(Debug, Clone, Copy, Default)]
pub struct Wqe {
    pub wrid: u16,
    pub laddr_lo: u32,
    pub laddr_hi: u32,
    pub length: u32,
    pub opcode: u32,
    pub remote_offset_lo: u32,
    pub remote_offset_hi: u32,
    pub r_key: u32,
    pub small_payload: [u32; 4],
    pub immdt_data: u32,
}

impl Wqe {
    /// Serialize into the exact byte image the engine fetches.
    pub fn to_bytes(&self) -> [u8; WQE_SIZE] {
        let words: [u32; 16] = [
            u32::from(self.wrid),
            self.laddr_lo,
            self.laddr_hi,
            self.length,
            self.opcode,
            self.remote_offset_lo,
            self.remote_offset_hi,
            self.r_key,
            self.small_payload[0],
            self.small_payload[1],
            self.small_payload[2],
            self.small_payload[3],
            self.immdt_data,
            0,
            0,
            0,
        ];
        let mut bytes = [0u8; WQE_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_matches_the_engine_layout() {
        let wqe = Wqe {
            wrid: 0x0102,
            laddr_lo: 0x1111_2222,
            laddr_hi: 0x0000_0033,
            length: 0x100,
            opcode: WqeOpcode::WriteImmdt as u32,
            remote_offset_lo: 0x4444_5555,
            remote_offset_hi: 0x66,
            r_key: 0x0008,
            small_payload: [0xA, 0xB, 0xC, 0xD],
            immdt_data: 0xDEAD_BEEF,
        };
        let bytes = wqe.to_bytes();

        assert_eq!(&bytes[0..4], &[0x02, 0x01, 0x00, 0x00]);
        assert_eq!(&bytes[4..8], &[0x22, 0x22, 0x11, 0x11]);
        assert_eq!(&bytes[16..20], &[0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[28..32], &[0x08, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[48..52], &[0xEF, 0xBE, 0xAD, 0xDE]);
        // trailing words are reserved and stay zero
        assert_eq!(&bytes[52..64], &[0u8; 12]);
    }

    #[test]
    fn opcode_values_are_stable() {
        assert_eq!(WqeOpcode::try_from(4).ok(), Some(WqeOpcode::Read));
        assert_eq!(WqeOpcode::try_from(12).ok(), Some(WqeOpcode::SendInv));
        assert!(WqeOpcode::try_from(5).is_err());
    }
}
