//! System description table header and checksum helpers

use alloc::vec::Vec;

/// Size of the common ACPI table header.
pub const SDT_HEADER_LEN: usize = 36;

/// Offset of the checksum byte in the header.
pub const CHECKSUM_OFFSET: usize = 9;

/// Common header shared by every ACPI system description table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub revision: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: [u8; 4],
    pub creator_revision: u32,
}

impl SdtHeader {
    /// Header with the default OEM and creator identity.
    ///
    /// `oem_table_id` is space padded to 8 characters.
    pub fn new(signature: &[u8; 4], revision: u8, oem_table_id: &str) -> Self {
        let id = oem_table_id.as_bytes();
        assert!(id.len() <= 8, "OEM table id {:?} longer than 8 bytes", oem_table_id);
        let mut table_id = [b' '; 8];
        table_id[..id.len()].copy_from_slice(id);

        Self {
            signature: *signature,
            revision,
            oem_id: *b"BOCHS ",
            oem_table_id: table_id,
            oem_revision: 1,
            creator_id: *b"BXPC",
            creator_revision: 1,
        }
    }

    /// Serialize with the given total table length and a zero checksum.
    pub fn to_bytes(&self, total_len: u32) -> [u8; SDT_HEADER_LEN] {
        let mut out = [0u8; SDT_HEADER_LEN];
        out[0..4].copy_from_slice(&self.signature);
        out[4..8].copy_from_slice(&total_len.to_le_bytes());
        out[8] = self.revision;
        out[CHECKSUM_OFFSET] = 0;
        out[10..16].copy_from_slice(&self.oem_id);
        out[16..24].copy_from_slice(&self.oem_table_id);
        out[24..28].copy_from_slice(&self.oem_revision.to_le_bytes());
        out[28..32].copy_from_slice(&self.creator_id);
        out[32..36].copy_from_slice(&self.creator_revision.to_le_bytes());
        out
    }

    /// Prepend this header to `body` and compute the checksum.
    pub fn build(&self, body: &[u8]) -> Vec<u8> {
        let total_len = SDT_HEADER_LEN + body.len();
        let mut table = Vec::with_capacity(total_len);
        table.extend_from_slice(&self.to_bytes(total_len as u32));
        table.extend_from_slice(body);
        finalize(&mut table);
        table
    }
}

/// Byte such that the sum of `data` plus it is zero.
pub fn checksum(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    0u8.wrapping_sub(sum)
}

/// Recompute the checksum byte of a complete table in place.
pub fn finalize(table: &mut [u8]) {
    assert!(table.len() >= SDT_HEADER_LEN, "table shorter than its header");
    table[CHECKSUM_OFFSET] = 0;
    table[CHECKSUM_OFFSET] = checksum(table);
    log::trace!(
        "finalized {} table, {} bytes, checksum {:#04x}",
        core::str::from_utf8(&table[0..4]).unwrap_or("????"),
        table.len(),
        table[CHECKSUM_OFFSET]
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = SdtHeader::new(b"SSDT", 1, "VMBoard");
        let bytes = header.to_bytes(0x1234);
        assert_eq!(&bytes[0..4], b"SSDT");
        assert_eq!(&bytes[4..8], &0x1234u32.to_le_bytes());
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[10..16], b"BOCHS ");
        assert_eq!(&bytes[16..24], b"VMBoard ");
        assert_eq!(&bytes[28..32], b"BXPC");
    }

    #[test]
    fn test_built_table_sums_to_zero() {
        let table = SdtHeader::new(b"SSDT", 1, "VMBoard").build(&[1, 2, 3, 0xFF]);
        assert_eq!(table.len(), SDT_HEADER_LEN + 4);
        assert_eq!(checksum(&table), 0);
    }

    #[test]
    fn test_finalize_after_patch() {
        let mut table = SdtHeader::new(b"SSDT", 1, "T").build(&[0, 0, 0, 0]);
        table[SDT_HEADER_LEN..].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        assert_ne!(checksum(&table), 0);
        finalize(&mut table);
        assert_eq!(checksum(&table), 0);
    }
}
