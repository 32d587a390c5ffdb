pub const FILE_ID_LEN: usize = 40;

/// Lower-case 40-char hex; anything else can never name a stored blob.
pub fn is_file_id(s: &str) -> bool {
    s.len() == FILE_ID_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ids_must_be_canonical_hex() {
        assert!(is_file_id("3d0d7e5fb2ce288813306e4d4636395e047a3d28"));
        assert!(!is_file_id("3D0D7E5FB2CE288813306E4D4636395E047A3D28"));
        assert!(!is_file_id("../../../../etc/passwd"));
        assert!(!is_file_id("3d0d7e"));
    }
}
