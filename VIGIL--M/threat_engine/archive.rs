//! Structural detection of password-protected archives.

use std::io::Cursor;

use zip::ZipArchive;

const LOCAL_HEADER_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const ENCRYPTED_FLAG: u16 = 0x0001;

/// True when `data` is a ZIP archive holding at least one encrypted entry.
///
/// Entries are read raw so no password is ever needed. Archives whose central
/// directory cannot be parsed fall back to the flag of the first local header.
#[must_use]
pub fn is_encrypted_archive(data: &[u8]) -> bool {
    if !data.starts_with(&LOCAL_HEADER_MAGIC) {
        return false;
    }
    let Ok(mut archive) = ZipArchive::new(Cursor::new(data)) else {
        return first_local_header_encrypted(data);
    };
    (0..archive.len()).any(|index| {
        archive
            .by_index_raw(index)
            .map(|entry| entry.encrypted())
            .unwrap_or(false)
    })
}

fn first_local_header_encrypted(data: &[u8]) -> bool {
    data.get(6..8)
        .map(|flags| u16::from_le_bytes([flags[0], flags[1]]) & ENCRYPTED_FLAG != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encrypted_zip, plain_zip};

    #[test]
    fn plain_archive_is_not_restricted() {
        assert!(!is_encrypted_archive(&plain_zip()));
    }

    #[test]
    fn encrypted_entry_is_detected() {
        assert!(is_encrypted_archive(&encrypted_zip()));
    }

    #[test]
    fn truncated_archive_falls_back_to_local_header() {
        assert!(is_encrypted_archive(&encrypted_zip()[..40]));
        assert!(!is_encrypted_archive(&plain_zip()[..40]));
    }

    #[test]
    fn non_archives_are_ignored() {
        assert!(!is_encrypted_archive(b"%PDF-1.7 not a zip"));
        assert!(!is_encrypted_archive(b""));
    }
}
