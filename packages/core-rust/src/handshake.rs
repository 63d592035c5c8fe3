//! Language announcement sent by a worker as the first bytes of a connection.
//!
//! The announcement is at most [`ANNOUNCE_LEN`] bytes of UTF-8. Workers may
//! send just the language name or pad it with NUL bytes to the full length;
//! both forms parse to the same language.

use crate::codec::ProtocolError;
use crate::types::WorkerLanguage;

/// Maximum (and padded) size of the language announcement.
pub const ANNOUNCE_LEN: usize = 64;

/// Builds the NUL-padded 64-byte announcement for `language`.
///
/// # Errors
///
/// Returns `ProtocolError::BadAnnouncement` if the name is empty or longer
/// than [`ANNOUNCE_LEN`] bytes.
pub fn encode_announcement(language: &WorkerLanguage) -> Result<[u8; ANNOUNCE_LEN], ProtocolError> {
    let name = language.as_str().as_bytes();
    if name.is_empty() {
        return Err(ProtocolError::BadAnnouncement("empty language name"));
    }
    if name.len() > ANNOUNCE_LEN {
        return Err(ProtocolError::BadAnnouncement("language name longer than 64 bytes"));
    }
    let mut out = [0u8; ANNOUNCE_LEN];
    out[..name.len()].copy_from_slice(name);
    Ok(out)
}

/// Parses a received announcement.
///
/// Trailing NUL bytes and whitespace are ignored.
///
/// # Errors
///
/// Returns `ProtocolError::BadAnnouncement` if the bytes are not UTF-8 or
/// contain no language name.
pub fn parse_announcement(bytes: &[u8]) -> Result<WorkerLanguage, ProtocolError> {
    let bytes = &bytes[..bytes.len().min(ANNOUNCE_LEN)];
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ProtocolError::BadAnnouncement("announcement is not UTF-8"))?;
    let name = text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
    if name.is_empty() {
        return Err(ProtocolError::BadAnnouncement("empty language name"));
    }
    Ok(WorkerLanguage::new(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_parses() {
        assert_eq!(
            parse_announcement(b"Python3").unwrap(),
            WorkerLanguage::new("Python3")
        );
    }

    #[test]
    fn padded_announcement_round_trips() {
        let lang = WorkerLanguage::new("Python2");
        let bytes = encode_announcement(&lang).unwrap();
        assert_eq!(bytes.len(), ANNOUNCE_LEN);
        assert_eq!(&bytes[..7], b"Python2");
        assert!(bytes[7..].iter().all(|b| *b == 0));
        assert_eq!(parse_announcement(&bytes).unwrap(), lang);
    }

    #[test]
    fn trailing_newline_is_ignored() {
        assert_eq!(parse_announcement(b"ruby\n").unwrap().as_str(), "ruby");
    }

    #[test]
    fn empty_and_all_nul_are_rejected() {
        assert!(parse_announcement(b"").is_err());
        assert!(parse_announcement(&[0u8; ANNOUNCE_LEN]).is_err());
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let err = parse_announcement(&[0xC3, 0x28]).unwrap_err();
        assert!(matches!(err, ProtocolError::BadAnnouncement(_)));
    }

    #[test]
    fn oversized_name_cannot_be_announced() {
        let lang = WorkerLanguage::new("x".repeat(ANNOUNCE_LEN + 1));
        assert!(encode_announcement(&lang).is_err());
    }
}
