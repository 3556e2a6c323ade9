//! The TCP invite exchange: banner, request literal, and session id framing.

/// Protocol name embedded in the banner, e.g. `sping-0.3-https://...`.
pub const PROTOCOL_VERSION: &str = "sping-0.3";

/// The only request line the invitee accepts.
pub const INVITE_REQUEST: &[u8] = b"INVITE\r\n";

/// Sent back on anything that isn't exactly [`INVITE_REQUEST`].
pub const REJECTION: &[u8] = b"I_DONT_UNDERSTAND";

/// Anti-amplification cutoff: an inviter that sends more than this before
/// we've parsed a request gets disconnected.
pub const MAX_BANNER_READ: usize = 9000;

/// A banner line written by the invitee on accept: `"sping-0.3-<url>\n"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner(String);

impl Banner {
    pub fn new(project_url: &str) -> Self {
        Self(format!("{PROTOCOL_VERSION}-{project_url}\n"))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Validates a banner read from a peer: it must start with the
    /// protocol prefix (version mismatches from older/newer peers are
    /// rejected by the dialer rather than silently misinterpreted).
    pub fn validate(line: &str) -> bool {
        line.starts_with(PROTOCOL_VERSION)
    }
}

/// Parses the decimal ASCII session id the invitee writes after a valid
/// invite, e.g. `b"305419896"`.
pub fn parse_session_id(bytes: &[u8]) -> Option<u32> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_starts_with_protocol_prefix() {
        let banner = Banner::new("https://example.invalid/splitping");
        let text = std::str::from_utf8(banner.as_bytes()).unwrap();
        assert!(text.starts_with("sping-0.3-"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn validate_rejects_foreign_banners() {
        assert!(Banner::validate("sping-0.3-https://x"));
        assert!(!Banner::validate("sping-0.2-https://x"));
        assert!(!Banner::validate("not a banner at all"));
    }

    #[test]
    fn parse_session_id_accepts_decimal_ascii() {
        assert_eq!(parse_session_id(b"4096"), Some(4096));
        assert_eq!(parse_session_id(b"4096\r\n"), Some(4096));
        assert_eq!(parse_session_id(b"not a number"), None);
    }
}
