use std::fmt;

/// `(major, minor, patch)` client version tuple sent in the login `ClientPayload`.
///
/// Supplied as configuration (spec §1: version-probing HTTP calls are out of
/// scope; a current version tuple is supplied instead).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ProtocolVersion(pub u32, pub u32, pub u32);

impl ProtocolVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self(major, minor, patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        // A recent WhatsApp Web desktop version tuple; callers should
        // override this via ClientConfig rather than rely on the default
        // staying current.
        Self(2, 3000, 1023223821)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_format() {
        assert_eq!(ProtocolVersion::new(2, 3000, 1).to_string(), "2.3000.1");
    }

    #[test]
    fn ordering() {
        assert!(ProtocolVersion::new(2, 3000, 1) < ProtocolVersion::new(2, 3000, 2));
    }
}
