mod jid;
mod version;

pub use jid::Jid;
pub use version::ProtocolVersion;

/// Message ID type (WhatsApp internal ID string).
pub type MessageId = String;

/// Server-assigned ID for newsletter messages.
pub type MessageServerId = i32;
