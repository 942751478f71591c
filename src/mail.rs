//! Mailbox ingestion: IMAP transport, MIME parsing, per-mailbox polling.

pub mod buffer;
pub mod parser;
pub mod poller;
pub mod transport;

pub use buffer::MessageBuffer;
pub use parser::parse_message;
pub use poller::{PollStatus, PollerRegistry, PollerState};
pub use transport::{ImapTransport, MailSession, MailTransport, RawMessageRef, SearchMode};
