//! Wire protocol and output parsers for the pcs-web control panel.
//!
//! Everything here is pure: the parsers take text captured from the
//! `baidupcs` executable and never fail on unexpected input, they only
//! find less.

pub mod account;
pub mod listing;
pub mod progress;
pub mod protocol;

pub use account::{parse_identity, parse_quota, Identity, QuotaInfo};
pub use listing::{join_remote, parse_listing, DirEntry};
pub use progress::{parse_progress, to_bytes, ProgressSample, ProgressTracker};
pub use protocol::{
    ArgumentError, Command, DecodeError, Envelope, ServerEvent, ServerMessage, MAX_ENVELOPE_BYTES,
};
