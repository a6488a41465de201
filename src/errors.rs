use crate::classic::KeyType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the poller and attack engine.
///
/// Everything here is recoverable at *some* level: the poller maps these onto
/// event payloads and decides per state whether to retry, skip the sector, or
/// pause. Only the orchestrator ever declares the whole session failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No response within the frame-wait window. The caller decides whether
    /// this means a mute tag (wrong key, deliberate silence) or a missing one.
    #[error("no response within the frame-wait window")]
    Timeout,

    /// The tag answered, but not with anything we can make sense of.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The access condition bits forbid this operation for the key in use.
    /// Distinct from communication failure: the tag is fine, we just asked
    /// for something it won't do.
    #[error("access conditions deny the operation")]
    AccessDenied,

    /// Presence check failed; the tag left the field mid-exchange.
    #[error("tag lost")]
    TagLost,

    /// The dictionary ran dry for a sector without a hit.
    #[error("dictionary exhausted for sector {sector} key {key_type}")]
    NoKeyAvailable { sector: u8, key_type: KeyType },

    /// The nested engine's candidate search ran dry for a sector.
    #[error("no key candidate left for sector {sector} key {key_type}")]
    NoCandidate { sector: u8, key_type: KeyType },

    /// A cipher or data operation was attempted outside a live authenticated
    /// session (e.g. `read_block` before `authenticate`, or after `halt`).
    #[error("no live authenticated session")]
    Session,

    /// The underlying transport failed in a way that is neither a timeout
    /// nor a tag-side protocol issue.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl Error {
    /// True for errors that indicate the tag may simply be gone, as opposed
    /// to present-but-unhappy.
    pub fn is_absence(&self) -> bool {
        matches!(self, Error::Timeout | Error::TagLost)
    }
}
