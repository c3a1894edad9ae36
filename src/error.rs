use hickory_proto::error::ProtoError;
use hickory_proto::rr::RecordType;
use std::io;
use thiserror::Error;

/// Errors surfaced by [`crate::resolver::RecursiveResolver`].
///
/// `Io` and `Protocol` are the two shapes an upstream exchange can fail in;
/// the resolver treats both as non-fatal for a single candidate and moves on
/// to the next one (see [`ResolutionError::is_upstream_failure`]). `NxDomain`
/// and `ServFail` are the only variants that can terminate a top-level
/// resolution.
#[derive(Error, Debug)]
pub enum ResolutionError {
    /// RFC 1035 4.1.1 RCODE 3: an authoritative server reported no such name.
    #[error("no data exists for this name and record type")]
    NxDomain,
    #[error("server failure: {0}")]
    ServFail(String),
    #[error("record type {0} is not supported")]
    UnsupportedType(RecordType),
    #[error("failure in underlying io")]
    Io(#[from] io::Error),
    #[error("protocol error")]
    Protocol(#[from] ProtoError),
}

impl ResolutionError {
    /// True for the error shapes that mean "this one upstream failed",
    /// as opposed to a terminal failure of the whole resolution.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(self, ResolutionError::Io(_) | ResolutionError::Protocol(_))
    }
}
