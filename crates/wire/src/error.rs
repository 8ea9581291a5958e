use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The wire-level rejection taxonomy (§7). A channel never sends a raw
/// `anyhow::Error` over the wire — every outward-facing error path goes
/// through one of these variants, and `Display` is used verbatim as the
/// `reason` string in a `{error, reason}` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireError {
    #[error("not_found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("account_disabled")]
    AccountDisabled,
    #[error("expired")]
    Expired,
    #[error("invalid_token")]
    InvalidToken,
    #[error("missing_token")]
    MissingToken,
    #[error("invalid_ref")]
    InvalidRef,
    #[error("unknown_message")]
    UnknownMessage,
    #[error("rate_limit")]
    RateLimit,
    #[error("internal_error")]
    InternalError,
    /// The "delete internet resource" rejection. The source repo carried two
    /// spellings of this token across duplicated files
    /// (`cant_delete_internet_resource` vs `cannot_delete_internet_resource`);
    /// this crate settles on the latter everywhere (see `DESIGN.md`).
    #[error("cannot_delete_internet_resource")]
    CannotDeleteInternetResource,
}
