//! Change token encoding.

use crate::error::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};
use zonesync_protocol::{from_cbor, to_cbor, ChangeToken};

/// Position in a zone's change feed.
///
/// `epoch` changes whenever the zone's tokens are expired; tokens from an
/// older epoch are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TokenBody {
    pub epoch: u64,
    pub seq: u64,
}

impl TokenBody {
    pub(crate) fn encode(&self) -> ServerResult<ChangeToken> {
        to_cbor(self)
            .map(ChangeToken::from_bytes)
            .map_err(|e| ServerError::InvalidRequest(e.to_string()))
    }

    pub(crate) fn decode(token: &ChangeToken) -> ServerResult<Self> {
        from_cbor(token.as_bytes()).map_err(|_| ServerError::ChangeTokenExpired)
    }
}
