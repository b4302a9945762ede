// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use crate::rpc::protocol::ErrorCode;

/// Gateway failure taxonomy. Every variant maps onto exactly one code from
/// the closed RPC error set, so handlers convert with [`GatewayError::code`]
/// and never invent ad-hoc codes.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session {0} already has an active run")]
    Busy(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] dorabot_store::StoreError),

    #[error("outbound queue overflow")]
    SlowConsumer,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthenticated => ErrorCode::Unauthenticated,
            Self::UnknownMethod(_) => ErrorCode::UnknownMethod,
            Self::InvalidParams(_) => ErrorCode::InvalidParams,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Busy(_) => ErrorCode::Busy,
            Self::Persistence(_) => ErrorCode::Persistence,
            Self::SlowConsumer => ErrorCode::SlowConsumer,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_err_busy() {
        let e = GatewayError::Busy("k".to_string());
        assert_eq!(e.code(), ErrorCode::Busy);
    }

    #[test]
    fn persistence_wraps_store_errors() {
        let inner = dorabot_store::StoreError::Io(std::io::Error::other("disk gone"));
        let e = GatewayError::from(inner);
        assert_eq!(e.code(), ErrorCode::Persistence);
    }
}
