//! HTTP lookup backends.

mod profile;
mod rpc;
mod transaction;

pub use profile::{Profile, ProfileBody, ProfileLookup, ProfileRequest};
pub use transaction::{
    TransactionReceipt, TransactionRequest, TransactionStatus, TransactionStatusLookup,
};

use parley_core::{ConfigError, ParleyResult};
use std::time::Duration;

pub(crate) fn http_client(timeout: Duration) -> ParleyResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| {
            ConfigError::InvalidValue {
                field: "endpoints.request_timeout_ms".to_string(),
                value: format!("{}ms", timeout.as_millis()),
                reason: format!("failed to build HTTP client: {}", e),
            }
            .into()
        })
}
