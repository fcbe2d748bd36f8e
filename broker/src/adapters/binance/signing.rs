use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::BrokerError;

type HmacSha256 = Hmac<Sha256>;

/// Signs REST query strings with the account's API secret.
#[derive(Clone)]
pub struct RequestSigner {
    api_key: String,
    secret: Zeroizing<String>,
}

impl RequestSigner {
    pub fn new(api_key: impl Into<String>, secret: Zeroizing<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret,
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Hex-encoded HMAC-SHA256 of `query`.
    pub fn sign(&self, query: &str) -> Result<String, BrokerError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|err| BrokerError::InvalidRequest(format!("unusable api secret: {err}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Appends `timestamp`, `recvWindow` and `signature` to the parameters.
    pub fn signed_query(
        &self,
        params: &[(&str, String)],
        timestamp_ms: i64,
        recv_window_ms: u64,
    ) -> Result<String, BrokerError> {
        let mut query = encode_query(params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("recvWindow={recv_window_ms}&timestamp={timestamp_ms}"));
        let signature = self.sign(&query)?;
        query.push_str("&signature=");
        query.push_str(&signature);
        Ok(query)
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("api_key", &self.api_key)
            .field("secret", &"***")
            .finish()
    }
}

/// Parameter values here are symbols, enums and numbers; only characters
/// outside the unreserved set are percent-encoded.
pub fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={}", percent_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
