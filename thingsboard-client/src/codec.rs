//! JSON envelopes exchanged with the platform
use serde::{Deserialize, Serialize};

/// Attribute keys to fetch with an attribute request.
///
/// Keys are comma separated, e.g. `"model,serial"`. A missing list means
/// "no keys of that scope".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_keys: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_keys: Option<String>,
}

impl AttributesQuery {
    pub fn client_keys(mut self, keys: impl Into<String>) -> Self {
        self.client_keys = Some(keys.into());
        self
    }

    pub fn shared_keys(mut self, keys: impl Into<String>) -> Self {
        self.shared_keys = Some(keys.into());
        self
    }

    /// Query string pairs in the order the HTTP API expects them
    pub(crate) fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::new();
        if let Some(keys) = &self.client_keys {
            pairs.push(("clientKeys", keys.as_str()));
        }
        if let Some(keys) = &self.shared_keys {
            pairs.push(("sharedKeys", keys.as_str()));
        }
        pairs
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClaimRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
}

impl<'a> ClaimRequest<'a> {
    /// A negative duration means the claim never expires and is left out
    pub fn new(secret: Option<&'a str>, duration_ms: i64) -> Self {
        Self {
            secret_key: secret,
            duration_ms: u64::try_from(duration_ms).ok(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProvisionRequest<'a> {
    provision_device_key: &'a str,
    provision_device_secret: &'a str,
    token: &'a str,
    credentials_type: &'static str,
}

impl<'a> ProvisionRequest<'a> {
    pub fn new(key: &'a str, secret: &'a str, token: &'a str) -> Self {
        Self {
            provision_device_key: key,
            provision_device_secret: secret,
            token,
            credentials_type: "ACCESS_TOKEN",
        }
    }
}

/// Device-originated RPC call.
///
/// Over MQTT the id travels in the topic, over HTTP it is part of the body.
#[derive(Debug, Serialize)]
pub(crate) struct RpcRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u32>,
    method: &'a str,
    params: &'a str,
}

impl<'a> RpcRequest<'a> {
    pub fn new(method: &'a str, params: &'a str) -> Self {
        Self {
            id: None,
            method,
            params,
        }
    }

    pub fn with_id(self, id: u32) -> Self {
        Self {
            id: Some(id),
            ..self
        }
    }
}

#[derive(Deserialize)]
struct RpcEnvelope {
    id: u32,
}

/// Extract the request id of a polled server-side RPC
pub(crate) fn rpc_request_id(body: &str) -> Result<u32, serde_json::Error> {
    serde_json::from_str::<RpcEnvelope>(body).map(|envelope| envelope.id)
}
