//! Tracking request sets and their queue wire format.
//!
//! A [`RequestSet`] is an ordered group of tracking requests that share one
//! captured environment. It is the unit stored in a queue shard entry.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "requests": [{"idsite": "1", "_id": "0123456789abcdef", "url": "..."}],
//!   "env": {"REMOTE_ADDR": "192.168.1.10", "HTTP_USER_AGENT": "..."},
//!   "token_auth": null,
//!   "time": 1760000000
//! }
//! ```
//!
//! Scalar parameter values (numbers, booleans) are normalised to strings when
//! decoding; nested arrays or objects are rejected. Parameters keep the order
//! in which they were captured.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Request parameters carrying a stable visitor identity, in order of preference.
const IDENTITY_PARAMS: [&str; 3] = ["cid", "_id", "uid"];

/// Parameter holding an explicit client address override.
const CLIENT_ADDRESS_PARAM: &str = "cip";

/// Environment entry holding the client network address.
const REMOTE_ADDR_ENV: &str = "REMOTE_ADDR";

/// Captured environment of a request set (server/client metadata).
pub type Environment = BTreeMap<String, String>;

/// A single tracking request: parameter name to string value, in capture order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingRequest {
    params: Vec<(String, String)>,
}

impl TrackingRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method adding one parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_param(name.into(), value.into());
        self
    }

    /// Sets a parameter. An existing name keeps its position.
    pub fn set_param(&mut self, name: String, value: String) {
        match self.params.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.params.push((name, value)),
        }
    }

    /// Returns a parameter value, if present and non-empty.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Returns all parameters in capture order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Returns the site this request tracks into.
    pub fn site_id(&self) -> Option<&str> {
        self.param("idsite")
    }

    /// Returns the explicit visitor identity, if the request carries one.
    pub fn visitor_identity(&self) -> Option<&str> {
        IDENTITY_PARAMS.iter().find_map(|name| self.param(name))
    }
}

impl FromIterator<(String, String)> for TrackingRequest {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut request = Self::new();
        for (name, value) in iter {
            request.set_param(name, value);
        }
        request
    }
}

impl Serialize for TrackingRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.params.iter().map(|(k, v)| (k, v)))
    }
}

/// An ordered group of tracking requests sharing one captured environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSet {
    requests: Vec<TrackingRequest>,
    environment: Environment,
    token_auth: Option<String>,
    time: Option<i64>,
}

impl RequestSet {
    /// Creates a request set stamped with the current time.
    pub fn new(requests: Vec<TrackingRequest>) -> Self {
        Self {
            requests,
            environment: Environment::new(),
            token_auth: None,
            time: Some(chrono::Utc::now().timestamp()),
        }
    }

    /// Builder method attaching the captured environment.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Builder method adding a single environment entry.
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    /// Builder method attaching an authentication token.
    pub fn with_token_auth(mut self, token: impl Into<String>) -> Self {
        self.token_auth = Some(token.into());
        self
    }

    pub fn requests(&self) -> &[TrackingRequest] {
        &self.requests
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn token_auth(&self) -> Option<&str> {
        self.token_auth.as_deref()
    }

    /// Unix time at which the set was captured.
    pub fn time(&self) -> Option<i64> {
        self.time
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Returns a copy restricted to the first `len` requests.
    pub fn truncated(&self, len: usize) -> RequestSet {
        RequestSet {
            requests: self.requests.iter().take(len).cloned().collect(),
            environment: self.environment.clone(),
            token_auth: self.token_auth.clone(),
            time: self.time,
        }
    }

    /// Returns a copy holding only the given requests, keeping environment and token.
    pub fn with_requests(&self, requests: Vec<TrackingRequest>) -> RequestSet {
        RequestSet {
            requests,
            environment: self.environment.clone(),
            token_auth: self.token_auth.clone(),
            time: self.time,
        }
    }

    /// Returns the stable identity used to pick a shard for one request.
    ///
    /// Prefers the request's visitor identity. Without one, the client address
    /// is hashed first so that addresses sharing leading octets do not cluster
    /// on the same shard.
    pub fn routing_identity(&self, request: &TrackingRequest) -> String {
        if let Some(identity) = request.visitor_identity() {
            return identity.to_string();
        }

        let address = request
            .param(CLIENT_ADDRESS_PARAM)
            .or_else(|| {
                self.environment
                    .get(REMOTE_ADDR_ENV)
                    .map(String::as_str)
                    .filter(|v| !v.is_empty())
            })
            .unwrap_or_default();

        hex::encode(Sha256::digest(address.as_bytes()))
    }

    /// Serializes the set into its queue wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let wire = WireRequestSet {
            requests: self
                .requests
                .iter()
                .map(|r| {
                    r.params
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect()
                })
                .collect(),
            env: self
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
            token_auth: self.token_auth.clone(),
            time: self.time,
        };
        serde_json::to_string(&wire)
    }

    /// Decodes a queue entry, normalising scalar values to strings.
    pub fn from_json(data: &str) -> Result<RequestSet, DecodeError> {
        let wire: WireRequestSet = serde_json::from_str(data).map_err(DecodeError::Json)?;

        let requests = wire
            .requests
            .into_iter()
            .map(|params| normalize_entries(params).map(TrackingRequest::from_iter))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RequestSet {
            requests,
            environment: normalize_entries(wire.env)?.into_iter().collect(),
            token_auth: wire.token_auth,
            time: wire.time,
        })
    }
}

/// Why a queue entry could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The entry is not valid JSON for the wire schema.
    #[error("{0}")]
    Json(#[source] serde_json::Error),

    /// A parameter value has a non-scalar type.
    #[error("parameter '{name}' must be a scalar value")]
    InvalidValue { name: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRequestSet {
    requests: Vec<Map<String, Value>>,
    #[serde(default)]
    env: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<i64>,
}

fn normalize_entries(
    entries: impl IntoIterator<Item = (String, Value)>,
) -> Result<Vec<(String, String)>, DecodeError> {
    let mut normalized = Vec::new();
    for (name, value) in entries {
        let value = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => (if b { "1" } else { "0" }).to_string(),
            Value::Null => continue,
            Value::Array(_) | Value::Object(_) => return Err(DecodeError::InvalidValue { name }),
        };
        normalized.push((name, value));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(visitor: &str, url: &str) -> TrackingRequest {
        TrackingRequest::new()
            .with_param("idsite", "1")
            .with_param("_id", visitor)
            .with_param("url", url)
    }

    #[test]
    fn test_decode_normalizes_scalars() {
        let data = r#"{"requests":[{"idsite":1,"rec":true,"bots":false,"cvar":null,"url":"http://a"}],"env":{"REMOTE_ADDR":"10.0.0.1","SERVER_PORT":443}}"#;
        let set = RequestSet::from_json(data).expect("entry should decode");

        let req = &set.requests()[0];
        assert_eq!(req.param("idsite"), Some("1"));
        assert_eq!(req.param("rec"), Some("1"));
        assert_eq!(req.param("bots"), Some("0"));
        assert_eq!(req.param("cvar"), None);
        assert_eq!(set.environment().get("SERVER_PORT").map(String::as_str), Some("443"));
        assert_eq!(set.token_auth(), None);
    }

    #[test]
    fn test_parameters_keep_capture_order() {
        let data = r#"{"requests":[{"url":"/x","idsite":"1","_id":"abc","action_name":"Home"}]}"#;
        let set = RequestSet::from_json(data).expect("entry should decode");

        let names: Vec<&str> = set.requests()[0]
            .params()
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["url", "idsite", "_id", "action_name"]);

        let encoded = set.to_json().expect("encode");
        assert!(encoded.contains(r#"{"url":"/x","idsite":"1","_id":"abc","action_name":"Home"}"#));

        let updated = set.requests()[0].clone().with_param("idsite", "2");
        assert_eq!(updated.params()[1], ("idsite".to_string(), "2".to_string()));
        assert_eq!(updated.params().len(), 4);
    }

    #[test]
    fn test_decode_rejects_nested_values() {
        let data = r#"{"requests":[{"idsite":"1","ec_items":[1,2]}]}"#;
        match RequestSet::from_json(data) {
            Err(DecodeError::InvalidValue { name }) => assert_eq!(name, "ec_items"),
            other => panic!("expected invalid value, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_missing_requests() {
        assert!(matches!(
            RequestSet::from_json(r#"{"env":{}}"#),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            RequestSet::from_json("not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_wire_form_preserves_request_order_and_env() {
        let set = RequestSet::new(vec![request("aaaaaaaaaaaaaaaa", "/1"), request("bbbbbbbbbbbbbbbb", "/2")])
            .with_env("REMOTE_ADDR", "10.1.1.1")
            .with_token_auth("secret");

        let decoded = RequestSet::from_json(&set.to_json().expect("encode")).expect("decode");
        assert_eq!(decoded, set);
        assert_eq!(decoded.requests()[1].param("url"), Some("/2"));
    }

    #[test]
    fn test_truncated_keeps_prefix_and_environment() {
        let set = RequestSet::new((0..5).map(|i| request("cccccccccccccccc", &format!("/{}", i))).collect())
            .with_env("REMOTE_ADDR", "10.0.0.9");

        let prefix = set.truncated(2);
        assert_eq!(prefix.len(), 2);
        assert_eq!(prefix.requests()[1].param("url"), Some("/1"));
        assert_eq!(prefix.environment(), set.environment());
        assert_eq!(prefix.time(), set.time());
    }

    #[test]
    fn test_routing_identity_prefers_visitor_params() {
        let set = RequestSet::new(vec![]);
        let req = TrackingRequest::new()
            .with_param("_id", "0123456789abcdef")
            .with_param("cid", "fedcba9876543210");
        assert_eq!(set.routing_identity(&req), "fedcba9876543210");

        let req = TrackingRequest::new().with_param("_id", "0123456789abcdef");
        assert_eq!(set.routing_identity(&req), "0123456789abcdef");
    }

    #[test]
    fn test_routing_identity_falls_back_to_hashed_address() {
        let set = RequestSet::new(vec![]).with_env("REMOTE_ADDR", "192.168.1.10");
        let identity = set.routing_identity(&TrackingRequest::new().with_param("idsite", "1"));
        assert_eq!(
            identity,
            "805ebf201c523f69376591c6ce5ceb3f12ebcfedad297c5f175a380426cf0b42"
        );

        let overridden = TrackingRequest::new().with_param("cip", "192.168.1.10");
        let other_env = RequestSet::new(vec![]).with_env("REMOTE_ADDR", "127.0.0.1");
        assert_eq!(other_env.routing_identity(&overridden), identity);
    }
}
