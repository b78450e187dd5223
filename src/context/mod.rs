use bytes::Bytes;
use http::{request::Parts, HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::OnceLock;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Header names populated by the external authentication layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,
    #[serde(default = "default_roles_header")]
    pub roles_header: String,
    #[serde(default = "default_client_id_header")]
    pub client_id_header: String,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,
    #[serde(default = "default_segment_header")]
    pub segment_header: String,
    #[serde(default = "default_country_header")]
    pub country_header: String,
    /// Maximum number of body bytes retained for body conditions
    #[serde(default = "default_body_excerpt_limit")]
    pub body_excerpt_limit: usize,
}

fn default_user_id_header() -> String {
    "X-User-Id".to_string()
}

fn default_roles_header() -> String {
    "X-User-Roles".to_string()
}

fn default_client_id_header() -> String {
    "X-Client-Id".to_string()
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_tenant_header() -> String {
    "X-Tenant-Id".to_string()
}

fn default_segment_header() -> String {
    "X-User-Segment".to_string()
}

fn default_country_header() -> String {
    "X-Country-Code".to_string()
}

fn default_body_excerpt_limit() -> usize {
    64 * 1024
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_id_header: default_user_id_header(),
            roles_header: default_roles_header(),
            client_id_header: default_client_id_header(),
            api_key_header: default_api_key_header(),
            tenant_header: default_tenant_header(),
            segment_header: default_segment_header(),
            country_header: default_country_header(),
            body_excerpt_limit: default_body_excerpt_limit(),
        }
    }
}

/// Caller identity as established upstream of the gateway core
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub tenant_id: Option<String>,
    pub segment: Option<String>,
    pub country: Option<String>,
    pub api_key: Option<String>,
    pub has_auth_token: bool,
}

/// Immutable snapshot of an inbound request
#[derive(Debug)]
pub struct RequestContext {
    request_id: String,
    correlation_id: String,
    method: Method,
    path: String,
    raw_query: Option<String>,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
    body_json: OnceLock<Option<Value>>,
    client_ip: IpAddr,
    identity: Identity,
}

/// Builds a [`RequestContext`] from request parts
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    config: IdentityConfig,
}

impl ContextBuilder {
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, parts: &Parts, body: &Bytes, client_ip: IpAddr) -> RequestContext {
        let headers = parts.headers.clone();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let request_id = header(REQUEST_ID_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string());
        let correlation_id = header(CORRELATION_ID_HEADER).unwrap_or_else(|| request_id.clone());

        let roles: Vec<String> = header(&self.config.roles_header)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let identity = Identity {
            client_id: header(&self.config.client_id_header),
            user_id: header(&self.config.user_id_header),
            roles,
            tenant_id: header(&self.config.tenant_header),
            segment: header(&self.config.segment_header),
            country: header(&self.config.country_header).map(|c| c.to_uppercase()),
            api_key: header(&self.config.api_key_header),
            has_auth_token: headers.contains_key(http::header::AUTHORIZATION),
        };

        let raw_query = parts.uri.query().map(str::to_string);
        let query: Vec<(String, String)> = raw_query
            .as_deref()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let excerpt_len = body.len().min(self.config.body_excerpt_limit);

        RequestContext {
            request_id,
            correlation_id,
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            raw_query,
            query,
            headers,
            body: body.slice(..excerpt_len),
            body_json: OnceLock::new(),
            client_ip,
            identity,
        }
    }
}

impl RequestContext {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// First value of a query parameter
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    /// Body excerpt parsed as JSON on first access
    pub fn body_json(&self) -> Option<&Value> {
        self.body_json
            .get_or_init(|| serde_json::from_slice(&self.body).ok())
            .as_ref()
    }

    /// Look up a dot-notation path (`order.items.0.sku`) in the JSON body.
    /// Scalars are rendered without quotes; objects and arrays as JSON.
    pub fn body_field(&self, path: &str) -> Option<String> {
        let mut current = self.body_json()?;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        match current {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        }
    }

    /// Identity used for rate limiting: client id, api key, user id, then client IP
    pub fn client_identity(&self) -> String {
        self.identity
            .client_id
            .clone()
            .or_else(|| self.identity.api_key.clone())
            .or_else(|| self.identity.user_id.clone())
            .unwrap_or_else(|| self.client_ip.to_string())
    }
}
