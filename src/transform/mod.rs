use crate::error::{GatewayError, Result};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tracing::{debug, warn};

/// Route-level request/response transformation configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TransformConfig {
    /// Header operations applied to the forwarded request
    #[serde(default)]
    pub request_headers: HeaderOps,
    /// Query parameter operations applied to the forwarded request
    #[serde(default)]
    pub query_params: ParamOps,
    /// URL path rewrites (regex pattern -> replacement), first match wins
    #[serde(default)]
    pub path_rewrites: Vec<PathRewrite>,
    /// Header operations applied to the backend response
    #[serde(default)]
    pub response_headers: HeaderOps,
}

/// Header operations, applied in the order remove, rename, add, set
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HeaderOps {
    /// Headers to add (will not override existing)
    #[serde(default)]
    pub add: BTreeMap<String, String>,
    /// Headers to set (will override existing)
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    /// Headers to remove
    #[serde(default)]
    pub remove: Vec<String>,
    /// Headers to rename (old name -> new name)
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
}

/// Query parameter operations, applied in the order remove, rename, add, set
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ParamOps {
    #[serde(default)]
    pub add: BTreeMap<String, String>,
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
}

impl HeaderOps {
    fn is_empty(&self) -> bool {
        self.add.is_empty() && self.set.is_empty() && self.remove.is_empty() && self.rename.is_empty()
    }
}

impl ParamOps {
    fn is_empty(&self) -> bool {
        self.add.is_empty() && self.set.is_empty() && self.remove.is_empty() && self.rename.is_empty()
    }
}

/// Path rewrite rule using regex
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathRewrite {
    /// Regular expression pattern to match
    pub pattern: String,
    /// Replacement string (can use capture groups like $1, $2)
    pub replacement: String,
}

/// Compiled transformation for a single route
#[derive(Debug)]
pub struct TransformService {
    config: TransformConfig,
    path_rewrite_cache: Vec<(Regex, String)>,
}

impl TransformService {
    /// Compile a transformation, validating header names and rewrite patterns
    pub fn new(config: TransformConfig) -> Result<Self> {
        for ops in [&config.request_headers, &config.response_headers] {
            let names = ops
                .add
                .keys()
                .chain(ops.set.keys())
                .chain(ops.remove.iter())
                .chain(ops.rename.keys())
                .chain(ops.rename.values());
            for name in names {
                HeaderName::from_str(name).map_err(|_| {
                    GatewayError::Validation(format!("Invalid header name in transform: {}", name))
                })?;
            }
            for value in ops.add.values().chain(ops.set.values()) {
                HeaderValue::from_str(value).map_err(|_| {
                    GatewayError::Validation(format!("Invalid header value in transform: {}", value))
                })?;
            }
        }

        let mut path_rewrite_cache = Vec::new();
        for rewrite in &config.path_rewrites {
            let regex = Regex::new(&rewrite.pattern).map_err(|e| {
                GatewayError::Validation(format!(
                    "Invalid path rewrite regex '{}': {}",
                    rewrite.pattern, e
                ))
            })?;
            path_rewrite_cache.push((regex, rewrite.replacement.clone()));
        }

        Ok(Self {
            config,
            path_rewrite_cache,
        })
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Transform request headers
    pub fn transform_request_headers(&self, headers: &mut HeaderMap) {
        apply_header_ops(&self.config.request_headers, headers, "request");
    }

    /// Transform response headers
    pub fn transform_response_headers(&self, headers: &mut HeaderMap) {
        apply_header_ops(&self.config.response_headers, headers, "response");
    }

    /// Transform request path using configured rewrites
    pub fn transform_path(&self, path: &str) -> String {
        for (regex, replacement) in &self.path_rewrite_cache {
            if regex.is_match(path) {
                let new_path = regex.replace(path, replacement.as_str()).to_string();
                debug!(
                    original = %path,
                    rewritten = %new_path,
                    pattern = %regex.as_str(),
                    "Path rewritten"
                );
                return new_path;
            }
        }

        path.to_string()
    }

    /// Transform a raw query string, preserving parameter order
    pub fn transform_query(&self, query: Option<&str>) -> Option<String> {
        let ops = &self.config.query_params;
        if ops.is_empty() {
            return query.map(str::to_string);
        }

        let mut params: Vec<(String, String)> = query
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        params.retain(|(k, _)| !ops.remove.contains(k));

        for (key, _) in params.iter_mut() {
            if let Some(new_key) = ops.rename.get(key.as_str()) {
                *key = new_key.clone();
            }
        }

        for (key, value) in &ops.add {
            if !params.iter().any(|(k, _)| k == key) {
                params.push((key.clone(), value.clone()));
            }
        }

        for (key, value) in &ops.set {
            params.retain(|(k, _)| k != key);
            params.push((key.clone(), value.clone()));
        }

        if params.is_empty() {
            return None;
        }

        Some(
            url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params)
                .finish(),
        )
    }

    /// Whether the transform changes the forwarded request at all
    pub fn has_request_transform(&self) -> bool {
        !self.config.request_headers.is_empty()
            || !self.config.query_params.is_empty()
            || !self.path_rewrite_cache.is_empty()
    }
}

fn apply_header_ops(ops: &HeaderOps, headers: &mut HeaderMap, side: &str) {
    for header_name in &ops.remove {
        if let Ok(name) = HeaderName::from_str(header_name) {
            headers.remove(&name);
            debug!(header = %header_name, side, "Removed header");
        } else {
            warn!(header = %header_name, side, "Invalid header name for removal");
        }
    }

    for (old, new) in &ops.rename {
        if let (Ok(old_name), Ok(new_name)) = (HeaderName::from_str(old), HeaderName::from_str(new))
        {
            let values: Vec<HeaderValue> = headers.get_all(&old_name).iter().cloned().collect();
            if values.is_empty() {
                continue;
            }
            headers.remove(&old_name);
            for value in values {
                headers.append(new_name.clone(), value);
            }
            debug!(from = %old, to = %new, side, "Renamed header");
        }
    }

    for (key, value) in &ops.add {
        if let (Ok(name), Ok(val)) = (HeaderName::from_str(key), HeaderValue::from_str(value)) {
            if !headers.contains_key(&name) {
                headers.insert(name, val);
                debug!(header = %key, value = %value, side, "Added header");
            }
        } else {
            warn!(header = %key, side, "Invalid header name or value for add");
        }
    }

    for (key, value) in &ops.set {
        if let (Ok(name), Ok(val)) = (HeaderName::from_str(key), HeaderValue::from_str(value)) {
            headers.insert(name, val);
            debug!(header = %key, value = %value, side, "Set header");
        } else {
            warn!(header = %key, side, "Invalid header name or value for set");
        }
    }
}

/// Apply a target's extra headers (override semantics)
pub fn apply_extra_headers(extra: &HashMap<String, String>, headers: &mut HeaderMap) {
    for (key, value) in extra {
        match (HeaderName::from_str(key), HeaderValue::from_str(value)) {
            (Ok(name), Ok(val)) => {
                headers.insert(name, val);
            }
            _ => warn!(header = %key, "Invalid target extra header"),
        }
    }
}

/// Merge a target's extra query parameters into a query string (override semantics)
pub fn apply_extra_query(extra: &HashMap<String, String>, query: Option<String>) -> Option<String> {
    if extra.is_empty() {
        return query;
    }

    let mut params: Vec<(String, String)> = query
        .as_deref()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let mut keys: Vec<&String> = extra.keys().collect();
    keys.sort();
    for key in keys {
        params.retain(|(k, _)| k != key);
        params.push((key.clone(), extra[key].clone()));
    }

    Some(
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops_with(f: impl FnOnce(&mut HeaderOps)) -> TransformConfig {
        let mut ops = HeaderOps::default();
        f(&mut ops);
        TransformConfig {
            request_headers: ops,
            ..Default::default()
        }
    }

    #[test]
    fn test_header_add_does_not_override() {
        let config = ops_with(|ops| {
            ops.add
                .insert("X-Custom-Header".to_string(), "new-value".to_string());
        });

        let service = TransformService::new(config).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-custom-header", HeaderValue::from_static("existing-value"));

        service.transform_request_headers(&mut headers);

        assert_eq!(headers.get("X-Custom-Header").unwrap(), "existing-value");
    }

    #[test]
    fn test_header_set_overrides() {
        let config = ops_with(|ops| {
            ops.set
                .insert("X-Custom-Header".to_string(), "new-value".to_string());
        });

        let service = TransformService::new(config).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-custom-header", HeaderValue::from_static("existing-value"));

        service.transform_request_headers(&mut headers);

        assert_eq!(headers.get("X-Custom-Header").unwrap(), "new-value");
    }

    #[test]
    fn test_header_remove_and_rename() {
        let config = ops_with(|ops| {
            ops.remove.push("X-Remove-Me".to_string());
            ops.rename
                .insert("X-Legacy-User".to_string(), "X-User".to_string());
        });

        let service = TransformService::new(config).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-remove-me", HeaderValue::from_static("value"));
        headers.insert("x-legacy-user", HeaderValue::from_static("alice"));

        service.transform_request_headers(&mut headers);

        assert!(headers.get("X-Remove-Me").is_none());
        assert!(headers.get("X-Legacy-User").is_none());
        assert_eq!(headers.get("X-User").unwrap(), "alice");
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        let config = ops_with(|ops| {
            ops.add.insert("bad header".to_string(), "v".to_string());
        });
        assert!(matches!(
            TransformService::new(config),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_path_rewrite_first_match_wins() {
        let config = TransformConfig {
            path_rewrites: vec![
                PathRewrite {
                    pattern: r"^/v1/(.*)$".to_string(),
                    replacement: "/api/v1/$1".to_string(),
                },
                PathRewrite {
                    pattern: r"^/v1/users$".to_string(),
                    replacement: "/never".to_string(),
                },
            ],
            ..Default::default()
        };

        let service = TransformService::new(config).unwrap();

        assert_eq!(service.transform_path("/v1/users"), "/api/v1/users");
        assert_eq!(service.transform_path("/other/path"), "/other/path");
    }

    #[test]
    fn test_query_param_transformation() {
        let mut ops = ParamOps::default();
        ops.add.insert("new_param".to_string(), "value".to_string());
        ops.remove.push("remove_me".to_string());
        ops.set.insert("override".to_string(), "new_value".to_string());
        ops.rename.insert("q".to_string(), "search".to_string());

        let service = TransformService::new(TransformConfig {
            query_params: ops,
            ..Default::default()
        })
        .unwrap();

        let transformed = service
            .transform_query(Some("existing=value&remove_me=x&override=old&q=rust"))
            .unwrap();

        let params: HashMap<String, String> = url::form_urlencoded::parse(transformed.as_bytes())
            .into_owned()
            .collect();

        assert_eq!(params.get("existing").unwrap(), "value");
        assert_eq!(params.get("new_param").unwrap(), "value");
        assert!(!params.contains_key("remove_me"));
        assert_eq!(params.get("override").unwrap(), "new_value");
        assert_eq!(params.get("search").unwrap(), "rust");
        assert!(!params.contains_key("q"));
    }

    #[test]
    fn test_query_untouched_without_ops() {
        let service = TransformService::new(TransformConfig::default()).unwrap();
        assert_eq!(service.transform_query(Some("a=1&b=2")).as_deref(), Some("a=1&b=2"));
        assert_eq!(service.transform_query(None), None);
        assert!(!service.has_request_transform());
    }

    #[test]
    fn test_extra_query_overrides() {
        let mut extra = HashMap::new();
        extra.insert("region".to_string(), "eu".to_string());
        let merged = apply_extra_query(&extra, Some("region=us&x=1".to_string())).unwrap();
        assert_eq!(merged, "x=1&region=eu");
    }

    #[test]
    fn test_response_header_transformation() {
        let mut ops = HeaderOps::default();
        ops.set
            .insert("X-Powered-By".to_string(), "Rust Gateway".to_string());
        ops.remove.push("Server".to_string());

        let service = TransformService::new(TransformConfig {
            response_headers: ops,
            ..Default::default()
        })
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("server", HeaderValue::from_static("nginx"));

        service.transform_response_headers(&mut headers);

        assert!(headers.get("Server").is_none());
        assert_eq!(headers.get("X-Powered-By").unwrap(), "Rust Gateway");
    }
}
