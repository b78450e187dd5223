use crate::error::{GatewayError, Result};
use regex::Regex;

/// Compiled route path pattern.
///
/// Patterns prefixed with `regex:` or starting with `^` are treated as regular
/// expressions. Everything else is a glob:
///
/// - `*` matches within one path segment
/// - `**` matches across segments
/// - `:name` and `{name}` match one non-empty segment
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(GatewayError::Validation(
                "Path pattern cannot be empty".to_string(),
            ));
        }

        let expr = if let Some(raw) = pattern.strip_prefix("regex:") {
            raw.to_string()
        } else if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            if !pattern.starts_with('/') {
                return Err(GatewayError::Validation(format!(
                    "Glob path pattern must start with '/': {}",
                    pattern
                )));
            }
            glob_to_regex(pattern)
        };

        let regex = Regex::new(&expr).map_err(|e| {
            GatewayError::Validation(format!("Invalid path pattern '{}': {}", pattern, e))
        })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Translate a glob into an anchored regex
fn glob_to_regex(glob: &str) -> String {
    let mut result = String::from("^");
    let mut chars = glob.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    result.push_str(".*");
                } else {
                    result.push_str("[^/]*");
                }
            }
            ':' => {
                while let Some(&next_ch) = chars.peek() {
                    if next_ch.is_alphanumeric() || next_ch == '_' {
                        chars.next();
                    } else {
                        break;
                    }
                }
                result.push_str("[^/]+");
            }
            '{' => {
                for next_ch in chars.by_ref() {
                    if next_ch == '}' {
                        break;
                    }
                }
                result.push_str("[^/]+");
            }
            '?' => result.push_str("[^/]"),
            _ => result.push_str(&regex::escape(&ch.to_string())),
        }
    }

    // Tolerate a single trailing slash on the request path
    if !result.ends_with('/') && !result.ends_with(".*") {
        result.push_str("/?");
    }
    result.push('$');
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_single_segment() {
        let pattern = PathPattern::parse("/api/v1/orders/*").unwrap();
        assert!(pattern.is_match("/api/v1/orders/123"));
        assert!(pattern.is_match("/api/v1/orders/"));
        assert!(!pattern.is_match("/api/v1/orders/123/items"));
        assert!(!pattern.is_match("/api/v1/users/1"));
    }

    #[test]
    fn test_glob_double_star() {
        let pattern = PathPattern::parse("/static/**").unwrap();
        assert!(pattern.is_match("/static/css/site.css"));
        assert!(pattern.is_match("/static/"));
        assert!(!pattern.is_match("/other/static/a"));
    }

    #[test]
    fn test_glob_params() {
        let colon = PathPattern::parse("/api/users/:id/posts/:postId").unwrap();
        assert!(colon.is_match("/api/users/42/posts/7"));
        assert!(!colon.is_match("/api/users//posts/7"));

        let braces = PathPattern::parse("/api/users/{id}").unwrap();
        assert!(braces.is_match("/api/users/42"));
        assert!(braces.is_match("/api/users/42/"));
    }

    #[test]
    fn test_exact_glob_escapes_metacharacters() {
        let pattern = PathPattern::parse("/api/v1.0/health").unwrap();
        assert!(pattern.is_match("/api/v1.0/health"));
        assert!(!pattern.is_match("/api/v1x0/health"));
    }

    #[test]
    fn test_regex_patterns() {
        let prefixed = PathPattern::parse(r"regex:^/items/\d+$").unwrap();
        assert!(prefixed.is_match("/items/12"));
        assert!(!prefixed.is_match("/items/abc"));

        let anchored = PathPattern::parse(r"^/v[12]/.*").unwrap();
        assert!(anchored.is_match("/v2/anything"));
        assert_eq!(anchored.as_str(), r"^/v[12]/.*");
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(PathPattern::parse("").is_err());
        assert!(PathPattern::parse("no-leading-slash").is_err());
        assert!(PathPattern::parse("regex:(unclosed").is_err());
    }
}
