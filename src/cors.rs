//! Per-bucket CORS rules.
//!
//! Rules are stored as JSON on the bucket row.  Matching follows S3:
//! the first rule whose origin and method (and, for preflight, every
//! requested header) match wins.  Origins may contain a single `*`
//! wildcard, e.g. `https://*.example.com`.

use http::header::{self, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::errors::S3Error;

const ALLOWED_METHODS: [&str; 5] = ["GET", "PUT", "POST", "DELETE", "HEAD"];
const MAX_RULES: usize = 100;

/// A single CORS configuration rule for a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorsRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,
}

/// Header values produced by a successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsMatch {
    pub allowed_origin: String,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub max_age_seconds: Option<u64>,
}

impl CorsMatch {
    fn from_rule(rule: &CorsRule, origin: &str, requested_headers: &[String]) -> Self {
        let allowed_origin = if rule.allowed_origins.iter().any(|o| o == "*") {
            "*".to_string()
        } else {
            origin.to_string()
        };
        // Echo the requested headers rather than a bare `*`.
        let allowed_headers = if rule.allowed_headers.iter().any(|h| h == "*") {
            requested_headers.to_vec()
        } else {
            rule.allowed_headers.clone()
        };
        Self {
            allowed_origin,
            allowed_methods: rule.allowed_methods.clone(),
            allowed_headers,
            expose_headers: rule.expose_headers.clone(),
            max_age_seconds: rule.max_age_seconds,
        }
    }

    /// Add the `Access-Control-*` headers for this match.
    pub fn apply(&self, headers: &mut HeaderMap, preflight: bool) {
        insert_joined(headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, &[self.allowed_origin.clone()]);
        if !self.expose_headers.is_empty() {
            insert_joined(headers, header::ACCESS_CONTROL_EXPOSE_HEADERS, &self.expose_headers);
        }
        if self.allowed_origin != "*" {
            headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }
        if preflight {
            insert_joined(headers, header::ACCESS_CONTROL_ALLOW_METHODS, &self.allowed_methods);
            if !self.allowed_headers.is_empty() {
                insert_joined(headers, header::ACCESS_CONTROL_ALLOW_HEADERS, &self.allowed_headers);
            }
            if let Some(max_age) = self.max_age_seconds {
                headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(max_age));
            }
        }
    }
}

fn insert_joined(headers: &mut HeaderMap, name: header::HeaderName, values: &[String]) {
    if let Ok(value) = HeaderValue::from_str(&values.join(", ")) {
        headers.insert(name, value);
    }
}

/// Match an origin pattern against an actual origin.
pub fn match_origin(pattern: &str, origin: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == origin,
        Some((head, tail)) => {
            origin.len() >= head.len() + tail.len()
                && origin.starts_with(head)
                && origin.ends_with(tail)
        }
    }
}

fn headers_allowed(allowed: &[String], requested: &[String]) -> bool {
    if allowed.iter().any(|h| h == "*") {
        return true;
    }
    requested
        .iter()
        .all(|req| allowed.iter().any(|a| a.eq_ignore_ascii_case(req)))
}

fn rule_admits(rule: &CorsRule, origin: &str, method: &str) -> bool {
    rule.allowed_origins.iter().any(|p| match_origin(p, origin))
        && rule
            .allowed_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
}

/// Match an actual (non-preflight) request.
pub fn match_request(rules: &[CorsRule], origin: &str, method: &str) -> Option<CorsMatch> {
    rules
        .iter()
        .find(|rule| rule_admits(rule, origin, method))
        .map(|rule| CorsMatch::from_rule(rule, origin, &[]))
}

/// Match an `OPTIONS` preflight, including `Access-Control-Request-Headers`.
pub fn match_preflight(
    rules: &[CorsRule],
    origin: &str,
    request_method: &str,
    request_headers: &[String],
) -> Option<CorsMatch> {
    rules
        .iter()
        .find(|rule| {
            rule_admits(rule, origin, request_method)
                && headers_allowed(&rule.allowed_headers, request_headers)
        })
        .map(|rule| CorsMatch::from_rule(rule, origin, request_headers))
}

/// Split a comma-separated `Access-Control-Request-Headers` value.
pub fn parse_request_headers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}

/// Reject configurations S3 would refuse.
pub fn validate_rules(rules: &[CorsRule]) -> Result<(), S3Error> {
    if rules.is_empty() || rules.len() > MAX_RULES {
        return Err(S3Error::MalformedXML);
    }
    for rule in rules {
        if rule.allowed_origins.is_empty() || rule.allowed_methods.is_empty() {
            return Err(S3Error::MalformedXML);
        }
        if let Some(bad) = rule
            .allowed_methods
            .iter()
            .find(|m| !ALLOWED_METHODS.contains(&m.as_str()))
        {
            return Err(S3Error::InvalidArgument {
                message: format!("Found unsupported HTTP method in CORS config. Unsupported method is {bad}"),
            });
        }
        if rule.allowed_origins.iter().any(|o| o.matches('*').count() > 1) {
            return Err(S3Error::InvalidArgument {
                message: "AllowedOrigin can not have more than one wildcard.".to_string(),
            });
        }
    }
    Ok(())
}

/// Decode rules stored on a bucket row.
pub fn rules_from_json(json: &str) -> Result<Vec<CorsRule>, S3Error> {
    serde_json::from_str(json)
        .map_err(|e| S3Error::InternalError(anyhow::anyhow!("stored CORS rules unreadable: {e}")))
}

pub fn rules_to_json(rules: &[CorsRule]) -> Result<String, S3Error> {
    serde_json::to_string(rules).map_err(|e| S3Error::InternalError(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permissive_rule() -> CorsRule {
        CorsRule {
            id: None,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec!["GET".to_string(), "PUT".to_string()],
            allowed_headers: vec!["*".to_string()],
            expose_headers: vec!["ETag".to_string()],
            max_age_seconds: Some(3600),
        }
    }

    fn strict_rule() -> CorsRule {
        CorsRule {
            id: Some("strict".to_string()),
            allowed_origins: vec!["https://*.example.com".to_string()],
            allowed_methods: vec!["GET".to_string()],
            allowed_headers: vec!["content-type".to_string()],
            expose_headers: vec![],
            max_age_seconds: None,
        }
    }

    #[test]
    fn test_wildcard_origin_patterns() {
        assert!(match_origin("*", "https://anything"));
        assert!(match_origin("https://*.example.com", "https://app.example.com"));
        assert!(!match_origin("https://*.example.com", "https://example.org"));
        assert!(!match_origin("https://a.com", "https://b.com"));
    }

    #[test]
    fn test_actual_request_match() {
        let rules = vec![strict_rule()];
        let m = match_request(&rules, "https://app.example.com", "GET").unwrap();
        assert_eq!(m.allowed_origin, "https://app.example.com");
        assert!(match_request(&rules, "https://app.example.com", "PUT").is_none());
    }

    #[test]
    fn test_preflight_checks_headers() {
        let rules = vec![strict_rule()];
        let ok = vec!["content-type".to_string()];
        let bad = vec!["x-custom".to_string()];
        assert!(match_preflight(&rules, "https://a.example.com", "GET", &ok).is_some());
        assert!(match_preflight(&rules, "https://a.example.com", "GET", &bad).is_none());
    }

    #[test]
    fn test_preflight_headers_applied() {
        let rules = vec![permissive_rule()];
        let requested = parse_request_headers("X-Amz-Date, Content-Type");
        let m = match_preflight(&rules, "https://site", "PUT", &requested).unwrap();
        let mut headers = HeaderMap::new();
        m.apply(&mut headers, true);
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert_eq!(headers["access-control-allow-methods"], "GET, PUT");
        assert_eq!(headers["access-control-allow-headers"], "x-amz-date, content-type");
        assert_eq!(headers["access-control-max-age"], "3600");
        assert_eq!(headers["access-control-expose-headers"], "ETag");
    }

    #[test]
    fn test_validate_rejects_bad_method() {
        let mut rule = permissive_rule();
        rule.allowed_methods.push("PATCH".to_string());
        assert!(matches!(
            validate_rules(&[rule]),
            Err(S3Error::InvalidArgument { .. })
        ));
        assert!(validate_rules(&[]).is_err());
        assert!(validate_rules(&[permissive_rule(), strict_rule()]).is_ok());
    }

    #[test]
    fn test_json_storage() {
        let rules = vec![permissive_rule(), strict_rule()];
        let json = rules_to_json(&rules).unwrap();
        assert_eq!(rules_from_json(&json).unwrap(), rules);
    }
}
