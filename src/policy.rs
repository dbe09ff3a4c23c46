//! Bucket policy documents and their evaluation.
//!
//! Policies use IAM JSON syntax.  Evaluation only looks at principal,
//! action and resource; `Condition` blocks are accepted and ignored.
//! The bucket owner is always allowed unless a statement explicitly
//! denies them, while any other principal needs an explicit `Allow`.

use serde::{Deserialize, Serialize};

use crate::errors::S3Error;

const ARN_PREFIX: &str = "arn:aws:s3:::";

/// S3-compatible bucket policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketPolicy {
    #[serde(rename = "Version")]
    pub version: String,

    #[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "Statement")]
    pub statements: Vec<Statement>,
}

/// A single policy statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename = "Sid", default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    #[serde(rename = "Effect")]
    pub effect: Effect,

    #[serde(rename = "Principal")]
    pub principal: Principal,

    #[serde(rename = "Action")]
    pub action: OneOrMany,

    #[serde(rename = "Resource")]
    pub resource: OneOrMany,

    #[serde(rename = "Condition", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// `"*"` or `{"AWS": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Principal {
    Wildcard(String),
    Aws {
        #[serde(rename = "AWS")]
        aws: OneOrMany,
    },
}

/// A string or a list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            OneOrMany::One(s) => std::slice::from_ref(s),
            OneOrMany::Many(v) => v,
        };
        slice.iter().map(String::as_str)
    }

    fn is_empty(&self) -> bool {
        self.iter().all(str::is_empty)
    }

    fn any_matches(&self, value: &str) -> bool {
        self.iter().any(|p| wildcard_match(p, value))
    }
}

/// Result of policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny,
    ImplicitDeny,
}

/// ARN of a bucket, or of a key within it.
pub fn resource_arn(bucket: &str, key: Option<&str>) -> String {
    match key {
        Some(key) => format!("{ARN_PREFIX}{bucket}/{key}"),
        None => format!("{ARN_PREFIX}{bucket}"),
    }
}

impl BucketPolicy {
    /// Parse and validate a policy submitted for `bucket`.
    pub fn parse(json: &str, bucket: &str) -> Result<Self, S3Error> {
        let policy: BucketPolicy =
            serde_json::from_str(json).map_err(|e| S3Error::MalformedPolicy {
                message: format!("Policies must be valid JSON: {e}"),
            })?;
        policy.validate(bucket)?;
        Ok(policy)
    }

    fn validate(&self, bucket: &str) -> Result<(), S3Error> {
        if self.version != "2012-10-17" && self.version != "2008-10-17" {
            return Err(S3Error::MalformedPolicy {
                message: format!("Invalid policy version: {}", self.version),
            });
        }
        if self.statements.is_empty() {
            return Err(S3Error::MalformedPolicy {
                message: "Policy has no statements".to_string(),
            });
        }
        let own_arn = resource_arn(bucket, None);
        for statement in &self.statements {
            if statement.action.is_empty() {
                return Err(S3Error::MalformedPolicy {
                    message: "Policy statement has no action".to_string(),
                });
            }
            if statement.resource.is_empty() {
                return Err(S3Error::MalformedPolicy {
                    message: "Policy statement has no resource".to_string(),
                });
            }
            for resource in statement.resource.iter() {
                let covers_bucket = resource == own_arn
                    || resource
                        .strip_prefix(&own_arn)
                        .is_some_and(|rest| rest.starts_with('/'));
                if !covers_bucket {
                    return Err(S3Error::MalformedPolicy {
                        message: format!("Policy has invalid resource: {resource}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Combine every matching statement; explicit deny wins.
    pub fn evaluate(&self, principal: &str, action: &str, resource: &str) -> PolicyDecision {
        let mut allowed = false;
        for statement in &self.statements {
            if !statement.matches_principal(principal)
                || !statement.action.any_matches(action)
                || !statement.resource.any_matches(resource)
            {
                continue;
            }
            match statement.effect {
                Effect::Deny => return PolicyDecision::Deny,
                Effect::Allow => allowed = true,
            }
        }
        if allowed {
            PolicyDecision::Allow
        } else {
            PolicyDecision::ImplicitDeny
        }
    }

    pub fn to_json(&self) -> Result<String, S3Error> {
        serde_json::to_string(self).map_err(|e| S3Error::InternalError(e.into()))
    }
}

impl Statement {
    fn matches_principal(&self, principal: &str) -> bool {
        match &self.principal {
            Principal::Wildcard(s) => s == "*",
            Principal::Aws { aws } => aws.iter().any(|p| {
                p == "*"
                    || p == principal
                    || p.rsplit_once(":user/").is_some_and(|(_, name)| name == principal)
            }),
        }
    }
}

/// Decide whether `principal` may perform `action` on `resource` in a
/// bucket owned by `owner_id`.
pub fn is_permitted(
    owner_id: &str,
    policy: Option<&BucketPolicy>,
    principal: &str,
    action: &str,
    resource: &str,
) -> bool {
    let decision = policy.map_or(PolicyDecision::ImplicitDeny, |p| {
        p.evaluate(principal, action, resource)
    });
    match decision {
        PolicyDecision::Deny => false,
        PolicyDecision::Allow => true,
        PolicyDecision::ImplicitDeny => principal == owner_id,
    }
}

/// Glob match supporting `*` (any run) and `?` (one character).
fn wildcard_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    let (mut pi, mut vi) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while vi < v.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, vi));
            pi += 1;
        } else if let Some((sp, sv)) = star {
            pi = sp + 1;
            vi = sv + 1;
            star = Some((sp, sv + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLIC_READ: &str = r#"{
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "PublicRead",
            "Effect": "Allow",
            "Principal": "*",
            "Action": "s3:GetObject",
            "Resource": "arn:aws:s3:::photos/*"
        }]
    }"#;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("s3:*", "s3:GetObject"));
        assert!(wildcard_match("arn:aws:s3:::b/*.jpg", "arn:aws:s3:::b/x/y.jpg"));
        assert!(wildcard_match("s3:Get?bject", "s3:GetObject"));
        assert!(!wildcard_match("s3:Put*", "s3:GetObject"));
        assert!(wildcard_match("*", ""));
    }

    #[test]
    fn test_public_read_allows_anyone_to_get() {
        let policy = BucketPolicy::parse(PUBLIC_READ, "photos").unwrap();
        let object = resource_arn("photos", Some("cat.jpg"));
        assert!(is_permitted("alice", Some(&policy), "bob", "s3:GetObject", &object));
        assert!(!is_permitted("alice", Some(&policy), "bob", "s3:PutObject", &object));
        assert!(is_permitted("alice", Some(&policy), "alice", "s3:PutObject", &object));
    }

    #[test]
    fn test_explicit_deny_binds_owner() {
        let json = r#"{
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Deny",
                "Principal": {"AWS": ["alice"]},
                "Action": ["s3:DeleteObject"],
                "Resource": ["arn:aws:s3:::photos/*"]
            }]
        }"#;
        let policy = BucketPolicy::parse(json, "photos").unwrap();
        let object = resource_arn("photos", Some("k"));
        assert!(!is_permitted("alice", Some(&policy), "alice", "s3:DeleteObject", &object));
        assert!(is_permitted("alice", Some(&policy), "alice", "s3:GetObject", &object));
    }

    #[test]
    fn test_no_policy_means_owner_only() {
        let bucket = resource_arn("b", None);
        assert!(is_permitted("alice", None, "alice", "s3:ListBucket", &bucket));
        assert!(!is_permitted("alice", None, "bob", "s3:ListBucket", &bucket));
    }

    #[test]
    fn test_principal_arn_matches_user_name() {
        let json = r#"{
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {"AWS": "arn:aws:iam::123456789012:user/bob"},
                "Action": "s3:ListBucket",
                "Resource": "arn:aws:s3:::b"
            }]
        }"#;
        let policy = BucketPolicy::parse(json, "b").unwrap();
        assert!(is_permitted("alice", Some(&policy), "bob", "s3:ListBucket", &resource_arn("b", None)));
    }

    #[test]
    fn test_rejects_foreign_resource_and_bad_json() {
        let json = PUBLIC_READ.replace("photos", "other");
        assert!(matches!(
            BucketPolicy::parse(&json, "photos"),
            Err(S3Error::MalformedPolicy { .. })
        ));
        assert!(matches!(
            BucketPolicy::parse("{not json", "photos"),
            Err(S3Error::MalformedPolicy { .. })
        ));
        // "photos-evil" must not pass as a resource of "photos".
        let json = PUBLIC_READ.replace("photos/*", "photos-evil/*");
        assert!(BucketPolicy::parse(&json, "photos").is_err());
    }
}
