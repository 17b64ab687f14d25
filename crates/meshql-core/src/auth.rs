//! The authorization capability consumed by searchers and the resolution engine.

use std::collections::HashMap;

use crate::envelope::{tokens_permit, Envelope};

/// Inbound request metadata an [`Auth`] implementation derives credentials from.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    headers: HashMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header; names are matched case-insensitively.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The raw `Authorization` header, forwarded verbatim on subgraph calls.
    pub fn authorization(&self) -> Option<&str> {
        self.header("authorization")
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for RequestContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |ctx, (k, v)| ctx.with_header(k, v))
    }
}

/// Credential extraction and the per-envelope authorization decision.
pub trait Auth: Send + Sync {
    /// Credentials presented by the caller of this request.
    fn get_auth_token(&self, context: &RequestContext) -> Vec<String>;

    /// Whether `credentials` may read `envelope`.
    fn is_authorized(&self, credentials: &[String], envelope: &Envelope) -> bool {
        tokens_permit(&envelope.authorized_tokens, credentials)
    }
}

/// Authorization disabled: every caller sees every envelope.
#[derive(Debug, Clone, Default)]
pub struct NoAuth;

impl Auth for NoAuth {
    fn get_auth_token(&self, _context: &RequestContext) -> Vec<String> {
        vec!["anonymous".to_string()]
    }

    fn is_authorized(&self, _credentials: &[String], _envelope: &Envelope) -> bool {
        true
    }
}

/// Uses the bearer token text itself as the caller's single credential.
#[derive(Debug, Clone, Default)]
pub struct BearerAuth;

impl Auth for BearerAuth {
    fn get_auth_token(&self, context: &RequestContext) -> Vec<String> {
        let Some(header) = context.authorization() else {
            return Vec::new();
        };
        let token = match header.split_once(' ') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
            _ => header.trim(),
        };
        if token.is_empty() {
            Vec::new()
        } else {
            vec![token.to_string()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guarded(tokens: &[&str]) -> Envelope {
        Envelope::default().with_authorized_tokens(tokens.iter().map(|t| t.to_string()).collect())
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let ctx = RequestContext::new().with_header("Authorization", "Bearer abc");
        assert_eq!(ctx.authorization(), Some("Bearer abc"));
        assert_eq!(ctx.header("AUTHORIZATION"), Some("Bearer abc"));
        assert_eq!(ctx.header("x-missing"), None);
    }

    #[test]
    fn test_bearer_token_extraction() {
        let auth = BearerAuth;
        let ctx: RequestContext = [("authorization", "Bearer A")].into_iter().collect();
        assert_eq!(auth.get_auth_token(&ctx), vec!["A".to_string()]);

        let raw = RequestContext::new().with_header("Authorization", "token-b");
        assert_eq!(auth.get_auth_token(&raw), vec!["token-b".to_string()]);

        assert!(auth.get_auth_token(&RequestContext::new()).is_empty());
    }

    #[test]
    fn test_default_authorization_rule() {
        let auth = BearerAuth;
        let a = vec!["A".to_string()];
        let b = vec!["B".to_string()];

        assert!(auth.is_authorized(&a, &guarded(&["A"])));
        assert!(!auth.is_authorized(&b, &guarded(&["A"])));
        assert!(auth.is_authorized(&b, &guarded(&[])));
        assert!(!auth.is_authorized(&[], &guarded(&["A"])));
    }

    #[test]
    fn test_no_auth_allows_everything() {
        let auth = NoAuth;
        assert!(auth.is_authorized(&[], &guarded(&["A"])));
        assert_eq!(auth.get_auth_token(&RequestContext::new()).len(), 1);
    }
}
