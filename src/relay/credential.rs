//! Where the relay gets its upstream credential.
//!
//! The credential is resolved on every request, never captured at startup, so
//! rotating the environment or swapping in a fake in tests needs no restart.

use crate::llm::ApiKey;

/// Supplies the upstream API key, or `None` when it is not configured.
pub trait CredentialSource: Send + Sync {
    fn api_key(&self) -> Option<ApiKey>;
}

/// Reads the key from an environment variable at call time. Blank values
/// count as missing.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn var(&self) -> &str {
        &self.var
    }
}

impl CredentialSource for EnvCredential {
    fn api_key(&self) -> Option<ApiKey> {
        std::env::var(&self.var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(ApiKey::new)
    }
}

/// A fixed key (or a fixed absence of one).
#[derive(Debug, Clone)]
pub struct StaticCredential(Option<ApiKey>);

impl StaticCredential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Some(ApiKey::new(key)))
    }

    pub fn missing() -> Self {
        Self(None)
    }
}

impl CredentialSource for StaticCredential {
    fn api_key(&self) -> Option<ApiKey> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_is_missing() {
        let source = EnvCredential::new("PROMPTRELAY_TEST_CREDENTIAL_THAT_IS_NEVER_SET");
        assert!(source.api_key().is_none());
    }

    #[test]
    fn static_credential() {
        assert_eq!(
            StaticCredential::new("k").api_key().map(|k| k.expose().to_owned()),
            Some("k".to_owned())
        );
        assert!(StaticCredential::missing().api_key().is_none());
    }
}
