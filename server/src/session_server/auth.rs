//! Connection authentication.
//!
//! The gateway accepts no document request until the connection's `hello`
//! token maps to an identity. Everything past this point trusts the
//! identity as given.

use subtle::ConstantTimeEq;

use cosheet_config::{AuthMode, AuthSettings, Role, TokenGrant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<Identity>;
}

/// Tokens from `[auth.tokens]`, compared in constant time.
pub struct TokenAuthenticator {
    grants: Vec<(Vec<u8>, TokenGrant)>,
}

impl TokenAuthenticator {
    pub fn new<'a>(grants: impl IntoIterator<Item = (&'a String, &'a TokenGrant)>) -> Self {
        Self {
            grants: grants
                .into_iter()
                .map(|(token, grant)| (token.as_bytes().to_vec(), grant.clone()))
                .collect(),
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<Identity> {
        let provided = token.as_bytes();
        let mut found = None;
        // No early exit: every grant is compared.
        for (expected, grant) in &self.grants {
            if bool::from(expected.ct_eq(provided)) {
                found = Some(Identity {
                    user_id: grant.user.clone(),
                    role: grant.role,
                });
            }
        }
        found
    }
}

/// Takes the token as the user id. For local development only.
pub struct TrustAuthenticator;

impl Authenticator for TrustAuthenticator {
    fn authenticate(&self, token: &str) -> Option<Identity> {
        let user = token.trim();
        if user.is_empty() {
            return None;
        }
        Some(Identity {
            user_id: user.to_string(),
            role: Role::Editor,
        })
    }
}

pub fn from_settings(settings: &AuthSettings) -> Box<dyn Authenticator> {
    match settings.mode {
        AuthMode::Token => Box::new(TokenAuthenticator::new(&settings.tokens)),
        AuthMode::Trust => {
            log::warn!("auth.mode = \"trust\": any non-empty token is accepted as a user id");
            Box::new(TrustAuthenticator)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn settings() -> AuthSettings {
        let mut tokens = BTreeMap::new();
        tokens.insert(
            "t-alice".to_string(),
            TokenGrant { user: "alice".into(), role: Role::Editor },
        );
        tokens.insert(
            "t-bob".to_string(),
            TokenGrant { user: "bob".into(), role: Role::Viewer },
        );
        AuthSettings { mode: AuthMode::Token, tokens }
    }

    #[test]
    fn test_token_lookup() {
        let auth = from_settings(&settings());
        assert_eq!(
            auth.authenticate("t-bob"),
            Some(Identity { user_id: "bob".into(), role: Role::Viewer })
        );
        assert_eq!(auth.authenticate("t-alice").unwrap().role, Role::Editor);
        assert_eq!(auth.authenticate("t-alic"), None);
        assert_eq!(auth.authenticate(""), None);
    }

    #[test]
    fn test_trust_mode() {
        let auth = TrustAuthenticator;
        assert_eq!(auth.authenticate(" carol ").unwrap().user_id, "carol");
        assert_eq!(auth.authenticate("   "), None);
    }
}
