use chrono::{DateTime, Utc};

/// One-time runner registration token
///
/// Neither `Clone` nor `Serialize`. The secret is only readable through
/// [`RegistrationToken::into_secret`], which consumes the token: it reaches
/// the agent configuration exactly once, and a failed configuration has to
/// fetch a fresh one.
pub struct RegistrationToken {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl RegistrationToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    /// Expiry reported by the control plane, if any
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn into_secret(self) -> String {
        self.secret
    }
}

impl std::fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationToken")
            .field("secret", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let fresh = RegistrationToken::new("a", Some(now + Duration::hours(1)));
        let stale = RegistrationToken::new("b", Some(now - Duration::seconds(1)));
        let unknown = RegistrationToken::new("c", None);
        assert!(!fresh.is_expired_at(now));
        assert!(stale.is_expired_at(now));
        assert!(!unknown.is_expired_at(now));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let token = RegistrationToken::new("AABBCCDD", None);
        assert!(!format!("{:?}", token).contains("AABBCCDD"));
    }
}
