//! Credential checks applied on CONNECT.

use std::collections::HashMap;

/// Verifies user name / password pairs.
pub trait Authenticator: Send + Sync {
    /// Whether the credentials are valid. Must not have side effects.
    fn check_valid(&self, username: &str, password: Option<&str>) -> bool;
}

/// Accepts every credential pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn check_valid(&self, _username: &str, _password: Option<&str>) -> bool {
        true
    }
}

/// Fixed table of user names and passwords.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    /// Create an authenticator from user name to password pairs.
    #[must_use]
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

impl Authenticator for StaticAuthenticator {
    fn check_valid(&self, username: &str, password: Option<&str>) -> bool {
        match (self.users.get(username), password) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        }
    }
}
