//! Login checks for control links.

use std::collections::HashMap;

use async_trait::async_trait;
use imux_core::config::UserEntry;

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Accepts the users listed in the `[[users]]` config table.
pub struct ConfigAuthenticator {
    digests: HashMap<String, String>,
}

impl ConfigAuthenticator {
    pub fn new(users: &[UserEntry]) -> Self {
        let digests = users
            .iter()
            .map(|u| (u.name.clone(), u.password_blake3.to_ascii_lowercase()))
            .collect();
        Self { digests }
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

/// Hex BLAKE3 digest stored for a password.
pub fn password_digest(password: &str) -> String {
    hex::encode(blake3::hash(password.as_bytes()).as_bytes())
}

#[async_trait]
impl Authenticator for ConfigAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> bool {
        let Some(stored) = self.digests.get(username) else {
            return false;
        };
        // blake3::Hash compares in constant time.
        match blake3::Hash::from_hex(stored) {
            Ok(stored) => stored == blake3::hash(password.as_bytes()),
            Err(_) => {
                tracing::warn!(username, "stored password digest is not valid hex");
                false
            }
        }
    }
}
