//! Short-lived login credentials.
//!
//! Credentials are acquired from a [`CredentialSource`] for exactly one login
//! attempt and scrubbed as soon as that attempt finishes. `Drop` scrubs as
//! well, so an early return, a panic or a cancelled future cannot leave the
//! secrets behind.

use crate::utils::errors::{EngineError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Credentials {
    username: String,
    password: String,
    security_token: String,
    client_secret: String,
    wiped: Option<Arc<AtomicBool>>,
}

/// Secret text derived from credentials, scrubbed on drop.
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        scrub(&mut self.0);
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        security_token: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            security_token: security_token.into(),
            client_secret: client_secret.into(),
            wiped: None,
        }
    }

    /// Raise `flag` once the secrets have been scrubbed.
    pub fn with_wipe_notice(mut self, flag: Arc<AtomicBool>) -> Self {
        self.wiped = Some(flag);
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn security_token(&self) -> &str {
        &self.security_token
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Password with the security token appended, as the password grant
    /// expects it.
    pub fn password_with_token(&self) -> Secret {
        let mut joined = String::with_capacity(self.password.len() + self.security_token.len());
        joined.push_str(&self.password);
        joined.push_str(&self.security_token);
        Secret(joined)
    }

    /// Overwrite every secret byte and leave the fields empty.
    pub fn wipe(&mut self) {
        scrub(&mut self.username);
        scrub(&mut self.password);
        scrub(&mut self.security_token);
        scrub(&mut self.client_secret);
        if let Some(flag) = &self.wiped {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_wiped(&self) -> bool {
        self.username.is_empty()
            && self.password.is_empty()
            && self.security_token.is_empty()
            && self.client_secret.is_empty()
    }
}

fn scrub(value: &mut String) {
    let mut bytes = std::mem::take(value).into_bytes();
    bytes.iter_mut().for_each(|b| *b = 0);
    std::hint::black_box(&bytes);
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("security_token", &"<redacted>")
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Hands out fresh credentials each time a login is needed.
pub trait CredentialSource: Send + Sync {
    fn acquire(&self) -> Result<Credentials>;
}

impl<F> CredentialSource for F
where
    F: Fn() -> Result<Credentials> + Send + Sync,
{
    fn acquire(&self) -> Result<Credentials> {
        self()
    }
}

/// Reads `REWIND_<PREFIX>_USERNAME`, `_PASSWORD`, `_SECURITY_TOKEN` and
/// `_CLIENT_SECRET` from the process environment on every acquisition.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    prefix: String,
}

impl EnvCredentials {
    pub fn new(environment: &str) -> Self {
        Self {
            prefix: format!("REWIND_{}", environment.to_ascii_uppercase()),
        }
    }

    fn var(&self, suffix: &str) -> Result<String> {
        let key = format!("{}_{}", self.prefix, suffix);
        std::env::var(&key).map_err(|_| EngineError::Auth(format!("{} is not set", key)))
    }
}

impl CredentialSource for EnvCredentials {
    fn acquire(&self) -> Result<Credentials> {
        Ok(Credentials::new(
            self.var("USERNAME")?,
            self.var("PASSWORD")?,
            self.var("SECURITY_TOKEN").unwrap_or_default(),
            self.var("CLIENT_SECRET").unwrap_or_default(),
        ))
    }
}
