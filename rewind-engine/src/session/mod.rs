//! Authenticated session handling.
//!
//! The [`SessionManager`] owns the one live session for a platform instance
//! and wraps every remote call:
//! - refreshes proactively when the token expires within the lookahead window
//! - re-authenticates when a call reports an invalid session
//! - retries timeouts and transient failures with exponential backoff
//!
//! All retry paths share one bounded attempt budget per call.

pub mod credentials;

use crate::config::SessionConfig;
use crate::remote::{AuthGrant, RemoteApi};
use crate::utils::errors::{EngineError, RemoteError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub use credentials::{CredentialSource, Credentials, EnvCredentials, Secret};

/// An access token bound to an instance, with its computed expiry.
#[derive(Clone)]
pub struct Session {
    access_token: String,
    instance_url: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Session {
    pub fn from_grant(grant: AuthGrant, lifetime: chrono::Duration) -> Self {
        Self {
            expires_at: grant.issued_at + lifetime,
            issued_at: grant.issued_at,
            access_token: grant.access_token,
            instance_url: grant.instance_url,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn expires_within(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        now + window >= self.expires_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("instance_url", &self.instance_url)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

pub struct SessionManager {
    api: Arc<dyn RemoteApi>,
    credentials: Arc<dyn CredentialSource>,
    config: SessionConfig,
    current: RwLock<Option<Arc<Session>>>,
    logins: AtomicU64,
}

impl SessionManager {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        credentials: Arc<dyn CredentialSource>,
        config: SessionConfig,
    ) -> Self {
        Self {
            api,
            credentials,
            config,
            current: RwLock::new(None),
            logins: AtomicU64::new(0),
        }
    }

    pub fn api(&self) -> &Arc<dyn RemoteApi> {
        &self.api
    }

    /// Number of successful logins so far.
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    /// Log in now, replacing any held session.
    pub async fn authenticate(&self) -> Result<Arc<Session>> {
        let mut slot = self.current.write().await;
        let session = self.sign_in().await.map_err(|e| match e {
            RemoteError::Transient(_) | RemoteError::Timeout => EngineError::Transient(e.to_string()),
            other => EngineError::Auth(other.to_string()),
        })?;
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Drop the held session.
    pub async fn sign_out(&self) {
        let mut slot = self.current.write().await;
        if slot.take().is_some() {
            info!("Signed out");
        }
    }

    /// Run `op` with a live session, refreshing and retrying as needed.
    ///
    /// `op` may be invoked several times; each invocation receives the session
    /// that is current at that moment.
    pub async fn with_session<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let max = self.config.max_reconnect_attempts;
        let mut attempt = 0u32;

        loop {
            let (used, error) = match self.current_session().await {
                Ok(session) => {
                    let call = tokio::time::timeout(
                        self.config.call_timeout(),
                        op(Arc::clone(&session)),
                    )
                    .await;
                    match call {
                        Ok(Ok(value)) => return Ok(value),
                        Ok(Err(e)) => (Some(session), e),
                        Err(_) => (Some(session), RemoteError::Timeout),
                    }
                }
                Err(e) => (None, e),
            };

            match &error {
                RemoteError::InvalidSession(_) => {
                    if let Some(session) = &used {
                        self.discard(session).await;
                    }
                }
                RemoteError::Transient(_) | RemoteError::Timeout => {}
                RemoteError::AuthFailed(msg) => return Err(EngineError::Auth(msg.clone())),
                RemoteError::Rejected(msg) => return Err(EngineError::Remote(msg.clone())),
            }

            attempt += 1;
            if attempt > max {
                return Err(match error {
                    RemoteError::InvalidSession(msg) => EngineError::Auth(format!(
                        "session still rejected after {} reconnect attempts: {}",
                        max, msg
                    )),
                    other => EngineError::Transient(format!("{} (after {} retries)", other, max)),
                });
            }

            let delay = self.config.backoff(attempt);
            warn!(
                attempt,
                max,
                delay_ms = delay.as_millis() as u64,
                "Remote call failed: {}, retrying",
                error
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// The held session, refreshed first if it is missing or about to expire.
    async fn current_session(&self) -> std::result::Result<Arc<Session>, RemoteError> {
        let lookahead = self.config.lookahead();
        {
            let slot = self.current.read().await;
            if let Some(session) = slot.as_ref() {
                if !session.expires_within(lookahead, Utc::now()) {
                    return Ok(Arc::clone(session));
                }
            }
        }

        let mut slot = self.current.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(session) = slot.as_ref() {
            if !session.expires_within(lookahead, Utc::now()) {
                return Ok(Arc::clone(session));
            }
            info!(expires_at = %session.expires_at(), "Session expires within lookahead window, refreshing");
        }

        let fresh = self.sign_in().await?;
        *slot = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Forget `failed` unless someone already replaced it.
    async fn discard(&self, failed: &Arc<Session>) {
        let mut slot = self.current.write().await;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, failed)) {
            debug!("Discarding rejected session");
            *slot = None;
        }
    }

    async fn sign_in(&self) -> std::result::Result<Arc<Session>, RemoteError> {
        let mut credentials = self
            .credentials
            .acquire()
            .map_err(|e| RemoteError::AuthFailed(e.to_string()))?;

        let result = tokio::time::timeout(
            self.config.call_timeout(),
            self.api.authenticate(&credentials),
        )
        .await;
        credentials.wipe();

        let grant = match result {
            Ok(grant) => grant?,
            Err(_) => return Err(RemoteError::Timeout),
        };

        let session = Session::from_grant(grant, self.config.session_ttl());
        self.logins.fetch_add(1, Ordering::Relaxed);
        info!(
            instance = %session.instance_url(),
            expires_at = %session.expires_at(),
            "Authenticated"
        );
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeApi;
    use crate::schema::ObjectDescribe;
    use std::sync::atomic::AtomicBool;

    fn config() -> SessionConfig {
        SessionConfig {
            lookahead_secs: 60,
            session_ttl_secs: 3600,
            max_reconnect_attempts: 3,
            call_timeout_secs: 5,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 4,
        }
    }

    fn manager(api: Arc<FakeApi>, config: SessionConfig) -> SessionManager {
        SessionManager::new(api, Arc::new(FakeApi::credentials), config)
    }

    type WipeNotices = Arc<std::sync::Mutex<Vec<Arc<AtomicBool>>>>;

    /// A manager whose credential source tags every acquisition with a flag
    /// that flips once that copy has been scrubbed.
    fn observed_manager(api: Arc<FakeApi>, config: SessionConfig) -> (SessionManager, WipeNotices) {
        let notices: WipeNotices = Arc::default();
        let handed_out = Arc::clone(&notices);
        let source = move || {
            let flag = Arc::new(AtomicBool::new(false));
            handed_out.lock().unwrap().push(Arc::clone(&flag));
            FakeApi::credentials().map(|c| c.with_wipe_notice(flag))
        };
        (SessionManager::new(api, Arc::new(source), config), notices)
    }

    fn all_wiped(notices: &WipeNotices) -> bool {
        notices.lock().unwrap().iter().all(|f| f.load(Ordering::SeqCst))
    }

    async fn describe(manager: &SessionManager, object: &str) -> Result<ObjectDescribe> {
        let api = manager.api();
        manager
            .with_session(|s| async move { api.describe(&s, object).await })
            .await
    }

    #[tokio::test]
    async fn test_session_is_reused_while_fresh() {
        let api = Arc::new(FakeApi::crm());
        let manager = manager(Arc::clone(&api), config());

        describe(&manager, "Account").await.unwrap();
        describe(&manager, "Contact").await.unwrap();

        assert_eq!(manager.login_count(), 1);
    }

    #[tokio::test]
    async fn test_refreshes_proactively_inside_lookahead() {
        let api = Arc::new(FakeApi::crm());
        // Every token is already inside the lookahead window when issued.
        let cfg = SessionConfig {
            lookahead_secs: 7200,
            ..config()
        };
        let manager = manager(Arc::clone(&api), cfg);

        describe(&manager, "Account").await.unwrap();
        describe(&manager, "Account").await.unwrap();
        describe(&manager, "Account").await.unwrap();

        assert_eq!(manager.login_count(), 3);
        assert_eq!(api.invalid_session_hits(), 0);
    }

    #[tokio::test]
    async fn test_reauthenticates_after_invalid_session() {
        let api = Arc::new(FakeApi::crm());
        let manager = manager(Arc::clone(&api), config());

        describe(&manager, "Account").await.unwrap();
        api.revoke_sessions();
        describe(&manager, "Account").await.unwrap();

        assert_eq!(manager.login_count(), 2);
        assert_eq!(api.invalid_session_hits(), 1);
    }

    #[tokio::test]
    async fn test_auth_error_after_retry_ceiling() {
        let api = Arc::new(FakeApi::crm());
        api.reject_all_sessions(true);
        let manager = manager(Arc::clone(&api), config());

        let err = describe(&manager, "Account").await.unwrap_err();

        assert!(matches!(err, EngineError::Auth(_)), "got {err:?}");
        // initial attempt + 3 reconnects
        assert_eq!(api.invalid_session_hits(), 4);
        assert_eq!(manager.login_count(), 4);
    }

    #[tokio::test]
    async fn test_bad_credentials_fail_without_retry() {
        let api = Arc::new(FakeApi::crm());
        api.reject_credentials(true);
        let manager = manager(Arc::clone(&api), config());

        let err = describe(&manager, "Account").await.unwrap_err();

        assert!(matches!(err, EngineError::Auth(_)));
        assert_eq!(api.auth_attempts(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let api = Arc::new(FakeApi::crm());
        api.fail_next_calls(2);
        let manager = manager(Arc::clone(&api), config());

        let describe = describe(&manager, "Account").await.unwrap();

        assert_eq!(describe.name, "Account");
        assert_eq!(manager.login_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_escalate_to_transient_error() {
        let api = Arc::new(FakeApi::crm());
        api.set_call_delay(std::time::Duration::from_secs(30));
        let manager = manager(Arc::clone(&api), config());

        let err = describe(&manager, "Account").await.unwrap_err();

        assert!(matches!(err, EngineError::Transient(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_credentials_wiped_after_login() {
        let api = Arc::new(FakeApi::crm());
        let (manager, notices) = observed_manager(Arc::clone(&api), config());

        describe(&manager, "Account").await.unwrap();

        assert_eq!(notices.lock().unwrap().len(), 1);
        assert!(all_wiped(&notices));
    }

    #[tokio::test]
    async fn test_credentials_wiped_after_rejected_login() {
        let api = Arc::new(FakeApi::crm());
        api.reject_credentials(true);
        let (manager, notices) = observed_manager(Arc::clone(&api), config());

        let err = describe(&manager, "Account").await.unwrap_err();

        assert!(matches!(err, EngineError::Auth(_)), "got {err:?}");
        assert_eq!(notices.lock().unwrap().len(), 1);
        assert!(all_wiped(&notices));
    }

    #[tokio::test(start_paused = true)]
    async fn test_credentials_wiped_after_login_timeout() {
        let api = Arc::new(FakeApi::crm());
        api.set_auth_delay(std::time::Duration::from_secs(30));
        let (manager, notices) = observed_manager(Arc::clone(&api), config());

        let err = describe(&manager, "Account").await.unwrap_err();

        assert!(matches!(err, EngineError::Transient(_)), "got {err:?}");
        // initial attempt + 3 retries, each with its own acquisition
        assert_eq!(notices.lock().unwrap().len(), 4);
        assert!(all_wiped(&notices));
        assert_eq!(manager.login_count(), 0);
    }

    #[tokio::test]
    async fn test_sign_out_forces_new_login() {
        let api = Arc::new(FakeApi::crm());
        let manager = manager(Arc::clone(&api), config());

        manager.authenticate().await.unwrap();
        manager.sign_out().await;
        describe(&manager, "Account").await.unwrap();

        assert_eq!(manager.login_count(), 2);
    }

    #[test]
    fn test_expiry_is_computed_from_issue_time() {
        let issued = Utc::now();
        let session = Session::from_grant(
            AuthGrant {
                access_token: "t".into(),
                instance_url: "https://example.my.platform.com".into(),
                issued_at: issued,
            },
            chrono::Duration::hours(2),
        );
        assert_eq!(session.expires_at(), issued + chrono::Duration::hours(2));
        assert!(!session.expires_within(chrono::Duration::minutes(5), issued));
        assert!(session.expires_within(chrono::Duration::minutes(5), issued + chrono::Duration::minutes(116)));
        assert!(!format!("{:?}", session).contains("\"t\""));
    }
}
