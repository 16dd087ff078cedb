// Driver session module
//
// Caches one driver instance per account and applies the login policy:
// stored cookies are installed without validation first, a credential
// login runs second. Each driver is constructed around an HTTP client
// that already carries the account's pinned proxy, so concurrent calls on
// different accounts never share a mutable dispatcher.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::driver::{Driver, DriverError, DriverFactory};
use crate::models::{mask_username, Account, Cookie, OrchestratorConfig};
use crate::modules::{AccountRegistry, ProxyPool};
use crate::orchestrator::classifier;

/// Cookies captured and persisted after a credential login.
const SESSION_COOKIE_KEYS: [&str; 3] = ["auth_token", "ct0", "guest_id"];

pub struct DriverSession {
    factory: Arc<dyn DriverFactory>,
    registry: Arc<AccountRegistry>,
    pool: Arc<ProxyPool>,
    /// username → account-bound driver
    drivers: DashMap<String, Arc<dyn Driver>>,
    /// usernames with a live session (cookies installed or login done)
    authenticated: DashMap<String, ()>,
    login_timeout: Duration,
    login_pause: Duration,
}

impl DriverSession {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        registry: Arc<AccountRegistry>,
        pool: Arc<ProxyPool>,
        cfg: &OrchestratorConfig,
    ) -> Self {
        Self {
            factory,
            registry,
            pool,
            drivers: DashMap::new(),
            authenticated: DashMap::new(),
            login_timeout: cfg.login_timeout(),
            login_pause: cfg.login_pause(),
        }
    }

    /// The account's driver, created on first use with the pinned proxy.
    fn driver_for(&self, account: &Account) -> Arc<dyn Driver> {
        if let Some(driver) = self.drivers.get(&account.username) {
            return driver.clone();
        }
        let http = match self.pool.assign(&account.username) {
            Some(proxy) => self.pool.client_for(&proxy),
            None => reqwest::Client::new(),
        };
        let driver = self.factory.connect(&account.username, http);
        self.drivers
            .insert(account.username.clone(), driver.clone());
        driver
    }

    /// Authenticate the account and return its driver.
    ///
    /// Stored cookies are installed lazily: session rot only surfaces on
    /// the first real call, where it classifies as AUTH or SUSPENDED.
    pub async fn ensure_login(&self, account: &Account) -> Result<Arc<dyn Driver>, DriverError> {
        if account.is_locked {
            return Err(DriverError::new(format!(
                "account {} is locked, login refused",
                account.username
            )));
        }

        let driver = self.driver_for(account);
        if self.authenticated.contains_key(&account.username) {
            return Ok(driver);
        }

        if account.has_session() {
            driver.set_cookies(&account.cookie_pairs()).await?;
            self.authenticated.insert(account.username.clone(), ());
            tracing::debug!(
                "[Session] Account {} reusing {} stored cookie(s)",
                mask_username(&account.username),
                account.cookies.len()
            );
            return Ok(driver);
        }

        // Anti-burst pause so mass logins do not land in the same instant
        tokio::time::sleep(self.login_pause).await;

        let attempt = tokio::time::timeout(
            self.login_timeout,
            driver.login(
                &account.username,
                &account.password,
                &account.email,
                &account.two_factor_secret,
            ),
        )
        .await;

        match attempt {
            Err(_) => Err(DriverError::new(format!(
                "login timed out after {}s",
                self.login_timeout.as_secs()
            ))),
            Ok(Err(e)) => {
                if classifier::has_locked_code(&e.message) {
                    tracing::warn!(
                        "[Session] Login for {} returned lock code, persisting",
                        mask_username(&account.username)
                    );
                    if let Err(persist_err) = self.registry.mark_locked(&account.username).await {
                        tracing::error!(
                            "[Session] Failed to persist lock for {}: {}",
                            mask_username(&account.username),
                            persist_err
                        );
                    }
                }
                Err(e)
            }
            Ok(Ok(())) => {
                let captured = capture_session_cookies(
                    &driver.get_cookies().await.unwrap_or_default(),
                );
                if !captured.is_empty() {
                    if let Err(e) = self
                        .registry
                        .set_cookies(&account.username, captured)
                        .await
                    {
                        tracing::error!(
                            "[Session] Failed to persist cookies for {}: {}",
                            mask_username(&account.username),
                            e
                        );
                    }
                }
                self.authenticated.insert(account.username.clone(), ());
                tracing::info!(
                    "[Session] Account {} logged in",
                    mask_username(&account.username)
                );
                Ok(driver)
            }
        }
    }

    /// Drop the cached session so the next use re-authenticates. Used when
    /// an account comes back from admin recovery or its session rots.
    pub fn discard(&self, username: &str) {
        self.drivers.remove(username);
        self.authenticated.remove(username);
    }

    pub fn is_authenticated(&self, username: &str) -> bool {
        self.authenticated.contains_key(username)
    }
}

fn capture_session_cookies(cookies: &[Cookie]) -> Vec<Cookie> {
    cookies
        .iter()
        .filter(|c| SESSION_COOKIE_KEYS.contains(&c.key.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::MockFactory;
    use std::sync::atomic::Ordering;

    fn quick_cfg() -> OrchestratorConfig {
        let mut cfg = OrchestratorConfig::default();
        cfg.login_pause_ms = 0;
        cfg.login_timeout_secs = 1;
        cfg
    }

    async fn session_with(
        accounts: Vec<Account>,
    ) -> (tempfile::TempDir, Arc<MockFactory>, Arc<AccountRegistry>, DriverSession) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(AccountRegistry::new(dir.path().join("data.json")));
        registry.load().await.unwrap();
        for account in accounts {
            registry.add_account(account).await.unwrap();
        }
        let pool = Arc::new(ProxyPool::new(
            dir.path().join("proxies.txt"),
            Duration::from_millis(1000),
        ));
        pool.load().unwrap();
        let factory = Arc::new(MockFactory::default());
        let session = DriverSession::new(factory.clone(), registry.clone(), pool, &quick_cfg());
        (dir, factory, registry, session)
    }

    fn account_with_cookies(username: &str) -> Account {
        let mut account = Account::new(username, "pw", format!("{}@example.com", username), "");
        account.cookies.push(Cookie::new("auth_token", "tok"));
        account
    }

    #[tokio::test]
    async fn test_cookie_reuse_skips_login() {
        let (_dir, factory, _registry, session) =
            session_with(vec![account_with_cookies("alice")]).await;
        let account = account_with_cookies("alice");

        session.ensure_login(&account).await.unwrap();
        let mock = factory.driver("alice");
        assert_eq!(mock.set_cookie_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.login_calls.load(Ordering::SeqCst), 0);

        // Second call is a no-op: the session is cached
        session.ensure_login(&account).await.unwrap();
        assert_eq!(mock.set_cookie_calls.load(Ordering::SeqCst), 1);
        assert!(session.is_authenticated("alice"));
    }

    #[tokio::test]
    async fn test_credential_login_persists_session_cookies() {
        let account = Account::new("bob", "pw", "bob@example.com", "");
        let (_dir, factory, registry, session) = session_with(vec![account.clone()]).await;

        session.ensure_login(&account).await.unwrap();
        let mock = factory.driver("bob");
        assert_eq!(mock.login_calls.load(Ordering::SeqCst), 1);

        let stored = registry.find_by_username("bob").await.unwrap();
        let keys: Vec<&str> = stored.cookies.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["auth_token", "ct0", "guest_id"]);
    }

    #[tokio::test]
    async fn test_locked_account_refused_without_driver_call() {
        let mut account = Account::new("carol", "pw", "carol@example.com", "");
        account.is_locked = true;
        let (_dir, factory, _registry, session) = session_with(vec![account.clone()]).await;

        let err = session.ensure_login(&account).await.unwrap_err();
        assert!(err.message.contains("locked"));
        // No driver was ever created for the account
        assert!(factory.drivers.get("carol").is_none());
    }

    #[tokio::test]
    async fn test_lock_code_in_login_error_persists_lock() {
        let account = Account::new("dave", "pw", "dave@example.com", "");
        let (_dir, factory, registry, session) = session_with(vec![account.clone()]).await;

        let mock = factory.driver("dave");
        *mock.login_error.lock() =
            Some(r#"{"errors":[{"code":326,"message":"locked"}]}"#.to_string());

        let err = session.ensure_login(&account).await.unwrap_err();
        assert!(classifier::has_locked_code(&err.message));

        let stored = registry.find_by_username("dave").await.unwrap();
        assert!(stored.is_locked);
        assert!(!stored.usable);
    }

    #[tokio::test]
    async fn test_login_timeout_maps_to_timeout_message() {
        let account = Account::new("erin", "pw", "erin@example.com", "");
        let (_dir, factory, _registry, session) = session_with(vec![account.clone()]).await;

        let mock = factory.driver("erin");
        *mock.login_delay.lock() = Some(Duration::from_secs(5));

        let err = session.ensure_login(&account).await.unwrap_err();
        assert!(err.message.contains("timed out"));
        assert_eq!(
            classifier::classify_error(&err.message),
            crate::models::ErrorKind::Timeout
        );
    }

    #[tokio::test]
    async fn test_discard_forces_reauthentication() {
        let (_dir, factory, _registry, session) =
            session_with(vec![account_with_cookies("alice")]).await;
        let account = account_with_cookies("alice");

        session.ensure_login(&account).await.unwrap();
        session.discard("alice");
        assert!(!session.is_authenticated("alice"));

        session.ensure_login(&account).await.unwrap();
        let mock = factory.driver("alice");
        assert_eq!(mock.set_cookie_calls.load(Ordering::SeqCst), 2);
    }
}
