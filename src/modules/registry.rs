// Account registry module
//
// Exclusive owner of the persisted account file (`data.json`). Every
// mutation rewrites the whole set atomically (temp file + rename) under a
// single-writer lock, so a crash never leaves a half-written store.

use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::{Mutex, OnceCell, RwLock};

use crate::models::{mask_username, Account, Cookie};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("account {0} not found")]
    NotFound(String),
    #[error("account {0} already exists")]
    Duplicate(String),
    #[error("account store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("account store parse error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct AccountRegistry {
    path: PathBuf,
    accounts: RwLock<Vec<Account>>,
    /// Guards the initial load: one loader runs, later callers observe it
    load_guard: OnceCell<()>,
    /// Single writer for the store file
    write_lock: Mutex<()>,
}

impl AccountRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            accounts: RwLock::new(Vec::new()),
            load_guard: OnceCell::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Idempotent load. A missing file is an empty set, not an error.
    pub async fn load(&self) -> Result<usize, RegistryError> {
        self.load_guard
            .get_or_try_init(|| async {
                let accounts = self.read_file().await?;
                let count = accounts.len();
                *self.accounts.write().await = accounts;
                tracing::info!(
                    "[Registry] Loaded {} account(s) from {:?}",
                    count,
                    self.path
                );
                Ok::<(), RegistryError>(())
            })
            .await?;
        Ok(self.accounts.read().await.len())
    }

    async fn read_file(&self) -> Result<Vec<Account>, RegistryError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "[Registry] Account store {:?} not found, starting empty",
                    self.path
                );
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the whole account set atomically: temp file in the same
    /// directory, then rename over the store.
    pub async fn save(&self) -> Result<(), RegistryError> {
        let _writer = self.write_lock.lock().await;
        let snapshot = self.accounts.read().await.clone();
        let json = serde_json::to_string_pretty(&snapshot)?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        tracing::debug!(
            "[Registry] Persisted {} account(s) to {:?}",
            snapshot.len(),
            self.path
        );
        Ok(())
    }

    pub async fn list(&self) -> Vec<Account> {
        self.accounts.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn find_by_username(&self, username: &str) -> Option<Account> {
        self.accounts
            .read()
            .await
            .iter()
            .find(|a| a.username == username)
            .cloned()
    }

    /// Hard-lock an account: `isLocked = true`, `usable = false`, persisted.
    pub async fn mark_locked(&self, username: &str) -> Result<(), RegistryError> {
        self.mutate(username, |account| {
            account.is_locked = true;
            account.usable = false;
        })
        .await?;
        tracing::warn!("[Registry] Account {} marked locked", mask_username(username));
        Ok(())
    }

    /// Soft-remove a suspended account from rotation: `usable = false`.
    pub async fn mark_suspended(&self, username: &str) -> Result<(), RegistryError> {
        self.mutate(username, |account| {
            account.usable = false;
        })
        .await?;
        tracing::warn!(
            "[Registry] Account {} marked unusable (suspended)",
            mask_username(username)
        );
        Ok(())
    }

    pub async fn set_cookies(
        &self,
        username: &str,
        cookies: Vec<Cookie>,
    ) -> Result<(), RegistryError> {
        self.mutate(username, |account| {
            account.cookies = cookies.clone();
        })
        .await
    }

    /// Drop every locked account from the store. Returns how many went.
    pub async fn delete_locked(&self) -> Result<usize, RegistryError> {
        let removed = {
            let mut accounts = self.accounts.write().await;
            let before = accounts.len();
            accounts.retain(|a| !a.is_locked);
            before - accounts.len()
        };
        if removed > 0 {
            self.save().await?;
            tracing::info!("[Registry] Deleted {} locked account(s)", removed);
        }
        Ok(removed)
    }

    // ── Admin CRUD (errors surface to the collaborator layer) ──────────

    pub async fn add_account(&self, account: Account) -> Result<(), RegistryError> {
        {
            let mut accounts = self.accounts.write().await;
            if accounts.iter().any(|a| a.username == account.username) {
                return Err(RegistryError::Duplicate(account.username));
            }
            accounts.push(account);
        }
        self.save().await
    }

    pub async fn update_account(&self, account: Account) -> Result<(), RegistryError> {
        {
            let mut accounts = self.accounts.write().await;
            let slot = accounts
                .iter_mut()
                .find(|a| a.username == account.username)
                .ok_or_else(|| RegistryError::NotFound(account.username.clone()))?;
            *slot = account;
        }
        self.save().await
    }

    pub async fn delete_account(&self, username: &str) -> Result<(), RegistryError> {
        {
            let mut accounts = self.accounts.write().await;
            let before = accounts.len();
            accounts.retain(|a| a.username != username);
            if accounts.len() == before {
                return Err(RegistryError::NotFound(username.to_string()));
            }
        }
        self.save().await
    }

    pub async fn clear_cookies(&self, username: &str) -> Result<(), RegistryError> {
        self.mutate(username, |account| account.cookies.clear()).await
    }

    pub async fn clear_all_cookies(&self) -> Result<(), RegistryError> {
        {
            let mut accounts = self.accounts.write().await;
            for account in accounts.iter_mut() {
                account.cookies.clear();
            }
        }
        self.save().await
    }

    async fn mutate<F>(&self, username: &str, mut apply: F) -> Result<(), RegistryError>
    where
        F: FnMut(&mut Account),
    {
        {
            let mut accounts = self.accounts.write().await;
            let account = accounts
                .iter_mut()
                .find(|a| a.username == username)
                .ok_or_else(|| RegistryError::NotFound(username.to_string()))?;
            apply(account);
        }
        self.save().await
    }
}
