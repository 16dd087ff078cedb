// Upstream driver contract
//
// The concrete scraping client is opaque to the orchestrator: a fixed verb
// set behind an async trait, one instance per account, each bound at
// construction to an HTTP client that already carries the account's proxy.
// Errors are message-bearing; the orchestrator classifies the text.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Cookie;

/// Upstream failure surfaced to the orchestrator. Carries the original
/// message verbatim; classification happens at the health layer.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for DriverError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for DriverError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        Self::new(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchMode {
    Top,
    Latest,
    Photos,
    Videos,
    Users,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biography: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default)]
    pub following_count: u64,
    #[serde(default)]
    pub tweets_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tweet {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub retweets: u64,
    #[serde(default)]
    pub replies: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_parsed: Option<DateTime<Utc>>,
    /// Parent tweet, dropped by the catalog to break cycles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to_status: Option<Box<Tweet>>,
    #[serde(default)]
    pub is_reply: bool,
    #[serde(default)]
    pub is_retweet: bool,
    #[serde(default)]
    pub is_quoted: bool,
}

/// One page of a cursored tweet timeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TweetBatch {
    pub tweets: Vec<Tweet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// One page of a cursored profile listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileBatch {
    pub profiles: Vec<Profile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// The opaque upstream client, one instance per account session.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn login(
        &self,
        username: &str,
        password: &str,
        email: &str,
        two_factor_secret: &str,
    ) -> Result<(), DriverError>;

    /// Install stored cookies without validating them.
    async fn set_cookies(&self, cookies: &[String]) -> Result<(), DriverError>;

    async fn get_cookies(&self) -> Result<Vec<Cookie>, DriverError>;

    async fn search_tweets(
        &self,
        query: &str,
        max_tweets: usize,
        mode: SearchMode,
        cursor: Option<String>,
    ) -> Result<TweetBatch, DriverError>;

    async fn get_profile(&self, username: &str) -> Result<Profile, DriverError>;

    async fn get_profile_by_user_id(&self, user_id: &str) -> Result<Profile, DriverError>;

    async fn get_tweets(&self, username: &str, max_tweets: usize)
        -> Result<Vec<Tweet>, DriverError>;

    async fn get_tweets_and_replies(
        &self,
        username: &str,
        max_tweets: usize,
    ) -> Result<Vec<Tweet>, DriverError>;

    async fn get_user_tweets(
        &self,
        user_id: &str,
        max_tweets: usize,
        cursor: Option<String>,
    ) -> Result<TweetBatch, DriverError>;

    async fn get_tweet(&self, id: &str) -> Result<Tweet, DriverError>;

    async fn fetch_profile_followers(
        &self,
        user_id: &str,
        max_profiles: usize,
        cursor: Option<String>,
    ) -> Result<ProfileBatch, DriverError>;

    async fn fetch_profile_following(
        &self,
        user_id: &str,
        max_profiles: usize,
        cursor: Option<String>,
    ) -> Result<ProfileBatch, DriverError>;

    async fn search_profiles(
        &self,
        query: &str,
        max_profiles: usize,
        cursor: Option<String>,
    ) -> Result<ProfileBatch, DriverError>;
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Driver").finish()
    }
}

/// Builds one driver per account. The HTTP client already carries the
/// account's proxy, so the driver never touches shared dispatcher state.
pub trait DriverFactory: Send + Sync {
    fn connect(&self, username: &str, http: reqwest::Client) -> Arc<dyn Driver>;
}
