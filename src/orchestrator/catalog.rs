// Operation catalog - the fixed set of high-level operations exposed to
// the collaborator layer.
//
// Every operation maps to a single dispatcher execute (or execute_batch
// for the multi variants) with a fixed timeout class. Light response
// normalization lives here, never in the dispatcher: fill `username` from
// the permanent URL, fill `text` from stripped html, and drop reply
// parents to break cycles.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use chrono::{DateTime, NaiveDate, Utc};
use futures::Stream;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::driver::{Profile, ProfileBatch, SearchMode, Tweet, TweetBatch};
use crate::orchestrator::dispatcher::{Dispatcher, OpContext, OpSpec, TimeoutClass};

/// Pause between pages of the large-timeline operation.
const INTER_BATCH_SLEEP: Duration = Duration::from_millis(500);
/// Page size for internally paginated timeline operations.
const TIMELINE_PAGE_SIZE: usize = 40;
/// Overall deadline for the lazy profile-search stream.
const SEARCH_PROFILES_DEADLINE: Duration = Duration::from_secs(60);

static MARKUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

pub struct Catalog {
    dispatcher: Arc<Dispatcher>,
}

impl Catalog {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    // ── Search ─────────────────────────────────────────────────────────

    pub async fn search_tweets(
        &self,
        query: &str,
        max_tweets: usize,
        mode: SearchMode,
    ) -> Option<Vec<Tweet>> {
        let spec = OpSpec::new("searchTweets", TimeoutClass::Search);
        let query = query.to_string();
        self.dispatcher
            .execute(spec, move |ctx: OpContext| {
                let query = query.clone();
                async move {
                    let batch = ctx
                        .driver
                        .search_tweets(&query, max_tweets, mode, None)
                        .await?;
                    Ok(batch.tweets)
                }
            })
            .await
            .map(normalize_tweets)
    }

    /// Lazy, finite, non-restartable stream of profiles. Terminates at
    /// `max_profiles`, cursor exhaustion, a 60 s internal deadline, or
    /// account failure.
    pub fn search_profiles(
        &self,
        query: &str,
        max_profiles: usize,
    ) -> impl Stream<Item = Profile> + '_ {
        let query = query.to_string();
        stream! {
            let started = Instant::now();
            let mut yielded = 0usize;
            let mut cursor: Option<String> = None;

            while yielded < max_profiles && started.elapsed() < SEARCH_PROFILES_DEADLINE {
                let spec = OpSpec::new("searchProfiles", TimeoutClass::Search);
                let q = query.clone();
                let cur = cursor.clone();
                let remaining = max_profiles - yielded;
                let page: Option<ProfileBatch> = self
                    .dispatcher
                    .execute(spec, move |ctx: OpContext| {
                        let q = q.clone();
                        let cur = cur.clone();
                        async move { ctx.driver.search_profiles(&q, remaining, cur).await }
                    })
                    .await;

                let Some(batch) = page else { break };
                if batch.profiles.is_empty() {
                    break;
                }
                for profile in batch.profiles {
                    if yielded >= max_profiles {
                        break;
                    }
                    yielded += 1;
                    yield profile;
                }
                match batch.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }
    }

    // ── Profiles ───────────────────────────────────────────────────────

    pub async fn get_profile(&self, username: &str) -> Option<Profile> {
        let spec = OpSpec::new("getProfile", TimeoutClass::Profile);
        let username = username.to_string();
        self.dispatcher
            .execute(spec, move |ctx: OpContext| {
                let username = username.clone();
                async move { ctx.driver.get_profile(&username).await }
            })
            .await
    }

    pub async fn get_profile_by_user_id(&self, user_id: &str) -> Option<Profile> {
        let spec = OpSpec::new("getProfileByUserId", TimeoutClass::Profile);
        let user_id = user_id.to_string();
        self.dispatcher
            .execute(spec, move |ctx: OpContext| {
                let user_id = user_id.clone();
                async move { ctx.driver.get_profile_by_user_id(&user_id).await }
            })
            .await
    }

    /// Multi variant: one slot per username through `execute_batch`.
    pub async fn get_profiles(&self, usernames: &[String]) -> Vec<Option<Profile>> {
        let spec = OpSpec::new("getProfile", TimeoutClass::Profile);
        let ops: Vec<_> = usernames
            .iter()
            .cloned()
            .map(|username| {
                move |ctx: OpContext| {
                    let username = username.clone();
                    async move { ctx.driver.get_profile(&username).await }
                }
            })
            .collect();
        self.dispatcher.execute_batch(spec, ops).await
    }

    pub async fn get_profile_followers(
        &self,
        user_id: &str,
        max_profiles: usize,
        cursor: Option<String>,
    ) -> Option<ProfileBatch> {
        let spec = OpSpec::new("getProfileFollowers", TimeoutClass::Profile);
        let user_id = user_id.to_string();
        self.dispatcher
            .execute(spec, move |ctx: OpContext| {
                let user_id = user_id.clone();
                let cursor = cursor.clone();
                async move {
                    ctx.driver
                        .fetch_profile_followers(&user_id, max_profiles, cursor)
                        .await
                }
            })
            .await
    }

    pub async fn get_profile_following(
        &self,
        user_id: &str,
        max_profiles: usize,
        cursor: Option<String>,
    ) -> Option<ProfileBatch> {
        let spec = OpSpec::new("getProfileFollowing", TimeoutClass::Profile);
        let user_id = user_id.to_string();
        self.dispatcher
            .execute(spec, move |ctx: OpContext| {
                let user_id = user_id.clone();
                let cursor = cursor.clone();
                async move {
                    ctx.driver
                        .fetch_profile_following(&user_id, max_profiles, cursor)
                        .await
                }
            })
            .await
    }

    // ── Tweets ─────────────────────────────────────────────────────────

    pub async fn get_tweets(&self, username: &str, max_tweets: usize) -> Option<Vec<Tweet>> {
        let spec = OpSpec::new("getTweets", TimeoutClass::Tweet);
        let username = username.to_string();
        self.dispatcher
            .execute(spec, move |ctx: OpContext| {
                let username = username.clone();
                async move { ctx.driver.get_tweets(&username, max_tweets).await }
            })
            .await
            .map(normalize_tweets)
    }

    pub async fn get_tweets_by_user_id(
        &self,
        user_id: &str,
        max_tweets: usize,
    ) -> Option<Vec<Tweet>> {
        let spec = OpSpec::new("getTweetsByUserId", TimeoutClass::Tweet);
        let user_id = user_id.to_string();
        self.dispatcher
            .execute(spec, move |ctx: OpContext| {
                let user_id = user_id.clone();
                async move {
                    let batch = ctx.driver.get_user_tweets(&user_id, max_tweets, None).await?;
                    Ok(batch.tweets)
                }
            })
            .await
            .map(normalize_tweets)
    }

    /// Screen names resolve the same way usernames do upstream.
    pub async fn get_tweets_by_screen_name(
        &self,
        screen_name: &str,
        max_tweets: usize,
    ) -> Option<Vec<Tweet>> {
        self.get_tweets(screen_name, max_tweets).await
    }

    pub async fn get_tweets_and_replies(
        &self,
        username: &str,
        max_tweets: usize,
    ) -> Option<Vec<Tweet>> {
        let spec = OpSpec::new("getTweetsAndReplies", TimeoutClass::Tweet);
        let username = username.to_string();
        self.dispatcher
            .execute(spec, move |ctx: OpContext| {
                let username = username.clone();
                async move { ctx.driver.get_tweets_and_replies(&username, max_tweets).await }
            })
            .await
            .map(normalize_tweets)
    }

    pub async fn get_latest_tweet(&self, username: &str) -> Option<Tweet> {
        self.get_tweets(username, 1)
            .await
            .and_then(|tweets| tweets.into_iter().next())
    }

    pub async fn get_tweet(&self, id: &str) -> Option<Tweet> {
        let spec = OpSpec::new("getTweet", TimeoutClass::Tweet);
        let id = id.to_string();
        self.dispatcher
            .execute(spec, move |ctx: OpContext| {
                let id = id.clone();
                async move { ctx.driver.get_tweet(&id).await }
            })
            .await
            .map(normalize_tweet)
    }

    /// Replies are a conversation search; the driver has no reply verb.
    pub async fn get_tweet_replies(&self, id: &str, max_tweets: usize) -> Option<Vec<Tweet>> {
        let focal = id.to_string();
        self.search_tweets(
            &format!("conversation_id:{}", id),
            max_tweets,
            SearchMode::Latest,
        )
        .await
        .map(|tweets| tweets.into_iter().filter(|t| t.id != focal).collect())
    }

    pub async fn get_tweet_quotes(&self, id: &str, max_tweets: usize) -> Option<Vec<Tweet>> {
        self.search_tweets(
            &format!("quoted_tweet_id:{}", id),
            max_tweets,
            SearchMode::Latest,
        )
        .await
    }

    /// Single cursored timeline page.
    pub async fn get_user_tweets(
        &self,
        user_id: &str,
        max_tweets: usize,
        cursor: Option<String>,
    ) -> Option<TweetBatch> {
        let spec = OpSpec::new("getUserTweets", TimeoutClass::Tweet);
        let user_id = user_id.to_string();
        self.dispatcher
            .execute(spec, move |ctx: OpContext| {
                let user_id = user_id.clone();
                let cursor = cursor.clone();
                async move { ctx.driver.get_user_tweets(&user_id, max_tweets, cursor).await }
            })
            .await
            .map(|mut batch| {
                batch.tweets = normalize_tweets(batch.tweets);
                batch
            })
    }

    /// Paginate internally until `max_tweets` or cursor exhaustion, with a
    /// 500 ms pause between pages and a doubled per-page timeout.
    pub async fn get_user_tweets_large(
        &self,
        user_id: &str,
        max_tweets: usize,
    ) -> Option<Vec<Tweet>> {
        let spec = OpSpec::new("getUserTweetsLarge", TimeoutClass::Tweet).doubled();
        let mut collected: Vec<Tweet> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page_size = (max_tweets - collected.len()).min(TIMELINE_PAGE_SIZE);
            let user_id_owned = user_id.to_string();
            let cursor_owned = cursor.clone();
            let page: Option<TweetBatch> = self
                .dispatcher
                .execute(spec, move |ctx: OpContext| {
                    let user_id = user_id_owned.clone();
                    let cursor = cursor_owned.clone();
                    async move { ctx.driver.get_user_tweets(&user_id, page_size, cursor).await }
                })
                .await;

            let Some(batch) = page else {
                // Upstream gave up mid-way; surface what was gathered
                return (!collected.is_empty()).then(|| normalize_tweets(collected));
            };
            collected.extend(batch.tweets);
            cursor = batch.next_cursor;

            if collected.len() >= max_tweets || cursor.is_none() {
                break;
            }
            tokio::time::sleep(INTER_BATCH_SLEEP).await;
        }

        collected.truncate(max_tweets);
        Some(normalize_tweets(collected))
    }

    /// Iterate the timeline keeping tweets within `[end, start]` inclusive
    /// (`start` newer than `end`); stops as soon as a page reaches past
    /// `end`.
    pub async fn get_user_timeline_in_date_range(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<Vec<Tweet>> {
        let spec = OpSpec::new("getUserTimelineInDateRange", TimeoutClass::Tweet);
        let mut collected: Vec<Tweet> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let user_id_owned = user_id.to_string();
            let cursor_owned = cursor.clone();
            let page: Option<TweetBatch> = self
                .dispatcher
                .execute(spec, move |ctx: OpContext| {
                    let user_id = user_id_owned.clone();
                    let cursor = cursor_owned.clone();
                    async move {
                        ctx.driver
                            .get_user_tweets(&user_id, TIMELINE_PAGE_SIZE, cursor)
                            .await
                    }
                })
                .await;

            let Some(batch) = page else {
                return (!collected.is_empty()).then(|| normalize_tweets(collected));
            };

            let mut past_range = false;
            for tweet in batch.tweets {
                match tweet.time_parsed {
                    Some(at) if at < end => {
                        // Timeline is newest-first; everything below is older
                        past_range = true;
                        break;
                    }
                    Some(at) if at <= start => collected.push(tweet),
                    // Newer than the range, or undated: skip
                    _ => {}
                }
            }

            cursor = batch.next_cursor;
            if past_range || cursor.is_none() {
                break;
            }
        }

        Some(normalize_tweets(collected))
    }

    /// Date-scoped timeline via the search surface:
    /// `from:<user> since:<date> until:<date>`.
    pub async fn get_user_timeline_by_search(
        &self,
        username: &str,
        since: NaiveDate,
        until: NaiveDate,
        max_tweets: usize,
    ) -> Option<Vec<Tweet>> {
        let query = format!(
            "from:{} since:{} until:{}",
            username,
            since.format("%Y-%m-%d"),
            until.format("%Y-%m-%d")
        );
        self.search_tweets(&query, max_tweets, SearchMode::Latest).await
    }
}

// ── Normalization ──────────────────────────────────────────────────────

fn normalize_tweets(tweets: Vec<Tweet>) -> Vec<Tweet> {
    tweets.into_iter().map(normalize_tweet).collect()
}

fn normalize_tweet(mut tweet: Tweet) -> Tweet {
    if tweet.username.is_none() {
        if let Some(url) = tweet.permanent_url.as_deref() {
            tweet.username = username_from_permanent_url(url);
        }
    }
    if tweet.text.is_none() {
        if let Some(html) = tweet.html.as_deref() {
            tweet.text = Some(strip_markup(html));
        }
    }
    // Break reply cycles before the payload leaves the catalog
    tweet.in_reply_to_status = None;
    tweet
}

/// `https://x.com/<user>/status/<id>` → `<user>`.
fn username_from_permanent_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let mut segments = url.path_segments()?;
    let user = segments.next()?;
    (!user.is_empty()).then(|| user.to_string())
}

fn strip_markup(html: &str) -> String {
    MARKUP_RE
        .replace_all(html, "")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .trim()
        .to_string()
}
