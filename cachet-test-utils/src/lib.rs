//! Cachet Test Utilities
//!
//! Shared test infrastructure for the cachet workspace:
//! - An in-memory posts API with likes, pagination and injectable failures
//! - Call counters for asserting how often a fetch function ran
//! - Proptest generators for query keys
//! - Fixtures and custom assertions

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Re-export core types for convenience
pub use cachet_core::{
    ClientConfig, FetchError, KeyFilter, KeySegment, MutationError, Primitive, QueryKey,
    QueryOptions,
};

// ============================================================================
// TRACING
// ============================================================================

/// Install a test subscriber once per process. Honours `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// CALL COUNTER
// ============================================================================

/// Shared counter for closures that need to report how often they ran.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicU32>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call and return the new total.
    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

// ============================================================================
// POSTS API
// ============================================================================

/// Errors returned by the fake API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("{endpoint} is unavailable (injected failure)")]
    Unavailable { endpoint: &'static str },

    #[error("Post {post_id} not found")]
    NotFound { post_id: u64 },

    #[error("Request rejected: {reason}")]
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: u64,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPost {
    pub username: String,
    pub content: String,
}

/// One page of posts, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostsPage {
    pub results: Vec<Post>,
    pub page: u32,
    pub count: usize,
    pub has_more: bool,
}

/// Endpoints of the fake API, for failure injection and call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    GetPosts,
    GetPostsByUsername,
    UploadPost,
    GetLikeCount,
    GetLikeStatus,
    LikePost,
    UnlikePost,
}

impl Endpoint {
    pub fn name(self) -> &'static str {
        match self {
            Self::GetPosts => "getPosts",
            Self::GetPostsByUsername => "getPostsByUsername",
            Self::UploadPost => "uploadPost",
            Self::GetLikeCount => "getLikeCountByPostId",
            Self::GetLikeStatus => "getLikeStatusByUsername",
            Self::LikePost => "likePost",
            Self::UnlikePost => "unlikePost",
        }
    }
}

/// The posts backend the engine is exercised against.
#[async_trait]
pub trait PostsApi: Send + Sync {
    async fn get_posts(&self, page: u32, limit: u32) -> Result<PostsPage, ApiError>;

    async fn get_posts_by_username(&self, username: &str) -> Result<PostsPage, ApiError>;

    async fn upload_post(&self, new_post: NewPost) -> Result<Post, ApiError>;

    async fn get_like_count(&self, post_id: u64) -> Result<u64, ApiError>;

    async fn get_like_status(&self, post_id: u64, username: &str) -> Result<bool, ApiError>;

    async fn like_post(&self, post_id: u64, username: &str) -> Result<(), ApiError>;

    async fn unlike_post(&self, post_id: u64, username: &str) -> Result<(), ApiError>;
}

#[derive(Debug, Default)]
struct ApiState {
    /// Oldest first.
    posts: Vec<Post>,
    likes: HashMap<u64, BTreeSet<String>>,
    failures: HashMap<Endpoint, u32>,
}

/// In-memory [`PostsApi`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakePostsApi {
    state: Arc<Mutex<ApiState>>,
    calls: Arc<Mutex<HashMap<Endpoint, CallCounter>>>,
    latency: Duration,
}

impl FakePostsApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request sleeps this long (on the tokio clock) before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seed `count` posts with ids `1..=count`.
    pub fn with_posts(self, count: u64) -> Self {
        {
            let mut state = self.state();
            for id in 1..=count {
                let username = ["codeit", "alice", "bob"][(id % 3) as usize];
                state.posts.push(Post {
                    id,
                    username: username.to_string(),
                    content: format!("post #{id}"),
                    created_at: timestamp(id),
                });
            }
        }
        self
    }

    /// Seed likes for a post.
    pub fn with_likes<I, S>(self, post_id: u64, usernames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state()
            .likes
            .entry(post_id)
            .or_default()
            .extend(usernames.into_iter().map(Into::into));
        self
    }

    /// Make the next `times` calls to `endpoint` fail.
    pub fn fail_next(&self, endpoint: Endpoint, times: u32) {
        self.state().failures.insert(endpoint, times);
    }

    pub fn calls(&self, endpoint: Endpoint) -> u32 {
        self.counter(endpoint).get()
    }

    pub fn total_calls(&self) -> u32 {
        lock(&self.calls).values().map(CallCounter::get).sum()
    }

    /// Server-side like count, bypassing counters and failures.
    pub fn like_count(&self, post_id: u64) -> u64 {
        self.state().likes.get(&post_id).map_or(0, |l| l.len() as u64)
    }

    fn state(&self) -> MutexGuard<'_, ApiState> {
        lock(&self.state)
    }

    fn counter(&self, endpoint: Endpoint) -> CallCounter {
        lock(&self.calls).entry(endpoint).or_default().clone()
    }

    /// Count the call, wait out the latency, then apply injected failures.
    async fn begin(&self, endpoint: Endpoint) -> Result<(), ApiError> {
        self.counter(endpoint).increment();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state();
        match state.failures.get_mut(&endpoint) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(ApiError::Unavailable {
                    endpoint: endpoint.name(),
                })
            }
            _ => Ok(()),
        }
    }

    fn ensure_post(state: &ApiState, post_id: u64) -> Result<(), ApiError> {
        if state.posts.iter().any(|p| p.id == post_id) {
            Ok(())
        } else {
            Err(ApiError::NotFound { post_id })
        }
    }
}

#[async_trait]
impl PostsApi for FakePostsApi {
    async fn get_posts(&self, page: u32, limit: u32) -> Result<PostsPage, ApiError> {
        self.begin(Endpoint::GetPosts).await?;
        let state = self.state();
        let count = state.posts.len();
        let start = (page as usize).saturating_mul(limit as usize);
        let results: Vec<Post> = state
            .posts
            .iter()
            .rev()
            .skip(start)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(PostsPage {
            has_more: start + results.len() < count,
            results,
            page,
            count,
        })
    }

    async fn get_posts_by_username(&self, username: &str) -> Result<PostsPage, ApiError> {
        self.begin(Endpoint::GetPostsByUsername).await?;
        let state = self.state();
        let results: Vec<Post> = state
            .posts
            .iter()
            .rev()
            .filter(|p| p.username == username)
            .cloned()
            .collect();
        Ok(PostsPage {
            count: results.len(),
            results,
            page: 0,
            has_more: false,
        })
    }

    async fn upload_post(&self, new_post: NewPost) -> Result<Post, ApiError> {
        self.begin(Endpoint::UploadPost).await?;
        if new_post.content.trim().is_empty() {
            return Err(ApiError::Rejected {
                reason: "content is empty".to_string(),
            });
        }
        let mut state = self.state();
        let id = state.posts.last().map_or(1, |p| p.id + 1);
        let post = Post {
            id,
            username: new_post.username,
            content: new_post.content,
            created_at: timestamp(id),
        };
        state.posts.push(post.clone());
        Ok(post)
    }

    async fn get_like_count(&self, post_id: u64) -> Result<u64, ApiError> {
        self.begin(Endpoint::GetLikeCount).await?;
        let state = self.state();
        Self::ensure_post(&state, post_id)?;
        Ok(state.likes.get(&post_id).map_or(0, |l| l.len() as u64))
    }

    async fn get_like_status(&self, post_id: u64, username: &str) -> Result<bool, ApiError> {
        self.begin(Endpoint::GetLikeStatus).await?;
        let state = self.state();
        Self::ensure_post(&state, post_id)?;
        Ok(state
            .likes
            .get(&post_id)
            .is_some_and(|l| l.contains(username)))
    }

    async fn like_post(&self, post_id: u64, username: &str) -> Result<(), ApiError> {
        self.begin(Endpoint::LikePost).await?;
        let mut state = self.state();
        Self::ensure_post(&state, post_id)?;
        state
            .likes
            .entry(post_id)
            .or_default()
            .insert(username.to_string());
        Ok(())
    }

    async fn unlike_post(&self, post_id: u64, username: &str) -> Result<(), ApiError> {
        self.begin(Endpoint::UnlikePost).await?;
        let mut state = self.state();
        Self::ensure_post(&state, post_id)?;
        if let Some(likes) = state.likes.get_mut(&post_id) {
            likes.remove(username);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn timestamp(id: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + id as i64 * 60, 0)
        .single()
        .unwrap_or_default()
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for query keys.

    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    pub fn arb_primitive() -> impl Strategy<Value = Primitive> {
        prop_oneof![
            Just(Primitive::Null),
            any::<bool>().prop_map(Primitive::Bool),
            any::<i64>().prop_map(Primitive::from),
            "[a-z]{0,8}".prop_map(Primitive::from),
        ]
    }

    /// Flat object fields, as used for filter segments like `{"page": 1}`.
    pub fn arb_object_fields() -> impl Strategy<Value = BTreeMap<String, Primitive>> {
        prop::collection::btree_map("[a-z]{1,6}", arb_primitive(), 0..4)
    }

    pub fn arb_segment() -> impl Strategy<Value = KeySegment> {
        prop_oneof![
            3 => arb_primitive().prop_map(KeySegment::Primitive),
            1 => arb_object_fields().prop_map(KeySegment::from),
        ]
    }

    pub fn arb_query_key() -> impl Strategy<Value = QueryKey> {
        prop::collection::vec(arb_segment(), 0..5).prop_map(QueryKey::new)
    }

    /// A key together with one of its prefixes.
    pub fn arb_key_with_prefix() -> impl Strategy<Value = (QueryKey, QueryKey)> {
        arb_query_key().prop_flat_map(|key| {
            let len = key.len();
            (Just(key), 0..=len).prop_map(|(key, cut)| {
                let prefix = QueryKey::new(key.segments()[..cut].to_vec());
                (key, prefix)
            })
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built configurations and keys for common scenarios.

    use super::*;

    /// Client configuration without retries.
    pub fn test_config() -> ClientConfig {
        ClientConfig::for_tests()
    }

    /// Options that fail fast and stay fresh for `freshness`.
    pub fn fresh_for(freshness: Duration) -> QueryOptions {
        QueryOptions::default()
            .with_retry_count(0)
            .with_freshness_window(freshness)
    }

    pub fn posts_key() -> QueryKey {
        cachet_core::query_key!["posts"]
    }

    pub fn like_count_key(post_id: u64) -> QueryKey {
        cachet_core::query_key!["likeCount", post_id]
    }

    pub fn like_status_key(post_id: u64, username: &str) -> QueryKey {
        cachet_core::query_key!["likeStatus", post_id, username]
    }

    /// Post 1, liked by five users other than "codeit".
    pub fn api_with_liked_post() -> FakePostsApi {
        FakePostsApi::new()
            .with_posts(1)
            .with_likes(1, ["a", "b", "c", "d", "e"])
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cachet error variants.

    use super::*;

    #[track_caller]
    pub fn assert_fetch_failed<T: std::fmt::Debug>(result: &Result<T, FetchError>) {
        match result {
            Err(FetchError::Failed { .. }) => {}
            other => panic!("Expected FetchError::Failed, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cancelled<T: std::fmt::Debug>(result: &Result<T, FetchError>) {
        match result {
            Err(FetchError::Cancelled { .. }) => {}
            other => panic!("Expected FetchError::Cancelled, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_mutation_failed<T: std::fmt::Debug>(result: &Result<T, MutationError>) {
        match result {
            Err(MutationError::Failed { .. }) => {}
            other => panic!("Expected MutationError::Failed, got: {:?}", other),
        }
    }
}
