//! Liking posts and uploading new ones with optimistic edits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cachet_engine::{query_key, MutateCallbacks, Mutation, MutationError, MutationStatus, QueryClient};
use cachet_test_utils::assertions::assert_mutation_failed;
use cachet_test_utils::fixtures::{api_with_liked_post, like_count_key, like_status_key, posts_key};
use cachet_test_utils::{ApiError, Endpoint, FakePostsApi, NewPost, Post, PostsApi};
use serde_json::json;

use test_support::{
    like_count_fetcher, like_status_fetcher, posts_page_fetcher, settled, test_client, yield_many,
};

/// Like post `id` as "codeit", bumping the count and flipping the status up front.
fn like_mutation(client: &QueryClient, api: &FakePostsApi) -> Mutation<u64, ()> {
    let api = api.clone();
    client
        .mutation(move |post_id: u64| {
            let api = api.clone();
            async move { api.like_post(post_id, "codeit").await }
        })
        .optimistic(
            |post_id: &u64| like_count_key(*post_id),
            |_, count: Option<u64>| count.unwrap_or(0) + 1,
        )
        .optimistic(
            |post_id: &u64| like_status_key(*post_id, "codeit"),
            |_, _: Option<bool>| true,
        )
        .build()
}

fn upload_mutation(client: &QueryClient, api: &FakePostsApi) -> Mutation<NewPost, Post> {
    let api = api.clone();
    client
        .mutation(move |new_post: NewPost| {
            let api = api.clone();
            async move { api.upload_post(new_post).await }
        })
        .invalidates(|_| posts_key())
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_like_is_shown_before_server_confirms() {
    let client = test_client();
    let api = api_with_liked_post().with_latency(Duration::from_millis(100));
    let options = client.default_options();

    let mut count = client.observe(like_count_key(1), like_count_fetcher(&api, 1), options.clone());
    let mut status = client.observe(
        like_status_key(1, "codeit"),
        like_status_fetcher(&api, 1, "codeit"),
        options,
    );
    assert_eq!(settled(&mut count).await.data, Some(json!(5)));
    assert_eq!(settled(&mut status).await.data, Some(json!(false)));

    let like = like_mutation(&client, &api);
    let pending = like.mutate(1);
    assert_eq!(count.snapshot().data, Some(json!(6)));
    assert_eq!(status.snapshot().data, Some(json!(true)));
    assert!(like.is_pending());

    pending.await.unwrap();
    assert_eq!(like.status(), MutationStatus::Settled);
    assert!(like.is_success());

    assert_eq!(settled(&mut count).await.data, Some(json!(6)));
    assert_eq!(settled(&mut status).await.data, Some(json!(true)));
    assert_eq!(api.calls(Endpoint::GetLikeCount), 2);
    assert_eq!(api.calls(Endpoint::GetLikeStatus), 2);
    assert_eq!(api.like_count(1), 6);
}

#[tokio::test(start_paused = true)]
async fn test_failed_like_rolls_back_exactly() {
    let client = test_client();
    let api = api_with_liked_post();
    api.fail_next(Endpoint::LikePost, 1);
    let options = client.default_options();

    let mut count = client.observe(like_count_key(1), like_count_fetcher(&api, 1), options.clone());
    let mut status = client.observe(
        like_status_key(1, "codeit"),
        like_status_fetcher(&api, 1, "codeit"),
        options,
    );
    settled(&mut count).await;
    settled(&mut status).await;

    let like = like_mutation(&client, &api);
    let result = like.mutate(1).await;
    assert_mutation_failed(&result);
    assert!(like.is_error());

    let after = client.read(&like_count_key(1)).unwrap();
    assert_eq!(after.data, Some(json!(5)));
    assert!(after.is_stale);
    assert_eq!(client.read(&like_status_key(1, "codeit")).unwrap().data, Some(json!(false)));

    assert_eq!(settled(&mut count).await.data, Some(json!(5)));
    assert_eq!(api.calls(Endpoint::GetLikeCount), 2);
    assert_eq!(api.like_count(1), 5);
}

#[tokio::test(start_paused = true)]
async fn test_invalidating_twice_refetches_once() {
    let client = test_client();
    let api = api_with_liked_post().with_latency(Duration::from_millis(50));
    let key = like_count_key(1);

    let mut count = client.observe(key.clone(), like_count_fetcher(&api, 1), client.default_options());
    settled(&mut count).await;

    assert_eq!(client.invalidate_queries(key.clone()), 1);
    assert_eq!(client.invalidate_queries(key.clone()), 1);
    assert_eq!(client.coordinator().in_flight_count(), 1);

    settled(&mut count).await;
    assert_eq!(api.calls(Endpoint::GetLikeCount), 2);
}

#[tokio::test(start_paused = true)]
async fn test_mutation_cancels_refetch_that_would_clobber_edit() {
    let client = test_client();
    let api = api_with_liked_post().with_latency(Duration::from_secs(1));
    let key = like_count_key(1);

    let mut count = client.observe(key.clone(), like_count_fetcher(&api, 1), client.default_options());
    settled(&mut count).await;

    client.invalidate_queries(key.clone());
    yield_many().await;
    assert!(client.coordinator().is_in_flight(&key));

    let like = like_mutation(&client, &api);
    let pending = like.mutate(1);
    assert!(!client.coordinator().is_in_flight(&key));
    let snapshot = count.snapshot();
    assert_eq!(snapshot.data, Some(json!(6)));
    assert!(!snapshot.is_fetching());

    pending.await.unwrap();
    assert_eq!(count.snapshot().data, Some(json!(6)));
    assert_eq!(settled(&mut count).await.data, Some(json!(6)));
    assert_eq!(api.calls(Endpoint::GetLikeCount), 3);
}

#[tokio::test(start_paused = true)]
async fn test_upload_refreshes_observed_feed() {
    let client = test_client();
    let api = FakePostsApi::new().with_posts(3);
    let page_key = query_key!["posts", 0];

    let mut feed = client.observe(page_key.clone(), posts_page_fetcher(&api, 0), client.default_options());
    let before = settled(&mut feed).await;
    assert_eq!(before.data.unwrap()["count"], json!(3));

    let uploaded = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&uploaded);
    let upload = upload_mutation(&client, &api);
    let post = upload
        .mutate_with(
            NewPost {
                username: "codeit".to_string(),
                content: "hello".to_string(),
            },
            MutateCallbacks::new().on_success(move |post: &Post, _| {
                *seen.lock().unwrap() = Some(post.id);
            }),
        )
        .await
        .unwrap();
    assert_eq!(post.id, 4);
    assert_eq!(*uploaded.lock().unwrap(), Some(4));

    let after = settled(&mut feed).await.data.unwrap();
    assert_eq!(after["count"], json!(4));
    assert_eq!(after["results"][0]["id"], json!(4));
    assert_eq!(api.calls(Endpoint::GetPosts), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_upload_reports_error_and_still_settles() {
    let client = test_client();
    let api = FakePostsApi::new().with_posts(3);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);

    let upload = upload_mutation(&client, &api);
    let result = upload
        .mutate_with(
            NewPost {
                username: "codeit".to_string(),
                content: "   ".to_string(),
            },
            MutateCallbacks::new().on_error(move |error: &MutationError, _| {
                sink.lock().unwrap().push(error.to_string());
            }),
        )
        .await;

    assert_mutation_failed(&result);
    let expected = ApiError::Rejected {
        reason: "content is empty".to_string(),
    }
    .to_string();
    assert!(errors.lock().unwrap()[0].contains(&expected));
    assert_eq!(upload.status(), MutationStatus::Settled);
    assert!(upload.is_error());

    upload.reset();
    assert!(upload.is_idle());
    assert!(upload.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_mutation_with_bad_edit_rolls_back() {
    let client = test_client();
    let api = api_with_liked_post();
    client.set_query_data(&like_count_key(1), 5u64).unwrap();
    client
        .set_query_data(&like_status_key(1, "codeit"), "not-a-bool")
        .unwrap();

    let like = like_mutation(&client, &api);
    drop(like.mutate(1));

    assert_eq!(client.get_query_data::<u64>(&like_count_key(1)).unwrap(), Some(5));
    assert_eq!(like.status(), MutationStatus::Failed);
    assert!(matches!(like.last_error(), Some(MutationError::Decode { .. })));
    assert_eq!(api.calls(Endpoint::LikePost), 0);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_mutations_keep_separate_snapshots() {
    let client = test_client();
    let key = like_count_key(1);
    client.set_query_data(&key, 5u64).unwrap();

    let slow_failure = client
        .mutation(|_post_id: u64| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Err::<(), _>("503 Service Unavailable")
        })
        .optimistic(
            |post_id: &u64| like_count_key(*post_id),
            |_, count: Option<u64>| count.unwrap_or(0) + 1,
        )
        .build();
    let fast_success = client
        .mutation(|_post_id: u64| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, String>(())
        })
        .optimistic(
            |post_id: &u64| like_count_key(*post_id),
            |_, count: Option<u64>| count.unwrap_or(0) + 1,
        )
        .build();

    let a = slow_failure.mutate(1);
    let b = fast_success.mutate(1);
    assert_eq!(client.get_query_data::<u64>(&key).unwrap(), Some(7));

    let (a, b) = tokio::join!(a, b);
    assert!(a.is_err());
    assert!(b.is_ok());

    // The failed mutation restores what it saw, discarding the later edit.
    let after = client.read(&key).unwrap();
    assert_eq!(after.data, Some(json!(5)));
    assert!(after.is_stale);
}
