//! Rate limiting tests.

use ghostknock::rate_limit::{SourceLimiter, TokenBucket};
use std::thread::sleep;
use std::time::Duration;

// =============================================================================
// TOKEN BUCKET TESTS
// =============================================================================

#[test]
fn test_token_bucket_burst_then_empty() {
    let mut bucket = TokenBucket::new(1.0, 3.0);

    assert!(bucket.try_consume());
    assert!(bucket.try_consume());
    assert!(bucket.try_consume());
    assert!(!bucket.try_consume());
}

#[test]
fn test_token_bucket_refill() {
    let mut bucket = TokenBucket::new(10.0, 3.0);

    while bucket.try_consume() {}
    sleep(Duration::from_millis(200));

    // ~2 tokens after 200ms at 10/s
    assert!(bucket.available() > 1.0);
    assert!(bucket.available() < 3.0);
    assert!(bucket.try_consume());
}

#[test]
fn test_token_bucket_refill_capped_at_burst() {
    let mut bucket = TokenBucket::new(1000.0, 2.0);
    sleep(Duration::from_millis(50));
    assert!(bucket.available() <= 2.0);
}

// =============================================================================
// SOURCE LIMITER TESTS
// =============================================================================

#[tokio::test]
async fn test_source_limiter_burst_then_reject() {
    let limiter = SourceLimiter::new(1.0, 3.0);

    for _ in 0..3 {
        assert!(limiter.allow("203.0.113.5").await);
    }
    for _ in 0..7 {
        assert!(!limiter.allow("203.0.113.5").await);
    }
}

#[tokio::test]
async fn test_source_limiter_isolates_sources() {
    let limiter = SourceLimiter::new(1.0, 1.0);

    assert!(limiter.allow("203.0.113.5").await);
    assert!(!limiter.allow("203.0.113.5").await);

    // A different source has its own bucket.
    assert!(limiter.allow("198.51.100.7").await);
    assert_eq!(limiter.len().await, 2);
}

#[tokio::test]
async fn test_source_limiter_eviction() {
    let limiter = SourceLimiter::new(1.0, 3.0);
    limiter.allow("203.0.113.5").await;
    limiter.allow("198.51.100.7").await;
    assert_eq!(limiter.len().await, 2);

    // Nothing is old enough yet.
    assert_eq!(limiter.evict_idle(Duration::from_secs(60)).await, 0);
    assert_eq!(limiter.len().await, 2);

    // With a zero horizon everything is idle.
    assert_eq!(limiter.evict_idle(Duration::ZERO).await, 2);
    assert_eq!(limiter.len().await, 0);
}

#[tokio::test]
async fn test_source_limiter_eviction_resets_bucket() {
    let limiter = SourceLimiter::new(1.0, 1.0);
    assert!(limiter.allow("203.0.113.5").await);
    assert!(!limiter.allow("203.0.113.5").await);

    limiter.evict_idle(Duration::ZERO).await;

    // Fresh entry, fresh burst.
    assert!(limiter.allow("203.0.113.5").await);
}
