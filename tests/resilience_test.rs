use cudagent::hardening::*;
use cudagent::types::*;

#[tokio::test]
async fn test_retry_policy_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: cudagent::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Ok(42) }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_retry_policy_eventual_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: cudagent::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            let a = attempts;
            async move {
                if a < 3 {
                    Err(CoachError::Upstream(503, "busy".to_string()).into())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn test_retry_policy_gives_up_after_max_attempts() {
    let policy = RetryPolicy::new(2, 1);
    let mut attempts = 0;

    let result: cudagent::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Err(CoachError::Upstream(502, "bad gateway".to_string()).into()) }
        })
        .await;

    match result {
        Err(e) => assert!(matches!(e.inner, CoachError::Upstream(502, _))),
        Ok(v) => panic!("Expected Err, got Ok: {}", v),
    }
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn test_non_retryable_error_fails_fast() {
    let policy = RetryPolicy::new(5, 1);
    let mut attempts = 0;

    let result: cudagent::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Err(CoachError::Transport("no body".to_string()).into()) }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_single_attempt_policy_never_retries() {
    let policy = RetryPolicy::none();
    let mut attempts = 0;

    let result: cudagent::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Err(CoachError::Upstream(503, String::new()).into()) }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(attempts, 1);
}
