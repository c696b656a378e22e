//! End-to-end enforcement through the request guard with an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use gatekeeper::interceptor::{RequestGuard, HEADER_RETRY_AFTER};
use gatekeeper::ratelimit::{
    CallerContext, ManualClock, MemoryStore, Outcome, PolicySet, RateLimiter,
};

const POLICIES: &str = r#"
policies:
  general:
    requests_per_unit: 100
    unit: minute
    units: 15
  login:
    requests_per_unit: 5
    unit: minute
    units: 15
    counting_mode: count_failures_only
    rejection_message: Too many failed login attempts, please try again later.
  job_postings:
    requests_per_unit: 10
    unit: hour
    key: user_id
    rejection_message: Job posting limit reached.
  applications:
    requests_per_unit: 1
    unit: day
    key: resource_and_user
  messages:
    requests_per_unit: 30
    unit: minute
    on_store_failure: deny
routes:
  /auth/login: [general, login]
  /jobs: [general, job_postings]
  /jobs/apply: [general, applications]
  /messages: [general, messages]
"#;

fn setup() -> (RequestGuard, ManualClock) {
    let clock = ManualClock::at_epoch_secs(1_700_000_000);
    let store = MemoryStore::with_clock(Arc::new(clock.clone()));
    let policies = PolicySet::from_yaml(POLICIES).expect("valid policies");
    let limiter = RateLimiter::new(Arc::new(store), policies)
        .with_clock(Arc::new(clock.clone()))
        .with_key_prefix("rl");
    (RequestGuard::new(limiter), clock)
}

#[tokio::test]
async fn test_credential_stuffing_is_locked_out() {
    let (guard, clock) = setup();
    let attacker = CallerContext::from_addr("203.0.113.50".parse().unwrap());

    for _ in 0..5 {
        assert!(guard.admit("/auth/login", &attacker).await.unwrap().allowed());
        assert!(guard
            .complete("/auth/login", &attacker, Outcome::Failure)
            .await
            .unwrap()
            .allowed());
    }

    let sixth = guard.complete("/auth/login", &attacker, Outcome::Failure).await.unwrap();
    assert!(!sixth.allowed());
    let rejection = sixth.rejection.as_ref().unwrap();
    assert_eq!(rejection.policy, "login");
    assert!(rejection.retry_after <= Duration::from_secs(900));

    // The legitimate user on another address is unaffected.
    let user = CallerContext::from_addr("198.51.100.1".parse().unwrap());
    assert!(guard.complete("/auth/login", &user, Outcome::Failure).await.unwrap().allowed());

    clock.advance(Duration::from_secs(900));
    assert!(guard
        .complete("/auth/login", &attacker, Outcome::Failure)
        .await
        .unwrap()
        .allowed());
}

#[tokio::test]
async fn test_job_postings_per_user() {
    let (guard, _) = setup();
    let poster = CallerContext::from_addr("192.0.2.10".parse().unwrap()).with_user("employer-1");

    for _ in 0..10 {
        assert!(guard.admit("/jobs", &poster).await.unwrap().allowed());
    }
    let denied = guard.admit("/jobs", &poster).await.unwrap();
    assert!(!denied.allowed());
    assert_eq!(denied.rejection.as_ref().unwrap().message, "Job posting limit reached.");
    assert!(denied.headers().iter().any(|(name, _)| *name == HEADER_RETRY_AFTER));

    // An anonymous caller cannot be keyed by user id.
    let anonymous = CallerContext::from_addr("192.0.2.11".parse().unwrap());
    assert!(guard.admit("/jobs", &anonymous).await.is_err());
}

#[tokio::test]
async fn test_one_application_per_job() {
    let (guard, _) = setup();
    let applicant = CallerContext::new().with_user("seeker-7");

    let job_a = applicant.clone().with_resource("job-a");
    let job_b = applicant.clone().with_resource("job-b");

    assert!(guard.admit("/jobs/apply", &job_a).await.unwrap().allowed());
    assert!(!guard.admit("/jobs/apply", &job_a).await.unwrap().allowed());
    assert!(guard.admit("/jobs/apply", &job_b).await.unwrap().allowed());
}
