//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Gateway production code waits on I/O, semaphores and
//! deadlines. It never sleeps. Rate-limit denials are returned to the caller
//! with a `retry_after` instead of being slept off, and timeouts use
//! `tokio::time::timeout`.

use architectural_enforcement::{find_violations, GATEWAY_SRC};

#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_violations(GATEWAY_SRC, |_, _, code| {
        code.contains("::sleep(") || code.contains(".sleep(") || code.contains("sleep_until(")
    });

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in gateway production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse instead:");
        eprintln!("  - tokio::time::timeout for deadlines");
        eprintln!("  - BackendError::RateLimitExceeded {{ retry_after }} for throttling");
        eprintln!("  - tokio::time::advance in tests");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}
