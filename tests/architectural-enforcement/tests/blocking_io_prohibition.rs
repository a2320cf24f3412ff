//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async gateway code MUST NOT use blocking I/O.
//! **Acceptable**: blocking calls in synchronous functions, such as config
//! loading before the runtime serves requests.

use architectural_enforcement::{find_violations, in_async_fn, GATEWAY_SRC};

const BLOCKING_PATTERNS: &[&str] = &[
    "std::fs::",
    "std::net::",
    "std::thread::sleep",
    "std::process::Command",
    "reqwest::blocking",
];

#[test]
fn test_no_blocking_io_in_async_code() {
    let violations = find_violations(GATEWAY_SRC, |file, idx, code| {
        BLOCKING_PATTERNS.iter().any(|p| code.contains(p)) && in_async_fn(&file.lines, idx)
    });

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O found in async gateway code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse tokio::fs / tokio::net, or move the call out of the async path.");

        panic!(
            "\nFound {} blocking I/O violation(s) in async code.",
            violations.len()
        );
    }
}
