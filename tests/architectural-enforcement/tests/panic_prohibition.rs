//! Integration Test: Panic Prohibition
//!
//! **Policy**: Gateway production code propagates errors. `unwrap()` and
//! `expect()` are allowed only in tests and in the crate's test utilities.

use architectural_enforcement::{find_violations, GATEWAY_SRC};

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = find_violations(GATEWAY_SRC, |_, _, code| {
        code.contains(".unwrap()") || code.contains(".expect(")
    });

    if !violations.is_empty() {
        eprintln!("\nunwrap()/expect() found in gateway production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nReturn a BackendError / GatewayError / ConfigError instead,");
        eprintln!("or use unwrap_or / unwrap_or_else / unwrap_or_default.");

        panic!(
            "\nFound {} panic violation(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_no_panic_macros_in_production_code() {
    let violations = find_violations(GATEWAY_SRC, |_, _, code| {
        code.contains("panic!(") || code.contains("todo!(") || code.contains("unimplemented!(")
    });

    assert!(
        violations.is_empty(),
        "panic-style macros in production code:\n{}",
        violations.join("\n")
    );
}
