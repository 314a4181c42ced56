//! Fuzz testing for origin evaluation and client IP derivation.
//!
//! Both run on attacker-controlled headers before any handler sees the
//! request. This target checks that they:
//!
//! - Never panic on any input
//! - Only reflect an origin that was actually allowed
//! - Always produce a non-empty client key for the rate limiter
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the target
//! cargo +nightly fuzz run fuzz_origin_policy
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_origin_policy -- -max_total_time=60
//! ```

#![no_main]

use arbitrary::Arbitrary;
use axum::body::Body;
use axum::http::Request;
use libfuzzer_sys::fuzz_target;
use padaria_backend::middleware::{OriginDecision, OriginPolicy, ProxyTrust, extract_client_ip};

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    origin: &'a str,
    forwarded_for: &'a str,
    hops: u8,
}

fuzz_target!(|input: Input<'_>| {
    let Ok(policy) = OriginPolicy::new(["http://localhost:5173", "http://127.0.0.1:5173"]) else {
        return;
    };

    match policy.evaluate(Some(input.origin)) {
        OriginDecision::Allowed(reflected) => assert_eq!(reflected, input.origin),
        OriginDecision::Denied => {}
        OriginDecision::Absent => panic!("present origin evaluated as absent"),
    }

    let Ok(req) = Request::builder()
        .header("x-forwarded-for", input.forwarded_for)
        .body(Body::empty())
    else {
        return;
    };

    let client_ip = extract_client_ip(&req, ProxyTrust::new(usize::from(input.hops)));
    assert!(!client_ip.is_empty());
});
