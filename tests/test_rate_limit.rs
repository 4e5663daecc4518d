// Rate limiter boundaries: exactly the configured number of admissions
// succeeds, the next one fails, and releasing a concurrency slot re-admits
// without reopening the request window.

use chunkflow::{SecurityConfig, SecurityGate, UploadError};

fn gate(max_rpm: u32, max_concurrent: u32) -> SecurityGate {
    let mut config = SecurityConfig::default();
    config.rate_limit.enabled = true;
    config.rate_limit.max_requests_per_minute = max_rpm;
    config.rate_limit.max_concurrent_uploads = max_concurrent;
    SecurityGate::new(config)
}

#[test]
fn exactly_max_requests_admitted() {
    let gate = gate(5, 100);

    for i in 0..5 {
        assert!(
            gate.check_rate_limit("alice").is_ok(),
            "admission {} should succeed",
            i
        );
    }
    assert!(matches!(
        gate.check_rate_limit("alice"),
        Err(UploadError::RateLimited(_))
    ));
}

#[test]
fn window_is_per_user() {
    let gate = gate(1, 100);

    gate.check_rate_limit("alice").unwrap();
    assert!(gate.check_rate_limit("alice").is_err());
    // Other users have their own window
    gate.check_rate_limit("bob").unwrap();
}

#[test]
fn concurrency_bound_releases() {
    let gate = gate(1000, 3);

    for _ in 0..3 {
        gate.check_rate_limit("alice").unwrap();
    }
    // The 4th concurrent upload is rejected until a slot frees
    assert!(gate.check_rate_limit("alice").is_err());

    gate.release_rate_limit("alice");
    assert!(gate.check_rate_limit("alice").is_ok());
}

#[test]
fn release_does_not_reopen_window() {
    let gate = gate(2, 100);

    gate.check_rate_limit("alice").unwrap();
    gate.check_rate_limit("alice").unwrap();
    gate.release_rate_limit("alice");
    gate.release_rate_limit("alice");

    // Window admissions are spent regardless of concurrency releases
    assert!(matches!(
        gate.check_rate_limit("alice"),
        Err(UploadError::RateLimited(_))
    ));
}

#[test]
fn rate_limit_error_message_names_the_bound() {
    let gate = gate(1, 1);
    gate.check_rate_limit("alice").unwrap();
    let err = gate.check_rate_limit("alice").unwrap_err();
    assert!(err.to_string().contains("rate limit"));
}

#[test]
fn disabled_limiter_admits_everything() {
    let gate = SecurityGate::new(SecurityConfig::default());
    for _ in 0..1000 {
        gate.check_rate_limit("alice").unwrap();
    }
}
