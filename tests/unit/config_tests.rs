//! Unit tests for the per-call options struct (spec §6), independent of any
//! backing store.

use std::time::Duration;

use memolock::config::{MemolockOptions, Ttl};

#[test]
fn defaults_match_the_spec_table() {
    let opts = MemolockOptions::<u64>::new(Ttl::Fixed(Duration::from_secs(1)));
    assert_eq!(opts.lock_timeout, Duration::from_millis(1000));
    assert_eq!(opts.max_attempts, 3);
    assert!(!opts.force_refresh);
    assert!((opts.cache_if)(&0));
}

#[test]
fn ttl_of_value_is_evaluated_against_the_produced_value() {
    let ttl = Ttl::OfValue(std::sync::Arc::new(|v: &u64| {
        if *v == 0 {
            Duration::from_millis(0)
        } else {
            Duration::from_secs(60)
        }
    }));
    assert_eq!(ttl.resolve(&0), Duration::from_millis(0));
    assert_eq!(ttl.resolve(&5), Duration::from_secs(60));
}

#[test]
fn default_encode_of_json_null_falls_back_to_the_literal_string() {
    let opts = MemolockOptions::<()>::new(Ttl::Fixed(Duration::from_secs(1)));
    // `serde_json::to_string(&())` produces `"null"`, never an empty
    // string, but the crate's fallback (spec §6) must still hold for any
    // codec that *does* produce an empty string.
    let encoded = (opts.encode)(&()).unwrap();
    assert_eq!(encoded, "null");
}

#[test]
fn custom_codec_overrides_the_default() {
    let opts = MemolockOptions::<u64>::new(Ttl::Fixed(Duration::from_secs(1))).with_codec(
        |v: &u64| Ok(format!("custom:{v}")),
        |s: &str| {
            s.strip_prefix("custom:")
                .ok_or_else(|| anyhow::anyhow!("bad format"))?
                .parse::<u64>()
                .map_err(Into::into)
        },
    );
    let encoded = (opts.encode)(&42).unwrap();
    assert_eq!(encoded, "custom:42");
    let decoded = (opts.decode)(&encoded).unwrap();
    assert_eq!(decoded, 42);
}
