// src/coordinator/scripts.rs

//! Lua source for the two atomic scripts the coordinator relies on. Both are
//! submitted through `redis::Script`, which transparently caches the script
//! hash and falls back from `EVALSHA` to `EVAL` on a `NOSCRIPT` reply, so the
//! coordinator never has to manage `SCRIPT LOAD` itself.
//!
//! Both scripts always return a string: the new counter value on success, or
//! one of a small set of sentinel tags on a condition the caller must branch
//! on. Returning a uniform type keeps the Rust side from having to guess
//! whether a RESP reply is an integer or a bulk string.

/// KEYS[1] = bucket/<id>/count
/// KEYS[2] = bucket/<id>/max
/// KEYS[3] = replica/<self>/conns
/// ARGV[1] = bucket id (hash field in KEYS[3])
pub const ACQUIRE_SCRIPT: &str = r#"
local max = tonumber(redis.call('GET', KEYS[2]) or '0')
if max == 0 then
  return 'UNCONFIGURED'
end
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count >= max then
  return 'FULL'
end
local new_count = redis.call('INCR', KEYS[1])
redis.call('HINCRBY', KEYS[3], ARGV[1], 1)
return tostring(new_count)
"#;

/// KEYS[1] = bucket/<id>/count
/// KEYS[2] = replica/<self>/conns
/// KEYS[3] = release/<id> pub/sub channel
/// ARGV[1] = bucket id (hash field in KEYS[2])
pub const RELEASE_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count <= 0 then
  return 'UNDERFLOW'
end
local new_count = redis.call('DECR', KEYS[1])
redis.call('HINCRBY', KEYS[2], ARGV[1], -1)
redis.call('PUBLISH', KEYS[3], '')
return tostring(new_count)
"#;

/// Outcome of running either script against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    Count(i64),
    Full,
    Unconfigured,
    Underflow,
}

pub fn parse_outcome(raw: &str) -> ScriptOutcome {
    match raw {
        "FULL" => ScriptOutcome::Full,
        "UNCONFIGURED" => ScriptOutcome::Unconfigured,
        "UNDERFLOW" => ScriptOutcome::Underflow,
        n => n
            .parse::<i64>()
            .map(ScriptOutcome::Count)
            .unwrap_or(ScriptOutcome::Unconfigured),
    }
}

pub fn count_key(bucket_id: &str) -> String {
    format!("bucket/{bucket_id}/count")
}

pub fn max_key(bucket_id: &str) -> String {
    format!("bucket/{bucket_id}/max")
}

pub fn conns_key(replica_id: &str) -> String {
    format!("replica/{replica_id}/conns")
}

pub fn heartbeat_key(replica_id: &str) -> String {
    format!("replica/{replica_id}/heartbeat")
}

pub fn release_channel(bucket_id: &str) -> String {
    format!("release/{bucket_id}")
}

pub const REPLICAS_SET_KEY: &str = "replicas";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sentinels_and_counts() {
        assert_eq!(parse_outcome("FULL"), ScriptOutcome::Full);
        assert_eq!(parse_outcome("UNCONFIGURED"), ScriptOutcome::Unconfigured);
        assert_eq!(parse_outcome("UNDERFLOW"), ScriptOutcome::Underflow);
        assert_eq!(parse_outcome("7"), ScriptOutcome::Count(7));
        assert_eq!(parse_outcome("0"), ScriptOutcome::Count(0));
    }
}
