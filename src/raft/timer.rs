use rand::Rng;
use std::time::Duration;

/// Pick a fresh election timeout, uniform over `[min_ms, max_ms)`.
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let timeout_ms = if max_ms > min_ms {
        rand::thread_rng().gen_range(min_ms..max_ms)
    } else {
        min_ms
    };
    Duration::from_millis(timeout_ms)
}
