use rand::Rng;
use std::time::Duration;

/// Draw a fresh election timeout, uniform in `[min_ms, max_ms)`.
///
/// Redrawn on every reset, never fixed at startup, so nodes that split a
/// vote desynchronize on the next round.
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..max_ms);
    Duration::from_millis(timeout_ms)
}
