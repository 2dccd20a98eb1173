use std::future::Future;
use std::time::Duration;

/// Run `probe` up to `max_attempts` times, sleeping `interval` between
/// attempts, until it yields a value.
///
/// Every wait in this tool (IP acquisition, SSH readiness, mDNS resolution,
/// shutdown grace) goes through here, so the bound is uniform: the total
/// wall time never exceeds `max_attempts * interval` plus probe time, and no
/// sleep happens after the final attempt.
pub async fn poll_until<T, F, Fut>(max_attempts: u32, interval: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for attempt in 1..=max_attempts {
        if let Some(value) = probe().await {
            return Some(value);
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    None
}
