use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Single-mutex token bucket per §4.9 step 4. `wait` refills using the
/// wall-clock delta since the last touch, consumes a token if one is
/// available, and otherwise sleeps the shortfall (jittered, floored at
/// 1ms) before retrying. Unlike the teacher's `RetryConfig::jitter`, which
/// guards a language-global PRNG behind its own mutex, `rand::thread_rng`
/// is already a dedicated thread-local generator, so no second mutex is
/// needed here.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    jitter: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64, jitter: f64) -> Self {
        Self {
            rate,
            burst,
            jitter: jitter.clamp(0.0, 1.0),
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Returns the total time spent waiting for a token to become
    /// available. A single consumer observes monotonic progress toward
    /// admission: every iteration either consumes a token or sleeps.
    pub async fn wait(&self) -> Duration {
        let start = Instant::now();
        loop {
            let required = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some((1.0 - state.tokens) / self.rate)
                }
            };

            match required {
                None => return start.elapsed(),
                Some(seconds) => tokio::time::sleep(jittered(seconds, self.jitter)).await,
            }
        }
    }
}

fn jittered(seconds: f64, jitter: f64) -> Duration {
    let base_ms = (seconds * 1000.0).max(1.0);
    let ms = if jitter > 0.0 {
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        (base_ms * factor).max(1.0)
    } else {
        base_ms
    };
    Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn admits_immediately_up_to_burst() {
        let bucket = TokenBucket::new(1.0, 3.0, 0.0);
        for _ in 0..3 {
            let waited = bucket.wait().await;
            assert_eq!(waited, Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_and_refills_once_burst_is_exhausted() {
        let bucket = TokenBucket::new(1.0, 1.0, 0.0);
        let first = bucket.wait().await;
        assert_eq!(first, Duration::ZERO);

        let handle = tokio::spawn(async move { bucket.wait().await });
        tokio::time::advance(Duration::from_millis(1100)).await;
        let waited = handle.await.unwrap();
        assert!(waited >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn long_run_rate_converges_under_sustained_demand() {
        let bucket = Arc::new(TokenBucket::new(50.0, 5.0, 0.0));
        let start = Instant::now();

        let consumer = {
            let bucket = bucket.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    bucket.wait().await;
                }
            })
        };

        while !consumer.is_finished() {
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        consumer.await.unwrap();

        let elapsed = start.elapsed().as_secs_f64();
        let observed_rate = 100.0 / elapsed;
        assert!(observed_rate <= 55.0, "observed rate {observed_rate} exceeded configured rate with margin");
    }
}
