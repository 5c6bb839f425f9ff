use rand::Rng;
use std::time::Duration;

use crate::config::QueueConfig;

/// Delay before redelivering a job whose `attempt`-th try failed.
///
/// Exponential from `backoff_base_ms`, capped at `backoff_max_ms`, then
/// spread by a random factor within `1 ± backoff_jitter` so failed jobs do
/// not come back in lockstep.
pub fn backoff_delay(cfg: &QueueConfig, attempt: u32, rng: &mut impl Rng) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let raw = cfg.backoff_base_ms.saturating_mul(1u64 << exp);
    let capped = raw.min(cfg.backoff_max_ms) as f64;
    let jitter = cfg.backoff_jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        rng.gen_range(1.0 - jitter..=1.0 + jitter)
    } else {
        1.0
    };
    let ms = (capped * factor).min(cfg.backoff_max_ms as f64).max(0.0);
    Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let cfg = QueueConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1000,
            backoff_jitter: 0.0,
            ..Default::default()
        };
        let mut rng = rand::thread_rng();
        let delays: Vec<u64> = (1..=6)
            .map(|a| backoff_delay(&cfg, a, &mut rng).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn jitter_stays_in_band() {
        let cfg = QueueConfig {
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
            backoff_jitter: 0.2,
            ..Default::default()
        };
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let d = backoff_delay(&cfg, 2, &mut rng).as_millis() as u64;
            assert!((1599..=2400).contains(&d), "{}", d);
        }
    }
}
