use std::time::Duration;

use crate::config::CoapConfig;
use crate::util::random::Random;

/// The timeout before retransmission `n` (starting at 1) of a confirmable message:
///  `2^(n-1) * ack_timeout * (1 + random * (ack_random_factor - 1))`
pub fn retransmission_delay<R: Random>(n: u32, config: &CoapConfig) -> Duration {
    let random = R::gen_f64_range(0.0..1.0);
    let factor = 1.0 + random * (config.ack_random_factor - 1.0);
    let exponent = n.saturating_sub(1).min(31);
    config.ack_timeout.mul_f64((1u64 << exponent) as f64 * factor)
}

/// Cumulative send times for the initial transmission and all retransmissions of a confirmable
///  message, relative to the initial transmission: `d[0] = 0, d[i] = d[i-1] + backoff(i)`
pub fn transmission_schedule<R: Random>(config: &CoapConfig) -> Vec<Duration> {
    let mut result = Vec::with_capacity(config.max_retransmissions as usize + 1);
    let mut cumulative = Duration::ZERO;
    result.push(cumulative);
    for n in 1..=config.max_retransmissions {
        cumulative += retransmission_delay::<R>(n, config);
        result.push(cumulative);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use super::*;
    use rstest::rstest;
    use crate::util::random::{MockRandom, RngRandom, MOCK_RANDOM_MUTEX};

    fn config() -> CoapConfig {
        CoapConfig::new(SocketAddr::from(([127, 0, 0, 1], 5683)))
    }

    #[rstest]
    #[case::no_randomness(0.0, vec![0, 2000, 6000, 14000, 30000])]
    #[case::half(0.5, vec![0, 2500, 7500, 17500, 37500])]
    #[case::quarter(0.25, vec![0, 2250, 6750, 15750, 33750])]
    fn test_transmission_schedule(#[case] random: f64, #[case] expected_millis: Vec<u64>) {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect()
            .returning(move |_| random);

        let actual: Vec<u64> = transmission_schedule::<MockRandom>(&config())
            .into_iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(actual, expected_millis);
    }

    #[rstest]
    #[case::first(1, 2000)]
    #[case::second(2, 4000)]
    #[case::fourth(4, 16000)]
    fn test_retransmission_delay_without_random_factor(#[case] n: u32, #[case] expected_millis: u64) {
        let mut config = config();
        config.ack_random_factor = 1.0;
        assert_eq!(retransmission_delay::<RngRandom>(n, &config), Duration::from_millis(expected_millis));
    }

    #[test]
    fn test_retransmission_delay_bounds() {
        let config = config();
        for _ in 0..100 {
            let d = retransmission_delay::<RngRandom>(1, &config);
            assert!(d >= Duration::from_millis(2000));
            assert!(d < Duration::from_millis(3000));
        }
    }
}
