/// Shared fixtures for consensus tests

use proptest::prelude::*;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to `warn` so passing tests stay quiet.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Committee sizes of the form 3f+1 for f in 1..=max_faulty
pub fn committee_size_strategy(max_faulty: usize) -> impl Strategy<Value = usize> {
    (1..=max_faulty).prop_map(|f| 3 * f + 1)
}

/// Sequences of rounds, not necessarily ordered
pub fn round_sequence_strategy(max_len: usize, max_round: u64) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0..=max_round, 1..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn committee_sizes_are_3f_plus_1(n in committee_size_strategy(10)) {
            prop_assert_eq!(n % 3, 1);
            prop_assert!(n >= 4);
        }
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
