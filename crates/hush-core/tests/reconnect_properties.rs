//! Property-based tests for the reconnect machine.

use std::time::{Duration, Instant};

use hush_core::{ReconnectAction, ReconnectConfig, ReconnectMachine, ReconnectState};
use proptest::prelude::*;

/// Drive `failures` back-to-back dial failures and collect the waits.
fn waits_after_failures(config: ReconnectConfig, failures: u32) -> Vec<ReconnectAction> {
    let mut now = Instant::now();
    let mut machine = ReconnectMachine::new(config);
    let mut actions = machine.connect();

    for _ in 0..failures {
        actions.extend(machine.on_connect_failed(now));
        if let ReconnectState::Reconnecting { retry_at, .. } = machine.state() {
            now = retry_at;
            actions.extend(machine.tick(now));
        }
    }

    actions.into_iter().filter(|a| !matches!(a, ReconnectAction::Dial)).collect()
}

#[test]
fn prop_backoff_matches_capped_doubling() {
    proptest!(|(base_ms in 1u64..5_000, cap_factor in 1u32..64, failures in 1u32..20)| {
        let base = Duration::from_millis(base_ms);
        let config = ReconnectConfig {
            base_delay: base,
            max_delay: base * cap_factor,
            max_attempts: 32,
        };

        let waits = waits_after_failures(config.clone(), failures);
        prop_assert_eq!(waits.len(), failures as usize);

        for (i, action) in waits.iter().enumerate() {
            let expected = (base * 2u32.pow(i as u32)).min(config.max_delay);
            prop_assert_eq!(*action, ReconnectAction::Wait { delay: expected });
        }
    });
}

#[test]
fn default_schedule_after_immediate_failures() {
    let waits = waits_after_failures(ReconnectConfig::default(), 8);
    let secs: Vec<u64> = waits
        .iter()
        .map(|a| match a {
            ReconnectAction::Wait { delay } => delay.as_secs(),
            other => panic!("unexpected action {other:?}"),
        })
        .collect();

    assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
}

#[test]
fn prop_gives_up_exactly_once_at_limit() {
    proptest!(|(max_attempts in 1u32..12)| {
        let config = ReconnectConfig { max_attempts, ..ReconnectConfig::default() };
        let actions = waits_after_failures(config, max_attempts + 3);

        let give_ups: Vec<_> =
            actions.iter().filter(|a| matches!(a, ReconnectAction::GiveUp { .. })).collect();
        let expected = ReconnectAction::GiveUp { attempts: max_attempts };
        prop_assert_eq!(give_ups, vec![&expected]);
    });
}
