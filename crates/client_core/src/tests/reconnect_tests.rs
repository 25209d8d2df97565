use super::*;

fn policy(base_secs: u64, max_secs: u64, max_attempts: Option<u32>) -> ReconnectPolicy {
    ReconnectPolicy::new(ReconnectSettings {
        base_delay: Duration::from_secs(base_secs),
        max_delay: Duration::from_secs(max_secs),
        max_attempts,
    })
}

#[test]
fn delays_double_up_to_the_cap() {
    let mut policy = policy(1, 8, None);
    let delays: Vec<u64> = (0..5)
        .map(|_| policy.next_delay().expect("unbounded").as_secs())
        .collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 8]);
    assert_eq!(policy.attempts(), 5);
}

#[test]
fn default_policy_starts_at_five_seconds_and_caps_at_a_minute() {
    let mut policy = ReconnectPolicy::default();
    let delays: Vec<u64> = (0..6)
        .map(|_| policy.next_delay().expect("unbounded").as_secs())
        .collect();
    assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
}

#[test]
fn reset_returns_to_base_delay() {
    let mut policy = policy(1, 8, None);
    policy.next_delay();
    policy.next_delay();
    policy.next_delay();
    assert_eq!(policy.current_delay(), Duration::from_secs(8));

    policy.reset();
    assert_eq!(policy.current_delay(), Duration::from_secs(1));
    assert_eq!(policy.attempts(), 0);
    assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
}

#[test]
fn attempt_budget_stops_retries_until_reset() {
    let mut policy = policy(1, 8, Some(2));
    assert!(policy.next_delay().is_some());
    assert!(policy.next_delay().is_some());
    assert_eq!(policy.next_delay(), None);

    policy.reset();
    assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
}
