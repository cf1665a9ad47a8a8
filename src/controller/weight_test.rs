use super::*;

fn policy(step: i32, max: i32) -> Policy {
    Policy {
        step_size: step,
        max_weight: max,
        success_threshold: 0.99,
        hysteresis_margin: 0.02,
        step_interval: Duration::from_secs(60),
        bake_duration: Duration::ZERO,
        unknown_grace: Duration::from_secs(120),
        max_latency_ms: None,
    }
}

fn healthy(ratio: f64) -> Option<WindowStats> {
    Some(WindowStats {
        success_ratio: ratio,
        latency_ms: 100.0,
        samples: 1,
    })
}

fn input(weight: i32, canary: Option<WindowStats>) -> TickInput {
    TickInput {
        phase: Phase::Progressing,
        canary_weight: weight,
        health: Health::Reporting,
        unknown_since: None,
        max_weight_reached_at: None,
        canary,
        now: Utc::now(),
    }
}

/// Drive `decide` with always-healthy windows, applying verdicts the way the
/// orchestrator does; returns (ticks until promotion, weights seen)
fn run_healthy(policy: &Policy, initial: i32) -> (usize, Vec<i32>) {
    let mut weight = initial;
    let mut weights = vec![weight];
    for tick in 1..=200 {
        match decide(policy, &input(weight, healthy(1.0))) {
            Verdict::Advance { to } => {
                weight = to;
                weights.push(weight);
            }
            Verdict::Promote { .. } => {
                weights.push(100);
                return (tick, weights);
            }
            other => panic!("unexpected verdict {other:?} at weight {weight}"),
        }
    }
    panic!("never promoted");
}

#[test]
fn test_healthy_rollout_promotes_within_ceil_max_over_step_ticks() {
    for (step, max) in [(10, 100), (20, 100), (30, 100), (25, 50), (7, 90), (100, 100), (1, 5)] {
        let (ticks, _) = run_healthy(&policy(step, max), 0);
        let bound = ((max as f64) / (step as f64)).ceil() as usize;
        assert!(
            ticks <= bound,
            "step {step} max {max}: promoted after {ticks} ticks, bound {bound}"
        );
    }
}

#[test]
fn test_weight_never_decreases_while_progressing() {
    for (step, max, initial) in [(10, 100, 0), (15, 80, 5), (33, 100, 10), (50, 60, 60)] {
        let (_, weights) = run_healthy(&policy(step, max), initial);
        for pair in weights.windows(2) {
            assert!(pair[1] >= pair[0], "weights went down: {weights:?}");
        }
        for w in &weights[..weights.len() - 1] {
            assert!(*w <= max);
        }
    }
}

#[test]
fn test_advance_is_capped_at_max_weight() {
    let mut p = policy(30, 80);
    p.bake_duration = Duration::from_secs(60);

    assert_eq!(
        decide(&p, &input(60, healthy(1.0))),
        Verdict::Advance { to: 80 }
    );
}

#[test]
fn test_zero_bake_promotes_on_tick_reaching_max() {
    assert_eq!(
        decide(&policy(20, 100), &input(80, healthy(1.0))),
        Verdict::Promote { after_bake: false }
    );
}

#[test]
fn test_single_breach_rolls_back() {
    let verdict = decide(&policy(20, 100), &input(40, healthy(0.90)));
    assert_eq!(verdict, Verdict::Rollback { success_ratio: 0.90 });
}

#[test]
fn test_hysteresis_band_holds() {
    // threshold 0.99, margin 0.02: [0.97, 0.99) holds
    for ratio in [0.971, 0.975, 0.989] {
        assert_eq!(
            decide(&policy(20, 100), &input(40, healthy(ratio))),
            Verdict::Hold(HoldReason::WithinHysteresis),
            "ratio {ratio}"
        );
    }
    assert!(matches!(
        decide(&policy(20, 100), &input(40, healthy(0.969))),
        Verdict::Rollback { .. }
    ));
    assert_eq!(
        decide(&policy(20, 100), &input(40, healthy(0.99))),
        Verdict::Advance { to: 60 }
    );
}

#[test]
fn test_empty_window_holds() {
    assert_eq!(
        decide(&policy(20, 100), &input(40, None)),
        Verdict::Hold(HoldReason::NoSamples)
    );
}

#[test]
fn test_latency_gate_holds_without_rollback() {
    let mut p = policy(20, 100);
    p.max_latency_ms = Some(250.0);
    let slow = Some(WindowStats {
        success_ratio: 1.0,
        latency_ms: 400.0,
        samples: 3,
    });

    assert_eq!(
        decide(&p, &input(40, slow)),
        Verdict::Hold(HoldReason::LatencyAboveLimit)
    );
}

#[test]
fn test_unknown_health_holds_then_pauses_after_grace() {
    let p = policy(20, 100);
    let now = Utc::now();
    let mut tick = input(40, None);
    tick.health = Health::Unknown;
    tick.unknown_since = Some(now);

    tick.now = now + chrono::Duration::seconds(60);
    assert_eq!(decide(&p, &tick), Verdict::Hold(HoldReason::AwaitingGrace));

    tick.now = now + chrono::Duration::seconds(120);
    assert_eq!(decide(&p, &tick), Verdict::Pause);
}

#[test]
fn test_unknown_health_takes_precedence_over_stale_window() {
    let p = policy(20, 100);
    let now = Utc::now();
    let mut tick = input(40, healthy(1.0));
    tick.health = Health::Unknown;
    tick.unknown_since = Some(now);
    tick.now = now;

    assert_eq!(decide(&p, &tick), Verdict::Hold(HoldReason::AwaitingGrace));
}

#[test]
fn test_bake_duration_delays_promotion() {
    let mut p = policy(20, 100);
    p.bake_duration = Duration::from_secs(300);
    let reached = Utc::now();

    let mut tick = input(100, healthy(1.0));
    tick.max_weight_reached_at = Some(reached);

    tick.now = reached + chrono::Duration::seconds(299);
    assert_eq!(decide(&p, &tick), Verdict::Hold(HoldReason::Baking));

    tick.now = reached + chrono::Duration::seconds(300);
    assert_eq!(decide(&p, &tick), Verdict::Promote { after_bake: true });
}

#[test]
fn test_breach_during_bake_still_rolls_back() {
    let mut p = policy(20, 100);
    p.bake_duration = Duration::from_secs(300);
    let mut tick = input(100, healthy(0.5));
    tick.max_weight_reached_at = Some(Utc::now());

    assert!(matches!(decide(&p, &tick), Verdict::Rollback { .. }));
}

#[test]
fn test_paused_rollout_only_reacts_to_breach() {
    let p = policy(20, 100);
    let mut tick = input(40, healthy(1.0));
    tick.phase = Phase::Paused;
    assert_eq!(decide(&p, &tick), Verdict::Hold(HoldReason::NotProgressing));

    tick.canary = healthy(0.98);
    assert_eq!(decide(&p, &tick), Verdict::Hold(HoldReason::NotProgressing));

    tick.canary = healthy(0.5);
    assert_eq!(decide(&p, &tick), Verdict::Rollback { success_ratio: 0.5 });
}

#[test]
fn test_terminal_and_pending_phases_hold() {
    let p = policy(20, 100);
    for phase in [Phase::Pending, Phase::Promoted, Phase::RolledBack, Phase::Failed] {
        let mut tick = input(40, healthy(0.1));
        tick.phase = phase;
        assert_eq!(decide(&p, &tick), Verdict::Hold(HoldReason::NotProgressing));
    }
}

#[test]
fn test_policy_from_plan_prefers_plan_bake() {
    let plan: RolloutPlan = serde_yaml::from_str(
        r#"
service: checkout
stableRevision: v1
canaryRevision: v2
stepSize: 25
stepInterval: 30s
successThreshold: 0.95
bakeDuration: 5m
"#,
    )
    .unwrap();
    let mut config = ControllerConfig::default();
    config.bake_duration = Duration::from_secs(60);

    let p = Policy::from_plan(&plan, &config);
    assert_eq!(p.bake_duration, Duration::from_secs(300));
    assert_eq!(p.step_interval, Duration::from_secs(30));
    assert!((p.rollback_below() - 0.93).abs() < 1e-9);

    let plan = RolloutPlan {
        bake_duration: None,
        ..plan
    };
    assert_eq!(
        Policy::from_plan(&plan, &config).bake_duration,
        Duration::from_secs(60)
    );
}
