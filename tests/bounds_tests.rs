//! Property tests: every bounded structure stays within its bound under
//! arbitrary operation sequences.

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use nexus_telemetry::clock::ManualClock;
use nexus_telemetry::config::PipelineConfig;
use nexus_telemetry::edge::{Reading, SimulatedUplink};
use nexus_telemetry::pipeline::Pipeline;
use nexus_telemetry::rate_limiter::RateLimiter;
use nexus_telemetry::telemetry::{meta, TelemetryCollector, TelemetryConfig, TraceStatus};
use nexus_telemetry::tenant::{InMemoryTenantStore, TenantConfig};

#[derive(Debug, Clone)]
enum LimiterOp {
    Admit,
    Peek,
    Advance(u64),
    SetRate(u32),
}

fn limiter_op() -> impl Strategy<Value = LimiterOp> {
    prop_oneof![
        4 => Just(LimiterOp::Admit),
        1 => Just(LimiterOp::Peek),
        2 => (0u64..120_000).prop_map(LimiterOp::Advance),
        1 => (1u32..500).prop_map(LimiterOp::SetRate),
    ]
}

proptest! {
    #[test]
    fn prop_tokens_stay_within_bounds(ops in prop::collection::vec(limiter_op(), 1..200)) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(InMemoryTenantStore::from_configs([TenantConfig::new("t", 60, 10)]));
        let limiter = RateLimiter::new(store.clone(), clock.clone());

        for op in ops {
            match op {
                LimiterOp::Admit => {
                    limiter.check_admission("t");
                }
                LimiterOp::Peek => {
                    let first = limiter.status("t");
                    let second = limiter.status("t");
                    prop_assert_eq!(first, second, "status must not debit");
                }
                LimiterOp::Advance(ms) => clock.advance(Duration::from_millis(ms)),
                LimiterOp::SetRate(r) => {
                    store.set_rate_limit("t", r);
                }
            }
            let max = f64::from(store.get("t").map(|c| c.rate_limit_per_minute).unwrap_or(60));
            let bucket = limiter.status("t");
            prop_assert!(bucket.tokens >= 0.0, "negative tokens {}", bucket.tokens);
            prop_assert!(bucket.tokens <= max, "tokens {} above max {}", bucket.tokens, max);
        }
    }

    #[test]
    fn prop_buffer_never_exceeds_capacity(
        capacity in 1usize..64,
        ingests in 0usize..200,
    ) {
        let mut cfg = PipelineConfig::default();
        cfg.edge.capacity = Some(capacity);
        let p = Pipeline::new(
            &cfg,
            Arc::new(ManualClock::new(0)),
            Arc::new(SimulatedUplink::new(Duration::ZERO)),
        );

        let mut accepted = 0usize;
        for i in 0..ingests {
            let before = p.edge.pending();
            let ok = p.edge.ingest("M", Reading::from([("v".to_string(), i as f64)]));
            if ok {
                accepted += 1;
            } else {
                prop_assert_eq!(p.edge.pending(), before);
            }
            prop_assert!(p.edge.status().used <= capacity);
        }
        let status = p.edge.status();
        prop_assert_eq!(status.used, accepted);
        prop_assert_eq!(status.dropped as usize, ingests - accepted);
    }

    #[test]
    fn prop_trace_log_bounded_newest_first(appends in 0usize..450) {
        let t = TelemetryCollector::new(TelemetryConfig::default(), Arc::new(ManualClock::new(0)));
        for i in 0..appends {
            t.record("svc", &format!("op-{i}"), TraceStatus::Ok, 1, meta(serde_json::json!({})));
        }
        let traces = t.recent_traces();
        prop_assert_eq!(traces.len(), appends.min(200));
        if appends > 0 {
            prop_assert_eq!(&traces[0].operation, &format!("op-{}", appends - 1));
        }
    }

    #[test]
    fn prop_error_rate_is_a_percentage(errors in prop::collection::vec(any::<bool>(), 0..120)) {
        let t = TelemetryCollector::new(TelemetryConfig::default(), Arc::new(ManualClock::new(0)));
        for &is_err in &errors {
            let status = if is_err { TraceStatus::Error } else { TraceStatus::Ok };
            t.record("svc", "op", status, 5, meta(serde_json::json!({})));
        }
        let sample = t.sample_metrics(None);
        let recent_errors = errors.iter().rev().take(50).filter(|e| **e).count();
        prop_assert!((0.0..=100.0).contains(&sample.error_rate));
        prop_assert!((sample.error_rate - recent_errors as f64 / 50.0 * 100.0).abs() < 1e-9);
    }
}
