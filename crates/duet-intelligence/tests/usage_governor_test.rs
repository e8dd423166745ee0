use std::sync::Arc;

use duet_core::types::{SessionId, TokenUsage};
use duet_intelligence::{
    BudgetLimits, RateTable, Scope, ScopeLimit, UsageEstimate, UsageGovernor,
};

fn sid(raw: &str) -> SessionId {
    SessionId::parse(raw).unwrap()
}

fn daily_limit(max_tokens: u64) -> BudgetLimits {
    BudgetLimits {
        daily: ScopeLimit {
            max_tokens: Some(max_tokens),
            max_cost_usd: None,
        },
        ..BudgetLimits::default()
    }
}

#[test]
fn concurrent_reservations_never_overcommit_shared_daily_limit() {
    let gov = Arc::new(UsageGovernor::new(daily_limit(1_000), RateTable::default()));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let gov = Arc::clone(&gov);
            std::thread::spawn(move || {
                let session = sid(&format!("s{i}"));
                gov.reserve(&session, &UsageEstimate::new("m", 100, 0)).ok()
            })
        })
        .collect();

    let granted: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(granted.len(), 10);

    for reservation in granted {
        gov.commit(reservation, TokenUsage::new(100, 0));
    }
    let status = gov.status(&Scope::Daily);
    assert_eq!(status.used_tokens, 1_000);
    assert_eq!(status.requests, 10);
    assert_eq!(status.percentage, Some(100.0));
}

#[test]
fn denied_reservation_records_nothing() {
    let gov = UsageGovernor::new(daily_limit(100), RateTable::default());
    assert!(gov
        .reserve(&sid("s"), &UsageEstimate::new("m", 500, 0))
        .is_err());
    let status = gov.status(&Scope::Daily);
    assert_eq!(status.used_tokens, 0);
    assert_eq!(status.requests, 0);
}

#[test]
fn dropped_reservation_leaves_ledger_untouched() {
    let gov = UsageGovernor::new(daily_limit(100), RateTable::default());
    {
        let _held = gov
            .reserve(&sid("s"), &UsageEstimate::new("m", 100, 0))
            .unwrap();
        assert!(gov
            .reserve(&sid("t"), &UsageEstimate::new("m", 1, 0))
            .is_err());
    }
    assert!(gov
        .reserve(&sid("t"), &UsageEstimate::new("m", 100, 0))
        .is_ok());
    assert_eq!(gov.status(&Scope::Daily).requests, 0);
}

#[test]
fn session_limit_is_isolated_per_session() {
    let limits = BudgetLimits {
        session: ScopeLimit {
            max_tokens: Some(50),
            max_cost_usd: None,
        },
        ..BudgetLimits::default()
    };
    let gov = UsageGovernor::new(limits, RateTable::default());
    let r = gov.reserve(&sid("a"), &UsageEstimate::new("m", 10, 0)).unwrap();
    gov.commit(r, TokenUsage::new(50, 0));

    assert!(gov.check(&sid("a")).is_err());
    assert!(gov.check(&sid("b")).is_ok());
}

#[test]
fn persisted_counters_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let gov = UsageGovernor::new(daily_limit(1_000), RateTable::default())
            .with_persistence(dir.path())
            .unwrap();
        let r = gov.reserve(&sid("s"), &UsageEstimate::new("m", 10, 0)).unwrap();
        gov.commit(r, TokenUsage::new(600, 0));
        // An outstanding reservation is not persisted.
        let _pending = gov.reserve(&sid("s"), &UsageEstimate::new("m", 300, 0)).unwrap();
    }

    let gov = UsageGovernor::new(daily_limit(1_000), RateTable::default())
        .with_persistence(dir.path())
        .unwrap();
    assert_eq!(gov.status(&Scope::Daily).used_tokens, 600);
    assert_eq!(gov.status(&Scope::Session(sid("s"))).used_tokens, 600);
    assert!(gov
        .reserve(&sid("s"), &UsageEstimate::new("m", 400, 0))
        .is_ok());
}

#[test]
fn concurrent_commits_leave_newest_counters_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    {
        let gov = Arc::new(
            UsageGovernor::new(BudgetLimits::default(), RateTable::default())
                .with_persistence(dir.path())
                .unwrap(),
        );
        let handles: Vec<_> = (0..12)
            .map(|i| {
                let gov = Arc::clone(&gov);
                std::thread::spawn(move || {
                    let session = sid(&format!("w{}", i % 3));
                    for _ in 0..5 {
                        let r = gov.reserve(&session, &UsageEstimate::new("m", 1, 0)).unwrap();
                        gov.commit(r, TokenUsage::new(7, 3));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(gov.status(&Scope::Daily).requests, 60);
    }

    let gov = UsageGovernor::new(BudgetLimits::default(), RateTable::default())
        .with_persistence(dir.path())
        .unwrap();
    let daily = gov.status(&Scope::Daily);
    assert_eq!(daily.requests, 60);
    assert_eq!(daily.used_tokens, 600);
    assert_eq!(gov.status(&Scope::Monthly).used_tokens, 600);
    for i in 0..3 {
        assert_eq!(
            gov.status(&Scope::Session(sid(&format!("w{i}")))).used_tokens,
            200
        );
    }
}
