//! Property-Based Tests for Quota Admission
//!
//! # Test Properties
//!
//! 1. **Never Over Budget**: committed plus reserved bytes stay within the
//!    limit for any interleaving of admits, commits, releases and deletes
//! 2. **Release Restores**: releasing every reservation leaves usage untouched

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use super::{Operation, QuotaConfig, QuotaLimits, TenantQuotaManager, UsageDelta};

const LIMIT: u64 = 1000;

#[derive(Debug, Clone)]
enum Step {
    Write { size: u64, commit: bool },
    Delete { size: u64 },
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (1u64..400, any::<bool>()).prop_map(|(size, commit)| Step::Write { size, commit }),
        1 => (1u64..400).prop_map(|size| Step::Delete { size }),
    ]
}

fn manager() -> TenantQuotaManager {
    TenantQuotaManager::new(
        QuotaConfig::default().with_tenant("t1", QuotaLimits::unlimited().with_max_bytes(LIMIT)),
    )
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_usage_never_exceeds_limit(steps in prop::collection::vec(step_strategy(), 1..100)) {
        let quotas = manager();
        let mut held = Vec::new();

        for step in steps {
            match step {
                Step::Write { size, commit } => {
                    if let Ok(reservation) = quotas.admit("t1", Operation::Write, size) {
                        if commit {
                            reservation.commit();
                        } else {
                            held.push(reservation);
                        }
                    }
                }
                Step::Delete { size } => {
                    quotas.record("t1", UsageDelta::delete(size)).unwrap();
                }
            }
            let usage = quotas.usage("t1").unwrap();
            prop_assert!(usage.bytes_used + usage.bytes_reserved <= LIMIT);
        }
    }

    #[test]
    fn prop_release_restores_usage(sizes in prop::collection::vec(1u64..300, 1..20)) {
        let quotas = manager();
        let before = quotas.usage("t1").unwrap();
        let held: Vec<_> = sizes
            .into_iter()
            .filter_map(|size| quotas.admit("t1", Operation::Write, size).ok())
            .collect();
        for reservation in held {
            reservation.release();
        }
        let after = quotas.usage("t1").unwrap();
        prop_assert_eq!(after.bytes_used, before.bytes_used);
        prop_assert_eq!(after.bytes_reserved, 0);
        prop_assert_eq!(after.objects_reserved, 0);
    }

    #[test]
    fn prop_concurrent_admission_within_limit(sizes in prop::collection::vec(1u64..300, 8..64)) {
        let quotas = Arc::new(manager());
        tokio_test::block_on(async {
            let handles: Vec<_> = sizes
                .into_iter()
                .map(|size| {
                    let quotas = quotas.clone();
                    tokio::spawn(async move {
                        if let Ok(reservation) = quotas.admit("t1", Operation::Write, size) {
                            tokio::task::yield_now().await;
                            reservation.commit();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap();
            }
        });
        prop_assert!(quotas.usage("t1").unwrap().bytes_used <= LIMIT);
    }
}
