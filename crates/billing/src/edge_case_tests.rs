//! Edge Case Tests for the Entitlement Core
//!
//! Exercises the boundary conditions and race conditions that matter:
//! - Credit consumption under concurrency (non-negativity, exactly-N wins)
//! - Webhook idempotency (sequential and concurrent duplicate delivery)
//! - Subscription lifecycle (upsert on renewal, deactivate on cancel)

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::BillingEmailService;
use crate::entitlements::{Entitlement, EntitlementKind, EntitlementService, NewEntitlement};
use crate::events::EventEnvelope;
use crate::plans::Plan;
use crate::store::{BillingStore, MemoryBillingStore};
use crate::webhooks::{WebhookHandler, WebhookOutcome};

fn credits_entitlement(user_id: Uuid, remaining: i32) -> Entitlement {
    let now = OffsetDateTime::now_utc();
    Entitlement {
        id: Uuid::new_v4(),
        user_id,
        kind: EntitlementKind::Credits,
        credits_remaining: remaining,
        expires_at: None,
        plan_name: Plan::FivePack,
        stripe_customer_id: None,
        stripe_subscription_id: None,
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

fn handler(store: Arc<MemoryBillingStore>) -> WebhookHandler {
    WebhookHandler::new(store, BillingEmailService::disabled(), "whsec_test")
}

fn checkout_event(event_id: &str, user_id: Uuid, plan: &str) -> EventEnvelope {
    let payload = format!(
        r#"{{
            "id": "{event_id}",
            "type": "checkout.session.completed",
            "created": 1700000000,
            "data": {{
                "object": {{
                    "id": "cs_{event_id}",
                    "mode": "payment",
                    "amount_total": 2999,
                    "currency": "usd",
                    "customer": "cus_1",
                    "payment_intent": "pi_{event_id}",
                    "metadata": {{
                        "user_id": "{user_id}",
                        "plan_name": "{plan}"
                    }}
                }}
            }}
        }}"#
    );
    EventEnvelope::parse(&payload).unwrap()
}

fn subscription_event(
    event_id: &str,
    event_type: &str,
    subscription_id: &str,
    user_id: Uuid,
    status: &str,
    period_end: i64,
) -> EventEnvelope {
    let payload = format!(
        r#"{{
            "id": "{event_id}",
            "type": "{event_type}",
            "data": {{
                "object": {{
                    "id": "{subscription_id}",
                    "status": "{status}",
                    "customer": "cus_1",
                    "current_period_end": {period_end},
                    "metadata": {{ "user_id": "{user_id}" }}
                }}
            }}
        }}"#
    );
    EventEnvelope::parse(&payload).unwrap()
}

// =============================================================================
// Credit consumption races
// =============================================================================
mod consume_tests {
    use super::*;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_concurrent_consumers_exactly_n_succeed() {
        let store = Arc::new(MemoryBillingStore::new());
        let user_id = Uuid::new_v4();
        store.seed_entitlement(credits_entitlement(user_id, 3)).await;

        let service = EntitlementService::new(store.clone());
        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        // Each task behaves like a report request: re-evaluate, then try
        // to consume; on a lost race, re-evaluate and try again.
        for _ in 0..10 {
            let service = service.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                loop {
                    let check = service.check_access(user_id).await.unwrap();
                    let Some(entitlement) = check.entitlement else {
                        return false;
                    };
                    if service.consume(&entitlement).await.unwrap() {
                        return true;
                    }
                }
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }

        assert_eq!(successes, 3, "Exactly 3 consumers should win 3 credits");

        let rows = store.list_active(user_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].credits_remaining, 0, "Never negative, ends at zero");
    }

    #[tokio::test]
    async fn test_stale_snapshot_loses_the_race() {
        let store = Arc::new(MemoryBillingStore::new());
        let user_id = Uuid::new_v4();
        let entitlement = credits_entitlement(user_id, 2);
        store.seed_entitlement(entitlement.clone()).await;

        // First debit with the fresh snapshot wins
        assert!(store.compare_and_debit_credit(entitlement.id, 2).await.unwrap());
        // Replaying the same snapshot must fail, not decrement again
        assert!(!store.compare_and_debit_credit(entitlement.id, 2).await.unwrap());

        let rows = store.list_active(user_id).await.unwrap();
        assert_eq!(rows[0].credits_remaining, 1);
    }

    #[tokio::test]
    async fn test_debit_at_zero_fails() {
        let store = Arc::new(MemoryBillingStore::new());
        let user_id = Uuid::new_v4();
        let entitlement = credits_entitlement(user_id, 0);
        store.seed_entitlement(entitlement.clone()).await;

        assert!(
            !store.compare_and_debit_credit(entitlement.id, 0).await.unwrap(),
            "A debit that would go negative must fail, not clamp"
        );
    }

    #[tokio::test]
    async fn test_pass_consumption_is_a_noop() {
        let store = Arc::new(MemoryBillingStore::new());
        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let mut pass = credits_entitlement(user_id, 0);
        pass.kind = EntitlementKind::Pass;
        pass.plan_name = Plan::ThreeDayPass;
        pass.expires_at = Some(now + time::Duration::days(2));
        store.seed_entitlement(pass.clone()).await;

        let service = EntitlementService::new(store.clone());
        for _ in 0..5 {
            let check = service.check_access(user_id).await.unwrap();
            let entitlement = check.entitlement.unwrap();
            assert_eq!(entitlement.kind, EntitlementKind::Pass);
            assert!(service.consume(&entitlement).await.unwrap());
        }

        let rows = store.list_active(user_id).await.unwrap();
        assert!(rows[0].is_effective(now), "Pass stays effective after use");
    }

    #[tokio::test]
    async fn test_fifo_across_two_credit_grants() {
        let store = Arc::new(MemoryBillingStore::new());
        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        let mut older = credits_entitlement(user_id, 2);
        older.created_at = now - time::Duration::days(30);
        let mut newer = credits_entitlement(user_id, 5);
        newer.created_at = now - time::Duration::days(1);
        store.seed_entitlement(older.clone()).await;
        store.seed_entitlement(newer.clone()).await;

        let service = EntitlementService::new(store.clone());

        for expected in [older.id, older.id, newer.id] {
            let check = service.check_access(user_id).await.unwrap();
            let entitlement = check.entitlement.unwrap();
            assert_eq!(entitlement.id, expected, "Oldest funded grant debits first");
            assert!(service.consume(&entitlement).await.unwrap());
        }

        let rows = store.list_active(user_id).await.unwrap();
        let older_row = rows.iter().find(|e| e.id == older.id).unwrap();
        let newer_row = rows.iter().find(|e| e.id == newer.id).unwrap();
        assert_eq!(older_row.credits_remaining, 0);
        assert_eq!(newer_row.credits_remaining, 4);
    }
}

// =============================================================================
// Webhook idempotency
// =============================================================================
mod webhook_tests {
    use super::*;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_duplicate_delivery_is_a_noop() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = handler(store.clone());
        let user_id = Uuid::new_v4();
        let envelope = checkout_event("evt_dup", user_id, "5-pack");

        let first = handler.handle_event(envelope.clone()).await.unwrap();
        assert_eq!(first, WebhookOutcome::Processed);

        let second = handler.handle_event(envelope).await.unwrap();
        assert_eq!(second, WebhookOutcome::Duplicate);

        assert_eq!(
            store.all_entitlements().await.len(),
            1,
            "Exactly one ledger mutation"
        );
        assert_eq!(
            store.recorded_events().await.len(),
            1,
            "Exactly one processed-event row"
        );
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_delivery() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = Arc::new(handler(store.clone()));
        let user_id = Uuid::new_v4();
        let envelope = checkout_event("evt_race", user_id, "single");

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for _ in 0..2 {
            let handler = Arc::clone(&handler);
            let barrier = Arc::clone(&barrier);
            let envelope = envelope.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                handler.handle_event(envelope).await.unwrap()
            }));
        }

        let mut outcomes = vec![];
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == WebhookOutcome::Processed)
                .count(),
            1,
            "Exactly one worker claims the event"
        );
        assert_eq!(store.all_entitlements().await.len(), 1);
        assert_eq!(store.recorded_events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_checkout_grants_the_purchased_plan() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = handler(store.clone());
        let user_id = Uuid::new_v4();
        // Notification path runs (and is a no-op with email disabled)
        store.seed_email(user_id, "driver@example.com").await;

        handler
            .handle_event(checkout_event("evt_20", user_id, "20-pack"))
            .await
            .unwrap();

        let rows = store.list_active(user_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, EntitlementKind::Credits);
        assert_eq!(rows[0].credits_remaining, 20);
        assert_eq!(rows[0].plan_name, Plan::TwentyPack);
        assert!(rows[0].expires_at.is_none());
    }

    #[tokio::test]
    async fn test_checkout_with_missing_metadata_mutates_nothing() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = handler(store.clone());

        let payload = r#"{
            "id": "evt_nometa",
            "type": "checkout.session.completed",
            "data": { "object": { "id": "cs_x", "metadata": {} } }
        }"#;
        let outcome = handler
            .handle_event(EventEnvelope::parse(payload).unwrap())
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Processed);
        assert!(store.all_entitlements().await.is_empty());
        let events = store.recorded_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, "error");
    }

    #[tokio::test]
    async fn test_unknown_event_is_acknowledged_without_side_effects() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = handler(store.clone());

        let payload = r#"{
            "id": "evt_unknown",
            "type": "invoice.upcoming",
            "data": { "object": { "id": "in_1" } }
        }"#;
        let outcome = handler
            .handle_event(EventEnvelope::parse(payload).unwrap())
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Processed);
        assert!(store.all_entitlements().await.is_empty());
        assert!(store.recorded_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_payment_intent_events_only_log() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = handler(store.clone());

        let payload = r#"{
            "id": "evt_pi_fail",
            "type": "payment_intent.payment_failed",
            "data": {
                "object": {
                    "id": "pi_9",
                    "amount": 499,
                    "currency": "usd",
                    "last_payment_error": { "message": "card_declined" }
                }
            }
        }"#;
        handler
            .handle_event(EventEnvelope::parse(payload).unwrap())
            .await
            .unwrap();

        assert!(store.all_entitlements().await.is_empty());
        let events = store.recorded_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, "failed");
    }
}

// =============================================================================
// Subscription lifecycle
// =============================================================================
mod subscription_tests {
    use super::*;

    const PERIOD_1: i64 = 4102444800; // 2100-01-01, comfortably in the future
    const PERIOD_2: i64 = 4105123200; // one month later

    #[tokio::test]
    async fn test_activation_creates_then_renewal_extends() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = handler(store.clone());
        let user_id = Uuid::new_v4();

        handler
            .handle_event(subscription_event(
                "evt_sub_1",
                "customer.subscription.created",
                "sub_42",
                user_id,
                "active",
                PERIOD_1,
            ))
            .await
            .unwrap();

        let rows = store.list_active(user_id).await.unwrap();
        assert_eq!(rows.len(), 1, "Activation inserts one row");
        assert_eq!(rows[0].kind, EntitlementKind::Subscription);
        assert_eq!(
            rows[0].expires_at.unwrap().unix_timestamp(),
            PERIOD_1,
            "Expiry comes from the event's period end"
        );

        handler
            .handle_event(subscription_event(
                "evt_sub_2",
                "customer.subscription.updated",
                "sub_42",
                user_id,
                "active",
                PERIOD_2,
            ))
            .await
            .unwrap();

        let rows = store.list_active(user_id).await.unwrap();
        assert_eq!(rows.len(), 1, "Renewal updates in place, never duplicates");
        assert_eq!(rows[0].expires_at.unwrap().unix_timestamp(), PERIOD_2);
        assert_eq!(store.recorded_events().await.len(), 2);
    }

    #[tokio::test]
    async fn test_non_active_status_leaves_ledger_unchanged() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = handler(store.clone());
        let user_id = Uuid::new_v4();

        handler
            .handle_event(subscription_event(
                "evt_sub_pastdue",
                "customer.subscription.updated",
                "sub_43",
                user_id,
                "past_due",
                PERIOD_1,
            ))
            .await
            .unwrap();

        assert!(store.all_entitlements().await.is_empty());
        assert_eq!(store.recorded_events().await.len(), 1, "Still logged");
    }

    #[tokio::test]
    async fn test_cancellation_deactivates_the_row() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = handler(store.clone());
        let user_id = Uuid::new_v4();

        handler
            .handle_event(subscription_event(
                "evt_sub_a",
                "customer.subscription.created",
                "sub_44",
                user_id,
                "active",
                PERIOD_1,
            ))
            .await
            .unwrap();
        handler
            .handle_event(subscription_event(
                "evt_sub_b",
                "customer.subscription.deleted",
                "sub_44",
                user_id,
                "canceled",
                PERIOD_1,
            ))
            .await
            .unwrap();

        assert!(
            store.list_active(user_id).await.unwrap().is_empty(),
            "No active rows remain"
        );
        let all = store.all_entitlements().await;
        assert_eq!(all.len(), 1, "The row is deactivated, not deleted");
        assert!(!all[0].is_active);
    }

    #[tokio::test]
    async fn test_renewal_after_cancellation_recreates_access() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = handler(store.clone());
        let user_id = Uuid::new_v4();

        handler
            .handle_event(subscription_event(
                "evt_c1",
                "customer.subscription.deleted",
                "sub_45",
                user_id,
                "canceled",
                PERIOD_1,
            ))
            .await
            .unwrap();

        // A later activation for the same ref finds no active row and inserts
        handler
            .handle_event(subscription_event(
                "evt_c2",
                "customer.subscription.updated",
                "sub_45",
                user_id,
                "active",
                PERIOD_2,
            ))
            .await
            .unwrap();

        let rows = store.list_active(user_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].expires_at.unwrap().unix_timestamp(), PERIOD_2);
    }

    #[tokio::test]
    async fn test_checkout_then_activation_do_not_double_grant() {
        let store = Arc::new(MemoryBillingStore::new());
        let handler = handler(store.clone());
        let user_id = Uuid::new_v4();

        // checkout.session.completed for the monthly plan carries the
        // subscription ref, then the activation event arrives for it.
        let payload = format!(
            r#"{{
                "id": "evt_m1",
                "type": "checkout.session.completed",
                "data": {{
                    "object": {{
                        "id": "cs_m1",
                        "mode": "subscription",
                        "amount_total": 3999,
                        "currency": "usd",
                        "customer": "cus_1",
                        "subscription": "sub_46",
                        "metadata": {{
                            "user_id": "{user_id}",
                            "plan_name": "monthly"
                        }}
                    }}
                }}
            }}"#
        );
        handler
            .handle_event(EventEnvelope::parse(&payload).unwrap())
            .await
            .unwrap();
        handler
            .handle_event(subscription_event(
                "evt_m2",
                "customer.subscription.created",
                "sub_46",
                user_id,
                "active",
                PERIOD_1,
            ))
            .await
            .unwrap();

        let rows = store.list_active(user_id).await.unwrap();
        assert_eq!(rows.len(), 1, "One subscription row despite two events");
        assert_eq!(rows[0].expires_at.unwrap().unix_timestamp(), PERIOD_1);
    }
}

// =============================================================================
// Ledger invariants
// =============================================================================
mod ledger_tests {
    use super::*;

    #[tokio::test]
    async fn test_second_active_row_for_same_subscription_conflicts() {
        let store = MemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        let mut new = NewEntitlement::from_plan(
            user_id,
            Plan::Monthly,
            now,
            None,
            Some("sub_unique".to_string()),
        );
        new.expires_at = Some(now + time::Duration::days(30));

        store.insert_entitlement(new.clone()).await.unwrap();
        let err = store.insert_entitlement(new).await.unwrap_err();
        assert!(matches!(err, crate::error::BillingError::Conflict(_)));
    }
}
