mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use common::Harness;
use payment_orchestrator::models::events::{EventPayload, TRANSACTION_COMPLETED};
use payment_orchestrator::models::money_drops::{MoneyDropStatus, NewMoneyDrop};
use payment_orchestrator::models::transactions::TransactionType;
use payment_orchestrator::repositories::LedgerStore;
use payment_orchestrator::services::money_drops::{self, MoneyDropRequestHandler};
use payment_orchestrator::services::scheduler::Scheduler;
use payment_orchestrator::services::ServiceError;

fn handler(h: &Harness) -> MoneyDropRequestHandler {
    MoneyDropRequestHandler::new(h.deps.ledger.clone(), h.deps.bus.clone())
}

fn drop_of(amount_per_claim: i64, claims: i32, expires_in: Duration) -> NewMoneyDrop {
    NewMoneyDrop {
        amount_per_claim,
        total_claims_allowed: claims,
        expiry_timestamp: Utc::now() + expires_in,
    }
}

#[tokio::test]
async fn drop_completes_after_the_last_claim() {
    let h = Harness::new();
    let creator = h.funded_user("creator", 5_000).await;
    let handler = handler(&h);

    let drop = handler
        .create_drop(creator.id, drop_of(200, 5, Duration::hours(1)))
        .await
        .unwrap();
    assert_eq!(drop.total_amount, 1_000);
    assert_eq!(h.balance(creator.id).await, 4_000);

    for i in 0..3 {
        let claimant = h.user(&format!("claimant-{i}")).await;
        let receipt = handler.claim(drop.id, claimant.id).await.unwrap();
        assert_eq!(receipt.amount, 200);
        assert_eq!(h.balance(claimant.id).await, 200);
    }
    let after_three = h.ledger.get_money_drop(drop.id).await.unwrap();
    assert_eq!(after_three.claims_made_count, 3);
    assert_eq!(after_three.status, MoneyDropStatus::Active);

    for i in 3..5 {
        let claimant = h.user(&format!("claimant-{i}")).await;
        handler.claim(drop.id, claimant.id).await.unwrap();
    }
    let finished = h.ledger.get_money_drop(drop.id).await.unwrap();
    assert_eq!(finished.claims_made_count, 5);
    assert_eq!(finished.status, MoneyDropStatus::Completed);

    let late = h.user("late").await;
    let err = handler.claim(drop.id, late.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
    assert_eq!(h.balance(late.id).await, 0);

    let claims = h.ledger.money_drop_claims(drop.id).await.unwrap();
    assert_eq!(claims.len(), 5);
    let claim_transactions = h
        .ledger
        .transactions()
        .await
        .into_iter()
        .filter(|t| t.kind == TransactionType::MoneyDropClaim)
        .count();
    assert_eq!(claim_transactions, 5);
}

#[tokio::test]
async fn a_claimant_draws_only_once() {
    let h = Harness::new();
    let creator = h.funded_user("creator", 5_000).await;
    let claimant = h.user("claimant").await;
    let handler = handler(&h);
    let drop = handler
        .create_drop(creator.id, drop_of(100, 3, Duration::hours(1)))
        .await
        .unwrap();

    handler.claim(drop.id, claimant.id).await.unwrap();
    let err = handler.claim(drop.id, claimant.id).await.unwrap_err();

    assert!(matches!(err, ServiceError::Conflict(_)));
    assert_eq!(h.balance(claimant.id).await, 100);
    let drop = h.ledger.get_money_drop(drop.id).await.unwrap();
    assert_eq!(drop.claims_made_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_respect_the_cap() {
    let h = Harness::new();
    let creator = h.funded_user("creator", 10_000).await;
    let handler = Arc::new(handler(&h));
    let drop = handler
        .create_drop(creator.id, drop_of(200, 5, Duration::hours(1)))
        .await
        .unwrap();
    let total_before = h.ledger.total_balance().await;

    let mut claimants = Vec::new();
    for i in 0..25 {
        claimants.push(h.user(&format!("claimant-{i}")).await.id);
    }

    let drop_id = drop.id;
    let tasks: Vec<_> = claimants
        .iter()
        .copied()
        .map(|claimant_id| {
            let handler = handler.clone();
            tokio::spawn(async move { handler.claim(drop_id, claimant_id).await })
        })
        .collect();

    let mut won = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => won += 1,
            Err(ServiceError::Conflict(_)) => refused += 1,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    assert_eq!(won, 5);
    assert_eq!(refused, 20);

    let drop = h.ledger.get_money_drop(drop_id).await.unwrap();
    assert_eq!(drop.claims_made_count, 5);
    assert_eq!(drop.status, MoneyDropStatus::Completed);
    assert_eq!(drop.unclaimed_amount(), 0);

    let mut paid = 0;
    for claimant in &claimants {
        paid += h.balance(*claimant).await;
    }
    assert_eq!(paid, 1_000);
    assert_eq!(h.ledger.total_balance().await, total_before);
}

#[tokio::test]
async fn expiry_refunds_the_unclaimed_remainder() {
    let h = Harness::new();
    let creator = h.funded_user("creator", 1_000).await;
    let handler = handler(&h);
    let drop = handler
        .create_drop(creator.id, drop_of(200, 5, Duration::milliseconds(400)))
        .await
        .unwrap();

    for i in 0..3 {
        let claimant = h.user(&format!("claimant-{i}")).await;
        handler.claim(drop.id, claimant.id).await.unwrap();
    }
    assert_eq!(h.balance(creator.id).await, 0);

    tokio::time::sleep(StdDuration::from_millis(600)).await;

    let late = h.user("late").await;
    let err = handler.claim(drop.id, late.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    let refunds = money_drops::sweep_expired(h.deps.ledger.as_ref(), h.deps.bus.as_ref())
        .await
        .unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].refunded, 400);
    assert_eq!(h.balance(creator.id).await, 400);

    let expired = h.ledger.get_money_drop(drop.id).await.unwrap();
    assert_eq!(expired.status, MoneyDropStatus::Expired);
    assert_eq!(expired.claims_made_count, 3);

    // A second sweep finds nothing left to do.
    let again = money_drops::sweep_expired(h.deps.ledger.as_ref(), h.deps.bus.as_ref())
        .await
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(h.balance(creator.id).await, 400);
}

#[tokio::test]
async fn scheduler_tick_expires_due_drops() {
    let h = Harness::new();
    let creator = h.funded_user("creator", 1_000).await;
    let drop = handler(&h)
        .create_drop(creator.id, drop_of(250, 4, Duration::milliseconds(200)))
        .await
        .unwrap();

    tokio::time::sleep(StdDuration::from_millis(300)).await;

    let scheduler = Scheduler::new(
        h.deps.ledger.clone(),
        h.deps.bus.clone(),
        StdDuration::from_secs(60),
        Duration::days(30),
    );
    scheduler.tick().await;

    let drop = h.ledger.get_money_drop(drop.id).await.unwrap();
    assert_eq!(drop.status, MoneyDropStatus::Expired);
    assert_eq!(h.balance(creator.id).await, 1_000);
    let subscription = h.ledger.get_subscription(creator.id).await.unwrap();
    assert_eq!(subscription.period_transfers_used, 0);
}

#[tokio::test]
async fn invalid_drops_are_refused() {
    let h = Harness::new();
    let creator = h.funded_user("creator", 1_000).await;
    let handler = handler(&h);

    let zero_amount = handler
        .create_drop(creator.id, drop_of(0, 5, Duration::hours(1)))
        .await;
    let zero_claims = handler
        .create_drop(creator.id, drop_of(100, 0, Duration::hours(1)))
        .await;
    let past = handler
        .create_drop(creator.id, drop_of(100, 5, Duration::hours(-1)))
        .await;
    let unaffordable = handler
        .create_drop(creator.id, drop_of(500, 5, Duration::hours(1)))
        .await;

    assert!(matches!(zero_amount, Err(ServiceError::Validation(_))));
    assert!(matches!(zero_claims, Err(ServiceError::Validation(_))));
    assert!(matches!(past, Err(ServiceError::Validation(_))));
    assert!(matches!(unaffordable, Err(ServiceError::Validation(_))));
    assert_eq!(h.balance(creator.id).await, 1_000);
}

#[tokio::test]
async fn every_drop_movement_is_announced() {
    let h = Harness::new();
    let creator = h.funded_user("creator", 1_000).await;
    let claimant = h.user("claimant").await;
    let handler = handler(&h);
    let drop = handler
        .create_drop(creator.id, drop_of(300, 3, Duration::milliseconds(300)))
        .await
        .unwrap();
    let receipt = handler.claim(drop.id, claimant.id).await.unwrap();

    tokio::time::sleep(StdDuration::from_millis(400)).await;
    money_drops::sweep_expired(h.deps.ledger.as_ref(), h.deps.bus.as_ref())
        .await
        .unwrap();

    let kinds: Vec<_> = h
        .bus
        .published_of(TRANSACTION_COMPLETED)
        .await
        .into_iter()
        .map(|event| match event.payload {
            EventPayload::TransactionCompleted(completed) => (completed.kind, completed.amount),
            other => panic!("unexpected payload {other:?}"),
        })
        .collect();
    assert_eq!(
        kinds,
        [
            (TransactionType::MoneyDropFunding, 900),
            (TransactionType::MoneyDropClaim, 300),
            (TransactionType::MoneyDropRefund, 600),
        ]
    );
    let claimed = h.bus.published_of(TRANSACTION_COMPLETED).await;
    assert!(matches!(
        &claimed[1].payload,
        EventPayload::TransactionCompleted(e) if e.transaction_id == receipt.claim.transaction_id
    ));
}
