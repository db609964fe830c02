mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use escrow_custody::error::EscrowError;
use escrow_custody::escrow::{EngineSettings, EscrowStatus, EscrowVariant, MilestoneStatus};
use escrow_custody::resilience::RetryPolicy;

#[tokio::test]
async fn test_simple_escrow_release_pays_seller() {
    let h = Harness::new();
    let created = h.engine.create(simple_escrow("1.5"), &buyer()).await.unwrap();
    assert_eq!(created.status, EscrowStatus::Pending);
    assert_eq!(created.amount.currency, "ETH");
    assert_ne!(created.custody_address, addr(BUYER));

    h.chain.set_balance(created.custody_address, wei("1.5"));
    let funded = h.engine.mark_funded(created.id, "0xabc", &buyer()).await.unwrap();
    assert_eq!(funded.status, EscrowStatus::Funded);
    assert_eq!(funded.funding_tx_hash.as_deref(), Some("0xabc"));

    let released = h.engine.release(created.id, &buyer()).await.unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
    assert!(released.released_at.is_some());

    // Full balance minus the network fee goes to the seller.
    assert_eq!(h.chain.balance(addr(SELLER)), wei("1.5") - fee());
    assert_eq!(h.chain.balance(created.custody_address), alloy::primitives::U256::ZERO);

    let actions = h.actions(created.id).await;
    for expected in ["wallet_created", "escrow_funded", "key_decrypted", "funds_released"] {
        assert!(actions.iter().any(|a| a == expected), "missing {expected} in {actions:?}");
    }
}

#[tokio::test]
async fn test_release_requires_buyer() {
    let h = Harness::new();
    let id = h.funded(simple_escrow("1.0"), "1.0").await;

    let err = h.engine.release(id, &seller()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Forbidden(_)));
    let err = h.engine.release(id, &stranger()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Forbidden(_)));
    assert_eq!(h.chain.broadcasts(), 0);
}

#[tokio::test]
async fn test_release_of_pending_escrow_is_rejected() {
    let h = Harness::new();
    let view = h.engine.create(simple_escrow("1.0"), &buyer()).await.unwrap();
    let err = h.engine.release(view.id, &buyer()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
}

#[tokio::test]
async fn test_only_buyer_marks_funded() {
    let h = Harness::new();
    let view = h.engine.create(simple_escrow("1.0"), &buyer()).await.unwrap();

    let err = h.engine.mark_funded(view.id, "0xabc", &seller()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Forbidden(_)));
    let err = h.engine.mark_funded(view.id, "   ", &buyer()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
}

#[tokio::test]
async fn test_milestone_escrow_releases_in_parts() {
    let h = Harness::new();
    // Deposit is exactly the agreed total; transfer fees come out of it.
    let id = h.funded(milestone_escrow("2.0", &["0.8", "1.2"]), "2.0").await;

    let details = h.engine.get(id).await.unwrap();
    assert_eq!(details.escrow.variant, EscrowVariant::Milestone);
    assert_eq!(details.milestones.len(), 2);
    let first = details.milestones[0].clone();
    let second = details.milestones[1].clone();
    assert_eq!(first.amount, dec("0.8"));

    let err = h.engine.complete_milestone(first.id, &buyer()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Forbidden(_)));
    let completed = h.engine.complete_milestone(first.id, &seller()).await.unwrap();
    assert_eq!(completed.status, MilestoneStatus::Completed);

    let err = h.engine.release_milestone(first.id, &seller()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Forbidden(_)));

    let released = h.engine.release_milestone(first.id, &buyer()).await.unwrap();
    assert_eq!(released.milestone.status, MilestoneStatus::Released);
    assert_eq!(released.escrow.status, EscrowStatus::Funded);
    assert_eq!(h.chain.balance(addr(SELLER)), wei("0.8"));

    let err = h.engine.release_milestone(first.id, &buyer()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));

    let last = h.engine.release_milestone(second.id, &buyer()).await.unwrap();
    assert_eq!(last.escrow.status, EscrowStatus::Released);
    assert_eq!(last.milestone.status, MilestoneStatus::Released);
    // The final milestone takes what is left after both fees.
    assert_eq!(h.chain.balance(addr(SELLER)), wei("2.0") - fee() - fee());
    assert_eq!(h.chain.balance(released.escrow.custody_address), alloy::primitives::U256::ZERO);

    let actions = h.actions(id).await;
    assert_eq!(actions.iter().filter(|a| *a == "milestone_released").count(), 2);
    assert!(actions.iter().any(|a| a == "milestone_completed"));
}

#[tokio::test]
async fn test_milestone_escrow_cannot_be_released_whole() {
    let h = Harness::new();
    let id = h.funded(milestone_escrow("1.0", &["0.5", "0.5"]), "1.0").await;
    let err = h.engine.release(id, &buyer()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
}

#[tokio::test]
async fn test_create_validation() {
    let h = Harness::new();
    let cases = vec![
        ("milestone sum mismatch", milestone_escrow("2.0", &["0.8", "1.0"])),
        ("no milestones", milestone_escrow("2.0", &[])),
        ("zero amount", simple_escrow("0")),
        ("negative amount", simple_escrow("-1")),
        ("too many decimals", simple_escrow("0.0000000000000000001")),
        ("same parties", {
            let mut input = simple_escrow("1.0");
            input.seller = BUYER.to_string();
            input
        }),
        ("bad address", {
            let mut input = simple_escrow("1.0");
            input.buyer = "not-an-address".to_string();
            input
        }),
        ("wrong currency", {
            let mut input = simple_escrow("1.0");
            input.currency = "BTC".to_string();
            input
        }),
        ("empty title", {
            let mut input = simple_escrow("1.0");
            input.title = "  ".to_string();
            input
        }),
        ("time lock without date", {
            let mut input = simple_escrow("1.0");
            input.variant = EscrowVariant::TimeLocked;
            input
        }),
        ("milestones on simple escrow", {
            let mut input = milestone_escrow("1.0", &["1.0"]);
            input.variant = EscrowVariant::Simple;
            input
        }),
    ];

    for (name, input) in cases {
        let err = h.engine.create(input, &buyer()).await.unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)), "{name}: {err:?}");
    }
    assert!(h.engine.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_milestone_sum_within_tolerance_is_accepted() {
    let h = Harness::new();
    let view = h
        .engine
        .create(milestone_escrow("1.0", &["0.333", "0.333", "0.333"]), &buyer())
        .await
        .unwrap();
    assert_eq!(view.status, EscrowStatus::Pending);
}

#[tokio::test]
async fn test_auto_release_after_release_date() {
    let h = Harness::new();
    let mut input = simple_escrow("1.0");
    input.variant = EscrowVariant::TimeLocked;
    input.release_date = Some(Utc::now() + ChronoDuration::hours(1));
    input.auto_release = true;
    let id = h.funded(input, "1.0").await;

    assert_eq!(h.engine.auto_release(Utc::now()).await.unwrap(), 0);
    assert_eq!(h.engine.find(id).await.unwrap().status, EscrowStatus::Funded);

    let later = Utc::now() + ChronoDuration::hours(2);
    assert_eq!(h.engine.auto_release(later).await.unwrap(), 1);
    assert_eq!(h.engine.find(id).await.unwrap().status, EscrowStatus::Released);
    assert_eq!(h.chain.balance(addr(SELLER)), wei("1.0") - fee());
}

#[tokio::test]
async fn test_auto_release_skips_escrows_without_flag() {
    let h = Harness::new();
    let mut input = simple_escrow("1.0");
    input.variant = EscrowVariant::TimeLocked;
    input.release_date = Some(Utc::now() - ChronoDuration::hours(1));
    input.auto_release = false;
    let id = h.funded(input, "1.0").await;

    assert_eq!(h.engine.auto_release(Utc::now()).await.unwrap(), 0);
    assert_eq!(h.engine.find(id).await.unwrap().status, EscrowStatus::Funded);
}

#[tokio::test]
async fn test_detect_funding_from_custody_balance() {
    let h = Harness::new();
    let short = h.engine.create(simple_escrow("1.0"), &buyer()).await.unwrap();
    let full = h.engine.create(simple_escrow("1.0"), &buyer()).await.unwrap();
    h.chain.set_balance(short.custody_address, wei("0.5"));
    h.chain.set_balance(full.custody_address, wei("1.0"));

    assert_eq!(h.engine.detect_funding().await.unwrap(), 1);
    assert_eq!(h.engine.find(short.id).await.unwrap().status, EscrowStatus::Pending);
    assert_eq!(h.engine.find(full.id).await.unwrap().status, EscrowStatus::Funded);
    assert!(h.actions(full.id).await.iter().any(|a| a == "auto_funded"));
}

#[tokio::test]
async fn test_expire_unfunded_escrows() {
    let settings = EngineSettings {
        funding_timeout: Some(ChronoDuration::hours(24)),
        ..EngineSettings::default()
    };
    let h = Harness::with(settings, RetryPolicy::immediate(3));
    let view = h.engine.create(simple_escrow("1.0"), &buyer()).await.unwrap();

    assert_eq!(h.engine.expire(Utc::now()).await.unwrap(), 0);
    assert_eq!(h.engine.expire(Utc::now() + ChronoDuration::hours(25)).await.unwrap(), 1);
    assert_eq!(h.engine.find(view.id).await.unwrap().status, EscrowStatus::Expired);

    let err = h.engine.mark_funded(view.id, "0xabc", &buyer()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
}

#[tokio::test]
async fn test_cancel_pending_moves_no_funds() {
    let h = Harness::new();
    let view = h.engine.create(simple_escrow("1.0"), &buyer()).await.unwrap();

    let err = h.engine.cancel(view.id, &stranger()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Forbidden(_)));

    let cancelled = h.engine.cancel(view.id, &seller()).await.unwrap();
    assert_eq!(cancelled.status, EscrowStatus::Cancelled);
    assert_eq!(h.chain.broadcasts(), 0);

    let err = h.engine.cancel(view.id, &buyer()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
}

#[tokio::test]
async fn test_cancel_funded_refunds_buyer() {
    let h = Harness::new();
    let id = h.funded(simple_escrow("1.0"), "1.0").await;

    let err = h.engine.cancel(id, &buyer()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Forbidden(_)));

    let cancelled = h.engine.cancel(id, &seller()).await.unwrap();
    assert_eq!(cancelled.status, EscrowStatus::Cancelled);
    assert_eq!(h.chain.balance(addr(BUYER)), wei("1.0") - fee());
    assert_eq!(h.chain.balance(addr(SELLER)), alloy::primitives::U256::ZERO);

    let actions = h.actions(id).await;
    assert!(actions.iter().any(|a| a == "funds_refunded"));
    assert!(actions.iter().any(|a| a == "escrow_cancelled"));
}

#[tokio::test]
async fn test_dispute_freezes_escrow() {
    let h = Harness::new();
    let id = h.funded(simple_escrow("1.0"), "1.0").await;

    let err = h.engine.open_dispute(id, "late delivery", &stranger()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Forbidden(_)));
    let err = h.engine.open_dispute(id, "  ", &buyer()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));

    let disputed = h.engine.open_dispute(id, "late delivery", &buyer()).await.unwrap();
    assert_eq!(disputed.status, EscrowStatus::Disputed);
    assert_eq!(disputed.dispute_reason.as_deref(), Some("late delivery"));

    let err = h.engine.release(id, &buyer()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
    let err = h.engine.cancel(id, &seller()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
    assert_eq!(h.chain.broadcasts(), 0);
}

#[tokio::test]
async fn test_check_balance_reports_shortfall() {
    let h = Harness::new();
    let id = h.funded(simple_escrow("1.0"), "0.4").await;

    let err = h.engine.check_balance(id, &stranger()).await.unwrap_err();
    assert!(matches!(err, EscrowError::Forbidden(_)));

    let report = h.engine.check_balance(id, &seller()).await.unwrap();
    assert_eq!(report.balance, dec("0.4"));
    assert_eq!(report.required, dec("1.0"));
    assert!(!report.sufficient);
    assert!(h.actions(id).await.iter().any(|a| a == "balance_checked"));
}

#[tokio::test]
async fn test_get_unknown_escrow_is_not_found() {
    let h = Harness::new();
    let err = h.engine.get(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EscrowError::NotFound(_)));
}

#[tokio::test]
async fn test_custody_key_is_never_exposed() {
    let h = Harness::new();
    let view = h.engine.create(simple_escrow("1.0"), &buyer()).await.unwrap();
    let json = serde_json::to_value(h.engine.get(view.id).await.unwrap()).unwrap();
    assert!(json["escrow"].get("encrypted_key").is_none());
    assert!(!json.to_string().contains("encrypted_key"));
}
