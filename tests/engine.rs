use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};

use storefront_rewards::errors::{ConflictKind, EngineError, PreconditionKind};
use storefront_rewards::models::{
    claims::{ClaimStatus, NewClaimDetails},
    memberships::{ClaimFlag, MembershipStatus, ReferredUser, RewardType},
    orders::{CartItem, CustomerSnapshot, OrderStatus, PaymentStatus, ShippingPolicy},
    plans::{Plan, PlanCatalog},
    requests::{Identity, NewMembershipRequest},
};
use storefront_rewards::repositories::{LocalStore, Store};
use storefront_rewards::services::{
    claims::ClaimRequestHandler, enrollment::EnrollmentRequestHandler,
    orders::OrderRequestHandler, referrals::ReferralRequestHandler,
};

struct Engine {
    store: Arc<dyn Store>,
    enrollment: EnrollmentRequestHandler,
    referrals: ReferralRequestHandler,
    claims: ClaimRequestHandler,
    orders: OrderRequestHandler,
}

fn plan(cashback_goal: u32, gold_goal: u32, cashback_enabled: bool, gold_enabled: bool) -> Plan {
    Plan {
        id: "gold".to_string(),
        name: "Gold".to_string(),
        price_in_cents: 49900,
        cashback_goal,
        gold_goal,
        cashback_enabled,
        gold_enabled,
        cashback_amount_in_cents: 49900,
        gold_coin_grams: 1.0,
    }
}

fn engine_with(plan: Plan) -> Engine {
    let store: Arc<dyn Store> = Arc::new(LocalStore::in_memory());
    let catalog = Arc::new(PlanCatalog::new(vec![plan]).unwrap());

    Engine {
        enrollment: EnrollmentRequestHandler::new(store.clone(), catalog, 8),
        referrals: ReferralRequestHandler::new(store.clone()),
        claims: ClaimRequestHandler::new(store.clone()),
        orders: OrderRequestHandler::new(
            store.clone(),
            ShippingPolicy {
                flat_charge_in_cents: 99_00,
                free_shipping_threshold_in_cents: 2000_00,
            },
        ),
        store,
    }
}

fn engine() -> Engine {
    engine_with(plan(5, 7, true, true))
}

fn request(email: &str) -> NewMembershipRequest {
    NewMembershipRequest {
        identity: Identity {
            name: "Ravi Kumar".to_string(),
            email: email.to_string(),
            mobile: Some("+91 98200 00000".to_string()),
        },
        plan_id: "gold".to_string(),
        screenshot_url: "https://proofs.example.com/ravi.png".to_string(),
        referral_code: None,
    }
}

fn friend(i: u32) -> ReferredUser {
    ReferredUser {
        name: format!("Friend {}", i),
        email: Some(format!("friend{}@example.com", i)),
        mobile: None,
    }
}

fn details(reward: RewardType) -> NewClaimDetails {
    let details = NewClaimDetails {
        address: "12 MG Road, Pune".to_string(),
        postal_code: "411001".to_string(),
        ..Default::default()
    };
    match reward {
        RewardType::Gold => details,
        RewardType::Cashback => NewClaimDetails {
            upi_id: Some("ravi@upi".to_string()),
            ..details
        },
    }
}

fn customer() -> CustomerSnapshot {
    CustomerSnapshot {
        name: "Asha".to_string(),
        email: "asha@example.com".to_string(),
        mobile: None,
        address: "4 Park Street".to_string(),
        city: Some("Kolkata".to_string()),
        postal_code: "700016".to_string(),
    }
}

fn cart(unit_price_in_cents: i64, quantity: u32) -> Vec<CartItem> {
    vec![CartItem {
        product_id: "ring-01".to_string(),
        name: "Silver ring".to_string(),
        unit_price_in_cents,
        quantity,
    }]
}

async fn active_member(engine: &Engine, email: &str) -> String {
    let request = engine.enrollment.submit(request(email)).await.unwrap();
    engine.enrollment.approve(&request.id).await.unwrap().referral_code
}

#[tokio::test]
async fn both_rewards_settle_the_membership() {
    let engine = engine();
    let code = active_member(&engine, "ravi@example.com").await;

    for i in 0..5 {
        engine.referrals.apply_referral(&code, friend(i)).await.unwrap();
    }
    let claim = engine
        .claims
        .submit_claim("ravi@example.com", RewardType::Cashback, details(RewardType::Cashback))
        .await
        .unwrap();
    let (_, membership) = engine
        .claims
        .update_claim_status(&claim.id, ClaimStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(membership.money_back_claimed, ClaimFlag::Claimed);
    assert_eq!(membership.status, MembershipStatus::Active);

    for i in 5..7 {
        engine.referrals.apply_referral(&code, friend(i)).await.unwrap();
    }
    let claim = engine
        .claims
        .submit_claim("ravi@example.com", RewardType::Gold, details(RewardType::Gold))
        .await
        .unwrap();
    let (_, membership) = engine
        .claims
        .update_claim_status(&claim.id, ClaimStatus::Completed, None)
        .await
        .unwrap();

    assert_eq!(membership.gold_coin_claimed, ClaimFlag::Claimed);
    assert_eq!(membership.status, MembershipStatus::Completed);
    assert!(membership.completed_at.is_some());
    assert_eq!(membership.referral_count, 7);
}

#[tokio::test]
async fn completed_membership_stops_counting() {
    let engine = engine_with(plan(1, 1, true, false));
    let code = active_member(&engine, "ravi@example.com").await;
    engine.referrals.apply_referral(&code, friend(0)).await.unwrap();
    let claim = engine
        .claims
        .submit_claim("ravi@example.com", RewardType::Cashback, details(RewardType::Cashback))
        .await
        .unwrap();
    engine
        .claims
        .update_claim_status(&claim.id, ClaimStatus::Completed, None)
        .await
        .unwrap();

    let err = engine.referrals.apply_referral(&code, friend(1)).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::PreconditionFailed(PreconditionKind::InactiveCode(_))
    ));
    let membership = engine.referrals.get_membership(&code).await.unwrap();
    assert_eq!(membership.status, MembershipStatus::Completed);
    assert_eq!(membership.referral_count, 1);
    assert_eq!(membership.referrals.len(), 1);
}

#[tokio::test]
async fn a_second_pending_request_is_a_conflict() {
    let engine = engine();
    engine.enrollment.submit(request("ravi@example.com")).await.unwrap();

    let err = engine
        .enrollment
        .submit(request(" RAVI@example.com "))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Conflict(ConflictKind::DuplicatePendingRequest(_))
    ));
}

#[tokio::test]
async fn approving_twice_creates_one_membership() {
    let engine = engine();
    let request = engine.enrollment.submit(request("ravi@example.com")).await.unwrap();

    engine.enrollment.approve(&request.id).await.unwrap();
    let err = engine.enrollment.approve(&request.id).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::Conflict(ConflictKind::AlreadyDecided(_))
    ));
    assert_eq!(engine.referrals.list_memberships().await.unwrap().len(), 1);
}

#[tokio::test]
async fn one_active_membership_per_email_until_completion() {
    let engine = engine_with(plan(1, 1, true, false));
    let first = active_member(&engine, "ravi@example.com").await;

    let second = engine.enrollment.submit(request("ravi@example.com")).await.unwrap();
    let err = engine.enrollment.approve(&second.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Conflict(ConflictKind::ActiveMembershipExists(_))
    ));
    assert!(engine.enrollment.get(&second.id).await.unwrap().is_pending());
    assert_eq!(
        engine
            .referrals
            .list_memberships_for_email("ravi@example.com")
            .await
            .unwrap()
            .len(),
        1
    );

    engine.referrals.apply_referral(&first, friend(0)).await.unwrap();
    let claim = engine
        .claims
        .submit_claim("ravi@example.com", RewardType::Cashback, details(RewardType::Cashback))
        .await
        .unwrap();
    let (_, completed) = engine
        .claims
        .update_claim_status(&claim.id, ClaimStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(completed.status, MembershipStatus::Completed);

    let renewed = engine.enrollment.approve(&second.id).await.unwrap();
    assert_ne!(renewed.referral_code, first);
    assert_eq!(renewed.status, MembershipStatus::Active);
    assert_eq!(renewed.referral_count, 0);

    let current = engine
        .referrals
        .get_membership_by_email("ravi@example.com")
        .await
        .unwrap();
    assert_eq!(current.referral_code, renewed.referral_code);

    let mut codes: Vec<String> = engine
        .referrals
        .list_memberships_for_email("ravi@example.com")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.referral_code)
        .collect();
    codes.sort();
    let mut expected = vec![first, renewed.referral_code];
    expected.sort();
    assert_eq!(codes, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_approvals_create_one_membership() {
    let engine = Arc::new(engine());
    let request = engine.enrollment.submit(request("ravi@example.com")).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let id = request.id.clone();
            tokio::spawn(async move { engine.enrollment.approve(&id).await })
        })
        .collect();
    let results = futures_util::future::join_all(tasks).await;

    let approved = results
        .into_iter()
        .filter(|result| matches!(result, Ok(Ok(_))))
        .count();
    assert_eq!(approved, 1);
    assert_eq!(engine.store.list_memberships().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_referrals_are_all_counted() {
    let engine = Arc::new(engine_with(plan(100, 200, true, true)));
    let code = active_member(&engine, "ravi@example.com").await;

    let tasks: Vec<_> = (0..64)
        .map(|i| {
            let engine = engine.clone();
            let code = code.clone();
            tokio::spawn(async move { engine.referrals.apply_referral(&code, friend(i)).await })
        })
        .collect();
    for result in futures_util::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let membership = engine.referrals.get_membership(&code).await.unwrap();
    assert_eq!(membership.referral_count, 64);
    assert_eq!(membership.referrals.len(), 64);
}

#[tokio::test]
async fn unknown_code_changes_nothing() {
    let engine = engine();
    let code = active_member(&engine, "ravi@example.com").await;

    let err = engine
        .referrals
        .apply_referral("ZZZ9999", friend(0))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::PreconditionFailed(PreconditionKind::UnknownCode(_))
    ));
    let membership = engine.referrals.get_membership(&code).await.unwrap();
    assert_eq!(membership.referral_count, 0);
}

#[tokio::test]
async fn shipping_is_waived_at_the_threshold() {
    let engine = engine();

    let below = engine.orders.create_order(cart(900_00, 2), customer()).await.unwrap();
    assert_eq!(below.subtotal_in_cents, 1800_00);
    assert_eq!(below.shipping_in_cents, 99_00);
    assert_eq!(below.total_in_cents, 1899_00);

    let at = engine.orders.create_order(cart(1000_00, 2), customer()).await.unwrap();
    assert_eq!(at.shipping_in_cents, 0);
    assert_eq!(at.total_in_cents, 2000_00);
}

#[tokio::test]
async fn empty_cart_is_rejected() {
    let err = engine()
        .orders
        .create_order(Vec::new(), customer())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn random_claim_sequences_keep_completion_consistent() {
    for seed in 0..24u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let cashback_enabled = rng.gen_bool(0.8);
        let gold_enabled = !cashback_enabled || rng.gen_bool(0.8);
        let engine = engine_with(plan(
            rng.gen_range(1..5),
            rng.gen_range(1..7),
            cashback_enabled,
            gold_enabled,
        ));
        let code = active_member(&engine, "ravi@example.com").await;
        let mut next_friend = 0;

        for _ in 0..40 {
            match rng.gen_range(0..3) {
                0 => {
                    let _ = engine.referrals.apply_referral(&code, friend(next_friend)).await;
                    next_friend += 1;
                }
                1 => {
                    let reward = if rng.gen_bool(0.5) {
                        RewardType::Cashback
                    } else {
                        RewardType::Gold
                    };
                    let before = engine.referrals.get_membership(&code).await.unwrap();
                    let result = engine
                        .claims
                        .submit_claim("ravi@example.com", reward, details(reward))
                        .await;

                    let open = matches!(before.flag(reward), ClaimFlag::NotClaimed | ClaimFlag::Rejected);
                    if before.is_active() && before.is_enabled(reward) && open {
                        assert_eq!(
                            result.is_ok(),
                            before.referral_count >= before.goal(reward),
                            "seed {}: claim acceptance must follow the goal",
                            seed
                        );
                    } else {
                        assert!(result.is_err(), "seed {}: claim should be refused", seed);
                    }
                }
                _ => {
                    let claims = engine.claims.list(None).await.unwrap();
                    if claims.is_empty() {
                        continue;
                    }
                    let claim = &claims[rng.gen_range(0..claims.len())];
                    let status = match rng.gen_range(0..4) {
                        0 => ClaimStatus::Pending,
                        1 => ClaimStatus::InProgress,
                        2 => ClaimStatus::Completed,
                        _ => ClaimStatus::Rejected,
                    };
                    let _ = engine.claims.update_claim_status(&claim.id, status, None).await;
                }
            }

            let membership = engine.referrals.get_membership(&code).await.unwrap();
            if membership.status == MembershipStatus::Completed {
                assert!(
                    RewardType::ALL
                        .iter()
                        .filter(|reward| membership.is_enabled(**reward))
                        .all(|reward| membership.flag(*reward) == ClaimFlag::Claimed),
                    "seed {}: completed membership with an unpaid reward",
                    seed
                );
                assert!(membership.completed_at.is_some());
            }
        }
    }
}

#[tokio::test]
async fn random_order_updates_keep_totals_and_grow_history() {
    let order_statuses = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ];
    let payment_statuses = [
        PaymentStatus::Pending,
        PaymentStatus::Verified,
        PaymentStatus::Rejected,
    ];

    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let engine = engine();
        let order = engine
            .orders
            .create_order(cart(rng.gen_range(1..3000_00), rng.gen_range(1..4)), customer())
            .await
            .unwrap();
        assert_eq!(order.status_history.len(), 1);

        let mut previous = order.clone();
        for _ in 0..20 {
            let updated = if rng.gen_bool(0.5) {
                let status = order_statuses[rng.gen_range(0..order_statuses.len())];
                engine
                    .orders
                    .update_status(&order.order_id, status, None)
                    .await
                    .unwrap()
            } else {
                let status = payment_statuses[rng.gen_range(0..payment_statuses.len())];
                engine
                    .orders
                    .update_payment_status(&order.order_id, status, None)
                    .await
                    .unwrap()
            };

            assert_eq!(updated.total_in_cents, order.total_in_cents);
            assert_eq!(updated.subtotal_in_cents, order.subtotal_in_cents);
            assert_eq!(updated.status_history.len(), previous.status_history.len() + 1);
            assert!(updated.updated_at > previous.updated_at);
            previous = updated;
        }
    }
}
