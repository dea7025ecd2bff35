use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    Authority, ClaimTransition, MembershipMutation, OrderMutation, Replica, Store,
};
use crate::errors::EngineError;
use crate::models::{
    claims::{ClaimStatus, RewardClaim},
    memberships::Membership,
    orders::Order,
    requests::{MembershipRequest, RequestStatus},
};

/// Routes operations to a primary store and mirrors every successful write
/// into a local fallback.
///
/// Backend selection is driven by a health check: a `StorageUnavailable`
/// from the primary flips the store into degraded mode until a ping succeeds
/// again. The failing call itself is not retried. While degraded, request
/// submissions, referrals and order writes go to the fallback, but approvals,
/// rejections and claim writes are refused: they gate rewards and must not be
/// decided on data the primary never sees. Admin-wide listings never read
/// the fallback.
pub struct MirroredStore<P, F> {
    primary: P,
    fallback: F,
    degraded: AtomicBool,
    last_probe: Mutex<Instant>,
    recheck_interval: Duration,
}

impl<P: Store, F: Replica> MirroredStore<P, F> {
    pub fn new(primary: P, fallback: F, recheck_interval: Duration) -> Self {
        Self {
            primary,
            fallback,
            degraded: AtomicBool::new(false),
            last_probe: Mutex::new(Instant::now()),
            recheck_interval,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn mark_degraded(&self, err: &EngineError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            log::error!("Primary store unavailable, switching to local fallback: {}", err);
        }
        if let Ok(mut last) = self.last_probe.lock() {
            *last = Instant::now();
        }
    }

    fn probe_due(&self) -> bool {
        match self.last_probe.lock() {
            Ok(mut last) if last.elapsed() >= self.recheck_interval => {
                *last = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Health check: re-probes the primary when degraded and due, and returns
    /// whether the primary should serve the next call.
    pub async fn check_health(&self) -> bool {
        if !self.is_degraded() {
            return true;
        }
        if !self.probe_due() {
            return false;
        }

        match self.primary.ping().await {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
                log::warn!("Primary store reachable again; local fallback data is not reconciled.");
                true
            }
            Err(e) => {
                log::debug!("Primary store still unavailable: {}", e);
                false
            }
        }
    }

    fn observe<T>(&self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e) = &result {
            if e.is_storage_unavailable() {
                self.mark_degraded(e);
            }
        }
        result
    }

    async fn mirror<Fut>(&self, what: &str, write: Fut)
    where
        Fut: Future<Output = Result<(), EngineError>>,
    {
        if let Err(e) = write.await {
            log::warn!("Failed to mirror {} into local fallback: {}", what, e);
        }
    }

    /// Single-record read: primary first, the fallback only when the primary is down.
    async fn read<T, PF, FF>(&self, primary: PF, fallback: FF) -> Result<T, EngineError>
    where
        PF: Future<Output = Result<T, EngineError>>,
        FF: Future<Output = Result<T, EngineError>>,
    {
        if self.check_health().await {
            match self.observe(primary.await) {
                Err(e) if e.is_storage_unavailable() => {}
                other => return other,
            }
        }
        log::warn!("Serving read from non-authoritative local fallback.");
        fallback.await
    }

    /// Gated write: primary only, refused while degraded.
    async fn write_primary<T, PF>(&self, what: &str, primary: PF) -> Result<T, EngineError>
    where
        PF: Future<Output = Result<T, EngineError>>,
    {
        if !self.check_health().await {
            log::warn!("Refusing {} while the primary store is unavailable.", what);
            return Err(EngineError::StorageUnavailable(format!(
                "{} requires the primary store",
                what
            )));
        }
        self.observe(primary.await)
    }

    /// Aggregate read: primary only.
    async fn read_primary<T, PF>(&self, primary: PF) -> Result<T, EngineError>
    where
        PF: Future<Output = Result<T, EngineError>>,
    {
        if !self.check_health().await {
            return Err(EngineError::StorageUnavailable(
                "listings are not served from the local fallback".to_string(),
            ));
        }
        self.observe(primary.await)
    }
}

#[async_trait]
impl<P: Store, F: Replica> Store for MirroredStore<P, F> {
    async fn ping(&self) -> Result<(), EngineError> {
        self.observe(self.primary.ping().await)
    }

    fn authority(&self) -> Authority {
        if self.is_degraded() {
            Authority::Fallback
        } else {
            self.primary.authority()
        }
    }

    async fn insert_request(
        &self,
        request: MembershipRequest,
    ) -> Result<MembershipRequest, EngineError> {
        if !self.check_health().await {
            return self.fallback.insert_request(request).await;
        }
        let request = self.observe(self.primary.insert_request(request).await)?;
        self.mirror("request", self.fallback.mirror_request(&request)).await;
        Ok(request)
    }

    async fn get_request(&self, id: &str) -> Result<Option<MembershipRequest>, EngineError> {
        self.read(self.primary.get_request(id), self.fallback.get_request(id))
            .await
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<MembershipRequest>, EngineError> {
        self.read_primary(self.primary.list_requests(status)).await
    }

    async fn reject_request(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<MembershipRequest, EngineError> {
        let request = self
            .write_primary("rejection", self.primary.reject_request(id, now))
            .await?;
        self.mirror("request", self.fallback.mirror_request(&request)).await;
        Ok(request)
    }

    async fn activate_membership(
        &self,
        request_id: &str,
        membership: Membership,
    ) -> Result<Membership, EngineError> {
        let membership = self
            .write_primary(
                "approval",
                self.primary.activate_membership(request_id, membership),
            )
            .await?;
        self.mirror("membership", self.fallback.mirror_membership(&membership))
            .await;
        if let Ok(Some(request)) = self.primary.get_request(request_id).await {
            self.mirror("request", self.fallback.mirror_request(&request)).await;
        }
        Ok(membership)
    }

    async fn referral_code_exists(&self, code: &str) -> Result<bool, EngineError> {
        self.read(
            self.primary.referral_code_exists(code),
            self.fallback.referral_code_exists(code),
        )
        .await
    }

    async fn get_membership(&self, code: &str) -> Result<Option<Membership>, EngineError> {
        self.read(
            self.primary.get_membership(code),
            self.fallback.get_membership(code),
        )
        .await
    }

    async fn find_active_membership(
        &self,
        email: &str,
    ) -> Result<Option<Membership>, EngineError> {
        self.read(
            self.primary.find_active_membership(email),
            self.fallback.find_active_membership(email),
        )
        .await
    }

    async fn memberships_for_email(&self, email: &str) -> Result<Vec<Membership>, EngineError> {
        self.read(
            self.primary.memberships_for_email(email),
            self.fallback.memberships_for_email(email),
        )
        .await
    }

    async fn list_memberships(&self) -> Result<Vec<Membership>, EngineError> {
        self.read_primary(self.primary.list_memberships()).await
    }

    async fn update_membership(
        &self,
        code: &str,
        mutation: MembershipMutation,
    ) -> Result<Membership, EngineError> {
        if !self.check_health().await {
            return self.fallback.update_membership(code, mutation).await;
        }
        let membership = self.observe(self.primary.update_membership(code, mutation).await)?;
        self.mirror("membership", self.fallback.mirror_membership(&membership))
            .await;
        Ok(membership)
    }

    async fn insert_claim(
        &self,
        claim: RewardClaim,
        gate: MembershipMutation,
    ) -> Result<(Membership, RewardClaim), EngineError> {
        let (membership, claim) = self
            .write_primary("claim submission", self.primary.insert_claim(claim, gate))
            .await?;
        self.mirror("membership", self.fallback.mirror_membership(&membership))
            .await;
        self.mirror("claim", self.fallback.mirror_claim(&claim)).await;
        Ok((membership, claim))
    }

    async fn get_claim(&self, id: &str) -> Result<Option<RewardClaim>, EngineError> {
        self.read(self.primary.get_claim(id), self.fallback.get_claim(id))
            .await
    }

    async fn list_claims(
        &self,
        status: Option<ClaimStatus>,
    ) -> Result<Vec<RewardClaim>, EngineError> {
        self.read_primary(self.primary.list_claims(status)).await
    }

    async fn update_claim(
        &self,
        id: &str,
        transition: ClaimTransition,
    ) -> Result<(Membership, RewardClaim), EngineError> {
        let (membership, claim) = self
            .write_primary("claim status change", self.primary.update_claim(id, transition))
            .await?;
        self.mirror("membership", self.fallback.mirror_membership(&membership))
            .await;
        self.mirror("claim", self.fallback.mirror_claim(&claim)).await;
        Ok((membership, claim))
    }

    async fn insert_order(&self, order: Order) -> Result<Order, EngineError> {
        if !self.check_health().await {
            return self.fallback.insert_order(order).await;
        }
        let order = self.observe(self.primary.insert_order(order).await)?;
        self.mirror("order", self.fallback.mirror_order(&order)).await;
        Ok(order)
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>, EngineError> {
        self.read(self.primary.get_order(id), self.fallback.get_order(id))
            .await
    }

    async fn list_orders(&self, email: Option<&str>) -> Result<Vec<Order>, EngineError> {
        match email {
            // A customer's own order history is a single-owner read.
            Some(email) => {
                self.read(
                    self.primary.list_orders(Some(email)),
                    self.fallback.list_orders(Some(email)),
                )
                .await
            }
            None => self.read_primary(self.primary.list_orders(None)).await,
        }
    }

    async fn update_order(&self, id: &str, mutation: OrderMutation) -> Result<Order, EngineError> {
        if !self.check_health().await {
            return self.fallback.update_order(id, mutation).await;
        }
        let order = self.observe(self.primary.update_order(id, mutation).await)?;
        self.mirror("order", self.fallback.mirror_order(&order)).await;
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::memberships::tests::membership;
    use crate::models::plans::tests::plan;
    use crate::models::requests::{Identity, NewMembershipRequest};
    use crate::repositories::LocalStore;

    /// Primary that can be switched off to simulate an outage.
    struct Flaky {
        inner: LocalStore,
        down: AtomicBool,
    }

    impl Flaky {
        fn check(&self) -> Result<(), EngineError> {
            if self.down.load(Ordering::SeqCst) {
                Err(EngineError::StorageUnavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Store for Flaky {
        async fn ping(&self) -> Result<(), EngineError> {
            self.check()
        }
        fn authority(&self) -> Authority {
            Authority::Primary
        }
        async fn insert_request(&self, r: MembershipRequest) -> Result<MembershipRequest, EngineError> {
            self.check()?;
            self.inner.insert_request(r).await
        }
        async fn get_request(&self, id: &str) -> Result<Option<MembershipRequest>, EngineError> {
            self.check()?;
            self.inner.get_request(id).await
        }
        async fn list_requests(&self, s: Option<RequestStatus>) -> Result<Vec<MembershipRequest>, EngineError> {
            self.check()?;
            self.inner.list_requests(s).await
        }
        async fn reject_request(&self, id: &str, now: DateTime<Utc>) -> Result<MembershipRequest, EngineError> {
            self.check()?;
            self.inner.reject_request(id, now).await
        }
        async fn activate_membership(&self, id: &str, m: Membership) -> Result<Membership, EngineError> {
            self.check()?;
            self.inner.activate_membership(id, m).await
        }
        async fn referral_code_exists(&self, code: &str) -> Result<bool, EngineError> {
            self.check()?;
            self.inner.referral_code_exists(code).await
        }
        async fn get_membership(&self, code: &str) -> Result<Option<Membership>, EngineError> {
            self.check()?;
            self.inner.get_membership(code).await
        }
        async fn find_active_membership(&self, email: &str) -> Result<Option<Membership>, EngineError> {
            self.check()?;
            self.inner.find_active_membership(email).await
        }
        async fn memberships_for_email(&self, email: &str) -> Result<Vec<Membership>, EngineError> {
            self.check()?;
            self.inner.memberships_for_email(email).await
        }
        async fn list_memberships(&self) -> Result<Vec<Membership>, EngineError> {
            self.check()?;
            self.inner.list_memberships().await
        }
        async fn update_membership(&self, code: &str, m: MembershipMutation) -> Result<Membership, EngineError> {
            self.check()?;
            self.inner.update_membership(code, m).await
        }
        async fn insert_claim(&self, c: RewardClaim, g: MembershipMutation) -> Result<(Membership, RewardClaim), EngineError> {
            self.check()?;
            self.inner.insert_claim(c, g).await
        }
        async fn get_claim(&self, id: &str) -> Result<Option<RewardClaim>, EngineError> {
            self.check()?;
            self.inner.get_claim(id).await
        }
        async fn list_claims(&self, s: Option<ClaimStatus>) -> Result<Vec<RewardClaim>, EngineError> {
            self.check()?;
            self.inner.list_claims(s).await
        }
        async fn update_claim(&self, id: &str, t: ClaimTransition) -> Result<(Membership, RewardClaim), EngineError> {
            self.check()?;
            self.inner.update_claim(id, t).await
        }
        async fn insert_order(&self, o: Order) -> Result<Order, EngineError> {
            self.check()?;
            self.inner.insert_order(o).await
        }
        async fn get_order(&self, id: &str) -> Result<Option<Order>, EngineError> {
            self.check()?;
            self.inner.get_order(id).await
        }
        async fn list_orders(&self, email: Option<&str>) -> Result<Vec<Order>, EngineError> {
            self.check()?;
            self.inner.list_orders(email).await
        }
        async fn update_order(&self, id: &str, m: OrderMutation) -> Result<Order, EngineError> {
            self.check()?;
            self.inner.update_order(id, m).await
        }
    }

    fn stores(recheck: Duration) -> MirroredStore<Flaky, LocalStore> {
        let primary = Flaky {
            inner: LocalStore::in_memory(),
            down: AtomicBool::new(false),
        };
        MirroredStore::new(primary, LocalStore::in_memory(), recheck)
    }

    async fn seed(store: &MirroredStore<Flaky, LocalStore>) -> String {
        let m = membership(5, 7);
        let code = m.referral_code.clone();
        store.primary.inner.mirror_membership(&m).await.unwrap();
        store.fallback.mirror_membership(&m).await.unwrap();
        code
    }

    fn referral(m: &mut Membership) -> Result<(), EngineError> {
        m.accrue_referral(
            &crate::models::memberships::ReferredUser {
                name: "Neha".to_string(),
                email: None,
                mobile: None,
            },
            Utc::now(),
        )
    }

    fn pending_request() -> MembershipRequest {
        MembershipRequest::submit(
            NewMembershipRequest {
                identity: Identity {
                    name: "Asha Verma".to_string(),
                    email: "asha@example.com".to_string(),
                    mobile: None,
                },
                plan_id: "gold".to_string(),
                screenshot_url: "https://cdn.example.com/asha.png".to_string(),
                referral_code: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn mirrors_successful_primary_writes() {
        let store = stores(Duration::from_secs(60));
        let code = seed(&store).await;

        store.update_membership(&code, Box::new(referral)).await.unwrap();

        let cached = store.fallback.get_membership(&code).await.unwrap().unwrap();
        assert_eq!(cached.referral_count, 1);
        assert_eq!(store.authority(), Authority::Primary);
    }

    #[tokio::test]
    async fn outage_surfaces_once_then_degrades_to_fallback() {
        let store = stores(Duration::from_secs(60));
        let code = seed(&store).await;
        store.primary.down.store(true, Ordering::SeqCst);

        let first = store.update_membership(&code, Box::new(referral)).await;
        assert!(matches!(first, Err(EngineError::StorageUnavailable(_))));
        assert_eq!(store.authority(), Authority::Fallback);

        let second = store.update_membership(&code, Box::new(referral)).await.unwrap();
        assert_eq!(second.referral_count, 1);

        // Single-record reads fall back, listings do not.
        assert!(store.get_membership(&code).await.unwrap().is_some());
        assert!(matches!(
            store.list_memberships().await,
            Err(EngineError::StorageUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn gated_writes_are_refused_while_degraded() {
        let store = stores(Duration::from_millis(0));
        let request = store.insert_request(pending_request()).await.unwrap();
        let activation = |code: &str| {
            Membership::activate(&request, &plan("gold", 5, 7), code.to_string(), Utc::now())
        };

        store.primary.down.store(true, Ordering::SeqCst);
        assert!(store.ping().await.is_err());
        assert!(store.is_degraded());

        let approval = store
            .activate_membership(&request.id, activation("ASHAAAA"))
            .await;
        assert!(matches!(approval, Err(EngineError::StorageUnavailable(_))));
        assert!(matches!(
            store.reject_request(&request.id, Utc::now()).await,
            Err(EngineError::StorageUnavailable(_))
        ));
        assert!(store.fallback.get_membership("ASHAAAA").await.unwrap().is_none());
        assert!(store.fallback.get_request(&request.id).await.unwrap().unwrap().is_pending());

        store.primary.down.store(false, Ordering::SeqCst);
        let membership = store
            .activate_membership(&request.id, activation("ASHBBBB"))
            .await
            .unwrap();
        assert_eq!(membership.referral_code, "ASHBBBB");
        assert!(!store.get_request(&request.id).await.unwrap().unwrap().is_pending());
        assert!(store.fallback.get_membership("ASHBBBB").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claims_are_refused_while_degraded() {
        let store = stores(Duration::from_secs(60));
        let code = seed(&store).await;
        let m = store.get_membership(&code).await.unwrap().unwrap();
        let claim = RewardClaim::new(
            crate::models::memberships::RewardType::Cashback,
            &m,
            crate::models::claims::ClaimDetails {
                address: "12 MG Road, Pune".to_string(),
                postal_code: "411001".to_string(),
                payout: None,
            },
            Utc::now(),
        );
        store.primary.down.store(true, Ordering::SeqCst);
        assert!(store.ping().await.is_err());

        let result = store
            .insert_claim(claim, Box::new(|_: &mut Membership| Ok(())))
            .await;

        assert!(matches!(result, Err(EngineError::StorageUnavailable(_))));
        assert!(store.fallback.list_claims(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn starts_degraded_when_primary_is_down_at_boot() {
        let store = stores(Duration::from_secs(60));
        let code = seed(&store).await;
        store.primary.down.store(true, Ordering::SeqCst);

        assert!(store.ping().await.is_err());
        assert_eq!(store.authority(), Authority::Fallback);

        let updated = store.update_membership(&code, Box::new(referral)).await.unwrap();
        assert_eq!(updated.referral_count, 1);
    }

    #[tokio::test]
    async fn recovers_after_successful_probe() {
        let store = stores(Duration::from_millis(0));
        let code = seed(&store).await;
        store.primary.down.store(true, Ordering::SeqCst);
        let _ = store.update_membership(&code, Box::new(referral)).await;
        assert!(store.is_degraded());

        store.primary.down.store(false, Ordering::SeqCst);
        assert!(store.check_health().await);
        assert_eq!(store.authority(), Authority::Primary);
    }
}
