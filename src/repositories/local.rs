use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};

use super::{Authority, ClaimTransition, MembershipMutation, OrderMutation, Replica, Store};
use crate::errors::{ConflictKind, EngineError, Entity};
use crate::models::{
    claims::{ClaimStatus, RewardClaim},
    memberships::Membership,
    orders::Order,
    requests::{MembershipRequest, RequestStatus},
};

#[derive(Default, Deserialize, Serialize)]
struct Snapshot {
    requests: Vec<MembershipRequest>,
    memberships: Vec<Membership>,
    claims: Vec<RewardClaim>,
    orders: Vec<Order>,
}

/// In-process record store backed by `DashMap`s, optionally persisted to a
/// JSON snapshot file.
///
/// Single-record mutations lock only the record's map entry. Operations that
/// maintain the per-email uniqueness indexes (request submission and
/// decisions, membership activation) are serialized by `catalog_lock`.
/// Lock order is always memberships before claims.
///
/// Writes are serialized by `write_lock` up to and including the snapshot
/// write. A change whose snapshot write fails is rolled back before the
/// error is returned, so a failed call has no visible effect.
pub struct LocalStore {
    requests: DashMap<String, MembershipRequest>,
    pending_by_email: DashMap<String, String>,
    memberships: DashMap<String, Membership>,
    active_by_email: DashMap<String, String>,
    claims: DashMap<String, RewardClaim>,
    orders: DashMap<String, Order>,
    catalog_lock: Mutex<()>,
    write_lock: tokio::sync::Mutex<()>,
    snapshot_path: Option<PathBuf>,
    authority: Authority,
}

fn io_error(path: &Path, e: std::io::Error) -> EngineError {
    EngineError::StorageUnavailable(format!("{}: {}", path.display(), e))
}

impl LocalStore {
    fn empty(snapshot_path: Option<PathBuf>, authority: Authority) -> Self {
        Self {
            requests: DashMap::new(),
            pending_by_email: DashMap::new(),
            memberships: DashMap::new(),
            active_by_email: DashMap::new(),
            claims: DashMap::new(),
            orders: DashMap::new(),
            catalog_lock: Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
            snapshot_path,
            authority,
        }
    }

    /// Volatile store, authoritative for the lifetime of the process.
    pub fn in_memory() -> Self {
        Self::empty(None, Authority::Primary)
    }

    /// Non-authoritative cache persisted at `path`, loading any previous snapshot.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error(dir, e))?;
        }

        let store = Self::empty(Some(path.clone()), Authority::Fallback);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                store.load(snapshot);
                log::info!("Loaded local snapshot from {}.", path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No local snapshot at {}, starting empty.", path.display());
            }
            Err(e) => return Err(io_error(&path, e)),
        }

        Ok(store)
    }

    fn load(&self, snapshot: Snapshot) {
        for request in snapshot.requests {
            self.index_request(&request);
            self.requests.insert(request.id.clone(), request);
        }
        for membership in snapshot.memberships {
            self.index_membership(&membership);
            self.memberships
                .insert(membership.referral_code.clone(), membership);
        }
        for claim in snapshot.claims {
            self.claims.insert(claim.id.clone(), claim);
        }
        for order in snapshot.orders {
            self.orders.insert(order.order_id.clone(), order);
        }
    }

    fn catalog(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.catalog_lock
            .lock()
            .map_err(|_| EngineError::Internal("local store catalog lock poisoned".to_string()))
    }

    fn index_request(&self, request: &MembershipRequest) {
        if request.is_pending() {
            self.pending_by_email
                .insert(request.email.clone(), request.id.clone());
        } else {
            self.pending_by_email
                .remove_if(&request.email, |_, id| id == &request.id);
        }
    }

    fn index_membership(&self, membership: &Membership) {
        if membership.is_active() {
            self.active_by_email
                .insert(membership.email.clone(), membership.referral_code.clone());
        } else {
            self.active_by_email
                .remove_if(&membership.email, |_, code| code == &membership.referral_code);
        }
    }

    fn restore_request(&self, previous: MembershipRequest) {
        self.index_request(&previous);
        self.requests.insert(previous.id.clone(), previous);
    }

    fn restore_membership(&self, previous: Membership) {
        self.index_membership(&previous);
        self.memberships
            .insert(previous.referral_code.clone(), previous);
    }

    /// Writes the snapshot, undoing the in-memory change if that fails.
    /// Callers hold `write_lock`.
    async fn commit<R: FnOnce()>(&self, rollback: R) -> Result<(), EngineError> {
        if let Err(e) = self.persist().await {
            log::error!("Local snapshot write failed, rolling back: {}", e);
            rollback();
            return Err(e);
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), EngineError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            requests: self.requests.iter().map(|e| e.value().clone()).collect(),
            memberships: self.memberships.iter().map(|e| e.value().clone()).collect(),
            claims: self.claims.iter().map(|e| e.value().clone()).collect(),
            orders: self.orders.iter().map(|e| e.value().clone()).collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error(path, e))?;

        Ok(())
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn authority(&self) -> Authority {
        self.authority
    }

    async fn insert_request(
        &self,
        request: MembershipRequest,
    ) -> Result<MembershipRequest, EngineError> {
        let _write = self.write_lock.lock().await;
        {
            let _catalog = self.catalog()?;
            if self.pending_by_email.contains_key(&request.email) {
                return Err(EngineError::Conflict(ConflictKind::DuplicatePendingRequest(
                    request.email.clone(),
                )));
            }
            self.pending_by_email
                .insert(request.email.clone(), request.id.clone());
            self.requests.insert(request.id.clone(), request.clone());
        }

        self.commit(|| {
            self.requests.remove(&request.id);
            self.pending_by_email
                .remove_if(&request.email, |_, id| id == &request.id);
        })
        .await?;
        Ok(request)
    }

    async fn get_request(&self, id: &str) -> Result<Option<MembershipRequest>, EngineError> {
        Ok(self.requests.get(id).map(|r| r.value().clone()))
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<MembershipRequest>, EngineError> {
        let mut requests: Vec<MembershipRequest> = self
            .requests
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .map(|r| r.value().clone())
            .collect();
        requests.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));

        Ok(requests)
    }

    async fn reject_request(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<MembershipRequest, EngineError> {
        let _write = self.write_lock.lock().await;
        let (previous, request) = {
            let _catalog = self.catalog()?;
            let mut entry = self
                .requests
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(Entity::MembershipRequest, id))?;
            if !entry.is_pending() {
                return Err(EngineError::Conflict(ConflictKind::AlreadyDecided(
                    id.to_string(),
                )));
            }
            let previous = entry.value().clone();
            entry.status = RequestStatus::Rejected;
            entry.decided_at = Some(now);
            let request = entry.value().clone();
            drop(entry);

            self.index_request(&request);
            (previous, request)
        };

        self.commit(|| self.restore_request(previous)).await?;
        Ok(request)
    }

    async fn activate_membership(
        &self,
        request_id: &str,
        membership: Membership,
    ) -> Result<Membership, EngineError> {
        let _write = self.write_lock.lock().await;
        let (previous_request, previous_active) = {
            let _catalog = self.catalog()?;
            let request = self
                .requests
                .get(request_id)
                .map(|r| r.value().clone())
                .ok_or_else(|| EngineError::not_found(Entity::MembershipRequest, request_id))?;
            if !request.is_pending() {
                return Err(EngineError::Conflict(ConflictKind::AlreadyDecided(
                    request_id.to_string(),
                )));
            }

            let current = self
                .active_by_email
                .get(&membership.email)
                .map(|code| code.value().clone());
            if let Some(code) = &current {
                let still_active = self
                    .memberships
                    .get(code)
                    .map(|m| m.is_active())
                    .unwrap_or(false);
                if still_active {
                    return Err(EngineError::Conflict(ConflictKind::ActiveMembershipExists(
                        membership.email.clone(),
                    )));
                }
            }

            match self.memberships.entry(membership.referral_code.clone()) {
                Entry::Occupied(_) => {
                    return Err(EngineError::Conflict(ConflictKind::CodeTaken(
                        membership.referral_code.clone(),
                    )))
                }
                Entry::Vacant(slot) => {
                    slot.insert(membership.clone());
                }
            }
            self.index_membership(&membership);

            let approved = {
                let mut entry = self
                    .requests
                    .get_mut(request_id)
                    .ok_or_else(|| EngineError::not_found(Entity::MembershipRequest, request_id))?;
                entry.status = RequestStatus::Approved;
                entry.decided_at = Some(membership.activated_at);
                entry.value().clone()
            };
            self.index_request(&approved);
            (request, current)
        };

        self.commit(|| {
            self.memberships.remove(&membership.referral_code);
            match previous_active {
                Some(code) => {
                    self.active_by_email.insert(membership.email.clone(), code);
                }
                None => {
                    self.active_by_email
                        .remove_if(&membership.email, |_, code| code == &membership.referral_code);
                }
            }
            self.restore_request(previous_request);
        })
        .await?;
        Ok(membership)
    }

    async fn referral_code_exists(&self, code: &str) -> Result<bool, EngineError> {
        Ok(self.memberships.contains_key(code))
    }

    async fn get_membership(&self, code: &str) -> Result<Option<Membership>, EngineError> {
        Ok(self.memberships.get(code).map(|m| m.value().clone()))
    }

    async fn find_active_membership(
        &self,
        email: &str,
    ) -> Result<Option<Membership>, EngineError> {
        let code = match self.active_by_email.get(email) {
            Some(code) => code.value().clone(),
            None => return Ok(None),
        };

        Ok(self
            .memberships
            .get(&code)
            .map(|m| m.value().clone())
            .filter(|m| m.is_active()))
    }

    async fn memberships_for_email(&self, email: &str) -> Result<Vec<Membership>, EngineError> {
        let mut memberships: Vec<Membership> = self
            .memberships
            .iter()
            .filter(|m| m.email == email)
            .map(|m| m.value().clone())
            .collect();
        memberships.sort_by(|a, b| b.activated_at.cmp(&a.activated_at));

        Ok(memberships)
    }

    async fn list_memberships(&self) -> Result<Vec<Membership>, EngineError> {
        let mut memberships: Vec<Membership> =
            self.memberships.iter().map(|m| m.value().clone()).collect();
        memberships.sort_by(|a, b| b.activated_at.cmp(&a.activated_at));

        Ok(memberships)
    }

    async fn update_membership(
        &self,
        code: &str,
        mutation: MembershipMutation,
    ) -> Result<Membership, EngineError> {
        let _write = self.write_lock.lock().await;
        let (previous, updated) = {
            let mut entry = self
                .memberships
                .get_mut(code)
                .ok_or_else(|| EngineError::not_found(Entity::Membership, code))?;
            let mut draft = entry.value().clone();
            mutation(&mut draft)?;
            let previous = std::mem::replace(entry.value_mut(), draft.clone());
            (previous, draft)
        };
        self.index_membership(&updated);

        self.commit(|| self.restore_membership(previous)).await?;
        Ok(updated)
    }

    async fn insert_claim(
        &self,
        claim: RewardClaim,
        gate: MembershipMutation,
    ) -> Result<(Membership, RewardClaim), EngineError> {
        let _write = self.write_lock.lock().await;
        let (previous, membership) = {
            let mut entry = self
                .memberships
                .get_mut(&claim.referral_code)
                .ok_or_else(|| EngineError::not_found(Entity::Membership, &claim.referral_code))?;
            let mut draft = entry.value().clone();
            gate(&mut draft)?;
            self.claims.insert(claim.id.clone(), claim.clone());
            let previous = std::mem::replace(entry.value_mut(), draft.clone());
            (previous, draft)
        };

        self.commit(|| {
            self.claims.remove(&claim.id);
            self.restore_membership(previous);
        })
        .await?;
        Ok((membership, claim))
    }

    async fn get_claim(&self, id: &str) -> Result<Option<RewardClaim>, EngineError> {
        Ok(self.claims.get(id).map(|c| c.value().clone()))
    }

    async fn list_claims(
        &self,
        status: Option<ClaimStatus>,
    ) -> Result<Vec<RewardClaim>, EngineError> {
        let mut claims: Vec<RewardClaim> = self
            .claims
            .iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .map(|c| c.value().clone())
            .collect();
        claims.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));

        Ok(claims)
    }

    async fn update_claim(
        &self,
        id: &str,
        transition: ClaimTransition,
    ) -> Result<(Membership, RewardClaim), EngineError> {
        let _write = self.write_lock.lock().await;
        let code = self
            .claims
            .get(id)
            .map(|c| c.referral_code.clone())
            .ok_or_else(|| EngineError::not_found(Entity::RewardClaim, id))?;

        let (previous, membership, claim) = {
            let mut membership_entry = self
                .memberships
                .get_mut(&code)
                .ok_or_else(|| EngineError::not_found(Entity::Membership, &code))?;
            let mut claim_entry = self
                .claims
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(Entity::RewardClaim, id))?;

            let mut membership = membership_entry.value().clone();
            let mut claim = claim_entry.value().clone();
            transition(&mut claim, &mut membership)?;

            let previous_membership =
                std::mem::replace(membership_entry.value_mut(), membership.clone());
            let previous_claim = std::mem::replace(claim_entry.value_mut(), claim.clone());
            ((previous_membership, previous_claim), membership, claim)
        };
        self.index_membership(&membership);

        let (previous_membership, previous_claim) = previous;
        self.commit(|| {
            self.claims.insert(previous_claim.id.clone(), previous_claim);
            self.restore_membership(previous_membership);
        })
        .await?;
        Ok((membership, claim))
    }

    async fn insert_order(&self, order: Order) -> Result<Order, EngineError> {
        let _write = self.write_lock.lock().await;
        match self.orders.entry(order.order_id.clone()) {
            Entry::Occupied(_) => {
                return Err(EngineError::Conflict(ConflictKind::DuplicateOrderId(
                    order.order_id.clone(),
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(order.clone());
            }
        }

        self.commit(|| {
            self.orders.remove(&order.order_id);
        })
        .await?;
        Ok(order)
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>, EngineError> {
        Ok(self.orders.get(id).map(|o| o.value().clone()))
    }

    async fn list_orders(&self, email: Option<&str>) -> Result<Vec<Order>, EngineError> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| email.map_or(true, |email| o.customer.email == email))
            .map(|o| o.value().clone())
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(orders)
    }

    async fn update_order(&self, id: &str, mutation: OrderMutation) -> Result<Order, EngineError> {
        let _write = self.write_lock.lock().await;
        let (previous, updated) = {
            let mut entry = self
                .orders
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(Entity::Order, id))?;
            let mut draft = entry.value().clone();
            mutation(&mut draft)?;
            let previous = std::mem::replace(entry.value_mut(), draft.clone());
            (previous, draft)
        };

        self.commit(|| {
            self.orders.insert(previous.order_id.clone(), previous);
        })
        .await?;
        Ok(updated)
    }
}

#[async_trait]
impl Replica for LocalStore {
    async fn mirror_request(&self, request: &MembershipRequest) -> Result<(), EngineError> {
        let _write = self.write_lock.lock().await;
        {
            let _catalog = self.catalog()?;
            self.requests.insert(request.id.clone(), request.clone());
            self.index_request(request);
        }
        self.persist().await
    }

    async fn mirror_membership(&self, membership: &Membership) -> Result<(), EngineError> {
        let _write = self.write_lock.lock().await;
        {
            let _catalog = self.catalog()?;
            self.memberships
                .insert(membership.referral_code.clone(), membership.clone());
            self.index_membership(membership);
        }
        self.persist().await
    }

    async fn mirror_claim(&self, claim: &RewardClaim) -> Result<(), EngineError> {
        let _write = self.write_lock.lock().await;
        self.claims.insert(claim.id.clone(), claim.clone());
        self.persist().await
    }

    async fn mirror_order(&self, order: &Order) -> Result<(), EngineError> {
        let _write = self.write_lock.lock().await;
        self.orders.insert(order.order_id.clone(), order.clone());
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::memberships::{ClaimFlag, ReferredUser, RewardType};
    use crate::models::memberships::tests::membership;

    #[tokio::test]
    async fn failed_mutation_leaves_record_untouched() {
        let store = LocalStore::in_memory();
        let m = membership(1, 1);
        let code = m.referral_code.clone();
        store.memberships.insert(code.clone(), m);

        let result = store
            .update_membership(&code, Box::new(|m| m.begin_claim(RewardType::Gold)))
            .await;
        assert!(result.is_err());

        let stored = store.get_membership(&code).await.unwrap().unwrap();
        assert_eq!(stored.gold_coin_claimed, ClaimFlag::NotClaimed);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("snapshot.json");

        let store = LocalStore::open(&path).await.unwrap();
        assert_eq!(store.authority(), Authority::Fallback);
        let m = membership(5, 7);
        let code = m.referral_code.clone();
        store.mirror_membership(&m).await.unwrap();
        store
            .update_membership(
                &code,
                Box::new(|m| {
                    m.accrue_referral(
                        &ReferredUser {
                            name: "Neha".to_string(),
                            email: None,
                            mobile: None,
                        },
                        Utc::now(),
                    )
                }),
            )
            .await
            .unwrap();

        let reopened = LocalStore::open(&path).await.unwrap();
        let restored = reopened.get_membership(&code).await.unwrap().unwrap();
        assert_eq!(restored.referral_count, 1);
        assert!(reopened
            .find_active_membership("ravi@example.com")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn failed_snapshot_write_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let store = LocalStore::open(&path).await.unwrap();
        let m = membership(5, 7);
        let code = m.referral_code.clone();
        store.mirror_membership(&m).await.unwrap();

        let referral = || -> MembershipMutation {
            Box::new(|m: &mut Membership| {
                m.accrue_referral(
                    &ReferredUser {
                        name: "Neha".to_string(),
                        email: None,
                        mobile: None,
                    },
                    Utc::now(),
                )
            })
        };

        // The temporary snapshot file cannot be created over a directory.
        let blocker = path.with_extension("tmp");
        std::fs::create_dir(&blocker).unwrap();

        let result = store.update_membership(&code, referral()).await;
        assert!(matches!(result, Err(EngineError::StorageUnavailable(_))));
        let stored = store.get_membership(&code).await.unwrap().unwrap();
        assert_eq!(stored.referral_count, 0);
        assert!(stored.referrals.is_empty());

        std::fs::remove_dir(&blocker).unwrap();
        let retried = store.update_membership(&code, referral()).await.unwrap();
        assert_eq!(retried.referral_count, 1);

        let reopened = LocalStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get_membership(&code).await.unwrap().unwrap().referral_count,
            1
        );
    }
}
