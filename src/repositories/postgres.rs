use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgConnection, PgPool};

use super::{Authority, ClaimTransition, MembershipMutation, OrderMutation, Store};
use crate::errors::{ConflictKind, EngineError, Entity};
use crate::models::{
    claims::{ClaimDetails, ClaimStatus, RewardClaim},
    memberships::{Membership, Referral},
    orders::{CustomerSnapshot, HistoryEntry, Order, OrderItem},
    requests::{MembershipRequest, RequestStatus},
};

const REQUEST_COLUMNS: &str = "id, name, email, mobile, plan_id, referral_code, screenshot_url, status, submitted_at, decided_at";
const MEMBERSHIP_COLUMNS: &str = "referral_code, request_id, email, name, mobile, plan_id, cashback_goal, gold_goal, cashback_enabled, gold_enabled, referral_count, referrals, money_back_claimed, gold_coin_claimed, status, activated_at, completed_at";
const CLAIM_COLUMNS: &str = "id, reward_type, email, referral_code, details, status, admin_note, submitted_at, updated_at";
const ORDER_COLUMNS: &str = "order_id, customer, items, subtotal_in_cents, shipping_in_cents, total_in_cents, status, payment_status, status_history, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: String,
    name: String,
    email: String,
    mobile: Option<String>,
    plan_id: String,
    referral_code: Option<String>,
    screenshot_url: String,
    status: String,
    submitted_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
}

impl TryFrom<RequestRow> for MembershipRequest {
    type Error = EngineError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        Ok(MembershipRequest {
            id: row.id,
            name: row.name,
            email: row.email,
            mobile: row.mobile,
            plan_id: row.plan_id,
            referral_code: row.referral_code,
            screenshot_url: row.screenshot_url,
            status: row.status.parse()?,
            submitted_at: row.submitted_at,
            decided_at: row.decided_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MembershipRow {
    referral_code: String,
    request_id: String,
    email: String,
    name: String,
    mobile: Option<String>,
    plan_id: String,
    cashback_goal: i32,
    gold_goal: i32,
    cashback_enabled: bool,
    gold_enabled: bool,
    referral_count: i32,
    referrals: Json<Vec<Referral>>,
    money_back_claimed: String,
    gold_coin_claimed: String,
    status: String,
    activated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

fn to_count(value: i32, column: &str) -> Result<u32, EngineError> {
    u32::try_from(value).map_err(|_| EngineError::Internal(format!("negative {}: {}", column, value)))
}

fn to_column(value: u32, column: &str) -> Result<i32, EngineError> {
    i32::try_from(value).map_err(|_| EngineError::invalid(format!("{} out of range: {}", column, value)))
}

impl TryFrom<MembershipRow> for Membership {
    type Error = EngineError;

    fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
        Ok(Membership {
            referral_code: row.referral_code,
            request_id: row.request_id,
            email: row.email,
            name: row.name,
            mobile: row.mobile,
            plan_id: row.plan_id,
            cashback_goal: to_count(row.cashback_goal, "cashback_goal")?,
            gold_goal: to_count(row.gold_goal, "gold_goal")?,
            cashback_enabled: row.cashback_enabled,
            gold_enabled: row.gold_enabled,
            referral_count: to_count(row.referral_count, "referral_count")?,
            referrals: row.referrals.0,
            money_back_claimed: row.money_back_claimed.parse()?,
            gold_coin_claimed: row.gold_coin_claimed.parse()?,
            status: row.status.parse()?,
            activated_at: row.activated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    id: String,
    reward_type: String,
    email: String,
    referral_code: String,
    details: Json<ClaimDetails>,
    status: String,
    admin_note: Option<String>,
    submitted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ClaimRow> for RewardClaim {
    type Error = EngineError;

    fn try_from(row: ClaimRow) -> Result<Self, Self::Error> {
        Ok(RewardClaim {
            id: row.id,
            reward_type: row.reward_type.parse()?,
            email: row.email,
            referral_code: row.referral_code,
            details: row.details.0,
            status: row.status.parse()?,
            admin_note: row.admin_note,
            submitted_at: row.submitted_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    order_id: String,
    customer: Json<CustomerSnapshot>,
    items: Json<Vec<OrderItem>>,
    subtotal_in_cents: i64,
    shipping_in_cents: i64,
    total_in_cents: i64,
    status: String,
    payment_status: String,
    status_history: Json<Vec<HistoryEntry>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = EngineError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            order_id: row.order_id,
            customer: row.customer.0,
            items: row.items.0,
            subtotal_in_cents: row.subtotal_in_cents,
            shipping_in_cents: row.shipping_in_cents,
            total_in_cents: row.total_in_cents,
            status: row.status.parse()?,
            payment_status: row.payment_status.parse()?,
            status_history: row.status_history.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Name of the violated unique constraint, if `e` is a unique violation.
fn unique_violation(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Some(db.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

/// PostgreSQL-backed primary store. Every read-modify-write runs in a
/// transaction holding `FOR UPDATE` locks on the rows it touches, taking
/// memberships before claims.
#[derive(Clone)]
pub struct PgStore {
    conn: PgPool,
}

impl PgStore {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }

    pub async fn migrate(&self) -> Result<(), EngineError> {
        sqlx::migrate!("./migrations")
            .run(&self.conn)
            .await
            .map_err(|e| match e {
                sqlx::migrate::MigrateError::Execute(e) => EngineError::from(e),
                other => EngineError::Internal(format!("Migration failed: {}", other)),
            })
    }

    async fn lock_membership(
        conn: &mut PgConnection,
        code: &str,
    ) -> Result<Membership, EngineError> {
        let sql = format!(
            "SELECT {} FROM memberships WHERE referral_code = $1 FOR UPDATE",
            MEMBERSHIP_COLUMNS
        );
        let row = sqlx::query_as::<_, MembershipRow>(&sql)
            .bind(code)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::Membership, code))?;

        row.try_into()
    }

    async fn write_membership(
        conn: &mut PgConnection,
        membership: &Membership,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE memberships
            SET referral_count = $1, referrals = $2, money_back_claimed = $3,
                gold_coin_claimed = $4, status = $5, completed_at = $6
            WHERE referral_code = $7
            "#,
        )
        .bind(to_column(membership.referral_count, "referral_count")?)
        .bind(Json(&membership.referrals))
        .bind(membership.money_back_claimed.as_str())
        .bind(membership.gold_coin_claimed.as_str())
        .bind(membership.status.as_str())
        .bind(membership.completed_at)
        .bind(&membership.referral_code)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn lock_request(
        conn: &mut PgConnection,
        id: &str,
    ) -> Result<MembershipRequest, EngineError> {
        let sql = format!(
            "SELECT {} FROM membership_requests WHERE id = $1 FOR UPDATE",
            REQUEST_COLUMNS
        );
        let row = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::MembershipRequest, id))?;

        row.try_into()
    }

    async fn decide_request(
        conn: &mut PgConnection,
        id: &str,
        status: RequestStatus,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE membership_requests SET status = $1, decided_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), EngineError> {
        sqlx::query("SELECT 1").execute(&self.conn).await?;
        Ok(())
    }

    fn authority(&self) -> Authority {
        Authority::Primary
    }

    async fn insert_request(
        &self,
        request: MembershipRequest,
    ) -> Result<MembershipRequest, EngineError> {
        sqlx::query(
            r#"
            INSERT INTO membership_requests
            (id, name, email, mobile, plan_id, referral_code, screenshot_url, status, submitted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&request.id)
        .bind(&request.name)
        .bind(&request.email)
        .bind(&request.mobile)
        .bind(&request.plan_id)
        .bind(&request.referral_code)
        .bind(&request.screenshot_url)
        .bind(request.status.as_str())
        .bind(request.submitted_at)
        .execute(&self.conn)
        .await
        .map_err(|e| match unique_violation(&e) {
            Some(_) => EngineError::Conflict(ConflictKind::DuplicatePendingRequest(
                request.email.clone(),
            )),
            None => e.into(),
        })?;

        Ok(request)
    }

    async fn get_request(&self, id: &str) -> Result<Option<MembershipRequest>, EngineError> {
        let sql = format!("SELECT {} FROM membership_requests WHERE id = $1", REQUEST_COLUMNS);
        sqlx::query_as::<_, RequestRow>(&sql)
            .bind(id)
            .fetch_optional(&self.conn)
            .await?
            .map(MembershipRequest::try_from)
            .transpose()
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<MembershipRequest>, EngineError> {
        let sql = format!(
            "SELECT {} FROM membership_requests WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY submitted_at DESC",
            REQUEST_COLUMNS
        );
        sqlx::query_as::<_, RequestRow>(&sql)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.conn)
            .await?
            .into_iter()
            .map(MembershipRequest::try_from)
            .collect()
    }

    async fn reject_request(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<MembershipRequest, EngineError> {
        let mut tx = self.conn.begin().await?;
        let mut request = Self::lock_request(&mut tx, id).await?;
        if !request.is_pending() {
            return Err(EngineError::Conflict(ConflictKind::AlreadyDecided(id.to_string())));
        }

        Self::decide_request(&mut tx, id, RequestStatus::Rejected, now).await?;
        tx.commit().await?;

        request.status = RequestStatus::Rejected;
        request.decided_at = Some(now);
        Ok(request)
    }

    async fn activate_membership(
        &self,
        request_id: &str,
        membership: Membership,
    ) -> Result<Membership, EngineError> {
        let mut tx = self.conn.begin().await?;
        let request = Self::lock_request(&mut tx, request_id).await?;
        if !request.is_pending() {
            return Err(EngineError::Conflict(ConflictKind::AlreadyDecided(
                request_id.to_string(),
            )));
        }

        let sql = format!(
            r#"
            INSERT INTO memberships ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
            MEMBERSHIP_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&membership.referral_code)
            .bind(&membership.request_id)
            .bind(&membership.email)
            .bind(&membership.name)
            .bind(&membership.mobile)
            .bind(&membership.plan_id)
            .bind(to_column(membership.cashback_goal, "cashback_goal")?)
            .bind(to_column(membership.gold_goal, "gold_goal")?)
            .bind(membership.cashback_enabled)
            .bind(membership.gold_enabled)
            .bind(to_column(membership.referral_count, "referral_count")?)
            .bind(Json(&membership.referrals))
            .bind(membership.money_back_claimed.as_str())
            .bind(membership.gold_coin_claimed.as_str())
            .bind(membership.status.as_str())
            .bind(membership.activated_at)
            .bind(membership.completed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| match unique_violation(&e).as_deref() {
                Some("memberships_pkey") => EngineError::Conflict(ConflictKind::CodeTaken(
                    membership.referral_code.clone(),
                )),
                Some("memberships_request_id_key") => EngineError::Conflict(
                    ConflictKind::AlreadyDecided(request_id.to_string()),
                ),
                Some(_) => EngineError::Conflict(ConflictKind::ActiveMembershipExists(
                    membership.email.clone(),
                )),
                None => e.into(),
            })?;

        Self::decide_request(&mut tx, request_id, RequestStatus::Approved, membership.activated_at)
            .await?;
        tx.commit().await?;

        Ok(membership)
    }

    async fn referral_code_exists(&self, code: &str) -> Result<bool, EngineError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM memberships WHERE referral_code = $1)")
                .bind(code)
                .fetch_one(&self.conn)
                .await?;

        Ok(exists)
    }

    async fn get_membership(&self, code: &str) -> Result<Option<Membership>, EngineError> {
        let sql = format!("SELECT {} FROM memberships WHERE referral_code = $1", MEMBERSHIP_COLUMNS);
        sqlx::query_as::<_, MembershipRow>(&sql)
            .bind(code)
            .fetch_optional(&self.conn)
            .await?
            .map(Membership::try_from)
            .transpose()
    }

    async fn find_active_membership(
        &self,
        email: &str,
    ) -> Result<Option<Membership>, EngineError> {
        let sql = format!(
            "SELECT {} FROM memberships WHERE email = $1 AND status = 'active'",
            MEMBERSHIP_COLUMNS
        );
        sqlx::query_as::<_, MembershipRow>(&sql)
            .bind(email)
            .fetch_optional(&self.conn)
            .await?
            .map(Membership::try_from)
            .transpose()
    }

    async fn memberships_for_email(&self, email: &str) -> Result<Vec<Membership>, EngineError> {
        let sql = format!(
            "SELECT {} FROM memberships WHERE email = $1 ORDER BY activated_at DESC",
            MEMBERSHIP_COLUMNS
        );
        sqlx::query_as::<_, MembershipRow>(&sql)
            .bind(email)
            .fetch_all(&self.conn)
            .await?
            .into_iter()
            .map(Membership::try_from)
            .collect()
    }

    async fn list_memberships(&self) -> Result<Vec<Membership>, EngineError> {
        let sql = format!("SELECT {} FROM memberships ORDER BY activated_at DESC", MEMBERSHIP_COLUMNS);
        sqlx::query_as::<_, MembershipRow>(&sql)
            .fetch_all(&self.conn)
            .await?
            .into_iter()
            .map(Membership::try_from)
            .collect()
    }

    async fn update_membership(
        &self,
        code: &str,
        mutation: MembershipMutation,
    ) -> Result<Membership, EngineError> {
        let mut tx = self.conn.begin().await?;
        let mut membership = Self::lock_membership(&mut tx, code).await?;
        mutation(&mut membership)?;
        Self::write_membership(&mut tx, &membership).await?;
        tx.commit().await?;

        Ok(membership)
    }

    async fn insert_claim(
        &self,
        claim: RewardClaim,
        gate: MembershipMutation,
    ) -> Result<(Membership, RewardClaim), EngineError> {
        let mut tx = self.conn.begin().await?;
        let mut membership = Self::lock_membership(&mut tx, &claim.referral_code).await?;
        gate(&mut membership)?;
        Self::write_membership(&mut tx, &membership).await?;

        let sql = format!(
            "INSERT INTO reward_claims ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            CLAIM_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&claim.id)
            .bind(claim.reward_type.as_str())
            .bind(&claim.email)
            .bind(&claim.referral_code)
            .bind(Json(&claim.details))
            .bind(claim.status.as_str())
            .bind(&claim.admin_note)
            .bind(claim.submitted_at)
            .bind(claim.updated_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok((membership, claim))
    }

    async fn get_claim(&self, id: &str) -> Result<Option<RewardClaim>, EngineError> {
        let sql = format!("SELECT {} FROM reward_claims WHERE id = $1", CLAIM_COLUMNS);
        sqlx::query_as::<_, ClaimRow>(&sql)
            .bind(id)
            .fetch_optional(&self.conn)
            .await?
            .map(RewardClaim::try_from)
            .transpose()
    }

    async fn list_claims(
        &self,
        status: Option<ClaimStatus>,
    ) -> Result<Vec<RewardClaim>, EngineError> {
        let sql = format!(
            "SELECT {} FROM reward_claims WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY submitted_at DESC",
            CLAIM_COLUMNS
        );
        sqlx::query_as::<_, ClaimRow>(&sql)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.conn)
            .await?
            .into_iter()
            .map(RewardClaim::try_from)
            .collect()
    }

    async fn update_claim(
        &self,
        id: &str,
        transition: ClaimTransition,
    ) -> Result<(Membership, RewardClaim), EngineError> {
        let code: String = sqlx::query_scalar("SELECT referral_code FROM reward_claims WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.conn)
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::RewardClaim, id))?;

        let mut tx = self.conn.begin().await?;
        let mut membership = Self::lock_membership(&mut tx, &code).await?;
        let sql = format!("SELECT {} FROM reward_claims WHERE id = $1 FOR UPDATE", CLAIM_COLUMNS);
        let mut claim: RewardClaim = sqlx::query_as::<_, ClaimRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::RewardClaim, id))?
            .try_into()?;

        transition(&mut claim, &mut membership)?;
        Self::write_membership(&mut tx, &membership).await?;
        sqlx::query("UPDATE reward_claims SET status = $1, admin_note = $2, updated_at = $3 WHERE id = $4")
            .bind(claim.status.as_str())
            .bind(&claim.admin_note)
            .bind(claim.updated_at)
            .bind(&claim.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok((membership, claim))
    }

    async fn insert_order(&self, order: Order) -> Result<Order, EngineError> {
        let sql = format!(
            "INSERT INTO orders (customer_email, {}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            ORDER_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&order.customer.email)
            .bind(&order.order_id)
            .bind(Json(&order.customer))
            .bind(Json(&order.items))
            .bind(order.subtotal_in_cents)
            .bind(order.shipping_in_cents)
            .bind(order.total_in_cents)
            .bind(order.status.as_str())
            .bind(order.payment_status.as_str())
            .bind(Json(&order.status_history))
            .bind(order.created_at)
            .bind(order.updated_at)
            .execute(&self.conn)
            .await
            .map_err(|e| match unique_violation(&e) {
                Some(_) => EngineError::Conflict(ConflictKind::DuplicateOrderId(order.order_id.clone())),
                None => e.into(),
            })?;

        Ok(order)
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>, EngineError> {
        let sql = format!("SELECT {} FROM orders WHERE order_id = $1", ORDER_COLUMNS);
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .fetch_optional(&self.conn)
            .await?
            .map(Order::try_from)
            .transpose()
    }

    async fn list_orders(&self, email: Option<&str>) -> Result<Vec<Order>, EngineError> {
        let sql = format!(
            "SELECT {} FROM orders WHERE ($1::TEXT IS NULL OR customer_email = $1) ORDER BY created_at DESC",
            ORDER_COLUMNS
        );
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(email)
            .fetch_all(&self.conn)
            .await?
            .into_iter()
            .map(Order::try_from)
            .collect()
    }

    async fn update_order(&self, id: &str, mutation: OrderMutation) -> Result<Order, EngineError> {
        let mut tx = self.conn.begin().await?;
        let sql = format!("SELECT {} FROM orders WHERE order_id = $1 FOR UPDATE", ORDER_COLUMNS);
        let mut order: Order = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::Order, id))?
            .try_into()?;

        mutation(&mut order)?;

        // Totals and line items are written once at insert time only.
        sqlx::query(
            "UPDATE orders SET status = $1, payment_status = $2, status_history = $3, updated_at = $4 WHERE order_id = $5",
        )
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(Json(&order.status_history))
        .bind(order.updated_at)
        .bind(&order.order_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(order)
    }
}
