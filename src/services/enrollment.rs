use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;

use super::{RequestHandler, Service};
use crate::errors::{ConflictKind, EngineError, Entity};
use crate::models::{
    memberships::Membership,
    plans::PlanCatalog,
    requests::{MembershipRequest, NewMembershipRequest, RequestStatus},
};
use crate::repositories::Store;
use crate::utils::{random_code_generator, CodeGenerator};

pub enum EnrollmentRequest {
    Submit {
        request: NewMembershipRequest,
        response: oneshot::Sender<Result<MembershipRequest, EngineError>>,
    },
    Approve {
        id: String,
        response: oneshot::Sender<Result<Membership, EngineError>>,
    },
    Reject {
        id: String,
        response: oneshot::Sender<Result<MembershipRequest, EngineError>>,
    },
    Get {
        id: String,
        response: oneshot::Sender<Result<MembershipRequest, EngineError>>,
    },
    List {
        status: Option<RequestStatus>,
        response: oneshot::Sender<Result<Vec<MembershipRequest>, EngineError>>,
    },
}

#[derive(Clone)]
pub struct EnrollmentRequestHandler {
    store: Arc<dyn Store>,
    catalog: Arc<PlanCatalog>,
    code_generator: CodeGenerator,
    max_code_attempts: u32,
}

impl EnrollmentRequestHandler {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<PlanCatalog>, max_code_attempts: u32) -> Self {
        EnrollmentRequestHandler {
            store,
            catalog,
            code_generator: random_code_generator(),
            max_code_attempts: max_code_attempts.max(1),
        }
    }

    pub fn with_code_generator(mut self, code_generator: CodeGenerator) -> Self {
        self.code_generator = code_generator;
        self
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub async fn submit(&self, new: NewMembershipRequest) -> Result<MembershipRequest, EngineError> {
        let request = MembershipRequest::submit(new, Utc::now())?;
        self.catalog.get(&request.plan_id)?;

        let request = self.store.insert_request(request).await?;
        log::info!(
            "Membership request {} submitted by {} for plan {}.",
            request.id,
            request.email,
            request.plan_id
        );

        Ok(request)
    }

    /// Approves a pending request and activates its membership under a fresh
    /// referral code. Code collisions are retried up to the configured bound.
    pub async fn approve(&self, id: &str) -> Result<Membership, EngineError> {
        let request = self.pending_request(id).await?;
        let plan = self.catalog.get(&request.plan_id)?;

        for attempt in 1..=self.max_code_attempts {
            let code = (self.code_generator)(&request.name);
            if self.store.referral_code_exists(&code).await? {
                log::debug!("Referral code {} taken (attempt {}).", code, attempt);
                continue;
            }

            let membership = Membership::activate(&request, plan, code, Utc::now());
            match self.store.activate_membership(&request.id, membership).await {
                Ok(membership) => {
                    log::info!(
                        "Membership request {} approved; {} activated with code {}.",
                        request.id,
                        membership.email,
                        membership.referral_code
                    );
                    return Ok(membership);
                }
                Err(EngineError::Conflict(ConflictKind::CodeTaken(code))) => {
                    log::debug!("Referral code {} raced (attempt {}).", code, attempt);
                }
                Err(e) => {
                    log::warn!("Approval of membership request {} failed: {}", request.id, e);
                    return Err(e);
                }
            }
        }

        log::error!(
            "Could not allocate a referral code for request {} after {} attempts.",
            request.id,
            self.max_code_attempts
        );
        Err(EngineError::Exhausted(self.max_code_attempts))
    }

    pub async fn reject(&self, id: &str) -> Result<MembershipRequest, EngineError> {
        let request = self.store.reject_request(id, Utc::now()).await?;
        log::info!("Membership request {} rejected.", request.id);

        Ok(request)
    }

    pub async fn get(&self, id: &str) -> Result<MembershipRequest, EngineError> {
        self.store
            .get_request(id)
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::MembershipRequest, id))
    }

    pub async fn list(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<MembershipRequest>, EngineError> {
        self.store.list_requests(status).await
    }

    async fn pending_request(&self, id: &str) -> Result<MembershipRequest, EngineError> {
        let request = self.get(id).await?;
        if !request.is_pending() {
            return Err(EngineError::Conflict(ConflictKind::AlreadyDecided(request.id)));
        }

        Ok(request)
    }
}

#[async_trait]
impl RequestHandler<EnrollmentRequest> for EnrollmentRequestHandler {
    async fn handle_request(&self, request: EnrollmentRequest) {
        match request {
            EnrollmentRequest::Submit { request, response } => {
                let result = self.submit(request).await;
                let _ = response.send(result);
            }
            EnrollmentRequest::Approve { id, response } => {
                let result = self.approve(&id).await;
                let _ = response.send(result);
            }
            EnrollmentRequest::Reject { id, response } => {
                let result = self.reject(&id).await;
                let _ = response.send(result);
            }
            EnrollmentRequest::Get { id, response } => {
                let result = self.get(&id).await;
                let _ = response.send(result);
            }
            EnrollmentRequest::List { status, response } => {
                let result = self.list(status).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct EnrollmentService;

impl EnrollmentService {
    pub fn new() -> Self {
        EnrollmentService {}
    }
}

#[async_trait]
impl Service<EnrollmentRequest, EnrollmentRequestHandler> for EnrollmentService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PreconditionKind;
    use crate::models::plans::tests::plan;
    use crate::models::requests::Identity;
    use crate::repositories::LocalStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler() -> EnrollmentRequestHandler {
        let catalog = PlanCatalog::new(vec![plan("gold", 5, 7)]).unwrap();
        EnrollmentRequestHandler::new(Arc::new(LocalStore::in_memory()), Arc::new(catalog), 3)
    }

    fn new_request(email: &str, plan_id: &str) -> NewMembershipRequest {
        NewMembershipRequest {
            identity: Identity {
                name: "Ravi Kumar".to_string(),
                email: email.to_string(),
                mobile: None,
            },
            plan_id: plan_id.to_string(),
            screenshot_url: "https://proofs.example.com/ravi.png".to_string(),
            referral_code: None,
        }
    }

    #[tokio::test]
    async fn unknown_plan_is_a_precondition_failure() {
        let err = handler()
            .submit(new_request("ravi@example.com", "platinum"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::PreconditionFailed(PreconditionKind::UnknownPlan(_))
        ));
    }

    #[tokio::test]
    async fn approval_retries_taken_codes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler().with_code_generator(Arc::new(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => "RAVAAAA".to_string(),
                _ => "RAVBBBB".to_string(),
            }
        }));

        let first = handler.submit(new_request("ravi@example.com", "gold")).await.unwrap();
        let second = handler.submit(new_request("asha@example.com", "gold")).await.unwrap();

        assert_eq!(handler.approve(&first.id).await.unwrap().referral_code, "RAVAAAA");
        assert_eq!(handler.approve(&second.id).await.unwrap().referral_code, "RAVBBBB");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn approval_gives_up_after_bounded_attempts() {
        let handler = handler().with_code_generator(Arc::new(|_| "RAVAAAA".to_string()));
        let first = handler.submit(new_request("ravi@example.com", "gold")).await.unwrap();
        let second = handler.submit(new_request("asha@example.com", "gold")).await.unwrap();
        handler.approve(&first.id).await.unwrap();

        let err = handler.approve(&second.id).await.unwrap_err();

        assert!(matches!(err, EngineError::Exhausted(3)));
        assert!(handler.get(&second.id).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn rejected_requests_cannot_be_approved() {
        let handler = handler();
        let request = handler.submit(new_request("ravi@example.com", "gold")).await.unwrap();

        handler.reject(&request.id).await.unwrap();
        let err = handler.approve(&request.id).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::Conflict(ConflictKind::AlreadyDecided(_))
        ));
    }
}
