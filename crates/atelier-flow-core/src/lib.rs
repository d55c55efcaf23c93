use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WorkflowError {
    #[error("bid {bid_id} has already been accepted or rejected")]
    DuplicateAcceptReject { bid_id: BidId },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("validation error: {0}")]
    Validation(String),
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        pub struct $name(pub Ulid);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                Display::fmt(&self.0, f)
            }
        }
    };
}

ulid_id!(CollectionId);
ulid_id!(DesignId);
ulid_id!(BidId);
ulid_id!(QuoteId);
ulid_id!(StepId);
ulid_id!(SubmissionId);
ulid_id!(UserId);
ulid_id!(TeamId);
ulid_id!(CollaboratorId);
ulid_id!(InvoiceId);
ulid_id!(CreditNoteId);
ulid_id!(CommentId);

/// Every kind of fact the design event log records. The set is closed:
/// unknown strings are rejected at the store boundary, not defaulted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DesignEventType {
    BidDesign,
    AcceptServiceBid,
    RejectServiceBid,
    RemovePartner,
    StepPartnerPairing,
    CommitCostInputs,
    CommitQuote,
    ReverseCheckout,
    RejectDesign,
    StepComplete,
    StepReopen,
    SubmissionAssignment,
    SubmissionSubmitted,
    SubmissionApproval,
    SubmissionRevisionRequest,
}

impl DesignEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BidDesign => "bid_design",
            Self::AcceptServiceBid => "accept_service_bid",
            Self::RejectServiceBid => "reject_service_bid",
            Self::RemovePartner => "remove_partner",
            Self::StepPartnerPairing => "step_partner_pairing",
            Self::CommitCostInputs => "commit_cost_inputs",
            Self::CommitQuote => "commit_quote",
            Self::ReverseCheckout => "reverse_checkout",
            Self::RejectDesign => "reject_design",
            Self::StepComplete => "step_complete",
            Self::StepReopen => "step_reopen",
            Self::SubmissionAssignment => "submission_assignment",
            Self::SubmissionSubmitted => "submission_submitted",
            Self::SubmissionApproval => "submission_approval",
            Self::SubmissionRevisionRequest => "submission_revision_request",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bid_design" => Some(Self::BidDesign),
            "accept_service_bid" => Some(Self::AcceptServiceBid),
            "reject_service_bid" => Some(Self::RejectServiceBid),
            "remove_partner" => Some(Self::RemovePartner),
            "step_partner_pairing" => Some(Self::StepPartnerPairing),
            "commit_cost_inputs" => Some(Self::CommitCostInputs),
            "commit_quote" => Some(Self::CommitQuote),
            "reverse_checkout" => Some(Self::ReverseCheckout),
            "reject_design" => Some(Self::RejectDesign),
            "step_complete" => Some(Self::StepComplete),
            "step_reopen" => Some(Self::StepReopen),
            "submission_assignment" => Some(Self::SubmissionAssignment),
            "submission_submitted" => Some(Self::SubmissionSubmitted),
            "submission_approval" => Some(Self::SubmissionApproval),
            "submission_revision_request" => Some(Self::SubmissionRevisionRequest),
            _ => None,
        }
    }

    /// Accept/reject are the two event types covered by the partial unique
    /// index on `bid_id`.
    #[must_use]
    pub fn is_bid_decision(self) -> bool {
        matches!(self, Self::AcceptServiceBid | Self::RejectServiceBid)
    }

    #[must_use]
    pub fn requires_bid(self) -> bool {
        matches!(
            self,
            Self::BidDesign
                | Self::AcceptServiceBid
                | Self::RejectServiceBid
                | Self::RemovePartner
        )
    }

    #[must_use]
    pub fn requires_step(self) -> bool {
        matches!(
            self,
            Self::StepPartnerPairing | Self::StepComplete | Self::StepReopen | Self::CommitQuote
        )
    }

    #[must_use]
    pub fn requires_submission(self) -> bool {
        matches!(
            self,
            Self::SubmissionAssignment
                | Self::SubmissionSubmitted
                | Self::SubmissionApproval
                | Self::SubmissionRevisionRequest
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DesignEvent {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub design_id: DesignId,
    pub event_type: DesignEventType,
    pub created_at: OffsetDateTime,
    pub actor_id: UserId,
    pub target_id: Option<UserId>,
    pub target_team_id: Option<TeamId>,
    pub bid_id: Option<BidId>,
    pub quote_id: Option<QuoteId>,
    pub step_id: Option<StepId>,
    pub submission_id: Option<SubmissionId>,
    pub comment_id: Option<CommentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DesignEventInput {
    pub event_id: Option<Ulid>,
    pub design_id: DesignId,
    pub event_type: DesignEventType,
    /// Explicit creation time; the store stamps `now` when absent.
    pub created_at: Option<OffsetDateTime>,
    pub actor_id: UserId,
    pub target_id: Option<UserId>,
    pub target_team_id: Option<TeamId>,
    pub bid_id: Option<BidId>,
    pub quote_id: Option<QuoteId>,
    pub step_id: Option<StepId>,
    pub submission_id: Option<SubmissionId>,
    pub comment_id: Option<CommentId>,
}

impl DesignEventInput {
    #[must_use]
    pub fn new(design_id: DesignId, event_type: DesignEventType, actor_id: UserId) -> Self {
        Self {
            event_id: None,
            design_id,
            event_type,
            created_at: None,
            actor_id,
            target_id: None,
            target_team_id: None,
            bid_id: None,
            quote_id: None,
            step_id: None,
            submission_id: None,
            comment_id: None,
        }
    }

    /// Validates a write event payload before append.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when the referential fields the
    /// event type requires are missing or violate schema constraints.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.event_type.requires_bid() && self.bid_id.is_none() {
            return Err(WorkflowError::Validation(format!(
                "{} requires bid_id",
                self.event_type.as_str()
            )));
        }

        if self.event_type.requires_step() && self.step_id.is_none() {
            return Err(WorkflowError::Validation(format!(
                "{} requires step_id",
                self.event_type.as_str()
            )));
        }

        if self.event_type.requires_submission() && self.submission_id.is_none() {
            return Err(WorkflowError::Validation(format!(
                "{} requires submission_id",
                self.event_type.as_str()
            )));
        }

        if matches!(self.event_type, DesignEventType::CommitQuote) && self.quote_id.is_none() {
            return Err(WorkflowError::Validation(
                "commit_quote requires quote_id".to_string(),
            ));
        }

        if self.target_id.is_some() && self.target_team_id.is_some() {
            return Err(WorkflowError::Validation(
                "target_id and target_team_id are mutually exclusive".to_string(),
            ));
        }

        if let Some(created_at) = self.created_at {
            if created_at.offset() != UtcOffset::UTC {
                return Err(WorkflowError::Validation(
                    "created_at MUST be UTC (offset Z)".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Checkout,
    TechnicalDesign,
    Sample,
    Production,
    Shipping,
}

impl StepType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::TechnicalDesign => "technical_design",
            Self::Sample => "sample",
            Self::Production => "production",
            Self::Shipping => "shipping",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "checkout" => Some(Self::Checkout),
            "technical_design" => Some(Self::TechnicalDesign),
            "sample" => Some(Self::Sample),
            "production" => Some(Self::Production),
            "shipping" => Some(Self::Shipping),
            _ => None,
        }
    }

    /// Steps owned by the production partner once a bid is accepted.
    #[must_use]
    pub fn is_partner_owned(self) -> bool {
        matches!(self, Self::Sample | Self::Production | Self::Shipping)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Blocked,
    Unstarted,
    Current,
    Completed,
    Skip,
}

impl StepState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Unstarted => "unstarted",
            Self::Current => "current",
            Self::Completed => "completed",
            Self::Skip => "skip",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "blocked" => Some(Self::Blocked),
            "unstarted" => Some(Self::Unstarted),
            "current" => Some(Self::Current),
            "completed" => Some(Self::Completed),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApprovalStep {
    pub id: StepId,
    pub design_id: DesignId,
    pub title: String,
    pub ordering: u32,
    pub step_type: StepType,
    pub state: StepState,
    pub reason: Option<String>,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub due_at: Option<OffsetDateTime>,
    pub collaborator_id: Option<CollaboratorId>,
    pub team_user_id: Option<UserId>,
}

impl ApprovalStep {
    /// A step is paired once someone owns it; pairing is the precondition
    /// that lets the cascade move it straight to `current`.
    #[must_use]
    pub fn is_partner_paired(&self) -> bool {
        self.collaborator_id.is_some() || self.team_user_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    TechnicalDesign,
    Sample,
    Custom,
}

impl ArtifactType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TechnicalDesign => "technical_design",
            Self::Sample => "sample",
            Self::Custom => "custom",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "technical_design" => Some(Self::TechnicalDesign),
            "sample" => Some(Self::Sample),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    Unsubmitted,
    Submitted,
    Approved,
    RevisionRequested,
    Skipped,
}

impl SubmissionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsubmitted => "unsubmitted",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::RevisionRequested => "revision_requested",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unsubmitted" => Some(Self::Unsubmitted),
            "submitted" => Some(Self::Submitted),
            "approved" => Some(Self::Approved),
            "revision_requested" => Some(Self::RevisionRequested),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApprovalStepSubmission {
    pub id: SubmissionId,
    pub step_id: StepId,
    pub artifact_type: ArtifactType,
    pub state: SubmissionState,
    pub collaborator_id: Option<CollaboratorId>,
    pub team_user_id: Option<UserId>,
    pub title: String,
}

/// A submission's assignee is exactly one of {collaborator, team user, none}.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when both are set.
pub fn validate_submission_assignee(
    collaborator_id: Option<CollaboratorId>,
    team_user_id: Option<UserId>,
) -> Result<(), WorkflowError> {
    if collaborator_id.is_some() && team_user_id.is_some() {
        return Err(WorkflowError::Validation(
            "submission assignee is exactly one of collaborator or team user".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BidAssignee {
    User(UserId),
    Team(TeamId),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Bid {
    pub id: BidId,
    pub quote_id: QuoteId,
    pub design_id: DesignId,
    pub created_at: OffsetDateTime,
    pub due_date: Option<OffsetDateTime>,
    pub assignee: BidAssignee,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BidState {
    Initial,
    Open,
    Accepted,
    Rejected,
    Removed,
    Expired,
}

impl BidState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Open => "open",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Removed => "removed",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initial" => Some(Self::Initial),
            "open" => Some(Self::Open),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "removed" => Some(Self::Removed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Removed)
    }
}

/// How long an undecided bid stays open before it expires.
pub const BID_EXPIRY: Duration = Duration::hours(24);

/// Strict half-open window: a bid aged exactly `BID_EXPIRY` is not yet
/// expired, one aged a millisecond longer is.
#[must_use]
pub fn is_expired(bid: &Bid, now: OffsetDateTime) -> bool {
    now - bid.created_at > BID_EXPIRY
}

/// Derives the bid lifecycle state from the bid's event history. Pure; the
/// log is the sole source of truth and nothing here is ever persisted.
///
/// Precedence is Removed > Accepted > Rejected > Expired > Open > Initial:
/// terminal human decisions override time-based expiry even for old bids.
#[must_use]
pub fn determine_bid_state(bid: &Bid, events: &[DesignEvent], now: OffsetDateTime) -> BidState {
    let has = |event_type: DesignEventType| {
        events
            .iter()
            .any(|event| event.event_type == event_type && event.bid_id == Some(bid.id))
    };

    if has(DesignEventType::RemovePartner) {
        return BidState::Removed;
    }
    if has(DesignEventType::AcceptServiceBid) {
        return BidState::Accepted;
    }
    if has(DesignEventType::RejectServiceBid) {
        return BidState::Rejected;
    }
    if is_expired(bid, now) {
        return BidState::Expired;
    }
    if has(DesignEventType::BidDesign) {
        return BidState::Open;
    }
    BidState::Initial
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProductComplexity {
    Blank,
    CutAndSew,
}

impl ProductComplexity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blank => "blank",
            Self::CutAndSew => "cut_and_sew",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "blank" => Some(Self::Blank),
            "cut_and_sew" => Some(Self::CutAndSew),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PlannedStep {
    pub title: &'static str,
    pub step_type: StepType,
    pub state: StepState,
}

/// The step template every design starts from. Blank products carry no
/// technical design work, so that step is created in `skip` and the cascade
/// bypasses it entirely.
#[must_use]
pub fn plan_steps(complexity: ProductComplexity) -> Vec<PlannedStep> {
    let technical_design_state = match complexity {
        ProductComplexity::Blank => StepState::Skip,
        ProductComplexity::CutAndSew => StepState::Blocked,
    };

    vec![
        PlannedStep {
            title: "Checkout",
            step_type: StepType::Checkout,
            state: StepState::Current,
        },
        PlannedStep {
            title: "Technical Design",
            step_type: StepType::TechnicalDesign,
            state: technical_design_state,
        },
        PlannedStep {
            title: "Sampling",
            step_type: StepType::Sample,
            state: StepState::Blocked,
        },
        PlannedStep {
            title: "Production",
            step_type: StepType::Production,
            state: StepState::Blocked,
        },
        PlannedStep {
            title: "Shipping",
            step_type: StepType::Shipping,
            state: StepState::Blocked,
        },
    ]
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PlannedSubmission {
    pub title: &'static str,
    pub artifact_type: ArtifactType,
    pub step_type: StepType,
}

/// Artifacts required once checkout completes. Blank designs need one
/// submission, cut-and-sew designs need two.
#[must_use]
pub fn plan_submissions(complexity: ProductComplexity) -> Vec<PlannedSubmission> {
    match complexity {
        ProductComplexity::Blank => vec![PlannedSubmission {
            title: "Sample",
            artifact_type: ArtifactType::Sample,
            step_type: StepType::Sample,
        }],
        ProductComplexity::CutAndSew => vec![
            PlannedSubmission {
                title: "Technical Design",
                artifact_type: ArtifactType::TechnicalDesign,
                step_type: StepType::TechnicalDesign,
            },
            PlannedSubmission {
                title: "Sample",
                artifact_type: ArtifactType::Sample,
                step_type: StepType::Sample,
            },
        ],
    }
}

/// The single transition implied by completing `completed` within `steps`
/// (which must be ordered by `ordering` ascending): the next non-skip step
/// leaves `blocked`, landing on `current` when partner-paired and
/// `unstarted` otherwise. Skipped steps never block downstream steps.
#[must_use]
pub fn unblock_after_completion(
    steps: &[ApprovalStep],
    completed: StepId,
) -> Option<(StepId, StepState)> {
    let index = steps.iter().position(|step| step.id == completed)?;

    for step in steps.iter().skip(index + 1) {
        if step.state == StepState::Skip {
            continue;
        }
        if step.state != StepState::Blocked {
            return None;
        }
        let next_state = if step.is_partner_paired() {
            StepState::Current
        } else {
            StepState::Unstarted
        };
        return Some((step.id, next_state));
    }

    None
}

/// Transitions to apply when reopening `reopened`: every later non-skip step
/// reverts to its pre-completion state (`unstarted` when paired, `blocked`
/// otherwise) in descending `ordering` order, then the reopened step itself
/// returns to `current`. No downstream step may remain completed while an
/// upstream one is open again.
#[must_use]
pub fn reopen_plan(steps: &[ApprovalStep], reopened: StepId) -> Vec<(StepId, StepState)> {
    let Some(index) = steps.iter().position(|step| step.id == reopened) else {
        return Vec::new();
    };

    let mut plan = Vec::new();
    for step in steps.iter().skip(index + 1).rev() {
        if matches!(step.state, StepState::Skip | StepState::Blocked) {
            continue;
        }
        let target = if step.is_partner_paired() {
            StepState::Unstarted
        } else {
            StepState::Blocked
        };
        if step.state != target {
            plan.push((step.id, target));
        }
    }

    plan.push((reopened, StepState::Current));
    plan
}

/// Transitions for a checkout reversal: every completed step of the design
/// comes back to `current`, in strictly descending `ordering` order.
#[must_use]
pub fn checkout_rollback_plan(steps: &[ApprovalStep]) -> Vec<(StepId, StepState)> {
    steps
        .iter()
        .rev()
        .filter(|step| step.state == StepState::Completed)
        .map(|step| (step.id, StepState::Current))
        .collect()
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, WorkflowError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| WorkflowError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(WorkflowError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, WorkflowError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            WorkflowError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_bid(created_at: OffsetDateTime) -> Bid {
        Bid {
            id: BidId(Ulid::new()),
            quote_id: QuoteId(Ulid::new()),
            design_id: DesignId(Ulid::new()),
            created_at,
            due_date: None,
            assignee: BidAssignee::User(UserId(Ulid::new())),
        }
    }

    fn fixture_event(bid: &Bid, seq: i64, event_type: DesignEventType) -> DesignEvent {
        DesignEvent {
            event_seq: seq,
            event_id: Ulid::new(),
            design_id: bid.design_id,
            event_type,
            created_at: must_utc("2026-08-01T12:00:00Z"),
            actor_id: UserId(Ulid::new()),
            target_id: None,
            target_team_id: None,
            bid_id: Some(bid.id),
            quote_id: None,
            step_id: None,
            submission_id: None,
            comment_id: None,
        }
    }

    fn fixture_step(ordering: u32, step_type: StepType, state: StepState) -> ApprovalStep {
        ApprovalStep {
            id: StepId(Ulid::new()),
            design_id: DesignId(Ulid::new()),
            title: step_type.as_str().to_string(),
            ordering,
            step_type,
            state,
            reason: None,
            started_at: None,
            completed_at: None,
            due_at: None,
            collaborator_id: None,
            team_user_id: None,
        }
    }

    #[test]
    fn fresh_bid_without_events_is_initial() {
        let now = must_utc("2026-08-01T12:00:00Z");
        let bid = fixture_bid(now);
        assert_eq!(determine_bid_state(&bid, &[], now), BidState::Initial);
    }

    #[test]
    fn bid_design_event_opens_the_bid() {
        let now = must_utc("2026-08-01T12:00:00Z");
        let bid = fixture_bid(now);
        let events = vec![fixture_event(&bid, 1, DesignEventType::BidDesign)];
        assert_eq!(determine_bid_state(&bid, &events, now), BidState::Open);
    }

    #[test]
    fn accept_dominates_expiry_for_old_bids() {
        let now = must_utc("2026-08-05T12:00:00Z");
        let bid = fixture_bid(must_utc("2026-08-01T12:00:00Z"));
        let events = vec![
            fixture_event(&bid, 1, DesignEventType::BidDesign),
            fixture_event(&bid, 2, DesignEventType::AcceptServiceBid),
        ];
        assert_eq!(determine_bid_state(&bid, &events, now), BidState::Accepted);
    }

    #[test]
    fn remove_partner_dominates_accept() {
        let now = must_utc("2026-08-01T13:00:00Z");
        let bid = fixture_bid(must_utc("2026-08-01T12:00:00Z"));
        let events = vec![
            fixture_event(&bid, 1, DesignEventType::AcceptServiceBid),
            fixture_event(&bid, 2, DesignEventType::RemovePartner),
        ];
        assert_eq!(determine_bid_state(&bid, &events, now), BidState::Removed);
    }

    #[test]
    fn reject_is_terminal_regardless_of_age() {
        let now = must_utc("2026-08-05T12:00:00Z");
        let bid = fixture_bid(must_utc("2026-08-01T12:00:00Z"));
        let events = vec![fixture_event(&bid, 1, DesignEventType::RejectServiceBid)];
        assert_eq!(determine_bid_state(&bid, &events, now), BidState::Rejected);
    }

    #[test]
    fn events_for_other_bids_are_ignored() {
        let now = must_utc("2026-08-01T12:30:00Z");
        let bid = fixture_bid(now);
        let other = fixture_bid(now);
        let events = vec![fixture_event(&other, 1, DesignEventType::AcceptServiceBid)];
        assert_eq!(determine_bid_state(&bid, &events, now), BidState::Initial);
    }

    #[test]
    fn expiry_boundary_is_half_open() {
        let created = must_utc("2026-08-01T12:00:00Z");
        let bid = fixture_bid(created);

        let exactly_24h = created + Duration::hours(24);
        assert!(!is_expired(&bid, exactly_24h));
        assert_eq!(determine_bid_state(&bid, &[], exactly_24h), BidState::Initial);

        let just_past = exactly_24h + Duration::milliseconds(1);
        assert!(is_expired(&bid, just_past));
        assert_eq!(determine_bid_state(&bid, &[], just_past), BidState::Expired);
    }

    #[test]
    fn undecided_open_bid_expires() {
        let created = must_utc("2026-08-01T12:00:00Z");
        let bid = fixture_bid(created);
        let events = vec![fixture_event(&bid, 1, DesignEventType::BidDesign)];
        let later = created + Duration::hours(25);
        assert_eq!(determine_bid_state(&bid, &events, later), BidState::Expired);
    }

    #[test]
    fn decision_events_require_a_bid_reference() {
        let input = DesignEventInput::new(
            DesignId(Ulid::new()),
            DesignEventType::AcceptServiceBid,
            UserId(Ulid::new()),
        );
        let result = input.validate();
        assert_eq!(
            result,
            Err(WorkflowError::Validation(
                "accept_service_bid requires bid_id".to_string()
            ))
        );
    }

    #[test]
    fn commit_quote_requires_quote_and_step() {
        let mut input = DesignEventInput::new(
            DesignId(Ulid::new()),
            DesignEventType::CommitQuote,
            UserId(Ulid::new()),
        );
        assert!(input.validate().is_err());

        input.step_id = Some(StepId(Ulid::new()));
        assert!(input.validate().is_err());

        input.quote_id = Some(QuoteId(Ulid::new()));
        assert!(input.validate().is_ok());
    }

    #[test]
    fn targets_are_mutually_exclusive() {
        let mut input = DesignEventInput::new(
            DesignId(Ulid::new()),
            DesignEventType::CommitCostInputs,
            UserId(Ulid::new()),
        );
        input.target_id = Some(UserId(Ulid::new()));
        input.target_team_id = Some(TeamId(Ulid::new()));
        assert!(input.validate().is_err());
    }

    #[test]
    fn completing_a_step_unblocks_the_next_one() {
        let mut steps = vec![
            fixture_step(0, StepType::Checkout, StepState::Completed),
            fixture_step(1, StepType::TechnicalDesign, StepState::Blocked),
            fixture_step(2, StepType::Sample, StepState::Blocked),
            fixture_step(3, StepType::Production, StepState::Blocked),
        ];
        steps[0].completed_at = Some(must_utc("2026-08-01T12:00:00Z"));

        let transition = unblock_after_completion(&steps, steps[0].id);
        assert_eq!(transition, Some((steps[1].id, StepState::Unstarted)));
    }

    #[test]
    fn paired_steps_unblock_straight_to_current() {
        let mut steps = vec![
            fixture_step(0, StepType::Checkout, StepState::Completed),
            fixture_step(1, StepType::Sample, StepState::Blocked),
        ];
        steps[1].collaborator_id = Some(CollaboratorId(Ulid::new()));

        let transition = unblock_after_completion(&steps, steps[0].id);
        assert_eq!(transition, Some((steps[1].id, StepState::Current)));
    }

    #[test]
    fn skipped_steps_are_bypassed_by_the_cascade() {
        let steps = vec![
            fixture_step(0, StepType::Checkout, StepState::Completed),
            fixture_step(1, StepType::TechnicalDesign, StepState::Skip),
            fixture_step(2, StepType::Sample, StepState::Blocked),
        ];

        let transition = unblock_after_completion(&steps, steps[0].id);
        assert_eq!(transition, Some((steps[2].id, StepState::Unstarted)));
    }

    #[test]
    fn cascade_stops_when_next_step_already_moved() {
        let steps = vec![
            fixture_step(0, StepType::Checkout, StepState::Completed),
            fixture_step(1, StepType::Sample, StepState::Current),
        ];
        assert_eq!(unblock_after_completion(&steps, steps[0].id), None);
    }

    #[test]
    fn reopen_reverts_downstream_in_descending_order() {
        let steps = vec![
            fixture_step(0, StepType::Checkout, StepState::Completed),
            fixture_step(1, StepType::TechnicalDesign, StepState::Completed),
            fixture_step(2, StepType::Sample, StepState::Completed),
            fixture_step(3, StepType::Production, StepState::Current),
        ];

        let plan = reopen_plan(&steps, steps[1].id);
        assert_eq!(
            plan,
            vec![
                (steps[3].id, StepState::Blocked),
                (steps[2].id, StepState::Blocked),
                (steps[1].id, StepState::Current),
            ]
        );
    }

    #[test]
    fn reopen_keeps_paired_steps_unstarted() {
        let mut steps = vec![
            fixture_step(0, StepType::Checkout, StepState::Completed),
            fixture_step(1, StepType::Sample, StepState::Completed),
        ];
        steps[1].collaborator_id = Some(CollaboratorId(Ulid::new()));

        let plan = reopen_plan(&steps, steps[0].id);
        assert_eq!(
            plan,
            vec![
                (steps[1].id, StepState::Unstarted),
                (steps[0].id, StepState::Current),
            ]
        );
    }

    #[test]
    fn checkout_rollback_targets_completed_steps_descending() {
        let steps = vec![
            fixture_step(0, StepType::Checkout, StepState::Completed),
            fixture_step(1, StepType::TechnicalDesign, StepState::Skip),
            fixture_step(2, StepType::Sample, StepState::Completed),
            fixture_step(3, StepType::Production, StepState::Unstarted),
        ];

        let plan = checkout_rollback_plan(&steps);
        assert_eq!(
            plan,
            vec![
                (steps[2].id, StepState::Current),
                (steps[0].id, StepState::Current),
            ]
        );
    }

    #[test]
    fn blank_designs_need_fewer_submissions_than_cut_and_sew() {
        assert_eq!(plan_submissions(ProductComplexity::Blank).len(), 1);
        assert_eq!(plan_submissions(ProductComplexity::CutAndSew).len(), 2);
    }

    #[test]
    fn blank_designs_skip_technical_design() {
        let planned = plan_steps(ProductComplexity::Blank);
        let technical = planned
            .iter()
            .find(|step| step.step_type == StepType::TechnicalDesign);
        match technical {
            Some(step) => assert_eq!(step.state, StepState::Skip),
            None => panic!("template is missing the technical design step"),
        }
    }

    #[test]
    fn event_type_strings_round_trip() {
        for event_type in [
            DesignEventType::BidDesign,
            DesignEventType::AcceptServiceBid,
            DesignEventType::RejectServiceBid,
            DesignEventType::RemovePartner,
            DesignEventType::StepPartnerPairing,
            DesignEventType::CommitCostInputs,
            DesignEventType::CommitQuote,
            DesignEventType::ReverseCheckout,
            DesignEventType::RejectDesign,
            DesignEventType::StepComplete,
            DesignEventType::StepReopen,
            DesignEventType::SubmissionAssignment,
            DesignEventType::SubmissionSubmitted,
            DesignEventType::SubmissionApproval,
            DesignEventType::SubmissionRevisionRequest,
        ] {
            assert_eq!(DesignEventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(DesignEventType::parse("unknown"), None);
    }

    #[test]
    fn submission_assignee_is_exclusive() {
        assert!(validate_submission_assignee(None, None).is_ok());
        assert!(validate_submission_assignee(Some(CollaboratorId(Ulid::new())), None).is_ok());
        assert!(validate_submission_assignee(
            Some(CollaboratorId(Ulid::new())),
            Some(UserId(Ulid::new()))
        )
        .is_err());
    }
}
