#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{Context, Result};
use atelier_flow_core::{
    checkout_rollback_plan, determine_bid_state, now_utc, plan_steps, plan_submissions,
    reopen_plan, unblock_after_completion, validate_submission_assignee, ApprovalStep,
    ApprovalStepSubmission, ArtifactType, Bid, BidAssignee, BidId, BidState, CollaboratorId,
    CollectionId, CommentId, CreditNoteId, DesignEvent, DesignEventInput, DesignEventType,
    DesignId, InvoiceId, ProductComplexity, QuoteId, StepId, StepState, StepType, SubmissionId,
    SubmissionState, TeamId, UserId, WorkflowError,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use ulid::Ulid;

const FLOW_MIGRATION_VERSION: i64 = 1;

// Fixed-width UTC layout: lexicographic TEXT ordering equals chronological
// ordering, and six subsecond digits keep the millisecond expiry boundary.
const TS_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

const SCHEMA_FLOW_V1: &str = r"
CREATE TABLE IF NOT EXISTS collections (
  collection_id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS designs (
  design_id TEXT PRIMARY KEY,
  collection_id TEXT,
  complexity TEXT NOT NULL CHECK (complexity IN ('blank', 'cut_and_sew')),
  deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1)),
  created_at TEXT NOT NULL,
  FOREIGN KEY (collection_id) REFERENCES collections(collection_id)
);

CREATE TABLE IF NOT EXISTS pricing_quotes (
  quote_id TEXT PRIMARY KEY,
  design_id TEXT NOT NULL,
  unit_cost_cents INTEGER NOT NULL CHECK (unit_cost_cents >= 0),
  created_at TEXT NOT NULL,
  FOREIGN KEY (design_id) REFERENCES designs(design_id)
);

CREATE TABLE IF NOT EXISTS cost_inputs (
  cost_input_id TEXT PRIMARY KEY,
  design_id TEXT NOT NULL,
  expired_at TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (design_id) REFERENCES designs(design_id)
);

CREATE TABLE IF NOT EXISTS bids (
  bid_id TEXT PRIMARY KEY,
  quote_id TEXT NOT NULL,
  design_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  due_date TEXT,
  assignee_user_id TEXT,
  assignee_team_id TEXT,
  CHECK ((assignee_user_id IS NULL) <> (assignee_team_id IS NULL)),
  FOREIGN KEY (quote_id) REFERENCES pricing_quotes(quote_id),
  FOREIGN KEY (design_id) REFERENCES designs(design_id)
);

CREATE TABLE IF NOT EXISTS collaborators (
  collaborator_id TEXT PRIMARY KEY,
  design_id TEXT NOT NULL,
  user_id TEXT,
  team_id TEXT,
  cancelled_at TEXT,
  created_at TEXT NOT NULL,
  CHECK ((user_id IS NULL) <> (team_id IS NULL)),
  FOREIGN KEY (design_id) REFERENCES designs(design_id)
);

CREATE TABLE IF NOT EXISTS approval_steps (
  step_id TEXT PRIMARY KEY,
  design_id TEXT NOT NULL,
  title TEXT NOT NULL,
  ordering INTEGER NOT NULL CHECK (ordering >= 0),
  step_type TEXT NOT NULL CHECK (
    step_type IN ('checkout', 'technical_design', 'sample', 'production', 'shipping')
  ),
  state TEXT NOT NULL CHECK (
    state IN ('blocked', 'unstarted', 'current', 'completed', 'skip')
  ),
  reason TEXT,
  started_at TEXT,
  completed_at TEXT,
  due_at TEXT,
  collaborator_id TEXT,
  team_user_id TEXT,
  UNIQUE (design_id, ordering),
  FOREIGN KEY (design_id) REFERENCES designs(design_id),
  FOREIGN KEY (collaborator_id) REFERENCES collaborators(collaborator_id)
);

CREATE TABLE IF NOT EXISTS approval_step_submissions (
  submission_id TEXT PRIMARY KEY,
  step_id TEXT NOT NULL,
  artifact_type TEXT NOT NULL CHECK (
    artifact_type IN ('technical_design', 'sample', 'custom')
  ),
  state TEXT NOT NULL CHECK (
    state IN ('unsubmitted', 'submitted', 'approved', 'revision_requested', 'skipped')
  ),
  collaborator_id TEXT,
  team_user_id TEXT,
  title TEXT NOT NULL,
  created_at TEXT NOT NULL,
  CHECK (collaborator_id IS NULL OR team_user_id IS NULL),
  FOREIGN KEY (step_id) REFERENCES approval_steps(step_id),
  FOREIGN KEY (collaborator_id) REFERENCES collaborators(collaborator_id)
);

CREATE TABLE IF NOT EXISTS design_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  design_id TEXT NOT NULL,
  event_type TEXT NOT NULL CHECK (
    event_type IN (
      'bid_design',
      'accept_service_bid',
      'reject_service_bid',
      'remove_partner',
      'step_partner_pairing',
      'commit_cost_inputs',
      'commit_quote',
      'reverse_checkout',
      'reject_design',
      'step_complete',
      'step_reopen',
      'submission_assignment',
      'submission_submitted',
      'submission_approval',
      'submission_revision_request'
    )
  ),
  created_at TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  target_id TEXT,
  target_team_id TEXT,
  bid_id TEXT,
  quote_id TEXT,
  step_id TEXT,
  submission_id TEXT,
  comment_id TEXT,
  FOREIGN KEY (design_id) REFERENCES designs(design_id),
  FOREIGN KEY (bid_id) REFERENCES bids(bid_id),
  FOREIGN KEY (quote_id) REFERENCES pricing_quotes(quote_id),
  FOREIGN KEY (step_id) REFERENCES approval_steps(step_id),
  FOREIGN KEY (submission_id) REFERENCES approval_step_submissions(submission_id)
);

CREATE TRIGGER IF NOT EXISTS trg_design_events_no_update
BEFORE UPDATE ON design_events
BEGIN
  SELECT RAISE(FAIL, 'design_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_design_events_no_delete
BEFORE DELETE ON design_events
BEGIN
  SELECT RAISE(FAIL, 'design_events is append-only');
END;

CREATE UNIQUE INDEX IF NOT EXISTS uq_design_events_bid_decision
  ON design_events(bid_id)
  WHERE event_type IN ('accept_service_bid', 'reject_service_bid');

CREATE INDEX IF NOT EXISTS idx_design_events_design_created
  ON design_events(design_id, created_at, event_seq);
CREATE INDEX IF NOT EXISTS idx_design_events_bid_created
  ON design_events(bid_id, created_at, event_seq);
CREATE INDEX IF NOT EXISTS idx_design_events_step_created
  ON design_events(step_id, created_at, event_seq);
CREATE INDEX IF NOT EXISTS idx_design_events_submission_created
  ON design_events(submission_id, created_at, event_seq);

CREATE TABLE IF NOT EXISTS invoices (
  invoice_id TEXT PRIMARY KEY,
  collection_id TEXT NOT NULL,
  total_cents INTEGER NOT NULL CHECK (total_cents >= 0),
  created_at TEXT NOT NULL,
  FOREIGN KEY (collection_id) REFERENCES collections(collection_id)
);

CREATE TABLE IF NOT EXISTS credit_notes (
  credit_note_id TEXT PRIMARY KEY,
  invoice_id TEXT NOT NULL,
  total_cents INTEGER NOT NULL CHECK (total_cents >= 0),
  created_at TEXT NOT NULL,
  FOREIGN KEY (invoice_id) REFERENCES invoices(invoice_id)
);
";

const SELECT_EVENT_COLUMNS: &str = "SELECT
    event_seq, event_id, design_id, event_type, created_at, actor_id,
    target_id, target_team_id, bid_id, quote_id, step_id, submission_id, comment_id
 FROM design_events";

const SELECT_STEP_COLUMNS: &str = "SELECT
    step_id, design_id, title, ordering, step_type, state, reason,
    started_at, completed_at, due_at, collaborator_id, team_user_id
 FROM approval_steps";

const SELECT_SUBMISSION_COLUMNS: &str = "SELECT
    submission_id, step_id, artifact_type, state, collaborator_id, team_user_id, title
 FROM approval_step_submissions";

const SELECT_BID_COLUMNS: &str = "SELECT
    bid_id, quote_id, design_id, created_at, due_date, assignee_user_id, assignee_team_id
 FROM bids";

pub struct SqliteWorkflowStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Design {
    pub id: DesignId,
    pub collection_id: Option<CollectionId>,
    pub complexity: ProductComplexity,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub design_id: Option<DesignId>,
    pub bid_id: Option<BidId>,
    pub event_types: Vec<DesignEventType>,
}

/// Partial update for an approval step. Outer `None` leaves a field alone;
/// the nested option writes NULL. `started_at`/`completed_at` are stamped by
/// the update path itself so they cannot drift from the state column.
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub state: Option<StepState>,
    pub reason: Option<Option<String>>,
    pub collaborator_id: Option<Option<CollaboratorId>>,
    pub team_user_id: Option<Option<UserId>>,
    pub due_at: Option<Option<OffsetDateTime>>,
}

impl StepPatch {
    #[must_use]
    pub fn state(state: StepState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

/// Side effects fired synchronously after every step write, in order. This
/// list is the whole cascade registry; there is no dynamic registration.
pub const STEP_UPDATE_LISTENERS: &[StepListener] = &[unblock_following_step];

pub type StepListener = fn(&Connection, &ApprovalStep, &ApprovalStep) -> Result<()>;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BidAcceptance {
    pub bid_id: BidId,
    pub collaborator_id: CollaboratorId,
    pub events: Vec<DesignEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuoteCommit {
    pub event: DesignEvent,
    pub checkout_step: ApprovalStep,
    pub submissions: Vec<ApprovalStepSubmission>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SubmissionChange {
    pub submission: ApprovalStepSubmission,
    pub event: DesignEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckoutReversal {
    pub invoice_id: InvoiceId,
    pub credit_note_id: CreditNoteId,
    pub credited_cents: i64,
    pub reversed_designs: Vec<DesignId>,
    pub events: Vec<DesignEvent>,
}

enum InvoiceScan {
    NoInvoices,
    AllCredited,
    Active {
        invoice_id: InvoiceId,
        remaining_cents: i64,
    },
}

impl SqliteWorkflowStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_FLOW_V1)
            .context("failed to apply workflow schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![FLOW_MIGRATION_VERSION, fmt_ts(now_utc())?],
            )
            .context("failed to register workflow schema migration")?;

        Ok(())
    }

    pub fn create_collection(&mut self) -> Result<CollectionId> {
        let collection_id = CollectionId(Ulid::new());
        self.conn
            .execute(
                "INSERT INTO collections(collection_id, created_at) VALUES (?1, ?2)",
                params![collection_id.to_string(), fmt_ts(now_utc())?],
            )
            .context("failed to insert collection")?;
        Ok(collection_id)
    }

    /// Creates a design together with its full approval-step pipeline; the
    /// steps for a design only ever come into existence as one batch.
    pub fn create_design(
        &mut self,
        collection_id: Option<CollectionId>,
        complexity: ProductComplexity,
    ) -> Result<Design> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start design transaction")?;

        if let Some(collection_id) = collection_id {
            ensure_collection_tx(&tx, collection_id)?;
        }

        let design = Design {
            id: DesignId(Ulid::new()),
            collection_id,
            complexity,
            deleted: false,
        };
        let now = now_utc();

        tx.execute(
            "INSERT INTO designs(design_id, collection_id, complexity, deleted, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                design.id.to_string(),
                design.collection_id.map(|id| id.to_string()),
                design.complexity.as_str(),
                fmt_ts(now)?,
            ],
        )
        .context("failed to insert design")?;

        for (ordering, planned) in plan_steps(complexity).iter().enumerate() {
            let started_at = if planned.state == StepState::Current {
                Some(fmt_ts(now)?)
            } else {
                None
            };
            tx.execute(
                "INSERT INTO approval_steps(
                    step_id, design_id, title, ordering, step_type, state, started_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    StepId(Ulid::new()).to_string(),
                    design.id.to_string(),
                    planned.title,
                    i64::try_from(ordering).context("step ordering overflow")?,
                    planned.step_type.as_str(),
                    planned.state.as_str(),
                    started_at,
                ],
            )
            .context("failed to insert approval step")?;
        }

        tx.commit().context("failed to commit design transaction")?;
        Ok(design)
    }

    pub fn create_quote(&mut self, design_id: DesignId, unit_cost_cents: i64) -> Result<QuoteId> {
        get_design_tx(&self.conn, design_id)?;
        let quote_id = QuoteId(Ulid::new());
        self.conn
            .execute(
                "INSERT INTO pricing_quotes(quote_id, design_id, unit_cost_cents, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    quote_id.to_string(),
                    design_id.to_string(),
                    unit_cost_cents,
                    fmt_ts(now_utc())?,
                ],
            )
            .context("failed to insert pricing quote")?;
        Ok(quote_id)
    }

    pub fn create_invoice(
        &mut self,
        collection_id: CollectionId,
        total_cents: i64,
    ) -> Result<InvoiceId> {
        ensure_collection_tx(&self.conn, collection_id)?;
        let invoice_id = InvoiceId(Ulid::new());
        self.conn
            .execute(
                "INSERT INTO invoices(invoice_id, collection_id, total_cents, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    invoice_id.to_string(),
                    collection_id.to_string(),
                    total_cents,
                    fmt_ts(now_utc())?,
                ],
            )
            .context("failed to insert invoice")?;
        Ok(invoice_id)
    }

    /// Creates a bid against a pricing quote. The immediate transaction takes
    /// the writer lock up front, so concurrent creators against the same
    /// quote block on `busy_timeout` until the holder commits.
    pub fn create_bid(
        &mut self,
        quote_id: QuoteId,
        actor_id: UserId,
        assignee: BidAssignee,
        due_date: Option<OffsetDateTime>,
    ) -> Result<Bid> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start bid transaction")?;

        let design_id = quote_design_tx(&tx, quote_id)?;
        let bid = Bid {
            id: BidId(Ulid::new()),
            quote_id,
            design_id,
            created_at: truncate_to_micros(now_utc())?,
            due_date,
            assignee,
        };

        let (assignee_user, assignee_team) = match assignee {
            BidAssignee::User(user_id) => (Some(user_id.to_string()), None),
            BidAssignee::Team(team_id) => (None, Some(team_id.to_string())),
        };

        tx.execute(
            "INSERT INTO bids(
                bid_id, quote_id, design_id, created_at, due_date,
                assignee_user_id, assignee_team_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                bid.id.to_string(),
                quote_id.to_string(),
                design_id.to_string(),
                fmt_ts(bid.created_at)?,
                bid.due_date.map(fmt_ts).transpose()?,
                assignee_user,
                assignee_team,
            ],
        )
        .context("failed to insert bid")?;

        let mut input = DesignEventInput::new(design_id, DesignEventType::BidDesign, actor_id);
        input.bid_id = Some(bid.id);
        input.quote_id = Some(quote_id);
        apply_bid_target(&mut input, assignee);
        append_event_tx(&tx, &input)?;

        tx.commit().context("failed to commit bid transaction")?;
        Ok(bid)
    }

    pub fn append_event(&mut self, input: &DesignEventInput) -> Result<DesignEvent> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start event transaction")?;
        let event = append_event_tx(&tx, input)?;
        tx.commit().context("failed to commit event transaction")?;
        Ok(event)
    }

    /// Batch append with no partial application: either every input lands or
    /// the transaction fails whole.
    pub fn append_events(&mut self, inputs: &[DesignEventInput]) -> Result<Vec<DesignEvent>> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start batch event transaction")?;
        let mut events = Vec::with_capacity(inputs.len());
        for input in inputs {
            events.push(append_event_tx(&tx, input)?);
        }
        tx.commit()
            .context("failed to commit batch event transaction")?;
        Ok(events)
    }

    pub fn find_events(&self, filter: &EventFilter) -> Result<Vec<DesignEvent>> {
        let mut clauses = Vec::new();
        let mut bindings: Vec<String> = Vec::new();

        if let Some(design_id) = filter.design_id {
            bindings.push(design_id.to_string());
            clauses.push(format!("design_id = ?{}", bindings.len()));
        }
        if let Some(bid_id) = filter.bid_id {
            bindings.push(bid_id.to_string());
            clauses.push(format!("bid_id = ?{}", bindings.len()));
        }
        if !filter.event_types.is_empty() {
            let list = filter
                .event_types
                .iter()
                .map(|event_type| format!("'{}'", event_type.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            clauses.push(format!("event_type IN ({list})"));
        }

        let mut query = SELECT_EVENT_COLUMNS.to_string();
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY created_at ASC, event_seq ASC");

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(bindings), parse_event_row)?;
        collect_rows(rows)
    }

    pub fn find_event_by_id(&self, event_id: Ulid) -> Result<Option<DesignEvent>> {
        let query = format!("{SELECT_EVENT_COLUMNS} WHERE event_id = ?1");
        let mut stmt = self.conn.prepare(&query)?;
        let event = stmt
            .query_row(params![event_id.to_string()], parse_event_row)
            .optional()?;
        Ok(event)
    }

    pub fn find_bid_events(&self, bid_id: BidId) -> Result<Vec<DesignEvent>> {
        bid_events_tx(&self.conn, bid_id)
    }

    pub fn find_step_events(&self, step_id: StepId) -> Result<Vec<DesignEvent>> {
        let query =
            format!("{SELECT_EVENT_COLUMNS} WHERE step_id = ?1 ORDER BY created_at ASC, event_seq ASC");
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![step_id.to_string()], parse_event_row)?;
        collect_rows(rows)
    }

    pub fn find_submission_events(&self, submission_id: SubmissionId) -> Result<Vec<DesignEvent>> {
        let query = format!(
            "{SELECT_EVENT_COLUMNS} WHERE submission_id = ?1 ORDER BY created_at ASC, event_seq ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![submission_id.to_string()], parse_event_row)?;
        collect_rows(rows)
    }

    pub fn get_design(&self, design_id: DesignId) -> Result<Design> {
        get_design_tx(&self.conn, design_id)
    }

    pub fn get_bid(&self, bid_id: BidId) -> Result<Bid> {
        get_bid_tx(&self.conn, bid_id)
    }

    /// Derives the bid state from the log as of `now`. Never cached, never
    /// stored.
    pub fn bid_state_at(&self, bid_id: BidId, now: OffsetDateTime) -> Result<BidState> {
        let bid = get_bid_tx(&self.conn, bid_id)?;
        let events = bid_events_tx(&self.conn, bid_id)?;
        Ok(determine_bid_state(&bid, &events, now))
    }

    pub fn bid_state(&self, bid_id: BidId) -> Result<BidState> {
        self.bid_state_at(bid_id, now_utc())
    }

    pub fn steps_for_design(&self, design_id: DesignId) -> Result<Vec<ApprovalStep>> {
        steps_for_design_tx(&self.conn, design_id)
    }

    pub fn get_step(&self, step_id: StepId) -> Result<ApprovalStep> {
        get_step_tx(&self.conn, step_id)
    }

    pub fn update_step(&mut self, step_id: StepId, patch: &StepPatch) -> Result<ApprovalStep> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start step transaction")?;
        let updated = update_step_tx(&tx, step_id, patch)?;
        tx.commit().context("failed to commit step transaction")?;
        Ok(updated)
    }

    pub fn submissions_for_step(&self, step_id: StepId) -> Result<Vec<ApprovalStepSubmission>> {
        let query = format!(
            "{SELECT_SUBMISSION_COLUMNS} WHERE step_id = ?1 ORDER BY created_at ASC, submission_id ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![step_id.to_string()], parse_submission_row)?;
        collect_rows(rows)
    }

    pub fn get_submission(&self, submission_id: SubmissionId) -> Result<ApprovalStepSubmission> {
        get_submission_tx(&self.conn, submission_id)
    }

    /// Accepts a bid. The read-side precondition gives a friendly error for
    /// an already-decided bid, but the race guard is the partial unique
    /// decision index: of two concurrent accepts exactly one insert wins and
    /// the loser's whole transaction (collaborator, pairing, everything)
    /// rolls back with [`WorkflowError::DuplicateAcceptReject`].
    pub fn accept_bid(&mut self, bid_id: BidId, actor_id: UserId) -> Result<BidAcceptance> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start accept transaction")?;

        let bid = get_bid_tx(&tx, bid_id)?;
        let events = bid_events_tx(&tx, bid_id)?;
        match determine_bid_state(&bid, &events, now_utc()) {
            BidState::Accepted | BidState::Rejected => {
                return Err(anyhow::Error::new(WorkflowError::DuplicateAcceptReject {
                    bid_id,
                }));
            }
            BidState::Removed => {
                return Err(conflict(format!(
                    "bid {bid_id} was removed and can no longer be accepted"
                )));
            }
            BidState::Initial | BidState::Open | BidState::Expired => {}
        }

        let mut appended = Vec::new();

        if !events
            .iter()
            .any(|event| event.event_type == DesignEventType::BidDesign)
        {
            let mut open = DesignEventInput::new(bid.design_id, DesignEventType::BidDesign, actor_id);
            open.bid_id = Some(bid_id);
            open.quote_id = Some(bid.quote_id);
            apply_bid_target(&mut open, bid.assignee);
            appended.push(append_event_tx(&tx, &open)?);
        }

        let mut accept =
            DesignEventInput::new(bid.design_id, DesignEventType::AcceptServiceBid, actor_id);
        accept.bid_id = Some(bid_id);
        accept.quote_id = Some(bid.quote_id);
        apply_bid_target(&mut accept, bid.assignee);
        appended.push(append_event_tx(&tx, &accept)?);

        let collaborator_id = activate_collaborator_tx(&tx, bid.design_id, bid.assignee)?;

        let steps = steps_for_design_tx(&tx, bid.design_id)?;
        for step in steps {
            if !step.step_type.is_partner_owned() || step.state == StepState::Skip {
                continue;
            }
            update_step_tx(
                &tx,
                step.id,
                &StepPatch {
                    collaborator_id: Some(Some(collaborator_id)),
                    ..StepPatch::default()
                },
            )?;

            let mut pairing = DesignEventInput::new(
                bid.design_id,
                DesignEventType::StepPartnerPairing,
                actor_id,
            );
            pairing.bid_id = Some(bid_id);
            pairing.step_id = Some(step.id);
            apply_bid_target(&mut pairing, bid.assignee);
            appended.push(append_event_tx(&tx, &pairing)?);
        }

        tx.commit().context("failed to commit accept transaction")?;
        Ok(BidAcceptance {
            bid_id,
            collaborator_id,
            events: appended,
        })
    }

    /// Rejects a bid. A rejection never advances the pipeline: step states
    /// stay untouched and only the collaborator association is cancelled.
    pub fn reject_bid(&mut self, bid_id: BidId, actor_id: UserId) -> Result<DesignEvent> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start reject transaction")?;

        let bid = get_bid_tx(&tx, bid_id)?;
        if let BidAssignee::User(assignee_id) = bid.assignee {
            if assignee_id != actor_id {
                return Err(invalid_state(format!(
                    "bid {bid_id} is not assigned to actor {actor_id}"
                )));
            }
        }

        let events = bid_events_tx(&tx, bid_id)?;
        match determine_bid_state(&bid, &events, now_utc()) {
            BidState::Accepted | BidState::Rejected => {
                return Err(anyhow::Error::new(WorkflowError::DuplicateAcceptReject {
                    bid_id,
                }));
            }
            BidState::Removed => {
                return Err(conflict(format!(
                    "bid {bid_id} was removed and can no longer be rejected"
                )));
            }
            BidState::Initial | BidState::Open | BidState::Expired => {}
        }

        let mut reject =
            DesignEventInput::new(bid.design_id, DesignEventType::RejectServiceBid, actor_id);
        reject.bid_id = Some(bid_id);
        reject.quote_id = Some(bid.quote_id);
        apply_bid_target(&mut reject, bid.assignee);
        let event = append_event_tx(&tx, &reject)?;

        cancel_collaborator_tx(&tx, bid.design_id, bid.assignee)?;

        tx.commit().context("failed to commit reject transaction")?;
        Ok(event)
    }

    /// Removes an accepted partner from the design. Terminal: the derived
    /// bid state becomes `removed` and dominates everything else.
    pub fn remove_partner(&mut self, bid_id: BidId, actor_id: UserId) -> Result<DesignEvent> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start remove-partner transaction")?;

        let bid = get_bid_tx(&tx, bid_id)?;
        let events = bid_events_tx(&tx, bid_id)?;
        let state = determine_bid_state(&bid, &events, now_utc());
        if state != BidState::Accepted {
            return Err(invalid_state(format!(
                "bid {bid_id} must be accepted to remove the partner, found {}",
                state.as_str()
            )));
        }

        let mut removal =
            DesignEventInput::new(bid.design_id, DesignEventType::RemovePartner, actor_id);
        removal.bid_id = Some(bid_id);
        apply_bid_target(&mut removal, bid.assignee);
        let event = append_event_tx(&tx, &removal)?;

        cancel_collaborator_tx(&tx, bid.design_id, bid.assignee)?;

        let steps = steps_for_design_tx(&tx, bid.design_id)?;
        for step in steps {
            if !step.step_type.is_partner_owned()
                || step.state == StepState::Completed
                || !step.is_partner_paired()
            {
                continue;
            }
            update_step_tx(
                &tx,
                step.id,
                &StepPatch {
                    collaborator_id: Some(None),
                    team_user_id: Some(None),
                    ..StepPatch::default()
                },
            )?;
        }

        tx.commit()
            .context("failed to commit remove-partner transaction")?;
        Ok(event)
    }

    pub fn commit_cost_inputs(
        &mut self,
        design_id: DesignId,
        actor_id: UserId,
    ) -> Result<DesignEvent> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start cost-input transaction")?;

        get_design_tx(&tx, design_id)?;
        tx.execute(
            "INSERT INTO cost_inputs(cost_input_id, design_id, created_at) VALUES (?1, ?2, ?3)",
            params![
                Ulid::new().to_string(),
                design_id.to_string(),
                fmt_ts(now_utc())?,
            ],
        )
        .context("failed to insert cost inputs")?;

        let input = DesignEventInput::new(design_id, DesignEventType::CommitCostInputs, actor_id);
        let event = append_event_tx(&tx, &input)?;

        tx.commit()
            .context("failed to commit cost-input transaction")?;
        Ok(event)
    }

    /// Commits a quote on the design's checkout step: the step completes,
    /// the cascade unblocks the next step, and the submissions the later
    /// steps require come into existence (one for blank designs, two for
    /// cut-and-sew).
    pub fn commit_quote(
        &mut self,
        design_id: DesignId,
        quote_id: QuoteId,
        actor_id: UserId,
    ) -> Result<QuoteCommit> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start quote transaction")?;

        let design = get_design_tx(&tx, design_id)?;
        let quote_design = quote_design_tx(&tx, quote_id)?;
        if quote_design != design_id {
            return Err(anyhow::Error::new(WorkflowError::Validation(format!(
                "quote {quote_id} does not belong to design {design_id}"
            ))));
        }

        let steps = steps_for_design_tx(&tx, design_id)?;
        let checkout = steps
            .iter()
            .find(|step| step.step_type == StepType::Checkout)
            .ok_or_else(|| not_found(format!("checkout step for design {design_id}")))?;
        if checkout.state == StepState::Completed {
            return Err(conflict(format!(
                "checkout step for design {design_id} is already completed"
            )));
        }

        let mut input = DesignEventInput::new(design_id, DesignEventType::CommitQuote, actor_id);
        input.quote_id = Some(quote_id);
        input.step_id = Some(checkout.id);
        let event = append_event_tx(&tx, &input)?;

        let checkout_step =
            update_step_tx(&tx, checkout.id, &StepPatch::state(StepState::Completed))?;

        let mut submissions = Vec::new();
        let steps = steps_for_design_tx(&tx, design_id)?;
        for planned in plan_submissions(design.complexity) {
            let Some(target) = steps
                .iter()
                .find(|step| step.step_type == planned.step_type && step.state != StepState::Skip)
            else {
                continue;
            };
            submissions.push(create_submission_tx(
                &tx,
                target.id,
                planned.artifact_type,
                planned.title,
            )?);
        }

        tx.commit().context("failed to commit quote transaction")?;
        Ok(QuoteCommit {
            event,
            checkout_step,
            submissions,
        })
    }

    pub fn complete_step(
        &mut self,
        step_id: StepId,
        actor_id: UserId,
    ) -> Result<(ApprovalStep, DesignEvent)> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start step-complete transaction")?;

        let step = get_step_tx(&tx, step_id)?;
        if !matches!(step.state, StepState::Current | StepState::Unstarted) {
            return Err(invalid_state(format!(
                "step {step_id} cannot complete from {}",
                step.state.as_str()
            )));
        }

        let mut input = DesignEventInput::new(step.design_id, DesignEventType::StepComplete, actor_id);
        input.step_id = Some(step_id);
        let event = append_event_tx(&tx, &input)?;

        let updated = update_step_tx(&tx, step_id, &StepPatch::state(StepState::Completed))?;

        tx.commit()
            .context("failed to commit step-complete transaction")?;
        Ok((updated, event))
    }

    /// Reopens a completed step and reverts every later step to its
    /// pre-completion state in descending `ordering` order, so nothing
    /// downstream remains completed while an upstream step is open.
    pub fn reopen_step(
        &mut self,
        step_id: StepId,
        actor_id: UserId,
    ) -> Result<(ApprovalStep, DesignEvent)> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start step-reopen transaction")?;

        let step = get_step_tx(&tx, step_id)?;
        if step.state != StepState::Completed {
            return Err(invalid_state(format!(
                "step {step_id} cannot reopen from {}",
                step.state.as_str()
            )));
        }

        let mut input = DesignEventInput::new(step.design_id, DesignEventType::StepReopen, actor_id);
        input.step_id = Some(step_id);
        let event = append_event_tx(&tx, &input)?;

        let steps = steps_for_design_tx(&tx, step.design_id)?;
        let mut reopened = step;
        for (target_id, target_state) in reopen_plan(&steps, step_id) {
            let updated = update_step_tx(&tx, target_id, &StepPatch::state(target_state))?;
            if target_id == step_id {
                reopened = updated;
            }
        }

        tx.commit()
            .context("failed to commit step-reopen transaction")?;
        Ok((reopened, event))
    }

    pub fn assign_submission(
        &mut self,
        submission_id: SubmissionId,
        actor_id: UserId,
        collaborator_id: Option<CollaboratorId>,
        team_user_id: Option<UserId>,
    ) -> Result<SubmissionChange> {
        validate_submission_assignee(collaborator_id, team_user_id)
            .map_err(anyhow::Error::new)?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start submission-assign transaction")?;

        let (submission, design_id) = submission_with_design_tx(&tx, submission_id)?;
        if submission.state == SubmissionState::Approved {
            return Err(invalid_state(format!(
                "submission {submission_id} is approved; its assignee can no longer change"
            )));
        }

        tx.execute(
            "UPDATE approval_step_submissions
             SET collaborator_id = ?2, team_user_id = ?3
             WHERE submission_id = ?1",
            params![
                submission_id.to_string(),
                collaborator_id.map(|id| id.to_string()),
                team_user_id.map(|id| id.to_string()),
            ],
        )
        .context("failed to update submission assignee")?;

        let mut input =
            DesignEventInput::new(design_id, DesignEventType::SubmissionAssignment, actor_id);
        input.submission_id = Some(submission_id);
        input.step_id = Some(submission.step_id);
        input.target_id = team_user_id;
        let event = append_event_tx(&tx, &input)?;

        let updated = get_submission_tx(&tx, submission_id)?;
        tx.commit()
            .context("failed to commit submission-assign transaction")?;
        Ok(SubmissionChange {
            submission: updated,
            event,
        })
    }

    pub fn submit_submission(
        &mut self,
        submission_id: SubmissionId,
        actor_id: UserId,
    ) -> Result<SubmissionChange> {
        self.transition_submission(
            submission_id,
            actor_id,
            &[SubmissionState::Unsubmitted, SubmissionState::RevisionRequested],
            SubmissionState::Submitted,
            DesignEventType::SubmissionSubmitted,
        )
    }

    pub fn approve_submission(
        &mut self,
        submission_id: SubmissionId,
        actor_id: UserId,
    ) -> Result<SubmissionChange> {
        self.transition_submission(
            submission_id,
            actor_id,
            &[SubmissionState::Unsubmitted, SubmissionState::Submitted],
            SubmissionState::Approved,
            DesignEventType::SubmissionApproval,
        )
    }

    pub fn request_submission_revision(
        &mut self,
        submission_id: SubmissionId,
        actor_id: UserId,
    ) -> Result<SubmissionChange> {
        self.transition_submission(
            submission_id,
            actor_id,
            &[SubmissionState::Submitted],
            SubmissionState::RevisionRequested,
            DesignEventType::SubmissionRevisionRequest,
        )
    }

    fn transition_submission(
        &mut self,
        submission_id: SubmissionId,
        actor_id: UserId,
        allowed_from: &[SubmissionState],
        next: SubmissionState,
        event_type: DesignEventType,
    ) -> Result<SubmissionChange> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start submission transaction")?;

        let (submission, design_id) = submission_with_design_tx(&tx, submission_id)?;
        if !allowed_from.contains(&submission.state) {
            return Err(invalid_state(format!(
                "submission {submission_id} cannot move from {} to {}",
                submission.state.as_str(),
                next.as_str()
            )));
        }

        tx.execute(
            "UPDATE approval_step_submissions SET state = ?2 WHERE submission_id = ?1",
            params![submission_id.to_string(), next.as_str()],
        )
        .context("failed to update submission state")?;

        let mut input = DesignEventInput::new(design_id, event_type, actor_id);
        input.submission_id = Some(submission_id);
        input.step_id = Some(submission.step_id);
        let event = append_event_tx(&tx, &input)?;

        let updated = get_submission_tx(&tx, submission_id)?;
        tx.commit()
            .context("failed to commit submission transaction")?;
        Ok(SubmissionChange {
            submission: updated,
            event,
        })
    }

    /// Undoes a collection checkout as a compensating transaction: a credit
    /// note for the uncredited remainder of the active invoice, one
    /// `reverse_checkout` event per design, and every completed step rolled
    /// back to `current` in descending order. Calling it again once the
    /// invoice is fully credited is an error, not a no-op.
    pub fn reverse_collection_checkout(
        &mut self,
        collection_id: CollectionId,
        actor_id: UserId,
    ) -> Result<CheckoutReversal> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start reversal transaction")?;

        ensure_collection_tx(&tx, collection_id)?;

        let (invoice_id, remaining_cents) = match scan_invoices_tx(&tx, collection_id)? {
            InvoiceScan::NoInvoices => {
                return Err(conflict(format!(
                    "collection {collection_id} has no active invoice to reverse"
                )));
            }
            InvoiceScan::AllCredited => {
                return Err(conflict(format!(
                    "collection {collection_id} checkout is already fully reversed"
                )));
            }
            InvoiceScan::Active {
                invoice_id,
                remaining_cents,
            } => (invoice_id, remaining_cents),
        };

        let credit_note_id = CreditNoteId(Ulid::new());
        tx.execute(
            "INSERT INTO credit_notes(credit_note_id, invoice_id, total_cents, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                credit_note_id.to_string(),
                invoice_id.to_string(),
                remaining_cents,
                fmt_ts(now_utc())?,
            ],
        )
        .context("failed to insert credit note")?;

        let mut events = Vec::new();
        let mut reversed_designs = Vec::new();
        for design in collection_designs_tx(&tx, collection_id)? {
            let input =
                DesignEventInput::new(design.id, DesignEventType::ReverseCheckout, actor_id);
            events.push(append_event_tx(&tx, &input)?);

            let steps = steps_for_design_tx(&tx, design.id)?;
            for (step_id, state) in checkout_rollback_plan(&steps) {
                update_step_tx(&tx, step_id, &StepPatch::state(state))?;
            }
            reversed_designs.push(design.id);
        }

        tx.commit()
            .context("failed to commit reversal transaction")?;
        Ok(CheckoutReversal {
            invoice_id,
            credit_note_id,
            credited_cents: remaining_cents,
            reversed_designs,
            events,
        })
    }

    /// Rejects every non-deleted design of the collection that is still at
    /// its checkout step, expiring that design's cost inputs. Collections
    /// with nothing to reject yield an empty event list.
    pub fn reject_collection(
        &mut self,
        collection_id: CollectionId,
        actor_id: UserId,
    ) -> Result<Vec<DesignEvent>> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start collection-reject transaction")?;

        ensure_collection_tx(&tx, collection_id)?;

        let mut events = Vec::new();
        for design in collection_designs_tx(&tx, collection_id)? {
            let steps = steps_for_design_tx(&tx, design.id)?;
            let at_checkout = steps.iter().any(|step| {
                step.step_type == StepType::Checkout && step.state != StepState::Completed
            });
            if !at_checkout {
                continue;
            }

            let input = DesignEventInput::new(design.id, DesignEventType::RejectDesign, actor_id);
            events.push(append_event_tx(&tx, &input)?);

            tx.execute(
                "UPDATE cost_inputs SET expired_at = ?2
                 WHERE design_id = ?1 AND expired_at IS NULL",
                params![design.id.to_string(), fmt_ts(now_utc())?],
            )
            .context("failed to expire cost inputs")?;
        }

        tx.commit()
            .context("failed to commit collection-reject transaction")?;
        Ok(events)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// The cascade listener: completing a step moves the next non-skip step out
/// of `blocked`. Runs inside the same transaction as the triggering write.
fn unblock_following_step(
    conn: &Connection,
    previous: &ApprovalStep,
    updated: &ApprovalStep,
) -> Result<()> {
    if previous.state == updated.state || updated.state != StepState::Completed {
        return Ok(());
    }

    let steps = steps_for_design_tx(conn, updated.design_id)?;
    if let Some((step_id, next_state)) = unblock_after_completion(&steps, updated.id) {
        update_step_tx(conn, step_id, &StepPatch::state(next_state))?;
    }
    Ok(())
}

fn append_event_tx(conn: &Connection, input: &DesignEventInput) -> Result<DesignEvent> {
    input.validate().map_err(anyhow::Error::new)?;

    let event_id = input.event_id.unwrap_or_else(Ulid::new);
    let created_at = truncate_to_micros(input.created_at.unwrap_or_else(now_utc))?;

    let insert = conn.execute(
        "INSERT INTO design_events(
            event_id, design_id, event_type, created_at, actor_id,
            target_id, target_team_id, bid_id, quote_id, step_id, submission_id, comment_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            event_id.to_string(),
            input.design_id.to_string(),
            input.event_type.as_str(),
            fmt_ts(created_at)?,
            input.actor_id.to_string(),
            input.target_id.map(|id| id.to_string()),
            input.target_team_id.map(|id| id.to_string()),
            input.bid_id.map(|id| id.to_string()),
            input.quote_id.map(|id| id.to_string()),
            input.step_id.map(|id| id.to_string()),
            input.submission_id.map(|id| id.to_string()),
            input.comment_id.map(|id| id.to_string()),
        ],
    );

    if let Err(err) = insert {
        return Err(translate_event_insert_error(err, input));
    }

    Ok(DesignEvent {
        event_seq: conn.last_insert_rowid(),
        event_id,
        design_id: input.design_id,
        event_type: input.event_type,
        created_at,
        actor_id: input.actor_id,
        target_id: input.target_id,
        target_team_id: input.target_team_id,
        bid_id: input.bid_id,
        quote_id: input.quote_id,
        step_id: input.step_id,
        submission_id: input.submission_id,
        comment_id: input.comment_id,
    })
}

/// Recognizes the one constraint violation that is an expected business
/// conflict — a second accept/reject for the same bid — and translates it.
/// Everything else propagates as a persistence error.
///
/// Sqlite reports the violated unique index by its column list
/// (`design_events.bid_id`); only decision events are covered by that
/// partial index, so the event type disambiguates it from other uniques.
fn translate_event_insert_error(err: rusqlite::Error, input: &DesignEventInput) -> anyhow::Error {
    if let rusqlite::Error::SqliteFailure(code, Some(message)) = &err {
        let unique_violation = code.code == rusqlite::ErrorCode::ConstraintViolation
            && code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE;
        let decision_index = message.contains("design_events.bid_id")
            || message.contains("uq_design_events_bid_decision");
        if unique_violation && decision_index && input.event_type.is_bid_decision() {
            if let Some(bid_id) = input.bid_id {
                return anyhow::Error::new(WorkflowError::DuplicateAcceptReject { bid_id });
            }
        }
    }
    anyhow::Error::new(err).context("failed to append design event")
}

fn update_step_tx(conn: &Connection, step_id: StepId, patch: &StepPatch) -> Result<ApprovalStep> {
    let previous = get_step_tx(conn, step_id)?;
    let mut updated = previous.clone();

    if let Some(state) = patch.state {
        updated.state = state;
    }
    if let Some(reason) = &patch.reason {
        updated.reason.clone_from(reason);
    }
    if let Some(collaborator_id) = patch.collaborator_id {
        updated.collaborator_id = collaborator_id;
    }
    if let Some(team_user_id) = patch.team_user_id {
        updated.team_user_id = team_user_id;
    }
    if let Some(due_at) = patch.due_at {
        updated.due_at = due_at;
    }

    if previous.state != updated.state {
        match updated.state {
            StepState::Current if updated.started_at.is_none() => {
                updated.started_at = Some(truncate_to_micros(now_utc())?);
            }
            StepState::Completed => {
                updated.completed_at = Some(truncate_to_micros(now_utc())?);
            }
            _ => {}
        }
        if previous.state == StepState::Completed && updated.state != StepState::Completed {
            updated.completed_at = None;
        }
    }

    conn.execute(
        "UPDATE approval_steps
         SET state = ?2, reason = ?3, started_at = ?4, completed_at = ?5,
             due_at = ?6, collaborator_id = ?7, team_user_id = ?8
         WHERE step_id = ?1",
        params![
            step_id.to_string(),
            updated.state.as_str(),
            updated.reason,
            updated.started_at.map(fmt_ts).transpose()?,
            updated.completed_at.map(fmt_ts).transpose()?,
            updated.due_at.map(fmt_ts).transpose()?,
            updated.collaborator_id.map(|id| id.to_string()),
            updated.team_user_id.map(|id| id.to_string()),
        ],
    )
    .context("failed to update approval step")?;

    for listener in STEP_UPDATE_LISTENERS {
        listener(conn, &previous, &updated)?;
    }

    Ok(updated)
}

fn create_submission_tx(
    conn: &Connection,
    step_id: StepId,
    artifact_type: ArtifactType,
    title: &str,
) -> Result<ApprovalStepSubmission> {
    let submission = ApprovalStepSubmission {
        id: SubmissionId(Ulid::new()),
        step_id,
        artifact_type,
        state: SubmissionState::Unsubmitted,
        collaborator_id: None,
        team_user_id: None,
        title: title.to_string(),
    };

    conn.execute(
        "INSERT INTO approval_step_submissions(
            submission_id, step_id, artifact_type, state, title, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            submission.id.to_string(),
            step_id.to_string(),
            artifact_type.as_str(),
            submission.state.as_str(),
            submission.title,
            fmt_ts(now_utc())?,
        ],
    )
    .context("failed to insert submission")?;

    Ok(submission)
}

fn activate_collaborator_tx(
    conn: &Connection,
    design_id: DesignId,
    assignee: BidAssignee,
) -> Result<CollaboratorId> {
    let existing = match assignee {
        BidAssignee::User(user_id) => conn
            .query_row(
                "SELECT collaborator_id FROM collaborators
                 WHERE design_id = ?1 AND user_id = ?2 AND cancelled_at IS NULL",
                params![design_id.to_string(), user_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to look up collaborator")?,
        BidAssignee::Team(team_id) => conn
            .query_row(
                "SELECT collaborator_id FROM collaborators
                 WHERE design_id = ?1 AND team_id = ?2 AND cancelled_at IS NULL",
                params![design_id.to_string(), team_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to look up collaborator")?,
    };

    if let Some(raw) = existing {
        let parsed = Ulid::from_string(&raw)
            .with_context(|| format!("invalid stored collaborator id: {raw}"))?;
        return Ok(CollaboratorId(parsed));
    }

    let collaborator_id = CollaboratorId(Ulid::new());
    let (user_id, team_id) = match assignee {
        BidAssignee::User(user_id) => (Some(user_id.to_string()), None),
        BidAssignee::Team(team_id) => (None, Some(team_id.to_string())),
    };

    conn.execute(
        "INSERT INTO collaborators(collaborator_id, design_id, user_id, team_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            collaborator_id.to_string(),
            design_id.to_string(),
            user_id,
            team_id,
            fmt_ts(now_utc())?,
        ],
    )
    .context("failed to insert collaborator")?;

    Ok(collaborator_id)
}

fn cancel_collaborator_tx(
    conn: &Connection,
    design_id: DesignId,
    assignee: BidAssignee,
) -> Result<()> {
    let cancelled_at = fmt_ts(now_utc())?;
    match assignee {
        BidAssignee::User(user_id) => conn.execute(
            "UPDATE collaborators SET cancelled_at = ?3
             WHERE design_id = ?1 AND user_id = ?2 AND cancelled_at IS NULL",
            params![design_id.to_string(), user_id.to_string(), cancelled_at],
        ),
        BidAssignee::Team(team_id) => conn.execute(
            "UPDATE collaborators SET cancelled_at = ?3
             WHERE design_id = ?1 AND team_id = ?2 AND cancelled_at IS NULL",
            params![design_id.to_string(), team_id.to_string(), cancelled_at],
        ),
    }
    .context("failed to cancel collaborator")?;
    Ok(())
}

fn apply_bid_target(input: &mut DesignEventInput, assignee: BidAssignee) {
    match assignee {
        BidAssignee::User(user_id) => input.target_id = Some(user_id),
        BidAssignee::Team(team_id) => input.target_team_id = Some(team_id),
    }
}

fn ensure_collection_tx(conn: &Connection, collection_id: CollectionId) -> Result<()> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM collections WHERE collection_id = ?1",
            params![collection_id.to_string()],
            |_| Ok(()),
        )
        .optional()
        .context("failed to look up collection")?;
    match exists {
        Some(()) => Ok(()),
        None => Err(not_found(format!("collection {collection_id}"))),
    }
}

fn get_design_tx(conn: &Connection, design_id: DesignId) -> Result<Design> {
    let design = conn
        .query_row(
            "SELECT design_id, collection_id, complexity, deleted
             FROM designs WHERE design_id = ?1",
            params![design_id.to_string()],
            parse_design_row,
        )
        .optional()
        .context("failed to load design")?;
    design.ok_or_else(|| not_found(format!("design {design_id}")))
}

fn collection_designs_tx(conn: &Connection, collection_id: CollectionId) -> Result<Vec<Design>> {
    let mut stmt = conn.prepare(
        "SELECT design_id, collection_id, complexity, deleted
         FROM designs
         WHERE collection_id = ?1 AND deleted = 0
         ORDER BY design_id ASC",
    )?;
    let rows = stmt.query_map(params![collection_id.to_string()], parse_design_row)?;
    collect_rows(rows)
}

fn quote_design_tx(conn: &Connection, quote_id: QuoteId) -> Result<DesignId> {
    let design = conn
        .query_row(
            "SELECT design_id FROM pricing_quotes WHERE quote_id = ?1",
            params![quote_id.to_string()],
            |row| {
                let raw: String = row.get(0)?;
                Ok(DesignId(column_ulid(0, &raw)?))
            },
        )
        .optional()
        .context("failed to load pricing quote")?;
    design.ok_or_else(|| not_found(format!("pricing quote {quote_id}")))
}

fn get_bid_tx(conn: &Connection, bid_id: BidId) -> Result<Bid> {
    let query = format!("{SELECT_BID_COLUMNS} WHERE bid_id = ?1");
    let bid = conn
        .query_row(&query, params![bid_id.to_string()], parse_bid_row)
        .optional()
        .context("failed to load bid")?;
    bid.ok_or_else(|| not_found(format!("bid {bid_id}")))
}

fn bid_events_tx(conn: &Connection, bid_id: BidId) -> Result<Vec<DesignEvent>> {
    let query =
        format!("{SELECT_EVENT_COLUMNS} WHERE bid_id = ?1 ORDER BY created_at ASC, event_seq ASC");
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map(params![bid_id.to_string()], parse_event_row)?;
    collect_rows(rows)
}

fn steps_for_design_tx(conn: &Connection, design_id: DesignId) -> Result<Vec<ApprovalStep>> {
    let query = format!("{SELECT_STEP_COLUMNS} WHERE design_id = ?1 ORDER BY ordering ASC");
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map(params![design_id.to_string()], parse_step_row)?;
    collect_rows(rows)
}

fn get_step_tx(conn: &Connection, step_id: StepId) -> Result<ApprovalStep> {
    let query = format!("{SELECT_STEP_COLUMNS} WHERE step_id = ?1");
    let step = conn
        .query_row(&query, params![step_id.to_string()], parse_step_row)
        .optional()
        .context("failed to load approval step")?;
    step.ok_or_else(|| not_found(format!("approval step {step_id}")))
}

fn get_submission_tx(
    conn: &Connection,
    submission_id: SubmissionId,
) -> Result<ApprovalStepSubmission> {
    let query = format!("{SELECT_SUBMISSION_COLUMNS} WHERE submission_id = ?1");
    let submission = conn
        .query_row(&query, params![submission_id.to_string()], parse_submission_row)
        .optional()
        .context("failed to load submission")?;
    submission.ok_or_else(|| not_found(format!("submission {submission_id}")))
}

fn submission_with_design_tx(
    conn: &Connection,
    submission_id: SubmissionId,
) -> Result<(ApprovalStepSubmission, DesignId)> {
    let submission = get_submission_tx(conn, submission_id)?;
    let step = get_step_tx(conn, submission.step_id)?;
    Ok((submission, step.design_id))
}

fn scan_invoices_tx(conn: &Connection, collection_id: CollectionId) -> Result<InvoiceScan> {
    let mut stmt = conn.prepare(
        "SELECT
            i.invoice_id,
            i.total_cents,
            COALESCE((SELECT SUM(c.total_cents) FROM credit_notes c
                      WHERE c.invoice_id = i.invoice_id), 0)
         FROM invoices i
         WHERE i.collection_id = ?1
         ORDER BY i.created_at DESC, i.invoice_id DESC",
    )?;

    let rows = stmt.query_map(params![collection_id.to_string()], |row| {
        let invoice_raw: String = row.get(0)?;
        let total_cents: i64 = row.get(1)?;
        let credited_cents: i64 = row.get(2)?;
        Ok((invoice_raw, total_cents, credited_cents))
    })?;

    let mut any = false;
    for row in rows {
        let (invoice_raw, total_cents, credited_cents) = row?;
        any = true;
        if credited_cents < total_cents {
            let parsed = Ulid::from_string(&invoice_raw)
                .with_context(|| format!("invalid stored invoice id: {invoice_raw}"))?;
            return Ok(InvoiceScan::Active {
                invoice_id: InvoiceId(parsed),
                remaining_cents: total_cents - credited_cents,
            });
        }
    }

    if any {
        Ok(InvoiceScan::AllCredited)
    } else {
        Ok(InvoiceScan::NoInvoices)
    }
}

fn not_found(what: String) -> anyhow::Error {
    anyhow::Error::new(WorkflowError::NotFound(what))
}

fn conflict(what: String) -> anyhow::Error {
    anyhow::Error::new(WorkflowError::Conflict(what))
}

fn invalid_state(what: String) -> anyhow::Error {
    anyhow::Error::new(WorkflowError::InvalidState(what))
}

fn truncate_to_micros(value: OffsetDateTime) -> Result<OffsetDateTime> {
    let utc = value.to_offset(UtcOffset::UTC);
    utc.replace_nanosecond(utc.nanosecond() / 1_000 * 1_000)
        .context("failed to truncate timestamp to microseconds")
}

fn fmt_ts(value: OffsetDateTime) -> Result<String> {
    truncate_to_micros(value)?
        .format(TS_FORMAT)
        .context("failed to format timestamp")
}

fn column_error<T>(index: usize, message: String) -> rusqlite::Result<T> {
    Err(rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    ))
}

fn column_ulid(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    match Ulid::from_string(raw) {
        Ok(value) => Ok(value),
        Err(err) => column_error(index, format!("invalid ULID {raw}: {err}")),
    }
}

fn column_opt_ulid(index: usize, raw: Option<&str>) -> rusqlite::Result<Option<Ulid>> {
    raw.map(|value| column_ulid(index, value)).transpose()
}

fn column_ts(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    match PrimitiveDateTime::parse(raw, TS_FORMAT) {
        Ok(value) => Ok(value.assume_utc()),
        Err(err) => column_error(index, format!("invalid timestamp {raw}: {err}")),
    }
}

fn column_opt_ts(index: usize, raw: Option<&str>) -> rusqlite::Result<Option<OffsetDateTime>> {
    raw.map(|value| column_ts(index, value)).transpose()
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DesignEvent> {
    let event_id_raw: String = row.get(1)?;
    let design_raw: String = row.get(2)?;
    let event_type_raw: String = row.get(3)?;
    let created_raw: String = row.get(4)?;
    let actor_raw: String = row.get(5)?;
    let target_raw: Option<String> = row.get(6)?;
    let target_team_raw: Option<String> = row.get(7)?;
    let bid_raw: Option<String> = row.get(8)?;
    let quote_raw: Option<String> = row.get(9)?;
    let step_raw: Option<String> = row.get(10)?;
    let submission_raw: Option<String> = row.get(11)?;
    let comment_raw: Option<String> = row.get(12)?;

    let Some(event_type) = DesignEventType::parse(&event_type_raw) else {
        return column_error(3, format!("unknown event_type: {event_type_raw}"));
    };

    Ok(DesignEvent {
        event_seq: row.get(0)?,
        event_id: column_ulid(1, &event_id_raw)?,
        design_id: DesignId(column_ulid(2, &design_raw)?),
        event_type,
        created_at: column_ts(4, &created_raw)?,
        actor_id: UserId(column_ulid(5, &actor_raw)?),
        target_id: column_opt_ulid(6, target_raw.as_deref())?.map(UserId),
        target_team_id: column_opt_ulid(7, target_team_raw.as_deref())?.map(TeamId),
        bid_id: column_opt_ulid(8, bid_raw.as_deref())?.map(BidId),
        quote_id: column_opt_ulid(9, quote_raw.as_deref())?.map(QuoteId),
        step_id: column_opt_ulid(10, step_raw.as_deref())?.map(StepId),
        submission_id: column_opt_ulid(11, submission_raw.as_deref())?.map(SubmissionId),
        comment_id: column_opt_ulid(12, comment_raw.as_deref())?.map(CommentId),
    })
}

fn parse_step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalStep> {
    let step_raw: String = row.get(0)?;
    let design_raw: String = row.get(1)?;
    let title: String = row.get(2)?;
    let ordering_i64: i64 = row.get(3)?;
    let step_type_raw: String = row.get(4)?;
    let state_raw: String = row.get(5)?;
    let reason: Option<String> = row.get(6)?;
    let started_raw: Option<String> = row.get(7)?;
    let completed_raw: Option<String> = row.get(8)?;
    let due_raw: Option<String> = row.get(9)?;
    let collaborator_raw: Option<String> = row.get(10)?;
    let team_user_raw: Option<String> = row.get(11)?;

    let Ok(ordering) = u32::try_from(ordering_i64) else {
        return column_error(3, format!("invalid step ordering: {ordering_i64}"));
    };
    let Some(step_type) = StepType::parse(&step_type_raw) else {
        return column_error(4, format!("unknown step_type: {step_type_raw}"));
    };
    let Some(state) = StepState::parse(&state_raw) else {
        return column_error(5, format!("unknown step state: {state_raw}"));
    };

    Ok(ApprovalStep {
        id: StepId(column_ulid(0, &step_raw)?),
        design_id: DesignId(column_ulid(1, &design_raw)?),
        title,
        ordering,
        step_type,
        state,
        reason,
        started_at: column_opt_ts(7, started_raw.as_deref())?,
        completed_at: column_opt_ts(8, completed_raw.as_deref())?,
        due_at: column_opt_ts(9, due_raw.as_deref())?,
        collaborator_id: column_opt_ulid(10, collaborator_raw.as_deref())?.map(CollaboratorId),
        team_user_id: column_opt_ulid(11, team_user_raw.as_deref())?.map(UserId),
    })
}

fn parse_submission_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalStepSubmission> {
    let submission_raw: String = row.get(0)?;
    let step_raw: String = row.get(1)?;
    let artifact_raw: String = row.get(2)?;
    let state_raw: String = row.get(3)?;
    let collaborator_raw: Option<String> = row.get(4)?;
    let team_user_raw: Option<String> = row.get(5)?;
    let title: String = row.get(6)?;

    let Some(artifact_type) = ArtifactType::parse(&artifact_raw) else {
        return column_error(2, format!("unknown artifact_type: {artifact_raw}"));
    };
    let Some(state) = SubmissionState::parse(&state_raw) else {
        return column_error(3, format!("unknown submission state: {state_raw}"));
    };

    Ok(ApprovalStepSubmission {
        id: SubmissionId(column_ulid(0, &submission_raw)?),
        step_id: StepId(column_ulid(1, &step_raw)?),
        artifact_type,
        state,
        collaborator_id: column_opt_ulid(4, collaborator_raw.as_deref())?.map(CollaboratorId),
        team_user_id: column_opt_ulid(5, team_user_raw.as_deref())?.map(UserId),
        title,
    })
}

fn parse_bid_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bid> {
    let bid_raw: String = row.get(0)?;
    let quote_raw: String = row.get(1)?;
    let design_raw: String = row.get(2)?;
    let created_raw: String = row.get(3)?;
    let due_raw: Option<String> = row.get(4)?;
    let assignee_user_raw: Option<String> = row.get(5)?;
    let assignee_team_raw: Option<String> = row.get(6)?;

    let assignee = match (
        column_opt_ulid(5, assignee_user_raw.as_deref())?,
        column_opt_ulid(6, assignee_team_raw.as_deref())?,
    ) {
        (Some(user), None) => BidAssignee::User(UserId(user)),
        (None, Some(team)) => BidAssignee::Team(TeamId(team)),
        _ => return column_error(5, "bid assignee must be exactly one of user or team".to_string()),
    };

    Ok(Bid {
        id: BidId(column_ulid(0, &bid_raw)?),
        quote_id: QuoteId(column_ulid(1, &quote_raw)?),
        design_id: DesignId(column_ulid(2, &design_raw)?),
        created_at: column_ts(3, &created_raw)?,
        due_date: column_opt_ts(4, due_raw.as_deref())?,
        assignee,
    })
}

fn parse_design_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Design> {
    let design_raw: String = row.get(0)?;
    let collection_raw: Option<String> = row.get(1)?;
    let complexity_raw: String = row.get(2)?;
    let deleted: bool = row.get(3)?;

    let Some(complexity) = ProductComplexity::parse(&complexity_raw) else {
        return column_error(2, format!("unknown complexity: {complexity_raw}"));
    };

    Ok(Design {
        id: DesignId(column_ulid(0, &design_raw)?),
        collection_id: column_opt_ulid(1, collection_raw.as_deref())?.map(CollectionId),
        complexity,
        deleted,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else, clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use time::Duration;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_err<T: std::fmt::Debug>(result: Result<T>) -> anyhow::Error {
        match result {
            Ok(value) => panic!("expected an error, got {value:?}"),
            Err(err) => err,
        }
    }

    fn workflow_error(err: &anyhow::Error) -> &WorkflowError {
        match err.downcast_ref::<WorkflowError>() {
            Some(typed) => typed,
            None => panic!("expected a WorkflowError, got: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteWorkflowStore {
        let store = must(SqliteWorkflowStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn actor() -> UserId {
        UserId(Ulid::new())
    }

    fn seed_design(store: &mut SqliteWorkflowStore, complexity: ProductComplexity) -> Design {
        let collection = must(store.create_collection());
        must(store.create_design(Some(collection), complexity))
    }

    fn seed_bid(store: &mut SqliteWorkflowStore, design: &Design, partner: UserId) -> Bid {
        let quote = must(store.create_quote(design.id, 12_500));
        must(store.create_bid(quote, actor(), BidAssignee::User(partner), None))
    }

    fn step_by_type(steps: &[ApprovalStep], step_type: StepType) -> &ApprovalStep {
        match steps.iter().find(|step| step.step_type == step_type) {
            Some(step) => step,
            None => panic!("missing {} step", step_type.as_str()),
        }
    }

    fn event_type_from_code(code: u8) -> DesignEventType {
        match code {
            0 => DesignEventType::BidDesign,
            1 => DesignEventType::CommitCostInputs,
            2 => DesignEventType::AcceptServiceBid,
            3 => DesignEventType::RejectServiceBid,
            _ => DesignEventType::RemovePartner,
        }
    }

    #[test]
    fn append_only_triggers_block_updates_and_deletes() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);

        let input = DesignEventInput::new(design.id, DesignEventType::CommitCostInputs, actor());
        let event = must(store.append_event(&input));

        let update = store.connection().execute(
            "UPDATE design_events SET actor_id = 'mutated' WHERE event_seq = ?1",
            params![event.event_seq],
        );
        assert!(update.is_err());

        let delete = store.connection().execute(
            "DELETE FROM design_events WHERE event_seq = ?1",
            params![event.event_seq],
        );
        assert!(delete.is_err());
    }

    #[test]
    fn create_bid_opens_the_bid() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let bid = seed_bid(&mut store, &design, actor());

        assert_eq!(must(store.bid_state(bid.id)), BidState::Open);
    }

    #[test]
    fn accept_bid_reaches_accepted_and_pairs_partner_steps() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let partner = actor();
        let bid = seed_bid(&mut store, &design, partner);

        let acceptance = must(store.accept_bid(bid.id, partner));
        assert_eq!(must(store.bid_state(bid.id)), BidState::Accepted);

        let pairing_events: Vec<_> = acceptance
            .events
            .iter()
            .filter(|event| event.event_type == DesignEventType::StepPartnerPairing)
            .collect();
        assert_eq!(pairing_events.len(), 3);

        let steps = must(store.steps_for_design(design.id));
        for step in &steps {
            if step.step_type.is_partner_owned() {
                assert_eq!(step.collaborator_id, Some(acceptance.collaborator_id));
            } else {
                assert_eq!(step.collaborator_id, None);
            }
        }
    }

    #[test]
    fn second_accept_is_a_duplicate_conflict_and_state_stays_accepted() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let partner = actor();
        let bid = seed_bid(&mut store, &design, partner);

        must(store.accept_bid(bid.id, partner));
        let err = must_err(store.accept_bid(bid.id, partner));
        assert_eq!(
            workflow_error(&err),
            &WorkflowError::DuplicateAcceptReject { bid_id: bid.id }
        );
        assert_eq!(must(store.bid_state(bid.id)), BidState::Accepted);
    }

    #[test]
    fn decision_index_rejects_a_second_decision_append() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let bid = seed_bid(&mut store, &design, actor());

        let mut accept =
            DesignEventInput::new(design.id, DesignEventType::AcceptServiceBid, actor());
        accept.bid_id = Some(bid.id);
        must(store.append_event(&accept));

        let mut reject =
            DesignEventInput::new(design.id, DesignEventType::RejectServiceBid, actor());
        reject.bid_id = Some(bid.id);
        let err = must_err(store.append_event(&reject));
        assert_eq!(
            workflow_error(&err),
            &WorkflowError::DuplicateAcceptReject { bid_id: bid.id }
        );
        assert_eq!(must(store.bid_state(bid.id)), BidState::Accepted);
    }

    #[test]
    fn decisions_for_different_bids_do_not_collide() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let first_partner = actor();
        let second_partner = actor();
        let first = seed_bid(&mut store, &design, first_partner);
        let second = seed_bid(&mut store, &design, second_partner);

        must(store.reject_bid(first.id, first_partner));
        must(store.accept_bid(second.id, second_partner));

        assert_eq!(must(store.bid_state(first.id)), BidState::Rejected);
        assert_eq!(must(store.bid_state(second.id)), BidState::Accepted);
    }

    #[test]
    fn batch_append_applies_nothing_on_failure() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let bid = seed_bid(&mut store, &design, actor());

        let mut accept =
            DesignEventInput::new(design.id, DesignEventType::AcceptServiceBid, actor());
        accept.bid_id = Some(bid.id);
        let mut reject =
            DesignEventInput::new(design.id, DesignEventType::RejectServiceBid, actor());
        reject.bid_id = Some(bid.id);

        let before = must(store.find_bid_events(bid.id)).len();
        let err = must_err(store.append_events(&[accept, reject]));
        assert_eq!(
            workflow_error(&err),
            &WorkflowError::DuplicateAcceptReject { bid_id: bid.id }
        );

        let after = must(store.find_bid_events(bid.id));
        assert_eq!(after.len(), before);
        assert_eq!(must(store.bid_state(bid.id)), BidState::Open);
    }

    #[test]
    fn failed_accept_leaves_no_collaborator_or_pairing_residue() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let partner = actor();
        let bid = seed_bid(&mut store, &design, partner);

        must(store.reject_bid(bid.id, partner));
        let err = must_err(store.accept_bid(bid.id, partner));
        assert_eq!(
            workflow_error(&err),
            &WorkflowError::DuplicateAcceptReject { bid_id: bid.id }
        );

        let steps = must(store.steps_for_design(design.id));
        assert!(steps.iter().all(|step| step.collaborator_id.is_none()));

        let collaborators: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM collaborators WHERE design_id = ?1 AND cancelled_at IS NULL",
            params![design.id.to_string()],
            |row| row.get(0),
        ) {
            Ok(count) => count,
            Err(err) => panic!("failed to count collaborators: {err}"),
        };
        assert_eq!(collaborators, 0);
    }

    #[test]
    fn reject_bid_requires_the_assignee() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let partner = actor();
        let bid = seed_bid(&mut store, &design, partner);

        let err = must_err(store.reject_bid(bid.id, actor()));
        assert!(matches!(
            workflow_error(&err),
            WorkflowError::InvalidState(_)
        ));
    }

    #[test]
    fn reject_bid_never_touches_step_states() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let partner = actor();
        let bid = seed_bid(&mut store, &design, partner);

        let before: Vec<_> = must(store.steps_for_design(design.id))
            .into_iter()
            .map(|step| (step.id, step.state))
            .collect();

        must(store.reject_bid(bid.id, partner));

        let after: Vec<_> = must(store.steps_for_design(design.id))
            .into_iter()
            .map(|step| (step.id, step.state))
            .collect();
        assert_eq!(before, after);
        assert_eq!(must(store.bid_state(bid.id)), BidState::Rejected);
    }

    #[test]
    fn remove_partner_requires_an_accepted_bid_and_dominates() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let partner = actor();
        let bid = seed_bid(&mut store, &design, partner);

        let err = must_err(store.remove_partner(bid.id, actor()));
        assert!(matches!(
            workflow_error(&err),
            WorkflowError::InvalidState(_)
        ));

        must(store.accept_bid(bid.id, partner));
        must(store.remove_partner(bid.id, actor()));
        assert_eq!(must(store.bid_state(bid.id)), BidState::Removed);

        let steps = must(store.steps_for_design(design.id));
        assert!(steps.iter().all(|step| step.collaborator_id.is_none()));
    }

    #[test]
    fn commit_quote_completes_checkout_and_unblocks_the_cascade() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let quote = must(store.create_quote(design.id, 48_000));

        must(store.commit_cost_inputs(design.id, actor()));
        let commit = must(store.commit_quote(design.id, quote, actor()));
        assert_eq!(commit.checkout_step.state, StepState::Completed);
        assert!(commit.checkout_step.completed_at.is_some());

        let steps = must(store.steps_for_design(design.id));
        assert_eq!(
            step_by_type(&steps, StepType::TechnicalDesign).state,
            StepState::Unstarted
        );
        assert_eq!(step_by_type(&steps, StepType::Sample).state, StepState::Blocked);
    }

    #[test]
    fn commit_quote_twice_is_a_conflict() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let quote = must(store.create_quote(design.id, 48_000));

        must(store.commit_quote(design.id, quote, actor()));
        let err = must_err(store.commit_quote(design.id, quote, actor()));
        assert!(matches!(workflow_error(&err), WorkflowError::Conflict(_)));
    }

    #[test]
    fn submission_counts_differ_by_complexity() {
        let mut store = fixture_store();

        let blank = seed_design(&mut store, ProductComplexity::Blank);
        let blank_quote = must(store.create_quote(blank.id, 9_000));
        let blank_commit = must(store.commit_quote(blank.id, blank_quote, actor()));
        assert_eq!(blank_commit.submissions.len(), 1);
        assert_eq!(
            blank_commit.submissions[0].artifact_type,
            ArtifactType::Sample
        );

        let cut_and_sew = seed_design(&mut store, ProductComplexity::CutAndSew);
        let cut_quote = must(store.create_quote(cut_and_sew.id, 9_000));
        let cut_commit = must(store.commit_quote(cut_and_sew.id, cut_quote, actor()));
        assert_eq!(cut_commit.submissions.len(), 2);
    }

    #[test]
    fn blank_designs_skip_technical_design_in_the_cascade() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::Blank);
        let quote = must(store.create_quote(design.id, 9_000));

        must(store.commit_quote(design.id, quote, actor()));

        let steps = must(store.steps_for_design(design.id));
        assert_eq!(
            step_by_type(&steps, StepType::TechnicalDesign).state,
            StepState::Skip
        );
        assert_eq!(
            step_by_type(&steps, StepType::Sample).state,
            StepState::Unstarted
        );
    }

    #[test]
    fn paired_steps_unblock_straight_to_current() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::Blank);
        let partner = actor();
        let bid = seed_bid(&mut store, &design, partner);
        must(store.accept_bid(bid.id, partner));

        let quote = must(store.create_quote(design.id, 9_000));
        must(store.commit_quote(design.id, quote, actor()));

        let steps = must(store.steps_for_design(design.id));
        assert_eq!(
            step_by_type(&steps, StepType::Sample).state,
            StepState::Current
        );
    }

    #[test]
    fn events_come_back_ordered_by_created_at_then_seq() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let writer = actor();

        let base = must(
            atelier_flow_core::parse_rfc3339_utc("2026-08-01T12:00:00Z")
                .map_err(anyhow::Error::new),
        );

        let mut late = DesignEventInput::new(design.id, DesignEventType::CommitCostInputs, writer);
        late.created_at = Some(base + Duration::minutes(10));
        let mut early = DesignEventInput::new(design.id, DesignEventType::CommitCostInputs, writer);
        early.created_at = Some(base);
        let mut tied_first =
            DesignEventInput::new(design.id, DesignEventType::CommitCostInputs, writer);
        tied_first.created_at = Some(base + Duration::minutes(5));
        let mut tied_second =
            DesignEventInput::new(design.id, DesignEventType::CommitCostInputs, writer);
        tied_second.created_at = Some(base + Duration::minutes(5));

        let late = must(store.append_event(&late));
        let early = must(store.append_event(&early));
        let tied_first = must(store.append_event(&tied_first));
        let tied_second = must(store.append_event(&tied_second));

        let filter = EventFilter {
            design_id: Some(design.id),
            ..EventFilter::default()
        };
        let found = must(store.find_events(&filter));
        let sequence: Vec<i64> = found.iter().map(|event| event.event_seq).collect();
        assert_eq!(
            sequence,
            vec![
                early.event_seq,
                tied_first.event_seq,
                tied_second.event_seq,
                late.event_seq
            ]
        );
    }

    #[test]
    fn step_events_are_ordered_ascending() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let steps = must(store.steps_for_design(design.id));
        let checkout = step_by_type(&steps, StepType::Checkout);
        let writer = actor();

        let base = must(
            atelier_flow_core::parse_rfc3339_utc("2026-08-01T12:00:00Z")
                .map_err(anyhow::Error::new),
        );

        let mut second = DesignEventInput::new(design.id, DesignEventType::StepComplete, writer);
        second.step_id = Some(checkout.id);
        second.created_at = Some(base + Duration::seconds(30));
        let mut first = DesignEventInput::new(design.id, DesignEventType::StepReopen, writer);
        first.step_id = Some(checkout.id);
        first.created_at = Some(base);

        must(store.append_event(&second));
        must(store.append_event(&first));

        let found = must(store.find_step_events(checkout.id));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].event_type, DesignEventType::StepReopen);
        assert_eq!(found[1].event_type, DesignEventType::StepComplete);
    }

    #[test]
    fn reopen_reverts_downstream_steps_and_clears_completion() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let quote = must(store.create_quote(design.id, 30_000));
        let driver = actor();

        must(store.commit_quote(design.id, quote, driver));
        let steps = must(store.steps_for_design(design.id));
        let technical = step_by_type(&steps, StepType::TechnicalDesign);
        must(store.complete_step(technical.id, driver));

        let steps = must(store.steps_for_design(design.id));
        let checkout = step_by_type(&steps, StepType::Checkout);
        let (reopened, _event) = must(store.reopen_step(checkout.id, driver));
        assert_eq!(reopened.state, StepState::Current);
        assert_eq!(reopened.completed_at, None);

        let steps = must(store.steps_for_design(design.id));
        assert_eq!(
            step_by_type(&steps, StepType::TechnicalDesign).state,
            StepState::Blocked
        );
        assert_eq!(
            step_by_type(&steps, StepType::Sample).state,
            StepState::Blocked
        );
    }

    #[test]
    fn reopen_requires_a_completed_step() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::CutAndSew);
        let steps = must(store.steps_for_design(design.id));
        let checkout = step_by_type(&steps, StepType::Checkout);

        let err = must_err(store.reopen_step(checkout.id, actor()));
        assert!(matches!(
            workflow_error(&err),
            WorkflowError::InvalidState(_)
        ));
    }

    #[test]
    fn reverse_checkout_credits_the_invoice_and_resets_steps() {
        let mut store = fixture_store();
        let collection = must(store.create_collection());
        let first = must(store.create_design(Some(collection), ProductComplexity::CutAndSew));
        let second = must(store.create_design(Some(collection), ProductComplexity::Blank));
        let driver = actor();

        for design in [&first, &second] {
            let quote = must(store.create_quote(design.id, 20_000));
            must(store.commit_cost_inputs(design.id, driver));
            must(store.commit_quote(design.id, quote, driver));
        }
        must(store.create_invoice(collection, 40_000));

        let reversal = must(store.reverse_collection_checkout(collection, driver));
        assert_eq!(reversal.credited_cents, 40_000);
        assert_eq!(reversal.reversed_designs.len(), 2);
        assert_eq!(reversal.events.len(), 2);
        assert!(reversal
            .events
            .iter()
            .all(|event| event.event_type == DesignEventType::ReverseCheckout));

        for design in [&first, &second] {
            let steps = must(store.steps_for_design(design.id));
            assert_eq!(
                step_by_type(&steps, StepType::Checkout).state,
                StepState::Current
            );
        }

        let err = must_err(store.reverse_collection_checkout(collection, driver));
        assert!(matches!(workflow_error(&err), WorkflowError::Conflict(_)));
    }

    #[test]
    fn reverse_checkout_without_an_invoice_is_a_conflict() {
        let mut store = fixture_store();
        let collection = must(store.create_collection());
        must(store.create_design(Some(collection), ProductComplexity::Blank));

        let err = must_err(store.reverse_collection_checkout(collection, actor()));
        assert!(matches!(workflow_error(&err), WorkflowError::Conflict(_)));
    }

    #[test]
    fn reject_collection_rejects_checkout_stage_designs_and_expires_cost_inputs() {
        let mut store = fixture_store();
        let collection = must(store.create_collection());
        let at_checkout = must(store.create_design(Some(collection), ProductComplexity::CutAndSew));
        let committed = must(store.create_design(Some(collection), ProductComplexity::CutAndSew));
        let driver = actor();

        must(store.commit_cost_inputs(at_checkout.id, driver));
        let quote = must(store.create_quote(committed.id, 15_000));
        must(store.commit_quote(committed.id, quote, driver));

        let events = must(store.reject_collection(collection, driver));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].design_id, at_checkout.id);
        assert_eq!(events[0].event_type, DesignEventType::RejectDesign);

        let unexpired: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM cost_inputs WHERE design_id = ?1 AND expired_at IS NULL",
            params![at_checkout.id.to_string()],
            |row| row.get(0),
        ) {
            Ok(count) => count,
            Err(err) => panic!("failed to count cost inputs: {err}"),
        };
        assert_eq!(unexpired, 0);
    }

    #[test]
    fn reject_collection_with_no_matching_designs_returns_empty() {
        let mut store = fixture_store();
        let collection = must(store.create_collection());

        let events = must(store.reject_collection(collection, actor()));
        assert!(events.is_empty());
    }

    #[test]
    fn submission_lifecycle_appends_an_event_per_transition() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::Blank);
        let quote = must(store.create_quote(design.id, 9_000));
        let driver = actor();

        let commit = must(store.commit_quote(design.id, quote, driver));
        let submission = commit.submissions[0].clone();

        let submitted = must(store.submit_submission(submission.id, driver));
        assert_eq!(submitted.submission.state, SubmissionState::Submitted);

        let revised = must(store.request_submission_revision(submission.id, driver));
        assert_eq!(revised.submission.state, SubmissionState::RevisionRequested);

        let resubmitted = must(store.submit_submission(submission.id, driver));
        assert_eq!(resubmitted.submission.state, SubmissionState::Submitted);

        let approved = must(store.approve_submission(submission.id, driver));
        assert_eq!(approved.submission.state, SubmissionState::Approved);

        let events = must(store.find_submission_events(submission.id));
        let kinds: Vec<_> = events.iter().map(|event| event.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                DesignEventType::SubmissionSubmitted,
                DesignEventType::SubmissionRevisionRequest,
                DesignEventType::SubmissionSubmitted,
                DesignEventType::SubmissionApproval,
            ]
        );
    }

    #[test]
    fn assignee_cannot_change_after_approval() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::Blank);
        let quote = must(store.create_quote(design.id, 9_000));
        let driver = actor();

        let commit = must(store.commit_quote(design.id, quote, driver));
        let submission = commit.submissions[0].clone();

        let assigned = must(store.assign_submission(
            submission.id,
            driver,
            None,
            Some(UserId(Ulid::new())),
        ));
        assert!(assigned.submission.team_user_id.is_some());

        must(store.approve_submission(submission.id, driver));
        let err = must_err(store.assign_submission(submission.id, driver, None, None));
        assert!(matches!(
            workflow_error(&err),
            WorkflowError::InvalidState(_)
        ));
    }

    #[test]
    fn submission_assignee_is_exclusive() {
        let mut store = fixture_store();
        let design = seed_design(&mut store, ProductComplexity::Blank);
        let quote = must(store.create_quote(design.id, 9_000));
        let driver = actor();

        let commit = must(store.commit_quote(design.id, quote, driver));
        let submission = commit.submissions[0].clone();

        let err = must_err(store.assign_submission(
            submission.id,
            driver,
            Some(CollaboratorId(Ulid::new())),
            Some(UserId(Ulid::new())),
        ));
        assert!(matches!(
            workflow_error(&err),
            WorkflowError::Validation(_)
        ));
    }

    #[test]
    fn accept_on_a_missing_bid_is_not_found() {
        let mut store = fixture_store();
        let err = must_err(store.accept_bid(BidId(Ulid::new()), actor()));
        assert!(matches!(workflow_error(&err), WorkflowError::NotFound(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_first_decision_wins_and_later_ones_conflict(
            decisions in prop::collection::vec(any::<bool>(), 1..5)
        ) {
            let mut store = fixture_store();
            let design = seed_design(&mut store, ProductComplexity::CutAndSew);
            let partner = actor();
            let bid = seed_bid(&mut store, &design, partner);

            for (index, accept) in decisions.iter().copied().enumerate() {
                let result = if accept {
                    store.accept_bid(bid.id, partner).map(|_| ())
                } else {
                    store.reject_bid(bid.id, partner).map(|_| ())
                };

                if index == 0 {
                    prop_assert!(result.is_ok());
                } else {
                    let err = match result {
                        Ok(()) => return Err(TestCaseError::fail("expected a duplicate conflict")),
                        Err(err) => err,
                    };
                    prop_assert_eq!(
                        workflow_error(&err),
                        &WorkflowError::DuplicateAcceptReject { bid_id: bid.id }
                    );
                }
            }

            let expected = if decisions[0] {
                BidState::Accepted
            } else {
                BidState::Rejected
            };
            prop_assert_eq!(must(store.bid_state(bid.id)), expected);
        }

        #[test]
        fn prop_derived_state_is_stable_across_rereads(rereads in 1usize..5) {
            let mut store = fixture_store();
            let design = seed_design(&mut store, ProductComplexity::CutAndSew);
            let partner = actor();
            let bid = seed_bid(&mut store, &design, partner);
            must(store.accept_bid(bid.id, partner));

            for _ in 0..rereads {
                prop_assert_eq!(must(store.bid_state(bid.id)), BidState::Accepted);
            }
        }

        #[test]
        fn prop_non_decision_events_never_reach_a_terminal_state(
            codes in prop::collection::vec(0u8..2, 1..30)
        ) {
            let mut store = fixture_store();
            let design = seed_design(&mut store, ProductComplexity::CutAndSew);
            let partner = actor();
            let bid = seed_bid(&mut store, &design, partner);

            for code in codes {
                let mut input = DesignEventInput::new(design.id, event_type_from_code(code), partner);
                if input.event_type.requires_bid() {
                    input.bid_id = Some(bid.id);
                }
                must(store.append_event(&input));
            }

            let state = must(store.bid_state(bid.id));
            prop_assert!(!state.is_terminal());
        }

        #[test]
        fn prop_a_decision_beats_any_expiry_age(accept in any::<bool>(), age_hours in 0i64..2000) {
            let mut store = fixture_store();
            let design = seed_design(&mut store, ProductComplexity::CutAndSew);
            let partner = actor();
            let bid = seed_bid(&mut store, &design, partner);

            let expected = if accept {
                must(store.accept_bid(bid.id, partner).map(|_| ()));
                BidState::Accepted
            } else {
                must(store.reject_bid(bid.id, partner).map(|_| ()));
                BidState::Rejected
            };

            let later = now_utc() + Duration::hours(age_hours);
            prop_assert_eq!(must(store.bid_state_at(bid.id, later)), expected);
        }

        #[test]
        fn prop_replaying_the_event_stream_derives_the_same_state(
            codes in prop::collection::vec(0u8..5, 1..40)
        ) {
            let mut original = fixture_store();
            let design = seed_design(&mut original, ProductComplexity::CutAndSew);
            let partner = actor();
            let bid = seed_bid(&mut original, &design, partner);

            let mut applied = Vec::new();
            for code in codes {
                let event_type = event_type_from_code(code);
                let mut input = DesignEventInput::new(design.id, event_type, partner);
                if event_type.requires_bid() {
                    input.bid_id = Some(bid.id);
                }
                if original.append_event(&input).is_ok() {
                    applied.push(event_type);
                }
            }
            let original_state = must(original.bid_state(bid.id));

            let mut fresh = fixture_store();
            let fresh_design = seed_design(&mut fresh, ProductComplexity::CutAndSew);
            let fresh_bid = seed_bid(&mut fresh, &fresh_design, partner);
            for event_type in applied {
                let mut input = DesignEventInput::new(fresh_design.id, event_type, partner);
                if event_type.requires_bid() {
                    input.bid_id = Some(fresh_bid.id);
                }
                must(fresh.append_event(&input));
            }

            prop_assert_eq!(must(fresh.bid_state(fresh_bid.id)), original_state);
        }
    }
}
