//! Stable embedded command surface for the Atelier workflow store.
//!
//! Host processes should drive the workflow through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteWorkflowStore`].

use std::path::PathBuf;

use anyhow::{Context, Result};
use atelier_flow_core::{
    parse_rfc3339_utc, BidAssignee, BidId, CollaboratorId, CollectionId, DesignEventType,
    DesignId, ProductComplexity, QuoteId, StepId, SubmissionId, TeamId, UserId,
};
use atelier_flow_store_sqlite::{EventFilter, SqliteWorkflowStore};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "atl")]
#[command(about = "Atelier production workflow CLI")]
pub struct Cli {
    #[arg(long, default_value = "./atelier_flow.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Collections {
        #[command(subcommand)]
        command: Box<CollectionsCommand>,
    },
    Designs {
        #[command(subcommand)]
        command: Box<DesignsCommand>,
    },
    Quotes {
        #[command(subcommand)]
        command: Box<QuotesCommand>,
    },
    Invoices {
        #[command(subcommand)]
        command: Box<InvoicesCommand>,
    },
    Costing {
        #[command(subcommand)]
        command: Box<CostingCommand>,
    },
    Bids {
        #[command(subcommand)]
        command: Box<BidsCommand>,
    },
    Checkout {
        #[command(subcommand)]
        command: Box<CheckoutCommand>,
    },
    Steps {
        #[command(subcommand)]
        command: Box<StepsCommand>,
    },
    Submissions {
        #[command(subcommand)]
        command: Box<SubmissionsCommand>,
    },
    Events {
        #[command(subcommand)]
        command: Box<EventsCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum CollectionsCommand {
    Create,
    Reject(CollectionActorArgs),
}

#[derive(Debug, Args)]
pub struct CollectionActorArgs {
    #[arg(long)]
    collection_id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Subcommand)]
pub enum DesignsCommand {
    Create(DesignsCreateArgs),
}

#[derive(Debug, Args)]
pub struct DesignsCreateArgs {
    #[arg(long)]
    collection_id: Option<String>,
    #[arg(long)]
    complexity: ComplexityArg,
}

#[derive(Debug, Subcommand)]
pub enum QuotesCommand {
    Create(QuotesCreateArgs),
}

#[derive(Debug, Args)]
pub struct QuotesCreateArgs {
    #[arg(long)]
    design_id: String,
    #[arg(long)]
    unit_cost_cents: i64,
}

#[derive(Debug, Subcommand)]
pub enum InvoicesCommand {
    Create(InvoicesCreateArgs),
}

#[derive(Debug, Args)]
pub struct InvoicesCreateArgs {
    #[arg(long)]
    collection_id: String,
    #[arg(long)]
    total_cents: i64,
}

#[derive(Debug, Subcommand)]
pub enum CostingCommand {
    Commit(CostingCommitArgs),
}

#[derive(Debug, Args)]
pub struct CostingCommitArgs {
    #[arg(long)]
    design_id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Subcommand)]
pub enum BidsCommand {
    Create(BidsCreateArgs),
    Accept(BidActorArgs),
    Reject(BidActorArgs),
    RemovePartner(BidActorArgs),
    State(BidsStateArgs),
}

#[derive(Debug, Args)]
pub struct BidsCreateArgs {
    #[arg(long)]
    quote_id: String,
    #[arg(long)]
    actor: String,
    #[arg(long, conflicts_with = "assignee_team")]
    assignee_user: Option<String>,
    #[arg(long)]
    assignee_team: Option<String>,
    #[arg(long)]
    due_date: Option<String>,
}

#[derive(Debug, Args)]
pub struct BidActorArgs {
    #[arg(long)]
    bid_id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
pub struct BidsStateArgs {
    #[arg(long)]
    bid_id: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum CheckoutCommand {
    CommitQuote(CheckoutCommitQuoteArgs),
    Reverse(CollectionActorArgs),
}

#[derive(Debug, Args)]
pub struct CheckoutCommitQuoteArgs {
    #[arg(long)]
    design_id: String,
    #[arg(long)]
    quote_id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Subcommand)]
pub enum StepsCommand {
    List(StepsListArgs),
    Complete(StepActorArgs),
    Reopen(StepActorArgs),
}

#[derive(Debug, Args)]
pub struct StepsListArgs {
    #[arg(long)]
    design_id: String,
}

#[derive(Debug, Args)]
pub struct StepActorArgs {
    #[arg(long)]
    step_id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Subcommand)]
pub enum SubmissionsCommand {
    List(SubmissionsListArgs),
    Assign(SubmissionsAssignArgs),
    Submit(SubmissionActorArgs),
    Approve(SubmissionActorArgs),
    RequestRevision(SubmissionActorArgs),
}

#[derive(Debug, Args)]
pub struct SubmissionsListArgs {
    #[arg(long)]
    step_id: String,
}

#[derive(Debug, Args)]
pub struct SubmissionsAssignArgs {
    #[arg(long)]
    submission_id: String,
    #[arg(long)]
    actor: String,
    #[arg(long, conflicts_with = "team_user_id")]
    collaborator_id: Option<String>,
    #[arg(long)]
    team_user_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct SubmissionActorArgs {
    #[arg(long)]
    submission_id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    List(EventsListArgs),
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long)]
    design_id: Option<String>,
    #[arg(long)]
    bid_id: Option<String>,
    #[arg(long = "type")]
    event_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ComplexityArg {
    Blank,
    CutAndSew,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails;
/// business conflicts surface as non-zero exits with their typed message.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided sqlite DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_command_with_db(db_path: &std::path::Path, command: Command) -> Result<()> {
    let mut store = SqliteWorkflowStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when parsing, validation, or persistence fails.
pub fn run_command(command: Command, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        Command::Collections { command } => run_collections(*command, store),
        Command::Designs { command } => run_designs(*command, store),
        Command::Quotes { command } => run_quotes(*command, store),
        Command::Invoices { command } => run_invoices(*command, store),
        Command::Costing { command } => run_costing(*command, store),
        Command::Bids { command } => run_bids(*command, store),
        Command::Checkout { command } => run_checkout(*command, store),
        Command::Steps { command } => run_steps(*command, store),
        Command::Submissions { command } => run_submissions(*command, store),
        Command::Events { command } => run_events(*command, store),
    }
}

fn run_collections(command: CollectionsCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        CollectionsCommand::Create => {
            let collection_id = store.create_collection()?;
            print_json(&serde_json::json!({ "collection_id": collection_id }))
        }
        CollectionsCommand::Reject(args) => {
            let collection_id = CollectionId(parse_ulid(&args.collection_id, "collection id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let events = store.reject_collection(collection_id, actor)?;
            print_json(&events)
        }
    }
}

fn run_designs(command: DesignsCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        DesignsCommand::Create(args) => {
            let collection_id = args
                .collection_id
                .as_deref()
                .map(|raw| parse_ulid(raw, "collection id").map(CollectionId))
                .transpose()?;
            let design = store.create_design(collection_id, map_complexity(args.complexity))?;
            print_json(&design)
        }
    }
}

fn run_quotes(command: QuotesCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        QuotesCommand::Create(args) => {
            let design_id = DesignId(parse_ulid(&args.design_id, "design id")?);
            let quote_id = store.create_quote(design_id, args.unit_cost_cents)?;
            print_json(&serde_json::json!({ "quote_id": quote_id }))
        }
    }
}

fn run_invoices(command: InvoicesCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        InvoicesCommand::Create(args) => {
            let collection_id = CollectionId(parse_ulid(&args.collection_id, "collection id")?);
            let invoice_id = store.create_invoice(collection_id, args.total_cents)?;
            print_json(&serde_json::json!({ "invoice_id": invoice_id }))
        }
    }
}

fn run_costing(command: CostingCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        CostingCommand::Commit(args) => {
            let design_id = DesignId(parse_ulid(&args.design_id, "design id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let event = store.commit_cost_inputs(design_id, actor)?;
            print_json(&event)
        }
    }
}

fn run_bids(command: BidsCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        BidsCommand::Create(args) => {
            let quote_id = QuoteId(parse_ulid(&args.quote_id, "quote id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let assignee = match (args.assignee_user.as_deref(), args.assignee_team.as_deref()) {
                (Some(user), None) => BidAssignee::User(UserId(parse_ulid(user, "assignee user")?)),
                (None, Some(team)) => BidAssignee::Team(TeamId(parse_ulid(team, "assignee team")?)),
                _ => anyhow::bail!("exactly one of --assignee-user or --assignee-team is required"),
            };
            let due_date = args
                .due_date
                .as_deref()
                .map(|raw| parse_rfc3339_utc(raw).map_err(anyhow::Error::new))
                .transpose()?;
            let bid = store.create_bid(quote_id, actor, assignee, due_date)?;
            print_json(&bid)
        }
        BidsCommand::Accept(args) => {
            let bid_id = BidId(parse_ulid(&args.bid_id, "bid id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let acceptance = store.accept_bid(bid_id, actor)?;
            print_json(&acceptance)
        }
        BidsCommand::Reject(args) => {
            let bid_id = BidId(parse_ulid(&args.bid_id, "bid id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let event = store.reject_bid(bid_id, actor)?;
            print_json(&event)
        }
        BidsCommand::RemovePartner(args) => {
            let bid_id = BidId(parse_ulid(&args.bid_id, "bid id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let event = store.remove_partner(bid_id, actor)?;
            print_json(&event)
        }
        BidsCommand::State(args) => {
            let bid_id = BidId(parse_ulid(&args.bid_id, "bid id")?);
            let state = match args.as_of.as_deref() {
                Some(raw) => {
                    let as_of = parse_rfc3339_utc(raw).map_err(anyhow::Error::new)?;
                    store.bid_state_at(bid_id, as_of)?
                }
                None => store.bid_state(bid_id)?,
            };
            print_json(&serde_json::json!({ "bid_id": bid_id, "state": state }))
        }
    }
}

fn run_checkout(command: CheckoutCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        CheckoutCommand::CommitQuote(args) => {
            let design_id = DesignId(parse_ulid(&args.design_id, "design id")?);
            let quote_id = QuoteId(parse_ulid(&args.quote_id, "quote id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let commit = store.commit_quote(design_id, quote_id, actor)?;
            print_json(&commit)
        }
        CheckoutCommand::Reverse(args) => {
            let collection_id = CollectionId(parse_ulid(&args.collection_id, "collection id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let reversal = store.reverse_collection_checkout(collection_id, actor)?;
            print_json(&reversal)
        }
    }
}

fn run_steps(command: StepsCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        StepsCommand::List(args) => {
            let design_id = DesignId(parse_ulid(&args.design_id, "design id")?);
            let steps = store.steps_for_design(design_id)?;
            print_json(&steps)
        }
        StepsCommand::Complete(args) => {
            let step_id = StepId(parse_ulid(&args.step_id, "step id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let (step, event) = store.complete_step(step_id, actor)?;
            print_json(&serde_json::json!({ "step": step, "event": event }))
        }
        StepsCommand::Reopen(args) => {
            let step_id = StepId(parse_ulid(&args.step_id, "step id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let (step, event) = store.reopen_step(step_id, actor)?;
            print_json(&serde_json::json!({ "step": step, "event": event }))
        }
    }
}

fn run_submissions(command: SubmissionsCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        SubmissionsCommand::List(args) => {
            let step_id = StepId(parse_ulid(&args.step_id, "step id")?);
            let submissions = store.submissions_for_step(step_id)?;
            print_json(&submissions)
        }
        SubmissionsCommand::Assign(args) => {
            let submission_id = SubmissionId(parse_ulid(&args.submission_id, "submission id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let collaborator_id = args
                .collaborator_id
                .as_deref()
                .map(|raw| parse_ulid(raw, "collaborator id").map(CollaboratorId))
                .transpose()?;
            let team_user_id = args
                .team_user_id
                .as_deref()
                .map(|raw| parse_ulid(raw, "team user id").map(UserId))
                .transpose()?;
            let change =
                store.assign_submission(submission_id, actor, collaborator_id, team_user_id)?;
            print_json(&change)
        }
        SubmissionsCommand::Submit(args) => {
            let submission_id = SubmissionId(parse_ulid(&args.submission_id, "submission id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let change = store.submit_submission(submission_id, actor)?;
            print_json(&change)
        }
        SubmissionsCommand::Approve(args) => {
            let submission_id = SubmissionId(parse_ulid(&args.submission_id, "submission id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let change = store.approve_submission(submission_id, actor)?;
            print_json(&change)
        }
        SubmissionsCommand::RequestRevision(args) => {
            let submission_id = SubmissionId(parse_ulid(&args.submission_id, "submission id")?);
            let actor = UserId(parse_ulid(&args.actor, "actor id")?);
            let change = store.request_submission_revision(submission_id, actor)?;
            print_json(&change)
        }
    }
}

fn run_events(command: EventsCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        EventsCommand::List(args) => {
            let mut event_types = Vec::with_capacity(args.event_types.len());
            for raw in &args.event_types {
                let event_type = DesignEventType::parse(raw)
                    .with_context(|| format!("unknown event type: {raw}"))?;
                event_types.push(event_type);
            }
            let filter = EventFilter {
                design_id: args
                    .design_id
                    .as_deref()
                    .map(|raw| parse_ulid(raw, "design id").map(DesignId))
                    .transpose()?,
                bid_id: args
                    .bid_id
                    .as_deref()
                    .map(|raw| parse_ulid(raw, "bid id").map(BidId))
                    .transpose()?,
                event_types,
            };
            let events = store.find_events(&filter)?;
            print_json(&events)
        }
    }
}

fn map_complexity(arg: ComplexityArg) -> ProductComplexity {
    match arg {
        ComplexityArg::Blank => ProductComplexity::Blank,
        ComplexityArg::CutAndSew => ProductComplexity::CutAndSew,
    }
}

fn parse_ulid(raw: &str, what: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid {what}: {raw}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
