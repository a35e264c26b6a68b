//! Ticket build pipeline and loop scheduler.
//!
//! Tickets live in `.tkt/tickets/`; `tkt build` drives one through the
//! workflows in `.tkt/pipeline.toml`, and `tkt loop` drains the ready queue.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use tkt::context::{BuildContext, LOOP_GUARD_ENV, ensure_creation_allowed};
use tkt::core::duration::parse_duration;
use tkt::core::limits::LoopLimits;
use tkt::core::pipeline::PipelineSpec;
use tkt::core::selector::ready_queue;
use tkt::core::types::BuildOutcome;
use tkt::exit_codes;
use tkt::io::config::load_pipeline;
use tkt::io::events::EventLog;
use tkt::io::executor::HarnessExecutor;
use tkt::io::harness::HarnessRegistry;
use tkt::io::hooks::ShellHookRunner;
use tkt::io::init::{InitOptions, ProjectPaths, find_project_root, init_project};
use tkt::io::prompt::PromptBuilder;
use tkt::io::ticket_store::{FileTicketStore, TicketStore};
use tkt::lifecycle::{loop_status, start_background, stop_background};
use tkt::logging;
use tkt::looping::{StopFile, run_loop};
use tkt::orchestrator::build_ticket;
use tkt::ticket::{Ticket, generate_short_id};

#[derive(Parser)]
#[command(
    name = "tkt",
    version,
    about = "Drive a coding agent through ticket workflows"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.tkt/` with a sample pipeline and prompts.
    Init {
        /// Overwrite the existing pipeline and sample prompts.
        #[arg(short, long)]
        force: bool,
    },
    /// Create an open ticket.
    Create {
        title: String,
        #[arg(long, default_value = "")]
        body: String,
        /// Lower is more urgent.
        #[arg(long)]
        priority: Option<u8>,
        /// Ticket this one depends on (repeatable).
        #[arg(long = "dep")]
        deps: Vec<String>,
    },
    /// Print buildable tickets in scheduling order.
    Ready,
    /// Build one ticket through the pipeline.
    Build { id: String },
    /// Build ready tickets until the queue is empty or a limit is hit.
    Loop {
        #[command(flatten)]
        limits: LimitArgs,
        /// Print the loop report as JSON instead of a summary line.
        #[arg(long)]
        json: bool,
    },
    /// Run the loop in the background.
    Start {
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Stop the background loop and reopen interrupted tickets.
    Stop {
        /// Ask the loop to exit after its current build instead of killing it.
        #[arg(long)]
        graceful: bool,
    },
    /// Show whether the project is provisioned and a loop is running.
    Status,
    /// Check `.tkt/pipeline.toml`.
    Validate,
    /// Print the event history of one ticket.
    History { id: String },
}

#[derive(clap::Args, Debug, Clone, Default)]
struct LimitArgs {
    /// Stop after this many builds.
    #[arg(long)]
    max_tickets: Option<u32>,
    /// Stop starting builds after this long (e.g. `30m`, `1h30m`).
    #[arg(long, value_parser = parse_duration_arg)]
    max_duration: Option<Duration>,
}

impl From<LimitArgs> for LoopLimits {
    fn from(args: LimitArgs) -> Self {
        LoopLimits {
            max_tickets: args.max_tickets,
            max_duration: args.max_duration,
        }
    }
}

fn parse_duration_arg(raw: &str) -> std::result::Result<Duration, String> {
    parse_duration(raw).map_err(|err| format!("{err:#}"))
}

fn main() {
    let cli = Cli::parse();
    let default_level = match cli.command {
        Command::Loop { .. } => "info",
        _ => "warn",
    };
    logging::init(default_level);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Create {
            title,
            body,
            priority,
            deps,
        } => cmd_create(title, body, priority, &deps),
        Command::Ready => cmd_ready(),
        Command::Build { id } => cmd_build(&id),
        Command::Loop { limits, json } => cmd_loop(limits.into(), json),
        Command::Start { limits } => cmd_start(limits.into()),
        Command::Stop { graceful } => cmd_stop(graceful),
        Command::Status => cmd_status(),
        Command::Validate => cmd_validate(),
        Command::History { id } => cmd_history(&id),
    }
}

/// Owned collaborators for one command; borrowed into a `BuildContext`.
struct Project {
    paths: ProjectPaths,
    pipeline: PipelineSpec,
    store: FileTicketStore,
    executor: HarnessExecutor,
    hooks: ShellHookRunner,
    events: EventLog,
    prompts: PromptBuilder,
}

impl Project {
    fn open(paths: ProjectPaths, pipeline: PipelineSpec) -> Self {
        Self {
            store: FileTicketStore::new(&paths.tickets_dir),
            executor: HarnessExecutor::new(HarnessRegistry::for_project(&paths.harnesses_dir)),
            hooks: ShellHookRunner,
            events: EventLog::new(&paths.events_path),
            prompts: PromptBuilder::default(),
            paths,
            pipeline,
        }
    }

    fn context(&self) -> BuildContext<'_> {
        BuildContext {
            paths: &self.paths,
            pipeline: &self.pipeline,
            store: &self.store,
            executor: &self.executor,
            hooks: &self.hooks,
            events: &self.events,
            prompts: &self.prompts,
            loop_guard: false,
        }
    }
}

fn project_paths() -> Result<ProjectPaths> {
    let cwd = std::env::current_dir().context("read current directory")?;
    Ok(ProjectPaths::new(find_project_root(&cwd)?))
}

fn open_project() -> Result<Project> {
    let paths = project_paths()?;
    let pipeline = load_pipeline(&paths.pipeline_path)?;
    Ok(Project::open(paths, pipeline))
}

fn cmd_init(force: bool) -> Result<i32> {
    let cwd = std::env::current_dir().context("read current directory")?;
    let paths = init_project(&cwd, &InitOptions { force })?;
    println!("initialized {}", paths.tkt_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_create(title: String, body: String, priority: Option<u8>, deps: &[String]) -> Result<i32> {
    ensure_creation_allowed(std::env::var_os(LOOP_GUARD_ENV).as_deref())?;
    let paths = project_paths()?;
    let store = FileTicketStore::new(&paths.tickets_dir);
    let taken: HashSet<String> = store.list()?.into_iter().map(|t| t.id).collect();
    let mut id = generate_short_id();
    while taken.contains(&id) {
        id = generate_short_id();
    }

    let mut ticket = Ticket::new(id, title.trim());
    ticket.body = body;
    if let Some(priority) = priority {
        ticket.priority = priority;
    }
    for dep in deps {
        let resolved = store.resolve_id(dep)?;
        ticket.add_dep(&resolved);
    }
    store.save(&ticket)?;
    println!("{}", ticket.id);
    Ok(exit_codes::OK)
}

fn cmd_ready() -> Result<i32> {
    let paths = project_paths()?;
    let tickets = FileTicketStore::new(&paths.tickets_dir).list()?;
    for ticket in ready_queue(&tickets) {
        println!(
            "{}\tp{}\t{}\t{}",
            ticket.id, ticket.priority, ticket.status, ticket.title
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_build(id: &str) -> Result<i32> {
    let project = open_project()?;
    let ctx = project.context();
    let id = ctx.store.resolve_id(id)?;
    let outcome = build_ticket(&ctx, &id)?;
    println!("{}", describe(&id, &outcome));
    Ok(if outcome.is_success() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_loop(limits: LoopLimits, json: bool) -> Result<i32> {
    let project = open_project()?;
    let ctx = project.context();
    let stop = StopFile::new(&project.paths.stop_path);
    let result = run_loop(&ctx, &limits, &stop, |id, outcome| {
        if !json {
            println!("{}", describe(id, outcome));
        }
    })?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("serialize loop report")?
        );
    } else {
        println!("{}", result.summary());
    }
    Ok(result.exit_code())
}

fn cmd_start(limits: LoopLimits) -> Result<i32> {
    let paths = project_paths()?;
    let started = start_background(&paths, &limits)?;
    println!(
        "loop started (pid {}); logging to {}",
        started.pid,
        started.log_path.display()
    );
    Ok(exit_codes::OK)
}

fn cmd_stop(graceful: bool) -> Result<i32> {
    let paths = project_paths()?;
    // Recovery only needs the on_fail hooks, so a broken pipeline must not block a stop.
    let pipeline = match load_pipeline(&paths.pipeline_path) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "pipeline unavailable; recovering without hooks");
            PipelineSpec::with_workflows(BTreeMap::new())
        }
    };
    let project = Project::open(paths, pipeline);
    let outcome = stop_background(&project.context(), graceful)?;
    if outcome.graceful {
        println!("stop requested; the loop exits after its current build");
        return Ok(exit_codes::OK);
    }
    match outcome.signalled {
        Some(pid) => println!("stopped loop (pid {pid})"),
        None => println!("no running loop"),
    }
    if outcome.lock_held {
        println!("loop lock is still held; interrupted tickets were left untouched");
        return Ok(exit_codes::FAILED);
    }
    for id in &outcome.recovered {
        println!("reopened {id}");
    }
    Ok(exit_codes::OK)
}

fn cmd_status() -> Result<i32> {
    let paths = project_paths()?;
    let status = loop_status(&paths)?;
    println!("provisioned: {}", if status.provisioned { "yes" } else { "no" });
    match (status.running, status.pid) {
        (true, Some(pid)) => println!("loop: running (pid {pid})"),
        (true, None) => println!("loop: running"),
        (false, _) => println!("loop: stopped"),
    }
    if let Some(line) = status.last_log_line {
        println!("last log: {line}");
    }
    Ok(exit_codes::OK)
}

fn cmd_validate() -> Result<i32> {
    let paths = project_paths()?;
    let pipeline = load_pipeline(&paths.pipeline_path)?;
    println!(
        "{}: ok ({} workflows)",
        paths.pipeline_path.display(),
        pipeline.workflows.len()
    );
    Ok(exit_codes::OK)
}

fn cmd_history(id: &str) -> Result<i32> {
    let paths = project_paths()?;
    let id = FileTicketStore::new(&paths.tickets_dir).resolve_id(id)?;
    for record in EventLog::new(&paths.events_path).read(Some(id.as_str()))? {
        let fields = serde_json::Value::Object(record.fields);
        println!("{}\t{}\t{}", record.timestamp, record.event, fields);
    }
    Ok(exit_codes::OK)
}

fn describe(id: &str, outcome: &BuildOutcome) -> String {
    match outcome {
        BuildOutcome::Succeeded { workflow, status } => {
            format!("{id}: succeeded in {workflow} ({status})")
        }
        BuildOutcome::Failed { stage, reason } => format!("{id}: failed at {stage}: {reason}"),
        BuildOutcome::Blocked {
            stage,
            reason,
            blocked_on,
        } => match blocked_on {
            Some(dep) => format!("{id}: blocked at {stage} on {dep}: {reason}"),
            None => format!("{id}: blocked at {stage}: {reason}"),
        },
        BuildOutcome::Decomposed { children } => {
            format!("{id}: decomposed into {}", children.join(", "))
        }
    }
}
