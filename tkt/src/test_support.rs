//! Scripted fakes and a temporary project fixture for build tests.

use std::cell::RefCell;
use std::collections::VecDeque;

use tempfile::TempDir;

use crate::context::BuildContext;
use crate::core::pipeline::PipelineSpec;
use crate::error::ExecutionError;
use crate::io::config::load_pipeline;
use crate::io::events::EventLog;
use crate::io::executor::{AgentRequest, Executor};
use crate::io::hooks::{HookRequest, HookRunner};
use crate::io::init::{InitOptions, ProjectPaths, init_project};
use crate::io::prompt::PromptBuilder;
use crate::io::ticket_store::{FileTicketStore, TicketStore};
use crate::ticket::{Status, Ticket};

/// Agent output containing a fenced disposition record.
pub fn decision(json: &str) -> String {
    format!("Looked at the ticket.\n\n```json\n{json}\n```\n")
}

/// Executor that replays queued responses and records the prompts it saw.
#[derive(Default)]
pub struct ScriptedExecutor {
    responses: RefCell<VecDeque<Result<String, ExecutionError>>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn push(&self, response: Result<String, ExecutionError>) {
        self.responses.borrow_mut().push_back(response);
    }

    pub fn push_ok(&self, output: impl Into<String>) {
        self.push(Ok(output.into()));
    }

    pub fn push_decision(&self, json: &str) {
        self.push_ok(decision(json));
    }

    /// Queue a crash-like failure (non-zero exit).
    pub fn push_crash(&self, output: &str) {
        self.push(Err(ExecutionError::NonZeroExit {
            code: Some(1),
            output: output.to_string(),
        }));
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.borrow().len()
    }
}

impl Executor for ScriptedExecutor {
    fn run_agent(&self, request: &AgentRequest<'_>) -> Result<String, ExecutionError> {
        self.prompts.borrow_mut().push(request.prompt.to_string());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(ExecutionError::Harness("no scripted response left".into())))
    }
}

/// Hook runner that records rendered commands and fails those containing `fail_on`.
#[derive(Default)]
pub struct RecordingHookRunner {
    pub fail_on: Option<String>,
    commands: RefCell<Vec<String>>,
}

impl RecordingHookRunner {
    pub fn failing_on(pattern: &str) -> Self {
        Self {
            fail_on: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl HookRunner for RecordingHookRunner {
    fn run(&self, request: &HookRequest<'_>) -> Result<(), ExecutionError> {
        self.commands.borrow_mut().push(request.command.to_string());
        match &self.fail_on {
            Some(pattern) if request.command.contains(pattern.as_str()) => {
                Err(ExecutionError::NonZeroExit {
                    code: Some(1),
                    output: format!("{pattern} failed"),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Initialized project in a temp dir with a custom pipeline and scripted collaborators.
pub struct TestProject {
    _temp: TempDir,
    pub paths: ProjectPaths,
    pub pipeline: PipelineSpec,
    pub store: FileTicketStore,
    pub executor: ScriptedExecutor,
    pub hooks: RecordingHookRunner,
    pub events: EventLog,
    pub prompts: PromptBuilder,
}

impl TestProject {
    /// Initialize `.tkt/`, then replace the sample pipeline with `pipeline_toml`.
    pub fn new(pipeline_toml: &str) -> Self {
        Self::with_hooks(pipeline_toml, RecordingHookRunner::default())
    }

    pub fn with_hooks(pipeline_toml: &str, hooks: RecordingHookRunner) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions::default()).expect("init");
        std::fs::write(&paths.pipeline_path, pipeline_toml).expect("write pipeline");
        let pipeline = load_pipeline(&paths.pipeline_path).expect("load pipeline");
        Self {
            store: FileTicketStore::new(&paths.tickets_dir),
            events: EventLog::new(&paths.events_path),
            executor: ScriptedExecutor::default(),
            hooks,
            prompts: PromptBuilder::default(),
            pipeline,
            paths,
            _temp: temp,
        }
    }

    pub fn context(&self) -> BuildContext<'_> {
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

    /// Save an open ticket and return it.
    pub fn add_ticket(&self, id: &str, title: &str) -> Ticket {
        let ticket = Ticket::new(id, title);
        self.store.save(&ticket).expect("save ticket");
        ticket
    }

    pub fn add_ticket_with(&self, id: &str, status: Status, priority: u8, deps: &[&str]) -> Ticket {
        let mut ticket = Ticket::new(id, format!("{id} title"));
        ticket.status = status;
        ticket.priority = priority;
        ticket.deps = deps.iter().map(|d| d.to_string()).collect();
        self.store.save(&ticket).expect("save ticket");
        ticket
    }

    pub fn ticket(&self, id: &str) -> Ticket {
        self.store.load(id).expect("load ticket")
    }

    pub fn write_prompt(&self, name: &str, text: &str) {
        std::fs::write(self.paths.prompts_dir.join(format!("{name}.md")), text)
            .expect("write prompt");
    }
}
