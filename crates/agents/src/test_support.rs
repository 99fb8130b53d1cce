//! In-process fakes for sandboxes and LLM providers.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    crucible_sandbox::{
        FileEntry, FileKind, ProviderKind, SandboxFactory, SandboxRuntime,
        provider::{CommandOutput, SandboxCreateInput},
    },
};

use crate::model::{
    CompletionRequest, CompletionResponse, EventStream, LlmProvider, StopReason, StreamEvent,
    ToolCall, Usage,
};

// ── Sandbox ─────────────────────────────────────────────────────────────────

/// Filesystem in a map. Running a script "creates" the configured files.
pub struct FakeSandbox {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    commands: Mutex<Vec<String>>,
    exit_code: i32,
    stdout: String,
    stderr: String,
    creates: Vec<(String, Vec<u8>)>,
    fail_installs: bool,
    latency: Duration,
    killed: AtomicBool,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            creates: Vec::new(),
            fail_installs: false,
            latency: Duration::ZERO,
            killed: AtomicBool::new(false),
        }
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }

    pub fn with_exit(mut self, exit_code: i32, stderr: &str) -> Self {
        self.exit_code = exit_code;
        self.stderr = stderr.to_string();
        self
    }

    /// Files written under `/home/user/` whenever a script runs.
    pub fn creating(mut self, name: &str, content: &[u8]) -> Self {
        self.creates
            .push((format!("/home/user/{name}"), content.to_vec()));
        self
    }

    /// How long each script run takes.
    pub fn with_latency(mut self, millis: u64) -> Self {
        self.latency = Duration::from_millis(millis);
        self
    }

    pub fn failing_installs(mut self) -> Self {
        self.fail_installs = true;
        self
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxRuntime for FakeSandbox {
    fn provider(&self) -> ProviderKind {
        ProviderKind::LocalMicrovm
    }

    async fn run_command(
        &self,
        command: &str,
        _timeout_ms: u64,
    ) -> crucible_sandbox::Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        if command.starts_with("pip install") || command.starts_with("npm install") {
            return Ok(CommandOutput {
                exit_code: i32::from(self.fail_installs),
                stdout: String::new(),
                stderr: if self.fail_installs {
                    "No matching distribution".into()
                } else {
                    String::new()
                },
            });
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut files = self.files.lock().unwrap();
        for (path, content) in &self.creates {
            files.insert(path.clone(), content.clone());
        }
        Ok(CommandOutput {
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        })
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> crucible_sandbox::Result<()> {
        self.put_file(path, content);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> crucible_sandbox::Result<Vec<u8>> {
        self.file(path)
            .ok_or_else(|| crucible_sandbox::Error::message(format!("no such file: {path}")))
    }

    async fn list_files(&self, path: &str) -> crucible_sandbox::Result<Vec<FileEntry>> {
        let dir = path.trim_end_matches('/');
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(file, content)| {
                let (parent, name) = file.rsplit_once('/')?;
                (parent == dir).then(|| FileEntry {
                    name: name.to_string(),
                    path: file.clone(),
                    kind: FileKind::File,
                    size: Some(content.len() as u64),
                })
            })
            .collect())
    }

    async fn kill(&self) -> crucible_sandbox::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out the same sandbox for every session.
pub struct FakeFactory {
    pub sandbox: Arc<FakeSandbox>,
    pub created: AtomicUsize,
}

impl FakeFactory {
    pub fn new(sandbox: Arc<FakeSandbox>) -> Self {
        Self {
            sandbox,
            created: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SandboxFactory for FakeFactory {
    async fn local_ready(&self) -> bool {
        true
    }

    async fn create(
        &self,
        _kind: ProviderKind,
        _input: &SandboxCreateInput,
    ) -> crucible_sandbox::Result<Arc<dyn SandboxRuntime>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.sandbox) as Arc<dyn SandboxRuntime>)
    }
}

// ── LLM ─────────────────────────────────────────────────────────────────────

/// Replies with queued responses in order and records every request.
pub struct ScriptedLlm {
    model: String,
    replies: Mutex<VecDeque<CompletionResponse>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, text: &str) -> Self {
        self.push(CompletionResponse {
            text: Some(text.to_string()),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 20,
            },
            ..Default::default()
        })
    }

    pub fn call_tool(self, id: &str, name: &str, arguments: serde_json::Value) -> Self {
        self.push(CompletionResponse {
            text: None,
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }],
            usage: Usage {
                input_tokens: 100,
                output_tokens: 20,
            },
            stop_reason: StopReason::ToolUse,
        })
    }

    pub fn push(self, response: CompletionResponse) -> Self {
        self.replies.lock().unwrap().push_back(response);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self, request: &CompletionRequest) -> Option<CompletionResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    fn id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        self.next(request)
            .ok_or_else(|| anyhow::anyhow!("scripted LLM has no reply left"))
    }

    fn stream(&self, request: CompletionRequest) -> EventStream<'_> {
        let events = match self.next(&request) {
            Some(response) => {
                let text = response.text.unwrap_or_default();
                let mut events: Vec<StreamEvent> = text
                    .split_inclusive(' ')
                    .map(|chunk| StreamEvent::Delta(chunk.to_string()))
                    .collect();
                events.push(StreamEvent::Done(response.usage));
                events
            },
            None => vec![StreamEvent::Error("scripted LLM has no reply left".into())],
        };
        Box::pin(tokio_stream::iter(events))
    }
}
