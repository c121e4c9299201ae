//! Common test utilities
//!
//! In-memory stand-ins for the controller's external seams: a scripted
//! command executor, an artifact fetcher that writes files directly, a
//! resource store backed by a map and a fixed source resolver.

#![allow(dead_code, reason = "shared by several test crates, each using a subset")]

use async_trait::async_trait;
use kustomize_controller::controller::exec::{
    CommandExecutor, CommandOutput, CommandRequest, ExecError,
};
use kustomize_controller::controller::lock::LockManager;
use kustomize_controller::controller::reconciler::{
    ResourceStore, SourceError, SourceResolver, SourceState, StoreError,
};
use kustomize_controller::controller::sync::{
    Artifact, ArtifactError, ArtifactFetcher, SyncPipeline, SyncSettings,
};
use kustomize_controller::controller::workspace::WorkspaceProvisioner;
use kustomize_controller::crd::{Kustomization, KustomizationSpec, KustomizationStatus, SourceRef};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NAMESPACE: &str = "flux-system";
pub const NAME: &str = "podinfo";

pub const RENDERED_MANIFEST: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: dev\n";
pub const APPLY_OUTPUT: &str = "namespace/dev created\ndeployment.apps/podinfo configured\n";

/// Build a Kustomization from a JSON spec
pub fn kustomization(spec: serde_json::Value) -> Kustomization {
    let spec: KustomizationSpec = serde_json::from_value(spec).expect("valid Kustomization spec");
    let mut obj = Kustomization::new(NAME, spec);
    obj.metadata.namespace = Some(NAMESPACE.to_string());
    obj.metadata.generation = Some(1);
    obj
}

/// Minimal spec: `./` from GitRepository `podinfo` every 5 minutes
pub fn basic_spec() -> serde_json::Value {
    serde_json::json!({
        "sourceRef": { "kind": "GitRepository", "name": "podinfo" },
        "path": "./",
        "interval": "5m"
    })
}

pub fn artifact() -> Artifact {
    Artifact {
        url: "http://source-controller/gitrepository/flux-system/podinfo/latest.tar.gz".to_string(),
        revision: Some("main/6f0a2b1".to_string()),
        checksum: None,
    }
}

pub fn settings() -> SyncSettings {
    SyncSettings {
        kustomize_bin: "kustomize".to_string(),
        kubectl_bin: "kubectl".to_string(),
        fetch_timeout: Duration::from_secs(15),
        apply_grace: Duration::from_secs(1),
    }
}

/// Sync pipeline over in-process locks and fakes, with workspaces under `root`
pub fn pipeline(
    root: &Path,
    fetcher: Arc<FakeFetcher>,
    executor: Arc<FakeExecutor>,
) -> SyncPipeline {
    SyncPipeline::new(
        Arc::new(LockManager::in_process()),
        WorkspaceProvisioner::new(root),
        fetcher,
        executor,
        settings(),
    )
}

/// Entries left under a workspace root
pub fn leftover_entries(root: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(root)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default()
}

/// Which tool invocation a request is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Build,
    Validate,
    Apply,
    Rollout,
    Other,
}

impl Stage {
    pub fn of(request: &CommandRequest) -> Self {
        let args = &request.args;
        if args.first().map(String::as_str) == Some("build") {
            Stage::Build
        } else if args.iter().any(|arg| arg.starts_with("--dry-run=")) {
            Stage::Validate
        } else if args.first().map(String::as_str) == Some("apply") {
            Stage::Apply
        } else if args.iter().any(|arg| arg == "rollout") {
            Stage::Rollout
        } else {
            Stage::Other
        }
    }
}

/// Scripted reply for one stage
#[derive(Debug, Clone)]
pub enum Reply {
    Exit {
        code: i32,
        stdout: String,
        combined: String,
    },
    TimedOut {
        output: String,
    },
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Exit {
            code: 0,
            stdout: stdout.to_string(),
            combined: stdout.to_string(),
        }
    }

    pub fn fail(code: i32, combined: &str) -> Self {
        Reply::Exit {
            code,
            stdout: String::new(),
            combined: combined.to_string(),
        }
    }
}

/// One recorded invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stage: Stage,
    pub request: CommandRequest,
    /// File names present in the working directory when the command started
    pub files: Vec<String>,
}

/// [`CommandExecutor`] that replays scripted replies per stage
#[derive(Debug, Default)]
pub struct FakeExecutor {
    replies: Mutex<HashMap<Stage, Reply>>,
    /// Replies for rollout checks keyed by workload name
    rollout_replies: Mutex<HashMap<String, Reply>>,
    delay: Mutex<Option<Duration>>,
    invocations: Mutex<Vec<Invocation>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeExecutor {
    pub fn new() -> Self {
        let executor = Self::default();
        executor.reply(Stage::Build, Reply::ok(RENDERED_MANIFEST));
        executor.reply(Stage::Apply, Reply::ok(APPLY_OUTPUT));
        executor
    }

    pub fn reply(&self, stage: Stage, reply: Reply) {
        self.replies.lock().expect("replies lock").insert(stage, reply);
    }

    pub fn reply_rollout(&self, workload: &str, reply: Reply) {
        self.rollout_replies
            .lock()
            .expect("rollout replies lock")
            .insert(workload.to_string(), reply);
    }

    /// Make every invocation take `delay`
    pub fn delay(&self, delay: Duration) {
        *self.delay.lock().expect("delay lock") = Some(delay);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().expect("invocations lock").clone()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.invocations().iter().map(|i| i.stage).collect()
    }

    pub fn requests_for(&self, stage: Stage) -> Vec<CommandRequest> {
        self.invocations()
            .into_iter()
            .filter(|i| i.stage == stage)
            .map(|i| i.request)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, ExecError> {
        let stage = Stage::of(request);
        let files = std::fs::read_dir(&request.working_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok().map(|e| e.file_name().to_string_lossy().into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        self.invocations.lock().expect("invocations lock").push(Invocation {
            stage,
            request: request.clone(),
            files,
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let rollout_reply = if stage == Stage::Rollout {
            request.args.get(5).and_then(|workload| {
                self.rollout_replies
                    .lock()
                    .expect("rollout replies lock")
                    .get(workload)
                    .cloned()
            })
        } else {
            None
        };
        let reply = rollout_reply
            .or_else(|| self.replies.lock().expect("replies lock").get(&stage).cloned())
            .unwrap_or_else(|| Reply::ok(""));

        match reply {
            Reply::Exit {
                code,
                stdout,
                combined,
            } => Ok(CommandOutput {
                exit_code: Some(code),
                stdout,
                combined,
            }),
            Reply::TimedOut { output } => Err(ExecError::TimedOut {
                program: request.program.clone(),
                timeout: request.timeout,
                output,
            }),
        }
    }
}

/// How [`FakeFetcher`] behaves
#[derive(Debug, Clone)]
pub enum FetchBehavior {
    /// Write these `(relative path, contents)` files into the workspace
    Files(Vec<(String, String)>),
    /// Fail with HTTP 404
    NotFound,
    /// Never finish
    Hang,
}

/// [`ArtifactFetcher`] that writes files straight into the workspace
#[derive(Debug)]
pub struct FakeFetcher {
    behavior: Mutex<FetchBehavior>,
    destinations: Mutex<Vec<PathBuf>>,
}

impl FakeFetcher {
    /// Artifact containing a root `kustomization.yaml`
    pub fn new() -> Self {
        Self::with_files(&[("kustomization.yaml", "resources: []\n")])
    }

    pub fn with_files(files: &[(&str, &str)]) -> Self {
        Self::with_behavior(FetchBehavior::Files(
            files
                .iter()
                .map(|(path, contents)| ((*path).to_string(), (*contents).to_string()))
                .collect(),
        ))
    }

    pub fn with_behavior(behavior: FetchBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            destinations: Mutex::new(Vec::new()),
        }
    }

    /// Workspaces the fetcher was asked to fill
    pub fn destinations(&self) -> Vec<PathBuf> {
        self.destinations.lock().expect("destinations lock").clone()
    }
}

#[async_trait]
impl ArtifactFetcher for FakeFetcher {
    async fn fetch(&self, artifact: &Artifact, destination: &Path) -> Result<(), ArtifactError> {
        self.destinations
            .lock()
            .expect("destinations lock")
            .push(destination.to_path_buf());

        let behavior = self.behavior.lock().expect("behavior lock").clone();
        match behavior {
            FetchBehavior::Files(files) => {
                for (path, contents) in files {
                    let target = destination.join(path);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent).expect("create artifact dir");
                    }
                    std::fs::write(target, contents).expect("write artifact file");
                }
                Ok(())
            }
            FetchBehavior::NotFound => Err(ArtifactError::HttpStatus {
                url: artifact.url.clone(),
                status: 404,
            }),
            FetchBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// [`ResourceStore`] backed by a map
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: Mutex<HashMap<(String, String), Kustomization>>,
    status_writes: Mutex<Vec<KustomizationStatus>>,
    fail_updates: Mutex<bool>,
}

impl InMemoryStore {
    pub fn with(obj: Kustomization) -> Self {
        let store = Self::default();
        store.insert(obj);
        store
    }

    pub fn insert(&self, obj: Kustomization) {
        let key = (
            obj.metadata.namespace.clone().unwrap_or_default(),
            obj.metadata.name.clone().unwrap_or_default(),
        );
        self.objects.lock().expect("objects lock").insert(key, obj);
    }

    pub fn fail_updates(&self, fail: bool) {
        *self.fail_updates.lock().expect("fail lock") = fail;
    }

    pub fn status_writes(&self) -> Vec<KustomizationStatus> {
        self.status_writes.lock().expect("status lock").clone()
    }

    pub fn last_status(&self) -> KustomizationStatus {
        self.status_writes()
            .last()
            .cloned()
            .expect("at least one status write")
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Kustomization>, StoreError> {
        Ok(self
            .objects
            .lock()
            .expect("objects lock")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &KustomizationStatus,
    ) -> Result<(), StoreError> {
        if *self.fail_updates.lock().expect("fail lock") {
            return Err(StoreError::Backend("etcd unavailable".to_string()));
        }
        self.status_writes
            .lock()
            .expect("status lock")
            .push(status.clone());
        if let Some(obj) = self
            .objects
            .lock()
            .expect("objects lock")
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            obj.status = Some(status.clone());
        }
        Ok(())
    }
}

/// What [`StaticResolver`] answers
#[derive(Debug, Clone)]
pub enum SourceAnswer {
    Ready(Artifact),
    NotReady,
    LookupFailure(String),
}

/// [`SourceResolver`] with a fixed answer; rejects kinds other than GitRepository
#[derive(Debug)]
pub struct StaticResolver {
    answer: SourceAnswer,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new(answer: SourceAnswer) -> Self {
        Self {
            answer,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceResolver for StaticResolver {
    async fn resolve(&self, _namespace: &str, source_ref: &SourceRef) -> Result<SourceState, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if source_ref.kind != "GitRepository" {
            return Err(SourceError::UnsupportedKind {
                kind: source_ref.kind.clone(),
                name: source_ref.name.clone(),
            });
        }
        match &self.answer {
            SourceAnswer::Ready(artifact) => Ok(SourceState::Ready(artifact.clone())),
            SourceAnswer::NotReady => Ok(SourceState::NotReady),
            SourceAnswer::LookupFailure(message) => Err(SourceError::Backend(message.clone())),
        }
    }
}
