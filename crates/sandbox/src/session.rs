//! Per-user sandbox sessions with provider selection, fallback and expiry.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    crucible_common::time::now_ms,
    crucible_config::CrucibleConfig,
    serde::Serialize,
    tokio::{sync::Mutex, time::Instant},
    tracing::{debug, info, warn},
};

use crate::{
    controller::{IdleAutoStop, MicrovmController},
    error::{Error, Result},
    local::{LocalMicrovmSandbox, collect_garbage},
    probe::ReadinessProber,
    provider::{ProviderKind, ProviderPreference, SandboxCreateInput, SandboxRuntime},
    remote::RemoteSandboxApi,
};

// ── Factory ─────────────────────────────────────────────────────────────────

/// Builds sandboxes and answers readiness questions for the session manager.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Whether the local microVM provider is ready to serve.
    async fn local_ready(&self) -> bool;

    async fn create(
        &self,
        kind: ProviderKind,
        input: &SandboxCreateInput,
    ) -> Result<Arc<dyn SandboxRuntime>>;

    /// Reclaim state orphaned by earlier processes. Best-effort.
    async fn collect_garbage(&self) {}
}

/// Factory over the microVM controller, readiness prober and remote API.
pub struct DefaultSandboxFactory {
    controller: std::result::Result<Arc<MicrovmController>, String>,
    prober: ReadinessProber,
    remote: Option<RemoteSandboxApi>,
}

impl DefaultSandboxFactory {
    pub fn from_config(config: &CrucibleConfig) -> Result<Self> {
        let controller = MicrovmController::from_config(&config.microvm)
            .map(Arc::new)
            .map_err(|e| e.to_string());
        if let Err(e) = &controller {
            warn!(error = %e, "microvm controller unavailable");
        }
        Ok(Self {
            controller,
            prober: ReadinessProber::from_config(&config.sandbox)?,
            remote: RemoteSandboxApi::from_config(&config.sandbox),
        })
    }

    #[must_use]
    pub fn prober(&self) -> &ReadinessProber {
        &self.prober
    }
}

#[async_trait]
impl SandboxFactory for DefaultSandboxFactory {
    async fn local_ready(&self) -> bool {
        self.prober.probe(false, None).await.ok
    }

    async fn create(
        &self,
        kind: ProviderKind,
        input: &SandboxCreateInput,
    ) -> Result<Arc<dyn SandboxRuntime>> {
        match kind {
            ProviderKind::LocalMicrovm => {
                let controller = self.controller.clone().map_err(Error::message)?;
                Ok(Arc::new(LocalMicrovmSandbox::create(controller, input).await?))
            },
            ProviderKind::RemoteE2b => {
                let api = self.remote.as_ref().ok_or_else(|| {
                    Error::message(
                        "remote sandbox API is not configured (set REMOTE_SANDBOX_API_URL)",
                    )
                })?;
                Ok(Arc::new(api.create(input).await?))
            },
        }
    }

    async fn collect_garbage(&self) {
        if let Ok(controller) = &self.controller
            && let Err(e) = collect_garbage(controller).await
        {
            debug!(error = %e, "microvm gc failed");
        }
    }
}

// ── Sessions ────────────────────────────────────────────────────────────────

/// Progress reported while a session is being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    ProbingLocalMicrovm,
    StartingLocalMicrovm,
    FallingBackRemote,
    StartingRemoteSandbox,
}

impl SessionStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProbingLocalMicrovm => "probing_local_microvm",
            Self::StartingLocalMicrovm => "starting_local_microvm",
            Self::FallingBackRemote => "falling_back_remote",
            Self::StartingRemoteSandbox => "starting_remote_sandbox",
        }
    }
}

pub type StageCallback = Arc<dyn Fn(SessionStage) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SessionOptions {
    pub preferred: ProviderPreference,
    /// Never fall back to the remote provider.
    pub strict_no_fallback: bool,
    pub on_stage: Option<StageCallback>,
}

impl SessionOptions {
    fn emit(&self, stage: SessionStage) {
        if let Some(cb) = &self.on_stage {
            cb(stage);
        }
    }
}

struct SandboxSession {
    sandbox: Arc<dyn SandboxRuntime>,
    created_at: Instant,
    created_at_ms: u64,
    provider: ProviderKind,
    requested_provider: ProviderPreference,
    fallback_active: bool,
}

impl SandboxSession {
    /// A fallback session keeps serving the preference that produced it
    /// until it expires, so a broken local backend is not retried per call.
    fn serves(&self, target: ProviderKind, preferred: ProviderPreference) -> bool {
        self.provider == target
            || (self.fallback_active
                && self.requested_provider == preferred
                && target == ProviderKind::LocalMicrovm)
    }
}

/// A session handed to callers.
#[derive(Clone)]
pub struct SessionHandle {
    pub sandbox: Arc<dyn SandboxRuntime>,
    pub provider: ProviderKind,
    pub requested_provider: ProviderPreference,
    pub fallback_active: bool,
}

impl SandboxSession {
    fn handle(&self) -> SessionHandle {
        SessionHandle {
            sandbox: Arc::clone(&self.sandbox),
            provider: self.provider,
            requested_provider: self.requested_provider,
            fallback_active: self.fallback_active,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_remaining_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_active: Option<bool>,
}

/// Caches at most one live sandbox per user.
pub struct SessionManager {
    factory: Arc<dyn SandboxFactory>,
    sessions: Mutex<HashMap<String, SandboxSession>>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    ttl: Duration,
    sweep_interval: Duration,
    allow_remote_fallback: bool,
    sweeper_started: AtomicBool,
    idle_stop: Option<Arc<IdleAutoStop>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(factory: Arc<dyn SandboxFactory>, config: &CrucibleConfig) -> Self {
        Self {
            factory,
            sessions: Mutex::new(HashMap::new()),
            user_locks: Mutex::new(HashMap::new()),
            ttl: Duration::from_millis(config.sandbox.session_ttl_ms),
            sweep_interval: Duration::from_millis(config.sandbox.sweep_interval_ms.max(1)),
            allow_remote_fallback: config.sandbox.allow_remote_fallback,
            sweeper_started: AtomicBool::new(false),
            idle_stop: None,
        }
    }

    /// Re-arm the idle auto-stop timer whenever a local session is used.
    #[must_use]
    pub fn with_idle_auto_stop(mut self, idle_stop: Arc<IdleAutoStop>) -> Self {
        self.idle_stop = Some(idle_stop);
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        Arc::clone(locks.entry(user_id.to_string()).or_default())
    }

    /// Return the user's live session or create one.
    pub async fn get_or_create(
        self: &Arc<Self>,
        user_id: &str,
        options: &SessionOptions,
    ) -> Result<SessionHandle> {
        self.ensure_sweeper();

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let target = match options.preferred.explicit() {
            Some(kind) => kind,
            None => {
                options.emit(SessionStage::ProbingLocalMicrovm);
                if self.factory.local_ready().await {
                    ProviderKind::LocalMicrovm
                } else {
                    ProviderKind::RemoteE2b
                }
            },
        };

        let stale = {
            let mut sessions = self.sessions.lock().await;
            let reusable = sessions
                .get(user_id)
                .filter(|s| {
                    s.serves(target, options.preferred) && s.created_at.elapsed() < self.ttl
                })
                .map(SandboxSession::handle);
            if let Some(handle) = reusable {
                drop(sessions);
                self.touch(handle.provider).await;
                return Ok(handle);
            }
            sessions.remove(user_id)
        };
        if let Some(stale) = stale {
            kill_quietly(user_id, &stale).await;
        }

        let input = SandboxCreateInput {
            user_id: user_id.to_string(),
            timeout_ms: u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX),
        };

        let (sandbox, provider, fallback_active) = match target {
            ProviderKind::LocalMicrovm => {
                options.emit(SessionStage::StartingLocalMicrovm);
                match self.factory.create(ProviderKind::LocalMicrovm, &input).await {
                    Ok(sandbox) => (sandbox, ProviderKind::LocalMicrovm, false),
                    Err(e) if self.allow_remote_fallback && !options.strict_no_fallback => {
                        warn!(user_id, error = %e, "local microvm failed, falling back to remote sandbox");
                        options.emit(SessionStage::FallingBackRemote);
                        let sandbox = self.factory.create(ProviderKind::RemoteE2b, &input).await?;
                        (sandbox, ProviderKind::RemoteE2b, true)
                    },
                    Err(e) => return Err(e),
                }
            },
            ProviderKind::RemoteE2b => {
                options.emit(SessionStage::StartingRemoteSandbox);
                let sandbox = self.factory.create(ProviderKind::RemoteE2b, &input).await?;
                (sandbox, ProviderKind::RemoteE2b, false)
            },
        };

        let session = SandboxSession {
            sandbox,
            created_at: Instant::now(),
            created_at_ms: now_ms(),
            provider,
            requested_provider: options.preferred,
            fallback_active,
        };
        let handle = session.handle();
        self.sessions
            .lock()
            .await
            .insert(user_id.to_string(), session);
        info!(user_id, %provider, fallback_active, "sandbox session created");
        self.touch(provider).await;
        Ok(handle)
    }

    async fn touch(&self, provider: ProviderKind) {
        if provider == ProviderKind::LocalMicrovm
            && let Some(idle) = &self.idle_stop
        {
            idle.heartbeat().await;
        }
    }

    /// Kill and forget the user's session, if any.
    pub async fn destroy_sandbox(&self, user_id: &str) {
        let removed = self.sessions.lock().await.remove(user_id);
        if let Some(session) = removed {
            kill_quietly(user_id, &session).await;
        }
    }

    pub async fn status(&self, user_id: &str) -> SessionStatus {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(user_id) else {
            return SessionStatus::default();
        };
        let remaining = self.ttl.saturating_sub(session.created_at.elapsed());
        SessionStatus {
            active: true,
            provider: Some(session.provider),
            created_at: Some(session.created_at_ms),
            time_remaining_ms: Some(u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX)),
            fallback_active: Some(session.fallback_active),
        }
    }

    /// Kill and evict every session older than the TTL, then reclaim
    /// orphaned backend state.
    pub async fn sweep(&self) -> usize {
        let expired: Vec<(String, SandboxSession)> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.created_at.elapsed() >= self.ttl)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| sessions.remove(&k).map(|s| (k, s)))
                .collect()
        };

        for (user_id, session) in &expired {
            kill_quietly(user_id, session).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired sandbox sessions swept");
        }
        self.factory.collect_garbage().await;
        expired.len()
    }

    /// Kill every session. Called once at process teardown.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, SandboxSession)> = self.sessions.lock().await.drain().collect();
        for (user_id, session) in &drained {
            kill_quietly(user_id, session).await;
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.sweep().await;
            }
        });
    }
}

async fn kill_quietly(user_id: &str, session: &SandboxSession) {
    if let Err(e) = session.sandbox.kill().await {
        warn!(user_id, provider = %session.provider, error = %e, "sandbox kill failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::provider::{CommandOutput, FileEntry},
        std::sync::{Mutex as StdMutex, atomic::AtomicUsize},
    };

    struct FakeSandbox {
        kind: ProviderKind,
        kills: AtomicUsize,
    }

    #[async_trait]
    impl SandboxRuntime for FakeSandbox {
        fn provider(&self) -> ProviderKind {
            self.kind
        }

        async fn run_command(&self, _command: &str, _timeout_ms: u64) -> Result<CommandOutput> {
            Ok(CommandOutput::default())
        }

        async fn write_file(&self, _path: &str, _content: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn read_file(&self, _path: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn list_files(&self, _path: &str) -> Result<Vec<FileEntry>> {
            Ok(Vec::new())
        }

        async fn kill(&self) -> Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Err(Error::message("already gone"))
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        local_ready: bool,
        local_fails: bool,
        created: StdMutex<Vec<Arc<FakeSandbox>>>,
        gc_runs: AtomicUsize,
    }

    impl FakeFactory {
        fn kinds(&self) -> Vec<ProviderKind> {
            self.created.lock().unwrap().iter().map(|s| s.kind).collect()
        }
    }

    #[async_trait]
    impl SandboxFactory for FakeFactory {
        async fn local_ready(&self) -> bool {
            self.local_ready
        }

        async fn create(
            &self,
            kind: ProviderKind,
            _input: &SandboxCreateInput,
        ) -> Result<Arc<dyn SandboxRuntime>> {
            if kind == ProviderKind::LocalMicrovm && self.local_fails {
                return Err(Error::message("no kvm"));
            }
            let sandbox = Arc::new(FakeSandbox {
                kind,
                kills: AtomicUsize::new(0),
            });
            self.created.lock().unwrap().push(Arc::clone(&sandbox));
            Ok(sandbox)
        }

        async fn collect_garbage(&self) {
            self.gc_runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(factory: Arc<FakeFactory>, ttl_ms: u64, fallback: bool) -> Arc<SessionManager> {
        let mut config = CrucibleConfig::default();
        config.sandbox.session_ttl_ms = ttl_ms;
        config.sandbox.allow_remote_fallback = fallback;
        Arc::new(SessionManager::new(factory, &config))
    }

    fn prefer(preferred: ProviderPreference) -> SessionOptions {
        SessionOptions {
            preferred,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn auto_with_failing_probe_never_builds_local() {
        let factory = Arc::new(FakeFactory::default());
        let stages = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&stages);
        let options = SessionOptions {
            on_stage: Some(Arc::new(move |s| seen.lock().unwrap().push(s))),
            ..Default::default()
        };

        let mgr = manager(Arc::clone(&factory), 60_000, true);
        let handle = mgr.get_or_create("u1", &options).await.unwrap();

        assert_eq!(handle.provider, ProviderKind::RemoteE2b);
        assert!(!handle.fallback_active);
        assert_eq!(factory.kinds(), vec![ProviderKind::RemoteE2b]);
        assert_eq!(
            *stages.lock().unwrap(),
            vec![
                SessionStage::ProbingLocalMicrovm,
                SessionStage::StartingRemoteSandbox
            ]
        );
    }

    #[tokio::test]
    async fn auto_with_ready_probe_uses_local() {
        let factory = Arc::new(FakeFactory {
            local_ready: true,
            ..Default::default()
        });
        let mgr = manager(Arc::clone(&factory), 60_000, true);
        let handle = mgr
            .get_or_create("u1", &SessionOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.provider, ProviderKind::LocalMicrovm);
    }

    #[tokio::test]
    async fn strict_mode_propagates_local_failure() {
        let factory = Arc::new(FakeFactory {
            local_fails: true,
            ..Default::default()
        });
        let mgr = manager(Arc::clone(&factory), 60_000, true);
        let options = SessionOptions {
            preferred: ProviderPreference::LocalMicrovm,
            strict_no_fallback: true,
            on_stage: None,
        };
        let err = mgr.get_or_create("u1", &options).await.err().unwrap();
        assert_eq!(err.to_string(), "no kvm");
        assert!(factory.kinds().is_empty());
        assert_eq!(mgr.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn fallback_disabled_globally_propagates() {
        let factory = Arc::new(FakeFactory {
            local_fails: true,
            ..Default::default()
        });
        let mgr = manager(Arc::clone(&factory), 60_000, false);
        assert!(
            mgr.get_or_create("u1", &prefer(ProviderPreference::LocalMicrovm))
                .await
                .is_err()
        );
        assert!(factory.kinds().is_empty());
    }

    #[tokio::test]
    async fn local_failure_falls_back_to_remote() {
        let factory = Arc::new(FakeFactory {
            local_fails: true,
            ..Default::default()
        });
        let mgr = manager(Arc::clone(&factory), 60_000, true);
        let handle = mgr
            .get_or_create("u1", &prefer(ProviderPreference::LocalMicrovm))
            .await
            .unwrap();
        assert_eq!(handle.provider, ProviderKind::RemoteE2b);
        assert!(handle.fallback_active);
        assert_eq!(mgr.status("u1").await.fallback_active, Some(true));
    }

    #[tokio::test]
    async fn fallback_session_is_reused_while_local_stays_broken() {
        let factory = Arc::new(FakeFactory {
            local_ready: true,
            local_fails: true,
            ..Default::default()
        });
        let mgr = manager(Arc::clone(&factory), 60_000, true);
        let auto = SessionOptions::default();

        let first = mgr.get_or_create("u1", &auto).await.unwrap();
        assert!(first.fallback_active);
        let second = mgr.get_or_create("u1", &auto).await.unwrap();
        assert!(Arc::ptr_eq(&first.sandbox, &second.sandbox));
        assert_eq!(factory.kinds(), vec![ProviderKind::RemoteE2b]);

        // An explicit local request is a different preference and retries local.
        let pinned = mgr
            .get_or_create("u1", &prefer(ProviderPreference::LocalMicrovm))
            .await
            .unwrap();
        assert!(pinned.fallback_active);
        assert!(!Arc::ptr_eq(&first.sandbox, &pinned.sandbox));
        assert_eq!(factory.kinds().len(), 2);
    }

    #[tokio::test]
    async fn expired_fallback_session_retries_local() {
        let factory = Arc::new(FakeFactory {
            local_fails: true,
            ..Default::default()
        });
        let mgr = manager(Arc::clone(&factory), 1, true);
        let opts = prefer(ProviderPreference::LocalMicrovm);

        mgr.get_or_create("u1", &opts).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.get_or_create("u1", &opts).await.unwrap();
        assert_eq!(factory.kinds().len(), 2);
        assert_eq!(factory.created.lock().unwrap()[0].kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reuses_session_within_ttl() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(Arc::clone(&factory), 60_000, true);
        let opts = prefer(ProviderPreference::RemoteE2b);
        let a = mgr.get_or_create("u1", &opts).await.unwrap();
        let b = mgr.get_or_create("u1", &opts).await.unwrap();
        assert!(Arc::ptr_eq(&a.sandbox, &b.sandbox));
        assert_eq!(factory.kinds().len(), 1);
    }

    #[tokio::test]
    async fn provider_mismatch_replaces_and_kills_once() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(Arc::clone(&factory), 60_000, true);
        mgr.get_or_create("u1", &prefer(ProviderPreference::RemoteE2b))
            .await
            .unwrap();
        let b = mgr
            .get_or_create("u1", &prefer(ProviderPreference::LocalMicrovm))
            .await
            .unwrap();
        assert_eq!(b.provider, ProviderKind::LocalMicrovm);

        let created = factory.created.lock().unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].kills.load(Ordering::SeqCst), 1);
        assert_eq!(created[1].kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_session_is_replaced() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(Arc::clone(&factory), 30, true);
        let opts = prefer(ProviderPreference::RemoteE2b);
        let a = mgr.get_or_create("u1", &opts).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let b = mgr.get_or_create("u1", &opts).await.unwrap();
        assert!(!Arc::ptr_eq(&a.sandbox, &b.sandbox));
        assert_eq!(factory.created.lock().unwrap()[0].kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sweep_evicts_expired_and_runs_gc() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(Arc::clone(&factory), 30, true);
        mgr.get_or_create("u1", &prefer(ProviderPreference::RemoteE2b))
            .await
            .unwrap();
        assert_eq!(mgr.sweep().await, 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(mgr.sweep().await, 1);
        assert_eq!(mgr.active_sessions().await, 0);
        assert_eq!(factory.gc_runs.load(Ordering::SeqCst), 2);
        assert!(!mgr.status("u1").await.active);
    }

    #[tokio::test]
    async fn destroy_and_status() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(Arc::clone(&factory), 60_000, true);
        mgr.get_or_create("u1", &prefer(ProviderPreference::RemoteE2b))
            .await
            .unwrap();

        let status = mgr.status("u1").await;
        assert!(status.active);
        assert_eq!(status.provider, Some(ProviderKind::RemoteE2b));
        assert!(status.time_remaining_ms.unwrap() <= 60_000);

        mgr.destroy_sandbox("u1").await;
        assert_eq!(mgr.status("u1").await, SessionStatus::default());
        assert_eq!(factory.created.lock().unwrap()[0].kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_kills_everything() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(Arc::clone(&factory), 60_000, true);
        let opts = prefer(ProviderPreference::RemoteE2b);
        mgr.get_or_create("u1", &opts).await.unwrap();
        mgr.get_or_create("u2", &opts).await.unwrap();
        mgr.shutdown().await;
        assert_eq!(mgr.active_sessions().await, 0);
        assert!(
            factory
                .created
                .lock()
                .unwrap()
                .iter()
                .all(|s| s.kills.load(Ordering::SeqCst) == 1)
        );
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_session() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(Arc::clone(&factory), 60_000, true);
        let opts = prefer(ProviderPreference::RemoteE2b);
        let (a, b) = tokio::join!(
            mgr.get_or_create("u1", &opts),
            mgr.get_or_create("u1", &opts)
        );
        assert!(Arc::ptr_eq(&a.unwrap().sandbox, &b.unwrap().sandbox));
        assert_eq!(factory.kinds().len(), 1);
    }

    #[test]
    fn stage_names() {
        assert_eq!(SessionStage::FallingBackRemote.as_str(), "falling_back_remote");
        assert_eq!(
            SessionStage::ProbingLocalMicrovm.as_str(),
            "probing_local_microvm"
        );
    }
}
