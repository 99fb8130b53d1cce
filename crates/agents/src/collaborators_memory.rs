//! In-process implementations of the collaborator ports. Nothing persists
//! beyond the process; used by the CLI and tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {anyhow::bail, async_trait::async_trait};

use crate::collaborators::{
    AssistantTurn, BlobStore, Collaborators, ConversationStore, EntitlementChecker,
    ExecutionSettings, HistoryTurn, MemoryContext, MemoryStore, MemoryTurn, ProfileStore,
    UploadedFile, UsageEvent, UsageTracker,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Conversations ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryConversationStore {
    history: Mutex<HashMap<String, Vec<HistoryTurn>>>,
    saved: Mutex<Vec<AssistantTurn>>,
}

impl InMemoryConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_turn(&self, conversation_id: &str, turn: HistoryTurn) {
        lock(&self.history)
            .entry(conversation_id.to_string())
            .or_default()
            .push(turn);
    }

    /// Assistant turns saved by workflows, in order.
    #[must_use]
    pub fn saved_turns(&self) -> Vec<AssistantTurn> {
        lock(&self.saved).clone()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn recent_history(
        &self,
        _user_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<HistoryTurn>> {
        let history = lock(&self.history);
        let turns = history.get(conversation_id).map_or(&[][..], Vec::as_slice);
        Ok(turns[turns.len().saturating_sub(limit)..].to_vec())
    }

    async fn save_assistant_turn(&self, _user_id: &str, turn: AssistantTurn) -> anyhow::Result<()> {
        self.push_turn(&turn.conversation_id, HistoryTurn::assistant(turn.content.clone()));
        lock(&self.saved).push(turn);
        Ok(())
    }
}

// ── Memory ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryMemoryStore {
    contexts: Mutex<HashMap<(String, String), MemoryContext>>,
    remembered: Mutex<Vec<MemoryTurn>>,
}

impl InMemoryMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_context(&self, user_id: &str, conversation_id: &str, context: MemoryContext) {
        lock(&self.contexts).insert((user_id.to_string(), conversation_id.to_string()), context);
    }

    #[must_use]
    pub fn remembered(&self) -> Vec<MemoryTurn> {
        lock(&self.remembered).clone()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn context(
        &self,
        user_id: &str,
        conversation_id: &str,
        _query: &str,
    ) -> anyhow::Result<MemoryContext> {
        Ok(lock(&self.contexts)
            .get(&(user_id.to_string(), conversation_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn remember_turn(&self, turn: MemoryTurn) -> anyhow::Result<()> {
        lock(&self.remembered).push(turn);
        Ok(())
    }
}

// ── Blobs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub content: Vec<u8>,
    pub content_type: String,
}

pub struct InMemoryBlobStore {
    base_url: String,
    blobs: Mutex<HashMap<String, StoredBlob>>,
    uploads: Mutex<HashMap<(String, String), UploadedFile>>,
    signing_disabled: bool,
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new("memory://blobs")
    }
}

impl InMemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            blobs: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            signing_disabled: false,
        }
    }

    /// Refuse to sign URLs, forcing callers onto public URLs.
    #[must_use]
    pub fn without_signing(mut self) -> Self {
        self.signing_disabled = true;
        self
    }

    pub fn add_upload(&self, user_id: &str, file: UploadedFile) {
        lock(&self.uploads).insert((user_id.to_string(), file.id.clone()), file);
    }

    #[must_use]
    pub fn blob(&self, path: &str) -> Option<StoredBlob> {
        lock(&self.blobs).get(path).cloned()
    }

    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.blobs).keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(
        &self,
        path: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> anyhow::Result<()> {
        lock(&self.blobs).insert(path.to_string(), StoredBlob {
            content,
            content_type: content_type.to_string(),
        });
        Ok(())
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> anyhow::Result<String> {
        if self.signing_disabled {
            bail!("signed URLs are disabled");
        }
        if !lock(&self.blobs).contains_key(path) {
            bail!("no blob at {path}");
        }
        Ok(format!(
            "{}/signed/{path}?expires_in={}",
            self.base_url,
            ttl.as_secs()
        ))
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/public/{path}", self.base_url)
    }

    async fn fetch_upload(
        &self,
        user_id: &str,
        file_id: &str,
    ) -> anyhow::Result<Option<UploadedFile>> {
        Ok(lock(&self.uploads)
            .get(&(user_id.to_string(), file_id.to_string()))
            .cloned())
    }
}

// ── Usage, entitlements, profiles ───────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryUsageTracker {
    events: Mutex<Vec<UsageEvent>>,
}

impl InMemoryUsageTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<UsageEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl UsageTracker for InMemoryUsageTracker {
    async fn record(&self, event: UsageEvent) -> anyhow::Result<()> {
        lock(&self.events).push(event);
        Ok(())
    }
}

/// Same answer for every user.
pub struct StaticEntitlements {
    sandbox_allowed: bool,
}

impl StaticEntitlements {
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            sandbox_allowed: true,
        }
    }

    #[must_use]
    pub fn deny_all() -> Self {
        Self {
            sandbox_allowed: false,
        }
    }
}

#[async_trait]
impl EntitlementChecker for StaticEntitlements {
    async fn sandbox_allowed(&self, _user_id: &str) -> anyhow::Result<bool> {
        Ok(self.sandbox_allowed)
    }
}

#[derive(Default)]
pub struct InMemoryProfileStore {
    settings: Mutex<HashMap<String, ExecutionSettings>>,
}

impl InMemoryProfileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: &str, settings: ExecutionSettings) {
        lock(&self.settings).insert(user_id.to_string(), settings);
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn execution_settings(&self, user_id: &str) -> anyhow::Result<ExecutionSettings> {
        Ok(lock(&self.settings)
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ── Bundle ──────────────────────────────────────────────────────────────────

/// Concrete in-memory stores, kept so callers can inspect what a run wrote.
#[derive(Clone)]
pub struct InMemoryCollaborators {
    pub conversations: Arc<InMemoryConversationStore>,
    pub memory: Arc<InMemoryMemoryStore>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub usage: Arc<InMemoryUsageTracker>,
    pub entitlements: Arc<StaticEntitlements>,
    pub profiles: Arc<InMemoryProfileStore>,
}

impl Default for InMemoryCollaborators {
    fn default() -> Self {
        Self {
            conversations: Arc::new(InMemoryConversationStore::new()),
            memory: Arc::new(InMemoryMemoryStore::new()),
            blobs: Arc::new(InMemoryBlobStore::default()),
            usage: Arc::new(InMemoryUsageTracker::new()),
            entitlements: Arc::new(StaticEntitlements::allow_all()),
            profiles: Arc::new(InMemoryProfileStore::new()),
        }
    }
}

impl InMemoryCollaborators {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ports(&self) -> Collaborators {
        Collaborators {
            conversations: self.conversations.clone(),
            memory: self.memory.clone(),
            blobs: self.blobs.clone(),
            usage: self.usage.clone(),
            entitlements: self.entitlements.clone(),
            profiles: self.profiles.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_returns_latest_turns_oldest_first() {
        let store = InMemoryConversationStore::new();
        for i in 0..5 {
            store.push_turn("c1", HistoryTurn::user(format!("m{i}")));
        }
        let turns = store.recent_history("u1", "c1", 2).await.unwrap();
        assert_eq!(turns, vec![HistoryTurn::user("m3"), HistoryTurn::user("m4")]);
        assert!(store.recent_history("u1", "other", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn saved_turn_joins_history() {
        let store = InMemoryConversationStore::new();
        store
            .save_assistant_turn("u1", AssistantTurn {
                conversation_id: "c1".into(),
                content: "done".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(store.saved_turns().len(), 1);
        assert_eq!(store.recent_history("u1", "c1", 10).await.unwrap(), vec![
            HistoryTurn::assistant("done")
        ]);
    }

    #[tokio::test]
    async fn signed_url_requires_blob() {
        let store = InMemoryBlobStore::new("https://files.test/");
        assert!(store.signed_url("u1/chart.png", Duration::from_secs(60)).await.is_err());

        store
            .upload("u1/chart.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        assert_eq!(
            store.signed_url("u1/chart.png", Duration::from_secs(3600)).await.unwrap(),
            "https://files.test/signed/u1/chart.png?expires_in=3600"
        );
        assert_eq!(store.public_url("u1/chart.png"), "https://files.test/public/u1/chart.png");
        assert_eq!(store.blob("u1/chart.png").unwrap().content_type, "image/png");
    }

    #[tokio::test]
    async fn uploads_are_scoped_to_owner() {
        let store = InMemoryBlobStore::default();
        store.add_upload("u1", UploadedFile {
            id: "f1".into(),
            filename: "data.csv".into(),
            content: b"a,b\n1,2\n".to_vec(),
        });
        assert!(store.fetch_upload("u1", "f1").await.unwrap().is_some());
        assert!(store.fetch_upload("u2", "f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn profiles_default_when_missing() {
        let profiles = InMemoryProfileStore::new();
        assert_eq!(
            profiles.execution_settings("nobody").await.unwrap(),
            ExecutionSettings::default()
        );
    }
}
