//! Build orchestration: hook → record → checkout → supervised run → persist.
//!
//! Every build runs in its own task. The record is saved as `Waiting` before
//! anything can fail so it is always discoverable. It is registered as running
//! right before the script starts and unregistered only after the terminal
//! record has been persisted, so a registry miss always means the store holds
//! the final output.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::CiConfig;
use crate::error::CiError;
use crate::events::build::{BuildEvent, BuildUpdate};
use crate::events::EventBus;
use crate::models::build::{BuildId, BuildRecord, BuildState, CommitInfo};
use crate::models::hook::{self, HookEvent};
use crate::models::repository::Repository;
use crate::services::cancel::{CancelControl, CancelError};
use crate::services::checkout::Checkout;
use crate::services::output_stream::{OutputReader, OutputStream};
use crate::services::registry::{RegistryError, RunningBuild, RunningBuildRegistry};
use crate::services::repository_service;
use crate::services::store::{BuildStore, StoreError};
use crate::services::supervisor::ProcessSupervisor;

/// Where a build's output comes from when a client asks for it.
pub enum BuildOutput {
    /// Still running: a reader on the live stream.
    Live(OutputReader),
    /// Finished (or not started yet): the stored output.
    Stored(Vec<u8>),
}

pub struct BuildService {
    config: CiConfig,
    store: Arc<dyn BuildStore>,
    checkout: Arc<dyn Checkout>,
    registry: RunningBuildRegistry,
    supervisor: ProcessSupervisor,
    events: EventBus,
}

impl BuildService {
    pub fn new(
        config: CiConfig,
        store: Arc<dyn BuildStore>,
        checkout: Arc<dyn Checkout>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(config.output_drain);
        Self {
            config,
            store,
            checkout,
            registry: RunningBuildRegistry::new(),
            supervisor,
            events: EventBus::new(),
        }
    }

    pub fn config(&self) -> &CiConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn BuildStore {
        self.store.as_ref()
    }

    pub fn checkout(&self) -> &dyn Checkout {
        self.checkout.as_ref()
    }

    pub fn registry(&self) -> &RunningBuildRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Mark builds left non-terminal by a previous process as errored.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for mut record in self.store.list_all().await? {
            if record.is_terminal() {
                continue;
            }
            let event = BuildEvent::Errored {
                message: "interrupted by server restart".to_string(),
            };
            if record.apply(event).is_ok() {
                self.store.save(&record).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "Marked interrupted builds as errored");
        }
        Ok(recovered)
    }

    /// Turn a hook into a build. Ref deletions yield `None`.
    pub async fn handle_hook(
        self: &Arc<Self>,
        hook: HookEvent,
    ) -> Result<Option<(BuildId, JoinHandle<()>)>, CiError> {
        if hook.is_deletion() {
            tracing::debug!(ref_name = %hook.ref_name, "Ignoring ref deletion");
            return Ok(None);
        }
        if !hook::is_object_name(&hook.new_revision) {
            return Err(CiError::InvalidRevision(hook.new_revision));
        }

        let repository =
            repository_service::find_by_path(self.store(), &self.config.repos_dir, &hook.repo_path)
                .await?
                .ok_or_else(|| CiError::UnknownRepository(hook.repo_path.clone()))?;

        let started = self
            .start_build(&repository, &hook.new_revision, &hook.ref_name)
            .await?;
        Ok(Some(started))
    }

    /// Create the `Waiting` record and spawn the build task.
    pub async fn start_build(
        self: &Arc<Self>,
        repository: &Repository,
        revision: &str,
        ref_name: &str,
    ) -> Result<(BuildId, JoinHandle<()>), CiError> {
        if self.registry.is_closed() {
            return Err(RegistryError::ShuttingDown.into());
        }

        let number = self.store.next_build_number(repository.id).await?;
        let id = BuildId::new(repository.id, number);
        let path = self.config.workspace_dir.join(format!(
            "sea_{}_{}",
            repository.id,
            Uuid::new_v4().simple()
        ));
        let record = BuildRecord::new(
            id,
            CommitInfo::new(revision, ref_name),
            path,
            self.config.build_script.clone(),
        );
        self.store.save(&record).await?;
        self.announce(&record);

        tracing::info!(
            build = %id,
            revision = %revision,
            ref_name = %ref_name,
            "Build created"
        );

        let service = Arc::clone(self);
        let repository = repository.clone();
        let handle = tokio::spawn(async move { service.run_build(record, repository).await });
        Ok((id, handle))
    }

    async fn run_build(&self, mut record: BuildRecord, repository: Repository) {
        let id = record.id;
        let workspace = record.path.clone();

        match self
            .checkout
            .checkout(
                &repository,
                &record.commit.revision,
                &record.commit.ref_name,
                &workspace,
            )
            .await
        {
            Ok(commit) => record.commit = commit,
            Err(e) => {
                tracing::error!(build = %id, "Checkout failed: {e}");
                self.finish_errored(&mut record, format!("checkout failed: {e}"))
                    .await;
                self.cleanup(&workspace).await;
                return;
            }
        }

        let output = OutputStream::new();
        let cancel = CancelControl::new();
        if let Err(e) = record.apply(BuildEvent::Started) {
            tracing::error!(build = %id, "{e}");
            return;
        }
        let handle = RunningBuild::new(record.clone(), output.clone(), cancel.clone());
        if let Err(e) = self.registry.add(id, handle) {
            tracing::warn!(build = %id, "Not starting build: {e}");
            self.finish_errored(&mut record, e.to_string()).await;
            self.cleanup(&workspace).await;
            return;
        }
        self.persist(&record).await;

        match self.supervisor.execute(&mut record, &output, &cancel).await {
            Ok(state) => {
                tracing::info!(
                    build = %id,
                    state = %state,
                    return_code = record.return_code(),
                    "Build finished"
                );
            }
            Err(e) => {
                tracing::error!(build = %id, "Build could not run: {e}");
                if let Err(e) = record.apply(BuildEvent::Errored {
                    message: e.to_string(),
                }) {
                    tracing::error!(build = %id, "{e}");
                }
            }
        }

        self.persist(&record).await;
        self.registry.remove(id);
        self.cleanup(&workspace).await;
    }

    async fn finish_errored(&self, record: &mut BuildRecord, message: String) {
        if let Err(e) = record.apply(BuildEvent::Errored { message }) {
            tracing::error!(build = %record.id, "{e}");
        }
        self.persist(record).await;
    }

    /// Save a record and announce the change. Store failures are logged; the
    /// build itself carries on.
    async fn persist(&self, record: &BuildRecord) {
        if let Err(e) = self.store.save(record).await {
            tracing::error!(build = %record.id, state = %record.state(), "Failed to save build: {e}");
        }
        self.announce(record);
    }

    fn announce(&self, record: &BuildRecord) {
        crate::metrics::build_status_changed(record.state().as_str());
        self.events.publish(BuildUpdate {
            id: record.id,
            state: record.state(),
            revision: record.commit.revision.clone(),
        });
    }

    async fn cleanup(&self, workspace: &Path) {
        if self.config.keep_workspaces {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %workspace.display(), "Failed to remove workspace: {e}");
            }
        }
    }

    /// Live reader for a running build, or the stored output otherwise.
    pub async fn output(&self, id: BuildId) -> Result<Option<BuildOutput>, CiError> {
        if let Some(running) = self.registry.get(id) {
            return Ok(Some(BuildOutput::Live(running.output.open_reader())));
        }
        Ok(self
            .store
            .find(id)
            .await?
            .map(|record| BuildOutput::Stored(record.output().to_vec())))
    }

    /// Request cancellation of a running build.
    pub fn cancel(&self, id: BuildId) -> Result<(), CancelError> {
        let result = self.registry.cancel(id);
        match &result {
            Ok(()) => tracing::info!(build = %id, "Cancellation requested"),
            Err(e) => tracing::debug!(build = %id, "Cancel ignored: {e}"),
        }
        result
    }

    pub async fn find(&self, id: BuildId) -> Result<Option<BuildRecord>, CiError> {
        Ok(self.store.find(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<BuildRecord>, CiError> {
        Ok(self.store.list_all().await?)
    }

    pub fn is_running(&self, id: BuildId) -> bool {
        self.registry.get(id).is_some_and(|b| b.record.state() == BuildState::Running)
    }

    /// Stop accepting builds, cancel what runs and wait until it is all done.
    /// Update subscribers are disconnected last.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        self.events.close();
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::models::repository::NewRepository;
    use crate::services::checkout::CheckoutError;
    use crate::services::store::MemoryStore;

    /// Writes a fixed build script instead of talking to git.
    struct ScriptCheckout {
        script: Option<&'static str>,
    }

    #[async_trait]
    impl Checkout for ScriptCheckout {
        async fn init(&self, _repo: &Repository) -> Result<(), CheckoutError> {
            Ok(())
        }

        async fn checkout(
            &self,
            _repo: &Repository,
            revision: &str,
            ref_name: &str,
            target: &std::path::Path,
        ) -> Result<CommitInfo, CheckoutError> {
            tokio::fs::create_dir_all(target).await?;
            if let Some(body) = self.script {
                let path = target.join("Seafile");
                std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
            }
            let mut commit = CommitInfo::new(revision, ref_name);
            commit.message = "test commit".to_string();
            Ok(commit)
        }
    }

    struct BrokenCheckout;

    #[async_trait]
    impl Checkout for BrokenCheckout {
        async fn init(&self, _repo: &Repository) -> Result<(), CheckoutError> {
            Ok(())
        }

        async fn checkout(
            &self,
            _repo: &Repository,
            _revision: &str,
            _ref_name: &str,
            _target: &std::path::Path,
        ) -> Result<CommitInfo, CheckoutError> {
            Err(CheckoutError::Git {
                command: "checkout".to_string(),
                stderr: "bad revision".to_string(),
            })
        }
    }

    async fn service_with(
        dir: &std::path::Path,
        checkout: Arc<dyn Checkout>,
    ) -> (Arc<BuildService>, Repository) {
        let store = Arc::new(MemoryStore::new());
        let repository = store
            .insert_repository(NewRepository {
                name: "demo".to_string(),
                remote: false,
                url: None,
            })
            .await
            .unwrap();
        let service = Arc::new(BuildService::new(
            CiConfig::rooted(dir),
            store,
            checkout,
        ));
        (service, repository)
    }

    async fn scripted(dir: &std::path::Path, script: &'static str) -> (Arc<BuildService>, Repository) {
        service_with(dir, Arc::new(ScriptCheckout { script: Some(script) })).await
    }

    fn hook(service: &BuildService, repository: &Repository, new_revision: &str) -> HookEvent {
        HookEvent {
            repo_path: repository.local_path(&service.config().repos_dir),
            old_revision: "0".repeat(40),
            new_revision: new_revision.to_string(),
            ref_name: "refs/heads/main".to_string(),
        }
    }

    const REVISION: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

    async fn wait_running(service: &BuildService, id: BuildId) -> RunningBuild {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(running) = service.registry().get(id) {
                    return running;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("build never started")
    }

    async fn stored(service: &BuildService, id: BuildId) -> BuildRecord {
        service.find(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn hook_runs_build_to_success() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = scripted(dir.path(), "echo building\necho done").await;

        let (id, task) = service
            .handle_hook(hook(&service, &repository, REVISION))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, BuildId::new(repository.id, 1));
        task.await.unwrap();

        let record = stored(&service, id).await;
        assert_eq!(record.state(), BuildState::Success);
        assert_eq!(record.return_code(), Some(0));
        assert_eq!(record.output(), b"building\ndone\n");
        assert_eq!(record.commit.revision, REVISION);
        assert_eq!(record.commit.message, "test commit");
        assert!(service.registry().is_empty());
        assert!(!record.path.exists(), "workspace should be removed");

        match service.output(id).await.unwrap() {
            Some(BuildOutput::Stored(bytes)) => assert_eq!(bytes, b"building\ndone\n"),
            _ => panic!("finished build should serve stored output"),
        }
    }

    #[tokio::test]
    async fn build_numbers_increase_per_repository() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = scripted(dir.path(), "exit 0").await;

        let (first, t1) = service.start_build(&repository, "a", "refs/heads/main").await.unwrap();
        let (second, t2) = service.start_build(&repository, "b", "refs/heads/main").await.unwrap();
        t1.await.unwrap();
        t2.await.unwrap();

        assert_eq!(first.number, 1);
        assert_eq!(second.number, 2);
        assert_eq!(service.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failing_script_is_failed_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = scripted(dir.path(), "echo nope\nexit 4").await;

        let (id, task) = service.start_build(&repository, "abc", "refs/heads/main").await.unwrap();
        task.await.unwrap();

        let record = stored(&service, id).await;
        assert_eq!(record.state(), BuildState::Failed);
        assert_eq!(record.return_code(), Some(4));
    }

    #[tokio::test]
    async fn deletion_hook_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = scripted(dir.path(), "exit 0").await;

        let started = service
            .handle_hook(hook(&service, &repository, &"0".repeat(40)))
            .await
            .unwrap();
        assert!(started.is_none());
        assert!(service.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_repository_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = scripted(dir.path(), "exit 0").await;

        let ghost = Repository {
            id: 99,
            name: "ghost".to_string(),
            remote: false,
            url: None,
            created_at: chrono::Utc::now(),
            last_build_number: 0,
        };

        let err = service
            .handle_hook(hook(&service, &ghost, REVISION))
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::UnknownRepository(_)));
    }

    #[tokio::test]
    async fn hook_with_malformed_revision_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = scripted(dir.path(), "exit 0").await;

        for revision in ["abc123", "--upload-pack=touch /tmp/x"] {
            let err = service
                .handle_hook(hook(&service, &repository, revision))
                .await
                .unwrap_err();
            assert!(matches!(err, CiError::InvalidRevision(_)));
        }
        assert!(service.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_reader_then_cancel_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = scripted(dir.path(), "echo partial\nsleep 600").await;

        let (id, task) = service.start_build(&repository, "abc", "refs/heads/main").await.unwrap();
        let running = wait_running(&service, id).await;
        assert_eq!(running.record.state(), BuildState::Running);

        let mut reader = match service.output(id).await.unwrap() {
            Some(BuildOutput::Live(reader)) => reader,
            _ => panic!("running build should serve a live reader"),
        };
        assert_eq!(reader.read().await.unwrap(), b"partial\n");

        service.cancel(id).unwrap();
        assert!(matches!(service.cancel(id), Err(CancelError::NotRunning)));
        assert_eq!(reader.read_to_end().await, b"");
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("canceled build should finish promptly")
            .unwrap();

        let record = stored(&service, id).await;
        assert_eq!(record.state(), BuildState::Canceled);
        assert_eq!(record.output(), b"partial\n");
        assert!(running.output.is_done());
        assert!(matches!(service.cancel(id), Err(CancelError::NotRunning)));
    }

    #[tokio::test]
    async fn checkout_failure_is_errored() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = service_with(dir.path(), Arc::new(BrokenCheckout)).await;

        let (id, task) = service.start_build(&repository, "abc", "refs/heads/main").await.unwrap();
        task.await.unwrap();

        let record = stored(&service, id).await;
        assert_eq!(record.state(), BuildState::Errored);
        assert!(record.error().unwrap().contains("bad revision"));
        assert_eq!(record.started_at(), None);
    }

    #[tokio::test]
    async fn missing_script_is_errored() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) =
            service_with(dir.path(), Arc::new(ScriptCheckout { script: None })).await;

        let (id, task) = service.start_build(&repository, "abc", "refs/heads/main").await.unwrap();
        task.await.unwrap();

        let record = stored(&service, id).await;
        assert_eq!(record.state(), BuildState::Errored);
        assert!(record.error().unwrap().contains("not found"));
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_all_running_builds() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = scripted(dir.path(), "echo up\nsleep 600").await;

        let mut started = Vec::new();
        for revision in ["a", "b", "c"] {
            started.push(service.start_build(&repository, revision, "refs/heads/main").await.unwrap());
        }
        for (id, _) in &started {
            wait_running(&service, *id).await;
        }

        tokio::time::timeout(Duration::from_secs(10), service.shutdown())
            .await
            .expect("shutdown should not hang");
        assert!(service.registry().is_empty());

        for (id, task) in started {
            task.await.unwrap();
            assert_eq!(stored(&service, id).await.state(), BuildState::Canceled);
        }

        let err = service.start_build(&repository, "d", "refs/heads/main").await.unwrap_err();
        assert!(matches!(err, CiError::Registry(RegistryError::ShuttingDown)));
    }

    #[tokio::test]
    async fn updates_are_published_for_each_transition() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = scripted(dir.path(), "exit 0").await;
        let mut updates = service.events().subscribe();

        let (id, task) = service.start_build(&repository, "abc", "refs/heads/main").await.unwrap();
        task.await.unwrap();

        let mut states = Vec::new();
        for _ in 0..3 {
            let update = updates.recv().await.unwrap();
            assert_eq!(update.id, id);
            states.push(update.state);
        }
        assert_eq!(
            states,
            [BuildState::Waiting, BuildState::Running, BuildState::Success]
        );
    }

    #[tokio::test]
    async fn recover_marks_interrupted_builds_errored() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = scripted(dir.path(), "exit 0").await;

        let waiting = BuildRecord::new(
            BuildId::new(repository.id, 7),
            CommitInfo::new("abc", "refs/heads/main"),
            dir.path().join("w"),
            "Seafile".into(),
        );
        let mut running = BuildRecord::new(
            BuildId::new(repository.id, 8),
            CommitInfo::new("def", "refs/heads/main"),
            dir.path().join("r"),
            "Seafile".into(),
        );
        running.apply(BuildEvent::Started).unwrap();
        service.store().save(&waiting).await.unwrap();
        service.store().save(&running).await.unwrap();

        assert_eq!(service.recover().await.unwrap(), 2);
        for id in [waiting.id, running.id] {
            let record = stored(&service, id).await;
            assert_eq!(record.state(), BuildState::Errored);
            assert_eq!(record.error(), Some("interrupted by server restart"));
        }
        assert_eq!(service.recover().await.unwrap(), 0);
    }
}
