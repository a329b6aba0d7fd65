//! Application state shared across handlers.

use crate::auth::PrincipalIndex;
use ferry_core::ImportKindName;
use ferry_core::config::AppConfig;
use ferry_mirror::{Coordinator, ExportOutcome, ExportStage, MirrorResult};
use ferry_signer::ArchiveSigner;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Finished statuses kept for lookup before the oldest are pruned.
const MAX_FINISHED_EXPORTS: usize = 10_000;

/// Where a background export is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    Running,
    Committed,
    Abandoned,
    Failed,
}

/// Status of one export, as reported by `GET /v1/exports/{export_id}`.
#[derive(Clone, Debug, Serialize)]
pub struct ExportStatus {
    pub export_id: String,
    pub key: String,
    pub import_kind: ImportKindName,
    pub state: ExportState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<ExportStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    seq: u64,
}

#[derive(Default)]
struct Statuses {
    by_id: HashMap<String, ExportStatus>,
    next_seq: u64,
}

/// Tracks background export tasks and their final status.
///
/// A task that panics never reports back; the watchdog notices the finished
/// handle and marks the export failed so its status does not stay `running`.
#[derive(Default)]
pub struct ExportTracker {
    statuses: RwLock<Statuses>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ExportTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an export as running.
    pub async fn start(&self, export_id: &str, key: &str, import_kind: ImportKindName) {
        let mut statuses = self.statuses.write().await;
        if statuses.by_id.len() >= MAX_FINISHED_EXPORTS {
            prune_finished(&mut statuses.by_id);
        }
        let seq = statuses.next_seq;
        statuses.next_seq += 1;
        statuses.by_id.insert(
            export_id.to_string(),
            ExportStatus {
                export_id: export_id.to_string(),
                key: key.to_string(),
                import_kind,
                state: ExportState::Running,
                size: None,
                stage: None,
                error: None,
                seq,
            },
        );
    }

    /// Record how an export ended.
    pub async fn finish(&self, export_id: &str, result: &MirrorResult<ExportOutcome>) {
        let mut statuses = self.statuses.write().await;
        let Some(status) = statuses.by_id.get_mut(export_id) else {
            return;
        };
        match result {
            Ok(ExportOutcome::Committed { size, .. }) => {
                status.state = ExportState::Committed;
                status.size = Some(*size);
            }
            Ok(ExportOutcome::Abandoned { stage, reason }) => {
                status.state = ExportState::Abandoned;
                status.stage = Some(*stage);
                status.error = Some(reason.clone());
            }
            Err(e) => {
                status.state = ExportState::Failed;
                status.error = Some(e.to_string());
            }
        }
    }

    pub async fn get(&self, export_id: &str) -> Option<ExportStatus> {
        self.statuses.read().await.by_id.get(export_id).cloned()
    }

    /// Keep the task handle so a panic can be detected.
    pub async fn register(&self, export_id: &str, handle: JoinHandle<()>) {
        self.tasks.lock().await.insert(export_id.to_string(), handle);
    }

    /// Spawn a task that periodically reaps finished export tasks.
    pub fn spawn_watchdog(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                self.reap_tasks().await;
            }
        })
    }

    /// Remove finished handles, marking panicked exports as failed.
    pub async fn reap_tasks(&self) {
        let finished: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().await;
            let ids: Vec<String> = tasks
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| tasks.remove(&id).map(|handle| (id, handle)))
                .collect()
        };

        for (export_id, handle) in finished {
            if let Err(join_err) = handle.await
                && join_err.is_panic()
            {
                tracing::error!(export_id = %export_id, "Export task panicked");
                crate::metrics::ACTIVE_EXPORTS.dec();
                let mut statuses = self.statuses.write().await;
                if let Some(status) = statuses.by_id.get_mut(&export_id)
                    && status.state == ExportState::Running
                {
                    status.state = ExportState::Failed;
                    status.error = Some("export task panicked".to_string());
                }
            }
        }
    }
}

/// Drop the older half of finished statuses.
fn prune_finished(by_id: &mut HashMap<String, ExportStatus>) {
    let mut finished: Vec<(u64, String)> = by_id
        .values()
        .filter(|s| s.state != ExportState::Running)
        .map(|s| (s.seq, s.export_id.clone()))
        .collect();
    finished.sort_unstable();
    let drop_count = finished.len().div_ceil(2);
    for (_, id) in finished.into_iter().take(drop_count) {
        by_id.remove(&id);
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub coordinator: Coordinator,
    /// Present when signed exports are enabled.
    pub signer: Option<Arc<ArchiveSigner>>,
    pub principals: Arc<PrincipalIndex>,
    pub exports: Arc<ExportTracker>,
}

impl AppState {
    /// Build state around a coordinator. The coordinator's context should
    /// carry the same signer when one is given.
    pub fn new(
        config: AppConfig,
        coordinator: Coordinator,
        signer: Option<Arc<ArchiveSigner>>,
    ) -> Self {
        let principals = PrincipalIndex::from_config(&config.auth);
        Self {
            config: Arc::new(config),
            coordinator,
            signer,
            principals: Arc::new(principals),
            exports: Arc::new(ExportTracker::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_mirror::{ErrorContext, MirrorError};

    #[tokio::test]
    async fn tracker_reports_final_state() {
        let tracker = ExportTracker::new();
        tracker.start("e1", "e1/f.tar.gz", ImportKindName::File).await;
        assert_eq!(tracker.get("e1").await.unwrap().state, ExportState::Running);

        tracker
            .finish(
                "e1",
                &Ok(ExportOutcome::Abandoned {
                    stage: ExportStage::Stage,
                    reason: "staging write failed".to_string(),
                }),
            )
            .await;
        let status = tracker.get("e1").await.unwrap();
        assert_eq!(status.state, ExportState::Abandoned);
        assert_eq!(status.stage, Some(ExportStage::Stage));

        tracker.start("e2", "e2/f.tar.gz", ImportKindName::File).await;
        tracker
            .finish("e2", &Err(MirrorError::internal("boom", ErrorContext::new())))
            .await;
        let status = tracker.get("e2").await.unwrap();
        assert_eq!(status.state, ExportState::Failed);
        assert!(status.error.unwrap().contains("boom"));

        assert!(tracker.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn panicked_task_is_marked_failed() {
        let tracker = ExportTracker::new();
        tracker.start("e1", "e1/f.tar.gz", ImportKindName::Image).await;
        let handle = tokio::spawn(async { panic!("exporter bug") });
        tracker.register("e1", handle).await;

        for _ in 0..50 {
            tracker.reap_tasks().await;
            if tracker.get("e1").await.unwrap().state != ExportState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = tracker.get("e1").await.unwrap();
        assert_eq!(status.state, ExportState::Failed);
        assert_eq!(status.error.as_deref(), Some("export task panicked"));
    }

    #[test]
    fn prune_keeps_running_and_newest() {
        let mut by_id = HashMap::new();
        for seq in 0..4u64 {
            let id = format!("e{seq}");
            by_id.insert(
                id.clone(),
                ExportStatus {
                    export_id: id,
                    key: String::new(),
                    import_kind: ImportKindName::File,
                    state: if seq == 0 {
                        ExportState::Running
                    } else {
                        ExportState::Committed
                    },
                    size: None,
                    stage: None,
                    error: None,
                    seq,
                },
            );
        }
        prune_finished(&mut by_id);
        assert!(by_id.contains_key("e0"));
        assert!(!by_id.contains_key("e1"));
        assert!(!by_id.contains_key("e2"));
        assert!(by_id.contains_key("e3"));
    }
}
