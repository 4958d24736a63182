//! Typed producer contract for the surrounding system.
//!
//! The project, file, task, and process subsystems publish through these
//! wrappers instead of building events by hand: each fills the kind and
//! topic and hands off to the dispatcher's intake queue. Publishing is
//! fire and forget; nothing from dispatch propagates back to producers.

use crate::dispatcher::PublishHandle;
use beacon_protocol::Event;
use serde_json::Value;

/// Event kinds emitted by the surrounding subsystems.
pub mod kinds {
    pub const PROJECT_CREATED: &str = "project.created";
    pub const PROJECT_UPDATED: &str = "project.updated";
    pub const PROJECT_DELETED: &str = "project.deleted";
    pub const FILE_UPLOADED: &str = "file.uploaded";
    pub const FILE_DELETED: &str = "file.deleted";
    pub const TASK_PROGRESS: &str = "task.progress";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const PROCESS_STARTED: &str = "process.started";
    pub const PROCESS_EXITED: &str = "process.exited";
}

/// Publish surface handed to the rest of the system.
#[derive(Clone)]
pub struct EventProducers {
    handle: PublishHandle,
}

impl EventProducers {
    /// Wrap a dispatcher intake handle.
    #[must_use]
    pub fn new(handle: PublishHandle) -> Self {
        Self { handle }
    }

    async fn emit(&self, kind: &str, project_id: Option<&str>, payload: Value) {
        let mut event = Event::new(kind).with_payload(payload);
        if let Some(project_id) = project_id {
            event = event.with_topic(project_id);
        }
        self.handle.send(event).await;
    }

    /// A project was created; delivered on the project's topic.
    pub async fn project_created(&self, project_id: &str, payload: Value) {
        self.emit(kinds::PROJECT_CREATED, Some(project_id), payload).await;
    }

    /// Project metadata changed.
    pub async fn project_updated(&self, project_id: &str, payload: Value) {
        self.emit(kinds::PROJECT_UPDATED, Some(project_id), payload).await;
    }

    /// A project was deleted.
    pub async fn project_deleted(&self, project_id: &str, payload: Value) {
        self.emit(kinds::PROJECT_DELETED, Some(project_id), payload).await;
    }

    /// A file landed in the project's storage.
    pub async fn file_uploaded(&self, project_id: &str, payload: Value) {
        self.emit(kinds::FILE_UPLOADED, Some(project_id), payload).await;
    }

    /// A file was removed from the project's storage.
    pub async fn file_deleted(&self, project_id: &str, payload: Value) {
        self.emit(kinds::FILE_DELETED, Some(project_id), payload).await;
    }

    /// Incremental progress of a long-running task.
    pub async fn task_progress(&self, project_id: &str, payload: Value) {
        self.emit(kinds::TASK_PROGRESS, Some(project_id), payload).await;
    }

    /// A long-running task finished.
    pub async fn task_completed(&self, project_id: &str, payload: Value) {
        self.emit(kinds::TASK_COMPLETED, Some(project_id), payload).await;
    }

    /// A managed process started; global when not tied to a project.
    pub async fn process_started(&self, project_id: Option<&str>, payload: Value) {
        self.emit(kinds::PROCESS_STARTED, project_id, payload).await;
    }

    /// A managed process exited.
    pub async fn process_exited(&self, project_id: Option<&str>, payload: Value) {
        self.emit(kinds::PROCESS_EXITED, project_id, payload).await;
    }
}
