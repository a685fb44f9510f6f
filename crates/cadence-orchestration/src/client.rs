use crate::router::{ExecuteOptions, ExecutionRouter, RouterStatus};
use crate::session::SessionManager;
use cadence_core::{PublishOptions, PublishOutcome, Resource, Result, Show};
use std::sync::Arc;
use tracing::instrument;

/// Entry point for platform operations: checks the session, then routes
/// the call.
pub struct PlatformClient {
    router: Arc<ExecutionRouter>,
    sessions: Arc<SessionManager>,
    options: ExecuteOptions,
}

impl PlatformClient {
    pub fn new(router: Arc<ExecutionRouter>, sessions: Arc<SessionManager>) -> Self {
        Self {
            router,
            sessions,
            options: ExecuteOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn router(&self) -> &Arc<ExecutionRouter> {
        &self.router
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[instrument(skip(self))]
    pub async fn list_shows(&self) -> Result<Vec<Show>> {
        self.sessions.ensure_authenticated().await?;
        self.router
            .execute("list_shows", self.options, |backend| async move {
                backend.list_shows().await
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn list_resources(&self, show_id: &str) -> Result<Vec<Resource>> {
        self.sessions.ensure_authenticated().await?;
        self.router
            .execute("list_resources", self.options, move |backend| async move {
                backend.list_resources(show_id).await
            })
            .await
    }

    #[instrument(skip(self, options))]
    pub async fn publish_one(
        &self,
        resource_id: &str,
        options: &PublishOptions,
    ) -> Result<PublishOutcome> {
        self.sessions.ensure_authenticated().await?;
        self.router
            .execute("publish_one", self.options, move |backend| async move {
                backend.publish_one(resource_id, options).await
            })
            .await
    }

    /// One outcome per id; items that failed are marked individually.
    #[instrument(skip(self, options), fields(count = resource_ids.len()))]
    pub async fn publish_many(
        &self,
        resource_ids: &[String],
        options: &PublishOptions,
    ) -> Result<Vec<PublishOutcome>> {
        self.sessions.ensure_authenticated().await?;
        self.router
            .execute("publish_many", self.options, move |backend| async move {
                backend.publish_many(resource_ids, options).await
            })
            .await
    }

    pub async fn status(&self) -> RouterStatus {
        self.router.status().await
    }
}
