//! Mesh Coordinator: the application-facing entry point
//!
//! Holds at most one active [`MeshSession`] and forwards speaking, mute and
//! teardown calls to it. Switching to another (space, user) pair tears the
//! previous session down first.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::session::{MeshDeps, MeshSession};
use crate::types::{SpaceId, UserId};

pub struct MeshCoordinator {
    deps: MeshDeps,
    session: Mutex<Option<Arc<MeshSession>>>,
    /// Serializes initialize and cleanup
    lifecycle: tokio::sync::Mutex<()>,
}

impl MeshCoordinator {
    #[must_use]
    pub fn new(deps: MeshDeps) -> Self {
        Self {
            deps,
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Active session, if any
    #[must_use]
    pub fn session(&self) -> Option<Arc<MeshSession>> {
        self.session.lock().clone()
    }

    /// Open a session for `space_id` as `user_id`. Calling it again with the
    /// same pair returns the session already open.
    pub async fn initialize(
        &self,
        space_id: impl Into<SpaceId>,
        user_id: impl Into<UserId>,
    ) -> Result<Arc<MeshSession>> {
        let space_id = space_id.into();
        let user_id = user_id.into();
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(current) = self.session() {
            if current.space_id() == &space_id
                && current.user_id() == &user_id
                && !current.is_closed()
            {
                debug!(space_id = %space_id, user_id = %user_id, "Mesh already initialized");
                return Ok(current);
            }
        }

        let previous = self.session.lock().take();
        if let Some(previous) = previous {
            info!(
                from = %previous.space_id(),
                to = %space_id,
                "Switching mesh session"
            );
            previous.cleanup().await;
        }

        let session = MeshSession::open(space_id, user_id, &self.deps).await?;
        *self.session.lock() = Some(Arc::clone(&session));
        Ok(session)
    }

    /// See [`MeshSession::enable_speaking`]. `false` without a session.
    pub async fn enable_speaking(&self, enable: bool) -> bool {
        match self.session() {
            Some(session) => session.enable_speaking(enable).await,
            None => {
                debug!(enable, "Speaking change without a mesh session");
                false
            }
        }
    }

    pub async fn set_muted(&self, muted: bool) {
        if let Some(session) = self.session() {
            session.set_muted(muted).await;
        }
    }

    /// Tear down the active session. Safe without one and when repeated.
    pub async fn cleanup(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.cleanup().await;
        }
    }
}
