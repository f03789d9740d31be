use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{DispatchError, Result, StoreError};
use crate::store::ExecutionStore;

/// Where an execution is running, relative to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local,
    Remote {
        server_id: String,
        rest_url: Option<String>,
    },
    /// No server has picked the execution up yet.
    Unassigned,
}

#[async_trait]
pub trait NodeLocality: Send + Sync {
    fn server_id(&self) -> &str;

    fn rest_url(&self) -> &str;

    async fn locate(&self, execution_id: u64) -> Result<Location>;
}

/// Answers from the server identity recorded on the execution when it started.
pub struct StoreLocality {
    store: Arc<dyn ExecutionStore>,
    server_id: String,
    rest_url: String,
}

impl StoreLocality {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        server_id: impl Into<String>,
        rest_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            server_id: server_id.into(),
            rest_url: rest_url.into(),
        }
    }
}

#[async_trait]
impl NodeLocality for StoreLocality {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn rest_url(&self) -> &str {
        &self.rest_url
    }

    async fn locate(&self, execution_id: u64) -> Result<Location> {
        let execution = self
            .store
            .get_job_execution(execution_id)
            .await
            .map_err(|e| match e {
                StoreError::NoSuchExecution(id) => DispatchError::NotFound(id),
                other => other.into(),
            })?;
        Ok(match execution.server_id {
            None => Location::Unassigned,
            Some(server_id) if server_id == self.server_id => Location::Local,
            Some(server_id) => Location::Remote {
                server_id,
                rest_url: execution.rest_url,
            },
        })
    }
}
