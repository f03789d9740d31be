use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::dispatcher::{BatchDispatcher, DispatchListener, InternalDispatcher};
use crate::error::Result;
use crate::locality::{NodeLocality, StoreLocality};
use crate::operator::BatchOperator;
use crate::recovery::recover_in_flight;
use crate::resolver::JobDefinitionResolver;
use crate::restart::RestartValidator;
use crate::store::ExecutionStore;
use crate::transport::MessageTransport;
use crate::worker::JobRunner;

/// How long a shutting-down node waits for stopped jobs to end.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// One batch node: dispatch, listening, monitoring.
pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<dyn ExecutionStore>,
    pub transport: Option<Arc<dyn MessageTransport>>,
    pub internal: Arc<InternalDispatcher>,
    pub dispatcher: Arc<BatchDispatcher>,
    pub operator: Arc<BatchOperator>,
}

impl Node {
    /// Wires the node's components. Queued dispatch requires a transport.
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn ExecutionStore>,
        transport: Option<Arc<dyn MessageTransport>>,
        runner: Arc<dyn JobRunner>,
        resolver: Arc<dyn JobDefinitionResolver>,
    ) -> Result<Self> {
        let locality: Arc<dyn NodeLocality> = Arc::new(StoreLocality::new(
            store.clone(),
            config.server_id.clone(),
            config.rest_url.clone(),
        ));
        let internal = Arc::new(InternalDispatcher::new(
            config.clone(),
            store.clone(),
            runner,
            locality.clone(),
            transport.clone(),
        ));
        let dispatcher = Arc::new(BatchDispatcher::new(
            &config.dispatch,
            internal.clone(),
            locality,
            transport.clone(),
        )?);
        let operator = Arc::new(BatchOperator::new(
            store.clone(),
            dispatcher.clone(),
            RestartValidator::new(store.clone(), resolver),
            config.store.max_conflict_retries,
        ));

        Ok(Self {
            config,
            store,
            transport,
            internal,
            dispatcher,
            operator,
        })
    }

    /// Starts the node's background components:
    /// 1. Recovery of work a previous run of this server left in flight
    /// 2. The dispatch listener, when a transport is configured and listening is enabled
    /// 3. The monitor, when a dashboard address is configured
    ///
    /// Returns once the listener is subscribed, so requests queued afterwards
    /// reach it.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let mut tasks = Vec::new();

        let recovered = recover_in_flight(
            &self.store,
            &self.config.server_id,
            self.config.store.max_conflict_retries,
        )
        .await?;
        if !recovered.is_empty() {
            tracing::info!(
                server_id = %self.config.server_id,
                executions = recovered.executions.len(),
                step_threads = recovered.step_threads.len(),
                "Recovered work left in flight by a previous run"
            );
        }

        if let (Some(transport), true) = (&self.transport, self.config.dispatch.listen) {
            let listener = DispatchListener::new(
                self.internal.clone(),
                transport.clone(),
                self.config.dispatch.clone(),
            );
            tasks.push(listener.spawn(shutdown.clone()).await?);
        }

        if let Some(dashboard_addr) = self.config.dashboard_addr {
            let dashboard_state = DashboardState {
                server_id: self.config.server_id.clone(),
                rest_url: self.config.rest_url.clone(),
                mode: self.config.dispatch.mode,
                store: self.store.clone(),
                internal: self.internal.clone(),
            };
            tasks.push(tokio::spawn(async move {
                run_dashboard(dashboard_addr, dashboard_state).await;
            }));
        }

        tracing::info!(
            server_id = %self.config.server_id,
            mode = %self.config.dispatch.mode,
            "Node started"
        );
        Ok(tasks)
    }

    /// Runs until `shutdown` is cancelled, then stops in-flight jobs and
    /// waits for them to end.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let tasks = self.start(shutdown.clone()).await?;
        shutdown.cancelled().await;
        self.shutdown(tasks).await;
        Ok(())
    }

    /// Stops in-flight jobs, waits for them to end, then aborts the tasks
    /// returned by [`Node::start`].
    pub async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        self.drain().await;
        for task in tasks {
            task.abort();
        }
        tracing::info!(server_id = %self.config.server_id, "Node stopped");
    }

    async fn drain(&self) {
        let running = self.internal.running_executions().await;
        if running.is_empty() {
            return;
        }
        tracing::info!(executions = ?running, "Stopping in-flight job executions");
        for execution_id in &running {
            if let Err(e) = self.internal.stop(*execution_id).await {
                tracing::warn!(execution_id, error = %e, "Failed to stop job execution");
            }
        }

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while !self.internal.running_executions().await.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("Drain timed out with job executions still running");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
