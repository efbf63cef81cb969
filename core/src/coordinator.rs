use gather_async_utils::CancelErr;
use gather_async_utils::OrCancelExt;
use gather_protocol::SearchRequest;
use gather_protocol::SearchResponse;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::config::CoordinatorConfig;
use crate::error::SearchError;
use crate::fetch::DefaultStageFactory;
use crate::fetch::PerHitStageFactory;
use crate::listener::PhaseListener;
use crate::listener::PhaseListenerBus;
use crate::phase::ExecutorSettings;
use crate::phase::PhaseExecutor;
use crate::phase::Transition;
use crate::retry::DefaultRetryPolicy;
use crate::retry::RetryPolicy;
use crate::transport::RpcClient;
use crate::transport::ShardLocator;

/// Entry point for running searches. Holds the collaborators shared by all
/// requests; every call to [`SearchCoordinator::execute`] gets its own
/// executor and result stores.
#[derive(Clone)]
pub struct SearchCoordinator {
    config: CoordinatorConfig,
    locator: Arc<dyn ShardLocator>,
    rpc: Arc<dyn RpcClient>,
    retry: Arc<dyn RetryPolicy>,
    stage_factory: Arc<dyn PerHitStageFactory>,
    listeners: PhaseListenerBus,
}

impl std::fmt::Debug for SearchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCoordinator")
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl SearchCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        locator: Arc<dyn ShardLocator>,
        rpc: Arc<dyn RpcClient>,
    ) -> Self {
        Self {
            config,
            locator,
            rpc,
            retry: Arc::new(DefaultRetryPolicy),
            stage_factory: Arc::new(DefaultStageFactory::new()),
            listeners: PhaseListenerBus::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stage_factory(mut self, stage_factory: Arc<dyn PerHitStageFactory>) -> Self {
        self.stage_factory = stage_factory;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn PhaseListener>) -> Self {
        self.listeners.register(listener);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn execute(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse, SearchError> {
        self.execute_traced(request, cancel).await.0
    }

    /// Like [`SearchCoordinator::execute`], also returning every executor
    /// state transition the request went through.
    pub async fn execute_traced(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> (Result<SearchResponse, SearchError>, Vec<Transition>) {
        if let Err(err) = validate(request) {
            return (Err(err), Vec::new());
        }
        debug!(
            indices = ?request.indices,
            search_type = ?request.search_type,
            from = request.from,
            size = request.size,
            "starting search"
        );

        let settings = ExecutorSettings::resolve(&self.config, request);
        let mut executor = PhaseExecutor::new(
            request,
            settings,
            Arc::clone(&self.rpc),
            Arc::clone(&self.retry),
            Arc::clone(&self.stage_factory),
            self.listeners.clone(),
        );
        if let Err(err) = executor.start(self.locator.as_ref()) {
            return (Err(err), executor.into_trace());
        }

        let result = match executor.run().or_cancel(cancel).await {
            Ok(result) => result,
            Err(CancelErr::Cancelled) => {
                let err = SearchError::Cancelled;
                executor.abort(&err);
                Err(err)
            }
        };
        if let Err(err) = &result {
            warn!(error = %err, "search failed");
        }
        (result, executor.into_trace())
    }
}

fn validate(request: &SearchRequest) -> Result<(), SearchError> {
    if request.indices.is_empty() {
        return Err(SearchError::invalid_request("at least one index is required"));
    }
    if request.max_concurrent_shard_requests == Some(0) {
        return Err(SearchError::invalid_request(
            "max_concurrent_shard_requests must be at least 1",
        ));
    }
    if request.timeout_ms == Some(0) {
        return Err(SearchError::invalid_request("timeout must be positive"));
    }
    Ok(())
}

/// Runs `request` with the default configuration and no cancellation.
pub async fn execute(
    request: &SearchRequest,
    locator: Arc<dyn ShardLocator>,
    rpc: Arc<dyn RpcClient>,
) -> Result<SearchResponse, SearchError> {
    SearchCoordinator::new(CoordinatorConfig::default(), locator, rpc)
        .execute(request, &CancellationToken::new())
        .await
}
