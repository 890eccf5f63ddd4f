//! The router: dispatcher, vote coordinator, health, failover, and the
//! admin surface, wired over the placement store.

pub mod backend;
pub mod dispatcher;
pub mod failover;
pub mod health;
pub mod http;
pub mod registry;
pub mod remote;
pub mod voting;

pub use backend::{BackendNode, NodeManager, NodeRequest, NodeResponse};
pub use dispatcher::{ClientRequest, ClientResponse, Dispatcher};
pub use failover::{FailoverController, PrimaryState};
pub use health::HealthManager;
pub use registry::{OperationRegistry, RpcType};
pub use voting::{Phase, TransactionRegistry, VoteOutcome, Voter, VoterHandle};

use crate::common::{Config, RequestContext, Result};
use crate::replication::ReplicationScheduler;
use crate::store::PlacementStore;
use std::sync::Arc;

pub struct Router {
    pub config: Arc<Config>,
    pub store: Arc<PlacementStore>,
    pub nodes: Arc<NodeManager>,
    pub transactions: Arc<TransactionRegistry>,
    pub health: Arc<HealthManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub failover: Arc<FailoverController>,
    pub scheduler: Arc<ReplicationScheduler>,
}

impl Router {
    /// Open the placement store at the configured path and wire every
    /// component over it.
    pub fn new(config: Config, nodes: NodeManager) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(PlacementStore::open(&config.db_path, config.storage_names())?);
        Self::with_store(Arc::new(config), store, nodes)
    }

    /// Wire components over an already-open store.
    pub fn with_store(
        config: Arc<Config>,
        store: Arc<PlacementStore>,
        nodes: NodeManager,
    ) -> Result<Self> {
        let nodes = Arc::new(nodes);
        let transactions = Arc::new(TransactionRegistry::new(config.vote.clone()));
        let health = Arc::new(HealthManager::new(
            store.clone(),
            nodes.clone(),
            config.router_name.clone(),
            config.health.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            store.clone(),
            nodes.clone(),
            transactions.clone(),
            health.clone(),
        ));
        let failover = Arc::new(FailoverController::new(
            store.clone(),
            health.clone(),
            config.failover.clone(),
        ));
        let scheduler = Arc::new(ReplicationScheduler::new(
            store.clone(),
            nodes.clone(),
            config.replication.clone(),
        ));

        Ok(Self {
            config,
            store,
            nodes,
            transactions,
            health,
            dispatcher,
            failover,
            scheduler,
        })
    }

    pub async fn dispatch(&self, ctx: &RequestContext, req: ClientRequest) -> Result<ClientResponse> {
        self.dispatcher.dispatch(ctx, req).await
    }

    /// Run the admin server and every background loop until ctrl-c.
    pub async fn serve(self) -> Result<()> {
        tracing::info!("starting router: {}", self.config.router_name);
        tracing::info!("  admin API: {}", self.config.bind_addr);
        tracing::info!("  DB path: {}", self.config.db_path.display());
        for vs in &self.config.virtual_storages {
            tracing::info!(
                "  virtual storage {}: {} nodes, replication factor {}",
                vs.name,
                vs.nodes.len(),
                vs.default_replication_factor
            );
        }

        let state = http::AdminState {
            config: self.config.clone(),
            store: self.store.clone(),
            health: self.health.clone(),
        };
        let app = http::admin_router(state);
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        let health = tokio::spawn(self.health.clone().run());
        let failover = tokio::spawn(self.failover.clone().run());
        let scheduler = tokio::spawn(self.scheduler.clone().run());

        tracing::info!("router ready");

        tokio::select! {
            res = axum::serve(listener, app) => {
                if let Err(e) = res {
                    tracing::error!("admin server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
            }
        }

        health.abort();
        failover.abort();
        scheduler.abort();
        Ok(())
    }
}
