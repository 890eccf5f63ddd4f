//! In-process cluster fixture shared by the integration tests.
//!
//! Backends are doubles that participate in the vote protocol the way a
//! real storage node would: stage, vote the hash of the staged update,
//! apply on commit, roll back on abort.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use helmsman::common::{
    blake3_hash, Config, Error, FailoverConfig, HealthConfig, NodeConfig, ReplicationConfig,
    RequestContext, Result, VirtualStorageConfig, VoteConfig,
};
use helmsman::router::{
    BackendNode, ClientRequest, ClientResponse, NodeManager, NodeRequest, NodeResponse, Phase,
    Router, VoteOutcome,
};
use helmsman::store::{ChangeType, CreateRepository, PlacementStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub struct MockNode {
    pub storage: String,
    pub up: AtomicBool,
    /// Park forward() until the stream is torn down
    pub hang: AtomicBool,
    /// Fail forward() without voting
    pub fail_forward: AtomicBool,
    /// Vote this hash instead of the staged update's real one
    pub vote_override: Mutex<Option<String>>,
    pub applied: Mutex<Vec<String>>,
    pub replicated_from: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub renamed: Mutex<Vec<(String, String)>>,
    pub housekept: Mutex<Vec<(String, ChangeType)>>,
}

impl MockNode {
    fn new(storage: &str) -> Arc<Self> {
        Arc::new(Self {
            storage: storage.to_string(),
            up: AtomicBool::new(true),
            hang: AtomicBool::new(false),
            fail_forward: AtomicBool::new(false),
            vote_override: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            replicated_from: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            renamed: Mutex::new(Vec::new()),
            housekept: Mutex::new(Vec::new()),
        })
    }

    fn check_up(&self) -> Result<()> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ConnectionFailed(format!(
                "{} is unreachable",
                self.storage
            )))
        }
    }
}

#[async_trait]
impl BackendNode for MockNode {
    async fn forward(&self, req: NodeRequest) -> Result<NodeResponse> {
        self.check_up()?;
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail_forward.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "{} stream failed mid-flight",
                self.storage
            )));
        }

        let Some(voter) = req.vote.clone() else {
            return Ok(NodeResponse {
                payload: Bytes::from_static(b"ok"),
            });
        };

        voter.start()?;
        let hash = self
            .vote_override
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| blake3_hash(req.payload.as_ref()));

        match voter.vote(&hash, Phase::Prepared).await? {
            VoteOutcome::Commit => {}
            VoteOutcome::Abort => {
                return Err(Error::FailedPrecondition(format!(
                    "vote aborted on {}",
                    self.storage
                )))
            }
            VoteOutcome::Stop => return Err(Error::Canceled("transaction stopped".into())),
        }

        self.applied
            .lock()
            .unwrap()
            .push(format!("{} {}", req.operation, req.replica_path));

        match voter.vote(&hash, Phase::Committed).await? {
            VoteOutcome::Commit => Ok(NodeResponse {
                payload: Bytes::from_static(b"ok"),
            }),
            VoteOutcome::Abort => Err(Error::FailedPrecondition(format!(
                "committed phase aborted on {}",
                self.storage
            ))),
            VoteOutcome::Stop => Err(Error::Canceled("transaction stopped".into())),
        }
    }

    async fn replicate(&self, source_storage: &str, replica_path: &str) -> Result<()> {
        self.check_up()?;
        self.replicated_from
            .lock()
            .unwrap()
            .push(format!("{} {}", source_storage, replica_path));
        Ok(())
    }

    async fn remove_repository(&self, replica_path: &str) -> Result<()> {
        self.check_up()?;
        self.removed.lock().unwrap().push(replica_path.to_string());
        Ok(())
    }

    async fn rename_repository(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.check_up()?;
        self.renamed
            .lock()
            .unwrap()
            .push((old_path.to_string(), new_path.to_string()));
        Ok(())
    }

    async fn housekeeping(&self, replica_path: &str, task: ChangeType) -> Result<()> {
        self.check_up()?;
        self.housekept
            .lock()
            .unwrap()
            .push((replica_path.to_string(), task));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_up()
    }
}

pub struct Cluster {
    pub config: Arc<Config>,
    pub store: Arc<PlacementStore>,
    pub router: Router,
    pub mocks: HashMap<String, Arc<MockNode>>,
    _dir: TempDir,
}

impl Cluster {
    pub fn new(storages: &[&str]) -> Self {
        Self::with_factor(storages, storages.len())
    }

    pub fn with_factor(storages: &[&str], replication_factor: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let config = Config {
            router_name: "router-1".into(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            db_path: dir.path().join("store"),
            virtual_storages: vec![VirtualStorageConfig {
                name: "vs1".into(),
                nodes: storages
                    .iter()
                    .map(|s| NodeConfig {
                        storage: s.to_string(),
                        address: format!("mock://{}", s),
                    })
                    .collect(),
                default_replication_factor: replication_factor,
                vote_quorum: None,
            }],
            vote: VoteConfig {
                prepared_timeout_secs: 2,
                committed_timeout_secs: 4,
                grace_secs: 5,
            },
            replication: ReplicationConfig {
                base_delay_ms: 1,
                max_delay_ms: 20,
                max_attempts: 3,
                ..ReplicationConfig::default()
            },
            health: HealthConfig::default(),
            failover: FailoverConfig::default(),
            log_level: "info".into(),
        };
        config.validate().unwrap();

        let config = Arc::new(config);
        let store = Arc::new(
            PlacementStore::open(&config.db_path, config.storage_names()).unwrap(),
        );

        let mut mocks = HashMap::new();
        let mut nodes = NodeManager::new();
        for storage in storages {
            let mock = MockNode::new(storage);
            nodes.register("vs1", storage, &format!("mock://{}", storage), mock.clone());
            mocks.insert(storage.to_string(), mock);
        }

        let router = Router::with_store(config.clone(), store.clone(), nodes).unwrap();
        Self {
            config,
            store,
            router,
            mocks,
            _dir: dir,
        }
    }

    pub fn node(&self, storage: &str) -> &Arc<MockNode> {
        &self.mocks[storage]
    }

    pub fn set_down(&self, storage: &str) {
        self.node(storage).up.store(false, Ordering::SeqCst);
    }

    pub fn set_up(&self, storage: &str) {
        self.node(storage).up.store(true, Ordering::SeqCst);
    }

    /// Push the mocks' reachability into the health snapshot. A real
    /// probe only expires stale positive reports after the freshness
    /// window; here downed nodes get their last positive report
    /// backdated so the change is visible immediately.
    pub fn sync_health(&self) {
        let now = chrono::Utc::now();
        let past = now - chrono::Duration::seconds(60);
        let mut storages: Vec<&String> = self.mocks.keys().collect();
        storages.sort();
        for storage in storages {
            if self.mocks[storage].up.load(Ordering::SeqCst) {
                self.store
                    .record_health("router-1", "vs1", storage, true, now)
                    .unwrap();
            } else {
                self.store
                    .record_health("router-1", "vs1", storage, true, past)
                    .unwrap();
                self.store
                    .record_health("router-1", "vs1", storage, false, now)
                    .unwrap();
            }
        }
    }

    /// Create a repository directly in the placement store.
    pub fn create_repo(
        &self,
        path: &str,
        primary: &str,
        updated: &[&str],
        outdated: &[&str],
    ) -> u64 {
        let id = self.store.reserve_repository_id("vs1", path).unwrap();
        self.store
            .create_repository(CreateRepository {
                repository_id: id,
                virtual_storage: "vs1".into(),
                relative_path: path.into(),
                replica_path: helmsman::common::derive_replica_path(id),
                primary: Some(primary.into()),
                updated_secondaries: updated.iter().map(|s| s.to_string()).collect(),
                outdated_secondaries: outdated.iter().map(|s| s.to_string()).collect(),
                store_assignments: true,
                force: false,
            })
            .unwrap();
        id
    }

    pub async fn dispatch(
        &self,
        operation: &str,
        path: &str,
        payload: &[u8],
    ) -> Result<ClientResponse> {
        let (_cancel, ctx) = RequestContext::new();
        self.router
            .dispatch(
                &ctx,
                ClientRequest {
                    virtual_storage: "vs1".into(),
                    relative_path: path.into(),
                    operation: operation.into(),
                    payload: Bytes::copy_from_slice(payload),
                },
            )
            .await
    }

    /// Per-storage generations of a repository.
    pub fn generations(&self, repository_id: u64) -> HashMap<String, Option<u64>> {
        self.store
            .get_replicas(repository_id)
            .unwrap()
            .into_iter()
            .map(|r| (r.storage, r.generation))
            .collect()
    }
}
