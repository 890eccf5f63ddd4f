//! HTTP backend client
//!
//! Talks to a storage node over its internal HTTP API. Mutators run the
//! prepare/commit/abort shape: the backend stages the update and
//! reports the vote hash, this client casts the vote, and the decided
//! outcome picks commit or rollback.

use crate::common::{Error, Result};
use crate::router::backend::{BackendNode, NodeManager, NodeRequest, NodeResponse};
use crate::router::voting::{Phase, VoteOutcome};
use crate::store::ChangeType;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub struct HttpBackendNode {
    address: String,
    client: reqwest::Client,
}

impl HttpBackendNode {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}{}", self.address, path);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{} on backend", path)));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "backend returned {}: {}",
                status, detail
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("invalid backend response: {}", e)))
    }
}

#[derive(Deserialize)]
struct RpcReply {
    payload: Vec<u8>,
}

#[derive(Deserialize)]
struct PrepareReply {
    pending_id: String,
    vote: String,
}

#[async_trait]
impl BackendNode for HttpBackendNode {
    async fn forward(&self, req: NodeRequest) -> Result<NodeResponse> {
        let Some(voter) = req.vote.clone() else {
            let reply: RpcReply = self
                .post(
                    "/internal/rpc",
                    json!({
                        "storage": req.storage,
                        "replica_path": req.replica_path,
                        "operation": req.operation,
                        "payload": req.payload.as_ref(),
                    }),
                )
                .await?;
            return Ok(NodeResponse {
                payload: Bytes::from(reply.payload),
            });
        };

        voter.start()?;
        let prepared: PrepareReply = self
            .post(
                "/internal/prepare",
                json!({
                    "storage": req.storage,
                    "replica_path": req.replica_path,
                    "operation": req.operation,
                    "payload": req.payload.as_ref(),
                }),
            )
            .await?;

        match voter.vote(&prepared.vote, Phase::Prepared).await? {
            VoteOutcome::Commit => {}
            VoteOutcome::Abort => {
                let _: serde_json::Value = self
                    .post(
                        "/internal/abort",
                        json!({ "pending_id": prepared.pending_id }),
                    )
                    .await?;
                return Err(Error::FailedPrecondition(format!(
                    "vote aborted for {}",
                    req.replica_path
                )));
            }
            VoteOutcome::Stop => {
                let _: serde_json::Value = self
                    .post(
                        "/internal/abort",
                        json!({ "pending_id": prepared.pending_id }),
                    )
                    .await?;
                return Err(Error::Canceled("transaction stopped".into()));
            }
        }

        let reply: RpcReply = self
            .post(
                "/internal/commit",
                json!({ "pending_id": prepared.pending_id }),
            )
            .await?;

        match voter.vote(&prepared.vote, Phase::Committed).await? {
            VoteOutcome::Commit => Ok(NodeResponse {
                payload: Bytes::from(reply.payload),
            }),
            VoteOutcome::Abort => Err(Error::FailedPrecondition(format!(
                "committed phase aborted for {}",
                req.replica_path
            ))),
            VoteOutcome::Stop => Err(Error::Canceled("transaction stopped".into())),
        }
    }

    async fn replicate(&self, source_storage: &str, replica_path: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post(
                "/internal/replicate",
                json!({
                    "source_storage": source_storage,
                    "replica_path": replica_path,
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove_repository(&self, replica_path: &str) -> Result<()> {
        match self
            .post::<serde_json::Value>(
                "/internal/remove",
                json!({ "replica_path": replica_path }),
            )
            .await
        {
            // Removing a repository that is already gone succeeds
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rename_repository(&self, old_path: &str, new_path: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post(
                "/internal/rename",
                json!({ "old_path": old_path, "new_path": new_path }),
            )
            .await?;
        Ok(())
    }

    async fn housekeeping(&self, replica_path: &str, task: ChangeType) -> Result<()> {
        let _: serde_json::Value = self
            .post(
                "/internal/housekeeping",
                json!({ "replica_path": replica_path, "task": task.to_string() }),
            )
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/healthz", self.address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", url, e)))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Unavailable(format!(
                "backend health check returned {}",
                response.status()
            )))
        }
    }
}

/// Build a node manager with an HTTP client per configured backend.
pub fn http_nodes(config: &crate::common::Config) -> NodeManager {
    let mut nodes = NodeManager::new();
    for vs in &config.virtual_storages {
        for node in &vs.nodes {
            nodes.register(
                &vs.name,
                &node.storage,
                &node.address,
                Arc::new(HttpBackendNode::new(&node.address)),
            );
        }
    }
    nodes
}
