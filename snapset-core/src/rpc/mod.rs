//! Cluster RPC to the node agents.
//!
//! A single call waits for one host's reply up to a deadline. A fan-out
//! sends the same request to many hosts as independent tasks that report
//! through a channel; replies are collated into a [`FanOut`] that keeps the
//! hosts that answered apart from the ones that did not.

mod http;

pub use http::HttpTransport;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::agent_api::{AgentReply, AgentRequest};
use crate::cmd::{CmdOutput, CommandLine};
use crate::error::{Error, Result};

/// Delivers one request to one host's agent.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, host: &str, request: &AgentRequest) -> Result<AgentReply>;
}

/// Per-host results of a fan-out call.
#[derive(Debug)]
pub struct FanOut<T> {
    pub replies: BTreeMap<String, T>,
    pub failures: BTreeMap<String, Error>,
}

impl<T> FanOut<T> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// All replies, or the failure: the host's own error when a single host
    /// was asked, `rpc-partial` otherwise.
    pub fn complete(mut self) -> Result<BTreeMap<String, T>> {
        if self.failures.is_empty() {
            return Ok(self.replies);
        }
        if self.replies.is_empty() && self.failures.len() == 1 {
            if let Some((_, err)) = self.failures.pop_first() {
                return Err(err);
            }
        }
        Err(Error::RpcPartial {
            answered: self.replies.into_keys().collect(),
            failed: self
                .failures
                .into_iter()
                .map(|(host, err)| (host, err.to_string()))
                .collect(),
        })
    }
}

/// Typed calls over an [`RpcTransport`].
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn RpcTransport>,
    deadline: Duration,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn RpcTransport>, deadline: Duration) -> Self {
        Self {
            transport,
            deadline,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Same transport, different per-call deadline.
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            transport: self.transport.clone(),
            deadline,
        }
    }

    /// Call one host and decode its reply.
    #[instrument(skip(self, request), fields(host = %host, action = %request.label()))]
    pub async fn call<T: DeserializeOwned>(&self, host: &str, request: &AgentRequest) -> Result<T> {
        call_one(self.transport.as_ref(), host, request, self.deadline).await
    }

    /// Run `command` on `host` and fail unless it exits zero.
    pub async fn exec(&self, host: &str, command: CommandLine) -> Result<CmdOutput> {
        self.exec_as(host, command, None).await
    }

    pub async fn exec_as(
        &self,
        host: &str,
        command: CommandLine,
        user: Option<String>,
    ) -> Result<CmdOutput> {
        let rendered = command.to_string();
        let request = AgentRequest::Exec {
            command,
            user,
            timeout_secs: Some(self.deadline.as_secs()),
        };
        let out: CmdOutput = self.call(host, &request).await?;
        if !out.success() {
            return Err(Error::Remote {
                host: host.to_string(),
                action: rendered,
                message: format!("exited with {}: {}", out.status, out.combined().trim()),
            });
        }
        Ok(out)
    }

    /// Send `request` to every host; each call gets its own deadline.
    #[instrument(skip(self, request), fields(action = %request.label(), hosts = hosts.len()))]
    pub async fn fan_out<T>(&self, hosts: &[String], request: &AgentRequest) -> FanOut<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(hosts.len().max(1));
        for host in hosts {
            let tx = tx.clone();
            let transport = self.transport.clone();
            let request = request.clone();
            let host = host.clone();
            let deadline = self.deadline;
            tokio::spawn(async move {
                let result = call_one::<T>(transport.as_ref(), &host, &request, deadline).await;
                // A closed channel means the caller stopped waiting.
                let _ = tx.send((host, result)).await;
            });
        }
        drop(tx);

        let mut fan_out = FanOut {
            replies: BTreeMap::new(),
            failures: BTreeMap::new(),
        };
        while let Some((host, result)) = rx.recv().await {
            match result {
                Ok(reply) => {
                    fan_out.replies.insert(host, reply);
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "RPC failed");
                    fan_out.failures.insert(host, e);
                }
            }
        }
        debug!(
            answered = fan_out.replies.len(),
            failed = fan_out.failures.len(),
            "Fan-out collated"
        );
        fan_out
    }
}

async fn call_one<T: DeserializeOwned>(
    transport: &dyn RpcTransport,
    host: &str,
    request: &AgentRequest,
    deadline: Duration,
) -> Result<T> {
    let reply = tokio::time::timeout(deadline, transport.send(host, request))
        .await
        .map_err(|_| Error::RpcTimeout {
            host: host.to_string(),
            secs: deadline.as_secs(),
        })??;
    reply.decode().map_err(|message| Error::Remote {
        host: host.to_string(),
        action: request.label(),
        message,
    })
}
