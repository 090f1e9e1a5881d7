//! HTTP transport to the node agents.

use async_trait::async_trait;
use tracing::debug;

use super::RpcTransport;
use crate::agent_api::{AgentReply, AgentRequest};
use crate::error::{Error, Result};

/// POSTs requests to `{scheme}://{host}:{port}/v1/agents/{agent}/{action}`.
pub struct HttpTransport {
    scheme: String,
    port: u16,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(scheme: impl Into<String>, port: u16) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::InvalidConfig(format!("agent client: {}", e)))?;
        Ok(Self {
            scheme: scheme.into(),
            port,
            http,
        })
    }

    fn url(&self, host: &str, request: &AgentRequest) -> String {
        format!(
            "{}://{}:{}/v1/agents/{}/{}",
            self.scheme,
            host,
            self.port,
            request.agent(),
            request.action()
        )
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, host: &str, request: &AgentRequest) -> Result<AgentReply> {
        let url = self.url(host, request);
        debug!(url = %url, "Sending agent request");

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::RpcUnreachable {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let reply = response.json::<AgentReply>().await.map_err(|e| Error::Remote {
            host: host.to_string(),
            action: request.label(),
            message: format!("HTTP {}: {}", status, e),
        })?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url() {
        let transport = HttpTransport::new("http", 8740).unwrap();
        let url = transport.url("db-1", &AgentRequest::LvmList { tag: None });
        assert_eq!(url, "http://db-1:8740/v1/agents/lvm/list");
    }
}
