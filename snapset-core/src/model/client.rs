//! Access to the deployment manager's REST model.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// One item of the deployment model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelItem {
    pub id: String,
    pub item_type: String,
    pub path: String,
    pub state: String,
    pub properties: BTreeMap<String, String>,
}

impl ModelItem {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Integer property, 0 when absent or unparsable.
    pub fn int_property(&self, key: &str) -> i64 {
        self.property(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn bool_property(&self, key: &str) -> bool {
        matches!(self.property(key), Some("true"))
    }

    /// Comma separated list property.
    pub fn list_property(&self, key: &str) -> Vec<String> {
        self.property(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Read-only access to model items by path.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// The item at `path`, or `None` when the path does not exist.
    async fn get(&self, path: &str) -> Result<Option<ModelItem>>;

    /// Children of the collection or item at `path`; empty when it does not exist.
    async fn children(&self, path: &str) -> Result<Vec<ModelItem>>;

    /// Whether the deployment manager is currently executing a plan.
    async fn plan_running(&self) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct RestItem {
    #[serde(default)]
    id: String,
    #[serde(rename = "item-type-name", default)]
    item_type: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    properties: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "_links", default)]
    links: Option<RestLinks>,
    #[serde(rename = "_embedded", default)]
    embedded: Option<RestEmbedded>,
}

#[derive(Debug, Deserialize)]
struct RestLinks {
    #[serde(rename = "self")]
    this: Option<RestHref>,
}

#[derive(Debug, Deserialize)]
struct RestHref {
    href: String,
}

#[derive(Debug, Deserialize)]
struct RestEmbedded {
    #[serde(default)]
    item: Vec<RestItem>,
}

impl RestItem {
    fn into_item(self, fallback_path: &str, prefix: &str) -> ModelItem {
        let path = self
            .links
            .and_then(|l| l.this)
            .and_then(|h| h.href.find(prefix).map(|i| h.href[i + prefix.len()..].to_string()))
            .unwrap_or_else(|| fallback_path.to_string());
        let properties = self
            .properties
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect();
        ModelItem {
            id: self.id,
            item_type: self.item_type,
            path,
            state: self.state,
            properties,
        }
    }
}

/// [`ModelClient`] over the deployment manager's HAL+JSON REST interface.
pub struct RestModelClient {
    base_url: String,
    user: String,
    password: String,
    http: reqwest::Client,
}

/// Path prefix of the REST resources.
const REST_PREFIX: &str = "/litp/rest/v1";

impl RestModelClient {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("model client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            password: password.into(),
            http,
        })
    }

    async fn fetch(&self, path: &str) -> Result<Option<RestItem>> {
        let url = format!("{}{}{}", self.base_url, REST_PREFIX, path);
        debug!(url = %url, "GET model item");

        let response = self
            .http
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::ModelUnavailable(format!("{}: {}", path, e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::ModelUnavailable(format!(
                "{}: HTTP {}",
                path,
                response.status()
            )));
        }

        let item = response
            .json::<RestItem>()
            .await
            .map_err(|e| Error::ModelUnavailable(format!("{}: bad response: {}", path, e)))?;
        Ok(Some(item))
    }
}

#[async_trait]
impl ModelClient for RestModelClient {
    async fn get(&self, path: &str) -> Result<Option<ModelItem>> {
        Ok(self
            .fetch(path)
            .await?
            .map(|item| item.into_item(path, REST_PREFIX)))
    }

    async fn children(&self, path: &str) -> Result<Vec<ModelItem>> {
        let Some(item) = self.fetch(path).await? else {
            return Ok(Vec::new());
        };
        let children = item.embedded.map(|e| e.item).unwrap_or_default();
        Ok(children
            .into_iter()
            .map(|child| {
                let fallback = format!("{}/{}", path.trim_end_matches('/'), child.id);
                child.into_item(&fallback, REST_PREFIX)
            })
            .collect())
    }

    async fn plan_running(&self) -> Result<bool> {
        let plans = self.children("/plans").await?;
        Ok(plans.iter().any(|p| p.state == "running"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_item_conversion() {
        let json = serde_json::json!({
            "id": "lun1",
            "item-type-name": "lun-disk",
            "state": "Applied",
            "properties": {"snap_size": "100", "lun_name": "mysql", "bootable": false},
            "_links": {"self": {"href": "https://ms:9999/litp/rest/v1/deployments/d1/lun1"}}
        });
        let item: RestItem = serde_json::from_value(json).unwrap();
        let item = item.into_item("/fallback", REST_PREFIX);
        assert_eq!(item.path, "/deployments/d1/lun1");
        assert_eq!(item.int_property("snap_size"), 100);
        assert_eq!(item.property("lun_name"), Some("mysql"));
        assert_eq!(item.property("bootable"), Some("false"));
        assert!(!item.bool_property("bootable"));
    }

    #[test]
    fn test_list_property() {
        let mut item = ModelItem::default();
        item.properties
            .insert("node_list".to_string(), "db-1, db-2,,db-3".to_string());
        assert_eq!(item.list_property("node_list"), vec!["db-1", "db-2", "db-3"]);
        assert!(item.list_property("missing").is_empty());
    }
}
