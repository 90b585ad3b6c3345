//! HTTP 客户端模块 - 托管数据库 REST 接口
//!
//! PostgREST 风格：
//! - `POST   /rest/v1/{table}`
//! - `PATCH  /rest/v1/{table}?id=eq.{id}`
//! - `DELETE /rest/v1/{table}?id=eq.{id}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{ComandaSyncError, Result};
use crate::store::{BackingStore, Collection, RECORD_ID_FIELD};

const REST_PREFIX: &str = "/rest/v1";
/// 错误响应正文最多保留的字符数
const MAX_ERROR_BODY: usize = 512;

/// 基于 reqwest 的后端存储实现
#[derive(Debug, Clone)]
pub struct RestBackingStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestBackingStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs.min(10)))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ComandaSyncError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        info!("✅ REST 后端客户端已创建 (base_url: {})", base_url);

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    /// 集合对应的表地址
    pub fn table_url(&self, collection: Collection) -> String {
        format!("{}{}/{}", self.base_url, REST_PREFIX, collection.table_name())
    }

    /// 按记录 ID 过滤的请求（`?id=eq.{id}`，由 reqwest 负责转义）
    fn record_request(&self, method: Method, collection: Collection, id: &str) -> RequestBuilder {
        self.request(method, &self.table_url(collection))
            .query(&[(RECORD_ID_FIELD, format!("eq.{}", id))])
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Prefer", "return=minimal")
    }

    async fn check(response: Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let message: String = if body.is_empty() {
            status.canonical_reason().unwrap_or("unknown error").to_string()
        } else {
            body.chars().take(MAX_ERROR_BODY).collect()
        };
        Err(ComandaSyncError::Store { status: status.as_u16(), message })
    }
}

#[async_trait]
impl BackingStore for RestBackingStore {
    async fn insert(&self, collection: Collection, record: &Map<String, Value>) -> Result<()> {
        let url = self.table_url(collection);
        debug!("POST {}", url);
        let response = self.request(Method::POST, &url).json(record).send().await?;
        Self::check(response).await
    }

    async fn update(&self, collection: Collection, id: &str, fields: &Map<String, Value>) -> Result<()> {
        debug!("PATCH {} id={}", collection.table_name(), id);
        let response = self
            .record_request(Method::PATCH, collection, id)
            .json(fields)
            .send()
            .await?;
        Self::check(response).await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        debug!("DELETE {} id={}", collection.table_name(), id);
        let response = self.record_request(Method::DELETE, collection, id).send().await?;
        Self::check(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RestBackingStore {
        RestBackingStore::new(&StoreConfig::new("https://db.example.com/", "anon-key")).unwrap()
    }

    #[test]
    fn test_table_url_uses_underscored_table_name() {
        let store = store();
        assert_eq!(store.table_url(Collection::Sales), "https://db.example.com/rest/v1/sales");
        assert_eq!(
            store.table_url(Collection::StockMovements),
            "https://db.example.com/rest/v1/stock_movements"
        );
    }

    fn record_url(store: &RestBackingStore, collection: Collection, id: &str) -> String {
        let request = store.record_request(Method::PATCH, collection, id).build().unwrap();
        request.url().as_str().to_string()
    }

    #[test]
    fn test_record_request_escapes_id() {
        let store = store();
        assert_eq!(
            record_url(&store, Collection::Products, "a1b2-c3"),
            "https://db.example.com/rest/v1/products?id=eq.a1b2-c3"
        );
        assert_eq!(
            record_url(&store, Collection::Customers, "x&y=1"),
            "https://db.example.com/rest/v1/customers?id=eq.x%26y%3D1"
        );
    }

    #[test]
    fn test_record_request_carries_auth_headers() {
        let request = store()
            .record_request(Method::DELETE, Collection::Sales, "7")
            .build()
            .unwrap();
        assert_eq!(request.method(), Method::DELETE);
        assert_eq!(request.headers()["apikey"], "anon-key");
        assert_eq!(request.headers()["Authorization"], "Bearer anon-key");
        assert_eq!(request.headers()["Prefer"], "return=minimal");
    }

    #[tokio::test]
    async fn test_unreachable_host_maps_to_transport_error() {
        let mut config = StoreConfig::new("http://127.0.0.1:9", "anon-key");
        config.request_timeout_secs = 2;
        let store = RestBackingStore::new(&config).unwrap();

        let err = store.delete(Collection::Sales, "1").await.unwrap_err();
        assert!(matches!(err, ComandaSyncError::Transport(_) | ComandaSyncError::Timeout(_)));
        assert_eq!(err.category(), "transport");
    }
}
