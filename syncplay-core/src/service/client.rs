//! HTTP client for the coordination service

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::request::ServiceRequest;
use super::types::*;
use super::{GroupService, ServiceError};

/// Connection timeout
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Request timeout. Time probes are useless if they take longer than this.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Header carrying the access token
const TOKEN_HEADER: &str = "X-Emby-Token";

/// Wire shape of the joined-state endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JoinedStateResponse {
    is_member: bool,
    #[serde(default)]
    group: Option<GroupSnapshot>,
}

/// Wire shape of the item query endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ItemsResponse {
    items: Vec<MediaItem>,
}

/// `GroupService` over the service's REST API
#[derive(Debug, Clone)]
pub struct HttpGroupService {
    http: Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpGroupService {
    /// Create a client for the given server URL
    pub fn new(base_url: impl Into<String>) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(2)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: None,
        })
    }

    /// Set the access token for authentication
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a request with optional authentication
    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, &url);

        if let Some(token) = &self.access_token {
            req = req.header(TOKEN_HEADER, token);
        }

        req
    }

    /// Send and map transport and status failures
    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ServiceError> {
        let resp = req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                warn!("Service unreachable: {}", e);
                ServiceError::NotReachable
            } else {
                ServiceError::Http(e)
            }
        })?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ServiceError::Unauthorized),
            _ => Ok(resp.error_for_status()?),
        }
    }
}

#[async_trait]
impl GroupService for HttpGroupService {
    async fn probe_time(&self) -> Result<TimeProbe, ServiceError> {
        let resp = self.execute(self.request(Method::GET, "/GetUtcTime")).await?;
        Ok(resp.json().await?)
    }

    #[instrument(skip(self, request), fields(request = request.name()))]
    async fn send(&self, request: ServiceRequest) -> Result<(), ServiceError> {
        let mut req = self.request(Method::POST, &request.path());
        if let Some(body) = request.body() {
            req = req.json(&body);
        }

        self.execute(req).await?;
        debug!("Sent {}", request.name());
        Ok(())
    }

    async fn fetch_joined_state(&self) -> Result<JoinedState, ServiceError> {
        let resp = self
            .execute(self.request(Method::GET, "/SyncPlay/v2/JoinedState"))
            .await?;

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(JoinedState::NotMember);
        }

        let body: JoinedStateResponse = resp.json().await?;
        match (body.is_member, body.group) {
            (true, Some(snapshot)) => Ok(JoinedState::Member(snapshot)),
            (true, None) => Err(ServiceError::Api("Joined state without group snapshot".to_string())),
            (false, _) => Ok(JoinedState::NotMember),
        }
    }

    async fn resolve_items(&self, item_ids: &[String]) -> Result<Vec<MediaItem>, ServiceError> {
        if item_ids.is_empty() {
            return Ok(Vec::new());
        }

        let resp = self
            .execute(
                self.request(Method::GET, "/Items")
                    .query(&[("Ids", item_ids.join(","))]),
            )
            .await?;
        let body: ItemsResponse = resp.json().await?;

        // The catalog does not promise request order, and an item may appear
        // several times in a queue.
        let mut items = Vec::with_capacity(item_ids.len());
        for id in item_ids {
            match body.items.iter().find(|item| &item.id == id) {
                Some(item) => items.push(item.clone()),
                None => return Err(ServiceError::Api(format!("Item {} not found", id))),
            }
        }
        Ok(items)
    }
}
