use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Response;
use url::Url;

use crate::common::error::{Result, SyncError};
use crate::common::models::{
    AddMembers, GroupDetails, GroupSummary, HistoryPage, HistoryResponse, NewGroup,
};

/// Where history pages come from. `ApiClient` is the real one; tests plug in
/// their own.
#[async_trait]
pub trait HistorySource: Send + Sync + 'static {
    async fn fetch_page(&self, room_id: &str, username: &str, page: u32, limit: u32) -> Result<HistoryPage>;
}

/// Client for the backend REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            http: reqwest::Client::new(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends path segments to the base URL, escaping each one.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidInput(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `GET /groups/user/{username}`
    pub async fn list_groups(&self, username: &str) -> Result<Vec<GroupSummary>> {
        let url = self.endpoint(&["groups", "user", username])?;
        let resp = check(self.http.get(url).send().await?).await?;
        Ok(resp.json().await?)
    }

    /// `POST /groups`
    pub async fn create_group(&self, name: &str, creator_username: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::InvalidInput("group name must not be blank".to_string()));
        }
        let body = NewGroup {
            name: name.to_string(),
            creator_username: creator_username.to_string(),
        };
        let url = self.endpoint(&["groups"])?;
        check(self.http.post(url).json(&body).send().await?).await?;
        Ok(())
    }

    /// `GET /groups/{roomId}`
    pub async fn group_details(&self, room_id: &str) -> Result<GroupDetails> {
        let url = self.endpoint(&["groups", room_id])?;
        let resp = check(self.http.get(url).send().await?).await?;
        Ok(resp.json().await?)
    }

    /// `POST /groups/{roomId}/members`
    pub async fn add_members(&self, room_id: &str, usernames: &[String], added_by: &str) -> Result<()> {
        if usernames.is_empty() {
            return Err(SyncError::InvalidInput("no members selected".to_string()));
        }
        let body = AddMembers {
            usernames: usernames.to_vec(),
            added_by: added_by.to_string(),
        };
        let url = self.endpoint(&["groups", room_id, "members"])?;
        check(self.http.post(url).json(&body).send().await?).await?;
        Ok(())
    }

    /// `DELETE /groups/{roomId}`
    pub async fn delete_group(&self, room_id: &str) -> Result<()> {
        let url = self.endpoint(&["groups", room_id])?;
        check(self.http.delete(url).send().await?).await?;
        Ok(())
    }

    /// Deletes the group only if `username` is its admin.
    pub async fn delete_group_as(&self, room_id: &str, username: &str) -> Result<()> {
        let details = self.group_details(room_id).await?;
        if details.admin() != Some(username) {
            return Err(SyncError::InvalidInput(format!(
                "only the group admin can delete {}",
                details.name
            )));
        }
        self.delete_group(room_id).await
    }
}

#[async_trait]
impl HistorySource for ApiClient {
    /// `GET /messages/group/{roomId}?username=&page=&limit=`
    async fn fetch_page(&self, room_id: &str, username: &str, page: u32, limit: u32) -> Result<HistoryPage> {
        let mut url = self.endpoint(&["messages", "group", room_id])?;
        url.query_pairs_mut()
            .append_pair("username", username)
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());

        debug!("[HISTORY] GET {}", url);
        let resp = check(self.http.get(url).send().await?).await?;
        let body: HistoryResponse = resp.json().await?;
        Ok(body.into_page(room_id))
    }
}

/// Turns a non-2xx response into `SyncError::Status`, preferring the
/// backend's `{ "error": ... }` text when present.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    let body = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(text);
    warn!("[API] Request failed with {}: {}", status, body);
    Err(SyncError::Status {
        status: status.as_u16(),
        body,
    })
}
