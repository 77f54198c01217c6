//! HTTP history API.
//!
//! `GET {base}/chat/{room}/history/?page_size=N[&before=T][&after=T]`,
//! answered with a JSON array of messages.

use async_trait::async_trait;
use roomfeed_core::{HistoryApi, HistoryError, HistoryRequest};
use roomfeed_proto::Message;

/// [`HistoryApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpHistoryApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHistoryApi {
    /// `base_url` is the API root, e.g. `http://localhost:8000/api/community`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Use a preconfigured client (timeouts, auth headers).
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }

    /// History URL for a request, without the query string.
    pub fn history_url(&self, request: &HistoryRequest) -> String {
        format!("{}/chat/{}/history/", self.base_url.trim_end_matches('/'), request.room_id)
    }

    fn query(request: &HistoryRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![("page_size", request.page_size.to_string())];
        if let Some(before) = request.before {
            query.push(("before", before.as_millis().to_string()));
        }
        if let Some(after) = request.after {
            query.push(("after", after.as_millis().to_string()));
        }
        query
    }
}

fn unavailable(e: &reqwest::Error) -> HistoryError {
    HistoryError::Unavailable { status_code: e.status().map(|s| s.as_u16()), message: e.to_string() }
}

#[async_trait]
impl HistoryApi for HttpHistoryApi {
    async fn fetch(&self, request: &HistoryRequest) -> Result<Vec<Message>, HistoryError> {
        let response = self
            .client
            .get(self.history_url(request))
            .query(&Self::query(request))
            .send()
            .await
            .map_err(|e| unavailable(&e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HistoryError::Unavailable { status_code: Some(status.as_u16()), message });
        }

        response.json::<Vec<Message>>().await.map_err(|e| unavailable(&e))
    }
}
