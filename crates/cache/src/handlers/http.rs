//! HTTP handler: objects are PUT to `<base_url>/<object_id>` and fetched
//! back with a GET of the returned URL.

use super::{ExternalObjectHandler, HTTP_HANDLER};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::time::Duration;
use strata_core::ObjectId;
use strata_core::config::HttpHandlerConfig;
use strata_storage::{ObjectStore, ObjectStoreExt};

pub struct HttpHandler {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<(String, Option<String>)>,
}

impl HttpHandler {
    pub fn new(base_url: &str, timeout: Duration) -> CacheResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: None,
        })
    }

    pub fn from_config(config: &HttpHandlerConfig) -> CacheResult<Self> {
        let handler = Self::new(&config.base_url, Duration::from_secs(config.timeout_secs))?;
        Ok(match &config.username {
            Some(user) => handler.with_basic_auth(user, config.password.as_deref()),
            None => handler,
        })
    }

    pub fn with_basic_auth(mut self, username: &str, password: Option<&str>) -> Self {
        self.credentials = Some((username.to_string(), password.map(str::to_string)));
        self
    }

    fn object_url(&self, id: &ObjectId) -> String {
        format!("{}/{}", self.base_url, id)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, password)) => req.basic_auth(user, password.as_deref()),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, url: &str) -> CacheResult<reqwest::Response> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| transport(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(transport(format!("{url}: HTTP {status}: {body}")));
        }
        Ok(response)
    }
}

fn transport(message: impl ToString) -> CacheError {
    CacheError::transport(HTTP_HANDLER, message)
}

#[async_trait]
impl ExternalObjectHandler for HttpHandler {
    async fn upload_objects(
        &self,
        ids: &[ObjectId],
        source: &dyn ObjectStore,
    ) -> CacheResult<Vec<String>> {
        let mut urls = Vec::with_capacity(ids.len());
        for id in ids {
            let data = source
                .get_object(id)
                .await
                .map_err(|e| transport(format!("reading {id}: {e}")))?;
            let url = self.object_url(id);
            let size = data.len();
            self.send(self.http.put(&url).body(data), &url).await?;
            tracing::debug!(object_id = %id, url = %url, size, "Uploaded object over HTTP");
            urls.push(url);
        }
        Ok(urls)
    }

    async fn download_objects(
        &self,
        objects: &[(ObjectId, String)],
        target: &dyn ObjectStore,
    ) -> CacheResult<()> {
        for (id, url) in objects {
            let response = self.send(self.http.get(url), url).await?;
            let data = response
                .bytes()
                .await
                .map_err(|e| transport(format!("{url}: reading body: {e}")))?;
            target.put_object(id, data).await?;
            tracing::debug!(object_id = %id, url = %url, "Downloaded object over HTTP");
        }
        Ok(())
    }
}
