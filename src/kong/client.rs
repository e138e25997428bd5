//! Kong admin API client.
//!
//! [`KongAdmin`] is the seam the reconciler talks through; [`RestKongAdmin`]
//! is the production implementation against the admin port. Lookup 404s come
//! back as `None` and delete 404s as success so the reconciler's tolerance
//! rules stay in one place.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use reqwest::StatusCode;

#[cfg(test)]
use mockall::automock;

use super::types::{
    Certificate, Consumer, JwtCredential, JwtCredentialList, KongApi, KongApiList, Plugin,
    PluginList,
};
use crate::{Error, Result};

/// Request timeout for all admin calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Gateway operations the reconciler needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KongAdmin: Send + Sync {
    /// Fetch an API record by name; `None` when it does not exist.
    async fn get_api(&self, name: &str) -> Result<Option<KongApi>>;

    /// Create the record, or update it in place when `api.uid` is set.
    async fn upsert_api(&self, api: &KongApi) -> Result<KongApi>;

    /// Delete an API record by name. Absent records are a success.
    async fn delete_api(&self, name: &str) -> Result<()>;

    /// List API records whose upstream URL equals `upstream_url` exactly.
    async fn list_apis_by_upstream(&self, upstream_url: &str) -> Result<Vec<KongApi>>;

    /// List plugins attached to an API UID.
    async fn list_plugins(&self, api_uid: &str) -> Result<Vec<Plugin>>;

    /// Attach a plugin to an API UID.
    async fn create_plugin(&self, api_uid: &str, plugin: &Plugin) -> Result<Plugin>;

    /// Upload a certificate with its SNI hostnames.
    async fn create_certificate(&self, certificate: &Certificate) -> Result<()>;

    /// Fetch a consumer by username; `None` when it does not exist.
    async fn get_consumer(&self, username: &str) -> Result<Option<Consumer>>;

    /// Create a consumer.
    async fn create_consumer(&self, username: &str) -> Result<Consumer>;

    /// List JWT credentials owned by a consumer.
    async fn list_jwt_credentials(&self, username: &str) -> Result<Vec<JwtCredential>>;

    /// Create a JWT credential for a consumer.
    async fn create_jwt_credential(
        &self,
        username: &str,
        credential: &JwtCredential,
    ) -> Result<JwtCredential>;
}

/// REST implementation of [`KongAdmin`].
pub struct RestKongAdmin {
    http: reqwest::Client,
    base: String,
}

impl RestKongAdmin {
    /// Build a client for the admin API at `base` (e.g. `http://kong:8001`).
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::gateway(format!("building admin client: {e}")))?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::gateway(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::gateway_status(status, body))
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        self.send(req)
            .await?
            .json::<T>()
            .await
            .map_err(|e| Error::serialization(e.to_string()))
    }
}

#[async_trait]
impl KongAdmin for RestKongAdmin {
    async fn get_api(&self, name: &str) -> Result<Option<KongApi>> {
        match self
            .json::<KongApi>(self.http.get(self.url(&format!("/apis/{name}"))))
            .await
        {
            Ok(api) => Ok(Some(api)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn upsert_api(&self, api: &KongApi) -> Result<KongApi> {
        let req = match &api.uid {
            Some(uid) => self.http.patch(self.url(&format!("/apis/{uid}"))),
            None => self.http.post(self.url("/apis")),
        };
        self.json(req.json(api)).await
    }

    async fn delete_api(&self, name: &str) -> Result<()> {
        match self
            .send(self.http.delete(self.url(&format!("/apis/{name}"))))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn list_apis_by_upstream(&self, upstream_url: &str) -> Result<Vec<KongApi>> {
        let list: KongApiList = self
            .json(
                self.http
                    .get(self.url("/apis"))
                    .query(&[("upstream_url", upstream_url)]),
            )
            .await?;
        Ok(list.data)
    }

    async fn list_plugins(&self, api_uid: &str) -> Result<Vec<Plugin>> {
        let list: PluginList = self
            .json(self.http.get(self.url(&format!("/apis/{api_uid}/plugins"))))
            .await?;
        Ok(list.data)
    }

    async fn create_plugin(&self, api_uid: &str, plugin: &Plugin) -> Result<Plugin> {
        self.json(
            self.http
                .post(self.url(&format!("/apis/{api_uid}/plugins")))
                .json(plugin),
        )
        .await
    }

    async fn create_certificate(&self, certificate: &Certificate) -> Result<()> {
        self.send(self.http.post(self.url("/certificates")).json(certificate))
            .await
            .map(|_| ())
    }

    async fn get_consumer(&self, username: &str) -> Result<Option<Consumer>> {
        match self
            .json::<Consumer>(self.http.get(self.url(&format!("/consumers/{username}"))))
            .await
        {
            Ok(consumer) => Ok(Some(consumer)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create_consumer(&self, username: &str) -> Result<Consumer> {
        let body = Consumer {
            id: None,
            username: username.to_string(),
        };
        self.json(self.http.post(self.url("/consumers")).json(&body))
            .await
    }

    async fn list_jwt_credentials(&self, username: &str) -> Result<Vec<JwtCredential>> {
        let list: JwtCredentialList = self
            .json(
                self.http
                    .get(self.url(&format!("/consumers/{username}/jwt"))),
            )
            .await?;
        Ok(list.data)
    }

    async fn create_jwt_credential(
        &self,
        username: &str,
        credential: &JwtCredential,
    ) -> Result<JwtCredential> {
        self.json(
            self.http
                .post(self.url(&format!("/consumers/{username}/jwt")))
                .json(credential),
        )
        .await
    }
}
