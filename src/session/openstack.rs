//! OpenStack Keystone (identity) and Glance (image) client.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{check_status, join_path};
use crate::config::Config;
use crate::error::{AdapterError, Result};
use crate::io::{ByteStream, ResponseStream, StreamSource, build_client};
use crate::lifecycle::RemoteResource;

const AUTH_TOKEN: &str = "X-Auth-Token";
const SUBJECT_TOKEN: &str = "X-Subject-Token";

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: TokenInfo,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

/// Image metadata as reported by Glance.
#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// `null` until the image has data.
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ImageList {
    images: Vec<Image>,
}

/// Authenticated Keystone session plus the Glance endpoint from its catalog.
pub struct ImageServiceClient {
    http: Client,
    identity: Url,
    token: String,
    image_endpoint: Url,
}

impl ImageServiceClient {
    /// Authenticate with the password method and locate the image service.
    pub async fn connect(config: &Config) -> Result<Self> {
        let http = build_client(config.insecure)?;
        let identity = identity_base(&config.endpoint)?;

        let mut auth = json!({
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": config.username,
                        "domain": { "name": config.user_domain_name },
                        "password": config.password,
                    }
                }
            }
        });
        if let Some(project) = &config.project_name {
            auth["scope"] = json!({
                "project": {
                    "name": project,
                    "domain": { "name": config.project_domain_name },
                }
            });
        }

        let resp = http
            .post(join_path(&identity, "auth/tokens")?)
            .json(&json!({ "auth": auth }))
            .send()
            .await?;
        let resp = check_status(resp, "keystone authentication")?;

        let token = resp
            .headers()
            .get(SUBJECT_TOKEN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Protocol("keystone returned no X-Subject-Token".into()))?;
        let body: TokenBody = resp.json().await?;

        let image_endpoint = image_endpoint(&body.token.catalog, config.region.as_deref())?;
        tracing::debug!(%image_endpoint, "authenticated with keystone");

        Ok(Self {
            http,
            identity,
            token,
            image_endpoint,
        })
    }

    /// Look an image up by id, falling back to an exact name match.
    pub async fn find_image(&self, id_or_name: &str) -> Result<Image> {
        let by_id = join_path(&self.image_endpoint, &format!("v2/images/{id_or_name}"))?;
        let resp = self.http.get(by_id).header(AUTH_TOKEN, &self.token).send().await?;
        match check_status(resp, &format!("image {id_or_name}")) {
            Ok(resp) => return Ok(resp.json().await?),
            Err(AdapterError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut by_name = join_path(&self.image_endpoint, "v2/images")?;
        by_name.query_pairs_mut().append_pair("name", id_or_name);
        let resp = self.http.get(by_name).header(AUTH_TOKEN, &self.token).send().await?;
        let list: ImageList = check_status(resp, "image list")?.json().await?;

        let mut matches = list.images.into_iter();
        match (matches.next(), matches.next()) {
            (Some(image), None) => Ok(image),
            (None, _) => Err(AdapterError::NotFound(format!("image {id_or_name}"))),
            (Some(_), Some(_)) => Err(AdapterError::InvalidParameter {
                key: "target_id".into(),
                reason: format!("more than one image is named {id_or_name:?}"),
            }),
        }
    }

    /// Start a fresh download of the whole image.
    pub async fn download(&self, image_id: &str) -> Result<ResponseStream> {
        let url = join_path(&self.image_endpoint, &format!("v2/images/{image_id}/file"))?;
        let resp = self.http.get(url).header(AUTH_TOKEN, &self.token).send().await?;
        let resp = check_status(resp, &format!("download of image {image_id}"))?;
        tracing::debug!(image = image_id, status = %resp.status(), "download started");
        Ok(ResponseStream::new(resp))
    }
}

#[async_trait]
impl RemoteResource for ImageServiceClient {
    fn describe(&self) -> String {
        format!("keystone session at {}", self.identity)
    }

    /// Revoke the token.
    async fn release(&self) -> Result<()> {
        let resp = self
            .http
            .delete(join_path(&self.identity, "auth/tokens")?)
            .header(AUTH_TOKEN, &self.token)
            .header(SUBJECT_TOKEN, &self.token)
            .send()
            .await?;
        check_status(resp, "token revocation")?;
        Ok(())
    }
}

/// Keystone v3 base URL; accepts the endpoint with or without `/v3`.
fn identity_base(endpoint: &Url) -> Result<Url> {
    let trimmed = endpoint.as_str().trim_end_matches('/');
    if trimmed.ends_with("/v3") {
        return Ok(Url::parse(trimmed)?);
    }
    join_path(endpoint, "v3")
}

fn image_endpoint(catalog: &[CatalogEntry], region: Option<&str>) -> Result<Url> {
    let url = catalog
        .iter()
        .filter(|entry| entry.kind == "image")
        .flat_map(|entry| &entry.endpoints)
        .filter(|ep| ep.interface == "public")
        .find(|ep| region.is_none() || ep.region.as_deref() == region)
        .map(|ep| ep.url.as_str())
        .ok_or_else(|| AdapterError::NotFound("no public image endpoint in service catalog".into()))?;

    let url = url.trim_end_matches('/');
    let url = url.strip_suffix("/v2").unwrap_or(url);
    Ok(Url::parse(url)?)
}

/// Whole-image downloads of one Glance image.
pub struct GlanceImageSource {
    client: Arc<ImageServiceClient>,
    image_id: String,
}

impl GlanceImageSource {
    pub fn new(client: Arc<ImageServiceClient>, image_id: String) -> Self {
        Self { client, image_id }
    }
}

#[async_trait]
impl StreamSource for GlanceImageSource {
    async fn start(&self) -> Result<Box<dyn ByteStream>> {
        Ok(Box::new(self.client.download(&self.image_id).await?))
    }
}
