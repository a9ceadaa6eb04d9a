//! HTTP client for a REST control-plane API.
//!
//! API: POST /instances, GET /instances/{id}, GET /instances?tag=,
//! POST /instances/{id}/{start,stop,terminate}, POST /tags,
//! POST /volumes, GET /volumes/{id}, GET /volumes?tag=,
//! POST /volumes/{id}/attach, POST /images, GET /images/{id},
//! GET /images?prefix=
//!
//! 404 maps to `Error::NotFound` — the lifecycle layer depends on that
//! being distinguishable from other failures.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::{CloudProvider, Image, Instance, InstanceSpec, Volume};

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateInstanceRequest<'a> {
    #[serde(flatten)]
    spec: &'a InstanceSpec,
    /// Idempotency token: a retried create must not launch twice.
    client_token: String,
}

#[derive(Debug, Serialize)]
struct TagRequest<'a> {
    resource_id: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateVolumeRequest<'a> {
    size_gb: u32,
    zone: &'a str,
}

#[derive(Debug, Serialize)]
struct AttachVolumeRequest<'a> {
    instance_id: &'a str,
    device: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateImageRequest<'a> {
    instance_id: &'a str,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateImageResponse {
    image_id: String,
}

#[derive(Debug, Deserialize)]
struct InstanceListResponse {
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
struct VolumeListResponse {
    volumes: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
struct ImageListResponse {
    images: Vec<Image>,
}

// ── Client ──────────────────────────────────────────────────────────

/// Control-plane client over REST.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(base_url: String) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("{what} request failed: {e}")))?;
        Self::decode(resp, what).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        what: &str,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("{what} request failed: {e}")))?;
        Self::decode(resp, what).await
    }

    /// POST with an empty body and no interesting response.
    async fn post_action(&self, path: &str, what: &str) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("{what} request failed: {e}")))?;
        Self::check(resp, what).await?;
        Ok(())
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response, what: &str) -> Result<T> {
        let resp = Self::check(resp, what).await?;
        resp.json::<T>()
            .await
            .map_err(|e| Error::Serde(format!("failed to parse {what} response: {e}")))
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.as_u16() == 404 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::NotFound(format!("{what}: {body}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Provider(format!("{what} returned {status}: {body}")));
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl CloudProvider for HttpProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        let req = CreateInstanceRequest {
            spec,
            client_token: uuid::Uuid::new_v4().to_string(),
        };
        tracing::info!(
            image_id = %spec.image_id,
            instance_type = %spec.instance_type,
            zone = %spec.zone,
            "creating instance"
        );
        let instance: Instance = self.post_json("/instances", &req, "create instance").await?;
        tracing::info!(instance_id = %instance.id, "instance created");
        Ok(instance)
    }

    async fn describe_instance(&self, id: &str) -> Result<Instance> {
        self.get_json(&format!("/instances/{id}"), "describe instance")
            .await
    }

    async fn list_instances(&self, tag_name: &str) -> Result<Vec<Instance>> {
        let resp: InstanceListResponse = self
            .get_json(&format!("/instances?tag={tag_name}"), "list instances")
            .await?;
        Ok(resp.instances)
    }

    async fn start_instance(&self, id: &str) -> Result<()> {
        tracing::info!(instance_id = %id, "starting instance");
        self.post_action(&format!("/instances/{id}/start"), "start instance")
            .await
    }

    async fn stop_instance(&self, id: &str) -> Result<()> {
        tracing::info!(instance_id = %id, "stopping instance");
        self.post_action(&format!("/instances/{id}/stop"), "stop instance")
            .await
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        tracing::info!(instance_id = %id, "terminating instance");
        self.post_action(&format!("/instances/{id}/terminate"), "terminate instance")
            .await
    }

    async fn tag(&self, resource_id: &str, name: &str) -> Result<()> {
        let req = TagRequest { resource_id, name };
        let _: serde_json::Value = self.post_json("/tags", &req, "tag resource").await?;
        Ok(())
    }

    async fn create_volume(&self, size_gb: u32, zone: &str) -> Result<Volume> {
        tracing::info!(size_gb, zone = %zone, "creating volume");
        let req = CreateVolumeRequest { size_gb, zone };
        self.post_json("/volumes", &req, "create volume").await
    }

    async fn describe_volume(&self, id: &str) -> Result<Volume> {
        self.get_json(&format!("/volumes/{id}"), "describe volume")
            .await
    }

    async fn find_volumes(&self, tag_name: &str) -> Result<Vec<Volume>> {
        let resp: VolumeListResponse = self
            .get_json(&format!("/volumes?tag={tag_name}"), "find volumes")
            .await?;
        Ok(resp.volumes)
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<()> {
        tracing::info!(volume_id = %volume_id, instance_id = %instance_id, device = %device, "attaching volume");
        let req = AttachVolumeRequest {
            instance_id,
            device,
        };
        let _: serde_json::Value = self
            .post_json(&format!("/volumes/{volume_id}/attach"), &req, "attach volume")
            .await?;
        Ok(())
    }

    async fn create_image(&self, instance_id: &str, name: &str) -> Result<String> {
        tracing::info!(instance_id = %instance_id, name = %name, "creating image");
        let resp: CreateImageResponse = self
            .post_json(
                "/images",
                &CreateImageRequest { instance_id, name },
                "create image",
            )
            .await?;
        Ok(resp.image_id)
    }

    async fn describe_image(&self, id: &str) -> Result<Image> {
        self.get_json(&format!("/images/{id}"), "describe image")
            .await
    }

    async fn list_images(&self, name_prefix: &str) -> Result<Vec<Image>> {
        let resp: ImageListResponse = self
            .get_json(&format!("/images?prefix={name_prefix}"), "list images")
            .await?;
        Ok(resp.images)
    }
}
