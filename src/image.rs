//! Image (machine snapshot) management.
//!
//! Image names embed the creation timestamp, so lexicographic name order is
//! chronological order — listing sorted by name yields oldest first without
//! a separate numbering scheme.

use std::sync::Arc;

use chrono::Utc;

use crate::config::PollPolicy;
use crate::error::{Error, Result};
use crate::provider::{CloudProvider, Image, ImageState};
use crate::waiter::wait_for_transition;

pub struct ImageManager {
    provider: Arc<dyn CloudProvider>,
    policy: PollPolicy,
}

impl ImageManager {
    pub fn new(provider: Arc<dyn CloudProvider>, policy: PollPolicy) -> Self {
        Self { provider, policy }
    }

    /// Snapshot an instance into an image named `"{base_name} {timestamp}"`
    /// and block until it is usable. The caller is responsible for the
    /// instance being stopped.
    ///
    /// Freshly created images take a moment to become visible to describe
    /// calls; only that "not found yet" condition is retried, and only
    /// `visibility_attempts` times. Every other provider error propagates.
    pub async fn create(&self, instance_id: &str, base_name: &str) -> Result<String> {
        let name = format!("{} {}", base_name, Utc::now().format("%Y-%m-%d %H-%M-%S"));
        let image_id = self.provider.create_image(instance_id, &name).await?;
        tracing::info!(image_id = %image_id, name = %name, "image requested");

        let mut attempts: u32 = 0;
        let image = loop {
            match self.provider.describe_image(&image_id).await {
                Ok(image) => break image,
                Err(Error::NotFound(_)) => {
                    attempts += 1;
                    if attempts >= self.policy.visibility_attempts {
                        return Err(Error::NotFound(format!(
                            "image {image_id} still not visible after {attempts} attempts"
                        )));
                    }
                    tracing::debug!(image_id = %image_id, attempts, "image not visible yet");
                    tokio::time::sleep(self.policy.interval).await;
                }
                Err(e) => return Err(e),
            }
        };

        let provider = self.provider.clone();
        let refetch_id = image_id.clone();
        wait_for_transition(
            &self.policy,
            &image_id,
            image,
            &[ImageState::Pending],
            ImageState::Available,
            |i: &Image| i.state,
            move || {
                let provider = provider.clone();
                let id = refetch_id.clone();
                async move { provider.describe_image(&id).await }
            },
        )
        .await?;

        tracing::info!(image_id = %image_id, "image available");
        Ok(image_id)
    }

    /// All images whose name starts with `name_prefix`, oldest first.
    pub async fn list(&self, name_prefix: &str) -> Result<Vec<Image>> {
        let mut images = self.provider.list_images(name_prefix).await?;
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use crate::provider::InstanceSpec;

    async fn running_instance(provider: &FakeProvider) -> String {
        let inst = provider
            .create_instance(&InstanceSpec {
                image_id: "img-base".into(),
                instance_type: "m1.small".into(),
                key_name: "ops".into(),
                zone: "us-west-2a".into(),
                user_data: None,
            })
            .await
            .unwrap();
        inst.id
    }

    #[tokio::test(start_paused = true)]
    async fn create_rides_out_the_visibility_delay() {
        let provider = Arc::new(FakeProvider::new());
        let id = running_instance(&provider).await;
        provider.delay_next_image_visibility(2);
        let mgr = ImageManager::new(provider.clone(), PollPolicy::fast());

        let image_id = mgr.create(&id, "dev-cluster-leader").await.unwrap();
        let image = provider.describe_image(&image_id).await.unwrap();
        assert_eq!(image.state, ImageState::Available);
        // Two invisible describes plus the one that found it, plus ours.
        assert_eq!(provider.counts().describe_image, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn create_gives_up_when_visibility_attempts_run_out() {
        let provider = Arc::new(FakeProvider::new());
        let id = running_instance(&provider).await;
        // fast() allows 3 attempts; stay invisible longer than that.
        provider.delay_next_image_visibility(10);
        let mgr = ImageManager::new(provider.clone(), PollPolicy::fast());

        let err = mgr.create(&id, "dev-cluster-leader").await.unwrap_err();
        match err {
            Error::NotFound(msg) => assert!(msg.contains("still not visible")),
            other => panic!("expected NotFound, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_names_images_with_prefix_and_timestamp() {
        let provider = Arc::new(FakeProvider::new());
        let id = running_instance(&provider).await;
        let mgr = ImageManager::new(provider.clone(), PollPolicy::fast());

        let image_id = mgr.create(&id, "dev-cluster-leader").await.unwrap();
        let image = provider.describe_image(&image_id).await.unwrap();
        assert!(image.name.starts_with("dev-cluster-leader "));
        assert_eq!(image.state, ImageState::Available);
        assert_eq!(provider.counts().create_image, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_fails_for_unknown_instance_without_retrying() {
        let provider = Arc::new(FakeProvider::new());
        let mgr = ImageManager::new(provider.clone(), PollPolicy::fast());

        let err = mgr.create("i-nope", "dev-x").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(provider.counts().describe_image, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn list_sorts_by_name_hence_by_age() {
        let provider = Arc::new(FakeProvider::new());
        let id = running_instance(&provider).await;
        // Create directly against the provider with explicit names so the
        // ordering is under test control.
        provider
            .create_image(&id, "dev-worker 2024-05-02 10-00-00")
            .await
            .unwrap();
        provider
            .create_image(&id, "dev-worker 2024-05-01 09-00-00")
            .await
            .unwrap();

        let mgr = ImageManager::new(provider.clone(), PollPolicy::fast());
        let images = mgr.list("dev-worker").await.unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0].name < images[1].name);
        assert!(images[0].name.contains("2024-05-01"));
    }
}
