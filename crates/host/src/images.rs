//! Image availability: lookup, pulling with progress events, readiness checks.

use std::sync::Arc;

use {
    futures::StreamExt,
    tokio::sync::broadcast,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use sandrun_metrics::{counter, images as image_metrics};

use crate::{ContainerHost, HostError, ImageInfo, PullProgress, Result};

/// Events emitted while pulling an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullEvent {
    Started { image: String },
    Progress { image: String, progress: PullProgress },
    Finished { image: String },
    Failed { image: String, error: String },
}

/// Outcome of [`ImagePuller::ensure_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostReadiness {
    /// The host is reachable and the image is available locally.
    Ready,
    /// The host is reachable but the image is missing and pulling was not allowed.
    MissingImage,
}

/// Checks for and pulls sandbox images on a [`ContainerHost`].
pub struct ImagePuller {
    host: Arc<dyn ContainerHost>,
    event_tx: broadcast::Sender<PullEvent>,
}

impl ImagePuller {
    pub fn new(host: Arc<dyn ContainerHost>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self { host, event_tx }
    }

    /// Subscribe to pull events (start, progress, finish, failure).
    pub fn subscribe(&self) -> broadcast::Receiver<PullEvent> {
        self.event_tx.subscribe()
    }

    /// Silently drops the event when nobody is subscribed.
    fn emit(&self, event: PullEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Find a local image carrying the exact `image:tag` reference.
    pub async fn find_image(&self, image: &str, tag: &str) -> Result<Option<ImageInfo>> {
        let reference = format!("{image}:{tag}");
        let images = self.host.list_images().await?;
        Ok(images.into_iter().find(|img| img.has_tag(&reference)))
    }

    /// Pull `image:tag`, forwarding every progress record as a [`PullEvent`].
    pub async fn pull(&self, image: &str, tag: &str) -> Result<()> {
        let reference = format!("{image}:{tag}");
        info!(image = %reference, "pulling sandbox image");
        self.emit(PullEvent::Started {
            image: reference.clone(),
        });

        let result = self.follow_pull(image, tag, &reference).await;

        #[cfg(feature = "metrics")]
        counter!(image_metrics::PULLS_TOTAL, "success" => result.is_ok().to_string())
            .increment(1);

        match &result {
            Ok(()) => {
                info!(image = %reference, "image pulled");
                self.emit(PullEvent::Finished { image: reference });
            },
            Err(e) => {
                warn!(image = %reference, error = %e, "image pull failed");
                self.emit(PullEvent::Failed {
                    image: reference,
                    error: e.to_string(),
                });
            },
        }
        result
    }

    async fn follow_pull(&self, image: &str, tag: &str, reference: &str) -> Result<()> {
        let mut progress = self.host.pull(image, tag).await?;
        while let Some(item) = progress.next().await {
            let item = item?;
            debug!(image = reference, status = %item.status, "pull progress");
            self.emit(PullEvent::Progress {
                image: reference.to_string(),
                progress: item,
            });
        }
        Ok(())
    }

    /// Ping the host, then make sure `image:tag` is present, pulling it when
    /// `auto_pull` is set.
    pub async fn ensure_image(&self, image: &str, tag: &str, auto_pull: bool) -> Result<HostReadiness> {
        self.host.ping().await.map_err(|e| match e {
            HostError::Unavailable(_) => e,
            other => HostError::Unavailable(other.to_string()),
        })?;

        if self.find_image(image, tag).await?.is_some() {
            debug!(image, tag, "image already present");
            return Ok(HostReadiness::Ready);
        }
        if !auto_pull {
            return Ok(HostReadiness::MissingImage);
        }
        self.pull(image, tag).await?;
        Ok(HostReadiness::Ready)
    }
}
