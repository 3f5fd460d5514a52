use std::sync::Arc;

use {
    anyhow::{Result, bail},
    clap::Subcommand,
    sandrun_host::{
        ContainerHost,
        docker::DockerCliHost,
        images::{HostReadiness, ImagePuller, PullEvent},
    },
    tokio::{
        sync::broadcast::{self, error::RecvError},
        task::JoinHandle,
    },
};

#[derive(Subcommand)]
pub enum ImageAction {
    /// List images available locally.
    List,
    /// Pull the configured sandbox image, or the one given.
    Pull {
        /// Image name (defaults to `runner.image`).
        #[arg(long)]
        image: Option<String>,
        /// Image tag (defaults to `runner.tag`).
        #[arg(long)]
        tag: Option<String>,
    },
    /// Check whether the configured sandbox image is present.
    Check,
}

pub async fn handle_images(action: ImageAction) -> Result<()> {
    let config = sandrun_config::discover_and_load();
    let host: Arc<dyn ContainerHost> = Arc::new(DockerCliHost::from(&config.docker));
    match action {
        ImageAction::List => list(host.as_ref()).await,
        ImageAction::Pull { image, tag } => {
            let image = image.unwrap_or(config.runner.image);
            let tag = tag.unwrap_or(config.runner.tag);
            pull(host, &image, &tag).await
        },
        ImageAction::Check => check(host, &config.runner.image, &config.runner.tag).await,
    }
}

async fn list(host: &dyn ContainerHost) -> Result<()> {
    let images = host.list_images().await?;
    if images.is_empty() {
        println!("No images found.");
        return Ok(());
    }
    println!("{:<45} {:>10}  ID", "TAG", "SIZE");
    for img in &images {
        for tag in &img.repo_tags {
            println!("{:<45} {:>10}  {}", tag, img.size, img.id);
        }
    }
    Ok(())
}

/// Print pull events to stderr until the puller is dropped.
pub fn report_pull_progress(puller: &ImagePuller) -> JoinHandle<()> {
    let mut events = puller.subscribe();
    tokio::spawn(async move {
        while let Some(event) = next_pull_event(&mut events).await {
            match event {
                PullEvent::Started { image } => eprintln!("Pulling {image}..."),
                PullEvent::Progress { progress, .. } => match (progress.id, progress.progress) {
                    (Some(id), Some(bar)) => eprintln!("  {id}: {} {bar}", progress.status),
                    (Some(id), None) => eprintln!("  {id}: {}", progress.status),
                    _ => eprintln!("  {}", progress.status),
                },
                PullEvent::Finished { image } => eprintln!("Pulled {image}"),
                PullEvent::Failed { image, error } => eprintln!("Failed to pull {image}: {error}"),
            }
        }
    })
}

/// Next pull event, skipping over any the reporter fell behind on.
async fn next_pull_event(events: &mut broadcast::Receiver<PullEvent>) -> Option<PullEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn pull(host: Arc<dyn ContainerHost>, image: &str, tag: &str) -> Result<()> {
    let puller = ImagePuller::new(host);
    let reporter = report_pull_progress(&puller);
    let result = puller.pull(image, tag).await;
    drop(puller);
    let _ = reporter.await;
    Ok(result?)
}

async fn check(host: Arc<dyn ContainerHost>, image: &str, tag: &str) -> Result<()> {
    let puller = ImagePuller::new(host);
    match puller.ensure_image(image, tag, false).await? {
        HostReadiness::Ready => {
            println!("{image}:{tag} is available");
            Ok(())
        },
        HostReadiness::MissingImage => bail!("{image}:{tag} is not available locally"),
    }
}
