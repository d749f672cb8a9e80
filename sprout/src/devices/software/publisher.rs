use crate::error::{Error, Result};
use crate::utils::image::DerivedImage;
use async_trait::async_trait;
use std::{
    ffi::OsStr,
    fs::create_dir_all,
    path::PathBuf,
};
use tokio::sync::mpsc::Sender;
use tracing::info;

/// Hands finished images to storage or telemetry.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one image. An error means the image was not taken over.
    async fn publish(&self, image: &DerivedImage) -> Result<()>;
}

/// Writes every image to a directory on disk.
pub struct DirectoryPublisher {
    /// Parent save directory for the images.
    path: PathBuf,
}

impl DirectoryPublisher {
    /// Create a publisher writing below `path`. The directory is created
    /// on first publish.
    pub fn new<F: AsRef<OsStr>>(path: F) -> Self {
        Self {
            path: (&path).into(),
        }
    }

    /// Directory images are written to.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl Publisher for DirectoryPublisher {
    async fn publish(&self, image: &DerivedImage) -> Result<()> {
        let filename = self.path.join(image.filename());
        let data = image.data.clone();
        let target = filename.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = target.parent() {
                create_dir_all(parent)?;
            }
            std::fs::write(&target, data)?;
            Ok(())
        })
        .await??;
        info!(file = ?filename, bytes = image.data.len(), "Image written");
        Ok(())
    }
}

/// Forwards images to an in-process consumer over a channel.
pub struct ChannelPublisher {
    sender: Sender<DerivedImage>,
}

impl ChannelPublisher {
    /// Create a publisher feeding `sender`.
    pub fn new(sender: Sender<DerivedImage>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, image: &DerivedImage) -> Result<()> {
        self.sender.send(image.clone()).await.map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "Image consumer has gone away",
            ))
        })
    }
}
