use crate::{
    error::{CaptureError, Result},
    frame::{encode_jpeg, read_image_file},
};
use anyhow::Context;
use async_trait::async_trait;
use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{debug, info};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Which source to open, `Default` mirrors "first available camera".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SourceSelector {
    #[default]
    Default,
    Named(String),
}

impl fmt::Display for SourceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSelector::Default => f.write_str("default"),
            SourceSelector::Named(name) => f.write_str(name),
        }
    }
}

/// A live frame source owned by exactly one capture session.
#[async_trait]
pub trait FrameSource: Send {
    /// Grabs the current frame as JPEG bytes. An error here means the source is gone.
    async fn grab(&mut self) -> anyhow::Result<Vec<u8>>;

    /// Releases the underlying handle. Must be safe to call more than once.
    fn release(&mut self);
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn acquire(&self, selector: &SourceSelector) -> Result<Box<dyn FrameSource>>;
}

/// Serves still images from a directory in name order, looping forever.
///
/// `SourceSelector::Default` opens the root directory, `Named(name)` opens the
/// sub directory `name`. A directory can only be held by one source at a time.
#[derive(Clone)]
pub struct DirectorySourceProvider {
    root: PathBuf,
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DirectorySourceProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn resolve(&self, selector: &SourceSelector) -> PathBuf {
        match selector {
            SourceSelector::Default => self.root.clone(),
            SourceSelector::Named(name) => self.root.join(name),
        }
    }
}

#[async_trait]
impl SourceProvider for DirectorySourceProvider {
    async fn acquire(&self, selector: &SourceSelector) -> Result<Box<dyn FrameSource>> {
        let dir = self.resolve(selector);
        let frames = list_frames(&dir)
            .await
            .map_err(|e| CaptureError::SourceUnavailable(format!("{selector}: {e:#}")))?;
        if frames.is_empty() {
            return Err(CaptureError::SourceUnavailable(format!(
                "{selector}: no images in {}",
                dir.display()
            )));
        }

        {
            let mut held = self.held.lock().map_err(|_| {
                CaptureError::SourceUnavailable("source registry poisoned".to_string())
            })?;
            if !held.insert(dir.clone()) {
                return Err(CaptureError::SourceUnavailable(format!(
                    "{selector}: already in use"
                )));
            }
        }

        info!(
            "Opened frame source {} with {} images",
            dir.display(),
            frames.len()
        );
        Ok(Box::new(DirectorySource {
            dir,
            frames,
            next: 0,
            held: Some(self.held.clone()),
        }))
    }
}

pub struct DirectorySource {
    dir: PathBuf,
    frames: Vec<PathBuf>,
    next: usize,
    held: Option<Arc<Mutex<HashSet<PathBuf>>>>,
}

#[async_trait]
impl FrameSource for DirectorySource {
    async fn grab(&mut self) -> anyhow::Result<Vec<u8>> {
        if self.held.is_none() {
            anyhow::bail!("source {} was released", self.dir.display());
        }
        let path = self.frames[self.next % self.frames.len()].clone();
        self.next = self.next.wrapping_add(1);
        let data = read_image_file(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        // Decoding a large png takes a while, keep it off the async workers.
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&data)).await??;
        debug!("Grabbed frame {:?}, {} bytes", path, jpeg.len());
        Ok(jpeg)
    }

    fn release(&mut self) {
        if let Some(held) = self.held.take() {
            if let Ok(mut held) = held.lock() {
                held.remove(&self.dir);
            }
            debug!("Released frame source {}", self.dir.display());
        }
    }
}

impl Drop for DirectorySource {
    fn drop(&mut self) {
        self.release();
    }
}

async fn list_frames(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("opening {}", dir.display()))?;
    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && entry.file_type().await?.is_file() {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};

    fn write_png(path: &Path, shade: u8) {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, image::Rgb([shade; 3])));
        img.save_with_format(path, ImageFormat::Png).unwrap();
    }

    #[tokio::test]
    async fn cycles_frames_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("b.png"), 200);
        write_png(&dir.path().join("a.png"), 10);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let provider = DirectorySourceProvider::new(dir.path());
        let mut source = provider.acquire(&SourceSelector::Default).await.unwrap();

        let mut shades = Vec::new();
        for _ in 0..3 {
            let jpeg = source.grab().await.unwrap();
            assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
            let pixel = image::load_from_memory(&jpeg).unwrap().to_rgb8()[(0, 0)];
            shades.push(pixel[0] > 100);
        }
        assert_eq!(shades, vec![false, true, false]);
    }

    #[tokio::test]
    async fn empty_or_missing_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DirectorySourceProvider::new(dir.path());
        assert!(matches!(
            provider.acquire(&SourceSelector::Default).await,
            Err(CaptureError::SourceUnavailable(_))
        ));
        assert!(matches!(
            provider
                .acquire(&SourceSelector::Named("cam-9".into()))
                .await,
            Err(CaptureError::SourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn source_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 10);
        let provider = DirectorySourceProvider::new(dir.path());

        let mut first = provider.acquire(&SourceSelector::Default).await.unwrap();
        assert!(matches!(
            provider.acquire(&SourceSelector::Default).await,
            Err(CaptureError::SourceUnavailable(_))
        ));

        first.release();
        first.release();
        assert!(first.grab().await.is_err());
        let _second = provider.acquire(&SourceSelector::Default).await.unwrap();
    }
}
