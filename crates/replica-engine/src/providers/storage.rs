use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use replica_contracts::manifest::Bounds;

use super::extension_for_mime;
use crate::imaging::{crop_percent, encode_png};
use crate::services::{AssetStore, CropService, SourceImage};
use crate::util::sanitize_key;

/// Writes assets under a directory. URLs are `file://` paths unless a public
/// base URL is configured.
#[derive(Debug, Clone)]
pub struct LocalAssetStore {
    dir: PathBuf,
    base_url: Option<String>,
}

impl LocalAssetStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl AssetStore for LocalAssetStore {
    fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> Result<String> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let file_name = format!("{}.{}", sanitize_key(key), extension_for_mime(mime_type));
        let path = self.dir.join(&file_name);
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(match &self.base_url {
            Some(base) => format!("{base}/{file_name}"),
            None => {
                let absolute = path.canonicalize().unwrap_or(path);
                format!("file://{}", absolute.display())
            }
        })
    }
}

/// Keeps assets inside the output as `data:` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineAssetStore;

impl AssetStore for InlineAssetStore {
    fn put(&self, _key: &str, bytes: &[u8], mime_type: &str) -> Result<String> {
        Ok(format!("data:{mime_type};base64,{}", BASE64.encode(bytes)))
    }
}

/// Crops with the `image` crate and hands the PNG to an [`AssetStore`].
#[derive(Clone)]
pub struct LocalCropper {
    store: Arc<dyn AssetStore>,
}

impl LocalCropper {
    pub fn new(store: Arc<dyn AssetStore>) -> Self {
        Self { store }
    }
}

impl CropService for LocalCropper {
    fn crop(&self, source: &SourceImage, bounds: &Bounds, key: &str) -> Result<String> {
        let region = crop_percent(&source.image, bounds)
            .with_context(|| format!("crop of '{key}' failed"))?;
        let bytes = encode_png(&region)?;
        self.store.put(key, &bytes, "image/png")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use image::{DynamicImage, Rgb, RgbImage};
    use replica_contracts::manifest::Bounds;

    use super::{InlineAssetStore, LocalAssetStore, LocalCropper};
    use crate::imaging::measure_dimensions;
    use crate::services::{AssetStore, CropService, SourceImage};

    fn source() -> SourceImage {
        SourceImage {
            file_index: 0,
            mime_type: "image/png".to_string(),
            image: DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([9, 9, 9]))),
        }
    }

    #[test]
    fn local_store_writes_files_and_builds_urls() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = LocalAssetStore::new(temp.path().join("assets"), None);
        let url = store.put("hero image", b"png", "image/png")?;
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("hero_image.png"));
        assert_eq!(std::fs::read(temp.path().join("assets/hero_image.png"))?, b"png");

        let public = LocalAssetStore::new(temp.path(), Some("https://cdn.test/a/".to_string()));
        assert_eq!(public.put("logo", b"x", "image/jpeg")?, "https://cdn.test/a/logo.jpg");
        Ok(())
    }

    #[test]
    fn cropper_stores_the_requested_region() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = Arc::new(LocalAssetStore::new(temp.path(), None));
        let cropper = LocalCropper::new(store);
        cropper.crop(&source(), &Bounds::new(0.0, 0.0, 50.0, 50.0), "half")?;
        let bytes = std::fs::read(temp.path().join("half.png"))?;
        assert_eq!(measure_dimensions(&bytes), Some((100, 50)));
        assert!(cropper
            .crop(&source(), &Bounds::new(0.0, 0.0, 0.0, 0.0), "empty")
            .is_err());
        Ok(())
    }

    #[test]
    fn inline_store_returns_data_urls() -> anyhow::Result<()> {
        assert_eq!(InlineAssetStore.put("k", b"hi", "image/png")?, "data:image/png;base64,aGk=");
        Ok(())
    }
}
