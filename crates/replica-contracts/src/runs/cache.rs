use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::manifest::VisualManifest;

/// On-disk cache of survey results keyed by image/model fingerprint.
///
/// Every read refreshes from disk and every write merges only the dirty keys
/// into the current file, so two processes sharing a cache do not clobber
/// each other's entries.
#[derive(Debug, Clone)]
pub struct ManifestCache {
    path: PathBuf,
    payload: Map<String, Value>,
    dirty_keys: Vec<String>,
}

impl ManifestCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: Map::new(),
            dirty_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self, key: &str) -> Option<VisualManifest> {
        self.refresh();
        let value = self.payload.get(key)?.clone();
        serde_json::from_value(value).ok()
    }

    pub fn set(&mut self, key: &str, manifest: &VisualManifest) -> anyhow::Result<()> {
        self.refresh();
        let snapshot = serde_json::to_value(manifest)?;
        if self.payload.get(key) == Some(&snapshot) {
            return Ok(());
        }
        self.payload.insert(key.to_string(), snapshot);
        if !self.dirty_keys.iter().any(|existing| existing == key) {
            self.dirty_keys.push(key.to_string());
        }
        self.flush()
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.dirty_keys.is_empty() {
            return Ok(());
        }
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        for key in &self.dirty_keys {
            if let Some(value) = self.payload.get(key) {
                on_disk.insert(key.clone(), value.clone());
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = on_disk;
        self.dirty_keys.clear();
        Ok(())
    }

    fn refresh(&mut self) {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        for key in &self.dirty_keys {
            if let Some(value) = self.payload.get(key) {
                on_disk.insert(key.clone(), value.clone());
            }
        }
        self.payload = on_disk;
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ManifestCache;
    use crate::manifest::{Canvas, ImageRef, UiNode, VisualManifest};

    fn manifest(width: u32) -> VisualManifest {
        let mut manifest = VisualManifest::empty(
            0,
            ImageRef {
                file_uri: "ref://0".to_string(),
                mime_type: "image/png".to_string(),
            },
            Canvas::measured(width, 100),
        );
        manifest.global_theme.dom_tree = Some(UiNode::new("div").with_id("root"));
        manifest
    }

    #[test]
    fn cache_roundtrips_manifest() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut cache = ManifestCache::new(temp.path().join("surveys.json"));
        cache.set("abc", &manifest(320))?;
        assert_eq!(cache.get("abc"), Some(manifest(320)));
        assert_eq!(cache.get("missing"), None);
        Ok(())
    }

    #[test]
    fn cache_merges_with_concurrent_writer() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("surveys.json");
        let mut cache_a = ManifestCache::new(&path);
        let mut cache_b = ManifestCache::new(&path);

        cache_a.set("a", &manifest(1))?;
        cache_b.set("b", &manifest(2))?;
        cache_a.set("c", &manifest(3))?;

        let mut reloaded = ManifestCache::new(path);
        assert_eq!(reloaded.get("a"), Some(manifest(1)));
        assert_eq!(reloaded.get("b"), Some(manifest(2)));
        assert_eq!(reloaded.get("c"), Some(manifest(3)));
        Ok(())
    }

    #[test]
    fn cache_sees_other_writers_updates() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("surveys.json");
        let mut cache_a = ManifestCache::new(&path);
        let mut cache_b = ManifestCache::new(&path);

        cache_a.set("key", &manifest(1))?;
        assert_eq!(cache_b.get("key"), Some(manifest(1)));
        cache_b.set("key", &manifest(2))?;
        assert_eq!(cache_a.get("key"), Some(manifest(2)));
        Ok(())
    }
}
