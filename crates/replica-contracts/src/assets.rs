use indexmap::IndexMap;

/// Asset key (node id or requested asset name) to stored URL.
pub type AssetMap = IndexMap<String, String>;

/// Merges generated and extracted assets. When a key exists in both maps the
/// extracted (reference-cropped) URL wins.
pub fn merge_asset_maps(extracted: &AssetMap, generated: &AssetMap) -> AssetMap {
    let mut merged = AssetMap::with_capacity(extracted.len() + generated.len());
    for (key, url) in generated {
        merged.insert(key.clone(), url.clone());
    }
    for (key, url) in extracted {
        merged.insert(key.clone(), url.clone());
    }
    merged
}

/// `asset://<key>` placeholder the Builder asks code generation to emit.
pub fn asset_placeholder(key: &str) -> String {
    format!("asset://{key}")
}

#[cfg(test)]
mod tests {
    use super::{asset_placeholder, merge_asset_maps, AssetMap};

    fn map(rows: &[(&str, &str)]) -> AssetMap {
        rows.iter()
            .map(|(key, url)| (key.to_string(), url.to_string()))
            .collect()
    }

    #[test]
    fn extracted_value_wins_on_collision() {
        let extracted = map(&[("logo", "file:///crop/logo.png")]);
        let generated = map(&[
            ("logo", "file:///gen/logo.png"),
            ("hero_bg", "file:///gen/hero.png"),
        ]);
        let merged = merge_asset_maps(&extracted, &generated);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["logo"], "file:///crop/logo.png");
        assert_eq!(merged["hero_bg"], "file:///gen/hero.png");
    }

    #[test]
    fn merge_of_empty_maps_is_empty() {
        assert!(merge_asset_maps(&AssetMap::new(), &AssetMap::new()).is_empty());
        assert_eq!(asset_placeholder("logo"), "asset://logo");
    }
}
