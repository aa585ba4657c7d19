//! Category reference data: loading the list and seeding it into the store.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use pwatch_core::{default_categories, Category, CategoryDef, DEFAULT_SCRAPE_INTERVAL_HOURS};
use pwatch_storage::{Store, StoreResult};
use serde::Deserialize;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRegistry {
    pub categories: Vec<CategoryDef>,
}

impl CategoryRegistry {
    pub fn builtin() -> Self {
        Self {
            categories: default_categories(),
        }
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Registry file when configured, built-in list otherwise.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path).await,
            None => Ok(Self::builtin()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedResult {
    pub upserted: usize,
    pub linked_to_parent: usize,
}

/// Upserts every category by slug, then points each at its slug parent.
pub async fn seed_categories(store: &dyn Store, registry: &CategoryRegistry) -> Result<SeedResult> {
    let mut by_slug: HashMap<String, Uuid> = HashMap::new();
    for def in &registry.categories {
        let category = store
            .upsert_category(def, DEFAULT_SCRAPE_INTERVAL_HOURS)
            .await
            .with_context(|| format!("upserting category {}", def.slug))?;
        by_slug.insert(category.slug.clone(), category.id);
    }

    let mut linked_to_parent = 0;
    for def in &registry.categories {
        let Some(&id) = by_slug.get(&def.slug) else {
            continue;
        };
        let parent_id = match def.parent_slug() {
            Some(parent) => match by_slug.get(&parent) {
                Some(&parent_id) => Some(parent_id),
                None => {
                    warn!(slug = %def.slug, parent = %parent, "parent category missing from registry");
                    None
                }
            },
            None => None,
        };
        if parent_id.is_some() {
            linked_to_parent += 1;
        }
        store
            .set_category_parent(id, parent_id)
            .await
            .with_context(|| format!("linking parent of {}", def.slug))?;
    }

    info!(upserted = by_slug.len(), linked_to_parent, "categories seeded");
    Ok(SeedResult {
        upserted: by_slug.len(),
        linked_to_parent,
    })
}

/// Finds a category by UUID first, falling back to slug.
pub async fn resolve_category(store: &dyn Store, id_or_slug: &str) -> StoreResult<Option<Category>> {
    if let Ok(id) = Uuid::parse_str(id_or_slug) {
        if let Some(category) = store.find_category_by_id(id).await? {
            return Ok(Some(category));
        }
    }
    store.find_category_by_slug(id_or_slug).await
}

#[cfg(test)]
mod tests {
    use pwatch_storage::MemoryStore;

    use super::*;

    #[test]
    fn yaml_registry_parses() {
        let registry = CategoryRegistry::from_yaml(
            r#"
categories:
  - slug: lauamangud
    name_et: Lauamängud
    name_en: Board Games
  - slug: lauamangud/perekond
    name_et: Peremängud
    name_en: Family Games
"#,
        )
        .unwrap();
        assert_eq!(registry.categories.len(), 2);
        assert_eq!(registry.categories[1].parent_slug().as_deref(), Some("lauamangud"));
    }

    #[tokio::test]
    async fn seeding_wires_parents_and_is_repeatable() {
        let store = MemoryStore::new();
        let registry = CategoryRegistry::builtin();

        let first = seed_categories(&store, &registry).await.unwrap();
        let second = seed_categories(&store, &registry).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.linked_to_parent, 1);

        let state = store.snapshot().await;
        assert_eq!(state.categories.len(), registry.categories.len());
        let parent = state
            .categories
            .iter()
            .find(|c| c.slug == "kodu-ja-kollektsioon")
            .unwrap();
        let child = state
            .categories
            .iter()
            .find(|c| c.slug == "kodu-ja-kollektsioon/figuurid-ja-manguasjad")
            .unwrap();
        assert_eq!(child.parent_id, Some(parent.id));
    }

    #[tokio::test]
    async fn resolves_by_id_or_slug() {
        let store = MemoryStore::new();
        seed_categories(&store, &CategoryRegistry::builtin()).await.unwrap();

        let by_slug = resolve_category(&store, "lauamangud").await.unwrap().unwrap();
        let by_id = resolve_category(&store, &by_slug.id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_slug, by_id);
        assert!(resolve_category(&store, "missing").await.unwrap().is_none());
    }
}
