use std::sync::Arc;

use serde::Serialize;

use crate::catalog::Product;
use crate::storage::KeyValueStore;

/// Storage key for the persisted selection, a JSON array of product ids.
pub const SELECTION_KEY: &str = "selectedProducts";

/// Selected product ids in insertion order. Every mutation writes the whole
/// set back to storage before returning.
pub struct SelectionSet {
    ids: Vec<String>,
    store: Arc<dyn KeyValueStore>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResolvedSelection {
    pub products: Vec<Product>,
    /// Ids that no longer exist in the catalog.
    pub dropped: usize,
}

impl SelectionSet {
    /// Never fails: missing, unreadable or corrupt state yields an empty set.
    pub async fn restore(store: Arc<dyn KeyValueStore>) -> Self {
        let ids = match store.get(SELECTION_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(saved) => dedup(saved),
                Err(e) => {
                    tracing::warn!(error = %e, "discarding unparseable saved selection");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read saved selection");
                Vec::new()
            }
        };
        Self { ids, store }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|i| i == id)
    }

    pub fn ids(&self) -> &[String] { &self.ids }

    pub fn len(&self) -> usize { self.ids.len() }

    /// Returns whether `id` is selected afterwards. If the write fails the
    /// set is left as it was.
    pub async fn toggle(&mut self, id: &str) -> anyhow::Result<bool> {
        let removed_at = self.ids.iter().position(|i| i == id);
        match removed_at {
            Some(pos) => {
                self.ids.remove(pos);
            }
            None => self.ids.push(id.to_string()),
        }
        let selected = removed_at.is_none();

        if let Err(e) = self.persist().await {
            match removed_at {
                Some(pos) => self.ids.insert(pos, id.to_string()),
                None => {
                    self.ids.pop();
                }
            }
            return Err(e);
        }
        tracing::debug!(product_id = id, selected, "toggled product");
        Ok(selected)
    }

    pub async fn remove(&mut self, id: &str) -> anyhow::Result<()> {
        let Some(pos) = self.ids.iter().position(|i| i == id) else {
            return self.persist().await;
        };
        self.ids.remove(pos);
        if let Err(e) = self.persist().await {
            self.ids.insert(pos, id.to_string());
            return Err(e);
        }
        Ok(())
    }

    pub async fn clear(&mut self) -> anyhow::Result<()> {
        self.store.delete(SELECTION_KEY).await?;
        self.ids.clear();
        Ok(())
    }

    pub fn list(&self, catalog: &[Product]) -> ResolvedSelection {
        let mut products = Vec::with_capacity(self.ids.len());
        let mut dropped = 0;
        for id in &self.ids {
            match catalog.iter().find(|p| &p.id == id) {
                Some(p) => products.push(p.clone()),
                None => dropped += 1,
            }
        }
        ResolvedSelection { products, dropped }
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let raw = serde_json::to_string(&self.ids)?;
        self.store.set(SELECTION_KEY, &raw).await
    }
}

fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::product;
    use crate::storage::{MemoryKeyValueStore, SqliteKeyValueStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    async fn saved(store: &Arc<dyn KeyValueStore>) -> Vec<String> {
        let raw = store.get(SELECTION_KEY).await.unwrap().unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn toggle_twice_restores_membership_and_persists() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::default());
        let mut sel = SelectionSet::restore(store.clone()).await;
        assert_eq!(sel.len(), 0);

        assert!(sel.toggle("1").await.unwrap());
        assert_eq!(saved(&store).await, vec!["1"]);
        assert!(!sel.toggle("1").await.unwrap());
        assert!(!sel.contains("1"));
        assert!(saved(&store).await.is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::default());
        let mut sel = SelectionSet::restore(store.clone()).await;
        sel.toggle("a").await.unwrap();
        sel.toggle("b").await.unwrap();
        sel.remove("a").await.unwrap();
        sel.remove("a").await.unwrap();
        sel.remove("never-there").await.unwrap();
        assert_eq!(sel.ids(), ["b".to_string()]);
        assert_eq!(saved(&store).await, vec!["b"]);
    }

    #[tokio::test]
    async fn restore_round_trips_through_sqlite() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("sel.db").to_string_lossy());
        {
            let store: Arc<dyn KeyValueStore> =
                Arc::new(SqliteKeyValueStore::initialize(Some(url.clone())).await.unwrap());
            let mut sel = SelectionSet::restore(store).await;
            sel.toggle("3").await.unwrap();
            sel.toggle("1").await.unwrap();
            sel.toggle("2").await.unwrap();
            sel.remove("1").await.unwrap();
        }
        let store: Arc<dyn KeyValueStore> =
            Arc::new(SqliteKeyValueStore::initialize(Some(url)).await.unwrap());
        let sel = SelectionSet::restore(store).await;
        assert_eq!(sel.ids(), ["3".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn restore_tolerates_garbage_and_duplicates() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::default());
        store.set(SELECTION_KEY, "{not json").await.unwrap();
        assert_eq!(SelectionSet::restore(store.clone()).await.len(), 0);

        store.set(SELECTION_KEY, r#"["2","1","2"]"#).await.unwrap();
        let sel = SelectionSet::restore(store).await;
        assert_eq!(sel.ids(), ["2".to_string(), "1".to_string()]);
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("disk gone")
        }

        async fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("disk gone")
        }

        async fn delete(&self, _key: &str) -> anyhow::Result<bool> {
            anyhow::bail!("disk gone")
        }
    }

    #[tokio::test]
    async fn restore_never_fails_but_writes_report_errors() {
        let mut sel = SelectionSet::restore(Arc::new(BrokenStore)).await;
        assert_eq!(sel.len(), 0);
        assert!(sel.toggle("1").await.is_err());
        assert!(!sel.contains("1"));
    }

    /// Reads and deletes go through; writes fail while `fail_writes` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryKeyValueStore,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<bool> {
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn failed_writes_leave_the_set_unchanged() {
        let store = Arc::new(FlakyStore::default());
        let mut sel = SelectionSet::restore(store.clone()).await;
        for id in ["a", "b", "c"] {
            sel.toggle(id).await.unwrap();
        }
        store.fail_writes.store(true, Ordering::SeqCst);

        assert!(sel.toggle("d").await.is_err());
        assert!(!sel.contains("d"));
        assert!(sel.toggle("b").await.is_err());
        assert!(sel.contains("b"));
        assert!(sel.remove("a").await.is_err());
        assert!(sel.clear().await.is_err());
        assert_eq!(sel.ids(), ["a".to_string(), "b".to_string(), "c".to_string()]);

        let dyn_store: Arc<dyn KeyValueStore> = store.clone();
        assert_eq!(saved(&dyn_store).await, vec!["a", "b", "c"]);

        store.fail_writes.store(false, Ordering::SeqCst);
        assert!(!sel.toggle("b").await.unwrap());
        assert_eq!(saved(&dyn_store).await, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn list_resolves_in_insertion_order_and_counts_dropped() {
        let catalog = vec![
            product("1", "Cleanser", "cleanser", "a"),
            product("2", "Serum", "serum", "b"),
        ];
        let mut sel = SelectionSet::restore(Arc::new(MemoryKeyValueStore::default())).await;
        sel.toggle("2").await.unwrap();
        sel.toggle("gone").await.unwrap();
        sel.toggle("1").await.unwrap();

        let resolved = sel.list(&catalog);
        let names: Vec<_> = resolved.products.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Serum", "Cleanser"]);
        assert_eq!(resolved.dropped, 1);
    }
}
