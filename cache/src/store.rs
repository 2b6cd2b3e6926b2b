use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use kube::core::DynamicObject;

use crate::keys;
use crate::{Error, Result};

pub type IndexFunc = Arc<dyn Fn(&DynamicObject) -> Vec<String> + Send + Sync>;

/// Thread-safe keyed store of the objects an informer has observed, with
/// optional named secondary indices.
///
/// Reads never block on the network; `replace` swaps the whole key set
/// atomically and is used only by the list and recovery paths.
#[derive(Default)]
pub struct Store {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<String, Arc<DynamicObject>>,
    indexers: HashMap<String, IndexFunc>,
    // index name -> index value -> keys
    indices: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

impl Inner {
    fn index(&mut self, key: &str, obj: &DynamicObject) {
        for (name, index_fn) in &self.indexers {
            let index = self.indices.entry(name.clone()).or_default();
            for value in index_fn(obj) {
                index.entry(value).or_default().insert(key.to_string());
            }
        }
    }

    fn unindex(&mut self, key: &str, obj: &DynamicObject) {
        for (name, index_fn) in &self.indexers {
            let Some(index) = self.indices.get_mut(name) else {
                continue;
            };
            for value in index_fn(obj) {
                if let Some(set) = index.get_mut(&value) {
                    set.remove(key);
                    if set.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }

    fn upsert(&mut self, obj: DynamicObject) {
        let key = keys::key_for(&obj);
        if let Some(old) = self.objects.get(&key).cloned() {
            self.unindex(&key, &old);
        }
        self.index(&key, &obj);
        self.objects.insert(key, Arc::new(obj));
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named index. Existing objects are indexed immediately.
    pub fn add_indexer(&self, name: impl ToString, index_fn: IndexFunc) -> Result<()> {
        let name = name.to_string();
        let mut inner = self.inner.write().unwrap();
        if inner.indexers.contains_key(&name) {
            return Err(Error::IndexerExists(name));
        }
        let index = inner
            .objects
            .iter()
            .fold(HashMap::<String, BTreeSet<String>>::new(), |mut index, (key, obj)| {
                for value in index_fn(obj) {
                    index.entry(value).or_default().insert(key.clone());
                }
                index
            });
        inner.indices.insert(name.clone(), index);
        inner.indexers.insert(name, index_fn);
        Ok(())
    }

    pub fn add(&self, obj: DynamicObject) {
        self.inner.write().unwrap().upsert(obj);
    }

    pub fn update(&self, obj: DynamicObject) {
        self.inner.write().unwrap().upsert(obj);
    }

    pub fn delete(&self, obj: &DynamicObject) {
        self.delete_key(&keys::key_for(obj));
    }

    pub fn delete_key(&self, key: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(old) = inner.objects.remove(key) {
            inner.unindex(key, &old);
        }
    }

    /// Atomically replaces the whole store content with `objs`.
    pub fn replace(&self, objs: Vec<DynamicObject>) {
        let mut inner = self.inner.write().unwrap();
        inner.objects.clear();
        inner.indices.clear();
        for obj in objs {
            inner.upsert(obj);
        }
    }

    pub fn get(&self, obj: &DynamicObject) -> Option<Arc<DynamicObject>> {
        self.get_by_key(&keys::key_for(obj))
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<DynamicObject>> {
        self.inner.read().unwrap().objects.get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<DynamicObject>> {
        self.inner.read().unwrap().objects.values().cloned().collect()
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.inner.read().unwrap().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().objects.is_empty()
    }

    /// Returns the objects whose index `name` contains `value`.
    pub fn by_index(&self, name: &str, value: &str) -> Vec<Arc<DynamicObject>> {
        let inner = self.inner.read().unwrap();
        let Some(keys) = inner.indices.get(name).and_then(|index| index.get(value)) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|key| inner.objects.get(key).cloned())
            .collect()
    }

    /// Returns the keys stored under index `name` for `value`.
    pub fn index_keys(&self, name: &str, value: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .indices
            .get(name)
            .and_then(|index| index.get(value))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}
