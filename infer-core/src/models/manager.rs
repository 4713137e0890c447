//! Process-global, reference-counted model cache.
//!
//! Loading yields an `Arc<Model>`; repeated loads of the same uri and
//! function share one handle. Unloading drops the cache entry, leaving
//! existing handles valid until their last clone goes away.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;

/// Default preferred batch size when the model metadata does not say
/// otherwise.
const DEFAULT_BATCH_SIZE: usize = 4;

/// Handle to one loaded model function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    path: String,
    function_name: String,
    batch_size: usize,
}

impl Model {
    pub fn new(path: impl Into<String>, function_name: impl Into<String>, batch_size: usize) -> Self {
        Self {
            path: path.into(),
            function_name: function_name.into(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// The batch size this model prefers on the device.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Errors raised by the model subsystem.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model not found: {0}")]
    NotFound(String),
}

/// Process-global directory of loaded models.
pub struct ModelManager {
    cache: Mutex<HashMap<String, Arc<Model>>>,
    model_dir: Mutex<PathBuf>,
}

static MANAGER: OnceLock<ModelManager> = OnceLock::new();

impl ModelManager {
    pub fn instance() -> &'static ModelManager {
        MANAGER.get_or_init(|| ModelManager {
            cache: Mutex::new(HashMap::new()),
            model_dir: Mutex::new(PathBuf::from(".")),
        })
    }

    /// Set the directory relative model uris resolve against. Returns
    /// `false` when the directory does not exist.
    pub fn set_model_dir(&self, dir: impl AsRef<Path>) -> bool {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            tracing::warn!(dir = %dir.display(), "model directory does not exist");
            return false;
        }
        *self.model_dir.lock().unwrap() = dir.to_path_buf();
        true
    }

    /// Load a model function from a file uri, reusing the cached handle
    /// when present.
    pub fn load(&self, uri: &str, function_name: &str) -> Result<Arc<Model>, ModelError> {
        let key = format!("{uri}_{function_name}");
        if let Some(model) = self.cache.lock().unwrap().get(&key) {
            tracing::debug!(uri, function_name, "model cache hit");
            return Ok(Arc::clone(model));
        }

        let path = Path::new(uri);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.model_dir.lock().unwrap().join(path)
        };
        if !resolved.exists() {
            return Err(ModelError::NotFound(resolved.display().to_string()));
        }

        let model = Arc::new(Model::new(
            resolved.display().to_string(),
            function_name,
            DEFAULT_BATCH_SIZE,
        ));
        self.cache.lock().unwrap().insert(key, Arc::clone(&model));
        tracing::info!(path = %model.path(), function_name, "model loaded");
        Ok(model)
    }

    /// Register a model backed by preloaded memory under a caller-chosen
    /// tag. Never touches the filesystem.
    pub fn load_mem(&self, tag: &str, function_name: &str) -> Arc<Model> {
        let key = format!("{tag}_{function_name}");
        let mut cache = self.cache.lock().unwrap();
        if let Some(model) = cache.get(&key) {
            return Arc::clone(model);
        }
        let model = Arc::new(Model::new(tag, function_name, DEFAULT_BATCH_SIZE));
        cache.insert(key, Arc::clone(&model));
        model
    }

    /// Drop the cache entry for this handle. Returns `false` when the
    /// handle was not cached (already unloaded, or never loaded here).
    pub fn unload(&self, model: &Arc<Model>) -> bool {
        let mut cache = self.cache.lock().unwrap();
        let key = cache
            .iter()
            .find(|(_, cached)| Arc::ptr_eq(cached, model))
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => {
                cache.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Drop every cache entry. Live handles stay valid.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn cached_num(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // The manager is process-global; tests key models uniquely to stay
    // independent.

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "stub").unwrap();
        path
    }

    #[test]
    fn load_caches_by_uri_and_function() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "resnet.model");
        let uri = path.display().to_string();

        let manager = ModelManager::instance();
        let a = manager.load(&uri, "subnet0").unwrap();
        let b = manager.load(&uri, "subnet0").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // A different function name is a different cache entry.
        let c = manager.load(&uri, "subnet1").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        assert!(manager.unload(&a));
        assert!(manager.unload(&c));
    }

    #[test]
    fn load_missing_file_fails() {
        let manager = ModelManager::instance();
        let err = manager.load("/definitely/not/here.model", "subnet0");
        assert!(matches!(err, Err(ModelError::NotFound(_))));
    }

    #[test]
    fn set_model_dir_validates_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "relative.model");

        let manager = ModelManager::instance();
        assert!(!manager.set_model_dir(dir.path().join("missing-subdir")));
        assert!(manager.set_model_dir(dir.path()));

        let model = manager.load("relative.model", "subnet0").unwrap();
        assert!(model.path().contains("relative.model"));
        assert!(manager.unload(&model));
        // Reset for other tests in this process.
        manager.set_model_dir(".");
    }

    #[test]
    fn unload_is_idempotent() {
        let manager = ModelManager::instance();
        let model = manager.load_mem("unload-twice", "subnet0");
        assert!(manager.unload(&model));
        assert!(!manager.unload(&model));
        // The handle itself survives unloading.
        assert_eq!(model.function_name(), "subnet0");
    }

    #[test]
    fn load_mem_skips_filesystem() {
        let manager = ModelManager::instance();
        let a = manager.load_mem("blob-tag", "subnet0");
        let b = manager.load_mem("blob-tag", "subnet0");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.batch_size(), 4);
        assert!(manager.unload(&a));
    }
}
