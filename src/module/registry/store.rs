//! Module store
//!
//! Cache layout: `<cache_dir>/<sha256>.wasm`, with optional signature
//! sidecars `<sha256>.sig` and `<sha256>.pub`. File sources carry their own
//! sidecars at `<path>.sig` and `<path>.pub`. Only bytes whose digest matches
//! their content address are ever written to the cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ModuleStoreConfig;
use crate::module::security::signature::{module_digest, SignatureMaterial};
use crate::module::traits::ModuleReference;
use crate::utils::log_error_async;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModuleStoreError {
    #[error("module reference has an invalid sha256")]
    InvalidReference,
    #[error("module {0} not found and no source given")]
    NotFound(String),
    #[error("unsupported module source: {0}")]
    UnsupportedSource(String),
    #[error("module of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("module read failed: {0}")]
    Io(String),
    #[error("module download failed: {0}")]
    Download(String),
}

/// Where module bytes were found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOrigin {
    Cache,
    Memory,
    File,
    Http,
    Ipfs,
}

/// Module bytes plus any signature sidecar found next to them
#[derive(Debug, Clone)]
pub struct ModuleArtifact {
    pub bytes: Arc<Vec<u8>>,
    pub sidecar: Option<SignatureMaterial>,
    pub origin: ModuleOrigin,
}

pub struct ModuleStore {
    config: ModuleStoreConfig,
    memory: RwLock<HashMap<String, (Arc<Vec<u8>>, Option<SignatureMaterial>)>>,
    client: reqwest::Client,
}

impl ModuleStore {
    pub fn new(config: ModuleStoreConfig) -> Result<Self, ModuleStoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.fetch_timeout_ms))
            .build()
            .map_err(|e| ModuleStoreError::Download(e.to_string()))?;
        Ok(Self {
            config,
            memory: RwLock::new(HashMap::new()),
            client,
        })
    }

    fn cache_path(&self, sha256: &str, extension: &str) -> PathBuf {
        self.config.cache_dir.join(format!("{}.{}", sha256, extension))
    }

    /// Register module bytes in memory; returns their content address
    pub async fn insert(&self, bytes: Vec<u8>) -> String {
        self.insert_signed(bytes, None).await
    }

    /// Register module bytes together with detached signature material
    pub async fn insert_signed(&self, bytes: Vec<u8>, sidecar: Option<SignatureMaterial>) -> String {
        let sha256 = module_digest(&bytes);
        debug!("Registered module {} ({} bytes)", sha256, bytes.len());
        self.memory
            .write()
            .await
            .insert(sha256.clone(), (Arc::new(bytes), sidecar));
        sha256
    }

    /// Resolve the bytes for `reference`
    pub async fn fetch(&self, reference: &ModuleReference) -> Result<ModuleArtifact, ModuleStoreError> {
        if !reference.has_valid_digest() {
            return Err(ModuleStoreError::InvalidReference);
        }
        let sha256 = reference.sha256.as_str();

        let cached = self.cache_path(sha256, "wasm");
        if tokio::fs::try_exists(&cached).await.unwrap_or(false) {
            let bytes = self.read_capped(&cached).await?;
            let sidecar = read_sidecar(
                &self.cache_path(sha256, "sig"),
                &self.cache_path(sha256, "pub"),
            )
            .await;
            debug!("Module {} served from cache", sha256);
            return Ok(ModuleArtifact {
                bytes: Arc::new(bytes),
                sidecar,
                origin: ModuleOrigin::Cache,
            });
        }

        if let Some((bytes, sidecar)) = self.memory.read().await.get(sha256).cloned() {
            return Ok(ModuleArtifact {
                bytes,
                sidecar,
                origin: ModuleOrigin::Memory,
            });
        }

        let source = reference
            .source
            .as_deref()
            .ok_or_else(|| ModuleStoreError::NotFound(sha256.to_string()))?;

        let artifact = if let Some(path) = source.strip_prefix("file://") {
            let path = Path::new(path);
            let bytes = self.read_capped(path).await?;
            let sidecar = read_sidecar(&with_suffix(path, ".sig"), &with_suffix(path, ".pub")).await;
            ModuleArtifact {
                bytes: Arc::new(bytes),
                sidecar,
                origin: ModuleOrigin::File,
            }
        } else if source.starts_with("http://") || source.starts_with("https://") {
            let bytes = self.download(source).await?;
            ModuleArtifact {
                bytes: Arc::new(bytes),
                sidecar: None,
                origin: ModuleOrigin::Http,
            }
        } else if let Some(cid) = source.strip_prefix("ipfs://") {
            let url = format!(
                "{}/ipfs/{}",
                self.config.ipfs_gateway.trim_end_matches('/'),
                cid.trim_start_matches('/')
            );
            let bytes = self.download(&url).await?;
            ModuleArtifact {
                bytes: Arc::new(bytes),
                sidecar: None,
                origin: ModuleOrigin::Ipfs,
            }
        } else {
            return Err(ModuleStoreError::UnsupportedSource(source.to_string()));
        };

        info!(
            "Fetched module {} from {:?} ({} bytes)",
            sha256,
            artifact.origin,
            artifact.bytes.len()
        );
        self.cache(sha256, &artifact).await;
        Ok(artifact)
    }

    async fn read_capped(&self, path: &Path) -> Result<Vec<u8>, ModuleStoreError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ModuleStoreError::Io(format!("{}: {}", path.display(), e)))?;
        let size = metadata.len() as usize;
        if size > self.config.max_module_bytes {
            return Err(ModuleStoreError::TooLarge {
                size,
                limit: self.config.max_module_bytes,
            });
        }
        tokio::fs::read(path)
            .await
            .map_err(|e| ModuleStoreError::Io(format!("{}: {}", path.display(), e)))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ModuleStoreError> {
        let limit = self.config.max_module_bytes;
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ModuleStoreError::Download(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ModuleStoreError::Download(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ModuleStoreError::Download(e.to_string()))?
        {
            if bytes.len() + chunk.len() > limit {
                return Err(ModuleStoreError::TooLarge {
                    size: bytes.len() + chunk.len(),
                    limit,
                });
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    /// Write verified-by-digest bytes (and sidecars) into the cache
    async fn cache(&self, sha256: &str, artifact: &ModuleArtifact) {
        if module_digest(&artifact.bytes) != sha256 {
            warn!("Not caching module {}: digest mismatch", sha256);
            return;
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.config.cache_dir).await {
            warn!("Failed to create module cache dir: {}", e);
            return;
        }
        let path = self.cache_path(sha256, "wasm");
        if let Err(e) = tokio::fs::write(&path, artifact.bytes.as_slice()).await {
            warn!("Failed to cache module {}: {}", sha256, e);
            return;
        }
        if let Some(ref sidecar) = artifact.sidecar {
            let sig_path = self.cache_path(sha256, "sig");
            let pub_path = self.cache_path(sha256, "pub");
            log_error_async(
                || tokio::fs::write(&sig_path, &sidecar.signature),
                "Failed to cache signature sidecar",
            )
            .await;
            log_error_async(
                || tokio::fs::write(&pub_path, &sidecar.public_key),
                "Failed to cache public key sidecar",
            )
            .await;
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

async fn read_sidecar(sig_path: &Path, pub_path: &Path) -> Option<SignatureMaterial> {
    let signature = tokio::fs::read_to_string(sig_path).await.ok()?;
    let public_key = tokio::fs::read_to_string(pub_path).await.ok()?;
    Some(SignatureMaterial::new(
        signature.trim(),
        public_key.trim(),
        sig_path.display().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::traits::EntrySignature;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ModuleStore {
        ModuleStore::new(ModuleStoreConfig {
            cache_dir: dir.path().join("cache"),
            max_module_bytes: 1024,
            ..Default::default()
        })
        .unwrap()
    }

    fn reference(sha256: &str, source: Option<String>) -> ModuleReference {
        let mut r = ModuleReference::new(sha256, "run()".parse::<EntrySignature>().unwrap());
        r.source = source;
        r
    }

    #[tokio::test]
    async fn test_memory_registration() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let sha = store.insert(b"\0asm-bytes".to_vec()).await;
        let artifact = store.fetch(&reference(&sha, None)).await.unwrap();
        assert_eq!(artifact.origin, ModuleOrigin::Memory);
        assert_eq!(artifact.bytes.as_slice(), b"\0asm-bytes");
    }

    #[tokio::test]
    async fn test_file_source_with_sidecars_is_cached() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let module_path = dir.path().join("job.wasm");
        std::fs::write(&module_path, b"\0asm-file").unwrap();
        std::fs::write(with_suffix(&module_path, ".sig"), "aa\n").unwrap();
        std::fs::write(with_suffix(&module_path, ".pub"), "02bb\n").unwrap();

        let sha = module_digest(b"\0asm-file");
        let source = format!("file://{}", module_path.display());
        let artifact = store.fetch(&reference(&sha, Some(source))).await.unwrap();
        assert_eq!(artifact.origin, ModuleOrigin::File);
        let sidecar = artifact.sidecar.unwrap();
        assert_eq!(sidecar.signature, "aa");
        assert_eq!(sidecar.public_key, "02bb");
        assert_eq!(std::fs::read_to_string(store.cache_path(&sha, "sig")).unwrap(), "aa");
        assert_eq!(std::fs::read_to_string(store.cache_path(&sha, "pub")).unwrap(), "02bb");

        // Second fetch hits the cache, sidecars included
        let again = store.fetch(&reference(&sha, None)).await.unwrap();
        assert_eq!(again.origin, ModuleOrigin::Cache);
        assert!(again.sidecar.is_some());
    }

    #[tokio::test]
    async fn test_mismatched_bytes_are_not_cached() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let module_path = dir.path().join("evil.wasm");
        std::fs::write(&module_path, b"tampered").unwrap();
        let sha = module_digest(b"original");
        let source = format!("file://{}", module_path.display());
        let artifact = store.fetch(&reference(&sha, Some(source))).await.unwrap();
        assert_eq!(artifact.bytes.as_slice(), b"tampered");
        assert!(!dir.path().join("cache").join(format!("{}.wasm", sha)).exists());
    }

    #[tokio::test]
    async fn test_errors() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(
            store.fetch(&reference("not-a-digest", None)).await.unwrap_err(),
            ModuleStoreError::InvalidReference
        );
        let sha = "c".repeat(64);
        assert!(matches!(
            store.fetch(&reference(&sha, None)).await.unwrap_err(),
            ModuleStoreError::NotFound(_)
        ));
        assert!(matches!(
            store
                .fetch(&reference(&sha, Some("s3://bucket/x".into())))
                .await
                .unwrap_err(),
            ModuleStoreError::UnsupportedSource(_)
        ));

        let big = dir.path().join("big.wasm");
        std::fs::write(&big, vec![0u8; 2048]).unwrap();
        let source = format!("file://{}", big.display());
        assert!(matches!(
            store.fetch(&reference(&sha, Some(source))).await.unwrap_err(),
            ModuleStoreError::TooLarge { .. }
        ));
    }
}
