//! Image building and definition discovery.
//!
//! A definition is any directory under the definitions root that contains
//! a `Dockerfile`; its name is the directory path relative to the root.
//! Client images are tagged `hive/clients/<name>`, simulator images
//! `hive/simulators/<name>`.

use log::{debug, info, warn};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::ContainerBackend;
use crate::error_handling::types::RegistryError;
use crate::registry::types::{
    ClientConfigFile, ClientDefinition, ClientMetadata, SimulatorDefinition,
};

pub struct ImageBuilder {
    backend: Arc<dyn ContainerBackend>,
    nocache: Vec<String>,
}

impl ImageBuilder {
    /// `nocache` holds image name fragments from `--docker-nocache`;
    /// a tag matching any fragment is rebuilt without the layer cache.
    pub fn new(backend: Arc<dyn ContainerBackend>, nocache: Vec<String>) -> Self {
        Self { backend, nocache }
    }

    fn nocache_for(&self, tag: &str) -> bool {
        self.nocache.iter().any(|frag| tag.contains(frag.as_str()))
    }

    /// Builds all clients under `root` whose name is in `filter` (all of
    /// them when `filter` is `None`) and returns their definitions.
    pub async fn build_clients(
        &self,
        root: &Path,
        filter: Option<&[String]>,
    ) -> Result<Vec<ClientDefinition>, RegistryError> {
        let mut definitions = Vec::new();
        for (name, dir) in discover_definitions(root)? {
            if let Some(allowed) = filter {
                if !allowed.iter().any(|n| n == &name) {
                    debug!("skipping client {} (not selected)", name);
                    continue;
                }
            }

            let tag = format!("hive/clients/{}", name);
            let nocache = self.nocache_for(&tag);
            info!("building client {} (nocache: {})", name, nocache);
            let image = self
                .backend
                .build_image(&dir, &tag, nocache)
                .await
                .map_err(|source| RegistryError::Build {
                    name: name.clone(),
                    source,
                })?;

            let version = match self.backend.image_version(&image).await {
                Ok(Some(v)) => v,
                Ok(None) => {
                    warn!("client {} has no /version.txt, reporting 'unknown'", name);
                    "unknown".to_string()
                }
                Err(e) => {
                    warn!("cannot read version of client {}: {}", name, e);
                    "unknown".to_string()
                }
            };

            let meta = read_metadata(&name, &dir)?;
            info!("client {} ready (version: {})", name, version);
            definitions.push(ClientDefinition {
                name,
                version,
                image,
                meta,
            });
        }

        if definitions.is_empty() {
            return Err(RegistryError::NoDefinitions(root.to_path_buf()));
        }
        Ok(definitions)
    }

    /// Builds all simulators under `root` whose name matches `pattern`.
    pub async fn build_simulators(
        &self,
        root: &Path,
        pattern: Option<&Regex>,
    ) -> Result<Vec<SimulatorDefinition>, RegistryError> {
        let mut definitions = Vec::new();
        for (name, dir) in discover_definitions(root)? {
            if let Some(re) = pattern {
                if !re.is_match(&name) {
                    debug!("skipping simulator {} (pattern mismatch)", name);
                    continue;
                }
            }

            let tag = format!("hive/simulators/{}", name);
            let nocache = self.nocache_for(&tag);
            info!("building simulator {} (nocache: {})", name, nocache);
            let image = self
                .backend
                .build_image(&dir, &tag, nocache)
                .await
                .map_err(|source| RegistryError::Build {
                    name: name.clone(),
                    source,
                })?;
            definitions.push(SimulatorDefinition { name, image });
        }

        if definitions.is_empty() {
            return Err(RegistryError::NoDefinitions(root.to_path_buf()));
        }
        Ok(definitions)
    }
}

/// Walks the definitions tree and returns `(name, dir)` pairs, sorted by
/// name for stable build order. Nested directories are allowed; the name
/// is the `/`-joined relative path (e.g. `ethereum/sync`).
fn discover_definitions(root: &Path) -> Result<Vec<(String, PathBuf)>, RegistryError> {
    let mut found = Vec::new();
    if !root.is_dir() {
        return Err(RegistryError::NoDefinitions(root.to_path_buf()));
    }
    walk(root, root, &mut found)?;
    found.sort();
    Ok(found)
}

fn walk(
    root: &Path,
    dir: &Path,
    found: &mut Vec<(String, PathBuf)>,
) -> Result<(), RegistryError> {
    if dir.join("Dockerfile").is_file() {
        let name = dir
            .strip_prefix(root)
            .unwrap_or(dir)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        found.push((name, dir.to_path_buf()));
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(root, &path, found)?;
        }
    }
    Ok(())
}

fn read_metadata(name: &str, dir: &Path) -> Result<ClientMetadata, RegistryError> {
    let path = dir.join("hive.yaml");
    if !path.is_file() {
        return Ok(ClientMetadata::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    let parsed: ClientConfigFile =
        serde_yaml::from_str(&raw).map_err(|e| RegistryError::InvalidMetadata {
            name: name.to_string(),
            detail: e.to_string(),
        })?;
    Ok(ClientMetadata {
        roles: parsed.roles.unwrap_or_else(|| ClientMetadata::default().roles),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use tempfile::TempDir;

    fn write_definition(root: &Path, name: &str, hive_yaml: Option<&str>) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
        if let Some(yaml) = hive_yaml {
            std::fs::write(dir.join("hive.yaml"), yaml).unwrap();
        }
    }

    #[tokio::test]
    async fn test_discovery_and_version() {
        let root = TempDir::new().unwrap();
        write_definition(root.path(), "go-ethereum_latest", None);
        write_definition(root.path(), "parity_latest", None);

        let backend = Arc::new(MockBackend::new());
        backend.set_image_version("hive/clients/go-ethereum_latest", "1.10.3");

        let builder = ImageBuilder::new(backend, Vec::new());
        let clients = builder.build_clients(root.path(), None).await.unwrap();
        assert_eq!(clients.len(), 2);

        let geth = clients.iter().find(|c| c.name == "go-ethereum_latest").unwrap();
        assert_eq!(geth.version, "1.10.3");
        assert_eq!(geth.image, "hive/clients/go-ethereum_latest");
        assert_eq!(geth.meta.roles, vec!["eth1".to_string()]);

        let parity = clients.iter().find(|c| c.name == "parity_latest").unwrap();
        assert_eq!(parity.version, "unknown");
    }

    #[tokio::test]
    async fn test_client_filter() {
        let root = TempDir::new().unwrap();
        write_definition(root.path(), "go-ethereum_latest", None);
        write_definition(root.path(), "parity_latest", None);

        let builder = ImageBuilder::new(Arc::new(MockBackend::new()), Vec::new());
        let filter = vec!["parity_latest".to_string()];
        let clients = builder
            .build_clients(root.path(), Some(&filter))
            .await
            .unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "parity_latest");
    }

    #[tokio::test]
    async fn test_roles_from_hive_yaml() {
        let root = TempDir::new().unwrap();
        write_definition(root.path(), "trin_latest", Some("roles:\n  - portal\n"));

        let builder = ImageBuilder::new(Arc::new(MockBackend::new()), Vec::new());
        let clients = builder.build_clients(root.path(), None).await.unwrap();
        assert_eq!(clients[0].meta.roles, vec!["portal".to_string()]);
    }

    #[tokio::test]
    async fn test_nocache_selection() {
        let root = TempDir::new().unwrap();
        write_definition(root.path(), "go-ethereum_latest", None);
        write_definition(root.path(), "parity_latest", None);

        let backend = Arc::new(MockBackend::new());
        let builder = ImageBuilder::new(backend.clone(), vec!["go-ethereum".to_string()]);
        builder.build_clients(root.path(), None).await.unwrap();
        assert_eq!(
            backend.builds_without_cache(),
            vec!["hive/clients/go-ethereum_latest".to_string()]
        );
    }

    #[tokio::test]
    async fn test_nested_simulator_names() {
        let root = TempDir::new().unwrap();
        write_definition(root.path(), "ethereum/sync", None);
        write_definition(root.path(), "smoke", None);

        let builder = ImageBuilder::new(Arc::new(MockBackend::new()), Vec::new());
        let sims = builder.build_simulators(root.path(), None).await.unwrap();
        let names: Vec<_> = sims.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["ethereum/sync", "smoke"]);

        let pattern = Regex::new("^smoke").unwrap();
        let sims = builder
            .build_simulators(root.path(), Some(&pattern))
            .await
            .unwrap();
        assert_eq!(sims.len(), 1);
        assert_eq!(sims[0].name, "smoke");
    }

    #[tokio::test]
    async fn test_empty_root_is_an_error() {
        let root = TempDir::new().unwrap();
        let builder = ImageBuilder::new(Arc::new(MockBackend::new()), Vec::new());
        assert!(builder.build_clients(root.path(), None).await.is_err());
    }
}
