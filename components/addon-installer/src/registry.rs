use crate::error::*;
use crate::version_util::VersionUtil;
use log::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledAddon {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
}

/// Snapshot of what is installed under `{root}/{name}/{version}`.
///
/// Built explicitly and passed by reference. A package whose directory is
/// missing (e.g. an interrupted replace) is simply absent from the snapshot
/// and can be installed again.
#[derive(Debug, Clone)]
pub struct AddonRegistry {
    root: PathBuf,
    addons: BTreeMap<String, Vec<InstalledAddon>>,
}

impl AddonRegistry {
    pub fn load(root: &Path) -> AddonResult<Self> {
        let mut registry = AddonRegistry {
            root: root.to_path_buf(),
            addons: BTreeMap::new(),
        };
        registry.refresh()?;
        Ok(registry)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn refresh(&mut self) -> AddonResult<()> {
        self.addons.clear();
        if !self.root.is_dir() {
            debug!("install root {} does not exist yet", self.root.display());
            return Ok(());
        }

        for (name, name_dir) in list_subdirs(&self.root)? {
            let mut versions: Vec<InstalledAddon> = list_subdirs(&name_dir)?
                .into_iter()
                .map(|(version, path)| InstalledAddon {
                    name: name.clone(),
                    version,
                    path,
                })
                .collect();
            if versions.is_empty() {
                continue;
            }
            versions.sort_by(|a, b| compare_versions(&a.version, &b.version));
            self.addons.insert(name, versions);
        }

        info!(
            "registry loaded {} addons from {}",
            self.addons.len(),
            self.root.display()
        );
        Ok(())
    }

    pub fn list(&self) -> Vec<&InstalledAddon> {
        self.addons.values().flatten().collect()
    }

    /// Installed versions of `name`, lowest first. Versions that are not
    /// semver sort after all the others.
    pub fn versions(&self, name: &str) -> Vec<&str> {
        self.addons
            .get(name)
            .map(|list| list.iter().map(|a| a.version.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn is_installed(&self, name: &str, version: &str) -> bool {
        self.get(name, version).is_some()
    }

    pub fn addon_dir(&self, name: &str, version: &str) -> Option<&Path> {
        self.get(name, version).map(|a| a.path.as_path())
    }

    fn get(&self, name: &str, version: &str) -> Option<&InstalledAddon> {
        self.addons
            .get(name)
            .and_then(|list| list.iter().find(|a| a.version == version))
    }
}

// scratch entries start with '.', never list them
fn list_subdirs(dir: &Path) -> AddonResult<Vec<(String, PathBuf)>> {
    let mut result = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| {
        error!("read dir {} failed: {}", dir.display(), e);
        AddonError::fs(dir, e)
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| AddonError::fs(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            result.push((name, entry.path()));
        }
    }
    result.sort();
    Ok(result)
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    match (VersionUtil::parse(a), VersionUtil::parse(b)) {
        (Ok(a), Ok(b)) => VersionUtil::compare(&a, &b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
