use crate::archive::AddonArchive;
use crate::error::*;
use crate::manifest::{PackageDescriptor, PackagingKind};
use log::*;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;
use walkdir::WalkDir;

const STANDARD_PAYLOAD_DIR: &str = "addon";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackStage {
    Extracting,
    Placing,
}

/// Extracts validated archives into `{root}/{name}/{version}`.
///
/// Scratch directories are created inside the install root so the final move
/// is a rename on the same filesystem. They are removed on every exit path.
///
/// Between removing an old install and moving the new one in there is a
/// window where the package is absent. An interrupted install leaves it
/// missing and it must be installed again.
#[derive(Debug, Clone)]
pub struct Unpacker {
    install_root: PathBuf,
}

impl Unpacker {
    pub fn new(install_root: PathBuf) -> Self {
        Unpacker { install_root }
    }

    pub fn target_dir(&self, descriptor: &PackageDescriptor) -> PathBuf {
        self.install_root
            .join(&descriptor.name)
            .join(&descriptor.version)
    }

    /// Blocking. Run it through the worker pool, never on the scheduler.
    pub fn unpack(
        &self,
        archive: &AddonArchive,
        descriptor: &PackageDescriptor,
        stages: Option<&UnboundedSender<UnpackStage>>,
    ) -> AddonResult<PathBuf> {
        let notify = |stage: UnpackStage| {
            if let Some(tx) = stages {
                let _ = tx.send(stage);
            }
        };

        fs::create_dir_all(&self.install_root)
            .map_err(|e| AddonError::fs(&self.install_root, e))?;
        let scratch = tempfile::Builder::new()
            .prefix(".unpack-")
            .tempdir_in(&self.install_root)
            .map_err(|e| AddonError::fs(&self.install_root, e))?;

        notify(UnpackStage::Extracting);
        let files = archive.extract_to(scratch.path())?;
        debug!(
            "extracted {} files of {} into {}",
            files,
            descriptor.label(),
            scratch.path().display()
        );

        // validate the payload before the old install is touched
        let payload = scratch.path().join(STANDARD_PAYLOAD_DIR);
        if descriptor.packaging_kind == PackagingKind::Standard && !is_real_dir(&payload) {
            return Err(AddonError::UnsupportedPackage(format!(
                "addon {} has no {}/ directory",
                descriptor.label(),
                STANDARD_PAYLOAD_DIR
            )));
        }

        notify(UnpackStage::Placing);
        let target = self.target_dir(descriptor);
        Self::remove_existing(&target, descriptor)?;

        match descriptor.packaging_kind {
            PackagingKind::Standard => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| AddonError::fs(parent, e))?;
                }
                fs::rename(&payload, &target).map_err(|e| AddonError::fs(&target, e))?;
            }
            PackagingKind::Flat => {
                Self::move_tree(scratch.path(), &target)?;
            }
        }

        if let Err(err) = scratch.close() {
            warn!("remove scratch dir for {} failed: {}", descriptor.label(), err);
        }

        info!("addon {} placed at {}", descriptor.label(), target.display());
        Ok(target)
    }

    fn remove_existing(target: &Path, descriptor: &PackageDescriptor) -> AddonResult<()> {
        let meta = match fs::symlink_metadata(target) {
            Ok(meta) => meta,
            Err(_) => return Ok(()),
        };
        info!("Removing existing addon {}", descriptor.label());
        if meta.is_dir() {
            fs::remove_dir_all(target).map_err(|e| AddonError::fs(target, e))
        } else {
            fs::remove_file(target).map_err(|e| AddonError::fs(target, e))
        }
    }

    /// Re-homes every non-directory entry under `src` at the same relative
    /// path under `dest`. Empty directories are not carried over.
    fn move_tree(src: &Path, dest: &Path) -> AddonResult<()> {
        fs::create_dir_all(dest).map_err(|e| AddonError::fs(dest, e))?;

        // collect first: entries are renamed away while walking otherwise
        let mut files = Vec::new();
        for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| AddonError::fs(src, e))?;
            if !entry.file_type().is_dir() {
                files.push(entry.into_path());
            }
        }

        for source_file in files {
            let rel = source_file
                .strip_prefix(src)
                .map_err(|e| AddonError::fs(&source_file, e))?;
            let target_file = dest.join(rel);
            if let Some(parent) = target_file.parent() {
                fs::create_dir_all(parent).map_err(|e| AddonError::fs(parent, e))?;
            }
            fs::rename(&source_file, &target_file)
                .map_err(|e| AddonError::fs(&target_file, e))?;
        }
        Ok(())
    }
}

// a symlink named `addon/` does not count, even when it points at a directory
fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_dir())
        .unwrap_or(false)
}
