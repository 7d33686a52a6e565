use crate::error::*;
use flate2::read::GzDecoder;
use log::*;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use zip::result::ZipError;
use zip::ZipArchive;

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const ZIP_EMPTY_MAGIC: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Sniffs the container type from the leading bytes of the file.
    pub fn detect(path: &Path) -> AddonResult<Self> {
        let mut file = File::open(path).map_err(|e| AddonError::fs(path, e))?;
        let mut head = [0u8; 4];
        let mut read = 0;
        while read < head.len() {
            let n = file
                .read(&mut head[read..])
                .map_err(|e| AddonError::fs(path, e))?;
            if n == 0 {
                break;
            }
            read += n;
        }

        if read == 4 && (head == ZIP_MAGIC || head == ZIP_EMPTY_MAGIC) {
            return Ok(ArchiveFormat::Zip);
        }
        if read >= 2 && head[..2] == GZIP_MAGIC {
            return Ok(ArchiveFormat::TarGz);
        }
        Err(AddonError::UnsupportedPackage(format!(
            "unknown archive format: {}",
            path.display()
        )))
    }
}

/// A local addon archive. Every call reopens the file, so one value can be
/// shared by the parse and unpack steps.
#[derive(Debug, Clone)]
pub struct AddonArchive {
    path: PathBuf,
    format: ArchiveFormat,
}

impl AddonArchive {
    pub fn open(path: &Path) -> AddonResult<Self> {
        let format = ArchiveFormat::detect(path)?;
        Ok(AddonArchive {
            path: path.to_path_buf(),
            format,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Member names with any leading `./` and trailing `/` removed.
    pub fn entry_names(&self) -> AddonResult<Vec<String>> {
        match self.format {
            ArchiveFormat::Zip => {
                let archive = self.open_zip()?;
                Ok(archive.file_names().map(normalize_entry_name).collect())
            }
            ArchiveFormat::TarGz => {
                let mut archive = self.open_tar()?;
                let mut names = Vec::new();
                for entry in archive.entries().map_err(|e| self.corrupt(e))? {
                    let entry = entry.map_err(|e| self.corrupt(e))?;
                    let path = entry.path().map_err(|e| self.corrupt(e))?;
                    names.push(normalize_entry_name(&path.to_string_lossy()));
                }
                Ok(names)
            }
        }
    }

    /// Reads one member as UTF-8 text. `Ok(None)` when the member is absent.
    pub fn read_entry_text(&self, name: &str) -> AddonResult<Option<String>> {
        let mut content = Vec::new();
        match self.format {
            ArchiveFormat::Zip => {
                let mut archive = self.open_zip()?;
                let real_name = match archive
                    .file_names()
                    .find(|candidate| normalize_entry_name(candidate) == name)
                {
                    Some(real_name) => real_name.to_string(),
                    None => return Ok(None),
                };
                let mut member = match archive.by_name(&real_name) {
                    Ok(member) => member,
                    Err(ZipError::FileNotFound) => return Ok(None),
                    Err(e) => return Err(self.corrupt(e)),
                };
                member
                    .read_to_end(&mut content)
                    .map_err(|e| self.corrupt(e))?;
            }
            ArchiveFormat::TarGz => {
                let mut archive = self.open_tar()?;
                let mut found = false;
                for entry in archive.entries().map_err(|e| self.corrupt(e))? {
                    let mut entry = entry.map_err(|e| self.corrupt(e))?;
                    let entry_name = {
                        let path = entry.path().map_err(|e| self.corrupt(e))?;
                        normalize_entry_name(&path.to_string_lossy())
                    };
                    if entry_name == name {
                        entry
                            .read_to_end(&mut content)
                            .map_err(|e| self.corrupt(e))?;
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Ok(None);
                }
            }
        }

        String::from_utf8(content).map(Some).map_err(|_| {
            AddonError::UnsupportedPackage(format!("{} is not valid UTF-8 text", name))
        })
    }

    /// Extracts every member under `dest`, keeping the recorded permission
    /// bits. Returns the number of regular files written.
    pub fn extract_to(&self, dest: &Path) -> AddonResult<usize> {
        debug!(
            "Extracting {} to {}",
            self.path.display(),
            dest.display()
        );
        fs::create_dir_all(dest).map_err(|e| AddonError::fs(dest, e))?;
        match self.format {
            ArchiveFormat::Zip => self.extract_zip(dest),
            ArchiveFormat::TarGz => self.extract_tar(dest),
        }
    }

    fn extract_zip(&self, dest: &Path) -> AddonResult<usize> {
        let mut archive = self.open_zip()?;
        let mut dir_modes = Vec::new();
        let mut files = 0;

        for i in 0..archive.len() {
            let mut member = archive.by_index(i).map_err(|e| self.corrupt(e))?;
            let out_path = match member.enclosed_name() {
                Some(rel) => dest.join(rel),
                None => {
                    warn!("Skip unsafe archive member {}", member.name());
                    continue;
                }
            };

            if member.is_dir() {
                fs::create_dir_all(&out_path).map_err(|e| AddonError::fs(&out_path, e))?;
                if let Some(mode) = member.unix_mode() {
                    dir_modes.push((out_path, mode));
                }
                continue;
            }

            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| AddonError::fs(parent, e))?;
            }
            let mut out_file = File::create(&out_path).map_err(|e| AddonError::fs(&out_path, e))?;
            io::copy(&mut member, &mut out_file).map_err(|e| self.corrupt(e))?;
            drop(out_file);

            if let Some(mode) = member.unix_mode() {
                set_mode(&out_path, mode)?;
            }
            files += 1;
        }

        // children first, so a read-only parent does not block its subtree
        for (dir, mode) in dir_modes.into_iter().rev() {
            set_mode(&dir, mode)?;
        }
        Ok(files)
    }

    /// Only directories and regular files are written. Links and special
    /// members are skipped, as zip extraction never creates them either.
    fn extract_tar(&self, dest: &Path) -> AddonResult<usize> {
        let mut archive = self.open_tar()?;
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);
        let mut dir_modes = Vec::new();
        let mut files = 0;

        for entry in archive.entries().map_err(|e| self.corrupt(e))? {
            let mut entry = entry.map_err(|e| self.corrupt(e))?;
            let entry_type = entry.header().entry_type();
            let name = entry
                .path()
                .map_err(|e| self.corrupt(e))?
                .to_string_lossy()
                .to_string();

            if entry_type.is_dir() {
                let out_path = match enclosed_path(&name) {
                    Some(rel) => dest.join(rel),
                    None => {
                        warn!("Skip unsafe archive member {}", name);
                        continue;
                    }
                };
                fs::create_dir_all(&out_path).map_err(|e| AddonError::fs(&out_path, e))?;
                if let Ok(mode) = entry.header().mode() {
                    dir_modes.push((out_path, mode));
                }
                continue;
            }

            if !entry_type.is_file() {
                warn!("Skip {:?} archive member {}", entry_type, name);
                continue;
            }
            if enclosed_path(&name).is_none() {
                warn!("Skip unsafe archive member {}", name);
                continue;
            }
            // unpack_in creates missing parents and applies the file mode
            let written = entry.unpack_in(dest).map_err(|e| self.corrupt(e))?;
            if written {
                files += 1;
            }
        }

        for (dir, mode) in dir_modes.into_iter().rev() {
            set_mode(&dir, mode)?;
        }
        Ok(files)
    }

    fn open_zip(&self) -> AddonResult<ZipArchive<File>> {
        let file = File::open(&self.path).map_err(|e| AddonError::fs(&self.path, e))?;
        ZipArchive::new(file).map_err(|e| self.corrupt(e))
    }

    fn open_tar(&self) -> AddonResult<Archive<GzDecoder<File>>> {
        let file = File::open(&self.path).map_err(|e| AddonError::fs(&self.path, e))?;
        Ok(Archive::new(GzDecoder::new(file)))
    }

    fn corrupt(&self, err: impl ToString) -> AddonError {
        AddonError::FilesystemError(
            self.path.display().to_string(),
            format!("corrupt archive: {}", err.to_string()),
        )
    }
}

pub(crate) fn normalize_entry_name(name: &str) -> String {
    let name = name.replace('\\', "/");
    let mut name = name.as_str();
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name.trim_end_matches('/').to_string()
}

// relative path with no root, prefix or `..` component
fn enclosed_path(name: &str) -> Option<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(rel)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> AddonResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = mode & 0o7777;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| AddonError::fs(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> AddonResult<()> {
    Ok(())
}
