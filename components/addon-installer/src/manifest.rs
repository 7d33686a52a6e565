use crate::archive::AddonArchive;
use crate::error::*;
use lazy_static::lazy_static;
use log::*;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

/*
Manifest formats, probed in this order. The first entry present in the
archive root decides the format, later ones are never looked at:

manifest.json   legacy server addon, content under addon/, platform [1.0.0, 1.2.0)
package.yaml    package description, content at archive root, platform >= 1.0.3
package.yml     same as package.yaml
package.py      package definition, name/version pulled out with a regex
*/

const LEGACY_MIN_PLATFORM_VERSION: &str = "1.0.0";
const LEGACY_MAX_PLATFORM_VERSION: &str = "1.2.0";
const PACKAGE_MIN_PLATFORM_VERSION: &str = "1.0.3";

lazy_static! {
    static ref PACKAGE_PY_NAME: Regex = Regex::new(r#"\bname\s*=\s*"([^"]+)""#).unwrap();
    static ref PACKAGE_PY_VERSION: Regex = Regex::new(r#"\bversion\s*=\s*"([^"]+)""#).unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackagingKind {
    /// payload lives in an `addon/` directory of the archive
    Standard,
    /// the archive root is the payload
    Flat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    pub min_platform_version: String, // inclusive
    pub max_platform_version: Option<String>, // exclusive
    pub packaging_kind: PackagingKind,
}

impl PackageDescriptor {
    fn new(
        name: String,
        version: String,
        min_platform_version: &str,
        max_platform_version: Option<&str>,
        packaging_kind: PackagingKind,
    ) -> AddonResult<Self> {
        let descriptor = PackageDescriptor {
            name,
            version,
            min_platform_version: min_platform_version.to_string(),
            max_platform_version: max_platform_version.map(|v| v.to_string()),
            packaging_kind,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> AddonResult<()> {
        check_path_component("name", &self.name)?;
        check_path_component("version", &self.version)?;
        Version::parse(&self.version).map_err(|err| {
            AddonError::UnsupportedPackage(format!(
                "addon version {} is not a semantic version: {}",
                self.version, err
            ))
        })?;
        Ok(())
    }

    /// `{name} {version}`, as used in progress descriptions.
    pub fn label(&self) -> String {
        format!("{} {}", self.name, self.version)
    }
}

// name and version become directories under the install root
fn check_path_component(field: &str, value: &str) -> AddonResult<()> {
    if value.is_empty() {
        return Err(AddonError::UnsupportedPackage(format!(
            "addon {} is empty",
            field
        )));
    }
    if value.starts_with('.') || value.contains('/') || value.contains('\\') || value.contains('\0')
    {
        return Err(AddonError::UnsupportedPackage(format!(
            "addon {} {:?} is not a valid directory name",
            field, value
        )));
    }
    Ok(())
}

type ParseFn = fn(&str) -> AddonResult<PackageDescriptor>;

pub struct ManifestFormat {
    pub entry_name: &'static str,
    parse: ParseFn,
}

impl ManifestFormat {
    pub fn matches(&self, entry_name: &str) -> bool {
        entry_name == self.entry_name
    }

    pub fn parse(&self, content: &str) -> AddonResult<PackageDescriptor> {
        (self.parse)(content)
    }
}

pub const MANIFEST_FORMATS: &[ManifestFormat] = &[
    ManifestFormat {
        entry_name: "manifest.json",
        parse: parse_manifest_json,
    },
    ManifestFormat {
        entry_name: "package.yaml",
        parse: parse_package_yaml,
    },
    ManifestFormat {
        entry_name: "package.yml",
        parse: parse_package_yaml,
    },
    ManifestFormat {
        entry_name: "package.py",
        parse: parse_package_py,
    },
];

pub struct ManifestParser {}

impl ManifestParser {
    /// First format whose entry is present, in `MANIFEST_FORMATS` order.
    pub fn select<S: AsRef<str>>(entry_names: &[S]) -> Option<&'static ManifestFormat> {
        MANIFEST_FORMATS.iter().find(|format| {
            entry_names
                .iter()
                .any(|entry_name| format.matches(entry_name.as_ref()))
        })
    }

    pub fn parse_archive(archive: &AddonArchive) -> AddonResult<PackageDescriptor> {
        let entry_names = archive.entry_names()?;
        let format = Self::select(&entry_names).ok_or_else(|| {
            AddonError::UnsupportedPackage("Unsupported addon format".to_string())
        })?;

        debug!(
            "parse {} from {}",
            format.entry_name,
            archive.path().display()
        );
        let content = archive.read_entry_text(format.entry_name)?.ok_or_else(|| {
            AddonError::UnsupportedPackage(format!("{} could not be read", format.entry_name))
        })?;
        format.parse(&content)
    }
}

fn parse_manifest_json(content: &str) -> AddonResult<PackageDescriptor> {
    let manifest: serde_json::Value = serde_json::from_str(content).map_err(|err| {
        AddonError::UnsupportedPackage(format!("manifest.json is not valid JSON: {}", err))
    })?;

    let field = |key: &str, legacy_key: &str| {
        manifest
            .get(key)
            .or_else(|| manifest.get(legacy_key))
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
    };

    match (field("name", "addon_name"), field("version", "addon_version")) {
        (Some(name), Some(version)) => PackageDescriptor::new(
            name,
            version,
            LEGACY_MIN_PLATFORM_VERSION,
            Some(LEGACY_MAX_PLATFORM_VERSION),
            PackagingKind::Standard,
        ),
        _ => Err(AddonError::UnsupportedPackage(
            "Addon name or version not found in manifest".to_string(),
        )),
    }
}

fn parse_package_yaml(content: &str) -> AddonResult<PackageDescriptor> {
    let manifest: serde_yaml::Value = serde_yaml::from_str(content).map_err(|err| {
        AddonError::UnsupportedPackage(format!("package file is not valid YAML: {}", err))
    })?;

    let field = |key: &str| match manifest.get(key) {
        Some(serde_yaml::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(serde_yaml::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    match (field("name"), field("version")) {
        (Some(name), Some(version)) => PackageDescriptor::new(
            name,
            version,
            PACKAGE_MIN_PLATFORM_VERSION,
            None,
            PackagingKind::Flat,
        ),
        _ => Err(AddonError::UnsupportedPackage(
            "Addon name or version not found in package.yaml".to_string(),
        )),
    }
}

fn parse_package_py(content: &str) -> AddonResult<PackageDescriptor> {
    let capture = |re: &Regex| {
        re.captures(content)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    };

    match (capture(&PACKAGE_PY_NAME), capture(&PACKAGE_PY_VERSION)) {
        (Some(name), Some(version)) => PackageDescriptor::new(
            name,
            version,
            PACKAGE_MIN_PLATFORM_VERSION,
            None,
            PackagingKind::Flat,
        ),
        _ => Err(AddonError::UnsupportedPackage(
            "Addon name or version not found in package.py".to_string(),
        )),
    }
}
