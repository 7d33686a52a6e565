use crate::error::*;
use crate::manifest::PackageDescriptor;
use log::*;
use semver::Version;
use std::cmp::Ordering;

pub struct VersionUtil {}

impl VersionUtil {
    pub fn parse(version: &str) -> AddonResult<Version> {
        Version::parse(version.trim()).map_err(|err| {
            AddonError::UnsupportedPackage(format!("Invalid version:{}, err:{}", version, err))
        })
    }

    /// Semver precedence: build metadata does not take part in ordering.
    pub fn compare(a: &Version, b: &Version) -> Ordering {
        a.major
            .cmp(&b.major)
            .then(a.minor.cmp(&b.minor))
            .then(a.patch.cmp(&b.patch))
            .then_with(|| a.pre.cmp(&b.pre))
    }

    /// Accepts iff `min <= platform` and (`max` unset or `platform < max`).
    pub fn check_compatible(platform: &Version, descriptor: &PackageDescriptor) -> AddonResult<()> {
        let min = Self::parse(&descriptor.min_platform_version)?;
        if Self::compare(platform, &min) == Ordering::Less {
            return Err(AddonError::UnsupportedPackage(format!(
                "Platform version {} is not supported by addon {} (requires >= {})",
                platform,
                descriptor.label(),
                min
            )));
        }

        if let Some(max) = &descriptor.max_platform_version {
            let max = Self::parse(max)?;
            if Self::compare(platform, &max) != Ordering::Less {
                return Err(AddonError::UnsupportedPackage(format!(
                    "Platform version {} is not supported by addon {} (requires < {})",
                    platform,
                    descriptor.label(),
                    max
                )));
            }
        }

        debug!(
            "addon {} is compatible with platform {}",
            descriptor.label(),
            platform
        );
        Ok(())
    }

    pub fn is_compatible(platform: &Version, descriptor: &PackageDescriptor) -> bool {
        Self::check_compatible(platform, descriptor).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PackagingKind;

    fn descriptor(min: &str, max: Option<&str>) -> PackageDescriptor {
        PackageDescriptor {
            name: "tvpaint".to_string(),
            version: "1.0.0".to_string(),
            min_platform_version: min.to_string(),
            max_platform_version: max.map(|m| m.to_string()),
            packaging_kind: PackagingKind::Standard,
        }
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_bounds() {
        let d = descriptor("1.0.0", Some("1.2.0"));
        assert!(VersionUtil::is_compatible(&v("1.0.0"), &d));
        assert!(VersionUtil::is_compatible(&v("1.1.0"), &d));
        assert!(VersionUtil::is_compatible(&v("1.1.99"), &d));
        assert!(!VersionUtil::is_compatible(&v("1.2.0"), &d));
        assert!(!VersionUtil::is_compatible(&v("1.3.0"), &d));
        assert!(!VersionUtil::is_compatible(&v("0.9.9"), &d));
    }

    #[test]
    fn test_no_upper_bound() {
        let d = descriptor("1.0.3", None);
        assert!(!VersionUtil::is_compatible(&v("1.0.2"), &d));
        assert!(VersionUtil::is_compatible(&v("1.0.3"), &d));
        assert!(VersionUtil::is_compatible(&v("99.0.0"), &d));
    }

    #[test]
    fn test_semantic_not_lexicographic() {
        let d = descriptor("1.9.0", Some("1.10.0"));
        assert!(VersionUtil::is_compatible(&v("1.9.5"), &d));
        assert!(!VersionUtil::is_compatible(&v("1.10.0"), &d));
        assert!(!VersionUtil::is_compatible(&v("1.11.0"), &d));
    }

    #[test]
    fn test_prerelease_and_build() {
        let d = descriptor("1.0.0", Some("1.2.0"));
        // 1.2.0-rc.1 sorts before 1.2.0
        assert!(VersionUtil::is_compatible(&v("1.2.0-rc.1"), &d));
        assert!(!VersionUtil::is_compatible(&v("1.0.0-beta"), &d));
        // build metadata is ignored
        assert!(!VersionUtil::is_compatible(&v("1.2.0+build.5"), &d));
        assert!(VersionUtil::is_compatible(&v("1.0.0+build.5"), &d));
    }

    #[test]
    fn test_accepts_iff_in_range() {
        let bounds = ["0.9.0", "1.0.0", "1.0.3", "1.1.0", "1.2.0", "2.0.0"];
        for min in bounds {
            for max in bounds.iter().map(|m| Some(*m)).chain([None]) {
                let d = descriptor(min, max);
                for p in bounds {
                    let expected = v(min) <= v(p) && max.map_or(true, |m| v(p) < v(m));
                    assert_eq!(
                        VersionUtil::is_compatible(&v(p), &d),
                        expected,
                        "platform {} min {} max {:?}",
                        p,
                        min,
                        max
                    );
                }
            }
        }
    }

    #[test]
    fn test_rejection_is_unsupported_package() {
        let d = descriptor("1.0.0", Some("1.2.0"));
        let err = VersionUtil::check_compatible(&v("1.3.0"), &d).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedPackage);

        let d = descriptor("not-a-version", None);
        assert!(matches!(
            VersionUtil::check_compatible(&v("1.3.0"), &d),
            Err(AddonError::UnsupportedPackage(_))
        ));
    }
}
