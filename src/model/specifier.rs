// src/model/specifier.rs
//! Adaptor specifiers and install aliases
//!
//! A specifier is a package identity string `name[@version]`. The alias is
//! the normalized dedupe key used by the autoinstall coordinator and by the
//! on-disk registry layout; two specifiers with the same name but different
//! versions are distinct installs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Parsed adaptor specifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdaptorSpecifier {
    /// Package name
    pub name: String,

    /// Pinned version, if any
    pub version: Option<String>,
}

impl AdaptorSpecifier {
    /// Parse a raw specifier string
    ///
    /// A leading `@` (scoped package) is part of the name, so the version
    /// separator is the *last* `@` past position zero.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();

        match raw.rfind('@') {
            Some(idx) if idx > 0 => Self {
                name: raw[..idx].to_string(),
                version: Some(raw[idx + 1..].to_string()),
            },
            _ => Self {
                name: raw.to_string(),
                version: None,
            },
        }
    }

    /// Normalized dedupe key: name and version joined by `_`
    pub fn alias(&self) -> String {
        match &self.version {
            Some(version) => format!("{}_{}", self.name, version),
            None => self.name.clone(),
        }
    }

    /// Whether this specifier points at the local filesystem rather than a
    /// package registry
    pub fn is_path(&self) -> bool {
        self.name.starts_with('/')
            || self.name.starts_with("./")
            || self.name.starts_with("../")
            || self.name.starts_with("file:")
    }

    /// Autoinstall only fires for package-style specifiers; local paths are
    /// the operator's responsibility
    pub fn autoinstallable(&self) -> bool {
        !self.is_path()
    }
}

impl fmt::Display for AdaptorSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name() {
        let spec = AdaptorSpecifier::parse("common");
        assert_eq!(spec.name, "common");
        assert_eq!(spec.version, None);
        assert_eq!(spec.alias(), "common");
    }

    #[test]
    fn test_parse_versioned() {
        let spec = AdaptorSpecifier::parse("common@1.0.0");
        assert_eq!(spec.name, "common");
        assert_eq!(spec.version.as_deref(), Some("1.0.0"));
        assert_eq!(spec.alias(), "common_1.0.0");
    }

    #[test]
    fn test_parse_scoped_package() {
        let spec = AdaptorSpecifier::parse("@relay/language-http@2.1.0");
        assert_eq!(spec.name, "@relay/language-http");
        assert_eq!(spec.version.as_deref(), Some("2.1.0"));
    }

    #[test]
    fn test_distinct_versions_distinct_aliases() {
        let a = AdaptorSpecifier::parse("common@1.0.0");
        let b = AdaptorSpecifier::parse("common@2.0.0");
        assert_ne!(a.alias(), b.alias());
    }

    #[test]
    fn test_path_specifiers_skip_autoinstall() {
        assert!(!AdaptorSpecifier::parse("/srv/adaptors/common").autoinstallable());
        assert!(!AdaptorSpecifier::parse("./local-adaptor").autoinstallable());
        assert!(!AdaptorSpecifier::parse("file:../common").autoinstallable());
        assert!(AdaptorSpecifier::parse("common@1.0.0").autoinstallable());
    }

    #[test]
    fn test_display_roundtrip() {
        assert_eq!(AdaptorSpecifier::parse("common@1.0.0").to_string(), "common@1.0.0");
        assert_eq!(AdaptorSpecifier::parse("common").to_string(), "common");
    }
}
