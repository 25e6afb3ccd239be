//! Host capability detection.

use lambda_local_common::config::parse_version;

/// Facts about the running host that strategy selection depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnvironment {
    /// Host version, compared against `thread_min_host_version`.
    pub version: String,
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"))
    }
}

impl HostEnvironment {
    /// A host reporting `version`.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    /// Returns `true` if the host version is at least `minimum`.
    ///
    /// An unparsable host version never satisfies a requirement.
    pub fn satisfies(&self, minimum: &str) -> bool {
        match (parse_version(&self.version), parse_version(minimum)) {
            (Some(found), Some(required)) => found >= required,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfies() {
        let host = HostEnvironment::new("11.7.0");

        assert!(host.satisfies("11.7.0"));
        assert!(host.satisfies("11.6.9"));
        assert!(host.satisfies("10"));
        assert!(!host.satisfies("11.7.1"));
        assert!(!host.satisfies("12.0.0"));
    }

    #[test]
    fn test_unparsable_version() {
        assert!(!HostEnvironment::new("unknown").satisfies("0.0.1"));
    }

    #[test]
    fn test_default_is_crate_version() {
        let host = HostEnvironment::default();
        assert_eq!(host.version, env!("CARGO_PKG_VERSION"));
        assert!(host.satisfies("0.1.0"));
    }
}
