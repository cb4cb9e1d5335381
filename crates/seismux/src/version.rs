//! Version information for seismux.

/// Seismux version from Cargo.toml
pub const SEISMUX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported on the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub seismux: &'static str,
    /// Commit the binary was built from, when provided at build time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<&'static str>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            seismux: SEISMUX_VERSION,
            commit: option_env!("SEISMUX_COMMIT"),
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_commit(mut self, commit: &'static str) -> Self {
        self.commit = Some(commit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.seismux, SEISMUX_VERSION);
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            seismux: "0.1.0",
            commit: None,
        };
        insta::assert_json_snapshot!("version_minimal", info);
    }

    #[test]
    fn version_info_serializes_with_commit() {
        let info = VersionInfo {
            seismux: "0.1.0",
            commit: None,
        }
        .with_commit("4f1c2a9");
        insta::assert_json_snapshot!("version_with_commit", info);
    }
}
