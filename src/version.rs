use serde::{Deserialize, Serialize};

const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
const PKG_LICENSE: Option<&str> = option_env!("CARGO_PKG_LICENSE");
const BUILD_PROFILE: Option<&str> = option_env!("STARTER_BUILD_PROFILE");
const BUILD_TIMESTAMP: Option<&str> = option_env!("STARTER_BUILD_TIMESTAMP");
const GIT_SHA: Option<&str> = option_env!("STARTER_GIT_SHA");
const GIT_DIRTY: Option<&str> = option_env!("STARTER_GIT_DIRTY");

/// Version payload served by `GET /version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub build: String,
}

pub fn info() -> VersionInfo {
    VersionInfo {
        version: PKG_VERSION.to_string(),
        build: build_tag(),
    }
}

fn build_tag() -> String {
    match (GIT_SHA, GIT_DIRTY) {
        (Some(sha), Some("dirty")) => format!("{sha}-dirty"),
        (Some(sha), _) => sha.to_string(),
        (None, _) => "dev".to_string(),
    }
}

pub fn describe() -> String {
    let mut lines = vec![format!("{PKG_NAME} {PKG_VERSION}"), PKG_DESCRIPTION.to_string()];
    if let Some(license) = PKG_LICENSE {
        lines.push(format!("license: {license}"));
    }
    lines.push(format!("commit: {}", build_tag()));
    lines.push(format!(
        "built: {} [{}]",
        BUILD_TIMESTAMP.unwrap_or("unknown time"),
        BUILD_PROFILE.unwrap_or("unknown profile"),
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_reports_package_version() {
        let info = info();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert!(!info.build.is_empty());
    }

    #[test]
    fn describe_starts_with_name_and_version() {
        let text = describe();
        assert!(text.starts_with(&format!("{PKG_NAME} {PKG_VERSION}")));
    }
}
