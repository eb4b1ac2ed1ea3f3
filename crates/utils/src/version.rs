use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        BUILD_INFO.commit_sha1.unwrap_or("unknown"),
        if BUILD_INFO.git_dirty { "-dirty" } else { "" }
    )
});

/// Branch the binary was built from, if known.
pub fn branch() -> &'static str {
    BUILD_INFO.branch.unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_starts_with_image_version() {
        assert!(VERSION.starts_with(env!("IMAGE_VERSION")));
        assert!(!branch().is_empty());
    }

    #[test]
    fn dirty_suffix_follows_build_info() {
        assert_eq!(VERSION.ends_with("-dirty"), BUILD_INFO.git_dirty);
        assert_eq!(
            BUILD_INFO.git_dirty,
            option_env!("VERGEN_GIT_DIRTY") == Some("true")
        );
    }
}
