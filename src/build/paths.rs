//! Path resolution for recipe, artifact and scratch locations.

use std::path::{Component, Path, PathBuf};

/// Lexically clean a path: drop `.` components, fold `..` into its parent
/// and collapse repeated separators. Symlinks are not resolved.
pub fn clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => cleaned.push(prefix.as_os_str()),
            Component::RootDir => cleaned.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = cleaned.parent().is_none() && cleaned.has_root();
                if at_root {
                    continue;
                }
                let ends_in_normal = matches!(
                    cleaned.components().next_back(),
                    Some(Component::Normal(_))
                );
                if ends_in_normal {
                    cleaned.pop();
                } else {
                    cleaned.push("..");
                }
            }
            Component::Normal(part) => cleaned.push(part),
        }
    }

    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

/// Resolve `path` against `at` unless it is already absolute, then clean it.
pub fn clean_path_at(path: &Path, at: &Path) -> PathBuf {
    if path.is_absolute() {
        clean(path)
    } else {
        clean(&at.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_is_resolved_against_base() {
        assert_eq!(
            clean_path_at(Path::new("out"), Path::new("/home/user/build")),
            PathBuf::from("/home/user/build/out")
        );
        assert_eq!(
            clean_path_at(Path::new("../out/./images"), Path::new("/home/user/build")),
            PathBuf::from("/home/user/out/images")
        );
    }

    #[test]
    fn test_absolute_ignores_base() {
        for base in ["/", "/srv", "/home/user/build"] {
            assert_eq!(
                clean_path_at(Path::new("/var//lib/./images/"), Path::new(base)),
                PathBuf::from("/var/lib/images")
            );
        }
    }

    #[test]
    fn test_parent_of_root_stays_at_root() {
        assert_eq!(clean(Path::new("/../../etc")), PathBuf::from("/etc"));
        assert_eq!(
            clean_path_at(Path::new("../../.."), Path::new("/a")),
            PathBuf::from("/")
        );
    }

    #[test]
    fn test_clean_relative_keeps_leading_parents() {
        assert_eq!(clean(Path::new("../a/../b")), PathBuf::from("../b"));
        assert_eq!(clean(Path::new("a/..")), PathBuf::from("."));
    }
}
