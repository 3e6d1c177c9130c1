use std::path::{Component, Path, PathBuf};

use crate::config::{IoRestrictions, Restriction};

/// Decides whether the front end may touch a file on the local disk.
pub trait AccessPolicy: Send + Sync {
    fn allow_read(&self, path: &Path) -> bool;
    fn allow_write(&self, path: &Path) -> bool;
}

/// Policy that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

impl AccessPolicy for Unrestricted {
    fn allow_read(&self, _path: &Path) -> bool {
        true
    }

    fn allow_write(&self, _path: &Path) -> bool {
        true
    }
}

impl IoRestrictions {
    fn base_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default()
    }

    fn permits(&self, restriction: Restriction, path: &Path) -> bool {
        let base = normalize(&self.base_dir());
        let target = if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&base.join(path))
        };
        match restriction {
            Restriction::Unrestricted => true,
            Restriction::WorkingDirOnly => target.starts_with(&base),
            Restriction::AllowedDirs => {
                target.starts_with(&base)
                    || self
                        .allowed_dirs
                        .iter()
                        .any(|dir| target.starts_with(normalize(dir)))
            }
        }
    }
}

impl AccessPolicy for IoRestrictions {
    fn allow_read(&self, path: &Path) -> bool {
        self.permits(self.read, path)
    }

    fn allow_write(&self, path: &Path) -> bool {
        if is_std_stream(path) {
            return true;
        }
        self.permits(self.write, path)
    }
}

fn is_std_stream(path: &Path) -> bool {
    matches!(path.to_str(), Some("stdout" | "stderr" | "-"))
}

/// Lexically resolves `.` and `..` without touching the file system.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when `name` is a bare file name with no directory part.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Resolves `requested` against the search paths.
///
/// An existing path wins outright; a missing absolute path fails without
/// consulting the search paths; otherwise the first search path that holds
/// the file wins.
pub fn find_file(search_paths: &[PathBuf], requested: &str) -> Option<PathBuf> {
    if requested.is_empty() {
        return None;
    }
    let direct = Path::new(requested);
    if direct.is_file() {
        return Some(direct.to_path_buf());
    }
    if direct.is_absolute() {
        return None;
    }
    search_paths
        .iter()
        .map(|dir| dir.join(direct))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tracefront-files-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn search_paths_are_tried_in_order() {
        let root = scratch_dir("order");
        let first = root.join("first");
        let second = root.join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(second.join("colors.inc"), "// second").unwrap();
        std::fs::write(first.join("shapes.inc"), "// first").unwrap();
        std::fs::write(second.join("shapes.inc"), "// second").unwrap();

        let paths = vec![first.clone(), second.clone()];
        assert_eq!(find_file(&paths, "colors.inc"), Some(second.join("colors.inc")));
        assert_eq!(find_file(&paths, "shapes.inc"), Some(first.join("shapes.inc")));
        assert_eq!(find_file(&paths, "missing.inc"), None);
    }

    #[test]
    fn missing_absolute_path_does_not_search() {
        let root = scratch_dir("absolute");
        std::fs::write(root.join("woods.inc"), "").unwrap();
        let absent = root.join("elsewhere").join("woods.inc");
        assert_eq!(find_file(&[root.clone()], absent.to_str().unwrap()), None);

        let present = root.join("woods.inc");
        assert_eq!(find_file(&[], present.to_str().unwrap()), Some(present));
    }

    #[test]
    fn restrictions_follow_configured_dirs() {
        let policy = IoRestrictions {
            read: Restriction::Unrestricted,
            write: Restriction::AllowedDirs,
            allowed_dirs: vec![PathBuf::from("/srv/renders")],
            working_dir: Some(PathBuf::from("/home/user/scenes")),
        };
        assert!(policy.allow_write(Path::new("out/frame.png")));
        assert!(policy.allow_write(Path::new("/srv/renders/a.png")));
        assert!(!policy.allow_write(Path::new("/etc/passwd")));
        assert!(!policy.allow_write(Path::new("../../../etc/passwd")));
        assert!(policy.allow_write(Path::new("stdout")));
        assert!(policy.allow_read(Path::new("/etc/hosts")));
    }

    #[test]
    fn plain_file_names() {
        assert!(is_plain_file_name("render.log"));
        assert!(!is_plain_file_name("logs/render.log"));
        assert!(!is_plain_file_name("/tmp/render.log"));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name(""));
    }
}
