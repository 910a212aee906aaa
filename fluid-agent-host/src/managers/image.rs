//! Base image directory: `<name>.qcow2` disks with optional `<name>.vmlinux` kernels

use super::{ImageStore, ManagerError, ManagerResult};
use std::path::{Path, PathBuf};
use tracing::warn;

pub struct DirImageStore {
    base_dir: PathBuf,
}

impl DirImageStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> ManagerResult<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl ImageStore for DirImageStore {
    fn image_path(&self, name: &str) -> ManagerResult<PathBuf> {
        let path = self.base_dir.join(format!("{name}.qcow2"));
        if path.is_file() {
            Ok(path)
        } else {
            Err(ManagerError::NotFound(format!("image {name}")))
        }
    }

    fn kernel_path(&self, name: &str) -> ManagerResult<PathBuf> {
        let path = self.base_dir.join(format!("{name}.vmlinux"));
        if path.is_file() {
            Ok(path)
        } else {
            Err(ManagerError::NotFound(format!("kernel for image {name}")))
        }
    }

    fn list_names(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read image dir {}: {}", self.base_dir.display(), e);
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "qcow2"))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_dir_and_lists_qcow2_only() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("images/nested");
        let store = DirImageStore::new(&base).unwrap();
        assert!(store.base_dir().is_dir());
        assert!(store.list_names().is_empty());

        std::fs::write(base.join("ubuntu.qcow2"), b"disk").unwrap();
        std::fs::write(base.join("debian.qcow2"), b"disk").unwrap();
        std::fs::write(base.join("ubuntu.vmlinux"), b"kernel").unwrap();
        std::fs::write(base.join("notes.txt"), b"ignored").unwrap();

        assert_eq!(store.list_names(), vec!["debian", "ubuntu"]);
        assert_eq!(store.image_path("ubuntu").unwrap(), base.join("ubuntu.qcow2"));
        assert_eq!(store.kernel_path("ubuntu").unwrap(), base.join("ubuntu.vmlinux"));
        assert!(matches!(store.kernel_path("debian"), Err(ManagerError::NotFound(_))));
        assert!(matches!(store.image_path("arch"), Err(ManagerError::NotFound(_))));
    }
}
