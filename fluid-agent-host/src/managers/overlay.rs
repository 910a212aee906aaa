//! qcow2 overlays backed by a base image: `work_dir/<sandbox_id>/disk.qcow2`

use super::{ManagerError, ManagerResult, OverlayManager};
use crate::execution::run_tool;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct QcowOverlayManager {
    qemu_img: String,
    work_dir: PathBuf,
}

impl QcowOverlayManager {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self { qemu_img: "qemu-img".to_string(), work_dir: work_dir.into() }
    }

    pub fn overlay_path(&self, sandbox_id: &str) -> PathBuf {
        self.work_dir.join(sandbox_id).join("disk.qcow2")
    }
}

#[async_trait]
impl OverlayManager for QcowOverlayManager {
    async fn create_overlay(&self, sandbox_id: &str, base_image: &Path) -> ManagerResult<PathBuf> {
        let path = self.overlay_path(sandbox_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let base = base_image.display().to_string();
        let target = path.display().to_string();
        run_tool(&self.qemu_img, &["create", "-f", "qcow2", "-b", &base, "-F", "qcow2", &target]).await?;
        info!("overlay {} created on {}", target, base);
        Ok(path)
    }

    async fn remove_overlay(&self, sandbox_id: &str) -> ManagerResult<()> {
        let dir = self.work_dir.join(sandbox_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn snapshot(&self, sandbox_id: &str, name: &str) -> ManagerResult<String> {
        let path = self.overlay_path(sandbox_id);
        if !path.is_file() {
            return Err(ManagerError::NotFound(format!("overlay of {sandbox_id}")));
        }
        let snapshot_id = fluid_protocol::generate_id("SNP-");
        let tag = format!("{snapshot_id}-{name}");
        run_tool(&self.qemu_img, &["snapshot", "-c", &tag, &path.display().to_string()]).await?;
        info!("snapshot {} of {} created", tag, sandbox_id);
        Ok(snapshot_id)
    }
}
