use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::SubmitFailure;
use crate::protocol::{ArchiveBackend, ArchiveReceipt, ContentId};

/// 本地目录形式的内容寻址存储：`<root>/<sha256>.json`。
///
/// 先写临时文件再 rename，文件已存在即视为重复提交。
#[derive(Debug)]
pub struct FsArchive {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsArchive {
    pub fn open(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, cid: &ContentId) -> PathBuf {
        self.root.join(format!("{}.json", cid.digest()))
    }

    pub async fn get(&self, cid: &ContentId) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.object_path(cid)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl ArchiveBackend for FsArchive {
    fn name(&self) -> &str {
        "fs"
    }

    async fn put(&self, payload: &[u8]) -> Result<ArchiveReceipt, SubmitFailure> {
        let cid = ContentId::of(payload);
        let target = self.object_path(&cid);

        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_file() => {
                return Ok(ArchiveReceipt {
                    cid,
                    duplicate: true,
                });
            }
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(io_failure(error)),
        }

        let tmp = self.root.join(format!(
            ".{}.{}.{}.tmp",
            cid.digest(),
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        let written = match tokio::fs::write(&tmp, payload).await {
            Ok(()) => tokio::fs::rename(&tmp, &target).await,
            Err(error) => Err(error),
        };
        if let Err(error) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %tmp.display(), error = %cleanup, "failed to remove temp object");
                }
            }
            return Err(io_failure(error));
        }

        tracing::debug!(%cid, path = %target.display(), "archived payload");
        Ok(ArchiveReceipt {
            cid,
            duplicate: false,
        })
    }
}

fn io_failure(error: std::io::Error) -> SubmitFailure {
    match error.kind() {
        std::io::ErrorKind::PermissionDenied => SubmitFailure::Rejected(error.to_string()),
        _ => SubmitFailure::Transient(error.to_string()),
    }
}
