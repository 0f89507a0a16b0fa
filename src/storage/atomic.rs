//! 临时写入，完成后才对外可见。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use uuid::Uuid;

/// 目标同目录下的临时文件，在 `finalize_new` 时发布。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        fs::create_dir_all(parent).await?;
        let temp_path = parent.join(format!(".upload.tmp.{}", Uuid::new_v4().simple()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件，不影响目标文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步并把临时文件发布到目标路径；若其他写入者已先完成，
    /// 返回 `AlreadyExists`。
    pub async fn finalize_new(self) -> io::Result<()> {
        let Self {
            target,
            temp_path,
            file,
        } = self;
        if let Err(err) = file.sync_all().await {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        drop(file);

        // hard_link 不会覆盖已存在的目标，只有一个写入者成功。
        let linked = fs::hard_link(&temp_path, &target).await;
        let _ = fs::remove_file(&temp_path).await;
        linked?;

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
