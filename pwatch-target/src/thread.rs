//! スレッド列挙機能

use std::path::{Path, PathBuf};

/// スレッドID
pub type ThreadId = i32;

/// プロセスのスレッド一覧を返す外部コラボレータ
pub trait TaskEnumerator {
    /// `pid` に属するスレッドIDを返す
    ///
    /// プロセスが存在しない、またはスレッドにアクセスできない場合は空を返します。
    fn threads(&self, pid: ThreadId) -> Vec<ThreadId>;
}

/// `/proc/<pid>/task` を読むタスク列挙
#[derive(Debug, Clone)]
pub struct ProcTasks {
    root: PathBuf,
}

impl ProcTasks {
    /// `/proc` を読む列挙器を作成する
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// procfsのルートを指定して作成する
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Default for ProcTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskEnumerator for ProcTasks {
    fn threads(&self, pid: ThreadId) -> Vec<ThreadId> {
        let task_dir = self.root.join(pid.to_string()).join("task");
        let entries = match std::fs::read_dir(&task_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("cannot read {}: {}", task_dir.display(), e);
                return Vec::new();
            }
        };

        let mut tids: Vec<ThreadId> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                // 数字以外のエントリは無視
                if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                name.parse().ok()
            })
            .collect();

        tids.sort_unstable();
        tids
    }
}
