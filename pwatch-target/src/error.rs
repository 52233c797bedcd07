//! エラー型

use crate::ThreadId;
use nix::errno::Errno;
use thiserror::Error;

/// トレーサのエラー
#[derive(Debug, Error)]
pub enum Error {
    /// アーキテクチャのブレークポイントユニットで表現できないパラメータ
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// 監視対象のスレッドがない
    #[error("no threads to monitor")]
    EmptyTargetSet,

    /// カーネルがイベント作成を拒否した
    #[error("perf_event_open failed for thread {tid}: {source}")]
    EventCreateFailed { tid: ThreadId, source: Errno },

    /// 共有リングバッファをマップできなかった
    #[error("failed to map the sample ring of thread {tid}: {source}")]
    MappingFailed { tid: ThreadId, source: Errno },

    /// 解放済みのチャネルに対する操作
    #[error("channel for thread {0} is closed")]
    ChannelClosed(ThreadId),

    /// enable/disable/reset のioctlが失敗した
    #[error("perf ioctl failed on thread {tid}: {source}")]
    Control { tid: ThreadId, source: Errno },

    /// 待機機構（epoll/eventfd）の失敗
    #[error("readiness wait failed: {0}")]
    Poll(#[source] Errno),
}

impl Error {
    /// `InvalidParameter` を作る
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }
}

/// ターゲット制御の結果型
pub type Result<T> = std::result::Result<T, Error>;
