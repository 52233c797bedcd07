//! pwatch のコア機能
//!
//! このクレートは、監視セッションとイベントループを提供します。
//! 対象スレッドごとのチャネルをまとめて管理し、準備完了になったリングを
//! ドレインしてサンプルをハンドラへ渡します。

pub mod event_loop;
pub mod parse;
pub mod session;

pub use event_loop::{EventLoop, LoopStats, StopHandle};
pub use session::{PartialFailure, Session};

// 他のクレートから使用するために再エクスポート
pub use pwatch_target::{
    Abi, Arch, BreakpointKind, BreakpointLen, ChannelOpener, Error, PerfChannel, ProcTasks,
    SampleData, TaskEnumerator, ThreadId, TraceChannel, WatchRequest,
};

/// コア操作の結果型
pub type Result<T> = std::result::Result<T, Error>;
