//! pwatch ターゲット側の低レベル機能
//!
//! このクレートは、スレッドごとのハードウェアブレークポイントイベントと
//! その共有サンプルリングを扱います。
//! perf_event_open による記述子の作成、リングのマップとデコード、
//! 対象プロセスのスレッド列挙などを行います。

pub mod breakpoint;
pub mod channel;
pub mod error;
pub mod memory;
pub mod perf;
pub mod registers;
pub mod ring;
pub mod thread;

#[cfg(any(test, feature = "synthetic"))]
pub mod synthetic;

pub use breakpoint::{BreakpointDescriptor, BreakpointKind, BreakpointLen, WatchRequest};
pub use channel::{ChannelOpener, PerfChannel, PerfOpener, TraceChannel, MAX_RING_SIZE_EXPONENT};
pub use error::{Error, Result};
pub use memory::MmapRegion;
pub use registers::{Abi, Arch, SampleData};
pub use ring::{DrainStats, RingBuffer};
pub use thread::{ProcTasks, TaskEnumerator, ThreadId};
