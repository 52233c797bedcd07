//! イベントループ
//!
//! 全チャネルのハンドルと停止用の `eventfd` を1つの epoll に登録し、
//! 準備完了になったチャネルのリングをドレインしてハンドラを呼びます。
//! ハンドラはループのスレッドで同期的に呼ばれ、戻るまで次のレコードは
//! デコードされません。

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use pwatch_target::{DrainStats, Error, SampleData, ThreadId, TraceChannel};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::session::Session;
use crate::Result;

/// 停止用ハンドルの epoll キー（スレッドIDは非負なので衝突しない）
const WAKER_KEY: u64 = u64::MAX;

/// 待機時間をミリ秒に切り上げる（0 より長ければ最低 1ms 待つ）
fn timeout_millis(timeout: Duration) -> i32 {
    let ms = timeout.as_nanos().div_ceil(1_000_000);
    ms.min(i32::MAX as u128) as i32
}

/// ループの累計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// 待機から戻った回数（タイムアウトは含まない）
    pub wakeups: u64,
    pub samples: u64,
    pub skipped: u64,
    pub lost: u64,
    pub discarded_bytes: u64,
    /// 終了を検出して閉じたスレッド数
    pub exited_threads: usize,
}

impl LoopStats {
    fn record(&mut self, drain: &DrainStats) {
        self.samples += drain.samples as u64;
        self.skipped += drain.skipped as u64;
        self.lost += drain.lost;
        self.discarded_bytes += drain.discarded_bytes;
    }
}

/// 別スレッドからループを止めるハンドル
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<EventFd>,
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl StopHandle {
    /// 停止を要求し、待機中のループを起こす
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.write(1) {
            // EAGAIN はカウンタが飽和しているだけで、起床は保留済み
            if e != Errno::EAGAIN {
                tracing::warn!("failed to wake event loop: {}", e);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// セッションを所有して待機とドレインを繰り返すループ
pub struct EventLoop<C, H>
where
    C: TraceChannel,
    H: FnMut(&SampleData<'_>),
{
    session: Session<C>,
    handler: H,
    epoll: Epoll,
    waker: Arc<EventFd>,
    stop: Arc<AtomicBool>,
    registered: BTreeSet<ThreadId>,
    events: Vec<EpollEvent>,
    stats: LoopStats,
}

impl<C, H> EventLoop<C, H>
where
    C: TraceChannel,
    H: FnMut(&SampleData<'_>),
{
    /// セッションの全チャネルを待機対象に登録する
    pub fn new(session: Session<C>, handler: H) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(Error::Poll)?;
        let waker = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(Error::Poll)?;
        epoll
            .add(&waker, EpollEvent::new(EpollFlags::EPOLLIN, WAKER_KEY))
            .map_err(Error::Poll)?;

        let mut registered = BTreeSet::new();
        for channel in session.channels() {
            let Some(fd) = channel.event_fd() else {
                continue;
            };
            let tid = channel.tid();
            epoll
                .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, tid as u64))
                .map_err(Error::Poll)?;
            registered.insert(tid);
        }

        tracing::debug!("event loop registered {} channels", registered.len());

        Ok(Self {
            events: vec![EpollEvent::empty(); registered.len() + 1],
            session,
            handler,
            epoll,
            waker: Arc::new(waker),
            stop: Arc::new(AtomicBool::new(false)),
            registered,
            stats: LoopStats::default(),
        })
    }

    /// 停止ハンドルを取得
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// 停止が要求されるか、開いているチャネルがなくなるまで待機とドレインを繰り返す
    pub fn run(&mut self) -> Result<()> {
        while !self.stop.load(Ordering::Acquire) {
            if self.registered.is_empty() {
                tracing::info!("no monitored threads left");
                break;
            }
            self.run_once(None)?;
        }
        Ok(())
    }

    /// 1回だけ待機して、準備完了のチャネルをドレインする
    ///
    /// ハンドラに渡したサンプル数を返します（タイムアウト時は0）。
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(d) => EpollTimeout::try_from(timeout_millis(d)).unwrap_or(EpollTimeout::NONE),
        };

        let ready = match self.epoll.wait(&mut self.events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => {
                self.stats.wakeups += 1;
                return Ok(0);
            }
            Err(e) => return Err(Error::Poll(e)),
        };
        if ready == 0 {
            return Ok(0);
        }
        self.stats.wakeups += 1;

        let mut delivered = 0;
        for i in 0..ready {
            let key = self.events[i].data();
            let flags = self.events[i].events();

            if key == WAKER_KEY {
                // カウンタを読んでリセットする
                let _ = self.waker.read();
                continue;
            }
            delivered += self.service(key as ThreadId, flags)?;
        }
        Ok(delivered)
    }

    fn service(&mut self, tid: ThreadId, flags: EpollFlags) -> Result<usize> {
        let handler = &mut self.handler;
        let Some(channel) = self.session.channel_mut(tid) else {
            return Ok(0);
        };

        let drained = match channel.drain(|sample| handler(sample)) {
            Ok(stats) => stats,
            Err(Error::ChannelClosed(_)) => DrainStats::default(),
            Err(e) => return Err(e),
        };
        self.stats.record(&drained);

        if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
            tracing::info!("thread {} exited, closing its channel", tid);
            if let Some(fd) = channel.event_fd() {
                if let Err(e) = self.epoll.delete(fd) {
                    tracing::warn!("failed to deregister thread {}: {}", tid, e);
                }
            }
            if let Err(e) = channel.close() {
                tracing::warn!("failed to close thread {}: {}", tid, e);
            }
            self.registered.remove(&tid);
            self.stats.exited_threads += 1;
        }

        Ok(drained.samples)
    }

    /// 累計の統計
    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn session(&self) -> &Session<C> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<C> {
        &mut self.session
    }

    /// ループを破棄してセッションを返す
    pub fn into_session(self) -> Session<C> {
        self.session
    }
}
