//! スレッドごとの監視チャネル

use crate::breakpoint::BreakpointDescriptor;
use crate::memory::{page_size, MmapRegion};
use crate::perf::{self, PERF_FLAG_FD_CLOEXEC};
use crate::registers::SampleData;
use crate::ring::{DrainStats, RingBuffer};
use crate::{Error, Result, ThreadId};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

/// リングサイズ指数の上限（データ領域は最大 2^16 ページ）
pub const MAX_RING_SIZE_EXPONENT: u32 = 16;

/// リングサイズ指数を検証する
pub fn validate_ring_size_exponent(exponent: u32) -> Result<()> {
    if exponent > MAX_RING_SIZE_EXPONENT {
        return Err(Error::invalid(format!(
            "ring size exponent {} exceeds {}",
            exponent, MAX_RING_SIZE_EXPONENT
        )));
    }
    Ok(())
}

/// 1スレッドを監視するチャネル
///
/// セッションとイベントループはこのトレイトを通してチャネルを扱います。
pub trait TraceChannel {
    /// 監視しているスレッド
    fn tid(&self) -> ThreadId;

    /// 準備完了の通知を待つハンドル（クローズ後は `None`）
    fn event_fd(&self) -> Option<BorrowedFd<'_>>;

    /// イベントを有効化する（冪等）
    fn arm(&mut self) -> Result<()>;

    /// イベントを無効化する（冪等）
    fn disarm(&mut self) -> Result<()>;

    fn is_armed(&self) -> bool;

    /// 読めるサンプルをすべてデコードして `emit` に渡す
    fn drain<F>(&mut self, emit: F) -> Result<DrainStats>
    where
        F: FnMut(&SampleData<'_>);

    /// 無効化してマッピングとハンドルを解放する
    ///
    /// 2回目以降は `ChannelClosed` を返します。
    fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// チャネルを開く
pub trait ChannelOpener {
    type Channel: TraceChannel;

    fn open(
        &self,
        tid: ThreadId,
        descriptor: &BreakpointDescriptor,
        ring_size_exponent: u32,
    ) -> Result<Self::Channel>;
}

/// perf_event_open によるチャネル
#[derive(Debug)]
pub struct PerfChannel {
    tid: ThreadId,
    fd: Option<OwnedFd>,
    ring: Option<RingBuffer>,
    armed: bool,
}

impl PerfChannel {
    /// `tid` に束縛したブレークポイントイベントを作り、リングをマップする
    ///
    /// コントロールページ1枚と `2^ring_size_exponent` ページのデータリングを
    /// 1つの共有領域としてマップします。マップに失敗した場合、作成したイベントは
    /// エラーを返す前に閉じます。
    pub fn open(
        tid: ThreadId,
        descriptor: &BreakpointDescriptor,
        ring_size_exponent: u32,
    ) -> Result<Self> {
        validate_ring_size_exponent(ring_size_exponent)?;

        let fd = perf::perf_event_open(descriptor.attr(), tid, -1, -1, PERF_FLAG_FD_CLOEXEC)
            .map_err(|source| Error::EventCreateFailed { tid, source })?;

        perf::reset(fd.as_fd()).map_err(|source| Error::EventCreateFailed { tid, source })?;

        let page = page_size();
        let len = page * (1 + (1usize << ring_size_exponent));
        let region = match MmapRegion::shared(fd.as_fd(), len) {
            Ok(region) => region,
            Err(source) => {
                tracing::debug!(tid, "mmap of {} bytes failed, closing event", len);
                drop(fd);
                return Err(Error::MappingFailed { tid, source });
            }
        };
        let ring = RingBuffer::new(region, page, descriptor.register_count())?;

        tracing::debug!(
            tid,
            fd = fd.as_raw_fd(),
            "opened breakpoint channel with {} byte ring",
            ring.capacity()
        );

        Ok(Self {
            tid,
            fd: Some(fd),
            ring: Some(ring),
            armed: false,
        })
    }

    /// マップ済みのリング
    pub fn ring(&self) -> Option<&RingBuffer> {
        self.ring.as_ref()
    }

    fn fd(&self) -> Result<BorrowedFd<'_>> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_fd())
            .ok_or(Error::ChannelClosed(self.tid))
    }
}

impl TraceChannel for PerfChannel {
    fn tid(&self) -> ThreadId {
        self.tid
    }

    fn event_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn arm(&mut self) -> Result<()> {
        let fd = self.fd()?;
        if self.armed {
            return Ok(());
        }
        perf::enable(fd).map_err(|source| Error::Control {
            tid: self.tid,
            source,
        })?;
        self.armed = true;
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        let fd = self.fd()?;
        if !self.armed {
            return Ok(());
        }
        perf::disable(fd).map_err(|source| Error::Control {
            tid: self.tid,
            source,
        })?;
        self.armed = false;
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.armed
    }

    fn drain<F>(&mut self, emit: F) -> Result<DrainStats>
    where
        F: FnMut(&SampleData<'_>),
    {
        let ring = self.ring.as_mut().ok_or(Error::ChannelClosed(self.tid))?;
        Ok(ring.drain(emit))
    }

    fn close(&mut self) -> Result<()> {
        let fd = self.fd.take().ok_or(Error::ChannelClosed(self.tid))?;

        if self.armed {
            if let Err(e) = perf::disable(fd.as_fd()) {
                tracing::warn!(tid = self.tid, "disable before close failed: {}", e);
            }
            self.armed = false;
        }
        // マッピングを先に外してからハンドルを閉じる
        drop(self.ring.take());
        drop(fd);

        tracing::debug!(tid = self.tid, "closed breakpoint channel");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.fd.is_none()
    }
}

impl Drop for PerfChannel {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}

/// `PerfChannel` を開く
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfOpener;

impl ChannelOpener for PerfOpener {
    type Channel = PerfChannel;

    fn open(
        &self,
        tid: ThreadId,
        descriptor: &BreakpointDescriptor,
        ring_size_exponent: u32,
    ) -> Result<PerfChannel> {
        PerfChannel::open(tid, descriptor, ring_size_exponent)
    }
}
