//! 権限なしで使えるテスト用チャネル
//!
//! リングは `SyntheticRing`、準備完了の通知はUNIXソケットペアで表現します。
//! 書き込み側を閉じると読み取り側に HUP が立つので、スレッド終了も再現できます。

#![allow(dead_code)]

use nix::errno::Errno;
use pwatch_core::{
    Arch, BreakpointKind, BreakpointLen, ChannelOpener, Error, ThreadId, TraceChannel, WatchRequest,
};
use pwatch_target::ring::DrainStats;
use pwatch_target::synthetic::SyntheticRing;
use pwatch_target::{BreakpointDescriptor, SampleData};
use std::cell::Cell;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

pub const REG_COUNT: usize = 33;

/// aarch64 の4バイト書き込み監視
pub fn write_request() -> WatchRequest {
    WatchRequest::new(0x1000, BreakpointLen::Len4, BreakpointKind::Write, Arch::aarch64())
}

/// tid と連番から決まるレジスタ値
pub fn regs_for(tid: u32, seq: u64) -> Vec<u64> {
    (0..REG_COUNT as u64).map(|i| ((tid as u64) << 32) | (seq << 8) | i).collect()
}

pub struct MockChannel {
    tid: ThreadId,
    ring: Option<SyntheticRing>,
    reader: Option<UnixStream>,
    writer: Option<UnixStream>,
    armed: bool,
    fail_arm: bool,
    live: Rc<Cell<usize>>,
}

impl MockChannel {
    /// サンプルを書いて通知する
    pub fn push_sample(&mut self, seq: u64) {
        let tid = self.tid as u32;
        let ring = self.ring.as_mut().expect("channel is closed");
        assert!(ring.push_sample(1000, tid, 2, &regs_for(tid, seq)));
        self.notify();
    }

    /// LOSTレコードを書いて通知する
    pub fn push_lost(&mut self, lost: u64) {
        let ring = self.ring.as_mut().expect("channel is closed");
        assert!(ring.push_lost(lost));
        self.notify();
    }

    pub fn notify(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(&[1]).expect("notify failed");
        }
    }

    /// スレッド終了を再現する（読み取り側に HUP が立つ）
    pub fn hang_up(&mut self) {
        self.writer = None;
    }

    fn clear_notifications(&mut self) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        let mut buf = [0u8; 64];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("read failed: {}", e),
            }
        }
    }

    fn release(&mut self) {
        self.ring = None;
        self.reader = None;
        self.writer = None;
        self.live.set(self.live.get() - 1);
    }
}

impl TraceChannel for MockChannel {
    fn tid(&self) -> ThreadId {
        self.tid
    }

    fn event_fd(&self) -> Option<BorrowedFd<'_>> {
        self.reader.as_ref().map(|r| r.as_fd())
    }

    fn arm(&mut self) -> pwatch_core::Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed(self.tid));
        }
        if self.fail_arm {
            return Err(Error::Control {
                tid: self.tid,
                source: Errno::EBUSY,
            });
        }
        self.armed = true;
        Ok(())
    }

    fn disarm(&mut self) -> pwatch_core::Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed(self.tid));
        }
        self.armed = false;
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.armed
    }

    fn drain<F>(&mut self, emit: F) -> pwatch_core::Result<DrainStats>
    where
        F: FnMut(&SampleData<'_>),
    {
        self.clear_notifications();
        let ring = self.ring.as_mut().ok_or(Error::ChannelClosed(self.tid))?;
        Ok(ring.ring_mut().drain(emit))
    }

    fn close(&mut self) -> pwatch_core::Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed(self.tid));
        }
        self.armed = false;
        self.release();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.ring.is_none()
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.release();
        }
    }
}

/// `MockChannel` を開くオープナー
#[derive(Default)]
pub struct MockOpener {
    /// n回目（1始まり）のオープンを失敗させる
    pub fail_on: Option<usize>,
    /// このスレッドの arm を失敗させる
    pub fail_arm_for: Option<ThreadId>,
    pub opened: Cell<usize>,
    pub live: Rc<Cell<usize>>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self) -> usize {
        self.live.get()
    }
}

impl ChannelOpener for MockOpener {
    type Channel = MockChannel;

    fn open(
        &self,
        tid: ThreadId,
        descriptor: &BreakpointDescriptor,
        ring_size_exponent: u32,
    ) -> pwatch_core::Result<MockChannel> {
        let attempt = self.opened.get() + 1;
        self.opened.set(attempt);
        if self.fail_on == Some(attempt) {
            return Err(Error::MappingFailed {
                tid,
                source: Errno::ENOMEM,
            });
        }

        let ring = SyntheticRing::new(ring_size_exponent, descriptor.register_count())?;
        let (reader, writer) = UnixStream::pair().expect("Failed to create socket pair");
        reader
            .set_nonblocking(true)
            .expect("Failed to make reader non-blocking");

        self.live.set(self.live.get() + 1);
        Ok(MockChannel {
            tid,
            ring: Some(ring),
            reader: Some(reader),
            writer: Some(writer),
            armed: false,
            fail_arm: self.fail_arm_for == Some(tid),
            live: Rc::clone(&self.live),
        })
    }
}
