//! 監視セッション

use pwatch_target::channel::validate_ring_size_exponent;
use pwatch_target::{
    BreakpointDescriptor, ChannelOpener, Error, PerfChannel, PerfOpener, ThreadId, TraceChannel,
    WatchRequest,
};
use std::collections::BTreeMap;

use crate::Result;

/// 一部のチャネルで失敗した一括操作
///
/// 成功したチャネルはそのままの状態で残ります。
#[derive(Debug, thiserror::Error)]
#[error("{} of {attempted} channels failed", .failures.len())]
pub struct PartialFailure {
    /// 操作を試みたチャネル数
    pub attempted: usize,
    /// 失敗したスレッドとそのエラー
    pub failures: Vec<(ThreadId, Error)>,
}

impl PartialFailure {
    /// 失敗したスレッド
    pub fn thread_ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.failures.iter().map(|(tid, _)| *tid)
    }
}

/// スレッドIDをキーとするチャネルの集合
///
/// 集合は作成時に確定し、以後は追加も削除もされません。
#[derive(Debug)]
pub struct Session<C: TraceChannel = PerfChannel> {
    channels: BTreeMap<ThreadId, C>,
    descriptor: BreakpointDescriptor,
}

impl Session<PerfChannel> {
    /// 各スレッドにブレークポイントイベントを作成する
    ///
    /// 途中で1つでも失敗した場合、それまでに開いたチャネルをすべて閉じてから
    /// 最初のエラーを返します。
    pub fn create(
        thread_ids: &[ThreadId],
        request: &WatchRequest,
        ring_size_exponent: u32,
    ) -> Result<Self> {
        Self::create_with(&PerfOpener, thread_ids, request, ring_size_exponent)
    }
}

impl<C: TraceChannel> Session<C> {
    /// 指定したオープナーでチャネルを開く
    pub fn create_with<O>(
        opener: &O,
        thread_ids: &[ThreadId],
        request: &WatchRequest,
        ring_size_exponent: u32,
    ) -> Result<Self>
    where
        O: ChannelOpener<Channel = C>,
    {
        if thread_ids.is_empty() {
            return Err(Error::EmptyTargetSet);
        }
        validate_ring_size_exponent(ring_size_exponent)?;
        let descriptor = BreakpointDescriptor::build(request)?;

        let mut channels = BTreeMap::new();
        for &tid in thread_ids {
            if channels.contains_key(&tid) {
                continue;
            }
            match opener.open(tid, &descriptor, ring_size_exponent) {
                Ok(channel) => {
                    channels.insert(tid, channel);
                }
                Err(e) => {
                    tracing::debug!(
                        "opening thread {} failed, rolling back {} channels",
                        tid,
                        channels.len()
                    );
                    for (opened, mut channel) in channels {
                        if let Err(close_err) = channel.close() {
                            tracing::warn!(
                                "rollback close of thread {} failed: {}",
                                opened,
                                close_err
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            "watching 0x{:x} ({} bytes, {}) on {} threads",
            request.address,
            request.len.bytes(),
            request.kind,
            channels.len()
        );

        Ok(Self {
            channels,
            descriptor,
        })
    }

    /// すべてのチャネルを有効化する
    ///
    /// 個々の失敗は集めて返し、残りのチャネルの処理は続けます。
    pub fn enable_all(&mut self) -> std::result::Result<(), PartialFailure> {
        self.for_each_channel(|channel| channel.arm())
    }

    /// すべてのチャネルを無効化する
    ///
    /// 閉じたチャネルは無効化済みとして扱います。
    pub fn disable_all(&mut self) -> std::result::Result<(), PartialFailure> {
        self.for_each_channel(|channel| {
            if channel.is_closed() {
                Ok(())
            } else {
                channel.disarm()
            }
        })
    }

    fn for_each_channel<F>(&mut self, mut op: F) -> std::result::Result<(), PartialFailure>
    where
        F: FnMut(&mut C) -> Result<()>,
    {
        let failures: Vec<(ThreadId, Error)> = self
            .channels
            .iter_mut()
            .filter_map(|(&tid, channel)| op(channel).err().map(|e| (tid, e)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PartialFailure {
                attempted: self.channels.len(),
                failures,
            })
        }
    }

    /// すべてのチャネルを無効化して閉じる
    ///
    /// 解放時の失敗はログに残すだけで、呼び出し元には返しません。
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        for (tid, channel) in self.channels.iter_mut() {
            if channel.is_closed() {
                continue;
            }
            if let Err(e) = channel.disarm() {
                tracing::warn!("failed to disable thread {}: {}", tid, e);
            }
            if let Err(e) = channel.close() {
                tracing::warn!("failed to close thread {}: {}", tid, e);
            }
        }
    }

    /// チャネル数（閉じたものを含む）
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// まだ開いているチャネル数
    pub fn open_count(&self) -> usize {
        self.channels.values().filter(|c| !c.is_closed()).count()
    }

    /// 監視しているスレッド（昇順）
    pub fn thread_ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.channels.keys().copied()
    }

    pub fn channel(&self, tid: ThreadId) -> Option<&C> {
        self.channels.get(&tid)
    }

    pub fn channel_mut(&mut self, tid: ThreadId) -> Option<&mut C> {
        self.channels.get_mut(&tid)
    }

    pub fn channels(&self) -> impl Iterator<Item = &C> {
        self.channels.values()
    }

    /// 全チャネルで共有する記述子
    pub fn descriptor(&self) -> &BreakpointDescriptor {
        &self.descriptor
    }
}

impl<C: TraceChannel> Drop for Session<C> {
    fn drop(&mut self) {
        self.teardown();
    }
}
