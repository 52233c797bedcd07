//! サンプルリングのデコード
//!
//! マッピングの先頭ページ（コントロールページ）にカーネルが書く `data_head` と
//! トレーサが書く `data_tail` が並び、その後ろに `2^n` ページのデータリングが続きます。
//!
//! ```text
//! +0        perf_event_mmap_page { ..., data_head @1024, data_tail @1032,
//!                                  data_offset @1040, data_size @1048 }
//! +page     data[data_size]   レコードは data_head まで有効
//! ```
//!
//! `data_head` はAcquireで読み、処理を終えた位置をReleaseで `data_tail` に書きます。
//! カーソルは64ビットで単調増加し、リング内の位置は `cursor & (data_size - 1)` です。

use crate::memory::MmapRegion;
use crate::perf::{mmap_page, PerfEventHeader, PERF_RECORD_LOST, PERF_RECORD_SAMPLE};
use crate::registers::{Abi, SampleData};
use crate::{Error, Result};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// サンプルレコード内のフィールド位置（TID | REGS_USER の宣言順）
mod sample_layout {
    pub const PID: u64 = 8;
    pub const TID: u64 = 12;
    pub const ABI: u64 = 16;
    pub const REGS: u64 = 24;
}

/// LOSTレコードの `lost` フィールド位置
const LOST_COUNT: u64 = 16;

/// 1回のドレインの集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// ハンドラに渡したサンプル数
    pub samples: usize,
    /// 読み飛ばしたサンプル以外のレコード数
    pub skipped: usize,
    /// LOSTレコードが報告した欠落数
    pub lost: u64,
    /// 不正なデータとして捨てたバイト数
    pub discarded_bytes: u64,
}

impl DrainStats {
    pub fn merge(&mut self, other: &DrainStats) {
        self.samples += other.samples;
        self.skipped += other.skipped;
        self.lost += other.lost;
        self.discarded_bytes += other.discarded_bytes;
    }
}

/// データリング上の境界付きカーソル
///
/// 現在位置から、ドレイン開始時に取得したプロデューサカーソルまでしか読めません。
#[derive(Debug)]
pub struct RingCursor {
    data: *const u8,
    capacity: u64,
    position: u64,
    end: u64,
}

impl RingCursor {
    /// カーソルを作成する
    ///
    /// `end - position` がリング容量を超える場合は `None` を返します。
    ///
    /// # Safety
    /// `data` は `capacity` バイト読み取り可能で、カーソルの使用中は有効でなければなりません。
    /// `capacity` は2のべき乗です。
    pub unsafe fn new(data: *const u8, capacity: usize, position: u64, end: u64) -> Option<Self> {
        debug_assert!(capacity.is_power_of_two());
        if end.wrapping_sub(position) > capacity as u64 {
            return None;
        }
        Some(Self {
            data,
            capacity: capacity as u64,
            position,
            end,
        })
    }

    /// 現在位置（64ビットカーソル値）
    pub fn position(&self) -> u64 {
        self.position
    }

    /// 読み取り可能な残りバイト数
    pub fn remaining(&self) -> u64 {
        self.end.wrapping_sub(self.position)
    }

    /// 現在位置から `offset` バイト先を `out` にコピーする
    ///
    /// 終端を越える読み取りは行わず `false` を返します。
    pub fn read_at(&self, offset: u64, out: &mut [u8]) -> bool {
        let len = out.len() as u64;
        match offset.checked_add(len) {
            Some(last) if last <= self.remaining() => {}
            _ => return false,
        }

        let start = (self.position.wrapping_add(offset) & (self.capacity - 1)) as usize;
        let first = (self.capacity as usize - start).min(out.len());
        // SAFETY: start + first <= capacity, 折り返し分は先頭から out.len() - first <= capacity
        unsafe {
            ptr::copy_nonoverlapping(self.data.add(start), out.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.data, out.as_mut_ptr().add(first), out.len() - first);
        }
        true
    }

    pub fn read_u32_at(&self, offset: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf).then(|| u32::from_ne_bytes(buf))
    }

    pub fn read_u64_at(&self, offset: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.read_at(offset, &mut buf).then(|| u64::from_ne_bytes(buf))
    }

    /// 現在位置のレコードヘッダ
    pub fn header(&self) -> Option<PerfEventHeader> {
        let mut buf = [0u8; PerfEventHeader::SIZE];
        self.read_at(0, &mut buf)
            .then(|| PerfEventHeader::from_bytes(buf))
    }

    /// `len` バイト進める
    pub fn advance(&mut self, len: u64) -> bool {
        if len > self.remaining() {
            return false;
        }
        self.position = self.position.wrapping_add(len);
        true
    }

    /// 終端まで進め、捨てたバイト数を返す
    pub fn skip_to_end(&mut self) -> u64 {
        let skipped = self.remaining();
        self.position = self.end;
        skipped
    }
}

/// 1チャネル分のマップ済みリング
#[derive(Debug)]
pub struct RingBuffer {
    region: MmapRegion,
    data_offset: usize,
    data_size: usize,
    read_offset: u64,
    reg_count: usize,
    scratch: Vec<u8>,
    regs: Vec<u64>,
}

impl RingBuffer {
    /// マップ済み領域からリングを作る
    ///
    /// データ領域の位置と大きさはコントロールページから読み、
    /// 0 の場合は1ページ目以降の全体を使います。
    pub fn new(region: MmapRegion, page_size: usize, reg_count: usize) -> Result<Self> {
        if region.len() < page_size * 2 || region.len() < mmap_page::DATA_SIZE + 8 {
            return Err(Error::invalid(format!(
                "ring mapping of {} bytes is too small",
                region.len()
            )));
        }

        let base = region.as_ptr();
        // SAFETY: 領域はコントロールページ全体を含む
        let (offset, size) = unsafe {
            (
                ptr::read_volatile(base.add(mmap_page::DATA_OFFSET) as *const u64) as usize,
                ptr::read_volatile(base.add(mmap_page::DATA_SIZE) as *const u64) as usize,
            )
        };
        let (data_offset, data_size) = if size == 0 {
            (page_size, region.len() - page_size)
        } else {
            (offset, size)
        };

        if !data_size.is_power_of_two()
            || data_offset < mmap_page::DATA_SIZE + 8
            || data_offset.checked_add(data_size).map_or(true, |end| end > region.len())
        {
            return Err(Error::invalid(format!(
                "bad ring geometry: offset {} size {} in {} bytes",
                data_offset,
                data_size,
                region.len()
            )));
        }

        let mut ring = Self {
            region,
            data_offset,
            data_size,
            read_offset: 0,
            reg_count,
            scratch: Vec::with_capacity(reg_count * 8),
            regs: Vec::with_capacity(reg_count),
        };
        ring.read_offset = ring.cursor_field(mmap_page::DATA_TAIL).load(Ordering::Acquire);
        Ok(ring)
    }

    fn cursor_field(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: ページ先頭からの8バイト境界で、領域の寿命はselfと同じ
        unsafe { &*(self.region.as_ptr().add(offset) as *const AtomicU64) }
    }

    /// カーネルが公開したプロデューサカーソル（Acquire）
    pub fn producer_cursor(&self) -> u64 {
        self.cursor_field(mmap_page::DATA_HEAD).load(Ordering::Acquire)
    }

    /// コントロールページに公開済みのコンシューマカーソル
    pub fn consumer_cursor(&self) -> u64 {
        self.cursor_field(mmap_page::DATA_TAIL).load(Ordering::Acquire)
    }

    /// ローカルの読み取りオフセット
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// データリングのバイト数
    pub fn capacity(&self) -> usize {
        self.data_size
    }

    /// 未読のバイト数
    pub fn pending(&self) -> u64 {
        self.producer_cursor().wrapping_sub(self.read_offset)
    }

    #[cfg(any(test, feature = "synthetic"))]
    pub(crate) fn region(&self) -> &MmapRegion {
        &self.region
    }

    #[cfg(any(test, feature = "synthetic"))]
    pub(crate) fn data_offset(&self) -> usize {
        self.data_offset
    }

    fn publish(&mut self, offset: u64) {
        self.read_offset = offset;
        self.cursor_field(mmap_page::DATA_TAIL)
            .store(offset, Ordering::Release);
    }

    /// 現在読めるレコードをすべてデコードする
    ///
    /// 開始時のプロデューサカーソルまでを処理し、最後に読み取り位置を
    /// `data_tail` に公開します。サンプルレコードごとに `emit` を呼びます。
    pub fn drain<F>(&mut self, mut emit: F) -> DrainStats
    where
        F: FnMut(&SampleData<'_>),
    {
        let head = self.producer_cursor();
        let start = self.read_offset;
        let mut stats = DrainStats::default();

        // SAFETY: データ領域は data_offset から data_size バイト
        let cursor = unsafe {
            RingCursor::new(
                self.region.as_ptr().add(self.data_offset),
                self.data_size,
                start,
                head,
            )
        };
        let mut cursor = match cursor {
            Some(cursor) => cursor,
            None => {
                tracing::warn!(
                    "producer cursor {} is more than {} bytes ahead of {}, resynchronizing",
                    head,
                    self.data_size,
                    start
                );
                stats.discarded_bytes = head.wrapping_sub(start);
                self.publish(head);
                return stats;
            }
        };

        while cursor.remaining() > 0 {
            let header = match cursor.header() {
                Some(h)
                    if h.size as usize >= PerfEventHeader::SIZE
                        && h.size as u64 <= cursor.remaining() =>
                {
                    h
                }
                other => {
                    tracing::warn!(
                        "malformed record header {:?} at {} ({} bytes left), dropping rest of ring",
                        other,
                        cursor.position(),
                        cursor.remaining()
                    );
                    stats.discarded_bytes += cursor.skip_to_end();
                    break;
                }
            };
            let size = header.size as u64;

            match header.type_ {
                PERF_RECORD_SAMPLE => {
                    let decoded = decode_sample(
                        &cursor,
                        size,
                        self.reg_count,
                        &mut self.scratch,
                        &mut self.regs,
                    );
                    match decoded {
                        Some((pid, tid, abi)) => {
                            let sample = SampleData {
                                pid,
                                tid,
                                abi,
                                regs: &self.regs,
                            };
                            emit(&sample);
                            stats.samples += 1;
                        }
                        None => {
                            tracing::warn!(
                                "sample record of {} bytes at {} is too short for {} registers",
                                size,
                                cursor.position(),
                                self.reg_count
                            );
                            stats.discarded_bytes += cursor.skip_to_end();
                            break;
                        }
                    }
                }
                PERF_RECORD_LOST => {
                    let lost = cursor
                        .read_u64_at(LOST_COUNT)
                        .filter(|_| size >= LOST_COUNT + 8);
                    if let Some(lost) = lost {
                        tracing::warn!("kernel dropped {} samples", lost);
                        stats.lost += lost;
                    }
                    stats.skipped += 1;
                }
                other => {
                    tracing::trace!("skipping record type {} ({} bytes)", other, size);
                    stats.skipped += 1;
                }
            }

            cursor.advance(size);
        }

        self.publish(cursor.position());
        stats
    }
}

/// サンプルレコードを位置順にデコードする
///
/// header, pid, tid, abi, regs[reg_count] の順に並びます。
fn decode_sample(
    cursor: &RingCursor,
    size: u64,
    reg_count: usize,
    scratch: &mut Vec<u8>,
    regs: &mut Vec<u64>,
) -> Option<(u32, u32, Abi)> {
    if size < sample_layout::REGS {
        return None;
    }
    let pid = cursor.read_u32_at(sample_layout::PID)?;
    let tid = cursor.read_u32_at(sample_layout::TID)?;
    let abi = Abi::from(cursor.read_u64_at(sample_layout::ABI)?);

    regs.clear();
    if abi.has_registers() {
        let bytes = reg_count * 8;
        if sample_layout::REGS + bytes as u64 > size {
            return None;
        }
        scratch.resize(bytes, 0);
        if !cursor.read_at(sample_layout::REGS, scratch) {
            return None;
        }
        regs.extend(scratch.chunks_exact(8).map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_ne_bytes(word)
        }));
    }

    Some((pid, tid, abi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticRing;

    const REGS: usize = 33;

    fn regs_for(seed: u64) -> Vec<u64> {
        (0..REGS as u64).map(|i| seed * 1000 + i).collect()
    }

    fn sample_size(regs: usize) -> u64 {
        24 + 8 * regs as u64
    }

    #[test]
    fn test_cursor_wraps_reads() {
        let data: Vec<u8> = (0u8..16).collect();
        let mut cursor = unsafe { RingCursor::new(data.as_ptr(), 16, 12, 20) }.unwrap();
        let mut out = [0u8; 6];
        assert!(cursor.read_at(0, &mut out));
        assert_eq!(out, [12, 13, 14, 15, 0, 1]);
        assert!(!cursor.read_at(4, &mut out));
        assert_eq!(cursor.remaining(), 8);

        assert!(cursor.advance(6));
        assert_eq!(cursor.position(), 18);
        assert_eq!(cursor.read_u32_at(0), None);
        assert!(!cursor.advance(3));
        assert_eq!(cursor.skip_to_end(), 2);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_cursor_handles_u64_wraparound() {
        let data = [7u8; 8];
        let cursor = unsafe { RingCursor::new(data.as_ptr(), 8, u64::MAX - 3, 4) }.unwrap();
        assert_eq!(cursor.remaining(), 8);
        assert_eq!(cursor.read_u64_at(0), Some(u64::from_ne_bytes([7; 8])));
    }

    #[test]
    fn test_cursor_rejects_distance_beyond_capacity() {
        let data = [0u8; 8];
        assert!(unsafe { RingCursor::new(data.as_ptr(), 8, 0, 9) }.is_none());
    }

    #[test]
    fn test_drain_yields_samples_in_order() {
        let mut ring = SyntheticRing::new(1, REGS).unwrap();
        for i in 0..5u64 {
            assert!(ring.push_sample(100, 200 + i as u32, 2, &regs_for(i)));
        }

        let mut seen = Vec::new();
        let stats = ring.ring_mut().drain(|s| {
            seen.push((s.pid, s.tid, s.abi, s.regs.to_vec()));
        });

        assert_eq!(stats.samples, 5);
        assert_eq!(seen.len(), 5);
        for (i, (pid, tid, abi, regs)) in seen.iter().enumerate() {
            assert_eq!(*pid, 100);
            assert_eq!(*tid, 200 + i as u32);
            assert_eq!(*abi, Abi::Bits64);
            assert_eq!(regs, &regs_for(i as u64));
        }

        let consumed = 5 * sample_size(REGS);
        assert_eq!(ring.ring().read_offset(), consumed);
        assert_eq!(ring.ring().consumer_cursor(), consumed);
        assert_eq!(ring.ring().pending(), 0);
    }

    #[test]
    fn test_sample_then_other_record() {
        let mut ring = SyntheticRing::new(0, REGS).unwrap();
        ring.push_sample(1, 2, 2, &regs_for(3));
        // PERF_RECORD_COMM
        ring.push_record(3, b"pid\0tid\0worker\0\0");

        let mut count = 0;
        let stats = ring.ring_mut().drain(|_| count += 1);

        assert_eq!(count, 1);
        assert_eq!(stats.skipped, 1);
        let expected = sample_size(REGS) + 8 + 16;
        assert_eq!(ring.ring().read_offset(), expected);
        assert_eq!(ring.ring().consumer_cursor(), expected);
    }

    #[test]
    fn test_drain_across_wraparound() {
        // 1ページのリングに何周も書く
        let mut ring = SyntheticRing::new(0, REGS).unwrap();
        let capacity = ring.ring().capacity() as u64;
        let per_round = (capacity / sample_size(REGS)) as usize;
        let mut total = 0u64;
        let mut tids = Vec::new();

        for round in 0..4u64 {
            for i in 0..per_round as u64 {
                assert!(ring.push_sample(9, (round * 1000 + i) as u32, 2, &regs_for(i)));
            }
            let stats = ring.ring_mut().drain(|s| {
                assert_eq!(s.regs, regs_for(s.tid as u64 % 1000).as_slice());
                tids.push(s.tid);
            });
            assert_eq!(stats.samples, per_round);
            total += per_round as u64 * sample_size(REGS);
            assert_eq!(ring.ring().read_offset(), total);
            assert_eq!(ring.ring().consumer_cursor(), total);
        }
        assert!(total > capacity);
        assert_eq!(tids.len(), per_round * 4);
    }

    #[test]
    fn test_cursor_starting_near_u64_max() {
        let start = u64::MAX - 100;
        let mut ring = SyntheticRing::starting_at(0, REGS, start).unwrap();
        ring.push_sample(1, 1, 2, &regs_for(1));
        ring.push_sample(1, 2, 2, &regs_for(2));

        let stats = ring.ring_mut().drain(|_| {});
        assert_eq!(stats.samples, 2);
        assert_eq!(
            ring.ring().read_offset(),
            start.wrapping_add(2 * sample_size(REGS))
        );
    }

    #[test]
    fn test_producer_cursor_is_captured_at_start() {
        let mut ring = SyntheticRing::new(1, REGS).unwrap();
        ring.push_sample(1, 1, 2, &regs_for(1));

        let mut seen = 0;
        let stats = ring.ring_mut().drain(|_| seen += 1);
        assert_eq!(stats.samples, 1);

        ring.push_sample(1, 2, 2, &regs_for(2));
        assert_eq!(ring.ring().pending(), sample_size(REGS));
        let stats = ring.ring_mut().drain(|s| assert_eq!(s.tid, 2));
        assert_eq!(stats.samples, 1);
    }

    #[test]
    fn test_abi_none_has_no_registers() {
        let mut ring = SyntheticRing::new(0, REGS).unwrap();
        ring.push_sample(5, 6, 0, &[]);
        ring.push_sample(5, 7, 2, &regs_for(7));

        let mut seen = Vec::new();
        ring.ring_mut().drain(|s| seen.push((s.tid, s.abi, s.regs.len())));
        assert_eq!(seen, vec![(6, Abi::None, 0), (7, Abi::Bits64, REGS)]);
        assert_eq!(ring.ring().read_offset(), 24 + sample_size(REGS));
    }

    #[test]
    fn test_lost_records_are_counted() {
        let mut ring = SyntheticRing::new(0, REGS).unwrap();
        ring.push_lost(17);
        ring.push_sample(1, 1, 2, &regs_for(0));

        let stats = ring.ring_mut().drain(|_| {});
        assert_eq!(stats.lost, 17);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.samples, 1);
    }

    #[test]
    fn test_short_sample_stops_decoding() {
        let mut ring = SyntheticRing::new(0, REGS).unwrap();
        ring.push_sample(1, 1, 2, &regs_for(0));
        // 4レジスタ分しかないサンプル
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_ne_bytes());
        payload.extend_from_slice(&2u32.to_ne_bytes());
        payload.extend_from_slice(&2u64.to_ne_bytes());
        for r in 0..4u64 {
            payload.extend_from_slice(&r.to_ne_bytes());
        }
        ring.push_record(PERF_RECORD_SAMPLE, &payload);
        ring.push_sample(1, 3, 2, &regs_for(3));

        let mut tids = Vec::new();
        let stats = ring.ring_mut().drain(|s| tids.push(s.tid));

        assert_eq!(tids, vec![1]);
        assert_eq!(stats.discarded_bytes, 8 + 48 + sample_size(REGS));
        assert_eq!(ring.ring().pending(), 0);
        assert_eq!(ring.ring().consumer_cursor(), ring.ring().producer_cursor());
    }

    #[test]
    fn test_zero_sized_header_is_malformed() {
        let mut ring = SyntheticRing::new(0, REGS).unwrap();
        let header = PerfEventHeader {
            type_: PERF_RECORD_SAMPLE,
            misc: 0,
            size: 0,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        ring.push_raw(&bytes);

        let mut count = 0;
        let stats = ring.ring_mut().drain(|_| count += 1);
        assert_eq!(count, 0);
        assert_eq!(stats.discarded_bytes, 16);
        assert_eq!(ring.ring().read_offset(), 16);
    }

    #[test]
    fn test_record_past_producer_cursor_is_malformed() {
        let mut ring = SyntheticRing::new(0, REGS).unwrap();
        let header = PerfEventHeader {
            type_: PERF_RECORD_SAMPLE,
            misc: 0,
            size: 64,
        };
        ring.push_raw(&header.to_bytes());

        let stats = ring.ring_mut().drain(|_| panic!("no sample expected"));
        assert_eq!(stats.discarded_bytes, 8);
        assert_eq!(ring.ring().read_offset(), 8);
    }

    #[test]
    fn test_overrun_resynchronizes() {
        let mut ring = SyntheticRing::new(0, REGS).unwrap();
        let capacity = ring.ring().capacity() as u64;
        ring.force_producer_cursor(capacity + 64);

        let stats = ring.ring_mut().drain(|_| panic!("no sample expected"));
        assert_eq!(stats.discarded_bytes, capacity + 64);
        assert_eq!(ring.ring().read_offset(), capacity + 64);
        assert_eq!(ring.ring().consumer_cursor(), capacity + 64);
    }

    #[test]
    fn test_empty_ring_publishes_nothing_new() {
        let mut ring = SyntheticRing::new(0, REGS).unwrap();
        let stats = ring.ring_mut().drain(|_| {});
        assert_eq!(stats, DrainStats::default());
        assert_eq!(ring.ring().consumer_cursor(), 0);
    }
}
