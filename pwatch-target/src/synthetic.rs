//! カーネルの代わりにサンプルリングへ書き込むプロデューサ
//!
//! 匿名メモリにコントロールページとデータリングを作り、
//! perfと同じ形式のレコードを書いて `data_head` をReleaseで公開します。
//! 権限なしでリングのデコードやイベントループを試すためのものです。

use crate::memory::{page_size, MmapRegion};
use crate::perf::{mmap_page, PerfEventHeader, PERF_RECORD_LOST, PERF_RECORD_SAMPLE};
use crate::ring::RingBuffer;
use crate::{Error, Result};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// 合成リング
#[derive(Debug)]
pub struct SyntheticRing {
    ring: RingBuffer,
}

impl SyntheticRing {
    /// `2^ring_size_exponent` ページのリングを作る
    pub fn new(ring_size_exponent: u32, reg_count: usize) -> Result<Self> {
        Self::starting_at(ring_size_exponent, reg_count, 0)
    }

    /// プロデューサ/コンシューマカーソルを `start` から始める
    pub fn starting_at(ring_size_exponent: u32, reg_count: usize, start: u64) -> Result<Self> {
        let page = page_size();
        let data_size = page << ring_size_exponent;
        let region = MmapRegion::anonymous(page + data_size)
            .map_err(|source| Error::MappingFailed { tid: 0, source })?;

        // SAFETY: 領域は少なくとも2ページあり、各フィールドは8バイト境界
        unsafe {
            let base = region.as_ptr();
            ptr::write_volatile(base.add(mmap_page::DATA_OFFSET) as *mut u64, page as u64);
            ptr::write_volatile(base.add(mmap_page::DATA_SIZE) as *mut u64, data_size as u64);
            ptr::write_volatile(base.add(mmap_page::DATA_HEAD) as *mut u64, start);
            ptr::write_volatile(base.add(mmap_page::DATA_TAIL) as *mut u64, start);
        }

        Ok(Self {
            ring: RingBuffer::new(region, page, reg_count)?,
        })
    }

    /// コンシューマ側のリング
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut RingBuffer {
        &mut self.ring
    }

    pub fn into_ring(self) -> RingBuffer {
        self.ring
    }

    fn head(&self) -> &AtomicU64 {
        // SAFETY: data_head はコントロールページ内の8バイト境界
        unsafe { &*(self.ring.region().as_ptr().add(mmap_page::DATA_HEAD) as *const AtomicU64) }
    }

    /// 現在のプロデューサカーソル
    pub fn producer_cursor(&self) -> u64 {
        self.head().load(Ordering::Acquire)
    }

    /// プロデューサカーソルを書き換える（内容は書かない）
    pub fn force_producer_cursor(&self, value: u64) {
        self.head().store(value, Ordering::Release);
    }

    /// サンプルレコードを書く
    ///
    /// `abi` が0のときはレジスタ配列を書きません。
    pub fn push_sample(&mut self, pid: u32, tid: u32, abi: u64, regs: &[u64]) -> bool {
        let mut payload = Vec::with_capacity(16 + regs.len() * 8);
        payload.extend_from_slice(&pid.to_ne_bytes());
        payload.extend_from_slice(&tid.to_ne_bytes());
        payload.extend_from_slice(&abi.to_ne_bytes());
        if abi != 0 {
            for reg in regs {
                payload.extend_from_slice(&reg.to_ne_bytes());
            }
        }
        self.push_record(PERF_RECORD_SAMPLE, &payload)
    }

    /// LOSTレコードを書く
    pub fn push_lost(&mut self, lost: u64) -> bool {
        let mut payload = [0u8; 16];
        payload[8..].copy_from_slice(&lost.to_ne_bytes());
        self.push_record(PERF_RECORD_LOST, &payload)
    }

    /// 任意の種類のレコードを書く
    pub fn push_record(&mut self, type_: u32, payload: &[u8]) -> bool {
        let size = PerfEventHeader::SIZE + payload.len();
        let Ok(size16) = u16::try_from(size) else {
            return false;
        };
        let header = PerfEventHeader {
            type_,
            misc: 0,
            size: size16,
        };
        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(payload);
        self.push_raw(&bytes)
    }

    /// バイト列をそのまま書いて公開する
    ///
    /// 未読データを上書きする場合は書かずに `false` を返します。
    pub fn push_raw(&mut self, bytes: &[u8]) -> bool {
        let capacity = self.ring.capacity() as u64;
        let head = self.head().load(Ordering::Relaxed);
        let tail = self.ring.consumer_cursor();
        if head.wrapping_sub(tail) + bytes.len() as u64 > capacity {
            return false;
        }

        let start = (head & (capacity - 1)) as usize;
        let first = (capacity as usize - start).min(bytes.len());
        // SAFETY: データ領域は data_offset から capacity バイト
        unsafe {
            let data = self.ring.region().as_ptr().add(self.ring.data_offset());
            ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(start), first);
            ptr::copy_nonoverlapping(bytes.as_ptr().add(first), data, bytes.len() - first);
        }

        self.head()
            .store(head.wrapping_add(bytes.len() as u64), Ordering::Release);
        true
    }
}
