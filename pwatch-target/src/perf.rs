//! perf_event_open(2) のABI定義とシステムコールラッパー

use bitfield::bitfield;
use nix::errno::Errno;
use nix::libc;
use nix::{ioctl_write_int_bad, request_code_none};
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

pub const PERF_TYPE_BREAKPOINT: u32 = 5;

pub const HW_BREAKPOINT_R: u32 = 1;
pub const HW_BREAKPOINT_W: u32 = 2;
pub const HW_BREAKPOINT_RW: u32 = HW_BREAKPOINT_R | HW_BREAKPOINT_W;
pub const HW_BREAKPOINT_X: u32 = 4;

pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// PERF_ATTR_SIZE_VER6
pub const PERF_ATTR_SIZE: u32 = 120;

bitfield! {
    /// `perf_event_attr` のフラグワード
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct AttrFlags(u64);
    impl Debug;
    pub disabled, set_disabled: 0, 0;
    pub inherit, set_inherit: 1, 1;
    pub pinned, set_pinned: 2, 2;
    pub exclusive, set_exclusive: 3, 3;
    pub exclude_user, set_exclude_user: 4, 4;
    pub exclude_kernel, set_exclude_kernel: 5, 5;
    pub exclude_hv, set_exclude_hv: 6, 6;
    pub exclude_idle, set_exclude_idle: 7, 7;
    pub mmap, set_mmap: 8, 8;
    pub comm, set_comm: 9, 9;
    pub freq, set_freq: 10, 10;
    pub precise_ip, set_precise_ip: 16, 15;
    pub mmap_data, set_mmap_data: 17, 17;
    pub sample_id_all, set_sample_id_all: 18, 18;
    pub mmap2, set_mmap2: 23, 23;
}

/// `struct perf_event_attr`（VER6 レイアウト）
///
/// 共用体のフィールドはブレークポイントで使う側の名前だけを持ちます。
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: AttrFlags,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub bp_addr: u64,
    pub bp_len: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

impl PerfEventAttr {
    /// `size` だけを設定したゼロ初期化の属性
    pub fn zeroed() -> Self {
        Self {
            size: mem::size_of::<Self>() as u32,
            ..Default::default()
        }
    }
}

/// `struct perf_event_header`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

impl PerfEventHeader {
    pub const SIZE: usize = mem::size_of::<Self>();

    /// ネイティブエンディアンの8バイトから読む
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            type_: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            misc: u16::from_ne_bytes([bytes[4], bytes[5]]),
            size: u16::from_ne_bytes([bytes[6], bytes[7]]),
        }
    }

    /// バイト列に書き出す
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.type_.to_ne_bytes());
        out[4..6].copy_from_slice(&self.misc.to_ne_bytes());
        out[6..8].copy_from_slice(&self.size.to_ne_bytes());
        out
    }
}

/// `struct perf_event_mmap_page` のうちリング操作に使うフィールドのオフセット
pub mod mmap_page {
    pub const DATA_HEAD: usize = 1024;
    pub const DATA_TAIL: usize = 1032;
    pub const DATA_OFFSET: usize = 1040;
    pub const DATA_SIZE: usize = 1048;
}

/// 1つのスレッドに束縛したイベントを作成する
///
/// `cpu = -1`, `group_fd = -1` で、そのスレッドがどのCPUで動いても計測します。
pub fn perf_event_open(
    attr: &PerfEventAttr,
    tid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<OwnedFd, Errno> {
    let fd = Errno::result(unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            tid,
            cpu,
            group_fd,
            flags,
        )
    })?;

    // SAFETY: 成功時の戻り値は新しく作られたファイルディスクリプタ
    Ok(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) })
}

const PERF_EVENT_MAGIC: u8 = b'$';
ioctl_write_int_bad!(perf_event_ioc_enable, request_code_none!(PERF_EVENT_MAGIC, 0));
ioctl_write_int_bad!(perf_event_ioc_disable, request_code_none!(PERF_EVENT_MAGIC, 1));
ioctl_write_int_bad!(perf_event_ioc_reset, request_code_none!(PERF_EVENT_MAGIC, 3));

/// PERF_EVENT_IOC_ENABLE
pub fn enable(fd: BorrowedFd<'_>) -> Result<(), Errno> {
    unsafe { perf_event_ioc_enable(fd.as_raw_fd(), 0) }.map(drop)
}

/// PERF_EVENT_IOC_DISABLE
pub fn disable(fd: BorrowedFd<'_>) -> Result<(), Errno> {
    unsafe { perf_event_ioc_disable(fd.as_raw_fd(), 0) }.map(drop)
}

/// PERF_EVENT_IOC_RESET
pub fn reset(fd: BorrowedFd<'_>) -> Result<(), Errno> {
    unsafe { perf_event_ioc_reset(fd.as_raw_fd(), 0) }.map(drop)
}
