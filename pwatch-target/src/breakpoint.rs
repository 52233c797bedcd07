//! ハードウェアブレークポイントの記述子

use crate::perf::{self, PerfEventAttr};
use crate::registers::Arch;
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// アクセスの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Read,
    Write,
    ReadWrite,
    Execute,
}

impl BreakpointKind {
    /// `bp_type` の値
    pub fn bp_type(self) -> u32 {
        match self {
            BreakpointKind::Read => perf::HW_BREAKPOINT_R,
            BreakpointKind::Write => perf::HW_BREAKPOINT_W,
            BreakpointKind::ReadWrite => perf::HW_BREAKPOINT_RW,
            BreakpointKind::Execute => perf::HW_BREAKPOINT_X,
        }
    }
}

impl FromStr for BreakpointKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" | "read" => Ok(BreakpointKind::Read),
            "w" | "write" => Ok(BreakpointKind::Write),
            "rw" | "wr" | "readwrite" | "read-write" => Ok(BreakpointKind::ReadWrite),
            "x" | "exec" | "execute" => Ok(BreakpointKind::Execute),
            other => Err(Error::invalid(format!("unknown access kind '{}'", other))),
        }
    }
}

impl fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakpointKind::Read => "r",
            BreakpointKind::Write => "w",
            BreakpointKind::ReadWrite => "rw",
            BreakpointKind::Execute => "x",
        };
        f.write_str(s)
    }
}

/// 監視するバイト数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointLen {
    Len1,
    Len2,
    Len4,
    Len8,
}

impl BreakpointLen {
    /// バイト数
    pub fn bytes(self) -> u64 {
        match self {
            BreakpointLen::Len1 => 1,
            BreakpointLen::Len2 => 2,
            BreakpointLen::Len4 => 4,
            BreakpointLen::Len8 => 8,
        }
    }
}

impl TryFrom<u64> for BreakpointLen {
    type Error = Error;

    fn try_from(bytes: u64) -> Result<Self> {
        match bytes {
            1 => Ok(BreakpointLen::Len1),
            2 => Ok(BreakpointLen::Len2),
            4 => Ok(BreakpointLen::Len4),
            8 => Ok(BreakpointLen::Len8),
            other => Err(Error::invalid(format!(
                "breakpoint length must be 1, 2, 4 or 8 bytes, got {}",
                other
            ))),
        }
    }
}

/// 監視要求
///
/// セッション作成後は変更できません。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    pub address: u64,
    pub len: BreakpointLen,
    pub kind: BreakpointKind,
    pub arch: Arch,
}

impl WatchRequest {
    /// 監視要求を作成する
    pub fn new(address: u64, len: BreakpointLen, kind: BreakpointKind, arch: Arch) -> Self {
        Self {
            address,
            len,
            kind,
            arch,
        }
    }
}

/// `perf_event_open` に渡すブレークポイント記述子
#[derive(Debug, Clone)]
pub struct BreakpointDescriptor {
    attr: PerfEventAttr,
    arch: Arch,
}

impl BreakpointDescriptor {
    /// 監視要求から記述子を組み立てる
    ///
    /// 毎回のアクセスでサンプルを取り（period 1）、1件ごとに起床させ、
    /// カーネルとハイパーバイザでのアクセスは除外します。
    /// サンプルにはTIDとユーザーレジスタを含め、mmap/commレコードも要求します。
    /// イベントは無効状態で作られ、`arm` で有効化されます。
    pub fn build(request: &WatchRequest) -> Result<Self> {
        let bytes = request.len.bytes();
        if !request.arch.supports(request.kind) {
            return Err(Error::invalid(format!(
                "{} breakpoint unit cannot watch '{}' accesses",
                request.arch.name(),
                request.kind
            )));
        }
        match request.kind {
            BreakpointKind::Execute => {
                if request.len != request.arch.exec_len() {
                    return Err(Error::invalid(format!(
                        "execute breakpoints on {} must be {} bytes long",
                        request.arch.name(),
                        request.arch.exec_len().bytes()
                    )));
                }
            }
            _ => {
                if request.address % bytes != 0 {
                    return Err(Error::invalid(format!(
                        "address 0x{:x} is not aligned to {} bytes",
                        request.address, bytes
                    )));
                }
            }
        }

        let mut attr = PerfEventAttr::zeroed();
        attr.type_ = perf::PERF_TYPE_BREAKPOINT;
        attr.config = 0;
        attr.sample_type = perf::PERF_SAMPLE_TID | perf::PERF_SAMPLE_REGS_USER;
        attr.sample_period = 1;
        attr.wakeup_events = 1;
        attr.sample_regs_user = request.arch.regs_mask();

        attr.flags.set_disabled(1);
        attr.flags.set_exclude_kernel(1);
        attr.flags.set_exclude_hv(1);
        attr.flags.set_precise_ip(2);
        attr.flags.set_mmap(1);
        attr.flags.set_comm(1);
        attr.flags.set_mmap_data(1);
        attr.flags.set_mmap2(1);

        attr.bp_type = request.kind.bp_type();
        attr.bp_addr = request.address;
        attr.bp_len = bytes;

        Ok(Self {
            attr,
            arch: request.arch.clone(),
        })
    }

    /// カーネルに渡す属性
    pub fn attr(&self) -> &PerfEventAttr {
        &self.attr
    }

    /// サンプルのデコードに使うレジスタ構成
    pub fn arch(&self) -> &Arch {
        &self.arch
    }

    /// サンプル1件のレジスタ数
    pub fn register_count(&self) -> usize {
        self.arch.register_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(address: u64, len: u64, kind: BreakpointKind) -> WatchRequest {
        WatchRequest::new(
            address,
            BreakpointLen::try_from(len).unwrap(),
            kind,
            Arch::aarch64(),
        )
    }

    #[test]
    fn test_descriptor_fields() {
        let desc =
            BreakpointDescriptor::build(&request(0x1000, 4, BreakpointKind::Write)).unwrap();
        let attr = desc.attr();

        assert_eq!(attr.type_, perf::PERF_TYPE_BREAKPOINT);
        assert_eq!(attr.size, perf::PERF_ATTR_SIZE);
        assert_eq!(attr.bp_type, perf::HW_BREAKPOINT_W);
        assert_eq!(attr.bp_addr, 0x1000);
        assert_eq!(attr.bp_len, 4);
        assert_eq!(attr.sample_period, 1);
        assert_eq!(attr.wakeup_events, 1);
        assert_eq!(
            attr.sample_type,
            perf::PERF_SAMPLE_TID | perf::PERF_SAMPLE_REGS_USER
        );
        assert_eq!(attr.sample_regs_user, (1 << 33) - 1);

        assert_eq!(attr.flags.disabled(), 1);
        assert_eq!(attr.flags.exclude_kernel(), 1);
        assert_eq!(attr.flags.exclude_hv(), 1);
        assert_eq!(attr.flags.exclude_user(), 0);
        assert_eq!(attr.flags.precise_ip(), 2);
        assert_eq!(attr.flags.mmap(), 1);
        assert_eq!(attr.flags.comm(), 1);
        assert_eq!(attr.flags.mmap_data(), 1);
        assert_eq!(attr.flags.mmap2(), 1);
        assert_eq!(desc.register_count(), 33);
    }

    #[test]
    fn test_kind_maps_to_bp_type() {
        for (kind, bp_type) in [
            (BreakpointKind::Read, 1),
            (BreakpointKind::Write, 2),
            (BreakpointKind::ReadWrite, 3),
        ] {
            let desc = BreakpointDescriptor::build(&request(0x2000, 8, kind)).unwrap();
            assert_eq!(desc.attr().bp_type, bp_type);
        }
        let desc =
            BreakpointDescriptor::build(&request(0x2000, 4, BreakpointKind::Execute)).unwrap();
        assert_eq!(desc.attr().bp_type, 4);
    }

    #[test]
    fn test_rejects_unaligned_address() {
        let err = BreakpointDescriptor::build(&request(0x1002, 4, BreakpointKind::Write))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
        assert!(BreakpointDescriptor::build(&request(0x1003, 1, BreakpointKind::Read)).is_ok());
    }

    #[test]
    fn test_rejects_wrong_execute_length() {
        let err = BreakpointDescriptor::build(&request(0x1000, 8, BreakpointKind::Execute))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));

        let x86 = WatchRequest::new(
            0x1000,
            BreakpointLen::Len8,
            BreakpointKind::Execute,
            Arch::x86_64(),
        );
        assert!(BreakpointDescriptor::build(&x86).is_ok());
    }

    #[test]
    fn test_rejects_kind_unsupported_by_arch() {
        // x86 のデバッグレジスタは読み取りだけを監視できない
        for len in [
            BreakpointLen::Len1,
            BreakpointLen::Len2,
            BreakpointLen::Len4,
            BreakpointLen::Len8,
        ] {
            let read = WatchRequest::new(0x1000, len, BreakpointKind::Read, Arch::x86_64());
            let err = BreakpointDescriptor::build(&read).unwrap_err();
            assert!(matches!(err, Error::InvalidParameter(_)));

            let read_write =
                WatchRequest::new(0x1000, len, BreakpointKind::ReadWrite, Arch::x86_64());
            assert!(BreakpointDescriptor::build(&read_write).is_ok());
        }

        let restricted = Arch::aarch64().with_supported_kinds(&[BreakpointKind::Write]);
        let exec = WatchRequest::new(
            0x1000,
            BreakpointLen::Len4,
            BreakpointKind::Execute,
            restricted,
        );
        assert!(matches!(
            BreakpointDescriptor::build(&exec),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_parse_len_and_kind() {
        assert!(BreakpointLen::try_from(3).is_err());
        assert_eq!(BreakpointLen::try_from(8).unwrap(), BreakpointLen::Len8);
        assert_eq!("W".parse::<BreakpointKind>().unwrap(), BreakpointKind::Write);
        assert_eq!(
            "rw".parse::<BreakpointKind>().unwrap(),
            BreakpointKind::ReadWrite
        );
        assert_eq!(
            "exec".parse::<BreakpointKind>().unwrap(),
            BreakpointKind::Execute
        );
        assert!("z".parse::<BreakpointKind>().is_err());
        assert_eq!(BreakpointKind::ReadWrite.to_string(), "rw");
    }
}
