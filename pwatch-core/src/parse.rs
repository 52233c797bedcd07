//! パース関連のユーティリティ関数

use crate::Result;
use pwatch_target::{BreakpointKind, BreakpointLen, Error};

/// アドレス文字列をu64にパース
///
/// 常に16進数として解釈します（`0x` プレフィックスは省略可）。
///
/// # Examples
/// ```
/// use pwatch_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 0x1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    u64::from_str_radix(digits, 16)
        .map_err(|e| Error::invalid(format!("invalid hexadecimal address '{}': {}", s, e)))
}

/// アクセス種別をパース（`r`, `w`, `rw`, `x`）
pub fn parse_kind(s: &str) -> Result<BreakpointKind> {
    s.parse()
}

/// 監視長を10進数のバイト数としてパース
pub fn parse_len(s: &str) -> Result<BreakpointLen> {
    let s = s.trim();
    let bytes = s
        .parse::<u64>()
        .map_err(|e| Error::invalid(format!("invalid length '{}': {}", s, e)))?;
    BreakpointLen::try_from(bytes)
}
