//! レジスタファイルの構成とサンプルデータ

use crate::breakpoint::{BreakpointKind, BreakpointLen};
use crate::{Error, Result};

/// `PERF_SAMPLE_REGS_ABI_*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    /// レジスタが採取されなかった（レジスタ配列は続かない）
    None,
    /// 32ビット（互換）呼び出し規約
    Bits32,
    /// ネイティブ64ビット呼び出し規約
    Bits64,
    /// 未知の値
    Unknown(u64),
}

impl From<u64> for Abi {
    fn from(raw: u64) -> Self {
        match raw {
            0 => Abi::None,
            1 => Abi::Bits32,
            2 => Abi::Bits64,
            other => Abi::Unknown(other),
        }
    }
}

impl Abi {
    /// レジスタ配列がサンプルに含まれるか
    pub fn has_registers(self) -> bool {
        self != Abi::None
    }
}

/// アーキテクチャごとのレジスタファイル構成
///
/// `sample_regs_user` に渡すビットマスクと、サンプル内に並ぶレジスタの名前を
/// 同じ順序（ビット番号の昇順）で保持します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arch {
    name: String,
    names: Vec<String>,
    regs_mask: u64,
    exec_len: BreakpointLen,
    kinds: Vec<BreakpointKind>,
}

const ALL_KINDS: [BreakpointKind; 4] = [
    BreakpointKind::Read,
    BreakpointKind::Write,
    BreakpointKind::ReadWrite,
    BreakpointKind::Execute,
];

impl Arch {
    /// 番号付き汎用レジスタ `count` 本の後に `sp`, `pc` が続く構成
    pub fn with_gp_registers(name: &str, count: usize) -> Result<Self> {
        // sp, pc を含めて64ビットのマスクに収まる必要がある
        if count == 0 || count + 2 > 64 {
            return Err(Error::invalid(format!(
                "unsupported general-purpose register count {}",
                count
            )));
        }

        let mut names: Vec<String> = (0..count).map(|i| format!("x{}", i)).collect();
        names.push("sp".to_string());
        names.push("pc".to_string());

        let total = names.len();
        let regs_mask = if total == 64 { u64::MAX } else { (1u64 << total) - 1 };

        Ok(Self {
            name: name.to_string(),
            names,
            regs_mask,
            exec_len: BreakpointLen::Len4,
            kinds: ALL_KINDS.to_vec(),
        })
    }

    /// AArch64: x0..x30, sp, pc（PERF_REG_ARM64_MAX = 33）
    pub fn aarch64() -> Self {
        Self {
            name: "aarch64".to_string(),
            names: (0..31)
                .map(|i| format!("x{}", i))
                .chain(["sp".to_string(), "pc".to_string()])
                .collect(),
            regs_mask: (1u64 << 33) - 1,
            exec_len: BreakpointLen::Len4,
            kinds: ALL_KINDS.to_vec(),
        }
    }

    /// x86-64: perf_regs.h の順序からセグメントレジスタ（DS, ES, FS, GS）を除いたもの
    ///
    /// デバッグレジスタは読み取りだけの監視を持たないので `Read` は使えません。
    pub fn x86_64() -> Self {
        const NAMES: [&str; 20] = [
            "ax", "bx", "cx", "dx", "si", "di", "bp", "sp", "ip", "flags", "cs", "ss", "r8",
            "r9", "r10", "r11", "r12", "r13", "r14", "r15",
        ];
        let all = (1u64 << 24) - 1;
        let segments = 0xfu64 << 12;

        Self {
            name: "x86_64".to_string(),
            names: NAMES.iter().map(|s| s.to_string()).collect(),
            regs_mask: all & !segments,
            exec_len: BreakpointLen::Len8,
            kinds: vec![
                BreakpointKind::Write,
                BreakpointKind::ReadWrite,
                BreakpointKind::Execute,
            ],
        }
    }

    /// ビルドターゲットの構成を返す
    pub fn native() -> Result<Self> {
        if cfg!(target_arch = "aarch64") {
            Ok(Self::aarch64())
        } else if cfg!(target_arch = "x86_64") {
            Ok(Self::x86_64())
        } else {
            Err(Error::invalid(format!(
                "no register layout for {}",
                std::env::consts::ARCH
            )))
        }
    }

    /// 実行ブレークポイントに使う長さを変更する
    pub fn with_exec_len(mut self, len: BreakpointLen) -> Self {
        self.exec_len = len;
        self
    }

    /// 使えるアクセス種別を変更する
    pub fn with_supported_kinds(mut self, kinds: &[BreakpointKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    /// ブレークポイントユニットが表現できるアクセス種別
    pub fn supported_kinds(&self) -> &[BreakpointKind] {
        &self.kinds
    }

    pub fn supports(&self, kind: BreakpointKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// アーキテクチャ名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `sample_regs_user` のマスク
    pub fn regs_mask(&self) -> u64 {
        self.regs_mask
    }

    /// サンプル1件に含まれるレジスタ数
    pub fn register_count(&self) -> usize {
        self.names.len()
    }

    /// レジスタ名（インデックス順）
    pub fn register_names(&self) -> &[String] {
        &self.names
    }

    /// 実行ブレークポイントの長さ
    pub fn exec_len(&self) -> BreakpointLen {
        self.exec_len
    }

    /// サンプルのレジスタを名前と組にして返す
    pub fn named_registers<'a>(
        &'a self,
        sample: &'a SampleData<'a>,
    ) -> impl Iterator<Item = (&'a str, u64)> + 'a {
        self.names
            .iter()
            .map(String::as_str)
            .zip(sample.regs.iter().copied())
    }
}

/// トラップ1回分のデコード結果
///
/// `regs` はチャネルの作業領域を指しており、次のデコードで上書きされます。
/// ハンドラの呼び出し中だけ有効です。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleData<'a> {
    pub pid: u32,
    pub tid: u32,
    pub abi: Abi,
    pub regs: &'a [u64],
}
