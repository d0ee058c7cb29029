use std::fmt;

/// Scalar layout rules of a target, used to lay out descriptors for ABIs
/// whose pointer width or 64-bit alignment differs from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataModel {
    pub pointer_size: usize,
    /// Alignment of 64-bit integers inside aggregates.
    pub int64_align: usize,
    /// Alignment of doubles inside aggregates.
    pub float64_align: usize,
}

impl DataModel {
    pub const LP64: DataModel = DataModel {
        pointer_size: 8,
        int64_align: 8,
        float64_align: 8,
    };

    /// 32-bit targets that keep natural 8-byte alignment (ARM32, Win32).
    pub const ILP32: DataModel = DataModel {
        pointer_size: 4,
        int64_align: 8,
        float64_align: 8,
    };

    /// The i386 System V psABI caps scalar alignment at 4.
    pub const ILP32_I386: DataModel = DataModel {
        pointer_size: 4,
        int64_align: 4,
        float64_align: 4,
    };

    #[must_use]
    pub fn host() -> DataModel {
        if cfg!(target_pointer_width = "64") {
            DataModel::LP64
        } else if cfg!(all(target_arch = "x86", not(windows))) {
            DataModel::ILP32_I386
        } else {
            DataModel::ILP32
        }
    }
}

/// Calling convention families the engine can classify for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Abi {
    X64SysV,
    X64Windows,
    X86SysV,
    X86Windows,
    /// AAPCS base standard (soft-float).
    Arm32,
    /// AAPCS with VFP argument registers (hard-float).
    Arm32Vfp,
    Arm64,
    Arm64Apple,
    Arm64Windows,
    Arm64Ec,
    RiscV64,
}

impl Abi {
    pub const ALL: [Abi; 11] = [
        Abi::X64SysV,
        Abi::X64Windows,
        Abi::X86SysV,
        Abi::X86Windows,
        Abi::Arm32,
        Abi::Arm32Vfp,
        Abi::Arm64,
        Abi::Arm64Apple,
        Abi::Arm64Windows,
        Abi::Arm64Ec,
        Abi::RiscV64,
    ];

    /// The ABI of the running process, if the engine knows it.
    #[must_use]
    pub fn host() -> Option<Abi> {
        if cfg!(all(target_arch = "x86_64", windows)) {
            Some(Abi::X64Windows)
        } else if cfg!(target_arch = "x86_64") {
            Some(Abi::X64SysV)
        } else if cfg!(all(target_arch = "x86", windows)) {
            Some(Abi::X86Windows)
        } else if cfg!(target_arch = "x86") {
            Some(Abi::X86SysV)
        } else if cfg!(all(target_arch = "aarch64", target_vendor = "apple")) {
            Some(Abi::Arm64Apple)
        } else if cfg!(all(target_arch = "aarch64", windows)) {
            Some(Abi::Arm64Windows)
        } else if cfg!(target_arch = "aarch64") {
            Some(Abi::Arm64)
        } else if cfg!(all(target_arch = "arm", target_abi = "eabihf")) {
            Some(Abi::Arm32Vfp)
        } else if cfg!(target_arch = "arm") {
            Some(Abi::Arm32)
        } else if cfg!(target_arch = "riscv64") {
            Some(Abi::RiscV64)
        } else {
            None
        }
    }

    #[must_use]
    pub fn data_model(self) -> DataModel {
        match self {
            Abi::X86SysV => DataModel::ILP32_I386,
            Abi::X86Windows | Abi::Arm32 | Abi::Arm32Vfp => DataModel::ILP32,
            _ => DataModel::LP64,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Abi::X64SysV => "x64-sysv",
            Abi::X64Windows => "x64-win",
            Abi::X86SysV => "x86-sysv",
            Abi::X86Windows => "x86-win",
            Abi::Arm32 => "arm32",
            Abi::Arm32Vfp => "arm32-vfp",
            Abi::Arm64 => "arm64",
            Abi::Arm64Apple => "arm64-apple",
            Abi::Arm64Windows => "arm64-win",
            Abi::Arm64Ec => "arm64ec",
            Abi::RiscV64 => "riscv64",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Abi> {
        Abi::ALL.iter().copied().find(|abi| abi.name() == name)
    }

    #[must_use]
    pub fn is_windows(self) -> bool {
        matches!(
            self,
            Abi::X64Windows | Abi::X86Windows | Abi::Arm64Windows | Abi::Arm64Ec
        )
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for abi in Abi::ALL {
            assert_eq!(Abi::from_name(abi.name()), Some(abi));
        }
        assert_eq!(Abi::from_name("pdp11"), None);
    }

    #[test]
    fn thirty_two_bit_models() {
        assert_eq!(Abi::X86SysV.data_model().float64_align, 4);
        assert_eq!(Abi::X86Windows.data_model().float64_align, 8);
        assert_eq!(Abi::Arm32Vfp.data_model().pointer_size, 4);
        assert_eq!(Abi::RiscV64.data_model(), DataModel::LP64);
    }
}
