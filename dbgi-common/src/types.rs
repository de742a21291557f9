//! Architecture information used by the decoders.

use std::fmt;
use std::str;

/// Names for x86 CPU registers by register number.
static I386: &[&str] = &[
    "$eax", "$ecx", "$edx", "$ebx", "$esp", "$ebp", "$esi", "$edi", "$eip", "$eflags", "$unused1",
    "$st0", "$st1", "$st2", "$st3", "$st4", "$st5", "$st6", "$st7", "$unused2", "$unused3",
    "$xmm0", "$xmm1", "$xmm2", "$xmm3", "$xmm4", "$xmm5", "$xmm6", "$xmm7", "$mm0", "$mm1", "$mm2",
    "$mm3", "$mm4", "$mm5", "$mm6", "$mm7", "$fcw", "$fsw", "$mxcsr", "$es", "$cs", "$ss", "$ds",
    "$fs", "$gs", "$unused4", "$unused5", "$tr", "$ldtr",
];

/// Names for x86_64 CPU registers by register number.
static X86_64: &[&str] = &[
    "$rax", "$rdx", "$rcx", "$rbx", "$rsi", "$rdi", "$rbp", "$rsp", "$r8", "$r9", "$r10", "$r11",
    "$r12", "$r13", "$r14", "$r15", "$rip", "$xmm0", "$xmm1", "$xmm2", "$xmm3", "$xmm4", "$xmm5",
    "$xmm6", "$xmm7", "$xmm8", "$xmm9", "$xmm10", "$xmm11", "$xmm12", "$xmm13", "$xmm14", "$xmm15",
];

/// Names for 32bit ARM CPU registers by register number.
static ARM: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc",
];

/// Names for 64bit ARM CPU registers by register number.
static ARM64: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp",
];

/// Names for MIPS CPU registers by register number.
static MIPS: &[&str] = &[
    "$zero", "$at", "$v0", "$v1", "$a0", "$a1", "$a2", "$a3", "$t0", "$t1", "$t2", "$t3", "$t4",
    "$t5", "$t6", "$t7", "$s0", "$s1", "$s2", "$s3", "$s4", "$s5", "$s6", "$s7", "$t8", "$t9",
    "$k0", "$k1", "$gp", "$sp", "$fp", "$ra",
];

/// Represents a family of CPUs.
///
/// The family decides which DWARF register numbers the unwinder treats as stack pointer, frame
/// pointer and return address when it summarizes call frame information.
#[repr(u32)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CpuFamily {
    /// Any other CPU family that is not explicitly supported.
    #[default]
    Unknown = 0,
    /// 32-bit little-endian CPUs using the Intel 8086 instruction set, also known as `x86`.
    Intel32 = 1,
    /// 64-bit little-endian, also known as `x86_64`, now widely used by Intel and AMD.
    Amd64 = 2,
    /// 32-bit ARM.
    Arm32 = 3,
    /// 64-bit ARM (e.g. ARMv8-A).
    Arm64 = 4,
    /// 32-bit big-endian PowerPC.
    Ppc32 = 5,
    /// 64-bit big-endian PowerPC.
    Ppc64 = 6,
    /// 32-bit MIPS.
    Mips32 = 7,
    /// 64-bit MIPS.
    Mips64 = 8,
}

impl CpuFamily {
    /// Returns the native pointer size.
    ///
    /// This function returns `None` if the CPU family is unknown.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbgi_common::CpuFamily;
    ///
    /// assert_eq!(CpuFamily::Amd64.pointer_size(), Some(8));
    /// assert_eq!(CpuFamily::Intel32.pointer_size(), Some(4));
    /// ```
    pub fn pointer_size(self) -> Option<u8> {
        match self {
            CpuFamily::Unknown => None,
            CpuFamily::Amd64 | CpuFamily::Arm64 | CpuFamily::Ppc64 | CpuFamily::Mips64 => Some(8),
            CpuFamily::Intel32 | CpuFamily::Arm32 | CpuFamily::Ppc32 | CpuFamily::Mips32 => Some(4),
        }
    }

    /// Returns instruction alignment if fixed.
    ///
    /// Returns `None` for variable-length instruction sets like x86.
    pub fn instruction_alignment(self) -> Option<u64> {
        match self {
            CpuFamily::Arm32 => Some(2),
            CpuFamily::Arm64 => Some(4),
            CpuFamily::Ppc32 | CpuFamily::Mips32 | CpuFamily::Mips64 => Some(4),
            CpuFamily::Ppc64 => Some(8),
            CpuFamily::Intel32 | CpuFamily::Amd64 => None,
            CpuFamily::Unknown => None,
        }
    }

    /// The DWARF number of the stack pointer register.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbgi_common::CpuFamily;
    ///
    /// assert_eq!(CpuFamily::Amd64.stack_pointer_register(), Some(7));
    /// assert_eq!(CpuFamily::Arm32.stack_pointer_register(), Some(13));
    /// ```
    pub fn stack_pointer_register(self) -> Option<u16> {
        match self {
            CpuFamily::Intel32 => Some(4),
            CpuFamily::Amd64 => Some(7),
            CpuFamily::Arm32 => Some(13),
            CpuFamily::Arm64 => Some(31),
            CpuFamily::Ppc32 | CpuFamily::Ppc64 => Some(1),
            CpuFamily::Mips32 | CpuFamily::Mips64 => Some(29),
            CpuFamily::Unknown => None,
        }
    }

    /// The DWARF number of the frame pointer register.
    pub fn frame_pointer_register(self) -> Option<u16> {
        match self {
            CpuFamily::Intel32 => Some(5),
            CpuFamily::Amd64 => Some(6),
            CpuFamily::Arm32 => Some(11),
            CpuFamily::Arm64 => Some(29),
            CpuFamily::Ppc32 | CpuFamily::Ppc64 => Some(31),
            CpuFamily::Mips32 | CpuFamily::Mips64 => Some(30),
            CpuFamily::Unknown => None,
        }
    }

    /// The DWARF register column that conventionally holds the return address.
    ///
    /// On architectures with a link register this is the link register, on x86 it is the
    /// instruction pointer column.
    pub fn return_address_register(self) -> Option<u16> {
        match self {
            CpuFamily::Intel32 => Some(8),
            CpuFamily::Amd64 => Some(16),
            CpuFamily::Arm32 => Some(14),
            CpuFamily::Arm64 => Some(30),
            CpuFamily::Ppc32 | CpuFamily::Ppc64 => Some(65),
            CpuFamily::Mips32 | CpuFamily::Mips64 => Some(31),
            CpuFamily::Unknown => None,
        }
    }

    /// Additional registers an unwinder needs to recover on this family.
    ///
    /// On 32-bit ARM, Thumb code uses `r7` as frame pointer and `r12` may serve as CFA base.
    pub fn extra_unwind_registers(self) -> &'static [u16] {
        match self {
            CpuFamily::Arm32 => &[7, 12],
            _ => &[],
        }
    }

    /// Returns the name of a register in a given architecture used in CFI programs.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbgi_common::CpuFamily;
    ///
    /// // 16 is the instruction pointer register:
    /// assert_eq!(CpuFamily::Amd64.cfi_register_name(16), Some("$rip"));
    /// ```
    pub fn cfi_register_name(self, register: u16) -> Option<&'static str> {
        let index = register as usize;

        let opt = match self {
            CpuFamily::Intel32 => I386.get(index),
            CpuFamily::Amd64 => X86_64.get(index),
            CpuFamily::Arm64 => ARM64.get(index),
            CpuFamily::Arm32 => ARM.get(index),
            CpuFamily::Mips32 | CpuFamily::Mips64 => MIPS.get(index),
            _ => None,
        };

        opt.copied().filter(|name| !name.is_empty())
    }
}

/// An error returned for an invalid [`Arch`].
#[derive(Debug)]
pub struct UnknownArchError;

impl fmt::Display for UnknownArchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown architecture")
    }
}

impl std::error::Error for UnknownArchError {}

/// An enumeration of CPU architectures that objects can be built for.
#[repr(u32)]
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Arch {
    #[default]
    Unknown = 0,
    X86 = 101,
    Amd64 = 201,
    Arm = 301,
    Arm64 = 401,
    Ppc = 501,
    Ppc64 = 601,
    Mips = 701,
    Mips64 = 801,
}

impl Arch {
    /// Returns the CPU family of the CPU architecture.
    pub fn cpu_family(self) -> CpuFamily {
        match self {
            Arch::Unknown => CpuFamily::Unknown,
            Arch::X86 => CpuFamily::Intel32,
            Arch::Amd64 => CpuFamily::Amd64,
            Arch::Arm => CpuFamily::Arm32,
            Arch::Arm64 => CpuFamily::Arm64,
            Arch::Ppc => CpuFamily::Ppc32,
            Arch::Ppc64 => CpuFamily::Ppc64,
            Arch::Mips => CpuFamily::Mips32,
            Arch::Mips64 => CpuFamily::Mips64,
        }
    }

    /// Returns the canonical name of the CPU architecture.
    pub fn name(self) -> &'static str {
        match self {
            Arch::Unknown => "unknown",
            Arch::X86 => "x86",
            Arch::Amd64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::Ppc => "ppc",
            Arch::Ppc64 => "ppc64",
            Arch::Mips => "mips",
            Arch::Mips64 => "mips64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl str::FromStr for Arch {
    type Err = UnknownArchError;

    fn from_str(string: &str) -> Result<Arch, UnknownArchError> {
        Ok(match string.to_ascii_lowercase().as_str() {
            "unknown" => Arch::Unknown,
            "i386" | "x86" => Arch::X86,
            "x86_64" | "amd64" => Arch::Amd64,
            "arm" => Arch::Arm,
            "arm64" | "aarch64" => Arch::Arm64,
            "ppc" => Arch::Ppc,
            "ppc64" => Arch::Ppc64,
            "mips" => Arch::Mips,
            "mips64" => Arch::Mips64,
            _ => return Err(UnknownArchError),
        })
    }
}
