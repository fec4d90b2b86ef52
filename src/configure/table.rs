//! Static capability table.
//!
//! Every derived configuration field is a lookup into these tables. Bump
//! [`TABLE_VERSION`] whenever an entry changes, so persisted configs can
//! be traced to the table that produced them.

pub const TABLE_VERSION: u32 = 1;

pub const DEFAULT_COMPILER: &str = "clang";
pub const DEFAULT_TARGET: &str = "x86-64-elf";

/// Optimization level used unless a feature flag overrides it.
pub const DEFAULT_OPT_LEVEL: &str = "-O2";

/// Workspace-relative directory the bootloader artifact is installed into.
pub const BOOTLOADER_DIR: &str = "bootloader";
pub const BUILD_DIR: &str = "build";
pub const ISO_ROOT: &str = "build/iso_root";

#[derive(Debug)]
pub struct CompilerCaps {
    pub name: &'static str,
    pub linker: &'static str,
    pub targets: &'static [&'static str],
    /// Whether the compiler selects the target with `--target=<triple>`.
    pub takes_target_triple: bool,
}

#[derive(Debug)]
pub struct TargetCaps {
    pub name: &'static str,
    pub triple: &'static str,
    pub cflags: &'static [&'static str],
    /// Bootloader payload files, relative to [`BOOTLOADER_DIR`].
    pub bootloader_files: &'static [&'static str],
}

#[derive(Debug)]
pub struct FeatureFlag {
    pub name: &'static str,
    pub cflags: &'static [&'static str],
    pub compilers: &'static [&'static str],
    /// Replaces [`DEFAULT_OPT_LEVEL`] when set.
    pub opt_level: Option<&'static str>,
}

const FREESTANDING: &[&str] = &[
    "-ffreestanding",
    "-fno-stack-protector",
    "-fno-pic",
    "-fno-pie",
    "-nostdlib",
    "-fno-builtin",
    "-fno-unwind-tables",
    "-fno-asynchronous-unwind-tables",
];

pub static COMPILERS: &[CompilerCaps] = &[
    CompilerCaps {
        name: "clang",
        linker: "ld.lld",
        targets: &["x86-64-elf", "i686-elf", "aarch64-elf", "riscv64-elf"],
        takes_target_triple: true,
    },
    CompilerCaps {
        name: "gcc",
        linker: "ld",
        targets: &["x86-64-elf", "i686-elf"],
        takes_target_triple: false,
    },
];

pub static TARGETS: &[TargetCaps] = &[
    TargetCaps {
        name: "x86-64-elf",
        triple: "x86_64-unknown-none-elf",
        cflags: &["-mno-red-zone", "-mcmodel=kernel", "-mno-sse", "-mno-mmx"],
        bootloader_files: &[
            "BOOTX64.EFI",
            "limine-bios.sys",
            "limine-bios-cd.bin",
            "limine-uefi-cd.bin",
        ],
    },
    TargetCaps {
        name: "i686-elf",
        triple: "i686-unknown-none-elf",
        cflags: &["-m32", "-mno-sse", "-mno-mmx"],
        bootloader_files: &[
            "BOOTIA32.EFI",
            "limine-bios.sys",
            "limine-bios-cd.bin",
            "limine-uefi-cd.bin",
        ],
    },
    TargetCaps {
        name: "aarch64-elf",
        triple: "aarch64-unknown-none-elf",
        cflags: &["-mgeneral-regs-only"],
        bootloader_files: &["BOOTAA64.EFI", "limine-uefi-cd.bin"],
    },
    TargetCaps {
        name: "riscv64-elf",
        triple: "riscv64-unknown-none-elf",
        cflags: &["-march=rv64imac", "-mabi=lp64", "-mcmodel=medany", "-mno-relax"],
        bootloader_files: &["BOOTRISCV64.EFI", "limine-uefi-cd.bin"],
    },
];

pub static FEATURES: &[FeatureFlag] = &[
    FeatureFlag {
        name: "debug",
        cflags: &["-g"],
        compilers: &["clang", "gcc"],
        opt_level: Some("-O0"),
    },
    FeatureFlag {
        name: "lto",
        cflags: &["-flto=thin"],
        compilers: &["clang"],
        opt_level: None,
    },
    FeatureFlag {
        name: "ubsan",
        cflags: &["-fsanitize=undefined"],
        compilers: &["clang", "gcc"],
        opt_level: None,
    },
    FeatureFlag {
        name: "serial-console",
        cflags: &["-DCONFIG_SERIAL_CONSOLE=1"],
        compilers: &["clang", "gcc"],
        opt_level: None,
    },
];

pub fn compiler(name: &str) -> Option<&'static CompilerCaps> {
    COMPILERS.iter().find(|c| c.name == name)
}

pub fn target(name: &str) -> Option<&'static TargetCaps> {
    TARGETS.iter().find(|t| t.name == name)
}

pub fn feature(name: &str) -> Option<&'static FeatureFlag> {
    FEATURES.iter().find(|f| f.name == name)
}

pub fn base_cflags() -> &'static [&'static str] {
    FREESTANDING
}
