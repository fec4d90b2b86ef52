//! Configuration generator.
//!
//! Validates user options against the capability table in [`table`] and
//! persists the resulting [`BuildConfig`] at `.bootstrap/config.json`.
//! Nothing is inferred: identical options and table version always produce
//! byte-identical output.

pub mod table;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::fsutil::{lock_exclusive, write_atomic};
use crate::layout::WorkspaceLayout;

pub const CONFIG_SCHEMA: u32 = 1;

/// Options as given on the command line. `None` selects the table default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOptions {
    pub compiler: Option<String>,
    pub target: Option<String>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedPaths {
    pub bootloader_dir: PathBuf,
    pub bootloader_files: Vec<PathBuf>,
    pub iso_root: PathBuf,
    pub build_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub schema: u32,
    pub table_version: u32,
    pub compiler: String,
    pub target: String,
    pub flags: BTreeSet<String>,
    /// Full compiler argument list: optimization level, freestanding
    /// defaults, target flags, then feature flags in table order.
    pub cflags: Vec<String>,
    pub linker: String,
    pub paths: DerivedPaths,
}

fn known(names: impl Iterator<Item = &'static str>) -> String {
    names.collect::<Vec<_>>().join(", ")
}

/// Validate `options` and derive the full configuration.
pub fn generate(options: &ConfigOptions) -> Result<BuildConfig> {
    let compiler_name = options.compiler.as_deref().unwrap_or(table::DEFAULT_COMPILER);
    let compiler = table::compiler(compiler_name).ok_or_else(|| {
        Error::config(
            "compiler",
            format!(
                "unknown compiler '{compiler_name}'; supported: {}",
                known(table::COMPILERS.iter().map(|c| c.name))
            ),
        )
    })?;

    let target_name = options.target.as_deref().unwrap_or(table::DEFAULT_TARGET);
    let target = table::target(target_name).ok_or_else(|| {
        Error::config(
            "target",
            format!(
                "unknown target '{target_name}'; supported: {}",
                known(table::TARGETS.iter().map(|t| t.name))
            ),
        )
    })?;

    if !compiler.targets.contains(&target.name) {
        return Err(Error::config(
            "target",
            format!(
                "{} cannot build for {}; targets supported by {}: {}",
                compiler.name,
                target.name,
                compiler.name,
                compiler.targets.join(", ")
            ),
        ));
    }

    let mut flags = BTreeSet::new();
    for raw in &options.flags {
        let name = raw.trim();
        let feature = table::feature(name).ok_or_else(|| {
            Error::config(
                "flag",
                format!(
                    "unknown flag '{raw}'; supported: {}",
                    known(table::FEATURES.iter().map(|f| f.name))
                ),
            )
        })?;
        if !feature.compilers.contains(&compiler.name) {
            return Err(Error::config(
                "flag",
                format!(
                    "flag '{}' is not supported with {} (only {})",
                    feature.name,
                    compiler.name,
                    feature.compilers.join(", ")
                ),
            ));
        }
        flags.insert(feature.name.to_string());
    }

    let selected: Vec<&table::FeatureFlag> = table::FEATURES
        .iter()
        .filter(|f| flags.contains(f.name))
        .collect();
    let opt_level = selected
        .iter()
        .find_map(|f| f.opt_level)
        .unwrap_or(table::DEFAULT_OPT_LEVEL);

    let mut cflags: Vec<String> = vec![opt_level.to_string()];
    if compiler.takes_target_triple {
        cflags.push(format!("--target={}", target.triple));
    }
    cflags.extend(table::base_cflags().iter().map(|s| s.to_string()));
    cflags.extend(target.cflags.iter().map(|s| s.to_string()));
    for f in &selected {
        cflags.extend(f.cflags.iter().map(|s| s.to_string()));
    }

    let bootloader_dir = PathBuf::from(table::BOOTLOADER_DIR);
    Ok(BuildConfig {
        schema: CONFIG_SCHEMA,
        table_version: table::TABLE_VERSION,
        compiler: compiler.name.to_string(),
        target: target.name.to_string(),
        flags,
        cflags,
        linker: compiler.linker.to_string(),
        paths: DerivedPaths {
            bootloader_files: target
                .bootloader_files
                .iter()
                .map(|f| bootloader_dir.join(f))
                .collect(),
            bootloader_dir,
            iso_root: PathBuf::from(table::ISO_ROOT),
            build_dir: PathBuf::from(table::BUILD_DIR),
        },
    })
}

/// Persist `config`. An existing record is replaced only with `overwrite`.
pub fn persist(config: &BuildConfig, layout: &WorkspaceLayout, overwrite: bool) -> Result<PathBuf> {
    let path = layout.config_file();
    let _lock = lock_exclusive(&layout.locks_dir().join("config.lock"))
        .map_err(|e| Error::io("locking configuration", io::Error::other(format!("{e:#}"))))?;

    if path.exists() && !overwrite {
        return Err(Error::ConfigExists(path));
    }

    let mut bytes = serde_json::to_vec_pretty(config)
        .map_err(|e| Error::io("serializing configuration", io::Error::other(e)))?;
    bytes.push(b'\n');
    write_atomic(&path, &bytes, &layout.tmp_dir()).map_err(|e| {
        Error::io(
            format!("writing {}", path.display()),
            io::Error::other(format!("{e:#}")),
        )
    })?;
    log::info!(
        "[bootstrap:configure] wrote {} ({} / {})",
        path.display(),
        config.compiler,
        config.target
    );
    Ok(path)
}

/// Read the persisted configuration, if any.
pub fn load(layout: &WorkspaceLayout) -> Result<Option<BuildConfig>> {
    let path = layout.config_file();
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(format!("reading {}", path.display()), e)),
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        Error::config(
            "config.json",
            format!(
                "{} is not a valid configuration ({e}); regenerate it with `configure --overwrite`",
                path.display()
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn opts(compiler: &str, target: &str, flags: &[&str]) -> ConfigOptions {
        ConfigOptions {
            compiler: Some(compiler.into()),
            target: Some(target.into()),
            flags: flags.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn config_field(err: Error) -> String {
        match err {
            Error::Config { field, .. } => field,
            other => panic!("expected config error, got {other}"),
        }
    }

    #[test]
    fn clang_x86_64_gets_table_defaults() {
        let cfg = generate(&opts("clang", "x86-64-elf", &[])).unwrap();
        assert_eq!(cfg.compiler, "clang");
        assert_eq!(cfg.target, "x86-64-elf");
        assert_eq!(cfg.linker, "ld.lld");
        assert!(cfg.flags.is_empty());
        assert_eq!(cfg.cflags[0], "-O2");
        assert!(cfg.cflags.contains(&"--target=x86_64-unknown-none-elf".to_string()));
        assert!(cfg.cflags.contains(&"-mcmodel=kernel".to_string()));
        assert!(cfg.cflags.contains(&"-ffreestanding".to_string()));
        assert_eq!(
            cfg.paths.bootloader_files[0],
            PathBuf::from("bootloader/BOOTX64.EFI")
        );
    }

    #[test]
    fn missing_options_use_table_defaults() {
        let cfg = generate(&ConfigOptions::default()).unwrap();
        assert_eq!(cfg, generate(&opts("clang", "x86-64-elf", &[])).unwrap());
    }

    #[test]
    fn unknown_values_name_the_field() {
        assert_eq!(
            config_field(generate(&opts("tcc", "x86-64-elf", &[])).unwrap_err()),
            "compiler"
        );
        assert_eq!(
            config_field(generate(&opts("clang", "x86_64-elf", &[])).unwrap_err()),
            "target"
        );
        assert_eq!(
            config_field(generate(&opts("clang", "x86-64-elf", &["turbo"])).unwrap_err()),
            "flag"
        );
    }

    #[test]
    fn incompatible_pair_is_rejected() {
        let err = generate(&opts("gcc", "aarch64-elf", &[])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("gcc cannot build for aarch64-elf"), "{msg}");
    }

    #[test]
    fn flags_are_checked_against_the_compiler() {
        assert!(generate(&opts("clang", "x86-64-elf", &["lto"])).is_ok());
        assert_eq!(
            config_field(generate(&opts("gcc", "x86-64-elf", &["lto"])).unwrap_err()),
            "flag"
        );
    }

    #[test]
    fn debug_flag_replaces_opt_level_and_output_is_order_independent() {
        let a = generate(&opts("clang", "x86-64-elf", &["ubsan", "debug"])).unwrap();
        let b = generate(&opts("clang", "x86-64-elf", &["debug", "ubsan", "debug"])).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.cflags[0], "-O0");
        assert!(!a.cflags.contains(&"-O2".to_string()));
        assert!(a.cflags.contains(&"-g".to_string()));
    }

    #[test]
    fn second_persist_without_overwrite_is_refused_and_file_untouched() {
        let tmp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        layout.ensure().unwrap();

        let first = generate(&opts("clang", "x86-64-elf", &[])).unwrap();
        let path = persist(&first, &layout, false).unwrap();
        let original = fs::read(&path).unwrap();

        let second = generate(&opts("gcc", "i686-elf", &["debug"])).unwrap();
        let err = persist(&second, &layout, false).unwrap_err();
        assert!(matches!(err, Error::ConfigExists(_)));
        assert_eq!(err.exit_code(), crate::error::EXIT_CONFIG);
        assert_eq!(fs::read(&path).unwrap(), original);
        assert_eq!(load(&layout).unwrap(), Some(first));

        persist(&second, &layout, true).unwrap();
        assert_eq!(load(&layout).unwrap(), Some(second));
    }

    #[test]
    fn same_options_produce_identical_bytes() {
        let cfg = generate(&opts("clang", "riscv64-elf", &["serial-console"])).unwrap();
        let a = serde_json::to_vec_pretty(&cfg).unwrap();
        let again = generate(&opts("clang", "riscv64-elf", &["serial-console"])).unwrap();
        let b = serde_json::to_vec_pretty(&again).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_config_loads_as_none() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(load(&WorkspaceLayout::new(tmp.path())).unwrap(), None);
    }
}
