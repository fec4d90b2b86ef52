//! Preflight checks for bootstrap.
//!
//! Validates that the host has the tools the downstream build needs
//! before anything is fetched, so a missing `xorriso` is reported up
//! front instead of after a long download. Preflight only looks; it never
//! installs packages.

use crate::error::{Error, Result};

/// Check if a command exists on the host system's `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// `tools` holds `(command, package)` pairs; every missing command is
/// listed with the package that provides it.
pub fn check_required_tools<C, P>(tools: &[(C, P)]) -> Result<()>
where
    C: AsRef<str>,
    P: AsRef<str>,
{
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool.as_ref()))
        .map(|(tool, package)| format!("  {} (install: {})", tool.as_ref(), package.as_ref()))
        .collect();

    if !missing.is_empty() {
        return Err(Error::MissingHostTools(format!(
            "{}\ninstall them with your package manager, or pass --skip-preflight",
            missing.join("\n")
        )));
    }

    log::debug!("[bootstrap:preflight] {} host tool(s) present", tools.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        // 'sh' should exist on any Unix system
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = [("sh", "coreutils")];
        assert!(check_required_tools(&tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure_lists_packages() {
        let tools = [
            ("nonexistent_command_xyz".to_string(), "fake-package".to_string()),
            ("sh".to_string(), "coreutils".to_string()),
        ];
        let err = check_required_tools(&tools).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_HOST_TOOLS);
        let msg = err.to_string();
        assert!(msg.contains("nonexistent_command_xyz (install: fake-package)"));
        assert!(!msg.contains("coreutils"));
    }
}
