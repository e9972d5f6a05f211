//! Installation Probe (C1): locates `llama-server`/`llama-cli` in a directory
//! tree and memoizes version/capability strings extracted from them.

use std::path::{Path, PathBuf};

use regex::Regex;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::error::{Result, SwitchboardError};

const SERVER_BIN: &str = "llama-server";
const CLI_BIN: &str = "llama-cli";
const MAX_SCAN_DEPTH: usize = 6;

/// Handle to a fixed installation directory. Once constructed it refers to a
/// single `rootPath` for its lifetime; if the binaries disappear afterwards,
/// operations fail rather than re-searching.
#[derive(Debug)]
pub struct Installation {
    root_path: PathBuf,
    version_output: OnceCell<String>,
    help_output: OnceCell<String>,
}

impl Installation {
    fn new(root_path: PathBuf) -> Self {
        Self {
            root_path,
            version_output: OnceCell::new(),
            help_output: OnceCell::new(),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Recursively scan `path` for the first directory holding both
    /// `llama-server` and `llama-cli` as executable regular files.
    /// Permission errors during traversal are swallowed; no deterministic
    /// ordering is guaranteed, the first match wins.
    pub fn detect(path: &Path) -> Option<Installation> {
        find_install_dir(path, 0).map(Installation::new)
    }

    pub fn server_path(&self) -> Option<PathBuf> {
        let p = self.root_path.join(SERVER_BIN);
        p.is_file().then_some(p)
    }

    pub fn cli_path(&self) -> Option<PathBuf> {
        let p = self.root_path.join(CLI_BIN);
        p.is_file().then_some(p)
    }

    /// Clear memoized version/help output, forcing the next call to
    /// re-invoke the CLI binary. Useful after a binary swap in the same
    /// directory.
    pub fn refresh(&mut self) {
        self.version_output = OnceCell::new();
        self.help_output = OnceCell::new();
    }

    async fn raw_version_output(&self) -> Result<&str> {
        self.version_output
            .get_or_try_init(|| async {
                let cli = self.cli_path().ok_or_else(|| SwitchboardError::NotFound {
                    what: format!("{} in {}", CLI_BIN, self.root_path.display()),
                })?;
                let output = Command::new(&cli)
                    .arg("--version")
                    .output()
                    .await
                    .map_err(SwitchboardError::Io)?;
                Ok(String::from_utf8_lossy(&output.stderr).into_owned())
            })
            .await
            .map(|s| s.as_str())
    }

    async fn raw_help_output(&self) -> Result<&str> {
        self.help_output
            .get_or_try_init(|| async {
                let cli = self.cli_path().ok_or_else(|| SwitchboardError::NotFound {
                    what: format!("{} in {}", CLI_BIN, self.root_path.display()),
                })?;
                let output = Command::new(&cli)
                    .arg("--help")
                    .output()
                    .await
                    .map_err(SwitchboardError::Io)?;
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            })
            .await
            .map(|s| s.as_str())
    }

    /// Full captured `--version` output (stderr), for downstream feature
    /// sniffing beyond the version number itself.
    pub async fn version_text(&self) -> Result<&str> {
        self.raw_version_output().await
    }

    /// Full captured `--help` output (stdout).
    pub async fn help_text(&self) -> Result<&str> {
        self.raw_help_output().await
    }

    /// Parsed numeric build version from `llama-cli --version`.
    pub async fn version(&self) -> Result<u32> {
        let text = self.raw_version_output().await?;
        parse_version(text).ok_or_else(|| SwitchboardError::Parse {
            reason: format!("could not find a version number in: {text}"),
        })
    }

    /// Whether the CLI's `--version` output advertises CUDA support.
    pub async fn has_cuda(&self) -> Result<bool> {
        Ok(self.raw_version_output().await?.contains("CUDA"))
    }

    /// Whether `--help` advertises the enum form of `--flash-attn`.
    pub async fn flash_attn_is_enum(&self) -> Result<bool> {
        Ok(self
            .raw_help_output()
            .await?
            .contains(" --flash-attn [on|off|auto]"))
    }
}

fn parse_version(text: &str) -> Option<u32> {
    // Prefer the fuller "version: N (hash)" form; fall back to bare "version: N".
    let with_hash = Regex::new(r"version:\s*(\d+)\s*\([^)]+\)").unwrap();
    if let Some(caps) = with_hash.captures(text) {
        return caps.get(1)?.as_str().parse().ok();
    }
    let bare = Regex::new(r"version:\s*(\d+)").unwrap();
    bare.captures(text)?.get(1)?.as_str().parse().ok()
}

fn has_executable_bit(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

fn is_candidate_dir(dir: &Path) -> bool {
    let server = dir.join(SERVER_BIN);
    let cli = dir.join(CLI_BIN);
    server.is_file() && cli.is_file() && has_executable_bit(&server) && has_executable_bit(&cli)
}

fn find_install_dir(dir: &Path, depth: usize) -> Option<PathBuf> {
    if depth > MAX_SCAN_DEPTH || !dir.is_dir() {
        return None;
    }
    if is_candidate_dir(dir) {
        return Some(dir.to_path_buf());
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return None, // permission errors swallowed; traversal stops here
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_install_dir(&path, depth + 1) {
                return Some(found);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_exec(path: &Path) {
        fs::write(path, b"#!/bin/sh\necho stub\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn detect_finds_nested_install_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        make_exec(&nested.join(SERVER_BIN));
        make_exec(&nested.join(CLI_BIN));

        let found = Installation::detect(tmp.path()).expect("should find install dir");
        assert_eq!(found.root_path(), nested.as_path());
    }

    #[test]
    fn detect_returns_none_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Installation::detect(tmp.path()).is_none());
    }

    #[test]
    fn server_path_none_when_vanished() {
        let tmp = tempfile::tempdir().unwrap();
        make_exec(&tmp.path().join(SERVER_BIN));
        make_exec(&tmp.path().join(CLI_BIN));
        let install = Installation::detect(tmp.path()).unwrap();
        fs::remove_file(tmp.path().join(SERVER_BIN)).unwrap();
        assert!(install.server_path().is_none());
    }

    #[test]
    fn parse_version_prefers_hash_form() {
        assert_eq!(parse_version("version: 4521 (abcdef0)"), Some(4521));
        assert_eq!(parse_version("version: 4521"), Some(4521));
        assert_eq!(parse_version("no version here"), None);
    }
}
