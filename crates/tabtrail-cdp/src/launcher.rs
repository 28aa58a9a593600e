//! Chrome/Chromium launch helper.
//!
//! Thin by design: the observer normally attaches to a browser the user
//! already runs. When `--launch` is requested we locate an executable,
//! start it against a scratch profile, and tear both down on stop.

use std::env;
use std::path::PathBuf;
use std::process::Stdio;

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::info;
use which::which;

use crate::error::CdpError;

/// A browser instance we launched and therefore own.
pub struct BrowserProcess {
    child: Child,
    port: u16,
    // Held for its Drop: the scratch profile is removed with the process.
    _user_data_dir: TempDir,
}

impl BrowserProcess {
    pub fn pid(&self) -> u32 {
        self.child.id().unwrap_or(0)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Kills the browser and removes its scratch profile.
    pub async fn stop(mut self) -> Result<(), CdpError> {
        self.child
            .kill()
            .await
            .map_err(|err| CdpError::Launch(format!("failed to kill browser: {err}")))?;
        let _ = self.child.wait().await;
        Ok(())
    }
}

/// Starts a browser with remote debugging on `port` and a fresh temporary
/// profile.
pub async fn launch(port: u16) -> Result<BrowserProcess, CdpError> {
    let executable = find_executable().ok_or(CdpError::ExecutableNotFound)?;

    let user_data_dir = TempDir::with_prefix("tabtrail-browser-")
        .map_err(|err| CdpError::Launch(format!("failed to create scratch profile: {err}")))?;

    let child = Command::new(&executable)
        .arg(format!("--remote-debugging-port={port}"))
        .arg(format!("--user-data-dir={}", user_data_dir.path().display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-features=TranslateUI")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| CdpError::Launch(format!("failed to start {}: {err}", executable.display())))?;

    info!(
        target: "tabtrail-cdp",
        executable = %executable.display(),
        port,
        "launched browser"
    );

    Ok(BrowserProcess {
        child,
        port,
        _user_data_dir: user_data_dir,
    })
}

/// Locates a Chrome/Chromium executable: env override, then PATH, then the
/// usual install locations.
pub fn find_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("TABTRAIL_BROWSER") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    os_specific_paths().into_iter().find(|path| path.exists())
}

fn executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe"]
    }

    #[cfg(not(target_os = "windows"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }
}

fn os_specific_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(target_os = "linux")]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/snap/bin/chromium"),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
            if let Ok(root) = env::var(key) {
                if !root.trim().is_empty() {
                    paths.push(
                        PathBuf::from(root).join("Google/Chrome/Application/chrome.exe"),
                    );
                }
            }
        }
        paths
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn env_override_wins() {
        let dir = tempdir().unwrap();
        let exe = dir.path().join("my-browser");
        fs::write(&exe, b"").unwrap();

        let original = env::var("TABTRAIL_BROWSER").ok();
        env::set_var("TABTRAIL_BROWSER", &exe);
        let detected = find_executable();
        match original {
            Some(value) => env::set_var("TABTRAIL_BROWSER", value),
            None => env::remove_var("TABTRAIL_BROWSER"),
        }

        assert_eq!(detected, Some(exe));
    }
}
