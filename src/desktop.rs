//! Host-environment helpers: opening links and folders, printing, and the
//! share target used when running on a desktop.

use std::io;
use std::path::Path;
use std::process::Command;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::share::{DispatchError, NativeShareResult, SharePayload, ShareTarget};

/// Opens a URL (or file) with the system handler. Nothing is read back.
pub fn open_url(url: &str) -> io::Result<()> {
    debug!(url, "opening with system handler");

    #[cfg(target_os = "macos")]
    Command::new("open").arg(url).spawn()?;

    #[cfg(target_os = "windows")]
    Command::new("cmd").args(["/C", "start", "", url]).spawn()?;

    #[cfg(all(unix, not(target_os = "macos")))]
    Command::new("xdg-open").arg(url).spawn()?;

    Ok(())
}

/// Opens the file and reveals it in the file manager.
pub fn open_and_reveal(path: &Path) {
    #[cfg(target_os = "macos")]
    Command::new("open").arg("-R").arg(path).spawn().ok();

    #[cfg(target_os = "windows")]
    Command::new("explorer").arg(format!("/select,{}", path.to_string_lossy())).spawn().ok();

    #[cfg(all(unix, not(target_os = "macos")))]
    if let Some(parent) = path.parent() {
        Command::new("xdg-open").arg(parent).spawn().ok();
    }

    open_url(&path.to_string_lossy()).ok();
}

/// Sends a PDF to the default printer.
pub async fn print_file(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    let (program, args): (&str, &[&str]) = ("lp", &[]);

    #[cfg(windows)]
    let (program, args): (&str, &[&str]) =
        ("powershell", &["-NoProfile", "-Command", "Start-Process", "-Verb", "Print", "-FilePath"]);

    print_with(program, args, path).await
}

async fn print_with(program: &str, args: &[&str], path: &Path) -> io::Result<()> {
    let status = tokio::process::Command::new(program).args(args).arg(path).status().await?;
    if !status.success() {
        return Err(io::Error::other(format!("print command exited with {status}")));
    }
    info!(path = %path.display(), "sent to printer");
    Ok(())
}

/// Desktops have no native share sheet: files always go out as a link.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopShareTarget;

#[async_trait]
impl ShareTarget for DesktopShareTarget {
    fn supports_file_share(&self) -> bool {
        false
    }

    async fn share_files(&self, _payload: SharePayload) -> Result<NativeShareResult, DispatchError> {
        Ok(NativeShareResult::Unsupported("no native share sheet on this platform".into()))
    }

    async fn open_url(&self, url: &str) -> Result<(), DispatchError> {
        Ok(open_url(url)?)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn print_command_exit_status_is_checked() {
        let path = Path::new("invoice.pdf");
        assert!(print_with("true", &[], path).await.is_ok());

        let err = print_with("false", &[], path).await.unwrap_err();
        assert!(err.to_string().contains("print command exited"));
    }

    #[tokio::test]
    async fn missing_print_command_is_an_error() {
        let err = print_with("cycle-billing-no-such-printer", &[], Path::new("a.pdf")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
