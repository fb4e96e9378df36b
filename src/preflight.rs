//! Checks that run before any process is spawned: the external tools must be
//! installed, and the server must not run as root since it launches
//! processes on behalf of remote clients.

use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Result, bail};
use nix::unistd::Uid;
use tracing::warn;

use crate::{error::DownloadError, format::Container};

const YTDLP_HINT: &str = "Install with: pip install yt-dlp";
const FFMPEG_HINT: &str = "Install ffmpeg and ensure it is in PATH";

/// Fails fast when the server is started as root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; start it from an unprivileged account");
    }
    Ok(())
}

/// Resolves `program` the way the shell would: paths containing a separator
/// are taken as-is, bare names are searched in `PATH`.
pub fn locate_binary(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// The configured external tools.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub ytdlp: PathBuf,
    pub ffmpeg: PathBuf,
}

impl Toolchain {
    /// Confirms the tools a download into `container` needs are installed.
    /// yt-dlp always; ffmpeg for mp3 transcoding.
    pub fn require(&self, container: Container) -> Result<(), DownloadError> {
        require_one(&self.ytdlp, "yt-dlp", YTDLP_HINT)?;
        if container.is_audio() {
            require_one(&self.ffmpeg, "ffmpeg", FFMPEG_HINT)?;
        }
        Ok(())
    }

    /// Logs every missing tool. Used at startup, where absence is not fatal.
    pub fn report_missing(&self) {
        for (path, name) in [(&self.ytdlp, "yt-dlp"), (&self.ffmpeg, "ffmpeg")] {
            if locate_binary(path).is_none() {
                warn!(binary = name, path = %path.display(), "external tool not found; downloads needing it will fail");
            }
        }
    }
}

fn require_one(path: &Path, name: &str, hint: &str) -> Result<(), DownloadError> {
    match locate_binary(path) {
        Some(_) => Ok(()),
        None => Err(DownloadError::BinaryMissing {
            name: name.to_string(),
            hint: hint.to_string(),
        }),
    }
}
