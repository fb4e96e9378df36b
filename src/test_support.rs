//! Stand-in yt-dlp for process tests: a shell script in a temp dir.

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

use tempfile::TempDir;

pub struct StubYtDlp {
    dir: TempDir,
    path: PathBuf,
}

impl StubYtDlp {
    /// `body` runs under `/bin/sh` with `$STUB_DIR` pointing at the stub's
    /// directory. The arguments are recorded one per line in `$STUB_DIR/args`.
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yt-dlp");
        let script = format!(
            "#!/bin/sh\nSTUB_DIR='{}'\nprintf '%s\\n' \"$@\" > \"$STUB_DIR/args\"\n{body}",
            dir.path().display()
        );
        fs::write(&path, script).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        Self { dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn arguments(&self) -> String {
        fs::read_to_string(self.dir.path().join("args")).unwrap_or_default()
    }

    /// Whether the pid the script wrote to `$STUB_DIR/pid` still runs.
    pub fn recorded_process_alive(&self) -> bool {
        match fs::read_to_string(self.dir.path().join("pid")) {
            Ok(pid) => pid_alive(pid.trim()),
            Err(_) => false,
        }
    }

    /// Waits for the script to write `$STUB_DIR/pid`.
    pub async fn wait_for_recorded_pid(&self) {
        for _ in 0..100 {
            let written = fs::read_to_string(self.dir.path().join("pid"))
                .is_ok_and(|pid| !pid.trim().is_empty());
            if written {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("stub never recorded a pid");
    }

    /// Polls until the recorded process is gone or five seconds pass.
    pub async fn wait_for_recorded_exit(&self) -> bool {
        for _ in 0..100 {
            if !self.recorded_process_alive() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

/// Whether `pid` is a live process. Zombies count as gone: a killed helper
/// whose parent also died may wait a while for init to reap it.
pub fn pid_alive(pid: &str) -> bool {
    if Path::new("/proc/self").exists() {
        return match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => false,
        };
    }
    Command::new("kill")
        .arg("-0")
        .arg(pid)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
