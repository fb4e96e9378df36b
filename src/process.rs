//! yt-dlp invocations and the scoped handle that owns a running child.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStderr, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::debug;

use crate::format::Container;

/// Only the end of stderr is kept; yt-dlp prints the fatal line last.
pub const DIAGNOSTIC_TAIL_BYTES: usize = 64 * 1024;

/// A fully specified yt-dlp command line.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Pipe stdout back to us. Otherwise it is discarded.
    pub capture_stdout: bool,
}

impl Invocation {
    /// `--dump-json` with no media transfer.
    pub fn metadata(ytdlp: &Path, url: &str) -> Self {
        Self {
            program: ytdlp.to_path_buf(),
            args: args(["--no-playlist", "--dump-json", "--no-warnings", url]),
            capture_stdout: true,
        }
    }

    /// Media bytes on stdout, merged into `container` where yt-dlp needs a
    /// directive for it.
    pub fn pipe(ytdlp: &Path, url: &str, expression: &str, container: Container) -> Self {
        let mut args = args(["--no-playlist", "-f", expression, "-o", "-", url]);
        if container == Container::Mp4 {
            args.extend([OsString::from("--merge-output-format"), OsString::from("mp4")]);
        }
        Self {
            program: ytdlp.to_path_buf(),
            args,
            capture_stdout: true,
        }
    }

    /// Audio extraction to `output_template`, transcoded to mp3 with the
    /// thumbnail and tags embedded.
    pub fn audio(
        ytdlp: &Path,
        ffmpeg: &Path,
        url: &str,
        bitrate_kbps: u32,
        output_template: &Path,
    ) -> Self {
        let mut args = args([
            "--no-playlist",
            "-x",
            "--audio-format",
            "mp3",
            "--audio-quality",
        ]);
        args.push(format!("{bitrate_kbps}K").into());
        args.extend(self::args(["--embed-thumbnail", "--add-metadata", "--ffmpeg-location"]));
        args.push(ffmpeg.as_os_str().to_owned());
        args.push("-o".into());
        args.push(output_template.as_os_str().to_owned());
        args.push(url.into());
        Self {
            program: ytdlp.to_path_buf(),
            args,
            capture_stdout: false,
        }
    }

    /// Starts the process with stdin closed and stderr captured, as the
    /// leader of a new process group so helpers it runs (ffmpeg) can be
    /// killed with it.
    pub fn spawn(&self) -> io::Result<Spawned> {
        debug!(program = %self.program.display(), args = ?self.args, "spawning yt-dlp");
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(if self.capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let group = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .map(Pid::from_raw);
        let stdout = child.stdout.take();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr was not captured"))?;

        Ok(Spawned {
            guard: ProcessGuard { child, group },
            stdout,
            diagnostics: Diagnostics::capture(stderr),
        })
    }
}

fn args<const N: usize>(values: [&str; N]) -> Vec<OsString> {
    values.into_iter().map(OsString::from).collect()
}

pub struct Spawned {
    pub guard: ProcessGuard,
    pub stdout: Option<ChildStdout>,
    pub diagnostics: Diagnostics,
}

/// Owns the child and its process group for as long as a request needs
/// them. Dropping the guard kills a group whose leader has not been reaped.
#[derive(Debug)]
pub struct ProcessGuard {
    child: Child,
    group: Option<Pid>,
}

impl ProcessGuard {
    /// Waits for exit. Cancel safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kills the whole process group and reaps the leader.
    pub async fn terminate(&mut self) {
        self.kill_group();
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        if let Err(err) = self.child.start_kill() {
            debug!(error = %err, "kill failed; process already gone");
        }
        if let Err(err) = self.child.wait().await {
            debug!(error = %err, "reaping killed process failed");
        }
    }

    /// Signals the group while its leader is unreaped; after that the id
    /// may already belong to someone else.
    fn kill_group(&self) {
        if self.child.id().is_none() {
            return;
        }
        if let Some(group) = self.group {
            // ESRCH just means every member has already exited.
            if let Err(err) = killpg(group, Signal::SIGKILL) {
                debug!(pgid = group.as_raw(), error = %err, "process group already gone");
            }
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            debug!(pid = ?self.child.id(), "killing yt-dlp on scope exit");
            self.kill_group();
            let _ = self.child.start_kill();
        }
    }
}

/// Background reader that drains stderr so the child never blocks on it.
#[derive(Debug)]
pub struct Diagnostics {
    task: Option<JoinHandle<String>>,
}

impl Diagnostics {
    fn capture(mut stderr: ChildStderr) -> Self {
        let task = tokio::spawn(async move {
            let mut tail = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        tail.extend_from_slice(&buf[..read]);
                        if tail.len() > DIAGNOSTIC_TAIL_BYTES {
                            let excess = tail.len() - DIAGNOSTIC_TAIL_BYTES;
                            tail.drain(..excess);
                        }
                    }
                }
            }
            String::from_utf8_lossy(&tail).into_owned()
        });
        Self { task: Some(task) }
    }

    /// Everything kept from stderr. Resolves once the pipe closes.
    pub async fn collect(mut self) -> String {
        match self.task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

impl Drop for Diagnostics {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The last `max_chars` characters, for log lines.
pub fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((offset, _)) => &text[offset..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::pid_alive;

    #[test]
    fn pipe_invocation_adds_merge_directive_for_mp4_only() {
        let mp4 = Invocation::pipe(Path::new("yt-dlp"), "https://youtu.be/x", "best", Container::Mp4);
        assert_eq!(
            mp4.args,
            args([
                "--no-playlist",
                "-f",
                "best",
                "-o",
                "-",
                "https://youtu.be/x",
                "--merge-output-format",
                "mp4"
            ])
        );
        let webm = Invocation::pipe(Path::new("yt-dlp"), "https://youtu.be/x", "best", Container::Webm);
        assert!(!webm.args.contains(&OsString::from("--merge-output-format")));
    }

    #[test]
    fn audio_invocation_carries_bitrate_and_output() {
        let inv = Invocation::audio(
            Path::new("yt-dlp"),
            Path::new("/usr/bin/ffmpeg"),
            "https://youtu.be/x",
            256,
            Path::new("/tmp/a/b.%(ext)s"),
        );
        assert!(!inv.capture_stdout);
        assert!(inv.args.contains(&OsString::from("256K")));
        assert!(inv.args.contains(&OsString::from("--embed-thumbnail")));
        assert!(!inv.args.contains(&OsString::from("-f")));
        assert_eq!(inv.args.last(), Some(&OsString::from("https://youtu.be/x")));
        let output = inv.args.iter().position(|arg| arg == "-o").unwrap();
        assert_eq!(inv.args[output + 1], OsString::from("/tmp/a/b.%(ext)s"));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("héllo wörld", 5), "wörld");
    }

    fn shell(script: &str) -> Invocation {
        Invocation {
            program: PathBuf::from("/bin/sh"),
            args: args(["-c", script]),
            capture_stdout: false,
        }
    }

    #[tokio::test]
    async fn diagnostics_capture_stderr_of_finished_process() {
        let Spawned {
            mut guard,
            diagnostics,
            ..
        } = shell("echo oops >&2; exit 3").spawn().unwrap();
        let status = guard.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(diagnostics.collect().await.contains("oops"));
    }

    #[tokio::test]
    async fn terminate_kills_a_running_process() {
        let Spawned { mut guard, .. } = shell("sleep 30").spawn().unwrap();
        guard.terminate().await;
        let status = guard.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn terminate_also_kills_background_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("sleep 30 & echo $! > '{}'; wait", pid_file.display());
        let Spawned { mut guard, .. } = shell(&script).spawn().unwrap();

        let mut helper = String::new();
        for _ in 0..100 {
            helper = std::fs::read_to_string(&pid_file).unwrap_or_default().trim().to_string();
            if !helper.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(pid_alive(&helper));

        guard.terminate().await;
        let mut gone = false;
        for _ in 0..100 {
            if !pid_alive(&helper) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "background helper {helper} survived terminate");
    }
}
