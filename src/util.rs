use crate::process::{isolate_process_group, kill_process_group, ProcessGroupGuard};
use std::fs;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Shorten `text` to at most `max` characters, marking a cut with `...`.
/// Used to keep API error bodies readable in log lines.
pub fn truncate(text: &str, max: usize) -> String {
    if text.char_indices().nth(max).is_none() {
        return text.to_string();
    }
    if max <= 3 {
        return text.chars().take(max).collect();
    }
    let mut kept: String = text.chars().take(max - 3).collect();
    kept.push_str("...");
    kept
}

/// Keep the last `max_chars` characters of `text` (Unicode-safe).
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect::<String>()
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }

    /// Combined stdout/stderr, trimmed to the last `max_chars` characters.
    pub fn output_tail(&self, max_chars: usize) -> String {
        let mut combined = String::new();
        if !self.stdout.trim().is_empty() {
            combined.push_str(self.stdout.trim_end());
            combined.push('\n');
        }
        if !self.stderr.trim().is_empty() {
            combined.push_str(self.stderr.trim_end());
        }
        tail_chars(&combined, max_chars)
    }
}

/// Run `command`, optionally feeding `input` on stdin, and kill its whole
/// process group once `timeout` elapses.
pub fn run_command_with_input(
    command: &mut Command,
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    isolate_process_group(command);
    let mut child = command
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdin_handle = match (input, child.stdin.take()) {
        (Some(bytes), Some(mut stdin)) => {
            let bytes = bytes.to_vec();
            Some(thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            }))
        }
        _ => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stdout);
        let _ = reader.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    kill_process_group(child.id());
                    let _ = child.kill();
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(format!("Failed to wait for command: {}", e)),
        }
    };

    if let Some(handle) = stdin_handle {
        let _ = handle.join();
    }
    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
    })
}

/// Async counterpart of [`run_command_with_input`].
///
/// Dropping the returned future kills the command's whole process group.
pub async fn run_command_async(
    command: &mut tokio::process::Command,
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    #[cfg(unix)]
    command.process_group(0);
    command
        .kill_on_drop(true)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;
    let _group = child.id().map(ProcessGroupGuard::new);

    let stdin_task = match (input, child.stdin.take()) {
        (Some(bytes), Some(mut stdin)) => {
            let bytes = bytes.to_vec();
            Some(tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let _ = stdin.write_all(&bytes).await;
            }))
        }
        _ => None,
    };

    let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
    if let Some(task) = stdin_task {
        task.abort();
    }
    match waited {
        Ok(Ok(output)) => Ok(CommandRunResult {
            status: Some(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
        }),
        Ok(Err(e)) => Err(format!("Failed to wait for command: {}", e)),
        Err(_) => Ok(CommandRunResult {
            status: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        }),
    }
}

/// 64-bit FNV-1a digest of `text` as 16 hex digits. Environment cache
/// directories are named with it, so the output must never change.
pub fn hash_str(text: &str) -> String {
    let digest = text.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    });
    format!("{:016x}", digest)
}

/// Reduce `input` to a filesystem-safe path component.
pub fn sanitize_component(input: &str) -> String {
    let cleaned = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect::<String>();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Write `content` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_tail_chars_keeps_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("abc", 0), "");
    }

    #[test]
    fn test_hash_str_is_stable() {
        let a = hash_str("hello");
        let b = hash_str("hello");
        let c = hash_str("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Published FNV-1a vectors; existing caches depend on them.
        assert_eq!(hash_str(""), "cbf29ce484222325");
        assert_eq!(hash_str("a"), "af63dc4c8601ec8c");
    }

    #[test]
    fn test_truncate_leaves_short_text_alone() {
        assert_eq!(truncate("abc", 3), "abc");
        assert_eq!(truncate("", 0), "");
        assert_eq!(truncate("upstream timed out", 10), "upstrea...");
    }

    #[test]
    fn test_sanitize_component_strips_separators() {
        assert_eq!(sanitize_component("../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_component("libpng-1_2"), "libpng-1_2");
        assert_eq!(sanitize_component("///"), "unnamed");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_feeds_stdin() {
        let mut cmd = Command::new("cat");
        let result =
            run_command_with_input(&mut cmd, Some(b"hello stdin"), Duration::from_secs(10))
                .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello stdin");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let start = Instant::now();
        let result = run_command_with_input(&mut cmd, None, Duration::from_millis(200)).unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_async_captures_output() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg("read line; echo got:$line; echo oops >&2; exit 3");
        let result = run_command_async(&mut cmd, Some(b"ping\n"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.status.and_then(|s| s.code()), Some(3));
        assert_eq!(result.stdout.trim(), "got:ping");
        assert!(result.output_tail(100).contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_async_times_out() {
        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("30");
        let result = run_command_async(&mut cmd, None, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(result.timed_out);
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        write_atomic(&path, "one").unwrap();
        write_atomic(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert!(!path.with_extension("tmp").exists());
    }
}
