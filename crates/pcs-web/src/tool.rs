use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

const READ_BUF_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a finished invocation left behind.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Error text for a failed run: stderr, else stdout, else the exit code.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Handle on the external `baidupcs` executable.
#[derive(Debug, Clone)]
pub struct Tool {
    program: PathBuf,
}

impl Tool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub async fn run(&self, args: &[String]) -> Result<ToolOutput, ToolError> {
        self.run_streaming(args, None).await
    }

    /// Runs the tool to completion. When `chunks` is set, every piece of
    /// stdout is also sent there as soon as it is read, ahead of exit.
    /// There is no timeout: a hung tool hangs the caller.
    pub async fn run_streaming(
        &self,
        args: &[String],
        chunks: Option<mpsc::Sender<String>>,
    ) -> Result<ToolOutput, ToolError> {
        let program = self.program.display().to_string();
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout, stderr) = tokio::join!(
            async move {
                match stdout {
                    Some(pipe) => collect(pipe, chunks).await,
                    None => String::new(),
                }
            },
            async move {
                match stderr {
                    Some(pipe) => collect(pipe, None).await,
                    None => String::new(),
                }
            },
        );

        let status = child
            .wait()
            .await
            .map_err(|source| ToolError::Wait { program, source })?;

        Ok(ToolOutput {
            code: status.code(),
            stdout,
            stderr,
        })
    }
}

async fn collect<R>(mut reader: R, chunks: Option<mpsc::Sender<String>>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut text = String::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..read]);
        let chunk = drain_utf8(&mut pending, false);
        if chunk.is_empty() {
            continue;
        }
        text.push_str(&chunk);
        if let Some(tx) = chunks.as_ref() {
            let _ = tx.send(chunk).await;
        }
    }

    let rest = drain_utf8(&mut pending, true);
    if !rest.is_empty() {
        text.push_str(&rest);
        if let Some(tx) = chunks.as_ref() {
            let _ = tx.send(rest).await;
        }
    }
    text
}

/// Decodes as much of `pending` as is valid UTF-8. An incomplete character
/// at the end stays buffered for the next read unless `eof` is set.
fn drain_utf8(pending: &mut Vec<u8>, eof: bool) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(err) if err.error_len().is_none() && !eof => {
            let valid = err.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}
