use crate::tool::{Tool, ToolError, ToolOutput};
use pcs_core::{
    parse_identity, parse_listing, parse_progress, parse_quota, ArgumentError, Command, Envelope,
    ProgressTracker, ServerEvent, ServerMessage,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RETRY_COUNT: &str = "3";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{command}: missing argument '{name}'")]
    MissingArgument { command: String, name: &'static str },
    #[error("{0}")]
    Spawn(#[from] ToolError),
    #[error("{action} failed: {detail}")]
    ToolFailed { action: &'static str, detail: String },
    #[error("{action}: unrecognized output from tool")]
    Unparseable { action: &'static str },
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::UnknownCommand(_) => "unknown_command",
            CommandError::MissingArgument { .. } => "missing_argument",
            CommandError::Spawn(_) => "spawn_failed",
            CommandError::ToolFailed { .. } => "tool_failed",
            CommandError::Unparseable { .. } => "unparseable_output",
        }
    }
}

impl From<ArgumentError> for CommandError {
    fn from(err: ArgumentError) -> Self {
        match err {
            ArgumentError::UnknownCommand(name) => CommandError::UnknownCommand(name),
            ArgumentError::Missing { command, name } => {
                CommandError::MissingArgument { command, name }
            }
        }
    }
}

/// Write side of one request: every event it emits carries that request's
/// id. Sends to a connection that has gone away are dropped.
#[derive(Clone)]
pub struct Responder {
    request_id: Option<String>,
    tx: mpsc::Sender<ServerMessage>,
}

impl Responder {
    pub fn new(request_id: Option<String>, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { request_id, tx }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub async fn emit(&self, event: ServerEvent) {
        let message = ServerMessage::tagged(event, self.request_id.clone());
        let _ = self.tx.send(message).await;
    }
}

pub struct Dispatcher {
    tool: Tool,
    download_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(tool: Tool, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            download_dir: download_dir.into(),
        }
    }

    /// Runs one request to completion, emitting exactly one terminal event
    /// (preceded by start/progress events for downloads).
    pub async fn dispatch(&self, envelope: Envelope, responder: Responder) {
        info!(
            event = "command_received",
            command = %envelope.command,
            request_id = responder.request_id().unwrap_or("")
        );
        let outcome = match Command::from_envelope(&envelope) {
            Ok(command) => self.execute(command, &responder).await,
            Err(err) => Err(err.into()),
        };
        let event = match outcome {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    event = "command_failed",
                    command = %envelope.command,
                    code = err.code(),
                    error = %err
                );
                ServerEvent::error(err.code(), err.to_string())
            }
        };
        responder.emit(event).await;
    }

    async fn execute(
        &self,
        command: Command,
        responder: &Responder,
    ) -> Result<ServerEvent, CommandError> {
        match command {
            Command::Login { bduss } => {
                self.invoke("login", args(["login", "-bduss", &bduss])).await?;
                Ok(ServerEvent::LoginSuccess {
                    message: "login succeeded".to_string(),
                })
            }
            Command::List { path } => {
                let output = self.invoke("list", args(["ls", &path])).await?;
                Ok(ServerEvent::FileList {
                    data: parse_listing(&output.stdout, &path),
                    path,
                })
            }
            Command::Download { path, filename } => {
                self.download(&path, filename.as_deref(), responder).await
            }
            Command::Mkdir { path } => {
                let output = self.invoke("mkdir", args(["mkdir", &path])).await?;
                Ok(ServerEvent::MkdirSuccess {
                    message: with_output("directory created", &output),
                })
            }
            Command::Remove { path } => {
                let output = self.invoke("delete", args(["rm", &path])).await?;
                Ok(ServerEvent::DeleteSuccess {
                    message: with_output("deleted", &output),
                })
            }
            Command::Quota => {
                let output = self.invoke("quota", args(["quota"])).await?;
                let data = parse_quota(&output.stdout)
                    .ok_or(CommandError::Unparseable { action: "quota" })?;
                Ok(ServerEvent::QuotaInfo { data })
            }
            Command::Move { from, to } => {
                let output = self.invoke("move", args(["mv", &from, &to])).await?;
                Ok(ServerEvent::MoveSuccess {
                    message: with_output("moved", &output),
                })
            }
            Command::Copy { from, to } => {
                let output = self.invoke("copy", args(["cp", &from, &to])).await?;
                Ok(ServerEvent::CopySuccess {
                    message: with_output("copied", &output),
                })
            }
            Command::Who => {
                let output = self.invoke("who", args(["who"])).await?;
                Ok(ServerEvent::WhoInfo {
                    data: parse_identity(&output.stdout),
                })
            }
        }
    }

    async fn invoke(
        &self,
        action: &'static str,
        args: Vec<String>,
    ) -> Result<ToolOutput, CommandError> {
        let output = self.tool.run(&args).await?;
        ensure_success(action, output)
    }

    async fn download(
        &self,
        remote: &str,
        filename: Option<&str>,
        responder: &Responder,
    ) -> Result<ServerEvent, CommandError> {
        let filename = local_filename(remote, filename);
        let local_path = self.download_dir.join(&filename);
        let local_display = local_path.display().to_string();
        info!(event = "download_start", remote = remote, local = %local_display);

        responder
            .emit(ServerEvent::DownloadStart {
                filename: filename.clone(),
            })
            .await;

        let argv = args([
            "download",
            "--retry",
            RETRY_COUNT,
            remote,
            "--save",
            &local_display,
        ]);
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let run = self.tool.run_streaming(&argv, Some(tx));
        let relay = async {
            let mut tracker = ProgressTracker::new();
            while let Some(chunk) = rx.recv().await {
                debug!(event = "download_output", chunk = %chunk.trim_end());
                let Some(sample) = parse_progress(&chunk) else {
                    continue;
                };
                let progress = tracker.observe(&sample);
                responder
                    .emit(ServerEvent::DownloadProgress {
                        progress,
                        current: sample.current.unwrap_or_default(),
                        total: sample.total.unwrap_or_default(),
                        speed: sample.speed.unwrap_or_default(),
                        remaining: sample.remaining.unwrap_or_default(),
                    })
                    .await;
            }
        };
        let (output, ()) = tokio::join!(run, relay);
        let output = output?;
        if !output.stderr.trim().is_empty() {
            warn!(event = "download_stderr", remote = remote, stderr = %output.stderr.trim());
        }
        ensure_success("download", output)?;

        Ok(ServerEvent::DownloadComplete {
            message: "download complete".to_string(),
            local_path: local_display,
        })
    }
}

fn ensure_success(action: &'static str, output: ToolOutput) -> Result<ToolOutput, CommandError> {
    if output.success() {
        Ok(output)
    } else {
        Err(CommandError::ToolFailed {
            action,
            detail: output.failure_detail(),
        })
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn with_output(summary: &str, output: &ToolOutput) -> String {
    let detail = output.stdout.trim();
    if detail.is_empty() {
        summary.to_string()
    } else {
        format!("{summary}: {detail}")
    }
}

/// Name to save a download under: the requested filename or the remote
/// path's last segment. Only the final component is kept so the file always
/// lands directly in the download directory.
fn local_filename(remote: &str, requested: Option<&str>) -> String {
    let candidate = requested.unwrap_or(remote);
    Path::new(candidate.trim_end_matches('/'))
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty() && *name != "..")
        .map(str::to_string)
        .unwrap_or_else(|| "download".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> Envelope {
        Envelope::decode(value.to_string().as_bytes()).unwrap()
    }

    async fn run(dispatcher: &Dispatcher, value: serde_json::Value) -> Vec<ServerMessage> {
        let (tx, mut rx) = mpsc::channel(256);
        let env = envelope(value);
        let responder = Responder::new(env.request_id.clone(), tx);
        dispatcher.dispatch(env, responder).await;
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn error_code(message: &ServerMessage) -> &str {
        match &message.event {
            ServerEvent::Error { code, .. } => code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn local_filename_keeps_only_last_component() {
        assert_eq!(local_filename("/movies/a.mkv", None), "a.mkv");
        assert_eq!(local_filename("/movies/season 1/", None), "season 1");
        assert_eq!(local_filename("/x/a.mkv", Some("b.mkv")), "b.mkv");
        assert_eq!(local_filename("/x/a.mkv", Some("../../etc/passwd")), "passwd");
        assert_eq!(local_filename("/", None), "download");
    }

    #[tokio::test]
    async fn unknown_command_errors_without_spawning() {
        let dispatcher = Dispatcher::new(Tool::new("/nonexistent/baidupcs"), "/tmp");
        let messages = run(
            &dispatcher,
            json!({"command": "frobnicate", "args": {}, "requestId": "r1"}),
        )
        .await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].request_id.as_deref(), Some("r1"));
        assert_eq!(error_code(&messages[0]), "unknown_command");
        match &messages[0].event {
            ServerEvent::Error { message, .. } => assert!(message.contains("frobnicate")),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn missing_argument_errors_without_spawning() {
        let dispatcher = Dispatcher::new(Tool::new("/nonexistent/baidupcs"), "/tmp");
        let messages = run(&dispatcher, json!({"command": "mkdir", "requestId": "r2"})).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(error_code(&messages[0]), "missing_argument");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_as_tagged_error() {
        let dispatcher = Dispatcher::new(Tool::new("/nonexistent/baidupcs"), "/tmp");
        let messages = run(&dispatcher, json!({"command": "who", "requestId": "r3"})).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].request_id.as_deref(), Some("r3"));
        assert_eq!(error_code(&messages[0]), "spawn_failed");
    }

    #[cfg(unix)]
    mod with_fake_tool {
        use super::*;
        use crate::tool::tests::fake_tool;

        fn dispatcher(dir: &Path, body: &str) -> Dispatcher {
            Dispatcher::new(Tool::new(fake_tool(dir, body)), dir.join("downloads"))
        }

        #[tokio::test]
        async fn ls_defaults_to_root_and_prefixes_entries_once() {
            let dir = tempfile::tempdir().unwrap();
            let dispatcher = dispatcher(
                dir.path(),
                r#"[ "$1" = "ls" ] && [ "$2" = "/" ] || exit 9
echo "当前目录: /"
echo "----"
echo "  #  文件大小  修改日期  文件(目录)"
echo "  0  -  2024-01-01 10:00:00  photos/"
echo "  1  2.00MB  2024-01-02 11:00:00  notes.txt""#,
            );
            let messages = run(&dispatcher, json!({"command": "ls", "requestId": "r4"})).await;
            assert_eq!(messages.len(), 1);
            match &messages[0].event {
                ServerEvent::FileList { data, path } => {
                    assert_eq!(path, "/");
                    let paths: Vec<&str> = data.iter().map(|e| e.path.as_str()).collect();
                    assert_eq!(paths, vec!["/photos", "/notes.txt"]);
                    assert!(data[0].is_dir);
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn nonzero_exit_carries_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let dispatcher = dispatcher(dir.path(), r#"echo "file not found" >&2; exit 1"#);
            let messages = run(
                &dispatcher,
                json!({"command": "rm", "args": {"path": "/gone"}, "requestId": "r5"}),
            )
            .await;
            assert_eq!(messages.len(), 1);
            match &messages[0].event {
                ServerEvent::Error { code, message } => {
                    assert_eq!(code, "tool_failed");
                    assert_eq!(message, "delete failed: file not found");
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn quota_and_who_are_parsed() {
            let dir = tempfile::tempdir().unwrap();
            let dispatcher = dispatcher(
                dir.path(),
                r#"case "$1" in
quota) echo "总空间: 100.00GB, 已用空间: 25.00GB, 比率: 25.00%" ;;
who) echo "uid: 99, 用户名: bob, 性别: 未知" ;;
esac"#,
            );
            let quota = run(&dispatcher, json!({"command": "quota", "requestId": "q"})).await;
            assert_eq!(
                serde_json::to_value(&quota[0]).unwrap(),
                json!({
                    "type": "quota_info",
                    "data": {"total": "100.00GB", "used": "25.00GB", "percent": "25.00"},
                    "requestId": "q",
                })
            );

            let who = run(&dispatcher, json!({"command": "who", "requestId": "w"})).await;
            assert_eq!(
                serde_json::to_value(&who[0]).unwrap(),
                json!({"type": "who_info", "data": {"username": "bob", "uid": "99"}, "requestId": "w"})
            );
        }

        #[tokio::test]
        async fn quota_without_usage_line_is_unparseable() {
            let dir = tempfile::tempdir().unwrap();
            let dispatcher = dispatcher(dir.path(), "echo 'something else entirely'");
            let messages = run(&dispatcher, json!({"command": "quota", "requestId": "q"})).await;
            assert_eq!(error_code(&messages[0]), "unparseable_output");
        }

        #[tokio::test]
        async fn mv_passes_both_paths_and_reports_output() {
            let dir = tempfile::tempdir().unwrap();
            let dispatcher = dispatcher(dir.path(), r#"echo "$1 [$2] -> [$3]""#);
            let messages = run(
                &dispatcher,
                json!({"command": "mv", "args": {"from": "/a b", "to": "/c"}, "requestId": "m"}),
            )
            .await;
            assert_eq!(
                messages[0].event,
                ServerEvent::MoveSuccess {
                    message: "moved: mv [/a b] -> [/c]".to_string()
                }
            );
        }

        #[tokio::test]
        async fn download_streams_monotonic_progress_then_completes() {
            let dir = tempfile::tempdir().unwrap();
            let dispatcher = dispatcher(
                dir.path(),
                r#"[ "$1 $2 $3" = "download --retry 3" ] || exit 9
[ "$5" = "--save" ] || exit 9
echo "↓ 25.00MB/100.00MB 5.00MB/s in 5s, left 15s"
sleep 0.05
echo "↓ 10.00MB/100.00MB 5.00MB/s in 6s, left 18s"
sleep 0.05
echo "[1] ↓ 80.00MB/100.00MB 9.00MB/s in 9s"
sleep 0.05
echo "done""#,
            );
            let messages = run(
                &dispatcher,
                json!({"command": "download", "args": {"path": "/v/film.mkv"}, "requestId": "d"}),
            )
            .await;

            assert!(messages.iter().all(|m| m.request_id.as_deref() == Some("d")));
            assert_eq!(
                messages[0].event,
                ServerEvent::DownloadStart {
                    filename: "film.mkv".to_string()
                }
            );
            let progress: Vec<u8> = messages
                .iter()
                .filter_map(|m| match m.event {
                    ServerEvent::DownloadProgress { progress, .. } => Some(progress),
                    _ => None,
                })
                .collect();
            assert_eq!(progress, vec![25, 25, 80]);

            let expected_path = dir.path().join("downloads").join("film.mkv");
            assert_eq!(
                messages.last().unwrap().event,
                ServerEvent::DownloadComplete {
                    message: "download complete".to_string(),
                    local_path: expected_path.display().to_string(),
                }
            );
        }

        #[tokio::test]
        async fn failed_download_never_completes() {
            let dir = tempfile::tempdir().unwrap();
            let dispatcher = dispatcher(
                dir.path(),
                r#"echo "↓ 1.00MB/2.00MB 1.00MB/s in 1s, left 1s"
echo "network unreachable" >&2
exit 2"#,
            );
            let messages = run(
                &dispatcher,
                json!({"command": "download", "args": {"path": "/a.bin", "filename": "b.bin"}, "requestId": "d"}),
            )
            .await;

            assert_eq!(messages.first().unwrap().event.kind(), "download_start");
            assert!(messages.iter().any(|m| m.event.kind() == "download_progress"));
            assert!(!messages.iter().any(|m| m.event.kind() == "download_complete"));
            let last = messages.last().unwrap();
            assert_eq!(last.request_id.as_deref(), Some("d"));
            assert_eq!(error_code(last), "tool_failed");
        }
    }
}
