//! The processing-function seam and its external-command implementation.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use imgfleet_core::Operation;
use imgfleet_core::config::ProcessorConfig;

/// Outcome classification of a failed transformation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessingError {
    /// Worth another attempt, possibly on another worker.
    #[error("retryable processing failure: {0}")]
    Retryable(String),

    /// The input or operation can never succeed.
    #[error("terminal processing failure: {0}")]
    Terminal(String),
}

impl ProcessingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Retryable(r) | Self::Terminal(r) => r,
        }
    }
}

pub type ProcessFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Bytes, ProcessingError>> + Send + 'a>>;

/// An image transformation.
pub trait Processor: Send + Sync {
    fn process<'a>(&'a self, operation: &'a Operation, input: Bytes) -> ProcessFuture<'a>;
}

/// Runs an external image tool on temp files.
///
/// Arguments come from the configuration. When `allow_operation_args` is
/// set, an operation may carry its own `"args"` array instead; such
/// arguments can only reach the temp files through the placeholders.
/// `{input}` and `{output}` are replaced by the temp file paths. The operation's `"format"` (default `png`) picks the output
/// file extension, which tools such as ImageMagick use to choose the codec.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    allow_operation_args: bool,
}

const STDERR_LIMIT: usize = 512;

impl CommandProcessor {
    pub fn new(config: &ProcessorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout,
            allow_operation_args: config.allow_operation_args,
        }
    }

    fn args_for(&self, operation: &Operation) -> Result<Vec<String>, ProcessingError> {
        match operation.0.get("args") {
            None => Ok(self.args.clone()),
            Some(_) if !self.allow_operation_args => Err(ProcessingError::Terminal(
                "operation args are disabled on this worker".to_string(),
            )),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|v| {
                    let arg = v.as_str().ok_or_else(|| {
                        ProcessingError::Terminal(format!("operation arg {v} is not a string"))
                    })?;
                    check_operation_arg(arg)?;
                    Ok(arg.to_string())
                })
                .collect(),
            Some(other) => Err(ProcessingError::Terminal(format!(
                "operation args must be an array, got {other}"
            ))),
        }
    }

    fn output_name(operation: &Operation) -> Result<String, ProcessingError> {
        let format = operation
            .0
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("png");
        if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ProcessingError::Terminal(format!(
                "invalid output format {format:?}"
            )));
        }
        Ok(format!("output.{format}"))
    }

    async fn run(&self, operation: &Operation, input: Bytes) -> Result<Bytes, ProcessingError> {
        let template = self.args_for(operation)?;
        let output_name = Self::output_name(operation)?;

        let workdir = tempfile::tempdir()
            .map_err(|e| ProcessingError::Retryable(format!("creating temp dir: {e}")))?;
        let input_path = workdir.path().join("input");
        let output_path = workdir.path().join(output_name);
        tokio::fs::write(&input_path, &input)
            .await
            .map_err(|e| ProcessingError::Retryable(format!("writing input: {e}")))?;

        let args: Vec<String> = template
            .iter()
            .map(|a| substitute(a, &input_path, &output_path))
            .collect();
        debug!(program = %self.program, ?args, "running processor");

        let child = Command::new(&self.program)
            .args(&args)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProcessingError::Retryable(format!("failed to start {}: {e}", self.program))
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProcessingError::Retryable(format!(
                    "waiting for {}: {e}",
                    self.program
                )));
            }
            Err(_) => {
                warn!(
                    program = %self.program,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "processor timed out"
                );
                return Err(ProcessingError::Retryable(format!(
                    "{} timed out after {:?}",
                    self.program, self.timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = tail(stderr.trim(), STDERR_LIMIT);
            return Err(ProcessingError::Terminal(if stderr.is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                format!("{} exited with {}: {stderr}", self.program, output.status)
            }));
        }

        let bytes = tokio::fs::read(&output_path).await.map_err(|e| {
            ProcessingError::Terminal(format!("{} produced no output: {e}", self.program))
        })?;
        info!(
            program = %self.program,
            input_bytes = input.len(),
            output_bytes = bytes.len(),
            "processed image"
        );
        Ok(Bytes::from(bytes))
    }
}

impl Processor for CommandProcessor {
    fn process<'a>(&'a self, operation: &'a Operation, input: Bytes) -> ProcessFuture<'a> {
        Box::pin(self.run(operation, input))
    }
}

/// Operation-supplied arguments are options and values only. Files are
/// reached through a bare `{input}` or `{output}`; anything that could name
/// another path is refused.
fn check_operation_arg(arg: &str) -> Result<(), ProcessingError> {
    if arg == "{input}" || arg == "{output}" {
        return Ok(());
    }
    let names_path = arg.contains(['/', '\\', '{', '}'])
        || arg.contains("..")
        || arg.starts_with(['~', '@', '|']);
    if names_path {
        return Err(ProcessingError::Terminal(format!(
            "operation arg {arg:?} is not allowed"
        )));
    }
    Ok(())
}

fn substitute(arg: &str, input: &Path, output: &Path) -> String {
    arg.replace("{input}", &input.to_string_lossy())
        .replace("{output}", &output.to_string_lossy())
}

/// Last `limit` bytes of `s`, cut on a char boundary.
fn tail(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn processor(program: &str, args: &[&str], timeout: Duration) -> CommandProcessor {
        CommandProcessor::new(&ProcessorConfig {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout,
            allow_operation_args: true,
        })
    }

    #[test]
    fn default_args_describe_a_512_square_canvas() {
        let p = CommandProcessor::new(&ProcessorConfig::default());
        let args = p.args_for(&Operation::default()).unwrap();
        assert_eq!(args.first().map(String::as_str), Some("{input}"));
        assert_eq!(args.last().map(String::as_str), Some("{output}"));
        assert!(args.iter().any(|a| a == "-extent"));
    }

    #[test]
    fn operation_can_override_args() {
        let p = processor("convert", &["{input}", "{output}"], Duration::from_secs(1));
        let op = Operation::new(json!({"args": ["{input}", "-negate", "{output}"]}));
        assert_eq!(p.args_for(&op).unwrap(), vec!["{input}", "-negate", "{output}"]);

        let bad = Operation::new(json!({"args": ["{input}", 5]}));
        assert!(matches!(p.args_for(&bad), Err(ProcessingError::Terminal(_))));
        let bad = Operation::new(json!({"args": "-negate"}));
        assert!(matches!(p.args_for(&bad), Err(ProcessingError::Terminal(_))));
    }

    #[test]
    fn operation_args_are_off_by_default() {
        let p = CommandProcessor::new(&ProcessorConfig::default());
        let op = Operation::new(json!({"args": ["{input}", "-negate", "{output}"]}));
        let err = p.args_for(&op).unwrap_err();
        assert!(err.reason().contains("disabled"));
    }

    #[test]
    fn operation_args_cannot_name_other_paths() {
        let p = processor("convert", &["{input}", "{output}"], Duration::from_secs(1));
        for args in [
            json!(["/etc/passwd", "{output}"]),
            json!(["{input}", "/some/path"]),
            json!(["{input}", "../escape.png"]),
            json!(["@/etc/hosts", "{output}"]),
            json!(["{input}", "png:{output}"]),
            json!(["{input}", "~/x.png"]),
        ] {
            let op = Operation::new(json!({ "args": args }));
            assert!(
                matches!(p.args_for(&op), Err(ProcessingError::Terminal(_))),
                "accepted {op:?}"
            );
        }
        let ok = Operation::new(json!({"args": ["{input}", "-resize", "50%", "{output}"]}));
        assert!(p.args_for(&ok).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn outside_file_is_never_read() {
        let p = processor("cp", &["{input}", "{output}"], Duration::from_secs(10));
        let op = Operation::new(json!({"args": ["/etc/hostname", "{output}"]}));
        let err = p.process(&op, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Terminal(_)));
    }

    #[test]
    fn output_format_is_validated() {
        assert_eq!(
            CommandProcessor::output_name(&Operation::default()).unwrap(),
            "output.png"
        );
        let jpg = Operation::new(json!({"format": "jpg"}));
        assert_eq!(CommandProcessor::output_name(&jpg).unwrap(), "output.jpg");
        let evil = Operation::new(json!({"format": "../x"}));
        assert!(CommandProcessor::output_name(&evil).is_err());
    }

    #[test]
    fn placeholders_are_substituted() {
        let out = substitute("{input}:{output}", Path::new("/t/in"), Path::new("/t/out.png"));
        assert_eq!(out, "/t/in:/t/out.png");
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("aé", 1), "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_command_returns_output_file() {
        let p = processor("cp", &["{input}", "{output}"], Duration::from_secs(10));
        let out = p
            .process(&Operation::default(), Bytes::from_static(b"image"))
            .await
            .unwrap();
        assert_eq!(out, Bytes::from_static(b"image"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_terminal() {
        let p = processor("false", &[], Duration::from_secs(10));
        let err = p
            .process(&Operation::default(), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_output_is_terminal() {
        let p = processor("true", &[], Duration::from_secs(10));
        let err = p
            .process(&Operation::default(), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Terminal(_)));
    }

    #[tokio::test]
    async fn missing_program_is_retryable() {
        let p = processor("/nonexistent/imgfleet-tool", &[], Duration::from_secs(10));
        let err = p
            .process(&Operation::default(), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_is_retryable() {
        let p = processor("sleep", &["5"], Duration::from_millis(100));
        let err = p
            .process(&Operation::default(), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.reason().contains("timed out"));
    }
}
