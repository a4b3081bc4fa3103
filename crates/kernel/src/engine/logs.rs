//! Log domain — tail and follow for a container's output.

use bollard::container::LogOutput;
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{BoxStream, StreamExt};
use serde::Serialize;

use super::client::{DockerEngine, EngineError};

pub const TAIL_DEFAULT: u32 = 50;
pub const TAIL_MAX: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    /// Unix nanoseconds, parsed from the engine's timestamp prefix.
    pub timestamp: i64,
    pub source: LogSource,
    pub content: Bytes,
}

impl DockerEngine {
    pub(super) async fn tail_logs(
        &self,
        container_id: &str,
        tail: u32,
    ) -> Result<Vec<LogLine>, EngineError> {
        if tail == 0 {
            return Ok(vec![]);
        }
        let tail = tail.min(TAIL_MAX);
        let mut stream = self.raw_log_stream(container_id, false, Some(tail));
        let mut lines = Vec::new();
        while let Some(result) = stream.next().await {
            lines.push(result?);
        }
        Ok(lines)
    }

    pub(super) fn follow_logs(
        &self,
        container_id: &str,
        follow: bool,
    ) -> BoxStream<'static, Result<LogLine, EngineError>> {
        self.raw_log_stream(container_id, follow, None)
    }

    fn raw_log_stream(
        &self,
        container_id: &str,
        follow: bool,
        tail: Option<u32>,
    ) -> BoxStream<'static, Result<LogLine, EngineError>> {
        use bollard::query_parameters::LogsOptions;

        let options = LogsOptions {
            follow,
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let client = self.client.clone();
        let container_id = container_id.to_string();
        Box::pin(async_stream::stream! {
            let mut logs = client.logs(&container_id, Some(options));
            while let Some(result) = logs.next().await {
                match result {
                    Ok(output) => yield Ok(convert_log(output)),
                    Err(e) => {
                        yield Err(EngineError::from(e));
                        break;
                    }
                }
            }
        })
    }
}

/// Split the engine's `timestamps: true` output into `(nanos, content)`.
/// The prefix is RFC3339Nano followed by one space; anything unparsable
/// falls back to "now" with the raw bytes kept intact.
pub(crate) fn convert_log(output: LogOutput) -> LogLine {
    let (source, raw) = match output {
        LogOutput::StdErr { message } => (LogSource::Stderr, message),
        LogOutput::StdOut { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => (LogSource::Stdout, message),
    };

    let now = || Utc::now().timestamp_nanos_opt().unwrap_or(0);

    let Some(space) = raw.iter().position(|&b| b == b' ') else {
        return LogLine {
            timestamp: now(),
            source,
            content: raw,
        };
    };

    let parsed = std::str::from_utf8(&raw[..space])
        .ok()
        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
        .and_then(|dt| dt.timestamp_nanos_opt());

    match parsed {
        Some(timestamp) => {
            let content = if space + 1 < raw.len() {
                raw.slice(space + 1..)
            } else {
                Bytes::new()
            };
            LogLine {
                timestamp,
                source,
                content,
            }
        }
        None => LogLine {
            timestamp: now(),
            source,
            content: raw,
        },
    }
}

/// Clamp a caller-supplied tail parameter: default 50, max 1000.
pub fn clamp_tail(requested: Option<u32>) -> u32 {
    requested.unwrap_or(TAIL_DEFAULT).min(TAIL_MAX)
}
