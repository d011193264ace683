//! Worker protocol types shared by the supervisor and the HTTP surface.
//!
//! A worker reads one [`WorkerInput`] line from stdin and prints zero or more
//! [`WorkerOutput`] envelopes to stdout, each wrapped in a marker pair on
//! lines of their own. Everything outside a marker pair is log noise.

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

/// Must match the constants in the worker image.
pub const OUTPUT_START_MARKER: &str = "---GROUPVISOR_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---GROUPVISOR_OUTPUT_END---";

/// Input payload written to worker stdin as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_id: String,
    pub is_main: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_scheduled_task: bool,
}

/// One envelope parsed from between the output markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOutput {
    pub status: WorkerStatus,
    #[serde(default, deserialize_with = "string_or_json")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerOutput {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == WorkerStatus::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Success,
    Error,
}

/// Workers sometimes return structured results; keep them as JSON text.
fn string_or_json<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// A volume mount for worker execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

/// What a single line did to the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockEvent {
    Envelope(WorkerOutput),
    /// A complete block whose body was not a valid envelope.
    Malformed(String),
    /// The block grew past the byte cap and was abandoned.
    Overflow { bytes: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Scanning,
    InBlock,
}

/// Line-oriented scanner for marker-delimited output blocks.
///
/// Feed it stdout one line at a time. Lines outside a block are ignored;
/// a block that exceeds `max_block_bytes` is dropped and scanning resumes
/// at the next start marker.
#[derive(Debug)]
pub struct OutputBlockParser {
    max_block_bytes: usize,
    state: ParserState,
    buffer: String,
}

impl OutputBlockParser {
    pub fn new(max_block_bytes: usize) -> Self {
        Self {
            max_block_bytes,
            state: ParserState::Scanning,
            buffer: String::new(),
        }
    }

    pub fn feed(&mut self, line: &str) -> Option<BlockEvent> {
        let line = line.trim_end_matches(['\n', '\r']);
        let marker = line.trim();

        match self.state {
            ParserState::Scanning => {
                if marker == OUTPUT_START_MARKER {
                    self.state = ParserState::InBlock;
                    self.buffer.clear();
                }
                None
            }
            ParserState::InBlock => {
                if marker == OUTPUT_END_MARKER {
                    self.state = ParserState::Scanning;
                    let body = std::mem::take(&mut self.buffer);
                    return Some(match serde_json::from_str::<WorkerOutput>(body.trim()) {
                        Ok(output) => BlockEvent::Envelope(output),
                        Err(err) => BlockEvent::Malformed(err.to_string()),
                    });
                }
                if marker == OUTPUT_START_MARKER {
                    warn!(
                        dropped_bytes = self.buffer.len(),
                        "start marker inside an open block, restarting block"
                    );
                    self.buffer.clear();
                    return None;
                }

                self.buffer.push_str(line);
                self.buffer.push('\n');
                if self.buffer.len() > self.max_block_bytes {
                    let bytes = self.buffer.len();
                    self.buffer.clear();
                    self.state = ParserState::Scanning;
                    return Some(BlockEvent::Overflow { bytes });
                }
                None
            }
        }
    }

    /// Account for a line the reader had to cut short. Inside a block the
    /// block is abandoned; outside one the line is noise.
    pub fn overlong_line(&mut self, line_bytes: usize) -> Option<BlockEvent> {
        if self.state == ParserState::Scanning {
            return None;
        }
        let bytes = self.buffer.len() + line_bytes;
        self.buffer.clear();
        self.state = ParserState::Scanning;
        Some(BlockEvent::Overflow { bytes })
    }

    /// True when the stream ended in the middle of a block.
    pub fn in_block(&self) -> bool {
        self.state == ParserState::InBlock
    }
}

/// Parse every well-formed envelope out of a complete stdout capture.
pub fn parse_output_blocks(stdout: &str, max_block_bytes: usize) -> Vec<WorkerOutput> {
    let mut parser = OutputBlockParser::new(max_block_bytes);
    stdout
        .lines()
        .filter_map(|line| match parser.feed(line) {
            Some(BlockEvent::Envelope(output)) => Some(output),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(json: &str) -> String {
        format!("{OUTPUT_START_MARKER}\n{json}\n{OUTPUT_END_MARKER}\n")
    }

    #[test]
    fn worker_input_serializes_camel_case() {
        let input = WorkerInput {
            prompt: "hello".to_string(),
            session_id: Some("sess-123".to_string()),
            group_folder: "main".to_string(),
            chat_id: "tg:123".to_string(),
            is_main: true,
            is_scheduled_task: false,
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"chatId\""));
        assert!(json.contains("\"groupFolder\""));
        assert!(json.contains("\"isMain\""));
        assert!(json.contains("\"sessionId\""));
        assert!(!json.contains("isScheduledTask"));
        assert!(!json.contains('\n'));
    }

    #[test]
    fn worker_output_deserializes() {
        let json = r#"{"status":"success","result":"Hello!","newSessionId":"sess-456"}"#;
        let output: WorkerOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.status, WorkerStatus::Success);
        assert_eq!(output.result.as_deref(), Some("Hello!"));
        assert_eq!(output.new_session_id.as_deref(), Some("sess-456"));
    }

    #[test]
    fn structured_result_kept_as_json_text() {
        let json = r#"{"status":"success","result":{"answer":42}}"#;
        let output: WorkerOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.result.as_deref(), Some(r#"{"answer":42}"#));

        let json = r#"{"status":"error","result":null,"error":"boom"}"#;
        let output: WorkerOutput = serde_json::from_str(json).unwrap();
        assert!(output.is_error());
        assert!(output.result.is_none());
    }

    #[test]
    fn blocks_interleaved_with_noise_parse_in_order() {
        let stdout = format!(
            "booting\n{}some log line\n{}{}trailing noise\n",
            block(r#"{"status":"success","result":"first"}"#),
            block("{not json"),
            block(r#"{"status":"success","result":"second"}"#),
        );

        let outputs = parse_output_blocks(&stdout, 1024);
        let results: Vec<_> = outputs.iter().map(|o| o.result.as_deref()).collect();
        assert_eq!(results, vec![Some("first"), Some("second")]);
    }

    #[test]
    fn multi_line_json_body() {
        let stdout = format!(
            "{OUTPUT_START_MARKER}\n{{\n  \"status\": \"success\",\n  \"result\": \"pretty\"\n}}\n{OUTPUT_END_MARKER}\n"
        );
        let outputs = parse_output_blocks(&stdout, 1024);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].result.as_deref(), Some("pretty"));
    }

    #[test]
    fn malformed_block_reported_and_scanning_continues() {
        let mut parser = OutputBlockParser::new(1024);
        assert_eq!(parser.feed(OUTPUT_START_MARKER), None);
        assert_eq!(parser.feed("{\"status\": 12}"), None);
        assert!(matches!(
            parser.feed(OUTPUT_END_MARKER),
            Some(BlockEvent::Malformed(_))
        ));
        assert!(!parser.in_block());
    }

    #[test]
    fn oversized_block_abandoned_then_next_block_parsed() {
        let big = format!(r#"{{"status":"success","result":"{}"}}"#, "x".repeat(200));
        let stdout = format!(
            "{}{}",
            block(&big),
            block(r#"{"status":"success","result":"small"}"#)
        );

        let mut parser = OutputBlockParser::new(64);
        let events: Vec<_> = stdout.lines().filter_map(|l| parser.feed(l)).collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], BlockEvent::Overflow { .. }));
        match &events[1] {
            BlockEvent::Envelope(output) => assert_eq!(output.result.as_deref(), Some("small")),
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_block_yields_nothing() {
        let stdout = format!("{OUTPUT_START_MARKER}\n{{\"status\":\"success\"}}\n");
        let mut parser = OutputBlockParser::new(1024);
        for line in stdout.lines() {
            assert!(parser.feed(line).is_none());
        }
        assert!(parser.in_block());
    }

    #[test]
    fn overlong_line_abandons_only_an_open_block() {
        let mut parser = OutputBlockParser::new(1024);
        assert!(parser.overlong_line(5000).is_none());

        parser.feed(OUTPUT_START_MARKER);
        parser.feed("{");
        assert_eq!(
            parser.overlong_line(5000),
            Some(BlockEvent::Overflow { bytes: 5002 })
        );
        assert!(!parser.in_block());
        assert!(parser.feed(OUTPUT_END_MARKER).is_none());
    }

    #[test]
    fn markers_must_be_whole_lines() {
        let stdout = format!(
            "prefix {OUTPUT_START_MARKER}{{\"status\":\"success\"}}{OUTPUT_END_MARKER}\n"
        );
        assert!(parse_output_blocks(&stdout, 1024).is_empty());
    }

    #[test]
    fn crlf_line_endings_accepted() {
        let stdout = format!(
            "{OUTPUT_START_MARKER}\r\n{{\"status\":\"success\",\"result\":\"win\"}}\r\n{OUTPUT_END_MARKER}\r\n"
        );
        let outputs = parse_output_blocks(&stdout, 1024);
        assert_eq!(outputs[0].result.as_deref(), Some("win"));
    }
}
