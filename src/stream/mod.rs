//! # Chat stream translation
//!
//! Converts an OpenAI-style chat completion event stream into the UI data-stream
//! protocol (`start`, `start-step`, `text-start`, `text-delta`, `text-end`,
//! `finish-step`, `finish`).
//!
//! Input is buffered as raw bytes and only decoded once a complete frame has
//! arrived, so multi-byte characters split across reads survive intact.

use std::pin::Pin;

use async_stream::stream;
use axum::body::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

/// Text block id used for the single assistant text part.
pub const TEXT_ID: &str = "text-0";

/// Largest undelimited frame kept in the buffer before it is dropped.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One outbound protocol event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    Start,
    StartStep,
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    FinishStep,
    #[serde(rename_all = "camelCase")]
    Finish {
        finish_reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
    },
}

impl StreamEvent {
    /// Render as an SSE `data:` frame.
    pub fn to_frame(&self) -> Option<Bytes> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Bytes::from(format!("data: {}\n\n", json))),
            Err(err) => {
                tracing::error!(error = %err, "Failed to serialise stream event");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    delta: CompletionDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// Stateful translator for one upstream response.
#[derive(Debug, Default)]
pub struct StreamProtocolTranslator {
    buffer: Vec<u8>,
    /// Buffer offset already searched for a frame delimiter.
    scanned: usize,
    /// Discarding the rest of an oversized frame.
    skipping: bool,
    started: bool,
}

impl StreamProtocolTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of upstream bytes and return the frames it completes.
    pub fn transform(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        // CR never appears inside a UTF-8 multi-byte sequence.
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = find_delimiter(&self.buffer[from..]) {
            let end = from + offset;
            if self.skipping {
                self.skipping = false;
            } else {
                let frame = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
                self.process_frame(&frame, &mut events);
            }
            start = end + 2;
            from = start;
        }
        self.buffer.drain(..start);

        if self.buffer.len() > MAX_FRAME_BYTES {
            metrics::counter!("stream_frames_dropped_total").increment(1);
            tracing::warn!(
                bytes = self.buffer.len(),
                limit = MAX_FRAME_BYTES,
                "Dropping oversized stream frame"
            );
            // A trailing newline may be the first half of the delimiter.
            let trailing_newline = self.buffer.last() == Some(&b'\n');
            self.buffer.clear();
            if trailing_newline {
                self.buffer.push(b'\n');
            }
            self.skipping = true;
        }
        self.scanned = self.buffer.len().saturating_sub(1);

        render(events)
    }

    /// Close an open text block at end of input.
    pub fn flush(&mut self) -> Vec<Bytes> {
        self.scanned = 0;
        if std::mem::take(&mut self.skipping) {
            self.buffer.clear();
        }
        if !self.buffer.is_empty() {
            let remainder = std::mem::take(&mut self.buffer);
            let remainder = String::from_utf8_lossy(&remainder);
            if !remainder.trim().is_empty() {
                tracing::debug!(bytes = remainder.len(), "Discarding incomplete trailing frame");
            }
        }

        let mut events = Vec::new();
        self.close("stop", &mut events);
        render(events)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn process_frame(&mut self, frame: &str, events: &mut Vec<StreamEvent>) {
        let Some(data) = frame.lines().find_map(|line| {
            line.strip_prefix("data:")
                .map(str::trim)
                .filter(|data| !data.is_empty())
        }) else {
            return;
        };

        if data == "[DONE]" {
            self.close("stop", events);
            return;
        }

        let chunk: CompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(err) => {
                metrics::counter!("stream_frames_dropped_total").increment(1);
                tracing::warn!(error = %err, data = %data, "Dropping unparseable stream frame");
                return;
            }
        };

        if let Some(error) = chunk.error {
            let error_text = match &error {
                serde_json::Value::String(message) => message.clone(),
                other => other
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            };
            tracing::warn!(error = %error_text, "Upstream reported a stream error");
            events.push(StreamEvent::Error { error_text });
            self.close("error", events);
            return;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        let has_role = choice.delta.role.as_deref().is_some_and(|r| !r.is_empty());
        let content = choice.delta.content.filter(|c| !c.is_empty());

        if !self.started && (has_role || content.is_some()) {
            self.started = true;
            events.push(StreamEvent::Start);
            events.push(StreamEvent::StartStep);
            events.push(StreamEvent::TextStart {
                id: TEXT_ID.to_string(),
            });
        }

        if let Some(delta) = content {
            events.push(StreamEvent::TextDelta {
                id: TEXT_ID.to_string(),
                delta,
            });
        }

        if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
            self.close(&reason, events);
        }
    }

    fn close(&mut self, reason: &str, events: &mut Vec<StreamEvent>) {
        if !self.started {
            return;
        }
        self.started = false;
        events.push(StreamEvent::TextEnd {
            id: TEXT_ID.to_string(),
        });
        events.push(StreamEvent::FinishStep);
        events.push(StreamEvent::Finish {
            finish_reason: reason.to_string(),
        });
    }
}

fn find_delimiter(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == b"\n\n")
}

fn render(events: Vec<StreamEvent>) -> Vec<Bytes> {
    events.iter().filter_map(StreamEvent::to_frame).collect()
}

/// Translate an upstream byte stream, emitting frames as soon as they complete.
///
/// An upstream error ends the input; the response still closes with `finish`.
pub fn translate_stream<S, B, E>(upstream: S) -> Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(stream! {
        let mut translator = StreamProtocolTranslator::new();
        let mut upstream = Box::pin(upstream);

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in translator.transform(bytes.as_ref()) {
                        yield Ok(frame);
                    }
                }
                Err(err) => {
                    metrics::counter!("stream_upstream_errors_total").increment(1);
                    tracing::warn!(
                        error = %err,
                        started = translator.is_started(),
                        "Chat upstream ended with an error"
                    );
                    break;
                }
            }
        }

        for frame in translator.flush() {
            yield Ok(frame);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn events(frames: &[Bytes]) -> Vec<Value> {
        frames
            .iter()
            .map(|frame| {
                let text = std::str::from_utf8(frame).unwrap();
                let json = text.strip_prefix("data: ").unwrap().strip_suffix("\n\n").unwrap();
                serde_json::from_str(json).unwrap()
            })
            .collect()
    }

    fn types(frames: &[Bytes]) -> Vec<String> {
        events(frames)
            .into_iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect()
    }

    const TRANSCRIPT: &str = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hé\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo ✓\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    #[test]
    fn full_transcript_produces_expected_sequence() {
        let mut translator = StreamProtocolTranslator::new();
        let mut frames = translator.transform(TRANSCRIPT.as_bytes());
        frames.extend(translator.flush());

        assert_eq!(
            types(&frames),
            vec![
                "start",
                "start-step",
                "text-start",
                "text-delta",
                "text-delta",
                "text-end",
                "finish-step",
                "finish"
            ]
        );
        let parsed = events(&frames);
        assert_eq!(parsed[2], json!({ "type": "text-start", "id": "text-0" }));
        assert_eq!(parsed[3], json!({ "type": "text-delta", "id": "text-0", "delta": "Hé" }));
        assert_eq!(parsed[7], json!({ "type": "finish", "finishReason": "stop" }));
    }

    #[test]
    fn output_is_independent_of_chunk_boundaries() {
        let whole = {
            let mut translator = StreamProtocolTranslator::new();
            let mut frames = translator.transform(TRANSCRIPT.as_bytes());
            frames.extend(translator.flush());
            frames
        };

        let bytes = TRANSCRIPT.as_bytes();
        for split in 0..=bytes.len() {
            let mut translator = StreamProtocolTranslator::new();
            let mut frames = translator.transform(&bytes[..split]);
            frames.extend(translator.transform(&bytes[split..]));
            frames.extend(translator.flush());
            assert_eq!(frames, whole, "split at byte {}", split);
        }
    }

    #[test]
    fn byte_at_a_time_matches_whole() {
        let mut translator = StreamProtocolTranslator::new();
        let mut frames = Vec::new();
        for byte in TRANSCRIPT.as_bytes() {
            frames.extend(translator.transform(std::slice::from_ref(byte)));
        }
        frames.extend(translator.flush());
        assert_eq!(types(&frames).len(), 8);
        assert_eq!(events(&frames)[4]["delta"], "llo ✓");
    }

    #[test]
    fn flush_closes_open_block() {
        let mut translator = StreamProtocolTranslator::new();
        let frames = translator
            .transform(b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n");
        assert_eq!(types(&frames), vec!["start", "start-step", "text-start", "text-delta"]);
        assert!(translator.is_started());

        let closing = translator.flush();
        assert_eq!(types(&closing), vec!["text-end", "finish-step", "finish"]);
        assert_eq!(events(&closing)[2]["finishReason"], "stop");
        assert!(translator.flush().is_empty());
    }

    #[test]
    fn done_without_start_emits_nothing() {
        let mut translator = StreamProtocolTranslator::new();
        assert!(translator.transform(b"data: [DONE]\n\n").is_empty());
        assert!(translator.flush().is_empty());
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let mut translator = StreamProtocolTranslator::new();
        let frames = translator.transform(
            b"data: {not json\n\n: keep-alive\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
        );
        assert_eq!(types(&frames), vec!["start", "start-step", "text-start", "text-delta"]);
    }

    #[test]
    fn crlf_separators_are_accepted() {
        let mut translator = StreamProtocolTranslator::new();
        let frames = translator.transform(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"},\"finish_reason\":\"length\"}]}\r\n\r\n",
        );
        let parsed = events(&frames);
        assert_eq!(parsed.last().unwrap()["finishReason"], "length");
    }

    #[test]
    fn upstream_error_object_becomes_error_event() {
        let mut translator = StreamProtocolTranslator::new();
        let mut frames = translator.transform(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n");
        frames.extend(translator.transform(b"data: {\"error\":{\"message\":\"model overloaded\"}}\n\n"));

        let parsed = events(&frames);
        assert_eq!(parsed[4], json!({ "type": "error", "errorText": "model overloaded" }));
        assert_eq!(parsed.last().unwrap()["finishReason"], "error");
        assert!(!translator.is_started());
    }

    #[tokio::test]
    async fn translate_stream_flushes_at_end() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"con")),
            Ok(Bytes::from_static(b"tent\":\"hey\"}}]}\n\n")),
        ];

        let frames: Vec<Bytes> = translate_stream(futures::stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(
            types(&frames),
            vec!["start", "start-step", "text-start", "text-delta", "text-end", "finish-step", "finish"]
        );
    }

    #[tokio::test]
    async fn translate_stream_closes_after_upstream_error() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n")),
            Err("operation timed out".to_string()),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n")),
        ];

        let items: Vec<Result<Bytes, String>> =
            translate_stream(futures::stream::iter(chunks)).collect().await;

        assert!(items.iter().all(Result::is_ok));
        let frames: Vec<Bytes> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            types(&frames),
            vec![
                "start",
                "start-step",
                "text-start",
                "text-delta",
                "text-end",
                "finish-step",
                "finish"
            ]
        );
    }

    #[test]
    fn frame_split_across_many_small_reads() {
        let frame = format!(
            "data: {}\n\n",
            json!({ "choices": [{ "delta": { "content": "a".repeat(4096) } }] })
        );
        let mut translator = StreamProtocolTranslator::new();
        let mut frames = Vec::new();
        for piece in frame.as_bytes().chunks(7) {
            frames.extend(translator.transform(piece));
        }

        let events = events(&frames);
        assert_eq!(events.len(), 4);
        assert_eq!(events[3]["delta"].as_str().unwrap().len(), 4096);
    }

    #[test]
    fn oversized_frame_is_dropped_and_stream_recovers() {
        let mut translator = StreamProtocolTranslator::new();
        let mut frames = translator.transform(b"data: {\"choices\":[{\"delta\":{\"content\":\"");
        frames.extend(translator.transform(&vec![b'a'; MAX_FRAME_BYTES + 1]));
        frames.extend(translator.transform(b"\"}}]}\n"));
        frames.extend(translator.transform(b"\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n"));
        frames.extend(translator.flush());

        let events = events(&frames);
        assert_eq!(events[3]["delta"], "ok");
        assert_eq!(
            types(&frames),
            vec![
                "start",
                "start-step",
                "text-start",
                "text-delta",
                "text-end",
                "finish-step",
                "finish"
            ]
        );
    }
}
