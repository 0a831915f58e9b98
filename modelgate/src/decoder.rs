//! Vendor-neutral half of stream decoding.
//!
//! Each vendor decoder parses its wire format and drives an [`Assembler`],
//! which owns the stream invariants: one `ContentStart` before any output,
//! block order, usage normalization and exactly one terminal event.

use crate::error::ErrorKind;
use crate::types::{EventKind, ThinkingPhase, UsageInfo};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Turns raw response bytes into canonical events.
pub trait StreamDecoder: Send {
    /// Feed one network read.
    fn decode(&mut self, chunk: &[u8]) -> Vec<EventKind>;

    /// Input ended. Always yields a terminal event unless one was already
    /// produced.
    fn finish(&mut self) -> Vec<EventKind>;
}

#[derive(Debug, Default)]
pub struct Assembler {
    started: bool,
    finished: bool,
    text: String,
    usage: Option<UsageInfo>,
    closed_blocks: BTreeSet<usize>,
    out: Vec<EventKind>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn usage(&self) -> Option<UsageInfo> {
        self.usage
    }

    fn start(&mut self) {
        if !self.started {
            self.started = true;
            self.out.push(EventKind::ContentStart);
        }
    }

    fn accepts(&self, index: Option<usize>) -> bool {
        if self.finished {
            return false;
        }
        match index {
            Some(i) if self.closed_blocks.contains(&i) => {
                warn!(index = i, "dropping delta for a closed content block");
                false
            }
            _ => true,
        }
    }

    pub fn message_start(&mut self, model: &str) {
        if self.finished {
            return;
        }
        self.start();
        if !model.is_empty() {
            self.out.push(EventKind::MessageStart {
                model: model.to_string(),
            });
        }
    }

    pub fn delta(&mut self, index: Option<usize>, text: &str) {
        if text.is_empty() || !self.accepts(index) {
            return;
        }
        self.start();
        self.text.push_str(text);
        self.out.push(EventKind::ContentDelta {
            text: text.to_string(),
        });
    }

    pub fn thinking(&mut self, index: Option<usize>, phase: ThinkingPhase, text: &str) {
        if phase == ThinkingPhase::Delta && text.is_empty() {
            return;
        }
        if !self.accepts(index) {
            return;
        }
        self.start();
        self.out.push(EventKind::Thinking {
            text: text.to_string(),
            phase,
            depth: 0,
        });
    }

    pub fn block_stop(&mut self, index: usize) {
        self.closed_blocks.insert(index);
    }

    /// Record vendor usage. Partial reports are merged and the total is
    /// always recomputed.
    pub fn usage_report(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        if self.finished {
            return;
        }
        let report = UsageInfo::new(prompt_tokens, completion_tokens);
        let merged = match self.usage {
            Some(prev) => prev.merge(report),
            None => report,
        };
        if Some(merged) == self.usage {
            return;
        }
        self.start();
        self.usage = Some(merged);
        self.out.push(EventKind::Usage { usage: merged });
    }

    pub fn message_stop(&mut self, finish_reason: Option<&str>) {
        if self.finished {
            return;
        }
        self.start();
        self.out.push(EventKind::MessageStop {
            finish_reason: finish_reason.map(str::to_string),
        });
    }

    /// Successful end of stream.
    pub fn done(&mut self) {
        if self.finished {
            return;
        }
        self.start();
        self.finished = true;
        self.out.push(EventKind::ContentEnd {
            content: self.text.clone(),
        });
    }

    pub fn error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let message = message.into();
        debug!(%kind, %message, "stream error");
        self.out.push(EventKind::Error { kind, message });
    }

    /// Input ended; fail the stream if no end marker was seen.
    pub fn eof(&mut self) {
        if !self.finished {
            self.error(
                ErrorKind::ServerError,
                "stream ended before end-of-stream marker",
            );
        }
    }

    pub fn drain(&mut self) -> Vec<EventKind> {
        std::mem::take(&mut self.out)
    }
}
