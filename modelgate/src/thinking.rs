//! Extended-reasoning ("thinking") tracking.
//!
//! A [`ThinkingTracker`] is owned by whoever consumes a stream and is fed
//! every event; it ignores everything that is not a thinking event.

use crate::types::{Event, EventKind, ThinkingPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    pub phase: ThinkingPhase,
    pub content: String,
    pub depth: u32,
    /// Position of the block within the turn.
    pub index: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThinkingState {
    pub is_thinking: bool,
    pub current_depth: u32,
    pub total_events: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub last_event_time: Option<DateTime<Utc>>,
    pub blocks: Vec<ThinkingBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThinkingError {
    #[error("invalid event type: expected thinking, got {0}")]
    NotThinking(String),
    #[error("thinking event must have non-empty data")]
    Empty,
    #[error("failed to parse thinking event: {0}")]
    Malformed(String),
}

/// Display preferences. These never affect what is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingDisplay {
    /// Indentation stops growing past this depth.
    pub max_depth: Option<u32>,
    pub show_depth: bool,
}

impl Default for ThinkingDisplay {
    fn default() -> Self {
        Self {
            max_depth: None,
            show_depth: true,
        }
    }
}

impl ThinkingDisplay {
    pub fn format_block(&self, block: &ThinkingBlock) -> String {
        let mut out = String::new();
        if self.show_depth && block.depth > 0 {
            let depth = match self.max_depth {
                Some(max) => block.depth.min(max),
                None => block.depth,
            };
            out.push_str(&"  ".repeat(depth as usize));
        }
        match block.phase {
            ThinkingPhase::Start => out.push_str("[THINKING START] "),
            ThinkingPhase::End => out.push_str("[THINKING END] "),
            ThinkingPhase::Delta => {}
        }
        out.push_str(&block.content);
        out
    }

    pub fn merge_blocks(&self, blocks: &[ThinkingBlock]) -> String {
        blocks
            .iter()
            .map(|b| self.format_block(b))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Default)]
pub struct ThinkingTracker {
    state: ThinkingState,
}

impl ThinkingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ThinkingState {
        &self.state
    }

    /// Record `event` if it is a thinking event. Anything else is ignored
    /// and yields `None`, so a whole mixed stream can be fed through.
    pub fn parse_event(&mut self, event: &Event) -> Option<&ThinkingBlock> {
        let EventKind::Thinking { text, phase, depth } = &event.kind else {
            return None;
        };
        let block = ThinkingBlock {
            phase: *phase,
            content: text.clone(),
            depth: *depth,
            index: self.state.blocks.len(),
            timestamp: event.timestamp,
        };
        self.apply(block);
        self.state.blocks.last()
    }

    fn apply(&mut self, block: ThinkingBlock) {
        let state = &mut self.state;
        state.total_events += 1;
        state.last_event_time = Some(block.timestamp);
        match block.phase {
            ThinkingPhase::Start => {
                state.is_thinking = true;
                state.start_time = Some(block.timestamp);
                state.current_depth = block.depth;
            }
            ThinkingPhase::End => state.is_thinking = false,
            ThinkingPhase::Delta => {
                state.current_depth = state.current_depth.max(block.depth);
            }
        }
        state.blocks.push(block);
    }

    /// Clear everything for the next turn.
    pub fn reset(&mut self) {
        self.state = ThinkingState::default();
    }
}

/// Strict check for thinking events entering from outside a stream.
pub fn validate_thinking_event(event: &Event) -> Result<(), ThinkingError> {
    match &event.kind {
        EventKind::Thinking { text, .. } if text.is_empty() => Err(ThinkingError::Empty),
        EventKind::Thinking { .. } => Ok(()),
        other => Err(ThinkingError::NotThinking(other.name().to_string())),
    }
}

/// Parse a serialized event that must be a thinking event.
pub fn thinking_event_from_json(json: &str) -> Result<Event, ThinkingError> {
    let event: Event =
        serde_json::from_str(json).map_err(|e| ThinkingError::Malformed(e.to_string()))?;
    match event.kind {
        EventKind::Thinking { .. } => Ok(event),
        ref other => Err(ThinkingError::NotThinking(other.name().to_string())),
    }
}

/// Time from the last `start` to the latest event.
pub fn thinking_duration(state: &ThinkingState) -> Duration {
    let Some(start) = state.start_time else {
        return Duration::ZERO;
    };
    let end = match state.last_event_time {
        Some(last) if last >= start => last,
        _ => Utc::now(),
    };
    (end - start).to_std().unwrap_or(Duration::ZERO)
}

pub fn filter_blocks(blocks: &[ThinkingBlock], phase: ThinkingPhase) -> Vec<ThinkingBlock> {
    blocks.iter().filter(|b| b.phase == phase).cloned().collect()
}

pub fn max_depth(blocks: &[ThinkingBlock]) -> u32 {
    blocks.iter().map(|b| b.depth).max().unwrap_or(0)
}
