//! Cluster Compression
//!
//! Detects repetitive `(entity, intent)` clusters inside a rolling window
//! and plans a single replacement record that summarizes the originals.
//! An existing summary at the key is folded into the next replacement (its
//! `original_count` carries over), so a hot key always converges to exactly
//! one compressed record; a summary on its own never triggers a new pass.

use chrono::{DateTime, Duration, Utc};

use crate::model::{MemoryRecord, ProcessedEvent};

/// The outcome of a compression check over one cluster
#[derive(Debug, Clone)]
pub struct CompressionPlan {
    pub should_compress: bool,
    pub memory_ids_to_replace: Vec<String>,
    pub summary_text: String,
    /// Total originals represented, counting folded summaries at weight
    /// `original_count`
    pub original_count: i64,
}

impl CompressionPlan {
    fn skip() -> Self {
        Self {
            should_compress: false,
            memory_ids_to_replace: Vec::new(),
            summary_text: String::new(),
            original_count: 0,
        }
    }
}

/// Plans event compression for repetitive memory clusters
pub struct CompressionPlanner {
    min_count: usize,
    window_days: i64,
    max_summary_items: usize,
}

impl CompressionPlanner {
    pub fn new(min_count: usize, window_days: i64, max_summary_items: usize) -> Self {
        Self {
            min_count: min_count.max(2),
            window_days: window_days.max(1),
            max_summary_items: max_summary_items.max(1),
        }
    }

    pub fn min_count(&self) -> usize {
        self.min_count
    }

    pub fn window_days(&self) -> i64 {
        self.window_days
    }

    /// Start of the rolling window relative to `now`
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.window_days)
    }

    /// Plan a replacement for the cluster. `candidates` are the memories at
    /// the `(entity, intent)` key inside the window, including any existing
    /// compressed summary.
    pub fn plan(&self, processed: &ProcessedEvent, candidates: &[MemoryRecord]) -> CompressionPlan {
        let original_count: i64 = candidates
            .iter()
            .map(|memory| {
                if memory.is_compressed {
                    memory.original_count.max(1)
                } else {
                    1
                }
            })
            .sum();
        let uncompressed = candidates.iter().filter(|memory| !memory.is_compressed).count();
        if (original_count as usize) < self.min_count || uncompressed == 0 {
            return CompressionPlan::skip();
        }

        let snippets: Vec<&str> = candidates
            .iter()
            .take(self.max_summary_items)
            .map(|memory| memory.summary.as_str())
            .collect();
        let summary_text = format!(
            "Compressed memory for entity={}, event_type={}. Observed {original_count} events in {} days: {}",
            processed.entity_id,
            processed.event_type,
            self.window_days,
            snippets.join(" | "),
        );
        CompressionPlan {
            should_compress: true,
            memory_ids_to_replace: candidates
                .iter()
                .map(|memory| memory.memory_id.clone())
                .collect(),
            summary_text,
            original_count,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
