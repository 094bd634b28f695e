//! Tool execution queue
//!
//! Runs the tool calls of one assistant message exactly once each:
//! - An entry starts when nothing is executing, or when it is
//!   concurrency-safe and everything executing is safe too. At most one
//!   unsafe call runs at a time, and nothing starts beside it.
//! - Results are released in request order. A later entry that finishes
//!   first waits until every earlier entry has yielded.
//! - Progress of the head entry streams live; other entries buffer theirs.
//! - Context patches apply in completion order.
//!
//! On cancellation every unfinished entry resolves as `user_interrupted`.
//! After an error result, entries that have not started resolve as
//! `sibling_error` instead of running.

use futures::future::BoxFuture;
use futures::stream::{self, FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::budget::AbortScope;
use crate::session::SessionContext;
use crate::tools::{
    ContextPatch, ProgressEvent, ProgressSink, ToolContext, ToolRunOutcome, ToolRunner,
    ToolUseContext,
};
use crate::transcript::{AssistantMessage, Message, SyntheticReason, ToolResultBlock, ToolUse};

/// Lifecycle of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Queued,
    Executing,
    Completed,
    Yielded,
}

struct QueueEntry {
    tool_use: ToolUse,
    /// Assistant message that requested the call
    source_id: String,
    safe: bool,
    status: EntryStatus,
    progress: VecDeque<Message>,
    result: Option<ToolResultBlock>,
}

impl QueueEntry {
    fn resolve(&mut self, block: ToolResultBlock) {
        self.result = Some(block);
        self.status = EntryStatus::Completed;
    }
}

enum Wake {
    Finished(usize, ToolRunOutcome),
    Progress(ProgressEvent),
    Cancelled,
}

/// Executes one turn's tool calls under the safety barrier
pub struct ToolExecutionQueue {
    runner: Arc<ToolRunner>,
    session: Arc<SessionContext>,
    abort: AbortScope,
    context: ToolUseContext,
    entries: Vec<QueueEntry>,
    running: FuturesUnordered<BoxFuture<'static, (usize, ToolRunOutcome)>>,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    progress_rx: mpsc::UnboundedReceiver<ProgressEvent>,
    next_yield: usize,
    sibling_failed: bool,
    cancel_seen: bool,
    applied: Vec<ContextPatch>,
}

impl ToolExecutionQueue {
    pub fn new(
        runner: Arc<ToolRunner>,
        context: ToolUseContext,
        session: Arc<SessionContext>,
        abort: AbortScope,
    ) -> Self {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        Self {
            runner,
            session,
            abort,
            context,
            entries: Vec::new(),
            running: FuturesUnordered::new(),
            progress_tx,
            progress_rx,
            next_yield: 0,
            sibling_failed: false,
            cancel_seen: false,
            applied: Vec::new(),
        }
    }

    /// Enqueue a call requested by `source`. Safe before or during draining.
    pub fn add_tool(&mut self, tool_use: ToolUse, source: &AssistantMessage) {
        let safe = self.runner.registry().is_concurrency_safe(&tool_use);
        debug!(
            "Queued {} ({}) from {}, safe={}",
            tool_use.name, tool_use.id, source.id, safe
        );
        self.entries.push(QueueEntry {
            tool_use,
            source_id: source.id.clone(),
            safe,
            status: EntryStatus::Queued,
            progress: VecDeque::new(),
            result: None,
        });
        self.start_ready();
    }

    /// Context as updated by every patch applied so far
    pub fn context(&self) -> &ToolUseContext {
        &self.context
    }

    pub fn into_context(self) -> ToolUseContext {
        self.context
    }

    /// Patches in the order they were applied
    pub fn applied_patches(&self) -> &[ContextPatch] {
        &self.applied
    }

    pub fn statuses(&self) -> Vec<EntryStatus> {
        self.entries.iter().map(|e| e.status).collect()
    }

    pub fn executing_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Executing)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next message in request order, or `None` once every entry has yielded
    pub async fn next_message(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.take_ready() {
                return Some(message);
            }
            if self.next_yield >= self.entries.len() {
                return None;
            }
            if self.running.is_empty() {
                self.start_ready();
                if self.running.is_empty() {
                    if self.take_ready_pending() {
                        continue;
                    }
                    warn!(
                        "Tool queue stalled with {} unyielded entries",
                        self.entries.len() - self.next_yield
                    );
                    return None;
                }
            }

            let wake = tokio::select! {
                Some((index, outcome)) = self.running.next() => Wake::Finished(index, outcome),
                Some(event) = self.progress_rx.recv() => Wake::Progress(event),
                _ = self.abort.cancelled(), if !self.cancel_seen => Wake::Cancelled,
            };
            match wake {
                Wake::Finished(index, outcome) => self.finish(index, outcome),
                Wake::Progress(event) => self.buffer_progress(event),
                Wake::Cancelled => {
                    self.cancel_seen = true;
                    self.interrupt_unfinished();
                }
            }
        }
    }

    /// Remaining messages as a finite stream
    pub fn into_stream(self) -> impl Stream<Item = Message> {
        stream::unfold(self, |mut queue| async move {
            queue.next_message().await.map(|message| (message, queue))
        })
    }

    /// Whether the head entry has something to release
    fn take_ready_pending(&self) -> bool {
        self.entries
            .get(self.next_yield)
            .map(|e| e.status == EntryStatus::Completed || !e.progress.is_empty())
            .unwrap_or(false)
    }

    fn take_ready(&mut self) -> Option<Message> {
        let entry = self.entries.get_mut(self.next_yield)?;
        if let Some(progress) = entry.progress.pop_front() {
            return Some(progress);
        }
        if entry.status != EntryStatus::Completed {
            return None;
        }
        let block = entry.result.take()?;
        entry.status = EntryStatus::Yielded;
        debug!("Yielding result for {} ({})", entry.tool_use.name, entry.tool_use.id);
        self.next_yield += 1;
        Some(Message::tool_result(block))
    }

    fn buffer_progress(&mut self, event: ProgressEvent) {
        if let Some(entry) = self.entries.get_mut(event.index) {
            // Progress can trail the result through the channel
            if matches!(entry.status, EntryStatus::Executing | EntryStatus::Completed) {
                entry.progress.push_back(event.message);
            }
        }
    }

    /// Buffer progress already sent; a tool's sends all precede its result
    fn drain_progress(&mut self) {
        while let Ok(event) = self.progress_rx.try_recv() {
            self.buffer_progress(event);
        }
    }

    fn finish(&mut self, index: usize, outcome: ToolRunOutcome) {
        self.drain_progress();
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        if entry.status != EntryStatus::Executing {
            // Already resolved by cancellation; the late result is dropped
            debug!("Discarding late result for {}", entry.tool_use.id);
            return;
        }

        if let Some(patch) = &outcome.patch {
            self.context.apply(patch);
            self.applied.push(patch.clone());
        }
        let failed = outcome.block.is_error;
        debug!(
            "Completed {} ({}) error={}",
            entry.tool_use.name, entry.tool_use.id, failed
        );
        entry.resolve(outcome.block);

        if failed && !self.sibling_failed {
            info!("{} returned an error; cancelling calls not yet started", entry.tool_use.name);
            self.sibling_failed = true;
        }
        self.start_ready();
    }

    fn interrupt_unfinished(&mut self) {
        for entry in &mut self.entries {
            if matches!(entry.status, EntryStatus::Queued | EntryStatus::Executing) {
                let block = ToolResultBlock::synthetic(&entry.tool_use, SyntheticReason::UserInterrupted);
                entry.progress.clear();
                entry.resolve(block);
            }
        }
    }

    fn start_ready(&mut self) {
        if self.abort.is_aborted() {
            self.cancel_seen = true;
            self.interrupt_unfinished();
            return;
        }
        if self.sibling_failed {
            for entry in &mut self.entries {
                if entry.status == EntryStatus::Queued {
                    let block = ToolResultBlock::synthetic(&entry.tool_use, SyntheticReason::SiblingError);
                    entry.resolve(block);
                }
            }
            return;
        }

        for index in 0..self.entries.len() {
            if self.entries[index].status != EntryStatus::Queued {
                continue;
            }
            let executing: Vec<bool> = self
                .entries
                .iter()
                .filter(|e| e.status == EntryStatus::Executing)
                .map(|e| e.safe)
                .collect();
            let safe = self.entries[index].safe;
            if executing.is_empty() || (safe && executing.iter().all(|s| *s)) {
                self.start(index);
            } else if !safe {
                break;
            }
        }
    }

    fn start(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        entry.status = EntryStatus::Executing;
        debug!(
            "Starting {} ({}) from {}",
            entry.tool_use.name, entry.tool_use.id, entry.source_id
        );

        let tool_use = entry.tool_use.clone();
        let ctx = ToolContext {
            tool_use_id: tool_use.id.clone(),
            context: self.context.clone(),
            session: self.session.clone(),
            abort: self.abort.clone(),
        };
        let sink = ProgressSink::new(self.progress_tx.clone(), index, &tool_use.id);
        let runner = self.runner.clone();
        self.running.push(
            async move {
                let outcome = runner.run(&tool_use, &ctx, &sink).await;
                (index, outcome)
            }
            .boxed(),
        );
    }
}
