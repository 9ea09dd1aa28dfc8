/// Events emitted by the core, for UI streaming and for collaborators that
/// react to lifecycle changes (the embedding index listens for PageCreated).
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Fired exactly once per page, fallback-summary paths included.
    PageCreated {
        id: String,
        summary: String,
        label: String,
    },
    Compacted {
        pre_tokens: usize,
        post_tokens: usize,
        pages_written: usize,
    },
    PageLoaded {
        id: String,
    },
    PageUnloaded {
        id: String,
    },
    MarkerFired {
        name: String,
    },
    SleepState {
        state: SleepState,
    },
    ModelChange {
        alias: String,
    },
    BatchFinished {
        summarized: usize,
        skipped: usize,
    },
}

/// Idle-behaviour suppression state surfaced to the external policy layer.
/// The core only reports transitions; enforcement lives outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepState {
    Awake,
    Listening,
    Asleep,
}

/// Fire-and-forget sender. Dropped receivers are fine; the core never blocks
/// on its event stream.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<CoreEvent>;

pub(crate) fn emit(events: &Option<EventSender>, event: CoreEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
