use std::sync::Arc;

use tracing::{info, warn};

use crate::error::StoreError;
use crate::events::{emit, CoreEvent, EventSender, SleepState};
use crate::facts::{patch_prompt, LearnedFacts};
use crate::marker::{Directive, MarkerEvent};
use crate::overlay::SensoryOverlay;
use crate::retrieval::EmbeddingIndex;
use crate::store::{BudgetOverrides, MessageStore};
use crate::thinking::ThinkingDial;
use crate::types::Role;

/// Applies parsed directives to the subsystems they target. Directives are
/// collected during the stream and applied here at the turn boundary, in
/// source order; nothing mutates the store mid-stream.
pub struct DirectiveRouter {
    dial: ThinkingDial,
    sleep: SleepState,
    index: Option<Arc<EmbeddingIndex>>,
    facts: Option<LearnedFacts>,
    events: Option<EventSender>,

    pending_model: Option<String>,
    pending_importance: Option<f32>,
    batch_request: Option<bool>,
    semantic_ref_k: usize,
}

impl Default for DirectiveRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectiveRouter {
    pub fn new() -> Self {
        Self {
            dial: ThinkingDial::default(),
            sleep: SleepState::Awake,
            index: None,
            facts: None,
            events: None,
            pending_model: None,
            pending_importance: None,
            batch_request: None,
            semantic_ref_k: 3,
        }
    }

    pub fn with_index(mut self, index: Arc<EmbeddingIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_facts(mut self, facts: LearnedFacts) -> Self {
        self.facts = Some(facts);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn thinking(&self) -> &ThinkingDial {
        &self.dial
    }

    pub fn sleep_state(&self) -> SleepState {
        self.sleep
    }

    /// One-shot model switch requested this turn, if any.
    pub fn take_pending_model(&mut self) -> Option<String> {
        self.pending_model.take()
    }

    /// Importance to attach to the assistant message being recorded.
    pub fn take_pending_importance(&mut self) -> Option<f32> {
        self.pending_importance.take()
    }

    /// Whether a `resummarize` directive asked for a batch run (and its
    /// force flag).
    pub fn take_batch_request(&mut self) -> Option<bool> {
        self.batch_request.take()
    }

    /// Round boundary: the thinking dial regresses unless refreshed.
    pub fn end_round(&mut self) {
        self.dial.end_round();
    }

    /// Map fired markers to directives and apply them in order. Non-
    /// directive markers (emotions, avatar weights, unknown names) are the
    /// stream handler's business, not ours.
    pub async fn apply_events(
        &mut self,
        events: &[MarkerEvent],
        overlay: &mut SensoryOverlay,
    ) -> Result<(), StoreError> {
        for event in events {
            emit(
                &self.events,
                CoreEvent::MarkerFired {
                    name: event.name.clone(),
                },
            );
            if let Some(d) = Directive::from_event(event) {
                self.apply(d, overlay).await?;
            }
        }
        Ok(())
    }

    pub async fn apply(
        &mut self,
        directive: Directive,
        overlay: &mut SensoryOverlay,
    ) -> Result<(), StoreError> {
        match directive {
            Directive::ModelChange { alias } => {
                info!(alias, "model change requested");
                emit(&self.events, CoreEvent::ModelChange { alias: alias.clone() });
                self.pending_model = Some(alias);
            }
            Directive::ThinkingSet { value } => self.dial.set(value),
            Directive::Think => self.dial.think(),
            Directive::Relax => self.dial.relax(),
            Directive::Importance { value } => self.pending_importance = Some(value),
            Directive::RefPages { ids } => {
                for id in ids {
                    if let Some(query) = id.strip_prefix('?') {
                        self.semantic_ref(query, overlay).await;
                    } else {
                        overlay.ref_page(&id);
                    }
                }
            }
            Directive::UnrefPages { ids } => {
                for id in ids {
                    overlay.unref_page(&id);
                }
            }
            Directive::Budget { working, page } => {
                let overrides = BudgetOverrides {
                    working_tokens: working,
                    page_slot_tokens: page,
                };
                if let Err(e) = overlay.hot_reload_config(overrides).await {
                    // A bad tune is dropped, not fatal to the stream.
                    warn!(error = %e, "budget directive rejected");
                }
            }
            Directive::MemoryKind { kind } => match kind.parse() {
                Ok(kind) => overlay.swap_memory_kind(kind).await?,
                Err(e) => warn!(error = %e, "memory directive rejected"),
            },
            Directive::Sleep => self.set_sleep(SleepState::Asleep),
            Directive::Listening => self.set_sleep(SleepState::Listening),
            Directive::Wake => self.set_sleep(SleepState::Awake),
            Directive::View { name, slot } => {
                overlay.switch_view(&name, slot.unwrap_or(0));
            }
            Directive::Sense { name, enabled } => {
                overlay.set_channel_enabled(&name, enabled);
            }
            Directive::Resummarize { force } => self.batch_request = Some(force),
            Directive::Learn { fact } => self.learn(&fact, overlay).await?,
        }
        Ok(())
    }

    fn set_sleep(&mut self, state: SleepState) {
        if self.sleep != state {
            self.sleep = state;
            emit(&self.events, CoreEvent::SleepState { state });
        }
    }

    async fn semantic_ref(&self, query: &str, overlay: &mut SensoryOverlay) {
        let Some(index) = self.index.as_ref() else {
            warn!("semantic ref without an embedding index, dropped");
            return;
        };
        match index.search(query, self.semantic_ref_k, 0.2).await {
            Ok(hits) => {
                for hit in hits {
                    overlay.ref_page(&hit.page_id);
                }
            }
            Err(e) => warn!(error = %e, "semantic ref search failed"),
        }
    }

    async fn learn(&self, fact: &str, overlay: &mut SensoryOverlay) -> Result<(), StoreError> {
        if let Some(facts) = self.facts.as_ref() {
            if let Err(e) = facts.append(fact).await {
                warn!(error = %e, "failed to persist learned fact");
            }
        }
        let pinned = overlay
            .raw_messages()
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        overlay.patch_pinned_prompt(patch_prompt(&pinned, fact)).await
    }
}
