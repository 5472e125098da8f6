//! Builds the message sequence a model call receives.

use tracing::debug;

use super::spec::{
    ArtifactCategory, ContextMode, ContextSource, ExpirySpec, ImagesFilter, MessagesFilter,
    Retention, SourceSelector, mode_of,
};
use crate::cascade::{CascadeDef, PhaseDef};
use crate::echo::{Echo, Message, MessageKind, PhaseRecord, Role};

/// Assembles prior-phase context for one phase against an Echo snapshot.
pub struct ContextAssembler<'a> {
    cascade: &'a CascadeDef,
    phase: &'a PhaseDef,
    echo: &'a Echo,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(cascade: &'a CascadeDef, phase: &'a PhaseDef, echo: &'a Echo) -> Self {
        Self {
            cascade,
            phase,
            echo,
        }
    }

    /// Expiry in force for this phase (phase override replaces the cascade default).
    pub fn expiry(&self) -> ExpirySpec {
        self.phase.expiry.unwrap_or(self.cascade.expiry)
    }

    /// Messages visible from completed phases, before expiry.
    ///
    /// Computed once per attempt; the snapshot does not change while the
    /// attempt runs.
    pub fn prior(&self) -> Vec<Message> {
        match mode_of(self.phase.context.as_ref()) {
            ContextMode::Full => self.accumulate(),
            ContextMode::Selective => {
                let sources = self
                    .phase
                    .context
                    .as_ref()
                    .map(|c| c.from.as_slice())
                    .unwrap_or_default();
                sources
                    .iter()
                    .flat_map(|source| self.select(source, false))
                    .collect()
            }
            ContextMode::Inject => {
                let sources = self
                    .phase
                    .context
                    .as_ref()
                    .map(|c| c.inject.as_slice())
                    .unwrap_or_default();
                let mut messages: Vec<Message> = sources
                    .iter()
                    .flat_map(|source| self.select(source, true))
                    .collect();
                messages.extend(self.accumulate());
                messages
            }
        }
    }

    /// Full accumulation across completed phases, honoring retention.
    fn accumulate(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        for record in self.echo.phase_records() {
            match record.retention {
                Retention::Full => {
                    messages.extend(record.messages.iter().filter(|m| !m.is_system()).cloned())
                }
                Retention::OutputOnly => messages.push(output_message(record)),
            }
        }
        messages
    }

    fn resolve(&self, source: &ContextSource) -> Vec<&'a PhaseRecord> {
        let records = self.echo.phase_records();
        let resolved: Vec<&PhaseRecord> = match source.selector() {
            SourceSelector::Previous => records.last().into_iter().collect(),
            SourceSelector::First => records.first().into_iter().collect(),
            SourceSelector::All => records.iter().collect(),
            SourceSelector::Named(name) => self.echo.record(name).into_iter().collect(),
        };
        if resolved.is_empty() {
            debug!(
                phase = %self.phase.name,
                source = %source.phase,
                "Context source has not executed; contributing nothing"
            );
        }
        resolved
    }

    fn select(&self, source: &ContextSource, labelled: bool) -> Vec<Message> {
        let mut out = Vec::new();
        for record in self.resolve(source) {
            if labelled {
                out.push(
                    Message::user(
                        MessageKind::State,
                        format!("[Context from phase '{}']", record.phase),
                    )
                    .at(&record.phase, &record.attempt, 0),
                );
            }
            for category in &source.include {
                match category {
                    ArtifactCategory::Output => out.push(output_message(record)),
                    ArtifactCategory::Messages => {
                        out.extend(filter_messages(record, source.messages_filter))
                    }
                    ArtifactCategory::Images => {
                        out.extend(filter_images(record, source.images_filter))
                    }
                    ArtifactCategory::State => {
                        if let Some(msg) = self.state_message(record) {
                            out.push(msg);
                        }
                    }
                }
            }
        }
        out
    }

    fn state_message(&self, record: &PhaseRecord) -> Option<Message> {
        if record.state_keys.is_empty() {
            return None;
        }
        let lines: Vec<String> = record
            .state_keys
            .iter()
            .filter_map(|k| self.echo.state.get(k).map(|v| format!("- {} = {}", k, v)))
            .collect();
        Some(
            Message::user(
                MessageKind::State,
                format!("State set by phase '{}':\n{}", record.phase, lines.join("\n")),
            )
            .at(&record.phase, &record.attempt, 0),
        )
    }
}

/// The final assistant message of a phase, or a stand-in carrying its output.
fn output_message(record: &PhaseRecord) -> Message {
    record.final_assistant().cloned().unwrap_or_else(|| {
        Message::assistant(record.output.clone()).at(&record.phase, &record.attempt, 0)
    })
}

fn filter_messages(record: &PhaseRecord, filter: MessagesFilter) -> Vec<Message> {
    let visible = record.messages.iter().filter(|m| !m.is_system());
    match filter {
        MessagesFilter::All => visible.cloned().collect(),
        MessagesFilter::Last => visible.last().cloned().into_iter().collect(),
        MessagesFilter::AssistantOnly => visible
            .filter(|m| m.role == Role::Assistant)
            .cloned()
            .collect(),
    }
}

fn filter_images(record: &PhaseRecord, filter: ImagesFilter) -> Vec<Message> {
    let images = &record.images;
    let skip = match filter {
        ImagesFilter::All => 0,
        ImagesFilter::Last => images.len().saturating_sub(1),
        ImagesFilter::LastN(n) => images.len().saturating_sub(n),
    };
    images
        .iter()
        .skip(skip)
        .map(|img| Message::image(img.clone()).at(&img.phase, &img.attempt, img.turn_seq))
        .collect()
}

/// Whether an entry has outlived its category's TTL at `current_seq`.
pub fn is_expired(message: &Message, expiry: &ExpirySpec, current_seq: u64) -> bool {
    let ttl = if message.kind == MessageKind::Image || !message.images.is_empty() {
        expiry.images
    } else if message.role == Role::ToolResult {
        expiry.tool_results
    } else if message.role == Role::Assistant {
        expiry.assistant
    } else {
        None
    };
    match ttl {
        Some(ttl) => current_seq.saturating_sub(message.turn_seq) > ttl,
        None => false,
    }
}

/// Final ordered view: system message, prior context, running conversation.
///
/// Expiry applies to prior and running entries alike; the system message is
/// never expired.
pub fn assemble(
    system: &Message,
    prior: &[Message],
    conversation: &[Message],
    expiry: &ExpirySpec,
    current_seq: u64,
) -> Vec<Message> {
    let mut view = Vec::with_capacity(1 + prior.len() + conversation.len());
    view.push(system.clone());
    view.extend(
        prior
            .iter()
            .chain(conversation.iter())
            .filter(|m| expiry.is_empty() || !is_expired(m, expiry, current_seq))
            .cloned(),
    );
    view
}
