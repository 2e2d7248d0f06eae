use std::{collections::VecDeque, path::Path};

use chrono::{DateTime, Utc};
use shared::domain::DesignMode;
use tracing::{debug, info, warn};

use crate::{
    error::{GenerationError, StudioError},
    types::{GeneratedImage, GenerationRequest, ReferenceImage},
};

pub const DEFAULT_HISTORY_LIMIT: usize = 12;

const QUALITY_BOOSTER: &str =
    "Ultra-detailed, 8k resolution, professional lighting, photorealistic, award-winning composition.";

const FASHION_STYLES: &[&str] = &[
    "Haute Couture",
    "Streetwear",
    "Minimalist",
    "Avant-Garde",
    "Bohemian",
    "Cyberpunk",
];

const ARCHITECTURE_STYLES: &[&str] = &[
    "Modernist",
    "Brutalist",
    "Parametric",
    "Scandinavian",
    "Biophilic",
    "Art Deco",
];

pub fn style_presets(mode: DesignMode) -> &'static [&'static str] {
    match mode {
        DesignMode::Fashion => FASHION_STYLES,
        DesignMode::Architecture => ARCHITECTURE_STYLES,
    }
}

fn mode_prefix(mode: DesignMode) -> &'static str {
    match mode {
        DesignMode::Fashion => "High-end fashion design photograph of",
        DesignMode::Architecture => "Professional architectural visualization of",
    }
}

/// Subject used when only a sketch was supplied.
pub fn default_sketch_instruction(mode: DesignMode) -> &'static str {
    match mode {
        DesignMode::Fashion => "the outfit in this sketch, rendered as a finished garment",
        DesignMode::Architecture => {
            "the space in this sketch, rendered as a finished interior or building"
        }
    }
}

/// Builds the instruction sent to the generation API.
pub fn assemble_prompt(mode: DesignMode, subject: &str, style: &str) -> String {
    let subject = subject.trim();
    let style = style.trim();
    if style.is_empty() {
        format!("{} {subject}. {QUALITY_BOOSTER}", mode_prefix(mode))
    } else {
        format!("{} {subject}, {style} style. {QUALITY_BOOSTER}", mode_prefix(mode))
    }
}

/// What to do with a response that arrives after a newer one was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StaleResponsePolicy {
    #[default]
    LastWriteWins,
    DropStale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationTicket(u64);

impl GenerationTicket {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// A request the session has validated and handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGeneration {
    pub ticket: GenerationTicket,
    pub request: GenerationRequest,
    /// Full instruction including prefix and booster.
    pub prompt: String,
}

/// The render currently on screen, with the inputs that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentDesign {
    pub ticket: GenerationTicket,
    pub image: GeneratedImage,
    pub prompt: String,
    pub mode: DesignMode,
    pub style: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub image: GeneratedImage,
    pub prompt: String,
    pub mode: DesignMode,
    pub style: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Applied,
    DroppedStale,
}

/// Form and view state of the studio, independent of any UI toolkit.
#[derive(Debug, Clone)]
pub struct StudioSession {
    mode: DesignMode,
    style: String,
    prompt: String,
    reference: Option<ReferenceImage>,
    current: Option<CurrentDesign>,
    history: VecDeque<HistoryEntry>,
    history_limit: usize,
    error: Option<String>,
    stale_policy: StaleResponsePolicy,
    next_ticket: u64,
    newest_applied: Option<GenerationTicket>,
    in_flight: usize,
}

impl Default for StudioSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StudioSession {
    pub fn new() -> Self {
        let mode = DesignMode::default();
        Self {
            mode,
            style: style_presets(mode)[0].to_string(),
            prompt: String::new(),
            reference: None,
            current: None,
            history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            error: None,
            stale_policy: StaleResponsePolicy::default(),
            next_ticket: 0,
            newest_applied: None,
            in_flight: 0,
        }
    }

    pub fn with_stale_policy(mut self, policy: StaleResponsePolicy) -> Self {
        self.stale_policy = policy;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self.history.truncate(self.history_limit);
        self
    }

    pub fn mode(&self) -> DesignMode {
        self.mode
    }

    /// Switching mode resets the style to the new mode's first preset.
    pub fn set_mode(&mut self, mode: DesignMode) {
        if mode != self.mode {
            self.mode = mode;
            self.style = style_presets(mode)[0].to_string();
        }
    }

    pub fn style(&self) -> &str {
        &self.style
    }

    pub fn set_style(&mut self, style: impl Into<String>) {
        self.style = style.into();
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = prompt.into();
    }

    /// Appends voice-transcribed text to the prompt.
    pub fn apply_transcript(&mut self, transcript: &str) {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return;
        }
        if self.prompt.trim().is_empty() {
            self.prompt = transcript.to_string();
        } else {
            self.prompt = format!("{} {transcript}", self.prompt.trim_end());
        }
    }

    pub fn reference(&self) -> Option<&ReferenceImage> {
        self.reference.as_ref()
    }

    pub fn set_reference(&mut self, reference: Option<ReferenceImage>) {
        self.reference = reference;
    }

    pub fn load_reference(&mut self, path: &Path) -> Result<(), StudioError> {
        match ReferenceImage::from_path(path) {
            Ok(reference) => {
                debug!(path = %path.display(), mime = %reference.mime_type, "studio: reference image loaded");
                self.reference = Some(reference);
                Ok(())
            }
            Err(err) => {
                self.error = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn current_design(&self) -> Option<&CurrentDesign> {
        self.current.as_ref()
    }

    pub fn clear_current_design(&mut self) {
        self.current = None;
    }

    /// Newest first.
    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn is_generating(&self) -> bool {
        self.in_flight > 0
    }

    /// Validates the form and hands out a ticketed request. An empty prompt
    /// with no reference image is rejected without issuing anything.
    pub fn begin_generation(&mut self) -> Result<PendingGeneration, StudioError> {
        let typed = self.prompt.trim();
        let subject = match (typed.is_empty(), self.reference.is_some()) {
            (false, _) => typed.to_string(),
            (true, true) => default_sketch_instruction(self.mode).to_string(),
            (true, false) => {
                let err =
                    StudioError::Validation("enter a description or attach a sketch".to_string());
                self.error = Some(err.to_string());
                return Err(err);
            }
        };

        self.next_ticket += 1;
        self.in_flight += 1;
        self.error = None;
        let ticket = GenerationTicket(self.next_ticket);
        let prompt = assemble_prompt(self.mode, &subject, &self.style);
        info!(
            ticket = ticket.0,
            mode = %self.mode,
            style = %self.style,
            with_reference = self.reference.is_some(),
            "studio: generation started"
        );
        Ok(PendingGeneration {
            ticket,
            request: GenerationRequest {
                prompt_text: subject,
                reference_image: self.reference.clone(),
                mode: self.mode,
                style: self.style.clone(),
            },
            prompt,
        })
    }

    /// Applies a finished request to the view state. A failure is recorded
    /// as the session error and handed back; the image on screen stays.
    pub fn complete_generation(
        &mut self,
        pending: PendingGeneration,
        result: Result<GeneratedImage, GenerationError>,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.in_flight = self.in_flight.saturating_sub(1);
        let ticket = pending.ticket;

        let image = match result {
            Ok(image) => image,
            Err(err) => {
                warn!(ticket = ticket.0, error = %err, "studio: generation failed");
                if self.accepts(ticket) {
                    self.error = Some(err.to_string());
                }
                return Err(err);
            }
        };

        if !self.accepts(ticket) {
            debug!(ticket = ticket.0, "studio: dropping stale response");
            return Ok(GenerationOutcome::DroppedStale);
        }

        let request = pending.request;
        self.history.push_front(HistoryEntry {
            image: image.clone(),
            prompt: request.prompt_text.clone(),
            mode: request.mode,
            style: request.style.clone(),
            generated_at: Utc::now(),
        });
        self.history.truncate(self.history_limit);
        self.current = Some(CurrentDesign {
            ticket,
            image,
            prompt: request.prompt_text,
            mode: request.mode,
            style: request.style,
        });
        self.newest_applied = Some(self.newest_applied.map_or(ticket, |newest| newest.max(ticket)));
        self.error = None;
        Ok(GenerationOutcome::Applied)
    }

    fn accepts(&self, ticket: GenerationTicket) -> bool {
        match (self.stale_policy, self.newest_applied) {
            (StaleResponsePolicy::DropStale, Some(newest)) => ticket > newest,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(tag: &str) -> GeneratedImage {
        GeneratedImage::from_base64(Some("image/png"), tag)
    }

    #[test]
    fn prompt_carries_prefix_style_and_booster() {
        let prompt = assemble_prompt(DesignMode::Fashion, " a linen suit ", "Minimalist");
        assert_eq!(
            prompt,
            "High-end fashion design photograph of a linen suit, Minimalist style. \
             Ultra-detailed, 8k resolution, professional lighting, photorealistic, \
             award-winning composition."
        );
        let prompt = assemble_prompt(DesignMode::Architecture, "a library", "Brutalist");
        assert!(prompt.starts_with("Professional architectural visualization of a library, Brutalist style."));
    }

    #[test]
    fn empty_prompt_without_sketch_is_rejected() {
        let mut session = StudioSession::new();
        session.set_prompt("   ");
        let err = session.begin_generation().expect_err("should fail");
        assert!(matches!(err, StudioError::Validation(_)));
        assert!(session.error().is_some());
        assert!(!session.is_generating());
    }

    #[test]
    fn sketch_only_uses_default_instruction() {
        let mut session = StudioSession::new();
        session.set_mode(DesignMode::Architecture);
        session.set_reference(Some(ReferenceImage::from_bytes("image/png", b"sketch")));
        let pending = session.begin_generation().expect("pending");
        assert_eq!(
            pending.request.prompt_text,
            default_sketch_instruction(DesignMode::Architecture)
        );
        assert_eq!(pending.request.style, "Modernist");
        assert!(pending.request.reference_image.is_some());
        assert!(session.is_generating());
    }

    #[test]
    fn transcript_is_appended_to_prompt() {
        let mut session = StudioSession::new();
        session.apply_transcript("flowing silk gown");
        session.apply_transcript("  with gold embroidery ");
        assert_eq!(session.prompt(), "flowing silk gown with gold embroidery");
    }

    #[test]
    fn mode_switch_resets_style_to_first_preset() {
        let mut session = StudioSession::new();
        session.set_style("Streetwear");
        session.set_mode(DesignMode::Architecture);
        assert_eq!(session.style(), "Modernist");
        assert_eq!(style_presets(DesignMode::Fashion).len(), 6);
    }

    #[test]
    fn successful_generation_updates_current_and_history() {
        let mut session = StudioSession::new().with_history_limit(2);
        for tag in ["AAAA", "BBBB", "CCCC"] {
            session.set_prompt(format!("coat {tag}"));
            let pending = session.begin_generation().expect("pending");
            let outcome = session.complete_generation(pending, Ok(image(tag)));
            assert_eq!(outcome.expect("applied"), GenerationOutcome::Applied);
        }
        let history: Vec<_> = session.history().map(|entry| entry.prompt.clone()).collect();
        assert_eq!(history, vec!["coat CCCC", "coat BBBB"]);
        assert_eq!(
            session.current_design().map(|design| design.image.clone()),
            Some(image("CCCC"))
        );
        assert!(!session.is_generating());
    }

    #[test]
    fn failure_sets_error_and_keeps_previous_image() {
        let mut session = StudioSession::new();
        session.set_prompt("coat");
        let first = session.begin_generation().expect("pending");
        session
            .complete_generation(first, Ok(image("AAAA")))
            .expect("applied");

        let second = session.begin_generation().expect("pending");
        let err = session
            .complete_generation(second, Err(GenerationError::MissingImage))
            .expect_err("should fail");
        assert!(matches!(err, GenerationError::MissingImage));
        assert!(session.error().is_some());
        assert_eq!(
            session.current_design().map(|design| design.image.clone()),
            Some(image("AAAA"))
        );
    }

    #[test]
    fn last_write_wins_applies_late_responses() {
        let mut session = StudioSession::new();
        session.set_prompt("coat");
        let older = session.begin_generation().expect("older");
        let newer = session.begin_generation().expect("newer");

        session
            .complete_generation(newer, Ok(image("NEW0")))
            .expect("applied");
        let outcome = session.complete_generation(older, Ok(image("OLD0")));
        assert_eq!(outcome.expect("applied"), GenerationOutcome::Applied);
        assert_eq!(
            session.current_design().map(|design| design.image.clone()),
            Some(image("OLD0"))
        );
    }

    #[test]
    fn drop_stale_ignores_late_responses() {
        let mut session = StudioSession::new().with_stale_policy(StaleResponsePolicy::DropStale);
        session.set_prompt("coat");
        let older = session.begin_generation().expect("older");
        let newer = session.begin_generation().expect("newer");

        session
            .complete_generation(newer, Ok(image("NEW0")))
            .expect("applied");
        let outcome = session.complete_generation(older, Ok(image("OLD0")));
        assert_eq!(outcome.expect("dropped"), GenerationOutcome::DroppedStale);
        assert_eq!(
            session.current_design().map(|design| design.image.clone()),
            Some(image("NEW0"))
        );
        assert_eq!(session.history().count(), 1);
        assert!(!session.is_generating());
    }
}
