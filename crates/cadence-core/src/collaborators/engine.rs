use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{SuggestedBreak, SuggestionEngine, SuggestionRequest};
use crate::agent::{FocusLevel, TimeOfDay};
use crate::error::CollaboratorError;
use crate::suggestion::BreakType;

/// Minimum offers before a break type's acceptance rate is trusted.
const MIN_OFFERS: u64 = 3;

/// Pick the break type best suited to the request.
///
/// A type the user reliably accepts wins; otherwise fall back to a
/// time-of-day and focus heuristic. Never repeats the previous type.
fn choose_break(request: &SuggestionRequest) -> BreakType {
    let preferred = request
        .acceptance
        .iter()
        .filter(|s| s.offered >= MIN_OFFERS && Some(s.break_type) != request.previous_break)
        .max_by(|a, b| {
            a.rate()
                .total_cmp(&b.rate())
                .then_with(|| b.break_type.as_str().cmp(a.break_type.as_str()))
        });
    if let Some(stat) = preferred {
        if stat.rate() >= 0.5 {
            return stat.break_type;
        }
    }

    let candidates: &[BreakType] = match (request.time_of_day, request.focus_level) {
        (_, FocusLevel::Focused | FocusLevel::DeepFocus) => &[BreakType::Eye, BreakType::Posture],
        (TimeOfDay::Morning, _) => &[BreakType::Stretch, BreakType::Hydration],
        (TimeOfDay::Afternoon, _) if request.minutes_worked >= 90 => {
            &[BreakType::Walk, BreakType::Stretch]
        }
        (TimeOfDay::Afternoon, _) => &[BreakType::Hydration, BreakType::Eye],
        (TimeOfDay::Evening, _) => &[BreakType::Breathing, BreakType::Mindfulness],
    };
    candidates
        .iter()
        .copied()
        .find(|b| Some(*b) != request.previous_break)
        .unwrap_or(candidates[0])
}

fn template(break_type: BreakType, time_of_day: TimeOfDay) -> &'static str {
    use BreakType::*;
    use TimeOfDay::*;
    match (break_type, time_of_day) {
        (Eye, Morning) => "Your eyes could use a quick rest. Look at something distant for 20 seconds?",
        (Eye, Afternoon) => "Been focusing on the screen a while. Time for a 20-second eye break?",
        (Eye, Evening) => "As the day winds down, let's give your eyes a quick rest.",
        (Stretch, Morning) => "Start the day right with some energizing stretches!",
        (Stretch, Afternoon) => "A quick stretch could help maintain your momentum.",
        (Stretch, Evening) => "Some gentle stretches to release the day's tension?",
        (Walk, Morning) => "A brief morning walk could energize your day!",
        (Walk, Afternoon) => "Perfect time for a short walk to refresh your mind.",
        (Walk, Evening) => "A walk could help transition from work mode.",
        (Hydration, Morning) => "Start fresh with some water!",
        (Hydration, Afternoon) => "Stay hydrated through the afternoon!",
        (Hydration, Evening) => "One last hydration break before wrapping up?",
        (other, _) => other.default_message(),
    }
}

/// Offline engine: picks a break type heuristically and fills in a
/// time-of-day message template.
#[derive(Debug, Default)]
pub struct TemplateSuggestionEngine;

#[async_trait]
impl SuggestionEngine for TemplateSuggestionEngine {
    fn name(&self) -> &str {
        "template"
    }

    async fn suggest(&self, request: &SuggestionRequest) -> Result<SuggestedBreak, CollaboratorError> {
        let break_type = choose_break(request);
        Ok(SuggestedBreak {
            break_type,
            message: template(break_type, request.time_of_day).to_string(),
        })
    }
}

const SYSTEM_PROMPT: &str = "You are a mindful wellness assistant that helps maintain work/life balance. \
Provide gentle, contextual suggestions for taking breaks during work. \
Keep responses brief, friendly, and focused on the immediate context. \
Use a supportive but not pushy tone.";

const MAX_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Engine backed by a local Ollama server (`POST /api/generate`).
///
/// The break type is chosen locally; the model only words the message.
pub struct OllamaSuggestionEngine {
    client: reqwest::Client,
    api_base: String,
    model: String,
    request_timeout: Duration,
}

impl OllamaSuggestionEngine {
    pub fn new(api_base: &str, model: &str, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            model: model.to_string(),
            request_timeout,
        }
    }

    fn prompt(request: &SuggestionRequest, break_type: BreakType) -> String {
        let meetings = match request.minutes_to_next_meeting {
            Some(m) => format!("next meeting in {m} minutes"),
            None => "no upcoming meetings".to_string(),
        };
        format!(
            "Given the current context:\n\
             - Time of day: {time:?}\n\
             - Suggested break: {kind}\n\
             - Working for: {worked} minutes\n\
             - Focus: {level} ({mode:?})\n\
             - Calendar: {meetings}\n\n\
             Generate a brief, friendly message suggesting a {kind} break.\n\
             Keep the message under 100 characters.\n\
             Focus on the immediate benefit of taking the break.",
            time = request.time_of_day,
            kind = break_type,
            worked = request.minutes_worked,
            level = request.focus_level,
            mode = request.focus_mode,
        )
    }
}

fn tidy(raw: &str) -> String {
    let line = raw.trim().lines().next().unwrap_or("").trim().trim_matches('"');
    line.chars().take(MAX_MESSAGE_CHARS).collect()
}

#[async_trait]
impl SuggestionEngine for OllamaSuggestionEngine {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn suggest(&self, request: &SuggestionRequest) -> Result<SuggestedBreak, CollaboratorError> {
        const NAME: &str = "ollama";
        let break_type = choose_break(request);
        let body = serde_json::json!({
            "model": self.model,
            "system": SYSTEM_PROMPT,
            "prompt": Self::prompt(request, break_type),
            "stream": false,
        });

        let url = format!("{}/api/generate", self.api_base);
        debug!(%url, model = %self.model, "Requesting break suggestion");
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| CollaboratorError::unavailable(NAME, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            warn!("Ollama generate failed ({status}): {text}");
            return Err(CollaboratorError::Rejected {
                collaborator: NAME,
                detail: format!("HTTP {status}"),
            });
        }

        let data: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| CollaboratorError::unavailable(NAME, e))?;
        let message = tidy(&data.response);
        if message.is_empty() {
            return Err(CollaboratorError::Rejected {
                collaborator: NAME,
                detail: "empty response".into(),
            });
        }
        Ok(SuggestedBreak { break_type, message })
    }
}
