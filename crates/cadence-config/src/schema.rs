use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Focus level names, lowest first. Shared with the core's `FocusLevel`.
pub const FOCUS_LEVELS: [&str; 5] = ["minimal", "light", "active", "focused", "deep-focus"];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub activity: ActivityConfig,
    pub focus: FocusConfig,
    pub context: ContextConfig,
    pub nudge: NudgeConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    /// Watchdog applied to every agent invocation.
    pub agent_timeout_secs: u64,
    /// Number of cycle summaries kept under `scheduler.history`.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300, // 5 minutes
            agent_timeout_secs: 30,
            history_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Directory holding context backups and the break history database.
    pub data_dir: String,
    /// How many rotated context backups to keep.
    pub backup_keep: usize,
    /// Capacity of the subscriber notification queue.
    pub notify_queue_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.cadence/data".into(),
            backup_keep: 5,
            notify_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivityConfig {
    /// Simulated activity profile: "deep_work", "distracted", "tired",
    /// "meeting_heavy", "stressed" or "idle".
    pub profile: String,
    pub sample_timeout_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            profile: "deep_work".into(),
            sample_timeout_secs: 5,
        }
    }
}

/// Weights of the composite intensity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoreWeights {
    pub cpu: f64,
    pub active: f64,
    pub switch: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cpu: 0.4,
            active: 0.4,
            switch: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FocusConfig {
    pub weights: ScoreWeights,
    /// Ascending score boundaries between minimal|light|active|focused|deep-focus.
    pub thresholds: Vec<f64>,
    /// Smoothing factor for the (weekday, hour) intensity profile.
    pub ema_alpha: f64,
    /// Idle seconds that count as a fully idle sample.
    pub idle_window_secs: u64,
    /// Idle seconds at which the level is forced to minimal and mode to idle.
    pub idle_minimal_secs: u64,
    /// App switches per minute that saturate the switch component.
    pub switch_rate_ceiling: f64,
    /// App switches per minute at or above which the mode is browsing.
    pub browsing_switch_rate: f64,
    /// Score at or above which deep-work apps count as intense.
    pub intense_score: f64,
    /// Substring of the active app name (lowercase) -> category.
    /// Categories: development, writing, design, browser, communication, media.
    pub app_categories: HashMap<String, String>,
}

impl Default for FocusConfig {
    fn default() -> Self {
        let app_categories = [
            ("code", "development"),
            ("vim", "development"),
            ("terminal", "development"),
            ("idea", "development"),
            ("docs", "writing"),
            ("word", "writing"),
            ("obsidian", "writing"),
            ("figma", "design"),
            ("firefox", "browser"),
            ("chrome", "browser"),
            ("safari", "browser"),
            ("slack", "communication"),
            ("mail", "communication"),
            ("zoom", "communication"),
            ("spotify", "media"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            weights: ScoreWeights::default(),
            thresholds: vec![0.2, 0.4, 0.6, 0.8],
            ema_alpha: 0.3,
            idle_window_secs: 300,
            idle_minimal_secs: 600,
            switch_rate_ceiling: 10.0,
            browsing_switch_rate: 6.0,
            intense_score: 0.75,
            app_categories,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    pub lookahead_minutes: u64,
    pub calendar_timeout_secs: u64,
    pub work_start_hour: u32,
    pub work_end_hour: u32,
    /// JSON file of local calendar events. No calendar when unset.
    pub calendar_file: Option<String>,
    /// Fixed UTC offset used for hour-of-day reasoning. Local time when unset.
    pub utc_offset_minutes: Option<i32>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            lookahead_minutes: 120,
            calendar_timeout_secs: 5,
            work_start_hour: 9,
            work_end_hour: 17,
            calendar_file: None,
            utc_offset_minutes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Template,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub api_base: String,
    pub model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Template,
            api_base: "http://localhost:11434".into(),
            model: "tinyllama:latest".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NudgeConfig {
    /// Minutes of work since the last answered break before a nudge is due.
    pub work_session_minutes: u64,
    /// Focus level at or above which nudges are suppressed.
    pub focus_ceiling: String,
    pub suggestion_timeout_secs: u64,
    /// Bound on each break history read or write.
    pub history_timeout_secs: u64,
    /// A focus reading older than this no longer suppresses nudges.
    pub focus_max_age_secs: u64,
    /// Finished suggestions kept under `suggestions.history`.
    pub history_limit: usize,
    pub engine: EngineConfig,
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            work_session_minutes: 50,
            focus_ceiling: "deep-focus".into(),
            suggestion_timeout_secs: 10,
            history_timeout_secs: 5,
            focus_max_age_secs: 600, // two default cycles
            history_limit: 10,
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryConfig {
    /// Minutes a suggestion may stay unanswered before it expires.
    pub expiry_minutes: u64,
    pub delivery_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            expiry_minutes: 15,
            delivery_timeout_secs: 5,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl Config {
    /// Reject values the scheduler and agents cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.interval_secs == 0 {
            return Err(invalid("scheduler.intervalSecs", "must be greater than 0"));
        }
        if self.scheduler.agent_timeout_secs == 0 {
            return Err(invalid("scheduler.agentTimeoutSecs", "must be greater than 0"));
        }
        if self.store.backup_keep == 0 {
            return Err(invalid("store.backupKeep", "must keep at least one backup"));
        }
        if self.store.notify_queue_capacity == 0 {
            return Err(invalid("store.notifyQueueCapacity", "must be greater than 0"));
        }
        if self.activity.sample_timeout_secs == 0 {
            return Err(invalid("activity.sampleTimeoutSecs", "must be greater than 0"));
        }
        self.focus.validate()?;

        let ctx = &self.context;
        if ctx.calendar_timeout_secs == 0 {
            return Err(invalid("context.calendarTimeoutSecs", "must be greater than 0"));
        }
        if ctx.work_start_hour >= ctx.work_end_hour || ctx.work_end_hour > 24 {
            return Err(invalid(
                "context.workStartHour",
                format!(
                    "work hours {}..{} are not a valid range",
                    ctx.work_start_hour, ctx.work_end_hour
                ),
            ));
        }
        if let Some(offset) = ctx.utc_offset_minutes {
            if offset.abs() >= 24 * 60 {
                return Err(invalid("context.utcOffsetMinutes", "must be within ±24h"));
            }
        }

        if !FOCUS_LEVELS.contains(&self.nudge.focus_ceiling.as_str()) {
            return Err(invalid(
                "nudge.focusCeiling",
                format!(
                    "unknown level '{}', expected one of {}",
                    self.nudge.focus_ceiling,
                    FOCUS_LEVELS.join(", ")
                ),
            ));
        }
        if self.nudge.suggestion_timeout_secs == 0 {
            return Err(invalid("nudge.suggestionTimeoutSecs", "must be greater than 0"));
        }
        if self.nudge.history_timeout_secs == 0 {
            return Err(invalid("nudge.historyTimeoutSecs", "must be greater than 0"));
        }
        if self.nudge.focus_max_age_secs == 0 {
            return Err(invalid("nudge.focusMaxAgeSecs", "must be greater than 0"));
        }
        if self.delivery.expiry_minutes == 0 {
            return Err(invalid("delivery.expiryMinutes", "must be greater than 0"));
        }
        if self.delivery.delivery_timeout_secs == 0 {
            return Err(invalid("delivery.deliveryTimeoutSecs", "must be greater than 0"));
        }
        Ok(())
    }
}

impl FocusConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.weights;
        for (name, value) in [("cpu", w.cpu), ("active", w.active), ("switch", w.switch)] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(
                    "focus.weights",
                    format!("weight '{name}' must be a non-negative number"),
                ));
            }
        }
        if w.cpu + w.active + w.switch <= 0.0 {
            return Err(invalid("focus.weights", "weights must not all be zero"));
        }
        if self.thresholds.len() != FOCUS_LEVELS.len() - 1 {
            return Err(invalid(
                "focus.thresholds",
                format!(
                    "expected {} thresholds, got {}",
                    FOCUS_LEVELS.len() - 1,
                    self.thresholds.len()
                ),
            ));
        }
        if self.thresholds.iter().any(|t| !t.is_finite())
            || self.thresholds.windows(2).any(|pair| pair[0] >= pair[1])
        {
            return Err(invalid("focus.thresholds", "must be strictly ascending numbers"));
        }
        if self.ema_alpha.is_nan() || self.ema_alpha <= 0.0 || self.ema_alpha > 1.0 {
            return Err(invalid("focus.emaAlpha", "must be in (0, 1]"));
        }
        if self.idle_window_secs == 0 {
            return Err(invalid("focus.idleWindowSecs", "must be greater than 0"));
        }
        if self.switch_rate_ceiling.is_nan() || self.switch_rate_ceiling <= 0.0 {
            return Err(invalid("focus.switchRateCeiling", "must be greater than 0"));
        }
        Ok(())
    }
}
