//! Focus classification from activity samples.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_config::FocusConfig;
use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{bounded, Agent};
use crate::clock::Clock;
use crate::collaborators::{ActivitySample, ActivitySource};
use crate::context::{paths, ContextStore};
use crate::error::{AgentError, CollaboratorError};

pub const NAME: &str = "focus_monitor";

/// Samples needed before the profile baseline is fully trusted.
const CONFIDENT_SAMPLES: u64 = 10;

const DEEP_WORK_CATEGORIES: [&str; 3] = ["development", "writing", "design"];
const DISTRACTING_CATEGORIES: [&str; 2] = ["browser", "communication"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FocusLevel {
    Minimal,
    Light,
    Active,
    Focused,
    DeepFocus,
}

impl FocusLevel {
    /// Lowest first.
    pub const ALL: [FocusLevel; 5] = [
        FocusLevel::Minimal,
        FocusLevel::Light,
        FocusLevel::Active,
        FocusLevel::Focused,
        FocusLevel::DeepFocus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FocusLevel::Minimal => "minimal",
            FocusLevel::Light => "light",
            FocusLevel::Active => "active",
            FocusLevel::Focused => "focused",
            FocusLevel::DeepFocus => "deep-focus",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == s)
    }
}

impl fmt::Display for FocusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusMode {
    Intense,
    Focused,
    Casual,
    Browsing,
    Idle,
}

/// Result of one classification, stored at `focus.current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusState {
    pub level: FocusLevel,
    pub mode: FocusMode,
    pub confidence: f64,
    pub score: f64,
    pub active_app: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub computed_at: DateTime<Utc>,
}

/// Score components, stored at `focus.metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusMetrics {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<ActivitySample>,
    pub idle_ratio: f64,
    pub switch_component: f64,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSlot {
    pub ema: f64,
    pub samples: u64,
}

/// Typical intensity per (weekday, hour), smoothed with an EMA.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FocusProfile {
    slots: BTreeMap<String, ProfileSlot>,
}

impl FocusProfile {
    /// Slot key such as `mon-09`.
    pub fn key(at: &DateTime<FixedOffset>) -> String {
        format!("{}-{:02}", at.weekday().to_string().to_lowercase(), at.hour())
    }

    pub fn slot(&self, key: &str) -> Option<&ProfileSlot> {
        self.slots.get(key)
    }

    pub fn record(&mut self, key: String, score: f64, alpha: f64) {
        self.slots
            .entry(key)
            .and_modify(|slot| {
                slot.ema = alpha * score + (1.0 - alpha) * slot.ema;
                slot.samples += 1;
            })
            .or_insert(ProfileSlot {
                ema: score,
                samples: 1,
            });
    }
}

/// Category of an app by the longest configured substring match.
fn categorize(config: &FocusConfig, app: &str) -> Option<String> {
    let app = app.to_lowercase();
    config
        .app_categories
        .iter()
        .filter(|(needle, _)| !needle.is_empty() && app.contains(needle.to_lowercase().as_str()))
        .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
        .map(|(_, category)| category.clone())
}

/// Composite intensity in [0, 1] and its idle/switch components.
pub fn score(config: &FocusConfig, sample: &ActivitySample) -> (f64, f64, f64) {
    let w = &config.weights;
    let cpu = (sample.cpu_percent / 100.0).clamp(0.0, 1.0);
    let idle_ratio = (sample.idle_seconds as f64 / config.idle_window_secs.max(1) as f64).min(1.0);
    let switch = (sample.switch_rate.max(0.0) / config.switch_rate_ceiling).min(1.0);
    let total = w.cpu + w.active + w.switch;
    let raw = w.cpu * cpu + w.active * (1.0 - idle_ratio) + w.switch * switch;
    // Weights that do not sum to one are normalized so thresholds stay meaningful.
    let s = if total > 0.0 { raw / total } else { 0.0 };
    (s.clamp(0.0, 1.0), idle_ratio, switch)
}

/// Number of thresholds strictly exceeded; ties stay at the lower level.
pub fn level_for(thresholds: &[f64], s: f64) -> FocusLevel {
    let exceeded = thresholds.iter().filter(|t| s > **t).count();
    FocusLevel::ALL[exceeded.min(FocusLevel::ALL.len() - 1)]
}

fn mode_for(config: &FocusConfig, sample: &ActivitySample, category: Option<&str>, s: f64) -> FocusMode {
    if sample.idle_seconds >= config.idle_minimal_secs {
        return FocusMode::Idle;
    }
    if sample.switch_rate >= config.browsing_switch_rate
        || category.is_some_and(|c| DISTRACTING_CATEGORIES.contains(&c))
    {
        return FocusMode::Browsing;
    }
    match category {
        Some(c) if DEEP_WORK_CATEGORIES.contains(&c) && s >= config.intense_score => FocusMode::Intense,
        Some(c) if DEEP_WORK_CATEGORIES.contains(&c) => FocusMode::Focused,
        _ => FocusMode::Casual,
    }
}

fn confidence_for(slot: Option<&ProfileSlot>, s: f64) -> f64 {
    match slot {
        None => 0.3,
        Some(slot) => {
            let familiarity = (slot.samples as f64 / CONFIDENT_SAMPLES as f64).min(1.0);
            let agreement = 1.0 - (s - slot.ema).abs().min(1.0);
            (0.3 + 0.7 * familiarity * agreement).clamp(0.0, 1.0)
        }
    }
}

/// Classify one sample against the profile. Pure and deterministic.
pub fn classify(
    config: &FocusConfig,
    sample: &ActivitySample,
    profile: &FocusProfile,
    at: &DateTime<FixedOffset>,
) -> (FocusState, FocusMetrics) {
    let (s, idle_ratio, switch_component) = score(config, sample);
    let category = categorize(config, &sample.active_app);
    let slot = profile.slot(&FocusProfile::key(at));

    let level = if sample.idle_seconds >= config.idle_minimal_secs {
        FocusLevel::Minimal
    } else {
        level_for(&config.thresholds, s)
    };
    let mode = mode_for(config, sample, category.as_deref(), s);
    let computed_at = at.with_timezone(&Utc);

    let state = FocusState {
        level,
        mode,
        confidence: confidence_for(slot, s),
        score: s,
        active_app: sample.active_app.clone(),
        category,
        computed_at,
    };
    let metrics = FocusMetrics {
        available: true,
        sample: Some(sample.clone()),
        idle_ratio,
        switch_component,
        score: s,
        baseline: slot.map(|sl| sl.ema),
        error: None,
        sampled_at: computed_at,
    };
    (state, metrics)
}

pub struct FocusPerception {
    sample: Result<ActivitySample, CollaboratorError>,
    profile: FocusProfile,
    at: DateTime<FixedOffset>,
}

pub enum FocusDecision {
    Classified {
        state: FocusState,
        metrics: FocusMetrics,
        profile: FocusProfile,
    },
    /// No sample this cycle; `focus.current` keeps its previous value.
    Unavailable(FocusMetrics),
}

/// Turns activity samples into a focus level and mode.
pub struct FocusMonitorAgent {
    config: FocusConfig,
    source: Arc<dyn ActivitySource>,
    clock: Arc<dyn Clock>,
    sample_timeout: Duration,
}

impl FocusMonitorAgent {
    pub fn new(
        config: FocusConfig,
        source: Arc<dyn ActivitySource>,
        clock: Arc<dyn Clock>,
        sample_timeout: Duration,
    ) -> Self {
        Self {
            config,
            source,
            clock,
            sample_timeout,
        }
    }
}

#[async_trait]
impl Agent for FocusMonitorAgent {
    type Perception = FocusPerception;
    type Decision = FocusDecision;

    fn name(&self) -> &str {
        NAME
    }

    async fn perceive(&mut self, store: &ContextStore) -> Result<FocusPerception, AgentError> {
        let at = self.clock.now();
        let sample = bounded("activity source", self.sample_timeout, self.source.sample()).await;
        let profile = match store.get_as::<FocusProfile>(paths::FOCUS_PROFILE) {
            Ok(profile) => profile.unwrap_or_default(),
            Err(e) => {
                warn!("Discarding unreadable focus profile: {e}");
                FocusProfile::default()
            }
        };
        Ok(FocusPerception {
            sample,
            profile,
            at,
        })
    }

    fn reason(&mut self, perception: FocusPerception) -> Result<FocusDecision, AgentError> {
        let FocusPerception {
            sample,
            mut profile,
            at,
        } = perception;
        let sample = match sample {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Activity sample unavailable: {e}");
                return Ok(FocusDecision::Unavailable(FocusMetrics {
                    available: false,
                    sample: None,
                    idle_ratio: 0.0,
                    switch_component: 0.0,
                    score: 0.0,
                    baseline: None,
                    error: Some(e.to_string()),
                    sampled_at: at.with_timezone(&Utc),
                }));
            }
        };

        let (state, metrics) = classify(&self.config, &sample, &profile, &at);
        profile.record(FocusProfile::key(&at), state.score, self.config.ema_alpha);
        debug!(
            level = %state.level,
            mode = ?state.mode,
            score = state.score,
            confidence = state.confidence,
            "Focus classified"
        );
        Ok(FocusDecision::Classified {
            state,
            metrics,
            profile,
        })
    }

    async fn act(&mut self, store: &ContextStore, decision: FocusDecision) -> Result<(), AgentError> {
        match decision {
            FocusDecision::Classified {
                state,
                metrics,
                profile,
            } => {
                store.set(paths::FOCUS_METRICS, &metrics, NAME)?;
                store.set(paths::FOCUS_PROFILE, &profile, NAME)?;
                store.set(paths::FOCUS_CURRENT, &state, NAME)?;
            }
            FocusDecision::Unavailable(metrics) => {
                store.set(paths::FOCUS_METRICS, &metrics, NAME)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::PipelineStage;
    use crate::clock::ManualClock;
    use crate::collaborators::SimulatedActivitySource;
    use crate::testing::FailingActivity;

    fn at() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-03-02T11:30:00+00:00").unwrap()
    }

    fn sample(cpu: f64, idle: u64, app: &str, switches: f64) -> ActivitySample {
        ActivitySample {
            cpu_percent: cpu,
            memory_percent: 50.0,
            idle_seconds: idle,
            active_app: app.into(),
            switch_rate: switches,
        }
    }

    #[test]
    fn score_combines_components() {
        let config = FocusConfig::default();
        // cpu 0.5*0.4 + active (1 - 150/300)*0.4 + switch (5/10)*0.2 = 0.2 + 0.2 + 0.1
        let (s, idle, switch) = score(&config, &sample(50.0, 150, "vscode", 5.0));
        assert!((s - 0.5).abs() < 1e-9);
        assert!((idle - 0.5).abs() < 1e-9);
        assert!((switch - 0.5).abs() < 1e-9);
    }

    #[test]
    fn threshold_ties_go_lower() {
        let thresholds = [0.2, 0.4, 0.6, 0.8];
        assert_eq!(level_for(&thresholds, 0.0), FocusLevel::Minimal);
        assert_eq!(level_for(&thresholds, 0.2), FocusLevel::Minimal);
        assert_eq!(level_for(&thresholds, 0.21), FocusLevel::Light);
        assert_eq!(level_for(&thresholds, 0.6), FocusLevel::Active);
        assert_eq!(level_for(&thresholds, 0.8), FocusLevel::Focused);
        assert_eq!(level_for(&thresholds, 0.81), FocusLevel::DeepFocus);
        assert_eq!(level_for(&thresholds, 1.0), FocusLevel::DeepFocus);
    }

    #[test]
    fn long_idle_forces_minimal() {
        let config = FocusConfig::default();
        let (state, _) = classify(&config, &sample(99.0, 900, "vscode", 0.0), &FocusProfile::default(), &at());
        assert_eq!(state.level, FocusLevel::Minimal);
        assert_eq!(state.mode, FocusMode::Idle);
    }

    #[test]
    fn modes_follow_app_category() {
        let config = FocusConfig::default();
        let profile = FocusProfile::default();
        let mode = |s: ActivitySample| classify(&config, &s, &profile, &at()).0.mode;

        assert_eq!(mode(sample(95.0, 0, "VSCode", 1.0)), FocusMode::Intense);
        assert_eq!(mode(sample(30.0, 100, "vscode", 1.0)), FocusMode::Focused);
        assert_eq!(mode(sample(30.0, 10, "Google Chrome", 1.0)), FocusMode::Browsing);
        assert_eq!(mode(sample(30.0, 10, "vscode", 8.0)), FocusMode::Browsing);
        assert_eq!(mode(sample(30.0, 10, "finder", 1.0)), FocusMode::Casual);
    }

    #[test]
    fn longest_category_match_wins() {
        let mut config = FocusConfig::default();
        config.app_categories.insert("google docs".into(), "writing".into());
        config.app_categories.insert("google".into(), "browser".into());
        assert_eq!(categorize(&config, "Google Docs").as_deref(), Some("writing"));
        assert_eq!(categorize(&config, "google maps").as_deref(), Some("browser"));
        assert_eq!(categorize(&config, "unknown"), None);
    }

    #[test]
    fn classification_is_deterministic() {
        let config = FocusConfig::default();
        let mut profile = FocusProfile::default();
        profile.record(FocusProfile::key(&at()), 0.6, 0.3);
        let s = sample(70.0, 30, "terminal", 2.0);
        let (a, _) = classify(&config, &s, &profile, &at());
        for _ in 0..50 {
            let (b, _) = classify(&config, &s, &profile.clone(), &at());
            assert_eq!((a.level, a.mode), (b.level, b.mode));
            assert_eq!(a.confidence, b.confidence);
        }
    }

    #[test]
    fn profile_ema_and_confidence() {
        let mut profile = FocusProfile::default();
        let key = FocusProfile::key(&at());
        assert_eq!(key, "mon-11");
        profile.record(key.clone(), 1.0, 0.5);
        profile.record(key.clone(), 0.0, 0.5);
        let slot = *profile.slot(&key).unwrap();
        assert_eq!(slot.samples, 2);
        assert!((slot.ema - 0.5).abs() < 1e-9);

        assert_eq!(confidence_for(None, 0.5), 0.3);
        let familiar = ProfileSlot { ema: 0.5, samples: 20 };
        assert!((confidence_for(Some(&familiar), 0.5) - 1.0).abs() < 1e-9);
        assert!(confidence_for(Some(&familiar), 0.9) < confidence_for(Some(&familiar), 0.6));
    }

    #[tokio::test]
    async fn step_writes_focus_paths() {
        let store = ContextStore::new();
        let mut agent = FocusMonitorAgent::new(
            FocusConfig::default(),
            Arc::new(SimulatedActivitySource::profile("deep_work").unwrap()),
            Arc::new(ManualClock::new(at())),
            Duration::from_secs(1),
        );
        agent.step(&store).await.unwrap();
        agent.step(&store).await.unwrap();

        let state: FocusState = store.get_as(paths::FOCUS_CURRENT).unwrap().unwrap();
        assert_eq!(state.active_app, "vscode");
        assert!(state.level >= FocusLevel::Active);
        let profile: FocusProfile = store.get_as(paths::FOCUS_PROFILE).unwrap().unwrap();
        assert_eq!(profile.slot("mon-11").unwrap().samples, 2);
        assert_eq!(store.get("focus.metrics.available").unwrap(), serde_json::json!(true));
    }

    #[tokio::test]
    async fn failed_sample_keeps_previous_state() {
        let store = ContextStore::new();
        let previous = FocusState {
            level: FocusLevel::Light,
            mode: FocusMode::Casual,
            confidence: 0.3,
            score: 0.3,
            active_app: "finder".into(),
            category: None,
            computed_at: Utc::now(),
        };
        store.set(paths::FOCUS_CURRENT, &previous, "test").unwrap();

        let mut agent = FocusMonitorAgent::new(
            FocusConfig::default(),
            Arc::new(FailingActivity),
            Arc::new(ManualClock::new(at())),
            Duration::from_secs(1),
        );
        agent.step(&store).await.unwrap();

        assert_eq!(store.get_as::<FocusState>(paths::FOCUS_CURRENT).unwrap(), Some(previous));
        assert_eq!(store.get("focus.metrics.available").unwrap(), serde_json::json!(false));
    }
}
