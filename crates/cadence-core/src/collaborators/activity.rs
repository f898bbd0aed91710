use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{ActivitySample, ActivitySource};
use crate::error::CollaboratorError;

fn sample(cpu: f64, memory: f64, idle: u64, app: &str, switches: f64) -> ActivitySample {
    ActivitySample {
        cpu_percent: cpu,
        memory_percent: memory,
        idle_seconds: idle,
        active_app: app.to_string(),
        switch_rate: switches,
    }
}

/// Names accepted by [`SimulatedActivitySource::profile`].
pub const PROFILES: [&str; 8] = [
    "deep_work",
    "distracted",
    "tired",
    "meeting_heavy",
    "stressed",
    "eye_strain",
    "sedentary",
    "idle",
];

fn script(profile: &str) -> Option<Vec<ActivitySample>> {
    let samples = match profile {
        // Long coding stretch, few switches.
        "deep_work" => vec![
            sample(65.0, 70.0, 20, "vscode", 1.0),
            sample(72.0, 71.0, 10, "vscode", 0.5),
            sample(80.0, 72.0, 5, "terminal", 1.5),
            sample(68.0, 70.0, 30, "vscode", 1.0),
        ],
        "distracted" => vec![
            sample(35.0, 60.0, 40, "chrome", 9.0),
            sample(30.0, 58.0, 60, "slack", 12.0),
            sample(40.0, 61.0, 20, "vscode", 7.0),
            sample(25.0, 59.0, 90, "firefox", 8.0),
        ],
        "tired" => vec![
            sample(15.0, 50.0, 240, "docs", 0.5),
            sample(10.0, 49.0, 420, "docs", 0.2),
            sample(20.0, 50.0, 180, "mail", 1.0),
        ],
        "meeting_heavy" => vec![
            sample(45.0, 65.0, 15, "zoom", 0.5),
            sample(50.0, 66.0, 10, "zoom", 0.3),
            sample(30.0, 60.0, 60, "slack", 4.0),
        ],
        "stressed" => vec![
            sample(90.0, 88.0, 2, "terminal", 6.0),
            sample(95.0, 90.0, 1, "vscode", 7.5),
            sample(85.0, 87.0, 3, "chrome", 9.5),
        ],
        "eye_strain" => vec![
            sample(55.0, 62.0, 5, "figma", 0.5),
            sample(60.0, 63.0, 3, "figma", 0.8),
        ],
        "sedentary" => vec![
            sample(40.0, 55.0, 10, "obsidian", 1.0),
            sample(45.0, 56.0, 8, "word", 1.2),
        ],
        "idle" => vec![sample(3.0, 40.0, 1800, "finder", 0.0)],
        _ => return None,
    };
    Some(samples)
}

/// Replays a scripted activity profile, one sample per call, looping.
pub struct SimulatedActivitySource {
    samples: Vec<ActivitySample>,
    cursor: AtomicUsize,
}

impl SimulatedActivitySource {
    /// Source for a named profile (see [`PROFILES`]).
    pub fn profile(name: &str) -> Result<Self, CollaboratorError> {
        let samples = script(name).ok_or_else(|| CollaboratorError::Rejected {
            collaborator: "activity source",
            detail: format!("unknown profile '{name}', expected one of {}", PROFILES.join(", ")),
        })?;
        Ok(Self::scripted(samples))
    }

    pub fn scripted(samples: Vec<ActivitySample>) -> Self {
        Self {
            samples,
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ActivitySource for SimulatedActivitySource {
    async fn sample(&self) -> Result<ActivitySample, CollaboratorError> {
        if self.samples.is_empty() {
            return Err(CollaboratorError::unavailable("activity source", "no samples scripted"));
        }
        let i = self.cursor.fetch_add(1, Ordering::SeqCst) % self.samples.len();
        Ok(self.samples[i].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_profile_exists() {
        for name in PROFILES {
            assert!(SimulatedActivitySource::profile(name).is_ok(), "{name}");
        }
        assert!(SimulatedActivitySource::profile("marathon").is_err());
    }

    #[tokio::test]
    async fn replays_in_a_loop() {
        let source = SimulatedActivitySource::profile("tired").unwrap();
        let mut apps = Vec::new();
        for _ in 0..4 {
            apps.push(source.sample().await.unwrap().active_app);
        }
        assert_eq!(apps, ["docs", "docs", "mail", "docs"]);
    }

    #[tokio::test]
    async fn empty_script_is_unavailable() {
        let source = SimulatedActivitySource::scripted(Vec::new());
        assert!(source.sample().await.is_err());
    }
}
