use std::{fmt, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Seconds a state is held at minimum before a transition is considered.
const MIN_HOLD_SECS: u64 = 30;
/// Exclusive upper bound of the randomized hold threshold.
const MAX_HOLD_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Normal,
    Overloaded,
    Offline,
}

/// Which bias table drives a server's transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegimeClass {
    NormalProne,
    OverloadedProne,
    OfflineProne,
}

impl RegimeClass {
    pub fn initial_status(self) -> ServerStatus {
        match self {
            RegimeClass::NormalProne => ServerStatus::Normal,
            RegimeClass::OverloadedProne => ServerStatus::Overloaded,
            RegimeClass::OfflineProne => ServerStatus::Offline,
        }
    }

    /// Draw the state that follows a due transition evaluation.
    ///
    /// Overloaded-prone servers stay overloaded 80% of the time, offline-prone
    /// servers stay offline 90% of the time. Normal-prone servers re-roll only
    /// 10% of the time, and a re-roll lands on overloaded 30% of the time.
    pub fn next_status<R: Rng + ?Sized>(self, current: ServerStatus, rng: &mut R) -> ServerStatus {
        match self {
            RegimeClass::OverloadedProne => {
                if rng.random_bool(0.8) {
                    ServerStatus::Overloaded
                } else {
                    ServerStatus::Normal
                }
            }
            RegimeClass::OfflineProne => {
                if rng.random_bool(0.1) {
                    ServerStatus::Normal
                } else {
                    ServerStatus::Offline
                }
            }
            RegimeClass::NormalProne => {
                if !rng.random_bool(0.1) {
                    current
                } else if rng.random_bool(0.3) {
                    ServerStatus::Overloaded
                } else {
                    ServerStatus::Normal
                }
            }
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Normal => f.pad("normal"),
            ServerStatus::Overloaded => f.pad("overloaded"),
            ServerStatus::Offline => f.pad("offline"),
        }
    }
}

impl fmt::Display for RegimeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegimeClass::NormalProne => f.pad("normal-prone"),
            RegimeClass::OverloadedProne => f.pad("overloaded-prone"),
            RegimeClass::OfflineProne => f.pad("offline-prone"),
        }
    }
}

/// Mutable regime state of one simulated server, owned by its simulator task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRuntimeState {
    pub uptime: i64,
    pub status: ServerStatus,
    pub last_changed: Instant,
}

impl ServerRuntimeState {
    pub fn new(class: RegimeClass, now: Instant) -> Self {
        Self {
            uptime: 0,
            status: class.initial_status(),
            last_changed: now,
        }
    }

    /// Run one transition evaluation.
    ///
    /// A fresh threshold is drawn from `[30, 60)` seconds on every call; when
    /// the time since the last change exceeds it, the next state is drawn and
    /// `last_changed` restarts, even if the drawn state is the current one.
    /// Returns the previous state when an evaluation took place.
    pub fn evaluate<R: Rng + ?Sized>(
        &mut self,
        class: RegimeClass,
        now: Instant,
        rng: &mut R,
    ) -> Option<ServerStatus> {
        let threshold = Duration::from_secs(rng.random_range(MIN_HOLD_SECS..MAX_HOLD_SECS));
        if now.saturating_duration_since(self.last_changed) <= threshold {
            return None;
        }

        let previous = self.status;
        self.status = class.next_status(previous, rng);
        self.last_changed = now;
        Some(previous)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use rand::{RngCore, SeedableRng, rngs::StdRng};

    use super::*;

    /// Replays fixed `[0, 1)` fractions as the raw 64-bit draws behind
    /// `random_bool`.
    pub(crate) struct ScriptedRng(VecDeque<u64>);

    impl ScriptedRng {
        pub(crate) fn new(fractions: &[f64]) -> Self {
            let scale = 2.0 * (1u64 << 63) as f64;
            Self(fractions.iter().map(|f| (f * scale) as u64).collect())
        }
    }

    impl RngCore for ScriptedRng {
        fn next_u32(&mut self) -> u32 {
            (self.next_u64() >> 32) as u32
        }

        fn next_u64(&mut self) -> u64 {
            self.0.pop_front().expect("scripted rng ran out of draws")
        }

        fn fill_bytes(&mut self, dst: &mut [u8]) {
            for chunk in dst.chunks_mut(8) {
                let bytes = self.next_u64().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
    }

    #[test]
    fn overloaded_prone_table() {
        let mut rng = ScriptedRng::new(&[0.79, 0.81]);
        let class = RegimeClass::OverloadedProne;
        assert_eq!(
            class.next_status(ServerStatus::Normal, &mut rng),
            ServerStatus::Overloaded
        );
        assert_eq!(
            class.next_status(ServerStatus::Overloaded, &mut rng),
            ServerStatus::Normal
        );
    }

    #[test]
    fn offline_prone_table() {
        let mut rng = ScriptedRng::new(&[0.05, 0.5]);
        let class = RegimeClass::OfflineProne;
        assert_eq!(
            class.next_status(ServerStatus::Offline, &mut rng),
            ServerStatus::Normal
        );
        assert_eq!(
            class.next_status(ServerStatus::Normal, &mut rng),
            ServerStatus::Offline
        );
    }

    #[test]
    fn normal_prone_holds_or_rerolls() {
        let class = RegimeClass::NormalProne;

        // no re-roll keeps whatever state the server is in
        let mut rng = ScriptedRng::new(&[0.5, 0.5]);
        assert_eq!(
            class.next_status(ServerStatus::Normal, &mut rng),
            ServerStatus::Normal
        );
        assert_eq!(
            class.next_status(ServerStatus::Overloaded, &mut rng),
            ServerStatus::Overloaded
        );

        // re-roll, then the 30/70 split
        let mut rng = ScriptedRng::new(&[0.05, 0.2, 0.05, 0.9]);
        assert_eq!(
            class.next_status(ServerStatus::Normal, &mut rng),
            ServerStatus::Overloaded
        );
        assert_eq!(
            class.next_status(ServerStatus::Overloaded, &mut rng),
            ServerStatus::Normal
        );
    }

    fn stay_fraction(class: RegimeClass, stay: ServerStatus) -> f64 {
        const ROUNDS: usize = 20_000;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let stayed = (0..ROUNDS)
            .filter(|_| class.next_status(stay, &mut rng) == stay)
            .count();
        stayed as f64 / ROUNDS as f64
    }

    #[test]
    fn bias_converges() {
        let overloaded = stay_fraction(RegimeClass::OverloadedProne, ServerStatus::Overloaded);
        assert!((overloaded - 0.8).abs() < 0.02, "{overloaded}");

        let offline = stay_fraction(RegimeClass::OfflineProne, ServerStatus::Offline);
        assert!((offline - 0.9).abs() < 0.02, "{offline}");

        // 0.9 hold + 0.1 * 0.7 re-rolled back to normal
        let normal = stay_fraction(RegimeClass::NormalProne, ServerStatus::Normal);
        assert!((normal - 0.97).abs() < 0.01, "{normal}");
    }

    #[test]
    fn initial_status_follows_class() {
        let now = Instant::now();
        for (class, status) in [
            (RegimeClass::NormalProne, ServerStatus::Normal),
            (RegimeClass::OverloadedProne, ServerStatus::Overloaded),
            (RegimeClass::OfflineProne, ServerStatus::Offline),
        ] {
            let state = ServerRuntimeState::new(class, now);
            assert_eq!(state.status, status);
            assert_eq!(state.uptime, 0);
            assert_eq!(state.last_changed, now);
        }
    }

    #[test]
    fn evaluation_waits_for_threshold() {
        let mut rng = StdRng::seed_from_u64(7);
        let start = Instant::now();
        let mut state = ServerRuntimeState::new(RegimeClass::OverloadedProne, start);

        for secs in 0..=30 {
            let now = start + Duration::from_secs(secs);
            assert_eq!(state.evaluate(RegimeClass::OverloadedProne, now, &mut rng), None);
            assert_eq!(state.last_changed, start);
        }

        // any threshold in [30, 60) has been exceeded
        let due = start + Duration::from_secs(60);
        assert_eq!(
            state.evaluate(RegimeClass::OverloadedProne, due, &mut rng),
            Some(ServerStatus::Overloaded)
        );
        assert_eq!(state.last_changed, due);
    }

    #[test]
    fn threshold_is_redrawn_every_evaluation() {
        let mut rng = StdRng::seed_from_u64(11);
        let start = Instant::now();
        let at = start + Duration::from_secs(45);

        // same elapsed time every call, only the threshold draw differs
        let mut due = 0;
        let runs = 400;
        for _ in 0..runs {
            let mut state = ServerRuntimeState::new(RegimeClass::OfflineProne, start);
            if state.evaluate(RegimeClass::OfflineProne, at, &mut rng).is_some() {
                due += 1;
            }
        }

        // 45s beats the thresholds 30..=44, half of [30, 60)
        let fraction = due as f64 / runs as f64;
        assert!((0.35..0.65).contains(&fraction), "due fraction {fraction}");
    }

    #[test]
    fn serde_names() {
        assert_eq!(
            serde_json::to_string(&RegimeClass::OverloadedProne).unwrap(),
            r#""overloaded-prone""#
        );
        assert_eq!(
            serde_json::from_str::<ServerStatus>(r#""offline""#).unwrap(),
            ServerStatus::Offline
        );
        assert_eq!(RegimeClass::NormalProne.to_string(), "normal-prone");
    }
}
