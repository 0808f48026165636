use parking_lot::RwLock;
use std::{sync::Arc, time::Instant};

use sonar_core::CycleOutcome;

/// Latest sensor status, shared between the sensor thread and async tasks.
#[derive(Clone, Debug)]
pub struct State {
    pub last_distance_mm: Option<f64>,
    pub last_echo_ts: Instant,
    pub cycles: u64,
    pub missed: u64,
    pub faults: Vec<String>,
}

impl Default for State {
    fn default() -> Self {
        State {
            last_distance_mm: None,
            last_echo_ts: Instant::now(),
            cycles: 0,
            missed: 0,
            faults: Vec::new(),
        }
    }
}

pub type Blackboard = Arc<RwLock<State>>;

pub fn snapshot(bb: &Blackboard) -> State {
    (*bb.read()).clone()
}

/// Folds one cycle outcome into the board. A missed echo keeps the last
/// distance but does not refresh its timestamp.
pub fn record(bb: &Blackboard, outcome: &CycleOutcome) {
    let mut g = bb.write();
    g.cycles += 1;
    match outcome {
        CycleOutcome::Measured(m) => {
            g.last_distance_mm = Some(m.millimetres());
            g.last_echo_ts = Instant::now();
        }
        CycleOutcome::Missed => g.missed += 1,
    }
}

pub fn raise_fault(bb: &Blackboard, msg: &str) {
    let mut g = bb.write();
    if !g.faults.iter().any(|s| s == msg) {
        g.faults.push(msg.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonar_core::{Measurement, Timespec};

    #[test]
    fn test_record_outcomes() {
        let bb: Blackboard = Arc::default();
        let before = snapshot(&bb).last_echo_ts;

        record(&bb, &CycleOutcome::Measured(Measurement::from_round_trip(Timespec::from_nanos(5_830_903))));
        record(&bb, &CycleOutcome::Missed);

        let state = snapshot(&bb);
        assert_eq!(state.cycles, 2);
        assert_eq!(state.missed, 1);
        assert!((state.last_distance_mm.unwrap() - 1000.0).abs() < 1e-3);
        assert!(state.last_echo_ts >= before);
    }

    #[test]
    fn test_faults_deduplicated() {
        let bb: Blackboard = Arc::default();
        raise_fault(&bb, "echo stale");
        raise_fault(&bb, "echo stale");
        raise_fault(&bb, "line 24 I/O");
        assert_eq!(snapshot(&bb).faults, vec!["echo stale".to_string(), "line 24 I/O".to_string()]);
    }
}
