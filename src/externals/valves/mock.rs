//! Recording valve bank for the test suite. Every actuation is logged
//! with a timestamp so cycle tests can assert ordering against the
//! sensor timeline.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use super::{ValveBank, ValveBankError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValveCommand {
    On(BTreeSet<String>),
    Off,
}

pub type ValveLog = Arc<Mutex<Vec<(Instant, ValveCommand)>>>;

pub struct MockValveBank {
    log: ValveLog,
}

impl MockValveBank {
    pub fn new() -> (Self, ValveLog) {
        let log: ValveLog = Arc::new(Mutex::new(Vec::new()));
        (Self { log: Arc::clone(&log) }, log)
    }
}

impl ValveBank for MockValveBank {
    fn name(&self) -> &str {
        "mock"
    }

    fn valves_on(&mut self, signals: &HashSet<String>) -> Result<(), ValveBankError> {
        let combination: BTreeSet<String> = signals.iter().cloned().collect();
        self.log.lock().unwrap().push((Instant::now(), ValveCommand::On(combination)));
        Ok(())
    }

    fn valves_off(&mut self) -> Result<(), ValveBankError> {
        self.log.lock().unwrap().push((Instant::now(), ValveCommand::Off));
        Ok(())
    }
}
