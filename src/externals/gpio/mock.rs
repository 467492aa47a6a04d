//! In-memory GPIO double for the hardware-free test suite. Tests drive
//! input levels (which fires the chained callbacks like the interrupt
//! thread would) and latch emergency-stop edges directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Edge, EdgeCallback, GpioError, GpioService, Pull};

#[derive(Default)]
struct MockInner {
    outputs: HashMap<u8, bool>,
    inputs: HashMap<u8, bool>,
    latch_edges: HashMap<u8, Edge>,
    pending: HashSet<u8>,
    writes: Vec<(u8, bool)>,
}

#[derive(Default)]
pub struct MockGpio {
    inner: Mutex<MockInner>,
    callbacks: Mutex<HashMap<u8, Arc<Mutex<Vec<(Edge, EdgeCallback)>>>>>,
}

impl MockGpio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drive an input line to a new level, firing matching callbacks and
    /// latches exactly like a physical edge would.
    pub fn set_input(&self, line: u8, level: bool) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            let previous = inner.inputs.insert(line, level).unwrap_or(false);
            if previous == level {
                return;
            }
            if let Some(edge) = inner.latch_edges.get(&line) {
                if edge.matches(level) {
                    inner.pending.insert(line);
                }
            }
            self.callbacks.lock().unwrap().get(&line).cloned()
        };
        if let Some(callbacks) = callbacks {
            let mut callbacks = callbacks.lock().unwrap();
            for (edge, callback) in callbacks.iter_mut() {
                if edge.matches(level) {
                    callback(level);
                }
            }
        }
    }

    /// Latch a pending edge without moving the line level, the way a short
    /// emergency-stop pulse would.
    pub fn latch(&self, line: u8) {
        self.inner.lock().unwrap().pending.insert(line);
    }

    pub fn output(&self, line: u8) -> bool {
        self.inner.lock().unwrap().outputs.get(&line).copied().unwrap_or(false)
    }

    pub fn write_history(&self) -> Vec<(u8, bool)> {
        self.inner.lock().unwrap().writes.clone()
    }
}

impl GpioService for MockGpio {
    fn configure_output(&self, line: u8) -> Result<(), GpioError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.inputs.contains_key(&line) {
            return Err(GpioError::NotAnOutput(line));
        }
        inner.outputs.entry(line).or_insert(false);
        Ok(())
    }

    fn configure_input(&self, line: u8, _pull: Pull) -> Result<(), GpioError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.outputs.contains_key(&line) {
            return Err(GpioError::NotAnInput(line));
        }
        inner.inputs.entry(line).or_insert(false);
        Ok(())
    }

    fn read(&self, line: u8) -> Result<bool, GpioError> {
        let inner = self.inner.lock().unwrap();
        inner
            .outputs
            .get(&line)
            .or_else(|| inner.inputs.get(&line))
            .copied()
            .ok_or(GpioError::NotConfigured(line))
    }

    fn write(&self, line: u8, level: bool) -> Result<(), GpioError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.outputs.contains_key(&line) {
            return Err(GpioError::NotAnOutput(line));
        }
        inner.outputs.insert(line, level);
        inner.writes.push((line, level));
        Ok(())
    }

    fn add_edge_callback(
        &self,
        line: u8,
        edge: Edge,
        _debounce: Duration,
        callback: EdgeCallback,
    ) -> Result<(), GpioError> {
        if !self.inner.lock().unwrap().inputs.contains_key(&line) {
            return Err(GpioError::NotConfigured(line));
        }
        self.callbacks
            .lock()
            .unwrap()
            .entry(line)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .lock()
            .unwrap()
            .push((edge, callback));
        Ok(())
    }

    fn enable_edge_latch(
        &self,
        line: u8,
        edge: Edge,
        _debounce: Duration,
    ) -> Result<(), GpioError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.inputs.contains_key(&line) {
            return Err(GpioError::NotConfigured(line));
        }
        inner.latch_edges.insert(line, edge);
        Ok(())
    }

    fn event_detected(&self, line: u8) -> bool {
        self.inner.lock().unwrap().pending.remove(&line)
    }

    fn cleanup(&self) {
        let mut inner = self.inner.lock().unwrap();
        for level in inner.outputs.values_mut() {
            *level = false;
        }
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_latched_edge_is_consumed_once() {
        let gpio = MockGpio::new();
        gpio.configure_input(22, Pull::None).unwrap();
        gpio.enable_edge_latch(22, Edge::Falling, Duration::from_millis(25)).unwrap();
        gpio.set_input(22, true);
        assert!(!gpio.event_detected(22));
        gpio.set_input(22, false);
        assert!(gpio.event_detected(22));
        assert!(!gpio.event_detected(22));
    }

    #[test]
    fn test_chained_callbacks_filter_by_edge() {
        let gpio = MockGpio::new();
        gpio.configure_input(17, Pull::None).unwrap();
        let rising = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));
        let rising_clone = Arc::clone(&rising);
        let any_clone = Arc::clone(&any);
        gpio.add_edge_callback(
            17,
            Edge::Rising,
            Duration::ZERO,
            Box::new(move |_| {
                rising_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        gpio.add_edge_callback(
            17,
            Edge::Both,
            Duration::ZERO,
            Box::new(move |_| {
                any_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        gpio.set_input(17, true);
        gpio.set_input(17, false);
        assert_eq!(rising.load(Ordering::SeqCst), 1);
        assert_eq!(any.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_direction_conflicts_are_rejected() {
        let gpio = MockGpio::new();
        gpio.configure_output(25).unwrap();
        assert!(gpio.configure_input(25, Pull::Up).is_err());
        assert!(matches!(gpio.read(3), Err(GpioError::NotConfigured(3))));
    }
}
