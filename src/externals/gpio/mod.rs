//! GPIO access behind a service trait, so the interface logic and the
//! daemon supervisor never talk to the hardware library directly and tests
//! can run against an in-memory double.

use std::time::Duration;

use thiserror::Error;

pub mod services;

#[cfg(test)]
pub mod mock;

pub use services::RppalGpioService;

/// Which transitions of a line an observer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    pub fn matches(self, rising: bool) -> bool {
        match self {
            Edge::Rising => rising,
            Edge::Falling => !rising,
            Edge::Both => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Up,
    None,
}

/// Invoked from the GPIO library's own thread with the new line level.
pub type EdgeCallback = Box<dyn FnMut(bool) + Send + 'static>;

#[derive(Error, Debug)]
pub enum GpioError {
    #[error("gpio line {0} is not configured")]
    NotConfigured(u8),
    #[error("gpio line {0} is not an input")]
    NotAnInput(u8),
    #[error("gpio line {0} is not an output")]
    NotAnOutput(u8),
    #[error("gpio backend error: {0}")]
    Backend(String),
}

/// Digital line access with edge detection.
///
/// The platform allows at most one edge detector per line, so the service
/// owns the detector and chains any number of callbacks onto it; callers
/// always add a callback, never install a detector. Latched edges are
/// consumed by `event_detected`, which reports any one physical edge at
/// most once.
pub trait GpioService: Send + Sync {
    fn configure_output(&self, line: u8) -> Result<(), GpioError>;
    fn configure_input(&self, line: u8, pull: Pull) -> Result<(), GpioError>;
    fn read(&self, line: u8) -> Result<bool, GpioError>;
    fn write(&self, line: u8, level: bool) -> Result<(), GpioError>;
    fn add_edge_callback(
        &self,
        line: u8,
        edge: Edge,
        debounce: Duration,
        callback: EdgeCallback,
    ) -> Result<(), GpioError>;
    fn enable_edge_latch(&self, line: u8, edge: Edge, debounce: Duration)
        -> Result<(), GpioError>;
    fn event_detected(&self, line: u8) -> bool;
    /// De-energize every configured output and drop all registrations.
    fn cleanup(&self);
}
