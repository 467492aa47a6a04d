use serde::Serialize;

use crate::models::mode::{OperationMode, Row16Mode};
use crate::models::wedge::WedgePosition;

/// Last observed or commanded state of the physical machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachineState {
    pub working: bool,
    pub air: bool,
    pub water: bool,
    pub motor: bool,
    pub pump: bool,
    pub wedge_0005: WedgePosition,
    pub wedge_0075: WedgePosition,
}

/// Snapshot of one interface, as served to API clients.
/// The testing mode is reported as a `null` operation mode on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct StateReport {
    pub working: bool,
    pub air: bool,
    pub water: bool,
    pub motor: bool,
    pub pump: bool,
    pub sensor: bool,
    pub wedge_0005: u8,
    pub wedge_0075: u8,
    pub signals: Vec<String>,
    pub operation_mode: Option<OperationMode>,
    pub row16_mode: Option<Row16Mode>,
    pub speed_rpm: f64,
    pub output_driver: String,
}
