use crate::domain::buttons::ButtonSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol neutral value for a 12-bit stick axis.
pub const STICK_NEUTRAL: u16 = 1998;

/// Opaque transport identifier of one connected controller half
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One raw 12-bit stick reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisPair {
    pub x: u16,
    pub y: u16,
}

impl AxisPair {
    pub const NEUTRAL: AxisPair = AxisPair {
        x: STICK_NEUTRAL,
        y: STICK_NEUTRAL,
    };

    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }

    /// True when either axis is further than `tolerance` from neutral
    pub fn deviates(&self, tolerance: u16) -> bool {
        self.x.abs_diff(STICK_NEUTRAL) > tolerance || self.y.abs_diff(STICK_NEUTRAL) > tolerance
    }
}

impl Default for AxisPair {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// Both stick slots of a single report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StickRaw {
    pub left: AxisPair,
    pub right: AxisPair,
}

/// Latest known state of one endpoint.
///
/// The two `*_slot_unused` flags are sticky: once a report shows the
/// sentinel in a slot, the flag stays set until the endpoint is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointState {
    pub buttons: ButtonSet,
    pub sticks: StickRaw,
    pub left_slot_is_unused: bool,
    pub right_slot_is_unused: bool,
    pub reports_seen: u64,
}

impl EndpointState {
    /// Fold a freshly decoded report into the stored state
    pub fn absorb(&mut self, report: &InputReport) {
        self.buttons = report.buttons;
        self.sticks = report.sticks;
        self.left_slot_is_unused = self.left_slot_is_unused || report.left_slot_unused;
        self.right_slot_is_unused = self.right_slot_is_unused || report.right_slot_unused;
        self.reports_seen = self.reports_seen.saturating_add(1);
    }
}

/// Decoder output for a single input report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputReport {
    pub buttons: ButtonSet,
    pub sticks: StickRaw,
    pub left_slot_unused: bool,
    pub right_slot_unused: bool,
}

/// Physical half of the controller pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// Logical role of an endpoint in the fused controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Left,
    Right,
    /// The only connected endpoint; serves both logical axis slots
    Solo,
}

impl From<Side> for Role {
    fn from(side: Side) -> Self {
        match side {
            Side::Left => Role::Left,
            Side::Right => Role::Right,
        }
    }
}

/// Product codes reported by each half
pub const PRODUCT_CODE_LEFT: u16 = 0x2067;
pub const PRODUCT_CODE_RIGHT: u16 = 0x2066;

/// Out-of-band identity information reported by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHint {
    pub name: String,
    #[serde(default)]
    pub product_code: Option<u16>,
}

impl IdentityHint {
    pub fn new(name: impl Into<String>, product_code: Option<u16>) -> Self {
        Self {
            name: name.into(),
            product_code,
        }
    }
}

/// One combined controller snapshot in raw units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FusedState {
    pub buttons: ButtonSet,
    pub left_axis: AxisPair,
    pub right_axis: AxisPair,
    /// Physical stick behind each axis; `None` while nothing drives it
    pub left_source: Option<Side>,
    pub right_source: Option<Side>,
}

/// Normalized output pushed to the virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PadSnapshot {
    pub buttons: crate::domain::mapper::PadButtons,
    pub left_axis_x: i16,
    pub left_axis_y: i16,
    pub right_axis_x: i16,
    pub right_axis_y: i16,
    pub left_trigger: u8,
    pub right_trigger: u8,
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Output(PadSnapshot),
    RolesChanged(Vec<(EndpointId, Role)>),
    /// Role assignment fell back to discovery order
    DegradedRoles(bool),
    ConnectionStatus(ConnectionStatus),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
