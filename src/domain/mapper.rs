//! Conversion from fused raw values to the virtual pad's vocabulary

use crate::domain::buttons::{Button, ButtonSet};
use crate::domain::models::{AxisPair, FusedState, PadSnapshot, Side};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub const OUTPUT_MAX: i16 = i16::MAX;
pub const OUTPUT_MIN: i16 = -i16::MAX;
pub const TRIGGER_PRESSED: u8 = u8::MAX;

/// Factory range for one 12-bit axis. The halves are asymmetric around
/// the center, so each direction has its own span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisCalibration {
    pub center: u16,
    pub positive_half: u16,
    pub negative_half: u16,
}

impl Default for AxisCalibration {
    fn default() -> Self {
        Self {
            center: 1998,
            positive_half: 1251,
            negative_half: 1252,
        }
    }
}

impl AxisCalibration {
    /// Map a raw reading to the signed output range.
    ///
    /// Zero means the endpoint has not reported yet and maps to center.
    pub fn map(&self, raw: u16) -> i16 {
        if raw == 0 {
            return 0;
        }
        let centered = raw as i32 - self.center as i32;
        let half = if centered >= 0 {
            self.positive_half
        } else {
            self.negative_half
        };
        let half = half.max(1) as i32;
        let scaled = centered * OUTPUT_MAX as i32 / half;
        scaled.clamp(OUTPUT_MIN as i32, OUTPUT_MAX as i32) as i16
    }
}

/// Raw factory stick calibration, six 12-bit values per stick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryStickBlock {
    pub left: FactoryStick,
    pub right: FactoryStick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryStick {
    pub center: (u16, u16),
    /// Span from center to the maximum
    pub above: (u16, u16),
    /// Span from center to the minimum
    pub below: (u16, u16),
}

impl FactoryStick {
    /// Unprogrammed flash reads back as all ones
    pub fn is_programmed(&self) -> bool {
        let values = [
            self.center.0,
            self.center.1,
            self.above.0,
            self.above.1,
            self.below.0,
            self.below.1,
        ];
        values.iter().all(|v| *v != 0x0FFF && *v != 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StickCalibration {
    pub x: AxisCalibration,
    pub y: AxisCalibration,
}

impl StickCalibration {
    /// Build from a decoded factory block, or `None` if the flash is blank
    pub fn from_factory(stick: &FactoryStick) -> Option<Self> {
        if !stick.is_programmed() {
            return None;
        }
        Some(Self {
            x: AxisCalibration {
                center: stick.center.0,
                positive_half: stick.above.0,
                negative_half: stick.below.0,
            },
            y: AxisCalibration {
                center: stick.center.1,
                positive_half: stick.above.1,
                negative_half: stick.below.1,
            },
        })
    }

    pub fn map(&self, pair: AxisPair) -> (i16, i16) {
        (self.x.map(pair.x), self.y.map(pair.y))
    }
}

/// Buttons understood by the virtual pad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadButton {
    South,
    East,
    West,
    North,
    LeftShoulder,
    RightShoulder,
    Back,
    Start,
    Guide,
    Share,
    LeftThumb,
    RightThumb,
    DpadUp,
    DpadDown,
    DpadLeft,
    DpadRight,
    Paddle1,
    Paddle2,
    Paddle3,
    Paddle4,
    Misc,
}

impl PadButton {
    pub const fn flag(self) -> PadButtons {
        PadButtons::from_bits_retain(1 << (self as u32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSide {
    Left,
    Right,
}

/// Where a controller button ends up on the virtual pad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget {
    Button(PadButton),
    Trigger(TriggerSide),
}

/// Fixed button table. Face buttons map by position, not by label.
pub fn output_target(button: Button) -> OutputTarget {
    use OutputTarget::{Button as B, Trigger as T};
    match button {
        Button::A => B(PadButton::East),
        Button::B => B(PadButton::South),
        Button::X => B(PadButton::North),
        Button::Y => B(PadButton::West),
        Button::L => B(PadButton::LeftShoulder),
        Button::R => B(PadButton::RightShoulder),
        Button::Zl => T(TriggerSide::Left),
        Button::Zr => T(TriggerSide::Right),
        Button::Minus => B(PadButton::Back),
        Button::Plus => B(PadButton::Start),
        Button::Home => B(PadButton::Guide),
        Button::Capture => B(PadButton::Share),
        Button::LeftStick => B(PadButton::LeftThumb),
        Button::RightStick => B(PadButton::RightThumb),
        Button::Up => B(PadButton::DpadUp),
        Button::Down => B(PadButton::DpadDown),
        Button::Left => B(PadButton::DpadLeft),
        Button::Right => B(PadButton::DpadRight),
        Button::RightSr | Button::Gr => B(PadButton::Paddle1),
        Button::RightSl => B(PadButton::Paddle2),
        Button::LeftSr | Button::Gl => B(PadButton::Paddle3),
        Button::LeftSl => B(PadButton::Paddle4),
        Button::Chat | Button::Sync => B(PadButton::Misc),
    }
}

bitflags! {
    /// Pressed virtual pad buttons, one bit per [`PadButton`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PadButtons: u32 {
        const SOUTH = 1 << 0;
        const EAST = 1 << 1;
        const WEST = 1 << 2;
        const NORTH = 1 << 3;
        const LEFT_SHOULDER = 1 << 4;
        const RIGHT_SHOULDER = 1 << 5;
        const BACK = 1 << 6;
        const START = 1 << 7;
        const GUIDE = 1 << 8;
        const SHARE = 1 << 9;
        const LEFT_THUMB = 1 << 10;
        const RIGHT_THUMB = 1 << 11;
        const DPAD_UP = 1 << 12;
        const DPAD_DOWN = 1 << 13;
        const DPAD_LEFT = 1 << 14;
        const DPAD_RIGHT = 1 << 15;
        const PADDLE1 = 1 << 16;
        const PADDLE2 = 1 << 17;
        const PADDLE3 = 1 << 18;
        const PADDLE4 = 1 << 19;
        const MISC = 1 << 20;
    }
}

/// Calibration per physical stick. A stick keeps its own calibration
/// whichever logical axis it ends up driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputMapper {
    pub left: StickCalibration,
    pub right: StickCalibration,
}

impl OutputMapper {
    pub fn new(left: StickCalibration, right: StickCalibration) -> Self {
        Self { left, right }
    }

    /// Replace each stick's calibration with programmed factory values.
    ///
    /// Returns how many sticks were updated.
    pub fn install_factory(&mut self, block: &FactoryStickBlock) -> usize {
        let mut installed = 0;
        if let Some(left) = StickCalibration::from_factory(&block.left) {
            self.left = left;
            installed += 1;
        }
        if let Some(right) = StickCalibration::from_factory(&block.right) {
            self.right = right;
            installed += 1;
        }
        installed
    }

    pub fn calibration(&self, side: Side) -> &StickCalibration {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn map_axis(&self, pair: AxisPair, source: Option<Side>) -> (i16, i16) {
        match source {
            Some(side) => self.calibration(side).map(pair),
            None => (0, 0),
        }
    }

    pub fn map(&self, fused: &FusedState) -> PadSnapshot {
        let (left_axis_x, left_axis_y) = self.map_axis(fused.left_axis, fused.left_source);
        let (right_axis_x, right_axis_y) = self.map_axis(fused.right_axis, fused.right_source);
        let (buttons, left_trigger, right_trigger) = map_buttons(fused.buttons);

        PadSnapshot {
            buttons,
            left_axis_x,
            left_axis_y,
            right_axis_x,
            right_axis_y,
            left_trigger,
            right_trigger,
        }
    }
}

fn map_buttons(set: ButtonSet) -> (PadButtons, u8, u8) {
    let mut buttons = PadButtons::default();
    let mut left_trigger = 0;
    let mut right_trigger = 0;
    for button in set.buttons() {
        match output_target(button) {
            OutputTarget::Button(b) => buttons.insert(b.flag()),
            OutputTarget::Trigger(TriggerSide::Left) => left_trigger = TRIGGER_PRESSED,
            OutputTarget::Trigger(TriggerSide::Right) => right_trigger = TRIGGER_PRESSED,
        }
    }
    (buttons, left_trigger, right_trigger)
}
