//! Controller button vocabulary
//!
//! Both halves share one 32-bit button word. Each bit means the same
//! button regardless of which half reported it, so words from different
//! endpoints can simply be OR-ed together.
//!
//! ```text
//! bits  0-7 : Y  X  B  A  SR(R) SL(R) R  ZR
//! bits 8-15 : -  +  RS LS Home Capture Chat Sync
//! bits16-23 : Down Up Right Left SR(L) SL(L) L ZL
//! bits24-25 : GR GL
//! bits26-31 : reserved
//! ```

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    Y,
    X,
    B,
    A,
    RightSr,
    RightSl,
    R,
    Zr,
    Minus,
    Plus,
    RightStick,
    LeftStick,
    Home,
    Capture,
    Chat,
    Sync,
    Down,
    Up,
    Right,
    Left,
    LeftSr,
    LeftSl,
    L,
    Zl,
    Gr,
    Gl,
}

impl Button {
    /// Every defined button, in bit order
    pub const ALL: [Button; 26] = [
        Button::Y,
        Button::X,
        Button::B,
        Button::A,
        Button::RightSr,
        Button::RightSl,
        Button::R,
        Button::Zr,
        Button::Minus,
        Button::Plus,
        Button::RightStick,
        Button::LeftStick,
        Button::Home,
        Button::Capture,
        Button::Chat,
        Button::Sync,
        Button::Down,
        Button::Up,
        Button::Right,
        Button::Left,
        Button::LeftSr,
        Button::LeftSl,
        Button::L,
        Button::Zl,
        Button::Gr,
        Button::Gl,
    ];

    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub const fn flag(self) -> ButtonSet {
        ButtonSet::from_bits_retain(self.bit())
    }
}

bitflags! {
    /// Set of pressed buttons
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ButtonSet: u32 {
        const Y = 1 << 0;
        const X = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const RIGHT_SR = 1 << 4;
        const RIGHT_SL = 1 << 5;
        const R = 1 << 6;
        const ZR = 1 << 7;
        const MINUS = 1 << 8;
        const PLUS = 1 << 9;
        const RIGHT_STICK = 1 << 10;
        const LEFT_STICK = 1 << 11;
        const HOME = 1 << 12;
        const CAPTURE = 1 << 13;
        const CHAT = 1 << 14;
        const SYNC = 1 << 15;
        const DOWN = 1 << 16;
        const UP = 1 << 17;
        const RIGHT = 1 << 18;
        const LEFT = 1 << 19;
        const LEFT_SR = 1 << 20;
        const LEFT_SL = 1 << 21;
        const L = 1 << 22;
        const ZL = 1 << 23;
        const GR = 1 << 24;
        const GL = 1 << 25;
    }
}

impl ButtonSet {
    pub fn is_pressed(self, button: Button) -> bool {
        self.contains(button.flag())
    }

    /// Pressed buttons in bit order
    pub fn buttons(self) -> impl Iterator<Item = Button> {
        Button::ALL.into_iter().filter(move |b| self.is_pressed(*b))
    }
}

impl From<Button> for ButtonSet {
    fn from(button: Button) -> Self {
        button.flag()
    }
}

impl FromIterator<Button> for ButtonSet {
    fn from_iter<I: IntoIterator<Item = Button>>(iter: I) -> Self {
        iter.into_iter().map(Button::flag).collect()
    }
}
