//! The boundary between the keyboard handler and the compositor protocol.
//!
//! A [`Transport`] opens [`Connection`]s. A connection owns the bound globals and hands
//! out typed protocol objects; requests are methods on the connection taking those
//! objects, and incoming events are returned as plain [`Event`] values by
//! [`Connection::roundtrip`] and [`Connection::dispatch_pending`].

use crate::error::Result;
use bitflags::bitflags;
use std::{fmt, os::fd::BorrowedFd};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Capture,
    Emulate,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Capture => "capture",
            Capability::Emulate => "emulate",
        })
    }
}

bitflags! {
    /// Globals a connection managed to bind.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Interfaces: u8 {
        const SEAT = 1 << 0;
        const INPUT_METHOD = 1 << 1;
        const VIRTUAL_KEYBOARD = 1 << 2;
    }
}

impl Interfaces {
    pub(crate) fn required_by(capability: Capability) -> Interfaces {
        match capability {
            Capability::Capture => {
                Interfaces::SEAT | Interfaces::INPUT_METHOD | Interfaces::VIRTUAL_KEYBOARD
            }
            Capability::Emulate => Interfaces::SEAT | Interfaces::VIRTUAL_KEYBOARD,
        }
    }

    pub fn protocol_name(self) -> &'static str {
        match self {
            Interfaces::SEAT => "wl_seat",
            Interfaces::INPUT_METHOD => "zwp_input_method_manager_v2",
            Interfaces::VIRTUAL_KEYBOARD => "zwp_virtual_keyboard_manager_v1",
            _ => "<multiple interfaces>",
        }
    }
}

impl fmt::Display for Interfaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, interface) in self.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "'{}'", interface.protocol_name())?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyState {
    Released,
    Pressed,
}

impl KeyState {
    pub fn is_pressed(self) -> bool {
        self == KeyState::Pressed
    }
}

impl From<bool> for KeyState {
    fn from(pressed: bool) -> KeyState {
        if pressed {
            KeyState::Pressed
        } else {
            KeyState::Released
        }
    }
}

impl From<KeyState> for u32 {
    fn from(state: KeyState) -> u32 {
        match state {
            KeyState::Released => 0,
            KeyState::Pressed => 1,
        }
    }
}

/// Serialized modifier state, as carried by `modifiers` events and requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Modifiers {
    pub depressed: u32,
    pub latched: u32,
    pub locked: u32,
    pub group: u32,
}

impl Modifiers {
    pub fn depressed(mask: u32) -> Modifiers {
        Modifiers {
            depressed: mask,
            ..Modifiers::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A new XKB v1 keymap for the seat keyboard.
    Keymap(Vec<u8>),
    /// A key event delivered to the exclusive keyboard grab.
    GrabKey {
        time: u32,
        keycode: u32,
        state: KeyState,
    },
    /// A modifier change delivered to the exclusive keyboard grab.
    GrabModifiers(Modifiers),
}

pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Connects to the compositor and binds every known global it advertises.
    fn connect(&self) -> Result<Self::Connection>;
}

pub trait Connection: Send + 'static {
    type Keyboard: Send;
    type VirtualKeyboard: Send;
    type InputMethod: Send;
    type KeyboardGrab: Send;

    /// The file descriptor that becomes readable when events arrive.
    fn poll_fd(&self) -> BorrowedFd<'_>;

    fn interfaces(&self) -> Interfaces;

    /// Flushes requests, waits for the compositor to process them and returns the events
    /// received meanwhile.
    fn roundtrip(&mut self) -> Result<Vec<Event>>;

    /// Reads whatever is available on the socket without blocking and returns the
    /// resulting events.
    fn dispatch_pending(&mut self) -> Result<Vec<Event>>;

    fn flush(&mut self) -> Result<()>;

    fn get_keyboard(&mut self) -> Result<Self::Keyboard>;

    fn release_keyboard(&mut self, keyboard: Self::Keyboard);

    fn create_virtual_keyboard(&mut self) -> Result<Self::VirtualKeyboard>;

    fn destroy_virtual_keyboard(&mut self, keyboard: Self::VirtualKeyboard);

    fn get_input_method(&mut self) -> Result<Self::InputMethod>;

    fn destroy_input_method(&mut self, input_method: Self::InputMethod);

    fn grab_keyboard(&mut self, input_method: &Self::InputMethod) -> Result<Self::KeyboardGrab>;

    fn release_grab(&mut self, grab: Self::KeyboardGrab);

    fn keymap(&mut self, keyboard: &Self::VirtualKeyboard, keymap: &[u8]) -> Result<()>;

    fn key(&mut self, keyboard: &Self::VirtualKeyboard, time: u32, keycode: u32, state: KeyState);

    fn modifiers(&mut self, keyboard: &Self::VirtualKeyboard, modifiers: Modifiers);

    /// Releases every bound global. The connection itself is closed when dropped.
    fn release_interfaces(&mut self);
}
