//! Keyboard capture and emulation for Wayland compositors supporting the
//! `zwp_input_method_v2` and `zwp_virtual_keyboard_v1` protocols.
//!
//! Both sides share one [`KeyboardHandler`]:
//!
//! - [`KeyboardCapture`] grabs the keyboard, reports presses and releases by logical key
//!   name and keeps selected keys from reaching applications.
//! - [`KeyboardEmulation`] types arbitrary text with a generated keymap, independently of
//!   the host layout, and replays key combinations using the host layout.

#![allow(clippy::single_match)]

mod capture;
mod combo;
mod dispatch;
mod emulation;
mod error;
mod handler;
pub mod keycodes;
#[cfg(test)]
mod mock;
mod output;
mod transport;
mod wayland;

pub use crate::{
    capture::{KeyCallback, KeyboardCapture},
    combo::{Combo, ComboTable, KeyCombo, KeyStep},
    emulation::KeyboardEmulation,
    error::{BoxError, Error, Result},
    handler::{
        KeyListener, KeyboardGuard, KeyboardHandler, Listener, ListenerId, ModifiersListener,
        RefCounts,
    },
    output::{OutputLayout, BACKSPACE_KEYCODE, KEYMAP_TAG},
    transport::{Capability, Connection, Event, Interfaces, KeyState, Modifiers, Transport},
    wayland::{WaylandConnection, WaylandTransport},
};
