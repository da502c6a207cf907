//! Logical key press and release reporting on top of the keyboard grab.

use crate::{
    error::Result,
    handler::{KeyboardHandler, Listener, ListenerId},
    keycodes,
    transport::{Capability, KeyState, Modifiers, Transport},
};
use log::trace;
use parking_lot::Mutex;
use std::{collections::HashSet, sync::Arc};

/// Modifier bits that do not prevent key presses from being reported.
const NUM_LOCK_MASK: u32 = 0x10;

pub type KeyCallback = Arc<dyn Fn(&'static str) + Send + Sync>;

struct Inner {
    suppressed: HashSet<String>,
    mod_state: u32,
    key_down: KeyCallback,
    key_up: KeyCallback,
}

/// Reports presses and releases of the keys named in [`keycodes`], and keeps a chosen
/// set of them from reaching applications.
///
/// Presses made while a modifier other than Num Lock is held are neither reported nor
/// suppressed, so shortcuts keep working.
pub struct KeyboardCapture<T: Transport> {
    handler: Arc<KeyboardHandler<T>>,
    inner: Arc<Mutex<Inner>>,
    listeners: Option<[ListenerId; 2]>,
}

impl<T: Transport> KeyboardCapture<T> {
    pub fn new(handler: Arc<KeyboardHandler<T>>) -> KeyboardCapture<T> {
        let inner = Inner {
            suppressed: HashSet::new(),
            mod_state: 0,
            key_down: Arc::new(|_| {}),
            key_up: Arc::new(|_| {}),
        };
        KeyboardCapture {
            handler,
            inner: Arc::new(Mutex::new(inner)),
            listeners: None,
        }
    }

    pub fn on_key_down(&self, f: impl Fn(&'static str) + Send + Sync + 'static) {
        self.inner.lock().key_down = Arc::new(f);
    }

    pub fn on_key_up(&self, f: impl Fn(&'static str) + Send + Sync + 'static) {
        self.inner.lock().key_up = Arc::new(f);
    }

    pub fn is_started(&self) -> bool {
        self.listeners.is_some()
    }

    /// Grabs the keyboard, connecting to the compositor if needed.
    pub fn start(&mut self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }
        let guard = self.handler.lock();
        let on_key = {
            let inner = Arc::clone(&self.inner);
            Listener::key(move |_, keycode, state| on_key(&inner, keycode, state))
        };
        let on_modifiers = {
            let inner = Arc::clone(&self.inner);
            Listener::modifiers(move |modifiers| on_modifiers(&inner, modifiers))
        };
        let listeners = [guard.add_listener(on_key), guard.add_listener(on_modifiers)];
        if let Err(err) = guard.activate(Capability::Capture) {
            for id in listeners {
                guard.remove_listener(id);
            }
            return Err(err);
        }
        self.listeners = Some(listeners);
        Ok(())
    }

    /// Releases the grab. Does nothing unless started.
    pub fn cancel(&mut self) {
        let Some(listeners) = self.listeners.take() else {
            return;
        };
        let guard = self.handler.lock();
        guard.deactivate(Capability::Capture);
        for id in listeners {
            guard.remove_listener(id);
        }
    }

    /// Replaces the set of keys kept from applications.
    pub fn suppress_keyboard<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.lock().suppressed = keys.into_iter().map(Into::into).collect();
    }
}

impl<T: Transport> Drop for KeyboardCapture<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn on_key(inner: &Mutex<Inner>, keycode: u32, state: KeyState) -> bool {
    let Some(key) = keycodes::wire_key_name(keycode) else {
        return false;
    };
    let (callback, suppressed) = {
        let inner = inner.lock();
        let suppressed = inner.suppressed.contains(key);
        match state {
            KeyState::Pressed if inner.mod_state != 0 => {
                trace!("ignoring {key} pressed with modifiers {:#x}", inner.mod_state);
                return false;
            }
            KeyState::Pressed => (Arc::clone(&inner.key_down), suppressed),
            KeyState::Released => (Arc::clone(&inner.key_up), suppressed),
        }
    };
    callback(key);
    suppressed
}

fn on_modifiers(inner: &Mutex<Inner>, modifiers: Modifiers) -> bool {
    inner.lock().mod_state =
        (modifiers.depressed | modifiers.latched | modifiers.locked) & !NUM_LOCK_MASK;
    false
}
