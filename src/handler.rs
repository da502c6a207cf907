//! The compositor connection shared by keyboard capture and emulation.
//!
//! A [`KeyboardHandler`] connects lazily: the connection, the seat keyboard, the replay
//! keyboard and the dispatch thread exist while at least one [`Capability`] is active.
//! Capture additionally owns an input method and its keyboard grab; emulation owns an
//! output virtual keyboard and the [`OutputLayout`] it types with.
//!
//! Grabbed events are offered to the registered listeners and replayed unchanged through
//! the replay keyboard unless a listener suppresses them.

use crate::{
    combo::{Combo, ComboTable, KeyCombo},
    dispatch::DispatchThread,
    error::{Error, Result},
    output::{self, OutputLayout, BACKSPACE_KEYCODE},
    transport::{Capability, Connection, Event, Interfaces, KeyState, Modifiers, Transport},
};
use handy::typed::{TypedHandle, TypedHandleMap};
use log::{debug, error, trace, warn};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::{
    cell::{RefCell, RefMut},
    mem,
    sync::Arc,
    time::Instant,
};

/// Called with `(time, keycode, state)` for every grabbed key; returns whether to suppress it.
pub type KeyListener = Arc<dyn Fn(u32, u32, KeyState) -> bool + Send + Sync>;

/// Called for every grabbed modifier change; returns whether to suppress it.
pub type ModifiersListener = Arc<dyn Fn(Modifiers) -> bool + Send + Sync>;

pub enum Listener {
    Key(KeyListener),
    Modifiers(ModifiersListener),
}

impl Listener {
    pub fn key(f: impl Fn(u32, u32, KeyState) -> bool + Send + Sync + 'static) -> Listener {
        Listener::Key(Arc::new(f))
    }

    pub fn modifiers(f: impl Fn(Modifiers) -> bool + Send + Sync + 'static) -> Listener {
        Listener::Modifiers(Arc::new(f))
    }
}

pub enum ListenerId {
    Key(TypedHandle<KeyListener>),
    Modifiers(TypedHandle<ModifiersListener>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefCounts {
    pub capture: usize,
    pub emulate: usize,
}

impl RefCounts {
    pub fn get(&self, capability: Capability) -> usize {
        match capability {
            Capability::Capture => self.capture,
            Capability::Emulate => self.emulate,
        }
    }

    fn get_mut(&mut self, capability: Capability) -> &mut usize {
        match capability {
            Capability::Capture => &mut self.capture,
            Capability::Emulate => &mut self.emulate,
        }
    }

    pub fn total(&self) -> usize {
        self.capture + self.emulate
    }
}

struct Base<C: Connection> {
    conn: C,
    generation: u64,
    interfaces: Interfaces,
    keyboard: C::Keyboard,
    replay_keyboard: C::VirtualKeyboard,
    replay_layout: Option<ComboTable>,
    keymap: Option<Vec<u8>>,
    dispatch: Option<DispatchThread>,
    alive: bool,
    epoch: Instant,
}

impl<C: Connection> Base<C> {
    fn check_alive(&self) -> Result<()> {
        if self.alive {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    /// Milliseconds since the connection was established.
    fn timestamp(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

struct Capture<C: Connection> {
    input_method: C::InputMethod,
    grab: C::KeyboardGrab,
}

struct Emulate<C: Connection> {
    keyboard: C::VirtualKeyboard,
    layout: OutputLayout,
}

pub(crate) struct State<C: Connection> {
    counts: RefCounts,
    generation: u64,
    base: Option<Base<C>>,
    capture: Option<Capture<C>>,
    emulate: Option<Emulate<C>>,
    key_listeners: TypedHandleMap<KeyListener>,
    modifiers_listeners: TypedHandleMap<ModifiersListener>,
}

pub(crate) type StateCell<C> = RefCell<State<C>>;

pub(crate) struct Shared<C: Connection> {
    pub(crate) state: ReentrantMutex<StateCell<C>>,
}

pub struct KeyboardHandler<T: Transport> {
    transport: T,
    shared: Arc<Shared<T::Connection>>,
}

impl<T: Transport> KeyboardHandler<T> {
    pub fn new(transport: T) -> KeyboardHandler<T> {
        let state = State {
            counts: RefCounts::default(),
            generation: 0,
            base: None,
            capture: None,
            emulate: None,
            key_listeners: TypedHandleMap::new(),
            modifiers_listeners: TypedHandleMap::new(),
        };
        KeyboardHandler {
            transport,
            shared: Arc::new(Shared {
                state: ReentrantMutex::new(RefCell::new(state)),
            }),
        }
    }

    /// Locks the handler. The lock is re-entrant; pending requests are flushed whenever a
    /// guard is released.
    pub fn lock(&self) -> KeyboardGuard<'_, T> {
        KeyboardGuard {
            handler: self,
            cell: self.shared.state.lock(),
        }
    }
}

#[cfg(test)]
impl<T: Transport> KeyboardHandler<T> {
    /// Does what the dispatch thread does when the connection becomes readable.
    pub(crate) fn dispatch_now(&self) -> bool {
        let guard = self.lock();
        let generation = guard.cell.borrow().base.as_ref().map(|base| base.generation);
        generation.is_some_and(|generation| process_events(&guard.cell, generation))
    }
}

impl<T: Transport> Drop for KeyboardHandler<T> {
    fn drop(&mut self) {
        self.lock().shutdown();
    }
}

pub struct KeyboardGuard<'a, T: Transport> {
    handler: &'a KeyboardHandler<T>,
    cell: ReentrantMutexGuard<'a, StateCell<T::Connection>>,
}

fn check_interfaces(capability: Capability, interfaces: Interfaces) -> Result<()> {
    let missing = Interfaces::required_by(capability) - interfaces;
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::MissingInterfaces {
            capability,
            missing,
        })
    }
}

impl<T: Transport> KeyboardGuard<'_, T> {
    fn state(&self) -> RefMut<'_, State<T::Connection>> {
        self.cell.borrow_mut()
    }

    pub fn counts(&self) -> RefCounts {
        self.cell.borrow().counts
    }

    pub fn is_active(&self, capability: Capability) -> bool {
        self.counts().get(capability) > 0
    }

    pub fn is_connected(&self) -> bool {
        self.cell.borrow().base.is_some()
    }

    pub fn activate(&self, capability: Capability) -> Result<()> {
        let (count, total) = {
            let mut state = self.state();
            *state.counts.get_mut(capability) += 1;
            (state.counts.get(capability), state.counts.total())
        };
        debug!("activating keyboard {capability} ({count})");
        let result = self.try_activate(capability, count == 1, total == 1);
        if let Err(err) = &result {
            debug!("cannot activate keyboard {capability}: {err}");
            self.deactivate(capability);
        }
        result
    }

    fn try_activate(&self, capability: Capability, setup: bool, connect: bool) -> Result<()> {
        if connect {
            self.setup_base(capability)?;
        } else {
            match &self.cell.borrow().base {
                Some(base) => base.check_alive()?,
                None => return Err(Error::Disconnected),
            }
        }
        if !setup {
            return Ok(());
        }
        match capability {
            Capability::Capture => self.setup_capture(),
            Capability::Emulate => self.setup_emulate(),
        }
    }

    /// Drops one reference to `capability`.
    ///
    /// # Panics
    ///
    /// Panics if the capability is not active.
    pub fn deactivate(&self, capability: Capability) {
        let (count, total) = {
            let mut state = self.state();
            let count = {
                let count = state.counts.get_mut(capability);
                assert!(
                    *count > 0,
                    "keyboard {capability} deactivated more often than activated"
                );
                *count -= 1;
                *count
            };
            (count, state.counts.total())
        };
        debug!("deactivating keyboard {capability} ({count})");
        if count == 0 {
            match capability {
                Capability::Capture => self.teardown_capture(),
                Capability::Emulate => self.teardown_emulate(),
            }
        }
        if total == 0 {
            self.teardown_base();
        }
    }

    fn shutdown(&self) {
        let counts = mem::take(&mut self.state().counts);
        if counts.total() == 0 {
            return;
        }
        debug!("dropping keyboard handler while active: {counts:?}");
        self.teardown_capture();
        self.teardown_emulate();
        self.teardown_base();
    }

    fn setup_base(&self, capability: Capability) -> Result<()> {
        debug!("connecting to the compositor");
        let mut conn = self.handler.transport.connect()?;
        let interfaces = conn.interfaces();
        debug!("bound interfaces: {interfaces}");
        check_interfaces(capability, interfaces)?;
        let replay_keyboard = conn.create_virtual_keyboard()?;
        let keyboard = conn.get_keyboard()?;
        let events = conn.roundtrip()?;
        let generation = {
            let mut state = self.state();
            state.generation += 1;
            let generation = state.generation;
            state.base = Some(Base {
                conn,
                generation,
                interfaces,
                keyboard,
                replay_keyboard,
                replay_layout: None,
                keymap: None,
                dispatch: None,
                alive: true,
                epoch: Instant::now(),
            });
            generation
        };
        handle_events(&self.cell, generation, events)?;

        let connection_fd = match &self.cell.borrow().base {
            Some(base) => rustix::io::dup(base.conn.poll_fd())?,
            None => return Err(Error::Disconnected),
        };
        let dispatch =
            DispatchThread::spawn(Arc::clone(&self.handler.shared), generation, connection_fd)?;
        let mut state = self.state();
        if let Some(base) = state.base.as_mut() {
            base.dispatch = Some(dispatch);
            return Ok(());
        }
        drop(state);
        dispatch.stop();
        Err(Error::Disconnected)
    }

    fn teardown_base(&self) {
        let Some(base) = self.state().base.take() else {
            return;
        };
        debug!("disconnecting from the compositor");
        let Base {
            mut conn,
            keyboard,
            replay_keyboard,
            dispatch,
            ..
        } = base;
        if let Some(dispatch) = dispatch {
            dispatch.stop();
        }
        conn.release_keyboard(keyboard);
        conn.destroy_virtual_keyboard(replay_keyboard);
        conn.release_interfaces();
        if let Err(err) = conn.flush() {
            warn!("cannot flush the compositor connection: {err}");
        }
    }

    fn setup_capture(&self) -> Result<()> {
        let mut state = self.state();
        let State { base, capture, .. } = &mut *state;
        let base = base.as_mut().ok_or(Error::Disconnected)?;
        check_interfaces(Capability::Capture, base.interfaces)?;
        debug!("grabbing the keyboard");
        let input_method = base.conn.get_input_method()?;
        let grab = match base.conn.grab_keyboard(&input_method) {
            Ok(grab) => grab,
            Err(err) => {
                base.conn.destroy_input_method(input_method);
                return Err(err);
            }
        };
        *capture = Some(Capture { input_method, grab });
        Ok(())
    }

    fn teardown_capture(&self) {
        let listeners = {
            let mut state = self.state();
            let listeners = (
                mem::replace(&mut state.key_listeners, TypedHandleMap::new()),
                mem::replace(&mut state.modifiers_listeners, TypedHandleMap::new()),
            );
            let State { base, capture, .. } = &mut *state;
            if let (Some(base), Some(capture)) = (base.as_mut(), capture.take()) {
                debug!("releasing the keyboard grab");
                base.conn.release_grab(capture.grab);
                base.conn.destroy_input_method(capture.input_method);
            }
            listeners
        };
        drop(listeners);
    }

    fn setup_emulate(&self) -> Result<()> {
        let mut state = self.state();
        let State { base, emulate, .. } = &mut *state;
        let base = base.as_mut().ok_or(Error::Disconnected)?;
        check_interfaces(Capability::Emulate, base.interfaces)?;
        debug!("creating the output keyboard");
        let keyboard = base.conn.create_virtual_keyboard()?;
        let layout = OutputLayout::new();
        if let Err(err) = base.conn.keymap(&keyboard, &layout.to_xkb_def()) {
            base.conn.destroy_virtual_keyboard(keyboard);
            return Err(err);
        }
        *emulate = Some(Emulate { keyboard, layout });
        Ok(())
    }

    fn teardown_emulate(&self) {
        let mut state = self.state();
        let State { base, emulate, .. } = &mut *state;
        if let (Some(base), Some(emulate)) = (base.as_mut(), emulate.take()) {
            debug!("destroying the output keyboard");
            base.conn.destroy_virtual_keyboard(emulate.keyboard);
        }
    }

    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        let mut state = self.state();
        match listener {
            Listener::Key(listener) => ListenerId::Key(state.key_listeners.insert(listener)),
            Listener::Modifiers(listener) => {
                ListenerId::Modifiers(state.modifiers_listeners.insert(listener))
            }
        }
    }

    pub fn remove_listener(&self, id: ListenerId) {
        let removed = {
            let mut state = self.state();
            match id {
                ListenerId::Key(handle) => state.key_listeners.remove(handle).map(Listener::Key),
                ListenerId::Modifiers(handle) => state
                    .modifiers_listeners
                    .remove(handle)
                    .map(Listener::Modifiers),
            }
        };
        drop(removed);
    }

    /// Types `text` on the output keyboard, updating its keymap when needed.
    pub fn send_string(&self, text: &str) -> Result<()> {
        let mut state = self.state();
        let State { base, emulate, .. } = &mut *state;
        let (base, Emulate { keyboard, layout }) = emulation(base, emulate)?;
        trace!("typing {text:?}");
        let time = base.timestamp();
        let mut typist = Typist::new(&mut base.conn, keyboard, time);
        let mut batch: Vec<(char, Combo)> = Vec::new();
        let mut dirty = false;
        for c in text.chars() {
            let evicts_pending = layout
                .would_evict(c)
                .is_some_and(|old| batch.iter().any(|&(pending, _)| pending == old));
            if evicts_pending {
                typist.type_batch(layout, mem::take(&mut dirty), &batch)?;
                batch.clear();
            }
            let (combo, changed) = layout.char_to_combo(c);
            dirty |= changed;
            batch.push((c, combo));
        }
        typist.type_batch(layout, dirty, &batch)?;
        typist.set_mods(0);
        Ok(())
    }

    pub fn send_backspaces(&self, count: usize) -> Result<()> {
        let mut state = self.state();
        let State { base, emulate, .. } = &mut *state;
        let (base, emulate) = emulation(base, emulate)?;
        trace!("typing {count} backspaces");
        let time = base.timestamp();
        let mut typist = Typist::new(&mut base.conn, &emulate.keyboard, time);
        for _ in 0..count {
            typist.tap(BACKSPACE_KEYCODE);
        }
        Ok(())
    }

    /// Plays `combo` on the replay keyboard, with keys resolved against the host keymap.
    ///
    /// # Panics
    ///
    /// Panics if the combination leaves a modifier pressed.
    pub fn send_key_combination(&self, combo: &KeyCombo) -> Result<()> {
        let mut state = self.state();
        let State { base, emulate, .. } = &mut *state;
        let (base, _) = emulation(base, emulate)?;
        let steps = base
            .replay_layout
            .as_ref()
            .ok_or(Error::NoKeymap)?
            .resolve(combo)?;
        let time = base.timestamp();
        let mut mods = 0;
        for (combo, key_state) in steps {
            trace!("combination key {} {key_state:?}", combo.keycode);
            base.conn
                .key(&base.replay_keyboard, time, combo.keycode, key_state);
            let new_mods = if key_state.is_pressed() {
                mods | combo.mods
            } else {
                mods & !combo.mods
            };
            if new_mods != mods {
                mods = new_mods;
                base.conn
                    .modifiers(&base.replay_keyboard, Modifiers::depressed(mods));
            }
        }
        assert_eq!(mods, 0, "key combination left modifiers held down");
        Ok(())
    }
}

impl<T: Transport> Drop for KeyboardGuard<'_, T> {
    fn drop(&mut self) {
        let Ok(mut state) = self.cell.try_borrow_mut() else {
            return;
        };
        let Some(base) = state.base.as_mut().filter(|base| base.alive) else {
            return;
        };
        if let Err(err) = base.conn.flush() {
            warn!("cannot flush the compositor connection: {err}");
        }
    }
}

fn emulation<'s, C: Connection>(
    base: &'s mut Option<Base<C>>,
    emulate: &'s mut Option<Emulate<C>>,
) -> Result<(&'s mut Base<C>, &'s mut Emulate<C>)> {
    let emulate = emulate
        .as_mut()
        .ok_or(Error::Inactive(Capability::Emulate))?;
    let base = base.as_mut().ok_or(Error::Disconnected)?;
    base.check_alive()?;
    Ok((base, emulate))
}

/// Key taps on one virtual keyboard, sending modifier changes only when needed.
struct Typist<'a, C: Connection> {
    conn: &'a mut C,
    keyboard: &'a C::VirtualKeyboard,
    time: u32,
    mods: u32,
}

impl<'a, C: Connection> Typist<'a, C> {
    fn new(conn: &'a mut C, keyboard: &'a C::VirtualKeyboard, time: u32) -> Typist<'a, C> {
        Typist {
            conn,
            keyboard,
            time,
            mods: 0,
        }
    }

    fn set_mods(&mut self, mods: u32) {
        if mods != self.mods {
            self.conn.modifiers(self.keyboard, Modifiers::depressed(mods));
            self.mods = mods;
        }
    }

    fn tap(&mut self, keycode: u32) {
        self.conn
            .key(self.keyboard, self.time, keycode, KeyState::Pressed);
        self.conn
            .key(self.keyboard, self.time, keycode, KeyState::Released);
    }

    fn type_batch(
        &mut self,
        layout: &OutputLayout,
        keymap_changed: bool,
        batch: &[(char, Combo)],
    ) -> Result<()> {
        if keymap_changed {
            self.set_mods(0);
            self.conn.keymap(self.keyboard, &layout.to_xkb_def())?;
        }
        for &(_, combo) in batch {
            self.set_mods(combo.mods);
            self.tap(combo.keycode);
        }
        Ok(())
    }
}

fn is_current<C: Connection>(cell: &StateCell<C>, generation: u64) -> bool {
    cell.borrow()
        .base
        .as_ref()
        .is_some_and(|base| base.generation == generation)
}

/// Reads and handles pending events. Returns whether the connection should still be
/// dispatched.
pub(crate) fn process_events<C: Connection>(cell: &StateCell<C>, generation: u64) -> bool {
    let events = match cell.borrow_mut().base.as_mut() {
        Some(base) if base.generation == generation => base.conn.dispatch_pending(),
        _ => return false,
    };
    let result = events
        .and_then(|events| handle_events(cell, generation, events))
        .and_then(|()| flush(cell, generation));
    match result {
        Ok(()) => is_current(cell, generation),
        Err(err) => {
            error!("keyboard connection failed: {err}");
            mark_dead(cell, generation);
            false
        }
    }
}

pub(crate) fn mark_dead<C: Connection>(cell: &StateCell<C>, generation: u64) {
    if let Some(base) = cell.borrow_mut().base.as_mut() {
        if base.generation == generation {
            base.alive = false;
        }
    }
}

fn flush<C: Connection>(cell: &StateCell<C>, generation: u64) -> Result<()> {
    match cell.borrow_mut().base.as_mut() {
        Some(base) if base.generation == generation => base.conn.flush(),
        _ => Ok(()),
    }
}

fn handle_events<C: Connection>(
    cell: &StateCell<C>,
    generation: u64,
    events: Vec<Event>,
) -> Result<()> {
    for event in events {
        if !is_current(cell, generation) {
            break;
        }
        match event {
            Event::Keymap(keymap) => on_keymap(cell, keymap)?,
            Event::GrabKey {
                time,
                keycode,
                state,
            } => on_grab_key(cell, generation, time, keycode, state),
            Event::GrabModifiers(modifiers) => on_grab_modifiers(cell, generation, modifiers),
        }
    }
    Ok(())
}

fn on_keymap<C: Connection>(cell: &StateCell<C>, keymap: Vec<u8>) -> Result<()> {
    let mut state = cell.borrow_mut();
    let Some(base) = state.base.as_mut() else {
        return Ok(());
    };
    if output::is_generated(&keymap) {
        trace!("ignoring generated keymap");
        return Ok(());
    }
    if base.keymap.as_ref() == Some(&keymap) {
        trace!("ignoring unchanged keymap");
        return Ok(());
    }
    let layout = match ComboTable::from_keymap(&keymap) {
        Ok(layout) => layout,
        Err(err) => {
            warn!("ignoring host keymap: {err}");
            return Ok(());
        }
    };
    debug!("host keymap changed, {} key names", layout.len());
    base.conn.keymap(&base.replay_keyboard, &keymap)?;
    base.replay_layout = Some(layout);
    base.keymap = Some(keymap);
    Ok(())
}

fn on_grab_key<C: Connection>(
    cell: &StateCell<C>,
    generation: u64,
    time: u32,
    keycode: u32,
    key_state: KeyState,
) {
    trace!("grabbed key {keycode} {key_state:?}");
    let listeners: Vec<KeyListener> = cell.borrow().key_listeners.iter().cloned().collect();
    let mut suppressed = false;
    for listener in &listeners {
        suppressed |= listener(time, keycode, key_state);
    }
    if suppressed {
        return;
    }
    let mut state = cell.borrow_mut();
    if let Some(base) = state.base.as_mut().filter(|base| base.generation == generation) {
        base.conn.key(&base.replay_keyboard, time, keycode, key_state);
    }
}

fn on_grab_modifiers<C: Connection>(cell: &StateCell<C>, generation: u64, modifiers: Modifiers) {
    trace!("grabbed modifiers {modifiers:?}");
    let listeners: Vec<ModifiersListener> =
        cell.borrow().modifiers_listeners.iter().cloned().collect();
    let mut suppressed = false;
    for listener in &listeners {
        suppressed |= listener(modifiers);
    }
    if suppressed {
        return;
    }
    let mut state = cell.borrow_mut();
    if let Some(base) = state.base.as_mut().filter(|base| base.generation == generation) {
        base.conn.modifiers(&base.replay_keyboard, modifiers);
    }
}
