//! [`Transport`] over a Wayland socket, using the `zwp_input_method_v2` and
//! `zwp_virtual_keyboard_v1` protocol extensions.

use crate::{
    error::{Error, Result},
    transport::{self, Event, Interfaces, KeyState, Modifiers, Transport},
};
use log::{debug, warn};
use memfd::MemfdOptions;
use memmap2::MmapOptions;
use std::{
    fs::File,
    io::{self, Write},
    mem,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
};
use wayland_client::{
    backend::{Backend, WaylandError},
    globals::{registry_queue_init, GlobalListContents},
    protocol::{
        wl_keyboard::{self, KeymapFormat, WlKeyboard},
        wl_registry::{self, WlRegistry},
        wl_seat::WlSeat,
    },
    Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum,
};
use wayland_protocols_misc::{
    zwp_input_method_v2::client::{
        zwp_input_method_keyboard_grab_v2::{self, ZwpInputMethodKeyboardGrabV2},
        zwp_input_method_manager_v2::ZwpInputMethodManagerV2,
        zwp_input_method_v2::{self, ZwpInputMethodV2},
    },
    zwp_virtual_keyboard_v1::client::{
        zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
        zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
    },
};

/// Connects through `WAYLAND_SOCKET` or `WAYLAND_DISPLAY`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WaylandTransport;

impl Transport for WaylandTransport {
    type Connection = WaylandConnection;

    fn connect(&self) -> Result<WaylandConnection> {
        WaylandConnection::connect()
    }
}

/// Events collected while dispatching the queue.
#[derive(Default)]
struct Inbox {
    events: Vec<Event>,
}

struct Globals {
    seat: Option<WlSeat>,
    input_method_manager: Option<ZwpInputMethodManagerV2>,
    virtual_keyboard_manager: Option<ZwpVirtualKeyboardManagerV1>,
}

pub struct WaylandConnection {
    conn: Connection,
    backend: Backend,
    queue: EventQueue<Inbox>,
    qhandle: QueueHandle<Inbox>,
    globals: Globals,
    inbox: Inbox,
}

fn unbound(interface: Interfaces) -> Error {
    Error::transport(format!("{} is not bound", interface.protocol_name()))
}

impl WaylandConnection {
    fn connect() -> Result<WaylandConnection> {
        let conn = Connection::connect_to_env().map_err(|err| Error::Connect(err.into()))?;
        let (global_list, queue) =
            registry_queue_init::<Inbox>(&conn).map_err(|err| Error::Connect(err.into()))?;
        let qhandle = queue.handle();
        let globals = Globals {
            seat: global_list.bind(&qhandle, 1..=5, ()).ok(),
            input_method_manager: global_list.bind(&qhandle, 1..=1, ()).ok(),
            virtual_keyboard_manager: global_list.bind(&qhandle, 1..=1, ()).ok(),
        };
        debug!("connected to the compositor");
        Ok(WaylandConnection {
            backend: conn.backend(),
            conn,
            queue,
            qhandle,
            globals,
            inbox: Inbox::default(),
        })
    }

    fn seat(&self) -> Result<&WlSeat> {
        self.globals
            .seat
            .as_ref()
            .ok_or_else(|| unbound(Interfaces::SEAT))
    }

    fn take_events(&mut self) -> Vec<Event> {
        mem::take(&mut self.inbox.events)
    }
}

impl transport::Connection for WaylandConnection {
    type Keyboard = WlKeyboard;
    type VirtualKeyboard = ZwpVirtualKeyboardV1;
    type InputMethod = ZwpInputMethodV2;
    type KeyboardGrab = ZwpInputMethodKeyboardGrabV2;

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.backend.poll_fd()
    }

    fn interfaces(&self) -> Interfaces {
        let mut interfaces = Interfaces::empty();
        interfaces.set(Interfaces::SEAT, self.globals.seat.is_some());
        interfaces.set(
            Interfaces::INPUT_METHOD,
            self.globals.input_method_manager.is_some(),
        );
        interfaces.set(
            Interfaces::VIRTUAL_KEYBOARD,
            self.globals.virtual_keyboard_manager.is_some(),
        );
        interfaces
    }

    fn roundtrip(&mut self) -> Result<Vec<Event>> {
        self.queue
            .roundtrip(&mut self.inbox)
            .map_err(Error::transport)?;
        Ok(self.take_events())
    }

    fn dispatch_pending(&mut self) -> Result<Vec<Event>> {
        if let Some(guard) = self.queue.prepare_read() {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(Error::transport(err)),
            }
        }
        self.queue
            .dispatch_pending(&mut self.inbox)
            .map_err(Error::transport)?;
        Ok(self.take_events())
    }

    fn flush(&mut self) -> Result<()> {
        self.conn.flush().map_err(Error::transport)
    }

    fn get_keyboard(&mut self) -> Result<WlKeyboard> {
        Ok(self.seat()?.get_keyboard(&self.qhandle, ()))
    }

    fn release_keyboard(&mut self, keyboard: WlKeyboard) {
        if keyboard.version() >= 3 {
            keyboard.release();
        }
    }

    fn create_virtual_keyboard(&mut self) -> Result<ZwpVirtualKeyboardV1> {
        let manager = self
            .globals
            .virtual_keyboard_manager
            .as_ref()
            .ok_or_else(|| unbound(Interfaces::VIRTUAL_KEYBOARD))?;
        Ok(manager.create_virtual_keyboard(self.seat()?, &self.qhandle, ()))
    }

    fn destroy_virtual_keyboard(&mut self, keyboard: ZwpVirtualKeyboardV1) {
        keyboard.destroy();
    }

    fn get_input_method(&mut self) -> Result<ZwpInputMethodV2> {
        let manager = self
            .globals
            .input_method_manager
            .as_ref()
            .ok_or_else(|| unbound(Interfaces::INPUT_METHOD))?;
        Ok(manager.get_input_method(self.seat()?, &self.qhandle, ()))
    }

    fn destroy_input_method(&mut self, input_method: ZwpInputMethodV2) {
        input_method.destroy();
    }

    fn grab_keyboard(&mut self, input_method: &ZwpInputMethodV2) -> Result<ZwpInputMethodKeyboardGrabV2> {
        Ok(input_method.grab_keyboard(&self.qhandle, ()))
    }

    fn release_grab(&mut self, grab: ZwpInputMethodKeyboardGrabV2) {
        grab.release();
    }

    fn keymap(&mut self, keyboard: &ZwpVirtualKeyboardV1, keymap: &[u8]) -> Result<()> {
        let memfd = MemfdOptions::new()
            .close_on_exec(true)
            .create("waykeys-keymap")
            .map_err(|err| Error::Io(io::Error::other(err)))?;
        memfd.as_file().write_all(keymap)?;
        keyboard.keymap(
            KeymapFormat::XkbV1.into(),
            memfd.as_file().as_fd(),
            keymap.len() as u32,
        );
        Ok(())
    }

    fn key(&mut self, keyboard: &ZwpVirtualKeyboardV1, time: u32, keycode: u32, state: KeyState) {
        keyboard.key(time, keycode, state.into());
    }

    fn modifiers(&mut self, keyboard: &ZwpVirtualKeyboardV1, modifiers: Modifiers) {
        keyboard.modifiers(
            modifiers.depressed,
            modifiers.latched,
            modifiers.locked,
            modifiers.group,
        );
    }

    fn release_interfaces(&mut self) {
        if let Some(seat) = self.globals.seat.take() {
            if seat.version() >= 5 {
                seat.release();
            }
        }
        if let Some(manager) = self.globals.input_method_manager.take() {
            manager.destroy();
        }
        // zwp_virtual_keyboard_manager_v1 has no destructor.
        self.globals.virtual_keyboard_manager = None;
    }
}

fn read_keymap(fd: OwnedFd, size: u32) -> io::Result<Vec<u8>> {
    let file = File::from(fd);
    let map = unsafe { MmapOptions::new().len(size as usize).map(&file)? };
    Ok(map.to_vec())
}

fn key_state(state: WEnum<wl_keyboard::KeyState>) -> KeyState {
    KeyState::from(state == WEnum::Value(wl_keyboard::KeyState::Pressed))
}

macro_rules! empty_dispatch {
    ($($t:ty),*) => {
        $(
            impl Dispatch<$t, ()> for Inbox {
                fn event(
                    _: &mut Self,
                    _: &$t,
                    _: <$t as wayland_client::Proxy>::Event,
                    _: &(),
                    _: &Connection,
                    _: &QueueHandle<Self>,
                ) {
                }
            }
        )*
    };
}

empty_dispatch![
    WlSeat,
    ZwpInputMethodManagerV2,
    ZwpVirtualKeyboardManagerV1,
    ZwpVirtualKeyboardV1
];

impl Dispatch<WlRegistry, GlobalListContents> for Inbox {
    fn event(
        _state: &mut Self,
        _proxy: &WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::GlobalRemove { name } => {
                debug!("global {name} removed");
            }
            _ => {}
        }
    }
}

impl Dispatch<WlKeyboard, ()> for Inbox {
    fn event(
        state: &mut Self,
        _proxy: &WlKeyboard,
        event: wl_keyboard::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        match event {
            wl_keyboard::Event::Keymap { format, fd, size } => match format {
                WEnum::Value(KeymapFormat::XkbV1) => match read_keymap(fd, size) {
                    Ok(keymap) => state.events.push(Event::Keymap(keymap)),
                    Err(err) => warn!("cannot read the seat keymap: {err}"),
                },
                WEnum::Value(_) | WEnum::Unknown(_) => {
                    warn!("ignoring seat keymap in unsupported format {format:?}");
                }
            },
            _ => {}
        }
    }
}

impl Dispatch<ZwpInputMethodV2, ()> for Inbox {
    fn event(
        _state: &mut Self,
        _proxy: &ZwpInputMethodV2,
        event: zwp_input_method_v2::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        match event {
            zwp_input_method_v2::Event::Unavailable => {
                warn!("another input method is running, keyboard events cannot be captured");
            }
            _ => {}
        }
    }
}

impl Dispatch<ZwpInputMethodKeyboardGrabV2, ()> for Inbox {
    fn event(
        state: &mut Self,
        _proxy: &ZwpInputMethodKeyboardGrabV2,
        event: zwp_input_method_keyboard_grab_v2::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        use zwp_input_method_keyboard_grab_v2::Event as GrabEvent;
        match event {
            GrabEvent::Key {
                serial: _,
                time,
                key,
                state: key_state_,
            } => state.events.push(Event::GrabKey {
                time,
                keycode: key,
                state: key_state(key_state_),
            }),
            GrabEvent::Modifiers {
                serial: _,
                mods_depressed,
                mods_latched,
                mods_locked,
                group,
            } => state.events.push(Event::GrabModifiers(Modifiers {
                depressed: mods_depressed,
                latched: mods_latched,
                locked: mods_locked,
                group,
            })),
            // The seat keyboard already reports the host keymap.
            _ => {}
        }
    }
}
