//! An in-memory compositor for exercising the keyboard handler.

use crate::{
    error::{Error, Result},
    output,
    transport::{Connection, Event, Interfaces, KeyState, Modifiers, Transport},
};
use parking_lot::Mutex;
use rustix::{
    fd::{AsFd, BorrowedFd, OwnedFd},
    pipe::PipeFlags,
};
use std::{
    collections::{BTreeSet, VecDeque},
    fmt,
    sync::Arc,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Request {
    GetKeyboard(u32),
    ReleaseKeyboard(u32),
    CreateVirtualKeyboard(u32),
    DestroyVirtualKeyboard(u32),
    GetInputMethod(u32),
    DestroyInputMethod(u32),
    GrabKeyboard(u32),
    ReleaseGrab(u32),
    Keymap {
        keyboard: u32,
        keymap: Vec<u8>,
    },
    Key {
        keyboard: u32,
        time: u32,
        keycode: u32,
        state: KeyState,
    },
    Modifiers {
        keyboard: u32,
        modifiers: Modifiers,
    },
    ReleaseInterfaces,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::GetKeyboard(id) => write!(f, "get_keyboard #{id}"),
            Request::ReleaseKeyboard(id) => write!(f, "release_keyboard #{id}"),
            Request::CreateVirtualKeyboard(id) => write!(f, "create_virtual_keyboard #{id}"),
            Request::DestroyVirtualKeyboard(id) => write!(f, "destroy_virtual_keyboard #{id}"),
            Request::GetInputMethod(id) => write!(f, "get_input_method #{id}"),
            Request::DestroyInputMethod(id) => write!(f, "destroy_input_method #{id}"),
            Request::GrabKeyboard(id) => write!(f, "grab_keyboard #{id}"),
            Request::ReleaseGrab(id) => write!(f, "release_grab #{id}"),
            Request::Keymap { keyboard, keymap } => {
                let kind = if output::is_generated(keymap) {
                    "generated"
                } else {
                    "host"
                };
                write!(f, "keymap #{keyboard} {kind}")
            }
            Request::Key {
                keyboard,
                time: _,
                keycode,
                state,
            } => {
                let state = match state {
                    KeyState::Pressed => "pressed",
                    KeyState::Released => "released",
                };
                write!(f, "key #{keyboard} {keycode} {state}")
            }
            Request::Modifiers {
                keyboard,
                modifiers,
            } => write!(
                f,
                "modifiers #{keyboard} {} {} {} {}",
                modifiers.depressed, modifiers.latched, modifiers.locked, modifiers.group,
            ),
            Request::ReleaseInterfaces => f.write_str("release_interfaces"),
        }
    }
}

struct Compositor {
    interfaces: Interfaces,
    reachable: bool,
    host_keymap: Option<Vec<u8>>,
    connections: usize,
    connected: bool,
    interfaces_bound: bool,
    next_id: u32,
    live: BTreeSet<u32>,
    events: VecDeque<Event>,
    broken: bool,
    waker: Option<OwnedFd>,
    requests: Vec<Request>,
}

/// The test side of a [`MockTransport`].
#[derive(Clone)]
pub(crate) struct MockCompositor(Arc<Mutex<Compositor>>);

impl MockCompositor {
    pub(crate) fn set_interfaces(&self, interfaces: Interfaces) {
        self.0.lock().interfaces = interfaces;
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.0.lock().reachable = reachable;
    }

    /// The keymap sent to every new seat keyboard.
    pub(crate) fn set_host_keymap(&self, keymap: impl Into<Vec<u8>>) {
        self.0.lock().host_keymap = Some(keymap.into());
    }

    /// Queues an event for the next read on the live connection.
    pub(crate) fn send(&self, event: Event) {
        self.0.lock().events.push_back(event);
    }

    /// Makes the live connection readable, waking its dispatch thread.
    pub(crate) fn wake(&self) {
        if let Some(waker) = &self.0.lock().waker {
            rustix::io::write(waker, b"w").expect("cannot wake the connection");
        }
    }

    /// Makes every following read on the live connection fail.
    pub(crate) fn break_connection(&self) {
        self.0.lock().broken = true;
    }

    pub(crate) fn connections(&self) -> usize {
        self.0.lock().connections
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.0.lock().connected
    }

    pub(crate) fn interfaces_bound(&self) -> bool {
        self.0.lock().interfaces_bound
    }

    /// Number of protocol objects created and not yet destroyed.
    pub(crate) fn live_objects(&self) -> usize {
        self.0.lock().live.len()
    }

    pub(crate) fn is_live(&self, id: u32) -> bool {
        self.0.lock().live.contains(&id)
    }

    /// Returns and forgets every request made so far.
    pub(crate) fn take_requests(&self) -> Vec<Request> {
        std::mem::take(&mut self.0.lock().requests)
    }

    pub(crate) fn take_log(&self) -> String {
        self.take_requests()
            .iter()
            .map(|request| format!("{request}\n"))
            .collect()
    }
}

pub(crate) struct MockTransport(Arc<Mutex<Compositor>>);

impl MockTransport {
    pub(crate) fn new() -> (MockTransport, MockCompositor) {
        let compositor = Arc::new(Mutex::new(Compositor {
            interfaces: Interfaces::all(),
            reachable: true,
            host_keymap: None,
            connections: 0,
            connected: false,
            interfaces_bound: false,
            next_id: 1,
            live: BTreeSet::new(),
            events: VecDeque::new(),
            broken: false,
            waker: None,
            requests: Vec::new(),
        }));
        (
            MockTransport(Arc::clone(&compositor)),
            MockCompositor(compositor),
        )
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    fn connect(&self) -> Result<MockConnection> {
        let mut compositor = self.0.lock();
        if !compositor.reachable {
            return Err(Error::Connect("no compositor".into()));
        }
        assert!(!compositor.connected, "connected twice");
        compositor.connections += 1;
        compositor.connected = true;
        compositor.interfaces_bound = true;
        compositor.broken = false;
        compositor.next_id = 1;
        compositor.events.clear();
        // Only written to by `MockCompositor::wake`, tests otherwise dispatch by hand.
        let (reader, writer) = rustix::pipe::pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC)?;
        compositor.waker = Some(writer);
        Ok(MockConnection {
            compositor: Arc::clone(&self.0),
            interfaces: compositor.interfaces,
            reader,
        })
    }
}

/// A protocol object handle.
#[derive(Debug)]
pub(crate) struct Object(u32);

pub(crate) struct MockConnection {
    compositor: Arc<Mutex<Compositor>>,
    interfaces: Interfaces,
    reader: OwnedFd,
}

impl MockConnection {
    fn create(&mut self, request: fn(u32) -> Request) -> Object {
        let mut compositor = self.compositor.lock();
        let id = compositor.next_id;
        compositor.next_id += 1;
        compositor.live.insert(id);
        compositor.requests.push(request(id));
        Object(id)
    }

    fn destroy(&mut self, object: Object, request: fn(u32) -> Request) {
        let mut compositor = self.compositor.lock();
        assert!(compositor.live.remove(&object.0), "#{} destroyed twice", object.0);
        compositor.requests.push(request(object.0));
    }

    fn request(&mut self, object: &Object, request: Request) {
        let mut compositor = self.compositor.lock();
        assert!(compositor.live.contains(&object.0), "#{} is dead", object.0);
        compositor.requests.push(request);
    }

    fn read(&mut self) -> Result<Vec<Event>> {
        let mut buf = [0; 64];
        while matches!(rustix::io::read(&self.reader, &mut buf), Ok(n) if n > 0) {}
        let mut compositor = self.compositor.lock();
        if compositor.broken {
            return Err(Error::transport("broken pipe"));
        }
        Ok(compositor.events.drain(..).collect())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        let mut compositor = self.compositor.lock();
        compositor.connected = false;
        compositor.waker = None;
    }
}

impl Connection for MockConnection {
    type Keyboard = Object;
    type VirtualKeyboard = Object;
    type InputMethod = Object;
    type KeyboardGrab = Object;

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    fn interfaces(&self) -> Interfaces {
        self.interfaces
    }

    fn roundtrip(&mut self) -> Result<Vec<Event>> {
        self.read()
    }

    fn dispatch_pending(&mut self) -> Result<Vec<Event>> {
        self.read()
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_keyboard(&mut self) -> Result<Object> {
        let keyboard = self.create(Request::GetKeyboard);
        let mut compositor = self.compositor.lock();
        if let Some(keymap) = compositor.host_keymap.clone() {
            compositor.events.push_back(Event::Keymap(keymap));
        }
        Ok(keyboard)
    }

    fn release_keyboard(&mut self, keyboard: Object) {
        self.destroy(keyboard, Request::ReleaseKeyboard);
    }

    fn create_virtual_keyboard(&mut self) -> Result<Object> {
        Ok(self.create(Request::CreateVirtualKeyboard))
    }

    fn destroy_virtual_keyboard(&mut self, keyboard: Object) {
        self.destroy(keyboard, Request::DestroyVirtualKeyboard);
    }

    fn get_input_method(&mut self) -> Result<Object> {
        Ok(self.create(Request::GetInputMethod))
    }

    fn destroy_input_method(&mut self, input_method: Object) {
        self.destroy(input_method, Request::DestroyInputMethod);
    }

    fn grab_keyboard(&mut self, input_method: &Object) -> Result<Object> {
        assert!(self.compositor.lock().live.contains(&input_method.0));
        Ok(self.create(Request::GrabKeyboard))
    }

    fn release_grab(&mut self, grab: Object) {
        self.destroy(grab, Request::ReleaseGrab);
    }

    fn keymap(&mut self, keyboard: &Object, keymap: &[u8]) -> Result<()> {
        let request = Request::Keymap {
            keyboard: keyboard.0,
            keymap: keymap.to_vec(),
        };
        self.request(keyboard, request);
        Ok(())
    }

    fn key(&mut self, keyboard: &Object, time: u32, keycode: u32, state: KeyState) {
        let request = Request::Key {
            keyboard: keyboard.0,
            time,
            keycode,
            state,
        };
        self.request(keyboard, request);
    }

    fn modifiers(&mut self, keyboard: &Object, modifiers: Modifiers) {
        let request = Request::Modifiers {
            keyboard: keyboard.0,
            modifiers,
        };
        self.request(keyboard, request);
    }

    fn release_interfaces(&mut self) {
        let mut compositor = self.compositor.lock();
        compositor.interfaces_bound = false;
        compositor.requests.push(Request::ReleaseInterfaces);
    }
}
