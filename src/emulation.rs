use crate::{
    combo::KeyCombo,
    error::Result,
    handler::KeyboardHandler,
    transport::{Capability, Transport},
};
use std::sync::Arc;

/// Types text and key combinations. Emulation stays active as long as this value lives.
pub struct KeyboardEmulation<T: Transport> {
    handler: Arc<KeyboardHandler<T>>,
}

impl<T: Transport> KeyboardEmulation<T> {
    pub fn new(handler: Arc<KeyboardHandler<T>>) -> Result<KeyboardEmulation<T>> {
        handler.lock().activate(Capability::Emulate)?;
        Ok(KeyboardEmulation { handler })
    }

    /// Types `text` independently of the host keyboard layout.
    pub fn send_string(&self, text: &str) -> Result<()> {
        self.handler.lock().send_string(text)
    }

    pub fn send_backspaces(&self, count: usize) -> Result<()> {
        self.handler.lock().send_backspaces(count)
    }

    /// Presses and releases keys named after the host keymap.
    pub fn send_key_combination(&self, combo: &KeyCombo) -> Result<()> {
        self.handler.lock().send_key_combination(combo)
    }
}

impl<T: Transport> Drop for KeyboardEmulation<T> {
    fn drop(&mut self) {
        self.handler.lock().deactivate(Capability::Emulate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::KeyboardCapture,
        combo::tests::{test_keymap, US_SYMBOLS},
        error::Error,
        mock::MockTransport,
    };

    #[test]
    fn test_shared_connection() {
        let (transport, compositor) = MockTransport::new();
        compositor.set_host_keymap(test_keymap(US_SYMBOLS));
        let handler = Arc::new(KeyboardHandler::new(transport));

        let first = KeyboardEmulation::new(Arc::clone(&handler)).unwrap();
        let second = KeyboardEmulation::new(Arc::clone(&handler)).unwrap();
        let mut capture = KeyboardCapture::new(Arc::clone(&handler));
        capture.start().unwrap();
        assert_eq!(compositor.connections(), 1);

        drop(first);
        capture.cancel();
        compositor.take_requests();
        second.send_string("i").unwrap();
        second.send_backspaces(1).unwrap();
        second
            .send_key_combination(&KeyCombo::chord(["control", "s"]))
            .unwrap();
        assert_eq!(
            compositor.take_log(),
            "key #3 26 pressed\n\
             key #3 26 released\n\
             key #3 0 pressed\n\
             key #3 0 released\n\
             key #1 29 pressed\n\
             modifiers #1 4 0 0 0\n\
             key #1 31 pressed\n\
             key #1 31 released\n\
             key #1 29 released\n\
             modifiers #1 0 0 0 0\n"
        );

        drop(second);
        assert!(!compositor.is_connected());
        assert_eq!(compositor.live_objects(), 0);
    }

    #[test]
    fn test_unknown_key() {
        let (transport, compositor) = MockTransport::new();
        compositor.set_host_keymap(test_keymap(US_SYMBOLS));
        let emulation = KeyboardEmulation::new(Arc::new(KeyboardHandler::new(transport))).unwrap();
        compositor.take_requests();
        let err = emulation
            .send_key_combination(&KeyCombo::chord(["hyper_r"]))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownKey(name) if name == "hyper_r"));
        assert!(compositor.take_requests().is_empty());
    }
}
