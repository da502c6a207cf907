use crate::transport::{Capability, Interfaces};
use std::io;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "cannot {capability} keyboard events: your Wayland compositor does not support \
         the following interfaces: {missing}"
    )]
    MissingInterfaces {
        capability: Capability,
        missing: Interfaces,
    },
    #[error("cannot connect to the Wayland compositor")]
    Connect(#[source] BoxError),
    #[error("Wayland connection failure")]
    Transport(#[source] BoxError),
    #[error("the Wayland connection was lost, deactivate and reactivate to reconnect")]
    Disconnected,
    #[error("keyboard {0} is not active")]
    Inactive(Capability),
    #[error("no keymap has been received from the compositor yet")]
    NoKeymap,
    #[error("invalid keymap")]
    InvalidKeymap,
    #[error("unknown key {0:?}")]
    UnknownKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn transport(error: impl Into<BoxError>) -> Error {
        Error::Transport(error.into())
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(errno: rustix::io::Errno) -> Error {
        Error::Io(errno.into())
    }
}
