use thiserror::Error;

/// The one error this crate's own API (as opposed to the futures it hands
/// out, which reject with [`fluxion_future::Error::ChannelClosed`]) can
/// raise directly.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("channel is closed")]
    ChannelClosed,
}

impl From<Error> for fluxion_future::Error {
    fn from(_: Error) -> Self {
        fluxion_future::Error::ChannelClosed
    }
}
