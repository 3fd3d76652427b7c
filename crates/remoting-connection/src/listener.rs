//! Seams between the connection layer and the services built on it

use crate::channel::Channel;
use crate::future::IoFuture;

/// Receives channels opened by peers under a registered service name
pub trait OpenListener: Send + Sync {
    /// Called on the connection's reader task once the open has been
    /// acknowledged. Must not block; spawn for anything long-running.
    fn channel_opened(&self, channel: Channel);

    /// The registration was closed, directly or by closing the endpoint
    fn registration_terminated(&self) {}
}

impl<F> OpenListener for F
where
    F: Fn(Channel) + Send + Sync,
{
    fn channel_opened(&self, channel: Channel) {
        self(channel)
    }
}

/// Anything that can supply a channel to a named service
pub trait ChannelOpener: Send + Sync {
    fn open_channel(&self, service_name: &str) -> IoFuture<Channel>;
}
