//! Client struct definition
//!
//! The hub's view of a registered connection adapter: its identity and
//! the sending half of its outbound queue.

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::SendError;
use crate::hub::Registration;
use crate::message::Envelope;
use crate::types::ClientIdentity;

/// Registered client
///
/// The hub holds the only `Sender` of the adapter's outbound queue, so
/// dropping a `Client` closes that queue and stops the outbound pump.
#[derive(Debug)]
pub struct Client {
    /// Identity bound at registration
    pub identity: ClientIdentity,
    /// Hub → adapter outbound queue
    sender: mpsc::Sender<Envelope>,
    /// Registration this entry was created by
    pub registration: Registration,
}

impl Client {
    /// Create a new client with the given identity and outbound queue
    pub fn new(
        identity: ClientIdentity,
        sender: mpsc::Sender<Envelope>,
        registration: Registration,
    ) -> Self {
        Self {
            identity,
            sender,
            registration,
        }
    }

    /// Offer an envelope to this client without waiting
    ///
    /// A full queue drops the envelope for this client only.
    pub fn offer(&self, envelope: Envelope) -> Result<(), SendError> {
        self.sender.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}
