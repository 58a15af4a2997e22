//! Sans-I/O protocol state machines.
//!
//! The startup flow is protocol logic with no I/O of its own: `step()`
//! returns an [`Action`] telling the driver what to do next (write, read,
//! upgrade to TLS), and the driver feeds results back in.

pub mod startup;

pub use startup::{StartupFlow, TlsPlan};

use crate::error::PgError;

/// Action requested by a state machine step.
#[derive(Debug)]
pub enum Action {
    /// Write `write_buffer`, then read a single byte and pass it to
    /// [`StartupFlow::set_ssl_response`]. Used for SSL negotiation only.
    WriteAndReadByte,

    /// Read one message into the buffer set, then step again.
    ReadMessage,

    /// Write `write_buffer`, then read one message, then step again.
    WriteAndReadMessage,

    /// Perform the TLS handshake, pass the channel-binding data to
    /// [`StartupFlow::set_channel_binding`], then step again.
    TlsHandshake,

    /// Dispatch a server notice, read the next message, then step again.
    HandleNotice(PgError),

    /// The flow has finished successfully.
    Finished,
}
