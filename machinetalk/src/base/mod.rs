//! Endpoint state machines.
//!
//! Each endpoint composes one or two channels and folds their transitions
//! into a single application-visible `connected` (and, where applicable,
//! `synced`) edge. The machines are enums with explicit `match` transition
//! tables; events that are not listed for the current state are no-ops,
//! matching the guarded transitions of the wire protocol.

pub(crate) mod command;
pub(crate) mod component;
pub(crate) mod error;
pub(crate) mod log;
pub(crate) mod status;

/// State of a single-channel endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Down,
    Trying,
    Up,
}

/// State of a status endpoint, which synchronises its topics after the
/// channel came up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusState {
    Down,
    Trying,
    Syncing,
    Up,
}

/// State of a remote HAL component endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteComponentState {
    /// Everything closed.
    Down,
    /// The halrcmd channel is coming up.
    Trying,
    /// Halrcmd up; deciding whether to send a bind request.
    Bind,
    /// Bind request sent, awaiting confirm or reject.
    Binding,
    /// Bind confirmed or skipped; halrcomp subscribing.
    Syncing,
    /// Halrcomp up; applying the first full update.
    Sync,
    /// Pins match the server; normal operation.
    Synced,
    /// Terminal after a bind or set reject; only exit is `stop`.
    Error,
}

/// Concatenate the `note` lines of an error or reject reply.
pub(crate) fn join_notes(notes: &[String]) -> String {
    let mut joined = String::new();
    for note in notes {
        joined.push_str(note);
        joined.push('\n');
    }
    joined
}
