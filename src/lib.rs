//! irc-idler — an IRC proxy that stays on while your client is away.
//!
//! The proxy sits between one IRC client and one IRC server. With the
//! client attached it forwards traffic transparently; when the client
//! disconnects it keeps the server-side session registered and in its
//! channels, answers server PINGs, and replays the handshake and cached
//! channel state when the client comes back.

pub mod config;
pub mod irc;
pub mod proxy;
