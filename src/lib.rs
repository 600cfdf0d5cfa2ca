//! A small asynchronous TCP session framework for building packet servers and
//! load-testing clients.
//!
//! # Organization
//! - [`Listener`] and [`Connector`] establish connections and hand each one to
//!   a fresh [`Session`]
//! - [`Session`] owns a connected stream and drives its reader and writer
//!   tasks, reporting to an application supplied [`SessionHandler`]
//! - [`RecvWindow`] turns a fragmented byte stream into contiguous slices the
//!   application can parse whole packets out of
//! - [`SendAllocator`] slices large [`SendArena`]s into per-packet
//!   [`SendRegion`]s so many small writes cost few allocations
//! - [`framing`] provides the length-prefixed packet convention on top of the
//!   raw byte callbacks
//!
//! # Session structure
//!
//! A session is created by a [`SessionFactory`] whenever the listener accepts
//! or the connector establishes a connection. The factory produces the
//! application half of the session, a [`SessionHandler`], and the core half
//! takes care of buffering:
//!
//! ```text
//!   socket ──read──> RecvWindow ──readable()──> on_receive() ──consumed──┐
//!     ^                  ^                                               │
//!     │                  └────────────── commit_read(consumed) <─────────┘
//!     │
//!     └──write_vectored── pending ◄── queue ◄── Session::send(SendRegion)
//! ```
//!
//! Outbound regions queued while a write is in flight are coalesced into the
//! next gathered write, so bytes reach the wire in the order
//! [`Session::send`] was called.

pub mod config;
pub use config::{ArenaConfig, ConnectorConfig, ListenerConfig, SessionConfig};

pub mod logging;

mod id;
pub use id::SessionId;

pub mod recv_window;
pub use recv_window::RecvWindow;

pub mod send_arena;
pub use send_arena::{SendAllocator, SendArena, SendRegion};

pub mod session;
pub use session::{DisconnectReason, Session, SessionFactory, SessionHandler, SessionState};

mod registry;
pub use registry::SessionRegistry;

pub mod framing;

mod listener;
pub use listener::Listener;

mod connector;
pub use connector::{ConnectError, Connector};
