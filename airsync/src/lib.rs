//! Rust library to synchronize mobile devices with mailboxes.
//!
//! The main purpose of this library is to let many remote devices
//! maintain an eventually-consistent, incrementally-synchronized
//! mirror of a mailbox folder hierarchy over an unreliable,
//! high-latency network, while enforcing security policy and
//! supporting remote wipe.
//!
//! This goal is achieved by exposing a
//! [`SyncEngine`](crate::engine::SyncEngine) struct which dispatches
//! typed protocol commands: folder-hierarchy sync, per-folder content
//! sync over opaque cursors, long-poll heartbeats, the provisioning
//! handshake and remote-wipe delivery. The engine reads and writes
//! its own durable state (devices, per-device folders, cursors, the
//! change feed and the audit trail) and talks to the mailbox itself
//! through the [`MailboxStorage`](crate::mailbox::MailboxStorage)
//! trait.
//!
//! See examples in the /tests folder.
//!
//! ## Engine surface
//!
//! - [`FolderSync`](crate::engine::SyncEngine::folder_sync)
//! - [`Sync`](crate::engine::SyncEngine::sync)
//! - [`Ping`](crate::engine::SyncEngine::ping)
//! - [`Provision`](crate::engine::SyncEngine::provision)
//! - [`ItemEstimate`](crate::engine::SyncEngine::item_estimate)
//! - [`MoveItems`](crate::engine::SyncEngine::move_items)
//! - [`Search`](crate::engine::SyncEngine::search)
//! - [`SendMail`](crate::engine::SyncEngine::send_mail)
//! - [`Settings`](crate::engine::SyncEngine::settings)

pub mod audit;
pub mod config;
pub mod cursor;
pub mod device;
pub mod engine;
mod error;
pub mod feed;
pub mod folder;
pub mod item;
pub mod mailbox;
pub mod ping;
pub mod provision;

#[doc(inline)]
pub use self::{
    config::SyncConfig,
    engine::SyncEngine,
    error::{AnyBoxedError, AnyError, AnyResult},
};
