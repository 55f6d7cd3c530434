//! Module dedicated to content synchronization reporting.
//!
//! The core structure of this module is the [`ItemSyncReport`].

/// The content synchronization report.
///
/// Counters describing one content sync exchange, fed into the audit
/// entry of the exchange.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ItemSyncReport {
    /// The number of items forwarded to the device as added.
    pub items_added: u32,

    /// The number of items forwarded to the device as changed.
    pub items_changed: u32,

    /// The number of deletions forwarded to the device.
    pub items_deleted: u32,

    /// The number of item bodies fetched from the mailbox.
    pub items_fetched: u32,

    /// The number of client changes written back to the mailbox.
    pub applied: u32,

    /// The number of client changes discarded by the server-wins
    /// policy.
    pub discarded: u32,

    /// The number of server deltas suppressed by the client-wins
    /// policy.
    pub suppressed: u32,

    /// The number of client changes applied as new items by the
    /// duplicate policy.
    pub duplicated: u32,

    /// The number of items skipped because they exceed the server
    /// max item size.
    pub skipped_too_large: u32,

    /// The number of client changes refused because the exchange ran
    /// over its write-back byte quota.
    pub skipped_over_quota: u32,

    /// The number of items excluded by the folder filter window.
    pub filtered: u32,
}
