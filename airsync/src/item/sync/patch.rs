//! Module dedicated to the content synchronization patch.
//!
//! Contains the core reconciliation algorithm of content sync: given
//! the server deltas of a cursor window and the changes submitted by
//! the client, produce the list of hunks to process. It has been
//! exported in a dedicated function so that it can be easily tested.

use std::collections::HashMap;

use crate::{feed::ItemChange, folder::ConflictResolution};

use super::{hunk::ItemSyncHunk, ClientChange};

/// A content synchronization patch is just a list of content
/// synchronization hunks (changes).
pub type ItemSyncPatch = Vec<ItemSyncHunk>;

/// Content synchronization patch builder.
///
/// Server deltas and client changes touching different items pass
/// through untouched; an item touched by both sides since the last
/// cursor resolves through the folder conflict policy. The outcome is
/// deterministic given identical inputs: server deltas are visited in
/// feed order, then client changes in submission order.
pub fn build(
    server: &[ItemChange],
    client: &[ClientChange],
    policy: ConflictResolution,
) -> ItemSyncPatch {
    let client_by_item: HashMap<&str, &ClientChange> = client
        .iter()
        .map(|change| (change.item_id.as_str(), change))
        .collect();

    let mut patch = ItemSyncPatch::default();

    for server_change in server {
        match client_by_item.get(server_change.item_id.as_str()) {
            None => patch.push(ItemSyncHunk::Forward(server_change.clone())),
            Some(client_change) => match policy {
                ConflictResolution::ServerWins => {
                    patch.push(ItemSyncHunk::Discard(
                        (*client_change).clone(),
                        server_change.clone(),
                    ));
                    patch.push(ItemSyncHunk::Forward(server_change.clone()));
                }
                ConflictResolution::ClientWins => {
                    patch.push(ItemSyncHunk::Apply((*client_change).clone()));
                    patch.push(ItemSyncHunk::Suppress(
                        server_change.clone(),
                        (*client_change).clone(),
                    ));
                }
                ConflictResolution::Duplicate => {
                    patch.push(ItemSyncHunk::ApplyAsNew((*client_change).clone()));
                    patch.push(ItemSyncHunk::Forward(server_change.clone()));
                }
            },
        }
    }

    let conflicted: HashMap<&str, ()> = server
        .iter()
        .filter(|change| client_by_item.contains_key(change.item_id.as_str()))
        .map(|change| (change.item_id.as_str(), ()))
        .collect();

    for client_change in client {
        if !conflicted.contains_key(client_change.item_id.as_str()) {
            patch.push(ItemSyncHunk::Apply(client_change.clone()));
        }
    }

    patch
}
