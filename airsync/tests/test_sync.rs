use std::sync::Arc;

use airsync::{
    config::SyncConfig,
    cursor::Cursor,
    engine::{
        Command, CommandResponse, Error, ItemMove, RequestContext, SyncEngine, SyncOptions,
    },
    feed::{ChangeFeed, ChangeKind},
    folder::{ConflictResolution, FilterWindow, FolderKind},
    item::sync::{ClientChange, ClientPayload},
    mailbox::{InMemoryMailbox, MailboxStorage, SearchQuery},
};
use chrono::{Duration, Utc};

async fn server() -> (SyncEngine, Arc<InMemoryMailbox>, String) {
    server_with(SyncConfig::default()).await
}

async fn server_with(config: SyncConfig) -> (SyncEngine, Arc<InMemoryMailbox>, String) {
    let feed = Arc::new(ChangeFeed::default());
    let mailbox = Arc::new(InMemoryMailbox::new(feed.clone()));
    let engine = SyncEngine::new(config, mailbox.clone(), feed);
    let inbox = mailbox
        .create_folder("alice", "INBOX", FolderKind::Inbox, None)
        .await;
    (engine, mailbox, inbox)
}

fn ctx() -> RequestContext {
    RequestContext::new("alice", "dev1")
        .with_client_ip("10.0.0.1")
        .with_user_agent("Apple-iPhone15C3/2001.300")
}

/// Run the initial folder sync and return the device folder id
/// mirroring the given mailbox folder.
async fn map_folder(engine: &SyncEngine, ctx: &RequestContext, mailbox_folder: &str) -> String {
    let report = engine.folder_sync(ctx, Cursor::INITIAL).await.unwrap();
    report
        .added
        .iter()
        .find(|folder| folder.mailbox_folder_id == mailbox_folder)
        .map(|folder| folder.folder_id.clone())
        .unwrap()
}

fn client_change(kind: ChangeKind, item_id: &str, body: &[u8]) -> ClientChange {
    ClientChange {
        kind,
        item_id: item_id.into(),
        payload: match kind {
            ChangeKind::Deleted => None,
            _ => Some(ClientPayload {
                subject: format!("client {item_id}"),
                body: body.to_vec(),
            }),
        },
    }
}

#[test_log::test(tokio::test)]
async fn initial_folder_sync_returns_the_full_tree() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    mailbox
        .create_folder("alice", "Sent", FolderKind::Sent, None)
        .await;

    let report = engine.folder_sync(&ctx, Cursor::INITIAL).await.unwrap();

    assert_eq!(report.added.len(), 2);
    assert!(report.changed.is_empty());
    assert!(report.deleted.is_empty());
    assert!(report.cursor > Cursor::INITIAL);
    assert!(report
        .added
        .iter()
        .any(|folder| folder.mailbox_folder_id == inbox && folder.kind == FolderKind::Inbox));

    // a stale client retry of the same exchange gets the identical
    // answer back
    let replayed = engine.folder_sync(&ctx, Cursor::INITIAL).await.unwrap();
    assert_eq!(replayed, report);
}

#[test_log::test(tokio::test)]
async fn folder_renames_and_deletes_reach_the_device() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let archive = mailbox
        .create_folder("alice", "Archive", FolderKind::Custom, None)
        .await;

    let report = engine.folder_sync(&ctx, Cursor::INITIAL).await.unwrap();
    let archive_mapping = report
        .added
        .iter()
        .find(|folder| folder.mailbox_folder_id == archive)
        .unwrap()
        .folder_id
        .clone();
    let inbox_mapping = report
        .added
        .iter()
        .find(|folder| folder.mailbox_folder_id == inbox)
        .unwrap()
        .folder_id
        .clone();

    mailbox.rename_folder(&archive, "Archive 2026").await;
    let report = engine.folder_sync(&ctx, report.cursor).await.unwrap();
    assert_eq!(report.changed.len(), 1);
    assert_eq!(report.changed[0].folder_id, archive_mapping);
    assert_eq!(report.changed[0].name, "Archive 2026");

    mailbox.delete_folder(&archive).await;
    let report = engine.folder_sync(&ctx, report.cursor).await.unwrap();
    assert_eq!(report.deleted, vec![archive_mapping.clone()]);

    // the deleted mapping is gone for content sync too
    let err = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: archive_mapping,
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FolderError(_)));

    // the untouched inbox mapping still works
    engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: inbox_mapping,
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn content_sync_drains_the_feed_and_replays_idempotently() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    for n in 1..=3 {
        mailbox
            .deliver(&inbox, &format!("mail {n}"), b"hello")
            .await;
    }

    let response = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: folder_id.clone(),
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.added.len(), 3);
    assert!(response.cursor > Cursor::INITIAL);
    assert!(!response.more_available);

    // the stale retry of the very same request returns the very same
    // response, with no second mailbox side effect
    let replayed = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: folder_id.clone(),
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(replayed, response);
    assert_eq!(mailbox.item_ids(&inbox).await.len(), 3);

    // nothing new: the next window is empty and keeps the cursor
    let empty = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: response.cursor,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(empty.added.is_empty());
    assert_eq!(empty.cursor, response.cursor);

    // the empty poll must not shadow the recorded exchange: a late
    // retry of the original request still gets the original answer
    let late_retry = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: empty.folder_id,
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(late_retry, response);
}

#[test_log::test(tokio::test)]
async fn windows_are_paged_with_more_available() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    for n in 1..=5 {
        mailbox.deliver(&inbox, &format!("mail {n}"), b"x").await;
    }

    let mut cursor = Cursor::INITIAL;
    let mut seen = Vec::new();
    let mut pages = 0;
    loop {
        let response = engine
            .sync(
                &ctx,
                SyncOptions {
                    folder_id: folder_id.clone(),
                    cursor,
                    max_items: Some(2),
                    ..SyncOptions::default()
                },
            )
            .await
            .unwrap();
        seen.extend(response.added.iter().map(|item| item.id.clone()));
        cursor = response.cursor;
        pages += 1;
        if !response.more_available {
            break;
        }
    }

    assert_eq!(pages, 3);
    assert_eq!(seen.len(), 5);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 5, "paging must not duplicate items");
}

#[test_log::test(tokio::test)]
async fn server_wins_discards_the_client_version() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    let item = mailbox.deliver(&inbox, "original", b"server v1").await;
    let drained = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: folder_id.clone(),
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    // both sides now change the same item
    mailbox.update_item(&inbox, &item, "original", b"server v2").await;
    let response = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: drained.cursor,
                client_changes: vec![client_change(ChangeKind::Changed, &item, b"client v2")],
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    // the device receives the server version, its own change is gone
    assert_eq!(response.changed.len(), 1);
    assert_eq!(response.changed[0].body, b"server v2");
    assert!(response.applied.is_empty());
    assert_eq!(response.report.discarded, 1);

    let stored = mailbox.fetch_item(&inbox, &item).await.unwrap().unwrap();
    assert_eq!(stored.body, b"server v2");
}

#[test_log::test(tokio::test)]
async fn client_wins_suppresses_the_server_delta() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;
    engine
        .folder_table()
        .update(&ctx.device_id, &folder_id, |folder| {
            folder.conflict_resolution = ConflictResolution::ClientWins;
        })
        .await
        .unwrap();

    let item = mailbox.deliver(&inbox, "original", b"server v1").await;
    let drained = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: folder_id.clone(),
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    mailbox.update_item(&inbox, &item, "original", b"server v2").await;
    let response = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: drained.cursor,
                client_changes: vec![client_change(ChangeKind::Changed, &item, b"client v2")],
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    // the server delta is absent from the response, the client
    // version overwrote the mailbox
    assert!(response.changed.is_empty());
    assert_eq!(response.report.suppressed, 1);
    assert_eq!(response.applied.len(), 1);

    let stored = mailbox.fetch_item(&inbox, &item).await.unwrap().unwrap();
    assert_eq!(stored.body, b"client v2");
}

#[test_log::test(tokio::test)]
async fn duplicate_keeps_both_versions() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;
    engine
        .folder_table()
        .update(&ctx.device_id, &folder_id, |folder| {
            folder.conflict_resolution = ConflictResolution::Duplicate;
        })
        .await
        .unwrap();

    let item = mailbox.deliver(&inbox, "original", b"server v1").await;
    let drained = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: folder_id.clone(),
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    mailbox.update_item(&inbox, &item, "original", b"server v2").await;
    let response = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: drained.cursor,
                client_changes: vec![client_change(ChangeKind::Changed, &item, b"client v2")],
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    // server version forwarded, client version landed as a new item
    assert_eq!(response.changed.len(), 1);
    assert_eq!(response.changed[0].body, b"server v2");
    assert_eq!(response.report.duplicated, 1);
    assert_eq!(response.applied.len(), 1);
    assert_ne!(response.applied[0].server_id, item);
    assert_eq!(mailbox.item_ids(&inbox).await.len(), 2);
}

#[test_log::test(tokio::test)]
async fn concurrent_syncs_agree_on_one_outcome() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    for n in 1..=3 {
        mailbox.deliver(&inbox, &format!("mail {n}"), b"x").await;
    }

    let options = SyncOptions {
        folder_id: folder_id.clone(),
        cursor: Cursor::INITIAL,
        ..SyncOptions::default()
    };
    let (first, second) = tokio::join!(
        engine.sync(&ctx, options.clone()),
        engine.sync(&ctx, options.clone()),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    // the loser recovered internally and saw the winner's response,
    // no duplicate deltas
    assert_eq!(first, second);
    assert_eq!(first.added.len(), 3);

    let after = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: first.cursor,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(after.added.is_empty());
}

#[test_log::test(tokio::test)]
async fn client_adds_are_mapped_and_not_echoed() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    let response = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: folder_id.clone(),
                cursor: Cursor::INITIAL,
                client_changes: vec![client_change(ChangeKind::Added, "tmp1", b"draft")],
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.applied.len(), 1);
    assert_eq!(response.applied[0].client_id, "tmp1");
    let server_id = response.applied[0].server_id.clone();
    assert!(mailbox
        .fetch_item(&inbox, &server_id)
        .await
        .unwrap()
        .is_some());

    // the device never receives its own change back
    let next = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: response.cursor,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(next.added.is_empty());
    assert!(next.changed.is_empty());
}

#[test_log::test(tokio::test)]
async fn filter_window_excludes_old_items() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;
    engine
        .folder_table()
        .update(&ctx.device_id, &folder_id, |folder| {
            folder.filter_window = FilterWindow::OneWeek;
        })
        .await
        .unwrap();

    mailbox
        .deliver_at(&inbox, "ancient", b"x", Utc::now() - Duration::days(30))
        .await;
    mailbox.deliver(&inbox, "fresh", b"x").await;

    let response = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.added.len(), 1);
    assert_eq!(response.added[0].subject, "fresh");
    assert_eq!(response.report.filtered, 1);
}

#[test_log::test(tokio::test)]
async fn bodies_are_truncated_to_the_folder_limit() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;
    engine
        .folder_table()
        .update(&ctx.device_id, &folder_id, |folder| {
            folder.truncation_size = Some(4);
        })
        .await
        .unwrap();

    mailbox.deliver(&inbox, "big", b"0123456789").await;

    let response = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    let item = &response.added[0];
    assert_eq!(item.body, b"0123");
    assert!(item.truncated);
    assert_eq!(item.size, 10);
}

#[test_log::test(tokio::test)]
async fn oversized_items_surface_as_partial_success() {
    let config = SyncConfig {
        max_item_size: 8,
        ..SyncConfig::default()
    };
    let (engine, mailbox, inbox) = server_with(config).await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    mailbox.deliver(&inbox, "small", b"ok").await;
    mailbox
        .deliver(&inbox, "huge", b"way too large for this server")
        .await;

    let response = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.added.len(), 1);
    assert_eq!(response.report.skipped_too_large, 1);
    assert_eq!(response.status, airsync::audit::SyncStatus::PartialSuccess);
}

#[test_log::test(tokio::test)]
async fn client_changes_over_quota_are_flagged_back() {
    let config = SyncConfig {
        max_client_bytes_per_sync: 10,
        ..SyncConfig::default()
    };
    let (engine, mailbox, inbox) = server_with(config).await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    let response = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: Cursor::INITIAL,
                client_changes: vec![
                    client_change(ChangeKind::Added, "tmp1", b"12345678"),
                    client_change(ChangeKind::Added, "tmp2", b"12345678"),
                ],
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    // the first change fit, the second ran over the quota
    assert_eq!(response.applied.len(), 1);
    assert_eq!(response.report.skipped_over_quota, 1);
    assert_eq!(response.status, airsync::audit::SyncStatus::PartialSuccess);
    assert_eq!(mailbox.item_ids(&inbox).await.len(), 1);
}

#[test_log::test(tokio::test)]
async fn stale_and_unknown_cursors_are_distinct_errors() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    let mut cursor = Cursor::INITIAL;
    for n in 1..=3 {
        mailbox.deliver(&inbox, &format!("mail {n}"), b"x").await;
        cursor = engine
            .sync(
                &ctx,
                SyncOptions {
                    folder_id: folder_id.clone(),
                    cursor,
                    ..SyncOptions::default()
                },
            )
            .await
            .unwrap()
            .cursor;
    }

    // once valid, now superseded beyond the replay window
    let err = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: folder_id.clone(),
                cursor: Cursor::from(1),
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StaleCursorError(..)));

    // never issued
    let err = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: folder_id.clone(),
                cursor: Cursor::from(99),
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCursorError(..)));

    // both instruct a restart from zero, which re-serves everything
    let restarted = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(restarted.added.len(), 3);
    assert!(restarted.cursor > cursor);
}

#[test_log::test(tokio::test)]
async fn audit_trail_reconciles_with_the_cursor_store() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    mailbox.deliver(&inbox, "mail", b"x").await;
    let response = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: folder_id.clone(),
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    let entry = engine
        .audit_log()
        .last_for_folder(&ctx.device_id, &folder_id)
        .await
        .unwrap();
    assert_eq!(entry.cursor_in, Some(Cursor::INITIAL));
    assert_eq!(entry.cursor_out, Some(response.cursor));
    assert_eq!(entry.items_added, 1);
    assert!(entry.status.is_success());
    assert_eq!(entry.client_ip.as_deref(), Some("10.0.0.1"));
    assert!(entry.session_id.is_some());
}

#[test_log::test(tokio::test)]
async fn item_estimate_counts_without_advancing() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    for n in 1..=4 {
        mailbox.deliver(&inbox, &format!("mail {n}"), b"x").await;
    }

    let estimate = engine
        .item_estimate(&ctx, &folder_id, Cursor::INITIAL)
        .await
        .unwrap();
    assert_eq!(estimate.pending, 4);

    // estimating twice is free of side effects
    let estimate = engine
        .item_estimate(&ctx, &folder_id, Cursor::INITIAL)
        .await
        .unwrap();
    assert_eq!(estimate.pending, 4);

    let response = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id: folder_id.clone(),
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.added.len(), 4);

    let estimate = engine
        .item_estimate(&ctx, &folder_id, response.cursor)
        .await
        .unwrap();
    assert_eq!(estimate.pending, 0);
}

#[test_log::test(tokio::test)]
async fn move_items_report_per_item_outcomes() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let archive = mailbox
        .create_folder("alice", "Archive", FolderKind::Custom, None)
        .await;
    let report = engine.folder_sync(&ctx, Cursor::INITIAL).await.unwrap();
    let inbox_mapping = report
        .added
        .iter()
        .find(|folder| folder.mailbox_folder_id == inbox)
        .unwrap()
        .folder_id
        .clone();
    let archive_mapping = report
        .added
        .iter()
        .find(|folder| folder.mailbox_folder_id == archive)
        .unwrap()
        .folder_id
        .clone();

    let item = mailbox.deliver(&inbox, "mail", b"x").await;

    let response = engine
        .move_items(
            &ctx,
            vec![
                ItemMove {
                    item_id: item.clone(),
                    from_folder_id: inbox_mapping.clone(),
                    to_folder_id: archive_mapping.clone(),
                },
                ItemMove {
                    item_id: "ghost".into(),
                    from_folder_id: inbox_mapping,
                    to_folder_id: "nowhere".into(),
                },
            ],
        )
        .await
        .unwrap();

    assert_eq!(response.status, airsync::audit::SyncStatus::PartialSuccess);
    assert_eq!(response.moves.len(), 2);
    assert!(response.moves[0].error.is_none());
    assert!(response.moves[1].error.is_some());
    assert!(mailbox.fetch_item(&inbox, &item).await.unwrap().is_none());
    assert_eq!(mailbox.item_ids(&archive).await.len(), 1);
}

#[test_log::test(tokio::test)]
async fn send_mail_passes_through_to_the_mailbox() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    map_folder(&engine, &ctx, &inbox).await;

    engine
        .send_mail(&ctx, b"From: alice@example.com\r\n\r\nhello")
        .await
        .unwrap();

    let outbox = mailbox.outbox().await;
    assert_eq!(outbox.len(), 1);

    let entries = engine.audit_log().for_device(&ctx.device_id).await;
    let entry = entries
        .iter()
        .rev()
        .find(|entry| entry.command == airsync::audit::SyncCommand::SendMail)
        .unwrap();
    assert_eq!(entry.bytes_received, outbox[0].len() as u64);
}

#[test_log::test(tokio::test)]
async fn search_is_bounded_and_audited() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    map_folder(&engine, &ctx, &inbox).await;

    mailbox.deliver(&inbox, "quarterly report", b"numbers").await;
    mailbox.deliver(&inbox, "lunch", b"tacos").await;

    let response = engine
        .search(
            &ctx,
            SearchQuery {
                folder_id: None,
                text: "report".into(),
                max_results: 10,
            },
        )
        .await
        .unwrap();

    assert_eq!(response.items.len(), 1);
    assert_eq!(response.items[0].subject, "quarterly report");
}

#[test_log::test(tokio::test)]
async fn settings_clamp_device_knobs() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    map_folder(&engine, &ctx, &inbox).await;
    drop(mailbox);

    let response = engine
        .settings(
            &ctx,
            airsync::engine::SettingsRequest {
                heartbeat_interval_secs: Some(10),
                max_items_per_sync: Some(100_000),
            },
        )
        .await
        .unwrap();

    assert_eq!(response.device.heartbeat_interval_secs, 60);
    assert_eq!(response.device.max_items_per_sync, 500);
}

#[test_log::test(tokio::test)]
async fn blocked_devices_are_denied_with_a_reason() {
    let (engine, _mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    engine
        .registry()
        .block(&ctx.device_id, "lost device")
        .await
        .unwrap();

    let err = engine
        .sync(
            &ctx,
            SyncOptions {
                folder_id,
                cursor: Cursor::INITIAL,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeviceDeniedError(..)));

    let entries = engine.audit_log().for_device(&ctx.device_id).await;
    assert_eq!(
        entries.last().unwrap().status,
        airsync::audit::SyncStatus::AuthenticationError
    );
}

#[test_log::test(tokio::test)]
async fn unknown_devices_must_start_with_an_initial_folder_sync() {
    let (engine, _mailbox, _inbox) = server().await;
    let ctx = ctx();

    // a non-initial cursor from a device nobody registered is a
    // protocol error
    let err = engine.folder_sync(&ctx, Cursor::from(5)).await.unwrap_err();
    assert!(matches!(err, Error::DeviceError(_)));

    // the initial folder sync registers on the fly
    let report = engine.folder_sync(&ctx, Cursor::INITIAL).await.unwrap();
    assert_eq!(report.added.len(), 1);
    let device = engine.registry().get(&ctx.device_id).await.unwrap();
    assert_eq!(device.device_type.as_deref(), Some("iPhone"));
}

#[test_log::test(tokio::test)]
async fn dispatch_covers_the_whole_command_surface() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;
    mailbox.deliver(&inbox, "mail", b"x").await;

    // the pending delta makes the ping return without waiting
    let response = engine
        .dispatch(
            &ctx,
            Command::Ping(airsync::engine::PingOptions {
                folder_ids: vec![folder_id],
                heartbeat_interval_secs: None,
            }),
        )
        .await
        .unwrap();
    assert!(matches!(response, CommandResponse::Ping(_)));

    let err = engine.dispatch(&ctx, Command::ValidateCert).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedCommandError(_)));

    let entries = engine.audit_log().for_device(&ctx.device_id).await;
    assert!(entries
        .iter()
        .any(|entry| entry.command == airsync::audit::SyncCommand::ValidateCert
            && entry.status == airsync::audit::SyncStatus::ClientError));
}
