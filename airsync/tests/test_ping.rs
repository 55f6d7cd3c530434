use std::sync::Arc;

use airsync::{
    config::SyncConfig,
    cursor::Cursor,
    engine::{Error, PingOptions, RequestContext, SyncEngine, SyncOptions},
    feed::ChangeFeed,
    folder::FolderKind,
    mailbox::InMemoryMailbox,
    ping::PingOutcome,
};

async fn server() -> (Arc<SyncEngine>, Arc<InMemoryMailbox>, String) {
    let feed = Arc::new(ChangeFeed::default());
    let mailbox = Arc::new(InMemoryMailbox::new(feed.clone()));
    let engine = Arc::new(SyncEngine::new(
        SyncConfig::default(),
        mailbox.clone(),
        feed,
    ));
    let inbox = mailbox
        .create_folder("alice", "INBOX", FolderKind::Inbox, None)
        .await;
    (engine, mailbox, inbox)
}

fn ctx() -> RequestContext {
    RequestContext::new("alice", "dev1").with_client_ip("10.0.0.1")
}

async fn map_folder(engine: &SyncEngine, ctx: &RequestContext, mailbox_folder: &str) -> String {
    let report = engine.folder_sync(ctx, Cursor::INITIAL).await.unwrap();
    report
        .added
        .iter()
        .find(|folder| folder.mailbox_folder_id == mailbox_folder)
        .map(|folder| folder.folder_id.clone())
        .unwrap()
}

#[test_log::test(tokio::test(start_paused = true))]
async fn ping_wakes_on_a_watched_folder_change() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    let waiter = {
        let engine = engine.clone();
        let ctx = ctx.clone();
        let folder_id = folder_id.clone();
        tokio::spawn(async move {
            engine
                .ping(
                    &ctx,
                    PingOptions {
                        folder_ids: vec![folder_id],
                        heartbeat_interval_secs: Some(600),
                    },
                )
                .await
        })
    };
    tokio::task::yield_now().await;

    mailbox.deliver(&inbox, "new mail", b"x").await;

    let response = waiter.await.unwrap().unwrap();
    assert_eq!(response.outcome, PingOutcome::Changed(vec![folder_id]));
    assert_eq!(response.heartbeat_interval_secs, 600);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn ping_times_out_with_no_changes() {
    let (engine, _mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    let response = engine
        .ping(
            &ctx,
            PingOptions {
                folder_ids: vec![folder_id],
                heartbeat_interval_secs: Some(120),
            },
        )
        .await
        .unwrap();

    assert_eq!(response.outcome, PingOutcome::NoChanges);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn ping_ignores_changes_in_unwatched_folders() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let spam = mailbox
        .create_folder("alice", "Spam", FolderKind::Spam, None)
        .await;
    let report = engine.folder_sync(&ctx, Cursor::INITIAL).await.unwrap();
    let inbox_mapping = report
        .added
        .iter()
        .find(|folder| folder.mailbox_folder_id == inbox)
        .unwrap()
        .folder_id
        .clone();

    let waiter = {
        let engine = engine.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            engine
                .ping(
                    &ctx,
                    PingOptions {
                        folder_ids: vec![inbox_mapping],
                        heartbeat_interval_secs: Some(90),
                    },
                )
                .await
        })
    };
    tokio::task::yield_now().await;

    mailbox.deliver(&spam, "viagra", b"x").await;

    let response = waiter.await.unwrap().unwrap();
    assert_eq!(response.outcome, PingOutcome::NoChanges);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn pending_changes_return_without_waiting() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    mailbox.deliver(&inbox, "already there", b"x").await;

    let response = engine
        .ping(
            &ctx,
            PingOptions {
                folder_ids: vec![folder_id.clone()],
                heartbeat_interval_secs: Some(3600),
            },
        )
        .await
        .unwrap();

    assert_eq!(response.outcome, PingOutcome::Changed(vec![folder_id.clone()]));

    // the folder is flagged until the device drains it
    let folder = engine
        .folder_table()
        .get(&ctx.device_id, &folder_id)
        .await
        .unwrap();
    assert!(folder.has_pending_changes);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn a_drained_folder_stops_waking_the_ping() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    mailbox.deliver(&inbox, "mail", b"x").await;
    engine
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

    let response = engine
        .ping(
            &ctx,
            PingOptions {
                folder_ids: vec![folder_id],
                heartbeat_interval_secs: Some(60),
            },
        )
        .await
        .unwrap();

    assert_eq!(response.outcome, PingOutcome::NoChanges);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn a_second_ping_cancels_the_first() {
    let (engine, mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    let first = {
        let engine = engine.clone();
        let ctx = ctx.clone();
        let folder_id = folder_id.clone();
        tokio::spawn(async move {
            engine
                .ping(
                    &ctx,
                    PingOptions {
                        folder_ids: vec![folder_id],
                        heartbeat_interval_secs: Some(3600),
                    },
                )
                .await
        })
    };
    tokio::task::yield_now().await;

    let second = {
        let engine = engine.clone();
        let ctx = ctx.clone();
        let folder_id = folder_id.clone();
        tokio::spawn(async move {
            engine
                .ping(
                    &ctx,
                    PingOptions {
                        folder_ids: vec![folder_id],
                        heartbeat_interval_secs: Some(3600),
                    },
                )
                .await
        })
    };
    tokio::task::yield_now().await;

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.outcome, PingOutcome::Cancelled);

    mailbox.deliver(&inbox, "mail", b"x").await;
    let second = second.await.unwrap().unwrap();
    assert_eq!(second.outcome, PingOutcome::Changed(vec![folder_id]));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn connection_loss_cancels_the_registration() {
    let (engine, _mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    let waiter = {
        let engine = engine.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            engine
                .ping(
                    &ctx,
                    PingOptions {
                        folder_ids: vec![folder_id],
                        heartbeat_interval_secs: Some(3600),
                    },
                )
                .await
        })
    };
    tokio::task::yield_now().await;

    engine.cancel_ping(&ctx.device_id).await;

    let response = waiter.await.unwrap().unwrap();
    assert_eq!(response.outcome, PingOutcome::Cancelled);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn intervals_are_clamped_and_written_back() {
    let (engine, _mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    let response = engine
        .ping(
            &ctx,
            PingOptions {
                folder_ids: vec![folder_id],
                heartbeat_interval_secs: Some(5),
            },
        )
        .await
        .unwrap();

    assert_eq!(response.heartbeat_interval_secs, 60);
    assert_eq!(response.outcome, PingOutcome::NoChanges);

    let device = engine.registry().get(&ctx.device_id).await.unwrap();
    assert_eq!(device.heartbeat_interval_secs, 60);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn a_gated_device_cannot_park_a_ping() {
    let (engine, _mailbox, inbox) = server().await;
    let ctx = ctx();
    let folder_id = map_folder(&engine, &ctx, &inbox).await;

    engine.publish_policy().await;

    let err = engine
        .ping(
            &ctx,
            PingOptions {
                folder_ids: vec![folder_id],
                heartbeat_interval_secs: Some(60),
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PolicyRequiredError(_)));
}
