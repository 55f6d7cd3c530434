//! # Sync engine
//!
//! Module dedicated to the protocol engine itself: the single
//! dispatch surface every device request goes through.
//!
//! Control flow per request: the device registry gate first, then the
//! wipe directive and policy intercepts, then the command handler.
//! Content handlers read the cursor store and the change feed, apply
//! conflict resolution, advance cursors and append an audit entry,
//! all inside the per-scope commit section so the cursor store and
//! the audit trail can never diverge.

mod error;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use futures::{stream::FuturesOrdered, StreamExt};
use tracing::{debug, trace};

use crate::{
    audit::{AuditLog, SyncCommand, SyncLogEntry, SyncStatus},
    config::SyncConfig,
    cursor::{Cursor, CursorCheck, CursorScope, CursorStore},
    device::{
        registry::Authorization, AccountId, DenyReason, Device, DeviceId, DeviceInfo,
        DeviceRegistry,
    },
    feed::{ChangeFeed, ChangeKind},
    folder::{
        self,
        sync::{FolderSyncHunk, FolderSyncReport},
        DeviceFolder, FolderId, FolderTable,
    },
    item::{
        self,
        sync::{AppliedChange, ClientChange, ItemSyncHunk, ItemSyncReport},
        ItemId, SyncItem,
    },
    mailbox::{MailboxStorage, SearchQuery},
    ping::{PingCoordinator, PingOutcome},
    provision::{PolicyKey, ProvisionCoordinator},
};

#[doc(inline)]
pub use self::error::{Error, Result};

/// The per-request context resolved by the transport: an
/// already-authenticated (account, device) pair plus connection
/// metadata for the audit trail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestContext {
    pub account_id: AccountId,
    pub device_id: DeviceId,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
}

impl RequestContext {
    pub fn new(account_id: impl Into<AccountId>, device_id: impl Into<DeviceId>) -> Self {
        Self {
            account_id: account_id.into(),
            device_id: device_id.into(),
            client_ip: None,
            user_agent: None,
            session_id: None,
        }
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// The content sync request options.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncOptions {
    pub folder_id: FolderId,
    pub cursor: Cursor,

    /// Client-side changes for two-way sync.
    pub client_changes: Vec<ClientChange>,

    /// Client window size; the engine caps it with the device and
    /// server limits.
    pub max_items: Option<u32>,

    /// Overrides the folder truncation size for this exchange.
    pub truncation_size: Option<u32>,
}

/// The content sync response.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncResponse {
    pub folder_id: FolderId,

    /// The cursor the device must present next.
    pub cursor: Cursor,

    pub added: Vec<SyncItem>,
    pub changed: Vec<SyncItem>,
    pub deleted: Vec<ItemId>,

    /// The client-to-server identifier mapping of applied changes.
    pub applied: Vec<AppliedChange>,

    /// More deltas remain: the client should re-issue immediately
    /// rather than wait for the next heartbeat.
    pub more_available: bool,

    pub status: SyncStatus,
    pub report: ItemSyncReport,
}

/// The heartbeat request options.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingOptions {
    /// The device folders to watch.
    pub folder_ids: Vec<FolderId>,

    /// Client-suggested interval, clamped server-side.
    pub heartbeat_interval_secs: Option<u32>,
}

/// The heartbeat response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PingResponse {
    /// The outcome, with changed folders named by their device-facing
    /// identifiers.
    pub outcome: PingOutcome,

    /// The interval that was actually enforced.
    pub heartbeat_interval_secs: u32,
}

/// The provisioning handshake request.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionRequest {
    /// The policy key the device acknowledges, if any.
    pub acknowledge: Option<PolicyKey>,

    /// Set when the device confirms local erasure after a remote wipe
    /// directive.
    pub acknowledge_wipe: bool,
}

/// The provisioning handshake response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisionResponse {
    /// The device must acknowledge the given policy key before
    /// syncing content.
    PolicyOffered(PolicyKey),

    /// The acknowledgment was recorded, the device may sync.
    Acknowledged,

    /// No policy is published, the device is unconstrained.
    NoPolicy,

    /// The wipe acknowledgment was recorded, the record is now inert.
    WipeAcknowledged,
}

/// The item estimate response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ItemEstimateResponse {
    pub folder_id: FolderId,

    /// The number of deltas a content sync from the presented cursor
    /// would have to drain.
    pub pending: u32,
}

/// One requested item move.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ItemMove {
    pub item_id: ItemId,
    pub from_folder_id: FolderId,
    pub to_folder_id: FolderId,
}

/// The per-item outcome of a move request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MoveResult {
    pub item_id: ItemId,

    /// The identifier of the item in the target folder, when the move
    /// succeeded.
    pub new_item_id: Option<ItemId>,

    pub error: Option<String>,
}

/// The move items response: per-item outcomes, partial success when
/// only some moves landed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MoveItemsResponse {
    pub moves: Vec<MoveResult>,
    pub status: SyncStatus,
}

/// The search response.
#[derive(Clone, Debug)]
pub struct SearchResponse {
    pub items: Vec<SyncItem>,
}

/// The settings request: per-device knobs a client may adjust.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SettingsRequest {
    pub heartbeat_interval_secs: Option<u32>,
    pub max_items_per_sync: Option<u32>,
}

/// The settings response.
#[derive(Clone, Debug)]
pub struct SettingsResponse {
    pub device: Device,
}

/// One protocol command, as decoded by the transport.
#[derive(Clone, Debug)]
pub enum Command {
    FolderSync { cursor: Cursor },
    Sync(SyncOptions),
    Ping(PingOptions),
    Provision(ProvisionRequest),
    Settings(SettingsRequest),
    ItemEstimate { folder_id: FolderId, cursor: Cursor },
    MoveItems { moves: Vec<ItemMove> },
    Search(SearchQuery),
    SendMail { message: Vec<u8> },
    SmartReply { message: Vec<u8> },
    SmartForward { message: Vec<u8> },
    MeetingResponse,
    ResolveRecipients,
    ValidateCert,
}

impl Command {
    /// Return the audit command of the request.
    pub fn kind(&self) -> SyncCommand {
        match self {
            Self::FolderSync { .. } => SyncCommand::FolderSync,
            Self::Sync(_) => SyncCommand::Sync,
            Self::Ping(_) => SyncCommand::Ping,
            Self::Provision(_) => SyncCommand::Provision,
            Self::Settings(_) => SyncCommand::Settings,
            Self::ItemEstimate { .. } => SyncCommand::ItemEstimate,
            Self::MoveItems { .. } => SyncCommand::MoveItems,
            Self::Search(_) => SyncCommand::Search,
            Self::SendMail { .. } => SyncCommand::SendMail,
            Self::SmartReply { .. } => SyncCommand::SmartReply,
            Self::SmartForward { .. } => SyncCommand::SmartForward,
            Self::MeetingResponse => SyncCommand::MeetingResponse,
            Self::ResolveRecipients => SyncCommand::ResolveRecipients,
            Self::ValidateCert => SyncCommand::ValidateCert,
        }
    }
}

/// One protocol response.
#[derive(Clone, Debug)]
pub enum CommandResponse {
    FolderSync(FolderSyncReport),
    Sync(SyncResponse),
    Ping(PingResponse),
    Provision(ProvisionResponse),
    Settings(SettingsResponse),
    ItemEstimate(ItemEstimateResponse),
    MoveItems(MoveItemsResponse),
    Search(SearchResponse),

    /// The message was accepted for delivery.
    Sent,

    /// The device must erase its local data and acknowledge through
    /// the provisioning handshake. Substitutes the normal response of
    /// whatever command was issued.
    RemoteWipe,
}

/// The synchronization protocol engine.
pub struct SyncEngine {
    config: SyncConfig,
    devices: Arc<DeviceRegistry>,
    folders: Arc<FolderTable>,
    cursors: Arc<CursorStore>,
    feed: Arc<ChangeFeed>,
    audit: Arc<AuditLog>,
    ping: PingCoordinator,
    provision: ProvisionCoordinator,
    mailbox: Arc<dyn MailboxStorage>,

    commit_locks: tokio::sync::Mutex<HashMap<(DeviceId, CursorScope), Arc<tokio::sync::Mutex<()>>>>,
    sync_replays: tokio::sync::RwLock<HashMap<(DeviceId, FolderId), SyncResponse>>,
    folder_replays: tokio::sync::RwLock<HashMap<DeviceId, FolderSyncReport>>,

    next_folder_id: AtomicU64,
    next_session_id: AtomicU64,
}

impl SyncEngine {
    /// Create a new engine over the given mailbox collaborator and
    /// change feed. The feed must be the one the mailbox appends to.
    pub fn new(config: SyncConfig, mailbox: Arc<dyn MailboxStorage>, feed: Arc<ChangeFeed>) -> Self {
        Self {
            config,
            devices: Arc::new(DeviceRegistry::new()),
            folders: Arc::new(FolderTable::new()),
            cursors: Arc::new(CursorStore::new()),
            ping: PingCoordinator::new(feed.clone()),
            provision: ProvisionCoordinator::new(),
            audit: Arc::new(AuditLog::new()),
            feed,
            mailbox,
            commit_locks: tokio::sync::Mutex::new(HashMap::default()),
            sync_replays: tokio::sync::RwLock::new(HashMap::default()),
            folder_replays: tokio::sync::RwLock::new(HashMap::default()),
            next_folder_id: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// The device registry, exposed for the administrative surface
    /// (block, allow, wipe request, status queries).
    pub fn registry(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// The per-device folder table.
    pub fn folder_table(&self) -> &FolderTable {
        &self.folders
    }

    /// The audit trail, exposed for the administrative surface.
    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// The provisioning coordinator, exposed so administrators can
    /// publish policies.
    pub fn provisioning(&self) -> &ProvisionCoordinator {
        &self.provision
    }

    /// Publish a new security policy, forcing every device through
    /// the handshake again.
    pub async fn publish_policy(&self) -> crate::provision::SecurityPolicy {
        self.provision.publish(&self.devices).await
    }

    /// Cancel the outstanding ping of a device. Called by the
    /// transport when the underlying connection closes.
    pub async fn cancel_ping(&self, device_id: &str) {
        self.ping.cancel(device_id).await;
    }

    /// Dispatch one decoded protocol command.
    ///
    /// A pending remote wipe substitutes the wipe directive for the
    /// normal response of any command but the acknowledging
    /// provisioning handshake.
    pub async fn dispatch(&self, ctx: &RequestContext, command: Command) -> Result<CommandResponse> {
        let kind = command.kind();
        let result = match command {
            Command::FolderSync { cursor } => self
                .folder_sync(ctx, cursor)
                .await
                .map(CommandResponse::FolderSync),
            Command::Sync(options) => self.sync(ctx, options).await.map(CommandResponse::Sync),
            Command::Ping(options) => self.ping(ctx, options).await.map(CommandResponse::Ping),
            Command::Provision(request) => self
                .provision(ctx, request)
                .await
                .map(CommandResponse::Provision),
            Command::Settings(request) => self
                .settings(ctx, request)
                .await
                .map(CommandResponse::Settings),
            Command::ItemEstimate { folder_id, cursor } => self
                .item_estimate(ctx, &folder_id, cursor)
                .await
                .map(CommandResponse::ItemEstimate),
            Command::MoveItems { moves } => self
                .move_items(ctx, moves)
                .await
                .map(CommandResponse::MoveItems),
            Command::Search(query) => self.search(ctx, query).await.map(CommandResponse::Search),
            Command::SendMail { message } => self
                .send_mail(ctx, &message)
                .await
                .map(|()| CommandResponse::Sent),
            Command::SmartReply { message } => self
                .smart_reply(ctx, &message)
                .await
                .map(|()| CommandResponse::Sent),
            Command::SmartForward { message } => self
                .smart_forward(ctx, &message)
                .await
                .map(|()| CommandResponse::Sent),
            Command::MeetingResponse | Command::ResolveRecipients | Command::ValidateCert => {
                self.unsupported_command(ctx, kind).await
            }
        };

        match result {
            Err(Error::RemoteWipeRequestedError(_)) => Ok(CommandResponse::RemoteWipe),
            other => other,
        }
    }

    /// Register a device for the account of the request, idempotently.
    pub async fn register_device(&self, ctx: &RequestContext, info: DeviceInfo) -> Result<Device> {
        let started = Instant::now();
        let result = self.register_inner(ctx, info).await;

        match &result {
            Ok(device) => {
                let mut entry = self.base_entry(ctx, SyncCommand::Provision);
                entry.policy_key = device.policy.key().cloned();
                entry.processing_time_ms = started.elapsed().as_millis() as u64;
                self.audit.append(entry).await;
            }
            Err(err) => {
                self.audit_failure(ctx, SyncCommand::Provision, None, None, err, started)
                    .await
            }
        }

        result
    }

    async fn register_inner(&self, ctx: &RequestContext, mut info: DeviceInfo) -> Result<Device> {
        if info.user_agent.is_none() {
            info.user_agent = ctx.user_agent.clone();
        }
        let device = self
            .devices
            .register(&self.config, ctx.account_id.clone(), ctx.device_id.clone(), info)
            .await?;

        // an already published policy constrains new devices right away
        if let Some(policy) = self.provision.current().await {
            if device.policy.key() != Some(&policy.key) {
                let device = self
                    .devices
                    .update(&ctx.device_id, |device| device.offer_policy(policy.key.clone()))
                    .await?;
                return Ok(device);
            }
        }

        Ok(device)
    }

    /// Synchronize the folder hierarchy of the device.
    ///
    /// With the initial cursor, the full tree is returned as added; a
    /// device unknown to the registry is registered on the fly, the
    /// first-contact path.
    pub async fn folder_sync(&self, ctx: &RequestContext, cursor: Cursor) -> Result<FolderSyncReport> {
        let started = Instant::now();
        let mut attempts = 0u8;
        loop {
            let result = self.folder_sync_attempt(ctx, cursor, started).await;
            match result {
                Err(Error::SyncConflictError(_)) if attempts == 0 => {
                    attempts += 1;
                    continue;
                }
                Err(err) => {
                    self.audit_failure(
                        ctx,
                        SyncCommand::FolderSync,
                        None,
                        Some(cursor),
                        &err,
                        started,
                    )
                    .await;
                    return Err(err);
                }
                ok => return ok,
            }
        }
    }

    async fn folder_sync_attempt(
        &self,
        ctx: &RequestContext,
        from: Cursor,
        started: Instant,
    ) -> Result<FolderSyncReport> {
        // first contact: an unknown device presenting the initial
        // cursor registers on the fly, anything else is a protocol
        // error
        if self.devices.find(&ctx.device_id).await.is_none() {
            if from.is_initial() {
                self.register_inner(ctx, DeviceInfo::default()).await?;
            } else {
                return Err(crate::device::Error::DeviceNotFoundError(ctx.device_id.clone()).into());
            }
        }

        let device = self.gate(ctx, SyncCommand::FolderSync).await?;
        let scope = CursorScope::Hierarchy;

        match self.cursors.check(&ctx.device_id, &scope, from).await {
            CursorCheck::Current => {}
            CursorCheck::Replay => {
                if let Some(recorded) = self.folder_replays.read().await.get(&ctx.device_id) {
                    let recorded = recorded.clone();
                    self.audit_folder_sync(ctx, from, &recorded, started).await;
                    return Ok(recorded);
                }
                return Err(Error::StaleCursorError(scope.to_string(), from));
            }
            CursorCheck::Stale => return Err(Error::StaleCursorError(scope.to_string(), from)),
            CursorCheck::Unknown => return Err(Error::InvalidCursorError(scope.to_string(), from)),
        }

        let snapshot = self
            .mailbox
            .list_folders(&device.account_id)
            .await
            .map_err(Error::MailboxError)?;
        let mappings = self.folders.by_mailbox_folder(&ctx.device_id).await;
        let patch = folder::sync::build(&snapshot, &mappings);

        let lock = self.commit_lock(&ctx.device_id, &scope).await;
        let _guard = lock.lock().await;

        if !matches!(
            self.cursors.check(&ctx.device_id, &scope, from).await,
            CursorCheck::Current
        ) {
            return Err(Error::SyncConflictError(ctx.device_id.clone()));
        }

        let mut report = FolderSyncReport::default();
        let mut device_ids_by_mailbox: HashMap<FolderId, FolderId> = mappings
            .iter()
            .map(|(mailbox_id, folder)| (mailbox_id.clone(), folder.folder_id.clone()))
            .collect();

        for hunk in &patch {
            trace!(device = %ctx.device_id, %hunk, "processing folder hunk");
            match hunk {
                FolderSyncHunk::Create(mailbox_folder) => {
                    let folder_id = format!("f{}", self.next_folder_id.fetch_add(1, Ordering::Relaxed));
                    let mut folder = DeviceFolder::new(
                        folder_id.clone(),
                        mailbox_folder.id.clone(),
                        mailbox_folder.name.clone(),
                        mailbox_folder.kind.clone(),
                    );
                    folder.mailbox_parent_id = mailbox_folder.parent_id.clone();
                    device_ids_by_mailbox.insert(mailbox_folder.id.clone(), folder_id);
                    self.folders.insert(&ctx.device_id, folder.clone()).await;
                    report.added.push(folder);
                }
                FolderSyncHunk::Update(folder_id, mailbox_folder) => {
                    let updated = self
                        .folders
                        .update(&ctx.device_id, folder_id, |folder| {
                            folder.name = mailbox_folder.name.clone();
                            folder.mailbox_parent_id = mailbox_folder.parent_id.clone();
                        })
                        .await?;
                    report.changed.push(updated);
                }
                FolderSyncHunk::Remove(folder_id) => {
                    if let Some(removed) = self.folders.remove(&ctx.device_id, folder_id).await {
                        // cascade: the content cursor of a deleted
                        // folder is invalidated
                        self.cursors
                            .invalidate(
                                &ctx.device_id,
                                &CursorScope::Folder(removed.mailbox_folder_id.clone()),
                            )
                            .await;
                        self.sync_replays
                            .write()
                            .await
                            .remove(&(ctx.device_id.clone(), folder_id.clone()));
                    }
                    report.deleted.push(folder_id.clone());
                }
            }
        }

        // resolve device-facing parent identifiers now that every
        // mapping exists
        for folder in report.added.iter_mut().chain(report.changed.iter_mut()) {
            let parent_id = folder
                .mailbox_parent_id
                .as_ref()
                .and_then(|mailbox_id| device_ids_by_mailbox.get(mailbox_id).cloned());
            if folder.parent_id != parent_id {
                folder.parent_id = parent_id.clone();
                let folder_id = folder.folder_id.clone();
                self.folders
                    .update(&ctx.device_id, &folder_id, |folder| {
                        folder.parent_id = parent_id.clone();
                    })
                    .await?;
            }
        }

        if from.is_initial() {
            // full tree as added, whatever the device already mapped
            report.added = self.folders.list(&ctx.device_id).await;
            report.changed.clear();
            report.deleted.clear();
        }

        let state = self.cursors.state(&ctx.device_id, &scope).await;
        report.cursor = if report.is_empty() {
            from
        } else {
            self.cursors
                .advance(&ctx.device_id, &scope, from, state.position)
                .await
                .map_err(|err| match err {
                    crate::cursor::Error::AdvanceConflictError(_) => {
                        Error::SyncConflictError(ctx.device_id.clone())
                    }
                    err => err.into(),
                })?
        };

        if !report.is_empty() {
            self.folder_replays
                .write()
                .await
                .insert(ctx.device_id.clone(), report.clone());
        }
        self.devices
            .update(&ctx.device_id, |device| {
                device.update_sync_stats(true, ctx.client_ip.as_deref())
            })
            .await?;
        self.audit_folder_sync(ctx, from, &report, started).await;

        Ok(report)
    }

    async fn audit_folder_sync(
        &self,
        ctx: &RequestContext,
        cursor_in: Cursor,
        report: &FolderSyncReport,
        started: Instant,
    ) {
        let mut entry = self.base_entry(ctx, SyncCommand::FolderSync);
        entry.cursor_in = Some(cursor_in);
        entry.cursor_out = Some(report.cursor);
        entry.items_added = report.added.len() as u32;
        entry.items_changed = report.changed.len() as u32;
        entry.items_deleted = report.deleted.len() as u32;
        entry.processing_time_ms = started.elapsed().as_millis() as u64;
        self.audit.append(entry).await;
    }

    /// Synchronize the content of one folder: drain the change feed
    /// window, reconcile client changes, advance the cursor.
    ///
    /// A cursor conflict (a concurrent session won the advance) is
    /// retried once internally and never surfaces to the device.
    pub async fn sync(&self, ctx: &RequestContext, options: SyncOptions) -> Result<SyncResponse> {
        let started = Instant::now();
        let mut attempts = 0u8;
        loop {
            let result = self.sync_attempt(ctx, &options, started).await;
            match result {
                Err(Error::SyncConflictError(_)) if attempts == 0 => {
                    debug!(device = %ctx.device_id, "sync lost a cursor race, retrying");
                    attempts += 1;
                    continue;
                }
                Err(err) => {
                    self.audit_failure(
                        ctx,
                        SyncCommand::Sync,
                        Some(&options.folder_id),
                        Some(options.cursor),
                        &err,
                        started,
                    )
                    .await;
                    return Err(err);
                }
                ok => return ok,
            }
        }
    }

    async fn sync_attempt(
        &self,
        ctx: &RequestContext,
        options: &SyncOptions,
        started: Instant,
    ) -> Result<SyncResponse> {
        let device = self.gate(ctx, SyncCommand::Sync).await?;
        let folder = self.folders.get(&ctx.device_id, &options.folder_id).await?;
        if !folder.sync_enabled {
            return Err(folder::Error::FolderNotSyncEnabledError(options.folder_id.clone()).into());
        }

        let scope = CursorScope::Folder(folder.mailbox_folder_id.clone());

        match self.cursors.check(&ctx.device_id, &scope, options.cursor).await {
            CursorCheck::Current => {}
            CursorCheck::Replay => {
                let recorded = self
                    .sync_replays
                    .read()
                    .await
                    .get(&(ctx.device_id.clone(), options.folder_id.clone()))
                    .cloned();
                if let Some(recorded) = recorded {
                    self.audit_sync(ctx, options.cursor, &recorded, 0, started).await;
                    return Ok(recorded);
                }
                return Err(Error::StaleCursorError(scope.to_string(), options.cursor));
            }
            CursorCheck::Stale => {
                return Err(Error::StaleCursorError(scope.to_string(), options.cursor))
            }
            CursorCheck::Unknown => {
                return Err(Error::InvalidCursorError(scope.to_string(), options.cursor))
            }
        }

        let state = self.cursors.state(&ctx.device_id, &scope).await;
        let read_from = if options.cursor.is_initial() {
            Cursor::INITIAL
        } else {
            state.position
        };

        let cap = options
            .max_items
            .unwrap_or(device.max_items_per_sync)
            .min(device.max_items_per_sync)
            .min(self.config.max_items_per_sync)
            .max(1) as usize;

        let window = self
            .feed
            .read_since(&folder.mailbox_folder_id, read_from, cap, Some(&ctx.device_id))
            .await;
        let server_changes = item::sync::collapse(window.changes.clone());
        let patch = item::sync::patch::build(
            &server_changes,
            &options.client_changes,
            folder.conflict_resolution,
        );

        let truncation = options.truncation_size.or(folder.truncation_size);
        let now = Utc::now();

        let mut response = SyncResponse {
            folder_id: options.folder_id.clone(),
            cursor: options.cursor,
            more_available: window.more,
            ..SyncResponse::default()
        };
        let mut write_backs: Vec<(&ClientChange, bool)> = Vec::new();

        for hunk in &patch {
            trace!(device = %ctx.device_id, %hunk, "processing content hunk");
            match hunk {
                ItemSyncHunk::Forward(change) => match change.kind {
                    ChangeKind::Deleted => {
                        response.deleted.push(change.item_id.clone());
                        response.report.items_deleted += 1;
                    }
                    ChangeKind::Added | ChangeKind::Changed => {
                        let item = self
                            .mailbox
                            .fetch_item(&folder.mailbox_folder_id, &change.item_id)
                            .await
                            .map_err(Error::MailboxError)?;
                        let Some(item) = item else {
                            // vanished since the delta was appended,
                            // the delete delta will follow
                            trace!(item = %change.item_id, "skipping vanished item");
                            continue;
                        };
                        response.report.items_fetched += 1;
                        if !folder.filter_window.contains(item.received_at, now) {
                            response.report.filtered += 1;
                            continue;
                        }
                        if item.size > self.config.max_item_size {
                            response.report.skipped_too_large += 1;
                            response.status = SyncStatus::PartialSuccess;
                            continue;
                        }
                        let item = item.truncate(truncation);
                        if change.kind == ChangeKind::Added {
                            response.report.items_added += 1;
                            response.added.push(item);
                        } else {
                            response.report.items_changed += 1;
                            response.changed.push(item);
                        }
                    }
                },
                ItemSyncHunk::Apply(change) => write_backs.push((change, false)),
                ItemSyncHunk::ApplyAsNew(change) => write_backs.push((change, true)),
                ItemSyncHunk::Discard(..) => response.report.discarded += 1,
                ItemSyncHunk::Suppress(..) => response.report.suppressed += 1,
            }
        }

        let bytes_received: u64 = options
            .client_changes
            .iter()
            .filter_map(|change| change.payload.as_ref())
            .map(|payload| payload.size())
            .sum();

        // informational counter, fetched outside the commit section
        let total_items = self
            .mailbox
            .count_items(&folder.mailbox_folder_id)
            .await
            .unwrap_or(folder.total_items);

        // commit section: apply, advance, record, audit under the
        // same lock so a losing race leaves no side effect
        let lock = self.commit_lock(&ctx.device_id, &scope).await;
        let _guard = lock.lock().await;

        if !matches!(
            self.cursors.check(&ctx.device_id, &scope, options.cursor).await,
            CursorCheck::Current
        ) {
            return Err(Error::SyncConflictError(ctx.device_id.clone()));
        }

        let mut accepted_bytes = 0u64;
        for (change, as_new) in &write_backs {
            if let Some(payload) = &change.payload {
                if payload.size() > self.config.max_item_size {
                    response.report.skipped_too_large += 1;
                    response.status = SyncStatus::PartialSuccess;
                    continue;
                }
                if accepted_bytes + payload.size() > self.config.max_client_bytes_per_sync {
                    // over quota: the changes that fit were applied,
                    // the client resubmits the rest
                    response.report.skipped_over_quota += 1;
                    response.status = SyncStatus::PartialSuccess;
                    continue;
                }
                accepted_bytes += payload.size();
            }
            let applied = self
                .mailbox
                .apply_client_change(&ctx.device_id, &folder.mailbox_folder_id, change, *as_new)
                .await
                .map_err(Error::MailboxError)?;
            if *as_new {
                response.report.duplicated += 1;
            } else {
                response.report.applied += 1;
            }
            response.applied.push(applied);
        }

        let advanced = window.head > read_from || !response.applied.is_empty();
        if advanced {
            response.cursor = self
                .cursors
                .advance(&ctx.device_id, &scope, options.cursor, window.head)
                .await
                .map_err(|err| match err {
                    crate::cursor::Error::AdvanceConflictError(_) => {
                        Error::SyncConflictError(ctx.device_id.clone())
                    }
                    err => err.into(),
                })?;
        }

        let forwarded = response.report.items_added + response.report.items_changed;
        self.folders
            .update(&ctx.device_id, &options.folder_id, |folder| {
                let synced = folder.synced_items.saturating_add(forwarded);
                folder.update_progress(total_items, synced);
                folder.has_pending_changes = window.more;
            })
            .await?;

        self.devices
            .update(&ctx.device_id, |device| {
                device.update_sync_stats(response.status.is_success(), ctx.client_ip.as_deref())
            })
            .await?;

        if advanced {
            // the recorded response belongs to the advance it came
            // from; an exchange that moved nothing must not shadow it
            self.sync_replays
                .write()
                .await
                .insert((ctx.device_id.clone(), options.folder_id.clone()), response.clone());
        }

        self.audit_sync(ctx, options.cursor, &response, bytes_received, started)
            .await;

        Ok(response)
    }

    async fn audit_sync(
        &self,
        ctx: &RequestContext,
        cursor_in: Cursor,
        response: &SyncResponse,
        bytes_received: u64,
        started: Instant,
    ) {
        let mut entry = self.base_entry(ctx, SyncCommand::Sync);
        entry.folder_id = Some(response.folder_id.clone());
        entry.cursor_in = Some(cursor_in);
        entry.cursor_out = Some(response.cursor);
        entry.status = response.status;
        entry.items_added = response.report.items_added;
        entry.items_changed = response.report.items_changed;
        entry.items_deleted = response.report.items_deleted;
        entry.items_fetched = response.report.items_fetched;
        entry.bytes_sent = response
            .added
            .iter()
            .chain(response.changed.iter())
            .map(|item| item.body.len() as u64)
            .sum();
        entry.bytes_received = bytes_received;
        entry.processing_time_ms = started.elapsed().as_millis() as u64;
        self.audit.append(entry).await;
    }

    /// Long-poll until one of the watched folders changes or the
    /// clamped interval elapses.
    pub async fn ping(&self, ctx: &RequestContext, options: PingOptions) -> Result<PingResponse> {
        let started = Instant::now();
        let result = self.ping_inner(ctx, &options, started).await;
        if let Err(err) = &result {
            self.audit_failure(ctx, SyncCommand::Ping, None, None, err, started)
                .await;
        }
        result
    }

    async fn ping_inner(
        &self,
        ctx: &RequestContext,
        options: &PingOptions,
        started: Instant,
    ) -> Result<PingResponse> {
        self.gate(ctx, SyncCommand::Ping).await?;
        let interval = self.config.ping.clamp(options.heartbeat_interval_secs);

        // resolve the watch set and pre-check folders that already
        // lag behind the feed
        let mut watched: HashMap<FolderId, FolderId> = HashMap::new();
        let mut pending: Vec<FolderId> = Vec::new();
        for folder_id in &options.folder_ids {
            let Some(folder) = self.folders.find(&ctx.device_id, folder_id).await else {
                // unknown folders are ignored, the next folder sync
                // sorts the device out
                continue;
            };
            let scope = CursorScope::Folder(folder.mailbox_folder_id.clone());
            let state = self.cursors.state(&ctx.device_id, &scope).await;
            if self
                .feed
                .has_changes_since(&folder.mailbox_folder_id, state.position, Some(&ctx.device_id))
                .await
            {
                pending.push(folder_id.clone());
            }
            watched.insert(folder.mailbox_folder_id.clone(), folder_id.clone());
        }

        let outcome = if !pending.is_empty() {
            PingOutcome::Changed(pending)
        } else {
            let wait = self
                .ping
                .wait(
                    &ctx.device_id,
                    watched.keys().cloned().collect(),
                    Duration::from_secs(interval as u64),
                )
                .await;
            match wait {
                PingOutcome::Changed(mailbox_ids) => PingOutcome::Changed(
                    mailbox_ids
                        .into_iter()
                        .filter_map(|mailbox_id| watched.get(&mailbox_id).cloned())
                        .collect(),
                ),
                other => other,
            }
        };

        if let PingOutcome::Changed(folder_ids) = &outcome {
            for folder_id in folder_ids {
                let _ = self
                    .folders
                    .update(&ctx.device_id, folder_id, |folder| {
                        folder.has_pending_changes = true;
                    })
                    .await;
            }
        }

        self.devices
            .update(&ctx.device_id, |device| {
                device.heartbeat_interval_secs = interval;
                device.update_sync_stats(true, ctx.client_ip.as_deref());
            })
            .await?;

        let mut entry = self.base_entry(ctx, SyncCommand::Ping);
        entry.heartbeat_interval_secs = Some(interval);
        entry.processing_time_ms = started.elapsed().as_millis() as u64;
        self.audit.append(entry).await;

        Ok(PingResponse {
            outcome,
            heartbeat_interval_secs: interval,
        })
    }

    /// Run the provisioning handshake: offer the current policy,
    /// record an acknowledgment, or settle a remote wipe.
    pub async fn provision(
        &self,
        ctx: &RequestContext,
        request: ProvisionRequest,
    ) -> Result<ProvisionResponse> {
        let started = Instant::now();
        let result = self.provision_inner(ctx, &request, started).await;
        if let Err(err) = &result {
            self.audit_failure(ctx, SyncCommand::Provision, None, None, err, started)
                .await;
        }
        result
    }

    async fn provision_inner(
        &self,
        ctx: &RequestContext,
        request: &ProvisionRequest,
        started: Instant,
    ) -> Result<ProvisionResponse> {
        let device = self.gate(ctx, SyncCommand::Provision).await?;

        if device.remote_wipe_requested && !device.remote_wipe_acknowledged {
            if request.acknowledge_wipe {
                self.devices.acknowledge_wipe(&ctx.device_id).await?;
                let mut entry = self.base_entry(ctx, SyncCommand::Provision);
                entry.wipe_requested = true;
                entry.processing_time_ms = started.elapsed().as_millis() as u64;
                self.audit.append(entry).await;
                return Ok(ProvisionResponse::WipeAcknowledged);
            }
            return Err(Error::RemoteWipeRequestedError(ctx.device_id.clone()));
        }

        let response = match &request.acknowledge {
            Some(key) => {
                self.provision
                    .acknowledge(&self.devices, &ctx.device_id, key)
                    .await?;
                ProvisionResponse::Acknowledged
            }
            None => match self.provision.offer(&self.devices, &ctx.device_id).await? {
                Some(key) => ProvisionResponse::PolicyOffered(key),
                None => ProvisionResponse::NoPolicy,
            },
        };

        let mut entry = self.base_entry(ctx, SyncCommand::Provision);
        entry.policy_key = match &response {
            ProvisionResponse::PolicyOffered(key) => Some(key.clone()),
            _ => request.acknowledge.clone(),
        };
        entry.processing_time_ms = started.elapsed().as_millis() as u64;
        self.audit.append(entry).await;

        Ok(response)
    }

    /// Estimate how many deltas a content sync from the given cursor
    /// would drain, without advancing anything.
    pub async fn item_estimate(
        &self,
        ctx: &RequestContext,
        folder_id: &str,
        cursor: Cursor,
    ) -> Result<ItemEstimateResponse> {
        let started = Instant::now();
        let result = self.item_estimate_inner(ctx, folder_id, cursor, started).await;
        if let Err(err) = &result {
            self.audit_failure(
                ctx,
                SyncCommand::ItemEstimate,
                Some(folder_id),
                Some(cursor),
                err,
                started,
            )
            .await;
        }
        result
    }

    async fn item_estimate_inner(
        &self,
        ctx: &RequestContext,
        folder_id: &str,
        cursor: Cursor,
        started: Instant,
    ) -> Result<ItemEstimateResponse> {
        self.gate(ctx, SyncCommand::ItemEstimate).await?;
        let folder = self.folders.get(&ctx.device_id, folder_id).await?;
        let scope = CursorScope::Folder(folder.mailbox_folder_id.clone());

        match self.cursors.check(&ctx.device_id, &scope, cursor).await {
            CursorCheck::Current | CursorCheck::Replay => {}
            CursorCheck::Stale => return Err(Error::StaleCursorError(scope.to_string(), cursor)),
            CursorCheck::Unknown => {
                return Err(Error::InvalidCursorError(scope.to_string(), cursor))
            }
        }

        let state = self.cursors.state(&ctx.device_id, &scope).await;
        let read_from = if cursor.is_initial() {
            Cursor::INITIAL
        } else {
            state.position
        };
        let pending = self
            .feed
            .pending_count(&folder.mailbox_folder_id, read_from, Some(&ctx.device_id))
            .await as u32;

        let mut entry = self.base_entry(ctx, SyncCommand::ItemEstimate);
        entry.folder_id = Some(folder_id.to_owned());
        entry.cursor_in = Some(cursor);
        entry.processing_time_ms = started.elapsed().as_millis() as u64;
        self.audit.append(entry).await;

        Ok(ItemEstimateResponse {
            folder_id: folder_id.to_owned(),
            pending,
        })
    }

    /// Move items between folders of the device, one status per item.
    pub async fn move_items(
        &self,
        ctx: &RequestContext,
        moves: Vec<ItemMove>,
    ) -> Result<MoveItemsResponse> {
        let started = Instant::now();
        let result = self.move_items_inner(ctx, &moves, started).await;
        if let Err(err) = &result {
            self.audit_failure(ctx, SyncCommand::MoveItems, None, None, err, started)
                .await;
        }
        result
    }

    async fn move_items_inner(
        &self,
        ctx: &RequestContext,
        moves: &[ItemMove],
        started: Instant,
    ) -> Result<MoveItemsResponse> {
        self.gate(ctx, SyncCommand::MoveItems).await?;

        // items are independent, so the moves run concurrently; the
        // response keeps the request order
        let results: Vec<MoveResult> = FuturesOrdered::from_iter(moves.iter().map(|requested| {
            async move {
                let source = self.folders.find(&ctx.device_id, &requested.from_folder_id).await;
                let target = self.folders.find(&ctx.device_id, &requested.to_folder_id).await;

                let result = match (source, target) {
                    (Some(source), Some(target)) => self
                        .mailbox
                        .move_item(
                            &ctx.device_id,
                            &source.mailbox_folder_id,
                            &target.mailbox_folder_id,
                            &requested.item_id,
                        )
                        .await
                        .map(Some)
                        .map_err(|err| err.to_string()),
                    (None, _) => Err(format!("unknown folder {}", requested.from_folder_id)),
                    (_, None) => Err(format!("unknown folder {}", requested.to_folder_id)),
                };

                match result {
                    Ok(new_item_id) => MoveResult {
                        item_id: requested.item_id.clone(),
                        new_item_id,
                        error: None,
                    },
                    Err(error) => MoveResult {
                        item_id: requested.item_id.clone(),
                        new_item_id: None,
                        error: Some(error),
                    },
                }
            }
        }))
        .collect()
        .await;

        let moved = results.iter().filter(|result| result.error.is_none()).count() as u32;

        let status = if results.iter().all(|result| result.error.is_none()) {
            SyncStatus::Success
        } else if moved > 0 {
            SyncStatus::PartialSuccess
        } else {
            SyncStatus::Failed
        };

        self.devices
            .update(&ctx.device_id, |device| {
                device.update_sync_stats(status.is_success(), ctx.client_ip.as_deref())
            })
            .await?;

        let mut entry = self.base_entry(ctx, SyncCommand::MoveItems);
        entry.items_changed = moved;
        entry.status = status;
        entry.processing_time_ms = started.elapsed().as_millis() as u64;
        self.audit.append(entry).await;

        Ok(MoveItemsResponse { moves: results, status })
    }

    /// Search the mailbox of the device's account.
    pub async fn search(&self, ctx: &RequestContext, query: SearchQuery) -> Result<SearchResponse> {
        let started = Instant::now();
        let result = self.search_inner(ctx, query, started).await;
        if let Err(err) = &result {
            self.audit_failure(ctx, SyncCommand::Search, None, None, err, started)
                .await;
        }
        result
    }

    async fn search_inner(
        &self,
        ctx: &RequestContext,
        mut query: SearchQuery,
        started: Instant,
    ) -> Result<SearchResponse> {
        let device = self.gate(ctx, SyncCommand::Search).await?;

        if let Some(folder_id) = &query.folder_id {
            let folder = self.folders.get(&ctx.device_id, folder_id).await?;
            query.folder_id = Some(folder.mailbox_folder_id);
        }
        query.max_results = query.max_results.min(self.config.max_items_per_sync as usize);

        let items = self
            .mailbox
            .search(&device.account_id, &query)
            .await
            .map_err(Error::MailboxError)?;

        let mut entry = self.base_entry(ctx, SyncCommand::Search);
        entry.items_fetched = items.len() as u32;
        entry.bytes_sent = items.iter().map(|item| item.body.len() as u64).sum();
        entry.processing_time_ms = started.elapsed().as_millis() as u64;
        self.audit.append(entry).await;

        Ok(SearchResponse { items })
    }

    /// Submit an outbound message for delivery.
    pub async fn send_mail(&self, ctx: &RequestContext, message: &[u8]) -> Result<()> {
        self.submit(ctx, SyncCommand::SendMail, message).await
    }

    /// Submit a reply composed against an existing item.
    pub async fn smart_reply(&self, ctx: &RequestContext, message: &[u8]) -> Result<()> {
        self.submit(ctx, SyncCommand::SmartReply, message).await
    }

    /// Submit a forward composed against an existing item.
    pub async fn smart_forward(&self, ctx: &RequestContext, message: &[u8]) -> Result<()> {
        self.submit(ctx, SyncCommand::SmartForward, message).await
    }

    async fn submit(
        &self,
        ctx: &RequestContext,
        command: SyncCommand,
        message: &[u8],
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.submit_inner(ctx, command, message, started).await;
        if let Err(err) = &result {
            self.audit_failure(ctx, command, None, None, err, started).await;
        }
        result
    }

    async fn submit_inner(
        &self,
        ctx: &RequestContext,
        command: SyncCommand,
        message: &[u8],
        started: Instant,
    ) -> Result<()> {
        let device = self.gate(ctx, command).await?;

        self.mailbox
            .submit(&device.account_id, message)
            .await
            .map_err(Error::MailboxError)?;

        self.devices
            .update(&ctx.device_id, |device| {
                device.update_sync_stats(true, ctx.client_ip.as_deref())
            })
            .await?;

        let mut entry = self.base_entry(ctx, command);
        entry.bytes_received = message.len() as u64;
        entry.processing_time_ms = started.elapsed().as_millis() as u64;
        self.audit.append(entry).await;

        Ok(())
    }

    /// Read or adjust the per-device settings.
    pub async fn settings(
        &self,
        ctx: &RequestContext,
        request: SettingsRequest,
    ) -> Result<SettingsResponse> {
        let started = Instant::now();
        let result = self.settings_inner(ctx, &request, started).await;
        if let Err(err) = &result {
            self.audit_failure(ctx, SyncCommand::Settings, None, None, err, started)
                .await;
        }
        result
    }

    async fn settings_inner(
        &self,
        ctx: &RequestContext,
        request: &SettingsRequest,
        started: Instant,
    ) -> Result<SettingsResponse> {
        self.gate(ctx, SyncCommand::Settings).await?;

        let ping_config = self.config.ping;
        let max_items_cap = self.config.max_items_per_sync;
        let device = self
            .devices
            .update(&ctx.device_id, |device| {
                if let Some(secs) = request.heartbeat_interval_secs {
                    device.heartbeat_interval_secs = ping_config.clamp(Some(secs));
                }
                if let Some(max_items) = request.max_items_per_sync {
                    device.max_items_per_sync = max_items.clamp(1, max_items_cap);
                }
            })
            .await?;

        let mut entry = self.base_entry(ctx, SyncCommand::Settings);
        entry.heartbeat_interval_secs = Some(device.heartbeat_interval_secs);
        entry.processing_time_ms = started.elapsed().as_millis() as u64;
        self.audit.append(entry).await;

        Ok(SettingsResponse { device })
    }

    async fn unsupported_command(
        &self,
        ctx: &RequestContext,
        command: SyncCommand,
    ) -> Result<CommandResponse> {
        let started = Instant::now();
        let result = match self.gate(ctx, command).await {
            Ok(_) => Err(Error::UnsupportedCommandError(command)),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            self.audit_failure(ctx, command, None, None, err, started).await;
        }
        result
    }

    /// The authorization gate, checked before any cursor read or
    /// write. Only the provisioning handshake passes while a policy
    /// or a wipe is outstanding.
    async fn gate(&self, ctx: &RequestContext, command: SyncCommand) -> Result<Device> {
        if !self.config.enabled {
            return Err(Error::DeviceDeniedError(
                ctx.device_id.clone(),
                DenyReason::Disabled,
            ));
        }

        let device = self.devices.get(&ctx.device_id).await?;
        match self.devices.authorize(&ctx.device_id).await? {
            Authorization::Allow => Ok(device),
            Authorization::Wipe if command == SyncCommand::Provision => Ok(device),
            Authorization::Wipe => Err(Error::RemoteWipeRequestedError(ctx.device_id.clone())),
            Authorization::RequirePolicy if command == SyncCommand::Provision => Ok(device),
            Authorization::RequirePolicy => Err(Error::PolicyRequiredError(ctx.device_id.clone())),
            Authorization::Denied(reason) => {
                Err(Error::DeviceDeniedError(ctx.device_id.clone(), reason))
            }
        }
    }

    async fn commit_lock(
        &self,
        device_id: &str,
        scope: &CursorScope,
    ) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.commit_locks.lock().await;
        locks
            .entry((device_id.to_owned(), scope.clone()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn base_entry(&self, ctx: &RequestContext, command: SyncCommand) -> SyncLogEntry {
        let mut entry = SyncLogEntry::new(ctx.device_id.clone(), command);
        entry.client_ip = ctx.client_ip.clone();
        entry.user_agent = ctx.user_agent.clone();
        entry.session_id = Some(ctx.session_id.clone().unwrap_or_else(|| {
            format!("s{}", self.next_session_id.fetch_add(1, Ordering::Relaxed))
        }));
        entry
    }

    async fn audit_failure(
        &self,
        ctx: &RequestContext,
        command: SyncCommand,
        folder_id: Option<&str>,
        cursor_in: Option<Cursor>,
        err: &Error,
        started: Instant,
    ) {
        let mut entry = self.base_entry(ctx, command);
        entry.folder_id = folder_id.map(ToOwned::to_owned);
        entry.cursor_in = cursor_in;
        entry.status = err.status();
        entry.error_code = Some(err.code().to_owned());
        entry.error_message = Some(err.to_string());
        entry.wipe_requested = matches!(err, Error::RemoteWipeRequestedError(_));
        entry.processing_time_ms = started.elapsed().as_millis() as u64;
        self.audit.append(entry).await;

        // a device that exists gets the failure counted against it
        let _ = self
            .devices
            .update(&ctx.device_id, |device| {
                device.update_sync_stats(false, ctx.client_ip.as_deref())
            })
            .await;
    }
}
