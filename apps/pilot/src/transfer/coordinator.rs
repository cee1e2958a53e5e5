use bytes::Bytes;
use pilot_proto::{OutboundEnvelope, ScreenshotKey, SyncManifest, MAX_SYNC_KEYS};
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::library::{Capture, ScreenshotLibrary};
use super::retry::{run_with_retry, still_connected, RetryPolicy};
use super::store::{parse_presigned, ObjectStore, StoreError, StoreResponse};
use super::{DeletePolicy, TransferConfig, TransferError, TransferKind};
use crate::collaborators::TransferListener;
use crate::epoch_millis;
use crate::session::{ControlChannel, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Request sent; waiting for the presigned URL or manifest.
    AwaitingGrant,
    /// A task owns the HTTP leg and will report back.
    Transferring,
}

struct Slot<T> {
    ticket: u64,
    phase: Phase,
    session: watch::Receiver<SessionState>,
    item: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncSummary {
    pub downloaded: usize,
    pub uploaded: usize,
    pub failed: usize,
    /// The session dropped and the remaining manifest entries were skipped.
    pub abandoned: bool,
}

impl SyncSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.abandoned
    }
}

/// Terminal result of one coordinator operation. Each accepted request yields
/// exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Finished {
        kind: TransferKind,
        key: Option<ScreenshotKey>,
        path: Option<PathBuf>,
        result: Result<(), TransferError>,
    },
    SyncFinished(SyncSummary),
}

enum Report {
    Done {
        ticket: u64,
        kind: TransferKind,
        result: Result<(), TransferError>,
    },
    SyncItem {
        ticket: u64,
        kind: TransferKind,
        path: Option<PathBuf>,
        success: bool,
    },
    SyncProgress {
        ticket: u64,
        uploaded: usize,
        downloaded: usize,
    },
    SyncDone {
        ticket: u64,
        summary: SyncSummary,
    },
}

/// Single-slot tracker for uploads, deletes and sync passes.
///
/// Lives on the owner loop. HTTP legs run in spawned tasks that report back
/// through a channel drained by [`TransferCoordinator::drain_outcomes`], so
/// listener callbacks always fire on the owner.
pub struct TransferCoordinator {
    config: TransferConfig,
    store: Arc<dyn ObjectStore>,
    library: ScreenshotLibrary,
    listener: Arc<dyn TransferListener>,
    upload: Option<Slot<Capture>>,
    delete: Option<Slot<ScreenshotKey>>,
    sync: Option<Slot<String>>,
    next_ticket: u64,
    ready: VecDeque<TransferOutcome>,
    reports_tx: mpsc::UnboundedSender<Report>,
    reports_rx: mpsc::UnboundedReceiver<Report>,
}

impl TransferCoordinator {
    pub fn new(
        config: TransferConfig,
        store: Arc<dyn ObjectStore>,
        library: ScreenshotLibrary,
        listener: Arc<dyn TransferListener>,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            config,
            store,
            library,
            listener,
            upload: None,
            delete: None,
            sync: None,
            next_ticket: 0,
            ready: VecDeque::new(),
            reports_tx,
            reports_rx,
        }
    }

    pub fn library(&self) -> &ScreenshotLibrary {
        &self.library
    }

    pub fn is_upload_pending(&self) -> bool {
        self.upload.is_some()
    }

    pub fn is_delete_pending(&self) -> bool {
        self.delete.is_some()
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.sync.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.upload.is_none() && self.delete.is_none() && self.sync.is_none()
    }

    /// The operation still waiting on the server, checked upload first, then
    /// delete, then sync. An `S3_ERROR` belongs to this one.
    pub fn pending_request(&self) -> Option<TransferKind> {
        if awaiting_grant(&self.upload) {
            Some(TransferKind::Upload)
        } else if awaiting_grant(&self.delete) {
            Some(TransferKind::Delete)
        } else if awaiting_grant(&self.sync) {
            Some(TransferKind::SyncManifest)
        } else {
            None
        }
    }

    pub fn request_upload(
        &mut self,
        channel: &dyn ControlChannel,
        capture: Capture,
    ) -> Result<(), TransferError> {
        let kind = TransferKind::Upload;
        ensure_ready(channel, kind, self.upload.is_some())?;
        // The server derives the object key from userId and timestamp, so both
        // come from the capture key itself.
        let envelope = OutboundEnvelope::upload_request(
            capture.key.username(),
            channel.session_id(),
            capture.key.captured_at(),
        );
        send_request(channel, kind, &envelope)?;
        let ticket = self.ticket();
        info!(target: "pilot::transfer", key = %capture.key, ticket, "upload requested");
        self.upload = Some(Slot {
            ticket,
            phase: Phase::AwaitingGrant,
            session: channel.subscribe_state(),
            item: capture,
        });
        Ok(())
    }

    pub fn request_delete(
        &mut self,
        channel: &dyn ControlChannel,
        key: ScreenshotKey,
    ) -> Result<(), TransferError> {
        let kind = TransferKind::Delete;
        ensure_ready(channel, kind, self.delete.is_some())?;
        let envelope = OutboundEnvelope::delete_request(
            key.username(),
            channel.session_id(),
            epoch_millis(),
            &key,
        );
        send_request(channel, kind, &envelope)?;
        let ticket = self.ticket();
        info!(target: "pilot::transfer", key = %key, ticket, "delete requested");
        self.delete = Some(Slot {
            ticket,
            phase: Phase::AwaitingGrant,
            session: channel.subscribe_state(),
            item: key,
        });
        Ok(())
    }

    /// Lists the newest local keys for the session's user and asks the server
    /// for a manifest. Returns how many keys were listed.
    pub fn request_sync(&mut self, channel: &dyn ControlChannel) -> Result<usize, TransferError> {
        let kind = TransferKind::SyncManifest;
        ensure_ready(channel, kind, self.sync.is_some())?;
        let username = channel.user_id().to_string();
        let mut keys = self
            .library
            .list_keys(&username)
            .map_err(|err| TransferError::Io(err.to_string()))?;
        keys.truncate(self.config.sync_key_cap.min(MAX_SYNC_KEYS));
        let envelope =
            OutboundEnvelope::sync_request(&username, channel.session_id(), epoch_millis(), &keys);
        send_request(channel, kind, &envelope)?;
        let ticket = self.ticket();
        info!(target: "pilot::transfer", keys = keys.len(), ticket, "sync requested");
        self.sync = Some(Slot {
            ticket,
            phase: Phase::AwaitingGrant,
            session: channel.subscribe_state(),
            item: username,
        });
        Ok(keys.len())
    }

    pub fn on_upload_grant(&mut self, url: &str) {
        let kind = TransferKind::Upload;
        let (ticket, mut session, capture) = match begin_transfer(&mut self.upload, kind, url) {
            Ok(started) => started,
            Err(Some(err)) => {
                self.fail_awaiting(kind, err);
                return;
            }
            Err(None) => return,
        };
        info!(target: "pilot::transfer", key = %capture.key, ticket, "upload granted");
        let store = Arc::clone(&self.store);
        let retry = self.config.retry;
        let reports = self.reports_tx.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let result = match read_capture(&capture).await {
                Ok(body) => put_body(&store, retry, &mut session, &url, body).await,
                Err(err) => Err(err),
            };
            let _ = reports.send(Report::Done {
                ticket,
                kind,
                result,
            });
        });
    }

    pub fn on_delete_grant(&mut self, url: &str) {
        let kind = TransferKind::Delete;
        let (ticket, mut session, key) = match begin_transfer(&mut self.delete, kind, url) {
            Ok(started) => started,
            Err(Some(err)) => {
                self.fail_awaiting(kind, err);
                return;
            }
            Err(None) => return,
        };
        info!(target: "pilot::transfer", key = %key, ticket, "delete granted");
        let store = Arc::clone(&self.store);
        let retry = self.config.retry;
        let policy = self.config.delete_policy;
        let library = self.library.clone();
        let reports = self.reports_tx.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let result = match delete_object(&store, retry, policy, &mut session, &url).await {
                // Remote first: the local file only goes once the object is gone.
                Ok(status) => {
                    if status == 404 {
                        info!(target: "pilot::transfer", key = %key, "remote object already absent");
                    }
                    library
                        .remove(&key)
                        .await
                        .map(|_| ())
                        .map_err(|err| io_error(&key, err))
                }
                Err(err) => Err(err),
            };
            let _ = reports.send(Report::Done {
                ticket,
                kind,
                result,
            });
        });
    }

    pub fn on_sync_manifest(&mut self, manifest: SyncManifest) {
        let Some(slot) = self.sync.as_mut() else {
            warn!(target: "pilot::transfer", "sync manifest with no sync pending; dropped");
            return;
        };
        if slot.phase != Phase::AwaitingGrant {
            warn!(target: "pilot::transfer", ticket = slot.ticket, "duplicate sync manifest ignored");
            return;
        }
        slot.phase = Phase::Transferring;
        let ticket = slot.ticket;
        let session = slot.session.clone();
        let username = slot.item.clone();
        info!(
            target: "pilot::transfer",
            ticket,
            downloads = manifest.get.len(),
            uploads = manifest.put.len(),
            "sync manifest received"
        );
        let job = SyncJob {
            ticket,
            username,
            store: Arc::clone(&self.store),
            library: self.library.clone(),
            retry: self.config.retry,
            session,
            reports: self.reports_tx.clone(),
        };
        tokio::spawn(job.run(manifest));
    }

    /// Fails the operation of `kind` that is still waiting on the server.
    /// Returns `false` if there was none.
    pub fn fail_pending(&mut self, kind: TransferKind, message: Option<String>) -> bool {
        let reason = message.unwrap_or_else(|| "unspecified transfer error".to_string());
        self.fail_awaiting(kind, TransferError::Server(reason))
    }

    /// Fails every operation still waiting on a grant. Operations already in
    /// their HTTP leg notice the dropped session themselves.
    pub fn on_session_lost(&mut self) {
        for kind in [
            TransferKind::Upload,
            TransferKind::Delete,
            TransferKind::SyncManifest,
        ] {
            self.fail_awaiting(kind, TransferError::SessionLost);
        }
    }

    /// Processes everything the transfer tasks reported so far.
    pub fn drain_outcomes(&mut self) -> Vec<TransferOutcome> {
        let mut outcomes: Vec<TransferOutcome> = self.ready.drain(..).collect();
        while let Ok(report) = self.reports_rx.try_recv() {
            if let Some(outcome) = self.handle_report(report) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Waits for the next terminal outcome. Returns `None` when nothing is in
    /// flight. An operation still waiting on its grant only finishes once the
    /// grant is routed in, so callers awaiting it must keep routing frames.
    pub async fn next_outcome(&mut self) -> Option<TransferOutcome> {
        loop {
            if let Some(outcome) = self.ready.pop_front() {
                return Some(outcome);
            }
            if self.is_idle() {
                return None;
            }
            let report = self.reports_rx.recv().await?;
            if let Some(outcome) = self.handle_report(report) {
                return Some(outcome);
            }
        }
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn fail_awaiting(&mut self, kind: TransferKind, err: TransferError) -> bool {
        let (key, path) = match kind {
            TransferKind::Upload => match take_awaiting(&mut self.upload) {
                Some(slot) => (Some(slot.item.key), Some(slot.item.path)),
                None => return false,
            },
            TransferKind::Delete => match take_awaiting(&mut self.delete) {
                Some(slot) => {
                    let path = self.library.path_for(&slot.item);
                    (Some(slot.item), Some(path))
                }
                None => return false,
            },
            TransferKind::SyncManifest => match take_awaiting(&mut self.sync) {
                Some(_) => (None, None),
                None => return false,
            },
            TransferKind::Download => return false,
        };
        let outcome = self.finish(kind, key, path, Err(err));
        self.ready.push_back(outcome);
        true
    }

    fn handle_report(&mut self, report: Report) -> Option<TransferOutcome> {
        match report {
            Report::Done {
                ticket,
                kind,
                result,
            } => {
                let (key, path) = match kind {
                    TransferKind::Upload => {
                        let slot = take_if_ticket(&mut self.upload, ticket)?;
                        (slot.item.key, slot.item.path)
                    }
                    TransferKind::Delete => {
                        let slot = take_if_ticket(&mut self.delete, ticket)?;
                        let path = self.library.path_for(&slot.item);
                        (slot.item, path)
                    }
                    TransferKind::Download | TransferKind::SyncManifest => return None,
                };
                Some(self.finish(kind, Some(key), Some(path), result))
            }
            Report::SyncItem {
                ticket,
                kind,
                path,
                success,
            } => {
                if self.sync_ticket_matches(ticket) {
                    self.listener
                        .on_transfer_complete(kind, success, path.as_deref());
                }
                None
            }
            Report::SyncProgress {
                ticket,
                uploaded,
                downloaded,
            } => {
                if self.sync_ticket_matches(ticket) {
                    self.listener.on_sync_progress(uploaded, downloaded);
                }
                None
            }
            Report::SyncDone { ticket, summary } => {
                take_if_ticket(&mut self.sync, ticket)?;
                if summary.is_clean() {
                    info!(
                        target: "pilot::transfer",
                        downloaded = summary.downloaded,
                        uploaded = summary.uploaded,
                        "sync finished"
                    );
                } else {
                    warn!(
                        target: "pilot::transfer",
                        downloaded = summary.downloaded,
                        uploaded = summary.uploaded,
                        failed = summary.failed,
                        abandoned = summary.abandoned,
                        "sync finished with failures"
                    );
                }
                self.listener
                    .on_transfer_complete(TransferKind::SyncManifest, summary.is_clean(), None);
                Some(TransferOutcome::SyncFinished(summary))
            }
        }
    }

    fn sync_ticket_matches(&self, ticket: u64) -> bool {
        self.sync.as_ref().map(|slot| slot.ticket) == Some(ticket)
    }

    fn finish(
        &mut self,
        kind: TransferKind,
        key: Option<ScreenshotKey>,
        path: Option<PathBuf>,
        result: Result<(), TransferError>,
    ) -> TransferOutcome {
        let shown = key.as_ref().map(ToString::to_string).unwrap_or_default();
        match &result {
            Ok(()) => info!(target: "pilot::transfer", %kind, key = %shown, "transfer complete"),
            Err(err) => error!(
                target: "pilot::transfer",
                %kind,
                key = %shown,
                error = %err,
                "transfer failed"
            ),
        }
        self.listener
            .on_transfer_complete(kind, result.is_ok(), path.as_deref());
        TransferOutcome::Finished {
            kind,
            key,
            path,
            result,
        }
    }
}

fn ensure_ready(
    channel: &dyn ControlChannel,
    kind: TransferKind,
    busy: bool,
) -> Result<(), TransferError> {
    if !channel.is_connected() {
        warn!(target: "pilot::transfer", %kind, "cannot start transfer: not connected");
        return Err(TransferError::NotConnected { kind });
    }
    if busy {
        warn!(target: "pilot::transfer", %kind, "rejected: already in progress");
        return Err(TransferError::AlreadyInProgress(kind));
    }
    Ok(())
}

fn send_request(
    channel: &dyn ControlChannel,
    kind: TransferKind,
    envelope: &OutboundEnvelope,
) -> Result<(), TransferError> {
    channel.send_envelope(envelope).map_err(|err| {
        warn!(target: "pilot::transfer", %kind, error = %err, "failed to send request");
        TransferError::Request {
            kind,
            reason: err.to_string(),
        }
    })
}

fn awaiting_grant<T>(slot: &Option<Slot<T>>) -> bool {
    matches!(slot, Some(s) if s.phase == Phase::AwaitingGrant)
}

fn take_awaiting<T>(slot: &mut Option<Slot<T>>) -> Option<Slot<T>> {
    if awaiting_grant(slot) {
        slot.take()
    } else {
        None
    }
}

fn take_if_ticket<T>(slot: &mut Option<Slot<T>>, ticket: u64) -> Option<Slot<T>> {
    if slot.as_ref().map(|s| s.ticket) == Some(ticket) {
        slot.take()
    } else {
        debug!(target: "pilot::transfer", ticket, "stale transfer report dropped");
        None
    }
}

/// Moves a slot from waiting to transferring. `Err(None)` means the grant had
/// nothing to apply to; `Err(Some(_))` means the grant itself is unusable.
fn begin_transfer<T: Clone>(
    slot: &mut Option<Slot<T>>,
    kind: TransferKind,
    url: &str,
) -> Result<(u64, watch::Receiver<SessionState>, T), Option<TransferError>> {
    let Some(current) = slot.as_mut() else {
        warn!(target: "pilot::transfer", %kind, "grant with nothing pending; dropped");
        return Err(None);
    };
    if current.phase != Phase::AwaitingGrant {
        warn!(target: "pilot::transfer", %kind, ticket = current.ticket, "duplicate grant ignored");
        return Err(None);
    }
    if let Err(err) = parse_presigned(url) {
        return Err(Some(TransferError::InvalidGrant(err.to_string())));
    }
    current.phase = Phase::Transferring;
    Ok((current.ticket, current.session.clone(), current.item.clone()))
}

fn io_error(key: &ScreenshotKey, err: io::Error) -> TransferError {
    if err.kind() == io::ErrorKind::NotFound {
        TransferError::MissingCapture(key.to_string())
    } else {
        TransferError::Io(format!("{key}: {err}"))
    }
}

async fn read_capture(capture: &Capture) -> Result<Bytes, TransferError> {
    tokio::fs::read(&capture.path)
        .await
        .map(Bytes::from)
        .map_err(|err| io_error(&capture.key, err))
}

fn expect_success(response: Result<StoreResponse, StoreError>) -> Result<StoreResponse, String> {
    match response {
        Ok(response) if response.is_success() => Ok(response),
        Ok(response) => Err(format!("http status {}", response.status)),
        Err(err) => Err(err.to_string()),
    }
}

async fn put_body(
    store: &Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    session: &mut watch::Receiver<SessionState>,
    url: &str,
    body: Bytes,
) -> Result<(), TransferError> {
    run_with_retry(retry, TransferKind::Upload, session, |_| {
        let store = Arc::clone(store);
        let url = url.to_string();
        let body = body.clone();
        async move { expect_success(store.put(&url, body).await).map(|_| ()) }
    })
    .await
}

async fn fetch_body(
    store: &Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    session: &mut watch::Receiver<SessionState>,
    url: &str,
) -> Result<Bytes, TransferError> {
    run_with_retry(retry, TransferKind::Download, session, |_| {
        let store = Arc::clone(store);
        let url = url.to_string();
        async move { expect_success(store.get(&url).await).map(|response| response.body) }
    })
    .await
}

async fn delete_object(
    store: &Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    policy: DeletePolicy,
    session: &mut watch::Receiver<SessionState>,
    url: &str,
) -> Result<u16, TransferError> {
    run_with_retry(retry, TransferKind::Delete, session, |_| {
        let store = Arc::clone(store);
        let url = url.to_string();
        async move {
            match store.delete(&url).await {
                Ok(response) if policy.accepts(response.status) => Ok(response.status),
                Ok(response) => Err(format!("http status {}", response.status)),
                Err(err) => Err(err.to_string()),
            }
        }
    })
    .await
}

/// One sync pass: downloads, then uploads, strictly one at a time.
struct SyncJob {
    ticket: u64,
    username: String,
    store: Arc<dyn ObjectStore>,
    library: ScreenshotLibrary,
    retry: RetryPolicy,
    session: watch::Receiver<SessionState>,
    reports: mpsc::UnboundedSender<Report>,
}

impl SyncJob {
    async fn run(mut self, manifest: SyncManifest) {
        let mut summary = SyncSummary::default();

        for url in &manifest.get {
            if !still_connected(&self.session) {
                summary.abandoned = true;
                break;
            }
            let (path, result) = self.download(url).await;
            if self.record(TransferKind::Download, path, result, &mut summary) {
                break;
            }
        }

        if !summary.abandoned {
            for (url, name) in manifest.uploads() {
                if !still_connected(&self.session) {
                    summary.abandoned = true;
                    break;
                }
                let (path, result) = self.upload(url, name).await;
                if self.record(TransferKind::Upload, path, result, &mut summary) {
                    break;
                }
            }
        }

        let _ = self.reports.send(Report::SyncDone {
            ticket: self.ticket,
            summary,
        });
    }

    /// Returns `true` when the rest of the pass must be abandoned.
    fn record(
        &self,
        kind: TransferKind,
        path: Option<PathBuf>,
        result: Result<(), TransferError>,
        summary: &mut SyncSummary,
    ) -> bool {
        let success = result.is_ok();
        match result {
            Ok(()) => match kind {
                TransferKind::Download => summary.downloaded += 1,
                _ => summary.uploaded += 1,
            },
            Err(err) => {
                summary.failed += 1;
                warn!(
                    target: "pilot::transfer",
                    %kind,
                    path = ?path,
                    error = %err,
                    "sync entry failed"
                );
                if err == TransferError::SessionLost {
                    summary.abandoned = true;
                }
            }
        }
        let _ = self.reports.send(Report::SyncItem {
            ticket: self.ticket,
            kind,
            path,
            success,
        });
        if success {
            let _ = self.reports.send(Report::SyncProgress {
                ticket: self.ticket,
                uploaded: summary.uploaded,
                downloaded: summary.downloaded,
            });
        }
        summary.abandoned
    }

    async fn download(&mut self, url: &str) -> (Option<PathBuf>, Result<(), TransferError>) {
        let Some(key) = self.library.key_for_download(&self.username, url) else {
            return (
                None,
                Err(TransferError::InvalidGrant(format!(
                    "no screenshot key in {url}"
                ))),
            );
        };
        let path = self.library.path_for(&key);
        if let Err(err) = parse_presigned(url) {
            return (Some(path), Err(TransferError::InvalidGrant(err.to_string())));
        }
        let body = match fetch_body(&self.store, self.retry, &mut self.session, url).await {
            Ok(body) => body,
            Err(err) => return (Some(path), Err(err)),
        };
        let result = self
            .library
            .write_atomic(&key, &body)
            .await
            .map(|_| ())
            .map_err(|err| io_error(&key, err));
        (Some(path), result)
    }

    async fn upload(&mut self, url: &str, name: &str) -> (Option<PathBuf>, Result<(), TransferError>) {
        let Some(key) = self.library.resolve_put_name(&self.username, name) else {
            return (None, Err(TransferError::MissingCapture(name.to_string())));
        };
        let path = self.library.path_for(&key);
        if let Err(err) = parse_presigned(url) {
            return (Some(path), Err(TransferError::InvalidGrant(err.to_string())));
        }
        let body = match self.library.read(&key).await {
            Ok(body) => body,
            Err(err) => return (Some(path), Err(io_error(&key, err))),
        };
        let result = put_body(&self.store, self.retry, &mut self.session, url, body).await;
        (Some(path), result)
    }
}
