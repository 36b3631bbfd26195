//! Stream lifecycle coordinator.
//!
//! The local cache of active sessions is owned by a single actor task;
//! [`StreamCoordinator`] is a cheap-clone handle that sends commands over
//! an mpsc channel and awaits oneshot replies. The actor also consumes the
//! store's active-query snapshot feed and the media channel's advisory
//! events, so the cache never needs a lock even on a parallel runtime.
//!
//! Within one logical operation, writes follow a fixed order: session
//! document first, tracker pointer second on success paths; the pointer is
//! cleared before the session mutation on leave. Absent concurrent writers
//! a crash between steps leaves at most a stale pointer, which ghost-state
//! recovery can reclaim.

use std::collections::HashMap;
use std::time::Duration;

use driftcast_core::{EndReason, Participant, StreamSession};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::media::{MediaEvent, SharedMedia};
use crate::store::SharedStore;
use crate::tracker::{ParticipationTracker, PartialOp};

const COMMAND_CHANNEL_DEPTH: usize = 64;
const SUBSCRIBER_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bounded wait after a create's first persist, before the media-channel
    /// join. Latency-hiding only; correctness never depends on it.
    pub propagation_delay: Duration,
    /// Delay before the second post-`end` republish that absorbs remote
    /// propagation lag.
    pub republish_delay: Duration,
    pub media_enabled: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            propagation_delay: Duration::from_millis(150),
            republish_delay: Duration::from_millis(500),
            media_enabled: true,
        }
    }
}

impl CoordinatorConfig {
    /// No artificial waits; used by tests and by the sweeper-only wiring.
    pub fn immediate() -> Self {
        Self {
            propagation_delay: Duration::ZERO,
            republish_delay: Duration::ZERO,
            media_enabled: false,
        }
    }
}

enum Command {
    Create {
        title: String,
        host_id: String,
        host_name: String,
        host_avatar: Option<String>,
        reply: oneshot::Sender<Result<String, StreamError>>,
    },
    Join {
        stream_id: String,
        user_id: String,
        user_name: String,
        user_avatar: Option<String>,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Leave {
        stream_id: String,
        user_id: String,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    End {
        stream_id: String,
        reason: EndReason,
        requested_by: Option<String>,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Kick {
        stream_id: String,
        by_user: String,
        target: String,
        ban: bool,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    SetMuted {
        stream_id: String,
        by_user: String,
        target: String,
        muted: bool,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    ActiveStreams {
        reply: oneshot::Sender<Result<Vec<StreamSession>, StreamError>>,
    },
    Subscribe {
        reply: oneshot::Sender<broadcast::Receiver<Vec<StreamSession>>>,
    },
    /// Internal: refresh from the store and republish. Posted by the
    /// delayed second publish after `end` and by validation-pass spawns.
    Republish,
    /// Internal: media-channel join posted back after the propagation wait
    /// that follows a create.
    MediaJoin {
        stream_id: String,
        user_id: String,
        is_host: bool,
    },
}

/// Handle to the coordinator actor.
#[derive(Clone)]
pub struct StreamCoordinator {
    commands: mpsc::Sender<Command>,
}

impl StreamCoordinator {
    pub fn spawn(
        store: SharedStore,
        tracker: ParticipationTracker,
        media: SharedMedia,
        config: CoordinatorConfig,
    ) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_CHANNEL_DEPTH);
        let task = CoordinatorTask {
            store,
            tracker,
            media,
            config,
            cache: HashMap::new(),
            joined_channel: None,
            subscribers,
            commands: commands.clone(),
        };
        let handle = tokio::spawn(task.run(command_rx));
        (Self { commands }, handle)
    }

    pub async fn create(
        &self,
        title: &str,
        host_id: &str,
        host_name: &str,
        host_avatar: Option<String>,
    ) -> Result<String, StreamError> {
        self.request(|reply| Command::Create {
            title: title.to_string(),
            host_id: host_id.to_string(),
            host_name: host_name.to_string(),
            host_avatar,
            reply,
        })
        .await
    }

    pub async fn join(
        &self,
        stream_id: &str,
        user_id: &str,
        user_name: &str,
        user_avatar: Option<String>,
    ) -> Result<(), StreamError> {
        self.request(|reply| Command::Join {
            stream_id: stream_id.to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            user_avatar,
            reply,
        })
        .await
    }

    pub async fn leave(&self, stream_id: &str, user_id: &str) -> Result<(), StreamError> {
        self.request(|reply| Command::Leave {
            stream_id: stream_id.to_string(),
            user_id: user_id.to_string(),
            reply,
        })
        .await
    }

    /// End a session. `requested_by` carries a caller identity when the
    /// request comes from outside; only a host-role participant may end a
    /// session that way. Internal callers (leave policy, sweeper,
    /// validation) pass `None`.
    pub async fn end(
        &self,
        stream_id: &str,
        reason: EndReason,
        requested_by: Option<&str>,
    ) -> Result<(), StreamError> {
        self.request(|reply| Command::End {
            stream_id: stream_id.to_string(),
            reason,
            requested_by: requested_by.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn kick(
        &self,
        stream_id: &str,
        by_user: &str,
        target: &str,
    ) -> Result<(), StreamError> {
        self.moderate(stream_id, by_user, target, false).await
    }

    pub async fn ban(
        &self,
        stream_id: &str,
        by_user: &str,
        target: &str,
    ) -> Result<(), StreamError> {
        self.moderate(stream_id, by_user, target, true).await
    }

    pub async fn set_muted(
        &self,
        stream_id: &str,
        by_user: &str,
        target: &str,
        muted: bool,
    ) -> Result<(), StreamError> {
        self.request(|reply| Command::SetMuted {
            stream_id: stream_id.to_string(),
            by_user: by_user.to_string(),
            target: target.to_string(),
            muted,
            reply,
        })
        .await
    }

    pub async fn active_streams(&self) -> Result<Vec<StreamSession>, StreamError> {
        self.request(|reply| Command::ActiveStreams { reply }).await
    }

    /// Subscribe to the normalized active-session view. Every delivery is
    /// the full validated set.
    pub async fn subscribe(
        &self,
    ) -> Result<broadcast::Receiver<Vec<StreamSession>>, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { reply })
            .await
            .map_err(|_| StreamError::CoordinatorClosed)?;
        rx.await.map_err(|_| StreamError::CoordinatorClosed)
    }

    async fn moderate(
        &self,
        stream_id: &str,
        by_user: &str,
        target: &str,
        ban: bool,
    ) -> Result<(), StreamError> {
        self.request(|reply| Command::Kick {
            stream_id: stream_id.to_string(),
            by_user: by_user.to_string(),
            target: target.to_string(),
            ban,
            reply,
        })
        .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, StreamError>>) -> Command,
    ) -> Result<T, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| StreamError::CoordinatorClosed)?;
        rx.await.map_err(|_| StreamError::CoordinatorClosed)?
    }
}

struct JoinedChannel {
    stream_id: String,
    user_id: String,
}

struct CoordinatorTask {
    store: SharedStore,
    tracker: ParticipationTracker,
    media: SharedMedia,
    config: CoordinatorConfig,
    /// Local mirror of the validated active set. Owned exclusively by this
    /// task; external callers go through the command channel.
    cache: HashMap<String, StreamSession>,
    joined_channel: Option<JoinedChannel>,
    subscribers: broadcast::Sender<Vec<StreamSession>>,
    commands: mpsc::Sender<Command>,
}

impl CoordinatorTask {
    async fn run(mut self, mut command_rx: mpsc::Receiver<Command>) {
        let mut snapshot_rx = match self.store.subscribe_active().await {
            Ok(rx) => Some(rx),
            Err(err) => {
                warn!(error = %err, "active-query subscription unavailable; running fetch-only");
                None
            }
        };
        let mut media_rx = self.media.subscribe_events();
        let mut snapshots_open = snapshot_rx.is_some();
        let mut media_open = true;

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                snapshot = recv_snapshot(&mut snapshot_rx), if snapshots_open => match snapshot {
                    Ok(batch) => self.reconcile(batch).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "active-query snapshots lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("active-query subscription closed");
                        snapshots_open = false;
                    }
                },
                event = media_rx.recv(), if media_open => match event {
                    Ok(event) => self.apply_media_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "media events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        media_open = false;
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Create {
                title,
                host_id,
                host_name,
                host_avatar,
                reply,
            } => {
                let result = self.create(&title, &host_id, &host_name, host_avatar).await;
                let _ = reply.send(result);
            }
            Command::Join {
                stream_id,
                user_id,
                user_name,
                user_avatar,
                reply,
            } => {
                let result = self
                    .join(&stream_id, &user_id, &user_name, user_avatar)
                    .await;
                let _ = reply.send(result);
            }
            Command::Leave {
                stream_id,
                user_id,
                reply,
            } => {
                let _ = reply.send(self.leave(&stream_id, &user_id).await);
            }
            Command::End {
                stream_id,
                reason,
                requested_by,
                reply,
            } => {
                let result = self.end(&stream_id, reason, requested_by.as_deref()).await;
                let _ = reply.send(result);
            }
            Command::Kick {
                stream_id,
                by_user,
                target,
                ban,
                reply,
            } => {
                let result = self.kick(&stream_id, &by_user, &target, ban).await;
                let _ = reply.send(result);
            }
            Command::SetMuted {
                stream_id,
                by_user,
                target,
                muted,
                reply,
            } => {
                let result = self.set_muted(&stream_id, &by_user, &target, muted).await;
                let _ = reply.send(result);
            }
            Command::ActiveStreams { reply } => {
                let _ = reply.send(self.refresh().await);
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(self.subscribers.subscribe());
                // New subscribers get the current view without waiting for
                // the next change.
                self.publish();
            }
            Command::Republish => {
                if let Err(err) = self.refresh().await {
                    debug!(error = %err, "deferred republish failed");
                }
            }
            Command::MediaJoin {
                stream_id,
                user_id,
                is_host,
            } => {
                self.join_media(&stream_id, &user_id, is_host).await;
            }
        }
    }

    async fn create(
        &mut self,
        title: &str,
        host_id: &str,
        host_name: &str,
        host_avatar: Option<String>,
    ) -> Result<String, StreamError> {
        if self.tracker.has_pointer(host_id).await? {
            // Best-effort pass; a transient failure here must not abort the
            // create, the pointer re-check decides.
            if let Err(err) = self.tracker.cleanup_orphaned_stream(host_id).await {
                warn!(user = %host_id, error = %err, "orphan cleanup before create failed");
            }
            if self.tracker.has_pointer(host_id).await? {
                return Err(StreamError::AlreadyInStream);
            }
        }

        let host = Participant::host(host_id, host_name, host_avatar);
        let session = StreamSession::new(title, host);
        let stream_id = session.id.clone();

        self.store.put_session(&session).await?;
        if let Err(err) = self.tracker.set_active_stream(host_id, &stream_id).await {
            // A pointer with no matching session is a ghost in the making;
            // roll the fragments back before surfacing the error.
            self.tracker
                .cleanup_partial_failure(host_id, &stream_id, PartialOp::Create)
                .await;
            return Err(err.into());
        }

        self.cache.insert(stream_id.clone(), session);
        self.publish();
        info!(stream = %stream_id, host = %host_id, "created stream");

        // The propagation wait is latency-hiding only; it runs off the
        // actor so other commands are never stalled behind it.
        self.schedule_media_join(stream_id.clone(), host_id.to_string(), true);

        Ok(stream_id)
    }

    async fn join(
        &mut self,
        stream_id: &str,
        user_id: &str,
        user_name: &str,
        user_avatar: Option<String>,
    ) -> Result<(), StreamError> {
        if self
            .tracker
            .is_user_in_another_stream(user_id, stream_id)
            .await?
        {
            return Err(StreamError::AlreadyInStream);
        }

        let mut session = self.resolve_session(stream_id).await?;
        if session.is_banned(user_id) {
            return Err(StreamError::NotAuthorized);
        }

        if session.has_participant(user_id) {
            // Already listed; still re-assert the pointer, which may have
            // been lost without the participant list changing.
            self.tracker.set_active_stream(user_id, stream_id).await?;
            self.cache.insert(stream_id.to_string(), session);
            return Ok(());
        }

        session.add_participant(Participant::viewer(user_id, user_name, user_avatar));
        if let Err(err) = self.store.patch_participants(&session).await {
            self.tracker
                .cleanup_partial_failure(user_id, stream_id, PartialOp::Join)
                .await;
            return Err(err.into());
        }
        if let Err(err) = self.tracker.set_active_stream(user_id, stream_id).await {
            self.tracker
                .cleanup_partial_failure(user_id, stream_id, PartialOp::Join)
                .await;
            return Err(err.into());
        }

        info!(stream = %stream_id, user = %user_id, viewers = session.viewer_count, "user joined stream");
        self.cache.insert(stream_id.to_string(), session);
        self.publish();
        self.join_media(stream_id, user_id, false).await;
        Ok(())
    }

    async fn leave(&mut self, stream_id: &str, user_id: &str) -> Result<(), StreamError> {
        if self
            .joined_channel
            .as_ref()
            .is_some_and(|j| j.stream_id == stream_id && j.user_id == user_id)
        {
            self.media.leave_channel().await;
            self.joined_channel = None;
        }

        let Some(mut session) = self.store.get_session(stream_id).await? else {
            // Deleted or never propagated: treat as already ended.
            debug!(stream = %stream_id, user = %user_id, "leave on missing session; treating as ended");
            if self.cache.remove(stream_id).is_some() {
                self.publish();
            }
            if let Err(err) = self.tracker.clear_active_stream(user_id).await {
                warn!(user = %user_id, error = %err, "pointer cleanup after missing session failed");
            }
            return Ok(());
        };

        // Pointer first, then the session mutation: a crash in between
        // leaves a participant entry the sweeper can reap, never a live
        // pointer at an inconsistent session.
        self.tracker.clear_active_stream(user_id).await?;

        if session.remove_participant(user_id).is_none() {
            debug!(stream = %stream_id, user = %user_id, "leave for user already absent");
        }

        if session.should_auto_end() {
            let reason = session.auto_end_reason();
            self.cache.insert(session.id.clone(), session);
            return self.end(stream_id, reason, None).await;
        }

        // The local cache must reflect the departure even when the remote
        // patch fails, so a remote hiccup never leaves this process holding
        // a participant no client can see.
        let patch_result = self.store.patch_participants(&session).await;
        self.cache.insert(stream_id.to_string(), session);
        self.publish();
        patch_result?;
        Ok(())
    }

    async fn end(
        &mut self,
        stream_id: &str,
        reason: EndReason,
        requested_by: Option<&str>,
    ) -> Result<(), StreamError> {
        match self.cache.get(stream_id) {
            Some(cached) if !cached.is_active => return Ok(()),
            Some(cached) => {
                if let Some(caller) = requested_by {
                    ensure_host(cached, caller)?;
                }
            }
            None => {
                if let Some(caller) = requested_by {
                    let session = self
                        .store
                        .get_session(stream_id)
                        .await?
                        .ok_or(StreamError::StreamNotFound)?;
                    if !session.is_active {
                        return Ok(());
                    }
                    ensure_host(&session, caller)?;
                }
            }
        }

        let handled = match self.store.end_stream_and_cleanup(stream_id, reason).await {
            Ok(handled) => handled,
            Err(err) => {
                warn!(stream = %stream_id, error = %err, "privileged termination failed; using client-side fallback");
                false
            }
        };
        if !handled {
            self.store.mark_ended(stream_id, reason).await?;
        }

        if self
            .joined_channel
            .as_ref()
            .is_some_and(|j| j.stream_id == stream_id)
        {
            self.media.leave_channel().await;
            self.joined_channel = None;
        }

        self.cache.remove(stream_id);
        self.publish();
        self.schedule_republish();
        info!(stream = %stream_id, ?reason, privileged = handled, "ended stream");
        Ok(())
    }

    async fn kick(
        &mut self,
        stream_id: &str,
        by_user: &str,
        target: &str,
        ban: bool,
    ) -> Result<(), StreamError> {
        let mut session = self.resolve_session(stream_id).await?;
        ensure_host(&session, by_user)?;

        if ban && !session.is_banned(target) {
            session.banned_user_ids.push(target.to_string());
        }
        let removed = session.remove_participant(target).is_some();
        if !removed && !ban {
            return Ok(());
        }

        if removed && session.should_auto_end() {
            let reason = session.auto_end_reason();
            if let Err(err) = self.tracker.clear_active_stream(target).await {
                warn!(user = %target, error = %err, "pointer cleanup after kick failed");
            }
            self.cache.insert(session.id.clone(), session);
            return self.end(stream_id, reason, None).await;
        }

        self.store.patch_participants(&session).await?;
        if removed {
            if let Err(err) = self.tracker.clear_active_stream(target).await {
                warn!(user = %target, error = %err, "pointer cleanup after kick failed");
            }
        }
        info!(stream = %stream_id, by = %by_user, user = %target, ban, "removed participant");
        self.cache.insert(stream_id.to_string(), session);
        self.publish();
        Ok(())
    }

    async fn set_muted(
        &mut self,
        stream_id: &str,
        by_user: &str,
        target: &str,
        muted: bool,
    ) -> Result<(), StreamError> {
        let mut session = self.resolve_session(stream_id).await?;
        if by_user != target {
            ensure_host(&session, by_user)?;
        }
        let Some(participant) = session.participant_mut(target) else {
            return Ok(());
        };
        participant.is_muted = muted;

        self.store.patch_participants(&session).await?;
        if by_user == target
            && self
                .joined_channel
                .as_ref()
                .is_some_and(|j| j.stream_id == stream_id && j.user_id == target)
        {
            self.media.mute_local_audio(muted).await;
        }
        self.cache.insert(stream_id.to_string(), session);
        self.publish();
        Ok(())
    }

    /// Fetch the active query, run the validation pass, and swap the cache
    /// to the validated set.
    async fn refresh(&mut self) -> Result<Vec<StreamSession>, StreamError> {
        let batch = self.store.list_active().await?;
        let valid = self.validate_batch(batch);
        self.cache = valid
            .iter()
            .map(|session| (session.id.clone(), session.clone()))
            .collect();
        self.publish();
        Ok(valid)
    }

    /// Snapshot push from the store: validate, diff the remote key set
    /// against the cache to evict vanished sessions, republish.
    async fn reconcile(&mut self, batch: Vec<StreamSession>) {
        let valid = self.validate_batch(batch);
        let remote_ids: std::collections::HashSet<String> =
            valid.iter().map(|s| s.id.clone()).collect();

        let evicted: Vec<String> = self
            .cache
            .keys()
            .filter(|id| !remote_ids.contains(*id))
            .cloned()
            .collect();
        for stream_id in evicted {
            debug!(stream = %stream_id, "evicting session no longer reported active");
            self.cache.remove(&stream_id);
        }
        for session in valid {
            self.cache.insert(session.id.clone(), session);
        }
        self.publish();
    }

    /// Callers must never observe a session that is about to be torn down:
    /// sessions failing the termination policy are withheld, scheduled for
    /// asynchronous termination, and kept out of the cache. Viewer-count
    /// drift is a defect to log and correct, never to trust.
    fn validate_batch(&self, batch: Vec<StreamSession>) -> Vec<StreamSession> {
        let mut valid = Vec::with_capacity(batch.len());
        for mut session in batch {
            if !session.is_active {
                continue;
            }
            if session.should_auto_end() {
                warn!(stream = %session.id, "phantom stream in active query; scheduling termination");
                self.schedule_end(session.id.clone(), session.auto_end_reason());
                continue;
            }
            if session.recount_viewers() {
                warn!(stream = %session.id, corrected = session.viewer_count, "viewer count mismatch corrected");
            }
            valid.push(session);
        }
        valid
    }

    async fn resolve_session(&mut self, stream_id: &str) -> Result<StreamSession, StreamError> {
        let session = match self.cache.get(stream_id) {
            Some(session) => session.clone(),
            None => self
                .store
                .get_session(stream_id)
                .await?
                .ok_or(StreamError::StreamNotFound)?,
        };
        if !session.is_active {
            return Err(StreamError::StreamEnded);
        }
        Ok(session)
    }

    async fn join_media(&mut self, stream_id: &str, user_id: &str, is_host: bool) {
        if !self.config.media_enabled {
            return;
        }
        if self.media.join_channel(stream_id, user_id, is_host).await {
            self.joined_channel = Some(JoinedChannel {
                stream_id: stream_id.to_string(),
                user_id: user_id.to_string(),
            });
        } else {
            // Non-fatal: the session stays valid in store-only mode.
            warn!(stream = %stream_id, user = %user_id, "media channel join failed; continuing store-only");
        }
    }

    /// Media reports are advisory over the coordinator's own state: they
    /// touch per-participant flags in the cache, never the store.
    fn apply_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::VolumeIndication { speakers } => {
                let Some(joined) = &self.joined_channel else {
                    return;
                };
                let Some(session) = self.cache.get_mut(&joined.stream_id) else {
                    return;
                };
                for participant in &mut session.participants {
                    participant.is_speaking = speakers
                        .iter()
                        .any(|(user_id, _)| user_id == &participant.user_id);
                }
                self.publish();
            }
            MediaEvent::ParticipantJoined { user_id } => {
                debug!(user = %user_id, "media reports participant joined");
            }
            MediaEvent::ParticipantLeft { user_id } => {
                debug!(user = %user_id, "media reports participant left");
            }
            MediaEvent::ConnectionStateChanged { state } => {
                debug!(%state, "media connection state changed");
            }
            MediaEvent::Warning { message } => {
                debug!(%message, "media warning");
            }
            MediaEvent::Error { message } => {
                warn!(%message, "media error");
            }
        }
    }

    fn schedule_media_join(&self, stream_id: String, user_id: String, is_host: bool) {
        if !self.config.media_enabled {
            return;
        }
        let commands = self.commands.clone();
        let delay = self.config.propagation_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = commands
                .send(Command::MediaJoin {
                    stream_id,
                    user_id,
                    is_host,
                })
                .await;
        });
    }

    fn schedule_republish(&self) {
        let commands = self.commands.clone();
        let delay = self.config.republish_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = commands.send(Command::Republish).await;
        });
    }

    fn schedule_end(&self, stream_id: String, reason: EndReason) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let (reply, rx) = oneshot::channel();
            let sent = commands
                .send(Command::End {
                    stream_id: stream_id.clone(),
                    reason,
                    requested_by: None,
                    reply,
                })
                .await;
            if sent.is_ok() {
                if let Ok(Err(err)) = rx.await {
                    warn!(stream = %stream_id, error = %err, "scheduled termination failed");
                }
            }
        });
    }

    fn publish(&self) {
        let mut view: Vec<StreamSession> = self.cache.values().cloned().collect();
        view.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        let _ = self.subscribers.send(view);
    }
}

fn ensure_host(session: &StreamSession, user_id: &str) -> Result<(), StreamError> {
    let is_host = session
        .participant(user_id)
        .map(|p| p.is_host)
        .unwrap_or(false);
    if is_host {
        Ok(())
    } else {
        Err(StreamError::NotAuthorized)
    }
}

async fn recv_snapshot(
    rx: &mut Option<broadcast::Receiver<Vec<StreamSession>>>,
) -> Result<Vec<StreamSession>, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => Err(broadcast::error::RecvError::Closed),
    }
}
