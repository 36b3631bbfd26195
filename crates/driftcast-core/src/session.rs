use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fallback label applied when a session is created with an empty title.
/// A title must never persist as empty.
pub const DEFAULT_TITLE: &str = "Live stream";

/// One member of a live session. `is_host` is a role, not an identity: a
/// user can stop being host by leaving while remaining tracked elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub is_speaking: bool,
    #[serde(default)]
    pub is_muted: bool,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn host(user_id: impl Into<String>, name: impl Into<String>, avatar: Option<String>) -> Self {
        Self::new(user_id, name, avatar, true)
    }

    pub fn viewer(
        user_id: impl Into<String>,
        name: impl Into<String>,
        avatar: Option<String>,
    ) -> Self {
        Self::new(user_id, name, avatar, false)
    }

    fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        avatar: Option<String>,
        is_host: bool,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            avatar,
            is_host,
            is_speaking: false,
            is_muted: false,
            joined_at: Utc::now(),
        }
    }
}

/// Why a session stopped being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The host asked for the session to end.
    HostEnded,
    /// The last host-role participant left; remaining viewers are orphaned.
    HostLeft,
    /// The participant list drained to zero.
    Empty,
    /// The sweeper found the session stale past the activity threshold.
    Timeout,
}

/// A live broadcast session document as persisted in the remote store.
///
/// Optional fields are structurally omitted when absent, so the store never
/// receives partially-specified documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSession {
    pub id: String,
    pub title: String,
    pub host_user_id: String,
    /// Insertion order is join order.
    pub participants: Vec<Participant>,
    pub started_at: DateTime<Utc>,
    pub is_active: bool,
    /// Derived, cached count of non-host participants. A mismatch against
    /// the participant list is a defect to correct on reconciliation,
    /// never trusted blindly.
    pub viewer_count: u32,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub banned_user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

impl StreamSession {
    /// Build the initial session with the host as sole participant.
    pub fn new(title: &str, host: Participant) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: normalize_title(title),
            host_user_id: host.user_id.clone(),
            participants: vec![host],
            started_at: now,
            is_active: true,
            viewer_count: 0,
            last_activity_at: now,
            banned_user_ids: Vec::new(),
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant(user_id).is_some()
    }

    pub fn has_host(&self) -> bool {
        self.participants.iter().any(|p| p.is_host)
    }

    pub fn is_banned(&self, user_id: &str) -> bool {
        self.banned_user_ids.iter().any(|id| id == user_id)
    }

    /// Append a participant and refresh the derived counters.
    pub fn add_participant(&mut self, participant: Participant) {
        self.participants.push(participant);
        self.recount_viewers();
        self.last_activity_at = Utc::now();
    }

    /// Remove a participant by user id, returning the removed entry.
    pub fn remove_participant(&mut self, user_id: &str) -> Option<Participant> {
        let index = self.participants.iter().position(|p| p.user_id == user_id)?;
        let removed = self.participants.remove(index);
        self.recount_viewers();
        self.last_activity_at = Utc::now();
        Some(removed)
    }

    /// Count of non-host participants per the participant list itself.
    pub fn expected_viewer_count(&self) -> u32 {
        self.participants.iter().filter(|p| !p.is_host).count() as u32
    }

    /// Re-derive `viewer_count`. Returns true when the cached value was
    /// wrong and had to be corrected.
    pub fn recount_viewers(&mut self) -> bool {
        let expected = self.expected_viewer_count();
        let corrected = self.viewer_count != expected;
        self.viewer_count = expected;
        corrected
    }

    /// Auto-termination policy, shared by the coordinator and the sweeper.
    ///
    /// A session with viewers but no host is an abandoned broadcast; a
    /// session with zero participants is defensively covered as well.
    pub fn should_auto_end(&self) -> bool {
        self.participants.is_empty() || !self.has_host()
    }

    /// The reason a policy-triggered termination reports.
    pub fn auto_end_reason(&self) -> EndReason {
        if self.participants.is_empty() {
            EndReason::Empty
        } else {
            EndReason::HostLeft
        }
    }

    pub fn mark_ended(&mut self, reason: EndReason) {
        self.is_active = false;
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(reason);
    }
}

/// Per-user mutual-exclusion marker: the single stream a user currently
/// occupies. Its presence, independent of any participant list, is the
/// ground truth for "is this user in a stream".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveStreamPointer {
    pub user_id: String,
    pub stream_id: String,
    pub updated_at: DateTime<Utc>,
}

impl ActiveStreamPointer {
    pub fn new(user_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            stream_id: stream_id.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Default empty or whitespace-only titles to the fallback label.
pub fn normalize_title(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_host() -> StreamSession {
        StreamSession::new("morning show", Participant::host("host-1", "Ana", None))
    }

    #[test]
    fn new_session_has_host_as_sole_participant() {
        let session = session_with_host();
        assert!(session.is_active);
        assert_eq!(session.participants.len(), 1);
        assert_eq!(session.viewer_count, 0);
        assert!(session.has_host());
        assert!(!session.should_auto_end());
    }

    #[test]
    fn titles_never_persist_empty() {
        assert_eq!(normalize_title("   "), DEFAULT_TITLE);
        assert_eq!(normalize_title(""), DEFAULT_TITLE);
        assert_eq!(normalize_title("  chill beats  "), "chill beats");
    }

    #[test]
    fn viewer_count_tracks_non_host_participants() {
        let mut session = session_with_host();
        session.add_participant(Participant::viewer("v-1", "Bo", None));
        session.add_participant(Participant::viewer("v-2", "Cy", None));
        assert_eq!(session.viewer_count, 2);

        session.remove_participant("v-1");
        assert_eq!(session.viewer_count, 1);
    }

    #[test]
    fn recount_corrects_drifted_viewer_count() {
        let mut session = session_with_host();
        session.add_participant(Participant::viewer("v-1", "Bo", None));
        session.viewer_count = 7;
        assert!(session.recount_viewers());
        assert_eq!(session.viewer_count, 1);
        assert!(!session.recount_viewers());
    }

    #[test]
    fn session_without_host_role_is_abandoned() {
        let mut session = session_with_host();
        session.add_participant(Participant::viewer("v-1", "Bo", None));
        session.remove_participant("host-1");
        assert!(!session.participants.is_empty());
        assert!(session.should_auto_end());
        assert_eq!(session.auto_end_reason(), EndReason::HostLeft);
    }

    #[test]
    fn empty_session_should_end() {
        let mut session = session_with_host();
        session.remove_participant("host-1");
        assert!(session.should_auto_end());
        assert_eq!(session.auto_end_reason(), EndReason::Empty);
    }

    #[test]
    fn optional_fields_are_omitted_from_documents() {
        let session = session_with_host();
        let json = serde_json::to_value(&session).unwrap();
        let doc = json.as_object().unwrap();
        assert!(!doc.contains_key("ended_at"));
        assert!(!doc.contains_key("end_reason"));
        assert!(!doc.contains_key("banned_user_ids"));
    }
}
