//! Speaking indicators for voice channel members
//!
//! Each member's card lights up on evidence of activity (an inbound chunk or
//! an explicit activity signal) and goes dark once no new evidence arrives
//! for the timeout. Timers are tokio tasks that report back over a channel;
//! each carries a generation so a timer that fired just before being replaced
//! can't clear a fresh highlight.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use voxlink_common::UserId;
use voxlink_common::voice::{RosterEntry, VOICE_ACTIVITY_TIMEOUT_MS};

/// Default time a card stays highlighted after the last activity
pub const VOICE_ACTIVITY_TIMEOUT: Duration = Duration::from_millis(VOICE_ACTIVITY_TIMEOUT_MS);

// =============================================================================
// Types
// =============================================================================

/// Display state of one member of the shown voice channel
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSpeakerState {
    /// User identifier
    pub user_id: UserId,
    /// Display name
    pub username: String,
    /// Whether the user reported their microphone muted
    pub mic_muted: bool,
    /// Whether the card is highlighted as speaking
    pub is_card_speaking: bool,
    /// When activity was last seen
    pub last_activity: Option<Instant>,
}

impl RemoteSpeakerState {
    /// Fresh state for a roster entry
    pub fn new(entry: RosterEntry) -> Self {
        Self {
            user_id: entry.user_id,
            username: entry.username,
            mic_muted: false,
            is_card_speaking: false,
            last_activity: None,
        }
    }
}

/// Timer expiry delivered back to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityExpiry {
    /// User whose timer fired
    pub user_id: UserId,
    /// Generation of the timer that fired
    pub generation: u64,
}

/// A live per-user timer
struct ActivityTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

// =============================================================================
// Tracker
// =============================================================================

/// Roster of the shown voice channel with per-user speaking timers
///
/// Methods that spawn timers must be called inside a tokio runtime. Mutating
/// methods return true when the displayed roster changed.
pub struct VoiceActivityTracker {
    speakers: HashMap<UserId, RemoteSpeakerState>,
    timers: HashMap<UserId, ActivityTimer>,
    timeout: Duration,
    next_generation: u64,
    expiry_tx: mpsc::UnboundedSender<ActivityExpiry>,
}

impl VoiceActivityTracker {
    /// Create a tracker and the receiver its timers report to
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<ActivityExpiry>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let tracker = Self {
            speakers: HashMap::new(),
            timers: HashMap::new(),
            timeout,
            next_generation: 0,
            expiry_tx,
        };
        (tracker, expiry_rx)
    }

    /// Whether the user is in the roster
    pub fn contains(&self, user_id: UserId) -> bool {
        self.speakers.contains_key(&user_id)
    }

    /// State of one user
    pub fn get(&self, user_id: UserId) -> Option<&RemoteSpeakerState> {
        self.speakers.get(&user_id)
    }

    /// Number of users in the roster
    pub fn len(&self) -> usize {
        self.speakers.len()
    }

    /// Whether the roster is empty
    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }

    /// Number of live timers
    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    /// Roster sorted by username (case-insensitive), then id
    pub fn snapshot(&self) -> Vec<RemoteSpeakerState> {
        let mut roster: Vec<RemoteSpeakerState> = self.speakers.values().cloned().collect();
        roster.sort_by(|a, b| {
            a.username
                .to_lowercase()
                .cmp(&b.username.to_lowercase())
                .then(a.user_id.cmp(&b.user_id))
        });
        roster
    }

    /// Add a user; an existing entry only has its name updated
    pub fn insert(&mut self, entry: RosterEntry) -> bool {
        match self.speakers.get_mut(&entry.user_id) {
            Some(existing) => {
                if existing.username == entry.username {
                    return false;
                }
                existing.username = entry.username;
            }
            None => {
                self.speakers
                    .insert(entry.user_id, RemoteSpeakerState::new(entry));
            }
        }
        true
    }

    /// Remove a user and cancel their timer
    pub fn remove(&mut self, user_id: UserId) -> bool {
        self.cancel_timer(user_id);
        self.speakers.remove(&user_id).is_some()
    }

    /// Replace the whole roster, keeping state of users still present
    pub fn replace_roster(&mut self, entries: Vec<RosterEntry>) {
        let mut next: HashMap<UserId, RemoteSpeakerState> = HashMap::with_capacity(entries.len());
        for entry in entries {
            let state = match self.speakers.remove(&entry.user_id) {
                Some(mut state) => {
                    state.username = entry.username;
                    state
                }
                None => RemoteSpeakerState::new(entry),
            };
            next.insert(state.user_id, state);
        }
        // Whoever is left over departed
        let departed: Vec<UserId> = self.speakers.keys().copied().collect();
        for user_id in departed {
            self.cancel_timer(user_id);
        }
        self.speakers = next;
    }

    /// Drop every user and timer
    pub fn clear(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        self.speakers.clear();
    }

    /// Record evidence that the user is speaking
    ///
    /// Highlights the card and restarts the user's timer. Unknown users are
    /// ignored. Returns true if the card was not highlighted before.
    pub fn record_activity(&mut self, user_id: UserId) -> bool {
        let Some(state) = self.speakers.get_mut(&user_id) else {
            return false;
        };
        let changed = !state.is_card_speaking;
        state.is_card_speaking = true;
        state.last_activity = Some(Instant::now());
        self.restart_timer(user_id);
        changed
    }

    /// Clear the highlight immediately and cancel the timer
    pub fn clear_activity(&mut self, user_id: UserId) -> bool {
        self.cancel_timer(user_id);
        match self.speakers.get_mut(&user_id) {
            Some(state) if state.is_card_speaking => {
                state.is_card_speaking = false;
                true
            }
            _ => false,
        }
    }

    /// Apply a timer expiry
    ///
    /// Only the newest timer for the user counts; stale expiries are ignored.
    pub fn expire(&mut self, expiry: ActivityExpiry) -> bool {
        match self.timers.get(&expiry.user_id) {
            Some(timer) if timer.generation == expiry.generation => {
                self.timers.remove(&expiry.user_id);
            }
            _ => return false,
        }
        match self.speakers.get_mut(&expiry.user_id) {
            Some(state) if state.is_card_speaking => {
                state.is_card_speaking = false;
                true
            }
            _ => false,
        }
    }

    /// Update a user's reported microphone state
    pub fn set_mic_muted(&mut self, user_id: UserId, muted: bool) -> bool {
        match self.speakers.get_mut(&user_id) {
            Some(state) if state.mic_muted != muted => {
                state.mic_muted = muted;
                true
            }
            _ => false,
        }
    }

    /// Cancel any pending timer and start a new one
    fn restart_timer(&mut self, user_id: UserId) {
        self.cancel_timer(user_id);

        self.next_generation += 1;
        let generation = self.next_generation;
        let deadline = Instant::now() + self.timeout;
        let expiry_tx = self.expiry_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = expiry_tx.send(ActivityExpiry {
                user_id,
                generation,
            });
        });

        self.timers
            .insert(user_id, ActivityTimer { generation, handle });
    }

    fn cancel_timer(&mut self, user_id: UserId) {
        if let Some(timer) = self.timers.remove(&user_id) {
            timer.handle.abort();
        }
    }
}

impl Drop for VoiceActivityTracker {
    fn drop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
