//! Game session: one game's authoritative state and its move state machine.
//!
//! [`GameSession`] is a plain value mutated through `&mut self`; the
//! [`SessionHandle`] wraps it in a mutual-exclusion region so that every
//! `submit_move`/`terminate` runs validate, mutate and status recomputation
//! as one critical section.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::SessionError;
use crate::position::{Move, Position};
use crate::rules::{self, RulesStatus};
use crate::types::Color;
use crate::zobrist::PositionKey;

/// Unique identifier for a chess game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GameId(Uuid);

impl GameId {
    /// Create a new random game ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for GameId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for GameId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Authenticated player identity, supplied by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Session-level game status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    InProgress,
    CheckmateWhiteWins,
    CheckmateBlackWins,
    StalemateDraw,
    RuleDraw,
    Abandoned,
}

impl GameStatus {
    /// Returns true if the game has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Map a rules classification of the position reached after `mover` moved.
    pub const fn from_rules(status: RulesStatus, mover: Color) -> Self {
        match status {
            RulesStatus::Ongoing | RulesStatus::Check => Self::InProgress,
            RulesStatus::Checkmate => match mover {
                Color::White => Self::CheckmateWhiteWins,
                Color::Black => Self::CheckmateBlackWins,
            },
            RulesStatus::Stalemate => Self::StalemateDraw,
            RulesStatus::DrawFiftyMove
            | RulesStatus::DrawRepetition
            | RulesStatus::DrawInsufficientMaterial => Self::RuleDraw,
        }
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::CheckmateWhiteWins => write!(f, "checkmate_white_wins"),
            Self::CheckmateBlackWins => write!(f, "checkmate_black_wins"),
            Self::StalemateDraw => write!(f, "stalemate_draw"),
            Self::RuleDraw => write!(f, "rule_draw"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Why a game was ended from outside the move flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The given side resigned.
    Resignation(Color),
    /// The given side ran out of time.
    Timeout(Color),
    DrawAgreement,
    Aborted,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resignation(c) => write!(f, "{c} resigned"),
            Self::Timeout(c) => write!(f, "{c} timed out"),
            Self::DrawAgreement => write!(f, "draw agreed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// One applied move together with the position it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub mv: Move,
    pub position: Position,
    pub timestamp: DateTime<Utc>,
}

/// Observable effect of a successful move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOutcome {
    pub mv: Move,
    pub position: Position,
    pub status: GameStatus,
    pub rules_status: RulesStatus,
    pub revision: u64,
}

/// Authoritative state of one game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSession {
    id: GameId,
    white: PlayerId,
    black: PlayerId,
    initial: Position,
    created_at: DateTime<Utc>,
    history: Vec<HistoryEntry>,
    /// Keys of every position before the current one, oldest first.
    keys: Vec<PositionKey>,
    status: GameStatus,
    rules_status: RulesStatus,
    termination: Option<TerminationReason>,
    revision: u64,
}

impl GameSession {
    /// Start a game from the standard starting position.
    pub fn new(id: GameId, white: PlayerId, black: PlayerId) -> Self {
        Self::with_position(id, white, black, Position::starting(), now())
    }

    /// Start a game from an arbitrary (valid) position.
    pub fn with_position(
        id: GameId,
        white: PlayerId,
        black: PlayerId,
        initial: Position,
        created_at: DateTime<Utc>,
    ) -> Self {
        let rules_status = rules::status(&initial, &[]);
        let status = GameStatus::from_rules(rules_status, initial.side_to_move().opposite());
        GameSession {
            id,
            white,
            black,
            initial,
            created_at: created_at.trunc_subsecs(3),
            history: Vec::new(),
            keys: Vec::new(),
            status,
            rules_status,
            termination: None,
            revision: 0,
        }
    }

    pub fn id(&self) -> GameId {
        self.id
    }

    pub fn white(&self) -> &PlayerId {
        &self.white
    }

    pub fn black(&self) -> &PlayerId {
        &self.black
    }

    pub fn player(&self, color: Color) -> &PlayerId {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn initial_position(&self) -> &Position {
        &self.initial
    }

    /// The current position: the last history entry, or the initial position.
    pub fn position(&self) -> &Position {
        self.history.last().map_or(&self.initial, |e| &e.position)
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    /// Rules classification of the current position (distinguishes check).
    pub fn rules_status(&self) -> RulesStatus {
        self.rules_status
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn legal_moves(&self) -> Vec<Move> {
        if self.is_terminal() {
            return Vec::new();
        }
        rules::legal_moves(self.position())
    }

    /// Validate and apply a move submitted by `player`.
    pub fn submit_move(&mut self, mv: &Move, player: &PlayerId) -> Result<MoveOutcome, SessionError> {
        self.submit_move_at(mv, player, now())
    }

    pub(crate) fn submit_move_at(
        &mut self,
        mv: &Move,
        player: &PlayerId,
        timestamp: DateTime<Utc>,
    ) -> Result<MoveOutcome, SessionError> {
        self.ensure_in_progress()?;

        let to_move = self.position().side_to_move();
        if self.player(to_move) != player {
            if self.player(to_move.opposite()) == player {
                return Err(SessionError::WrongTurn { expected: to_move });
            }
            return Err(SessionError::NotAPlayer {
                player: player.to_string(),
            });
        }

        Ok(self.apply_move(mv, timestamp)?)
    }

    /// Apply a move for whichever side is to move. Shared by player
    /// submissions and history replay.
    pub(crate) fn apply_move(
        &mut self,
        mv: &Move,
        timestamp: DateTime<Utc>,
    ) -> Result<MoveOutcome, crate::error::RulesError> {
        let before = self.position().clone();
        let legal = rules::resolve(&before, mv)?;
        let after = before.play_unchecked(&legal);

        self.keys.push(before.key());
        let rules_status = rules::status(&after, &self.keys);
        let status = GameStatus::from_rules(rules_status, before.side_to_move());

        self.history.push(HistoryEntry {
            mv: legal,
            position: after.clone(),
            timestamp: timestamp.trunc_subsecs(3),
        });
        self.revision += 1;
        self.rules_status = rules_status;
        self.status = status;

        Ok(MoveOutcome {
            mv: legal,
            position: after,
            status,
            rules_status,
            revision: self.revision,
        })
    }

    /// End the game from outside the move flow (resignation, timeout, ...).
    pub fn terminate(&mut self, reason: TerminationReason) -> Result<GameStatus, SessionError> {
        self.ensure_in_progress()?;
        self.termination = Some(reason);
        self.status = GameStatus::Abandoned;
        self.revision += 1;
        Ok(self.status)
    }

    /// Reinstate persisted termination and revision after a history replay.
    pub(crate) fn restore(&mut self, termination: Option<TerminationReason>, revision: u64) {
        if termination.is_some() {
            self.termination = termination;
            self.status = GameStatus::Abandoned;
        }
        self.revision = revision;
    }

    fn ensure_in_progress(&self) -> Result<(), SessionError> {
        if self.status.is_terminal() {
            return Err(SessionError::GameTerminated {
                status: self.status.to_string(),
            });
        }
        Ok(())
    }
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Registry-side bookkeeping guarded by the same lock as the session.
#[derive(Debug)]
pub(crate) struct SessionSlot {
    pub(crate) session: GameSession,
    /// Revision last written to the session store (`None` = never saved).
    pub(crate) persisted_revision: Option<u64>,
    pub(crate) evicted: bool,
}

/// Shared, mutually-exclusive access to a live [`GameSession`].
///
/// Clones refer to the same session. After the registry evicts the session,
/// every operation on an outstanding handle fails with
/// [`SessionError::Evicted`] instead of mutating a detached copy.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: GameId,
    slot: Arc<Mutex<SessionSlot>>,
    last_active_ms: Arc<AtomicI64>,
}

impl SessionHandle {
    pub(crate) fn new(session: GameSession, persisted_revision: Option<u64>) -> Self {
        SessionHandle {
            id: session.id(),
            slot: Arc::new(Mutex::new(SessionSlot {
                session,
                persisted_revision,
                evicted: false,
            })),
            last_active_ms: Arc::new(AtomicI64::new(now_millis())),
        }
    }

    pub fn id(&self) -> GameId {
        self.id
    }

    /// True if both handles refer to the same live instance.
    pub fn ptr_eq(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Submit a move; the whole validate-mutate-recompute step holds the lock.
    pub async fn submit_move(&self, mv: &Move, player: &PlayerId) -> Result<MoveOutcome, SessionError> {
        let mut slot = self.lock_live().await?;
        let outcome = slot.session.submit_move(mv, player)?;
        tracing::debug!(
            game_id = %self.id,
            mv = %outcome.mv,
            revision = outcome.revision,
            status = %outcome.status,
            "move applied"
        );
        Ok(outcome)
    }

    pub async fn terminate(&self, reason: TerminationReason) -> Result<GameStatus, SessionError> {
        let mut slot = self.lock_live().await?;
        let status = slot.session.terminate(reason)?;
        tracing::info!(game_id = %self.id, %reason, "game terminated");
        Ok(status)
    }

    /// A consistent copy of the session state.
    pub async fn snapshot(&self) -> Result<GameSession, SessionError> {
        let slot = self.lock_live().await?;
        Ok(slot.session.clone())
    }

    /// Run `f` against the session while holding the lock.
    pub async fn read<R>(&self, f: impl FnOnce(&GameSession) -> R) -> Result<R, SessionError> {
        let slot = self.lock_live().await?;
        Ok(f(&slot.session))
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().await
    }

    pub(crate) async fn lock_live(&self) -> Result<MutexGuard<'_, SessionSlot>, SessionError> {
        let slot = self.slot.lock().await;
        if slot.evicted {
            return Err(SessionError::Evicted { game_id: self.id });
        }
        self.touch();
        Ok(slot)
    }

    pub(crate) fn touch(&self) {
        self.last_active_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }
}
