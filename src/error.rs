//! Error taxonomy for the rules engine, sessions, codec, storage and registry.

use crate::session::GameId;
use crate::types::Color;

/// Invalid FEN or inconsistent position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PositionError {
    #[error("invalid FEN: {reason}")]
    InvalidFen { reason: String },
}

impl PositionError {
    pub(crate) fn fen(reason: impl Into<String>) -> Self {
        PositionError::InvalidFen {
            reason: reason.into(),
        }
    }
}

/// Malformed move notation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotationError {
    #[error("invalid UCI move: {0}")]
    InvalidUci(String),

    #[error("invalid SAN move: {0}")]
    InvalidSan(String),

    #[error("ambiguous SAN move: {0}")]
    AmbiguousSan(String),
}

/// Rules engine failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RulesError {
    #[error("illegal move {mv} in position {fen}")]
    IllegalMove { mv: String, fen: String },
}

/// Game session failures. All are local validation outcomes; none mutate state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("not your turn - it is {expected}'s turn")]
    WrongTurn { expected: Color },

    #[error("player {player} is not in this game")]
    NotAPlayer { player: String },

    #[error("game is already over: {status}")]
    GameTerminated { status: String },

    #[error(transparent)]
    IllegalMove(#[from] RulesError),

    #[error("session {game_id} was evicted; reload it from the registry")]
    Evicted { game_id: GameId },
}

/// History codec failures. Integrity errors are surfaced, never retried.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("corrupt session blob: {reason}")]
    CorruptData { reason: String },

    #[error("unsupported session blob version {found} (supported: {supported})")]
    UnsupportedVersion { found: u8, supported: u8 },

    #[error("replay of move {ply} failed: {source}")]
    ReplayValidation {
        ply: usize,
        #[source]
        source: RulesError,
    },

    #[error("replayed session disagrees with recorded state: {reason}")]
    ReplayMismatch { reason: String },

    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),
}

impl CodecError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        CodecError::CorruptData {
            reason: reason.into(),
        }
    }

    /// True for failures that mean the stored bytes cannot be trusted.
    pub fn is_integrity_failure(&self) -> bool {
        !matches!(self, CodecError::Compression(_))
    }
}

/// Session store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session {game_id} not found")]
    NotFound { game_id: GameId },

    #[error("revision conflict for session {game_id}: expected {expected:?}, found {actual:?}")]
    Conflict {
        game_id: GameId,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("storage backend error: {reason}")]
    Backend {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend {
            reason: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// PGN import failures.
#[derive(Debug, thiserror::Error)]
pub enum PgnError {
    #[error("missing required PGN tag [{0}]")]
    MissingTag(&'static str),

    #[error("invalid PGN: {0}")]
    Malformed(String),

    #[error("move {ply} ({token}) is not playable: {source}")]
    Move {
        ply: usize,
        token: String,
        #[source]
        source: NotationError,
    },

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Errors surfaced by the session registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pgn(#[from] PgnError),

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error("session store call for {game_id} timed out")]
    Timeout { game_id: GameId },

    #[error("registry is shutting down")]
    ShuttingDown,
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}
