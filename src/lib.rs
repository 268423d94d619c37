//! Chess Session - game session engine
//!
//! Hosts chess games for a backend service:
//! - Full FIDE rules (castling, en passant, promotion, check, mate,
//!   stalemate, fifty-move, threefold repetition, insufficient material)
//! - Per-game session state machine with serialized move submission
//! - Compact, versioned, compressed move-history codec with replay
//!   validation on decode
//! - Session store boundary with optimistic concurrency (memory, SQLite)
//! - Session registry with single-instance load, eviction and drain
//! - FEN, UCI, SAN and PGN notation

pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod move_generator;
pub mod pgn;
pub mod position;
pub mod registry;
pub mod rules;
pub mod san;
pub mod session;
pub mod storage;
pub mod types;
pub mod zobrist;

pub use codec::HistoryCodec;
pub use error::{CodecError, RegistryError, RulesError, SessionError, StoreError};
pub use position::{Move, Position};
pub use registry::SessionRegistry;
pub use rules::RulesStatus;
pub use session::{GameId, GameSession, GameStatus, PlayerId, SessionHandle, TerminationReason};
pub use types::{Color, PieceKind, Square};
