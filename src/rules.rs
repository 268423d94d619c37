//! Rules engine: legality, move application and terminal-status detection.
//!
//! Every function here is pure. Positions are immutable values, and the
//! position history needed for repetition detection is passed in explicitly.

use crate::error::RulesError;
use crate::move_generator::MoveGenerator;
use crate::position::{Move, Position};
use crate::zobrist::PositionKey;
use serde::{Deserialize, Serialize};

/// Number of occurrences of the same position that draws the game.
pub const REPETITION_LIMIT: usize = 3;

/// Rules-level classification of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulesStatus {
    Ongoing,
    Check,
    Checkmate,
    Stalemate,
    DrawFiftyMove,
    DrawRepetition,
    DrawInsufficientMaterial,
}

impl RulesStatus {
    /// True if no further moves may be played.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Ongoing | Self::Check)
    }
}

/// All legal moves in `position`, each tagged with its special-move kind.
pub fn legal_moves(position: &Position) -> Vec<Move> {
    MoveGenerator::new().generate_legal_moves(position)
}

/// Resolve a (possibly untagged) move to the matching legal move.
///
/// A caller-supplied tag must agree with the generated one.
pub fn resolve(position: &Position, mv: &Move) -> Result<Move, RulesError> {
    legal_moves(position)
        .into_iter()
        .find(|legal| legal.same_squares(mv) && (mv.tag.is_none() || mv.tag == legal.tag))
        .ok_or_else(|| illegal(position, mv))
}

/// Apply `mv` to `position`, producing the resulting position.
pub fn apply(position: &Position, mv: &Move) -> Result<Position, RulesError> {
    let legal = resolve(position, mv)?;
    Ok(position.play_unchecked(&legal))
}

/// Classify `position`. `history` holds the keys of every earlier position
/// of the game, oldest first, and is only consulted for repetition.
pub fn status(position: &Position, history: &[PositionKey]) -> RulesStatus {
    let generator = MoveGenerator::new();
    let in_check = generator.is_in_check(position);
    let has_moves = !generator.generate_legal_moves(position).is_empty();

    if !has_moves {
        return if in_check {
            RulesStatus::Checkmate
        } else {
            RulesStatus::Stalemate
        };
    }
    if position.has_insufficient_material() {
        return RulesStatus::DrawInsufficientMaterial;
    }
    if position.is_fifty_moves() {
        return RulesStatus::DrawFiftyMove;
    }
    if is_repetition(position, history) {
        return RulesStatus::DrawRepetition;
    }
    if in_check {
        RulesStatus::Check
    } else {
        RulesStatus::Ongoing
    }
}

fn is_repetition(position: &Position, history: &[PositionKey]) -> bool {
    // Positions before the last capture or pawn move can never recur
    let window = (position.halfmove_clock() as usize).min(history.len());
    let key = position.key();
    let earlier = history[history.len() - window..]
        .iter()
        .filter(|&&h| h == key)
        .count();
    earlier + 1 >= REPETITION_LIMIT
}

fn illegal(position: &Position, mv: &Move) -> RulesError {
    RulesError::IllegalMove {
        mv: mv.to_uci(),
        fen: position.to_fen(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::MoveTag;
    use crate::types::Square;

    fn uci(text: &str) -> Move {
        Move::from_uci(text).unwrap()
    }

    fn play_all(moves: &[&str]) -> (Position, Vec<PositionKey>) {
        let mut position = Position::starting();
        let mut history = Vec::new();
        for m in moves {
            history.push(position.key());
            position = apply(&position, &uci(m)).unwrap();
        }
        (position, history)
    }

    #[test]
    fn starting_position_has_twenty_moves() {
        assert_eq!(legal_moves(&Position::starting()).len(), 20);
        assert_eq!(status(&Position::starting(), &[]), RulesStatus::Ongoing);
    }

    #[test]
    fn apply_is_deterministic_and_pure() {
        let start = Position::starting();
        let a = apply(&start, &uci("g1f3")).unwrap();
        let b = apply(&start, &uci("g1f3")).unwrap();
        assert_eq!(a, b);
        assert_eq!(start, Position::starting());
    }

    #[test]
    fn apply_rejects_illegal_move() {
        let err = apply(&Position::starting(), &uci("e2e5")).unwrap_err();
        assert!(matches!(err, RulesError::IllegalMove { ref mv, .. } if mv == "e2e5"));
    }

    #[test]
    fn resolve_tags_special_moves() {
        let mv = resolve(&Position::starting(), &uci("e2e4")).unwrap();
        assert_eq!(mv.tag, Some(MoveTag::DoublePawnPush));

        let mut wrong = uci("e2e4");
        wrong.tag = Some(MoveTag::Castle);
        assert!(resolve(&Position::starting(), &wrong).is_err());
    }

    #[test]
    fn fools_mate_is_checkmate() {
        let (pos, history) = play_all(&["f2f3", "e7e5", "g2g4", "d8h4"]);
        assert_eq!(status(&pos, &history), RulesStatus::Checkmate);
        assert!(legal_moves(&pos).is_empty());
    }

    #[test]
    fn stalemate_detected() {
        let pos = Position::from_fen("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1").unwrap();
        assert_eq!(status(&pos, &[]), RulesStatus::Stalemate);
    }

    #[test]
    fn check_is_not_terminal() {
        let pos = Position::from_fen("rnbqkbnr/ppppp1pp/8/5p1Q/4P3/8/PPPP1PPP/RNB1KBNR b KQkq - 1 2").unwrap();
        let s = status(&pos, &[]);
        assert_eq!(s, RulesStatus::Check);
        assert!(!s.is_terminal());
    }

    #[test]
    fn fifty_move_rule() {
        let pos = Position::from_fen("4k3/8/8/8/8/8/8/R3K3 w - - 100 80").unwrap();
        assert_eq!(status(&pos, &[]), RulesStatus::DrawFiftyMove);
    }

    #[test]
    fn insufficient_material() {
        let pos = Position::from_fen("8/8/8/4k3/8/8/8/4K3 w - - 0 1").unwrap();
        assert_eq!(status(&pos, &[]), RulesStatus::DrawInsufficientMaterial);
    }

    #[test]
    fn threefold_repetition_by_knight_shuffle() {
        let shuffle = ["g1f3", "g8f6", "f3g1", "f6g8"];
        let (pos, history) = play_all(&shuffle);
        // Start position has now occurred twice
        assert_eq!(status(&pos, &history), RulesStatus::Ongoing);

        let twice: Vec<&str> = shuffle.iter().chain(shuffle.iter()).copied().collect();
        let (pos, history) = play_all(&twice);
        assert_eq!(status(&pos, &history), RulesStatus::DrawRepetition);
    }

    #[test]
    fn en_passant_capture_removes_pawn() {
        let (pos, _) = play_all(&["e2e4", "a7a6", "e4e5", "d7d5"]);
        let d6 = Square::parse("d6").unwrap();
        assert_eq!(pos.en_passant(), Some(d6));
        let after = apply(&pos, &uci("e5d6")).unwrap();
        assert!(after.piece_at(Square::parse("d5").unwrap()).is_none());
        assert_eq!(after.halfmove_clock(), 0);
    }

    #[test]
    fn promotion_requires_piece() {
        let pos = Position::from_fen("8/P7/8/8/8/8/8/4K2k w - - 0 1").unwrap();
        assert!(apply(&pos, &uci("a7a8")).is_err());
        let promoted = apply(&pos, &uci("a7a8n")).unwrap();
        assert_eq!(promoted.to_fen(), "N7/8/8/8/8/8/8/4K2k b - - 0 1");
    }
}
