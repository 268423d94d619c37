//! Chess Session - Move Generator Module
//!
//! This module handles the generation of legal chess moves, including
//! all special moves (castling, en passant, pawn promotion).

use crate::position::{Move, Position};
use crate::types::*;

/// Direction offsets (file, rank) for sliding pieces
const ROOK_DIRECTIONS: [(i8, i8); 4] = [(0, 1), (0, -1), (-1, 0), (1, 0)];
const BISHOP_DIRECTIONS: [(i8, i8); 4] = [(-1, 1), (1, 1), (1, -1), (-1, -1)];
const QUEEN_DIRECTIONS: [(i8, i8); 8] = [
    (0, 1), (0, -1), (-1, 0), (1, 0),
    (-1, 1), (1, 1), (1, -1), (-1, -1),
];
const KING_DIRECTIONS: [(i8, i8); 8] = QUEEN_DIRECTIONS;
const KNIGHT_OFFSETS: [(i8, i8); 8] = [
    (1, 2), (-1, 2), (2, 1), (-2, 1),
    (2, -1), (-2, -1), (1, -2), (-1, -2),
];

/// Move generator for chess positions
#[derive(Debug, Clone, Copy, Default)]
pub struct MoveGenerator;

impl MoveGenerator {
    /// Create a new move generator
    pub fn new() -> Self {
        MoveGenerator
    }

    /// Generate all legal moves for the current position
    pub fn generate_legal_moves(&self, position: &Position) -> Vec<Move> {
        self.generate_pseudo_legal_moves(position)
            .into_iter()
            .filter(|mv| self.is_legal(position, mv))
            .collect()
    }

    /// Generate all pseudo-legal moves (may leave king in check)
    pub fn generate_pseudo_legal_moves(&self, position: &Position) -> Vec<Move> {
        let mut moves = Vec::with_capacity(64);
        let color = position.side_to_move();

        for (sq, piece) in position.pieces() {
            if piece.color != color {
                continue;
            }

            match piece.kind {
                PieceKind::Pawn => self.generate_pawn_moves(position, sq, color, &mut moves),
                PieceKind::Knight => self.generate_step_moves(position, sq, color, &KNIGHT_OFFSETS, &mut moves),
                PieceKind::Bishop => self.generate_sliding_moves(position, sq, color, &BISHOP_DIRECTIONS, &mut moves),
                PieceKind::Rook => self.generate_sliding_moves(position, sq, color, &ROOK_DIRECTIONS, &mut moves),
                PieceKind::Queen => self.generate_sliding_moves(position, sq, color, &QUEEN_DIRECTIONS, &mut moves),
                PieceKind::King => {
                    self.generate_step_moves(position, sq, color, &KING_DIRECTIONS, &mut moves);
                    self.generate_castling_moves(position, sq, color, &mut moves);
                }
            }
        }

        moves
    }

    /// Generate pawn moves from the given square
    fn generate_pawn_moves(&self, position: &Position, sq: Square, color: Color, moves: &mut Vec<Move>) {
        let direction = color.pawn_direction();
        let start_rank = if color == Color::White { 1 } else { 6 };
        let promo_rank = if color == Color::White { 7 } else { 0 };

        // Single push
        if let Some(to) = sq.offset(0, direction) {
            if position.piece_at(to).is_none() {
                if to.rank() == promo_rank {
                    push_promotions(sq, to, moves);
                } else {
                    moves.push(Move::new(sq, to));

                    // Double push from starting rank
                    if sq.rank() == start_rank {
                        if let Some(to2) = to.offset(0, direction) {
                            if position.piece_at(to2).is_none() {
                                moves.push(Move::double_push(sq, to2));
                            }
                        }
                    }
                }
            }
        }

        // Captures
        for df in [-1i8, 1] {
            let Some(to) = sq.offset(df, direction) else {
                continue;
            };

            // Regular capture
            if let Some(target) = position.piece_at(to) {
                if target.color != color {
                    if to.rank() == promo_rank {
                        push_promotions(sq, to, moves);
                    } else {
                        moves.push(Move::new(sq, to));
                    }
                }
            }

            // En passant capture
            if position.en_passant() == Some(to) {
                moves.push(Move::en_passant(sq, to));
            }
        }
    }

    /// Generate single-step moves (knight, king) from the given square
    fn generate_step_moves(
        &self,
        position: &Position,
        sq: Square,
        color: Color,
        offsets: &[(i8, i8)],
        moves: &mut Vec<Move>,
    ) {
        for &(df, dr) in offsets {
            let Some(to) = sq.offset(df, dr) else {
                continue;
            };
            match position.piece_at(to) {
                Some(target) if target.color == color => {}
                _ => moves.push(Move::new(sq, to)),
            }
        }
    }

    /// Generate moves for sliding pieces (bishop, rook, queen)
    fn generate_sliding_moves(
        &self,
        position: &Position,
        sq: Square,
        color: Color,
        directions: &[(i8, i8)],
        moves: &mut Vec<Move>,
    ) {
        for &(df, dr) in directions {
            let mut current = sq;
            while let Some(next) = current.offset(df, dr) {
                match position.piece_at(next) {
                    None => moves.push(Move::new(sq, next)),
                    Some(target) => {
                        if target.color != color {
                            moves.push(Move::new(sq, next));
                        }
                        break;
                    }
                }
                current = next;
            }
        }
    }

    /// Generate castling moves for the king on `sq`
    fn generate_castling_moves(&self, position: &Position, sq: Square, color: Color, moves: &mut Vec<Move>) {
        let rights = position.castling_rights();
        let rank = color.back_rank();
        let enemy = color.opposite();

        if Square::new(4, rank) != Some(sq) || self.is_square_attacked(position, sq, enemy) {
            return;
        }

        let empty = |files: &[u8]| {
            files
                .iter()
                .filter_map(|&f| Square::new(f, rank))
                .all(|s| position.piece_at(s).is_none())
        };
        let safe = |files: &[u8]| {
            files
                .iter()
                .filter_map(|&f| Square::new(f, rank))
                .all(|s| !self.is_square_attacked(position, s, enemy))
        };

        // Kingside castling (O-O)
        if rights.has(CastlingRights::kingside(color)) && empty(&[5, 6]) && safe(&[5, 6]) {
            if let Some(to) = Square::new(6, rank) {
                moves.push(Move::castling(sq, to));
            }
        }

        // Queenside castling (O-O-O)
        if rights.has(CastlingRights::queenside(color)) && empty(&[1, 2, 3]) && safe(&[2, 3]) {
            if let Some(to) = Square::new(2, rank) {
                moves.push(Move::castling(sq, to));
            }
        }
    }

    /// Check if a square is attacked by the specified color
    pub fn is_square_attacked(&self, position: &Position, sq: Square, by: Color) -> bool {
        let is = |s: Square, kinds: &[PieceKind]| {
            matches!(position.piece_at(s), Some(p) if p.color == by && kinds.contains(&p.kind))
        };

        // Check pawn attacks: an attacking pawn sits one rank behind, from its point of view
        let pawn_rank = -by.pawn_direction();
        for df in [-1i8, 1] {
            if let Some(s) = sq.offset(df, pawn_rank) {
                if is(s, &[PieceKind::Pawn]) {
                    return true;
                }
            }
        }

        // Check knight attacks
        if KNIGHT_OFFSETS
            .iter()
            .filter_map(|&(df, dr)| sq.offset(df, dr))
            .any(|s| is(s, &[PieceKind::Knight]))
        {
            return true;
        }

        // Check king attacks
        if KING_DIRECTIONS
            .iter()
            .filter_map(|&(df, dr)| sq.offset(df, dr))
            .any(|s| is(s, &[PieceKind::King]))
        {
            return true;
        }

        // Check sliding piece attacks (rook, queen)
        for &direction in &ROOK_DIRECTIONS {
            if self.check_sliding_attack(position, sq, direction, by, &[PieceKind::Rook, PieceKind::Queen]) {
                return true;
            }
        }

        // Check sliding piece attacks (bishop, queen)
        for &direction in &BISHOP_DIRECTIONS {
            if self.check_sliding_attack(position, sq, direction, by, &[PieceKind::Bishop, PieceKind::Queen]) {
                return true;
            }
        }

        false
    }

    /// Check if there's a sliding piece attacking along a direction
    fn check_sliding_attack(
        &self,
        position: &Position,
        sq: Square,
        (df, dr): (i8, i8),
        by: Color,
        kinds: &[PieceKind],
    ) -> bool {
        let mut current = sq;
        while let Some(next) = current.offset(df, dr) {
            if let Some(piece) = position.piece_at(next) {
                return piece.color == by && kinds.contains(&piece.kind);
            }
            current = next;
        }
        false
    }

    /// Check if a move is legal (doesn't leave own king in check)
    fn is_legal(&self, position: &Position, mv: &Move) -> bool {
        let mover = position.side_to_move();
        let next = position.play_unchecked(mv);
        match next.king_square(mover) {
            Some(king) => !self.is_square_attacked(&next, king, mover.opposite()),
            None => false,
        }
    }

    /// Check if the current side's king is in check
    pub fn is_in_check(&self, position: &Position) -> bool {
        let us = position.side_to_move();
        match position.king_square(us) {
            Some(king) => self.is_square_attacked(position, king, us.opposite()),
            None => false,
        }
    }

    /// Count leaf nodes of the legal move tree to `depth`.
    pub fn perft(&self, position: &Position, depth: usize) -> u64 {
        if depth == 0 {
            return 1;
        }

        let moves = self.generate_legal_moves(position);

        if depth == 1 {
            return moves.len() as u64;
        }

        moves
            .iter()
            .map(|mv| self.perft(&position.play_unchecked(mv), depth - 1))
            .sum()
    }
}

fn push_promotions(from: Square, to: Square, moves: &mut Vec<Move>) {
    for promo in PieceKind::PROMOTIONS {
        moves.push(Move::with_promotion(from, to, promo));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIWIPETE: &str = "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1";

    #[test]
    fn perft_starting_position() {
        let generator = MoveGenerator::new();
        let start = Position::starting();
        assert_eq!(generator.perft(&start, 1), 20);
        assert_eq!(generator.perft(&start, 2), 400);
        assert_eq!(generator.perft(&start, 3), 8_902);
    }

    #[test]
    fn perft_kiwipete() {
        let generator = MoveGenerator::new();
        let pos = Position::from_fen(KIWIPETE).unwrap();
        assert_eq!(generator.perft(&pos, 1), 48);
        assert_eq!(generator.perft(&pos, 2), 2_039);
    }

    #[test]
    fn perft_endgame_with_en_passant_pins() {
        let generator = MoveGenerator::new();
        let pos = Position::from_fen("8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1").unwrap();
        assert_eq!(generator.perft(&pos, 1), 14);
        assert_eq!(generator.perft(&pos, 2), 191);
        assert_eq!(generator.perft(&pos, 3), 2_812);
    }

    #[test]
    fn castling_blocked_through_check() {
        // Black rook on f8 covers f1, so white may not castle kingside
        let pos = Position::from_fen("4kr2/8/8/8/8/8/8/4K2R w K - 0 1").unwrap();
        let moves = MoveGenerator::new().generate_legal_moves(&pos);
        assert!(!moves.iter().any(|m| m.to == Square::G1 && m.from == Square::E1));
    }

    #[test]
    fn square_attack_detection() {
        let generator = MoveGenerator::new();
        let start = Position::starting();
        let f3 = Square::parse("f3").unwrap();
        assert!(generator.is_square_attacked(&start, f3, Color::White));
        assert!(!generator.is_square_attacked(&start, f3, Color::Black));
        assert!(!generator.is_in_check(&start));
    }
}
