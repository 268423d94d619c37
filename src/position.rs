//! Chess Session - Position Representation Module
//!
//! This module provides the immutable [`Position`] value and the [`Move`]
//! type. It includes strict FEN parsing and generation, move execution
//! producing a fresh position, and the per-position rule checks that do not
//! need move generation (insufficient material, fifty-move counter).

use crate::error::{NotationError, PositionError};
use crate::move_generator::MoveGenerator;
use crate::types::*;
use crate::zobrist::{PositionKey, ZobristKeys};
use std::fmt;

/// Starting position FEN
pub const STARTING_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Special-move tag attached by the move generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveTag {
    Castle,
    EnPassant,
    DoublePawnPush,
}

/// Represents a chess move
///
/// A move only has meaning relative to the position it was generated
/// against. Moves parsed from notation carry no tag; [`crate::rules::apply`]
/// resolves them to the tagged legal move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Move {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<PieceKind>,
    pub tag: Option<MoveTag>,
}

impl Move {
    /// Create a new move
    pub const fn new(from: Square, to: Square) -> Self {
        Move { from, to, promotion: None, tag: None }
    }

    /// Create a promotion move
    pub const fn with_promotion(from: Square, to: Square, promotion: PieceKind) -> Self {
        Move { from, to, promotion: Some(promotion), tag: None }
    }

    /// Create a castling move (king's origin and destination)
    pub const fn castling(from: Square, to: Square) -> Self {
        Move { from, to, promotion: None, tag: Some(MoveTag::Castle) }
    }

    /// Create an en passant move
    pub const fn en_passant(from: Square, to: Square) -> Self {
        Move { from, to, promotion: None, tag: Some(MoveTag::EnPassant) }
    }

    /// Create a two-square pawn advance
    pub const fn double_push(from: Square, to: Square) -> Self {
        Move { from, to, promotion: None, tag: Some(MoveTag::DoublePawnPush) }
    }

    /// Same origin, destination and promotion; tags are ignored.
    pub fn same_squares(&self, other: &Move) -> bool {
        self.from == other.from && self.to == other.to && self.promotion == other.promotion
    }

    /// Convert move to UCI notation (e.g., "e2e4", "e7e8q")
    pub fn to_uci(&self) -> String {
        let mut uci = format!("{}{}", self.from, self.to);
        if let Some(kind) = self.promotion {
            uci.push(kind.to_char());
        }
        uci
    }

    /// Parse UCI notation. The result carries no special-move tag.
    pub fn from_uci(text: &str) -> Result<Self, NotationError> {
        let invalid = || NotationError::InvalidUci(text.to_string());
        if !text.is_ascii() || !(4..=5).contains(&text.len()) {
            return Err(invalid());
        }
        let from = Square::parse(&text[0..2]).ok_or_else(invalid)?;
        let to = Square::parse(&text[2..4]).ok_or_else(invalid)?;
        if from == to {
            return Err(invalid());
        }
        let promotion = match text[4..].chars().next() {
            None => None,
            Some(c) => match PieceKind::from_char(c) {
                Some(kind) if PieceKind::PROMOTIONS.contains(&kind) && c.is_ascii_lowercase() => {
                    Some(kind)
                }
                _ => return Err(invalid()),
            },
        };
        Ok(Move { from, to, promotion, tag: None })
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uci())
    }
}

/// Chess position
///
/// Immutable once constructed: [`Position::play_unchecked`] returns a new
/// value. The en-passant target is only recorded when an enemy pawn could
/// capture onto it, so equal placements hash to equal keys.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Position {
    squares: [Option<Piece>; 64],
    side_to_move: Color,
    castling: CastlingRights,
    en_passant: Option<Square>,
    halfmove_clock: u32,
    fullmove_number: u32,
}

impl Position {
    /// The standard starting position
    pub fn starting() -> Self {
        let mut squares = [None; 64];
        let back = [
            PieceKind::Rook,
            PieceKind::Knight,
            PieceKind::Bishop,
            PieceKind::Queen,
            PieceKind::King,
            PieceKind::Bishop,
            PieceKind::Knight,
            PieceKind::Rook,
        ];
        for (file, kind) in back.iter().enumerate() {
            squares[file] = Some(Piece::new(*kind, Color::White));
            squares[8 + file] = Some(Piece::new(PieceKind::Pawn, Color::White));
            squares[48 + file] = Some(Piece::new(PieceKind::Pawn, Color::Black));
            squares[56 + file] = Some(Piece::new(*kind, Color::Black));
        }
        Position {
            squares,
            side_to_move: Color::White,
            castling: CastlingRights::ALL,
            en_passant: None,
            halfmove_clock: 0,
            fullmove_number: 1,
        }
    }

    /// Create a position from a FEN string, rejecting anything that could
    /// not arise in a legal game.
    pub fn from_fen(fen: &str) -> Result<Self, PositionError> {
        let parts: Vec<&str> = fen.split_whitespace().collect();
        if parts.len() != 6 {
            return Err(PositionError::fen(format!(
                "must have 6 space-separated fields, found {}",
                parts.len()
            )));
        }

        let squares = parse_placement(parts[0])?;

        let side_to_move = match parts[1] {
            "w" => Color::White,
            "b" => Color::Black,
            other => return Err(PositionError::fen(format!("bad side to move '{other}'"))),
        };

        let mut castling = CastlingRights::NONE;
        if parts[2] != "-" {
            for c in parts[2].chars() {
                let flag = match c {
                    'K' => CastlingRights::WHITE_KINGSIDE,
                    'Q' => CastlingRights::WHITE_QUEENSIDE,
                    'k' => CastlingRights::BLACK_KINGSIDE,
                    'q' => CastlingRights::BLACK_QUEENSIDE,
                    _ => return Err(PositionError::fen(format!("bad castling field '{}'", parts[2]))),
                };
                if castling.has(flag) {
                    return Err(PositionError::fen(format!("repeated castling flag '{c}'")));
                }
                castling = castling.with(flag);
            }
        }

        let en_passant = match parts[3] {
            "-" => None,
            name => Some(
                Square::parse(name)
                    .ok_or_else(|| PositionError::fen(format!("bad en passant square '{name}'")))?,
            ),
        };

        let halfmove_clock: u32 = parts[4]
            .parse()
            .map_err(|_| PositionError::fen(format!("bad halfmove clock '{}'", parts[4])))?;
        let fullmove_number: u32 = parts[5]
            .parse()
            .map_err(|_| PositionError::fen(format!("bad fullmove number '{}'", parts[5])))?;
        if fullmove_number == 0 {
            return Err(PositionError::fen("fullmove number must be at least 1"));
        }

        let mut position = Position {
            squares,
            side_to_move,
            castling,
            en_passant: None,
            halfmove_clock,
            fullmove_number,
        };

        position.validate_kings()?;
        position.validate_pawns()?;
        position.validate_castling()?;
        if let Some(ep) = en_passant {
            position.validate_en_passant(ep)?;
            if position.can_capture_en_passant(ep) {
                position.en_passant = Some(ep);
            }
        }

        let generator = MoveGenerator::new();
        let waiting = side_to_move.opposite();
        if let Some(king) = position.king_square(waiting) {
            if generator.is_square_attacked(&position, king, side_to_move) {
                return Err(PositionError::fen(format!("{waiting} is in check but not to move")));
            }
        }

        Ok(position)
    }

    /// Generate FEN string from current position
    pub fn to_fen(&self) -> String {
        let mut fen = String::new();

        // Piece placement
        for rank in (0..8).rev() {
            let mut empty_count = 0;
            for file in 0..8 {
                match self.squares[rank * 8 + file] {
                    None => empty_count += 1,
                    Some(piece) => {
                        if empty_count > 0 {
                            fen.push_str(&empty_count.to_string());
                            empty_count = 0;
                        }
                        fen.push(piece.to_fen_char());
                    }
                }
            }
            if empty_count > 0 {
                fen.push_str(&empty_count.to_string());
            }
            if rank > 0 {
                fen.push('/');
            }
        }

        fen.push(' ');
        fen.push(match self.side_to_move {
            Color::White => 'w',
            Color::Black => 'b',
        });

        fen.push(' ');
        fen.push_str(&self.castling.to_string());

        fen.push(' ');
        match self.en_passant {
            Some(sq) => fen.push_str(&sq.to_string()),
            None => fen.push('-'),
        }

        fen.push_str(&format!(" {} {}", self.halfmove_clock, self.fullmove_number));

        fen
    }

    pub fn piece_at(&self, sq: Square) -> Option<Piece> {
        self.squares[sq.index()]
    }

    pub fn side_to_move(&self) -> Color {
        self.side_to_move
    }

    pub fn castling_rights(&self) -> CastlingRights {
        self.castling
    }

    pub fn en_passant(&self) -> Option<Square> {
        self.en_passant
    }

    /// Half-moves since the last pawn move or capture (for the 50-move rule)
    pub fn halfmove_clock(&self) -> u32 {
        self.halfmove_clock
    }

    pub fn fullmove_number(&self) -> u32 {
        self.fullmove_number
    }

    /// Zobrist key for repetition detection
    pub fn key(&self) -> PositionKey {
        ZobristKeys::global().hash_position(self)
    }

    /// True if this is exactly the standard starting position.
    pub fn is_standard_start(&self) -> bool {
        *self == Position::starting()
    }

    /// Find the king's square for the specified color
    pub fn king_square(&self, color: Color) -> Option<Square> {
        let king = Piece::new(PieceKind::King, color);
        Square::all().find(|&sq| self.squares[sq.index()] == Some(king))
    }

    /// Occupied squares with their pieces, a1 first.
    pub fn pieces(&self) -> impl Iterator<Item = (Square, Piece)> + '_ {
        Square::all().filter_map(move |sq| self.squares[sq.index()].map(|p| (sq, p)))
    }

    /// Occupied squares as `<piece><square>` terms (e.g. "Pa2", "ke8"), the
    /// document form used to index positions for search.
    pub fn terms(&self) -> Vec<String> {
        self.pieces()
            .map(|(sq, piece)| format!("{}{}", piece.to_fen_char(), sq))
            .collect()
    }

    /// Check if the 50-move rule applies (draw)
    pub fn is_fifty_moves(&self) -> bool {
        self.halfmove_clock >= 100
    }

    /// Check for insufficient material to checkmate
    pub fn has_insufficient_material(&self) -> bool {
        let pieces: Vec<(Square, Piece)> = self
            .pieces()
            .filter(|(_, p)| p.kind != PieceKind::King)
            .collect();

        match pieces.as_slice() {
            // Only kings left
            [] => true,
            // King and minor piece vs King
            [(_, p)] => matches!(p.kind, PieceKind::Knight | PieceKind::Bishop),
            // King + Bishop vs King + Bishop (same color squares)
            [(sq1, p1), (sq2, p2)] => {
                p1.kind == PieceKind::Bishop
                    && p2.kind == PieceKind::Bishop
                    && p1.color != p2.color
                    && sq1.is_dark() == sq2.is_dark()
            }
            _ => false,
        }
    }

    /// Execute a move without checking legality. The move must come from the
    /// move generator for this position.
    pub(crate) fn play_unchecked(&self, mv: &Move) -> Position {
        let mut next = self.clone();
        let us = self.side_to_move;
        let from = mv.from;
        let to = mv.to;
        let Some(piece) = self.squares[from.index()] else {
            return next;
        };
        let captured = self.squares[to.index()];

        // Update halfmove clock
        if piece.kind == PieceKind::Pawn || captured.is_some() || mv.tag == Some(MoveTag::EnPassant) {
            next.halfmove_clock = 0;
        } else {
            next.halfmove_clock += 1;
        }

        // Handle en passant capture
        if mv.tag == Some(MoveTag::EnPassant) {
            if let Some(victim) = to.offset(0, -us.pawn_direction()) {
                next.squares[victim.index()] = None;
            }
        }

        // Handle castling: move the rook next to the king
        if mv.tag == Some(MoveTag::Castle) {
            let rank = us.back_rank();
            let (rook_from, rook_to) = if to.file() == 6 { (7, 5) } else { (0, 3) };
            if let (Some(rf), Some(rt)) = (Square::new(rook_from, rank), Square::new(rook_to, rank)) {
                next.squares[rt.index()] = next.squares[rf.index()].take();
            }
        }

        // Move the piece, promoting if requested
        next.squares[from.index()] = None;
        next.squares[to.index()] = Some(match mv.promotion {
            Some(kind) => Piece::new(kind, us),
            None => piece,
        });

        // Update castling rights
        if piece.kind == PieceKind::King {
            next.castling = next
                .castling
                .without(CastlingRights::kingside(us) | CastlingRights::queenside(us));
        }

        // If rook moves or is captured
        for (corner, flag) in [
            (Square::A1, CastlingRights::WHITE_QUEENSIDE),
            (Square::H1, CastlingRights::WHITE_KINGSIDE),
            (Square::A8, CastlingRights::BLACK_QUEENSIDE),
            (Square::H8, CastlingRights::BLACK_KINGSIDE),
        ] {
            if from == corner || to == corner {
                next.castling = next.castling.without(flag);
            }
        }

        // Switch side to move
        if us == Color::Black {
            next.fullmove_number += 1;
        }
        next.side_to_move = us.opposite();

        // Update en passant square
        next.en_passant = None;
        if mv.tag == Some(MoveTag::DoublePawnPush) {
            if let Some(target) = from.offset(0, us.pawn_direction()) {
                if next.can_capture_en_passant(target) {
                    next.en_passant = Some(target);
                }
            }
        }

        next
    }

    /// True if a pawn of the side to move stands beside the pawn that just
    /// double-pushed past `target`.
    fn can_capture_en_passant(&self, target: Square) -> bool {
        let mover = self.side_to_move;
        let Some(pushed) = target.offset(0, -mover.pawn_direction()) else {
            return false;
        };
        let own_pawn = Some(Piece::new(PieceKind::Pawn, mover));
        [-1i8, 1]
            .iter()
            .filter_map(|&df| pushed.offset(df, 0))
            .any(|sq| self.squares[sq.index()] == own_pawn)
    }

    fn validate_kings(&self) -> Result<(), PositionError> {
        for color in [Color::White, Color::Black] {
            let count = self
                .pieces()
                .filter(|(_, p)| p.kind == PieceKind::King && p.color == color)
                .count();
            if count != 1 {
                return Err(PositionError::fen(format!(
                    "{color} must have exactly one king, found {count}"
                )));
            }
        }
        Ok(())
    }

    fn validate_pawns(&self) -> Result<(), PositionError> {
        match self
            .pieces()
            .find(|(sq, p)| p.kind == PieceKind::Pawn && (sq.rank() == 0 || sq.rank() == 7))
        {
            Some((sq, _)) => Err(PositionError::fen(format!("pawn on back rank at {sq}"))),
            None => Ok(()),
        }
    }

    fn validate_castling(&self) -> Result<(), PositionError> {
        for color in [Color::White, Color::Black] {
            let rank = color.back_rank();
            let king_home = Square::new(4, rank).map(|sq| self.piece_at(sq));
            let king_ok = king_home == Some(Some(Piece::new(PieceKind::King, color)));
            for (flag, rook_file) in [
                (CastlingRights::kingside(color), 7),
                (CastlingRights::queenside(color), 0),
            ] {
                if !self.castling.has(flag) {
                    continue;
                }
                let rook_ok = Square::new(rook_file, rank).and_then(|sq| self.piece_at(sq))
                    == Some(Piece::new(PieceKind::Rook, color));
                if !king_ok || !rook_ok {
                    return Err(PositionError::fen(format!(
                        "castling right '{}' without king and rook on home squares",
                        CastlingRights::NONE.with(flag)
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_en_passant(&self, ep: Square) -> Result<(), PositionError> {
        let mover = self.side_to_move;
        let expected_rank = match mover {
            Color::White => 5,
            Color::Black => 2,
        };
        let bad = || PositionError::fen(format!("en passant square {ep} is inconsistent"));
        if ep.rank() != expected_rank || self.piece_at(ep).is_some() {
            return Err(bad());
        }
        let pushed = ep.offset(0, -mover.pawn_direction()).ok_or_else(bad)?;
        let origin = ep.offset(0, mover.pawn_direction()).ok_or_else(bad)?;
        if self.piece_at(pushed) != Some(Piece::new(PieceKind::Pawn, mover.opposite()))
            || self.piece_at(origin).is_some()
        {
            return Err(bad());
        }
        Ok(())
    }

    /// Display the board as a string
    pub fn display(&self) -> String {
        let mut lines = Vec::new();
        lines.push("  +---+---+---+---+---+---+---+---+".to_string());

        for rank in (0..8).rev() {
            let mut row = format!("{} |", rank + 1);
            for file in 0..8 {
                match self.squares[rank * 8 + file] {
                    None => row.push_str("   |"),
                    Some(piece) => row.push_str(&format!(" {} |", piece.to_fen_char())),
                }
            }
            lines.push(row);
            lines.push("  +---+---+---+---+---+---+---+---+".to_string());
        }
        lines.push("    a   b   c   d   e   f   g   h".to_string());

        lines.join("\n")
    }
}

fn parse_placement(field: &str) -> Result<[Option<Piece>; 64], PositionError> {
    let ranks: Vec<&str> = field.split('/').collect();
    if ranks.len() != 8 {
        return Err(PositionError::fen(format!(
            "must have 8 ranks separated by 7 slashes, found {}",
            ranks.len()
        )));
    }

    let mut squares = [None; 64];
    for (i, rank_text) in ranks.iter().enumerate() {
        let rank = 7 - i;
        let mut file = 0usize;
        for c in rank_text.chars() {
            if let Some(skip) = c.to_digit(10) {
                if !(1..=8).contains(&skip) {
                    return Err(PositionError::fen(format!("bad empty-square count '{c}'")));
                }
                file += skip as usize;
            } else if let Some(piece) = Piece::from_fen_char(c) {
                if file >= 8 {
                    return Err(PositionError::fen(format!("rank {} is too long", rank + 1)));
                }
                squares[rank * 8 + file] = Some(piece);
                file += 1;
            } else {
                return Err(PositionError::fen(format!("bad piece character '{c}'")));
            }
        }
        if file != 8 {
            return Err(PositionError::fen(format!(
                "rank {} describes {file} files instead of 8",
                rank + 1
            )));
        }
    }
    Ok(squares)
}

impl Default for Position {
    fn default() -> Self {
        Position::starting()
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Position({})", self.to_fen())
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}
