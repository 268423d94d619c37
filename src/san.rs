//! Standard Algebraic Notation rendering and parsing.

use crate::error::NotationError;
use crate::move_generator::MoveGenerator;
use crate::position::{Move, MoveTag, Position};
use crate::rules::{self, RulesStatus};
use crate::types::{PieceKind, Square};

/// Render a legal move of `position` in SAN, including the check suffix.
pub fn to_san(position: &Position, mv: &Move) -> String {
    let mut san = san_body(position, mv);
    let after = position.play_unchecked(mv);
    match rules::status(&after, &[]) {
        RulesStatus::Checkmate => san.push('#'),
        _ if MoveGenerator::new().is_in_check(&after) => san.push('+'),
        _ => {}
    }
    san
}

/// Resolve a SAN token to the legal move it names.
///
/// Check/mate suffixes and annotation glyphs (`!`, `?`) are ignored.
/// Non-canonical spellings (`Ngf3`, `Ng1-f3`, `e8Q`) are accepted when
/// they name exactly one legal move.
pub fn parse_san(position: &Position, token: &str) -> Result<Move, NotationError> {
    let wanted = normalize(token);
    if wanted.is_empty() {
        return Err(NotationError::InvalidSan(token.to_string()));
    }
    let legal = rules::legal_moves(position);
    let canonical = legal.iter().filter(|mv| san_body(position, mv) == wanted);
    if let Some(found) = unique(canonical, token)? {
        return Ok(found);
    }

    let loose = LooseSan::parse(&wanted).ok_or_else(|| NotationError::InvalidSan(token.to_string()))?;
    let matching = legal.iter().filter(|mv| loose.matches(position, mv));
    unique(matching, token)?.ok_or_else(|| NotationError::InvalidSan(token.to_string()))
}

fn unique<'a>(mut moves: impl Iterator<Item = &'a Move>, token: &str) -> Result<Option<Move>, NotationError> {
    match (moves.next(), moves.next()) {
        (Some(mv), None) => Ok(Some(*mv)),
        (Some(_), Some(_)) => Err(NotationError::AmbiguousSan(token.to_string())),
        (None, _) => Ok(None),
    }
}

/// A SAN body read by its parts instead of as a canonical string.
#[derive(Debug, PartialEq, Eq)]
struct LooseSan {
    kind: PieceKind,
    from_file: Option<u8>,
    from_rank: Option<u8>,
    to: Square,
    promotion: Option<PieceKind>,
}

impl LooseSan {
    fn parse(body: &str) -> Option<Self> {
        let mut chars: Vec<char> = body.chars().filter(|c| !matches!(c, 'x' | ':' | '-')).collect();

        let promotion = match chars.last() {
            Some(&c) if chars.len() > 2 && matches!(c, 'N' | 'B' | 'R' | 'Q') => {
                chars.pop();
                if chars.last() == Some(&'=') {
                    chars.pop();
                }
                PieceKind::from_char(c)
            }
            _ => None,
        };

        let kind = match chars.first() {
            Some(&c) if c.is_ascii_uppercase() => {
                chars.remove(0);
                PieceKind::from_char(c)?
            }
            _ => PieceKind::Pawn,
        };

        if chars.len() < 2 {
            return None;
        }
        let target: String = chars.split_off(chars.len() - 2).into_iter().collect();
        let to = Square::parse(&target)?;

        let (mut from_file, mut from_rank) = (None, None);
        for c in chars {
            match c {
                'a'..='h' if from_file.is_none() => from_file = Some(c as u8 - b'a'),
                '1'..='8' if from_rank.is_none() => from_rank = Some(c as u8 - b'1'),
                _ => return None,
            }
        }
        Some(LooseSan {
            kind,
            from_file,
            from_rank,
            to,
            promotion,
        })
    }

    fn matches(&self, position: &Position, mv: &Move) -> bool {
        mv.tag != Some(MoveTag::Castle)
            && mv.to == self.to
            && mv.promotion == self.promotion
            && position.piece_at(mv.from).map(|p| p.kind) == Some(self.kind)
            && self.from_file.map_or(true, |f| mv.from.file() == f)
            && self.from_rank.map_or(true, |r| mv.from.rank() == r)
    }
}

fn normalize(token: &str) -> String {
    let trimmed = token.trim_end_matches(['+', '#', '!', '?']);
    // Castling is sometimes written with zeros
    match trimmed {
        "0-0" => "O-O".to_string(),
        "0-0-0" => "O-O-O".to_string(),
        other => other.to_string(),
    }
}

/// SAN without the check suffix.
fn san_body(position: &Position, mv: &Move) -> String {
    if mv.tag == Some(MoveTag::Castle) {
        return if mv.to.file() == 6 { "O-O".into() } else { "O-O-O".into() };
    }

    let Some(piece) = position.piece_at(mv.from) else {
        return mv.to_uci();
    };
    let is_capture = position.piece_at(mv.to).is_some() || mv.tag == Some(MoveTag::EnPassant);
    let mut san = String::new();

    match piece.kind.san_letter() {
        None => {
            if is_capture {
                san.push((b'a' + mv.from.file()) as char);
            }
        }
        Some(letter) => {
            san.push(letter);
            san.push_str(&disambiguation(position, mv, piece.kind));
        }
    }

    if is_capture {
        san.push('x');
    }
    san.push_str(&mv.to.to_string());

    if let Some(kind) = mv.promotion {
        san.push('=');
        san.push(kind.san_letter().unwrap_or('Q'));
    }
    san
}

fn disambiguation(position: &Position, mv: &Move, kind: PieceKind) -> String {
    let rivals: Vec<Move> = rules::legal_moves(position)
        .into_iter()
        .filter(|other| {
            other.to == mv.to
                && other.from != mv.from
                && position.piece_at(other.from).map(|p| p.kind) == Some(kind)
        })
        .collect();

    if rivals.is_empty() {
        return String::new();
    }
    let file = (b'a' + mv.from.file()) as char;
    let rank = (b'1' + mv.from.rank()) as char;
    if rivals.iter().all(|r| r.from.file() != mv.from.file()) {
        file.to_string()
    } else if rivals.iter().all(|r| r.from.rank() != mv.from.rank()) {
        rank.to_string()
    } else {
        format!("{file}{rank}")
    }
}
