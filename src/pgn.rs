//! PGN export and import.
//!
//! Export writes the Seven Tag Roster (plus `SetUp`/`FEN` and `Termination`
//! where they apply) and SAN movetext. Import replays the movetext through
//! the rules engine, so only legal games are accepted.

use chrono::Utc;

use crate::error::{PgnError, SessionError};
use crate::position::Position;
use crate::san;
use crate::session::{GameId, GameSession, GameStatus, PlayerId, TerminationReason};
use crate::types::Color;

const REQUIRED_TAGS: [&str; 4] = ["Event", "White", "Black", "Result"];
const LINE_WIDTH: usize = 80;

pub const WHITE_WINS: &str = "1-0";
pub const BLACK_WINS: &str = "0-1";
pub const DRAW: &str = "1/2-1/2";
pub const UNFINISHED: &str = "*";

/// A PGN game split into tag pairs and movetext tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgnGame {
    pub tags: Vec<(String, String)>,
    /// SAN tokens in order, with comments, NAGs, variations and move
    /// numbers removed.
    pub moves: Vec<String>,
    pub result: String,
}

impl PgnGame {
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// PGN result token for a session.
pub fn result_token(session: &GameSession) -> &'static str {
    match session.status() {
        GameStatus::InProgress => UNFINISHED,
        GameStatus::CheckmateWhiteWins => WHITE_WINS,
        GameStatus::CheckmateBlackWins => BLACK_WINS,
        GameStatus::StalemateDraw | GameStatus::RuleDraw => DRAW,
        GameStatus::Abandoned => match session.termination() {
            Some(TerminationReason::Resignation(loser) | TerminationReason::Timeout(loser)) => win_for(loser.opposite()),
            Some(TerminationReason::DrawAgreement) => DRAW,
            Some(TerminationReason::Aborted) | None => UNFINISHED,
        },
    }
}

fn win_for(color: Color) -> &'static str {
    match color {
        Color::White => WHITE_WINS,
        Color::Black => BLACK_WINS,
    }
}

fn termination_tag(session: &GameSession) -> Option<&'static str> {
    match session.termination() {
        Some(TerminationReason::Timeout(_)) => Some("time forfeit"),
        Some(TerminationReason::Aborted) => Some("abandoned"),
        Some(_) => Some("normal"),
        None if session.is_terminal() => Some("normal"),
        None => None,
    }
}

/// Render a session as PGN text.
pub fn export(session: &GameSession) -> String {
    let result = result_token(session);
    let mut out = String::new();

    let mut tag = |name: &str, value: &str| {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        out.push_str(&format!("[{name} \"{escaped}\"]\n"));
    };
    tag("Event", "Casual game");
    tag("Site", "?");
    tag("Date", &session.created_at().format("%Y.%m.%d").to_string());
    tag("Round", "-");
    tag("White", session.white().as_str());
    tag("Black", session.black().as_str());
    tag("Result", result);
    let initial = session.initial_position();
    if !initial.is_standard_start() {
        tag("SetUp", "1");
        tag("FEN", &initial.to_fen());
    }
    if let Some(termination) = termination_tag(session) {
        tag("Termination", termination);
    }
    out.push('\n');

    let mut tokens = Vec::with_capacity(session.history().len() * 3 / 2 + 1);
    let mut before: &Position = initial;
    for (i, entry) in session.history().iter().enumerate() {
        let number = before.fullmove_number();
        match before.side_to_move() {
            Color::White => tokens.push(format!("{number}.")),
            Color::Black if i == 0 => tokens.push(format!("{number}...")),
            Color::Black => {}
        }
        tokens.push(san::to_san(before, &entry.mv));
        before = &entry.position;
    }
    tokens.push(result.to_string());

    let mut line_len = 0;
    for token in tokens {
        if line_len > 0 && line_len + 1 + token.len() > LINE_WIDTH {
            out.push('\n');
            line_len = 0;
        } else if line_len > 0 {
            out.push(' ');
            line_len += 1;
        }
        line_len += token.len();
        out.push_str(&token);
    }
    out.push('\n');
    out
}

/// Split PGN text into tags and SAN tokens. Legality is not checked here.
pub fn parse(text: &str) -> Result<PgnGame, PgnError> {
    let mut tags = Vec::new();
    let mut movetext = String::new();

    for line in text.lines() {
        let trimmed = line.trim();
        // Escape lines are ignored
        if trimmed.starts_with('%') {
            continue;
        }
        if movetext.trim().is_empty() && trimmed.starts_with('[') {
            tags.push(parse_tag(trimmed)?);
        } else {
            movetext.push_str(line);
            movetext.push('\n');
        }
    }

    for required in REQUIRED_TAGS {
        if !tags.iter().any(|(k, _): &(String, String)| k == required) {
            return Err(PgnError::MissingTag(required));
        }
    }

    let mut tokens = tokenize(&movetext)?;
    let result = match tokens.last().map(String::as_str) {
        Some(WHITE_WINS | BLACK_WINS | DRAW | UNFINISHED) => tokens.pop().unwrap_or_default(),
        _ => return Err(PgnError::Malformed("missing game termination marker".to_string())),
    };
    if let Some(stray) = tokens.iter().find(|t| is_result(t)) {
        return Err(PgnError::Malformed(format!("result {stray} before end of movetext")));
    }

    Ok(PgnGame {
        tags,
        moves: tokens,
        result,
    })
}

fn parse_tag(line: &str) -> Result<(String, String), PgnError> {
    let malformed = || PgnError::Malformed(format!("bad tag pair: {line}"));
    let inner = line
        .strip_prefix('[')
        .and_then(|l| l.strip_suffix(']'))
        .ok_or_else(malformed)?;
    let (name, rest) = inner.trim().split_once(char::is_whitespace).ok_or_else(malformed)?;
    let quoted = rest
        .trim()
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .ok_or_else(malformed)?;

    let mut value = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            value.extend(chars.next());
        } else {
            value.push(c);
        }
    }
    Ok((name.to_string(), value))
}

fn is_result(token: &str) -> bool {
    matches!(token, WHITE_WINS | BLACK_WINS | DRAW | UNFINISHED)
}

/// SAN and result tokens of the movetext.
fn tokenize(movetext: &str) -> Result<Vec<String>, PgnError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut variation_depth = 0usize;
    let mut chars = movetext.chars();

    let flush = |current: &mut String, depth: usize, tokens: &mut Vec<String>| {
        if depth == 0 && !current.is_empty() {
            if let Some(token) = clean_token(current) {
                tokens.push(token);
            }
        }
        current.clear();
    };

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                flush(&mut current, variation_depth, &mut tokens);
                // Comments do not nest
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') => return Err(PgnError::Malformed("'{' inside comment".to_string())),
                        Some(_) => {}
                        None => return Err(PgnError::Malformed("unclosed comment".to_string())),
                    }
                }
            }
            '}' => return Err(PgnError::Malformed("unmatched '}'".to_string())),
            ';' => {
                flush(&mut current, variation_depth, &mut tokens);
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '(' => {
                flush(&mut current, variation_depth, &mut tokens);
                variation_depth += 1;
            }
            ')' => {
                flush(&mut current, variation_depth, &mut tokens);
                variation_depth = variation_depth
                    .checked_sub(1)
                    .ok_or_else(|| PgnError::Malformed("unmatched ')'".to_string()))?;
            }
            c if c.is_whitespace() => flush(&mut current, variation_depth, &mut tokens),
            c => current.push(c),
        }
    }
    flush(&mut current, variation_depth, &mut tokens);

    if variation_depth != 0 {
        return Err(PgnError::Malformed("unclosed variation".to_string()));
    }
    Ok(tokens)
}

/// Strip move numbers and drop NAGs. `12.e4` yields `e4`; `12.` yields nothing.
fn clean_token(raw: &str) -> Option<String> {
    if raw.starts_with('$') {
        return None;
    }
    if is_result(raw) {
        return Some(raw.to_string());
    }
    let san = raw.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.');
    // Bare digits with no dots are not a move number
    if san.len() == raw.len() || raw.contains('.') {
        (!san.is_empty()).then(|| san.to_string())
    } else {
        Some(raw.to_string())
    }
}

/// Import PGN text as a new session with a fresh id.
///
/// A decisive or drawn result on a position the rules do not consider
/// terminal is recorded as a termination (resignation, time forfeit or
/// draw agreement).
pub fn import(text: &str) -> Result<GameSession, PgnError> {
    let game = parse(text)?;

    let white = PlayerId::new(game.tag("White").unwrap_or("?"));
    let black = PlayerId::new(game.tag("Black").unwrap_or("?"));
    let initial = match game.tag("FEN") {
        Some(fen) => Position::from_fen(fen)?,
        None => Position::starting(),
    };

    let now = Utc::now();
    let mut session = GameSession::with_position(GameId::new(), white, black, initial, now);

    for (i, token) in game.moves.iter().enumerate() {
        let ply = i + 1;
        if session.is_terminal() {
            return Err(PgnError::Malformed(format!(
                "move {ply} ({token}) played after the game ended ({})",
                session.status()
            )));
        }
        let mv = san::parse_san(session.position(), token).map_err(|source| PgnError::Move {
            ply,
            token: token.clone(),
            source,
        })?;
        session
            .apply_move(&mv, now)
            .map_err(|e| PgnError::Session(SessionError::IllegalMove(e)))?;
    }

    apply_result(&mut session, &game)?;
    Ok(session)
}

fn apply_result(session: &mut GameSession, game: &PgnGame) -> Result<(), PgnError> {
    let result = game.result.as_str();
    if let Some(tag) = game.tag("Result") {
        if tag != result && tag != UNFINISHED && result != UNFINISHED {
            return Err(PgnError::Malformed(format!(
                "Result tag {tag} disagrees with movetext result {result}"
            )));
        }
    }
    let result = match (game.tag("Result"), result) {
        (Some(tag), UNFINISHED) => tag,
        _ => result,
    };

    if session.is_terminal() {
        let actual = result_token(session);
        if result != UNFINISHED && result != actual {
            return Err(PgnError::Malformed(format!(
                "result {result} contradicts final position ({})",
                session.status()
            )));
        }
        return Ok(());
    }

    let time_forfeit = game.tag("Termination") == Some("time forfeit");
    let loser = match result {
        WHITE_WINS => Color::Black,
        BLACK_WINS => Color::White,
        DRAW => {
            session.terminate(TerminationReason::DrawAgreement)?;
            return Ok(());
        }
        UNFINISHED => return Ok(()),
        other => return Err(PgnError::Malformed(format!("unknown result {other}"))),
    };
    let reason = if time_forfeit {
        TerminationReason::Timeout(loser)
    } else {
        TerminationReason::Resignation(loser)
    };
    session.terminate(reason)?;
    Ok(())
}
