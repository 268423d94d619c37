//! History codec: compact, versioned, compressed session blobs.
//!
//! Layout (format version 1):
//!
//! ```text
//! "CHSB" | version: u8 | zstd(payload)
//!
//! payload:
//!   game id            16 bytes
//!   white, black       varint length + UTF-8
//!   created_at ms      zigzag varint
//!   revision           varint
//!   termination        u8 tag (+ u8 color for resignation/timeout)
//!   initial position   u8 flag (+ FEN string when non-standard)
//!   move count         varint
//!   moves              u16 LE (from | to << 6 | promotion << 12)
//!                      + zigzag varint ms since the previous entry
//! ```
//!
//! Decoding never trusts a stored position: the current position is rebuilt
//! by replaying every move through the rules engine.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::error::CodecError;
use crate::position::{Move, Position};
use crate::session::{GameId, GameSession, PlayerId, TerminationReason};
use crate::types::{Color, PieceKind, Square};

pub const MAGIC: &[u8; 4] = b"CHSB";
pub const FORMAT_VERSION: u8 = 1;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Upper bound on a decompressed payload.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;
const HEADER_LEN: usize = MAGIC.len() + 1;

const TERM_NONE: u8 = 0;
const TERM_RESIGNATION: u8 = 1;
const TERM_TIMEOUT: u8 = 2;
const TERM_DRAW_AGREEMENT: u8 = 3;
const TERM_ABORTED: u8 = 4;

const INITIAL_STANDARD: u8 = 0;
const INITIAL_FEN: u8 = 1;

/// Serializes sessions to blobs and back.
#[derive(Debug, Clone, Copy)]
pub struct HistoryCodec {
    level: i32,
}

impl Default for HistoryCodec {
    fn default() -> Self {
        HistoryCodec::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl HistoryCodec {
    pub fn new(level: i32) -> Self {
        HistoryCodec { level }
    }

    pub fn encode(&self, session: &GameSession) -> Result<Vec<u8>, CodecError> {
        let mut w = Writer::default();

        w.bytes(session.id().as_uuid().as_bytes());
        w.string(session.white().as_str());
        w.string(session.black().as_str());
        let created_ms = session.created_at().timestamp_millis();
        w.signed(created_ms);
        w.varint(session.revision());

        match session.termination() {
            None => w.byte(TERM_NONE),
            Some(TerminationReason::Resignation(c)) => {
                w.byte(TERM_RESIGNATION);
                w.byte(color_code(c));
            }
            Some(TerminationReason::Timeout(c)) => {
                w.byte(TERM_TIMEOUT);
                w.byte(color_code(c));
            }
            Some(TerminationReason::DrawAgreement) => w.byte(TERM_DRAW_AGREEMENT),
            Some(TerminationReason::Aborted) => w.byte(TERM_ABORTED),
        }

        let initial = session.initial_position();
        if initial.is_standard_start() {
            w.byte(INITIAL_STANDARD);
        } else {
            w.byte(INITIAL_FEN);
            w.string(&initial.to_fen());
        }

        w.varint(session.history().len() as u64);
        let mut previous_ms = created_ms;
        for entry in session.history() {
            w.u16(pack_move(&entry.mv));
            let ms = entry.timestamp.timestamp_millis();
            w.signed(ms - previous_ms);
            previous_ms = ms;
        }

        let compressed = zstd::bulk::compress(&w.buf, self.level).map_err(CodecError::Compression)?;

        let mut blob = Vec::with_capacity(HEADER_LEN + compressed.len());
        blob.extend_from_slice(MAGIC);
        blob.push(FORMAT_VERSION);
        blob.extend_from_slice(&compressed);
        Ok(blob)
    }

    pub fn decode(&self, blob: &[u8]) -> Result<GameSession, CodecError> {
        if blob.len() < HEADER_LEN || &blob[..MAGIC.len()] != MAGIC {
            return Err(CodecError::corrupt("missing blob header"));
        }
        let version = blob[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion {
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        let payload = zstd::bulk::decompress(&blob[HEADER_LEN..], MAX_PAYLOAD)
            .map_err(|e| CodecError::corrupt(format!("decompression failed: {e}")))?;
        let mut r = Reader::new(&payload);

        let id_bytes: [u8; 16] = r
            .take(16)?
            .try_into()
            .map_err(|_| CodecError::corrupt("bad game id"))?;
        let id = GameId::from_uuid(Uuid::from_bytes(id_bytes));
        let white = PlayerId::new(r.string()?);
        let black = PlayerId::new(r.string()?);
        let created_ms = r.signed()?;
        let created_at = millis_to_time(created_ms)?;
        let revision = r.varint()?;

        let termination = match r.byte()? {
            TERM_NONE => None,
            TERM_RESIGNATION => Some(TerminationReason::Resignation(code_color(r.byte()?)?)),
            TERM_TIMEOUT => Some(TerminationReason::Timeout(code_color(r.byte()?)?)),
            TERM_DRAW_AGREEMENT => Some(TerminationReason::DrawAgreement),
            TERM_ABORTED => Some(TerminationReason::Aborted),
            other => return Err(CodecError::corrupt(format!("unknown termination tag {other}"))),
        };

        let initial = match r.byte()? {
            INITIAL_STANDARD => Position::starting(),
            INITIAL_FEN => {
                let fen = r.string()?;
                Position::from_fen(&fen)
                    .map_err(|e| CodecError::corrupt(format!("initial position: {e}")))?
            }
            other => return Err(CodecError::corrupt(format!("unknown initial position flag {other}"))),
        };

        let count = r.varint()?;
        // Each move needs at least three bytes
        if count > (r.remaining() / 3) as u64 {
            return Err(CodecError::corrupt(format!("move count {count} exceeds payload")));
        }
        let mut moves = Vec::with_capacity(count as usize);
        let mut previous_ms = created_ms;
        for _ in 0..count {
            let mv = unpack_move(r.u16()?)?;
            let ms = previous_ms
                .checked_add(r.signed()?)
                .ok_or_else(|| CodecError::corrupt("timestamp overflow"))?;
            moves.push((mv, millis_to_time(ms)?));
            previous_ms = ms;
        }
        if r.remaining() != 0 {
            return Err(CodecError::corrupt(format!("{} trailing bytes", r.remaining())));
        }

        replay(id, white, black, initial, created_at, &moves, termination, revision)
    }
}

#[allow(clippy::too_many_arguments)]
fn replay(
    id: GameId,
    white: PlayerId,
    black: PlayerId,
    initial: Position,
    created_at: DateTime<Utc>,
    moves: &[(Move, DateTime<Utc>)],
    termination: Option<TerminationReason>,
    revision: u64,
) -> Result<GameSession, CodecError> {
    let mut session = GameSession::with_position(id, white, black, initial, created_at);

    for (ply, (mv, timestamp)) in moves.iter().enumerate() {
        if session.is_terminal() {
            return Err(CodecError::ReplayMismatch {
                reason: format!("move {} recorded after the game ended ({})", ply + 1, session.status()),
            });
        }
        session
            .apply_move(mv, *timestamp)
            .map_err(|source| CodecError::ReplayValidation { ply: ply + 1, source })?;
    }

    if termination.is_some() && session.is_terminal() {
        return Err(CodecError::ReplayMismatch {
            reason: format!("termination recorded for a game that ended by {}", session.status()),
        });
    }
    let expected_revision = moves.len() as u64 + u64::from(termination.is_some());
    if revision != expected_revision {
        return Err(CodecError::ReplayMismatch {
            reason: format!("revision {revision} does not match replayed revision {expected_revision}"),
        });
    }

    session.restore(termination, revision);
    Ok(session)
}

fn pack_move(mv: &Move) -> u16 {
    let promo = mv.promotion.map_or(0, PieceKind::code) as u16;
    mv.from.index() as u16 | (mv.to.index() as u16) << 6 | promo << 12
}

fn unpack_move(packed: u16) -> Result<Move, CodecError> {
    if packed & 0x8000 != 0 {
        return Err(CodecError::corrupt(format!("bad move encoding {packed:#06x}")));
    }
    let from = Square::from_index((packed & 0x3f) as u8);
    let to = Square::from_index(((packed >> 6) & 0x3f) as u8);
    let (Some(from), Some(to)) = (from, to) else {
        return Err(CodecError::corrupt("move square out of range"));
    };
    let promotion = match (packed >> 12) as u8 {
        0 => None,
        code => Some(
            PieceKind::from_code(code)
                .ok_or_else(|| CodecError::corrupt(format!("bad promotion code {code}")))?,
        ),
    };
    Ok(Move { from, to, promotion, tag: None })
}

fn color_code(color: Color) -> u8 {
    match color {
        Color::White => 0,
        Color::Black => 1,
    }
}

fn code_color(code: u8) -> Result<Color, CodecError> {
    match code {
        0 => Ok(Color::White),
        1 => Ok(Color::Black),
        other => Err(CodecError::corrupt(format!("bad color code {other}"))),
    }
}

fn millis_to_time(ms: i64) -> Result<DateTime<Utc>, CodecError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CodecError::corrupt(format!("timestamp {ms} out of range")))
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn varint(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.buf.push((v as u8) | 0x80);
            v >>= 7;
        }
        self.buf.push(v as u8);
    }

    fn signed(&mut self, v: i64) {
        self.varint(((v << 1) ^ (v >> 63)) as u64);
    }

    fn string(&mut self, s: &str) {
        self.varint(s.len() as u64);
        self.bytes(s.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::corrupt(format!(
                "truncated payload: wanted {n} bytes at offset {}",
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn varint(&mut self) -> Result<u64, CodecError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let b = self.byte()?;
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::corrupt("varint too long"))
    }

    fn signed(&mut self) -> Result<i64, CodecError> {
        let v = self.varint()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.varint()?;
        if len > self.remaining() as u64 {
            return Err(CodecError::corrupt(format!("string length {len} exceeds payload")));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::corrupt("identity is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::GameStatus;

    fn uci(text: &str) -> Move {
        Move::from_uci(text).unwrap()
    }

    fn played(moves: &[&str]) -> GameSession {
        let white = PlayerId::new("white-player");
        let black = PlayerId::new("black-player");
        let mut session = GameSession::new(GameId::new(), white.clone(), black.clone());
        for (i, m) in moves.iter().enumerate() {
            let player = if i % 2 == 0 { &white } else { &black };
            session.submit_move(&uci(m), player).unwrap();
        }
        session
    }

    #[test]
    fn roundtrip_preserves_session() {
        let codec = HistoryCodec::default();
        let session = played(&["e2e4", "e7e5", "f1c4", "f8c5", "d1h5"]);
        let decoded = codec.decode(&codec.encode(&session).unwrap()).unwrap();
        assert_eq!(decoded, session);
    }

    #[test]
    fn roundtrip_checkmate_and_termination() {
        let codec = HistoryCodec::default();
        let mated = played(&["f2f3", "e7e5", "g2g4", "d8h4"]);
        let decoded = codec.decode(&codec.encode(&mated).unwrap()).unwrap();
        assert_eq!(decoded.status(), GameStatus::CheckmateBlackWins);

        let mut resigned = played(&["d2d4"]);
        resigned.terminate(TerminationReason::Resignation(Color::Black)).unwrap();
        let decoded = codec.decode(&codec.encode(&resigned).unwrap()).unwrap();
        assert_eq!(decoded, resigned);
        assert_eq!(decoded.status(), GameStatus::Abandoned);
    }

    #[test]
    fn roundtrip_custom_start() {
        let codec = HistoryCodec::default();
        let initial = Position::from_fen("4k3/P7/8/8/8/8/8/4K3 w - - 0 1").unwrap();
        let white = PlayerId::new("w");
        let mut session =
            GameSession::with_position(GameId::new(), white.clone(), PlayerId::new("b"), initial, Utc::now());
        session.submit_move(&uci("a7a8r"), &white).unwrap();
        let decoded = codec.decode(&codec.encode(&session).unwrap()).unwrap();
        assert_eq!(decoded, session);
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        let codec = HistoryCodec::default();
        let blob = codec.encode(&played(&["e2e4", "c7c5"])).unwrap();
        for cut in [0, 3, HEADER_LEN, blob.len() / 2, blob.len() - 1] {
            let err = codec.decode(&blob[..cut]).unwrap_err();
            assert!(matches!(err, CodecError::CorruptData { .. }), "cut {cut}: {err}");
        }
    }

    #[test]
    fn unknown_version_rejected() {
        let codec = HistoryCodec::default();
        let mut blob = codec.encode(&played(&[])).unwrap();
        blob[MAGIC.len()] = 9;
        assert!(matches!(
            codec.decode(&blob),
            Err(CodecError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[test]
    fn tampered_move_fails_replay() {
        // Hand-build a payload whose second move is illegal for black
        let mut w = Writer::default();
        w.bytes(Uuid::nil().as_bytes());
        w.string("a");
        w.string("b");
        w.signed(0);
        w.varint(2);
        w.byte(TERM_NONE);
        w.byte(INITIAL_STANDARD);
        w.varint(2);
        w.u16(pack_move(&uci("e2e4")));
        w.signed(10);
        w.u16(pack_move(&uci("e7e4")));
        w.signed(10);

        let mut blob = MAGIC.to_vec();
        blob.push(FORMAT_VERSION);
        blob.extend(zstd::bulk::compress(&w.buf, 3).unwrap());

        let err = HistoryCodec::default().decode(&blob).unwrap_err();
        assert!(matches!(err, CodecError::ReplayValidation { ply: 2, .. }), "{err}");
    }

    #[test]
    fn varint_and_zigzag() {
        let mut w = Writer::default();
        for v in [0i64, -1, 1, 300, -300, i64::MAX, i64::MIN] {
            w.signed(v);
        }
        let mut r = Reader::new(&w.buf);
        for v in [0i64, -1, 1, 300, -300, i64::MAX, i64::MIN] {
            assert_eq!(r.signed().unwrap(), v);
        }
        assert_eq!(r.remaining(), 0);
    }
}
