//! Chess Session - Zobrist Hashing
//!
//! Position keys used for repetition detection. Keys come from a fixed-seed
//! RNG so a given position hashes to the same value in every process, which
//! keeps repetition detection stable across decode/replay.

use crate::position::Position;
use crate::types::Square;
use rand::prelude::*;
use std::sync::OnceLock;

/// A 64-bit position key.
pub type PositionKey = u64;

const SEED: u64 = 12345;

pub struct ZobristKeys {
    piece_keys: [[[u64; 64]; 6]; 2],
    side_key: u64,
    castling_keys: [u64; 16],
    ep_keys: [u64; 9],
}

impl ZobristKeys {
    fn new() -> Self {
        let mut rng = StdRng::seed_from_u64(SEED);

        let mut piece_keys = [[[0u64; 64]; 6]; 2];
        for color in piece_keys.iter_mut() {
            for kind in color.iter_mut() {
                for key in kind.iter_mut() {
                    *key = rng.gen();
                }
            }
        }

        let side_key = rng.gen();

        let mut castling_keys = [0u64; 16];
        for key in castling_keys.iter_mut() {
            *key = rng.gen();
        }

        let mut ep_keys = [0u64; 9];
        for key in ep_keys.iter_mut() {
            *key = rng.gen();
        }

        ZobristKeys { piece_keys, side_key, castling_keys, ep_keys }
    }

    /// Process-wide key table.
    pub fn global() -> &'static ZobristKeys {
        static KEYS: OnceLock<ZobristKeys> = OnceLock::new();
        KEYS.get_or_init(ZobristKeys::new)
    }

    pub fn hash_position(&self, position: &Position) -> PositionKey {
        let mut h = 0u64;

        for sq in Square::all() {
            if let Some(piece) = position.piece_at(sq) {
                h ^= self.piece_keys[piece.color.index()][piece.kind.index()][sq.index()];
            }
        }

        if position.side_to_move() == crate::types::Color::Black {
            h ^= self.side_key;
        }

        h ^= self.castling_keys[position.castling_rights().bits() as usize];

        let ep_idx = match position.en_passant() {
            Some(sq) => sq.file() as usize,
            None => 8,
        };
        h ^= self.ep_keys[ep_idx];

        h
    }
}
