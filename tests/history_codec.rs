use chess_session::codec::{HistoryCodec, FORMAT_VERSION, MAGIC};
use chess_session::error::CodecError;
use chess_session::move_generator::MoveGenerator;
use chess_session::{rules, Color, GameId, GameSession, GameStatus, PlayerId, Position};
use proptest::prelude::*;

/// Play up to `choices.len()` plies, picking each move by index into the
/// legal move list. Stops early when the game ends.
fn random_game(initial: Position, choices: &[usize]) -> GameSession {
    let white = PlayerId::new("white");
    let black = PlayerId::new("black");
    let mut session = GameSession::with_position(GameId::new(), white.clone(), black.clone(), initial, chrono::Utc::now());
    for &choice in choices {
        let moves = session.legal_moves();
        if moves.is_empty() {
            break;
        }
        let mv = moves[choice % moves.len()];
        let player = match session.position().side_to_move() {
            Color::White => &white,
            Color::Black => &black,
        };
        session.submit_move(&mv, player).unwrap();
    }
    session
}

fn position_keys(session: &GameSession) -> Vec<u64> {
    std::iter::once(session.initial_position().key())
        .chain(session.history().iter().map(|e| e.position.key()))
        .collect()
}

const KIWIPETE: &str = "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1";

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn roundtrip_reproduces_session(choices in proptest::collection::vec(any::<usize>(), 0..80)) {
        let codec = HistoryCodec::default();
        let session = random_game(Position::starting(), &choices);
        let blob = codec.encode(&session).unwrap();
        let decoded = codec.decode(&blob).unwrap();

        prop_assert_eq!(decoded.history(), session.history());
        prop_assert_eq!(decoded.status(), session.status());
        prop_assert_eq!(decoded.white(), session.white());
        prop_assert_eq!(decoded.black(), session.black());
        prop_assert_eq!(&decoded, &session);
    }

    #[test]
    fn roundtrip_from_custom_position(choices in proptest::collection::vec(any::<usize>(), 0..40)) {
        let codec = HistoryCodec::new(19);
        let session = random_game(Position::from_fen(KIWIPETE).unwrap(), &choices);
        let decoded = codec.decode(&codec.encode(&session).unwrap()).unwrap();
        prop_assert_eq!(&decoded, &session);
    }

    #[test]
    fn revision_and_status_follow_history(choices in proptest::collection::vec(any::<usize>(), 1..80)) {
        let session = random_game(Position::starting(), &choices);
        let n = session.history().len();
        prop_assert_eq!(session.revision(), n as u64);

        let keys = position_keys(&session);
        let expected = rules::status(session.position(), &keys[..keys.len() - 1]);
        prop_assert_eq!(session.rules_status(), expected);
        if n > 0 {
            let mover = session.position().side_to_move().opposite();
            prop_assert_eq!(session.status(), GameStatus::from_rules(expected, mover));
        }
    }

    #[test]
    fn legal_moves_never_expose_own_king(choices in proptest::collection::vec(any::<usize>(), 0..60)) {
        let session = random_game(Position::starting(), &choices);
        let generator = MoveGenerator::new();
        let positions = std::iter::once(session.initial_position())
            .chain(session.history().iter().map(|e| &e.position));

        for position in positions {
            let mover = position.side_to_move();
            for mv in rules::legal_moves(position) {
                let after = rules::apply(position, &mv).unwrap();
                let king = after.king_square(mover).unwrap();
                prop_assert!(!generator.is_square_attacked(&after, king, mover.opposite()));
            }
        }
    }

    #[test]
    fn truncated_blob_is_corrupt(choices in proptest::collection::vec(any::<usize>(), 0..40), cut in any::<prop::sample::Index>()) {
        let codec = HistoryCodec::default();
        let blob = codec.encode(&random_game(Position::starting(), &choices)).unwrap();
        let len = cut.index(blob.len());
        let result = codec.decode(&blob[..len]);
        prop_assert!(matches!(result, Err(CodecError::CorruptData { .. })), "prefix {} of {}", len, blob.len());
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut blob = MAGIC.to_vec();
        blob.push(FORMAT_VERSION);
        blob.extend(bytes);
        prop_assert!(HistoryCodec::default().decode(&blob).is_err());
    }
}

#[test]
fn unknown_version_is_rejected() {
    let codec = HistoryCodec::default();
    let mut blob = codec.encode(&random_game(Position::starting(), &[1, 2, 3])).unwrap();
    blob[MAGIC.len()] = FORMAT_VERSION + 1;
    let err = codec.decode(&blob).unwrap_err();
    assert!(matches!(err, CodecError::UnsupportedVersion { .. }));
    assert!(err.is_integrity_failure());
}

#[test]
fn encoding_is_compact() {
    let codec = HistoryCodec::default();
    let session = random_game(Position::starting(), &[7; 60]);
    let blob = codec.encode(&session).unwrap();
    // Two bytes per move plus a small delta, before compression
    assert!(blob.len() < 64 + session.history().len() * 4, "{} bytes", blob.len());
}
