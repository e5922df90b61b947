use std::time::{Duration, Instant};

use aurora::{AuroraBot, Options, Poll};
use aurora::eval::Standard;
use enumset::EnumSet;
use game::tetris::PieceKind;

fn empty_field() -> [[bool; 10]; 40] {
    [[false; 10]; 40]
}

fn poll_until(bot: &AuroraBot, timeout: Duration) -> Poll {
    let deadline = Instant::now() + timeout;
    loop {
        match bot.poll_next_move() {
            Poll::Waiting if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(5))
            }
            other => return other,
        }
    }
}

#[test]
fn fresh_launch_places_the_only_piece_flat() {
    let bot = AuroraBot::launch(Options::default(), Standard::default());
    bot.add_next_piece(PieceKind::T);
    bot.request_next_move(0);

    let (mv, info) = bot.block_next_move().expect("bot alive");
    assert!(!mv.hold);
    assert!(mv.inputs.len() <= 3);
    let cells = mv.expected.cells();
    assert!(cells.iter().any(|&(_, y)| y == 0), "rests on the floor");
    assert!(cells.iter().all(|&(_, y)| y <= 1));
    assert!(info.nodes > 0);
    assert_eq!(info.plan[0].cells, cells);
}

#[test]
fn hold_exchange_is_well_defined() {
    let options = Options {
        use_hold: true,
        min_nodes: 0,
        ..Options::default()
    };
    let bot = AuroraBot::launch(options, Standard::default());
    for piece in [PieceKind::I, PieceKind::S, PieceKind::Z, PieceKind::L] {
        bot.add_next_piece(piece);
    }
    bot.request_next_move(0);

    let (mv, _) = bot.block_next_move().expect("bot alive");
    // placing the current piece or the hold-swapped one, never anything else
    let expected = if mv.hold { PieceKind::S } else { PieceKind::I };
    assert_eq!(mv.expected.pos.kind, expected);
}

#[test]
fn reset_is_a_barrier() {
    let bot = AuroraBot::launch(Options::default(), Standard::default());
    bot.add_next_piece(PieceKind::T);
    bot.add_next_piece(PieceKind::S);
    bot.request_next_move(0);

    // full bottom row: every placement on the new field rests above row 0
    let mut field = empty_field();
    field[0] = [true; 10];
    bot.reset(&field, true, 0);

    // the barrier discarded the request and any stale answer
    assert!(matches!(bot.poll_next_move(), Poll::Waiting));

    // a second identical reset is equivalent to one
    bot.reset(&field, true, 0);

    bot.add_next_piece(PieceKind::Z);
    bot.request_next_move(0);
    let (mv, _) = bot.block_next_move().expect("bot alive");
    assert!(
        mv.expected.cells().iter().all(|&(_, y)| y >= 1),
        "move was planned on the reset board"
    );
}

#[test]
fn blocked_board_reports_dead() {
    let mut field = empty_field();
    for row in field.iter_mut().take(20) {
        *row = [true; 10];
    }
    let bot = AuroraBot::launch_with_board(
        Options::default(),
        Standard::default(),
        &field,
        EnumSet::all(),
        None,
        false,
        0,
    );
    bot.add_next_piece(PieceKind::O);
    bot.request_next_move(0);

    assert!(bot.block_next_move().is_none());
    assert!(matches!(bot.poll_next_move(), Poll::Dead));
    assert!(bot.is_dead());
}

#[test]
fn t_spin_double_wins_when_its_weight_dominates() {
    let mut field = empty_field();
    let rows: [&[u8; 10]; 3] = [b"x.xxxxxxxx", b"...xxxxxxx", b"x..x......"];
    for (y, row) in rows.iter().enumerate() {
        for x in 0..10 {
            field[y][x] = row[x] == b'x';
        }
    }
    let options = Options {
        use_hold: false,
        speculate: false,
        ..Options::default()
    };
    let weights = Standard {
        tspin2: 100_000,
        ..Standard::default()
    };
    let bot = AuroraBot::launch_with_board(
        options,
        weights,
        &field,
        EnumSet::all(),
        None,
        false,
        0,
    );
    bot.add_next_piece(PieceKind::T);
    bot.request_next_move(0);

    let (mv, info) = bot.block_next_move().expect("bot alive");
    assert_eq!(mv.expected.spin, game::tetris::SpinKind::Full);
    assert_eq!(info.plan[0].cleared.len(), 2);
}

#[test]
fn empty_queue_waits_for_information() {
    let options = Options {
        use_hold: false,
        speculate: false,
        ..Options::default()
    };
    let bot = AuroraBot::launch(options, Standard::default());
    bot.request_next_move(0);

    // nothing to place: the request stays open
    for _ in 0..10 {
        assert!(matches!(bot.poll_next_move(), Poll::Waiting));
        std::thread::sleep(Duration::from_millis(2));
    }

    bot.add_next_piece(PieceKind::L);
    match poll_until(&bot, Duration::from_secs(10)) {
        Poll::Provided(mv, _) => assert_eq!(mv.expected.pos.kind, PieceKind::L),
        other => panic!("expected a move, got {other:?}"),
    }
}

#[test]
fn out_of_bag_piece_is_absorbed_by_a_refill() {
    let bot = AuroraBot::launch(Options::default(), Standard::default());
    // drain a whole bag, then deal the same piece twice in a row; the
    // second deal contradicts the bag and forces a refill
    for piece in [
        PieceKind::I,
        PieceKind::O,
        PieceKind::T,
        PieceKind::L,
        PieceKind::J,
        PieceKind::S,
        PieceKind::Z,
        PieceKind::I,
        PieceKind::I,
    ] {
        bot.add_next_piece(piece);
    }
    bot.request_next_move(0);
    let (mv, _) = bot.block_next_move().expect("bot alive after bag mismatch");
    // the current piece, or its neighbour through the hold slot
    assert!(matches!(mv.expected.pos.kind, PieceKind::I | PieceKind::O));
}

#[test]
fn speculation_answers_across_consecutive_moves() {
    let options = Options {
        speculate: true,
        ..Options::default()
    };
    let bot = AuroraBot::launch(options, Standard::default());
    bot.add_next_piece(PieceKind::I);
    bot.add_next_piece(PieceKind::J);
    bot.add_next_piece(PieceKind::O);

    for _ in 0..2 {
        bot.request_next_move(0);
        let (mv, _) = bot.block_next_move().expect("bot alive");
        assert!(mv.inputs.len() <= 32);
    }
}
