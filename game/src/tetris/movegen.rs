use std::{
    cmp::Reverse,
    collections::{hash_map::Entry, BinaryHeap, HashMap},
};

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use super::{BitBoard, Instruction, PieceKind, PieceState, SpinKind};

pub const MAX_INPUTS: usize = 32;
pub type InputList = ArrayVec<Instruction, MAX_INPUTS>;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum MovementMode {
    #[serde(rename = "0g")]
    ZeroG,
    #[serde(rename = "20g")]
    TwentyG,
    #[serde(rename = "hard_drop_only")]
    HardDropOnly,
}

/// A unique final placement together with one canonical input path that
/// takes the piece there from its spawn state.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Placement {
    pub piece: PieceState,
    pub inputs: InputList,
}

/// Identity of a placement: the sorted cell set plus spin status.
type LockKey = ([(i8, i8); 4], SpinKind);

/// All unique reachable placements for an already-spawned piece.
pub fn find_moves(board: &BitBoard, spawn: PieceState, mode: MovementMode) -> Vec<Placement> {
    match mode {
        MovementMode::HardDropOnly => hard_drop_moves(board, spawn),
        _ => Generator::new(board, mode == MovementMode::TwentyG).run(spawn),
    }
}

#[derive(Clone, Copy)]
struct Step {
    parent: Option<PieceState>,
    instruction: Option<Instruction>,
    /// The piece fell after the instruction (forced fall under 20G, or the
    /// initial fall at spawn).
    fell: bool,
    cost: u32,
    depth: u8,
}

/// Heap entry; ordered by cost so the first settled path is the cheapest.
#[derive(Clone, Copy, Eq, PartialEq)]
struct Pending {
    cost: u32,
    seq: u32,
    piece: PieceState,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cost.cmp(&other.cost).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Generator<'a> {
    board: &'a BitBoard,
    twenty_g: bool,
    steps: HashMap<PieceState, Step>,
    next: BinaryHeap<Reverse<Pending>>,
    locks: HashMap<LockKey, Placement>,
    seq: u32,
}

const MAX_DEPTH: u8 = 32;

impl<'a> Generator<'a> {
    fn new(board: &'a BitBoard, twenty_g: bool) -> Self {
        Generator {
            board,
            twenty_g,
            steps: HashMap::with_capacity(1024),
            next: BinaryHeap::new(),
            locks: HashMap::with_capacity(128),
            seq: 0,
        }
    }

    fn run(mut self, spawn: PieceState) -> Vec<Placement> {
        let mut start = spawn;
        let mut fell = false;
        if self.twenty_g {
            let dropped = self.board.sonic_drop(&spawn);
            fell = dropped.pos != spawn.pos;
            start = dropped;
        }
        self.steps.insert(
            start,
            Step {
                parent: None,
                instruction: None,
                fell,
                cost: 0,
                depth: 0,
            },
        );
        self.push(start, 0);

        while let Some(Reverse(pending)) = self.next.pop() {
            let piece = pending.piece;
            let step = self.steps[&piece];

            self.lock_check(piece);

            if step.depth >= MAX_DEPTH {
                continue;
            }

            self.attempt(piece, &step, Instruction::Left, self.board.strafe(piece, (-1, 0)));
            self.attempt(piece, &step, Instruction::Right, self.board.strafe(piece, (1, 0)));
            if piece.pos.kind != PieceKind::O {
                self.attempt(piece, &step, Instruction::Cw, self.board.rotate(piece, true));
                self.attempt(piece, &step, Instruction::Ccw, self.board.rotate(piece, false));
            }
            if !self.twenty_g {
                let dropped = self.board.sonic_drop(&piece);
                if dropped.pos != piece.pos {
                    self.attempt(piece, &step, Instruction::SonicDrop, Some(dropped));
                }
            }
        }

        self.locks.into_values().collect()
    }

    fn push(&mut self, piece: PieceState, cost: u32) {
        self.seq += 1;
        self.next.push(Reverse(Pending {
            cost,
            seq: self.seq,
            piece,
        }));
    }

    fn attempt(
        &mut self,
        from: PieceState,
        parent: &Step,
        instruction: Instruction,
        result: Option<PieceState>,
    ) {
        let Some(mut piece) = result else { return };

        let mut fell = false;
        if self.twenty_g {
            let dropped = self.board.sonic_drop(&piece);
            fell = dropped.pos != piece.pos;
            piece = dropped;
        }

        if self.steps.contains_key(&piece) {
            return;
        }

        let cost = parent.cost
            + match instruction {
                Instruction::SonicDrop => 3 * (from.pos.y - piece.pos.y).max(1) as u32,
                _ if parent.instruction == Some(instruction) => 2,
                _ => 1,
            };
        self.steps.insert(
            piece,
            Step {
                parent: Some(from),
                instruction: Some(instruction),
                fell,
                cost,
                depth: parent.depth + 1,
            },
        );
        self.push(piece, cost);
    }

    /// Records the lock position reached by dropping from this state.
    fn lock_check(&mut self, piece: PieceState) {
        let dropped = self.board.sonic_drop(&piece);
        if dropped.cells().iter().all(|&(_, y)| y >= 20) {
            return;
        }
        let Some(mut inputs) = self.path_of(piece) else { return };
        if dropped.pos.y != piece.pos.y && inputs.try_push(Instruction::SonicDrop).is_err() {
            return;
        }
        record_lock(&mut self.locks, dropped, inputs);
    }

    /// Rebuilds the input path by walking the parent links. None if the
    /// path does not fit the 32-token cap.
    fn path_of(&self, terminal: PieceState) -> Option<InputList> {
        let mut reversed = InputList::new();
        let mut cur = terminal;
        loop {
            let step = &self.steps[&cur];
            if step.fell {
                reversed.try_push(Instruction::SonicDrop).ok()?;
            }
            if let Some(instruction) = step.instruction {
                reversed.try_push(instruction).ok()?;
            }
            match step.parent {
                Some(parent) => cur = parent,
                None => break,
            }
        }
        reversed.reverse();
        Some(reversed)
    }
}

fn record_lock(locks: &mut HashMap<LockKey, Placement>, piece: PieceState, inputs: InputList) {
    let key = (piece.cell_key(), piece.spin);
    match locks.entry(key) {
        Entry::Vacant(entry) => {
            entry.insert(Placement { piece, inputs });
        }
        Entry::Occupied(mut entry) => {
            if inputs.len() < entry.get().inputs.len() {
                *entry.get_mut() = Placement { piece, inputs };
            }
        }
    }
}

/// Rotations at spawn, horizontal shifts, then a single hard drop.
fn hard_drop_moves(board: &BitBoard, spawn: PieceState) -> Vec<Placement> {
    let mut locks = HashMap::with_capacity(64);

    let rotation_sets: &[&[Instruction]] = if spawn.pos.kind == PieceKind::O {
        &[&[]]
    } else {
        &[
            &[],
            &[Instruction::Cw],
            &[Instruction::Ccw],
            &[Instruction::Cw, Instruction::Cw],
        ]
    };

    for &rotations in rotation_sets {
        let mut piece = spawn;
        let mut base = InputList::new();
        let mut valid = true;
        for &instruction in rotations {
            match board.rotate(piece, instruction == Instruction::Cw) {
                Some(rotated) => {
                    piece = rotated;
                    base.push(instruction);
                }
                None => {
                    valid = false;
                    break;
                }
            }
        }
        if !valid {
            continue;
        }

        drop_lock(board, &mut locks, piece, base.clone());
        for dx in [-1, 1] {
            let mut cur = piece;
            let mut inputs = base.clone();
            let shift = if dx < 0 {
                Instruction::Left
            } else {
                Instruction::Right
            };
            while let Some(next) = board.strafe(cur, (dx, 0)) {
                cur = next;
                if inputs.try_push(shift).is_err() {
                    break;
                }
                drop_lock(board, &mut locks, cur, inputs.clone());
            }
        }
    }

    locks.into_values().collect()
}

fn drop_lock(
    board: &BitBoard,
    locks: &mut HashMap<LockKey, Placement>,
    piece: PieceState,
    mut inputs: InputList,
) {
    let dropped = board.sonic_drop(&piece);
    if dropped.cells().iter().all(|&(_, y)| y >= 20) {
        return;
    }
    if inputs.try_push(Instruction::SonicDrop).is_err() {
        return;
    }
    record_lock(locks, dropped, inputs);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bit_board;
    use crate::tetris::SpawnRule;

    fn spawn(kind: PieceKind, board: &BitBoard) -> PieceState {
        SpawnRule::Row19Or20.spawn(kind, board).unwrap()
    }

    #[test]
    fn empty_board_placement_counts() {
        let board = BitBoard::default();
        for (kind, expected) in [
            (PieceKind::I, 17),
            (PieceKind::O, 9),
            (PieceKind::S, 17),
            (PieceKind::Z, 17),
            (PieceKind::T, 34),
            (PieceKind::L, 34),
            (PieceKind::J, 34),
        ] {
            let moves = find_moves(&board, spawn(kind, &board), MovementMode::ZeroG);
            assert_eq!(moves.len(), expected, "{kind}");
        }
    }

    #[test]
    fn paths_replay_to_their_placement() {
        let board = bit_board! {
            "x..x......",
            "...xxxxx..",
            "x.xxxxxxxx",
        };
        for kind in [PieceKind::T, PieceKind::L, PieceKind::S, PieceKind::I] {
            let start = spawn(kind, &board);
            for placement in find_moves(&board, start, MovementMode::ZeroG) {
                assert!(placement.inputs.len() <= MAX_INPUTS);
                let mut piece = start;
                for &instruction in &placement.inputs {
                    piece = match instruction {
                        Instruction::Left => board.strafe(piece, (-1, 0)).unwrap(),
                        Instruction::Right => board.strafe(piece, (1, 0)).unwrap(),
                        Instruction::Cw => board.rotate(piece, true).unwrap(),
                        Instruction::Ccw => board.rotate(piece, false).unwrap(),
                        Instruction::SonicDrop => board.sonic_drop(&piece),
                    };
                }
                assert_eq!(piece.cell_key(), placement.piece.cell_key());
                assert_eq!(piece.spin, placement.piece.spin);
            }
        }
    }

    #[test]
    fn zero_g_finds_tucks_under_overhangs() {
        let board = bit_board! {
            "xx........",
            "..........",
            "..........",
        };
        let start = spawn(PieceKind::O, &board);
        let moves = find_moves(&board, start, MovementMode::ZeroG);
        let tucked = moves
            .iter()
            .find(|p| p.piece.cell_key() == [(0, 0), (0, 1), (1, 0), (1, 1)])
            .expect("tuck under the ledge");
        assert!(tucked.inputs.contains(&Instruction::SonicDrop));

        // hard drop only cannot reach beneath the ledge
        let moves = find_moves(&board, start, MovementMode::HardDropOnly);
        assert!(!moves
            .iter()
            .any(|p| p.piece.cell_key() == [(0, 0), (0, 1), (1, 0), (1, 1)]));
    }

    #[test]
    fn zero_g_finds_t_spin_double() {
        let board = bit_board! {
            "x..x......",
            "...xxxxxxx",
            "x.xxxxxxxx",
        };
        let moves = find_moves(&board, spawn(PieceKind::T, &board), MovementMode::ZeroG);
        let spin = moves
            .iter()
            .find(|p| p.piece.spin == SpinKind::Full)
            .expect("T-spin double placement");
        assert_eq!(spin.piece.cell_key(), [(0, 1), (1, 0), (1, 1), (2, 1)]);
    }

    #[test]
    fn hard_drop_paths_are_rotations_shifts_then_one_drop() {
        let board = BitBoard::default();
        let moves = find_moves(&board, spawn(PieceKind::T, &board), MovementMode::HardDropOnly);
        assert_eq!(moves.len(), 34);
        for placement in &moves {
            let drops = placement
                .inputs
                .iter()
                .filter(|&&i| i == Instruction::SonicDrop)
                .count();
            assert_eq!(drops, 1);
            assert_eq!(*placement.inputs.last().unwrap(), Instruction::SonicDrop);
            // rotations all precede the first shift
            let first_shift = placement
                .inputs
                .iter()
                .position(|&i| i == Instruction::Left || i == Instruction::Right);
            if let Some(at) = first_shift {
                assert!(placement.inputs[at..]
                    .iter()
                    .all(|&i| i != Instruction::Cw && i != Instruction::Ccw));
            }
        }
    }

    #[test]
    fn twenty_g_pieces_cannot_climb() {
        let board = bit_board! {
            ".x........",
            ".x........",
        };
        let start = spawn(PieceKind::O, &board);
        let zero_g = find_moves(&board, start, MovementMode::ZeroG);
        let twenty_g = find_moves(&board, start, MovementMode::TwentyG);
        // 0G can drop onto the tower from above; 20G falls at spawn and can
        // never climb back over it.
        assert_eq!(zero_g.len(), 9);
        assert_eq!(twenty_g.len(), 7);
        let keys: Vec<_> = zero_g.iter().map(|p| p.piece.cell_key()).collect();
        assert!(twenty_g.iter().all(|p| keys.contains(&p.piece.cell_key())));
    }
}
