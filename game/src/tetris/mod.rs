use std::{
    collections::VecDeque,
    fmt::{self, Display},
};

use arrayvec::ArrayVec;
use enumset::{EnumSet, EnumSetType};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

pub mod movegen;
pub mod tbp;

/// One key tap of the guideline input alphabet.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Instruction {
    Left,
    Right,
    Cw,
    Ccw,
    SonicDrop,
}

#[derive(Debug, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumSetType)]
pub enum PieceKind {
    I,
    O,
    T,
    L,
    J,
    S,
    Z,
}

impl fmt::Display for PieceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl PieceKind {
    /// Cells occupied in the North orientation, relative to the rotation anchor.
    pub const fn cells(&self) -> [(i8, i8); 4] {
        match self {
            Self::I => [(-1, 0), (0, 0), (1, 0), (2, 0)],
            Self::O => [(0, 0), (1, 0), (0, 1), (1, 1)],
            Self::T => [(-1, 0), (0, 0), (0, 1), (1, 0)],
            Self::L => [(-1, 0), (0, 0), (1, 0), (1, 1)],
            Self::J => [(-1, 0), (-1, 1), (0, 0), (1, 0)],
            Self::S => [(-1, 0), (0, 0), (0, 1), (1, 1)],
            Self::Z => [(-1, 1), (0, 0), (0, 1), (1, 0)],
        }
    }

    /// SRS true-rotation offsets. A kick attempt from orientation `a` to `b`
    /// is `offsets(a)[i] - offsets(b)[i]`, tried for i = 0..5.
    pub const fn rotation_offsets(&self, rotation: Rotation) -> [(i8, i8); 5] {
        match self {
            Self::O => match rotation {
                Rotation::North => [(0, 0); 5],
                Rotation::East => [(0, -1); 5],
                Rotation::South => [(-1, -1); 5],
                Rotation::West => [(-1, 0); 5],
            },
            Self::I => match rotation {
                Rotation::North => [(0, 0), (-1, 0), (2, 0), (-1, 0), (2, 0)],
                Rotation::East => [(-1, 0), (0, 0), (0, 0), (0, 1), (0, -2)],
                Rotation::South => [(-1, 1), (1, 1), (-2, 1), (1, 0), (-2, 0)],
                Rotation::West => [(0, 1), (0, 1), (0, 1), (0, -1), (0, 2)],
            },
            _ => match rotation {
                Rotation::North => [(0, 0); 5],
                Rotation::East => [(0, 0), (1, 0), (1, -1), (0, 2), (1, 2)],
                Rotation::South => [(0, 0); 5],
                Rotation::West => [(0, 0), (-1, 0), (-1, -1), (0, 2), (-1, 2)],
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Rotation {
    North,
    East,
    South,
    West,
}

impl Rotation {
    pub const fn rotate_cell(&self, (x, y): (i8, i8)) -> (i8, i8) {
        match self {
            Rotation::North => (x, y),
            Rotation::East => (y, -x),
            Rotation::South => (-x, -y),
            Rotation::West => (-y, x),
        }
    }

    pub const fn cw(&self) -> Rotation {
        match self {
            Rotation::North => Rotation::East,
            Rotation::East => Rotation::South,
            Rotation::South => Rotation::West,
            Rotation::West => Rotation::North,
        }
    }

    pub const fn ccw(&self) -> Rotation {
        match self {
            Rotation::North => Rotation::West,
            Rotation::West => Rotation::South,
            Rotation::South => Rotation::East,
            Rotation::East => Rotation::North,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PiecePosition {
    #[serde(rename = "type")]
    pub kind: PieceKind,
    pub x: i8,
    pub y: i8,
    #[serde(rename = "orientation")]
    pub rot: Rotation,
}

impl PiecePosition {
    pub fn cells(&self) -> [(i8, i8); 4] {
        self.kind.cells().map(|cell| {
            let (x, y) = self.rot.rotate_cell(cell);
            (x + self.x, y + self.y)
        })
    }

    pub fn translate(&self, (dx, dy): (i8, i8)) -> Self {
        PiecePosition {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }
}

impl Display for PiecePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@({},{})`{:?}", self.kind, self.x, self.y, self.rot)
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpinKind {
    None,
    Mini,
    Full,
}

/// A piece position together with the spin status it would lock with.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PieceState {
    #[serde(rename = "location")]
    pub pos: PiecePosition,
    pub spin: SpinKind,
}

impl PieceState {
    pub const fn new(kind: PieceKind, (x, y): (i8, i8), rot: Rotation) -> Self {
        PieceState {
            pos: PiecePosition { kind, x, y, rot },
            spin: SpinKind::None,
        }
    }

    pub fn cells(&self) -> [(i8, i8); 4] {
        self.pos.cells()
    }

    /// Sorted cell set; the canonical identity of a placement.
    pub fn cell_key(&self) -> [(i8, i8); 4] {
        let mut cells = self.cells();
        cells.sort();
        cells
    }
}

/// Where freshly dealt pieces appear.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpawnRule {
    #[serde(rename = "row_19_or_20")]
    Row19Or20,
    #[serde(rename = "row_21_and_fall")]
    Row21AndFall,
}

impl SpawnRule {
    /// Returns the spawn state, or None if the piece cannot appear at all.
    pub fn spawn(self, kind: PieceKind, board: &BitBoard) -> Option<PieceState> {
        match self {
            SpawnRule::Row19Or20 => {
                let low = PieceState::new(kind, (4, 19), Rotation::North);
                if !board.collides(low.pos) {
                    return Some(low);
                }
                let high = PieceState::new(kind, (4, 20), Rotation::North);
                (!board.collides(high.pos)).then_some(high)
            }
            SpawnRule::Row21AndFall => {
                let state = PieceState::new(kind, (4, 21), Rotation::North);
                (!board.collides(state.pos)).then_some(state)
            }
        }
    }
}

/// Outcome of locking a piece: line clears, scoring transitions, death.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PlacementResult {
    pub lines_cleared: u32,
    /// Pre-clear row indices, bottom-up.
    pub cleared: ArrayVec<i32, 4>,
    pub spin: SpinKind,
    /// Consecutive-clear counter after this placement, -1 when broken.
    pub combo: i32,
    /// Back-to-back flag after this placement.
    pub b2b: bool,
    /// The clear continued an active back-to-back chain.
    pub is_b2b_clear: bool,
    pub is_pc: bool,
    /// Every cell of the piece locked at or above row 20.
    pub lock_out: bool,
}

impl Default for PlacementResult {
    fn default() -> Self {
        PlacementResult {
            lines_cleared: 0,
            cleared: ArrayVec::new(),
            spin: SpinKind::None,
            combo: -1,
            b2b: false,
            is_b2b_clear: false,
            is_pc: false,
            lock_out: false,
        }
    }
}

impl PlacementResult {
    pub fn attack(&self) -> u32 {
        if self.lines_cleared == 0 {
            0
        } else if self.is_pc {
            10
        } else {
            let base = match self.spin {
                SpinKind::None | SpinKind::Mini => match self.lines_cleared {
                    1 => 0,
                    2 => 1,
                    3 => 2,
                    4 => 4,
                    _ => 0,
                },
                SpinKind::Full => 2 * self.lines_cleared,
            };
            base + self.is_b2b_clear as u32 + combo_attack(self.combo)
        }
    }
}

/// Lines of garbage sent by the combo counter alone.
pub fn combo_attack(combo: i32) -> u32 {
    const COMBO_ATTACK: [u32; 12] = [0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 4, 5];
    if combo < 0 {
        0
    } else {
        *COMBO_ATTACK.get(combo as usize).unwrap_or(&5)
    }
}

/// The 7-bag randomizer reservoir. The empty set denotes a full bag.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SevenBag(pub EnumSet<PieceKind>);

impl SevenBag {
    pub fn has(&self, piece: PieceKind) -> bool {
        self.0.is_empty() || self.0.contains(piece)
    }

    /// The set of pieces the bag can still deal.
    pub fn possibilities(&self) -> EnumSet<PieceKind> {
        if self.0.is_empty() {
            EnumSet::all()
        } else {
            self.0
        }
    }

    /// Removes a dealt piece. A piece the bag could not have dealt refills
    /// the bag first, so the state stays consistent with any client.
    pub fn take(&mut self, piece: PieceKind) {
        if self.0.is_empty() || !self.0.contains(piece) {
            self.0 = EnumSet::all();
        }
        self.0.remove(piece);
    }

    pub fn take_rand(&mut self) -> PieceKind {
        if self.0.is_empty() {
            self.0 = EnumSet::all();
        }
        let idx = thread_rng().gen_range(0..self.0.len());
        let piece = self.0.iter().nth(idx).unwrap();
        self.0.remove(piece);
        piece
    }
}

pub const FIELD_WIDTH: usize = 10;
pub const FIELD_ROWS: usize = 40;

/// The playfield: ten column bitmasks, bit y = row y, row 0 at the bottom.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize)]
#[serde(from = "Vec<[Option<char>; 10]>")]
pub struct BitBoard {
    pub cols: [u64; 10],
}

impl BitBoard {
    pub fn occupied(&self, (x, y): (i8, i8)) -> bool {
        x < 0
            || x >= FIELD_WIDTH as i8
            || y < 0
            || y >= FIELD_ROWS as i8
            || self.cols[x as usize] & (1 << y) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.cols.iter().all(|&col| col == 0)
    }

    pub fn height_of(&self, x: i8) -> i32 {
        debug_assert!((0..10).contains(&x));
        (u64::BITS - self.cols[x as usize].leading_zeros()) as i32
    }

    pub fn heights(&self) -> [i32; 10] {
        let mut hs = [0; 10];
        for (x, h) in hs.iter_mut().enumerate() {
            *h = self.height_of(x as i8);
        }
        hs
    }

    /// Row y as a 10-bit mask, bit x = column x.
    pub fn get_row(&self, y: i8) -> u16 {
        self.cols
            .iter()
            .enumerate()
            .fold(0, |acc, (x, col)| acc | (((col >> y) & 1) as u16) << x)
    }

    /// Number of consecutive empty cells directly below (x, y).
    pub fn distance_to_ground(&self, (x, y): (i8, i8)) -> i32 {
        debug_assert!((0..10).contains(&x) && (0..u64::BITS as i8).contains(&y));
        if y == 0 {
            0
        } else {
            (!self.cols[x as usize] << (u64::BITS as i8 - y)).leading_ones() as i32
        }
    }

    pub fn collides(&self, piece: PiecePosition) -> bool {
        piece.cells().iter().any(|&cell| self.occupied(cell))
    }

    pub fn strafe(&self, piece: PieceState, delta: (i8, i8)) -> Option<PieceState> {
        let pos = piece.pos.translate(delta);
        if self.collides(pos) {
            None
        } else {
            // any plain movement voids spin status
            Some(PieceState {
                pos,
                spin: SpinKind::None,
            })
        }
    }

    /// SRS rotation with kicks. T pieces get their spin classified from the
    /// diagonal corners of the final position; the fifth kick always counts
    /// as a full spin.
    pub fn rotate(&self, piece: PieceState, clockwise: bool) -> Option<PieceState> {
        let from = piece.pos.rot;
        let to = if clockwise { from.cw() } else { from.ccw() };

        let from_offsets = piece.pos.kind.rotation_offsets(from);
        let to_offsets = piece.pos.kind.rotation_offsets(to);

        for (i, (a, b)) in from_offsets.iter().zip(to_offsets).enumerate() {
            let target = PiecePosition {
                x: piece.pos.x + a.0 - b.0,
                y: piece.pos.y + a.1 - b.1,
                rot: to,
                ..piece.pos
            };
            if self.collides(target) {
                continue;
            }

            let spin = if target.kind != PieceKind::T {
                SpinKind::None
            } else {
                let corners = [(-1, -1), (1, -1), (-1, 1), (1, 1)]
                    .iter()
                    .filter(|&&(cx, cy)| self.occupied((target.x + cx, target.y + cy)))
                    .count();
                let front_corners = [(-1, 1), (1, 1)]
                    .iter()
                    .map(|&c| target.rot.rotate_cell(c))
                    .filter(|&(cx, cy)| self.occupied((target.x + cx, target.y + cy)))
                    .count();

                if corners < 3 {
                    SpinKind::None
                } else if front_corners == 2 || i == 4 {
                    SpinKind::Full
                } else {
                    SpinKind::Mini
                }
            };
            return Some(PieceState { pos: target, spin });
        }
        None
    }

    /// The state after a maximal fall. Spin survives only if nothing moved.
    pub fn sonic_drop(&self, piece: &PieceState) -> PieceState {
        let distance = piece
            .cells()
            .iter()
            .map(|&cell| self.distance_to_ground(cell))
            .min()
            .unwrap() as i8;
        PieceState {
            pos: PiecePosition {
                y: piece.pos.y - distance,
                ..piece.pos
            },
            spin: if distance == 0 {
                piece.spin
            } else {
                SpinKind::None
            },
        }
    }

    pub fn is_grounded(&self, piece: &PieceState) -> bool {
        self.sonic_drop(piece).pos == piece.pos
    }

    /// Every cell of the piece is at or above its column's surface.
    pub fn above_stack(&self, piece: &PieceState) -> bool {
        piece
            .cells()
            .iter()
            .all(|&(x, y)| y as i32 >= self.height_of(x))
    }

    /// Locks a piece: fills its cells, removes full rows, and reports line
    /// clears, spin status, combo, back-to-back and lock-out given the
    /// scoring state the piece locked under.
    pub fn lock_piece(&mut self, piece: PieceState, b2b: bool, combo: i32) -> PlacementResult {
        let lock_out = piece.cells().iter().all(|&(_, y)| y >= 20);
        for (x, y) in piece.cells() {
            self.cols[x as usize] |= 1 << y;
        }

        let full = self.cols.iter().fold(u64::MAX, |acc, col| acc & col);
        let mut cleared = ArrayVec::new();
        let mut rest = full;
        while rest != 0 {
            cleared.push(rest.trailing_zeros() as i32);
            rest &= rest - 1;
        }
        for col in &mut self.cols {
            collapse_rows(col, full);
        }

        let lines_cleared = cleared.len() as u32;
        let is_pc = self.is_empty();
        let hard = lines_cleared == 4 || (lines_cleared > 0 && piece.spin != SpinKind::None);
        let is_b2b_clear = b2b && hard;
        // an easy clear breaks the chain, except when it empties the board
        let (b2b, combo) = if lines_cleared > 0 {
            (hard || (is_pc && b2b), combo + 1)
        } else {
            (b2b, -1)
        };

        PlacementResult {
            lines_cleared,
            cleared,
            spin: piece.spin,
            combo,
            b2b,
            is_b2b_clear,
            is_pc,
            lock_out,
        }
    }

    /// Decodes the boundary representation: 40 rows of 10 cells, row 0 at
    /// the bottom.
    pub fn from_rows(field: &[[bool; 10]; 40]) -> Self {
        let mut cols = [0u64; 10];
        for (y, row) in field.iter().enumerate() {
            for (x, &cell) in row.iter().enumerate() {
                if cell {
                    cols[x] |= 1 << y;
                }
            }
        }
        BitBoard { cols }
    }

    pub fn to_rows(&self) -> [[bool; 10]; 40] {
        let mut field = [[false; 10]; 40];
        for (y, row) in field.iter_mut().enumerate() {
            for (x, cell) in row.iter_mut().enumerate() {
                *cell = self.cols[x] & (1 << y) != 0;
            }
        }
        field
    }
}

fn collapse_rows(col: &mut u64, mut rows: u64) {
    while rows != 0 {
        let i = rows.trailing_zeros();
        let below = (1 << i) - 1;
        *col = *col & below | *col >> 1 & !below;
        rows &= !(1 << i);
        rows >>= 1;
    }
}

impl Serialize for BitBoard {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rows: Vec<[Option<char>; 10]> = (0..FIELD_ROWS as i8)
            .map(|y| {
                let mut row = [None; 10];
                for (x, cell) in row.iter_mut().enumerate() {
                    if self.cols[x] & (1 << y) != 0 {
                        *cell = Some('G');
                    }
                }
                row
            })
            .collect();
        rows.serialize(serializer)
    }
}

impl From<Vec<[Option<char>; 10]>> for BitBoard {
    fn from(v: Vec<[Option<char>; 10]>) -> Self {
        let mut cols = [0; 10];
        for (y, row) in v.iter().enumerate().take(FIELD_ROWS) {
            for (x, cell) in row.iter().enumerate() {
                if cell.is_some() {
                    cols[x] |= 1 << y;
                }
            }
        }
        BitBoard { cols }
    }
}

/// The full live game state a bot reasons from.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct GameState {
    pub board: BitBoard,
    pub hold: Option<PieceKind>,
    pub queue: VecDeque<PieceKind>,
    pub bag: SevenBag,
    pub b2b: bool,
    /// Consecutive-clear counter, -1 when broken. The client-visible
    /// "x combo" is x - 1 here.
    pub combo: i32,
}

impl Default for GameState {
    fn default() -> Self {
        GameState {
            board: BitBoard::default(),
            hold: None,
            queue: VecDeque::new(),
            bag: SevenBag::default(),
            b2b: false,
            combo: -1,
        }
    }
}

impl GameState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a known upcoming piece, keeping the bag consistent.
    pub fn add_piece(&mut self, piece: PieceKind) {
        self.bag.take(piece);
        self.queue.push_back(piece);
    }

    /// Deals a random piece from the bag into the queue.
    pub fn fulfill_queue(&mut self) -> PieceKind {
        let piece = self.bag.take_rand();
        self.queue.push_back(piece);
        piece
    }

    pub fn place_piece(&mut self, piece: PieceState) -> PlacementResult {
        let result = self.board.lock_piece(piece, self.b2b, self.combo);
        self.b2b = result.b2b;
        self.combo = result.combo;
        result
    }
}

/// Builds a `BitBoard` from rows listed top-first, `x` marking filled cells.
#[macro_export]
macro_rules! bit_board {
    ($($row:expr),* $(,)?) => {
        $crate::tetris::BitBoard {
            cols: [0, 1, 2, 3, 4, 5, 6, 7, 8, 9].map(|x| {
                let mut col = 0u64;
                let mut y = 0;
                $(
                    col |= match $row.as_bytes()[x as usize] {
                        b'x' => 1 << y,
                        _ => 0,
                    };
                    y += 1;
                )*
                col.reverse_bits() >> (64 - y)
            })
        }
    };
}
