use game::tetris::{
    combo_attack, BitBoard, PieceKind, PiecePosition, PieceState, PlacementResult, Rotation,
    SpinKind,
};
use serde::{Deserialize, Serialize};

use super::{best_by_score, Candidate, EvalContext, Evaluator};

/// The weighted-feature evaluator. Every field is client-tunable; the
/// defaults are a balanced midgame configuration.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Standard {
    pub back_to_back: i32,
    pub bumpiness: i32,
    pub bumpiness_sq: i32,
    pub row_transitions: i32,
    pub height: i32,
    pub top_half: i32,
    pub top_quarter: i32,
    pub jeopardy: i32,
    pub cavity_cells: i32,
    pub cavity_cells_sq: i32,
    pub overhang_cells: i32,
    pub overhang_cells_sq: i32,
    pub covered_cells: i32,
    pub covered_cells_sq: i32,
    pub tslot: [i32; 4],
    pub well_depth: i32,
    pub max_well_depth: i32,
    pub well_column: [i32; 10],

    pub b2b_clear: i32,
    pub clear1: i32,
    pub clear2: i32,
    pub clear3: i32,
    pub clear4: i32,
    pub tspin1: i32,
    pub tspin2: i32,
    pub tspin3: i32,
    pub mini_tspin1: i32,
    pub mini_tspin2: i32,
    pub perfect_clear: i32,
    pub combo_garbage: i32,
    pub move_time: i32,
    pub wasted_t: i32,

    pub use_bag: bool,
    pub timed_jeopardy: bool,
    pub stack_pc_damage: bool,

    pub sub_name: Option<String>,
}

impl Default for Standard {
    fn default() -> Self {
        Standard {
            back_to_back: 52,
            bumpiness: -13,
            bumpiness_sq: -5,
            row_transitions: -2,
            height: -12,
            top_half: -150,
            top_quarter: -511,
            jeopardy: -11,
            cavity_cells: -158,
            cavity_cells_sq: -7,
            overhang_cells: -48,
            overhang_cells_sq: 1,
            covered_cells: -17,
            covered_cells_sq: -1,
            tslot: [8, 148, 192, 407],
            well_depth: 57,
            max_well_depth: 17,
            well_column: [20, 23, 20, 50, 59, 21, 59, 10, -10, 24],

            b2b_clear: 104,
            clear1: -143,
            clear2: -100,
            clear3: -58,
            clear4: 390,
            tspin1: 121,
            tspin2: 410,
            tspin3: 602,
            mini_tspin1: -158,
            mini_tspin2: -93,
            perfect_clear: 999,
            combo_garbage: 150,
            move_time: -25,
            wasted_t: -152,

            use_bag: true,
            timed_jeopardy: true,
            stack_pc_damage: false,

            sub_name: None,
        }
    }
}

impl Evaluator for Standard {
    fn name(&self) -> String {
        let mut name = "Standard".to_owned();
        if let Some(extra) = &self.sub_name {
            name.push('\n');
            name.push_str(extra);
        }
        name
    }

    fn evaluate(&self, lock: &PlacementResult, board: &BitBoard, ctx: &EvalContext) -> (i32, i32) {
        let mut reward = 0;

        if lock.is_pc {
            reward += self.perfect_clear;
        }
        if !lock.is_pc || self.stack_pc_damage {
            if lock.is_b2b_clear {
                reward += self.b2b_clear;
            }
            if lock.lines_cleared > 0 {
                reward += self.combo_garbage * combo_attack(lock.combo) as i32;
            }
            reward += match (lock.spin, lock.lines_cleared) {
                (SpinKind::None, 1) => self.clear1,
                (SpinKind::None, 2) => self.clear2,
                (SpinKind::None, 3) => self.clear3,
                (SpinKind::None, 4) => self.clear4,
                (SpinKind::Full, 1) => self.tspin1,
                (SpinKind::Full, 2) => self.tspin2,
                (SpinKind::Full, 3) => self.tspin3,
                (SpinKind::Mini, 1) => self.mini_tspin1,
                (SpinKind::Mini, 2) => self.mini_tspin2,
                _ => 0,
            };
        }

        if ctx.placed == PieceKind::T && !(lock.spin == SpinKind::Full && lock.lines_cleared > 0) {
            reward += self.wasted_t;
        }

        // spawn delay and line clear delay approximations
        let delay = if lock.lines_cleared > 0 { 45 } else { 0 };
        reward += self.move_time * (ctx.move_time + 10 + delay) as i32;

        let mut value = 0;
        if lock.b2b {
            value += self.back_to_back;
        }

        let heights = board.heights();
        value += self.height * heights.iter().sum::<i32>();
        value += self.top_half * cells_above(board, 10);
        value += self.top_quarter * cells_above(board, 15);
        value += self.row_transitions * row_transitions(board, &heights);

        value += self.tslot_value(board, ctx);

        let well = well_column(&heights);
        let depth = well_depth(board, well, &heights).min(self.max_well_depth);
        value += self.well_depth * depth;
        if depth != 0 {
            value += self.well_column[well];
        }

        if self.bumpiness | self.bumpiness_sq != 0 {
            let (bump, bump_sq) = bumpiness(&heights, well);
            value += self.bumpiness * bump;
            value += self.bumpiness_sq * bump_sq;
        }

        let (cavities, overhangs) = cavities_and_overhangs(board, &heights);
        value += self.cavity_cells * cavities;
        value += self.cavity_cells_sq * cavities * cavities;
        value += self.overhang_cells * overhangs;
        value += self.overhang_cells_sq * overhangs * overhangs;

        let (covered, covered_sq) = covered_cells(board, &heights);
        value += self.covered_cells * covered;
        value += self.covered_cells_sq * covered_sq;

        (value, reward)
    }

    /// The best candidate after discounting moves that would leave the
    /// stack in jeopardy once the incoming garbage lands.
    fn pick_move(&self, candidates: &[Candidate], incoming: u32) -> usize {
        best_by_score(candidates, |c| {
            let mut score = c.score;
            if incoming > 0 && self.jeopardy != 0 && c.height + incoming as i32 >= 18 {
                let mut penalty = self.jeopardy as i64 * incoming as i64;
                if self.timed_jeopardy && c.lines_cleared == 0 {
                    // no clear means the garbage lands before we recover
                    penalty *= 2;
                }
                score += penalty;
            }
            score
        })
    }
}

impl Standard {
    /// Skews the weights towards perfect-clear chains when the bot is
    /// launched in a perfect-clear loop configuration.
    pub fn bias_for_pc(&mut self, priority: crate::PcPriority) {
        self.perfect_clear = self.perfect_clear.saturating_mul(10);
        match priority {
            crate::PcPriority::Fastest => self.move_time = self.move_time.saturating_mul(2),
            crate::PcPriority::HighestAttack => {
                self.combo_garbage += self.combo_garbage / 2;
                self.b2b_clear += self.b2b_clear / 2;
            }
        }
    }

    /// Scores reachable T-slot setups, carving each one out so stacked
    /// setups are counted.
    fn tslot_value(&self, board: &BitBoard, ctx: &EvalContext) -> i32 {
        let budget = if self.use_bag {
            ctx.bag.possibilities().contains(PieceKind::T) as i32
                + (ctx.hold == Some(PieceKind::T)) as i32
        } else {
            4
        };

        let mut value = 0;
        let mut scan = board.clone();
        for _ in 0..budget {
            let piece = if let Some((x, y)) = open_tslot(&scan) {
                PieceState {
                    pos: PiecePosition {
                        kind: PieceKind::T,
                        x,
                        y,
                        rot: Rotation::South,
                    },
                    spin: SpinKind::Full,
                }
            } else if let Some(twist) = tst_chamber(&scan) {
                if !twist.is_tslot {
                    break;
                }
                twist.piece()
            } else {
                break;
            };

            let (lines, carved) = carve_tslot(scan.clone(), piece);
            value += self.tslot[lines];
            match carved {
                Some(next) => scan = next,
                None => break,
            }
        }
        value
    }
}

/// Filled cells at or above the given row.
fn cells_above(board: &BitBoard, row: i8) -> i32 {
    let mask = !((1u64 << row) - 1);
    board
        .cols
        .iter()
        .map(|col| (col & mask).count_ones() as i32)
        .sum()
}

/// Filled/empty flips within each row below the stack surface; the side
/// walls count as filled.
fn row_transitions(board: &BitBoard, heights: &[i32; 10]) -> i32 {
    let top = heights.iter().copied().max().unwrap_or(0);
    (0..top as i8)
        .map(|y| {
            let row = board.get_row(y) as u32;
            ((row | 1 << 10) ^ (row << 1 | 1)).count_ones() as i32
        })
        .sum()
}

/// The column treated as the well: the lowest one, rightmost on ties.
fn well_column(heights: &[i32; 10]) -> usize {
    let mut well = 0;
    for x in 1..10 {
        if heights[x] <= heights[well] {
            well = x;
        }
    }
    well
}

/// Rows above the well floor that are filled in every other column.
fn well_depth(board: &BitBoard, well: usize, heights: &[i32; 10]) -> i32 {
    let mut depth = 0;
    'rows: for y in heights[well]..20 {
        for x in 0..10i8 {
            if x as usize != well && !board.occupied((x, y as i8)) {
                break 'rows;
            }
        }
        depth += 1;
    }
    depth
}

/// Height changes between adjacent columns, skipping the well.
fn bumpiness(heights: &[i32; 10], well: usize) -> (i32, i32) {
    let mut bump = 0;
    let mut bump_sq = 0;
    let mut prev: Option<i32> = None;
    for (x, &h) in heights.iter().enumerate() {
        if x == well {
            continue;
        }
        if let Some(p) = prev {
            let dh = (p - h).abs();
            bump += dh;
            bump_sq += dh * dh;
        }
        prev = Some(h);
    }
    (bump, bump_sq)
}

/// Covered empty cells, and filled cells sitting on empty ones.
fn cavities_and_overhangs(board: &BitBoard, heights: &[i32; 10]) -> (i32, i32) {
    let mut cavities = 0;
    let mut overhangs = 0;
    for x in 0..10i8 {
        for y in 0..heights[x as usize] as i8 {
            if !board.occupied((x, y)) {
                cavities += 1;
            } else if y > 0 && !board.occupied((x, y - 1)) {
                overhangs += 1;
            }
        }
    }
    (cavities, overhangs)
}

/// How deeply the holes in each column are buried, capped at 6 per hole.
fn covered_cells(board: &BitBoard, heights: &[i32; 10]) -> (i32, i32) {
    let mut covered = 0;
    let mut covered_sq = 0;
    for x in 0..10i8 {
        for y in (0..heights[x as usize] as i8 - 2).rev() {
            if !board.occupied((x, y)) {
                let cells = 6.min(heights[x as usize] - y as i32 - 1);
                covered += cells;
                covered_sq += cells * cells;
            }
        }
    }
    (covered, covered_sq)
}

/// A two-cell-wide notch open to the sky that a T can be spun into:
///
/// ```text
/// []....    ....[]
/// ......    ......
/// []..[]    []..[]
/// ```
///
/// Prefers the slot with the most completed rows. Returns the anchor the
/// T would occupy, facing south.
fn open_tslot(board: &BitBoard) -> Option<(i8, i8)> {
    let heights = board.heights();
    let mut best: Option<(usize, i8, i8)> = None;
    for x in 0..9 {
        let (left, right) = (heights[x], heights[x + 1]);
        let (cx, cy) = if left > right {
            (x as i8 + 1, left as i8)
        } else if right > left {
            (x as i8, right as i8)
        } else {
            continue;
        };
        let lip = if left > right { cx + 1 } else { cx - 1 };
        let shaped = board.occupied((lip, cy + 1))
            && !board.occupied((lip, cy))
            && board.occupied((lip, cy - 1));
        if !shaped {
            continue;
        }
        let fill = slot_filledness(board, cx, cy);
        if best.map_or(true, |(f, _, _)| fill > f) {
            best = Some((fill, cx, cy));
        }
    }
    best.map(|(_, x, y)| (x, y))
}

/// Completed rows among the two the slot would clear.
fn slot_filledness(board: &BitBoard, cx: i8, cy: i8) -> usize {
    let mut filled = 0;
    for y in [cy - 1, cy] {
        let complete = (0..10i8)
            .filter(|&rx| rx < cx - 1 || rx > cx + 1)
            .all(|rx| board.occupied((rx, y)));
        if !complete {
            break;
        }
        filled += 1;
    }
    filled
}

struct TstTwist {
    point_left: bool,
    is_tslot: bool,
    x: i8,
    y: i8,
}

impl TstTwist {
    fn piece(&self) -> PieceState {
        PieceState {
            pos: PiecePosition {
                kind: PieceKind::T,
                x: self.x,
                y: self.y,
                rot: if self.point_left {
                    Rotation::West
                } else {
                    Rotation::East
                },
            },
            spin: if self.is_tslot {
                SpinKind::Full
            } else {
                SpinKind::None
            },
        }
    }
}

/// A TST-style chamber reachable from the sky:
///
/// ```text
/// []....{}    {}....[]
/// ......{}    {}......
/// ..[]            []..
/// ....            ....
/// ..                ..
/// ```
///
/// where the `{}` cells have matching occupancy.
fn tst_chamber(board: &BitBoard) -> Option<TstTwist> {
    let heights = board.heights();
    for x in 0..8usize {
        let (lh, mh, rh) = (heights[x], heights[x + 1], heights[x + 2]);
        let x = x as i8;
        if lh > mh && mh >= rh {
            let m = mh as i8;
            let shaped = board.occupied((x, m + 1))
                && !board.occupied((x, m))
                && !board.occupied((x, m - 1))
                && !board.occupied((x, m - 2))
                && !board.occupied((x + 1, m - 2))
                && !board.occupied((x, m - 3))
                && board.occupied((x + 3, m)) == board.occupied((x + 3, m + 1));
            if shaped {
                return Some(TstTwist {
                    point_left: false,
                    x,
                    y: m - 2,
                    is_tslot: board.occupied((x - 1, m - 1)) as usize
                        + board.occupied((x - 1, m - 3)) as usize
                        + board.occupied((x + 1, m - 3)) as usize
                        >= 2,
                });
            }
        } else if rh > mh && mh >= lh {
            let m = mh as i8;
            let shaped = board.occupied((x + 2, m + 1))
                && !board.occupied((x + 2, m))
                && !board.occupied((x + 2, m - 1))
                && !board.occupied((x + 2, m - 2))
                && !board.occupied((x + 1, m - 2))
                && !board.occupied((x + 2, m - 3))
                && board.occupied((x - 1, m)) == board.occupied((x - 1, m + 1));
            if shaped {
                return Some(TstTwist {
                    point_left: true,
                    x: x + 2,
                    y: m - 2,
                    is_tslot: board.occupied((x + 1, m - 3)) as usize
                        + board.occupied((x + 3, m - 1)) as usize
                        + board.occupied((x + 3, m - 3)) as usize
                        >= 2,
                });
            }
        }
    }
    None
}

/// Locks the hypothetical T and reports the lines it would clear; the
/// resulting board is returned for further scanning when the spin clears
/// enough to be worth chaining.
fn carve_tslot(mut board: BitBoard, piece: PieceState) -> (usize, Option<BitBoard>) {
    let result = if piece.pos.rot == Rotation::South {
        board.lock_piece(piece, false, -1)
    } else {
        let flipped = PieceState {
            pos: PiecePosition {
                rot: if piece.pos.rot == Rotation::East {
                    Rotation::West
                } else {
                    Rotation::East
                },
                ..piece.pos
            },
            ..piece
        };
        if !board.collides(flipped.pos) && board.is_grounded(&flipped) {
            board.lock_piece(flipped, false, -1)
        } else if board.is_grounded(&piece) {
            board.lock_piece(piece, false, -1)
        } else {
            return (0, None);
        }
    };

    match result.lines_cleared {
        0 => (0, None),
        1 => (1, None),
        n => (n as usize, Some(board)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use game::bit_board;
    use game::tetris::SevenBag;

    fn ctx() -> EvalContext {
        EvalContext {
            bag: SevenBag::default(),
            hold: None,
            move_time: 0,
            placed: PieceKind::O,
        }
    }

    #[test]
    fn surface_features() {
        let board = bit_board! {
            "x.........",
            "x.x.......",
            "xxx....x..",
        };
        let heights = board.heights();
        assert_eq!(heights[0], 3);
        assert_eq!(heights[1], 1);
        assert_eq!(heights[2], 2);
        assert_eq!(heights[7], 1);

        // well is the rightmost empty column
        assert_eq!(well_column(&heights), 9);
        let (bump, bump_sq) = bumpiness(&heights, 9);
        // 3,1,2,0,0,0,0,1,0 -> diffs 2,1,2,0,0,0,1,1
        assert_eq!(bump, 7);
        assert_eq!(bump_sq, 11);
    }

    #[test]
    fn holes_and_cover() {
        let board = bit_board! {
            "xx........",
            "x.........",
            ".x........",
        };
        let heights = board.heights();
        // col0: rows 1,2 filled, row 0 empty -> one cavity, one overhang
        // col1: rows 0,2 filled, row 1 empty -> one cavity, one overhang
        let (cavities, overhangs) = cavities_and_overhangs(&board, &heights);
        assert_eq!(cavities, 2);
        assert_eq!(overhangs, 2);

        let (covered, covered_sq) = covered_cells(&board, &heights);
        // only col0's bottom hole sits deep enough to count, buried by 2
        assert_eq!(covered, 2);
        assert_eq!(covered_sq, 4);
    }

    #[test]
    fn well_depth_counts_clearable_rows() {
        let board = bit_board! {
            "xxxxxxxxx.",
            "xxxxxxxxx.",
            "xxxxxxxxx.",
        };
        let heights = board.heights();
        let well = well_column(&heights);
        assert_eq!(well, 9);
        assert_eq!(well_depth(&board, well, &heights), 3);
    }

    #[test]
    fn transitions_count_wall_boundaries() {
        let board = bit_board! {
            "xxxxx.....",
        };
        let heights = board.heights();
        // one row below the surface: filled run against the left wall,
        // one flip into the empty half, one at the right wall
        assert_eq!(row_transitions(&board, &heights), 2);
    }

    #[test]
    fn detects_open_tslot() {
        // notch over column 4, hooked lip on column 5
        let board = bit_board! {
            ".....x....",
            "xxx...xxxx",
            "xxxx.xxxxx",
            "xxxx.xxxxx",
        };
        let (x, y) = open_tslot(&board).expect("slot");
        assert_eq!((x, y), (4, 2));

        let piece = PieceState {
            pos: PiecePosition {
                kind: PieceKind::T,
                x,
                y,
                rot: Rotation::South,
            },
            spin: SpinKind::Full,
        };
        let (lines, _) = carve_tslot(board, piece);
        assert_eq!(lines, 2);
    }

    #[test]
    fn reward_table() {
        let weights = Standard::default();
        let board = BitBoard::default();

        let tsd = PlacementResult {
            lines_cleared: 2,
            spin: SpinKind::Full,
            combo: 0,
            b2b: true,
            is_b2b_clear: true,
            ..Default::default()
        };
        let (_, reward) = weights.evaluate(&tsd, &board, &ctx());
        let expected = weights.tspin2
            + weights.b2b_clear
            + weights.combo_garbage * combo_attack(0) as i32
            + weights.move_time * (0 + 10 + 45);
        assert_eq!(reward, expected);

        let mut t_ctx = ctx();
        t_ctx.placed = PieceKind::T;
        let nothing = PlacementResult::default();
        let (_, reward) = weights.evaluate(&nothing, &board, &t_ctx);
        assert_eq!(reward, weights.wasted_t + weights.move_time * 10);
    }

    #[test]
    fn perfect_clear_reward_modes() {
        let board = BitBoard::default();
        let pc = PlacementResult {
            lines_cleared: 2,
            spin: SpinKind::None,
            combo: 0,
            is_pc: true,
            b2b: false,
            ..Default::default()
        };

        let plain = Standard {
            move_time: 0,
            ..Default::default()
        };
        let (_, reward) = plain.evaluate(&pc, &board, &ctx());
        assert_eq!(reward, plain.perfect_clear);

        let stacking = Standard {
            move_time: 0,
            stack_pc_damage: true,
            ..Default::default()
        };
        let (_, reward) = stacking.evaluate(&pc, &board, &ctx());
        assert_eq!(
            reward,
            stacking.perfect_clear + stacking.clear2 + stacking.combo_garbage * combo_attack(0) as i32
        );
    }

    #[test]
    fn jeopardy_discourages_tall_candidates_under_garbage() {
        let weights = Standard::default();
        let candidates = [
            Candidate {
                node: 0,
                score: 100,
                height: 16,
                lines_cleared: 0,
                original_rank: 0,
            },
            Candidate {
                node: 1,
                score: 90,
                height: 4,
                lines_cleared: 0,
                original_rank: 1,
            },
        ];
        assert_eq!(weights.pick_move(&candidates, 0), 0);
        // six incoming rows put the tall option at 22: pay the penalty
        assert_eq!(weights.pick_move(&candidates, 6), 1);
    }
}
