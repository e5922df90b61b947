use game::tetris::{BitBoard, PieceKind, PlacementResult, SevenBag};

mod standard;
pub use standard::Standard;

/// Everything the evaluator sees besides the board itself.
pub struct EvalContext {
    /// Bag state at the evaluated node, for piece-availability reasoning.
    pub bag: SevenBag,
    pub hold: Option<PieceKind>,
    /// Input tokens spent on the move, plus one for a hold toggle.
    pub move_time: u32,
    pub placed: PieceKind,
}

/// A root child up for commitment.
pub struct Candidate {
    /// Arena handle of the child node.
    pub node: u32,
    /// Edge reward plus backed-up value.
    pub score: i64,
    /// Highest column of the child board.
    pub height: i32,
    pub lines_cleared: u32,
    pub original_rank: u32,
}

/// Scores a static board and the transition that produced it. The two
/// outputs are combined by the search: decision nodes back up the maximum
/// of reward + child value, chance nodes the mean over piece groups.
pub trait Evaluator: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Returns (board value, transition reward).
    fn evaluate(&self, lock: &PlacementResult, board: &BitBoard, ctx: &EvalContext) -> (i32, i32);

    /// Chooses the root child to commit, knowing how much garbage is about
    /// to arrive. Ties break towards the earlier original rank.
    fn pick_move(&self, candidates: &[Candidate], incoming: u32) -> usize {
        let _ = incoming;
        best_by_score(candidates, |c| c.score)
    }
}

pub(crate) fn best_by_score(candidates: &[Candidate], score: impl Fn(&Candidate) -> i64) -> usize {
    let mut best = 0;
    for i in 1..candidates.len() {
        let (a, b) = (score(&candidates[i]), score(&candidates[best]));
        if a > b || (a == b && candidates[i].original_rank < candidates[best].original_rank) {
            best = i;
        }
    }
    best
}
