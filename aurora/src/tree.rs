//! The search tree: arena-allocated nodes, a best-first frontier, hold
//! branching, and chance-node speculation over the unknown part of the
//! queue.
//!
//! Queue bookkeeping is absolute: `pieces` counts queue entries consumed
//! before the current root, and every node records how many pieces its path
//! has consumed (`queue_pos`). Speculation only ever concerns positions at
//! or past the end of the known queue, so a node's unknown-piece
//! possibilities are always the tree-level bag with the node's own
//! unrevealed assumptions removed; nodes store those assumptions as
//! (position, piece) pairs instead of a bag snapshot that could go stale.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use enumset::EnumSet;
use game::tetris::movegen::find_moves;
use game::tetris::{
    BitBoard, GameState, PieceKind, PieceState, PlacementResult, SevenBag, SpinKind,
};
use smallvec::SmallVec;

use crate::eval::{Candidate, EvalContext, Evaluator};
use crate::{Info, Move, Options, PlanStep};

/// Frontier priority bonus per ply of depth.
const DEPTH_BONUS: i64 = 10;
/// Value assigned to lines of play that are certain deaths.
const DEATH_VALUE: i64 = -1_000_000;
/// Principal variation length reported to clients.
const MAX_PLAN: usize = 32;

type Speculated = SmallVec<[(u32, PieceKind); 2]>;

pub(crate) struct SearchTree {
    nodes: Vec<Node>,
    root: u32,
    /// Live state at the root: board, hold, known queue, bag, scoring.
    state: GameState,
    /// Queue entries consumed before the root.
    pieces: u32,
    frontier: BinaryHeap<FrontierEntry>,
    seq: u64,
    /// Lifetime expansion count, capped by `max_nodes`.
    expansions: u32,
    /// Bumped on every root advance or reset; stale think results are
    /// recognized and dropped by comparing this.
    epoch: u64,
    options: Options,
}

struct Node {
    board: BitBoard,
    hold: Option<PieceKind>,
    b2b: bool,
    combo: i32,
    queue_pos: u32,
    speculated: Speculated,
    /// Edge from the parent; None only for the root.
    placement: Option<PieceState>,
    lock: PlacementResult,
    hold_used: bool,
    parent: Option<u32>,
    eval: i32,
    value: i64,
    reward: i32,
    depth: u32,
    original_rank: u32,
    children: ChildSet,
    leased: bool,
    parked: bool,
    dead: bool,
}

enum ChildSet {
    Unexpanded,
    Decision(Vec<u32>),
    /// One group of children per piece the unknown queue position `pos`
    /// could turn out to be, weighted uniformly.
    Chance {
        pos: u32,
        groups: Vec<(PieceKind, Vec<u32>)>,
    },
}

/// Max-heap key: priority, then deeper, then higher static evaluation,
/// then earlier insertion.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct FrontierEntry {
    score: i64,
    depth: u32,
    eval: i32,
    seq: Reverse<u64>,
    node: u32,
}

/// A leased frontier leaf plus everything a worker needs to expand it
/// without holding the tree lock.
pub(crate) struct ThinkJob {
    node: u32,
    epoch: u64,
    board: BitBoard,
    hold: Option<PieceKind>,
    b2b: bool,
    combo: i32,
    queue_pos: u32,
    /// Resolved upcoming pieces: the current piece, plus the piece behind
    /// it when a hold swap would consume two.
    upcoming: SmallVec<[PieceKind; 2]>,
    /// The unknown position to speculate over, if any.
    speculation: Option<(u32, EnumSet<PieceKind>)>,
    bag: SevenBag,
}

pub(crate) enum ThinkResult {
    Children(Vec<ChildData>),
    Speculated(u32, Vec<(PieceKind, Vec<ChildData>)>),
}

pub(crate) struct ChildData {
    placement: PieceState,
    hold_used: bool,
    board: BitBoard,
    hold: Option<PieceKind>,
    queue_pos: u32,
    lock: PlacementResult,
    eval: i32,
    reward: i32,
}

impl SearchTree {
    pub fn new(state: GameState, options: Options) -> Self {
        let mut tree = SearchTree {
            nodes: Vec::with_capacity(1024),
            root: 0,
            state,
            pieces: 0,
            frontier: BinaryHeap::new(),
            seq: 0,
            expansions: 0,
            epoch: 0,
            options,
        };
        let root = tree.fresh_root();
        tree.nodes.push(root);
        tree.push_frontier(0);
        tree
    }

    fn fresh_root(&self) -> Node {
        Node {
            board: self.state.board.clone(),
            hold: self.state.hold,
            b2b: self.state.b2b,
            combo: self.state.combo,
            queue_pos: self.pieces,
            speculated: SmallVec::new(),
            placement: None,
            lock: PlacementResult::default(),
            hold_used: false,
            parent: None,
            eval: 0,
            value: 0,
            reward: 0,
            depth: 0,
            original_rank: 0,
            children: ChildSet::Unexpanded,
            leased: false,
            parked: false,
            dead: false,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.nodes[self.root as usize].dead
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn min_reached(&self, min_nodes: u32) -> bool {
        self.node_count() >= min_nodes
    }

    pub fn at_node_limit(&self) -> bool {
        self.expansions >= self.options.max_nodes
    }

    fn known_end(&self) -> u32 {
        self.pieces + self.state.queue.len() as u32
    }

    fn piece_at(&self, node: u32, pos: u32) -> Option<PieceKind> {
        debug_assert!(pos >= self.pieces);
        if pos < self.known_end() {
            Some(self.state.queue[(pos - self.pieces) as usize])
        } else {
            self.nodes[node as usize]
                .speculated
                .iter()
                .find(|&&(p, _)| p == pos)
                .map(|&(_, piece)| piece)
        }
    }

    /// Bag state governing the node's unknown pieces before `pos`: the
    /// tree-level bag with the node's unrevealed assumptions removed.
    fn bag_at(&self, node: u32, pos: u32) -> SevenBag {
        let mut bag = self.state.bag;
        let known_end = self.known_end();
        for &(p, piece) in &self.nodes[node as usize].speculated {
            if p >= known_end && p < pos {
                bag.take(piece);
            }
        }
        bag
    }

    fn push_frontier(&mut self, node: u32) {
        self.seq += 1;
        let n = &self.nodes[node as usize];
        self.frontier.push(FrontierEntry {
            score: n.value + DEPTH_BONUS * n.depth as i64,
            depth: n.depth,
            eval: n.eval,
            seq: Reverse(self.seq),
            node,
        });
    }

    fn park(&mut self, node: u32) {
        self.nodes[node as usize].parked = true;
    }

    /// Picks the most promising expandable leaf and marks it busy. Leaves
    /// whose expansion needs unavailable queue data are parked until the
    /// next piece arrives (or handed out for speculation when enabled).
    pub fn lease(&mut self) -> Option<ThinkJob> {
        while let Some(entry) = self.frontier.pop() {
            let idx = entry.node;
            {
                let node = &self.nodes[idx as usize];
                if node.dead
                    || node.leased
                    || node.parked
                    || !matches!(node.children, ChildSet::Unexpanded)
                {
                    continue;
                }
            }

            let queue_pos = self.nodes[idx as usize].queue_pos;
            let hold = self.nodes[idx as usize].hold;
            let hold_swap_pending = self.options.use_hold && hold.is_none();

            let mut upcoming = SmallVec::new();
            let mut speculation = None;
            match self.piece_at(idx, queue_pos) {
                None => {
                    // with an empty hold slot the commitment would depend
                    // on two unknowns; wait for the queue instead
                    if hold_swap_pending || !self.options.speculate {
                        self.park(idx);
                        continue;
                    }
                    speculation = Some((queue_pos, self.bag_at(idx, queue_pos).possibilities()));
                }
                Some(first) => {
                    upcoming.push(first);
                    if hold_swap_pending {
                        match self.piece_at(idx, queue_pos + 1) {
                            Some(second) => upcoming.push(second),
                            None => {
                                if !self.options.speculate {
                                    self.park(idx);
                                    continue;
                                }
                                speculation = Some((
                                    queue_pos + 1,
                                    self.bag_at(idx, queue_pos + 1).possibilities(),
                                ));
                            }
                        }
                    }
                }
            }

            let bag = self.bag_at(idx, queue_pos);
            let node = &mut self.nodes[idx as usize];
            node.leased = true;
            return Some(ThinkJob {
                node: idx,
                epoch: self.epoch,
                board: node.board.clone(),
                hold: node.hold,
                b2b: node.b2b,
                combo: node.combo,
                queue_pos,
                upcoming,
                speculation,
                bag,
            });
        }
        None
    }

    /// Attaches a finished expansion and propagates values to the root.
    /// Results from before the last root change are silently dropped.
    pub fn apply(&mut self, job: &ThinkJob, result: ThinkResult) {
        if job.epoch != self.epoch {
            return;
        }
        let idx = job.node;
        self.nodes[idx as usize].leased = false;

        // a reveal may have raced past the speculated position while the
        // expansion ran off-lock; accepting the result would park a chance
        // node on a position no future reveal resolves. Leave the leaf on
        // the frontier so it re-expands with the piece known.
        if let ThinkResult::Speculated(pos, _) = &result {
            if *pos < self.known_end() {
                self.push_frontier(idx);
                return;
            }
        }
        self.expansions += 1;

        match result {
            ThinkResult::Children(children) => {
                if children.is_empty() {
                    self.nodes[idx as usize].dead = true;
                } else {
                    let ids = self.insert_children(idx, children, None);
                    self.nodes[idx as usize].children = ChildSet::Decision(ids);
                }
            }
            ThinkResult::Speculated(pos, groups) => {
                if groups.iter().all(|(_, group)| group.is_empty()) {
                    self.nodes[idx as usize].dead = true;
                } else {
                    let groups = groups
                        .into_iter()
                        .map(|(piece, group)| {
                            (piece, self.insert_children(idx, group, Some((pos, piece))))
                        })
                        .collect();
                    self.nodes[idx as usize].children = ChildSet::Chance { pos, groups };
                }
            }
        }
        self.backprop(idx);
    }

    fn insert_children(
        &mut self,
        parent: u32,
        children: Vec<ChildData>,
        assumption: Option<(u32, PieceKind)>,
    ) -> Vec<u32> {
        let parent_depth = self.nodes[parent as usize].depth;
        let parent_speculated = self.nodes[parent as usize].speculated.clone();
        children
            .into_iter()
            .enumerate()
            .map(|(rank, child)| {
                let mut speculated = parent_speculated.clone();
                if let Some(extra) = assumption {
                    speculated.push(extra);
                }
                let id = self.nodes.len() as u32;
                self.nodes.push(Node {
                    board: child.board,
                    hold: child.hold,
                    b2b: child.lock.b2b,
                    combo: child.lock.combo,
                    queue_pos: child.queue_pos,
                    speculated,
                    placement: Some(child.placement),
                    lock: child.lock,
                    hold_used: child.hold_used,
                    parent: Some(parent),
                    eval: child.eval,
                    value: child.eval as i64,
                    reward: child.reward,
                    depth: parent_depth + 1,
                    original_rank: rank as u32,
                    children: ChildSet::Unexpanded,
                    leased: false,
                    parked: false,
                    dead: false,
                });
                self.push_frontier(id);
                id
            })
            .collect()
    }

    fn backprop(&mut self, from: u32) {
        let mut cur = Some(from);
        while let Some(idx) = cur {
            let (value, dead) = self.recompute(idx);
            let node = &mut self.nodes[idx as usize];
            if node.value == value && node.dead == dead {
                break;
            }
            node.value = value;
            node.dead = node.dead || dead;
            cur = node.parent;
        }
    }

    /// Backed-up value: max of (reward + value) over live children for
    /// decision nodes, mean over piece groups for chance nodes.
    fn recompute(&self, idx: u32) -> (i64, bool) {
        let node = &self.nodes[idx as usize];
        let best_of = |children: &[u32]| {
            children
                .iter()
                .map(|&c| &self.nodes[c as usize])
                .filter(|c| !c.dead)
                .map(|c| c.reward as i64 + c.value)
                .max()
        };
        match &node.children {
            ChildSet::Unexpanded => (node.value, node.dead),
            ChildSet::Decision(children) => match best_of(children) {
                Some(value) => (value, false),
                None => (DEATH_VALUE, true),
            },
            ChildSet::Chance { groups, .. } => {
                let mut sum = 0;
                let mut alive = false;
                for (_, group) in groups {
                    match best_of(group) {
                        Some(value) => {
                            sum += value;
                            alive = true;
                        }
                        None => sum += DEATH_VALUE,
                    }
                }
                if alive {
                    (sum / groups.len() as i64, false)
                } else {
                    (DEATH_VALUE, true)
                }
            }
        }
    }

    /// Appends a revealed piece: updates queue and bag, resolves every
    /// chance node speculating this position, and wakes parked leaves.
    pub fn add_piece(&mut self, piece: PieceKind) {
        self.state.add_piece(piece);
        let pos = self.known_end() - 1;

        for idx in 0..self.nodes.len() as u32 {
            let matches = matches!(
                &self.nodes[idx as usize].children,
                ChildSet::Chance { pos: p, .. } if *p == pos
            );
            if !matches {
                continue;
            }
            let children =
                std::mem::replace(&mut self.nodes[idx as usize].children, ChildSet::Unexpanded);
            let ChildSet::Chance { groups, .. } = children else {
                unreachable!()
            };
            let mut kept = Vec::new();
            for (kind, group) in groups {
                if kind == piece {
                    kept = group;
                } else {
                    for child in group {
                        self.kill_subtree(child);
                    }
                }
            }
            if kept.is_empty() {
                // either the reveal was never speculated (bag mismatch) or
                // its group was empty; re-expanding settles both honestly
                self.nodes[idx as usize].children = ChildSet::Unexpanded;
                self.push_frontier(idx);
            } else {
                self.nodes[idx as usize].children = ChildSet::Decision(kept);
            }
            self.backprop(idx);
        }

        for idx in 0..self.nodes.len() as u32 {
            let node = &mut self.nodes[idx as usize];
            if node.parked && !node.dead {
                node.parked = false;
                self.push_frontier(idx);
            }
        }
    }

    fn kill_subtree(&mut self, root: u32) {
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            let node = &mut self.nodes[idx as usize];
            node.dead = true;
            match std::mem::replace(&mut node.children, ChildSet::Decision(Vec::new())) {
                ChildSet::Unexpanded => {}
                ChildSet::Decision(children) => stack.extend(children),
                ChildSet::Chance { groups, .. } => {
                    for (_, group) in groups {
                        stack.extend(group);
                    }
                }
            }
        }
    }

    /// The root moves up for commitment, or None while the choice cannot
    /// be made yet. A root speculating on the hold-swap piece offers its
    /// no-hold moves scored by their mean over the piece groups; a root
    /// speculating on the current piece offers nothing.
    pub fn root_candidates(&self) -> Option<Vec<Candidate>> {
        let root = &self.nodes[self.root as usize];
        if root.dead {
            return None;
        }
        match &root.children {
            ChildSet::Unexpanded => None,
            ChildSet::Decision(children) => {
                let candidates: Vec<_> = children
                    .iter()
                    .map(|&c| (c, &self.nodes[c as usize]))
                    .filter(|(_, n)| !n.dead)
                    .map(|(c, n)| self.candidate(c, n, n.reward as i64 + n.value))
                    .collect();
                (!candidates.is_empty()).then_some(candidates)
            }
            ChildSet::Chance { pos, groups } if *pos == root.queue_pos + 1 => {
                let mut table: HashMap<([(i8, i8); 4], SpinKind), (u32, i64, i64)> = HashMap::new();
                for (_, group) in groups {
                    for &c in group {
                        let n = &self.nodes[c as usize];
                        if n.dead || n.hold_used {
                            continue;
                        }
                        let placement = n.placement.expect("children carry placements");
                        let key = (placement.cell_key(), placement.spin);
                        let entry = table.entry(key).or_insert((c, 0, 0));
                        entry.1 += n.reward as i64 + n.value;
                        entry.2 += 1;
                    }
                }
                let candidates: Vec<_> = table
                    .into_values()
                    .map(|(c, sum, count)| {
                        self.candidate(c, &self.nodes[c as usize], sum / count)
                    })
                    .collect();
                (!candidates.is_empty()).then_some(candidates)
            }
            ChildSet::Chance { .. } => None,
        }
    }

    fn candidate(&self, id: u32, node: &Node, score: i64) -> Candidate {
        Candidate {
            node: id,
            score,
            height: node.board.heights().iter().copied().max().unwrap_or(0),
            lines_cleared: node.lock.lines_cleared,
            original_rank: node.original_rank,
        }
    }

    /// Commits a chosen candidate: builds the move (recomputing its input
    /// path on the root board) and the diagnostics, then advances the root.
    pub fn commit(&mut self, choice: u32) -> (Move, Info) {
        let chosen = &self.nodes[choice as usize];
        let placement = chosen.placement.expect("committed child has a placement");
        let spawned = self
            .options
            .spawn_rule
            .spawn(placement.pos.kind, &self.state.board)
            .expect("spawn succeeded when the child was generated");
        let inputs = find_moves(&self.state.board, spawned, self.options.mode)
            .into_iter()
            .find(|p| {
                p.piece.cell_key() == placement.cell_key() && p.piece.spin == placement.spin
            })
            .expect("committed placement is reachable on the root board")
            .inputs;

        let mv = Move {
            hold: chosen.hold_used,
            inputs,
            expected: placement,
        };
        let plan = self.plan_from(choice);
        let info = Info {
            nodes: self.node_count(),
            depth: plan.len() as u32,
            original_rank: chosen.original_rank,
            plan,
        };
        self.advance(choice);
        (mv, info)
    }

    fn plan_from(&self, choice: u32) -> Vec<PlanStep> {
        let mut plan = Vec::new();
        let mut cur = choice;
        loop {
            let node = &self.nodes[cur as usize];
            let placement = node.placement.expect("plan nodes carry placements");
            plan.push(PlanStep {
                kind: placement.pos.kind,
                spin: placement.spin,
                cells: placement.cells(),
                cleared: node.lock.cleared.clone(),
            });
            if plan.len() >= MAX_PLAN {
                break;
            }
            let ChildSet::Decision(children) = &node.children else {
                break;
            };
            let best = children
                .iter()
                .copied()
                .filter(|&c| !self.nodes[c as usize].dead)
                .max_by_key(|&c| {
                    let n = &self.nodes[c as usize];
                    (n.reward as i64 + n.value, Reverse(n.original_rank))
                });
            match best {
                Some(next) => cur = next,
                None => break,
            }
        }
        plan
    }

    fn advance(&mut self, choice: u32) {
        let consumed = self.nodes[choice as usize].queue_pos - self.nodes[self.root as usize].queue_pos;
        {
            let chosen = &self.nodes[choice as usize];
            self.state.board = chosen.board.clone();
            self.state.b2b = chosen.b2b;
            self.state.combo = chosen.combo;
            self.state.hold = chosen.hold;
        }
        for _ in 0..consumed {
            self.state.queue.pop_front();
        }
        self.pieces += consumed;
        self.epoch += 1;

        let direct = matches!(
            &self.nodes[self.root as usize].children,
            ChildSet::Decision(children) if children.contains(&choice)
        );
        if direct {
            self.compact(choice);
        } else {
            // committed out of a speculated hold-swap: the retained subtree
            // would carry an assumption, so restart from the live state
            self.rebuild_root();
        }
    }

    /// Barrier reset: replace the field and scoring, keep queue and hold,
    /// and drop the whole tree.
    pub fn reset(&mut self, field: &[[bool; 10]; 40], b2b: bool, combo: u32) {
        self.state.board = BitBoard::from_rows(field);
        self.state.b2b = b2b;
        self.state.combo = combo as i32 - 1;
        self.epoch += 1;
        self.rebuild_root();
    }

    fn rebuild_root(&mut self) {
        self.nodes.clear();
        let root = self.fresh_root();
        self.nodes.push(root);
        self.root = 0;
        self.frontier.clear();
        self.push_frontier(0);
    }

    /// Keeps exactly the chosen child's subtree, remapping arena handles.
    fn compact(&mut self, new_root: u32) {
        const UNMAPPED: u32 = u32::MAX;
        let mut remap = vec![UNMAPPED; self.nodes.len()];
        let mut order = vec![new_root];
        remap[new_root as usize] = 0;
        let mut cursor = 0;
        while cursor < order.len() {
            let idx = order[cursor];
            cursor += 1;
            let mut visit = |c: u32, remap: &mut Vec<u32>, order: &mut Vec<u32>| {
                if remap[c as usize] == UNMAPPED {
                    remap[c as usize] = order.len() as u32;
                    order.push(c);
                }
            };
            match &self.nodes[idx as usize].children {
                ChildSet::Unexpanded => {}
                ChildSet::Decision(children) => {
                    for &c in children {
                        visit(c, &mut remap, &mut order);
                    }
                }
                ChildSet::Chance { groups, .. } => {
                    for (_, group) in groups {
                        for &c in group {
                            visit(c, &mut remap, &mut order);
                        }
                    }
                }
            }
        }

        let mut old: Vec<Option<Node>> = std::mem::take(&mut self.nodes)
            .into_iter()
            .map(Some)
            .collect();
        self.nodes = order
            .iter()
            .map(|&i| old[i as usize].take().expect("each node retained once"))
            .collect();

        for node in &mut self.nodes {
            node.parent = node.parent.map(|p| remap[p as usize]);
            node.leased = false;
            match &mut node.children {
                ChildSet::Unexpanded => {}
                ChildSet::Decision(children) => {
                    for c in children {
                        *c = remap[*c as usize];
                    }
                }
                ChildSet::Chance { groups, .. } => {
                    for (_, group) in groups {
                        for c in group {
                            *c = remap[*c as usize];
                        }
                    }
                }
            }
        }
        self.nodes[0].parent = None;
        self.root = 0;

        self.frontier.clear();
        for idx in 0..self.nodes.len() as u32 {
            let node = &self.nodes[idx as usize];
            if matches!(node.children, ChildSet::Unexpanded) && !node.dead && !node.parked {
                self.push_frontier(idx);
            }
        }
    }
}

/// Expands a leased leaf into its complete child set. Runs without the
/// tree lock; the result is attached under the lock by `apply`.
pub(crate) fn think(job: &ThinkJob, options: &Options, eval: &dyn Evaluator) -> ThinkResult {
    match job.speculation {
        None => ThinkResult::Children(make_children(job, &job.upcoming, None, options, eval)),
        Some((pos, possibilities)) => {
            let groups = possibilities
                .iter()
                .map(|piece| {
                    let mut pieces: SmallVec<[PieceKind; 3]> =
                        job.upcoming.iter().copied().collect();
                    pieces.push(piece);
                    (piece, make_children(job, &pieces, Some(piece), options, eval))
                })
                .collect();
            ThinkResult::Speculated(pos, groups)
        }
    }
}

fn make_children(
    job: &ThinkJob,
    pieces: &[PieceKind],
    assumed: Option<PieceKind>,
    options: &Options,
    eval: &dyn Evaluator,
) -> Vec<ChildData> {
    let mut children = Vec::new();
    let next = pieces[0];

    if let Some(spawned) = options.spawn_rule.spawn(next, &job.board) {
        add_placements(
            &mut children,
            job,
            spawned,
            false,
            job.hold,
            job.queue_pos + 1,
            assumed,
            options,
            eval,
        );
    }

    if options.use_hold {
        let (swap, consumed) = match job.hold {
            Some(held) => (held, 1),
            None => (pieces[1], 2),
        };
        if swap != next {
            if let Some(spawned) = options.spawn_rule.spawn(swap, &job.board) {
                add_placements(
                    &mut children,
                    job,
                    spawned,
                    true,
                    Some(next),
                    job.queue_pos + consumed,
                    assumed,
                    options,
                    eval,
                );
            }
        }
    }

    children.sort_by_key(|c| -(c.reward as i64 + c.eval as i64));
    children
}

#[allow(clippy::too_many_arguments)]
fn add_placements(
    out: &mut Vec<ChildData>,
    job: &ThinkJob,
    spawned: PieceState,
    hold_used: bool,
    child_hold: Option<PieceKind>,
    child_queue_pos: u32,
    assumed: Option<PieceKind>,
    options: &Options,
    eval: &dyn Evaluator,
) {
    let low_board = job.board.heights().iter().all(|&h| h < 18);
    let mut bag = job.bag;
    if let Some(piece) = assumed {
        bag.take(piece);
    }

    for placement in find_moves(&job.board, spawned, options.mode) {
        let piece = placement.piece;
        let mut board = job.board.clone();
        let lock = board.lock_piece(piece, job.b2b, job.combo);
        if lock.lock_out {
            continue;
        }
        // a mini that could simply have been dropped clears nothing and
        // buries a hole
        if low_board
            && lock.spin == SpinKind::Mini
            && lock.lines_cleared == 0
            && job.board.above_stack(&piece)
        {
            continue;
        }
        let move_time = placement.inputs.len() as u32 + hold_used as u32;
        let (value, reward) = eval.evaluate(
            &lock,
            &board,
            &EvalContext {
                bag,
                hold: child_hold,
                move_time,
                placed: spawned.pos.kind,
            },
        );
        out.push(ChildData {
            placement: piece,
            hold_used,
            board,
            hold: child_hold,
            queue_pos: child_queue_pos,
            lock,
            eval: value,
            reward,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::eval::Standard;
    use crate::PcPriority;

    fn options() -> Options {
        Options {
            use_hold: false,
            speculate: false,
            ..Options::default()
        }
    }

    fn tree_with(queue: &[PieceKind], options: Options) -> SearchTree {
        let mut state = GameState::new();
        for &piece in queue {
            state.add_piece(piece);
        }
        SearchTree::new(state, options)
    }

    fn expand_once(tree: &mut SearchTree, options: &Options) -> bool {
        let eval = Standard::default();
        match tree.lease() {
            Some(job) => {
                let result = think(&job, options, &eval);
                tree.apply(&job, result);
                true
            }
            None => false,
        }
    }

    #[test]
    fn expansion_yields_all_placements() {
        let opts = options();
        let mut tree = tree_with(&[PieceKind::T], opts);
        assert!(expand_once(&mut tree, &opts));
        let candidates = tree.root_candidates().unwrap();
        assert_eq!(candidates.len(), 34);
        assert_eq!(tree.node_count(), 35);
    }

    #[test]
    fn hold_branch_doubles_the_choices() {
        let opts = Options {
            speculate: false,
            ..Options::default()
        };
        let mut tree = tree_with(&[PieceKind::T, PieceKind::I], opts);
        assert!(expand_once(&mut tree, &opts));
        let candidates = tree.root_candidates().unwrap();
        // 34 T placements plus 17 I placements via hold
        assert_eq!(candidates.len(), 51);
    }

    #[test]
    fn unknown_piece_without_speculation_parks() {
        let opts = options();
        let mut tree = tree_with(&[], opts);
        assert!(!expand_once(&mut tree, &opts), "no job until a piece is known");
        assert!(tree.root_candidates().is_none());

        tree.add_piece(PieceKind::O);
        assert!(expand_once(&mut tree, &opts));
        assert_eq!(tree.root_candidates().unwrap().len(), 9);
    }

    #[test]
    fn speculation_covers_the_bag_remainder() {
        let opts = Options {
            use_hold: false,
            speculate: true,
            ..Options::default()
        };
        let mut state = GameState::new();
        state.add_piece(PieceKind::I);
        state.add_piece(PieceKind::S);
        let mut tree = SearchTree::new(state, opts);

        assert!(expand_once(&mut tree, &opts)); // root: known I
        // committing I leaves queue [S]; expand the best child next
        let candidates = tree.root_candidates().unwrap();
        let eval = Standard::default();
        let pick = eval.pick_move(&candidates, 0);
        tree.commit(candidates[pick].node);

        assert!(expand_once(&mut tree, &opts)); // known S
        let candidates = tree.root_candidates().unwrap();
        let pick = eval.pick_move(&candidates, 0);
        tree.commit(candidates[pick].node);

        // now the queue is exhausted: the next expansion speculates over
        // the five pieces left in the bag
        assert!(expand_once(&mut tree, &opts));
        let root = &tree.nodes[tree.root as usize];
        match &root.children {
            ChildSet::Chance { pos, groups } => {
                assert_eq!(*pos, 2);
                assert_eq!(groups.len(), 5);
                let kinds: EnumSet<PieceKind> = groups.iter().map(|&(k, _)| k).collect();
                assert!(!kinds.contains(PieceKind::I));
                assert!(!kinds.contains(PieceKind::S));
            }
            _ => panic!("expected a chance node"),
        }

        // revealing a piece prunes the other groups
        tree.add_piece(PieceKind::Z);
        let root = &tree.nodes[tree.root as usize];
        match &root.children {
            ChildSet::Decision(children) => {
                assert!(!children.is_empty());
                assert!(children
                    .iter()
                    .all(|&c| tree.nodes[c as usize].placement.unwrap().pos.kind == PieceKind::Z));
            }
            _ => panic!("speculation should have resolved"),
        }
    }

    #[test]
    fn reveal_racing_a_speculative_expansion_discards_it() {
        let opts = Options {
            use_hold: false,
            speculate: true,
            ..Options::default()
        };
        let mut tree = tree_with(&[], opts);
        let eval = Standard::default();

        // a worker leases the root and speculates over the whole bag...
        let job = tree.lease().expect("speculative job");
        let result = think(&job, &opts, &eval);
        // ...but the next piece arrives before the result is attached
        tree.add_piece(PieceKind::T);
        tree.apply(&job, result);

        // the stale chance expansion was dropped, not installed
        assert!(matches!(
            tree.nodes[tree.root as usize].children,
            ChildSet::Unexpanded
        ));
        // and the leaf went back to the frontier to expand with T known
        assert!(expand_once(&mut tree, &opts));
        assert_eq!(tree.root_candidates().unwrap().len(), 34);
    }

    #[test]
    fn dead_when_nothing_fits() {
        // walls up to row 21 with a one-wide shaft no piece fits into
        let mut state = GameState::new();
        for x in 1..10 {
            state.board.cols[x] = (1 << 21) - 1;
        }
        state.add_piece(PieceKind::O);
        let opts = options();
        let mut tree = SearchTree::new(state, opts);
        assert!(expand_once(&mut tree, &opts));
        assert!(tree.is_dead());
        assert!(tree.root_candidates().is_none());
    }

    #[test]
    fn commit_advances_the_root_state() {
        let opts = options();
        let mut tree = tree_with(&[PieceKind::O, PieceKind::I], opts);
        assert!(expand_once(&mut tree, &opts));
        let candidates = tree.root_candidates().unwrap();
        let eval = Standard::default();
        let choice = candidates[eval.pick_move(&candidates, 0)].node;
        let expected_board = tree.nodes[choice as usize].board.clone();

        let (mv, info) = tree.commit(choice);
        assert!(!mv.hold);
        assert!(mv.inputs.len() <= 32);
        assert!(info.nodes > 1);
        assert_eq!(tree.state.board, expected_board);
        assert_eq!(tree.state.queue.len(), 1);
        assert_eq!(tree.pieces, 1);
        // the retained subtree is just the new root here
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn backed_up_values_flow_to_the_root() {
        let opts = options();
        let mut tree = tree_with(&[PieceKind::I, PieceKind::I], opts);
        // expand the root, then a few frontier leaves; the root's value
        // must track the best (reward + value) among its children
        for _ in 0..6 {
            assert!(expand_once(&mut tree, &opts));
        }
        let root = &tree.nodes[tree.root as usize];
        let ChildSet::Decision(children) = &root.children else {
            panic!()
        };
        let best = children
            .iter()
            .map(|&c| &tree.nodes[c as usize])
            .filter(|n| !n.dead)
            .map(|n| n.reward as i64 + n.value)
            .max()
            .unwrap();
        assert_eq!(root.value, best);
    }

    #[test]
    fn pcloop_options_parse() {
        let opts: Options = serde_json::from_str(
            r#"{ "mode": "hard_drop_only", "spawn_rule": "row_21_and_fall", "pcloop": "fastest" }"#,
        )
        .unwrap();
        assert_eq!(opts.mode, game::tetris::movegen::MovementMode::HardDropOnly);
        assert_eq!(opts.spawn_rule, game::tetris::SpawnRule::Row21AndFall);
        assert_eq!(opts.pcloop, Some(PcPriority::Fastest));
        assert!(opts.use_hold, "defaults fill the rest");
    }
}
