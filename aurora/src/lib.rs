//! Aurora: an asynchronous best-first search bot for guideline Tetris.
//!
//! The bot owns a search tree behind a coarse lock. Client commands mutate
//! it directly; one or more worker threads repeatedly lease the most
//! promising frontier leaf, expand it off-lock (move generation plus
//! evaluation), and attach the result. A requested move is answered as
//! soon as the root has a committable child and the node minimum is met;
//! answering advances the root and reclaims the rest of the tree.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use arrayvec::ArrayVec;
use enumset::EnumSet;
use game::tetris::movegen::{InputList, MovementMode};
use game::tetris::{BitBoard, GameState, PieceKind, PieceState, SevenBag, SpawnRule, SpinKind};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

pub mod eval;
mod tree;

use eval::{Evaluator, Standard};
use tree::SearchTree;

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub mode: MovementMode,
    pub spawn_rule: SpawnRule,
    pub use_hold: bool,
    pub speculate: bool,
    pub pcloop: Option<PcPriority>,
    /// Expansions required in the current tree before a move is answered.
    pub min_nodes: u32,
    /// Lifetime cap on expansions.
    pub max_nodes: u32,
    pub threads: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            mode: MovementMode::ZeroG,
            spawn_rule: SpawnRule::Row19Or20,
            use_hold: true,
            speculate: true,
            pcloop: None,
            min_nodes: 0,
            max_nodes: 4_000_000_000,
            threads: 1,
        }
    }
}

/// What a perfect-clear-hunting configuration should optimize for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcPriority {
    Fastest,
    #[serde(rename = "attack")]
    HighestAttack,
}

/// A committed move: final placement, hold toggle, and a replayable input
/// path from the spawn state.
#[derive(Clone, Debug)]
pub struct Move {
    pub hold: bool,
    pub inputs: InputList,
    pub expected: PieceState,
}

#[derive(Clone, Debug)]
pub struct Info {
    pub nodes: u32,
    pub depth: u32,
    /// Rank of the committed move among the root's children when they
    /// were generated.
    pub original_rank: u32,
    /// Principal variation from the committed move onwards.
    pub plan: Vec<PlanStep>,
}

#[derive(Clone, Debug)]
pub struct PlanStep {
    pub kind: PieceKind,
    pub spin: SpinKind,
    pub cells: [(i8, i8); 4],
    /// Rows the placement clears, bottom-up.
    pub cleared: ArrayVec<i32, 4>,
}

#[derive(Debug)]
pub enum Poll {
    Provided(Move, Info),
    Waiting,
    Dead,
}

/// Handle to a running bot. Dropping it shuts the worker threads down and
/// releases the tree.
pub struct AuroraBot {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

struct Shared {
    sync: Mutex<BotSync>,
    work: Condvar,
    results: Condvar,
    eval: Box<dyn Evaluator>,
    options: Options,
}

struct BotSync {
    tree: SearchTree,
    pending: Option<u32>,
    answers: VecDeque<(Move, Info)>,
    dead: bool,
    shutdown: bool,
}

impl AuroraBot {
    /// Launches worker threads over an empty board, empty queue and a
    /// full bag.
    pub fn launch(options: Options, weights: Standard) -> Self {
        Self::launch_from(GameState::new(), options, weights)
    }

    /// As `launch`, but starting mid-game from a supplied field, bag
    /// remainder, hold piece and scoring state. `combo` is the
    /// client-visible consecutive-clear count.
    pub fn launch_with_board(
        options: Options,
        weights: Standard,
        field: &[[bool; 10]; 40],
        bag: EnumSet<PieceKind>,
        hold: Option<PieceKind>,
        b2b: bool,
        combo: u32,
    ) -> Self {
        // a full mask is the same bag state as the internal empty set
        let bag = if bag == EnumSet::all() {
            EnumSet::empty()
        } else {
            bag
        };
        let state = GameState {
            board: BitBoard::from_rows(field),
            hold,
            queue: VecDeque::new(),
            bag: SevenBag(bag),
            b2b,
            combo: combo as i32 - 1,
        };
        Self::launch_from(state, options, weights)
    }

    fn launch_from(state: GameState, options: Options, mut weights: Standard) -> Self {
        if let Some(priority) = options.pcloop {
            weights.bias_for_pc(priority);
        }
        let shared = Arc::new(Shared {
            sync: Mutex::new(BotSync {
                tree: SearchTree::new(state, options),
                pending: None,
                answers: VecDeque::new(),
                dead: false,
                shutdown: false,
            }),
            work: Condvar::new(),
            results: Condvar::new(),
            eval: Box::new(weights),
            options,
        });
        let workers = (0..options.threads.max(1))
            .map(|index| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("aurora-worker-{index}"))
                    .spawn(move || worker(&shared, index))
                    .expect("worker thread")
            })
            .collect();
        AuroraBot { shared, workers }
    }

    /// Appends one known upcoming piece. Under speculation the piece is
    /// expected to be in the bag; a mismatch refills the bag first.
    pub fn add_next_piece(&self, piece: PieceKind) {
        let mut sync = self.shared.sync.lock();
        if sync.dead {
            return;
        }
        sync.tree.add_piece(piece);
        self.shared.refresh(&mut sync);
        self.shared.work.notify_all();
    }

    /// Asks for a move to be committed as soon as the gating conditions
    /// allow. At most one request is outstanding; a newer one replaces an
    /// unanswered older one.
    pub fn request_next_move(&self, incoming: u32) {
        let mut sync = self.shared.sync.lock();
        if sync.dead {
            return;
        }
        sync.pending = Some(incoming);
        self.shared.refresh(&mut sync);
        self.shared.work.notify_all();
    }

    pub fn poll_next_move(&self) -> Poll {
        let mut sync = self.shared.sync.lock();
        if let Some((mv, info)) = sync.answers.pop_front() {
            return Poll::Provided(mv, info);
        }
        if sync.dead {
            Poll::Dead
        } else {
            Poll::Waiting
        }
    }

    /// Waits for the requested move; None means the bot is dead.
    pub fn block_next_move(&self) -> Option<(Move, Info)> {
        let mut sync = self.shared.sync.lock();
        loop {
            if let Some(answer) = sync.answers.pop_front() {
                return Some(answer);
            }
            if sync.dead {
                return None;
            }
            self.shared.results.wait(&mut sync);
        }
    }

    /// Barrier reset: replaces the field and scoring state, keeps the
    /// queue and hold, and discards the pending request along with any
    /// undelivered answer. `combo` is the client-visible count.
    pub fn reset(&self, field: &[[bool; 10]; 40], b2b: bool, combo: u32) {
        let mut sync = self.shared.sync.lock();
        if sync.dead {
            return;
        }
        sync.tree.reset(field, b2b, combo);
        sync.pending = None;
        sync.answers.clear();
        self.shared.work.notify_all();
    }

    pub fn is_dead(&self) -> bool {
        self.shared.sync.lock().dead
    }
}

impl Drop for AuroraBot {
    fn drop(&mut self) {
        {
            let mut sync = self.shared.sync.lock();
            sync.shutdown = true;
        }
        self.shared.work.notify_all();
        self.shared.results.notify_all();
        for handle in self.workers.drain(..) {
            handle.join().ok();
        }
    }
}

impl Shared {
    /// After any tree mutation: surface death, or answer the pending
    /// request once the root has a committable child and the node minimum
    /// is met.
    fn refresh(&self, sync: &mut BotSync) {
        if sync.dead {
            return;
        }
        if sync.tree.is_dead() {
            sync.dead = true;
            self.results.notify_all();
            return;
        }
        let Some(incoming) = sync.pending else { return };
        if !sync.tree.min_reached(self.options.min_nodes) {
            return;
        }
        let Some(candidates) = sync.tree.root_candidates() else {
            return;
        };
        let choice = self.eval.pick_move(&candidates, incoming);
        let answer = sync.tree.commit(candidates[choice].node);
        sync.pending = None;
        sync.answers.push_back(answer);
        self.results.notify_all();
        // the root moved; the frontier was rebuilt under it
        self.work.notify_all();
    }
}

fn worker(shared: &Shared, index: u32) {
    eprintln!("aurora: worker {index} up");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| work_loop(shared)));
    if outcome.is_err() {
        let mut sync = shared.sync.lock();
        sync.dead = true;
        shared.results.notify_all();
        shared.work.notify_all();
        eprintln!("aurora: worker {index} panicked; bot is dead");
    }
}

fn work_loop(shared: &Shared) {
    loop {
        let job = {
            let mut sync = shared.sync.lock();
            loop {
                if sync.shutdown {
                    return;
                }
                if sync.dead || sync.tree.at_node_limit() {
                    shared.work.wait(&mut sync);
                    continue;
                }
                match sync.tree.lease() {
                    Some(job) => break job,
                    None => shared.work.wait(&mut sync),
                }
            }
        };

        let result = tree::think(&job, &shared.options, &*shared.eval);

        let mut sync = shared.sync.lock();
        if sync.shutdown {
            return;
        }
        sync.tree.apply(&job, result);
        shared.refresh(&mut sync);
        shared.work.notify_all();
    }
}
