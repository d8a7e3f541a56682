//! The search driver: propagation over the sequent store, decisions by
//! per-block activity order, restarts, and learnt-sequent management.
//!
//! A sequent "fires" when every Lnow literal is satisfied (a conflict for
//! the engine, a win for the sequent's player) or when exactly one Lnow
//! literal is unassigned and the rest are satisfied (forcing the negation
//! of that literal). Firing is gated by the reserved literals: a sequent
//! with a falsified Lfut literal is blocked, and a forced literal must not
//! be ordered inner to an unresolved Lfut literal.

use std::collections::{HashMap, HashSet};
use std::collections::VecDeque;
use std::io::Write;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::analyze::Strategy;
use crate::circuit::{Circuit, GateId};
use crate::error::{Result, SolverError};
use crate::fmla::{FmlaRef, Fmlas};
use crate::heap::ActivityHeap;
use crate::lit::{Lit, Ply, Var};
use crate::prefix::QType;
use crate::sequent::{SeqId, SequentDb};
use crate::trail::Trail;

pub const NUM_PATHS: usize = 2;

#[derive(Debug, Clone)]
pub struct SolverOpts {
    pub seed: i32,
    pub allow_free: bool,
    pub allow_cegar: bool,
    pub use_monotone: bool,
    pub timeout: Option<Duration>,
    pub no_restart: bool,
    pub restart_cycle: i32,
    pub strat_enabled: bool,
    /// Pin the pseudo-random choices for regression runs.
    pub var_ord_fix: bool,
}

impl Default for SolverOpts {
    fn default() -> Self {
        SolverOpts {
            seed: 1,
            allow_free: false,
            allow_cegar: false,
            use_monotone: true,
            timeout: None,
            no_restart: false,
            restart_cycle: 100,
            strat_enabled: false,
            var_ord_fix: false,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub conflicts: u64,
    pub decisions: u64,
    pub rnd_decisions: u64,
    pub propagations: u64,
    pub watch_fixes: u64,
    pub restarts: u64,
    pub cegar_learns: u64,
    pub lfut_reductions: u64,
    pub max_learnts: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    True,
    False,
    Free(FmlaRef),
}

/// One-shot warning flags.
#[derive(Debug, Default)]
pub(crate) struct Warned {
    pub exec_in_conflict: bool,
    pub non_constant_force: bool,
    pub cegar_seed_clash: bool,
    pub cegar_opponent_won: bool,
    pub cegar_true_out: bool,
    pub cegar_failed: bool,
    pub out_of_vars: bool,
    pub redundant_gate: bool,
}

pub struct Solver {
    pub fmlas: Fmlas,
    pub ckt: Circuit,
    pub db: SequentDb,
    pub trail: Trail,

    pub(crate) conflict: Option<SeqId>,
    pub(crate) free_fmla: Option<FmlaRef>,
    pub(crate) lits_in_conflict: HashSet<Lit>,

    pending: VecDeque<Lit>,
    pending_set: Vec<bool>,

    pub(crate) var_act: Vec<f64>,
    pub(crate) var_inc: f64,
    pub(crate) cla_inc: f64,
    order: Vec<ActivityHeap>,
    pol_pref: Vec<Vec<bool>>,
    pub(crate) cur_path: usize,
    pub(crate) cur_path_mask: u32,

    /// Propagation floor used while CEGAR re-derives under a partial
    /// assignment: literals outer to this block are not forced.
    pub(crate) min_prop_qb: u16,
    pub(crate) in_cegar: bool,
    pub(crate) temp_new_seqs: Vec<SeqId>,
    pub(crate) ceg_lrn_set: HashSet<Vec<Lit>>,
    pub(crate) args_to_gate: HashMap<Vec<Lit>, Lit>,
    pub(crate) no_more_vars: bool,
    pub(crate) warned: Warned,

    pub(crate) max_learnts: f64,
    learntsize_adjust_confl: f64,
    learntsize_adjust_cnt: i32,

    num_until_restart: i32,
    restart_cycle: i32,
    init_choices: Vec<Lit>,
    ix_choi: usize,

    pub(crate) strats: HashMap<SeqId, Strategy>,
    pub(crate) prf_log: Option<Box<dyn Write>>,

    rng: f64,
    pub opts: SolverOpts,
    pub stats: Stats,
    pub(crate) num_big_bt: u64,
    pub(crate) num_resolves: u32,
    start: Instant,
    presolved: bool,
    pub(crate) num_orig_seqs: usize,
}

const LEARNTSIZE_FACTOR: f64 = 1.0 / 3.0;
const LEARNTSIZE_INC: f64 = 1.1;
const LEARNTSIZE_ADJUST_START: f64 = 100.0;
const LEARNTSIZE_ADJUST_INC: f64 = 1.5;

impl Solver {
    pub fn new(ckt: Circuit, fmlas: Fmlas, opts: SolverOpts) -> Solver {
        let num_lits = ckt.num_vars() as usize * 2;
        let mut s = Solver {
            fmlas,
            ckt,
            db: SequentDb::new(),
            trail: Trail::new(num_lits),
            conflict: None,
            free_fmla: None,
            lits_in_conflict: HashSet::new(),
            pending: VecDeque::new(),
            pending_set: vec![],
            var_act: vec![],
            var_inc: 1.0,
            cla_inc: 1.0,
            order: vec![],
            pol_pref: vec![vec![]; NUM_PATHS],
            cur_path: 0,
            cur_path_mask: 1,
            min_prop_qb: 0,
            in_cegar: false,
            temp_new_seqs: vec![],
            ceg_lrn_set: HashSet::new(),
            args_to_gate: HashMap::new(),
            no_more_vars: false,
            warned: Warned::default(),
            max_learnts: 0.0,
            learntsize_adjust_confl: LEARNTSIZE_ADJUST_START,
            learntsize_adjust_cnt: LEARNTSIZE_ADJUST_START as i32,
            num_until_restart: 2,
            restart_cycle: opts.restart_cycle,
            init_choices: vec![],
            ix_choi: 0,
            strats: HashMap::new(),
            prf_log: None,
            rng: if opts.seed == 0 { 91_648_253.0 } else { opts.seed as f64 },
            opts,
            stats: Stats::default(),
            num_big_bt: 0,
            num_resolves: 0,
            start: Instant::now(),
            presolved: false,
            num_orig_seqs: 0,
        };
        s.register_new_vars();
        for v in 1..s.ckt.num_vars() {
            s.insert_var_order(Var::from_idx(v));
        }
        s.install_gate_sequents();
        s.max_learnts = s.db.num_slots() as f64 * LEARNTSIZE_FACTOR;
        s.num_orig_seqs = s.db.num_slots();
        s
    }

    pub fn set_proof_log(&mut self, w: Box<dyn Write>) {
        self.prf_log = Some(w);
    }

    /// Injected decision preferences, consumed in order.
    pub fn inject_choices(&mut self, lits: Vec<Lit>) {
        self.init_choices = lits;
        self.ix_choi = 0;
    }

    // ------------------------------------------------------------------
    // Table growth

    pub(crate) fn register_new_vars(&mut self) {
        let nv = self.ckt.num_vars() as usize;
        let nl = nv * 2;
        self.var_act.resize(nv, 0.0);
        for p in &mut self.pol_pref {
            p.resize(nv, false);
        }
        self.pending_set.resize(nl, false);
        self.trail.ensure_lits(nl);
        self.db.ensure_lit_tables(nl);
        while self.order.len() < self.ckt.prefix.num_blocks() {
            self.order.push(ActivityHeap::new());
        }
    }

    pub(crate) fn insert_var_order(&mut self, v: Var) {
        let qb = self.ckt.qb.of_var(v);
        if qb != 0 {
            self.order[qb as usize].insert(v, &self.var_act);
        }
    }

    // ------------------------------------------------------------------
    // Random numbers (deterministic, seeded once)

    pub(crate) fn drand(&mut self) -> f64 {
        self.rng *= 1389796.0;
        let q = (self.rng / 2147483647.0) as i64;
        self.rng -= q as f64 * 2147483647.0;
        self.rng / 2147483647.0
    }

    pub(crate) fn irand(&mut self, n: usize) -> usize {
        (self.drand() * n as f64) as usize % n.max(1)
    }

    // ------------------------------------------------------------------
    // Activities

    pub(crate) fn bump_var_act(&mut self, v: Var) {
        self.var_act[v.idx() as usize] += self.var_inc;
        if self.var_act[v.idx() as usize] > 1e20 {
            self.cut_var_act();
        }
        let qb = self.ckt.qb.of_var(v) as usize;
        if qb != 0 && self.order[qb].in_heap(v) {
            self.order[qb].decrease(v, &self.var_act);
        }
    }

    fn cut_var_act(&mut self) {
        for a in &mut self.var_act {
            *a *= 1e-20;
        }
        self.var_inc *= 1e-20;
        if self.var_inc < 1e-30 {
            self.var_inc = 1e-30;
        }
    }

    pub(crate) fn bump_seq_act(&mut self, sid: SeqId) {
        let act = {
            let s = self.db.get_mut(sid);
            s.activity += self.cla_inc;
            s.activity
        };
        if act > 1e20 {
            self.db.scale_activities(1e-20);
            self.cla_inc *= 1e-20;
            if self.cla_inc < 1e-30 {
                self.cla_inc = 1e-30;
            }
        }
    }

    pub(crate) fn cla_decay_activity(&mut self) {
        self.cla_inc *= 1.003;
    }

    pub(crate) fn var_decay_activity(&mut self) {
        self.var_inc *= 1.05;
    }

    // ------------------------------------------------------------------
    // Antecedents and the in-use mask

    pub(crate) fn set_dep(&mut self, l: Lit, sid: SeqId) {
        let is_learned = {
            let s = self.db.get_mut(sid);
            debug_assert_eq!(s.in_use & self.cur_path_mask, 0);
            s.in_use |= self.cur_path_mask;
            s.is_learned
        };
        if is_learned {
            self.db.num_learnt_locked += 1;
        }
        self.trail.dep[l.idx() as usize] = Some(sid);
    }

    fn reset_dep(&mut self, l: Lit) {
        if let Some(sid) = self.trail.dep[l.idx() as usize].take() {
            let mask = self.cur_path_mask;
            let is_learned = {
                let s = self.db.get_mut(sid);
                debug_assert_ne!(s.in_use & mask, 0);
                s.in_use &= !mask;
                s.is_learned
            };
            if is_learned {
                self.db.num_learnt_locked -= 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // Pending propagation queue

    fn push_pending(&mut self, l: Lit) {
        self.pending.push_back(l);
        self.pending_set[l.idx() as usize] = true;
    }

    pub(crate) fn clear_pending(&mut self) {
        for l in self.pending.drain(..) {
            self.pending_set[l.idx() as usize] = false;
        }
    }

    // ------------------------------------------------------------------
    // Watched literals

    /// Re-picks the two required watches and the reserved watch from the
    /// current assignment: the two latest-assigned Lnow literals (unassigned
    /// counting as latest of all) and the latest Lfut literal.
    pub(crate) fn init_watches(&mut self, sid: SeqId) {
        let (req, imp): (Vec<Lit>, Vec<Lit>) = {
            let s = self.db.get(sid);
            (s.req_lits.to_vec(), s.imp_lits.to_vec())
        };
        let mut w = [Lit::UNDEF; 2];
        for &l in &req {
            if self.trail.dl_of(l) > self.trail.dl_of(w[0]) {
                w[1] = w[0];
                w[0] = l;
            } else if self.trail.dl_of(l) > self.trail.dl_of(w[1]) {
                w[1] = l;
            }
        }
        let mut res = Lit::UNDEF;
        if !imp.is_empty() {
            res = imp[0];
            for &l in &imp {
                if self.trail.dl_of(l) > self.trail.dl_of(res) {
                    res = l;
                }
            }
        }
        let s = self.db.get_mut(sid);
        s.watch_req = w;
        s.watch_res = res;
        debug_assert!(w[0] == Lit::UNDEF || w[0] != w[1]);
    }

    /// Moves the watch sitting on `old_lit` (which was just assigned).
    /// Returns true when the sequent turned out dead (other watch
    /// falsified).
    fn fix_one_watch(&mut self, sid: SeqId, old_lit: Lit) -> bool {
        let (i_old, other) = {
            let s = self.db.get(sid);
            if s.watch_req[0] == old_lit {
                (0, s.watch_req[1])
            } else if s.watch_req[1] == old_lit {
                (1, s.watch_req[0])
            } else {
                debug_assert_eq!(s.watch_res, old_lit);
                self.fix_watched_res(sid);
                return false;
            }
        };
        if self.trail.has_lit(!other) {
            return true;
        }
        self.stats.watch_fixes += 1;
        {
            let nbt = self.trail.num_step_bt;
            let s = self.db.get_mut(sid);
            s.num_fixes += 1;
            if s.wat_stop_bt < nbt {
                s.wat_stop_bt = nbt;
                s.wat_start_pos = 0;
            }
        }
        let (start, req) = {
            let s = self.db.get(sid);
            (s.wat_start_pos, s.req_lits.to_vec())
        };
        for ix in start..req.len() {
            let cur = req[ix];
            if !self.trail.has_lit(cur) && cur != other {
                self.db.move_req_watch(sid, i_old, cur);
                return false;
            }
        }
        // No replacement: keep the assigned watch, but make sure slot 0
        // holds the free literal if there is one.
        if i_old == 0 && !self.trail.has_lit(other) {
            let s = self.db.get_mut(sid);
            s.watch_req.swap(0, 1);
            s.it_watch_req.swap(0, 1);
        }
        false
    }

    /// Keeps the reserved watch pointing at an unassigned Lfut literal
    /// ordered outer to the pending trigger whenever the sequent is one
    /// literal from firing.
    pub(crate) fn fix_watched_res(&mut self, sid: SeqId) {
        let (w0, w1, imp, old_res) = {
            let s = self.db.get(sid);
            (s.watch_req[0], s.watch_req[1], s.imp_lits.to_vec(), s.watch_res)
        };
        if imp.is_empty() {
            return;
        }
        if self.trail.has_lit(w0) == self.trail.has_lit(w1) {
            return;
        }
        let last_trig = w0;
        let res = match imp.iter().find(|&&l| !self.trail.has_lit(l)) {
            Some(&l) => l,
            None => return,
        };
        if res != old_res && self.ckt.qb.of_lit(res) < self.ckt.qb.of_lit(last_trig) {
            self.db.move_res_watch(sid, res);
        }
    }

    /// Re-derives all three watches after an out-of-band assignment change.
    pub(crate) fn simp_fix_watch(&mut self, sid: SeqId) {
        let (w0, w1, n) = {
            let s = self.db.get(sid);
            (s.watch_req[0], s.watch_req[1], s.req_lits.len())
        };
        if n >= 1 && w0 != Lit::UNDEF && self.trail.has_lit(w0) {
            self.fix_one_watch(sid, w0);
        }
        if n >= 2 && w1 != Lit::UNDEF && self.trail.has_lit(w1) {
            self.fix_one_watch(sid, w1);
        }
        self.fix_watched_res(sid);
    }

    // ------------------------------------------------------------------
    // Firing

    fn has_blocked_imps(&self, sid: SeqId) -> Option<Lit> {
        let s = self.db.get(sid);
        s.imp_lits.iter().copied().find(|&l| self.trail.has_lit(!l))
    }

    /// An unassigned Lfut literal ordered strictly outer to `forced`.
    fn upstream_missing(&self, forced: Lit, sid: SeqId) -> Option<Lit> {
        let wq = self.ckt.qb.of_lit(forced);
        let s = self.db.get(sid);
        s.imp_lits
            .iter()
            .copied()
            .find(|&l| self.ckt.qb.of_lit(l) < wq && !self.trail.has_lit(l))
    }

    fn first_free_req(&self, sid: SeqId) -> Option<Lit> {
        let s = self.db.get(sid);
        s.req_lits.iter().copied().find(|&l| !self.trail.has_lit(l))
    }

    /// Tries to fire the sequent: records a conflict when every Lnow
    /// literal is satisfied, or forces the last free Lnow literal's
    /// negation. Returns true when something happened.
    pub(crate) fn exec_lit_set(&mut self, sid: SeqId) -> bool {
        if self.conflict.is_some() {
            if !self.warned.exec_in_conflict {
                self.warned.exec_in_conflict = true;
                debug!("exec requested while a conflict is pending");
            }
            return false;
        }
        let (w0, w1) = {
            let s = self.db.get(sid);
            (s.watch_req[0], s.watch_req[1])
        };
        if !self.trail.has_lit(w1) {
            return false;
        }
        if self.trail.has_lit(!w0) || self.trail.has_lit(!w1) {
            return false;
        }
        if self.pending_set[w0.idx() as usize] || self.pending_set[w1.idx() as usize] {
            return false;
        }
        if self.has_blocked_imps(sid).is_some() {
            return false;
        }
        if self.trail.has_lit(w0) {
            // Both watches satisfied: conflict candidate.
            if self.first_free_req(sid).is_some() {
                return false;
            }
            let free_fmla = {
                let s = self.db.get_mut(sid);
                debug_assert_eq!(s.in_use & self.cur_path_mask, 0);
                s.in_use |= self.cur_path_mask;
                s.free_fmla
            };
            self.conflict = Some(sid);
            self.free_fmla = Some(free_fmla);
            return true;
        }
        self.exec_forced(sid, w0)
    }

    fn exec_forced(&mut self, sid: SeqId, w0: Lit) -> bool {
        let forced = !w0;
        if self.upstream_missing(forced, sid).is_some() {
            return false;
        }
        let ok = match self.ckt.qtype_of_lit(forced) {
            Some(QType::Free) => true,
            Some(QType::Exists) => self.db.get(sid).free_fmla == Fmlas::FALSE,
            Some(QType::Forall) => self.db.get(sid).free_fmla == Fmlas::TRUE,
            None => false,
        };
        if !ok {
            if !self.warned.non_constant_force {
                self.warned.non_constant_force = true;
                debug!("suppressed a forcing with an inconsistent winner formula");
            }
            return false;
        }
        if self.ckt.qb.of_lit(forced) < self.min_prop_qb {
            return false;
        }
        debug_assert_eq!(
            self.db
                .get(sid)
                .req_lits
                .iter()
                .filter(|&&l| !self.trail.has_lit(l))
                .count(),
            1
        );
        self.stats.propagations += 1;
        self.set_dep(forced, sid);
        self.trail.append_forced(forced);
        self.push_pending(forced);
        true
    }

    /// Visits every sequent watching `cur` (which was just assigned): fixes
    /// watches and tries to fire.
    pub(crate) fn sched_for_prop(&mut self, cur: Lit) {
        debug_assert!(self.trail.has_lit(cur));
        let watchers = self.db.watchers_of(cur);
        for sid in watchers {
            if !self.db.is_live(sid) {
                continue;
            }
            self.fast_fix_watch(sid, cur);
            self.exec_lit_set(sid);
            if self.conflict.is_some() {
                break;
            }
        }
    }

    fn fast_fix_watch(&mut self, sid: SeqId, old_lit: Lit) {
        let is_res = self.db.get(sid).watch_res == old_lit;
        let dead = self.fix_one_watch(sid, old_lit);
        if dead {
            return;
        }
        if !is_res {
            self.fix_watched_res(sid);
        }
    }

    /// Drains the pending queue to fixpoint or a conflict.
    pub(crate) fn propagate(&mut self) {
        loop {
            if self.conflict.is_some() {
                self.clear_pending();
                return;
            }
            let l = match self.pending.pop_front() {
                Some(l) => l,
                None => return,
            };
            self.pending_set[l.idx() as usize] = false;
            self.sched_for_prop(l);
        }
    }

    // ------------------------------------------------------------------
    // Trail control

    pub(crate) fn backtrack(&mut self) -> Lit {
        let (chlit, undo) = self.trail.take_top_level();
        for &l in undo.iter().rev() {
            self.trail.unassign(l);
            let v = l.var();
            self.pol_pref[self.cur_path][v.idx() as usize] = !l.sign();
            self.insert_var_order(v);
            self.reset_dep(l);
        }
        if let Some(c) = self.conflict {
            let w0 = self.db.get(c).watch_req[0];
            if !self.trail.has_lit(w0) {
                self.db.get_mut(c).in_use &= !self.cur_path_mask;
                self.conflict = None;
                self.free_fmla = None;
                self.lits_in_conflict.clear();
            }
        }
        self.clear_pending();
        chlit
    }

    pub(crate) fn restart(&mut self) {
        while self.trail.cur_dl() > 0 {
            self.backtrack();
        }
        self.clean_up_sequents();
    }

    /// Top-level simplification after a restart: learned sequents with a
    /// falsified level-0 trigger can never fire again and are freed;
    /// satisfied level-0 triggers are stripped. Gate-definition sequents
    /// are left untouched.
    fn clean_up_sequents(&mut self) {
        if self.opts.allow_free {
            return;
        }
        debug_assert_eq!(self.trail.cur_dl(), 0);
        let ids: Vec<SeqId> = self.db.temp_learnts.iter().copied().collect();
        for sid in ids {
            if !self.db.is_live(sid) {
                continue;
            }
            if self.db.get(sid).in_use != 0 {
                continue;
            }
            let (req, w) = {
                let s = self.db.get(sid);
                (s.req_lits.to_vec(), s.watch_req)
            };
            if req.iter().any(|&l| self.trail.has_lit(!l)) {
                self.db.free(sid);
                continue;
            }
            let keep: Vec<Lit> = req
                .iter()
                .copied()
                .filter(|&l| !self.trail.has_lit(l) || l == w[0] || l == w[1])
                .collect();
            if keep.len() != req.len() {
                let s = self.db.get_mut(sid);
                s.req_lits = keep.into_iter().collect();
                s.wat_start_pos = 0;
                s.wat_stop_bt = 0;
            }
        }
    }

    // ------------------------------------------------------------------
    // Installing sequents

    /// Creates, registers and immediately tries to fire a sequent with the
    /// given Lnow/Lfut and winner formula.
    pub(crate) fn new_lrn_gs(
        &mut self,
        args: &[Lit],
        winr_lits: &[Lit],
        winner: FmlaRef,
    ) -> SeqId {
        debug_assert!(winner == Fmlas::TRUE || winner == Fmlas::FALSE);
        let sid = self.db.alloc(winner);
        {
            let mut req: Vec<Lit> = args.to_vec();
            req.sort_unstable();
            req.dedup();
            let mut imp: Vec<Lit> = winr_lits.to_vec();
            imp.sort_unstable();
            imp.dedup();
            let s = self.db.get_mut(sid);
            s.req_lits = req.into_iter().collect();
            s.imp_lits = imp.into_iter().collect();
        }
        self.db.register_lits_have(sid);
        if self.opts.strat_enabled {
            let strat = crate::analyze::strat_from_lfut(&self.db.get(sid).imp_lits);
            self.strats.insert(sid, strat);
        }
        self.init_watches(sid);
        self.db.attach_watches(sid);
        self.log_gseq(sid);
        self.exec_lit_set(sid);
        self.propagate();
        sid
    }

    /// Splits a literal set into (Lnow, Lfut) by the winning player and
    /// installs the sequent.
    pub(crate) fn new_lrn_gs_mixed(&mut self, lits: &[Lit], winner: Ply) -> SeqId {
        let mut args = vec![];
        let mut winr = vec![];
        for &l in lits {
            match self.ckt.qtype_of_lit(l) {
                Some(qt) if qt != QType::Free && qt.ply() == Some(winner) => winr.push(l),
                _ => args.push(l),
            }
        }
        let fmla = if winner == Ply::E { Fmlas::TRUE } else { Fmlas::FALSE };
        self.new_lrn_gs(&args, &winr, fmla)
    }

    fn new_lrn_gs_top(&mut self, top: Lit, winner: Ply) -> SeqId {
        self.new_lrn_gs_mixed(&[top], winner)
    }

    /// Emits the definition sequents of one gate, both ghost plies.
    pub(crate) fn new_defn_gs(&mut self, gate: GateId) {
        let (args, ghosts) = {
            let g = &self.ckt.gates[gate as usize];
            (g.args.clone(), g.ghosts)
        };
        let mut key = args.clone();
        key.sort_unstable();
        key.dedup();
        let out_lit = ghosts[Ply::A.index()].pos_lit();
        if self.args_to_gate.contains_key(&key) {
            if !self.warned.redundant_gate {
                self.warned.redundant_gate = true;
                debug!("redundant gate: duplicate argument list");
            }
        } else {
            self.args_to_gate.insert(key, out_lit);
        }
        for ply in [Ply::A, Ply::E] {
            let ghost_out = Lit::new(ghosts[ply.index()], true);
            let mut lits = Vec::with_capacity(args.len() + 1);
            lits.push(ghost_out);
            for &a in &args {
                lits.push(self.ckt.ghost_or_pass(a, ply));
            }
            let sid = self.new_lrn_gs_mixed(&lits, ply.opponent());
            self.db.get_mut(sid).glit_defd = ghost_out;
            if self.in_cegar {
                self.temp_new_seqs.push(sid);
            }
        }
        for &a in &args {
            for ply in [Ply::A, Ply::E] {
                let ghost_gate = Lit::new(ghosts[ply.index()], false);
                let na = self.ckt.ghost_or_pass(!a, ply);
                let sid = self.new_lrn_gs_mixed(&[na, ghost_gate], ply.opponent());
                self.db.get_mut(sid).glit_defd = ghost_gate;
                if self.in_cegar {
                    self.temp_new_seqs.push(sid);
                }
            }
        }
    }

    fn install_gate_sequents(&mut self) {
        // Children were parsed first, but the definition sequents install
        // parents first, mirroring the original seeding order.
        for gate in (0..self.ckt.gates.len() as GateId).rev() {
            self.new_defn_gs(gate);
        }
    }

    fn pre_solve(&mut self) -> Result<()> {
        if self.presolved {
            return Ok(());
        }
        self.presolved = true;
        self.start = Instant::now();

        for sid in 1..self.db.num_slots() as SeqId {
            if self.db.is_live(sid) {
                self.simp_fix_watch(sid);
            }
        }

        // Top-level seeds: a player whose ghost concedes the output loses.
        let out = self.ckt.out_lit;
        let seed_a = self.ckt.ghost_or_pass(out, Ply::A);
        self.new_lrn_gs_top(seed_a, Ply::E);
        if self.conflict.is_some() {
            return Ok(());
        }
        let seed_e = self.ckt.ghost_or_pass(!out, Ply::E);
        self.new_lrn_gs_top(seed_e, Ply::A);
        if self.conflict.is_some() {
            return Ok(());
        }

        self.propagate();
        for sid in 1..self.db.num_slots() as SeqId {
            if !self.db.is_live(sid) {
                continue;
            }
            self.exec_lit_set(sid);
            self.propagate();
            if self.conflict.is_some() {
                return Ok(());
            }
        }
        self.propagate();
        self.num_until_restart = 2;
        self.clean_up_sequents();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Decisions

    fn pol_lit(&self, v: Var) -> Lit {
        Lit::new(v, !self.pol_pref[self.cur_path][v.idx() as usize])
    }

    /// Picks the next decision literal: an injected preference, else the
    /// highest-activity variable of the outermost open block, else a random
    /// literal of the current block.
    fn choose_rand_lit(&mut self, preferred: Lit) -> Option<Lit> {
        let use_vsids = self.irand(64) != 0 && self.num_big_bt > 32;
        if use_vsids {
            loop {
                let mut found = None;
                for qb in 1..self.order.len() {
                    if let Some(v) = {
                        let acts = &self.var_act;
                        self.order[qb].remove_min(acts)
                    } {
                        found = Some(v);
                        break;
                    }
                }
                match found {
                    Some(v) => {
                        if self.trail.has_either(v.pos_lit()) {
                            continue;
                        }
                        return Some(self.pol_lit(v));
                    }
                    None => break,
                }
            }
        }
        let mut choices: Vec<Lit> = vec![];
        if preferred != Lit::UNDEF && !self.trail.has_either(preferred) {
            choices.push(preferred);
        } else {
            let prev_qb = self.ckt.qb.of_lit(self.trail.last_chlit());
            let mut cur_qb = 0u16;
            'blocks: for blk in self.ckt.prefix.blocks() {
                if blk.ix < prev_qb {
                    continue;
                }
                for &v in &blk.vars {
                    if cur_qb != 0 && self.ckt.qb.of_var(v) != cur_qb {
                        break 'blocks;
                    }
                    if self.trail.has_either(v.pos_lit()) {
                        continue;
                    }
                    if cur_qb == 0 {
                        cur_qb = self.ckt.qb.of_var(v);
                    }
                    choices.push(v.pos_lit());
                    choices.push(v.neg_lit());
                }
                if cur_qb != 0 {
                    break;
                }
            }
            if !choices.is_empty() {
                self.stats.rnd_decisions += 1;
            }
        }
        if choices.is_empty() {
            return None;
        }
        let ix = if self.opts.var_ord_fix {
            0
        } else {
            self.irand(choices.len())
        };
        Some(choices[ix])
    }

    fn choose_lit_and_prop(&mut self, preferred: Lit) -> Result<()> {
        self.stats.decisions += 1;
        let l = self
            .choose_rand_lit(preferred)
            .ok_or(SolverError::Internal("no decision candidates left"))?;
        debug!("decide {} at level {}", l, self.trail.cur_dl() + 1);
        self.trail.append_chlit(l);
        self.sched_for_prop(l);
        self.propagate();
        Ok(())
    }

    fn randomize_pol_pref(&mut self) {
        for ix in 0..self.pol_pref[self.cur_path].len() {
            let b = self.irand(2) == 1;
            self.pol_pref[self.cur_path][ix] = b;
        }
    }

    // ------------------------------------------------------------------
    // Learnt-database maintenance

    pub(crate) fn delete_excess_learned(&mut self) {
        let num_learned = self.db.temp_learnts.len() as i64 - self.db.num_learnt_locked;
        if (num_learned as f64) < self.max_learnts {
            return;
        }
        self.max_learnts += self.max_learnts / 128.0 + 1.0;
        let median = self.db.median_deletable_activity();
        let kill: Vec<SeqId> = self
            .db
            .temp_learnts
            .iter()
            .copied()
            .filter(|&sid| {
                self.db.is_live(sid)
                    && self.db.get(sid).in_use == 0
                    && self.db.get(sid).adjusted_activity() < median
            })
            .collect();
        let num_del = kill.len();
        for sid in kill {
            self.db.free(sid);
        }
        if num_del > 0 {
            debug!(
                "deleted {} of {} deletable learned sequents",
                num_del, num_learned
            );
        }
    }

    fn timed_out(&self) -> bool {
        match self.opts.timeout {
            Some(limit) => self.start.elapsed() > limit,
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // The main loop

    /// Runs the search to completion. The returned sequent has an empty
    /// Lnow; its formula is the answer.
    pub fn solve(&mut self) -> Result<SeqId> {
        self.pre_solve()?;
        loop {
            while self.conflict.is_none() {
                if self.timed_out() {
                    return Err(SolverError::Timeout);
                }
                let mut choice = Lit::UNDEF;
                while self.ix_choi < self.init_choices.len() {
                    let c = self.init_choices[self.ix_choi];
                    if self.trail.has_lit(c) {
                        self.ix_choi += 1;
                        continue;
                    }
                    if self.trail.has_lit(!c) {
                        self.init_choices.clear();
                        self.ix_choi = 0;
                    } else {
                        choice = c;
                    }
                    break;
                }
                self.choose_lit_and_prop(choice)?;
            }

            let mut got_one = false;
            let mut got_two = false;
            while self.conflict.is_some() {
                if got_one {
                    got_two = true;
                }
                got_one = true;
                self.stats.conflicts += 1;

                let final_seq = self.learn_and_backtrack(got_two)?;
                self.cla_decay_activity();
                self.var_decay_activity();

                self.learntsize_adjust_cnt -= 1;
                if self.learntsize_adjust_cnt == 0 {
                    self.learntsize_adjust_confl *= LEARNTSIZE_ADJUST_INC;
                    self.learntsize_adjust_cnt = self.learntsize_adjust_confl as i32;
                    self.max_learnts *= LEARNTSIZE_INC;
                }

                if let Some(fin) = final_seq {
                    if self.db.get(fin).req_lits.is_empty() {
                        self.stats.max_learnts = self.max_learnts;
                        return Ok(fin);
                    }
                }

                self.delete_excess_learned();
                self.num_until_restart -= 1;
                if self.timed_out() {
                    return Err(SolverError::Timeout);
                }
            }

            if got_one && self.num_until_restart <= 0 && !self.opts.no_restart {
                self.num_until_restart = self.restart_cycle;
                self.stats.restarts += 1;
                if self.stats.restarts <= 4 {
                    self.num_until_restart = 8;
                } else {
                    self.restart_cycle += ((self.restart_cycle as f64 / 16.0).sqrt()) as i32;
                }
                info!(
                    "restart {} (conflicts {}, cegar {})",
                    self.stats.restarts, self.stats.conflicts, self.stats.cegar_learns
                );
                self.restart();
                self.cur_path = (self.cur_path + 1) % NUM_PATHS;
                self.cur_path_mask = 1 << self.cur_path;
                if self.cur_path == 1 {
                    self.randomize_pol_pref();
                }
                self.init_choices.clear();
                self.ix_choi = 0;
            }
        }
    }

    pub fn outcome(&self, sid: SeqId) -> Outcome {
        match self.db.get(sid).free_fmla {
            f if f == Fmlas::TRUE => Outcome::True,
            f if f == Fmlas::FALSE => Outcome::False,
            f => Outcome::Free(f),
        }
    }

    // ------------------------------------------------------------------
    // Proof log

    fn log_gseq(&mut self, sid: SeqId) {
        if self.prf_log.is_none() {
            return;
        }
        let (req, imp): (Vec<String>, Vec<String>) = {
            let s = self.db.get(sid);
            (
                s.req_lits.iter().map(|&l| self.ckt.lit_name(l)).collect(),
                s.imp_lits.iter().map(|&l| self.ckt.lit_name(l)).collect(),
            )
        };
        let fstr = match self.db.get(sid).free_fmla {
            f if f == Fmlas::TRUE => "true()".to_string(),
            f if f == Fmlas::FALSE => "false()".to_string(),
            _ => "free()".to_string(),
        };
        if let Some(w) = self.prf_log.as_mut() {
            let _ = writeln!(
                w,
                "$gs{}:gseq(\n    [{}],\n    [{}],\n    {})",
                sid,
                req.join(", "),
                imp.join(", "),
                fstr
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::BuildOpts;
    use crate::parse::parse_ghostq;

    fn solver_for(src: &str, opts: SolverOpts) -> Solver {
        let parsed = parse_ghostq(src.as_bytes()).unwrap();
        let mut fmlas = Fmlas::new();
        let ckt = Circuit::build(
            &parsed,
            &mut fmlas,
            BuildOpts {
                allow_free: opts.allow_free,
                alloc_cegar_vars: opts.allow_cegar,
            },
        )
        .unwrap();
        Solver::new(ckt, fmlas, opts)
    }

    const OR_CKT: &str = "CktQBF\nLastInputVar 4\nLastGateVar 6\nOutputGateLit 6\n\
        <q gate=6>\ne 2 4\n</q>\n6 = or(2, 4)\n";

    #[test]
    fn or_of_two_existentials_is_true() {
        let mut s = solver_for(OR_CKT, SolverOpts::default());
        let fin = s.solve().unwrap();
        assert_eq!(s.outcome(fin), Outcome::True);
    }

    #[test]
    fn contradictory_and_is_false() {
        let src = "CktQBF\nLastInputVar 2\nLastGateVar 4\nOutputGateLit 4\n\
            <q gate=4>\ne 2\n</q>\n4 = and(2, -2)\n";
        let mut s = solver_for(src, SolverOpts::default());
        let fin = s.solve().unwrap();
        assert_eq!(s.outcome(fin), Outcome::False);
    }

    #[test]
    fn watch_invariants_hold_after_install() {
        let s = solver_for(OR_CKT, SolverOpts::default());
        for sid in 1..s.db.num_slots() as SeqId {
            if s.db.is_live(sid) {
                assert!(s.db.watch_fields_consistent(sid), "sequent {}", sid);
            }
        }
    }

    #[test]
    fn injected_choices_steer_the_first_decision() {
        let mut s = solver_for(OR_CKT, SolverOpts::default());
        let v1 = Var::from_idx(1);
        s.inject_choices(vec![v1.neg_lit()]);
        let fin = s.solve().unwrap();
        assert_eq!(s.outcome(fin), Outcome::True);
    }

    #[test]
    fn restart_unwinds_to_level_zero() {
        let mut s = solver_for(OR_CKT, SolverOpts::default());
        let l = Var::from_idx(1).pos_lit();
        s.trail.append_chlit(l);
        s.sched_for_prop(l);
        s.propagate();
        assert_eq!(s.trail.cur_dl(), 1);
        s.restart();
        assert_eq!(s.trail.cur_dl(), 0);
        assert!(!s.trail.has_either(l));
        for sid in 1..s.db.num_slots() as SeqId {
            if s.db.is_live(sid) {
                assert!(s.db.watch_fields_consistent(sid));
                assert_eq!(s.db.get(sid).in_use, 0, "sequent {} still locked", sid);
            }
        }
        // The solver still reaches the right answer afterwards.
        let fin = s.solve().unwrap();
        assert_eq!(s.outcome(fin), Outcome::True);
    }

    #[test]
    fn timeout_is_reported() {
        let mut opts = SolverOpts::default();
        opts.timeout = Some(Duration::from_secs(0));
        let mut s = solver_for(OR_CKT, opts);
        match s.solve() {
            Err(SolverError::Timeout) => {}
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }
}
