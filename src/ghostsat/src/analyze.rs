//! Conflict and solution analysis: Q-resolution over the trail.
//!
//! Starting from the conflicting sequent, the analyzer repeatedly pops the
//! chronologically latest trigger literal and resolves it against its
//! antecedent, merging reserved literals and combining winner formulas by
//! the resolved literal's quantifier type. The loop stops at an asserting
//! literal: the only trigger at its level whose type differs from the
//! declared winner, with no reserved literal ordered strictly outer still
//! pending. The learned sequent carries a strategy fragment when strategy
//! output is on.

use std::collections::{BTreeMap, BinaryHeap, BTreeSet, HashMap, HashSet};
use std::io::Write;

use log::debug;

use crate::error::{Result, SolverError};
use crate::fmla::{FmlaRef, Fmlas};
use crate::lit::{Lit, Ply, Var};
use crate::prefix::{QType, MAX_QB};
use crate::sequent::{SeqId, LRN_TYPE_1, LRN_TYPE_2};
use crate::solver::Solver;
use crate::trail::NO_CHRONO;

/// A winner's play: each variable maps to a response formula over free
/// variables and earlier-quantified variables, ordered by variable index.
pub type Strategy = Vec<(Var, FmlaRef)>;

pub(crate) fn strat_from_lfut(imp: &[Lit]) -> Strategy {
    imp.iter()
        .map(|&l| {
            (
                l.var(),
                if l.sign() { Fmlas::FALSE } else { Fmlas::TRUE },
            )
        })
        .collect()
}

/// Variable-wise union; where both sides define a variable, the merged
/// response branches on the resolved literal.
fn merge_strats(
    fmlas: &mut Fmlas,
    s1: &Strategy,
    s2: &Strategy,
    resolvent_fmla: FmlaRef,
) -> Strategy {
    let mut out = Strategy::with_capacity(s1.len() + s2.len());
    let (mut i, mut j) = (0, 0);
    while i < s1.len() || j < s2.len() {
        if j >= s2.len() || (i < s1.len() && s1[i].0 < s2[j].0) {
            out.push(s1[i]);
            i += 1;
        } else if i >= s1.len() || s2[j].0 < s1[i].0 {
            out.push(s2[j]);
            j += 1;
        } else {
            let merged = fmlas.ite(resolvent_fmla, s1[i].1, s2[j].1);
            out.push((s1[i].0, merged));
            i += 1;
            j += 1;
        }
    }
    out
}

/// Working state of one analysis run.
pub(crate) struct GsBuilder {
    /// Every literal ever inserted as a trigger.
    seen: HashSet<Lit>,
    /// Pending triggers as chronological timestamps; latest on top.
    heap: BinaryHeap<u32>,
    imps: BTreeSet<Lit>,
    free_fmla: FmlaRef,
    strat: Strategy,
}

impl GsBuilder {
    fn new() -> GsBuilder {
        GsBuilder {
            seen: HashSet::new(),
            heap: BinaryHeap::new(),
            imps: BTreeSet::new(),
            free_fmla: Fmlas::ERROR,
            strat: Strategy::new(),
        }
    }

    fn trig_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Winner {
    Player(Ply),
    Free,
}

impl Solver {
    fn trig_insert(&mut self, gb: &mut GsBuilder, l: Lit) {
        debug_assert!(self.trail.has_lit(l));
        if gb.seen.insert(l) {
            self.bump_var_act(l.var());
            let c = self.trail.chrono_of(l);
            debug_assert_ne!(c, NO_CHRONO);
            gb.heap.push(c);
        }
    }

    fn peek_trig(&self, gb: &GsBuilder) -> Lit {
        let &c = gb.heap.peek().expect("non-empty trigger heap");
        self.trail.lit_at_chrono(c)
    }

    fn pop_trig(&self, gb: &mut GsBuilder) -> Lit {
        let c = gb.heap.pop().expect("non-empty trigger heap");
        while gb.heap.peek() == Some(&c) {
            gb.heap.pop();
        }
        self.trail.lit_at_chrono(c)
    }

    /// True when the latest trigger is the only one at its decision level.
    fn has_uip(&self, gb: &mut GsBuilder) -> bool {
        let top = gb.heap.pop().expect("non-empty trigger heap");
        let ret = match gb.heap.peek() {
            None => true,
            Some(&pen) => {
                let top_dl = self.trail.dl_of(self.trail.lit_at_chrono(top));
                let pen_dl = self.trail.dl_of(self.trail.lit_at_chrono(pen));
                top_dl != pen_dl
            }
        };
        gb.heap.push(top);
        ret
    }

    fn winner(&self) -> Winner {
        match self.free_fmla {
            Some(f) if f == Fmlas::TRUE => Winner::Player(Ply::E),
            Some(f) if f == Fmlas::FALSE => Winner::Player(Ply::A),
            _ => Winner::Free,
        }
    }

    /// Resolves the working sequent against the antecedent of `cur`.
    fn resolve(&mut self, gb: &mut GsBuilder, cur: Lit) -> Result<()> {
        debug_assert!(!self.trail.is_chlit(cur));
        let dep = self
            .trail
            .dep_of(cur)
            .ok_or(SolverError::Internal("resolving a literal with no antecedent"))?;
        self.bump_seq_act(dep);
        self.num_resolves += 1;
        if self.num_resolves > self.ckt.num_vars() * 2 + 16 {
            return Err(SolverError::Internal(
                "resolution loop while constructing a sequent",
            ));
        }
        self.log_discharge(cur, dep);
        let (req, imps, dep_fmla) = {
            let s = self.db.get(dep);
            (
                s.req_lits.to_vec(),
                s.imp_lits.to_vec(),
                s.free_fmla,
            )
        };
        if self.opts.strat_enabled {
            let dep_strat = self.strats.get(&dep).cloned().unwrap_or_default();
            let res_fmla = self.ckt.lit_fmla(cur, &mut self.fmlas);
            gb.strat = merge_strats(&mut self.fmlas, &gb.strat, &dep_strat, res_fmla);
        }
        let mut has_special = false;
        for &l in &req {
            if l == !cur {
                has_special = true;
                continue;
            }
            self.trig_insert(gb, l);
        }
        debug_assert!(has_special, "antecedent lacks the resolved literal");

        let qt = self
            .ckt
            .qtype_of_lit(cur)
            .ok_or(SolverError::Internal("resolved literal outside any block"))?;
        let new_fmla = match qt {
            QType::Free => {
                let test = self.ckt.lit_fmla(cur, &mut self.fmlas);
                self.fmlas.ite(test, gb.free_fmla, dep_fmla)
            }
            QType::Exists => self.fmlas.or2(gb.free_fmla, dep_fmla),
            QType::Forall => self.fmlas.and2(gb.free_fmla, dep_fmla),
        };
        let needs_reservation = match qt {
            QType::Free => true,
            QType::Exists => gb.free_fmla != dep_fmla || gb.free_fmla != Fmlas::FALSE,
            QType::Forall => gb.free_fmla != dep_fmla || gb.free_fmla != Fmlas::TRUE,
        };
        if needs_reservation {
            debug_assert!(self.opts.allow_free);
            gb.imps.insert(cur);
            gb.imps.insert(!cur);
        }
        gb.free_fmla = new_fmla;
        for &l in &imps {
            gb.imps.insert(l);
        }
        Ok(())
    }

    /// Self-subsumption: a trigger is redundant when some sequent that
    /// forces it has all its other triggers already in the working set, no
    /// later in chronology, and its reserved literals covered.
    fn is_redundant_by_seq(&self, gb: &GsBuilder, cur: Lit, dep: SeqId) -> bool {
        let s = self.db.get(dep);
        let mut has_forced = false;
        for &l in &s.req_lits {
            if l == !cur {
                has_forced = true;
                continue;
            }
            if !gb.seen.contains(&l) {
                return false;
            }
            if self.trail.chrono_of(cur) < self.trail.chrono_of(l) {
                return false;
            }
        }
        debug_assert!(has_forced);
        s.imp_lits.iter().all(|l| gb.imps.contains(l))
    }

    fn is_redundant(&self, gb: &GsBuilder, cur: Lit) -> bool {
        if self.ckt.qtype_of_lit(cur) == Some(QType::Free) {
            return false;
        }
        if self.trail.dl_of(cur) == 0 {
            return true;
        }
        match self.trail.dep_of(cur) {
            None => false,
            Some(dep) => self.is_redundant_by_seq(gb, cur, dep),
        }
    }

    fn minimize_triggers(&self, gb: &GsBuilder, trig: &mut Vec<Lit>) {
        trig.retain(|&l| !self.is_redundant(gb, l));
    }

    /// Freezes the working sequent into the store. The new sequent is not
    /// registered in the watch index; the caller attaches it.
    fn create_gs_from_gb(&mut self, gb: &GsBuilder, lrn_type: u8) -> SeqId {
        let mut trig: Vec<Lit> = gb
            .heap
            .iter()
            .map(|&c| self.trail.lit_at_chrono(c))
            .collect();
        if !self.opts.allow_free {
            self.minimize_triggers(gb, &mut trig);
        }
        trig.sort_unstable();
        trig.dedup();

        let mut max_losr_qb = trig
            .iter()
            .map(|&l| self.ckt.qb.of_lit(l))
            .max()
            .unwrap_or(0);
        if max_losr_qb == 0 {
            max_losr_qb = MAX_QB;
        }
        let kept: Vec<Lit> = gb
            .imps
            .iter()
            .copied()
            .filter(|&l| self.ckt.qb.of_lit(l) <= max_losr_qb)
            .collect();
        if kept.len() != gb.imps.len() {
            self.stats.lfut_reductions += 1;
        }

        let sid = self.db.alloc(gb.free_fmla);
        {
            let s = self.db.get_mut(sid);
            s.req_lits = trig.iter().copied().collect();
            s.imp_lits = kept.iter().copied().collect();
            s.lrn_type = lrn_type;
        }
        self.init_watches(sid);
        if self.db.get(sid).req_lits.is_empty() {
            if self.opts.strat_enabled {
                self.strats.insert(sid, gb.strat.clone());
            }
            return sid;
        }

        // Refine the reserved watch: the latest-assigned reserved literal
        // that is not inner to the pending trigger and not older than the
        // second watch.
        let (last_trig, penult) = {
            let s = self.db.get(sid);
            (s.watch_req[0], s.watch_req[1])
        };
        let mut best = kept.first().copied().unwrap_or(Lit::UNDEF);
        for &l in &kept {
            if self.ckt.qb.of_lit(l) > self.ckt.qb.of_lit(last_trig) {
                continue;
            }
            if self.trail.dl_of(l) > self.trail.dl_of(penult)
                && self.trail.dl_of(l) > self.trail.dl_of(best)
            {
                best = l;
            }
        }
        {
            let s = self.db.get_mut(sid);
            s.watch_res = best;
            s.is_learned = true;
        }
        let last_use = self.num_big_bt;
        self.db.get_mut(sid).last_use = last_use;
        self.bump_seq_act(sid);
        if self.db.get(sid).req_lits.len() > 3 {
            self.db.temp_learnts.insert(sid);
        }
        if self.opts.strat_enabled {
            self.strats.insert(sid, gb.strat.clone());
        }
        sid
    }

    /// Builds the learned sequent for the pending conflict.
    pub(crate) fn make_learned_gs(&mut self) -> Result<SeqId> {
        let conf = self
            .conflict
            .ok_or(SolverError::Internal("analysis without a conflict"))?;
        self.num_resolves = 0;
        let mut gb = GsBuilder::new();
        self.bump_seq_act(conf);
        self.log_resolve_header(conf);
        {
            let (req, imps, fmla) = {
                let s = self.db.get(conf);
                (s.req_lits.to_vec(), s.imp_lits.to_vec(), s.free_fmla)
            };
            let last = self.trail.chrono_last(&req);
            self.lits_in_conflict.insert(last);
            gb.free_fmla = fmla;
            for &l in &req {
                self.trig_insert(&mut gb, l);
            }
            for &l in &imps {
                gb.imps.insert(l);
            }
            gb.strat = self.strats.get(&conf).cloned().unwrap_or_default();
        }

        let cur_dl = self.trail.cur_dl();
        let winner = self.winner();
        let mut learned = None;
        let mut uip = Lit::UNDEF;
        while !gb.trig_empty() {
            let cur = self.peek_trig(&gb);
            let mut ok = false;
            if cur_dl > 0 {
                let qtype_cur_dl = {
                    let d = self.trail.dl_of(cur);
                    let chlit = self.trail.chlit_at(d);
                    self.ckt.qtype_of_lit(chlit)
                };
                match winner {
                    Winner::Player(w) => {
                        let wq = QType::of_ply(w);
                        let qt_cur = self.ckt.qtype_of_lit(cur);
                        if !self.opts.allow_free {
                            debug_assert_ne!(qt_cur, Some(wq));
                        }
                        ok = qt_cur != Some(wq)
                            && qtype_cur_dl != Some(wq)
                            && self.has_uip(&mut gb);
                    }
                    Winner::Free => {
                        debug_assert_eq!(qtype_cur_dl, Some(QType::Free));
                        ok = self.has_uip(&mut gb);
                    }
                }
            }
            if ok {
                let cur_qb = self.ckt.qb.of_lit(cur);
                let cur_lvl = self.trail.dl_of(cur);
                let bad_imp = gb.imps.iter().any(|&imp| {
                    cur_qb > self.ckt.qb.of_lit(imp) && cur_lvl <= self.trail.dl_of(imp)
                });
                if !bad_imp {
                    if self.trail.is_chlit(cur) {
                        uip = cur;
                        break;
                    }
                    if !self.lits_in_conflict.contains(&cur) {
                        uip = cur;
                        learned = Some(self.create_gs_from_gb(&gb, LRN_TYPE_2));
                        break;
                    }
                }
            }
            self.pop_trig(&mut gb);
            self.resolve(&mut gb, cur)?;
        }
        self.log_resolve_footer(uip);
        let sid = match learned {
            Some(sid) => sid,
            None => self.create_gs_from_gb(&gb, LRN_TYPE_1),
        };
        Ok(sid)
    }

    /// Analysis, installation, backjump and the optional CEGAR episode.
    /// Returns the learned sequent when its Lnow is empty (the answer).
    pub(crate) fn learn_and_backtrack(&mut self, _got_two: bool) -> Result<Option<SeqId>> {
        let winr_ply: Option<Ply> = match self.free_fmla {
            Some(f) if f == Fmlas::TRUE => Some(Ply::E),
            Some(f) if f == Fmlas::FALSE => Some(Ply::A),
            _ => None,
        };
        let last_chlit = self.trail.last_chlit();
        let mut elim_qb = self.ckt.qb.of_lit(last_chlit);
        let conf = self
            .conflict
            .ok_or(SolverError::Internal("learning without a conflict"))?;

        let mut do_cegar = self.opts.allow_cegar
            && self.has_more_vars()
            && last_chlit != Lit::UNDEF
            && !self.no_more_vars
            && winr_ply.is_some();
        if do_cegar {
            let lc_ply = self.ckt.ply_of_lit(last_chlit);
            if winr_ply != lc_ply {
                let (cw0, cw1, cres) = {
                    let s = self.db.get(conf);
                    (s.watch_req[0], s.watch_req[1], s.watch_res)
                };
                do_cegar = self.trail.dl_of(cw0) != self.trail.dl_of(cw1)
                    && self.ckt.qb.of_lit(cres) < self.ckt.qb.of_lit(cw0);
                if do_cegar {
                    elim_qb = self.ckt.qb.of_lit(cres);
                }
            }
            if elim_qb <= 1 || elim_qb < self.ckt.innermost_input_qb.saturating_sub(3) {
                do_cegar = false;
            }
        }

        let lrn = self.make_learned_gs()?;
        self.db.register_lits_have(lrn);
        self.db.attach_watches(lrn);
        if self.db.get(lrn).req_lits.is_empty() {
            debug!("terminal sequent learned");
            return Ok(Some(lrn));
        }

        let init_dl = self.trail.cur_dl();
        let (lw0, lw1, lres) = {
            let s = self.db.get(lrn);
            (s.watch_req[0], s.watch_req[1], s.watch_res)
        };
        let mut targ_dl = self.trail.dl_of(lw1);
        if self.ckt.qb.of_lit(lres) < self.ckt.qb.of_lit(lw0) {
            targ_dl = targ_dl.max(self.trail.dl_of(lres));
        }

        // Collect the winner's commitment before unwinding the trail.
        let winr = winr_ply.unwrap_or(Ply::E);
        let mut asgn_lits: Vec<Lit> = vec![];
        if do_cegar {
            let imps: Vec<Lit> = self.db.get(lrn).imp_lits.to_vec();
            for l in imps {
                if self.ckt.ply_of_lit(l) == Some(winr)
                    && self.ckt.is_input(l.var())
                    && self.ckt.qb.of_lit(l) == elim_qb
                {
                    asgn_lits.push(l);
                }
            }
            let assigned: Vec<Lit> = self.trail.all_assigned().collect();
            for l in assigned {
                if l == Lit::UNDEF || !self.ckt.is_input(l.var()) {
                    continue;
                }
                let q = self.ckt.qb.of_lit(l);
                if q + 1 == elim_qb || q > elim_qb {
                    continue;
                }
                if !self.ckt.is_orig_input(l.var()) {
                    continue;
                }
                asgn_lits.push(l);
            }
            asgn_lits.sort_unstable();
            asgn_lits.dedup();
            for w in asgn_lits.windows(2) {
                if w[0] == !w[1] {
                    if !self.warned.cegar_seed_clash {
                        self.warned.cegar_seed_clash = true;
                        debug!("cegar aborted: contradictory winner literals");
                    }
                    do_cegar = false;
                    break;
                }
            }
        }

        while self.trail.cur_dl() != targ_dl {
            self.backtrack();
        }
        if !self.exec_lit_set(lrn) {
            return Err(SolverError::Internal("learned sequent failed to assert"));
        }
        self.propagate();
        self.num_big_bt += 1;
        if init_dl == targ_dl {
            return Err(SolverError::Internal("backjump made no progress"));
        }

        if do_cegar {
            let old_chlits: Vec<Lit> = self.trail.chlits[1..].to_vec();
            self.restart();
            let mut hit = HashMap::new();
            let ceg = match self.augment(&asgn_lits, &mut hit, elim_qb) {
                Ok(x) => x,
                Err(SolverError::ResourceExhausted(_)) => {
                    self.no_more_vars = true;
                    if !self.warned.out_of_vars {
                        self.warned.out_of_vars = true;
                        log::warn!("out of space for new variables; disabling gate synthesis");
                    }
                    None
                }
                Err(e) => return Err(e),
            };
            match ceg {
                Some(cs) => {
                    self.stats.cegar_learns += 1;
                    self.exec_lit_set(cs);
                }
                None => {
                    if !self.no_more_vars && !self.warned.cegar_failed {
                        self.warned.cegar_failed = true;
                        debug!("cegar episode produced no generalizing sequent");
                    }
                }
            }
            self.propagate();
            for chlit in old_chlits {
                if self.conflict.is_some() || self.trail.has_lit(!chlit) {
                    break;
                }
                if self.trail.has_lit(chlit) {
                    continue;
                }
                self.trail.append_chlit(chlit);
                self.sched_for_prop(chlit);
                self.propagate();
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Strategy listing

    /// The strategy of a sequent as a list formula mapping each variable
    /// to its response, with earlier variables substituted into later
    /// responses unless `raw` is set.
    pub fn strategy_list_fmla(&mut self, sid: SeqId, raw: bool) -> Option<FmlaRef> {
        let strat = self.strats.get(&sid)?.clone();
        let mut by_qb: BTreeMap<u16, Vec<(Var, FmlaRef)>> = BTreeMap::new();
        for (v, f) in strat {
            by_qb.entry(self.ckt.qb.of_var(v)).or_default().push((v, f));
        }
        let mut submap: HashMap<FmlaRef, FmlaRef> = HashMap::new();
        let mut items = vec![];
        for (_qb, vars) in by_qb {
            for (v, f) in vars {
                let name = self.ckt.lit_name(v.pos_lit());
                let var_fmla = self.fmlas.var(&name);
                let value = if raw { f } else { self.fmlas.subst(f, &submap) };
                submap.insert(var_fmla, value);
                let entry = self.fmlas.list(&[var_fmla, value]);
                items.push(entry);
            }
        }
        Some(self.fmlas.list(&items))
    }

    // ------------------------------------------------------------------
    // Proof log

    fn log_resolve_header(&mut self, conf: SeqId) {
        let next_id = self.db.num_slots();
        if let Some(w) = self.prf_log.as_mut() {
            let _ = writeln!(w, "$gs{}:resolve($gs{}, [", next_id, conf);
        }
    }

    fn log_discharge(&mut self, cur: Lit, dep: SeqId) {
        if self.prf_log.is_none() {
            return;
        }
        let qt = match self.ckt.qtype_of_lit(cur) {
            Some(QType::Free) => "free(  ",
            Some(QType::Exists) => "exists(",
            Some(QType::Forall) => "forall(",
            None => "?(     ",
        };
        let name = self.ckt.lit_name(cur);
        if let Some(w) = self.prf_log.as_mut() {
            let _ = writeln!(w, "    {} {}, $gs{})", qt, name, dep);
        }
    }

    fn log_resolve_footer(&mut self, uip: Lit) {
        if self.prf_log.is_none() {
            return;
        }
        let name = self.ckt.lit_name(uip);
        if let Some(w) = self.prf_log.as_mut() {
            let _ = writeln!(w, "# UIP: {}\n])", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strat_from_lfut_maps_polarities() {
        let v1 = Var::from_idx(1);
        let v2 = Var::from_idx(2);
        let s = strat_from_lfut(&[v1.pos_lit(), v2.neg_lit()]);
        assert_eq!(s, vec![(v1, Fmlas::TRUE), (v2, Fmlas::FALSE)]);
    }

    #[test]
    fn merge_keeps_disjoint_and_ites_shared() {
        let mut f = Fmlas::new();
        let x = f.var("x");
        let v1 = Var::from_idx(1);
        let v2 = Var::from_idx(2);
        let v3 = Var::from_idx(3);
        let s1: Strategy = vec![(v1, Fmlas::TRUE), (v2, Fmlas::TRUE)];
        let s2: Strategy = vec![(v2, Fmlas::FALSE), (v3, Fmlas::FALSE)];
        let merged = merge_strats(&mut f, &s1, &s2, x);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0], (v1, Fmlas::TRUE));
        let (mv, mf) = merged[1];
        assert_eq!(mv, v2);
        // The shared entry branches on the resolvent: ITE(x, true, false).
        for vx in [false, true] {
            let lookup = move |n: &str| if n == "x" { Some(vx) } else { None };
            assert_eq!(f.eval_with(mf, &lookup), Some(vx));
        }
        assert_eq!(merged[2], (v3, Fmlas::FALSE));
    }
}
