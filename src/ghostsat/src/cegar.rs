//! CEGAR gate synthesis.
//!
//! After selected conflicts the solver replays the winner's commitment at
//! level zero and rewrites the circuit under it: literals outside the
//! elimination block pass through, literals in the block are pinned, and
//! literals inner to it get fresh variables two blocks outer. Gates fold
//! constants, drop duplicates, detect contradictions, and intern as new
//! gates when their argument set changed. A non-trivial restricted output
//! yields a learned sequent generalizing the conflict, plus ordinary
//! definition sequents for every synthesized gate.

use std::collections::HashMap;

use log::debug;

use crate::error::{Result, SolverError};
use crate::lit::{Lit, Ply};
use crate::prefix::QType;
use crate::sequent::SeqId;
use crate::solver::Solver;

/// A literal of the restricted circuit: a constant or a live literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RLit {
    False,
    True,
    L(Lit),
}

impl RLit {
    fn neg(self) -> RLit {
        match self {
            RLit::False => RLit::True,
            RLit::True => RLit::False,
            RLit::L(l) => RLit::L(!l),
        }
    }
}

impl Solver {
    pub(crate) fn has_more_vars(&self) -> bool {
        self.ckt.num_vars() + 4 < self.ckt.var_limit
    }

    /// Input literals forced by polarity: an input that occurs in a single
    /// polarity in the live cone of the output can be fixed to the owning
    /// player's preferred value.
    fn mono_forced_lits(&self) -> Vec<Lit> {
        if self.conflict.is_some() {
            return vec![];
        }
        let n_lits = self.ckt.num_vars() as usize * 2;
        let mut pos = vec![0i8; n_lits];
        pos[self.ckt.out_lit.idx() as usize] = 1;
        for gid in (0..self.ckt.gates.len()).rev() {
            let (ga, ge, args) = {
                let g = &self.ckt.gates[gid];
                (
                    g.ghosts[Ply::A.index()].pos_lit(),
                    g.ghosts[Ply::E.index()].pos_lit(),
                    g.args.clone(),
                )
            };
            if self.trail.has_lit(ga) && self.trail.has_lit(ge) {
                continue;
            }
            if self.trail.has_lit(!ga) && self.trail.has_lit(!ge) {
                continue;
            }
            let live_pos = pos[ga.idx() as usize] == 1;
            let live_neg = pos[(!ga).idx() as usize] == 1;
            for &a in &args {
                if live_pos {
                    pos[a.idx() as usize] = 1;
                }
                if live_neg {
                    pos[(!a).idx() as usize] = 1;
                }
            }
            if !live_pos {
                pos[ga.idx() as usize] = -1;
            }
            if !live_neg {
                pos[(!ga).idx() as usize] = -1;
            }
        }
        let mut forced = vec![];
        for vix in 1..=self.ckt.n_orig_inputs {
            let l = crate::lit::Var::from_idx(vix).pos_lit();
            if self.trail.has_either(l) {
                continue;
            }
            for lit in [l, !l] {
                if pos[lit.idx() as usize] == 1 && pos[(!lit).idx() as usize] != 1 {
                    let flit = match self.ckt.qtype_of_lit(lit) {
                        Some(QType::Exists) => lit,
                        Some(QType::Forall) => !lit,
                        _ => continue,
                    };
                    forced.push(flit);
                    break;
                }
            }
        }
        forced
    }

    /// Replays the commitment literals at level zero, runs monotone
    /// seeding, records the full assignment into `hit`, and restricts the
    /// output gate. Always leaves the trail restarted.
    fn cegar_extend(
        &mut self,
        asgn_lits: &[Lit],
        hit: &mut HashMap<Lit, RLit>,
        elim_qb: u16,
    ) -> Result<RLit> {
        debug_assert_eq!(self.trail.cur_dl(), 0);
        debug_assert_eq!(self.min_prop_qb, 0);
        let ret = self.cegar_extend_inner(asgn_lits, hit, elim_qb);
        self.restart();
        self.min_prop_qb = 0;
        self.in_cegar = false;
        let fresh = std::mem::take(&mut self.temp_new_seqs);
        for sid in fresh {
            if self.db.is_live(sid) {
                self.simp_fix_watch(sid);
            }
        }
        ret
    }

    fn cegar_extend_inner(
        &mut self,
        asgn_lits: &[Lit],
        hit: &mut HashMap<Lit, RLit>,
        elim_qb: u16,
    ) -> Result<RLit> {
        let mut reps: Vec<Lit> = asgn_lits.to_vec();
        reps.sort_unstable();
        for l in reps {
            if self.trail.has_lit(!l) {
                if !self.warned.cegar_seed_clash {
                    self.warned.cegar_seed_clash = true;
                    debug!("cegar seed literal already falsified");
                }
                return Ok(RLit::False);
            }
            if self.trail.has_lit(l) {
                continue;
            }
            if self.conflict.is_some() {
                break;
            }
            debug_assert!(self.min_prop_qb <= self.ckt.qb.of_lit(l));
            self.min_prop_qb = self.ckt.qb.of_lit(l);
            self.trail.append_chlit(l);
            self.sched_for_prop(l);
            self.propagate();
        }

        self.in_cegar = true;

        if self.opts.use_monotone {
            self.min_prop_qb = elim_qb;
            loop {
                let mut any = false;
                for flit in self.mono_forced_lits() {
                    if self.conflict.is_some() {
                        break;
                    }
                    if self.trail.has_either(flit)
                        || self.min_prop_qb > self.ckt.qb.of_lit(flit)
                    {
                        continue;
                    }
                    self.trail.append_chlit(flit);
                    self.sched_for_prop(flit);
                    self.propagate();
                    any = true;
                }
                if !any || self.conflict.is_some() {
                    break;
                }
            }
        }
        self.min_prop_qb = 0;

        let assigned: Vec<Lit> = self.trail.all_assigned().collect();
        for l in assigned {
            if l == Lit::UNDEF {
                continue;
            }
            if self.ckt.is_input(l.var()) {
                hit.insert(l, RLit::True);
                hit.insert(!l, RLit::False);
            }
        }
        if self.conflict.is_some() {
            return Ok(RLit::False);
        }
        self.restrict(self.ckt.out_lit, hit, elim_qb)
    }

    /// Rewrites one gate literal under the pinned assignment.
    pub(crate) fn restrict(
        &mut self,
        glit: Lit,
        hit: &mut HashMap<Lit, RLit>,
        elim_qb: u16,
    ) -> Result<RLit> {
        if let Some(&r) = hit.get(&glit) {
            return Ok(r);
        }
        if self.ckt.is_input(glit.var()) {
            let q = self.ckt.qb.of_lit(glit);
            let ret = if q < elim_qb {
                RLit::L(glit)
            } else if q == elim_qb {
                RLit::False
            } else {
                let nv = self.ckt.new_cegar_input(glit.var())?;
                self.register_new_vars();
                self.insert_var_order(nv);
                debug!(
                    "new restriction input {} from {}",
                    self.ckt.lit_name(nv.pos_lit()),
                    self.ckt.lit_name(glit)
                );
                RLit::L(Lit::new(nv, glit.sign()))
            };
            hit.insert(glit, ret);
            hit.insert(!glit, ret.neg());
            return Ok(ret);
        }
        if glit.sign() {
            // OR view of the gate.
            let inner = self.restrict(!glit, hit, elim_qb)?;
            return Ok(inner.neg());
        }
        let (gate, _) = self.ckt.gate_of(glit.var()).expect("gate literal");
        let args = self.ckt.gates[gate as usize].args.clone();
        let mut ret = None;
        for &a in &args {
            if hit.get(&a) == Some(&RLit::False) {
                ret = Some(RLit::False);
                break;
            }
        }
        if ret.is_none() {
            let mut new_args: Vec<Lit> = vec![];
            let mut is_diff = false;
            let mut folded = None;
            for &a in &args {
                match self.restrict(a, hit, elim_qb)? {
                    RLit::False => {
                        folded = Some(RLit::False);
                        break;
                    }
                    RLit::True => {
                        is_diff = true;
                    }
                    RLit::L(l) => {
                        if l != a {
                            is_diff = true;
                        }
                        new_args.push(l);
                    }
                }
            }
            ret = Some(match folded {
                Some(f) => f,
                None => {
                    if new_args.is_empty() {
                        RLit::True
                    } else {
                        new_args.sort_unstable();
                        new_args.dedup();
                        let contradiction = new_args
                            .windows(2)
                            .any(|w| w[0] == !w[1]);
                        if contradiction {
                            RLit::False
                        } else if new_args.len() == 1 {
                            RLit::L(new_args[0])
                        } else if !is_diff {
                            RLit::L(glit)
                        } else {
                            RLit::L(self.new_conj(glit, new_args)?)
                        }
                    }
                }
            });
        }
        let ret = ret.expect("restriction result");
        debug_assert!(!hit.contains_key(&glit));
        hit.insert(glit, ret);
        hit.insert(!glit, ret.neg());
        Ok(ret)
    }

    /// Interns a synthesized conjunction, reusing an existing gate with the
    /// same argument set.
    fn new_conj(&mut self, orig: Lit, args: Vec<Lit>) -> Result<Lit> {
        debug_assert!(!orig.sign());
        debug_assert!(args.len() >= 2);
        if let Some(&l) = self.args_to_gate.get(&args) {
            return Ok(l);
        }
        let gate = self.ckt.new_cegar_gate(args, &mut self.fmlas)?;
        self.register_new_vars();
        let ghosts = self.ckt.gates[gate as usize].ghosts;
        for v in ghosts {
            self.insert_var_order(v);
        }
        self.new_defn_gs(gate);
        let out = ghosts[Ply::A.index()].pos_lit();
        debug!(
            "new restriction gate {} from {}",
            self.ckt.lit_name(out),
            self.ckt.lit_name(orig)
        );
        Ok(out)
    }

    /// The whole CEGAR episode: pin the elimination block, restrict, and
    /// learn a sequent encoding the winner's commitment against the
    /// opponent's residual circuit.
    pub(crate) fn augment(
        &mut self,
        asgn_lits: &[Lit],
        hit: &mut HashMap<Lit, RLit>,
        elim_qb: u16,
    ) -> Result<Option<SeqId>> {
        let winr = self
            .ckt
            .prefix
            .qtype(elim_qb)
            .and_then(|q| q.ply())
            .ok_or(SolverError::Internal("elimination block has no owner"))?;
        for &l in asgn_lits {
            debug_assert!(self.ckt.qb.of_lit(l) <= elim_qb);
            if self.ckt.qb.of_lit(l) == elim_qb {
                hit.insert(l, RLit::True);
                hit.insert(!l, RLit::False);
            }
        }
        let new_out = self.cegar_extend(asgn_lits, hit, elim_qb)?;
        let frob = if winr == Ply::E { new_out } else { new_out.neg() };
        let out = match frob {
            RLit::False => {
                if !self.warned.cegar_opponent_won {
                    self.warned.cegar_opponent_won = true;
                    debug!("opposing player won during restriction");
                }
                return Ok(None);
            }
            RLit::True => {
                if !self.warned.cegar_true_out {
                    self.warned.cegar_true_out = true;
                    debug!("restriction collapsed to the winner's constant");
                }
                return Ok(None);
            }
            RLit::L(l) => l,
        };

        let losr_out = if self.ckt.is_input(out.var()) {
            out
        } else {
            self.ckt.ghost_or_pass(out, winr.opponent())
        };

        let mut entry: Vec<Lit> = vec![losr_out];
        for (&k, &v) in hit.iter() {
            if v != RLit::True {
                continue;
            }
            if elim_qb <= self.ckt.qb.of_lit(k) {
                continue;
            }
            entry.push(k);
        }
        entry.sort_unstable();
        if self.ceg_lrn_set.contains(&entry) {
            return Ok(None);
        }
        self.ceg_lrn_set.insert(entry);

        let mut winr_guard: Vec<Lit> = asgn_lits
            .iter()
            .copied()
            .filter(|&l| self.ckt.qb.of_lit(l) != elim_qb)
            .collect();
        winr_guard.push(losr_out);
        let sid = self.new_lrn_gs_mixed(&winr_guard, winr);
        Ok(Some(sid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{BuildOpts, Circuit};
    use crate::fmla::Fmlas;
    use crate::lit::Var;
    use crate::parse::parse_ghostq;
    use crate::solver::SolverOpts;

    fn cegar_solver(src: &str) -> Solver {
        let parsed = parse_ghostq(src.as_bytes()).unwrap();
        let mut fmlas = Fmlas::new();
        let ckt = Circuit::build(
            &parsed,
            &mut fmlas,
            BuildOpts {
                allow_free: false,
                alloc_cegar_vars: true,
            },
        )
        .unwrap();
        let mut opts = SolverOpts::default();
        opts.allow_cegar = true;
        Solver::new(ckt, fmlas, opts)
    }

    #[test]
    fn restrict_detects_contradictions() {
        // 6 = and(2, 4); pinning nothing, the gate restricts to itself.
        let src = "CktQBF\nLastInputVar 4\nLastGateVar 6\nOutputGateLit 6\n\
            <q gate=6>\na 2\ne 4\n</q>\n6 = and(2, -4)\n";
        let mut s = cegar_solver(src);
        let out = s.ckt.out_lit;
        let mut hit = HashMap::new();
        // Map both inputs onto the same fresh literal with opposite signs:
        // the conjunction becomes x and -x, which must fold to false.
        let v1 = Var::from_idx(1);
        let v2 = Var::from_idx(2);
        hit.insert(v1.pos_lit(), RLit::L(v1.pos_lit()));
        hit.insert(v1.neg_lit(), RLit::L(v1.neg_lit()));
        hit.insert(v2.pos_lit(), RLit::L(v1.pos_lit()));
        hit.insert(v2.neg_lit(), RLit::L(v1.neg_lit()));
        let r = s.restrict(out, &mut hit, 1).unwrap();
        assert_eq!(r, RLit::False);
    }

    #[test]
    fn restrict_folds_pinned_gates() {
        let src = "CktQBF\nLastInputVar 4\nLastGateVar 6\nOutputGateLit 6\n\
            <q gate=6>\na 2\ne 4\n</q>\n6 = and(2, 4)\n";
        let mut s = cegar_solver(src);
        let out = s.ckt.out_lit;
        let v1 = Var::from_idx(1);
        let v2 = Var::from_idx(2);
        let mut hit = HashMap::new();
        hit.insert(v1.pos_lit(), RLit::True);
        hit.insert(v1.neg_lit(), RLit::False);
        hit.insert(v2.pos_lit(), RLit::True);
        hit.insert(v2.neg_lit(), RLit::False);
        let r = s.restrict(out, &mut hit, 2).unwrap();
        assert_eq!(r, RLit::True);
    }

    #[test]
    fn solving_with_cegar_matches_plain_answer() {
        let src = "CktQBF\nLastInputVar 6\nLastGateVar 10\nOutputGateLit 10\n\
            <q gate=10>\na 2\ne 4 6\n</q>\n\
            8 = or(2, 4)\n\
            10 = and(8, 6)\n";
        let mut s = cegar_solver(src);
        let fin = s.solve().unwrap();
        assert_eq!(s.outcome(fin), crate::solver::Outcome::True);
    }
}
