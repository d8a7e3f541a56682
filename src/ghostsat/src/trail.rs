//! Chronological assignment trail.
//!
//! One decision ("chosen") literal opens each decision level; every literal
//! forced at that level lands on the level's undo list. Assignments carry a
//! chronological timestamp; conflict analysis walks timestamps, never the
//! undo lists. Level 0 is opened by the sentinel literal, which is assigned
//! forever.

use crate::lit::Lit;
use crate::sequent::SeqId;

/// Decision level of an unassigned literal.
pub const NO_LEVEL: u32 = u32::MAX >> 1;
/// Timestamp of an unassigned literal.
pub const NO_CHRONO: u32 = u32::MAX >> 1;

#[derive(Debug, Default)]
pub struct Trail {
    /// Decision literal per level; index 0 holds the sentinel.
    pub chlits: Vec<Lit>,
    /// Undo list per level; entry 0 is the decision itself.
    undo: Vec<Vec<Lit>>,
    dl: Vec<u32>,
    chrono: Vec<u32>,
    chrono_to_lit: Vec<Lit>,
    /// Antecedent sequent per literal; `None` for decisions.
    pub dep: Vec<Option<SeqId>>,
    pub cur_chrono: u32,
    /// Monotone backtrack-step counter, used to invalidate watch-scan
    /// resume points.
    pub num_step_bt: u64,
}

impl Trail {
    pub fn new(num_lits: usize) -> Trail {
        let mut t = Trail {
            chlits: vec![],
            undo: vec![],
            dl: vec![],
            chrono: vec![],
            chrono_to_lit: vec![],
            dep: vec![],
            cur_chrono: 0,
            num_step_bt: 1,
        };
        t.ensure_lits(num_lits);
        // The sentinel is a permanent level-0 assignment.
        t.chlits.push(Lit::UNDEF);
        t.undo.push(vec![Lit::UNDEF]);
        t.dl[Lit::UNDEF.idx() as usize] = 0;
        t.chrono[Lit::UNDEF.idx() as usize] = 0;
        t.chrono_to_lit.push(Lit::UNDEF);
        t
    }

    pub fn ensure_lits(&mut self, num_lits: usize) {
        if self.dl.len() < num_lits {
            self.dl.resize(num_lits, NO_LEVEL);
            self.chrono.resize(num_lits, NO_CHRONO);
            self.dep.resize(num_lits, None);
            self.chrono_to_lit.resize(num_lits + 1, Lit::UNDEF);
        }
    }

    #[inline]
    pub fn has_lit(&self, l: Lit) -> bool {
        self.dl[l.idx() as usize] != NO_LEVEL
    }

    #[inline]
    pub fn has_either(&self, l: Lit) -> bool {
        self.has_lit(l) || self.has_lit(!l)
    }

    /// Decision level of an assigned literal; `NO_LEVEL` otherwise.
    #[inline]
    pub fn dl_of(&self, l: Lit) -> u32 {
        self.dl[l.idx() as usize]
    }

    #[inline]
    pub fn chrono_of(&self, l: Lit) -> u32 {
        self.chrono[l.idx() as usize]
    }

    #[inline]
    pub fn lit_at_chrono(&self, c: u32) -> Lit {
        self.chrono_to_lit[c as usize]
    }

    #[inline]
    pub fn cur_dl(&self) -> u32 {
        (self.chlits.len() - 1) as u32
    }

    #[inline]
    pub fn last_chlit(&self) -> Lit {
        *self.chlits.last().expect("sentinel level")
    }

    #[inline]
    pub fn chlit_at(&self, dl: u32) -> Lit {
        self.chlits[dl as usize]
    }

    pub fn is_chlit(&self, l: Lit) -> bool {
        let d = self.dl_of(l);
        d != NO_LEVEL && self.chlit_at(d) == l
    }

    pub fn dep_of(&self, l: Lit) -> Option<SeqId> {
        self.dep[l.idx() as usize]
    }

    /// Chronologically latest assigned literal of a set.
    pub fn chrono_last(&self, lits: &[Lit]) -> Lit {
        let mut best = Lit::UNDEF;
        let mut best_c = 0u32;
        for &l in lits {
            let c = self.chrono_of(l);
            debug_assert_ne!(c, NO_CHRONO);
            if best == Lit::UNDEF || c > best_c {
                best = l;
                best_c = c;
            }
        }
        best
    }

    /// Opens a new decision level with `l`.
    pub fn append_chlit(&mut self, l: Lit) {
        debug_assert!(!self.has_either(l), "deciding an assigned literal");
        debug_assert!(self.dep_of(l).is_none());
        self.cur_chrono += 1;
        let ix = l.idx() as usize;
        self.dl[ix] = self.chlits.len() as u32;
        self.chrono[ix] = self.cur_chrono;
        self.set_chrono_lit(self.cur_chrono, l);
        self.chlits.push(l);
        self.undo.push(vec![l]);
    }

    /// Forced assignment at the current decision level. The caller records
    /// the antecedent and in-use bookkeeping.
    pub fn append_forced(&mut self, l: Lit) {
        debug_assert!(!self.has_either(l), "forcing an assigned literal");
        self.cur_chrono += 1;
        let ix = l.idx() as usize;
        self.dl[ix] = self.cur_dl();
        self.chrono[ix] = self.cur_chrono;
        self.set_chrono_lit(self.cur_chrono, l);
        let dl = self.cur_dl() as usize;
        self.undo[dl].push(l);
    }

    fn set_chrono_lit(&mut self, c: u32, l: Lit) {
        let ix = c as usize;
        if self.chrono_to_lit.len() <= ix {
            self.chrono_to_lit.resize(ix + 1, Lit::UNDEF);
        }
        self.chrono_to_lit[ix] = l;
    }

    /// Pops the top decision level, returning the decision and its undo
    /// list. The caller unassigns each literal via `unassign`.
    pub fn take_top_level(&mut self) -> (Lit, Vec<Lit>) {
        debug_assert!(self.cur_dl() > 0, "cannot pop the sentinel level");
        self.num_step_bt += 1;
        let chlit = self.chlits.pop().expect("level");
        let undo = self.undo.pop().expect("level");
        debug_assert_eq!(undo[0], chlit);
        (chlit, undo)
    }

    pub fn unassign(&mut self, l: Lit) {
        let ix = l.idx() as usize;
        debug_assert_ne!(self.dl[ix], NO_LEVEL);
        self.dl[ix] = NO_LEVEL;
        self.chrono[ix] = NO_CHRONO;
        self.cur_chrono -= 1;
    }

    /// Undo list of the current level (read-only view).
    pub fn cur_undo(&self) -> &[Lit] {
        self.undo.last().expect("sentinel level")
    }

    pub fn undo_at(&self, dl: u32) -> &[Lit] {
        &self.undo[dl as usize]
    }

    /// All assigned literals, outermost level first.
    pub fn all_assigned(&self) -> impl Iterator<Item = Lit> + '_ {
        self.undo.iter().flatten().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lit::Var;

    fn lit(v: u32, neg: bool) -> Lit {
        Lit::new(Var::from_idx(v), neg)
    }

    #[test]
    fn sentinel_is_permanently_assigned() {
        let t = Trail::new(32);
        assert!(t.has_lit(Lit::UNDEF));
        assert_eq!(t.dl_of(Lit::UNDEF), 0);
        assert_eq!(t.cur_dl(), 0);
        assert_eq!(t.last_chlit(), Lit::UNDEF);
    }

    #[test]
    fn decide_force_backtrack() {
        let mut t = Trail::new(32);
        let d = lit(1, false);
        let f = lit(2, true);
        t.append_chlit(d);
        assert_eq!(t.cur_dl(), 1);
        assert!(t.is_chlit(d));
        t.append_forced(f);
        assert!(!t.is_chlit(f));
        assert_eq!(t.dl_of(f), 1);
        assert!(t.chrono_of(f) > t.chrono_of(d));
        assert_eq!(t.chrono_last(&[d, f]), f);

        let (chlit, undo) = t.take_top_level();
        assert_eq!(chlit, d);
        assert_eq!(undo, vec![d, f]);
        for l in undo.into_iter().rev() {
            t.unassign(l);
        }
        assert!(!t.has_either(d));
        assert!(!t.has_either(f));
        assert_eq!(t.cur_dl(), 0);
        assert_eq!(t.cur_chrono, 0);
    }

    #[test]
    fn no_lit_has_both_polarities() {
        let mut t = Trail::new(32);
        let d = lit(3, false);
        t.append_chlit(d);
        assert!(t.has_lit(d));
        assert!(!t.has_lit(!d));
        assert!(t.has_either(!d));
    }
}
