//! Game-state sequents and their store.
//!
//! A sequent (Lnow, Lfut, F) says: once every literal of Lnow is assigned
//! true and no Lfut literal has been falsified, the formula F names the
//! winner's response. Each live sequent owns two required watches drawn from
//! Lnow and at most one reserved watch drawn from Lfut. The store keeps a
//! per-literal index of watching sequents as a vector of ids with
//! tombstones; slots are never reused, so a sequent id stays valid as a
//! historical key after deletion.

use std::collections::BTreeSet;

use smallvec::SmallVec;

use crate::fmla::FmlaRef;
use crate::lit::Lit;

pub type SeqId = u32;

pub const LRN_TYPE_INIT: u8 = 0;
pub const LRN_TYPE_1: u8 = 1;
pub const LRN_TYPE_2: u8 = 2;

#[derive(Debug, Clone)]
pub struct Sequent {
    pub id: SeqId,
    /// Constant true/false for a player win, or the winner's response
    /// formula over the free variables.
    pub free_fmla: FmlaRef,
    pub lrn_type: u8,
    pub is_learned: bool,
    /// Ghost output literal for gate-definition sequents.
    pub glit_defd: Lit,
    /// Path mask; nonzero while an implied literal is on the trail.
    pub in_use: u32,
    pub last_use: u64,
    pub activity: f64,
    pub num_fixes: u64,
    /// Lnow, strictly sorted.
    pub req_lits: SmallVec<[Lit; 8]>,
    /// Lfut, strictly sorted.
    pub imp_lits: SmallVec<[Lit; 4]>,
    /// Required watches; `Lit::UNDEF` slots are vacant.
    pub watch_req: [Lit; 2],
    /// Reserved watch; `Lit::UNDEF` when unset.
    pub watch_res: Lit,
    pub it_watch_req: [u32; 2],
    pub it_watch_res: u32,
    /// Scan resume point for watch replacement within one backtrack epoch.
    pub wat_start_pos: usize,
    pub wat_stop_bt: u64,
}

impl Sequent {
    pub fn new(id: SeqId, free_fmla: FmlaRef) -> Sequent {
        Sequent {
            id,
            free_fmla,
            lrn_type: LRN_TYPE_INIT,
            is_learned: false,
            glit_defd: Lit::UNDEF,
            in_use: 0,
            last_use: 0,
            activity: 0.0,
            num_fixes: 0,
            req_lits: SmallVec::new(),
            imp_lits: SmallVec::new(),
            watch_req: [Lit::UNDEF; 2],
            watch_res: Lit::UNDEF,
            it_watch_req: [0; 2],
            it_watch_res: 0,
            wat_start_pos: 0,
            wat_stop_bt: 0,
        }
    }

    pub fn adjusted_activity(&self) -> f64 {
        self.activity
    }

    /// True when `other`'s Lnow is a subset of this sequent's Lnow.
    pub fn is_subsumed_by(&self, other: &Sequent) -> bool {
        if self.req_lits.len() < other.req_lits.len() {
            return false;
        }
        let mut mine = self.req_lits.iter();
        'outer: for &l in &other.req_lits {
            for &m in mine.by_ref() {
                if m == l {
                    continue 'outer;
                }
                if m > l {
                    return false;
                }
            }
            return false;
        }
        true
    }
}

const NONE: SeqId = SeqId::MAX;

#[derive(Debug, Default, Clone)]
struct WatchList {
    arr: Vec<SeqId>,
    num_blanks: usize,
}

#[derive(Debug, Default)]
pub struct SequentDb {
    pub seqs: Vec<Option<Sequent>>,
    watch: Vec<WatchList>,
    /// All sequents ever registered with a given Lnow literal (historical;
    /// consumers skip dead ids). Used for redundancy checks and debugging.
    pub lit_have: Vec<Vec<SeqId>>,
    /// Learned sequents that are candidates for deletion.
    pub temp_learnts: BTreeSet<SeqId>,
    pub num_learnt_locked: i64,
    pub num_watch_cleanups: u64,
}

impl SequentDb {
    pub fn new() -> SequentDb {
        let mut db = SequentDb::default();
        // Slot 0 is reserved so ids are never zero.
        db.seqs.push(None);
        db
    }

    pub fn num_slots(&self) -> usize {
        self.seqs.len()
    }

    pub fn ensure_lit_tables(&mut self, num_lits: usize) {
        if self.watch.len() < num_lits {
            self.watch.resize(num_lits, WatchList::default());
            self.lit_have.resize(num_lits, vec![]);
        }
    }

    pub fn alloc(&mut self, free_fmla: FmlaRef) -> SeqId {
        let id = self.seqs.len() as SeqId;
        self.seqs.push(Some(Sequent::new(id, free_fmla)));
        id
    }

    #[inline]
    pub fn get(&self, id: SeqId) -> &Sequent {
        self.seqs[id as usize].as_ref().expect("dead sequent")
    }

    #[inline]
    pub fn get_mut(&mut self, id: SeqId) -> &mut Sequent {
        self.seqs[id as usize].as_mut().expect("dead sequent")
    }

    #[inline]
    pub fn is_live(&self, id: SeqId) -> bool {
        self.seqs[id as usize].is_some()
    }

    /// Live sequents watching `lit`, in index order.
    pub fn watchers_of(&self, lit: Lit) -> Vec<SeqId> {
        self.watch[lit.idx() as usize]
            .arr
            .iter()
            .copied()
            .filter(|&s| s != NONE)
            .collect()
    }

    pub fn watch_insert(&mut self, lit: Lit, sid: SeqId) -> u32 {
        let ix = lit.idx() as usize;
        let (num_good, num_blanks) = {
            let w = &self.watch[ix];
            (w.arr.len() - w.num_blanks, w.num_blanks)
        };
        if num_blanks > 0 && (num_good == 0 || num_blanks > 4 + num_good) {
            self.compact_watch(lit);
        }
        let w = &mut self.watch[ix];
        w.arr.push(sid);
        (w.arr.len() - 1) as u32
    }

    pub fn watch_erase(&mut self, lit: Lit, pos: u32, sid: SeqId) {
        let w = &mut self.watch[lit.idx() as usize];
        debug_assert_eq!(w.arr[pos as usize], sid);
        w.arr[pos as usize] = NONE;
        w.num_blanks += 1;
        while w.arr.last() == Some(&NONE) {
            w.arr.pop();
            w.num_blanks -= 1;
        }
    }

    /// Removes tombstones, updating each moved sequent's stored position.
    fn compact_watch(&mut self, lit: Lit) {
        self.num_watch_cleanups += 1;
        let ix = lit.idx() as usize;
        let old = std::mem::take(&mut self.watch[ix].arr);
        let mut new_arr = Vec::with_capacity(old.len());
        for sid in old {
            if sid == NONE {
                continue;
            }
            let pos = new_arr.len() as u32;
            new_arr.push(sid);
            let seq = self.get_mut(sid);
            if seq.watch_req[0] == lit {
                seq.it_watch_req[0] = pos;
            } else if seq.watch_req[1] == lit {
                seq.it_watch_req[1] = pos;
            } else if seq.watch_res == lit {
                seq.it_watch_res = pos;
            }
        }
        let w = &mut self.watch[ix];
        w.arr = new_arr;
        w.num_blanks = 0;
    }

    /// Registers the sequent in the historical Lnow index.
    pub fn register_lits_have(&mut self, sid: SeqId) {
        let lits: Vec<Lit> = self.get(sid).req_lits.iter().copied().collect();
        for l in lits {
            self.lit_have[l.idx() as usize].push(sid);
        }
    }

    /// Inserts the watch-list entries for the current watch fields.
    pub fn attach_watches(&mut self, sid: SeqId) {
        let (w0, w1, res) = {
            let s = self.get(sid);
            (s.watch_req[0], s.watch_req[1], s.watch_res)
        };
        for (i, w) in [w0, w1].iter().enumerate() {
            if *w == Lit::UNDEF {
                continue;
            }
            let pos = self.watch_insert(*w, sid);
            self.get_mut(sid).it_watch_req[i] = pos;
        }
        if res != Lit::UNDEF {
            let pos = self.watch_insert(res, sid);
            self.get_mut(sid).it_watch_res = pos;
        }
    }

    pub fn erase_watches(&mut self, sid: SeqId) {
        let (w, pos, res, res_pos) = {
            let s = self.get(sid);
            (s.watch_req, s.it_watch_req, s.watch_res, s.it_watch_res)
        };
        for i in 0..2 {
            if w[i] != Lit::UNDEF {
                self.watch_erase(w[i], pos[i], sid);
            }
        }
        {
            let s = self.get_mut(sid);
            s.watch_req = [Lit::UNDEF; 2];
        }
        if res != Lit::UNDEF {
            self.watch_erase(res, res_pos, sid);
            self.get_mut(sid).watch_res = Lit::UNDEF;
        }
    }

    /// Moves required watch slot `i_old` from its current literal to
    /// `new_lit`.
    pub fn move_req_watch(&mut self, sid: SeqId, i_old: usize, new_lit: Lit) {
        let (old_lit, old_pos) = {
            let s = self.get(sid);
            (s.watch_req[i_old], s.it_watch_req[i_old])
        };
        self.watch_erase(old_lit, old_pos, sid);
        let pos = self.watch_insert(new_lit, sid);
        let s = self.get_mut(sid);
        s.watch_req[i_old] = new_lit;
        s.it_watch_req[i_old] = pos;
    }

    /// Points the reserved watch at `new_lit` (which may be `Lit::UNDEF`).
    pub fn move_res_watch(&mut self, sid: SeqId, new_lit: Lit) {
        let (old, old_pos) = {
            let s = self.get(sid);
            (s.watch_res, s.it_watch_res)
        };
        if old == new_lit {
            return;
        }
        if old != Lit::UNDEF {
            self.watch_erase(old, old_pos, sid);
        }
        if new_lit != Lit::UNDEF {
            let pos = self.watch_insert(new_lit, sid);
            let s = self.get_mut(sid);
            s.watch_res = new_lit;
            s.it_watch_res = pos;
        } else {
            self.get_mut(sid).watch_res = Lit::UNDEF;
        }
    }

    /// Frees a learned sequent. The slot is retired, not reused.
    pub fn free(&mut self, sid: SeqId) {
        debug_assert_eq!(self.get(sid).in_use, 0, "freeing an in-use sequent");
        self.erase_watches(sid);
        self.temp_learnts.remove(&sid);
        self.seqs[sid as usize] = None;
    }

    /// Live sequents whose Lnow subsumes the given sequent's Lnow;
    /// a debugging aid.
    pub fn subsumption_candidates(&self, sid: SeqId) -> Vec<SeqId> {
        let me = self.get(sid);
        let first = match me.req_lits.first() {
            Some(&l) => l,
            None => return vec![],
        };
        let mut found = vec![];
        for &other in &self.lit_have[first.idx() as usize] {
            if other == sid || !self.is_live(other) {
                continue;
            }
            if me.is_subsumed_by(self.get(other)) {
                found.push(other);
            }
        }
        found
    }

    /// Median adjusted activity among deletable learned sequents.
    pub fn median_deletable_activity(&self) -> f64 {
        let mut acts: Vec<f64> = self
            .temp_learnts
            .iter()
            .filter_map(|&sid| self.seqs[sid as usize].as_ref())
            .filter(|s| s.in_use == 0)
            .map(|s| s.adjusted_activity())
            .collect();
        if acts.is_empty() {
            return 0.0;
        }
        acts.sort_by(|a, b| a.partial_cmp(b).expect("activity is not NaN"));
        acts[acts.len() / 2]
    }

    /// Rescales every live sequent's activity.
    pub fn scale_activities(&mut self, factor: f64) {
        for s in self.seqs.iter_mut().flatten() {
            s.activity *= factor;
        }
    }

    /// Prints nothing; sanity helper returning all live watch fields of a
    /// sequent drawn from its own literal sets (testable property).
    pub fn watch_fields_consistent(&self, sid: SeqId) -> bool {
        let s = self.get(sid);
        for w in s.watch_req.iter().filter(|&&w| w != Lit::UNDEF) {
            if !s.req_lits.contains(w) {
                return false;
            }
        }
        if s.watch_req[0] != Lit::UNDEF
            && s.watch_req[0] == s.watch_req[1]
        {
            return false;
        }
        if s.watch_res != Lit::UNDEF && !s.imp_lits.contains(&s.watch_res) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmla::Fmlas;
    use crate::lit::Var;

    fn lit(v: u32, neg: bool) -> Lit {
        Lit::new(Var::from_idx(v), neg)
    }

    fn new_db() -> SequentDb {
        let mut db = SequentDb::new();
        db.ensure_lit_tables(64);
        db
    }

    #[test]
    fn ids_are_stable_and_slots_retired() {
        let mut db = new_db();
        let a = db.alloc(Fmlas::TRUE);
        let b = db.alloc(Fmlas::FALSE);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        db.free(a);
        assert!(!db.is_live(a));
        assert!(db.is_live(b));
        let c = db.alloc(Fmlas::TRUE);
        assert_eq!(c, 3, "slots are not reused");
    }

    #[test]
    fn watch_insert_erase_and_compaction() {
        let mut db = new_db();
        let l = lit(3, false);
        let mut ids = vec![];
        for _ in 0..8 {
            let sid = db.alloc(Fmlas::TRUE);
            {
                let s = db.get_mut(sid);
                s.req_lits.push(l);
                s.watch_req[0] = l;
            }
            let pos = db.watch_insert(l, sid);
            db.get_mut(sid).it_watch_req[0] = pos;
            ids.push(sid);
        }
        // Erase all but the last; the blanks outnumber the survivors, so
        // the next insert compacts and patches stored positions.
        for &sid in &ids[..7] {
            let pos = db.get(sid).it_watch_req[0];
            db.watch_erase(l, pos, sid);
        }
        assert_eq!(db.watchers_of(l), vec![ids[7]]);
        let sid = db.alloc(Fmlas::TRUE);
        {
            let s = db.get_mut(sid);
            s.req_lits.push(l);
            s.watch_req[0] = l;
        }
        let pos = db.watch_insert(l, sid);
        db.get_mut(sid).it_watch_req[0] = pos;
        assert!(db.num_watch_cleanups > 0, "compaction ran");
        assert_eq!(db.watchers_of(l), vec![ids[7], sid]);
        assert_eq!(db.get(ids[7]).it_watch_req[0], 0);
        assert_eq!(db.get(sid).it_watch_req[0], 1);
    }

    #[test]
    fn subsumption_candidates_found() {
        let mut db = new_db();
        let a = db.alloc(Fmlas::TRUE);
        {
            let s = db.get_mut(a);
            s.req_lits.extend_from_slice(&[lit(1, false), lit(2, false)]);
        }
        db.register_lits_have(a);
        let b = db.alloc(Fmlas::TRUE);
        {
            let s = db.get_mut(b);
            s.req_lits
                .extend_from_slice(&[lit(1, false), lit(2, false), lit(3, true)]);
        }
        db.register_lits_have(b);
        assert_eq!(db.subsumption_candidates(b), vec![a]);
        assert!(db.subsumption_candidates(a).is_empty());
    }

    #[test]
    fn median_ignores_in_use() {
        let mut db = new_db();
        let mut ids = vec![];
        for i in 0..4 {
            let sid = db.alloc(Fmlas::TRUE);
            db.get_mut(sid).activity = i as f64;
            db.get_mut(sid).is_learned = true;
            db.temp_learnts.insert(sid);
            ids.push(sid);
        }
        db.get_mut(ids[3]).in_use = 1;
        // Deletable activities: 0, 1, 2 -> median 1.
        assert_eq!(db.median_deletable_activity(), 1.0);
    }
}
