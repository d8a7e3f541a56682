//! Interned boolean formula DAG.
//!
//! Nodes live in an append-only arena and are deduplicated by structural
//! identity: two nodes with the same operator, the same arity and the same
//! child ids are the same node. `intern` folds constants and applies the
//! operator-specific simplifications before the cache lookup, so the arena
//! never contains `NOT(NOT x)`, single-argument AND/OR, or an AND/OR carrying
//! its identity constant.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::error::FmlaError;

/// Interned symbol id for variable names.
pub type Sym = u32;

pub type FmlaArgs = SmallVec<[FmlaRef; 3]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FmlaRef(u32);

impl FmlaRef {
    #[inline]
    pub fn idx(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FmlaOp {
    Error,
    Var,
    True,
    False,
    Not,
    And,
    Or,
    Ite,
    Eq,
    Impl,
    Xor,
    List,
    Exists,
    Forall,
    Free,
    Gseq,
    Subst,
    Resolve,
    NewEnv,
    Include,
}

impl FmlaOp {
    pub fn name(self) -> &'static str {
        match self {
            FmlaOp::Error => "error",
            FmlaOp::Var => "var",
            FmlaOp::True => "true",
            FmlaOp::False => "false",
            FmlaOp::Not => "not",
            FmlaOp::And => "and",
            FmlaOp::Or => "or",
            FmlaOp::Ite => "ite",
            FmlaOp::Eq => "eq",
            FmlaOp::Impl => "impl",
            FmlaOp::Xor => "xor",
            FmlaOp::List => "list",
            FmlaOp::Exists => "exists",
            FmlaOp::Forall => "forall",
            FmlaOp::Free => "free",
            FmlaOp::Gseq => "gseq",
            FmlaOp::Subst => "subst",
            FmlaOp::Resolve => "resolve",
            FmlaOp::NewEnv => "newenv",
            FmlaOp::Include => "include",
        }
    }

    pub fn from_name(name: &str) -> Option<FmlaOp> {
        let ops = [
            FmlaOp::True,
            FmlaOp::False,
            FmlaOp::Not,
            FmlaOp::And,
            FmlaOp::Or,
            FmlaOp::Ite,
            FmlaOp::Eq,
            FmlaOp::Impl,
            FmlaOp::Xor,
            FmlaOp::List,
            FmlaOp::Exists,
            FmlaOp::Forall,
            FmlaOp::Free,
            FmlaOp::Gseq,
            FmlaOp::Subst,
            FmlaOp::Resolve,
            FmlaOp::NewEnv,
            FmlaOp::Include,
        ];
        ops.iter().copied().find(|op| op.name().eq_ignore_ascii_case(name))
    }

    pub fn is_quant(self) -> bool {
        matches!(self, FmlaOp::Exists | FmlaOp::Forall | FmlaOp::Free)
    }
}

#[derive(Debug, Clone)]
struct Node {
    op: FmlaOp,
    /// Symbol id for `Var` nodes, 0 otherwise.
    name: Sym,
    args: FmlaArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    op: FmlaOp,
    name: Sym,
    args: FmlaArgs,
}

/// The arena of interned formulas.
#[derive(Debug)]
pub struct Fmlas {
    nodes: Vec<Node>,
    cache: HashMap<NodeKey, FmlaRef>,
    syms: Vec<String>,
    sym_ids: HashMap<String, Sym>,
}

impl Fmlas {
    pub const ERROR: FmlaRef = FmlaRef(0);
    pub const TRUE: FmlaRef = FmlaRef(1);
    pub const FALSE: FmlaRef = FmlaRef(2);

    pub fn new() -> Fmlas {
        let mut f = Fmlas {
            nodes: vec![],
            cache: HashMap::new(),
            syms: vec![String::new()],
            sym_ids: HashMap::new(),
        };
        let e = f.mk_node(FmlaOp::Error, 0, SmallVec::new());
        let t = f.mk_node(FmlaOp::True, 0, SmallVec::new());
        let fa = f.mk_node(FmlaOp::False, 0, SmallVec::new());
        debug_assert_eq!(e, Fmlas::ERROR);
        debug_assert_eq!(t, Fmlas::TRUE);
        debug_assert_eq!(fa, Fmlas::FALSE);
        f
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn mk_node(&mut self, op: FmlaOp, name: Sym, args: FmlaArgs) -> FmlaRef {
        let key = NodeKey {
            op,
            name,
            args: args.clone(),
        };
        if let Some(&r) = self.cache.get(&key) {
            return r;
        }
        let r = FmlaRef(self.nodes.len() as u32);
        self.nodes.push(Node { op, name, args });
        self.cache.insert(key, r);
        r
    }

    pub fn sym(&mut self, name: &str) -> Sym {
        if let Some(&s) = self.sym_ids.get(name) {
            return s;
        }
        let s = self.syms.len() as Sym;
        self.syms.push(name.to_string());
        self.sym_ids.insert(name.to_string(), s);
        s
    }

    pub fn sym_name(&self, s: Sym) -> &str {
        &self.syms[s as usize]
    }

    pub fn var(&mut self, name: &str) -> FmlaRef {
        let s = self.sym(name);
        self.var_of_sym(s)
    }

    pub fn var_of_sym(&mut self, s: Sym) -> FmlaRef {
        self.mk_node(FmlaOp::Var, s, SmallVec::new())
    }

    #[inline]
    pub fn op(&self, f: FmlaRef) -> FmlaOp {
        self.nodes[f.idx() as usize].op
    }

    #[inline]
    pub fn args(&self, f: FmlaRef) -> &[FmlaRef] {
        &self.nodes[f.idx() as usize].args
    }

    pub fn num_args(&self, f: FmlaRef) -> usize {
        self.args(f).len()
    }

    /// Symbol of a `Var` node.
    pub fn var_sym(&self, f: FmlaRef) -> Option<Sym> {
        let n = &self.nodes[f.idx() as usize];
        if n.op == FmlaOp::Var {
            Some(n.name)
        } else {
            None
        }
    }

    pub fn var_name(&self, f: FmlaRef) -> Option<&str> {
        self.var_sym(f).map(|s| self.sym_name(s))
    }

    /// A literal is a variable or a negated variable.
    pub fn is_lit(&self, f: FmlaRef) -> bool {
        match self.op(f) {
            FmlaOp::Var => true,
            FmlaOp::Not => self.op(self.args(f)[0]) == FmlaOp::Var,
            _ => false,
        }
    }

    pub fn var_of_lit(&self, f: FmlaRef) -> Option<FmlaRef> {
        match self.op(f) {
            FmlaOp::Var => Some(f),
            FmlaOp::Not if self.op(self.args(f)[0]) == FmlaOp::Var => Some(self.args(f)[0]),
            _ => None,
        }
    }

    fn check_arity(op: FmlaOp, n: usize) -> Result<(), FmlaError> {
        let ok = match op {
            FmlaOp::Not => n == 1,
            FmlaOp::Xor | FmlaOp::Resolve | FmlaOp::NewEnv | FmlaOp::Include => n >= 1,
            FmlaOp::Eq | FmlaOp::Impl | FmlaOp::Exists | FmlaOp::Forall | FmlaOp::Free => n == 2,
            FmlaOp::Ite | FmlaOp::Gseq => n == 3,
            FmlaOp::Var => false,
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(FmlaError::Arity { op: op.name(), given: n })
        }
    }

    /// Interns a node without the algebraic simplifications of `intern`, but
    /// still normalizing negation and rewriting `IMPL(a,b)` to `OR(-a,b)`.
    pub fn raw(&mut self, op: FmlaOp, args: &[FmlaRef]) -> Result<FmlaRef, FmlaError> {
        Self::check_arity(op, args.len())?;
        if op == FmlaOp::Gseq {
            if self.op(args[0]) != FmlaOp::List || self.op(args[1]) != FmlaOp::List {
                return Err(FmlaError::Arity { op: "gseq", given: args.len() });
            }
        }
        Ok(self.raw_unchecked(op, args))
    }

    fn raw_unchecked(&mut self, op: FmlaOp, args: &[FmlaRef]) -> FmlaRef {
        match op {
            FmlaOp::Not => self.negate(args[0]),
            FmlaOp::Impl => {
                let na = self.negate(args[0]);
                self.raw_unchecked(FmlaOp::Or, &[na, args[1]])
            }
            _ => self.mk_node(op, 0, args.iter().copied().collect()),
        }
    }

    /// The canonical constructor: constant folding and operator-specific
    /// simplification, then cache lookup.
    pub fn intern(&mut self, op: FmlaOp, args: &[FmlaRef]) -> Result<FmlaRef, FmlaError> {
        Self::check_arity(op, args.len())?;
        match op {
            FmlaOp::NewEnv if args.len() != 1 => {
                Err(FmlaError::Arity { op: "newenv", given: args.len() })
            }
            FmlaOp::Include => Err(FmlaError::Unsupported("include outside a parser context")),
            FmlaOp::Gseq => self.raw(op, args),
            _ => Ok(self.intern_unchecked(op, args)),
        }
    }

    fn intern_unchecked(&mut self, op: FmlaOp, args: &[FmlaRef]) -> FmlaRef {
        match op {
            FmlaOp::Ite => {
                let (mut test, mut tbra, mut fbra) = (args[0], args[1], args[2]);
                if self.op(test) == FmlaOp::Not && self.op(self.args(test)[0]) == FmlaOp::Var {
                    test = self.args(test)[0];
                    std::mem::swap(&mut tbra, &mut fbra);
                }
                if test == Fmlas::TRUE {
                    return tbra;
                }
                if test == Fmlas::FALSE {
                    return fbra;
                }
                if tbra == fbra {
                    return tbra;
                }
                self.raw_unchecked(FmlaOp::Ite, &[test, tbra, fbra])
            }
            FmlaOp::And | FmlaOp::Or => {
                let base = if op == FmlaOp::And { Fmlas::TRUE } else { Fmlas::FALSE };
                let negbase = if op == FmlaOp::And { Fmlas::FALSE } else { Fmlas::TRUE };
                let mut new_args: FmlaArgs = SmallVec::new();
                for &a in args {
                    if a == base {
                        continue;
                    }
                    if a == negbase {
                        return negbase;
                    }
                    if let Some(comp) = self.complement_of(a) {
                        if new_args.contains(&comp) {
                            return negbase;
                        }
                    }
                    new_args.push(a);
                }
                match new_args.len() {
                    0 => base,
                    1 => new_args[0],
                    _ => self.raw_unchecked(op, &new_args),
                }
            }
            FmlaOp::Eq => {
                let (a, b) = (args[0], args[1]);
                if a == b {
                    return Fmlas::TRUE;
                }
                if a == Fmlas::TRUE {
                    return b;
                }
                if b == Fmlas::TRUE {
                    return a;
                }
                if a == Fmlas::FALSE {
                    return self.negate(b);
                }
                if b == Fmlas::FALSE {
                    return self.negate(a);
                }
                self.raw_unchecked(FmlaOp::Eq, args)
            }
            FmlaOp::Xor => {
                let mut new_args: FmlaArgs = SmallVec::new();
                let mut parity = false;
                for &a in args {
                    if a == Fmlas::FALSE {
                        continue;
                    }
                    if a == Fmlas::TRUE {
                        parity = !parity;
                        continue;
                    }
                    new_args.push(a);
                }
                if new_args.is_empty() {
                    return if parity { Fmlas::TRUE } else { Fmlas::FALSE };
                }
                if parity {
                    new_args[0] = self.negate(new_args[0]);
                }
                if new_args.len() == 1 {
                    return new_args[0];
                }
                self.raw_unchecked(FmlaOp::Xor, &new_args)
            }
            FmlaOp::Not => self.negate(args[0]),
            FmlaOp::NewEnv => args[0],
            _ => self.raw_unchecked(op, args),
        }
    }

    /// The structural complement of `a` if it is already interned (or a
    /// constant); used to detect `x AND -x` without allocating.
    fn complement_of(&mut self, a: FmlaRef) -> Option<FmlaRef> {
        match self.op(a) {
            FmlaOp::True => Some(Fmlas::FALSE),
            FmlaOp::False => Some(Fmlas::TRUE),
            FmlaOp::Not => Some(self.args(a)[0]),
            _ => {
                let key = NodeKey {
                    op: FmlaOp::Not,
                    name: 0,
                    args: std::iter::once(a).collect(),
                };
                self.cache.get(&key).copied()
            }
        }
    }

    /// Canonical negation; never recurses into the DAG except to push
    /// through `FREE` binders.
    pub fn negate(&mut self, f: FmlaRef) -> FmlaRef {
        match self.op(f) {
            FmlaOp::True => Fmlas::FALSE,
            FmlaOp::False => Fmlas::TRUE,
            FmlaOp::Error => Fmlas::ERROR,
            FmlaOp::Not => self.args(f)[0],
            FmlaOp::Free => {
                let vars = self.args(f)[0];
                let body = self.args(f)[1];
                let nbody = self.negate(body);
                self.mk_node(FmlaOp::Free, 0, [vars, nbody].iter().copied().collect())
            }
            _ => self.mk_node(FmlaOp::Not, 0, std::iter::once(f).collect()),
        }
    }

    pub fn and2(&mut self, a: FmlaRef, b: FmlaRef) -> FmlaRef {
        self.intern_unchecked(FmlaOp::And, &[a, b])
    }

    pub fn or2(&mut self, a: FmlaRef, b: FmlaRef) -> FmlaRef {
        self.intern_unchecked(FmlaOp::Or, &[a, b])
    }

    pub fn ite(&mut self, test: FmlaRef, tbra: FmlaRef, fbra: FmlaRef) -> FmlaRef {
        self.intern_unchecked(FmlaOp::Ite, &[test, tbra, fbra])
    }

    pub fn list(&mut self, args: &[FmlaRef]) -> FmlaRef {
        self.raw_unchecked(FmlaOp::List, args)
    }

    /// Memoized substitution. Quantifier binders shadow their bound
    /// variables: under `EXISTS`/`FORALL`/`FREE` only the body is rewritten,
    /// and bound variables are not replaced.
    pub fn subst(&mut self, f: FmlaRef, map: &HashMap<FmlaRef, FmlaRef>) -> FmlaRef {
        let mut cache = HashMap::new();
        self.subst_rec(f, map, &mut cache)
    }

    pub fn subst_one(&mut self, f: FmlaRef, var: FmlaRef, val: FmlaRef) -> FmlaRef {
        let mut map = HashMap::new();
        map.insert(var, val);
        self.subst(f, &map)
    }

    fn subst_rec(
        &mut self,
        f: FmlaRef,
        map: &HashMap<FmlaRef, FmlaRef>,
        cache: &mut HashMap<FmlaRef, FmlaRef>,
    ) -> FmlaRef {
        if let Some(&r) = map.get(&f) {
            return r;
        }
        match self.op(f) {
            FmlaOp::Var | FmlaOp::True | FmlaOp::False | FmlaOp::Error => return f,
            _ => {}
        }
        if let Some(&r) = cache.get(&f) {
            return r;
        }
        let ret = if self.op(f).is_quant() {
            let binder = self.args(f)[0];
            let body = self.args(f)[1];
            let bound: Vec<FmlaRef> = self.args(binder).to_vec();
            let inner: HashMap<FmlaRef, FmlaRef> = map
                .iter()
                .filter(|(k, _)| !bound.contains(k))
                .map(|(&k, &v)| (k, v))
                .collect();
            let mut inner_cache = HashMap::new();
            let nbody = self.subst_rec(body, &inner, &mut inner_cache);
            if nbody == body {
                f
            } else {
                let op = self.op(f);
                self.intern_unchecked(op, &[binder, nbody])
            }
        } else {
            let op = self.op(f);
            let old: Vec<FmlaRef> = self.args(f).to_vec();
            let mut unchanged = true;
            let mut new_args: Vec<FmlaRef> = Vec::with_capacity(old.len());
            for a in old {
                let na = self.subst_rec(a, map, cache);
                if na != a {
                    unchanged = false;
                }
                new_args.push(na);
            }
            if unchanged {
                f
            } else {
                self.intern_unchecked(op, &new_args)
            }
        };
        cache.insert(f, ret);
        ret
    }

    /// Counts the incoming references of every reachable node (one per
    /// parent occurrence, recursing into a node only on its first visit).
    pub fn count_refs(&self, f: FmlaRef, hit: &mut HashMap<FmlaRef, u32>) {
        let n = hit.entry(f).or_insert(0);
        *n += 1;
        if *n > 1 {
            return;
        }
        if self.op(f) == FmlaOp::Var {
            return;
        }
        for &a in self.args(f).to_vec().iter() {
            self.count_refs(a, hit);
        }
    }

    /// Flattens chains of the same AND/OR operator whenever the intermediate
    /// node has a single reference in the DAG rooted at `f`.
    pub fn flatten_and_or(&mut self, f: FmlaRef) -> FmlaRef {
        let mut hit = HashMap::new();
        self.count_refs(f, &mut hit);
        let mut cache = HashMap::new();
        self.flatten_rec(f, &hit, &mut cache)
    }

    fn flatten_rec(
        &mut self,
        f: FmlaRef,
        hit: &HashMap<FmlaRef, u32>,
        cache: &mut HashMap<FmlaRef, FmlaRef>,
    ) -> FmlaRef {
        if self.op(f) == FmlaOp::Var {
            return f;
        }
        if let Some(&r) = cache.get(&f) {
            return r;
        }
        let op = self.op(f);
        let ret = match op {
            FmlaOp::And | FmlaOp::Or => {
                let mut new_args: Vec<FmlaRef> = vec![];
                let mut stack: Vec<FmlaRef> = self.args(f).iter().rev().copied().collect();
                while let Some(cur) = stack.pop() {
                    if self.op(cur) == op && hit.get(&cur).copied().unwrap_or(0) == 1 {
                        for &a in self.args(cur).to_vec().iter().rev() {
                            stack.push(a);
                        }
                    } else {
                        let na = self.flatten_rec(cur, hit, cache);
                        new_args.push(na);
                    }
                }
                self.raw_unchecked(op, &new_args)
            }
            _ => {
                let old: Vec<FmlaRef> = self.args(f).to_vec();
                let mut unchanged = true;
                let mut new_args = Vec::with_capacity(old.len());
                for a in old {
                    let na = self.flatten_rec(a, hit, cache);
                    if na != a {
                        unchanged = false;
                    }
                    new_args.push(na);
                }
                if unchanged {
                    f
                } else {
                    self.raw_unchecked(op, &new_args)
                }
            }
        };
        cache.insert(f, ret);
        ret
    }

    fn sort_andor_args(&mut self, f: FmlaRef) -> FmlaRef {
        let op = self.op(f);
        if op != FmlaOp::And && op != FmlaOp::Or {
            return f;
        }
        let mut args: Vec<FmlaRef> = self.args(f).to_vec();
        args.sort();
        self.intern_unchecked(op, &args)
    }

    /// Rewrites `ITE` nodes with a constant-ish branch into AND/OR form;
    /// used to tidy strategies before printing.
    pub fn simp_ite(&mut self, f: FmlaRef) -> FmlaRef {
        let mut cache = HashMap::new();
        self.simp_ite_rec(f, &mut cache)
    }

    fn simp_ite_rec(&mut self, f: FmlaRef, cache: &mut HashMap<FmlaRef, FmlaRef>) -> FmlaRef {
        match self.op(f) {
            FmlaOp::Var | FmlaOp::True | FmlaOp::False | FmlaOp::Error => return f,
            _ => {}
        }
        if let Some(&r) = cache.get(&f) {
            return r;
        }
        let op = self.op(f);
        let ret = if op == FmlaOp::Ite {
            let test = self.simp_ite_rec(self.args(f)[0], cache);
            let tbra = self.simp_ite_rec(self.args(f)[1], cache);
            let fbra = self.simp_ite_rec(self.args(f)[2], cache);
            let r = if tbra == Fmlas::TRUE {
                self.or2(fbra, test)
            } else if fbra == Fmlas::TRUE {
                let nt = self.negate(test);
                self.or2(tbra, nt)
            } else if tbra == Fmlas::FALSE {
                let nt = self.negate(test);
                self.and2(fbra, nt)
            } else if fbra == Fmlas::FALSE {
                self.and2(tbra, test)
            } else {
                self.ite(test, tbra, fbra)
            };
            self.sort_andor_args(r)
        } else {
            let old: Vec<FmlaRef> = self.args(f).to_vec();
            let mut new_args = Vec::with_capacity(old.len());
            for a in old {
                new_args.push(self.simp_ite_rec(a, cache));
            }
            self.intern_unchecked(op, &new_args)
        };
        cache.insert(f, ret);
        ret
    }

    /// Negation pushed down to the variables.
    pub fn negate_push(&mut self, f: FmlaRef) -> FmlaRef {
        let mut cache = HashMap::new();
        self.negate_push_rec(f, &mut cache)
    }

    fn negate_push_rec(&mut self, f: FmlaRef, cache: &mut HashMap<FmlaRef, FmlaRef>) -> FmlaRef {
        match self.op(f) {
            FmlaOp::Var => return self.negate(f),
            FmlaOp::True => return Fmlas::FALSE,
            FmlaOp::False => return Fmlas::TRUE,
            FmlaOp::Not => return self.args(f)[0],
            _ => {}
        }
        if let Some(&r) = cache.get(&f) {
            return r;
        }
        let op = self.op(f);
        let old: Vec<FmlaRef> = self.args(f).to_vec();
        let ret = match op {
            FmlaOp::And | FmlaOp::Or => {
                let dual = if op == FmlaOp::And { FmlaOp::Or } else { FmlaOp::And };
                let mut new_args = Vec::with_capacity(old.len());
                for a in old {
                    new_args.push(self.negate_push_rec(a, cache));
                }
                self.raw_unchecked(dual, &new_args)
            }
            FmlaOp::Ite => {
                let t = self.negate_push_rec(old[1], cache);
                let e = self.negate_push_rec(old[2], cache);
                self.raw_unchecked(FmlaOp::Ite, &[old[0], t, e])
            }
            FmlaOp::Eq | FmlaOp::Xor => {
                let mut new_args = old.clone();
                new_args[0] = self.negate_push_rec(new_args[0], cache);
                self.raw_unchecked(op, &new_args)
            }
            FmlaOp::Exists | FmlaOp::Forall => {
                let dual = if op == FmlaOp::Exists { FmlaOp::Forall } else { FmlaOp::Exists };
                let body = self.negate_push_rec(old[1], cache);
                self.raw_unchecked(dual, &[old[0], body])
            }
            FmlaOp::Free => {
                let body = self.negate_push_rec(old[1], cache);
                self.raw_unchecked(FmlaOp::Free, &[old[0], body])
            }
            _ => {
                let n = self.mk_node(op, 0, old.iter().copied().collect());
                self.negate(n)
            }
        };
        cache.insert(f, ret);
        ret
    }

    /// Negation normal form: `NOT` only on variables, `ITE`/`EQ`/`XOR`
    /// expanded away.
    pub fn to_nnf(&mut self, f: FmlaRef) -> FmlaRef {
        let mut cache = HashMap::new();
        self.to_nnf_rec(f, &mut cache)
    }

    fn to_nnf_rec(&mut self, f: FmlaRef, cache: &mut HashMap<FmlaRef, FmlaRef>) -> FmlaRef {
        match self.op(f) {
            FmlaOp::Var | FmlaOp::True | FmlaOp::False => return f,
            _ => {}
        }
        if let Some(&r) = cache.get(&f) {
            return r;
        }
        let op = self.op(f);
        let old: Vec<FmlaRef> = self.args(f).to_vec();
        let ret = match op {
            FmlaOp::Not => {
                let inner = self.to_nnf_rec(old[0], cache);
                self.negate_push(inner)
            }
            FmlaOp::And | FmlaOp::Or | FmlaOp::List | FmlaOp::Exists | FmlaOp::Forall
            | FmlaOp::Free => {
                let mut new_args = Vec::with_capacity(old.len());
                for a in old {
                    new_args.push(self.to_nnf_rec(a, cache));
                }
                self.intern_unchecked(op, &new_args)
            }
            FmlaOp::Ite => {
                let test = self.to_nnf_rec(old[0], cache);
                let tbra = self.to_nnf_rec(old[1], cache);
                let fbra = self.to_nnf_rec(old[2], cache);
                let ntest = self.negate_push(test);
                let a = self.and2(test, tbra);
                let b = self.and2(ntest, fbra);
                self.raw_unchecked(FmlaOp::Or, &[a, b])
            }
            FmlaOp::Eq => {
                let a1 = self.to_nnf_rec(old[0], cache);
                let a2 = self.to_nnf_rec(old[1], cache);
                let na1 = self.negate_push(a1);
                let na2 = self.negate_push(a2);
                let o1 = self.or2(a1, na2);
                let o2 = self.or2(na1, a2);
                self.and2(o1, o2)
            }
            FmlaOp::Xor => {
                let mut ret = Fmlas::FALSE;
                for a in old {
                    let cur = self.to_nnf_rec(a, cache);
                    let ncur = self.negate_push(cur);
                    let nret = self.negate_push(ret);
                    let x = self.and2(ret, ncur);
                    let y = self.and2(nret, cur);
                    ret = self.or2(x, y);
                }
                ret
            }
            _ => Fmlas::ERROR,
        };
        cache.insert(f, ret);
        ret
    }

    /// NNF input to and-inverter form: `OR` replaced by negated `AND`.
    pub fn nnf_to_aig(&mut self, f: FmlaRef) -> FmlaRef {
        let mut cache = HashMap::new();
        self.nnf_to_aig_rec(f, &mut cache)
    }

    fn nnf_to_aig_rec(&mut self, f: FmlaRef, cache: &mut HashMap<FmlaRef, FmlaRef>) -> FmlaRef {
        match self.op(f) {
            FmlaOp::Var | FmlaOp::True | FmlaOp::False | FmlaOp::Not => return f,
            _ => {}
        }
        if let Some(&r) = cache.get(&f) {
            return r;
        }
        let op = self.op(f);
        let old: Vec<FmlaRef> = self.args(f).to_vec();
        let ret = match op {
            FmlaOp::And | FmlaOp::List | FmlaOp::Exists | FmlaOp::Forall | FmlaOp::Free => {
                let mut new_args = Vec::with_capacity(old.len());
                for a in old {
                    new_args.push(self.nnf_to_aig_rec(a, cache));
                }
                self.intern_unchecked(op, &new_args)
            }
            FmlaOp::Or => {
                let mut new_args = Vec::with_capacity(old.len());
                for a in old {
                    let na = self.nnf_to_aig_rec(a, cache);
                    new_args.push(self.negate(na));
                }
                let conj = self.intern_unchecked(FmlaOp::And, &new_args);
                self.negate(conj)
            }
            _ => Fmlas::ERROR,
        };
        cache.insert(f, ret);
        ret
    }

    /// Evaluates a formula under a variable assignment. `None` when a
    /// variable is unassigned and the value does not collapse without it.
    pub fn eval_with(
        &self,
        f: FmlaRef,
        asgn: &dyn Fn(&str) -> Option<bool>,
    ) -> Option<bool> {
        match self.op(f) {
            FmlaOp::True => Some(true),
            FmlaOp::False => Some(false),
            FmlaOp::Var => asgn(self.var_name(f).expect("var node")),
            FmlaOp::Not => self.eval_with(self.args(f)[0], asgn).map(|b| !b),
            FmlaOp::And | FmlaOp::Or => {
                let base = self.op(f) == FmlaOp::And;
                let mut all_known = true;
                for &a in self.args(f) {
                    match self.eval_with(a, asgn) {
                        Some(b) if b != base => return Some(!base),
                        Some(_) => {}
                        None => all_known = false,
                    }
                }
                if all_known {
                    Some(base)
                } else {
                    None
                }
            }
            FmlaOp::Ite => {
                let t = self.eval_with(self.args(f)[0], asgn)?;
                let branch = if t { self.args(f)[1] } else { self.args(f)[2] };
                self.eval_with(branch, asgn)
            }
            FmlaOp::Eq => {
                let a = self.eval_with(self.args(f)[0], asgn)?;
                let b = self.eval_with(self.args(f)[1], asgn)?;
                Some(a == b)
            }
            FmlaOp::Xor => {
                let mut parity = false;
                for &a in self.args(f) {
                    parity ^= self.eval_with(a, asgn)?;
                }
                Some(parity)
            }
            FmlaOp::Free => self.eval_with(self.args(f)[1], asgn),
            _ => None,
        }
    }
}

impl Default for Fmlas {
    fn default() -> Self {
        Fmlas::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk() -> Fmlas {
        Fmlas::new()
    }

    #[test]
    fn interning_is_structural() {
        let mut f = mk();
        let x = f.var("x");
        let y = f.var("y");
        let a = f.intern(FmlaOp::And, &[x, y]).unwrap();
        let before = f.num_nodes();
        let b = f.intern(FmlaOp::And, &[x, y]).unwrap();
        assert_eq!(a, b);
        assert_eq!(f.num_nodes(), before, "re-interning allocates nothing");
        let c = f.intern(FmlaOp::And, &[y, x]).unwrap();
        assert_ne!(a, c, "argument order is part of the identity");
        assert_eq!(f.var("x"), x);
    }

    #[test]
    fn negate_is_an_involution() {
        let mut f = mk();
        let x = f.var("x");
        let y = f.var("y");
        let and = f.intern(FmlaOp::And, &[x, y]).unwrap();
        for n in [x, and, Fmlas::TRUE, Fmlas::FALSE] {
            let nn = f.negate(n);
            let back = f.negate(nn);
            assert_eq!(back, n);
        }
        let nx = f.negate(x);
        let nnx = f.negate(nx);
        assert_eq!(nnx, x, "NOT(NOT x) is never stored");
    }

    #[test]
    fn negate_pushes_through_free() {
        let mut f = mk();
        let x = f.var("x");
        let vars = f.list(&[x]);
        let body = f.var("y");
        let free = f.raw(FmlaOp::Free, &[vars, body]).unwrap();
        let nfree = f.negate(free);
        assert_eq!(f.op(nfree), FmlaOp::Free);
        let nbody = f.negate(body);
        assert_eq!(f.args(nfree), &[vars, nbody]);
        assert_eq!(f.negate(nfree), free);
    }

    #[test]
    fn and_or_absorb_identity_and_collapse() {
        let mut f = mk();
        let x = f.var("x");
        let a = f.intern(FmlaOp::And, &[x, Fmlas::TRUE]).unwrap();
        assert_eq!(a, x, "AND(x) collapses to x");
        let o = f.intern(FmlaOp::Or, &[x, Fmlas::FALSE]).unwrap();
        assert_eq!(o, x);
        let t = f.intern(FmlaOp::And, &[]).unwrap();
        assert_eq!(t, Fmlas::TRUE);
        let e = f.intern(FmlaOp::Or, &[x, Fmlas::TRUE]).unwrap();
        assert_eq!(e, Fmlas::TRUE);
    }

    #[test]
    fn and_detects_contradiction() {
        let mut f = mk();
        let x = f.var("x");
        let nx = f.negate(x);
        let a = f.intern(FmlaOp::And, &[x, nx]).unwrap();
        assert_eq!(a, Fmlas::FALSE);
        let o = f.intern(FmlaOp::Or, &[nx, x]).unwrap();
        assert_eq!(o, Fmlas::TRUE);
    }

    #[test]
    fn ite_folds() {
        let mut f = mk();
        let x = f.var("x");
        let y = f.var("y");
        assert_eq!(f.ite(Fmlas::TRUE, x, y), x);
        assert_eq!(f.ite(Fmlas::FALSE, x, y), y);
        assert_eq!(f.ite(x, y, y), y);
        let nx = f.negate(x);
        let swapped = f.ite(nx, x, y);
        assert_eq!(f.args(swapped)[0], x, "negated test is normalized away");
    }

    #[test]
    fn impl_rewrites_to_or() {
        let mut f = mk();
        let x = f.var("x");
        let y = f.var("y");
        let i = f.raw(FmlaOp::Impl, &[x, y]).unwrap();
        assert_eq!(f.op(i), FmlaOp::Or);
        let nx = f.negate(x);
        assert_eq!(f.args(i), &[nx, y]);
    }

    #[test]
    fn xor_folds_parity() {
        let mut f = mk();
        let x = f.var("x");
        let a = f
            .intern(FmlaOp::Xor, &[Fmlas::TRUE, Fmlas::TRUE, Fmlas::FALSE])
            .unwrap();
        assert_eq!(a, Fmlas::FALSE);
        let b = f.intern(FmlaOp::Xor, &[x, Fmlas::TRUE]).unwrap();
        let nx = f.negate(x);
        assert_eq!(b, nx);
    }

    #[test]
    fn eq_constant_identities() {
        let mut f = mk();
        let x = f.var("x");
        assert_eq!(f.intern(FmlaOp::Eq, &[x, x]).unwrap(), Fmlas::TRUE);
        assert_eq!(f.intern(FmlaOp::Eq, &[x, Fmlas::TRUE]).unwrap(), x);
        let nx = f.negate(x);
        assert_eq!(f.intern(FmlaOp::Eq, &[Fmlas::FALSE, x]).unwrap(), nx);
    }

    #[test]
    fn arity_violations_are_errors() {
        let mut f = mk();
        let x = f.var("x");
        assert!(f.intern(FmlaOp::Ite, &[x, x]).is_err());
        assert!(f.intern(FmlaOp::Exists, &[x]).is_err());
        assert!(f.raw(FmlaOp::Not, &[x, x]).is_err());
    }

    #[test]
    fn subst_rewrites_free_body_only() {
        let mut f = mk();
        let x = f.var("x");
        let y = f.var("y");
        let and = f.intern(FmlaOp::And, &[x, y]).unwrap();
        let sub = f.subst_one(and, x, Fmlas::TRUE);
        assert_eq!(sub, y, "substitution re-simplifies");

        let vars = f.list(&[x]);
        let ex = f.raw(FmlaOp::Exists, &[vars, and]).unwrap();
        let sub2 = f.subst_one(ex, x, Fmlas::TRUE);
        assert_eq!(sub2, ex, "bound variable is not rewritten");
        let sub3 = f.subst_one(ex, y, Fmlas::TRUE);
        assert_eq!(f.op(sub3), FmlaOp::Exists);
        assert_eq!(f.args(sub3)[1], x);
    }

    #[test]
    fn flatten_merges_single_use_chains() {
        let mut f = mk();
        let x = f.var("x");
        let y = f.var("y");
        let z = f.var("z");
        let inner = f.intern(FmlaOp::And, &[x, y]).unwrap();
        let outer = f.intern(FmlaOp::And, &[inner, z]).unwrap();
        let flat = f.flatten_and_or(outer);
        assert_eq!(f.args(flat), &[x, y, z]);
    }

    #[test]
    fn nnf_and_aig() {
        let mut f = mk();
        let x = f.var("x");
        let y = f.var("y");
        let eq = f.intern(FmlaOp::Eq, &[x, y]).unwrap();
        let nnf = f.to_nnf(eq);
        assert_eq!(f.op(nnf), FmlaOp::And);
        let aig = f.nnf_to_aig(nnf);
        let check = |vx: bool, vy: bool| {
            let asgn = move |name: &str| match name {
                "x" => Some(vx),
                "y" => Some(vy),
                _ => None,
            };
            assert_eq!(f.eval_with(nnf, &asgn), Some(vx == vy));
            assert_eq!(f.eval_with(aig, &asgn), Some(vx == vy));
        };
        check(false, false);
        check(false, true);
        check(true, false);
        check(true, true);
    }

    #[test]
    fn simp_ite_tidies_constant_branches() {
        let mut f = mk();
        let x = f.var("x");
        let y = f.var("y");
        let ite = f.ite(x, Fmlas::TRUE, y);
        let s = f.simp_ite(ite);
        assert_eq!(f.op(s), FmlaOp::Or);
        let ite2 = f.ite(x, y, Fmlas::FALSE);
        let s2 = f.simp_ite(ite2);
        assert_eq!(f.op(s2), FmlaOp::And);
    }
}
