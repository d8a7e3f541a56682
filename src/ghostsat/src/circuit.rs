//! The ghosted circuit model.
//!
//! Every parsed gate is normalized to an AND over literals; an OR gate
//! becomes a negated AND with negated inputs, and file references to it
//! carry the extra negation. Each gate then owns two ghost variables, one
//! per player, placed in the nearest enclosing block of that player's type
//! at or before the innermost input block. The solver's variable space is
//! inputs plus ghosts; gate variables themselves never appear on the trail.

use std::collections::HashMap;

use crate::error::{Result, SolverError};
use crate::fmla::{FmlaOp, FmlaRef, Fmlas};
use crate::lit::{Lit, Ply, Var};
use crate::parse::{GateOp, ParsedCircuit};
use crate::prefix::{BlockMap, QType, QuantPrefix};

pub type GateId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Input,
    Ghost { gate: GateId, ply: Ply },
}

#[derive(Debug, Clone)]
pub struct Gate {
    /// Original (positive, even) gate number from the input file.
    pub file_num: i64,
    /// Ghost variables indexed by ply.
    pub ghosts: [Var; 2],
    /// Arguments of the normalized AND form, in ply-A ghost space.
    pub args: Vec<Lit>,
    /// Input-space formula of the positive AND output (structural, unfolded).
    pub fmla: FmlaRef,
    /// True when the file gate was an OR: file references are negated.
    pub neg_out: bool,
    /// True for gates synthesized by CEGAR restriction.
    pub synthesized: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BuildOpts {
    pub allow_free: bool,
    /// Reserve fresh-variable headroom for CEGAR gate synthesis.
    pub alloc_cegar_vars: bool,
}

impl Default for BuildOpts {
    fn default() -> Self {
        BuildOpts {
            allow_free: false,
            alloc_cegar_vars: false,
        }
    }
}

#[derive(Debug)]
pub struct Circuit {
    pub prefix: QuantPrefix,
    pub qb: BlockMap,
    kind: Vec<VarKind>,
    /// Number of original input variables (vars 1..=n_orig_inputs).
    pub n_orig_inputs: u32,
    pub gates: Vec<Gate>,
    /// Output literal in ply-A ghost space.
    pub out_lit: Lit,
    pub innermost_input_qb: u16,
    /// Sentinel block per player, appended after the parsed prefix.
    pub extra_qb: [u16; 2],
    /// Fresh-variable arena bound; allocation past it is `ResourceExhausted`.
    pub var_limit: u32,
    /// File-style display number per variable (inputs keep their file
    /// number; ghosts carry their gate's).
    file_num: Vec<i64>,
    /// Next even number handed to a synthesized input or gate.
    next_file_num: i64,
    pub var_names: HashMap<u32, String>,
    /// Input-space variable formula per input var.
    var_fmla: Vec<Option<FmlaRef>>,
    pub preproc_time_milli: u64,
    /// The whole instance as a quantified formula (structural).
    pub orig_fmla: FmlaRef,
}

impl Circuit {
    pub fn num_vars(&self) -> u32 {
        self.kind.len() as u32
    }

    #[inline]
    pub fn kind(&self, v: Var) -> VarKind {
        self.kind[v.idx() as usize]
    }

    #[inline]
    pub fn is_input(&self, v: Var) -> bool {
        self.kind(v) == VarKind::Input
    }

    pub fn is_orig_input(&self, v: Var) -> bool {
        v.idx() >= 1 && v.idx() <= self.n_orig_inputs
    }

    pub fn gate_of(&self, v: Var) -> Option<(GateId, Ply)> {
        match self.kind(v) {
            VarKind::Input => None,
            VarKind::Ghost { gate, ply } => Some((gate, ply)),
        }
    }

    /// The ghost copy of `l` for player `ply`; input literals pass through.
    pub fn ghost_or_pass(&self, l: Lit, ply: Ply) -> Lit {
        match self.kind(l.var()) {
            VarKind::Input => l,
            VarKind::Ghost { gate, .. } => {
                Lit::new(self.gates[gate as usize].ghosts[ply.index()], l.sign())
            }
        }
    }

    pub fn qtype_of_lit(&self, l: Lit) -> Option<QType> {
        self.prefix.qtype(self.qb.of_lit(l))
    }

    /// Player index of a literal's block; `None` for free variables.
    pub fn ply_of_lit(&self, l: Lit) -> Option<Ply> {
        self.qtype_of_lit(l).and_then(|q| q.ply())
    }

    pub fn file_num_of(&self, v: Var) -> i64 {
        self.file_num[v.idx() as usize]
    }

    /// Display form of a literal: inputs by name or file number, ghosts as
    /// `<gate>ga` / `<gate>ge`.
    pub fn lit_name(&self, l: Lit) -> String {
        let v = l.var();
        let sign = if l.sign() { "-" } else { "" };
        match self.kind(v) {
            VarKind::Input => match self.var_names.get(&v.idx()) {
                Some(name) => format!("{}{}", sign, name),
                None => format!("{}{}", sign, self.file_num[v.idx() as usize]),
            },
            VarKind::Ghost { gate, ply } => {
                let g = &self.gates[gate as usize];
                let suffix = if ply == Ply::E { "ge" } else { "ga" };
                // The file polarity of the canonical AND output.
                let n = if g.neg_out ^ l.sign() {
                    -g.file_num
                } else {
                    g.file_num
                };
                format!("{}{}", n, suffix)
            }
        }
    }

    /// The input-space formula of an input literal.
    pub fn input_lit_fmla(&mut self, l: Lit, fmlas: &mut Fmlas) -> FmlaRef {
        let v = l.var();
        debug_assert!(self.is_input(v));
        let f = match self.var_fmla[v.idx() as usize] {
            Some(f) => f,
            None => {
                let name = match self.var_names.get(&v.idx()) {
                    Some(n) => n.clone(),
                    None => self.file_num[v.idx() as usize].to_string(),
                };
                let f = fmlas.var(&name);
                self.var_fmla[v.idx() as usize] = Some(f);
                f
            }
        };
        if l.sign() {
            fmlas.negate(f)
        } else {
            f
        }
    }

    /// The input-space formula of any solver literal; ghosts unfold to
    /// their gate's formula.
    pub fn lit_fmla(&mut self, l: Lit, fmlas: &mut Fmlas) -> FmlaRef {
        match self.kind(l.var()) {
            VarKind::Input => self.input_lit_fmla(l, fmlas),
            VarKind::Ghost { gate, .. } => {
                let f = self.gates[gate as usize].fmla;
                if l.sign() {
                    fmlas.negate(f)
                } else {
                    f
                }
            }
        }
    }

    fn push_var(&mut self, kind: VarKind, file_num: i64) -> Var {
        let v = Var::from_idx(self.kind.len() as u32);
        self.kind.push(kind);
        self.file_num.push(file_num);
        self.var_fmla.push(None);
        self.qb.ensure(v);
        v
    }

    fn place_in_block(&mut self, v: Var, qb: u16) {
        self.qb.set(v, qb);
        self.prefix.add_var(qb, v);
    }

    /// Places the two ghost variables of a gate by walking inward from the
    /// innermost argument block to the first block of each player's type.
    fn place_gate_ghosts(&mut self, gate: GateId) {
        for ply in [Ply::A, Ply::E] {
            let args = self.gates[gate as usize].args.clone();
            let mut max_qb = 0u16;
            for &a in &args {
                let ga = self.ghost_or_pass(a, ply);
                let q = self.qb.of_lit(ga);
                debug_assert_ne!(q, 0);
                max_qb = max_qb.max(q);
            }
            if max_qb > self.innermost_input_qb {
                max_qb = self.innermost_input_qb;
            }
            let target = self
                .prefix
                .find_block_at_or_after(max_qb.max(1), QType::of_ply(ply))
                .expect("sentinel blocks host every player");
            let v = self.gates[gate as usize].ghosts[ply.index()];
            self.place_in_block(v, target);
        }
    }

    fn check_var_headroom(&self, extra: u32) -> Result<()> {
        if self.num_vars() + extra > self.var_limit {
            Err(SolverError::ResourceExhausted("fresh solver variables"))
        } else {
            Ok(())
        }
    }

    /// A fresh input variable for CEGAR restriction, two blocks outer
    /// (same player) than the variable it generalizes.
    pub fn new_cegar_input(&mut self, from: Var) -> Result<Var> {
        self.check_var_headroom(1)?;
        let from_qb = self.qb.of_var(from);
        debug_assert!(from_qb >= 3);
        let qb = from_qb - 2;
        let file_num = self.next_file_num;
        self.next_file_num += 2;
        let v = self.push_var(VarKind::Input, file_num);
        self.place_in_block(v, qb);
        Ok(v)
    }

    /// A fresh synthesized gate with the given (sorted, deduplicated)
    /// argument list in ply-A space. Ghost placement and formula follow the
    /// original gates.
    pub fn new_cegar_gate(&mut self, args: Vec<Lit>, fmlas: &mut Fmlas) -> Result<GateId> {
        self.check_var_headroom(2)?;
        let gate = self.gates.len() as GateId;
        let file_num = self.next_file_num;
        self.next_file_num += 2;
        let ga = self.push_var(VarKind::Ghost { gate, ply: Ply::A }, file_num);
        let ge = self.push_var(VarKind::Ghost { gate, ply: Ply::E }, file_num);
        let mut arg_fmlas = Vec::with_capacity(args.len());
        for &a in &args {
            arg_fmlas.push(self.lit_fmla(a, fmlas));
        }
        let fmla = fmlas
            .raw(FmlaOp::And, &arg_fmlas)
            .map_err(|_| SolverError::Internal("and arity"))?;
        self.gates.push(Gate {
            file_num,
            ghosts: [ga, ge],
            args,
            fmla,
            neg_out: false,
            synthesized: true,
        });
        self.place_gate_ghosts(gate);
        Ok(gate)
    }

    pub fn build(parsed: &ParsedCircuit, fmlas: &mut Fmlas, opts: BuildOpts) -> Result<Circuit> {
        let mut prefix = QuantPrefix::new();
        let mut qb = BlockMap::new();

        let n_orig_inputs = (parsed.last_input_var / 2) as u32;
        let mut ckt = Circuit {
            prefix: QuantPrefix::new(),
            qb: BlockMap::new(),
            kind: vec![VarKind::Input], // var 0 sentinel
            n_orig_inputs,
            gates: vec![],
            out_lit: Lit::UNDEF,
            innermost_input_qb: 0,
            extra_qb: [0, 0],
            var_limit: u32::MAX,
            file_num: vec![0],
            next_file_num: 0,
            var_names: HashMap::new(),
            var_fmla: vec![None],
            preproc_time_milli: parsed.preproc_time_milli,
            orig_fmla: Fmlas::ERROR,
        };

        // Input variables, block by block. Parsing has already checked the
        // numbering, so file var 2k becomes solver var k.
        let mut quantified = 0i64;
        for (qtype, qvars) in &parsed.blocks {
            if *qtype == QType::Free {
                if !opts.allow_free {
                    return Err(SolverError::Unsupported(
                        "free variables require the allow-free option".to_string(),
                    ));
                }
                if prefix.num_blocks() > 1 {
                    return Err(SolverError::Parse(
                        "free variables must be in the outermost block".to_string(),
                    ));
                }
            }
            let ix = prefix.push_block(*qtype)?;
            for &fv in qvars {
                let v = ckt.push_var(VarKind::Input, fv);
                debug_assert_eq!(v.idx() as i64 * 2, fv);
                qb.set(v, ix);
                prefix.add_var(ix, v);
                if let Some(name) = parsed.var_names.get(&fv) {
                    ckt.var_names.insert(v.idx(), name.clone());
                }
                quantified = fv;
            }
        }
        if quantified != parsed.last_input_var {
            return Err(SolverError::Parse(format!(
                "input variables up to {} declared but only {} quantified",
                parsed.last_input_var, quantified
            )));
        }
        let innermost_input_qb = (prefix.num_blocks() - 1) as u16;
        if innermost_input_qb == 0 {
            return Err(SolverError::Parse("empty quantifier prefix".to_string()));
        }

        // Two sentinel blocks for newly minted ghost/CEGAR variables.
        let mut extra_qb = [0u16; 2];
        for _ in 0..2 {
            let next = match prefix.last_qtype() {
                Some(QType::Exists) => QType::Forall,
                _ => QType::Exists,
            };
            let ix = prefix.push_block(next)?;
            extra_qb[next.ply().expect("sentinels are owned").index()] = ix;
        }

        ckt.prefix = prefix;
        ckt.qb = qb;
        ckt.innermost_input_qb = innermost_input_qb;
        ckt.extra_qb = extra_qb;

        // Normalized AND gates, children first (ascending file numbers).
        let mut gate_of_file: HashMap<i64, GateId> = HashMap::new();
        let file_lit_to_solver = |ckt: &Circuit,
                                      gate_of_file: &HashMap<i64, GateId>,
                                      fl: i64|
         -> Result<Lit> {
            let v = fl.abs();
            let sign = fl < 0;
            if v <= parsed.last_input_var {
                Ok(Lit::new(Var::from_idx((v / 2) as u32), sign))
            } else {
                let gid = *gate_of_file
                    .get(&v)
                    .ok_or_else(|| SolverError::Parse(format!("undefined gate {}", v)))?;
                let g = &ckt.gates[gid as usize];
                Ok(Lit::new(g.ghosts[Ply::A.index()], sign ^ g.neg_out))
            }
        };

        for (&file_num, (op, file_args)) in &parsed.gates {
            let gate = ckt.gates.len() as GateId;
            let ga = ckt.push_var(VarKind::Ghost { gate, ply: Ply::A }, file_num);
            let ge = ckt.push_var(VarKind::Ghost { gate, ply: Ply::E }, file_num);
            let neg_out = *op == GateOp::Or;
            let mut args = Vec::with_capacity(file_args.len());
            let mut arg_fmlas = Vec::with_capacity(file_args.len());
            for &fa in file_args {
                let mut l = file_lit_to_solver(&ckt, &gate_of_file, fa)?;
                let lf = ckt.lit_fmla(l, fmlas);
                arg_fmlas.push(lf);
                if neg_out {
                    l = !l;
                }
                args.push(l);
            }
            // Structural formula of the file gate, then of the AND output.
            let file_fmla = fmlas
                .raw(
                    if neg_out { FmlaOp::Or } else { FmlaOp::And },
                    &arg_fmlas,
                )
                .map_err(|e| SolverError::Parse(e.to_string()))?;
            let fmla = if neg_out {
                fmlas.negate(file_fmla)
            } else {
                file_fmla
            };
            ckt.gates.push(Gate {
                file_num,
                ghosts: [ga, ge],
                args,
                fmla,
                neg_out,
                synthesized: false,
            });
            gate_of_file.insert(file_num, gate);
            ckt.place_gate_ghosts(gate);
        }

        ckt.out_lit = file_lit_to_solver(&ckt, &gate_of_file, parsed.output_lit)?;

        // The instance as one structural formula, prefix wrapped innermost
        // block first.
        let out_gid = ckt
            .gate_of(ckt.out_lit.var())
            .ok_or_else(|| SolverError::Parse("output is not a gate".to_string()))?
            .0;
        let mut body = {
            let f = ckt.gates[out_gid as usize].fmla;
            if ckt.out_lit.sign() {
                fmlas.negate(f)
            } else {
                f
            }
        };
        for (qtype, qvars) in parsed.blocks.iter().rev() {
            let op = match qtype {
                QType::Forall => FmlaOp::Forall,
                QType::Exists => FmlaOp::Exists,
                QType::Free => FmlaOp::Free,
            };
            let mut vf = Vec::with_capacity(qvars.len());
            for &fv in qvars {
                let v = Var::from_idx((fv / 2) as u32);
                vf.push(ckt.input_lit_fmla(v.pos_lit(), fmlas));
            }
            let vlist = fmlas.list(&vf);
            body = fmlas
                .raw(op, &[vlist, body])
                .map_err(|e| SolverError::Parse(e.to_string()))?;
        }
        ckt.orig_fmla = body;

        // Fresh-variable headroom, announced once at construction.
        let base = ckt.num_vars();
        let factor = gate_expansion_factor(opts.alloc_cegar_vars, ckt.gates.len());
        ckt.var_limit = (base as f64 * factor) as u32 + 10_000;
        ckt.next_file_num = {
            let max_file = parsed
                .gates
                .keys()
                .last()
                .copied()
                .unwrap_or(parsed.last_input_var)
                .max(parsed.last_input_var);
            (max_file + 2 + 1) & !1
        };

        Ok(ckt)
    }
}

fn gate_expansion_factor(alloc_cegar: bool, num_gates: usize) -> f64 {
    if !alloc_cegar {
        return 1.0;
    }
    const THRES1: f64 = 10_000.0;
    const THRES2: f64 = 500_000.0;
    let n = num_gates as f64 * 2.0;
    let pct = if n < THRES1 {
        1.0
    } else if n < THRES2 {
        let p = (THRES2 - n) / THRES2;
        p * p.sqrt()
    } else {
        0.0
    };
    1.0 + pct * 24.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_ghostq;

    fn build(src: &str, allow_free: bool) -> (Circuit, Fmlas) {
        let parsed = parse_ghostq(src.as_bytes()).unwrap();
        let mut fmlas = Fmlas::new();
        let ckt = Circuit::build(
            &parsed,
            &mut fmlas,
            BuildOpts {
                allow_free,
                alloc_cegar_vars: false,
            },
        )
        .unwrap();
        (ckt, fmlas)
    }

    const OR_CKT: &str = "CktQBF\nLastInputVar 4\nLastGateVar 6\nOutputGateLit 6\n\
        <q gate=6>\ne 2 4\n</q>\n6 = or(2, 4)\n";

    #[test]
    fn or_gate_normalizes_to_negated_and() {
        let (ckt, _f) = build(OR_CKT, false);
        assert_eq!(ckt.gates.len(), 1);
        let g = &ckt.gates[0];
        assert!(g.neg_out);
        let a1 = Var::from_idx(1).neg_lit();
        let a2 = Var::from_idx(2).neg_lit();
        assert_eq!(g.args, vec![a1, a2]);
        // File +6 is true when the AND of the negations is false.
        assert!(ckt.out_lit.sign());
        assert_eq!(ckt.out_lit.var(), g.ghosts[0]);
    }

    #[test]
    fn ghosts_are_placed_in_player_blocks() {
        let (ckt, _f) = build(OR_CKT, false);
        let g = &ckt.gates[0];
        let qa = ckt.qb.of_var(g.ghosts[Ply::A.index()]);
        let qe = ckt.qb.of_var(g.ghosts[Ply::E.index()]);
        assert_eq!(ckt.prefix.qtype(qa), Some(QType::Forall));
        assert_eq!(ckt.prefix.qtype(qe), Some(QType::Exists));
        // The existential ghost shares the innermost existential block.
        assert_eq!(qe, 1);
        // The universal ghost lands in the sentinel block.
        assert_eq!(qa, ckt.extra_qb[Ply::A.index()]);
    }

    #[test]
    fn free_block_requires_option() {
        let src = OR_CKT.replace("e 2 4", "f 2 4");
        let parsed = parse_ghostq(src.as_bytes()).unwrap();
        let mut fmlas = Fmlas::new();
        assert!(Circuit::build(&parsed, &mut fmlas, BuildOpts::default()).is_err());
    }

    #[test]
    fn orig_fmla_is_quantified_or() {
        let (ckt, f) = build(OR_CKT, false);
        assert_eq!(f.op(ckt.orig_fmla), FmlaOp::Exists);
        let body = f.args(ckt.orig_fmla)[1];
        assert_eq!(f.op(body), FmlaOp::Or);
    }

    #[test]
    fn lit_names_follow_file_numbers() {
        let (ckt, _f) = build(OR_CKT, false);
        assert_eq!(ckt.lit_name(Var::from_idx(1).pos_lit()), "2");
        assert_eq!(ckt.lit_name(Var::from_idx(2).neg_lit()), "-4");
        let g = &ckt.gates[0];
        assert_eq!(ckt.lit_name(g.ghosts[1].pos_lit()), "-6ge");
    }

    #[test]
    fn cegar_allocation_respects_limit() {
        let (mut ckt, mut f) = build(OR_CKT, false);
        ckt.var_limit = ckt.num_vars();
        let v = Var::from_idx(1);
        assert!(ckt.new_cegar_input(v).is_err());
        assert!(ckt.new_cegar_gate(vec![v.pos_lit(), Var::from_idx(2).pos_lit()], &mut f).is_err());
    }
}
