//! Emitters: GhostQ circuit echo, QDIMACS, and QCIR for formulas.
//!
//! The circuit emitters renumber variables densely (inputs in prefix
//! order, then gates), so a circuit that grew CEGAR variables still
//! round-trips through the parser. Arguments assigned at the top level are
//! dropped from gate definitions, as the solver will re-derive them.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::error::{Result, SolverError};
use crate::fmla::{FmlaOp, FmlaRef, Fmlas};
use crate::lit::{Lit, Var};
use crate::prefix::QType;
use crate::solver::Solver;

/// Dense renumbering of the live circuit: inputs first in prefix order,
/// then gates in creation order.
struct Renumber {
    input_num: HashMap<Var, i64>,
    gate_num: Vec<i64>,
    last_input: i64,
    last_gate: i64,
    /// Merged (non-empty, alternating) input blocks.
    blocks: Vec<(QType, Vec<Var>)>,
}

fn renumber(s: &Solver) -> Renumber {
    let mut blocks: Vec<(QType, Vec<Var>)> = vec![];
    for blk in s.ckt.prefix.blocks() {
        let inputs: Vec<Var> = blk
            .vars
            .iter()
            .copied()
            .filter(|&v| s.ckt.is_input(v))
            .collect();
        if inputs.is_empty() {
            continue;
        }
        match blocks.last_mut() {
            Some((qt, vars)) if *qt == blk.qtype => vars.extend(inputs),
            _ => blocks.push((blk.qtype, inputs)),
        }
    }
    let mut input_num = HashMap::new();
    let mut next = 0i64;
    for (_, vars) in &blocks {
        for &v in vars {
            next += 2;
            input_num.insert(v, next);
        }
    }
    let last_input = next;
    let mut gate_num = Vec::with_capacity(s.ckt.gates.len());
    for _ in &s.ckt.gates {
        next += 2;
        gate_num.push(next);
    }
    Renumber {
        input_num,
        gate_num,
        last_input,
        last_gate: next,
        blocks,
    }
}

impl Renumber {
    /// File literal of a solver literal, mapping ghost variables back to
    /// their gate's file polarity.
    fn file_lit(&self, s: &Solver, l: Lit) -> i64 {
        match s.ckt.gate_of(l.var()) {
            None => {
                let n = self.input_num[&l.var()];
                if l.sign() {
                    -n
                } else {
                    n
                }
            }
            Some((gate, _)) => {
                let g = &s.ckt.gates[gate as usize];
                let n = self.gate_num[gate as usize];
                if g.neg_out ^ l.sign() {
                    -n
                } else {
                    n
                }
            }
        }
    }
}

/// Writes the circuit in the GhostQ format.
pub fn write_ghostq(s: &Solver, out: &mut dyn Write) -> io::Result<()> {
    let rn = renumber(s);
    let out_num = rn.file_lit(s, s.ckt.out_lit);
    writeln!(out, "CktQBF")?;
    writeln!(out, "LastInputVar {}", rn.last_input)?;
    writeln!(out, "LastGateVar {}", rn.last_gate)?;
    writeln!(out, "OutputGateLit {}", out_num)?;
    if s.ckt.preproc_time_milli != 0 {
        writeln!(out, "PreprocTimeMilli {}", s.ckt.preproc_time_milli)?;
    }
    for (_, vars) in &rn.blocks {
        for &v in vars {
            if let Some(name) = s.ckt.var_names.get(&v.idx()) {
                writeln!(out, "VarName {} : {}", rn.input_num[&v], name)?;
            }
        }
    }
    writeln!(out)?;
    writeln!(out, "<q gate={}>", out_num.abs())?;
    for (qt, vars) in &rn.blocks {
        write!(out, "    {}", qt.letter())?;
        for &v in vars {
            write!(out, " {}", rn.input_num[&v])?;
        }
        writeln!(out)?;
    }
    writeln!(out, "</q>")?;
    writeln!(out)?;
    for (gix, g) in s.ckt.gates.iter().enumerate() {
        let op = if g.neg_out { "or" } else { "and" };
        write!(out, "{} = {}(", rn.gate_num[gix], op)?;
        let mut sep = "";
        for &a in &g.args {
            if s.trail.has_either(a) {
                continue;
            }
            let fa = if g.neg_out { !a } else { a };
            write!(out, "{}{}", sep, rn.file_lit(s, fa))?;
            sep = ", ";
        }
        writeln!(out, ")")?;
    }
    Ok(())
}

/// Writes the circuit as QDIMACS: Tseitin clauses for every gate, gate
/// variables appended to (or opening) a final existential block.
pub fn write_qdimacs(s: &Solver, out: &mut dyn Write) -> Result<()> {
    let rn = renumber(s);
    if rn.blocks.iter().any(|(qt, _)| *qt == QType::Free) {
        return Err(SolverError::Unsupported(
            "a prenex a/e prefix is required for DIMACS emission".to_string(),
        ));
    }
    let mut clauses: Vec<Vec<i64>> = vec![];
    clauses.push(vec![rn.file_lit(s, s.ckt.out_lit)]);
    for (gix, g) in s.ckt.gates.iter().enumerate() {
        // The canonical AND form: g <-> (a1 & ... & ak) expands to
        // (g | -a1 | ... | -ak) and (-g | ai) for each i.
        let gnum = if g.neg_out {
            -rn.gate_num[gix]
        } else {
            rn.gate_num[gix]
        };
        let mut long = vec![gnum];
        for &a in &g.args {
            if s.trail.has_either(a) {
                continue;
            }
            long.push(-rn.file_lit(s, a));
            clauses.push(vec![-gnum, rn.file_lit(s, a)]);
        }
        clauses.push(long);
    }
    writeln!(out, "p cnf {} {}", rn.last_gate, clauses.len())?;
    for (i, (qt, vars)) in rn.blocks.iter().enumerate() {
        write!(out, "{}", qt.letter())?;
        for &v in vars {
            write!(out, " {}", rn.input_num[&v])?;
        }
        if i + 1 == rn.blocks.len() {
            if *qt == QType::Forall {
                writeln!(out, " 0")?;
                write!(out, "e")?;
            }
            for n in &rn.gate_num {
                write!(out, " {}", n)?;
            }
        }
        writeln!(out, " 0")?;
    }
    for c in &clauses {
        for l in c {
            write!(out, "{} ", l)?;
        }
        writeln!(out, "0")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// QCIR emission of formulas

fn qcir_gate_prefix(fmlas: &Fmlas, f: FmlaRef) -> String {
    let mut names = vec![];
    collect_var_names(fmlas, f, &mut names);
    let mut pfx = "g".to_string();
    loop {
        let clash = names.iter().any(|n| {
            n.starts_with(&pfx) && n[pfx.len()..].chars().all(|c| c.is_ascii_digit())
                && n.len() > pfx.len()
        });
        if !clash {
            return pfx;
        }
        pfx.push('g');
    }
}

fn collect_var_names(fmlas: &Fmlas, f: FmlaRef, names: &mut Vec<String>) {
    if fmlas.op(f) == FmlaOp::Var {
        names.push(fmlas.var_name(f).expect("var node").to_string());
        return;
    }
    for &a in fmlas.args(f) {
        collect_var_names(fmlas, a, names);
    }
}

fn number_subfmlas(
    fmlas: &Fmlas,
    f: FmlaRef,
    num: &mut HashMap<FmlaRef, u32>,
    next: &mut u32,
) {
    match fmlas.op(f) {
        FmlaOp::Var => return,
        FmlaOp::Not => {
            number_subfmlas(fmlas, fmlas.args(f)[0], num, next);
            return;
        }
        _ => {}
    }
    if num.contains_key(&f) {
        return;
    }
    for &a in fmlas.args(f) {
        number_subfmlas(fmlas, a, num, next);
    }
    *next += 1;
    num.insert(f, *next);
}

fn qcir_lit(
    fmlas: &Fmlas,
    f: FmlaRef,
    num: &HashMap<FmlaRef, u32>,
    pfx: &str,
    out: &mut dyn Write,
) -> io::Result<()> {
    match fmlas.op(f) {
        FmlaOp::Not => {
            write!(out, "-")?;
            qcir_lit(fmlas, fmlas.args(f)[0], num, pfx, out)
        }
        FmlaOp::Var => write!(out, "{}", fmlas.var_name(f).expect("var node")),
        _ => write!(out, "{}{}", pfx, num[&f]),
    }
}

fn qcir_rec(
    fmlas: &Fmlas,
    f: FmlaRef,
    seen: &mut std::collections::HashSet<FmlaRef>,
    num: &HashMap<FmlaRef, u32>,
    pfx: &str,
    out: &mut dyn Write,
) -> io::Result<()> {
    if !seen.insert(f) {
        return Ok(());
    }
    let mut op = fmlas.op(f);
    match op {
        FmlaOp::Var => return Ok(()),
        FmlaOp::Not => return qcir_rec(fmlas, fmlas.args(f)[0], seen, num, pfx, out),
        FmlaOp::True => op = FmlaOp::And,
        FmlaOp::False => op = FmlaOp::Or,
        _ => {}
    }
    if op.is_quant() {
        qcir_rec(fmlas, fmlas.args(f)[1], seen, num, pfx, out)?;
    } else {
        for &a in fmlas.args(f) {
            qcir_rec(fmlas, a, seen, num, pfx, out)?;
        }
    }
    qcir_lit(fmlas, f, num, pfx, out)?;
    write!(out, " = {}(", op.name())?;
    let inner = if op.is_quant() { fmlas.args(f)[0] } else { f };
    let args = fmlas.args(inner);
    for (i, &a) in args.iter().enumerate() {
        qcir_lit(fmlas, a, num, pfx, out)?;
        if i + 1 < args.len() {
            write!(out, ", ")?;
        }
    }
    if op.is_quant() {
        write!(out, "; ")?;
        qcir_lit(fmlas, fmlas.args(f)[1], num, pfx, out)?;
    }
    writeln!(out, ")")
}

/// Writes a formula as a QCIR circuit.
pub fn write_qcir(fmlas: &Fmlas, f: FmlaRef, out: &mut dyn Write) -> io::Result<()> {
    let pfx = qcir_gate_prefix(fmlas, f);
    let mut num = HashMap::new();
    let mut next = 0;
    number_subfmlas(fmlas, f, &mut num, &mut next);
    writeln!(out, "#QCIR-G14")?;
    write!(out, "output(")?;
    qcir_lit(fmlas, f, &num, &pfx, out)?;
    writeln!(out, ")")?;
    let mut seen = std::collections::HashSet::new();
    qcir_rec(fmlas, f, &mut seen, &num, &pfx, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{BuildOpts, Circuit};
    use crate::parse::{parse_circuit, parse_ghostq};
    use crate::solver::{Outcome, SolverOpts};

    fn solver_for(src: &str) -> Solver {
        let parsed = parse_ghostq(src.as_bytes()).unwrap();
        let mut fmlas = Fmlas::new();
        let ckt = Circuit::build(&parsed, &mut fmlas, BuildOpts::default()).unwrap();
        Solver::new(ckt, fmlas, SolverOpts::default())
    }

    const CKT: &str = "CktQBF\nLastInputVar 4\nLastGateVar 8\nOutputGateLit 8\n\
        <q gate=8>\na 2\ne 4\n</q>\n\
        6 = or(2, 4)\n\
        8 = and(6, 4)\n";

    #[test]
    fn ghostq_emit_reparses_to_same_graph() {
        let s = solver_for(CKT);
        let mut buf = Vec::new();
        write_ghostq(&s, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let reparsed = parse_circuit(text.as_bytes()).unwrap();
        assert_eq!(reparsed.gates.len(), 2);
        assert_eq!(reparsed.blocks.len(), 2);
        assert_eq!(reparsed.last_input_var, 4);

        // And the emitted circuit has the same truth value.
        let mut fmlas = Fmlas::new();
        let ckt = Circuit::build(&reparsed, &mut fmlas, BuildOpts::default()).unwrap();
        let mut s2 = Solver::new(ckt, fmlas, SolverOpts::default());
        let fin = s2.solve().unwrap();
        assert_eq!(s2.outcome(fin), Outcome::True);
    }

    #[test]
    fn qdimacs_has_tseitin_shape() {
        let s = solver_for(CKT);
        let mut buf = Vec::new();
        write_qdimacs(&s, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("p cnf 8 "));
        assert!(text.contains("\na 2 0\n"));
        assert!(text.contains("\ne 4 6 8 0\n"));
        // Every clause line ends with 0.
        for l in text.lines().skip(1) {
            assert!(l.ends_with('0'), "line: {}", l);
        }
    }

    #[test]
    fn qdimacs_rejects_free_prefix() {
        let src = CKT.replace("a 2", "f 2");
        let parsed = parse_ghostq(src.as_bytes()).unwrap();
        let mut fmlas = Fmlas::new();
        let ckt = Circuit::build(
            &parsed,
            &mut fmlas,
            BuildOpts {
                allow_free: true,
                alloc_cegar_vars: false,
            },
        )
        .unwrap();
        let s = Solver::new(ckt, fmlas, SolverOpts::default());
        assert!(write_qdimacs(&s, &mut Vec::new()).is_err());
    }

    #[test]
    fn qcir_emits_header_and_gates() {
        let mut fmlas = Fmlas::new();
        let x = fmlas.var("x");
        let y = fmlas.var("y");
        let or = fmlas.intern(FmlaOp::Or, &[x, y]).unwrap();
        let vars = fmlas.list(&[x, y]);
        let q = fmlas.raw(FmlaOp::Exists, &[vars, or]).unwrap();
        let mut buf = Vec::new();
        write_qcir(&fmlas, q, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("#QCIR-G14\n"));
        assert!(text.contains("output(g"));
        assert!(text.contains("= or(x, y)"));
        assert!(text.contains("= exists(x, y; g"));
    }
}
