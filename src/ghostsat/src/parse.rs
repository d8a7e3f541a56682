//! Parsers for the two circuit input languages.
//!
//! Both produce the same `ParsedCircuit`, which `circuit::Circuit::build`
//! turns into the ghosted model. File-level literals are signed integers
//! with the GhostQ convention: variables are positive even numbers, inputs
//! numbered contiguously 2, 4, 6, ... outer-to-inner.

use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;

use crate::error::{Result, SolverError};
use crate::prefix::QType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOp {
    And,
    Or,
}

#[derive(Debug, Clone)]
pub struct ParsedCircuit {
    pub last_input_var: i64,
    pub last_gate_var: i64,
    pub output_lit: i64,
    pub preproc_time_milli: u64,
    pub var_names: HashMap<i64, String>,
    /// Quantifier blocks attached to the output gate, outer to inner.
    pub blocks: Vec<(QType, Vec<i64>)>,
    /// Gate definitions keyed by (positive, even) gate number.
    pub gates: BTreeMap<i64, (GateOp, Vec<i64>)>,
}

fn perr(line_num: usize, msg: impl Into<String>) -> SolverError {
    SolverError::Parse(format!("line {}: {}", line_num, msg.into()))
}

/// Splits a line into tokens; commas count as whitespace, the punctuation
/// characters `( ) = : ;` are single-character tokens, `#` starts a comment.
fn tokenize(line: &str) -> Vec<String> {
    let mut toks = vec![];
    let mut cur = String::new();
    for c in line.chars() {
        match c {
            '#' => break,
            c if c.is_whitespace() || c == ',' => {
                if !cur.is_empty() {
                    toks.push(std::mem::take(&mut cur));
                }
            }
            '(' | ')' | '=' | ':' | ';' => {
                if !cur.is_empty() {
                    toks.push(std::mem::take(&mut cur));
                }
                toks.push(c.to_string());
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        toks.push(cur);
    }
    toks
}

struct Lines<R> {
    reader: R,
    buf: String,
    pub num: usize,
}

impl<R: BufRead> Lines<R> {
    fn new(reader: R) -> Lines<R> {
        Lines {
            reader,
            buf: String::new(),
            num: 0,
        }
    }

    /// The next non-blank line's tokens, or `None` at end of input.
    fn next_toks(&mut self) -> Result<Option<Vec<String>>> {
        loop {
            self.buf.clear();
            let n = self.reader.read_line(&mut self.buf)?;
            if n == 0 {
                return Ok(None);
            }
            self.num += 1;
            let toks = tokenize(&self.buf);
            if !toks.is_empty() {
                return Ok(Some(toks));
            }
        }
    }
}

fn parse_i64(tok: &str, line: usize) -> Result<i64> {
    tok.parse::<i64>()
        .map_err(|_| perr(line, format!("expected an integer, found '{}'", tok)))
}

fn read_int_param<R: BufRead>(
    lines: &mut Lines<R>,
    toks: &[String],
    name: &str,
) -> Result<i64> {
    if toks.len() != 2 || !toks[0].eq_ignore_ascii_case(name) {
        return Err(perr(lines.num, format!("expected '{} N'", name)));
    }
    parse_i64(&toks[1], lines.num)
}

/// Parses the GhostQ circuit format.
pub fn parse_ghostq<R: BufRead>(reader: R) -> Result<ParsedCircuit> {
    let mut lines = Lines::new(reader);
    let mut toks = lines
        .next_toks()?
        .ok_or_else(|| perr(0, "empty input"))?;
    if toks[0].eq_ignore_ascii_case("CktQBF") {
        toks = lines
            .next_toks()?
            .ok_or_else(|| perr(lines.num, "unexpected end of file"))?;
    }
    let last_input_var = read_int_param(&mut lines, &toks, "LastInputVar")?;
    toks = lines
        .next_toks()?
        .ok_or_else(|| perr(lines.num, "unexpected end of file"))?;
    if toks[0].eq_ignore_ascii_case("FirstGateVar") {
        toks = lines
            .next_toks()?
            .ok_or_else(|| perr(lines.num, "unexpected end of file"))?;
    }
    let last_gate_var = read_int_param(&mut lines, &toks, "LastGateVar")?;
    toks = lines
        .next_toks()?
        .ok_or_else(|| perr(lines.num, "unexpected end of file"))?;
    let output_lit = read_int_param(&mut lines, &toks, "OutputGateLit")?;

    let mut ckt = ParsedCircuit {
        last_input_var,
        last_gate_var,
        output_lit,
        preproc_time_milli: 0,
        var_names: HashMap::new(),
        blocks: vec![],
        gates: BTreeMap::new(),
    };

    let mut cur = lines.next_toks()?;
    if let Some(t) = &cur {
        if t[0].eq_ignore_ascii_case("PreprocTimeMilli") {
            ckt.preproc_time_milli = read_int_param(&mut lines, t, "PreprocTimeMilli")? as u64;
            cur = lines.next_toks()?;
        }
    }

    // VarName K : name
    while let Some(t) = &cur {
        if !t[0].eq_ignore_ascii_case("VarName") {
            break;
        }
        if t.len() != 4 || t[2] != ":" {
            return Err(perr(lines.num, "expected 'VarName K : name'"));
        }
        let num = parse_i64(&t[1], lines.num)?;
        ckt.var_names.insert(num, t[3].clone());
        cur = lines.next_toks()?;
    }

    // Quantifier sections: <q gate=G> ... </q>
    let mut quant_gate: Option<i64> = None;
    loop {
        let t = match &cur {
            Some(t) => t,
            None => return Err(perr(lines.num, "unexpected end of file")),
        };
        if t[0].parse::<i64>().is_ok() {
            break;
        }
        if t[0] == "<q" || t[0].starts_with("<q") {
            // Re-scan the raw pieces: "<q" "gate" "=" "G>" in some split.
            let joined: String = t.concat();
            let digits: String = joined
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            let g = digits
                .parse::<i64>()
                .map_err(|_| perr(lines.num, "expected '<q gate=G>'"))?;
            match quant_gate {
                None => quant_gate = Some(g),
                Some(prev) if prev != g => {
                    return Err(perr(
                        lines.num,
                        "non-prenex quantification is not supported",
                    ))
                }
                Some(_) => {}
            }
            cur = lines.next_toks()?;
            continue;
        }
        if t[0] == "</q>" || t[0].starts_with("</q") {
            cur = lines.next_toks()?;
            continue;
        }
        let qtype = match t[0].as_str() {
            s if s.len() == 1 => QType::from_letter(s.chars().next().expect("len 1"))
                .ok_or_else(|| perr(lines.num, "expected 'a', 'e' or 'f'"))?,
            s => return Err(perr(lines.num, format!("expected 'a', 'e' or 'f', found '{}'", s))),
        };
        let mut qvars = vec![];
        for tok in &t[1..] {
            qvars.push(parse_i64(tok, lines.num)?);
        }
        ckt.blocks.push((qtype, qvars));
        cur = lines.next_toks()?;
    }

    if let (Some(g), false) = (quant_gate, ckt.output_lit == 0) {
        if g != ckt.output_lit.abs() {
            return Err(perr(
                lines.num,
                "non-prenex quantification is not supported (quantifier not on the output gate)",
            ));
        }
    }

    // Gate definitions: G = op(a1, a2, ...), with 'list' macro expansion.
    let mut list_defs: HashMap<i64, Vec<i64>> = HashMap::new();
    while let Some(t) = &cur {
        let line = lines.num;
        let gate = parse_i64(&t[0], line)?;
        if t.len() < 4 || t[1] != "=" {
            return Err(perr(line, "expected 'G = op(args)'"));
        }
        let op_name = t[2].to_ascii_lowercase();
        if t[3] != "(" || t.last().map(|s| s.as_str()) != Some(")") {
            return Err(perr(line, "expected parenthesized argument list"));
        }
        let mut args = vec![];
        for tok in &t[4..t.len() - 1] {
            args.push(parse_i64(tok, line)?);
        }
        match op_name.as_str() {
            "and" => {
                ckt.gates.insert(gate, (GateOp::And, expand_lists(args, &list_defs)));
            }
            "or" => {
                ckt.gates.insert(gate, (GateOp::Or, expand_lists(args, &list_defs)));
            }
            "list" => {
                list_defs.insert(gate, args);
            }
            "forall" | "exists" | "free" => {
                return Err(perr(
                    line,
                    "quantifier gates are not supported (non-prenex input)",
                ));
            }
            other => return Err(perr(line, format!("unrecognized operator '{}'", other))),
        }
        cur = lines.next_toks()?;
    }

    validate_circuit(&ckt)?;
    Ok(ckt)
}

fn expand_lists(args: Vec<i64>, list_defs: &HashMap<i64, Vec<i64>>) -> Vec<i64> {
    let mut out = vec![];
    for a in args {
        match list_defs.get(&a) {
            Some(items) => out.extend_from_slice(items),
            None => out.push(a),
        }
    }
    out
}

fn validate_circuit(ckt: &ParsedCircuit) -> Result<()> {
    let e = |msg: String| Err(SolverError::Parse(msg));
    let mut prev_qvar = 0i64;
    for (_, qvars) in &ckt.blocks {
        for &v in qvars {
            if v <= 0 {
                return e(format!("quantified variable {} is not positive", v));
            }
            if v % 2 != 0 {
                return e(format!("quantified variable {} is not even", v));
            }
            if v != prev_qvar + 2 {
                return e(format!(
                    "quantified variables must be contiguous: found {} after {}",
                    v, prev_qvar
                ));
            }
            if v > ckt.last_input_var {
                return e(format!("quantified variable {} is out of range", v));
            }
            prev_qvar = v;
        }
    }
    for (&gate, (_, args)) in &ckt.gates {
        if gate <= 0 {
            return e(format!("gate number {} is not positive", gate));
        }
        if gate % 2 != 0 {
            return e(format!("gate number {} is not even", gate));
        }
        if gate <= ckt.last_input_var {
            return e(format!("gate number {} collides with the input range", gate));
        }
        if args.len() == 1 {
            return e(format!("gate {} needs at least two arguments", gate));
        }
        for &a in args {
            if a.abs() >= gate {
                return e(format!(
                    "argument {} of gate {} is not numbered below its gate",
                    a, gate
                ));
            }
            if a.abs() > ckt.last_input_var && !ckt.gates.contains_key(&a.abs()) {
                return e(format!("argument {} of gate {} is undefined", a, gate));
            }
            if a == 0 {
                return e(format!("gate {} has a zero argument", gate));
            }
        }
        let mut sorted = args.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != args.len() {
            log::warn!("gate {} has a duplicated argument", gate);
        }
    }
    let out = ckt.output_lit.abs();
    if out == 0 || !ckt.gates.contains_key(&out) {
        return e(format!("output gate {} is undefined", ckt.output_lit));
    }
    Ok(())
}

/// Parses the QCIR-G14 text format into the same circuit representation,
/// numbering variables in order of appearance.
pub fn parse_qcir<R: BufRead>(reader: R) -> Result<ParsedCircuit> {
    let mut lines = Lines::new(reader);

    // The '#QCIR-G14' header line tokenizes to nothing ('#' starts a
    // comment), so read it raw first.
    let mut header = String::new();
    lines.reader.read_line(&mut header)?;
    lines.num += 1;
    if !header.trim_start().starts_with("#QCIR") {
        return Err(perr(lines.num, "missing #QCIR-G14 header"));
    }

    let mut name_to_num: HashMap<String, i64> = HashMap::new();
    let mut var_names: HashMap<i64, String> = HashMap::new();
    let mut next_var = 0i64;
    let mut blocks: Vec<(QType, Vec<i64>)> = vec![];
    let mut gates: BTreeMap<i64, (GateOp, Vec<i64>)> = BTreeMap::new();
    let mut output: Option<(bool, String)> = None;
    let mut last_input_var = 0i64;

    let mut lit_of = |name: &str,
                      neg: bool,
                      names: &mut HashMap<String, i64>,
                      line: usize|
     -> Result<i64> {
        match names.get(name) {
            Some(&n) => Ok(if neg { -n } else { n }),
            None => Err(perr(line, format!("undefined variable or gate '{}'", name))),
        }
    };

    while let Some(t) = lines.next_toks()? {
        let line = lines.num;
        let head = t[0].to_ascii_lowercase();
        match head.as_str() {
            "exists" | "forall" | "free" => {
                let qtype = match head.as_str() {
                    "exists" => QType::Exists,
                    "forall" => QType::Forall,
                    _ => QType::Free,
                };
                if t.get(1).map(|s| s.as_str()) != Some("(") {
                    return Err(perr(line, "expected '(' after quantifier"));
                }
                let mut qvars = vec![];
                for tok in &t[2..] {
                    if tok == ")" {
                        break;
                    }
                    if name_to_num.contains_key(tok) {
                        return Err(perr(line, format!("variable '{}' quantified twice", tok)));
                    }
                    next_var += 2;
                    name_to_num.insert(tok.clone(), next_var);
                    var_names.insert(next_var, tok.clone());
                    qvars.push(next_var);
                }
                last_input_var = next_var;
                blocks.push((qtype, qvars));
            }
            "output" => {
                let mut ix = 2;
                let mut neg = false;
                if t.get(ix).map(|s| s.as_str()) == Some("-") {
                    neg = true;
                    ix += 1;
                }
                let name = t
                    .get(ix)
                    .ok_or_else(|| perr(line, "expected 'output(lit)'"))?;
                output = Some((neg, name.clone()));
            }
            _ => {
                // Gate line: name = op(args)
                if t.get(1).map(|s| s.as_str()) != Some("=") {
                    return Err(perr(line, "expected 'g = op(args)'"));
                }
                let op = match t[2].to_ascii_lowercase().as_str() {
                    "and" => GateOp::And,
                    "or" => GateOp::Or,
                    other => {
                        return Err(perr(
                            line,
                            format!("unsupported QCIR gate operator '{}'", other),
                        ))
                    }
                };
                let mut args = vec![];
                let mut ix = 4;
                while ix < t.len() && t[ix] != ")" {
                    if t[ix] == ";" {
                        return Err(perr(line, "quantifier gates are not supported"));
                    }
                    let mut neg = false;
                    if t[ix] == "-" {
                        neg = true;
                        ix += 1;
                    }
                    args.push(lit_of(&t[ix], neg, &mut name_to_num, line)?);
                    ix += 1;
                }
                next_var += 2;
                if name_to_num.contains_key(&t[0]) {
                    return Err(perr(line, format!("gate '{}' defined twice", t[0])));
                }
                name_to_num.insert(t[0].clone(), next_var);
                var_names.insert(next_var, t[0].clone());
                gates.insert(next_var, (op, args));
            }
        }
    }

    let (oneg, oname) = output.ok_or_else(|| SolverError::Parse("missing output line".into()))?;
    let output_lit = match name_to_num.get(&oname) {
        Some(&n) => {
            if oneg {
                -n
            } else {
                n
            }
        }
        None => return Err(SolverError::Parse(format!("undefined output '{}'", oname))),
    };

    let ckt = ParsedCircuit {
        last_input_var,
        last_gate_var: next_var,
        output_lit,
        preproc_time_milli: 0,
        var_names,
        blocks,
        gates,
    };
    validate_circuit(&ckt)?;
    Ok(ckt)
}

/// Dispatches on the header line: `CktQBF` or `#QCIR`.
pub fn parse_circuit<R: BufRead>(mut reader: R) -> Result<ParsedCircuit> {
    let mut all = String::new();
    reader.read_to_string(&mut all)?;
    let first = all.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    if first.trim_start().starts_with("#QCIR") {
        parse_qcir(all.as_bytes())
    } else {
        parse_ghostq(all.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = "CktQBF\n\
        LastInputVar 4\n\
        LastGateVar 6\n\
        OutputGateLit 6\n\
        <q gate=6>\n\
        e 2 4\n\
        </q>\n\
        6 = or(2, 4)\n";

    #[test]
    fn parses_small_ghostq() {
        let ckt = parse_ghostq(SMALL.as_bytes()).unwrap();
        assert_eq!(ckt.last_input_var, 4);
        assert_eq!(ckt.output_lit, 6);
        assert_eq!(ckt.blocks.len(), 1);
        assert_eq!(ckt.blocks[0], (QType::Exists, vec![2, 4]));
        assert_eq!(ckt.gates[&6], (GateOp::Or, vec![2, 4]));
    }

    #[test]
    fn rejects_odd_and_noncontiguous_vars() {
        let bad = SMALL.replace("e 2 4", "e 2 3");
        assert!(parse_ghostq(bad.as_bytes()).is_err());
        let bad2 = SMALL.replace("e 2 4", "e 4 2");
        assert!(parse_ghostq(bad2.as_bytes()).is_err());
    }

    #[test]
    fn rejects_undefined_and_misnumbered_args() {
        let bad = SMALL.replace("6 = or(2, 4)", "6 = or(2, 8)");
        assert!(parse_ghostq(bad.as_bytes()).is_err());
        let bad2 = SMALL.replace("6 = or(2, 4)", "6 = or(2)");
        assert!(parse_ghostq(bad2.as_bytes()).is_err());
    }

    #[test]
    fn list_defs_expand() {
        let src = "CktQBF\nLastInputVar 4\nLastGateVar 8\nOutputGateLit 8\n\
            <q gate=8>\ne 2 4\n</q>\n\
            6 = list(2, 4)\n\
            8 = and(6, -2)\n";
        let ckt = parse_ghostq(src.as_bytes()).unwrap();
        assert_eq!(ckt.gates[&8], (GateOp::And, vec![2, 4, -2]));
        assert!(!ckt.gates.contains_key(&6));
    }

    #[test]
    fn var_names_are_kept() {
        let src = SMALL.replace(
            "OutputGateLit 6\n",
            "OutputGateLit 6\nVarName 2 : alpha\n",
        );
        let ckt = parse_ghostq(src.as_bytes()).unwrap();
        assert_eq!(ckt.var_names[&2], "alpha");
    }

    #[test]
    fn parses_small_qcir() {
        let src = "#QCIR-G14\n\
            forall(x)\n\
            exists(y)\n\
            output(g1)\n\
            g1 = or(-x, y)\n";
        let ckt = parse_qcir(src.as_bytes()).unwrap();
        assert_eq!(ckt.last_input_var, 4);
        assert_eq!(ckt.blocks[0].0, QType::Forall);
        assert_eq!(ckt.blocks[1].0, QType::Exists);
        assert_eq!(ckt.output_lit, 6);
        assert_eq!(ckt.gates[&6], (GateOp::Or, vec![-2, 4]));
        assert_eq!(ckt.var_names[&2], "x");
    }

    #[test]
    fn circuit_dispatch_by_header() {
        assert!(parse_circuit(SMALL.as_bytes()).is_ok());
        let qcir = "#QCIR-G14\nexists(x, y)\noutput(g)\ng = and(x, y)\n";
        assert!(parse_circuit(qcir.as_bytes()).is_ok());
    }

    #[test]
    fn contradictory_gate_args_are_allowed() {
        let src = "CktQBF\nLastInputVar 2\nLastGateVar 4\nOutputGateLit 4\n\
            <q gate=4>\ne 2\n</q>\n\
            4 = and(2, -2)\n";
        let ckt = parse_ghostq(src.as_bytes()).unwrap();
        assert_eq!(ckt.gates[&4], (GateOp::And, vec![2, -2]));
    }
}
