//! Bridge to an external SAT solver, used by the auxiliary
//! "get a satisfying assignment" operation.
//!
//! The formula is brought into negation normal form, Tseitin-encoded into
//! a DIMACS file in a temporary directory, and the configured executable
//! is invoked as `<exe> <dimacs> <out>`. The output file starts with `SAT`
//! or `UNSAT`, followed by a space-separated list of signed literals
//! terminated by `0`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;

use crate::error::{Result, SolverError};
use crate::fmla::{FmlaOp, FmlaRef, Fmlas};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SatOutcome {
    Unsat,
    /// Assignment of the formula's variables by name.
    Sat(HashMap<String, bool>),
}

struct Tseitin<'a> {
    fmlas: &'a Fmlas,
    num_of: HashMap<FmlaRef, i64>,
    next: i64,
    clauses: Vec<Vec<i64>>,
    var_names: Vec<(i64, String)>,
}

impl<'a> Tseitin<'a> {
    fn lit_of(&mut self, f: FmlaRef) -> Result<i64> {
        match self.fmlas.op(f) {
            FmlaOp::Not => {
                let inner = self.lit_of(self.fmlas.args(f)[0])?;
                Ok(-inner)
            }
            FmlaOp::Var => {
                if let Some(&n) = self.num_of.get(&f) {
                    return Ok(n);
                }
                self.next += 1;
                self.num_of.insert(f, self.next);
                self.var_names
                    .push((self.next, self.fmlas.var_name(f).expect("var node").to_string()));
                Ok(self.next)
            }
            FmlaOp::And | FmlaOp::Or => {
                if let Some(&n) = self.num_of.get(&f) {
                    return Ok(n);
                }
                let is_and = self.fmlas.op(f) == FmlaOp::And;
                let mut arg_lits = vec![];
                for &a in self.fmlas.args(f) {
                    arg_lits.push(self.lit_of(a)?);
                }
                self.next += 1;
                let g = self.next;
                self.num_of.insert(f, g);
                let mut long = vec![if is_and { g } else { -g }];
                for &al in &arg_lits {
                    if is_and {
                        long.push(-al);
                        self.clauses.push(vec![-g, al]);
                    } else {
                        long.push(al);
                        self.clauses.push(vec![g, -al]);
                    }
                }
                self.clauses.push(long);
                Ok(g)
            }
            op => Err(SolverError::Unsupported(format!(
                "operator '{}' in a SAT query (expected NNF)",
                op.name()
            ))),
        }
    }
}

/// Tseitin-encodes an NNF formula; returns the DIMACS text and the
/// variable-name table.
pub fn tseitin_dimacs(fmlas: &Fmlas, f: FmlaRef) -> Result<(String, Vec<(i64, String)>)> {
    let mut t = Tseitin {
        fmlas,
        num_of: HashMap::new(),
        next: 0,
        clauses: vec![],
        var_names: vec![],
    };
    let root = t.lit_of(f)?;
    t.clauses.push(vec![root]);
    let mut text = String::new();
    text.push_str(&format!("p cnf {} {}\n", t.next, t.clauses.len()));
    for c in &t.clauses {
        for l in c {
            text.push_str(&format!("{} ", l));
        }
        text.push_str("0\n");
    }
    Ok((text, t.var_names))
}

/// Parses the solver's output file contents.
pub fn parse_sat_output(text: &str) -> Result<SatOutcome> {
    let mut toks = text.split_whitespace();
    match toks.next() {
        Some("UNSAT") => Ok(SatOutcome::Unsat),
        Some("SAT") => {
            let mut lits = HashMap::new();
            for t in toks {
                let n: i64 = t.parse().map_err(|_| {
                    SolverError::Parse(format!("bad literal '{}' in SAT output", t))
                })?;
                if n == 0 {
                    break;
                }
                lits.insert(n.abs(), n > 0);
            }
            Ok(SatOutcome::Sat(
                lits.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            ))
        }
        other => Err(SolverError::Parse(format!(
            "expected SAT or UNSAT, found {:?}",
            other
        ))),
    }
}

/// Runs the external solver on the formula, mapping the assignment back to
/// variable names. `Ok(None)` means the formula folded to a constant.
pub fn run_external_sat(
    fmlas: &mut Fmlas,
    f: FmlaRef,
    exe: &Path,
) -> Result<SatOutcome> {
    let nnf = fmlas.to_nnf(f);
    if nnf == Fmlas::TRUE {
        return Ok(SatOutcome::Sat(HashMap::new()));
    }
    if nnf == Fmlas::FALSE {
        return Ok(SatOutcome::Unsat);
    }
    let (dimacs, names) = tseitin_dimacs(fmlas, nnf)?;
    let dir = tempfile::tempdir()?;
    let in_path = dir.path().join("query.cnf");
    let out_path = dir.path().join("query.out");
    {
        let mut file = fs::File::create(&in_path)?;
        file.write_all(dimacs.as_bytes())?;
    }
    let status = Command::new(exe).arg(&in_path).arg(&out_path).status()?;
    if !status.success() && !out_path.exists() {
        return Err(SolverError::Unsupported(format!(
            "external SAT solver failed with {}",
            status
        )));
    }
    let text = fs::read_to_string(&out_path)?;
    let by_num = parse_sat_output(&text)?;
    match by_num {
        SatOutcome::Unsat => Ok(SatOutcome::Unsat),
        SatOutcome::Sat(nums) => {
            let name_of: HashMap<String, String> = names
                .into_iter()
                .map(|(n, name)| (n.to_string(), name))
                .collect();
            let mut out = HashMap::new();
            for (num, val) in nums {
                if let Some(name) = name_of.get(&num) {
                    out.insert(name.clone(), val);
                }
            }
            Ok(SatOutcome::Sat(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tseitin_encodes_and_or() {
        let mut f = Fmlas::new();
        let x = f.var("x");
        let y = f.var("y");
        let ny = f.negate(y);
        let or = f.intern(FmlaOp::Or, &[x, ny]).unwrap();
        let (text, names) = tseitin_dimacs(&f, or).unwrap();
        assert!(text.starts_with("p cnf 3 "));
        assert_eq!(names.len(), 2);
        assert!(text.lines().count() > 3);
    }

    #[test]
    fn sat_output_parses() {
        assert_eq!(parse_sat_output("UNSAT\n").unwrap(), SatOutcome::Unsat);
        match parse_sat_output("SAT 1 -2 3 0 trailing").unwrap() {
            SatOutcome::Sat(m) => {
                assert_eq!(m.get("1"), Some(&true));
                assert_eq!(m.get("2"), Some(&false));
                assert_eq!(m.get("3"), Some(&true));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_sat_output("MAYBE 0").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn external_solver_round_trip() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("fakesat.sh");
        fs::write(&exe, "#!/bin/sh\necho \"SAT 1 2 0\" > \"$2\"\n").unwrap();
        let mut perms = fs::metadata(&exe).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&exe, perms).unwrap();

        let mut f = Fmlas::new();
        let x = f.var("x");
        let y = f.var("y");
        let and = f.intern(FmlaOp::And, &[x, y]).unwrap();
        match run_external_sat(&mut f, and, &exe).unwrap() {
            SatOutcome::Sat(m) => {
                assert_eq!(m.get("x"), Some(&true));
                assert_eq!(m.get("y"), Some(&true));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
