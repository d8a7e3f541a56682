//! End-to-end scenarios: small circuits with known truth values, and
//! semantic checks of the emitted strategies (the strategy formula is
//! evaluated against every assignment of the outer variables rather than
//! compared syntactically).

use std::collections::HashMap;

use ghostsat::fmla::{FmlaOp, FmlaRef, Fmlas};
use ghostsat::{BuildOpts, Circuit, Outcome, SeqId, Solver, SolverOpts};

fn solve(src: &str, opts: SolverOpts) -> (Solver, SeqId) {
    let parsed = ghostsat::parse_ghostq(src.as_bytes()).unwrap();
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
    let mut solver = Solver::new(ckt, fmlas, opts);
    let fin = solver.solve().unwrap();
    (solver, fin)
}

fn answer(src: &str) -> Outcome {
    let (s, fin) = solve(src, SolverOpts::default());
    s.outcome(fin)
}

fn strat_opts() -> SolverOpts {
    let mut opts = SolverOpts::default();
    opts.allow_free = true;
    opts.strat_enabled = true;
    opts
}

/// Pulls the strategy listing apart into (variable name, formula) pairs.
fn strategy_items(s: &mut Solver, fin: SeqId) -> Vec<(String, FmlaRef)> {
    let listing = s.strategy_list_fmla(fin, false).expect("strategy recorded");
    let fm = &s.fmlas;
    assert_eq!(fm.op(listing), FmlaOp::List);
    let mut items = vec![];
    for &entry in fm.args(listing) {
        assert_eq!(fm.op(entry), FmlaOp::List);
        let var = fm.args(entry)[0];
        let val = fm.args(entry)[1];
        items.push((fm.var_name(var).expect("var entry").to_string(), val));
    }
    items
}

/// Plays the strategy against every assignment of `adversary` variables
/// and checks that the matrix evaluates to `expected`.
fn check_strategy(
    s: &Solver,
    matrix: FmlaRef,
    adversary: &[&str],
    items: &[(String, FmlaRef)],
    expected: bool,
) {
    let n = adversary.len();
    for bits in 0..(1u32 << n) {
        let mut asgn: HashMap<String, bool> = HashMap::new();
        for (i, name) in adversary.iter().enumerate() {
            asgn.insert(name.to_string(), bits & (1 << i) != 0);
        }
        for (name, f) in items {
            let lookup = |n: &str| asgn.get(n).copied();
            if let Some(v) = s.fmlas.eval_with(*f, &lookup) {
                asgn.entry(name.clone()).or_insert(v);
            }
        }
        let lookup = |n: &str| asgn.get(n).copied();
        assert_eq!(
            s.fmlas.eval_with(matrix, &lookup),
            Some(expected),
            "adversary bits {:b}, assignment {:?}",
            bits,
            asgn
        );
    }
}

fn matrix_of(s: &mut Solver) -> FmlaRef {
    // Strip the quantifier prefix off the original formula.
    let mut f = s.ckt.orig_fmla;
    while s.fmlas.op(f).is_quant() {
        f = s.fmlas.args(f)[1];
    }
    f
}

// ---------------------------------------------------------------------
// The literal scenarios.

#[test]
fn scenario_1_contradictory_and_is_false() {
    let src = "CktQBF\nLastInputVar 2\nLastGateVar 4\nOutputGateLit 4\n\
        <q gate=4>\ne 2\n</q>\n\
        4 = and(2, -2)\n";
    assert_eq!(answer(src), Outcome::False);
}

#[test]
fn scenario_2_or_of_existentials_is_true_with_strategy() {
    let src = "CktQBF\nLastInputVar 4\nLastGateVar 6\nOutputGateLit 6\n\
        <q gate=6>\ne 2 4\n</q>\n\
        6 = or(2, 4)\n";
    assert_eq!(answer(src), Outcome::True);

    let (mut s, fin) = solve(src, strat_opts());
    assert_eq!(s.outcome(fin), Outcome::True);
    let items = strategy_items(&mut s, fin);
    let matrix = matrix_of(&mut s);
    check_strategy(&s, matrix, &[], &items, true);
}

#[test]
fn scenario_3_tautological_or_is_true() {
    let src = "CktQBF\nLastInputVar 4\nLastGateVar 6\nOutputGateLit 6\n\
        <q gate=6>\na 2\ne 4\n</q>\n\
        6 = or(2, -2, 4)\n";
    assert_eq!(answer(src), Outcome::True);

    let (mut s, fin) = solve(src, strat_opts());
    assert_eq!(s.outcome(fin), Outcome::True);
    let items = strategy_items(&mut s, fin);
    let matrix = matrix_of(&mut s);
    check_strategy(&s, matrix, &["2"], &items, true);
}

// eq(2, 4) encoded with and/or gates:
// 6 = and(2, 4); 8 = and(-2, -4); 10 = or(6, 8).
const EQ_FORALL_EXISTS: &str = "CktQBF\nLastInputVar 4\nLastGateVar 10\nOutputGateLit 10\n\
    <q gate=10>\na 2\ne 4\n</q>\n\
    6 = and(2, 4)\n\
    8 = and(-2, -4)\n\
    10 = or(6, 8)\n";

#[test]
fn scenario_4_forall_exists_eq_is_true_with_copy_strategy() {
    assert_eq!(answer(EQ_FORALL_EXISTS), Outcome::True);

    let (mut s, fin) = solve(EQ_FORALL_EXISTS, strat_opts());
    assert_eq!(s.outcome(fin), Outcome::True);
    let items = strategy_items(&mut s, fin);
    let matrix = matrix_of(&mut s);
    // The existential player must mirror variable 2.
    check_strategy(&s, matrix, &["2"], &items, true);
}

#[test]
fn scenario_5_exists_forall_eq_is_false() {
    let src = EQ_FORALL_EXISTS.replace("a 2", "e 2").replace("e 4", "a 4");
    assert_eq!(answer(&src), Outcome::False);

    // The universal player wins; its counter-strategy must falsify the
    // matrix whatever the existential player picks.
    let (mut s, fin) = solve(&src, strat_opts());
    assert_eq!(s.outcome(fin), Outcome::False);
    let items = strategy_items(&mut s, fin);
    let matrix = matrix_of(&mut s);
    check_strategy(&s, matrix, &["2"], &items, false);
}

#[test]
fn scenario_6_free_or_yields_winning_strategy() {
    let src = "CktQBF\nLastInputVar 4\nLastGateVar 6\nOutputGateLit 6\n\
        <q gate=6>\nf 2\ne 4\n</q>\n\
        6 = or(2, 4)\n";
    let (mut s, fin) = solve(src, strat_opts());
    // The instance is true for every value of the free variable; the
    // answer formula must evaluate to true under both.
    match s.outcome(fin) {
        Outcome::False => panic!("free OR instance reported false"),
        Outcome::True => {}
        Outcome::Free(f) => {
            for v2 in [false, true] {
                let lookup = |n: &str| if n == "2" { Some(v2) } else { None };
                assert_eq!(s.fmlas.eval_with(f, &lookup), Some(true));
            }
        }
    }
    let items = strategy_items(&mut s, fin);
    let matrix = matrix_of(&mut s);
    check_strategy(&s, matrix, &["2"], &items, true);
}

// ---------------------------------------------------------------------
// Larger sanity checks.

#[test]
fn nested_prefix_alternations() {
    // forall 2 exists 4 forall 6 exists 8: (2 eq 4) and (6 eq 8)
    let src = "CktQBF\nLastInputVar 8\nLastGateVar 20\nOutputGateLit 20\n\
        <q gate=20>\na 2\ne 4\na 6\ne 8\n</q>\n\
        10 = and(2, 4)\n\
        12 = and(-2, -4)\n\
        14 = or(10, 12)\n\
        16 = and(6, 8)\n\
        18 = or(16, -6)\n\
        20 = and(14, 18)\n";
    // 18 = or(and(6,8), -6) is true when 6 false or 8 true: exists 8 wins.
    assert_eq!(answer(src), Outcome::True);
}

#[test]
fn deep_false_instance() {
    // exists 2 forall 4: (2 eq 4) is false, wrapped once more.
    let src = "CktQBF\nLastInputVar 4\nLastGateVar 12\nOutputGateLit 12\n\
        <q gate=12>\ne 2\na 4\n</q>\n\
        6 = and(2, 4)\n\
        8 = and(-2, -4)\n\
        10 = or(6, 8)\n\
        12 = and(10, 10)\n";
    assert_eq!(answer(src), Outcome::False);
}

#[test]
fn qcir_input_gives_same_answer() {
    let src = "#QCIR-G14\n\
        forall(x)\n\
        exists(y)\n\
        output(g3)\n\
        g1 = and(x, y)\n\
        g2 = and(-x, -y)\n\
        g3 = or(g1, g2)\n";
    let parsed = ghostsat::parse_circuit(src.as_bytes()).unwrap();
    let mut fmlas = Fmlas::new();
    let ckt = Circuit::build(&parsed, &mut fmlas, BuildOpts::default()).unwrap();
    let mut solver = Solver::new(ckt, fmlas, SolverOpts::default());
    let fin = solver.solve().unwrap();
    assert_eq!(solver.outcome(fin), Outcome::True);
}

#[test]
fn answers_are_stable_across_seeds() {
    for seed in 1..6 {
        let mut opts = SolverOpts::default();
        opts.seed = seed;
        let (s, fin) = solve(EQ_FORALL_EXISTS, opts);
        assert_eq!(s.outcome(fin), Outcome::True, "seed {}", seed);
    }
}

#[test]
fn cegar_mode_keeps_answers() {
    let mut opts = SolverOpts::default();
    opts.allow_cegar = true;
    let (s, fin) = solve(EQ_FORALL_EXISTS, opts);
    assert_eq!(s.outcome(fin), Outcome::True);

    let src = EQ_FORALL_EXISTS.replace("a 2", "e 2").replace("e 4", "a 4");
    let mut opts = SolverOpts::default();
    opts.allow_cegar = true;
    let (s, fin) = solve(&src, opts);
    assert_eq!(s.outcome(fin), Outcome::False);
}

#[test]
fn proof_log_records_sequents_and_resolutions() {
    use std::io::Read;

    let parsed = ghostsat::parse_ghostq(EQ_FORALL_EXISTS.as_bytes()).unwrap();
    let mut fmlas = Fmlas::new();
    let mut opts = SolverOpts::default();
    opts.allow_free = true;
    let ckt = Circuit::build(
        &parsed,
        &mut fmlas,
        BuildOpts {
            allow_free: true,
            alloc_cegar_vars: false,
        },
    )
    .unwrap();
    let mut solver = Solver::new(ckt, fmlas, opts);
    let log = tempfile::NamedTempFile::new().unwrap();
    solver.set_proof_log(Box::new(log.reopen().unwrap()));
    solver.solve().unwrap();
    let mut text = String::new();
    log.reopen().unwrap().read_to_string(&mut text).unwrap();
    assert!(text.contains(":gseq("));
    assert!(text.contains(":resolve($gs"));
    assert!(text.contains("# UIP:"));
}
