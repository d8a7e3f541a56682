//! Driver tests: exit codes, the one-line answer, and the emitters.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

const TRUE_CKT: &str = "CktQBF\nLastInputVar 4\nLastGateVar 6\nOutputGateLit 6\n\
    <q gate=6>\ne 2 4\n</q>\n6 = or(2, 4)\n";

const FALSE_CKT: &str = "CktQBF\nLastInputVar 2\nLastGateVar 4\nOutputGateLit 4\n\
    <q gate=4>\ne 2\n</q>\n4 = and(2, -2)\n";

fn write_input(text: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(text.as_bytes()).unwrap();
    f
}

fn ghostsat() -> Command {
    Command::cargo_bin("ghostsat").unwrap()
}

#[test]
fn true_instance_exits_10() {
    let input = write_input(TRUE_CKT);
    ghostsat()
        .arg(input.path())
        .assert()
        .code(10)
        .stdout(predicate::str::contains("true."));
}

#[test]
fn false_instance_exits_20() {
    let input = write_input(FALSE_CKT);
    ghostsat()
        .arg(input.path())
        .assert()
        .code(20)
        .stdout(predicate::str::contains("false."));
}

#[test]
fn quiet_mode_prints_answer_only() {
    let input = write_input(FALSE_CKT);
    ghostsat()
        .arg(input.path())
        .args(["--q2", "--no-time"])
        .assert()
        .code(20)
        .stdout(predicate::str::contains("false."));
}

#[test]
fn s_cnf_line_is_printed() {
    let input = write_input(TRUE_CKT);
    ghostsat()
        .arg(input.path())
        .arg("--s-cnf")
        .assert()
        .code(10)
        .stdout(predicate::str::contains("s cnf 1"));
}

#[test]
fn parse_error_exits_nonzero_with_message() {
    let input = write_input("CktQBF\nLastInputVar 3\n");
    ghostsat()
        .arg(input.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("parse error").or(predicate::str::contains("expected")));
}

#[test]
fn missing_file_is_reported() {
    ghostsat()
        .arg("/nonexistent/path/to/circuit.gq")
        .assert()
        .code(1)
        .stderr(predicate::str::is_empty().not());
}

#[test]
fn seed_option_is_echoed() {
    let input = write_input(TRUE_CKT);
    ghostsat()
        .arg(input.path())
        .args(["-s", "7"])
        .assert()
        .code(10)
        .stdout(predicate::str::contains("#Seed:  7"));
}

#[test]
fn free_variables_require_the_flag() {
    let free = TRUE_CKT.replace("e 2 4", "f 2\ne 4");
    let input = write_input(&free);
    ghostsat().arg(input.path()).assert().code(1);
    ghostsat()
        .arg(input.path())
        .arg("--allow-free")
        .assert()
        .code(predicate::in_iter(vec![10, 99]));
}

#[test]
fn strategy_file_is_written() {
    let input = write_input(TRUE_CKT);
    let strat = NamedTempFile::new().unwrap();
    ghostsat()
        .arg(input.path())
        .args(["--allow-free", "--strat"])
        .arg(strat.path())
        .assert()
        .code(10);
    let text = std::fs::read_to_string(strat.path()).unwrap();
    assert!(text.contains("list("), "strategy listing: {}", text);
}

#[test]
fn strat_without_allow_free_is_rejected() {
    let input = write_input(TRUE_CKT);
    ghostsat()
        .arg(input.path())
        .args(["--strat", "/tmp/ignored.strat"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("allow-free"));
}

#[test]
fn write_gq_round_trips() {
    let input = write_input(TRUE_CKT);
    let out = NamedTempFile::new().unwrap();
    ghostsat()
        .arg(input.path())
        .arg("--write-gq")
        .arg(out.path())
        .assert()
        .code(0);
    // The emitted circuit parses and solves to the same answer.
    ghostsat().arg(out.path()).assert().code(10);
}

#[test]
fn write_dimacs_emits_cnf_header() {
    let input = write_input(TRUE_CKT);
    let out = NamedTempFile::new().unwrap();
    ghostsat()
        .arg(input.path())
        .arg("--write-dimacs")
        .arg(out.path())
        .assert()
        .code(0);
    let text = std::fs::read_to_string(out.path()).unwrap();
    assert!(text.starts_with("p cnf "), "dimacs: {}", text);
}

#[test]
fn just_print_writes_the_formula() {
    let input = write_input(TRUE_CKT);
    ghostsat()
        .arg(input.path())
        .arg("--just-print")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("exists("));
    ghostsat()
        .arg(input.path())
        .args(["--just-print", "--write-qcir"])
        .assert()
        .code(0)
        .stdout(predicate::str::starts_with("#QCIR-G14"));
}

#[test]
fn gzipped_input_is_accepted() {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut raw = Vec::new();
    {
        let mut enc = GzEncoder::new(&mut raw, Compression::default());
        enc.write_all(TRUE_CKT.as_bytes()).unwrap();
        enc.finish().unwrap();
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ckt.gq.gz");
    std::fs::write(&path, &raw).unwrap();
    ghostsat().arg(&path).assert().code(10);
}

#[test]
fn qcir_input_is_accepted() {
    let src = "#QCIR-G14\nexists(x, y)\noutput(g)\ng = or(x, y)\n";
    let input = write_input(src);
    ghostsat().arg(input.path()).assert().code(10);
}
