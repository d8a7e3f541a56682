use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::exit;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{App, Arg};
use cpu_time::ProcessTime;
use flate2::read::GzDecoder;
use log::debug;

use ghostsat::error::SolverError;
use ghostsat::fmla_io;
use ghostsat::output;
use ghostsat::sat::{run_external_sat, SatOutcome};
use ghostsat::{BuildOpts, Circuit, Fmlas, Outcome, Solver, SolverOpts};

fn open_input(path: &str) -> io::Result<Box<dyn BufRead>> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(path)?;
    if path.ends_with(".gz") {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn seed_from_time() -> i32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    (now.as_secs() as i32)
        .wrapping_mul(10_000)
        .wrapping_add((now.subsec_micros() / 100) as i32)
}

fn print_stats(s: &Solver, cpu: f64) {
    let per_sec = |x: u64| x as f64 / cpu.max(1e-9);
    println!(
        "Conflicts:    {:10}  ({:9.0} / sec)",
        s.stats.conflicts,
        per_sec(s.stats.conflicts)
    );
    println!(
        "Decisions:    {:10}  ({:9.0} / sec)",
        s.stats.decisions,
        per_sec(s.stats.decisions)
    );
    println!(
        "Propagations: {:10}  ({:9.0} / sec)",
        s.stats.propagations,
        per_sec(s.stats.propagations)
    );
    println!(
        "Watch fixes:  {:10}  ({:9.0} / sec)",
        s.stats.watch_fixes,
        per_sec(s.stats.watch_fixes)
    );
    println!("Watch cleans: {:10}", s.db.num_watch_cleanups);
    println!("max_learnts:  {:10.0}", s.stats.max_learnts);
    println!("NumReducs:    {:10}", s.stats.lfut_reductions);
}

fn run() -> i32 {
    env_logger::init();
    let matches = App::new("ghostsat")
        .about("Circuit QBF solver with ghost variables and game-state learning")
        .arg(Arg::with_name("input").required(true).help(
            "Input circuit (GhostQ or QCIR format, optionally gzipped; '-' for stdin)",
        ))
        .arg(
            Arg::with_name("seed")
                .short("s")
                .long("seed")
                .takes_value(true)
                .help("Seed for the random number generator"),
        )
        .arg(
            Arg::with_name("stime")
                .long("stime")
                .help("Seed the random number generator from the current time"),
        )
        .arg(
            Arg::with_name("time-out")
                .long("time-out")
                .takes_value(true)
                .help("Abort after N seconds"),
        )
        .arg(
            Arg::with_name("allow-free")
                .short("f")
                .long("allow-free")
                .help("Allow free variables; enables strategy answers"),
        )
        .arg(
            Arg::with_name("cegar")
                .long("cegar")
                .takes_value(true)
                .help("1 to enable CEGAR gate synthesis, 0 to disable"),
        )
        .arg(
            Arg::with_name("no-monotone")
                .long("no-monotone")
                .help("Disable monotone-literal seeding inside CEGAR"),
        )
        .arg(
            Arg::with_name("strat")
                .long("strat")
                .takes_value(true)
                .help("Write a strategy for the winning player to FILE"),
        )
        .arg(
            Arg::with_name("raw-strat")
                .long("raw-strat")
                .help("Skip substitution chaining in the strategy listing"),
        )
        .arg(
            Arg::with_name("plog")
                .long("plog")
                .takes_value(true)
                .help("Write a proof log of resolved sequents to FILE"),
        )
        .arg(
            Arg::with_name("write-qcir")
                .long("write-qcir")
                .help("Write formulas in QCIR format"),
        )
        .arg(
            Arg::with_name("write-gq")
                .long("write-gq")
                .takes_value(true)
                .help("Write the parsed circuit in GhostQ format to FILE and exit"),
        )
        .arg(
            Arg::with_name("write-dimacs")
                .long("write-dimacs")
                .takes_value(true)
                .help("Write the parsed circuit in QDIMACS format to FILE and exit"),
        )
        .arg(
            Arg::with_name("just-print")
                .long("just-print")
                .help("Print the parsed formula and exit"),
        )
        .arg(
            Arg::with_name("no-restart")
                .long("no-restart")
                .help("Disable restarts"),
        )
        .arg(
            Arg::with_name("restart-cycle")
                .long("restart-cycle")
                .takes_value(true)
                .help("Base number of conflicts between restarts"),
        )
        .arg(
            Arg::with_name("var-ord-fix")
                .long("var-ord-fix")
                .help("Pin pseudo-random decisions for regression runs"),
        )
        .arg(
            Arg::with_name("sat-exe")
                .long("sat-exe")
                .takes_value(true)
                .help("External SAT solver used by --get-asgn"),
        )
        .arg(
            Arg::with_name("get-asgn")
                .long("get-asgn")
                .help("Ask the external SAT solver for a satisfying assignment"),
        )
        .arg(Arg::with_name("q1").long("q1").help("Condensed output"))
        .arg(Arg::with_name("q2").long("q2").help("Quiet output"))
        .arg(
            Arg::with_name("no-time")
                .long("no-time")
                .help("Don't show elapsed time (for regression testing)"),
        )
        .arg(
            Arg::with_name("s-cnf")
                .long("s-cnf")
                .help("Print 's cnf 0/1' with the answer"),
        )
        .get_matches();

    let input = matches.value_of("input").expect("required arg");
    let quiet = matches.is_present("q2");
    let condensed = matches.is_present("q1");
    let show_time = !matches.is_present("no-time") && !quiet;
    let s_cnf = matches.is_present("s-cnf");

    let mut opts = SolverOpts::default();
    if matches.is_present("stime") {
        opts.seed = seed_from_time();
    }
    if let Some(s) = matches.value_of("seed") {
        opts.seed = match s.parse() {
            Ok(v) => v,
            Err(_) => {
                eprintln!("Bad seed: '{}'", s);
                return 1;
            }
        };
    }
    if let Some(t) = matches.value_of("time-out") {
        match t.parse::<f64>() {
            Ok(secs) if secs > 0.0 => {
                opts.timeout = Some(Duration::from_secs_f64(secs));
            }
            _ => {
                eprintln!("Bad time-out: '{}'", t);
                return 1;
            }
        }
    }
    opts.allow_free = matches.is_present("allow-free");
    opts.allow_cegar = matches.value_of("cegar").map(|v| v != "0").unwrap_or(false);
    opts.use_monotone = !matches.is_present("no-monotone");
    opts.no_restart = matches.is_present("no-restart");
    opts.var_ord_fix = matches.is_present("var-ord-fix");
    if let Some(rc) = matches.value_of("restart-cycle") {
        opts.restart_cycle = rc.parse().unwrap_or(opts.restart_cycle);
    }
    let strat_file = matches.value_of("strat");
    let plog_file = matches.value_of("plog");
    opts.strat_enabled = strat_file.is_some();
    if opts.strat_enabled && !opts.allow_free {
        eprintln!("Option '--strat' requires option '--allow-free'.");
        return 1;
    }
    if opts.strat_enabled && opts.allow_cegar {
        eprintln!("Option '--strat' is incompatible with option '--cegar'.");
        return 1;
    }
    if plog_file.is_some() && !opts.allow_free {
        eprintln!("Option '--plog' requires option '--allow-free'.");
        return 1;
    }
    if plog_file.is_some() && opts.allow_cegar {
        eprintln!("Option '--plog' is incompatible with option '--cegar'.");
        return 1;
    }

    let reader = match open_input(input) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("File '{}': {}", input, e);
            return 1;
        }
    };
    let parsed = match ghostsat::parse_circuit(reader) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    let mut fmlas = Fmlas::new();
    let build_opts = BuildOpts {
        allow_free: opts.allow_free,
        alloc_cegar_vars: opts.allow_cegar,
    };
    let ckt = match Circuit::build(&parsed, &mut fmlas, build_opts) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    if matches.is_present("just-print") {
        let f = ckt.orig_fmla;
        let mut stdout = io::stdout();
        let res = if matches.is_present("write-qcir") {
            output::write_qcir(&fmlas, f, &mut stdout)
        } else {
            fmla_io::write_fmla(&fmlas, f, &mut stdout).and_then(|_| writeln!(stdout))
        };
        if let Err(e) = res {
            eprintln!("{}", e);
            return 1;
        }
        return 0;
    }

    let mut solver = Solver::new(ckt, fmlas, opts.clone());
    if let Some(path) = plog_file {
        match File::create(path) {
            Ok(f) => solver.set_proof_log(Box::new(f)),
            Err(e) => {
                eprintln!("Cannot open '{}': {}", path, e);
                return 1;
            }
        }
    }

    if let Some(path) = matches.value_of("write-gq") {
        let res = File::create(path)
            .and_then(|mut f| output::write_ghostq(&solver, &mut f));
        if let Err(e) = res {
            eprintln!("{}", e);
            return 1;
        }
        return 0;
    }
    if let Some(path) = matches.value_of("write-dimacs") {
        let res = File::create(path).map_err(SolverError::from).and_then(|mut f| {
            output::write_qdimacs(&solver, &mut f)
        });
        if let Err(e) = res {
            eprintln!("{}", e);
            return 1;
        }
        return 0;
    }

    if matches.is_present("get-asgn") {
        let exe = match matches.value_of("sat-exe") {
            Some(e) => e,
            None => {
                eprintln!("Option '--get-asgn' requires option '--sat-exe'.");
                return 1;
            }
        };
        let f = solver.ckt.orig_fmla;
        match run_external_sat(&mut solver.fmlas, f, Path::new(exe)) {
            Ok(SatOutcome::Unsat) => println!("UNSAT"),
            Ok(SatOutcome::Sat(asgn)) => {
                let mut items: Vec<_> = asgn.into_iter().collect();
                items.sort();
                let rendered: Vec<String> = items
                    .into_iter()
                    .map(|(k, v)| format!("{}{}", if v { "" } else { "-" }, k))
                    .collect();
                println!("SAT {}", rendered.join(" "));
            }
            Err(e) => {
                eprintln!("{}", e);
                return 1;
            }
        }
        return 0;
    }

    if !quiet {
        print!("#Seed: {:2}. ", opts.seed);
        let _ = io::stdout().flush();
    }

    let start = ProcessTime::now();
    let fin = match solver.solve() {
        Ok(fin) => fin,
        Err(SolverError::Timeout) => {
            if quiet {
                println!("TimeOut.");
            } else {
                print_stats(&solver, start.elapsed().as_secs_f64());
                eprintln!("TimeOut!  ({} conflicts)", solver.stats.conflicts);
            }
            return 0;
        }
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    let cpu = start.elapsed().as_secs_f64();
    let outcome = solver.outcome(fin);
    let (truth_str, truth_int) = match outcome {
        Outcome::True => ("true. ", 1),
        Outcome::False => ("false.", 0),
        Outcome::Free(_) => ("free. ", 999),
    };

    if quiet {
        if !s_cnf {
            print!("{}", truth_str);
        }
        if show_time {
            print!(" {:0.3}", cpu);
        }
        println!();
    } else if condensed {
        println!(
            "{} Bt:{:5}, Dec:{:5}.  T: {:0.3} s.",
            truth_str,
            solver.stats.conflicts,
            solver.stats.decisions,
            if show_time { cpu } else { 0.0 }
        );
    } else {
        println!(
            "{} Bt:{:5}, D:{:5}.  R:{:4}, P:{:7}, w:{:9}, C:{:3}, T: {:0.3} s.",
            truth_str,
            solver.stats.conflicts,
            solver.stats.decisions,
            solver.stats.restarts,
            solver.stats.propagations,
            solver.stats.watch_fixes,
            solver.stats.cegar_learns,
            if show_time { cpu } else { 0.0 }
        );
        if let Outcome::Free(f) = outcome {
            let simplified = solver.fmlas.simp_ite(f);
            let mut stdout = io::stdout();
            let res = if matches.is_present("write-qcir") {
                output::write_qcir(&solver.fmlas, simplified, &mut stdout)
            } else {
                fmla_io::write_fmla(&solver.fmlas, simplified, &mut stdout)
                    .and_then(|_| writeln!(stdout))
            };
            if let Err(e) = res {
                eprintln!("{}", e);
            }
        }
    }
    if s_cnf {
        println!("s cnf {}", truth_int);
    }
    debug!("final sequent id {}", fin);

    if let Some(path) = strat_file {
        let raw = matches.is_present("raw-strat");
        match solver.strategy_list_fmla(fin, raw) {
            Some(f) => {
                let res = File::create(path).and_then(|mut file| {
                    fmla_io::write_fmla(&solver.fmlas, f, &mut file)
                        .and_then(|_| writeln!(file))
                });
                if let Err(e) = res {
                    eprintln!("Cannot write strategy: {}", e);
                }
            }
            None => eprintln!("No strategy was recorded."),
        }
    }

    match outcome {
        Outcome::True => 10,
        Outcome::False => 20,
        Outcome::Free(_) => 99,
    }
}

fn main() {
    exit(run());
}
