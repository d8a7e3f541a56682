//! Formula serialization: the round-trippable s-expression text form with
//! `$n` subformula sharing, and the compact `(FmlaBin)` binary form.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SolverError};
use crate::fmla::{FmlaOp, FmlaRef, Fmlas};

const MAX_COL: usize = 79;

// ---------------------------------------------------------------------
// Text writer

struct TextWriter<'a> {
    fmlas: &'a Fmlas,
    refs: HashMap<FmlaRef, u32>,
    names: HashMap<FmlaRef, u32>,
    next_name: u32,
    col: usize,
    indent: usize,
}

impl<'a> TextWriter<'a> {
    fn emit(&mut self, out: &mut dyn Write, s: &str) -> io::Result<()> {
        if self.col + s.len() > MAX_COL && self.col > self.indent {
            writeln!(out)?;
            write!(out, "{:indent$}", "", indent = self.indent)?;
            self.col = self.indent;
        }
        out.write_all(s.as_bytes())?;
        self.col += s.len();
        Ok(())
    }

    fn write_rec(&mut self, out: &mut dyn Write, f: FmlaRef, indent: usize) -> io::Result<()> {
        let old_indent = self.indent;
        self.indent = indent;
        let op = self.fmlas.op(f);
        match op {
            FmlaOp::True => {
                self.emit(out, "true()")?;
                self.indent = old_indent;
                return Ok(());
            }
            FmlaOp::False => {
                self.emit(out, "false()")?;
                self.indent = old_indent;
                return Ok(());
            }
            FmlaOp::Error => {
                self.emit(out, "error()")?;
                self.indent = old_indent;
                return Ok(());
            }
            FmlaOp::Var => {
                let name = self.fmlas.var_name(f).expect("var node").to_string();
                self.emit(out, &name)?;
                self.indent = old_indent;
                return Ok(());
            }
            FmlaOp::List if self.fmlas.num_args(f) == 0 => {
                self.emit(out, "[]")?;
                self.indent = old_indent;
                return Ok(());
            }
            _ => {}
        }
        if let Some(&n) = self.names.get(&f) {
            self.emit(out, &format!("${}", n))?;
            self.indent = old_indent;
            return Ok(());
        }
        let shared = op != FmlaOp::Not && self.refs.get(&f).copied().unwrap_or(0) > 1;
        if op == FmlaOp::Not && self.fmlas.op(self.fmlas.args(f)[0]) == FmlaOp::Var {
            let name = self
                .fmlas
                .var_name(self.fmlas.args(f)[0])
                .expect("var node")
                .to_string();
            self.emit(out, &format!("-{}", name))?;
            self.indent = old_indent;
            return Ok(());
        }
        let head = if shared {
            self.next_name += 1;
            self.names.insert(f, self.next_name);
            format!("${}:{}(", self.next_name, op.name())
        } else {
            format!("{}(", op.name())
        };
        self.emit(out, &head)?;
        let args: Vec<FmlaRef> = self.fmlas.args(f).to_vec();
        let child_indent = if indent < 20 { indent + 2 } else { indent + 1 };
        for (i, a) in args.iter().enumerate() {
            self.write_rec(out, *a, child_indent)?;
            if i + 1 < args.len() {
                self.emit(out, ", ")?;
            }
        }
        self.indent = indent;
        self.emit(out, ")")?;
        self.indent = old_indent;
        Ok(())
    }
}

/// Writes the formula in the round-trippable text form, naming shared
/// subformulas `$n` at their first occurrence.
pub fn write_fmla(fmlas: &Fmlas, f: FmlaRef, out: &mut dyn Write) -> io::Result<()> {
    let mut refs = HashMap::new();
    fmlas.count_refs(f, &mut refs);
    let mut w = TextWriter {
        fmlas,
        refs,
        names: HashMap::new(),
        next_name: 0,
        col: 0,
        indent: 0,
    };
    w.write_rec(out, f, 0)
}

pub fn fmla_to_string(fmlas: &Fmlas, f: FmlaRef) -> String {
    let mut buf = Vec::new();
    write_fmla(fmlas, f, &mut buf).expect("writing to a buffer");
    String::from_utf8(buf).expect("formula text is utf-8")
}

// ---------------------------------------------------------------------
// Text parser

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Punct(char),
    Ident(String),
}

struct Lexer {
    toks: Vec<Tok>,
    pos: usize,
}

impl Lexer {
    fn new(src: &str) -> Lexer {
        let mut toks = vec![];
        let mut cur = String::new();
        let mut in_comment = false;
        for c in src.chars() {
            if in_comment {
                if c == '\n' {
                    in_comment = false;
                }
                continue;
            }
            match c {
                '#' => {
                    if !cur.is_empty() {
                        toks.push(Tok::Ident(std::mem::take(&mut cur)));
                    }
                    in_comment = true;
                }
                c if c.is_whitespace() || c == ',' => {
                    if !cur.is_empty() {
                        toks.push(Tok::Ident(std::mem::take(&mut cur)));
                    }
                }
                '(' | ')' | '[' | ']' | ':' => {
                    if !cur.is_empty() {
                        toks.push(Tok::Ident(std::mem::take(&mut cur)));
                    }
                    toks.push(Tok::Punct(c));
                }
                '-' if cur.is_empty() => toks.push(Tok::Punct('-')),
                c => cur.push(c),
            }
        }
        if !cur.is_empty() {
            toks.push(Tok::Ident(cur));
        }
        Lexer { toks, pos: 0 }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, p: char) -> Result<()> {
        match self.next() {
            Some(Tok::Punct(c)) if c == p => Ok(()),
            other => Err(SolverError::Parse(format!(
                "expected '{}', found {:?}",
                p, other
            ))),
        }
    }
}

struct FmlaParser<'a> {
    fmlas: &'a mut Fmlas,
    named: HashMap<String, FmlaRef>,
    base_dir: PathBuf,
    opened: HashSet<PathBuf>,
}

impl<'a> FmlaParser<'a> {
    fn parse(&mut self, lex: &mut Lexer) -> Result<FmlaRef> {
        let tok = lex
            .next()
            .ok_or_else(|| SolverError::Parse("unexpected end of formula".to_string()))?;
        match tok {
            Tok::Punct('-') => {
                let inner = self.parse(lex)?;
                Ok(self.fmlas.negate(inner))
            }
            Tok::Punct('[') => {
                let mut args = vec![];
                loop {
                    match lex.peek() {
                        Some(Tok::Punct(']')) => {
                            lex.eat(']')?;
                            break;
                        }
                        Some(_) => args.push(self.parse(lex)?),
                        None => {
                            return Err(SolverError::Parse("unclosed '['".to_string()))
                        }
                    }
                }
                Ok(self.fmlas.list(&args))
            }
            Tok::Ident(name) => self.parse_after_ident(lex, name),
            other => Err(SolverError::Parse(format!("unexpected {:?}", other))),
        }
    }

    fn parse_after_ident(&mut self, lex: &mut Lexer, mut name: String) -> Result<FmlaRef> {
        let mut label: Option<String> = None;
        if lex.peek() == Some(&Tok::Punct(':')) {
            lex.eat(':')?;
            label = Some(name);
            match lex.next() {
                Some(Tok::Ident(n)) => name = n,
                other => {
                    return Err(SolverError::Parse(format!(
                        "expected an operator after the label, found {:?}",
                        other
                    )))
                }
            }
        }
        if lex.peek() == Some(&Tok::Punct('(')) {
            let op = FmlaOp::from_name(&name).ok_or_else(|| {
                SolverError::Parse(format!("invalid operator: '{}'", name))
            })?;
            lex.eat('(')?;
            let mut args = vec![];
            loop {
                match lex.peek() {
                    Some(Tok::Punct(')')) => {
                        lex.eat(')')?;
                        break;
                    }
                    Some(_) => args.push(self.parse(lex)?),
                    None => return Err(SolverError::Parse("unclosed '('".to_string())),
                }
            }
            let ret = if op == FmlaOp::Include {
                self.parse_include(&args)?
            } else {
                self.fmlas.intern(op, &args)?
            };
            if let Some(lbl) = label {
                if self.named.insert(lbl.clone(), ret).is_some() {
                    return Err(SolverError::Parse(format!(
                        "subformula name '{}' is defined more than once",
                        lbl
                    )));
                }
            }
            Ok(ret)
        } else {
            if name.starts_with('$') {
                return self.named.get(&name).copied().ok_or_else(|| {
                    SolverError::Parse(format!("undefined subformula name: '{}'", name))
                });
            }
            if name.eq_ignore_ascii_case("true") || name.eq_ignore_ascii_case("false") {
                return Err(SolverError::Parse(format!(
                    "invalid variable name: '{}'",
                    name
                )));
            }
            Ok(self.fmlas.var(&name))
        }
    }

    fn parse_include(&mut self, args: &[FmlaRef]) -> Result<FmlaRef> {
        if args.len() != 1 {
            return Err(SolverError::Parse("include takes one file name".to_string()));
        }
        let name = self
            .fmlas
            .var_name(args[0])
            .ok_or_else(|| SolverError::Parse("include takes a file name".to_string()))?
            .to_string();
        let path = self.base_dir.join(name);
        if !self.opened.insert(path.clone()) {
            return Err(SolverError::Parse(format!(
                "file '{}' is already open for parsing",
                path.display()
            )));
        }
        let text = fs::read_to_string(&path)?;
        let ret = {
            let mut sub = FmlaParser {
                fmlas: &mut *self.fmlas,
                named: HashMap::new(),
                base_dir: path.parent().map(PathBuf::from).unwrap_or_default(),
                opened: self.opened.clone(),
            };
            let mut lex = Lexer::new(&text);
            sub.parse(&mut lex)
        };
        self.opened.remove(&path);
        ret
    }
}

pub fn parse_fmla_str(fmlas: &mut Fmlas, src: &str) -> Result<FmlaRef> {
    let mut p = FmlaParser {
        fmlas,
        named: HashMap::new(),
        base_dir: PathBuf::from("."),
        opened: HashSet::new(),
    };
    let mut lex = Lexer::new(src);
    p.parse(&mut lex)
}

/// Parses a formula file, dispatching on the `(FmlaBin)` header.
pub fn parse_fmla_file(fmlas: &mut Fmlas, path: &Path) -> Result<FmlaRef> {
    let bytes = fs::read(path)?;
    if bytes.starts_with(b"(FmlaBin)") {
        return read_fmla_bin(fmlas, &mut &bytes[..]);
    }
    let text = String::from_utf8(bytes)
        .map_err(|_| SolverError::Parse("formula file is not utf-8".to_string()))?;
    let mut p = FmlaParser {
        fmlas,
        named: HashMap::new(),
        base_dir: path.parent().map(PathBuf::from).unwrap_or_default(),
        opened: std::iter::once(path.to_path_buf()).collect(),
    };
    let mut lex = Lexer::new(&text);
    p.parse(&mut lex)
}

// ---------------------------------------------------------------------
// Binary form

fn write_varint(out: &mut dyn Write, mut x: u32) -> io::Result<()> {
    while x & !0x7f != 0 {
        out.write_all(&[(x & 0x7f) as u8 | 0x80])?;
        x >>= 7;
    }
    out.write_all(&[x as u8])
}

fn read_varint(r: &mut dyn Read) -> Result<u32> {
    let mut x: u32 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8];
        r.read_exact(&mut byte)
            .map_err(|_| SolverError::Parse("unexpected end of binary formula".to_string()))?;
        let cur = (byte[0] & 0x7f) as u32;
        if shift >= 32 || (cur << shift) >> shift != cur {
            return Err(SolverError::Parse(
                "integer too large in binary formula".to_string(),
            ));
        }
        x |= cur << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(x);
        }
        shift += 7;
    }
}

fn write_str(out: &mut dyn Write, s: &str) -> io::Result<()> {
    write_varint(out, s.len() as u32)?;
    out.write_all(s.as_bytes())
}

fn read_str(r: &mut dyn Read) -> Result<String> {
    let len = read_varint(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|_| SolverError::Parse("unexpected end of binary formula".to_string()))?;
    String::from_utf8(buf)
        .map_err(|_| SolverError::Parse("binary formula string is not utf-8".to_string()))
}

const ALL_OPS: &[FmlaOp] = &[
    FmlaOp::Error,
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

fn analyze_bin(
    fmlas: &Fmlas,
    f: FmlaRef,
    seen: &mut HashSet<FmlaRef>,
    ops: &mut Vec<FmlaOp>,
    vars: &mut Vec<FmlaRef>,
) {
    if !seen.insert(f) {
        return;
    }
    let op = fmlas.op(f);
    if op == FmlaOp::Var {
        vars.push(f);
        return;
    }
    if !ops.contains(&op) {
        ops.push(op);
    }
    for &a in fmlas.args(f) {
        analyze_bin(fmlas, a, seen, ops, vars);
    }
}

fn write_bin_rec(
    fmlas: &Fmlas,
    f: FmlaRef,
    out: &mut dyn Write,
    op_num: &HashMap<FmlaOp, u32>,
    numbered: &mut HashMap<FmlaRef, u32>,
    cur: &mut u32,
) -> io::Result<()> {
    if let Some(&n) = numbered.get(&f) {
        return write_varint(out, n);
    }
    let op = fmlas.op(f);
    debug_assert_ne!(op, FmlaOp::Var);
    write_varint(out, op_num[&op])?;
    write_varint(out, fmlas.num_args(f) as u32)?;
    for &a in fmlas.args(f) {
        write_bin_rec(fmlas, a, out, op_num, numbered, cur)?;
    }
    *cur += 1;
    numbered.insert(f, *cur);
    Ok(())
}

/// Writes the compact binary form: header, comment, operator table,
/// declared-formula count, variable table, then the node stream.
pub fn write_fmla_bin(fmlas: &Fmlas, f: FmlaRef, out: &mut dyn Write) -> io::Result<()> {
    let mut seen = HashSet::new();
    let mut used_ops = vec![];
    let mut vars = vec![];
    analyze_bin(fmlas, f, &mut seen, &mut used_ops, &mut vars);

    out.write_all(b"(FmlaBin)\n")?;
    write_str(out, "")?;

    let mut op_num: HashMap<FmlaOp, u32> = HashMap::new();
    let mut n = 0u32;
    for &op in ALL_OPS {
        if used_ops.contains(&op) {
            n += 1;
            op_num.insert(op, n);
        }
    }
    write_varint(out, n)?;
    for &op in ALL_OPS {
        if op_num.contains_key(&op) {
            write_str(out, op.name())?;
        }
    }
    write_varint(out, 0)?;
    write_varint(out, vars.len() as u32)?;
    let mut numbered = HashMap::new();
    let mut cur = n;
    for &v in &vars {
        write_str(out, fmlas.var_name(v).expect("var node"))?;
        cur += 1;
        numbered.insert(v, cur);
    }
    write_bin_rec(fmlas, f, out, &op_num, &mut numbered, &mut cur)
}

fn read_bin_rec(
    fmlas: &mut Fmlas,
    r: &mut dyn Read,
    max_op: u32,
    ops: &[FmlaOp],
    num_to_fmla: &mut HashMap<u32, FmlaRef>,
    cur: &mut u32,
) -> Result<FmlaRef> {
    let x = read_varint(r)?;
    if x > max_op {
        return num_to_fmla.get(&x).copied().ok_or_else(|| {
            SolverError::Parse(format!("undefined formula #{} in binary input", x))
        });
    }
    if x == 0 {
        return Err(SolverError::Parse("operator number 0 in binary input".to_string()));
    }
    let op = ops[(x - 1) as usize];
    let num_args = read_varint(r)? as usize;
    let mut args = Vec::with_capacity(num_args);
    for _ in 0..num_args {
        args.push(read_bin_rec(fmlas, r, max_op, ops, num_to_fmla, cur)?);
    }
    let ret = fmlas
        .raw(op, &args)
        .map_err(|e| SolverError::Parse(e.to_string()))?;
    *cur += 1;
    num_to_fmla.insert(*cur, ret);
    Ok(ret)
}

pub fn read_fmla_bin(fmlas: &mut Fmlas, r: &mut dyn Read) -> Result<FmlaRef> {
    let mut header = [0u8; 10];
    r.read_exact(&mut header)
        .map_err(|_| SolverError::Parse("bad binary formula header".to_string()))?;
    if &header != b"(FmlaBin)\n" {
        return Err(SolverError::Parse("bad binary formula header".to_string()));
    }
    let comment = read_str(r)?;
    if !comment.is_empty() {
        log::debug!("binary formula comment: {}", comment);
    }
    let num_ops = read_varint(r)?;
    let mut ops = vec![];
    for _ in 0..num_ops {
        let name = read_str(r)?;
        let op = FmlaOp::from_name(&name).ok_or_else(|| {
            SolverError::Parse(format!("unknown operator '{}' in binary input", name))
        })?;
        ops.push(op);
    }
    let _num_decl = read_varint(r)?;
    let num_vars = read_varint(r)?;
    let mut num_to_fmla = HashMap::new();
    let mut cur = num_ops;
    let mut seen_names = HashSet::new();
    for i in 0..num_vars {
        let mut name = read_str(r)?;
        if name.is_empty() {
            name = format!("v{}", i + 1);
        }
        if !seen_names.insert(name.clone()) {
            return Err(SolverError::Parse(format!(
                "two variables are named '{}'",
                name
            )));
        }
        let v = fmlas.var(&name);
        cur += 1;
        num_to_fmla.insert(cur, v);
    }
    read_bin_rec(fmlas, r, num_ops, &ops, &mut num_to_fmla, &mut cur)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trip_is_identical() {
        let mut f = Fmlas::new();
        let x = f.var("x");
        let y = f.var("y");
        let z = f.var("z");
        let ny = f.negate(y);
        let or = f.intern(FmlaOp::Or, &[ny, z]).unwrap();
        let root = f.intern(FmlaOp::And, &[x, or, or]).unwrap();
        let text = fmla_to_string(&f, root);
        assert!(text.contains("$1:"), "shared node gets a name: {}", text);
        assert!(text.contains("-y"), "negated var prints bare: {}", text);
        let back = parse_fmla_str(&mut f, &text).unwrap();
        assert_eq!(back, root);
    }

    #[test]
    fn text_round_trip_constants_and_lists() {
        let mut f = Fmlas::new();
        let x = f.var("x");
        let l = f.list(&[x, Fmlas::TRUE]);
        let empty = f.list(&[]);
        let root = f.list(&[l, empty, Fmlas::FALSE]);
        let text = fmla_to_string(&f, root);
        let back = parse_fmla_str(&mut f, &text).unwrap();
        assert_eq!(back, root);
    }

    #[test]
    fn parser_rejects_bad_names_and_refs() {
        let mut f = Fmlas::new();
        assert!(parse_fmla_str(&mut f, "true").is_err());
        assert!(parse_fmla_str(&mut f, "$9").is_err());
        assert!(parse_fmla_str(&mut f, "frobnicate(x, y)").is_err());
        assert!(parse_fmla_str(&mut f, "and(x, ").is_err());
    }

    #[test]
    fn parser_handles_labels_and_brackets() {
        let mut f = Fmlas::new();
        let got = parse_fmla_str(&mut f, "and($a:or(x, y), $a, [x, y])").unwrap();
        let x = f.var("x");
        let y = f.var("y");
        let or = f.intern(FmlaOp::Or, &[x, y]).unwrap();
        let lst = f.list(&[x, y]);
        let want = f.intern(FmlaOp::And, &[or, or, lst]).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn binary_round_trip_is_identical() {
        let mut f = Fmlas::new();
        let x = f.var("alpha");
        let y = f.var("beta");
        let or = f.intern(FmlaOp::Or, &[x, y]).unwrap();
        let nx = f.negate(x);
        let root = f.intern(FmlaOp::And, &[or, nx, or]).unwrap();
        let mut buf = Vec::new();
        write_fmla_bin(&f, root, &mut buf).unwrap();
        assert!(buf.starts_with(b"(FmlaBin)\n"));
        let back = read_fmla_bin(&mut f, &mut &buf[..]).unwrap();
        assert_eq!(back, root);
    }

    #[test]
    fn binary_rejects_garbage() {
        let mut f = Fmlas::new();
        assert!(read_fmla_bin(&mut f, &mut &b"(NotBin)xx"[..]).is_err());
        assert!(read_fmla_bin(&mut f, &mut &b"(FmlaBin)\n"[..]).is_err());
    }

    #[test]
    fn varints_round_trip() {
        for x in [0u32, 1, 127, 128, 300, 1 << 20, u32::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, x).unwrap();
            let back = read_varint(&mut &buf[..]).unwrap();
            assert_eq!(back, x);
        }
    }
}
