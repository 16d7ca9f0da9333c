//! FDO source text → [`Script`].
//!
//! Source is a sequence of atoms, one per statement:
//!
//! ```text
//! uni_start_stream
//!   man_start_object <trigger, "OK">
//!     mat_orientation <vcf>
//!     act_replace_select_action <
//!       uni_start_stream
//!         async_exit
//!       uni_end_stream
//!     >
//!   man_end_object
//! uni_end_stream
//! ```
//!
//! Literals: `"text"`, decimal `42`, hex `2ax`, GIDs `1-0-1329`, and symbolic
//! names for enumerated operands. Raw blocks are space-separated hex bytes.
//! `//` starts a comment. Scope atoms are routed through [`ScriptBuilder`] so
//! parsed scripts obey the same pairing rules as built ones.

use std::str::FromStr;

use bytes::Bytes;
use dialtone_core::atom::{self, Atom, AtomDef, AtomTable, NameSet, Operand, OperandKind};
use dialtone_core::gid::Gid;

use crate::script::{CompileError, Script, ScriptBuilder};

/// Parse FDO source into a script.
pub fn parse(table: &AtomTable, source: &str) -> Result<Script, CompileError> {
    let tokens = lex(source)?;
    let mut parser = Parser {
        table,
        tokens,
        pos: 0,
    };
    let statements = parser.statements(false)?;

    let mut builder = ScriptBuilder::new(table);
    emit(&mut builder, &statements)?;
    builder.build()
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Str(String),
    /// Literal starting with a digit: number, hex byte, or GID.
    Word(String),
    Open,
    Close,
    Comma,
}

#[derive(Debug, Clone)]
struct Lexed {
    tok: Tok,
    line: usize,
}

fn lex(source: &str) -> Result<Vec<Lexed>, CompileError> {
    let mut out = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '/' => {
                chars.next();
                if chars.peek() != Some(&'/') {
                    return Err(CompileError::Format(format!(
                        "line {line}: unexpected '/'"
                    )));
                }
                while chars.peek().is_some_and(|c| *c != '\n') {
                    chars.next();
                }
            }
            '<' | '>' | ',' => {
                chars.next();
                let tok = match c {
                    '<' => Tok::Open,
                    '>' => Tok::Close,
                    _ => Tok::Comma,
                };
                out.push(Lexed { tok, line });
            }
            '"' => {
                chars.next();
                let start = line;
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('r') => s.push('\r'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => break,
                        },
                        Some('\n') => {
                            line += 1;
                            s.push('\n');
                        }
                        Some(other) => s.push(other),
                        None => {
                            return Err(CompileError::Format(format!(
                                "line {start}: unterminated string literal"
                            )))
                        }
                    }
                }
                out.push(Lexed {
                    tok: Tok::Str(s),
                    line: start,
                });
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut word = String::new();
                let numeric = c.is_ascii_digit();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || (numeric && c == '-') {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let tok = if numeric {
                    Tok::Word(word)
                } else {
                    Tok::Ident(word)
                };
                out.push(Lexed { tok, line });
            }
            other => {
                return Err(CompileError::Format(format!(
                    "line {line}: unexpected character {other:?}"
                )))
            }
        }
    }
    Ok(out)
}

// ── Statements ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Statement {
    def: &'static AtomDef,
    line: usize,
    args: Vec<Arg>,
}

#[derive(Debug)]
enum Arg {
    Lits(Vec<Lexed>),
    Stream(Vec<Statement>),
}

struct Parser<'a> {
    table: &'a AtomTable,
    tokens: Vec<Lexed>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Lexed> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Lexed> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    /// Statements until end of input, or until a `>` when `nested`.
    fn statements(&mut self, nested: bool) -> Result<Vec<Statement>, CompileError> {
        let mut out = Vec::new();
        loop {
            let Some(next) = self.peek() else {
                if nested {
                    return Err(CompileError::Format(
                        "unterminated nested stream, expected '>'".into(),
                    ));
                }
                return Ok(out);
            };
            match &next.tok {
                Tok::Close if nested => return Ok(out),
                Tok::Ident(_) => {}
                other => {
                    return Err(CompileError::Format(format!(
                        "line {}: expected atom name, found {}",
                        next.line,
                        describe(other)
                    )))
                }
            }
            out.push(self.statement()?);
        }
    }

    fn statement(&mut self) -> Result<Statement, CompileError> {
        let Some(Lexed {
            tok: Tok::Ident(name),
            line,
        }) = self.bump()
        else {
            return Err(CompileError::Format("expected atom name".into()));
        };
        let def = self
            .table
            .by_name(&name)
            .ok_or_else(|| CompileError::UnknownAtom(name.clone()))?;

        let mut args = Vec::new();
        if !matches!(self.peek(), Some(Lexed { tok: Tok::Open, .. })) {
            return Ok(Statement { def, line, args });
        }
        self.bump();

        loop {
            if matches!(self.peek(), Some(Lexed { tok: Tok::Close, .. })) {
                self.bump();
                break;
            }
            let kind = def.operands.get(args.len()).ok_or_else(|| {
                CompileError::Format(format!(
                    "line {line}: {} takes at most {} operand(s)",
                    def.name,
                    def.operands.len()
                ))
            })?;

            if *kind == OperandKind::Stream {
                args.push(Arg::Stream(self.statements(true)?));
                continue;
            }

            let mut lits = Vec::new();
            loop {
                match self.bump() {
                    Some(Lexed {
                        tok: Tok::Comma, ..
                    }) => break,
                    Some(Lexed {
                        tok: Tok::Close, ..
                    }) => {
                        self.pos -= 1;
                        break;
                    }
                    Some(Lexed { tok: Tok::Open, line }) => {
                        return Err(CompileError::Format(format!(
                            "line {line}: unexpected '<' in {} operand",
                            def.name
                        )))
                    }
                    Some(lit) => lits.push(lit),
                    None => {
                        return Err(CompileError::Format(format!(
                            "line {line}: unterminated operand list for {}",
                            def.name
                        )))
                    }
                }
            }
            args.push(Arg::Lits(lits));
        }
        Ok(Statement { def, line, args })
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Ident(s) | Tok::Word(s) => format!("{s:?}"),
        Tok::Str(s) => format!("string {s:?}"),
        Tok::Open => "'<'".into(),
        Tok::Close => "'>'".into(),
        Tok::Comma => "','".into(),
    }
}

// ── Operand resolution ────────────────────────────────────────────────────────

fn operands(table: &AtomTable, st: &Statement) -> Result<Vec<Operand>, CompileError> {
    st.args
        .iter()
        .zip(st.def.operands)
        .map(|(arg, kind)| operand(table, st, *kind, arg))
        .collect()
}

fn operand(
    table: &AtomTable,
    st: &Statement,
    kind: OperandKind,
    arg: &Arg,
) -> Result<Operand, CompileError> {
    let name = st.def.name;
    let lits = match arg {
        Arg::Stream(statements) => return Ok(Operand::Stream(plain_atoms(table, statements)?)),
        Arg::Lits(lits) => lits,
    };
    let bad = |what: &str| {
        CompileError::Format(format!("line {}: {name} {what}", st.line))
    };

    match kind {
        OperandKind::Raw => {
            if let [Lexed {
                tok: Tok::Str(s), ..
            }] = lits.as_slice()
            {
                return Ok(Operand::Raw(Bytes::copy_from_slice(s.as_bytes())));
            }
            let mut bytes = Vec::with_capacity(lits.len());
            for lit in lits {
                let v = number(&lit.tok).map_err(|lit| bad(&format!("invalid byte literal {lit:?}")))?;
                let b = u8::try_from(v).map_err(|_| bad(&format!("byte literal {v} out of range")))?;
                bytes.push(b);
            }
            Ok(Operand::Raw(Bytes::from(bytes)))
        }
        _ => {
            let [lit] = lits.as_slice() else {
                return Err(bad(&format!("expects one literal per operand, got {}", lits.len())));
            };
            match (kind, &lit.tok) {
                (OperandKind::Str(_), Tok::Str(s)) => Ok(Operand::Str(s.clone())),
                (OperandKind::Gid, Tok::Word(w)) => Gid::from_str(w)
                    .map(Operand::Gid)
                    .map_err(|_| bad(&format!("invalid gid literal {w:?}"))),
                (OperandKind::Named(set), Tok::Ident(ident)) => {
                    match atom::value_of(set, ident).or_else(|| number(&lit.tok).ok()) {
                        Some(v) => Ok(Operand::Int(v)),
                        None => Err(bad(&format!("unknown {set:?} name {ident:?}"))),
                    }
                }
                (
                    OperandKind::Byte
                    | OperandKind::Word
                    | OperandKind::Dword
                    | OperandKind::Num
                    | OperandKind::Named(_),
                    tok,
                ) => number(tok)
                    .map(Operand::Int)
                    .map_err(|lit| bad(&format!("invalid number literal {lit:?}"))),
                (_, tok) => Err(bad(&format!("cannot take {} as {kind:?}", describe(tok)))),
            }
        }
    }
}

/// Decimal `42` or hex `2ax`. Returns the offending literal on failure.
fn number(tok: &Tok) -> Result<u32, String> {
    let text = match tok {
        Tok::Word(w) | Tok::Ident(w) => w,
        other => return Err(describe(other)),
    };
    let hex = text
        .strip_suffix('x')
        .or_else(|| text.strip_suffix('X'))
        .filter(|h| !h.is_empty() && h.len() <= 8 && h.bytes().all(|b| b.is_ascii_hexdigit()));
    match hex {
        Some(h) => u32::from_str_radix(h, 16).map_err(|_| text.clone()),
        None if text.bytes().all(|b| b.is_ascii_digit()) => {
            text.parse().map_err(|_| text.clone())
        }
        None => Err(text.clone()),
    }
}

/// Atoms of a nested stream argument that is not an action body. Depths are
/// assigned at flatten time; scope pairing is checked when the carrying atom
/// joins the script.
fn plain_atoms(table: &AtomTable, statements: &[Statement]) -> Result<Vec<Atom>, CompileError> {
    statements
        .iter()
        .map(|st| {
            let ops = operands(table, st)?;
            table.atom(st.def.name, ops).map_err(CompileError::from)
        })
        .collect()
}

// ── Structure ─────────────────────────────────────────────────────────────────

fn emit(b: &mut ScriptBuilder<'_>, statements: &[Statement]) -> Result<(), CompileError> {
    let table = b.table();
    let mut i = 0;
    while i < statements.len() {
        if b.failed() {
            return Ok(());
        }
        let st = &statements[i];
        i += 1;
        match st.def.name {
            "uni_start_stream" => match operands(table, st)?.first() {
                Some(Operand::Int(id)) => {
                    b.stream_with_id(*id);
                }
                _ => {
                    b.stream();
                }
            },
            "uni_end_stream" => {
                b.end_stream();
            }
            "man_start_object" => {
                let (kind, title) = object_head(table, st)?;
                b.object(&kind, &title);
            }
            "man_start_sibling" => {
                let (kind, title) = object_head(table, st)?;
                b.sibling(&kind, &title);
            }
            "man_end_object" => {
                b.end_object();
            }
            "man_set_context_globalid" => match operands(table, st)?.first() {
                Some(Operand::Gid(gid)) => {
                    b.context(*gid);
                }
                _ => {
                    b.fail(CompileError::Format(format!(
                        "line {}: man_set_context_globalid needs a gid",
                        st.line
                    )));
                }
            },
            "man_set_context_relative" => match operands(table, st)?.first() {
                Some(Operand::Int(tag)) => {
                    b.context_relative(*tag);
                }
                _ => {
                    b.fail(CompileError::Format(format!(
                        "line {}: man_set_context_relative needs a tag",
                        st.line
                    )));
                }
            },
            "man_end_context" => {
                b.end_context();
            }
            "act_replace_select_action" => action(b, "select", st)?,
            "act_set_criterion"
                if statements
                    .get(i)
                    .is_some_and(|next| next.def.name == "act_replace_action") =>
            {
                let criterion = match operands(table, st)?.first() {
                    Some(Operand::Int(v)) => atom::name_of(NameSet::Criterion, *v),
                    _ => None,
                };
                let Some(criterion) = criterion else {
                    return Err(CompileError::Format(format!(
                        "line {}: act_set_criterion needs a known criterion",
                        st.line
                    )));
                };
                action(b, &criterion, &statements[i])?;
                i += 1;
            }
            _ => {
                let ops = operands(table, st)?;
                match table.atom(st.def.name, ops) {
                    Ok(atom) => {
                        b.push_atom(atom);
                    }
                    Err(e) => {
                        b.fail(e.into());
                    }
                }
            }
        }
    }
    Ok(())
}

fn object_head(table: &AtomTable, st: &Statement) -> Result<(String, String), CompileError> {
    let ops = operands(table, st)?;
    let kind = match ops.first() {
        Some(Operand::Int(v)) => atom::name_of(NameSet::ObjectType, *v),
        _ => None,
    }
    .ok_or_else(|| {
        CompileError::Format(format!(
            "line {}: {} needs an object type",
            st.line, st.def.name
        ))
    })?;
    let title = match ops.get(1) {
        Some(Operand::Str(s)) => s.clone(),
        _ => String::new(),
    };
    Ok((kind, title))
}

fn action(
    b: &mut ScriptBuilder<'_>,
    criterion: &str,
    st: &Statement,
) -> Result<(), CompileError> {
    let body: &[Statement] = match st.args.first() {
        Some(Arg::Stream(body)) => body,
        _ => &[],
    };
    // the action body is itself a stream; drop an explicit wrapper
    let inner = match body {
        [first, inner @ .., last]
            if first.def.name == "uni_start_stream" && last.def.name == "uni_end_stream" =>
        {
            inner
        }
        other => other,
    };
    b.action(criterion);
    emit(b, inner)?;
    b.end_action();
    Ok(())
}
