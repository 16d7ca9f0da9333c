//! Scene scripts — immutable node trees built through [`ScriptBuilder`].
//!
//! A script is a list of top-level streams. Inside a stream, objects and
//! contexts open nested scopes, siblings replace the innermost object with a
//! new one at the same level, and action blocks attach an atom subtree to a
//! trigger criterion of the enclosing object or context.
//!
//! The builder checks scope pairing as calls are made. Scope atoms only enter
//! a script through the scope methods; appending one as a plain atom is a
//! structural error, and atoms carried in nested stream operands must pair up
//! on their own. The first error is remembered, every later call becomes a
//! no-op, and [`ScriptBuilder::build`] returns that error instead of a
//! partial tree.

use dialtone_core::atom::{
    self, Atom, AtomError, AtomTable, NameSet, Operand, OperandKind, Scope, ScopeEffect,
};
use dialtone_core::gid::Gid;

/// One node of a scene tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Atom(Atom),
    Stream {
        id: Option<u32>,
        children: Vec<Node>,
    },
    Object {
        kind: u8,
        title: String,
        /// Opened with a sibling transition from the preceding object.
        sibling: bool,
        children: Vec<Node>,
    },
    Context {
        target: ContextTarget,
        children: Vec<Node>,
    },
    Action {
        criterion: u8,
        body: Vec<Node>,
    },
}

/// The remote object a context scope addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextTarget {
    Global(Gid),
    Relative(u32),
}

/// A complete, balanced scene tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    nodes: Vec<Node>,
}

impl Script {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Stream,
    Object,
    Context,
    Action,
}

impl ScopeKind {
    fn name(self) -> &'static str {
        match self {
            ScopeKind::Stream => "stream",
            ScopeKind::Object => "object",
            ScopeKind::Context => "context",
            ScopeKind::Action => "action",
        }
    }
}

#[derive(Debug)]
struct Frame {
    kind: ScopeKind,
    head: Head,
    children: Vec<Node>,
}

#[derive(Debug)]
enum Head {
    Stream(Option<u32>),
    Object { kind: u8, title: String, sibling: bool },
    Context(ContextTarget),
    Action(u8),
}

/// Fluent scene builder with a construction-time scope stack.
pub struct ScriptBuilder<'t> {
    table: &'t AtomTable,
    roots: Vec<Node>,
    stack: Vec<Frame>,
    error: Option<CompileError>,
}

impl<'t> ScriptBuilder<'t> {
    pub fn new(table: &'t AtomTable) -> Self {
        Self {
            table,
            roots: Vec::new(),
            stack: Vec::new(),
            error: None,
        }
    }

    pub fn table(&self) -> &'t AtomTable {
        self.table
    }

    /// True once any call has failed.
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Record an error from outside the builder (e.g. a missing scene
    /// parameter). The first error wins.
    pub fn fail(&mut self, err: CompileError) -> &mut Self {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self
    }

    pub fn stream(&mut self) -> &mut Self {
        self.open(ScopeKind::Stream, Head::Stream(None))
    }

    pub fn stream_with_id(&mut self, id: u32) -> &mut Self {
        self.open(ScopeKind::Stream, Head::Stream(Some(id)))
    }

    pub fn end_stream(&mut self) -> &mut Self {
        self.close(ScopeKind::Stream)
    }

    /// Open an object scope. `kind` is an object type name such as `trigger`.
    pub fn object(&mut self, kind: &str, title: &str) -> &mut Self {
        if !self.require_open("man_start_object") {
            return self;
        }
        match self.object_kind(kind) {
            Some(kind) => self.open(
                ScopeKind::Object,
                Head::Object {
                    kind,
                    title: title.to_string(),
                    sibling: false,
                },
            ),
            None => self,
        }
    }

    /// Close the innermost object and open a new one at the same level.
    pub fn sibling(&mut self, kind: &str, title: &str) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        if self.innermost() != Some(ScopeKind::Object) {
            return self.fail(CompileError::Structural(
                "man_start_sibling outside an object scope".into(),
            ));
        }
        let Some(kind) = self.object_kind(kind) else {
            return self;
        };
        self.close(ScopeKind::Object);
        self.open(
            ScopeKind::Object,
            Head::Object {
                kind,
                title: title.to_string(),
                sibling: true,
            },
        )
    }

    pub fn end_object(&mut self) -> &mut Self {
        self.close(ScopeKind::Object)
    }

    /// Open a context scope addressing a remote object by global id.
    pub fn context(&mut self, gid: Gid) -> &mut Self {
        if !self.require_open("man_set_context_globalid") {
            return self;
        }
        self.open(ScopeKind::Context, Head::Context(ContextTarget::Global(gid)))
    }

    /// Open a context scope addressing a child of the current object by tag.
    pub fn context_relative(&mut self, tag: u32) -> &mut Self {
        if !self.require_open("man_set_context_relative") {
            return self;
        }
        self.open(ScopeKind::Context, Head::Context(ContextTarget::Relative(tag)))
    }

    pub fn end_context(&mut self) -> &mut Self {
        self.close(ScopeKind::Context)
    }

    /// Open an action block fired on `criterion` (e.g. `select`).
    pub fn action(&mut self, criterion: &str) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        if !matches!(
            self.innermost(),
            Some(ScopeKind::Object | ScopeKind::Context)
        ) {
            return self.fail(CompileError::Structural(format!(
                "action block <{criterion}> outside any object or context scope"
            )));
        }
        match atom::value_of(NameSet::Criterion, criterion) {
            Some(c) => self.open(ScopeKind::Action, Head::Action(c as u8)),
            None => self.fail(CompileError::Format(format!(
                "unknown criterion {criterion:?}"
            ))),
        }
    }

    pub fn end_action(&mut self) -> &mut Self {
        self.close(ScopeKind::Action)
    }

    /// Append a plain atom to the innermost scope.
    pub fn atom(
        &mut self,
        opcode: &str,
        operands: impl IntoIterator<Item = Operand>,
    ) -> &mut Self {
        if !self.require_open(opcode) {
            return self;
        }
        match self.table.atom(opcode, operands.into_iter().collect()) {
            Ok(atom) => self.push_plain(atom),
            Err(e) => self.fail(e.into()),
        }
    }

    /// Append an atom whose first operand is a symbolic name, e.g.
    /// `named("mat_orientation", "vcf", [])` or
    /// `named("async_alert", "info", ["Hello".into()])`.
    pub fn named(
        &mut self,
        opcode: &str,
        ident: &str,
        rest: impl IntoIterator<Item = Operand>,
    ) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        let Some(def) = self.table.by_name(opcode) else {
            return self.fail(CompileError::UnknownAtom(opcode.to_string()));
        };
        let Some(OperandKind::Named(set)) = def.operands.first() else {
            return self.fail(CompileError::Format(format!(
                "{opcode} has no symbolic first operand"
            )));
        };
        let Some(value) = atom::value_of(*set, ident) else {
            return self.fail(CompileError::Format(format!(
                "{opcode}: unknown {set:?} name {ident:?}"
            )));
        };
        let operands = std::iter::once(Operand::Int(value)).chain(rest);
        self.atom(opcode, operands)
    }

    /// Append an already validated atom.
    pub fn push_atom(&mut self, atom: Atom) -> &mut Self {
        if !self.require_open(atom.name()) {
            return self;
        }
        self.push_plain(atom)
    }

    /// Finish the script. Fails with the first recorded error, or if any
    /// scope is still open.
    pub fn build(self) -> Result<Script, CompileError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if let Some(frame) = self.stack.last() {
            return Err(CompileError::Structural(format!(
                "unclosed {} scope at end of script",
                frame.kind.name()
            )));
        }
        Ok(Script { nodes: self.roots })
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn innermost(&self) -> Option<ScopeKind> {
        self.stack.last().map(|f| f.kind)
    }

    fn require_open(&mut self, what: &str) -> bool {
        if self.error.is_some() {
            return false;
        }
        if self.stack.is_empty() {
            self.fail(CompileError::Structural(format!(
                "{what} outside a stream"
            )));
            return false;
        }
        true
    }

    fn object_kind(&mut self, kind: &str) -> Option<u8> {
        let value = atom::value_of(NameSet::ObjectType, kind).map(|v| v as u8);
        if value.is_none() {
            self.fail(CompileError::Format(format!(
                "unknown object type {kind:?}"
            )));
        }
        value
    }

    fn open(&mut self, kind: ScopeKind, head: Head) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        self.stack.push(Frame {
            kind,
            head,
            children: Vec::new(),
        });
        self
    }

    fn close(&mut self, kind: ScopeKind) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        match self.stack.last() {
            Some(frame) if frame.kind == kind => {}
            Some(frame) => {
                let msg = format!(
                    "end of {} scope while {} scope is innermost",
                    kind.name(),
                    frame.kind.name()
                );
                return self.fail(CompileError::Structural(msg));
            }
            None => {
                return self.fail(CompileError::Structural(format!(
                    "end of {} scope with no open scope",
                    kind.name()
                )))
            }
        }
        let Some(frame) = self.stack.pop() else {
            return self;
        };
        let node = match frame.head {
            Head::Stream(id) => Node::Stream {
                id,
                children: frame.children,
            },
            Head::Object {
                kind,
                title,
                sibling,
            } => Node::Object {
                kind,
                title,
                sibling,
                children: frame.children,
            },
            Head::Context(target) => Node::Context {
                target,
                children: frame.children,
            },
            Head::Action(criterion) => Node::Action {
                criterion,
                body: frame.children,
            },
        };
        self.push(node)
    }

    fn push_plain(&mut self, atom: Atom) -> &mut Self {
        if atom.def.scope != ScopeEffect::None {
            return self.fail(CompileError::Structural(format!(
                "{} changes scope and cannot be appended as a plain atom",
                atom.name()
            )));
        }
        let nested = atom.operands.iter().try_for_each(|op| match op {
            Operand::Stream(inner) => check_balance(inner),
            _ => Ok(()),
        });
        match nested {
            Ok(()) => self.push(Node::Atom(atom)),
            Err(e) => self.fail(e),
        }
    }

    fn push(&mut self, node: Node) -> &mut Self {
        match self.stack.last_mut() {
            Some(frame) => frame.children.push(node),
            None => self.roots.push(node),
        }
        self
    }
}

/// Check that the scope atoms of a nested stream operand pair up: every
/// opener has exactly one closer of the same kind, and siblings only follow
/// an open object.
pub fn check_balance(atoms: &[Atom]) -> Result<(), CompileError> {
    let mut open: Vec<Scope> = Vec::new();
    for atom in atoms {
        match atom.def.scope {
            ScopeEffect::None => {}
            ScopeEffect::Open(scope) => open.push(scope),
            ScopeEffect::Close(scope) | ScopeEffect::Reopen(scope) => {
                if open.last() != Some(&scope) {
                    return Err(CompileError::Structural(format!(
                        "{} without an open {} scope in nested stream",
                        atom.name(),
                        scope_name(scope)
                    )));
                }
                if matches!(atom.def.scope, ScopeEffect::Close(_)) {
                    open.pop();
                }
            }
        }
        for op in &atom.operands {
            if let Operand::Stream(inner) = op {
                check_balance(inner)?;
            }
        }
    }
    match open.last() {
        Some(scope) => Err(CompileError::Structural(format!(
            "unclosed {} scope in nested stream",
            scope_name(*scope)
        ))),
        None => Ok(()),
    }
}

fn scope_name(scope: Scope) -> &'static str {
    match scope {
        Scope::Stream => "stream",
        Scope::Object => "object",
        Scope::Context => "context",
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("structural error: {0}")]
    Structural(String),

    #[error("unknown atom {0:?}")]
    UnknownAtom(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("unknown scene {0:?}")]
    UnknownScene(String),

    #[error("max frame payload {0} leaves no room for an atom header")]
    FrameTooSmall(usize),
}

impl From<AtomError> for CompileError {
    fn from(e: AtomError) -> Self {
        match e {
            AtomError::UnknownAtom(name) => CompileError::UnknownAtom(name),
            AtomError::Format(msg) => CompileError::Format(msg),
            other => CompileError::Format(other.to_string()),
        }
    }
}
