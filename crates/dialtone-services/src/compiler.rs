//! Scene compiler — script → canonical atom sequence → encoded chunks.
//!
//! Flattening walks the tree in document order. Scopes become their opener
//! and closer atoms, sibling objects share one closer, and action blocks
//! become a nested stream operand:
//!
//! ```text
//!   select      →  act_replace_select_action <stream>
//!   otherwise   →  act_set_criterion <c>  act_replace_action <stream>
//! ```
//!
//! Compilation is pure: the same script always yields the same bytes.

use std::sync::Arc;

use dialtone_core::atom::{Atom, AtomTable, Operand};
use dialtone_core::codec::{self, AtomSpan};
use dialtone_core::token;

use crate::chunk_types::OutgoingChunk;
use crate::chunker;
use crate::parser;
use crate::script::{CompileError, ContextTarget, Node, Script, ScriptBuilder};

/// Criterion value of `select`.
const SELECT: u8 = 1;

/// An encoded script with the boundaries of every atom in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub spans: Vec<AtomSpan>,
}

#[derive(Debug)]
pub struct Compiler {
    table: Arc<AtomTable>,
    max_frame_payload: usize,
}

impl Compiler {
    pub fn new(table: Arc<AtomTable>, max_frame_payload: usize) -> Self {
        Self {
            table,
            max_frame_payload,
        }
    }

    pub fn table(&self) -> &AtomTable {
        &self.table
    }

    pub fn max_frame_payload(&self) -> usize {
        self.max_frame_payload
    }

    pub fn builder(&self) -> ScriptBuilder<'_> {
        ScriptBuilder::new(&self.table)
    }

    pub fn parse(&self, source: &str) -> Result<Script, CompileError> {
        parser::parse(&self.table, source)
    }

    /// The canonical atom sequence of `script`, with depths.
    pub fn flatten(&self, script: &Script) -> Result<Vec<Atom>, CompileError> {
        let mut out = Vec::new();
        self.flatten_nodes(script.nodes(), &mut out)?;
        codec::assign_depths(&mut out, 0);
        Ok(out)
    }

    pub fn encode(&self, script: &Script) -> Result<Encoded, CompileError> {
        let atoms = self.flatten(script)?;
        let (bytes, spans) = codec::encode_atoms(&atoms)?;
        Ok(Encoded { bytes, spans })
    }

    /// Compile `script` into FDO chunks for one stream.
    pub fn compile(
        &self,
        script: &Script,
        stream_id: u16,
        label: &str,
    ) -> Result<Vec<OutgoingChunk>, CompileError> {
        let encoded = self.encode(script)?;
        let chunks = chunker::chunk_stream(
            token::FDO,
            stream_id,
            &encoded.bytes,
            &encoded.spans,
            self.max_frame_payload,
            label,
        )?;
        tracing::debug!(
            label,
            stream_id,
            atoms = encoded.spans.len(),
            bytes = encoded.bytes.len(),
            chunks = chunks.len(),
            "compiled script"
        );
        Ok(chunks)
    }

    /// Parse and compile FDO source in one step.
    pub fn compile_source(
        &self,
        source: &str,
        stream_id: u16,
        label: &str,
    ) -> Result<Vec<OutgoingChunk>, CompileError> {
        let script = self.parse(source)?;
        self.compile(&script, stream_id, label)
    }

    fn make(&self, opcode: &str, operands: Vec<Operand>) -> Result<Atom, CompileError> {
        Ok(self.table.atom(opcode, operands)?)
    }

    fn flatten_nodes(&self, nodes: &[Node], out: &mut Vec<Atom>) -> Result<(), CompileError> {
        for (i, node) in nodes.iter().enumerate() {
            match node {
                Node::Atom(atom) => out.push(atom.clone()),
                Node::Stream { id, children } => {
                    let ops = id.map(Operand::Int).into_iter().collect();
                    out.push(self.make("uni_start_stream", ops)?);
                    self.flatten_nodes(children, out)?;
                    out.push(self.make("uni_end_stream", vec![])?);
                }
                Node::Object {
                    kind,
                    title,
                    sibling,
                    children,
                } => {
                    let opener = if *sibling {
                        "man_start_sibling"
                    } else {
                        "man_start_object"
                    };
                    let ops = vec![Operand::Int(*kind as u32), Operand::Str(title.clone())];
                    out.push(self.make(opener, ops)?);
                    self.flatten_nodes(children, out)?;
                    // a following sibling closes this object for us
                    let continued = matches!(nodes.get(i + 1), Some(Node::Object { sibling: true, .. }));
                    if !continued {
                        out.push(self.make("man_end_object", vec![])?);
                    }
                }
                Node::Context { target, children } => {
                    let opener = match target {
                        ContextTarget::Global(gid) => {
                            self.make("man_set_context_globalid", vec![Operand::Gid(*gid)])?
                        }
                        ContextTarget::Relative(tag) => {
                            self.make("man_set_context_relative", vec![Operand::Int(*tag)])?
                        }
                    };
                    out.push(opener);
                    self.flatten_nodes(children, out)?;
                    out.push(self.make("man_end_context", vec![])?);
                }
                Node::Action { criterion, body } => {
                    let mut inner = vec![self.make("uni_start_stream", vec![])?];
                    self.flatten_nodes(body, &mut inner)?;
                    inner.push(self.make("uni_end_stream", vec![])?);
                    let stream = vec![Operand::Stream(inner)];

                    if *criterion == SELECT {
                        out.push(self.make("act_replace_select_action", stream)?);
                    } else {
                        let c = Operand::Int(*criterion as u32);
                        out.push(self.make("act_set_criterion", vec![c])?);
                        out.push(self.make("act_replace_action", stream)?);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Render an atom sequence as indented FDO source.
pub fn render(atoms: &[Atom]) -> String {
    let mut out = String::new();
    for atom in atoms {
        for _ in 0..atom.depth {
            out.push_str("  ");
        }
        out.push_str(&atom.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialtone_core::atom::{value_of, NameSet};
    use dialtone_core::codec::decode_stream;

    fn compiler() -> Compiler {
        Compiler::new(Arc::new(AtomTable::standard()), 119)
    }

    fn names(atoms: &[Atom]) -> Vec<&'static str> {
        atoms.iter().map(|a| a.name()).collect()
    }

    #[test]
    fn select_constant_matches_table() {
        assert_eq!(value_of(NameSet::Criterion, "select"), Some(SELECT as u32));
    }

    #[test]
    fn single_wait_off_is_three_atoms() {
        let c = compiler();
        let mut b = c.builder();
        b.stream().atom("uni_wait_off", []).end_stream();
        let script = b.build().unwrap();

        let chunks = c.compile(&script, 1, "wait").unwrap();
        assert!(chunks.iter().all(|ch| ch.frame_payload_len() <= 119));
        let atoms = decode_stream(c.table(), &chunker::reassemble(&chunks)).unwrap();
        assert_eq!(
            names(&atoms),
            vec!["uni_start_stream", "uni_wait_off", "uni_end_stream"]
        );
        assert_eq!(atoms.iter().map(|a| a.depth).collect::<Vec<_>>(), vec![0, 1, 0]);
    }

    #[test]
    fn siblings_share_one_closer() {
        let c = compiler();
        let mut b = c.builder();
        b.stream()
            .object("ind_group", "Pick")
            .object("trigger", "Yes")
            .sibling("trigger", "No")
            .end_object()
            .end_object()
            .end_stream();
        let atoms = c.flatten(&b.build().unwrap()).unwrap();
        assert_eq!(
            names(&atoms),
            vec![
                "uni_start_stream",
                "man_start_object",
                "man_start_object",
                "man_start_sibling",
                "man_end_object",
                "man_end_object",
                "uni_end_stream",
            ]
        );
        assert_eq!(
            atoms.iter().map(|a| a.depth).collect::<Vec<_>>(),
            vec![0, 1, 2, 2, 2, 1, 0]
        );
    }

    #[test]
    fn actions_flatten_by_criterion() {
        let c = compiler();
        let mut b = c.builder();
        b.stream()
            .object("trigger", "Go")
            .action("select")
            .atom("async_exit", [])
            .end_action()
            .action("gain_focus")
            .atom("act_sound_beep", [])
            .end_action()
            .end_object()
            .end_stream();
        let atoms = c.flatten(&b.build().unwrap()).unwrap();
        assert_eq!(
            names(&atoms),
            vec![
                "uni_start_stream",
                "man_start_object",
                "act_replace_select_action",
                "act_set_criterion",
                "act_replace_action",
                "man_end_object",
                "uni_end_stream",
            ]
        );
        let Operand::Stream(inner) = &atoms[2].operands[0] else {
            panic!("expected nested stream");
        };
        assert_eq!(names(inner), vec!["uni_start_stream", "async_exit", "uni_end_stream"]);
        assert_eq!(inner[1].depth, 4);
    }

    #[test]
    fn large_data_spans_chunks_and_round_trips() {
        let c = compiler();
        let text = "lorem ipsum ".repeat(100);
        let mut b = c.builder();
        b.stream()
            .context(dialtone_core::Gid::two(32, 105))
            .atom("man_append_data", [Operand::from(text.as_str())])
            .atom("man_update_display", [])
            .end_context()
            .end_stream();
        let script = b.build().unwrap();
        let chunks = c.compile(&script, 9, "big").unwrap();
        assert!(chunks.len() > 10);
        assert!(chunks.iter().all(|ch| ch.stream_id == 9 && ch.token == token::FDO));

        let decoded = decode_stream(c.table(), &chunker::reassemble(&chunks)).unwrap();
        assert_eq!(decoded, c.flatten(&script).unwrap());
    }

    #[test]
    fn compile_is_idempotent() {
        let c = compiler();
        let src = r#"
            uni_start_stream
              man_start_object <ind_group, "Hi">
                mat_art_id <1-0-21029>
                man_append_data <"hello">
              man_end_object
            uni_end_stream
        "#;
        let script = c.parse(src).unwrap();
        let a = c.compile(&script, 3, "x").unwrap();
        let b = c.compile(&script, 3, "x").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn oversized_title_fails_at_compile() {
        let c = compiler();
        let mut b = c.builder();
        b.stream().object("ind_group", &"t".repeat(256)).end_object().end_stream();
        let script = b.build().unwrap();
        assert!(matches!(
            c.compile(&script, 1, "x"),
            Err(CompileError::Format(m)) if m.contains("exceeds field width 255")
        ));
    }

    #[test]
    fn render_indents_by_depth() {
        let c = compiler();
        let atoms = c
            .flatten(&c.parse("uni_start_stream uni_wait_off uni_end_stream").unwrap())
            .unwrap();
        assert_eq!(render(&atoms), "uni_start_stream\n  uni_wait_off\nuni_end_stream\n");
    }
}
