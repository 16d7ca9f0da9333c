//! Atom vocabulary — the closed instruction set of the FDO wire protocol.
//!
//! Every atom is identified on the wire by a (protocol, atom) byte pair.
//! The table below IS the compatibility contract with the installed client
//! base. Tag values, operand order, and operand widths must not change once
//! shipped. Add new atoms at the end of a protocol block only.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::gid::Gid;

// ── Tags ──────────────────────────────────────────────────────────────────────

/// Binary identity of an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomTag {
    pub protocol: u8,
    pub atom: u8,
}

impl AtomTag {
    pub const fn new(protocol: Protocol, atom: u8) -> Self {
        Self {
            protocol: protocol as u8,
            atom,
        }
    }
}

impl fmt::Display for AtomTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.atom)
    }
}

/// Atom protocol families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    Uni = 0,
    Man = 1,
    Act = 2,
    De = 3,
    Buf = 4,
    Idb = 5,
    Xfer = 6,
    Var = 11,
    Async = 12,
    Sm = 13,
    Mat = 16,
}

// ── Operand contract ──────────────────────────────────────────────────────────

/// Enumerated byte operands that accept symbolic names in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSet {
    ObjectType,
    Criterion,
    Orientation,
    Alert,
    Bool,
}

/// Wire type of one operand slot.
///
/// Fixed-width kinds may appear anywhere in a signature. Variable-width kinds
/// (`Num`, `Str`, `Raw`, `Gid`, `Stream`) consume the rest of the atom data and
/// therefore only ever appear last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// 1 byte.
    Byte,
    /// 2 bytes, big-endian.
    Word,
    /// 4 bytes, big-endian.
    Dword,
    /// 1–4 bytes, big-endian, minimal width.
    Num,
    /// Named enumerated byte.
    Named(NameSet),
    /// Text, with a maximum width in bytes.
    Str(u16),
    /// Opaque byte block.
    Raw,
    /// 2- or 3-part global id.
    Gid,
    /// A nested, fully encoded atom stream.
    Stream,
}

impl OperandKind {
    pub fn is_variable(&self) -> bool {
        matches!(
            self,
            OperandKind::Num
                | OperandKind::Str(_)
                | OperandKind::Raw
                | OperandKind::Gid
                | OperandKind::Stream
        )
    }
}

/// Which scope an atom opens or closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Stream,
    Object,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeEffect {
    None,
    Open(Scope),
    Close(Scope),
    /// Closes the current scope and opens a new one of the same kind.
    Reopen(Scope),
}

/// Static definition of one atom.
#[derive(Debug, PartialEq, Eq)]
pub struct AtomDef {
    pub name: &'static str,
    pub tag: AtomTag,
    pub operands: &'static [OperandKind],
    /// Operands beyond this count may be omitted from the end.
    pub min_operands: u8,
    pub scope: ScopeEffect,
}

// ── Atom values ───────────────────────────────────────────────────────────────

/// A typed operand value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Int(u32),
    Str(String),
    Raw(Bytes),
    Gid(Gid),
    Stream(Vec<Atom>),
}

impl From<u32> for Operand {
    fn from(v: u32) -> Self {
        Operand::Int(v)
    }
}

impl From<&str> for Operand {
    fn from(s: &str) -> Self {
        Operand::Str(s.to_string())
    }
}

impl From<String> for Operand {
    fn from(s: String) -> Self {
        Operand::Str(s)
    }
}

impl From<Gid> for Operand {
    fn from(g: Gid) -> Self {
        Operand::Gid(g)
    }
}

impl From<Bytes> for Operand {
    fn from(b: Bytes) -> Self {
        Operand::Raw(b)
    }
}

/// One instruction: definition, operands, and derived nesting depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    pub def: &'static AtomDef,
    pub operands: Vec<Operand>,
    pub depth: u16,
}

impl Atom {
    pub fn name(&self) -> &'static str {
        self.def.name
    }

    pub fn tag(&self) -> AtomTag {
        self.def.tag
    }

    pub fn with_depth(mut self, depth: u16) -> Self {
        self.depth = depth;
        self
    }
}

impl fmt::Display for Atom {
    /// Renders the atom as FDO source text, e.g. `man_start_object <trigger, "OK">`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.def.name)?;
        if self.operands.is_empty() {
            return Ok(());
        }
        f.write_str(" <")?;
        for (i, (op, kind)) in self.operands.iter().zip(self.def.operands).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match (op, kind) {
                (Operand::Int(v), OperandKind::Named(set)) => match name_of(*set, *v) {
                    Some(name) => f.write_str(&name)?,
                    None => write!(f, "{v}")?,
                },
                (Operand::Int(v), _) => write!(f, "{v}")?,
                (Operand::Str(s), _) => write!(f, "{s:?}")?,
                (Operand::Raw(b), _) => {
                    for (j, byte) in b.iter().enumerate() {
                        if j > 0 {
                            f.write_str(" ")?;
                        }
                        write!(f, "{byte:02x}x")?;
                    }
                }
                (Operand::Gid(g), _) => write!(f, "{g}")?,
                (Operand::Stream(atoms), _) => {
                    for (j, atom) in atoms.iter().enumerate() {
                        if j > 0 {
                            f.write_str(" ")?;
                        }
                        write!(f, "{atom}")?;
                    }
                }
            }
        }
        f.write_str(">")
    }
}

// ── Symbolic names ────────────────────────────────────────────────────────────

const OBJECT_TYPES: &[&str] = &[
    "org_group",
    "ind_group",
    "dms_list",
    "sms_list",
    "dss_list",
    "sss_list",
    "trigger",
    "ornament",
    "view",
    "edit_view",
    "boolean",
    "select_boolean",
    "range",
    "select_range",
    "variable",
    "ruler",
    "root",
    "rich_text",
    "multimedia",
    "chart",
    "pictalk",
    "www",
    "split",
    "organizer",
    "tree",
    "tab",
];

// index 0 is unused; criteria start at 1
const CRITERIA: &[&str] = &[
    "",
    "select",
    "gain_focus",
    "lose_focus",
    "close",
    "cancel",
    "create",
    "set_online",
    "set_offline",
    "restore",
    "minimize",
    "enter_free",
    "enter_paid",
    "double_click",
];

const ALERTS: &[&str] = &["info", "error", "warning", "yes_no", "ok_cancel"];

const ORIENT_DIR: &[u8] = b"hv";
const ORIENT_JUSTIFY: &[u8] = b"clrtbe";
const ORIENT_FILL: &[u8] = b"ft";

/// Resolve a symbolic operand to its byte value.
pub fn value_of(set: NameSet, ident: &str) -> Option<u32> {
    let pos = |names: &[&str]| names.iter().position(|n| !n.is_empty() && *n == ident);
    match set {
        NameSet::ObjectType => pos(OBJECT_TYPES).map(|p| p as u32),
        NameSet::Criterion => pos(CRITERIA).map(|p| p as u32),
        NameSet::Alert => pos(ALERTS).map(|p| p as u32),
        NameSet::Bool => match ident {
            "yes" | "true" => Some(1),
            "no" | "false" => Some(0),
            _ => None,
        },
        NameSet::Orientation => {
            let b = ident.as_bytes();
            if b.len() != 3 {
                return None;
            }
            let dir = ORIENT_DIR.iter().position(|c| *c == b[0])?;
            let justify = ORIENT_JUSTIFY.iter().position(|c| *c == b[1])?;
            let fill = ORIENT_FILL.iter().position(|c| *c == b[2])?;
            Some(((dir << 4) | (justify << 1) | fill) as u32)
        }
    }
}

/// Reverse of [`value_of`].
pub fn name_of(set: NameSet, value: u32) -> Option<String> {
    let at = |names: &[&str]| {
        names
            .get(value as usize)
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
    };
    match set {
        NameSet::ObjectType => at(OBJECT_TYPES),
        NameSet::Criterion => at(CRITERIA),
        NameSet::Alert => at(ALERTS),
        NameSet::Bool => match value {
            0 => Some("no".into()),
            1 => Some("yes".into()),
            _ => None,
        },
        NameSet::Orientation => {
            let dir = ORIENT_DIR.get(((value >> 4) & 0x0F) as usize)?;
            let justify = ORIENT_JUSTIFY.get(((value >> 1) & 0x07) as usize)?;
            let fill = ORIENT_FILL.get((value & 0x01) as usize)?;
            if value > 0x1F {
                return None;
            }
            Some(String::from_utf8_lossy(&[*dir, *justify, *fill]).into_owned())
        }
    }
}

// ── The table ─────────────────────────────────────────────────────────────────

use OperandKind::{Byte, Dword, Named, Num, Raw, Str, Word};
use Protocol::*;

const TEXT: OperandKind = Str(0x7FFF);
const TITLE: OperandKind = Str(255);
const TOKEN: OperandKind = Str(2);
const GID: OperandKind = OperandKind::Gid;
const STREAM: OperandKind = OperandKind::Stream;

const fn def(
    name: &'static str,
    protocol: Protocol,
    atom: u8,
    operands: &'static [OperandKind],
    min_operands: u8,
    scope: ScopeEffect,
) -> AtomDef {
    AtomDef {
        name,
        tag: AtomTag::new(protocol, atom),
        operands,
        min_operands,
        scope,
    }
}

const fn plain(
    name: &'static str,
    protocol: Protocol,
    atom: u8,
    operands: &'static [OperandKind],
) -> AtomDef {
    def(name, protocol, atom, operands, operands.len() as u8, ScopeEffect::None)
}

/// Frozen atom definitions, wire format version 1.
pub static ATOMS: &[AtomDef] = &[
    // UNI: stream control
    plain("uni_void", Uni, 0, &[]),
    def("uni_start_stream", Uni, 1, &[Num], 0, ScopeEffect::Open(Scope::Stream)),
    def("uni_end_stream", Uni, 2, &[], 0, ScopeEffect::Close(Scope::Stream)),
    plain("uni_abort_stream", Uni, 3, &[]),
    plain("uni_wait_on", Uni, 9, &[]),
    plain("uni_wait_off", Uni, 10, &[]),
    plain("uni_wait_clear", Uni, 11, &[]),
    plain("uni_invoke_local", Uni, 12, &[GID]),
    plain("uni_invoke_no_context", Uni, 13, &[GID]),
    plain("uni_sync_skip", Uni, 14, &[Num]),
    // MAN: object manager
    def("man_start_object", Man, 0, &[Named(NameSet::ObjectType), TITLE], 1, ScopeEffect::Open(Scope::Object)),
    def("man_start_sibling", Man, 1, &[Named(NameSet::ObjectType), TITLE], 1, ScopeEffect::Reopen(Scope::Object)),
    def("man_end_object", Man, 2, &[], 0, ScopeEffect::Close(Scope::Object)),
    def("man_close", Man, 3, &[GID], 0, ScopeEffect::None),
    def("man_set_context_globalid", Man, 4, &[GID], 1, ScopeEffect::Open(Scope::Context)),
    def("man_set_context_relative", Man, 5, &[Num], 1, ScopeEffect::Open(Scope::Context)),
    def("man_end_context", Man, 6, &[], 0, ScopeEffect::Close(Scope::Context)),
    plain("man_update_display", Man, 7, &[]),
    plain("man_append_data", Man, 8, &[TEXT]),
    plain("man_replace_data", Man, 9, &[TEXT]),
    plain("man_set_default_title", Man, 10, &[TITLE]),
    plain("man_close_children", Man, 11, &[]),
    plain("man_make_focus", Man, 12, &[]),
    plain("man_preset_gid", Man, 15, &[GID]),
    plain("man_update_end_object", Man, 17, &[]),
    plain("man_force_update", Man, 18, &[]),
    plain("man_clear_object", Man, 20, &[]),
    // ACT: actions
    plain("act_set_criterion", Act, 0, &[Named(NameSet::Criterion)]),
    plain("act_do_action", Act, 1, &[Named(NameSet::Criterion)]),
    plain("act_replace_action", Act, 2, &[STREAM]),
    plain("act_replace_select_action", Act, 3, &[STREAM]),
    plain("act_append_action", Act, 4, &[STREAM]),
    plain("act_set_inheritance", Act, 5, &[Num]),
    plain("act_sound_beep", Act, 6, &[]),
    // DE: data extraction
    def("de_start_extraction", De, 0, &[Num], 0, ScopeEffect::None),
    plain("de_end_extraction", De, 1, &[]),
    plain("de_data", De, 2, &[TEXT]),
    plain("de_set_extraction_type", De, 3, &[Num]),
    plain("de_validate", De, 4, &[Num]),
    plain("de_ez_send_form", De, 5, &[TOKEN]),
    // BUF: client-side send buffers
    def("buf_start_buffer", Buf, 0, &[Num], 0, ScopeEffect::None),
    plain("buf_set_token", Buf, 1, &[TOKEN]),
    plain("buf_add_data", Buf, 2, &[Raw]),
    plain("buf_add_string", Buf, 3, &[TEXT]),
    plain("buf_close_buffer", Buf, 4, &[]),
    plain("buf_set_flags", Buf, 5, &[Num]),
    // IDB: client object database (art, forms)
    plain("idb_start_obj", Idb, 0, &[GID]),
    plain("idb_end_obj", Idb, 1, &[]),
    plain("idb_set_length", Idb, 2, &[Dword]),
    plain("idb_append_data", Idb, 3, &[Raw]),
    plain("idb_delete_obj", Idb, 4, &[GID]),
    // XFER: file transfer control
    plain("xfer_set_id", Xfer, 0, &[Dword]),
    plain("xfer_set_filename", Xfer, 1, &[TITLE]),
    plain("xfer_set_size", Xfer, 2, &[Dword]),
    plain("xfer_invoke_download", Xfer, 3, &[]),
    plain("xfer_invoke_picker", Xfer, 4, &[]),
    plain("xfer_request_stats", Xfer, 5, &[]),
    plain("xfer_authorize_upload", Xfer, 6, &[]),
    def("xfer_abort", Xfer, 7, &[TITLE], 0, ScopeEffect::None),
    plain("xfer_set_status_text", Xfer, 8, &[TITLE]),
    // VAR: client registers
    plain("var_number_set", Var, 0, &[Dword]),
    plain("var_string_set", Var, 1, &[TITLE]),
    plain("var_number_clear", Var, 2, &[]),
    // ASYNC: client-side commands
    plain("async_alert", Async, 0, &[Named(NameSet::Alert), TEXT]),
    plain("async_exit", Async, 1, &[]),
    plain("async_exec_app", Async, 2, &[TITLE]),
    plain("async_playsound", Async, 3, &[TITLE]),
    // SM: session manager
    plain("sm_send_token_arg", Sm, 0, &[TOKEN]),
    plain("sm_send_token_raw", Sm, 1, &[Raw]),
    // MAT: object attributes
    plain("mat_orientation", Mat, 0, &[Named(NameSet::Orientation)]),
    plain("mat_position", Mat, 1, &[Byte]),
    plain("mat_size", Mat, 2, &[Byte, Byte]),
    plain("mat_font_sis", Mat, 3, &[Byte, Byte, Byte]),
    plain("mat_art_id", Mat, 4, &[GID]),
    plain("mat_bool_default", Mat, 5, &[Named(NameSet::Bool)]),
    plain("mat_bool_disabled", Mat, 6, &[Named(NameSet::Bool)]),
    plain("mat_bool_modal", Mat, 7, &[Named(NameSet::Bool)]),
    plain("mat_bool_resize_vertical", Mat, 8, &[Named(NameSet::Bool)]),
    plain("mat_bool_resize_horizontal", Mat, 9, &[Named(NameSet::Bool)]),
    plain("mat_relative_tag", Mat, 11, &[Num]),
    plain("mat_capacity", Mat, 12, &[Num]),
    plain("mat_color_face", Mat, 13, &[Byte, Byte, Byte]),
    plain("mat_color_text", Mat, 14, &[Byte, Byte, Byte]),
    plain("mat_bool_precise", Mat, 15, &[Named(NameSet::Bool)]),
    plain("mat_precise_x", Mat, 16, &[Word]),
    plain("mat_precise_y", Mat, 17, &[Word]),
    plain("mat_precise_width", Mat, 18, &[Word]),
    plain("mat_precise_height", Mat, 19, &[Word]),
    plain("mat_style_id", Mat, 21, &[Num]),
    plain("mat_bool_invisible", Mat, 22, &[Named(NameSet::Bool)]),
    plain("mat_bool_protected_input", Mat, 24, &[Named(NameSet::Bool)]),
    plain("mat_bool_writeable", Mat, 25, &[Named(NameSet::Bool)]),
];

/// Indexed view over an atom definition list.
///
/// Owned by whoever composes the server (no process-wide singleton), so
/// tests can build isolated tables.
#[derive(Debug, Clone)]
pub struct AtomTable {
    defs: &'static [AtomDef],
    by_name: HashMap<&'static str, usize>,
    by_tag: HashMap<AtomTag, usize>,
}

impl AtomTable {
    /// The table for the current wire format version.
    pub fn standard() -> Self {
        Self::from_defs(ATOMS)
    }

    pub fn from_defs(defs: &'static [AtomDef]) -> Self {
        let mut by_name = HashMap::with_capacity(defs.len());
        let mut by_tag = HashMap::with_capacity(defs.len());
        for (i, d) in defs.iter().enumerate() {
            by_name.insert(d.name, i);
            by_tag.insert(d.tag, i);
        }
        Self {
            defs,
            by_name,
            by_tag,
        }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<&'static AtomDef> {
        let defs = self.defs;
        self.by_name.get(name).map(|&i| &defs[i])
    }

    pub fn by_tag(&self, tag: AtomTag) -> Option<&'static AtomDef> {
        let defs = self.defs;
        self.by_tag.get(&tag).map(|&i| &defs[i])
    }

    /// Build a validated atom from an opcode token and operands.
    ///
    /// Trailing empty text/raw operands beyond the minimum are dropped, since
    /// they are indistinguishable from omission on the wire.
    pub fn atom(&self, opcode: &str, operands: Vec<Operand>) -> Result<Atom, AtomError> {
        let def = self
            .by_name(opcode)
            .ok_or_else(|| AtomError::UnknownAtom(opcode.to_string()))?;
        let mut operands = operands;
        while operands.len() > def.min_operands as usize {
            match operands.last() {
                Some(Operand::Str(s)) if s.is_empty() => operands.pop(),
                Some(Operand::Raw(b)) if b.is_empty() => operands.pop(),
                _ => break,
            };
        }
        validate(def, &operands)?;
        Ok(Atom {
            def,
            operands,
            depth: 0,
        })
    }
}

/// Check operand arity and types against an atom's signature.
pub fn validate(def: &AtomDef, operands: &[Operand]) -> Result<(), AtomError> {
    let max = def.operands.len();
    let min = def.min_operands as usize;
    if operands.len() < min || operands.len() > max {
        return Err(AtomError::Format(format!(
            "{} takes {} operand(s), got {}",
            def.name,
            if min == max {
                max.to_string()
            } else {
                format!("{min}..={max}")
            },
            operands.len()
        )));
    }

    for (i, (op, kind)) in operands.iter().zip(def.operands).enumerate() {
        let mismatch = || {
            AtomError::Format(format!(
                "{} operand {} expects {:?}, got {}",
                def.name,
                i + 1,
                kind,
                operand_type_name(op)
            ))
        };
        match (kind, op) {
            (OperandKind::Byte | OperandKind::Named(_), Operand::Int(v)) => {
                if *v > 0xFF {
                    return Err(AtomError::Format(format!(
                        "{} operand {} value {v} exceeds byte width",
                        def.name,
                        i + 1
                    )));
                }
            }
            (OperandKind::Word, Operand::Int(v)) => {
                if *v > 0xFFFF {
                    return Err(AtomError::Format(format!(
                        "{} operand {} value {v} exceeds word width",
                        def.name,
                        i + 1
                    )));
                }
            }
            (OperandKind::Dword | OperandKind::Num, Operand::Int(_)) => {}
            (OperandKind::Str(max), Operand::Str(s)) => {
                if s.len() > *max as usize {
                    return Err(AtomError::Format(format!(
                        "{} string of {} bytes exceeds field width {max}",
                        def.name,
                        s.len()
                    )));
                }
            }
            (OperandKind::Raw, Operand::Raw(_)) => {}
            (OperandKind::Gid, Operand::Gid(_)) => {}
            (OperandKind::Stream, Operand::Stream(_)) => {}
            _ => return Err(mismatch()),
        }
    }
    Ok(())
}

fn operand_type_name(op: &Operand) -> &'static str {
    match op {
        Operand::Int(_) => "integer",
        Operand::Str(_) => "string",
        Operand::Raw(_) => "byte block",
        Operand::Gid(_) => "gid",
        Operand::Stream(_) => "stream",
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AtomError {
    #[error("unknown atom {0:?}")]
    UnknownAtom(String),

    #[error("unknown atom tag {protocol}:{atom}")]
    UnknownTag { protocol: u8, atom: u8 },

    #[error("format error: {0}")]
    Format(String),

    #[error("atom stream truncated at offset {0}")]
    Truncated(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
