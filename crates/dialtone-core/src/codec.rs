//! Atom stream codec — full-style FDO encoding.
//!
//! Layout of one atom:
//!
//! ```text
//!   [protocol u8][atom u8][length 1|2][data ...]
//! ```
//!
//! `length` is one byte when the data is shorter than 0x80 bytes, otherwise two
//! bytes `0x80 | hi, lo`, capping a single atom at 0x7FFF data bytes. Operand
//! encodings inside `data` follow the atom's signature (see [`OperandKind`]).

use bytes::Bytes;

use crate::atom::{Atom, AtomDef, AtomError, AtomTable, AtomTag, Operand, OperandKind, ScopeEffect};
use crate::gid::Gid;

/// Largest data region a single atom can carry.
pub const MAX_ATOM_DATA: usize = 0x7FFF;

/// Byte range of one encoded atom within an encoded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomSpan {
    pub offset: usize,
    /// Tag + length bytes. Never split across transport chunks.
    pub header_len: usize,
    pub total_len: usize,
}

/// Encode one atom, appending to `out`. Returns its span.
pub fn encode_atom(atom: &Atom, out: &mut Vec<u8>) -> Result<AtomSpan, AtomError> {
    encode_into(atom, out, &mut Vec::new())
}

/// Encode a sequence of atoms, returning the bytes and the span of every
/// atom, including atoms nested in stream operands, in offset order.
pub fn encode_atoms(atoms: &[Atom]) -> Result<(Vec<u8>, Vec<AtomSpan>), AtomError> {
    let mut out = Vec::new();
    let mut spans = Vec::with_capacity(atoms.len());
    for atom in atoms {
        encode_into(atom, &mut out, &mut spans)?;
    }
    Ok((out, spans))
}

fn encode_into(
    atom: &Atom,
    out: &mut Vec<u8>,
    spans: &mut Vec<AtomSpan>,
) -> Result<AtomSpan, AtomError> {
    let mut data = Vec::new();
    let mut nested = Vec::new();
    encode_operands(atom.def, &atom.operands, &mut data, &mut nested)?;
    if data.len() > MAX_ATOM_DATA {
        return Err(AtomError::Format(format!(
            "{} data of {} bytes exceeds {} byte atom limit",
            atom.def.name,
            data.len(),
            MAX_ATOM_DATA
        )));
    }

    let offset = out.len();
    out.push(atom.def.tag.protocol);
    out.push(atom.def.tag.atom);
    if data.len() < 0x80 {
        out.push(data.len() as u8);
    } else {
        out.push(0x80 | (data.len() >> 8) as u8);
        out.push((data.len() & 0xFF) as u8);
    }
    let header_len = out.len() - offset;
    out.extend_from_slice(&data);

    let span = AtomSpan {
        offset,
        header_len,
        total_len: header_len + data.len(),
    };
    spans.push(span);
    // nested offsets are relative to the data region
    let base = offset + header_len;
    spans.extend(nested.into_iter().map(|s| AtomSpan {
        offset: base + s.offset,
        ..s
    }));
    Ok(span)
}

fn encode_operands(
    def: &AtomDef,
    operands: &[Operand],
    out: &mut Vec<u8>,
    spans: &mut Vec<AtomSpan>,
) -> Result<(), AtomError> {
    for (kind, op) in def.operands.iter().zip(operands) {
        match (kind, op) {
            (OperandKind::Byte | OperandKind::Named(_), Operand::Int(v)) => out.push(*v as u8),
            (OperandKind::Word, Operand::Int(v)) => {
                out.extend_from_slice(&(*v as u16).to_be_bytes())
            }
            (OperandKind::Dword, Operand::Int(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (OperandKind::Num, Operand::Int(v)) => {
                let be = v.to_be_bytes();
                let skip = be.iter().take(3).take_while(|b| **b == 0).count();
                out.extend_from_slice(&be[skip..]);
            }
            (OperandKind::Str(_), Operand::Str(s)) => out.extend_from_slice(s.as_bytes()),
            (OperandKind::Raw, Operand::Raw(b)) => out.extend_from_slice(b),
            (OperandKind::Gid, Operand::Gid(g)) => g.encode(out),
            (OperandKind::Stream, Operand::Stream(atoms)) => {
                for atom in atoms {
                    encode_into(atom, out, spans)?;
                }
            }
            _ => {
                return Err(AtomError::Format(format!(
                    "{} operand does not match {:?}",
                    def.name, kind
                )))
            }
        }
    }
    Ok(())
}

/// Set nesting depths on a sequence of atoms using the same rule the decoder
/// applies: closers and reopeners step out before the atom, openers and
/// reopeners step in after it, nested streams start one level deeper.
pub fn assign_depths(atoms: &mut [Atom], base: u16) {
    let mut depth = base;
    for atom in atoms {
        if matches!(atom.def.scope, ScopeEffect::Close(_) | ScopeEffect::Reopen(_)) {
            depth = depth.saturating_sub(1).max(base);
        }
        atom.depth = depth;
        for op in &mut atom.operands {
            if let Operand::Stream(inner) = op {
                assign_depths(inner, depth + 1);
            }
        }
        if matches!(atom.def.scope, ScopeEffect::Open(_) | ScopeEffect::Reopen(_)) {
            depth += 1;
        }
    }
}

/// Decode a complete atom stream. Depth is reconstructed from scope effects.
pub fn decode_stream(table: &AtomTable, bytes: &[u8]) -> Result<Vec<Atom>, AtomError> {
    decode_at_depth(table, bytes, 0, 0)
}

fn decode_at_depth(
    table: &AtomTable,
    bytes: &[u8],
    base_offset: usize,
    base_depth: u16,
) -> Result<Vec<Atom>, AtomError> {
    let mut atoms = Vec::new();
    let mut pos = 0;
    let mut depth = base_depth;

    while pos < bytes.len() {
        let start = pos;
        let header = bytes
            .get(pos..pos + 3)
            .ok_or(AtomError::Truncated(base_offset + start))?;
        let tag = AtomTag {
            protocol: header[0],
            atom: header[1],
        };
        let mut len = header[2] as usize;
        pos += 3;
        if len & 0x80 != 0 {
            let lo = *bytes
                .get(pos)
                .ok_or(AtomError::Truncated(base_offset + start))?;
            len = ((len & 0x7F) << 8) | lo as usize;
            pos += 1;
        }
        let data = bytes
            .get(pos..pos + len)
            .ok_or(AtomError::Truncated(base_offset + start))?;
        let data_offset = base_offset + pos;
        pos += len;

        let def = table.by_tag(tag).ok_or(AtomError::UnknownTag {
            protocol: tag.protocol,
            atom: tag.atom,
        })?;

        if matches!(def.scope, ScopeEffect::Close(_) | ScopeEffect::Reopen(_)) {
            depth = depth.saturating_sub(1).max(base_depth);
        }
        let operands = decode_operands(table, def, data, data_offset, depth + 1)?;
        atoms.push(Atom {
            def,
            operands,
            depth,
        });
        if matches!(def.scope, ScopeEffect::Open(_) | ScopeEffect::Reopen(_)) {
            depth += 1;
        }
    }
    Ok(atoms)
}

fn decode_operands(
    table: &AtomTable,
    def: &'static AtomDef,
    data: &[u8],
    data_offset: usize,
    inner_depth: u16,
) -> Result<Vec<Operand>, AtomError> {
    let mut ops = Vec::with_capacity(def.operands.len());
    let mut rest = data;

    for (i, kind) in def.operands.iter().enumerate() {
        if rest.is_empty() && i >= def.min_operands as usize {
            break;
        }
        let short = || {
            AtomError::Format(format!(
                "{} operand {} truncated",
                def.name,
                i + 1
            ))
        };
        let op = match kind {
            OperandKind::Byte | OperandKind::Named(_) => {
                let (b, tail) = rest.split_first().ok_or_else(short)?;
                rest = tail;
                Operand::Int(*b as u32)
            }
            OperandKind::Word => {
                let b = rest.get(..2).ok_or_else(short)?;
                rest = &rest[2..];
                Operand::Int(u16::from_be_bytes([b[0], b[1]]) as u32)
            }
            OperandKind::Dword => {
                let b = rest.get(..4).ok_or_else(short)?;
                rest = &rest[4..];
                Operand::Int(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            OperandKind::Num => {
                if rest.is_empty() || rest.len() > 4 {
                    return Err(AtomError::Format(format!(
                        "{} numeric field must be 1-4 bytes, got {}",
                        def.name,
                        rest.len()
                    )));
                }
                let v = rest.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);
                rest = &[];
                Operand::Int(v)
            }
            OperandKind::Str(_) => {
                let s = std::str::from_utf8(rest).map_err(|_| {
                    AtomError::Format(format!("{} text is not valid utf-8", def.name))
                })?;
                rest = &[];
                Operand::Str(s.to_string())
            }
            OperandKind::Raw => {
                let b = Bytes::copy_from_slice(rest);
                rest = &[];
                Operand::Raw(b)
            }
            OperandKind::Gid => {
                let g = Gid::decode(rest)?;
                rest = &[];
                Operand::Gid(g)
            }
            OperandKind::Stream => {
                let inner = decode_at_depth(table, rest, data_offset, inner_depth)?;
                rest = &[];
                Operand::Stream(inner)
            }
        };
        ops.push(op);
    }

    if !rest.is_empty() {
        return Err(AtomError::Format(format!(
            "{} has {} trailing data byte(s)",
            def.name,
            rest.len()
        )));
    }
    Ok(ops)
}
