//! dialtone-core — atom vocabulary, atom codec, link framing, and config.
//! All other Dialtone crates depend on this one.

pub mod atom;
pub mod codec;
pub mod config;
pub mod gid;
pub mod token;
pub mod wire;

pub use atom::{Atom, AtomDef, AtomError, AtomTable, AtomTag, Operand, OperandKind, Scope};
pub use gid::Gid;
pub use wire::{ClientProfile, Frame, FrameKind, Platform, WireError};
