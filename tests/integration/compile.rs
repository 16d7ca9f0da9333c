use crate::*;

use std::sync::Arc;

use dialtone_core::codec::{decode_stream, encode_atoms};
use dialtone_core::Gid;
use dialtone_services::chunker;
use dialtone_services::{CompileError, Compiler, SceneContext, SceneRegistry};

fn compiler() -> Compiler {
    Compiler::new(Arc::new(AtomTable::standard()), MAX_PAYLOAD)
}

fn params_for(ctx: SceneContext, params: &[&str]) -> SceneContext {
    params.iter().fold(ctx, |ctx, p| match *p {
        "xfer_id" => ctx.with(p, 7),
        "size" => ctx.with(p, 10_240),
        _ => ctx.with(p, "hello.txt"),
    })
}

/// Every built-in scene decodes back to exactly the atoms it was built from.
#[test]
fn test_builtin_scenes_round_trip() {
    let c = compiler();
    let scenes = SceneRegistry::with_builtins();
    for info in scenes.list() {
        let ctx = params_for(SceneContext::new("Steve Case", ClientProfile::default()), info.params);
        let script = scenes.render(c.table(), &info.id, &ctx).unwrap();

        let atoms = c.flatten(&script).unwrap();
        let encoded = c.encode(&script).unwrap();
        let decoded = decode_stream(c.table(), &encoded.bytes).unwrap();
        assert_eq!(decoded, atoms, "scene {}", info.id);

        let (again, _) = encode_atoms(&decoded).unwrap();
        assert_eq!(again, encoded.bytes, "scene {}", info.id);
    }
}

/// Compiling the same script twice yields identical chunks, and the chunks
/// carry exactly the encoded stream.
#[test]
fn test_compile_is_idempotent() {
    let c = compiler();
    let src = r#"
        uni_start_stream
          man_start_object <ind_group, "Lobby">
            man_append_data <"People here: 23">
          man_end_object
          man_update_display
        uni_end_stream
    "#;
    let script = c.parse(src).unwrap();
    let a = c.compile(&script, 4, "lobby").unwrap();
    let b = c.compile(&script, 4, "lobby").unwrap();
    assert_eq!(a, b);
    assert_eq!(chunker::reassemble(&a), c.encode(&script).unwrap().bytes);
}

#[test]
fn test_gid_literals_round_trip() {
    for literal in ["32-105", "1-0-21029", "0-0", "255-65535", "255-255-65535"] {
        let gid: Gid = literal.parse().unwrap();
        assert_eq!(gid.to_string(), literal);

        let mut buf = Vec::new();
        gid.encode(&mut buf);
        assert_eq!(buf.len(), gid.wire_len());
        assert_eq!(Gid::decode(&buf).unwrap(), gid);
    }
    assert!("32".parse::<Gid>().is_err());
    assert!("1-2-3-4".parse::<Gid>().is_err());
    assert!("256-1".parse::<Gid>().is_err());
}

/// A single wait-off compiles to three atoms that fit in one frame.
#[test]
fn test_minimal_stream() {
    let c = compiler();
    let chunks = c
        .compile_source("uni_start_stream uni_wait_off uni_end_stream", 1, "wait")
        .unwrap();
    assert!(chunks.iter().all(|ch| ch.frame_payload_len() <= MAX_PAYLOAD));
    assert!(chunks.last().unwrap().last);

    let atoms = decode_stream(c.table(), &chunker::reassemble(&chunks)).unwrap();
    assert_eq!(
        atom_names(&atoms),
        ["uni_start_stream", "uni_wait_off", "uni_end_stream"]
    );
}

/// A long message spans many frames without any frame exceeding the limit.
#[test]
fn test_large_scene_is_chunked_within_limit() {
    let c = compiler();
    let scenes = SceneRegistry::with_builtins();
    let ctx = SceneContext::new("guest", ClientProfile::default())
        .with("text", "The quick brown fox jumps over the lazy dog. ".repeat(40));
    let script = scenes.render(c.table(), "message", &ctx).unwrap();

    let chunks = c.compile(&script, 2, "message").unwrap();
    assert!(chunks.len() > 10);
    assert!(chunks.iter().all(|ch| ch.frame_payload_len() <= MAX_PAYLOAD));
    let seqs: Vec<u32> = chunks.iter().map(|ch| ch.seq).collect();
    assert_eq!(seqs, (0..chunks.len() as u32).collect::<Vec<_>>());
    assert_eq!(chunks.iter().filter(|ch| ch.last).count(), 1);

    let decoded = decode_stream(c.table(), &chunker::reassemble(&chunks)).unwrap();
    assert_eq!(decoded, c.flatten(&script).unwrap());
}

#[test]
fn test_unknown_atom_is_rejected() {
    let c = compiler();
    let err = c
        .compile_source("uni_start_stream foo_bar uni_end_stream", 1, "bad")
        .unwrap_err();
    assert_eq!(err, CompileError::UnknownAtom("foo_bar".into()));
    assert!(err.to_string().contains("foo_bar"));
}

#[test]
fn test_unknown_scene_is_rejected() {
    let c = compiler();
    let scenes = SceneRegistry::with_builtins();
    let ctx = SceneContext::new("guest", ClientProfile::default());
    assert!(matches!(
        scenes.render(c.table(), "no_such_scene", &ctx),
        Err(CompileError::UnknownScene(_))
    ));
}
