//! Scene registry — scene id → construction function.
//!
//! A scene function describes its tree through a [`ScriptBuilder`] from the
//! parameters in a [`SceneContext`]. Scenes carry no state of their own.

use std::collections::{BTreeMap, HashMap};

use dialtone_core::atom::{AtomTable, Operand};
use dialtone_core::wire::ClientProfile;
use serde::Serialize;

use crate::script::{CompileError, Script, ScriptBuilder};

/// Inputs to a scene function.
#[derive(Debug, Clone, Default)]
pub struct SceneContext {
    pub screen_name: String,
    pub profile: ClientProfile,
    pub params: HashMap<String, String>,
}

impl SceneContext {
    pub fn new(screen_name: impl Into<String>, profile: ClientProfile) -> Self {
        Self {
            screen_name: screen_name.into(),
            profile,
            params: HashMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    /// A required parameter.
    pub fn param(&self, key: &str) -> Result<&str, CompileError> {
        self.params
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| CompileError::Format(format!("missing scene parameter {key:?}")))
    }

    pub fn param_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.params.get(key).map(String::as_str).unwrap_or(default)
    }

    /// A required numeric parameter.
    pub fn number(&self, key: &str) -> Result<u32, CompileError> {
        let raw = self.param(key)?;
        raw.parse()
            .map_err(|_| CompileError::Format(format!("scene parameter {key}={raw:?} is not a number")))
    }
}

pub type SceneFn = fn(&mut ScriptBuilder<'_>, &SceneContext) -> Result<(), CompileError>;

#[derive(Debug, Clone, Serialize)]
pub struct SceneInfo {
    pub id: String,
    pub params: &'static [&'static str],
}

struct Entry {
    build: SceneFn,
    params: &'static [&'static str],
}

/// Registry of named scenes. Owned by the composition root.
pub struct SceneRegistry {
    scenes: BTreeMap<String, Entry>,
}

impl SceneRegistry {
    pub fn new() -> Self {
        Self {
            scenes: BTreeMap::new(),
        }
    }

    /// A registry with every built-in scene.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register("welcome", &[], welcome);
        r.register("message", &["text"], message);
        r.register(
            XFER_DOWNLOAD_ANNOUNCE,
            &["xfer_id", "filename", "size"],
            xfer_download_announce,
        );
        r.register(XFER_UPLOAD_PICKER, &["xfer_id"], xfer_upload_picker);
        r.register(XFER_UPLOAD_STAT, &["xfer_id"], xfer_upload_stat);
        r.register(XFER_UPLOAD_AUTHORIZE, &["xfer_id"], xfer_upload_authorize);
        r.register(XFER_ABORT, &["xfer_id", "reason"], xfer_abort);
        r
    }

    /// Add or replace a scene.
    pub fn register(&mut self, id: &str, params: &'static [&'static str], build: SceneFn) {
        self.scenes.insert(id.to_string(), Entry { build, params });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.scenes.contains_key(id)
    }

    pub fn list(&self) -> Vec<SceneInfo> {
        self.scenes
            .iter()
            .map(|(id, e)| SceneInfo {
                id: id.clone(),
                params: e.params,
            })
            .collect()
    }

    /// Build the script for scene `id`.
    pub fn render(
        &self,
        table: &AtomTable,
        id: &str,
        ctx: &SceneContext,
    ) -> Result<Script, CompileError> {
        let entry = self
            .scenes
            .get(id)
            .ok_or_else(|| CompileError::UnknownScene(id.to_string()))?;
        let mut b = ScriptBuilder::new(table);
        if let Err(e) = (entry.build)(&mut b, ctx) {
            b.fail(e);
        }
        b.build()
    }
}

impl Default for SceneRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ── Built-in scenes ───────────────────────────────────────────────────────────

pub const XFER_DOWNLOAD_ANNOUNCE: &str = "xfer_download_announce";
pub const XFER_UPLOAD_PICKER: &str = "xfer_upload_picker";
pub const XFER_UPLOAD_STAT: &str = "xfer_upload_stat";
pub const XFER_UPLOAD_AUTHORIZE: &str = "xfer_upload_authorize";
pub const XFER_ABORT: &str = "xfer_abort";

fn welcome(b: &mut ScriptBuilder<'_>, ctx: &SceneContext) -> Result<(), CompileError> {
    let greeting = format!("Welcome, {}!", ctx.screen_name);
    b.stream()
        .object("ind_group", "Welcome")
        .named("mat_orientation", "vcf", [])
        .object("ornament", "")
        .atom("man_append_data", [Operand::from(greeting)])
        .end_object()
        .object("trigger", "OK")
        .named("mat_bool_default", "yes", [])
        .action("select")
        .atom("man_close", [])
        .end_action()
        .end_object()
        .end_object()
        .atom("man_update_display", [])
        .atom("uni_wait_off", [])
        .end_stream();
    Ok(())
}

fn message(b: &mut ScriptBuilder<'_>, ctx: &SceneContext) -> Result<(), CompileError> {
    let text = ctx.param("text")?;
    let kind = ctx.param_or("kind", "info");
    b.stream()
        .named("async_alert", kind, [Operand::from(text)])
        .atom("uni_wait_off", [])
        .end_stream();
    Ok(())
}

fn xfer_download_announce(
    b: &mut ScriptBuilder<'_>,
    ctx: &SceneContext,
) -> Result<(), CompileError> {
    let id = ctx.number("xfer_id")?;
    let filename = ctx.param("filename")?;
    let size = ctx.number("size")?;
    b.stream()
        .atom("xfer_set_id", [Operand::Int(id)])
        .atom("xfer_set_filename", [Operand::from(filename)])
        .atom("xfer_set_size", [Operand::Int(size)])
        .atom(
            "xfer_set_status_text",
            [Operand::from(format!("Receiving {filename}"))],
        )
        .atom("xfer_invoke_download", [])
        .atom("uni_wait_off", [])
        .end_stream();
    Ok(())
}

fn xfer_upload_picker(b: &mut ScriptBuilder<'_>, ctx: &SceneContext) -> Result<(), CompileError> {
    let id = ctx.number("xfer_id")?;
    let prompt = ctx.param_or("prompt", "Select a file to send");
    b.stream()
        .atom("xfer_set_id", [Operand::Int(id)])
        .atom("xfer_set_status_text", [Operand::from(prompt)])
        .atom("xfer_invoke_picker", [])
        .atom("uni_wait_off", [])
        .end_stream();
    Ok(())
}

fn xfer_upload_stat(b: &mut ScriptBuilder<'_>, ctx: &SceneContext) -> Result<(), CompileError> {
    let id = ctx.number("xfer_id")?;
    b.stream()
        .atom("xfer_set_id", [Operand::Int(id)])
        .atom("xfer_request_stats", [])
        .end_stream();
    Ok(())
}

fn xfer_upload_authorize(
    b: &mut ScriptBuilder<'_>,
    ctx: &SceneContext,
) -> Result<(), CompileError> {
    let id = ctx.number("xfer_id")?;
    b.stream()
        .atom("xfer_set_id", [Operand::Int(id)])
        .atom("xfer_set_status_text", [Operand::from("Sending...")])
        .atom("xfer_authorize_upload", [])
        .end_stream();
    Ok(())
}

fn xfer_abort(b: &mut ScriptBuilder<'_>, ctx: &SceneContext) -> Result<(), CompileError> {
    let id = ctx.number("xfer_id")?;
    let reason = ctx.param("reason")?;
    b.stream()
        .atom("xfer_set_id", [Operand::Int(id)])
        .atom("xfer_abort", [Operand::from(reason)])
        .atom("uni_wait_off", [])
        .end_stream();
    Ok(())
}
