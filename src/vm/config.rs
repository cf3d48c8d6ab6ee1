use crate::{callconv::TargetConvention, types::rules::TypeRules};
use serde::{Deserialize, Serialize};
use std::{env, str::FromStr};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Native convention used for entry stubs and calls into compiled code.
    pub convention: TargetConvention,
    /// Invocations before a method is offered to the tiering manager.
    pub tiering_threshold: u32,
    /// When false, methods with a backward branch are offered for promotion
    /// on their first invocation.
    pub interpret_loop_methods: bool,
    pub use_call_site_cache: bool,
    pub type_rules: TypeRules,
    /// Bytes of `localloc` storage a single frame may hold.
    pub localloc_limit: usize,
    pub max_call_depth: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            convention: TargetConvention::host(),
            tiering_threshold: 30,
            interpret_loop_methods: true,
            use_call_site_cache: true,
            type_rules: TypeRules::Permissive,
            localloc_limit: 1 << 20,
            max_call_depth: 4096,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = name, %value, "ignoring unparseable setting");
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => {
            tracing::warn!(variable = name, %value, "ignoring unparseable flag");
            None
        }
    }
}

impl InterpreterConfig {
    /// Defaults overlaid with the `DOTNET_INTERP_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay_env()
    }

    pub fn overlay_env(mut self) -> Self {
        if let Some(v) = env_parse("DOTNET_INTERP_TIERING_THRESHOLD") {
            self.tiering_threshold = v;
        }
        if let Some(v) = env_flag("DOTNET_INTERP_LOOP_METHODS") {
            self.interpret_loop_methods = v;
        }
        if let Some(v) = env_flag("DOTNET_INTERP_CACHE") {
            self.use_call_site_cache = v;
        }
        if let Ok(v) = env::var("DOTNET_INTERP_TYPE_RULES") {
            match v.trim().to_ascii_lowercase().as_str() {
                "strict" => self.type_rules = TypeRules::Strict,
                "permissive" => self.type_rules = TypeRules::Permissive,
                other => tracing::warn!(value = other, "unknown DOTNET_INTERP_TYPE_RULES"),
            }
        }
        if let Some(v) = env_parse("DOTNET_INTERP_LOCALLOC_LIMIT") {
            self.localloc_limit = v;
        }
        if let Some(v) = env_parse("DOTNET_INTERP_MAX_DEPTH") {
            self.max_call_depth = v;
        }
        self
    }

    pub fn with_convention(mut self, convention: TargetConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn with_type_rules(mut self, rules: TypeRules) -> Self {
        self.type_rules = rules;
        self
    }

    pub fn with_tiering_threshold(mut self, threshold: u32) -> Self {
        self.tiering_threshold = threshold;
        self
    }
}
