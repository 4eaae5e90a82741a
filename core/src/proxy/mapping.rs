//! Model mapping resolver
//!
//! Turns `(protocol, requested model)` into the upstream model id. Resolution
//! walks an ordered list of lookup layers and stops at the first hit:
//!
//! 1. exact entry in `custom_mapping`
//! 2. group entry in `anthropic_mapping` / `openai_mapping`
//! 3. built-in default for the group
//! 4. known upstream model, passed through
//!
//! Anything left over is passed through unchanged; the upstream decides
//! whether it exists.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::catalog::{self, Protocol};
use crate::error::{GatewayError, GatewayResult};

/// Bump when the classification rules below change meaning.
pub const GROUP_TABLE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupFamily {
    Anthropic,
    OpenAi,
}

#[derive(Debug)]
pub struct ModelGroup {
    pub key: &'static str,
    pub family: GroupFamily,
    pub default_target: &'static str,
    matcher: fn(&str) -> bool,
}

impl ModelGroup {
    pub fn matches(&self, normalized_id: &str) -> bool {
        (self.matcher)(normalized_id)
    }
}

fn is_claude_45(id: &str) -> bool {
    id.starts_with("claude") && (id.contains("4-5") || id.contains("4.5"))
}

fn is_claude_35(id: &str) -> bool {
    id.starts_with("claude")
        && (id.contains("3-5") || id.contains("3.5") || id.contains("3-7") || id.contains("3.7"))
}

fn is_gpt_4o(id: &str) -> bool {
    id.starts_with("gpt-4o") || id.starts_with("gpt-4.1") || id.starts_with("gpt-3.5")
}

fn is_gpt_4(id: &str) -> bool {
    id.starts_with("gpt-4") && !is_gpt_4o(id)
}

fn is_gpt_5(id: &str) -> bool {
    id.starts_with("gpt-5")
}

/// Order matters: the first matching group wins.
pub static MODEL_GROUPS: &[ModelGroup] = &[
    ModelGroup {
        key: "claude-4.5-series",
        family: GroupFamily::Anthropic,
        default_target: "gemini-3-pro-high",
        matcher: is_claude_45,
    },
    ModelGroup {
        key: "claude-3.5-series",
        family: GroupFamily::Anthropic,
        default_target: "claude-sonnet-4-5-thinking",
        matcher: is_claude_35,
    },
    ModelGroup {
        key: "gpt-4o-series",
        family: GroupFamily::OpenAi,
        default_target: "gemini-3-flash",
        matcher: is_gpt_4o,
    },
    ModelGroup {
        key: "gpt-4-series",
        family: GroupFamily::OpenAi,
        default_target: "gemini-3-pro-high",
        matcher: is_gpt_4,
    },
    ModelGroup {
        key: "gpt-5-series",
        family: GroupFamily::OpenAi,
        default_target: "gemini-3-flash",
        matcher: is_gpt_5,
    },
];

/// Group of a requested id. Catalog ids are classified like any other id,
/// so a group entry also redirects e.g. `claude-sonnet-4-5`.
pub fn group_for(model_id: &str) -> Option<&'static ModelGroup> {
    let normalized = model_id.trim().to_ascii_lowercase();
    MODEL_GROUPS.iter().find(|g| g.matches(&normalized))
}

pub fn find_group(key: &str) -> Option<&'static ModelGroup> {
    MODEL_GROUPS.iter().find(|g| g.key == key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingTable {
    Anthropic,
    OpenAi,
    Custom,
}

impl std::str::FromStr for MappingTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "custom" => Ok(Self::Custom),
            other => Err(format!("Unknown mapping table: {}", other)),
        }
    }
}

/// The three user-editable tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingTables {
    #[serde(default)]
    pub anthropic: HashMap<String, String>,
    #[serde(default)]
    pub openai: HashMap<String, String>,
    #[serde(default)]
    pub custom: HashMap<String, String>,
}

impl MappingTables {
    pub fn table(&self, which: MappingTable) -> &HashMap<String, String> {
        match which {
            MappingTable::Anthropic => &self.anthropic,
            MappingTable::OpenAi => &self.openai,
            MappingTable::Custom => &self.custom,
        }
    }

    fn table_mut(&mut self, which: MappingTable) -> &mut HashMap<String, String> {
        match which {
            MappingTable::Anthropic => &mut self.anthropic,
            MappingTable::OpenAi => &mut self.openai,
            MappingTable::Custom => &mut self.custom,
        }
    }

    /// Non-empty entry for `key`. Empty targets mean "use the default".
    fn lookup(&self, which: MappingTable, key: &str) -> Option<&str> {
        self.table(which)
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    /// Returns a new set of tables with `patch` merged in. `self` is untouched,
    /// so a rejected patch leaves nothing half-applied.
    pub fn merged(&self, patch: &MappingPatch) -> GatewayResult<MappingTables> {
        let mut next = self.clone();
        for (which, entries) in patch.tables() {
            for (key, target) in entries {
                let key = key.trim();
                if key.is_empty() {
                    return Err(GatewayError::InvalidConfig(format!(
                        "empty key in {:?} mapping",
                        which
                    )));
                }
                let table = next.table_mut(which);
                match target {
                    Some(target) => {
                        table.insert(key.to_string(), target.trim().to_string());
                    }
                    None => {
                        table.remove(key);
                    }
                }
            }
        }
        Ok(next)
    }

    pub fn is_empty(&self) -> bool {
        self.anthropic.is_empty() && self.openai.is_empty() && self.custom.is_empty()
    }
}

/// Merge-patch over the three tables: `Some(target)` sets one entry,
/// `None` (JSON `null`) removes it, absent keys are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingPatch {
    #[serde(default)]
    pub anthropic_mapping: HashMap<String, Option<String>>,
    #[serde(default)]
    pub openai_mapping: HashMap<String, Option<String>>,
    #[serde(default)]
    pub custom_mapping: HashMap<String, Option<String>>,
}

impl MappingPatch {
    pub fn set(mut self, which: MappingTable, key: &str, target: &str) -> Self {
        self.entries_mut(which)
            .insert(key.to_string(), Some(target.to_string()));
        self
    }

    pub fn remove(mut self, which: MappingTable, key: &str) -> Self {
        self.entries_mut(which).insert(key.to_string(), None);
        self
    }

    /// Number of entries touched.
    pub fn len(&self) -> usize {
        self.tables().iter().map(|(_, entries)| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries_mut(&mut self, which: MappingTable) -> &mut HashMap<String, Option<String>> {
        match which {
            MappingTable::Anthropic => &mut self.anthropic_mapping,
            MappingTable::OpenAi => &mut self.openai_mapping,
            MappingTable::Custom => &mut self.custom_mapping,
        }
    }

    fn tables(&self) -> [(MappingTable, &HashMap<String, Option<String>>); 3] {
        [
            (MappingTable::Anthropic, &self.anthropic_mapping),
            (MappingTable::OpenAi, &self.openai_mapping),
            (MappingTable::Custom, &self.custom_mapping),
        ]
    }
}

/// Which layer produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Custom,
    Group,
    BuiltinDefault,
    KnownModel,
    PassThrough,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub requested: String,
    pub target: String,
    pub group: Option<&'static str>,
    pub source: ResolutionSource,
}

pub struct LookupContext<'a> {
    pub protocol: Protocol,
    pub requested: &'a str,
    pub group: Option<&'static ModelGroup>,
    pub tables: &'a MappingTables,
}

/// One layer of the resolution chain.
pub trait LookupStrategy: Send + Sync {
    fn source(&self) -> ResolutionSource;
    fn lookup(&self, ctx: &LookupContext<'_>) -> Option<String>;
}

pub struct CustomExact;

impl LookupStrategy for CustomExact {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::Custom
    }

    fn lookup(&self, ctx: &LookupContext<'_>) -> Option<String> {
        ctx.tables
            .lookup(MappingTable::Custom, ctx.requested)
            .map(str::to_string)
    }
}

pub struct GroupMapping;

impl LookupStrategy for GroupMapping {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::Group
    }

    fn lookup(&self, ctx: &LookupContext<'_>) -> Option<String> {
        let group = ctx.group?;
        let table = match group.family {
            GroupFamily::Anthropic => MappingTable::Anthropic,
            GroupFamily::OpenAi => MappingTable::OpenAi,
        };
        ctx.tables.lookup(table, group.key).map(str::to_string)
    }
}

pub struct BuiltinDefault;

impl LookupStrategy for BuiltinDefault {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::BuiltinDefault
    }

    fn lookup(&self, ctx: &LookupContext<'_>) -> Option<String> {
        ctx.group.map(|g| g.default_target.to_string())
    }
}

pub struct KnownModel;

impl LookupStrategy for KnownModel {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::KnownModel
    }

    fn lookup(&self, ctx: &LookupContext<'_>) -> Option<String> {
        catalog::find(ctx.requested).map(|m| m.id.to_string())
    }
}

pub struct ModelResolver {
    layers: Vec<Box<dyn LookupStrategy>>,
}

impl Default for ModelResolver {
    fn default() -> Self {
        Self::standard()
    }
}

impl ModelResolver {
    pub fn standard() -> Self {
        Self::with_layers(vec![
            Box::new(CustomExact),
            Box::new(GroupMapping),
            Box::new(BuiltinDefault),
            Box::new(KnownModel),
        ])
    }

    pub fn with_layers(layers: Vec<Box<dyn LookupStrategy>>) -> Self {
        Self { layers }
    }

    /// Resolve `requested` against `tables`. Only fails for capability
    /// violations; unknown ids pass through.
    pub fn resolve(
        &self,
        protocol: Protocol,
        tables: &MappingTables,
        requested: &str,
    ) -> GatewayResult<Resolution> {
        let requested = requested.trim();
        reject_unsupported(protocol, requested)?;

        let group = group_for(requested);
        let ctx = LookupContext {
            protocol,
            requested,
            group,
            tables,
        };

        let (target, source) = self
            .layers
            .iter()
            .find_map(|layer| layer.lookup(&ctx).map(|t| (t, layer.source())))
            .unwrap_or_else(|| (requested.to_string(), ResolutionSource::PassThrough));

        // A mapping may point an anthropic client at an image model.
        reject_unsupported(protocol, &target)?;

        Ok(Resolution {
            requested: requested.to_string(),
            target,
            group: group.map(|g| g.key),
            source,
        })
    }
}

fn reject_unsupported(protocol: Protocol, model: &str) -> GatewayResult<()> {
    if protocol == Protocol::Anthropic && catalog::has_image_capability(model) {
        return Err(GatewayError::UnsupportedCapability {
            model: model.to_string(),
            protocol: protocol.to_string(),
            reason: "image generation models cannot be served as Messages".to_string(),
        });
    }
    Ok(())
}
