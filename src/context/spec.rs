//! Context declarations: selective sources, retention and expiry.

use serde::{Deserialize, Serialize};

/// Which prior artifacts a phase sees.
///
/// A non-empty `from` list switches the phase to selective mode. `inject`
/// alone keeps full accumulation and prepends the named artifacts. An empty
/// spec is a clean slate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextSpec {
    #[serde(default)]
    pub from: Vec<ContextSource>,
    #[serde(default)]
    pub inject: Vec<ContextSource>,
}

/// How a phase's context is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    Full,
    Selective,
    Inject,
}

impl ContextSpec {
    /// Selective spec reading the output of the named phases.
    pub fn from_phases(phases: &[&str]) -> Self {
        Self {
            from: phases.iter().map(|p| ContextSource::output_of(p)).collect(),
            inject: Vec::new(),
        }
    }

    /// Inject spec prepending the output of the named phases.
    pub fn inject_phases(phases: &[&str]) -> Self {
        Self {
            from: Vec::new(),
            inject: phases.iter().map(|p| ContextSource::output_of(p)).collect(),
        }
    }

    pub fn mode(&self) -> ContextMode {
        if self.from.is_empty() && !self.inject.is_empty() {
            ContextMode::Inject
        } else {
            ContextMode::Selective
        }
    }
}

/// Resolve the context mode of an optional spec.
pub fn mode_of(spec: Option<&ContextSpec>) -> ContextMode {
    spec.map(ContextSpec::mode).unwrap_or(ContextMode::Full)
}

/// Artifact category a source contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCategory {
    Output,
    Messages,
    Images,
    State,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagesFilter {
    #[default]
    All,
    Last,
    AssistantOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagesFilter {
    #[default]
    All,
    Last,
    LastN(usize),
}

/// One entry of a `from`/`inject` list.
///
/// Deserializes from a bare phase name (`"draft"`) or a full object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "SourceRepr")]
pub struct ContextSource {
    /// Phase name, or one of `previous`, `first`, `all`.
    pub phase: String,
    pub include: Vec<ArtifactCategory>,
    pub messages_filter: MessagesFilter,
    pub images_filter: ImagesFilter,
}

/// Resolved meaning of `ContextSource::phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSelector<'a> {
    Previous,
    First,
    All,
    Named(&'a str),
}

impl ContextSource {
    pub fn output_of(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            include: vec![ArtifactCategory::Output],
            messages_filter: MessagesFilter::All,
            images_filter: ImagesFilter::All,
        }
    }

    pub fn including(mut self, include: &[ArtifactCategory]) -> Self {
        self.include = include.to_vec();
        self
    }

    pub fn selector(&self) -> SourceSelector<'_> {
        match self.phase.as_str() {
            "previous" => SourceSelector::Previous,
            "first" => SourceSelector::First,
            "all" => SourceSelector::All,
            name => SourceSelector::Named(name),
        }
    }

    pub fn includes(&self, category: ArtifactCategory) -> bool {
        self.include.contains(&category)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceRepr {
    Name(String),
    Full {
        phase: String,
        #[serde(default = "default_include")]
        include: Vec<ArtifactCategory>,
        #[serde(default)]
        messages_filter: MessagesFilter,
        #[serde(default)]
        images_filter: ImagesFilter,
    },
}

fn default_include() -> Vec<ArtifactCategory> {
    vec![ArtifactCategory::Output]
}

impl From<SourceRepr> for ContextSource {
    fn from(repr: SourceRepr) -> Self {
        match repr {
            SourceRepr::Name(phase) => ContextSource::output_of(&phase),
            SourceRepr::Full {
                phase,
                include,
                messages_filter,
                images_filter,
            } => ContextSource {
                phase,
                include,
                messages_filter,
                images_filter,
            },
        }
    }
}

/// What a completed phase carries forward under full accumulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    #[default]
    Full,
    OutputOnly,
}

/// Turn counts an entry stays visible after the turn that produced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirySpec {
    #[serde(default)]
    pub images: Option<u64>,
    #[serde(default)]
    pub tool_results: Option<u64>,
    #[serde(default)]
    pub assistant: Option<u64>,
}

impl ExpirySpec {
    pub fn is_empty(&self) -> bool {
        self.images.is_none() && self.tool_results.is_none() && self.assistant.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_from_bare_name() {
        let spec: ContextSpec = serde_json::from_str(r#"{"from": ["draft", "previous"]}"#).unwrap();
        assert_eq!(spec.mode(), ContextMode::Selective);
        assert_eq!(spec.from[0], ContextSource::output_of("draft"));
        assert_eq!(spec.from[1].selector(), SourceSelector::Previous);
    }

    #[test]
    fn test_source_full_object() {
        let yaml = r#"
from:
  - phase: chart
    include: [images, messages]
    messages_filter: assistant_only
    images_filter:
      last_n: 2
"#;
        let spec: ContextSpec = serde_yaml::from_str(yaml).unwrap();
        let source = &spec.from[0];
        assert!(source.includes(ArtifactCategory::Images));
        assert!(!source.includes(ArtifactCategory::Output));
        assert_eq!(source.messages_filter, MessagesFilter::AssistantOnly);
        assert_eq!(source.images_filter, ImagesFilter::LastN(2));
    }

    #[test]
    fn test_modes() {
        assert_eq!(mode_of(None), ContextMode::Full);
        assert_eq!(mode_of(Some(&ContextSpec::default())), ContextMode::Selective);
        assert_eq!(
            mode_of(Some(&ContextSpec::inject_phases(&["first"]))),
            ContextMode::Inject
        );
    }

    #[test]
    fn test_retention_serde() {
        let r: Retention = serde_json::from_str(r#""output_only""#).unwrap();
        assert_eq!(r, Retention::OutputOnly);
    }
}
