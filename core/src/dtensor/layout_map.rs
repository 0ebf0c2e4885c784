//! Name-pattern rules that assign layouts to parameters.
//!
//! Rules are evaluated in insertion order against fully qualified parameter names
//! (`bert_classifier/encoder/transformer/layer_0/intermediate/kernel`):
//!
//! 1. a rule whose pattern equals the name exactly wins outright;
//! 2. otherwise the first rule whose regex matches at the start of the name wins;
//! 3. otherwise the [`UnmatchedPolicy`] applies.
//!
//! Later rules never override earlier ones.

use super::layout::Layout;
use crate::error::{MeshError, Result};
use crate::mesh::Mesh;
use regex::Regex;

/// What to do with a parameter no rule matches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnmatchedPolicy {
    /// Fully replicate it.
    #[default]
    Replicate,
    /// Fail construction.
    Reject,
}

#[derive(Clone, Debug)]
struct Rule {
    pattern: String,
    regex: Regex,
    layout: Layout,
}

/// Ordered `pattern -> layout` rules, all on one mesh.
#[derive(Clone, Debug)]
pub struct LayoutMap {
    mesh: Mesh,
    rules: Vec<Rule>,
    policy: UnmatchedPolicy,
}

impl LayoutMap {
    pub fn new(mesh: &Mesh) -> Self {
        Self {
            mesh: mesh.clone(),
            rules: Vec::new(),
            policy: UnmatchedPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: UnmatchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Appends a rule. The pattern is a regular expression matched at the start of the name.
    pub fn insert(&mut self, pattern: &str, layout: Layout) -> Result<()> {
        if layout.mesh().description() != self.mesh.description() {
            return Err(MeshError::Layout(format!(
                "rule `{pattern}` uses {layout}, which is not on mesh {}",
                self.mesh
            )));
        }
        if self.rules.iter().any(|r| r.pattern == pattern) {
            return Err(MeshError::Layout(format!(
                "rule `{pattern}` is defined twice"
            )));
        }
        let regex = Regex::new(&format!("^(?:{pattern})"))?;
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            regex,
            layout,
        });
        Ok(())
    }

    /// Builder form of [`LayoutMap::insert`] taking spec strings.
    pub fn rule<S: AsRef<str>>(mut self, pattern: &str, specs: &[S]) -> Result<Self> {
        let layout = Layout::new(specs, &self.mesh)?;
        self.insert(pattern, layout)?;
        Ok(self)
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn policy(&self) -> UnmatchedPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.pattern.as_str())
    }

    /// The layout of the rule that governs `name`, if any.
    pub fn get(&self, name: &str) -> Option<&Layout> {
        self.rules
            .iter()
            .find(|r| r.pattern == name)
            .or_else(|| self.rules.iter().find(|r| r.regex.is_match(name)))
            .map(|r| &r.layout)
    }

    /// The layout a parameter named `name` of rank `rank` receives.
    pub fn resolve(&self, name: &str, rank: usize) -> Result<Layout> {
        let layout = match (self.get(name), self.policy) {
            (Some(layout), _) => layout.clone(),
            (None, UnmatchedPolicy::Replicate) => Layout::replicated(&self.mesh, rank),
            (None, UnmatchedPolicy::Reject) => {
                return Err(MeshError::Layout(format!(
                    "parameter `{name}` matches no layout rule"
                )));
            }
        };
        if layout.rank() != rank {
            return Err(MeshError::Layout(format!(
                "parameter `{name}` has rank {rank} but its rule assigns {layout}"
            )));
        }
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtensor::UNSHARDED;
    use crate::mesh::{DeviceType, MeshDescription, MeshDim};

    fn mesh() -> Mesh {
        let description = MeshDescription::new(
            vec![MeshDim::new("batch", 4), MeshDim::new("model", 2)],
            DeviceType::Cpu,
            8,
        );
        Mesh::new(description, 0, 1).unwrap()
    }

    #[test]
    fn test_first_match_wins() {
        let mesh = mesh();
        let map = LayoutMap::new(&mesh)
            .rule(".*kernel", &[UNSHARDED, "model"])
            .unwrap()
            .rule(".*intermediate/kernel", &["model", UNSHARDED])
            .unwrap();
        let layout = map.resolve("encoder/intermediate/kernel", 2).unwrap();
        assert_eq!(layout.sharding_specs(), vec![UNSHARDED, "model"]);
    }

    #[test]
    fn test_exact_name_beats_earlier_pattern() {
        let mesh = mesh();
        let map = LayoutMap::new(&mesh)
            .rule(".*kernel", &[UNSHARDED, "model"])
            .unwrap()
            .rule("classifier/kernel", &[UNSHARDED, UNSHARDED])
            .unwrap();
        assert!(map.resolve("classifier/kernel", 2).unwrap().is_fully_replicated());
    }

    #[test]
    fn test_match_is_anchored_at_start() {
        let mesh = mesh();
        let map = LayoutMap::new(&mesh).rule("pooler", &["model"]).unwrap();
        assert!(map.get("pooler_transform/bias").is_some());
        assert!(map.get("encoder/pooler_transform/bias").is_none());
    }

    #[test]
    fn test_unmatched_policy() {
        let mesh = mesh();
        let map = LayoutMap::new(&mesh);
        assert!(map.resolve("anything", 3).unwrap().is_fully_replicated());

        let strict = LayoutMap::new(&mesh).with_policy(UnmatchedPolicy::Reject);
        assert!(matches!(
            strict.resolve("anything", 3),
            Err(MeshError::Layout(_))
        ));
    }

    #[test]
    fn test_rank_mismatch_and_bad_rules() {
        let mesh = mesh();
        let map = LayoutMap::new(&mesh).rule(".*bias", &["model"]).unwrap();
        assert!(map.resolve("dense/bias", 2).is_err());

        assert!(matches!(
            LayoutMap::new(&mesh).rule("(unclosed", &["model"]),
            Err(MeshError::Regex(_))
        ));
        assert!(
            map.clone()
                .rule(".*bias", &[UNSHARDED])
                .is_err()
        );
    }
}
