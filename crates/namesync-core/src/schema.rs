//! Name patterns and the schema tree.
//!
//! A [`Pattern`] is a name template whose steps are either fixed components
//! or typed variables written `<type=tag:kind>`, for example
//! `/app/<8=node:string>/<58=seq:number>`. Matching a concrete name binds
//! every variable into a [`Mapping`]; [`Pattern::make`] goes the other way.
//!
//! A [`SchemaTree`] indexes many patterns by shared prefix and attaches a
//! resource to any node. Nodes live in one arena and refer to their parent
//! and children by [`NodeId`], so walking back up to rebuild a node's name
//! needs no shared ownership.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};
use crate::name::{encode_number, Component, Name};

/// How a variable's component value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bytes,
    Number,
    Text,
}

impl ValueKind {
    fn as_str(self) -> &'static str {
        match self {
            ValueKind::Bytes => "bytes",
            ValueKind::Number => "number",
            ValueKind::Text => "string",
        }
    }
}

/// A value bound to a pattern variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchValue {
    Bytes(Bytes),
    Number(u64),
    Text(String),
}

impl From<u64> for MatchValue {
    fn from(n: u64) -> Self {
        MatchValue::Number(n)
    }
}

impl From<&str> for MatchValue {
    fn from(text: &str) -> Self {
        MatchValue::Text(text.to_string())
    }
}

/// Variable bindings produced by a match.
pub type Mapping = BTreeMap<String, MatchValue>;

/// A typed variable step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub typ: u16,
    pub tag: String,
    pub kind: ValueKind,
}

impl Variable {
    pub fn new(typ: u16, tag: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            typ,
            tag: tag.into(),
            kind,
        }
    }

    /// Bind `component` into `mapping`. False on a type mismatch or a value
    /// that does not decode as this variable's kind.
    fn bind(&self, component: &Component, mapping: &mut Mapping) -> bool {
        if component.typ() != self.typ {
            return false;
        }
        let value = match self.kind {
            ValueKind::Bytes => MatchValue::Bytes(Bytes::copy_from_slice(component.value())),
            ValueKind::Number => match component.as_number() {
                Some(n) => MatchValue::Number(n),
                None => return false,
            },
            ValueKind::Text => match component.as_text() {
                Some(text) => MatchValue::Text(text.to_string()),
                None => return false,
            },
        };
        mapping.insert(self.tag.clone(), value);
        true
    }

    /// Build the component for this variable from `mapping`. The bound
    /// value's own type decides the encoding.
    fn make(&self, mapping: &Mapping) -> Result<Component> {
        let value = match mapping.get(&self.tag) {
            Some(MatchValue::Bytes(bytes)) => bytes.clone(),
            Some(MatchValue::Number(n)) => encode_number(*n),
            Some(MatchValue::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
            None => return Err(CoreError::UnboundVariable(self.tag.clone())),
        };
        Ok(Component::new(self.typ, value))
    }

    fn same_edge(&self, other: &Variable) -> bool {
        self.tag == other.tag && self.kind == other.kind
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}={}:{}>", self.typ, self.tag, self.kind.as_str())
    }
}

/// One step of a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Fixed(Component),
    Var(Variable),
}

impl Step {
    fn matches(&self, component: &Component, mapping: &mut Mapping) -> bool {
        match self {
            Step::Fixed(fixed) => fixed == component,
            Step::Var(var) => var.bind(component, mapping),
        }
    }

    fn make(&self, mapping: &Mapping) -> Result<Component> {
        match self {
            Step::Fixed(fixed) => Ok(fixed.clone()),
            Step::Var(var) => var.make(mapping),
        }
    }

    fn parse(text: &str) -> Result<Self> {
        let Some(body) = text.strip_prefix('<') else {
            return Component::parse(text).map(Step::Fixed);
        };
        let bad = || CoreError::InvalidPattern(format!("bad variable {text:?}"));
        let body = body.strip_suffix('>').ok_or_else(bad)?;
        let (typ, rest) = body.split_once('=').ok_or_else(bad)?;
        let (tag, kind) = rest.split_once(':').ok_or_else(bad)?;
        let typ = typ.parse::<u16>().map_err(|_| bad())?;
        if tag.is_empty()
            || !tag
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'$' | b'_' | b'-'))
        {
            return Err(bad());
        }
        let kind = match kind {
            "bytes" => ValueKind::Bytes,
            "number" => ValueKind::Number,
            "string" => ValueKind::Text,
            _ => return Err(bad()),
        };
        Ok(Step::Var(Variable::new(typ, tag, kind)))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Fixed(component) => write!(f, "{component}"),
            Step::Var(var) => write!(f, "{var}"),
        }
    }
}

/// A name template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pattern(Vec<Step>);

impl Pattern {
    pub fn new(steps: Vec<Step>) -> Self {
        Self(steps)
    }

    pub fn parse(text: &str) -> Result<Self> {
        text.parse()
    }

    pub fn steps(&self) -> &[Step] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bindings if `name` has exactly this shape.
    pub fn matches(&self, name: &Name) -> Option<Mapping> {
        let components = strip_digests(name.components());
        if components.len() != self.0.len() {
            return None;
        }
        let mut mapping = Mapping::new();
        let matched = self
            .0
            .iter()
            .zip(components)
            .all(|(step, component)| step.matches(component, &mut mapping));
        matched.then_some(mapping)
    }

    /// Fill every variable from `mapping`.
    pub fn make(&self, mapping: &Mapping) -> Result<Name> {
        self.0
            .iter()
            .map(|step| step.make(mapping))
            .collect::<Result<Vec<_>>>()
            .map(Name::from_components)
    }
}

impl FromStr for Pattern {
    type Err = CoreError;

    fn from_str(text: &str) -> Result<Self> {
        let trimmed = text.strip_prefix('/').unwrap_or(text);
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        trimmed.split('/').map(Step::parse).collect::<Result<Vec<_>>>().map(Self)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for step in &self.0 {
            write!(f, "/{step}")?;
        }
        Ok(())
    }
}

/// Implicit digest components (types 1 and 2) never take part in a match.
fn strip_digests(mut components: &[Component]) -> &[Component] {
    while let Some((last, rest)) = components.split_last() {
        if last.typ() > 2 {
            break;
        }
        components = rest;
    }
    components
}

/// Index of a node in a [`SchemaTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

struct Node<R> {
    parent: Option<NodeId>,
    /// Step leading here from the parent. `None` only at the root.
    edge: Option<Step>,
    fixed: Vec<(Component, NodeId)>,
    /// At most one variable child per component type.
    variables: BTreeMap<u16, NodeId>,
    resource: Option<R>,
}

impl<R> Node<R> {
    fn new(parent: Option<NodeId>, edge: Option<Step>) -> Self {
        Self {
            parent,
            edge,
            fixed: Vec::new(),
            variables: BTreeMap::new(),
            resource: None,
        }
    }
}

/// Result of matching a name or applying a mapping.
#[derive(Debug)]
pub struct Matched<'a, R> {
    pub node: NodeId,
    pub name: Name,
    pub mapping: Mapping,
    pub resource: Option<&'a R>,
}

/// Prefix tree of patterns with a resource per node.
pub struct SchemaTree<R> {
    nodes: Vec<Node<R>>,
}

impl<R> Default for SchemaTree<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> SchemaTree<R> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(None, None)],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn resource(&self, node: NodeId) -> Option<&R> {
        self.nodes.get(node.0).and_then(|n| n.resource.as_ref())
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0).and_then(|n| n.parent)
    }

    /// Create every node along `path`, then attach `resource` to the last
    /// one when given. Fails if a variable step clashes with an existing
    /// variable edge of the same component type.
    pub fn touch(&mut self, path: &Pattern, resource: Option<R>) -> Result<NodeId> {
        let mut cur = self.root();
        for step in path.steps() {
            cur = match self.child(cur, step)? {
                Some(next) => next,
                None => self.add_child(cur, step),
            };
        }
        if let Some(resource) = resource {
            self.nodes[cur.0].resource = Some(resource);
        }
        Ok(cur)
    }

    /// The node at exactly `path`, if it exists.
    pub fn get(&self, path: &Pattern) -> Option<NodeId> {
        let mut cur = self.root();
        for step in path.steps() {
            cur = self.child(cur, step).ok().flatten()?;
        }
        Some(cur)
    }

    /// Walk `name` from the root, preferring fixed edges over variables.
    pub fn match_name(&self, name: &Name) -> Option<Matched<'_, R>> {
        let components = strip_digests(name.components());
        let mut cur = self.root();
        let mut mapping = Mapping::new();
        for component in components {
            let node = &self.nodes[cur.0];
            if let Some((_, next)) = node.fixed.iter().find(|(edge, _)| edge == component) {
                cur = *next;
                continue;
            }
            let next = *node.variables.get(&component.typ())?;
            match &self.nodes[next.0].edge {
                Some(step) if step.matches(component, &mut mapping) => cur = next,
                _ => return None,
            }
        }
        Some(Matched {
            node: cur,
            name: Name::from_components(components.to_vec()),
            mapping,
            resource: self.resource(cur),
        })
    }

    /// Rebuild the name of `node` from `mapping`.
    pub fn apply(&self, node: NodeId, mapping: Mapping) -> Result<Matched<'_, R>> {
        let mut components = Vec::new();
        let mut cur = Some(node);
        while let Some(id) = cur {
            let entry = self
                .nodes
                .get(id.0)
                .ok_or_else(|| CoreError::InvalidPattern(format!("no schema node {}", id.0)))?;
            if let Some(step) = &entry.edge {
                components.push(step.make(&mapping)?);
            }
            cur = entry.parent;
        }
        components.reverse();
        Ok(Matched {
            node,
            name: Name::from_components(components),
            mapping,
            resource: self.resource(node),
        })
    }

    /// The pattern leading from the root to `node`.
    pub fn path(&self, node: NodeId) -> Pattern {
        let mut steps = Vec::new();
        let mut cur = self.nodes.get(node.0);
        while let Some(entry) = cur {
            if let Some(step) = &entry.edge {
                steps.push(step.clone());
            }
            cur = entry.parent.and_then(|p| self.nodes.get(p.0));
        }
        steps.reverse();
        Pattern(steps)
    }

    /// Visit every node holding a resource, parents before children.
    pub fn traverse(&self, mut visit: impl FnMut(NodeId, &Pattern, &R)) {
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            if let Some(resource) = &node.resource {
                visit(id, &self.path(id), resource);
            }
            let children = node
                .fixed
                .iter()
                .map(|(_, child)| *child)
                .chain(node.variables.values().copied());
            let mark = stack.len();
            stack.extend(children);
            stack[mark..].reverse();
        }
    }

    fn child(&self, parent: NodeId, step: &Step) -> Result<Option<NodeId>> {
        let node = &self.nodes[parent.0];
        match step {
            Step::Fixed(component) => Ok(node
                .fixed
                .iter()
                .find(|(edge, _)| edge == component)
                .map(|(_, child)| *child)),
            Step::Var(var) => {
                let Some(&child) = node.variables.get(&var.typ) else {
                    return Ok(None);
                };
                match &self.nodes[child.0].edge {
                    Some(Step::Var(existing)) if existing.same_edge(var) => Ok(Some(child)),
                    existing => Err(CoreError::SchemaConflict {
                        existing: existing.as_ref().map(ToString::to_string).unwrap_or_default(),
                        requested: var.to_string(),
                    }),
                }
            }
        }
    }

    fn add_child(&mut self, parent: NodeId, step: &Step) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(Some(parent), Some(step.clone())));
        let node = &mut self.nodes[parent.0];
        match step {
            Step::Fixed(component) => node.fixed.push((component.clone(), id)),
            Step::Var(var) => {
                node.variables.insert(var.typ, id);
            }
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> Name {
        Name::parse(s).unwrap()
    }

    fn p(s: &str) -> Pattern {
        Pattern::parse(s).unwrap()
    }

    fn mapping(entries: &[(&str, MatchValue)]) -> Mapping {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_pattern_parse_and_match() {
        let pat = p("/8=base/<8=peerId:string>/<58=sequence:number>");
        assert_eq!(pat.len(), 3);
        assert_eq!(pat.steps()[0], Step::Fixed(Component::generic("base")));
        assert_eq!(pat.steps()[1], Step::Var(Variable::new(8, "peerId", ValueKind::Text)));
        assert_eq!(pat.to_string(), "/base/<8=peerId:string>/<58=sequence:number>");

        let bound = pat.matches(&n("/base/peer-01/seq=13")).unwrap();
        assert_eq!(
            bound,
            mapping(&[("peerId", "peer-01".into()), ("sequence", 13u64.into())])
        );

        assert!(pat.matches(&n("/base/peer-01")).is_none());
        assert!(pat.matches(&n("/other/peer-01/seq=13")).is_none());
        assert!(pat.matches(&n("/base/32=peer/seq=13")).is_none());
    }

    #[test]
    fn test_pattern_make() {
        let pat = p("/8=base/<8=peerId:string>/<58=sequence:number>");
        let bound = mapping(&[("peerId", "peer-01".into()), ("sequence", 13u64.into())]);
        assert_eq!(pat.make(&bound).unwrap(), n("/base/peer-01/seq=13"));

        let partial = mapping(&[("peerId", "peer-01".into())]);
        assert!(matches!(pat.make(&partial), Err(CoreError::UnboundVariable(tag)) if tag == "sequence"));
    }

    #[test]
    fn test_pattern_rejects_malformed_variables() {
        for bad in ["/<58=seq:float>", "/<58=seq>", "/<x=seq:number>", "/<58=:number>", "/<58=a b:bytes>"] {
            assert!(matches!(Pattern::parse(bad), Err(CoreError::InvalidPattern(_))), "{bad}");
        }
        assert!(Pattern::parse("/").unwrap().is_empty());
    }

    #[test]
    fn test_trailing_digest_components_are_ignored() {
        let pat = p("/app/<58=seq:number>");
        let name = n("/app/seq=4").append(Component::new(1, vec![0u8; 32]));
        assert_eq!(pat.matches(&name).unwrap(), mapping(&[("seq", 4u64.into())]));
    }

    #[test]
    fn test_tree_match_and_apply() {
        let mut tree = SchemaTree::new();
        let node = tree.touch(&p("/prefix/<58=sequence:number>"), Some("node")).unwrap();

        let matched = tree.match_name(&n("/prefix/seq=13")).unwrap();
        assert_eq!(matched.node, node);
        assert_eq!(matched.resource, Some(&"node"));
        assert_eq!(matched.mapping, mapping(&[("sequence", 13u64.into())]));

        let applied = tree.apply(node, mapping(&[("sequence", 14u64.into())])).unwrap();
        assert_eq!(applied.name, n("/prefix/seq=14"));
        assert_eq!(applied.resource, Some(&"node"));
        assert!(tree.apply(node, Mapping::new()).is_err());
    }

    #[test]
    fn test_fixed_edges_win_over_variables() {
        let mut tree = SchemaTree::new();
        tree.touch(&p("/prefix/<32=key:string>/<58=sequence:number>"), Some("node-key"))
            .unwrap();
        tree.touch(&p("/prefix/8=fixed/<58=sequence:number>"), Some("node-fixed"))
            .unwrap();
        tree.touch(&p("/prefix/<8=nodeId:string>/<58=sequence:number>"), Some("node-id"))
            .unwrap();

        let fixed = tree.match_name(&n("/prefix/fixed/seq=13")).unwrap();
        assert_eq!(fixed.resource, Some(&"node-fixed"));
        assert_eq!(fixed.mapping, mapping(&[("sequence", 13u64.into())]));

        let keyed = tree.match_name(&n("/prefix/32=KEY/seq=14")).unwrap();
        assert_eq!(keyed.resource, Some(&"node-key"));
        assert_eq!(
            keyed.mapping,
            mapping(&[("key", "KEY".into()), ("sequence", 14u64.into())])
        );

        let named = tree.match_name(&n("/prefix/name/seq=15")).unwrap();
        assert_eq!(named.resource, Some(&"node-id"));
        assert_eq!(
            named.mapping,
            mapping(&[("nodeId", "name".into()), ("sequence", 15u64.into())])
        );

        assert!(tree.match_name(&n("/prefix/name/v=15")).is_none());
        assert!(tree.match_name(&n("/elsewhere")).is_none());
    }

    #[test]
    fn test_conflicting_variable_edge() {
        let mut tree: SchemaTree<&str> = SchemaTree::new();
        tree.touch(&p("/prefix/<8=nodeId:string>"), None).unwrap();
        assert!(tree.touch(&p("/prefix/<8=nodeId:string>/x"), None).is_ok());
        assert!(matches!(
            tree.touch(&p("/prefix/<8=other:string>"), None),
            Err(CoreError::SchemaConflict { .. })
        ));
        assert!(tree.get(&p("/prefix/<8=other:string>")).is_none());
    }

    #[test]
    fn test_get_touch_and_paths() {
        let mut tree = SchemaTree::new();
        let leaf = tree.touch(&p("/a/<8=x:bytes>/c"), None).unwrap();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.get(&p("/a/<8=x:bytes>/c")), Some(leaf));
        assert_eq!(tree.touch(&p("/a/<8=x:bytes>/c"), Some(7)).unwrap(), leaf);
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.resource(leaf), Some(&7));
        assert_eq!(tree.path(leaf).to_string(), "/a/<8=x:bytes>/c");
        assert_eq!(tree.parent(tree.root()), None);
    }

    #[test]
    fn test_traverse_visits_parents_first() {
        let mut tree = SchemaTree::new();
        tree.touch(&p("/app/<8=node:string>/<58=seq:number>"), Some("item")).unwrap();
        tree.touch(&p("/app"), Some("app")).unwrap();
        tree.touch(&p("/app/blob"), Some("blob")).unwrap();

        let mut seen = Vec::new();
        tree.traverse(|_, path, resource| seen.push((path.to_string(), *resource)));
        assert_eq!(
            seen,
            vec![
                ("/app".to_string(), "app"),
                ("/app/blob".to_string(), "blob"),
                ("/app/<8=node:string>/<58=seq:number>".to_string(), "item"),
            ]
        );
    }
}
