//! Depth-limited expansion of a frame's variables under a node and byte budget.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

use crate::debug::adapter::{DebugSession, Scope, Variable};
use crate::error::DapError;

pub const DEFAULT_MAX_NODES: usize = 20_000;
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Top-level variables fetched per scope.
const SCOPE_PAGE: i64 = 200;
/// Fixed per-node overhead added to the text lengths of a variable.
const NODE_OVERHEAD_BYTES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BudgetLimit {
    NodeLimit,
    ByteLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub nodes: usize,
    pub bytes: usize,
    pub max_nodes: usize,
    pub max_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exceeded: Option<BudgetLimit>,
}

/// Counts nodes and approximate bytes; the first refused node latches `exceeded`.
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    max_nodes: usize,
    max_bytes: usize,
    nodes: usize,
    bytes: usize,
    exceeded: Option<BudgetLimit>,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NODES, DEFAULT_MAX_BYTES)
    }
}

impl MemoryBudget {
    pub fn new(max_nodes: usize, max_bytes: usize) -> Self {
        Self {
            max_nodes,
            max_bytes,
            nodes: 0,
            bytes: 0,
            exceeded: None,
        }
    }

    pub fn add_node(&mut self, bytes: usize) -> Result<(), BudgetLimit> {
        let refused = if self.nodes >= self.max_nodes {
            Some(BudgetLimit::NodeLimit)
        } else if self.bytes.saturating_add(bytes) > self.max_bytes {
            Some(BudgetLimit::ByteLimit)
        } else {
            None
        };
        if let Some(limit) = refused {
            self.exceeded.get_or_insert(limit);
            return Err(limit);
        }
        self.nodes += 1;
        self.bytes += bytes;
        Ok(())
    }

    pub fn exceeded(&self) -> Option<BudgetLimit> {
        self.exceeded
    }

    pub fn status(&self) -> BudgetStatus {
        BudgetStatus {
            nodes: self.nodes,
            bytes: self.bytes,
            max_nodes: self.max_nodes,
            max_bytes: self.max_bytes,
            exceeded: self.exceeded,
        }
    }
}

pub fn estimate_size(variable: &Variable) -> usize {
    NODE_OVERHEAD_BYTES
        + variable.name.len()
        + variable.value.len()
        + variable.type_name.as_deref().map_or(0, str::len)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeFilter {
    Local,
    Closure,
    Global,
    All,
}

impl ScopeFilter {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "local" => Some(ScopeFilter::Local),
            "closure" => Some(ScopeFilter::Closure),
            "global" => Some(ScopeFilter::Global),
            "all" => Some(ScopeFilter::All),
            _ => None,
        }
    }

    pub fn matches(&self, scope: &Scope) -> bool {
        let name = scope.name.to_lowercase();
        let hint = scope.presentation_hint.as_deref().unwrap_or_default();
        match self {
            ScopeFilter::All => true,
            ScopeFilter::Local => name.contains("local") || hint == "locals",
            ScopeFilter::Closure => name.contains("closure"),
            ScopeFilter::Global => name.contains("global") || hint == "globals",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Truncation {
    MaxDepth,
    Budget,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableNode {
    #[serde(flatten)]
    pub variable: Variable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<VariableNode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_children: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub children_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<Truncation>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cycle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VariableNode {
    fn leaf(variable: Variable) -> Self {
        Self {
            variable,
            children: None,
            total_children: None,
            children_truncated: false,
            truncated: None,
            cycle: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeNode {
    pub name: String,
    pub variables_reference: i64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub expensive: bool,
    pub variables: Vec<VariableNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExpandOptions {
    pub max_depth: usize,
    pub max_children: i64,
    pub include_expensive: bool,
    pub filter: ScopeFilter,
}

/// Walks scopes depth first. Stops fetching as soon as the budget refuses a
/// node; what was gathered so far is still returned.
pub struct VariableWalker<'a> {
    session: &'a dyn DebugSession,
    options: ExpandOptions,
    budget: MemoryBudget,
    visited: HashSet<i64>,
}

type NodeFuture<'f> = Pin<Box<dyn Future<Output = VariableNode> + Send + 'f>>;

impl<'a> VariableWalker<'a> {
    pub fn new(session: &'a dyn DebugSession, options: ExpandOptions, budget: MemoryBudget) -> Self {
        Self {
            session,
            options,
            budget,
            visited: HashSet::new(),
        }
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub async fn list_frame(&mut self, frame_id: i64) -> Result<Vec<ScopeNode>, DapError> {
        let scopes = self.session.scopes(frame_id).await?;
        let mut listed = Vec::new();
        for scope in scopes {
            if scope.variables_reference <= 0 || !self.options.filter.matches(&scope) {
                continue;
            }
            if scope.expensive && !self.options.include_expensive {
                continue;
            }
            listed.push(self.list_scope(scope).await);
        }
        Ok(listed)
    }

    async fn list_scope(&mut self, scope: Scope) -> ScopeNode {
        let mut node = ScopeNode {
            name: scope.name,
            variables_reference: scope.variables_reference,
            expensive: scope.expensive,
            variables: Vec::new(),
            error: None,
        };
        if self.budget.exceeded().is_some() {
            return node;
        }
        let variables = match self
            .session
            .variables(scope.variables_reference, 0, SCOPE_PAGE, None)
            .await
        {
            Ok(variables) => variables,
            Err(e) => {
                node.error = Some(e.to_string());
                return node;
            }
        };
        for variable in variables {
            if self.budget.add_node(estimate_size(&variable)).is_err() {
                break;
            }
            let expanded = self.expand(variable, 1).await;
            node.variables.push(expanded);
        }
        node
    }

    fn expand(&mut self, variable: Variable, depth: usize) -> NodeFuture<'_> {
        Box::pin(async move {
            let reference = variable.variables_reference;
            if reference <= 0 {
                return VariableNode::leaf(variable);
            }
            if self.budget.exceeded().is_some() {
                let mut node = VariableNode::leaf(variable);
                node.truncated = Some(Truncation::Budget);
                return node;
            }
            if depth >= self.options.max_depth {
                let mut node = VariableNode::leaf(variable);
                node.truncated = Some(Truncation::MaxDepth);
                return node;
            }
            if !self.visited.insert(reference) {
                let mut node = VariableNode::leaf(variable);
                node.cycle = true;
                return node;
            }

            let fetched = self
                .session
                .variables(reference, 0, self.options.max_children.saturating_add(1), None)
                .await;
            let mut node = VariableNode::leaf(variable);
            let mut children = match fetched {
                Ok(children) => children,
                Err(e) => {
                    node.error = Some(e.to_string());
                    return node;
                }
            };
            let fetched_count = children.len() as i64;
            node.children_truncated = fetched_count > self.options.max_children;
            children.truncate(usize::try_from(self.options.max_children).unwrap_or(usize::MAX));
            node.total_children = Some(
                node.variable
                    .named_variables
                    .or(node.variable.indexed_variables)
                    .unwrap_or(fetched_count),
            );

            let mut expanded = Vec::with_capacity(children.len());
            for child in children {
                if self.budget.add_node(estimate_size(&child)).is_err() {
                    node.truncated = Some(Truncation::Budget);
                    break;
                }
                expanded.push(self.expand(child, depth + 1).await);
            }
            node.children = Some(expanded);
            node
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::testing::MockSession;
    use serde_json::{json, Value};

    fn var(name: &str, reference: i64) -> Value {
        json!({"name": name, "value": format!("<{name}>"), "variablesReference": reference})
    }

    /// Reference 1 is the Locals scope; 10 holds a child that points back at 10.
    fn tree_session() -> MockSession {
        MockSession::new("s1", "node")
            .on("scopes", |_| {
                Ok(json!({"scopes": [
                    {"name": "Locals", "variablesReference": 1, "presentationHint": "locals"},
                    {"name": "Global", "variablesReference": 2, "expensive": true},
                ]}))
            })
            .on("variables", |args| {
                let children = match args["variablesReference"].as_i64() {
                    Some(1) => vec![var("obj", 10), var("n", 0)],
                    Some(2) => vec![var("process", 0)],
                    Some(10) => vec![var("self", 10), var("inner", 11)],
                    Some(11) => vec![var("deep", 12)],
                    Some(12) => vec![var("leaf", 0)],
                    other => return Err(DapError::request("variables", format!("bad reference {other:?}"))),
                };
                Ok(json!({ "variables": children }))
            })
    }

    fn options(max_depth: usize) -> ExpandOptions {
        ExpandOptions {
            max_depth,
            max_children: 50,
            include_expensive: false,
            filter: ScopeFilter::All,
        }
    }

    #[test]
    fn test_budget_refuses_past_limits() {
        let mut budget = MemoryBudget::new(2, 1_000);
        assert!(budget.add_node(400).is_ok());
        assert_eq!(budget.add_node(700), Err(BudgetLimit::ByteLimit));
        assert!(budget.add_node(500).is_ok());
        assert_eq!(budget.add_node(1), Err(BudgetLimit::NodeLimit));

        let status = budget.status();
        assert_eq!((status.nodes, status.bytes), (2, 900));
        assert_eq!(status.exceeded, Some(BudgetLimit::ByteLimit));
    }

    #[tokio::test]
    async fn test_walk_marks_cycles_and_depth() {
        let session = tree_session();
        let mut walker = VariableWalker::new(&session, options(3), MemoryBudget::default());
        let scopes = walker.list_frame(7).await.expect("listing");

        assert_eq!(scopes.len(), 1, "expensive scope should be skipped");
        let obj = &scopes[0].variables[0];
        let children = obj.children.as_ref().expect("obj children");
        assert!(children[0].cycle, "self reference not flagged: {children:?}");
        let inner = children[1].children.as_ref().expect("inner children");
        assert_eq!(inner[0].variable.name, "deep");
        assert_eq!(inner[0].truncated, Some(Truncation::MaxDepth));
        assert!(walker.budget().exceeded().is_none());
    }

    #[tokio::test]
    async fn test_depth_zero_lists_top_level_only() {
        let session = tree_session();
        let mut walker = VariableWalker::new(&session, options(0), MemoryBudget::default());
        let scopes = walker.list_frame(7).await.expect("listing");
        let obj = &scopes[0].variables[0];
        assert!(obj.children.is_none());
        assert_eq!(obj.truncated, Some(Truncation::MaxDepth));
        assert_eq!(session.count("variables"), 1);
    }

    #[tokio::test]
    async fn test_budget_stops_walk_with_partial_tree() {
        let session = tree_session();
        let mut walker = VariableWalker::new(&session, options(5), MemoryBudget::new(3, DEFAULT_MAX_BYTES));
        let scopes = walker.list_frame(7).await.expect("listing");

        assert_eq!(walker.budget().exceeded(), Some(BudgetLimit::NodeLimit));
        let obj = &scopes[0].variables[0];
        let children = obj.children.as_ref().expect("obj children");
        assert_eq!(children[1].variable.name, "inner");
        assert_eq!(children[1].truncated, Some(Truncation::Budget));
        assert_eq!(scopes[0].variables.len(), 1, "walk should stop after the refused node");
    }

    #[tokio::test]
    async fn test_scope_filter_and_expensive_opt_in() {
        let session = tree_session();
        let mut opts = options(1);
        opts.filter = ScopeFilter::Global;
        opts.include_expensive = true;
        let mut walker = VariableWalker::new(&session, opts, MemoryBudget::default());
        let scopes = walker.list_frame(7).await.expect("listing");
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].name, "Global");
        assert_eq!(scopes[0].variables[0].variable.name, "process");
    }
}
