use crate::coverage::ExpressionSpan;
use crate::error::{FaultError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Syntax tree of one source file, in the JSON shape a Babel-like parser
/// emits (`{"type": "...", ...fields, "loc": {...}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<ExpressionSpan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeKind {
    // Statements
    Program {
        body: Vec<Node>,
    },
    BlockStatement {
        body: Vec<Node>,
    },
    EmptyStatement,
    ExpressionStatement {
        expression: Box<Node>,
    },
    IfStatement {
        test: Box<Node>,
        consequent: Box<Node>,
        #[serde(default)]
        alternate: Option<Box<Node>>,
    },
    ReturnStatement {
        #[serde(default)]
        argument: Option<Box<Node>>,
    },
    VariableDeclaration {
        kind: String,
        declarations: Vec<Node>,
    },
    VariableDeclarator {
        id: Box<Node>,
        #[serde(default)]
        init: Option<Box<Node>>,
    },
    FunctionDeclaration {
        #[serde(default)]
        id: Option<Box<Node>>,
        params: Vec<Node>,
        body: Box<Node>,
    },
    ImportDeclaration {
        specifiers: Vec<Node>,
        source: Box<Node>,
    },

    // Expressions
    Identifier {
        name: String,
    },
    BooleanLiteral {
        value: bool,
    },
    NumericLiteral {
        value: f64,
    },
    StringLiteral {
        value: String,
    },
    NullLiteral,
    BinaryExpression {
        operator: String,
        left: Box<Node>,
        right: Box<Node>,
    },
    LogicalExpression {
        operator: String,
        left: Box<Node>,
        right: Box<Node>,
    },
    AssignmentExpression {
        operator: String,
        left: Box<Node>,
        right: Box<Node>,
    },
    CallExpression {
        callee: Box<Node>,
        arguments: Vec<Node>,
    },
    MemberExpression {
        object: Box<Node>,
        property: Box<Node>,
        #[serde(default)]
        computed: bool,
    },
    UnaryExpression {
        operator: String,
        argument: Box<Node>,
        #[serde(default = "default_prefix")]
        prefix: bool,
    },
}

fn default_prefix() -> bool {
    true
}

/// Edge from a node to one of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Step {
    Body(usize),
    FunctionBody,
    Expression,
    Test,
    Consequent,
    Alternate,
    Argument,
    Declaration(usize),
    Id,
    Init,
    Param(usize),
    Left,
    Right,
    Callee,
    CallArgument(usize),
    Object,
    Property,
    Specifier(usize),
    Source,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Body(i) => write!(f, "body[{}]", i),
            Step::FunctionBody => write!(f, "body"),
            Step::Expression => write!(f, "expression"),
            Step::Test => write!(f, "test"),
            Step::Consequent => write!(f, "consequent"),
            Step::Alternate => write!(f, "alternate"),
            Step::Argument => write!(f, "argument"),
            Step::Declaration(i) => write!(f, "declarations[{}]", i),
            Step::Id => write!(f, "id"),
            Step::Init => write!(f, "init"),
            Step::Param(i) => write!(f, "params[{}]", i),
            Step::Left => write!(f, "left"),
            Step::Right => write!(f, "right"),
            Step::Callee => write!(f, "callee"),
            Step::CallArgument(i) => write!(f, "arguments[{}]", i),
            Step::Object => write!(f, "object"),
            Step::Property => write!(f, "property"),
            Step::Specifier(i) => write!(f, "specifiers[{}]", i),
            Step::Source => write!(f, "source"),
        }
    }
}

/// Location of a node relative to the root of its file.
pub type NodePath = Vec<Step>;

pub fn path_to_string(path: &[Step]) -> String {
    if path.is_empty() {
        return "<root>".to_string();
    }
    path.iter()
        .map(|step| step.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// One node as seen during a walk.
pub struct Visit<'a> {
    pub path: &'a [Step],
    pub node: &'a Node,
    /// Root first; `ancestors[i]` sits at `path[..i]`.
    pub ancestors: &'a [&'a Node],
}

impl<'a> Visit<'a> {
    pub fn parent(&self) -> Option<(&'a Node, Step)> {
        match (self.ancestors.last(), self.path.last()) {
            (Some(parent), Some(step)) => Some((*parent, *step)),
            _ => None,
        }
    }

    pub fn has_ancestor(&self, predicate: impl Fn(&Node) -> bool) -> bool {
        self.ancestors.iter().any(|a| predicate(a))
    }
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self { kind, loc: None }
    }

    pub fn with_loc(kind: NodeKind, loc: Option<ExpressionSpan>) -> Self {
        Self { kind, loc }
    }

    pub fn identifier(name: &str) -> Self {
        Self::new(NodeKind::Identifier {
            name: name.to_string(),
        })
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Program { .. } => "Program",
            NodeKind::BlockStatement { .. } => "BlockStatement",
            NodeKind::EmptyStatement => "EmptyStatement",
            NodeKind::ExpressionStatement { .. } => "ExpressionStatement",
            NodeKind::IfStatement { .. } => "IfStatement",
            NodeKind::ReturnStatement { .. } => "ReturnStatement",
            NodeKind::VariableDeclaration { .. } => "VariableDeclaration",
            NodeKind::VariableDeclarator { .. } => "VariableDeclarator",
            NodeKind::FunctionDeclaration { .. } => "FunctionDeclaration",
            NodeKind::ImportDeclaration { .. } => "ImportDeclaration",
            NodeKind::Identifier { .. } => "Identifier",
            NodeKind::BooleanLiteral { .. } => "BooleanLiteral",
            NodeKind::NumericLiteral { .. } => "NumericLiteral",
            NodeKind::StringLiteral { .. } => "StringLiteral",
            NodeKind::NullLiteral => "NullLiteral",
            NodeKind::BinaryExpression { .. } => "BinaryExpression",
            NodeKind::LogicalExpression { .. } => "LogicalExpression",
            NodeKind::AssignmentExpression { .. } => "AssignmentExpression",
            NodeKind::CallExpression { .. } => "CallExpression",
            NodeKind::MemberExpression { .. } => "MemberExpression",
            NodeKind::UnaryExpression { .. } => "UnaryExpression",
        }
    }

    pub fn is_statement(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::BlockStatement { .. }
                | NodeKind::EmptyStatement
                | NodeKind::ExpressionStatement { .. }
                | NodeKind::IfStatement { .. }
                | NodeKind::ReturnStatement { .. }
                | NodeKind::VariableDeclaration { .. }
                | NodeKind::FunctionDeclaration { .. }
                | NodeKind::ImportDeclaration { .. }
        )
    }

    /// Nodes that open a new identifier scope.
    pub fn is_scope(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Program { .. }
                | NodeKind::BlockStatement { .. }
                | NodeKind::FunctionDeclaration { .. }
        )
    }

    pub fn children(&self) -> Vec<(Step, &Node)> {
        let mut children: Vec<(Step, &Node)> = Vec::new();
        match &self.kind {
            NodeKind::Program { body } | NodeKind::BlockStatement { body } => {
                children.extend(body.iter().enumerate().map(|(i, n)| (Step::Body(i), n)));
            }
            NodeKind::ExpressionStatement { expression } => {
                children.push((Step::Expression, expression));
            }
            NodeKind::IfStatement {
                test,
                consequent,
                alternate,
            } => {
                children.push((Step::Test, test));
                children.push((Step::Consequent, consequent));
                if let Some(alternate) = alternate {
                    children.push((Step::Alternate, alternate));
                }
            }
            NodeKind::ReturnStatement { argument } => {
                if let Some(argument) = argument {
                    children.push((Step::Argument, argument));
                }
            }
            NodeKind::VariableDeclaration { declarations, .. } => {
                children.extend(
                    declarations
                        .iter()
                        .enumerate()
                        .map(|(i, n)| (Step::Declaration(i), n)),
                );
            }
            NodeKind::VariableDeclarator { id, init } => {
                children.push((Step::Id, id));
                if let Some(init) = init {
                    children.push((Step::Init, init));
                }
            }
            NodeKind::FunctionDeclaration { id, params, body } => {
                if let Some(id) = id {
                    children.push((Step::Id, id));
                }
                children.extend(params.iter().enumerate().map(|(i, n)| (Step::Param(i), n)));
                children.push((Step::FunctionBody, body));
            }
            NodeKind::ImportDeclaration { specifiers, source } => {
                children.extend(
                    specifiers
                        .iter()
                        .enumerate()
                        .map(|(i, n)| (Step::Specifier(i), n)),
                );
                children.push((Step::Source, source));
            }
            NodeKind::BinaryExpression { left, right, .. }
            | NodeKind::LogicalExpression { left, right, .. }
            | NodeKind::AssignmentExpression { left, right, .. } => {
                children.push((Step::Left, left));
                children.push((Step::Right, right));
            }
            NodeKind::CallExpression { callee, arguments } => {
                children.push((Step::Callee, callee));
                children.extend(
                    arguments
                        .iter()
                        .enumerate()
                        .map(|(i, n)| (Step::CallArgument(i), n)),
                );
            }
            NodeKind::MemberExpression {
                object, property, ..
            } => {
                children.push((Step::Object, object));
                children.push((Step::Property, property));
            }
            NodeKind::UnaryExpression { argument, .. } => {
                children.push((Step::Argument, argument));
            }
            NodeKind::EmptyStatement
            | NodeKind::Identifier { .. }
            | NodeKind::BooleanLiteral { .. }
            | NodeKind::NumericLiteral { .. }
            | NodeKind::StringLiteral { .. }
            | NodeKind::NullLiteral => {}
        }
        children
    }

    pub fn child(&self, step: Step) -> Option<&Node> {
        self.children()
            .into_iter()
            .find(|(s, _)| *s == step)
            .map(|(_, node)| node)
    }

    pub fn child_mut(&mut self, step: Step) -> Option<&mut Node> {
        match (&mut self.kind, step) {
            (NodeKind::Program { body } | NodeKind::BlockStatement { body }, Step::Body(i)) => {
                body.get_mut(i)
            }
            (NodeKind::ExpressionStatement { expression }, Step::Expression) => {
                Some(expression.as_mut())
            }
            (NodeKind::IfStatement { test, .. }, Step::Test) => Some(test.as_mut()),
            (NodeKind::IfStatement { consequent, .. }, Step::Consequent) => {
                Some(consequent.as_mut())
            }
            (NodeKind::IfStatement { alternate, .. }, Step::Alternate) => alternate.as_deref_mut(),
            (NodeKind::ReturnStatement { argument }, Step::Argument) => argument.as_deref_mut(),
            (NodeKind::VariableDeclaration { declarations, .. }, Step::Declaration(i)) => {
                declarations.get_mut(i)
            }
            (NodeKind::VariableDeclarator { id, .. }, Step::Id) => Some(id.as_mut()),
            (NodeKind::VariableDeclarator { init, .. }, Step::Init) => init.as_deref_mut(),
            (NodeKind::FunctionDeclaration { id, .. }, Step::Id) => id.as_deref_mut(),
            (NodeKind::FunctionDeclaration { params, .. }, Step::Param(i)) => params.get_mut(i),
            (NodeKind::FunctionDeclaration { body, .. }, Step::FunctionBody) => Some(body.as_mut()),
            (NodeKind::ImportDeclaration { specifiers, .. }, Step::Specifier(i)) => {
                specifiers.get_mut(i)
            }
            (NodeKind::ImportDeclaration { source, .. }, Step::Source) => Some(source.as_mut()),
            (
                NodeKind::BinaryExpression { left, .. }
                | NodeKind::LogicalExpression { left, .. }
                | NodeKind::AssignmentExpression { left, .. },
                Step::Left,
            ) => Some(left.as_mut()),
            (
                NodeKind::BinaryExpression { right, .. }
                | NodeKind::LogicalExpression { right, .. }
                | NodeKind::AssignmentExpression { right, .. },
                Step::Right,
            ) => Some(right.as_mut()),
            (NodeKind::CallExpression { callee, .. }, Step::Callee) => Some(callee.as_mut()),
            (NodeKind::CallExpression { arguments, .. }, Step::CallArgument(i)) => {
                arguments.get_mut(i)
            }
            (NodeKind::MemberExpression { object, .. }, Step::Object) => Some(object.as_mut()),
            (NodeKind::MemberExpression { property, .. }, Step::Property) => {
                Some(property.as_mut())
            }
            (NodeKind::UnaryExpression { argument, .. }, Step::Argument) => {
                Some(argument.as_mut())
            }
            _ => None,
        }
    }

    pub fn get(&self, path: &[Step]) -> Option<&Node> {
        let mut node = self;
        for step in path {
            node = node.child(*step)?;
        }
        Some(node)
    }

    pub fn get_mut(&mut self, path: &[Step]) -> Option<&mut Node> {
        let mut node = self;
        for step in path {
            node = node.child_mut(*step)?;
        }
        Some(node)
    }

    /// Puts `replacement` at `path` and hands back the node that was there.
    pub fn replace(&mut self, path: &[Step], replacement: Node) -> Result<Node> {
        let target = self.get_mut(path).ok_or_else(|| {
            FaultError::Mutation(format!("no node at {}", path_to_string(path)))
        })?;
        Ok(std::mem::replace(target, replacement))
    }

    /// Pre-order traversal.
    pub fn walk(&self, visitor: &mut dyn FnMut(&Visit<'_>)) {
        let mut path = Vec::new();
        let mut ancestors = Vec::new();
        walk_inner(self, &mut path, &mut ancestors, visitor);
    }

    /// Paths of this node and every node below it, relative to `base`.
    pub fn subtree_paths(&self, base: &[Step]) -> Vec<NodePath> {
        let mut paths = Vec::new();
        self.walk(&mut |visit| {
            let mut path = base.to_vec();
            path.extend_from_slice(visit.path);
            paths.push(path);
        });
        paths
    }
}

fn walk_inner<'a>(
    node: &'a Node,
    path: &mut Vec<Step>,
    ancestors: &mut Vec<&'a Node>,
    visitor: &mut dyn FnMut(&Visit<'_>),
) {
    visitor(&Visit {
        path,
        node,
        ancestors,
    });
    ancestors.push(node);
    for (step, child) in node.children() {
        path.push(step);
        walk_inner(child, path, ancestors, visitor);
        path.pop();
    }
    ancestors.pop();
}

/// File path -> parsed syntax tree.
pub type AstMap = BTreeMap<String, Node>;

pub fn read_ast_file(path: &Path) -> Result<Node> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
