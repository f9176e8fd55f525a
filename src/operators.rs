use crate::ast::{AstMap, Node, NodeKind, NodePath, Step, Visit};
use crate::mutation::{Edit, Instruction, Mutation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Mutation kinds, most promising first. Trials run in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstructionKind {
    NullifyRightOperator,
    NullifyLeftOperator,
    DeleteStatement,
    ForceConsequent,
    ChangeBinaryOperator,
    ReplaceIdentifier,
    ReplaceString,
    ForceAlternate,
    SwapCallArguments,
    ReplaceBoolean,
    ReplaceNumber,
    ChangeAssignmentOperator,
    SwapFunctionParameters,
}

impl InstructionKind {
    pub const ALL: [InstructionKind; 13] = [
        InstructionKind::NullifyRightOperator,
        InstructionKind::NullifyLeftOperator,
        InstructionKind::DeleteStatement,
        InstructionKind::ForceConsequent,
        InstructionKind::ChangeBinaryOperator,
        InstructionKind::ReplaceIdentifier,
        InstructionKind::ReplaceString,
        InstructionKind::ForceAlternate,
        InstructionKind::SwapCallArguments,
        InstructionKind::ReplaceBoolean,
        InstructionKind::ReplaceNumber,
        InstructionKind::ChangeAssignmentOperator,
        InstructionKind::SwapFunctionParameters,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            InstructionKind::NullifyRightOperator => "nullify-right-operator",
            InstructionKind::NullifyLeftOperator => "nullify-left-operator",
            InstructionKind::DeleteStatement => "delete-statement",
            InstructionKind::ForceConsequent => "force-consequent",
            InstructionKind::ChangeBinaryOperator => "change-binary-operator",
            InstructionKind::ReplaceIdentifier => "replace-identifier",
            InstructionKind::ReplaceString => "replace-string",
            InstructionKind::ForceAlternate => "force-alternate",
            InstructionKind::SwapCallArguments => "swap-call-arguments",
            InstructionKind::ReplaceBoolean => "replace-boolean",
            InstructionKind::ReplaceNumber => "replace-number",
            InstructionKind::ChangeAssignmentOperator => "change-assignment-operator",
            InstructionKind::SwapFunctionParameters => "swap-function-parameters",
        }
    }

    /// Variant generator for this kind.
    pub fn factory(&self) -> Factory {
        match self {
            InstructionKind::NullifyRightOperator => nullify_right_operator,
            InstructionKind::NullifyLeftOperator => nullify_left_operator,
            InstructionKind::DeleteStatement => delete_statement,
            InstructionKind::ForceConsequent => force_consequent,
            InstructionKind::ChangeBinaryOperator => change_binary_operator,
            InstructionKind::ReplaceIdentifier => replace_identifier,
            InstructionKind::ReplaceString => replace_string,
            InstructionKind::ForceAlternate => force_alternate,
            InstructionKind::SwapCallArguments => swap_call_arguments,
            InstructionKind::ReplaceBoolean => replace_boolean,
            InstructionKind::ReplaceNumber => replace_number,
            InstructionKind::ChangeAssignmentOperator => change_assignment_operator,
            InstructionKind::SwapFunctionParameters => swap_function_parameters,
        }
    }
}

/// Operator groups. Operators sharing a (nested) group are considered close
/// to each other, so they are tried before the rest.
#[derive(Debug, Clone, PartialEq)]
pub enum Category {
    Op(&'static str),
    Group(Vec<Category>),
}

macro_rules! category {
    ([$($item:tt),* $(,)?]) => {
        Category::Group(vec![$(category!($item)),*])
    };
    ($op:literal) => {
        Category::Op($op)
    };
}

pub fn binary_operation_categories() -> Category {
    category!([
        [">>", ">>>"],
        ["<", "<<"],
        [">", ">>"],
        [["^", "|", "&", ["<<", ">>>", ">>"], [">>", "<<"]]],
        [
            [["&&", "||"]],
            [[">=", ">"], ["<=", "<"]],
            [["!=", "=="], ["!==", "==="]],
        ],
        [[["&", "&&"]]],
        [[["|", "||"]]],
        [[["**", "*"], ["%"], ["/", "*"], ["-", "+"]]],
    ])
}

pub fn assignment_categories() -> Category {
    category!([
        [
            ["^=", "&=", "|="],
            [">>>=", "&=", ">>="],
            ["|=", "<<="],
            ["&=", "|="],
            [">>>=", ">>=", "<<="],
        ],
        [["/=", "*="], ["-=", "+="]],
    ])
}

impl Category {
    fn includes(&self, matched: &str) -> bool {
        match self {
            Category::Op(op) => *op == matched,
            Category::Group(items) => items.iter().any(|item| item.includes(matched)),
        }
    }
}

/// Keeps the last occurrence of every value.
pub fn filter_variant_duplicates<T: PartialEq + Clone>(values: &[T]) -> Vec<T> {
    let mut filtered: Vec<T> = Vec::new();
    for value in values.iter().rev() {
        if !filtered.contains(value) {
            filtered.push(value.clone());
        }
    }
    filtered.reverse();
    filtered
}

/// Flattens `categories` so that the groups containing `matched` come last,
/// innermost group at the very end. `matched` itself is left out.
pub fn match_and_flatten_category_data(categories: &Category, matched: &str) -> Vec<&'static str> {
    let mut stack: Vec<&Category> = vec![categories];
    let mut flattened = Vec::new();
    let mut s = 0;
    while s < stack.len() {
        let current: &Category = stack[s];
        match current {
            Category::Group(items) => {
                if current.includes(matched) {
                    stack.extend(items.iter());
                    s += 1;
                } else {
                    stack.splice(s..s + 1, items.iter());
                }
            }
            Category::Op(op) => {
                if *op != matched {
                    flattened.push(*op);
                }
                s += 1;
            }
        }
    }
    filter_variant_duplicates(&flattened)
}

/// Replacement operators for `operator`, closest first.
pub fn closest_operators(categories: &Category, operator: &str) -> Vec<&'static str> {
    let mut operators = match_and_flatten_category_data(categories, operator);
    operators.reverse();
    operators
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Call,
    Member,
    Plain,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierUsage {
    pub name: String,
    pub scope: NodePath,
    pub order: usize,
    pub access: Access,
}

/// Per-file tables built before any instruction is proposed.
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
    pub identifiers: Vec<IdentifierUsage>,
    pub numbers: Vec<f64>,
    pub strings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FactoryContext {
    pub files: HashMap<String, FileIndex>,
}

impl FactoryContext {
    pub fn file(&self, file_path: &str) -> Option<&FileIndex> {
        self.files.get(file_path)
    }
}

fn is_import(node: &Node) -> bool {
    matches!(node.kind, NodeKind::ImportDeclaration { .. })
}

/// Identifiers that name a property rather than a binding.
fn is_property_name(visit: &Visit<'_>) -> bool {
    matches!(
        visit.parent(),
        Some((
            Node {
                kind: NodeKind::MemberExpression {
                    computed: false,
                    ..
                },
                ..
            },
            Step::Property,
        ))
    )
}

fn is_declaration_name(visit: &Visit<'_>) -> bool {
    matches!(
        visit.parent(),
        Some((
            Node {
                kind: NodeKind::VariableDeclarator { .. },
                ..
            },
            Step::Id
        )) | Some((
            Node {
                kind: NodeKind::FunctionDeclaration { .. },
                ..
            },
            Step::Id | Step::Param(_)
        ))
    )
}

fn access_of(visit: &Visit<'_>) -> Access {
    match visit.parent() {
        Some((
            Node {
                kind: NodeKind::CallExpression { .. },
                ..
            },
            Step::Callee,
        )) => Access::Call,
        Some((
            Node {
                kind: NodeKind::FunctionDeclaration { .. },
                ..
            },
            Step::Id,
        )) => Access::Call,
        Some((
            Node {
                kind: NodeKind::MemberExpression { .. },
                ..
            },
            Step::Object,
        )) => Access::Member,
        _ => Access::Plain,
    }
}

/// Path of the innermost scope the node is visible in. A function's own name
/// belongs to the scope around the function.
fn scope_of(visit: &Visit<'_>) -> NodePath {
    let skip_parent = matches!(
        visit.parent(),
        Some((
            Node {
                kind: NodeKind::FunctionDeclaration { .. },
                ..
            },
            Step::Id
        ))
    );
    let depth = visit.ancestors.len();
    for (i, ancestor) in visit.ancestors.iter().enumerate().rev() {
        if skip_parent && i + 1 == depth {
            continue;
        }
        if ancestor.is_scope() {
            return visit.path[..i].to_vec();
        }
    }
    Vec::new()
}

fn index_file(ast: &Node) -> FileIndex {
    let mut index = FileIndex::default();
    let mut order = 0;
    ast.walk(&mut |visit| {
        match &visit.node.kind {
            NodeKind::Identifier { name } if !is_property_name(visit) => {
                index.identifiers.push(IdentifierUsage {
                    name: name.clone(),
                    scope: scope_of(visit),
                    order,
                    access: access_of(visit),
                });
            }
            NodeKind::NumericLiteral { value } => {
                if !index.numbers.contains(value) {
                    index.numbers.push(*value);
                }
            }
            NodeKind::StringLiteral { value } if !visit.has_ancestor(is_import) => {
                if !index.strings.contains(value) {
                    index.strings.push(value.clone());
                }
            }
            _ => {}
        }
        order += 1;
    });
    index
}

/// One pass over every file to build the shared tables.
pub fn setup(asts: &AstMap) -> FactoryContext {
    FactoryContext {
        files: asts
            .iter()
            .map(|(file_path, ast)| (file_path.clone(), index_file(ast)))
            .collect(),
    }
}

/// What a factory sees of the node it is asked about.
pub struct FactoryInput<'a> {
    pub visit: &'a Visit<'a>,
    pub index: &'a FileIndex,
    pub order: usize,
}

impl<'a> FactoryInput<'a> {
    fn node(&self) -> &'a Node {
        self.visit.node
    }

    fn path(&self) -> NodePath {
        self.visit.path.to_vec()
    }

    fn child_path(&self, step: Step) -> NodePath {
        let mut path = self.path();
        path.push(step);
        path
    }

    fn replace_self(&self, description: String, kind: NodeKind) -> Mutation {
        Mutation::single(
            description,
            self.path(),
            Node::with_loc(kind, self.node().loc),
        )
    }
}

/// Proposes mutations for a single node; an empty result means the node is
/// not of the shape this factory handles.
pub type Factory = fn(&FactoryInput<'_>) -> Vec<Mutation>;

fn binary_parts(node: &Node) -> Option<(&str, &Node, &Node)> {
    match &node.kind {
        NodeKind::BinaryExpression {
            operator,
            left,
            right,
        }
        | NodeKind::LogicalExpression {
            operator,
            left,
            right,
        } => Some((operator.as_str(), left.as_ref(), right.as_ref())),
        _ => None,
    }
}

fn nullify_right_operator(input: &FactoryInput<'_>) -> Vec<Mutation> {
    match binary_parts(input.node()) {
        Some((operator, left, _)) => vec![Mutation::single(
            format!("drop right operand of {}", operator),
            input.path(),
            left.clone(),
        )],
        None => Vec::new(),
    }
}

fn nullify_left_operator(input: &FactoryInput<'_>) -> Vec<Mutation> {
    match binary_parts(input.node()) {
        Some((operator, _, right)) => vec![Mutation::single(
            format!("drop left operand of {}", operator),
            input.path(),
            right.clone(),
        )],
        None => Vec::new(),
    }
}

fn change_binary_operator(input: &FactoryInput<'_>) -> Vec<Mutation> {
    let (operator, left, right) = match binary_parts(input.node()) {
        Some(parts) => parts,
        None => return Vec::new(),
    };
    closest_operators(&binary_operation_categories(), operator)
        .into_iter()
        .map(|new_operator| {
            let left = Box::new(left.clone());
            let right = Box::new(right.clone());
            let new_op = new_operator.to_string();
            let kind = if new_operator == "&&" || new_operator == "||" {
                NodeKind::LogicalExpression {
                    operator: new_op,
                    left,
                    right,
                }
            } else {
                NodeKind::BinaryExpression {
                    operator: new_op,
                    left,
                    right,
                }
            };
            input.replace_self(format!("{} -> {}", operator, new_operator), kind)
        })
        .collect()
}

fn change_assignment_operator(input: &FactoryInput<'_>) -> Vec<Mutation> {
    let (operator, left, right) = match &input.node().kind {
        NodeKind::AssignmentExpression {
            operator,
            left,
            right,
        } => (operator, left, right),
        _ => return Vec::new(),
    };
    if !matches!(
        left.kind,
        NodeKind::Identifier { .. } | NodeKind::MemberExpression { .. }
    ) {
        return Vec::new();
    }
    closest_operators(&assignment_categories(), operator)
        .into_iter()
        .map(|new_operator| {
            input.replace_self(
                format!("{} -> {}", operator, new_operator),
                NodeKind::AssignmentExpression {
                    operator: new_operator.to_string(),
                    left: left.clone(),
                    right: right.clone(),
                },
            )
        })
        .collect()
}

fn delete_statement(input: &FactoryInput<'_>) -> Vec<Mutation> {
    let in_body = matches!(
        input.visit.parent(),
        Some((
            Node {
                kind: NodeKind::Program { .. } | NodeKind::BlockStatement { .. },
                ..
            },
            Step::Body(_),
        ))
    );
    if !in_body {
        return Vec::new();
    }
    match input.node().kind {
        NodeKind::VariableDeclaration { .. }
        | NodeKind::IfStatement { .. }
        | NodeKind::FunctionDeclaration { .. }
        | NodeKind::ReturnStatement { .. }
        | NodeKind::ImportDeclaration { .. }
        | NodeKind::EmptyStatement => Vec::new(),
        _ => vec![input.replace_self(
            format!("delete {}", input.node().type_name()),
            NodeKind::EmptyStatement,
        )],
    }
}

fn force_branch(input: &FactoryInput<'_>, value: bool) -> Vec<Mutation> {
    let test = match &input.node().kind {
        NodeKind::IfStatement { test, .. } => test,
        _ => return Vec::new(),
    };
    if test.kind == (NodeKind::BooleanLiteral { value }) {
        return Vec::new();
    }
    vec![Mutation::single(
        format!("force if test to {}", value),
        input.child_path(Step::Test),
        Node::with_loc(NodeKind::BooleanLiteral { value }, test.loc),
    )]
}

fn force_consequent(input: &FactoryInput<'_>) -> Vec<Mutation> {
    force_branch(input, true)
}

fn force_alternate(input: &FactoryInput<'_>) -> Vec<Mutation> {
    force_branch(input, false)
}

/// One variant per adjacent pair `(p - 1, p)`.
fn swap_adjacent(input: &FactoryInput<'_>, nodes: &[Node], step: fn(usize) -> Step) -> Vec<Mutation> {
    (1..nodes.len())
        .map(|p| {
            Mutation::new(
                format!("swap {} and {}", step(p - 1), step(p)),
                vec![
                    Edit {
                        path: input.child_path(step(p - 1)),
                        replacement: nodes[p].clone(),
                    },
                    Edit {
                        path: input.child_path(step(p)),
                        replacement: nodes[p - 1].clone(),
                    },
                ],
            )
        })
        .collect()
}

fn swap_call_arguments(input: &FactoryInput<'_>) -> Vec<Mutation> {
    match &input.node().kind {
        NodeKind::CallExpression { arguments, .. } => {
            swap_adjacent(input, arguments, Step::CallArgument)
        }
        _ => Vec::new(),
    }
}

fn swap_function_parameters(input: &FactoryInput<'_>) -> Vec<Mutation> {
    match &input.node().kind {
        NodeKind::FunctionDeclaration { params, .. } => swap_adjacent(input, params, Step::Param),
        _ => Vec::new(),
    }
}

fn replace_boolean(input: &FactoryInput<'_>) -> Vec<Mutation> {
    match input.node().kind {
        NodeKind::BooleanLiteral { value } => vec![input.replace_self(
            format!("{} -> {}", value, !value),
            NodeKind::BooleanLiteral { value: !value },
        )],
        _ => Vec::new(),
    }
}

/// Values that make the surrounding binary operation degenerate.
fn is_pointless_number(candidate: f64, operator: &str, on_right: bool) -> bool {
    match operator {
        "-" | "+" | ">>>" | ">>" => candidate == 0.0,
        "*" => candidate == 0.0 || candidate == 1.0,
        "/" => candidate == 0.0 || (on_right && candidate == 1.0),
        "%" => candidate == 0.0 || (on_right && candidate == 1.0),
        "**" => candidate == 1.0,
        "<<" => on_right && candidate == 0.0,
        _ => false,
    }
}

fn replace_number(input: &FactoryInput<'_>) -> Vec<Mutation> {
    let value = match input.node().kind {
        NodeKind::NumericLiteral { value } => value,
        _ => return Vec::new(),
    };
    let context = match input.visit.parent() {
        Some((parent, step)) => {
            binary_parts(parent).map(|(operator, _, _)| (operator, step == Step::Right))
        }
        None => None,
    };

    let mut candidates: Vec<f64> = input.index.numbers.clone();
    candidates.push(value - 1.0);
    candidates.push(value + 1.0);
    candidates.retain(|c| *c != value);
    if let Some((operator, on_right)) = context {
        candidates.retain(|c| !is_pointless_number(*c, operator, on_right));
    }
    candidates.sort_by(|a, b| {
        (a - value)
            .abs()
            .total_cmp(&(b - value).abs())
            .then(a.total_cmp(b))
    });
    candidates.dedup();

    candidates
        .into_iter()
        .map(|candidate| {
            input.replace_self(
                format!("{} -> {}", value, candidate),
                NodeKind::NumericLiteral { value: candidate },
            )
        })
        .collect()
}

fn replace_string(input: &FactoryInput<'_>) -> Vec<Mutation> {
    let value = match &input.node().kind {
        NodeKind::StringLiteral { value } => value,
        _ => return Vec::new(),
    };
    if input.visit.has_ancestor(is_import) {
        return Vec::new();
    }
    input
        .index
        .strings
        .iter()
        .filter(|candidate| *candidate != value)
        .map(|candidate| {
            input.replace_self(
                format!("{:?} -> {:?}", value, candidate),
                NodeKind::StringLiteral {
                    value: candidate.clone(),
                },
            )
        })
        .collect()
}

/// Names declared by the declaration the node is part of.
fn names_declared_alongside(visit: &Visit<'_>) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(declaration) = visit
        .ancestors
        .iter()
        .rev()
        .find(|a| matches!(a.kind, NodeKind::VariableDeclaration { .. }))
    {
        for (_, declarator) in declaration.children() {
            if let NodeKind::VariableDeclarator { id, .. } = &declarator.kind {
                if let NodeKind::Identifier { name } = &id.kind {
                    names.push(name.clone());
                }
            }
        }
    }
    names
}

fn replace_identifier(input: &FactoryInput<'_>) -> Vec<Mutation> {
    let visit = input.visit;
    let name = match &visit.node.kind {
        NodeKind::Identifier { name } => name,
        _ => return Vec::new(),
    };
    if is_property_name(visit) || is_declaration_name(visit) || visit.has_ancestor(is_import) {
        return Vec::new();
    }

    let scope = scope_of(visit);
    let access = access_of(visit);
    let excluded = names_declared_alongside(visit);
    let assignment_target = matches!(
        visit.parent(),
        Some((
            Node {
                kind: NodeKind::AssignmentExpression { .. },
                ..
            },
            Step::Left,
        ))
    );

    let mut candidates: Vec<&str> = Vec::new();
    for usage in input.index.identifiers.iter().rev() {
        if usage.order >= input.order
            || usage.access != access
            || !scope.starts_with(&usage.scope)
            || usage.name == *name
            || excluded.contains(&usage.name)
            || (assignment_target && usage.name == "undefined")
            || candidates.contains(&usage.name.as_str())
        {
            continue;
        }
        candidates.push(&usage.name);
    }

    candidates
        .into_iter()
        .map(|candidate| {
            input.replace_self(
                format!("{} -> {}", name, candidate),
                NodeKind::Identifier {
                    name: candidate.to_string(),
                },
            )
        })
        .collect()
}

/// Every instruction the built-in factories propose for one file, in
/// importance order.
pub fn create_instructions(file_path: &str, ast: &Node, context: &FactoryContext) -> Vec<Instruction> {
    let fallback = FileIndex::default();
    let index = context.file(file_path).unwrap_or(&fallback);
    let mut instructions = Vec::new();
    let mut order = 0;
    ast.walk(&mut |visit| {
        let input = FactoryInput {
            visit,
            index,
            order,
        };
        for kind in InstructionKind::ALL {
            let variants = (kind.factory())(&input);
            if !variants.is_empty() {
                instructions.push(Instruction::new(kind, file_path, ast, visit.path.to_vec(), variants));
            }
        }
        order += 1;
    });
    instructions.sort_by_key(|instruction| instruction.kind);
    instructions
}
