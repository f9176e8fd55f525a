use crate::ast::{path_to_string, AstMap, Node, NodePath};
use crate::config::{MutationConfig, MutationStrategy};
use crate::coverage::ExpressionSpan;
use crate::error::{FaultError, Result};
use crate::evaluation::{
    evaluate_trial, mutation_evaluations_to_faults, MutatedLocation, MutationEvaluation,
    StackParser,
};
use crate::faults::Fault;
use crate::messages::TestOutcome;
use crate::operators::{create_instructions, setup, InstructionKind};
use crate::runner::{self, RunnerOptions, TesterResults};
use crate::worker::TestHarness;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Replace the node at `path` with `replacement`.
#[derive(Debug, Clone, PartialEq)]
pub struct Edit {
    pub path: NodePath,
    pub replacement: Node,
}

/// One variant of an instruction. Swaps need more than one edit.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub description: String,
    pub edits: Vec<Edit>,
}

impl Mutation {
    pub fn new(description: String, edits: Vec<Edit>) -> Self {
        Self { description, edits }
    }

    pub fn single(description: String, path: NodePath, replacement: Node) -> Self {
        Self::new(description, vec![Edit { path, replacement }])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub file_path: String,
    pub path: NodePath,
    pub location: Option<ExpressionSpan>,
    /// `file#path` of every node a variant may overwrite, including the
    /// nodes below it.
    pub conflict_write_dependency_keys: BTreeSet<String>,
    pub variants: Vec<Mutation>,
}

impl Instruction {
    pub fn new(
        kind: InstructionKind,
        file_path: &str,
        ast: &Node,
        path: NodePath,
        variants: Vec<Mutation>,
    ) -> Self {
        let mut conflict_write_dependency_keys = BTreeSet::new();
        for variant in &variants {
            for edit in &variant.edits {
                if let Some(target) = ast.get(&edit.path) {
                    for written in target.subtree_paths(&edit.path) {
                        conflict_write_dependency_keys
                            .insert(format!("{}#{}", file_path, path_to_string(&written)));
                    }
                }
            }
        }
        Self {
            kind,
            file_path: file_path.to_string(),
            location: ast.get(&path).and_then(|node| node.loc),
            path,
            conflict_write_dependency_keys,
            variants,
        }
    }

    pub fn conflicts(&self, other: &Instruction) -> bool {
        !self
            .conflict_write_dependency_keys
            .is_disjoint(&other.conflict_write_dependency_keys)
    }
}

/// Nodes displaced by an applied mutation, in application order.
pub type Displaced = Vec<(NodePath, Node)>;

/// Applies every edit of `mutation`. If one edit fails the earlier ones are
/// undone before the error is returned.
pub fn apply_mutation(ast: &mut Node, mutation: &Mutation) -> Result<Displaced> {
    let mut displaced = Displaced::new();
    for edit in &mutation.edits {
        match ast.replace(&edit.path, edit.replacement.clone()) {
            Ok(previous) => displaced.push((edit.path.clone(), previous)),
            Err(e) => {
                revert_mutation(ast, displaced)?;
                return Err(e);
            }
        }
    }
    Ok(displaced)
}

/// Puts displaced nodes back, last edit first.
pub fn revert_mutation(ast: &mut Node, displaced: Displaced) -> Result<()> {
    for (path, previous) in displaced.into_iter().rev() {
        ast.replace(&path, previous)?;
    }
    Ok(())
}

/// Greedy blocks of instructions that pairwise do not conflict.
pub fn group_instructions(instructions: &[Instruction]) -> Vec<Vec<usize>> {
    let mut blocks: Vec<(BTreeSet<String>, Vec<usize>)> = Vec::new();
    for (i, instruction) in instructions.iter().enumerate() {
        let keys = &instruction.conflict_write_dependency_keys;
        match blocks
            .iter_mut()
            .find(|(written, _)| written.is_disjoint(keys))
        {
            Some((written, members)) => {
                written.extend(keys.iter().cloned());
                members.push(i);
            }
            None => blocks.push((keys.clone(), vec![i])),
        }
    }
    blocks.into_iter().map(|(_, members)| members).collect()
}

/// `(instruction, variant)` pairs applied together.
pub type Trial = Vec<(usize, usize)>;

pub fn plan_trials(instructions: &[Instruction], strategy: MutationStrategy) -> Vec<Trial> {
    match strategy {
        MutationStrategy::Single => instructions
            .iter()
            .enumerate()
            .flat_map(|(i, instruction)| (0..instruction.variants.len()).map(move |v| vec![(i, v)]))
            .collect(),
        MutationStrategy::Grouped => {
            let mut trials = Vec::new();
            for block in group_instructions(instructions) {
                let widest = block
                    .iter()
                    .map(|i| instructions[*i].variants.len())
                    .max()
                    .unwrap_or(0);
                for v in 0..widest {
                    trials.push(
                        block
                            .iter()
                            .filter(|i| instructions[**i].variants.len() > v)
                            .map(|i| (*i, v))
                            .collect(),
                    );
                }
            }
            trials
        }
    }
}

/// Runs test files against the current state of the syntax trees.
#[async_trait]
pub trait MutationTestRunner: Send {
    async fn run_tests(
        &mut self,
        asts: &AstMap,
        test_files: &[String],
    ) -> anyhow::Result<TesterResults>;
}

/// Drives the worker pool, handing each worker harness the trees of the
/// current trial.
pub struct WorkerPoolRunner<F> {
    options: RunnerOptions,
    make_harness: F,
}

impl<F> WorkerPoolRunner<F> {
    pub fn new(options: RunnerOptions, make_harness: F) -> Self {
        Self {
            options,
            make_harness,
        }
    }
}

#[async_trait]
impl<F, H> MutationTestRunner for WorkerPoolRunner<F>
where
    F: Fn(Arc<AstMap>) -> H + Clone + Send + Sync + 'static,
    H: TestHarness + 'static,
{
    async fn run_tests(
        &mut self,
        asts: &AstMap,
        test_files: &[String],
    ) -> anyhow::Result<TesterResults> {
        let asts = Arc::new(asts.clone());
        let make_harness = self.make_harness.clone();
        let results =
            runner::run_tests(test_files, &self.options, move || make_harness(asts.clone()))
                .await?;
        Ok(results.results)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub strategy: MutationStrategy,
    pub max_trials: Option<usize>,
}

impl From<&MutationConfig> for SearchOptions {
    fn from(config: &MutationConfig) -> Self {
        Self {
            strategy: config.strategy,
            max_trials: config.max_trials,
        }
    }
}

/// Executed statement spans per source file.
fn executed_spans<'a, I>(outcomes: I) -> BTreeMap<String, Vec<ExpressionSpan>>
where
    I: IntoIterator<Item = &'a TestOutcome>,
{
    let mut spans: BTreeMap<String, Vec<ExpressionSpan>> = BTreeMap::new();
    for outcome in outcomes {
        for (source_path, file_coverage) in &outcome.coverage {
            for (statement_id, location) in &file_coverage.statement_map {
                if file_coverage.statement_count(statement_id) > 0 {
                    let file_spans = spans.entry(source_path.clone()).or_default();
                    if !file_spans.contains(location) {
                        file_spans.push(*location);
                    }
                }
            }
        }
    }
    spans
}

fn executes(outcome: &TestOutcome, file_path: &str, location: &ExpressionSpan) -> bool {
    outcome.coverage.get(file_path).map_or(false, |file_coverage| {
        file_coverage
            .statement_map
            .iter()
            .any(|(id, span)| span.contains(location) && file_coverage.statement_count(id) > 0)
    })
}

/// Test files whose tests executed any node the trial touches.
fn test_files_for_trial(
    original: &TesterResults,
    instructions: &[Instruction],
    trial: &Trial,
) -> Vec<String> {
    let mut files = BTreeSet::new();
    for (i, _) in trial {
        let instruction = &instructions[*i];
        if let Some(location) = &instruction.location {
            for outcome in original.outcomes() {
                if executes(outcome, &instruction.file_path, location) {
                    files.insert(outcome.file.clone());
                }
            }
        }
    }
    if files.is_empty() {
        files.extend(original.failing().map(|outcome| outcome.file.clone()));
    }
    files.into_iter().collect()
}

/// Instructions for nodes inside statements some failing test executed.
pub fn candidate_instructions(asts: &AstMap, original: &TesterResults) -> Vec<Instruction> {
    let suspicious = executed_spans(original.failing());
    let context = setup(asts);
    let mut instructions: Vec<Instruction> = Vec::new();
    for (file_path, ast) in asts {
        let spans = match suspicious.get(file_path) {
            Some(spans) => spans,
            None => continue,
        };
        instructions.extend(
            create_instructions(file_path, ast, &context)
                .into_iter()
                .filter(|instruction| {
                    instruction
                        .location
                        .map_or(false, |loc| spans.iter().any(|span| span.contains(&loc)))
                }),
        );
    }
    instructions.sort_by_key(|instruction| instruction.kind);
    instructions
}

async fn run_trial<R: MutationTestRunner>(
    asts: &mut AstMap,
    pristine: &AstMap,
    instructions: &[Instruction],
    trial: &Trial,
    test_files: &[String],
    runner: &mut R,
) -> Result<TesterResults> {
    let mut applied: Vec<(String, Displaced)> = Vec::new();
    let mut apply_error = None;
    for (i, v) in trial {
        let instruction = &instructions[*i];
        let outcome = match asts.get_mut(&instruction.file_path) {
            Some(ast) => apply_mutation(ast, &instruction.variants[*v]),
            None => Err(FaultError::Mutation(format!(
                "no syntax tree for {}",
                instruction.file_path
            ))),
        };
        match outcome {
            Ok(displaced) => applied.push((instruction.file_path.clone(), displaced)),
            Err(e) => {
                apply_error = Some(e);
                break;
            }
        }
    }

    let results = match apply_error {
        Some(e) => Err(e),
        None => runner
            .run_tests(asts, test_files)
            .await
            .map_err(FaultError::from),
    };

    revert_trial(asts, pristine, applied)?;
    results
}

/// Undoes a trial, last mutation first. If a mutation cannot be reverted its
/// file is restored from `pristine` and the trial is reported as failed.
fn revert_trial(
    asts: &mut AstMap,
    pristine: &AstMap,
    applied: Vec<(String, Displaced)>,
) -> Result<()> {
    for (file_path, displaced) in applied.into_iter().rev() {
        let reverted = match asts.get_mut(&file_path) {
            Some(ast) => revert_mutation(ast, displaced),
            None => Err(FaultError::Mutation(format!("no syntax tree for {}", file_path))),
        };
        if let Err(e) = reverted {
            error!("Failed to revert mutation in {}: {}", file_path, e);
            if let Some(original) = pristine.get(&file_path) {
                asts.insert(file_path.clone(), original.clone());
            }
            return Err(FaultError::Mutation(format!(
                "revert failed in {}: {}",
                file_path, e
            )));
        }
    }
    Ok(())
}

/// Tries instructions in importance order and scores every trial against the
/// unmodified run. The trees are left as they were found.
pub async fn search<R: MutationTestRunner>(
    asts: &mut AstMap,
    test_files: &[String],
    runner: &mut R,
    options: &SearchOptions,
) -> Result<Vec<MutationEvaluation>> {
    let parser = StackParser::new()?;
    let original = runner.run_tests(asts, test_files).await?;
    let failing = original.failing().count();
    if failing == 0 {
        info!("No failing tests, nothing to localize");
        return Ok(Vec::new());
    }

    let instructions = candidate_instructions(asts, &original);
    let trials = plan_trials(&instructions, options.strategy);
    let limit = options.max_trials.unwrap_or(usize::MAX);
    info!(
        "{} failing tests, {} instructions, {} trials",
        failing,
        instructions.len(),
        trials.len().min(limit)
    );

    let pristine = asts.clone();
    let mut evaluations = Vec::new();
    for (n, trial) in trials.into_iter().take(limit).enumerate() {
        let files = test_files_for_trial(&original, &instructions, &trial);
        debug!("Trial {} re-runs {:?}", n, files);
        match run_trial(asts, &pristine, &instructions, &trial, &files, runner).await {
            Ok(results) => {
                let mutations = trial
                    .iter()
                    .filter_map(|(i, v)| {
                        let instruction = &instructions[*i];
                        instruction.location.map(|location| MutatedLocation {
                            file_path: instruction.file_path.clone(),
                            location,
                            kind: instruction.kind,
                            description: instruction.variants[*v].description.clone(),
                        })
                    })
                    .collect();
                evaluations.push(MutationEvaluation {
                    mutations,
                    result: evaluate_trial(&parser, &original, &results),
                });
            }
            Err(e) => warn!("Trial {} aborted: {}", n, e),
        }
    }
    Ok(evaluations)
}

pub async fn localize_by_mutation<R: MutationTestRunner>(
    asts: &mut AstMap,
    test_files: &[String],
    runner: &mut R,
    options: &SearchOptions,
) -> Result<Vec<Fault>> {
    let evaluations = search(asts, test_files, runner, options).await?;
    Ok(mutation_evaluations_to_faults(evaluations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::tests::add_program;
    use crate::ast::{NodeKind, Step};
    use crate::config::RunnerMode;
    use crate::coverage::FileCoverage;
    use crate::evidence::tests::outcome;
    use crate::worker::TestContext;

    const RETURN_ARGUMENT: [Step; 4] = [
        Step::Body(0),
        Step::FunctionBody,
        Step::Body(0),
        Step::Argument,
    ];

    fn add_instructions() -> (AstMap, Vec<Instruction>) {
        let asts: AstMap = [("src/add.js".to_string(), add_program())].into();
        let context = setup(&asts);
        let instructions = create_instructions("src/add.js", &asts["src/add.js"], &context);
        (asts, instructions)
    }

    fn find(instructions: &[Instruction], kind: InstructionKind) -> Vec<&Instruction> {
        instructions.iter().filter(|i| i.kind == kind).collect()
    }

    #[test]
    fn test_apply_revert_round_trip() {
        let (mut asts, instructions) = add_instructions();
        let before = serde_json::to_string(&asts["src/add.js"]).unwrap();
        let ast = asts.get_mut("src/add.js").unwrap();

        for instruction in &instructions {
            for variant in &instruction.variants {
                let displaced = apply_mutation(ast, variant).unwrap();
                assert_ne!(serde_json::to_string(&*ast).unwrap(), before);
                revert_mutation(ast, displaced).unwrap();
                assert_eq!(serde_json::to_string(&*ast).unwrap(), before);
            }
        }
    }

    #[test]
    fn test_failed_apply_leaves_tree_untouched() {
        let mut ast = add_program();
        let before = ast.clone();
        let mutation = Mutation::new(
            "broken".to_string(),
            vec![
                Edit {
                    path: RETURN_ARGUMENT.to_vec(),
                    replacement: Node::identifier("c"),
                },
                Edit {
                    path: vec![Step::Body(5)],
                    replacement: Node::identifier("d"),
                },
            ],
        );
        assert!(matches!(
            apply_mutation(&mut ast, &mutation),
            Err(FaultError::Mutation(_))
        ));
        assert_eq!(ast, before);
    }

    #[test]
    fn test_conflicts() {
        let (_, instructions) = add_instructions();
        let right = find(&instructions, InstructionKind::NullifyRightOperator)[0];
        let operator = find(&instructions, InstructionKind::ChangeBinaryOperator)[0];
        let identifiers = find(&instructions, InstructionKind::ReplaceIdentifier);
        let numbers = find(&instructions, InstructionKind::ReplaceNumber);
        let swap = find(&instructions, InstructionKind::SwapCallArguments)[0];

        assert!(right.conflicts(operator));
        assert!(right.conflicts(identifiers[0]));
        assert!(!identifiers[0].conflicts(identifiers[1]));
        assert!(!numbers[0].conflicts(numbers[1]));
        assert!(swap.conflicts(numbers[0]));
        assert!(swap.conflicts(numbers[1]));
        assert!(right
            .conflict_write_dependency_keys
            .contains("src/add.js#body[0].body.body[0].argument.left"));
    }

    #[test]
    fn test_grouped_trials_never_combine_conflicts() {
        let (_, instructions) = add_instructions();
        let blocks = group_instructions(&instructions);
        let grouped: usize = blocks.iter().map(|b| b.len()).sum();
        assert_eq!(grouped, instructions.len());
        for block in &blocks {
            for a in block {
                for b in block {
                    if a != b {
                        assert!(!instructions[*a].conflicts(&instructions[*b]));
                    }
                }
            }
        }

        let single = plan_trials(&instructions, MutationStrategy::Single);
        let variants: usize = instructions.iter().map(|i| i.variants.len()).sum();
        assert_eq!(single.len(), variants);

        let grouped = plan_trials(&instructions, MutationStrategy::Grouped);
        assert!(grouped.len() < single.len());
        let applied: usize = grouped.iter().map(|t| t.len()).sum();
        assert_eq!(applied, variants);
    }

    /// Returns the same results for every run.
    struct StaticRunner {
        results: TesterResults,
        runs: usize,
    }

    #[async_trait]
    impl MutationTestRunner for StaticRunner {
        async fn run_tests(
            &mut self,
            _asts: &AstMap,
            _test_files: &[String],
        ) -> anyhow::Result<TesterResults> {
            self.runs += 1;
            Ok(self.results.clone())
        }
    }

    fn whole_file_coverage() -> FileCoverage {
        let mut file = FileCoverage::new("src/add.js");
        file.statement_map
            .insert("0".to_string(), ExpressionSpan::new((1, 0), (4, 24)));
        file.s.insert("0".to_string(), 1);
        file
    }

    #[tokio::test]
    async fn test_search_without_failures_does_nothing() {
        let mut asts: AstMap = [("src/add.js".to_string(), add_program())].into();
        let mut runner = StaticRunner {
            results: TesterResults::from_outcomes(vec![outcome("ok", true, &[])]),
            runs: 0,
        };
        let evaluations = search(&mut asts, &[], &mut runner, &SearchOptions::default())
            .await
            .unwrap();
        assert!(evaluations.is_empty());
        assert_eq!(runner.runs, 1);
    }

    #[tokio::test]
    async fn test_search_honours_trial_budget() {
        let mut asts: AstMap = [("src/add.js".to_string(), add_program())].into();
        let mut failing = outcome("adds", false, &[]);
        failing
            .coverage
            .insert("src/add.js".to_string(), whole_file_coverage());
        let mut runner = StaticRunner {
            results: TesterResults::from_outcomes(vec![failing]),
            runs: 0,
        };
        let options = SearchOptions {
            strategy: MutationStrategy::Single,
            max_trials: Some(3),
        };

        let evaluations = search(&mut asts, &[], &mut runner, &options).await.unwrap();

        assert_eq!(runner.runs, 4);
        assert_eq!(evaluations.len(), 3);
        assert_eq!(
            evaluations[0].mutations[0].kind,
            InstructionKind::NullifyRightOperator
        );
        assert!(evaluations.iter().all(|e| e.result.end_result_improvement == 0));
    }

    #[test]
    fn test_failed_revert_restores_pristine_tree() {
        let (mut asts, instructions) = add_instructions();
        let pristine = asts.clone();
        let right = find(&instructions, InstructionKind::NullifyRightOperator)[0];
        let displaced =
            apply_mutation(asts.get_mut("src/add.js").unwrap(), &right.variants[0]).unwrap();
        assert_ne!(asts, pristine);

        let bogus = vec![(vec![Step::Body(5)], Node::identifier("c"))];
        let applied = vec![
            ("src/add.js".to_string(), displaced),
            ("src/add.js".to_string(), bogus),
        ];
        assert!(matches!(
            revert_trial(&mut asts, &pristine, applied),
            Err(FaultError::Mutation(_))
        ));
        assert_eq!(asts, pristine);
    }

    /// Fails the run for the trial numbered `fail_on`, counting the unmodified
    /// run as 0.
    struct FlakyRunner {
        results: TesterResults,
        fail_on: usize,
        runs: usize,
    }

    #[async_trait]
    impl MutationTestRunner for FlakyRunner {
        async fn run_tests(
            &mut self,
            _asts: &AstMap,
            _test_files: &[String],
        ) -> anyhow::Result<TesterResults> {
            let run = self.runs;
            self.runs += 1;
            if run == self.fail_on {
                anyhow::bail!("test runner exited unexpectedly");
            }
            Ok(self.results.clone())
        }
    }

    #[tokio::test]
    async fn test_search_continues_after_failed_trial() {
        let mut asts: AstMap = [("src/add.js".to_string(), add_program())].into();
        let before = asts.clone();
        let mut failing = outcome("adds", false, &[]);
        failing
            .coverage
            .insert("src/add.js".to_string(), whole_file_coverage());
        let mut runner = FlakyRunner {
            results: TesterResults::from_outcomes(vec![failing]),
            fail_on: 1,
            runs: 0,
        };
        let options = SearchOptions {
            strategy: MutationStrategy::Single,
            max_trials: Some(3),
        };

        let evaluations = search(&mut asts, &[], &mut runner, &options).await.unwrap();

        assert_eq!(runner.runs, 4);
        assert_eq!(evaluations.len(), 2);
        assert_eq!(asts, before);
    }

    fn operator_of(asts: &AstMap) -> Option<String> {
        match &asts.get("src/add.js")?.get(&RETURN_ARGUMENT)?.kind {
            NodeKind::BinaryExpression { operator, .. } => Some(operator.clone()),
            _ => None,
        }
    }

    /// `add` is expected to sum its arguments. Statement 0 is the return,
    /// statement 1 the call site.
    #[derive(Clone)]
    struct AddHarness {
        asts: Arc<AstMap>,
    }

    #[async_trait]
    impl TestHarness for AddHarness {
        async fn run_files(
            &mut self,
            files: &[String],
            ctx: &mut TestContext<'_>,
        ) -> anyhow::Result<()> {
            for file in files {
                let mut source = FileCoverage::new("src/add.js");
                source
                    .statement_map
                    .insert("0".to_string(), ExpressionSpan::new((2, 2), (2, 15)));
                source
                    .statement_map
                    .insert("1".to_string(), ExpressionSpan::new((4, 0), (4, 24)));
                ctx.coverage().register_file(source);

                let title_path = vec![file.clone(), "adds".to_string()];
                ctx.test_started(title_path.clone(), file);
                ctx.coverage().hit_statement("src/add.js", "1");
                ctx.coverage().hit_statement("src/add.js", "0");
                let passed = operator_of(&self.asts).as_deref() == Some("+");
                let stack = (!passed).then(|| {
                    format!("AssertionError: expected 3\n    at Context.<anonymous> ({}:4:10)", file)
                });
                ctx.test_finished(title_path, file, "assert.equal(add(1, 2), 3)", passed, stack);

                let title_path = vec![file.clone(), "loads".to_string()];
                ctx.test_started(title_path.clone(), file);
                ctx.coverage().hit_statement("src/add.js", "1");
                ctx.test_finished(title_path, file, "assert.ok(total)", true, None);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_localize_by_mutation_finds_wrong_operator() {
        let mut program = add_program();
        if let Some(Node {
            kind: NodeKind::BinaryExpression { operator, .. },
            ..
        }) = program.get_mut(&RETURN_ARGUMENT)
        {
            *operator = "-".to_string();
        }
        let mut asts: AstMap = [("src/add.js".to_string(), program)].into();
        let before = asts.clone();

        let options = RunnerOptions {
            workers: 1,
            mode: RunnerMode::Batch,
            ..RunnerOptions::default()
        };
        let mut runner = WorkerPoolRunner::new(options, |asts| AddHarness { asts });
        let faults = localize_by_mutation(
            &mut asts,
            &["test/add.test.js".to_string()],
            &mut runner,
            &SearchOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(asts, before);
        assert_eq!(faults[0].source_path, "src/add.js");
        assert_eq!(faults[0].location, ExpressionSpan::new((2, 9), (2, 14)));
        let other = faults[0].other.as_ref().unwrap();
        assert_eq!(other["mutation"], "change-binary-operator");
        assert_eq!(other["description"], "- -> +");
    }
}
