//! Compilation of SPARQL algebra trees into streaming evaluators.
//!
//! Each algebra node compiles to a closure producing a lazy, cancellable
//! [`Stream`] of encoded solution tuples. The closure receives the correlated
//! input binding and the active graph, so correlated sub-evaluation (EXISTS,
//! sub-queries, `GRAPH ?g`) reuses the compiled tree with a different input.
//!
//! Binary operators (`Join`, `LeftJoin`) are driven by [`StreamingJoin`], which
//! advances both child streams concurrently and emits joined rows as soon as
//! they are derivable, buffering only the rows of a side whose partner is still
//! producing.

use crate::dataset::QueryableDataset;
use crate::error::QueryEvaluationError;
use crate::expression::{
    cmp_terms, effective_boolean_value_expression_evaluator, expression_evaluator, NumericPair,
    Numeric, parse_numeric, BooleanExpressionEvaluatorFn, ExpressionEvaluatorFn,
};
use crate::model::{QuerySolutionStream, QueryTripleStream};
use crate::{CustomAggregateFunctionRegistry, CustomFunctionRegistry};
use futures::future::ready;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt, TryStreamExt};
use json_event_parser::{JsonEvent, WriterJsonSerializer};
use oxrdf::{BlankNode, Literal, NamedOrBlankNode, Term, Triple, Variable};
use oxsdatatypes::{Decimal, Integer};
use rustc_hash::{FxHashMap, FxHashSet};
use spargebra::algebra::{
    AggregateExpression, AggregateFunction, Expression, GraphPattern, OrderExpression,
};
use spargebra::term::{GroundTerm, NamedNodePattern, TermPattern, TriplePattern};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use std::{fmt, io};

/// Prefix of the variables this evaluator synthesizes internally.
///
/// A leading space cannot appear in a parsed SPARQL variable name, so these
/// can never collide with user variables. They are stripped from the final
/// projection.
pub(crate) const INTERNAL_VARIABLE_PREFIX: &str = " sparpull:";

/// A token allowing to abort a running SPARQL evaluation.
///
/// The token is checked between produced rows in every operator that loops over
/// a child's output: after [`cancel`](CancellationToken::cancel) the evaluation
/// stops producing, emits [`QueryEvaluationError::Cancelled`] once and ends.
#[derive(Clone, Default, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Relaxed)
    }
}

/// Cancellation signal threaded through the whole evaluator tree:
/// the user-visible token plus the deadline derived from the timeout limit.
#[derive(Clone, Default)]
pub(crate) struct Cancellation {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub(crate) fn new(token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    pub(crate) fn check(&self) -> Result<(), QueryEvaluationError> {
        if self.token.is_cancelled() {
            return Err(QueryEvaluationError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() > deadline) {
            return Err(QueryEvaluationError::Timeout);
        }
        Ok(())
    }
}

/// One row of variable bindings, encoded positionally against the per-query
/// variable table. An absent position is an unbound variable.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub(crate) struct EncodedTuple {
    inner: Vec<Option<Term>>,
}

impl EncodedTuple {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn contains(&self, index: usize) -> bool {
        self.inner.get(index).is_some_and(Option::is_some)
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Term> {
        self.inner.get(index).unwrap_or(&None).as_ref()
    }

    pub(crate) fn values(&self) -> &[Option<Term>] {
        &self.inner
    }

    pub(crate) fn set(&mut self, index: usize, value: Term) {
        if self.inner.len() <= index {
            self.inner.resize(index + 1, None);
        }
        self.inner[index] = Some(value);
    }

    /// Merges two rows if they are compatible: every variable bound in both
    /// must be bound to the same term. Returns the union of the bindings,
    /// or `None` on a conflict.
    pub(crate) fn combine_with(&self, other: &Self) -> Option<Self> {
        if self.inner.len() < other.inner.len() {
            other.combine_with(self)
        } else {
            let mut result = self.inner.clone();
            for (key, other_value) in other.inner.iter().enumerate() {
                if let Some(other_value) = other_value {
                    match &self.inner[key] {
                        Some(self_value) => {
                            if self_value != other_value {
                                return None;
                            }
                        }
                        None => result[key] = Some(other_value.clone()),
                    }
                }
            }
            Some(Self { inner: result })
        }
    }
}

impl fmt::Debug for EncodedTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.inner).finish()
    }
}

/// The `MINUS` suppression test: the rows must agree on every variable bound in
/// both *and* share at least one such variable. Unlike the join compatibility
/// test, zero shared bound variables means "not suppressed".
pub(crate) fn are_compatible_and_not_disjointed(a: &EncodedTuple, b: &EncodedTuple) -> bool {
    let mut found_intersection = false;
    for (a_value, b_value) in a.inner.iter().zip(&b.inner) {
        if let (Some(a_value), Some(b_value)) = (a_value, b_value) {
            if a_value != b_value {
                return false;
            }
            found_intersection = true;
        }
    }
    found_intersection
}

pub(crate) type SolutionStream =
    BoxStream<'static, Result<EncodedTuple, QueryEvaluationError>>;

/// The graph that triple patterns currently match against.
#[derive(Clone)]
pub(crate) enum ActiveGraph {
    Default,
    Named(Term),
}

type TupleEvaluator = Arc<dyn Fn(EncodedTuple, ActiveGraph) -> SolutionStream + Send + Sync>;

/// Wrapper on top of [`QueryableDataset`]
struct EvalDataset<D: QueryableDataset> {
    dataset: Arc<D>,
}

impl<D: QueryableDataset> EvalDataset<D> {
    fn quads_for_pattern(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        graph_name: Option<Option<&Term>>,
    ) -> impl Iterator<Item = Result<crate::dataset::EvalQuad, QueryEvaluationError>> + Send + 'static
    {
        self.dataset
            .quads_for_pattern(subject, predicate, object, graph_name)
            .map(|r| r.map_err(|e| QueryEvaluationError::Dataset(Box::new(e))))
    }

    fn named_graphs(
        &self,
    ) -> impl Iterator<Item = Result<Term, QueryEvaluationError>> + Send + 'static {
        self.dataset
            .named_graphs()
            .map(|r| r.map_err(|e| QueryEvaluationError::Dataset(Box::new(e))))
    }
}

impl<D: QueryableDataset> Clone for EvalDataset<D> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            dataset: Arc::clone(&self.dataset),
        }
    }
}

pub(crate) struct SimpleEvaluator<D: QueryableDataset> {
    dataset: EvalDataset<D>,
    custom_functions: Arc<CustomFunctionRegistry>,
    custom_aggregate_functions: Arc<CustomAggregateFunctionRegistry>,
    cancellation: Cancellation,
    max_groups: Option<usize>,
    run_stats: bool,
}

impl<D: QueryableDataset> SimpleEvaluator<D> {
    pub(crate) fn new(
        dataset: D,
        custom_functions: Arc<CustomFunctionRegistry>,
        custom_aggregate_functions: Arc<CustomAggregateFunctionRegistry>,
        cancellation: Cancellation,
        max_groups: Option<usize>,
        run_stats: bool,
    ) -> Self {
        Self {
            dataset: EvalDataset {
                dataset: Arc::new(dataset),
            },
            custom_functions,
            custom_aggregate_functions,
            cancellation,
            max_groups,
            run_stats,
        }
    }

    pub(crate) fn evaluate_select(
        &self,
        pattern: &GraphPattern,
        substitutions: impl IntoIterator<Item = (Variable, Term)>,
    ) -> Result<(QuerySolutionStream, Arc<EvalNodeWithStats>), QueryEvaluationError> {
        let mut variables = Vec::new();
        let (eval, stats) = self.graph_pattern_evaluator(pattern, &mut variables)?;
        let from = encode_initial_bindings(&variables, substitutions)?;
        // Internally synthesized variables are excluded from the output
        let projection: Arc<[(usize, Variable)]> = variables
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.as_str().starts_with(INTERNAL_VARIABLE_PREFIX))
            .map(|(i, v)| (i, v.clone()))
            .collect();
        let output_variables: Arc<[Variable]> =
            projection.iter().map(|(_, v)| v.clone()).collect();
        let tuples = eval(from, ActiveGraph::Default).map(move |tuple| {
            let tuple = tuple?;
            Ok(projection
                .iter()
                .map(|(i, _)| tuple.get(*i).cloned())
                .collect::<Vec<_>>())
        });
        Ok((
            QuerySolutionStream::from_tuples(output_variables, tuples),
            stats,
        ))
    }

    pub(crate) async fn evaluate_ask(
        &self,
        pattern: &GraphPattern,
        substitutions: impl IntoIterator<Item = (Variable, Term)>,
    ) -> Result<(bool, Arc<EvalNodeWithStats>), QueryEvaluationError> {
        let mut variables = Vec::new();
        let (eval, stats) = self.graph_pattern_evaluator(pattern, &mut variables)?;
        let from = encode_initial_bindings(&variables, substitutions)?;
        // Same truth table as the || operation: true on the first valid row,
        // the first error if there is no valid row, false otherwise.
        let mut error = None;
        let mut solutions = eval(from, ActiveGraph::Default);
        while let Some(solution) = solutions.next().await {
            match solution {
                Ok(_) => return Ok((true, stats)),
                Err(e) => {
                    error.get_or_insert(e);
                }
            }
        }
        match error {
            Some(e) => Err(e),
            None => Ok((false, stats)),
        }
    }

    pub(crate) fn evaluate_construct(
        &self,
        pattern: &GraphPattern,
        template: &[TriplePattern],
        substitutions: impl IntoIterator<Item = (Variable, Term)>,
    ) -> Result<(QueryTripleStream, Arc<EvalNodeWithStats>), QueryEvaluationError> {
        let mut variables = Vec::new();
        let (eval, stats) = self.graph_pattern_evaluator(pattern, &mut variables)?;
        let mut bnodes = Vec::new();
        let template = template
            .iter()
            .filter_map(|t| {
                Some(TripleTemplate {
                    subject: TripleTemplateValue::from_term_pattern(
                        &t.subject,
                        &mut variables,
                        &mut bnodes,
                    )?,
                    predicate: TripleTemplateValue::from_named_node_pattern(
                        &t.predicate,
                        &mut variables,
                    ),
                    object: TripleTemplateValue::from_term_pattern(
                        &t.object,
                        &mut variables,
                        &mut bnodes,
                    )?,
                })
            })
            .collect::<Vec<_>>();
        let from = encode_initial_bindings(&variables, substitutions)?;
        let bnode_count = bnodes.len();
        let mut already_emitted = FxHashSet::<Triple>::default();
        let triples = eval(from, ActiveGraph::Default).flat_map(move |tuple| {
            match tuple {
                Ok(tuple) => {
                    // Blank nodes are freshly scoped per solution
                    let bnodes = (0..bnode_count).map(|_| BlankNode::default()).collect::<Vec<_>>();
                    let mut triples = Vec::new();
                    for template in &template {
                        // A template producing an invalid triple for this
                        // solution contributes nothing, the evaluation continues
                        if let (Some(subject), Some(predicate), Some(object)) = (
                            template.subject.evaluate(&tuple, &bnodes),
                            template.predicate.evaluate(&tuple, &bnodes),
                            template.object.evaluate(&tuple, &bnodes),
                        ) {
                            if let (Some(subject), Term::NamedNode(predicate)) =
                                (term_to_subject(subject), predicate)
                            {
                                let triple = Triple::new(subject, predicate, object);
                                if already_emitted.insert(triple.clone()) {
                                    triples.push(Ok(triple));
                                }
                            }
                        }
                    }
                    stream::iter(triples)
                }
                Err(e) => stream::iter(vec![Err(e)]),
            }
        });
        Ok((QueryTripleStream::new(triples), stats))
    }

    pub(crate) fn evaluate_describe(
        &self,
        pattern: &GraphPattern,
        substitutions: impl IntoIterator<Item = (Variable, Term)>,
    ) -> Result<(QueryTripleStream, Arc<EvalNodeWithStats>), QueryEvaluationError> {
        let mut variables = Vec::new();
        let (eval, stats) = self.graph_pattern_evaluator(pattern, &mut variables)?;
        let from = encode_initial_bindings(&variables, substitutions)?;
        let dataset = self.dataset.clone();
        let mut described = FxHashSet::<Term>::default();
        let triples = eval(from, ActiveGraph::Default).flat_map(move |tuple| match tuple {
            Ok(tuple) => {
                let mut triples = Vec::new();
                for value in tuple.values().iter().flatten() {
                    if matches!(value, Term::Literal(_)) || !described.insert(value.clone()) {
                        continue;
                    }
                    for quad in dataset.quads_for_pattern(Some(value), None, None, Some(None)) {
                        triples.push(quad.map(|quad| {
                            let subject = term_to_subject(quad.subject)?;
                            let Term::NamedNode(predicate) = quad.predicate else {
                                return None;
                            };
                            Some(Triple::new(subject, predicate, quad.object))
                        }));
                    }
                }
                stream::iter(triples)
            }
            Err(e) => stream::iter(vec![Err(e)]),
        });
        // Invalid predicate terms are skipped, dataset errors are kept
        let triples = triples.filter_map(|r| {
            ready(match r {
                Ok(Some(t)) => Some(Ok(t)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            })
        });
        Ok((QueryTripleStream::new(triples), stats))
    }

    fn graph_pattern_evaluator(
        &self,
        pattern: &GraphPattern,
        encoded_variables: &mut Vec<Variable>,
    ) -> Result<(TupleEvaluator, Arc<EvalNodeWithStats>), QueryEvaluationError> {
        let mut stat_children = Vec::new();
        let mut evaluator =
            self.build_graph_pattern_evaluator(pattern, encoded_variables, &mut stat_children)?;
        let stats = Arc::new(EvalNodeWithStats {
            label: eval_node_label(pattern),
            children: stat_children,
            exec_count: AtomicU64::new(0),
            exec_duration_micros: AtomicU64::new(0),
        });
        if self.run_stats {
            let stats = Arc::clone(&stats);
            let inner = evaluator;
            evaluator = Arc::new(move |tuple, graph| {
                StatsStream {
                    inner: inner(tuple, graph),
                    stats: Arc::clone(&stats),
                }
                .boxed()
            });
        }
        Ok((evaluator, stats))
    }

    fn build_graph_pattern_evaluator(
        &self,
        pattern: &GraphPattern,
        encoded_variables: &mut Vec<Variable>,
        stat_children: &mut Vec<Arc<EvalNodeWithStats>>,
    ) -> Result<TupleEvaluator, QueryEvaluationError> {
        Ok(match pattern {
            GraphPattern::Bgp { patterns } => {
                self.bgp_evaluator(patterns, Vec::new(), encoded_variables, stat_children)?
            }
            GraphPattern::Filter { expr, inner } => {
                if let GraphPattern::Bgp { patterns } = inner.as_ref() {
                    // Early filter pushdown: each conjunct is applied right
                    // after the pattern that binds its last required variable
                    let mut conjuncts = Vec::new();
                    split_and(expr, &mut conjuncts);
                    self.bgp_evaluator(patterns, conjuncts, encoded_variables, stat_children)?
                } else {
                    let (child, child_stats) =
                        self.graph_pattern_evaluator(inner, encoded_variables)?;
                    stat_children.push(child_stats);
                    let mut probes = Vec::new();
                    let expression = self.effective_boolean_value_evaluator_with_exists(
                        expr,
                        encoded_variables,
                        stat_children,
                        &mut probes,
                    )?;
                    self.filter_evaluator(child, expression, probes)
                }
            }
            GraphPattern::Join { left, right } => {
                let (left, left_stats) = self.graph_pattern_evaluator(left, encoded_variables)?;
                stat_children.push(left_stats);
                let (right, right_stats) = self.graph_pattern_evaluator(right, encoded_variables)?;
                stat_children.push(right_stats);
                self.join_evaluator(left, right)
            }
            GraphPattern::LeftJoin {
                left,
                right,
                expression,
            } => {
                let (left, left_stats) = self.graph_pattern_evaluator(left, encoded_variables)?;
                stat_children.push(left_stats);
                let (right, right_stats) = self.graph_pattern_evaluator(right, encoded_variables)?;
                stat_children.push(right_stats);
                let filter = expression
                    .as_ref()
                    .map(|expression| {
                        if contains_exists(expression) {
                            // The join driver cannot suspend for the probe
                            return Err(QueryEvaluationError::UnsupportedOperation(
                                "EXISTS in an OPTIONAL condition".into(),
                            ));
                        }
                        Ok(effective_boolean_value_expression_evaluator(
                            expression,
                            encoded_variables,
                            &self.custom_functions,
                        ))
                    })
                    .transpose()?;
                let cancellation = self.cancellation.clone();
                Arc::new(move |from, graph| {
                    StreamingJoin::new(
                        left(from.clone(), graph.clone()),
                        right(from, graph),
                        LeftJoinStrategy::new(filter.clone()),
                        cancellation.clone(),
                    )
                    .boxed()
                })
            }
            GraphPattern::Minus { left, right } => {
                let (left, left_stats) = self.graph_pattern_evaluator(left, encoded_variables)?;
                stat_children.push(left_stats);
                let (right, right_stats) = self.graph_pattern_evaluator(right, encoded_variables)?;
                stat_children.push(right_stats);
                let cancellation = self.cancellation.clone();
                Arc::new(move |from, graph| {
                    let left = left(from.clone(), graph.clone());
                    let mut right = right(from, graph);
                    let cancellation = cancellation.clone();
                    async move {
                        // MINUS requires the full right side before the first
                        // left row can be classified
                        let mut right_rows = Vec::new();
                        while let Some(item) = right.next().await {
                            if let Err(e) = cancellation.check() {
                                return stream::iter(vec![Err(e)]).boxed();
                            }
                            match item {
                                Ok(row) => right_rows.push(row),
                                Err(e) => return stream::iter(vec![Err(e)]).boxed(),
                            }
                        }
                        if right_rows.is_empty() {
                            return left;
                        }
                        left.filter(move |l| {
                            ready(match l {
                                Ok(l) => !right_rows
                                    .iter()
                                    .any(|r| are_compatible_and_not_disjointed(l, r)),
                                Err(_) => true,
                            })
                        })
                        .boxed()
                    }
                    .flatten_stream()
                    .boxed()
                })
            }
            GraphPattern::Union { left, right } => {
                let (left, left_stats) = self.graph_pattern_evaluator(left, encoded_variables)?;
                stat_children.push(left_stats);
                let (right, right_stats) = self.graph_pattern_evaluator(right, encoded_variables)?;
                stat_children.push(right_stats);
                Arc::new(move |from, graph| {
                    stream::select(left(from.clone(), graph.clone()), right(from, graph)).boxed()
                })
            }
            GraphPattern::Graph { name, inner } => {
                let (child, child_stats) = self.graph_pattern_evaluator(inner, encoded_variables)?;
                stat_children.push(child_stats);
                match name {
                    NamedNodePattern::NamedNode(graph_name) => {
                        let graph_name = Term::from(graph_name.clone());
                        Arc::new(move |from, _| child(from, ActiveGraph::Named(graph_name.clone())))
                    }
                    NamedNodePattern::Variable(variable) => {
                        let position = encode_variable(encoded_variables, variable);
                        let dataset = self.dataset.clone();
                        Arc::new(move |from, _| {
                            if let Some(graph_name) = from.get(position).cloned() {
                                return child(from, ActiveGraph::Named(graph_name));
                            }
                            let child = Arc::clone(&child);
                            stream::iter(dataset.named_graphs())
                                .map(move |graph_name| -> SolutionStream {
                                    match graph_name {
                                        Ok(graph_name) => {
                                            let mut from = from.clone();
                                            from.set(position, graph_name.clone());
                                            child(from, ActiveGraph::Named(graph_name))
                                        }
                                        Err(e) => stream::iter(vec![Err(e)]).boxed(),
                                    }
                                })
                                .flatten()
                                .boxed()
                        })
                    }
                }
            }
            GraphPattern::Extend {
                inner,
                variable,
                expression,
            } => {
                let (child, child_stats) = self.graph_pattern_evaluator(inner, encoded_variables)?;
                stat_children.push(child_stats);
                let position = encode_variable(encoded_variables, variable);
                let variable = variable.clone();
                let mut probes = Vec::new();
                let expression = self.expression_evaluator_with_exists(
                    expression,
                    encoded_variables,
                    stat_children,
                    &mut probes,
                )?;
                let probes = Arc::new(probes);
                Arc::new(move |from, graph| {
                    let expression = Arc::clone(&expression);
                    let probes = Arc::clone(&probes);
                    let variable = variable.clone();
                    let probe_graph = graph.clone();
                    child(from, graph)
                        .and_then(move |tuple| {
                            let expression = Arc::clone(&expression);
                            let probes = Arc::clone(&probes);
                            let variable = variable.clone();
                            let graph = probe_graph.clone();
                            async move {
                                let mut tuple = bind_exists_probes(&probes, &graph, tuple).await?;
                                if tuple.contains(position) {
                                    return Err(QueryEvaluationError::VariableAlreadyBound(
                                        variable,
                                    ));
                                }
                                // An expression error leaves the variable unbound
                                if let Some(value) = expression(&tuple) {
                                    tuple.set(position, value);
                                }
                                Ok(tuple)
                            }
                        })
                        .boxed()
                })
            }
            GraphPattern::Values {
                variables,
                bindings,
            } => {
                let encoding = variables
                    .iter()
                    .map(|v| encode_variable(encoded_variables, v))
                    .collect::<Vec<_>>();
                let encoded_tuples = bindings
                    .iter()
                    .map(|row| {
                        let mut result = EncodedTuple::with_capacity(variables.len());
                        for (key, value) in row.iter().enumerate() {
                            if let Some(term) = value {
                                result.set(
                                    encoding[key],
                                    match term {
                                        GroundTerm::NamedNode(node) => node.clone().into(),
                                        GroundTerm::Literal(literal) => literal.clone().into(),
                                    },
                                );
                            }
                        }
                        result
                    })
                    .collect::<Vec<_>>();
                Arc::new(move |from, _| {
                    stream::iter(
                        encoded_tuples
                            .iter()
                            .filter_map(|t| t.combine_with(&from))
                            .map(Ok)
                            .collect::<Vec<_>>(),
                    )
                    .boxed()
                })
            }
            GraphPattern::OrderBy { inner, expression } => {
                let (child, child_stats) = self.graph_pattern_evaluator(inner, encoded_variables)?;
                stat_children.push(child_stats);
                let mut probes = Vec::new();
                let by = expression
                    .iter()
                    .map(|comp| {
                        Ok(match comp {
                            OrderExpression::Asc(expression) => {
                                ComparatorFunction::Asc(self.expression_evaluator_with_exists(
                                    expression,
                                    encoded_variables,
                                    stat_children,
                                    &mut probes,
                                )?)
                            }
                            OrderExpression::Desc(expression) => {
                                ComparatorFunction::Desc(self.expression_evaluator_with_exists(
                                    expression,
                                    encoded_variables,
                                    stat_children,
                                    &mut probes,
                                )?)
                            }
                        })
                    })
                    .collect::<Result<Vec<_>, QueryEvaluationError>>()?;
                let probes = Arc::new(probes);
                let cancellation = self.cancellation.clone();
                Arc::new(move |from, graph| {
                    let by = by.clone();
                    let probes = Arc::clone(&probes);
                    let cancellation = cancellation.clone();
                    let mut child_stream = child(from, graph.clone());
                    async move {
                        let mut errors = Vec::new();
                        let mut values = Vec::new();
                        while let Some(item) = child_stream.next().await {
                            if let Err(e) = cancellation.check() {
                                return stream::iter(vec![Err(e)]).boxed();
                            }
                            match item {
                                Ok(tuple) => {
                                    match bind_exists_probes(&probes, &graph, tuple).await {
                                        Ok(tuple) => values.push(tuple),
                                        Err(e) => return stream::iter(vec![Err(e)]).boxed(),
                                    }
                                }
                                Err(e) => errors.push(Err(e)),
                            }
                        }
                        values.sort_unstable_by(|a, b| {
                            for comp in &by {
                                match comp {
                                    ComparatorFunction::Asc(expression) => {
                                        match cmp_terms(
                                            expression(a).as_ref(),
                                            expression(b).as_ref(),
                                        ) {
                                            Ordering::Greater => return Ordering::Greater,
                                            Ordering::Less => return Ordering::Less,
                                            Ordering::Equal => (),
                                        }
                                    }
                                    ComparatorFunction::Desc(expression) => {
                                        match cmp_terms(
                                            expression(a).as_ref(),
                                            expression(b).as_ref(),
                                        ) {
                                            Ordering::Greater => return Ordering::Less,
                                            Ordering::Less => return Ordering::Greater,
                                            Ordering::Equal => (),
                                        }
                                    }
                                }
                            }
                            Ordering::Equal
                        });
                        stream::iter(
                            errors
                                .into_iter()
                                .chain(values.into_iter().map(Ok))
                                .collect::<Vec<_>>(),
                        )
                        .boxed()
                    }
                    .flatten_stream()
                    .boxed()
                })
            }
            GraphPattern::Distinct { inner } => {
                let (child, child_stats) = self.graph_pattern_evaluator(inner, encoded_variables)?;
                stat_children.push(child_stats);
                Arc::new(move |from, graph| {
                    let mut seen = FxHashSet::default();
                    child(from, graph)
                        .filter(move |tuple| {
                            ready(match tuple {
                                Ok(tuple) => seen.insert(tuple.clone()),
                                Err(_) => true,
                            })
                        })
                        .boxed()
                })
            }
            GraphPattern::Reduced { inner } => {
                let (child, child_stats) = self.graph_pattern_evaluator(inner, encoded_variables)?;
                stat_children.push(child_stats);
                Arc::new(move |from, graph| {
                    let mut current: Option<EncodedTuple> = None;
                    child(from, graph)
                        .filter(move |tuple| {
                            ready(match tuple {
                                Ok(tuple) => {
                                    if current.as_ref() == Some(tuple) {
                                        false
                                    } else {
                                        current = Some(tuple.clone());
                                        true
                                    }
                                }
                                Err(_) => true,
                            })
                        })
                        .boxed()
                })
            }
            GraphPattern::Slice {
                inner,
                start,
                length,
            } => {
                if *length == Some(0) {
                    // LIMIT 0 never pulls from its child
                    return Ok(Arc::new(|_, _| stream::empty().boxed()));
                }
                let (child, child_stats) = self.graph_pattern_evaluator(inner, encoded_variables)?;
                stat_children.push(child_stats);
                let start = *start;
                let length = *length;
                Arc::new(move |from, graph| {
                    let mut stream = child(from, graph);
                    if start > 0 {
                        stream = stream.skip(start).boxed();
                    }
                    if let Some(length) = length {
                        stream = stream.take(length).boxed();
                    }
                    stream
                })
            }
            GraphPattern::Project { inner, variables } => {
                let mut inner_encoded_variables = variables.clone();
                let (child, child_stats) =
                    self.graph_pattern_evaluator(inner, &mut inner_encoded_variables)?;
                stat_children.push(child_stats);
                let mapping = variables
                    .iter()
                    .enumerate()
                    .map(|(new_variable, variable)| {
                        (new_variable, encode_variable(encoded_variables, variable))
                    })
                    .collect::<Arc<[(usize, usize)]>>();
                Arc::new(move |from, graph| {
                    let mapping = Arc::clone(&mapping);
                    let mut input_tuple = EncodedTuple::with_capacity(mapping.len());
                    for (input_key, output_key) in &*mapping {
                        if let Some(value) = from.get(*output_key) {
                            input_tuple.set(*input_key, value.clone());
                        }
                    }
                    child(input_tuple, graph)
                        .try_filter_map(move |tuple| {
                            let mut output_tuple = from.clone();
                            for (input_key, output_key) in &*mapping {
                                if let Some(value) = tuple.get(*input_key) {
                                    if let Some(existing_value) = output_tuple.get(*output_key) {
                                        if existing_value != value {
                                            return ready(Ok(None)); // Conflict
                                        }
                                    } else {
                                        output_tuple.set(*output_key, value.clone());
                                    }
                                }
                            }
                            ready(Ok(Some(output_tuple)))
                        })
                        .boxed()
                })
            }
            GraphPattern::Group {
                inner,
                variables,
                aggregates,
            } => {
                let (child, child_stats) = self.graph_pattern_evaluator(inner, encoded_variables)?;
                stat_children.push(child_stats);
                let key_positions = variables
                    .iter()
                    .map(|k| encode_variable(encoded_variables, k))
                    .collect::<Arc<[usize]>>();
                let accumulator_builders = aggregates
                    .iter()
                    .map(|(_, aggregate)| self.accumulator_builder(aggregate, encoded_variables))
                    .collect::<Vec<_>>();
                let accumulator_positions = aggregates
                    .iter()
                    .map(|(variable, _)| encode_variable(encoded_variables, variable))
                    .collect::<Vec<_>>();
                let accumulator_builders = Arc::new(accumulator_builders);
                let cancellation = self.cancellation.clone();
                let max_groups = self.max_groups;
                Arc::new(move |from, graph| {
                    let key_positions = Arc::clone(&key_positions);
                    let accumulator_builders = Arc::clone(&accumulator_builders);
                    let accumulator_positions = accumulator_positions.clone();
                    let cancellation = cancellation.clone();
                    let mut child_stream = child(from, graph);
                    async move {
                        let mut errors = Vec::new();
                        let mut groups =
                            FxHashMap::<Vec<Option<Term>>, Vec<AccumulatorWrapper>>::default();
                        if key_positions.is_empty() {
                            // There is always a single group if there is no GROUP BY
                            groups.insert(
                                Vec::new(),
                                accumulator_builders.iter().map(|c| c()).collect(),
                            );
                        }
                        while let Some(item) = child_stream.next().await {
                            if let Err(e) = cancellation.check() {
                                return stream::iter(vec![Err(e)]).boxed();
                            }
                            let tuple = match item {
                                Ok(tuple) => tuple,
                                Err(e) => {
                                    errors.push(Err(e));
                                    continue;
                                }
                            };
                            let key = key_positions
                                .iter()
                                .map(|v| tuple.get(*v).cloned())
                                .collect::<Vec<_>>();
                            if !groups.contains_key(&key) {
                                if let Some(max_groups) = max_groups {
                                    if groups.len() >= max_groups {
                                        return stream::iter(vec![Err(
                                            QueryEvaluationError::TooManyGroups(max_groups),
                                        )])
                                        .boxed();
                                    }
                                }
                            }
                            let accumulators = groups.entry(key).or_insert_with(|| {
                                accumulator_builders.iter().map(|c| c()).collect()
                            });
                            for accumulator in accumulators {
                                accumulator.add(&tuple);
                            }
                        }
                        let results = groups
                            .into_iter()
                            .map(|(key, accumulators)| {
                                let mut result = EncodedTuple::default();
                                for (position, value) in key_positions.iter().zip(key) {
                                    if let Some(value) = value {
                                        result.set(*position, value);
                                    }
                                }
                                for (accumulator, position) in
                                    accumulators.into_iter().zip(&accumulator_positions)
                                {
                                    if let Some(value) = accumulator.finish() {
                                        result.set(*position, value);
                                    }
                                }
                                Ok(result)
                            })
                            .collect::<Vec<_>>();
                        stream::iter(errors.into_iter().chain(results).collect::<Vec<_>>()).boxed()
                    }
                    .flatten_stream()
                    .boxed()
                })
            }
            GraphPattern::Path { .. } => {
                return Err(QueryEvaluationError::UnsupportedOperation(
                    "property path".into(),
                ));
            }
            GraphPattern::Service { .. } => {
                return Err(QueryEvaluationError::UnsupportedOperation(
                    "SERVICE".into(),
                ));
            }
        })
    }

    /// Compiles a basic graph pattern to a left-deep chain of streaming inner
    /// joins over per-triple-pattern evaluators, applying each filter conjunct
    /// as soon as all its variables are in scope.
    fn bgp_evaluator(
        &self,
        patterns: &[TriplePattern],
        conjuncts: Vec<Expression>,
        encoded_variables: &mut Vec<Variable>,
        stat_children: &mut Vec<Arc<EvalNodeWithStats>>,
    ) -> Result<TupleEvaluator, QueryEvaluationError> {
        if patterns.is_empty() {
            let mut evaluator: TupleEvaluator =
                Arc::new(|from, _| stream::iter(vec![Ok(from)]).boxed());
            for conjunct in &conjuncts {
                evaluator = self.conjunct_filter_evaluator(
                    evaluator,
                    conjunct,
                    encoded_variables,
                    stat_children,
                )?;
            }
            return Ok(evaluator);
        }

        // Decide after which pattern each conjunct can run
        let mut in_scope = FxHashSet::default();
        let mut conjunct_positions = vec![Vec::new(); patterns.len()];
        let mut residual = Vec::new();
        let mut pending = conjuncts;
        for (i, pattern) in patterns.iter().enumerate() {
            add_pattern_variables(pattern, &mut in_scope);
            let (ready_now, still_pending) = pending.into_iter().partition::<Vec<_>, _>(|c| {
                let mut required = FxHashSet::default();
                add_expression_variables(c, &mut required);
                !contains_exists(c) && required.is_subset(&in_scope)
            });
            conjunct_positions[i] = ready_now;
            pending = still_pending;
        }
        residual.extend(pending);

        let mut evaluator: Option<TupleEvaluator> = None;
        for (pattern, conjuncts) in patterns.iter().zip(conjunct_positions) {
            let leaf = self.triple_pattern_evaluator(pattern, encoded_variables);
            let mut step = match evaluator {
                None => leaf,
                Some(left) => self.join_evaluator(left, leaf),
            };
            for conjunct in &conjuncts {
                step = self.conjunct_filter_evaluator(
                    step,
                    conjunct,
                    encoded_variables,
                    stat_children,
                )?;
            }
            evaluator = Some(step);
        }
        let mut evaluator = evaluator.expect("patterns is not empty");
        for conjunct in &residual {
            evaluator = self.conjunct_filter_evaluator(
                evaluator,
                conjunct,
                encoded_variables,
                stat_children,
            )?;
        }
        Ok(evaluator)
    }

    fn conjunct_filter_evaluator(
        &self,
        child: TupleEvaluator,
        conjunct: &Expression,
        encoded_variables: &mut Vec<Variable>,
        stat_children: &mut Vec<Arc<EvalNodeWithStats>>,
    ) -> Result<TupleEvaluator, QueryEvaluationError> {
        let mut probes = Vec::new();
        let expression = self.effective_boolean_value_evaluator_with_exists(
            conjunct,
            encoded_variables,
            stat_children,
            &mut probes,
        )?;
        Ok(self.filter_evaluator(child, expression, probes))
    }

    fn filter_evaluator(
        &self,
        child: TupleEvaluator,
        expression: BooleanExpressionEvaluatorFn,
        probes: Vec<ExistsProbe>,
    ) -> TupleEvaluator {
        let probes = Arc::new(probes);
        Arc::new(move |from, graph| {
            let expression = Arc::clone(&expression);
            let probes = Arc::clone(&probes);
            let probe_graph = graph.clone();
            child(from, graph)
                .and_then(move |tuple| {
                    let probes = Arc::clone(&probes);
                    let graph = probe_graph.clone();
                    async move { bind_exists_probes(&probes, &graph, tuple).await }
                })
                .filter(move |tuple| {
                    ready(match tuple {
                        // An expression error drops the row
                        Ok(tuple) => expression(tuple).unwrap_or(false),
                        Err(_) => true,
                    })
                })
                .boxed()
        })
    }

    fn join_evaluator(&self, left: TupleEvaluator, right: TupleEvaluator) -> TupleEvaluator {
        let cancellation = self.cancellation.clone();
        Arc::new(move |from, graph| {
            StreamingJoin::new(
                left(from.clone(), graph.clone()),
                right(from, graph),
                InnerJoinStrategy::default(),
                cancellation.clone(),
            )
            .boxed()
        })
    }

    fn triple_pattern_evaluator(
        &self,
        pattern: &TriplePattern,
        encoded_variables: &mut Vec<Variable>,
    ) -> TupleEvaluator {
        let subject_selector = TupleSelector::from_term_pattern(&pattern.subject, encoded_variables);
        let predicate_selector =
            TupleSelector::from_named_node_pattern(&pattern.predicate, encoded_variables);
        let object_selector = TupleSelector::from_term_pattern(&pattern.object, encoded_variables);
        let dataset = self.dataset.clone();
        let cancellation = self.cancellation.clone();
        Arc::new(move |from, graph| {
            let input_subject = subject_selector.get_pattern_value(&from);
            let input_predicate = predicate_selector.get_pattern_value(&from);
            let input_object = object_selector.get_pattern_value(&from);
            let graph_name = match &graph {
                ActiveGraph::Default => None,
                ActiveGraph::Named(term) => Some(term.clone()),
            };
            let iter = dataset.quads_for_pattern(
                input_subject.as_ref(),
                input_predicate.as_ref(),
                input_object.as_ref(),
                Some(graph_name.as_ref()),
            );
            let subject_selector = subject_selector.clone();
            let predicate_selector = predicate_selector.clone();
            let object_selector = object_selector.clone();
            Cancellable::new(
                stream::iter(iter)
                    .map(move |quad| {
                        let quad = quad?;
                        let mut new_tuple = from.clone();
                        if !put_pattern_value(&subject_selector, quad.subject, &mut new_tuple) {
                            return Ok(None);
                        }
                        if !put_pattern_value(&predicate_selector, quad.predicate, &mut new_tuple) {
                            return Ok(None);
                        }
                        if !put_pattern_value(&object_selector, quad.object, &mut new_tuple) {
                            return Ok(None);
                        }
                        Ok(Some(new_tuple))
                    })
                    .filter_map(|tuple| ready(tuple.transpose()))
                    .boxed(),
                cancellation.clone(),
            )
            .boxed()
        })
    }

    fn expression_evaluator_with_exists(
        &self,
        expression: &Expression,
        encoded_variables: &mut Vec<Variable>,
        stat_children: &mut Vec<Arc<EvalNodeWithStats>>,
        probes: &mut Vec<ExistsProbe>,
    ) -> Result<ExpressionEvaluatorFn, QueryEvaluationError> {
        let expression = self.hoist_exists(expression, encoded_variables, stat_children, probes)?;
        Ok(expression_evaluator(
            &expression,
            encoded_variables,
            &self.custom_functions,
        ))
    }

    fn effective_boolean_value_evaluator_with_exists(
        &self,
        expression: &Expression,
        encoded_variables: &mut Vec<Variable>,
        stat_children: &mut Vec<Arc<EvalNodeWithStats>>,
        probes: &mut Vec<ExistsProbe>,
    ) -> Result<BooleanExpressionEvaluatorFn, QueryEvaluationError> {
        let expression = self.hoist_exists(expression, encoded_variables, stat_children, probes)?;
        Ok(effective_boolean_value_expression_evaluator(
            &expression,
            encoded_variables,
            &self.custom_functions,
        ))
    }

    /// Replaces each `EXISTS(pattern)` sub-expression with a reference to a
    /// synthesized variable whose boolean value is bound per row by the
    /// enclosing operator, running the compiled pattern as an asynchronous
    /// probe. All aggregation of the expression stays in a single sync closure.
    fn hoist_exists(
        &self,
        expression: &Expression,
        encoded_variables: &mut Vec<Variable>,
        stat_children: &mut Vec<Arc<EvalNodeWithStats>>,
        probes: &mut Vec<ExistsProbe>,
    ) -> Result<Expression, QueryEvaluationError> {
        Ok(match expression {
            Expression::Exists(pattern) => {
                let (evaluator, stats) =
                    self.graph_pattern_evaluator(pattern, encoded_variables)?;
                stat_children.push(stats);
                let variable = Variable::new_unchecked(format!(
                    "{INTERNAL_VARIABLE_PREFIX}exists:{}",
                    encoded_variables.len()
                ));
                let position = encode_variable(encoded_variables, &variable);
                probes.push(ExistsProbe {
                    position,
                    evaluator,
                });
                Expression::Variable(variable)
            }
            Expression::NamedNode(_)
            | Expression::Literal(_)
            | Expression::Variable(_)
            | Expression::Bound(_) => expression.clone(),
            Expression::Or(a, b) => Expression::Or(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::And(a, b) => Expression::And(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::Equal(a, b) => Expression::Equal(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::SameTerm(a, b) => Expression::SameTerm(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::Greater(a, b) => Expression::Greater(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::GreaterOrEqual(a, b) => Expression::GreaterOrEqual(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::Less(a, b) => Expression::Less(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::LessOrEqual(a, b) => Expression::LessOrEqual(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::In(e, list) => Expression::In(
                Box::new(self.hoist_exists(e, encoded_variables, stat_children, probes)?),
                list.iter()
                    .map(|e| self.hoist_exists(e, encoded_variables, stat_children, probes))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Expression::Add(a, b) => Expression::Add(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::Subtract(a, b) => Expression::Subtract(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::Multiply(a, b) => Expression::Multiply(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::Divide(a, b) => Expression::Divide(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
            ),
            Expression::UnaryPlus(e) => Expression::UnaryPlus(Box::new(self.hoist_exists(
                e,
                encoded_variables,
                stat_children,
                probes,
            )?)),
            Expression::UnaryMinus(e) => Expression::UnaryMinus(Box::new(self.hoist_exists(
                e,
                encoded_variables,
                stat_children,
                probes,
            )?)),
            Expression::Not(e) => Expression::Not(Box::new(self.hoist_exists(
                e,
                encoded_variables,
                stat_children,
                probes,
            )?)),
            Expression::If(a, b, c) => Expression::If(
                Box::new(self.hoist_exists(a, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(b, encoded_variables, stat_children, probes)?),
                Box::new(self.hoist_exists(c, encoded_variables, stat_children, probes)?),
            ),
            Expression::Coalesce(l) => Expression::Coalesce(
                l.iter()
                    .map(|e| self.hoist_exists(e, encoded_variables, stat_children, probes))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Expression::FunctionCall(function, args) => Expression::FunctionCall(
                function.clone(),
                args.iter()
                    .map(|e| self.hoist_exists(e, encoded_variables, stat_children, probes))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        })
    }

    fn accumulator_builder(
        &self,
        expression: &AggregateExpression,
        encoded_variables: &mut Vec<Variable>,
    ) -> Box<dyn Fn() -> AccumulatorWrapper + Send + Sync> {
        match expression {
            AggregateExpression::CountSolutions { distinct } => {
                if *distinct {
                    Box::new(|| AccumulatorWrapper::CountDistinctSolutions {
                        seen: FxHashSet::default(),
                        count: 0,
                    })
                } else {
                    Box::new(|| AccumulatorWrapper::CountSolutions { count: 0 })
                }
            }
            AggregateExpression::FunctionCall {
                name,
                expr,
                distinct,
            } => {
                let evaluator =
                    expression_evaluator(expr, encoded_variables, &self.custom_functions);
                let accumulator: Arc<dyn Fn() -> Option<Box<dyn Accumulator>> + Send + Sync> =
                    match name {
                        AggregateFunction::Count => {
                            Arc::new(|| Some(Box::<CountAccumulator>::default() as _))
                        }
                        AggregateFunction::Sum => {
                            Arc::new(|| Some(Box::<SumAccumulator>::default() as _))
                        }
                        AggregateFunction::Avg => {
                            Arc::new(|| Some(Box::<AvgAccumulator>::default() as _))
                        }
                        AggregateFunction::Min => {
                            Arc::new(|| Some(Box::<MinAccumulator>::default() as _))
                        }
                        AggregateFunction::Max => {
                            Arc::new(|| Some(Box::<MaxAccumulator>::default() as _))
                        }
                        AggregateFunction::Sample => {
                            Arc::new(|| Some(Box::<SampleAccumulator>::default() as _))
                        }
                        AggregateFunction::GroupConcat { separator } => {
                            let separator = Arc::<str>::from(
                                separator.as_deref().unwrap_or(" "),
                            );
                            Arc::new(move || {
                                Some(Box::new(GroupConcatAccumulator::new(Arc::clone(
                                    &separator,
                                ))) as Box<dyn Accumulator>)
                            })
                        }
                        AggregateFunction::Custom(name) => {
                            if let Some(factory) = self.custom_aggregate_functions.get(name) {
                                let factory = Arc::clone(factory);
                                Arc::new(move || {
                                    Some(Box::new(CustomAccumulator {
                                        inner: factory(),
                                    }) as Box<dyn Accumulator>)
                                })
                            } else {
                                Arc::new(|| None)
                            }
                        }
                    };
                let distinct = *distinct;
                Box::new(move || {
                    let Some(accumulator) = accumulator() else {
                        return AccumulatorWrapper::Failing;
                    };
                    if distinct {
                        AccumulatorWrapper::DistinctExpression {
                            seen: FxHashSet::default(),
                            evaluator: Arc::clone(&evaluator),
                            accumulator,
                        }
                    } else {
                        AccumulatorWrapper::Expression {
                            evaluator: Arc::clone(&evaluator),
                            accumulator,
                        }
                    }
                })
            }
        }
    }
}

struct ExistsProbe {
    position: usize,
    evaluator: TupleEvaluator,
}

/// Binds the result of each hoisted EXISTS probe into the row.
///
/// The probe pulls at most one valid row. A probe whose evaluation only
/// produced expression-level failures leaves the synthesized variable unbound
/// so that the residual expression errors, but cancellation is propagated.
async fn bind_exists_probes(
    probes: &[ExistsProbe],
    graph: &ActiveGraph,
    mut tuple: EncodedTuple,
) -> Result<EncodedTuple, QueryEvaluationError> {
    for probe in probes {
        let mut stream = (probe.evaluator)(tuple.clone(), graph.clone());
        let mut found = false;
        let mut saw_error = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(_) => {
                    found = true;
                    break;
                }
                Err(e @ (QueryEvaluationError::Cancelled | QueryEvaluationError::Timeout)) => {
                    return Err(e);
                }
                Err(_) => saw_error = true,
            }
        }
        if found {
            tuple.set(probe.position, Literal::from(true).into());
        } else if !saw_error {
            tuple.set(probe.position, Literal::from(false).into());
        }
    }
    Ok(tuple)
}

/// Pluggable per-row and per-side-exhaustion behaviour of [`StreamingJoin`].
///
/// Strategies own the join buffers. The protocol:
/// a freshly arrived row probes the partner side's buffer and is buffered
/// itself only while the partner side is still producing; when a side
/// finishes, the partner's buffer is dropped since nothing will probe it
/// again.
pub(crate) trait JoinStrategy: Send + 'static {
    fn on_left_row(
        &mut self,
        row: EncodedTuple,
        right_done: bool,
        out: &mut VecDeque<EncodedTuple>,
    );
    fn on_right_row(
        &mut self,
        row: EncodedTuple,
        left_done: bool,
        out: &mut VecDeque<EncodedTuple>,
    );
    fn on_left_done(&mut self, out: &mut VecDeque<EncodedTuple>);
    fn on_right_done(&mut self, out: &mut VecDeque<EncodedTuple>);
}

/// `Join(L, R)`: a row with no compatible partner contributes nothing.
#[derive(Default)]
pub(crate) struct InnerJoinStrategy {
    left_buffer: Vec<EncodedTuple>,
    right_buffer: Vec<EncodedTuple>,
}

impl JoinStrategy for InnerJoinStrategy {
    fn on_left_row(
        &mut self,
        row: EncodedTuple,
        right_done: bool,
        out: &mut VecDeque<EncodedTuple>,
    ) {
        for right_row in &self.right_buffer {
            if let Some(joined) = row.combine_with(right_row) {
                out.push_back(joined);
            }
        }
        if !right_done {
            self.left_buffer.push(row);
        }
    }

    fn on_right_row(
        &mut self,
        row: EncodedTuple,
        left_done: bool,
        out: &mut VecDeque<EncodedTuple>,
    ) {
        for left_row in &self.left_buffer {
            if let Some(joined) = left_row.combine_with(&row) {
                out.push_back(joined);
            }
        }
        if !left_done {
            self.right_buffer.push(row);
        }
    }

    fn on_left_done(&mut self, _out: &mut VecDeque<EncodedTuple>) {
        self.right_buffer = Vec::new();
    }

    fn on_right_done(&mut self, _out: &mut VecDeque<EncodedTuple>) {
        self.left_buffer = Vec::new();
    }
}

/// `LeftJoin(L, R)`: left rows carry an explicit "has ever joined" flag; when
/// the right side finishes, the never-joined ones are emitted unchanged (the
/// right-only variables stay unbound). An optional condition may reject an
/// otherwise-compatible pairing, in which case it neither gets emitted nor
/// marks the left row as joined.
pub(crate) struct LeftJoinStrategy {
    left_buffer: Vec<(EncodedTuple, bool)>,
    right_buffer: Vec<EncodedTuple>,
    filter: Option<BooleanExpressionEvaluatorFn>,
}

impl LeftJoinStrategy {
    pub(crate) fn new(filter: Option<BooleanExpressionEvaluatorFn>) -> Self {
        Self {
            left_buffer: Vec::new(),
            right_buffer: Vec::new(),
            filter,
        }
    }

    fn accepts(&self, joined: &EncodedTuple) -> bool {
        self.filter
            .as_ref()
            .is_none_or(|filter| filter(joined).unwrap_or(false))
    }
}

impl JoinStrategy for LeftJoinStrategy {
    fn on_left_row(
        &mut self,
        row: EncodedTuple,
        right_done: bool,
        out: &mut VecDeque<EncodedTuple>,
    ) {
        let mut joined = false;
        for right_row in &self.right_buffer {
            if let Some(combined) = row.combine_with(right_row) {
                if self.accepts(&combined) {
                    joined = true;
                    out.push_back(combined);
                }
            }
        }
        if !right_done {
            self.left_buffer.push((row, joined));
        } else if !joined {
            out.push_back(row);
        }
    }

    fn on_right_row(
        &mut self,
        row: EncodedTuple,
        left_done: bool,
        out: &mut VecDeque<EncodedTuple>,
    ) {
        for (left_row, left_joined) in &mut self.left_buffer {
            if let Some(combined) = left_row.combine_with(&row) {
                if self
                    .filter
                    .as_ref()
                    .is_none_or(|filter| filter(&combined).unwrap_or(false))
                {
                    *left_joined = true;
                    out.push_back(combined);
                }
            }
        }
        if !left_done {
            self.right_buffer.push(row);
        }
    }

    fn on_left_done(&mut self, _out: &mut VecDeque<EncodedTuple>) {
        self.right_buffer = Vec::new();
    }

    fn on_right_done(&mut self, out: &mut VecDeque<EncodedTuple>) {
        for (left_row, joined) in self.left_buffer.drain(..) {
            if !joined {
                out.push_back(left_row);
            }
        }
        self.left_buffer = Vec::new();
    }
}

enum JoinSide {
    Left,
    Right,
}

/// Streaming binary join driver.
///
/// While both sides are live, each wakeup polls both child streams (alternating
/// which goes first so neither side starves) and hands whichever row settles
/// first to the strategy. Pending emissions are flushed before more input is
/// pulled, and the evaluation terminates once both sides are exhausted and the
/// queue is drained.
pub(crate) struct StreamingJoin<S> {
    left: Option<SolutionStream>,
    right: Option<SolutionStream>,
    strategy: S,
    pending: VecDeque<EncodedTuple>,
    cancellation: Cancellation,
    poll_left_first: bool,
    terminated: bool,
}

impl<S: JoinStrategy> StreamingJoin<S> {
    pub(crate) fn new(
        left: SolutionStream,
        right: SolutionStream,
        strategy: S,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            left: Some(left),
            right: Some(right),
            strategy,
            pending: VecDeque::new(),
            cancellation,
            poll_left_first: true,
            terminated: false,
        }
    }
}

impl<S: JoinStrategy + Unpin> Stream for StreamingJoin<S> {
    type Item = Result<EncodedTuple, QueryEvaluationError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        loop {
            if let Some(row) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(row)));
            }
            if let Err(e) = this.cancellation.check() {
                this.terminated = true;
                return Poll::Ready(Some(Err(e)));
            }
            if this.left.is_none() && this.right.is_none() {
                this.terminated = true;
                return Poll::Ready(None);
            }
            let order = if this.poll_left_first {
                [JoinSide::Left, JoinSide::Right]
            } else {
                [JoinSide::Right, JoinSide::Left]
            };
            this.poll_left_first = !this.poll_left_first;
            let mut progressed = false;
            for side in order {
                let (slot, partner_done) = match side {
                    JoinSide::Left => (&mut this.left, this.right.is_none()),
                    JoinSide::Right => (&mut this.right, this.left.is_none()),
                };
                let Some(stream) = slot else { continue };
                match stream.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(row))) => {
                        progressed = true;
                        match side {
                            JoinSide::Left => {
                                this.strategy.on_left_row(row, partner_done, &mut this.pending)
                            }
                            JoinSide::Right => {
                                this.strategy.on_right_row(row, partner_done, &mut this.pending)
                            }
                        }
                    }
                    Poll::Ready(Some(Err(e))) => {
                        this.terminated = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Ready(None) => {
                        progressed = true;
                        *slot = None;
                        match side {
                            JoinSide::Left => this.strategy.on_left_done(&mut this.pending),
                            JoinSide::Right => this.strategy.on_right_done(&mut this.pending),
                        }
                    }
                    Poll::Pending => (),
                }
                if !this.pending.is_empty() {
                    break;
                }
            }
            if !progressed && this.pending.is_empty() {
                return Poll::Pending;
            }
        }
    }
}

/// Checks the cancellation signal between rows of the wrapped stream.
struct Cancellable {
    inner: SolutionStream,
    cancellation: Cancellation,
    terminated: bool,
}

impl Cancellable {
    fn new(inner: SolutionStream, cancellation: Cancellation) -> Self {
        Self {
            inner,
            cancellation,
            terminated: false,
        }
    }
}

impl Stream for Cancellable {
    type Item = Result<EncodedTuple, QueryEvaluationError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        if let Err(e) = this.cancellation.check() {
            this.terminated = true;
            return Poll::Ready(Some(Err(e)));
        }
        this.inner.poll_next_unpin(cx)
    }
}

#[derive(Clone)]
enum TupleSelector {
    Constant(Term),
    Variable(usize),
}

impl TupleSelector {
    fn from_term_pattern(pattern: &TermPattern, variables: &mut Vec<Variable>) -> Self {
        match pattern {
            TermPattern::NamedNode(term) => Self::Constant(term.clone().into()),
            TermPattern::Literal(term) => Self::Constant(term.clone().into()),
            // Blank nodes in patterns behave as variables scoped to the query
            TermPattern::BlankNode(bnode) => Self::Variable(encode_variable(
                variables,
                &Variable::new_unchecked(format!(
                    "{INTERNAL_VARIABLE_PREFIX}bnode:{}",
                    bnode.as_str()
                )),
            )),
            TermPattern::Variable(variable) => {
                Self::Variable(encode_variable(variables, variable))
            }
        }
    }

    fn from_named_node_pattern(pattern: &NamedNodePattern, variables: &mut Vec<Variable>) -> Self {
        match pattern {
            NamedNodePattern::NamedNode(term) => Self::Constant(term.clone().into()),
            NamedNodePattern::Variable(variable) => {
                Self::Variable(encode_variable(variables, variable))
            }
        }
    }

    fn get_pattern_value(&self, tuple: &EncodedTuple) -> Option<Term> {
        match self {
            Self::Constant(c) => Some(c.clone()),
            Self::Variable(v) => tuple.get(*v).cloned(),
        }
    }
}

fn put_pattern_value(selector: &TupleSelector, value: Term, tuple: &mut EncodedTuple) -> bool {
    match selector {
        TupleSelector::Constant(c) => *c == value,
        TupleSelector::Variable(v) => {
            if let Some(old) = tuple.get(*v) {
                value == *old
            } else {
                tuple.set(*v, value);
                true
            }
        }
    }
}

pub(crate) fn encode_variable(variables: &mut Vec<Variable>, variable: &Variable) -> usize {
    if let Some(key) = variables.iter().position(|v| v == variable) {
        key
    } else {
        variables.push(variable.clone());
        variables.len() - 1
    }
}

fn encode_initial_bindings(
    variables: &[Variable],
    values: impl IntoIterator<Item = (Variable, Term)>,
) -> Result<EncodedTuple, QueryEvaluationError> {
    let mut encoded_terms = EncodedTuple::with_capacity(variables.len());
    for (variable, term) in values {
        let Some(key) = variables.iter().position(|v| *v == variable) else {
            return Err(QueryEvaluationError::NotExistingSubstitutedVariable(
                variable,
            ));
        };
        encoded_terms.set(key, term);
    }
    Ok(encoded_terms)
}

fn split_and(expression: &Expression, out: &mut Vec<Expression>) {
    if let Expression::And(a, b) = expression {
        split_and(a, out);
        split_and(b, out);
    } else {
        out.push(expression.clone());
    }
}

fn contains_exists(expression: &Expression) -> bool {
    match expression {
        Expression::Exists(_) => true,
        Expression::NamedNode(_)
        | Expression::Literal(_)
        | Expression::Variable(_)
        | Expression::Bound(_) => false,
        Expression::Or(a, b)
        | Expression::And(a, b)
        | Expression::Equal(a, b)
        | Expression::SameTerm(a, b)
        | Expression::Greater(a, b)
        | Expression::GreaterOrEqual(a, b)
        | Expression::Less(a, b)
        | Expression::LessOrEqual(a, b)
        | Expression::Add(a, b)
        | Expression::Subtract(a, b)
        | Expression::Multiply(a, b)
        | Expression::Divide(a, b) => contains_exists(a) || contains_exists(b),
        Expression::UnaryPlus(e) | Expression::UnaryMinus(e) | Expression::Not(e) => {
            contains_exists(e)
        }
        Expression::If(a, b, c) => contains_exists(a) || contains_exists(b) || contains_exists(c),
        Expression::In(e, l) => contains_exists(e) || l.iter().any(contains_exists),
        Expression::Coalesce(l) => l.iter().any(contains_exists),
        Expression::FunctionCall(_, l) => l.iter().any(contains_exists),
    }
}

fn add_expression_variables(expression: &Expression, out: &mut FxHashSet<Variable>) {
    match expression {
        Expression::Variable(v) | Expression::Bound(v) => {
            out.insert(v.clone());
        }
        Expression::NamedNode(_) | Expression::Literal(_) => (),
        Expression::Or(a, b)
        | Expression::And(a, b)
        | Expression::Equal(a, b)
        | Expression::SameTerm(a, b)
        | Expression::Greater(a, b)
        | Expression::GreaterOrEqual(a, b)
        | Expression::Less(a, b)
        | Expression::LessOrEqual(a, b)
        | Expression::Add(a, b)
        | Expression::Subtract(a, b)
        | Expression::Multiply(a, b)
        | Expression::Divide(a, b) => {
            add_expression_variables(a, out);
            add_expression_variables(b, out);
        }
        Expression::UnaryPlus(e) | Expression::UnaryMinus(e) | Expression::Not(e) => {
            add_expression_variables(e, out);
        }
        Expression::If(a, b, c) => {
            add_expression_variables(a, out);
            add_expression_variables(b, out);
            add_expression_variables(c, out);
        }
        Expression::In(e, l) => {
            add_expression_variables(e, out);
            for e in l {
                add_expression_variables(e, out);
            }
        }
        Expression::Coalesce(l) | Expression::FunctionCall(_, l) => {
            for e in l {
                add_expression_variables(e, out);
            }
        }
        Expression::Exists(_) => (),
    }
}

fn add_pattern_variables(pattern: &TriplePattern, out: &mut FxHashSet<Variable>) {
    if let TermPattern::Variable(v) = &pattern.subject {
        out.insert(v.clone());
    }
    if let NamedNodePattern::Variable(v) = &pattern.predicate {
        out.insert(v.clone());
    }
    if let TermPattern::Variable(v) = &pattern.object {
        out.insert(v.clone());
    }
}

#[derive(Clone)]
enum ComparatorFunction {
    Asc(ExpressionEvaluatorFn),
    Desc(ExpressionEvaluatorFn),
}

enum AccumulatorWrapper {
    CountSolutions {
        count: i64,
    },
    CountDistinctSolutions {
        seen: FxHashSet<EncodedTuple>,
        count: i64,
    },
    Expression {
        evaluator: ExpressionEvaluatorFn,
        accumulator: Box<dyn Accumulator>,
    },
    DistinctExpression {
        seen: FxHashSet<Term>,
        evaluator: ExpressionEvaluatorFn,
        accumulator: Box<dyn Accumulator>,
    },
    Failing,
}

impl AccumulatorWrapper {
    fn add(&mut self, tuple: &EncodedTuple) {
        match self {
            Self::CountSolutions { count } => {
                *count += 1;
            }
            Self::CountDistinctSolutions { seen, count } => {
                if seen.insert(tuple.clone()) {
                    *count += 1;
                }
            }
            Self::Expression {
                evaluator,
                accumulator,
            } => {
                if let Some(value) = evaluator(tuple) {
                    accumulator.add(value);
                }
            }
            Self::DistinctExpression {
                seen,
                evaluator,
                accumulator,
            } => {
                if let Some(value) = evaluator(tuple) {
                    if seen.insert(value.clone()) {
                        accumulator.add(value);
                    }
                }
            }
            Self::Failing => (),
        }
    }

    fn finish(self) -> Option<Term> {
        match self {
            Self::CountSolutions { count } | Self::CountDistinctSolutions { count, .. } => {
                Some(Literal::from(Integer::from(count)).into())
            }
            Self::Expression {
                mut accumulator, ..
            }
            | Self::DistinctExpression {
                mut accumulator, ..
            } => accumulator.finish(),
            Self::Failing => None,
        }
    }
}

/// Aggregate state machine: create (start), [`add`](Accumulator::add) per
/// element (accept), [`finish`](Accumulator::finish) once the group input is
/// exhausted (end).
trait Accumulator: Send {
    fn add(&mut self, element: Term);

    fn finish(&mut self) -> Option<Term>;
}

#[derive(Default)]
struct CountAccumulator {
    count: i64,
}

impl Accumulator for CountAccumulator {
    fn add(&mut self, _element: Term) {
        self.count += 1;
    }

    fn finish(&mut self) -> Option<Term> {
        Some(Literal::from(Integer::from(self.count)).into())
    }
}

struct SumAccumulator {
    sum: Option<Term>,
}

impl Default for SumAccumulator {
    fn default() -> Self {
        Self {
            sum: Some(Literal::from(Integer::from(0)).into()),
        }
    }
}

impl Accumulator for SumAccumulator {
    fn add(&mut self, element: Term) {
        let Some(sum) = &self.sum else {
            return;
        };
        self.sum = NumericPair::new(sum, &element).and_then(|pair| {
            Some(match pair {
                NumericPair::Integer(v1, v2) => Literal::from(v1.checked_add(v2)?).into(),
                NumericPair::Decimal(v1, v2) => Literal::from(v1.checked_add(v2)?).into(),
                NumericPair::Float(v1, v2) => Literal::from(v1 + v2).into(),
                NumericPair::Double(v1, v2) => Literal::from(v1 + v2).into(),
            })
        });
    }

    fn finish(&mut self) -> Option<Term> {
        self.sum.take()
    }
}

#[derive(Default)]
struct AvgAccumulator {
    sum: SumAccumulator,
    count: i64,
}

impl Accumulator for AvgAccumulator {
    fn add(&mut self, element: Term) {
        self.sum.add(element);
        self.count += 1;
    }

    fn finish(&mut self) -> Option<Term> {
        let sum = self.sum.finish()?;
        if self.count == 0 {
            return Some(Literal::from(Integer::from(0)).into());
        }
        let count = Integer::from(self.count);
        Some(match parse_numeric(&sum)? {
            Numeric::Integer(sum) => Literal::from(Decimal::from(sum).checked_div(count)?).into(),
            Numeric::Decimal(sum) => Literal::from(sum.checked_div(count)?).into(),
            Numeric::Float(sum) => Literal::from(sum / oxsdatatypes::Float::from(count)).into(),
            Numeric::Double(sum) => Literal::from(sum / oxsdatatypes::Double::from(count)).into(),
        })
    }
}

#[derive(Default)]
struct MinAccumulator {
    min: Option<Term>,
}

impl Accumulator for MinAccumulator {
    fn add(&mut self, element: Term) {
        if self
            .min
            .as_ref()
            .is_none_or(|min| cmp_terms(Some(&element), Some(min)) == Ordering::Less)
        {
            self.min = Some(element);
        }
    }

    fn finish(&mut self) -> Option<Term> {
        self.min.take()
    }
}

#[derive(Default)]
struct MaxAccumulator {
    max: Option<Term>,
}

impl Accumulator for MaxAccumulator {
    fn add(&mut self, element: Term) {
        if self
            .max
            .as_ref()
            .is_none_or(|max| cmp_terms(Some(&element), Some(max)) == Ordering::Greater)
        {
            self.max = Some(element);
        }
    }

    fn finish(&mut self) -> Option<Term> {
        self.max.take()
    }
}

#[derive(Default)]
struct SampleAccumulator {
    value: Option<Term>,
}

impl Accumulator for SampleAccumulator {
    fn add(&mut self, element: Term) {
        if self.value.is_none() {
            self.value = Some(element);
        }
    }

    fn finish(&mut self) -> Option<Term> {
        self.value.take()
    }
}

struct GroupConcatAccumulator {
    concat: Option<String>,
    language: Option<Option<String>>,
    separator: Arc<str>,
}

impl GroupConcatAccumulator {
    fn new(separator: Arc<str>) -> Self {
        Self {
            concat: Some(String::new()),
            language: None,
            separator,
        }
    }
}

impl Accumulator for GroupConcatAccumulator {
    fn add(&mut self, element: Term) {
        let Some(concat) = &mut self.concat else {
            return;
        };
        let Term::Literal(literal) = &element else {
            self.concat = None;
            return;
        };
        let element_language = literal.language().map(ToOwned::to_owned);
        if let Some(language) = &mut self.language {
            if *language != element_language {
                *language = None;
            }
            concat.push_str(&self.separator);
        } else {
            self.language = Some(element_language);
        }
        concat.push_str(literal.value());
    }

    fn finish(&mut self) -> Option<Term> {
        self.concat.take().map(|result| {
            if let Some(Some(language)) = self.language.take() {
                Literal::new_language_tagged_literal_unchecked(result, language).into()
            } else {
                Literal::new_simple_literal(result).into()
            }
        })
    }
}

struct CustomAccumulator {
    inner: Box<dyn crate::AggregateFunctionAccumulator + Send + Sync>,
}

impl Accumulator for CustomAccumulator {
    fn add(&mut self, element: Term) {
        self.inner.accumulate(element);
    }

    fn finish(&mut self) -> Option<Term> {
        self.inner.finish()
    }
}

struct TripleTemplate {
    subject: TripleTemplateValue,
    predicate: TripleTemplateValue,
    object: TripleTemplateValue,
}

enum TripleTemplateValue {
    Constant(Term),
    BlankNode(usize),
    Variable(usize),
}

impl TripleTemplateValue {
    fn from_term_pattern(
        term_pattern: &TermPattern,
        variables: &mut Vec<Variable>,
        bnodes: &mut Vec<BlankNode>,
    ) -> Option<Self> {
        Some(match term_pattern {
            TermPattern::NamedNode(term) => Self::Constant(term.clone().into()),
            TermPattern::Literal(term) => Self::Constant(term.clone().into()),
            TermPattern::BlankNode(bnode) => Self::BlankNode(bnode_key(bnodes, bnode)),
            TermPattern::Variable(variable) => {
                Self::Variable(encode_variable(variables, variable))
            }
        })
    }

    fn from_named_node_pattern(
        named_node_pattern: &NamedNodePattern,
        variables: &mut Vec<Variable>,
    ) -> Self {
        match named_node_pattern {
            NamedNodePattern::NamedNode(term) => Self::Constant(term.clone().into()),
            NamedNodePattern::Variable(variable) => {
                Self::Variable(encode_variable(variables, variable))
            }
        }
    }

    fn evaluate(&self, tuple: &EncodedTuple, bnodes: &[BlankNode]) -> Option<Term> {
        match self {
            Self::Constant(term) => Some(term.clone()),
            Self::BlankNode(bnode) => Some(bnodes[*bnode].clone().into()),
            Self::Variable(variable) => tuple.get(*variable).cloned(),
        }
    }
}

fn term_to_subject(term: Term) -> Option<NamedOrBlankNode> {
    match term {
        Term::NamedNode(node) => Some(node.into()),
        Term::BlankNode(node) => Some(node.into()),
        _ => None,
    }
}

fn bnode_key(blank_nodes: &mut Vec<BlankNode>, blank_node: &BlankNode) -> usize {
    if let Some(key) = blank_nodes.iter().position(|b| b == blank_node) {
        key
    } else {
        blank_nodes.push(blank_node.clone());
        blank_nodes.len() - 1
    }
}

struct StatsStream {
    inner: SolutionStream,
    stats: Arc<EvalNodeWithStats>,
}

impl Stream for StatsStream {
    type Item = Result<EncodedTuple, QueryEvaluationError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let start = Instant::now();
        let result = this.inner.poll_next_unpin(cx);
        this.stats.exec_duration_micros.fetch_add(
            u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX),
            AtomicOrdering::Relaxed,
        );
        if matches!(result, Poll::Ready(Some(_))) {
            this.stats.exec_count.fetch_add(1, AtomicOrdering::Relaxed);
        }
        result
    }
}

/// One node of the query explanation tree, with its execution statistics.
pub struct EvalNodeWithStats {
    pub(crate) label: String,
    pub(crate) children: Vec<Arc<EvalNodeWithStats>>,
    pub(crate) exec_count: AtomicU64,
    pub(crate) exec_duration_micros: AtomicU64,
}

impl EvalNodeWithStats {
    pub(crate) fn json_node(
        &self,
        serializer: &mut WriterJsonSerializer<impl io::Write>,
        with_stats: bool,
    ) -> io::Result<()> {
        serializer.serialize_event(JsonEvent::StartObject)?;
        serializer.serialize_event(JsonEvent::ObjectKey("name".into()))?;
        serializer.serialize_event(JsonEvent::String(self.label.as_str().into()))?;
        if with_stats {
            serializer.serialize_event(JsonEvent::ObjectKey("number of results".into()))?;
            serializer.serialize_event(JsonEvent::Number(
                self.exec_count.load(AtomicOrdering::Relaxed).to_string().into(),
            ))?;
            serializer.serialize_event(JsonEvent::ObjectKey("duration in seconds".into()))?;
            serializer.serialize_event(JsonEvent::Number(
                (self.exec_duration_micros.load(AtomicOrdering::Relaxed) as f64 / 1_000_000.)
                    .to_string()
                    .into(),
            ))?;
        }
        serializer.serialize_event(JsonEvent::ObjectKey("children".into()))?;
        serializer.serialize_event(JsonEvent::StartArray)?;
        for child in &self.children {
            child.json_node(serializer, with_stats)?;
        }
        serializer.serialize_event(JsonEvent::EndArray)?;
        serializer.serialize_event(JsonEvent::EndObject)
    }
}

impl fmt::Debug for EvalNodeWithStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut obj = f.debug_struct("Node");
        obj.field("name", &self.label);
        let exec_count = self.exec_count.load(AtomicOrdering::Relaxed);
        if exec_count > 0 {
            obj.field("number of results", &exec_count);
        }
        if !self.children.is_empty() {
            obj.field("children", &self.children);
        }
        obj.finish()
    }
}

fn eval_node_label(pattern: &GraphPattern) -> String {
    match pattern {
        GraphPattern::Bgp { patterns } => format!("BGP({} patterns)", patterns.len()),
        GraphPattern::Path { .. } => "Path".into(),
        GraphPattern::Join { .. } => "Join".into(),
        GraphPattern::LeftJoin { expression, .. } => {
            if expression.is_some() {
                "LeftJoin(with condition)".into()
            } else {
                "LeftJoin".into()
            }
        }
        GraphPattern::Filter { .. } => "Filter".into(),
        GraphPattern::Union { .. } => "Union".into(),
        GraphPattern::Graph { name, .. } => format!("Graph({name})"),
        GraphPattern::Extend { variable, .. } => format!("Extend({variable})"),
        GraphPattern::Minus { .. } => "Minus".into(),
        GraphPattern::Values { bindings, .. } => format!("Values({} rows)", bindings.len()),
        GraphPattern::OrderBy { .. } => "OrderBy".into(),
        GraphPattern::Project { variables, .. } => format!(
            "Project({})",
            variables
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        ),
        GraphPattern::Distinct { .. } => "Distinct".into(),
        GraphPattern::Reduced { .. } => "Reduced".into(),
        GraphPattern::Slice { start, length, .. } => format!("Slice(start={start}, length={length:?})"),
        GraphPattern::Group { variables, .. } => format!(
            "Aggregate({})",
            variables
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        ),
        GraphPattern::Service { .. } => "Service".into(),
    }
}
