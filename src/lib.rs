#![doc = include_str!("../README.md")]
#![doc(test(attr(deny(warnings))))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod dataset;
mod error;
mod eval;
mod expression;
mod limits;
mod model;

pub use crate::dataset::{EvalQuad, QueryableDataset};
pub use crate::error::QueryEvaluationError;
pub use crate::eval::CancellationToken;
use crate::eval::{Cancellation, EvalNodeWithStats, SimpleEvaluator};
pub use crate::limits::QueryExecutionLimits;
pub use crate::model::{QueryResults, QuerySolution, QuerySolutionStream, QueryTripleStream};
use futures::future::ready;
use futures::StreamExt;
use json_event_parser::{JsonEvent, WriterJsonSerializer};
use oxrdf::{NamedNode, Term, Variable};
use spargebra::Query;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fmt, io};

/// Evaluates a query against a given [RDF dataset](https://www.w3.org/TR/rdf11-concepts/#dfn-rdf-dataset)
///
/// Note that this evaluator does not handle the `FROM` and `FROM NAMED` part of the query.
/// You must select the proper dataset before using this struct.
///
/// To adapt this software to work on your own RDF dataset, you need to implement the [`QueryableDataset`] trait.
///
/// ```
/// use oxrdf::{Dataset, GraphName, NamedNode, Quad};
/// use sparpull::{QueryEvaluator, QueryResults};
/// use spargebra::SparqlParser;
/// use futures::StreamExt;
///
/// # futures::executor::block_on(async {
/// let ex = NamedNode::new("http://example.com")?;
/// let dataset = Dataset::from_iter([Quad::new(
///     ex.clone(),
///     ex.clone(),
///     ex.clone(),
///     GraphName::DefaultGraph,
/// )]);
/// let query = SparqlParser::new().parse_query("SELECT * WHERE { ?s ?p ?o }")?;
/// let results = QueryEvaluator::new().execute(dataset, &query).await;
/// if let QueryResults::Solutions(solutions) = results? {
///     let solutions = solutions.collect::<Vec<_>>().await;
///     assert_eq!(solutions.len(), 1);
///     assert_eq!(solutions[0].as_ref().unwrap()["s"], ex.into());
/// }
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// # }).unwrap();
/// ```
#[derive(Clone, Default)]
pub struct QueryEvaluator {
    custom_functions: CustomFunctionRegistry,
    custom_aggregate_functions: CustomAggregateFunctionRegistry,
    limits: Option<QueryExecutionLimits>,
    run_stats: bool,
    cancellation_token: Option<CancellationToken>,
}

impl QueryEvaluator {
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn execute(
        &self,
        dataset: impl QueryableDataset,
        query: &Query,
    ) -> Result<QueryResults, QueryEvaluationError> {
        self.explain(dataset, query).await.0
    }

    /// Executes a SPARQL query while substituting some variables with the given values.
    ///
    /// Substitution follows [RDF-dev SEP-0007](https://github.com/w3c/sparql-dev/blob/main/SEP/SEP-0007/sep-0007.md).
    ///
    /// ```
    /// use oxrdf::{Dataset, GraphName, NamedNode, Quad, Variable};
    /// use sparpull::{QueryEvaluator, QueryResults};
    /// use spargebra::SparqlParser;
    /// use futures::StreamExt;
    ///
    /// # futures::executor::block_on(async {
    /// let ex = NamedNode::new("http://example.com")?;
    /// let dataset = Dataset::from_iter([Quad::new(
    ///     ex.clone(),
    ///     ex.clone(),
    ///     ex.clone(),
    ///     GraphName::DefaultGraph,
    /// )]);
    /// let query = SparqlParser::new().parse_query("SELECT * WHERE { ?s ?p ?o }")?;
    /// let results = QueryEvaluator::new()
    ///     .execute_with_substituted_variables(
    ///         dataset,
    ///         &query,
    ///         [(Variable::new("s")?, ex.clone().into())],
    ///     )
    ///     .await;
    /// if let QueryResults::Solutions(solutions) = results? {
    ///     let solutions = solutions.collect::<Vec<_>>().await;
    ///     assert_eq!(solutions.len(), 1);
    ///     assert_eq!(solutions[0].as_ref().unwrap()["s"], ex.into());
    /// }
    /// # Result::<_, Box<dyn std::error::Error>>::Ok(())
    /// # }).unwrap();
    /// ```
    pub async fn execute_with_substituted_variables(
        &self,
        dataset: impl QueryableDataset,
        query: &Query,
        substitutions: impl IntoIterator<Item = (Variable, Term)>,
    ) -> Result<QueryResults, QueryEvaluationError> {
        self.explain_with_substituted_variables(dataset, query, substitutions)
            .await
            .0
    }

    pub async fn explain(
        &self,
        dataset: impl QueryableDataset,
        query: &Query,
    ) -> (
        Result<QueryResults, QueryEvaluationError>,
        QueryExplanation,
    ) {
        self.explain_with_substituted_variables(dataset, query, [])
            .await
    }

    pub async fn explain_with_substituted_variables(
        &self,
        dataset: impl QueryableDataset,
        query: &Query,
        substitutions: impl IntoIterator<Item = (Variable, Term)>,
    ) -> (
        Result<QueryResults, QueryEvaluationError>,
        QueryExplanation,
    ) {
        let limits = self
            .limits
            .clone()
            .unwrap_or_else(QueryExecutionLimits::unlimited);
        let evaluator = SimpleEvaluator::new(
            dataset,
            Arc::new(self.custom_functions.clone()),
            Arc::new(self.custom_aggregate_functions.clone()),
            Cancellation::new(
                self.cancellation_token.clone().unwrap_or_default(),
                limits.timeout,
            ),
            limits.max_groups,
            self.run_stats,
        );
        let start_planning = Instant::now();
        let (results, stats) = match query {
            Query::Select { pattern, .. } => {
                match evaluator.evaluate_select(pattern, substitutions) {
                    Ok((solutions, stats)) => {
                        let solutions = if let Some(max) = limits.max_result_rows {
                            limit_result_rows(solutions, max)
                        } else {
                            solutions
                        };
                        (Ok(QueryResults::Solutions(solutions)), Some(stats))
                    }
                    Err(e) => (Err(e), None),
                }
            }
            Query::Ask { pattern, .. } => match evaluator.evaluate_ask(pattern, substitutions).await
            {
                Ok((result, stats)) => (Ok(QueryResults::Boolean(result)), Some(stats)),
                Err(e) => (Err(e), None),
            },
            Query::Construct {
                template, pattern, ..
            } => match evaluator.evaluate_construct(pattern, template, substitutions) {
                Ok((triples, stats)) => (Ok(QueryResults::Graph(triples)), Some(stats)),
                Err(e) => (Err(e), None),
            },
            Query::Describe { pattern, .. } => {
                match evaluator.evaluate_describe(pattern, substitutions) {
                    Ok((triples, stats)) => (Ok(QueryResults::Graph(triples)), Some(stats)),
                    Err(e) => (Err(e), None),
                }
            }
        };
        let explanation = QueryExplanation {
            inner: stats,
            with_stats: self.run_stats,
            planning_duration: start_planning.elapsed(),
        };
        (results, explanation)
    }

    /// Adds a custom SPARQL evaluation function.
    ///
    /// Example with a function serializing terms to N-Triples:
    /// ```
    /// use oxrdf::{Dataset, Literal, NamedNode};
    /// use sparpull::{QueryEvaluator, QueryResults};
    /// use spargebra::SparqlParser;
    /// use futures::StreamExt;
    ///
    /// # futures::executor::block_on(async {
    /// let evaluator = QueryEvaluator::new().with_custom_function(
    ///     NamedNode::new("http://www.w3.org/ns/formats/N-Triples")?,
    ///     |args| args.get(0).map(|t| Literal::from(t.to_string()).into()),
    /// );
    /// let query = SparqlParser::new()
    ///     .parse_query("SELECT (<http://www.w3.org/ns/formats/N-Triples>(1) AS ?nt) WHERE {}")?;
    /// if let QueryResults::Solutions(mut solutions) =
    ///     evaluator.execute(Dataset::new(), &query).await?
    /// {
    ///     assert_eq!(
    ///         solutions.next().await.unwrap()?.get("nt"),
    ///         Some(&Literal::from("\"1\"^^<http://www.w3.org/2001/XMLSchema#integer>").into())
    ///     );
    /// }
    /// # Result::<_, Box<dyn std::error::Error>>::Ok(())
    /// # }).unwrap();
    /// ```
    #[inline]
    #[must_use]
    pub fn with_custom_function(
        mut self,
        name: NamedNode,
        evaluator: impl Fn(&[Term]) -> Option<Term> + Send + Sync + 'static,
    ) -> Self {
        self.custom_functions.insert(name, Arc::new(evaluator));
        self
    }

    /// Adds a custom SPARQL evaluation aggregate function.
    ///
    /// Note that it must also be given to the SPARQL parser using [`SparqlParser::with_custom_aggregate_function`](spargebra::SparqlParser::with_custom_aggregate_function).
    ///
    /// Example with a function doing concatenation:
    /// ```
    /// use oxrdf::{Dataset, Literal, NamedNode, Term};
    /// use sparpull::{AggregateFunctionAccumulator, QueryEvaluator, QueryResults};
    /// use spargebra::SparqlParser;
    /// use futures::StreamExt;
    /// use std::mem::take;
    ///
    /// struct ConcatAccumulator {
    ///     value: String,
    /// }
    ///
    /// impl AggregateFunctionAccumulator for ConcatAccumulator {
    ///     fn accumulate(&mut self, element: Term) {
    ///         if let Term::Literal(v) = element {
    ///             if !self.value.is_empty() {
    ///                 self.value.push(' ');
    ///             }
    ///             self.value.push_str(v.value());
    ///         }
    ///     }
    ///
    ///     fn finish(&mut self) -> Option<Term> {
    ///         Some(Literal::new_simple_literal(take(&mut self.value)).into())
    ///     }
    /// }
    ///
    /// # futures::executor::block_on(async {
    /// let evaluator = QueryEvaluator::new().with_custom_aggregate_function(
    ///     NamedNode::new("http://example.com/concat")?,
    ///     || {
    ///         Box::new(ConcatAccumulator {
    ///             value: String::new(),
    ///         })
    ///     },
    /// );
    /// let query = SparqlParser::new()
    ///     .with_custom_aggregate_function(NamedNode::new("http://example.com/concat")?)
    ///     .parse_query(
    ///         "SELECT (<http://example.com/concat>(?v) AS ?r) WHERE { VALUES ?v { 1 2 3 } }",
    ///     )?;
    /// if let QueryResults::Solutions(mut solutions) =
    ///     evaluator.execute(Dataset::new(), &query).await?
    /// {
    ///     assert_eq!(
    ///         solutions.next().await.unwrap()?.get("r"),
    ///         Some(&Literal::new_simple_literal("1 2 3").into())
    ///     );
    /// }
    /// # Result::<_, Box<dyn std::error::Error>>::Ok(())
    /// # }).unwrap();
    /// ```
    #[inline]
    #[must_use]
    pub fn with_custom_aggregate_function(
        mut self,
        name: NamedNode,
        evaluator: impl Fn() -> Box<dyn AggregateFunctionAccumulator + Send + Sync>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.custom_aggregate_functions
            .insert(name, Arc::new(evaluator));
        self
    }

    /// Applies the given [resource limits](QueryExecutionLimits) to the evaluation.
    ///
    /// The timeout limit is translated into a cancellation trigger: once it
    /// elapses, the evaluation stops with [`QueryEvaluationError::Timeout`].
    ///
    /// By default no limit is enforced.
    #[inline]
    #[must_use]
    pub fn with_limits(mut self, limits: QueryExecutionLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Compute statistics during evaluation and fills them in the explanation tree.
    #[inline]
    #[must_use]
    pub fn compute_statistics(mut self) -> Self {
        self.run_stats = true;
        self
    }

    /// Inject a cancellation token to the SPARQL evaluation.
    ///
    /// Might be used to abort a query cleanly.
    ///
    /// ```
    /// use oxrdf::{Dataset, GraphName, NamedNode, Quad};
    /// use sparpull::{CancellationToken, QueryEvaluationError, QueryEvaluator, QueryResults};
    /// use spargebra::SparqlParser;
    /// use futures::StreamExt;
    ///
    /// # futures::executor::block_on(async {
    /// let ex = NamedNode::new("http://example.com")?;
    /// let dataset = Dataset::from_iter([Quad::new(
    ///     ex.clone(),
    ///     ex.clone(),
    ///     ex.clone(),
    ///     GraphName::DefaultGraph,
    /// )]);
    /// let query = SparqlParser::new().parse_query("SELECT * WHERE { ?s ?p ?o }")?;
    /// let cancellation_token = CancellationToken::new();
    /// let results = QueryEvaluator::new()
    ///     .with_cancellation_token(cancellation_token.clone())
    ///     .execute(dataset, &query)
    ///     .await;
    /// if let QueryResults::Solutions(mut solutions) = results? {
    ///     cancellation_token.cancel(); // We cancel
    ///     assert!(matches!(
    ///         solutions.next().await.unwrap().unwrap_err(), // It's cancelled
    ///         QueryEvaluationError::Cancelled
    ///     ));
    /// }
    /// # Result::<_, Box<dyn std::error::Error>>::Ok(())
    /// # }).unwrap();
    /// ```
    #[must_use]
    pub fn with_cancellation_token(mut self, cancellation_token: CancellationToken) -> Self {
        self.cancellation_token = Some(cancellation_token);
        self
    }
}

pub(crate) type CustomFunctionRegistry =
    HashMap<NamedNode, Arc<dyn (Fn(&[Term]) -> Option<Term>) + Send + Sync>>;
pub(crate) type CustomAggregateFunctionRegistry = HashMap<
    NamedNode,
    Arc<dyn (Fn() -> Box<dyn AggregateFunctionAccumulator + Send + Sync>) + Send + Sync>,
>;

/// A trait for custom aggregate function implementation.
///
/// The accumulator accumulates values using the [`accumulate`](Self::accumulate) method
/// and returns a final aggregated value (or an error) using [`finish`](Self::finish).
///
/// See [`QueryEvaluator::with_custom_aggregate_function`] for an example.
pub trait AggregateFunctionAccumulator {
    fn accumulate(&mut self, element: Term);
    fn finish(&mut self) -> Option<Term>;
}

fn limit_result_rows(solutions: QuerySolutionStream, max: usize) -> QuerySolutionStream {
    let variables: Arc<[Variable]> = solutions.variables().into();
    QuerySolutionStream::new(
        variables,
        solutions.scan((0_usize, false), move |(count, failed), solution| {
            if *failed {
                return ready(None);
            }
            if solution.is_ok() {
                *count += 1;
                if *count > max {
                    *failed = true;
                    return ready(Some(Err(QueryEvaluationError::TooManyResults(max))));
                }
            }
            ready(Some(solution))
        }),
    )
}

/// The explanation of a query.
pub struct QueryExplanation {
    inner: Option<Arc<EvalNodeWithStats>>,
    with_stats: bool,
    planning_duration: Duration,
}

impl QueryExplanation {
    /// Writes the explanation as JSON.
    pub fn write_in_json(&self, writer: impl io::Write) -> io::Result<()> {
        let mut serializer = WriterJsonSerializer::new(writer);
        serializer.serialize_event(JsonEvent::StartObject)?;
        serializer.serialize_event(JsonEvent::ObjectKey("planning duration in seconds".into()))?;
        serializer.serialize_event(JsonEvent::Number(
            self.planning_duration.as_secs_f64().to_string().into(),
        ))?;
        if let Some(inner) = &self.inner {
            serializer.serialize_event(JsonEvent::ObjectKey("plan".into()))?;
            inner.json_node(&mut serializer, self.with_stats)?;
        }
        serializer.serialize_event(JsonEvent::EndObject)
    }
}

impl fmt::Debug for QueryExplanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut obj = f.debug_struct("QueryExplanation");
        obj.field("planning duration in seconds", &self.planning_duration);
        if let Some(inner) = &self.inner {
            obj.field("tree", inner);
        }
        obj.finish_non_exhaustive()
    }
}
