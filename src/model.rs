use crate::error::QueryEvaluationError;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use oxrdf::{Term, Triple, Variable};
pub use sparesults::QuerySolution;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Results of a [SPARQL query](https://www.w3.org/TR/sparql11-query/).
pub enum QueryResults {
    /// Results of a [SELECT](https://www.w3.org/TR/sparql11-query/#select) query.
    Solutions(QuerySolutionStream),
    /// Result of a [ASK](https://www.w3.org/TR/sparql11-query/#ask) query.
    Boolean(bool),
    /// Results of a [CONSTRUCT](https://www.w3.org/TR/sparql11-query/#construct) or [DESCRIBE](https://www.w3.org/TR/sparql11-query/#describe) query.
    Graph(QueryTripleStream),
}

impl From<QuerySolutionStream> for QueryResults {
    #[inline]
    fn from(value: QuerySolutionStream) -> Self {
        Self::Solutions(value)
    }
}

impl From<bool> for QueryResults {
    #[inline]
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<QueryTripleStream> for QueryResults {
    #[inline]
    fn from(value: QueryTripleStream) -> Self {
        Self::Graph(value)
    }
}

/// An asynchronous stream of [`QuerySolution`]s.
///
/// Solutions are produced on demand: nothing is evaluated until the stream is polled,
/// and dropping the stream cancels the remaining evaluation.
///
/// ```
/// use futures::StreamExt;
/// use oxrdf::Dataset;
/// use sparpull::{QueryEvaluator, QueryResults};
/// use spargebra::SparqlParser;
///
/// # futures::executor::block_on(async {
/// let query = SparqlParser::new().parse_query("SELECT ?s ?o WHERE { ?s ?p ?o }")?;
/// if let QueryResults::Solutions(mut solutions) =
///     QueryEvaluator::new().execute(Dataset::new(), &query).await?
/// {
///     while let Some(solution) = solutions.next().await {
///         println!("{:?}", solution?.get("s"));
///     }
/// }
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// # }).unwrap();
/// ```
pub struct QuerySolutionStream {
    variables: Arc<[Variable]>,
    inner: BoxStream<'static, Result<QuerySolution, QueryEvaluationError>>,
}

impl QuerySolutionStream {
    /// Construct a new stream of solutions from an ordered list of solution variables and a stream of solutions
    pub fn new(
        variables: Arc<[Variable]>,
        inner: impl Stream<Item = Result<QuerySolution, QueryEvaluationError>> + Send + 'static,
    ) -> Self {
        Self {
            variables,
            inner: inner.boxed(),
        }
    }

    /// Construct a new stream of solutions from an ordered list of solution variables and a stream of solution tuples
    /// (each tuple using the same ordering as the variable list such that tuple element 0 is the value for the variable 0...)
    pub fn from_tuples(
        variables: Arc<[Variable]>,
        inner: impl Stream<Item = Result<Vec<Option<Term>>, QueryEvaluationError>> + Send + 'static,
    ) -> Self {
        let stream_variables = Arc::clone(&variables);
        Self {
            variables,
            inner: inner
                .map(move |values| Ok((Arc::clone(&stream_variables), values?).into()))
                .boxed(),
        }
    }

    /// The variables used in the solutions.
    ///
    /// ```
    /// use oxrdf::{Dataset, Variable};
    /// use sparpull::{QueryEvaluator, QueryResults};
    /// use spargebra::SparqlParser;
    ///
    /// # futures::executor::block_on(async {
    /// let query = SparqlParser::new().parse_query("SELECT ?s ?o WHERE { ?s ?p ?o }")?;
    /// if let QueryResults::Solutions(solutions) =
    ///     QueryEvaluator::new().execute(Dataset::new(), &query).await?
    /// {
    ///     assert_eq!(
    ///         solutions.variables(),
    ///         &[Variable::new("s")?, Variable::new("o")?]
    ///     );
    /// }
    /// # Result::<_, Box<dyn std::error::Error>>::Ok(())
    /// # }).unwrap();
    /// ```
    #[inline]
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }
}

impl Stream for QuerySolutionStream {
    type Item = Result<QuerySolution, QueryEvaluationError>;

    #[inline]
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// An asynchronous stream of the [`Triple`]s that compose a graph solution.
///
/// ```
/// use futures::StreamExt;
/// use oxrdf::Dataset;
/// use sparpull::{QueryEvaluator, QueryResults};
/// use spargebra::SparqlParser;
///
/// # futures::executor::block_on(async {
/// let query = SparqlParser::new().parse_query("CONSTRUCT WHERE { ?s ?p ?o }")?;
/// if let QueryResults::Graph(mut triples) =
///     QueryEvaluator::new().execute(Dataset::new(), &query).await?
/// {
///     while let Some(triple) = triples.next().await {
///         println!("{}", triple?);
///     }
/// }
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// # }).unwrap();
/// ```
pub struct QueryTripleStream {
    inner: BoxStream<'static, Result<Triple, QueryEvaluationError>>,
}

impl QueryTripleStream {
    pub(crate) fn new(
        inner: impl Stream<Item = Result<Triple, QueryEvaluationError>> + Send + 'static,
    ) -> Self {
        Self {
            inner: inner.boxed(),
        }
    }
}

impl Stream for QueryTripleStream {
    type Item = Result<Triple, QueryEvaluationError>;

    #[inline]
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
