use oxrdf::Variable;
use std::convert::Infallible;
use std::error::Error;

/// A SPARQL evaluation error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum QueryEvaluationError {
    /// Error from the underlying RDF dataset
    #[error(transparent)]
    Dataset(Box<dyn Error + Send + Sync>),
    /// The algebra tree contains a node kind this evaluator does not support
    #[error("The query contains an unsupported operation: {0}")]
    UnsupportedOperation(String),
    /// If a variable present in the given initial substitution is not present in the `SELECT` part of the query
    #[error("The SPARQL query does not contains variable {0} in its SELECT projection")]
    NotExistingSubstitutedVariable(Variable),
    /// A `BIND` target variable was already bound by an upstream operator
    #[error("The variable {0} is already bound and cannot be bound again")]
    VariableAlreadyBound(Variable),
    /// Error if the dataset returns the default graph even if a named graph is expected
    #[error("The SPARQL dataset returned the default graph even if a named graph is expected")]
    UnexpectedDefaultGraph,
    /// The configured maximum number of result rows has been exceeded
    #[error("The query produced more than {0} result rows")]
    TooManyResults(usize),
    /// The configured maximum number of `GROUP BY` groups has been exceeded
    #[error("The query created more than {0} groups")]
    TooManyGroups(usize),
    #[error("The SPARQL operation has been cancelled")]
    Cancelled,
    #[error("The SPARQL operation timed out")]
    Timeout,
    #[doc(hidden)]
    #[error(transparent)]
    Unexpected(Box<dyn Error + Send + Sync>),
}

impl From<Infallible> for QueryEvaluationError {
    #[inline]
    fn from(error: Infallible) -> Self {
        match error {}
    }
}
