use oxrdf::{Dataset, GraphNameRef, NamedOrBlankNodeRef, Term, TermRef};
use rustc_hash::FxHashSet;
use std::convert::Infallible;
use std::error::Error;
use std::iter::empty;

/// A [RDF dataset](https://www.w3.org/TR/sparql11-query/#rdfDataset) that can be queried using SPARQL
///
/// The evaluator calls [`quads_for_pattern`](QueryableDataset::quads_for_pattern) with the pattern
/// positions that are already bound, and scans the returned sequence.
/// The returned iterators must be usable while other lookups triggered by the same query are still
/// in progress: a join advances both of its operands concurrently, so two scans of the same dataset
/// are routinely interleaved.
pub trait QueryableDataset: Send + Sync + 'static {
    /// Error returned by the dataset.
    type Error: Error + Send + Sync + 'static;

    /// Fetches quads according to a pattern
    ///
    /// For `graph_name`, `None` encodes "any graph", `Some(None)` the default graph
    /// and `Some(Some(_))` a named graph.
    fn quads_for_pattern(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        graph_name: Option<Option<&Term>>,
    ) -> Box<dyn Iterator<Item = Result<EvalQuad, Self::Error>> + Send>;

    /// Fetches the list of dataset named graphs
    fn named_graphs(&self) -> Box<dyn Iterator<Item = Result<Term, Self::Error>> + Send> {
        let mut error = None;
        let graph_names = self
            .quads_for_pattern(None, None, None, None)
            .filter_map(|r| match r {
                Ok(r) => Some(r.graph_name?),
                Err(e) => {
                    error = Some(e);
                    None
                }
            })
            .collect::<FxHashSet<_>>();
        Box::new(
            error
                .map(Err)
                .into_iter()
                .chain(graph_names.into_iter().map(Ok)),
        )
    }

    /// Returns if the dataset contains a given named graph
    fn contains_named_graph(&self, graph_name: &Term) -> Result<bool, Self::Error> {
        Ok(self
            .quads_for_pattern(None, None, None, Some(Some(graph_name)))
            .next()
            .transpose()?
            .is_some())
    }
}

/// A quad returned by a [`QueryableDataset`] lookup
///
/// `graph_name` is `None` for the default graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EvalQuad {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
    pub graph_name: Option<Term>,
}

impl QueryableDataset for Dataset {
    type Error = Infallible;

    fn quads_for_pattern(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        graph_name: Option<Option<&Term>>,
    ) -> Box<dyn Iterator<Item = Result<EvalQuad, Infallible>> + Send> {
        fn quad_to_result(
            subject: NamedOrBlankNodeRef<'_>,
            predicate: TermRef<'_>,
            object: TermRef<'_>,
            graph_name: GraphNameRef<'_>,
        ) -> Result<EvalQuad, Infallible> {
            Ok(EvalQuad {
                subject: TermRef::from(subject).into_owned(),
                predicate: predicate.into_owned(),
                object: object.into_owned(),
                graph_name: match graph_name {
                    GraphNameRef::NamedNode(g) => Some(TermRef::from(g).into_owned()),
                    GraphNameRef::BlankNode(g) => Some(TermRef::from(g).into_owned()),
                    GraphNameRef::DefaultGraph => None,
                },
            })
        }

        // A literal can never match the subject or predicate position
        if let Some(Term::Literal(_)) = subject {
            return Box::new(empty());
        }
        match predicate {
            Some(Term::NamedNode(_)) | None => (),
            Some(_) => return Box::new(empty()),
        }
        if let Some(Some(graph_name)) = graph_name {
            if matches!(graph_name, Term::Literal(_)) {
                return Box::new(empty());
            }
        }

        // The in-memory dataset only hands out borrowing iterators, so the matching
        // quads are materialized eagerly. Real stores should stream instead.
        let quads = self
            .iter()
            .filter(|quad| {
                subject
                    .as_ref()
                    .is_none_or(|t| TermRef::from(*t) == quad.subject.into())
                    && predicate
                        .as_ref()
                        .is_none_or(|t| TermRef::from(*t) == quad.predicate.into())
                    && object.as_ref().is_none_or(|t| TermRef::from(*t) == quad.object)
                    && match graph_name {
                        None => true,
                        Some(None) => quad.graph_name.is_default_graph(),
                        Some(Some(g)) => match quad.graph_name {
                            GraphNameRef::NamedNode(n) => TermRef::from(g) == n.into(),
                            GraphNameRef::BlankNode(n) => TermRef::from(g) == n.into(),
                            GraphNameRef::DefaultGraph => false,
                        },
                    }
            })
            .map(|quad| quad_to_result(quad.subject, quad.predicate.into(), quad.object, quad.graph_name))
            .collect::<Vec<_>>();
        Box::new(quads.into_iter())
    }

    fn named_graphs(&self) -> Box<dyn Iterator<Item = Result<Term, Infallible>> + Send> {
        let graph_names = self
            .iter()
            .filter_map(|quad| match quad.graph_name {
                GraphNameRef::NamedNode(g) => Some(TermRef::from(g).into_owned()),
                GraphNameRef::BlankNode(g) => Some(TermRef::from(g).into_owned()),
                GraphNameRef::DefaultGraph => None,
            })
            .collect::<FxHashSet<_>>();
        Box::new(graph_names.into_iter().map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxrdf::{GraphName, NamedNode, Quad};

    fn example_dataset() -> Dataset {
        let s = NamedNode::new_unchecked("http://example.com/s");
        let p = NamedNode::new_unchecked("http://example.com/p");
        let o = NamedNode::new_unchecked("http://example.com/o");
        let g = NamedNode::new_unchecked("http://example.com/g");
        Dataset::from_iter([
            Quad::new(s.clone(), p.clone(), o.clone(), GraphName::DefaultGraph),
            Quad::new(o.clone(), p.clone(), s.clone(), g.clone()),
        ])
    }

    #[test]
    fn pattern_on_bound_subject() {
        let dataset = example_dataset();
        let s = Term::from(NamedNode::new_unchecked("http://example.com/s"));
        let quads = QueryableDataset::quads_for_pattern(&dataset, Some(&s), None, None, None)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].subject, s);
    }

    #[test]
    fn default_graph_excludes_named_graphs() {
        let dataset = example_dataset();
        let quads = QueryableDataset::quads_for_pattern(&dataset, None, None, None, Some(None))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].graph_name, None);
    }

    #[test]
    fn literal_subject_matches_nothing() {
        let dataset = example_dataset();
        let s = Term::from(oxrdf::Literal::from("foo"));
        assert_eq!(
            QueryableDataset::quads_for_pattern(&dataset, Some(&s), None, None, None).count(),
            0
        );
    }

    #[test]
    fn named_graphs_are_listed() {
        let dataset = example_dataset();
        let graphs = dataset.named_graphs().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(
            graphs,
            vec![Term::from(NamedNode::new_unchecked("http://example.com/g"))]
        );
    }
}
