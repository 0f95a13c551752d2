//! Behavioral tests for the streaming evaluation of the SPARQL algebra:
//! joins, OPTIONAL, MINUS, aggregation, ordering and the set modifiers.

use futures::StreamExt;
use oxrdf::{Dataset, GraphName, Literal, NamedNode, Quad, Term};
use sparpull::{
    EvalQuad, QueryEvaluationError, QueryEvaluator, QueryResults, QuerySolution, QueryableDataset,
};
use spargebra::SparqlParser;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn ex(name: &str) -> NamedNode {
    NamedNode::new(format!("http://example.com/{name}")).unwrap()
}

fn people_dataset() -> Dataset {
    let name = ex("name");
    let age = ex("age");
    let knows = ex("knows");
    Dataset::from_iter([
        Quad::new(ex("alice"), name.clone(), Literal::from("Alice"), GraphName::DefaultGraph),
        Quad::new(ex("alice"), age.clone(), Literal::from(30), GraphName::DefaultGraph),
        Quad::new(ex("alice"), knows.clone(), ex("bob"), GraphName::DefaultGraph),
        Quad::new(ex("bob"), name.clone(), Literal::from("Bob"), GraphName::DefaultGraph),
        Quad::new(ex("bob"), age.clone(), Literal::from(25), GraphName::DefaultGraph),
        Quad::new(ex("carol"), name.clone(), Literal::from("Carol"), GraphName::DefaultGraph),
    ])
}

async fn select(dataset: Dataset, query: &str) -> Vec<QuerySolution> {
    let query = SparqlParser::new().parse_query(query).unwrap();
    match QueryEvaluator::new().execute(dataset, &query).await.unwrap() {
        QueryResults::Solutions(solutions) => {
            solutions
                .map(|s| s.unwrap())
                .collect::<Vec<_>>()
                .await
        }
        _ => panic!("a SELECT query must return solutions"),
    }
}

async fn ask(dataset: Dataset, query: &str) -> bool {
    let query = SparqlParser::new().parse_query(query).unwrap();
    match QueryEvaluator::new().execute(dataset, &query).await.unwrap() {
        QueryResults::Boolean(result) => result,
        _ => panic!("an ASK query must return a boolean"),
    }
}

fn bound_terms(solutions: &[QuerySolution], variable: &str) -> Vec<Option<Term>> {
    solutions
        .iter()
        .map(|s| s.get(variable).cloned())
        .collect()
}

fn sorted_debug(solutions: &[QuerySolution]) -> Vec<String> {
    let mut result = solutions.iter().map(|s| format!("{s:?}")).collect::<Vec<_>>();
    result.sort();
    result
}

#[tokio::test]
async fn bgp_chain_joins_triple_patterns() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name ?age WHERE { ?p :name ?name . ?p :age ?age }",
    )
    .await;
    assert_eq!(solutions.len(), 2);
    for solution in &solutions {
        assert!(solution.get("name").is_some());
        assert!(solution.get("age").is_some());
    }
}

#[tokio::test]
async fn join_is_commutative_up_to_order() {
    let a = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT * WHERE { { ?p :name ?name } { ?p :age ?age } }",
    )
    .await;
    let b = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT * WHERE { { ?p :age ?age } { ?p :name ?name } }",
    )
    .await;
    assert_eq!(sorted_debug(&a), sorted_debug(&b));
}

#[tokio::test]
async fn optional_pads_rows_without_partner() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name ?age WHERE { ?p :name ?name OPTIONAL { ?p :age ?age } }",
    )
    .await;
    // Every person has a name, Carol has no age
    assert_eq!(solutions.len(), 3);
    let carol = solutions
        .iter()
        .find(|s| s.get("name") == Some(&Literal::from("Carol").into()))
        .unwrap();
    assert!(carol.get("age").is_none());
    let alice = solutions
        .iter()
        .find(|s| s.get("name") == Some(&Literal::from("Alice").into()))
        .unwrap();
    assert_eq!(alice.get("age"), Some(&Literal::from(30).into()));
}

#[tokio::test]
async fn optional_is_a_superset_of_its_left_operand() {
    let left = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name WHERE { ?p :name ?name }",
    )
    .await;
    let left_join = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name WHERE { ?p :name ?name OPTIONAL { ?p :age ?age } }",
    )
    .await;
    assert!(left_join.len() >= left.len());
}

#[tokio::test]
async fn optional_condition_rejects_pairing_but_keeps_left_row() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name ?age WHERE { ?p :name ?name OPTIONAL { ?p :age ?age FILTER(?age > 28) } }",
    )
    .await;
    assert_eq!(solutions.len(), 3);
    // Bob's age fails the condition: his row survives without the binding
    let bob = solutions
        .iter()
        .find(|s| s.get("name") == Some(&Literal::from("Bob").into()))
        .unwrap();
    assert!(bob.get("age").is_none());
    let alice = solutions
        .iter()
        .find(|s| s.get("name") == Some(&Literal::from("Alice").into()))
        .unwrap();
    assert_eq!(alice.get("age"), Some(&Literal::from(30).into()));
}

#[tokio::test]
async fn minus_suppresses_rows_sharing_a_bound_variable() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?p WHERE { ?p :name ?name MINUS { ?p :age ?age } }",
    )
    .await;
    assert_eq!(bound_terms(&solutions, "p"), vec![Some(ex("carol").into())]);
}

#[tokio::test]
async fn minus_with_disjoint_domains_changes_nothing() {
    // ?a and ?b do not overlap: MINUS must keep every left row
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?a WHERE { ?a :name ?name MINUS { ?b :age ?age } }",
    )
    .await;
    assert_eq!(solutions.len(), 3);
}

#[tokio::test]
async fn union_interleaves_without_deduplication() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name WHERE { { ?p :name ?name } UNION { ?p :name ?name } }",
    )
    .await;
    assert_eq!(solutions.len(), 6);
}

#[tokio::test]
async fn filter_drops_rows_and_treats_errors_as_false() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?v WHERE { ?p :name ?name . ?p ?r ?v FILTER(?v > 26) }",
    )
    .await;
    // The comparison errors on names (strings vs integer) and drops those rows
    assert_eq!(bound_terms(&solutions, "v"), vec![Some(Literal::from(30).into())]);
}

#[tokio::test]
async fn filter_exists_is_correlated() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name WHERE { ?p :name ?name FILTER EXISTS { ?p :knows ?other } }",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "name"),
        vec![Some(Literal::from("Alice").into())]
    );
}

#[tokio::test]
async fn filter_not_exists() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name WHERE { ?p :name ?name FILTER NOT EXISTS { ?p :age ?age } }",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "name"),
        vec![Some(Literal::from("Carol").into())]
    );
}

#[tokio::test]
async fn bind_adds_a_binding_and_keeps_the_row_on_error() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name ?next WHERE { ?p :name ?name . ?p :age ?age BIND(?age + 1 AS ?next) }",
    )
    .await;
    assert_eq!(solutions.len(), 2);
    assert!(solutions.iter().all(|s| s.get("next").is_some()));

    // The expression errors on strings: the row is kept, ?next stays unbound
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name ?next WHERE { ?p :name ?name BIND(?name + 1 AS ?next) }",
    )
    .await;
    assert_eq!(solutions.len(), 3);
    assert!(solutions.iter().all(|s| s.get("next").is_none()));
}

#[tokio::test]
async fn values_joins_with_the_surrounding_pattern() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name WHERE { VALUES ?p { :alice :carol } ?p :name ?name }",
    )
    .await;
    assert_eq!(
        sorted_debug(&solutions),
        sorted_debug(&select(
            people_dataset(),
            "PREFIX : <http://example.com/>
             SELECT ?name WHERE { ?p :name ?name FILTER(?p IN (:alice, :carol)) }",
        )
        .await)
    );
}

#[tokio::test]
async fn graph_clause_restricts_and_binds_the_active_graph() {
    let mut dataset = people_dataset();
    dataset.insert(&Quad::new(
        ex("dave"),
        ex("name"),
        Literal::from("Dave"),
        ex("extra"),
    ));
    let solutions = select(
        dataset.clone(),
        "PREFIX : <http://example.com/>
         SELECT ?name WHERE { GRAPH :extra { ?p :name ?name } }",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "name"),
        vec![Some(Literal::from("Dave").into())]
    );

    let solutions = select(
        dataset,
        "PREFIX : <http://example.com/>
         SELECT ?g ?name WHERE { GRAPH ?g { ?p :name ?name } }",
    )
    .await;
    assert_eq!(bound_terms(&solutions, "g"), vec![Some(ex("extra").into())]);
}

#[tokio::test]
async fn order_by_sorts_and_keeps_duplicates() {
    let solutions = select(
        Dataset::new(),
        "SELECT ?x WHERE { VALUES ?x { 2 1 1 } } ORDER BY ?x",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "x"),
        vec![
            Some(Literal::from(1).into()),
            Some(Literal::from(1).into()),
            Some(Literal::from(2).into()),
        ]
    );
}

#[tokio::test]
async fn order_by_desc_inverts_and_ranks_unbound_last() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name ?age WHERE { ?p :name ?name OPTIONAL { ?p :age ?age } } ORDER BY DESC(?age)",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "age"),
        vec![
            Some(Literal::from(30).into()),
            Some(Literal::from(25).into()),
            None,
        ]
    );
}

#[tokio::test]
async fn order_by_ranks_unbound_first_ascending() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name ?age WHERE { ?p :name ?name OPTIONAL { ?p :age ?age } } ORDER BY ?age",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "age"),
        vec![
            None,
            Some(Literal::from(25).into()),
            Some(Literal::from(30).into()),
        ]
    );
}

#[tokio::test]
async fn distinct_deduplicates_the_whole_sequence() {
    let solutions = select(
        Dataset::new(),
        "SELECT DISTINCT ?x WHERE { VALUES ?x { 1 2 1 1 } }",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "x"),
        vec![Some(Literal::from(1).into()), Some(Literal::from(2).into())]
    );
}

#[tokio::test]
async fn reduced_removes_adjacent_duplicates_only() {
    let solutions = select(
        Dataset::new(),
        "SELECT REDUCED ?x WHERE { VALUES ?x { 1 1 2 1 } }",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "x"),
        vec![
            Some(Literal::from(1).into()),
            Some(Literal::from(2).into()),
            Some(Literal::from(1).into()),
        ]
    );
}

#[tokio::test]
async fn slice_skips_then_takes() {
    let solutions = select(
        Dataset::new(),
        "SELECT ?x WHERE { VALUES ?x { 1 2 3 4 } } ORDER BY ?x OFFSET 1 LIMIT 2",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "x"),
        vec![Some(Literal::from(2).into()), Some(Literal::from(3).into())]
    );
}

/// Counts the pattern lookups to observe whether an operator pulled from its child
#[derive(Clone)]
struct CountingDataset {
    inner: Dataset,
    lookups: Arc<AtomicUsize>,
}

impl QueryableDataset for CountingDataset {
    type Error = Infallible;

    fn quads_for_pattern(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        graph_name: Option<Option<&Term>>,
    ) -> Box<dyn Iterator<Item = Result<EvalQuad, Infallible>> + Send> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        QueryableDataset::quads_for_pattern(&self.inner, subject, predicate, object, graph_name)
    }
}

#[tokio::test]
async fn limit_zero_never_pulls_from_its_child() {
    let lookups = Arc::new(AtomicUsize::new(0));
    let dataset = CountingDataset {
        inner: people_dataset(),
        lookups: Arc::clone(&lookups),
    };
    let query = SparqlParser::new()
        .parse_query("SELECT * WHERE { ?s ?p ?o } LIMIT 0")
        .unwrap();
    let QueryResults::Solutions(solutions) =
        QueryEvaluator::new().execute(dataset, &query).await.unwrap()
    else {
        panic!("a SELECT query must return solutions");
    };
    let solutions = solutions.collect::<Vec<_>>().await;
    assert!(solutions.is_empty());
    assert_eq!(lookups.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn count_without_group_by_over_empty_input_yields_one_row() {
    let solutions = select(
        Dataset::new(),
        "SELECT (COUNT(*) AS ?c) WHERE { ?s ?p ?o }",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "c"),
        vec![Some(Literal::from(0).into())]
    );
}

#[tokio::test]
async fn count_without_group_by_counts_all_rows() {
    let solutions = select(
        Dataset::new(),
        "SELECT (COUNT(*) AS ?c) WHERE { VALUES ?x { 1 2 3 } }",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "c"),
        vec![Some(Literal::from(3).into())]
    );
}

#[tokio::test]
async fn group_by_buckets_rows_per_key() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?p (COUNT(?o) AS ?c) WHERE { ?p ?r ?o } GROUP BY ?p ORDER BY DESC(?c)",
    )
    .await;
    assert_eq!(solutions.len(), 3);
    assert_eq!(
        solutions[0].get("c"),
        Some(&Literal::from(3).into()),
        "alice has three properties"
    );
}

#[tokio::test]
async fn sum_avg_min_max_aggregate_numeric_values() {
    let solutions = select(
        Dataset::new(),
        "SELECT (SUM(?v) AS ?sum) (AVG(?v) AS ?avg) (MIN(?v) AS ?min) (MAX(?v) AS ?max)
         WHERE { VALUES ?v { 1 2 3 } }",
    )
    .await;
    assert_eq!(solutions.len(), 1);
    let solution = &solutions[0];
    assert_eq!(solution.get("sum"), Some(&Literal::from(6).into()));
    assert_eq!(
        solution.get("avg"),
        Some(&Literal::new_typed_literal("2", oxrdf::vocab::xsd::DECIMAL).into())
    );
    assert_eq!(solution.get("min"), Some(&Literal::from(1).into()));
    assert_eq!(solution.get("max"), Some(&Literal::from(3).into()));
}

#[tokio::test]
async fn count_distinct_ignores_duplicates() {
    let solutions = select(
        Dataset::new(),
        "SELECT (COUNT(DISTINCT ?v) AS ?c) WHERE { VALUES ?v { 1 1 2 } }",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "c"),
        vec![Some(Literal::from(2).into())]
    );
}

#[tokio::test]
async fn group_concat_joins_string_values() {
    let solutions = select(
        Dataset::new(),
        "SELECT (GROUP_CONCAT(?v; SEPARATOR=\", \") AS ?c) WHERE { VALUES ?v { \"a\" \"b\" } }",
    )
    .await;
    assert_eq!(
        bound_terms(&solutions, "c"),
        vec![Some(Literal::from("a, b").into())]
    );
}

#[tokio::test]
async fn having_filters_groups() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?p (COUNT(?o) AS ?c) WHERE { ?p ?r ?o } GROUP BY ?p HAVING(COUNT(?o) > 2)",
    )
    .await;
    assert_eq!(bound_terms(&solutions, "p"), vec![Some(ex("alice").into())]);
}

#[tokio::test]
async fn subquery_is_evaluated_with_its_own_projection() {
    let solutions = select(
        people_dataset(),
        "PREFIX : <http://example.com/>
         SELECT ?name WHERE { { SELECT ?p WHERE { ?p :age ?age } } ?p :name ?name }",
    )
    .await;
    assert_eq!(solutions.len(), 2);
}

#[tokio::test]
async fn ask_stops_at_the_first_row() {
    assert!(ask(people_dataset(), "ASK { ?s ?p ?o }").await);
    assert!(
        !ask(
            people_dataset(),
            "PREFIX : <http://example.com/>
             ASK { :carol :age ?age }"
        )
        .await
    );
}

#[tokio::test]
async fn construct_instantiates_the_template_per_row() {
    let query = SparqlParser::new()
        .parse_query(
            "PREFIX : <http://example.com/>
             CONSTRUCT { ?p :label ?name } WHERE { ?p :name ?name }",
        )
        .unwrap();
    let QueryResults::Graph(triples) = QueryEvaluator::new()
        .execute(people_dataset(), &query)
        .await
        .unwrap()
    else {
        panic!("a CONSTRUCT query must return triples");
    };
    let triples = triples
        .map(|t| t.unwrap())
        .collect::<Vec<_>>()
        .await;
    assert_eq!(triples.len(), 3);
    assert!(triples.iter().all(|t| t.predicate == ex("label")));
}

#[tokio::test]
async fn describe_emits_the_triples_about_a_term() {
    let query = SparqlParser::new()
        .parse_query("DESCRIBE <http://example.com/alice>")
        .unwrap();
    let QueryResults::Graph(triples) = QueryEvaluator::new()
        .execute(people_dataset(), &query)
        .await
        .unwrap()
    else {
        panic!("a DESCRIBE query must return triples");
    };
    let triples = triples.map(|t| t.unwrap()).collect::<Vec<_>>().await;
    assert_eq!(triples.len(), 3);
    assert!(triples.iter().all(|t| t.subject == ex("alice").into()));
}

#[tokio::test]
async fn explanation_lists_the_evaluation_tree() {
    let query = SparqlParser::new()
        .parse_query("SELECT ?s WHERE { ?s ?p ?o } ORDER BY ?s")
        .unwrap();
    let (results, explanation) = QueryEvaluator::new()
        .compute_statistics()
        .explain(people_dataset(), &query)
        .await;
    if let Ok(QueryResults::Solutions(solutions)) = results {
        solutions.collect::<Vec<_>>().await;
    } else {
        panic!("a SELECT query must return solutions");
    }
    let mut json = Vec::new();
    explanation.write_in_json(&mut json).unwrap();
    let json = String::from_utf8(json).unwrap();
    assert!(json.contains("\"plan\""));
    assert!(json.contains("OrderBy"));
    assert!(json.contains("number of results"));
    assert!(format!("{explanation:?}").contains("Project"));
}

#[tokio::test]
async fn substituted_variables_constrain_the_evaluation() {
    let query = SparqlParser::new()
        .parse_query(
            "PREFIX : <http://example.com/>
             SELECT ?p ?name WHERE { ?p :name ?name }",
        )
        .unwrap();
    let QueryResults::Solutions(solutions) = QueryEvaluator::new()
        .execute_with_substituted_variables(
            people_dataset(),
            &query,
            [(oxrdf::Variable::new("p").unwrap(), ex("bob").into())],
        )
        .await
        .unwrap()
    else {
        panic!("a SELECT query must return solutions");
    };
    let solutions = solutions.map(|s| s.unwrap()).collect::<Vec<_>>().await;
    assert_eq!(solutions.len(), 1);
    assert_eq!(solutions[0].get("name"), Some(&Literal::from("Bob").into()));
}

#[tokio::test]
async fn substituting_an_unknown_variable_is_an_error() {
    let query = SparqlParser::new()
        .parse_query("SELECT ?s WHERE { ?s ?p ?o }")
        .unwrap();
    let result = QueryEvaluator::new()
        .execute_with_substituted_variables(
            people_dataset(),
            &query,
            [(oxrdf::Variable::new("nope").unwrap(), ex("bob").into())],
        )
        .await;
    assert!(matches!(
        result,
        Err(QueryEvaluationError::NotExistingSubstitutedVariable(_))
    ));
}

#[tokio::test]
async fn property_paths_are_rejected_as_unsupported() {
    let query = SparqlParser::new()
        .parse_query(
            "PREFIX : <http://example.com/>
             SELECT ?o WHERE { :alice :knows+ ?o }",
        )
        .unwrap();
    let result = QueryEvaluator::new().execute(people_dataset(), &query).await;
    assert!(matches!(
        result,
        Err(QueryEvaluationError::UnsupportedOperation(_))
    ));
}
