use futures::StreamExt;
use oxrdf::{Dataset, GraphName, NamedNode, Quad};
use sparpull::{
    CancellationToken, QueryEvaluationError, QueryEvaluator, QueryExecutionLimits, QueryResults,
};
use spargebra::SparqlParser;
use std::time::Duration;

fn create_test_dataset(size: usize) -> Dataset {
    let mut dataset = Dataset::new();
    let ex = NamedNode::new("http://example.com/").unwrap();

    for i in 0..size {
        let quad = Quad::new(
            NamedNode::new(format!("http://example.com/s{i}")).unwrap(),
            ex.clone(),
            NamedNode::new(format!("http://example.com/o{i}")).unwrap(),
            GraphName::DefaultGraph,
        );
        dataset.insert(&quad);
    }

    dataset
}

async fn collect_solutions(
    results: Result<QueryResults, QueryEvaluationError>,
) -> Vec<Result<sparpull::QuerySolution, QueryEvaluationError>> {
    match results.unwrap() {
        QueryResults::Solutions(solutions) => solutions.collect::<Vec<_>>().await,
        _ => panic!("a SELECT query must return solutions"),
    }
}

#[tokio::test]
async fn query_without_limits_succeeds() {
    let dataset = create_test_dataset(100);
    let query = SparqlParser::new()
        .parse_query("SELECT * WHERE { ?s ?p ?o }")
        .unwrap();

    let results = QueryEvaluator::new().execute(dataset, &query).await;
    let solutions = collect_solutions(results).await;
    assert_eq!(solutions.len(), 100);
    assert!(solutions.iter().all(Result::is_ok));
}

#[tokio::test]
async fn max_result_rows_terminates_the_stream() {
    let dataset = create_test_dataset(100);
    let query = SparqlParser::new()
        .parse_query("SELECT * WHERE { ?s ?p ?o }")
        .unwrap();

    let results = QueryEvaluator::new()
        .with_limits(QueryExecutionLimits {
            max_result_rows: Some(10),
            ..QueryExecutionLimits::unlimited()
        })
        .execute(dataset, &query)
        .await;
    let solutions = collect_solutions(results).await;
    // 10 valid rows, then the limit error, then nothing
    assert_eq!(solutions.len(), 11);
    assert!(solutions[..10].iter().all(Result::is_ok));
    assert!(matches!(
        solutions[10],
        Err(QueryEvaluationError::TooManyResults(10))
    ));
}

#[tokio::test]
async fn max_result_rows_is_not_hit_by_smaller_results() {
    let dataset = create_test_dataset(5);
    let query = SparqlParser::new()
        .parse_query("SELECT * WHERE { ?s ?p ?o }")
        .unwrap();

    let results = QueryEvaluator::new()
        .with_limits(QueryExecutionLimits {
            max_result_rows: Some(10),
            ..QueryExecutionLimits::unlimited()
        })
        .execute(dataset, &query)
        .await;
    let solutions = collect_solutions(results).await;
    assert_eq!(solutions.len(), 5);
    assert!(solutions.iter().all(Result::is_ok));
}

#[tokio::test]
async fn timeout_cancels_the_evaluation() {
    let dataset = create_test_dataset(100);
    let query = SparqlParser::new()
        .parse_query("SELECT * WHERE { ?s ?p ?o . ?s2 ?p2 ?o2 }")
        .unwrap();

    let results = QueryEvaluator::new()
        .with_limits(QueryExecutionLimits {
            timeout: Some(Duration::from_nanos(1)),
            ..QueryExecutionLimits::unlimited()
        })
        .execute(dataset, &query)
        .await;
    std::thread::sleep(Duration::from_millis(5));
    let solutions = collect_solutions(results).await;
    assert!(solutions
        .iter()
        .any(|s| matches!(s, Err(QueryEvaluationError::Timeout))));
    assert!(!solutions.iter().any(|s| s.is_ok()));
}

#[tokio::test]
async fn max_groups_aborts_grouping() {
    let dataset = create_test_dataset(100);
    let query = SparqlParser::new()
        .parse_query("SELECT ?s (COUNT(?o) AS ?c) WHERE { ?s ?p ?o } GROUP BY ?s")
        .unwrap();

    let results = QueryEvaluator::new()
        .with_limits(QueryExecutionLimits {
            max_groups: Some(10),
            ..QueryExecutionLimits::unlimited()
        })
        .execute(dataset, &query)
        .await;
    let solutions = collect_solutions(results).await;
    assert_eq!(solutions.len(), 1);
    assert!(matches!(
        solutions[0],
        Err(QueryEvaluationError::TooManyGroups(10))
    ));
}

#[tokio::test]
async fn cancellation_token_stops_a_running_stream() {
    let dataset = create_test_dataset(100);
    let query = SparqlParser::new()
        .parse_query("SELECT * WHERE { ?s ?p ?o }")
        .unwrap();

    let token = CancellationToken::new();
    let results = QueryEvaluator::new()
        .with_cancellation_token(token.clone())
        .execute(dataset, &query)
        .await;
    let QueryResults::Solutions(mut solutions) = results.unwrap() else {
        panic!("a SELECT query must return solutions");
    };
    assert!(solutions.next().await.unwrap().is_ok());
    token.cancel();
    assert!(matches!(
        solutions.next().await,
        Some(Err(QueryEvaluationError::Cancelled))
    ));
    assert!(solutions.next().await.is_none());
}

#[tokio::test]
async fn ask_queries_are_cancellable_too() {
    let dataset = create_test_dataset(10);
    let query = SparqlParser::new()
        .parse_query("ASK { ?s ?p ?o FILTER(false) }")
        .unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let result = QueryEvaluator::new()
        .with_cancellation_token(token)
        .execute(dataset, &query)
        .await;
    assert!(matches!(result, Err(QueryEvaluationError::Cancelled)));
}
