//! Compilation of SPARQL expressions into per-row closures.
//!
//! Each algebra site holding an expression is compiled once into an
//! `Fn(&EncodedTuple) -> Option<Term>` closure. Expression evaluation errors are
//! `None`, matching the SPARQL error-as-absence semantics: FILTER treats them as
//! false, BIND leaves the target unbound, ORDER BY ranks them as unbound.

use crate::eval::{encode_variable, EncodedTuple};
use crate::CustomFunctionRegistry;
use oxrdf::vocab::xsd;
use oxrdf::{Literal, NamedNode, Term, Variable};
use oxsdatatypes::{Boolean, DateTime, Decimal, Double, Float, Integer};
use regex::{Regex, RegexBuilder};
use spargebra::algebra::{Expression, Function};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;

const REGEX_SIZE_LIMIT: usize = 1_000_000;

pub(crate) type ExpressionEvaluatorFn = Arc<dyn Fn(&EncodedTuple) -> Option<Term> + Send + Sync>;
pub(crate) type BooleanExpressionEvaluatorFn =
    Arc<dyn Fn(&EncodedTuple) -> Option<bool> + Send + Sync>;

pub(crate) fn expression_evaluator(
    expression: &Expression,
    encoded_variables: &mut Vec<Variable>,
    custom_functions: &Arc<CustomFunctionRegistry>,
) -> ExpressionEvaluatorFn {
    match expression {
        Expression::NamedNode(t) => {
            let t = Term::from(t.clone());
            Arc::new(move |_| Some(t.clone()))
        }
        Expression::Literal(t) => {
            let t = Term::from(t.clone());
            Arc::new(move |_| Some(t.clone()))
        }
        Expression::Variable(v) => {
            let v = encode_variable(encoded_variables, v);
            Arc::new(move |tuple| tuple.get(v).cloned())
        }
        Expression::Bound(v) => {
            let v = encode_variable(encoded_variables, v);
            Arc::new(move |tuple| Some(Literal::from(tuple.contains(v)).into()))
        }
        Expression::Exists(_) => {
            // EXISTS probes are hoisted to synthesized variables before expression
            // compilation. A remaining node means the enclosing operator cannot
            // suspend for the probe, so it evaluates to an expression error.
            Arc::new(|_| None)
        }
        Expression::Or(a, b) => {
            let a = effective_boolean_value_expression_evaluator(a, encoded_variables, custom_functions);
            let b = effective_boolean_value_expression_evaluator(b, encoded_variables, custom_functions);
            Arc::new(move |tuple| match (a(tuple), b(tuple)) {
                (Some(true), _) | (_, Some(true)) => Some(Literal::from(true).into()),
                (Some(false), Some(false)) => Some(Literal::from(false).into()),
                _ => None,
            })
        }
        Expression::And(a, b) => {
            let a = effective_boolean_value_expression_evaluator(a, encoded_variables, custom_functions);
            let b = effective_boolean_value_expression_evaluator(b, encoded_variables, custom_functions);
            Arc::new(move |tuple| match (a(tuple), b(tuple)) {
                (Some(false), _) | (_, Some(false)) => Some(Literal::from(false).into()),
                (Some(true), Some(true)) => Some(Literal::from(true).into()),
                _ => None,
            })
        }
        Expression::Not(e) => {
            let e = effective_boolean_value_expression_evaluator(e, encoded_variables, custom_functions);
            Arc::new(move |tuple| Some(Literal::from(!e(tuple)?).into()))
        }
        Expression::SameTerm(a, b) => {
            let a = expression_evaluator(a, encoded_variables, custom_functions);
            let b = expression_evaluator(b, encoded_variables, custom_functions);
            Arc::new(move |tuple| Some(Literal::from(a(tuple)? == b(tuple)?).into()))
        }
        Expression::Equal(a, b) => {
            let a = expression_evaluator(a, encoded_variables, custom_functions);
            let b = expression_evaluator(b, encoded_variables, custom_functions);
            Arc::new(move |tuple| Some(Literal::from(equals(&a(tuple)?, &b(tuple)?)?).into()))
        }
        Expression::Greater(a, b) => comparison_evaluator(a, b, encoded_variables, custom_functions, |o| {
            o == Ordering::Greater
        }),
        Expression::GreaterOrEqual(a, b) => {
            comparison_evaluator(a, b, encoded_variables, custom_functions, |o| o != Ordering::Less)
        }
        Expression::Less(a, b) => comparison_evaluator(a, b, encoded_variables, custom_functions, |o| {
            o == Ordering::Less
        }),
        Expression::LessOrEqual(a, b) => comparison_evaluator(a, b, encoded_variables, custom_functions, |o| {
            o != Ordering::Greater
        }),
        Expression::In(e, list) => {
            let e = expression_evaluator(e, encoded_variables, custom_functions);
            let list = list
                .iter()
                .map(|member| expression_evaluator(member, encoded_variables, custom_functions))
                .collect::<Vec<_>>();
            Arc::new(move |tuple| {
                let needle = e(tuple)?;
                let mut error = false;
                for member in &list {
                    match member(tuple).and_then(|m| equals(&needle, &m)) {
                        Some(true) => return Some(Literal::from(true).into()),
                        Some(false) => (),
                        None => error = true,
                    }
                }
                (!error).then(|| Literal::from(false).into())
            })
        }
        Expression::Add(a, b) => numeric_binary_evaluator(a, b, encoded_variables, custom_functions, |pair| {
            Some(match pair {
                NumericPair::Integer(v1, v2) => Literal::from(v1.checked_add(v2)?),
                NumericPair::Decimal(v1, v2) => Literal::from(v1.checked_add(v2)?),
                NumericPair::Float(v1, v2) => Literal::from(v1 + v2),
                NumericPair::Double(v1, v2) => Literal::from(v1 + v2),
            }
            .into())
        }),
        Expression::Subtract(a, b) => numeric_binary_evaluator(a, b, encoded_variables, custom_functions, |pair| {
            Some(match pair {
                NumericPair::Integer(v1, v2) => Literal::from(v1.checked_sub(v2)?),
                NumericPair::Decimal(v1, v2) => Literal::from(v1.checked_sub(v2)?),
                NumericPair::Float(v1, v2) => Literal::from(v1 - v2),
                NumericPair::Double(v1, v2) => Literal::from(v1 - v2),
            }
            .into())
        }),
        Expression::Multiply(a, b) => numeric_binary_evaluator(a, b, encoded_variables, custom_functions, |pair| {
            Some(match pair {
                NumericPair::Integer(v1, v2) => Literal::from(v1.checked_mul(v2)?),
                NumericPair::Decimal(v1, v2) => Literal::from(v1.checked_mul(v2)?),
                NumericPair::Float(v1, v2) => Literal::from(v1 * v2),
                NumericPair::Double(v1, v2) => Literal::from(v1 * v2),
            }
            .into())
        }),
        Expression::Divide(a, b) => numeric_binary_evaluator(a, b, encoded_variables, custom_functions, |pair| {
            Some(match pair {
                // xsd:integer division yields xsd:decimal
                NumericPair::Integer(v1, v2) => Literal::from(Decimal::from(v1).checked_div(v2)?),
                NumericPair::Decimal(v1, v2) => Literal::from(v1.checked_div(v2)?),
                NumericPair::Float(v1, v2) => Literal::from(v1 / v2),
                NumericPair::Double(v1, v2) => Literal::from(v1 / v2),
            }
            .into())
        }),
        Expression::UnaryPlus(e) => {
            let e = expression_evaluator(e, encoded_variables, custom_functions);
            Arc::new(move |tuple| Some(numeric_term(parse_numeric(&e(tuple)?)?)))
        }
        Expression::UnaryMinus(e) => {
            let e = expression_evaluator(e, encoded_variables, custom_functions);
            Arc::new(move |tuple| {
                Some(
                    match parse_numeric(&e(tuple)?)? {
                        Numeric::Integer(v) => Literal::from(v.checked_neg()?),
                        Numeric::Decimal(v) => Literal::from(v.checked_neg()?),
                        Numeric::Float(v) => Literal::from(-v),
                        Numeric::Double(v) => Literal::from(-v),
                    }
                    .into(),
                )
            })
        }
        Expression::If(a, b, c) => {
            let a = effective_boolean_value_expression_evaluator(a, encoded_variables, custom_functions);
            let b = expression_evaluator(b, encoded_variables, custom_functions);
            let c = expression_evaluator(c, encoded_variables, custom_functions);
            Arc::new(move |tuple| if a(tuple)? { b(tuple) } else { c(tuple) })
        }
        Expression::Coalesce(l) => {
            let l = l
                .iter()
                .map(|e| expression_evaluator(e, encoded_variables, custom_functions))
                .collect::<Vec<_>>();
            Arc::new(move |tuple| l.iter().find_map(|e| e(tuple)))
        }
        Expression::FunctionCall(function, parameters) => {
            function_evaluator(function, parameters, encoded_variables, custom_functions)
        }
    }
}

pub(crate) fn effective_boolean_value_expression_evaluator(
    expression: &Expression,
    encoded_variables: &mut Vec<Variable>,
    custom_functions: &Arc<CustomFunctionRegistry>,
) -> BooleanExpressionEvaluatorFn {
    let e = expression_evaluator(expression, encoded_variables, custom_functions);
    Arc::new(move |tuple| effective_boolean_value(&e(tuple)?))
}

fn comparison_evaluator(
    a: &Expression,
    b: &Expression,
    encoded_variables: &mut Vec<Variable>,
    custom_functions: &Arc<CustomFunctionRegistry>,
    check: impl Fn(Ordering) -> bool + Send + Sync + 'static,
) -> ExpressionEvaluatorFn {
    let a = expression_evaluator(a, encoded_variables, custom_functions);
    let b = expression_evaluator(b, encoded_variables, custom_functions);
    Arc::new(move |tuple| {
        Some(Literal::from(check(partial_cmp(&a(tuple)?, &b(tuple)?)?)).into())
    })
}

fn numeric_binary_evaluator(
    a: &Expression,
    b: &Expression,
    encoded_variables: &mut Vec<Variable>,
    custom_functions: &Arc<CustomFunctionRegistry>,
    op: impl Fn(NumericPair) -> Option<Term> + Send + Sync + 'static,
) -> ExpressionEvaluatorFn {
    let a = expression_evaluator(a, encoded_variables, custom_functions);
    let b = expression_evaluator(b, encoded_variables, custom_functions);
    Arc::new(move |tuple| op(NumericPair::new(&a(tuple)?, &b(tuple)?)?))
}

fn function_evaluator(
    function: &Function,
    parameters: &[Expression],
    encoded_variables: &mut Vec<Variable>,
    custom_functions: &Arc<CustomFunctionRegistry>,
) -> ExpressionEvaluatorFn {
    let args = parameters
        .iter()
        .map(|e| expression_evaluator(e, encoded_variables, custom_functions))
        .collect::<Vec<_>>();
    match function {
        Function::Str => unary(args, |t| {
            Some(match t {
                Term::NamedNode(n) => Literal::new_simple_literal(n.as_str()).into(),
                Term::Literal(l) => Literal::new_simple_literal(l.value()).into(),
                _ => return None,
            })
        }),
        Function::Lang => unary(args, |t| {
            if let Term::Literal(l) = t {
                Some(Literal::new_simple_literal(l.language().unwrap_or_default()).into())
            } else {
                None
            }
        }),
        Function::Datatype => unary(args, |t| {
            if let Term::Literal(l) = t {
                Some(l.datatype().into_owned().into())
            } else {
                None
            }
        }),
        Function::Iri => unary(args, |t| match t {
            Term::NamedNode(n) => Some(n.into()),
            Term::Literal(l) => {
                let (value, language) = to_string_and_language(&Term::from(l))?;
                if language.is_some() {
                    return None;
                }
                Some(NamedNode::new(value).ok()?.into())
            }
            _ => None,
        }),
        Function::IsIri => unary(args, |t| Some(Literal::from(matches!(t, Term::NamedNode(_))).into())),
        Function::IsBlank => unary(args, |t| Some(Literal::from(matches!(t, Term::BlankNode(_))).into())),
        Function::IsLiteral => unary(args, |t| Some(Literal::from(matches!(t, Term::Literal(_))).into())),
        Function::IsNumeric => unary(args, |t| Some(Literal::from(parse_numeric(&t).is_some()).into())),
        Function::StrLen => unary(args, |t| {
            let (value, _) = to_string_and_language(&t)?;
            Some(Literal::from(Integer::from(i64::try_from(value.chars().count()).ok()?)).into())
        }),
        Function::UCase => unary(args, |t| {
            let (value, language) = to_string_and_language(&t)?;
            Some(build_plain_literal(value.to_uppercase(), language))
        }),
        Function::LCase => unary(args, |t| {
            let (value, language) = to_string_and_language(&t)?;
            Some(build_plain_literal(value.to_lowercase(), language))
        }),
        Function::Contains => binary_string(args, |a, b| a.contains(b)),
        Function::StrStarts => binary_string(args, |a, b| a.starts_with(b)),
        Function::StrEnds => binary_string(args, |a, b| a.ends_with(b)),
        Function::Concat => Arc::new(move |tuple| {
            let mut result = String::new();
            let mut language: Option<Option<String>> = None;
            for arg in &args {
                let (value, arg_language) = to_string_and_language(&arg(tuple)?)?;
                if let Some(language) = &mut language {
                    if *language != arg_language {
                        *language = None;
                    }
                } else {
                    language = Some(arg_language);
                }
                result.push_str(&value);
            }
            Some(build_plain_literal(result, language.flatten()))
        }),
        Function::Abs => unary(args, |t| {
            Some(
                match parse_numeric(&t)? {
                    Numeric::Integer(v) => Literal::from(v.checked_abs()?),
                    Numeric::Decimal(v) => Literal::from(v.checked_abs()?),
                    Numeric::Float(v) => Literal::from(v.abs()),
                    Numeric::Double(v) => Literal::from(v.abs()),
                }
                .into(),
            )
        }),
        Function::Ceil => unary(args, |t| {
            Some(
                match parse_numeric(&t)? {
                    Numeric::Integer(v) => Literal::from(v),
                    Numeric::Decimal(v) => Literal::from(v.checked_ceil()?),
                    Numeric::Float(v) => Literal::from(v.ceil()),
                    Numeric::Double(v) => Literal::from(v.ceil()),
                }
                .into(),
            )
        }),
        Function::Floor => unary(args, |t| {
            Some(
                match parse_numeric(&t)? {
                    Numeric::Integer(v) => Literal::from(v),
                    Numeric::Decimal(v) => Literal::from(v.checked_floor()?),
                    Numeric::Float(v) => Literal::from(v.floor()),
                    Numeric::Double(v) => Literal::from(v.floor()),
                }
                .into(),
            )
        }),
        Function::Round => unary(args, |t| {
            Some(
                match parse_numeric(&t)? {
                    Numeric::Integer(v) => Literal::from(v),
                    Numeric::Decimal(v) => Literal::from(v.checked_round()?),
                    Numeric::Float(v) => Literal::from(v.round()),
                    Numeric::Double(v) => Literal::from(v.round()),
                }
                .into(),
            )
        }),
        Function::Regex => {
            if parameters.len() < 2 {
                return Arc::new(|_| None);
            }
            if let Some(regex) = compile_static_pattern_if_exists(&parameters[1], parameters.get(2)) {
                let text = args[0].clone();
                Arc::new(move |tuple| {
                    let (text, _) = to_string_and_language(&text(tuple)?)?;
                    Some(Literal::from(regex.is_match(&text)).into())
                })
            } else {
                Arc::new(move |tuple| {
                    let (text, _) = to_string_and_language(&args[0](tuple)?)?;
                    let (pattern, _) = to_string_and_language(&args[1](tuple)?)?;
                    let flags = if let Some(flags) = args.get(2) {
                        Some(to_string_and_language(&flags(tuple)?)?.0)
                    } else {
                        None
                    };
                    let regex = compile_pattern(&pattern, flags.as_deref())?;
                    Some(Literal::from(regex.is_match(&text)).into())
                })
            }
        }
        Function::Custom(name) => {
            if let Some(function) = custom_functions.get(name) {
                let function = Arc::clone(function);
                Arc::new(move |tuple| {
                    let args = args.iter().map(|a| a(tuple)).collect::<Option<Vec<_>>>()?;
                    function(&args)
                })
            } else {
                Arc::new(|_| None)
            }
        }
        _ => Arc::new(|_| None),
    }
}

fn unary(
    args: Vec<ExpressionEvaluatorFn>,
    op: impl Fn(Term) -> Option<Term> + Send + Sync + 'static,
) -> ExpressionEvaluatorFn {
    Arc::new(move |tuple| op(args.first()?(tuple)?))
}

fn binary_string(
    args: Vec<ExpressionEvaluatorFn>,
    op: impl Fn(&str, &str) -> bool + Send + Sync + 'static,
) -> ExpressionEvaluatorFn {
    Arc::new(move |tuple| {
        let a = args.first()?(tuple)?;
        let b = args.get(1)?(tuple)?;
        let (a, b, _) = to_argument_compatible_strings(&a, &b)?;
        Some(Literal::from(op(&a, &b)).into())
    })
}

/// Computes the term [effective boolean value](https://www.w3.org/TR/sparql11-query/#ebv)
pub(crate) fn effective_boolean_value(term: &Term) -> Option<bool> {
    let Term::Literal(literal) = term else {
        return None;
    };
    if literal.language().is_some() {
        return Some(!literal.value().is_empty());
    }
    let datatype = literal.datatype();
    if datatype == xsd::BOOLEAN {
        Boolean::from_str(literal.value()).ok().map(Into::into)
    } else if datatype == xsd::STRING {
        Some(!literal.value().is_empty())
    } else {
        Some(match parse_numeric(term)? {
            Numeric::Integer(v) => v != Integer::from(0),
            Numeric::Decimal(v) => v != Decimal::from(0),
            Numeric::Float(v) => v != Float::from(0.) && !v.is_nan(),
            Numeric::Double(v) => v != Double::from(0.) && !v.is_nan(),
        })
    }
}

/// SPARQL `=` operator on RDF terms
pub(crate) fn equals(a: &Term, b: &Term) -> Option<bool> {
    if a == b {
        return Some(true);
    }
    match (a, b) {
        (Term::Literal(la), Term::Literal(lb)) => {
            if let Some(pair) = NumericPair::new(a, b) {
                return Some(match pair {
                    NumericPair::Integer(v1, v2) => v1 == v2,
                    NumericPair::Decimal(v1, v2) => v1 == v2,
                    NumericPair::Float(v1, v2) => v1 == v2,
                    NumericPair::Double(v1, v2) => v1 == v2,
                });
            }
            if la.datatype() == xsd::DATE_TIME && lb.datatype() == xsd::DATE_TIME {
                let va = DateTime::from_str(la.value()).ok()?;
                let vb = DateTime::from_str(lb.value()).ok()?;
                return Some(va == vb);
            }
            if la.datatype() == lb.datatype() && la.language() == lb.language() {
                // Same datatype, different lexical forms: equality is unknown for
                // datatypes this evaluator does not interpret.
                if la.datatype() == xsd::STRING
                    || la.language().is_some()
                    || la.datatype() == xsd::BOOLEAN
                {
                    Some(la.value() == lb.value())
                } else {
                    None
                }
            } else {
                None
            }
        }
        // IRIs, blank nodes and literals are pairwise distinct
        _ => Some(false),
    }
}

/// Comparison for the `<`, `>`, `<=` and `>=` operators
pub(crate) fn partial_cmp(a: &Term, b: &Term) -> Option<Ordering> {
    if a == b {
        return Some(Ordering::Equal);
    }
    if let Some(pair) = NumericPair::new(a, b) {
        return match pair {
            NumericPair::Integer(v1, v2) => Some(v1.cmp(&v2)),
            NumericPair::Decimal(v1, v2) => Some(v1.cmp(&v2)),
            NumericPair::Float(v1, v2) => v1.partial_cmp(&v2),
            NumericPair::Double(v1, v2) => v1.partial_cmp(&v2),
        };
    }
    if let (Some((va, l1)), Some((vb, l2))) = (to_string_and_language(a), to_string_and_language(b))
    {
        return (l1 == l2).then(|| va.cmp(&vb));
    }
    let (Term::Literal(la), Term::Literal(lb)) = (a, b) else {
        return None;
    };
    if la.datatype() == xsd::BOOLEAN && lb.datatype() == xsd::BOOLEAN {
        let va = Boolean::from_str(la.value()).ok()?;
        let vb = Boolean::from_str(lb.value()).ok()?;
        return va.partial_cmp(&vb);
    }
    if la.datatype() == xsd::DATE_TIME && lb.datatype() == xsd::DATE_TIME {
        let va = DateTime::from_str(la.value()).ok()?;
        let vb = DateTime::from_str(lb.value()).ok()?;
        return va.partial_cmp(&vb);
    }
    None
}

/// Total order used by ORDER BY: unbound first, then blank nodes, IRIs and literals
pub(crate) fn cmp_terms(a: Option<&Term>, b: Option<&Term>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match a {
            Term::BlankNode(a) => match b {
                Term::BlankNode(b) => a.as_str().cmp(b.as_str()),
                _ => Ordering::Less,
            },
            Term::NamedNode(a) => match b {
                Term::BlankNode(_) => Ordering::Greater,
                Term::NamedNode(b) => a.as_str().cmp(b.as_str()),
                _ => Ordering::Less,
            },
            _ => match b {
                Term::NamedNode(_) | Term::BlankNode(_) => Ordering::Greater,
                _ => {
                    if let Some(ord) = partial_cmp(a, b) {
                        ord
                    } else if let (Term::Literal(a), Term::Literal(b)) = (a, b) {
                        (a.value(), a.datatype().as_str(), a.language()).cmp(&(
                            b.value(),
                            b.datatype().as_str(),
                            b.language(),
                        ))
                    } else {
                        Ordering::Equal // Should never happen
                    }
                }
            },
        },
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Numeric {
    Integer(Integer),
    Decimal(Decimal),
    Float(Float),
    Double(Double),
}

pub(crate) fn parse_numeric(term: &Term) -> Option<Numeric> {
    let Term::Literal(literal) = term else {
        return None;
    };
    if literal.language().is_some() {
        return None;
    }
    let datatype = literal.datatype();
    let value = literal.value();
    if datatype == xsd::INTEGER
        || datatype == xsd::LONG
        || datatype == xsd::INT
        || datatype == xsd::SHORT
        || datatype == xsd::BYTE
        || datatype == xsd::UNSIGNED_LONG
        || datatype == xsd::UNSIGNED_INT
        || datatype == xsd::UNSIGNED_SHORT
        || datatype == xsd::UNSIGNED_BYTE
        || datatype == xsd::NON_NEGATIVE_INTEGER
        || datatype == xsd::NON_POSITIVE_INTEGER
        || datatype == xsd::NEGATIVE_INTEGER
        || datatype == xsd::POSITIVE_INTEGER
    {
        Integer::from_str(value).ok().map(Numeric::Integer)
    } else if datatype == xsd::DECIMAL {
        Decimal::from_str(value).ok().map(Numeric::Decimal)
    } else if datatype == xsd::FLOAT {
        Float::from_str(value).ok().map(Numeric::Float)
    } else if datatype == xsd::DOUBLE {
        Double::from_str(value).ok().map(Numeric::Double)
    } else {
        None
    }
}

pub(crate) fn numeric_term(value: Numeric) -> Term {
    match value {
        Numeric::Integer(v) => Literal::from(v).into(),
        Numeric::Decimal(v) => Literal::from(v).into(),
        Numeric::Float(v) => Literal::from(v).into(),
        Numeric::Double(v) => Literal::from(v).into(),
    }
}

/// Pair of numeric operands promoted to their common type
pub(crate) enum NumericPair {
    Integer(Integer, Integer),
    Decimal(Decimal, Decimal),
    Float(Float, Float),
    Double(Double, Double),
}

impl NumericPair {
    pub(crate) fn new(a: &Term, b: &Term) -> Option<Self> {
        Some(match (parse_numeric(a)?, parse_numeric(b)?) {
            (Numeric::Integer(v1), Numeric::Integer(v2)) => Self::Integer(v1, v2),
            (Numeric::Integer(v1), Numeric::Decimal(v2)) => Self::Decimal(v1.into(), v2),
            (Numeric::Integer(v1), Numeric::Float(v2)) => Self::Float(v1.into(), v2),
            (Numeric::Integer(v1), Numeric::Double(v2)) => Self::Double(v1.into(), v2),
            (Numeric::Decimal(v1), Numeric::Integer(v2)) => Self::Decimal(v1, v2.into()),
            (Numeric::Decimal(v1), Numeric::Decimal(v2)) => Self::Decimal(v1, v2),
            (Numeric::Decimal(v1), Numeric::Float(v2)) => Self::Float(v1.into(), v2),
            (Numeric::Decimal(v1), Numeric::Double(v2)) => Self::Double(v1.into(), v2),
            (Numeric::Float(v1), Numeric::Integer(v2)) => Self::Float(v1, v2.into()),
            (Numeric::Float(v1), Numeric::Decimal(v2)) => Self::Float(v1, v2.into()),
            (Numeric::Float(v1), Numeric::Float(v2)) => Self::Float(v1, v2),
            (Numeric::Float(v1), Numeric::Double(v2)) => Self::Double(v1.into(), v2),
            (Numeric::Double(v1), Numeric::Integer(v2)) => Self::Double(v1, v2.into()),
            (Numeric::Double(v1), Numeric::Decimal(v2)) => Self::Double(v1, v2.into()),
            (Numeric::Double(v1), Numeric::Float(v2)) => Self::Double(v1, v2.into()),
            (Numeric::Double(v1), Numeric::Double(v2)) => Self::Double(v1, v2),
        })
    }
}

fn to_string_and_language(term: &Term) -> Option<(String, Option<String>)> {
    let Term::Literal(literal) = term else {
        return None;
    };
    if let Some(language) = literal.language() {
        Some((literal.value().into(), Some(language.into())))
    } else if literal.datatype() == xsd::STRING {
        Some((literal.value().into(), None))
    } else {
        None
    }
}

fn build_plain_literal(value: String, language: Option<String>) -> Term {
    if let Some(language) = language {
        Literal::new_language_tagged_literal_unchecked(value, language).into()
    } else {
        Literal::new_simple_literal(value).into()
    }
}

fn to_argument_compatible_strings(a: &Term, b: &Term) -> Option<(String, String, Option<String>)> {
    let (value1, language1) = to_string_and_language(a)?;
    let (value2, language2) = to_string_and_language(b)?;
    (language2.is_none() || language1 == language2).then_some((value1, value2, language1))
}

fn compile_static_pattern_if_exists(
    pattern: &Expression,
    options: Option<&Expression>,
) -> Option<Regex> {
    let static_pattern = if let Expression::Literal(pattern) = pattern {
        (pattern.datatype() == xsd::STRING).then(|| pattern.value())
    } else {
        None
    };
    let static_options = if let Some(options) = options {
        if let Expression::Literal(options) = options {
            (options.datatype() == xsd::STRING).then(|| Some(options.value()))
        } else {
            None
        }
    } else {
        Some(None)
    };
    if let (Some(static_pattern), Some(static_options)) = (static_pattern, static_options) {
        compile_pattern(static_pattern, static_options)
    } else {
        None
    }
}

fn compile_pattern(pattern: &str, flags: Option<&str>) -> Option<Regex> {
    let mut pattern = Cow::Borrowed(pattern);
    let flags = flags.unwrap_or_default();
    if flags.contains('q') {
        pattern = regex::escape(&pattern).into();
    }
    let mut regex_builder = RegexBuilder::new(&pattern);
    regex_builder.size_limit(REGEX_SIZE_LIMIT);
    for flag in flags.chars() {
        match flag {
            's' => {
                regex_builder.dot_matches_new_line(true);
            }
            'm' => {
                regex_builder.multi_line(true);
            }
            'i' => {
                regex_builder.case_insensitive(true);
            }
            'x' => {
                regex_builder.ignore_whitespace(true);
            }
            'q' => (),        // Already supported
            _ => return None, // invalid option
        }
    }
    regex_builder.build().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integer(value: i64) -> Term {
        Literal::from(value).into()
    }

    #[test]
    fn numeric_promotion_prefers_the_wider_type() {
        let a: Term = Literal::from(1_i64).into();
        let b: Term = Literal::new_typed_literal("2.5", xsd::DECIMAL).into();
        assert!(matches!(
            NumericPair::new(&a, &b),
            Some(NumericPair::Decimal(_, _))
        ));
        let c: Term = Literal::from(2.5_f64).into();
        assert!(matches!(
            NumericPair::new(&a, &c),
            Some(NumericPair::Double(_, _))
        ));
    }

    #[test]
    fn equals_compares_numeric_values_across_datatypes() {
        let a: Term = Literal::from(1_i64).into();
        let b: Term = Literal::new_typed_literal("1.0", xsd::DECIMAL).into();
        assert_eq!(equals(&a, &b), Some(true));
        assert_eq!(equals(&a, &integer(2)), Some(false));
    }

    #[test]
    fn equals_is_unknown_for_uninterpreted_datatypes() {
        let a: Term = Literal::new_typed_literal("x", NamedNode::new_unchecked("http://example.com/dt")).into();
        let b: Term = Literal::new_typed_literal("y", NamedNode::new_unchecked("http://example.com/dt")).into();
        assert_eq!(equals(&a, &b), None);
    }

    #[test]
    fn effective_boolean_value_of_strings_and_numbers() {
        assert_eq!(
            effective_boolean_value(&Literal::from("").into()),
            Some(false)
        );
        assert_eq!(
            effective_boolean_value(&Literal::from("a").into()),
            Some(true)
        );
        assert_eq!(effective_boolean_value(&integer(0)), Some(false));
        assert_eq!(effective_boolean_value(&integer(7)), Some(true));
        assert_eq!(
            effective_boolean_value(&NamedNode::new_unchecked("http://example.com").into()),
            None
        );
    }

    #[test]
    fn cmp_terms_ranks_unbound_first_and_blank_nodes_before_iris() {
        let blank: Term = oxrdf::BlankNode::new_unchecked("b").into();
        let iri: Term = NamedNode::new_unchecked("http://example.com").into();
        assert_eq!(cmp_terms(None, Some(&blank)), Ordering::Less);
        assert_eq!(cmp_terms(Some(&blank), Some(&iri)), Ordering::Less);
        assert_eq!(cmp_terms(Some(&iri), Some(&integer(1))), Ordering::Less);
        assert_eq!(
            cmp_terms(Some(&integer(1)), Some(&integer(2))),
            Ordering::Less
        );
    }

    #[test]
    fn regex_flags() {
        assert!(compile_pattern("ab", Some("i")).unwrap().is_match("AB"));
        assert!(compile_pattern("a.b", Some("q")).unwrap().is_match("a.b"));
        assert!(!compile_pattern("a.b", Some("q")).unwrap().is_match("axb"));
        assert!(compile_pattern("a", Some("z")).is_none());
    }
}
