//! Explains results: which entrypoints passed and what they compared.

use std::collections::BTreeMap;

use serde_json::{json, Value as Json};

use crate::code::{Call, Code, Ref};
use crate::convert::to_runtime;
use crate::value::RuntimeValue;

/// Comparison operators, longest first.
const COMPARABLE: [&str; 8] = ["==", "!=", ">=", "<=", "&&", "||", ">", "<"];

/// The comparison operator in a builtin signature such as `int==[]int`.
pub fn comparable_label(id: &str) -> Option<&'static str> {
    let start = id.find(['=', '!', '>', '<', '&', '|'])?;
    let rest = &id[start..];
    COMPARABLE.into_iter().find(|op| rest.starts_with(*op))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentItem {
    pub checksum: String,
    pub entrypoint: Ref,
    pub success: bool,
    pub error: Option<String>,
    pub operation: Option<String>,
    pub actual: Option<RuntimeValue>,
    pub expected: Option<RuntimeValue>,
    pub is_assertion: bool,
}

impl AssessmentItem {
    fn new(checksum: &str, entrypoint: Ref, result: &RuntimeValue) -> Self {
        Self {
            checksum: checksum.to_string(),
            entrypoint,
            success: result.is_success(),
            error: result.error.as_ref().map(ToString::to_string),
            operation: None,
            actual: None,
            expected: None,
            is_assertion: false,
        }
    }

    pub fn to_json(&self) -> Json {
        json!({
            "checksum": self.checksum,
            "entrypoint": self.entrypoint.to_string(),
            "success": self.success,
            "error": self.error,
            "operation": self.operation,
            "actual": self.actual.as_ref().map(RuntimeValue::to_json),
            "expected": self.expected.as_ref().map(RuntimeValue::to_json),
            "is_assertion": self.is_assertion,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    /// The code id.
    pub checksum: String,
    pub success: bool,
    pub is_assertion: bool,
    pub results: Vec<AssessmentItem>,
}

impl Assessment {
    pub fn to_json(&self) -> Json {
        json!({
            "checksum": self.checksum,
            "success": self.success,
            "is_assertion": self.is_assertion,
            "results": self.results.iter().map(AssessmentItem::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Builds an assessment of the root entrypoints from results looked up by
/// checksum. `None` when nothing asserted anything and nothing failed.
pub fn assess<F>(code: &Code, lookup: F) -> Option<Assessment>
where
    F: Fn(&str) -> Option<RuntimeValue>,
{
    let mut assessment = Assessment {
        checksum: code.id.clone(),
        success: true,
        is_assertion: false,
        results: Vec::new(),
    };
    for entrypoint in code.entrypoints() {
        let Some(item) = assess_entrypoint(code, *entrypoint, &lookup) else {
            continue;
        };
        assessment.success &= item.success;
        assessment.is_assertion |= item.is_assertion || item.error.is_some();
        assessment.results.push(item);
    }
    assessment.is_assertion.then_some(assessment)
}

/// [`assess`] over results collected by checksum.
pub fn assess_results(code: &Code, results: &BTreeMap<String, RuntimeValue>) -> Option<Assessment> {
    assess(code, |sum| results.get(sum).cloned())
}

fn assess_entrypoint<F>(code: &Code, at: Ref, lookup: &F) -> Option<AssessmentItem>
where
    F: Fn(&str) -> Option<RuntimeValue>,
{
    let checksum = code.checksum_of(at).ok()?;
    let result = lookup(checksum)?;
    let mut item = AssessmentItem::new(checksum, at, &result);

    let Ok(chunk) = code.chunk(at) else {
        item.error = Some(format!("cannot find chunk {at}"));
        return Some(item);
    };
    // Nested branches have no flat explanation.
    if chunk.id == "if" {
        return None;
    }
    let func = match &chunk.call {
        Call::Primitive(value) => {
            item.actual = Some(to_runtime(value));
            return Some(item);
        }
        Call::Property(_) => {
            item.actual = Some(result);
            return Some(item);
        }
        Call::Function(func) => func,
    };
    if chunk.id.is_empty() {
        item.error = Some("chunk has no identifier".to_string());
        return Some(item);
    }

    if let Some(operation) = chunk.id.strip_prefix('$').filter(|name| {
        matches!(*name, "all" | "any" | "none" | "one")
    }) {
        item.is_assertion = true;
        item.operation = Some(operation.to_string());
        if item.success {
            item.actual = Some(RuntimeValue::bool(true));
            return Some(item);
        }
        let Some(list) = func.binding.map(|list| detailed_list(code, list)) else {
            return Some(item);
        };
        match code.checksum_of(list).ok().and_then(lookup) {
            Some(value) => item.actual = Some(value),
            None => {
                item.error = Some(format!("cannot find value for assessment ({operation})"));
            }
        }
        return Some(item);
    }

    let Some(operation) = comparable_label(&chunk.id) else {
        if result.typ == crate::types::Type::Bool {
            item.operation = Some("==".to_string());
            item.expected = Some(RuntimeValue::bool(true));
            item.is_assertion = true;
        }
        item.actual = Some(result);
        return Some(item);
    };
    item.operation = Some(operation.to_string());
    item.is_assertion = true;

    if let Some(left) = func.binding {
        item.actual = match code.chunk(left) {
            Ok(left_chunk) if left_chunk.is_static() => left_chunk.as_primitive().map(to_runtime),
            Ok(_) => code.checksum_of(left).ok().and_then(lookup),
            Err(_) => None,
        };
    }
    if let Some(right) = func.args.first() {
        item.expected = match right.as_ref().filter(|_| right.is_ref()) {
            Some(target) => code.checksum_of(target).ok().and_then(lookup),
            None => Some(to_runtime(right)),
        };
    }
    Some(item)
}

/// A root datapoint bound to `list` carries more detail than the list.
fn detailed_list(code: &Code, list: Ref) -> Ref {
    code.datapoints()
        .iter()
        .rev()
        .copied()
        .filter(|point| *point != list)
        .find(|point| {
            code.chunk(*point)
                .map(|chunk| chunk.binding() == Some(list))
                .unwrap_or(false)
        })
        .unwrap_or(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeBuilder;
    use crate::error::Error;
    use crate::types::Type;
    use crate::wire::TypedValue;

    #[test]
    fn comparable_labels() {
        assert_eq!(comparable_label("==int"), Some("=="));
        assert_eq!(comparable_label("int!=[]int"), Some("!="));
        assert_eq!(comparable_label(">=float"), Some(">="));
        assert_eq!(comparable_label("<int"), Some("<"));
        assert_eq!(comparable_label("any||bool"), Some("||"));
        assert_eq!(comparable_label("length"), None);
        assert_eq!(comparable_label("!x"), None);
        assert_eq!(comparable_label(""), None);
    }

    fn results(pairs: &[(&str, RuntimeValue)]) -> BTreeMap<String, RuntimeValue> {
        pairs
            .iter()
            .map(|(sum, value)| (sum.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn comparisons_report_both_sides() {
        let mut builder = CodeBuilder::new();
        let text = builder.literal(TypedValue::string("a,b")).unwrap();
        let len = builder.method(text, "length", Vec::new()).unwrap();
        let check = builder.op(len, "==", TypedValue::int(4)).unwrap();
        builder.entrypoint(check).unwrap();
        let code = builder.finish().unwrap();

        let collected = results(&[
            (code.checksum_of(len).unwrap(), RuntimeValue::int(3)),
            (code.checksum_of(check).unwrap(), RuntimeValue::bool(false)),
        ]);
        let assessment = assess_results(&code, &collected).unwrap();
        assert!(!assessment.success);
        assert!(assessment.is_assertion);
        let item = &assessment.results[0];
        assert_eq!(item.operation.as_deref(), Some("=="));
        assert_eq!(item.actual, Some(RuntimeValue::int(3)));
        assert_eq!(item.expected, Some(RuntimeValue::int(4)));
        assert_eq!(assessment.to_json()["results"][0]["expected"], json!(4));
    }

    #[test]
    fn plain_values_are_not_assertions() {
        let mut builder = CodeBuilder::new();
        let value = builder.literal(TypedValue::int(7)).unwrap();
        builder.entrypoint(value).unwrap();
        let code = builder.finish().unwrap();
        let collected = results(&[(code.checksum_of(value).unwrap(), RuntimeValue::int(7))]);
        assert!(assess_results(&code, &collected).is_none());

        let failed = results(&[(
            code.checksum_of(value).unwrap(),
            RuntimeValue::typed_error(Type::Int, Error::eval("boom")),
        )]);
        let assessment = assess_results(&code, &failed).unwrap();
        assert_eq!(assessment.results[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn quantifiers_report_the_list_on_failure() {
        let mut builder = CodeBuilder::new();
        let list = builder
            .literal(TypedValue::array(vec![TypedValue::int(1)], Type::Int))
            .unwrap();
        let all = builder
            .all(list, list, |b, params| b.op(params[0], ">", TypedValue::int(5)))
            .unwrap();
        builder.entrypoint(all).unwrap();
        let code = builder.finish().unwrap();

        let failing = code.chunk(all).unwrap().binding().unwrap();
        let leftovers = RuntimeValue::array(vec![crate::value::Data::Int(1)], Type::Int);
        let collected = results(&[
            (code.checksum_of(all).unwrap(), RuntimeValue::bool(false)),
            (code.checksum_of(failing).unwrap(), leftovers.clone()),
        ]);
        let item = &assess_results(&code, &collected).unwrap().results[0];
        assert_eq!(item.operation.as_deref(), Some("all"));
        assert_eq!(item.actual, Some(leftovers));
    }

    #[test]
    fn bare_booleans_compare_against_true() {
        let mut builder = CodeBuilder::new();
        let list = builder
            .literal(TypedValue::array(Vec::new(), Type::Int))
            .unwrap();
        let filled = builder.method(list, "notEmpty", Vec::new()).unwrap();
        builder.entrypoint(filled).unwrap();
        let code = builder.finish().unwrap();
        let collected = results(&[(code.checksum_of(filled).unwrap(), RuntimeValue::bool(false))]);
        let item = &assess_results(&code, &collected).unwrap().results[0];
        assert_eq!(item.operation.as_deref(), Some("=="));
        assert_eq!(item.expected, Some(RuntimeValue::bool(true)));
        assert_eq!(item.actual, Some(RuntimeValue::bool(false)));
    }
}
