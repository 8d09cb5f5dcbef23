use serde::Serialize;
use serde_json::Value;

/// Scoped to one comparison call. Carries the match counter the upstream algorithm exposes
/// for tests, and would carry a cycle-breaking visited set if this walk operated over
/// anything other than owned `serde_json::Value` trees (see module docs below).
#[derive(Debug, Default)]
pub struct TreeWalk {
    pub matches: usize,
}

impl TreeWalk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural "is `a` a subset of `b`?" test, recursing over parallel JSON trees.
    ///
    /// `k8s_openapi` models every optional field as `Option<T>` with
    /// `skip_serializing_if = "Option::is_none"`, so "desired has no opinion about this
    /// field" is represented by the key being absent from `a`'s serialized form rather than
    /// by a sentinel zero value the walker has to special-case. A present leaf that happens
    /// to equal its JSON zero value (`""`, `false`, `0`) is still treated as "don't care",
    /// matching the exact rule the original comparator applies to reflected zero values.
    pub fn subset_value_equal(&mut self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, _) => true,
            (_, Value::Null) => false,
            (Value::Array(xs), Value::Array(ys)) => {
                if ys.len() < xs.len() {
                    return false;
                }
                xs.iter()
                    .zip(ys.iter())
                    .all(|(x, y)| self.subset_value_equal(x, y))
            }
            (Value::Object(xm), Value::Object(ym)) => xm.iter().all(|(k, v)| {
                ym.get(k)
                    .is_some_and(|yv| self.subset_value_equal(v, yv))
            }),
            (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_)) => {
                if is_zero_leaf(a) {
                    true
                } else if a == b {
                    self.matches += 1;
                    true
                } else {
                    false
                }
            }
            // Different concrete JSON shapes: arrays can't subset-match objects, etc.
            _ => false,
        }
    }
}

fn is_zero_leaf(v: &Value) -> bool {
    match v {
        Value::Bool(b) => !*b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Returns true iff `desired` is a subset of `live`: every non-zero value present in
/// `desired` is present at the same structural path in `live`. This is the drift predicate
/// the reconciler uses to decide whether a child resource needs an update.
pub fn subset_equal<A, B>(desired: &A, live: &B) -> serde_json::Result<bool>
where
    A: Serialize,
    B: Serialize,
{
    let a = serde_json::to_value(desired)?;
    let b = serde_json::to_value(live)?;
    Ok(TreeWalk::new().subset_value_equal(&a, &b))
}
