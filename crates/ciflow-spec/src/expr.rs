use std::collections::BTreeMap;

use crate::workflow::SpecError;

/// Values visible to `${{ ... }}` expressions inside a job.
#[derive(Clone, Debug, Default)]
pub struct ExprScope {
    pub matrix: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
}

impl ExprScope {
    fn lookup(&self, reference: &str) -> Result<&str, SpecError> {
        let (ns, key) = reference
            .split_once('.')
            .ok_or_else(|| SpecError::UnknownExpr(reference.to_string()))?;
        let table = match ns {
            "matrix" => &self.matrix,
            "env" => &self.env,
            _ => return Err(SpecError::UnknownExpr(reference.to_string())),
        };
        table
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| SpecError::UnknownRef(reference.to_string()))
    }
}

/// Replaces every `${{ matrix.KEY }}` / `${{ env.KEY }}` in `text`.
pub fn interpolate(text: &str, scope: &ExprScope) -> Result<String, SpecError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let end = after
            .find("}}")
            .ok_or_else(|| SpecError::UnterminatedExpr(text.to_string()))?;
        out.push_str(scope.lookup(after[..end].trim())?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Applies [`interpolate`] to every string (not keys) inside a JSON tree.
pub fn interpolate_json(v: serde_json::Value, scope: &ExprScope) -> Result<serde_json::Value, SpecError> {
    use serde_json::Value;
    Ok(match v {
        Value::String(s) => Value::String(interpolate(&s, scope)?),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|i| interpolate_json(i, scope))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, child) in map {
                out.insert(k, interpolate_json(child, scope)?);
            }
            Value::Object(out)
        }
        other => other,
    })
}
