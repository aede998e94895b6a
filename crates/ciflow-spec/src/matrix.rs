use std::collections::BTreeMap;

use crate::workflow::MatrixSpec;

/// One expanded matrix combination, keyed by axis name.
pub type Combination = BTreeMap<String, String>;

pub fn value_to_string(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}

fn to_combination(m: &BTreeMap<String, serde_yaml::Value>) -> Combination {
    m.iter().map(|(k, v)| (k.clone(), value_to_string(v))).collect()
}

/// Expands axes into their cartesian product, drops `exclude` matches and
/// applies `include` entries.
///
/// An include entry is merged into every combination whose original axis
/// values it does not contradict; if it fits none, it becomes a combination
/// of its own. A matrix with no axes and no includes yields one empty
/// combination so the job still runs once.
pub fn expand_matrix(spec: &MatrixSpec) -> Vec<Combination> {
    if spec.axes.is_empty() && spec.include.is_empty() {
        return vec![Combination::new()];
    }

    let mut combos: Vec<Combination> = if spec.axes.is_empty() {
        Vec::new()
    } else {
        let mut acc = vec![Combination::new()];
        for (axis, values) in &spec.axes {
            let mut next = Vec::with_capacity(acc.len() * values.len());
            for base in &acc {
                for v in values {
                    let mut c = base.clone();
                    c.insert(axis.clone(), value_to_string(v));
                    next.push(c);
                }
            }
            acc = next;
        }
        acc
    };

    let excludes: Vec<Combination> = spec.exclude.iter().map(to_combination).collect();
    combos.retain(|c| !excludes.iter().any(|e| e.iter().all(|(k, v)| c.get(k) == Some(v))));

    let original = combos.len();
    for inc in spec.include.iter().map(to_combination) {
        let mut merged = false;
        for c in combos.iter_mut().take(original) {
            let fits = inc
                .iter()
                .all(|(k, v)| !spec.axes.contains_key(k) || c.get(k) == Some(v));
            if fits {
                c.extend(inc.iter().map(|(k, v)| (k.clone(), v.clone())));
                merged = true;
            }
        }
        if !merged {
            combos.push(inc);
        }
    }

    combos
}

/// `job (v1, v2)` in axis-name order; just `job` for an empty combination.
pub fn instance_name(job_name: &str, combo: &Combination) -> String {
    if combo.is_empty() {
        return job_name.to_string();
    }
    let values: Vec<&str> = combo.values().map(String::as_str).collect();
    format!("{} ({})", job_name, values.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> MatrixSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn empty_matrix_runs_once() {
        let combos = expand_matrix(&MatrixSpec::default());
        assert_eq!(combos, vec![Combination::new()]);
        assert_eq!(instance_name("format", &combos[0]), "format");
    }

    #[test]
    fn cartesian_product() {
        let combos = expand_matrix(&spec("os: [ubuntu-latest, macos-latest, windows-latest]\npython: [3.8, '3.10']\n"));
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0]["os"], "ubuntu-latest");
        assert_eq!(combos[0]["python"], "3.8");
        assert_eq!(instance_name("tests", &combos[1]), "tests (ubuntu-latest, 3.10)");
    }

    #[test]
    fn exclude_removes_partial_matches() {
        let combos = expand_matrix(&spec(
            "os: [ubuntu, windows]\nvariant: [cpu, gpu]\nexclude:\n  - { os: windows, variant: gpu }\n",
        ));
        assert_eq!(combos.len(), 3);
        assert!(!combos.iter().any(|c| c["os"] == "windows" && c["variant"] == "gpu"));
    }

    #[test]
    fn include_extends_matching_and_adds_new() {
        let combos = expand_matrix(&spec(
            "os: [ubuntu, windows]\ninclude:\n  - { os: windows, shell: pwsh }\n  - { os: macos }\n",
        ));
        assert_eq!(combos.len(), 3);
        assert_eq!(combos[1].get("shell").map(String::as_str), Some("pwsh"));
        assert_eq!(combos[0].get("shell"), None);
        assert_eq!(combos[2]["os"], "macos");
    }

    #[test]
    fn include_without_axes_only_adds() {
        let combos = expand_matrix(&spec("include:\n  - { os: ubuntu }\n  - { os: macos }\n"));
        assert_eq!(combos.len(), 2);
    }

    #[test]
    fn include_with_new_key_only_merges_everywhere() {
        let combos = expand_matrix(&spec("os: [a, b]\ninclude:\n  - { experimental: true }\n"));
        assert_eq!(combos.len(), 2);
        assert!(combos.iter().all(|c| c["experimental"] == "true"));
    }
}
