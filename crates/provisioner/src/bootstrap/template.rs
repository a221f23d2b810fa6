//! `${NAME}` placeholder substitution.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use thiserror::Error;

/// `${UPPER_SNAKE_CASE}` placeholders.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Z0-9_]+)\}").expect("placeholder pattern is valid"));

/// Errors from strict rendering.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    /// Placeholders without a value.
    #[error("Unresolved placeholders: {}", .0.join(", "))]
    Unresolved(Vec<String>),
}

/// Substitute every placeholder; placeholders without a value become `""`.
///
/// Text that merely resembles a placeholder (`${lower}`, `$NAME`) is kept.
#[must_use]
pub fn render(template: &str, values: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            values.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Names of all placeholders in a template.
#[must_use]
pub fn placeholders(template: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Substitute every placeholder, failing if any has no value.
///
/// # Errors
/// Returns [`TemplateError::Unresolved`] listing every missing name.
pub fn render_strict(
    template: &str,
    values: &HashMap<String, String>,
) -> Result<String, TemplateError> {
    let missing: Vec<String> = placeholders(template)
        .into_iter()
        .filter(|name| !values.contains_key(name))
        .collect();

    if missing.is_empty() {
        Ok(render(template, values))
    } else {
        Err(TemplateError::Unresolved(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_every_occurrence() {
        let out = render(
            "node ${NODE_IP} joins ${SERVER_API} as ${ROLE}; ip=${NODE_IP}",
            &values(&[
                ("NODE_IP", "10.0.1.20"),
                ("SERVER_API", "https://10.0.1.10:6443"),
                ("ROLE", "worker"),
            ]),
        );
        assert_eq!(
            out,
            "node 10.0.1.20 joins https://10.0.1.10:6443 as worker; ip=10.0.1.20"
        );
    }

    #[test]
    fn test_render_missing_key_is_empty() {
        assert_eq!(render("token=${K3S_TOKEN}!", &HashMap::new()), "token=!");
    }

    #[test]
    fn test_render_leaves_non_placeholders() {
        let template = "${lower} $ROLE ${ROLE";
        assert_eq!(render(template, &values(&[("ROLE", "x")])), template);
    }

    #[test]
    fn test_render_does_not_rescan_values() {
        let out = render("${A}", &values(&[("A", "${B}"), ("B", "nested")]));
        assert_eq!(out, "${B}");
    }

    #[test]
    fn test_placeholders() {
        let names = placeholders("${B} ${A} ${B} ${lower}");
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn test_render_strict() {
        let vals = values(&[("A", "1")]);
        assert_eq!(render_strict("${A}", &vals).unwrap(), "1");
        assert_eq!(
            render_strict("${A} ${C} ${B}", &vals),
            Err(TemplateError::Unresolved(vec!["B".to_string(), "C".to_string()]))
        );
    }
}
