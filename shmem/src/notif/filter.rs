//! Xpath filters of notification subscriptions.
//!
//! A filter is an absolute location path of child steps. Each step may carry
//! key-equality predicates (`[key='value']`, or `[.='value']` on the node's
//! own value). A notification matches when the filter selects at least one
//! node of its tree.

use crate::data::{DataNode, NodeKind};
use crate::errors::{Result, SrError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Predicate {
    /// Key leaf name without prefix, `.` for the node's own value.
    key: String,
    value: String,
}

impl Predicate {
    fn holds(&self, node: &DataNode) -> bool {
        if self.key == "." {
            return node.value.as_deref() == Some(self.value.as_str());
        }
        node.keys.iter().any(|(k, v)| *k == self.key && *v == self.value)
            || node.children.iter().any(|c| {
                matches!(c.kind, NodeKind::Leaf(_)) && c.name == self.key && c.value.as_deref() == Some(self.value.as_str())
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    /// `None` inherits the module of the previous step.
    module: Option<String>,
    /// Node name or `*`.
    name: String,
    predicates: Vec<Predicate>,
}

impl Step {
    fn selects(&self, node: &DataNode, parent_module: &str) -> bool {
        let module = self.module.as_deref().unwrap_or(parent_module);
        module == node.module
            && (self.name == "*" || self.name == node.name)
            && self.predicates.iter().all(|p| p.holds(node))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifFilter {
    xpath: String,
    steps: Vec<Step>,
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Splits an absolute path into its steps, `None` on unbalanced quotes or
/// brackets.
fn split_steps(xpath: &str) -> Option<Vec<&str>> {
    let rest = xpath.strip_prefix('/')?;
    let mut steps = Vec::new();
    let mut quote = None;
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in rest.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '[' => depth += 1,
                ']' => depth = depth.checked_sub(1)?,
                '/' if depth == 0 => {
                    steps.push(&rest[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    if quote.is_some() || depth != 0 {
        return None;
    }
    steps.push(&rest[start..]);
    Some(steps)
}

fn parse_step(step: &str) -> Option<Step> {
    let (head, mut rest) = match step.find('[') {
        Some(i) => (&step[..i], &step[i..]),
        None => (step, ""),
    };
    let (module, name) = match head.split_once(':') {
        Some((m, n)) => (Some(m), n),
        None => (None, head),
    };
    if module.map_or(false, |m| !is_ident(m)) || !(name == "*" || is_ident(name)) {
        return None;
    }

    let mut predicates = Vec::new();
    while let Some(body) = rest.strip_prefix('[') {
        let (key, after) = body.split_once('=')?;
        let key = key.trim();
        let key = key.rsplit(':').next().unwrap_or(key);
        if key != "." && !is_ident(key) {
            return None;
        }
        let after = after.trim_start();
        let q = after.chars().next().filter(|&c| c == '\'' || c == '"')?;
        let after = &after[1..];
        let end = after.find(q)?;
        predicates.push(Predicate {
            key: key.to_string(),
            value: after[..end].to_string(),
        });
        rest = after[end + 1..].trim_start().strip_prefix(']')?;
    }
    if !rest.is_empty() {
        return None;
    }
    Some(Step {
        module: module.map(str::to_string),
        name: name.to_string(),
        predicates,
    })
}

impl NotifFilter {
    /// Fails with a validation error for anything beyond child steps with
    /// key-equality predicates, and when the first step has no module prefix.
    pub fn parse(xpath: &str) -> Result<NotifFilter> {
        let invalid = || SrError::Validation(format!("Unsupported notification filter \"{}\".", xpath));
        let steps = split_steps(xpath)
            .ok_or_else(invalid)?
            .into_iter()
            .map(|s| if s.is_empty() { None } else { parse_step(s) })
            .collect::<Option<Vec<Step>>>()
            .ok_or_else(invalid)?;
        match steps.first() {
            Some(first) if first.module.is_some() => Ok(NotifFilter {
                xpath: xpath.to_string(),
                steps,
            }),
            _ => Err(invalid()),
        }
    }

    pub fn xpath(&self) -> &str {
        &self.xpath
    }

    /// Whether the filter selects `notif` or any node below it.
    pub fn matches(&self, notif: &DataNode) -> bool {
        match self.steps.split_first() {
            Some((first, rest)) => first.selects(notif, &notif.module) && selects_below(notif, rest),
            None => false,
        }
    }
}

fn selects_below(node: &DataNode, steps: &[Step]) -> bool {
    match steps.split_first() {
        Some((step, rest)) => node
            .children
            .iter()
            .any(|c| step.selects(c, &node.module) && selects_below(c, rest)),
        None => true,
    }
}
