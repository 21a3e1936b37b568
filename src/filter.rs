//! Search filters as a three-valued boolean tree (RFC 4511 section 4.5.1.7).

use crate::entry::{get_values, Attributes};
use crate::ldap_protocol::RawFilter;
use crate::matching::MatchingRule;
use crate::schema::{AttributeType, Schema};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Undefined,
}

impl From<bool> for Truth {
    fn from(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }
}

impl From<Option<bool>> for Truth {
    fn from(b: Option<bool>) -> Self {
        b.map(Truth::from).unwrap_or(Truth::Undefined)
    }
}

impl Truth {
    pub fn is_true(self) -> bool {
        self == Truth::True
    }
}

impl std::ops::Not for Truth {
    type Output = Truth;

    fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Undefined => Truth::Undefined,
        }
    }
}

/// `attr <op> value` with the rule that performs the comparison. Without a
/// schema the rule is `MatchingRule::default_match` and values are compared
/// as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    pub attr: String,
    pub rule: Arc<MatchingRule>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubstringAssertion {
    pub attr: String,
    pub rule: Arc<MatchingRule>,
    pub initial: Option<String>,
    pub any: Vec<String>,
    pub final_: Option<String>,
}

/// A parsed filter. With a schema, attribute names are canonical
/// (`commonname` becomes `cn`); without one they are as the client sent them.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    True,
    False,
    Undef,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Eq(Assertion),
    Approx(Assertion),
    Ge(Assertion),
    Le(Assertion),
    Substrings(SubstringAssertion),
}

enum RuleKind {
    Equality,
    Ordering,
    Substrings,
}

/// What a filter is built against: the schema, or the raw-value rule used
/// when there is none.
enum Rules<'a> {
    Schema(&'a Schema),
    Raw(Arc<MatchingRule>),
}

impl Rules<'_> {
    fn schema(&self) -> Option<&Schema> {
        match self {
            Rules::Schema(schema) => Some(*schema),
            Rules::Raw(_) => None,
        }
    }

    /// Canonical name and rule for `attr`, or `None` when the filter item can
    /// never be decided: unknown attribute, or no rule of the needed kind.
    fn resolve(&self, attr: &str, kind: RuleKind) -> Option<(String, Arc<MatchingRule>)> {
        let schema = match self {
            Rules::Schema(schema) => schema,
            Rules::Raw(rule) => return Some((attr.to_string(), rule.clone())),
        };
        let at: &AttributeType = schema.attribute_type(attr)?;
        let rule = match kind {
            RuleKind::Equality => at.equality_rule(),
            RuleKind::Ordering => at.ordering_rule(),
            RuleKind::Substrings => at.substr_rule(),
        }?;
        Some((at.name().to_string(), rule.clone()))
    }

    fn assertion(&self, attr: &str, value: &str, kind: RuleKind) -> Option<Assertion> {
        self.resolve(attr, kind).map(|(attr, rule)| Assertion {
            attr,
            rule,
            value: value.to_string(),
        })
    }
}

impl Filter {
    /// Build a filter tree from the wire form. Trivial branches are folded
    /// away: `(&(objectClass=*)(cn=foo))` becomes `(cn=foo)`. Items naming
    /// an attribute the schema does not know become `Undef`.
    pub fn parse(raw: &RawFilter, schema: Option<&Schema>) -> Filter {
        let rules = match schema {
            Some(schema) => Rules::Schema(schema),
            None => Rules::Raw(Arc::new(MatchingRule::default_match())),
        };
        Filter::build(raw, &rules)
    }

    fn build(raw: &RawFilter, rules: &Rules<'_>) -> Filter {
        match raw {
            RawFilter::And(items) => {
                let conds: Vec<Filter> = items
                    .iter()
                    .map(|f| Filter::build(f, rules))
                    .filter(|f| *f != Filter::True)
                    .collect();
                if conds.contains(&Filter::False) {
                    return Filter::False;
                }
                match conds.len() {
                    0 => Filter::True,
                    1 => conds.into_iter().next().unwrap_or(Filter::True),
                    _ => Filter::And(conds),
                }
            }
            RawFilter::Or(items) => {
                let conds: Vec<Filter> = items
                    .iter()
                    .map(|f| Filter::build(f, rules))
                    .filter(|f| *f != Filter::False)
                    .collect();
                if conds.contains(&Filter::True) {
                    return Filter::True;
                }
                match conds.len() {
                    0 => Filter::False,
                    1 => conds.into_iter().next().unwrap_or(Filter::False),
                    _ => Filter::Or(conds),
                }
            }
            RawFilter::Not(inner) => match Filter::build(inner, rules) {
                Filter::True => Filter::False,
                Filter::False => Filter::True,
                Filter::Undef => Filter::Undef,
                f => Filter::Not(Box::new(f)),
            },
            RawFilter::EqualityMatch(attr, value) => {
                if attr.eq_ignore_ascii_case("objectClass") && value.eq_ignore_ascii_case("top") {
                    return Filter::True;
                }
                rules.assertion(attr, value, RuleKind::Equality)
                    .map(Filter::Eq)
                    .unwrap_or(Filter::Undef)
            }
            RawFilter::ApproxMatch(attr, value) => rules.assertion(attr, value, RuleKind::Equality)
                .map(Filter::Approx)
                .unwrap_or(Filter::Undef),
            RawFilter::GreaterOrEqual(attr, value) => rules.assertion(attr, value, RuleKind::Ordering)
                .map(Filter::Ge)
                .unwrap_or(Filter::Undef),
            RawFilter::LessOrEqual(attr, value) => rules.assertion(attr, value, RuleKind::Ordering)
                .map(Filter::Le)
                .unwrap_or(Filter::Undef),
            RawFilter::Substrings {
                attr,
                initial,
                any,
                final_,
            } => match rules.resolve(attr, RuleKind::Substrings) {
                Some((attr, rule)) => Filter::Substrings(SubstringAssertion {
                    attr,
                    rule,
                    initial: initial.clone(),
                    any: any.clone(),
                    final_: final_.clone(),
                }),
                None => Filter::Undef,
            },
            RawFilter::Present(attr) => {
                if attr.eq_ignore_ascii_case("objectClass") {
                    return Filter::True;
                }
                match rules.schema() {
                    Some(schema) => match schema.attribute_type(attr) {
                        Some(at) => Filter::Present(at.name().to_string()),
                        None => Filter::Undef,
                    },
                    None => Filter::Present(attr.clone()),
                }
            }
            RawFilter::ExtensibleMatch { .. } => Filter::Undef,
        }
    }

    /// Evaluate against an entry's attributes. `Undefined` only ever
    /// means false to a caller deciding whether to return the entry.
    pub fn eval(&self, av: &Attributes) -> Truth {
        match self {
            Filter::True => Truth::True,
            Filter::False => Truth::False,
            Filter::Undef => Truth::Undefined,
            Filter::And(children) => {
                let mut res = Truth::True;
                for child in children {
                    match child.eval(av) {
                        Truth::False => return Truth::False,
                        Truth::Undefined => res = Truth::Undefined,
                        Truth::True => {}
                    }
                }
                res
            }
            Filter::Or(children) => {
                let mut res = Truth::False;
                for child in children {
                    match child.eval(av) {
                        Truth::True => return Truth::True,
                        Truth::Undefined => res = Truth::Undefined,
                        Truth::False => {}
                    }
                }
                res
            }
            Filter::Not(inner) => !inner.eval(av),
            Filter::Present(attr) => get_values(av, attr).map(|v| !v.is_empty()).unwrap_or(false).into(),
            Filter::Eq(a) | Filter::Approx(a) => a.compare(av, MatchingRule::equality_match),
            Filter::Ge(a) => a.compare(av, MatchingRule::greater_or_equal),
            Filter::Le(a) => a.compare(av, MatchingRule::less_or_equal),
            Filter::Substrings(s) => {
                let Some(values) = get_values(av, &s.attr) else {
                    return Truth::False;
                };
                s.rule
                    .substrings(values, s.initial.as_deref(), &s.any, s.final_.as_deref())
                    .into()
            }
        }
    }

    /// Attribute names referenced by the leaves of this filter.
    pub fn attributes(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_attributes(&mut out);
        out
    }

    fn collect_attributes<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::And(c) | Filter::Or(c) => c.iter().for_each(|f| f.collect_attributes(out)),
            Filter::Not(f) => f.collect_attributes(out),
            Filter::Present(a) => out.push(a),
            Filter::Eq(a) | Filter::Approx(a) | Filter::Ge(a) | Filter::Le(a) => out.push(&a.attr),
            Filter::Substrings(s) => out.push(&s.attr),
            Filter::True | Filter::False | Filter::Undef => {}
        }
    }
}

impl Assertion {
    fn compare(&self, av: &Attributes, op: fn(&MatchingRule, &[String], &str) -> Option<bool>) -> Truth {
        let Some(values) = get_values(av, &self.attr) else {
            return Truth::False;
        };
        op(&self.rule, values, &self.value).into()
    }
}
