//! Query filters and ordering.
//!
//! Filters are small expression trees over property comparisons. Operands
//! are either literal values or positional parameters; parameters must be
//! bound with [`Filter::bind`] before the filter is evaluated.

use crate::error::{FetchError, FetchResult};
use crate::record::Record;
use crate::value::Value;
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

impl CompareOp {
    fn test(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// A literal value.
    Value(Value),
    /// A positional parameter, bound later.
    Param(usize),
}

/// A filter expression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Filter {
    /// Matches every record.
    #[default]
    All,
    /// Compares a property against an operand.
    Compare {
        /// Property name.
        property: String,
        /// Operator.
        op: CompareOp,
        /// Operand.
        operand: Operand,
    },
    /// Matches when every child matches.
    And(Vec<Filter>),
    /// Matches when any child matches.
    Or(Vec<Filter>),
    /// Negation.
    Not(Box<Filter>),
}

impl Filter {
    /// Builds `property op value`.
    pub fn compare(property: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            property: property.into(),
            op,
            operand: Operand::Value(value.into()),
        }
    }

    /// Builds `property = value`.
    pub fn equal(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Eq, value)
    }

    /// Builds `property op ?index`.
    pub fn param(property: impl Into<String>, op: CompareOp, index: usize) -> Self {
        Self::Compare {
            property: property.into(),
            op,
            operand: Operand::Param(index),
        }
    }

    /// Conjunction with `other`.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Self::All, f) | (f, Self::All) => f,
            (Self::And(mut a), Self::And(b)) => {
                a.extend(b);
                Self::And(a)
            }
            (Self::And(mut a), f) => {
                a.push(f);
                Self::And(a)
            }
            (f, g) => Self::And(vec![f, g]),
        }
    }

    /// Disjunction with `other`.
    #[must_use]
    pub fn or(self, other: Filter) -> Self {
        match (self, other) {
            (Self::Or(mut a), f) => {
                a.push(f);
                Self::Or(a)
            }
            (f, g) => Self::Or(vec![f, g]),
        }
    }

    /// Negation.
    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Returns true if the filter contains no unbound parameters.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        match self {
            Self::All => true,
            Self::Compare { operand, .. } => matches!(operand, Operand::Value(_)),
            Self::And(fs) | Self::Or(fs) => fs.iter().all(Filter::is_bound),
            Self::Not(f) => f.is_bound(),
        }
    }

    /// Returns the names of the properties the filter reads.
    #[must_use]
    pub fn properties(&self) -> Vec<&str> {
        match self {
            Self::All => Vec::new(),
            Self::Compare { property, .. } => vec![property.as_str()],
            Self::And(fs) | Self::Or(fs) => fs.iter().flat_map(Filter::properties).collect(),
            Self::Not(f) => f.properties(),
        }
    }

    /// Substitutes positional parameters with `params`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidQuery`] if a parameter index has no
    /// value.
    pub fn bind(&self, params: &[Value]) -> FetchResult<Filter> {
        Ok(match self {
            Self::All => Self::All,
            Self::Compare {
                property,
                op,
                operand,
            } => {
                let operand = match operand {
                    Operand::Value(v) => Operand::Value(v.clone()),
                    Operand::Param(i) => Operand::Value(params.get(*i).cloned().ok_or_else(
                        || FetchError::InvalidQuery(format!("parameter ?{i} is not bound")),
                    )?),
                };
                Self::Compare {
                    property: property.clone(),
                    op: *op,
                    operand,
                }
            }
            Self::And(fs) => Self::And(fs.iter().map(|f| f.bind(params)).collect::<Result<_, _>>()?),
            Self::Or(fs) => Self::Or(fs.iter().map(|f| f.bind(params)).collect::<Result<_, _>>()?),
            Self::Not(f) => Self::Not(Box::new(f.bind(params)?)),
        })
    }

    /// Evaluates the filter against `record`.
    ///
    /// # Errors
    ///
    /// Fails on unknown properties and unbound parameters.
    pub fn matches(&self, record: &Record) -> FetchResult<bool> {
        match self {
            Self::All => Ok(true),
            Self::Compare {
                property,
                op,
                operand,
            } => {
                let value = record.get(property).ok_or_else(|| {
                    FetchError::InvalidQuery(format!(
                        "{} has no property {property}",
                        record.schema().name()
                    ))
                })?;
                match operand {
                    Operand::Value(rhs) => Ok(op.test(value.cmp_key(rhs))),
                    Operand::Param(i) => Err(FetchError::InvalidQuery(format!(
                        "parameter ?{i} is not bound"
                    ))),
                }
            }
            Self::And(fs) => {
                for f in fs {
                    if !f.matches(record)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or(fs) => {
                for f in fs {
                    if f.matches(record)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not(f) => Ok(!f.matches(record)?),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("true"),
            Self::Compare {
                property,
                op,
                operand,
            } => match operand {
                Operand::Value(v) => write!(f, "{property} {} {v}", op.symbol()),
                Operand::Param(i) => write!(f, "{property} {} ?{i}", op.symbol()),
            },
            Self::And(fs) | Self::Or(fs) => {
                let sep = if matches!(self, Self::And(_)) { " & " } else { " | " };
                f.write_str("(")?;
                for (i, c) in fs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str(")")
            }
            Self::Not(c) => write!(f, "!{c}"),
        }
    }
}

/// One ordering term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    /// Property name.
    pub property: String,
    /// Sort descending instead of ascending.
    pub descending: bool,
}

impl OrderTerm {
    /// Ascending order on `property`.
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            descending: false,
        }
    }
}

/// A filter plus an ordering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    /// Row filter.
    pub filter: Filter,
    /// Result ordering. Stores break ties by primary key.
    pub order: Vec<OrderTerm>,
}

impl Query {
    /// Selects every record in store order.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Selects records matching `filter`.
    #[must_use]
    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter,
            order: Vec::new(),
        }
    }

    /// Sets ascending order over `properties`.
    #[must_use]
    pub fn order_by<S: AsRef<str>>(mut self, properties: &[S]) -> Self {
        self.order = properties
            .iter()
            .map(|p| OrderTerm::asc(p.as_ref()))
            .collect();
        self
    }

    /// Compares two records under this query's ordering.
    #[must_use]
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for term in &self.order {
            let ord = match (a.get(&term.property), b.get(&term.property)) {
                (Some(x), Some(y)) => x.cmp_key(y),
                _ => Ordering::Equal,
            };
            let ord = if term.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordLayout;
    use crate::schema::{PropertyKind, Schema};

    fn record(id: i64, name: &str) -> Record {
        let schema = Schema::builder("T")
            .key("id", PropertyKind::Integer)
            .property("name", PropertyKind::Text)
            .build()
            .unwrap();
        Record::new(RecordLayout::new(schema))
            .with("id", id)
            .unwrap()
            .with("name", name)
            .unwrap()
    }

    #[test]
    fn properties_lists_every_compared_property() {
        let filter = Filter::equal("id", 1)
            .and(Filter::param("name", CompareOp::Ne, 0).negate())
            .or(Filter::All);
        assert_eq!(filter.properties(), vec!["id", "name"]);
        assert!(Filter::All.properties().is_empty());
    }

    #[test]
    fn evaluates_compound_filters() {
        let r = record(5, "bob");
        assert!(Filter::equal("name", "bob").matches(&r).unwrap());
        let f = Filter::compare("id", CompareOp::Gt, 3).and(Filter::equal("name", "amy"));
        assert!(!f.matches(&r).unwrap());
        assert!(f.negate().matches(&r).unwrap());
        let f = Filter::equal("id", 1).or(Filter::equal("id", 5));
        assert!(f.matches(&r).unwrap());
    }

    #[test]
    fn parameters_must_be_bound() {
        let f = Filter::param("id", CompareOp::Le, 0);
        let r = record(5, "x");
        assert!(!f.is_bound());
        assert!(matches!(f.matches(&r), Err(FetchError::InvalidQuery(_))));
        assert!(f.bind(&[]).is_err());
        let bound = f.bind(&[Value::Integer(5)]).unwrap();
        assert!(bound.is_bound());
        assert!(bound.matches(&r).unwrap());
    }

    #[test]
    fn unknown_property_is_invalid() {
        let r = record(1, "x");
        assert!(Filter::equal("nope", 1).matches(&r).is_err());
    }

    #[test]
    fn compares_by_order_terms() {
        let q = Query::all().order_by(&["name"]);
        assert_eq!(q.compare(&record(1, "a"), &record(0, "b")), Ordering::Less);
        assert_eq!(q.compare(&record(1, "a"), &record(0, "a")), Ordering::Equal);
    }

    #[test]
    fn displays_readably() {
        let f = Filter::equal("id", 1).and(Filter::param("name", CompareOp::Ne, 0));
        assert_eq!(f.to_string(), "(id = 1 & name != ?0)");
    }
}
