//! Row predicates and partition pruning.
//!
//! A predicate is evaluated twice: once against each partition's key with
//! three-valued logic (a partition is skipped only when the predicate is
//! certainly false for every row in it), and then per row.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use super::value::Value;
use crate::store::PartitionKey;

/// Column holding a time-series partition's entity.
pub const ENTITY_COLUMN: &str = "ticker";
/// Column holding a time-series partition's granularity tag.
pub const GRANULARITY_COLUMN: &str = "granularity";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Predicate {
    #[default]
    True,
    Cmp {
        column: String,
        op: CmpOp,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
    IsNull(String),
    NotNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

/// Three-valued truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    fn not(self) -> Self {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }
}

fn cmp(column: &str, op: CmpOp, value: impl Into<Value>) -> Predicate {
    Predicate::Cmp {
        column: column.to_string(),
        op,
        value: value.into(),
    }
}

impl Predicate {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        cmp(column, CmpOp::Eq, value)
    }

    pub fn ne(column: &str, value: impl Into<Value>) -> Self {
        cmp(column, CmpOp::Ne, value)
    }

    pub fn lt(column: &str, value: impl Into<Value>) -> Self {
        cmp(column, CmpOp::Lt, value)
    }

    pub fn le(column: &str, value: impl Into<Value>) -> Self {
        cmp(column, CmpOp::Le, value)
    }

    pub fn gt(column: &str, value: impl Into<Value>) -> Self {
        cmp(column, CmpOp::Gt, value)
    }

    pub fn ge(column: &str, value: impl Into<Value>) -> Self {
        cmp(column, CmpOp::Ge, value)
    }

    pub fn is_in<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Predicate::In {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::True, p) | (p, Predicate::True) => p,
            (Predicate::And(mut a), Predicate::And(b)) => {
                a.extend(b);
                Predicate::And(a)
            }
            (Predicate::And(mut a), p) => {
                a.push(p);
                Predicate::And(a)
            }
            (a, b) => Predicate::And(vec![a, b]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::Or(mut a), p) => {
                a.push(p);
                Predicate::Or(a)
            }
            (a, b) => Predicate::Or(vec![a, b]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Columns the predicate reads.
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Predicate::True => {}
            Predicate::Cmp { column, .. }
            | Predicate::In { column, .. }
            | Predicate::IsNull(column)
            | Predicate::NotNull(column) => {
                out.insert(column.clone());
            }
            Predicate::And(ps) | Predicate::Or(ps) => ps.iter().for_each(|p| p.collect_columns(out)),
            Predicate::Not(p) => p.collect_columns(out),
        }
    }

    /// Evaluate against one partition key. Every row of a time-series
    /// partition shares its entity and granularity, so the key alone
    /// decides predicates on those columns; anything else is `Unknown`.
    pub fn on_partition(&self, key: &PartitionKey) -> Truth {
        match self {
            Predicate::True => Truth::True,
            Predicate::Cmp { column, op, value } => match key_value(key, column) {
                Some(v) => match v.compare(value) {
                    Some(ord) => Truth::from_bool(op.holds(ord)),
                    None => Truth::False,
                },
                None => Truth::Unknown,
            },
            Predicate::In { column, values } => match key_value(key, column) {
                Some(v) => Truth::from_bool(
                    values.iter().any(|x| v.compare(x) == Some(Ordering::Equal)),
                ),
                None => Truth::Unknown,
            },
            Predicate::IsNull(column) => match key_value(key, column) {
                Some(_) => Truth::False,
                None => Truth::Unknown,
            },
            Predicate::NotNull(column) => match key_value(key, column) {
                Some(_) => Truth::True,
                None => Truth::Unknown,
            },
            Predicate::And(ps) => {
                let mut acc = Truth::True;
                for p in ps {
                    match p.on_partition(key) {
                        Truth::False => return Truth::False,
                        Truth::Unknown => acc = Truth::Unknown,
                        Truth::True => {}
                    }
                }
                acc
            }
            Predicate::Or(ps) => {
                let mut acc = Truth::False;
                for p in ps {
                    match p.on_partition(key) {
                        Truth::True => return Truth::True,
                        Truth::Unknown => acc = Truth::Unknown,
                        Truth::False => {}
                    }
                }
                acc
            }
            Predicate::Not(p) => p.on_partition(key).not(),
        }
    }

    /// Whether a partition might hold matching rows.
    pub fn may_match(&self, key: &PartitionKey) -> bool {
        self.on_partition(key) != Truth::False
    }

    /// Evaluate against one row. Comparisons with null are false.
    pub fn matches<'a>(&self, get: &dyn Fn(&str) -> Option<&'a Value>) -> bool {
        match self {
            Predicate::True => true,
            Predicate::Cmp { column, op, value } => get(column)
                .and_then(|v| v.compare(value))
                .is_some_and(|ord| op.holds(ord)),
            Predicate::In { column, values } => get(column).is_some_and(|v| {
                values.iter().any(|x| v.compare(x) == Some(Ordering::Equal))
            }),
            Predicate::IsNull(column) => get(column).map_or(true, |v| v.is_null()),
            Predicate::NotNull(column) => get(column).is_some_and(|v| !v.is_null()),
            Predicate::And(ps) => ps.iter().all(|p| p.matches(get)),
            Predicate::Or(ps) => ps.iter().any(|p| p.matches(get)),
            Predicate::Not(p) => !p.matches(get),
        }
    }
}

fn key_value(key: &PartitionKey, column: &str) -> Option<Value> {
    match column {
        ENTITY_COLUMN => key.entity().map(Value::from),
        GRANULARITY_COLUMN => key.granularity().map(|g| Value::from(g.tag())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Granularity;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn key(t: &str) -> PartitionKey {
        PartitionKey::series(t, Granularity::Hour)
    }

    #[test]
    fn ticker_equality_prunes_other_partitions() {
        let p = Predicate::eq("ticker", "A").and(Predicate::gt("volume", 10u64));
        assert!(p.may_match(&key("A")));
        assert!(!p.may_match(&key("B")));
        assert_eq!(p.on_partition(&key("A")), Truth::Unknown);
    }

    #[test]
    fn non_key_predicates_never_prune() {
        let p = Predicate::lt("close", 5000u64);
        assert!(p.may_match(&key("A")));
        assert!(p.may_match(&PartitionKey::Whole));
        assert!(Predicate::eq("ticker", "A").may_match(&PartitionKey::Whole));
    }

    #[test]
    fn negation_and_disjunction() {
        let p = Predicate::eq("ticker", "A").not();
        assert!(!p.may_match(&key("A")));
        let p = Predicate::eq("ticker", "A").or(Predicate::eq("granularity", "1d"));
        assert!(p.may_match(&key("A")));
        assert!(!p.may_match(&key("B")));
        assert!(p.may_match(&PartitionKey::series("B", Granularity::Day)));
    }

    #[test]
    fn row_comparison_with_null_is_false() {
        let row: HashMap<&str, Value> = [("x", Value::Null)].into_iter().collect();
        let get = |c: &str| row.get(c);
        assert!(!Predicate::eq("x", 1i64).matches(&get));
        assert!(!Predicate::ne("x", 1i64).matches(&get));
        assert!(Predicate::IsNull("x".into()).matches(&get));
    }

    #[test]
    fn columns_are_collected() {
        let p = Predicate::eq("a", 1i64)
            .and(Predicate::is_in("b", ["x", "y"]))
            .or(Predicate::NotNull("c".into()).not());
        let cols: Vec<_> = p.columns().into_iter().collect();
        assert_eq!(cols, vec!["a", "b", "c"]);
    }

    fn leaf() -> impl Strategy<Value = Predicate> {
        let tickers = prop::sample::select(vec!["A", "B", "C"]);
        prop_oneof![
            tickers.clone().prop_map(|t| Predicate::eq("ticker", t)),
            tickers.clone().prop_map(|t| Predicate::lt("ticker", t)),
            prop::sample::select(vec!["1h", "1d"]).prop_map(|g| Predicate::eq("granularity", g)),
            (0u64..20).prop_map(|v| Predicate::gt("volume", v)),
            Just(Predicate::IsNull("close".into())),
        ]
    }

    fn tree() -> impl Strategy<Value = Predicate> {
        leaf().prop_recursive(3, 16, 3, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 1..3).prop_map(Predicate::And),
                prop::collection::vec(inner.clone(), 1..3).prop_map(Predicate::Or),
                inner.prop_map(|p| p.not()),
            ]
        })
    }

    proptest! {
        /// A pruned partition never holds a matching row.
        #[test]
        fn pruning_is_sound(
            p in tree(),
            ticker in prop::sample::select(vec!["A", "B", "C"]),
            daily in any::<bool>(),
            volume in 0u64..20,
            close in prop::option::of(0u64..100),
        ) {
            let gran = if daily { Granularity::Day } else { Granularity::Hour };
            let k = PartitionKey::series(ticker, gran);
            let row: HashMap<&str, Value> = [
                ("ticker", Value::from(ticker)),
                ("granularity", Value::from(gran.tag())),
                ("volume", Value::UInt(volume)),
                ("close", Value::from(close)),
            ]
            .into_iter()
            .collect();
            let get = |c: &str| row.get(c);
            if p.matches(&get) {
                prop_assert!(p.may_match(&k));
            }
        }
    }
}
