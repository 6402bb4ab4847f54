//! Partition indices

use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, Timelike};

use super::{NodeId, Tree};
use crate::error::{CoreError, Result};
use crate::stack::ImmutableStack;

/// Index path from the root to the node being prepared
pub type IndexStack = ImmutableStack<IndexValue>;

/// Computes the index values of an index directory from the enclosing path
pub type IndexFn = Arc<dyn Fn(&IndexStack) -> Result<Vec<IndexValue>> + Send + Sync>;

/// Turns an index value into a directory name
pub type IndexFormatter = Arc<dyn Fn(&IndexValue) -> String + Send + Sync>;

/// Populates a generated subdirectory
pub type Template = Arc<dyn Fn(&mut Tree, NodeId, &IndexStack) -> Result<()> + Send + Sync>;

/// One partition key.
///
/// Values order by variant first, then naturally: text lexicographically,
/// dates and hours chronologically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexValue {
    Text(String),
    Date(NaiveDate),
    Hour(NaiveDateTime),
}

impl IndexValue {
    pub fn as_text(&self) -> Result<&str> {
        match self {
            IndexValue::Text(s) => Ok(s),
            other => Err(unexpected("text", other)),
        }
    }

    pub fn as_date(&self) -> Result<NaiveDate> {
        match self {
            IndexValue::Date(d) => Ok(*d),
            other => Err(unexpected("date", other)),
        }
    }

    pub fn as_hour(&self) -> Result<NaiveDateTime> {
        match self {
            IndexValue::Hour(h) => Ok(*h),
            other => Err(unexpected("hour", other)),
        }
    }
}

fn unexpected(expected: &str, actual: &IndexValue) -> CoreError {
    CoreError::ValidationError(format!("Expected {} partition key, got {:?}", expected, actual))
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexValue::Text(s) => f.write_str(s),
            IndexValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            IndexValue::Hour(h) => write!(f, "{}", h.hour()),
        }
    }
}

#[derive(Clone)]
pub(super) struct IndexSpec {
    pub(super) index_fn: IndexFn,
    pub(super) formatter: IndexFormatter,
    pub(super) templates: Vec<Template>,
    pub(super) parallel: bool,
}

impl IndexSpec {
    pub(super) fn new(index_fn: IndexFn, formatter: IndexFormatter) -> Self {
        Self {
            index_fn,
            formatter,
            templates: Vec::new(),
            parallel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_order() {
        let day = NaiveDate::from_ymd_opt(2020, 5, 1).unwrap();
        let mut hours = vec![
            IndexValue::Hour(day.and_hms_opt(10, 0, 0).unwrap()),
            IndexValue::Hour(day.and_hms_opt(2, 0, 0).unwrap()),
        ];
        hours.sort();
        let names: Vec<String> = hours.iter().map(|h| h.to_string()).collect();
        assert_eq!(names, vec!["2", "10"]);
        assert_eq!(IndexValue::Date(day).to_string(), "2020-05-01");
    }

    #[test]
    fn test_accessors_reject_wrong_kind() {
        let value = IndexValue::Text("DE".to_string());
        assert_eq!(value.as_text().unwrap(), "DE");
        assert!(matches!(value.as_date(), Err(CoreError::ValidationError(_))));
        assert!(value.as_hour().is_err());
    }
}
