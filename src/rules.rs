use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::customer::Customer;

/// Customer attributes a rule leaf may test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleField {
    Name,
    Email,
    TotalSpend,
    Visits,
    LastActivity,
}

impl RuleField {
    fn is_numeric(&self) -> bool {
        matches!(self, RuleField::TotalSpend | RuleField::Visits)
    }

    fn is_text(&self) -> bool {
        matches!(self, RuleField::Name | RuleField::Email)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleField::Name => "name",
            RuleField::Email => "email",
            RuleField::TotalSpend => "totalSpend",
            RuleField::Visits => "visits",
            RuleField::LastActivity => "lastActivity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "contains")]
    Contains,
}

impl RuleOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleOp::Gt => ">",
            RuleOp::Lt => "<",
            RuleOp::Ge => ">=",
            RuleOp::Le => "<=",
            RuleOp::Eq => "=",
            RuleOp::Ne => "!=",
            RuleOp::Contains => "contains",
        }
    }

    fn compare<T: PartialOrd + PartialEq>(&self, lhs: T, rhs: T) -> bool {
        match self {
            RuleOp::Gt => lhs > rhs,
            RuleOp::Lt => lhs < rhs,
            RuleOp::Ge => lhs >= rhs,
            RuleOp::Le => lhs <= rhs,
            RuleOp::Eq => lhs == rhs,
            RuleOp::Ne => lhs != rhs,
            RuleOp::Contains => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    And,
    Or,
}

/// A campaign's audience rule: either a single field test or an AND/OR
/// group over child rules. The wire shape matches what campaign clients
/// submit: leaves are `{field, operator, value}` and groups are
/// `{condition, conditions}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleNode {
    Group {
        condition: Combinator,
        #[serde(alias = "children")]
        conditions: Vec<RuleNode>,
    },
    Leaf {
        field: RuleField,
        operator: RuleOp,
        value: RuleValue,
    },
}

/// Rule-tree configuration errors. All of these are detectable before any
/// customer record is evaluated, and campaign creation rejects the tree
/// rather than letting a bad leaf surface mid-dispatch.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("{0} group has no conditions")]
    EmptyCombinator(&'static str),
    #[error("operator '{operator}' cannot be applied to field '{field}'")]
    IncompatibleOperator { field: String, operator: String },
    #[error("field '{field}' expects a {expected} value")]
    BadValueType {
        field: String,
        expected: &'static str,
    },
    #[error("lastActivity value '{0}' is not an RFC 3339 timestamp")]
    BadTimestamp(String),
}

impl RuleNode {
    /// Check the whole tree against the field/operator/value grammar.
    /// Unknown fields and operators never get this far: they are rejected
    /// when the tree is deserialized.
    pub fn validate(&self) -> Result<(), RuleError> {
        match self {
            RuleNode::Group {
                condition,
                conditions,
            } => {
                if conditions.is_empty() {
                    let name = match condition {
                        Combinator::And => "AND",
                        Combinator::Or => "OR",
                    };
                    return Err(RuleError::EmptyCombinator(name));
                }
                for child in conditions {
                    child.validate()?;
                }
                Ok(())
            }
            RuleNode::Leaf {
                field,
                operator,
                value,
            } => Self::validate_leaf(*field, *operator, value),
        }
    }

    fn validate_leaf(field: RuleField, operator: RuleOp, value: &RuleValue) -> Result<(), RuleError> {
        if field.is_numeric() {
            if operator == RuleOp::Contains {
                return Err(RuleError::IncompatibleOperator {
                    field: field.as_str().to_string(),
                    operator: operator.as_str().to_string(),
                });
            }
            if !matches!(value, RuleValue::Number(_)) {
                return Err(RuleError::BadValueType {
                    field: field.as_str().to_string(),
                    expected: "numeric",
                });
            }
            return Ok(());
        }

        if field.is_text() {
            // Strings only support equality and containment; ordering text
            // is a configuration mistake, not a comparison we guess at.
            if !matches!(operator, RuleOp::Eq | RuleOp::Ne | RuleOp::Contains) {
                return Err(RuleError::IncompatibleOperator {
                    field: field.as_str().to_string(),
                    operator: operator.as_str().to_string(),
                });
            }
            if !matches!(value, RuleValue::Text(_)) {
                return Err(RuleError::BadValueType {
                    field: field.as_str().to_string(),
                    expected: "string",
                });
            }
            return Ok(());
        }

        // lastActivity: chronological comparison against either an RFC 3339
        // timestamp or a numeric "days before now" shorthand.
        if operator == RuleOp::Contains {
            return Err(RuleError::IncompatibleOperator {
                field: field.as_str().to_string(),
                operator: operator.as_str().to_string(),
            });
        }
        match value {
            RuleValue::Number(_) => Ok(()),
            RuleValue::Text(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(_) => Ok(()),
                Err(_) => Err(RuleError::BadTimestamp(s.clone())),
            },
        }
    }

    /// Evaluate the tree against one customer record. Total and
    /// deterministic for a validated tree: a field the record has no value
    /// for makes the leaf false, it never aborts audience resolution.
    pub fn evaluate(&self, customer: &Customer) -> bool {
        let mut leaves = 0usize;
        self.eval_counted(customer, &mut leaves)
    }

    /// Recursive evaluation, counting how many leaves were actually
    /// examined so short-circuit behavior stays observable in tests.
    pub(crate) fn eval_counted(&self, customer: &Customer, leaves: &mut usize) -> bool {
        match self {
            RuleNode::Group {
                condition: Combinator::And,
                conditions,
            } => {
                for child in conditions {
                    if !child.eval_counted(customer, leaves) {
                        return false;
                    }
                }
                true
            }
            RuleNode::Group {
                condition: Combinator::Or,
                conditions,
            } => {
                for child in conditions {
                    if child.eval_counted(customer, leaves) {
                        return true;
                    }
                }
                false
            }
            RuleNode::Leaf {
                field,
                operator,
                value,
            } => {
                *leaves += 1;
                Self::eval_leaf(customer, *field, *operator, value)
            }
        }
    }

    fn eval_leaf(customer: &Customer, field: RuleField, operator: RuleOp, value: &RuleValue) -> bool {
        match field {
            RuleField::TotalSpend => match value {
                RuleValue::Number(n) => Self::compare_f64(operator, customer.total_spend, *n),
                RuleValue::Text(_) => false,
            },
            RuleField::Visits => match value {
                RuleValue::Number(n) => Self::compare_f64(operator, customer.visits as f64, *n),
                RuleValue::Text(_) => false,
            },
            RuleField::Name => Self::eval_text(operator, &customer.name, value),
            RuleField::Email => Self::eval_text(operator, &customer.email, value),
            RuleField::LastActivity => {
                let Some(last) = customer.last_activity else {
                    return false;
                };
                let Some(threshold) = Self::activity_threshold(value) else {
                    return false;
                };
                operator.compare(last, threshold)
            }
        }
    }

    fn compare_f64(operator: RuleOp, lhs: f64, rhs: f64) -> bool {
        operator.compare(lhs, rhs)
    }

    fn eval_text(operator: RuleOp, lhs: &str, value: &RuleValue) -> bool {
        let RuleValue::Text(rhs) = value else {
            return false;
        };
        let lhs = lhs.to_lowercase();
        let rhs = rhs.to_lowercase();
        match operator {
            RuleOp::Eq => lhs == rhs,
            RuleOp::Ne => lhs != rhs,
            RuleOp::Contains => lhs.contains(&rhs),
            _ => false,
        }
    }

    /// Resolve a lastActivity leaf value to the instant it compares
    /// against: RFC 3339 text directly, a number N as N days before now.
    fn activity_threshold(value: &RuleValue) -> Option<DateTime<Utc>> {
        match value {
            RuleValue::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            RuleValue::Number(days) => {
                let millis = (days * 86_400_000.0) as i64;
                Some(Utc::now() - Duration::milliseconds(millis))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn customer(name: &str, email: &str, spend: f64, visits: i64) -> Customer {
        Customer {
            id: 1,
            name: name.to_string(),
            email: email.to_string(),
            phone: None,
            total_spend: spend,
            visits,
            last_activity: Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
            created_at: Utc::now(),
        }
    }

    fn leaf(field: RuleField, operator: RuleOp, value: RuleValue) -> RuleNode {
        RuleNode::Leaf {
            field,
            operator,
            value,
        }
    }

    #[test]
    fn test_numeric_operators() {
        let c = customer("Ada", "ada@example.com", 1500.0, 4);

        assert!(leaf(RuleField::TotalSpend, RuleOp::Gt, RuleValue::Number(1000.0)).evaluate(&c));
        assert!(!leaf(RuleField::TotalSpend, RuleOp::Lt, RuleValue::Number(1000.0)).evaluate(&c));
        assert!(leaf(RuleField::Visits, RuleOp::Ge, RuleValue::Number(4.0)).evaluate(&c));
        assert!(leaf(RuleField::Visits, RuleOp::Le, RuleValue::Number(4.0)).evaluate(&c));
        assert!(leaf(RuleField::Visits, RuleOp::Eq, RuleValue::Number(4.0)).evaluate(&c));
        assert!(leaf(RuleField::Visits, RuleOp::Ne, RuleValue::Number(5.0)).evaluate(&c));
    }

    #[test]
    fn test_text_operators_are_case_insensitive() {
        let c = customer("Ada Lovelace", "Ada@Example.COM", 0.0, 0);

        assert!(leaf(
            RuleField::Email,
            RuleOp::Eq,
            RuleValue::Text("ada@example.com".into())
        )
        .evaluate(&c));
        assert!(leaf(
            RuleField::Name,
            RuleOp::Contains,
            RuleValue::Text("LOVELACE".into())
        )
        .evaluate(&c));
        assert!(leaf(
            RuleField::Name,
            RuleOp::Ne,
            RuleValue::Text("grace".into())
        )
        .evaluate(&c));
    }

    #[test]
    fn test_last_activity_timestamp_and_relative_days() {
        let mut c = customer("Ada", "ada@example.com", 0.0, 0);
        c.last_activity = Some(Utc::now() - Duration::days(120));

        // Idle for more than 90 days.
        assert!(leaf(
            RuleField::LastActivity,
            RuleOp::Lt,
            RuleValue::Number(90.0)
        )
        .evaluate(&c));
        assert!(!leaf(
            RuleField::LastActivity,
            RuleOp::Gt,
            RuleValue::Number(90.0)
        )
        .evaluate(&c));

        // Absolute threshold.
        let cutoff = (Utc::now() - Duration::days(30)).to_rfc3339();
        assert!(leaf(RuleField::LastActivity, RuleOp::Lt, RuleValue::Text(cutoff)).evaluate(&c));
    }

    #[test]
    fn test_missing_field_value_is_false_not_a_panic() {
        let mut c = customer("Ada", "ada@example.com", 0.0, 0);
        c.last_activity = None;

        let rule = leaf(RuleField::LastActivity, RuleOp::Lt, RuleValue::Number(30.0));
        assert!(!rule.evaluate(&c));
        // The negated operator does not make an absent value match either.
        let rule = leaf(RuleField::LastActivity, RuleOp::Ne, RuleValue::Number(30.0));
        assert!(!rule.evaluate(&c));
    }

    #[test]
    fn test_and_or_combinators() {
        let c = customer("Ada", "ada@example.com", 1500.0, 2);

        let spend = leaf(RuleField::TotalSpend, RuleOp::Gt, RuleValue::Number(1000.0));
        let visits = leaf(RuleField::Visits, RuleOp::Lt, RuleValue::Number(3.0));
        let miss = leaf(RuleField::Visits, RuleOp::Gt, RuleValue::Number(10.0));

        let both = RuleNode::Group {
            condition: Combinator::And,
            conditions: vec![spend.clone(), visits.clone()],
        };
        assert!(both.evaluate(&c));

        let and_miss = RuleNode::Group {
            condition: Combinator::And,
            conditions: vec![spend.clone(), miss.clone()],
        };
        assert!(!and_miss.evaluate(&c));

        let or_miss = RuleNode::Group {
            condition: Combinator::Or,
            conditions: vec![miss, spend],
        };
        assert!(or_miss.evaluate(&c));
    }

    #[test]
    fn test_short_circuit_stops_after_deciding_leaf() {
        let c = customer("Ada", "ada@example.com", 100.0, 1);

        let truthy = leaf(RuleField::Visits, RuleOp::Eq, RuleValue::Number(1.0));
        let falsy = leaf(RuleField::Visits, RuleOp::Eq, RuleValue::Number(9.0));

        // AND stops at the first false child.
        let rule = RuleNode::Group {
            condition: Combinator::And,
            conditions: vec![truthy.clone(), falsy.clone(), truthy.clone(), truthy.clone()],
        };
        let mut leaves = 0;
        assert!(!rule.eval_counted(&c, &mut leaves));
        assert_eq!(leaves, 2);

        // OR stops at the first true child.
        let rule = RuleNode::Group {
            condition: Combinator::Or,
            conditions: vec![falsy.clone(), truthy.clone(), falsy, truthy],
        };
        let mut leaves = 0;
        assert!(rule.eval_counted(&c, &mut leaves));
        assert_eq!(leaves, 2);
    }

    #[test]
    fn test_validate_rejects_bad_trees() {
        let empty = RuleNode::Group {
            condition: Combinator::And,
            conditions: vec![],
        };
        assert!(matches!(
            empty.validate(),
            Err(RuleError::EmptyCombinator("AND"))
        ));

        let contains_on_number = leaf(
            RuleField::TotalSpend,
            RuleOp::Contains,
            RuleValue::Text("10".into()),
        );
        assert!(matches!(
            contains_on_number.validate(),
            Err(RuleError::IncompatibleOperator { .. })
        ));

        let ordered_text = leaf(RuleField::Name, RuleOp::Gt, RuleValue::Text("a".into()));
        assert!(matches!(
            ordered_text.validate(),
            Err(RuleError::IncompatibleOperator { .. })
        ));

        let text_for_number = leaf(
            RuleField::Visits,
            RuleOp::Gt,
            RuleValue::Text("three".into()),
        );
        assert!(matches!(
            text_for_number.validate(),
            Err(RuleError::BadValueType { .. })
        ));

        let bad_ts = leaf(
            RuleField::LastActivity,
            RuleOp::Lt,
            RuleValue::Text("yesterday".into()),
        );
        assert!(matches!(bad_ts.validate(), Err(RuleError::BadTimestamp(_))));

        // Nested failure is found through the group.
        let nested = RuleNode::Group {
            condition: Combinator::Or,
            conditions: vec![
                leaf(RuleField::Visits, RuleOp::Gt, RuleValue::Number(1.0)),
                RuleNode::Group {
                    condition: Combinator::And,
                    conditions: vec![],
                },
            ],
        };
        assert!(nested.validate().is_err());
    }

    #[test]
    fn test_wire_format_round_trip() {
        let json = r#"{
            "condition": "AND",
            "conditions": [
                {"field": "totalSpend", "operator": ">", "value": 1000},
                {"field": "email", "operator": "contains", "value": "@example.com"}
            ]
        }"#;
        let rule: RuleNode = serde_json::from_str(json).unwrap();
        rule.validate().unwrap();

        let c = customer("Ada", "ada@example.com", 1500.0, 4);
        assert!(rule.evaluate(&c));
        let c = customer("Ada", "ada@other.net", 1500.0, 4);
        assert!(!rule.evaluate(&c));

        // `children` is accepted as an alias for `conditions`.
        let json = r#"{"condition": "OR", "children": [
            {"field": "visits", "operator": ">=", "value": 1}
        ]}"#;
        let rule: RuleNode = serde_json::from_str(json).unwrap();
        rule.validate().unwrap();
    }

    #[test]
    fn test_unknown_field_and_operator_rejected_at_parse() {
        let bad_field = r#"{"field": "shoeSize", "operator": ">", "value": 9}"#;
        assert!(serde_json::from_str::<RuleNode>(bad_field).is_err());

        let bad_op = r#"{"field": "visits", "operator": "~=", "value": 9}"#;
        assert!(serde_json::from_str::<RuleNode>(bad_op).is_err());
    }

    #[test]
    fn test_spend_example_selects_only_matching_customer() {
        let json = r#"{"conditions":[{"field":"totalSpend","operator":">","value":1000}],"condition":"AND"}"#;
        let rule: RuleNode = serde_json::from_str(json).unwrap();
        rule.validate().unwrap();

        let rich = customer("A", "a@example.com", 1500.0, 0);
        let poor = customer("B", "b@example.com", 500.0, 0);
        assert!(rule.evaluate(&rich));
        assert!(!rule.evaluate(&poor));
    }
}
