//! Static routing rules: table -> processing call.

use serde::{Deserialize, Serialize};

/// Routes events of one table to a processing call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub schema: String,
    pub table: String,
    /// Name of the registered processor invoked for matching batches.
    pub call: String,
    /// Static arguments passed with every batch.
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl Rule {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, call: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            call: call.into(),
            arguments: Vec::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn matches(&self, schema: &str, table: &str) -> bool {
        self.schema == schema && self.table == table
    }

    /// `schema.table`, as used in logs.
    pub fn target(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Index of a rule within its [`RuleSet`]; the identity used to tell
/// whether two events belong to the same batch.
pub type RuleIndex = usize;

/// Ordered, immutable rule list. The first matching rule wins.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn match_rule(&self, schema: &str, table: &str) -> Option<(RuleIndex, &Rule)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(schema, table))
    }

    pub fn get(&self, index: RuleIndex) -> Option<&Rule> {
        self.rules.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
