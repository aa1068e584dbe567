use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::lifecycle::types::{TestID, TestResult};

/// Serialized form of a finished suite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuiteReport {
    pub name: String,
    pub description: String,
    #[serde(rename = "clientVersions")]
    pub client_versions: BTreeMap<String, String>,
    #[serde(rename = "testCases")]
    pub test_cases: BTreeMap<TestID, TestCaseReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCaseReport {
    pub name: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(rename = "summaryResult")]
    pub summary_result: TestResult,
}
