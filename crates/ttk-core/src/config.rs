//! Test suite loading.
//!
//! The suite is a YAML file mapping test-case names to setup/teardown command
//! lines. Names are map keys, so they are unique; cases are kept in name order.

use crate::types::{CommandLine, CommandLineError, Provisioner, TestCase};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("test case {name}: invalid {field} command: {source}")]
    InvalidCommand {
        name: String,
        field: &'static str,
        source: CommandLineError,
    },
    #[error("config defines no test cases")]
    NoTestCases,
}

#[derive(Debug, Deserialize)]
struct RawTestCase {
    setup: String,
    teardown: String,
    #[serde(default)]
    tool: Option<Provisioner>,
}

#[derive(Debug, Deserialize)]
struct RawSuite {
    #[serde(default, alias = "test_cases", alias = "testCases")]
    testcases: BTreeMap<String, RawTestCase>,
}

/// Read-only, name-ordered collection of test cases.
#[derive(Debug, Clone, Default)]
pub struct TestSuite {
    cases: Vec<TestCase>,
}

impl TestSuite {
    /// Load a suite from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse suite YAML.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawSuite = serde_yaml::from_str(content)?;
        if raw.testcases.is_empty() {
            return Err(ConfigError::NoTestCases);
        }

        let cases = raw
            .testcases
            .into_iter()
            .map(|(name, tc)| {
                let setup = CommandLine::parse(&tc.setup).map_err(|source| {
                    ConfigError::InvalidCommand {
                        name: name.clone(),
                        field: "setup",
                        source,
                    }
                })?;
                let teardown = CommandLine::parse(&tc.teardown).map_err(|source| {
                    ConfigError::InvalidCommand {
                        name: name.clone(),
                        field: "teardown",
                        source,
                    }
                })?;
                Ok(TestCase::new(name, setup, teardown, tc.tool))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self { cases })
    }

    /// Build a suite directly from test cases, sorted by name.
    pub fn from_cases(mut cases: Vec<TestCase>) -> Self {
        cases.sort_by(|a, b| a.name.cmp(&b.name));
        Self { cases }
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TestCase> {
        self.cases.iter()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl<'a> IntoIterator for &'a TestSuite {
    type Item = &'a TestCase;
    type IntoIter = std::slice::Iter<'a, TestCase>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
