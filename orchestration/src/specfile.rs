//! Spec input — two formats, one canonical form.
//!
//! A spec arrives either as a markdown layout (H1 title, optional Overview,
//! a Features section of H3 categories with bullet features and indented
//! acceptance bullets) or as a YAML document. Both are converted to
//! [`ProjectSpec`]; validation failures are fatal during initialization and
//! carry field-path/message pairs.

use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An acceptance criterion: free text, or a scripted check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Acceptance {
    Text(String),
    Scripted {
        test: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verify: Option<String>,
    },
}

impl Acceptance {
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Scripted { test, verify } => match verify {
                Some(verify) => format!("{test} (verify: {verify})"),
                None => test.clone(),
            },
        }
    }
}

/// One feature in the canonical spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FeatureSpec {
    pub title: String,
    pub description: Option<String>,
    /// Category heading from markdown layout, or free-form from YAML.
    pub category: Option<String>,
    pub complexity: Option<String>,
    pub priority: Option<u8>,
    pub files: Vec<String>,
    /// Titles of features that must complete first.
    pub depends_on: Vec<String>,
    pub acceptance: Vec<Acceptance>,
    pub labels: Vec<String>,
}

/// Canonical internal form of a spec document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProjectSpec {
    pub title: String,
    pub overview: Option<String>,
    pub property: Option<String>,
    pub complexity: Option<String>,
    pub features: Vec<FeatureSpec>,
}

impl ProjectSpec {
    /// Load from a file, dispatching on extension (`.yaml`/`.yml` vs
    /// markdown).
    pub fn from_path(path: &Path) -> HarnessResult<ProjectSpec> {
        let contents = std::fs::read_to_string(path).map_err(|_| HarnessError::SpecNotFound {
            path: path.to_path_buf(),
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let spec = if is_yaml {
            Self::from_yaml(&contents)?
        } else {
            Self::from_markdown(&contents)?
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Parse the YAML form.
    pub fn from_yaml(contents: &str) -> HarnessResult<ProjectSpec> {
        serde_yaml::from_str(contents).map_err(|e| HarnessError::SpecInvalid {
            errors: vec![(
                e.location()
                    .map(|l| format!("line {}, column {}", l.line(), l.column()))
                    .unwrap_or_else(|| "(document)".to_string()),
                e.to_string(),
            )],
        })
    }

    /// Parse the markdown layout.
    pub fn from_markdown(contents: &str) -> HarnessResult<ProjectSpec> {
        let mut spec = ProjectSpec::default();
        let mut section = MarkdownSection::Preamble;
        let mut category: Option<String> = None;
        let mut overview_lines: Vec<String> = Vec::new();

        for line in contents.lines() {
            let trimmed = line.trim_end();

            if let Some(title) = trimmed.strip_prefix("# ") {
                if spec.title.is_empty() {
                    spec.title = title.trim().to_string();
                }
                continue;
            }
            if let Some(heading) = trimmed.strip_prefix("## ") {
                section = match heading.trim().to_ascii_lowercase().as_str() {
                    "overview" => MarkdownSection::Overview,
                    "features" => MarkdownSection::Features,
                    _ => MarkdownSection::Other,
                };
                continue;
            }
            match section {
                MarkdownSection::Overview => {
                    if !trimmed.is_empty() {
                        overview_lines.push(trimmed.trim().to_string());
                    }
                }
                MarkdownSection::Features => {
                    if let Some(h3) = trimmed.strip_prefix("### ") {
                        category = Some(h3.trim().to_string());
                    } else if let Some(item) = trimmed.strip_prefix("- ") {
                        // Top-level bullet: a feature. `Title: description`
                        // splits on the first colon.
                        let (title, description) = match item.split_once(": ") {
                            Some((t, d)) => (t.trim().to_string(), Some(d.trim().to_string())),
                            None => (item.trim().to_string(), None),
                        };
                        spec.features.push(FeatureSpec {
                            title,
                            description,
                            category: category.clone(),
                            ..FeatureSpec::default()
                        });
                    } else if let Some(nested) = indented_bullet(trimmed) {
                        if let Some(feature) = spec.features.last_mut() {
                            feature.acceptance.push(Acceptance::Text(nested));
                        }
                    }
                }
                MarkdownSection::Preamble | MarkdownSection::Other => {}
            }
        }

        if !overview_lines.is_empty() {
            spec.overview = Some(overview_lines.join(" "));
        }
        Ok(spec)
    }

    /// Structural validation; every problem is a field-path/message pair.
    pub fn validate(&self) -> HarnessResult<()> {
        let mut errors: Vec<(String, String)> = Vec::new();

        if self.title.trim().is_empty() {
            errors.push(("title".into(), "must not be empty".into()));
        }
        if self.features.is_empty() {
            errors.push(("features".into(), "at least one feature is required".into()));
        }

        let titles: Vec<&str> = self.features.iter().map(|f| f.title.as_str()).collect();
        for (index, feature) in self.features.iter().enumerate() {
            let path = format!("features[{index}]");
            if feature.title.trim().is_empty() {
                errors.push((format!("{path}.title"), "must not be empty".into()));
            }
            if titles
                .iter()
                .filter(|t| **t == feature.title.as_str())
                .count()
                > 1
            {
                errors.push((format!("{path}.title"), "duplicate feature title".into()));
            }
            if let Some(priority) = feature.priority {
                if priority > 4 {
                    errors.push((
                        format!("{path}.priority"),
                        format!("priority {priority} out of range 0..=4"),
                    ));
                }
            }
            for (dep_index, dep) in feature.depends_on.iter().enumerate() {
                if dep == &feature.title {
                    errors.push((
                        format!("{path}.depends_on[{dep_index}]"),
                        "a feature cannot depend on itself".into(),
                    ));
                } else if !titles.contains(&dep.as_str()) {
                    errors.push((
                        format!("{path}.depends_on[{dep_index}]"),
                        format!("unknown feature title {dep:?}"),
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::SpecInvalid { errors })
        }
    }
}

#[derive(Clone, Copy)]
enum MarkdownSection {
    Preamble,
    Overview,
    Features,
    Other,
}

/// The text of an indented bullet (two or more spaces of indent), if any.
fn indented_bullet(line: &str) -> Option<String> {
    let without_indent = line.strip_prefix("  ")?;
    let rest = without_indent.trim_start();
    rest.strip_prefix("- ").map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKDOWN: &str = "\
# Todo App

## Overview

A small task manager
with persistence.

## Features

### Core

- Create tasks: users can add tasks with a title
  - empty titles are rejected
  - new tasks appear at the top
- Complete tasks

### Sync

- Offline queue
  - queued writes flush on reconnect
";

    #[test]
    fn test_markdown_title_and_overview() {
        let spec = ProjectSpec::from_markdown(MARKDOWN).unwrap();
        assert_eq!(spec.title, "Todo App");
        assert_eq!(
            spec.overview.as_deref(),
            Some("A small task manager with persistence.")
        );
    }

    #[test]
    fn test_markdown_features_and_acceptance() {
        let spec = ProjectSpec::from_markdown(MARKDOWN).unwrap();
        assert_eq!(spec.features.len(), 3);

        let create = &spec.features[0];
        assert_eq!(create.title, "Create tasks");
        assert_eq!(
            create.description.as_deref(),
            Some("users can add tasks with a title")
        );
        assert_eq!(create.category.as_deref(), Some("Core"));
        assert_eq!(create.acceptance.len(), 2);
        assert_eq!(
            create.acceptance[0],
            Acceptance::Text("empty titles are rejected".into())
        );

        let offline = &spec.features[2];
        assert_eq!(offline.category.as_deref(), Some("Sync"));
        assert_eq!(offline.acceptance.len(), 1);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
title: Todo App
overview: A small task manager
features:
  - title: Create tasks
    priority: 1
    labels: [core]
    acceptance:
      - empty titles are rejected
      - test: create a task
        verify: it appears in the list
  - title: Complete tasks
    depends_on: [Create tasks]
"#;
        let spec = ProjectSpec::from_yaml(yaml).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.features.len(), 2);
        assert_eq!(spec.features[0].priority, Some(1));
        assert_eq!(spec.features[0].acceptance.len(), 2);
        assert!(matches!(
            spec.features[0].acceptance[1],
            Acceptance::Scripted { .. }
        ));
        assert_eq!(spec.features[1].depends_on, vec!["Create tasks"]);
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let yaml = "title: X\nfeatures: []\nbudget: 100\n";
        let err = ProjectSpec::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("budget"));
    }

    #[test]
    fn test_validate_empty_title_and_features() {
        let spec = ProjectSpec::default();
        let err = spec.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("title: must not be empty"));
        assert!(message.contains("features"));
    }

    #[test]
    fn test_validate_priority_range() {
        let mut spec = ProjectSpec {
            title: "X".into(),
            ..Default::default()
        };
        spec.features.push(FeatureSpec {
            title: "A".into(),
            priority: Some(9),
            ..Default::default()
        });
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("features[0].priority"));
    }

    #[test]
    fn test_validate_dependencies() {
        let mut spec = ProjectSpec {
            title: "X".into(),
            ..Default::default()
        };
        spec.features.push(FeatureSpec {
            title: "A".into(),
            depends_on: vec!["A".into(), "Ghost".into()],
            ..Default::default()
        });
        let err = spec.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("depend on itself"));
        assert!(message.contains("Ghost"));
    }

    #[test]
    fn test_validate_duplicate_titles() {
        let mut spec = ProjectSpec {
            title: "X".into(),
            ..Default::default()
        };
        for _ in 0..2 {
            spec.features.push(FeatureSpec {
                title: "Same".into(),
                ..Default::default()
            });
        }
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_from_path_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let md = dir.path().join("spec.md");
        std::fs::write(&md, MARKDOWN).unwrap();
        let spec = ProjectSpec::from_path(&md).unwrap();
        assert_eq!(spec.title, "Todo App");

        let yaml = dir.path().join("spec.yaml");
        std::fs::write(&yaml, "title: Y\nfeatures:\n  - title: A\n").unwrap();
        let spec = ProjectSpec::from_path(&yaml).unwrap();
        assert_eq!(spec.title, "Y");

        assert!(matches!(
            ProjectSpec::from_path(&dir.path().join("missing.md")),
            Err(HarnessError::SpecNotFound { .. })
        ));
    }
}
