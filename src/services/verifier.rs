//! C1: translates a worktree's quality signals (typecheck, lint, test, build, spell,
//! code health) into a structured [`VerificationResult`]. Never throws across the
//! boundary — a command that fails to even spawn, or times out, becomes an `issues[]`
//! entry rather than a propagated error, since every check here is a signal, not a fault.

use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::domain::error::VerifierError;
use crate::domain::models::{ErrorCategory, VerificationIssue, VerificationResult};
use crate::domain::ports::{VcsClient, Verifier};
use crate::infrastructure::config::loader::VerifierConfig;

const EXCERPT_LINES: usize = 5;

struct Stage {
    category: ErrorCategory,
    label: &'static str,
    cmd: Option<String>,
}

pub struct ShellVerifier {
    config: VerifierConfig,
    vcs: Arc<dyn VcsClient>,
}

impl ShellVerifier {
    #[must_use]
    pub fn new(config: VerifierConfig, vcs: Arc<dyn VcsClient>) -> Self {
        Self { config, vcs }
    }

    fn stages(&self) -> Vec<Stage> {
        vec![
            Stage {
                category: ErrorCategory::Typecheck,
                label: "typecheck",
                cmd: self.config.typecheck_cmd.clone(),
            },
            Stage {
                category: ErrorCategory::Build,
                label: "build",
                cmd: self.config.build_cmd.clone(),
            },
            Stage {
                category: ErrorCategory::Lint,
                label: "lint",
                cmd: self.config.lint_cmd.clone(),
            },
            Stage {
                category: ErrorCategory::Test,
                label: "test",
                cmd: self.config.test_cmd.clone(),
            },
            Stage {
                category: ErrorCategory::Spell,
                label: "spell",
                cmd: self.config.spell_cmd.clone(),
            },
            Stage {
                category: ErrorCategory::Unknown,
                label: "code_health",
                cmd: self.config.code_health_cmd.clone(),
            },
        ]
    }

    /// Run one configured shell command under a timeout, returning `(passed, issues,
    /// excerpt)`. A missing command is treated as trivially passed.
    async fn run_stage(
        &self,
        worktree: &Path,
        stage: &Stage,
    ) -> (bool, Vec<VerificationIssue>, Option<String>) {
        let Some(cmd) = &stage.cmd else {
            return (true, Vec::new(), None);
        };

        let spawn = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(worktree)
            .stdin(Stdio::null())
            .output();

        match timeout(Duration::from_secs(self.config.timeout_secs), spawn).await {
            Ok(Ok(output)) => {
                let passed = output.status.success();
                let combined = format!(
                    "{}\n{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                let excerpt = excerpt(&combined);
                let issues = if passed {
                    Vec::new()
                } else {
                    let structured = parse_structured_issues(stage.category, &combined);
                    if structured.is_empty() {
                        vec![VerificationIssue {
                            category: stage.category,
                            file: None,
                            line: None,
                            column: None,
                            message: excerpt.clone().unwrap_or_default(),
                            suggestion: None,
                        }]
                    } else {
                        structured
                    }
                };
                (passed, issues, excerpt)
            }
            Ok(Err(e)) => {
                warn!(stage = stage.label, error = %e, "failed to spawn verifier command");
                (
                    false,
                    vec![VerificationIssue {
                        category: stage.category,
                        file: None,
                        line: None,
                        column: None,
                        message: format!("failed to spawn `{cmd}`: {e}"),
                        suggestion: None,
                    }],
                    None,
                )
            }
            Err(_) => {
                warn!(stage = stage.label, timeout_secs = self.config.timeout_secs, "verifier command timed out");
                (
                    false,
                    vec![VerificationIssue {
                        category: ErrorCategory::Timeout,
                        file: None,
                        line: None,
                        column: None,
                        message: format!("`{cmd}` timed out after {}s", self.config.timeout_secs),
                        suggestion: None,
                    }],
                    None,
                )
            }
        }
    }
}

/// Parses `file:line:col: message`-style compiler/linter output (rustc, eslint,
/// mypy, and most tools following the same convention) into structured issues. A
/// trailing `help: ...` line is attached to the issue directly above it as a
/// suggestion. Output that matches nothing yields an empty vec; the caller falls
/// back to a single unstructured excerpt in that case.
fn parse_structured_issues(category: ErrorCategory, output: &str) -> Vec<VerificationIssue> {
    let loc = Regex::new(
        r"(?m)^(?P<file>[^\s:][^:\n]*\.[A-Za-z0-9_]+):(?P<line>\d+):(?P<col>\d+):?\s*(?:(?:error|warning)(?:\[[^\]]+\])?:\s*)?(?P<message>.+)$",
    )
    .expect("valid regex");
    let help = Regex::new(r"(?m)^\s*(?:=\s*)?help:\s*(?P<suggestion>.+)$").expect("valid regex");

    let mut issues: Vec<VerificationIssue> = loc
        .captures_iter(output)
        .map(|caps| VerificationIssue {
            category,
            file: Some(caps["file"].trim().to_string()),
            line: caps["line"].parse().ok(),
            column: caps["col"].parse().ok(),
            message: caps["message"].trim().to_string(),
            suggestion: None,
        })
        .collect();

    for (issue, caps) in issues.iter_mut().zip(help.captures_iter(output)) {
        issue.suggestion = Some(caps["suggestion"].trim().to_string());
    }

    issues
}

fn excerpt(output: &str) -> Option<String> {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return None;
    }
    Some(lines.iter().take(EXCERPT_LINES).copied().collect::<Vec<_>>().join("\n"))
}

#[async_trait]
impl Verifier for ShellVerifier {
    #[instrument(skip(self))]
    async fn verify(&self, worktree_path: &Path) -> Result<VerificationResult, VerifierError> {
        if !worktree_path.exists() {
            return Err(VerifierError::MissingWorktree(
                worktree_path.display().to_string(),
            ));
        }

        let (files_changed, lines_changed) = self
            .vcs
            .diff_stat(worktree_path, "HEAD")
            .await
            .map(|(files, lines)| (files, lines))
            .unwrap_or((0, 0));

        let mut issues = Vec::new();
        let mut feedback_sections = Vec::new();
        let mut typecheck_passed = true;
        let mut tests_passed = true;
        let mut lint_passed = true;
        let mut spell_passed = true;
        let mut code_health_passed = true;

        for stage in self.stages() {
            let (passed, stage_issues, excerpt) = self.run_stage(worktree_path, &stage).await;
            match stage.category {
                ErrorCategory::Typecheck | ErrorCategory::Build => typecheck_passed &= passed,
                ErrorCategory::Test => tests_passed &= passed,
                ErrorCategory::Lint => lint_passed &= passed,
                ErrorCategory::Spell => spell_passed &= passed,
                _ => code_health_passed &= passed,
            }
            if let Some(excerpt) = excerpt {
                feedback_sections.push(format!(
                    "[{}] {}",
                    stage.label,
                    if passed { "ok" } else { &excerpt }
                ));
            } else if !passed {
                feedback_sections.push(format!("[{}] failed", stage.label));
            }
            issues.extend(stage_issues);
        }

        if files_changed == 0 {
            issues.push(VerificationIssue {
                category: ErrorCategory::NoChanges,
                file: None,
                line: None,
                column: None,
                message: "no files changed".to_string(),
                suggestion: None,
            });
        }

        let passed = files_changed > 0 && typecheck_passed;

        Ok(VerificationResult {
            passed,
            typecheck_passed,
            tests_passed,
            lint_passed,
            spell_passed,
            code_health_passed,
            files_changed,
            lines_changed,
            issues,
            feedback: feedback_sections.join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_caps_to_five_lines() {
        let output = (1..=10).map(|n| format!("line {n}")).collect::<Vec<_>>().join("\n");
        let excerpt = excerpt(&output).unwrap();
        assert_eq!(excerpt.lines().count(), EXCERPT_LINES);
    }

    #[test]
    fn excerpt_of_blank_output_is_none() {
        assert!(excerpt("\n\n   \n").is_none());
    }

    #[test]
    fn parses_file_line_column_and_message() {
        let output = "src/main.rs:42:9: error: unused variable `x`";
        let issues = parse_structured_issues(ErrorCategory::Typecheck, output);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].file.as_deref(), Some("src/main.rs"));
        assert_eq!(issues[0].line, Some(42));
        assert_eq!(issues[0].column, Some(9));
        assert_eq!(issues[0].message, "unused variable `x`");
    }

    #[test]
    fn attaches_help_line_as_suggestion() {
        let output = "src/lib.rs:10:3: error: missing semicolon\n  = help: add `;` at the end";
        let issues = parse_structured_issues(ErrorCategory::Build, output);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].suggestion.as_deref(), Some("add `;` at the end"));
    }

    #[test]
    fn unstructured_output_yields_no_issues() {
        let output = "some tool crashed with no location info";
        assert!(parse_structured_issues(ErrorCategory::Lint, output).is_empty());
    }
}
