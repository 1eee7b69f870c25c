use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, Copy)]
pub struct TypeStats {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct FailedAssertion {
    pub sample: String,
    pub assertion: String,
    pub reason: String,
}

/// Data needed to render the evaluation markdown report.
#[derive(Debug, Default)]
pub struct MarkdownReport {
    pub experiment_name: String,
    pub dataset_name: String,
    pub num_samples: usize,
    pub num_assertions: usize,
    pub num_passed: usize,
    pub num_failed: usize,
    pub num_skipped: usize,
    // BTreeMap keeps the per-type table stable across runs.
    pub type_stats: BTreeMap<String, TypeStats>,
    pub failed_assertions: Vec<FailedAssertion>,
    pub commit: String,
    pub version: String,
    pub model: String,
    pub runner: String,
    pub language_version: String,
    pub date: String,
}

impl MarkdownReport {
    pub fn render(&self) -> String {
        let graded = self.num_passed + self.num_failed;
        let pass_rate = if graded > 0 {
            self.num_passed as f64 / graded as f64 * 100.0
        } else {
            100.0
        };

        let mut lines: Vec<String> = Vec::new();
        lines.push(format!(
            "# {} evaluation — {}",
            self.experiment_name, self.date
        ));
        lines.push(String::new());
        lines.push("| Metric | Value |\n|--------|------:|".to_string());
        lines.push(format!("| Dataset | `{}` |", self.dataset_name));
        lines.push(format!("| Samples | {} |", self.num_samples));
        lines.push(format!("| Assertions | {} |", self.num_assertions));
        lines.push(format!(
            "| **Pass rate** | **{:.0} %** ({} / {}) |",
            pass_rate, self.num_passed, graded
        ));
        lines.push(String::new());
        lines.push("## Pass / fail by assertion type".to_string());
        lines.push("| Assertion | Passed | Failed | Skipped | Pass % |".to_string());
        lines.push("|-----------|-------:|-------:|--------:|-------:|".to_string());
        for (name, stats) in &self.type_stats {
            let total = stats.passed + stats.failed;
            let pass_pct = if total > 0 {
                stats.passed as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            lines.push(format!(
                "| `{}` | {} | {} | {} | {:.0} % |",
                name, stats.passed, stats.failed, stats.skipped, pass_pct
            ));
        }
        lines.push(String::new());

        if !self.failed_assertions.is_empty() {
            lines.push(format!(
                "<details>\n<summary>{} failed assertions (click to expand)</summary>\n",
                self.failed_assertions.len()
            ));
            lines.push("\n| Sample | Assertion | Reason |\n|--------|-----------|--------|".to_string());
            for fail in &self.failed_assertions {
                lines.push(format!(
                    "| `{}` | `{}` | {} |",
                    fail.sample, fail.assertion, fail.reason
                ));
            }
            lines.push("\n</details>\n".to_string());
        }

        lines.push(String::new());
        lines.push(format!(
            "_Run metadata: commit `{}`, version `{}`, model `{}`, runner `{}`, {}_",
            self.commit, self.version, self.model, self.runner, self.language_version
        ));

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_pass_rate_and_type_table() {
        let mut report = MarkdownReport {
            experiment_name: "smoke".to_string(),
            dataset_name: "data/smoke.yaml".to_string(),
            num_samples: 2,
            num_assertions: 4,
            num_passed: 3,
            num_failed: 1,
            num_skipped: 0,
            date: "2026-01-01 12:00".to_string(),
            ..Default::default()
        };
        report.type_stats.insert(
            "TYPE_TOOL_INVOKED".to_string(),
            TypeStats {
                passed: 3,
                failed: 1,
                skipped: 0,
            },
        );
        report.failed_assertions.push(FailedAssertion {
            sample: "s1".to_string(),
            assertion: "a1".to_string(),
            reason: "no code block".to_string(),
        });

        let rendered = report.render();
        assert!(rendered.contains("**75 %** (3 / 4)"));
        assert!(rendered.contains("| `TYPE_TOOL_INVOKED` | 3 | 1 | 0 | 75 % |"));
        assert!(rendered.contains("<details>"));
        assert!(rendered.contains("| `s1` | `a1` | no code block |"));
    }

    #[test]
    fn empty_report_has_full_pass_rate() {
        let report = MarkdownReport::default();
        assert!(report.render().contains("**100 %** (0 / 0)"));
    }
}
