use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bosun_proto::eval::v1::assertion::{Payload, Result as AssertionResult, Type};
use bosun_proto::eval::v1::Assertion;
use bosun_proto::v1::{Block, BlockKind};

use crate::api::types::{InputContentPart, InputItem, ResponsesRequest, StreamEvent};
use crate::api::ResponsesClient;
use crate::error::{Error, Result};

/// Final block set of a sample, keyed by block id.
pub type BlockMap = HashMap<String, Block>;

/// An Asserter grades one assertion against the final block set.
pub trait Asserter {
    fn assert(&self, assertion: &mut Assertion, blocks: &BlockMap) -> Result<()>;
}

/// Asserter registry; LLM_JUDGE is asynchronous and handled separately.
pub fn asserter_for(assertion_type: Type) -> Option<&'static dyn Asserter> {
    match assertion_type {
        Type::ShellRequiredFlag => Some(&ShellRequiredFlagAsserter),
        Type::ToolInvoked => Some(&ToolInvokedAsserter),
        Type::FileRetrieved => Some(&FileRetrievedAsserter),
        Type::CodeblockRegex => Some(&CodeblockRegexAsserter),
        _ => None,
    }
}

fn code_blocks(blocks: &BlockMap) -> impl Iterator<Item = &Block> {
    blocks
        .values()
        .filter(|b| b.kind == BlockKind::Code as i32)
}

struct ShellRequiredFlagAsserter;

impl Asserter for ShellRequiredFlagAsserter {
    fn assert(&self, assertion: &mut Assertion, blocks: &BlockMap) -> Result<()> {
        let Some(Payload::ShellRequiredFlag(payload)) = assertion.payload.clone() else {
            assertion.result = AssertionResult::Skipped as i32;
            return Ok(());
        };

        // SKIPPED unless the target command appears in some code block.
        assertion.result = AssertionResult::Skipped as i32;
        let mut contains_command = false;
        for block in code_blocks(blocks) {
            if !block.contents.contains(&payload.command) {
                continue;
            }
            if !contains_command {
                contains_command = true;
                assertion.result = AssertionResult::True as i32;
            }
            for flag in &payload.flags {
                if !block.contents.contains(flag) {
                    assertion.result = AssertionResult::False as i32;
                    assertion.failure_reason =
                        format!("required flag {flag} missing from {} invocation", payload.command);
                }
            }
        }
        Ok(())
    }
}

struct ToolInvokedAsserter;

impl Asserter for ToolInvokedAsserter {
    fn assert(&self, assertion: &mut Assertion, blocks: &BlockMap) -> Result<()> {
        // Shell is the only tool, so any code block counts as an invocation.
        if code_blocks(blocks).next().is_some() {
            assertion.result = AssertionResult::True as i32;
        } else {
            assertion.result = AssertionResult::False as i32;
            assertion.failure_reason = "no tool was invoked".to_string();
        }
        Ok(())
    }
}

struct FileRetrievedAsserter;

impl Asserter for FileRetrievedAsserter {
    fn assert(&self, assertion: &mut Assertion, blocks: &BlockMap) -> Result<()> {
        let Some(Payload::FileRetrieved(payload)) = assertion.payload.clone() else {
            assertion.result = AssertionResult::Skipped as i32;
            return Ok(());
        };

        assertion.result = AssertionResult::False as i32;
        assertion.failure_reason = format!("file {} was not retrieved", payload.file_id);
        for block in blocks.values() {
            if block.kind != BlockKind::FileSearchResults as i32 {
                continue;
            }
            if block
                .file_search_results
                .iter()
                .any(|r| r.file_id == payload.file_id)
            {
                assertion.result = AssertionResult::True as i32;
                assertion.failure_reason.clear();
                break;
            }
        }
        Ok(())
    }
}

struct CodeblockRegexAsserter;

impl Asserter for CodeblockRegexAsserter {
    fn assert(&self, assertion: &mut Assertion, blocks: &BlockMap) -> Result<()> {
        let Some(Payload::CodeblockRegex(payload)) = assertion.payload.clone() else {
            assertion.result = AssertionResult::Skipped as i32;
            return Ok(());
        };

        if payload.regex.is_empty() {
            assertion.result = AssertionResult::Skipped as i32;
            return Ok(());
        }

        let re = match regex::Regex::new(&payload.regex) {
            Ok(re) => re,
            Err(err) => {
                assertion.result = AssertionResult::False as i32;
                assertion.failure_reason = format!("invalid regex pattern: {err}");
                return Err(Error::InvalidArgument(format!(
                    "invalid regex pattern {:?}: {err}",
                    payload.regex
                )));
            }
        };

        if code_blocks(blocks).any(|b| re.is_match(&b.contents)) {
            assertion.result = AssertionResult::True as i32;
        } else {
            assertion.result = AssertionResult::False as i32;
            assertion.failure_reason = format!("no code block matched {:?}", payload.regex);
        }
        Ok(())
    }
}

/// Grades LLM_JUDGE assertions. Configured separately from the asserter
/// registry because the verdict comes from a model call.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, prompt: &str, blocks: &BlockMap) -> Result<bool>;
}

const JUDGE_INSTRUCTIONS: &str = "You are grading the transcript of a cloud assistant. Answer with a \
single word, TRUE or FALSE, and nothing else.";

/// Judge backed by the Responses API: renders the block set, asks the model
/// the assertion's question, and reads a one-word verdict.
pub struct ResponsesJudge {
    client: ResponsesClient,
    model: String,
}

impl ResponsesJudge {
    pub fn new(client: ResponsesClient, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl Judge for ResponsesJudge {
    async fn judge(&self, prompt: &str, blocks: &BlockMap) -> Result<bool> {
        let mut transcript = String::new();
        for block in blocks.values() {
            let kind = BlockKind::try_from(block.kind)
                .map(|k| k.as_str_name().to_string())
                .unwrap_or_else(|_| block.kind.to_string());
            transcript.push_str(&format!("[{kind}]\n{}\n\n", block.contents));
        }

        let request = ResponsesRequest {
            model: self.model.clone(),
            input: Some(vec![InputItem::Message {
                role: "user".to_string(),
                content: vec![InputContentPart::InputText {
                    text: format!("{prompt}\n\nTranscript:\n\n{transcript}"),
                }],
            }]),
            instructions: Some(JUDGE_INSTRUCTIONS.to_string()),
            previous_response_id: None,
            parallel_tool_calls: None,
            stream: None,
            tools: None,
            tool_choice: None,
            include: None,
        };

        let mut events = self
            .client
            .stream_response(request, CancellationToken::new())
            .await?;

        let mut verdict = String::new();
        while let Some(event) = events.next().await {
            if let StreamEvent::OutputTextDelta { delta, .. } = event? {
                verdict.push_str(&delta);
            }
        }

        debug!(target: "bosun::eval", verdict = %verdict, "Judge verdict");
        let first_word = verdict.trim().split_whitespace().next().unwrap_or("");
        Ok(first_word.eq_ignore_ascii_case("true"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_proto::eval::v1::assertion::{
        CodeblockRegex, FileRetrieved, ShellRequiredFlag,
    };
    use bosun_proto::v1::FileSearchResult;

    fn code_block(id: &str, contents: &str) -> Block {
        Block {
            id: id.to_string(),
            kind: BlockKind::Code as i32,
            contents: contents.to_string(),
            ..Default::default()
        }
    }

    fn block_map(blocks: Vec<Block>) -> BlockMap {
        blocks.into_iter().map(|b| (b.id.clone(), b)).collect()
    }

    fn shell_flag_assertion(command: &str, flags: &[&str]) -> Assertion {
        Assertion {
            name: "flags".to_string(),
            r#type: Type::ShellRequiredFlag as i32,
            payload: Some(Payload::ShellRequiredFlag(ShellRequiredFlag {
                command: command.to_string(),
                flags: flags.iter().map(|f| f.to_string()).collect(),
            })),
            ..Default::default()
        }
    }

    #[test]
    fn shell_flag_fails_when_flag_missing() {
        let blocks = block_map(vec![code_block("c1", "kubectl get pods --context test")]);
        let mut assertion = shell_flag_assertion("kubectl", &["--context", "-n"]);

        ShellRequiredFlagAsserter
            .assert(&mut assertion, &blocks)
            .unwrap();
        assert_eq!(assertion.result, AssertionResult::False as i32);
    }

    #[test]
    fn shell_flag_passes_when_all_flags_present() {
        let blocks = block_map(vec![code_block(
            "c1",
            "kubectl get pods --context test -n default",
        )]);
        let mut assertion = shell_flag_assertion("kubectl", &["--context", "-n"]);

        ShellRequiredFlagAsserter
            .assert(&mut assertion, &blocks)
            .unwrap();
        assert_eq!(assertion.result, AssertionResult::True as i32);
    }

    #[test]
    fn shell_flag_skipped_when_command_absent() {
        let blocks = block_map(vec![code_block("c1", "gh pr list")]);
        let mut assertion = shell_flag_assertion("kubectl", &["-n"]);

        ShellRequiredFlagAsserter
            .assert(&mut assertion, &blocks)
            .unwrap();
        assert_eq!(assertion.result, AssertionResult::Skipped as i32);
    }

    #[test]
    fn tool_invoked_requires_a_code_block() {
        let mut assertion = Assertion {
            r#type: Type::ToolInvoked as i32,
            ..Default::default()
        };

        ToolInvokedAsserter
            .assert(&mut assertion, &block_map(vec![]))
            .unwrap();
        assert_eq!(assertion.result, AssertionResult::False as i32);

        ToolInvokedAsserter
            .assert(&mut assertion, &block_map(vec![code_block("c1", "ls")]))
            .unwrap();
        assert_eq!(assertion.result, AssertionResult::True as i32);
    }

    #[test]
    fn file_retrieved_matches_on_file_id() {
        let block = Block {
            id: "fs".to_string(),
            kind: BlockKind::FileSearchResults as i32,
            file_search_results: vec![FileSearchResult {
                file_id: "f1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let blocks = block_map(vec![block]);

        let mut assertion = Assertion {
            r#type: Type::FileRetrieved as i32,
            payload: Some(Payload::FileRetrieved(FileRetrieved {
                file_id: "f1".to_string(),
            })),
            ..Default::default()
        };
        FileRetrievedAsserter
            .assert(&mut assertion, &blocks)
            .unwrap();
        assert_eq!(assertion.result, AssertionResult::True as i32);

        let mut missing = Assertion {
            r#type: Type::FileRetrieved as i32,
            payload: Some(Payload::FileRetrieved(FileRetrieved {
                file_id: "f9".to_string(),
            })),
            ..Default::default()
        };
        FileRetrievedAsserter.assert(&mut missing, &blocks).unwrap();
        assert_eq!(missing.result, AssertionResult::False as i32);
    }

    #[test]
    fn codeblock_regex_rules() {
        let blocks = block_map(vec![code_block("c1", "kubectl rollout restart deploy/api")]);

        let mut matched = Assertion {
            r#type: Type::CodeblockRegex as i32,
            payload: Some(Payload::CodeblockRegex(CodeblockRegex {
                regex: "rollout\\s+restart".to_string(),
            })),
            ..Default::default()
        };
        CodeblockRegexAsserter
            .assert(&mut matched, &blocks)
            .unwrap();
        assert_eq!(matched.result, AssertionResult::True as i32);

        let mut empty = Assertion {
            r#type: Type::CodeblockRegex as i32,
            payload: Some(Payload::CodeblockRegex(CodeblockRegex {
                regex: String::new(),
            })),
            ..Default::default()
        };
        CodeblockRegexAsserter.assert(&mut empty, &blocks).unwrap();
        assert_eq!(empty.result, AssertionResult::Skipped as i32);

        let mut invalid = Assertion {
            r#type: Type::CodeblockRegex as i32,
            payload: Some(Payload::CodeblockRegex(CodeblockRegex {
                regex: "([unclosed".to_string(),
            })),
            ..Default::default()
        };
        let err = CodeblockRegexAsserter.assert(&mut invalid, &blocks);
        assert!(err.is_err());
        assert_eq!(invalid.result, AssertionResult::False as i32);
    }
}
