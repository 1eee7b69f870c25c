pub mod asserters;
pub mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tonic::transport::Channel;
use tracing::{info, warn};

use bosun_proto::eval::v1::assertion::{Payload, Result as AssertionResult, Type};
use bosun_proto::eval::v1::{EvalDataset, Experiment};
use bosun_proto::v1::blocks_service_client::BlocksServiceClient;
use bosun_proto::v1::{Block, BlockKind, BlockRole, GenerateRequest};

use crate::error::{Error, Result};
use asserters::{asserter_for, BlockMap, Judge};
use report::{FailedAssertion, MarkdownReport};

/// Load a YAML document into a proto type by round-tripping it through the
/// proto3 JSON mapping.
fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)?;
    let value: serde_yaml::Value = serde_yaml::from_str(&data)?;
    let json = serde_json::to_value(value)?;
    Ok(serde_json::from_value(json)?)
}

pub fn load_experiment(path: &Path) -> Result<Experiment> {
    load_yaml(path)
}

pub fn load_dataset(path: &Path) -> Result<EvalDataset> {
    load_yaml(path)
}

/// Evaluator replays dataset samples against a serving endpoint and grades
/// the assertions of each sample over the final block set.
#[derive(Default)]
pub struct Evaluator {
    session_cookie: Option<String>,
    judge: Option<Arc<dyn Judge>>,
    model: Option<String>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session cookie attached verbatim to every inference call.
    pub fn with_session_cookie(mut self, cookie: String) -> Self {
        self.session_cookie = Some(cookie);
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Model name recorded in the report metadata.
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Run the experiment and write the markdown report; returns the report
    /// path.
    pub async fn run(&self, experiment: &Experiment) -> Result<PathBuf> {
        let spec = experiment
            .spec
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("experiment has no spec".to_string()))?;

        let dataset = load_dataset(Path::new(&spec.dataset_path))?;

        let now = chrono::Local::now();
        let mut md = MarkdownReport {
            experiment_name: experiment
                .metadata
                .as_ref()
                .map(|m| m.name.clone())
                .unwrap_or_default(),
            dataset_name: spec.dataset_path.clone(),
            num_samples: dataset.samples.len(),
            commit: option_env!("BOSUN_COMMIT").unwrap_or("unknown").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model: self.model.clone().unwrap_or_else(|| "unknown".to_string()),
            runner: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            language_version: format!("rust {}", env!("CARGO_PKG_RUST_VERSION")),
            date: now.format("%Y-%m-%d %H:%M").to_string(),
            ..Default::default()
        };

        for sample in &dataset.samples {
            info!(target: "bosun::eval", sample = %sample.name, "Running sample");
            let blocks = self
                .run_inference(&spec.inference_endpoint, &sample.input_text)
                .await?;

            for assertion in &sample.assertions {
                let mut assertion = assertion.clone();
                self.grade(&mut assertion, &blocks).await;

                md.num_assertions += 1;
                let stats = md
                    .type_stats
                    .entry(assertion.r#type().as_str_name().to_string())
                    .or_default();
                match assertion.result() {
                    AssertionResult::True => {
                        md.num_passed += 1;
                        stats.passed += 1;
                    }
                    AssertionResult::False | AssertionResult::Unspecified => {
                        md.num_failed += 1;
                        stats.failed += 1;
                        md.failed_assertions.push(FailedAssertion {
                            sample: sample.name.clone(),
                            assertion: assertion.name.clone(),
                            reason: if assertion.failure_reason.is_empty() {
                                "failed".to_string()
                            } else {
                                assertion.failure_reason.clone()
                            },
                        });
                    }
                    AssertionResult::Skipped => {
                        md.num_skipped += 1;
                        stats.skipped += 1;
                    }
                }
            }
        }

        let output_dir = if spec.output_dir.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&spec.output_dir)
        };
        std::fs::create_dir_all(&output_dir)?;

        let report_path =
            output_dir.join(format!("eval_report_{}.md", now.format("%Y%m%d_%H%M%S")));
        std::fs::write(&report_path, md.render())?;
        info!(target: "bosun::eval", path = %report_path.display(), "Wrote evaluation report");

        Ok(report_path)
    }

    async fn grade(&self, assertion: &mut bosun_proto::eval::v1::Assertion, blocks: &BlockMap) {
        match assertion.r#type() {
            Type::LlmJudge => {
                let Some(judge) = &self.judge else {
                    assertion.result = AssertionResult::Skipped as i32;
                    return;
                };
                let prompt = match &assertion.payload {
                    Some(Payload::LlmJudge(payload)) => payload.prompt.clone(),
                    _ => String::new(),
                };
                match judge.judge(&prompt, blocks).await {
                    Ok(true) => assertion.result = AssertionResult::True as i32,
                    Ok(false) => {
                        assertion.result = AssertionResult::False as i32;
                        assertion.failure_reason = "judge returned FALSE".to_string();
                    }
                    Err(err) => {
                        warn!(target: "bosun::eval", "Judge failed: {err}");
                        assertion.result = AssertionResult::False as i32;
                        assertion.failure_reason = format!("judge error: {err}");
                    }
                }
            }
            assertion_type => match asserter_for(assertion_type) {
                Some(asserter) => {
                    if let Err(err) = asserter.assert(assertion, blocks) {
                        warn!(
                            target: "bosun::eval",
                            assertion = %assertion.name,
                            "Assertion errored: {err}"
                        );
                    }
                }
                None => {
                    assertion.result = AssertionResult::Skipped as i32;
                }
            },
        }
    }

    /// Send the sample's input as one USER/MARKUP block and fold the
    /// streamed responses into a block map, last write wins per id.
    async fn run_inference(&self, endpoint: &str, input_text: &str) -> Result<BlockMap> {
        if endpoint.is_empty() {
            return Err(Error::Configuration(
                "inference endpoint is not set".to_string(),
            ));
        }

        let channel = Channel::from_shared(endpoint.to_string())
            .map_err(|e| Error::Configuration(format!("invalid inference endpoint: {e}")))?
            .connect()
            .await?;
        let mut client = BlocksServiceClient::new(channel);

        let mut request = tonic::Request::new(GenerateRequest {
            blocks: vec![Block {
                kind: BlockKind::Markup as i32,
                role: BlockRole::User as i32,
                contents: input_text.to_string(),
                ..Default::default()
            }],
            previous_response_id: String::new(),
        });

        if let Some(cookie) = &self.session_cookie {
            let value = cookie
                .parse()
                .map_err(|_| Error::InvalidArgument("invalid session cookie".to_string()))?;
            request.metadata_mut().insert("cookie", value);
        }

        let mut stream = client.generate(request).await?.into_inner();

        let mut blocks = BlockMap::new();
        while let Some(response) = stream.message().await? {
            for block in response.blocks {
                blocks.insert(block.id.clone(), block);
            }
        }

        Ok(blocks)
    }
}
