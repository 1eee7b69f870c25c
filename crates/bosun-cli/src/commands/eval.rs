use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use bosun_core::api::ResponsesClient;
use bosun_core::config::Config;
use bosun_core::eval::asserters::ResponsesJudge;
use bosun_core::eval::{load_experiment, Evaluator};

pub async fn run(
    config: Config,
    experiment_path: PathBuf,
    session_cookie: Option<String>,
) -> eyre::Result<()> {
    let experiment = load_experiment(&experiment_path)?;

    let mut evaluator = Evaluator::new().with_model(config.model());

    if let Some(cookie) = session_cookie {
        evaluator = evaluator.with_session_cookie(cookie);
    }

    // LLM_JUDGE assertions need provider access; without a key they are
    // skipped.
    match bosun_core::config::api_key() {
        Ok(api_key) => {
            let client = ResponsesClient::with_base_url(api_key, config.openai_base_url.clone());
            evaluator =
                evaluator.with_judge(Arc::new(ResponsesJudge::new(client, config.model())));
        }
        Err(err) => {
            warn!(target: "bosun::eval", "No provider key; LLM judge assertions will be skipped: {err}");
        }
    }

    let report_path = evaluator.run(&experiment).await?;
    println!("Wrote evaluation report to {}", report_path.display());

    Ok(())
}
