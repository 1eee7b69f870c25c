use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use bosun_proto::v1::{
    Block, BlockKind, BlockOutputKind, BlockRole, GenerateRequest, GenerateResponse,
};

use crate::api::types::{InputContentPart, InputItem, ResponsesRequest, Tool, ToolChoice};
use crate::api::ResponsesClient;
use crate::blocks::{BlockSender, BlocksBuilder, LinkFn};
use crate::error::{Error, Result};

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an internal cloud assistant. Your job is to help developers
deploy and operate their software on their company's internal cloud. The
cloud consists of Kubernetes clusters, cloud-provider accounts, and source
forges. You have access to CLIs like kubectl, gh, yq, jq, git, az, bazel,
curl, wget, and so on.

If you need the user to run a command to act on or observe the cloud,
respond with the shell tool call. You also have access to internal
documentation which you can search for information about how to use the
cloud. Always try to run commands on the user's behalf and save them the
work of invoking them themselves.
"#;

const SHELL_TOOL_DESCRIPTION: &str = "The shell tool executes CLIs (e.g. kubectl, gh, yq, jq, git, az, \
bazel, curl, wget, etc...). These CLIs can be used to act and observe on the cloud. The input is a \
short bash program that can be executed. Additional CLIs can be installed by running the appropriate \
commands.";

fn shell_tool_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "shell": {
                "type": "string",
                "description": "A short bash program to be executed in bash",
            },
        },
        "required": ["shell"],
        "additionalProperties": false,
    })
}

/// Default number of file-search hits to ask the provider for.
const DEFAULT_MAX_FILE_SEARCH_RESULTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    /// Overrides the built-in system prompt.
    pub system_prompt: Option<String>,
    /// Vector store ids for the file-search tool. At most one is supported.
    pub vector_stores: Vec<String>,
    /// How many file-search hits to ask the provider for.
    pub max_file_search_results: u32,
    /// Capacity of the response/block caches backing tool-call fill-in.
    pub cache_size: NonZeroUsize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            system_prompt: None,
            vector_stores: Vec::new(),
            max_file_search_results: DEFAULT_MAX_FILE_SEARCH_RESULTS,
            cache_size: NonZeroUsize::new(64).expect("non-zero"),
        }
    }
}

/// Agent translates a GenerateRequest into a Responses-API call and streams
/// block deltas back to the client through a BlocksBuilder.
pub struct Agent {
    config: AgentConfig,
    client: ResponsesClient,
    filename_to_link: Option<LinkFn>,

    // Shared across requests so follow-up turns can be completed with the
    // tool calls of the response they continue from.
    response_blocks: Arc<Mutex<LruCache<String, Vec<String>>>>,
    blocks_by_id: Arc<Mutex<LruCache<String, Block>>>,
}

impl Agent {
    pub fn new(config: AgentConfig, client: ResponsesClient) -> Self {
        let cache_size = config.cache_size;
        Self {
            config,
            client,
            filename_to_link: None,
            response_blocks: Arc::new(Mutex::new(LruCache::new(cache_size))),
            blocks_by_id: Arc::new(Mutex::new(LruCache::new(cache_size))),
        }
    }

    pub fn with_filename_to_link(mut self, to_link: LinkFn) -> Self {
        self.filename_to_link = Some(to_link);
        self
    }

    /// Serve one Generate call: validate the request, fill in cached tool
    /// calls, stream the model response through a BlocksBuilder, and forward
    /// every block update to `sender`.
    pub async fn generate(
        &self,
        req: GenerateRequest,
        token: CancellationToken,
        sender: BlockSender,
    ) -> Result<()> {
        info!(target: "bosun::agent", blocks = req.blocks.len(), "Agent.Generate");

        if req.blocks.is_empty() {
            return Err(Error::InvalidArgument(
                "blocks must be non-empty".to_string(),
            ));
        }

        if self.config.vector_stores.len() > 1 {
            return Err(Error::Internal(
                "expected at most one vector store".to_string(),
            ));
        }

        let blocks = self.fill_in_toolcalls(&req.previous_response_id, req.blocks);

        if req.previous_response_id.is_empty()
            && blocks[0].role != BlockRole::User as i32
        {
            return Err(Error::InvalidArgument(
                "first block must be user input".to_string(),
            ));
        }

        let request = ResponsesRequest {
            model: self.config.model.clone(),
            input: Some(blocks_to_input(&blocks)?),
            instructions: Some(
                self.config
                    .system_prompt
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            ),
            previous_response_id: if req.previous_response_id.is_empty() {
                None
            } else {
                Some(req.previous_response_id.clone())
            },
            parallel_tool_calls: Some(true),
            stream: None,
            tools: Some(self.build_tools()),
            tool_choice: Some(ToolChoice::Auto),
            // We want the response to carry the file-search results.
            include: Some(vec!["file_search_call.results".to_string()]),
        };

        let events = self.client.stream_response(request, token.clone()).await?;

        let builder = BlocksBuilder::new(self.filename_to_link.clone());

        // Tee builder emissions through a recording task that keeps the
        // fill-in caches current before forwarding to the client.
        let (tx, mut rx) = mpsc::channel::<GenerateResponse>(100);
        let response_blocks = self.response_blocks.clone();
        let blocks_by_id = self.blocks_by_id.clone();
        let forward = tokio::spawn(async move {
            while let Some(resp) = rx.recv().await {
                if !resp.response_id.is_empty() {
                    {
                        let mut cache = response_blocks.lock().unwrap();
                        let ids = cache.get_or_insert_mut(resp.response_id.clone(), Vec::new);
                        for block in &resp.blocks {
                            if !ids.contains(&block.id) {
                                ids.push(block.id.clone());
                            }
                        }
                    }
                    {
                        let mut cache = blocks_by_id.lock().unwrap();
                        for block in &resp.blocks {
                            cache.put(block.id.clone(), block.clone());
                        }
                    }
                }
                if sender.send(resp).await.is_err() {
                    break;
                }
            }
        });

        let result = builder.handle_events(events, &token, &tx).await;
        drop(tx);
        let _ = forward.await;
        result
    }

    /// Complete the inbound block list with tool-call blocks cached from the
    /// response this request continues. Inbound blocks always take
    /// precedence over cached ones.
    fn fill_in_toolcalls(&self, previous_response_id: &str, inbound: Vec<Block>) -> Vec<Block> {
        if previous_response_id.is_empty() {
            return inbound;
        }

        let cached_ids = {
            let mut cache = self.response_blocks.lock().unwrap();
            cache.get(previous_response_id).cloned()
        };
        let Some(cached_ids) = cached_ids else {
            return inbound;
        };

        let present: HashSet<String> = inbound.iter().map(|b| b.id.clone()).collect();

        let mut filled = Vec::with_capacity(cached_ids.len() + inbound.len());
        {
            let mut cache = self.blocks_by_id.lock().unwrap();
            for id in &cached_ids {
                if present.contains(id) {
                    continue;
                }
                if let Some(block) = cache.get(id) {
                    filled.push(block.clone());
                }
            }
        }
        filled.extend(inbound);
        filled
    }

    fn build_tools(&self) -> Vec<Tool> {
        let mut tools = Vec::with_capacity(2);

        if let Some(store) = self.config.vector_stores.first() {
            tools.push(Tool::FileSearch {
                vector_store_ids: vec![store.clone()],
                max_num_results: self.config.max_file_search_results,
            });
        }

        tools.push(Tool::Function {
            name: "shell".to_string(),
            description: Some(SHELL_TOOL_DESCRIPTION.to_string()),
            parameters: shell_tool_schema(),
            strict: false,
        });

        tools
    }
}

/// Translate conversation blocks into Responses-API input items.
fn blocks_to_input(blocks: &[Block]) -> Result<Vec<InputItem>> {
    let mut items = Vec::with_capacity(blocks.len());

    for block in blocks {
        match BlockKind::try_from(block.kind) {
            Ok(BlockKind::Markup) => items.push(InputItem::Message {
                role: "user".to_string(),
                content: vec![InputContentPart::InputText {
                    text: block.contents.clone(),
                }],
            }),
            Ok(BlockKind::Code) => {
                let arguments =
                    serde_json::json!({ "shell": block.contents.clone() }).to_string();
                items.push(InputItem::FunctionCall {
                    item_type: "function_call".to_string(),
                    call_id: block.call_id.clone(),
                    name: "shell".to_string(),
                    arguments,
                });
                items.push(InputItem::FunctionCallOutput {
                    item_type: "function_call_output".to_string(),
                    call_id: block.call_id.clone(),
                    output: outputs_to_json(block),
                });
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported block kind: {}",
                    block.kind
                )));
            }
        }
    }

    Ok(items)
}

fn outputs_to_json(block: &Block) -> String {
    let mut map = serde_json::Map::new();

    let stdout = join_outputs(block, BlockOutputKind::Stdout);
    if !stdout.is_empty() {
        map.insert("STDOUT".to_string(), serde_json::Value::String(stdout));
    }
    let stderr = join_outputs(block, BlockOutputKind::Stderr);
    if !stderr.is_empty() {
        map.insert("STDERR".to_string(), serde_json::Value::String(stderr));
    }

    serde_json::Value::Object(map).to_string()
}

fn join_outputs(block: &Block, kind: BlockOutputKind) -> String {
    let mut texts = Vec::new();
    for output in &block.outputs {
        if output.kind != kind as i32 {
            continue;
        }
        for item in &output.items {
            if !item.text_data.is_empty() {
                texts.push(item.text_data.as_str());
            }
        }
    }
    texts.join("\n")
}
