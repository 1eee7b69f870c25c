use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bosun_proto::v1::{Block, BlockKind, BlockRole, FileSearchResult, GenerateResponse};

use crate::api::types::{MessageContentPart, OutputItem, StreamEvent};
use crate::api::{ApiError, EventStream};
use crate::error::{Error, Result};
use crate::markdown;

/// Rewrites a file name into a link the UI can render.
pub type LinkFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Channel the builder emits block updates on. Every send carries only the
/// blocks changed by a single event.
pub type BlockSender = mpsc::Sender<GenerateResponse>;

#[derive(Debug, serde::Deserialize)]
struct ShellArgs {
    shell: String,
}

/// BlocksBuilder folds the stream of deltas from the Responses API into
/// blocks to be streamed back to the frontend. This is a stateful operation
/// because responses are deltas to be added to previous responses.
pub struct BlocksBuilder {
    filename_to_link: Option<LinkFn>,
    state: Mutex<BuilderState>,
}

#[derive(Default)]
struct BuilderState {
    response_id: String,
    // Map from block id to block.
    blocks: HashMap<String, Block>,
}

impl BlocksBuilder {
    pub fn new(filename_to_link: Option<LinkFn>) -> Self {
        Self {
            filename_to_link,
            state: Mutex::new(BuilderState::default()),
        }
    }

    /// Process the stream of events, sending an update for every block
    /// change. Runs until the stream ends, an event fails, or the token
    /// fires; cancellation is reported as `Error::Cancelled` so the caller
    /// can distinguish a timeout from a hard failure.
    pub async fn handle_events(
        &self,
        mut events: EventStream,
        token: &CancellationToken,
        sender: &BlockSender,
    ) -> Result<()> {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(target: "bosun::blocks", "Context cancelled; stopping streaming request");
                    return Err(Error::Cancelled);
                }
                event = events.next() => event,
            };

            let Some(event) = event else {
                return Ok(());
            };

            match event {
                Ok(event) => self.process_event(event, sender).await?,
                Err(ApiError::Cancelled) => return Err(Error::Cancelled),
                Err(err) => return Err(Error::Api(err)),
            }
        }
    }

    /// Process one response stream event and update the internal state of
    /// the builder.
    pub async fn process_event(&self, event: StreamEvent, sender: &BlockSender) -> Result<()> {
        let changed = match event {
            StreamEvent::Created { response } => {
                let mut state = self.state.lock().unwrap();
                state.response_id = response.id;
                Vec::new()
            }
            StreamEvent::OutputTextDelta { item_id, delta } => {
                if item_id.is_empty() {
                    return Err(Error::InvalidArgument(
                        "text delta has no item id".to_string(),
                    ));
                }
                let mut state = self.state.lock().unwrap();
                let block = state.ensure_block(&item_id, BlockKind::Markup);
                block.contents.push_str(&delta);
                vec![block.clone()]
            }
            StreamEvent::FunctionCallArgumentsDelta { item_id, delta } => {
                if item_id.is_empty() {
                    return Err(Error::InvalidArgument(
                        "function call arguments delta has no item id".to_string(),
                    ));
                }
                let mut state = self.state.lock().unwrap();
                let block = state.ensure_block(&item_id, BlockKind::Code);
                // The delta spells out the raw arguments JSON, e.g. the
                // string {"shell": ...} character by character.
                block.contents.push_str(&delta);
                vec![block.clone()]
            }
            StreamEvent::FunctionCallArgumentsDone { item_id, arguments } => {
                if item_id.is_empty() {
                    return Err(Error::InvalidArgument(
                        "function call arguments done has no item id".to_string(),
                    ));
                }
                let mut state = self.state.lock().unwrap();
                let block = state.ensure_block(&item_id, BlockKind::Code);
                match serde_json::from_str::<ShellArgs>(&arguments) {
                    Ok(args) => block.contents = args.shell,
                    Err(err) => {
                        warn!(
                            target: "bosun::blocks",
                            "Failed to unmarshal shell arguments: {err}; keeping raw arguments"
                        );
                        block.contents = arguments;
                    }
                }
                vec![block.clone()]
            }
            StreamEvent::OutputItemDone { item } => self.item_done_to_blocks(item),
            StreamEvent::Error { code, message } => {
                return Err(Error::Api(ApiError::StreamError {
                    details: format!("{code}: {message}"),
                }));
            }
            StreamEvent::Unknown => {
                debug!(target: "bosun::blocks", "Ignoring event");
                Vec::new()
            }
        };

        if changed.is_empty() {
            return Ok(());
        }

        let response_id = self.state.lock().unwrap().response_id.clone();
        sender
            .send(GenerateResponse {
                response_id,
                blocks: changed,
            })
            .await
            .map_err(|_| Error::Internal("Failed to send response to client".to_string()))
    }

    fn item_done_to_blocks(&self, item: OutputItem) -> Vec<Block> {
        match item {
            OutputItem::Message { content, .. } => {
                // Parse out any fenced code blocks in the message so they
                // get rendered as executable code.
                let mut results = Vec::new();
                for part in content {
                    let MessageContentPart::OutputText { text } = part else {
                        continue;
                    };
                    if text.is_empty() {
                        continue;
                    }
                    results.extend(
                        markdown::markdown_to_blocks(&text)
                            .into_iter()
                            .filter(|b| b.kind == BlockKind::Code as i32),
                    );
                }
                results
            }
            OutputItem::FunctionCall { id, call_id } => {
                let mut state = self.state.lock().unwrap();
                match state.blocks.get_mut(&id) {
                    Some(block) if block.call_id.is_empty() && !call_id.is_empty() => {
                        block.call_id = call_id;
                        vec![block.clone()]
                    }
                    _ => Vec::new(),
                }
            }
            OutputItem::FileSearchCall { id, results } => {
                self.file_search_done_to_block(&id, results.unwrap_or_default())
            }
            OutputItem::Other => Vec::new(),
        }
    }

    fn file_search_done_to_block(
        &self,
        item_id: &str,
        results: Vec<crate::api::types::FileSearchResultItem>,
    ) -> Vec<Block> {
        let mut state = self.state.lock().unwrap();
        let block = state.ensure_block(item_id, BlockKind::FileSearchResults);

        let mut existing: std::collections::HashSet<String> = block
            .file_search_results
            .iter()
            .map(|r| r.file_id.clone())
            .collect();

        for result in results {
            if existing.contains(&result.file_id) {
                continue;
            }

            let link = match &self.filename_to_link {
                Some(to_link) => to_link(&result.filename),
                None => result.filename.clone(),
            };

            block.file_search_results.push(FileSearchResult {
                file_id: result.file_id.clone(),
                file_name: result.filename,
                score: result.score,
                link,
            });
            existing.insert(result.file_id);
        }

        vec![block.clone()]
    }

    /// Snapshot of one tracked block, for inspection after the stream ends.
    pub(crate) fn block(&self, id: &str) -> Option<Block> {
        self.state.lock().unwrap().blocks.get(id).cloned()
    }
}

impl BuilderState {
    fn ensure_block(&mut self, item_id: &str, kind: BlockKind) -> &mut Block {
        self.blocks
            .entry(item_id.to_string())
            .or_insert_with(|| Block {
                id: item_id.to_string(),
                kind: kind as i32,
                role: BlockRole::Assistant as i32,
                ..Default::default()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{FileSearchResultItem, ResponseHeader};

    fn sender() -> (BlockSender, mpsc::Receiver<GenerateResponse>) {
        mpsc::channel(16)
    }

    #[tokio::test]
    async fn text_deltas_accumulate_in_arrival_order() {
        let builder = BlocksBuilder::new(None);
        let (tx, mut rx) = sender();

        builder
            .process_event(
                StreamEvent::OutputTextDelta {
                    item_id: "a".to_string(),
                    delta: "hel".to_string(),
                },
                &tx,
            )
            .await
            .unwrap();
        builder
            .process_event(
                StreamEvent::OutputTextDelta {
                    item_id: "a".to_string(),
                    delta: "lo".to_string(),
                },
                &tx,
            )
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.blocks.len(), 1);
        assert_eq!(first.blocks[0].contents, "hel");
        assert_eq!(first.blocks[0].kind, BlockKind::Markup as i32);
        assert_eq!(first.blocks[0].role, BlockRole::Assistant as i32);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.blocks[0].contents, "hello");

        assert_eq!(builder.block("a").unwrap().contents, "hello");
    }

    #[tokio::test]
    async fn shell_arguments_done_replaces_accumulated_json() {
        let builder = BlocksBuilder::new(None);
        let (tx, mut rx) = sender();

        builder
            .process_event(
                StreamEvent::FunctionCallArgumentsDelta {
                    item_id: "c".to_string(),
                    delta: "{\"shell\"".to_string(),
                },
                &tx,
            )
            .await
            .unwrap();
        builder
            .process_event(
                StreamEvent::FunctionCallArgumentsDelta {
                    item_id: "c".to_string(),
                    delta: ": \"ls -la\"}".to_string(),
                },
                &tx,
            )
            .await
            .unwrap();
        builder
            .process_event(
                StreamEvent::FunctionCallArgumentsDone {
                    item_id: "c".to_string(),
                    arguments: "{\"shell\":\"ls -la\"}".to_string(),
                },
                &tx,
            )
            .await
            .unwrap();

        // Drain the two delta emissions.
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        let done = rx.recv().await.unwrap();
        assert_eq!(done.blocks[0].contents, "ls -la");
        assert_eq!(done.blocks[0].kind, BlockKind::Code as i32);
    }

    #[tokio::test]
    async fn malformed_arguments_fall_back_to_raw_json() {
        let builder = BlocksBuilder::new(None);
        let (tx, mut rx) = sender();

        builder
            .process_event(
                StreamEvent::FunctionCallArgumentsDone {
                    item_id: "c".to_string(),
                    arguments: "{not valid json".to_string(),
                },
                &tx,
            )
            .await
            .unwrap();

        let resp = rx.recv().await.unwrap();
        assert_eq!(resp.blocks[0].contents, "{not valid json");
    }

    #[tokio::test]
    async fn file_search_results_dedupe_by_file_id() {
        let builder = BlocksBuilder::new(None);
        let (tx, mut rx) = sender();

        let results = vec![
            FileSearchResultItem {
                file_id: "f1".to_string(),
                filename: "a.md".to_string(),
                score: 0.9,
            },
            FileSearchResultItem {
                file_id: "f2".to_string(),
                filename: "b.md".to_string(),
                score: 0.8,
            },
            FileSearchResultItem {
                file_id: "f1".to_string(),
                filename: "a.md".to_string(),
                score: 0.7,
            },
        ];

        builder
            .process_event(
                StreamEvent::OutputItemDone {
                    item: OutputItem::FileSearchCall {
                        id: "fs_1".to_string(),
                        results: Some(results),
                    },
                },
                &tx,
            )
            .await
            .unwrap();

        let resp = rx.recv().await.unwrap();
        let block = &resp.blocks[0];
        assert_eq!(block.kind, BlockKind::FileSearchResults as i32);
        let ids: Vec<&str> = block
            .file_search_results
            .iter()
            .map(|r| r.file_id.as_str())
            .collect();
        assert_eq!(ids, vec!["f1", "f2"]);
    }

    #[tokio::test]
    async fn filename_to_link_rewrites_links() {
        let builder = BlocksBuilder::new(Some(Arc::new(|name: &str| {
            format!("https://docs.example.com/{name}")
        })));
        let (tx, mut rx) = sender();

        builder
            .process_event(
                StreamEvent::OutputItemDone {
                    item: OutputItem::FileSearchCall {
                        id: "fs_1".to_string(),
                        results: Some(vec![FileSearchResultItem {
                            file_id: "f1".to_string(),
                            filename: "runbook.md".to_string(),
                            score: 0.5,
                        }]),
                    },
                },
                &tx,
            )
            .await
            .unwrap();

        let resp = rx.recv().await.unwrap();
        assert_eq!(
            resp.blocks[0].file_search_results[0].link,
            "https://docs.example.com/runbook.md"
        );
        assert_eq!(resp.blocks[0].file_search_results[0].file_name, "runbook.md");
    }

    #[tokio::test]
    async fn message_done_emits_fenced_code_blocks() {
        let builder = BlocksBuilder::new(None);
        let (tx, mut rx) = sender();

        builder
            .process_event(
                StreamEvent::OutputItemDone {
                    item: OutputItem::Message {
                        id: "msg_1".to_string(),
                        content: vec![MessageContentPart::OutputText {
                            text: "Run this:\n\n```bash\nkubectl get pods\n```\n".to_string(),
                        }],
                    },
                },
                &tx,
            )
            .await
            .unwrap();

        let resp = rx.recv().await.unwrap();
        assert_eq!(resp.blocks.len(), 1);
        assert_eq!(resp.blocks[0].kind, BlockKind::Code as i32);
        assert_eq!(resp.blocks[0].contents, "kubectl get pods");
    }

    #[tokio::test]
    async fn function_call_item_done_sets_call_id_once() {
        let builder = BlocksBuilder::new(None);
        let (tx, mut rx) = sender();

        builder
            .process_event(
                StreamEvent::FunctionCallArgumentsDelta {
                    item_id: "fc_1".to_string(),
                    delta: "{}".to_string(),
                },
                &tx,
            )
            .await
            .unwrap();
        builder
            .process_event(
                StreamEvent::OutputItemDone {
                    item: OutputItem::FunctionCall {
                        id: "fc_1".to_string(),
                        call_id: "call_9".to_string(),
                    },
                },
                &tx,
            )
            .await
            .unwrap();
        // A second done event must not rewrite the call id.
        builder
            .process_event(
                StreamEvent::OutputItemDone {
                    item: OutputItem::FunctionCall {
                        id: "fc_1".to_string(),
                        call_id: "call_other".to_string(),
                    },
                },
                &tx,
            )
            .await
            .unwrap();

        rx.recv().await.unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.blocks[0].call_id, "call_9");
        assert_eq!(builder.block("fc_1").unwrap().call_id, "call_9");
    }

    #[tokio::test]
    async fn missing_item_id_is_a_protocol_error() {
        let builder = BlocksBuilder::new(None);
        let (tx, _rx) = sender();

        let err = builder
            .process_event(
                StreamEvent::OutputTextDelta {
                    item_id: String::new(),
                    delta: "hi".to_string(),
                },
                &tx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn response_id_is_stamped_on_emissions() {
        let builder = BlocksBuilder::new(None);
        let (tx, mut rx) = sender();

        builder
            .process_event(
                StreamEvent::Created {
                    response: ResponseHeader {
                        id: "resp_42".to_string(),
                    },
                },
                &tx,
            )
            .await
            .unwrap();
        builder
            .process_event(
                StreamEvent::OutputTextDelta {
                    item_id: "a".to_string(),
                    delta: "hi".to_string(),
                },
                &tx,
            )
            .await
            .unwrap();

        let resp = rx.recv().await.unwrap();
        assert_eq!(resp.response_id, "resp_42");
    }

    #[tokio::test]
    async fn unknown_events_produce_no_emission() {
        let builder = BlocksBuilder::new(None);
        let (tx, mut rx) = sender();

        builder
            .process_event(StreamEvent::Unknown, &tx)
            .await
            .unwrap();

        drop(tx);
        assert!(rx.recv().await.is_none());
    }
}
