use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};
use uuid::Uuid;

use bosun_proto::v1::{
    Block, BlockKind, BlockOutput, BlockOutputItem, BlockOutputKind,
};

/// Fence language marking a code block as captured output rather than an
/// executable snippet.
pub const OUTPUT_LANG: &str = "output";

/// Split a markdown document into blocks. Fenced code becomes CODE blocks
/// carrying the fence language; everything between fences becomes MARKUP
/// blocks with the raw source text. A fence with the `output` language
/// attaches to the preceding CODE block as stdout output instead of forming
/// its own block; intervening prose resets that attachment.
pub fn markdown_to_blocks(text: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut last_code_idx: Option<usize> = None;
    let mut markup_start = 0usize;
    let mut code_lang = String::new();
    let mut code_buf = String::new();
    let mut in_code = false;

    for (event, range) in Parser::new(text).into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(kind)) => {
                flush_markup(
                    &text[markup_start..range.start],
                    &mut blocks,
                    &mut last_code_idx,
                );
                markup_start = range.end;
                code_lang = match kind {
                    CodeBlockKind::Fenced(lang) => lang
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                code_buf.clear();
                in_code = true;
            }
            Event::Text(t) if in_code => code_buf.push_str(&t),
            Event::End(TagEnd::CodeBlock) => {
                in_code = false;
                let contents = code_buf.trim_end_matches('\n').to_string();

                if code_lang == OUTPUT_LANG {
                    if let Some(idx) = last_code_idx {
                        blocks[idx].outputs.push(BlockOutput {
                            kind: BlockOutputKind::Stdout as i32,
                            items: vec![BlockOutputItem {
                                mime: "text/plain".to_string(),
                                text_data: contents,
                            }],
                        });
                        continue;
                    }
                    // No code block to attach to; fall through and treat it
                    // as a code block of its own.
                }

                blocks.push(Block {
                    id: Uuid::new_v4().to_string(),
                    kind: BlockKind::Code as i32,
                    contents,
                    language: code_lang.clone(),
                    ..Default::default()
                });
                if code_lang != OUTPUT_LANG {
                    last_code_idx = Some(blocks.len() - 1);
                }
            }
            _ => {}
        }
    }

    flush_markup(&text[markup_start..], &mut blocks, &mut last_code_idx);

    blocks
}

fn flush_markup(source: &str, blocks: &mut Vec<Block>, last_code_idx: &mut Option<usize>) {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return;
    }

    blocks.push(Block {
        id: Uuid::new_v4().to_string(),
        kind: BlockKind::Markup as i32,
        contents: trimmed.to_string(),
        ..Default::default()
    });
    // A subsequent output fence belongs to prose now, not to an earlier
    // code block.
    *last_code_idx = None;
}
