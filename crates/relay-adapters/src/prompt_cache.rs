//! Prompt-cache placement for the anthropic family.
//!
//! At most four blocks per request may carry a `cache_control` marker.
//! Selection priority is tools > system > user > assistant, ties broken by
//! descending size; the marker goes on the *last* element of a selected
//! group so the cache prefix cascades over everything before it.

use serde_json::{Value, json};

/// Character threshold for annotating an individual text block (~1024
/// tokens).
pub const CACHE_MIN_CHARS: usize = 4096;

/// Upstream budget of cacheable blocks per request. Caller-supplied
/// annotations count against it.
pub const CACHE_MAX_BLOCKS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Tools,
    System,
    MessageBlock { message: usize, block: usize },
}

struct Candidate {
    priority: u8,
    size: usize,
    target: Target,
}

/// Annotate an anthropic wire body in place. Existing `cache_control`
/// markers are preserved unchanged and consume budget.
pub fn apply_cache_annotations(body: &mut Value) {
    let existing = count_existing(body);
    let budget = CACHE_MAX_BLOCKS.saturating_sub(existing);
    if budget == 0 {
        return;
    }

    let mut candidates = collect_candidates(body);
    // Stable on ties: equal (priority, size) keeps document order.
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.size.cmp(&a.size))
    });
    candidates.truncate(budget);

    for candidate in candidates {
        annotate(body, candidate.target);
    }
}

fn count_existing(body: &Value) -> usize {
    let mut count = 0;
    if let Some(tools) = body["tools"].as_array() {
        count += tools
            .iter()
            .filter(|t| t.get("cache_control").is_some())
            .count();
    }
    if let Some(system) = body["system"].as_array() {
        count += system
            .iter()
            .filter(|b| b.get("cache_control").is_some())
            .count();
    }
    if let Some(messages) = body["messages"].as_array() {
        for msg in messages {
            if let Some(blocks) = msg["content"].as_array() {
                count += blocks
                    .iter()
                    .filter(|b| b.get("cache_control").is_some())
                    .count();
            }
        }
    }
    count
}

fn collect_candidates(body: &Value) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    if let Some(tools) = body["tools"].as_array() {
        if !tools.is_empty() && !tools.iter().any(|t| t.get("cache_control").is_some()) {
            candidates.push(Candidate {
                priority: 0,
                size: serde_json::to_string(tools).map(|s| s.len()).unwrap_or(0),
                target: Target::Tools,
            });
        }
    }

    if let Some(system) = body["system"].as_array() {
        let size: usize = system
            .iter()
            .filter_map(|b| b["text"].as_str())
            .map(|t| t.len())
            .sum();
        if size > 0 && !system.iter().any(|b| b.get("cache_control").is_some()) {
            candidates.push(Candidate {
                priority: 1,
                size,
                target: Target::System,
            });
        }
    }

    if let Some(messages) = body["messages"].as_array() {
        for (mi, msg) in messages.iter().enumerate() {
            let priority = match msg["role"].as_str() {
                Some("user") => 2,
                Some("assistant") => 3,
                _ => continue,
            };
            let Some(blocks) = msg["content"].as_array() else {
                continue;
            };
            for (bi, block) in blocks.iter().enumerate() {
                if block["type"].as_str() != Some("text") {
                    continue;
                }
                if block.get("cache_control").is_some() {
                    continue;
                }
                let size = block["text"].as_str().map(|t| t.len()).unwrap_or(0);
                if size >= CACHE_MIN_CHARS {
                    candidates.push(Candidate {
                        priority,
                        size,
                        target: Target::MessageBlock {
                            message: mi,
                            block: bi,
                        },
                    });
                }
            }
        }
    }

    candidates
}

fn annotate(body: &mut Value, target: Target) {
    let marker = json!({ "type": "ephemeral" });
    match target {
        Target::Tools => {
            if let Some(last) = body["tools"].as_array_mut().and_then(|t| t.last_mut()) {
                last["cache_control"] = marker;
            }
        }
        Target::System => {
            if let Some(last) = body["system"].as_array_mut().and_then(|s| s.last_mut()) {
                last["cache_control"] = marker;
            }
        }
        Target::MessageBlock { message, block } => {
            if let Some(b) = body["messages"]
                .get_mut(message)
                .and_then(|m| m["content"].get_mut(block))
            {
                b["cache_control"] = marker;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big(ch: char) -> String {
        std::iter::repeat_n(ch, CACHE_MIN_CHARS).collect()
    }

    fn body_with(messages: Value) -> Value {
        json!({
            "tools": [
                { "name": "a", "input_schema": {} },
                { "name": "b", "input_schema": {} }
            ],
            "system": [{ "type": "text", "text": big('s') }],
            "messages": messages
        })
    }

    fn marked(body: &Value) -> usize {
        let mut count = 0;
        for tool in body["tools"].as_array().unwrap() {
            count += tool.get("cache_control").is_some() as usize;
        }
        for b in body["system"].as_array().unwrap() {
            count += b.get("cache_control").is_some() as usize;
        }
        for msg in body["messages"].as_array().unwrap() {
            if let Some(blocks) = msg["content"].as_array() {
                for b in blocks {
                    count += b.get("cache_control").is_some() as usize;
                }
            }
        }
        count
    }

    #[test]
    fn marks_tools_on_last_tool_and_system() {
        let mut body = body_with(json!([
            { "role": "user", "content": [{ "type": "text", "text": "short" }] }
        ]));
        apply_cache_annotations(&mut body);

        let tools = body["tools"].as_array().unwrap();
        assert!(tools[0].get("cache_control").is_none());
        assert_eq!(tools[1]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        // The short user block is below threshold.
        assert_eq!(marked(&body), 2);
    }

    #[test]
    fn budget_is_four_with_user_before_assistant() {
        let mut body = body_with(json!([
            { "role": "assistant", "content": [{ "type": "text", "text": big('a') }] },
            { "role": "user", "content": [{ "type": "text", "text": big('u') }] },
            { "role": "user", "content": [{ "type": "text", "text": big('v') + "x" }] }
        ]));
        apply_cache_annotations(&mut body);

        assert_eq!(marked(&body), CACHE_MAX_BLOCKS);
        // tools + system + both user blocks; the assistant block loses.
        assert!(
            body["messages"][0]["content"][0]
                .get("cache_control")
                .is_none()
        );
        assert!(
            body["messages"][1]["content"][0]
                .get("cache_control")
                .is_some()
        );
        assert!(
            body["messages"][2]["content"][0]
                .get("cache_control")
                .is_some()
        );
    }

    #[test]
    fn caller_annotations_consume_budget() {
        let mut body = json!({
            "tools": [
                { "name": "a", "input_schema": {}, "cache_control": { "type": "ephemeral" } }
            ],
            "system": [{ "type": "text", "text": big('s') }],
            "messages": [
                { "role": "user", "content": [
                    { "type": "text", "text": big('u'), "cache_control": { "type": "ephemeral" } },
                    { "type": "text", "text": big('v') },
                    { "type": "text", "text": big('w') },
                    { "type": "text", "text": big('x') }
                ] }
            ]
        });
        apply_cache_annotations(&mut body);

        // 2 caller-supplied + at most 2 new.
        assert_eq!(marked(&body), CACHE_MAX_BLOCKS);
        // System outranks the remaining user blocks.
        assert!(body["system"][0].get("cache_control").is_some());
    }

    #[test]
    fn ties_break_by_descending_size() {
        let mut body = json!({
            "messages": [
                { "role": "user", "content": [{ "type": "text", "text": big('a') }] },
                { "role": "user", "content": [{ "type": "text", "text": big('b') + "xxxx" }] }
            ]
        });
        // No tools/system arrays at all.
        apply_cache_annotations(&mut body);
        assert!(
            body["messages"][1]["content"][0]
                .get("cache_control")
                .is_some()
        );
        assert!(
            body["messages"][0]["content"][0]
                .get("cache_control")
                .is_some()
        );
    }
}
