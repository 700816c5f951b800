//! Padding injector.
//!
//! Rewrites the `system` field of an eligible request into an ordered block
//! list: the channel's padding bundle (marked for caching), an optional
//! category prompt block, then the user's original system content verbatim.
//! Optionally drops a cache breakpoint on a trailing conversation turn so
//! multi-turn dialogs keep hitting the cache past the first turn.
//!
//! The provider accepts at most four `cache_control` markers per request.
//! The injector budgets against markers the user already supplied: when the
//! budget would be exceeded it drops the history marker first, then the
//! category block, and keeps the global marker. A request whose own markers
//! leave no room for the global marker cannot be optimized at all.

use prelay_wire::{CacheControl, ContentBlock, MessageRequest, SystemContent};

use crate::channel::{CategorySelector, ChannelConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::padding::PaddingBundle;

/// Upstream limit on `cache_control` markers per request.
pub const MAX_CACHE_MARKERS: usize = 4;

/// Injects the padding prefix into `request` in place.
///
/// Idempotent: a request whose system already starts with this bundle is
/// left untouched, so re-application cannot stack padding blocks.
///
/// # Errors
/// Returns `InjectionFailed` when the user's own markers leave no room for
/// the global marker. Callers recover by forwarding the original body.
pub fn inject(
    request: &mut MessageRequest,
    channel: &ChannelConfig,
    bundle: &PaddingBundle,
    selector: &dyn CategorySelector,
) -> GatewayResult<()> {
    if already_injected(request, bundle) {
        return Ok(());
    }

    let marker = CacheControl::ephemeral_with_ttl(channel.cache_ttl.wire_ttl());

    let existing = request.cache_marker_count();
    let mut available = MAX_CACHE_MARKERS
        .checked_sub(existing + 1)
        .ok_or_else(|| {
            GatewayError::injection(format!(
                "request already carries {existing} cache markers; no room for the padding marker"
            ))
        })?;

    // Category before history in the budget: history is dropped first.
    let category_prompt = if channel.category_active() && available >= 1 {
        let prompt = selector.select(&channel.category_prompts);
        if prompt.is_some() {
            available -= 1;
        }
        prompt.map(str::to_string)
    } else {
        None
    };
    let history_budgeted = available >= 1;

    let mut system = Vec::new();
    system.push(ContentBlock::cached_text(bundle.text(), marker.clone()));
    if let Some(prompt) = category_prompt {
        system.push(ContentBlock::cached_text(prompt, marker.clone()));
    }
    match request.system.take() {
        Some(SystemContent::Text(text)) => system.push(ContentBlock::text(text)),
        Some(SystemContent::Blocks(blocks)) => system.extend(blocks),
        None => {}
    }
    request.system = Some(SystemContent::Blocks(system));

    if history_budgeted {
        mark_history_turn(request, channel, &marker);
    }

    Ok(())
}

fn already_injected(request: &MessageRequest, bundle: &PaddingBundle) -> bool {
    match &request.system {
        Some(SystemContent::Blocks(blocks)) => blocks
            .first()
            .and_then(ContentBlock::as_text)
            .is_some_and(|text| text == bundle.text()),
        _ => false,
    }
}

/// Places a breakpoint on the last block of the message `N` turns before the
/// current one, wrapping bare-string content into a block list first.
fn mark_history_turn(request: &mut MessageRequest, channel: &ChannelConfig, marker: &CacheControl) {
    let n = usize::from(channel.cache_history_messages);
    if n == 0 || request.messages.len() <= 2 {
        return;
    }
    let Some(index) = request.messages.len().checked_sub(n + 1) else {
        return;
    };
    let Some(message) = request.messages.get_mut(index) else {
        return;
    };
    let blocks = message.content.ensure_blocks();
    if let Some(last) = blocks.last_mut() {
        last.set_cache_control(marker.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use prelay_wire::{CacheTtl as WireTtl, MessageContent};
    use serde_json::json;

    use super::*;
    use crate::channel::{CacheTtl, FirstCategory, test_channel};

    fn bundle() -> PaddingBundle {
        PaddingBundle::default_bundle().clone()
    }

    fn request(body: serde_json::Value) -> MessageRequest {
        MessageRequest::from_slice(body.to_string().as_bytes()).unwrap()
    }

    fn simple_request() -> MessageRequest {
        request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hi"}],
            "system": "you are helpful"
        }))
    }

    #[test]
    fn happy_path_short_ttl() {
        let channel = test_channel(1);
        let bundle = bundle();
        let mut req = simple_request();

        inject(&mut req, &channel, &bundle, &FirstCategory).unwrap();

        let Some(SystemContent::Blocks(blocks)) = &req.system else {
            panic!("system should be blocks");
        };
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].as_text(), Some(bundle.text()));
        let marker = blocks[0].cache_control().expect("global marker");
        assert!(marker.ttl.is_none());
        assert_eq!(blocks[1].as_text(), Some("you are helpful"));
        assert!(blocks[1].cache_control().is_none());
        // Messages untouched.
        assert_eq!(
            req.messages[0].content,
            MessageContent::Text("hi".to_string())
        );
    }

    #[test]
    fn long_ttl_is_spelled_out() {
        let mut channel = test_channel(1);
        channel.cache_ttl = CacheTtl::Long;
        let bundle = bundle();
        let mut req = simple_request();

        inject(&mut req, &channel, &bundle, &FirstCategory).unwrap();

        let Some(SystemContent::Blocks(blocks)) = &req.system else {
            panic!("system should be blocks");
        };
        assert_eq!(
            blocks[0].cache_control().unwrap().ttl,
            Some(WireTtl::OneHour)
        );
    }

    #[test]
    fn category_block_sits_between_padding_and_user_system() {
        let mut channel = test_channel(1);
        channel.category_cache_enabled = true;
        channel.category_prompts = BTreeMap::from([
            ("coding".to_string(), "You write code.".to_string()),
            ("writing".to_string(), "You write prose.".to_string()),
        ]);
        let bundle = bundle();
        let mut req = simple_request();

        inject(&mut req, &channel, &bundle, &FirstCategory).unwrap();

        let Some(SystemContent::Blocks(blocks)) = &req.system else {
            panic!("system should be blocks");
        };
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].as_text(), Some("You write code."));
        assert!(blocks[1].cache_control().is_some());
        assert_eq!(blocks[2].as_text(), Some("you are helpful"));
    }

    #[test]
    fn history_marker_lands_n_turns_back() {
        let mut channel = test_channel(1);
        channel.cache_history_messages = 2;
        let bundle = bundle();
        let mut req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "turn 0"},
                {"role": "assistant", "content": "turn 1"},
                {"role": "user", "content": "turn 2"},
                {"role": "assistant", "content": "turn 3"},
                {"role": "user", "content": "turn 4"}
            ]
        }));

        inject(&mut req, &channel, &bundle, &FirstCategory).unwrap();

        let MessageContent::Blocks(blocks) = &req.messages[2].content else {
            panic!("string content should be wrapped");
        };
        assert!(blocks.last().unwrap().cache_control().is_some());
        // Later turns untouched.
        assert!(matches!(req.messages[3].content, MessageContent::Text(_)));
        assert!(matches!(req.messages[4].content, MessageContent::Text(_)));
    }

    #[test]
    fn no_history_marker_for_short_conversations() {
        let mut channel = test_channel(1);
        channel.cache_history_messages = 2;
        let bundle = bundle();
        let mut req = simple_request();

        inject(&mut req, &channel, &bundle, &FirstCategory).unwrap();
        assert_eq!(req.cache_marker_count(), 1);
    }

    #[test]
    fn marker_budget_drops_history_first() {
        let mut channel = test_channel(1);
        channel.cache_history_messages = 1;
        channel.category_cache_enabled = true;
        channel.category_prompts = BTreeMap::from([("c".to_string(), "prompt".to_string())]);
        let bundle = bundle();
        // Two user markers already present: budget is global + one more.
        let mut req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "a", "cache_control": {"type": "ephemeral"}}
                ]},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "b", "cache_control": {"type": "ephemeral"}}
                ]},
                {"role": "user", "content": "c"}
            ]
        }));

        inject(&mut req, &channel, &bundle, &FirstCategory).unwrap();

        // 2 existing + global + category = 4; history dropped.
        assert_eq!(req.cache_marker_count(), 4);
        assert!(matches!(req.messages[1].content, MessageContent::Blocks(_)));
        let MessageContent::Blocks(blocks) = &req.messages[1].content else {
            unreachable!()
        };
        // The pre-existing marker is the only one on that turn.
        assert_eq!(
            blocks
                .iter()
                .filter(|b| b.cache_control().is_some())
                .count(),
            1
        );
    }

    #[test]
    fn marker_budget_then_drops_category() {
        let mut channel = test_channel(1);
        channel.category_cache_enabled = true;
        channel.category_prompts = BTreeMap::from([("c".to_string(), "prompt".to_string())]);
        let bundle = bundle();
        // Three user markers: only the global marker fits.
        let mut req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "a", "cache_control": {"type": "ephemeral"}},
                    {"type": "text", "text": "b", "cache_control": {"type": "ephemeral"}},
                    {"type": "text", "text": "c", "cache_control": {"type": "ephemeral"}}
                ]}
            ]
        }));

        inject(&mut req, &channel, &bundle, &FirstCategory).unwrap();

        let Some(SystemContent::Blocks(blocks)) = &req.system else {
            panic!("system should be blocks");
        };
        // Bundle only; the category block did not fit.
        assert_eq!(blocks.len(), 1);
        assert_eq!(req.cache_marker_count(), 4);
    }

    #[test]
    fn unreducible_budget_is_an_error() {
        let channel = test_channel(1);
        let bundle = bundle();
        let mut req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "a", "cache_control": {"type": "ephemeral"}},
                    {"type": "text", "text": "b", "cache_control": {"type": "ephemeral"}},
                    {"type": "text", "text": "c", "cache_control": {"type": "ephemeral"}},
                    {"type": "text", "text": "d", "cache_control": {"type": "ephemeral"}}
                ]}
            ]
        }));

        let err = inject(&mut req, &channel, &bundle, &FirstCategory).unwrap_err();
        assert_eq!(err.kind, crate::error::GatewayErrorKind::InjectionFailed);
    }

    #[test]
    fn injection_is_idempotent() {
        let channel = test_channel(1);
        let bundle = bundle();
        let mut req = simple_request();

        inject(&mut req, &channel, &bundle, &FirstCategory).unwrap();
        let once = serde_json::to_value(&req).unwrap();

        inject(&mut req, &channel, &bundle, &FirstCategory).unwrap();
        let twice = serde_json::to_value(&req).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn user_system_blocks_keep_their_markers() {
        let channel = test_channel(1);
        let bundle = bundle();
        let mut req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hi"}],
            "system": [
                {"type": "text", "text": "rules", "cache_control": {"type": "ephemeral"}},
                {"type": "text", "text": "more rules"}
            ]
        }));

        inject(&mut req, &channel, &bundle, &FirstCategory).unwrap();

        let Some(SystemContent::Blocks(blocks)) = &req.system else {
            panic!("system should be blocks");
        };
        assert_eq!(blocks.len(), 3);
        assert!(blocks[1].cache_control().is_some());
        assert!(blocks[2].cache_control().is_none());
        assert_eq!(req.cache_marker_count(), 2);
    }

    #[test]
    fn history_message_blocks_get_marker_on_last_block() {
        let mut channel = test_channel(1);
        channel.cache_history_messages = 1;
        let bundle = bundle();
        let mut req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "q1"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "found"}
                ]},
                {"role": "assistant", "content": "a1"}
            ]
        }));

        inject(&mut req, &channel, &bundle, &FirstCategory).unwrap();

        // index = 4 - 1 - 1 = 2; last block is the tool_result.
        let MessageContent::Blocks(blocks) = &req.messages[2].content else {
            unreachable!()
        };
        assert!(blocks.last().unwrap().cache_control().is_some());
    }
}
