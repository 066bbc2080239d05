//! Streaming "no sources" scenario: `direct_answer_stream` always emits the
//! `chat.completion.sources` event — with `sources:[]` when there is nothing
//! to cite — positioned after the stop frame (spec §4.11 step 6 / §8
//! scenario 6), so frame count no longer distinguishes the two cases.

use chainrag::rag::prompt::SourceItem;
use chainrag::streaming::direct_answer_stream;
use futures::stream::StreamExt;

/// 65 chars: splits into two ~60-char content deltas the way the real
/// framing does for any answer text longer than one chunk.
const ANSWER: &str = "This is a deterministic sixty-five character answer text.........";

#[tokio::test]
async fn no_sources_stream_still_has_a_sources_frame() {
    assert_eq!(ANSWER.chars().count(), 65);

    let stream = direct_answer_stream("chatcmpl-test".to_string(), "onekey-docs".to_string(), 0, ANSWER.to_string(), Vec::new());
    let events: Vec<_> = stream.map(|r| r.unwrap()).collect().await;

    // role-open + 2 content deltas (ceil(65/60)) + stop + sources + [DONE].
    assert_eq!(events.len(), 6);

    let rendered: Vec<String> = events.iter().map(|e| format!("{e:?}")).collect();
    let sources_frame = &rendered[4];
    assert!(sources_frame.contains("chat.completion.sources"));
    assert!(sources_frame.contains("\"sources\":[]"));

    // Stop frame precedes the sources frame, which precedes [DONE].
    assert!(rendered[3].contains("\"finish_reason\":\"stop\""));
    assert!(rendered[5].contains("[DONE]"));
}

#[tokio::test]
async fn stream_with_sources_has_the_same_frame_count_as_without() {
    let without = direct_answer_stream("chatcmpl-a".to_string(), "onekey-docs".to_string(), 0, ANSWER.to_string(), Vec::new()).count().await;

    let sources = vec![SourceItem {
        ref_num: Some(1),
        url: "https://docs.aave.com/pool".to_string(),
        title: "Aave Pool".to_string(),
        section_path: "Deployments".to_string(),
        snippet: "Aave V3 Pool deployment addresses".to_string(),
    }];
    let stream = direct_answer_stream("chatcmpl-b".to_string(), "onekey-docs".to_string(), 0, ANSWER.to_string(), sources);
    let events: Vec<_> = stream.map(|r| r.unwrap()).collect().await;

    assert_eq!(events.len(), without);

    let rendered: Vec<String> = events.iter().map(|e| format!("{e:?}")).collect();
    let sources_frame = &rendered[4];
    assert!(sources_frame.contains("\"ref\":1"));
    assert!(sources_frame.contains("Aave Pool"));
}
