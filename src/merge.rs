//! folds stream fragments into the accumulated answer.

use crate::model::{AccumulatedCompletion, CompletionFragment, RagContext};

/// returns the completion after applying one fragment. `previous` is left
/// untouched; a fragment with every field absent yields an equal copy.
///
/// - a delta role replaces the role.
/// - delta content is appended.
/// - a context patch unions `data_points` (patch wins on collision) and
///   replaces `followup_questions` / `thoughts` when present.
/// - a session state replaces the previous one.
pub fn merge(previous: &AccumulatedCompletion, fragment: &CompletionFragment) -> AccumulatedCompletion {
    let role = fragment.delta_role().unwrap_or(previous.role);

    let content = match fragment.delta_content() {
        Some(delta) => {
            let mut content = String::with_capacity(previous.content.len() + delta.len());
            content.push_str(&previous.content);
            content.push_str(delta);
            content
        }
        None => previous.content.clone(),
    };

    let context = match &fragment.context {
        Some(patch) => {
            let mut data_points = previous.context.data_points.clone();
            if let Some(patch_points) = &patch.data_points {
                data_points.extend(patch_points.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            RagContext {
                data_points,
                followup_questions: patch
                    .followup_questions
                    .clone()
                    .or_else(|| previous.context.followup_questions.clone()),
                thoughts: patch.thoughts.clone().unwrap_or_else(|| previous.context.thoughts.clone()),
            }
        }
        None => previous.context.clone(),
    };

    let session_state = fragment
        .session_state
        .clone()
        .or_else(|| previous.session_state.clone());

    AccumulatedCompletion { role, content, context, session_state }
}

/// left fold of `merge` starting from an empty assistant completion.
pub fn merge_all<'a>(fragments: impl IntoIterator<Item = &'a CompletionFragment>) -> AccumulatedCompletion {
    fragments
        .into_iter()
        .fold(AccumulatedCompletion::default(), |acc, f| merge(&acc, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContextPatch, DataPoints, DocumentRecord, Role, ThoughtStep};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn points(entries: &[(&str, serde_json::Value)]) -> DataPoints {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), DocumentRecord(v.clone())))
            .collect()
    }

    fn step(title: &str) -> ThoughtStep {
        ThoughtStep { title: title.into(), description: json!(null), props: Default::default() }
    }

    #[test]
    fn content_is_concatenated_in_order() {
        let fragments = [
            CompletionFragment::content("The "),
            CompletionFragment::default(),
            CompletionFragment::content("best "),
            CompletionFragment::content(""),
            CompletionFragment::content("option."),
        ];
        assert_eq!(merge_all(&fragments).content, "The best option.");
    }

    #[test]
    fn data_points_union_with_later_keys_winning() {
        let fragments = [
            CompletionFragment::context(ContextPatch {
                data_points: Some(points(&[("a", json!({"v": 1})), ("b", json!({"v": 1}))])),
                ..Default::default()
            }),
            CompletionFragment::context(ContextPatch {
                data_points: Some(points(&[("b", json!({"v": 2})), ("c", json!({"v": 2}))])),
                ..Default::default()
            }),
            // a patch without data points keeps everything known so far
            CompletionFragment::context(ContextPatch {
                followup_questions: Some(vec!["More?".into()]),
                ..Default::default()
            }),
        ];
        let merged = merge_all(&fragments);
        assert_eq!(
            merged.context.data_points,
            points(&[("a", json!({"v": 1})), ("b", json!({"v": 2})), ("c", json!({"v": 2}))])
        );
        assert_eq!(merged.context.followup_questions, Some(vec!["More?".to_string()]));
    }

    #[test]
    fn thoughts_arrive_as_a_complete_list() {
        let first = merge(
            &AccumulatedCompletion::default(),
            &CompletionFragment::context(ContextPatch {
                thoughts: Some(vec![step("search"), step("rank")]),
                ..Default::default()
            }),
        );
        let second = merge(
            &first,
            &CompletionFragment::context(ContextPatch { thoughts: Some(vec![step("answer")]), ..Default::default() }),
        );
        assert_eq!(second.context.thoughts, vec![step("answer")]);

        let untouched = merge(&second, &CompletionFragment::context(ContextPatch::default()));
        assert_eq!(untouched.context.thoughts, vec![step("answer")]);
    }

    #[test]
    fn role_and_session_state_replace() {
        let prev = AccumulatedCompletion { content: "kept".into(), ..Default::default() };
        let with_role = merge(&prev, &CompletionFragment::role(Role::System));
        assert_eq!(with_role.role, Role::System);
        assert_eq!(with_role.content, "kept");

        let fragment = CompletionFragment { session_state: Some(json!({"s": 1})), ..Default::default() };
        let with_state = merge(&with_role, &fragment);
        assert_eq!(with_state.session_state, Some(json!({"s": 1})));
        assert_eq!(merge(&with_state, &CompletionFragment::default()).session_state, Some(json!({"s": 1})));
    }

    #[test]
    fn empty_fragment_is_a_no_op_and_previous_is_untouched() {
        let prev = AccumulatedCompletion { content: "abc".into(), ..Default::default() };
        let snapshot = prev.clone();
        let next = merge(&prev, &CompletionFragment::default());
        assert_eq!(next, prev);

        let grown = merge(&prev, &CompletionFragment::content("d"));
        assert_eq!(prev, snapshot);
        assert_eq!(grown.content, "abcd");
    }
}
