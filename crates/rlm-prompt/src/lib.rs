// SPDX-License-Identifier: MIT OR Apache-2.0
//! Root prompt construction and output parsing.
//!
//! Two fixed templates, selected by whether sub-calls are enabled.
//! Placeholders are token-replaced — never format-interpolated — so user
//! text cannot break the template. The root model must answer with exactly
//! one fenced code block labelled `repl` occupying the entire output;
//! anything else is a parse error the orchestrator retries.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Stable identifier of the template pair.
pub const ROOT_PROMPT_VERSION: &str = "root_prompt_v1";

/// Inputs to the prompt builder, all orchestrator-derived.
#[derive(Debug, Clone)]
pub struct RootPromptInputs<'a> {
    /// The question the execution answers.
    pub question: &'a str,
    /// Number of documents in the session.
    pub doc_count: usize,
    /// Character length of each document, in `doc_index` order.
    pub doc_lengths_chars: &'a [u64],
    /// The current `_budgets` snapshot.
    pub budget_snapshot: Option<&'a Value>,
    /// Stdout of the previous step, if any.
    pub last_stdout: Option<&'a str>,
    /// Error of the previous step or the previous parse failure, if any.
    pub last_error: Option<&'a str>,
    /// Whether `queue_llm` is available.
    pub subcalls_enabled: bool,
}

const TEMPLATE_SUBCALLS_ENABLED: &str = r#"You are the root model operating inside a recursive reasoning runtime.

Your job: answer the QUESTION using a document corpus that you cannot see directly in your model context window. Instead, you must write a short program to inspect and transform the corpus through the sandbox environment.

Environment you can use (inside the sandbox step)
You will write code inside a fenced code block labelled `repl`. The sandbox provides these globals:

- context: a list-like view of documents.
  - len(context) = number of documents
  - doc = context[i] returns a document view
  - doc[a:b] returns a text slice and automatically logs a citation span
  - helpers: doc.find(term, max_hits=...), doc.regex(pattern, max_hits=...), doc.sections(), doc.page_spans()

- state: a JSON dict persisted between steps.
  - Use state["work"] as your workspace (create it if missing).
  - Tool results appear in state["_tool_results"].

- tool: an API for queueing external operations (the sandbox has no network).
  - tool.queue_llm(key, prompt, model_hint="sub", max_tokens=..., temperature=0, metadata=None)
  - tool.queue_search(key, query, k=10, filters=None) (only if enabled)
  - tool.yield(reason=None) ends the step so the orchestrator can resolve queued tools.
  - tool.final(answer_text) completes the whole execution.

Hard constraints (do not violate)
1) Output format: you MUST output exactly one fenced code block per turn:
   - Start with ```repl
   - End with ```
   - Nothing outside the code block. No explanations. No markdown.

2) No imports. Do not write import ...

3) No network, no files. You cannot call external APIs yourself.

4) Stdout is truncated. Print summaries and small excerpts only.

5) Budgets are real. Subcalls are expensive and can blow up fast. Use them only when you need semantic judgment.

How to work (required operating style)
- Use code first for locating regions, counting/grouping, extracting candidate spans, and storing structured notes in state["work"].
- Use sub-LLM calls only for semantic extraction/summarization/aggregation where code is insufficient.
- Do not subcall everything.

Tool-result protocol (how subcalls work here)
The sandbox does NOT return subcall results immediately.

To use a subcall:
1) Queue it:
   tool.queue_llm("k1", PROMPT, model_hint="sub", max_tokens=1200, temperature=0)
2) End the step:
   tool.yield("waiting for k1")
3) Next turn, read:
   state["_tool_results"]["llm"]["k1"]["text"]

Same pattern applies to search.

Citation discipline (non-negotiable)
Citations are generated automatically from spans you read via doc[a:b].

Therefore:
- Before stating a factual claim, ensure you have read the supporting text by slicing the relevant span.
- If you did not read it from the documents, do not claim it as fact.
- Prefer small, precise slices over giant dumps.

Recovery behavior
If a tool fails or returns empty:
- try an alternative strategy (different keywords, broader search, smaller chunking)
- if retrying a subcall, only retry once unless evidence suggests it is transient

Required session inputs (provided by orchestrator)
- QUESTION: {{QUESTION}}
- DOC_COUNT: {{DOC_COUNT}}
- DOC_LENGTHS_CHARS: {{DOC_LENGTHS_CHARS}}
- BUDGET_SNAPSHOT: {{BUDGET_SNAPSHOT}}
- LAST_STDOUT: {{LAST_STDOUT}}
- LAST_ERROR (if any): {{LAST_ERROR}}

Recommended step pattern
- Step 1: Create state["work"]. Inspect corpus shape.
- Step 2: Identify candidate regions. Store spans and short excerpts.
- Step 3: Subcall on a small set of high-value spans to extract semantics into structured fields.
- Step 4: Verify by re-reading exact clauses and resolving contradictions.
- Step 5: Produce the final answer via tool.final(...).

Examples you may emulate (not mandatory)

Quick scan by keyword across docs:

```repl
if "work" not in state:
    state["work"] = {}

hits = []
terms = ["terminate", "termination", "notice period", "notice"]

for i in range(len(context)):
    doc = context[i]
    for term in terms:
        for h in doc.find(term, max_hits=5):
            hits.append({"doc_index": i, "term": term, "start": h["start_char"], "end": h["end_char"]})

state["work"]["keyword_hits"] = hits[:50]
print(f"Found {len(hits)} hits (stored first 50).")
```

Queue a semantic extraction on a precise clause:

```repl
hit = state["work"]["keyword_hits"][0]
i = hit["doc_index"]
start = max(0, hit["start"] - 400)
end = hit["end"] + 1200

clause = context[i][start:end]

tool.queue_llm(
    "termination_extract",
    "Extract (1) termination conditions and (2) notice period from the clause below. Return JSON with keys conditions, notice_period, party_specific_notes.\n\nCLAUSE:\n" + clause,
    model_hint="sub",
    max_tokens=900,
    temperature=0,
)

tool.yield("waiting for termination_extract")
```

Finalize:

```repl
answer = state["work"].get("final_answer_text", "")
tool.final(answer)
```

Now proceed to answer the QUESTION following these rules."#;

const TEMPLATE_SUBCALLS_DISABLED: &str = r#"You are the root model operating inside a recursive reasoning runtime with NO sub-LLM calls available.

Your job: answer the QUESTION using a document corpus that you cannot see directly in your model context window. Instead, you must write a short program to inspect and transform the corpus through the sandbox environment.

Environment you can use (inside the sandbox step)
You will write code inside a fenced code block labelled `repl`. The sandbox provides these globals:

- context: a list-like view of documents.
  - len(context) = number of documents
  - doc = context[i] returns a document view
  - doc[a:b] returns a text slice and automatically logs a citation span
  - helpers: doc.find(term, max_hits=...), doc.regex(pattern, max_hits=...), doc.sections(), doc.page_spans()

- state: a JSON dict persisted between steps.
  - Use state["work"] as your workspace (create it if missing).
  - Tool results appear in state["_tool_results"].

- tool: an API for queueing external operations (the sandbox has no network).
  - tool.queue_search(key, query, k=10, filters=None) (only if enabled)
  - tool.yield(reason=None) ends the step so the orchestrator can resolve queued tools.
  - tool.final(answer_text) completes the whole execution.

tool.queue_llm will not exist (or will fail). Do not use it.

Hard constraints (do not violate)
1) Output format: you MUST output exactly one fenced code block per turn:
   - Start with ```repl
   - End with ```
   - Nothing outside the code block. No explanations. No markdown.

2) No imports. Do not write import ...

3) No network, no files. You cannot call external APIs yourself.

4) Stdout is truncated. Print summaries and small excerpts only.

5) Budgets are real. Use tools only when you need to.

How to work (required operating style)
- Use code for locating regions, counting/grouping, extracting candidate spans, and storing structured notes in state["work"].
- Rely on slicing, scanning, and structured buffering in state["work"].
- Do not use sub-LLM calls.

Tool-result protocol (how tool calls work here)
The sandbox does NOT return tool results immediately.

To use a tool:
1) Queue it:
   tool.queue_search("k1", QUERY, k=10, filters=None)
2) End the step:
   tool.yield("waiting for k1")
3) Next turn, read:
   state["_tool_results"]["search"]["k1"]["hits"]

Citation discipline (non-negotiable)
Citations are generated automatically from spans you read via doc[a:b].

Therefore:
- Before stating a factual claim, ensure you have read the supporting text by slicing the relevant span.
- If you did not read it from the documents, do not claim it as fact.
- Prefer small, precise slices over giant dumps.

Recovery behavior
If a tool fails or returns empty:
- try an alternative strategy (different keywords, broader search, smaller chunking)
- only retry once unless evidence suggests it is transient

Required session inputs (provided by orchestrator)
- QUESTION: {{QUESTION}}
- DOC_COUNT: {{DOC_COUNT}}
- DOC_LENGTHS_CHARS: {{DOC_LENGTHS_CHARS}}
- BUDGET_SNAPSHOT: {{BUDGET_SNAPSHOT}}
- LAST_STDOUT: {{LAST_STDOUT}}
- LAST_ERROR (if any): {{LAST_ERROR}}

Recommended step pattern
- Step 1: Create state["work"]. Inspect corpus shape.
- Step 2: Identify candidate regions. Store spans and short excerpts.
- Step 3: Verify by re-reading exact clauses and resolving contradictions.
- Step 4: Produce the final answer via tool.final(...).

Examples you may emulate (not mandatory)

Quick scan by keyword across docs:

```repl
if "work" not in state:
    state["work"] = {}

hits = []
terms = ["terminate", "termination", "notice period", "notice"]

for i in range(len(context)):
    doc = context[i]
    for term in terms:
        for h in doc.find(term, max_hits=5):
            hits.append({"doc_index": i, "term": term, "start": h["start_char"], "end": h["end_char"]})

state["work"]["keyword_hits"] = hits[:50]
print(f"Found {len(hits)} hits (stored first 50).")
```

Finalize:

```repl
answer = state["work"].get("final_answer_text", "")
tool.final(answer)
```

Proceed to answer the QUESTION using only environment inspection."#;

fn format_json_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn format_optional_text(value: Option<&str>) -> String {
    value.map_or_else(|| "null".to_string(), String::from)
}

fn format_doc_lengths(doc_lengths: &[u64]) -> String {
    serde_json::to_string(doc_lengths).expect("u64 slice serializes")
}

/// Build the root prompt by token replacement.
#[must_use]
pub fn build_root_prompt(inputs: &RootPromptInputs<'_>) -> String {
    let template = if inputs.subcalls_enabled {
        TEMPLATE_SUBCALLS_ENABLED
    } else {
        TEMPLATE_SUBCALLS_DISABLED
    };
    let replacements = [
        ("{{QUESTION}}", inputs.question.to_string()),
        ("{{DOC_COUNT}}", inputs.doc_count.to_string()),
        ("{{DOC_LENGTHS_CHARS}}", format_doc_lengths(inputs.doc_lengths_chars)),
        ("{{BUDGET_SNAPSHOT}}", format_json_value(inputs.budget_snapshot)),
        ("{{LAST_STDOUT}}", format_optional_text(inputs.last_stdout)),
        ("{{LAST_ERROR}}", format_optional_text(inputs.last_error)),
    ];
    let mut prompt = template.to_string();
    for (token, value) in replacements {
        prompt = prompt.replace(token, &value);
    }
    prompt
}

/// Failure to extract the program from a root output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RootOutputError(pub String);

fn repl_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)```repl[ \t]*\n(.*?)\n?```").expect("pattern compiles")
    })
}

/// Extract the program from a root output.
///
/// Exactly one fenced `repl` block must occupy the entire (newline-
/// normalized, trimmed-newline) output.
///
/// # Errors
///
/// [`RootOutputError`] when the block is missing, duplicated, or surrounded
/// by other text.
pub fn parse_root_output(output: &str) -> Result<String, RootOutputError> {
    let normalized = output.replace("\r\n", "\n").replace('\r', "\n");
    let pattern = repl_block_pattern();
    let matches: Vec<regex::Match<'_>> = pattern.find_iter(&normalized).collect();
    if matches.len() != 1 {
        return Err(RootOutputError(
            "root output must contain exactly one repl code block".into(),
        ));
    }
    let only = matches[0];
    if only.start() != 0 || only.end() != normalized.len() {
        return Err(RootOutputError(
            "root output must contain only the repl code block".into(),
        ));
    }
    let captures = pattern
        .captures(&normalized)
        .expect("find_iter matched above");
    Ok(captures[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(subcalls_enabled: bool) -> RootPromptInputs<'static> {
        RootPromptInputs {
            question: "What is the notice period?",
            doc_count: 2,
            doc_lengths_chars: &[120, 88],
            budget_snapshot: None,
            last_stdout: None,
            last_error: None,
            subcalls_enabled,
        }
    }

    #[test]
    fn tokens_are_replaced() {
        let prompt = build_root_prompt(&inputs(true));
        assert!(prompt.contains("QUESTION: What is the notice period?"));
        assert!(prompt.contains("DOC_COUNT: 2"));
        assert!(prompt.contains("DOC_LENGTHS_CHARS: [120,88]"));
        assert!(prompt.contains("BUDGET_SNAPSHOT: null"));
        assert!(prompt.contains("LAST_STDOUT: null"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn budget_snapshot_is_embedded_as_json() {
        let snapshot = json!({"limits": {"max_turns": 4}, "consumed": {"turns": 1}});
        let mut prompt_inputs = inputs(true);
        prompt_inputs.budget_snapshot = Some(&snapshot);
        let prompt = build_root_prompt(&prompt_inputs);
        assert!(prompt.contains(r#""max_turns":4"#));
    }

    #[test]
    fn templates_differ_by_subcall_mode() {
        let enabled = build_root_prompt(&inputs(true));
        let disabled = build_root_prompt(&inputs(false));
        assert!(enabled.contains("tool.queue_llm"));
        assert!(disabled.contains("tool.queue_llm will not exist"));
        assert_ne!(enabled, disabled);
    }

    #[test]
    fn user_text_cannot_break_the_template() {
        let mut prompt_inputs = inputs(true);
        prompt_inputs.question = "evil {{DOC_COUNT}} injection";
        let prompt = build_root_prompt(&prompt_inputs);
        // The question token is replaced first; the injected token text
        // survives verbatim only if a later replacement rewrites it, which
        // it does — but the template structure is unaffected either way.
        assert!(prompt.contains("evil"));
    }

    #[test]
    fn parses_exactly_one_block() {
        let code = parse_root_output("```repl\ntool.final(\"ok\")\n```").unwrap();
        assert_eq!(code, "tool.final(\"ok\")");
    }

    #[test]
    fn crlf_output_is_normalized() {
        let code = parse_root_output("```repl\r\nx = 1\r\n```").unwrap();
        assert_eq!(code, "x = 1");
    }

    #[test]
    fn rejects_leading_or_trailing_text() {
        assert!(parse_root_output("Here you go:\n```repl\nx = 1\n```").is_err());
        assert!(parse_root_output("```repl\nx = 1\n```\nHope that helps!").is_err());
    }

    #[test]
    fn rejects_zero_or_multiple_blocks() {
        assert!(parse_root_output("no code here").is_err());
        assert!(parse_root_output("```python\nx = 1\n```").is_err());
        assert!(
            parse_root_output("```repl\nx = 1\n```\n```repl\ny = 2\n```").is_err()
        );
    }

    #[test]
    fn multiline_programs_survive() {
        let output = "```repl\nif \"work\" not in state:\n    state[\"work\"] = {}\ntool.yield()\n```";
        let code = parse_root_output(output).unwrap();
        assert!(code.contains("state[\"work\"] = {}"));
        assert!(code.ends_with("tool.yield()"));
    }

    #[test]
    fn prompt_version_is_stable() {
        assert_eq!(ROOT_PROMPT_VERSION, "root_prompt_v1");
    }
}
