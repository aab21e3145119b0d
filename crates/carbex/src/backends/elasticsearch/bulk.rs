// ai
//! 📡 Bulk wire format — the two-lines-per-document ritual, and reading the verdict.
//!
//! Rule 1: Two lines per document. Action metadata, then document source. Always.
//! Rule 2: Newline-delimited. Not comma-separated. Not XML. NEWLINES.
//! Rule 3: The body ends with a newline. It MATTERS. Three engineers lost
//!          weekends to this. One of them still flinches when they see `\n`.
//!
//! Going out: [`render_bulk_body`] turns `IndexRequest`s into NDJSON.
//! Coming back: [`inspect_bulk_response`] counts which items ES choked on and
//! whether choking again later might go better. 🦆

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::common::IndexRequest;

/// 📎 `{"index":{...}}`. The cover letter for each document.
#[derive(Serialize)]
struct BulkAction<'a> {
    index: ActionMetadata<'a>,
}

#[derive(Serialize)]
struct ActionMetadata<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_id")]
    id: &'a str,
    // 🏚️ only for clusters that still remember mapping types
    #[serde(rename = "_type", skip_serializing_if = "Option::is_none")]
    doc_type: Option<&'a str>,
}

/// 🏗️ Render a batch into a complete `_bulk` body, trailing newline included.
///
/// The `index` action is an upsert by `_id`: an existing document with the same
/// id gets replaced, so re-sending the same batch is harmless.
pub(crate) fn render_bulk_body(
    requests: &[IndexRequest],
    index: &str,
    doc_type: Option<&str>,
) -> Result<Vec<u8>> {
    // ~160 bytes per action+source pair for a typical metric. Close enough.
    let mut body = Vec::with_capacity(requests.len() * 160);
    for request in requests {
        let action = BulkAction {
            index: ActionMetadata {
                index,
                id: &request.document_id,
                doc_type,
            },
        };
        serde_json::to_writer(&mut body, &action).context(
            "💀 Failed to serialize bulk action metadata. The JSON that describes JSON has \
             failed to become JSON.",
        )?;
        body.push(b'\n');
        serde_json::to_writer(&mut body, &request.document()).with_context(|| {
            format!(
                "💀 Failed to serialize the document body for '{}'",
                request.document_id
            )
        })?;
        body.push(b'\n');
    }
    Ok(body)
}

/// ⚖️ What ES thought of each item in a bulk request.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct BulkVerdict {
    /// Throttled (429) or server-side (5xx) failures. Worth another try.
    pub(crate) retryable: usize,
    /// Everything else that failed: bad mappings, bad ids, bad luck.
    pub(crate) rejected: usize,
    /// The first error reason we saw, for the log line.
    pub(crate) first_reason: Option<String>,
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct BulkItemResult {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// 🔍 Read a 2xx `_bulk` response body and sort the failed items into piles.
///
/// `errors: false` short-circuits: nobody failed, nothing to count.
pub(crate) fn inspect_bulk_response(body: &str) -> Result<BulkVerdict> {
    let response: BulkResponse = serde_json::from_str(body).context(
        "💀 Elasticsearch returned a 2xx with a body we can't read as a bulk response. \
         Is something sitting between us and the cluster?",
    )?;

    let mut verdict = BulkVerdict::default();
    if !response.errors {
        return Ok(verdict);
    }

    // -- each item is {"<action>": {...}} with exactly one key, whatever the action was
    for item in response.items {
        let Some(result) = item.into_iter().next().map(|(_, result)| result) else {
            continue;
        };
        let result: BulkItemResult = serde_json::from_value(result)
            .context("💀 A bulk response item had a shape nobody warned us about")?;
        let Some(error) = result.error else {
            continue;
        };

        if result.status == 429 || result.status >= 500 {
            verdict.retryable += 1;
        } else {
            verdict.rejected += 1;
        }
        if verdict.first_reason.is_none() {
            verdict.first_reason = Some(describe_error(&error));
        }
    }
    Ok(verdict)
}

fn describe_error(error: &serde_json::Value) -> String {
    let kind = error["type"].as_str().unwrap_or("unknown_error");
    match error["reason"].as_str() {
        Some(reason) => format!("{kind}: {reason}"),
        None => kind.to_string(),
    }
}
